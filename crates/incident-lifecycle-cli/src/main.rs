use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = incident_lifecycle_cli::Cli::parse();
    incident_lifecycle_cli::init_tracing(cli.log_level());
    match incident_lifecycle_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", incident_lifecycle_cli::error_envelope(&err));
            ExitCode::FAILURE
        }
    }
}
