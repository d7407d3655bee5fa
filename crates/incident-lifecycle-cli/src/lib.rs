//! Embeddable `incidents` command surface.
//!
//! Hosts embed the engine through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteIncidentStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use incident_lifecycle_core::{
    can_view, format_from_file_name, Actor, Crew, CrewId, Department, DepartmentId, EvidenceInput,
    GeoPoint, Incident, IncidentId, IncidentPatch, IncidentStatus, IncidentType, IncidentTypeId,
    LifecycleConfig, LifecycleError, MediaKind, NewIncident, PrincipalId, Priority,
    ReporterContact, SurveyId, TransitionFields, TransitionRequest,
};
use incident_lifecycle_notify::{dispatch_best_effort, LogNotifier, Notifier, OutboxNotifier};
use incident_lifecycle_store_sqlite::{
    lifecycle_error, IncidentFilter, IntegrityIssueSeverity, IntegrityReport, SqliteIncidentStore,
    TransitionReceipt,
};
use serde_json::{json, Value};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "incidents")]
#[command(about = "Municipal incident lifecycle CLI")]
pub struct Cli {
    #[arg(long, default_value = "./incidents.sqlite3")]
    db: PathBuf,

    /// Append notifications as JSON lines to this file instead of logging them.
    #[arg(long)]
    outbox: Option<PathBuf>,

    /// Log filter directive (overrides `RUST_LOG`), e.g. `info` or `debug`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Incident {
        #[command(subcommand)]
        command: Box<IncidentCommand>,
    },
    Evidence {
        #[command(subcommand)]
        command: Box<EvidenceCommand>,
    },
    Org {
        #[command(subcommand)]
        command: Box<OrgCommand>,
    },
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
    /// Scan stored incidents for broken record invariants.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct ActorArgs {
    /// Acting principal id.
    #[arg(long)]
    actor: String,
    /// Role group; canonical or legacy name. Repeatable.
    #[arg(long = "role")]
    roles: Vec<String>,
    #[arg(long)]
    superuser: bool,
}

impl ActorArgs {
    fn to_actor(&self) -> Result<Actor> {
        Ok(Actor::from_raw(&self.actor, &self.roles, self.superuser)?)
    }
}

#[derive(Debug, Subcommand)]
pub enum IncidentCommand {
    Create(CreateArgs),
    Show(ShowArgs),
    List(ListArgs),
    Transition(TransitionArgs),
    Assign(AssignArgs),
    History(HistoryArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: String,
    #[arg(long, allow_hyphen_values = true)]
    latitude: f64,
    #[arg(long, allow_hyphen_values = true)]
    longitude: f64,
    #[arg(long)]
    reporter_name: String,
    #[arg(long)]
    reporter_email: String,
    #[arg(long, default_value = "")]
    reporter_phone: String,
    #[arg(long)]
    priority: Option<PriorityArg>,
    #[arg(long)]
    department_id: Option<String>,
    #[arg(long)]
    type_id: Option<String>,
    #[arg(long)]
    survey_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    actor: ActorArgs,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long)]
    department_id: Option<String>,
    #[arg(long)]
    type_id: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct TransitionArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    to: StatusArg,
    #[command(flatten)]
    actor: ActorArgs,
    /// Version the caller last loaded; a moved incident fails with `stale_state`.
    #[arg(long)]
    expected_version: u64,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long)]
    crew_id: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    priority: Option<PriorityArg>,
}

#[derive(Debug, Args)]
pub struct AssignArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    crew_id: String,
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    expected_version: Option<u64>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    actor: ActorArgs,
}

#[derive(Debug, Subcommand)]
pub enum EvidenceCommand {
    Attach(AttachArgs),
    List(EvidenceListArgs),
}

#[derive(Debug, Args)]
pub struct AttachArgs {
    #[arg(long)]
    incident_id: String,
    #[command(flatten)]
    actor: ActorArgs,
    /// Original file name; its extension becomes the evidence format.
    #[arg(long)]
    file_name: String,
    /// MIME type reported by the upload; its top-level type picks the media kind.
    #[arg(long)]
    content_type: String,
    #[arg(long)]
    size_bytes: u64,
    #[arg(long)]
    storage_ref: String,
    #[arg(long)]
    survey_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct EvidenceListArgs {
    #[arg(long)]
    incident_id: String,
    #[command(flatten)]
    actor: ActorArgs,
}

#[derive(Debug, Subcommand)]
pub enum OrgCommand {
    Department {
        #[command(subcommand)]
        command: Box<DepartmentCommand>,
    },
    Crew {
        #[command(subcommand)]
        command: Box<CrewCommand>,
    },
    Type {
        #[command(subcommand)]
        command: Box<TypeCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DepartmentCommand {
    Add(DepartmentAddArgs),
    List,
}

#[derive(Debug, Args)]
pub struct DepartmentAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    responsible: Option<String>,
    #[arg(long)]
    contact_email: Option<String>,
    #[arg(long)]
    inactive: bool,
}

#[derive(Debug, Subcommand)]
pub enum CrewCommand {
    Add(CrewAddArgs),
    List(CrewListArgs),
}

#[derive(Debug, Args)]
pub struct CrewAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    department_id: String,
    #[arg(long)]
    member: String,
    #[arg(long)]
    lead: Option<String>,
}

#[derive(Debug, Args)]
pub struct CrewListArgs {
    #[arg(long)]
    department_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TypeCommand {
    Add(TypeAddArgs),
    List,
}

#[derive(Debug, Args)]
pub struct TypeAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    severity: PriorityArg,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    /// JSON document with the full config.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    #[value(name = "in_progress")]
    InProgress,
    Completed,
    Validated,
    Rejected,
}

impl From<StatusArg> for IncidentStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => Self::Pending,
            StatusArg::InProgress => Self::InProgress,
            StatusArg::Completed => Self::Completed,
            StatusArg::Validated => Self::Validated,
            StatusArg::Rejected => Self::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    High,
    Medium,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::High => Self::High,
            PriorityArg::Medium => Self::Medium,
            PriorityArg::Low => Self::Low,
        }
    }
}

/// Installs the stderr log subscriber. `level` wins over `RUST_LOG`; the
/// default is `warn`.
pub fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Machine-readable error shape written to stderr on failure.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> Value {
    let code = lifecycle_error(err).map_or("internal", LifecycleError::code);
    json!({
        "code": code,
        "message": format!("{err:#}"),
    })
}

/// Executes a fully parsed CLI invocation.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.outbox.as_deref(), cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &Path, outbox: Option<&Path>, command: Command) -> Result<()> {
    let mut store = SqliteIncidentStore::open(db_path)?;
    store.migrate()?;
    match outbox {
        Some(path) => run_command(command, &mut store, &OutboxNotifier::new(path)),
        None => run_command(command, &mut store, &LogNotifier),
    }
}

/// Executes a parsed command against an existing store handle. Notifications
/// for committed transitions go to `notifier` after commit.
///
/// # Errors
/// Returns an error when argument parsing, validation, or persistence fails.
/// Notification failures are logged, never returned.
pub fn run_command(
    command: Command,
    store: &mut SqliteIncidentStore,
    notifier: &dyn Notifier,
) -> Result<()> {
    match command {
        Command::Incident { command } => run_incident(*command, store, notifier),
        Command::Evidence { command } => run_evidence(*command, store),
        Command::Org { command } => run_org(*command, store),
        Command::Config { command } => match *command {
            ConfigCommand::Show => print_json(&store.get_config()?),
            ConfigCommand::Set(args) => {
                let body = std::fs::read_to_string(&args.file)
                    .with_context(|| format!("failed to read {}", args.file.display()))?;
                let value: Value =
                    serde_json::from_str(&body).context("config file is not valid JSON")?;
                let config = LifecycleConfig::from_json(&value)?;
                store.upsert_config(&config)?;
                print_json(&config)
            }
        },
        Command::Check(args) => {
            let report = store.integrity_check()?;
            if args.json {
                print_json(&report)?;
            } else {
                print_integrity_report(&report);
            }
            if report.healthy {
                Ok(())
            } else {
                Err(anyhow!(
                    "integrity check found {} error issue(s)",
                    report
                        .issues
                        .iter()
                        .filter(|issue| issue.severity == IntegrityIssueSeverity::Error)
                        .count()
                ))
            }
        }
    }
}

fn run_incident(
    command: IncidentCommand,
    store: &mut SqliteIncidentStore,
    notifier: &dyn Notifier,
) -> Result<()> {
    match command {
        IncidentCommand::Create(args) => {
            let input = NewIncident {
                title: args.title,
                description: args.description,
                priority: args.priority.map(Priority::from),
                location: GeoPoint {
                    latitude: args.latitude,
                    longitude: args.longitude,
                },
                reporter: ReporterContact {
                    name: args.reporter_name,
                    email: args.reporter_email,
                    phone: args.reporter_phone,
                },
                department_id: parse_optional(args.department_id.as_deref(), DepartmentId::parse)?,
                incident_type_id: parse_optional(args.type_id.as_deref(), IncidentTypeId::parse)?,
                survey_id: parse_optional(args.survey_id.as_deref(), SurveyId::parse)?,
            };
            print_json(&store.create_incident(input)?)
        }
        IncidentCommand::Show(args) => {
            let actor = args.actor.to_actor()?;
            let incident = load_visible_incident(store, &actor, IncidentId::parse(&args.id)?)?;
            print_json(&incident)
        }
        IncidentCommand::List(args) => {
            let actor = args.actor.to_actor()?;
            let filter = IncidentFilter {
                title: args.title,
                status: args.status.map(IncidentStatus::from),
                department_id: parse_optional(args.department_id.as_deref(), DepartmentId::parse)?,
                incident_type_id: parse_optional(args.type_id.as_deref(), IncidentTypeId::parse)?,
                limit: args.limit,
            };
            print_json(&store.list_incidents(&actor, &filter)?)
        }
        IncidentCommand::Transition(args) => {
            let actor = args.actor.to_actor()?;
            let request = TransitionRequest {
                to: args.to.into(),
                fields: TransitionFields {
                    rejection_reason: args.reason,
                    crew_id: parse_optional(args.crew_id.as_deref(), CrewId::parse)?,
                    patch: IncidentPatch {
                        title: args.title,
                        description: args.description,
                        priority: args.priority.map(Priority::from),
                    },
                },
            };
            let receipt = store.apply_transition(
                IncidentId::parse(&args.id)?,
                &actor,
                args.expected_version,
                &request,
            )?;
            let delivered = notify_after_commit(store, notifier, &receipt);
            let mut payload = serde_json::to_value(&receipt)?;
            payload["notification_delivered"] = json!(delivered);
            print_json(&payload)
        }
        IncidentCommand::Assign(args) => {
            let actor = args.actor.to_actor()?;
            let incident = store.assign_crew(
                IncidentId::parse(&args.id)?,
                CrewId::parse(&args.crew_id)?,
                &actor,
                args.expected_version,
            )?;
            print_json(&incident)
        }
        IncidentCommand::History(args) => {
            let actor = args.actor.to_actor()?;
            let id = load_visible_incident(store, &actor, IncidentId::parse(&args.id)?)?.id;
            print_json(&json!({
                "incident_id": id,
                "transitions": store.list_transitions(id)?,
                "dispatches": store.list_dispatches(id)?,
            }))
        }
    }
}

fn run_evidence(command: EvidenceCommand, store: &mut SqliteIncidentStore) -> Result<()> {
    match command {
        EvidenceCommand::Attach(args) => {
            let actor = args.actor.to_actor()?;
            let input = EvidenceInput {
                kind: MediaKind::from_content_type(&args.content_type),
                format: format_from_file_name(&args.file_name),
                name: args.file_name,
                size_bytes: args.size_bytes,
                storage_ref: args.storage_ref,
                survey_id: parse_optional(args.survey_id.as_deref(), SurveyId::parse)?,
            };
            let evidence =
                store.attach_evidence(IncidentId::parse(&args.incident_id)?, &actor, input)?;
            print_json(&evidence)
        }
        EvidenceCommand::List(args) => {
            let actor = args.actor.to_actor()?;
            let id =
                load_visible_incident(store, &actor, IncidentId::parse(&args.incident_id)?)?.id;
            print_json(&store.list_evidence(id)?)
        }
    }
}

fn run_org(command: OrgCommand, store: &mut SqliteIncidentStore) -> Result<()> {
    match command {
        OrgCommand::Department { command } => match *command {
            DepartmentCommand::Add(args) => {
                let department = Department {
                    id: DepartmentId::new(),
                    name: args.name,
                    responsible: args.responsible.map(PrincipalId::new).transpose()?,
                    contact_email: args.contact_email,
                    active: !args.inactive,
                };
                store.insert_department(&department)?;
                print_json(&department)
            }
            DepartmentCommand::List => print_json(&store.list_departments()?),
        },
        OrgCommand::Crew { command } => match *command {
            CrewCommand::Add(args) => {
                let crew = Crew {
                    id: CrewId::new(),
                    name: args.name,
                    department_id: DepartmentId::parse(&args.department_id)?,
                    lead: args.lead.map(PrincipalId::new).transpose()?,
                    member: PrincipalId::new(args.member)?,
                };
                store.insert_crew(&crew)?;
                print_json(&crew)
            }
            CrewCommand::List(args) => print_json(&store.list_crews(parse_optional(
                args.department_id.as_deref(),
                DepartmentId::parse,
            )?)?),
        },
        OrgCommand::Type { command } => match *command {
            TypeCommand::Add(args) => {
                let incident_type = IncidentType {
                    id: IncidentTypeId::new(),
                    name: args.name,
                    description: args.description,
                    severity: args.severity.into(),
                };
                store.insert_incident_type(&incident_type)?;
                print_json(&incident_type)
            }
            TypeCommand::List => print_json(&store.list_incident_types()?),
        },
    }
}

/// Loads an incident, failing with `unauthorized` when `actor` may not see it.
fn load_visible_incident(
    store: &SqliteIncidentStore,
    actor: &Actor,
    id: IncidentId,
) -> Result<Incident> {
    let incident = store
        .get_incident(id)?
        .ok_or_else(|| LifecycleError::Validation(format!("incident {id} not found")))?;
    let crew = match incident.crew_id {
        Some(crew_id) => store.get_crew(crew_id)?,
        None => None,
    };
    if !can_view(actor, &incident, crew.as_ref()) {
        return Err(LifecycleError::Unauthorized(format!(
            "{} may not view incident {id}",
            actor.principal_id
        ))
        .into());
    }
    Ok(incident)
}

/// Best-effort delivery once the transition is committed.
fn notify_after_commit(
    store: &SqliteIncidentStore,
    notifier: &dyn Notifier,
    receipt: &TransitionReceipt,
) -> bool {
    let Some(intent) = &receipt.notification else {
        return false;
    };
    let config = match store.get_config() {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "falling back to default lifecycle config");
            LifecycleConfig::v1()
        }
    };
    dispatch_best_effort(notifier, intent, &config)
}

fn parse_optional<T>(
    raw: Option<&str>,
    parse: fn(&str) -> Result<T, LifecycleError>,
) -> Result<Option<T>> {
    Ok(raw.map(parse).transpose()?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_integrity_report(report: &IntegrityReport) {
    println!("contract={}", report.contract_version);
    println!("healthy={}", if report.healthy { "yes" } else { "no" });
    println!("incidents_checked={}", report.incidents_checked);
    for issue in &report.issues {
        let severity = match issue.severity {
            IntegrityIssueSeverity::Warning => "warning",
            IntegrityIssueSeverity::Error => "error",
        };
        let incident = issue
            .incident_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        println!(
            "issue code={} severity={severity} incident={incident} message={}",
            issue.code, issue.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_arg_uses_snake_case_names() {
        let parsed = match StatusArg::from_str("in_progress", false) {
            Ok(value) => value,
            Err(err) => panic!("expected in_progress to parse: {err}"),
        };
        assert_eq!(IncidentStatus::from(parsed), IncidentStatus::InProgress);
        assert!(StatusArg::from_str("finalizada", false).is_err());
    }

    #[test]
    fn transition_requires_expected_version() {
        let parsed = Cli::try_parse_from([
            "incidents",
            "incident",
            "transition",
            "--id",
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "--to",
            "completed",
            "--actor",
            "crew-north",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn error_envelope_carries_domain_code() {
        let err: anyhow::Error = LifecycleError::MissingRejectionReason.into();
        let envelope = error_envelope(&err.context("transition failed"));
        assert_eq!(envelope["code"], "missing_rejection_reason");
        assert!(envelope["message"]
            .as_str()
            .is_some_and(|message| message.contains("missing rejection reason")));

        let plain = error_envelope(&anyhow!("disk full"));
        assert_eq!(plain["code"], "internal");
    }

    #[test]
    fn parse_optional_rejects_malformed_ids() {
        assert!(matches!(
            parse_optional(Some("not-a-ulid"), CrewId::parse),
            Err(_)
        ));
        assert!(matches!(parse_optional(None, CrewId::parse), Ok(None)));
    }

    #[test]
    fn cli_parses_transition_with_repeated_roles() {
        let cli = match Cli::try_parse_from([
            "incidents",
            "--db",
            "/tmp/x.sqlite3",
            "incident",
            "transition",
            "--id",
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "--to",
            "rejected",
            "--actor",
            "terr",
            "--role",
            "Territorial",
            "--role",
            "direction",
            "--reason",
            "incomplete",
            "--expected-version",
            "3",
        ]) {
            Ok(value) => value,
            Err(err) => panic!("parse failed: {err}"),
        };
        assert!(cli.log_level().is_none());
        let Command::Incident { command } = cli.command else {
            panic!("expected incident command");
        };
        let IncidentCommand::Transition(args) = *command else {
            panic!("expected transition command");
        };
        let actor = match args.actor.to_actor() {
            Ok(value) => value,
            Err(err) => panic!("actor: {err}"),
        };
        assert_eq!(actor.groups.len(), 2);
        assert_eq!(args.reason.as_deref(), Some("incomplete"));
        assert_eq!(args.expected_version, 3);
    }
}
