use time::{OffsetDateTime, UtcOffset};

pub mod assignment;
pub mod config;
pub mod evidence;
pub mod machine;
pub mod model;
pub mod notification;
pub mod roles;

pub use assignment::{
    apply_assignment, assign_crew, authorize_crew_assignment, require_assigned_crew,
    validate_assignment_invariant, CrewTarget,
};
pub use config::LifecycleConfig;
pub use evidence::{
    authorize_evidence, build_evidence, has_sufficient_evidence, require_sufficient_evidence,
};
pub use machine::{
    apply_transition, is_legal_edge, TransitionContext, TransitionFields, TransitionOutcome,
    TransitionRequest, LEGAL_EDGES,
};
pub use model::{
    format_from_file_name, Crew, CrewId, Department, DepartmentId, Evidence, EvidenceId,
    EvidenceInput, GeoPoint, Incident, IncidentId, IncidentPatch, IncidentStatus, IncidentType,
    IncidentTypeId, MediaKind, NewIncident, PrincipalId, Priority, ReporterContact, StatusEdge,
    SurveyId,
};
pub use notification::NotificationIntent;
pub use roles::{can_view, capabilities, Actor, Capabilities, IncidentContext, RoleGroup};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LifecycleError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("missing assignment: {0}")]
    MissingAssignment(String),
    #[error("assignment locked while incident is {status}")]
    AssignmentLocked { status: IncidentStatus },
    #[error(
        "department mismatch: crew belongs to {crew_department}, incident belongs to {incident_department}"
    )]
    DepartmentMismatch {
        crew_department: DepartmentId,
        incident_department: DepartmentId,
    },
    #[error("missing evidence: incident {incident_id} has no evidence attached")]
    MissingEvidence { incident_id: IncidentId },
    #[error("missing rejection reason")]
    MissingRejectionReason,
    #[error("stale state: expected version {expected}, found {found}")]
    StaleState { expected: u64, found: u64 },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LifecycleError {
    /// Stable machine-readable code carried in error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Unauthorized(_) => "unauthorized",
            Self::MissingAssignment(_) => "missing_assignment",
            Self::AssignmentLocked { .. } => "assignment_locked",
            Self::DepartmentMismatch { .. } => "department_mismatch",
            Self::MissingEvidence { .. } => "missing_evidence",
            Self::MissingRejectionReason => "missing_rejection_reason",
            Self::StaleState { .. } => "stale_state",
            Self::InvalidState(_) => "invalid_state",
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Parses an RFC3339 timestamp and requires the UTC `Z` offset.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] when the value is malformed or not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LifecycleError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LifecycleError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LifecycleError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] if formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LifecycleError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LifecycleError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
