use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::LifecycleError;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses a ULID string into a typed identifier.
            ///
            /// # Errors
            /// Returns [`LifecycleError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, LifecycleError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    LifecycleError::Validation(format!(concat!("invalid ", $label, " ULID {}: {}"), raw, err))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(IncidentId, "incident_id");
ulid_id!(DepartmentId, "department_id");
ulid_id!(CrewId, "crew_id");
ulid_id!(EvidenceId, "evidence_id");
ulid_id!(IncidentTypeId, "incident_type_id");
ulid_id!(
    /// Survey template reference. Survey authoring lives outside the engine.
    SurveyId,
    "survey_id"
);

/// Principal identifier issued by the identity collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    /// # Errors
    /// Returns [`LifecycleError::Validation`] for blank identifiers.
    pub fn new(raw: impl Into<String>) -> Result<Self, LifecycleError> {
        let value = raw.into().trim().to_string();
        if value.is_empty() {
            return Err(LifecycleError::Validation(
                "principal id MUST be non-empty".to_string(),
            ));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PrincipalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Pending,
    InProgress,
    Completed,
    Validated,
    Rejected,
}

impl IncidentStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Validated,
        Self::Rejected,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "validated" => Some(Self::Validated),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Human-facing label used in notification bodies.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::Validated => "Validated",
            Self::Rejected => "Rejected",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Validated)
    }
}

impl Display for IncidentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed `(from, to)` status pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StatusEdge {
    pub from: IncidentStatus,
    pub to: IncidentStatus,
}

impl StatusEdge {
    #[must_use]
    pub const fn new(from: IncidentStatus, to: IncidentStatus) -> Self {
        Self { from, to }
    }
}

impl Display for StatusEdge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// # Errors
    /// Returns [`LifecycleError::Validation`] for out-of-range or non-finite
    /// coordinates.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(LifecycleError::Validation(
                "latitude MUST be in [-90, 90]".to_string(),
            ));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(LifecycleError::Validation(
                "longitude MUST be in [-180, 180]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReporterContact {
    pub name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub id: IncidentId,
    pub title: String,
    pub description: String,
    pub status: IncidentStatus,
    pub priority: Priority,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
    pub location: GeoPoint,
    pub reporter: ReporterContact,
    pub rejection_reason: Option<String>,
    pub department_id: Option<DepartmentId>,
    pub crew_id: Option<CrewId>,
    pub incident_type_id: Option<IncidentTypeId>,
    pub survey_id: Option<SurveyId>,
    pub version: u64,
}

/// Intake payload for a new incident.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewIncident {
    pub title: String,
    pub description: String,
    pub priority: Option<Priority>,
    pub location: GeoPoint,
    pub reporter: ReporterContact,
    pub department_id: Option<DepartmentId>,
    pub incident_type_id: Option<IncidentTypeId>,
    pub survey_id: Option<SurveyId>,
}

impl NewIncident {
    /// Validates intake fields before the incident is recorded.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] when a required field is blank,
    /// the coordinates are out of range, or the reporter email is malformed.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.title.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "title MUST be provided".to_string(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "description MUST be provided".to_string(),
            ));
        }
        if self.reporter.name.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "reporter name MUST be provided".to_string(),
            ));
        }
        if !looks_like_email(&self.reporter.email) {
            return Err(LifecycleError::Validation(format!(
                "reporter email is not a valid address: {}",
                self.reporter.email
            )));
        }
        self.location.validate()
    }

    /// Builds the `Pending` incident record. `fallback_priority` is used when
    /// the intake did not set one (typically the incident type's severity).
    #[must_use]
    pub fn into_incident(
        self,
        id: IncidentId,
        fallback_priority: Option<Priority>,
        now: OffsetDateTime,
    ) -> Incident {
        Incident {
            id,
            title: self.title.trim().to_string(),
            description: self.description,
            status: IncidentStatus::Pending,
            priority: self
                .priority
                .or(fallback_priority)
                .unwrap_or_default(),
            created_at: now,
            updated_at: now,
            closed_at: None,
            location: self.location,
            reporter: self.reporter,
            rejection_reason: None,
            department_id: self.department_id,
            crew_id: None,
            incident_type_id: self.incident_type_id,
            survey_id: self.survey_id,
            version: 1,
        }
    }
}

/// Non-status fields an editor may change on an incident.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IncidentPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
}

impl IncidentPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.priority.is_none()
    }

    /// # Errors
    /// Returns [`LifecycleError::Validation`] when a provided text field is blank.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.title.as_deref().is_some_and(|value| value.trim().is_empty()) {
            return Err(LifecycleError::Validation(
                "title cannot be empty".to_string(),
            ));
        }
        if self
            .description
            .as_deref()
            .is_some_and(|value| value.trim().is_empty())
        {
            return Err(LifecycleError::Validation(
                "description cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn apply_to(&self, incident: &mut Incident) {
        if let Some(title) = &self.title {
            incident.title = title.trim().to_string();
        }
        if let Some(description) = &self.description {
            incident.description.clone_from(description);
        }
        if let Some(priority) = self.priority {
            incident.priority = priority;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Department {
    pub id: DepartmentId,
    pub name: String,
    pub responsible: Option<PrincipalId>,
    pub contact_email: Option<String>,
    pub active: bool,
}

impl Department {
    /// # Errors
    /// Returns [`LifecycleError::Validation`] for a blank name or a malformed
    /// contact address.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.name.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "department name MUST be provided".to_string(),
            ));
        }
        if let Some(contact) = &self.contact_email {
            if !looks_like_email(contact) {
                return Err(LifecycleError::Validation(format!(
                    "department contact is not a valid address: {contact}"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn is_responsible(&self, principal: &PrincipalId) -> bool {
        self.responsible.as_ref() == Some(principal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Crew {
    pub id: CrewId,
    pub name: String,
    pub department_id: DepartmentId,
    pub lead: Option<PrincipalId>,
    pub member: PrincipalId,
}

impl Crew {
    /// # Errors
    /// Returns [`LifecycleError::Validation`] for a blank name.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.name.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "crew name MUST be provided".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `principal` is this crew's lead or its member profile.
    #[must_use]
    pub fn includes(&self, principal: &PrincipalId) -> bool {
        &self.member == principal || self.lead.as_ref() == Some(principal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncidentType {
    pub id: IncidentTypeId,
    pub name: String,
    pub description: String,
    pub severity: Priority,
}

impl IncidentType {
    /// # Errors
    /// Returns [`LifecycleError::Validation`] for a blank name.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.name.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "incident type name MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "document" => Some(Self::Document),
            _ => None,
        }
    }

    /// Classifies a MIME content type by its top-level type; anything that
    /// is not image, video or audio is filed as a document.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Self {
        let major = content_type
            .split('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match major.as_str() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Document,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Evidence {
    pub id: EvidenceId,
    pub incident_id: IncidentId,
    pub name: String,
    pub kind: MediaKind,
    pub format: String,
    pub size_bytes: u64,
    pub storage_ref: String,
    pub created_by: PrincipalId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub survey_id: Option<SurveyId>,
}

/// Evidence metadata handed over after the file-storage collaborator stored
/// the bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceInput {
    pub name: String,
    pub kind: MediaKind,
    pub format: String,
    pub size_bytes: u64,
    pub storage_ref: String,
    pub survey_id: Option<SurveyId>,
}

impl EvidenceInput {
    /// # Errors
    /// Returns [`LifecycleError::Validation`] when the name or storage
    /// reference is blank.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.name.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "evidence name MUST be provided".to_string(),
            ));
        }
        if self.storage_ref.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "evidence storage_ref MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

/// Derives the evidence format from a file name extension, lower-cased.
#[must_use]
pub fn format_from_file_name(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() && !extension.is_empty() => {
            extension.to_ascii_lowercase()
        }
        _ => "bin".to_string(),
    }
}

pub(crate) fn looks_like_email(value: &str) -> bool {
    let trimmed = value.trim();
    match trimmed.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !trimmed.contains(char::is_whitespace)
        }
        None => false,
    }
}
