//! Capability resolution for an acting principal against one incident.
//!
//! Everything here is a pure function of the role data handed in by the
//! identity collaborator; nothing is cached between calls.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{Crew, Department, Incident, IncidentStatus, PrincipalId, StatusEdge};
use crate::LifecycleError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoleGroup {
    Administrator,
    Direction,
    Department,
    CrewLead,
    Territorial,
}

impl RoleGroup {
    pub const ALL: [Self; 5] = [
        Self::Administrator,
        Self::Direction,
        Self::Department,
        Self::CrewLead,
        Self::Territorial,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Administrator => "administrator",
            Self::Direction => "direction",
            Self::Department => "department",
            Self::CrewLead => "crew_lead",
            Self::Territorial => "territorial",
        }
    }

    /// Accepts canonical names and the group names of the legacy deployment.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "administrator" | "Administrador" => Some(Self::Administrator),
            "direction" | "Dirección" | "Direccion" => Some(Self::Direction),
            "department" | "Departamento" => Some(Self::Department),
            "crew_lead" | "Jefe de Cuadrilla" | "Cuadrilla" => Some(Self::CrewLead),
            "territorial" | "Territorial" => Some(Self::Territorial),
            _ => None,
        }
    }
}

/// The acting principal with its group memberships.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub principal_id: PrincipalId,
    pub groups: BTreeSet<RoleGroup>,
    pub is_superuser: bool,
}

impl Actor {
    #[must_use]
    pub fn new(principal_id: PrincipalId) -> Self {
        Self {
            principal_id,
            groups: BTreeSet::new(),
            is_superuser: false,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: RoleGroup) -> Self {
        self.groups.insert(group);
        self
    }

    #[must_use]
    pub fn superuser(mut self) -> Self {
        self.is_superuser = true;
        self
    }

    /// Builds an actor from raw group names, rejecting unknown ones.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] for a blank principal or an
    /// unknown group name.
    pub fn from_raw<I, S>(principal: &str, groups: I, is_superuser: bool) -> Result<Self, LifecycleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut actor = Self::new(PrincipalId::new(principal)?);
        for raw in groups {
            let group = RoleGroup::parse(raw.as_ref()).ok_or_else(|| {
                LifecycleError::Validation(format!("unknown role group: {}", raw.as_ref()))
            })?;
            actor.groups.insert(group);
        }
        actor.is_superuser = is_superuser;
        Ok(actor)
    }

    #[must_use]
    pub fn has(&self, group: RoleGroup) -> bool {
        self.groups.contains(&group)
    }

    /// Administrator group or superuser flag.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.is_superuser || self.has(RoleGroup::Administrator)
    }
}

/// The incident plus the organizational records it references.
#[derive(Debug, Clone, Copy)]
pub struct IncidentContext<'a> {
    pub incident: &'a Incident,
    pub department: Option<&'a Department>,
    pub crew: Option<&'a Crew>,
}

impl<'a> IncidentContext<'a> {
    #[must_use]
    pub fn new(incident: &'a Incident) -> Self {
        Self {
            incident,
            department: None,
            crew: None,
        }
    }

    #[must_use]
    pub fn with_department(mut self, department: Option<&'a Department>) -> Self {
        self.department = department;
        self
    }

    #[must_use]
    pub fn with_crew(mut self, crew: Option<&'a Crew>) -> Self {
        self.crew = crew;
        self
    }

    /// Whether `principal` may act for the incident's department. An incident
    /// with no department yet is open to every department actor.
    #[must_use]
    pub fn manages_department(&self, principal: &PrincipalId) -> bool {
        match (self.incident.department_id, self.department) {
            (None, _) => true,
            (Some(id), Some(department)) => department.id == id && department.is_responsible(principal),
            (Some(_), None) => false,
        }
    }

    /// Whether `principal` leads or belongs to the crew assigned to the incident.
    #[must_use]
    pub fn is_assigned_crew_member(&self, principal: &PrincipalId) -> bool {
        match (self.incident.crew_id, self.crew) {
            (Some(id), Some(crew)) => crew.id == id && crew.includes(principal),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub transitions: BTreeSet<StatusEdge>,
    pub any_transition: bool,
    pub can_assign: bool,
    pub can_finalize: bool,
    pub can_attach_evidence: bool,
    pub can_edit: bool,
    pub can_view: bool,
}

impl Capabilities {
    #[must_use]
    pub fn allows(&self, edge: StatusEdge) -> bool {
        self.any_transition || self.transitions.contains(&edge)
    }
}

/// Resolves what `actor` may do on the incident in `ctx`.
#[must_use]
pub fn capabilities(actor: &Actor, ctx: &IncidentContext<'_>) -> Capabilities {
    if actor.is_admin() {
        return Capabilities {
            transitions: BTreeSet::new(),
            any_transition: true,
            can_assign: true,
            can_finalize: true,
            can_attach_evidence: true,
            can_edit: true,
            can_view: true,
        };
    }

    let principal = &actor.principal_id;
    let mut caps = Capabilities::default();

    if actor.has(RoleGroup::Department) {
        caps.transitions.insert(StatusEdge::new(
            IncidentStatus::Pending,
            IncidentStatus::InProgress,
        ));
        caps.transitions.insert(StatusEdge::new(
            IncidentStatus::Rejected,
            IncidentStatus::InProgress,
        ));
        let manages = ctx.manages_department(principal);
        caps.can_assign = manages;
        caps.can_edit = manages;
    }

    if actor.has(RoleGroup::CrewLead) {
        caps.transitions.insert(StatusEdge::new(
            IncidentStatus::InProgress,
            IncidentStatus::Completed,
        ));
        caps.can_attach_evidence = ctx.is_assigned_crew_member(principal);
    }

    if actor.has(RoleGroup::Territorial) {
        caps.transitions.insert(StatusEdge::new(
            IncidentStatus::Completed,
            IncidentStatus::Validated,
        ));
        caps.transitions.insert(StatusEdge::new(
            IncidentStatus::Completed,
            IncidentStatus::Rejected,
        ));
        caps.can_finalize = true;
    }

    caps.can_view = can_view(actor, ctx.incident, ctx.crew);
    caps
}

/// Visibility rule shared by `capabilities` and incident listings.
#[must_use]
pub fn can_view(actor: &Actor, incident: &Incident, assigned_crew: Option<&Crew>) -> bool {
    if actor.is_admin() || actor.has(RoleGroup::Direction) || actor.has(RoleGroup::Department) {
        return true;
    }
    if actor.has(RoleGroup::CrewLead)
        && assigned_crew.is_some_and(|crew| {
            Some(crew.id) == incident.crew_id && crew.includes(&actor.principal_id)
        })
    {
        return true;
    }
    if actor.has(RoleGroup::Territorial)
        && matches!(
            incident.status,
            IncidentStatus::Completed | IncidentStatus::Validated | IncidentStatus::Rejected
        )
    {
        return true;
    }
    incident
        .reporter
        .email
        .eq_ignore_ascii_case(actor.principal_id.as_str())
}
