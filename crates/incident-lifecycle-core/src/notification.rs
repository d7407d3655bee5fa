use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::{Department, DepartmentId, Incident, IncidentId, IncidentStatus, PrincipalId};

/// Describes a committed status change for an external notifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationIntent {
    pub incident_id: IncidentId,
    pub incident_title: String,
    pub previous_status: IncidentStatus,
    pub new_status: IncidentStatus,
    pub actor_id: PrincipalId,
    pub department_id: Option<DepartmentId>,
    pub department_name: Option<String>,
    pub department_contact: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl NotificationIntent {
    /// Builds the intent from the incident before and after the change.
    /// `department` is the record for `after.department_id`, if any.
    #[must_use]
    pub fn from_change(
        before: &Incident,
        after: &Incident,
        actor_id: &PrincipalId,
        department: Option<&Department>,
        occurred_at: OffsetDateTime,
    ) -> Self {
        let department = department.filter(|dept| Some(dept.id) == after.department_id);
        Self {
            incident_id: after.id,
            incident_title: after.title.clone(),
            previous_status: before.status,
            new_status: after.status,
            actor_id: actor_id.clone(),
            department_id: after.department_id,
            department_name: department.map(|dept| dept.name.clone()),
            department_contact: department.and_then(|dept| dept.contact_email.clone()),
            occurred_at,
        }
    }
}
