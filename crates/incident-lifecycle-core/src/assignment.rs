//! Department/crew pairing rules.

use time::OffsetDateTime;

use crate::model::{Crew, Department, Incident, IncidentStatus};
use crate::roles::{capabilities, Actor, IncidentContext, RoleGroup};
use crate::LifecycleError;

/// A crew to assign together with the department that owns it.
#[derive(Debug, Clone, Copy)]
pub struct CrewTarget<'a> {
    pub crew: &'a Crew,
    pub department: &'a Department,
}

impl<'a> CrewTarget<'a> {
    /// # Errors
    /// Returns [`LifecycleError::Validation`] when `department` does not own `crew`.
    pub fn new(crew: &'a Crew, department: &'a Department) -> Result<Self, LifecycleError> {
        if crew.department_id != department.id {
            return Err(LifecycleError::Validation(format!(
                "crew {} is not owned by department {}",
                crew.id, department.id
            )));
        }
        Ok(Self { crew, department })
    }
}

/// Points the incident at `crew`, adopting the crew's department when the
/// incident has none.
///
/// # Errors
/// Returns [`LifecycleError::AssignmentLocked`] outside `Pending`/`Rejected`
/// and [`LifecycleError::DepartmentMismatch`] when the crew belongs to another
/// department.
pub fn assign_crew(incident: &Incident, crew: &Crew) -> Result<Incident, LifecycleError> {
    if !matches!(
        incident.status,
        IncidentStatus::Pending | IncidentStatus::Rejected
    ) {
        return Err(LifecycleError::AssignmentLocked {
            status: incident.status,
        });
    }

    if let Some(incident_department) = incident.department_id {
        if incident_department != crew.department_id {
            return Err(LifecycleError::DepartmentMismatch {
                crew_department: crew.department_id,
                incident_department,
            });
        }
    }

    let mut next = incident.clone();
    next.department_id = Some(crew.department_id);
    next.crew_id = Some(crew.id);
    Ok(next)
}

/// Checks that a crew reference is backed by a department that owns it.
/// `crew` is the record for `incident.crew_id`, if loaded.
///
/// # Errors
/// Returns [`LifecycleError::MissingAssignment`] for a crew without a
/// department and [`LifecycleError::DepartmentMismatch`] for a crew owned by
/// a different department.
pub fn validate_assignment_invariant(
    incident: &Incident,
    crew: Option<&Crew>,
) -> Result<(), LifecycleError> {
    let Some(crew_id) = incident.crew_id else {
        return Ok(());
    };
    let Some(incident_department) = incident.department_id else {
        return Err(LifecycleError::MissingAssignment(format!(
            "incident {} has crew {crew_id} but no department",
            incident.id
        )));
    };
    if let Some(crew) = crew.filter(|crew| crew.id == crew_id) {
        if crew.department_id != incident_department {
            return Err(LifecycleError::DepartmentMismatch {
                crew_department: crew.department_id,
                incident_department,
            });
        }
    }
    Ok(())
}

/// Authorizes `actor` to point the incident at `target`.
///
/// # Errors
/// Returns [`LifecycleError::Unauthorized`] without `can_assign`, or when a
/// department actor is not responsible for the crew's department.
pub fn authorize_crew_assignment(
    actor: &Actor,
    ctx: &IncidentContext<'_>,
    target: &CrewTarget<'_>,
) -> Result<(), LifecycleError> {
    if actor.is_admin() {
        return Ok(());
    }
    if !capabilities(actor, ctx).can_assign {
        return Err(LifecycleError::Unauthorized(format!(
            "{} may not assign crews on incident {}",
            actor.principal_id, ctx.incident.id
        )));
    }
    if actor.has(RoleGroup::Department) && !target.department.is_responsible(&actor.principal_id) {
        return Err(LifecycleError::Unauthorized(format!(
            "{} is not responsible for department {}",
            actor.principal_id, target.department.name
        )));
    }
    Ok(())
}

/// Only the assigned crew's lead or member (or an administrator) may act as
/// the crew on this incident.
///
/// # Errors
/// Returns [`LifecycleError::Unauthorized`] for anyone else.
pub fn require_assigned_crew(actor: &Actor, ctx: &IncidentContext<'_>) -> Result<(), LifecycleError> {
    if actor.is_admin() || ctx.is_assigned_crew_member(&actor.principal_id) {
        return Ok(());
    }
    Err(LifecycleError::Unauthorized(format!(
        "{} is not the crew assigned to incident {}",
        actor.principal_id, ctx.incident.id
    )))
}

/// Standalone crew assignment: authorize, assign, bump the version.
///
/// # Errors
/// Propagates the authorization and assignment errors above.
pub fn apply_assignment(
    actor: &Actor,
    ctx: &IncidentContext<'_>,
    target: &CrewTarget<'_>,
    now: OffsetDateTime,
) -> Result<Incident, LifecycleError> {
    authorize_crew_assignment(actor, ctx, target)?;
    let mut next = assign_crew(ctx.incident, target.crew)?;
    next.updated_at = now;
    next.version = ctx.incident.version + 1;
    Ok(next)
}
