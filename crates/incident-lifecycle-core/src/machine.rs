//! The incident state machine.
//!
//! `apply_transition` is pure: it takes the loaded incident plus every
//! record the decision depends on and returns the next incident value. The
//! caller persists it and dispatches the returned notification.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::assignment::{
    assign_crew, authorize_crew_assignment, require_assigned_crew, validate_assignment_invariant,
    CrewTarget,
};
use crate::evidence::require_sufficient_evidence;
use crate::model::{
    Crew, CrewId, Department, Incident, IncidentPatch, IncidentStatus, StatusEdge,
};
use crate::notification::NotificationIntent;
use crate::roles::{capabilities, Actor, Capabilities, IncidentContext};
use crate::LifecycleError;

pub const LEGAL_EDGES: [StatusEdge; 5] = [
    StatusEdge::new(IncidentStatus::Pending, IncidentStatus::InProgress),
    StatusEdge::new(IncidentStatus::InProgress, IncidentStatus::Completed),
    StatusEdge::new(IncidentStatus::Completed, IncidentStatus::Validated),
    StatusEdge::new(IncidentStatus::Completed, IncidentStatus::Rejected),
    StatusEdge::new(IncidentStatus::Rejected, IncidentStatus::InProgress),
];

#[must_use]
pub fn is_legal_edge(edge: StatusEdge) -> bool {
    use IncidentStatus::{Completed, InProgress, Pending, Rejected, Validated};
    matches!(
        (edge.from, edge.to),
        (Pending, InProgress)
            | (InProgress, Completed)
            | (Completed, Validated | Rejected)
            | (Rejected, InProgress)
    )
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransitionFields {
    pub rejection_reason: Option<String>,
    pub crew_id: Option<CrewId>,
    #[serde(default)]
    pub patch: IncidentPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRequest {
    pub to: IncidentStatus,
    #[serde(default)]
    pub fields: TransitionFields,
}

impl TransitionRequest {
    #[must_use]
    pub fn new(to: IncidentStatus) -> Self {
        Self {
            to,
            fields: TransitionFields::default(),
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.fields.rejection_reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_crew(mut self, crew_id: CrewId) -> Self {
        self.fields.crew_id = Some(crew_id);
        self
    }

    #[must_use]
    pub fn with_patch(mut self, patch: IncidentPatch) -> Self {
        self.fields.patch = patch;
        self
    }
}

/// Records the decision depends on, loaded by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionContext<'a> {
    /// Department referenced by the incident, if any.
    pub department: Option<&'a Department>,
    /// Crew currently assigned to the incident, if any.
    pub crew: Option<&'a Crew>,
    /// Resolved crew for `fields.crew_id`.
    pub requested_crew: Option<CrewTarget<'a>>,
    pub evidence_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub incident: Incident,
    pub notification: Option<NotificationIntent>,
    pub edge: Option<StatusEdge>,
    /// Crew newly pointed at by this request.
    pub assigned_crew: Option<CrewId>,
    /// False for a same-state request that changed nothing.
    pub changed: bool,
}

/// Validates and applies one request against `incident`.
///
/// # Errors
/// Returns the [`LifecycleError`] of the first failed check; the input
/// incident is never modified.
pub fn apply_transition(
    incident: &Incident,
    actor: &Actor,
    request: &TransitionRequest,
    ctx: &TransitionContext<'_>,
    now: OffsetDateTime,
) -> Result<TransitionOutcome, LifecycleError> {
    let from = incident.status;
    let to = request.to;
    let edge = StatusEdge::new(from, to);
    // Graph checks come first so a frozen or illegal request never reaches
    // record lookups.
    if from.is_terminal() || (from != to && !is_legal_edge(edge)) {
        return Err(LifecycleError::InvalidTransition { from, to });
    }

    let incident_ctx = IncidentContext::new(incident)
        .with_department(ctx.department)
        .with_crew(ctx.crew);
    let caps = capabilities(actor, &incident_ctx);

    if from == to {
        return apply_edit(incident, actor, request, ctx, &incident_ctx, &caps, now);
    }

    if !caps.allows(edge) {
        return Err(LifecycleError::Unauthorized(format!(
            "{} may not move incident {} from {from} to {to}",
            actor.principal_id, incident.id
        )));
    }

    let mut next = incident.clone();
    apply_patch(actor, &caps, &request.fields.patch, &mut next)?;
    let target = resolve_target(actor, &caps, request, ctx)?;
    let mut assigned_crew = None;

    match (from, to) {
        (IncidentStatus::Pending, IncidentStatus::InProgress) => {
            if let Some(target) = target {
                authorize_crew_assignment(actor, &incident_ctx, &target)?;
                next = assign_crew(&next, target.crew)?;
                assigned_crew = newly_assigned(incident, target.crew);
            }
            if next.department_id.is_none() || next.crew_id.is_none() {
                return Err(LifecycleError::MissingAssignment(format!(
                    "incident {} needs a department and a crew before work starts",
                    incident.id
                )));
            }
            require_department_responsibility(actor, department_for(&next, ctx, target))?;
        }
        (IncidentStatus::Rejected, IncidentStatus::InProgress) => {
            let Some(target) = target else {
                return Err(LifecycleError::MissingAssignment(format!(
                    "re-dispatching rejected incident {} requires a crew",
                    incident.id
                )));
            };
            authorize_crew_assignment(actor, &incident_ctx, &target)?;
            next = assign_crew(&next, target.crew)?;
            assigned_crew = Some(target.crew.id);
            next.rejection_reason = None;
            require_department_responsibility(actor, department_for(&next, ctx, Some(target)))?;
        }
        (IncidentStatus::InProgress, IncidentStatus::Completed) => {
            require_assigned_crew(actor, &incident_ctx)?;
            require_sufficient_evidence(incident.id, ctx.evidence_count)?;
        }
        (IncidentStatus::Completed, IncidentStatus::Rejected) => {
            let reason = request
                .fields
                .rejection_reason
                .as_deref()
                .map(str::trim)
                .filter(|reason| !reason.is_empty())
                .ok_or(LifecycleError::MissingRejectionReason)?;
            next.rejection_reason = Some(reason.to_string());
            next.crew_id = None;
        }
        (IncidentStatus::Completed, IncidentStatus::Validated) => {
            next.closed_at = Some(now);
        }
        _ => return Err(LifecycleError::InvalidTransition { from, to }),
    }

    validate_assignment_invariant(&next, target.map(|target| target.crew).or(ctx.crew))?;

    next.status = to;
    next.updated_at = now;
    next.version = incident.version + 1;

    let notification = NotificationIntent::from_change(
        incident,
        &next,
        &actor.principal_id,
        department_for(&next, ctx, target),
        now,
    );

    Ok(TransitionOutcome {
        incident: next,
        notification: Some(notification),
        edge: Some(edge),
        assigned_crew,
        changed: true,
    })
}

fn apply_edit(
    incident: &Incident,
    actor: &Actor,
    request: &TransitionRequest,
    ctx: &TransitionContext<'_>,
    incident_ctx: &IncidentContext<'_>,
    caps: &Capabilities,
    now: OffsetDateTime,
) -> Result<TransitionOutcome, LifecycleError> {
    let mut next = incident.clone();
    apply_patch(actor, caps, &request.fields.patch, &mut next)?;
    let target = resolve_target(actor, caps, request, ctx)?;

    let mut assigned_crew = None;
    if let Some(target) = target {
        authorize_crew_assignment(actor, incident_ctx, &target)?;
        next = assign_crew(&next, target.crew)?;
        assigned_crew = newly_assigned(incident, target.crew);
    }

    let changed = next != *incident;
    if changed {
        next.updated_at = now;
        next.version = incident.version + 1;
    }

    Ok(TransitionOutcome {
        incident: next,
        notification: None,
        edge: None,
        assigned_crew,
        changed,
    })
}

fn apply_patch(
    actor: &Actor,
    caps: &Capabilities,
    patch: &IncidentPatch,
    next: &mut Incident,
) -> Result<(), LifecycleError> {
    if patch.is_empty() {
        return Ok(());
    }
    if !caps.can_edit {
        return Err(LifecycleError::Unauthorized(format!(
            "{} may not edit incident {}",
            actor.principal_id, next.id
        )));
    }
    patch.validate()?;
    patch.apply_to(next);
    Ok(())
}

/// Looks up the requested crew once the actor is known to be allowed to
/// assign one; unknown crews are only reported to such actors.
fn resolve_target<'a>(
    actor: &Actor,
    caps: &Capabilities,
    request: &TransitionRequest,
    ctx: &TransitionContext<'a>,
) -> Result<Option<CrewTarget<'a>>, LifecycleError> {
    let Some(crew_id) = request.fields.crew_id else {
        return Ok(None);
    };
    if !caps.can_assign {
        return Err(LifecycleError::Unauthorized(format!(
            "{} may not assign crews",
            actor.principal_id
        )));
    }
    match ctx.requested_crew {
        Some(target) if target.crew.id == crew_id => Ok(Some(target)),
        _ => Err(LifecycleError::Validation(format!(
            "crew {crew_id} was not resolved for this request"
        ))),
    }
}

fn newly_assigned(before: &Incident, crew: &Crew) -> Option<CrewId> {
    (before.crew_id != Some(crew.id)).then_some(crew.id)
}

fn department_for<'a>(
    next: &Incident,
    ctx: &TransitionContext<'a>,
    target: Option<CrewTarget<'a>>,
) -> Option<&'a Department> {
    let id = next.department_id?;
    ctx.department
        .filter(|dept| dept.id == id)
        .or_else(|| target.map(|target| target.department).filter(|dept| dept.id == id))
}

fn require_department_responsibility(
    actor: &Actor,
    department: Option<&Department>,
) -> Result<(), LifecycleError> {
    if actor.is_admin() {
        return Ok(());
    }
    match department {
        Some(department) if department.is_responsible(&actor.principal_id) => Ok(()),
        Some(department) => Err(LifecycleError::Unauthorized(format!(
            "{} is not responsible for department {}",
            actor.principal_id, department.name
        ))),
        None => Err(LifecycleError::Unauthorized(format!(
            "{} cannot be checked against an unknown department",
            actor.principal_id
        ))),
    }
}
