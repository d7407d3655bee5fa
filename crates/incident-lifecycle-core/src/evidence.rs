use time::OffsetDateTime;

use crate::model::{Evidence, EvidenceId, EvidenceInput, IncidentId, IncidentStatus};
use crate::roles::{capabilities, Actor, IncidentContext};
use crate::LifecycleError;

#[must_use]
pub fn has_sufficient_evidence(count: u64) -> bool {
    count >= 1
}

/// # Errors
/// Returns [`LifecycleError::MissingEvidence`] when nothing is attached.
pub fn require_sufficient_evidence(incident_id: IncidentId, count: u64) -> Result<(), LifecycleError> {
    if has_sufficient_evidence(count) {
        Ok(())
    } else {
        Err(LifecycleError::MissingEvidence { incident_id })
    }
}

/// Authorization is checked before incident state.
///
/// # Errors
/// Returns [`LifecycleError::Unauthorized`] unless the actor is the assigned
/// crew or an administrator, then [`LifecycleError::InvalidState`] unless the
/// incident is `InProgress`.
pub fn authorize_evidence(actor: &Actor, ctx: &IncidentContext<'_>) -> Result<(), LifecycleError> {
    if !capabilities(actor, ctx).can_attach_evidence {
        return Err(LifecycleError::Unauthorized(format!(
            "{} may not attach evidence to incident {}",
            actor.principal_id, ctx.incident.id
        )));
    }
    if ctx.incident.status != IncidentStatus::InProgress {
        return Err(LifecycleError::InvalidState(format!(
            "evidence can only be attached while in_progress; incident {} is {}",
            ctx.incident.id, ctx.incident.status
        )));
    }
    Ok(())
}

/// Authorizes and builds an evidence record for the incident in `ctx`.
///
/// # Errors
/// Propagates [`authorize_evidence`] errors and input validation errors.
pub fn build_evidence(
    actor: &Actor,
    ctx: &IncidentContext<'_>,
    input: EvidenceInput,
    now: OffsetDateTime,
) -> Result<Evidence, LifecycleError> {
    authorize_evidence(actor, ctx)?;
    input.validate()?;
    Ok(Evidence {
        id: EvidenceId::new(),
        incident_id: ctx.incident.id,
        name: input.name.trim().to_string(),
        kind: input.kind,
        format: input.format.trim().to_ascii_lowercase(),
        size_bytes: input.size_bytes,
        storage_ref: input.storage_ref,
        created_by: actor.principal_id.clone(),
        created_at: now,
        survey_id: input.survey_id,
    })
}
