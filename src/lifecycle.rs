//! Lead lifecycle state machine.
//!
//! Status changes are only ever applied through the functions in this module.
//! Each one checks the transition table and the actor guard first and mutates
//! the lead only when the check passes, so a rejected call leaves the lead
//! exactly as it was.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Actor, AllowedActions, Lead, LeadStatus, StatusChange};

use LeadStatus::*;

/// Every legal (from, to) pair. Anything else is an `InvalidTransition`.
pub const ALLOWED_TRANSITIONS: &[(LeadStatus, LeadStatus)] = &[
    (New, AutoResponded),
    (New, SdrReview),
    (New, Qualified),
    (New, Disqualified),
    (AutoResponded, SdrReview),
    (AutoResponded, Qualified),
    (AutoResponded, Disqualified),
    (SdrReview, SdrReview),
    (SdrReview, Qualified),
    (SdrReview, Disqualified),
    (Qualified, Converted),
];

pub fn is_allowed(from: LeadStatus, to: LeadStatus) -> bool {
    ALLOWED_TRANSITIONS.contains(&(from, to))
}

/// Which actors may drive a move into `to`.
fn actor_permitted(to: LeadStatus, actor: Actor) -> bool {
    match to {
        AutoResponded => actor == Actor::Dispatcher,
        SdrReview => actor == Actor::Reviewer,
        Qualified | Disqualified => matches!(actor, Actor::Reviewer | Actor::Rule),
        Converted => actor == Actor::Conversion,
        New => false,
    }
}

/// Validates a transition without touching the lead.
pub fn check_transition(from: LeadStatus, to: LeadStatus, actor: Actor) -> Result<(), AppError> {
    if from.is_terminal() {
        return Err(invalid(from, to, format!("lead is already {}", from)));
    }
    if !is_allowed(from, to) {
        return Err(invalid(from, to, format!("{} -> {} is not allowed", from, to)));
    }
    if !actor_permitted(to, actor) {
        return Err(invalid(
            from,
            to,
            format!("{:?} may not move a lead to {}", actor, to),
        ));
    }
    Ok(())
}

fn invalid(from: LeadStatus, to: LeadStatus, reason: String) -> AppError {
    AppError::InvalidTransition { from, to, reason }
}

fn record(lead: &mut Lead, to: LeadStatus, actor: Actor, at: DateTime<Utc>) {
    lead.status_history.push(StatusChange {
        from: lead.status,
        to,
        actor,
        at,
    });
    lead.status = to;
}

/// `new → auto_responded`, dispatcher only.
///
/// Returns `Ok(false)` without changing anything when the lead has already
/// moved past `new`: the response still counts, but status never regresses.
pub fn mark_auto_responded(lead: &mut Lead, at: DateTime<Utc>) -> Result<bool, AppError> {
    if lead.status != New {
        return Ok(false);
    }
    check_transition(lead.status, AutoResponded, Actor::Dispatcher)?;
    record(lead, AutoResponded, Actor::Dispatcher, at);
    Ok(true)
}

/// A human claims the lead for review.
///
/// Re-claiming an `sdr_review` lead reassigns it. Claiming a `qualified` lead
/// only reassigns the SDR, since moving it back to review would regress it.
pub fn claim(lead: &mut Lead, sdr_id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
    let sdr_id = sdr_id.trim();
    if sdr_id.is_empty() {
        return Err(AppError::Validation("sdr_id is required".to_string()));
    }
    if lead.status == Qualified {
        lead.sdr_id = Some(sdr_id.to_string());
        return Ok(());
    }
    check_transition(lead.status, SdrReview, Actor::Reviewer)?;
    lead.sdr_id = Some(sdr_id.to_string());
    if lead.status != SdrReview {
        record(lead, SdrReview, Actor::Reviewer, at);
    }
    Ok(())
}

/// Qualification decision. Requires non-empty notes.
pub fn qualify(
    lead: &mut Lead,
    notes: &str,
    ae_id: Option<&str>,
    actor: Actor,
    at: DateTime<Utc>,
) -> Result<(), AppError> {
    check_transition(lead.status, Qualified, actor)?;
    let notes = required_notes(notes)?;
    if let Some(ae) = ae_id.map(str::trim).filter(|ae| !ae.is_empty()) {
        lead.ae_id = Some(ae.to_string());
    }
    lead.qualification_notes = Some(notes);
    lead.qualified_at = Some(at);
    record(lead, Qualified, actor, at);
    Ok(())
}

/// Terminal rejection. Requires non-empty notes.
pub fn disqualify(
    lead: &mut Lead,
    notes: &str,
    actor: Actor,
    at: DateTime<Utc>,
) -> Result<(), AppError> {
    check_transition(lead.status, Disqualified, actor)?;
    let notes = required_notes(notes)?;
    lead.qualification_notes = Some(notes);
    lead.disqualified_at = Some(at);
    record(lead, Disqualified, actor, at);
    Ok(())
}

/// `qualified → converted`, conversion service only, links set exactly once.
pub fn mark_converted(
    lead: &mut Lead,
    account_id: Uuid,
    deal_id: Uuid,
    at: DateTime<Utc>,
) -> Result<(), AppError> {
    if lead.converted_account_id.is_some() || lead.converted_deal_id.is_some() {
        return Err(invalid(
            lead.status,
            Converted,
            "lead already has conversion links".to_string(),
        ));
    }
    check_transition(lead.status, Converted, Actor::Conversion)?;
    let converted_at = match lead.qualified_at {
        Some(qualified_at) if at > qualified_at => at,
        Some(qualified_at) => qualified_at + chrono::Duration::milliseconds(1),
        None => {
            return Err(invalid(
                lead.status,
                Converted,
                "qualified lead has no qualified_at".to_string(),
            ))
        }
    };
    lead.converted_account_id = Some(account_id);
    lead.converted_deal_id = Some(deal_id);
    lead.converted_at = Some(converted_at);
    record(lead, Converted, Actor::Conversion, converted_at);
    Ok(())
}

fn required_notes(notes: &str) -> Result<String, AppError> {
    let notes = notes.trim();
    if notes.is_empty() {
        return Err(AppError::Validation(
            "qualification notes are required".to_string(),
        ));
    }
    Ok(notes.to_string())
}

/// Commands the dashboard may offer for a lead in `status`.
pub fn allowed_actions(lead: &Lead) -> AllowedActions {
    let status = lead.status;
    AllowedActions {
        claim: status == Qualified || check_transition(status, SdrReview, Actor::Reviewer).is_ok(),
        qualify: check_transition(status, Qualified, Actor::Reviewer).is_ok(),
        disqualify: check_transition(status, Disqualified, Actor::Reviewer).is_ok(),
        convert: check_transition(status, Converted, Actor::Conversion).is_ok()
            && lead.converted_account_id.is_none(),
        respond: !status.is_terminal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LeadSource;

    fn lead_in(status: LeadStatus) -> Lead {
        let now = Utc::now();
        let mut lead = Lead::new(
            LeadSource::WebsiteForm,
            "dana@acme.io".into(),
            "Acme".into(),
            "acme".into(),
            now,
        );
        lead.first_name = Some("Dana".into());
        lead.status = status;
        if matches!(status, Qualified | Converted) {
            lead.qualified_at = Some(now);
        }
        lead
    }

    #[test]
    fn test_table_rejects_backward_moves() {
        assert!(!is_allowed(Qualified, New));
        assert!(!is_allowed(SdrReview, AutoResponded));
        assert!(!is_allowed(Converted, Qualified));
        assert!(!is_allowed(AutoResponded, New));
    }

    #[test]
    fn test_dispatcher_only_from_new() {
        let mut lead = lead_in(New);
        assert!(mark_auto_responded(&mut lead, Utc::now()).unwrap());
        assert_eq!(lead.status, AutoResponded);

        let mut reviewed = lead_in(SdrReview);
        assert!(!mark_auto_responded(&mut reviewed, Utc::now()).unwrap());
        assert_eq!(reviewed.status, SdrReview);
        assert!(reviewed.status_history.is_empty());
    }

    #[test]
    fn test_reviewer_cannot_auto_respond() {
        let err = check_transition(New, AutoResponded, Actor::Reviewer).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[test]
    fn test_reclaim_is_idempotent() {
        let mut lead = lead_in(AutoResponded);
        claim(&mut lead, "sdr-1", Utc::now()).unwrap();
        claim(&mut lead, "sdr-2", Utc::now()).unwrap();
        assert_eq!(lead.status, SdrReview);
        assert_eq!(lead.sdr_id.as_deref(), Some("sdr-2"));
        assert_eq!(lead.status_history.len(), 1);
    }

    #[test]
    fn test_claim_on_qualified_keeps_status() {
        let mut lead = lead_in(Qualified);
        claim(&mut lead, "sdr-9", Utc::now()).unwrap();
        assert_eq!(lead.status, Qualified);
        assert_eq!(lead.sdr_id.as_deref(), Some("sdr-9"));
    }

    #[test]
    fn test_qualify_requires_notes() {
        let mut lead = lead_in(SdrReview);
        let before = lead.clone();
        let err = qualify(&mut lead, "   ", None, Actor::Reviewer, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(lead, before);
    }

    #[test]
    fn test_qualify_sets_timestamp_and_ae() {
        let mut lead = lead_in(New);
        let at = Utc::now();
        qualify(&mut lead, "budget confirmed", Some("ae-7"), Actor::Reviewer, at).unwrap();
        assert_eq!(lead.status, Qualified);
        assert_eq!(lead.qualified_at, Some(at));
        assert_eq!(lead.ae_id.as_deref(), Some("ae-7"));
    }

    #[test]
    fn test_qualify_converted_lead_is_rejected_untouched() {
        let mut lead = lead_in(Converted);
        let before = lead.clone();
        let err = qualify(&mut lead, "again", None, Actor::Reviewer, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: Converted,
                to: Qualified,
                ..
            }
        ));
        assert_eq!(lead, before);
    }

    #[test]
    fn test_convert_requires_qualified() {
        let mut lead = lead_in(SdrReview);
        let err = mark_converted(&mut lead, Uuid::new_v4(), Uuid::new_v4(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert!(lead.converted_account_id.is_none());
    }

    #[test]
    fn test_converted_at_after_qualified_at() {
        let mut lead = lead_in(Qualified);
        let qualified_at = lead.qualified_at.unwrap();
        mark_converted(&mut lead, Uuid::new_v4(), Uuid::new_v4(), qualified_at).unwrap();
        assert!(lead.converted_at.unwrap() > qualified_at);
        assert_eq!(lead.status, Converted);
    }

    #[test]
    fn test_allowed_actions_follow_status() {
        let actions = allowed_actions(&lead_in(Qualified));
        assert!(actions.convert);
        assert!(!actions.qualify);

        let actions = allowed_actions(&lead_in(Disqualified));
        assert!(!actions.claim && !actions.qualify && !actions.convert && !actions.respond);
    }
}
