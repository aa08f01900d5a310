//! Suggestion lifecycle: submit, policy gate, close, withdraw, deadline sweep.

use governance_core::{
    evaluate_policies, validate_actor, Decision, GovernanceError, HistoryOutcome, HistoryRecord,
    PolicyVerdict, SubjectRef, Suggestion, SuggestionDraft, SuggestionId, SuggestionState, Tally,
    MAX_TEXT_LEN, REASON_POLICY_BLOCKED, REASON_REVIEW_ACCEPTED, REASON_REVIEW_REJECTED,
    REASON_WITHDRAWN,
};
use governance_store_sqlite::{GovernanceTx, NewHistoryRecord, Resolution};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{GovernanceApi, SuggestionDetail, SuggestionView, WriteFailure, SYSTEM_ACTOR};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitSuggestion {
    pub parameter_id: String,
    pub proposed_value: String,
    #[serde(default)]
    pub rationale: String,
    pub author: String,
}

/// Outcome a privileged reviewer imposes on a review-flagged suggestion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionReport {
    pub suggestion: Suggestion,
    pub tally: Tally,
    pub history: HistoryRecord,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub resolved: Vec<ResolutionReport>,
    pub already_closed: usize,
    pub conflicts: usize,
    pub failures: usize,
}

enum WithdrawOutcome {
    Withdrawn(ResolutionReport),
    /// Voting had already closed; the attempt resolved the suggestion instead.
    ClosedOnArrival(ResolutionReport),
}

/// Who is closing and with what authority.
#[derive(Debug, Clone, Copy)]
enum Closer<'a> {
    /// Deadline-driven close by the engine itself.
    Deadline,
    Actor {
        actor: &'a str,
        forced: Option<ReviewDecision>,
    },
}

impl GovernanceApi {
    /// Creates a suggestion and runs it through the policy gate in one
    /// transaction. A blocking policy resolves it immediately as rejected.
    ///
    /// # Errors
    /// Returns [`GovernanceError::UnknownParameter`],
    /// [`GovernanceError::ParameterNotEditable`], [`GovernanceError::InvalidValue`]
    /// or [`GovernanceError::Validation`] for bad input and predicate failures.
    pub fn submit_suggestion(
        &self,
        request: &SubmitSuggestion,
    ) -> Result<SuggestionView, GovernanceError> {
        validate_actor(&request.author)?;
        if request.proposed_value.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "proposed_value cannot be empty".to_string(),
            ));
        }
        if request.rationale.chars().count() > MAX_TEXT_LEN {
            return Err(GovernanceError::Validation(format!(
                "rationale MUST be at most {MAX_TEXT_LEN} characters"
            )));
        }

        let suggestion = self.write(|tx| self.submit_in_tx(tx, request))?;

        info!(
            suggestion_id = %suggestion.suggestion_id,
            parameter_id = %suggestion.parameter_id,
            state = suggestion.state.as_str(),
            requires_review = suggestion.requires_review,
            "suggestion submitted"
        );

        let now = self.clock.now();
        Ok(SuggestionView {
            remaining_seconds: suggestion.remaining_seconds(now),
            suggestion,
            tally: Tally::default(),
        })
    }

    fn submit_in_tx(
        &self,
        tx: &GovernanceTx<'_>,
        request: &SubmitSuggestion,
    ) -> Result<Suggestion, WriteFailure> {
        let parameter = tx
            .get_parameter(&request.parameter_id)?
            .ok_or_else(|| GovernanceError::UnknownParameter(request.parameter_id.clone()))?;
        if !parameter.editable {
            return Err(GovernanceError::ParameterNotEditable(parameter.parameter_id).into());
        }
        parameter.validate_value(&request.proposed_value)?;

        let draft = SuggestionDraft {
            parameter_id: request.parameter_id.clone(),
            proposed_value: request.proposed_value.clone(),
            rationale: request.rationale.clone(),
            author: request.author.clone(),
        };
        let state = SuggestionState::Draft.transition(SuggestionState::PolicyCheck)?;
        let policies = tx.list_policies()?;
        let policy_revision = tx.policy_revision()?;
        let evaluation = evaluate_policies(&draft, &policies, self.evaluator.as_ref())?;
        let now = self.clock.now();

        let mut suggestion = Suggestion {
            suggestion_id: SuggestionId::new(),
            parameter_id: draft.parameter_id,
            proposed_value: draft.proposed_value,
            rationale: draft.rationale,
            author: draft.author,
            state,
            created_at: now,
            opened_at: None,
            voting_deadline: None,
            resolved_at: None,
            resolution_reason: None,
            resolved_by: None,
            requires_review: false,
            policy_revision,
            matched_policy_ids: evaluation.matched,
        };

        if evaluation.verdict == PolicyVerdict::Block {
            suggestion.state = state.transition(SuggestionState::Rejected)?;
            suggestion.resolved_at = Some(now);
            suggestion.resolution_reason = Some(REASON_POLICY_BLOCKED.to_string());
            suggestion.resolved_by = Some(SYSTEM_ACTOR.to_string());
            tx.insert_suggestion(&suggestion)?;
            tx.append_history(&NewHistoryRecord {
                parameter_id: parameter.parameter_id,
                parameter_name: parameter.name,
                requested_value: suggestion.proposed_value.clone(),
                previous_value: Some(parameter.value),
                outcome: HistoryOutcome::Rejected,
                reason: Some(REASON_POLICY_BLOCKED.to_string()),
                resolved_at: now,
                subject: SubjectRef::Suggestion(suggestion.suggestion_id),
                actor: SYSTEM_ACTOR.to_string(),
            })?;
            return Ok(suggestion);
        }

        suggestion.state = state.transition(SuggestionState::Open)?;
        suggestion.opened_at = Some(now);
        suggestion.voting_deadline = Some(now + self.config.voting_window());
        suggestion.requires_review = evaluation.verdict == PolicyVerdict::RequireReview;
        tx.insert_suggestion(&suggestion)?;
        Ok(suggestion)
    }

    /// Closes an open suggestion: tallies, applies the value when accepted and
    /// records history atomically.
    ///
    /// Privileged actors may close at any time. Anyone may close once the
    /// voting deadline has passed, except for review-flagged suggestions,
    /// which only privileged actors may close. `forced` applies only to
    /// review-flagged suggestions.
    ///
    /// # Errors
    /// Returns [`GovernanceError::SuggestionNotFound`],
    /// [`GovernanceError::SuggestionClosed`] (including when a concurrent
    /// closer won), [`GovernanceError::Unauthorized`], or
    /// [`GovernanceError::ConcurrentCloseConflict`] once storage retries are
    /// exhausted.
    pub fn close_suggestion(
        &self,
        suggestion_id: SuggestionId,
        actor: &str,
        forced: Option<ReviewDecision>,
    ) -> Result<ResolutionReport, GovernanceError> {
        validate_actor(actor)?;
        let closer = Closer::Actor { actor, forced };
        let report =
            self.write_resolution(suggestion_id, |tx| self.resolve_in_tx(tx, suggestion_id, closer))?;
        log_resolution(&report);
        Ok(report)
    }

    /// Withdraws an open suggestion on behalf of its author.
    ///
    /// # Errors
    /// Returns [`GovernanceError::SuggestionClosed`] for terminal suggestions
    /// and for suggestions whose voting deadline has passed (a non-review
    /// suggestion is closed by the attempt), and
    /// [`GovernanceError::Unauthorized`] when `actor` is not the author.
    pub fn withdraw(
        &self,
        suggestion_id: SuggestionId,
        actor: &str,
    ) -> Result<ResolutionReport, GovernanceError> {
        validate_actor(actor)?;
        let outcome = self.write_resolution(suggestion_id, |tx| {
            let suggestion = load_suggestion(tx, suggestion_id)?;
            if suggestion.state.is_terminal() {
                return Err(GovernanceError::SuggestionClosed(suggestion_id).into());
            }
            if suggestion.deadline_elapsed(self.clock.now()) {
                if suggestion.requires_review {
                    return Err(GovernanceError::SuggestionClosed(suggestion_id).into());
                }
                let report = self.close_expired_in_tx(tx, suggestion_id)?;
                return Ok(WithdrawOutcome::ClosedOnArrival(report));
            }
            if suggestion.author != actor {
                return Err(GovernanceError::unauthorized(actor, "withdraw this suggestion").into());
            }

            let state = suggestion.state.transition(SuggestionState::Withdrawn)?;
            let now = self.clock.now();
            let resolution = Resolution {
                state,
                reason: REASON_WITHDRAWN,
                resolved_at: now,
                resolved_by: actor,
            };
            if !tx.resolve_suggestion(suggestion_id, &resolution)? {
                return Err(GovernanceError::SuggestionClosed(suggestion_id).into());
            }

            let parameter = tx.get_parameter(&suggestion.parameter_id)?.ok_or_else(|| {
                GovernanceError::UnknownParameter(suggestion.parameter_id.clone())
            })?;
            let history = tx.append_history(&NewHistoryRecord {
                parameter_id: parameter.parameter_id,
                parameter_name: parameter.name,
                requested_value: suggestion.proposed_value.clone(),
                previous_value: Some(parameter.value),
                outcome: HistoryOutcome::Withdrawn,
                reason: Some(REASON_WITHDRAWN.to_string()),
                resolved_at: now,
                subject: SubjectRef::Suggestion(suggestion_id),
                actor: actor.to_string(),
            })?;

            Ok(WithdrawOutcome::Withdrawn(ResolutionReport {
                tally: tx.tally(suggestion_id)?,
                suggestion: Suggestion {
                    state,
                    resolved_at: Some(now),
                    resolution_reason: Some(REASON_WITHDRAWN.to_string()),
                    resolved_by: Some(actor.to_string()),
                    ..suggestion
                },
                history,
            }))
        })?;

        match outcome {
            WithdrawOutcome::Withdrawn(report) => {
                log_resolution(&report);
                Ok(report)
            }
            WithdrawOutcome::ClosedOnArrival(report) => {
                log_resolution(&report);
                Err(GovernanceError::SuggestionClosed(suggestion_id))
            }
        }
    }

    /// Closes every open, non-review suggestion whose deadline has passed.
    /// Losing a race to another closer is counted, not reported as an error.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Storage`] when the candidate list cannot be read.
    pub fn sweep_expired(&self) -> Result<SweepReport, GovernanceError> {
        let now = self.clock.now();
        let candidates = self.read(|store| Ok(store.list_expired_open(now)?))?;
        let mut report = SweepReport::default();

        for suggestion_id in candidates {
            let result = self.write_resolution(suggestion_id, |tx| {
                self.resolve_in_tx(tx, suggestion_id, Closer::Deadline)
            });
            match result {
                Ok(resolved) => {
                    log_resolution(&resolved);
                    report.resolved.push(resolved);
                }
                Err(GovernanceError::SuggestionClosed(_)) => report.already_closed += 1,
                Err(GovernanceError::ConcurrentCloseConflict(_)) => report.conflicts += 1,
                Err(err) => {
                    error!(suggestion_id = %suggestion_id, error = %err, "sweep failed to close suggestion");
                    report.failures += 1;
                }
            }
        }

        if report.conflicts > 0 {
            warn!(conflicts = report.conflicts, "sweep left suggestions open after retries");
        }
        Ok(report)
    }

    /// # Errors
    /// Returns [`GovernanceError::SuggestionNotFound`] for unknown ids.
    pub fn get_suggestion(
        &self,
        suggestion_id: SuggestionId,
    ) -> Result<SuggestionDetail, GovernanceError> {
        let now = self.clock.now();
        self.read(|store| {
            let suggestion = store
                .get_suggestion(suggestion_id)?
                .ok_or(GovernanceError::SuggestionNotFound(suggestion_id))?;
            Ok(SuggestionDetail {
                remaining_seconds: suggestion.remaining_seconds(now),
                tally: store.tally(suggestion_id)?,
                votes: store.list_votes(suggestion_id)?,
                comments: store.list_comments(suggestion_id)?,
                suggestion,
            })
        })
    }

    /// Suggestions in `state` (all when `None`), each with its live tally.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Storage`] on read failures.
    pub fn list_suggestions(
        &self,
        state: Option<SuggestionState>,
    ) -> Result<Vec<SuggestionView>, GovernanceError> {
        let now = self.clock.now();
        self.read(|store| {
            let mut views = Vec::new();
            for suggestion in store.list_suggestions(state)? {
                views.push(SuggestionView {
                    tally: store.tally(suggestion.suggestion_id)?,
                    remaining_seconds: suggestion.remaining_seconds(now),
                    suggestion,
                });
            }
            Ok(views)
        })
    }

    /// # Errors
    /// Returns [`GovernanceError::Storage`] on read failures.
    pub fn list_open_suggestions(&self) -> Result<Vec<SuggestionView>, GovernanceError> {
        self.list_suggestions(Some(SuggestionState::Open))
    }

    /// Closes `suggestion_id` from inside a vote transaction whose cast found
    /// the deadline already passed.
    pub(crate) fn close_expired_in_tx(
        &self,
        tx: &GovernanceTx<'_>,
        suggestion_id: SuggestionId,
    ) -> Result<ResolutionReport, WriteFailure> {
        self.resolve_in_tx(tx, suggestion_id, Closer::Deadline)
    }

    fn resolve_in_tx(
        &self,
        tx: &GovernanceTx<'_>,
        suggestion_id: SuggestionId,
        closer: Closer<'_>,
    ) -> Result<ResolutionReport, WriteFailure> {
        let suggestion = load_suggestion(tx, suggestion_id)?;
        if suggestion.state != SuggestionState::Open {
            return Err(GovernanceError::SuggestionClosed(suggestion_id).into());
        }

        let now = self.clock.now();
        let (resolved_by, forced) = match closer {
            Closer::Deadline => {
                if suggestion.requires_review || !suggestion.deadline_elapsed(now) {
                    return Err(GovernanceError::Validation(format!(
                        "suggestion {suggestion_id} is not eligible for a deadline close"
                    ))
                    .into());
                }
                (SYSTEM_ACTOR, None)
            }
            Closer::Actor { actor, forced } => {
                let privileged = self.config.is_privileged(actor);
                if suggestion.requires_review && !privileged {
                    return Err(GovernanceError::unauthorized(
                        actor,
                        "close a suggestion under review",
                    )
                    .into());
                }
                if !privileged && !suggestion.deadline_elapsed(now) {
                    return Err(GovernanceError::unauthorized(
                        actor,
                        "close a suggestion before its voting deadline",
                    )
                    .into());
                }
                if forced.is_some() && !suggestion.requires_review {
                    return Err(GovernanceError::Validation(
                        "a forced outcome only applies to suggestions under review".to_string(),
                    )
                    .into());
                }
                (actor, forced)
            }
        };

        let tallying = suggestion.state.transition(SuggestionState::Tallying)?;
        let tally = tx.tally(suggestion_id)?;
        let (state, reason) = match forced {
            Some(ReviewDecision::Accept) => (SuggestionState::Accepted, REASON_REVIEW_ACCEPTED),
            Some(ReviewDecision::Reject) => (SuggestionState::Rejected, REASON_REVIEW_REJECTED),
            None => match self.rule.resolve(&tally) {
                decision @ Decision::Accepted => (SuggestionState::Accepted, decision.reason()),
                decision @ Decision::Rejected(_) => {
                    (SuggestionState::Rejected, decision.reason())
                }
            },
        };
        let state = tallying.transition(state)?;

        let parameter = tx.get_parameter(&suggestion.parameter_id)?.ok_or_else(|| {
            GovernanceError::UnknownParameter(suggestion.parameter_id.clone())
        })?;

        let resolution = Resolution {
            state,
            reason,
            resolved_at: now,
            resolved_by,
        };
        if !tx.resolve_suggestion(suggestion_id, &resolution)? {
            return Err(GovernanceError::SuggestionClosed(suggestion_id).into());
        }

        let subject = SubjectRef::Suggestion(suggestion_id);
        let outcome = state
            .history_outcome()
            .ok_or_else(|| GovernanceError::Validation("resolution is not terminal".to_string()))?;
        if outcome == HistoryOutcome::Accepted {
            tx.apply_parameter_change(
                &parameter.parameter_id,
                &suggestion.proposed_value,
                now,
                subject,
            )?;
        }

        let history = tx.append_history(&NewHistoryRecord {
            parameter_id: parameter.parameter_id,
            parameter_name: parameter.name,
            requested_value: suggestion.proposed_value.clone(),
            previous_value: Some(parameter.value),
            outcome,
            reason: Some(reason.to_string()),
            resolved_at: now,
            subject,
            actor: resolved_by.to_string(),
        })?;

        Ok(ResolutionReport {
            suggestion: Suggestion {
                state,
                resolved_at: Some(now),
                resolution_reason: Some(reason.to_string()),
                resolved_by: Some(resolved_by.to_string()),
                ..suggestion
            },
            tally,
            history,
        })
    }
}

pub(crate) fn load_suggestion(
    tx: &GovernanceTx<'_>,
    suggestion_id: SuggestionId,
) -> Result<Suggestion, WriteFailure> {
    Ok(tx
        .get_suggestion(suggestion_id)?
        .ok_or(GovernanceError::SuggestionNotFound(suggestion_id))?)
}

fn log_resolution(report: &ResolutionReport) {
    info!(
        suggestion_id = %report.suggestion.suggestion_id,
        parameter_id = %report.suggestion.parameter_id,
        state = report.suggestion.state.as_str(),
        reason = report.history.reason.as_deref().unwrap_or_default(),
        affirm = report.tally.affirm,
        reject = report.tally.reject,
        abstain = report.tally.abstain,
        "suggestion resolved"
    );
}
