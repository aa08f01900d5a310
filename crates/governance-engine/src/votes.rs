use governance_core::{
    validate_actor, GovernanceError, SuggestionId, SuggestionState, Tally, VoteChoice,
};
use tracing::info;

use crate::lifecycle::{load_suggestion, ResolutionReport};
use crate::GovernanceApi;

enum CastOutcome {
    Recorded(Tally),
    /// The deadline had passed on arrival; the cast closed the suggestion instead.
    ClosedOnArrival(Box<ResolutionReport>),
}

impl GovernanceApi {
    /// Records `voter`'s choice, replacing any earlier vote by the same voter.
    /// Returns the tally including this vote.
    ///
    /// # Errors
    /// Returns [`GovernanceError::SuggestionNotFound`],
    /// [`GovernanceError::SuggestionClosed`] once the suggestion is terminal or
    /// its deadline has passed, and [`GovernanceError::InvalidChoice`].
    pub fn cast_vote(
        &self,
        suggestion_id: SuggestionId,
        voter: &str,
        choice: &str,
    ) -> Result<Tally, GovernanceError> {
        validate_actor(voter)?;

        let outcome = self.write(|tx| {
            let suggestion = load_suggestion(tx, suggestion_id)?;
            if suggestion.state != SuggestionState::Open {
                return Err(GovernanceError::SuggestionClosed(suggestion_id).into());
            }
            let choice = choice.parse::<VoteChoice>()?;

            let now = self.clock.now();
            if suggestion.deadline_elapsed(now) {
                if suggestion.requires_review {
                    return Err(GovernanceError::SuggestionClosed(suggestion_id).into());
                }
                let report = self.close_expired_in_tx(tx, suggestion_id)?;
                return Ok(CastOutcome::ClosedOnArrival(Box::new(report)));
            }

            let vote = tx.upsert_vote(suggestion_id, voter, choice, now)?;
            info!(
                suggestion_id = %suggestion_id,
                voter = %vote.voter,
                choice = vote.choice.as_str(),
                revision = vote.revision,
                "vote recorded"
            );
            Ok(CastOutcome::Recorded(tx.tally(suggestion_id)?))
        })?;

        match outcome {
            CastOutcome::Recorded(tally) => Ok(tally),
            CastOutcome::ClosedOnArrival(report) => {
                info!(
                    suggestion_id = %suggestion_id,
                    state = report.suggestion.state.as_str(),
                    "late vote closed expired suggestion"
                );
                Err(GovernanceError::SuggestionClosed(suggestion_id))
            }
        }
    }

    /// Current counts for a suggestion in any state.
    ///
    /// # Errors
    /// Returns [`GovernanceError::SuggestionNotFound`] for unknown ids.
    pub fn tally(&self, suggestion_id: SuggestionId) -> Result<Tally, GovernanceError> {
        self.read(|store| {
            if store.get_suggestion(suggestion_id)?.is_none() {
                return Err(GovernanceError::SuggestionNotFound(suggestion_id).into());
            }
            Ok(store.tally(suggestion_id)?)
        })
    }
}
