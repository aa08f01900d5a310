//! Policy gating for new suggestions.
//!
//! Policies are evaluated in ascending priority with the policy id as
//! tie-break. The first matching `block` policy short-circuits; otherwise any
//! matching `require_review` policy flags the suggestion for review.
//! Predicate text is opaque here and interpreted by a [`PredicateEvaluator`].

use serde::{Deserialize, Serialize};

use crate::{GovernanceError, Policy, PolicyEffect, PolicyId};

/// The candidate suggestion as seen by policy predicates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuggestionDraft {
    pub parameter_id: String,
    pub proposed_value: String,
    pub rationale: String,
    pub author: String,
}

pub trait PredicateEvaluator: Send + Sync {
    /// Decides whether `predicate` matches `draft`.
    ///
    /// # Errors
    /// Returns an error when the predicate cannot be interpreted.
    fn matches(&self, predicate: &str, draft: &SuggestionDraft) -> Result<bool, GovernanceError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyVerdict {
    Block,
    RequireReview,
    #[serde(rename = "none")]
    Proceed,
}

impl PolicyVerdict {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::RequireReview => "require_review",
            Self::Proceed => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyEvaluation {
    pub verdict: PolicyVerdict,
    /// Matching policies in evaluation order, up to and including a block.
    pub matched: Vec<PolicyId>,
}

/// Runs every policy against the draft and folds the effects into a verdict.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] when the evaluator fails on any
/// predicate; no partial verdict is produced.
pub fn evaluate_policies(
    draft: &SuggestionDraft,
    policies: &[Policy],
    evaluator: &dyn PredicateEvaluator,
) -> Result<PolicyEvaluation, GovernanceError> {
    let mut ordered: Vec<&Policy> = policies.iter().collect();
    ordered.sort_by(|left, right| {
        left.priority
            .cmp(&right.priority)
            .then_with(|| left.policy_id.cmp(&right.policy_id))
    });

    let mut matched = Vec::new();
    let mut verdict = PolicyVerdict::Proceed;

    for policy in ordered {
        let hit = evaluator
            .matches(&policy.predicate, draft)
            .map_err(|err| {
                let message = match err {
                    GovernanceError::Validation(message) => message,
                    other => other.to_string(),
                };
                GovernanceError::Validation(format!(
                    "policy {} predicate failed: {message}",
                    policy.policy_id
                ))
            })?;
        if !hit {
            continue;
        }

        matched.push(policy.policy_id);
        match policy.effect {
            PolicyEffect::Block => {
                return Ok(PolicyEvaluation {
                    verdict: PolicyVerdict::Block,
                    matched,
                });
            }
            PolicyEffect::RequireReview => verdict = PolicyVerdict::RequireReview,
            PolicyEffect::Informational => {}
        }
    }

    Ok(PolicyEvaluation { verdict, matched })
}
