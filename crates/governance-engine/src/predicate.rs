//! Default predicate language for policies.
//!
//! A predicate is one or more clauses joined by `&&`; all clauses must hold.
//!
//! | clause                   | matches when                                   |
//! |--------------------------|------------------------------------------------|
//! | `*`                      | always                                         |
//! | `parameter=<id>`         | the target parameter id equals `<id>`          |
//! | `value=<v>`              | the proposed value equals `<v>`                |
//! | `value-contains:<s>`     | the proposed value contains `<s>` (ASCII case-insensitive) |
//! | `rationale-contains:<s>` | the rationale contains `<s>` (ASCII case-insensitive)      |

use governance_core::{GovernanceError, PredicateEvaluator, SuggestionDraft};

#[derive(Debug, Clone, Copy, Default)]
pub struct ClauseEvaluator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause<'a> {
    Any,
    Parameter(&'a str),
    Value(&'a str),
    ValueContains(&'a str),
    RationaleContains(&'a str),
}

impl<'a> Clause<'a> {
    fn parse(raw: &'a str) -> Result<Self, GovernanceError> {
        let clause = raw.trim();
        if clause == "*" {
            return Ok(Self::Any);
        }

        let parsed = if let Some(rest) = clause.strip_prefix("parameter=") {
            Self::Parameter(rest.trim())
        } else if let Some(rest) = clause.strip_prefix("value=") {
            Self::Value(rest.trim())
        } else if let Some(rest) = clause.strip_prefix("value-contains:") {
            Self::ValueContains(rest.trim())
        } else if let Some(rest) = clause.strip_prefix("rationale-contains:") {
            Self::RationaleContains(rest.trim())
        } else {
            return Err(GovernanceError::Validation(format!(
                "unknown predicate clause: {clause:?}"
            )));
        };

        match parsed {
            Self::Parameter(arg) | Self::ValueContains(arg) | Self::RationaleContains(arg)
                if arg.is_empty() =>
            {
                Err(GovernanceError::Validation(format!(
                    "predicate clause {clause:?} is missing its argument"
                )))
            }
            other => Ok(other),
        }
    }

    fn holds(self, draft: &SuggestionDraft) -> bool {
        match self {
            Self::Any => true,
            Self::Parameter(id) => draft.parameter_id == id,
            Self::Value(value) => draft.proposed_value == value,
            Self::ValueContains(needle) => contains_ignore_case(&draft.proposed_value, needle),
            Self::RationaleContains(needle) => contains_ignore_case(&draft.rationale, needle),
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

impl PredicateEvaluator for ClauseEvaluator {
    fn matches(&self, predicate: &str, draft: &SuggestionDraft) -> Result<bool, GovernanceError> {
        if predicate.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "predicate cannot be empty".to_string(),
            ));
        }

        // All clauses are parsed before any is evaluated.
        let clauses = predicate
            .split("&&")
            .map(Clause::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(clauses.into_iter().all(|clause| clause.holds(draft)))
    }
}
