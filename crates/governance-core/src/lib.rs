//! Domain model for parameter governance: parameters, suggestions, votes,
//! comments, policies and the history ledger, plus the pure decision logic
//! (policy gating in [`policy`], tallying and resolution rules in [`tally`]).
//!
//! Storage and orchestration live in the `governance-store-sqlite` and
//! `governance-engine` crates; nothing here performs I/O.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod policy;
pub mod tally;

pub use policy::{evaluate_policies, PolicyEvaluation, PolicyVerdict, PredicateEvaluator, SuggestionDraft};
pub use tally::{Decision, MajorityWithQuorum, RejectionReason, ResolutionRule, Supermajority, Tally};

pub const MAX_ACTOR_LEN: usize = 128;
pub const MAX_VALUE_LEN: usize = 4096;
pub const MAX_TEXT_LEN: usize = 4000;

pub const REASON_POLICY_BLOCKED: &str = "policy-blocked";
pub const REASON_WITHDRAWN: &str = "withdrawn";
pub const REASON_ADMIN_OVERRIDE: &str = "admin-override";
pub const REASON_REGISTERED: &str = "registered";
pub const REASON_REVIEW_ACCEPTED: &str = "review-accepted";
pub const REASON_REVIEW_REJECTED: &str = "review-rejected";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GovernanceError {
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("suggestion not found: {0}")]
    SuggestionNotFound(SuggestionId),
    #[error("suggestion {0} is closed")]
    SuggestionClosed(SuggestionId),
    #[error("invalid vote choice: {0:?} (expected affirm, reject or abstain)")]
    InvalidChoice(String),
    #[error("actor {actor:?} is not authorized to {action}")]
    Unauthorized { actor: String, action: String },
    #[error("concurrent close conflict on suggestion {0}")]
    ConcurrentCloseConflict(SuggestionId),
    #[error("policy not found: {0}")]
    PolicyNotFound(PolicyId),
    #[error("history record not found: {0}")]
    HistoryRecordNotFound(RecordId),
    #[error("parameter already exists: {0}")]
    ParameterExists(String),
    #[error("parameter {0} is not open to suggestions")]
    ParameterNotEditable(String),
    #[error("invalid value for parameter {parameter_id}: {message}")]
    InvalidValue {
        parameter_id: String,
        message: String,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl GovernanceError {
    /// Stable machine-readable error code for CLI and HTTP payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownParameter(_) => "unknown_parameter",
            Self::SuggestionNotFound(_) => "suggestion_not_found",
            Self::SuggestionClosed(_) => "suggestion_closed",
            Self::InvalidChoice(_) => "invalid_choice",
            Self::Unauthorized { .. } => "unauthorized",
            Self::ConcurrentCloseConflict(_) => "concurrent_close_conflict",
            Self::PolicyNotFound(_) => "policy_not_found",
            Self::HistoryRecordNotFound(_) => "history_record_not_found",
            Self::ParameterExists(_) => "parameter_exists",
            Self::ParameterNotEditable(_) => "parameter_not_editable",
            Self::InvalidValue { .. } => "invalid_value",
            Self::Validation(_) => "validation_error",
            Self::Configuration(_) => "configuration_error",
            Self::Storage(_) => "storage_error",
        }
    }

    #[must_use]
    pub fn unauthorized(actor: &str, action: &str) -> Self {
        Self::Unauthorized {
            actor: actor.to_string(),
            action: action.to_string(),
        }
    }
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = GovernanceError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(value).map(Self).map_err(|err| {
                    GovernanceError::Validation(format!(
                        "invalid {} ULID {value:?}: {err}",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

ulid_id!(SuggestionId);
ulid_id!(PolicyId);
ulid_id!(CommentId);
ulid_id!(RecordId);

/// What caused a parameter change: a governed suggestion or an
/// administrative write that bypassed voting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(into = "String", try_from = "String")]
pub enum SubjectRef {
    Suggestion(SuggestionId),
    AdminOverride(Ulid),
}

impl SubjectRef {
    #[must_use]
    pub fn new_admin_override() -> Self {
        Self::AdminOverride(Ulid::new())
    }

    #[must_use]
    pub fn suggestion_id(self) -> Option<SuggestionId> {
        match self {
            Self::Suggestion(id) => Some(id),
            Self::AdminOverride(_) => None,
        }
    }

    /// Parses `suggestion:<ulid>` or `admin:<ulid>`.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] for any other shape.
    pub fn parse(raw: &str) -> Result<Self, GovernanceError> {
        let invalid =
            || GovernanceError::Validation(format!("invalid subject reference: {raw:?}"));
        let (prefix, id) = raw.split_once(':').ok_or_else(invalid)?;
        let ulid = Ulid::from_string(id).map_err(|_| invalid())?;
        match prefix {
            "suggestion" => Ok(Self::Suggestion(SuggestionId(ulid))),
            "admin" => Ok(Self::AdminOverride(ulid)),
            _ => Err(invalid()),
        }
    }
}

impl Display for SubjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Suggestion(id) => write!(f, "suggestion:{id}"),
            Self::AdminOverride(id) => write!(f, "admin:{id}"),
        }
    }
}

impl From<SubjectRef> for String {
    fn from(value: SubjectRef) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for SubjectRef {
    type Error = GovernanceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Boolean,
    Integer,
    String,
    List,
}

impl ValueType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::String => "string",
            Self::List => "list",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "boolean" => Some(Self::Boolean),
            "integer" => Some(Self::Integer),
            "string" => Some(Self::String),
            "list" => Some(Self::List),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigParameter {
    pub parameter_id: String,
    pub name: String,
    pub value: String,
    pub value_type: ValueType,
    pub min_value: Option<i64>,
    pub max_value: Option<i64>,
    pub editable: bool,
    pub description: String,
    pub last_modified_at: OffsetDateTime,
    pub last_modified_by: SubjectRef,
}

impl ConfigParameter {
    /// Checks a candidate value against this parameter's type and bounds.
    ///
    /// # Errors
    /// Returns [`GovernanceError::InvalidValue`] when the value does not fit.
    pub fn validate_value(&self, value: &str) -> Result<(), GovernanceError> {
        check_value(
            &self.parameter_id,
            self.value_type,
            self.min_value,
            self.max_value,
            value,
        )
    }
}

/// Input for registering a new governed parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParameterDefinition {
    pub parameter_id: String,
    pub name: String,
    pub value: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub min_value: Option<i64>,
    #[serde(default)]
    pub max_value: Option<i64>,
    #[serde(default = "default_editable")]
    pub editable: bool,
    #[serde(default)]
    pub description: String,
}

fn default_editable() -> bool {
    true
}

impl ParameterDefinition {
    /// Validates identifiers, bounds and the initial value.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] or
    /// [`GovernanceError::InvalidValue`] describing the first violation.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        validate_parameter_id(&self.parameter_id)?;

        if self.name.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "parameter name MUST be provided".to_string(),
            ));
        }

        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                return Err(GovernanceError::Validation(format!(
                    "min_value {min} exceeds max_value {max}"
                )));
            }
        }

        if self.value_type != ValueType::Integer
            && (self.min_value.is_some() || self.max_value.is_some())
        {
            return Err(GovernanceError::Validation(
                "min_value/max_value only apply to integer parameters".to_string(),
            ));
        }

        check_value(
            &self.parameter_id,
            self.value_type,
            self.min_value,
            self.max_value,
            &self.value,
        )
    }
}

fn check_value(
    parameter_id: &str,
    value_type: ValueType,
    min_value: Option<i64>,
    max_value: Option<i64>,
    value: &str,
) -> Result<(), GovernanceError> {
    let invalid = |message: String| GovernanceError::InvalidValue {
        parameter_id: parameter_id.to_string(),
        message,
    };

    if value.len() > MAX_VALUE_LEN {
        return Err(invalid(format!("value exceeds {MAX_VALUE_LEN} bytes")));
    }

    match value_type {
        ValueType::Boolean => {
            if !value.eq_ignore_ascii_case("true") && !value.eq_ignore_ascii_case("false") {
                return Err(invalid(format!("expected true or false, got {value:?}")));
            }
        }
        ValueType::Integer => {
            let parsed: i64 = value
                .trim()
                .parse()
                .map_err(|_| invalid(format!("expected an integer, got {value:?}")))?;
            if let Some(min) = min_value {
                if parsed < min {
                    return Err(invalid(format!("{parsed} is below minimum {min}")));
                }
            }
            if let Some(max) = max_value {
                if parsed > max {
                    return Err(invalid(format!("{parsed} is above maximum {max}")));
                }
            }
        }
        ValueType::String | ValueType::List => {}
    }

    Ok(())
}

/// Parameter ids are stable slugs: lowercase ASCII, digits, `.`, `_`, `-`.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] for empty or malformed ids.
pub fn validate_parameter_id(parameter_id: &str) -> Result<(), GovernanceError> {
    if parameter_id.is_empty() || parameter_id.len() > MAX_ACTOR_LEN {
        return Err(GovernanceError::Validation(format!(
            "parameter_id MUST be 1..={MAX_ACTOR_LEN} characters"
        )));
    }

    let valid = parameter_id.chars().all(|ch| {
        ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-')
    });
    if !valid {
        return Err(GovernanceError::Validation(format!(
            "parameter_id {parameter_id:?} MUST match [a-z0-9._-]+"
        )));
    }

    Ok(())
}

/// # Errors
/// Returns [`GovernanceError::Validation`] when the actor id is blank or too long.
pub fn validate_actor(actor: &str) -> Result<(), GovernanceError> {
    if actor.trim().is_empty() {
        return Err(GovernanceError::Validation(
            "actor MUST be provided for every write".to_string(),
        ));
    }
    if actor.len() > MAX_ACTOR_LEN {
        return Err(GovernanceError::Validation(format!(
            "actor MUST be at most {MAX_ACTOR_LEN} characters"
        )));
    }
    Ok(())
}

/// # Errors
/// Returns [`GovernanceError::Validation`] when free text is blank or too long.
pub fn validate_text(field: &str, text: &str) -> Result<(), GovernanceError> {
    if text.trim().is_empty() {
        return Err(GovernanceError::Validation(format!("{field} cannot be empty")));
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(GovernanceError::Validation(format!(
            "{field} MUST be at most {MAX_TEXT_LEN} characters"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionState {
    Draft,
    PolicyCheck,
    Open,
    Tallying,
    Accepted,
    Rejected,
    Withdrawn,
}

impl SuggestionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PolicyCheck => "policy_check",
            Self::Open => "open",
            Self::Tallying => "tallying",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Withdrawn => "withdrawn",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "policy_check" => Some(Self::PolicyCheck),
            "open" => Some(Self::Open),
            "tallying" => Some(Self::Tallying),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "withdrawn" => Some(Self::Withdrawn),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Withdrawn)
    }

    /// The ledger outcome recorded when a suggestion reaches this state.
    #[must_use]
    pub fn history_outcome(self) -> Option<HistoryOutcome> {
        match self {
            Self::Accepted => Some(HistoryOutcome::Accepted),
            Self::Rejected => Some(HistoryOutcome::Rejected),
            Self::Withdrawn => Some(HistoryOutcome::Withdrawn),
            _ => None,
        }
    }

    /// Moves along the lifecycle graph.
    ///
    /// ```text
    /// Draft -> PolicyCheck -> Open -> Tallying -> Accepted | Rejected
    ///          PolicyCheck -> Rejected            (blocked by policy)
    /// Draft | Open -> Withdrawn
    /// ```
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] for an edge outside the graph.
    pub fn transition(self, next: Self) -> Result<Self, GovernanceError> {
        let allowed = matches!(
            (self, next),
            (Self::Draft | Self::Open, Self::Withdrawn)
                | (Self::Draft, Self::PolicyCheck)
                | (Self::PolicyCheck, Self::Open | Self::Rejected)
                | (Self::Open, Self::Tallying)
                | (Self::Tallying, Self::Accepted | Self::Rejected)
        );

        if allowed {
            Ok(next)
        } else {
            Err(GovernanceError::Validation(format!(
                "illegal suggestion transition {} -> {}",
                self.as_str(),
                next.as_str()
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Suggestion {
    pub suggestion_id: SuggestionId,
    pub parameter_id: String,
    pub proposed_value: String,
    pub rationale: String,
    pub author: String,
    pub state: SuggestionState,
    pub created_at: OffsetDateTime,
    pub opened_at: Option<OffsetDateTime>,
    pub voting_deadline: Option<OffsetDateTime>,
    pub resolved_at: Option<OffsetDateTime>,
    pub resolution_reason: Option<String>,
    pub resolved_by: Option<String>,
    pub requires_review: bool,
    pub policy_revision: i64,
    pub matched_policy_ids: Vec<PolicyId>,
}

impl Suggestion {
    #[must_use]
    pub fn deadline_elapsed(&self, now: OffsetDateTime) -> bool {
        self.state == SuggestionState::Open
            && self.voting_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Whole seconds left in the voting window; zero once elapsed or closed.
    #[must_use]
    pub fn remaining_seconds(&self, now: OffsetDateTime) -> i64 {
        if self.state != SuggestionState::Open {
            return 0;
        }
        self.voting_deadline
            .map_or(0, |deadline| (deadline - now).whole_seconds().max(0))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Affirm,
    Reject,
    Abstain,
}

impl VoteChoice {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Affirm => "affirm",
            Self::Reject => "reject",
            Self::Abstain => "abstain",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "affirm" => Some(Self::Affirm),
            "reject" => Some(Self::Reject),
            "abstain" => Some(Self::Abstain),
            _ => None,
        }
    }
}

impl FromStr for VoteChoice {
    type Err = GovernanceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value.trim()).ok_or_else(|| GovernanceError::InvalidChoice(value.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub suggestion_id: SuggestionId,
    pub voter: String,
    pub choice: VoteChoice,
    pub cast_at: OffsetDateTime,
    pub revision: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub comment_id: CommentId,
    pub suggestion_id: SuggestionId,
    pub author: String,
    pub text: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    Block,
    RequireReview,
    #[serde(rename = "none")]
    Informational,
}

impl PolicyEffect {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::RequireReview => "require_review",
            Self::Informational => "none",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "block" => Some(Self::Block),
            "require_review" | "require-review" => Some(Self::RequireReview),
            "none" | "informational" => Some(Self::Informational),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    pub policy_id: PolicyId,
    pub priority: i64,
    pub predicate: String,
    pub effect: PolicyEffect,
    pub description: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyInput {
    pub priority: i64,
    pub predicate: String,
    pub effect: PolicyEffect,
    #[serde(default)]
    pub description: String,
}

impl PolicyInput {
    /// # Errors
    /// Returns [`GovernanceError::Validation`] when the predicate is blank or too long.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        validate_text("predicate", &self.predicate)?;
        if self.description.chars().count() > MAX_TEXT_LEN {
            return Err(GovernanceError::Validation(format!(
                "description MUST be at most {MAX_TEXT_LEN} characters"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyChangeAction {
    Created,
    Updated,
    Deleted,
}

impl PolicyChangeAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyChangeRecord {
    pub change_seq: i64,
    pub policy_id: PolicyId,
    pub action: PolicyChangeAction,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub actor: String,
    pub changed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOutcome {
    Accepted,
    Rejected,
    Withdrawn,
}

impl HistoryOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Withdrawn => "withdrawn",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "withdrawn" => Some(Self::Withdrawn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRecord {
    pub history_seq: i64,
    pub record_id: RecordId,
    pub parameter_id: String,
    pub parameter_name: String,
    pub requested_value: String,
    pub previous_value: Option<String>,
    pub outcome: HistoryOutcome,
    pub reason: Option<String>,
    pub resolved_at: OffsetDateTime,
    pub subject: SubjectRef,
    pub actor: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryQuery {
    #[serde(default)]
    pub parameter_id: Option<String>,
    #[serde(default)]
    pub from: Option<OffsetDateTime>,
    #[serde(default)]
    pub to: Option<OffsetDateTime>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryQuery {
    /// # Errors
    /// Returns [`GovernanceError::Validation`] when `from` is after `to`.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(GovernanceError::Validation(
                    "history range start MUST NOT be after its end".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionRuleConfig {
    MajorityWithQuorum,
    Supermajority { ratio: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GovernanceConfig {
    pub config_version: u32,
    pub quorum: u32,
    pub voting_window_secs: i64,
    pub resolution_rule: ResolutionRuleConfig,
    #[serde(default)]
    pub privileged_actors: BTreeSet<String>,
    pub resolution_retry_limit: u32,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self::v1()
    }
}

impl GovernanceConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            quorum: 3,
            voting_window_secs: 2 * 24 * 60 * 60,
            resolution_rule: ResolutionRuleConfig::MajorityWithQuorum,
            privileged_actors: BTreeSet::new(),
            resolution_retry_limit: 5,
        }
    }

    /// Validates numeric bounds and the rule parameters.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Configuration`] when a field is out of range.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if self.config_version == 0 {
            return Err(GovernanceError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        if self.quorum == 0 {
            return Err(GovernanceError::Configuration(
                "quorum MUST be >= 1".to_string(),
            ));
        }

        if self.voting_window_secs <= 0 {
            return Err(GovernanceError::Configuration(
                "voting_window_secs MUST be > 0".to_string(),
            ));
        }

        if self.resolution_retry_limit == 0 {
            return Err(GovernanceError::Configuration(
                "resolution_retry_limit MUST be >= 1".to_string(),
            ));
        }

        if let ResolutionRuleConfig::Supermajority { ratio } = self.resolution_rule {
            if ratio.is_nan() || ratio <= 0.5 || ratio > 1.0 {
                return Err(GovernanceError::Configuration(
                    "supermajority ratio MUST be in (0.5, 1.0]".to_string(),
                ));
            }
        }

        for actor in &self.privileged_actors {
            validate_actor(actor).map_err(|err| GovernanceError::Configuration(err.to_string()))?;
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Configuration`] when decoding fails or a
    /// decoded value violates constraints.
    pub fn from_json(value: &Value) -> Result<Self, GovernanceError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            GovernanceError::Configuration(format!("invalid governance config JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn voting_window(&self) -> Duration {
        Duration::seconds(self.voting_window_secs)
    }

    #[must_use]
    pub fn is_privileged(&self, actor: &str) -> bool {
        self.privileged_actors.contains(actor)
    }

    #[must_use]
    pub fn build_rule(&self) -> Box<dyn ResolutionRule> {
        match self.resolution_rule {
            ResolutionRuleConfig::MajorityWithQuorum => Box::new(MajorityWithQuorum {
                quorum: self.quorum,
            }),
            ResolutionRuleConfig::Supermajority { ratio } => Box::new(Supermajority {
                quorum: self.quorum,
                ratio,
            }),
        }
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, GovernanceError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| GovernanceError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(GovernanceError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, GovernanceError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            GovernanceError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Integer ordering key for timestamps; saturates outside the i64 range.
#[must_use]
pub fn unix_nanos(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos()).unwrap_or(if value.unix_timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_parameter(value_type: ValueType) -> ConfigParameter {
        ConfigParameter {
            parameter_id: "spawn.radius".to_string(),
            name: "Spawn radius".to_string(),
            value: "16".to_string(),
            value_type,
            min_value: Some(0),
            max_value: Some(64),
            editable: true,
            description: String::new(),
            last_modified_at: must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z")),
            last_modified_by: SubjectRef::new_admin_override(),
        }
    }

    #[test]
    fn integer_values_respect_bounds() {
        let parameter = fixture_parameter(ValueType::Integer);
        assert!(parameter.validate_value("32").is_ok());
        assert!(matches!(
            parameter.validate_value("65"),
            Err(GovernanceError::InvalidValue { .. })
        ));
        assert!(parameter.validate_value("-1").is_err());
        assert!(parameter.validate_value("many").is_err());
    }

    #[test]
    fn boolean_values_are_case_insensitive() {
        let mut parameter = fixture_parameter(ValueType::Boolean);
        parameter.min_value = None;
        parameter.max_value = None;
        assert!(parameter.validate_value("TRUE").is_ok());
        assert!(parameter.validate_value("false").is_ok());
        assert!(parameter.validate_value("yes").is_err());
    }

    #[test]
    fn definition_rejects_bounds_on_non_integer_types() {
        let definition = ParameterDefinition {
            parameter_id: "motd".to_string(),
            name: "Message of the day".to_string(),
            value: "hello".to_string(),
            value_type: ValueType::String,
            min_value: Some(1),
            max_value: None,
            editable: true,
            description: String::new(),
        };
        assert!(matches!(
            definition.validate(),
            Err(GovernanceError::Validation(_))
        ));
    }

    #[test]
    fn parameter_ids_are_slugs() {
        assert!(validate_parameter_id("world.max-players").is_ok());
        assert!(validate_parameter_id("World Max").is_err());
        assert!(validate_parameter_id("").is_err());
    }

    #[test]
    fn lifecycle_graph_rejects_backward_edges() {
        assert_eq!(
            must_ok(SuggestionState::Draft.transition(SuggestionState::PolicyCheck)),
            SuggestionState::PolicyCheck
        );
        assert!(SuggestionState::Accepted
            .transition(SuggestionState::Open)
            .is_err());
        assert!(SuggestionState::Rejected
            .transition(SuggestionState::Withdrawn)
            .is_err());
        assert!(SuggestionState::Open
            .transition(SuggestionState::Accepted)
            .is_err());
    }

    #[test]
    fn subject_ref_round_trips_through_json() {
        let subject = SubjectRef::Suggestion(SuggestionId::new());
        let value = must_ok(serde_json::to_value(subject));
        let text = value.as_str().unwrap_or_default().to_string();
        assert!(text.starts_with("suggestion:"));
        let decoded: SubjectRef = must_ok(serde_json::from_value(value));
        assert_eq!(decoded, subject);
        assert!(SubjectRef::parse("other:01J0SQQP7M70P6Y3R4T8D8G8M2").is_err());
    }

    #[test]
    fn vote_choice_parse_rejects_unknown_values() {
        assert_eq!(must_ok("affirm".parse::<VoteChoice>()), VoteChoice::Affirm);
        assert!(matches!(
            "yes".parse::<VoteChoice>(),
            Err(GovernanceError::InvalidChoice(_))
        ));
    }

    #[test]
    fn config_from_json_validates_ratio() {
        let value = json!({
            "config_version": 1,
            "quorum": 2,
            "voting_window_secs": 60,
            "resolution_rule": {"kind": "supermajority", "ratio": 0.4},
            "resolution_retry_limit": 3
        });
        assert!(matches!(
            GovernanceConfig::from_json(&value),
            Err(GovernanceError::Configuration(_))
        ));

        let value = json!({
            "config_version": 1,
            "quorum": 2,
            "voting_window_secs": 60,
            "resolution_rule": {"kind": "majority_with_quorum"},
            "privileged_actors": ["admin"],
            "resolution_retry_limit": 3
        });
        let config = must_ok(GovernanceConfig::from_json(&value));
        assert!(config.is_privileged("admin"));
        assert_eq!(config.build_rule().name(), "majority_with_quorum");
    }

    #[test]
    fn remaining_seconds_is_zero_after_deadline() {
        let created = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        let suggestion = Suggestion {
            suggestion_id: SuggestionId::new(),
            parameter_id: "spawn.radius".to_string(),
            proposed_value: "20".to_string(),
            rationale: "more room".to_string(),
            author: "alice".to_string(),
            state: SuggestionState::Open,
            created_at: created,
            opened_at: Some(created),
            voting_deadline: Some(created + Duration::minutes(10)),
            resolved_at: None,
            resolution_reason: None,
            resolved_by: None,
            requires_review: false,
            policy_revision: 0,
            matched_policy_ids: Vec::new(),
        };

        assert_eq!(suggestion.remaining_seconds(created + Duration::minutes(4)), 360);
        assert_eq!(suggestion.remaining_seconds(created + Duration::minutes(11)), 0);
        assert!(suggestion.deadline_elapsed(created + Duration::minutes(10)));
    }
}
