//! Governance engine: the operation surface shared by the CLI and the HTTP
//! service.
//!
//! [`GovernanceApi`] is a cheap, cloneable handle. Every operation opens its
//! own `SQLite` connection, so concurrent callers only contend on `SQLite`'s
//! write lock and never on process-wide state.

use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use governance_core::{
    Comment, GovernanceConfig, GovernanceError, PredicateEvaluator, ResolutionRule, Suggestion,
    SuggestionId, Tally, Vote,
};
use governance_store_sqlite::{is_transient, GovernanceTx, SqliteGovernanceStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

mod admin;
mod clock;
mod comments;
mod history;
mod lifecycle;
mod predicate;
mod votes;

pub use admin::ParameterChange;
pub use clock::{Clock, ManualClock, SystemClock};
pub use lifecycle::{ResolutionReport, ReviewDecision, SubmitSuggestion, SweepReport};
pub use predicate::ClauseEvaluator;

/// Actor recorded on resolutions the engine performs on its own
/// (policy blocks, deadline closes).
pub const SYSTEM_ACTOR: &str = "system";

const RETRY_BASE_DELAY: Duration = Duration::from_millis(20);
const RETRY_MAX_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuggestionView {
    pub suggestion: Suggestion,
    pub tally: Tally,
    pub remaining_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuggestionDetail {
    pub suggestion: Suggestion,
    pub tally: Tally,
    pub remaining_seconds: i64,
    pub votes: Vec<Vote>,
    pub comments: Vec<Comment>,
}

#[derive(Clone)]
pub struct GovernanceApi {
    db_path: PathBuf,
    config: Arc<GovernanceConfig>,
    rule: Arc<dyn ResolutionRule>,
    evaluator: Arc<dyn PredicateEvaluator>,
    clock: Arc<dyn Clock>,
}

impl Debug for GovernanceApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceApi")
            .field("db_path", &self.db_path)
            .field("config", &self.config)
            .field("rule", &self.rule)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Failure inside a write transaction: either a domain rejection that must
/// reach the caller unchanged, or a storage error that may be retried.
pub(crate) enum WriteFailure {
    Domain(GovernanceError),
    Storage(anyhow::Error),
}

impl From<GovernanceError> for WriteFailure {
    fn from(value: GovernanceError) -> Self {
        Self::Domain(value)
    }
}

impl From<anyhow::Error> for WriteFailure {
    fn from(value: anyhow::Error) -> Self {
        Self::Storage(value)
    }
}

impl WriteFailure {
    fn into_governance(self) -> GovernanceError {
        match self {
            Self::Domain(err) => err,
            Self::Storage(err) => storage_error(&err),
        }
    }
}

pub(crate) fn storage_error(err: &anyhow::Error) -> GovernanceError {
    GovernanceError::Storage(format!("{err:#}"))
}

/// Reads a JSON [`GovernanceConfig`] from `path`. A missing file yields the
/// v1 defaults.
///
/// # Errors
/// Returns [`GovernanceError::Configuration`] when the file cannot be read or
/// does not decode into a valid configuration.
pub fn load_config(path: &Path) -> Result<GovernanceConfig, GovernanceError> {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(GovernanceConfig::v1());
        }
        Err(err) => {
            return Err(GovernanceError::Configuration(format!(
                "failed to read {}: {err}",
                path.display()
            )))
        }
    };

    let value: serde_json::Value = serde_json::from_str(&body).map_err(|err| {
        GovernanceError::Configuration(format!("{} is not valid JSON: {err}", path.display()))
    })?;
    GovernanceConfig::from_json(&value)
}

impl GovernanceApi {
    /// Builds a handle over the database at `db_path` with the default clause
    /// evaluator and the system clock. No I/O happens here.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Configuration`] when `config` is invalid.
    pub fn new(
        db_path: impl Into<PathBuf>,
        config: GovernanceConfig,
    ) -> Result<Self, GovernanceError> {
        config.validate()?;
        let rule: Arc<dyn ResolutionRule> = Arc::from(config.build_rule());
        Ok(Self {
            db_path: db_path.into(),
            config: Arc::new(config),
            rule,
            evaluator: Arc::new(ClauseEvaluator),
            clock: Arc::new(SystemClock),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn PredicateEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    #[must_use]
    pub fn with_rule(mut self, rule: Arc<dyn ResolutionRule>) -> Self {
        self.rule = rule;
        self
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Applies the schema. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Storage`] when the database cannot be opened
    /// or migrated.
    pub fn migrate(&self) -> Result<(), GovernanceError> {
        let store = self.open_store()?;
        store.migrate().map_err(|err| storage_error(&err))
    }

    /// # Errors
    /// Returns [`GovernanceError::Storage`] when the database cannot be read.
    pub fn schema_ready(&self) -> Result<bool, GovernanceError> {
        let store = self.open_store()?;
        store.is_migrated().map_err(|err| storage_error(&err))
    }

    pub(crate) fn open_store(&self) -> Result<SqliteGovernanceStore, GovernanceError> {
        SqliteGovernanceStore::open(&self.db_path).map_err(|err| storage_error(&err))
    }

    pub(crate) fn read<T>(
        &self,
        op: impl FnOnce(&SqliteGovernanceStore) -> Result<T, WriteFailure>,
    ) -> Result<T, GovernanceError> {
        let store = self.open_store()?;
        op(&store).map_err(WriteFailure::into_governance)
    }

    /// Runs `op` inside one `BEGIN IMMEDIATE` transaction and commits on success.
    pub(crate) fn write<T>(
        &self,
        mut op: impl FnMut(&GovernanceTx<'_>) -> Result<T, WriteFailure>,
    ) -> Result<T, GovernanceError> {
        self.attempt_write(&mut op)
            .map_err(WriteFailure::into_governance)
    }

    /// Like [`Self::write`] but retries `SQLITE_BUSY`/`SQLITE_LOCKED` with
    /// exponential backoff, up to `resolution_retry_limit` attempts.
    pub(crate) fn write_resolution<T>(
        &self,
        suggestion_id: SuggestionId,
        mut op: impl FnMut(&GovernanceTx<'_>) -> Result<T, WriteFailure>,
    ) -> Result<T, GovernanceError> {
        let limit = self.config.resolution_retry_limit.max(1);
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            match self.attempt_write(&mut op) {
                Ok(value) => return Ok(value),
                Err(WriteFailure::Storage(err)) if is_transient(&err) => {
                    if attempt >= limit {
                        warn!(
                            suggestion_id = %suggestion_id,
                            attempts = attempt,
                            error = %err,
                            "resolution retries exhausted"
                        );
                        return Err(GovernanceError::ConcurrentCloseConflict(suggestion_id));
                    }
                    let delay = backoff_delay(attempt);
                    debug!(
                        suggestion_id = %suggestion_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "database busy during resolution, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(other) => return Err(other.into_governance()),
            }
        }
    }

    /// Open failures stay storage errors so resolution retries cover them.
    fn open_for_write(&self) -> Result<SqliteGovernanceStore, WriteFailure> {
        SqliteGovernanceStore::open(&self.db_path).map_err(WriteFailure::Storage)
    }

    fn attempt_write<T>(
        &self,
        op: &mut impl FnMut(&GovernanceTx<'_>) -> Result<T, WriteFailure>,
    ) -> Result<T, WriteFailure> {
        let mut store = self.open_for_write()?;
        let tx = store.begin_write()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1_u32 << attempt.saturating_sub(1).min(8);
    RETRY_BASE_DELAY.saturating_mul(factor).min(RETRY_MAX_DELAY)
}
