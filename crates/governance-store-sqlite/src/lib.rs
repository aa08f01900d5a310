#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use governance_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, unix_nanos, Comment, CommentId, ConfigParameter,
    HistoryOutcome, HistoryQuery, HistoryRecord, Policy, PolicyChangeAction, PolicyChangeRecord,
    PolicyEffect, PolicyId, RecordId, SubjectRef, Suggestion, SuggestionId, SuggestionState,
    Tally, ValueType, Vote, VoteChoice,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

pub const SCHEMA_MIGRATION_VERSION: i64 = 1;

const SCHEMA_GOVERNANCE_V1: &str = r"
CREATE TABLE IF NOT EXISTS config_parameters (
  parameter_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  value_type TEXT NOT NULL CHECK (value_type IN ('boolean', 'integer', 'string', 'list')),
  min_value INTEGER,
  max_value INTEGER,
  editable INTEGER NOT NULL DEFAULT 1 CHECK (editable IN (0, 1)),
  description TEXT NOT NULL DEFAULT '',
  last_modified_at TEXT NOT NULL,
  last_modified_by TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_config_parameters_no_delete
BEFORE DELETE ON config_parameters
BEGIN
  SELECT RAISE(FAIL, 'config_parameters rows cannot be deleted');
END;

CREATE TABLE IF NOT EXISTS suggestions (
  suggestion_id TEXT PRIMARY KEY,
  parameter_id TEXT NOT NULL,
  proposed_value TEXT NOT NULL,
  rationale TEXT NOT NULL,
  author TEXT NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('open', 'accepted', 'rejected', 'withdrawn')),
  created_at TEXT NOT NULL,
  opened_at TEXT,
  voting_deadline TEXT,
  voting_deadline_nanos INTEGER,
  resolved_at TEXT,
  resolution_reason TEXT,
  resolved_by TEXT,
  requires_review INTEGER NOT NULL DEFAULT 0 CHECK (requires_review IN (0, 1)),
  policy_revision INTEGER NOT NULL CHECK (policy_revision >= 0),
  matched_policy_ids TEXT NOT NULL DEFAULT '[]',
  FOREIGN KEY (parameter_id) REFERENCES config_parameters(parameter_id)
);

CREATE TRIGGER IF NOT EXISTS trg_suggestions_resolved_immutable
BEFORE UPDATE ON suggestions
WHEN OLD.state <> 'open'
BEGIN
  SELECT RAISE(FAIL, 'resolved suggestions are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_suggestions_no_delete
BEFORE DELETE ON suggestions
BEGIN
  SELECT RAISE(FAIL, 'suggestions cannot be deleted');
END;

CREATE INDEX IF NOT EXISTS idx_suggestions_state_deadline
  ON suggestions(state, voting_deadline_nanos);

CREATE TABLE IF NOT EXISTS votes (
  suggestion_id TEXT NOT NULL,
  voter TEXT NOT NULL,
  choice TEXT NOT NULL CHECK (choice IN ('affirm', 'reject', 'abstain')),
  cast_at TEXT NOT NULL,
  revision INTEGER NOT NULL DEFAULT 1 CHECK (revision >= 1),
  PRIMARY KEY (suggestion_id, voter),
  FOREIGN KEY (suggestion_id) REFERENCES suggestions(suggestion_id)
);

CREATE TRIGGER IF NOT EXISTS trg_votes_open_only_insert
BEFORE INSERT ON votes
WHEN (SELECT state FROM suggestions WHERE suggestion_id = NEW.suggestion_id) <> 'open'
BEGIN
  SELECT RAISE(FAIL, 'votes are only accepted while a suggestion is open');
END;

CREATE TRIGGER IF NOT EXISTS trg_votes_open_only_update
BEFORE UPDATE ON votes
WHEN (SELECT state FROM suggestions WHERE suggestion_id = NEW.suggestion_id) <> 'open'
BEGIN
  SELECT RAISE(FAIL, 'votes are only accepted while a suggestion is open');
END;

CREATE TABLE IF NOT EXISTS suggestion_comments (
  comment_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  comment_id TEXT NOT NULL UNIQUE,
  suggestion_id TEXT NOT NULL,
  author TEXT NOT NULL,
  text TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (suggestion_id) REFERENCES suggestions(suggestion_id)
);

CREATE TRIGGER IF NOT EXISTS trg_suggestion_comments_no_update
BEFORE UPDATE ON suggestion_comments
BEGIN
  SELECT RAISE(FAIL, 'suggestion_comments is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_suggestion_comments_no_delete
BEFORE DELETE ON suggestion_comments
BEGIN
  SELECT RAISE(FAIL, 'suggestion_comments is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_suggestion_comments_suggestion_seq
  ON suggestion_comments(suggestion_id, comment_seq);

CREATE TABLE IF NOT EXISTS policies (
  policy_id TEXT PRIMARY KEY,
  priority INTEGER NOT NULL,
  predicate TEXT NOT NULL,
  effect TEXT NOT NULL CHECK (effect IN ('block', 'require_review', 'none')),
  description TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_policies_priority
  ON policies(priority, policy_id);

CREATE TABLE IF NOT EXISTS policy_set_state (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  revision INTEGER NOT NULL CHECK (revision >= 0),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS policy_changes (
  change_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  policy_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('created', 'updated', 'deleted')),
  before_json TEXT,
  after_json TEXT,
  actor TEXT NOT NULL,
  changed_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_policy_changes_no_update
BEFORE UPDATE ON policy_changes
BEGIN
  SELECT RAISE(FAIL, 'policy_changes is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_policy_changes_no_delete
BEFORE DELETE ON policy_changes
BEGIN
  SELECT RAISE(FAIL, 'policy_changes is append-only');
END;

CREATE TABLE IF NOT EXISTS history_records (
  history_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id TEXT NOT NULL UNIQUE,
  parameter_id TEXT NOT NULL,
  parameter_name TEXT NOT NULL,
  requested_value TEXT NOT NULL,
  previous_value TEXT,
  outcome TEXT NOT NULL CHECK (outcome IN ('accepted', 'rejected', 'withdrawn')),
  reason TEXT,
  resolved_at TEXT NOT NULL,
  resolved_at_nanos INTEGER NOT NULL,
  subject_ref TEXT NOT NULL UNIQUE,
  actor TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_history_records_no_update
BEFORE UPDATE ON history_records
BEGIN
  SELECT RAISE(FAIL, 'history_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_history_records_no_delete
BEFORE DELETE ON history_records
BEGIN
  SELECT RAISE(FAIL, 'history_records is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_history_records_order
  ON history_records(resolved_at_nanos, subject_ref);
CREATE INDEX IF NOT EXISTS idx_history_records_parameter_order
  ON history_records(parameter_id, resolved_at_nanos, subject_ref);
";

const PARAMETER_COLUMNS: &str = "parameter_id, name, value, value_type, min_value, max_value,
    editable, description, last_modified_at, last_modified_by";

const SUGGESTION_COLUMNS: &str = "suggestion_id, parameter_id, proposed_value, rationale, author,
    state, created_at, opened_at, voting_deadline, resolved_at, resolution_reason, resolved_by,
    requires_review, policy_revision, matched_policy_ids";

const POLICY_COLUMNS: &str =
    "policy_id, priority, predicate, effect, description, created_at, updated_at";

const HISTORY_COLUMNS: &str = "history_seq, record_id, parameter_id, parameter_name,
    requested_value, previous_value, outcome, reason, resolved_at, subject_ref, actor";

/// Input for one history ledger entry; the store assigns `history_seq` and `record_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryRecord {
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

#[derive(Debug, Clone, PartialEq)]
pub struct NewPolicyChange {
    pub policy_id: PolicyId,
    pub action: PolicyChangeAction,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub actor: String,
    pub changed_at: OffsetDateTime,
}

/// Terminal fields written by the open-state compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<'a> {
    pub state: SuggestionState,
    pub reason: &'a str,
    pub resolved_at: OffsetDateTime,
    pub resolved_by: &'a str,
}

pub struct SqliteGovernanceStore {
    conn: Connection,
}

impl SqliteGovernanceStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_GOVERNANCE_V1)
            .context("failed to apply governance schema")?;

        let now = timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_MIGRATION_VERSION, now],
            )
            .context("failed to register governance schema migration")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO policy_set_state(singleton, revision, updated_at)
                 VALUES (1, 0, ?1)",
                params![now],
            )
            .context("failed to initialize policy set revision")?;

        Ok(())
    }

    pub fn is_migrated(&self) -> Result<bool> {
        if !table_exists(&self.conn, "schema_migrations")? {
            return Ok(false);
        }
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?1",
                params![SCHEMA_MIGRATION_VERSION],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read schema_migrations")?;
        Ok(found.is_some())
    }

    /// Starts a `BEGIN IMMEDIATE` transaction so the write lock is taken up
    /// front instead of on the first write statement.
    pub fn begin_write(&mut self) -> Result<GovernanceTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start immediate transaction")?;
        Ok(GovernanceTx { tx })
    }

    pub fn get_parameter(&self, parameter_id: &str) -> Result<Option<ConfigParameter>> {
        query_parameter(&self.conn, parameter_id)
    }

    pub fn list_parameters(&self) -> Result<Vec<ConfigParameter>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PARAMETER_COLUMNS} FROM config_parameters ORDER BY parameter_id ASC"
        ))?;
        let rows = stmt.query_map([], parse_parameter_row)?;
        collect_rows(rows)
    }

    pub fn get_suggestion(&self, suggestion_id: SuggestionId) -> Result<Option<Suggestion>> {
        query_suggestion(&self.conn, suggestion_id)
    }

    pub fn list_suggestions(&self, state: Option<SuggestionState>) -> Result<Vec<Suggestion>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUGGESTION_COLUMNS} FROM suggestions
             WHERE (?1 IS NULL OR state = ?1)
             ORDER BY created_at ASC, suggestion_id ASC"
        ))?;
        let rows = stmt.query_map(
            params![state.map(SuggestionState::as_str)],
            parse_suggestion_row,
        )?;
        collect_rows(rows)
    }

    /// Open, non-review suggestions whose deadline is at or before `now`.
    pub fn list_expired_open(&self, now: OffsetDateTime) -> Result<Vec<SuggestionId>> {
        let mut stmt = self.conn.prepare(
            "SELECT suggestion_id FROM suggestions
             WHERE state = 'open'
               AND requires_review = 0
               AND voting_deadline_nanos IS NOT NULL
               AND voting_deadline_nanos <= ?1
             ORDER BY voting_deadline_nanos ASC, suggestion_id ASC",
        )?;
        let rows = stmt.query_map(params![unix_nanos(now)], |row| {
            let raw: String = row.get(0)?;
            parse_ulid(0, &raw).map(SuggestionId)
        })?;
        collect_rows(rows)
    }

    pub fn list_votes(&self, suggestion_id: SuggestionId) -> Result<Vec<Vote>> {
        let mut stmt = self.conn.prepare(
            "SELECT suggestion_id, voter, choice, cast_at, revision
             FROM votes WHERE suggestion_id = ?1
             ORDER BY voter ASC",
        )?;
        let rows = stmt.query_map(params![suggestion_id.to_string()], parse_vote_row)?;
        collect_rows(rows)
    }

    pub fn tally(&self, suggestion_id: SuggestionId) -> Result<Tally> {
        query_tally(&self.conn, suggestion_id)
    }

    pub fn list_comments(&self, suggestion_id: SuggestionId) -> Result<Vec<Comment>> {
        let mut stmt = self.conn.prepare(
            "SELECT comment_id, suggestion_id, author, text, created_at
             FROM suggestion_comments WHERE suggestion_id = ?1
             ORDER BY comment_seq ASC",
        )?;
        let rows = stmt.query_map(params![suggestion_id.to_string()], parse_comment_row)?;
        collect_rows(rows)
    }

    pub fn list_policies(&self) -> Result<Vec<Policy>> {
        query_policies(&self.conn)
    }

    pub fn get_policy(&self, policy_id: PolicyId) -> Result<Option<Policy>> {
        query_policy(&self.conn, policy_id)
    }

    pub fn policy_revision(&self) -> Result<i64> {
        query_policy_revision(&self.conn)
    }

    pub fn list_policy_changes(
        &self,
        policy_id: Option<PolicyId>,
    ) -> Result<Vec<PolicyChangeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT change_seq, policy_id, action, before_json, after_json, actor, changed_at
             FROM policy_changes
             WHERE (?1 IS NULL OR policy_id = ?1)
             ORDER BY change_seq ASC",
        )?;
        let rows = stmt.query_map(
            params![policy_id.map(|id| id.to_string())],
            parse_policy_change_row,
        )?;
        collect_rows(rows)
    }

    pub fn list_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let mut sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM history_records
             WHERE (?1 IS NULL OR parameter_id = ?1)
               AND (?2 IS NULL OR resolved_at_nanos >= ?2)
               AND (?3 IS NULL OR resolved_at_nanos <= ?3)
             ORDER BY resolved_at_nanos ASC, subject_ref ASC"
        );

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&limit.to_string());
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                query.parameter_id,
                query.from.map(unix_nanos),
                query.to.map(unix_nanos),
            ],
            parse_history_row,
        )?;
        collect_rows(rows)
    }

    pub fn get_history_record(&self, record_id: RecordId) -> Result<Option<HistoryRecord>> {
        query_history_record(&self.conn, record_id)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// One immediate write transaction. Dropping it without [`GovernanceTx::commit`]
/// rolls every statement back.
pub struct GovernanceTx<'conn> {
    tx: Transaction<'conn>,
}

impl GovernanceTx<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("failed to commit transaction")
    }

    pub fn get_parameter(&self, parameter_id: &str) -> Result<Option<ConfigParameter>> {
        query_parameter(&self.tx, parameter_id)
    }

    pub fn get_suggestion(&self, suggestion_id: SuggestionId) -> Result<Option<Suggestion>> {
        query_suggestion(&self.tx, suggestion_id)
    }

    pub fn tally(&self, suggestion_id: SuggestionId) -> Result<Tally> {
        query_tally(&self.tx, suggestion_id)
    }

    pub fn list_policies(&self) -> Result<Vec<Policy>> {
        query_policies(&self.tx)
    }

    pub fn get_policy(&self, policy_id: PolicyId) -> Result<Option<Policy>> {
        query_policy(&self.tx, policy_id)
    }

    pub fn policy_revision(&self) -> Result<i64> {
        query_policy_revision(&self.tx)
    }

    pub fn get_history_record(&self, record_id: RecordId) -> Result<Option<HistoryRecord>> {
        query_history_record(&self.tx, record_id)
    }

    pub fn insert_parameter(&self, parameter: &ConfigParameter) -> Result<()> {
        self.tx
            .execute(
                &format!(
                    "INSERT INTO config_parameters({PARAMETER_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    parameter.parameter_id,
                    parameter.name,
                    parameter.value,
                    parameter.value_type.as_str(),
                    parameter.min_value,
                    parameter.max_value,
                    bool_to_sql(parameter.editable),
                    parameter.description,
                    timestamp(parameter.last_modified_at)?,
                    parameter.last_modified_by.to_string(),
                ],
            )
            .with_context(|| format!("failed to insert parameter {}", parameter.parameter_id))?;
        Ok(())
    }

    /// The single write path for parameter values, shared by lifecycle
    /// resolution and admin writes.
    pub fn apply_parameter_change(
        &self,
        parameter_id: &str,
        value: &str,
        at: OffsetDateTime,
        subject: SubjectRef,
    ) -> Result<()> {
        let updated = self
            .tx
            .execute(
                "UPDATE config_parameters
                 SET value = ?2, last_modified_at = ?3, last_modified_by = ?4
                 WHERE parameter_id = ?1",
                params![parameter_id, value, timestamp(at)?, subject.to_string()],
            )
            .with_context(|| format!("failed to apply change to parameter {parameter_id}"))?;

        if updated != 1 {
            return Err(anyhow!("parameter {parameter_id} disappeared during apply"));
        }
        Ok(())
    }

    pub fn insert_suggestion(&self, suggestion: &Suggestion) -> Result<()> {
        let matched = serde_json::to_string(&suggestion.matched_policy_ids)
            .context("failed to serialize matched_policy_ids")?;

        self.tx
            .execute(
                &format!(
                    "INSERT INTO suggestions({SUGGESTION_COLUMNS}, voting_deadline_nanos)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    suggestion.suggestion_id.to_string(),
                    suggestion.parameter_id,
                    suggestion.proposed_value,
                    suggestion.rationale,
                    suggestion.author,
                    suggestion.state.as_str(),
                    timestamp(suggestion.created_at)?,
                    optional_timestamp(suggestion.opened_at)?,
                    optional_timestamp(suggestion.voting_deadline)?,
                    optional_timestamp(suggestion.resolved_at)?,
                    suggestion.resolution_reason,
                    suggestion.resolved_by,
                    bool_to_sql(suggestion.requires_review),
                    suggestion.policy_revision,
                    matched,
                    suggestion.voting_deadline.map(unix_nanos),
                ],
            )
            .with_context(|| format!("failed to insert suggestion {}", suggestion.suggestion_id))?;
        Ok(())
    }

    /// Compare-and-set out of `open`. Returns `false` when another writer
    /// already moved the suggestion to a terminal state.
    pub fn resolve_suggestion(
        &self,
        suggestion_id: SuggestionId,
        resolution: &Resolution<'_>,
    ) -> Result<bool> {
        if !resolution.state.is_terminal() {
            return Err(anyhow!(
                "cannot resolve suggestion into non-terminal state {}",
                resolution.state.as_str()
            ));
        }

        let updated = self
            .tx
            .execute(
                "UPDATE suggestions
                 SET state = ?2, resolution_reason = ?3, resolved_at = ?4, resolved_by = ?5
                 WHERE suggestion_id = ?1 AND state = 'open'",
                params![
                    suggestion_id.to_string(),
                    resolution.state.as_str(),
                    resolution.reason,
                    timestamp(resolution.resolved_at)?,
                    resolution.resolved_by,
                ],
            )
            .with_context(|| format!("failed to resolve suggestion {suggestion_id}"))?;

        Ok(updated == 1)
    }

    /// Last-write-wins upsert keyed by `(suggestion_id, voter)`.
    pub fn upsert_vote(
        &self,
        suggestion_id: SuggestionId,
        voter: &str,
        choice: VoteChoice,
        cast_at: OffsetDateTime,
    ) -> Result<Vote> {
        let revision: i64 = self
            .tx
            .query_row(
                "INSERT INTO votes(suggestion_id, voter, choice, cast_at, revision)
                 VALUES (?1, ?2, ?3, ?4, 1)
                 ON CONFLICT(suggestion_id, voter) DO UPDATE SET
                   choice = excluded.choice,
                   cast_at = excluded.cast_at,
                   revision = votes.revision + 1
                 RETURNING revision",
                params![
                    suggestion_id.to_string(),
                    voter,
                    choice.as_str(),
                    timestamp(cast_at)?
                ],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to record vote on suggestion {suggestion_id}"))?;

        let revision = u32::try_from(revision)
            .with_context(|| format!("invalid vote revision: {revision}"))?;

        Ok(Vote {
            suggestion_id,
            voter: voter.to_string(),
            choice,
            cast_at,
            revision,
        })
    }

    pub fn insert_comment(&self, comment: &Comment) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO suggestion_comments(comment_id, suggestion_id, author, text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    comment.comment_id.to_string(),
                    comment.suggestion_id.to_string(),
                    comment.author,
                    comment.text,
                    timestamp(comment.created_at)?,
                ],
            )
            .context("failed to append comment")?;
        Ok(())
    }

    pub fn insert_policy(&self, policy: &Policy) -> Result<()> {
        self.tx
            .execute(
                &format!("INSERT INTO policies({POLICY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    policy.policy_id.to_string(),
                    policy.priority,
                    policy.predicate,
                    policy.effect.as_str(),
                    policy.description,
                    timestamp(policy.created_at)?,
                    timestamp(policy.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to insert policy {}", policy.policy_id))?;
        Ok(())
    }

    pub fn replace_policy(&self, policy: &Policy) -> Result<bool> {
        let updated = self
            .tx
            .execute(
                "UPDATE policies
                 SET priority = ?2, predicate = ?3, effect = ?4, description = ?5, updated_at = ?6
                 WHERE policy_id = ?1",
                params![
                    policy.policy_id.to_string(),
                    policy.priority,
                    policy.predicate,
                    policy.effect.as_str(),
                    policy.description,
                    timestamp(policy.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to update policy {}", policy.policy_id))?;
        Ok(updated == 1)
    }

    pub fn delete_policy(&self, policy_id: PolicyId) -> Result<bool> {
        let deleted = self
            .tx
            .execute(
                "DELETE FROM policies WHERE policy_id = ?1",
                params![policy_id.to_string()],
            )
            .with_context(|| format!("failed to delete policy {policy_id}"))?;
        Ok(deleted == 1)
    }

    pub fn bump_policy_revision(&self, at: OffsetDateTime) -> Result<i64> {
        self.tx
            .query_row(
                "UPDATE policy_set_state SET revision = revision + 1, updated_at = ?1
                 WHERE singleton = 1
                 RETURNING revision",
                params![timestamp(at)?],
                |row| row.get(0),
            )
            .context("failed to bump policy set revision")
    }

    pub fn append_policy_change(&self, change: &NewPolicyChange) -> Result<PolicyChangeRecord> {
        let before = change
            .before
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize policy snapshot")?;
        let after = change
            .after
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize policy snapshot")?;

        self.tx
            .execute(
                "INSERT INTO policy_changes(policy_id, action, before_json, after_json, actor, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    change.policy_id.to_string(),
                    change.action.as_str(),
                    before,
                    after,
                    change.actor,
                    timestamp(change.changed_at)?,
                ],
            )
            .context("failed to append policy change")?;

        Ok(PolicyChangeRecord {
            change_seq: self.tx.last_insert_rowid(),
            policy_id: change.policy_id,
            action: change.action,
            before: change.before.clone(),
            after: change.after.clone(),
            actor: change.actor.clone(),
            changed_at: change.changed_at,
        })
    }

    pub fn append_history(&self, input: &NewHistoryRecord) -> Result<HistoryRecord> {
        let record_id = RecordId(Ulid::new());

        self.tx
            .execute(
                "INSERT INTO history_records(
                    record_id, parameter_id, parameter_name, requested_value, previous_value,
                    outcome, reason, resolved_at, resolved_at_nanos, subject_ref, actor
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record_id.to_string(),
                    input.parameter_id,
                    input.parameter_name,
                    input.requested_value,
                    input.previous_value,
                    input.outcome.as_str(),
                    input.reason,
                    timestamp(input.resolved_at)?,
                    unix_nanos(input.resolved_at),
                    input.subject.to_string(),
                    input.actor,
                ],
            )
            .with_context(|| format!("failed to append history for {}", input.subject))?;

        Ok(HistoryRecord {
            history_seq: self.tx.last_insert_rowid(),
            record_id,
            parameter_id: input.parameter_id.clone(),
            parameter_name: input.parameter_name.clone(),
            requested_value: input.requested_value.clone(),
            previous_value: input.previous_value.clone(),
            outcome: input.outcome,
            reason: input.reason.clone(),
            resolved_at: input.resolved_at,
            subject: input.subject,
            actor: input.actor.clone(),
        })
    }
}

/// `SQLITE_BUSY` / `SQLITE_LOCKED` anywhere in the error chain.
#[must_use]
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(inner, _))
                if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

fn query_parameter(conn: &Connection, parameter_id: &str) -> Result<Option<ConfigParameter>> {
    conn.query_row(
        &format!("SELECT {PARAMETER_COLUMNS} FROM config_parameters WHERE parameter_id = ?1"),
        params![parameter_id],
        parse_parameter_row,
    )
    .optional()
    .with_context(|| format!("failed to load parameter {parameter_id}"))
}

fn query_suggestion(conn: &Connection, suggestion_id: SuggestionId) -> Result<Option<Suggestion>> {
    conn.query_row(
        &format!("SELECT {SUGGESTION_COLUMNS} FROM suggestions WHERE suggestion_id = ?1"),
        params![suggestion_id.to_string()],
        parse_suggestion_row,
    )
    .optional()
    .with_context(|| format!("failed to load suggestion {suggestion_id}"))
}

fn query_tally(conn: &Connection, suggestion_id: SuggestionId) -> Result<Tally> {
    let mut stmt = conn.prepare("SELECT choice FROM votes WHERE suggestion_id = ?1")?;
    let rows = stmt.query_map(params![suggestion_id.to_string()], |row| {
        let raw: String = row.get(0)?;
        VoteChoice::parse(&raw).ok_or_else(|| conversion_error(0, format!("invalid choice: {raw}")))
    })?;
    Ok(Tally::from_choices(collect_rows(rows)?))
}

fn query_policies(conn: &Connection) -> Result<Vec<Policy>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {POLICY_COLUMNS} FROM policies ORDER BY priority ASC, policy_id ASC"
    ))?;
    let rows = stmt.query_map([], parse_policy_row)?;
    collect_rows(rows)
}

fn query_policy(conn: &Connection, policy_id: PolicyId) -> Result<Option<Policy>> {
    conn.query_row(
        &format!("SELECT {POLICY_COLUMNS} FROM policies WHERE policy_id = ?1"),
        params![policy_id.to_string()],
        parse_policy_row,
    )
    .optional()
    .with_context(|| format!("failed to load policy {policy_id}"))
}

fn query_policy_revision(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT revision FROM policy_set_state WHERE singleton = 1",
        [],
        |row| row.get(0),
    )
    .context("failed to read policy set revision")
}

fn query_history_record(conn: &Connection, record_id: RecordId) -> Result<Option<HistoryRecord>> {
    conn.query_row(
        &format!("SELECT {HISTORY_COLUMNS} FROM history_records WHERE record_id = ?1"),
        params![record_id.to_string()],
        parse_history_row,
    )
    .optional()
    .with_context(|| format!("failed to load history record {record_id}"))
}

fn parse_parameter_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConfigParameter> {
    let value_type_raw: String = row.get(3)?;
    let value_type = ValueType::parse(&value_type_raw)
        .ok_or_else(|| conversion_error(3, format!("invalid value_type: {value_type_raw}")))?;
    let modified_by_raw: String = row.get(9)?;
    let last_modified_by =
        SubjectRef::parse(&modified_by_raw).map_err(|err| conversion_error(9, err.to_string()))?;

    Ok(ConfigParameter {
        parameter_id: row.get(0)?,
        name: row.get(1)?,
        value: row.get(2)?,
        value_type,
        min_value: row.get(4)?,
        max_value: row.get(5)?,
        editable: row.get::<_, i64>(6)? == 1,
        description: row.get(7)?,
        last_modified_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        last_modified_by,
    })
}

fn parse_suggestion_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Suggestion> {
    let suggestion_id = SuggestionId(parse_ulid(0, &row.get::<_, String>(0)?)?);
    let state_raw: String = row.get(5)?;
    let state = SuggestionState::parse(&state_raw)
        .ok_or_else(|| conversion_error(5, format!("invalid state: {state_raw}")))?;
    let matched_raw: String = row.get(14)?;
    let matched_policy_ids: Vec<PolicyId> = serde_json::from_str(&matched_raw)
        .map_err(|err| conversion_error(14, format!("invalid matched_policy_ids: {err}")))?;

    Ok(Suggestion {
        suggestion_id,
        parameter_id: row.get(1)?,
        proposed_value: row.get(2)?,
        rationale: row.get(3)?,
        author: row.get(4)?,
        state,
        created_at: parse_timestamp(6, &row.get::<_, String>(6)?)?,
        opened_at: parse_optional_timestamp(7, row.get(7)?)?,
        voting_deadline: parse_optional_timestamp(8, row.get(8)?)?,
        resolved_at: parse_optional_timestamp(9, row.get(9)?)?,
        resolution_reason: row.get(10)?,
        resolved_by: row.get(11)?,
        requires_review: row.get::<_, i64>(12)? == 1,
        policy_revision: row.get(13)?,
        matched_policy_ids,
    })
}

fn parse_vote_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Vote> {
    let choice_raw: String = row.get(2)?;
    let choice = VoteChoice::parse(&choice_raw)
        .ok_or_else(|| conversion_error(2, format!("invalid choice: {choice_raw}")))?;
    let revision_i64: i64 = row.get(4)?;
    let revision = u32::try_from(revision_i64)
        .map_err(|_| conversion_error(4, format!("invalid revision: {revision_i64}")))?;

    Ok(Vote {
        suggestion_id: SuggestionId(parse_ulid(0, &row.get::<_, String>(0)?)?),
        voter: row.get(1)?,
        choice,
        cast_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
        revision,
    })
}

fn parse_comment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        comment_id: CommentId(parse_ulid(0, &row.get::<_, String>(0)?)?),
        suggestion_id: SuggestionId(parse_ulid(1, &row.get::<_, String>(1)?)?),
        author: row.get(2)?,
        text: row.get(3)?,
        created_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
    })
}

fn parse_policy_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Policy> {
    let effect_raw: String = row.get(3)?;
    let effect = PolicyEffect::parse(&effect_raw)
        .ok_or_else(|| conversion_error(3, format!("invalid effect: {effect_raw}")))?;

    Ok(Policy {
        policy_id: PolicyId(parse_ulid(0, &row.get::<_, String>(0)?)?),
        priority: row.get(1)?,
        predicate: row.get(2)?,
        effect,
        description: row.get(4)?,
        created_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
        updated_at: parse_timestamp(6, &row.get::<_, String>(6)?)?,
    })
}

fn parse_policy_change_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PolicyChangeRecord> {
    let action_raw: String = row.get(2)?;
    let action = PolicyChangeAction::parse(&action_raw)
        .ok_or_else(|| conversion_error(2, format!("invalid action: {action_raw}")))?;

    Ok(PolicyChangeRecord {
        change_seq: row.get(0)?,
        policy_id: PolicyId(parse_ulid(1, &row.get::<_, String>(1)?)?),
        action,
        before: parse_optional_json(3, row.get(3)?)?,
        after: parse_optional_json(4, row.get(4)?)?,
        actor: row.get(5)?,
        changed_at: parse_timestamp(6, &row.get::<_, String>(6)?)?,
    })
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let outcome_raw: String = row.get(6)?;
    let outcome = HistoryOutcome::parse(&outcome_raw)
        .ok_or_else(|| conversion_error(6, format!("invalid outcome: {outcome_raw}")))?;
    let subject_raw: String = row.get(9)?;
    let subject =
        SubjectRef::parse(&subject_raw).map_err(|err| conversion_error(9, err.to_string()))?;

    Ok(HistoryRecord {
        history_seq: row.get(0)?,
        record_id: RecordId(parse_ulid(1, &row.get::<_, String>(1)?)?),
        parameter_id: row.get(2)?,
        parameter_name: row.get(3)?,
        requested_value: row.get(4)?,
        previous_value: row.get(5)?,
        outcome,
        reason: row.get(7)?,
        resolved_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        subject,
        actor: row.get(10)?,
    })
}

fn parse_ulid(column: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| conversion_error(column, format!("invalid ULID: {raw}")))
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| conversion_error(column, err.to_string()))
}

fn parse_optional_timestamp(
    column: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    raw.as_deref()
        .map(|value| parse_timestamp(column, value))
        .transpose()
}

fn parse_optional_json(column: usize, raw: Option<String>) -> rusqlite::Result<Option<Value>> {
    raw.as_deref()
        .map(|value| {
            serde_json::from_str(value)
                .map_err(|err| conversion_error(column, format!("invalid JSON snapshot: {err}")))
        })
        .transpose()
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn optional_timestamp(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(timestamp).transpose()
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check table {table_name}"))?;
    Ok(count > 0)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
