//! Privileged writes that bypass voting: parameter registration, direct
//! overrides, rollback, and policy maintenance.

use governance_core::{
    validate_actor, ConfigParameter, GovernanceError, HistoryOutcome, HistoryRecord,
    ParameterDefinition, Policy, PolicyChangeAction, PolicyChangeRecord, PolicyId, PolicyInput,
    RecordId, SubjectRef, SuggestionDraft, REASON_ADMIN_OVERRIDE, REASON_REGISTERED,
};
use governance_store_sqlite::{GovernanceTx, NewHistoryRecord, NewPolicyChange};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::info;

use crate::{GovernanceApi, WriteFailure};

/// A parameter after an admin write, with the ledger entry explaining it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParameterChange {
    pub parameter: ConfigParameter,
    pub history: HistoryRecord,
}

impl GovernanceApi {
    fn require_privileged(&self, actor: &str, action: &str) -> Result<(), GovernanceError> {
        validate_actor(actor)?;
        if self.config.is_privileged(actor) {
            Ok(())
        } else {
            Err(GovernanceError::unauthorized(actor, action))
        }
    }

    /// Adds a governed parameter with its initial value.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Unauthorized`], [`GovernanceError::ParameterExists`]
    /// or a validation error for a malformed definition.
    pub fn register_parameter(
        &self,
        definition: &ParameterDefinition,
        actor: &str,
    ) -> Result<ParameterChange, GovernanceError> {
        self.require_privileged(actor, "register parameters")?;
        definition.validate()?;

        let change = self.write(|tx| {
            if tx.get_parameter(&definition.parameter_id)?.is_some() {
                return Err(GovernanceError::ParameterExists(definition.parameter_id.clone()).into());
            }

            let now = self.clock.now();
            let subject = SubjectRef::new_admin_override();
            let parameter = ConfigParameter {
                parameter_id: definition.parameter_id.clone(),
                name: definition.name.clone(),
                value: definition.value.clone(),
                value_type: definition.value_type,
                min_value: definition.min_value,
                max_value: definition.max_value,
                editable: definition.editable,
                description: definition.description.clone(),
                last_modified_at: now,
                last_modified_by: subject,
            };
            tx.insert_parameter(&parameter)?;

            let history = tx.append_history(&NewHistoryRecord {
                parameter_id: parameter.parameter_id.clone(),
                parameter_name: parameter.name.clone(),
                requested_value: parameter.value.clone(),
                previous_value: None,
                outcome: HistoryOutcome::Accepted,
                reason: Some(REASON_REGISTERED.to_string()),
                resolved_at: now,
                subject,
                actor: actor.to_string(),
            })?;
            Ok(ParameterChange { parameter, history })
        })?;

        info!(
            parameter_id = %change.parameter.parameter_id,
            actor,
            "parameter registered"
        );
        Ok(change)
    }

    /// Sets a parameter directly, bypassing voting. Non-editable parameters
    /// may be changed here.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Unauthorized`], [`GovernanceError::UnknownParameter`]
    /// or [`GovernanceError::InvalidValue`].
    pub fn set_parameter(
        &self,
        parameter_id: &str,
        value: &str,
        actor: &str,
    ) -> Result<ParameterChange, GovernanceError> {
        self.require_privileged(actor, "set parameters")?;

        let change = self.write(|tx| {
            self.override_in_tx(tx, parameter_id, value, REASON_ADMIN_OVERRIDE, actor)
        })?;

        info!(
            parameter_id = %change.parameter.parameter_id,
            history_record = %change.history.record_id,
            actor,
            "parameter overridden"
        );
        Ok(change)
    }

    /// Restores the value a parameter held before an accepted change.
    ///
    /// # Errors
    /// Returns [`GovernanceError::HistoryRecordNotFound`] for unknown records and
    /// [`GovernanceError::Validation`] when the record cannot be rolled back.
    pub fn rollback(
        &self,
        record_id: RecordId,
        actor: &str,
    ) -> Result<ParameterChange, GovernanceError> {
        self.require_privileged(actor, "roll back parameter changes")?;

        let change = self.write(|tx| {
            let record = tx
                .get_history_record(record_id)?
                .ok_or(GovernanceError::HistoryRecordNotFound(record_id))?;
            if record.outcome != HistoryOutcome::Accepted {
                return Err(GovernanceError::Validation(format!(
                    "history record {record_id} is {} and changed nothing",
                    record.outcome.as_str()
                ))
                .into());
            }
            let Some(previous) = record.previous_value else {
                return Err(GovernanceError::Validation(format!(
                    "history record {record_id} has no previous value to restore"
                ))
                .into());
            };

            let reason = format!("rollback:{record_id}");
            self.override_in_tx(tx, &record.parameter_id, &previous, &reason, actor)
        })?;

        info!(
            parameter_id = %change.parameter.parameter_id,
            rolled_back = %record_id,
            actor,
            "parameter rolled back"
        );
        Ok(change)
    }

    fn override_in_tx(
        &self,
        tx: &GovernanceTx<'_>,
        parameter_id: &str,
        value: &str,
        reason: &str,
        actor: &str,
    ) -> Result<ParameterChange, WriteFailure> {
        let current = tx
            .get_parameter(parameter_id)?
            .ok_or_else(|| GovernanceError::UnknownParameter(parameter_id.to_string()))?;
        current.validate_value(value)?;

        let now = self.clock.now();
        let subject = SubjectRef::new_admin_override();
        tx.apply_parameter_change(parameter_id, value, now, subject)?;

        let history = tx.append_history(&NewHistoryRecord {
            parameter_id: current.parameter_id.clone(),
            parameter_name: current.name.clone(),
            requested_value: value.to_string(),
            previous_value: Some(current.value.clone()),
            outcome: HistoryOutcome::Accepted,
            reason: Some(reason.to_string()),
            resolved_at: now,
            subject,
            actor: actor.to_string(),
        })?;

        Ok(ParameterChange {
            parameter: ConfigParameter {
                value: value.to_string(),
                last_modified_at: now,
                last_modified_by: subject,
                ..current
            },
            history,
        })
    }

    /// # Errors
    /// Returns [`GovernanceError::Unauthorized`] or [`GovernanceError::Validation`]
    /// when the predicate does not evaluate.
    pub fn create_policy(&self, input: &PolicyInput, actor: &str) -> Result<Policy, GovernanceError> {
        self.require_privileged(actor, "create policies")?;
        self.check_policy_input(input)?;

        let policy = self.write(|tx| {
            let now = self.clock.now();
            let policy = Policy {
                policy_id: PolicyId::new(),
                priority: input.priority,
                predicate: input.predicate.clone(),
                effect: input.effect,
                description: input.description.clone(),
                created_at: now,
                updated_at: now,
            };
            tx.insert_policy(&policy)?;
            record_policy_change(
                tx,
                policy.policy_id,
                PolicyChangeAction::Created,
                None,
                Some(&policy),
                actor,
                now,
            )?;
            Ok(policy)
        })?;

        info!(policy_id = %policy.policy_id, effect = policy.effect.as_str(), actor, "policy created");
        Ok(policy)
    }

    /// Replaces a policy's definition. Suggestions already past the policy
    /// gate keep the verdict they were given.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Unauthorized`], [`GovernanceError::PolicyNotFound`]
    /// or [`GovernanceError::Validation`].
    pub fn update_policy(
        &self,
        policy_id: PolicyId,
        input: &PolicyInput,
        actor: &str,
    ) -> Result<Policy, GovernanceError> {
        self.require_privileged(actor, "update policies")?;
        self.check_policy_input(input)?;

        let policy = self.write(|tx| {
            let before = tx
                .get_policy(policy_id)?
                .ok_or(GovernanceError::PolicyNotFound(policy_id))?;
            let now = self.clock.now();
            let after = Policy {
                priority: input.priority,
                predicate: input.predicate.clone(),
                effect: input.effect,
                description: input.description.clone(),
                updated_at: now,
                ..before.clone()
            };
            if !tx.replace_policy(&after)? {
                return Err(GovernanceError::PolicyNotFound(policy_id).into());
            }
            record_policy_change(
                tx,
                policy_id,
                PolicyChangeAction::Updated,
                Some(&before),
                Some(&after),
                actor,
                now,
            )?;
            Ok(after)
        })?;

        info!(policy_id = %policy_id, effect = policy.effect.as_str(), actor, "policy updated");
        Ok(policy)
    }

    /// # Errors
    /// Returns [`GovernanceError::Unauthorized`] or [`GovernanceError::PolicyNotFound`].
    pub fn delete_policy(
        &self,
        policy_id: PolicyId,
        actor: &str,
    ) -> Result<PolicyChangeRecord, GovernanceError> {
        self.require_privileged(actor, "delete policies")?;

        let change = self.write(|tx| {
            let before = tx
                .get_policy(policy_id)?
                .ok_or(GovernanceError::PolicyNotFound(policy_id))?;
            if !tx.delete_policy(policy_id)? {
                return Err(GovernanceError::PolicyNotFound(policy_id).into());
            }
            record_policy_change(
                tx,
                policy_id,
                PolicyChangeAction::Deleted,
                Some(&before),
                None,
                actor,
                self.clock.now(),
            )
        })?;

        info!(policy_id = %policy_id, actor, "policy deleted");
        Ok(change)
    }

    /// Policies in evaluation order.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Storage`] on read failures.
    pub fn list_policies(&self) -> Result<Vec<Policy>, GovernanceError> {
        self.read(|store| Ok(store.list_policies()?))
    }

    /// # Errors
    /// Returns [`GovernanceError::Storage`] on read failures.
    pub fn list_policy_changes(
        &self,
        policy_id: Option<PolicyId>,
    ) -> Result<Vec<PolicyChangeRecord>, GovernanceError> {
        self.read(|store| Ok(store.list_policy_changes(policy_id)?))
    }

    /// # Errors
    /// Returns [`GovernanceError::Storage`] on read failures.
    pub fn list_parameters(&self) -> Result<Vec<ConfigParameter>, GovernanceError> {
        self.read(|store| Ok(store.list_parameters()?))
    }

    /// # Errors
    /// Returns [`GovernanceError::UnknownParameter`] for unknown ids.
    pub fn get_parameter(&self, parameter_id: &str) -> Result<ConfigParameter, GovernanceError> {
        self.read(|store| {
            Ok(store
                .get_parameter(parameter_id)?
                .ok_or_else(|| GovernanceError::UnknownParameter(parameter_id.to_string()))?)
        })
    }

    /// Rejects predicates the configured evaluator cannot handle, so a bad
    /// policy never reaches the policy gate.
    fn check_policy_input(&self, input: &PolicyInput) -> Result<(), GovernanceError> {
        input.validate()?;
        let sample = SuggestionDraft {
            parameter_id: "sample".to_string(),
            proposed_value: "sample".to_string(),
            rationale: String::new(),
            author: "sample".to_string(),
        };
        self.evaluator
            .matches(&input.predicate, &sample)
            .map(|_| ())
            .map_err(|err| match err {
                GovernanceError::Validation(message) => GovernanceError::Validation(message),
                other => GovernanceError::Validation(format!("predicate rejected: {other}")),
            })
    }
}

fn record_policy_change(
    tx: &GovernanceTx<'_>,
    policy_id: PolicyId,
    action: PolicyChangeAction,
    before: Option<&Policy>,
    after: Option<&Policy>,
    actor: &str,
    at: OffsetDateTime,
) -> Result<PolicyChangeRecord, WriteFailure> {
    let snapshot = |policy: Option<&Policy>| -> Result<Option<Value>, WriteFailure> {
        policy
            .map(serde_json::to_value)
            .transpose()
            .map_err(|err| WriteFailure::Storage(anyhow::Error::new(err)))
    };

    let revision = tx.bump_policy_revision(at)?;
    let change = tx.append_policy_change(&NewPolicyChange {
        policy_id,
        action,
        before: snapshot(before)?,
        after: snapshot(after)?,
        actor: actor.to_string(),
        changed_at: at,
    })?;

    info!(policy_id = %policy_id, action = action.as_str(), revision, "policy set revised");
    Ok(change)
}
