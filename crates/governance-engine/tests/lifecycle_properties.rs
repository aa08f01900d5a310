use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;

use governance_core::{
    parse_rfc3339_utc, GovernanceConfig, GovernanceError, HistoryOutcome, HistoryQuery,
    HistoryRecord, ParameterDefinition, PolicyEffect, PolicyInput, SubjectRef, SuggestionId,
    SuggestionState, Tally, ValueType, VoteChoice,
};
use governance_engine::{GovernanceApi, ManualClock, ReviewDecision, SubmitSuggestion, SYSTEM_ACTOR};
use proptest::prelude::*;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

const ADMIN: &str = "admin";

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("unexpected error: {err}"),
    }
}

fn start_time() -> OffsetDateTime {
    must(parse_rfc3339_utc("2026-03-01T09:00:00Z"))
}

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("governance-engine-{}.sqlite3", Ulid::new()))
}

struct Fixture {
    api: GovernanceApi,
    clock: ManualClock,
}

fn fixture(quorum: u32) -> Fixture {
    let config = GovernanceConfig {
        quorum,
        privileged_actors: [ADMIN.to_string()].into_iter().collect(),
        ..GovernanceConfig::v1()
    };
    let clock = ManualClock::new(start_time());
    let api = must(GovernanceApi::new(temp_db(), config)).with_clock(Arc::new(clock.clone()));
    must(api.migrate());

    must(api.register_parameter(
        &ParameterDefinition {
            parameter_id: "chat.filter".to_string(),
            name: "Chat filter".to_string(),
            value: "true".to_string(),
            value_type: ValueType::Boolean,
            min_value: None,
            max_value: None,
            editable: true,
            description: "Profanity filter on public chat".to_string(),
        },
        ADMIN,
    ));
    must(api.register_parameter(
        &ParameterDefinition {
            parameter_id: "spawn.radius".to_string(),
            name: "Spawn radius".to_string(),
            value: "16".to_string(),
            value_type: ValueType::Integer,
            min_value: Some(0),
            max_value: Some(128),
            editable: true,
            description: String::new(),
        },
        ADMIN,
    ));

    Fixture { api, clock }
}

fn submit(api: &GovernanceApi, parameter_id: &str, value: &str) -> SuggestionId {
    must(api.submit_suggestion(&SubmitSuggestion {
        parameter_id: parameter_id.to_string(),
        proposed_value: value.to_string(),
        rationale: "community request".to_string(),
        author: "alice".to_string(),
    }))
    .suggestion
    .suggestion_id
}

fn cast_many(api: &GovernanceApi, suggestion_id: SuggestionId, affirm: usize, reject: usize) {
    for index in 0..affirm {
        must(api.cast_vote(suggestion_id, &format!("yes-{index}"), "affirm"));
    }
    for index in 0..reject {
        must(api.cast_vote(suggestion_id, &format!("no-{index}"), "reject"));
    }
}

fn history_for(api: &GovernanceApi, suggestion_id: SuggestionId) -> Vec<HistoryRecord> {
    must(api.list_history(&HistoryQuery::default()))
        .into_iter()
        .filter(|record| record.subject == SubjectRef::Suggestion(suggestion_id))
        .collect()
}

fn policy(predicate: &str, effect: PolicyEffect) -> PolicyInput {
    PolicyInput {
        priority: 10,
        predicate: predicate.to_string(),
        effect,
        description: String::new(),
    }
}

#[test]
fn every_resolved_suggestion_has_exactly_one_matching_history_record() {
    let Fixture { api, clock } = fixture(2);
    must(api.create_policy(&policy("value=7", PolicyEffect::Block), ADMIN));

    let accepted = submit(&api, "spawn.radius", "32");
    cast_many(&api, accepted, 2, 0);
    let rejected = submit(&api, "spawn.radius", "8");
    cast_many(&api, rejected, 0, 1);
    let withdrawn = submit(&api, "chat.filter", "false");
    must(api.withdraw(withdrawn, "alice"));
    let blocked = submit(&api, "spawn.radius", "7");

    must(api.close_suggestion(accepted, ADMIN, None));
    clock.advance(Duration::days(3));
    let sweep = must(api.sweep_expired());
    assert_eq!(sweep.resolved.len(), 1);
    assert_eq!(sweep.resolved[0].suggestion.suggestion_id, rejected);

    for suggestion_id in [accepted, rejected, withdrawn, blocked] {
        let detail = must(api.get_suggestion(suggestion_id));
        assert!(detail.suggestion.state.is_terminal());
        let records = history_for(&api, suggestion_id);
        assert_eq!(records.len(), 1, "suggestion {suggestion_id}");
        assert_eq!(
            Some(records[0].outcome),
            detail.suggestion.state.history_outcome()
        );
    }

    assert!(matches!(
        api.close_suggestion(accepted, ADMIN, None),
        Err(GovernanceError::SuggestionClosed(_))
    ));
    assert_eq!(history_for(&api, accepted).len(), 1);
}

#[test]
fn revote_by_same_voter_keeps_only_latest_choice() {
    let Fixture { api, .. } = fixture(3);
    let suggestion_id = submit(&api, "chat.filter", "false");

    must(api.cast_vote(suggestion_id, "voter-a", "affirm"));
    let tally = must(api.cast_vote(suggestion_id, "voter-a", "reject"));
    assert_eq!(
        tally,
        Tally {
            affirm: 0,
            reject: 1,
            abstain: 0,
            distinct_voters: 1,
        }
    );

    let detail = must(api.get_suggestion(suggestion_id));
    assert_eq!(detail.votes.len(), 1);
    assert_eq!(detail.votes[0].voter, "voter-a");
    assert_eq!(detail.votes[0].choice, VoteChoice::Reject);
    assert_eq!(detail.votes[0].revision, 2);
}

#[test]
fn tie_resolves_to_status_quo() {
    let Fixture { api, .. } = fixture(2);
    let suggestion_id = submit(&api, "spawn.radius", "64");
    cast_many(&api, suggestion_id, 3, 3);

    let report = must(api.close_suggestion(suggestion_id, ADMIN, None));
    assert_eq!(report.suggestion.state, SuggestionState::Rejected);
    assert_eq!(report.history.reason.as_deref(), Some("tie-status-quo"));
    assert_eq!(must(api.get_parameter("spawn.radius")).value, "16");
}

#[test]
fn majority_without_quorum_is_rejected() {
    let Fixture { api, .. } = fixture(5);
    let suggestion_id = submit(&api, "spawn.radius", "64");
    cast_many(&api, suggestion_id, 3, 1);

    let report = must(api.close_suggestion(suggestion_id, ADMIN, None));
    assert_eq!(report.tally.distinct_voters, 4);
    assert_eq!(report.suggestion.state, SuggestionState::Rejected);
    assert_eq!(report.history.reason.as_deref(), Some("quorum-not-met"));
    assert_eq!(must(api.get_parameter("spawn.radius")).value, "16");
}

#[test]
fn blocked_suggestion_never_opens_a_voting_window() {
    let Fixture { api, .. } = fixture(1);
    let blocking = must(api.create_policy(&policy("parameter=chat.filter", PolicyEffect::Block), ADMIN));

    let view = must(api.submit_suggestion(&SubmitSuggestion {
        parameter_id: "chat.filter".to_string(),
        proposed_value: "false".to_string(),
        rationale: String::new(),
        author: "alice".to_string(),
    }));
    let suggestion = view.suggestion;
    assert_eq!(suggestion.state, SuggestionState::Rejected);
    assert_eq!(suggestion.resolution_reason.as_deref(), Some("policy-blocked"));
    assert_eq!(suggestion.opened_at, None);
    assert_eq!(suggestion.voting_deadline, None);
    assert_eq!(suggestion.matched_policy_ids, vec![blocking.policy_id]);
    assert_eq!(view.remaining_seconds, 0);

    assert!(matches!(
        api.cast_vote(suggestion.suggestion_id, "bob", "affirm"),
        Err(GovernanceError::SuggestionClosed(_))
    ));
    let detail = must(api.get_suggestion(suggestion.suggestion_id));
    assert!(detail.votes.is_empty());
    assert_eq!(detail.tally, Tally::default());

    let records = history_for(&api, suggestion.suggestion_id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, HistoryOutcome::Rejected);
    assert_eq!(records[0].actor, SYSTEM_ACTOR);
}

#[test]
fn withdraw_after_resolution_fails_and_keeps_state() {
    let Fixture { api, .. } = fixture(1);
    let suggestion_id = submit(&api, "chat.filter", "false");
    cast_many(&api, suggestion_id, 1, 0);
    must(api.close_suggestion(suggestion_id, ADMIN, None));

    assert_eq!(
        api.withdraw(suggestion_id, "alice"),
        Err(GovernanceError::SuggestionClosed(suggestion_id))
    );
    let detail = must(api.get_suggestion(suggestion_id));
    assert_eq!(detail.suggestion.state, SuggestionState::Accepted);
    assert_eq!(history_for(&api, suggestion_id).len(), 1);
}

#[test]
fn withdraw_after_deadline_closes_the_vote_instead() {
    let Fixture { api, clock } = fixture(1);
    let suggestion_id = submit(&api, "spawn.radius", "48");
    cast_many(&api, suggestion_id, 3, 0);

    clock.advance(Duration::days(3));
    assert_eq!(
        api.withdraw(suggestion_id, "alice"),
        Err(GovernanceError::SuggestionClosed(suggestion_id))
    );

    let detail = must(api.get_suggestion(suggestion_id));
    assert_eq!(detail.suggestion.state, SuggestionState::Accepted);
    assert_eq!(must(api.get_parameter("spawn.radius")).value, "48");
    let records = history_for(&api, suggestion_id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, HistoryOutcome::Accepted);
}

#[test]
fn withdraw_after_deadline_leaves_review_flagged_suggestion_open() {
    let Fixture { api, clock } = fixture(1);
    must(api.create_policy(&policy("parameter=chat.filter", PolicyEffect::RequireReview), ADMIN));
    let suggestion_id = submit(&api, "chat.filter", "false");

    clock.advance(Duration::days(3));
    assert_eq!(
        api.withdraw(suggestion_id, "alice"),
        Err(GovernanceError::SuggestionClosed(suggestion_id))
    );
    let detail = must(api.get_suggestion(suggestion_id));
    assert_eq!(detail.suggestion.state, SuggestionState::Open);
    assert!(history_for(&api, suggestion_id).is_empty());
}

#[test]
fn racing_closers_resolve_each_suggestion_exactly_once() {
    let Fixture { api, clock } = fixture(1);
    let closers = 4_usize;

    for round in 0..10 {
        let suggestion_id = submit(&api, "spawn.radius", &(20 + round).to_string());
        cast_many(&api, suggestion_id, 1, 0);
        clock.advance(Duration::days(3));

        let barrier = Arc::new(Barrier::new(closers + 1));
        let close_handles = (0..closers)
            .map(|_| {
                let api = api.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    api.close_suggestion(suggestion_id, ADMIN, None)
                })
            })
            .collect::<Vec<_>>();
        let sweep_handle = {
            let api = api.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                api.sweep_expired()
            })
        };

        let mut winners = 0_usize;
        let mut losers = 0_usize;
        for handle in close_handles {
            match handle.join() {
                Ok(Ok(_)) => winners += 1,
                Ok(Err(GovernanceError::SuggestionClosed(id))) if id == suggestion_id => {
                    losers += 1;
                }
                Ok(Err(err)) => panic!("unexpected close error in round {round}: {err}"),
                Err(_) => panic!("close thread panicked"),
            }
        }
        let sweep = match sweep_handle.join() {
            Ok(result) => must(result),
            Err(_) => panic!("sweep thread panicked"),
        };
        assert_eq!(sweep.conflicts, 0);
        assert_eq!(sweep.failures, 0);
        winners += sweep.resolved.len();

        assert_eq!(winners, 1, "round {round}");
        assert!(losers >= closers - 1, "round {round}");
        assert_eq!(history_for(&api, suggestion_id).len(), 1, "round {round}");
        assert_eq!(
            must(api.get_suggestion(suggestion_id)).suggestion.state,
            SuggestionState::Accepted
        );
    }
}

#[test]
fn concurrent_casts_from_distinct_voters_all_count() {
    let Fixture { api, .. } = fixture(3);
    let suggestion_id = submit(&api, "spawn.radius", "48");
    let choices = ["affirm", "reject", "abstain"];
    let voters = 12_usize;

    let handles = (0..voters)
        .map(|index| {
            let api = api.clone();
            thread::spawn(move || {
                api.cast_vote(suggestion_id, &format!("voter-{index}"), choices[index % 3])
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        match handle.join() {
            Ok(result) => {
                must(result);
            }
            Err(_) => panic!("vote thread panicked"),
        }
    }

    assert_eq!(
        must(api.tally(suggestion_id)),
        Tally {
            affirm: 4,
            reject: 4,
            abstain: 4,
            distinct_voters: 12,
        }
    );
}

#[test]
fn admin_set_writes_value_and_one_history_record() {
    let Fixture { api, .. } = fixture(3);
    let before = must(api.list_history(&HistoryQuery::default())).len();

    let change = must(api.set_parameter("spawn.radius", "100", ADMIN));
    assert_eq!(change.parameter.value, "100");
    assert!(matches!(change.parameter.last_modified_by, SubjectRef::AdminOverride(_)));

    let history = must(api.list_history(&HistoryQuery::default()));
    assert_eq!(history.len(), before + 1);
    let latest = &history[history.len() - 1];
    assert_eq!(latest.record_id, change.history.record_id);
    assert_eq!(latest.requested_value, "100");
    assert_eq!(latest.previous_value.as_deref(), Some("16"));
    assert_eq!(latest.reason.as_deref(), Some("admin-override"));
    assert_eq!(must(api.get_parameter("spawn.radius")).value, "100");
}

#[test]
fn accepted_close_applies_value_with_suggestion_subject() {
    let Fixture { api, .. } = fixture(2);
    let suggestion_id = submit(&api, "chat.filter", "false");
    cast_many(&api, suggestion_id, 2, 1);

    let report = must(api.close_suggestion(suggestion_id, ADMIN, None));
    assert_eq!(report.suggestion.state, SuggestionState::Accepted);
    assert_eq!(report.history.previous_value.as_deref(), Some("true"));

    let parameter = must(api.get_parameter("chat.filter"));
    assert_eq!(parameter.value, "false");
    assert_eq!(parameter.last_modified_by, SubjectRef::Suggestion(suggestion_id));
}

#[test]
fn early_close_requires_privilege_but_deadline_close_does_not() {
    let Fixture { api, clock } = fixture(1);
    let suggestion_id = submit(&api, "spawn.radius", "20");
    cast_many(&api, suggestion_id, 1, 0);

    assert!(matches!(
        api.close_suggestion(suggestion_id, "bob", None),
        Err(GovernanceError::Unauthorized { .. })
    ));

    clock.advance(Duration::days(2));
    let report = must(api.close_suggestion(suggestion_id, "bob", None));
    assert_eq!(report.suggestion.state, SuggestionState::Accepted);
    assert_eq!(report.history.actor, "bob");
}

#[test]
fn late_vote_closes_expired_suggestion() {
    let Fixture { api, clock } = fixture(1);
    let suggestion_id = submit(&api, "spawn.radius", "20");
    cast_many(&api, suggestion_id, 1, 0);

    clock.advance(Duration::days(2) + Duration::seconds(1));
    assert_eq!(
        api.cast_vote(suggestion_id, "late", "reject"),
        Err(GovernanceError::SuggestionClosed(suggestion_id))
    );

    let detail = must(api.get_suggestion(suggestion_id));
    assert_eq!(detail.suggestion.state, SuggestionState::Accepted);
    assert_eq!(detail.tally.distinct_voters, 1);
    assert_eq!(must(api.get_parameter("spawn.radius")).value, "20");
}

#[test]
fn review_flagged_suggestions_wait_for_a_privileged_decision() {
    let Fixture { api, clock } = fixture(3);
    must(api.create_policy(
        &policy("parameter=chat.filter && value=false", PolicyEffect::RequireReview),
        ADMIN,
    ));
    let suggestion_id = submit(&api, "chat.filter", "false");
    assert!(must(api.get_suggestion(suggestion_id)).suggestion.requires_review);

    clock.advance(Duration::days(5));
    assert!(must(api.sweep_expired()).resolved.is_empty());
    assert!(matches!(
        api.close_suggestion(suggestion_id, "bob", None),
        Err(GovernanceError::Unauthorized { .. })
    ));

    let report = must(api.close_suggestion(suggestion_id, ADMIN, Some(ReviewDecision::Accept)));
    assert_eq!(report.suggestion.state, SuggestionState::Accepted);
    assert_eq!(report.history.reason.as_deref(), Some("review-accepted"));
    assert_eq!(must(api.get_parameter("chat.filter")).value, "false");
}

#[test]
fn forced_outcome_is_refused_without_review_flag() {
    let Fixture { api, .. } = fixture(3);
    let suggestion_id = submit(&api, "spawn.radius", "20");
    assert!(matches!(
        api.close_suggestion(suggestion_id, ADMIN, Some(ReviewDecision::Accept)),
        Err(GovernanceError::Validation(_))
    ));
    assert_eq!(
        must(api.get_suggestion(suggestion_id)).suggestion.state,
        SuggestionState::Open
    );
}

#[test]
fn policy_changes_do_not_affect_suggestions_already_open() {
    let Fixture { api, .. } = fixture(1);
    let suggestion_id = submit(&api, "spawn.radius", "20");
    let revision_at_submit = must(api.get_suggestion(suggestion_id)).suggestion.policy_revision;

    let created = must(api.create_policy(&policy("*", PolicyEffect::Block), ADMIN));
    must(api.cast_vote(suggestion_id, "bob", "affirm"));
    let report = must(api.close_suggestion(suggestion_id, ADMIN, None));
    assert_eq!(report.suggestion.state, SuggestionState::Accepted);
    assert_eq!(report.suggestion.policy_revision, revision_at_submit);

    must(api.update_policy(created.policy_id, &policy("value=1", PolicyEffect::Block), ADMIN));
    must(api.delete_policy(created.policy_id, ADMIN));
    let changes = must(api.list_policy_changes(Some(created.policy_id)));
    let actions = changes.iter().map(|change| change.action.as_str()).collect::<Vec<_>>();
    assert_eq!(actions, vec!["created", "updated", "deleted"]);
    assert!(changes[0].before.is_none());
    assert!(changes[2].after.is_none());
    assert!(must(api.list_policies()).is_empty());
}

#[test]
fn invalid_predicates_are_rejected_at_policy_creation() {
    let Fixture { api, .. } = fixture(1);
    assert!(matches!(
        api.create_policy(&policy("parameter= && ???", PolicyEffect::Block), ADMIN),
        Err(GovernanceError::Validation(_))
    ));
    assert!(must(api.list_policy_changes(None)).is_empty());
}

#[test]
fn submit_rejects_bad_targets_and_values() {
    let Fixture { api, .. } = fixture(1);
    let request = |parameter_id: &str, value: &str| SubmitSuggestion {
        parameter_id: parameter_id.to_string(),
        proposed_value: value.to_string(),
        rationale: String::new(),
        author: "alice".to_string(),
    };

    assert_eq!(
        api.submit_suggestion(&request("missing.param", "1")),
        Err(GovernanceError::UnknownParameter("missing.param".to_string()))
    );
    assert!(matches!(
        api.submit_suggestion(&request("spawn.radius", "500")),
        Err(GovernanceError::InvalidValue { .. })
    ));
    assert!(matches!(
        api.submit_suggestion(&request("spawn.radius", "")),
        Err(GovernanceError::Validation(_))
    ));

    must(api.register_parameter(
        &ParameterDefinition {
            parameter_id: "server.seed".to_string(),
            name: "World seed".to_string(),
            value: "42".to_string(),
            value_type: ValueType::String,
            min_value: None,
            max_value: None,
            editable: false,
            description: String::new(),
        },
        ADMIN,
    ));
    assert_eq!(
        api.submit_suggestion(&request("server.seed", "7")),
        Err(GovernanceError::ParameterNotEditable("server.seed".to_string()))
    );
    must(api.set_parameter("server.seed", "7", ADMIN));
}

#[test]
fn votes_validate_choice_after_state() {
    let Fixture { api, .. } = fixture(1);
    let suggestion_id = submit(&api, "spawn.radius", "20");
    assert_eq!(
        api.cast_vote(suggestion_id, "bob", "maybe"),
        Err(GovernanceError::InvalidChoice("maybe".to_string()))
    );

    let unknown = SuggestionId::new();
    assert_eq!(
        api.cast_vote(unknown, "bob", "maybe"),
        Err(GovernanceError::SuggestionNotFound(unknown))
    );

    must(api.withdraw(suggestion_id, "alice"));
    assert_eq!(
        api.cast_vote(suggestion_id, "bob", "maybe"),
        Err(GovernanceError::SuggestionClosed(suggestion_id))
    );
}

#[test]
fn only_the_author_may_withdraw() {
    let Fixture { api, .. } = fixture(1);
    let suggestion_id = submit(&api, "spawn.radius", "20");
    assert!(matches!(
        api.withdraw(suggestion_id, "mallory"),
        Err(GovernanceError::Unauthorized { .. })
    ));

    let report = must(api.withdraw(suggestion_id, "alice"));
    assert_eq!(report.suggestion.state, SuggestionState::Withdrawn);
    assert_eq!(report.history.outcome, HistoryOutcome::Withdrawn);
    assert_eq!(must(api.get_parameter("spawn.radius")).value, "16");
}

#[test]
fn comments_are_allowed_after_resolution() {
    let Fixture { api, .. } = fixture(1);
    let suggestion_id = submit(&api, "spawn.radius", "20");
    must(api.post_comment(suggestion_id, "bob", "seems fine"));
    must(api.withdraw(suggestion_id, "alice"));
    must(api.post_comment(suggestion_id, "carol", "too late"));

    let comments = must(api.list_comments(suggestion_id));
    let authors = comments.iter().map(|comment| comment.author.as_str()).collect::<Vec<_>>();
    assert_eq!(authors, vec!["bob", "carol"]);

    let unknown = SuggestionId::new();
    assert_eq!(
        api.post_comment(unknown, "bob", "hello").map(|comment| comment.text),
        Err(GovernanceError::SuggestionNotFound(unknown))
    );
}

#[test]
fn rollback_restores_previous_value() {
    let Fixture { api, .. } = fixture(1);
    let change = must(api.set_parameter("spawn.radius", "90", ADMIN));

    let restored = must(api.rollback(change.history.record_id, ADMIN));
    assert_eq!(restored.parameter.value, "16");
    assert_eq!(
        restored.history.reason,
        Some(format!("rollback:{}", change.history.record_id))
    );

    assert!(matches!(
        api.rollback(change.history.record_id, "bob"),
        Err(GovernanceError::Unauthorized { .. })
    ));

    let registered = must(api.list_history(&HistoryQuery {
        parameter_id: Some("chat.filter".to_string()),
        ..HistoryQuery::default()
    }));
    assert_eq!(registered.len(), 1);
    assert!(matches!(
        api.rollback(registered[0].record_id, ADMIN),
        Err(GovernanceError::Validation(_))
    ));
}

#[test]
fn history_filters_by_parameter_and_time_range() {
    let Fixture { api, clock } = fixture(1);
    clock.advance(Duration::hours(1));
    must(api.set_parameter("spawn.radius", "30", ADMIN));
    clock.advance(Duration::hours(1));
    must(api.set_parameter("spawn.radius", "40", ADMIN));
    must(api.set_parameter("chat.filter", "false", ADMIN));

    let window = must(api.list_history(&HistoryQuery {
        parameter_id: Some("spawn.radius".to_string()),
        from: Some(start_time() + Duration::minutes(30)),
        to: Some(start_time() + Duration::minutes(90)),
        limit: None,
    }));
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].requested_value, "30");

    let all = must(api.list_history(&HistoryQuery::default()));
    assert!(all.windows(2).all(|pair| pair[0].resolved_at <= pair[1].resolved_at));

    assert!(matches!(
        api.list_history(&HistoryQuery {
            from: Some(start_time() + Duration::hours(2)),
            to: Some(start_time()),
            ..HistoryQuery::default()
        }),
        Err(GovernanceError::Validation(_))
    ));
}

#[test]
fn open_listing_reports_live_tally_and_remaining_time() {
    let Fixture { api, clock } = fixture(3);
    let suggestion_id = submit(&api, "spawn.radius", "20");
    must(api.cast_vote(suggestion_id, "bob", "affirm"));
    clock.advance(Duration::hours(1));

    let open = must(api.list_open_suggestions());
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].tally.affirm, 1);
    assert_eq!(open[0].remaining_seconds, 47 * 60 * 60);
}

#[test]
fn non_admins_cannot_use_the_admin_gateway() {
    let Fixture { api, .. } = fixture(1);
    assert!(matches!(
        api.set_parameter("spawn.radius", "1", "bob"),
        Err(GovernanceError::Unauthorized { .. })
    ));
    assert!(matches!(
        api.create_policy(&policy("*", PolicyEffect::Block), "bob"),
        Err(GovernanceError::Unauthorized { .. })
    ));
    assert_eq!(must(api.get_parameter("spawn.radius")).value, "16");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn final_tally_reflects_each_voters_last_choice(
        casts in proptest::collection::vec((0_usize..4, 0_usize..3), 1..16)
    ) {
        let Fixture { api, .. } = fixture(1);
        let suggestion_id = submit(&api, "spawn.radius", "20");
        let choices = ["affirm", "reject", "abstain"];

        let mut latest = BTreeMap::new();
        for (voter, choice) in &casts {
            must(api.cast_vote(suggestion_id, &format!("voter-{voter}"), choices[*choice]));
            latest.insert(*voter, must(choices[*choice].parse::<VoteChoice>()));
        }

        prop_assert_eq!(
            must(api.tally(suggestion_id)),
            Tally::from_choices(latest.values().copied())
        );
    }
}
