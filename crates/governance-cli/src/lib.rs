//! `govctl`: command-line surface over [`GovernanceApi`].
//!
//! Every command prints its result as pretty JSON on stdout. Logs go to
//! stderr so stdout stays machine-readable.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use governance_core::{
    parse_rfc3339_utc, GovernanceError, HistoryQuery, ParameterDefinition, PolicyEffect, PolicyId,
    PolicyInput, RecordId, SuggestionId, SuggestionState, ValueType,
};
use governance_engine::{load_config, GovernanceApi, ReviewDecision, SubmitSuggestion};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "govctl")]
#[command(about = "Parameter governance CLI")]
pub struct Cli {
    #[arg(long, default_value = "./governance.sqlite3")]
    db: PathBuf,

    /// JSON governance config; defaults apply when the file is absent.
    #[arg(long, default_value = "./governance.json")]
    config: PathBuf,

    #[arg(long, default_value = "warn")]
    log_level: String,

    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Parameter {
        #[command(subcommand)]
        command: Box<ParameterCommand>,
    },
    Suggestion {
        #[command(subcommand)]
        command: Box<SuggestionCommand>,
    },
    Vote {
        #[command(subcommand)]
        command: Box<VoteCommand>,
    },
    Comment {
        #[command(subcommand)]
        command: Box<CommentCommand>,
    },
    History {
        #[command(subcommand)]
        command: Box<HistoryCommand>,
    },
    Policy {
        #[command(subcommand)]
        command: Box<PolicyCommand>,
    },
    Admin {
        #[command(subcommand)]
        command: Box<AdminCommand>,
    },
    /// Close every open suggestion whose voting deadline has passed.
    Sweep,
}

#[derive(Debug, Subcommand)]
pub enum ParameterCommand {
    List,
    Show(ParameterShowArgs),
}

#[derive(Debug, Args)]
pub struct ParameterShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
pub enum SuggestionCommand {
    Submit(SuggestionSubmitArgs),
    List(SuggestionListArgs),
    Show(SuggestionIdArgs),
    Close(SuggestionCloseArgs),
    Withdraw(SuggestionActorArgs),
}

#[derive(Debug, Args)]
pub struct SuggestionSubmitArgs {
    #[arg(long)]
    parameter: String,
    #[arg(long)]
    value: String,
    #[arg(long, default_value = "")]
    rationale: String,
    #[arg(long)]
    author: String,
}

#[derive(Debug, Args)]
pub struct SuggestionListArgs {
    /// Defaults to open suggestions.
    #[arg(long)]
    state: Option<StateArg>,
    #[arg(long)]
    all: bool,
}

#[derive(Debug, Args)]
pub struct SuggestionIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct SuggestionActorArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
pub struct SuggestionCloseArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    actor: String,
    /// Reviewer-imposed outcome for suggestions under review.
    #[arg(long)]
    decision: Option<DecisionArg>,
}

#[derive(Debug, Subcommand)]
pub enum VoteCommand {
    Cast(VoteCastArgs),
    Tally(SuggestionRefArgs),
}

#[derive(Debug, Args)]
pub struct VoteCastArgs {
    #[arg(long)]
    suggestion: String,
    #[arg(long)]
    voter: String,
    /// affirm, reject or abstain
    #[arg(long)]
    choice: String,
}

#[derive(Debug, Args)]
pub struct SuggestionRefArgs {
    #[arg(long)]
    suggestion: String,
}

#[derive(Debug, Subcommand)]
pub enum CommentCommand {
    Post(CommentPostArgs),
    List(SuggestionRefArgs),
}

#[derive(Debug, Args)]
pub struct CommentPostArgs {
    #[arg(long)]
    suggestion: String,
    #[arg(long)]
    author: String,
    #[arg(long)]
    text: String,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    List(HistoryListArgs),
    Show(HistoryShowArgs),
}

#[derive(Debug, Args)]
pub struct HistoryListArgs {
    #[arg(long)]
    parameter: Option<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct HistoryShowArgs {
    #[arg(long)]
    record: String,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    List,
    Create(PolicyCreateArgs),
    Update(PolicyUpdateArgs),
    Delete(PolicyDeleteArgs),
    Changes(PolicyChangesArgs),
}

#[derive(Debug, Args)]
pub struct PolicyFields {
    #[arg(long, default_value_t = 100)]
    priority: i64,
    #[arg(long)]
    predicate: String,
    #[arg(long)]
    effect: EffectArg,
    #[arg(long, default_value = "")]
    description: String,
}

#[derive(Debug, Args)]
pub struct PolicyCreateArgs {
    #[command(flatten)]
    fields: PolicyFields,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
pub struct PolicyUpdateArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    fields: PolicyFields,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
pub struct PolicyDeleteArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
pub struct PolicyChangesArgs {
    #[arg(long)]
    id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    Register(AdminRegisterArgs),
    Set(AdminSetArgs),
    Rollback(AdminRollbackArgs),
}

#[derive(Debug, Args)]
pub struct AdminRegisterArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    value: String,
    #[arg(long = "type")]
    value_type: TypeArg,
    #[arg(long)]
    min: Option<i64>,
    #[arg(long)]
    max: Option<i64>,
    /// Register the parameter closed to suggestions.
    #[arg(long)]
    locked: bool,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
pub struct AdminSetArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    value: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
pub struct AdminRollbackArgs {
    #[arg(long)]
    record: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StateArg {
    Open,
    Accepted,
    Rejected,
    Withdrawn,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DecisionArg {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EffectArg {
    Block,
    RequireReview,
    #[value(name = "none")]
    Informational,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TypeArg {
    Boolean,
    Integer,
    String,
    List,
}

/// Installs the stderr log subscriber. A subscriber installed earlier by an
/// embedding host wins.
pub fn init_logging(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(err) = result {
        tracing::debug!(error = %err, "log subscriber already installed");
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, migration or the command
/// itself fails. Engine failures keep their [`GovernanceError`] so callers can
/// recover the error kind.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_logging(&cli.log_level, cli.log_json);
    let config = load_config(&cli.config)?;
    let api = GovernanceApi::new(&cli.db, config)?;
    api.migrate()?;
    run_command(&api, cli.command)
}

/// Runs one command against an already-migrated engine handle.
///
/// # Errors
/// Returns an error when argument decoding or the engine call fails.
pub fn run_command(api: &GovernanceApi, command: Command) -> Result<()> {
    match command {
        Command::Parameter { command } => match *command {
            ParameterCommand::List => print_json(&api.list_parameters()?),
            ParameterCommand::Show(args) => print_json(&api.get_parameter(&args.id)?),
        },
        Command::Suggestion { command } => run_suggestion(api, *command),
        Command::Vote { command } => match *command {
            VoteCommand::Cast(args) => {
                let suggestion_id = parse_suggestion_id(&args.suggestion)?;
                print_json(&api.cast_vote(suggestion_id, &args.voter, &args.choice)?)
            }
            VoteCommand::Tally(args) => {
                print_json(&api.tally(parse_suggestion_id(&args.suggestion)?)?)
            }
        },
        Command::Comment { command } => match *command {
            CommentCommand::Post(args) => {
                let suggestion_id = parse_suggestion_id(&args.suggestion)?;
                print_json(&api.post_comment(suggestion_id, &args.author, &args.text)?)
            }
            CommentCommand::List(args) => {
                print_json(&api.list_comments(parse_suggestion_id(&args.suggestion)?)?)
            }
        },
        Command::History { command } => match *command {
            HistoryCommand::List(args) => {
                let query = HistoryQuery {
                    parameter_id: args.parameter,
                    from: parse_optional_utc(args.from.as_deref())?,
                    to: parse_optional_utc(args.to.as_deref())?,
                    limit: args.limit,
                };
                print_json(&api.list_history(&query)?)
            }
            HistoryCommand::Show(args) => {
                print_json(&api.get_history_record(parse_record_id(&args.record)?)?)
            }
        },
        Command::Policy { command } => run_policy(api, *command),
        Command::Admin { command } => run_admin(api, *command),
        Command::Sweep => print_json(&api.sweep_expired()?),
    }
}

fn run_suggestion(api: &GovernanceApi, command: SuggestionCommand) -> Result<()> {
    match command {
        SuggestionCommand::Submit(args) => {
            let view = api.submit_suggestion(&SubmitSuggestion {
                parameter_id: args.parameter,
                proposed_value: args.value,
                rationale: args.rationale,
                author: args.author,
            })?;
            print_json(&view)
        }
        SuggestionCommand::List(args) => {
            let state = if args.all {
                None
            } else {
                Some(args.state.map_or(SuggestionState::Open, map_state))
            };
            print_json(&api.list_suggestions(state)?)
        }
        SuggestionCommand::Show(args) => {
            print_json(&api.get_suggestion(parse_suggestion_id(&args.id)?)?)
        }
        SuggestionCommand::Close(args) => {
            let decision = args.decision.map(|value| match value {
                DecisionArg::Accept => ReviewDecision::Accept,
                DecisionArg::Reject => ReviewDecision::Reject,
            });
            let report =
                api.close_suggestion(parse_suggestion_id(&args.id)?, &args.actor, decision)?;
            print_json(&report)
        }
        SuggestionCommand::Withdraw(args) => {
            print_json(&api.withdraw(parse_suggestion_id(&args.id)?, &args.actor)?)
        }
    }
}

fn run_policy(api: &GovernanceApi, command: PolicyCommand) -> Result<()> {
    match command {
        PolicyCommand::List => print_json(&api.list_policies()?),
        PolicyCommand::Create(args) => {
            print_json(&api.create_policy(&policy_input(args.fields), &args.actor)?)
        }
        PolicyCommand::Update(args) => {
            let policy_id = parse_policy_id(&args.id)?;
            print_json(&api.update_policy(policy_id, &policy_input(args.fields), &args.actor)?)
        }
        PolicyCommand::Delete(args) => {
            print_json(&api.delete_policy(parse_policy_id(&args.id)?, &args.actor)?)
        }
        PolicyCommand::Changes(args) => {
            let policy_id = args.id.as_deref().map(parse_policy_id).transpose()?;
            print_json(&api.list_policy_changes(policy_id)?)
        }
    }
}

fn run_admin(api: &GovernanceApi, command: AdminCommand) -> Result<()> {
    match command {
        AdminCommand::Register(args) => {
            let definition = ParameterDefinition {
                parameter_id: args.id,
                name: args.name,
                value: args.value,
                value_type: map_type(args.value_type),
                min_value: args.min,
                max_value: args.max,
                editable: !args.locked,
                description: args.description,
            };
            print_json(&api.register_parameter(&definition, &args.actor)?)
        }
        AdminCommand::Set(args) => {
            print_json(&api.set_parameter(&args.id, &args.value, &args.actor)?)
        }
        AdminCommand::Rollback(args) => {
            print_json(&api.rollback(parse_record_id(&args.record)?, &args.actor)?)
        }
    }
}

/// Structured failure body written to stderr by the binary.
#[must_use]
pub fn error_json(err: &anyhow::Error) -> serde_json::Value {
    let code = err
        .downcast_ref::<GovernanceError>()
        .map_or("cli_error", GovernanceError::kind);
    json!({
        "error": {
            "code": code,
            "message": format!("{err:#}"),
        }
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn policy_input(fields: PolicyFields) -> PolicyInput {
    PolicyInput {
        priority: fields.priority,
        predicate: fields.predicate,
        effect: match fields.effect {
            EffectArg::Block => PolicyEffect::Block,
            EffectArg::RequireReview => PolicyEffect::RequireReview,
            EffectArg::Informational => PolicyEffect::Informational,
        },
        description: fields.description,
    }
}

fn map_state(value: StateArg) -> SuggestionState {
    match value {
        StateArg::Open => SuggestionState::Open,
        StateArg::Accepted => SuggestionState::Accepted,
        StateArg::Rejected => SuggestionState::Rejected,
        StateArg::Withdrawn => SuggestionState::Withdrawn,
    }
}

fn map_type(value: TypeArg) -> ValueType {
    match value {
        TypeArg::Boolean => ValueType::Boolean,
        TypeArg::Integer => ValueType::Integer,
        TypeArg::String => ValueType::String,
        TypeArg::List => ValueType::List,
    }
}

fn parse_optional_utc(raw: Option<&str>) -> Result<Option<time::OffsetDateTime>> {
    raw.map(|value| parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")))
        .transpose()
}

fn parse_suggestion_id(raw: &str) -> Result<SuggestionId> {
    raw.parse()
        .with_context(|| format!("invalid suggestion id: {raw}"))
}

fn parse_policy_id(raw: &str) -> Result<PolicyId> {
    raw.parse().with_context(|| format!("invalid policy id: {raw}"))
}

fn parse_record_id(raw: &str) -> Result<RecordId> {
    raw.parse().with_context(|| format!("invalid history record id: {raw}"))
}
