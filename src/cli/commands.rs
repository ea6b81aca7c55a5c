//! CLI command definitions for story-forge.
//!
//! `run` handles one request; `chat` reads requests line by line from stdin
//! and keeps one session across turns. Events are printed as they arrive,
//! either as text or as JSON lines.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::llm::{LiteLlmClient, LlmGenerationCapability};
use crate::pipeline::{
    PerspectiveModeration, PipelineConfig, PipelineEvent, PipelineOrchestrator, PipelineRun,
};
use crate::session::{InMemorySessionStore, SessionKey, SessionStore};

/// Default user id for local sessions.
const DEFAULT_USER: &str = "local";

/// Default session id for local sessions.
const DEFAULT_SESSION: &str = "default";

/// Multi-agent story generation pipeline.
#[derive(Parser)]
#[command(name = "story-forge")]
#[command(about = "Create, edit and discuss stories through a multi-agent pipeline")]
#[command(version)]
#[command(
    long_about = "story-forge routes each request through a safety check and a classifier, then creates a new story, edits the current one, or answers a question about it.\n\nExample usage:\n  story-forge run \"A 10-minute sci-fi story for a 10-year-old\"\n  story-forge chat --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Handle a single request.
    Run(RunArgs),

    /// Hold a conversation on one session, one request per line.
    Chat(ChatArgs),
}

/// Options shared by every command that builds an orchestrator.
#[derive(Parser, Debug, Clone)]
pub struct PipelineArgs {
    /// YAML configuration file. STORY_FORGE_* variables override it.
    #[arg(short = 'c', long)]
    pub config: Option<String>,

    /// Model used for every generation task (defaults to LITELLM_DEFAULT_MODEL).
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Override the maximum number of refinement revisions.
    #[arg(long)]
    pub max_refinement_iterations: Option<u32>,

    /// Skip the critique and revision loop.
    #[arg(long)]
    pub no_refinement: bool,

    /// Block requests when the moderation service is unavailable.
    #[arg(long)]
    pub fail_closed: bool,

    /// Print events as JSON lines.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Print Prometheus metrics when done.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `story-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// The request text.
    pub text: String,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Arguments for `story-forge chat`.
#[derive(Parser, Debug)]
pub struct ChatArgs {
    /// User id of the session.
    #[arg(long, default_value = DEFAULT_USER)]
    pub user: String,

    /// Session id.
    #[arg(long, default_value = DEFAULT_SESSION)]
    pub session: String,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the story-forge CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_run_command(args).await,
        Commands::Chat(args) => run_chat_command(args).await,
    }
}

/// Resolves configuration: defaults, then file, then environment, then flags.
fn load_config(args: &PipelineArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config file {}", path))?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides(|key| std::env::var(key).ok())?;

    if let Some(max) = args.max_refinement_iterations {
        config = config.with_max_refinement_iterations(max);
    }
    if args.no_refinement {
        config = config.with_refinement(false);
    }
    if args.fail_closed {
        config = config.with_fail_open(false);
    }
    config.validate()?;
    Ok(config)
}

fn build_orchestrator(args: &PipelineArgs) -> anyhow::Result<Arc<PipelineOrchestrator>> {
    let config = load_config(args)?;

    let provider = Arc::new(LiteLlmClient::from_env().context(
        "LITELLM_API_BASE must point at an OpenAI-compatible chat completions endpoint",
    )?);
    let mut capability = LlmGenerationCapability::new(provider).with_temperature(config.temperature);
    if let Some(model) = &args.model {
        capability = capability.with_model(model.clone());
    }

    let moderation = PerspectiveModeration::from_env()?;
    if !moderation.is_configured() {
        tracing::warn!(
            fail_open = config.fail_open_on_moderation_unavailable,
            "PERSPECTIVE_API_KEY not set, moderation policy decides every request"
        );
    }

    let orchestrator = PipelineOrchestrator::builder()
        .capability(Arc::new(capability))
        .moderation(Arc::new(moderation))
        .config(config)
        .build()?;
    Ok(Arc::new(orchestrator))
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling run");
            token.cancel();
        }
    });
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(&args.pipeline)?;
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let key = SessionKey::new(DEFAULT_USER, DEFAULT_SESSION);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let run = stream_run(&orchestrator, &args.text, store, key, cancel, args.pipeline.json).await?;
    if args.pipeline.metrics {
        print!("{}", orchestrator.metrics().export());
    }
    if let Some(err) = run.error() {
        anyhow::bail!("{} ({})", err, err.kind());
    }
    Ok(())
}

async fn run_chat_command(args: ChatArgs) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(&args.pipeline)?;
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let key = SessionKey::new(args.user.clone(), args.session.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if !args.pipeline.json {
            print!("> ");
            std::io::stdout().flush()?;
        }
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if matches!(text, "exit" | "quit") {
            break;
        }

        let cancel = CancellationToken::new();
        let run = stream_run(
            &orchestrator,
            text,
            store.clone(),
            key.clone(),
            cancel,
            args.pipeline.json,
        )
        .await?;
        tracing::debug!(run_id = %run.run_id, status = %run.status(), "Turn finished");
    }

    if args.pipeline.metrics {
        print!("{}", orchestrator.metrics().export());
    }
    Ok(())
}

/// Runs one request and prints its events as they arrive.
async fn stream_run(
    orchestrator: &Arc<PipelineOrchestrator>,
    text: &str,
    store: Arc<dyn SessionStore>,
    key: SessionKey,
    cancel: CancellationToken,
    json: bool,
) -> anyhow::Result<PipelineRun> {
    let (mut events, handle) = orchestrator.stream(text, store, key, cancel);
    while let Some(event) = events.next().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
    }
    handle.await.context("Pipeline task panicked")
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Status { message, .. } => println!("· {}", message),
        PipelineEvent::Draft { story, .. } => {
            println!("\n=== Draft: {} ===", story.title);
            println!("{} words, ~{} min", story.word_count, story.estimated_reading_time_minutes);
        }
        PipelineEvent::Critique {
            iteration,
            critique,
            ..
        } => match &critique.feedback {
            Some(feedback) => println!("· Critique #{}: {}\n  {}", iteration, critique.verdict, feedback),
            None => println!("· Critique #{}: {}", iteration, critique.verdict),
        },
        PipelineEvent::Refined {
            iteration, story, ..
        } => println!("· Revision #{}: {} ({} words)", iteration, story.title, story.word_count),
        PipelineEvent::Edited { story, .. } => println!("· Edited: {}", story.title),
        PipelineEvent::Answer { .. } => {}
        PipelineEvent::Error { kind, message, .. } => eprintln!("✗ {}: {}", kind, message),
        PipelineEvent::Complete { mode, artifact, .. } => {
            if let Some(story) = artifact.as_story() {
                println!("\n=== {} ===\n", story.title);
                println!("{}", story.text);
                println!(
                    "\n({} words, ~{} min, {})",
                    story.word_count, story.estimated_reading_time_minutes, story.reading_level
                );
            } else if let Some(answer) = artifact.as_answer() {
                println!("\n{}", answer.text);
            }
            println!("✓ {} complete", mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["story-forge", "run", "a story about otters"])
            .expect("should parse");
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.text, "a story about otters");
                assert!(args.pipeline.config.is_none());
                assert!(args.pipeline.model.is_none());
                assert!(!args.pipeline.json);
                assert!(!args.pipeline.fail_closed);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_chat_command_with_options() {
        let cli = Cli::try_parse_from([
            "story-forge",
            "chat",
            "--user",
            "alice",
            "--session",
            "bedtime",
            "--max-refinement-iterations",
            "0",
            "--fail-closed",
            "-j",
            "-l",
            "debug",
        ])
        .expect("should parse");
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Chat(args) => {
                assert_eq!(args.user, "alice");
                assert_eq!(args.session, "bedtime");
                assert_eq!(args.pipeline.max_refinement_iterations, Some(0));
                assert!(args.pipeline.fail_closed);
                assert!(args.pipeline.json);
            }
            _ => panic!("Expected Chat command"),
        }
    }

    #[test]
    fn test_load_config_applies_flags() {
        let args = PipelineArgs {
            config: None,
            model: None,
            max_refinement_iterations: Some(1),
            no_refinement: true,
            fail_closed: true,
            json: false,
            metrics: false,
        };
        let config = load_config(&args).expect("config");
        assert_eq!(config.max_refinement_iterations, 1);
        assert!(!config.enable_refinement);
        assert!(!config.fail_open_on_moderation_unavailable);
    }
}
