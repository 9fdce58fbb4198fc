//! Terminal front-end for the assistant streams.
//!
//! Usage:
//!   assistant-console chat
//!   assistant-console chat --restart-after 5
//!   assistant-console tools --turn "user:add tests for the parser"
//!   assistant-console slo --path /chat/stream --limit 10
//!
//! Streamed output goes to stdout; logs go to stderr. Ctrl-C cancels a
//! running stream and exits with status 130.

use std::future::Future;
use std::io::{self, Write as _};
use std::pin::Pin;
use std::process::ExitCode;

use assistant_stream::config::CHAT_STREAM_PATH;
use assistant_stream::prelude::*;
use assistant_stream::{
    DomainEvent, SloClient, SloMetric, SloReport, SloThresholds, init_observability,
};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "assistant-console",
    about = "Follow the assistant chat and tool streams from a terminal."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream one chat response.
    Chat {
        /// Restart the stream once after this many events.
        #[arg(long, value_name = "EVENTS")]
        restart_after: Option<usize>,
    },
    /// Run the test-generation tool pipeline.
    Tools {
        /// Conversation turn as `role:content`. Repeat for more turns.
        #[arg(long = "turn", value_name = "ROLE:CONTENT", value_parser = parse_turn, required = true)]
        turns: Vec<ConversationTurn>,
    },
    /// Show the latest SLO records for an endpoint.
    Slo {
        /// Endpoint path the records belong to.
        #[arg(long, default_value = CHAT_STREAM_PATH)]
        path: String,
        /// Number of records to fetch (1-50).
        #[arg(long, default_value_t = 5)]
        limit: u32,
    },
}

fn parse_turn(raw: &str) -> Result<ConversationTurn, String> {
    let (role, content) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected ROLE:CONTENT, got `{raw}`"))?;
    let role: Role = role.parse()?;
    let content = content.trim();
    if content.is_empty() {
        return Err("turn content must not be empty".to_string());
    }
    Ok(ConversationTurn::new(role, content))
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

impl Outcome {
    fn exit_code(self) -> ExitCode {
        match self {
            Self::Completed => ExitCode::SUCCESS,
            Self::Failed => ExitCode::FAILURE,
            Self::Cancelled => ExitCode::from(130),
        }
    }
}

/// Why [`follow`] returned.
enum Follow {
    /// The session left the streaming states.
    Settled,
    /// The event callback asked to stop following.
    Stopped,
    /// Ctrl-C was pressed.
    Interrupted,
}

/// Feeds each new event of `session_id` to `on_event` until the session
/// settles, the callback returns `false`, or `interrupt` fires.
async fn follow<E, F>(
    rx: &mut watch::Receiver<SessionState<E>>,
    session_id: SessionId,
    mut interrupt: Pin<&mut F>,
    mut on_event: impl FnMut(usize, &E) -> bool,
) -> Follow
where
    E: DomainEvent,
    F: Future<Output = io::Result<()>>,
{
    let mut seen = 0;
    loop {
        {
            let state = rx.borrow_and_update();
            if state.session_id() == Some(session_id) {
                for event in &state.events()[seen..] {
                    let keep_going = on_event(seen, event);
                    seen += 1;
                    if !keep_going {
                        return Follow::Stopped;
                    }
                }
                if !state.is_streaming() {
                    return Follow::Settled;
                }
            }
        }
        tokio::select! {
            biased;
            _ = interrupt.as_mut() => return Follow::Interrupted,
            changed = rx.changed() => {
                if changed.is_err() {
                    return Follow::Settled;
                }
            }
        }
    }
}

fn flush_stdout() {
    let _ = io::stdout().flush();
}

fn report_failure<E: DomainEvent>(state: &SessionState<E>) -> Outcome {
    let message = state.last_error().unwrap_or("stream stopped");
    error!(status = %state.status(), error = message, "stream failed");
    eprintln!("error: {message}");
    Outcome::Failed
}

fn print_slo(metric: &SloMetric) {
    let report = SloReport::evaluate(metric, &SloThresholds::default());
    let mark = |ok: bool| if ok { "ok" } else { "over" };
    println!(
        "{} {} {:.0}ms ({}) {} tokens ({}) cache {} at {}",
        metric.method,
        metric.path,
        metric.duration_ms,
        mark(report.duration_ok),
        metric.tokens,
        mark(report.tokens_ok),
        if report.cache_ok { "hit" } else { "miss" },
        metric.timestamp
    );
}

async fn run_chat(restart_after: Option<usize>) -> Result<Outcome, ClientError> {
    let mut chat = ChatStream::new(ChatTransport::from_env()?);
    let mut rx = chat.subscribe();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut restart_at = restart_after;

    loop {
        let session_id = chat.restart().await;
        let followed = follow(&mut rx, session_id, interrupt.as_mut(), |index, event| {
            if let ChatStreamEvent::Token { payload, .. } = event {
                print!("{}", payload.token);
                flush_stdout();
            }
            restart_at.is_none_or(|limit| index + 1 < limit)
        })
        .await;
        match followed {
            Follow::Stopped => {
                println!();
                info!("restarting chat stream");
                restart_at = None;
            }
            Follow::Interrupted => {
                chat.cancel().await;
                println!();
                eprintln!("cancelled");
                return Ok(Outcome::Cancelled);
            }
            Follow::Settled => break,
        }
    }

    let state = chat.wait().await;
    println!();
    if state.status() != StreamStatus::Completed {
        return Ok(report_failure(&state));
    }
    let meter = state.token_meter();
    println!(
        "tokens: {}  cost: ${:.6}  meter: {:.0}%",
        meter.tokens,
        meter.cost_usd,
        meter.progress * 100.0
    );
    if let Some(metric) = state.slo_metric() {
        print_slo(metric);
    }
    Ok(Outcome::Completed)
}

fn print_tool_event(event: &ToolStreamEvent) {
    match event {
        ToolStreamEvent::Token { payload } => {
            println!("[{}] {}", payload.stage.label(), payload.message);
        }
        ToolStreamEvent::Tool { payload } => match payload.summary.as_deref() {
            Some(summary) => println!(
                "[{}] {}: {summary}",
                payload.stage.label(),
                payload.status.label()
            ),
            None => println!("[{}] {}", payload.stage.label(), payload.status.label()),
        },
        ToolStreamEvent::Error { message, .. } => println!("[error] {message}"),
    }
}

async fn run_tools(turns: Vec<ConversationTurn>) -> Result<Outcome, ClientError> {
    let mut tools = ToolStream::new(ToolTransport::from_env()?);
    let mut rx = tools.subscribe();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let session_id = tools.generate(turns).await;
    let followed = follow(&mut rx, session_id, interrupt.as_mut(), |_, event| {
        print_tool_event(event);
        true
    })
    .await;
    if let Follow::Interrupted = followed {
        tools.cancel().await;
        eprintln!("cancelled");
        return Ok(Outcome::Cancelled);
    }

    let state = tools.wait().await;
    if state.status() != StreamStatus::Completed {
        return Ok(report_failure(&state));
    }
    for stage in ToolStage::ALL {
        let status = state
            .stage_status(stage)
            .map_or("-", ToolStatus::label);
        println!("{:<16} {status}", stage.label());
    }
    Ok(Outcome::Completed)
}

async fn run_slo(path: String, limit: u32) -> Result<Outcome, ClientError> {
    let client = SloClient::new(ClientConfig::from_env()?)?;
    let records = client.latest(&path, limit).await?;
    if records.is_empty() {
        println!("no SLO records for {path}");
    }
    for metric in &records {
        print_slo(metric);
    }
    Ok(Outcome::Completed)
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_observability();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Chat { restart_after } => run_chat(restart_after).await,
        Command::Tools { turns } => run_tools(turns).await,
        Command::Slo { path, limit } => run_slo(path, limit).await,
    };
    match result {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_role_prefixed_turns() {
        let turn = parse_turn("user: add tests: for parser").expect("valid turn");
        assert_eq!(turn, ConversationTurn::new(Role::User, "add tests: for parser"));
        assert!(parse_turn("robot:hi").is_err());
        assert!(parse_turn("no separator").is_err());
        assert!(parse_turn("assistant:   ").is_err());
    }

    #[test]
    fn tools_requires_at_least_one_turn() {
        assert!(Cli::try_parse_from(["assistant-console", "tools"]).is_err());
        let cli = Cli::try_parse_from([
            "assistant-console",
            "tools",
            "--turn",
            "user:hello",
            "--turn",
            "assistant:hi",
        ])
        .expect("valid args");
        let Command::Tools { turns } = cli.command else {
            panic!("expected tools command");
        };
        assert_eq!(turns.len(), 2);
    }

    #[test]
    fn slo_defaults_to_chat_path() {
        let cli = Cli::try_parse_from(["assistant-console", "slo"]).expect("valid args");
        let Command::Slo { path, limit } = cli.command else {
            panic!("expected slo command");
        };
        assert_eq!(path, "/chat/stream");
        assert_eq!(limit, 5);
    }

    #[test]
    fn cancelled_exit_code_is_130() {
        assert_eq!(Outcome::Cancelled.exit_code(), ExitCode::from(130));
        assert_eq!(Outcome::Completed.exit_code(), ExitCode::SUCCESS);
    }
}
