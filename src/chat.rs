use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::prompts::system_messages;
use crate::agents::{TurnRequest, build_master_agent};
use crate::config::RuntimeConfig;
use crate::session::{ConversationSession, InMemoryChatStore};
use crate::streaming::ServerEvent;
use crate::telemetry::TelemetrySink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalLine {
    Stdout(String),
    Stderr(String),
}

/// Maps a streamed event to terminal output. Bookkeeping events print nothing.
pub fn terminal_output(event: &ServerEvent) -> Option<TerminalLine> {
    match event {
        ServerEvent::Answer { data } => Some(TerminalLine::Stdout(data.clone())),
        ServerEvent::Reasoning { data } => Some(TerminalLine::Stderr(data.clone())),
        ServerEvent::Error { message } => Some(TerminalLine::Stderr(format!("\n{message}\n"))),
        ServerEvent::NewChat { .. } | ServerEvent::Title { .. } | ServerEvent::Done => None,
    }
}

/// Runs one anonymous turn through the full routing pipeline and streams the
/// answer to stdout. Reasoning (when requested) goes to stderr.
pub async fn run_ask(cfg: &RuntimeConfig, telemetry: &TelemetrySink, turn: TurnRequest) -> Result<()> {
    let agent = build_master_agent(cfg, telemetry.clone())?;
    let mut session = ConversationSession::new(Arc::new(InMemoryChatStore::new()), system_messages());
    let (sink, mut events) = mpsc::unbounded_channel::<ServerEvent>();

    let printer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        let mut stderr = io::stderr();
        while let Some(event) = events.recv().await {
            let written = match terminal_output(&event) {
                Some(TerminalLine::Stdout(text)) => {
                    write!(stdout, "{text}").and_then(|_| stdout.flush())
                }
                Some(TerminalLine::Stderr(text)) => {
                    write!(stderr, "{text}").and_then(|_| stderr.flush())
                }
                None => Ok(()),
            };
            if let Err(err) = written {
                tracing::warn!("Failed to write answer output: {err}");
                break;
            }
        }
    });

    let cancel = CancellationToken::new();
    let result = session.handle_turn(&agent, &turn, &sink, &cancel).await;
    drop(sink);
    if let Err(err) = printer.await {
        tracing::warn!("Answer printer task failed: {err}");
    }
    println!();

    let outcome = result?;
    tracing::info!(route = outcome.route.as_str(), "Answered query");
    Ok(())
}
