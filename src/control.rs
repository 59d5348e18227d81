//! Operator console
//!
//! Line-oriented: an empty line toggles the processing stage, `q` quits.
//! Anything else is ignored with a hint.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::stage::ActiveStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Toggle,
    Quit,
}

/// Why the listener returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    Quit,
    /// Input closed
    Eof,
}

pub fn parse_command(line: &str) -> Option<ControlCommand> {
    match line.trim() {
        "" => Some(ControlCommand::Toggle),
        "q" | "Q" | "quit" => Some(ControlCommand::Quit),
        _ => None,
    }
}

/// Read commands from `input` until quit or end of input
pub async fn listen<R>(input: R, stages: ActiveStage) -> std::io::Result<ListenerExit>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Some(ControlCommand::Toggle) => {
                let kind = stages.toggle();
                info!("Active stage: {}", kind);
            }
            Some(ControlCommand::Quit) => return Ok(ListenerExit::Quit),
            None => warn!("Unknown command {:?}: Enter toggles the stage, q quits", line.trim()),
        }
    }
    Ok(ListenerExit::Eof)
}
