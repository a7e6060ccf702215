//! Interactive Console
//!
//! Line-oriented front end for a node: reads commands from stdin, forwards
//! them through a [`NodeHandle`] and prints the node view.

use std::fmt;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::cluster::{NodeHandle, NodeView};
use crate::timer::{Timer, TimerPatch};

const HELP: &str = "\
Commands:
  add [name] [seconds]   add a timer
  del <id>               delete a timer
  rename <id> <name>     rename a timer
  set <id> <seconds>     set a timer's duration
  toggle <id>            start or pause a timer
  reset <id>             reset a timer to its duration
  start | pause          start or pause all timers
  join <node-id>         join another node as a child
  leave                  leave the cluster
  status                 show node status and timers
  quit                   shut down";

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Add {
        name: Option<String>,
        seconds: Option<u64>,
    },
    Delete(String),
    Rename {
        id: String,
        name: String,
    },
    SetDuration {
        id: String,
        seconds: u64,
    },
    Toggle(String),
    Reset(String),
    StartAll,
    PauseAll,
    Join(String),
    Leave,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    Unknown(String),
    Usage(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty command"),
            ParseError::Unknown(cmd) => write!(f, "unknown command '{}' (try 'help')", cmd),
            ParseError::Usage(usage) => write!(f, "usage: {}", usage),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse one console line
pub fn parse(line: &str) -> Result<ConsoleCommand, ParseError> {
    let mut words = line.split_whitespace();
    let command = words.next().ok_or(ParseError::Empty)?;
    let rest: Vec<&str> = words.collect();

    let one_arg = |usage: &'static str| match rest.as_slice() {
        [arg] => Ok(arg.to_string()),
        _ => Err(ParseError::Usage(usage)),
    };

    match command.to_ascii_lowercase().as_str() {
        "add" => {
            let (seconds, name_words) = match rest.split_last() {
                Some((last, init)) => match last.parse::<u64>() {
                    Ok(seconds) => (Some(seconds), init),
                    Err(_) => (None, rest.as_slice()),
                },
                None => (None, rest.as_slice()),
            };
            let name = (!name_words.is_empty()).then(|| name_words.join(" "));
            Ok(ConsoleCommand::Add { name, seconds })
        }
        "del" | "delete" => one_arg("del <id>").map(ConsoleCommand::Delete),
        "rename" => match rest.split_first() {
            Some((id, name)) if !name.is_empty() => Ok(ConsoleCommand::Rename {
                id: id.to_string(),
                name: name.join(" "),
            }),
            _ => Err(ParseError::Usage("rename <id> <name>")),
        },
        "set" => match rest.as_slice() {
            [id, seconds] => seconds
                .parse()
                .map(|seconds| ConsoleCommand::SetDuration {
                    id: id.to_string(),
                    seconds,
                })
                .map_err(|_| ParseError::Usage("set <id> <seconds>")),
            _ => Err(ParseError::Usage("set <id> <seconds>")),
        },
        "toggle" => one_arg("toggle <id>").map(ConsoleCommand::Toggle),
        "reset" => one_arg("reset <id>").map(ConsoleCommand::Reset),
        "start" => Ok(ConsoleCommand::StartAll),
        "pause" => Ok(ConsoleCommand::PauseAll),
        "join" => one_arg("join <node-id>").map(ConsoleCommand::Join),
        "leave" => Ok(ConsoleCommand::Leave),
        "status" | "ls" => Ok(ConsoleCommand::Status),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

/// Format seconds as `H:MM:SS` or `M:SS`
pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

fn format_timer(timer: &Timer) -> String {
    format!(
        "  [{}] {:<24} {:>9} / {:<9} {}",
        timer.id,
        timer.name,
        format_duration(timer.remaining_seconds),
        format_duration(timer.initial_seconds),
        if timer.is_running { "running" } else { "paused" }
    )
}

/// Render the node view for `status`
pub fn render_status(view: &NodeView) -> String {
    let mut out = format!(
        "Node {} | {} | {} | directory {}\n",
        view.local_id.as_deref().unwrap_or("(unregistered)"),
        view.role,
        view.status,
        if view.is_server_connected() {
            "connected"
        } else {
            "offline"
        },
    );
    if let Some(target) = &view.target_id {
        out.push_str(&format!("Parent: {}\n", target));
    }
    out.push_str(&format!(
        "Children: {}/{}\n",
        view.child_count, view.child_cap
    ));
    if let Some(error) = &view.last_error {
        out.push_str(&format!("Last error: {}\n", error));
    }
    if view.timers.is_empty() {
        out.push_str("  (no timers)");
    } else {
        let lines: Vec<String> = view.timers.iter().map(format_timer).collect();
        out.push_str(&lines.join("\n"));
    }
    out
}

/// Read commands from stdin until `quit` or end of input
pub async fn run(handle: &NodeHandle) -> std::io::Result<()> {
    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        let result = match command {
            ConsoleCommand::Add { name, seconds } => handle
                .add_timer(name, seconds)
                .await
                .map(|id| println!("added timer {}", id)),
            ConsoleCommand::Delete(id) => handle.delete_timer(id).await,
            ConsoleCommand::Rename { id, name } => {
                handle.update_timer(id, TimerPatch::rename(name)).await
            }
            ConsoleCommand::SetDuration { id, seconds } => {
                handle.update_timer(id, TimerPatch::duration(seconds)).await
            }
            ConsoleCommand::Toggle(id) => handle.toggle_timer(id).await,
            ConsoleCommand::Reset(id) => handle.reset_timer(id).await,
            ConsoleCommand::StartAll => handle.start_all().await,
            ConsoleCommand::PauseAll => handle.pause_all().await,
            ConsoleCommand::Join(target) => handle.join_cluster(target).await,
            ConsoleCommand::Leave => handle.leave_cluster().await,
            ConsoleCommand::Status => {
                println!("{}", render_status(&handle.view()));
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{}", HELP);
                Ok(())
            }
            ConsoleCommand::Quit => break,
        };
        if let Err(e) = result {
            println!("error: {}", e);
        }
    }
    Ok(())
}
