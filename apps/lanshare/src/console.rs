//! Line-oriented console on stdin.

use std::sync::Arc;

use lanshare_peer::{Node, PeerError, status_report};
use lanshare_transfer::TransferId;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
Remote:    ls [dir] | cdr <dir> | get <file> | getdir <dir> | getm <pattern>... | status | info
Upload:    put <file> | putdir <dir> | putm <pattern>...
Transfers: transfers | pause <id> | resume <id> | cancel <id>
Other:     msg <text> | help | quit";

/// One parsed console line.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    /// Forwarded verbatim as a COMMAND.
    Remote(String),
    Put(String),
    PutDir(String),
    PutMany(Vec<String>),
    Pause(TransferId),
    Resume(TransferId),
    Cancel(TransferId),
    Transfers,
    Chat(String),
    Help,
    Quit,
    Empty,
}

fn parse(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let verb = verb.to_ascii_lowercase();

    let required = |what: &str| {
        if rest.is_empty() {
            Err(format!("usage: {verb} <{what}>"))
        } else {
            Ok(rest.to_string())
        }
    };
    let transfer_id = || {
        rest.parse::<TransferId>()
            .map_err(|_| format!("usage: {verb} <transfer id>"))
    };

    Ok(match verb.as_str() {
        "" => Input::Empty,
        "ls" | "list" | "cdr" | "get" | "getdir" | "getm" | "status" | "info" => {
            Input::Remote(line.to_string())
        }
        "put" => Input::Put(required("file")?),
        "putdir" => Input::PutDir(required("dir")?),
        "putm" => {
            required("pattern")?;
            Input::PutMany(rest.split_whitespace().map(str::to_string).collect())
        }
        "pause" => Input::Pause(transfer_id()?),
        "resume" => Input::Resume(transfer_id()?),
        "cancel" => Input::Cancel(transfer_id()?),
        "transfers" => Input::Transfers,
        "msg" | "say" => Input::Chat(required("text")?),
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("unknown command: {other} (try help)")),
    })
}

/// Reads commands until EOF or `quit`.
pub async fn run(node: Arc<Node>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    node.output().info("Type help for commands.");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("stdin read failed: {e}");
                break;
            }
        };
        match parse(&line) {
            Ok(Input::Quit) => break,
            Ok(input) => {
                if let Err(e) = execute(&node, input).await {
                    node.output().error(e.to_string());
                }
            }
            Err(usage) => node.output().warning(usage),
        }
    }
}

async fn execute(node: &Arc<Node>, input: Input) -> Result<(), PeerError> {
    let output = node.output();
    match input {
        Input::Remote(line) => {
            if line.to_ascii_lowercase().starts_with("cdr") && node.is_any_transfer_active() {
                output.warning("Cannot change directory while a transfer is active");
                return Ok(());
            }
            let reply = node.remote(&line).await?;
            output.info(reply);
        }
        Input::Put(file) => {
            let transfer = node.put(&file).await?;
            output.info(format!(
                "Uploading {} ({} bytes) as transfer {}",
                transfer.path(),
                transfer.total_bytes(),
                transfer.id()
            ));
        }
        Input::PutDir(dir) => {
            let count = node.put_dir(&dir).await?;
            output.info(format!("Uploading {count} files from {dir}"));
        }
        Input::PutMany(patterns) => {
            let count = node.put_many(&patterns).await?;
            output.info(format!("Uploading {count} matching files"));
        }
        Input::Pause(id) => node.pause(id)?,
        Input::Resume(id) => node.resume(id)?,
        Input::Cancel(id) => {
            if node.cancel(id).await {
                output.info(format!("Cancelled transfer {id}"));
            } else {
                output.warning(format!("No active transfer {id}"));
            }
        }
        Input::Transfers => output.info(status_report(node)),
        Input::Chat(text) => node.chat(&text).await?,
        Input::Help => output.info(HELP),
        Input::Quit | Input::Empty => {}
    }
    Ok(())
}
