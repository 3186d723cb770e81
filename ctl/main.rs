#![forbid(unsafe_code)]

//! `agent-conduit-ctl`: local CLI companion for `agent-conduit`.
//!
//! Connects to the control socket, sends one JSON command, and prints
//! the response.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericFilePath, Stream, ToFsName};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(
    name = "agent-conduit-ctl",
    about = "Local CLI for the agent-conduit daemon",
    version,
    long_about = None
)]
struct Cli {
    /// Control socket path.
    ///
    /// When omitted, `conduit.sock` under `AGENT_CONDUIT_HOME`, falling
    /// back to `~/.agent-conduit`.
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn socket_path(&self) -> PathBuf {
        if let Some(ref socket) = self.socket {
            return socket.clone();
        }
        let root = std::env::var("AGENT_CONDUIT_HOME").map_or_else(
            |_| {
                std::env::var("HOME")
                    .map(|home| PathBuf::from(home).join(".agent-conduit"))
                    .unwrap_or_else(|_| PathBuf::from("."))
            },
            PathBuf::from,
        );
        root.join("conduit.sock")
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show daemon status.
    Status,

    /// Show the last heartbeat.
    Heartbeat,

    /// Queue a message for the collaborator.
    Relay {
        /// Message body.
        content: String,
        /// Message type understood by the collaborator.
        #[arg(long)]
        message_type: Option<String>,
        /// Priority: low, medium, high, or urgent.
        #[arg(long)]
        priority: Option<String>,
        /// Specific request attached to the message.
        #[arg(long)]
        request: Option<String>,
    },

    /// Start a streamed request and print its id.
    Stream {
        /// Message body.
        content: String,
        /// Priority: low, medium, high, or urgent.
        #[arg(long)]
        priority: Option<String>,
    },

    /// Print chunks buffered for a stream.
    Read {
        /// Stream identifier.
        stream_id: String,
        /// Only chunks with an index greater than this.
        #[arg(long)]
        after: Option<u64>,
    },

    /// Follow a stream until it finishes.
    Watch {
        /// Stream identifier.
        stream_id: String,
        /// Poll interval in milliseconds.
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
    },

    /// Cancel a stream (the active one when no id is given).
    Cancel {
        /// Stream identifier.
        stream_id: Option<String>,
    },

    /// Stop the daemon.
    Shutdown,
}

fn insert_opt(request: &mut Value, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        request[key] = Value::String(value.to_owned());
    }
}

fn main() {
    let args = Cli::parse();
    let socket = args.socket_path();

    let request_json = match &args.command {
        Command::Status => json!({ "command": "status" }),
        Command::Heartbeat => json!({ "command": "heartbeat" }),
        Command::Relay {
            content,
            message_type,
            priority,
            request,
        } => {
            let mut req = json!({ "command": "relay", "content": content });
            insert_opt(&mut req, "message_type", message_type.as_deref());
            insert_opt(&mut req, "priority", priority.as_deref());
            insert_opt(&mut req, "request", request.as_deref());
            req
        }
        Command::Stream { content, priority } => {
            let mut req = json!({ "command": "stream", "content": content });
            insert_opt(&mut req, "priority", priority.as_deref());
            req
        }
        Command::Read { stream_id, after } => {
            let mut req = json!({ "command": "stream_read", "stream_id": stream_id });
            if let Some(after) = after {
                req["after"] = json!(after);
            }
            req
        }
        Command::Watch {
            stream_id,
            interval_ms,
        } => {
            watch(&socket, stream_id, Duration::from_millis(*interval_ms));
            return;
        }
        Command::Cancel { stream_id } => {
            let mut req = json!({ "command": "cancel" });
            insert_opt(&mut req, "stream_id", stream_id.as_deref());
            req
        }
        Command::Shutdown => json!({ "command": "shutdown" }),
    };

    let data = call(&socket, &request_json);
    println!("{}", serde_json::to_string_pretty(&data).unwrap_or_default());
}

/// Send one request and return its `data`, exiting on any failure.
fn call(socket: &Path, request: &Value) -> Value {
    match send_ipc_command(socket, request) {
        Ok(response) => {
            let ok = response.get("ok").and_then(Value::as_bool).unwrap_or(false);
            if ok {
                response.get("data").cloned().unwrap_or(Value::Null)
            } else {
                let err_msg = response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                eprintln!("Error: {err_msg}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to daemon: {err}");
            eprintln!("Is agent-conduit listening on {}?", socket.display());
            std::process::exit(1);
        }
    }
}

fn watch(socket: &Path, stream_id: &str, interval: Duration) {
    let mut after: Option<u64> = None;
    loop {
        let mut req = json!({ "command": "stream_read", "stream_id": stream_id });
        if let Some(after) = after {
            req["after"] = json!(after);
        }
        let data = call(socket, &req);

        for chunk in data
            .get("chunks")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let kind = chunk.get("chunk_type").and_then(Value::as_str).unwrap_or("?");
            let content = chunk.get("content").and_then(Value::as_str).unwrap_or_default();
            println!("[{kind}] {content}");
            if let Some(index) = chunk.get("index").and_then(Value::as_u64) {
                after = Some(index);
            }
        }

        if data.get("finished").and_then(Value::as_bool).unwrap_or(false) {
            return;
        }
        thread::sleep(interval);
    }
}

/// Connect to the control socket, send a JSON command, and read the response.
fn send_ipc_command(
    socket: &Path,
    request: &Value,
) -> std::result::Result<Value, Box<dyn std::error::Error>> {
    let name = socket.to_fs_name::<GenericFilePath>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
