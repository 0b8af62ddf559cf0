//! Line-delimited JSON host for the bridge.
//!
//! Reads one invocation per stdin line:
//!
//! ```text
//! {"id": 1, "name": "search", "arguments": {"query": "rust"}, "timeout_ms": 5000}
//! ```
//!
//! and writes one response line per invocation, in completion order:
//!
//! ```text
//! {"id": 1, "ok": true, "result": {...}}
//! {"id": 2, "ok": false, "error": {"tag": "timeout_error", "message": "..."}}
//! ```
//!
//! `id` is optional and echoed back verbatim. Usage:
//! `brightbridge [CONFIG_PATH] [--list-tools]`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use brightbridge::{find_config_path, init_tracing, load_config, Bridge, BridgeError, DispatchOutput, ErrorBody};

#[derive(Debug, Deserialize)]
struct HostRequest {
    #[serde(default)]
    id: Option<Value>,
    name: String,
    #[serde(default = "empty_arguments")]
    arguments: Value,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn empty_arguments() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Serialize)]
struct HostResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<DispatchOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

impl HostResponse {
    fn from_outcome(id: Option<Value>, outcome: Result<DispatchOutput, BridgeError>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                ok: true,
                result: Some(result),
                error: None,
            },
            Err(e) => Self {
                id,
                ok: false,
                result: None,
                error: Some(e.to_body()),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config_arg: Option<PathBuf> = None;
    let mut list_tools = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--list-tools" => list_tools = true,
            _ => config_arg = Some(PathBuf::from(arg)),
        }
    }

    let config_path = match config_arg {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("failed to read working directory")?;
            find_config_path(&cwd)?
        }
    };
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    init_tracing(config.log_file.as_deref())?;

    let bridge = Arc::new(Bridge::from_config(&config)?);

    if list_tools {
        for (name, description) in bridge.table().describe() {
            println!("{}", serde_json::json!({ "name": name, "description": description }));
        }
        return Ok(());
    }

    tracing::info!(
        config = %config_path.display(),
        endpoint = %config.endpoint,
        session = %bridge.session().id(),
        tools = bridge.table().len(),
        "bridge ready"
    );

    run(bridge).await
}

/// Serve stdin until EOF or Ctrl-C, then drain in-flight calls and close.
async fn run(bridge: Arc<Bridge>) -> anyhow::Result<()> {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if let Err(e) = write_line(&mut stdout, &line).await {
                tracing::error!(error = %e, "failed to write response");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut calls = JoinSet::new();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: HostRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let err = BridgeError::validation(format!("invalid request line: {e}"));
                send_response(&out_tx, HostResponse::from_outcome(None, Err(err)));
                continue;
            }
        };

        let bridge = Arc::clone(&bridge);
        let out_tx = out_tx.clone();
        calls.spawn(async move {
            let timeout = request.timeout_ms.map(Duration::from_millis);
            let outcome = bridge
                .dispatch_with_timeout(&request.name, request.arguments, timeout)
                .await;
            send_response(&out_tx, HostResponse::from_outcome(request.id, outcome));
        });

        // Reap finished calls so the set doesn't grow unbounded.
        while calls.try_join_next().is_some() {}
    }

    while let Some(joined) = calls.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "call task failed");
        }
    }

    bridge.shutdown().await;
    drop(out_tx);
    let _ = writer.await;
    tracing::info!("bridge stopped");
    Ok(())
}

fn send_response(out_tx: &mpsc::UnboundedSender<String>, response: HostResponse) {
    match serde_json::to_string(&response) {
        Ok(line) => {
            let _ = out_tx.send(line);
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize response"),
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
