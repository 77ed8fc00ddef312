//! Stdio transport: line-delimited JSON-RPC 2.0 over stdin/stdout.
//!
//! Grounded on the teacher's `mcp/transports/stdio.rs` framing choice
//! (one JSON object per line) but inverted: the teacher's transport is
//! a client dialing out to a server subprocess, ours is the server
//! reading requests off its own stdin.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::server::jsonrpc::{self, JsonRpcRequest};

/// Read one JSON-RPC request per line from stdin, dispatch each on its
/// own task, and write the response line to stdout. `credential` is the
/// single out-of-band key for the whole session (spec.md §6.1).
pub async fn run(dispatcher: Arc<Dispatcher>, credential: Option<String>, shutdown: CancellationToken) {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin).lines();
    let stdout = Arc::new(tokio::sync::Mutex::new(tokio::io::stdout()));

    loop {
        let line = tokio::select! {
            line = reader.next_line() => line,
            _ = shutdown.cancelled() => break,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break, // EOF
            Err(e) => {
                tracing::error!(error = %e, "stdio transport: failed reading a line");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let dispatcher = dispatcher.clone();
        let credential = credential.clone();
        let stdout = stdout.clone();
        tokio::spawn(async move {
            let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
                Ok(request) => jsonrpc::handle_request(&dispatcher, credential.as_deref(), request).await,
                Err(e) => jsonrpc::parse_error(serde_json::Value::Null, e),
            };
            let mut out = match serde_json::to_string(&response) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "stdio transport: failed to serialize response");
                    return;
                }
            };
            out.push('\n');
            let mut guard = stdout.lock().await;
            if let Err(e) = guard.write_all(out.as_bytes()).await {
                tracing::error!(error = %e, "stdio transport: failed writing response");
            }
            let _ = guard.flush().await;
        });
    }

    tracing::info!("stdio transport: input closed, shutting down");
}
