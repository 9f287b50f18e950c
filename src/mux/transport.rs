//! Transport Layer - child process spawning and http-stream exchange
//!
//! Two ways to reach a tool server:
//! - **stdio**: spawn a child with stdin/stdout/stderr all piped. stdout
//!   carries newline-delimited JSON-RPC frames, stderr is free-form text
//!   teed to the gateway log.
//! - **http-stream**: POST each outgoing line to the server's endpoint and
//!   feed every line of the chunked response body back through the same
//!   frame-dispatch channel the stdio reader uses. A single POST may yield
//!   several frames (e.g. a sampling request followed by the final response).

use std::collections::HashMap;
use std::process::Stdio;

use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{PmlError, Result};
use crate::mux::types::TransportConfig;
use crate::util::CONNECT_TIMEOUT;

/// Spawn a stdio tool-server child process.
///
/// The process is spawned with stdin, stdout and stderr piped: stdin for
/// requests, stdout for responses, stderr for the log tee.
///
/// # Errors
///
/// Returns `PmlError::ConnectionFailed` if the process fails to spawn or a
/// pipe is missing.
pub async fn spawn_stdio(
    server_id: &str,
    config: &TransportConfig,
) -> Result<(Child, ChildStdin, ChildStdout, ChildStderr)> {
    let TransportConfig::Stdio {
        command,
        args,
        env,
        cwd,
    } = config
    else {
        return Err(PmlError::ConnectionFailed {
            server_id: server_id.to_string(),
            reason: "not a stdio transport".to_string(),
        });
    };

    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|e| PmlError::ConnectionFailed {
        server_id: server_id.to_string(),
        reason: e.to_string(),
    })?;

    let missing_pipe = |what: &str| PmlError::ConnectionFailed {
        server_id: server_id.to_string(),
        reason: format!("{} not piped", what),
    };

    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    Ok((child, stdin, stdout, stderr))
}

/// Write half of a stdio connection.
///
/// Boxed so tests can drive a server over `tokio::io::duplex` instead of a
/// real child process.
pub struct StdioLink {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl StdioLink {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    /// Write one whole JSON line and flush.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Signal EOF to the peer.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}

impl std::fmt::Debug for StdioLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioLink").finish()
    }
}

/// http-stream exchange: POST one request line, stream response lines back.
#[derive(Debug, Clone)]
pub struct HttpStreamLink {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
}

impl HttpStreamLink {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| PmlError::Internal {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            url: url.into(),
            headers,
        })
    }

    /// POST a request line and pump every line of the chunked response body
    /// into `line_tx`, where the reader task dispatches it like any stdout
    /// frame. Runs detached so the caller's write path never blocks on the
    /// server's response stream.
    pub fn post_line(&self, server_id: &str, line: String, line_tx: mpsc::Sender<String>) {
        let client = self.client.clone();
        let url = self.url.clone();
        let headers = self.headers.clone();
        let server_id = server_id.to_string();

        tokio::spawn(async move {
            let mut request = client
                .post(&url)
                .header("content-type", "application/json")
                .body(line);
            for (key, value) in &headers {
                request = request.header(key, value);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(server_id = %server_id, error = %e, "http-stream POST failed");
                    return;
                }
            };

            if !response.status().is_success() {
                warn!(
                    server_id = %server_id,
                    status = %response.status(),
                    "http-stream POST returned non-success status"
                );
                return;
            }

            // Chunks are not line-aligned; buffer until each newline
            let mut stream = response.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(server_id = %server_id, error = %e, "http-stream body error");
                        break;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let frame: String = buf.drain(..=pos).collect();
                    let frame = frame.trim();
                    if frame.is_empty() {
                        continue;
                    }
                    if line_tx.send(frame.to_string()).await.is_err() {
                        return; // reader gone, connection closing
                    }
                }
            }

            // Trailing frame without a newline
            let rest = buf.trim();
            if !rest.is_empty() {
                let _ = line_tx.send(rest.to_string()).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn stdio_link_writes_whole_lines() {
        let (client, server) = tokio::io::duplex(1024);
        let mut link = StdioLink::new(client);

        link.write_line(r#"{"jsonrpc":"2.0","id":1,"method":"x","params":{}}"#)
            .await
            .unwrap();
        link.write_line(r#"{"jsonrpc":"2.0","id":2,"method":"y","params":{}}"#)
            .await
            .unwrap();
        link.shutdown().await.unwrap();

        let mut lines = BufReader::new(server).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        let second = lines.next_line().await.unwrap().unwrap();
        assert!(first.contains("\"id\":1"));
        assert!(second.contains("\"id\":2"));
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spawn_stdio_rejects_http_config() {
        let config = TransportConfig::HttpStream {
            url: "https://example.com".to_string(),
            headers: HashMap::new(),
        };
        let err = spawn_stdio("web", &config).await.unwrap_err();
        assert_eq!(err.code(), "PML-101");
    }

    #[tokio::test]
    async fn spawn_stdio_reports_missing_command() {
        let config = TransportConfig::Stdio {
            command: "definitely-not-a-real-binary-pml".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        };
        let err = spawn_stdio("ghost", &config).await.unwrap_err();
        assert_eq!(err.code(), "PML-101");
    }
}
