//! Code Sandbox - purity enforcement and the runner boundary
//!
//! Pure operations must be deterministic: no eval, no dynamic imports, no
//! network, no timers, no host APIs. [`check_pure`] enforces this statically
//! at build time and again before execution.
//!
//! Actual execution happens behind [`CodeRunner`]. The bundled
//! [`ProcessRunner`] spawns the configured interpreter and exchanges one
//! JSON object over stdio per invocation:
//!
//! ```json
//! // stdin
//! {"code": "...", "bindings": {"rows": [...]}, "scope": "minimal"}
//! // stdout
//! {"ok": true, "result": ...}   or   {"ok": false, "error": "..."}
//! ```
//!
//! [`MockRunner`] returns scripted responses for tests.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{PmlError, Result};
use crate::mux::Scope;
use crate::util::SANDBOX_TIMEOUT;

/// Forbidden constructs in pure operation bodies.
static FORBIDDEN: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\beval\s*\(", "eval"),
        (r"\bnew\s+Function\s*\(", "Function constructor"),
        (r"\bimport\s*\(", "dynamic import"),
        (r"\brequire\s*\(", "require"),
        (r"\bfetch\s*\(", "fetch"),
        (r"\bXMLHttpRequest\b", "XMLHttpRequest"),
        (r"\bsetTimeout\s*\(", "setTimeout"),
        (r"\bsetInterval\s*\(", "setInterval"),
        (r"\bprocess\s*\.", "process host API"),
        (r"\bDeno\s*\.", "Deno host API"),
        (r"\bfs\s*\.", "filesystem API"),
    ]
    .into_iter()
    .map(|(pattern, name)| (Regex::new(pattern).expect("valid regex"), name))
    .collect()
});

/// Static check: reject constructs that would make a pure operation
/// non-deterministic or give it side channels.
pub fn check_pure(code: &str) -> Result<()> {
    for (regex, name) in FORBIDDEN.iter() {
        if regex.is_match(code) {
            return Err(PmlError::ForbiddenPattern {
                pattern: (*name).to_string(),
            });
        }
    }
    Ok(())
}

/// The code sandbox boundary: execute `code` with `bindings` in scope.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn execute(&self, code: &str, bindings: &Value, scope: Scope) -> Result<Value>;
}

/// Reference runner: one interpreter subprocess per invocation.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command: String,
    args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl CodeRunner for ProcessRunner {
    async fn execute(&self, code: &str, bindings: &Value, scope: Scope) -> Result<Value> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PmlError::SandboxError {
                reason: format!("failed to spawn runner '{}': {}", self.command, e),
            })?;

        let request = json!({
            "code": code,
            "bindings": bindings,
            "scope": scope.as_str(),
        });

        let mut stdin = child.stdin.take().ok_or_else(|| PmlError::SandboxError {
            reason: "runner stdin not piped".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PmlError::SandboxError {
            reason: "runner stdout not piped".to_string(),
        })?;

        stdin
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .map_err(|e| PmlError::SandboxError {
                reason: format!("failed to write to runner: {}", e),
            })?;
        drop(stdin);

        let mut lines = BufReader::new(stdout).lines();
        let line = tokio::time::timeout(SANDBOX_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| PmlError::Timeout {
                operation: "sandbox".to_string(),
                duration_ms: SANDBOX_TIMEOUT.as_millis() as u64,
            })?
            .map_err(|e| PmlError::SandboxError {
                reason: format!("failed to read runner output: {}", e),
            })?
            .ok_or_else(|| PmlError::SandboxError {
                reason: "runner produced no output".to_string(),
            })?;

        let _ = child.wait().await;

        let response: Value = serde_json::from_str(&line).map_err(|e| PmlError::SandboxError {
            reason: format!("invalid runner response: {} (line: {})", e, line.trim()),
        })?;

        if response.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            Ok(response.get("result").cloned().unwrap_or(Value::Null))
        } else {
            Err(PmlError::SandboxError {
                reason: response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown sandbox error")
                    .to_string(),
            })
        }
    }
}

type MockHandler = dyn Fn(&str, &Value) -> Result<Value> + Send + Sync;

/// Scripted runner for tests: the closure sees (code, bindings).
pub struct MockRunner {
    handler: Arc<MockHandler>,
}

impl MockRunner {
    pub fn new(handler: impl Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Runner that returns the same value for every invocation.
    pub fn constant(value: Value) -> Self {
        Self::new(move |_, _| Ok(value.clone()))
    }
}

#[async_trait]
impl CodeRunner for MockRunner {
    async fn execute(&self, code: &str, bindings: &Value, _scope: Scope) -> Result<Value> {
        (self.handler)(code, bindings)
    }
}

/// Run with a cancellation bound: aborted invocations fail with `Cancelled`.
pub async fn run_with_cancel(
    runner: &dyn CodeRunner,
    code: &str,
    bindings: &Value,
    scope: Scope,
    cancel: &CancellationToken,
) -> Result<Value> {
    tokio::select! {
        result = runner.execute(code, bindings, scope) => result,
        _ = cancel.cancelled() => Err(PmlError::Cancelled {
            server_id: "sandbox".to_string(),
        }),
    }
}
