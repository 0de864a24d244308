use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::HandlerError;
use crate::queue::{JobInput, JobOutput};
use crate::worker::registry::HandlerRegistry;

/// Hidden CLI subcommand that runs a single job inside a child process.
pub const RUN_JOB_SUBCOMMAND: &str = "run-job";

/// Runs one job with full resource teardown afterwards.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    async fn run(&self, method: &str, input: &JobInput) -> Result<Value, HandlerError>;
}

/// What the dispatch loop sends to an isolated child over stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub method: String,
    pub input: JobInput,
}

/// Child side of [`ProcessContext`]: decode the request, invoke the handler
/// and encode the outcome. Never fails; malformed requests become error
/// outcomes.
pub fn execute_request(registry: &HandlerRegistry, raw: &str) -> JobOutput {
    let request: ExecutionRequest = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(e) => return JobOutput::Error(format!("malformed execution request: {}", e)),
    };
    match registry.invoke(&request.method, &request.input) {
        Ok(data) => JobOutput::Data(data),
        Err(e) => JobOutput::Error(e.to_string()),
    }
}

/// Fresh child process per job.
///
/// The child receives an [`ExecutionRequest`] as JSON on stdin and must print
/// a [`JobOutput`] as JSON on stdout. Whatever the handler allocated dies
/// with the process. The child leads its own process group, so signals sent
/// to the worker's group do not interrupt the job in flight.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessContext {
    /// Run `program run-job` for every job.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::with_args(program, vec![RUN_JOB_SUBCOMMAND.to_string()])
    }

    pub fn with_args(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-invoke the running executable.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    fn process_output(output: std::process::Output) -> Result<Value, HandlerError> {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // last non-empty line carries the outcome; handlers may print before it
        let parsed = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|line| serde_json::from_str::<JobOutput>(line).ok());

        match parsed {
            Some(JobOutput::Data(data)) => Ok(data),
            Some(JobOutput::Error(message)) => Err(HandlerError::Failed(message)),
            None => Err(HandlerError::Failed(format!(
                "execution context exited with {}: {}",
                output.status,
                stderr.trim()
            ))),
        }
    }
}

#[async_trait]
impl ExecutionContext for ProcessContext {
    async fn run(&self, method: &str, input: &JobInput) -> Result<Value, HandlerError> {
        let request = serde_json::to_vec(&ExecutionRequest {
            method: method.to_string(),
            input: input.clone(),
        })
        .map_err(|e| HandlerError::Failed(format!("failed to encode request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own group: a terminal Ctrl-C reaches the worker, not the running job
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HandlerError::Failed(format!(
                    "failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // a child that exits without reading is reported through its output
            if let Err(e) = stdin.write_all(&request).await {
                tracing::debug!(error = %e, "Execution context closed stdin early");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| HandlerError::Failed(format!("execution context lost: {}", e)))?;

        tracing::debug!(method, status = %output.status, "Execution context exited");
        Self::process_output(output)
    }
}

/// Runs the handler on the blocking pool of the worker process. A panicking
/// handler fails its job instead of taking the worker down.
#[derive(Debug, Clone)]
pub struct InProcessContext {
    registry: Arc<HandlerRegistry>,
}

impl InProcessContext {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ExecutionContext for InProcessContext {
    async fn run(&self, method: &str, input: &JobInput) -> Result<Value, HandlerError> {
        let registry = self.registry.clone();
        let method = method.to_string();
        let input = input.clone();

        tokio::task::spawn_blocking(move || registry.invoke(&method, &input))
            .await
            .map_err(|e| {
                let reason = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    e.to_string()
                };
                HandlerError::Failed(format!("handler panicked: {}", reason))
            })?
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execute_request_success_and_unknown() {
        let registry = HandlerRegistry::builtin();
        let ok = execute_request(
            &registry,
            r#"{"method": "cosine", "input": {"args": [[1.0, 0.0], [1.0, 0.0]]}}"#,
        );
        assert_eq!(ok, JobOutput::Data(json!(1.0)));

        let unknown = execute_request(&registry, r#"{"method": "nope", "input": {}}"#);
        assert_eq!(unknown, JobOutput::Error("unknown method: nope".to_string()));
    }

    #[test]
    fn execute_request_malformed() {
        let out = execute_request(&HandlerRegistry::builtin(), "not json");
        assert!(matches!(out, JobOutput::Error(m) if m.starts_with("malformed execution request")));
    }

    #[tokio::test]
    async fn in_process_panic_becomes_failure() {
        let registry = HandlerRegistry::new().register("explode", |_: &JobInput| -> Result<Value, HandlerError> {
            panic!("out of memory")
        });
        let ctx = InProcessContext::new(Arc::new(registry));
        let err = ctx.run("explode", &JobInput::default()).await.unwrap_err();
        assert_eq!(err, HandlerError::Failed("handler panicked: out of memory".to_string()));
    }

    #[tokio::test]
    async fn process_context_reports_crash() {
        let ctx = ProcessContext::with_args(
            "sh",
            vec!["-c".to_string(), "cat >/dev/null; echo segfault >&2; exit 9".to_string()],
        );
        match ctx.run("cosine", &JobInput::default()).await {
            Err(HandlerError::Failed(msg)) => {
                assert!(msg.contains("execution context exited"));
                assert!(msg.contains("segfault"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn process_context_reads_last_line() {
        let script = r#"cat >/dev/null; echo "loading model"; echo '{"data": [1, 2]}'"#;
        let ctx = ProcessContext::with_args("sh", vec!["-c".to_string(), script.to_string()]);
        assert_eq!(
            ctx.run("anything", &JobInput::default()).await.unwrap(),
            json!([1, 2])
        );
    }
}
