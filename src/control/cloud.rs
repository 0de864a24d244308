use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::CloudConfig;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("cloud command exited with {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("failed to spawn cloud command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Start/stop for the compute node. Both calls are best-effort: callers log
/// the error and move on.
#[async_trait]
pub trait CloudControl: Send + Sync {
    async fn start_instance(&self, instance_id: &str) -> Result<(), CloudError>;
    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError>;
}

/// Runs provider CLI commands, e.g. `aws ec2 start-instances --instance-ids {instance_id}`.
#[derive(Debug, Clone)]
pub struct CommandCloud {
    start_template: String,
    stop_template: String,
}

impl CommandCloud {
    pub fn new(start_template: impl Into<String>, stop_template: impl Into<String>) -> Self {
        Self {
            start_template: start_template.into(),
            stop_template: stop_template.into(),
        }
    }

    /// Substitute the instance id into `template`. The id is quoted for
    /// `sh` so it always stays a single argument.
    fn render(template: &str, instance_id: &str) -> String {
        template.replace("{instance_id}", &shell_quote(instance_id))
    }

    async fn run(&self, command: String) -> Result<(), CloudError> {
        tracing::info!(command = %command, "Running cloud command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(CloudError::CommandFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/'));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[async_trait]
impl CloudControl for CommandCloud {
    async fn start_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.run(Self::render(&self.start_template, instance_id)).await
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.run(Self::render(&self.stop_template, instance_id)).await
    }
}

/// Development mode: nothing to start or stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCloud;

#[async_trait]
impl CloudControl for NoopCloud {
    async fn start_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        tracing::debug!(instance_id, "Cloud control disabled, skipping start");
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        tracing::debug!(instance_id, "Cloud control disabled, skipping stop");
        Ok(())
    }
}

/// The one compute node the server controls.
#[derive(Clone)]
pub struct ComputeInstance {
    client: Arc<dyn CloudControl>,
    instance_id: String,
}

impl std::fmt::Debug for ComputeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeInstance")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl ComputeInstance {
    pub fn new(client: Arc<dyn CloudControl>, instance_id: impl Into<String>) -> Self {
        Self {
            client,
            instance_id: instance_id.into(),
        }
    }

    pub fn from_config(config: &CloudConfig) -> Self {
        match &config.instance_id {
            Some(id) => {
                let start = config
                    .start_command
                    .clone()
                    .unwrap_or_else(|| CloudConfig::DEFAULT_START.to_string());
                let stop = config
                    .stop_command
                    .clone()
                    .unwrap_or_else(|| CloudConfig::DEFAULT_STOP.to_string());
                Self::new(Arc::new(CommandCloud::new(start, stop)), id.clone())
            }
            None => Self::new(Arc::new(NoopCloud), "dev"),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn start(&self) -> Result<(), CloudError> {
        self.client.start_instance(&self.instance_id).await
    }

    pub async fn stop(&self) -> Result<(), CloudError> {
        self.client.stop_instance(&self.instance_id).await
    }
}
