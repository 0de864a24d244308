use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::OffloadError;

/// Lifecycle of a queued job: `new -> working -> {done | error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    New,
    Working,
    Done,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Working => "working",
            JobState::Done => "done",
            JobState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Error)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobState::New),
            "working" => Ok(JobState::Working),
            "done" => Ok(JobState::Done),
            "error" => Ok(JobState::Error),
            other => Err(OffloadError::InvalidState(format!(
                "unknown job state '{}'",
                other
            ))),
        }
    }
}

/// Positional and keyword arguments for a handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl JobInput {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// Terminal payload of a job. Serializes as `{"data": ..}` or `{"error": ".."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutput {
    Data(Value),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub method: String,
    pub state: JobState,
    pub input: JobInput,
    /// Always `None` until the job reaches a terminal state
    pub output: Option<JobOutput>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(method: impl Into<String>, input: JobInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.into(),
            state: JobState::New,
            input,
            output: None,
            created_at: Utc::now(),
            claimed_at: None,
            finished_at: None,
        }
    }

    /// Result value of a `done` job.
    pub fn data(&self) -> Option<&Value> {
        match &self.output {
            Some(JobOutput::Data(v)) => Some(v),
            _ => None,
        }
    }

    /// Error message of an `error` job.
    pub fn error(&self) -> Option<&str> {
        match &self.output {
            Some(JobOutput::Error(e)) => Some(e.as_str()),
            _ => None,
        }
    }
}

/// Number of rows per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub new: u64,
    pub working: u64,
    pub done: u64,
    pub error: u64,
}

impl JobCounts {
    pub(crate) fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::New => self.new += n,
            JobState::Working => self.working += n,
            JobState::Done => self.done += n,
            JobState::Error => self.error += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.new + self.working + self.done + self.error
    }
}
