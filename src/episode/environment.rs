use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::parser::ActionCommand;
use crate::errors::DeskPilotResult;

/// What the environment hands back after a reset or step.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// Raw screenshot bytes, PNG or JPEG.
    pub screenshot: Vec<u8>,
    pub accessibility_tree: Option<String>,
}

/// Outcome of executing one command.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: HashMap<String, serde_json::Value>,
}

impl StepOutcome {
    pub fn new(observation: Observation) -> Self {
        Self {
            observation,
            reward: 0.0,
            done: false,
            info: HashMap::new(),
        }
    }
}

/// Task definition handed to the environment at reset and persisted alongside
/// the trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub instruction: String,
    /// Evaluator settings for environments that score themselves. When absent the
    /// run finishes in the "pending" state and scoring happens elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<serde_json::Value>,
    #[serde(flatten, default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl TaskConfig {
    pub fn from_instruction(id: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instruction: instruction.into(),
            evaluator: None,
            extra: HashMap::new(),
        }
    }

    /// True when the environment cannot score the episode itself.
    pub fn needs_external_eval(&self) -> bool {
        self.evaluator.is_none()
    }
}

/// Desktop surface the episode runner drives. Implementations are synchronous;
/// the runner executes on a blocking thread.
pub trait Environment: Send {
    /// Prepares the desktop for the task and returns the first observation.
    fn reset(&mut self, task: &TaskConfig) -> DeskPilotResult<Observation>;

    /// Executes one command, waits `post_delay` seconds for the UI to settle
    /// and captures the next observation.
    fn step(&mut self, command: &ActionCommand, post_delay: f64) -> DeskPilotResult<StepOutcome>;

    /// Scores the finished episode in [0, 1].
    fn evaluate(&mut self) -> DeskPilotResult<f64>;

    fn close(&mut self) -> DeskPilotResult<()>;

    /// Screen recording hooks. Environments without a recorder keep the
    /// defaults and the runner skips the bracket.
    fn start_recording(&mut self) -> bool {
        false
    }

    fn end_recording(&mut self, _output_path: &std::path::Path) -> bool {
        false
    }
}
