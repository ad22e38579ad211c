use serde::{Deserialize, Serialize};

/// Lifecycle state of a run as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    /// Episode finished but scoring happens outside the environment.
    Pending,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Start,
    Status,
    Screenshot,
    Step,
    Skill,
    Complete,
    Error,
}

/// File produced during a run, reported relative to the result directory so
/// clients can resolve it either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub kind: String,
    pub path: String,
    pub relative_path: String,
}

impl Asset {
    pub fn new(kind: &str, path: &std::path::Path, base: &std::path::Path) -> Self {
        let relative = path
            .strip_prefix(base)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        Self {
            kind: kind.to_string(),
            path: path.to_string_lossy().into_owned(),
            relative_path: relative,
        }
    }
}

/// One progress event. The runner fills the payload fields; the manager stamps
/// run identity and time before fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: RunEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<Asset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl RunEvent {
    fn bare(kind: RunEventKind) -> Self {
        Self {
            kind,
            step: None,
            message: None,
            status: None,
            score: None,
            details: None,
            assets: Vec::new(),
            run_id: None,
            task_id: None,
            result_dir: None,
            timestamp: None,
        }
    }

    pub fn start(instruction: &str) -> Self {
        let mut ev = Self::bare(RunEventKind::Start);
        ev.message = Some(instruction.to_string());
        ev.status = Some(RunStatus::Running);
        ev
    }

    pub fn status(message: impl Into<String>) -> Self {
        let mut ev = Self::bare(RunEventKind::Status);
        ev.message = Some(message.into());
        ev
    }

    pub fn screenshot(step: Option<u32>, asset: Asset) -> Self {
        let mut ev = Self::bare(RunEventKind::Screenshot);
        ev.step = step;
        ev.assets = vec![asset];
        ev
    }

    pub fn step(step: u32, message: impl Into<String>, details: serde_json::Value) -> Self {
        let mut ev = Self::bare(RunEventKind::Step);
        ev.step = Some(step);
        ev.message = Some(message.into());
        ev.details = Some(details);
        ev
    }

    pub fn skill(step: u32, details: serde_json::Value) -> Self {
        let mut ev = Self::bare(RunEventKind::Skill);
        ev.step = Some(step);
        ev.details = Some(details);
        ev
    }

    pub fn complete(status: RunStatus, score: Option<f64>, message: impl Into<String>) -> Self {
        let mut ev = Self::bare(RunEventKind::Complete);
        ev.status = Some(status);
        ev.score = score;
        ev.message = Some(message.into());
        ev
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut ev = Self::bare(RunEventKind::Error);
        ev.status = Some(RunStatus::Error);
        ev.message = Some(message.into());
        ev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_stay_out_of_the_wire_format() {
        let ev = RunEvent::status("preparing environment");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "status");
        assert_eq!(json["message"], "preparing environment");
        assert!(json.get("score").is_none());
        assert!(json.get("assets").is_none());
    }

    #[test]
    fn asset_paths_are_relative_to_the_result_dir() {
        let base = std::path::Path::new("/runs/model/task");
        let asset = Asset::new("screenshot", &base.join("step_1.png"), base);
        assert_eq!(asset.relative_path, "step_1.png");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Pending.is_terminal());
    }
}
