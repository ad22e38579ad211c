use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::errors::DeskPilotResult;

/// One line of `traj.jsonl`. The reset record is step 0 with action "reset"
/// and carries the instruction; step records carry everything else.
#[derive(Debug, Serialize)]
pub struct TrajectoryRecord<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_num: Option<u32>,
    pub action_timestamp: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_file: Option<&'a str>,
}

/// Append-only JSONL writer for one episode's trajectory. Each record is
/// flushed immediately so a crashed run still leaves a usable log.
pub struct TrajectoryWriter {
    file: File,
    path: PathBuf,
}

impl TrajectoryWriter {
    pub fn create(dir: &Path) -> DeskPilotResult<Self> {
        let path = dir.join("traj.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    pub fn append(&mut self, record: &TrajectoryRecord<'_>) -> DeskPilotResult<()> {
        let line = serde_json::to_string(record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
