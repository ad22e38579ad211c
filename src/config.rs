use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{DeskPilotError, DeskPilotResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub active_provider: String,
    pub providers: HashMap<String, ProviderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    pub api_base: String,
    /// Model name sent to the API.
    pub model: String,
    #[serde(default)]
    pub kind: ProviderKind,
    /// Optional API key stored in config.toml (falls back to env var DESKPILOT_<ID>_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    OpenaiCompatible,
    Ollama,
}

/// Knobs for the conversation engine and episode loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default)]
    pub coordinate_mode: CoordinateMode,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// Seconds to pause after each executed action so the UI can settle.
    #[serde(default = "default_sleep_after_execution")]
    pub sleep_after_execution: f64,
    /// Upper bound on messages sent per model call (system message excluded).
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            coordinate_mode: CoordinateMode::default(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            sleep_after_execution: default_sleep_after_execution(),
            max_history_messages: default_max_history_messages(),
        }
    }
}

/// How the model reports coordinates relative to the screenshot it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateMode {
    /// 0–1000 grid scaled by original_dimension / 1000.
    #[default]
    Relative,
    /// 0–999 grid scaled by original_dimension / 999.
    Discrete,
    /// Pixels in the processed image, scaled by original / processed dimension.
    Absolute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_skills_dir")]
    pub skills_dir: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            skills_dir: default_skills_dir(),
            results_dir: default_results_dir(),
        }
    }
}

fn default_max_steps() -> u32 {
    15
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f64 {
    0.2
}

fn default_top_p() -> f64 {
    0.9
}

fn default_sleep_after_execution() -> f64 {
    0.5
}

fn default_max_history_messages() -> usize {
    12
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deskpilot")
}

fn default_skills_dir() -> PathBuf {
    data_dir().join("skills")
}

fn default_results_dir() -> PathBuf {
    data_dir().join("runs")
}

fn resolve_config_path() -> DeskPilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(DeskPilotError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn load_config() -> DeskPilotResult<AppConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config: AppConfig = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), provider = %config.llm.active_provider, "config loaded");
    Ok(config)
}

pub fn save_config(config: &AppConfig) -> DeskPilotResult<()> {
    let path = resolve_config_path()?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
[llm]
active_provider = "local"

[llm.providers.local]
display_name = "Local"
api_base = "http://127.0.0.1:11434"
model = "qwen3-vl"
kind = "ollama"
"#;
        let cfg: AppConfig = toml::from_str(raw).expect("parse");
        assert_eq!(cfg.llm.active_provider, "local");
        assert_eq!(cfg.agent.max_steps, 15);
        assert_eq!(cfg.agent.coordinate_mode, CoordinateMode::Relative);
        let entry = &cfg.llm.providers["local"];
        assert_eq!(entry.kind, ProviderKind::Ollama);
    }
}
