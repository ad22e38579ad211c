use serde::{Deserialize, Serialize};

use crate::config::CoordinateMode;

/// Closed set of UI operations a model turn can compile into. Coordinates are
/// already screen-space pixels by the time a command is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionCommand {
    LeftClick { coordinate: Option<(i32, i32)> },
    RightClick { coordinate: Option<(i32, i32)> },
    MiddleClick { coordinate: Option<(i32, i32)> },
    DoubleClick { coordinate: Option<(i32, i32)> },
    MouseMove { x: i32, y: i32 },
    Drag { x: i32, y: i32, duration: f64 },
    TypeText { text: String },
    KeyPress { keys: Vec<String> },
    Scroll { pixels: i64 },
    Wait,
    TerminateSuccess,
    TerminateFailure,
}

impl ActionCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LeftClick { .. } => "left_click",
            Self::RightClick { .. } => "right_click",
            Self::MiddleClick { .. } => "middle_click",
            Self::DoubleClick { .. } => "double_click",
            Self::MouseMove { .. } => "mouse_move",
            Self::Drag { .. } => "drag",
            Self::TypeText { .. } => "type",
            Self::KeyPress { .. } => "key",
            Self::Scroll { .. } => "scroll",
            Self::Wait => "wait",
            Self::TerminateSuccess => "terminate_success",
            Self::TerminateFailure => "terminate_failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TerminateSuccess | Self::TerminateFailure)
    }
}

/// Parses free-form model output into a human-readable summary and structured
/// commands. Anomalies are logged and skipped; this never fails the turn.
pub fn compile(
    response: &str,
    mode: CoordinateMode,
    original: Option<(u32, u32)>,
    processed: Option<(u32, u32)>,
) -> (String, Vec<ActionCommand>) {
    let mut summary = String::new();
    let mut commands: Vec<ActionCommand> = Vec::new();

    if response.trim().is_empty() {
        return (summary, commands);
    }

    let scaler = CoordinateScaler {
        mode,
        original,
        processed,
    };

    // Put tool_call markers on their own lines so partially streamed blocks
    // are still captured by the line walk.
    let normalized = response
        .replace("<tool_call>", "\n<tool_call>\n")
        .replace("</tool_call>", "\n</tool_call>\n");

    let mut inside_block = false;
    let mut block_lines: Vec<&str> = Vec::new();

    for raw in normalized.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("<tool_call>") {
            inside_block = true;
            continue;
        }
        if line.starts_with("</tool_call>") {
            if !block_lines.is_empty() {
                process_tool_call(&block_lines.join("\n"), &scaler, &mut commands);
                block_lines.clear();
            }
            inside_block = false;
            continue;
        }

        if inside_block {
            block_lines.push(line);
            continue;
        }

        // The marker may sit mid-line after narration, not only at the start.
        if line.to_lowercase().contains("action:") {
            if summary.is_empty() {
                if let Some(text) = action_line_summary(line) {
                    summary = text;
                }
            }
            continue;
        }

        // Compact JSON blobs emitted without a <tool_call> wrapper; only
        // entries carrying name + arguments match the schema.
        if line.starts_with('{') && line.ends_with('}') {
            if let Ok(obj) = serde_json::from_str::<serde_json::Value>(line) {
                if obj.get("name").is_some() && obj.get("arguments").is_some() {
                    process_tool_call(line, &scaler, &mut commands);
                }
            }
        }
    }

    if !block_lines.is_empty() {
        process_tool_call(&block_lines.join("\n"), &scaler, &mut commands);
    }

    if summary.is_empty() {
        if let Some(first) = commands.first() {
            summary = format!("Performing {} action", first.kind());
        }
    }

    (summary, commands)
}

/// Text after `Action:`, truncated at the first structured-block marker.
fn action_line_summary(line: &str) -> Option<String> {
    let idx = line.to_lowercase().find("action:")?;
    let mut text = line[idx + "action:".len()..].trim();
    for marker in ["<tool_call", "<skill"] {
        if let Some(pos) = text.find(marker) {
            text = text[..pos].trim();
        }
    }
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

struct CoordinateScaler {
    mode: CoordinateMode,
    original: Option<(u32, u32)>,
    processed: Option<(u32, u32)>,
}

impl CoordinateScaler {
    /// Converts model-reported coordinates into screen pixels. Without known
    /// original dimensions the pair passes through as integers.
    fn adjust(&self, x: f64, y: f64) -> (i32, i32) {
        let Some((ow, oh)) = self.original else {
            return (x as i32, y as i32);
        };
        match self.mode {
            CoordinateMode::Absolute => {
                if let Some((pw, ph)) = self.processed {
                    let sx = ow as f64 / pw as f64;
                    let sy = oh as f64 / ph as f64;
                    ((x * sx) as i32, (y * sy) as i32)
                } else {
                    (x as i32, y as i32)
                }
            }
            CoordinateMode::Relative => ((x * ow as f64 / 1000.0) as i32, (y * oh as f64 / 1000.0) as i32),
            CoordinateMode::Discrete => ((x * ow as f64 / 999.0) as i32, (y * oh as f64 / 999.0) as i32),
        }
    }
}

/// Some streamed outputs duplicate closing braces; trim them gradually until
/// the candidate parses.
fn coerce_json(text: &str) -> Option<serde_json::Value> {
    let mut stripped = text.trim().to_string();
    if let Ok(value) = serde_json::from_str(&stripped) {
        return Some(value);
    }
    let opening = stripped.matches('{').count();
    let mut closing = stripped.matches('}').count();
    while closing > opening && stripped.ends_with('}') {
        stripped.pop();
        stripped.truncate(stripped.trim_end().len());
        closing = stripped.matches('}').count();
    }
    serde_json::from_str(&stripped).ok()
}

fn process_tool_call(json_str: &str, scaler: &CoordinateScaler, commands: &mut Vec<ActionCommand>) {
    let Some(tool_call) = coerce_json(json_str) else {
        tracing::warn!("failed to parse tool call block, skipping");
        return;
    };
    if !tool_call.is_object() {
        return;
    }

    let args = if tool_call["name"].as_str() == Some("computer_use")
        && tool_call.get("arguments").is_some()
    {
        &tool_call["arguments"]
    } else if tool_call.get("action").is_some() {
        &tool_call
    } else {
        return;
    };
    if !args.is_object() {
        return;
    }

    // Some models output uppercase names or synonyms.
    let raw_action = match &args["action"] {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => return,
        other => other.to_string(),
    };
    let mut action = raw_action.trim().to_lowercase();
    if action == "click" {
        action = "left_click".to_string();
    }

    let coordinate = parse_coordinate(args).map(|(x, y)| scaler.adjust(x, y));

    let command = match action.as_str() {
        "left_click" => Some(ActionCommand::LeftClick { coordinate }),
        "right_click" => Some(ActionCommand::RightClick { coordinate }),
        "middle_click" => Some(ActionCommand::MiddleClick { coordinate }),
        "double_click" => Some(ActionCommand::DoubleClick { coordinate }),
        "mouse_move" => {
            let (x, y) = coordinate.unwrap_or((0, 0));
            Some(ActionCommand::MouseMove { x, y })
        }
        "left_click_drag" => {
            let (x, y) = coordinate.unwrap_or((0, 0));
            let duration = args["duration"].as_f64().unwrap_or(0.5);
            Some(ActionCommand::Drag { x, y, duration })
        }
        "type" => {
            let text = args["text"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| match &args["text"] {
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                });
            Some(ActionCommand::TypeText { text })
        }
        "key" => {
            let keys = args["keys"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .map(|k| match k.as_str() {
                            Some(s) => normalize_key(s),
                            None => k.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(ActionCommand::KeyPress { keys })
        }
        "scroll" => Some(ActionCommand::Scroll {
            pixels: args["pixels"].as_i64().unwrap_or(0),
        }),
        "wait" => Some(ActionCommand::Wait),
        "terminate" => {
            if args["status"].as_str() == Some("failure") {
                Some(ActionCommand::TerminateFailure)
            } else {
                Some(ActionCommand::TerminateSuccess)
            }
        }
        other => {
            tracing::warn!(action = other, "unrecognized action name, dropping");
            None
        }
    };

    if let Some(command) = command {
        commands.push(command);
    }
}

fn parse_coordinate(args: &serde_json::Value) -> Option<(f64, f64)> {
    let pair = args.get("coordinate")?.as_array()?;
    if pair.len() < 2 {
        return None;
    }
    Some((pair[0].as_f64()?, pair[1].as_f64()?))
}

#[cfg(target_os = "macos")]
const PRIMARY_MODIFIER: &str = "command";
#[cfg(not(target_os = "macos"))]
const PRIMARY_MODIFIER: &str = "ctrl";

/// Collapses quoting artifacts from key arrays that arrive as embedded strings
/// and maps ctrl/control to the platform's primary modifier.
fn normalize_key(key: &str) -> String {
    let mut key = key;
    if let Some(rest) = key.strip_prefix("keys=[") {
        key = rest;
    }
    if let Some(rest) = key.strip_suffix(']') {
        key = rest;
    }
    for prefix in ["['", "[\""] {
        if key.len() > 2 {
            if let Some(rest) = key.strip_prefix(prefix) {
                key = rest;
            }
        }
    }
    for suffix in ["']", "\"]"] {
        if key.len() > 2 {
            if let Some(rest) = key.strip_suffix(suffix) {
                key = rest;
            }
        }
    }
    let key = key.trim();
    if key.eq_ignore_ascii_case("ctrl") || key.eq_ignore_ascii_case("control") {
        PRIMARY_MODIFIER.to_string()
    } else {
        key.to_string()
    }
}
