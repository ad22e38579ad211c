use crate::errors::{DeskPilotError, DeskPilotResult};

/// One parsed server-sent event from an OpenAI-compatible stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseChunk {
    Content(String),
    Done,
}

/// Parses a raw SSE line into a chunk. Returns None for keep-alives and
/// non-data lines.
pub fn parse_sse_line(line: &str) -> DeskPilotResult<Option<SseChunk>> {
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let data = if let Some(d) = line.strip_prefix("data: ") {
        d.trim()
    } else {
        return Ok(None);
    };

    if data == "[DONE]" {
        return Ok(Some(SseChunk::Done));
    }

    let json: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| DeskPilotError::Provider(format!("SSE parse: {e}")))?;

    if let Some(first) = json["choices"].as_array().and_then(|c| c.first()) {
        if let Some(content) = first["delta"]["content"].as_str() {
            if !content.is_empty() {
                return Ok(Some(SseChunk::Content(content.to_string())));
            }
        }
        if first["finish_reason"].as_str().is_some() {
            return Ok(Some(SseChunk::Done));
        }
    }

    Ok(None)
}
