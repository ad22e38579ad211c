use crate::llm::types::{ChatMessage, ContentPart, Role};

const SYSTEM_PROMPT_TEMPLATE: &str = "\
You are a GUI automation agent operating a desktop through screenshots.
The screen resolution is {width}x{height}.

For each screenshot you receive, think about the current state of the task,
then reply with exactly one line starting with `Action:` that describes the
next step in plain language, followed by one tool call.

{{tools_def}}

## Stored skills
You may request the full steps of a stored skill at any time by replying with
`<skill>skill title</skill>` on its own, before issuing an action. The skill
body will be provided as additional context. Available skills:
{{skill_section}}

Rules:
- Issue at most one tool call per reply.
- When the task is finished, terminate with status \"success\".
- If the task cannot be completed, terminate with status \"failure\".";

const TOOL_DESCRIPTION: &str = "\
## Tool
You control the computer with the `computer_use` function. Wrap every call in
<tool_call></tool_call> tags containing a JSON object:
<tool_call>
{\"name\": \"computer_use\", \"arguments\": {\"action\": \"...\", ...}}
</tool_call>

Supported actions:
- left_click, right_click, middle_click, double_click: {\"coordinate\": [x, y]}
- mouse_move: {\"coordinate\": [x, y]}
- left_click_drag: {\"coordinate\": [x, y], \"duration\": seconds}
- type: {\"text\": \"...\"}
- key: {\"keys\": [\"ctrl\", \"c\"]}
- scroll: {\"pixels\": signed amount}
- wait: {}
- terminate: {\"status\": \"success\" | \"failure\"}";

/// Composes the system prompt and user messages for the conversation engine.
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn build_system_prompt(width: u32, height: u32, skill_section: &str) -> String {
        SYSTEM_PROMPT_TEMPLATE
            .replace("{width}", &width.to_string())
            .replace("{height}", &height.to_string())
            .replace("{{tools_def}}", TOOL_DESCRIPTION)
            .replace("{{skill_section}}", skill_section)
    }

    pub fn build_user_message(text: Option<&str>, image_base64: Option<&str>) -> ChatMessage {
        let mut content = Vec::new();
        if let Some(text) = text {
            content.push(ContentPart::Text { text: text.to_string() });
        }
        if let Some(payload) = image_base64 {
            content.push(ContentPart::image_png_base64(payload));
        }
        ChatMessage {
            role: Role::User,
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_embeds_viewport_tools_and_skills() {
        let prompt = PromptBuilder::build_system_prompt(1920, 1080, "- Open Settings");
        assert!(prompt.contains("1920x1080"));
        assert!(prompt.contains("computer_use"));
        assert!(prompt.contains("- Open Settings"));
        assert!(!prompt.contains("{{tools_def}}"));
        assert!(!prompt.contains("{{skill_section}}"));
    }

    #[test]
    fn user_message_orders_text_before_image() {
        let msg = PromptBuilder::build_user_message(Some("do it"), Some("QUJD"));
        assert_eq!(msg.content.len(), 2);
        assert!(matches!(&msg.content[0], ContentPart::Text { text } if text == "do it"));
        assert!(msg.has_image());

        let image_only = PromptBuilder::build_user_message(None, Some("QUJD"));
        assert_eq!(image_only.content.len(), 1);
    }
}
