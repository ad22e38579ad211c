use std::sync::Arc;

use regex::RegexBuilder;

use crate::agent::image::process_screenshot;
use crate::agent::parser::{compile, ActionCommand};
use crate::agent::prompt::PromptBuilder;
use crate::config::CoordinateMode;
use crate::episode::environment::Observation;
use crate::errors::DeskPilotResult;
use crate::llm::provider::ModelProvider;
use crate::llm::types::{ChatMessage, ContentPart, ModelParams, Role};
use crate::skills::{SkillInjector, SkillOutput};

/// Bound on inline skill-lookup iterations within one predict call.
const MAX_SKILL_TURNS: u32 = 3;

/// Result of one model turn: the cleaned reply, a human-readable action
/// description, and the compiled commands.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub response: String,
    pub description: String,
    pub actions: Vec<ActionCommand>,
}

/// Multi-turn conversation state for one episode. Owns the message history and
/// step counters for the lifetime of a single task attempt; `reset` must be
/// called once per new episode, never mid-episode.
pub struct ConversationAgent {
    provider: Arc<dyn ModelProvider>,
    params: ModelParams,
    coordinate_mode: CoordinateMode,
    max_steps: u32,
    max_history_messages: usize,
    skills: SkillInjector,
    skill_strip_re: regex::Regex,

    messages: Vec<ChatMessage>,
    conversation_started: bool,
    executed_actions: Vec<String>,
    screen_width: Option<u32>,
    screen_height: Option<u32>,
    latest_skill_outputs: Vec<SkillOutput>,
}

impl ConversationAgent {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        skills: SkillInjector,
        params: ModelParams,
        coordinate_mode: CoordinateMode,
        max_steps: u32,
        max_history_messages: usize,
    ) -> Self {
        let skill_strip_re = RegexBuilder::new(r"<skill>.*?</skill>")
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .expect("valid skill pattern");
        Self {
            provider,
            params,
            coordinate_mode,
            max_steps,
            max_history_messages,
            skills,
            skill_strip_re,
            messages: Vec::new(),
            conversation_started: false,
            executed_actions: Vec::new(),
            screen_width: None,
            screen_height: None,
            latest_skill_outputs: Vec::new(),
        }
    }

    /// Predicts the next action(s) from the current observation. The
    /// instruction only matters on the first call of an episode; later calls
    /// carry the new screenshot alone.
    pub async fn predict(
        &mut self,
        instruction: &str,
        obs: &Observation,
    ) -> DeskPilotResult<Prediction> {
        let processed = process_screenshot(&obs.screenshot)?;
        tracing::debug!(
            original = %format!("{}x{}", processed.original_width, processed.original_height),
            processed = %format!("{}x{}", processed.width, processed.height),
            "screenshot decoded"
        );

        self.ensure_system_prompt(processed.original_width, processed.original_height);

        if !self.conversation_started {
            self.messages.push(PromptBuilder::build_user_message(
                Some(instruction),
                Some(&processed.base64),
            ));
            self.conversation_started = true;
        } else {
            self.messages
                .push(PromptBuilder::build_user_message(None, Some(&processed.base64)));
        }

        self.log_transcript("model conversation context");
        let response_raw = self.chat_with_skills().await?;

        let response_clean = self.strip_skill_markers(&response_raw);
        tracing::info!(response = %response_clean, "model output");

        let (mut description, mut actions) = compile(
            &response_clean,
            self.coordinate_mode,
            Some((processed.original_width, processed.original_height)),
            Some((processed.width, processed.height)),
        );
        tracing::info!(description = %description, commands = actions.len(), "turn compiled");

        self.executed_actions.push(if description.is_empty() {
            "Skill interaction".to_string()
        } else {
            description.clone()
        });

        // Hard stop once the step budget is spent and the turn did not
        // terminate on its own. Zero-action turns are handled separately by
        // the episode runner and are deliberately not budget-checked here.
        let current_step = self.executed_actions.len() as u32;
        if current_step >= self.max_steps
            && actions.first().map(|a| !a.is_terminal()).unwrap_or(false)
        {
            tracing::warn!(max_steps = self.max_steps, "step budget exhausted, forcing termination");
            description = "Fail the task because reaching the maximum step limit.".to_string();
            actions = vec![ActionCommand::TerminateFailure];
        }

        Ok(Prediction {
            response: response_clean,
            description,
            actions,
        })
    }

    /// Runs the conversation loop, answering inline skill requests until the
    /// model stops asking or the loop guard trips.
    async fn chat_with_skills(&mut self) -> DeskPilotResult<String> {
        let mut response_raw;
        let mut skill_turns = 0u32;
        self.latest_skill_outputs.clear();

        loop {
            let outbound = self.prepare_messages_for_send();
            response_raw = self.provider.complete(&outbound, &self.params).await?;
            self.messages
                .push(ChatMessage::text(Role::Assistant, response_raw.clone()));

            let skill_refs = self.skills.extract_requests(&response_raw);
            if skill_refs.is_empty() {
                break;
            }

            self.latest_skill_outputs.clear();
            for reference in skill_refs {
                let (reply_text, found) = self.skills.build_skill_reply(&reference);
                self.latest_skill_outputs.push(SkillOutput {
                    title: reference,
                    body: reply_text.clone(),
                    available: found,
                });
                self.messages.push(ChatMessage::text(Role::User, reply_text));
            }

            skill_turns += 1;
            if skill_turns >= MAX_SKILL_TURNS {
                // Loop guard, not an error: return the latest reply as-is.
                tracing::warn!("skill lookup loop exceeded limit, returning latest response");
                break;
            }
        }

        Ok(response_raw)
    }

    /// Rebuilds the system message when the viewport changed or none exists.
    fn ensure_system_prompt(&mut self, width: u32, height: u32) {
        if self.screen_width == Some(width)
            && self.screen_height == Some(height)
            && !self.messages.is_empty()
        {
            return;
        }

        let skill_section = self.skills.catalog_section();
        let system_prompt = PromptBuilder::build_system_prompt(width, height, &skill_section);
        let system_msg = ChatMessage::text(Role::System, system_prompt);

        if matches!(self.messages.first(), Some(m) if m.role == Role::System) {
            self.messages[0] = system_msg;
        } else {
            self.messages.insert(0, system_msg);
        }

        self.screen_width = Some(width);
        self.screen_height = Some(height);
    }

    fn strip_skill_markers(&self, response: &str) -> String {
        if !response.to_lowercase().contains("<skill") {
            return response.to_string();
        }
        self.skill_strip_re.replace_all(response, "").trim().to_string()
    }

    /// Trims the outbound transcript: system message kept, at most
    /// `max_history_messages` recent messages, at most one embedded image.
    /// Older image-only messages collapse to a short text marker.
    pub(crate) fn prepare_messages_for_send(&self) -> Vec<ChatMessage> {
        const MAX_IMAGES: usize = 1;

        if self.messages.is_empty() {
            return Vec::new();
        }

        let mut remaining: &[ChatMessage] = &self.messages;
        let mut system_msg = None;
        if matches!(remaining.first(), Some(m) if m.role == Role::System) {
            system_msg = Some(remaining[0].clone());
            remaining = &remaining[1..];
        }

        let mut trimmed: Vec<ChatMessage> = Vec::new();
        let mut image_budget = MAX_IMAGES;
        for raw in remaining.iter().rev() {
            let mut text_parts: Vec<ContentPart> = Vec::new();
            let mut image_parts: Vec<ContentPart> = Vec::new();
            for part in &raw.content {
                match part {
                    ContentPart::Text { .. } => text_parts.push(part.clone()),
                    ContentPart::ImageUrl { .. } => image_parts.push(part.clone()),
                }
            }

            let mut content = Vec::new();
            if !image_parts.is_empty() && image_budget > 0 {
                image_budget -= 1;
                content.extend(text_parts);
                content.push(image_parts.swap_remove(0));
            } else if !text_parts.is_empty() {
                content.extend(text_parts);
            } else if !image_parts.is_empty() {
                content.push(ContentPart::Text {
                    text: "(previous screenshot omitted)".to_string(),
                });
            }

            trimmed.push(ChatMessage {
                role: raw.role,
                content,
            });
            if trimmed.len() >= self.max_history_messages {
                break;
            }
        }

        trimmed.reverse();
        if let Some(system_msg) = system_msg {
            trimmed.insert(0, system_msg);
        }
        trimmed
    }

    /// Skill outputs produced by the most recent turn; cleared on read.
    pub fn take_skill_outputs(&mut self) -> Vec<SkillOutput> {
        std::mem::take(&mut self.latest_skill_outputs)
    }

    /// Clears all per-episode state. Call once per new episode.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.conversation_started = false;
        self.executed_actions.clear();
        self.screen_width = None;
        self.screen_height = None;
        self.latest_skill_outputs.clear();
        self.skills.reset_cache();
    }

    fn log_transcript(&self, prefix: &str) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let lines: Vec<String> = self
            .messages
            .iter()
            .enumerate()
            .map(|(idx, message)| {
                let fragments: Vec<&str> = message
                    .content
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => text.as_str(),
                        ContentPart::ImageUrl { .. } => "[image]",
                    })
                    .collect();
                let text = fragments.join(" ");
                let text = if text.trim().is_empty() { "(empty)" } else { text.trim() };
                format!("{}. [{:?}] {}", idx + 1, message.role, text)
            })
            .collect();
        tracing::debug!("{prefix}\n{}", lines.join("\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::errors::DeskPilotError;
    use crate::skills::SkillStore;

    struct ScriptedProvider {
        replies: Mutex<VecDeque<String>>,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            messages: &[ChatMessage],
            _params: &ModelParams,
        ) -> DeskPilotResult<String> {
            self.calls.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| DeskPilotError::Provider("script exhausted".into()))
        }
    }

    fn params() -> ModelParams {
        ModelParams {
            model: "test-vl".into(),
            max_tokens: 2048,
            temperature: 0.2,
            top_p: 0.9,
        }
    }

    fn png_observation(width: u32, height: u32) -> Observation {
        let img = image::DynamicImage::new_rgb8(width, height);
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        Observation {
            screenshot: bytes,
            accessibility_tree: None,
        }
    }

    fn agent_with(provider: Arc<ScriptedProvider>, max_steps: u32) -> ConversationAgent {
        ConversationAgent::new(
            provider,
            SkillInjector::new(None),
            params(),
            CoordinateMode::Relative,
            max_steps,
            12,
        )
    }

    const TERMINATE: &str = "Action: done\n<tool_call>\n{\"name\": \"computer_use\", \"arguments\": {\"action\": \"terminate\", \"status\": \"success\"}}\n</tool_call>";

    #[tokio::test]
    async fn first_call_builds_system_prompt_and_sends_instruction() {
        let provider = ScriptedProvider::new(vec![TERMINATE]);
        let mut agent = agent_with(provider.clone(), 15);

        let prediction = agent
            .predict("open the settings app", &png_observation(640, 400))
            .await
            .unwrap();

        assert_eq!(prediction.actions, vec![ActionCommand::TerminateSuccess]);
        assert_eq!(prediction.description, "done");

        let calls = provider.calls.lock().unwrap();
        let sent = &calls[0];
        assert_eq!(sent[0].role, Role::System);
        assert!(sent[0].text_content().contains("640x400"));
        assert!(sent[1].text_content().contains("open the settings app"));
        assert!(sent[1].has_image());
    }

    #[tokio::test]
    async fn followup_calls_send_image_only() {
        let click = "Action: click it\n<tool_call>\n{\"name\": \"computer_use\", \"arguments\": {\"action\": \"left_click\", \"coordinate\": [500, 500]}}\n</tool_call>";
        let provider = ScriptedProvider::new(vec![click, TERMINATE]);
        let mut agent = agent_with(provider.clone(), 15);

        agent.predict("task", &png_observation(640, 400)).await.unwrap();
        agent.predict("ignored", &png_observation(640, 400)).await.unwrap();

        let calls = provider.calls.lock().unwrap();
        let second_user = calls[1].last().unwrap();
        assert!(second_user.has_image());
        assert!(!second_user.text_content().contains("ignored"));
    }

    #[tokio::test]
    async fn skill_requests_loop_and_record_outputs() {
        let ask = "Let me check.\n<skill>foo</skill>";
        let provider = ScriptedProvider::new(vec![ask, TERMINATE]);
        let mut agent = agent_with(provider.clone(), 15);

        let prediction = agent.predict("task", &png_observation(640, 400)).await.unwrap();
        assert_eq!(prediction.actions, vec![ActionCommand::TerminateSuccess]);

        let outputs = agent.take_skill_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].title, "foo");
        assert!(!outputs[0].available);
        assert!(outputs[0].body.contains("not available"));

        // The unresolved-skill notice went back to the model as a user turn.
        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].last().unwrap().text_content().contains("not available"));
    }

    #[tokio::test]
    async fn skill_loop_guard_returns_latest_reply() {
        let ask = "<skill>foo</skill>";
        let provider = ScriptedProvider::new(vec![ask, ask, ask, ask]);
        let mut agent = agent_with(provider.clone(), 15);

        let prediction = agent.predict("task", &png_observation(640, 400)).await.unwrap();
        // Markers stripped, nothing left to compile.
        assert!(prediction.actions.is_empty());
        assert_eq!(provider.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn step_budget_forces_failure_on_non_terminal_turn() {
        let click = "Action: keep clicking\n<tool_call>\n{\"name\": \"computer_use\", \"arguments\": {\"action\": \"left_click\", \"coordinate\": [10, 10]}}\n</tool_call>";
        let provider = ScriptedProvider::new(vec![click]);
        let mut agent = agent_with(provider, 1);

        let prediction = agent.predict("task", &png_observation(640, 400)).await.unwrap();
        assert_eq!(prediction.actions, vec![ActionCommand::TerminateFailure]);
        assert!(prediction.description.contains("maximum step limit"));
    }

    #[tokio::test]
    async fn step_budget_leaves_terminal_turns_alone() {
        let provider = ScriptedProvider::new(vec![TERMINATE]);
        let mut agent = agent_with(provider, 1);

        let prediction = agent.predict("task", &png_observation(640, 400)).await.unwrap();
        assert_eq!(prediction.actions, vec![ActionCommand::TerminateSuccess]);
    }

    #[tokio::test]
    async fn trimming_keeps_at_most_one_image() {
        let click = "<tool_call>\n{\"name\": \"computer_use\", \"arguments\": {\"action\": \"left_click\", \"coordinate\": [1, 1]}}\n</tool_call>";
        let provider = ScriptedProvider::new(vec![click, click, click]);
        let mut agent = agent_with(provider, 15);

        for _ in 0..3 {
            agent.predict("task", &png_observation(640, 400)).await.unwrap();
        }

        let outbound = agent.prepare_messages_for_send();
        let image_count = outbound.iter().filter(|m| m.has_image()).count();
        assert_eq!(image_count, 1);
        // Newest image survives; older ones collapse to the placeholder.
        assert!(outbound.last().unwrap().has_image());
        assert!(outbound
            .iter()
            .any(|m| m.text_content().contains("(previous screenshot omitted)")));
    }

    #[tokio::test]
    async fn trimming_bounds_message_count_and_keeps_system() {
        let click = "<tool_call>\n{\"name\": \"computer_use\", \"arguments\": {\"action\": \"wait\"}}\n</tool_call>";
        let provider = ScriptedProvider::new(vec![click; 8]);
        let mut agent = ConversationAgent::new(
            provider,
            SkillInjector::new(None),
            params(),
            CoordinateMode::Relative,
            50,
            4,
        );

        for _ in 0..8 {
            agent.predict("task", &png_observation(640, 400)).await.unwrap();
        }

        let outbound = agent.prepare_messages_for_send();
        assert_eq!(outbound.len(), 5); // system + 4 trimmed
        assert_eq!(outbound[0].role, Role::System);
    }

    #[tokio::test]
    async fn reset_clears_episode_state() {
        let provider = ScriptedProvider::new(vec![TERMINATE, TERMINATE]);
        let mut agent = agent_with(provider.clone(), 15);

        agent.predict("first task", &png_observation(640, 400)).await.unwrap();
        agent.reset();
        agent.predict("second task", &png_observation(640, 400)).await.unwrap();

        let calls = provider.calls.lock().unwrap();
        // After reset the instruction is sent again as a first call.
        assert!(calls[1][1].text_content().contains("second task"));
        assert!(!calls[1].iter().any(|m| m.text_content().contains("first task")));
    }

    #[tokio::test]
    async fn catalog_section_lands_in_system_prompt() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path()).unwrap();
        store.upsert("Open Settings", "click the gear", None).unwrap();

        let provider = ScriptedProvider::new(vec![TERMINATE]);
        let mut agent = ConversationAgent::new(
            provider.clone(),
            SkillInjector::new(Some(Arc::new(store))),
            params(),
            CoordinateMode::Relative,
            15,
            12,
        );
        agent.predict("task", &png_observation(640, 400)).await.unwrap();

        let calls = provider.calls.lock().unwrap();
        assert!(calls[0][0].text_content().contains("- Open Settings"));
    }
}
