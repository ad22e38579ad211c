use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::runtime::Handle;

use crate::agent::engine::ConversationAgent;
use crate::agent::image::normalize_screenshot;
use crate::episode::environment::{Environment, Observation, TaskConfig};
use crate::episode::trajectory::{TrajectoryRecord, TrajectoryWriter};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::run::events::{Asset, RunEvent, RunStatus};

/// Knobs the run manager passes through to one episode.
pub struct EpisodeOptions {
    /// Upper bound on model turns per episode. Counts every turn, including
    /// skill-only ones, so a model that never produces an action still stops.
    pub max_steps: u32,
    /// Seconds to wait after each executed command before the next screenshot.
    pub sleep_after_execution: f64,
    /// Arbitrary launch arguments persisted as `run_args.json` for later
    /// inspection of how the run was configured.
    pub run_args: serde_json::Value,
}

/// Terminal state of one finished episode.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub score: Option<f64>,
    pub steps: u32,
    /// What the model declared via terminate, when it did.
    pub declared_success: Option<bool>,
}

/// Drives one episode to completion on the calling (blocking) thread. Async
/// model calls are bridged through `handle`. Progress events go to `emit`;
/// start/complete framing is the caller's responsibility.
///
/// Returns `Err` only for failures that prevent the episode from running at
/// all; in-episode conditions (cancellation, soft stops, pending evaluation)
/// come back as a `RunOutcome`.
pub fn run_episode(
    env: &mut dyn Environment,
    agent: &mut ConversationAgent,
    task: &TaskConfig,
    result_dir: &Path,
    options: &EpisodeOptions,
    cancel: &AtomicBool,
    handle: &Handle,
    emit: &mut dyn FnMut(RunEvent),
) -> DeskPilotResult<RunOutcome> {
    fs::create_dir_all(result_dir)?;
    fs::write(
        result_dir.join("task_config.json"),
        serde_json::to_string_pretty(task)?,
    )?;
    fs::write(
        result_dir.join("run_args.json"),
        serde_json::to_string_pretty(&options.run_args)?,
    )?;

    agent.reset();
    let mut traj = TrajectoryWriter::create(result_dir)?;

    emit(RunEvent::status("preparing environment"));
    let observation = env.reset(task)?;
    let reset_shot = save_screenshot(result_dir, "step_reset", &observation)?;
    let reset_info = serde_json::json!({});
    traj.append(&TrajectoryRecord {
        step_num: Some(0),
        action_timestamp: &timestamp(),
        instruction: Some(&task.instruction),
        action: Some("reset"),
        response: None,
        reward: Some(0.0),
        done: Some(false),
        info: Some(&reset_info),
        screenshot_file: reset_shot.as_deref(),
    })?;
    if let Some(name) = &reset_shot {
        emit(RunEvent::screenshot(
            None,
            Asset::new("screenshot", &result_dir.join(name), result_dir),
        ));
    }
    emit(RunEvent::status("environment ready"));

    let recording = env.start_recording();
    let result = run_loop(
        env, agent, task, result_dir, options, cancel, handle, emit, &mut traj, observation,
    );
    if recording {
        let path = result_dir.join("recording.mp4");
        if env.end_recording(&path) {
            emit(RunEvent::screenshot(
                None,
                Asset::new("recording", &path, result_dir),
            ));
        }
    }

    let outcome = result?;
    let result_text = match outcome.status {
        RunStatus::Pending => "pending".to_string(),
        RunStatus::Cancelled => "cancelled".to_string(),
        _ => outcome
            .score
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    };
    fs::write(result_dir.join("result.txt"), result_text)?;
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    env: &mut dyn Environment,
    agent: &mut ConversationAgent,
    task: &TaskConfig,
    result_dir: &Path,
    options: &EpisodeOptions,
    cancel: &AtomicBool,
    handle: &Handle,
    emit: &mut dyn FnMut(RunEvent),
    traj: &mut TrajectoryWriter,
    mut observation: Observation,
) -> DeskPilotResult<RunOutcome> {
    let mut step_num: u32 = 0;
    let mut turns: u32 = 0;
    let mut done = false;
    let mut declared_success: Option<bool> = None;
    let mut cancelled = false;

    'episode: while !done {
        if cancel.load(Ordering::SeqCst) {
            cancelled = true;
            break;
        }
        // Outer bound backing up the engine's forced termination, which only
        // rewrites turns that produced a non-terminal action.
        if turns >= options.max_steps {
            tracing::warn!(max_steps = options.max_steps, "turn limit reached, stopping episode");
            emit(RunEvent::status("step limit reached, stopping"));
            break;
        }
        turns += 1;

        let prediction = handle.block_on(agent.predict(&task.instruction, &observation))?;

        // A proxy or gateway in front of the model sometimes answers with an
        // error page instead of a completion.
        let lowered = prediction.response.to_lowercase();
        if lowered.contains("<html") || lowered.contains("503 service") {
            return Err(DeskPilotError::Provider(
                "model endpoint returned an error page instead of a completion".into(),
            ));
        }

        let skill_outputs = agent.take_skill_outputs();
        if !skill_outputs.is_empty() {
            emit(RunEvent::skill(
                step_num + 1,
                serde_json::json!({ "skills": skill_outputs }),
            ));
        }

        if prediction.actions.is_empty() {
            if !skill_outputs.is_empty() {
                // Skill-only turn. Record it and let the model continue from
                // the same screenshot.
                let info = serde_json::json!({ "skills": skill_outputs });
                traj.append(&TrajectoryRecord {
                    step_num: None,
                    action_timestamp: &timestamp(),
                    instruction: None,
                    action: Some("skill lookup"),
                    response: Some(&prediction.response),
                    reward: None,
                    done: None,
                    info: Some(&info),
                    screenshot_file: None,
                })?;
                continue;
            }
            if step_num == 0 {
                return Err(DeskPilotError::Agent(
                    "model produced no executable action on the first step".into(),
                ));
            }
            tracing::warn!("model produced no executable action, stopping episode");
            emit(RunEvent::status("model produced no action, stopping"));
            break;
        }

        for action in &prediction.actions {
            if cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break 'episode;
            }
            step_num += 1;
            let ts = timestamp();

            if action.is_terminal() {
                done = true;
                declared_success =
                    Some(matches!(action, crate::agent::parser::ActionCommand::TerminateSuccess));
                let info = serde_json::json!({ "terminated": true });
                traj.append(&TrajectoryRecord {
                    step_num: Some(step_num),
                    action_timestamp: &ts,
                    instruction: None,
                    action: Some(&prediction.description),
                    response: Some(&prediction.response),
                    reward: None,
                    done: Some(true),
                    info: Some(&info),
                    screenshot_file: None,
                })?;
                emit(RunEvent::step(
                    step_num,
                    prediction.description.clone(),
                    serde_json::json!({ "action": action, "done": true }),
                ));
                break;
            }

            match env.step(action, options.sleep_after_execution) {
                Ok(outcome) => {
                    observation = outcome.observation;
                    let shot =
                        save_screenshot(result_dir, &format!("step_{step_num}"), &observation)?;
                    let info = serde_json::to_value(&outcome.info)?;
                    traj.append(&TrajectoryRecord {
                        step_num: Some(step_num),
                        action_timestamp: &ts,
                        instruction: None,
                        action: Some(&prediction.description),
                        response: Some(&prediction.response),
                        reward: Some(outcome.reward),
                        done: Some(outcome.done),
                        info: Some(&info),
                        screenshot_file: shot.as_deref(),
                    })?;
                    emit(RunEvent::step(
                        step_num,
                        prediction.description.clone(),
                        serde_json::json!({ "action": action, "done": outcome.done }),
                    ));
                    if let Some(name) = &shot {
                        emit(RunEvent::screenshot(
                            Some(step_num),
                            Asset::new("screenshot", &result_dir.join(name), result_dir),
                        ));
                    }
                    if outcome.done {
                        done = true;
                        break;
                    }
                }
                Err(err) => {
                    // Keep the previous observation and let the model see the
                    // unchanged screen on the next turn.
                    tracing::warn!(step = step_num, error = %err, "command execution failed");
                    let info = serde_json::json!({ "error": err.to_string() });
                    traj.append(&TrajectoryRecord {
                        step_num: Some(step_num),
                        action_timestamp: &ts,
                        instruction: None,
                        action: Some(&prediction.description),
                        response: Some(&prediction.response),
                        reward: None,
                        done: Some(false),
                        info: Some(&info),
                        screenshot_file: None,
                    })?;
                    emit(RunEvent::status(format!(
                        "step {step_num} failed to execute: {err}"
                    )));
                }
            }
        }
    }

    if cancelled {
        tracing::info!(steps = step_num, "episode cancelled");
        return Ok(RunOutcome {
            status: RunStatus::Cancelled,
            score: None,
            steps: step_num,
            declared_success,
        });
    }

    if task.needs_external_eval() {
        tracing::info!(steps = step_num, "episode finished, evaluation pending");
        return Ok(RunOutcome {
            status: RunStatus::Pending,
            score: None,
            steps: step_num,
            declared_success,
        });
    }

    emit(RunEvent::status("evaluating result"));
    let score = env.evaluate()?;
    tracing::info!(steps = step_num, score, "episode finished");
    Ok(RunOutcome {
        status: RunStatus::Completed,
        score: Some(score),
        steps: step_num,
        declared_success,
    })
}

/// Persists the observation's screenshot as `<prefix>_<timestamp>.png` and
/// returns the file name, or None when the observation carries no pixels.
fn save_screenshot(
    dir: &Path,
    prefix: &str,
    observation: &Observation,
) -> DeskPilotResult<Option<String>> {
    if observation.screenshot.is_empty() {
        return Ok(None);
    }
    let name = format!("{prefix}_{}.png", timestamp());
    let bytes = normalize_screenshot(&observation.screenshot);
    fs::write(dir.join(&name), bytes)?;
    Ok(Some(name))
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d@%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::agent::parser::ActionCommand;
    use crate::config::CoordinateMode;
    use crate::episode::environment::StepOutcome;
    use crate::llm::provider::ModelProvider;
    use crate::llm::types::{ChatMessage, ModelParams};
    use crate::skills::SkillInjector;

    struct ScriptedProvider {
        replies: Mutex<VecDeque<String>>,
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _params: &ModelParams,
        ) -> DeskPilotResult<String> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| DeskPilotError::Provider("script exhausted".into()))
        }
    }

    struct FakeEnv {
        steps: Vec<ActionCommand>,
        score: f64,
    }

    impl FakeEnv {
        fn new() -> Self {
            Self {
                steps: Vec::new(),
                score: 1.0,
            }
        }
    }

    impl Environment for FakeEnv {
        fn reset(&mut self, _task: &TaskConfig) -> DeskPilotResult<Observation> {
            Ok(Observation {
                screenshot: test_png(),
                accessibility_tree: None,
            })
        }

        fn step(
            &mut self,
            command: &ActionCommand,
            _post_delay: f64,
        ) -> DeskPilotResult<StepOutcome> {
            self.steps.push(command.clone());
            Ok(StepOutcome {
                observation: Observation {
                    screenshot: test_png(),
                    accessibility_tree: None,
                },
                reward: 0.0,
                done: false,
                info: HashMap::new(),
            })
        }

        fn evaluate(&mut self) -> DeskPilotResult<f64> {
            Ok(self.score)
        }

        fn close(&mut self) -> DeskPilotResult<()> {
            Ok(())
        }
    }

    fn test_png() -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(320, 200);
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn agent_from(replies: Vec<&str>) -> ConversationAgent {
        let provider = Arc::new(ScriptedProvider {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
        });
        ConversationAgent::new(
            provider,
            SkillInjector::new(None),
            ModelParams {
                model: "test-vl".into(),
                max_tokens: 2048,
                temperature: 0.2,
                top_p: 0.9,
            },
            CoordinateMode::Relative,
            15,
            12,
        )
    }

    fn options() -> EpisodeOptions {
        EpisodeOptions {
            max_steps: 15,
            sleep_after_execution: 0.0,
            run_args: serde_json::json!({ "model": "test-vl" }),
        }
    }

    const CLICK: &str = "Action: click the icon\n<tool_call>\n{\"name\": \"computer_use\", \"arguments\": {\"action\": \"left_click\", \"coordinate\": [500, 500]}}\n</tool_call>";
    const TERMINATE: &str = "Action: done\n<tool_call>\n{\"name\": \"computer_use\", \"arguments\": {\"action\": \"terminate\", \"status\": \"success\"}}\n</tool_call>";

    #[tokio::test(flavor = "multi_thread")]
    async fn episode_runs_to_completion_and_persists_artifacts() {
        let dir = TempDir::new().unwrap();
        let result_dir = dir.path().join("run");
        let handle = Handle::current();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut env = FakeEnv::new();
            let mut agent = agent_from(vec![CLICK, TERMINATE]);
            let mut task = TaskConfig::from_instruction("t1", "open the settings app");
            task.evaluator = Some(serde_json::json!({"func": "noop"}));
            let cancel = AtomicBool::new(false);
            let mut events = Vec::new();
            let outcome = run_episode(
                &mut env,
                &mut agent,
                &task,
                &result_dir,
                &options(),
                &cancel,
                &handle,
                &mut |ev| events.push(ev),
            )
            .unwrap();
            (outcome, events, result_dir)
        })
        .await
        .unwrap();

        let (outcome, events, result_dir) = outcome;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.score, Some(1.0));
        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.declared_success, Some(true));

        assert!(result_dir.join("task_config.json").exists());
        assert!(result_dir.join("run_args.json").exists());
        assert_eq!(
            std::fs::read_to_string(result_dir.join("result.txt")).unwrap(),
            "1"
        );

        let traj = std::fs::read_to_string(result_dir.join("traj.jsonl")).unwrap();
        let lines: Vec<&str> = traj.lines().collect();
        assert_eq!(lines.len(), 3); // reset + click + terminate
        let reset: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(reset["step_num"], 0);
        assert_eq!(reset["action"], "reset");
        assert_eq!(reset["reward"], 0.0);
        assert_eq!(reset["done"], false);
        assert_eq!(reset["info"], serde_json::json!({}));
        let click: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(click["action"], "click the icon");

        assert!(events
            .iter()
            .any(|e| matches!(e.kind, crate::run::events::RunEventKind::Step)));
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, crate::run::events::RunEventKind::Screenshot)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_evaluator_leaves_run_pending() {
        let dir = TempDir::new().unwrap();
        let result_dir = dir.path().join("run");
        let handle = Handle::current();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut env = FakeEnv::new();
            let mut agent = agent_from(vec![TERMINATE]);
            let task = TaskConfig::from_instruction("t2", "do the thing");
            let cancel = AtomicBool::new(false);
            let outcome = run_episode(
                &mut env,
                &mut agent,
                &task,
                &result_dir,
                &options(),
                &cancel,
                &handle,
                &mut |_| {},
            )
            .unwrap();
            (outcome, result_dir)
        })
        .await
        .unwrap();

        let (outcome, result_dir) = outcome;
        assert_eq!(outcome.status, RunStatus::Pending);
        assert_eq!(
            std::fs::read_to_string(result_dir.join("result.txt")).unwrap(),
            "pending"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preset_cancel_flag_stops_before_the_first_model_call() {
        let dir = TempDir::new().unwrap();
        let result_dir = dir.path().join("run");
        let handle = Handle::current();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut env = FakeEnv::new();
            let mut agent = agent_from(vec![]);
            let task = TaskConfig::from_instruction("t3", "never mind");
            let cancel = AtomicBool::new(true);
            run_episode(
                &mut env,
                &mut agent,
                &task,
                &result_dir,
                &options(),
                &cancel,
                &handle,
                &mut |_| {},
            )
            .unwrap()
        })
        .await
        .unwrap();

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.steps, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_first_turn_is_a_hard_error() {
        let dir = TempDir::new().unwrap();
        let result_dir = dir.path().join("run");
        let handle = Handle::current();

        let err = tokio::task::spawn_blocking(move || {
            let mut env = FakeEnv::new();
            let mut agent = agent_from(vec!["I am not sure what to do."]);
            let task = TaskConfig::from_instruction("t4", "open settings");
            let cancel = AtomicBool::new(false);
            run_episode(
                &mut env,
                &mut agent,
                &task,
                &result_dir,
                &options(),
                &cancel,
                &handle,
                &mut |_| {},
            )
            .unwrap_err()
        })
        .await
        .unwrap();

        assert!(matches!(err, DeskPilotError::Agent(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn error_page_response_aborts_the_episode() {
        let dir = TempDir::new().unwrap();
        let result_dir = dir.path().join("run");
        let handle = Handle::current();

        let err = tokio::task::spawn_blocking(move || {
            let mut env = FakeEnv::new();
            let mut agent = agent_from(vec!["<html><body>503 Service Unavailable</body></html>"]);
            let task = TaskConfig::from_instruction("t5", "open settings");
            let cancel = AtomicBool::new(false);
            run_episode(
                &mut env,
                &mut agent,
                &task,
                &result_dir,
                &options(),
                &cancel,
                &handle,
                &mut |_| {},
            )
            .unwrap_err()
        })
        .await
        .unwrap();

        assert!(matches!(err, DeskPilotError::Provider(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_later_turn_soft_stops() {
        let dir = TempDir::new().unwrap();
        let result_dir = dir.path().join("run");
        let handle = Handle::current();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut env = FakeEnv::new();
            let mut agent = agent_from(vec![CLICK, "Hmm, nothing more to do."]);
            let mut task = TaskConfig::from_instruction("t6", "open settings");
            task.evaluator = Some(serde_json::json!({"func": "noop"}));
            let cancel = AtomicBool::new(false);
            run_episode(
                &mut env,
                &mut agent,
                &task,
                &result_dir,
                &options(),
                &cancel,
                &handle,
                &mut |_| {},
            )
            .unwrap()
        })
        .await
        .unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.steps, 1);
        assert_eq!(outcome.declared_success, None);
    }

    struct RepeatingProvider {
        reply: String,
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl ModelProvider for RepeatingProvider {
        fn name(&self) -> &str {
            "repeating"
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _params: &ModelParams,
        ) -> DeskPilotResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn skill_only_turns_count_against_the_turn_limit() {
        let dir = TempDir::new().unwrap();
        let result_dir = dir.path().join("run");
        let handle = Handle::current();

        // A model stuck asking for skills never produces an action; the turn
        // limit has to end the episode anyway.
        let provider = Arc::new(RepeatingProvider {
            reply: "<skill>export report</skill>".to_string(),
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let provider_ref = provider.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut env = FakeEnv::new();
            let mut agent = ConversationAgent::new(
                provider,
                SkillInjector::new(None),
                ModelParams {
                    model: "test-vl".into(),
                    max_tokens: 2048,
                    temperature: 0.2,
                    top_p: 0.9,
                },
                CoordinateMode::Relative,
                15,
                12,
            );
            let mut task = TaskConfig::from_instruction("t7", "open settings");
            task.evaluator = Some(serde_json::json!({"func": "noop"}));
            let cancel = AtomicBool::new(false);
            let mut opts = options();
            opts.max_steps = 2;
            let mut events = Vec::new();
            let outcome = run_episode(
                &mut env,
                &mut agent,
                &task,
                &result_dir,
                &opts,
                &cancel,
                &handle,
                &mut |ev| events.push(ev),
            )
            .unwrap();
            (outcome, events)
        })
        .await
        .unwrap();

        let (outcome, events) = outcome;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.steps, 0);
        // Each turn makes at most 3 model calls (the inline skill loop guard).
        let calls = provider_ref.calls.load(Ordering::SeqCst);
        assert!(calls <= 6, "expected at most 6 model calls, saw {calls}");
        assert!(events.iter().any(|e| {
            matches!(e.kind, crate::run::events::RunEventKind::Status)
                && e.message.as_deref() == Some("step limit reached, stopping")
        }));
    }
}
