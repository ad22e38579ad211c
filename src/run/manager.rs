use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};

use crate::agent::engine::ConversationAgent;
use crate::config::AppConfig;
use crate::episode::environment::{Environment, TaskConfig};
use crate::episode::runner::{run_episode, EpisodeOptions};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::llm::registry::ProviderRegistry;
use crate::llm::types::ModelParams;
use crate::run::events::{RunEvent, RunEventKind, RunStatus};
use crate::skills::{SkillInjector, SkillStore};

/// Finished runs stay queryable for this long before eviction.
const RETENTION_SECS: u64 = 300;
/// Oldest events drop out once a run's history grows past this.
const RUN_HISTORY_LIMIT: usize = 200;
/// Live fan-out buffer per run; slow subscribers skip, they never block.
const LIVE_CHANNEL_CAPACITY: usize = 256;

pub type EnvFactory = Arc<dyn Fn() -> DeskPilotResult<Box<dyn Environment>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: String,
    pub instruction: String,
    /// Defaults to `prompt_<timestamp>` when absent.
    pub task_id: Option<String>,
    pub evaluator: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunHandle {
    pub run_id: String,
    pub session_id: String,
    pub instruction: String,
    pub task_id: String,
    pub result_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub session_id: String,
    pub task_id: String,
    pub status: RunStatus,
    pub result_dir: PathBuf,
    pub created_at: String,
    pub completed_at: Option<String>,
}

struct RunEntry {
    session_id: String,
    task_id: String,
    result_dir: PathBuf,
    status: RunStatus,
    history: Vec<RunEvent>,
    live: broadcast::Sender<RunEvent>,
    cancel: Arc<AtomicBool>,
    created_at: String,
    completed_at: Option<String>,
}

#[derive(Default)]
struct ManagerState {
    runs: HashMap<String, RunEntry>,
    active_run_id: Option<String>,
}

/// Owns run lifecycles: one active episode at a time, per-run event history
/// with live fan-out, cancellation, and delayed eviction of finished runs.
pub struct RunManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: AppConfig,
    registry: ProviderRegistry,
    skills: Arc<SkillStore>,
    env_factory: EnvFactory,
    state: Mutex<ManagerState>,
}

impl Clone for RunManager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RunManager {
    pub fn new(
        config: AppConfig,
        registry: ProviderRegistry,
        skills: Arc<SkillStore>,
        env_factory: EnvFactory,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                skills,
                env_factory,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Launches an episode on a blocking worker. Fails with `Conflict` while
    /// another run is active.
    pub fn start(&self, request: StartRequest) -> DeskPilotResult<RunHandle> {
        let instruction = request.instruction.trim().to_string();
        if instruction.is_empty() {
            return Err(DeskPilotError::Agent("instruction must not be empty".into()));
        }

        let provider = self.inner.registry.get_active()?;
        let active_id = &self.inner.config.llm.active_provider;
        let entry = self
            .inner
            .config
            .llm
            .providers
            .get(active_id)
            .ok_or_else(|| {
                DeskPilotError::Config(format!("active provider '{active_id}' missing from config"))
            })?;
        let model = entry.model.clone();

        let run_id = uuid::Uuid::new_v4().to_string();
        let task_id = request
            .task_id
            .unwrap_or_else(|| format!("prompt_{}", chrono::Local::now().format("%Y%m%d_%H%M%S")));
        let result_dir = self
            .inner
            .config
            .paths
            .results_dir
            .join(&model)
            .join(&task_id);

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.inner.state.lock().expect("manager state poisoned");
            if state.active_run_id.is_some() {
                return Err(DeskPilotError::Conflict(
                    "another run is already in progress".into(),
                ));
            }
            let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
            state.runs.insert(
                run_id.clone(),
                RunEntry {
                    session_id: request.session_id.clone(),
                    task_id: task_id.clone(),
                    result_dir: result_dir.clone(),
                    status: RunStatus::Running,
                    history: Vec::new(),
                    live,
                    cancel: Arc::clone(&cancel),
                    created_at: chrono::Local::now().to_rfc3339(),
                    completed_at: None,
                },
            );
            state.active_run_id = Some(run_id.clone());
        }
        self.record_event(&run_id, RunEvent::start(&instruction));
        tracing::info!(%run_id, %task_id, %model, "run started");

        let agent_cfg = &self.inner.config.agent;
        let params = ModelParams {
            model: model.clone(),
            max_tokens: agent_cfg.max_tokens,
            temperature: agent_cfg.temperature,
            top_p: agent_cfg.top_p,
        };
        let mut task = TaskConfig::from_instruction(&task_id, &instruction);
        task.evaluator = request.evaluator;
        let options = EpisodeOptions {
            max_steps: agent_cfg.max_steps,
            sleep_after_execution: agent_cfg.sleep_after_execution,
            run_args: serde_json::json!({
                "run_id": run_id,
                "provider": active_id,
                "model": model,
                "max_steps": agent_cfg.max_steps,
                "coordinate_mode": agent_cfg.coordinate_mode,
            }),
        };
        let mut agent = ConversationAgent::new(
            provider,
            SkillInjector::new(Some(Arc::clone(&self.inner.skills))),
            params,
            agent_cfg.coordinate_mode,
            agent_cfg.max_steps,
            agent_cfg.max_history_messages,
        );

        let manager = self.clone();
        let worker_run_id = run_id.clone();
        let worker_dir = result_dir.clone();
        let env_factory = Arc::clone(&self.inner.env_factory);
        let worker_cancel = Arc::clone(&cancel);
        let handle = Handle::current();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<RunEvent>();

        let worker = tokio::task::spawn_blocking(move || {
            let mut env = env_factory()?;
            let outcome = run_episode(
                env.as_mut(),
                &mut agent,
                &task,
                &worker_dir,
                &options,
                &worker_cancel,
                &handle,
                &mut |ev| {
                    let _ = event_tx.send(ev);
                },
            );
            if let Err(err) = env.close() {
                tracing::warn!(error = %err, "environment close failed");
            }
            outcome
        });

        tokio::spawn(async move {
            while let Some(ev) = event_rx.recv().await {
                manager.record_event(&worker_run_id, ev);
            }
            let final_event = match worker.await {
                Ok(Ok(outcome)) => {
                    let message = match outcome.declared_success {
                        Some(true) => "model declared the task complete".to_string(),
                        Some(false) => "model declared the task failed".to_string(),
                        None => "episode finished".to_string(),
                    };
                    RunEvent::complete(outcome.status, outcome.score, message)
                }
                Ok(Err(err)) => {
                    tracing::error!(run_id = %worker_run_id, error = %err, "run failed");
                    RunEvent::error(err.to_string())
                }
                Err(join_err) => {
                    tracing::error!(run_id = %worker_run_id, error = %join_err, "run worker panicked");
                    RunEvent::error("run worker panicked".to_string())
                }
            };
            manager.record_event(&worker_run_id, final_event);

            tokio::time::sleep(Duration::from_secs(RETENTION_SECS)).await;
            manager.evict(&worker_run_id);
        });

        Ok(RunHandle {
            run_id,
            session_id: request.session_id,
            instruction,
            task_id,
            result_dir,
        })
    }

    /// Replays the run's history then follows live events until a terminal
    /// event is delivered.
    pub fn stream_events(
        &self,
        run_id: &str,
    ) -> DeskPilotResult<mpsc::UnboundedReceiver<RunEvent>> {
        let (snapshot, live_rx) = {
            let state = self.inner.state.lock().expect("manager state poisoned");
            let entry = state
                .runs
                .get(run_id)
                .ok_or_else(|| DeskPilotError::NotFound(format!("run '{run_id}' not found")))?;
            // Snapshot and subscription happen under one lock so no event is
            // missed or duplicated between the two.
            (entry.history.clone(), entry.live.subscribe())
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut done = false;
            for ev in snapshot {
                let terminal = is_terminal_event(&ev);
                if tx.send(ev).is_err() {
                    return;
                }
                if terminal {
                    done = true;
                }
            }
            if done {
                return;
            }
            let mut live_rx = live_rx;
            loop {
                match live_rx.recv().await {
                    Ok(ev) => {
                        let terminal = is_terminal_event(&ev);
                        if tx.send(ev).is_err() || terminal {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }

    /// Requests cancellation. Returns false for unknown or already-finished
    /// runs. The status flips to cancelled right away; the worker notices the
    /// flag at its next checkpoint and winds down.
    pub fn cancel(&self, run_id: &str) -> bool {
        {
            let state = self.inner.state.lock().expect("manager state poisoned");
            match state.runs.get(run_id) {
                Some(entry) if entry.status == RunStatus::Running => {
                    entry.cancel.store(true, Ordering::SeqCst);
                }
                _ => return false,
            }
        }
        tracing::info!(%run_id, "cancellation requested");
        let mut event = RunEvent::status("cancellation requested");
        event.status = Some(RunStatus::Cancelled);
        self.record_event(run_id, event);
        true
    }

    pub fn summary(&self, run_id: &str) -> Option<RunSummary> {
        let state = self.inner.state.lock().expect("manager state poisoned");
        state
            .runs
            .get(run_id)
            .map(|entry| summarize(run_id, entry))
    }

    pub fn list_runs(&self) -> Vec<RunSummary> {
        let state = self.inner.state.lock().expect("manager state poisoned");
        state
            .runs
            .iter()
            .map(|(run_id, entry)| summarize(run_id, entry))
            .collect()
    }

    /// Stamps run identity onto the event, appends it to history, updates the
    /// run status and fans it out to live subscribers.
    fn record_event(&self, run_id: &str, mut event: RunEvent) {
        let mut state = self.inner.state.lock().expect("manager state poisoned");
        let Some(entry) = state.runs.get_mut(run_id) else {
            return;
        };
        event.run_id = Some(run_id.to_string());
        event.task_id = Some(entry.task_id.clone());
        event.result_dir = Some(entry.result_dir.to_string_lossy().into_owned());
        event.timestamp = Some(chrono::Local::now().to_rfc3339());

        if let Some(status) = event.status {
            // A cancelled run stays cancelled even when the worker's final
            // report lands afterwards.
            if entry.status != RunStatus::Cancelled || status == RunStatus::Error {
                entry.status = status;
            }
        }
        let finished = entry.status.is_terminal();
        if finished && entry.completed_at.is_none() {
            entry.completed_at = Some(chrono::Local::now().to_rfc3339());
        }

        entry.history.push(event.clone());
        if entry.history.len() > RUN_HISTORY_LIMIT {
            entry.history.remove(0);
        }
        let _ = entry.live.send(event);

        if finished && state.active_run_id.as_deref() == Some(run_id) {
            state.active_run_id = None;
        }
    }

    fn evict(&self, run_id: &str) {
        let mut state = self.inner.state.lock().expect("manager state poisoned");
        if let Some(entry) = state.runs.get(run_id) {
            // Never evict a run that is somehow still going.
            if entry.status == RunStatus::Running {
                return;
            }
        }
        state.runs.remove(run_id);
        tracing::debug!(%run_id, "run evicted from history");
    }
}

/// Complete and error events are the stream sentinels; no event follows them.
fn is_terminal_event(event: &RunEvent) -> bool {
    matches!(event.kind, RunEventKind::Complete | RunEventKind::Error)
}

fn summarize(run_id: &str, entry: &RunEntry) -> RunSummary {
    RunSummary {
        run_id: run_id.to_string(),
        session_id: entry.session_id.clone(),
        task_id: entry.task_id.clone(),
        status: entry.status,
        result_dir: entry.result_dir.clone(),
        created_at: entry.created_at.clone(),
        completed_at: entry.completed_at.clone(),
    }
}
