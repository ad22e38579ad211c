pub mod agent;
pub mod config;
pub mod episode;
pub mod errors;
pub mod llm;
pub mod run;
pub mod skills;

pub use agent::{ActionCommand, ConversationAgent, Prediction};
pub use config::{load_config, save_config, AppConfig};
pub use episode::{Environment, Observation, TaskConfig};
pub use errors::{DeskPilotError, DeskPilotResult};
pub use run::{RunEvent, RunManager, RunStatus, StartRequest};
pub use skills::{SkillInjector, SkillStore};

/// Loads `.env` and installs the global tracing subscriber. `RUST_LOG`
/// controls verbosity, defaulting to info for this crate.
pub fn init_tracing() {
    dotenvy::dotenv().ok();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("deskpilot=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
