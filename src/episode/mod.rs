pub mod environment;
pub mod runner;
pub mod trajectory;

pub use environment::{Environment, Observation, StepOutcome, TaskConfig};
pub use runner::{run_episode, EpisodeOptions, RunOutcome};
