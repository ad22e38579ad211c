pub mod events;
pub mod manager;

pub use events::{Asset, RunEvent, RunEventKind, RunStatus};
pub use manager::{EnvFactory, RunHandle, RunManager, RunSummary, StartRequest};
