pub mod provider;
pub mod providers;
pub mod registry;
pub mod sse;
pub mod types;
