pub mod engine;
pub mod image;
pub mod parser;
pub mod prompt;

pub use engine::{ConversationAgent, Prediction};
pub use parser::ActionCommand;
