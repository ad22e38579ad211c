pub mod injector;
pub mod store;

pub use injector::{SkillInjector, SkillOutput};
pub use store::{Skill, SkillStore, SkillSummary};
