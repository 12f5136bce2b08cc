pub mod error;
pub mod prompt;
pub mod registry;
pub mod runner;
pub mod skills;
pub mod tools;

pub use error::EngineError;
pub use prompt::{build_system_prompt, DEFAULT_SYSTEM_PROMPT};
pub use registry::ToolRegistry;
pub use runner::{Agent, AgentConfig, TurnOutcome, FALLBACK_REPLY};
pub use skills::{Skill, SkillLoader};
pub use tools::create_default_registry;
