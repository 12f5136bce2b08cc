use std::path::Path;

use tracing::{debug, warn};

use crate::skills::SkillLoader;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are Tether, an intelligent assistant that can help users complete various tasks.";

/// System prompt from `path` (or the built-in default), followed by the
/// skills section when any skills are loaded.
pub fn build_system_prompt(path: &Path, skills: &SkillLoader) -> String {
    let base = match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => {
            debug!(path = %path.display(), "loaded system prompt");
            text.trim_end().to_string()
        }
        Ok(_) => DEFAULT_SYSTEM_PROMPT.to_string(),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to read system prompt");
            }
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    };

    let skills_prompt = skills.metadata_prompt();
    if skills_prompt.is_empty() {
        base
    } else {
        format!("{base}\n\n{skills_prompt}")
    }
}
