pub mod get_skill;

use std::sync::Arc;

use crate::registry::ToolRegistry;
use crate::skills::SkillLoader;

/// Registry with every built-in tool.
pub fn create_default_registry(skills: Arc<SkillLoader>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(get_skill::GetSkillTool::new(skills)));
    registry
}
