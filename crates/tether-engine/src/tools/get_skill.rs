use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use tether_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use crate::skills::{Skill, SkillLoader};

/// Loads the full body of a skill on demand.
pub struct GetSkillTool {
    skills: Arc<SkillLoader>,
}

impl GetSkillTool {
    pub fn new(skills: Arc<SkillLoader>) -> Self {
        Self { skills }
    }
}

fn format_skill(skill: &Skill) -> String {
    format!(
        "# Skill: {}\n\n{}\n\n---\n\n{}",
        skill.name, skill.description, skill.content
    )
}

#[async_trait]
impl Tool for GetSkillTool {
    fn name(&self) -> &str {
        "get_skill"
    }

    fn description(&self) -> &str {
        "Get complete content and guidance for a specified skill, used for executing specific types of tasks"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skill_name": {
                    "type": "string",
                    "description": "Name of skill to retrieve"
                }
            },
            "required": ["skill_name"]
        })
    }

    async fn execute(
        &self,
        args: Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let Some(name) = args
            .get("skill_name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            return Ok(ToolResult::failure("Missing required parameter: skill_name"));
        };

        match self.skills.get(name) {
            Some(skill) => Ok(ToolResult::success(format_skill(skill))),
            None => Ok(ToolResult::failure(format!(
                "Skill '{name}' does not exist. Available skills: {}",
                self.skills.names().join(", ")
            ))),
        }
    }
}
