// Prompt defaults and placeholder rendering
//
// Three prompt slots exist: the system prompt, the wrapper for the user's
// first message, and the wrapper for clarification answers. Admin-editable
// rows in `system_prompts` override the compiled-in defaults; template
// version overrides win over both. Once captured into a session the prompts
// are immutable for its lifetime.

use chrono::Utc;

use perpetua_contracts::SystemPrompt;

use crate::config::PromptOverrides;

pub const PROMPT_ID_SYSTEM: &str = "system";
pub const PROMPT_ID_INITIAL_USER: &str = "initial_user";
pub const PROMPT_ID_CLARIFICATION: &str = "clarification";

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
<MAIN_TASK_GUIDELINES>
You are an expert assistant with adaptive planning and schema-guided-reasoning capabilities.
You receive tasks from users and need to understand the requirements, determine the appropriate approach, and deliver accurate results.
</MAIN_TASK_GUIDELINES>

<DATE_GUIDELINES>
Current Date: {current_date} (Year-Month-Day ISO format: YYYY-MM-DD HH:MM:SS)
PAY ATTENTION TO THE DATE when answering questions about current events or time-sensitive information.
</DATE_GUIDELINES>

<LANGUAGE_GUIDELINES>
Detect the language from user request and use this LANGUAGE for all responses and outputs.
Always respond in the SAME LANGUAGE as the user's request.
</LANGUAGE_GUIDELINES>

<CORE_PRINCIPLES>
1. Assess task complexity: For simple questions, provide direct answers. For complex tasks, create a plan and follow it.
2. Adapt your plan when new data contradicts initial assumptions.
3. Use available tools to gather information and complete tasks.
</CORE_PRINCIPLES>

<AVAILABLE_TOOLS>
{available_tools}
</AVAILABLE_TOOLS>

<TOOL_USAGE_GUIDELINES>
- Use ReasoningTool before other tools to plan your approach
- Use WebSearchTool for current information and facts
- Use ExtractPageContentTool to get full content from URLs found in search
- Use ClarificationTool when the request is ambiguous
- Use FinalAnswerTool to complete the task with your findings
</TOOL_USAGE_GUIDELINES>
";

pub const DEFAULT_INITIAL_USER_REQUEST: &str = "\
Current Date: {current_date} (Year-Month-Day ISO format: YYYY-MM-DD HH:MM:SS)

USER REQUEST:

{task}
";

pub const DEFAULT_CLARIFICATION_RESPONSE: &str = "\
Current Date: {current_date} (Year-Month-Day ISO format: YYYY-MM-DD HH:MM:SS)

USER CLARIFICATION:

{clarifications}

Please continue with your task using this additional information.
";

/// Resolved prompt set for one session
#[derive(Debug, Clone, PartialEq)]
pub struct PromptsConfig {
    pub system_prompt: String,
    pub initial_user_request: String,
    pub clarification_response: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            initial_user_request: DEFAULT_INITIAL_USER_REQUEST.to_string(),
            clarification_response: DEFAULT_CLARIFICATION_RESPONSE.to_string(),
        }
    }
}

impl PromptsConfig {
    /// Layer system-wide rows, then template overrides, over the defaults
    pub fn resolve(defaults: &[SystemPrompt], overrides: &PromptOverrides) -> Self {
        let mut config = Self::default();
        for row in defaults.iter().filter(|p| p.is_active) {
            match row.id.as_str() {
                PROMPT_ID_SYSTEM => config.system_prompt = row.content.clone(),
                PROMPT_ID_INITIAL_USER => config.initial_user_request = row.content.clone(),
                PROMPT_ID_CLARIFICATION => config.clarification_response = row.content.clone(),
                _ => {}
            }
        }
        if let Some(system) = &overrides.system {
            config.system_prompt = system.clone();
        }
        if let Some(initial) = &overrides.initial_user {
            config.initial_user_request = initial.clone();
        }
        if let Some(clarification) = &overrides.clarification {
            config.clarification_response = clarification.clone();
        }
        config
    }

    pub fn render_system(&self, tool_descriptions: &[String]) -> String {
        self.system_prompt
            .replace("{available_tools}", &render_tools(tool_descriptions))
            .replace("{current_date}", &current_datetime())
    }

    pub fn render_initial_user(&self, task: &str) -> String {
        self.initial_user_request
            .replace("{task}", task)
            .replace("{current_date}", &current_datetime())
    }

    pub fn render_clarification(&self, clarifications: &str) -> String {
        self.clarification_response
            .replace("{clarifications}", clarifications)
            .replace("{current_date}", &current_datetime())
    }
}

fn render_tools(tool_descriptions: &[String]) -> String {
    if tool_descriptions.is_empty() {
        return "No tools configured.".to_string();
    }
    tool_descriptions
        .iter()
        .enumerate()
        .map(|(i, desc)| format!("{}. {}", i + 1, desc))
        .collect::<Vec<_>>()
        .join("\n")
}

fn current_datetime() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn prompt_row(id: &str, content: &str, active: bool) -> SystemPrompt {
        SystemPrompt {
            id: id.into(),
            name: id.into(),
            description: None,
            content: content.into(),
            placeholders: vec![],
            is_active: active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn system_render_expands_tools_and_date() {
        let config = PromptsConfig::default();
        let rendered = config.render_system(&[
            "WebSearchTool: search the web".into(),
            "FinalAnswerTool: finish".into(),
        ]);
        assert!(rendered.contains("1. WebSearchTool: search the web"));
        assert!(rendered.contains("2. FinalAnswerTool: finish"));
        assert!(!rendered.contains("{available_tools}"));
        assert!(!rendered.contains("{current_date}"));
    }

    #[test]
    fn empty_tool_list_renders_placeholder_text() {
        let config = PromptsConfig::default();
        assert!(config.render_system(&[]).contains("No tools configured."));
    }

    #[test]
    fn overrides_win_over_db_defaults() {
        let rows = vec![prompt_row("system", "db prompt {available_tools}", true)];
        let overrides = PromptOverrides {
            system: Some("template prompt {available_tools}".into()),
            ..Default::default()
        };
        let config = PromptsConfig::resolve(&rows, &overrides);
        assert!(config.system_prompt.starts_with("template prompt"));
    }

    #[test]
    fn inactive_db_rows_are_skipped() {
        let rows = vec![prompt_row("system", "disabled prompt", false)];
        let config = PromptsConfig::resolve(&rows, &PromptOverrides::default());
        assert_eq!(config.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn clarification_render_substitutes_answers() {
        let config = PromptsConfig::default();
        let rendered = config.render_clarification("the attached PDF");
        assert!(rendered.contains("the attached PDF"));
    }
}
