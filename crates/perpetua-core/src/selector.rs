// Tool selector: bounded, ordered tool subset for one step
//
// Pipeline: candidate set → denylist → allowlist → rules pre-filter →
// retrieval ranking (when over budget) → required-tools union → rules
// post-filter → fallbacks. The result never exceeds max_tools_in_prompt
// and, after the post-filter, contains every surviving required tool.

use std::collections::HashSet;

use perpetua_contracts::SessionState;

use crate::config::{SelectionStrategy, TemplateRuntimeConfig};
use crate::context::SessionContext;
use crate::embeddings::EmbeddingProvider;
use crate::error::{Result, RuntimeError};
use crate::rules::{self, RuleDecision, RulePhase};
use crate::tools::builtin::{FINAL_ANSWER_TOOL, REASONING_TOOL};
use crate::tools::{ResolvedTool, ToolCatalog};

const DEFAULT_MAX_TOOLS: usize = 10;

/// A tool chosen for the current step
pub struct SelectedTool {
    pub tool: ResolvedTool,
    pub required: bool,
}

/// Outcome of a selection: the ordered tools plus any stage transition
/// requested by matching rules
pub struct Selection {
    pub tools: Vec<SelectedTool>,
    pub stage: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolSelector {
    embeddings: EmbeddingProvider,
}

impl ToolSelector {
    pub fn new(embeddings: EmbeddingProvider) -> Self {
        Self { embeddings }
    }

    pub fn select(
        &self,
        catalog: &ToolCatalog,
        config: &TemplateRuntimeConfig,
        context: &SessionContext,
        state: SessionState,
        query: &str,
    ) -> Result<Selection> {
        let policy = &config.tool_policy;
        let max_tools = policy.max_tools_in_prompt.unwrap_or(DEFAULT_MAX_TOOLS);

        let mut required: Vec<String> = policy.required_tools.clone();
        // The reasoning phase depends on its synthetic tool being present
        if config.reasoning_strategy() == crate::config::ReasoningStrategy::ForcedTool
            && !policy.is_denied(REASONING_TOOL)
            && !required.iter().any(|n| n.eq_ignore_ascii_case(REASONING_TOOL))
        {
            required.insert(0, REASONING_TOOL.to_string());
        }

        // Candidate set: version tools ∪ required, intersected with active catalog
        let mut candidates: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for name in config.tools.iter().chain(required.iter()) {
            let lower = name.to_lowercase();
            if seen.insert(lower) && catalog.has(name) {
                candidates.push(name.clone());
            }
        }

        // Denylist, then allowlist (required tools bypass the allowlist)
        candidates.retain(|name| !policy.is_denied(name));
        if !policy.allowlist.is_empty() {
            let allow: HashSet<String> =
                policy.allowlist.iter().map(|n| n.to_lowercase()).collect();
            candidates.retain(|name| {
                allow.contains(&name.to_lowercase()) || is_required(&required, name)
            });
        }

        // Rules pre-filter
        let pre = rules::evaluate(
            &config.rules,
            context,
            state,
            &config.execution_policy,
            RulePhase::PreRetrieval,
        );
        candidates = pre.apply(&candidates);

        // Retrieval ranking when the candidate set exceeds the prompt budget
        let required_present: Vec<String> = required
            .iter()
            .filter(|name| candidates.iter().any(|c| c.eq_ignore_ascii_case(name)))
            .cloned()
            .collect();

        if policy.selection_strategy == SelectionStrategy::Retrieval && candidates.len() > max_tools
        {
            candidates = self.rank_by_retrieval(
                catalog,
                config,
                &candidates,
                &required_present,
                max_tools,
                query,
            );
        }

        // Union required tools at the front, preserving their declared order
        let mut ordered: Vec<String> = Vec::new();
        for name in &required_present {
            if !ordered.iter().any(|o: &String| o.eq_ignore_ascii_case(name)) {
                ordered.push(name.clone());
            }
        }
        for name in &candidates {
            if !is_required(&required, name)
                && !ordered.iter().any(|o| o.eq_ignore_ascii_case(name))
            {
                ordered.push(name.clone());
            }
        }
        ordered.truncate(max_tools);

        // Rules post-filter; a terminal rule may drop previously required tools
        let post = rules::evaluate(
            &config.rules,
            context,
            state,
            &config.execution_policy,
            RulePhase::PostRetrieval,
        );
        ordered = post.apply(&ordered);

        // Fallback chain: required alone, then FinalAnswerTool, else fail
        if ordered.is_empty() {
            ordered = required_present
                .iter()
                .filter(|name| post.allows(name))
                .cloned()
                .collect();
        }
        if ordered.is_empty() && catalog.has(FINAL_ANSWER_TOOL) {
            ordered.push(FINAL_ANSWER_TOOL.to_string());
        }
        if ordered.is_empty() {
            return Err(RuntimeError::EmptySelection);
        }
        ordered.truncate(max_tools);

        let tools = ordered
            .iter()
            .map(|name| {
                catalog.resolve(name).map(|tool| SelectedTool {
                    required: is_required(&required, name),
                    tool,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let stage = post.stage.or(pre.stage);
        Ok(Selection { tools, stage })
    }

    /// Rank non-required candidates by cosine similarity against stored
    /// embeddings, keeping the top (budget − required) entries.
    ///
    /// Ties break by the tool's position in the template version's tool
    /// list, then by name.
    fn rank_by_retrieval(
        &self,
        catalog: &ToolCatalog,
        config: &TemplateRuntimeConfig,
        candidates: &[String],
        required_present: &[String],
        max_tools: usize,
        query: &str,
    ) -> Vec<String> {
        let query_embedding = self.embeddings.embed_text(query);
        let records = catalog.active_records();
        let template_index = |name: &str| {
            config
                .tools
                .iter()
                .position(|t| t.eq_ignore_ascii_case(name))
                .unwrap_or(usize::MAX)
        };

        let mut scored: Vec<(f32, usize, String)> = candidates
            .iter()
            .filter(|name| !is_required(required_present, name))
            .map(|name| {
                let score = records
                    .iter()
                    .find(|r| r.name.eq_ignore_ascii_case(name))
                    .and_then(|r| r.embedding.as_ref())
                    .map(|embedding| query_embedding.similarity(embedding))
                    .unwrap_or(0.0);
                (score, template_index(name), name.clone())
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let budget = max_tools.saturating_sub(required_present.len());
        scored
            .into_iter()
            .take(budget)
            .map(|(_, _, name)| name)
            .collect()
    }
}

fn is_required(required: &[String], name: &str) -> bool {
    required.iter().any(|r| r.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ToolPolicy, ToolQuota};
    use crate::tools::builtin::{builtin_registry, BuiltinDeps};
    use crate::tools::ToolCatalog;
    use chrono::Utc;
    use perpetua_contracts::{Template, TemplateVersion, Tool, ToolCategory};
    use serde_json::json;
    use uuid::Uuid;

    fn tool_record(name: &str, embedding_seed: Option<&str>) -> Tool {
        let embeddings = EmbeddingProvider::default();
        Tool {
            id: Uuid::new_v4(),
            name: name.into(),
            description: Some(format!("{name} description")),
            entrypoint: None,
            config: json!({}),
            embedding: embedding_seed.map(|seed| embeddings.embed_text(seed).vector),
            category: ToolCategory::Utility,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn catalog(records: Vec<Tool>) -> ToolCatalog {
        let catalog = ToolCatalog::new(builtin_registry(BuiltinDeps::default()));
        catalog.refresh(records);
        catalog
    }

    fn config_with(tools: Vec<&str>, policy: ToolPolicy) -> TemplateRuntimeConfig {
        let template = Template {
            id: Uuid::new_v4(),
            name: "test-agent".into(),
            description: None,
            active_version_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let version = TemplateVersion {
            id: Uuid::new_v4(),
            template_id: template.id,
            version: 1,
            settings: json!({}),
            tools: tools.iter().map(|s| s.to_string()).collect(),
            embedding: None,
            is_active: true,
            created_at: Utc::now(),
        };
        let mut config = TemplateRuntimeConfig::from_parts(&template, &version).unwrap();
        config.tool_policy = policy;
        config
    }

    fn names(selection: &Selection) -> Vec<String> {
        selection.tools.iter().map(|t| t.tool.name().to_string()).collect()
    }

    #[test]
    fn static_selection_preserves_template_order() {
        let catalog = catalog(vec![
            tool_record("WebSearchTool", None),
            tool_record("EchoTool", None),
            tool_record("FinalAnswerTool", None),
        ]);
        let config = config_with(
            vec!["WebSearchTool", "EchoTool", "FinalAnswerTool"],
            ToolPolicy::default(),
        );
        let selection = ToolSelector::default()
            .select(
                &catalog,
                &config,
                &SessionContext::default(),
                SessionState::Researching,
                "anything",
            )
            .unwrap();
        assert_eq!(
            names(&selection),
            vec!["WebSearchTool", "EchoTool", "FinalAnswerTool"]
        );
    }

    #[test]
    fn required_tools_lead_the_ordering() {
        let catalog = catalog(vec![
            tool_record("WebSearchTool", None),
            tool_record("FinalAnswerTool", None),
        ]);
        let config = config_with(
            vec!["WebSearchTool", "FinalAnswerTool"],
            ToolPolicy {
                required_tools: vec!["FinalAnswerTool".into()],
                ..Default::default()
            },
        );
        let selection = ToolSelector::default()
            .select(
                &catalog,
                &config,
                &SessionContext::default(),
                SessionState::Researching,
                "anything",
            )
            .unwrap();
        assert_eq!(names(&selection), vec!["FinalAnswerTool", "WebSearchTool"]);
        assert!(selection.tools[0].required);
    }

    #[test]
    fn denylist_removes_and_allowlist_restricts() {
        let catalog = catalog(vec![
            tool_record("WebSearchTool", None),
            tool_record("EchoTool", None),
            tool_record("ExtractPageContentTool", None),
        ]);
        let config = config_with(
            vec!["WebSearchTool", "EchoTool", "ExtractPageContentTool"],
            ToolPolicy {
                allowlist: vec!["WebSearchTool".into(), "EchoTool".into()],
                denylist: vec!["echotool".into()],
                ..Default::default()
            },
        );
        let selection = ToolSelector::default()
            .select(
                &catalog,
                &config,
                &SessionContext::default(),
                SessionState::Researching,
                "anything",
            )
            .unwrap();
        assert_eq!(names(&selection), vec!["WebSearchTool"]);
    }

    #[test]
    fn selection_respects_prompt_budget() {
        let catalog = catalog(vec![
            tool_record("WebSearchTool", Some("search the web")),
            tool_record("ExtractPageContentTool", Some("extract page content")),
            tool_record("EchoTool", Some("echo a message")),
            tool_record("FinalAnswerTool", Some("final answer")),
        ]);
        let config = config_with(
            vec![
                "WebSearchTool",
                "ExtractPageContentTool",
                "EchoTool",
                "FinalAnswerTool",
            ],
            ToolPolicy {
                required_tools: vec!["FinalAnswerTool".into()],
                max_tools_in_prompt: Some(2),
                selection_strategy: SelectionStrategy::Retrieval,
                quotas: std::collections::HashMap::from([(
                    "_default".to_string(),
                    ToolQuota::default(),
                )]),
                ..Default::default()
            },
        );
        let selection = ToolSelector::default()
            .select(
                &catalog,
                &config,
                &SessionContext::default(),
                SessionState::Researching,
                "search the web",
            )
            .unwrap();
        let selected = names(&selection);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0], "FinalAnswerTool");
        assert_eq!(selected[1], "WebSearchTool");
    }

    #[test]
    fn keep_only_rule_overrides_retrieval() {
        let catalog = catalog(vec![
            tool_record("WebSearchTool", None),
            tool_record("EchoTool", None),
            tool_record("FinalAnswerTool", None),
        ]);
        let mut config = config_with(
            vec!["WebSearchTool", "EchoTool", "FinalAnswerTool"],
            ToolPolicy {
                required_tools: vec!["WebSearchTool".into()],
                ..Default::default()
            },
        );
        config.rules = vec![serde_json::from_value(json!({
            "apply_to": ["post_retrieval"],
            "when": {"iteration_gte": 15},
            "actions": {"keep_only": ["FinalAnswerTool"]}
        }))
        .unwrap()];

        let mut context = SessionContext::default();
        context.iteration = 15;
        let selection = ToolSelector::default()
            .select(
                &catalog,
                &config,
                &context,
                SessionState::Researching,
                "anything",
            )
            .unwrap();
        // The post-filter drops even the required WebSearchTool
        assert_eq!(names(&selection), vec!["FinalAnswerTool"]);
    }

    #[test]
    fn empty_selection_falls_back_to_final_answer() {
        let catalog = catalog(vec![
            tool_record("WebSearchTool", None),
            tool_record("FinalAnswerTool", None),
        ]);
        let config = config_with(
            vec!["WebSearchTool"],
            ToolPolicy {
                denylist: vec!["WebSearchTool".into()],
                ..Default::default()
            },
        );
        let selection = ToolSelector::default()
            .select(
                &catalog,
                &config,
                &SessionContext::default(),
                SessionState::Researching,
                "anything",
            )
            .unwrap();
        assert_eq!(names(&selection), vec!["FinalAnswerTool"]);
    }

    #[test]
    fn no_usable_tools_is_an_error() {
        let catalog = catalog(vec![tool_record("WebSearchTool", None)]);
        let config = config_with(
            vec!["WebSearchTool"],
            ToolPolicy {
                denylist: vec!["WebSearchTool".into()],
                ..Default::default()
            },
        );
        let result = ToolSelector::default().select(
            &catalog,
            &config,
            &SessionContext::default(),
            SessionState::Researching,
            "anything",
        );
        assert!(matches!(result, Err(RuntimeError::EmptySelection)));
    }

    #[test]
    fn inactive_tools_never_selected() {
        let mut inactive = tool_record("WebSearchTool", None);
        inactive.is_active = false;
        let catalog = catalog(vec![inactive, tool_record("FinalAnswerTool", None)]);
        let config = config_with(
            vec!["WebSearchTool", "FinalAnswerTool"],
            ToolPolicy::default(),
        );
        let selection = ToolSelector::default()
            .select(
                &catalog,
                &config,
                &SessionContext::default(),
                SessionState::Researching,
                "anything",
            )
            .unwrap();
        assert_eq!(names(&selection), vec!["FinalAnswerTool"]);
    }
}
