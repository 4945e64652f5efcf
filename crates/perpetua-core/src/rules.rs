// Rules engine: declarative filters over the candidate tool set
//
// Rules live in template settings:
//
// {
//   "apply_to": ["pre_retrieval", "post_retrieval"],
//   "when": {"iteration_gte": "max_iterations", "searches_used_gte": 2},
//   "actions": {"exclude": ["WebSearchTool"], "keep_only": ["FinalAnswerTool"],
//               "set_stage": "finalization"}
// }
//
// Thresholds are numeric or string references into the execution policy
// (e.g. "max_iterations"). Evaluation is a pure function of the session
// counters; rules compose in declaration order.

use serde::{Deserialize, Serialize};

use perpetua_contracts::SessionState;

use crate::config::ExecutionPolicy;
use crate::context::SessionContext;

/// Phase at which a rule applies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RulePhase {
    PreRetrieval,
    PostRetrieval,
}

/// Numeric threshold or a named reference into the execution policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Threshold {
    Count(i64),
    Reference(String),
}

impl Threshold {
    fn resolve(&self, policy: &ExecutionPolicy) -> Option<i64> {
        match self {
            Threshold::Count(n) => Some(*n),
            Threshold::Reference(name) => policy.threshold_field(name),
        }
    }
}

/// Conjunctive conditions; unspecified conditions trivially hold
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleCondition {
    pub iteration_gte: Option<Threshold>,
    pub searches_used_gte: Option<Threshold>,
    pub clarifications_used_gte: Option<Threshold>,
    pub state_equals: Option<String>,
}

impl RuleCondition {
    pub fn matches(
        &self,
        context: &SessionContext,
        state: SessionState,
        policy: &ExecutionPolicy,
    ) -> bool {
        let meets = |threshold: &Option<Threshold>, current: i64| -> bool {
            match threshold {
                None => true,
                // Unresolvable references never match
                Some(t) => t.resolve(policy).is_some_and(|target| current >= target),
            }
        };

        meets(&self.iteration_gte, context.iteration as i64)
            && meets(&self.searches_used_gte, context.searches_used as i64)
            && meets(
                &self.clarifications_used_gte,
                context.clarifications_used as i64,
            )
            && self
                .state_equals
                .as_deref()
                .map_or(true, |expected| expected == state.as_str())
    }
}

/// Actions supported by the rules engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleAction {
    pub exclude: Vec<String>,
    pub keep_only: Vec<String>,
    pub set_stage: Option<String>,
}

/// A single rule: phases + conditions + actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default = "default_phases")]
    pub apply_to: Vec<RulePhase>,
    #[serde(default)]
    pub when: RuleCondition,
    #[serde(default)]
    pub actions: RuleAction,
}

fn default_phases() -> Vec<RulePhase> {
    vec![RulePhase::PreRetrieval, RulePhase::PostRetrieval]
}

/// Composed outcome of evaluating all matching rules
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleDecision {
    pub exclude: Vec<String>,
    pub keep_only: Option<Vec<String>>,
    pub stage: Option<String>,
}

impl RuleDecision {
    /// Fold one rule's actions into the decision; `keep_only` intersects
    fn apply_actions(&mut self, actions: &RuleAction) {
        for name in &actions.exclude {
            let lower = name.to_lowercase();
            if !self.exclude.iter().any(|n| n.to_lowercase() == lower) {
                self.exclude.push(name.clone());
            }
        }
        if !actions.keep_only.is_empty() {
            self.keep_only = Some(match self.keep_only.take() {
                None => actions.keep_only.clone(),
                Some(existing) => {
                    let incoming: Vec<String> =
                        actions.keep_only.iter().map(|n| n.to_lowercase()).collect();
                    existing
                        .into_iter()
                        .filter(|n| incoming.contains(&n.to_lowercase()))
                        .collect()
                }
            });
        }
        if let Some(stage) = &actions.set_stage {
            self.stage = Some(stage.clone());
        }
    }

    /// Filter an ordered list of tool names, preserving order
    ///
    /// `keep_only` takes precedence over `exclude` within the same decision.
    pub fn apply(&self, names: &[String]) -> Vec<String> {
        let exclude: Vec<String> = self.exclude.iter().map(|n| n.to_lowercase()).collect();
        let keep: Option<Vec<String>> = self
            .keep_only
            .as_ref()
            .map(|k| k.iter().map(|n| n.to_lowercase()).collect());

        names
            .iter()
            .filter(|name| {
                let lower = name.to_lowercase();
                if let Some(keep) = &keep {
                    return keep.contains(&lower);
                }
                !exclude.contains(&lower)
            })
            .cloned()
            .collect()
    }

    pub fn allows(&self, name: &str) -> bool {
        !self.apply(std::slice::from_ref(&name.to_string())).is_empty()
    }
}

/// Evaluate all rules for a phase against the session counters
pub fn evaluate(
    rules: &[Rule],
    context: &SessionContext,
    state: SessionState,
    policy: &ExecutionPolicy,
    phase: RulePhase,
) -> RuleDecision {
    let mut decision = RuleDecision::default();
    for rule in rules {
        if !rule.apply_to.contains(&phase) {
            continue;
        }
        if rule.when.matches(context, state, policy) {
            decision.apply_actions(&rule.actions);
        }
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn rule(raw: serde_json::Value) -> Rule {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn unconditional_rule_applies() {
        let rules = vec![rule(json!({"actions": {"exclude": ["EchoTool"]}}))];
        let decision = evaluate(
            &rules,
            &SessionContext::default(),
            SessionState::Researching,
            &ExecutionPolicy::default(),
            RulePhase::PreRetrieval,
        );
        let filtered = decision.apply(&names(&["EchoTool", "WebSearchTool"]));
        assert_eq!(filtered, names(&["WebSearchTool"]));
    }

    #[test]
    fn iteration_threshold_gates_keep_only() {
        let rules = vec![rule(json!({
            "when": {"iteration_gte": 15},
            "actions": {"keep_only": ["FinalAnswerTool", "CreateReportTool"]}
        }))];
        let mut context = SessionContext::default();

        let early = evaluate(
            &rules,
            &context,
            SessionState::Researching,
            &ExecutionPolicy::default(),
            RulePhase::PostRetrieval,
        );
        assert!(early.keep_only.is_none());

        context.iteration = 15;
        let late = evaluate(
            &rules,
            &context,
            SessionState::Researching,
            &ExecutionPolicy::default(),
            RulePhase::PostRetrieval,
        );
        let filtered = late.apply(&names(&["WebSearchTool", "FinalAnswerTool", "CreateReportTool"]));
        assert_eq!(filtered, names(&["FinalAnswerTool", "CreateReportTool"]));
    }

    #[test]
    fn string_threshold_resolves_against_execution_policy() {
        let rules = vec![rule(json!({
            "when": {"iteration_gte": "max_iterations"},
            "actions": {"set_stage": "finalization"}
        }))];
        let mut context = SessionContext::default();
        context.iteration = 15;
        let decision = evaluate(
            &rules,
            &context,
            SessionState::Researching,
            &ExecutionPolicy::default(),
            RulePhase::PreRetrieval,
        );
        assert_eq!(decision.stage.as_deref(), Some("finalization"));
    }

    #[test]
    fn unresolvable_reference_never_matches() {
        let rules = vec![rule(json!({
            "when": {"iteration_gte": "no_such_field"},
            "actions": {"exclude": ["WebSearchTool"]}
        }))];
        let mut context = SessionContext::default();
        context.iteration = 100;
        let decision = evaluate(
            &rules,
            &context,
            SessionState::Researching,
            &ExecutionPolicy::default(),
            RulePhase::PreRetrieval,
        );
        assert!(decision.exclude.is_empty());
    }

    #[test]
    fn keep_only_intersects_across_rules() {
        let rules = vec![
            rule(json!({"actions": {"keep_only": ["A", "B", "C"]}})),
            rule(json!({"actions": {"keep_only": ["B", "C", "D"]}})),
        ];
        let decision = evaluate(
            &rules,
            &SessionContext::default(),
            SessionState::Researching,
            &ExecutionPolicy::default(),
            RulePhase::PreRetrieval,
        );
        let filtered = decision.apply(&names(&["A", "B", "C", "D"]));
        assert_eq!(filtered, names(&["B", "C"]));
    }

    #[test]
    fn phase_mismatch_skips_rule() {
        let rules = vec![rule(json!({
            "apply_to": ["post_retrieval"],
            "actions": {"exclude": ["WebSearchTool"]}
        }))];
        let decision = evaluate(
            &rules,
            &SessionContext::default(),
            SessionState::Researching,
            &ExecutionPolicy::default(),
            RulePhase::PreRetrieval,
        );
        assert!(decision.exclude.is_empty());
    }

    #[test]
    fn state_condition_matches_wire_form() {
        let rules = vec![rule(json!({
            "when": {"state_equals": "RESEARCHING"},
            "actions": {"exclude": ["EchoTool"]}
        }))];
        let hit = evaluate(
            &rules,
            &SessionContext::default(),
            SessionState::Researching,
            &ExecutionPolicy::default(),
            RulePhase::PreRetrieval,
        );
        assert_eq!(hit.exclude, names(&["EchoTool"]));

        let miss = evaluate(
            &rules,
            &SessionContext::default(),
            SessionState::WaitingForClarification,
            &ExecutionPolicy::default(),
            RulePhase::PreRetrieval,
        );
        assert!(miss.exclude.is_empty());
    }
}
