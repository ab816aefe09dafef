//! Branch selection over a step's prioritized outgoing connections.

use std::sync::Arc;

use journey_content::RuleEvaluator;
use journey_core::records::{ConditionType, JourneyStepConnection, JourneyStepRule};
use journey_core::types::ContactId;
use journey_core::JourneyResult;
use tracing::debug;

use crate::types::{BranchDecision, RuleOutcome};

pub struct RuleEngine {
    evaluator: Arc<dyn RuleEvaluator>,
}

impl RuleEngine {
    pub fn new(evaluator: Arc<dyn RuleEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Evaluates every rule and combines them under `condition`. Score comes
    /// only from rules that passed, in rule order.
    pub async fn process_rules(
        &self,
        rules: &[JourneyStepRule],
        contact: ContactId,
        condition: ConditionType,
    ) -> JourneyResult<RuleOutcome> {
        let mut passed_count = 0;
        let mut score_items = Vec::new();

        for rule in rules {
            if self.evaluator.evaluate(rule, contact).await? {
                passed_count += 1;
                score_items.extend(rule.journey_step_rule_scores.iter().cloned());
            }
        }

        let passed = match condition {
            ConditionType::All => passed_count == rules.len(),
            ConditionType::Any => passed_count > 0,
        };
        let score = score_items.iter().map(|s| s.value).sum();

        Ok(RuleOutcome {
            passed,
            passed_count,
            score,
            score_items,
        })
    }

    /// Returns the first connection, in the given order, whose rules pass.
    /// A connection without rules passes with score 0. `None` means no
    /// connection passed yet.
    pub async fn process_step_connections(
        &self,
        connections: &[JourneyStepConnection],
        contact: ContactId,
    ) -> JourneyResult<Option<BranchDecision>> {
        for connection in connections {
            if connection.journey_step_rules.is_empty() {
                debug!(connection_id = connection.id, "Default connection taken");
                return Ok(Some(BranchDecision {
                    connection: connection.id,
                    target: connection.target(),
                    score: 0.0,
                    score_items: Vec::new(),
                }));
            }

            let outcome = self
                .process_rules(
                    &connection.journey_step_rules,
                    contact,
                    connection.condition_type,
                )
                .await?;
            debug!(
                connection_id = connection.id,
                priority = connection.priority,
                passed = outcome.passed,
                passed_rules = outcome.passed_count,
                "Connection evaluated"
            );

            if outcome.passed {
                return Ok(Some(BranchDecision {
                    connection: connection.id,
                    target: connection.target(),
                    score: outcome.score,
                    score_items: outcome.score_items,
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journey_content::MemoryRuleEvaluator;
    use journey_core::records::{Reference, RuleScore};

    fn rule(id: u64, scores: &[(&str, f64)]) -> JourneyStepRule {
        JourneyStepRule {
            id,
            journey_step_rule_scores: scores
                .iter()
                .map(|(name, value)| RuleScore {
                    name: name.to_string(),
                    value: *value,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn connection(
        id: u64,
        priority: i64,
        condition: ConditionType,
        target: u64,
        rules: Vec<JourneyStepRule>,
    ) -> JourneyStepConnection {
        JourneyStepConnection {
            id,
            priority,
            condition_type: condition,
            target_step: Some(Reference::from(target)),
            journey_step_rules: rules,
        }
    }

    fn engine(results: &[(u64, bool)]) -> (Arc<MemoryRuleEvaluator>, RuleEngine) {
        let evaluator = Arc::new(MemoryRuleEvaluator::new());
        for (rule, passes) in results {
            evaluator.set(*rule, *passes);
        }
        (evaluator.clone(), RuleEngine::new(evaluator))
    }

    #[tokio::test]
    async fn test_failing_rules_fall_through_to_default() {
        let (_, engine) = engine(&[(1, false)]);
        let connections = vec![
            connection(10, 1, ConditionType::All, 100, vec![rule(1, &[("a", 5.0)])]),
            connection(11, 2, ConditionType::All, 200, vec![]),
        ];
        let decision = engine
            .process_step_connections(&connections, 7)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.connection, 11);
        assert_eq!(decision.target, Some(200));
        assert_eq!(decision.score, 0.0);
        assert!(decision.score_items.is_empty());
    }

    #[tokio::test]
    async fn test_first_passing_connection_wins() {
        let (evaluator, engine) = engine(&[(1, true), (2, true)]);
        let connections = vec![
            connection(10, 1, ConditionType::All, 100, vec![rule(1, &[("a", 1.0)])]),
            connection(11, 2, ConditionType::All, 200, vec![rule(2, &[("b", 9.0)])]),
        ];
        let decision = engine
            .process_step_connections(&connections, 7)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.connection, 10);
        // The later connection is never evaluated.
        assert_eq!(evaluator.calls(), vec![(1, 7)]);
    }

    #[tokio::test]
    async fn test_all_versus_any() {
        let (_, engine) = engine(&[(1, true), (2, false)]);
        let rules = vec![rule(1, &[("opened", 2.0), ("clicked", 3.0)]), rule(2, &[("bought", 10.0)])];

        let all = engine.process_rules(&rules, 7, ConditionType::All).await.unwrap();
        assert!(!all.passed);
        assert_eq!(all.passed_count, 1);

        let any = engine.process_rules(&rules, 7, ConditionType::Any).await.unwrap();
        assert!(any.passed);
        assert_eq!(any.score, 5.0);
        let names: Vec<_> = any.score_items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["opened", "clicked"]);
    }

    #[tokio::test]
    async fn test_no_decision_when_nothing_passes() {
        let (_, engine) = engine(&[(1, false), (2, false)]);
        let connections = vec![
            connection(10, 1, ConditionType::Any, 100, vec![rule(1, &[])]),
            connection(11, 2, ConditionType::All, 200, vec![rule(2, &[])]),
        ];
        assert!(engine
            .process_step_connections(&connections, 7)
            .await
            .unwrap()
            .is_none());
        assert!(engine.process_step_connections(&[], 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evaluator_failure_propagates() {
        let (evaluator, engine) = engine(&[]);
        evaluator.fail(1, "evaluator unreachable");
        let connections = vec![connection(10, 1, ConditionType::All, 100, vec![rule(1, &[])])];
        assert!(engine.process_step_connections(&connections, 7).await.is_err());
    }
}
