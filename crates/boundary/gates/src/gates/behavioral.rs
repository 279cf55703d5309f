use std::sync::Arc;

use async_trait::async_trait;
use boundary_kernel::{CrossingRequest, CrossingView, Gate, GateError, GateOutcome};
use boundary_types::GateId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::traits::{BehaviorAssessment, BehaviorEvaluator};

/// Condition a behavior rule matches on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    OperationIs { operation: String },
    ActorPrefix { prefix: String },
    FieldAbove { field: String, limit: f64 },
    AttributeEquals { key: String, value: String },
}

impl RuleCondition {
    pub fn matches(&self, request: &CrossingRequest) -> bool {
        match self {
            RuleCondition::OperationIs { operation } => request.operation() == operation,
            RuleCondition::ActorPrefix { prefix } => request.actor().starts_with(prefix.as_str()),
            RuleCondition::FieldAbove { field, limit } => request
                .payload()
                .get(field)
                .and_then(|v| v.as_f64())
                .is_some_and(|v| v > *limit),
            RuleCondition::AttributeEquals { key, value } => {
                request.attribute(key) == Some(value.as_str())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BehaviorRule {
    pub name: String,
    /// Contribution to the risk score when the rule matches
    pub weight: f64,
    pub condition: RuleCondition,
}

/// Sums the weights of matching rules, capped at 1.0.
#[derive(Clone, Debug, Default)]
pub struct RuleBasedEvaluator {
    rules: Vec<BehaviorRule>,
}

impl RuleBasedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, name: impl Into<String>, weight: f64, condition: RuleCondition) -> Self {
        self.rules.push(BehaviorRule {
            name: name.into(),
            weight: weight.clamp(0.0, 1.0),
            condition,
        });
        self
    }
}

impl BehaviorEvaluator for RuleBasedEvaluator {
    fn assess(&self, request: &CrossingRequest) -> Result<BehaviorAssessment, GateError> {
        let mut assessment = BehaviorAssessment::default();
        for rule in self.rules.iter().filter(|r| r.condition.matches(request)) {
            assessment.score += rule.weight;
            assessment.matched.push(rule.name.clone());
        }
        assessment.score = assessment.score.min(1.0);
        Ok(assessment)
    }
}

/// K8: Behavioral Evaluation
///
/// Rejects requests whose risk score reaches the threshold.
pub struct BehavioralEvalGate {
    evaluator: Arc<dyn BehaviorEvaluator>,
    threshold: f64,
}

impl BehavioralEvalGate {
    pub fn new(evaluator: Arc<dyn BehaviorEvaluator>, threshold: f64) -> Self {
        Self {
            evaluator,
            threshold,
        }
    }
}

#[async_trait]
impl Gate for BehavioralEvalGate {
    fn id(&self) -> GateId {
        GateId::K8
    }

    fn name(&self) -> &str {
        "behavioral-eval"
    }

    async fn evaluate(
        &self,
        crossing: &CrossingView,
        request: &CrossingRequest,
    ) -> Result<GateOutcome, GateError> {
        let assessment = self.evaluator.assess(request)?;
        if assessment.score >= self.threshold {
            warn!(
                correlation_id = %crossing.correlation_id,
                score = assessment.score,
                threshold = self.threshold,
                "behavioral risk too high"
            );
            return Ok(GateOutcome::fail(format!(
                "risk {:.2} >= {:.2} ({})",
                assessment.score,
                self.threshold,
                assessment.matched.join(", ")
            )));
        }
        debug!(correlation_id = %crossing.correlation_id, score = assessment.score, "behavior acceptable");
        Ok(GateOutcome::Pass)
    }
}
