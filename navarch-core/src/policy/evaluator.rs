//! Compiles a [`Policy`] into executable CEL predicates and evaluates
//! batches of [`HealthEvent`]s against it, producing worst-wins verdicts.

use std::collections::HashMap;
use std::sync::Arc;

use cel_interpreter::{Context, Program};
use tokio::sync::RwLock;
use tracing::warn;

use crate::health_event::{HealthEvent, MetricValue};
use crate::policy::rule::{Policy, PolicyError, PolicyRule, Verdict};

#[derive(serde::Serialize)]
struct EventEnv<'a> {
    timestamp: String,
    gpu_index: i64,
    gpu_uuid: &'a str,
    system: String,
    event_type: String,
    message: &'a str,
    metrics: &'a HashMap<String, MetricValue>,
}

#[derive(Debug, thiserror::Error)]
enum EvalError {
    #[error("failed to encode event for evaluation: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to build CEL value from event: {0}")]
    ToCel(String),
    #[error("failed to bind event context: {0}")]
    Context(String),
    #[error("condition evaluation failed: {0}")]
    Execute(String),
}

fn evaluate_rule(program: &Program, event: &HealthEvent) -> Result<bool, EvalError> {
    let env = EventEnv {
        timestamp: event.timestamp.to_rfc3339(),
        gpu_index: event.gpu_index as i64,
        gpu_uuid: &event.gpu_uuid,
        system: event.system.to_string(),
        event_type: event.event_type.to_string(),
        message: &event.message,
        metrics: &event.metrics,
    };
    let json = serde_json::to_value(&env)?;
    let value: cel_interpreter::Value = json
        .try_into()
        .map_err(|e| EvalError::ToCel(format!("{e:?}")))?;

    let mut context = Context::default();
    context
        .add_variable("event", value)
        .map_err(|e| EvalError::Context(format!("{e:?}")))?;

    match program.execute(&context) {
        Ok(cel_interpreter::Value::Bool(b)) => Ok(b),
        Ok(_) => Ok(false),
        Err(e) => Err(EvalError::Execute(format!("{e:?}"))),
    }
}

struct CompiledRule {
    rule: PolicyRule,
    program: Program,
}

struct CompiledPolicy {
    rules: Vec<CompiledRule>,
}

fn compile(policy: &Policy) -> Result<CompiledPolicy, PolicyError> {
    policy.validate()?;
    let mut rules = Vec::with_capacity(policy.rules.len());
    for rule in &policy.rules {
        let program = Program::compile(&rule.condition).map_err(|source| PolicyError::Compile {
            rule: rule.name.clone(),
            source,
        })?;
        rules.push(CompiledRule {
            rule: rule.clone(),
            program,
        });
    }
    Ok(CompiledPolicy { rules })
}

/// A single (rule, event) pairing recorded during evaluation.
#[derive(Debug, Clone)]
pub struct Match {
    pub rule: String,
    pub event: HealthEvent,
    pub verdict: Verdict,
}

/// Outcome of evaluating one batch of events against the current policy.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub verdict: Verdict,
    /// Name of the rule that produced the overall worst verdict. `None`
    /// when `verdict == Healthy` — see §9 open question: MatchedRule is
    /// left empty on the canonical "no finding" outcome even if some
    /// individual healthy-result rule matched.
    pub matched_rule: Option<String>,
    pub matched_event: Option<HealthEvent>,
    pub all_matches: Vec<Match>,
}

/// Compiles policies and evaluates event batches against the currently
/// active one. Safe for concurrent reads; updates swap the compiled
/// program table atomically under a write lock.
pub struct PolicyEvaluator {
    compiled: RwLock<Arc<CompiledPolicy>>,
}

impl PolicyEvaluator {
    /// Compile `policy`; fails with the offending rule named if any
    /// condition is syntactically invalid.
    pub fn new(policy: &Policy) -> Result<Self, PolicyError> {
        let compiled = compile(policy)?;
        Ok(Self {
            compiled: RwLock::new(Arc::new(compiled)),
        })
    }

    /// Hot-swap the active policy. The new policy is compiled to
    /// completion before anything is published; on failure the
    /// previously-active policy remains in effect.
    pub async fn update(&self, policy: &Policy) -> Result<(), PolicyError> {
        let compiled = compile(policy)?;
        let mut guard = self.compiled.write().await;
        *guard = Arc::new(compiled);
        Ok(())
    }

    /// Evaluate a batch of events against the currently active policy.
    pub async fn evaluate(&self, events: &[HealthEvent]) -> EvaluationResult {
        let compiled = self.compiled.read().await.clone();

        struct PerEvent<'a> {
            event: &'a HealthEvent,
            matched: Option<(&'a str, Verdict)>,
        }

        let mut per_event = Vec::with_capacity(events.len());
        for event in events {
            let mut matched = None;
            for compiled_rule in &compiled.rules {
                match evaluate_rule(&compiled_rule.program, event) {
                    Ok(true) => {
                        matched = Some((compiled_rule.rule.name.as_str(), compiled_rule.rule.result));
                        break;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(rule = %compiled_rule.rule.name, error = %e, "policy rule evaluation failed; treating as non-match");
                        continue;
                    }
                }
            }
            per_event.push(PerEvent { event, matched });
        }

        let worst = per_event
            .iter()
            .map(|pe| pe.matched.map(|(_, v)| v).unwrap_or(Verdict::Healthy))
            .max()
            .unwrap_or(Verdict::Healthy);

        let mut all_matches = Vec::new();
        for pe in &per_event {
            if let Some((rule, verdict)) = pe.matched {
                all_matches.push(Match {
                    rule: rule.to_string(),
                    event: pe.event.clone(),
                    verdict,
                });
            }
        }

        let (matched_rule, matched_event) = if worst == Verdict::Healthy {
            (None, None)
        } else {
            per_event
                .iter()
                .find(|pe| pe.matched.map(|(_, v)| v) == Some(worst))
                .and_then(|pe| pe.matched.map(|(rule, _)| (Some(rule.to_string()), Some(pe.event.clone()))))
                .unwrap_or((None, None))
        };

        EvaluationResult {
            verdict: worst,
            matched_rule,
            matched_event,
            all_matches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health_event::HealthEvent;

    fn default_policy() -> Policy {
        Policy {
            version: "1".to_string(),
            metadata: None,
            rules: vec![
                PolicyRule {
                    name: "fatal-xid".to_string(),
                    description: None,
                    condition: "event.event_type == 'xid' && event.metrics.xid_code in [13, 31, 32, 43, 45, 48, 61, 62, 63, 64, 68, 69, 74, 79, 92, 94, 95, 100, 119, 120]".to_string(),
                    result: Verdict::Unhealthy,
                },
                PolicyRule {
                    name: "recoverable-xid".to_string(),
                    description: None,
                    condition: "event.event_type == 'xid'".to_string(),
                    result: Verdict::Degraded,
                },
                PolicyRule {
                    name: "thermal-critical".to_string(),
                    description: None,
                    condition: "event.event_type == 'thermal' && event.metrics.temperature >= 95".to_string(),
                    result: Verdict::Unhealthy,
                },
                PolicyRule {
                    name: "thermal-warning".to_string(),
                    description: None,
                    condition: "event.event_type == 'thermal' && event.metrics.temperature >= 85".to_string(),
                    result: Verdict::Degraded,
                },
            ],
        }
    }

    #[tokio::test]
    async fn empty_batch_is_healthy() {
        let evaluator = PolicyEvaluator::new(&default_policy()).unwrap();
        let result = evaluator.evaluate(&[]).await;
        assert_eq!(result.verdict, Verdict::Healthy);
        assert!(result.matched_rule.is_none());
        assert!(result.all_matches.is_empty());
    }

    #[tokio::test]
    async fn fatal_xid_is_unhealthy() {
        let evaluator = PolicyEvaluator::new(&default_policy()).unwrap();
        let event = HealthEvent::xid(0, "GPU-0", 79, "double bit ECC");
        let result = evaluator.evaluate(&[event]).await;
        assert_eq!(result.verdict, Verdict::Unhealthy);
        assert_eq!(result.matched_rule.as_deref(), Some("fatal-xid"));
    }

    #[tokio::test]
    async fn recoverable_xid_is_degraded() {
        let evaluator = PolicyEvaluator::new(&default_policy()).unwrap();
        let event = HealthEvent::xid(0, "GPU-0", 8, "recoverable");
        let result = evaluator.evaluate(&[event]).await;
        assert_eq!(result.verdict, Verdict::Degraded);
        assert_eq!(result.matched_rule.as_deref(), Some("recoverable-xid"));
    }

    #[tokio::test]
    async fn thermal_boundaries() {
        let evaluator = PolicyEvaluator::new(&default_policy()).unwrap();
        for (temp, expected) in [(84, Verdict::Healthy), (85, Verdict::Degraded), (94, Verdict::Degraded), (95, Verdict::Unhealthy)] {
            let event = HealthEvent::thermal(0, "GPU-0", temp, "thermal reading");
            let result = evaluator.evaluate(&[event]).await;
            assert_eq!(result.verdict, expected, "temperature {temp}");
        }
    }

    #[tokio::test]
    async fn worst_wins_aggregation_picks_first_event_at_worst_severity() {
        let evaluator = PolicyEvaluator::new(&default_policy()).unwrap();
        let events = vec![
            HealthEvent::xid(0, "GPU-0", 79, "fatal"),
            HealthEvent::thermal(0, "GPU-0", 87, "warm"),
            HealthEvent::nvlink(0, "GPU-0", 0, "link flap"),
        ];
        let result = evaluator.evaluate(&events).await;
        assert_eq!(result.verdict, Verdict::Unhealthy);
        assert_eq!(result.matched_rule.as_deref(), Some("fatal-xid"));
    }

    #[tokio::test]
    async fn update_swaps_policy_atomically() {
        let evaluator = PolicyEvaluator::new(&default_policy()).unwrap();
        let narrower = Policy {
            version: "2".to_string(),
            metadata: None,
            rules: vec![PolicyRule {
                name: "always-healthy".to_string(),
                description: None,
                condition: "true".to_string(),
                result: Verdict::Healthy,
            }],
        };
        evaluator.update(&narrower).await.unwrap();
        let event = HealthEvent::xid(0, "GPU-0", 79, "fatal");
        let result = evaluator.evaluate(&[event]).await;
        assert_eq!(result.verdict, Verdict::Healthy);
    }

    #[tokio::test]
    async fn failed_update_leaves_old_policy_in_effect() {
        let evaluator = PolicyEvaluator::new(&default_policy()).unwrap();
        let broken = Policy {
            version: "3".to_string(),
            metadata: None,
            rules: vec![PolicyRule {
                name: "broken".to_string(),
                description: None,
                condition: "event.metrics.xid_code in [".to_string(),
                result: Verdict::Unhealthy,
            }],
        };
        assert!(evaluator.update(&broken).await.is_err());

        let event = HealthEvent::xid(0, "GPU-0", 79, "still fatal");
        let result = evaluator.evaluate(&[event]).await;
        assert_eq!(result.verdict, Verdict::Unhealthy);
        assert_eq!(result.matched_rule.as_deref(), Some("fatal-xid"));
    }
}
