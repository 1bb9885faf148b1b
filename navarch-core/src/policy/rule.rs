//! Declarative policy rules: the data shape, before compilation.

use serde::{Deserialize, Serialize};

/// Three-state health verdict, ordered by severity for worst-wins
/// aggregation (`Unhealthy` > `Degraded` > `Healthy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Healthy = 0,
    Degraded = 1,
    Unhealthy = 2,
}

/// A single named rule: if `condition` evaluates true for an event, that
/// event's verdict is `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub condition: String,
    pub result: Verdict,
}

/// An ordered policy document: `rules[]`, evaluated first-match-wins per
/// event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub version: String,
    #[serde(default)]
    pub metadata: Option<PolicyMetadata>,
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Structural errors in a policy document, caught before any rule is
/// compiled.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy must declare at least one rule")]
    Empty,
    #[error("duplicate rule name: {0}")]
    DuplicateName(String),
    #[error("rule {0} has an empty condition")]
    EmptyCondition(String),
    #[error("rule {rule} failed to compile: {source}")]
    Compile {
        rule: String,
        #[source]
        source: cel_interpreter::ParseError,
    },
}

impl Policy {
    /// Structural validation only (§3 Policy invariants); does not parse
    /// conditions. Compilation (and per-rule parse errors) happens in
    /// [`crate::policy::evaluator::PolicyEvaluator::compile`].
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.rules.is_empty() {
            return Err(PolicyError::Empty);
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.name.as_str()) {
                return Err(PolicyError::DuplicateName(rule.name.clone()));
            }
            if rule.condition.trim().is_empty() {
                return Err(PolicyError::EmptyCondition(rule.name.clone()));
            }
        }
        Ok(())
    }
}
