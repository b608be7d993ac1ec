//! Policy checks applied around every tool call.
//!
//! Patterns are compiled once when [`Guardrails`] is built; evaluation is a
//! pure function of the tool name, deny list first.

use std::{future::Future, time::Duration};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mcp::{McpError, McpResult};

/// Suffix telling the model its tool output was cut.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailPolicy {
    /// Empty means every tool not denied is allowed.
    pub allow_patterns: Vec<String>,
    pub deny_patterns: Vec<String>,
    pub per_tool_timeout: Duration,
    /// Bytes of tool output handed back to the model.
    pub max_result_size: usize,
    pub max_rounds_per_request: usize,
    pub max_calls_per_round: usize,
    pub max_total_calls: usize,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self {
            allow_patterns: Vec::new(),
            deny_patterns: Vec::new(),
            per_tool_timeout: Duration::from_secs(30),
            max_result_size: 1024 * 1024,
            max_rounds_per_request: 10,
            max_calls_per_round: 10,
            max_total_calls: 50,
        }
    }
}

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("invalid tool pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, GuardrailError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| GuardrailError::InvalidPattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Guardrails {
    policy: GuardrailPolicy,
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
}

impl Guardrails {
    pub fn new(policy: GuardrailPolicy) -> Result<Self, GuardrailError> {
        for (name, value) in [
            ("max_result_size", policy.max_result_size),
            ("max_rounds_per_request", policy.max_rounds_per_request),
            ("max_calls_per_round", policy.max_calls_per_round),
            ("max_total_calls", policy.max_total_calls),
        ] {
            if value == 0 {
                return Err(GuardrailError::ZeroLimit(name));
            }
        }
        if policy.per_tool_timeout.is_zero() {
            return Err(GuardrailError::ZeroLimit("per_tool_timeout"));
        }

        Ok(Self {
            allow: compile(&policy.allow_patterns)?,
            deny: compile(&policy.deny_patterns)?,
            policy,
        })
    }

    pub fn policy(&self) -> &GuardrailPolicy {
        &self.policy
    }

    /// Deny wins on any match. With a non-empty allow list, a name must also
    /// match one of its patterns.
    pub fn check_allowed(&self, name: &str) -> McpResult<()> {
        if let Some(p) = self.deny.iter().find(|p| p.matches(name)) {
            return Err(McpError::PolicyDenied(format!(
                "tool '{name}' matches deny pattern '{}'",
                p.as_str()
            )));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|p| p.matches(name)) {
            return Err(McpError::PolicyDenied(format!(
                "tool '{name}' is not in the allow list"
            )));
        }
        Ok(())
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.check_allowed(name).is_ok()
    }

    /// Runs `call` under the smaller of `remaining` and the per-tool timeout.
    /// `call` receives that limit so the remote side can be told about it too.
    pub async fn enforce_timeout<C, F, T>(&self, remaining: Duration, call: C) -> McpResult<T>
    where
        C: FnOnce(Duration) -> F,
        F: Future<Output = McpResult<T>>,
    {
        let limit = remaining.min(self.policy.per_tool_timeout);
        tokio::time::timeout(limit, call(limit))
            .await
            .unwrap_or(Err(McpError::Timeout(limit)))
    }

    /// Cuts `output` to at most `max_result_size` bytes. When the limit has
    /// room for it, [`TRUNCATION_MARKER`] is appended inside the limit. A cut
    /// that would split a UTF-8 sequence moves back to the previous char
    /// boundary.
    pub fn truncate(&self, mut output: String) -> (String, bool) {
        let limit = self.policy.max_result_size;
        if output.len() <= limit {
            return (output, false);
        }
        let marker = limit > TRUNCATION_MARKER.len();
        let mut cut = if marker {
            limit - TRUNCATION_MARKER.len()
        } else {
            limit
        };
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        if marker {
            output.push_str(TRUNCATION_MARKER);
        }
        (output, true)
    }
}

/// Call accounting for one request: a per-round cap and a total budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundBudget {
    per_round: usize,
    remaining: usize,
}

impl RoundBudget {
    pub fn new(per_round: usize, total: usize) -> Self {
        Self {
            per_round,
            remaining: total,
        }
    }

    /// Admits up to `requested` calls for a round and returns how many were
    /// admitted; the rest must be rejected without running.
    pub fn admit(&mut self, requested: usize) -> usize {
        let admitted = requested.min(self.per_round).min(self.remaining);
        self.remaining -= admitted;
        admitted
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}
