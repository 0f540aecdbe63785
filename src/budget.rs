//! Token budget guard.
//!
//! Prompts are estimated at four characters per token before an engine is
//! invoked. Per-step and cumulative per-protocol ceilings are enforced
//! according to the configured mode. Cumulative usage lives in the state
//! store; callers pass in what it reports.

use serde::{Deserialize, Serialize};

use crate::error::{ProtoflowError, Result};

/// What happens when an estimate exceeds a ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMode {
    /// Refuse the prompt
    #[default]
    Strict,
    /// Log and continue
    Warn,
    /// No checks
    Off,
}

/// Rough token estimate: four characters per token, at least one.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4).max(1)
}

/// Outcome of a budget check that did not refuse the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetCheck {
    Within { estimated: u64 },
    /// Over a ceiling in warn mode; carries the message that was logged
    Warned { estimated: u64, message: String },
}

/// Enforces token ceilings.
#[derive(Debug, Clone)]
pub struct BudgetGuard {
    mode: BudgetMode,
    max_tokens_per_step: Option<u64>,
    max_tokens_per_protocol: Option<u64>,
}

impl BudgetGuard {
    pub fn new(mode: BudgetMode, max_tokens_per_step: Option<u64>, max_tokens_per_protocol: Option<u64>) -> Self {
        Self {
            mode,
            max_tokens_per_step,
            max_tokens_per_protocol,
        }
    }

    /// A guard that never refuses anything
    pub fn unlimited() -> Self {
        Self::new(BudgetMode::Off, None, None)
    }

    pub fn mode(&self) -> BudgetMode {
        self.mode
    }

    /// Whether checks need the protocol's recorded usage
    pub fn tracks_protocol_usage(&self) -> bool {
        self.mode != BudgetMode::Off && self.max_tokens_per_protocol.is_some()
    }

    /// Check a prompt against the per-step and protocol ceilings.
    ///
    /// `used` is what the protocol has consumed so far.
    pub fn check(&self, protocol_run_id: i64, used: u64, prompt: &str, context: &str) -> Result<BudgetCheck> {
        let estimated = estimate_tokens(prompt);
        if self.mode == BudgetMode::Off {
            return Ok(BudgetCheck::Within { estimated });
        }

        let mut violations = Vec::new();
        if let Some(limit) = self.max_tokens_per_step {
            if estimated > limit {
                violations.push(format!(
                    "estimated prompt tokens ({}) exceed step limit ({}) for {}",
                    estimated, limit, context
                ));
            }
        }
        if let Some(limit) = self.max_tokens_per_protocol {
            if used + estimated > limit {
                violations.push(format!(
                    "protocol {} would use {} tokens, over its limit ({})",
                    protocol_run_id,
                    used + estimated,
                    limit
                ));
            }
        }

        if violations.is_empty() {
            return Ok(BudgetCheck::Within { estimated });
        }
        let message = violations.join("; ");
        match self.mode {
            BudgetMode::Strict => Err(ProtoflowError::BudgetExceeded(message)),
            _ => {
                log::warn!("Token budget warning: {}", message);
                Ok(BudgetCheck::Warned { estimated, message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_strict_mode_refuses_oversized_prompt() {
        let guard = BudgetGuard::new(BudgetMode::Strict, Some(10), None);
        let err = guard.check(1, 0, &"x".repeat(80), "step 01").unwrap_err();
        assert!(matches!(err, ProtoflowError::BudgetExceeded(ref m) if m.contains("step 01")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_warn_mode_allows_with_message() {
        let guard = BudgetGuard::new(BudgetMode::Warn, Some(10), None);
        let check = guard.check(1, 0, &"x".repeat(80), "step 01").unwrap();
        assert!(matches!(check, BudgetCheck::Warned { estimated: 20, .. }));
    }

    #[test]
    fn test_off_mode_skips_checks() {
        let guard = BudgetGuard::new(BudgetMode::Off, Some(1), Some(1));
        assert_eq!(
            guard.check(1, 0, &"x".repeat(80), "s").unwrap(),
            BudgetCheck::Within { estimated: 20 }
        );
    }

    #[test]
    fn test_protocol_limit_counts_prior_usage() {
        let guard = BudgetGuard::new(BudgetMode::Strict, None, Some(30));
        assert!(guard.check(7, 0, &"x".repeat(80), "a").is_ok());
        let err = guard.check(7, 20, &"x".repeat(80), "b").unwrap_err();
        assert!(matches!(err, ProtoflowError::BudgetExceeded(ref m) if m.contains("would use 40 tokens")));
        assert!(guard.tracks_protocol_usage());
        assert!(!BudgetGuard::new(BudgetMode::Off, None, Some(30)).tracks_protocol_usage());
    }
}
