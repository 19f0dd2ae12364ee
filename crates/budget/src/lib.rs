//! Per-session risk budget accounting.
//!
//! Each session opens with a scalar budget; every executed ALLOW deducts
//! its risk score. ASK and BLOCK deduct nothing — unapproved or denied
//! intent is not spent authority. The manager only assesses a remaining
//! balance against thresholds; the balance itself lives in session state.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Default opening budget.
pub const DEFAULT_INITIAL: f64 = 3.0;
/// Default remaining-balance threshold for ASK escalation.
pub const DEFAULT_ASK_BELOW: f64 = 0.2;
/// Default remaining-balance threshold for forced BLOCK.
pub const DEFAULT_BLOCK_BELOW: f64 = -0.5;

/// Budget thresholds for one session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Opening balance.
    pub initial: f64,
    /// Below this remaining balance, ALLOW escalates to ASK.
    pub ask_below: f64,
    /// Below this remaining balance, everything is blocked.
    pub block_below: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL,
            ask_below: DEFAULT_ASK_BELOW,
            block_below: DEFAULT_BLOCK_BELOW,
        }
    }
}

/// Assessment of a remaining balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetState {
    /// Plenty left.
    Within,
    /// Low: ALLOW decisions should escalate to ASK.
    LowEscalate,
    /// Exhausted: block further actions.
    Exhausted,
}

/// Stateless assessor over a session's remaining balance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Manager {
    cfg: BudgetConfig,
}

impl Manager {
    /// Manager with the given thresholds.
    #[must_use]
    pub fn new(cfg: BudgetConfig) -> Self {
        Self { cfg }
    }

    /// Deduct `amount` from `remaining`, returning the new balance.
    pub fn charge(self, remaining: &mut f64, amount: f64) -> f64 {
        *remaining -= amount;
        *remaining
    }

    /// Assess a remaining balance against the thresholds.
    #[must_use]
    pub fn state(self, remaining: f64) -> BudgetState {
        if remaining < self.cfg.block_below {
            BudgetState::Exhausted
        } else if remaining < self.cfg.ask_below {
            BudgetState::LowEscalate
        } else {
            BudgetState::Within
        }
    }
}
