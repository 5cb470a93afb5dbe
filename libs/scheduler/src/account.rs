//! Accounts and quota balances.
//!
//! Every account has one balance per priority level, measured in
//! worker-seconds. Balances refill at the account's charge rate and are
//! spent by the requests the account has on workers.

use qsched_id::AccountId;
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Number of paid priority levels.
pub const NUM_PRIORITIES: usize = 3;

/// Priority level; lower is better.
pub type Priority = u8;

/// Priority of work that no balance pays for.
pub const FREE_PRIORITY: Priority = NUM_PRIORITIES as Priority;

/// Per-level balance in worker-seconds.
pub type Balance = [f64; NUM_PRIORITIES];

/// Quota configuration for an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Balance gained per second at each level.
    pub charge_rate: Balance,

    /// Replenishment stops once a level holds `charge_rate * max_charge_seconds`.
    pub max_charge_seconds: f64,

    /// Maximum number of paid requests on workers at once; 0 is unlimited.
    /// Requests beyond the fanout are scheduled at [`FREE_PRIORITY`].
    pub max_fanout: u32,

    /// When set, this account's free-priority requests are never scheduled.
    pub disable_free_tasks: bool,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            charge_rate: [0.0; NUM_PRIORITIES],
            max_charge_seconds: 0.0,
            max_fanout: 0,
            disable_free_tasks: false,
        }
    }
}

impl AccountConfig {
    pub(crate) fn validate(&self, account: &AccountId) -> Result<(), SchedulerError> {
        let invalid = |reason: String| SchedulerError::InvalidConfig {
            account: account.clone(),
            reason,
        };

        for (level, rate) in self.charge_rate.iter().enumerate() {
            if !rate.is_finite() || *rate < 0.0 {
                return Err(invalid(format!("charge_rate[{level}] must be finite and >= 0")));
            }
        }

        if !self.max_charge_seconds.is_finite() || self.max_charge_seconds < 0.0 {
            return Err(invalid("max_charge_seconds must be finite and >= 0".to_string()));
        }

        Ok(())
    }

    /// Upper bound replenishment fills a level to.
    pub fn cap(&self, level: usize) -> f64 {
        self.charge_rate[level] * self.max_charge_seconds
    }
}

/// An account with its current balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    config: AccountConfig,
    balance: Balance,
}

impl Account {
    pub(crate) fn new(config: AccountConfig, balance: Balance) -> Self {
        Self { config, balance }
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn balance(&self) -> &Balance {
        &self.balance
    }

    /// Best level that still has budget, or [`FREE_PRIORITY`].
    pub fn best_priority(&self) -> Priority {
        self.first_funded_level(0)
    }

    /// First level at or below `from` (in priority order) that has budget.
    pub fn first_funded_level(&self, from: Priority) -> Priority {
        (from as usize..NUM_PRIORITIES)
            .find(|level| self.balance[*level] > 0.0)
            .map(|level| level as Priority)
            .unwrap_or(FREE_PRIORITY)
    }

    pub fn is_funded(&self, priority: Priority) -> bool {
        (priority as usize) < NUM_PRIORITIES && self.balance[priority as usize] > 0.0
    }

    /// Adds `elapsed_secs` worth of budget to every level.
    ///
    /// A level already at or above its cap is left untouched.
    pub(crate) fn replenish(&mut self, elapsed_secs: f64) {
        for level in 0..NUM_PRIORITIES {
            let cap = self.config.cap(level);
            let current = self.balance[level];
            if current < cap {
                let refilled = current + self.config.charge_rate[level] * elapsed_secs;
                self.balance[level] = refilled.min(cap);
            }
        }
    }

    /// Spends `elapsed_secs` at `priority`. Free work costs nothing.
    pub(crate) fn charge(&mut self, priority: Priority, elapsed_secs: f64) {
        if let Some(level) = self.balance.get_mut(priority as usize) {
            *level -= elapsed_secs;
        }
    }
}
