use qsched_id::AccountId;
use thiserror::Error;

/// Errors returned by scheduler configuration calls.
///
/// Scheduling itself never fails; only account registration validates input.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("account already exists: {0}")]
    DuplicateAccount(AccountId),

    #[error("invalid account config for {account}: {reason}")]
    InvalidConfig { account: AccountId, reason: String },
}
