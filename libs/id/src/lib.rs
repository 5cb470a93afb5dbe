//! # qsched-id
//!
//! Identifier types shared by the quota scheduler and its reconciler.
//!
//! ## Design Principles
//!
//! - IDs are opaque strings supplied by callers; equality is the only
//!   operation the scheduler relies on
//! - IDs are typed so a worker ID can never be passed where a request ID
//!   is expected
//! - IDs order lexically, which keeps every map iteration deterministic
//!
//! ## Generated IDs
//!
//! Callers that do not have their own identifiers can mint one with
//! `generate()`, which produces `{prefix}_{ulid}`:
//!
//! - `req_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `wrk_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `acct_01HV4Z4NYPLTRS0JTUA8XDME5F`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
