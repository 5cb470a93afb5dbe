//! Typed ID definitions.
//!
//! Each ID type has a prefix that is only used when minting a fresh ID;
//! caller-supplied IDs are accepted verbatim.

use crate::define_id;

// =============================================================================
// Scheduling
// =============================================================================

define_id!(RequestId, "req");
define_id!(WorkerId, "wrk");
define_id!(AccountId, "acct");

// =============================================================================
// Tests
// =============================================================================
