//! The coordination protocol. Every function here is stateless: it reads
//! the store, decides, and writes back. Workers share nothing else.

pub mod bootstrap;
pub mod branch;
pub mod claim;
pub mod feedback;
pub mod merge_gate;
pub mod progress;

pub use claim::{ClaimOutcome, ClaimPolicy, release_claim, try_claim, verify_claim};
pub use merge_gate::{GateDecision, GateStatus, MergeOutcome, MergePolicy, evaluate_gate, try_merge};

use crate::store::ChangeId;

/// Comment linking an item to the change opened for it.
pub const CHANGE_MARKER: &str = "peerloop:change";
/// Terminal status comment.
pub const COMPLETE_MARKER: &str = "peerloop:complete";

pub fn change_marker(change: ChangeId) -> String {
    format!("{CHANGE_MARKER} #{change}")
}

pub fn parse_change_marker(body: &str) -> Option<ChangeId> {
    body.lines()
        .next()?
        .trim()
        .strip_prefix(CHANGE_MARKER)?
        .trim()
        .strip_prefix('#')?
        .parse()
        .ok()
}
