//! LivenessProbe port - claim 保持者の生存確認
//!
//! Allocator は registry に直接依存せず、この trait 越しに
//! 「生きている worker が保持している task か」を問い合わせます。

use crate::domain::{Task, WorkerId};

pub trait LivenessProbe {
    /// The holder of `task`'s lock, if that holder's session is live right now.
    fn live_holder(&self, task: &Task) -> Option<WorkerId>;
}

/// Treats every lock as live. Useful when no session data is at hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllLocksLive;

impl LivenessProbe for AllLocksLive {
    fn live_holder(&self, task: &Task) -> Option<WorkerId> {
        task.locked_by
    }
}
