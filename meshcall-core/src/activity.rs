//! One call at a time per local user
//!
//! The 1:1 and group managers of a user share one `LocalActivity`. A session
//! claims it before doing anything observable and releases it on every
//! terminal transition.

use crate::types::{CallId, ChannelId};
use parking_lot::Mutex;
use std::sync::Arc;

/// What the local user is currently doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    /// Free
    Idle,
    /// In a 1:1 call
    Direct(CallId),
    /// In a group call
    Group(ChannelId),
}

/// Shared claim on the local user's single call slot
#[derive(Debug, Clone)]
pub struct LocalActivity {
    current: Arc<Mutex<Activity>>,
}

impl LocalActivity {
    /// Create an idle registry
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Activity::Idle)),
        }
    }

    /// Claim the slot. Returns `false` if another activity holds it.
    pub fn try_claim(&self, activity: Activity) -> bool {
        let mut current = self.current.lock();
        if *current != Activity::Idle {
            return false;
        }
        *current = activity;
        true
    }

    /// Swap one held claim for another, as when a simultaneous-call
    /// tie-break replaces our outgoing call with the peer's.
    pub fn transfer(&self, from: &Activity, to: Activity) -> bool {
        let mut current = self.current.lock();
        if *current != *from {
            return false;
        }
        *current = to;
        true
    }

    /// Release the slot if `activity` still holds it. Idempotent.
    pub fn release(&self, activity: &Activity) -> bool {
        let mut current = self.current.lock();
        if *current == *activity {
            *current = Activity::Idle;
            true
        } else {
            false
        }
    }

    /// Current activity
    pub fn current(&self) -> Activity {
        self.current.lock().clone()
    }

    /// Check if the user is in any call
    pub fn is_busy(&self) -> bool {
        *self.current.lock() != Activity::Idle
    }
}

impl Default for LocalActivity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_claim() {
        let activity = LocalActivity::new();
        let call = Activity::Direct(CallId::new());
        assert!(activity.try_claim(call.clone()));
        assert!(!activity.try_claim(Activity::Group(ChannelId::new("eng"))));
        assert!(activity.is_busy());
        assert!(activity.release(&call));
        assert!(!activity.is_busy());
    }

    #[test]
    fn test_release_only_own_claim() {
        let activity = LocalActivity::new();
        let first = Activity::Direct(CallId::new());
        let second = Activity::Direct(CallId::new());
        assert!(activity.try_claim(second.clone()));
        assert!(!activity.release(&first));
        assert_eq!(activity.current(), second);
    }

    #[test]
    fn test_transfer() {
        let activity = LocalActivity::new();
        let ours = Activity::Direct(CallId::new());
        let theirs = Activity::Direct(CallId::new());
        assert!(activity.try_claim(ours.clone()));
        assert!(activity.transfer(&ours, theirs.clone()));
        assert!(!activity.transfer(&ours, Activity::Idle));
        assert_eq!(activity.current(), theirs);
    }
}
