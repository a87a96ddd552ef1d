//! The lease state machine: the authoritative table of legal transitions.
//!
//! Every loop that wants to move a lease calls [`can_transition`] before
//! issuing the CAS through `Store::transition_lease`; the store itself
//! enforces the CAS atomicity, this module enforces which edges exist at
//! all.
//!
//! `CONNECTED` does not appear as a separate variant — it is folded into
//! `Connecting` (see `fleet_storage::model::LeaseState`'s doc comment).

use fleet_storage::LeaseState;

/// Standard reason codes attached to transition events. Not exhaustive —
/// provisioner/reconciler/gc may emit additional ad hoc reasons — but these
/// are the ones the reconciler and metrics depend on being stable.
pub mod reason {
    pub const PLACED: &str = "placed";
    pub const LAUNCH_OK: &str = "launch_ok";
    pub const LAUNCH_FAILED: &str = "launch_failed";
    pub const REPORTED_ONLINE: &str = "reported_online";
    pub const JOB_ASSIGNED: &str = "job_assigned";
    pub const NEVER_CONNECTED: &str = "never_connected";
    pub const TTL_EXPIRED: &str = "ttl_expired";
    pub const UNEXPECTED_DISCONNECT: &str = "unexpected_disconnect";
    pub const JOB_DONE: &str = "job_done";
    pub const OPERATOR_TERMINATE: &str = "operator_terminate";
    pub const DELETE_OK: &str = "delete_ok";
    pub const DELETE_RETRY: &str = "delete_retry";
    pub const INVARIANT_VIOLATION: &str = "invariant_violation";
    pub const BOOT_TIMEOUT: &str = "boot_timeout";
    pub const UNRECONCILABLE: &str = "unreconcilable";
}

/// Whether `to` is a legal direct successor of `from` in the lease state
/// machine. Self-loops (`from == to`) are always legal — they model a
/// heartbeat/error refresh with no state change, not a transition.
#[must_use]
pub fn can_transition(from: LeaseState, to: LeaseState) -> bool {
    use LeaseState::{
        Booting, Connecting, Failed, Provisioning, Requested, Running, Terminated, Terminating,
    };

    if from == to {
        return !from.is_terminal();
    }

    matches!(
        (from, to),
        (Requested, Provisioning)
            | (Provisioning, Booting)
            | (Provisioning, Failed)
            | (Booting, Connecting)
            | (Booting, Failed)
            | (Connecting, Running)
            | (Connecting, Terminating)
            | (Running, Terminating)
            | (Terminating, Terminated)
            // The reconciler is the only caller authorised to force a
            // non-terminal lease straight to TERMINATING when it cannot be
            // reconciled, from any non-terminal state including ones not
            // listed above.
            | (Requested | Provisioning | Booting | Connecting | Running, Terminating)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use LeaseState::{Booting, Connecting, Failed, Provisioning, Requested, Running, Terminated, Terminating};

    #[test]
    fn happy_path_is_legal() {
        assert!(can_transition(Requested, Provisioning));
        assert!(can_transition(Provisioning, Booting));
        assert!(can_transition(Booting, Connecting));
        assert!(can_transition(Connecting, Running));
        assert!(can_transition(Running, Terminating));
        assert!(can_transition(Terminating, Terminated));
    }

    #[test]
    fn failure_edges_are_legal() {
        assert!(can_transition(Provisioning, Failed));
        assert!(can_transition(Booting, Failed));
    }

    #[test]
    fn reconciler_can_force_terminating_from_any_nonterminal_state() {
        for from in [Requested, Provisioning, Booting, Connecting, Running] {
            assert!(can_transition(from, Terminating));
        }
    }

    #[test]
    fn terminal_states_accept_nothing_including_self() {
        assert!(!can_transition(Terminated, Terminated));
        assert!(!can_transition(Failed, Failed));
        assert!(!can_transition(Terminated, Terminating));
        assert!(!can_transition(Failed, Requested));
    }

    #[test]
    fn no_backward_transitions() {
        assert!(!can_transition(Connecting, Booting));
        assert!(!can_transition(Running, Connecting));
        assert!(!can_transition(Booting, Provisioning));
    }

    #[test]
    fn self_loop_permitted_outside_terminal_states() {
        assert!(can_transition(Connecting, Connecting));
        assert!(can_transition(Running, Running));
    }
}
