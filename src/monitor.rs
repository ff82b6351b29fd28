//! Contract for following the progress of loader actions

use crate::error::ErrorKind;
use crate::loader::{Action, ActionSummary, Status};

/// An observer of loader actions.
///
/// All callbacks run on the worker thread spawned for the action — never on
/// the caller's thread — and are serialized: for one action `begin` precedes
/// any `update`s, which precede the single `finish`; across actions, the next
/// action's `begin` is held back until the previous action's `finish` has
/// returned.
///
/// Callbacks must return quickly. While one is executing the loader is idle
/// on the wire, and if the target waits more than about 100 ms for a
/// transmission prompt it reboots. Consider redispatching work to another
/// thread.
///
/// Callbacks must not panic. They also must not call
/// [cancel_and_wait][crate::PropLoader::cancel_and_wait] or
/// [wait_until_finished][crate::PropLoader::wait_until_finished] — those wait
/// on the very thread the callback is holding up. Calling
/// [cancel][crate::PropLoader::cancel] is fine.
pub trait StatusMonitor: Send + Sync {
    /// Called once when an action is about to begin.
    ///
    /// If this is called, `loader_has_finished` will be called; `loader_update`
    /// might never be.
    fn loader_will_begin(
        &self,
        _action: Action,
        _seconds_so_far: f32,
        _estimated_total_seconds: f32,
    ) {
    }

    /// Called when the loader has moved to a new phase of the action.
    ///
    /// `estimated_total_seconds` may change between calls; it is never less
    /// than `seconds_so_far`.
    fn loader_update(&self, _status: Status, _seconds_so_far: f32, _estimated_total_seconds: f32) {}

    /// Called once when the action has finished.
    ///
    /// On success `error_kind` is [ErrorKind::None] and `error_details` is
    /// empty. By the time this is called the loader is no longer busy and any
    /// threads blocked waiting on the action have been released.
    fn loader_has_finished(
        &self,
        _error_kind: ErrorKind,
        _error_details: &str,
        _summary: &ActionSummary,
    ) {
    }
}
