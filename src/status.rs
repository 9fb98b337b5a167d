//! Subscription lifecycle status.

use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::{Mutex, RwLock};
use tracing::{error, trace};

/// Lifecycle status of a table subscription.
///
/// Transitions are linear apart from the terminal branch:
/// `Starting → Started → WaitingForNotification →
/// (MessageReadyToBeNotified → MessageSent)* → StoppedDueToCancellation |
/// StoppedDueToError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
   /// Preconditions are being checked and objects provisioned.
   Starting,
   /// The listener task is running.
   Started,
   /// The listener is blocked on the queue.
   WaitingForNotification,
   /// A complete change has been reassembled and is about to be delivered.
   MessageReadyToBeNotified,
   /// The change callbacks have returned.
   MessageSent,
   /// The subscription was cancelled; no error occurred.
   StoppedDueToCancellation,
   /// The listener hit a genuine fault and exited.
   StoppedDueToError,
}

impl SubscriptionStatus {
   /// Whether this status is terminal.
   pub fn is_terminal(&self) -> bool {
      matches!(
         self,
         SubscriptionStatus::StoppedDueToCancellation | SubscriptionStatus::StoppedDueToError
      )
   }
}

type StatusCallback = Box<dyn Fn(SubscriptionStatus) + Send + Sync>;

/// Tracks the current status and broadcasts every transition to the
/// registered status callbacks before the caller proceeds.
pub(crate) struct StatusTracker {
   current: RwLock<SubscriptionStatus>,
   callbacks: Mutex<Vec<StatusCallback>>,
}

impl StatusTracker {
   pub fn new() -> Self {
      Self {
         current: RwLock::new(SubscriptionStatus::Starting),
         callbacks: Mutex::new(Vec::new()),
      }
   }

   pub fn get(&self) -> SubscriptionStatus {
      *self.current.read()
   }

   pub fn on_status(&self, callback: StatusCallback) {
      self.callbacks.lock().push(callback);
   }

   /// Stores the new status and notifies every status callback. Callback
   /// panics are absorbed so a misbehaving observer cannot kill the
   /// listener.
   pub fn set(&self, status: SubscriptionStatus) {
      trace!(?status, "status transition");
      *self.current.write() = status;
      let callbacks = self.callbacks.lock();
      for callback in callbacks.iter() {
         if catch_unwind(AssertUnwindSafe(|| callback(status))).is_err() {
            error!(?status, "status callback panicked");
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::Arc;
   use std::sync::atomic::{AtomicUsize, Ordering};

   #[test]
   fn terminal_states() {
      assert!(SubscriptionStatus::StoppedDueToCancellation.is_terminal());
      assert!(SubscriptionStatus::StoppedDueToError.is_terminal());
      assert!(!SubscriptionStatus::WaitingForNotification.is_terminal());
   }

   #[test]
   fn broadcasts_before_returning() {
      let tracker = StatusTracker::new();
      let seen = Arc::new(AtomicUsize::new(0));
      let seen_cb = Arc::clone(&seen);
      tracker.on_status(Box::new(move |_| {
         seen_cb.fetch_add(1, Ordering::SeqCst);
      }));
      tracker.set(SubscriptionStatus::Started);
      assert_eq!(seen.load(Ordering::SeqCst), 1);
      assert_eq!(tracker.get(), SubscriptionStatus::Started);
   }

   #[test]
   fn panicking_callback_does_not_poison_tracker() {
      let tracker = StatusTracker::new();
      tracker.on_status(Box::new(|_| panic!("bad observer")));
      tracker.set(SubscriptionStatus::Started);
      assert_eq!(tracker.get(), SubscriptionStatus::Started);
   }
}
