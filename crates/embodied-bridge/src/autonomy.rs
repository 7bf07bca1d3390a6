//! Autonomy control and upstream health tracking
//!
//! The [`AutonomyController`] owns the pause flag and the failure counter of
//! one entry. Pause transitions fan out to pause callbacks (awaited in order)
//! and then to listeners; health changes go to listeners only. Crossing the
//! failure threshold raises one host notification until the next success.
//!
//! State lives behind a std mutex that is released before any callback,
//! listener or await runs, so observers may read the controller freely.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info, warn};

use crate::constants::{NOTIFICATION_AUTONOMY_FAILURE, NOTIFICATION_MESSAGE, NOTIFICATION_TITLE};
use crate::host::{Notifier, OptionsStore};

/// Awaited with the new pause flag on every announced transition
pub type PauseCallback = Arc<dyn Fn(bool) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Invoked after every diagnostic or pause change
pub type StateListener = Arc<dyn Fn() + Send + Sync>;

type ListenerList = Mutex<Vec<(u64, StateListener)>>;

/// Snapshot of the failure diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutonomyDiagnostics {
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
    pub last_source: Option<String>,
}

/// Full controller state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutonomyState {
    pub paused: bool,
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
    pub last_source: Option<String>,
    pub notification_active: bool,
}

/// Removes a listener added through [`AutonomyController::add_listener`].
///
/// Removal is idempotent and safe after the controller is gone.
pub struct ListenerRemover {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl ListenerRemover {
    pub fn remove(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for ListenerRemover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRemover").field("id", &self.id).finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct AutonomyController {
    entry_id: String,
    failure_threshold: u32,
    state: Mutex<AutonomyState>,
    listeners: Arc<ListenerList>,
    pause_callbacks: Mutex<Vec<PauseCallback>>,
    next_listener_id: AtomicU64,
    options: Arc<dyn OptionsStore>,
    notifier: Arc<dyn Notifier>,
}

impl AutonomyController {
    /// Create a controller. Thresholds below 1 are clamped to 1.
    pub fn new(
        entry_id: impl Into<String>,
        initial_paused: bool,
        failure_threshold: u32,
        options: Arc<dyn OptionsStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            entry_id: entry_id.into(),
            failure_threshold: failure_threshold.max(1),
            state: Mutex::new(AutonomyState {
                paused: initial_paused,
                ..AutonomyState::default()
            }),
            listeners: Arc::new(Mutex::new(Vec::new())),
            pause_callbacks: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            options,
            notifier,
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn paused(&self) -> bool {
        lock(&self.state).paused
    }

    pub fn upstream_available(&self) -> bool {
        lock(&self.state).consecutive_failures == 0
    }

    pub fn diagnostics(&self) -> AutonomyDiagnostics {
        let state = lock(&self.state);
        AutonomyDiagnostics {
            consecutive_failures: state.consecutive_failures,
            last_failure: state.last_failure.clone(),
            last_source: state.last_source.clone(),
        }
    }

    pub fn snapshot(&self) -> AutonomyState {
        lock(&self.state).clone()
    }

    /// Register a listener; call [`ListenerRemover::remove`] to drop it
    pub fn add_listener<F>(&self, listener: F) -> ListenerRemover
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).push((id, Arc::new(listener)));
        ListenerRemover {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Append pause callbacks; they run in registration order
    pub fn add_pause_callbacks<I>(&self, callbacks: I)
    where
        I: IntoIterator<Item = PauseCallback>,
    {
        lock(&self.pause_callbacks).extend(callbacks);
    }

    /// Change the pause flag and persist it
    pub async fn set_paused(&self, paused: bool) {
        self.set_paused_with(paused, true, false).await
    }

    /// Change the pause flag.
    ///
    /// With `persist`, the flag is written to durable options unless the stored
    /// value already matches. Callbacks and listeners run when the value
    /// changed or `force_notify` is set.
    pub async fn set_paused_with(&self, paused: bool, persist: bool, force_notify: bool) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.paused != paused;
            state.paused = paused;
            changed
        };

        if changed {
            info!(entry_id = %self.entry_id, paused, "Autonomy pause state changed");
        }

        if persist && self.options.stored_paused(&self.entry_id) != Some(paused) {
            if let Err(err) = self.options.store_paused(&self.entry_id, paused).await {
                warn!(entry_id = %self.entry_id, error = %err, "Failed to persist autonomy flag");
            }
        }

        if changed || force_notify {
            self.apply_pause_state(paused).await;
            self.notify_listeners();
        }
    }

    async fn apply_pause_state(&self, paused: bool) {
        // Clone out so callbacks may register further callbacks
        let callbacks: Vec<PauseCallback> = lock(&self.pause_callbacks).clone();

        for callback in callbacks {
            let future = match catch_unwind(AssertUnwindSafe(|| callback(paused))) {
                Ok(future) => future,
                Err(_) => {
                    error!(entry_id = %self.entry_id, "Pause callback panicked");
                    continue;
                }
            };
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(entry_id = %self.entry_id, error = %err, "Pause callback failed")
                }
                Err(_) => error!(entry_id = %self.entry_id, "Pause callback panicked"),
            }
        }
    }

    /// Reset diagnostics after a successful upstream interaction.
    ///
    /// Does nothing while already healthy with no active notification.
    pub fn record_success(&self) {
        {
            let mut state = lock(&self.state);
            if state.consecutive_failures == 0 && !state.notification_active {
                return;
            }
            state.consecutive_failures = 0;
            state.last_failure = None;
            state.last_source = None;
            state.notification_active = false;
        }

        info!(entry_id = %self.entry_id, "Upstream recovered");
        self.notify_listeners();
    }

    /// Count a failed upstream interaction.
    ///
    /// Reaching the threshold raises one notification; further failures stay
    /// silent until [`record_success`](Self::record_success).
    pub fn record_failure(&self, source: &str, message: &str) {
        let raise_notification = {
            let mut state = lock(&self.state);
            state.consecutive_failures += 1;
            state.last_source = Some(source.to_string());
            state.last_failure = Some(message.to_string());

            if state.consecutive_failures >= self.failure_threshold && !state.notification_active {
                state.notification_active = true;
                true
            } else {
                false
            }
        };

        debug!(entry_id = %self.entry_id, source, message, "Recorded upstream failure");
        self.notify_listeners();

        if raise_notification {
            warn!(entry_id = %self.entry_id, "Upstream failure threshold reached");
            let notification_id = format!("{NOTIFICATION_AUTONOMY_FAILURE}_{}", self.entry_id);
            self.notifier
                .notify(NOTIFICATION_TITLE, NOTIFICATION_MESSAGE, &notification_id);
        }
    }

    fn notify_listeners(&self) {
        let listeners: Vec<(u64, StateListener)> = lock(&self.listeners).clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                error!(entry_id = %self.entry_id, listener = id, "Autonomy listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for AutonomyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutonomyController")
            .field("entry_id", &self.entry_id)
            .field("state", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MemoryOptions {
        stored: Mutex<HashMap<String, bool>>,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl OptionsStore for MemoryOptions {
        fn stored_paused(&self, entry_id: &str) -> Option<bool> {
            self.stored.lock().unwrap().get(entry_id).copied()
        }

        async fn store_paused(&self, entry_id: &str, paused: bool) -> Result<(), PersistError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.stored.lock().unwrap().insert(entry_id.to_string(), paused);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, _message: &str, notification_id: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((title.to_string(), notification_id.to_string()));
        }
    }

    fn controller(threshold: u32) -> (AutonomyController, Arc<MemoryOptions>, Arc<RecordingNotifier>) {
        let options = Arc::new(MemoryOptions::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let controller =
            AutonomyController::new("entry1", false, threshold, options.clone(), notifier.clone());
        (controller, options, notifier)
    }

    fn counting_listener(controller: &AutonomyController) -> (Arc<AtomicUsize>, ListenerRemover) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let remover = controller.add_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (count, remover)
    }

    fn recording_callback(seen: Arc<Mutex<Vec<bool>>>) -> PauseCallback {
        Arc::new(move |paused: bool| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(paused);
                Ok::<(), String>(())
            }
            .boxed()
        })
    }

    #[test]
    fn test_threshold_clamped() {
        let (controller, _, _) = controller(0);
        assert_eq!(controller.failure_threshold(), 1);
    }

    #[test]
    fn test_record_success_when_healthy_is_noop() {
        let (controller, _, _) = controller(3);
        let (count, _remover) = counting_listener(&controller);

        controller.record_success();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(controller.upstream_available());
    }

    #[test]
    fn test_failure_threshold_notifies_once() {
        let (controller, _, notifier) = controller(2);
        let (count, _remover) = counting_listener(&controller);

        controller.record_failure("event_forward", "boom");
        assert!(notifier.sent.lock().unwrap().is_empty());
        assert!(!controller.upstream_available());

        controller.record_failure("event_forward", "boom again");
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
        assert!(controller.snapshot().notification_active);

        controller.record_failure("action_result", "still down");
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 3);

        let diagnostics = controller.diagnostics();
        assert_eq!(diagnostics.consecutive_failures, 3);
        assert_eq!(diagnostics.last_source.as_deref(), Some("action_result"));
        assert_eq!(diagnostics.last_failure.as_deref(), Some("still down"));

        let (title, id) = notifier.sent.lock().unwrap()[0].clone();
        assert_eq!(title, "Embodied AI connectivity issues");
        assert_eq!(id, "aiembodied_autonomy_failure_entry1");

        controller.record_success();
        assert!(controller.upstream_available());
        assert_eq!(controller.diagnostics(), AutonomyDiagnostics::default());
        assert!(!controller.snapshot().notification_active);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_notification_rearms_after_success() {
        let (controller, _, notifier) = controller(1);

        controller.record_failure("event_forward", "x");
        controller.record_success();
        controller.record_failure("event_forward", "y");

        assert_eq!(notifier.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_set_paused_fans_out_once() {
        let (controller, _, _) = controller(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        controller.add_pause_callbacks([recording_callback(seen.clone())]);
        let (count, _remover) = counting_listener(&controller);

        controller.set_paused(true).await;
        controller.set_paused(true).await;
        assert_eq!(*seen.lock().unwrap(), vec![true]);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        controller.set_paused_with(true, true, true).await;
        assert_eq!(*seen.lock().unwrap(), vec![true, true]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(controller.paused());
    }

    #[tokio::test]
    async fn test_persist_only_when_stored_value_differs() {
        let (controller, options, _) = controller(3);

        controller.set_paused(false).await;
        assert_eq!(options.writes.load(Ordering::SeqCst), 1);
        assert_eq!(options.stored_paused("entry1"), Some(false));

        controller.set_paused(false).await;
        assert_eq!(options.writes.load(Ordering::SeqCst), 1);

        controller.set_paused(true).await;
        assert_eq!(options.writes.load(Ordering::SeqCst), 2);

        controller.set_paused_with(false, false, false).await;
        assert_eq!(options.writes.load(Ordering::SeqCst), 2);
        assert_eq!(options.stored_paused("entry1"), Some(true));
        assert!(!controller.paused());
    }

    #[tokio::test]
    async fn test_failing_callbacks_are_skipped() {
        let (controller, _, _) = controller(3);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let failing: PauseCallback =
            Arc::new(|_: bool| async { Err::<(), String>("nope".to_string()) }.boxed());
        let panicking: PauseCallback =
            Arc::new(|_: bool| -> BoxFuture<'static, Result<(), String>> {
                panic!("callback exploded")
            });
        controller.add_pause_callbacks([failing, panicking, recording_callback(seen.clone())]);

        controller.set_paused(true).await;
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let (controller, _, _) = controller(3);
        let _bad = controller.add_listener(|| panic!("listener exploded"));
        let (count, _remover) = counting_listener(&controller);

        controller.record_failure("event_forward", "x");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_removal_is_idempotent() {
        let (controller, _, _) = controller(3);
        let (count, remover) = counting_listener(&controller);

        remover.remove();
        remover.remove();
        controller.record_failure("event_forward", "x");

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(controller.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_listeners_may_read_controller() {
        let (controller, _, _) = controller(3);
        let controller = Arc::new(controller);
        let observed = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&controller);
        let sink = observed.clone();
        let _remover = controller.add_listener(move || {
            if let Some(controller) = weak.upgrade() {
                sink.lock()
                    .unwrap()
                    .push((controller.paused(), controller.upstream_available()));
            }
        });

        controller.set_paused(true).await;
        controller.record_failure("event_forward", "x");

        assert_eq!(*observed.lock().unwrap(), vec![(true, true), (true, false)]);
    }
}
