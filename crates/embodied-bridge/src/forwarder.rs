//! Forwarding of exposed state changes
//!
//! The forwarder subscribes to every state change while it has a non-empty
//! exposure filter and is not paused. Each allowed change becomes one POST to
//! the upstream endpoint, run as its own task; the outcome is reported to the
//! autonomy controller and fired as an `aiembodied.update_forwarded` audit.

use dashmap::DashSet;
use embodied_client::UpstreamClient;
use embodied_core::{domain_of, State};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::autonomy::{AutonomyController, PauseCallback};
use crate::constants::{EVENT_UPDATE_FORWARDED, SOURCE_EVENT_FORWARD};
use crate::exposure::ExposureFilter;
use crate::host::{AreaResolver, AuditSink, StateChange, StateChangeSource, Subscription};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Entity ids published by the bridge itself, across all entries.
///
/// Clones share one set; forwarders never send these upstream.
#[derive(Debug, Clone, Default)]
pub struct BridgeEntities(Arc<DashSet<String>>);

impl BridgeEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I, S>(&self, entity_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entity_id in entity_ids {
            self.0.insert(entity_id.as_ref().to_lowercase());
        }
    }

    pub fn remove<I, S>(&self, entity_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entity_id in entity_ids {
            self.0.remove(&entity_id.as_ref().to_lowercase());
        }
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.0.contains(&entity_id.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Collaborators of a forwarder
#[derive(Clone)]
pub struct ForwarderDeps {
    pub source: Arc<dyn StateChangeSource>,
    pub client: Arc<dyn UpstreamClient>,
    pub audit: Arc<dyn AuditSink>,
    pub areas: Arc<dyn AreaResolver>,
    pub autonomy: Option<Arc<AutonomyController>>,
}

struct Inner {
    entry_id: String,
    filter: ExposureFilter,
    excluded: BridgeEntities,
    deps: ForwarderDeps,
    paused: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct StateChangeForwarder {
    inner: Arc<Inner>,
}

impl StateChangeForwarder {
    pub fn new(
        entry_id: impl Into<String>,
        filter: ExposureFilter,
        excluded: BridgeEntities,
        deps: ForwarderDeps,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                entry_id: entry_id.into(),
                filter,
                excluded,
                deps,
                paused: AtomicBool::new(false),
                subscription: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn filter(&self) -> &ExposureFilter {
        &self.inner.filter
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.inner.subscription).is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Start listening. Does nothing with an empty filter or when already
    /// subscribed.
    pub fn setup(&self) {
        if self.inner.filter.is_empty() {
            debug!(entry_id = %self.inner.entry_id, "No exposed entities, not subscribing");
            return;
        }
        Inner::subscribe(&self.inner);
    }

    /// Stop listening. In-flight forwards keep running.
    pub fn shutdown(&self) {
        self.inner.unsubscribe();
    }

    /// Pause or resume forwarding; a repeated value is a no-op
    pub fn set_paused(&self, paused: bool) {
        if self.inner.paused.swap(paused, Ordering::SeqCst) == paused {
            return;
        }
        if paused {
            self.inner.unsubscribe();
        } else if !self.inner.filter.is_empty() {
            Inner::subscribe(&self.inner);
        }
    }

    /// Pause callback for the autonomy controller
    pub fn pause_callback(self: &Arc<Self>) -> PauseCallback {
        let forwarder = Arc::downgrade(self);
        Arc::new(move |paused: bool| {
            if let Some(forwarder) = forwarder.upgrade() {
                forwarder.set_paused(paused);
            }
            async { Ok::<(), String>(()) }.boxed()
        })
    }

    /// Number of forwards spawned and not yet finished
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.tasks)
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Wait for every forward spawned so far
    pub fn drain(&self) -> BoxFuture<'static, ()> {
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        async move {
            for task in tasks {
                if let Err(err) = task.await {
                    warn!(error = %err, "Forward task failed");
                }
            }
        }
        .boxed()
    }
}

impl Inner {
    fn subscribe(this: &Arc<Self>) {
        let mut subscription = lock(&this.subscription);
        if subscription.is_some() {
            return;
        }

        let inner = this.clone();
        *subscription = Some(
            this.deps
                .source
                .subscribe_state_changes(Arc::new(move |change: StateChange| {
                    inner.handle_state_change(change)
                })),
        );
        debug!(entry_id = %this.entry_id, "Subscribed to state changes");
    }

    fn unsubscribe(&self) {
        let subscription = lock(&self.subscription).take();
        if let Some(subscription) = subscription {
            subscription.cancel();
            debug!(entry_id = %self.entry_id, "Unsubscribed from state changes");
        }
    }

    fn handle_state_change(self: &Arc<Self>, change: StateChange) {
        if change.entity_id.is_empty() || !self.filter.allows(&change.entity_id) {
            return;
        }
        if self.excluded.contains(&change.entity_id) {
            trace!(entity_id = %change.entity_id, "Skipping bridge status entity");
            return;
        }
        if self.paused.load(Ordering::SeqCst) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(entity_id = %change.entity_id, "No runtime available, dropping update");
            return;
        };

        let area = self.deps.areas.area_for(&change.entity_id);
        let payload = build_payload(&self.entry_id, &change, area);

        let inner = self.clone();
        let task = runtime.spawn(async move { inner.forward(change.entity_id, payload).await });

        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    async fn forward(&self, entity_id: String, payload: Value) {
        let domain = domain_of(&entity_id).to_string();
        let mut audit = json!({
            "entry_id": self.entry_id,
            "entity_id": entity_id,
            "domain": domain,
        });

        match self.deps.client.post_json(&payload).await {
            Ok(_) => {
                audit["success"] = Value::Bool(true);
                if let Some(autonomy) = &self.deps.autonomy {
                    autonomy.record_success();
                }
            }
            Err(err) => {
                let message = err.to_string();
                warn!(entity_id = %entity_id, error = %message, "Failed to forward update");
                audit["success"] = Value::Bool(false);
                audit["error"] = Value::String(message.clone());
                if let Some(autonomy) = &self.deps.autonomy {
                    autonomy.record_failure(SOURCE_EVENT_FORWARD, &message);
                }
            }
        }

        self.deps.audit.audit(EVENT_UPDATE_FORWARDED, audit);
    }
}

/// Build the `state_changed` payload for one change
pub fn build_payload(entry_id: &str, change: &StateChange, area: Option<String>) -> Value {
    let friendly_name = [&change.new_state, &change.old_state]
        .into_iter()
        .flatten()
        .find_map(State::name);

    let mut data = Map::new();
    data.insert("entry_id".into(), json!(entry_id));
    data.insert("entity_id".into(), json!(change.entity_id));
    data.insert("domain".into(), json!(domain_of(&change.entity_id)));
    data.insert("friendly_name".into(), json!(friendly_name));
    data.insert("area".into(), json!(area));
    data.insert(
        "state".into(),
        json!({
            "old": change.old_state.as_ref().map(State::snapshot),
            "new": change.new_state.as_ref().map(State::snapshot),
        }),
    );
    if let Some(context) = change.context.to_compact_json() {
        data.insert("context".into(), context);
    }

    json!({
        "type": "event",
        "event": "state_changed",
        "data": data,
    })
}
