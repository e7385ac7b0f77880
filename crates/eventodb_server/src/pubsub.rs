//! In-process publish/subscribe hub.
//!
//! Fan-out of [`WriteEvent`]s to SSE subscribers. Subscribers register a
//! bounded channel under a key (one stream, one category, or a whole
//! namespace); `publish` never blocks: a subscriber whose channel is full
//! loses that event and keeps receiving later ones. This hub is the only
//! place that decides a subscriber is too slow; writers are never stalled
//! by a reader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use eventodb::{category, WriteEvent};
use tokio::sync::mpsc;
use tracing::debug;

/// Per-subscriber channel capacity.
const SUBSCRIBER_BUFFER: usize = 100;

/// What a subscriber listens to, within its namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionKind {
    Stream(String),
    Category(String),
    All,
}

type Senders = HashMap<u64, mpsc::Sender<WriteEvent>>;

#[derive(Default)]
struct Registry {
    stream_subs: HashMap<(String, String), Senders>,
    category_subs: HashMap<(String, String), Senders>,
    all_subs: HashMap<String, Senders>,
}

#[derive(Default)]
pub struct Hub {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Hub::default())
    }

    /// Registers a subscriber. Deregistration happens when the returned
    /// [`Subscription`] is dropped, so an SSE task that unwinds still
    /// cleans up after itself.
    pub fn subscribe(
        self: &Arc<Self>,
        namespace: &str,
        kind: SubscriptionKind,
    ) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.registry.write().expect("pubsub lock poisoned");
        match &kind {
            SubscriptionKind::Stream(stream) => {
                registry
                    .stream_subs
                    .entry((namespace.to_owned(), stream.clone()))
                    .or_default()
                    .insert(id, sender);
            }
            SubscriptionKind::Category(category) => {
                registry
                    .category_subs
                    .entry((namespace.to_owned(), category.clone()))
                    .or_default()
                    .insert(id, sender);
            }
            SubscriptionKind::All => {
                registry
                    .all_subs
                    .entry(namespace.to_owned())
                    .or_default()
                    .insert(id, sender);
            }
        }
        drop(registry);

        Subscription {
            hub: Arc::clone(self),
            namespace: namespace.to_owned(),
            kind,
            id,
            receiver,
        }
    }

    /// Non-blocking fan-out to every matching subscriber.
    pub fn publish(&self, event: &WriteEvent) {
        let registry = self.registry.read().expect("pubsub lock poisoned");
        let mut dropped = 0usize;

        let targets = [
            registry
                .stream_subs
                .get(&(event.namespace.clone(), event.stream.clone())),
            registry
                .category_subs
                .get(&(event.namespace.clone(), category(&event.stream).to_owned())),
            registry.all_subs.get(&event.namespace),
        ];
        for senders in targets.into_iter().flatten() {
            for sender in senders.values() {
                if sender.try_send(event.clone()).is_err() {
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            debug!(
                namespace = %event.namespace,
                stream = %event.stream,
                dropped,
                "dropped poke for slow subscribers"
            );
        }
    }

    fn unsubscribe(&self, namespace: &str, kind: &SubscriptionKind, id: u64) {
        let mut registry = self.registry.write().expect("pubsub lock poisoned");
        let senders = match kind {
            SubscriptionKind::Stream(stream) => registry
                .stream_subs
                .get_mut(&(namespace.to_owned(), stream.clone())),
            SubscriptionKind::Category(category) => registry
                .category_subs
                .get_mut(&(namespace.to_owned(), category.clone())),
            SubscriptionKind::All => registry.all_subs.get_mut(namespace),
        };
        if let Some(senders) = senders {
            senders.remove(&id);
        }

        // Drop empty key entries so the maps track live keys only.
        match kind {
            SubscriptionKind::Stream(stream) => {
                let key = (namespace.to_owned(), stream.clone());
                if registry.stream_subs.get(&key).is_some_and(Senders::is_empty) {
                    registry.stream_subs.remove(&key);
                }
            }
            SubscriptionKind::Category(category) => {
                let key = (namespace.to_owned(), category.clone());
                if registry.category_subs.get(&key).is_some_and(Senders::is_empty) {
                    registry.category_subs.remove(&key);
                }
            }
            SubscriptionKind::All => {
                if registry.all_subs.get(namespace).is_some_and(Senders::is_empty) {
                    registry.all_subs.remove(namespace);
                }
            }
        }
    }
}

/// A live registration; receives matching events until dropped.
pub struct Subscription {
    hub: Arc<Hub>,
    namespace: String,
    kind: SubscriptionKind,
    id: u64,
    pub receiver: mpsc::Receiver<WriteEvent>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.namespace, &self.kind, self.id);
    }
}
