//! Multicast event streams.
//!
//! A `Topic` hands every subscriber its own unbounded channel. Each subscriber sees
//! every value emitted after it subscribed, in emission order, and emitting never
//! waits on a slow subscriber. Subscribing is synchronous, so a subscription taken
//! before a process starts is guaranteed to observe all of that process's events.
//!
//! Taps are the synchronous counterpart: they run on the emitting task, before any
//! subscriber channel receives the value.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

type Tap<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    taps: Vec<Tap<T>>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

/// A multicast stream of `T` values.
pub struct Topic<T> {
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        f.debug_struct("Topic")
            .field("taps", &listeners.taps.len())
            .field("subscribers", &listeners.subscribers.len())
            .finish()
    }
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                taps: Vec::new(),
                subscribers: Vec::new(),
            })),
        }
    }
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to every value emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().subscribers.push(tx);
        rx
    }

    /// Runs `observer` inside every later `emit`, ahead of the subscriber channels.
    ///
    /// Whatever the observer does is complete by the time any subscriber can see the
    /// value. Observers must not block.
    pub fn tap<F>(&self, observer: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listeners.lock().taps.push(Arc::new(observer));
    }

    /// Runs the taps, then delivers `value` to all live subscribers, forgetting the
    /// ones that went away.
    pub fn emit(&self, value: T) {
        let taps = self.listeners.lock().taps.clone();
        for tap in &taps {
            tap(&value);
        }
        self.listeners
            .lock()
            .subscribers
            .retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Returns whether two handles point at the same stream.
    pub fn same_as(&self, other: &Topic<T>) -> bool {
        Arc::ptr_eq(&self.listeners, &other.listeners)
    }

    /// Creates a new topic fed by this one through `transform`.
    ///
    /// The subscription to `self` is taken before this returns; values for which
    /// `transform` returns `None` are dropped.
    pub fn derive<U, F>(&self, mut transform: F) -> Topic<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        let derived = Topic::new();
        let output = derived.clone();
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                if let Some(mapped) = transform(value) {
                    output.emit(mapped);
                }
            }
        });
        derived
    }
}

/// Merges several topics into one receiver, tagging each value with its topic's position.
pub fn merge<T: Clone + Send + 'static>(topics: &[Topic<T>]) -> mpsc::UnboundedReceiver<(usize, T)> {
    let (tx, rx) = mpsc::unbounded_channel();
    for (slot, topic) in topics.iter().enumerate() {
        let mut source = topic.subscribe();
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(value) = source.recv().await {
                if tx.send((slot, value)).is_err() {
                    break;
                }
            }
        });
    }
    rx
}
