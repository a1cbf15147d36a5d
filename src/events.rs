//! Event listeners.
//!
//! Every connection owns an [`Events`] registry. Each inbound event message
//! is handed to every registered [`EventListener`], in registration order,
//! before the reader moves on to the next message. A listener keeps the
//! events it accepts in a FIFO for consumers and in a permanent history.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    future::Future,
    ops::Deref,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use futures_core::Stream;
use tokio::sync::Notify;

use crate::{
    error::{Error, Result},
    message::Message,
};

/// Secondary acceptance predicate for an [`EventListener`].
pub type EventFilter = Box<dyn Fn(&Message) -> bool + Send + Sync>;

/// A filtered, ordered queue of inbound events.
///
/// Listeners are shared as `Arc<EventListener>`: one handle is held by the
/// connection's registry while it is active, the others by consumers.
pub struct EventListener {
    names: HashSet<String>,
    filter: Option<EventFilter>,
    state: Mutex<ListenerState>,
    notify: Notify,
}

#[derive(Default)]
struct ListenerState {
    queue: VecDeque<Message>,
    history: Vec<Message>,
}

impl EventListener {
    /// A listener that accepts every event.
    #[must_use]
    pub fn new() -> Self {
        Self::with_names(std::iter::empty::<String>())
    }

    /// A listener that accepts only the named events.
    ///
    /// An empty set of names accepts every event.
    #[must_use]
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            filter: None,
            state: Mutex::new(ListenerState::default()),
            notify: Notify::new(),
        }
    }

    /// Add a predicate that accepted events must also satisfy.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Event names this listener is restricted to (empty means all).
    #[must_use]
    pub fn names(&self) -> &HashSet<String> {
        &self.names
    }

    /// Whether this listener wants `event`.
    #[must_use]
    pub fn accept(&self, event: &Message) -> bool {
        let name_ok = self.names.is_empty()
            || event
                .event_name()
                .is_some_and(|name| self.names.contains(name));

        name_ok && self.filter.as_ref().is_none_or(|f| f(event))
    }

    /// Offer an event to this listener.
    ///
    /// The registry calls this for every inbound event. Accepted events are
    /// recorded in the history and queued; others are ignored.
    pub fn put(&self, event: &Message) {
        if !self.accept(event) {
            return;
        }

        {
            let mut state = self.lock();
            state.history.push(event.clone());
            state.queue.push_back(event.clone());
        }
        self.notify.notify_one();
    }

    /// Wait for the oldest pending event and remove it from the queue.
    pub async fn get(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_get() {
                return event;
            }
            notified.await;
        }
    }

    /// Remove the oldest pending event, if any, without waiting.
    #[must_use]
    pub fn try_get(&self) -> Option<Message> {
        self.lock().queue.pop_front()
    }

    /// Whether no events are pending.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Drain and return every pending event. History is not affected.
    pub fn clear(&self) -> Vec<Message> {
        self.lock().queue.drain(..).collect()
    }

    /// Every event this listener has ever accepted, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        self.lock().history.clone()
    }

    /// An endless stream of events; each item is one [`get`](Self::get).
    #[must_use]
    pub fn stream(self: &Arc<Self>) -> ListenerStream {
        ListenerStream {
            listener: self.clone(),
            pending: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        // Queue operations never panic while holding the lock; recover the
        // data rather than propagating poison.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EventListener")
            .field("names", &self.names)
            .field("filter", &self.filter.is_some())
            .field("pending", &state.queue.len())
            .field("history", &state.history.len())
            .finish()
    }
}

/// Stream adapter returned by [`EventListener::stream`].
///
/// It never yields `None`; drop it to stop listening.
pub struct ListenerStream {
    listener: Arc<EventListener>,
    pending: Option<Pin<Box<dyn Future<Output = Message> + Send>>>,
}

impl Stream for ListenerStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let fut = this.pending.get_or_insert_with(|| {
            let listener = this.listener.clone();
            Box::pin(async move { listener.get().await })
        });

        let poll = fut.as_mut().poll(cx);
        match poll {
            Poll::Ready(event) => {
                this.pending = None;
                Poll::Ready(Some(event))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for ListenerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerStream")
            .field("listener", &self.listener)
            .finish()
    }
}

/// The set of active listeners for one connection.
pub struct Events {
    default: Arc<EventListener>,
    listeners: Mutex<Vec<Arc<EventListener>>>,
}

impl Events {
    /// A registry holding only the default catch-all listener.
    #[must_use]
    pub fn new() -> Self {
        let default = Arc::new(EventListener::new());
        Self {
            listeners: Mutex::new(vec![default.clone()]),
            default,
        }
    }

    /// The catch-all listener every connection has.
    #[must_use]
    pub fn default_listener(&self) -> &Arc<EventListener> {
        &self.default
    }

    /// Activate `listener`.
    pub fn register_listener(&self, listener: Arc<EventListener>) -> Result<()> {
        let mut listeners = self.lock();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return Err(Error::listener("listener is already registered"));
        }
        listeners.push(listener);
        Ok(())
    }

    /// Deactivate `listener` and drain its pending queue.
    pub fn remove_listener(&self, listener: &Arc<EventListener>) -> Result<()> {
        if Arc::ptr_eq(listener, &self.default) {
            return Err(Error::listener("the default listener cannot be removed"));
        }

        let mut listeners = self.lock();
        let idx = listeners
            .iter()
            .position(|l| Arc::ptr_eq(l, listener))
            .ok_or_else(|| Error::listener("listener is not registered"))?;
        listeners.remove(idx);
        listener.clear();
        Ok(())
    }

    /// Register `listeners` until the returned guard is dropped.
    ///
    /// Registration is all-or-nothing: if any listener is already active,
    /// the ones registered so far are removed again and the error returned.
    pub fn listen<I>(&self, listeners: I) -> Result<ListenerGuard<'_>>
    where
        I: IntoIterator<Item = Arc<EventListener>>,
    {
        let mut guard = ListenerGuard {
            events: self,
            listeners: Vec::new(),
        };
        for listener in listeners {
            self.register_listener(listener.clone())?;
            guard.listeners.push(listener);
        }
        Ok(guard)
    }

    /// Create, register and guard a listener for the named events.
    pub fn listener<I, S>(&self, names: I) -> Result<ListenerGuard<'_>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listen([Arc::new(EventListener::with_names(names))])
    }

    /// Deliver `event` to every active listener, in registration order.
    pub fn dispatch(&self, event: &Message) {
        for listener in self.lock().iter() {
            listener.put(event);
        }
    }

    /// Number of active listeners, including the default.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Always `false`: the default listener is permanent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<EventListener>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Scoped registration of one or more listeners.
///
/// Dereferences to the guarded listeners; dropping it removes (and drains)
/// each of them.
#[must_use = "listeners are removed as soon as the guard is dropped"]
pub struct ListenerGuard<'a> {
    events: &'a Events,
    listeners: Vec<Arc<EventListener>>,
}

impl ListenerGuard<'_> {
    /// The first guarded listener.
    ///
    /// # Panics
    ///
    /// Panics if the guard was created from an empty set of listeners.
    #[must_use]
    pub fn listener(&self) -> &Arc<EventListener> {
        &self.listeners[0]
    }
}

impl Deref for ListenerGuard<'_> {
    type Target = [Arc<EventListener>];

    fn deref(&self) -> &Self::Target {
        &self.listeners
    }
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        for listener in &self.listeners {
            let _ = self.events.remove_listener(listener);
        }
    }
}

impl fmt::Debug for ListenerGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.listeners.iter()).finish()
    }
}
