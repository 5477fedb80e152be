//! This module provides typed notification features.
//!
//! Every component publishing notifications owns an [`Emitter`] over a closed event enum, so there is no way to subscribe
//! to an event name that does not exist. A [`Subscription`] is a listener registration: it is released as soon as it is
//! dropped, which keeps the number of registered listeners exact even across concurrent one-shot waiters.

use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

type ListenerId = u64;

#[derive(Debug)]
struct Listeners<E> {
    next_id: ListenerId,
    senders: Vec<(ListenerId, mpsc::UnboundedSender<E>)>,
}

/// A multi-listener event dispatcher.
///
/// Events are delivered in emission order to every listener registered at emission time. Listeners never lag: each one is
/// backed by its own unbounded channel.
#[derive(Debug)]
pub struct Emitter<E> {
    listeners: Arc<Mutex<Listeners<E>>>,
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                senders: Vec::new(),
            })),
        }
    }
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new listener.
    pub fn subscribe(&self) -> Subscription<E> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut listeners = self.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.senders.push((id, sender));

        Subscription {
            id,
            receiver,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Dispatch `event` to every registered listener.
    ///
    /// Returns `false` when nobody listens.
    pub fn emit(&self, event: E) -> bool {
        let mut listeners = self.listeners.lock().unwrap();

        listeners.senders.retain(|(_, sender)| sender.send(event.clone()).is_ok());

        !listeners.senders.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().senders.len()
    }

    /// Release every listener. Pending subscriptions will then yield `None` once drained.
    pub fn clear(&self) {
        self.listeners.lock().unwrap().senders.clear();
    }
}

/// A listener registration on an [`Emitter`].
#[derive(Debug)]
pub struct Subscription<E> {
    id: ListenerId,
    receiver: mpsc::UnboundedReceiver<E>,
    listeners: Weak<Mutex<Listeners<E>>>,
}

impl<E> Subscription<E> {
    /// Wait for the next event, `None` once the emitter has been cleared or dropped.
    #[inline]
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    /// Take the next already delivered event without waiting.
    #[inline]
    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    /// Wait for the first event for which `f` returns `Some`.
    pub async fn find_map<T>(&mut self, mut f: impl FnMut(E) -> Option<T>) -> Option<T> {
        while let Some(event) = self.recv().await {
            if let Some(output) = f(event) {
                return Some(output);
            }
        }

        None
    }
}

impl<E> Stream for Subscription<E> {
    type Item = E;

    #[inline]
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.receiver.poll_recv(cx)
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut listeners) = listeners.lock() {
                listeners.senders.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Ping(u8),
        Pong,
    }

    #[tokio::test]
    async fn test_emit_to_all_listeners() {
        let emitter = Emitter::new();
        let mut first = emitter.subscribe();
        let mut second = emitter.subscribe();

        assert!(emitter.emit(Event::Ping(1)));
        assert!(emitter.emit(Event::Pong));

        assert_eq!(first.recv().await, Some(Event::Ping(1)));
        assert_eq!(first.recv().await, Some(Event::Pong));
        assert_eq!(second.next().await, Some(Event::Ping(1)));
    }

    #[test]
    fn test_emit_without_listener() {
        let emitter = Emitter::new();

        assert!(!emitter.emit(Event::Pong));
    }

    #[test]
    fn test_drop_releases_listener() {
        let emitter = Emitter::<Event>::new();
        let first = emitter.subscribe();
        let second = emitter.subscribe();
        assert_eq!(emitter.listener_count(), 2);

        drop(first);
        assert_eq!(emitter.listener_count(), 1);
        drop(second);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_ends_subscriptions() {
        let emitter = Emitter::new();
        let mut subscription = emitter.subscribe();

        emitter.emit(Event::Ping(2));
        emitter.clear();

        assert_eq!(emitter.listener_count(), 0);
        assert_eq!(subscription.recv().await, Some(Event::Ping(2)));
        assert_eq!(subscription.recv().await, None);
    }

    #[tokio::test]
    async fn test_find_map() {
        let emitter = Emitter::new();
        let mut subscription = emitter.subscribe();

        for i in 0..5 {
            emitter.emit(Event::Ping(i));
        }

        let found = subscription
            .find_map(|event| match event {
                Event::Ping(i) if i > 2 => Some(i),
                _ => None,
            })
            .await;

        assert_eq!(found, Some(3));
    }
}
