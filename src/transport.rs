//! Named-queue transport seam.
//!
//! The broker and its subscribers exchange frame messages over named
//! FIFO queues with at-least-once delivery, receive-with-timeout, and
//! optional per-message time-to-live. The concrete queue system (MSMQ,
//! a broker topic per subscriber, ...) sits behind the [`Transport`]
//! trait; [`MemoryTransport`] is the in-process implementation used by
//! tests and embedders.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Transport failure taxonomy.
///
/// `QueueNotFound` and `QueueDeleted` are recoverable by lazy queue
/// recreation; they must never crash a receive loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("receive timed out")]
    Timeout,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("queue deleted: {0}")]
    QueueDeleted(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// A transport message: opaque frame bytes plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Free-form label carried alongside the body.
    pub label: String,
    /// Frame-encoded body.
    pub body: Vec<u8>,
    /// Drop the message if not received within this window.
    pub ttl: Option<Duration>,
}

impl QueueMessage {
    pub fn new(label: &str, body: Vec<u8>) -> QueueMessage {
        QueueMessage {
            label: label.to_string(),
            body,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> QueueMessage {
        self.ttl = Some(ttl);
        self
    }
}

/// Named FIFO queues with timeout receive.
pub trait Transport: Send + Sync {
    /// Create a queue; succeeds if it already exists.
    fn create_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Delete a queue and discard its backlog.
    fn delete_queue(&self, name: &str) -> Result<(), TransportError>;

    fn queue_exists(&self, name: &str) -> bool;

    fn send(&self, queue: &str, message: QueueMessage) -> Result<(), TransportError>;

    /// Receive the oldest live message, waiting up to `timeout`.
    fn receive(&self, queue: &str, timeout: Duration) -> Result<QueueMessage, TransportError>;
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<(Instant, QueueMessage)>>,
    /// Queues deleted while a receiver might still be looping on them;
    /// the next receive reports `QueueDeleted` once, then `QueueNotFound`.
    deleted: HashSet<String>,
}

/// In-process [`Transport`] backed by plain queues.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<(Mutex<State>, Condvar)>,
}

impl MemoryTransport {
    pub fn new() -> MemoryTransport {
        MemoryTransport::default()
    }

    /// Number of messages currently queued (test helper).
    pub fn backlog(&self, queue: &str) -> usize {
        let state = self.inner.0.lock();
        state.queues.get(queue).map_or(0, |q| q.len())
    }
}

impl Transport for MemoryTransport {
    fn create_queue(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.inner.0.lock();
        state.deleted.remove(name);
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.inner.0.lock();
        match state.queues.remove(name) {
            Some(_) => {
                state.deleted.insert(name.to_string());
                self.inner.1.notify_all();
                Ok(())
            }
            None => Err(TransportError::QueueNotFound(name.to_string())),
        }
    }

    fn queue_exists(&self, name: &str) -> bool {
        self.inner.0.lock().queues.contains_key(name)
    }

    fn send(&self, queue: &str, message: QueueMessage) -> Result<(), TransportError> {
        let mut state = self.inner.0.lock();
        match state.queues.get_mut(queue) {
            Some(q) => {
                q.push_back((Instant::now(), message));
                self.inner.1.notify_all();
                Ok(())
            }
            None => Err(TransportError::QueueNotFound(queue.to_string())),
        }
    }

    fn receive(&self, queue: &str, timeout: Duration) -> Result<QueueMessage, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.0.lock();

        loop {
            if state.deleted.remove(queue) {
                return Err(TransportError::QueueDeleted(queue.to_string()));
            }
            match state.queues.get_mut(queue) {
                None => return Err(TransportError::QueueNotFound(queue.to_string())),
                Some(q) => {
                    // expire messages past their TTL before delivering
                    while let Some((enqueued, msg)) = q.front() {
                        match msg.ttl {
                            Some(ttl) if enqueued.elapsed() > ttl => {
                                q.pop_front();
                            }
                            _ => break,
                        }
                    }
                    if let Some((_, msg)) = q.pop_front() {
                        return Ok(msg);
                    }
                }
            }

            if self
                .inner
                .1
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(TransportError::Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_delivery() {
        let t = MemoryTransport::new();
        t.create_queue("q").unwrap();
        t.send("q", QueueMessage::new("a", vec![1])).unwrap();
        t.send("q", QueueMessage::new("b", vec![2])).unwrap();

        assert_eq!(t.receive("q", Duration::ZERO).unwrap().label, "a");
        assert_eq!(t.receive("q", Duration::ZERO).unwrap().label, "b");
        assert_eq!(
            t.receive("q", Duration::from_millis(5)),
            Err(TransportError::Timeout)
        );
    }

    #[test]
    fn test_missing_and_deleted_queues() {
        let t = MemoryTransport::new();
        assert_eq!(
            t.send("q", QueueMessage::new("a", vec![])),
            Err(TransportError::QueueNotFound("q".to_string()))
        );
        assert_eq!(
            t.receive("q", Duration::ZERO),
            Err(TransportError::QueueNotFound("q".to_string()))
        );

        t.create_queue("q").unwrap();
        assert!(t.queue_exists("q"));
        t.delete_queue("q").unwrap();
        assert!(!t.queue_exists("q"));

        // first receive after deletion reports the deletion, then not-found
        assert_eq!(
            t.receive("q", Duration::ZERO),
            Err(TransportError::QueueDeleted("q".to_string()))
        );
        assert_eq!(
            t.receive("q", Duration::ZERO),
            Err(TransportError::QueueNotFound("q".to_string()))
        );

        // create is idempotent and clears the deleted marker
        t.create_queue("q").unwrap();
        t.create_queue("q").unwrap();
        assert_eq!(
            t.receive("q", Duration::from_millis(5)),
            Err(TransportError::Timeout)
        );
    }

    #[test]
    fn test_ttl_expires_messages() {
        let t = MemoryTransport::new();
        t.create_queue("q").unwrap();
        t.send(
            "q",
            QueueMessage::new("stale", vec![1]).with_ttl(Duration::from_millis(5)),
        )
        .unwrap();
        t.send("q", QueueMessage::new("live", vec![2])).unwrap();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(t.receive("q", Duration::ZERO).unwrap().label, "live");
    }

    #[test]
    fn test_receive_wakes_on_send() {
        let t = MemoryTransport::new();
        t.create_queue("q").unwrap();
        let t2 = t.clone();
        let handle = thread::spawn(move || t2.receive("q", Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(10));
        t.send("q", QueueMessage::new("x", vec![])).unwrap();
        assert_eq!(handle.join().unwrap().unwrap().label, "x");
    }
}
