// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport integration traits.
//!
//! The coordination layer never opens sockets or serializes bytes itself. It
//! needs only a best-effort `send(Message) -> bool` primitive, which the
//! embedding application provides by implementing [`Transport`].
//!
//! # Example
//!
//! ```rust,no_run
//! use coordination_engine::transport::{BoxFuture, Transport};
//! use coordination_engine::Message;
//!
//! struct ChannelTransport {
//!     tx: tokio::sync::mpsc::UnboundedSender<Message>,
//! }
//!
//! impl Transport for ChannelTransport {
//!     fn send(&self, message: Message) -> BoxFuture<'_, bool> {
//!         Box::pin(async move { self.tx.send(message).is_ok() })
//!     }
//! }
//! ```

use crate::message::Message;
use crate::messaging::FailureInjector;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Best-effort send primitive.
///
/// `true` means the transport accepted the message. It says nothing about
/// whether the recipient processed it; acknowledgments cover that.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, message: Message) -> BoxFuture<'_, bool>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, message: Message) -> BoxFuture<'_, bool> {
        (**self).send(message)
    }
}

/// Accepts and discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTransport;

impl Transport for NoOpTransport {
    fn send(&self, _message: Message) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }
}

/// Refuses every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingTransport;

impl Transport for FailingTransport {
    fn send(&self, _message: Message) -> BoxFuture<'_, bool> {
        Box::pin(async { false })
    }
}

/// Records every message it is asked to send.
///
/// Acceptance can be toggled at runtime to simulate outages.
#[derive(Debug)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Message>>,
    accept: AtomicBool,
    attempts: AtomicU64,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
            attempts: AtomicU64::new(0),
        }
    }

    /// Accept (`true`) or refuse (`false`) subsequent sends.
    pub fn set_accepting(&self, accept: bool) {
        self.accept.store(accept, Ordering::Release);
    }

    /// Every send attempt, accepted or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Accepted messages, in send order.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Accepted messages addressed to `recipient_id`.
    pub fn sent_to(&self, recipient_id: &str) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.recipient_id.as_deref() == Some(recipient_id))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&self, message: Message) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::AcqRel);
            if !self.accept.load(Ordering::Acquire) {
                return false;
            }
            self.sent.lock().push(message);
            true
        })
    }
}

/// Routes every send through a [`FailureInjector`] before the inner transport.
pub struct ChaosTransport<T: Transport> {
    inner: T,
    injector: Arc<FailureInjector>,
}

impl<T: Transport> ChaosTransport<T> {
    pub fn new(inner: T, injector: Arc<FailureInjector>) -> Self {
        Self { inner, injector }
    }

    pub fn injector(&self) -> &Arc<FailureInjector> {
        &self.injector
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Deliver held and duplicated messages that are due.
    ///
    /// Returns how many the inner transport accepted.
    pub async fn flush_pending(&self) -> usize {
        let mut due = self.injector.process_delayed_messages();
        due.extend(self.injector.take_duplicate_messages());

        let mut accepted = 0;
        for message in due {
            if self.inner.send(message).await {
                accepted += 1;
            }
        }
        accepted
    }
}

impl<T: Transport> Transport for ChaosTransport<T> {
    fn send(&self, message: Message) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut message = message;
            if let Some(failure) = self.injector.should_inject_failure(&message) {
                if self.injector.inject_failure(&mut message, failure).await {
                    return false;
                }
            }
            self.inner.send(message).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::messaging::{FailureRule, FailureType};
    use serde_json::json;

    fn msg() -> Message {
        Message::new(MessageType::Data, "a", json!({})).to("b")
    }

    #[tokio::test]
    async fn test_noop_and_failing() {
        assert!(NoOpTransport.send(msg()).await);
        assert!(!FailingTransport.send(msg()).await);
    }

    #[tokio::test]
    async fn test_recording_transport() {
        let transport = RecordingTransport::new();
        assert!(transport.send(msg()).await);
        transport.set_accepting(false);
        assert!(!transport.send(msg()).await);

        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent_to("b").len(), 1);
        assert!(transport.sent_to("c").is_empty());
    }

    #[tokio::test]
    async fn test_arc_transport_delegates() {
        let shared = Arc::new(RecordingTransport::new());
        let as_transport: Arc<RecordingTransport> = Arc::clone(&shared);
        assert!(as_transport.send(msg()).await);
        assert_eq!(shared.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_chaos_transport_drops_and_passes() {
        let injector = Arc::new(FailureInjector::with_seed(1));
        let chaos = ChaosTransport::new(RecordingTransport::new(), Arc::clone(&injector));

        // Disabled injector passes everything through
        assert!(chaos.send(msg()).await);

        injector.add_rule("drop", FailureRule::new(FailureType::NetworkTimeout, 1.0));
        injector.enable();
        assert!(!chaos.send(msg()).await);
        assert_eq!(chaos.inner().sent().len(), 1);
    }

    #[tokio::test]
    async fn test_chaos_transport_flushes_duplicates() {
        let injector = Arc::new(FailureInjector::with_seed(1));
        injector.add_rule("dup", FailureRule::new(FailureType::DuplicateDelivery, 1.0));
        injector.enable();
        let chaos = ChaosTransport::new(RecordingTransport::new(), Arc::clone(&injector));

        let m = msg();
        assert!(chaos.send(m.clone()).await);
        assert_eq!(chaos.flush_pending().await, 1);

        let sent = chaos.inner().sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|s| s.id == m.id));
    }
}
