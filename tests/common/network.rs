//! Transports with controllable behavior, and a pump between routers.

use coordination_engine::messaging::ReceiveOutcome;
use coordination_engine::transport::{BoxFuture, RecordingTransport, Transport};
use coordination_engine::{Message, ReliableMessageRouter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Refuses the first `failures` sends, then accepts and records everything.
pub struct FlakyTransport {
    remaining_failures: AtomicU32,
    refused: AtomicU32,
    pub inner: RecordingTransport,
}

impl FlakyTransport {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            refused: AtomicU32::new(0),
            inner: RecordingTransport::new(),
        }
    }

    pub fn refused(&self) -> u32 {
        self.refused.load(Ordering::SeqCst)
    }
}

impl Transport for FlakyTransport {
    fn send(&self, message: Message) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let failing = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                self.refused.fetch_add(1, Ordering::SeqCst);
                return false;
            }
            self.inner.send(message).await
        })
    }
}

/// Deliver everything `sender_wire` recorded to `receiver`, then route the
/// receiver's acknowledgments back to `sender`.
///
/// Returns how many messages the receiver accepted as new.
pub async fn pump<A: Transport, B: Transport>(
    sender: &ReliableMessageRouter<A>,
    sender_wire: &RecordingTransport,
    receiver: &ReliableMessageRouter<B>,
    receiver_wire: &RecordingTransport,
) -> usize {
    let mut accepted = 0;
    for message in sender_wire.sent() {
        if receiver.receive_message(&message).await == ReceiveOutcome::Accepted {
            accepted += 1;
        }
    }
    sender_wire.clear();

    for ack in receiver_wire.sent() {
        sender.handle_acknowledgment(&ack);
    }
    receiver_wire.clear();
    accepted
}

/// A recording transport shared between a component and the test.
pub fn shared_wire() -> Arc<RecordingTransport> {
    Arc::new(RecordingTransport::new())
}
