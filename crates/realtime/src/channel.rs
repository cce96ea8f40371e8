use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::Subscriber;

pub const OUTBOUND_CHANNEL_SIZE: usize = 64;

pub type OutboundSender = mpsc::Sender<Arc<[u8]>>;
pub type OutboundReceiver = mpsc::Receiver<Arc<[u8]>>;

#[must_use]
pub fn outbound_channel() -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(OUTBOUND_CHANNEL_SIZE)
}

/// Subscriber backed by a bounded channel drained by the connection's writer.
///
/// A full channel counts as a failed send, so a client that stops reading is
/// evicted on the next delivery.
pub struct ChannelSubscriber {
    connection_id: String,
    client_instance_id: String,
    outbound: OutboundSender,
    closed: Arc<AtomicBool>,
}

impl ChannelSubscriber {
    #[must_use]
    pub fn new(connection_id: String, client_instance_id: String, outbound: OutboundSender) -> Self {
        Self {
            connection_id,
            client_instance_id,
            outbound,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle the connection owner uses to mark the subscriber dead.
    #[must_use]
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl Subscriber for ChannelSubscriber {
    fn send(&self, payload: Arc<[u8]>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.try_send(payload).is_ok()
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn client_instance_id(&self) -> &str {
        &self.client_instance_id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) || self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::{outbound_channel, ChannelSubscriber};
    use crate::broker::Subscriber;

    #[tokio::test]
    async fn send_queues_payload_until_receiver_drops() {
        let (sender, mut receiver) = outbound_channel();
        let subscriber = ChannelSubscriber::new("conn-1".to_owned(), "instance-a".to_owned(), sender);

        assert!(subscriber.send(Arc::from(b"hello".to_vec())));
        assert_eq!(receiver.recv().await.as_deref(), Some(&b"hello"[..]));

        drop(receiver);
        assert!(subscriber.is_closed());
        assert!(!subscriber.send(Arc::from(b"lost".to_vec())));
    }

    #[tokio::test]
    async fn full_channel_fails_send() {
        let (sender, _receiver) = mpsc::channel(1);
        let subscriber = ChannelSubscriber::new("conn-1".to_owned(), "instance-a".to_owned(), sender);

        assert!(subscriber.send(Arc::from(b"first".to_vec())));
        assert!(!subscriber.send(Arc::from(b"second".to_vec())));
    }

    #[tokio::test]
    async fn closed_flag_marks_subscriber_dead() {
        let (sender, _receiver) = outbound_channel();
        let subscriber = ChannelSubscriber::new("conn-1".to_owned(), "instance-a".to_owned(), sender);

        subscriber.closed_flag().store(true, Ordering::Relaxed);
        assert!(subscriber.is_closed());
        assert!(!subscriber.send(Arc::from(b"late".to_vec())));
    }
}
