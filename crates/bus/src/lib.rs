//! Publish/subscribe bus connecting uploaders and the ingest server.
//!
//! The protocol only needs two primitives: publish a [`Message`] on a
//! named channel, and subscribe to a channel as a mailbox. Delivery is
//! ordered per channel; receivers must tolerate redelivery.

mod local;

pub use local::LocalBus;

use slicepull_protocol::Message;
use tokio::sync::mpsc;

/// Mailbox capacity of each subscription.
///
/// The protocol keeps at most one chunk in flight per session, so a
/// channel rarely holds more than a couple of messages.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Errors produced when publishing.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("subscriber mailbox full on channel {0}")]
    Full(String),

    #[error("bus closed")]
    Closed,
}

/// A message-oriented transport addressed by channel name.
pub trait Bus: Send + Sync + 'static {
    /// Delivers `msg` to every current subscriber of `channel`.
    ///
    /// Publishing to a channel nobody listens on is not an error; the
    /// message is dropped. A full mailbox only fails the publish when
    /// no subscriber received the message.
    fn publish(&self, channel: &str, msg: Message) -> Result<(), BusError>;

    /// Opens a mailbox receiving every later message on `channel`.
    fn subscribe(&self, channel: &str) -> Subscription;
}

/// Receiving end of a channel subscription.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(channel: String, rx: mpsc::Receiver<Message>) -> Self {
        Self { channel, rx }
    }

    /// Waits for the next message; `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Returns a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}
