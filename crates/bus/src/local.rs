//! In-process bus built on tokio mpsc mailboxes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use slicepull_protocol::Message;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::{Bus, BusError, SUBSCRIPTION_BUFFER, Subscription};

/// Fan-out bus living inside one process.
///
/// Cloneable and cheap; clones share the same channel table.
#[derive(Clone, Default)]
pub struct LocalBus {
    channels: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Message>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Bus for LocalBus {
    fn publish(&self, channel: &str, msg: Message) -> Result<(), BusError> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subs) = channels.get_mut(channel) else {
            tracing::trace!(channel, msg_type = ?msg.msg_type, "no subscribers, dropping message");
            return Ok(());
        };

        subs.retain(|tx| !tx.is_closed());
        let mut delivered = 0usize;
        let mut full = 0usize;
        for tx in subs.iter() {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(channel, msg_type = ?msg.msg_type, "subscriber mailbox full, dropping message");
                    full += 1;
                }
                // Receiver dropped between retain and send.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        if subs.is_empty() {
            channels.remove(channel);
        }

        // A lagging subscriber must not fail a publish that others received.
        if full > 0 && delivered == 0 {
            return Err(BusError::Full(channel.to_string()));
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Subscription::new(channel.to_string(), rx)
    }
}
