use nostr_sdk::UnsignedEvent;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::groups::Group;
use crate::invites::{Invite, ProcessedInvite};

const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// Signals pushed to the UI bridge. This is the only way state changes leave
/// the core; the bridge holds no references into core state, only the event
/// payloads carried here.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "signal", content = "payload", rename_all = "snake_case")]
pub enum Signal {
    AccountChanging { pubkey: String },
    AccountChanged { pubkey: Option<String> },
    NostrReady,
    MlsMessageReceived { group_id: Vec<u8>, event: UnsignedEvent },
    MlsMessageProcessed { group: Group, event: UnsignedEvent },
    RelayStatus { url: String, status: String },
    InviteAccepted { group_id: String },
    InviteProcessed { invite: Invite },
    InviteFailedToProcess { processed: ProcessedInvite },
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<Signal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.sender.subscribe()
    }

    /// Emits a signal. A send with no live subscribers is not an error; the
    /// bridge may not have attached yet.
    pub fn emit(&self, signal: Signal) {
        tracing::debug!(target: "murmur::signals::emit", "Emitting signal: {:?}", signal);
        let _ = self.sender.send(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Signal::NostrReady);

        match rx.recv().await {
            Ok(Signal::NostrReady) => {}
            other => panic!("Unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let bus = SignalBus::new();
        bus.emit(Signal::AccountChanging {
            pubkey: "abc".to_string(),
        });
    }
}
