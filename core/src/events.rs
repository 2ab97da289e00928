use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Severity attached to alert events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// Events pushed by the core to external consumers (API, P2P, explorers).
/// Consumers subscribe through [`EventBus::subscribe`]; a slow consumer only
/// loses its own backlog, never blocks the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    BlockAdded {
        index: u64,
        hash: String,
        miner: String,
        reward: u64,
        tx_count: usize,
    },
    TxAdmitted {
        txid: String,
        fee_rate: u64,
    },
    TxRejected {
        reason: String,
        txid: Option<String>,
    },
    ChainReorg {
        fork_point: u64,
        old_tip: String,
        new_tip: String,
    },
    NeedBlock {
        hash: String,
    },
    Alert {
        name: String,
        message: String,
        level: AlertLevel,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Fire-and-forget publish. A send error only means nobody is listening.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
