// src/events.rs

use tokio::sync::broadcast;

/// Lifecycle notification for a single request, identified by its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Added { target: String },
    Started { target: String },
    Progress {
        target: String,
        downloaded: u64,
        total: Option<u64>,
    },
    Completed { target: String },
    Failed { target: String, error: String },
    Cancelled { target: String },
}

impl DownloadEvent {
    pub fn target(&self) -> &str {
        match self {
            DownloadEvent::Added { target }
            | DownloadEvent::Started { target }
            | DownloadEvent::Progress { target, .. }
            | DownloadEvent::Completed { target }
            | DownloadEvent::Failed { target, .. }
            | DownloadEvent::Cancelled { target } => target,
        }
    }
}

/// In-process publish/subscribe channel for [`DownloadEvent`]s.
///
/// Publishing never blocks: a subscriber that falls more than `capacity` events
/// behind observes `RecvError::Lagged` instead of stalling the scheduler.
/// Dropping a receiver unsubscribes it.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<DownloadEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub(crate) fn publish(&self, event: DownloadEvent) {
        tracing::trace!(?event, "publishing event");
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
