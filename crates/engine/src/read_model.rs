use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Notify;

use crate::activation::Activation;
use crate::phase::LoadingPhase;
use crate::turn::{Artifact, Turn};

/// Immutable view handed to presentation.
///
/// Every field comes from the same publish, so a reader never observes a
/// ledger from one event paired with the phase from another.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadModel {
    pub revision: u64,
    pub activation: Option<Activation>,
    pub turns: Arc<[Turn]>,
    pub phase: LoadingPhase,
    pub is_loading: bool,
    /// False until the activation's history snapshot has been applied.
    pub is_seeded: bool,
    pub artifact: Option<Artifact>,
}

impl Default for ReadModel {
    fn default() -> Self {
        Self {
            revision: 0,
            activation: None,
            turns: Arc::from(Vec::<Turn>::new()),
            phase: LoadingPhase::Idle,
            is_loading: false,
            is_seeded: false,
            artifact: None,
        }
    }
}

struct Shared {
    current: ArcSwap<ReadModel>,
    changed: Notify,
}

/// Write side of the read model, owned by the reconciliation context.
#[derive(Clone)]
pub struct ReadModelPublisher {
    shared: Arc<Shared>,
}

impl Default for ReadModelPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadModelPublisher {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                current: ArcSwap::from_pointee(ReadModel::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn reader(&self) -> ReadModelReader {
        ReadModelReader {
            shared: self.shared.clone(),
        }
    }

    /// Stores `model` with the next revision number and wakes readers.
    pub fn publish(&self, mut model: ReadModel) {
        model.revision = self.shared.current.load().revision.saturating_add(1);
        self.shared.current.store(Arc::new(model));
        self.shared.changed.notify_waiters();
    }

    pub fn load(&self) -> Arc<ReadModel> {
        self.shared.current.load_full()
    }
}

/// Read side of the read model; cannot publish.
#[derive(Clone)]
pub struct ReadModelReader {
    shared: Arc<Shared>,
}

impl ReadModelReader {
    pub fn load(&self) -> Arc<ReadModel> {
        self.shared.current.load_full()
    }

    /// Resolves once a revision newer than `seen` has been published.
    pub async fn changed_since(&self, seen: u64) -> Arc<ReadModel> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            // Register interest before checking so a publish in between is not lost.
            notified.as_mut().enable();

            let current = self.load();
            if current.revision > seen {
                return current;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::Turn;

    #[test]
    fn publish_bumps_revision_and_replaces_the_whole_view() {
        let publisher = ReadModelPublisher::new();
        let reader = publisher.reader();

        publisher.publish(ReadModel {
            turns: Arc::from(vec![Turn::user("hi")]),
            phase: LoadingPhase::Connecting,
            is_loading: true,
            ..ReadModel::default()
        });

        let view = reader.load();
        assert_eq!(view.revision, 1);
        assert_eq!(view.turns.len(), 1);
        assert!(view.is_loading);
    }

    #[tokio::test]
    async fn changed_since_wakes_on_a_later_publish() {
        let publisher = ReadModelPublisher::new();
        let reader = publisher.reader();

        let waiter = tokio::spawn(async move { reader.changed_since(0).await.revision });
        tokio::task::yield_now().await;
        publisher.publish(ReadModel::default());

        assert_eq!(waiter.await.expect("waiter task"), 1);
    }
}
