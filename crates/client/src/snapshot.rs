use chatwire_engine::{SessionId, Snapshot};

use crate::error::FetchResult;
use crate::http::ApiEndpoint;
use crate::wire::{FileBody, MessageRow, MessagesBody};

/// Fetches the authoritative history and attached file of a session.
///
/// Holds no state between calls; seeding the ledger at most once per
/// activation is the reconciler's job.
#[derive(Debug, Clone)]
pub struct SnapshotLoader {
    endpoint: ApiEndpoint,
}

impl SnapshotLoader {
    pub fn new(endpoint: ApiEndpoint) -> Self {
        Self { endpoint }
    }

    pub async fn load(&self, session_id: SessionId) -> FetchResult<Snapshot> {
        let messages_path = format!("sessions/{session_id}/messages");
        let file_path = format!("sessions/{session_id}/file");
        let (messages, file) = futures::try_join!(
            self.endpoint
                .get_json::<MessagesBody>("load-snapshot-messages", &messages_path),
            self.endpoint
                .get_json::<FileBody>("load-snapshot-file", &file_path),
        )?;

        let turns = messages
            .messages
            .into_iter()
            .map(MessageRow::into_turn)
            .collect::<Vec<_>>();
        tracing::debug!(
            session_id = %session_id,
            turns = turns.len(),
            has_artifact = file.file.is_some(),
            "loaded session snapshot"
        );

        Ok(Snapshot {
            turns,
            artifact: file.file,
        })
    }
}
