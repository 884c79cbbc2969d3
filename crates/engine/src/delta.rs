use crate::ids::{MessageToken, SessionId};
use crate::turn::{ChartKind, TableData};

/// One incremental unit of server-pushed content.
///
/// Consumed and discarded once folded into the ledger.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeltaEvent {
    pub session_id: Option<SessionId>,
    pub message_id: Option<MessageToken>,
    pub text_fragment: Option<String>,
    pub table: Option<TableData>,
    pub chart: Option<ChartKind>,
    pub done: bool,
    /// Set when the transport relays the user's own message back.
    pub echo: bool,
}

impl DeltaEvent {
    pub fn text(message_id: impl Into<MessageToken>, fragment: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            text_fragment: Some(fragment.into()),
            ..Self::default()
        }
    }

    pub fn done(message_id: impl Into<MessageToken>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            done: true,
            ..Self::default()
        }
    }

    pub fn table(table: TableData, chart: Option<ChartKind>) -> Self {
        Self {
            table: Some(table),
            chart,
            ..Self::default()
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<MessageToken>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_done(mut self) -> Self {
        self.done = true;
        self
    }

    /// An event carrying none of fragment, table or done has nothing to fold.
    pub fn is_malformed(&self) -> bool {
        self.text_fragment.is_none() && self.table.is_none() && !self.done
    }
}
