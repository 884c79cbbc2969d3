use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MessageToken, SessionId};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle status for one turn.
///
/// Snapshot turns and user turns are born settled; only an assistant turn
/// created by a streamed delta starts open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnStatus {
    Open,
    Settled,
}

/// Structured query result attached to an assistant turn.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableData {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

impl TableData {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Rendering intent that accompanies table data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChartKind {
    Query,
    Line,
    Bar,
    Column,
    Pie,
    Scatter,
    Other(String),
}

impl ChartKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "query" => Self::Query,
            "line" => Self::Line,
            "bar" => Self::Bar,
            "column" => Self::Column,
            "pie" => Self::Pie,
            "scatter" => Self::Scatter,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Query => "query",
            Self::Line => "line",
            Self::Bar => "bar",
            Self::Column => "column",
            Self::Pie => "pie",
            Self::Scatter => "scatter",
            Self::Other(raw) => raw,
        }
    }

    /// `query` means the payload is shown as a plain table, not a chart.
    pub fn renders_as_table(&self) -> bool {
        matches!(self, Self::Query)
    }

    /// Short caption shown above a rendered chart.
    pub fn hint_title(&self) -> &'static str {
        match self {
            Self::Line => "Time Series Visualization",
            Self::Bar => "Categorical Comparison",
            Self::Column => "Group Distribution",
            Self::Pie => "Proportion Analysis",
            Self::Scatter => "Correlation View",
            Self::Query | Self::Other(_) => "Data Visualization",
        }
    }
}

impl From<String> for ChartKind {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ChartKind> for String {
    fn from(value: ChartKind) -> Self {
        value.as_str().to_string()
    }
}

/// One conversational entry in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub message_id: Option<MessageToken>,
    pub table: Option<TableData>,
    pub chart: Option<ChartKind>,
    pub status: TurnStatus,
}

impl Turn {
    /// Creates a settled user turn from a local send.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            message_id: None,
            table: None,
            chart: None,
            status: TurnStatus::Settled,
        }
    }

    /// Creates an open assistant turn from the first streamed fragment.
    pub fn assistant_open(message_id: Option<MessageToken>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            message_id,
            table: None,
            chart: None,
            status: TurnStatus::Open,
        }
    }

    /// Creates an open, table-only assistant turn with empty text.
    pub fn assistant_table(
        message_id: Option<MessageToken>,
        table: TableData,
        chart: Option<ChartKind>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            text: String::new(),
            message_id,
            table: Some(table),
            chart,
            status: TurnStatus::Open,
        }
    }

    /// Creates a settled turn restored from a snapshot.
    pub fn settled(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            message_id: None,
            table: None,
            chart: None,
            status: TurnStatus::Settled,
        }
    }

    pub fn with_message_id(mut self, message_id: MessageToken) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_table(mut self, table: TableData, chart: Option<ChartKind>) -> Self {
        self.table = Some(table);
        self.chart = chart;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == TurnStatus::Open
    }
}

/// File previously attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub file_name: String,
    pub file_path: String,
}

/// Session metadata owned by the session CRUD collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub created_at: String,
    pub artifact: Option<Artifact>,
}

/// Authoritative history fetched once per activation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub turns: Vec<Turn>,
    pub artifact: Option<Artifact>,
}
