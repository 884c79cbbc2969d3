use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::delta::DeltaEvent;
use crate::ids::MessageToken;
use crate::ledger::Ledger;
use crate::phase::{LoadingPhase, LoadingPhaseTracker, PhaseRejection, PhaseTransition};
use crate::read_model::ReadModel;
use crate::turn::{Artifact, ChartKind, Role, Snapshot, TableData, Turn};

/// How a table payload finds the turn it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachPolicy {
    /// Attach to the last turn when it is an assistant turn, whatever its
    /// message id.
    #[default]
    LastTurn,
    /// Attach to the newest assistant turn with the event's message id.
    MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Applied { turns: usize },
    AlreadySeeded,
    /// Live turns arrived first; history is skipped rather than inserted
    /// ahead of them.
    LiveTurnsPresent { live: usize },
}

/// Why a local send was refused. The ledger is untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRejection {
    EmptyText,
    /// The activation's history has not been seeded yet.
    AwaitingHistory,
    Busy { phase: LoadingPhase },
}

/// What one delta did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentChange {
    Folded { index: usize },
    Opened { index: usize },
    TableAttached { index: usize },
    TableOpened { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        content: Option<ContentChange>,
        closed: Option<usize>,
        completed: bool,
    },
    /// The transport relayed the user's own message.
    Echo,
    /// Addressed to a different session.
    Misrouted,
    /// Nothing to fold.
    Malformed,
}

impl ApplyOutcome {
    pub fn mutated(&self) -> bool {
        match self {
            Self::Applied {
                content, completed, ..
            } => content.is_some() || *completed,
            Self::Echo | Self::Misrouted | Self::Malformed => false,
        }
    }
}

/// Merges the one-shot snapshot and the streamed deltas of one session
/// activation into its ledger, and drives the loading phase.
#[derive(Debug)]
pub struct DeltaReconciler {
    activation: Activation,
    policy: AttachPolicy,
    ledger: Ledger,
    tracker: LoadingPhaseTracker,
    artifact: Option<Artifact>,
    pending_echo: Option<String>,
}

impl DeltaReconciler {
    pub fn new(activation: Activation, policy: AttachPolicy) -> Self {
        Self {
            activation,
            policy,
            ledger: Ledger::new(),
            tracker: LoadingPhaseTracker::new(),
            artifact: None,
            pending_echo: None,
        }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn phase(&self) -> &LoadingPhase {
        self.tracker.phase()
    }

    pub fn is_loading(&self) -> bool {
        self.tracker.is_loading()
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    /// Seeds the ledger from the snapshot; only the first call per activation
    /// has any effect.
    ///
    /// A failed fetch is seeded with an empty snapshot so sends are not
    /// blocked for the rest of the activation.
    pub fn seed(&mut self, snapshot: Snapshot) -> SeedOutcome {
        if self.ledger.is_seeded() {
            tracing::debug!(
                session_id = %self.activation.session_id,
                generation = %self.activation.generation,
                "ignoring repeated snapshot for an already seeded activation"
            );
            return SeedOutcome::AlreadySeeded;
        }

        let turns = snapshot.turns.len();
        if let Some(artifact) = snapshot.artifact {
            self.artifact = Some(artifact);
        }
        if !self.ledger.seed(snapshot.turns) {
            let live = self.ledger.len();
            tracing::warn!(
                session_id = %self.activation.session_id,
                live,
                "skipping snapshot history behind live turns"
            );
            return SeedOutcome::LiveTurnsPresent { live };
        }
        SeedOutcome::Applied { turns }
    }

    /// Records an artifact attached after activation, e.g. by an upload.
    pub fn set_artifact(&mut self, artifact: Artifact) {
        self.artifact = Some(artifact);
    }

    /// Pushes the user's turn before the payload goes out on the channel.
    pub fn record_user_send(&mut self, text: &str) -> Result<usize, SendRejection> {
        if text.trim().is_empty() {
            return Err(SendRejection::EmptyText);
        }
        if !self.ledger.is_seeded() {
            return Err(SendRejection::AwaitingHistory);
        }

        match self.tracker.apply(PhaseTransition::Send) {
            Ok(_) => {}
            Err(PhaseRejection::Busy { phase }) => return Err(SendRejection::Busy { phase }),
            Err(PhaseRejection::NoActiveRequest) => {
                return Err(SendRejection::Busy {
                    phase: self.tracker.phase().clone(),
                });
            }
        }

        self.pending_echo = Some(text.to_string());
        Ok(self.ledger.push(Turn::user(text)))
    }

    /// Handles the server's `message_received` acknowledgment.
    ///
    /// Only an unflagged replay seen before the acknowledgment counts as an
    /// echo; identical id-less text after it is a real reply.
    pub fn acknowledge(&mut self) -> bool {
        self.pending_echo = None;
        self.tracker.apply(PhaseTransition::Acknowledge).is_ok()
    }

    /// Folds one delta into the ledger, in arrival order.
    pub fn apply(&mut self, event: DeltaEvent) -> ApplyOutcome {
        if let Some(session_id) = event.session_id
            && session_id != self.activation.session_id
        {
            tracing::debug!(
                active_session_id = %self.activation.session_id,
                event_session_id = %session_id,
                "dropping delta addressed to another session"
            );
            return ApplyOutcome::Misrouted;
        }

        if event.is_malformed() {
            tracing::debug!(
                session_id = %self.activation.session_id,
                "dropping delta without text, table or done"
            );
            return ApplyOutcome::Malformed;
        }

        if self.is_echo(&event) {
            self.pending_echo = None;
            return ApplyOutcome::Echo;
        }

        let DeltaEvent {
            message_id,
            text_fragment,
            table,
            chart,
            done,
            ..
        } = event;

        let content = if let Some(table) = table {
            Some(self.attach_table(message_id, table, chart))
        } else {
            text_fragment.map(|fragment| self.fold_text(message_id, fragment))
        };
        if content.is_some() {
            self.pending_echo = None;
        }

        let (closed, completed) = if done {
            self.pending_echo = None;
            let closed = self.ledger.settle_open();
            // Complete is accepted from every phase.
            let _ = self.tracker.apply(PhaseTransition::Complete);
            (closed, true)
        } else {
            (None, false)
        };

        ApplyOutcome::Applied {
            content,
            closed,
            completed,
        }
    }

    /// Moves to the failed phase and closes the streaming turn, so a later
    /// fragment starts a fresh turn.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.pending_echo = None;
        self.ledger.settle_open();
        let _ = self.tracker.apply(PhaseTransition::Fail(reason));
    }

    pub fn read_model(&self) -> ReadModel {
        ReadModel {
            revision: 0,
            activation: Some(self.activation),
            turns: self.ledger.to_shared(),
            phase: self.tracker.phase().clone(),
            is_loading: self.tracker.is_loading(),
            is_seeded: self.ledger.is_seeded(),
            artifact: self.artifact.clone(),
        }
    }

    fn is_echo(&self, event: &DeltaEvent) -> bool {
        if event.echo {
            return true;
        }

        // Without a token the only tell is an exact replay of what was just sent.
        event.message_id.is_none()
            && event.table.is_none()
            && !event.done
            && self.pending_echo.is_some()
            && event.text_fragment == self.pending_echo
    }

    fn attach_table(
        &mut self,
        message_id: Option<MessageToken>,
        table: TableData,
        chart: Option<ChartKind>,
    ) -> ContentChange {
        let target = match self.policy {
            AttachPolicy::LastTurn => self
                .ledger
                .last()
                .filter(|turn| turn.role == Role::Assistant)
                .map(|_| self.ledger.len() - 1),
            AttachPolicy::MessageId => message_id
                .as_ref()
                .and_then(|token| self.ledger.rposition_assistant(token)),
        };

        if let Some(index) = target
            && let Some(turn) = self.ledger.get_mut(index)
        {
            turn.table = Some(table);
            turn.chart = chart;
            return ContentChange::TableAttached { index };
        }

        let index = self
            .ledger
            .push(Turn::assistant_table(message_id, table, chart));
        ContentChange::TableOpened { index }
    }

    fn fold_text(
        &mut self,
        message_id: Option<MessageToken>,
        fragment: String,
    ) -> ContentChange {
        if let Some(turn) = self.ledger.last_mut()
            && turn.role == Role::Assistant
            && turn.is_open()
            && turn.message_id == message_id
        {
            turn.text.push_str(&fragment);
            return ContentChange::Folded {
                index: self.ledger.len() - 1,
            };
        }

        let index = self.ledger.push(Turn::assistant_open(message_id, fragment));
        ContentChange::Opened { index }
    }
}
