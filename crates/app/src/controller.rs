//! Single-task reconciliation context.
//!
//! Every async result (snapshot fetch, channel connect, channel event) comes
//! back into one `select!` loop tagged with the activation that issued it, and
//! is dropped unless that activation is still current. The loop is the only
//! writer of the ledger and the only owner of the channel.

use std::time::Duration;

use chatwire_client::{ChannelEvent, ChannelManager, FetchResult, SnapshotLoader};
use chatwire_engine::{
    ActivationCounter, Artifact, AttachPolicy, DeltaReconciler, ReadModel, ReadModelPublisher,
    ReadModelReader, SeedOutcome, SessionId, Snapshot, Tagged,
};
use snafu::OptionExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::error::{AppResult, ControllerStoppedSnafu};
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    Activate(SessionId),
    Send(String),
    AttachArtifact {
        session_id: SessionId,
        artifact: Artifact,
    },
    Deactivate,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub attach_policy: AttachPolicy,
    /// How long a request may stay loading without any channel event.
    pub analyzing_timeout: Duration,
}

impl From<&Settings> for ControllerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            attach_policy: settings.table_attach,
            analyzing_timeout: settings.analyzing_timeout(),
        }
    }
}

/// Handle to the running controller task.
pub struct ChatController {
    commands: mpsc::UnboundedSender<ChatCommand>,
    reader: ReadModelReader,
    task: JoinHandle<()>,
}

impl ChatController {
    pub fn spawn(
        config: ControllerConfig,
        loader: SnapshotLoader,
        channels: ChannelManager,
    ) -> Self {
        let publisher = ReadModelPublisher::new();
        let reader = publisher.reader();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = mpsc::unbounded_channel();

        let event_loop = ControllerLoop {
            config,
            loader,
            channels,
            publisher,
            activations: ActivationCounter::new(),
            context: None,
            deadline: None,
            commands: commands_rx,
            snapshots_tx,
            snapshots_rx,
        };
        let task = tokio::spawn(event_loop.run());

        Self {
            commands: commands_tx,
            reader,
            task,
        }
    }

    pub fn reader(&self) -> ReadModelReader {
        self.reader.clone()
    }

    pub fn activate(&self, session_id: SessionId) -> AppResult<()> {
        self.dispatch(ChatCommand::Activate(session_id), "activate-session")
    }

    pub fn send(&self, text: impl Into<String>) -> AppResult<()> {
        self.dispatch(ChatCommand::Send(text.into()), "send-message")
    }

    pub fn attach_artifact(&self, session_id: SessionId, artifact: Artifact) -> AppResult<()> {
        self.dispatch(
            ChatCommand::AttachArtifact {
                session_id,
                artifact,
            },
            "attach-artifact",
        )
    }

    pub fn deactivate(&self) -> AppResult<()> {
        self.dispatch(ChatCommand::Deactivate, "deactivate-session")
    }

    /// Stops the loop, releasing the channel, and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(ChatCommand::Shutdown);
        if let Err(error) = self.task.await {
            tracing::warn!(error = %error, "chat controller task ended abnormally");
        }
    }

    fn dispatch(&self, command: ChatCommand, stage: &'static str) -> AppResult<()> {
        self.commands
            .send(command)
            .ok()
            .context(ControllerStoppedSnafu { stage })
    }
}

struct ControllerLoop {
    config: ControllerConfig,
    loader: SnapshotLoader,
    channels: ChannelManager,
    publisher: ReadModelPublisher,
    activations: ActivationCounter,
    context: Option<DeltaReconciler>,
    deadline: Option<Instant>,
    commands: mpsc::UnboundedReceiver<ChatCommand>,
    snapshots_tx: mpsc::UnboundedSender<Tagged<FetchResult<Snapshot>>>,
    snapshots_rx: mpsc::UnboundedReceiver<Tagged<FetchResult<Snapshot>>>,
}

impl ControllerLoop {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(ChatCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
                Some(loaded) = self.snapshots_rx.recv() => self.handle_snapshot(loaded),
                event = self.channels.recv() => self.handle_channel_event(event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_deadline();
                }
            }
        }

        self.release_channel();
        self.activations.deactivate();
        tracing::debug!("chat controller stopped");
    }

    fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::Activate(session_id) => self.activate(session_id),
            ChatCommand::Send(text) => self.send(text),
            ChatCommand::AttachArtifact {
                session_id,
                artifact,
            } => {
                if let Some(context) = self.context.as_mut()
                    && context.activation().session_id == session_id
                {
                    context.set_artifact(artifact);
                    self.publish();
                }
            }
            ChatCommand::Deactivate => {
                self.release_channel();
                self.activations.deactivate();
                self.context = None;
                self.deadline = None;
                self.publish();
            }
            ChatCommand::Shutdown => {}
        }
    }

    fn activate(&mut self, session_id: SessionId) {
        // The previous activation's channel goes before anything else can
        // reach it.
        self.release_channel();
        let activation = self.activations.activate(session_id);
        self.context = Some(DeltaReconciler::new(activation, self.config.attach_policy));
        self.deadline = None;
        tracing::info!(
            session_id = %session_id,
            generation = %activation.generation,
            "session activated"
        );

        let loader = self.loader.clone();
        let snapshots = self.snapshots_tx.clone();
        tokio::spawn(async move {
            let loaded = loader.load(session_id).await;
            let _ = snapshots.send(activation.tag(loaded));
        });

        self.publish();
    }

    fn send(&mut self, text: String) {
        let Some(context) = self.context.as_mut() else {
            tracing::warn!("ignoring send without an active session");
            return;
        };
        let activation = context.activation();

        if let Err(rejection) = context.record_user_send(&text) {
            tracing::info!(
                session_id = %activation.session_id,
                rejection = ?rejection,
                "send rejected"
            );
            return;
        }

        match self.channels.send(activation, &text) {
            Ok(connection) => tracing::debug!(
                session_id = %activation.session_id,
                connection = ?connection,
                "queued user message"
            ),
            Err(error) => {
                tracing::error!(
                    session_id = %activation.session_id,
                    error = %error,
                    "failed to send user message"
                );
                context.fail(error.to_string());
            }
        }

        self.refresh_deadline();
        self.publish();
    }

    fn handle_snapshot(&mut self, loaded: Tagged<FetchResult<Snapshot>>) {
        let Tagged { activation, value } = loaded;
        if !self.activations.is_current(activation) {
            tracing::debug!(
                session_id = %activation.session_id,
                generation = %activation.generation,
                "discarding stale snapshot"
            );
            return;
        }
        let Some(context) = self.context.as_mut() else {
            return;
        };

        let snapshot = match value {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(
                    session_id = %activation.session_id,
                    error = %error,
                    "failed to load session snapshot, starting without history"
                );
                Snapshot::default()
            }
        };
        match context.seed(snapshot) {
            SeedOutcome::Applied { turns } => tracing::debug!(
                session_id = %activation.session_id,
                turns,
                "seeded ledger from snapshot"
            ),
            SeedOutcome::LiveTurnsPresent { .. } => {}
            SeedOutcome::AlreadySeeded => return,
        }

        self.publish();
    }

    fn handle_channel_event(&mut self, event: Tagged<ChannelEvent>) {
        let Tagged { activation, value } = event;
        if !self.activations.is_current(activation) {
            tracing::debug!(
                session_id = %activation.session_id,
                generation = %activation.generation,
                "discarding stale channel event"
            );
            return;
        }
        let Some(context) = self.context.as_mut() else {
            return;
        };

        match value {
            ChannelEvent::Connected | ChannelEvent::Reconnected => {}
            ChannelEvent::Reconnecting { attempt } => {
                tracing::info!(
                    session_id = %activation.session_id,
                    attempt,
                    "waiting for channel reconnect"
                );
            }
            ChannelEvent::Acknowledged => {
                context.acknowledge();
            }
            ChannelEvent::Delta(delta) => {
                let outcome = context.apply(delta);
                tracing::trace!(
                    session_id = %activation.session_id,
                    outcome = ?outcome,
                    "applied delta"
                );
            }
            ChannelEvent::Failed { reason } => {
                context.fail(reason);
                self.release_channel();
            }
        }

        self.refresh_deadline();
        self.publish();
    }

    fn handle_deadline(&mut self) {
        self.deadline = None;
        let Some(context) = self.context.as_mut() else {
            return;
        };
        if !context.is_loading() {
            return;
        }

        let timeout = self.config.analyzing_timeout;
        tracing::warn!(
            session_id = %context.activation().session_id,
            timeout_ms = timeout.as_millis() as u64,
            "no channel activity, giving up on the response"
        );
        context.fail(format!("no response within {timeout:?}"));
        self.publish();
    }

    /// Restarts the analyzing timer while loading, clears it otherwise.
    fn refresh_deadline(&mut self) {
        let loading = self
            .context
            .as_ref()
            .is_some_and(DeltaReconciler::is_loading);
        self.deadline = loading.then(|| Instant::now() + self.config.analyzing_timeout);
    }

    fn release_channel(&mut self) {
        if self.channels.teardown() {
            tracing::debug!("released session channel");
        }
    }

    fn publish(&self) {
        let model = self
            .context
            .as_ref()
            .map(DeltaReconciler::read_model)
            .unwrap_or_else(ReadModel::default);
        self.publisher.publish(model);
    }
}
