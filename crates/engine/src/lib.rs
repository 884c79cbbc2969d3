#![deny(unsafe_code)]

//! Reconciliation core for a streaming chat client.
//!
//! A session activation owns one [`DeltaReconciler`], which seeds its
//! [`Ledger`] from the snapshot once and then folds streamed deltas into it
//! in arrival order. Presentation only ever sees published [`ReadModel`]s.

pub mod activation;
pub mod delta;
pub mod ids;
pub mod ledger;
/// Loading phase state machine.
pub mod phase;
pub mod read_model;
pub mod reconciler;
pub mod turn;

pub use activation::{Activation, ActivationCounter, Tagged};
pub use delta::DeltaEvent;
pub use ids::{Generation, MessageToken, SessionId};
pub use ledger::Ledger;
pub use phase::{
    LoadingPhase, LoadingPhaseTracker, PhaseRejection, PhaseTransition, PhaseTransitionResult,
};
pub use read_model::{ReadModel, ReadModelPublisher, ReadModelReader};
pub use reconciler::{
    ApplyOutcome, AttachPolicy, ContentChange, DeltaReconciler, SeedOutcome, SendRejection,
};
pub use turn::{Artifact, ChartKind, Role, Session, Snapshot, TableData, Turn, TurnStatus};
