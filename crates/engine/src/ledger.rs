use std::sync::Arc;

use crate::ids::MessageToken;
use crate::turn::{Role, Turn, TurnStatus};

/// Ordered, append-only collection of turns for one session activation.
///
/// Only the reconciler mutates a ledger; everything outside this crate sees
/// `&Ledger` or a published `Arc<[Turn]>` copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    turns: Vec<Turn>,
    seeded: bool,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Returns the streaming turn, if one exists.
    pub fn open_turn(&self) -> Option<&Turn> {
        self.open_index().map(|index| &self.turns[index])
    }

    pub fn open_count(&self) -> usize {
        self.turns.iter().filter(|turn| turn.is_open()).count()
    }

    pub fn to_shared(&self) -> Arc<[Turn]> {
        Arc::from(self.turns.as_slice())
    }

    /// Fills an empty ledger with snapshot history, settling every turn.
    ///
    /// Returns false, leaving the turns untouched, when this activation was
    /// already seeded or already holds live turns. The ledger counts as
    /// seeded afterwards either way, so history never lands ahead of a turn
    /// a reader has seen.
    pub(crate) fn seed(&mut self, history: Vec<Turn>) -> bool {
        let accepted = !self.seeded && self.turns.is_empty();
        self.seeded = true;
        if !accepted {
            return false;
        }

        self.turns = history
            .into_iter()
            .map(|mut turn| {
                turn.status = TurnStatus::Settled;
                turn
            })
            .collect();
        true
    }

    /// Appends a turn, settling the previous open turn first when the new
    /// one is open so at most one turn streams at a time.
    pub(crate) fn push(&mut self, turn: Turn) -> usize {
        if turn.is_open() {
            self.settle_open();
        }
        self.turns.push(turn);
        self.turns.len() - 1
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut Turn> {
        self.turns.last_mut()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Turn> {
        self.turns.get_mut(index)
    }

    pub(crate) fn settle_open(&mut self) -> Option<usize> {
        let index = self.open_index()?;
        self.turns[index].status = TurnStatus::Settled;
        Some(index)
    }

    /// Newest assistant turn carrying `token`.
    pub(crate) fn rposition_assistant(&self, token: &MessageToken) -> Option<usize> {
        self.turns.iter().rposition(|turn| {
            turn.role == Role::Assistant && turn.message_id.as_ref() == Some(token)
        })
    }

    fn open_index(&self) -> Option<usize> {
        self.turns.iter().rposition(Turn::is_open)
    }
}
