use crate::ids::{Generation, SessionId};

/// Routing key for async results: which session activation asked for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Activation {
    pub session_id: SessionId,
    pub generation: Generation,
}

impl Activation {
    pub const fn new(session_id: SessionId, generation: Generation) -> Self {
        Self {
            session_id,
            generation,
        }
    }

    /// Wraps a value produced on behalf of this activation.
    pub fn tag<T>(self, value: T) -> Tagged<T> {
        Tagged {
            activation: self,
            value,
        }
    }
}

/// An async result stamped with the activation it was issued for.
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged<T> {
    pub activation: Activation,
    pub value: T,
}

/// Mints activations and answers "is this result still wanted".
#[derive(Debug, Default)]
pub struct ActivationCounter {
    next_generation: u64,
    current: Option<Activation>,
}

impl ActivationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new activation; every earlier activation becomes stale.
    pub fn activate(&mut self, session_id: SessionId) -> Activation {
        // Reserve the generation up front so a re-open never reuses one.
        self.next_generation = self.next_generation.saturating_add(1);
        let activation = Activation::new(session_id, Generation::new(self.next_generation));
        self.current = Some(activation);
        activation
    }

    pub fn deactivate(&mut self) -> Option<Activation> {
        self.current.take()
    }

    pub fn current(&self) -> Option<Activation> {
        self.current
    }

    pub fn is_current(&self, activation: Activation) -> bool {
        self.current == Some(activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopening_the_same_session_invalidates_the_previous_activation() {
        let mut counter = ActivationCounter::new();
        let first = counter.activate(SessionId::new(7));
        let second = counter.activate(SessionId::new(7));

        assert_ne!(first, second);
        assert!(!counter.is_current(first));
        assert!(counter.is_current(second));
    }

    #[test]
    fn deactivation_leaves_nothing_current() {
        let mut counter = ActivationCounter::new();
        let activation = counter.activate(SessionId::new(1));

        assert_eq!(counter.deactivate(), Some(activation));
        assert!(!counter.is_current(activation));
        assert_eq!(counter.current(), None);
    }
}
