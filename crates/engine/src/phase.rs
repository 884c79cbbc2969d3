/// User-visible progress of the in-flight request.
///
/// Streaming is not a phase of its own: it shows up as ledger mutation while
/// the tracker sits in `Analyzing`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadingPhase {
    #[default]
    Idle,
    Connecting,
    Analyzing,
    Failed(String),
}

impl LoadingPhase {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Connecting | Self::Analyzing)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Analyzing => "analyzing",
            Self::Failed(_) => "failed",
        }
    }

    /// Applies one transition deterministically.
    ///
    /// Sending is only legal from a resting phase (`Idle` or `Failed`); every
    /// other transition is accepted from the phases where it is meaningful.
    pub fn apply(&self, transition: PhaseTransition) -> PhaseTransitionResult {
        match transition {
            PhaseTransition::Send => self.apply_send(),
            PhaseTransition::Acknowledge => self.apply_acknowledge(),
            PhaseTransition::Complete => Ok(Self::Idle),
            PhaseTransition::Fail(reason) => Ok(Self::Failed(reason)),
        }
    }

    fn apply_send(&self) -> PhaseTransitionResult {
        match self {
            Self::Idle | Self::Failed(_) => Ok(Self::Connecting),
            Self::Connecting | Self::Analyzing => Err(PhaseRejection::Busy {
                phase: self.clone(),
            }),
        }
    }

    fn apply_acknowledge(&self) -> PhaseTransitionResult {
        match self {
            Self::Connecting | Self::Analyzing => Ok(Self::Analyzing),
            Self::Idle | Self::Failed(_) => Err(PhaseRejection::NoActiveRequest),
        }
    }
}

/// Phase transition input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransition {
    /// The user issued a send.
    Send,
    /// The server acknowledged the send (`message_received`).
    Acknowledge,
    /// A `done` delta arrived.
    Complete,
    /// The channel failed or the request timed out.
    Fail(String),
}

/// Rejection reason for illegal phase transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseRejection {
    Busy { phase: LoadingPhase },
    NoActiveRequest,
}

pub type PhaseTransitionResult = Result<LoadingPhase, PhaseRejection>;

/// Holds the current phase for one session activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadingPhaseTracker {
    phase: LoadingPhase,
}

impl LoadingPhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &LoadingPhase {
        &self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase.is_loading()
    }

    pub fn apply(&mut self, transition: PhaseTransition) -> PhaseTransitionResult {
        let next = self.phase.apply(transition)?;
        if next != self.phase {
            tracing::debug!(
                from = self.phase.label(),
                to = next.label(),
                "loading phase changed"
            );
        }
        self.phase = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_returns_to_idle() {
        let mut tracker = LoadingPhaseTracker::new();

        assert_eq!(
            tracker.apply(PhaseTransition::Send),
            Ok(LoadingPhase::Connecting)
        );
        assert!(tracker.is_loading());
        assert_eq!(
            tracker.apply(PhaseTransition::Acknowledge),
            Ok(LoadingPhase::Analyzing)
        );
        assert_eq!(
            tracker.apply(PhaseTransition::Complete),
            Ok(LoadingPhase::Idle)
        );
        assert!(!tracker.is_loading());
    }

    #[test]
    fn send_while_in_flight_is_rejected_without_changing_phase() {
        let mut tracker = LoadingPhaseTracker::new();
        tracker
            .apply(PhaseTransition::Send)
            .expect("first send starts a cycle");

        assert_eq!(
            tracker.apply(PhaseTransition::Send),
            Err(PhaseRejection::Busy {
                phase: LoadingPhase::Connecting
            })
        );
        assert_eq!(tracker.phase(), &LoadingPhase::Connecting);
    }

    #[test]
    fn acknowledge_outside_a_request_is_rejected() {
        let mut tracker = LoadingPhaseTracker::new();
        assert_eq!(
            tracker.apply(PhaseTransition::Acknowledge),
            Err(PhaseRejection::NoActiveRequest)
        );
    }

    #[test]
    fn failed_phase_is_not_loading_and_accepts_a_new_send() {
        let mut tracker = LoadingPhaseTracker::new();
        tracker.apply(PhaseTransition::Send).expect("send");
        tracker
            .apply(PhaseTransition::Fail("channel closed".to_string()))
            .expect("fail");

        assert!(!tracker.is_loading());
        assert_eq!(
            tracker.apply(PhaseTransition::Send),
            Ok(LoadingPhase::Connecting)
        );
    }
}
