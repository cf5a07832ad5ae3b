use tokio::sync::watch;

/// Observable lifecycle state of a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Downloading,
    Paused,
    Cancelled,
    Completed,
}

impl Phase {
    /// `Cancelled` and `Completed` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Cancelled | Phase::Completed)
    }
}

/// Replay-latest broadcast of [Phase] transitions.
///
/// A late subscriber immediately observes the current phase. Emissions
/// occur only on actual transitions, and the terminal phases are pinned.
#[derive(Debug)]
pub(crate) struct StatePublisher {
    phase: watch::Sender<Phase>,
}

impl StatePublisher {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self { phase }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Move to `next`, notifying subscribers only when the phase actually
    /// changes. Returns false when already at `next` or pinned terminal.
    pub fn transition(&self, next: Phase) -> bool {
        self.phase.send_if_modified(|phase| {
            if phase.is_terminal() || *phase == next {
                return false;
            }
            *phase = next;
            true
        })
    }
}
