use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Last control event observed on a session's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlSignal {
    #[default]
    None,
    Pause,
    Resume,
    Cancel,
}

/// Carries pause/resume/cancel signals from the caller to the engine.
///
/// The token holds the last event in a watch slot, so the engine and any
/// observer see the latest value immediately on subscribe. Watchers are
/// notified synchronously on mutation; the token itself performs no I/O.
/// Once `Cancel` is latched, later pause/resume calls are ignored.
#[derive(Debug)]
pub(crate) struct ControlToken {
    signal: watch::Sender<ControlSignal>,
    /// Latched alongside the `Cancel` signal so in-flight requests can be
    /// released promptly via `select!`.
    cancelled: CancellationToken,
}

impl ControlToken {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(ControlSignal::None);
        Self {
            signal,
            cancelled: CancellationToken::new(),
        }
    }

    /// Latch `Pause`. Returns false when cancelled or already paused.
    pub fn pause(&self) -> bool {
        self.signal.send_if_modified(|signal| match *signal {
            ControlSignal::Cancel | ControlSignal::Pause => false,
            _ => {
                *signal = ControlSignal::Pause;
                true
            }
        })
    }

    /// Move `Pause` to `Resume`. Returns false from any other state.
    pub fn resume(&self) -> bool {
        self.signal.send_if_modified(|signal| match *signal {
            ControlSignal::Pause => {
                *signal = ControlSignal::Resume;
                true
            }
            _ => false,
        })
    }

    /// Latch `Cancel` from any state and fire the cancellation token.
    /// Returns false when already cancelled.
    pub fn cancel(&self) -> bool {
        let latched = self.signal.send_if_modified(|signal| {
            if *signal == ControlSignal::Cancel {
                return false;
            }
            *signal = ControlSignal::Cancel;
            true
        });
        if latched {
            self.cancelled.cancel();
        }
        latched
    }

    pub fn last(&self) -> ControlSignal {
        *self.signal.borrow()
    }

    /// Child token scoped to one transfer attempt. Cancelling the session
    /// root cascades into every attempt.
    pub fn attempt_token(&self) -> CancellationToken {
        self.cancelled.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_then_resume_round_trips() {
        let token = ControlToken::new();
        assert_eq!(token.last(), ControlSignal::None);
        assert!(token.pause());
        assert_eq!(token.last(), ControlSignal::Pause);
        assert!(token.resume());
        assert_eq!(token.last(), ControlSignal::Resume);
        assert!(token.pause());
        assert_eq!(token.last(), ControlSignal::Pause);
    }

    #[test]
    fn resume_requires_pause() {
        let token = ControlToken::new();
        assert!(!token.resume());
        assert_eq!(token.last(), ControlSignal::None);
    }

    #[test]
    fn cancel_is_latched_and_idempotent() {
        let token = ControlToken::new();
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(!token.pause());
        assert!(!token.resume());
        assert_eq!(token.last(), ControlSignal::Cancel);
    }

    #[test]
    fn cancel_fires_attempt_tokens() {
        let token = ControlToken::new();
        let attempt = token.attempt_token();
        token.cancel();
        assert!(attempt.is_cancelled());
    }
}
