use crate::DriverError;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const IDLE: u8 = 0;
const INTERRUPT: u8 = 1;
const TERMINATE: u8 = 2;
const HANDLED: u8 = 3;

const SLEEP_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    pub fn number(self) -> i32 {
        match self {
            Self::Interrupt => 2,
            Self::Terminate => 15,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.number())
    }
}

/// Cooperative cancellation shared between signal handlers, the command
/// runner and the engines.
///
/// A raised signal is observed once, at the next yield point (before a helper
/// command or while sleeping). After that the token is spent and further
/// signals are ignored, so compensating steps can still run their commands.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Safe to call from a signal handler.
    pub fn raise(&self, signal: Signal) {
        let value = match signal {
            Signal::Interrupt => INTERRUPT,
            Signal::Terminate => TERMINATE,
        };
        let _ = self
            .state
            .compare_exchange(IDLE, value, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Consume a pending signal, if any.
    pub fn take(&self) -> Option<Signal> {
        let previous = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| match state {
                INTERRUPT | TERMINATE => Some(HANDLED),
                _ => None,
            })
            .ok()?;
        match previous {
            INTERRUPT => Some(Signal::Interrupt),
            TERMINATE => Some(Signal::Terminate),
            _ => None,
        }
    }

    #[cfg(test)]
    fn is_spent(&self) -> bool {
        self.state.load(Ordering::SeqCst) == HANDLED
    }

    /// Yield point: fail with the pending signal.
    pub fn check(&self) -> Result<(), DriverError> {
        match self.take() {
            Some(signal) => Err(DriverError::Cancelled(signal)),
            None => Ok(()),
        }
    }

    /// Sleep for `duration`, returning early with the signal that woke us.
    pub fn sleep(&self, duration: Duration) -> Option<Signal> {
        let deadline = Instant::now() + duration;
        loop {
            if let Some(signal) = self.take() {
                return Some(signal);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(SLEEP_TICK.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_is_observed_once() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.raise(Signal::Terminate);
        assert!(matches!(
            token.check(),
            Err(DriverError::Cancelled(Signal::Terminate))
        ));
        assert!(token.check().is_ok());
        assert!(token.is_spent());

        token.raise(Signal::Interrupt);
        assert!(token.check().is_ok());
    }

    #[test]
    fn first_signal_wins() {
        let token = CancelToken::new();
        token.raise(Signal::Interrupt);
        token.raise(Signal::Terminate);
        assert_eq!(token.take(), Some(Signal::Interrupt));
    }

    #[test]
    fn sleep_wakes_on_signal() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.raise(Signal::Interrupt);
        });
        let started = Instant::now();
        assert_eq!(token.sleep(Duration::from_secs(10)), Some(Signal::Interrupt));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn sleep_runs_to_completion() {
        let token = CancelToken::new();
        assert_eq!(token.sleep(Duration::from_millis(20)), None);
    }

    #[test]
    fn signal_numbers() {
        assert_eq!(Signal::Terminate.to_string(), "#15");
        assert_eq!(Signal::Interrupt.number(), 2);
    }
}
