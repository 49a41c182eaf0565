use std::fmt::Display;

use tokio::sync::broadcast;

/// A critical condition reported by a component.
#[derive(Debug, Clone)]
pub struct Fault {
    pub origin: String,
    pub message: String,
}

/// Handle for reporting critical faults. Cloned into every component that can
/// raise one; `main` listens on the other end.
#[derive(Clone)]
pub struct Faults {
    tx: broadcast::Sender<Fault>,
}

impl Faults {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Fault> {
        self.tx.subscribe()
    }

    /// Logs at error level under `origin` and publishes the fault.
    pub fn critical(&self, origin: &str, message: impl Display) {
        let message = message.to_string();
        log::error!(target: origin, "CRITICAL {}", message);
        let _ = self.tx.send(Fault {
            origin: origin.to_string(),
            message,
        });
    }
}

impl Default for Faults {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts consecutive failures.
///
/// `fail` returns true exactly once, on the failure that reaches the threshold.
/// A success clears the count and re-arms it.
#[derive(Debug)]
pub struct ErrorStreak {
    count: u32,
    threshold: u32,
    tripped: bool,
}

impl ErrorStreak {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold: threshold.max(1),
            tripped: false,
        }
    }

    pub fn fail(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        if !self.tripped && self.count >= self.threshold {
            self.tripped = true;
            return true;
        }
        false
    }

    pub fn succeed(&mut self) {
        self.count = 0;
        self.tripped = false;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }
}
