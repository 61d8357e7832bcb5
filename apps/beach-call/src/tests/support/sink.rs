use parking_lot::Mutex;

use crate::negotiation::{Signal, SignalSink};
use crate::transport::TransportError;

/// Captures outbound signals so a test can deliver them by hand.
#[derive(Default)]
pub struct RecordingSink {
    signals: Mutex<Vec<Signal>>,
    history: Mutex<Vec<Signal>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals not yet taken, oldest first.
    pub fn take(&self) -> Vec<Signal> {
        std::mem::take(&mut *self.signals.lock())
    }

    pub fn pending(&self) -> usize {
        self.signals.lock().len()
    }

    /// Everything ever sent, including signals already taken.
    pub fn history(&self) -> Vec<Signal> {
        self.history.lock().clone()
    }
}

impl SignalSink for RecordingSink {
    fn send_signal(&self, signal: Signal) -> Result<(), TransportError> {
        self.history.lock().push(signal.clone());
        self.signals.lock().push(signal);
        Ok(())
    }
}
