//! Liveness signal emitted while the daemon works.

use tokio::sync::mpsc;

/// Logical step of a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStep {
    Claimed,
    Evaluated,
    PartitionsApplied,
    RunProcessed,
    Written,
}

/// One progress report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// A pass over all instigators finished
    Iteration,
    /// The loop woke up from its sleep
    Woke,
    /// A tick for one instigator moved forward
    Step {
        instigator_name: String,
        step: TickStep,
    },
}

/// Sender side of the progress channel; cheap to clone into workers
#[derive(Debug, Clone, Default)]
pub struct Heartbeat {
    tx: Option<mpsc::UnboundedSender<Progress>>,
}

impl Heartbeat {
    /// Heartbeat that goes nowhere
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Report progress; a dropped receiver is ignored
    pub fn beat(&self, progress: Progress) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(progress);
        }
    }

    pub fn step(&self, instigator_name: &str, step: TickStep) {
        self.beat(Progress::Step {
            instigator_name: instigator_name.to_string(),
            step,
        });
    }
}
