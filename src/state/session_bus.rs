use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// The refresh credential was rejected or could not be exchanged; the
    /// persisted session is already gone.
    Expired { reason: String },
}

#[derive(Clone)]
pub struct SessionBus {
    tx: mpsc::UnboundedSender<SessionSignal>,
}

impl SessionBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, signal: SessionSignal) {
        if self.tx.send(signal).is_err() {
            tracing::debug!("session listener is gone, dropping signal");
        }
    }
}
