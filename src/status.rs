//! The single user-facing status line.

use std::sync::Arc;

use tokio::sync::watch;

/// Last lifecycle message from the reconcilers or the mutation
/// orchestrator.  Each write overwrites the previous one.
#[derive(Clone)]
pub struct StatusLine {
    tx: Arc<watch::Sender<String>>,
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusLine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(String::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, message: impl Into<String>) {
        self.tx.send_replace(message.into());
    }

    pub fn get(&self) -> String {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }
}
