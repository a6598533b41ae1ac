//! Refresh generation counter.
//!
//! Every reason to re-read the registry arrives here as a
//! [`RefreshTrigger`] and is turned into a new generation number.  The
//! reconcilers watch the counter rather than the triggers, so a burst
//! of triggers collapses into a single meaningful pass: whichever
//! generation is current when a pass starts.

use log::debug;
use tokio::sync::watch;

use crate::types::RegistryEvent;

pub type Generation = u64;

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Mount,
    Explicit,
    Notification(RegistryEvent),
    /// Listeners were (re)registered; changes mined before that are unseen.
    Subscribed,
    Mutation,
    NetworkChange,
}

/// Sole owner and writer of the refresh generation.
pub struct RefreshCoordinator {
    generation: watch::Sender<Generation>,
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self { generation }
    }

    /// Advances the generation and returns the new value.
    pub fn bump(&self, trigger: RefreshTrigger) -> Generation {
        let mut next = 0;
        self.generation.send_modify(|g| {
            *g += 1;
            next = *g;
        });
        debug!("Refresh generation {} ({:?})", next, trigger);
        next
    }

    pub fn current_generation(&self) -> Generation {
        *self.generation.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Generation> {
        self.generation.subscribe()
    }
}
