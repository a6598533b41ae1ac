//! Client-side synchronization of the cluster registry.
//!
//! Keeps a local, active-only view of the registry's members and images
//! in step with the ledger, and submits add/remove image requests while
//! tracking their progress.

pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod mutation;
pub mod reconciler;
pub mod refresh;
pub mod registry;
pub mod report;
pub mod status;
pub mod types;
pub mod view;

pub use config::Config;
pub use engine::{SyncEngine, ViewWatcher};
pub use error::{MutationError, RegistryError};
pub use view::SyncView;
