//! Wiring of the synchronization layer.
//!
//! [`SyncEngine`] owns the registry slot and session flag and connects
//! the refresh coordinator, both reconcilers, the mutation orchestrator
//! and the change listener.  Everything runs cooperatively inside
//! [`SyncEngine::run`]; callers only read snapshots through
//! [`SyncEngine::view`].

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;

use crate::error::MutationError;
use crate::listener::ChangeListener;
use crate::mutation::{Encryptor, MutationOrchestrator, MutationState};
use crate::reconciler::{Images, Members, PassOutcome, Reconciler, Snapshot};
use crate::refresh::{Generation, RefreshCoordinator, RefreshTrigger};
use crate::registry::RegistryLink;
use crate::status::StatusLine;
use crate::types::{Image, Member, MutationRequest, RegistryHandle, TxRef};
use crate::view::{project, SyncView};

pub struct SyncEngine {
    registry: watch::Sender<Option<RegistryLink>>,
    session: watch::Sender<bool>,
    refresh: Arc<RefreshCoordinator>,
    members: Reconciler<Members>,
    images: Reconciler<Images>,
    mutations: MutationOrchestrator,
    listener: ChangeListener,
    status: StatusLine,
}

impl SyncEngine {
    pub fn new(
        link: Option<RegistryLink>,
        connected: bool,
        encryptor: Option<Arc<dyn Encryptor>>,
        retry_delay: Duration,
    ) -> Self {
        let (registry, registry_rx) = watch::channel(link);
        let (session, _) = watch::channel(connected);
        let refresh = Arc::new(RefreshCoordinator::new());
        let status = StatusLine::new();
        Self {
            mutations: MutationOrchestrator::new(
                registry_rx,
                Arc::clone(&refresh),
                status.clone(),
                encryptor,
            ),
            listener: ChangeListener::new(Arc::clone(&refresh), retry_delay),
            members: Reconciler::new(status.clone()),
            images: Reconciler::new(status.clone()),
            registry,
            session,
            refresh,
            status,
        }
    }

    /// Mounts the engine: reconciles once, then keeps both collections
    /// in sync until the engine is dropped or the future is cancelled.
    pub async fn run(&self) {
        let member_generations = self.refresh.subscribe();
        let image_generations = self.refresh.subscribe();
        self.refresh.bump(RefreshTrigger::Mount);
        tokio::join!(
            self.members
                .run(member_generations, self.registry.subscribe()),
            self.images.run(image_generations, self.registry.subscribe()),
            self.listener.run(self.registry.subscribe()),
        );
    }

    /// Reconciles both collections once, outside of [`run`](Self::run).
    pub async fn reconcile_now(&self) -> (PassOutcome, PassOutcome) {
        let generation = self.refresh.bump(RefreshTrigger::Explicit);
        let client = self.registry.borrow().as_ref().map(|l| Arc::clone(&l.client));
        tokio::join!(
            self.members.reconcile(generation, client.clone()),
            self.images.reconcile(generation, client),
        )
    }

    /// Caller-requested refresh.
    pub fn refresh(&self) -> Generation {
        self.refresh.bump(RefreshTrigger::Explicit)
    }

    pub async fn add_image(&self, name: &str, replicas: u64) -> Result<TxRef, MutationError> {
        self.mutations
            .submit(MutationRequest::Add {
                name: name.to_string(),
                replicas,
            })
            .await
    }

    pub async fn remove_image(&self, name: &str) -> Result<TxRef, MutationError> {
        self.mutations
            .submit(MutationRequest::Remove {
                name: name.to_string(),
            })
            .await
    }

    /// Swaps the registry after a network change.
    ///
    /// Returns whether anything changed.  A new handle triggers a refresh
    /// and makes the listener re-register.
    pub fn set_registry(&self, link: Option<RegistryLink>, connected: bool) -> bool {
        let reconnected = self.session.send_if_modified(|c| {
            let changed = *c != connected;
            *c = connected;
            changed
        });
        if reconnected {
            if connected {
                info!("Ledger connection established");
            } else {
                warn!("Ledger connection lost");
            }
        }
        let new_handle = link.as_ref().map(|l| l.handle.clone());
        let swapped = self.registry.send_if_modified(|current| {
            if current.as_ref().map(|l| &l.handle) == new_handle.as_ref() {
                return false;
            }
            *current = link;
            true
        });
        if swapped {
            match &new_handle {
                Some(handle) => info!(
                    "Registry switched to {} on chain {}",
                    handle.address, handle.chain_id
                ),
                None => info!("Registry unavailable; collections cleared"),
            }
            self.refresh.bump(RefreshTrigger::NetworkChange);
        }
        swapped
    }

    pub fn registry_handle(&self) -> Option<RegistryHandle> {
        self.registry.borrow().as_ref().map(|l| l.handle.clone())
    }

    pub fn registry(&self) -> Option<RegistryLink> {
        self.registry.borrow().clone()
    }

    pub fn current_generation(&self) -> Generation {
        self.refresh.current_generation()
    }

    pub fn member_snapshot(&self) -> Snapshot<Member> {
        self.members.snapshot()
    }

    pub fn image_snapshot(&self) -> Snapshot<Image> {
        self.images.snapshot()
    }

    pub fn mutation_state(&self) -> MutationState {
        self.mutations.state()
    }

    pub fn view(&self) -> SyncView {
        project(
            &self.members.snapshot(),
            &self.images.snapshot(),
            &self.mutations.state(),
            &self.status.get(),
            *self.session.borrow(),
            self.registry_handle().as_ref(),
        )
    }

    /// Returns a watcher that yields a new view whenever any input changes.
    pub fn watch(&self) -> ViewWatcher {
        ViewWatcher {
            members: self.members.subscribe(),
            images: self.images.subscribe(),
            mutation: self.mutations.subscribe(),
            status: self.status.subscribe(),
            session: self.session.subscribe(),
        }
    }
}

pub struct ViewWatcher {
    members: watch::Receiver<Snapshot<Member>>,
    images: watch::Receiver<Snapshot<Image>>,
    mutation: watch::Receiver<MutationState>,
    status: watch::Receiver<String>,
    session: watch::Receiver<bool>,
}

impl ViewWatcher {
    /// Waits for the next change and returns the resulting view.
    ///
    /// Returns `None` once the engine has been dropped.
    pub async fn changed(&mut self, engine: &SyncEngine) -> Option<SyncView> {
        let result = tokio::select! {
            r = self.members.changed() => r,
            r = self.images.changed() => r,
            r = self.mutation.changed() => r,
            r = self.status.changed() => r,
            r = self.session.changed() => r,
        };
        result.ok()?;
        // Mark everything seen; the view below reads the latest values.
        self.members.borrow_and_update();
        self.images.borrow_and_update();
        self.mutation.borrow_and_update();
        self.status.borrow_and_update();
        self.session.borrow_and_update();
        Some(engine.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;
    use crate::types::RegistryEvent;

    fn engine_with(reg: &Arc<MemoryRegistry>) -> SyncEngine {
        SyncEngine::new(Some(reg.link("0x01")), true, None, Duration::from_millis(10))
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn mount_populates_view() {
        let reg = Arc::new(MemoryRegistry::new());
        reg.push_member("peer-a", "nginx", true);
        reg.push_member("peer-b", "", false);
        reg.push_image("nginx", 3, true);
        let engine = engine_with(&reg);

        tokio::select! {
            _ = engine.run() => unreachable!("engine stopped"),
            _ = settle() => {}
        }

        let view = engine.view();
        assert_eq!(view.members, vec!["peer-a"]);
        assert_eq!(view.members_count, 1);
        assert_eq!(view.images_count, 1);
        assert_eq!(view.contract_address.as_deref(), Some("0x01"));
        assert!(view.is_connected);
        assert!(!view.is_processing);
    }

    #[tokio::test]
    async fn add_image_shows_up_after_confirmation() {
        let reg = Arc::new(MemoryRegistry::new());
        let engine = engine_with(&reg);

        tokio::select! {
            _ = engine.run() => unreachable!("engine stopped"),
            _ = async {
                settle().await;
                let before = engine.current_generation();
                engine.add_image("nginx", 3).await.unwrap();
                assert!(engine.current_generation() > before);
                settle().await;
            } => {}
        }

        let view = engine.view();
        assert_eq!(view.images_count, 1);
        assert_eq!(view.images[0].name, "nginx");
        assert_eq!(view.images[0].replicas, 3);
        assert!(view.message.contains("nginx"));
    }

    #[tokio::test]
    async fn failed_add_leaves_counts_and_generation_alone() {
        let reg = Arc::new(MemoryRegistry::new());
        reg.push_member("peer-a", "", true);
        let engine = engine_with(&reg);

        tokio::select! {
            _ = engine.run() => unreachable!("engine stopped"),
            _ = async {
                settle().await;
                reg.fail_next_write(crate::error::RegistryError::Transport("node offline".into()));
                let before = engine.current_generation();
                assert!(engine.add_image("nginx", 3).await.is_err());
                assert_eq!(engine.current_generation(), before);
                settle().await;
            } => {}
        }

        let view = engine.view();
        assert_eq!(view.members_count, 1);
        assert_eq!(view.images_count, 0);
        assert!(view.message.contains("node offline"));
        assert!(!view.is_processing);
    }

    #[tokio::test]
    async fn external_removal_notification_refreshes_images() {
        let reg = Arc::new(MemoryRegistry::new());
        reg.push_image("nginx", 3, true);
        reg.push_image("redis", 1, true);
        let engine = engine_with(&reg);

        tokio::select! {
            _ = engine.run() => unreachable!("engine stopped"),
            _ = async {
                settle().await;
                assert_eq!(engine.view().images_count, 2);
                let before = engine.current_generation();

                reg.set_image_active("nginx", false);
                reg.emit(RegistryEvent::ImageRemoved);
                settle().await;
                assert!(engine.current_generation() > before);
            } => {}
        }

        let view = engine.view();
        assert_eq!(view.images_count, 1);
        assert_eq!(view.images[0].name, "redis");
    }

    #[tokio::test]
    async fn losing_the_registry_degrades_to_empty_and_blocks_mutations() {
        let reg = Arc::new(MemoryRegistry::new());
        reg.push_image("nginx", 3, true);
        let engine = engine_with(&reg);

        tokio::select! {
            _ = engine.run() => unreachable!("engine stopped"),
            _ = async {
                settle().await;
                assert!(engine.set_registry(None, true));
                settle().await;
            } => {}
        }

        let view = engine.view();
        assert_eq!(view.images_count, 0);
        assert_eq!(view.contract_address, None);
        assert_eq!(
            engine.add_image("nginx", 1).await,
            Err(MutationError::RegistryUnavailable)
        );
        assert_eq!(reg.write_calls(), 0);
    }

    #[tokio::test]
    async fn same_handle_is_not_a_network_change() {
        let reg = Arc::new(MemoryRegistry::new());
        let engine = engine_with(&reg);
        let before = engine.current_generation();
        assert!(!engine.set_registry(Some(reg.link("0x01")), true));
        assert_eq!(engine.current_generation(), before);
        assert!(engine.set_registry(Some(reg.link("0x02")), true));
        assert!(engine.current_generation() > before);
    }

    #[tokio::test]
    async fn reconcile_now_runs_both_collections() {
        let reg = Arc::new(MemoryRegistry::new());
        reg.push_member("peer-a", "", true);
        reg.push_image("nginx", 3, false);
        let engine = engine_with(&reg);

        let (members, images) = engine.reconcile_now().await;
        assert_eq!(members, PassOutcome::Applied(1));
        assert_eq!(images, PassOutcome::Applied(0));
        assert_eq!(engine.image_snapshot().registered, Some(1));
    }

    #[tokio::test]
    async fn watcher_reports_new_views() {
        let reg = Arc::new(MemoryRegistry::new());
        reg.push_image("nginx", 3, true);
        let engine = engine_with(&reg);
        let mut watcher = engine.watch();

        engine.reconcile_now().await;
        let view = watcher.changed(&engine).await.unwrap();
        assert_eq!(view.images_count, 1);
    }
}
