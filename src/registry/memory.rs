//! Scriptable in-memory registry used by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, oneshot};

use super::{EventSource, RawEvent, RegistryClient, RegistryLink};
use crate::error::RegistryError;
use crate::types::{
    CollectionKind, Count, HostId, ImageDetail, ImageName, InterfaceDescriptor, MemberDetail,
    RegistryEvent, RegistryHandle, ReplicaArg, TxRef,
};

#[derive(Default)]
struct State {
    members: Vec<(HostId, MemberDetail)>,
    member_images: Vec<(HostId, Vec<ImageName>)>,
    images: Vec<(ImageName, ImageDetail)>,
    members_count: Option<Count>,
    images_count: Option<Count>,
    failing_keys: HashSet<String>,
    failing_index: HashSet<(CollectionKind, u64)>,
    next_write_error: Option<RegistryError>,
    held_images_count: Option<oneshot::Receiver<()>>,
    held_write: Option<oneshot::Receiver<()>>,
    last_replicas: Option<ReplicaArg>,
    tx_counter: u64,
}

pub struct MemoryRegistry {
    state: Mutex<State>,
    events: broadcast::Sender<RawEvent>,
    interface: InterfaceDescriptor,
    writes: AtomicUsize,
    writes_in_flight: AtomicUsize,
    peak_writes: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(State::default()),
            events,
            interface: InterfaceDescriptor::default(),
            writes: AtomicUsize::new(0),
            writes_in_flight: AtomicUsize::new(0),
            peak_writes: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn handle(&self, address: &str) -> RegistryHandle {
        RegistryHandle {
            address: address.into(),
            chain_id: 31337,
            interface: self.interface.clone(),
        }
    }

    pub fn link(self: &Arc<Self>, address: &str) -> RegistryLink {
        RegistryLink {
            handle: self.handle(address),
            client: self.clone(),
            events: self.clone(),
        }
    }

    pub fn push_member(&self, host: &str, image: &str, active: bool) {
        self.state.lock().unwrap().members.push((
            host.into(),
            MemberDetail {
                image_name: image.into(),
                active,
                encrypted_memory: vec![0xab; 4],
            },
        ));
    }

    pub fn assign(&self, host: &str, images: &[&str]) {
        self.state.lock().unwrap().member_images.push((
            host.into(),
            images.iter().map(|s| s.to_string()).collect(),
        ));
    }

    pub fn push_image(&self, name: &str, replicas: u64, active: bool) {
        self.state.lock().unwrap().images.push((
            name.into(),
            ImageDetail {
                replicas,
                deployed: 0,
                active,
            },
        ));
    }

    pub fn set_image_active(&self, name: &str, active: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some((_, detail)) = state.images.iter_mut().find(|(n, _)| n == name) {
            detail.active = active;
        }
    }

    /// Overrides the count reported for a collection.
    pub fn override_count(&self, collection: CollectionKind, count: Count) {
        let mut state = self.state.lock().unwrap();
        match collection {
            CollectionKind::Members => state.members_count = Some(count),
            CollectionKind::Images => state.images_count = Some(count),
        }
    }

    /// Detail lookups for `key` fail with a transport error.
    pub fn fail_key(&self, key: &str) {
        self.state.lock().unwrap().failing_keys.insert(key.into());
    }

    /// Key lookups at `index` fail with a transport error.
    pub fn fail_index(&self, collection: CollectionKind, index: u64) {
        self.state
            .lock()
            .unwrap()
            .failing_index
            .insert((collection, index));
    }

    pub fn fail_next_write(&self, error: RegistryError) {
        self.state.lock().unwrap().next_write_error = Some(error);
    }

    /// The next `images_count` call answers with the state at call time
    /// but only returns once the returned sender fires.
    pub fn hold_next_images_count(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().unwrap().held_images_count = Some(rx);
        tx
    }

    /// The next write blocks until the returned sender fires.
    pub fn hold_next_write(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().unwrap().held_write = Some(rx);
        tx
    }

    pub fn emit(&self, event: RegistryEvent) {
        let topic = match event {
            RegistryEvent::MemberAdded => &self.interface.member_added_topic,
            RegistryEvent::MemberRemoved => &self.interface.member_removed_topic,
            RegistryEvent::ImageAdded => &self.interface.image_added_topic,
            RegistryEvent::ImageRemoved => &self.interface.image_removed_topic,
        };
        self.emit_raw(vec![topic.clone()]);
    }

    pub fn emit_raw(&self, topics: Vec<String>) {
        let _ = self.events.send(RawEvent { topics });
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Highest number of writes observed executing at once.
    pub fn max_concurrent_writes(&self) -> usize {
        self.peak_writes.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn last_replicas(&self) -> Option<ReplicaArg> {
        self.state.lock().unwrap().last_replicas.clone()
    }

    fn transport(what: &str) -> RegistryError {
        RegistryError::Transport(format!("injected failure for {what}"))
    }

    fn lookup_index(
        &self,
        collection: CollectionKind,
        index: u64,
    ) -> Result<String, RegistryError> {
        let state = self.state.lock().unwrap();
        if state.failing_index.contains(&(collection, index)) {
            return Err(Self::transport(&format!("{collection}[{index}]")));
        }
        let key = match collection {
            CollectionKind::Members => state.members.get(index as usize).map(|(k, _)| k.clone()),
            CollectionKind::Images => state.images.get(index as usize).map(|(k, _)| k.clone()),
        };
        key.ok_or_else(|| RegistryError::Reverted("index out of bounds".into()))
    }

    async fn write(&self, apply: impl FnOnce(&mut State)) -> Result<TxRef, RegistryError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let running = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_writes.fetch_max(running, Ordering::SeqCst);

        let held = self.state.lock().unwrap().held_write.take();
        if let Some(rx) = held {
            let _ = rx.await;
        }
        tokio::task::yield_now().await;

        let result = {
            let mut state = self.state.lock().unwrap();
            match state.next_write_error.take() {
                Some(err) => Err(err),
                None => {
                    apply(&mut state);
                    state.tx_counter += 1;
                    Ok(TxRef(format!("0x{:064x}", state.tx_counter)))
                }
            }
        };
        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn members_count(&self) -> Result<Count, RegistryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .members_count
            .unwrap_or(Count::Known(state.members.len() as u64)))
    }

    async fn member_key(&self, index: u64) -> Result<HostId, RegistryError> {
        self.lookup_index(CollectionKind::Members, index)
    }

    async fn member_detail(&self, host: &str) -> Result<MemberDetail, RegistryError> {
        let state = self.state.lock().unwrap();
        if state.failing_keys.contains(host) {
            return Err(Self::transport(host));
        }
        state
            .members
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| RegistryError::Reverted("unknown member".into()))
    }

    async fn member_images(&self, host: &str) -> Result<Vec<ImageName>, RegistryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .member_images
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, images)| images.clone())
            .unwrap_or_default())
    }

    async fn images_count(&self) -> Result<Count, RegistryError> {
        let (count, held) = {
            let mut state = self.state.lock().unwrap();
            let count = state
                .images_count
                .unwrap_or(Count::Known(state.images.len() as u64));
            (count, state.held_images_count.take())
        };
        if let Some(rx) = held {
            let _ = rx.await;
        }
        Ok(count)
    }

    async fn image_key(&self, index: u64) -> Result<ImageName, RegistryError> {
        self.lookup_index(CollectionKind::Images, index)
    }

    async fn image_detail(&self, name: &str) -> Result<ImageDetail, RegistryError> {
        let state = self.state.lock().unwrap();
        if state.failing_keys.contains(name) {
            return Err(Self::transport(name));
        }
        state
            .images
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| *d)
            .ok_or_else(|| RegistryError::Reverted("unknown image".into()))
    }

    async fn add_image(&self, name: &str, replicas: ReplicaArg) -> Result<TxRef, RegistryError> {
        let name = name.to_string();
        self.write(move |state| {
            let count = match &replicas {
                ReplicaArg::Plain(n) => *n,
                ReplicaArg::Sealed(_) => 0,
            };
            state.last_replicas = Some(replicas);
            state.images.push((
                name,
                ImageDetail {
                    replicas: count,
                    deployed: 0,
                    active: true,
                },
            ));
        })
        .await
    }

    async fn remove_image(&self, name: &str) -> Result<TxRef, RegistryError> {
        let name = name.to_string();
        self.write(move |state| {
            if let Some((_, detail)) = state.images.iter_mut().find(|(n, _)| *n == name) {
                detail.active = false;
            }
        })
        .await
    }
}

#[async_trait]
impl EventSource for MemoryRegistry {
    async fn subscribe(
        &self,
        _collection: CollectionKind,
    ) -> Result<BoxStream<'static, RawEvent>, RegistryError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let rx = self.events.subscribe();
        let events = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(events.boxed())
    }
}
