//! Collection reconciliation.
//!
//! A pass reads the collection size, walks `[0, count)` fetching each
//! entry's key and then its detail record, keeps the active entries and
//! publishes them as a new snapshot.  Passes are stamped with the
//! refresh generation they started under; a pass that has been
//! overtaken by a newer one throws its result away instead of
//! publishing it.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, FuturesUnordered, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::error::RegistryError;
use crate::refresh::Generation;
use crate::registry::{RegistryClient, RegistryLink};
use crate::status::StatusLine;
use crate::types::{CollectionKind, Count, Image, Member};

/// How to enumerate one registry collection.
#[async_trait]
pub trait Collection: Send + Sync + 'static {
    type Entry: Clone + Send + Sync + 'static;

    const KIND: CollectionKind;

    async fn count(client: &dyn RegistryClient) -> Result<Count, RegistryError>;

    /// Fetches the key at `index`, then that key's detail record.
    async fn fetch(client: &dyn RegistryClient, index: u64) -> Result<Self::Entry, RegistryError>;

    fn is_active(entry: &Self::Entry) -> bool;
}

pub struct Members;

#[async_trait]
impl Collection for Members {
    type Entry = Member;

    const KIND: CollectionKind = CollectionKind::Members;

    async fn count(client: &dyn RegistryClient) -> Result<Count, RegistryError> {
        client.members_count().await
    }

    async fn fetch(client: &dyn RegistryClient, index: u64) -> Result<Member, RegistryError> {
        let host = client.member_key(index).await?;
        let detail = client.member_detail(&host).await?;
        Ok(Member {
            host,
            image_name: detail.image_name,
            active: detail.active,
            encrypted_memory: detail.encrypted_memory,
        })
    }

    fn is_active(entry: &Member) -> bool {
        entry.active
    }
}

pub struct Images;

#[async_trait]
impl Collection for Images {
    type Entry = Image;

    const KIND: CollectionKind = CollectionKind::Images;

    async fn count(client: &dyn RegistryClient) -> Result<Count, RegistryError> {
        client.images_count().await
    }

    async fn fetch(client: &dyn RegistryClient, index: u64) -> Result<Image, RegistryError> {
        let name = client.image_key(index).await?;
        let detail = client.image_detail(&name).await?;
        Ok(Image {
            name,
            replicas: detail.replicas,
            deployed: detail.deployed,
            active: detail.active,
        })
    }

    fn is_active(entry: &Image) -> bool {
        entry.active
    }
}

/// Lazily walks `[0, count)`, yielding each index with its fetch result.
///
/// Nothing is fetched until the stream is polled, and a fresh stream
/// can be created at any time to restart the walk.
pub fn enumerate<'a, C: Collection>(
    client: &'a dyn RegistryClient,
    count: u64,
) -> impl Stream<Item = (u64, Result<C::Entry, RegistryError>)> + Send + 'a {
    stream::iter(0..count).then(move |index| async move { (index, C::fetch(client, index).await) })
}

/// Materializes the active entries among the first `count` indices.
///
/// Entries that fail to load are logged and skipped; order follows
/// the registry's index order.
pub async fn collect_active<C: Collection>(client: &dyn RegistryClient, count: u64) -> Vec<C::Entry> {
    let mut active = Vec::new();
    let mut entries = Box::pin(enumerate::<C>(client, count));
    while let Some((index, result)) = entries.next().await {
        match result {
            Ok(entry) if C::is_active(&entry) => active.push(entry),
            Ok(_) => {}
            Err(e) => warn!("Skipping {} entry {}: {}", C::KIND, index, e),
        }
    }
    active
}

/// A published, immutable view of one collection.
#[derive(Debug)]
pub struct Snapshot<T> {
    /// Generation of the pass that produced this snapshot.
    pub generation: Generation,
    pub entries: Arc<Vec<T>>,
    /// Total entries the registry reported, active or not.  `None`
    /// until a pass has completed against a resolved registry.
    pub registered: Option<u64>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            entries: Arc::clone(&self.entries),
            registered: self.registered,
        }
    }
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self {
            generation: 0,
            entries: Arc::new(Vec::new()),
            registered: None,
        }
    }
}

/// What a single pass ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// A new snapshot with this many active entries was published.
    Applied(usize),
    /// The count was unknown or unreadable; the previous snapshot stands.
    Skipped,
    /// A newer pass started before this one finished.
    Discarded,
}

/// Owns the materialized list of one collection.
pub struct Reconciler<C: Collection> {
    published: watch::Sender<Snapshot<C::Entry>>,
    latest_started: AtomicU64,
    status: StatusLine,
    _collection: PhantomData<C>,
}

impl<C: Collection> Reconciler<C> {
    pub fn new(status: StatusLine) -> Self {
        let (published, _) = watch::channel(Snapshot::default());
        Self {
            published,
            latest_started: AtomicU64::new(0),
            status,
            _collection: PhantomData,
        }
    }

    pub fn snapshot(&self) -> Snapshot<C::Entry> {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<C::Entry>> {
        self.published.subscribe()
    }

    /// Runs one pass for `generation` against `client`.
    ///
    /// With no client (registry unresolved) the collection degrades to
    /// an empty list.
    pub async fn reconcile(
        &self,
        generation: Generation,
        client: Option<Arc<dyn RegistryClient>>,
    ) -> PassOutcome {
        self.latest_started.fetch_max(generation, Ordering::SeqCst);

        let Some(client) = client else {
            return self.publish(generation, Vec::new(), None);
        };

        let count = match C::count(client.as_ref()).await {
            Ok(Count::Known(n)) => n,
            Ok(Count::Unknown) => {
                debug!("{} count unknown; keeping previous list", C::KIND);
                return PassOutcome::Skipped;
            }
            Err(e) => {
                warn!("Failed to read {} count: {}", C::KIND, e);
                self.status.set(format!("Failed to load {}: {}", C::KIND, e));
                return PassOutcome::Skipped;
            }
        };

        let active = collect_active::<C>(client.as_ref(), count).await;
        self.publish(generation, active, Some(count))
    }

    fn publish(
        &self,
        generation: Generation,
        entries: Vec<C::Entry>,
        registered: Option<u64>,
    ) -> PassOutcome {
        let len = entries.len();
        let latest = self.latest_started.load(Ordering::SeqCst);
        let applied = self.published.send_if_modified(|current| {
            if generation < latest || generation < current.generation {
                return false;
            }
            *current = Snapshot {
                generation,
                entries: Arc::new(entries),
                registered,
            };
            true
        });
        if applied {
            info!(
                "Reconciled {}: {} active of {} registered (generation {})",
                C::KIND,
                len,
                registered.map_or_else(|| "?".to_string(), |n| n.to_string()),
                generation
            );
            PassOutcome::Applied(len)
        } else {
            debug!(
                "Discarding stale {} pass from generation {} (latest {})",
                C::KIND,
                generation,
                latest
            );
            PassOutcome::Discarded
        }
    }

    /// Starts a pass for every new generation until the counter closes.
    ///
    /// Passes run concurrently on the caller's task; an overtaken pass
    /// finishes but its result is discarded.
    pub async fn run(
        &self,
        mut generations: watch::Receiver<Generation>,
        registry: watch::Receiver<Option<RegistryLink>>,
    ) {
        let mut inflight = FuturesUnordered::new();
        loop {
            tokio::select! {
                changed = generations.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let generation = *generations.borrow_and_update();
                    let client = registry.borrow().as_ref().map(|link| Arc::clone(&link.client));
                    inflight.push(self.reconcile(generation, client));
                }
                Some(_) = inflight.next(), if !inflight.is_empty() => {}
            }
        }
        while inflight.next().await.is_some() {}
    }
}
