//! Change notification listener.
//!
//! Subscribes to member and image notifications of the active registry
//! and turns each recognised one into a refresh.  Subscriptions are
//! torn down and re-established whenever the registry handle changes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::refresh::{RefreshCoordinator, RefreshTrigger};
use crate::registry::{RawEvent, RegistryLink};
use crate::types::{CollectionKind, RegistryEvent, RegistryHandle};

pub struct ChangeListener {
    refresh: Arc<RefreshCoordinator>,
    retry_delay: Duration,
}

impl ChangeListener {
    pub fn new(refresh: Arc<RefreshCoordinator>, retry_delay: Duration) -> Self {
        Self {
            refresh,
            retry_delay,
        }
    }

    /// Handles one raw notification delivered on `collection`'s subscription.
    ///
    /// Returns the recognised event, or `None` when the payload was ignored.
    pub fn on_event(
        &self,
        handle: &RegistryHandle,
        collection: CollectionKind,
        raw: &RawEvent,
    ) -> Option<RegistryEvent> {
        let event = raw
            .topics
            .first()
            .and_then(|topic| handle.interface.classify(topic));
        match event {
            Some(event) if event.collection() == collection => {
                debug!("{:?} observed on {}", event, handle.address);
                self.refresh.bump(RefreshTrigger::Notification(event));
                Some(event)
            }
            _ => {
                debug!("Ignoring unexpected {} notification: {:?}", collection, raw);
                None
            }
        }
    }

    async fn subscribe_all(
        &self,
        link: &RegistryLink,
    ) -> Option<BoxStream<'static, (CollectionKind, RawEvent)>> {
        let members = link.events.subscribe(CollectionKind::Members).await;
        let images = link.events.subscribe(CollectionKind::Images).await;
        match (members, images) {
            (Ok(members), Ok(images)) => Some(
                stream::select(
                    members.map(|raw| (CollectionKind::Members, raw)),
                    images.map(|raw| (CollectionKind::Images, raw)),
                )
                .boxed(),
            ),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to subscribe to {} events: {}", link.handle.address, e);
                None
            }
        }
    }

    /// Listens on the current registry until the handle channel closes.
    pub async fn run(&self, mut registry: watch::Receiver<Option<RegistryLink>>) {
        loop {
            let link = registry.borrow_and_update().clone();
            let Some(link) = link else {
                if registry.changed().await.is_err() {
                    return;
                }
                continue;
            };

            let Some(mut events) = self.subscribe_all(&link).await else {
                tokio::select! {
                    changed = registry.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = sleep(self.retry_delay) => {}
                }
                continue;
            };
            info!("Listening for registry changes on {}", link.handle.address);
            self.refresh.bump(RefreshTrigger::Subscribed);

            loop {
                tokio::select! {
                    changed = registry.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        info!("Registry handle changed; re-registering listeners");
                        break;
                    }
                    next = events.next() => match next {
                        Some((collection, raw)) => {
                            self.on_event(&link.handle, collection, &raw);
                        }
                        None => {
                            warn!("Event stream for {} ended", link.handle.address);
                            sleep(self.retry_delay).await;
                            break;
                        }
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;

    #[test]
    fn recognised_events_bump_and_others_are_ignored() {
        let reg = MemoryRegistry::new();
        let handle = reg.handle("0x01");
        let refresh = Arc::new(RefreshCoordinator::new());
        let listener = ChangeListener::new(refresh.clone(), Duration::from_millis(10));

        let removed = RawEvent {
            topics: vec![handle.interface.image_removed_topic.clone()],
        };
        assert_eq!(
            listener.on_event(&handle, CollectionKind::Images, &removed),
            Some(RegistryEvent::ImageRemoved)
        );
        assert_eq!(refresh.current_generation(), 1);

        // Wrong collection, unknown topic, no topics at all.
        assert_eq!(listener.on_event(&handle, CollectionKind::Members, &removed), None);
        let junk = RawEvent {
            topics: vec!["0x1234".into()],
        };
        assert_eq!(listener.on_event(&handle, CollectionKind::Images, &junk), None);
        let empty = RawEvent { topics: vec![] };
        assert_eq!(listener.on_event(&handle, CollectionKind::Images, &empty), None);
        assert_eq!(refresh.current_generation(), 1);
    }

    #[tokio::test]
    async fn run_refreshes_on_subscription_notifications_and_handle_change() {
        let reg = Arc::new(MemoryRegistry::new());
        let refresh = Arc::new(RefreshCoordinator::new());
        let listener = ChangeListener::new(refresh.clone(), Duration::from_millis(10));
        let (link_tx, link_rx) = watch::channel(Some(reg.link("0x01")));
        let mut generations = refresh.subscribe();

        let driver = listener.run(link_rx);
        let check = async move {
            while reg.subscriptions() < 2 {
                tokio::task::yield_now().await;
            }
            // Subscribing alone refreshes, covering changes mined before it.
            assert_eq!(*generations.borrow_and_update(), 1);
            reg.emit(RegistryEvent::MemberAdded);
            generations.changed().await.unwrap();
            assert_eq!(*generations.borrow_and_update(), 2);

            link_tx.send_replace(Some(reg.link("0x02")));
            while reg.subscriptions() < 4 {
                tokio::task::yield_now().await;
            }
            assert_eq!(*generations.borrow_and_update(), 3);
            reg.emit(RegistryEvent::ImageRemoved);
            generations.changed().await.unwrap();
            assert_eq!(*generations.borrow_and_update(), 4);
            drop(link_tx);
        };
        tokio::join!(driver, check);
    }
}
