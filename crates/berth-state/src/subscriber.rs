use crate::ledger::ledger_key_from_storage;
use crate::StateError;
use berth_core::Resource;
use berth_storage::{Registry, StorageError};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A topology change forwarded to the coordinator
#[derive(Debug, Clone)]
pub enum Observed<T> {
    Upsert(T),
    Remove {
        /// Ledger key (`name` or `namespace/name`)
        key: String,
        revision: Option<u64>,
    },
    /// Full listing taken at `revision`
    Resync { items: Vec<T>, revision: u64 },
}

/// Retry behaviour of a change subscriber
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberStatus {
    Starting,
    Watching { revision: u64 },
    Retrying { attempt: u32, reason: String },
    Failed { reason: String },
    Stopped,
}

impl fmt::Display for SubscriberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriberStatus::Starting => write!(f, "starting"),
            SubscriberStatus::Watching { revision } => write!(f, "watching from revision {}", revision),
            SubscriberStatus::Retrying { attempt, reason } => {
                write!(f, "retrying (attempt {}): {}", attempt, reason)
            }
            SubscriberStatus::Failed { reason } => write!(f, "failed: {}", reason),
            SubscriberStatus::Stopped => write!(f, "stopped"),
        }
    }
}

enum Outcome {
    Continue,
    Stop,
}

/// Keeps the coordinator's view of one resource kind in sync with storage.
///
/// Lists the kind, forwards the listing as a resync, then follows the watch
/// stream. Lost streams are resumed from the last seen revision after an
/// exponential backoff; a compacted revision forces a fresh listing.
pub struct ChangeSubscriber<T> {
    registry: Registry,
    sink: mpsc::Sender<Observed<T>>,
    config: SubscriberConfig,
    status: watch::Sender<SubscriberStatus>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource> ChangeSubscriber<T> {
    pub fn new(
        registry: Registry,
        sink: mpsc::Sender<Observed<T>>,
        config: SubscriberConfig,
    ) -> (Self, watch::Receiver<SubscriberStatus>) {
        let (status, status_rx) = watch::channel(SubscriberStatus::Starting);
        (
            Self {
                registry,
                sink,
                config,
                status,
                _kind: PhantomData,
            },
            status_rx,
        )
    }

    /// Run until cancelled, the coordinator goes away, or retries run out
    pub async fn run(self, token: CancellationToken) {
        info!("Starting {} subscriber", T::KIND);

        let mut attempt = 0u32;
        let mut backoff = self.config.initial_backoff;
        // None forces a fresh listing before the next watch
        let mut resume_from: Option<u64> = None;

        loop {
            if token.is_cancelled() {
                break;
            }

            let revision = match resume_from {
                Some(revision) => revision,
                None => match self.relist().await {
                    Ok(Some(revision)) => revision,
                    Ok(None) => break,
                    Err(e) => {
                        attempt += 1;
                        match self.back_off(attempt, &mut backoff, e.to_string(), &token).await {
                            Outcome::Continue => continue,
                            Outcome::Stop => return,
                        }
                    }
                },
            };

            let mut watcher = match self.registry.watch::<T>(revision) {
                Ok(watcher) => watcher,
                Err(StorageError::Compacted { compacted, .. }) => {
                    let err = StateError::watch_resume_failed(
                        T::KIND,
                        revision,
                        format!("history compacted up to revision {}", compacted),
                    );
                    warn!("{}; listing again", err);
                    resume_from = None;
                    continue;
                }
                Err(e) => {
                    attempt += 1;
                    match self.back_off(attempt, &mut backoff, e.to_string(), &token).await {
                        Outcome::Continue => continue,
                        Outcome::Stop => return,
                    }
                }
            };

            debug!("Watching {} from revision {}", T::KIND, revision);
            self.status
                .send_replace(SubscriberStatus::Watching { revision });
            attempt = 0;
            backoff = self.config.initial_backoff;
            resume_from = Some(revision);

            let failure = loop {
                tokio::select! {
                    _ = token.cancelled() => break None,
                    next = watcher.next() => match next {
                        Ok(event) => {
                            resume_from = Some(event.revision);

                            let observed = if event.is_remove() {
                                Observed::Remove {
                                    key: ledger_key_from_storage::<T>(&event.key),
                                    revision: Some(event.revision),
                                }
                            } else {
                                match event.object {
                                    Some(object) => Observed::Upsert(object),
                                    None => {
                                        debug!("Ignoring {} event without payload at {}", T::KIND, event.key);
                                        continue;
                                    }
                                }
                            };

                            if self.sink.send(observed).await.is_err() {
                                debug!("Coordinator gone, stopping {} subscriber", T::KIND);
                                break None;
                            }
                        }
                        Err(e) => {
                            resume_from = Some(watcher.last_revision());
                            break Some(e);
                        }
                    }
                }
            };

            let Some(e) = failure else {
                break;
            };

            if e.is_resumable() {
                info!(
                    "{} watch interrupted at revision {}: {}",
                    T::KIND,
                    watcher.last_revision(),
                    e
                );
            } else {
                warn!("{} watch failed: {}", T::KIND, e);
            }

            attempt += 1;
            if let Outcome::Stop = self.back_off(attempt, &mut backoff, e.to_string(), &token).await {
                return;
            }
        }

        self.status.send_replace(SubscriberStatus::Stopped);
        info!("{} subscriber stopped", T::KIND);
    }

    /// List the kind and forward it as a resync. `Ok(None)` means the
    /// coordinator is gone.
    async fn relist(&self) -> Result<Option<u64>, StorageError> {
        let (items, revision) = self.registry.list::<T>()?;
        debug!(
            "Listed {} {} objects at revision {}",
            items.len(),
            T::KIND,
            revision
        );

        if self
            .sink
            .send(Observed::Resync { items, revision })
            .await
            .is_err()
        {
            return Ok(None);
        }
        Ok(Some(revision))
    }

    async fn back_off(
        &self,
        attempt: u32,
        backoff: &mut Duration,
        reason: String,
        token: &CancellationToken,
    ) -> Outcome {
        if let Some(max) = self.config.max_retries {
            if attempt > max {
                error!(
                    "{} subscriber giving up after {} attempts: {}",
                    T::KIND,
                    max,
                    reason
                );
                self.status.send_replace(SubscriberStatus::Failed { reason });
                return Outcome::Stop;
            }
        }

        debug!(
            "{} subscriber retrying in {:?} (attempt {})",
            T::KIND,
            backoff,
            attempt
        );
        self.status
            .send_replace(SubscriberStatus::Retrying { attempt, reason });

        tokio::select! {
            _ = token.cancelled() => {
                self.status.send_replace(SubscriberStatus::Stopped);
                return Outcome::Stop;
            }
            _ = tokio::time::sleep(*backoff) => {}
        }

        *backoff = (*backoff * 2).min(self.config.max_backoff);
        Outcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{Node, NodeResources};
    use berth_storage::{RedbBackend, RevisionedStore, StoreConfig};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn create_test_registry(dir: &std::path::Path, config: StoreConfig) -> Registry {
        let kv = Arc::new(RedbBackend::new(dir.join("test.redb")).unwrap());
        Registry::new(Arc::new(RevisionedStore::new(kv, config).unwrap()))
    }

    fn fast_config() -> SubscriberConfig {
        SubscriberConfig {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_retries: None,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Observed<Node>>) -> Observed<Node> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn upserted_name(observed: Observed<Node>) -> (String, u64) {
        match observed {
            Observed::Upsert(node) => (node.name().to_string(), node.revision().unwrap()),
            other => panic!("expected upsert, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lists_then_watches() {
        let dir = tempdir().unwrap();
        let registry = create_test_registry(dir.path(), StoreConfig::default());
        registry
            .put(Node::new("node-a", NodeResources::default()))
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let (subscriber, mut status) = ChangeSubscriber::<Node>::new(registry.clone(), tx, fast_config());
        let token = CancellationToken::new();
        let handle = tokio::spawn(subscriber.run(token.clone()));

        match recv(&mut rx).await {
            Observed::Resync { items, revision } => {
                assert_eq!(items.len(), 1);
                assert_eq!(revision, 1);
            }
            other => panic!("expected resync, got {:?}", other),
        }

        status
            .wait_for(|s| matches!(s, SubscriberStatus::Watching { .. }))
            .await
            .unwrap();

        let node = registry
            .put(Node::new("node-b", NodeResources::default()))
            .unwrap();
        assert_eq!(upserted_name(recv(&mut rx).await), ("node-b".to_string(), 2));

        registry.delete(&node.resource_key().unwrap()).unwrap();
        match recv(&mut rx).await {
            Observed::Remove { key, revision } => {
                assert_eq!(key, "node-b");
                assert_eq!(revision, Some(3));
            }
            other => panic!("expected remove, got {:?}", other),
        }

        token.cancel();
        handle.await.unwrap();
        assert_eq!(*status.borrow(), SubscriberStatus::Stopped);
    }

    #[tokio::test]
    async fn test_resumes_after_disconnect_without_gaps() {
        let dir = tempdir().unwrap();
        let registry = create_test_registry(dir.path(), StoreConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        let (subscriber, mut status) = ChangeSubscriber::<Node>::new(registry.clone(), tx, fast_config());
        let token = CancellationToken::new();
        let handle = tokio::spawn(subscriber.run(token.clone()));

        assert!(matches!(recv(&mut rx).await, Observed::Resync { .. }));
        status
            .wait_for(|s| matches!(s, SubscriberStatus::Watching { .. }))
            .await
            .unwrap();

        registry
            .put(Node::new("node-a", NodeResources::default()))
            .unwrap();
        assert_eq!(upserted_name(recv(&mut rx).await).1, 1);

        registry.store().disconnect_watchers();
        // Lands while the subscriber is backing off
        registry
            .put(Node::new("node-b", NodeResources::default()))
            .unwrap();
        registry
            .put(Node::new("node-c", NodeResources::default()))
            .unwrap();

        assert_eq!(upserted_name(recv(&mut rx).await), ("node-b".to_string(), 2));
        assert_eq!(upserted_name(recv(&mut rx).await), ("node-c".to_string(), 3));

        token.cancel();
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relists_after_compaction() {
        let dir = tempdir().unwrap();
        let registry = create_test_registry(
            dir.path(),
            StoreConfig {
                history_limit: 1,
                watch_buffer: 16,
            },
        );

        let (tx, mut rx) = mpsc::channel(16);
        let (subscriber, mut status) = ChangeSubscriber::<Node>::new(registry.clone(), tx, fast_config());
        let token = CancellationToken::new();
        let handle = tokio::spawn(subscriber.run(token.clone()));

        assert!(matches!(recv(&mut rx).await, Observed::Resync { .. }));
        status
            .wait_for(|s| matches!(s, SubscriberStatus::Watching { .. }))
            .await
            .unwrap();

        registry.store().disconnect_watchers();
        for name in ["node-a", "node-b", "node-c"] {
            registry
                .put(Node::new(name, NodeResources::default()))
                .unwrap();
        }

        // Revision 0 fell out of history, so the subscriber lists again
        loop {
            match recv(&mut rx).await {
                Observed::Resync { items, revision } => {
                    assert_eq!(items.len(), 3);
                    assert_eq!(revision, 3);
                    break;
                }
                Observed::Upsert(_) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let dir = tempdir().unwrap();
        let registry = create_test_registry(dir.path(), StoreConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        let config = SubscriberConfig {
            max_retries: Some(0),
            ..fast_config()
        };
        let (subscriber, mut status) = ChangeSubscriber::<Node>::new(registry.clone(), tx, config);
        let handle = tokio::spawn(subscriber.run(CancellationToken::new()));

        assert!(matches!(recv(&mut rx).await, Observed::Resync { .. }));
        status
            .wait_for(|s| matches!(s, SubscriberStatus::Watching { .. }))
            .await
            .unwrap();

        registry.store().disconnect_watchers();
        handle.await.unwrap();
        assert!(matches!(*status.borrow(), SubscriberStatus::Failed { .. }));
    }
}
