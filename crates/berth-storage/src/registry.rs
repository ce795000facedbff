use crate::revision::{EventAction, RevisionedStore, StoredEvent, Versioned, Watcher};
use crate::{Result, StorageError};
use berth_core::{Resource, ResourceKey, WatchEvent, WatchEventType};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Typed access to resources in a `RevisionedStore`.
///
/// Objects are stored as JSON under their `ResourceKey` storage key. The
/// revision a read returns is written into `metadata.resourceVersion`.
#[derive(Clone)]
pub struct Registry {
    store: Arc<RevisionedStore>,
}

impl Registry {
    pub fn new(store: Arc<RevisionedStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RevisionedStore> {
        &self.store
    }

    pub fn get<T: Resource>(&self, key: &ResourceKey) -> Result<Option<T>> {
        match self.store.get(&key.storage_key())? {
            Some(versioned) => Ok(Some(decode(&versioned)?)),
            None => Ok(None),
        }
    }

    /// Create or replace an object. Returns it stamped with the new revision.
    pub fn put<T: Resource>(&self, mut resource: T) -> Result<T> {
        resource
            .validate()
            .map_err(|e| StorageError::invalid_object(format!("{} rejected: {}", T::KIND, e)))?;
        let key = resource
            .resource_key()
            .map_err(|e| StorageError::invalid_object(e.to_string()))?;

        // The stored revision lives in the envelope, not in the payload
        resource.metadata_mut().resource_version = None;
        let data = serde_json::to_vec(&resource)?;

        let revision = self.store.put(&key.storage_key(), &data)?;
        resource.set_revision(revision);

        debug!("Stored {} at revision {}", key, revision);
        Ok(resource)
    }

    /// Delete an object. Returns the delete revision, or `None` if it was absent.
    pub fn delete(&self, key: &ResourceKey) -> Result<Option<u64>> {
        let revision = self.store.delete(&key.storage_key())?;
        if let Some(revision) = revision {
            info!("Deleted {} at revision {}", key, revision);
        }
        Ok(revision)
    }

    /// All objects of kind `T`, plus the revision the listing is consistent with
    pub fn list<T: Resource>(&self) -> Result<(Vec<T>, u64)> {
        self.list_prefix(&T::gvk().storage_prefix())
    }

    /// Objects of kind `T` in one namespace
    pub fn list_namespaced<T: Resource>(&self, namespace: &str) -> Result<(Vec<T>, u64)> {
        let prefix = format!("{}{}/", T::gvk().storage_prefix(), namespace);
        self.list_prefix(&prefix)
    }

    /// Watch objects of kind `T` changed after `from_revision`
    pub fn watch<T: Resource>(&self, from_revision: u64) -> Result<TypedWatcher<T>> {
        let inner = self.store.watch(&T::gvk().storage_prefix(), from_revision)?;
        Ok(TypedWatcher {
            inner,
            _kind: PhantomData,
        })
    }

    fn list_prefix<T: Resource>(&self, prefix: &str) -> Result<(Vec<T>, u64)> {
        let (items, revision) = self.store.list(prefix)?;

        let mut objects = Vec::with_capacity(items.len());
        for (key, versioned) in items {
            match decode::<T>(&versioned) {
                Ok(object) => objects.push(object),
                Err(e) => warn!("Skipping undecodable {} at {}: {}", T::KIND, key, e),
            }
        }

        Ok((objects, revision))
    }
}

/// Watch stream decoding events into `T`
pub struct TypedWatcher<T> {
    inner: Watcher,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource> TypedWatcher<T> {
    /// Next change. The end of the stream is reported as `WatchClosed` so
    /// callers resume the same way they do after a lag.
    pub async fn next(&mut self) -> Result<WatchEvent<T>> {
        match self.inner.next().await? {
            Some(event) => Ok(self.convert(event)),
            None => Err(StorageError::WatchClosed {
                last_revision: self.inner.last_revision(),
            }),
        }
    }

    pub fn last_revision(&self) -> u64 {
        self.inner.last_revision()
    }

    fn convert(&self, event: StoredEvent) -> WatchEvent<T> {
        let event_type = match event.action {
            EventAction::Put { created: true } => WatchEventType::Added,
            EventAction::Put { created: false } => WatchEventType::Modified,
            EventAction::Delete => WatchEventType::Deleted,
        };

        let object = match (event_type, event.value) {
            (WatchEventType::Deleted, _) | (_, None) => None,
            (_, Some(value)) => {
                let versioned = Versioned {
                    revision: event.revision,
                    value,
                };
                match decode::<T>(&versioned) {
                    Ok(object) => Some(object),
                    Err(e) => {
                        warn!("Undecodable {} event at {}: {}", T::KIND, event.key, e);
                        None
                    }
                }
            }
        };

        WatchEvent {
            event_type,
            key: event.key,
            object,
            revision: event.revision,
        }
    }
}

fn decode<T: Resource>(versioned: &Versioned) -> Result<T> {
    let mut object: T = serde_json::from_slice(&versioned.value)?;
    object.set_revision(versioned.revision);
    Ok(object)
}
