//! Connection groups
//!
//! A group is a non-owning registry of connections sharing properties,
//! security parameters, and framers. Members hold the strong references; the
//! group keeps weak ones keyed by connection id and members self-deregister
//! when they close. Bulk close/abort applies to every member concurrently.

use crate::connection::{Connection, ConnectionInner};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tapestry_core::error::Result;
use tapestry_core::properties::TransportProperties;
use tapestry_core::security::SecurityParameters;
use tapestry_framing::Framer;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Advisory scheduling hint for multistream-capable transports
///
/// The default scheduler hands the caller's chosen connection through
/// unchanged; the others are metadata a multistreaming send path may consult
/// when routing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupScheduler {
    Default,
    Weighted,
    Fifo,
    Lru,
}

impl Default for GroupScheduler {
    fn default() -> Self {
        GroupScheduler::Default
    }
}

/// State shared by every member of a group
#[derive(Clone)]
pub struct SharedGroupState {
    pub properties: TransportProperties,
    pub security: SecurityParameters,
    pub framers: Vec<Arc<dyn Framer>>,
    pub scheduler: GroupScheduler,
}

/// A non-owning registry of related connections
pub struct ConnectionGroup {
    id: Uuid,
    shared: RwLock<SharedGroupState>,
    members: StdMutex<HashMap<Uuid, Weak<ConnectionInner>>>,
    /// Bumped on every shared-state update; members compare before I/O
    epoch: AtomicU64,
}

impl ConnectionGroup {
    pub fn new(
        properties: TransportProperties,
        security: SecurityParameters,
        framers: Vec<Arc<dyn Framer>>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            shared: RwLock::new(SharedGroupState {
                properties,
                security,
                framers,
                scheduler: GroupScheduler::default(),
            }),
            members: StdMutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Add a connection; adding an existing member is a no-op
    pub fn insert(&self, connection: &Connection) {
        let mut members = self.members.lock().expect("members lock poisoned");
        members
            .entry(connection.id())
            .or_insert_with(|| Arc::downgrade(&connection.inner));
        debug!(group = %self.id, connection = %connection.id(), "connection joined group");
    }

    /// Remove a connection by id; removing a non-member is a no-op
    pub fn remove(&self, connection_id: Uuid) {
        let mut members = self.members.lock().expect("members lock poisoned");
        if members.remove(&connection_id).is_some() {
            debug!(group = %self.id, connection = %connection_id, "connection left group");
        }
    }

    pub fn contains(&self, connection_id: Uuid) -> bool {
        self.members
            .lock()
            .expect("members lock poisoned")
            .contains_key(&connection_id)
    }

    /// Live members, dropping any that have already been destroyed
    pub fn connections(&self) -> Vec<Connection> {
        let mut members = self.members.lock().expect("members lock poisoned");
        members.retain(|_, weak| weak.strong_count() > 0);
        members
            .values()
            .filter_map(|weak| weak.upgrade().map(|inner| Connection { inner }))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members
            .lock()
            .expect("members lock poisoned")
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the shared state
    pub async fn shared(&self) -> SharedGroupState {
        self.shared.read().await.clone()
    }

    /// Current shared-state epoch; bumped on every update
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub async fn scheduler(&self) -> GroupScheduler {
        self.shared.read().await.scheduler
    }

    pub async fn set_scheduler(&self, scheduler: GroupScheduler) {
        self.update_shared_properties(|shared| shared.scheduler = scheduler)
            .await;
    }

    /// Apply a mutator to the shared state and notify members
    ///
    /// Members observe the change through the epoch before their next I/O;
    /// there is no synchronous fan-out.
    pub async fn update_shared_properties<F>(&self, updater: F)
    where
        F: FnOnce(&mut SharedGroupState),
    {
        {
            let mut shared = self.shared.write().await;
            updater(&mut shared);
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        debug!(group = %self.id, epoch = self.epoch(), "shared group state updated");
    }

    /// Close every member concurrently and wait for all of them
    pub async fn close_all(&self) -> Result<()> {
        let members = self.connections();
        debug!(group = %self.id, count = members.len(), "closing group");
        futures::future::join_all(members.iter().map(|c| c.close())).await;
        Ok(())
    }

    /// Abort every member concurrently and wait for all of them
    pub async fn abort_all(&self) -> Result<()> {
        let members = self.connections();
        debug!(group = %self.id, count = members.len(), "aborting group");
        futures::future::join_all(members.iter().map(|c| c.abort())).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> ConnectionGroup {
        ConnectionGroup::new(
            TransportProperties::default(),
            SecurityParameters::disabled(),
            vec![],
        )
    }

    #[tokio::test]
    async fn test_scheduler_default() {
        let group = group();
        assert_eq!(group.scheduler().await, GroupScheduler::Default);
        group.set_scheduler(GroupScheduler::Weighted).await;
        assert_eq!(group.scheduler().await, GroupScheduler::Weighted);
    }

    #[tokio::test]
    async fn test_update_bumps_epoch() {
        let group = group();
        assert_eq!(group.epoch(), 0);

        group
            .update_shared_properties(|shared| {
                shared.properties.keep_alive = tapestry_core::properties::Preference::Require;
            })
            .await;
        assert_eq!(group.epoch(), 1);
        assert_eq!(
            group.shared().await.properties.keep_alive,
            tapestry_core::properties::Preference::Require
        );
    }

    #[tokio::test]
    async fn test_empty_group_bulk_ops() {
        let group = group();
        assert!(group.is_empty());
        group.close_all().await.unwrap();
        group.abort_all().await.unwrap();
    }

    #[test]
    fn test_remove_nonmember_is_noop() {
        let group = group();
        group.remove(Uuid::now_v7());
        assert!(group.is_empty());
    }
}
