//! Per-worker connection slot: lazy creation, single-shot replacement and
//! guaranteed close on every exit path.

use crate::store::{Connection, Store, StoreError, WorkerId};
use std::sync::Arc;

/// Owns at most one connection for one worker. Never shared.
pub struct ConnectionManager {
    worker_id: WorkerId,
    store: Arc<dyn Store>,
    slot: Option<Box<dyn Connection>>,
}

impl ConnectionManager {
    pub fn new(worker_id: WorkerId, store: Arc<dyn Store>) -> Self {
        Self {
            worker_id,
            store,
            slot: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.slot.is_some()
    }

    /// Return the cached connection, creating it on first use.
    pub async fn get(&mut self) -> Result<&mut Box<dyn Connection>, StoreError> {
        if self.slot.is_none() {
            let conn = self.store.connect(self.worker_id).await?;
            tracing::debug!(worker_id = self.worker_id, "Connection opened");
            self.slot = Some(conn);
        }
        self.slot
            .as_mut()
            .ok_or_else(|| StoreError::Connect("connection slot empty".into()))
    }

    /// Make exactly one attempt at a fresh connection.
    ///
    /// On success the previous connection is closed and discarded; on failure
    /// the previous one (possibly broken) stays in the slot.
    pub async fn replace(&mut self) -> Result<(), StoreError> {
        let fresh = self.store.connect(self.worker_id).await?;
        if let Some(old) = self.slot.replace(fresh) {
            if let Err(e) = old.close().await {
                tracing::debug!(worker_id = self.worker_id, error = %e, "Closing replaced connection failed");
            }
        }
        tracing::debug!(worker_id = self.worker_id, "Connection replaced");
        Ok(())
    }

    /// Close the owned connection, if any.
    pub async fn close(&mut self) {
        if let Some(conn) = self.slot.take() {
            if let Err(e) = conn.close().await {
                tracing::debug!(worker_id = self.worker_id, error = %e, "Connection close failed");
            }
        }
    }
}

impl Drop for ConnectionManager {
    // Reached with a live connection only when the owning task was aborted or
    // panicked before `close`.
    fn drop(&mut self) {
        let Some(conn) = self.slot.take() else {
            return;
        };
        let worker_id = self.worker_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.close().await {
                        tracing::debug!(worker_id, error = %e, "Deferred connection close failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(worker_id, "No runtime available, dropping connection without close");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("worker_id", &self.worker_id)
            .field("store", &self.store.name())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockStore;

    #[tokio::test]
    async fn get_connects_once_and_caches() {
        let store = Arc::new(MockStore::new());
        let mut manager = ConnectionManager::new(0, store.clone());
        assert!(!manager.is_connected());
        manager.get().await.unwrap();
        manager.get().await.unwrap();
        assert_eq!(store.connects(), 1);
        manager.close().await;
        assert_eq!(store.closes(), 1);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn replace_closes_previous_connection() {
        let store = Arc::new(MockStore::new());
        let mut manager = ConnectionManager::new(3, store.clone());
        manager.get().await.unwrap();
        manager.replace().await.unwrap();
        assert_eq!(store.connects(), 2);
        assert_eq!(store.closes(), 1);
        manager.close().await;
        assert_eq!(store.closes(), 2);
    }

    #[tokio::test]
    async fn failed_replace_keeps_existing_connection() {
        let store = Arc::new(MockStore::new().with_max_connects(1));
        let mut manager = ConnectionManager::new(1, store.clone());
        manager.get().await.unwrap();
        assert!(manager.replace().await.is_err());
        assert!(manager.is_connected());
        assert_eq!(store.closes(), 0);
        assert_eq!(store.connect_failures(), 1);
    }

    #[tokio::test]
    async fn drop_without_close_still_closes() {
        let store = Arc::new(MockStore::new());
        {
            let mut manager = ConnectionManager::new(2, store.clone());
            manager.get().await.unwrap();
        }
        for _ in 0..10 {
            if store.closes() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.closes(), 1);
    }
}
