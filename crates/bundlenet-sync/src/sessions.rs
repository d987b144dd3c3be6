//! Per-peer session ownership.
//!
//! Ratchet state is a single mutable sequence per remote peer. Every load
//! and save goes through a [`PeerGuard`], so at most one task touches a
//! peer's session at a time while different peers proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use bundlenet_core::{Adu, Direction, EncryptedBundleId, PeerId};
use bundlenet_session::SessionState;
use bundlenet_store::{AbsorbedBundle, Store};

use crate::error::Result;

/// Exclusive access to one peer's session for the guard's lifetime.
pub struct PeerGuard {
    peer: PeerId,
    _lock: OwnedMutexGuard<()>,
}

impl PeerGuard {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

/// Loads and saves session state under per-peer locks.
pub struct SessionManager<S: Store> {
    store: Arc<S>,
    locks: Mutex<HashMap<PeerId, Arc<AsyncMutex<()>>>>,
}

impl<S: Store> SessionManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `peer`.
    ///
    /// Locks nobody holds or waits on are dropped from the table here, so
    /// it stays bounded by the number of peers in flight.
    pub async fn lock(&self, peer: &PeerId) -> PeerGuard {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(*peer).or_default().clone()
        };
        PeerGuard {
            peer: *peer,
            _lock: lock.lock_owned().await,
        }
    }

    pub async fn load(&self, guard: &PeerGuard) -> Result<Option<SessionState>> {
        match self.store.load_session(guard.peer()).await? {
            Some(bytes) => Ok(Some(SessionState::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, guard: &PeerGuard, state: &SessionState) -> Result<()> {
        self.store.save_session(guard.peer(), &state.to_bytes()?).await?;
        Ok(())
    }

    /// Persist the advanced session together with everything a decrypted
    /// bundle carried. Returns the number of ADUs that were new.
    pub async fn absorb(
        &self,
        guard: &PeerGuard,
        state: &SessionState,
        direction: Direction,
        counter: u64,
        encrypted_id: &EncryptedBundleId,
        adus: &[Adu],
    ) -> Result<usize> {
        let bundle = AbsorbedBundle {
            peer: *guard.peer(),
            direction,
            counter,
            encrypted_id: encrypted_id.clone(),
            session: state.to_bytes()?,
            adus: adus.to_vec(),
        };
        Ok(self.store.absorb_bundle(&bundle).await?)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        match self.locks.lock() {
            Ok(locks) => locks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Read a session without holding the lock. For inspection only.
    pub async fn peek(&self, peer: &PeerId) -> Result<Option<SessionState>> {
        match self.store.load_session(peer).await? {
            Some(bytes) => Ok(Some(SessionState::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlenet_session::{x3dh, Identity};
    use bundlenet_store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_save_and_load_under_guard() {
        let sessions = SessionManager::new(Arc::new(MemoryStore::new()));
        let endpoint = Identity::from_seed(&[1; 32]);
        let backend = Identity::from_seed(&[2; 32]);
        let state = x3dh::initiate(&endpoint, &backend.pre_key_bundle()).unwrap();

        let guard = sessions.lock(&backend.peer_id()).await;
        assert!(sessions.load(&guard).await.unwrap().is_none());
        sessions.save(&guard, &state).await.unwrap();
        let loaded = sessions.load(&guard).await.unwrap().unwrap();
        assert_eq!(loaded.remote_peer_id(), backend.peer_id());
    }

    #[tokio::test]
    async fn test_same_peer_is_serialized() {
        let sessions = Arc::new(SessionManager::new(Arc::new(MemoryStore::new())));
        let peer = PeerId::from_bytes([9; 32]);

        let guard = sessions.lock(&peer).await;
        let contender = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let _guard = sessions.lock(&peer).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_locks_are_pruned() {
        let sessions = SessionManager::new(Arc::new(MemoryStore::new()));
        for b in 0..50u8 {
            let _guard = sessions.lock(&PeerId::from_bytes([b; 32])).await;
        }
        let held = sessions.lock(&PeerId::from_bytes([200; 32])).await;
        assert_eq!(sessions.tracked(), 1);

        let _other = sessions.lock(&PeerId::from_bytes([201; 32])).await;
        assert_eq!(sessions.tracked(), 2);
        drop(held);
        let _third = sessions.lock(&PeerId::from_bytes([202; 32])).await;
        assert_eq!(sessions.tracked(), 2);
    }

    #[tokio::test]
    async fn test_absorb_saves_session_with_adus() {
        let store = Arc::new(MemoryStore::new());
        let sessions = SessionManager::new(store.clone());
        let endpoint = Identity::from_seed(&[1; 32]);
        let backend = Identity::from_seed(&[2; 32]);
        let state = x3dh::initiate(&endpoint, &backend.pre_key_bundle()).unwrap();
        let peer = backend.peer_id();
        let app = bundlenet_core::AppId::new("mail").unwrap();
        let adus: Vec<Adu> = (1..=2)
            .map(|seq| Adu::new(peer, app.clone(), seq, bytes::Bytes::from_static(b"m")))
            .collect();
        let id = EncryptedBundleId::parse("down1").unwrap();

        let guard = sessions.lock(&peer).await;
        let new = sessions
            .absorb(&guard, &state, Direction::Downstream, 1, &id, &adus)
            .await
            .unwrap();
        assert_eq!(new, 2);
        assert!(sessions.load(&guard).await.unwrap().is_some());
        assert!(store.has_received_bundle(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_different_peers_do_not_block() {
        let sessions = SessionManager::new(Arc::new(MemoryStore::new()));
        let _a = sessions.lock(&PeerId::from_bytes([1; 32])).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            sessions.lock(&PeerId::from_bytes([2; 32])),
        )
        .await;
        assert!(b.is_ok());
    }
}
