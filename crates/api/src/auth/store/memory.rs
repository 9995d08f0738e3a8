//! In-process stores for tests and single-node development
//!
//! Each store keeps its state behind one async mutex, so every trait method
//! is a single critical section and conditional writes are atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{SessionStore, StoreError, UserStore};
use crate::auth::sessions::{RefreshSession, Revocation, RevocationReason};
use crate::auth::users::{User, UserProfile};

#[derive(Default)]
struct Users {
    by_id: HashMap<Uuid, User>,
    profiles: HashMap<Uuid, UserProfile>,
}

#[derive(Default)]
pub struct MemoryUserStore {
    inner: Mutex<Users>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn profile(&self, user_id: Uuid) -> Option<UserProfile> {
        self.inner.lock().await.profiles.get(&user_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.by_id.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().await.by_id.get(&id).cloned())
    }

    async fn exists_by_email(&self, email: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.by_id.values().any(|u| u.email == email))
    }

    async fn create(&self, user: &User, profile: &UserProfile) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.by_id.contains_key(&user.id) || inner.by_id.values().any(|u| u.email == user.email)
        {
            return Err(StoreError::Duplicate);
        }
        inner.by_id.insert(user.id, user.clone());
        inner.profiles.insert(user.id, profile.clone());
        Ok(())
    }

    async fn save(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.by_id.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(StoreError::Database(sqlx::Error::RowNotFound)),
        }
    }
}

struct Entry {
    /// Insertion order, breaks ties between sessions created at the same instant
    seq: u64,
    session: RefreshSession,
}

#[derive(Default)]
struct Sessions {
    by_id: HashMap<Uuid, Entry>,
    by_jti: HashMap<String, Uuid>,
    next_seq: u64,
}

impl Sessions {
    fn insert(&mut self, session: &RefreshSession) -> Result<(), StoreError> {
        if self.by_jti.contains_key(&session.jti) || self.by_id.contains_key(&session.id) {
            return Err(StoreError::Duplicate);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_jti.insert(session.jti.clone(), session.id);
        self.by_id.insert(
            session.id,
            Entry {
                seq,
                session: session.clone(),
            },
        );
        Ok(())
    }

    /// Active sessions of a user, newest first
    fn active_for_user(&self, user_id: Uuid, now: OffsetDateTime) -> Vec<&Entry> {
        let mut active: Vec<&Entry> = self
            .by_id
            .values()
            .filter(|e| e.session.user_id == user_id && e.session.is_active_at(now))
            .collect();
        active.sort_by(|a, b| {
            b.session
                .created_at
                .cmp(&a.session.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        active
    }

    fn revoke(&mut self, id: Uuid, reason: RevocationReason, at: OffsetDateTime) -> bool {
        match self.by_id.get_mut(&id) {
            Some(entry) if !entry.session.is_revoked() => {
                entry.session.revocation = Some(Revocation { reason, at });
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<Sessions>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, revoked ones included
    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &RefreshSession) -> Result<(), StoreError> {
        self.inner.lock().await.insert(session)
    }

    async fn find_for_user(
        &self,
        user_id: Uuid,
        jti: &str,
    ) -> Result<Option<RefreshSession>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_jti
            .get(jti)
            .and_then(|id| inner.by_id.get(id))
            .filter(|e| e.session.user_id == user_id)
            .map(|e| e.session.clone()))
    }

    async fn revoke_if_active(
        &self,
        jti: &str,
        reason: RevocationReason,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.by_jti.get(jti).copied() else {
            return Ok(false);
        };
        Ok(inner.revoke(id, reason, at))
    }

    async fn rotate(
        &self,
        session_id: Uuid,
        successor: &RefreshSession,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;

        match inner.by_id.get(&session_id) {
            Some(entry) if !entry.session.is_revoked() => {}
            _ => return Ok(false),
        }
        if inner.by_jti.contains_key(&successor.jti) {
            return Err(StoreError::Duplicate);
        }

        inner.revoke(session_id, RevocationReason::Rotated, at);
        if let Some(entry) = inner.by_id.get_mut(&session_id) {
            entry.session.replaced_by = Some(successor.jti.clone());
        }
        inner.insert(successor)?;
        Ok(true)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        at: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let targets: Vec<Uuid> = inner
            .by_id
            .values()
            .filter(|e| e.session.user_id == user_id && !e.session.is_revoked())
            .map(|e| e.session.id)
            .collect();

        let mut revoked = 0;
        for id in targets {
            if inner.revoke(id, reason, at) {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn insert_capped(
        &self,
        session: &RefreshSession,
        keep: usize,
        reason: RevocationReason,
        at: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.insert(session)?;

        let excess: Vec<Uuid> = inner
            .active_for_user(session.user_id, at)
            .into_iter()
            .filter(|e| e.session.id != session.id)
            .skip(keep.saturating_sub(1))
            .map(|e| e.session.id)
            .collect();

        let mut revoked = 0;
        for id in excess {
            if inner.revoke(id, reason, at) {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn list_active_for_user(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshSession>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .active_for_user(user_id, now)
            .into_iter()
            .map(|e| e.session.clone())
            .collect())
    }

    async fn purge_expired(&self, before: OffsetDateTime) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<(Uuid, String)> = inner
            .by_id
            .values()
            .filter(|e| e.session.expires_at < before)
            .map(|e| (e.session.id, e.session.jti.clone()))
            .collect();

        for (id, jti) in &expired {
            inner.by_id.remove(id);
            inner.by_jti.remove(jti);
        }
        Ok(expired.len() as u64)
    }
}
