//! Persistence seams for identities and refresh sessions
//!
//! Every write that changes a session's revocation state is conditional on
//! the record still being unrevoked, and reports whether it took effect.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::sessions::{RefreshSession, RevocationReason};
use super::users::{User, UserProfile};

pub use memory::{MemorySessionStore, MemoryUserStore};
pub use postgres::{PgSessionStore, PgUserStore};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique key (email, jti) already exists
    #[error("Record already exists")]
    Duplicate,
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored value could not be decoded (unknown role, revocation reason)
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn exists_by_email(&self, email: &str) -> Result<bool, StoreError>;

    /// Create the user and its profile as one unit: both persist or neither does.
    async fn create(&self, user: &User, profile: &UserProfile) -> Result<(), StoreError>;

    /// Persist mutable identity fields (role, active flag, last login)
    async fn save(&self, user: &User) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails with `Duplicate` if the jti was ever used.
    async fn insert(&self, session: &RefreshSession) -> Result<(), StoreError>;

    /// Look up a session by jti, scoped to its owning user
    async fn find_for_user(
        &self,
        user_id: Uuid,
        jti: &str,
    ) -> Result<Option<RefreshSession>, StoreError>;

    /// Revoke the session if it is still unrevoked. Returns whether it was.
    async fn revoke_if_active(
        &self,
        jti: &str,
        reason: RevocationReason,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError>;

    /// Atomically revoke `session_id` as rotated (pointing at the successor's
    /// jti) and insert `successor`. Returns false, writing nothing, when the
    /// session was already revoked.
    async fn rotate(
        &self,
        session_id: Uuid,
        successor: &RefreshSession,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError>;

    /// Revoke every unrevoked session owned by the user
    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        at: OffsetDateTime,
    ) -> Result<u64, StoreError>;

    /// Insert a new session and revoke the user's oldest active sessions so
    /// at most `keep` remain, as one unit. The new session is always kept.
    /// Concurrent calls for the same user are serialized. Returns how many
    /// sessions were revoked.
    async fn insert_capped(
        &self,
        session: &RefreshSession,
        keep: usize,
        reason: RevocationReason,
        at: OffsetDateTime,
    ) -> Result<u64, StoreError>;

    /// Unrevoked, unexpired sessions, newest first
    async fn list_active_for_user(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshSession>, StoreError>;

    /// Physically delete records that expired before `before`
    async fn purge_expired(&self, before: OffsetDateTime) -> Result<u64, StoreError>;
}
