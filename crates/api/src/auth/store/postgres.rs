//! PostgreSQL-backed stores

use async_trait::async_trait;
use sqlx::{Database, FromRow, PgPool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{SessionStore, StoreError, UserStore};
use crate::auth::sessions::{RefreshSession, Revocation, RevocationReason};
use crate::auth::users::{User, UserProfile};

fn map_unique(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
        _ => StoreError::Database(err),
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    password_hash: String,
    role: String,
    is_active: bool,
    last_login_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = row.role.parse().map_err(StoreError::Corrupt)?;
        Ok(User {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            role,
            is_active: row.is_active,
            last_login_at: row.last_login_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const USER_COLUMNS: &str =
    "id, email, password_hash, role, is_active, last_login_at, created_at, updated_at";

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(User::try_from).transpose()
    }

    async fn exists_by_email(&self, email: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
                .bind(email)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn create(&self, user: &User, profile: &UserProfile) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO users (
                id, email, password_hash, role, is_active, last_login_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(user.last_login_at)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_unique)?;

        sqlx::query(
            r#"
            INSERT INTO user_profiles (
                user_id, first_name, last_name, avatar_url, phone, timezone, locale,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            "#,
        )
        .bind(profile.user_id)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.avatar_url)
        .bind(&profile.phone)
        .bind(&profile.timezone)
        .bind(&profile.locale)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_unique)?;

        tx.commit().await?;
        Ok(())
    }

    async fn save(&self, user: &User) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET role = $2,
                is_active = $3,
                last_login_at = $4,
                password_hash = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(user.last_login_at)
        .bind(&user.password_hash)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Database(sqlx::Error::RowNotFound));
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    jti: String,
    token_fingerprint: String,
    expires_at: OffsetDateTime,
    created_at: OffsetDateTime,
    revoked_at: Option<OffsetDateTime>,
    revoked_reason: Option<String>,
    replaced_by: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
}

impl TryFrom<SessionRow> for RefreshSession {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let revocation = match (row.revoked_at, row.revoked_reason) {
            (None, _) => None,
            (Some(at), Some(reason)) => Some(Revocation {
                reason: reason.parse().map_err(StoreError::Corrupt)?,
                at,
            }),
            (Some(_), None) => {
                return Err(StoreError::Corrupt(format!(
                    "session {} revoked without a reason",
                    row.id
                )))
            }
        };

        Ok(RefreshSession {
            id: row.id,
            user_id: row.user_id,
            jti: row.jti,
            token_fingerprint: row.token_fingerprint,
            expires_at: row.expires_at,
            created_at: row.created_at,
            revocation,
            replaced_by: row.replaced_by,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
        })
    }
}

const SESSION_COLUMNS: &str = "id, user_id, jti, token_fingerprint, expires_at, created_at, \
     revoked_at, revoked_reason, replaced_by, ip_address, user_agent";

const INSERT_SESSION: &str = r#"
    INSERT INTO refresh_sessions (
        id, user_id, jti, token_fingerprint, expires_at, created_at, ip_address, user_agent
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

fn insert_session(
    session: &RefreshSession,
) -> sqlx::query::Query<'_, Postgres, <Postgres as Database>::Arguments<'_>> {
    sqlx::query(INSERT_SESSION)
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.jti)
        .bind(&session.token_fingerprint)
        .bind(session.expires_at)
        .bind(session.created_at)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
}

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &RefreshSession) -> Result<(), StoreError> {
        insert_session(session)
            .execute(&self.pool)
            .await
            .map_err(map_unique)?;
        Ok(())
    }

    async fn find_for_user(
        &self,
        user_id: Uuid,
        jti: &str,
    ) -> Result<Option<RefreshSession>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM refresh_sessions WHERE jti = $1 AND user_id = $2"
        ))
        .bind(jti)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RefreshSession::try_from).transpose()
    }

    async fn revoke_if_active(
        &self,
        jti: &str,
        reason: RevocationReason,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET revoked_at = $2,
                revoked_reason = $3
            WHERE jti = $1
              AND revoked_at IS NULL
            "#,
        )
        .bind(jti)
        .bind(at)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn rotate(
        &self,
        session_id: Uuid,
        successor: &RefreshSession,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        // The row lock taken here serializes concurrent rotations of one session
        let rows_affected = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET revoked_at = $2,
                revoked_reason = $3,
                replaced_by = $4
            WHERE id = $1
              AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(at)
        .bind(RevocationReason::Rotated.as_str())
        .bind(&successor.jti)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_session(successor)
            .execute(&mut *tx)
            .await
            .map_err(map_unique)?;

        tx.commit().await?;
        Ok(true)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        at: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET revoked_at = $2,
                revoked_reason = $3
            WHERE user_id = $1
              AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(at)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected)
    }

    async fn insert_capped(
        &self,
        session: &RefreshSession,
        keep: usize,
        reason: RevocationReason,
        at: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        // The new session always survives, so it takes one of the kept slots
        let keep_others = i64::try_from(keep.saturating_sub(1)).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;

        // Locking the owner row serializes concurrent logins of one user
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(session.user_id)
            .fetch_optional(&mut *tx)
            .await?;

        insert_session(session)
            .execute(&mut *tx)
            .await
            .map_err(map_unique)?;

        let rows_affected = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET revoked_at = $3,
                revoked_reason = $4
            WHERE revoked_at IS NULL
              AND id IN (
                SELECT id FROM refresh_sessions
                WHERE user_id = $1
                  AND id <> $5
                  AND revoked_at IS NULL
                  AND expires_at > $3
                ORDER BY created_at DESC, id DESC
                OFFSET $2
              )
            "#,
        )
        .bind(session.user_id)
        .bind(keep_others)
        .bind(at)
        .bind(reason.as_str())
        .bind(session.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(rows_affected)
    }

    async fn list_active_for_user(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshSession>, StoreError> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM refresh_sessions
            WHERE user_id = $1
              AND revoked_at IS NULL
              AND expires_at > $2
            ORDER BY created_at DESC, id DESC
            "#
        ))
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RefreshSession::try_from).collect()
    }

    async fn purge_expired(&self, before: OffsetDateTime) -> Result<u64, StoreError> {
        let rows_affected = sqlx::query("DELETE FROM refresh_sessions WHERE expires_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected)
    }
}
