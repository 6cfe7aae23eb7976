use std::collections::HashMap;

use sqlx::{postgres::PgRow, PgPool, Row};
use talenthub_core::UserId;

use crate::server::{
    core::{AppState, PendingVerificationRecord, UserRecord},
    db::{ensure_db_schema, is_unique_violation},
    errors::ApiFailure,
};

const USER_COLUMNS: &str = "user_id, email, username, display_name, password_hash, avatar_key,
     session_epoch, created_at_ms";

pub(crate) trait UserPersistence {
    async fn find_by_id(&self, user_id: UserId) -> Result<Option<UserRecord>, ApiFailure>;

    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, ApiFailure>;

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, ApiFailure>;

    /// Loads the users that still exist among `user_ids`.
    async fn find_many(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, UserRecord>, ApiFailure>;

    /// Returns whether the email and the username are each already taken.
    async fn identity_taken(&self, email: &str, username: &str)
        -> Result<(bool, bool), ApiFailure>;

    async fn save_pending(&self, pending: &PendingVerificationRecord) -> Result<(), ApiFailure>;

    /// Reads the pending verification for `email`, deleting it when expired.
    async fn find_pending(
        &self,
        email: &str,
        now_unix: i64,
    ) -> Result<Option<PendingVerificationRecord>, ApiFailure>;

    /// Creates the account described by `pending` and drops the pending row.
    ///
    /// Returns `None` when the email or username was claimed in the meantime.
    async fn create_from_pending(
        &self,
        pending: &PendingVerificationRecord,
        user_id: UserId,
        created_at_ms: i64,
    ) -> Result<Option<UserRecord>, ApiFailure>;

    /// Stores a new password hash and returns the bumped session epoch.
    async fn update_password(
        &self,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<Option<i64>, ApiFailure>;

    async fn bump_session_epoch(&self, user_id: UserId) -> Result<Option<i64>, ApiFailure>;

    async fn update_display_name(
        &self,
        user_id: UserId,
        display_name: &str,
    ) -> Result<bool, ApiFailure>;

    /// Returns `false` when another account holds `username`.
    async fn update_username(&self, user_id: UserId, username: &str) -> Result<bool, ApiFailure>;

    /// Replaces the avatar key and returns the previous one (`None` if the user is gone).
    async fn set_avatar(
        &self,
        user_id: UserId,
        avatar_key: Option<&str>,
    ) -> Result<Option<Option<String>>, ApiFailure>;

    async fn delete(&self, user_id: UserId) -> Result<bool, ApiFailure>;
}

pub(crate) fn user_from_row(row: &PgRow) -> Result<UserRecord, ApiFailure> {
    let user_id: String = row.try_get("user_id")?;
    Ok(UserRecord {
        id: UserId::try_from(user_id).map_err(|_| ApiFailure::Internal)?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        password_hash: row.try_get("password_hash")?,
        avatar_key: row.try_get("avatar_key")?,
        session_epoch: row.try_get("session_epoch")?,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

fn pending_from_row(row: &PgRow) -> Result<PendingVerificationRecord, ApiFailure> {
    Ok(PendingVerificationRecord {
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        password_hash: row.try_get("password_hash")?,
        code: row.try_get("code")?,
        expires_at_unix: row.try_get("expires_at_unix")?,
    })
}

pub(crate) struct PostgresUserRepository<'a> {
    state: &'a AppState,
    pool: &'a PgPool,
}

impl<'a> PostgresUserRepository<'a> {
    pub(crate) fn new(state: &'a AppState, pool: &'a PgPool) -> Self {
        Self { state, pool }
    }

    async fn ready(&self) -> Result<&'a PgPool, ApiFailure> {
        ensure_db_schema(self.state).await?;
        Ok(self.pool)
    }

    async fn find_one(
        &self,
        column: &'static str,
        value: &str,
    ) -> Result<Option<UserRecord>, ApiFailure> {
        let pool = self.ready().await?;
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE {column} = $1"
        ))
        .bind(value)
        .fetch_optional(pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }
}

impl UserPersistence for PostgresUserRepository<'_> {
    async fn find_by_id(&self, user_id: UserId) -> Result<Option<UserRecord>, ApiFailure> {
        self.find_one("user_id", &user_id.to_string()).await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, ApiFailure> {
        self.find_one("username", username).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, ApiFailure> {
        self.find_one("email", email).await
    }

    async fn find_many(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, UserRecord>, ApiFailure> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let pool = self.ready().await?;
        let ids: Vec<String> = user_ids.iter().map(ToString::to_string).collect();
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE user_id = ANY($1)"
        ))
        .bind(&ids)
        .fetch_all(pool)
        .await?;
        let mut users = HashMap::with_capacity(rows.len());
        for row in &rows {
            let user = user_from_row(row)?;
            users.insert(user.id, user);
        }
        Ok(users)
    }

    async fn identity_taken(
        &self,
        email: &str,
        username: &str,
    ) -> Result<(bool, bool), ApiFailure> {
        let pool = self.ready().await?;
        let row = sqlx::query(
            "SELECT
                EXISTS (SELECT 1 FROM users WHERE email = $1) AS email_taken,
                EXISTS (SELECT 1 FROM users WHERE username = $2) AS username_taken",
        )
        .bind(email)
        .bind(username)
        .fetch_one(pool)
        .await?;
        Ok((row.try_get("email_taken")?, row.try_get("username_taken")?))
    }

    async fn save_pending(&self, pending: &PendingVerificationRecord) -> Result<(), ApiFailure> {
        let pool = self.ready().await?;
        sqlx::query(
            "INSERT INTO pending_verifications
                (email, username, display_name, password_hash, code, expires_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (email) DO UPDATE SET
                username = EXCLUDED.username,
                display_name = EXCLUDED.display_name,
                password_hash = EXCLUDED.password_hash,
                code = EXCLUDED.code,
                expires_at_unix = EXCLUDED.expires_at_unix",
        )
        .bind(&pending.email)
        .bind(&pending.username)
        .bind(&pending.display_name)
        .bind(&pending.password_hash)
        .bind(&pending.code)
        .bind(pending.expires_at_unix)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn find_pending(
        &self,
        email: &str,
        now_unix: i64,
    ) -> Result<Option<PendingVerificationRecord>, ApiFailure> {
        let pool = self.ready().await?;
        sqlx::query("DELETE FROM pending_verifications WHERE email = $1 AND expires_at_unix <= $2")
            .bind(email)
            .bind(now_unix)
            .execute(pool)
            .await?;
        let row = sqlx::query(
            "SELECT email, username, display_name, password_hash, code, expires_at_unix
             FROM pending_verifications WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(pool)
        .await?;
        row.as_ref().map(pending_from_row).transpose()
    }

    async fn create_from_pending(
        &self,
        pending: &PendingVerificationRecord,
        user_id: UserId,
        created_at_ms: i64,
    ) -> Result<Option<UserRecord>, ApiFailure> {
        let pool = self.ready().await?;
        let mut tx = pool.begin().await?;
        let row = sqlx::query(&format!(
            "INSERT INTO users
                (user_id, email, username, display_name, password_hash, avatar_key,
                 session_epoch, created_at_ms)
             VALUES ($1, $2, $3, $4, $5, NULL, 0, $6)
             ON CONFLICT DO NOTHING
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id.to_string())
        .bind(&pending.email)
        .bind(&pending.username)
        .bind(&pending.display_name)
        .bind(&pending.password_hash)
        .bind(created_at_ms)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let user = user_from_row(&row)?;
        sqlx::query("DELETE FROM pending_verifications WHERE email = $1")
            .bind(&pending.email)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(user))
    }

    async fn update_password(
        &self,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<Option<i64>, ApiFailure> {
        let pool = self.ready().await?;
        let row = sqlx::query(
            "UPDATE users SET password_hash = $2, session_epoch = session_epoch + 1
             WHERE user_id = $1
             RETURNING session_epoch",
        )
        .bind(user_id.to_string())
        .bind(password_hash)
        .fetch_optional(pool)
        .await?;
        row.map(|row| row.try_get("session_epoch"))
            .transpose()
            .map_err(ApiFailure::from)
    }

    async fn bump_session_epoch(&self, user_id: UserId) -> Result<Option<i64>, ApiFailure> {
        let pool = self.ready().await?;
        let row = sqlx::query(
            "UPDATE users SET session_epoch = session_epoch + 1
             WHERE user_id = $1
             RETURNING session_epoch",
        )
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await?;
        row.map(|row| row.try_get("session_epoch"))
            .transpose()
            .map_err(ApiFailure::from)
    }

    async fn update_display_name(
        &self,
        user_id: UserId,
        display_name: &str,
    ) -> Result<bool, ApiFailure> {
        let pool = self.ready().await?;
        let result = sqlx::query("UPDATE users SET display_name = $2 WHERE user_id = $1")
            .bind(user_id.to_string())
            .bind(display_name)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_username(&self, user_id: UserId, username: &str) -> Result<bool, ApiFailure> {
        let pool = self.ready().await?;
        let result = sqlx::query("UPDATE users SET username = $2 WHERE user_id = $1")
            .bind(user_id.to_string())
            .bind(username)
            .execute(pool)
            .await;
        match result {
            Ok(result) => Ok(result.rows_affected() > 0),
            Err(error) if is_unique_violation(&error) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn set_avatar(
        &self,
        user_id: UserId,
        avatar_key: Option<&str>,
    ) -> Result<Option<Option<String>>, ApiFailure> {
        let pool = self.ready().await?;
        let row = sqlx::query(
            "UPDATE users u SET avatar_key = $2
             FROM (SELECT user_id, avatar_key FROM users WHERE user_id = $1 FOR UPDATE) previous
             WHERE u.user_id = previous.user_id
             RETURNING previous.avatar_key AS previous_key",
        )
        .bind(user_id.to_string())
        .bind(avatar_key)
        .fetch_optional(pool)
        .await?;
        row.map(|row| row.try_get("previous_key"))
            .transpose()
            .map_err(ApiFailure::from)
    }

    async fn delete(&self, user_id: UserId) -> Result<bool, ApiFailure> {
        let pool = self.ready().await?;
        let result = sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user_id.to_string())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub(crate) struct InMemoryUserRepository<'a> {
    state: &'a AppState,
}

impl<'a> InMemoryUserRepository<'a> {
    pub(crate) fn new(state: &'a AppState) -> Self {
        Self { state }
    }
}

impl UserPersistence for InMemoryUserRepository<'_> {
    async fn find_by_id(&self, user_id: UserId) -> Result<Option<UserRecord>, ApiFailure> {
        Ok(self.state.users.read().await.get(&user_id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, ApiFailure> {
        Ok(self
            .state
            .users
            .read()
            .await
            .values()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, ApiFailure> {
        Ok(self
            .state
            .users
            .read()
            .await
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn find_many(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, UserRecord>, ApiFailure> {
        let users = self.state.users.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|user_id| users.get(user_id).map(|user| (*user_id, user.clone())))
            .collect())
    }

    async fn identity_taken(
        &self,
        email: &str,
        username: &str,
    ) -> Result<(bool, bool), ApiFailure> {
        let users = self.state.users.read().await;
        Ok((
            users.values().any(|user| user.email == email),
            users.values().any(|user| user.username == username),
        ))
    }

    async fn save_pending(&self, pending: &PendingVerificationRecord) -> Result<(), ApiFailure> {
        self.state
            .pending_verifications
            .write()
            .await
            .insert(pending.email.clone(), pending.clone());
        Ok(())
    }

    async fn find_pending(
        &self,
        email: &str,
        now_unix: i64,
    ) -> Result<Option<PendingVerificationRecord>, ApiFailure> {
        let mut pending = self.state.pending_verifications.write().await;
        if pending
            .get(email)
            .is_some_and(|record| record.expires_at_unix <= now_unix)
        {
            pending.remove(email);
        }
        Ok(pending.get(email).cloned())
    }

    async fn create_from_pending(
        &self,
        pending: &PendingVerificationRecord,
        user_id: UserId,
        created_at_ms: i64,
    ) -> Result<Option<UserRecord>, ApiFailure> {
        let mut users = self.state.users.write().await;
        if users
            .values()
            .any(|user| user.email == pending.email || user.username == pending.username)
        {
            return Ok(None);
        }
        let user = UserRecord {
            id: user_id,
            email: pending.email.clone(),
            username: pending.username.clone(),
            display_name: pending.display_name.clone(),
            password_hash: pending.password_hash.clone(),
            avatar_key: None,
            session_epoch: 0,
            created_at_ms,
        };
        users.insert(user_id, user.clone());
        drop(users);

        self.state
            .pending_verifications
            .write()
            .await
            .remove(&pending.email);
        Ok(Some(user))
    }

    async fn update_password(
        &self,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<Option<i64>, ApiFailure> {
        let mut users = self.state.users.write().await;
        Ok(users.get_mut(&user_id).map(|user| {
            user.password_hash = password_hash.to_owned();
            user.session_epoch += 1;
            user.session_epoch
        }))
    }

    async fn bump_session_epoch(&self, user_id: UserId) -> Result<Option<i64>, ApiFailure> {
        let mut users = self.state.users.write().await;
        Ok(users.get_mut(&user_id).map(|user| {
            user.session_epoch += 1;
            user.session_epoch
        }))
    }

    async fn update_display_name(
        &self,
        user_id: UserId,
        display_name: &str,
    ) -> Result<bool, ApiFailure> {
        let mut users = self.state.users.write().await;
        Ok(users.get_mut(&user_id).is_some_and(|user| {
            display_name.clone_into(&mut user.display_name);
            true
        }))
    }

    async fn update_username(&self, user_id: UserId, username: &str) -> Result<bool, ApiFailure> {
        let mut users = self.state.users.write().await;
        if users
            .values()
            .any(|user| user.id != user_id && user.username == username)
        {
            return Ok(false);
        }
        Ok(users.get_mut(&user_id).is_some_and(|user| {
            username.clone_into(&mut user.username);
            true
        }))
    }

    async fn set_avatar(
        &self,
        user_id: UserId,
        avatar_key: Option<&str>,
    ) -> Result<Option<Option<String>>, ApiFailure> {
        let mut users = self.state.users.write().await;
        Ok(users.get_mut(&user_id).map(|user| {
            std::mem::replace(&mut user.avatar_key, avatar_key.map(ToOwned::to_owned))
        }))
    }

    async fn delete(&self, user_id: UserId) -> Result<bool, ApiFailure> {
        Ok(self.state.users.write().await.remove(&user_id).is_some())
    }
}

pub(crate) enum UserRepository<'a> {
    Postgres(PostgresUserRepository<'a>),
    InMemory(InMemoryUserRepository<'a>),
}

impl UserRepository<'_> {
    pub(crate) fn from_state(state: &AppState) -> UserRepository<'_> {
        if let Some(pool) = &state.db_pool {
            UserRepository::Postgres(PostgresUserRepository::new(state, pool))
        } else {
            UserRepository::InMemory(InMemoryUserRepository::new(state))
        }
    }
}

impl UserPersistence for UserRepository<'_> {
    async fn find_by_id(&self, user_id: UserId) -> Result<Option<UserRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_by_id(user_id).await,
            Self::InMemory(repo) => repo.find_by_id(user_id).await,
        }
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_by_username(username).await,
            Self::InMemory(repo) => repo.find_by_username(username).await,
        }
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_by_email(email).await,
            Self::InMemory(repo) => repo.find_by_email(email).await,
        }
    }

    async fn find_many(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, UserRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_many(user_ids).await,
            Self::InMemory(repo) => repo.find_many(user_ids).await,
        }
    }

    async fn identity_taken(
        &self,
        email: &str,
        username: &str,
    ) -> Result<(bool, bool), ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.identity_taken(email, username).await,
            Self::InMemory(repo) => repo.identity_taken(email, username).await,
        }
    }

    async fn save_pending(&self, pending: &PendingVerificationRecord) -> Result<(), ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.save_pending(pending).await,
            Self::InMemory(repo) => repo.save_pending(pending).await,
        }
    }

    async fn find_pending(
        &self,
        email: &str,
        now_unix: i64,
    ) -> Result<Option<PendingVerificationRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_pending(email, now_unix).await,
            Self::InMemory(repo) => repo.find_pending(email, now_unix).await,
        }
    }

    async fn create_from_pending(
        &self,
        pending: &PendingVerificationRecord,
        user_id: UserId,
        created_at_ms: i64,
    ) -> Result<Option<UserRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => {
                repo.create_from_pending(pending, user_id, created_at_ms)
                    .await
            }
            Self::InMemory(repo) => {
                repo.create_from_pending(pending, user_id, created_at_ms)
                    .await
            }
        }
    }

    async fn update_password(
        &self,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<Option<i64>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.update_password(user_id, password_hash).await,
            Self::InMemory(repo) => repo.update_password(user_id, password_hash).await,
        }
    }

    async fn bump_session_epoch(&self, user_id: UserId) -> Result<Option<i64>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.bump_session_epoch(user_id).await,
            Self::InMemory(repo) => repo.bump_session_epoch(user_id).await,
        }
    }

    async fn update_display_name(
        &self,
        user_id: UserId,
        display_name: &str,
    ) -> Result<bool, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.update_display_name(user_id, display_name).await,
            Self::InMemory(repo) => repo.update_display_name(user_id, display_name).await,
        }
    }

    async fn update_username(&self, user_id: UserId, username: &str) -> Result<bool, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.update_username(user_id, username).await,
            Self::InMemory(repo) => repo.update_username(user_id, username).await,
        }
    }

    async fn set_avatar(
        &self,
        user_id: UserId,
        avatar_key: Option<&str>,
    ) -> Result<Option<Option<String>>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.set_avatar(user_id, avatar_key).await,
            Self::InMemory(repo) => repo.set_avatar(user_id, avatar_key).await,
        }
    }

    async fn delete(&self, user_id: UserId) -> Result<bool, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.delete(user_id).await,
            Self::InMemory(repo) => repo.delete(user_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use talenthub_core::UserId;

    use super::{UserPersistence, UserRepository};
    use crate::server::core::{AppConfig, AppState, PendingVerificationRecord};

    fn pending(email: &str, username: &str, expires_at_unix: i64) -> PendingVerificationRecord {
        PendingVerificationRecord {
            email: email.to_owned(),
            username: username.to_owned(),
            display_name: String::from("Someone"),
            password_hash: String::from("hash"),
            code: String::from("123456"),
            expires_at_unix,
        }
    }

    #[tokio::test]
    async fn expired_pending_rows_are_dropped_on_read() {
        let state = AppState::new(&AppConfig::default()).expect("app state should initialize");
        let repo = UserRepository::from_state(&state);
        repo.save_pending(&pending("a@example.com", "alice", 100))
            .await
            .expect("pending row should save");

        assert!(repo
            .find_pending("a@example.com", 99)
            .await
            .expect("read should succeed")
            .is_some());
        assert!(repo
            .find_pending("a@example.com", 100)
            .await
            .expect("read should succeed")
            .is_none());
        assert!(state.pending_verifications.read().await.is_empty());
    }

    #[tokio::test]
    async fn create_from_pending_refuses_claimed_identity() {
        let state = AppState::new(&AppConfig::default()).expect("app state should initialize");
        let repo = UserRepository::from_state(&state);
        let first = repo
            .create_from_pending(&pending("a@example.com", "alice", i64::MAX), UserId::new(), 1)
            .await
            .expect("create should succeed");
        assert!(first.is_some());

        let clash = repo
            .create_from_pending(&pending("b@example.com", "alice", i64::MAX), UserId::new(), 2)
            .await
            .expect("create should succeed");
        assert!(clash.is_none());
        assert_eq!(
            repo.identity_taken("a@example.com", "bob")
                .await
                .expect("lookup should succeed"),
            (true, false)
        );
    }

    #[tokio::test]
    async fn password_change_bumps_session_epoch() {
        let state = AppState::new(&AppConfig::default()).expect("app state should initialize");
        let repo = UserRepository::from_state(&state);
        let user = repo
            .create_from_pending(&pending("a@example.com", "alice", i64::MAX), UserId::new(), 1)
            .await
            .expect("create should succeed")
            .expect("user should be created");
        assert_eq!(user.session_epoch, 0);
        assert_eq!(
            repo.update_password(user.id, "new-hash")
                .await
                .expect("update should succeed"),
            Some(1)
        );
        assert_eq!(
            repo.bump_session_epoch(UserId::new())
                .await
                .expect("update should succeed"),
            None
        );
    }
}
