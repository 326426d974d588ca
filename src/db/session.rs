//! Operator session repository
//!
//! Session tokens are minted by the outer application; this gateway only
//! resolves them at WebSocket upgrade time.

use chrono::Utc;

use super::DbPool;
use crate::{Error, Result};

/// An authenticated operator resolved from a session token
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: i64,
    pub tenant_id: i64,
}

/// Session repository
#[derive(Clone)]
pub struct SessionRepo {
    pool: DbPool,
}

impl SessionRepo {
    /// Create a new session repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Resolve a session token to an operator, ignoring expired sessions
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn authenticate(&self, token: &str) -> Result<Option<AuthedUser>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        let user = conn
            .query_row(
                "SELECT user_id, tenant_id FROM sessions
                 WHERE token = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                [token, &now],
                |row| {
                    Ok(AuthedUser {
                        user_id: row.get(0)?,
                        tenant_id: row.get(1)?,
                    })
                },
            )
            .ok();

        Ok(user)
    }

    /// Insert a session token for a user
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(
        &self,
        token: &str,
        user_id: i64,
        tenant_id: i64,
        expires_at: Option<&str>,
    ) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO sessions (token, user_id, tenant_id, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![token, user_id, tenant_id, expires_at],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> SessionRepo {
        let pool = init_memory().unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch(
            "INSERT INTO tenants (name) VALUES ('t1');
             INSERT INTO users (tenant_id, name) VALUES (1, 'op');",
        )
        .unwrap();
        SessionRepo::new(pool)
    }

    #[test]
    fn test_authenticate_valid_token() {
        let repo = setup();
        repo.create("tok-1", 1, 1, None).unwrap();

        let user = repo.authenticate("tok-1").unwrap().unwrap();
        assert_eq!(user.user_id, 1);
        assert_eq!(user.tenant_id, 1);
    }

    #[test]
    fn test_authenticate_unknown_token() {
        let repo = setup();
        assert!(repo.authenticate("nope").unwrap().is_none());
    }

    #[test]
    fn test_authenticate_expired_token() {
        let repo = setup();
        repo.create("tok-old", 1, 1, Some("2020-01-01T00:00:00Z"))
            .unwrap();
        assert!(repo.authenticate("tok-old").unwrap().is_none());
    }
}
