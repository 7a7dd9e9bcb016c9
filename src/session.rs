use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::firewall;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::error::Error),
    #[error("Invalid credentials")]
    BadCredentials,
    #[error("Account is banned")]
    Banned,
    #[error("Password hash operation failed: {0}")]
    HashError(#[from] bcrypt::BcryptError),
    #[error("User is not uniquely present")]
    UserLookupError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanKind {
    Temporary,
    Permanent,
}

impl BanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BanKind::Temporary => "temporary",
            BanKind::Permanent => "permanent",
        }
    }
}

/// A ban decision to be recorded. `expires_at` is `None` exactly when the
/// kind is permanent.
#[derive(Debug, Clone)]
pub struct BanRecord {
    pub user_id: String,
    pub kind: BanKind,
    pub confidence: f64,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub user_id: String,
    pub client_ip: ipnetwork::IpNetwork,
    pub state: String,
    pub login_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct UserRow {
    pw_hash: String,
    role: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClientOverview {
    pub user_id: String,
    pub role: String,
    pub tier: String,
    pub session_state: Option<String>,
    pub client_ip: Option<ipnetwork::IpNetwork>,
    pub last_seen: Option<DateTime<Utc>>,
    pub ban_kind: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Reachability probe used by the liveness sweep. Factored behind a trait so
/// the sweep logic can be exercised without a live hotspot link.
#[async_trait]
pub trait Prober {
    async fn reachable(&self, ip: IpAddr) -> bool;
}

pub struct PingProber {
    pub timeout: std::time::Duration,
}

#[async_trait]
impl Prober for PingProber {
    async fn reachable(&self, ip: IpAddr) -> bool {
        let probe = tokio::process::Command::new("ping")
            .args(&["-c", "1", "-W", "1", &ip.to_string()])
            .status();
        match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }
}

/// Authoritative mapping between client addresses, users, and bans.
#[derive(Clone)]
pub struct SessionStore {
    db_pool: Arc<sqlx::PgPool>,
    log: slog::Logger,
}

impl SessionStore {
    pub fn new(db_pool: Arc<sqlx::PgPool>, log: slog::Logger) -> SessionStore {
        SessionStore { db_pool, log }
    }

    /// Authenticate and bind the client address to the user. Enforces one
    /// active session per user and per address; any prior binding of this
    /// address to another user is retired first.
    pub async fn login(
        &self,
        user_id: &str,
        password: &str,
        client_ip: IpAddr,
    ) -> Result<Session, SessionError> {
        let mut transaction = self.db_pool.begin().await?;

        let user_query = r#"
            SELECT "pw_hash", "role"
            FROM users WHERE "user_id" = $1
        "#;
        let rows: Vec<UserRow> = sqlx::query_as(user_query)
            .bind(user_id)
            .fetch_all(&mut transaction)
            .await?;
        let user = match rows.first() {
            Some(user) => user.clone(),
            None => return Err(SessionError::BadCredentials),
        };

        if !bcrypt::verify(password, &user.pw_hash)? {
            return Err(SessionError::BadCredentials);
        }

        if self.ban_active_in(&mut transaction, user_id).await? {
            return Err(SessionError::Banned);
        }

        let now = Utc::now();
        let ip_network = ipnetwork::IpNetwork::from(client_ip);

        // A device can only carry one identity at a time.
        sqlx::query(
            r#"
            UPDATE sessions SET "state" = 'inactive', "last_seen" = $1
            WHERE "client_ip" = $2 AND "user_id" <> $3 AND "state" = 'active'
            "#,
        )
        .bind(now)
        .bind(ip_network)
        .bind(user_id)
        .execute(&mut transaction)
        .await?;

        let upsert_query = r#"
            INSERT INTO sessions("user_id", "client_ip", "state", "login_time", "last_seen")
            VALUES ($1, $2, 'active', $3, $3)
            ON CONFLICT ("user_id") DO UPDATE
            SET "client_ip" = $2, "state" = 'active', "login_time" = $3, "last_seen" = $3
            RETURNING "user_id", "client_ip", "state", "login_time", "last_seen"
        "#;
        let session: Session = sqlx::query_as(upsert_query)
            .bind(user_id)
            .bind(ip_network)
            .bind(now)
            .fetch_one(&mut transaction)
            .await?;

        transaction.commit().await?;
        slog::info!(self.log, "session opened";
            "user" => user_id, "ip" => client_ip.to_string(), "role" => &user.role);
        Ok(session)
    }

    /// Retire the user's active session, returning the address that should
    /// lose its forwarding allowance.
    pub async fn logout(&self, user_id: &str) -> Result<Option<IpAddr>, SessionError> {
        let rows: Vec<Session> = sqlx::query_as(
            r#"
            UPDATE sessions SET "state" = 'inactive', "last_seen" = $1
            WHERE "user_id" = $2 AND "state" = 'active'
            RETURNING "user_id", "client_ip", "state", "login_time", "last_seen"
            "#,
        )
        .bind(Utc::now())
        .bind(user_id)
        .fetch_all(self.db_pool.as_ref())
        .await?;
        Ok(rows.first().map(|session| session.client_ip.ip()))
    }

    /// Resolve a client address to its authenticated user. Returns `None`
    /// when no active session exists or when the session's owner is banned,
    /// so traffic is never attributed to a banned identity.
    pub async fn lookup_user(&self, client_ip: IpAddr) -> Result<Option<String>, SessionError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT s."user_id"
            FROM sessions s
            WHERE s."client_ip" = $1 AND s."state" = 'active'
              AND NOT EXISTS (
                SELECT 1 FROM bans b
                WHERE b."user_id" = s."user_id" AND b."status" = 'active'
                  AND (b."expires_at" IS NULL OR b."expires_at" > $2)
              )
            "#,
        )
        .bind(ipnetwork::IpNetwork::from(client_ip))
        .bind(Utc::now())
        .fetch_all(self.db_pool.as_ref())
        .await?;
        Ok(rows.first().map(|(user_id,)| user_id.clone()))
    }

    pub async fn all_active_ips(&self) -> Result<Vec<IpAddr>, SessionError> {
        let rows: Vec<(ipnetwork::IpNetwork,)> = sqlx::query_as(
            r#"SELECT "client_ip" FROM sessions WHERE "state" = 'active'"#,
        )
        .fetch_all(self.db_pool.as_ref())
        .await?;
        Ok(rows.into_iter().map(|(network,)| network.ip()).collect())
    }

    pub async fn active_ip_for(&self, user_id: &str) -> Result<Option<IpAddr>, SessionError> {
        let rows: Vec<(ipnetwork::IpNetwork,)> = sqlx::query_as(
            r#"SELECT "client_ip" FROM sessions WHERE "user_id" = $1 AND "state" = 'active'"#,
        )
        .bind(user_id)
        .fetch_all(self.db_pool.as_ref())
        .await?;
        Ok(rows.first().map(|(network,)| network.ip()))
    }

    /// Record a ban, upserting on the user. A standing permanent ban is
    /// never downgraded to a temporary one; re-recording an equal ban is a
    /// no-op. Returns whether the record was applied.
    pub async fn insert_ban(&self, ban: &BanRecord) -> Result<bool, SessionError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO bans("user_id", "kind", "confidence", "reason", "blocked_at", "expires_at", "status")
            VALUES ($1, $2, $3, $4, $5, $6, 'active')
            ON CONFLICT ("user_id") DO UPDATE
            SET "kind" = $2, "confidence" = $3, "reason" = $4,
                "blocked_at" = $5, "expires_at" = $6, "status" = 'active'
            WHERE NOT (bans."status" = 'active' AND bans."kind" = 'permanent' AND $2 = 'temporary')
            RETURNING "user_id"
            "#,
        )
        .bind(&ban.user_id)
        .bind(ban.kind.as_str())
        .bind(ban.confidence)
        .bind(&ban.reason)
        .bind(ban.blocked_at)
        .bind(ban.expires_at)
        .fetch_all(self.db_pool.as_ref())
        .await?;

        let applied = !rows.is_empty();
        if applied {
            slog::info!(self.log, "ban recorded";
                "user" => &ban.user_id, "kind" => ban.kind.as_str(),
                "confidence" => ban.confidence, "reason" => &ban.reason);
        } else {
            slog::debug!(self.log, "ban upsert refused, permanent ban stands"; "user" => &ban.user_id);
        }
        Ok(applied)
    }

    /// Lift an active ban early (admin unblock).
    pub async fn lift_ban(&self, user_id: &str) -> Result<bool, SessionError> {
        let result = sqlx::query(
            r#"UPDATE bans SET "status" = 'lifted' WHERE "user_id" = $1 AND "status" = 'active'"#,
        )
        .bind(user_id)
        .execute(self.db_pool.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_banned(&self, user_id: &str) -> Result<bool, SessionError> {
        let mut transaction = self.db_pool.begin().await?;
        let banned = self.ban_active_in(&mut transaction, user_id).await?;
        transaction.commit().await?;
        Ok(banned)
    }

    async fn ban_active_in(
        &self,
        transaction: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: &str,
    ) -> Result<bool, SessionError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT "user_id" FROM bans
            WHERE "user_id" = $1 AND "status" = 'active'
              AND ("expires_at" IS NULL OR "expires_at" > $2)
            "#,
        )
        .bind(user_id)
        .bind(Utc::now())
        .fetch_all(transaction)
        .await?;
        Ok(!rows.is_empty())
    }

    /// Transition lapsed temporary bans to expired. Expiry does not restore
    /// forwarding; the user regains access by logging in again.
    pub async fn expire_bans(&self) -> Result<u64, SessionError> {
        let result = sqlx::query(
            r#"
            UPDATE bans SET "status" = 'expired'
            WHERE "status" = 'active' AND "expires_at" IS NOT NULL AND "expires_at" <= $1
            "#,
        )
        .bind(Utc::now())
        .execute(self.db_pool.as_ref())
        .await?;
        let expired = result.rows_affected();
        if expired > 0 {
            slog::info!(self.log, "temporary bans expired"; "count" => expired);
        }
        Ok(expired)
    }

    /// Probe every active session's address on the hotspot link. Sessions
    /// whose device no longer answers are marked inactive and their
    /// forwarding allowance removed.
    pub async fn sweep_liveness<P: Prober + Sync>(
        &self,
        prober: &P,
        firewall: &firewall::Iptables,
    ) -> Result<u32, SessionError> {
        let sessions: Vec<Session> = sqlx::query_as(
            r#"
            SELECT "user_id", "client_ip", "state", "login_time", "last_seen"
            FROM sessions WHERE "state" = 'active'
            "#,
        )
        .fetch_all(self.db_pool.as_ref())
        .await?;

        let mut swept = 0;
        for session in sessions {
            let ip = session.client_ip.ip();
            if prober.reachable(ip).await {
                sqlx::query(
                    r#"UPDATE sessions SET "last_seen" = $1 WHERE "user_id" = $2 AND "state" = 'active'"#,
                )
                .bind(Utc::now())
                .bind(&session.user_id)
                .execute(self.db_pool.as_ref())
                .await?;
                continue;
            }

            sqlx::query(
                r#"UPDATE sessions SET "state" = 'inactive', "last_seen" = $1 WHERE "user_id" = $2"#,
            )
            .bind(Utc::now())
            .bind(&session.user_id)
            .execute(self.db_pool.as_ref())
            .await?;

            if let Err(e) = firewall.deny_client(ip).await {
                slog::error!(self.log, "failed to revoke forwarding for stale session";
                    "ip" => ip.to_string(), "error" => e.to_string());
            }
            slog::info!(self.log, "stale session swept";
                "user" => &session.user_id, "ip" => ip.to_string());
            swept += 1;
        }
        Ok(swept)
    }

    /// Create a user account with a freshly derived password hash.
    pub async fn create_user(
        &self,
        user_id: &str,
        password: &str,
        role: &str,
        tier: &str,
    ) -> Result<(), SessionError> {
        let pw_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
        sqlx::query(
            r#"
            INSERT INTO users("user_id", "pw_hash", "role", "tier")
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(pw_hash)
        .bind(role)
        .bind(tier)
        .execute(self.db_pool.as_ref())
        .await?;
        Ok(())
    }

    pub async fn update_user(
        &self,
        user_id: &str,
        tier: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), SessionError> {
        if let Some(tier) = tier {
            sqlx::query(r#"UPDATE users SET "tier" = $1 WHERE "user_id" = $2"#)
                .bind(tier)
                .bind(user_id)
                .execute(self.db_pool.as_ref())
                .await?;
        }
        if let Some(password) = password {
            let pw_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
            sqlx::query(r#"UPDATE users SET "pw_hash" = $1 WHERE "user_id" = $2"#)
                .bind(pw_hash)
                .bind(user_id)
                .execute(self.db_pool.as_ref())
                .await?;
        }
        Ok(())
    }

    pub async fn user_role(&self, user_id: &str) -> Result<Option<String>, SessionError> {
        let rows: Vec<(String,)> =
            sqlx::query_as(r#"SELECT "role" FROM users WHERE "user_id" = $1"#)
                .bind(user_id)
                .fetch_all(self.db_pool.as_ref())
                .await?;
        Ok(rows.first().map(|(role,)| role.clone()))
    }

    /// Admin overview of every non-admin account with derived session, ban,
    /// and activity state.
    pub async fn list_clients(&self) -> Result<Vec<ClientOverview>, SessionError> {
        let rows: Vec<ClientOverview> = sqlx::query_as(
            r#"
            SELECT u."user_id", u."role", u."tier",
                   s."state" AS "session_state", s."client_ip", s."last_seen",
                   b."kind" AS "ban_kind",
                   (SELECT max(d."ts") FROM detections d WHERE d."user_id" = u."user_id")
                       AS "last_activity"
            FROM users u
            LEFT JOIN sessions s ON s."user_id" = u."user_id"
            LEFT JOIN bans b ON b."user_id" = u."user_id" AND b."status" = 'active'
            WHERE u."role" <> 'admin'
            ORDER BY u."user_id"
            "#,
        )
        .fetch_all(self.db_pool.as_ref())
        .await?;
        Ok(rows)
    }
}
