use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use parcel_core::{ByteRange, CoverageSet, DownloadToken, ReleaseOutcome, TokenState};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};

const TOKEN_COLUMNS: &str =
    "token,recipient,asset_id,state,coverage,lease_id,completed_at,notified_at,created,updated";

/// SQLite-backed token store. Every state change is a single conditional
/// write (or one IMMEDIATE transaction), so no caller ever observes a
/// read-then-write gap on a token row.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
}

/// Mutual-exclusion grant returned by a successful [`Kernel::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub token: String,
    pub lease_id: String,
    pub recipient: String,
    pub asset_id: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(Lease),
    NotFound,
    AlreadyCompleted,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseResult {
    /// This call performed the `Locked -> outcome` transition.
    Released,
    /// The token was already completed; nothing changed.
    AlreadyCompleted,
    /// The lease no longer matches the current holder; nothing changed.
    Stale,
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create state dir {}", dir.display()))?;
        let db_path = dir.join("parcel.sqlite");
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init_schema(&conn)?;
        Ok(Self { db_path })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
              token TEXT PRIMARY KEY,
              recipient TEXT NOT NULL,
              asset_id TEXT NOT NULL,
              state TEXT NOT NULL,        -- issued | locked | paused | completed
              coverage TEXT NOT NULL,     -- JSON list of inclusive {start,end}
              lease_id TEXT,              -- current holder while locked
              completed_at TEXT,
              notified_at TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_state ON tokens(state);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        // Busy timeout (default 5000ms; override with PARCEL_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("PARCEL_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        Ok(conn)
    }

    /// Create a fresh `issued` token with empty coverage.
    pub fn issue_token(&self, token: &str, recipient: &str, asset_id: &str) -> Result<DownloadToken> {
        if token.trim().is_empty() {
            bail!("token must not be empty");
        }
        let conn = self.conn()?;
        let now = Utc::now();
        let coverage = serde_json::to_string(&CoverageSet::new())?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tokens(token,recipient,asset_id,state,coverage,created,updated) \
             VALUES(?,?,?,?,?,?,?)",
            params![
                token,
                recipient,
                asset_id,
                TokenState::Issued.as_str(),
                coverage,
                now,
                now
            ],
        )?;
        if inserted == 0 {
            bail!("token {token} already exists");
        }
        self.get_token(token)?
            .ok_or_else(|| anyhow!("token {token} vanished after insert"))
    }

    pub fn get_token(&self, token: &str) -> Result<Option<DownloadToken>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE token=? LIMIT 1"
        ))?;
        let row = stmt.query_row([token], token_from_row).optional()?;
        row.transpose()
    }

    pub fn list_tokens(&self, limit: i64) -> Result<Vec<DownloadToken>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens ORDER BY created DESC LIMIT ?"
        ))?;
        let mut rows = stmt.query([limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(token_from_row(row)??);
        }
        Ok(out)
    }

    /// Take the lease on `token` if it is `issued` or `paused`.
    ///
    /// The transition is one conditional UPDATE; a failed attempt leaves the
    /// row untouched and is classified by a follow-up read.
    pub fn try_acquire(&self, token: &str) -> Result<AcquireOutcome> {
        let conn = self.conn()?;
        let lease_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let acquired = {
            let mut stmt = conn.prepare(
                "UPDATE tokens SET state='locked', lease_id=?, updated=? \
                 WHERE token=? AND state IN ('issued','paused') \
                 RETURNING recipient, asset_id",
            )?;
            stmt.query_row(params![lease_id, now, token], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?
        };
        if let Some((recipient, asset_id)) = acquired {
            return Ok(AcquireOutcome::Acquired(Lease {
                token: token.to_string(),
                lease_id,
                recipient,
                asset_id,
                acquired_at: now,
            }));
        }
        Ok(match state_of(&conn, token)? {
            None => AcquireOutcome::NotFound,
            Some(TokenState::Completed) => AcquireOutcome::AlreadyCompleted,
            // issued/paused here means the holder released between our CAS and this read
            Some(_) => AcquireOutcome::Locked,
        })
    }

    /// Merge `delivered` into the token's coverage while `lease_id` still holds it.
    ///
    /// Returns the merged set, or `None` when the lease is no longer current.
    pub fn record_coverage(
        &self,
        token: &str,
        lease_id: &str,
        delivered: Option<ByteRange>,
    ) -> Result<Option<CoverageSet>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT coverage FROM tokens WHERE token=? AND lease_id=? AND state='locked'",
                params![token, lease_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut coverage: CoverageSet = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt coverage for token {token}"))?;
        if let Some(range) = delivered {
            if coverage.add(range) {
                tx.execute(
                    "UPDATE tokens SET coverage=?, updated=? WHERE token=? AND lease_id=?",
                    params![serde_json::to_string(&coverage)?, Utc::now(), token, lease_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(Some(coverage))
    }

    /// Give the lease back, moving `locked` to `outcome`.
    ///
    /// Idempotent: releasing an already-completed token or a lease that was
    /// already resolved changes nothing.
    pub fn release(
        &self,
        token: &str,
        lease_id: &str,
        outcome: ReleaseOutcome,
    ) -> Result<ReleaseResult> {
        let conn = self.conn()?;
        let now = Utc::now();
        let completed_at = matches!(outcome, ReleaseOutcome::Completed).then_some(now);
        let n = conn.execute(
            "UPDATE tokens SET state=?, lease_id=NULL, completed_at=COALESCE(?, completed_at), updated=? \
             WHERE token=? AND lease_id=? AND state='locked'",
            params![outcome.state().as_str(), completed_at, now, token, lease_id],
        )?;
        if n > 0 {
            return Ok(ReleaseResult::Released);
        }
        Ok(match state_of(&conn, token)? {
            Some(TokenState::Completed) => ReleaseResult::AlreadyCompleted,
            _ => ReleaseResult::Stale,
        })
    }

    /// Set `notified_at` if the token is completed and was never notified.
    ///
    /// Returns true only for the single caller that flipped the marker.
    pub fn claim_notification(&self, token: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tokens SET notified_at=? \
             WHERE token=? AND state='completed' AND notified_at IS NULL",
            params![Utc::now(), token],
        )?;
        Ok(n > 0)
    }

    /// Turn every `locked` token into `paused`. Only valid when no session
    /// can be alive, i.e. at process start.
    pub fn recover_stale_leases(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tokens SET state='paused', lease_id=NULL, updated=? WHERE state='locked'",
            params![Utc::now()],
        )?;
        Ok(n)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    pub async fn issue_token_async(
        &self,
        token: &str,
        recipient: &str,
        asset_id: &str,
    ) -> Result<DownloadToken> {
        let k = self.clone();
        let token = token.to_string();
        let recipient = recipient.to_string();
        let asset_id = asset_id.to_string();
        tokio::task::spawn_blocking(move || k.issue_token(&token, &recipient, &asset_id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_token_async(&self, token: &str) -> Result<Option<DownloadToken>> {
        let k = self.clone();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || k.get_token(&token))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn try_acquire_async(&self, token: &str) -> Result<AcquireOutcome> {
        let k = self.clone();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || k.try_acquire(&token))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn record_coverage_async(
        &self,
        token: &str,
        lease_id: &str,
        delivered: Option<ByteRange>,
    ) -> Result<Option<CoverageSet>> {
        let k = self.clone();
        let token = token.to_string();
        let lease_id = lease_id.to_string();
        tokio::task::spawn_blocking(move || k.record_coverage(&token, &lease_id, delivered))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn release_async(
        &self,
        token: &str,
        lease_id: &str,
        outcome: ReleaseOutcome,
    ) -> Result<ReleaseResult> {
        let k = self.clone();
        let token = token.to_string();
        let lease_id = lease_id.to_string();
        tokio::task::spawn_blocking(move || k.release(&token, &lease_id, outcome))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn claim_notification_async(&self, token: &str) -> Result<bool> {
        let k = self.clone();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || k.claim_notification(&token))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn recover_stale_leases_async(&self) -> Result<usize> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.recover_stale_leases())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

fn state_of(conn: &Connection, token: &str) -> Result<Option<TokenState>> {
    let raw: Option<String> = conn
        .query_row("SELECT state FROM tokens WHERE token=?", [token], |row| {
            row.get(0)
        })
        .optional()?;
    raw.map(|s| TokenState::from_slug(&s).ok_or_else(|| anyhow!("unknown token state {s}")))
        .transpose()
}

// The outer rusqlite::Result carries column errors; the inner one carries
// decoding errors for the JSON and state columns.
fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Result<DownloadToken>> {
    let token: String = row.get(0)?;
    let state_s: String = row.get(3)?;
    let coverage_s: String = row.get(4)?;
    let recipient: String = row.get(1)?;
    let asset_id: String = row.get(2)?;
    let lease_id: Option<String> = row.get(5)?;
    let completed_at: Option<DateTime<Utc>> = row.get(6)?;
    let notified_at: Option<DateTime<Utc>> = row.get(7)?;
    let created: DateTime<Utc> = row.get(8)?;
    let updated: DateTime<Utc> = row.get(9)?;

    let decoded = (|| -> Result<DownloadToken> {
        let state = TokenState::from_slug(&state_s)
            .ok_or_else(|| anyhow!("unknown token state {state_s}"))?;
        let coverage: CoverageSet = serde_json::from_str(&coverage_s)
            .with_context(|| format!("corrupt coverage for token {token}"))?;
        Ok(DownloadToken {
            token: token.clone(),
            recipient,
            asset_id,
            state,
            coverage,
            lease_id,
            completed_at,
            notified_at,
            created,
            updated,
        })
    })();
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn issue_then_get_round_trips() {
        let dir = tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("open kernel");
        let issued = kernel.issue_token("tok-1", "buyer@example.com", "album.zip").unwrap();
        assert_eq!(issued.state, TokenState::Issued);
        assert!(issued.coverage.is_empty());

        let fetched = kernel.get_token("tok-1").unwrap().expect("token exists");
        assert_eq!(fetched.recipient, "buyer@example.com");
        assert_eq!(fetched.asset_id, "album.zip");
        assert!(fetched.completed_at.is_none());
        assert!(kernel.get_token("missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_issue_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("open kernel");
        kernel.issue_token("tok-1", "a", "asset").unwrap();
        assert!(kernel.issue_token("tok-1", "b", "asset").is_err());
        assert_eq!(kernel.get_token("tok-1").unwrap().unwrap().recipient, "a");
    }

    #[test]
    fn reopen_keeps_rows() {
        let dir = tempdir().expect("tempdir");
        Kernel::open(dir.path())
            .unwrap()
            .issue_token("tok-1", "a", "asset")
            .unwrap();
        let reopened = Kernel::open(dir.path()).unwrap();
        assert!(reopened.get_token("tok-1").unwrap().is_some());
        assert_eq!(reopened.list_tokens(10).unwrap().len(), 1);
    }
}
