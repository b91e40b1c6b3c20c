//! Status ledger over the `files` table.
//!
//! Owns the lifecycle value of every registered file. Every status change
//! goes through [`Ledger::advance`], which validates the move against
//! [`Status::can_transition_to`] and commits in its own transaction, apart
//! from whatever scope produced the record being advanced.
//!
//! Eligible records are streamed in storage order, one bounded page at a
//! time, through [`EligibleFiles`]. Paging is keyed on the `seq` column, so
//! records advanced while the cursor is open do not shift later pages.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SpiderError};
use crate::models::{FileDescriptor, FileRecord, Status};

const FILE_COLUMNS: &str = "seq, id, name, site_id, size, created_at, created_by_id, \
     updated_at, updated_by_id, link, target_path, status";

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    page_size: i64,
}

impl Ledger {
    pub fn new(pool: SqlitePool, page_size: i64) -> Self {
        Self {
            pool,
            page_size: page_size.max(1),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stream records whose status is in `filter`, in storage order.
    pub fn list_eligible(&self, filter: &[Status]) -> EligibleFiles<'_> {
        let mut statuses: Vec<i64> = filter.iter().map(|s| s.ordinal()).collect();
        statuses.sort_unstable();
        statuses.dedup();
        EligibleFiles {
            ledger: self,
            exhausted: statuses.is_empty(),
            statuses,
            last_seq: 0,
            buffer: VecDeque::new(),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_record(&r).map(|(_, rec)| rec))
            .transpose()
    }

    /// Move a record to `new_status`.
    ///
    /// Returns the status the record held before the call. Staying at the
    /// current status is a no-op; any move outside the transition table is
    /// rejected with [`SpiderError::InvalidTransition`]. A successful move
    /// also releases any claim on the record.
    pub async fn advance(&self, id: &str, new_status: Status) -> Result<Status> {
        let mut tx = self.pool.begin().await?;

        let current: Option<i64> = sqlx::query_scalar("SELECT status FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let current = match current {
            Some(v) => decode_status(v)?,
            None => return Err(SpiderError::NotFound(id.to_string())),
        };

        if current == new_status {
            tx.commit().await?;
            return Ok(current);
        }
        if !current.can_transition_to(new_status) {
            return Err(SpiderError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: new_status,
            });
        }

        sqlx::query(
            r#"
            UPDATE files
            SET status = ?, status_changed_at = ?, claimed_by = NULL, claimed_until = NULL
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(new_status.ordinal())
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(current.ordinal())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(id, from = %current, to = %new_status, "status advanced");
        Ok(current)
    }

    /// Insert a new record at status `new`.
    pub async fn register(&self, desc: &FileDescriptor, target_path: &Path) -> Result<()> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO files (id, name, site_id, size, created_at, created_by_id, updated_at,
                               updated_by_id, link, target_path, status, registered_at,
                               status_changed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&desc.id)
        .bind(&desc.name)
        .bind(&desc.site_id)
        .bind(desc.size)
        .bind(desc.created_at.map(|t| t.timestamp()))
        .bind(&desc.created_by_id)
        .bind(desc.updated_at.map(|t| t.timestamp()))
        .bind(&desc.updated_by_id)
        .bind(&desc.link)
        .bind(target_path.to_string_lossy().into_owned())
        .bind(Status::New.ordinal())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(SpiderError::Conflict(desc.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take a lease on a record before working on it.
    ///
    /// Succeeds only while the record is still at `expected` and is either
    /// unclaimed, already held by `worker`, or held under an expired lease.
    pub async fn claim(
        &self,
        id: &str,
        expected: Status,
        worker: &str,
        lease_secs: i64,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE files
            SET claimed_by = ?, claimed_until = ?
            WHERE id = ? AND status = ?
              AND (claimed_by IS NULL OR claimed_by = ? OR claimed_until < ?)
            "#,
        )
        .bind(worker)
        .bind(now + lease_secs)
        .bind(id)
        .bind(expected.ordinal())
        .bind(worker)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop a claim held by `worker` without changing the status.
    pub async fn release(&self, id: &str, worker: &str) -> Result<()> {
        sqlx::query(
            "UPDATE files SET claimed_by = NULL, claimed_until = NULL WHERE id = ? AND claimed_by = ?",
        )
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reset every `error` record to `new`. Returns how many were requeued.
    pub async fn requeue_errors(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE files
            SET status = ?, status_changed_at = ?, claimed_by = NULL, claimed_until = NULL
            WHERE status = ?
            "#,
        )
        .bind(Status::New.ordinal())
        .bind(Utc::now().timestamp())
        .bind(Status::Error.ordinal())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_by_status(&self) -> Result<BTreeMap<Status, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM files GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts: BTreeMap<Status, i64> = Status::ALL.iter().map(|s| (*s, 0)).collect();
        for row in &rows {
            let status = decode_status(row.get::<i64, _>("status"))?;
            counts.insert(status, row.get::<i64, _>("n"));
        }
        Ok(counts)
    }

    pub async fn upsert_site(&self, id: &str, name: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sites (id, name) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Site id → display name, loaded once per run.
    pub async fn site_names(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT id, name FROM sites")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("id"), r.get::<String, _>("name")))
            .collect())
    }

    async fn fetch_page(&self, statuses: &[i64], after_seq: i64) -> Result<Vec<(i64, FileRecord)>> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM files WHERE status IN ({}) AND seq > ? ORDER BY seq LIMIT ?",
            FILE_COLUMNS, placeholders
        );
        let mut query = sqlx::query(&sql);
        for s in statuses {
            query = query.bind(*s);
        }
        let rows = query
            .bind(after_seq)
            .bind(self.page_size)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }
}

/// Lazy cursor over eligible records, refilled one page at a time.
pub struct EligibleFiles<'a> {
    ledger: &'a Ledger,
    statuses: Vec<i64>,
    last_seq: i64,
    buffer: VecDeque<(i64, FileRecord)>,
    exhausted: bool,
}

impl EligibleFiles<'_> {
    pub async fn next(&mut self) -> Result<Option<FileRecord>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self.ledger.fetch_page(&self.statuses, self.last_seq).await?;
            if (page.len() as i64) < self.ledger.page_size {
                self.exhausted = true;
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front().map(|(seq, rec)| {
            self.last_seq = seq;
            rec
        }))
    }
}

fn decode_status(value: i64) -> Result<Status> {
    Status::from_ordinal(value).ok_or_else(|| {
        SpiderError::Db(sqlx::Error::Decode(
            format!("unknown status ordinal {}", value).into(),
        ))
    })
}

fn from_ts(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| DateTime::from_timestamp(t, 0))
}

fn row_to_record(row: &SqliteRow) -> Result<(i64, FileRecord)> {
    let record = FileRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        site_id: row.try_get("site_id")?,
        size: row.try_get("size")?,
        created_at: from_ts(row.try_get("created_at")?),
        created_by_id: row.try_get("created_by_id")?,
        updated_at: from_ts(row.try_get("updated_at")?),
        updated_by_id: row.try_get("updated_by_id")?,
        link: row.try_get("link")?,
        status: decode_status(row.try_get("status")?)?,
        target_path: PathBuf::from(row.try_get::<String, _>("target_path")?),
    };
    Ok((row.try_get("seq")?, record))
}
