//! Work distribution across workers
//!
//! Two queues: single blocks for the relay pass and block ranges for the campaign pass.
//! A claim locks the lowest unclaimed row with `FOR UPDATE SKIP LOCKED`, stamps it, and
//! commits before any work starts, so concurrent claimers never see the same row.

use eyre::Result;
use parking_lot::Mutex;
use sqlx::{PgConnection, Row};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::{from_db_block, to_db_block, Store};

/// A claimed block of the relay queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockClaim {
    pub id: i64,
    pub block_number: u64,
}

/// A claimed range of the campaign queue, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeClaim {
    pub id: i64,
    pub start_block: u64,
    pub end_block: u64,
}

pub async fn claim_block(store: &Store, worker: &str) -> Result<Option<BlockClaim>> {
    let mut tx = store.begin().await?;
    let row = sqlx::query(
        r#"
        SELECT id::BIGINT AS id, block_number::BIGINT AS block_number
        FROM candidate_arbitrage_reshoot_blocks
        WHERE claimed_on IS NULL AND completed_on IS NULL
        ORDER BY priority, block_number ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        info!("Relay queue is empty");
        return Ok(None);
    };
    let claim = BlockClaim {
        id: row.try_get("id")?,
        block_number: from_db_block(row.try_get("block_number")?)?,
    };

    sqlx::query("UPDATE candidate_arbitrage_reshoot_blocks SET claimed_on = now()::timestamp, worker = $1 WHERE id = $2")
        .bind(worker)
        .bind(claim.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(reservation_id = claim.id, block = claim.block_number, "Claimed block");
    Ok(Some(claim))
}

/// Mark a block done inside the transaction that wrote its results
pub async fn complete_block(conn: &mut PgConnection, id: i64) -> Result<()> {
    let done = sqlx::query("UPDATE candidate_arbitrage_reshoot_blocks SET completed_on = now()::timestamp WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    eyre::ensure!(done.rows_affected() == 1, "reservation {id} vanished");
    Ok(())
}

pub async fn claim_range(store: &Store, worker: &str) -> Result<Option<RangeClaim>> {
    let mut tx = store.begin().await?;
    let row = sqlx::query(
        r#"
        SELECT id::BIGINT AS id, start_block::BIGINT AS start_block, end_block::BIGINT AS end_block
        FROM top_candidate_arbitrage_reservations
        WHERE claimed_on IS NULL AND completed_on IS NULL
        ORDER BY start_block ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        info!("Campaign queue is empty");
        return Ok(None);
    };
    let claim = RangeClaim {
        id: row.try_get("id")?,
        start_block: from_db_block(row.try_get("start_block")?)?,
        end_block: from_db_block(row.try_get("end_block")?)?,
    };

    sqlx::query(
        "UPDATE top_candidate_arbitrage_reservations SET claimed_on = now()::timestamp, heartbeat = now()::timestamp, worker = $1 WHERE id = $2",
    )
    .bind(worker)
    .bind(claim.id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(
        reservation_id = claim.id,
        start_block = claim.start_block,
        end_block = claim.end_block,
        "Claimed block range"
    );
    Ok(Some(claim))
}

/// Per-block progress and heartbeat, written with that block's results
pub async fn record_progress(conn: &mut PgConnection, id: i64, block: u64) -> Result<()> {
    sqlx::query("UPDATE top_candidate_arbitrage_reservations SET progress = $1, heartbeat = now()::timestamp WHERE id = $2")
        .bind(to_db_block(block)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn complete_range(store: &Store, id: i64) -> Result<()> {
    sqlx::query("UPDATE top_candidate_arbitrage_reservations SET completed_on = now()::timestamp WHERE id = $1")
        .bind(id)
        .execute(store.pool())
        .await?;
    Ok(())
}

/// Queue every block of every completed upstream search range that is not queued yet
pub async fn fill_relay_queue(store: &Store) -> Result<u64> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO candidate_arbitrage_reshoot_blocks (block_number, priority)
        SELECT b.block_number, car.priority
        FROM candidate_arbitrage_reservations car
        CROSS JOIN LATERAL generate_series(car.block_number_start, car.block_number_end) AS b(block_number)
        WHERE car.claimed_on IS NOT NULL AND car.completed_on IS NOT NULL AND
            NOT EXISTS (
                SELECT 1 FROM candidate_arbitrage_reshoot_blocks r WHERE r.block_number = b.block_number
            )
        "#,
    )
    .execute(store.pool())
    .await?
    .rows_affected();
    info!(inserted, "Filled relay queue");
    Ok(inserted)
}

/// One campaign reservation per block sample
pub async fn fill_top_queue(store: &Store) -> Result<u64> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO top_candidate_arbitrage_reservations (start_block, end_block)
        SELECT bs.start_block, bs.end_block
        FROM block_samples bs
        WHERE NOT EXISTS (
            SELECT 1 FROM top_candidate_arbitrage_reservations r
            WHERE r.start_block = bs.start_block AND r.end_block = bs.end_block
        )
        "#,
    )
    .execute(store.pool())
    .await?
    .rows_affected();
    info!(inserted, "Filled campaign queue");
    Ok(inserted)
}

/// Release claims older than `timeout` that never completed.
///
/// Range reservations also lose their partial results so the next claimer starts clean.
pub async fn requeue_stale(store: &Store, timeout: Duration) -> Result<(u64, u64)> {
    let minutes = i64::try_from(timeout.as_secs() / 60).unwrap_or(i64::MAX);
    let mut tx = store.begin().await?;

    let blocks = sqlx::query(
        r#"
        UPDATE candidate_arbitrage_reshoot_blocks
        SET claimed_on = NULL, worker = NULL
        WHERE claimed_on < now()::timestamp - make_interval(mins => $1::INTEGER) AND completed_on IS NULL
        "#,
    )
    .bind(minutes)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let stale: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id::BIGINT
        FROM top_candidate_arbitrage_reservations
        WHERE completed_on IS NULL AND
            COALESCE(heartbeat, claimed_on) < now()::timestamp - make_interval(mins => $1::INTEGER)
        "#,
    )
    .bind(minutes)
    .fetch_all(&mut *tx)
    .await?;

    if !stale.is_empty() {
        sqlx::query("DELETE FROM top_candidate_arbitrage_relay_results WHERE reservation_id = ANY($1)")
            .bind(&stale)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM top_candidate_arbitrage_campaigns WHERE reservation_id = ANY($1)")
            .bind(&stale)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE top_candidate_arbitrage_reservations
            SET claimed_on = NULL, heartbeat = NULL, progress = NULL, worker = NULL
            WHERE id = ANY($1)
            "#,
        )
        .bind(&stale)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let ranges = stale.len() as u64;
    if blocks + ranges > 0 {
        warn!(blocks, ranges, minutes, "Requeued stale reservations");
    } else {
        info!(minutes, "No stale reservations");
    }
    Ok((blocks, ranges))
}

/// Cooperative cancellation for a long-running worker.
///
/// The process token (Ctrl-C) is checked on every call; the `job_control` row is read at most
/// once per heartbeat so tight loops can poll freely.
pub struct JobControl {
    store: Store,
    worker: String,
    token: CancellationToken,
    heartbeat: Duration,
    last_check: Mutex<Option<Instant>>,
}

impl JobControl {
    pub fn new(store: Store, worker: &str, token: CancellationToken, heartbeat: Duration) -> Self {
        Self {
            store,
            worker: worker.to_string(),
            token,
            heartbeat,
            last_check: Mutex::new(None),
        }
    }

    /// Register this worker, clearing any stale cancel request
    pub async fn register(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_control (worker, cancel_requested, updated_on)
            VALUES ($1, false, now()::timestamp)
            ON CONFLICT (worker) DO UPDATE SET cancel_requested = false, updated_on = now()::timestamp
            "#,
        )
        .bind(&self.worker)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn cancel_requested(&self) -> Result<bool> {
        if self.token.is_cancelled() {
            return Ok(true);
        }
        if !self.due() {
            return Ok(false);
        }
        let requested: Option<bool> = sqlx::query_scalar("SELECT cancel_requested FROM job_control WHERE worker = $1")
            .bind(&self.worker)
            .fetch_optional(self.store.pool())
            .await?;
        if requested == Some(true) {
            warn!(worker = %self.worker, "Cancellation requested through job_control");
            self.token.cancel();
            return Ok(true);
        }
        Ok(false)
    }

    fn due(&self) -> bool {
        let mut last = self.last_check.lock();
        match *last {
            Some(at) if at.elapsed() < self.heartbeat => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_control(heartbeat: Duration) -> JobControl {
        let store = Store::connect_lazy("postgres://nobody@127.0.0.1:1/none").unwrap();
        JobControl::new(store, "worker-0", CancellationToken::new(), heartbeat)
    }

    #[tokio::test]
    async fn test_process_token_short_circuits() {
        let control = lazy_control(Duration::from_secs(60));
        control.token().cancel();
        // never touches the store
        assert!(control.cancel_requested().await.unwrap());
    }

    #[tokio::test]
    async fn test_store_polled_once_per_heartbeat() {
        let control = lazy_control(Duration::from_secs(3600));
        assert!(control.due());
        assert!(!control.due());
        // within the heartbeat no query is issued
        assert!(!control.cancel_requested().await.unwrap());
    }

    fn database_url() -> String {
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for store tests")
    }

    #[tokio::test]
    #[ignore = "requires postgres with the relay schema"]
    async fn test_concurrent_claims_are_exclusive() {
        let store = Store::connect_lazy(&database_url()).unwrap();
        store.setup_schema().await.unwrap();
        sqlx::query("INSERT INTO candidate_arbitrage_reshoot_blocks (block_number, priority) SELECT g, 99 FROM generate_series(900000001, 900000020) g")
            .execute(store.pool())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for w in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(c) = claim_block(&store, &format!("test-{w}")).await.unwrap() {
                    claimed.push(c.block_number);
                }
                claimed
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let ours: Vec<u64> = {
            let mut v: Vec<u64> = all.into_iter().filter(|b| *b > 900_000_000).collect();
            v.sort();
            v
        };
        assert_eq!(ours, (900_000_001..=900_000_020).collect::<Vec<_>>());

        sqlx::query("DELETE FROM candidate_arbitrage_reshoot_blocks WHERE block_number > 900000000")
            .execute(store.pool())
            .await
            .unwrap();
    }
}
