//! Postgres persistence
//!
//! Reads candidates and exchange metadata produced upstream; writes relay results, inferred
//! fees, ban lists and campaigns. Writes take a `&mut PgConnection` so every row for one block
//! can share the transaction that carries the completion marker.

use alloy::primitives::{Address, B256, U256};
use chrono::NaiveDateTime;
use eyre::{eyre, Result, WrapErr};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::arbitrage::{CampaignKey, CandidateArbitrage};
use crate::config::RelayConfig;
use crate::fee_transfer::TokenFee;
use crate::pricers::ExchangeRecord;
use crate::simulation::ShootSuccess;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS candidate_arbitrage_reshoot_blocks (
    id                 SERIAL PRIMARY KEY NOT NULL,
    block_number       INTEGER NOT NULL,
    worker             TEXT,
    claimed_on         TIMESTAMP WITHOUT TIME ZONE,
    completed_on       TIMESTAMP WITHOUT TIME ZONE,
    priority           INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_candidate_arbitrage_reshoot_blocks_claimed_on ON candidate_arbitrage_reshoot_blocks (claimed_on);
CREATE INDEX IF NOT EXISTS idx_candidate_arbitrage_reshoot_blocks_priority ON candidate_arbitrage_reshoot_blocks (priority);

CREATE TABLE IF NOT EXISTS inferred_token_fee_on_transfer (
    id                    SERIAL PRIMARY KEY NOT NULL,
    token_id              INTEGER NOT NULL REFERENCES tokens (id) ON DELETE CASCADE,
    fee                   NUMERIC(20, 20),
    round_down            BOOLEAN,
    from_address          BYTEA,
    to_address            BYTEA,
    block_number_inferred INTEGER NOT NULL,
    updated_on            TIMESTAMP WITHOUT TIME ZONE
);

CREATE INDEX IF NOT EXISTS idx_inferred_token_fee_on_transfer_updated_on ON inferred_token_fee_on_transfer (updated_on);
CREATE INDEX IF NOT EXISTS idx_inferred_token_fee_on_transfer_token_id ON inferred_token_fee_on_transfer (token_id);

CREATE TABLE IF NOT EXISTS top_candidate_arbitrage_reservations (
    id           SERIAL PRIMARY KEY NOT NULL,
    start_block  INTEGER NOT NULL,
    end_block    INTEGER NOT NULL,
    worker       TEXT,
    progress     INTEGER,
    claimed_on   TIMESTAMP WITHOUT TIME ZONE,
    heartbeat    TIMESTAMP WITHOUT TIME ZONE,
    completed_on TIMESTAMP WITHOUT TIME ZONE
);

CREATE INDEX IF NOT EXISTS idx_top_candidate_arbitrage_reservations ON top_candidate_arbitrage_reservations (claimed_on);

CREATE TABLE IF NOT EXISTS candidate_arbitrage_relay_results (
    candidate_arbitrage_id BIGINT NOT NULL REFERENCES candidate_arbitrages (id) ON DELETE CASCADE,
    shoot_success          BOOLEAN NOT NULL,
    failure_reason         TEXT,
    gas_used               INTEGER CHECK ((shoot_success = true and gas_used is not null) OR (shoot_success = false and gas_used is null)),
    had_fee_on_xfer_token  BOOLEAN,
    real_profit_before_fee NUMERIC(78, 0)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_candidate_arbitrage_relay_results_candidate_arbitrage_id ON candidate_arbitrage_relay_results (candidate_arbitrage_id);
CREATE INDEX IF NOT EXISTS idx_candidate_arbitrage_relay_results_shoot_success ON candidate_arbitrage_relay_results (shoot_success);

CREATE TABLE IF NOT EXISTS candidate_arbitrage_relay_results_used_fees (
    candidate_arbitrage_id BIGINT NOT NULL REFERENCES candidate_arbitrages (id) ON DELETE CASCADE,
    fee_used               INTEGER NOT NULL REFERENCES inferred_token_fee_on_transfer (id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS top_candidate_arbitrage_campaigns (
    id                     BIGSERIAL PRIMARY KEY NOT NULL,
    reservation_id         INTEGER NOT NULL REFERENCES top_candidate_arbitrage_reservations (id) ON DELETE CASCADE,
    exchanges              BYTEA[] NOT NULL,
    directions             BYTEA[] NOT NULL,
    start_block            INTEGER NOT NULL,
    end_block              INTEGER NOT NULL,
    terminated             BOOLEAN DEFAULT TRUE,
    removed                BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS top_candidate_arbitrage_relay_results (
    id                     BIGSERIAL PRIMARY KEY NOT NULL,
    reservation_id         INTEGER NOT NULL REFERENCES top_candidate_arbitrage_reservations (id) ON DELETE CASCADE,
    campaign_id            BIGINT REFERENCES top_candidate_arbitrage_campaigns (id) CHECK ((shoot_success = true and campaign_id is not null) OR (shoot_success = false and campaign_id is null)),
    candidate_arbitrage_id BIGINT NOT NULL REFERENCES candidate_arbitrages (id) ON DELETE CASCADE,
    shoot_success          BOOLEAN NOT NULL,
    failure_reason         TEXT,
    gas_used               INTEGER CHECK ((shoot_success = true and gas_used is not null) OR (shoot_success = false and gas_used is null)),
    had_fee_on_xfer_token  BOOLEAN,
    real_profit_before_fee NUMERIC(78, 0)
);

CREATE INDEX IF NOT EXISTS idx_top_candidate_arbitrage_relay_results_candidate_arbitrage_id ON top_candidate_arbitrage_relay_results (candidate_arbitrage_id);
CREATE INDEX IF NOT EXISTS idx_top_candidate_arbitrage_relay_results_reservation_id ON top_candidate_arbitrage_relay_results (reservation_id);

CREATE TABLE IF NOT EXISTS top_candidate_arbitrage_relay_results_used_fees (
    top_candidate_arbitrage_relay_result_id BIGINT NOT NULL REFERENCES top_candidate_arbitrage_relay_results (id) ON DELETE CASCADE,
    fee_used                                INTEGER NOT NULL REFERENCES inferred_token_fee_on_transfer (id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS broken_tokens (
    token_id               INTEGER NOT NULL PRIMARY KEY REFERENCES tokens (id) ON DELETE CASCADE,
    broken_at_block_number INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_broken_tokens_block_number ON broken_tokens (broken_at_block_number);

CREATE TABLE IF NOT EXISTS banned_exchanges (
    address                BYTEA NOT NULL,
    broken_at_block_number INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_banned_exchanges ON banned_exchanges (broken_at_block_number);

CREATE TABLE IF NOT EXISTS job_control (
    worker           TEXT PRIMARY KEY NOT NULL,
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    updated_on       TIMESTAMP WITHOUT TIME ZONE NOT NULL DEFAULT now()
);
"#;

const CANDIDATE_COLUMNS: &str =
    "ca.id::BIGINT AS id, ca.exchanges, ca.directions, ca.amount_in::TEXT AS amount_in, ca.profit_no_fee::TEXT AS profit_no_fee, ca.block_number::BIGINT AS block_number";

const FEE_COLUMNS: &str = "inf.id::BIGINT AS id, t.address, inf.fee, inf.round_down, inf.from_address, inf.to_address, inf.block_number_inferred::BIGINT AS block_number, inf.updated_on";

/// A persisted campaign's route-independent span, for conflict detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignSpan {
    pub id: i64,
    pub start_block: u64,
    pub end_block: u64,
}

impl CampaignSpan {
    pub fn duration(&self) -> u64 {
        self.end_block - self.start_block + 1
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(config: &RelayConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.database_url)
            .await
            .wrap_err("connecting to postgres")?;
        debug!(max_connections = config.db_max_connections, "Connected to postgres");
        Ok(Self { pool })
    }

    /// Pool that connects on first use
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy(database_url)
            .wrap_err("parsing database url")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Create the tables this worker owns. Upstream tables (`tokens`, `candidate_arbitrages`,
    /// exchange registries) must already exist.
    pub async fn setup_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .wrap_err("creating relay schema")?;
        sqlx::query("ALTER TABLE top_candidate_arbitrage_campaigns ADD COLUMN IF NOT EXISTS removed BOOLEAN NOT NULL DEFAULT FALSE")
            .execute(&self.pool)
            .await?;
        info!("Relay schema ready");
        Ok(())
    }

    /// Candidates in `block` that have no relay result yet
    pub async fn candidates_in_block(&self, block: u64) -> Result<Vec<CandidateArbitrage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CANDIDATE_COLUMNS}
            FROM candidate_arbitrages ca
            WHERE ca.block_number = $1 AND
                NOT EXISTS (
                    SELECT 1
                    FROM candidate_arbitrage_relay_results carr
                    WHERE carr.candidate_arbitrage_id = ca.id
                )
            ORDER BY ca.id
            "#
        ))
        .bind(to_db_block(block)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    /// Candidates in `block` flagged as large, where new campaigns may start
    pub async fn large_candidates_in_block(&self, block: u64) -> Result<Vec<CandidateArbitrage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CANDIDATE_COLUMNS}
            FROM candidate_arbitrages ca
            JOIN large_candidate_arbitrages la ON ca.id = la.candidate_arbitrage_id
            WHERE la.block_number = $1
            ORDER BY ca.id
            "#
        ))
        .bind(to_db_block(block)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    /// Candidates in `block` touching any of `exchanges`; callers filter by exact route
    pub async fn candidates_touching(&self, block: u64, exchanges: &[Address]) -> Result<Vec<CandidateArbitrage>> {
        if exchanges.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CANDIDATE_COLUMNS}
            FROM candidate_arbitrages ca
            WHERE ca.block_number = $1 AND ca.exchanges && $2::BYTEA[]
            ORDER BY ca.id
            "#
        ))
        .bind(to_db_block(block)?)
        .bind(address_array(exchanges))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    /// The candidate for `route` at the last block before `before` where any of its exchanges
    /// changed state; `None` when there is no such update or the route was not a candidate then.
    pub async fn prior_route_candidate(&self, route: &CampaignKey, before: u64) -> Result<Option<CandidateArbitrage>> {
        let (exchanges, directions) = route;
        let tokens: Vec<Address> = directions.iter().map(|(t, _)| *t).collect();
        let row = sqlx::query(&format!(
            r#"
            SELECT {CANDIDATE_COLUMNS}
            FROM (
                SELECT block_number
                FROM exchanges_updated_in_block
                WHERE exchange_address = ANY($1::BYTEA[]) AND block_number < $3
                ORDER BY block_number DESC
                LIMIT 1
            ) eub
            JOIN candidate_arbitrages ca
                ON ca.block_number = eub.block_number AND
                   ca.exchanges = $1::BYTEA[] AND
                   ca.directions = $2::BYTEA[]
            LIMIT 1
            "#
        ))
        .bind(address_array(exchanges))
        .bind(address_array(&tokens))
        .bind(to_db_block(before)?)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(candidate_from_row).transpose()
    }

    pub async fn exchanges_updated_in_block(&self, block: u64) -> Result<HashSet<Address>> {
        let rows = sqlx::query("SELECT exchange_address FROM exchanges_updated_in_block WHERE block_number = $1")
            .bind(to_db_block(block)?)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| address_from_bytes(&r.try_get::<Vec<u8>, _>("exchange_address")?))
            .collect()
    }

    pub async fn lowest_large_arbitrage_block(&self, from: u64) -> Result<Option<u64>> {
        let lowest: Option<i64> =
            sqlx::query_scalar("SELECT MIN(block_number)::BIGINT FROM large_candidate_arbitrages WHERE block_number >= $1")
                .bind(to_db_block(from)?)
                .fetch_one(&self.pool)
                .await?;
        lowest.map(from_db_block).transpose()
    }

    /// Last block covered by any block sample
    pub async fn global_end_block(&self) -> Result<Option<u64>> {
        let end: Option<i64> = sqlx::query_scalar("SELECT MAX(end_block)::BIGINT FROM block_samples")
            .fetch_one(&self.pool)
            .await?;
        end.map(from_db_block).transpose()
    }

    /// Balancer V1 and V2 exchange address sets
    pub async fn balancer_exchanges(&self) -> Result<(HashSet<Address>, HashSet<Address>)> {
        let mut sets = Vec::with_capacity(2);
        for table in ["balancer_exchanges", "balancer_v2_exchanges"] {
            let rows = sqlx::query(&format!("SELECT DISTINCT address FROM {table}"))
                .fetch_all(&self.pool)
                .await?;
            let set = rows
                .iter()
                .map(|r| address_from_bytes(&r.try_get::<Vec<u8>, _>("address")?))
                .collect::<Result<HashSet<_>>>()?;
            sets.push(set);
        }
        let v2 = sets.pop().unwrap_or_default();
        let v1 = sets.pop().unwrap_or_default();
        Ok((v1, v2))
    }

    /// Candidate ids that already have a result under `reservation_id`
    pub async fn already_relayed_top(&self, reservation_id: i64) -> Result<HashSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT candidate_arbitrage_id::BIGINT FROM top_candidate_arbitrage_relay_results WHERE reservation_id = $1",
        )
        .bind(reservation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    /// Describe an exchange from the upstream registries
    pub async fn exchange_record(&self, address: Address) -> Result<Option<ExchangeRecord>> {
        let key = address.to_vec();

        for table in ["uniswap_v2_exchanges", "sushiv2_swap_exchanges", "shibaswap_exchanges"] {
            let row = sqlx::query(&format!(
                r#"
                SELECT t0.address AS token0, t1.address AS token1
                FROM {table} ex
                JOIN tokens t0 ON ex.token0_id = t0.id
                JOIN tokens t1 ON ex.token1_id = t1.id
                WHERE ex.address = $1
                "#
            ))
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                return Ok(Some(ExchangeRecord::UniswapV2 {
                    token0: address_from_bytes(&row.try_get::<Vec<u8>, _>("token0")?)?,
                    token1: address_from_bytes(&row.try_get::<Vec<u8>, _>("token1")?)?,
                }));
            }
        }

        let row = sqlx::query(
            r#"
            SELECT t0.address AS token0, t1.address AS token1, uv3.originalfee::BIGINT AS fee
            FROM uniswap_v3_exchanges uv3
            JOIN tokens t0 ON uv3.token0_id = t0.id
            JOIN tokens t1 ON uv3.token1_id = t1.id
            WHERE uv3.address = $1
            "#,
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            let fee: i64 = row.try_get("fee")?;
            return Ok(Some(ExchangeRecord::UniswapV3 {
                token0: address_from_bytes(&row.try_get::<Vec<u8>, _>("token0")?)?,
                token1: address_from_bytes(&row.try_get::<Vec<u8>, _>("token1")?)?,
                fee: u32::try_from(fee).map_err(|_| eyre!("bad uniswap v3 fee {fee} for {address}"))?,
            }));
        }

        let is_balancer_v1: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM balancer_exchanges WHERE address = $1)")
            .bind(&key)
            .fetch_one(&self.pool)
            .await?;
        if is_balancer_v1 {
            return Ok(Some(ExchangeRecord::BalancerV1));
        }

        let row = sqlx::query("SELECT pool_id, pool_type FROM balancer_v2_exchanges WHERE address = $1")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            let pool_id: Vec<u8> = row.try_get("pool_id")?;
            if pool_id.len() != 32 {
                return Err(eyre!("bad balancer v2 pool id for {address}"));
            }
            return Ok(Some(ExchangeRecord::BalancerV2 {
                pool_id: B256::from_slice(&pool_id),
                pool_type: row.try_get("pool_type")?,
            }));
        }

        debug!(%address, "Exchange not found in any registry");
        Ok(None)
    }

    /// For every `(token, from, to)` with an inferred fee, the record inferred closest to
    /// `block`; ties between an earlier and a later record go to the earlier one.
    pub async fn nearest_token_fees(&self, block: u64) -> Result<Vec<TokenFee>> {
        let rows = sqlx::query(&format!(
            r#"
            WITH all_fees AS (
                SELECT DISTINCT token_id, from_address, to_address
                FROM inferred_token_fee_on_transfer
            ),
            closest_fees AS (
                SELECT
                    (
                        SELECT MAX(block_number_inferred)
                        FROM inferred_token_fee_on_transfer f
                        WHERE f.token_id = af.token_id AND f.from_address = af.from_address AND f.to_address = af.to_address AND f.block_number_inferred <= $1
                    ) closest_lower_block,
                    (
                        SELECT MIN(block_number_inferred)
                        FROM inferred_token_fee_on_transfer f
                        WHERE f.token_id = af.token_id AND f.from_address = af.from_address AND f.to_address = af.to_address AND f.block_number_inferred >= $1
                    ) closest_upper_block,
                    af.*
                FROM all_fees af
            ),
            closest_block AS (
                SELECT
                    CASE
                        WHEN cf.closest_lower_block IS NULL THEN cf.closest_upper_block
                        WHEN cf.closest_upper_block IS NULL THEN cf.closest_lower_block
                        WHEN (cf.closest_upper_block - $1) < ($1 - cf.closest_lower_block) THEN cf.closest_upper_block
                        ELSE cf.closest_lower_block
                    END AS closest_block,
                    cf.token_id,
                    cf.from_address,
                    cf.to_address
                FROM closest_fees cf
            )
            SELECT {FEE_COLUMNS}
            FROM closest_block cb
            JOIN inferred_token_fee_on_transfer inf
                ON inf.block_number_inferred = cb.closest_block AND
                   inf.token_id = cb.token_id AND
                   inf.from_address = cb.from_address AND
                   inf.to_address = cb.to_address
            JOIN tokens t ON t.id = inf.token_id
            "#
        ))
        .bind(to_db_block(block)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(token_fee_from_row).collect()
    }

    pub async fn token_fees_updated_since(&self, since: NaiveDateTime) -> Result<Vec<TokenFee>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FEE_COLUMNS}
            FROM inferred_token_fee_on_transfer inf
            JOIN tokens t ON t.id = inf.token_id
            WHERE inf.updated_on > $1
            "#
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(token_fee_from_row).collect()
    }

    /// Same-route campaigns whose block spans overlap, as `(lower id, higher id)` pairs
    pub async fn overlapping_campaigns(&self) -> Result<Vec<(CampaignSpan, CampaignSpan)>> {
        let rows = sqlx::query(
            r#"
            SELECT
                c1.id AS id1, c1.start_block::BIGINT AS start1, c1.end_block::BIGINT AS end1,
                c2.id AS id2, c2.start_block::BIGINT AS start2, c2.end_block::BIGINT AS end2
            FROM top_candidate_arbitrage_campaigns c1
            JOIN top_candidate_arbitrage_campaigns c2 ON
                c1.id < c2.id AND
                c1.exchanges = c2.exchanges AND
                c1.directions = c2.directions AND
                int8range(c1.start_block, c1.end_block, '[]') && int8range(c2.start_block, c2.end_block, '[]')
            WHERE NOT c1.removed AND NOT c2.removed
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let span = |id: &str, start: &str, end: &str| -> Result<CampaignSpan> {
                    Ok(CampaignSpan {
                        id: r.try_get(id)?,
                        start_block: from_db_block(r.try_get(start)?)?,
                        end_block: from_db_block(r.try_get(end)?)?,
                    })
                };
                Ok((span("id1", "start1", "end1")?, span("id2", "start2", "end2")?))
            })
            .collect()
    }

    pub async fn count_campaigns(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM top_candidate_arbitrage_campaigns")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn mark_campaigns_removed(&self, ids: &[i64]) -> Result<u64> {
        let done = sqlx::query("UPDATE top_candidate_arbitrage_campaigns SET removed = true WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

/// Persist an inferred fee as observed at `block`, returning its row id
pub async fn insert_token_fee(conn: &mut PgConnection, fee: &TokenFee, block: u64) -> Result<i64> {
    let id: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO inferred_token_fee_on_transfer (token_id, fee, round_down, from_address, to_address, block_number_inferred, updated_on)
        SELECT t.id, $1, $2, $3, $4, $5, now()::timestamp
        FROM tokens t
        WHERE t.address = $6
        RETURNING inferred_token_fee_on_transfer.id::BIGINT
        "#,
    )
    .bind(fee.fee)
    .bind(fee.round_down)
    .bind(fee.from.to_vec())
    .bind(fee.to.to_vec())
    .bind(to_db_block(block)?)
    .bind(fee.token.to_vec())
    .fetch_optional(&mut *conn)
    .await?;
    id.ok_or_else(|| eyre!("token {} is not in the tokens table", fee.token))
}

pub async fn insert_relay_failure(conn: &mut PgConnection, candidate_id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO candidate_arbitrage_relay_results (candidate_arbitrage_id, shoot_success, failure_reason) VALUES ($1, false, $2)",
    )
    .bind(candidate_id)
    .bind(reason)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Success row plus one used-fee row per entry of `fee_ids`
pub async fn insert_relay_success(
    conn: &mut PgConnection,
    candidate_id: i64,
    success: &ShootSuccess,
    fee_ids: &[i64],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO candidate_arbitrage_relay_results
            (candidate_arbitrage_id, shoot_success, gas_used, had_fee_on_xfer_token, real_profit_before_fee)
        VALUES ($1, true, $2, $3, $4::NUMERIC)
        "#,
    )
    .bind(candidate_id)
    .bind(gas_to_db(success.gas)?)
    .bind(!success.fees_used.is_empty())
    .bind(success.profit.to_string())
    .execute(&mut *conn)
    .await?;

    for fee_id in fee_ids {
        sqlx::query("INSERT INTO candidate_arbitrage_relay_results_used_fees (candidate_arbitrage_id, fee_used) VALUES ($1, $2)")
            .bind(candidate_id)
            .bind(fee_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn insert_broken_token(conn: &mut PgConnection, token: Address, block: u64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO broken_tokens (token_id, broken_at_block_number)
        SELECT t.id, $2 FROM tokens t WHERE t.address = $1
        ON CONFLICT (token_id) DO NOTHING
        "#,
    )
    .bind(token.to_vec())
    .bind(to_db_block(block)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn insert_banned_exchange(conn: &mut PgConnection, exchange: Address, block: u64) -> Result<()> {
    sqlx::query("INSERT INTO banned_exchanges (address, broken_at_block_number) VALUES ($1, $2)")
        .bind(exchange.to_vec())
        .bind(to_db_block(block)?)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn insert_campaign(
    conn: &mut PgConnection,
    reservation_id: i64,
    route: &CampaignKey,
    start_block: u64,
    end_block: u64,
    terminated: bool,
) -> Result<i64> {
    let (exchanges, directions) = route;
    let tokens: Vec<Address> = directions.iter().map(|(t, _)| *t).collect();
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO top_candidate_arbitrage_campaigns (reservation_id, exchanges, directions, start_block, end_block, terminated)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(reservation_id)
    .bind(address_array(exchanges))
    .bind(address_array(&tokens))
    .bind(to_db_block(start_block)?)
    .bind(to_db_block(end_block)?)
    .bind(terminated)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn insert_top_failure(conn: &mut PgConnection, reservation_id: i64, candidate_id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO top_candidate_arbitrage_relay_results (reservation_id, candidate_arbitrage_id, shoot_success, failure_reason)
        VALUES ($1, $2, false, $3)
        "#,
    )
    .bind(reservation_id)
    .bind(candidate_id)
    .bind(reason)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn insert_top_success(
    conn: &mut PgConnection,
    reservation_id: i64,
    campaign_id: i64,
    candidate_id: i64,
    success: &ShootSuccess,
    fee_ids: &[i64],
) -> Result<()> {
    let result_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO top_candidate_arbitrage_relay_results
            (campaign_id, reservation_id, candidate_arbitrage_id, shoot_success, gas_used, had_fee_on_xfer_token, real_profit_before_fee)
        VALUES ($1, $2, $3, true, $4, $5, $6::NUMERIC)
        RETURNING id
        "#,
    )
    .bind(campaign_id)
    .bind(reservation_id)
    .bind(candidate_id)
    .bind(gas_to_db(success.gas)?)
    .bind(!success.fees_used.is_empty())
    .bind(success.profit.to_string())
    .fetch_one(&mut *conn)
    .await?;

    for fee_id in fee_ids {
        sqlx::query(
            "INSERT INTO top_candidate_arbitrage_relay_results_used_fees (top_candidate_arbitrage_relay_result_id, fee_used) VALUES ($1, $2)",
        )
        .bind(result_id)
        .bind(fee_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn candidate_from_row(row: &PgRow) -> Result<CandidateArbitrage> {
    let id: i64 = row.try_get("id")?;
    let exchanges = row
        .try_get::<Vec<Vec<u8>>, _>("exchanges")?
        .iter()
        .map(|b| address_from_bytes(b))
        .collect::<Result<Vec<_>>>()?;
    let tokens = row
        .try_get::<Vec<Vec<u8>>, _>("directions")?
        .iter()
        .map(|b| address_from_bytes(b))
        .collect::<Result<Vec<_>>>()?;
    CandidateArbitrage::from_token_cycle(
        id,
        exchanges,
        &tokens,
        parse_numeric(&row.try_get::<String, _>("amount_in")?)?,
        parse_numeric(&row.try_get::<String, _>("profit_no_fee")?)?,
        from_db_block(row.try_get("block_number")?)?,
    )
    .wrap_err_with(|| format!("decoding candidate {id}"))
}

fn token_fee_from_row(row: &PgRow) -> Result<TokenFee> {
    Ok(TokenFee {
        id: Some(row.try_get("id")?),
        token: address_from_bytes(&row.try_get::<Vec<u8>, _>("address")?)?,
        from: address_from_bytes(&row.try_get::<Vec<u8>, _>("from_address")?)?,
        to: address_from_bytes(&row.try_get::<Vec<u8>, _>("to_address")?)?,
        fee: row.try_get::<Decimal, _>("fee")?,
        round_down: row.try_get("round_down")?,
        block_number: Some(from_db_block(row.try_get("block_number")?)?),
        updated_on: row.try_get("updated_on")?,
    })
}

pub fn address_from_bytes(bytes: &[u8]) -> Result<Address> {
    if bytes.len() != 20 {
        return Err(eyre!("expected a 20-byte address, got {} bytes", bytes.len()));
    }
    Ok(Address::from_slice(bytes))
}

fn address_array(addresses: &[Address]) -> Vec<Vec<u8>> {
    addresses.iter().map(|a| a.to_vec()).collect()
}

/// Parse an integral NUMERIC rendered as text
pub fn parse_numeric(text: &str) -> Result<U256> {
    let integral = match text.split_once('.') {
        Some((whole, frac)) if frac.chars().all(|c| c == '0') => whole,
        Some(_) => return Err(eyre!("expected an integral value, got {text}")),
        None => text,
    };
    U256::from_str(integral).map_err(|e| eyre!("bad numeric {text}: {e}"))
}

pub fn to_db_block(block: u64) -> Result<i64> {
    i64::try_from(block).map_err(|_| eyre!("block {block} out of range"))
}

pub fn from_db_block(block: i64) -> Result<u64> {
    u64::try_from(block).map_err(|_| eyre!("negative block number {block}"))
}

fn gas_to_db(gas: u64) -> Result<i32> {
    i32::try_from(gas).map_err(|_| eyre!("gas {gas} does not fit an INTEGER column"))
}
