// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use node_data::get_current_timestamp;
use node_data::message::BarrierState;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

/// The name of the directory SQLite database.
const DIRECTORY_DB_NAME: &str = "directory.sqlite3";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRow {
    pub agent_id: String,
    pub ip: String,
    pub port: u16,
    pub score: u8,
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorRow {
    pub aggregator_id: String,
    pub ip: String,
    pub port: u16,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierRow {
    pub current_round: u64,
    pub state: BarrierState,
    pub threshold: u32,
    pub agents_ready: Vec<String>,
    pub models_received: u32,
    pub aggregator_id: String,
    pub last_update: i64,
}

/// The directory's embedded relational store.
///
/// Every handler runs its statements over the shared pool; the singleton
/// rows (`current_aggregator`, `round_barrier`) are only ever written by the
/// single current aggregator or an electing agent, so the store's own write
/// lock is the only serialization needed.
#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Create or open the SQLite database under the given directory.
    pub async fn create_or_open<P: AsRef<Path> + std::fmt::Debug>(
        path: P,
    ) -> Result<Self> {
        info!("Opening directory db in {path:?}");

        let db_options = SqliteConnectOptions::new()
            .filename(path.as_ref().join(DIRECTORY_DB_NAME))
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(db_options).await?;
        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// An in-memory store, used by tests. Pinned to a single pooled
    /// connection: every `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS local_models(
                model_id TEXT,
                gen_time INTEGER,
                agent_id TEXT,
                round INTEGER,
                performance REAL,
                num_samples INTEGER)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cluster_models(
                model_id TEXT,
                gen_time INTEGER,
                aggregator_id TEXT,
                round INTEGER,
                num_samples INTEGER)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agents(
                agent_id TEXT PRIMARY KEY,
                ip TEXT,
                port INTEGER,
                score INTEGER,
                last_seen INTEGER)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS current_aggregator(
                id INTEGER PRIMARY KEY CHECK (id = 1),
                aggregator_id TEXT,
                ip TEXT,
                port INTEGER,
                updated_at INTEGER)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS round_barrier(
                id INTEGER PRIMARY KEY CHECK (id = 1),
                current_round INTEGER DEFAULT 0,
                state TEXT DEFAULT 'registration',
                barrier_threshold INTEGER DEFAULT 0,
                agents_ready TEXT DEFAULT '',
                models_received INTEGER DEFAULT 0,
                aggregator_id TEXT,
                last_update INTEGER)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_round_status(
                agent_id TEXT PRIMARY KEY,
                current_round INTEGER DEFAULT 0,
                status TEXT DEFAULT 'idle',
                phase TEXT DEFAULT 'registration',
                last_heartbeat INTEGER)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Upserts an agent record, refreshing `last_seen`.
    ///
    /// A row holding the same `(ip, port)` under a different id is rewritten
    /// to the new id: an agent restarting at the same address regenerates
    /// its id, and two rows for one address would break the election's
    /// winner lookup.
    pub async fn upsert_agent(
        &self,
        agent_id: &str,
        ip: &str,
        port: u16,
        score: u8,
    ) -> Result<()> {
        let now = get_current_timestamp() as i64;

        let existing: Option<String> =
            sqlx::query("SELECT agent_id FROM agents WHERE ip = ? AND port = ?")
                .bind(ip)
                .bind(port)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.get(0));

        if let Some(existing_id) = existing {
            if existing_id != agent_id {
                sqlx::query(
                    "UPDATE agents
                     SET agent_id = ?, last_seen = ?, score = ?
                     WHERE ip = ? AND port = ?",
                )
                .bind(agent_id)
                .bind(now)
                .bind(score)
                .bind(ip)
                .bind(port)
                .execute(&self.pool)
                .await?;

                info!(
                    event = "agent_rewritten",
                    ip, port, agent_id
                );
                return Ok(());
            }
        }

        sqlx::query(
            "INSERT INTO agents(agent_id, ip, port, score, last_seen)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET
                 ip = excluded.ip,
                 port = excluded.port,
                 score = excluded.score,
                 last_seen = excluded.last_seen",
        )
        .bind(agent_id)
        .bind(ip)
        .bind(port)
        .bind(score)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn agents_count(&self) -> Result<u32> {
        let row = sqlx::query("SELECT COUNT(*) FROM agents")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u32)
    }

    pub async fn all_agents(&self) -> Result<Vec<AgentRow>> {
        let rows = sqlx::query(
            "SELECT agent_id, ip, port, score, last_seen FROM agents",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AgentRow {
                agent_id: row.get(0),
                ip: row.get(1),
                port: row.get::<i64, _>(2) as u16,
                score: row.get::<i64, _>(3) as u8,
                last_seen: row.get(4),
            })
            .collect())
    }

    pub async fn agent_by_id(&self, agent_id: &str) -> Result<Option<AgentRow>> {
        let row = sqlx::query(
            "SELECT agent_id, ip, port, score, last_seen
             FROM agents WHERE agent_id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| AgentRow {
            agent_id: row.get(0),
            ip: row.get(1),
            port: row.get::<i64, _>(2) as u16,
            score: row.get::<i64, _>(3) as u8,
            last_seen: row.get(4),
        }))
    }

    /// Deletes agent rows not seen within the TTL. Returns how many rows
    /// went away.
    pub async fn evict_stale_agents(&self, ttl: Duration) -> Result<u64> {
        let cutoff = get_current_timestamp() as i64 - ttl.as_secs() as i64;

        let res = sqlx::query(
            "DELETE FROM agents WHERE last_seen IS NULL OR last_seen < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let evicted = res.rows_affected();
        if evicted > 0 {
            info!(event = "agents_evicted", count = evicted);
        } else {
            debug!(event = "agents_evicted", count = 0u64);
        }
        Ok(evicted)
    }

    pub async fn current_aggregator(&self) -> Result<Option<AggregatorRow>> {
        let row = sqlx::query(
            "SELECT aggregator_id, ip, port, updated_at
             FROM current_aggregator WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| AggregatorRow {
            aggregator_id: row.get(0),
            ip: row.get(1),
            port: row.get::<i64, _>(2) as u16,
            updated_at: row.get(3),
        }))
    }

    /// Overwrites the current-aggregator singleton.
    pub async fn set_current_aggregator(
        &self,
        aggregator_id: &str,
        ip: &str,
        port: u16,
    ) -> Result<()> {
        let now = get_current_timestamp() as i64;

        sqlx::query(
            "INSERT OR REPLACE INTO current_aggregator
             (id, aggregator_id, ip, port, updated_at)
             VALUES (1, ?, ?, ?, ?)",
        )
        .bind(aggregator_id)
        .bind(ip)
        .bind(port)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(event = "aggregator_updated", aggregator_id, ip, port);
        Ok(())
    }

    pub async fn clear_current_aggregator(&self) -> Result<()> {
        sqlx::query("DELETE FROM current_aggregator WHERE id = 1")
            .execute(&self.pool)
            .await?;

        info!(event = "aggregator_cleared");
        Ok(())
    }

    pub async fn insert_local_model(
        &self,
        model_id: &str,
        gen_time: u64,
        agent_id: &str,
        round: u64,
        performance: f64,
        num_samples: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO local_models VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(model_id)
        .bind(gen_time as i64)
        .bind(agent_id)
        .bind(round as i64)
        .bind(performance)
        .bind(num_samples)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_cluster_model(
        &self,
        model_id: &str,
        gen_time: u64,
        aggregator_id: &str,
        round: u64,
        num_samples: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO cluster_models VALUES (?, ?, ?, ?, ?)",
        )
        .bind(model_id)
        .bind(gen_time as i64)
        .bind(aggregator_id)
        .bind(round as i64)
        .bind(num_samples)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Resets the barrier singleton for a new round.
    pub async fn init_barrier(
        &self,
        round: u64,
        threshold: u32,
        aggregator_id: &str,
        state: BarrierState,
    ) -> Result<()> {
        let now = get_current_timestamp() as i64;

        sqlx::query(
            "INSERT OR REPLACE INTO round_barrier
             (id, current_round, state, barrier_threshold, agents_ready,
              models_received, aggregator_id, last_update)
             VALUES (1, ?, ?, ?, '', 0, ?, ?)",
        )
        .bind(round as i64)
        .bind(state.as_str())
        .bind(threshold as i64)
        .bind(aggregator_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(event = "barrier_init", round, threshold, state = state.as_str());
        Ok(())
    }

    pub async fn update_barrier_state(&self, state: BarrierState) -> Result<()> {
        let now = get_current_timestamp() as i64;

        sqlx::query(
            "UPDATE round_barrier SET state = ?, last_update = ? WHERE id = 1",
        )
        .bind(state.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Empties the barrier's ready set.
    pub async fn reset_barrier_agents(&self) -> Result<()> {
        let now = get_current_timestamp() as i64;

        sqlx::query(
            "UPDATE round_barrier SET agents_ready = '', last_update = ?
             WHERE id = 1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a local-model arrival against the barrier: the agent joins
    /// the ready set and the received counter moves up.
    pub async fn record_barrier_arrival(
        &self,
        agent_id: &str,
        round: u64,
    ) -> Result<()> {
        let now = get_current_timestamp() as i64;

        let ready: Option<String> =
            sqlx::query("SELECT agents_ready FROM round_barrier WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.get(0));

        if let Some(ready) = ready {
            let mut ids: Vec<&str> =
                ready.split(',').filter(|s| !s.is_empty()).collect();
            if !ids.contains(&agent_id) {
                ids.push(agent_id);
                sqlx::query(
                    "UPDATE round_barrier
                     SET agents_ready = ?,
                         models_received = models_received + 1,
                         last_update = ?
                     WHERE id = 1",
                )
                .bind(ids.join(","))
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }

        sqlx::query(
            "INSERT OR REPLACE INTO agent_round_status
             (agent_id, current_round, status, phase, last_heartbeat)
             VALUES (?, ?, 'ready', 'waiting_models', ?)",
        )
        .bind(agent_id)
        .bind(round as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn barrier(&self) -> Result<Option<BarrierRow>> {
        let row = sqlx::query(
            "SELECT current_round, state, barrier_threshold, agents_ready,
                    models_received, aggregator_id, last_update
             FROM round_barrier WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let state: String = row.get(1);
            let ready: String = row.get(3);
            BarrierRow {
                current_round: row.get::<i64, _>(0) as u64,
                state: BarrierState::from_str(&state)
                    .unwrap_or(BarrierState::Idle),
                threshold: row.get::<i64, _>(2) as u32,
                agents_ready: ready
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
                models_received: row.get::<i64, _>(4) as u32,
                aggregator_id: row.get::<Option<String>, _>(5).unwrap_or_default(),
                last_update: row.get(6),
            }
        }))
    }
}
