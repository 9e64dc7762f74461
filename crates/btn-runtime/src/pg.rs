//! Postgres-backed adapters over `btn-db`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use btn_config::{hash_json, RulesConfig, Ruleset};
use btn_schemas::{BusMsg, Event, GlobalState, LoggedEvent};
use sqlx::PgPool;

use crate::ports::{EventLog, NotificationBus, RulesRepository, StateStore};

/// `event_log` table, checkpointed under one consumer group.
#[derive(Debug, Clone)]
pub struct PgEventLog {
    pool: PgPool,
    group: String,
}

impl PgEventLog {
    pub fn new(pool: PgPool, group: impl Into<String>) -> Self {
        Self {
            pool,
            group: group.into(),
        }
    }

    pub async fn committed(&self) -> Result<Option<i64>> {
        btn_db::committed_offset(&self.pool, &self.group).await
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, event: &Event) -> Result<i64> {
        btn_db::append_event(&self.pool, event).await
    }

    async fn poll(&self, after_offset: i64, max: usize) -> Result<Vec<LoggedEvent>> {
        let limit = i64::try_from(max).context("poll batch size does not fit in i64")?;
        btn_db::poll_events(&self.pool, after_offset, limit).await
    }

    async fn commit(&self, offset: i64) -> Result<()> {
        btn_db::commit_checkpoint(&self.pool, &self.group, offset).await
    }
}

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn latest(&self) -> Result<Option<GlobalState>> {
        btn_db::latest_state(&self.pool).await
    }

    async fn append(&self, state: &GlobalState) -> Result<GlobalState> {
        btn_db::insert_state(&self.pool, state).await
    }
}

/// Rulesets stored in `rulesets`; the highest version is active.
#[derive(Debug, Clone)]
pub struct PgRulesRepository {
    pool: PgPool,
}

impl PgRulesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RulesRepository for PgRulesRepository {
    async fn current_hash(&self) -> Result<Option<String>> {
        btn_db::latest_rules_hash(&self.pool).await
    }

    async fn fetch(&self, hash: &str) -> Result<Option<Ruleset>> {
        let Some(stored) = btn_db::fetch_ruleset_by_hash(&self.pool, hash).await? else {
            return Ok(None);
        };

        let computed = hash_json(&stored.ruleset)?;
        if computed != stored.hash {
            bail!(
                "ruleset v{} content hash mismatch: stored={} computed={}",
                stored.version,
                stored.hash,
                computed
            );
        }

        let config = RulesConfig::from_json(&stored.ruleset)
            .with_context(|| format!("ruleset v{} ({hash}) is invalid", stored.version))?;
        Ok(Some(Ruleset::new(stored.hash, config)))
    }
}

/// `pg_notify(topic, json)`; the topic is used as the channel name.
#[derive(Debug, Clone)]
pub struct PgNotifyBus {
    pool: PgPool,
}

impl PgNotifyBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationBus for PgNotifyBus {
    async fn publish(&self, topic: &str, state: &GlobalState) -> Result<()> {
        let payload = serde_json::to_string(&BusMsg::StateUpdated(state.clone()))
            .context("serialize state notification")?;
        btn_db::notify(&self.pool, topic, &payload).await
    }
}
