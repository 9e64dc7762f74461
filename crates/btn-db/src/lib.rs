use anyhow::{anyhow, Context, Result};
use btn_schemas::{Event, GlobalState, LoggedEvent, Phase};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};

pub const ENV_DB_URL: &str = btn_config::ENV_DATABASE_URL;

/// Connect to Postgres using BTN_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_global_states_table: bool,
}

/// Connectivity + schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='global_states'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_global_states_table: exists,
    })
}

// ---------------------------------------------------------------------------
// global_states
// ---------------------------------------------------------------------------

const STATE_COLUMNS: &str = "id, last_applied_offset, rules_hash, counter, phase, entropy, \
     reveal_until_ms, cooldown_ms, updated_at_ms, created_at";

fn state_from_row(row: &PgRow) -> Result<GlobalState> {
    let rank: i16 = row.try_get("phase")?;
    let phase = u8::try_from(rank)
        .ok()
        .and_then(Phase::from_rank)
        .ok_or_else(|| anyhow!("global_states.phase out of range: {rank}"))?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(GlobalState {
        id: row.try_get("id")?,
        last_applied_offset: row.try_get("last_applied_offset")?,
        counter: row.try_get("counter")?,
        phase,
        entropy: row.try_get("entropy")?,
        reveal_until_ms: row.try_get("reveal_until_ms")?,
        cooldown_ms: row.try_get("cooldown_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
        rules_hash: row.try_get("rules_hash")?,
        created_at: Some(created_at),
    })
}

/// The most recently persisted snapshot, if any.
pub async fn latest_state(pool: &PgPool) -> Result<Option<GlobalState>> {
    let sql = format!("select {STATE_COLUMNS} from global_states order by id desc limit 1");
    let row = sqlx::query(&sql)
        .fetch_optional(pool)
        .await
        .context("latest_state failed")?;
    row.as_ref().map(state_from_row).transpose()
}

/// Append a snapshot. `id` and `created_at` on the input are ignored; the
/// stored row is returned.
///
/// `last_applied_offset` is unique, so persisting the same batch twice fails
/// instead of producing a duplicate snapshot.
pub async fn insert_state(pool: &PgPool, st: &GlobalState) -> Result<GlobalState> {
    let sql = format!(
        r#"
        insert into global_states (
          last_applied_offset, rules_hash, counter, phase, entropy,
          reveal_until_ms, cooldown_ms, updated_at_ms
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8
        )
        returning {STATE_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(st.last_applied_offset)
        .bind(&st.rules_hash)
        .bind(st.counter)
        .bind(i16::from(st.phase.rank()))
        .bind(st.entropy)
        .bind(st.reveal_until_ms)
        .bind(st.cooldown_ms)
        .bind(st.updated_at_ms)
        .fetch_one(pool)
        .await
        .with_context(|| {
            format!(
                "insert_state failed (last_applied_offset={})",
                st.last_applied_offset
            )
        })?;
    state_from_row(&row)
}

// ---------------------------------------------------------------------------
// rulesets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredRuleset {
    pub id: i64,
    pub version: i32,
    pub hash: String,
    pub ruleset: Value,
    pub created_at: DateTime<Utc>,
}

fn ruleset_from_row(row: &PgRow) -> Result<StoredRuleset> {
    Ok(StoredRuleset {
        id: row.try_get("id")?,
        version: row.try_get("version")?,
        hash: row.try_get("hash")?,
        ruleset: row.try_get("ruleset")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Hash of the active ruleset (highest version).
pub async fn latest_rules_hash(pool: &PgPool) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("select hash from rulesets order by version desc, id desc limit 1")
            .fetch_optional(pool)
            .await
            .context("latest_rules_hash failed")?;
    Ok(row.map(|(h,)| h))
}

pub async fn fetch_ruleset_by_hash(pool: &PgPool, hash: &str) -> Result<Option<StoredRuleset>> {
    let row = sqlx::query(
        r#"
        select id, version, hash, ruleset, created_at
        from rulesets
        where hash = $1
        "#,
    )
    .bind(hash)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("fetch_ruleset_by_hash failed (hash={hash})"))?;
    row.as_ref().map(ruleset_from_row).transpose()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulesetInsert {
    Inserted { version: i32 },
    AlreadyPresent { version: i32 },
}

impl RulesetInsert {
    pub fn version(&self) -> i32 {
        match self {
            RulesetInsert::Inserted { version } | RulesetInsert::AlreadyPresent { version } => {
                *version
            }
        }
    }
}

/// Advisory lock key held while a ruleset version is being allocated.
pub const RULESETS_SEED_LOCK: i64 = 0x6274_6e5f_7275_6c;

/// Store a ruleset under the next version. Idempotent by hash: seeding the same
/// content twice reports the existing version. Concurrent seeds are serialized
/// so each one gets a distinct version.
pub async fn insert_ruleset(pool: &PgPool, hash: &str, ruleset: &Value) -> Result<RulesetInsert> {
    let mut tx = pool.begin().await.context("insert_ruleset begin failed")?;

    sqlx::query("select pg_advisory_xact_lock($1)")
        .bind(RULESETS_SEED_LOCK)
        .execute(&mut *tx)
        .await
        .context("rulesets seed lock failed")?;

    let inserted: Option<(i32,)> = sqlx::query_as(
        r#"
        insert into rulesets (version, hash, ruleset)
        select coalesce(max(version), 0) + 1, $1, $2
        from rulesets
        on conflict (hash) do nothing
        returning version
        "#,
    )
    .bind(hash)
    .bind(ruleset)
    .fetch_optional(&mut *tx)
    .await
    .context("insert_ruleset failed")?;

    let outcome = match inserted {
        Some((version,)) => RulesetInsert::Inserted { version },
        None => {
            let (version,): (i32,) =
                sqlx::query_as("select version from rulesets where hash = $1")
                    .bind(hash)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("insert_ruleset lookup failed")?
                    .ok_or_else(|| {
                        anyhow!("ruleset {hash} conflicted on insert but is not readable")
                    })?;
            RulesetInsert::AlreadyPresent { version }
        }
    };

    tx.commit().await.context("insert_ruleset commit failed")?;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// event_log + consumer_checkpoints
// ---------------------------------------------------------------------------

/// Advisory lock key held by every event-log append until its transaction
/// commits.
pub const EVENT_LOG_APPEND_LOCK: i64 = 0x6274_6e5f_6c6f_67;

/// Append an event; returns its log offset.
///
/// Appends are serialized, so offsets become visible in ascending order and a
/// reader can never see offset N+1 while N is still in flight.
pub async fn append_event(pool: &PgPool, event: &Event) -> Result<i64> {
    let mut tx = pool.begin().await.context("append_event begin failed")?;
    let offset = append_event_locked(&mut *tx, event).await?;
    tx.commit().await.context("append_event commit failed")?;
    Ok(offset)
}

/// Take the append lock and insert inside the caller's transaction. The lock
/// is released when that transaction ends.
pub async fn append_event_locked(conn: &mut PgConnection, event: &Event) -> Result<i64> {
    sqlx::query("select pg_advisory_xact_lock($1)")
        .bind(EVENT_LOG_APPEND_LOCK)
        .execute(&mut *conn)
        .await
        .context("event_log append lock failed")?;

    let payload = serde_json::to_value(event).context("event serialize failed")?;
    let (offset,): (i64,) = sqlx::query_as(
        r#"
        insert into event_log (kind, payload)
        values ($1, $2)
        returning log_offset
        "#,
    )
    .bind(event.kind())
    .bind(payload)
    .fetch_one(&mut *conn)
    .await
    .context("append_event failed")?;
    Ok(offset)
}

/// Up to `limit` events with `offset > after_offset`, ascending.
pub async fn poll_events(pool: &PgPool, after_offset: i64, limit: i64) -> Result<Vec<LoggedEvent>> {
    let rows: Vec<(i64, Value)> = sqlx::query_as(
        r#"
        select log_offset, payload
        from event_log
        where log_offset > $1
        order by log_offset asc
        limit $2
        "#,
    )
    .bind(after_offset)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("poll_events failed")?;

    rows.into_iter()
        .map(|(offset, payload)| {
            let event: Event = serde_json::from_value(payload)
                .with_context(|| format!("event_log row {offset} has an invalid payload"))?;
            Ok(LoggedEvent::new(offset, event))
        })
        .collect()
}

/// Record `offset` as processed for `group`. Never moves a checkpoint back.
pub async fn commit_checkpoint(pool: &PgPool, group: &str, offset: i64) -> Result<()> {
    sqlx::query(
        r#"
        insert into consumer_checkpoints (consumer_group, committed_offset)
        values ($1, $2)
        on conflict (consumer_group) do update
          set committed_offset = greatest(consumer_checkpoints.committed_offset, excluded.committed_offset),
              updated_at = now()
        "#,
    )
    .bind(group)
    .bind(offset)
    .execute(pool)
    .await
    .with_context(|| format!("commit_checkpoint failed (group={group}, offset={offset})"))?;
    Ok(())
}

pub async fn committed_offset(pool: &PgPool, group: &str) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "select committed_offset from consumer_checkpoints where consumer_group = $1",
    )
    .bind(group)
    .fetch_optional(pool)
    .await
    .context("committed_offset failed")?;
    Ok(row.map(|(o,)| o))
}

// ---------------------------------------------------------------------------
// notifications
// ---------------------------------------------------------------------------

/// Fire a Postgres NOTIFY on `channel`.
pub async fn notify(pool: &PgPool, channel: &str, payload: &str) -> Result<()> {
    sqlx::query("select pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(pool)
        .await
        .with_context(|| format!("pg_notify failed (channel={channel})"))?;
    Ok(())
}
