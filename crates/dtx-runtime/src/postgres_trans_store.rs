//! Postgres-backed transaction store.
//!
//! This module is feature-gated behind `kernel-postgres`. Calls block on a
//! dedicated single-worker tokio runtime, so they must not be made from inside
//! another async runtime's worker thread.

#![cfg(feature = "kernel-postgres")]

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnection, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

use dtx_kernel::{
    dt_to_ms, ms_to_dt, BranchColumn, BranchRecord, ColumnValue, CronResetOutcome, GlobalColumn,
    GlobalTransaction, ScanCursor, StoreError, StoreResult, TransStore,
};

use crate::schema::{
    pending_status_predicate, sql_limit, BRANCH_INSERT_COLUMNS, BRANCH_SELECT_COLUMNS,
    BRANCH_TABLE, GLOBAL_INSERT_COLUMNS, GLOBAL_SELECT_COLUMNS, GLOBAL_TABLE,
};

const POSTGRES_TRANS_SCHEMA_VERSION: i64 = 1;
const MIGRATIONS_TABLE: &str = "trans_schema_migrations";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn new_db_runtime() -> Result<Arc<tokio::runtime::Runtime>, String> {
    static DB_RT: OnceLock<Result<Arc<tokio::runtime::Runtime>, String>> = OnceLock::new();
    DB_RT
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .thread_name("dtx-store-pg")
                .build()
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
}

fn map_pg_err(prefix: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::storage(prefix, e)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[derive(Clone)]
pub struct PostgresTransStore {
    pool: Option<PgPool>,
    schema: String,
    init_error: Option<String>,
    db_runtime: Option<Arc<tokio::runtime::Runtime>>,
    schema_ready: OnceLock<Result<(), String>>,
}

impl PostgresTransStore {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self::connect_lazy(database_url, DEFAULT_MAX_CONNECTIONS)
    }

    /// Builds a store whose pool connects on first use.
    pub fn connect_lazy(database_url: impl Into<String>, max_connections: u32) -> Self {
        let database_url = database_url.into();
        let db_runtime = new_db_runtime().ok();
        let pool = db_runtime.as_ref().and_then(|rt| {
            let _guard = rt.enter();
            PgPoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect_lazy(&database_url)
                .ok()
        });
        let init_error = if pool.is_some() {
            None
        } else if db_runtime.is_none() {
            Some("failed to initialize postgres store runtime".to_string())
        } else {
            Some("failed to initialize lazy postgres store pool".to_string())
        };

        Self {
            pool,
            schema: "public".to_string(),
            init_error,
            db_runtime,
            schema_ready: OnceLock::new(),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            schema: "public".to_string(),
            init_error: None,
            db_runtime: new_db_runtime().ok(),
            schema_ready: OnceLock::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn runtime(&self) -> StoreResult<&tokio::runtime::Runtime> {
        if let Some(err) = &self.init_error {
            return Err(map_pg_err("postgres init error", err));
        }
        self.db_runtime
            .as_deref()
            .ok_or_else(|| map_pg_err("runtime not available", "no db runtime"))
    }

    fn pool(&self) -> StoreResult<&PgPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| map_pg_err("pool not available", "no postgres pool"))
    }

    fn table(&self, name: &str) -> String {
        format!("\"{}\".{}", self.schema, name)
    }

    fn ensure_schema(&self) -> StoreResult<()> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(map_pg_err("invalid schema", &self.schema));
        }

        let result = self.schema_ready.get_or_init(|| {
            let pool = match self.pool() {
                Ok(p) => p.clone(),
                Err(e) => return Err(e.to_string()),
            };
            let rt = match self.runtime() {
                Ok(r) => r,
                Err(e) => return Err(e.to_string()),
            };
            let schema = self.schema.clone();
            rt.block_on(async move { bootstrap_schema(&pool, &schema).await })
        });

        result
            .clone()
            .map_err(|e| map_pg_err("schema bootstrap", e))
    }
}

async fn bootstrap_schema(pool: &PgPool, schema: &str) -> Result<(), String> {
    let sql_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema);
    let sql_migration_table = format!(
        "CREATE TABLE IF NOT EXISTS \"{}\".{} (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at_ms BIGINT NOT NULL
        )",
        schema, MIGRATIONS_TABLE
    );
    let sql_current_version = format!(
        "SELECT COALESCE(MAX(version), 0)::BIGINT FROM \"{}\".{}",
        schema, MIGRATIONS_TABLE
    );

    sqlx::query(&sql_schema)
        .execute(pool)
        .await
        .map_err(|e| e.to_string())?;
    sqlx::query(&sql_migration_table)
        .execute(pool)
        .await
        .map_err(|e| e.to_string())?;

    let current_version: i64 = sqlx::query_scalar(&sql_current_version)
        .fetch_one(pool)
        .await
        .map_err(|e| e.to_string())?;
    if current_version > POSTGRES_TRANS_SCHEMA_VERSION {
        return Err(format!(
            "postgres trans schema version {} is newer than supported {}",
            current_version, POSTGRES_TRANS_SCHEMA_VERSION
        ));
    }
    if current_version >= 1 {
        return Ok(());
    }

    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS \"{s}\".{t} (
                id BIGSERIAL PRIMARY KEY,
                gid TEXT NOT NULL UNIQUE,
                trans_type TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                query_prepared TEXT NOT NULL DEFAULT '',
                protocol TEXT NOT NULL DEFAULT '',
                options TEXT NOT NULL DEFAULT '',
                custom_data TEXT NOT NULL DEFAULT '',
                ext_data TEXT NOT NULL DEFAULT '',
                result TEXT NOT NULL DEFAULT '',
                rollback_reason TEXT NOT NULL DEFAULT '',
                owner TEXT NOT NULL DEFAULT '',
                next_cron_interval BIGINT NOT NULL DEFAULT 0,
                next_cron_time_ms BIGINT NOT NULL,
                create_time_ms BIGINT NOT NULL,
                update_time_ms BIGINT NOT NULL,
                finish_time_ms BIGINT NULL,
                rollback_time_ms BIGINT NULL
            )",
            s = schema,
            t = GLOBAL_TABLE
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_trans_global_status_cron
             ON \"{}\".{}(status, next_cron_time_ms)",
            schema, GLOBAL_TABLE
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_trans_global_owner ON \"{}\".{}(owner)",
            schema, GLOBAL_TABLE
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{s}\".{t} (
                id BIGSERIAL PRIMARY KEY,
                gid TEXT NOT NULL,
                url TEXT NOT NULL DEFAULT '',
                bin_data BYTEA NOT NULL,
                branch_id TEXT NOT NULL,
                op TEXT NOT NULL,
                status TEXT NOT NULL,
                create_time_ms BIGINT NOT NULL,
                update_time_ms BIGINT NOT NULL,
                finish_time_ms BIGINT NULL,
                rollback_time_ms BIGINT NULL,
                CONSTRAINT trans_branch_op_key UNIQUE (gid, branch_id, op)
            )",
            s = schema,
            t = BRANCH_TABLE
        ),
    ];
    for sql in &statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| e.to_string())?;
    }

    let sql_record = format!(
        "INSERT INTO \"{}\".{}(version, name, applied_at_ms)
         VALUES ($1, $2, $3)
         ON CONFLICT(version) DO NOTHING",
        schema, MIGRATIONS_TABLE
    );
    sqlx::query(&sql_record)
        .bind(1_i32)
        .bind("baseline_trans_tables")
        .bind(dt_to_ms(Utc::now()))
        .execute(pool)
        .await
        .map_err(|e| e.to_string())?;
    log::info!(
        "postgres trans schema provisioned schema={} version={}",
        schema,
        POSTGRES_TRANS_SCHEMA_VERSION
    );
    Ok(())
}

impl TransStore for PostgresTransStore {
    fn ping(&self) -> StoreResult<()> {
        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        rt.block_on(async move {
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(&pool)
                .await
                .map_err(|e| map_pg_err("ping", e))?;
            Ok(())
        })
    }

    fn populate_schema(&self, skip_drop: bool) -> StoreResult<()> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(map_pg_err("invalid schema", &self.schema));
        }
        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let schema = self.schema.clone();
        let drops = [
            self.table(BRANCH_TABLE),
            self.table(GLOBAL_TABLE),
            self.table(MIGRATIONS_TABLE),
        ];
        rt.block_on(async move {
            if !skip_drop {
                for table in &drops {
                    sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                        .execute(&pool)
                        .await
                        .map_err(|e| map_pg_err("drop trans table", e))?;
                }
            }
            bootstrap_schema(&pool, &schema)
                .await
                .map_err(|e| map_pg_err("populate postgres trans schema", e))
        })?;
        log::info!(
            "populate_schema backend=postgres schema={} skip_drop={}",
            self.schema,
            skip_drop
        );
        Ok(())
    }

    fn find_global(&self, gid: &str) -> StoreResult<Option<GlobalTransaction>> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE gid = $1",
            GLOBAL_SELECT_COLUMNS,
            self.table(GLOBAL_TABLE)
        );
        let gid = gid.to_string();
        rt.block_on(async move {
            let row = sqlx::query(&sql)
                .bind(&gid)
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_pg_err("find global", e))?;
            Ok(row.as_ref().map(map_row_to_global))
        })
    }

    fn scan_globals(
        &self,
        cursor: &mut ScanCursor,
        limit: usize,
    ) -> StoreResult<Vec<GlobalTransaction>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE id < $1 ORDER BY id DESC LIMIT $2",
            GLOBAL_SELECT_COLUMNS,
            self.table(GLOBAL_TABLE)
        );
        let upper_bound = cursor.upper_bound();
        let page = rt.block_on(async move {
            let rows = sqlx::query(&sql)
                .bind(upper_bound)
                .bind(sql_limit(limit))
                .fetch_all(&pool)
                .await
                .map_err(|e| map_pg_err("scan globals", e))?;
            Ok::<_, StoreError>(rows.iter().map(map_row_to_global).collect::<Vec<_>>())
        })?;
        cursor.advance(&page, limit);
        Ok(page)
    }

    fn find_branches(&self, gid: &str) -> StoreResult<Vec<BranchRecord>> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE gid = $1 ORDER BY id ASC",
            BRANCH_SELECT_COLUMNS,
            self.table(BRANCH_TABLE)
        );
        let gid = gid.to_string();
        rt.block_on(async move {
            let rows = sqlx::query(&sql)
                .bind(&gid)
                .fetch_all(&pool)
                .await
                .map_err(|e| map_pg_err("find branches", e))?;
            Ok(rows.iter().map(map_row_to_branch).collect())
        })
    }

    fn update_branches(
        &self,
        branches: &[BranchRecord],
        updates: &[BranchColumn],
    ) -> StoreResult<usize> {
        if branches.is_empty() {
            return Ok(0);
        }
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = upsert_branch_sql(&self.table(BRANCH_TABLE), updates);
        let branches = branches.to_vec();
        rt.block_on(async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| map_pg_err("begin update branches tx", e))?;
            let affected = upsert_branches(&mut tx, &sql, &branches)
                .await
                .map_err(|e| map_pg_err("upsert branches", e))?;
            tx.commit()
                .await
                .map_err(|e| map_pg_err("commit update branches tx", e))?;
            Ok(affected)
        })
    }

    fn lock_global_save_branches(
        &self,
        gid: &str,
        status: &str,
        branches: &[BranchRecord],
    ) -> StoreResult<()> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let lock_sql = format!(
            "SELECT id FROM {} WHERE gid = $1 AND status = $2 FOR UPDATE",
            self.table(GLOBAL_TABLE)
        );
        let upsert_sql = upsert_branch_sql(&self.table(BRANCH_TABLE), &BranchColumn::ALL);
        let gid = gid.to_string();
        let status = status.to_string();
        let branches = branches.to_vec();
        rt.block_on(async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| map_pg_err("begin lock global tx", e))?;
            let locked: Option<i64> = sqlx::query_scalar(&lock_sql)
                .bind(&gid)
                .bind(&status)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_pg_err("lock global", e))?;
            if locked.is_none() {
                log::debug!(
                    "lock_global_save_branches miss gid={} status={}",
                    gid,
                    status
                );
                return Err(StoreError::NotFound(format!(
                    "global transaction gid={} status={}",
                    gid, status
                )));
            }
            upsert_branches(&mut tx, &upsert_sql, &branches)
                .await
                .map_err(|e| map_pg_err("save branches under lock", e))?;
            tx.commit()
                .await
                .map_err(|e| map_pg_err("commit lock global tx", e))?;
            Ok(())
        })
    }

    fn may_save_new_trans(
        &self,
        global: &GlobalTransaction,
        branches: &[BranchRecord],
    ) -> StoreResult<()> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(gid) DO NOTHING",
            self.table(GLOBAL_TABLE),
            GLOBAL_INSERT_COLUMNS,
            pg_placeholders(1, 17)
        );
        let upsert_sql = upsert_branch_sql(&self.table(BRANCH_TABLE), &[]);
        let global = global.clone();
        let branches = branches.to_vec();
        rt.block_on(async move {
            let conflict = || {
                StoreError::UniqueConflict(format!(
                    "global transaction gid={} already exists",
                    global.gid
                ))
            };
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| map_pg_err("begin save new trans tx", e))?;
            let inserted = bind_global_insert(sqlx::query(&insert_sql), &global)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        conflict()
                    } else {
                        map_pg_err("insert global", e)
                    }
                })?
                .rows_affected();
            if inserted == 0 {
                return Err(conflict());
            }
            upsert_branches(&mut tx, &upsert_sql, &branches)
                .await
                .map_err(|e| map_pg_err("insert branches", e))?;
            tx.commit()
                .await
                .map_err(|e| map_pg_err("commit save new trans tx", e))?;
            Ok(())
        })
    }

    fn change_global_status(
        &self,
        global: &mut GlobalTransaction,
        new_status: &str,
        updates: &[GlobalColumn],
    ) -> StoreResult<()> {
        self.ensure_schema()?;

        let columns = GlobalColumn::status_assignments(updates);
        let mut next = global.clone();
        next.status = new_status.to_string();

        let sets: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| format!("{} = ${}", column.column(), idx + 1))
            .collect();
        let n = columns.len();
        let sql = format!(
            "UPDATE {} SET {} WHERE gid = ${} AND status = ${}",
            self.table(GLOBAL_TABLE),
            sets.join(", "),
            n + 1,
            n + 2
        );
        let values: Vec<ColumnValue> = columns.iter().map(|c| c.value_of(&next)).collect();
        let gid = global.gid.clone();
        let expected = global.status.clone();

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let updated = rt.block_on(async move {
            let mut query = sqlx::query(&sql);
            for value in values {
                query = bind_value(query, value);
            }
            query
                .bind(&gid)
                .bind(&expected)
                .execute(&pool)
                .await
                .map(|done| done.rows_affected())
                .map_err(|e| map_pg_err("change global status", e))
        })?;
        if updated == 0 {
            log::debug!(
                "change_global_status miss gid={} expected={} new={}",
                global.gid,
                global.status,
                new_status
            );
            return Err(StoreError::NotFound(format!(
                "global transaction gid={} status={}",
                global.gid, global.status
            )));
        }
        global.status = next.status;
        Ok(())
    }

    fn touch_cron_time(
        &self,
        global: &mut GlobalTransaction,
        next_cron_interval: i64,
        next_cron_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.ensure_schema()?;

        global.update_time = now;
        global.next_cron_time = next_cron_time;
        global.next_cron_interval = next_cron_interval;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "UPDATE {}
             SET next_cron_time_ms = $1, update_time_ms = $2, next_cron_interval = $3
             WHERE gid = $4 AND status = $5",
            self.table(GLOBAL_TABLE)
        );
        let gid = global.gid.clone();
        let status = global.status.clone();
        let updated = rt.block_on(async move {
            sqlx::query(&sql)
                .bind(dt_to_ms(next_cron_time))
                .bind(dt_to_ms(now))
                .bind(next_cron_interval)
                .bind(&gid)
                .bind(&status)
                .execute(&pool)
                .await
                .map(|done| done.rows_affected())
                .map_err(|e| map_pg_err("touch cron time", e))
        })?;
        if updated == 0 {
            log::debug!(
                "touch_cron_time no-op gid={} status={}",
                global.gid,
                global.status
            );
        }
        Ok(())
    }

    fn lock_one_global_trans(
        &self,
        due_before: DateTime<Utc>,
        owner: &str,
        next_cron_time: DateTime<Utc>,
    ) -> StoreResult<Option<GlobalTransaction>> {
        if owner.is_empty() {
            return Err(StoreError::Storage(
                "lock one global trans: owner token must not be empty".to_string(),
            ));
        }
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let table = self.table(GLOBAL_TABLE);
        let sql = format!(
            "UPDATE {t} SET owner = $1, next_cron_time_ms = $2
             WHERE id = (
               SELECT id FROM {t}
               WHERE {pending} AND next_cron_time_ms < $3
               LIMIT 1
               FOR UPDATE SKIP LOCKED
             )
             RETURNING {cols}",
            t = table,
            pending = pending_status_predicate(),
            cols = GLOBAL_SELECT_COLUMNS
        );
        let owner = owner.to_string();
        rt.block_on(async move {
            let row = sqlx::query(&sql)
                .bind(&owner)
                .bind(dt_to_ms(next_cron_time))
                .bind(dt_to_ms(due_before))
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_pg_err("claim global trans", e))?;
            Ok(row.as_ref().map(map_row_to_global))
        })
    }

    fn reset_cron_time(
        &self,
        overdue_after: DateTime<Utc>,
        reset_to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<CronResetOutcome> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let table = self.table(GLOBAL_TABLE);
        let pending = pending_status_predicate();
        let reset_sql = format!(
            "UPDATE {t} SET next_cron_time_ms = $1
             WHERE id IN (
               SELECT id FROM {t}
               WHERE {pending} AND next_cron_time_ms > $2
               LIMIT $3
               FOR UPDATE SKIP LOCKED
             )",
            t = table,
            pending = pending
        );
        let probe_sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {} AND next_cron_time_ms > $1 LIMIT 1)",
            table, pending
        );
        rt.block_on(async move {
            let fixed = sqlx::query(&reset_sql)
                .bind(dt_to_ms(reset_to))
                .bind(dt_to_ms(overdue_after))
                .bind(sql_limit(limit))
                .execute(&pool)
                .await
                .map_err(|e| map_pg_err("reset cron time", e))?
                .rows_affected();
            let mut has_more = false;
            if fixed == limit as u64 {
                has_more = sqlx::query_scalar::<_, bool>(&probe_sql)
                    .bind(dt_to_ms(overdue_after))
                    .fetch_one(&pool)
                    .await
                    .map_err(|e| map_pg_err("probe overdue cron time", e))?;
            }
            Ok(CronResetOutcome { fixed, has_more })
        })
    }
}

fn pg_placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|idx| format!("${}", idx))
        .collect::<Vec<_>>()
        .join(", ")
}

fn upsert_branch_sql(table: &str, updates: &[BranchColumn]) -> String {
    let updates = BranchColumn::dedup(updates);
    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let sets: Vec<String> = updates
            .iter()
            .map(|column| format!("{0} = excluded.{0}", column.column()))
            .collect();
        format!("DO UPDATE SET {}", sets.join(", "))
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(gid, branch_id, op) {}",
        table,
        BRANCH_INSERT_COLUMNS,
        pg_placeholders(1, 10),
        on_conflict
    )
}

async fn upsert_branches(
    conn: &mut PgConnection,
    sql: &str,
    branches: &[BranchRecord],
) -> Result<usize, sqlx::Error> {
    let mut affected = 0;
    for b in branches {
        affected += sqlx::query(sql)
            .bind(&b.gid)
            .bind(&b.url)
            .bind(&b.bin_data)
            .bind(&b.branch_id)
            .bind(&b.op)
            .bind(&b.status)
            .bind(dt_to_ms(b.create_time))
            .bind(dt_to_ms(b.update_time))
            .bind(b.finish_time.map(dt_to_ms))
            .bind(b.rollback_time.map(dt_to_ms))
            .execute(&mut *conn)
            .await?
            .rows_affected() as usize;
    }
    Ok(affected)
}

fn bind_global_insert<'q>(
    query: Query<'q, Postgres, PgArguments>,
    g: &'q GlobalTransaction,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(&g.gid)
        .bind(&g.trans_type)
        .bind(&g.status)
        .bind(&g.query_prepared)
        .bind(&g.protocol)
        .bind(&g.options)
        .bind(&g.custom_data)
        .bind(&g.ext_data)
        .bind(&g.result)
        .bind(&g.rollback_reason)
        .bind(&g.owner)
        .bind(g.next_cron_interval)
        .bind(dt_to_ms(g.next_cron_time))
        .bind(dt_to_ms(g.create_time))
        .bind(dt_to_ms(g.update_time))
        .bind(g.finish_time.map(dt_to_ms))
        .bind(g.rollback_time.map(dt_to_ms))
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: ColumnValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        ColumnValue::Integer(v) => query.bind(v),
        ColumnValue::NullableInteger(v) => query.bind(v),
        ColumnValue::Text(v) => query.bind(v),
        ColumnValue::Blob(v) => query.bind(v),
    }
}

fn map_row_to_global(row: &PgRow) -> GlobalTransaction {
    GlobalTransaction {
        id: row.get(0),
        gid: row.get(1),
        trans_type: row.get(2),
        status: row.get(3),
        query_prepared: row.get(4),
        protocol: row.get(5),
        options: row.get(6),
        custom_data: row.get(7),
        ext_data: row.get(8),
        result: row.get(9),
        rollback_reason: row.get(10),
        owner: row.get(11),
        next_cron_interval: row.get(12),
        next_cron_time: ms_to_dt(row.get::<i64, _>(13)),
        create_time: ms_to_dt(row.get::<i64, _>(14)),
        update_time: ms_to_dt(row.get::<i64, _>(15)),
        finish_time: row.get::<Option<i64>, _>(16).map(ms_to_dt),
        rollback_time: row.get::<Option<i64>, _>(17).map(ms_to_dt),
    }
}

fn map_row_to_branch(row: &PgRow) -> BranchRecord {
    BranchRecord {
        id: row.get(0),
        gid: row.get(1),
        url: row.get(2),
        bin_data: row.get(3),
        branch_id: row.get(4),
        op: row.get(5),
        status: row.get(6),
        create_time: ms_to_dt(row.get::<i64, _>(7)),
        update_time: ms_to_dt(row.get::<i64, _>(8)),
        finish_time: row.get::<Option<i64>, _>(9).map(ms_to_dt),
        rollback_time: row.get::<Option<i64>, _>(10).map(ms_to_dt),
    }
}
