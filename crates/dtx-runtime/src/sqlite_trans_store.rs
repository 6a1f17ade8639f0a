//! SQLite-backed transaction store.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior,
};

use dtx_kernel::{
    dt_to_ms, ms_to_dt, BranchColumn, BranchRecord, ColumnValue, CronResetOutcome, GlobalColumn,
    GlobalTransaction, ScanCursor, StoreError, StoreResult, TransStore,
};

use crate::schema::{
    pending_status_predicate, sql_limit, BRANCH_INSERT_COLUMNS, BRANCH_SELECT_COLUMNS,
    BRANCH_TABLE, GLOBAL_INSERT_COLUMNS, GLOBAL_SELECT_COLUMNS, GLOBAL_TABLE,
};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Single-connection SQLite store. Composite operations run in
/// `BEGIN IMMEDIATE` transactions so other processes sharing the file are
/// serialized against them too.
#[derive(Clone)]
pub struct SqliteTransStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTransStore {
    pub fn new(db_path: &str) -> StoreResult<Self> {
        Self::open(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open(db_path: &str, busy_timeout: Duration) -> StoreResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| map_sqlite_err("open sqlite trans store", e))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| map_sqlite_err("set busy timeout", e))?;
        if db_path != ":memory:" {
            conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get::<_, String>(0))
                .map_err(|e| map_sqlite_err("set journal_mode", e))?;
        }
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Storage("sqlite trans store lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(&schema_sql())
            .map_err(|e| map_sqlite_err("init sqlite trans schema", e))
    }
}

impl TransStore for SqliteTransStore {
    fn ping(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
            .map_err(|e| map_sqlite_err("ping", e))?;
        Ok(())
    }

    fn populate_schema(&self, skip_drop: bool) -> StoreResult<()> {
        let conn = self.conn()?;
        if !skip_drop {
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
                BRANCH_TABLE, GLOBAL_TABLE
            ))
            .map_err(|e| map_sqlite_err("drop trans tables", e))?;
        }
        conn.execute_batch(&schema_sql())
            .map_err(|e| map_sqlite_err("populate sqlite trans schema", e))?;
        log::info!("populate_schema backend=sqlite skip_drop={}", skip_drop);
        Ok(())
    }

    fn find_global(&self, gid: &str) -> StoreResult<Option<GlobalTransaction>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM {} WHERE gid = ?1",
                GLOBAL_SELECT_COLUMNS, GLOBAL_TABLE
            ),
            params![gid],
            map_row_to_global,
        )
        .optional()
        .map_err(|e| map_sqlite_err("find global", e))
    }

    fn scan_globals(
        &self,
        cursor: &mut ScanCursor,
        limit: usize,
    ) -> StoreResult<Vec<GlobalTransaction>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM {} WHERE id < ?1 ORDER BY id DESC LIMIT ?2",
                GLOBAL_SELECT_COLUMNS, GLOBAL_TABLE
            ))
            .map_err(|e| map_sqlite_err("prepare scan globals", e))?;
        let rows = stmt
            .query_map(
                params![cursor.upper_bound(), sql_limit(limit)],
                map_row_to_global,
            )
            .map_err(|e| map_sqlite_err("query scan globals", e))?;
        let mut out = Vec::new();
        for item in rows {
            out.push(item.map_err(|e| map_sqlite_err("scan globals", e))?);
        }
        cursor.advance(&out, limit);
        Ok(out)
    }

    fn find_branches(&self, gid: &str) -> StoreResult<Vec<BranchRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM {} WHERE gid = ?1 ORDER BY id ASC",
                BRANCH_SELECT_COLUMNS, BRANCH_TABLE
            ))
            .map_err(|e| map_sqlite_err("prepare find branches", e))?;
        let rows = stmt
            .query_map(params![gid], map_row_to_branch)
            .map_err(|e| map_sqlite_err("query find branches", e))?;
        let mut out = Vec::new();
        for item in rows {
            out.push(item.map_err(|e| map_sqlite_err("scan branches", e))?);
        }
        Ok(out)
    }

    fn update_branches(
        &self,
        branches: &[BranchRecord],
        updates: &[BranchColumn],
    ) -> StoreResult<usize> {
        if branches.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_sqlite_err("begin update branches tx", e))?;
        let affected = upsert_branches(&tx, branches, updates)
            .map_err(|e| map_sqlite_err("upsert branches", e))?;
        tx.commit()
            .map_err(|e| map_sqlite_err("commit update branches tx", e))?;
        Ok(affected)
    }

    fn lock_global_save_branches(
        &self,
        gid: &str,
        status: &str,
        branches: &[BranchRecord],
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_sqlite_err("begin lock global tx", e))?;
        let locked: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT id FROM {} WHERE gid = ?1 AND status = ?2",
                    GLOBAL_TABLE
                ),
                params![gid, status],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| map_sqlite_err("lock global", e))?;
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
        upsert_branches(&tx, branches, &BranchColumn::ALL)
            .map_err(|e| map_sqlite_err("save branches under lock", e))?;
        tx.commit()
            .map_err(|e| map_sqlite_err("commit lock global tx", e))?;
        Ok(())
    }

    fn may_save_new_trans(
        &self,
        global: &GlobalTransaction,
        branches: &[BranchRecord],
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_sqlite_err("begin save new trans tx", e))?;
        let inserted = match insert_global(&tx, global) {
            Ok(n) => n,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                0
            }
            Err(e) => return Err(map_sqlite_err("insert global", e)),
        };
        if inserted == 0 {
            return Err(StoreError::UniqueConflict(format!(
                "global transaction gid={} already exists",
                global.gid
            )));
        }
        upsert_branches(&tx, branches, &[])
            .map_err(|e| map_sqlite_err("insert branches", e))?;
        tx.commit()
            .map_err(|e| map_sqlite_err("commit save new trans tx", e))?;
        Ok(())
    }

    fn change_global_status(
        &self,
        global: &mut GlobalTransaction,
        new_status: &str,
        updates: &[GlobalColumn],
    ) -> StoreResult<()> {
        let columns = GlobalColumn::status_assignments(updates);
        let mut next = global.clone();
        next.status = new_status.to_string();

        let sets: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| format!("{} = ?{}", column.column(), idx + 1))
            .collect();
        let n = columns.len();
        let sql = format!(
            "UPDATE {} SET {} WHERE gid = ?{} AND status = ?{}",
            GLOBAL_TABLE,
            sets.join(", "),
            n + 1,
            n + 2
        );
        let mut values: Vec<Value> = columns
            .iter()
            .map(|column| to_sql_value(column.value_of(&next)))
            .collect();
        values.push(Value::Text(global.gid.clone()));
        values.push(Value::Text(global.status.clone()));

        let conn = self.conn()?;
        let updated = conn
            .execute(&sql, params_from_iter(values))
            .map_err(|e| map_sqlite_err("change global status", e))?;
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
        global.update_time = now;
        global.next_cron_time = next_cron_time;
        global.next_cron_interval = next_cron_interval;

        let conn = self.conn()?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {}
                     SET next_cron_time_ms = ?1, update_time_ms = ?2, next_cron_interval = ?3
                     WHERE gid = ?4 AND status = ?5",
                    GLOBAL_TABLE
                ),
                params![
                    dt_to_ms(next_cron_time),
                    dt_to_ms(now),
                    next_cron_interval,
                    global.gid,
                    global.status
                ],
            )
            .map_err(|e| map_sqlite_err("touch cron time", e))?;
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
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_sqlite_err("begin claim global tx", e))?;
        let updated = tx
            .execute(
                &format!(
                    "UPDATE {t} SET owner = ?1, next_cron_time_ms = ?2
                     WHERE id = (
                       SELECT id FROM {t}
                       WHERE {pending} AND next_cron_time_ms < ?3
                       LIMIT 1
                     )",
                    t = GLOBAL_TABLE,
                    pending = pending_status_predicate()
                ),
                params![owner, dt_to_ms(next_cron_time), dt_to_ms(due_before)],
            )
            .map_err(|e| map_sqlite_err("claim global trans", e))?;
        if updated == 0 {
            return Ok(None);
        }
        let claimed = tx
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE owner = ?1",
                    GLOBAL_SELECT_COLUMNS, GLOBAL_TABLE
                ),
                params![owner],
                map_row_to_global,
            )
            .map_err(|e| map_sqlite_err("read claimed global trans", e))?;
        tx.commit()
            .map_err(|e| map_sqlite_err("commit claim global tx", e))?;
        Ok(Some(claimed))
    }

    fn reset_cron_time(
        &self,
        overdue_after: DateTime<Utc>,
        reset_to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<CronResetOutcome> {
        let pending = pending_status_predicate();
        let conn = self.conn()?;
        let fixed = conn
            .execute(
                &format!(
                    "UPDATE {t} SET next_cron_time_ms = ?1
                     WHERE id IN (
                       SELECT id FROM {t}
                       WHERE {pending} AND next_cron_time_ms > ?2
                       LIMIT ?3
                     )",
                    t = GLOBAL_TABLE,
                    pending = pending
                ),
                params![dt_to_ms(reset_to), dt_to_ms(overdue_after), sql_limit(limit)],
            )
            .map_err(|e| map_sqlite_err("reset cron time", e))? as u64;
        let mut has_more = false;
        if fixed == limit as u64 {
            let remaining: i64 = conn
                .query_row(
                    &format!(
                        "SELECT EXISTS(
                           SELECT 1 FROM {} WHERE {} AND next_cron_time_ms > ?1 LIMIT 1
                         )",
                        GLOBAL_TABLE, pending
                    ),
                    params![dt_to_ms(overdue_after)],
                    |r| r.get(0),
                )
                .map_err(|e| map_sqlite_err("probe overdue cron time", e))?;
            has_more = remaining != 0;
        }
        Ok(CronResetOutcome { fixed, has_more })
    }
}

fn schema_sql() -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {global} (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
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
          next_cron_interval INTEGER NOT NULL DEFAULT 0,
          next_cron_time_ms INTEGER NOT NULL,
          create_time_ms INTEGER NOT NULL,
          update_time_ms INTEGER NOT NULL,
          finish_time_ms INTEGER NULL,
          rollback_time_ms INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trans_global_status_cron ON {global}(status, next_cron_time_ms);
        CREATE INDEX IF NOT EXISTS idx_trans_global_owner ON {global}(owner);
        CREATE TABLE IF NOT EXISTS {branch} (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          gid TEXT NOT NULL,
          url TEXT NOT NULL DEFAULT '',
          bin_data BLOB NOT NULL,
          branch_id TEXT NOT NULL,
          op TEXT NOT NULL,
          status TEXT NOT NULL,
          create_time_ms INTEGER NOT NULL,
          update_time_ms INTEGER NOT NULL,
          finish_time_ms INTEGER NULL,
          rollback_time_ms INTEGER NULL,
          UNIQUE(gid, branch_id, op)
        );
        "#,
        global = GLOBAL_TABLE,
        branch = BRANCH_TABLE
    )
}

fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|idx| format!("?{}", idx))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_global(conn: &Connection, g: &GlobalTransaction) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(gid) DO NOTHING",
            GLOBAL_TABLE,
            GLOBAL_INSERT_COLUMNS,
            placeholders(17)
        ),
        params![
            g.gid,
            g.trans_type,
            g.status,
            g.query_prepared,
            g.protocol,
            g.options,
            g.custom_data,
            g.ext_data,
            g.result,
            g.rollback_reason,
            g.owner,
            g.next_cron_interval,
            dt_to_ms(g.next_cron_time),
            dt_to_ms(g.create_time),
            dt_to_ms(g.update_time),
            g.finish_time.map(dt_to_ms),
            g.rollback_time.map(dt_to_ms)
        ],
    )
}

fn upsert_branches(
    conn: &Connection,
    branches: &[BranchRecord],
    updates: &[BranchColumn],
) -> rusqlite::Result<usize> {
    if branches.is_empty() {
        return Ok(0);
    }
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
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(gid, branch_id, op) {}",
        BRANCH_TABLE,
        BRANCH_INSERT_COLUMNS,
        placeholders(10),
        on_conflict
    ))?;
    let mut affected = 0;
    for b in branches {
        affected += stmt.execute(params![
            b.gid,
            b.url,
            b.bin_data,
            b.branch_id,
            b.op,
            b.status,
            dt_to_ms(b.create_time),
            dt_to_ms(b.update_time),
            b.finish_time.map(dt_to_ms),
            b.rollback_time.map(dt_to_ms)
        ])?;
    }
    Ok(affected)
}

fn map_row_to_global(row: &rusqlite::Row<'_>) -> rusqlite::Result<GlobalTransaction> {
    Ok(GlobalTransaction {
        id: row.get(0)?,
        gid: row.get(1)?,
        trans_type: row.get(2)?,
        status: row.get(3)?,
        query_prepared: row.get(4)?,
        protocol: row.get(5)?,
        options: row.get(6)?,
        custom_data: row.get(7)?,
        ext_data: row.get(8)?,
        result: row.get(9)?,
        rollback_reason: row.get(10)?,
        owner: row.get(11)?,
        next_cron_interval: row.get(12)?,
        next_cron_time: ms_to_dt(row.get(13)?),
        create_time: ms_to_dt(row.get(14)?),
        update_time: ms_to_dt(row.get(15)?),
        finish_time: row.get::<_, Option<i64>>(16)?.map(ms_to_dt),
        rollback_time: row.get::<_, Option<i64>>(17)?.map(ms_to_dt),
    })
}

fn map_row_to_branch(row: &rusqlite::Row<'_>) -> rusqlite::Result<BranchRecord> {
    Ok(BranchRecord {
        id: row.get(0)?,
        gid: row.get(1)?,
        url: row.get(2)?,
        bin_data: row.get(3)?,
        branch_id: row.get(4)?,
        op: row.get(5)?,
        status: row.get(6)?,
        create_time: ms_to_dt(row.get(7)?),
        update_time: ms_to_dt(row.get(8)?),
        finish_time: row.get::<_, Option<i64>>(9)?.map(ms_to_dt),
        rollback_time: row.get::<_, Option<i64>>(10)?.map(ms_to_dt),
    })
}

fn to_sql_value(value: ColumnValue) -> Value {
    match value {
        ColumnValue::Integer(v) => Value::Integer(v),
        ColumnValue::NullableInteger(Some(v)) => Value::Integer(v),
        ColumnValue::NullableInteger(None) => Value::Null,
        ColumnValue::Text(v) => Value::Text(v),
        ColumnValue::Blob(v) => Value::Blob(v),
    }
}

fn map_sqlite_err(prefix: &str, err: rusqlite::Error) -> StoreError {
    StoreError::storage(prefix, err)
}
