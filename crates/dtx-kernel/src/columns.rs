//! Typed update columns and the persisted value representation.
//!
//! Status transitions and branch upserts name the columns they persist. The
//! column sets exclude identity columns (`id`, `gid`, `branch_id`, `op`) and
//! `create_time`, so no update can rewrite a record's identity.

use chrono::{DateTime, TimeZone, Utc};

use crate::trans::{BranchRecord, GlobalTransaction};

/// Backend-neutral persisted value. Timestamps are epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnValue {
    Integer(i64),
    NullableInteger(Option<i64>),
    Text(String),
    Blob(Vec<u8>),
}

/// Mutable columns of `trans_global`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GlobalColumn {
    TransType,
    Status,
    QueryPrepared,
    Protocol,
    Options,
    CustomData,
    ExtData,
    Result,
    RollbackReason,
    Owner,
    NextCronInterval,
    NextCronTime,
    UpdateTime,
    FinishTime,
    RollbackTime,
}

impl GlobalColumn {
    pub fn column(self) -> &'static str {
        match self {
            GlobalColumn::TransType => "trans_type",
            GlobalColumn::Status => "status",
            GlobalColumn::QueryPrepared => "query_prepared",
            GlobalColumn::Protocol => "protocol",
            GlobalColumn::Options => "options",
            GlobalColumn::CustomData => "custom_data",
            GlobalColumn::ExtData => "ext_data",
            GlobalColumn::Result => "result",
            GlobalColumn::RollbackReason => "rollback_reason",
            GlobalColumn::Owner => "owner",
            GlobalColumn::NextCronInterval => "next_cron_interval",
            GlobalColumn::NextCronTime => "next_cron_time_ms",
            GlobalColumn::UpdateTime => "update_time_ms",
            GlobalColumn::FinishTime => "finish_time_ms",
            GlobalColumn::RollbackTime => "rollback_time_ms",
        }
    }

    pub fn value_of(self, global: &GlobalTransaction) -> ColumnValue {
        match self {
            GlobalColumn::TransType => ColumnValue::Text(global.trans_type.clone()),
            GlobalColumn::Status => ColumnValue::Text(global.status.clone()),
            GlobalColumn::QueryPrepared => ColumnValue::Text(global.query_prepared.clone()),
            GlobalColumn::Protocol => ColumnValue::Text(global.protocol.clone()),
            GlobalColumn::Options => ColumnValue::Text(global.options.clone()),
            GlobalColumn::CustomData => ColumnValue::Text(global.custom_data.clone()),
            GlobalColumn::ExtData => ColumnValue::Text(global.ext_data.clone()),
            GlobalColumn::Result => ColumnValue::Text(global.result.clone()),
            GlobalColumn::RollbackReason => ColumnValue::Text(global.rollback_reason.clone()),
            GlobalColumn::Owner => ColumnValue::Text(global.owner.clone()),
            GlobalColumn::NextCronInterval => ColumnValue::Integer(global.next_cron_interval),
            GlobalColumn::NextCronTime => ColumnValue::Integer(dt_to_ms(global.next_cron_time)),
            GlobalColumn::UpdateTime => ColumnValue::Integer(dt_to_ms(global.update_time)),
            GlobalColumn::FinishTime => {
                ColumnValue::NullableInteger(global.finish_time.map(dt_to_ms))
            }
            GlobalColumn::RollbackTime => {
                ColumnValue::NullableInteger(global.rollback_time.map(dt_to_ms))
            }
        }
    }

    /// Columns written by a status transition: `status` first, then `updates`
    /// in caller order with duplicates removed.
    pub fn status_assignments(updates: &[GlobalColumn]) -> Vec<GlobalColumn> {
        let mut out = vec![GlobalColumn::Status];
        for column in updates {
            if !out.contains(column) {
                out.push(*column);
            }
        }
        out
    }
}

/// Mutable columns of `trans_branch_op`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BranchColumn {
    Url,
    BinData,
    Status,
    UpdateTime,
    FinishTime,
    RollbackTime,
}

impl BranchColumn {
    /// Every mutable branch column; used when a locked append saves branches.
    pub const ALL: [BranchColumn; 6] = [
        BranchColumn::Url,
        BranchColumn::BinData,
        BranchColumn::Status,
        BranchColumn::UpdateTime,
        BranchColumn::FinishTime,
        BranchColumn::RollbackTime,
    ];

    pub fn column(self) -> &'static str {
        match self {
            BranchColumn::Url => "url",
            BranchColumn::BinData => "bin_data",
            BranchColumn::Status => "status",
            BranchColumn::UpdateTime => "update_time_ms",
            BranchColumn::FinishTime => "finish_time_ms",
            BranchColumn::RollbackTime => "rollback_time_ms",
        }
    }

    pub fn value_of(self, branch: &BranchRecord) -> ColumnValue {
        match self {
            BranchColumn::Url => ColumnValue::Text(branch.url.clone()),
            BranchColumn::BinData => ColumnValue::Blob(branch.bin_data.clone()),
            BranchColumn::Status => ColumnValue::Text(branch.status.clone()),
            BranchColumn::UpdateTime => ColumnValue::Integer(dt_to_ms(branch.update_time)),
            BranchColumn::FinishTime => {
                ColumnValue::NullableInteger(branch.finish_time.map(dt_to_ms))
            }
            BranchColumn::RollbackTime => {
                ColumnValue::NullableInteger(branch.rollback_time.map(dt_to_ms))
            }
        }
    }

    /// `updates` with duplicates removed, caller order kept.
    pub fn dedup(updates: &[BranchColumn]) -> Vec<BranchColumn> {
        let mut out: Vec<BranchColumn> = Vec::with_capacity(updates.len());
        for column in updates {
            if !out.contains(column) {
                out.push(*column);
            }
        }
        out
    }
}

pub fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}
