//! Scan cursor for paging through global transactions by descending id.
//!
//! An empty cursor means "unbounded" before the first page and "end of data"
//! after a page came back short. The string form (empty or a decimal row id)
//! is what listing APIs hand back to their clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::RowId;
use crate::trans::GlobalTransaction;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    position: Option<RowId>,
}

impl ScanCursor {
    pub fn start() -> Self {
        Self::default()
    }

    /// Continue below `id` (exclusive).
    pub fn after(id: RowId) -> Self {
        Self { position: Some(id) }
    }

    pub fn position(&self) -> Option<RowId> {
        self.position
    }

    /// Exclusive upper bound for the next page.
    pub fn upper_bound(&self) -> RowId {
        self.position.unwrap_or(RowId::MAX)
    }

    /// True before the first page and after the last one.
    pub fn is_empty(&self) -> bool {
        self.position.is_none()
    }

    /// After a scan call: no further pages.
    pub fn is_exhausted(&self) -> bool {
        self.is_empty()
    }

    /// Move past `page`, which was read with `limit`.
    pub fn advance(&mut self, page: &[GlobalTransaction], limit: usize) {
        self.position = match page.last() {
            Some(last) if page.len() >= limit => Some(last.id),
            _ => None,
        };
    }
}

impl fmt::Display for ScanCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(id) => write!(f, "{id}"),
            None => Ok(()),
        }
    }
}

impl FromStr for ScanCursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::start());
        }
        trimmed
            .parse::<RowId>()
            .map(Self::after)
            .map_err(|e| format!("invalid scan position '{}': {}", s, e))
    }
}
