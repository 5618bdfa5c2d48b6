//! Resolved partitions: the independently processable slices of a target.

use serde::{Deserialize, Serialize};

/// Partition id for rows whose partitioning key is null.
pub const NULL_PARTITION_ID: &str = "__NULL__";

/// Partition id for rows whose range key falls outside the declared range.
pub const OUTSIDE_RANGE_PARTITION_ID: &str = "__UNPARTITIONED__";

/// A resolved unit of deletion scope.
///
/// `id == None` means the whole table. Special partitions can't be used as
/// a query destination and are always handled with in-place DML.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub condition: String,
    pub id: Option<String>,
    pub is_special: bool,
}

impl Partition {
    #[must_use]
    pub fn whole_table(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            id: None,
            is_special: false,
        }
    }

    #[must_use]
    pub fn new(condition: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            id: Some(id.into()),
            is_special: false,
        }
    }

    #[must_use]
    pub fn special(condition: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            id: Some(id.into()),
            is_special: true,
        }
    }

    #[must_use]
    pub fn is_whole_table(&self) -> bool {
        self.id.is_none()
    }
}

/// Returns `true` for the sentinel ids produced by the warehouse catalog.
#[must_use]
pub fn is_sentinel_id(id: &str) -> bool {
    id == NULL_PARTITION_ID || id == OUTSIDE_RANGE_PARTITION_ID
}
