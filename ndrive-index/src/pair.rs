//! Pair records and the `(local_state, remote_state) -> pair_state` table.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use std::fmt;
use std::str::FromStr;

use crate::errors::{Result, StoreError};

/// State of one side of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideState {
    Unknown,
    Created,
    Modified,
    Moved,
    Deleted,
    Synchronized,
    Resolved,
    Unsynchronized,
}

impl SideState {
    pub const ALL: [SideState; 8] = [
        SideState::Unknown,
        SideState::Created,
        SideState::Modified,
        SideState::Moved,
        SideState::Deleted,
        SideState::Synchronized,
        SideState::Resolved,
        SideState::Unsynchronized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SideState::Unknown => "unknown",
            SideState::Created => "created",
            SideState::Modified => "modified",
            SideState::Moved => "moved",
            SideState::Deleted => "deleted",
            SideState::Synchronized => "synchronized",
            SideState::Resolved => "resolved",
            SideState::Unsynchronized => "unsynchronized",
        }
    }
}

/// Derived state of a pair; drives processor dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairState {
    Unknown,
    Synchronized,
    LocallyCreated,
    RemotelyCreated,
    LocallyModified,
    RemotelyModified,
    LocallyMoved,
    LocallyMovedCreated,
    LocallyMovedRemotelyModified,
    LocallyDeleted,
    RemotelyDeleted,
    Deleted,
    Conflicted,
    LocallyResolved,
    UnknownDeleted,
    DeletedUnknown,
    Unsynchronized,
    ParentLocallyDeleted,
    ParentRemotelyDeleted,
}

impl PairState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairState::Unknown => "unknown",
            PairState::Synchronized => "synchronized",
            PairState::LocallyCreated => "locally_created",
            PairState::RemotelyCreated => "remotely_created",
            PairState::LocallyModified => "locally_modified",
            PairState::RemotelyModified => "remotely_modified",
            PairState::LocallyMoved => "locally_moved",
            PairState::LocallyMovedCreated => "locally_moved_created",
            PairState::LocallyMovedRemotelyModified => "locally_moved_remotely_modified",
            PairState::LocallyDeleted => "locally_deleted",
            PairState::RemotelyDeleted => "remotely_deleted",
            PairState::Deleted => "deleted",
            PairState::Conflicted => "conflicted",
            PairState::LocallyResolved => "locally_resolved",
            PairState::UnknownDeleted => "unknown_deleted",
            PairState::DeletedUnknown => "deleted_unknown",
            PairState::Unsynchronized => "unsynchronized",
            PairState::ParentLocallyDeleted => "parent_locally_deleted",
            PairState::ParentRemotelyDeleted => "parent_remotely_deleted",
        }
    }

    /// Whether a pair in this state still has work to do.
    pub fn needs_sync(&self) -> bool {
        !matches!(self, PairState::Synchronized | PairState::Unsynchronized)
    }

    /// Descendant markers set by a folder deletion; never processed on their own.
    pub fn is_parent_deleted(&self) -> bool {
        matches!(
            self,
            PairState::ParentLocallyDeleted | PairState::ParentRemotelyDeleted
        )
    }
}

/// Look up the pair state of a `(local, remote)` combination.
pub fn derive_pair_state(local: SideState, remote: SideState) -> Option<PairState> {
    use PairState as P;
    use SideState as S;
    let state = match (local, remote) {
        (S::Unknown, S::Unknown) => P::Unknown,
        (S::Synchronized, S::Synchronized) => P::Synchronized,
        (S::Created, S::Unknown) => P::LocallyCreated,
        (S::Unknown, S::Created) => P::RemotelyCreated,
        (S::Modified, S::Synchronized) => P::LocallyModified,
        (S::Moved, S::Synchronized) => P::LocallyMoved,
        (S::Moved, S::Deleted) => P::LocallyMovedCreated,
        (S::Moved, S::Modified) => P::LocallyMovedRemotelyModified,
        (S::Synchronized, S::Modified) => P::RemotelyModified,
        (S::Modified, S::Unknown) => P::LocallyModified,
        (S::Unknown, S::Modified) => P::RemotelyModified,
        (S::Deleted, S::Synchronized) => P::LocallyDeleted,
        (S::Synchronized, S::Deleted) => P::RemotelyDeleted,
        (S::Deleted, S::Deleted) => P::Deleted,
        (S::Synchronized, S::Unknown) => P::Synchronized,
        // Automatically resolved
        (S::Created, S::Deleted) => P::LocallyCreated,
        (S::Deleted, S::Created) => P::RemotelyCreated,
        (S::Modified, S::Deleted) => P::RemotelyDeleted,
        (S::Deleted, S::Modified) => P::RemotelyCreated,
        // Manual resolution
        (S::Modified, S::Created)
        | (S::Modified, S::Modified)
        | (S::Created, S::Created)
        | (S::Created, S::Modified)
        | (S::Moved, S::Unknown)
        | (S::Moved, S::Moved)
        | (S::Moved, S::Created)
        | (S::Resolved, S::Modified) => P::Conflicted,
        // Manually resolved
        (S::Resolved, S::Unknown) => P::LocallyResolved,
        (S::Resolved, S::Synchronized) | (S::Created, S::Synchronized) | (S::Unknown, S::Synchronized) => {
            P::Synchronized
        }
        // Inconsistent
        (S::Unknown, S::Deleted) => P::UnknownDeleted,
        (S::Deleted, S::Unknown) => P::DeletedUnknown,
        // Ignored documents
        (S::Unsynchronized, S::Deleted) => P::RemotelyDeleted,
        (S::Unsynchronized, S::Unknown)
        | (S::Unsynchronized, S::Created)
        | (S::Unsynchronized, S::Modified)
        | (S::Unsynchronized, S::Moved)
        | (S::Unsynchronized, S::Synchronized) => P::Unsynchronized,
        _ => return None,
    };
    Some(state)
}

/// Like [`derive_pair_state`] but an unlisted combination is an error.
pub fn pair_state_of(local: SideState, remote: SideState) -> Result<PairState> {
    derive_pair_state(local, remote).ok_or_else(|| StoreError::UnknownPairState {
        local: local.as_str().to_string(),
        remote: remote.as_str().to_string(),
    })
}

/// Direction of the last content transfer of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Upload,
    Download,
}

impl Transfer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transfer::Upload => "upload",
            Transfer::Download => "download",
        }
    }
}

macro_rules! sql_text_enum {
    ($ty:ty, [$($variant:expr),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| format!("invalid {}: {:?}", stringify!($ty), s))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse().map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

sql_text_enum!(SideState, [
    SideState::Unknown,
    SideState::Created,
    SideState::Modified,
    SideState::Moved,
    SideState::Deleted,
    SideState::Synchronized,
    SideState::Resolved,
    SideState::Unsynchronized,
]);

sql_text_enum!(PairState, [
    PairState::Unknown,
    PairState::Synchronized,
    PairState::LocallyCreated,
    PairState::RemotelyCreated,
    PairState::LocallyModified,
    PairState::RemotelyModified,
    PairState::LocallyMoved,
    PairState::LocallyMovedCreated,
    PairState::LocallyMovedRemotelyModified,
    PairState::LocallyDeleted,
    PairState::RemotelyDeleted,
    PairState::Deleted,
    PairState::Conflicted,
    PairState::LocallyResolved,
    PairState::UnknownDeleted,
    PairState::DeletedUnknown,
    PairState::Unsynchronized,
    PairState::ParentLocallyDeleted,
    PairState::ParentRemotelyDeleted,
]);

sql_text_enum!(Transfer, [Transfer::Upload, Transfer::Download]);

/// One row of the `States` table.
#[derive(Debug, Clone, PartialEq)]
pub struct DocPair {
    pub id: i64,
    pub last_local_updated: Option<DateTime<Utc>>,
    pub last_remote_updated: Option<DateTime<Utc>>,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,
    pub local_path: String,
    pub remote_ref: Option<String>,
    pub local_parent_path: String,
    pub remote_parent_ref: Option<String>,
    pub remote_parent_path: Option<String>,
    pub local_name: Option<String>,
    pub remote_name: Option<String>,
    pub size: u64,
    pub folderish: bool,
    pub local_state: SideState,
    pub remote_state: SideState,
    pub pair_state: PairState,
    pub remote_can_rename: bool,
    pub remote_can_delete: bool,
    pub remote_can_update: bool,
    pub remote_can_create_child: bool,
    pub last_remote_modifier: Option<String>,
    pub last_sync_date: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_sync_error_date: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_details: Option<String>,
    pub version: i64,
    pub processor: i64,
    pub last_transfer: Option<Transfer>,
    pub creation_date: Option<DateTime<Utc>>,
}

impl DocPair {
    pub(crate) const COLUMNS: &'static str = "id, last_local_updated, last_remote_updated, \
        local_digest, remote_digest, local_path, remote_ref, local_parent_path, \
        remote_parent_ref, remote_parent_path, local_name, remote_name, size, folderish, \
        local_state, remote_state, pair_state, remote_can_rename, remote_can_delete, \
        remote_can_update, remote_can_create_child, last_remote_modifier, last_sync_date, \
        error_count, last_sync_error_date, last_error, last_error_details, version, \
        processor, last_transfer, creation_date";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(DocPair {
            id: row.get(0)?,
            last_local_updated: row.get(1)?,
            last_remote_updated: row.get(2)?,
            local_digest: row.get(3)?,
            remote_digest: row.get(4)?,
            local_path: row.get(5)?,
            remote_ref: row.get(6)?,
            local_parent_path: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            remote_parent_ref: row.get(8)?,
            remote_parent_path: row.get(9)?,
            local_name: row.get(10)?,
            remote_name: row.get(11)?,
            size: row.get::<_, Option<i64>>(12)?.unwrap_or(0).max(0) as u64,
            folderish: row.get::<_, Option<bool>>(13)?.unwrap_or(false),
            local_state: row.get(14)?,
            remote_state: row.get(15)?,
            pair_state: row.get(16)?,
            remote_can_rename: row.get::<_, Option<bool>>(17)?.unwrap_or(false),
            remote_can_delete: row.get::<_, Option<bool>>(18)?.unwrap_or(false),
            remote_can_update: row.get::<_, Option<bool>>(19)?.unwrap_or(false),
            remote_can_create_child: row.get::<_, Option<bool>>(20)?.unwrap_or(false),
            last_remote_modifier: row.get(21)?,
            last_sync_date: row.get(22)?,
            error_count: row.get::<_, Option<u32>>(23)?.unwrap_or(0),
            last_sync_error_date: row.get(24)?,
            last_error: row.get(25)?,
            last_error_details: row.get(26)?,
            version: row.get::<_, Option<i64>>(27)?.unwrap_or(0),
            processor: row.get::<_, Option<i64>>(28)?.unwrap_or(0),
            last_transfer: row.get(29)?,
            creation_date: row.get(30)?,
        })
    }

    /// Pair state recomputed from the two side states.
    pub fn derived_state(&self) -> Result<PairState> {
        pair_state_of(self.local_state, self.remote_state)
    }

    /// Whether the server refuses changes on this pair.
    pub fn is_readonly(&self) -> bool {
        if self.folderish {
            !self.remote_can_create_child
        } else {
            !self.remote_can_update
        }
    }

    /// Remote path of this pair as its children see it.
    pub fn remote_path(&self) -> String {
        format!(
            "{}/{}",
            self.remote_parent_path.as_deref().unwrap_or_default(),
            self.remote_ref.as_deref().unwrap_or_default()
        )
    }

    pub fn name(&self) -> &str {
        self.local_name
            .as_deref()
            .or(self.remote_name.as_deref())
            .unwrap_or_default()
    }
}

impl fmt::Display for DocPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<DocPair[{}] local_path={:?}, remote_ref={:?}, local_state={}, remote_state={}, pair_state={}>",
            self.id,
            self.local_path,
            self.remote_ref.as_deref().unwrap_or_default(),
            self.local_state,
            self.remote_state,
            self.pair_state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_table_samples() {
        use PairState as P;
        use SideState as S;
        assert_eq!(derive_pair_state(S::Created, S::Unknown), Some(P::LocallyCreated));
        assert_eq!(derive_pair_state(S::Moved, S::Synchronized), Some(P::LocallyMoved));
        assert_eq!(derive_pair_state(S::Modified, S::Deleted), Some(P::RemotelyDeleted));
        assert_eq!(derive_pair_state(S::Deleted, S::Modified), Some(P::RemotelyCreated));
        assert_eq!(derive_pair_state(S::Created, S::Created), Some(P::Conflicted));
        assert_eq!(derive_pair_state(S::Unsynchronized, S::Deleted), Some(P::RemotelyDeleted));
        assert_eq!(derive_pair_state(S::Synchronized, S::Moved), None);
        assert!(pair_state_of(S::Resolved, S::Deleted).is_err());
    }

    #[test]
    fn test_text_round_trip() {
        assert_eq!("locally_moved_created".parse::<PairState>(), Ok(PairState::LocallyMovedCreated));
        assert_eq!(PairState::ParentRemotelyDeleted.to_string(), "parent_remotely_deleted");
        assert!("bogus".parse::<SideState>().is_err());
    }

    fn side_state() -> impl Strategy<Value = SideState> {
        proptest::sample::select(SideState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn unsynchronized_local_never_needs_upload(remote in side_state()) {
            if let Some(state) = derive_pair_state(SideState::Unsynchronized, remote) {
                prop_assert!(matches!(state, PairState::Unsynchronized | PairState::RemotelyDeleted));
            }
        }

        #[test]
        fn synchronized_only_without_pending_side(local in side_state(), remote in side_state()) {
            if derive_pair_state(local, remote) == Some(PairState::Synchronized) {
                prop_assert!(!matches!(local, SideState::Modified | SideState::Moved | SideState::Deleted));
                prop_assert!(!matches!(remote, SideState::Modified | SideState::Deleted | SideState::Created | SideState::Moved));
            }
        }

        #[test]
        fn derived_states_are_never_parent_markers(local in side_state(), remote in side_state()) {
            if let Some(state) = derive_pair_state(local, remote) {
                prop_assert!(!state.is_parent_deleted());
            }
        }
    }
}
