//! State transitions of pairs.

use chrono::Utc;
use rusqlite::types::ToSql;
use rusqlite::{named_params, params, Connection};
use tracing::{debug, warn};

use ndrive_client::names::{basename, child_path, parent_path, ROOT, UNACCESSIBLE_HASH};
use ndrive_client::{LocalFileInfo, RemoteFileInfo};

use super::{
    char_len, path_prefix, select_pair, PairStateStore, LOCAL_DESCENDANTS, REMOTE_DESCENDANTS,
};
use crate::errors::{Result, StoreError};
use crate::pair::{derive_pair_state, DocPair, PairState, SideState, Transfer};

/// Options of [`PairStateStore::update_remote_state`].
#[derive(Debug, Clone, Copy)]
pub struct RemoteUpdate {
    /// Bump the pair version
    pub versioned: bool,
    /// Hand the pair to the queue afterwards
    pub queue: bool,
    /// Write even when nothing observable changed
    pub force: bool,
    /// Keep the stored remote digest
    pub no_digest: bool,
}

impl Default for RemoteUpdate {
    fn default() -> Self {
        Self {
            versioned: true,
            queue: true,
            force: false,
            no_digest: false,
        }
    }
}

impl RemoteUpdate {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn unversioned() -> Self {
        Self {
            versioned: false,
            ..Self::default()
        }
    }
}

/// Named parameters selecting the subtree below a folder pair.
pub(crate) struct Subtree {
    lpath: String,
    lprefix: String,
    lprefix_len: i64,
    rpath: Option<String>,
    rpath_len: i64,
    rprefix: Option<String>,
    rprefix_len: i64,
}

impl Subtree {
    pub(crate) fn of(pair: &DocPair) -> Self {
        let lprefix = path_prefix(&pair.local_path);
        let rpath = pair.remote_ref.as_ref().map(|_| pair.remote_path());
        let rprefix = rpath.as_deref().map(path_prefix);
        Self {
            lpath: pair.local_path.clone(),
            lprefix_len: char_len(&lprefix),
            lprefix,
            rpath_len: rpath.as_deref().map(char_len).unwrap_or(0),
            rpath,
            rprefix_len: rprefix.as_deref().map(char_len).unwrap_or(0),
            rprefix,
        }
    }

    /// Parameters of [`LOCAL_DESCENDANTS`]
    pub(crate) fn local(&self) -> Vec<(&str, &dyn ToSql)> {
        vec![
            (":lpath", &self.lpath as &dyn ToSql),
            (":lprefix", &self.lprefix as &dyn ToSql),
            (":lprefix_len", &self.lprefix_len as &dyn ToSql),
            (":rpath", &self.rpath as &dyn ToSql),
            (":rpath_len", &self.rpath_len as &dyn ToSql),
        ]
    }

    /// Parameters of [`REMOTE_DESCENDANTS`]; a pair never bound remotely has none.
    pub(crate) fn remote(&self) -> Vec<(&str, &dyn ToSql)> {
        vec![
            (":rpath", &self.rpath as &dyn ToSql),
            (":rprefix", &self.rprefix as &dyn ToSql),
            (":rprefix_len", &self.rprefix_len as &dyn ToSql),
        ]
    }

    pub(crate) fn remote_path(&self) -> Option<&str> {
        self.rpath.as_deref()
    }

    pub(crate) fn local_path(&self) -> &str {
        &self.lpath
    }
}

/// Pair state of the row's sides; unlisted combinations fall back to
/// `unknown` and wait for the next full scan.
fn resolve_pair_state(local: SideState, remote: SideState, id: i64) -> PairState {
    derive_pair_state(local, remote).unwrap_or_else(|| {
        warn!(
            "Inconsistent states ({}, {}) on pair {}, left for the next scan",
            local, remote, id
        );
        PairState::Unknown
    })
}

fn pair_by_remote_ref(conn: &Connection, remote_ref: Option<&str>) -> Result<Option<DocPair>> {
    match remote_ref {
        Some(r) => select_pair(conn, "remote_ref = ?1", params![r]),
        None => Ok(None),
    }
}

fn pair_by_local_path(conn: &Connection, path: &str) -> Result<Option<DocPair>> {
    select_pair(conn, "local_path = ?1", params![path])
}

impl PairStateStore {
    /// Take ownership of a pair for `thread_id`; true when it was free or already ours.
    pub fn acquire_processor(&self, thread_id: i64, row_id: i64) -> Result<bool> {
        self.write(|conn| {
            let updated = conn.execute(
                "UPDATE States SET processor = ?1 WHERE id = ?2 AND processor IN (0, ?1)",
                params![thread_id, row_id],
            )?;
            Ok(updated == 1)
        })
    }

    /// Acquire a pair and read it back through the writer.
    pub fn acquire_state(&self, thread_id: i64, row_id: i64) -> Result<Option<DocPair>> {
        if !self.acquire_processor(thread_id, row_id)? {
            debug!("Cannot acquire pair {} for processor {}", row_id, thread_id);
            return Ok(None);
        }
        match self.write(|conn| select_pair(conn, "id = ?1", params![row_id])) {
            Ok(pair) => Ok(pair),
            Err(e) => {
                self.release_state(thread_id)?;
                Err(e)
            }
        }
    }

    pub fn release_state(&self, thread_id: i64) -> Result<()> {
        self.release_processor(thread_id).map(|_| ())
    }

    /// Free every pair held by `processor_id`.
    pub fn release_processor(&self, processor_id: i64) -> Result<bool> {
        self.write(|conn| {
            let released = conn.execute(
                "UPDATE States SET processor = 0 WHERE processor = ?1",
                params![processor_id],
            )?;
            if released > 0 {
                debug!("Released processor {}", processor_id);
            }
            Ok(released > 0)
        })
    }

    /// Record a new local item; `parent_path` is `None` for items whose
    /// parent is not tracked yet.
    pub fn insert_local_state(&self, info: &LocalFileInfo, parent_path: Option<&str>) -> Result<i64> {
        let digest = if info.folderish {
            None
        } else if info.size >= self.config.big_file_bytes {
            Some(UNACCESSIBLE_HASH.to_string())
        } else {
            info.get_digest(self.config.digest_algorithm, None)
                .unwrap_or_else(|e| {
                    warn!("Cannot compute digest of {:?}: {}", info.path, e);
                    Some(UNACCESSIBLE_HASH.to_string())
                })
        };
        let local_parent = parent_path
            .map(str::to_string)
            .unwrap_or_else(|| self::parent_path(&info.path));

        let (id, queue) = self.write(|conn| {
            conn.execute(
                "INSERT INTO States (last_local_updated, local_digest, local_path,
                    local_parent_path, local_name, folderish, size,
                    local_state, remote_state, pair_state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'created', 'unknown', 'locally_created')",
                params![
                    info.last_modification_time,
                    digest,
                    info.path,
                    local_parent,
                    info.name,
                    info.folderish,
                    info.size as i64
                ],
            )?;
            let id = conn.last_insert_rowid();
            let queue = match parent_path {
                None => true,
                Some(p) => pair_by_local_path(conn, p)?
                    .map_or(false, |parent| parent.pair_state != PairState::LocallyCreated),
            };
            Ok((id, queue))
        })?;

        debug!("Inserted local state {} for {:?}", id, info.path);
        if queue {
            self.queue_pair(id, info.folderish, PairState::LocallyCreated);
        }
        Ok(id)
    }

    /// Write the local side of `row` (with its current states) from `info`.
    pub fn update_local_state(
        &self,
        row: &DocPair,
        info: &LocalFileInfo,
        versioned: bool,
        queue: bool,
    ) -> Result<PairState> {
        let pair_state = resolve_pair_state(row.local_state, row.remote_state, row.id);
        let local_parent = parent_path(&info.path);
        let version = if versioned { ", version = version + 1" } else { "" };

        let parent = self.write(|conn| {
            conn.execute(
                &format!(
                    "UPDATE States
                        SET last_local_updated = :mtime, local_digest = :digest,
                            local_path = :path, local_parent_path = :parent,
                            local_name = :name, local_state = :local_state, size = :size,
                            remote_state = :remote_state, pair_state = :pair_state{}
                      WHERE id = :id",
                    version
                ),
                named_params! {
                    ":mtime": info.last_modification_time,
                    ":digest": row.local_digest,
                    ":path": info.path,
                    ":parent": local_parent,
                    ":name": info.name,
                    ":local_state": row.local_state,
                    ":size": info.size as i64,
                    ":remote_state": row.remote_state,
                    ":pair_state": pair_state,
                    ":id": row.id,
                },
            )?;
            pair_by_local_path(conn, &local_parent)
        })?;

        if queue && parent.map_or(true, |p| p.local_state != SideState::Created) {
            self.queue_pair(row.id, row.folderish, pair_state);
        }
        Ok(pair_state)
    }

    pub fn update_local_modification_time(&self, row: &DocPair, info: &LocalFileInfo) -> Result<()> {
        self.write(|conn| {
            conn.execute(
                "UPDATE States SET last_local_updated = ?1 WHERE id = ?2",
                params![info.last_modification_time, row.id],
            )?;
            Ok(())
        })
    }

    /// Record a new remote item. A pair already bound to the same remote
    /// item makes this a no-op returning `None`.
    pub fn insert_remote_state(
        &self,
        info: &RemoteFileInfo,
        remote_parent_path: &str,
        local_path: &str,
        local_parent_path: &str,
    ) -> Result<Option<i64>> {
        let inserted = self.write(|conn| {
            conn.execute(
                "INSERT INTO States (remote_ref, remote_parent_ref, remote_parent_path,
                    remote_name, last_remote_updated, remote_can_rename, remote_can_delete,
                    remote_can_update, remote_can_create_child, last_remote_modifier,
                    remote_digest, folderish, local_path, local_parent_path,
                    remote_state, local_state, pair_state, local_name, creation_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                    'created', 'unknown', 'remotely_created', ?15, ?16)",
                params![
                    info.uid,
                    info.parent_uid,
                    remote_parent_path,
                    info.name,
                    info.last_modification_time,
                    info.can_rename,
                    info.can_delete,
                    info.can_update,
                    info.can_create_child,
                    info.last_contributor,
                    info.digest,
                    info.folderish,
                    local_path,
                    local_parent_path,
                    info.name,
                    info.creation_time
                ],
            )?;
            let id = conn.last_insert_rowid();
            let parent = pair_by_remote_ref(conn, info.parent_uid.as_deref())?;
            let queue = match parent {
                None => local_parent_path == ROOT,
                Some(p) => p.pair_state != PairState::RemotelyCreated,
            };
            Ok((id, queue))
        });

        match inserted {
            Ok((id, queue)) => {
                debug!("Inserted remote state {} for {:?}", id, info.uid);
                if queue {
                    self.queue_pair(id, info.folderish, PairState::RemotelyCreated);
                }
                Ok(Some(id))
            }
            Err(StoreError::DuplicatePair(e)) => {
                debug!("Remote item {} already tracked: {}", info.uid, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Merge remote `info` into `row`. Returns false when nothing changed
    /// and the write was skipped.
    pub fn update_remote_state(
        &self,
        row: &DocPair,
        info: &RemoteFileInfo,
        remote_parent_path: Option<&str>,
        options: RemoteUpdate,
    ) -> Result<bool> {
        let mut remote_state = row.remote_state;
        let mut pair_state = resolve_pair_state(row.local_state, remote_state, row.id);
        let remote_parent_path = remote_parent_path
            .map(str::to_string)
            .or_else(|| row.remote_parent_path.clone());

        let unchanged = row.remote_ref.as_deref() == Some(info.uid.as_str())
            && row.remote_parent_ref == info.parent_uid
            && row.remote_parent_path == remote_parent_path
            && row.remote_name.as_deref() == Some(info.name.as_str())
            && row.remote_can_rename == info.can_rename
            && row.remote_can_delete == info.can_delete
            && row.remote_can_update == info.can_update
            && row.remote_can_create_child == info.can_create_child;
        if unchanged && basename(&row.local_path) == info.name {
            if info.digest == row.local_digest || info.digest == row.remote_digest {
                remote_state = SideState::Synchronized;
                pair_state = resolve_pair_state(row.local_state, remote_state, row.id);
            }
            if info.digest == row.remote_digest && !options.force {
                debug!("Not updating remote state (not dirty) for {}", row);
                return Ok(false);
            }
        }

        if !matches!(pair_state, PairState::Conflicted | PairState::RemotelyCreated)
            && row.folderish
            && row.local_name.as_deref().map_or(false, |n| n != info.name)
            && row.local_state != SideState::Resolved
        {
            remote_state = SideState::Modified;
            pair_state = resolve_pair_state(row.local_state, remote_state, row.id);
        }

        debug!(
            "Updating remote state for {} (force={}) to {}",
            row, options.force, pair_state
        );
        let digest = if options.no_digest { None } else { info.digest.clone() };
        let mut sql = String::from(
            "UPDATE States
                SET remote_ref = :ref, remote_parent_ref = :parent_ref,
                    remote_parent_path = :parent_path, remote_name = :name,
                    last_remote_updated = :updated, remote_can_rename = :can_rename,
                    remote_can_delete = :can_delete, remote_can_update = :can_update,
                    remote_can_create_child = :can_create_child,
                    last_remote_modifier = :modifier, local_state = :local_state,
                    remote_state = :remote_state, pair_state = :pair_state,
                    remote_digest = coalesce(:digest, remote_digest)",
        );
        if options.versioned {
            sql.push_str(", version = version + 1");
        }
        sql.push_str(" WHERE id = :id");

        let parent = self.write(|conn| {
            conn.execute(
                &sql,
                named_params! {
                    ":ref": info.uid,
                    ":parent_ref": info.parent_uid,
                    ":parent_path": remote_parent_path,
                    ":name": info.name,
                    ":updated": info.last_modification_time,
                    ":can_rename": info.can_rename,
                    ":can_delete": info.can_delete,
                    ":can_update": info.can_update,
                    ":can_create_child": info.can_create_child,
                    ":modifier": info.last_contributor,
                    ":local_state": row.local_state,
                    ":remote_state": remote_state,
                    ":pair_state": pair_state,
                    ":digest": digest,
                    ":id": row.id,
                },
            )?;
            pair_by_remote_ref(conn, info.parent_uid.as_deref())
        })?;

        if options.queue && parent.map_or(true, |p| p.pair_state != PairState::RemotelyCreated) {
            self.queue_pair(row.id, row.folderish, pair_state);
        }
        Ok(true)
    }

    /// The remote item is gone; its descendants are left to the parent's deletion.
    pub fn delete_remote_state(&self, pair: &DocPair) -> Result<()> {
        let subtree = Subtree::of(pair);
        self.write(|conn| {
            conn.execute(
                "UPDATE States SET remote_state = 'deleted', pair_state = 'remotely_deleted'
                  WHERE id = ?1",
                params![pair.id],
            )?;
            if pair.folderish {
                conn.execute(
                    &format!(
                        "UPDATE States SET remote_state = 'deleted',
                                pair_state = 'parent_remotely_deleted'
                          WHERE {}",
                        REMOTE_DESCENDANTS
                    ),
                    subtree.remote().as_slice(),
                )?;
            }
            Ok(())
        })?;
        self.queue_pair(pair.id, pair.folderish, PairState::RemotelyDeleted);
        Ok(())
    }

    /// The local item is gone; processors under it are interrupted.
    pub fn delete_local_state(&self, pair: &DocPair) -> Result<()> {
        let subtree = Subtree::of(pair);
        let result = self.write(|conn| {
            conn.execute(
                "UPDATE States SET local_state = 'deleted', pair_state = 'locally_deleted'
                  WHERE id = ?1",
                params![pair.id],
            )?;
            if pair.folderish {
                conn.execute(
                    &format!(
                        "UPDATE States SET local_state = 'deleted',
                                pair_state = 'parent_locally_deleted'
                          WHERE {}",
                        LOCAL_DESCENDANTS
                    ),
                    subtree.local().as_slice(),
                )?;
            }
            Ok(())
        });
        self.interrupt_processors_on(&pair.local_path, false);
        self.queue_pair(pair.id, pair.folderish, PairState::LocallyDeleted);
        result
    }

    /// Mark `row` synchronized if its version is still `version` (defaults
    /// to the row's). Folders fall back to matching on their identity.
    pub fn synchronize_state(
        &self,
        row: &DocPair,
        version: Option<i64>,
        dynamic_states: bool,
    ) -> Result<bool> {
        let version = version.unwrap_or(row.version);
        let (local_state, remote_state) = if dynamic_states {
            (row.local_state, row.remote_state)
        } else {
            (SideState::Synchronized, SideState::Synchronized)
        };
        let pair_state = resolve_pair_state(local_state, remote_state, row.id);
        let now = Utc::now();

        let synced = self.write(|conn| {
            let mut updated = conn.execute(
                "UPDATE States
                    SET local_state = ?1, remote_state = ?2, pair_state = ?3,
                        local_digest = ?4, last_sync_date = ?5, processor = 0,
                        last_error = NULL, last_error_details = NULL, error_count = 0,
                        last_sync_error_date = NULL, version = version + 1
                  WHERE id = ?6 AND version = ?7",
                params![local_state, remote_state, pair_state, row.local_digest, now, row.id, version],
            )?;
            if updated != 1 && row.folderish {
                updated = conn.execute(
                    "UPDATE States
                        SET local_state = ?1, remote_state = ?2, pair_state = ?3,
                            last_sync_date = ?4, processor = 0, last_error = NULL,
                            error_count = 0, last_sync_error_date = NULL,
                            version = version + 1
                      WHERE id = ?5 AND local_path = ?6 AND remote_name IS ?7
                        AND remote_ref IS ?8 AND remote_parent_ref IS ?9",
                    params![
                        local_state,
                        remote_state,
                        pair_state,
                        now,
                        row.id,
                        row.local_path,
                        row.remote_name,
                        row.remote_ref,
                        row.remote_parent_ref
                    ],
                )?;
            }
            Ok(updated == 1)
        })?;

        if !synced {
            debug!("Was not able to synchronize state {} (version={})", row, version);
        } else if row.folderish {
            self.queue_children(row)?;
        }
        Ok(synced)
    }

    /// Queue the children of a folder that just got synchronized.
    pub fn queue_children(&self, row: &DocPair) -> Result<()> {
        let children = self.write(|conn| {
            super::select_pairs(
                conn,
                "remote_parent_ref = ?1
                 OR (local_parent_path = ?2
                     AND pair_state NOT IN ('synchronized', 'unsynchronized'))",
                params![row.remote_ref, row.local_path],
            )
        })?;
        if !children.is_empty() {
            debug!("Queuing {} children of {}", children.len(), row);
        }
        for child in children {
            self.queue_pair(child.id, child.folderish, child.pair_state);
        }
        Ok(())
    }

    fn force_sync(
        &self,
        row: &DocPair,
        local: SideState,
        remote: SideState,
        pair: PairState,
    ) -> Result<bool> {
        let updated = self.write(|conn| {
            Ok(conn.execute(
                "UPDATE States
                    SET local_state = ?1, remote_state = ?2, pair_state = ?3,
                        last_error = NULL, last_sync_error_date = NULL, error_count = 0
                  WHERE id = ?4 AND version = ?5",
                params![local, remote, pair, row.id, row.version],
            )?)
        })?;
        self.queue_pair(row.id, row.folderish, pair);
        Ok(updated == 1)
    }

    /// Resolve a conflict by taking the remote version.
    pub fn force_remote(&self, row: &DocPair) -> Result<bool> {
        self.force_sync(
            row,
            SideState::Synchronized,
            SideState::Modified,
            PairState::RemotelyModified,
        )
    }

    pub fn force_remote_creation(&self, row: &DocPair) -> Result<bool> {
        self.force_sync(
            row,
            SideState::Unknown,
            SideState::Created,
            PairState::RemotelyCreated,
        )
    }

    /// Resolve a conflict by taking the local version.
    pub fn force_local(&self, row: &DocPair) -> Result<bool> {
        self.force_sync(
            row,
            SideState::Resolved,
            SideState::Unknown,
            PairState::LocallyResolved,
        )
    }

    pub fn set_conflict_state(&self, row: &DocPair) -> Result<bool> {
        let updated = self.write(|conn| {
            Ok(conn.execute(
                "UPDATE States SET pair_state = 'conflicted' WHERE id = ?1",
                params![row.id],
            )?)
        })?;
        self.queue_pair(row.id, row.folderish, PairState::Conflicted);
        Ok(updated == 1)
    }

    /// Stop synchronizing `row`; with `ignore` the local side is frozen too.
    pub fn unsynchronize_state(&self, row: &DocPair, last_error: Option<&str>, ignore: bool) -> Result<()> {
        let local_state = if ignore { "local_state = 'unsynchronized'," } else { "" };
        self.write(|conn| {
            conn.execute(
                &format!(
                    "UPDATE States
                        SET pair_state = 'unsynchronized', {}
                            last_sync_date = ?1, processor = 0, last_error = ?2,
                            error_count = 0, last_sync_error_date = NULL
                      WHERE id = ?3",
                    local_state
                ),
                params![Utc::now(), last_error, row.id],
            )?;
            Ok(())
        })
    }

    /// Turn a previously unsynchronized subtree back into local creations.
    pub fn unset_unsynchronised(&self, row: &DocPair) -> Result<()> {
        let prefix = path_prefix(&row.local_path);
        self.write(|conn| {
            conn.execute(
                "UPDATE States
                    SET local_state = 'created', remote_state = 'unknown',
                        pair_state = 'locally_created', last_sync_date = ?1,
                        error_count = 0, last_sync_error_date = NULL, last_error = NULL
                  WHERE local_path = ?2 OR substr(local_path, 1, ?3) = ?4",
                params![Utc::now(), row.local_path, char_len(&prefix), prefix],
            )?;
            Ok(())
        })
    }

    pub fn increase_error(&self, row: &DocPair, error: &str, details: Option<&str>, incr: u32) -> Result<()> {
        self.write(|conn| {
            conn.execute(
                "UPDATE States
                    SET last_error = ?1, last_sync_error_date = ?2,
                        error_count = error_count + ?3, last_error_details = ?4
                  WHERE id = ?5",
                params![error, Utc::now(), incr, details, row.id],
            )?;
            Ok(())
        })
    }

    pub fn reset_error(&self, row: &DocPair, last_error: Option<&str>) -> Result<()> {
        self.write(|conn| {
            conn.execute(
                "UPDATE States
                    SET last_error = ?1, last_error_details = NULL,
                        last_sync_error_date = NULL, error_count = 0
                  WHERE id = ?2",
                params![last_error, row.id],
            )?;
            Ok(())
        })?;
        self.queue_pair(row.id, row.folderish, row.pair_state);
        Ok(())
    }

    pub fn update_last_transfer(&self, row_id: i64, transfer: Transfer) -> Result<()> {
        self.write(|conn| {
            conn.execute(
                "UPDATE States SET last_transfer = ?1 WHERE id = ?2",
                params![transfer, row_id],
            )?;
            Ok(())
        })
    }

    pub fn update_remote_name(&self, row_id: i64, remote_name: &str) -> Result<()> {
        self.write(|conn| {
            conn.execute(
                "UPDATE States SET remote_name = ?1 WHERE id = ?2",
                params![remote_name, row_id],
            )?;
            Ok(())
        })
    }

    /// Rewrite every local path under `old_path` to live under `new_path`.
    pub fn replace_local_paths(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old_prefix = path_prefix(old_path);
        let new_prefix = path_prefix(new_path);
        let n = char_len(&old_prefix);
        self.write(|conn| {
            conn.execute(
                "UPDATE States SET local_parent_path = ?1 || substr(local_parent_path, ?2 + 1)
                  WHERE substr(local_parent_path, 1, ?2) = ?3",
                params![new_prefix, n, old_prefix],
            )?;
            conn.execute(
                "UPDATE States SET local_parent_path = ?1 WHERE local_parent_path = ?2",
                params![new_path, old_path],
            )?;
            conn.execute(
                "UPDATE States SET local_path = ?1 || substr(local_path, ?2 + 1)
                  WHERE substr(local_path, 1, ?2) = ?3",
                params![new_prefix, n, old_prefix],
            )?;
            Ok(())
        })
    }

    /// Move `row` under remote path `new_path`, rewriting its descendants.
    pub fn update_remote_parent_path(&self, row: &DocPair, new_path: &str) -> Result<()> {
        let subtree = Subtree::of(row);
        self.write(|conn| {
            if row.folderish {
                if let Some(old) = subtree.remote_path() {
                    let new_folder = format!(
                        "{}/{}",
                        new_path,
                        row.remote_ref.as_deref().unwrap_or_default()
                    );
                    let old_len = char_len(old);
                    let mut params = subtree.remote();
                    params.push((":new", &new_folder as &dyn ToSql));
                    params.push((":old_len", &old_len as &dyn ToSql));
                    conn.execute(
                        &format!(
                            "UPDATE States
                                SET remote_parent_path = :new || substr(remote_parent_path, :old_len + 1)
                              WHERE {}",
                            REMOTE_DESCENDANTS
                        ),
                        params.as_slice(),
                    )?;
                }
            }
            conn.execute(
                "UPDATE States SET remote_parent_path = ?1 WHERE id = ?2",
                params![new_path, row.id],
            )?;
            Ok(())
        })
    }

    /// Move `row` locally to `new_parent/new_name`, rewriting its descendants.
    /// The row's own path and name are refreshed by the next local update.
    pub fn update_local_parent_path(&self, row: &DocPair, new_name: &str, new_parent: &str) -> Result<()> {
        let subtree = Subtree::of(row);
        self.write(|conn| {
            if row.folderish {
                let new_folder = child_path(new_parent, new_name);
                let old_len = char_len(subtree.local_path());
                let mut params = subtree.local();
                params.push((":new", &new_folder as &dyn ToSql));
                params.push((":old_len", &old_len as &dyn ToSql));
                conn.execute(
                    &format!(
                        "UPDATE States
                            SET local_parent_path = :new || substr(local_parent_path, :old_len + 1),
                                local_path = :new || substr(local_path, :old_len + 1)
                          WHERE {}",
                        LOCAL_DESCENDANTS
                    ),
                    params.as_slice(),
                )?;
            }
            conn.execute(
                "UPDATE States SET local_parent_path = ?1 WHERE id = ?2",
                params![new_parent, row.id],
            )?;
            Ok(())
        })
    }

    fn mark_descendants(&self, row: &DocPair, set: &str, pair_state: PairState) -> Result<()> {
        let subtree = Subtree::of(row);
        self.write(|conn| {
            conn.execute(
                &format!("UPDATE States SET {} WHERE id = ?1", set),
                params![row.id],
            )?;
            if row.folderish {
                conn.execute(
                    &format!("UPDATE States SET {} WHERE {}", set, LOCAL_DESCENDANTS),
                    subtree.local().as_slice(),
                )?;
            }
            Ok(())
        })?;
        self.queue_pair(row.id, row.folderish, pair_state);
        Ok(())
    }

    /// Forget the local side of a subtree so it gets downloaded again.
    pub fn mark_descendants_remotely_created(&self, row: &DocPair) -> Result<()> {
        self.mark_descendants(
            row,
            "local_digest = NULL, last_local_updated = NULL, local_name = NULL,
             remote_state = 'created', pair_state = 'remotely_created'",
            PairState::RemotelyCreated,
        )
    }

    pub fn mark_descendants_remotely_deleted(&self, row: &DocPair) -> Result<()> {
        self.mark_descendants(
            row,
            "local_digest = NULL, last_local_updated = NULL, local_name = NULL,
             remote_state = 'deleted', pair_state = 'remotely_deleted'",
            PairState::RemotelyDeleted,
        )
    }

    /// Forget the remote side of a subtree so it gets uploaded again.
    pub fn mark_descendants_locally_created(&self, row: &DocPair) -> Result<()> {
        self.mark_descendants(
            row,
            "remote_digest = NULL, remote_ref = NULL, remote_parent_ref = NULL,
             remote_parent_path = NULL, last_remote_updated = NULL, remote_name = NULL,
             remote_state = 'unknown', local_state = 'created', pair_state = 'locally_created'",
            PairState::LocallyCreated,
        )
    }

    /// Delete `row`, and with `recursive` its descendants (matched remotely
    /// with `remote_recursion`).
    pub fn remove_state(&self, row: &DocPair, remote_recursion: bool, recursive: bool) -> Result<()> {
        self.write(|conn| {
            conn.execute("DELETE FROM States WHERE id = ?1", params![row.id])?;
            Ok(())
        })?;
        if recursive && row.folderish {
            self.remove_state_children(row, remote_recursion)?;
        }
        Ok(())
    }

    pub fn remove_state_children(&self, row: &DocPair, remote_recursion: bool) -> Result<()> {
        let subtree = Subtree::of(row);
        self.write(|conn| {
            if remote_recursion {
                conn.execute(
                    &format!("DELETE FROM States WHERE {}", REMOTE_DESCENDANTS),
                    subtree.remote().as_slice(),
                )?;
            } else {
                conn.execute(
                    &format!("DELETE FROM States WHERE {}", LOCAL_DESCENDANTS),
                    subtree.local().as_slice(),
                )?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::tests::open_store;
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    pub(crate) fn local_info(path: &str, folderish: bool) -> LocalFileInfo {
        LocalFileInfo {
            root: PathBuf::from("/nonexistent"),
            path: path.to_string(),
            name: basename(path).to_string(),
            folderish,
            size: 0,
            last_modification_time: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            remote_ref: None,
            filepath: PathBuf::from("/nonexistent").join(path.trim_start_matches('/')),
        }
    }

    pub(crate) fn remote_info(uid: &str, parent: &str, name: &str, folderish: bool) -> RemoteFileInfo {
        RemoteFileInfo {
            name: name.to_string(),
            uid: uid.to_string(),
            parent_uid: Some(parent.to_string()),
            path: format!("/{}/{}", parent, uid),
            folderish,
            last_modification_time: None,
            creation_time: None,
            last_contributor: Some("bob".to_string()),
            digest: if folderish { None } else { Some(format!("digest-{}", uid)) },
            digest_algorithm: None,
            download_url: None,
            can_rename: true,
            can_delete: true,
            can_update: !folderish,
            can_create_child: folderish,
            lock_owner: None,
            lock_created: None,
            can_scroll_descendants: false,
        }
    }

    fn pair(store: &PairStateStore, id: i64) -> DocPair {
        store.get_state_from_id(id).unwrap().unwrap()
    }

    #[test]
    fn test_insert_local_state_queues_unless_parent_is_created() {
        let (_dir, store, queue) = open_store();
        let folder = store.insert_local_state(&local_info("/A", true), None).unwrap();
        let child = store
            .insert_local_state(&local_info("/A/b.txt", false), Some("/A"))
            .unwrap();

        let child_pair = pair(&store, child);
        assert_eq!(child_pair.pair_state, PairState::LocallyCreated);
        assert_eq!(child_pair.local_parent_path, "/A");
        // Unreadable file, placeholder digest
        assert_eq!(child_pair.local_digest.as_deref(), Some(UNACCESSIBLE_HASH));
        assert_eq!(queue.pushed_ids(), vec![folder]);
    }

    #[test]
    fn test_acquire_processor_is_exclusive() {
        let (_dir, store, _) = open_store();
        let id = store.insert_local_state(&local_info("/f", false), None).unwrap();

        assert!(store.acquire_processor(1, id).unwrap());
        assert!(store.acquire_processor(1, id).unwrap());
        assert!(!store.acquire_processor(2, id).unwrap());
        assert!(store.acquire_state(2, id).unwrap().is_none());

        assert!(store.release_processor(1).unwrap());
        let acquired = store.acquire_state(2, id).unwrap().unwrap();
        assert_eq!(acquired.processor, 2);
    }

    #[test]
    fn test_update_remote_state_skips_clean_rows() {
        let (_dir, store, _) = open_store();
        let info = remote_info("doc1", "root", "a.txt", false);
        let id = store
            .insert_remote_state(&info, "/root", "/a.txt", "/")
            .unwrap()
            .unwrap();
        let row = pair(&store, id);

        assert!(!store
            .update_remote_state(&row, &info, None, RemoteUpdate::default())
            .unwrap());
        assert!(store
            .update_remote_state(&row, &info, None, RemoteUpdate::forced())
            .unwrap());
        assert_eq!(pair(&store, id).version, row.version + 1);

        let mut renamed = info.clone();
        renamed.name = "b.txt".to_string();
        assert!(store
            .update_remote_state(&row, &renamed, None, RemoteUpdate::unversioned())
            .unwrap());
        let updated = pair(&store, id);
        assert_eq!(updated.remote_name.as_deref(), Some("b.txt"));
        assert_eq!(updated.version, row.version + 1);
    }

    #[test]
    fn test_duplicate_remote_insert_is_absorbed() {
        let (_dir, store, _) = open_store();
        let info = remote_info("doc1", "root", "a.txt", false);
        assert!(store.insert_remote_state(&info, "/root", "/a.txt", "/").unwrap().is_some());
        assert!(store.insert_remote_state(&info, "/root", "/a.txt", "/").unwrap().is_none());
    }

    #[test]
    fn test_synchronize_state_cas() {
        let (_dir, store, _) = open_store();
        let id = store.insert_local_state(&local_info("/f", false), None).unwrap();
        let stale = pair(&store, id);

        let mut row = stale.clone();
        row.local_state = SideState::Modified;
        store.update_local_state(&row, &local_info("/f", false), true, false).unwrap();

        assert!(!store.synchronize_state(&stale, None, false).unwrap());
        let fresh = pair(&store, id);
        assert!(store.synchronize_state(&fresh, None, false).unwrap());
        let synced = pair(&store, id);
        assert_eq!(synced.pair_state, PairState::Synchronized);
        assert_eq!(synced.version, fresh.version + 1);
        assert_eq!(synced.error_count, 0);
        assert!(synced.last_sync_date.is_some());
    }

    #[test]
    fn test_synchronize_folder_without_version_match() {
        let (_dir, store, queue) = open_store();
        let folder = store.insert_local_state(&local_info("/A", true), None).unwrap();
        store.insert_local_state(&local_info("/A/x", false), Some("/A")).unwrap();
        let stale = pair(&store, folder);
        let mut bumped = stale.clone();
        bumped.local_state = SideState::Created;
        store.update_local_state(&bumped, &local_info("/A", true), true, false).unwrap();

        queue.pushed.lock().clear();
        assert!(store.synchronize_state(&stale, None, false).unwrap());
        // The child waits for its parent and is queued now
        assert_eq!(queue.pushed.lock().len(), 1);
    }

    #[test]
    fn test_delete_local_folder_marks_descendants() {
        let (_dir, store, queue) = open_store();
        let folder = store.insert_local_state(&local_info("/A", true), None).unwrap();
        let child = store.insert_local_state(&local_info("/A/b", false), Some("/A")).unwrap();
        let other = store.insert_local_state(&local_info("/AB", false), None).unwrap();
        queue.pushed.lock().clear();

        store.delete_local_state(&pair(&store, folder)).unwrap();
        assert_eq!(pair(&store, folder).pair_state, PairState::LocallyDeleted);
        assert_eq!(pair(&store, child).pair_state, PairState::ParentLocallyDeleted);
        assert_eq!(pair(&store, other).pair_state, PairState::LocallyCreated);
        assert_eq!(queue.pushed_ids(), vec![folder]);
        assert_eq!(queue.interrupted.lock().as_slice(), ["/A".to_string()]);
    }

    #[test]
    fn test_delete_remote_folder_marks_descendants() {
        let (_dir, store, _) = open_store();
        let folder = store
            .insert_remote_state(&remote_info("F", "root", "F", true), "/root", "/F", "/")
            .unwrap()
            .unwrap();
        let child = store
            .insert_remote_state(&remote_info("c", "F", "c.txt", false), "/root/F", "/F/c.txt", "/F")
            .unwrap()
            .unwrap();

        store.delete_remote_state(&pair(&store, folder)).unwrap();
        assert_eq!(pair(&store, folder).pair_state, PairState::RemotelyDeleted);
        assert_eq!(pair(&store, child).pair_state, PairState::ParentRemotelyDeleted);
    }

    #[test]
    fn test_update_remote_parent_path_rewrites_descendants() {
        let (_dir, store, _) = open_store();
        let folder = store
            .insert_remote_state(&remote_info("A", "root", "A", true), "/root", "/A", "/")
            .unwrap()
            .unwrap();
        let sub = store
            .insert_remote_state(&remote_info("S", "A", "S", true), "/root/A", "/A/S", "/A")
            .unwrap()
            .unwrap();
        let leaf = store
            .insert_remote_state(&remote_info("l", "S", "l", false), "/root/A/S", "/A/S/l", "/A/S")
            .unwrap()
            .unwrap();

        store
            .update_remote_parent_path(&pair(&store, folder), "/root/B")
            .unwrap();
        assert_eq!(pair(&store, folder).remote_parent_path.as_deref(), Some("/root/B"));
        assert_eq!(pair(&store, sub).remote_parent_path.as_deref(), Some("/root/B/A"));
        assert_eq!(pair(&store, leaf).remote_parent_path.as_deref(), Some("/root/B/A/S"));
    }

    #[test]
    fn test_update_local_parent_path_rewrites_descendants() {
        let (_dir, store, _) = open_store();
        let folder = store.insert_local_state(&local_info("/A", true), None).unwrap();
        let child = store.insert_local_state(&local_info("/A/b", true), Some("/A")).unwrap();
        let leaf = store
            .insert_local_state(&local_info("/A/b/c", false), Some("/A/b"))
            .unwrap();

        store
            .update_local_parent_path(&pair(&store, folder), "A2", "/")
            .unwrap();
        assert_eq!(pair(&store, child).local_path, "/A2/b");
        assert_eq!(pair(&store, child).local_parent_path, "/A2");
        assert_eq!(pair(&store, leaf).local_path, "/A2/b/c");
        assert_eq!(pair(&store, leaf).local_parent_path, "/A2/b");
    }

    #[test]
    fn test_replace_local_paths_matches_whole_segments() {
        let (_dir, store, _) = open_store();
        store.insert_local_state(&local_info("/A", true), None).unwrap();
        let inner = store.insert_local_state(&local_info("/A/x", false), Some("/A")).unwrap();
        let sibling = store.insert_local_state(&local_info("/AB/x", false), None).unwrap();

        store.replace_local_paths("/A", "/Z").unwrap();
        assert_eq!(pair(&store, inner).local_path, "/Z/x");
        assert_eq!(pair(&store, inner).local_parent_path, "/Z");
        assert_eq!(pair(&store, sibling).local_path, "/AB/x");
    }

    #[test]
    fn test_conflict_signals_instead_of_queueing() {
        let (_dir, store, queue) = open_store();
        let id = store.insert_local_state(&local_info("/f", false), None).unwrap();
        queue.pushed.lock().clear();
        store.set_conflict_state(&pair(&store, id)).unwrap();
        assert!(queue.pushed.lock().is_empty());
        assert_eq!(queue.conflicts.lock().as_slice(), [id]);
    }

    #[test]
    fn test_errors_and_unsynchronize() {
        let (_dir, store, _) = open_store();
        let id = store.insert_local_state(&local_info("/f", false), None).unwrap();
        let row = pair(&store, id);

        store.increase_error(&row, "UPLOAD", Some("boom"), 1).unwrap();
        store.increase_error(&row, "UPLOAD", None, 1).unwrap();
        let errored = pair(&store, id);
        assert_eq!(errored.error_count, 2);
        assert_eq!(errored.last_error.as_deref(), Some("UPLOAD"));

        store.reset_error(&errored, None).unwrap();
        assert_eq!(pair(&store, id).error_count, 0);

        store.unsynchronize_state(&row, Some("READONLY"), false).unwrap();
        let unsynced = pair(&store, id);
        assert_eq!(unsynced.pair_state, PairState::Unsynchronized);
        assert_eq!(unsynced.local_state, SideState::Created);

        store.unset_unsynchronised(&unsynced).unwrap();
        assert_eq!(pair(&store, id).pair_state, PairState::LocallyCreated);
    }

    #[test]
    fn test_force_local_requires_current_version() {
        let (_dir, store, _) = open_store();
        let id = store.insert_local_state(&local_info("/f", false), None).unwrap();
        let row = pair(&store, id);
        assert!(store.force_local(&row).unwrap());
        let forced = pair(&store, id);
        assert_eq!(forced.pair_state, PairState::LocallyResolved);

        let mut old = forced.clone();
        old.version -= 1;
        assert!(!store.force_remote(&old).unwrap());
    }

    #[test]
    fn test_mark_descendants_locally_created_forgets_remote() {
        let (_dir, store, _) = open_store();
        let folder = store
            .insert_remote_state(&remote_info("F", "root", "F", true), "/root", "/F", "/")
            .unwrap()
            .unwrap();
        let child = store
            .insert_remote_state(&remote_info("c", "F", "c", false), "/root/F", "/F/c", "/F")
            .unwrap()
            .unwrap();
        store.mark_descendants_locally_created(&pair(&store, folder)).unwrap();
        let child = pair(&store, child);
        assert_eq!(child.pair_state, PairState::LocallyCreated);
        assert!(child.remote_ref.is_none());
    }

    #[test]
    fn test_remove_state_recursive() {
        let (_dir, store, _) = open_store();
        let folder = store.insert_local_state(&local_info("/A", true), None).unwrap();
        let child = store.insert_local_state(&local_info("/A/b", false), Some("/A")).unwrap();
        let kept = store.insert_local_state(&local_info("/c", false), None).unwrap();

        store.remove_state(&pair(&store, folder), false, true).unwrap();
        assert!(store.get_state_from_id(folder).unwrap().is_none());
        assert!(store.get_state_from_id(child).unwrap().is_none());
        assert!(store.get_state_from_id(kept).unwrap().is_some());
    }
}
