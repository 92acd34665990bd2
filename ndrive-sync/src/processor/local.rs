//! Handlers pushing local changes to the server

use tracing::{debug, info, warn};

use ndrive_client::names::{is_generated_tmp_file, UNACCESSIBLE_HASH};
use ndrive_client::RemoteFileInfo;
use ndrive_index::{DocPair, PairState, QueueItem, RemoteUpdate, SideState, Transfer};

use super::{Processor, COPY_IN_PROGRESS_DELAY};
use crate::errors::{Result, SyncError};
use crate::events::EngineEvent;

/// Remote writes made by a processor are never versioned nor re-queued; the
/// final synchronization closes the loop.
fn quiet_update() -> RemoteUpdate {
    RemoteUpdate {
        versioned: false,
        queue: false,
        ..RemoteUpdate::default()
    }
}

impl Processor {
    pub(super) async fn synchronize_conflicted(&mut self, pair: DocPair) -> Result<()> {
        if pair.local_state == SideState::Moved
            && matches!(pair.remote_state, SideState::Moved | SideState::Unknown)
        {
            self.ctx.emit(EngineEvent::NewConflict { id: pair.id });
            return Ok(());
        }
        let Some(remote_ref) = pair.remote_ref.clone() else {
            self.ctx.emit(EngineEvent::NewConflict { id: pair.id });
            return Ok(());
        };

        if pair.folderish {
            if self.ctx.local.get_remote_id(&pair.local_path).as_deref() == Some(remote_ref.as_str())
            {
                debug!("Auto-resolving folder conflict on {}", pair);
                if self.ctx.store.synchronize_state(&pair, None, false)? {
                    return Ok(());
                }
            }
            self.ctx.emit(EngineEvent::NewConflict { id: pair.id });
            return Ok(());
        }

        let Some(local_info) = self.ctx.local.try_get_info(&pair.local_path)? else {
            self.ctx.emit(EngineEvent::NewConflict { id: pair.id });
            return Ok(());
        };
        let mut pair = pair;
        if pair.local_digest.is_none() {
            pair.local_digest =
                local_info.get_digest(self.ctx.local.digest_algorithm(), Some(&self.cancel))?;
        }
        let same_content = self.ctx.local.is_equal_digests(
            pair.local_digest.as_deref(),
            pair.remote_digest.as_deref(),
            &pair.local_path,
            None,
            Some(&self.cancel),
        )?;
        let same_name = pair.remote_name.as_deref() == Some(local_info.name.as_str());
        let same_parent = self.ctx.local.get_remote_id(&pair.local_parent_path) == pair.remote_parent_ref;
        if same_content && same_name && same_parent {
            info!("Auto-resolving conflict on {}: same content on both sides", pair);
            pair.local_digest = pair.remote_digest.clone();
            self.ctx.local.set_remote_id(&pair.local_path, &remote_ref)?;
            self.refresh_local_state(&mut pair, &local_info)?;
            if self.ctx.store.synchronize_state(&pair, None, false)? {
                return Ok(());
            }
        }
        self.ctx.emit(EngineEvent::NewConflict { id: pair.id });
        Ok(())
    }

    /// Close a local operation, unless the server changed the item meanwhile
    /// in which case the remote change is applied first.
    pub(super) async fn synchronize_if_not_remotely_dirty(
        &mut self,
        pair: DocPair,
        info: Option<RemoteFileInfo>,
    ) -> Result<()> {
        let Some(mut pair) = self.ctx.store.get_state_from_id(pair.id)? else {
            return Ok(());
        };
        if let Some(info) = &info {
            let name_changed = pair.local_name.as_deref() != Some(info.name.as_str());
            let digest_changed = !pair.folderish && info.digest != pair.local_digest;
            if name_changed || digest_changed {
                debug!("Remote side of {} changed meanwhile", pair);
                return self.synchronize_remotely_modified(pair).await;
            }
        }

        let local_info = self.ctx.local.get_info(&pair.local_path)?;
        let mut dynamic = false;
        if !pair.folderish {
            let digest = local_info.get_digest(self.ctx.local.digest_algorithm(), Some(&self.cancel))?;
            if digest != pair.local_digest {
                debug!("{} was modified locally during the transfer", pair);
                pair.local_digest = digest;
                pair.local_state = SideState::Modified;
                pair.remote_state = SideState::Synchronized;
                dynamic = true;
            }
        }
        self.refresh_local_state(&mut pair, &local_info)?;
        if !self.ctx.store.synchronize_state(&pair, None, dynamic)? {
            debug!("{} changed while it was processed, it will be handled again", pair);
        } else if dynamic {
            self.ctx
                .queue
                .push(QueueItem::new(pair.id, pair.folderish, PairState::LocallyModified));
        }
        Ok(())
    }

    pub(super) async fn synchronize_locally_modified(&mut self, mut pair: DocPair) -> Result<()> {
        let Some(remote_ref) = pair.remote_ref.clone() else {
            return Err(SyncError::IllegalState(format!("no remote ref on modified {}", pair)));
        };

        if pair.local_digest.as_deref() == Some(UNACCESSIBLE_HASH) {
            let info = self.ctx.local.get_info(&pair.local_path)?;
            pair.local_digest = info.get_digest(self.ctx.local.digest_algorithm(), Some(&self.cancel))?;
            if pair.local_digest.as_deref() == Some(UNACCESSIBLE_HASH) {
                return self.postpone(&pair, "FILE_NOT_READY", Some(COPY_IN_PROGRESS_DELAY));
            }
            self.ctx.store.update_local_state(&pair, &info, false, false)?;
        }

        let same_content = pair.folderish
            || self.ctx.local.is_equal_digests(
                pair.local_digest.as_deref(),
                pair.remote_digest.as_deref(),
                &pair.local_path,
                None,
                Some(&self.cancel),
            )?;

        let info = if !same_content {
            if !pair.remote_can_update {
                return self.refuse_local_modification(pair).await;
            }
            debug!("Uploading modified content of {}", pair);
            let os_path = self.ctx.local.abspath(&pair.local_path)?;
            let info = self
                .ctx
                .remote
                .stream_update(
                    &remote_ref,
                    &os_path,
                    pair.remote_parent_ref.as_deref(),
                    pair.remote_name.as_deref().unwrap_or(pair.name()),
                    Some(&self.cancel),
                )
                .await?;
            self.transferred += pair.size;
            self.ctx.store.update_last_transfer(pair.id, Transfer::Upload)?;
            info
        } else {
            self.ctx
                .remote
                .get_fs_info(&remote_ref, pair.remote_parent_ref.as_deref())
                .await?
        };
        self.ctx.store.update_remote_state(&pair, &info, None, quiet_update())?;
        self.synchronize_if_not_remotely_dirty(pair, Some(info)).await
    }

    /// The server does not accept the new content.
    async fn refuse_local_modification(&mut self, pair: DocPair) -> Result<()> {
        if self.ctx.local_rollback() {
            info!("Rolling back local modification of readonly {}", pair);
            self.ctx.local.delete_final(&pair.local_path)?;
            self.ctx.store.mark_descendants_remotely_created(&pair)?;
            return Ok(());
        }
        let remote_ref = pair.remote_ref.as_deref().unwrap_or_default();
        let current = self
            .ctx
            .remote
            .get_fs_item(remote_ref, pair.remote_parent_ref.as_deref())
            .await?;
        match current.and_then(|info| info.lock_owner.map(|owner| (owner, info.lock_created))) {
            Some((owner, created)) => {
                info!("{} is locked by {}, not uploading", pair, owner);
                self.ctx.store.unsynchronize_state(&pair, Some("LOCKED"), false)?;
                self.ctx.emit(EngineEvent::NewLocked {
                    filename: pair.name().to_string(),
                    owner,
                    created,
                });
            }
            None => {
                info!("{} is readonly on the server, not uploading", pair);
                self.ctx.store.unsynchronize_state(&pair, Some("READONLY"), false)?;
                self.ctx.emit(EngineEvent::NewReadonly {
                    filename: pair.name().to_string(),
                    parent: None,
                });
            }
        }
        Ok(())
    }

    pub(super) async fn synchronize_locally_created(&mut self, mut pair: DocPair, overwrite: bool) -> Result<()> {
        let name = pair.name().to_string();
        if !pair.folderish {
            let (is_tmp, delay) = is_generated_tmp_file(&name);
            if is_tmp {
                if !delay {
                    debug!("Ignoring generated temporary file {}", pair);
                    self.ctx.store.remove_state(&pair, false, true)?;
                } else if pair.error_count == 0 {
                    debug!("{} may be a temporary file, waiting", pair);
                    self.increase_error(&pair, "Can be a temporary file", None)?;
                }
                return Ok(());
            }
        }

        let parent = match self.ctx.store.get_state_from_local(&pair.local_parent_path)? {
            Some(parent) => Some(parent),
            None => {
                let parent_ref = self.ctx.local.get_remote_id(&pair.local_parent_path);
                self.get_normal_state_from_remote_ref(parent_ref.as_deref())?
            }
        };
        let parent = match parent {
            Some(parent) if parent.remote_ref.is_some() => parent,
            Some(parent) if parent.pair_state == PairState::Unsynchronized => {
                debug!("Parent of {} is unsynchronized", pair);
                self.ctx.store.unsynchronize_state(&pair, Some("PARENT_UNSYNC"), false)?;
                return Ok(());
            }
            _ => {
                return Err(SyncError::parent_not_synced(
                    pair.local_path.clone(),
                    pair.local_parent_path.clone(),
                ))
            }
        };
        let parent_ref = parent.remote_ref.clone().unwrap_or_default();

        // Already bound: a restore from the trash or an interrupted creation
        if let Some(remote_ref) = self.ctx.local.get_remote_id(&pair.local_path) {
            match self.ctx.remote.get_fs_item(&remote_ref, Some(&parent_ref)).await? {
                Some(info)
                    if info.parent_uid.as_deref() == Some(parent_ref.as_str())
                        && (pair.folderish || info.digest == pair.local_digest) =>
                {
                    debug!("{} is already bound to {}", pair, remote_ref);
                    self.ctx.store.update_remote_state(
                        &pair,
                        &info,
                        Some(&parent.remote_path()),
                        quiet_update(),
                    )?;
                    return self.synchronize_if_not_remotely_dirty(pair, Some(info)).await;
                }
                Some(_) => debug!("{} is a copy of {}, creating a new item", pair, remote_ref),
                None => self.ctx.local.remove_remote_id(&pair.local_path)?,
            }
        }

        if !parent.remote_can_create_child {
            return self.refuse_local_creation(pair, &parent).await;
        }

        let info = if pair.folderish {
            debug!("Creating remote folder {:?} in {}", name, parent_ref);
            self.ctx.remote.make_folder(&parent_ref, &name, overwrite).await?
        } else {
            let local_info = self.ctx.local.get_info(&pair.local_path)?;
            if local_info.size != pair.size || pair.local_digest.as_deref() == Some(UNACCESSIBLE_HASH) {
                pair.local_digest = Some(UNACCESSIBLE_HASH.to_string());
                self.ctx.store.update_local_state(&pair, &local_info, false, false)?;
                let digest = local_info.get_digest(self.ctx.local.digest_algorithm(), Some(&self.cancel))?;
                if local_info.size != pair.size || digest.as_deref() == Some(UNACCESSIBLE_HASH) {
                    debug!("Copy of {} still in progress", pair);
                    return self.postpone(&pair, "COPY_IN_PROGRESS", Some(COPY_IN_PROGRESS_DELAY));
                }
                pair.local_digest = digest;
                self.ctx.store.update_local_state(&pair, &local_info, false, false)?;
            }
            debug!("Uploading {:?} to {}", name, parent_ref);
            let os_path = self.ctx.local.abspath(&pair.local_path)?;
            let info = self
                .ctx
                .remote
                .stream_file(&parent_ref, &os_path, &name, overwrite, Some(&self.cancel))
                .await?;
            self.transferred += local_info.size;
            self.ctx.store.update_last_transfer(pair.id, Transfer::Upload)?;
            info
        };

        if let Err(e) = self.ctx.local.set_remote_id(&pair.local_path, &info.uid) {
            if !e.is_not_found() {
                return Err(e.into());
            }
            // Moved away while uploading
            self.ctx
                .store
                .update_remote_state(&pair, &info, Some(&parent.remote_path()), quiet_update())?;
            let Some(moved) = self.ctx.store.get_state_from_id(pair.id)? else {
                return Ok(());
            };
            debug!("{} moved during its creation", moved);
            return self.synchronize_locally_moved(moved, false).await;
        }
        self.ctx
            .store
            .update_remote_state(&pair, &info, Some(&parent.remote_path()), quiet_update())?;
        self.synchronize_if_not_remotely_dirty(pair, Some(info)).await
    }

    async fn refuse_local_creation(&mut self, pair: DocPair, parent: &DocPair) -> Result<()> {
        if self.ctx.local_rollback() {
            info!("Rolling back creation of {} in readonly folder", pair);
            self.ctx.local.delete(&pair.local_path)?;
            self.ctx.store.remove_state(&pair, false, true)?;
            return Ok(());
        }
        info!("Parent of {} is readonly, not creating it", pair);
        self.ctx.store.unsynchronize_state(&pair, Some("READONLY"), false)?;
        self.ctx.emit(EngineEvent::NewReadonly {
            filename: pair.name().to_string(),
            parent: parent.remote_name.clone(),
        });
        Ok(())
    }

    pub(super) async fn synchronize_locally_deleted(&mut self, pair: DocPair) -> Result<()> {
        let Some(remote_ref) = pair.remote_ref.clone() else {
            debug!("{} never reached the server, forgetting it", pair);
            self.ctx.store.remove_state(&pair, false, true)?;
            return self.search_for_dedup(&pair, None);
        };

        if pair.remote_can_delete {
            if pair.remote_state != SideState::Deleted {
                debug!("Deleting remote item {} of {}", remote_ref, pair);
                match self
                    .ctx
                    .remote
                    .delete(&remote_ref, pair.remote_parent_ref.as_deref())
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => debug!("{} already gone remotely", remote_ref),
                    Err(e) => return Err(e.into()),
                }
            }
            self.ctx.store.remove_state(&pair, false, true)?;
        } else {
            info!("{} cannot be deleted remotely, restoring it", pair);
            self.ctx.store.mark_descendants_remotely_created(&pair)?;
            self.ctx.emit(EngineEvent::DeleteReadonly {
                filename: pair.name().to_string(),
            });
        }
        self.search_for_dedup(&pair, None)
    }

    pub(super) async fn synchronize_locally_moved(&mut self, mut pair: DocPair, update: bool) -> Result<()> {
        let Some(remote_ref) = pair.remote_ref.clone() else {
            return Err(SyncError::IllegalState(format!("no remote ref on moved {}", pair)));
        };
        self.search_for_dedup(&pair, pair.remote_name.as_deref())?;

        let mut remote_info = None;
        let local_name = pair.local_name.clone().unwrap_or_default();
        if pair.remote_name.as_deref() != Some(local_name.as_str()) {
            if pair.remote_can_rename {
                debug!("Renaming remote {} to {:?}", remote_ref, local_name);
                let info = self.ctx.remote.rename(&remote_ref, &local_name).await?;
                self.refresh_remote(&pair, Some(info.clone())).await?;
                remote_info = Some(info);
                if let Some(fresh) = self.ctx.store.get_state_from_id(pair.id)? {
                    pair = fresh;
                }
            } else if self.ctx.local_rollback() {
                let previous = pair.remote_name.clone().unwrap_or_default();
                info!("Rename of {} refused, renaming back to {:?}", pair, previous);
                let info = self.ctx.local.rename(&pair.local_path, &previous)?;
                self.refresh_local_state(&mut pair, &info)?;
                if !update {
                    return Ok(());
                }
            } else {
                info!("{} cannot be renamed remotely", pair);
                self.ctx.store.unsynchronize_state(&pair, Some("READONLY"), false)?;
                self.ctx.emit(EngineEvent::NewReadonly {
                    filename: local_name,
                    parent: None,
                });
                return Ok(());
            }
        }

        let local_parent = self.ctx.store.get_state_from_local(&pair.local_parent_path)?;
        let parent_ref = self
            .ctx
            .local
            .get_remote_id(&pair.local_parent_path)
            .or_else(|| local_parent.as_ref().and_then(|p| p.remote_ref.clone()));
        let Some(parent_ref) = parent_ref else {
            return Err(SyncError::parent_not_synced(
                pair.local_path.clone(),
                pair.local_parent_path.clone(),
            ));
        };

        if pair.remote_parent_ref.as_deref() != Some(parent_ref.as_str()) {
            let parent = match self.ctx.store.get_normal_state_from_remote(&parent_ref)? {
                Some(parent) => parent,
                None => local_parent.ok_or_else(|| {
                    SyncError::parent_not_synced(pair.local_path.clone(), pair.local_parent_path.clone())
                })?,
            };
            if pair.remote_can_delete
                && parent.pair_state != PairState::Unsynchronized
                && parent.remote_can_create_child
            {
                debug!("Moving remote {} into {}", remote_ref, parent_ref);
                let info = self.ctx.remote.move_item(&remote_ref, &parent_ref).await?;
                self.ctx.store.update_remote_state(
                    &pair,
                    &info,
                    Some(&parent.remote_path()),
                    RemoteUpdate {
                        queue: false,
                        ..RemoteUpdate::unversioned()
                    },
                )?;
                remote_info = Some(info);
                if let Some(fresh) = self.ctx.store.get_state_from_id(pair.id)? {
                    pair = fresh;
                }
            } else {
                info!("{} cannot be moved into {}", pair, parent);
                self.ctx.store.unsynchronize_state(&pair, Some("READONLY"), false)?;
                self.ctx.emit(EngineEvent::NewReadonly {
                    filename: pair.name().to_string(),
                    parent: Some(parent.name().to_string()),
                });
                return Ok(());
            }
        }

        if !update {
            return Ok(());
        }
        if pair.local_state == SideState::Moved {
            self.synchronize_if_not_remotely_dirty(pair, remote_info).await
        } else {
            self.synchronize_locally_modified(pair).await
        }
    }

    /// Moved locally while deleted remotely: upload it again.
    pub(super) async fn synchronize_locally_moved_created(&mut self, mut pair: DocPair) -> Result<()> {
        debug!("{} was deleted remotely, creating it again", pair);
        pair.remote_ref = None;
        self.synchronize_locally_created(pair, false).await
    }

    pub(super) async fn synchronize_locally_moved_remotely_modified(&mut self, pair: DocPair) -> Result<()> {
        let id = pair.id;
        self.synchronize_locally_moved(pair, false).await?;
        match self.ctx.store.get_state_from_id(id)? {
            Some(fresh) => self.synchronize_remotely_modified(fresh).await,
            None => {
                warn!("Pair {} vanished after its move", id);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{bind_folder, fixture};
    use super::*;

    #[tokio::test]
    async fn test_locally_created_file_is_uploaded() {
        let fx = fixture().await;
        let mut processor = fx.processor();
        fx.create_local_file("/Workspace", "report.txt", b"hello\n");
        fx.drain(&mut processor).await;

        let pair = fx.pair("/Workspace/report.txt");
        assert_eq!(pair.pair_state, PairState::Synchronized);
        assert_eq!(pair.remote_name.as_deref(), Some("report.txt"));
        assert_eq!(pair.last_transfer, Some(Transfer::Upload));
        assert_eq!(pair.local_digest.as_deref(), Some("b1946ac92492d2347c6235b4d2611184"));
        let remote_ref = pair.remote_ref.clone().unwrap();
        assert_eq!(fx.ctx.local.get_remote_id("/Workspace/report.txt"), Some(remote_ref.clone()));
        assert_eq!(fx.remote.content(&remote_ref).unwrap(), b"hello\n");
        assert_eq!(fx.remote.item(&remote_ref).unwrap().parent_uid.as_deref(), Some(fx.root_id.as_str()));
    }

    #[tokio::test]
    async fn test_locally_created_folder_then_child() {
        let fx = fixture().await;
        let mut processor = fx.processor();
        let folder = fx.ctx.local.make_folder("/Workspace", "Docs").unwrap();
        let info = fx.ctx.local.get_info(&folder).unwrap();
        fx.ctx.store.insert_local_state(&info, Some("/Workspace")).unwrap();
        // Held back until the folder exists remotely
        fx.create_local_file(&folder, "a.txt", b"a");
        fx.drain(&mut processor).await;

        let docs = fx.pair("/Workspace/Docs");
        assert_eq!(docs.pair_state, PairState::Synchronized);
        let child = fx.pair("/Workspace/Docs/a.txt");
        assert_eq!(child.pair_state, PairState::Synchronized);
        assert_eq!(child.remote_parent_ref, docs.remote_ref);
        assert_eq!(child.remote_parent_path, Some(docs.remote_path()));
    }

    #[tokio::test]
    async fn test_generated_tmp_file_is_dropped() {
        let fx = fixture().await;
        let mut processor = fx.processor();
        fx.create_local_file("/Workspace", "~lock.tmp", b"x");
        fx.drain(&mut processor).await;
        assert!(fx.ctx.store.get_state_from_local("/Workspace/~lock.tmp").unwrap().is_none());
        assert_eq!(fx.remote.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_creation_in_readonly_folder_is_unsynchronized() {
        let fx = fixture().await;
        let mut rx = fx.ctx.events.subscribe();
        let mut processor = fx.processor();
        let locked = fx.remote.create_folder_remotely(&fx.root_id, "Locked").unwrap();
        fx.remote.set_readonly_remotely(&locked.uid, true).unwrap();
        let locked = fx.remote.item(&locked.uid).unwrap();
        fx.ctx.local.make_folder("/Workspace", "Locked").unwrap();
        let ws_path = fx.pair("/Workspace").remote_path();
        bind_folder(&fx.ctx.store, &fx.ctx.local, "/Workspace/Locked", &locked, &ws_path);

        fx.create_local_file("/Workspace/Locked", "new.txt", b"new");
        fx.drain(&mut processor).await;

        let pair = fx.pair("/Workspace/Locked/new.txt");
        assert_eq!(pair.pair_state, PairState::Unsynchronized);
        assert_eq!(pair.last_error.as_deref(), Some("READONLY"));
        assert!(fx.remote.children_of(&locked.uid).is_empty());
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&EngineEvent::NewReadonly {
            filename: "new.txt".into(),
            parent: Some("Locked".into()),
        }));
    }

    #[tokio::test]
    async fn test_locally_modified_uploads_new_content() {
        let fx = fixture().await;
        let mut processor = fx.processor();
        let path = fx.create_local_file("/Workspace", "notes.txt", b"v1");
        fx.drain(&mut processor).await;
        let pair = fx.pair(&path);
        let version = pair.version;

        fx.ctx.local.update_content(&path, b"v2").unwrap();
        let info = fx.ctx.local.get_info(&path).unwrap();
        let mut modified = pair.clone();
        modified.local_digest = info.get_digest(fx.ctx.local.digest_algorithm(), None).unwrap();
        modified.local_state = SideState::Modified;
        fx.ctx.store.update_local_state(&modified, &info, true, true).unwrap();
        fx.drain(&mut processor).await;

        let pair = fx.pair(&path);
        assert_eq!(pair.pair_state, PairState::Synchronized);
        // One for the local update, one for the sync
        assert_eq!(pair.version, version + 2);
        assert_eq!(pair.local_digest, pair.remote_digest);
        assert_eq!(fx.remote.content(pair.remote_ref.as_deref().unwrap()).unwrap(), b"v2");
        assert_eq!(pair.last_transfer, Some(Transfer::Upload));
    }

    #[tokio::test]
    async fn test_locally_modified_readonly_is_unsynchronized() {
        let fx = fixture().await;
        let mut processor = fx.processor();
        let path = fx.create_local_file("/Workspace", "ro.txt", b"v1");
        fx.drain(&mut processor).await;
        let pair = fx.pair(&path);
        let remote_ref = pair.remote_ref.clone().unwrap();
        fx.remote.set_readonly_remotely(&remote_ref, true).unwrap();
        fx.remote.lock_remotely(&remote_ref, "bob").unwrap();

        let mut rx = fx.ctx.events.subscribe();
        fx.ctx.local.unset_readonly(&path).unwrap();
        fx.ctx.local.update_content(&path, b"v2").unwrap();
        let info = fx.ctx.local.get_info(&path).unwrap();
        let mut modified = pair.clone();
        modified.local_digest = info.get_digest(fx.ctx.local.digest_algorithm(), None).unwrap();
        modified.local_state = SideState::Modified;
        fx.ctx.store.update_local_state(&modified, &info, true, true).unwrap();
        fx.drain(&mut processor).await;

        let pair = fx.pair(&path);
        assert_eq!(pair.pair_state, PairState::Unsynchronized);
        assert_eq!(pair.last_error.as_deref(), Some("LOCKED"));
        assert_eq!(fx.remote.content(&remote_ref).unwrap(), b"v1");
        let mut locked = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::NewLocked { owner, .. } = event {
                assert_eq!(owner, "bob");
                locked = true;
            }
        }
        assert!(locked);
    }

    #[tokio::test]
    async fn test_locally_deleted_removes_remote_item() {
        let fx = fixture().await;
        let mut processor = fx.processor();
        let path = fx.create_local_file("/Workspace", "gone.txt", b"bye");
        fx.drain(&mut processor).await;
        let pair = fx.pair(&path);
        let remote_ref = pair.remote_ref.clone().unwrap();

        fx.ctx.local.delete_final(&path).unwrap();
        fx.ctx.store.delete_local_state(&pair).unwrap();
        fx.drain(&mut processor).await;

        assert!(fx.ctx.store.get_state_from_local(&path).unwrap().is_none());
        assert!(fx.remote.item(&remote_ref).is_none());
    }

    #[tokio::test]
    async fn test_locally_deleted_readonly_is_restored() {
        let fx = fixture().await;
        let mut processor = fx.processor();
        let path = fx.create_local_file("/Workspace", "keep.txt", b"keep");
        fx.drain(&mut processor).await;
        let mut pair = fx.pair(&path);
        let remote_ref = pair.remote_ref.clone().unwrap();

        let mut rx = fx.ctx.events.subscribe();
        fx.ctx.local.delete_final(&path).unwrap();
        pair.remote_can_delete = false;
        processor.synchronize_locally_deleted(pair.clone()).await.unwrap();

        let pair = fx.ctx.store.get_state_from_id(pair.id).unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::RemotelyCreated);
        assert!(fx.remote.item(&remote_ref).is_some());
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::DeleteReadonly {
                filename: "keep.txt".into()
            }
        );
    }

    #[tokio::test]
    async fn test_locally_renamed_folder_keeps_children() {
        let fx = fixture().await;
        let mut processor = fx.processor();
        let folder = fx.remote.create_folder_remotely(&fx.root_id, "A").unwrap();
        let file = fx.remote.create_file_remotely(&folder.uid, "b.txt", b"x").unwrap();
        let ws = fx.pair("/Workspace");
        fx.ctx
            .store
            .insert_remote_state(&folder, &ws.remote_path(), "/Workspace/A", "/Workspace")
            .unwrap();
        fx.drain(&mut processor).await;
        let a = fx.pair("/Workspace/A");
        fx.ctx
            .store
            .insert_remote_state(&file, &a.remote_path(), "/Workspace/A/b.txt", "/Workspace/A")
            .unwrap();
        fx.drain(&mut processor).await;
        assert!(fx.ctx.local.exists("/Workspace/A/b.txt"));
        let a = fx.pair("/Workspace/A");
        let version = a.version;

        // What the local watcher records for a rename
        let info = fx.ctx.local.rename("/Workspace/A", "A2").unwrap();
        fx.ctx.store.replace_local_paths("/Workspace/A", "/Workspace/A2").unwrap();
        let mut moved = fx.pair("/Workspace/A");
        moved.local_state = SideState::Moved;
        fx.ctx.store.update_local_state(&moved, &info, true, true).unwrap();
        fx.drain(&mut processor).await;

        let a = fx.pair("/Workspace/A2");
        assert_eq!(a.pair_state, PairState::Synchronized);
        assert_eq!(a.remote_name.as_deref(), Some("A2"));
        assert!(a.version > version);
        assert_eq!(fx.remote.item(&folder.uid).unwrap().name, "A2");
        let b = fx.pair("/Workspace/A2/b.txt");
        assert_eq!(b.remote_ref.as_deref(), Some(file.uid.as_str()));
        assert_eq!(b.remote_parent_path, Some(a.remote_path()));
        assert!(!fx.ctx.local.exists("/Workspace/A/b.txt"));
    }

    #[tokio::test]
    async fn test_move_into_readonly_folder() {
        let fx = fixture().await;
        let mut rx = fx.ctx.events.subscribe();
        let mut processor = fx.processor();
        let ws = fx.pair("/Workspace");
        let a = fx.remote.create_folder_remotely(&fx.root_id, "A").unwrap();
        let b = fx.remote.create_folder_remotely(&fx.root_id, "B").unwrap();
        fx.remote.set_readonly_remotely(&b.uid, true).unwrap();
        let b = fx.remote.item(&b.uid).unwrap();
        fx.ctx.local.make_folder("/Workspace", "A").unwrap();
        fx.ctx.local.make_folder("/Workspace", "B").unwrap();
        bind_folder(&fx.ctx.store, &fx.ctx.local, "/Workspace/A", &a, &ws.remote_path());
        bind_folder(&fx.ctx.store, &fx.ctx.local, "/Workspace/B", &b, &ws.remote_path());
        fx.create_local_file("/Workspace/A", "x", b"x");
        fx.drain(&mut processor).await;
        let x = fx.pair("/Workspace/A/x");
        let remote_x = x.remote_ref.clone().unwrap();

        let info = fx.ctx.local.move_to("/Workspace/A/x", "/Workspace/B", None).unwrap();
        let mut moved = x.clone();
        moved.local_state = SideState::Moved;
        fx.ctx.store.update_local_state(&moved, &info, true, true).unwrap();
        fx.drain(&mut processor).await;

        let x = fx.pair("/Workspace/B/x");
        assert_eq!(x.pair_state, PairState::Unsynchronized);
        assert!(fx.ctx.local.exists("/Workspace/B/x"));
        assert_eq!(fx.remote.item(&remote_x).unwrap().parent_uid.as_deref(), Some(a.uid.as_str()));
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&EngineEvent::NewReadonly {
            filename: "x".into(),
            parent: Some("B".into()),
        }));
    }
}
