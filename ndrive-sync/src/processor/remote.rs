//! Handlers applying server changes to the local tree

use tracing::{debug, info, warn};

use ndrive_client::names::{basename, child_path, download_tmp_name, parent_path, safe_filename};
use ndrive_client::ClientError;
use ndrive_index::{DocPair, PairState, SideState, Transfer};

use super::Processor;
use crate::errors::{Result, SyncError};

impl Processor {
    /// Fill `tmp_ref` with the remote content of `pair`, copying a local
    /// file with the same digest when there is one.
    async fn download_content(&mut self, pair: &DocPair, tmp_ref: &str) -> Result<()> {
        let file_out = self.ctx.local.abspath(tmp_ref)?;
        if let Some(digest) = pair.remote_digest.as_deref() {
            if let Some(duplicate) = self.ctx.store.get_valid_duplicate_file(digest)? {
                if duplicate.id != pair.id {
                    let source = self.ctx.local.abspath(&duplicate.local_path)?;
                    match tokio::fs::copy(&source, &file_out).await {
                        Ok(_) => {
                            debug!("Copied {:?} from local duplicate {:?}", tmp_ref, duplicate.local_path);
                            return Ok(());
                        }
                        Err(e) => debug!("Cannot copy duplicate {:?}, downloading: {}", source, e),
                    }
                }
            }
        }

        let remote_ref = pair
            .remote_ref
            .as_deref()
            .ok_or_else(|| SyncError::IllegalState(format!("no remote ref on {}", pair)))?;
        let info = self
            .ctx
            .remote
            .get_fs_info(remote_ref, pair.remote_parent_ref.as_deref())
            .await?;
        self.check_interrupted()?;
        self.ctx
            .remote
            .stream_content(&info, &file_out, Some(&self.cancel))
            .await?;
        self.transferred += tokio::fs::metadata(&file_out).await.map(|m| m.len()).unwrap_or(0);
        Ok(())
    }

    fn discard_tmp(&self, tmp_ref: &str) {
        if let Err(e) = self.ctx.local.delete_final(tmp_ref) {
            debug!("Cannot remove temporary file {:?}: {}", tmp_ref, e);
        }
    }

    /// Replace the local file with the remote content, renaming it when
    /// the remote name changed too.
    async fn update_remotely(&mut self, pair: &mut DocPair, is_renaming: bool) -> Result<()> {
        let parent = pair.local_parent_path.clone();
        let name = if is_renaming {
            safe_filename(pair.remote_name.as_deref().unwrap_or_default())
        } else {
            pair.name().to_string()
        };
        info!("Updating content of local file {:?}", pair.local_path);
        let tmp = child_path(&parent, &download_tmp_name(&name));

        self.ctx.readonly_locks.unlock(&self.ctx.local, &parent)?;
        let result = self.replace_content(pair, &parent, &name, &tmp).await;
        let relocked = self.ctx.readonly_locks.lock(&self.ctx.local, &parent);
        if result.is_err() {
            self.discard_tmp(&tmp);
        }
        result?;
        relocked
    }

    async fn replace_content(&mut self, pair: &mut DocPair, parent: &str, name: &str, tmp: &str) -> Result<()> {
        self.download_content(pair, tmp).await?;
        self.check_interrupted()?;

        let remote_ref = pair.remote_ref.clone().unwrap_or_default();
        self.ctx.local.delete_final(&pair.local_path)?;
        self.ctx.local.set_remote_id(tmp, &remote_ref)?;
        let moved = self.ctx.local.move_to(tmp, parent, Some(name))?;
        if let Some(mtime) = pair.last_remote_updated {
            self.ctx.local.change_file_date(&moved.path, mtime)?;
        }
        let info = self.ctx.local.get_info(&moved.path)?;

        pair.local_digest = info.get_digest(self.ctx.local.digest_algorithm(), Some(&self.cancel))?;
        self.ctx.store.update_last_transfer(pair.id, Transfer::Download)?;
        self.refresh_local_state(pair, &info)
    }

    pub(super) async fn synchronize_remotely_modified(&mut self, mut pair: DocPair) -> Result<()> {
        if let Some(parent_path) = pair.remote_parent_path.as_deref() {
            if self.ctx.store.is_filter(parent_path) {
                debug!("{} moved into a filtered folder, deleting it locally", pair);
                return self.synchronize_remotely_deleted(pair).await;
            }
        }

        let mut folder_locked = false;
        let result = self.apply_remote_modification(&mut pair, &mut folder_locked).await;
        if folder_locked {
            self.ctx.folder_lock.release();
        }
        result
    }

    async fn apply_remote_modification(&mut self, pair: &mut DocPair, folder_locked: &mut bool) -> Result<()> {
        let remote_name = pair.remote_name.clone().unwrap_or_default();
        let is_renaming = safe_filename(&remote_name) != pair.local_name.as_deref().unwrap_or_default();

        let content_changed = !pair.folderish
            && pair.local_digest.is_some()
            && !self.ctx.local.is_equal_digests(
                pair.local_digest.as_deref(),
                pair.remote_digest.as_deref(),
                &pair.local_path,
                None,
                Some(&self.cancel),
            )?;

        if content_changed {
            self.update_remotely(pair, is_renaming).await?;
        } else {
            let local_parent = self.ctx.store.get_state_from_local(&pair.local_parent_path)?;
            let Some(new_parent) = self.get_normal_state_from_remote_ref(pair.remote_parent_ref.as_deref())?
            else {
                return Err(SyncError::parent_not_synced(
                    pair.local_path.clone(),
                    pair.remote_parent_ref.clone().unwrap_or_default(),
                ));
            };
            let is_move = local_parent.map_or(false, |p| p.id != new_parent.id);

            if is_move || is_renaming {
                if pair.folderish {
                    self.set_local_folder_lock(&pair.local_path).await?;
                    *folder_locked = true;
                }
                let info = if is_move {
                    let name = if is_renaming {
                        remote_name.clone()
                    } else {
                        pair.name().to_string()
                    };
                    info!("Moving local {:?} into {:?}", pair.local_path, new_parent.local_path);
                    let info = self
                        .ctx
                        .local
                        .move_to(&pair.local_path, &new_parent.local_path, Some(&name))?;
                    self.ctx
                        .store
                        .update_remote_parent_path(pair, &new_parent.remote_path())?;
                    info
                } else {
                    info!("Renaming local {:?} to {:?}", pair.local_path, remote_name);
                    self.ctx.local.rename(&pair.local_path, &remote_name)?
                };
                self.ctx
                    .store
                    .update_local_parent_path(pair, &info.name, &parent_path(&info.path))?;
                self.search_for_dedup(pair, None)?;
                self.refresh_local_state(pair, &info)?;
            } else {
                debug!("No local impact of metadata update on {}", pair);
            }
        }

        self.handle_readonly(pair)?;
        if !self.ctx.store.synchronize_state(pair, None, false)? {
            debug!("{} changed while it was processed", pair);
        }
        Ok(())
    }

    pub(super) async fn synchronize_remotely_created(&mut self, mut pair: DocPair) -> Result<()> {
        let name = pair.remote_name.clone().unwrap_or_default();
        let remote_ref = pair
            .remote_ref
            .clone()
            .ok_or_else(|| SyncError::IllegalState(format!("no remote ref on {}", pair)))?;

        let Some(parent) = self.get_normal_state_from_remote_ref(pair.remote_parent_ref.as_deref())? else {
            return Err(SyncError::parent_not_synced(name, remote_ref));
        };
        if parent.pair_state == PairState::Unsynchronized {
            debug!("Parent of {} is unsynchronized", pair);
            self.ctx.store.unsynchronize_state(&pair, Some("PARENT_UNSYNC"), false)?;
            return Ok(());
        }
        if self.ctx.store.is_filter(&pair.remote_path()) {
            debug!("Skipping filtered {}", pair);
            self.ctx.store.remove_state(&pair, false, true)?;
            return Ok(());
        }

        let path = if !self.ctx.local.exists(&pair.local_path) {
            // Same name but another item: wait for the parent to be sorted out
            if self.ctx.local.get_remote_id(&parent.local_path) != parent.remote_ref {
                return Err(SyncError::parent_not_synced(pair.local_path.clone(), parent.local_path.clone()));
            }
            match self.create_remotely(&pair, &parent, &name).await {
                Ok(path) => path,
                Err(SyncError::Client(ClientError::NotFound(reference))) => {
                    debug!("{} vanished from the server ({})", pair, reference);
                    return self.synchronize_remotely_deleted(pair).await;
                }
                Err(e) => return Err(e),
            }
        } else {
            match self.ctx.local.get_remote_id(&pair.local_path) {
                Some(bound) if bound == remote_ref => {
                    info!("{} already exists locally, setting it conflicted", pair);
                    self.ctx.store.set_conflict_state(&pair)?;
                    return Ok(());
                }
                Some(_) => self.create_remotely(&pair, &parent, &name).await?,
                None => pair.local_path.clone(),
            }
        };

        self.ctx.local.set_remote_id(&path, &remote_ref)?;
        if path != pair.local_path && pair.folderish {
            self.ctx
                .store
                .update_local_parent_path(&pair, basename(&path), &parent_path(&path))?;
        }
        let info = self.ctx.local.get_info(&path)?;
        self.refresh_local_state(&mut pair, &info)?;
        self.handle_readonly(&pair)?;
        if self.ctx.store.synchronize_state(&pair, None, false)? {
            return Ok(());
        }

        debug!("{} changed while it was created locally", pair);
        let Some(fresh) = self.ctx.store.get_state_from_id(pair.id)? else {
            return Ok(());
        };
        if fresh.local_state == SideState::Moved {
            self.synchronize_locally_moved(fresh, false).await
        } else if fresh.remote_state == SideState::Deleted {
            self.synchronize_remotely_deleted(fresh).await
        } else {
            self.synchronize_remotely_modified(fresh).await
        }
    }

    /// Create the local item of `pair` under `parent`, returning its path.
    async fn create_remotely(&mut self, pair: &DocPair, parent: &DocPair, name: &str) -> Result<String> {
        let parent_path = parent.local_path.clone();
        self.ctx.readonly_locks.unlock(&self.ctx.local, &parent_path)?;
        let result = self.create_local_item(pair, &parent_path, name).await;
        let relocked = self.ctx.readonly_locks.lock(&self.ctx.local, &parent_path);
        let path = result?;
        relocked?;
        Ok(path)
    }

    async fn create_local_item(&mut self, pair: &DocPair, parent: &str, name: &str) -> Result<String> {
        if pair.folderish {
            info!("Creating local folder {:?} in {:?}", name, parent);
            return Ok(self.ctx.local.make_folder(parent, name)?);
        }

        let (_, _, name) = self.ctx.local.get_new_file(parent, name)?;
        info!("Creating local file {:?} in {:?}", name, parent);
        let tmp = child_path(parent, &download_tmp_name(&name));
        if let Err(e) = self.download_content(pair, &tmp).await {
            self.discard_tmp(&tmp);
            return Err(e);
        }
        let remote_ref = pair.remote_ref.as_deref().unwrap_or_default();
        self.ctx.local.set_remote_id(&tmp, remote_ref)?;
        let info = self.ctx.local.move_to(&tmp, parent, Some(&name))?;
        if let Some(mtime) = pair.last_remote_updated {
            self.ctx.local.change_file_date(&info.path, mtime)?;
        }
        self.ctx.store.update_last_transfer(pair.id, Transfer::Download)?;
        Ok(info.path)
    }

    pub(super) async fn synchronize_remotely_deleted(&mut self, pair: DocPair) -> Result<()> {
        let bound = self.ctx.local.get_remote_id(&pair.local_path);
        if bound.is_some() && bound != pair.remote_ref {
            warn!(
                "Not deleting {:?}: bound to {:?} instead of {:?}",
                pair.local_path, bound, pair.remote_ref
            );
            self.ctx.store.remove_state(&pair, false, true)?;
            return Ok(());
        }
        if pair.local_state == SideState::Unsynchronized {
            self.ctx.store.remove_state(&pair, false, true)?;
            return Ok(());
        }

        let mut folder_locked = false;
        let result = self.delete_locally(&pair, &mut folder_locked).await;
        if folder_locked {
            self.ctx.folder_lock.release();
        }
        result
    }

    async fn delete_locally(&mut self, pair: &DocPair, folder_locked: &mut bool) -> Result<()> {
        if pair.local_state != SideState::Deleted {
            info!("Deleting locally {:?}", pair.local_path);
            if pair.folderish {
                self.set_local_folder_lock(&pair.local_path).await?;
                *folder_locked = true;
            } else {
                let tmp = child_path(&pair.local_parent_path, &download_tmp_name(pair.name()));
                if self.ctx.local.exists(&tmp) {
                    self.discard_tmp(&tmp);
                }
            }
            if self.ctx.use_trash() {
                self.ctx.local.delete(&pair.local_path)?;
            } else {
                self.ctx.local.delete_final(&pair.local_path)?;
            }
        }
        self.ctx.store.remove_state(pair, false, true)?;
        self.search_for_dedup(pair, None)
    }
}
