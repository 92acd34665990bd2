//! Filesystem access under a sync root.
//!
//! Every path handled here is relative to the root, `/` separated and starts
//! with `/`. Remote identifiers live in extended attributes so that a file
//! keeps its binding across renames and moves done by the user.

pub mod xattr;

use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use unicode_normalization::{is_nfc, UnicodeNormalization};

use crate::digest::DigestAlgorithm;
use crate::errors::{ClientError, Result};
use crate::info::LocalFileInfo;
use crate::names::{
    child_path, is_temp_file, next_dedup_name, parent_path, safe_filename, split_ext,
    IgnoreRules, CASE_RENAME_PREFIX, ROOT,
};

/// The path itself was readonly and has been unlocked.
pub const LOCKED_SELF: u8 = 1;
/// The parent folder was readonly and has been unlocked.
pub const LOCKED_PARENT: u8 = 2;

/// Client for the local side of an engine.
#[derive(Debug)]
pub struct LocalClient {
    base_folder: PathBuf,
    digest_algorithm: DigestAlgorithm,
    ignore: IgnoreRules,
    disable_duplication: bool,
    trash_folder: Option<PathBuf>,
    case_sensitive: OnceLock<bool>,
}

impl LocalClient {
    pub fn new(base_folder: impl Into<PathBuf>) -> Self {
        Self {
            base_folder: base_folder.into(),
            digest_algorithm: DigestAlgorithm::Md5,
            ignore: IgnoreRules::default(),
            disable_duplication: false,
            trash_folder: None,
            case_sensitive: OnceLock::new(),
        }
    }

    pub fn with_digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }

    pub fn with_ignore_rules(mut self, ignore: IgnoreRules) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_duplication_disabled(mut self, disabled: bool) -> Self {
        self.disable_duplication = disabled;
        self
    }

    /// Deleted items are moved into `trash` instead of being removed.
    pub fn with_trash(mut self, trash: Option<PathBuf>) -> Self {
        self.trash_folder = trash;
        self
    }

    pub fn with_case_sensitivity(self, sensitive: bool) -> Self {
        let _ = self.case_sensitive.set(sensitive);
        self
    }

    pub fn base_folder(&self) -> &Path {
        &self.base_folder
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest_algorithm
    }

    pub fn ignore_rules(&self) -> &IgnoreRules {
        &self.ignore
    }

    /// Probe the filesystem once with a temporary folder.
    pub fn is_case_sensitive(&self) -> bool {
        *self.case_sensitive.get_or_init(|| {
            let name = format!(".caseTest_{}", uuid::Uuid::new_v4().simple());
            let probe = self.base_folder.join(&name);
            if fs::create_dir(&probe).is_err() {
                return true;
            }
            let sensitive = !self.base_folder.join(name.to_uppercase()).exists();
            if let Err(e) = fs::remove_dir(&probe) {
                warn!("Cannot remove case probe {}: {}", probe.display(), e);
            }
            sensitive
        })
    }

    pub fn is_ignored(&self, parent_ref: &str, name: &str) -> bool {
        self.ignore.is_ignored(parent_ref, name)
    }

    pub fn is_temp_file(&self, name: &str) -> bool {
        is_temp_file(name)
    }

    /// Absolute OS path of a local ref.
    pub fn abspath(&self, reference: &str) -> Result<PathBuf> {
        if !reference.starts_with('/') {
            return Err(ClientError::InvalidArgument(format!(
                "local ref must start with '/': {}",
                reference
            )));
        }
        let mut path = self.base_folder.clone();
        for part in reference.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        Ok(path)
    }

    pub fn is_inside(&self, abspath: &Path) -> bool {
        abspath.starts_with(&self.base_folder)
    }

    /// Local ref of an absolute OS path under the root.
    pub fn get_path(&self, abspath: &Path) -> Option<String> {
        let relative = abspath.strip_prefix(&self.base_folder).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            Some(ROOT.to_string())
        } else {
            Some(format!("/{}", parts.join("/")))
        }
    }

    pub fn exists(&self, reference: &str) -> bool {
        self.abspath(reference).map(|p| p.exists()).unwrap_or(false)
    }

    /// Always true: a missing write permission surfaces as a permission
    /// error on the actual write.
    pub fn check_writable(&self, _reference: &str) -> bool {
        true
    }

    pub fn get_info(&self, reference: &str) -> Result<LocalFileInfo> {
        self.try_get_info(reference)?
            .ok_or_else(|| ClientError::NotFound(format!("{} under {}", reference, self.base_folder.display())))
    }

    pub fn try_get_info(&self, reference: &str) -> Result<Option<LocalFileInfo>> {
        let mut reference = reference.to_string();
        let mut os_path = self.abspath(&reference)?;
        let metadata = match fs::metadata(&os_path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Force NFC names on disk so both sides compare equal
        if !cfg!(target_os = "macos") && !is_nfc(&reference) {
            let normalized: String = reference.nfc().collect();
            let target = self.abspath(&normalized)?;
            debug!("Forcing normalization of {} to {}", os_path.display(), target.display());
            fs::rename(&os_path, &target)?;
            reference = normalized;
            os_path = target;
        }

        let folderish = metadata.is_dir();
        let mtime: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH));
        let name = if reference == ROOT {
            String::new()
        } else {
            crate::names::basename(&reference).to_string()
        };
        Ok(Some(LocalFileInfo {
            root: self.base_folder.clone(),
            remote_ref: xattr::get(&os_path, xattr::REMOTE_ID),
            size: if folderish { 0 } else { metadata.len() },
            path: reference,
            name,
            folderish,
            last_modification_time: mtime,
            filepath: os_path,
        }))
    }

    /// Sorted children, skipping ignored and temporary download files.
    pub fn get_children_info(&self, reference: &str) -> Result<Vec<LocalFileInfo>> {
        let os_path = self.abspath(reference)?;
        let mut names: Vec<String> = fs::read_dir(&os_path)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        let mut result = Vec::with_capacity(names.len());
        for name in names {
            if self.is_ignored(reference, &name) || is_temp_file(&name) {
                continue;
            }
            // Deleted in the meantime
            match self.try_get_info(&child_path(reference, &name)) {
                Ok(Some(info)) => result.push(info),
                Ok(None) => {}
                Err(e) => trace!("Skipping child {} of {}: {}", name, reference, e),
            }
        }
        Ok(result)
    }

    /// Compare digests, recomputing the local one with the remote algorithm
    /// when they differ.
    pub fn is_equal_digests(
        &self,
        local_digest: Option<&str>,
        remote_digest: Option<&str>,
        local_path: &str,
        remote_algorithm: Option<DigestAlgorithm>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        if local_digest == remote_digest {
            return Ok(true);
        }
        let Some(remote_digest) = remote_digest else {
            return Ok(false);
        };
        let algorithm = remote_algorithm
            .or_else(|| DigestAlgorithm::guess(remote_digest))
            .unwrap_or_default();
        if algorithm == self.digest_algorithm {
            return Ok(false);
        }
        let digest = self.get_info(local_path)?.get_digest(algorithm, cancel)?;
        Ok(digest.as_deref() == Some(remote_digest))
    }

    pub fn get_remote_id(&self, reference: &str) -> Option<String> {
        self.get_remote_id_named(reference, xattr::REMOTE_ID)
    }

    pub fn get_remote_id_named(&self, reference: &str, name: &str) -> Option<String> {
        let path = self.abspath(reference).ok()?;
        xattr::get(&path, name)
    }

    pub fn set_remote_id(&self, reference: &str, remote_id: &str) -> Result<()> {
        self.set_remote_id_named(reference, remote_id, xattr::REMOTE_ID)
    }

    /// Store an attribute without touching the modification time.
    pub fn set_remote_id_named(&self, reference: &str, value: &str, name: &str) -> Result<()> {
        let path = self.abspath(reference)?;
        trace!("Setting xattr {} with value {:?} on {}", name, value, path.display());
        let metadata = fs::metadata(&path)?;
        let locker = self.unlock_path(&path, false)?;
        let result = xattr::set(&path, name, &crate::names::nfc(value)).map_err(|source| {
            ClientError::Xattr {
                path: path.display().to_string(),
                name: name.to_string(),
                source,
            }
        });
        let mtime = FileTime::from_last_modification_time(&metadata);
        let atime = FileTime::from_last_access_time(&metadata);
        if let Err(e) = filetime::set_file_times(&path, atime, mtime) {
            debug!("Cannot restore times of {}: {}", path.display(), e);
        }
        self.lock_path(&path, locker)?;
        result
    }

    pub fn remove_remote_id(&self, reference: &str) -> Result<()> {
        self.remove_remote_id_named(reference, xattr::REMOTE_ID)
    }

    pub fn remove_remote_id_named(&self, reference: &str, name: &str) -> Result<()> {
        let path = self.abspath(reference)?;
        trace!("Removing xattr {} from {}", name, path.display());
        let locker = self.unlock_path(&path, false)?;
        let result = xattr::remove(&path, name).map_err(|source| ClientError::Xattr {
            path: path.display().to_string(),
            name: name.to_string(),
            source,
        });
        self.lock_path(&path, locker)?;
        result
    }

    pub fn get_root_id(&self) -> Option<String> {
        self.get_remote_id_named(ROOT, xattr::ROOT_ID)
    }

    pub fn set_root_id(&self, value: &str) -> Result<()> {
        self.set_remote_id_named(ROOT, value, xattr::ROOT_ID)
    }

    pub fn remove_root_id(&self) -> Result<()> {
        self.remove_remote_id_named(ROOT, xattr::ROOT_ID)
    }

    /// Drop every binding attribute under the root, root included.
    pub fn clean_xattr_root(&self) -> Result<()> {
        self.unlock_ref(ROOT, false)?;
        if let Err(e) = self.remove_root_id() {
            debug!("Cannot remove root id: {}", e);
        }
        self.clean_xattr_folder_recursive(ROOT)
    }

    pub fn clean_xattr_folder_recursive(&self, reference: &str) -> Result<()> {
        for child in self.get_children_info(reference)? {
            let locker = self.unlock_ref(&child.path, false)?;
            if child.remote_ref.is_some() {
                self.remove_remote_id(&child.path)?;
            }
            self.lock_ref(&child.path, locker)?;
            if child.folderish {
                self.clean_xattr_folder_recursive(&child.path)?;
            }
        }
        Ok(())
    }

    pub fn is_readonly(&self, reference: &str) -> bool {
        self.abspath(reference)
            .ok()
            .and_then(|p| fs::metadata(p).ok())
            .map(|m| m.permissions().readonly())
            .unwrap_or(false)
    }

    pub fn set_readonly(&self, reference: &str) -> Result<()> {
        let path = self.abspath(reference)?;
        set_path_readonly(&path)
    }

    pub fn unset_readonly(&self, reference: &str) -> Result<()> {
        let path = self.abspath(reference)?;
        if path.exists() {
            unset_path_readonly(&path)?;
        }
        Ok(())
    }

    /// Make `reference` (and its parent when asked) writable, returning the
    /// [`LOCKED_SELF`]/[`LOCKED_PARENT`] flags to hand back to `lock_ref`.
    pub fn unlock_ref(&self, reference: &str, unlock_parent: bool) -> Result<u8> {
        let path = self.abspath(reference)?;
        self.unlock_path(&path, unlock_parent)
    }

    pub fn lock_ref(&self, reference: &str, locker: u8) -> Result<()> {
        let path = self.abspath(reference)?;
        self.lock_path(&path, locker)
    }

    fn unlock_path(&self, path: &Path, unlock_parent: bool) -> Result<u8> {
        let mut result = 0;
        if unlock_parent {
            if let Some(parent) = path.parent() {
                if is_path_readonly(parent) {
                    unset_path_readonly(parent)?;
                    result |= LOCKED_PARENT;
                }
            }
        }
        if is_path_readonly(path) {
            unset_path_readonly(path)?;
            result |= LOCKED_SELF;
        }
        Ok(result)
    }

    fn lock_path(&self, path: &Path, locker: u8) -> Result<()> {
        if locker & LOCKED_SELF != 0 && path.exists() {
            set_path_readonly(path)?;
        }
        if locker & LOCKED_PARENT != 0 {
            if let Some(parent) = path.parent() {
                set_path_readonly(parent)?;
            }
        }
        Ok(())
    }

    /// Absolute path for `name` under `parent`, appending `__N` to the stem
    /// until the name is free. `old_name` is accepted as is (renames).
    pub fn abspath_deduped(
        &self,
        parent: &str,
        orig_name: &str,
        old_name: Option<&str>,
    ) -> Result<(PathBuf, String)> {
        let safe = safe_filename(orig_name);
        let (stem, suffix) = split_ext(&safe);
        let (mut stem, suffix) = (stem.to_string(), suffix.to_string());
        for _ in 0..1000 {
            let name = format!("{}{}", stem, suffix);
            let os_path = self.abspath(&child_path(parent, &name))?;
            if old_name == Some(name.as_str()) || !os_path.exists() {
                return Ok((os_path, name));
            }
            if self.disable_duplication {
                return Err(ClientError::DuplicationDisabled(child_path(parent, &name)));
            }
            trace!("dedup: {} exists, trying next", os_path.display());
            stem = next_dedup_name(&stem);
        }
        Err(ClientError::InvalidArgument(format!(
            "failed to de-duplicate {} under {}",
            orig_name, parent
        )))
    }

    pub fn make_folder(&self, parent: &str, name: &str) -> Result<String> {
        let locker = self.unlock_ref(parent, false)?;
        let result = self.abspath_deduped(parent, name, None).and_then(|(os_path, name)| {
            fs::create_dir(&os_path)?;
            Ok(child_path(parent, &name))
        });
        self.lock_ref(parent, locker)?;
        result
    }

    pub fn make_file(&self, parent: &str, name: &str, content: Option<&[u8]>) -> Result<String> {
        let locker = self.unlock_ref(parent, false)?;
        let result = self.abspath_deduped(parent, name, None).and_then(|(os_path, name)| {
            fs::write(&os_path, content.unwrap_or_default())?;
            Ok(child_path(parent, &name))
        });
        self.lock_ref(parent, locker)?;
        result
    }

    /// Reserve a de-duplicated name without creating the file.
    pub fn get_new_file(&self, parent: &str, name: &str) -> Result<(String, PathBuf, String)> {
        let (os_path, name) = self.abspath_deduped(parent, name, None)?;
        Ok((child_path(parent, &name), os_path, name))
    }

    pub fn duplicate_file(&self, reference: &str) -> Result<String> {
        let parent = parent_path(reference);
        let name = crate::names::basename(reference).to_string();
        let locker = self.unlock_ref(&parent, false)?;
        let result = self.abspath_deduped(&parent, &name, None).and_then(|(os_path, name)| {
            fs::copy(self.abspath(reference)?, &os_path)?;
            Ok(child_path(&parent, &name))
        });
        self.lock_ref(&parent, locker)?;
        result
    }

    /// Rewrite the content, keeping the binding attribute.
    pub fn update_content(&self, reference: &str, content: &[u8]) -> Result<()> {
        let remote_id = self.get_remote_id(reference);
        fs::write(self.abspath(reference)?, content)?;
        if let Some(remote_id) = remote_id {
            self.set_remote_id(reference, &remote_id)?;
        }
        Ok(())
    }

    pub fn get_content(&self, reference: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.abspath(reference)?)?)
    }

    /// Remove an item, moving it to the trash folder when one is configured.
    pub fn delete(&self, reference: &str) -> Result<()> {
        if !self.exists(reference) {
            return Ok(());
        }
        let Some(trash) = self.trash_folder.as_ref() else {
            return self.delete_final(reference);
        };
        let locker = self.unlock_ref(reference, true)?;
        let os_path = self.abspath(reference)?;
        let name = crate::names::basename(reference);
        let target = trash.join(format!("{}_{}", uuid::Uuid::new_v4().simple(), name));
        trace!("Send {} to trash", os_path.display());
        let moved = fs::create_dir_all(trash).and_then(|_| fs::rename(&os_path, &target));
        if let Err(e) = moved {
            debug!("Cannot use trash for {}, delete it: {}", os_path.display(), e);
            self.delete_final(reference)?;
        }
        self.lock_ref(reference, locker & LOCKED_PARENT)
    }

    pub fn delete_final(&self, reference: &str) -> Result<()> {
        let parent = (reference != ROOT).then(|| parent_path(reference));
        let locker = match &parent {
            Some(parent) => self.unlock_ref(parent, false)?,
            None => 0,
        };
        self.unset_readonly(reference)?;
        let os_path = self.abspath(reference)?;
        let result = if os_path.is_dir() {
            make_tree_writable(&os_path);
            fs::remove_dir_all(&os_path)
        } else if os_path.exists() {
            fs::remove_file(&os_path)
        } else {
            Ok(())
        };
        if let Some(parent) = &parent {
            self.lock_ref(parent, locker)?;
        }
        Ok(result?)
    }

    /// Rename in place, returning the refreshed info.
    pub fn rename(&self, reference: &str, to_name: &str) -> Result<LocalFileInfo> {
        let new_name = safe_filename(to_name);
        let mut source = self.abspath(reference)?;
        let parent = parent_path(reference);
        let old_name = crate::names::basename(reference).to_string();
        let locker = self.unlock_ref(reference, true)?;

        let result = (|| -> Result<LocalFileInfo> {
            let (target, new_name) = if old_name != new_name
                && old_name.to_lowercase() == new_name.to_lowercase()
                && !self.is_case_sensitive()
            {
                // Case-only rename needs an intermediate name
                let temp = self.abspath(&child_path(
                    &parent,
                    &format!("{}{}_{}", CASE_RENAME_PREFIX, old_name, uuid::Uuid::new_v4().simple()),
                ))?;
                fs::rename(&source, &temp)?;
                source = temp;
                (self.abspath(&child_path(&parent, &new_name))?, new_name)
            } else {
                self.abspath_deduped(&parent, &new_name, Some(&old_name))?
            };
            if old_name != new_name {
                fs::rename(&source, &target)?;
            }
            self.get_info(&child_path(&parent, &new_name))
        })();

        self.lock_ref(reference, locker & LOCKED_PARENT)?;
        result
    }

    /// Move into another folder, optionally renaming at the same time.
    pub fn move_to(
        &self,
        reference: &str,
        new_parent: &str,
        name: Option<&str>,
    ) -> Result<LocalFileInfo> {
        if reference == ROOT {
            return Err(ClientError::InvalidArgument(
                "cannot move the top level folder".to_string(),
            ));
        }
        let locker = self.unlock_ref(reference, true)?;
        let new_locker = self.unlock_ref(new_parent, false)?;
        let name = name.unwrap_or_else(|| crate::names::basename(reference));

        let result = (|| -> Result<LocalFileInfo> {
            let source = self.abspath(reference)?;
            let (target, new_name) = self.abspath_deduped(new_parent, name, None)?;
            fs::rename(&source, &target)?;
            self.get_info(&child_path(new_parent, &new_name))
        })();

        self.lock_ref(reference, locker & LOCKED_PARENT)?;
        self.lock_ref(new_parent, (locker & LOCKED_SELF) | new_locker)?;
        result
    }

    /// Set the modification time (and access time) of an item.
    pub fn change_file_date(&self, reference: &str, mtime: DateTime<Utc>) -> Result<()> {
        let path = self.abspath(reference)?;
        let time = FileTime::from_unix_time(mtime.timestamp(), mtime.timestamp_subsec_nanos());
        filetime::set_file_times(&path, time, time)?;
        Ok(())
    }

    /// Creation marker used to order two files sharing a remote id.
    ///
    /// macOS compares inode numbers, Windows the creation time, other
    /// platforms the birth time when the filesystem records one, else 0.
    pub fn get_creation_time(&self, reference: &str) -> Result<u128> {
        let metadata = fs::metadata(self.abspath(reference)?)?;
        #[cfg(target_os = "macos")]
        {
            use std::os::unix::fs::MetadataExt;
            Ok(metadata.ino() as u128)
        }
        #[cfg(not(target_os = "macos"))]
        {
            Ok(metadata
                .created()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0))
        }
    }
}

fn is_path_readonly(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.permissions().readonly())
        .unwrap_or(false)
}

pub fn set_path_readonly(path: &Path) -> Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    if !permissions.readonly() {
        permissions.set_readonly(true);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

pub fn unset_path_readonly(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path)?;
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = permissions.mode() | 0o200;
            permissions.set_mode(mode);
        }
        #[cfg(not(unix))]
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

fn make_tree_writable(root: &Path) {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let _ = unset_path_readonly(&dir);
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let _ = unset_path_readonly(&path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn client(dir: &Path) -> LocalClient {
        LocalClient::new(dir)
    }

    #[test]
    fn test_paths() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        assert_eq!(local.abspath("/").unwrap(), dir.path());
        assert_eq!(local.abspath("/a/b.txt").unwrap(), dir.path().join("a").join("b.txt"));
        assert!(local.abspath("relative").is_err());
        assert_eq!(local.get_path(&dir.path().join("a").join("b")).as_deref(), Some("/a/b"));
        assert_eq!(local.get_path(dir.path()).as_deref(), Some("/"));
        assert_eq!(local.get_path(Path::new("/elsewhere")), None);
    }

    #[test]
    fn test_make_and_read() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        let folder = local.make_folder("/", "Docs").unwrap();
        assert_eq!(folder, "/Docs");
        let file = local.make_file(&folder, "report.txt", Some(b"hello\n")).unwrap();
        assert_eq!(file, "/Docs/report.txt");

        let info = local.get_info(&file).unwrap();
        assert!(!info.folderish);
        assert_eq!(info.size, 6);
        assert_eq!(info.name, "report.txt");
        assert_eq!(
            info.get_digest(DigestAlgorithm::Md5, None).unwrap().as_deref(),
            Some("b1946ac92492d2347c6235b4d2611184")
        );

        let children = local.get_children_info("/Docs").unwrap();
        assert_eq!(children.len(), 1);
        assert!(matches!(local.get_info("/missing"), Err(ClientError::NotFound(_))));
    }

    #[test]
    fn test_dedup_on_create() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        assert_eq!(local.make_file("/", "a.txt", None).unwrap(), "/a.txt");
        assert_eq!(local.make_file("/", "a.txt", None).unwrap(), "/a__1.txt");
        assert_eq!(local.make_file("/", "a.txt", None).unwrap(), "/a__2.txt");

        let strict = client(dir.path()).with_duplication_disabled(true);
        assert!(matches!(
            strict.make_file("/", "a.txt", None),
            Err(ClientError::DuplicationDisabled(_))
        ));
    }

    #[test]
    fn test_children_skip_ignored() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.make_file("/", "keep.txt", None).unwrap();
        local.make_file("/", ".hidden", None).unwrap();
        local.make_file("/", "~$lock.docx", None).unwrap();
        local.make_file("/", "swap.swp", None).unwrap();
        let names: Vec<_> = local
            .get_children_info("/")
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["keep.txt"]);
    }

    #[test]
    fn test_remote_id_keeps_mtime() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        let file = local.make_file("/", "a.txt", Some(b"x")).unwrap();
        let before = local.get_info(&file).unwrap().last_modification_time;
        local.set_remote_id(&file, "remote#1").unwrap();
        let info = local.get_info(&file).unwrap();
        assert_eq!(info.remote_ref.as_deref(), Some("remote#1"));
        assert_eq!(info.last_modification_time, before);
        local.remove_remote_id(&file).unwrap();
        assert_eq!(local.get_remote_id(&file), None);
    }

    #[test]
    fn test_rename_and_move() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.make_folder("/", "A").unwrap();
        local.make_folder("/", "B").unwrap();
        let file = local.make_file("/A", "x.txt", Some(b"x")).unwrap();
        local.set_remote_id(&file, "remote#x").unwrap();

        let renamed = local.rename(&file, "y:z.txt").unwrap();
        assert_eq!(renamed.path, "/A/y-z.txt");
        assert_eq!(renamed.remote_ref.as_deref(), Some("remote#x"));

        let moved = local.move_to(&renamed.path, "/B", None).unwrap();
        assert_eq!(moved.path, "/B/y-z.txt");
        assert!(!local.exists("/A/y-z.txt"));

        // Renaming to the current name is a no-op
        let same = local.rename("/B/y-z.txt", "y-z.txt").unwrap();
        assert_eq!(same.path, "/B/y-z.txt");
        assert!(local.move_to("/", "/B", None).is_err());
    }

    #[test]
    fn test_readonly_lock_flags() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.make_folder("/", "RO").unwrap();
        let file = local.make_file("/RO", "f.txt", None).unwrap();
        local.set_readonly(&file).unwrap();
        local.set_readonly("/RO").unwrap();
        assert!(local.is_readonly("/RO"));

        let locker = local.unlock_ref(&file, true).unwrap();
        assert_eq!(locker, LOCKED_SELF | LOCKED_PARENT);
        assert!(!local.is_readonly("/RO"));
        assert!(!local.is_readonly(&file));

        local.lock_ref(&file, locker).unwrap();
        assert!(local.is_readonly("/RO"));
        assert!(local.is_readonly(&file));

        local.delete_final("/RO").unwrap();
        assert!(!local.exists("/RO"));
    }

    #[test]
    fn test_delete_to_trash() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let trash = dir.path().join("trash");
        fs::create_dir(&root).unwrap();
        let local = LocalClient::new(&root).with_trash(Some(trash.clone()));
        let file = local.make_file("/", "old.txt", Some(b"old")).unwrap();
        local.delete(&file).unwrap();
        assert!(!local.exists(&file));
        assert_eq!(fs::read_dir(&trash).unwrap().count(), 1);
        // Deleting a missing item is fine
        local.delete("/missing").unwrap();
    }

    #[test]
    fn test_update_content_and_duplicate() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        let file = local.make_file("/", "a.txt", Some(b"one")).unwrap();
        local.set_remote_id(&file, "remote#a").unwrap();
        local.update_content(&file, b"two").unwrap();
        assert_eq!(local.get_content(&file).unwrap(), b"two");
        assert_eq!(local.get_remote_id(&file).as_deref(), Some("remote#a"));

        let copy = local.duplicate_file(&file).unwrap();
        assert_eq!(copy, "/a__1.txt");
        assert_eq!(local.get_content(&copy).unwrap(), b"two");
    }

    #[test]
    fn test_clean_xattr_root() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.set_root_id("server|user|engine|root").unwrap();
        local.make_folder("/", "A").unwrap();
        let file = local.make_file("/A", "f.txt", None).unwrap();
        local.set_remote_id("/A", "remote#A").unwrap();
        local.set_remote_id(&file, "remote#f").unwrap();

        local.clean_xattr_root().unwrap();
        assert_eq!(local.get_root_id(), None);
        assert_eq!(local.get_remote_id("/A"), None);
        assert_eq!(local.get_remote_id(&file), None);
    }

    #[test]
    fn test_equal_digests_with_other_algorithm() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        let file = local.make_file("/", "h.txt", Some(b"hello\n")).unwrap();
        let sha1 = "f572d396fae9206628714fb2ce00f72e94f2258f";
        assert!(local
            .is_equal_digests(Some("b1946ac92492d2347c6235b4d2611184"), Some(sha1), &file, None, None)
            .unwrap());
        assert!(!local
            .is_equal_digests(Some("b1946ac92492d2347c6235b4d2611184"), Some("0".repeat(32).as_str()), &file, None, None)
            .unwrap());
    }
}
