//! Extended attribute storage for remote identifiers.
//!
//! GNU/Linux stores them in the `user.` namespace, macOS uses the bare name,
//! Windows uses an NTFS alternate data stream `path:name`.

use std::io;
use std::path::Path;

/// Attribute holding the remote ref of a synchronized item.
pub const REMOTE_ID: &str = "nxdrive";
/// Attribute holding the remote ref of the sync root.
pub const ROOT_ID: &str = "nxdriveroot";

pub const EDIT_SERVER_URL: &str = "nxdriveedit";
pub const EDIT_USER: &str = "nxdrivedituser";
pub const EDIT_DIGEST: &str = "nxdriveeditdigest";
pub const EDIT_DIGEST_ALGORITHM: &str = "nxdriveeditdigestalgorithm";
pub const EDIT_NAME: &str = "nxdriveeditname";
pub const EDIT_XPATH: &str = "nxdriveeditxpath";
pub const EDIT_LOCK: &str = "nxdriveeditlock";

#[cfg(unix)]
fn os_name(name: &str) -> String {
    if cfg!(target_os = "macos") {
        name.to_string()
    } else {
        format!("user.{}", name)
    }
}

#[cfg(unix)]
pub fn get(path: &Path, name: &str) -> Option<String> {
    match xattr::get(path, os_name(name)) {
        Ok(Some(value)) => String::from_utf8(value).ok(),
        _ => None,
    }
}

#[cfg(unix)]
pub fn set(path: &Path, name: &str, value: &str) -> io::Result<()> {
    xattr::set(path, os_name(name), value.as_bytes())
}

#[cfg(unix)]
pub fn remove(path: &Path, name: &str) -> io::Result<()> {
    match xattr::remove(path, os_name(name)) {
        Ok(()) => Ok(()),
        Err(e) if is_missing_attribute(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn is_missing_attribute(e: &io::Error) -> bool {
    #[cfg(target_os = "macos")]
    let missing = libc::ENOATTR;
    #[cfg(not(target_os = "macos"))]
    let missing = libc::ENODATA;
    e.raw_os_error() == Some(missing)
}

#[cfg(windows)]
fn stream_path(path: &Path, name: &str) -> std::path::PathBuf {
    let mut stream = path.as_os_str().to_owned();
    stream.push(":");
    stream.push(name);
    stream.into()
}

#[cfg(windows)]
pub fn get(path: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(stream_path(path, name)).ok()
}

#[cfg(windows)]
pub fn set(path: &Path, name: &str, value: &str) -> io::Result<()> {
    if !path.exists() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
    }
    std::fs::write(stream_path(path, name), value)
}

#[cfg(windows)]
pub fn remove(path: &Path, name: &str) -> io::Result<()> {
    match std::fs::remove_file(stream_path(path, name)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
