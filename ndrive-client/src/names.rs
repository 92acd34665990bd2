//! Naming rules shared by the local and remote sides: path helpers, invalid
//! character replacement, de-duplication suffixes and ignore patterns.

use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

/// Local path of the sync root itself.
pub const ROOT: &str = "/";

pub const DOWNLOAD_TMP_FILE_PREFIX: &str = ".";
pub const DOWNLOAD_TMP_FILE_SUFFIX: &str = ".nxpart";

/// Buffer size for transfers and digest computation.
pub const FILE_BUFFER_SIZE: usize = 1024 * 1024;

/// Digest placeholder for files that could not be read.
pub const UNACCESSIBLE_HASH: &str = "TO_COMPUTE";

pub const COLLECTION_SYNC_ROOT_FACTORY_NAME: &str = "collectionSyncRootFolderItemFactory";
pub const DEFAULT_REPOSITORY_NAME: &str = "default";
pub const CASE_RENAME_PREFIX: &str = "driveCaseRename_";

pub const DEFAULT_IGNORED_PREFIXES: &[&str] =
    &[".", "~", ".~", "~$", "Icon\r", "Thumbs.db", "desktop.ini"];

pub const DEFAULT_IGNORED_SUFFIXES: &[&str] = &[
    "~",
    ".tmp",
    ".swp",
    ".lock",
    ".LOCK",
    ".bak",
    ".part",
    ".partial",
    ".crdownload",
    ".nxpart",
    ".dwl",
    ".dwl2",
];

const INVALID_CHARS: &[char] = &['/', '\\', '*', ':', '|', '"', '<', '>', '?'];

fn deduped_basename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*)__(\d{1,3})$").expect("valid regex"))
}

fn text_edit_tmp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".*\.rtf\.sb-(\w)+-(\w)+$").expect("valid regex"))
}

fn autocad_tmp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^atmp\d+$").expect("valid regex"))
}

/// Replace characters the server refuses in file names by `-`.
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| if INVALID_CHARS.contains(&c) { '-' } else { c })
        .collect()
}

pub fn nfc(value: &str) -> String {
    value.nfc().collect()
}

/// Parent of a local path. The root's parent is the empty string.
pub fn parent_path(path: &str) -> String {
    if path == ROOT || path.is_empty() {
        return String::new();
    }
    match path.rfind('/') {
        Some(0) | None => ROOT.to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

pub fn child_path(parent: &str, name: &str) -> String {
    if parent == ROOT || parent.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// True when `path` is `ancestor` or lives below it.
pub fn is_under(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return path.starts_with('/');
    }
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Split `name` into stem and extension the way `os.path.splitext` does:
/// a leading dot does not start an extension.
pub fn split_ext(name: &str) -> (&str, &str) {
    let trimmed = name.trim_start_matches('.');
    let offset = name.len() - trimmed.len();
    match trimmed.rfind('.') {
        Some(idx) => name.split_at(offset + idx),
        None => (name, ""),
    }
}

/// Next candidate in the `stem__N` de-duplication sequence.
pub fn next_dedup_name(stem: &str) -> String {
    if let Some(caps) = deduped_basename_re().captures(stem) {
        let short = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let increment: u32 = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        format!("{}__{}", short, increment + 1)
    } else {
        format!("{}__1", stem)
    }
}

/// Whether the stem carries a de-duplication suffix.
pub fn is_deduped_name(name: &str) -> bool {
    let (stem, _) = split_ext(name);
    deduped_basename_re().is_match(stem)
}

/// Download temporary files: `.{name}.nxpart`.
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with(DOWNLOAD_TMP_FILE_PREFIX) && name.ends_with(DOWNLOAD_TMP_FILE_SUFFIX)
}

pub fn download_tmp_name(name: &str) -> String {
    format!("{}{}{}", DOWNLOAD_TMP_FILE_PREFIX, name, DOWNLOAD_TMP_FILE_SUFFIX)
}

pub fn is_text_edit_tmp_file(name: &str) -> bool {
    text_edit_tmp_re().is_match(name)
}

/// Office and LibreOffice lock files.
pub fn is_lock_file(name: &str) -> bool {
    name.starts_with("~$") || name.starts_with(".~lock.")
}

/// Guess temporary files generated by third party software.
///
/// Returns `(is_tmp, recheck_later)`; `recheck_later` is only meaningful when
/// the file is temporary.
pub fn is_generated_tmp_file(name: &str) -> (bool, bool) {
    if DEFAULT_IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        return (true, false);
    }
    if !name.contains('.') {
        // MS Office writes 8 hex digit names while saving
        if name.len() == 8 && name.chars().all(|c| c.is_ascii_hexdigit()) {
            return (true, true);
        }
        if autocad_tmp_re().is_match(&name.to_lowercase()) {
            return (true, false);
        }
    }
    (false, false)
}

/// Prefix/suffix based ignore list.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    pub prefixes: Vec<String>,
    pub suffixes: Vec<String>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            prefixes: DEFAULT_IGNORED_PREFIXES.iter().map(|s| s.to_string()).collect(),
            suffixes: DEFAULT_IGNORED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl IgnoreRules {
    pub fn new(prefixes: Option<Vec<String>>, suffixes: Option<Vec<String>>) -> Self {
        let defaults = Self::default();
        Self {
            prefixes: prefixes.unwrap_or(defaults.prefixes),
            suffixes: suffixes.unwrap_or(defaults.suffixes),
        }
    }

    pub fn is_ignored_name(&self, name: &str) -> bool {
        // Office temp files and Emacs auto-save files
        if name.starts_with('~') && name.ends_with(".tmp") {
            return true;
        }
        if name.len() > 2 && name.starts_with('#') && name.ends_with('#') {
            return true;
        }
        self.suffixes.iter().any(|s| name.ends_with(s.as_str()))
            || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    /// Whether `name` under `parent` is ignored, checking every ancestor too.
    pub fn is_ignored(&self, parent: &str, name: &str) -> bool {
        if self.is_ignored_name(name) {
            return true;
        }
        let mut current = parent.to_string();
        while !current.is_empty() && current != ROOT {
            if self.is_ignored_name(basename(&current)) {
                return true;
            }
            current = parent_path(&current);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_path("/"), "");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/a/b/c.txt"), "/a/b");
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/a", "b"), "/a/b");
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert!(is_under("/a/b", "/a"));
        assert!(is_under("/a", "/a"));
        assert!(!is_under("/ab", "/a"));
        assert!(is_under("/anything", "/"));
    }

    #[test]
    fn test_split_ext() {
        assert_eq!(split_ext("report.txt"), ("report", ".txt"));
        assert_eq!(split_ext("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_ext(".bashrc"), (".bashrc", ""));
        assert_eq!(split_ext("noext"), ("noext", ""));
    }

    #[test]
    fn test_dedup_names() {
        assert_eq!(next_dedup_name("report"), "report__1");
        assert_eq!(next_dedup_name("report__1"), "report__2");
        assert_eq!(next_dedup_name("report__999"), "report__1000");
        assert!(is_deduped_name("report__3.txt"));
        assert!(!is_deduped_name("report.txt"));
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("a/b:c*d?.txt"), "a-b-c-d-.txt");
        assert_eq!(safe_filename(r#"x<y>"z|\"#), "x-y--z--");
        assert_eq!(safe_filename("plain.txt"), "plain.txt");
    }

    #[test]
    fn test_ignore_rules() {
        let rules = IgnoreRules::default();
        assert!(rules.is_ignored_name(".hidden"));
        assert!(rules.is_ignored_name("~$report.docx"));
        assert!(rules.is_ignored_name("file.swp"));
        assert!(rules.is_ignored_name("#autosave#"));
        assert!(rules.is_ignored_name("Thumbs.db"));
        assert!(rules.is_ignored_name("drawing.dwl2"));
        assert!(!rules.is_ignored_name("report.txt"));
        assert!(rules.is_ignored("/.git/objects", "abc"));
        assert!(!rules.is_ignored("/docs", "abc"));
    }

    #[test]
    fn test_tmp_files() {
        assert!(is_temp_file(".report.txt.nxpart"));
        assert!(!is_temp_file("report.txt"));
        assert_eq!(is_generated_tmp_file("A1B2C3D4"), (true, true));
        assert_eq!(is_generated_tmp_file("atmp1234"), (true, false));
        assert_eq!(is_generated_tmp_file("report.tmp"), (true, false));
        assert_eq!(is_generated_tmp_file("report.txt"), (false, false));
        assert!(is_text_edit_tmp_file("notes.rtf.sb-1a2b-Xy9"));
        assert!(is_lock_file(".~lock.memo.odt#"));
    }

    proptest! {
        #[test]
        fn safe_filename_never_keeps_invalid_chars(name in ".*") {
            let safe = safe_filename(&name);
            prop_assert!(!safe.chars().any(|c| INVALID_CHARS.contains(&c)));
            prop_assert_eq!(safe.chars().count(), name.chars().count());
        }

        #[test]
        fn safe_filename_is_idempotent(name in ".*") {
            let once = safe_filename(&name);
            prop_assert_eq!(safe_filename(&once), once.clone());
        }
    }
}
