//! Content digests used to compare local files with server blobs.

use digest::DynDigest;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::errors::{ClientError, Result};
use crate::names::FILE_BUFFER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    /// Guess the algorithm from the hex digest length.
    pub fn guess(digest: &str) -> Option<Self> {
        match digest.len() {
            32 => Some(DigestAlgorithm::Md5),
            40 => Some(DigestAlgorithm::Sha1),
            64 => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            DigestAlgorithm::Md5 => Box::new(md5::Md5::default()),
            DigestAlgorithm::Sha1 => Box::new(sha1::Sha1::default()),
            DigestAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ClientError;

    /// Accepts server spellings such as `MD5`, `SHA-1` or `sha256`.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "").as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            other => Err(ClientError::InvalidArgument(format!(
                "unknown digest algorithm: {}",
                other
            ))),
        }
    }
}

/// Hex digest of in-memory content.
pub fn digest_bytes(data: &[u8], algorithm: DigestAlgorithm) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hex digest of a file, reading it by [`FILE_BUFFER_SIZE`] blocks.
///
/// The token is checked between blocks so that long computations can be
/// interrupted by a pause or a stop request.
pub fn compute_digest(
    path: &Path,
    algorithm: DigestAlgorithm,
    cancel: Option<&CancellationToken>,
) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; FILE_BUFFER_SIZE];
    loop {
        if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
            return Err(ClientError::Interrupted);
        }
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = hex::encode(hasher.finalize());
    trace!("Digest {} of {}: {}", algorithm, path.display(), digest);
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            digest_bytes(b"hello\n", DigestAlgorithm::Md5),
            "b1946ac92492d2347c6235b4d2611184"
        );
        assert_eq!(
            digest_bytes(b"hello\n", DigestAlgorithm::Sha1),
            "f572d396fae9206628714fb2ce00f72e94f2258f"
        );
    }

    #[test]
    fn test_parse_and_guess() {
        assert_eq!("SHA-1".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha1);
        assert_eq!("MD5".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Md5);
        assert!("crc32".parse::<DigestAlgorithm>().is_err());
        assert_eq!(
            DigestAlgorithm::guess("b1946ac92492d2347c6235b4d2611184"),
            Some(DigestAlgorithm::Md5)
        );
        assert_eq!(DigestAlgorithm::guess("abc"), None);
    }

    #[test]
    fn test_file_digest_and_cancel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.txt");
        File::create(&path).unwrap().write_all(b"hello\n").unwrap();

        let digest = compute_digest(&path, DigestAlgorithm::Md5, None).unwrap();
        assert_eq!(digest, "b1946ac92492d2347c6235b4d2611184");

        let token = CancellationToken::new();
        token.cancel();
        let result = compute_digest(&path, DigestAlgorithm::Md5, Some(&token));
        assert!(matches!(result, Err(ClientError::Interrupted)));
    }
}
