use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    fn from_hex_len(len: usize) -> Option<Self> {
        [HashAlgorithm::Sha256, HashAlgorithm::Sha512]
            .into_iter()
            .find(|a| a.hex_len() == len)
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A content hash, stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl ContentHash {
    pub fn of_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let hex = match algorithm {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        };
        Self { algorithm, hex }
    }

    pub fn of_file(algorithm: HashAlgorithm, path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
        let hex = match algorithm {
            HashAlgorithm::Sha256 => stream_hex::<Sha256>(file, path)?,
            HashAlgorithm::Sha512 => stream_hex::<Sha512>(file, path)?,
        };
        Ok(Self { algorithm, hex })
    }

    /// True when `path` exists and hashes to `self`.
    pub fn matches_file(&self, path: &Path) -> Result<bool> {
        if !path.is_file() {
            return Ok(false);
        }
        Ok(Self::of_file(self.algorithm, path)? == *self)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    // Accepts "<alg>:<hex>" or bare hex, where the algorithm follows from the length.
    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("hash is empty"));
        }
        let (algorithm, hex) = match raw.split_once(':') {
            Some((name, hex)) => {
                let alg = HashAlgorithm::from_name(&name.to_ascii_lowercase()).ok_or_else(|| {
                    Error::config(format!("unknown hash algorithm '{name}' in '{raw}'"))
                })?;
                (alg, hex)
            }
            None => {
                let alg = HashAlgorithm::from_hex_len(raw.len()).ok_or_else(|| {
                    Error::config(format!(
                        "cannot infer hash algorithm for '{raw}' ({} hex chars)",
                        raw.len()
                    ))
                })?;
                (alg, raw)
            }
        };
        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::config(format!(
                "invalid {} hash '{}'",
                algorithm, hex
            )));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

fn stream_hex<D: Digest>(mut file: fs::File, path: &Path) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parses_prefixed_and_bare_hex() {
        let a: ContentHash = format!("sha256:{EMPTY_SHA256}").parse().expect("prefixed");
        let b: ContentHash = EMPTY_SHA256.to_uppercase().parse().expect("bare");
        assert_eq!(a, b);
        assert_eq!(a.algorithm, HashAlgorithm::Sha256);
    }

    #[test]
    fn rejects_bad_hashes() {
        assert!("".parse::<ContentHash>().is_err());
        assert!("md5:abcd".parse::<ContentHash>().is_err());
        assert!("abcd".parse::<ContentHash>().is_err());
        assert!(format!("sha512:{EMPTY_SHA256}").parse::<ContentHash>().is_err());
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("f");
        fs::write(&p, b"hello").expect("write");
        let expected = ContentHash::of_bytes(HashAlgorithm::Sha256, b"hello");
        assert!(expected.matches_file(&p).expect("hash"));
        assert!(!expected.matches_file(&tmp.path().join("missing")).expect("missing"));
        let empty: ContentHash = EMPTY_SHA256.parse().expect("parse");
        assert_eq!(ContentHash::of_bytes(HashAlgorithm::Sha256, b""), empty);
    }
}
