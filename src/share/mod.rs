use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const READ_BUF_SIZE: usize = 64 * 1024; // 64 KB reads

/// One file of the local share directory as registered with the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub name: String,
    pub hash: String,
    pub size: u64,
}

/// Content digest used when indexing files
pub trait FileDigest: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hex digest of everything `reader` yields
    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<String>;

    fn hash_file(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path).map_err(|e| Error::local_file(path, e))?;
        self.hash_reader(&mut file)
            .map_err(|e| Error::local_file(path, e))
    }
}

pub struct Blake3Digest;

impl FileDigest for Blake3Digest {
    fn name(&self) -> &'static str {
        "blake3"
    }

    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<String> {
        let mut hasher = blake3::Hasher::new();
        for_each_block(reader, |block| {
            hasher.update(block);
        })?;
        Ok(hasher.finalize().to_hex().to_string())
    }
}

pub struct Sha256Digest;

impl FileDigest for Sha256Digest {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<String> {
        let mut hasher = Sha256::new();
        for_each_block(reader, |block| hasher.update(block))?;
        Ok(hex::encode(hasher.finalize()))
    }
}

fn for_each_block(reader: &mut dyn Read, mut f: impl FnMut(&[u8])) -> io::Result<()> {
    let mut buffer = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        f(&buffer[..n]);
    }
}

/// Digest selected in the config file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    #[default]
    Blake3,
    Sha256,
}

impl DigestKind {
    pub fn digest(self) -> Box<dyn FileDigest> {
        match self {
            DigestKind::Blake3 => Box::new(Blake3Digest),
            DigestKind::Sha256 => Box::new(Sha256Digest),
        }
    }
}

/// Enumerate the regular files directly inside `dir`, sorted by name.
///
/// Names that cannot travel as a single protocol token are skipped.
pub fn scan(dir: &Path, digest: &dyn FileDigest) -> Result<Vec<SharedFile>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::local_file(dir, e))?;
    let mut files = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| Error::local_file(dir, e))?;
        let path = entry.path();
        let metadata = entry.metadata().map_err(|e| Error::local_file(&path, e))?;
        if !metadata.is_file() {
            continue;
        }

        let name = match entry.file_name().into_string() {
            Ok(name) if is_token(&name) => name,
            Ok(name) => {
                warn!(file = name.as_str(), "skipping file whose name contains spaces");
                continue;
            }
            Err(name) => {
                warn!(file = ?name, "skipping file with non UTF-8 name");
                continue;
            }
        };

        let hash = digest.hash_file(&path)?;
        debug!(file = name.as_str(), hash = hash.as_str(), size = metadata.len(), "hashed");
        files.push(SharedFile {
            name,
            hash,
            size: metadata.len(),
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Map a peer-supplied filename onto a path inside the share directory.
///
/// Only plain file names are accepted; separators and dot entries are refused.
pub fn resolve(share_dir: &Path, filename: &str) -> io::Result<PathBuf> {
    let plain = !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains(['/', '\\', '\0']);
    if !plain {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("filename {:?} is not a plain file name", filename),
        ));
    }
    Ok(share_dir.join(filename))
}

fn is_token(name: &str) -> bool {
    !name.is_empty() && !name.contains(char::is_whitespace)
}
