//! Sealed, read-only output of a package.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempDir};

use crate::error::{Error, IoContext, Result};

/// Byte-exact snapshot of a package at seal time.
///
/// The stream can be taken once. Holding an `Archive` keeps the owning
/// package's working directory alive, even after the package is closed.
#[derive(Debug)]
pub struct Archive {
    file: NamedTempFile,
    size: u64,
    consumed: bool,
    _workdir: Arc<TempDir>,
}

impl Archive {
    pub(crate) fn new(file: NamedTempFile, workdir: Arc<TempDir>) -> Result<Self> {
        let size = file
            .as_file()
            .metadata()
            .io_context(|| format!("reading size of {}", file.path().display()))?
            .len();
        Ok(Self {
            file,
            size,
            consumed: false,
            _workdir: workdir,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Take the archive stream. A second call fails with `StreamConsumed`.
    pub fn reader(&mut self) -> Result<File> {
        if self.consumed {
            return Err(Error::StreamConsumed);
        }
        let mut file = self
            .file
            .reopen()
            .io_context(|| format!("reopening {}", self.file.path().display()))?;
        file.seek(SeekFrom::Start(0))
            .io_context(|| "rewinding archive stream")?;
        self.consumed = true;
        Ok(file)
    }

    /// Hex sha256 of the sealed bytes.
    pub fn sha256(&self) -> Result<String> {
        sha256_file(self.file.path())
    }

    /// Write the archive to `dest`, replacing whatever is there.
    pub fn persist(self, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .io_context(|| format!("creating directory {}", parent.display()))?;
        }
        let size = self.size;
        match self.file.persist(dest) {
            Ok(_) => Ok(size),
            // Rename fails across filesystems (EXDEV); fall back to a copy.
            Err(e) => {
                fs::copy(e.file.path(), dest).io_context(|| {
                    format!("copying {} to {}", e.file.path().display(), dest.display())
                })?;
                Ok(size)
            }
        }
    }

    /// Release the sealed file now instead of at drop.
    pub fn close(self) -> Result<()> {
        let path = self.file.path().to_path_buf();
        self.file
            .close()
            .io_context(|| format!("removing {}", path.display()))
    }
}

pub(crate) fn sha256_reader(reader: &mut dyn Read) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).io_context(|| format!("opening {}", path.display()))?;
    let (sha, _) = sha256_reader(&mut BufReader::new(f))
        .io_context(|| format!("hashing {}", path.display()))?;
    Ok(sha)
}

/// Check the file at `path` against an expected hex sha256.
pub fn verify_digest(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(Error::Integrity {
            path: path.display().to_string(),
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        });
    }
    Ok(())
}
