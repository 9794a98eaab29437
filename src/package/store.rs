//! Working storage behind a [`Package`](super::Package).
//!
//! Two backends are provided:
//! - [`DirStore`] writes each payload to `<root>/<path>` in a staging directory.
//! - [`TarStore`] appends each payload as an entry of one growing tar stream and
//!   keeps an in-memory index of entry offsets for random access.
//!
//! Neither backend knows about the manifest. Registration happens in the
//! package only after the backend reports success.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact::Body;
use crate::error::{Error, IoContext, Result};

const BLOCK: u64 = 512;
/// Width of the ustar/GNU header name field.
const NAME_FIELD: usize = 100;
const LONG_LINK: &[u8] = b"././@LongLink";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Directory,
    Tar,
}

pub(crate) trait Store: Send {
    /// Write `body` at `path`, replacing any earlier payload. Returns bytes written.
    fn put(&mut self, path: &str, body: &mut dyn Read) -> Result<u64>;

    /// Open the payload at `path` as an independent stream.
    fn open(&self, path: &str) -> Result<Option<(u64, Body)>>;
}

/// Whether `path` is relative, `/`-separated and made only of normal
/// components, so joining it onto a root cannot leave that root.
pub(crate) fn is_contained(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn padding(len: u64) -> usize {
    ((BLOCK - len % BLOCK) % BLOCK) as usize
}

pub(crate) fn open_store(kind: StoreKind, workdir: &Path) -> Result<Box<dyn Store>> {
    match kind {
        StoreKind::Directory => Ok(Box::new(DirStore::create(&workdir.join("staging"))?)),
        StoreKind::Tar => Ok(Box::new(TarStore::create(&workdir.join("body.tar"))?)),
    }
}

/// Staging-directory backend.
///
/// A failed write may leave a partial file behind. It is never listed in the
/// manifest and is never sealed into an archive.
#[derive(Debug)]
pub(crate) struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub(crate) fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .io_context(|| format!("creating staging directory {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }
}

impl Store for DirStore {
    fn put(&mut self, path: &str, body: &mut dyn Read) -> Result<u64> {
        if !is_contained(path) {
            return Err(Error::malformed(
                "store path",
                format!("'{path}' escapes the staging directory"),
            ));
        }
        let dest = self.root.join(path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("creating directory {}", parent.display()))?;
        }
        let mut file =
            File::create(&dest).io_context(|| format!("creating {}", dest.display()))?;
        let size = io::copy(body, &mut file).io_context(|| format!("writing {}", dest.display()))?;
        file.flush()
            .io_context(|| format!("flushing {}", dest.display()))?;
        Ok(size)
    }

    fn open(&self, path: &str) -> Result<Option<(u64, Body)>> {
        let src = self.root.join(path);
        let file = match File::open(&src) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Io {
                    context: format!("opening {}", src.display()),
                    source: e,
                })
            }
        };
        let size = file
            .metadata()
            .io_context(|| format!("reading metadata of {}", src.display()))?
            .len();
        Ok(Some((size, Box::new(file))))
    }
}

#[derive(Debug, Clone, Copy)]
struct TarEntry {
    offset: u64,
    size: u64,
}

/// Growing tar stream backend.
///
/// Entries are appended without a trailer; the stream is never handed out
/// directly, sealing always rebuilds a fresh archive. A failed append is
/// truncated away so later entries stay aligned. Re-putting a path appends a
/// new entry and the index points at the newest one.
#[derive(Debug)]
pub(crate) struct TarStore {
    path: PathBuf,
    file: File,
    index: HashMap<String, TarEntry>,
}

impl TarStore {
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .io_context(|| format!("creating tar stream {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            index: HashMap::new(),
        })
    }

    fn append(&mut self, path: &str, body: &mut dyn Read) -> Result<TarEntry> {
        let ctx = || format!("appending '{}' to {}", path, self.path.display());
        let mut header = tar::Header::new_gnu();
        if path.len() > NAME_FIELD {
            write_long_name(&mut self.file, path).io_context(ctx)?;
            header
                .as_old_mut()
                .name
                .copy_from_slice(&path.as_bytes()[..NAME_FIELD]);
        } else {
            header
                .set_path(path)
                .io_context(|| format!("encoding tar path '{path}'"))?;
        }
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(0);
        header.set_cksum();

        let header_at = self.file.stream_position().io_context(ctx)?;
        self.file.write_all(header.as_bytes()).io_context(ctx)?;
        let size = io::copy(body, &mut self.file).io_context(ctx)?;
        self.file
            .write_all(&[0u8; BLOCK as usize][..padding(size)])
            .io_context(ctx)?;

        // Patch the real size into the header now that it is known.
        header.set_size(size);
        header.set_cksum();
        self.file.seek(SeekFrom::Start(header_at)).io_context(ctx)?;
        self.file.write_all(header.as_bytes()).io_context(ctx)?;
        self.file.seek(SeekFrom::End(0)).io_context(ctx)?;

        Ok(TarEntry {
            offset: header_at + BLOCK,
            size,
        })
    }
}

/// GNU `././@LongLink` record carrying a name that overflows the header field.
fn write_long_name(out: &mut impl Write, path: &str) -> io::Result<()> {
    let mut name = path.as_bytes().to_vec();
    name.push(0);

    let mut link = tar::Header::new_gnu();
    link.as_old_mut().name[..LONG_LINK.len()].copy_from_slice(LONG_LINK);
    link.set_entry_type(tar::EntryType::GNULongName);
    link.set_mode(0o644);
    link.set_mtime(0);
    link.set_uid(0);
    link.set_gid(0);
    link.set_size(name.len() as u64);
    link.set_cksum();

    out.write_all(link.as_bytes())?;
    out.write_all(&name)?;
    out.write_all(&[0u8; BLOCK as usize][..padding(name.len() as u64)])
}

impl Store for TarStore {
    fn put(&mut self, path: &str, body: &mut dyn Read) -> Result<u64> {
        let start = self
            .file
            .seek(SeekFrom::End(0))
            .io_context(|| format!("seeking {}", self.path.display()))?;
        match self.append(path, body) {
            Ok(entry) => {
                self.index.insert(path.to_string(), entry);
                Ok(entry.size)
            }
            Err(e) => {
                let _ = self.file.set_len(start);
                let _ = self.file.seek(SeekFrom::End(0));
                Err(e)
            }
        }
    }

    fn open(&self, path: &str) -> Result<Option<(u64, Body)>> {
        let Some(entry) = self.index.get(path).copied() else {
            return Ok(None);
        };
        let mut file =
            File::open(&self.path).io_context(|| format!("opening {}", self.path.display()))?;
        file.seek(SeekFrom::Start(entry.offset))
            .io_context(|| format!("seeking to '{}' in {}", path, self.path.display()))?;
        Ok(Some((entry.size, Box::new(file.take(entry.size)))))
    }
}
