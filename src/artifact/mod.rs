//! The unit of content moved through the system.
//!
//! An [`Artifact`] is a typed, named payload. Its `(kind, name)` pair is the
//! only identity used for lookup, and the kind decides the directory the
//! payload lives under inside a package:
//!
//! | kind       | directory     |
//! |------------|---------------|
//! | `Binary`   | `bin/`        |
//! | `Image`    | `images/`     |
//! | `Script`   | `scripts/`    |
//! | `Manifest` | `manifests/`  |
//! | `Eula`     | archive root  |
//! | `Static`   | archive root  |

use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoContext, Result};

/// Exclusively owned byte stream. Dropping it closes the underlying handle.
pub type Body = Box<dyn Read + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Binary,
    Image,
    Script,
    Manifest,
    Eula,
    Static,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 6] = [
        ArtifactType::Binary,
        ArtifactType::Script,
        ArtifactType::Image,
        ArtifactType::Manifest,
        ArtifactType::Eula,
        ArtifactType::Static,
    ];

    /// Directory inside the package, or `None` for kinds stored at the root.
    pub fn dir(self) -> Option<&'static str> {
        match self {
            ArtifactType::Binary => Some("bin"),
            ArtifactType::Image => Some("images"),
            ArtifactType::Script => Some("scripts"),
            ArtifactType::Manifest => Some("manifests"),
            ArtifactType::Eula | ArtifactType::Static => None,
        }
    }

    /// Inverse of [`ArtifactType::dir`] for the typed directories.
    pub fn from_dir(dir: &str) -> Option<Self> {
        match dir {
            "bin" => Some(ArtifactType::Binary),
            "images" => Some(ArtifactType::Image),
            "scripts" => Some(ArtifactType::Script),
            "manifests" => Some(ArtifactType::Manifest),
            _ => None,
        }
    }

    /// Permission bits used when the payload is written into an archive or
    /// onto a node.
    pub fn mode(self) -> u32 {
        match self {
            ArtifactType::Binary | ArtifactType::Script => 0o755,
            _ => 0o644,
        }
    }

    /// Strip this kind's directory prefix from `name` if it already carries it.
    pub fn unqualify(self, name: &str) -> &str {
        match self.dir() {
            Some(dir) => name
                .strip_prefix(dir)
                .and_then(|rest| rest.strip_prefix('/'))
                .filter(|rest| !rest.is_empty())
                .unwrap_or(name),
            None => name,
        }
    }

    /// Physical location of `name` inside a package: `dir/name`.
    pub fn storage_path(self, name: &str) -> String {
        let name = self.unqualify(name);
        match self.dir() {
            Some(dir) => format!("{dir}/{name}"),
            None => name.to_string(),
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactType::Binary => "binary",
            ArtifactType::Image => "image",
            ArtifactType::Script => "script",
            ArtifactType::Manifest => "manifest",
            ArtifactType::Eula => "eula",
            ArtifactType::Static => "static",
        };
        f.write_str(s)
    }
}

/// One payload unit.
///
/// `size` is only authoritative after [`Package::get`](crate::package::Package::get)
/// or when set by the producer (e.g. [`Artifact::from_file`]).
pub struct Artifact {
    pub kind: ArtifactType,
    pub name: String,
    pub size: u64,
    body: Option<Body>,
}

impl Artifact {
    pub fn new(kind: ArtifactType, name: impl Into<String>, body: Body) -> Self {
        Self {
            kind,
            name: name.into(),
            size: 0,
            body: Some(body),
        }
    }

    pub fn from_bytes(kind: ArtifactType, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            kind,
            name: name.into(),
            size,
            body: Some(Box::new(Cursor::new(bytes))),
        }
    }

    /// Open `path` as the body; size is taken from file metadata.
    pub fn from_file(kind: ArtifactType, name: impl Into<String>, path: &Path) -> Result<Self> {
        let file =
            File::open(path).io_context(|| format!("opening artifact {}", path.display()))?;
        let size = file
            .metadata()
            .io_context(|| format!("reading metadata of {}", path.display()))?
            .len();
        Ok(Self {
            kind,
            name: name.into(),
            size,
            body: Some(Box::new(file)),
        })
    }

    pub(crate) fn with_body(kind: ArtifactType, name: String, size: u64, body: Body) -> Self {
        Self {
            kind,
            name,
            size,
            body: Some(body),
        }
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Move the body out, leaving the artifact without one.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    pub fn body_mut(&mut self) -> Option<&mut Body> {
        self.body.as_mut()
    }

    pub fn storage_path(&self) -> String {
        self.kind.storage_path(&self.name)
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Reject names that would escape the package or collide with metadata or
/// with another kind's storage paths.
pub(crate) fn validate_name(kind: ArtifactType, name: &str) -> Result<()> {
    let invalid = |reason| Error::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.contains('\\') {
        return Err(invalid("name must use '/' separators"));
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(invalid("name must be relative"));
    }
    for component in path.components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(invalid("name must not contain '.', '..' or root components"));
        }
    }
    if kind.dir().is_none() {
        if name == crate::package::META_NAME {
            return Err(invalid("name is reserved for package metadata"));
        }
        // Root-level names share the archive root with the typed directories.
        let first = path.components().next().and_then(|c| c.as_os_str().to_str());
        if first.and_then(ArtifactType::from_dir).is_some() {
            return Err(invalid("root-level name must not start with a typed directory"));
        }
    }
    Ok(())
}
