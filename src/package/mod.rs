//! Package archive engine.
//!
//! A [`Package`] is a mutable, in-progress archive: artifacts are written
//! into a working store as they are put, and [`Package::archive`] seals the
//! current state into a fresh tar stream with `manifest.json` as the last
//! entry. A sealed [`Archive`] can be loaded back into a package with
//! [`Package::load`].
//!
//! The manifest embedded in [`PackageMeta`] always mirrors what
//! [`Package::get`] can return: an artifact is registered only after its bytes
//! were fully written, and loading rejects archives where the two disagree.

mod archive;
mod manifest;
mod store;

pub use archive::{verify_digest, Archive};
pub use manifest::{Manifest, MetaUpdate, PackageMeta, SCHEMA_VERSION};
pub use store::StoreKind;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::artifact::{validate_name, Artifact, ArtifactType};
use crate::error::{Error, IoContext, Result};
use store::{open_store, Store};

/// Name of the metadata entry at the archive root.
pub const META_NAME: &str = "manifest.json";

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

/// Build-time settings for a new package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageConfig {
    pub name: String,
    pub version: String,
    pub runtime_version: String,
    pub arch: String,
    pub compression: Compression,
    pub store: StoreKind,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            name: "edgepack".to_string(),
            version: "0.0.0".to_string(),
            runtime_version: String::new(),
            arch: default_arch().to_string(),
            compression: Compression::default(),
            store: StoreKind::default(),
        }
    }
}

/// Kubernetes spelling of the host architecture.
pub fn default_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    }
}

pub struct Package {
    meta: PackageMeta,
    compression: Compression,
    store: Box<dyn Store>,
    workdir: Arc<TempDir>,
}

impl Package {
    /// Create an empty package backed by a fresh working directory.
    pub fn create(config: &PackageConfig) -> Result<Self> {
        let workdir = new_workdir()?;
        let store = open_store(config.store, workdir.path())?;
        let mut meta = PackageMeta::new(&config.name, &config.version);
        meta.runtime_version = config.runtime_version.clone();
        meta.arch = config.arch.clone();
        Ok(Self {
            meta,
            compression: config.compression,
            store,
            workdir: Arc::new(workdir),
        })
    }

    /// Build a package from a source tree laid out like an archive
    /// (`bin/`, `scripts/`, `images/`, `manifests/`, plus root files).
    pub fn from_directory(source: &Path, config: &PackageConfig) -> Result<Self> {
        let mut package = Self::create(config)?;

        for kind in ArtifactType::ALL {
            let Some(dir) = kind.dir() else { continue };
            let root = source.join(dir);
            if !root.is_dir() {
                continue;
            }
            for ent in WalkDir::new(&root).follow_links(true).sort_by_file_name() {
                let ent = ent
                    .map_err(io::Error::from)
                    .io_context(|| format!("walking {}", root.display()))?;
                let file_type = ent.file_type();
                if file_type.is_dir() {
                    continue;
                }
                if !file_type.is_file() {
                    warn!(path = %ent.path().display(), "skipping entry that is not a regular file");
                    continue;
                }
                let rel = ent
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(ent.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                package.put(Artifact::from_file(kind, rel, ent.path())?)?;
            }
        }

        let mut root_files = Vec::new();
        for ent in fs::read_dir(source).io_context(|| format!("reading {}", source.display()))? {
            let ent = ent.io_context(|| format!("reading {}", source.display()))?;
            let path = ent.path();
            if path.is_file() {
                root_files.push(path);
            } else if !path.is_dir() {
                warn!(path = %path.display(), "skipping entry that is not a regular file");
            }
        }
        root_files.sort();
        for path in root_files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == META_NAME {
                warn!(path = %path.display(), "skipping file that collides with package metadata");
                continue;
            }
            let upper = name.to_ascii_uppercase();
            let kind = if upper.starts_with("EULA") || upper.starts_with("LICENSE") {
                ArtifactType::Eula
            } else {
                ArtifactType::Static
            };
            package.put(Artifact::from_file(kind, name, &path)?)?;
        }

        Ok(package)
    }

    /// Load a sealed archive (plain tar or zstd-compressed tar).
    pub fn load(path: &Path, store: StoreKind) -> Result<Self> {
        let file = File::open(path).io_context(|| format!("opening archive {}", path.display()))?;
        let package = Self::load_reader(BufReader::new(file), store)?;
        info!(
            archive = %path.display(),
            name = %package.meta.name,
            version = %package.meta.version,
            artifacts = package.meta.manifest.len(),
            "loaded package"
        );
        Ok(package)
    }

    /// Load a sealed archive after checking its sha256.
    pub fn load_verified(path: &Path, expected_sha256: &str, store: StoreKind) -> Result<Self> {
        verify_digest(path, expected_sha256)?;
        Self::load(path, store)
    }

    pub fn load_reader<R: BufRead>(mut reader: R, store: StoreKind) -> Result<Self> {
        let head = reader.fill_buf().io_context(|| "reading archive header")?;
        if head.starts_with(&ZSTD_MAGIC) {
            let decoder = zstd::stream::Decoder::with_buffer(reader)
                .io_context(|| "opening zstd stream")?;
            Self::read_tar(decoder, store, Compression::Zstd)
        } else {
            Self::read_tar(reader, store, Compression::None)
        }
    }

    fn read_tar<R: Read>(reader: R, kind: StoreKind, compression: Compression) -> Result<Self> {
        let workdir = new_workdir()?;
        let mut store = open_store(kind, workdir.path())?;
        let mut meta: Option<PackageMeta> = None;
        let mut stored: BTreeMap<String, String> = BTreeMap::new();

        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries().io_context(|| "reading archive entries")? {
            let mut entry = entry.io_context(|| "reading archive entry")?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry
                .path()
                .io_context(|| "decoding archive entry path")?
                .to_string_lossy()
                .replace('\\', "/");
            if !store::is_contained(&path) {
                return Err(Error::malformed(
                    "archive entry",
                    format!("'{path}' is not a relative path inside the package"),
                ));
            }

            if path == META_NAME {
                let parsed: PackageMeta = serde_json::from_reader(&mut entry)
                    .map_err(|e| Error::malformed("package metadata", e.to_string()))?;
                meta = Some(parsed);
                continue;
            }

            let mut hashing = HashingReader::new(&mut entry);
            store.put(&path, &mut hashing)?;
            stored.insert(path, hashing.finish());
        }

        let meta =
            meta.ok_or_else(|| Error::malformed("archive", format!("missing {META_NAME}")))?;
        if meta.schema_version > SCHEMA_VERSION {
            return Err(Error::malformed(
                "package metadata",
                format!(
                    "schema version {} is newer than supported {}",
                    meta.schema_version, SCHEMA_VERSION
                ),
            ));
        }

        for (kind, name) in meta.manifest.iter() {
            let path = kind.storage_path(name);
            let Some(actual) = stored.remove(&path) else {
                return Err(Error::malformed(
                    "archive",
                    format!("manifest lists {kind} '{name}' but '{path}' is missing"),
                ));
            };
            if let Some(expected) = meta.checksums.get(&path) {
                if *expected != actual {
                    return Err(Error::Integrity {
                        path,
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }
        if let Some(path) = stored.keys().next() {
            return Err(Error::malformed(
                "archive",
                format!("'{path}' is not listed in the manifest"),
            ));
        }

        Ok(Self {
            meta,
            compression,
            store,
            workdir: Arc::new(workdir),
        })
    }

    /// Store an artifact and register it in the manifest.
    ///
    /// The artifact body is consumed and closed whether or not this succeeds.
    /// On failure the manifest is untouched.
    pub fn put(&mut self, mut artifact: Artifact) -> Result<u64> {
        let kind = artifact.kind;
        let name = kind.unqualify(&artifact.name).to_string();
        let body = artifact.take_body();
        drop(artifact);

        validate_name(kind, &name)?;
        let mut body = body.ok_or_else(|| {
            Error::malformed("artifact", format!("{kind} '{name}' has no body"))
        })?;

        let path = kind.storage_path(&name);
        let mut hashing = HashingReader::new(&mut body);
        let size = self.store.put(&path, &mut hashing)?;
        let digest = hashing.finish();
        drop(body);

        self.meta.manifest.insert(kind, &name);
        self.meta.checksums.insert(path.clone(), digest);
        debug!(%kind, %name, %path, size, "stored artifact");
        Ok(size)
    }

    pub fn put_meta(&mut self, update: MetaUpdate) {
        self.meta.apply(update);
    }

    /// Open `(kind, name)` for reading. A name already carrying the kind's
    /// directory prefix is accepted and returned without it.
    pub fn get(&self, kind: ArtifactType, name: &str) -> Result<Artifact> {
        let name = kind.unqualify(name);
        let not_found = || Error::NotFound {
            kind,
            name: name.to_string(),
        };
        if !self.meta.manifest.contains(kind, name) {
            return Err(not_found());
        }
        let (size, body) = self
            .store
            .open(&kind.storage_path(name))?
            .ok_or_else(not_found)?;
        Ok(Artifact::with_body(kind, name.to_string(), size, body))
    }

    pub fn meta(&self) -> &PackageMeta {
        &self.meta
    }

    pub fn manifest(&self) -> &Manifest {
        &self.meta.manifest
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Seal the current contents into a new archive.
    ///
    /// Every call builds a fresh tar: manifest entries in manifest order,
    /// then `manifest.json`. Headers carry no timestamps or owners, so two
    /// seals of the same state are byte-identical.
    pub fn archive(&mut self) -> Result<Archive> {
        let meta = serde_json::to_vec_pretty(&self.meta)
            .map_err(|e| Error::malformed("package metadata", e.to_string()))?;
        let sealed = NamedTempFile::new_in(self.workdir.path())
            .io_context(|| format!("creating archive in {}", self.workdir.path().display()))?;

        match self.compression {
            Compression::None => {
                let mut out = self.write_tar(sealed.as_file(), &meta)?;
                out.flush().io_context(|| "flushing archive")?;
            }
            Compression::Zstd => {
                let encoder = zstd::stream::Encoder::new(sealed.as_file(), 3)
                    .io_context(|| "starting zstd stream")?;
                let encoder = self.write_tar(encoder, &meta)?;
                encoder.finish().io_context(|| "finishing zstd stream")?;
            }
        }
        sealed
            .as_file()
            .sync_all()
            .io_context(|| format!("syncing {}", sealed.path().display()))?;

        let archive = Archive::new(sealed, Arc::clone(&self.workdir))?;
        info!(
            name = %self.meta.name,
            version = %self.meta.version,
            artifacts = self.meta.manifest.len(),
            size = archive.size(),
            "sealed package"
        );
        Ok(archive)
    }

    fn write_tar<W: Write>(&self, writer: W, meta: &[u8]) -> Result<W> {
        let mut builder = tar::Builder::new(writer);
        for (kind, name) in self.meta.manifest.iter() {
            let path = kind.storage_path(name);
            let (size, body) = self.store.open(&path)?.ok_or_else(|| Error::NotFound {
                kind,
                name: name.to_string(),
            })?;
            let mut header = entry_header(size, kind.mode());
            builder
                .append_data(&mut header, &path, body)
                .io_context(|| format!("sealing '{path}'"))?;
        }
        let mut header = entry_header(meta.len() as u64, 0o644);
        builder
            .append_data(&mut header, META_NAME, meta)
            .io_context(|| format!("sealing '{META_NAME}'"))?;
        builder.into_inner().io_context(|| "finishing tar stream")
    }

    /// Re-hash every listed artifact against the recorded digests.
    pub fn verify(&self) -> Result<()> {
        for (kind, name) in self.meta.manifest.iter() {
            let path = kind.storage_path(name);
            let (_, mut body) = self.store.open(&path)?.ok_or_else(|| Error::NotFound {
                kind,
                name: name.to_string(),
            })?;
            let (actual, _) =
                archive::sha256_reader(&mut body).io_context(|| format!("hashing '{path}'"))?;
            match self.meta.checksums.get(&path) {
                Some(expected) if *expected != actual => {
                    return Err(Error::Integrity {
                        path,
                        expected: expected.clone(),
                        actual,
                    })
                }
                Some(_) => {}
                None => warn!(%path, "no recorded checksum"),
            }
        }
        Ok(())
    }

    /// Release the working directory. Archives still held keep it alive
    /// until they are dropped.
    pub fn close(self) -> Result<()> {
        drop(self.store);
        match Arc::try_unwrap(self.workdir) {
            Ok(dir) => {
                let path = dir.path().to_path_buf();
                dir.close()
                    .io_context(|| format!("removing package workdir {}", path.display()))
            }
            Err(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("name", &self.meta.name)
            .field("version", &self.meta.version)
            .field("artifacts", &self.meta.manifest.len())
            .field("workdir", &self.workdir.path())
            .finish()
    }
}

fn new_workdir() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("edgepack-")
        .tempdir()
        .io_context(|| "creating package working directory")
}

fn entry_header(size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    header
}

/// Pass-through reader that hashes what it reads.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Body that records when it is dropped and can be told to fail.
    struct TrackedBody {
        data: io::Cursor<Vec<u8>>,
        closed: Arc<AtomicBool>,
        fail: bool,
    }

    impl Read for TrackedBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "disk pulled"));
            }
            self.data.read(buf)
        }
    }

    impl Drop for TrackedBody {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn tracked(kind: ArtifactType, name: &str, fail: bool) -> (Artifact, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let body = TrackedBody {
            data: io::Cursor::new(b"payload".to_vec()),
            closed: Arc::clone(&closed),
            fail,
        };
        (Artifact::new(kind, name, Box::new(body)), closed)
    }

    fn read_body(mut artifact: Artifact) -> Vec<u8> {
        let mut out = Vec::new();
        artifact
            .take_body()
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn sample(store: StoreKind, compression: Compression) -> Package {
        let config = PackageConfig {
            name: "edge".into(),
            version: "1.2.3".into(),
            runtime_version: "v1.29.4+k3s1".into(),
            arch: "amd64".into(),
            compression,
            store,
        };
        let mut package = Package::create(&config).unwrap();
        let items: &[(ArtifactType, &str, &[u8])] = &[
            (ArtifactType::Binary, "k3s", b"\x7fELF k3s"),
            (ArtifactType::Image, "k3s-airgap-images.tar", &[0u8; 2000]),
            (ArtifactType::Script, "install.sh", b"#!/bin/sh\necho hi\n"),
            (ArtifactType::Manifest, "addons/traefik.yaml", b"kind: HelmChart\n"),
            (ArtifactType::Binary, "kubectl", b"\x7fELF kubectl"),
            (ArtifactType::Eula, "EULA.txt", b"terms"),
        ];
        for (kind, name, bytes) in items {
            package
                .put(Artifact::from_bytes(*kind, *name, bytes.to_vec()))
                .unwrap();
        }
        package
    }

    fn roundtrip(store: StoreKind, compression: Compression) {
        let tmp = TempDir::new().unwrap();
        let mut package = sample(store, compression);
        let archive = package.archive().unwrap();
        let out = tmp.path().join("edge.tar");
        archive.persist(&out).unwrap();

        let loaded = Package::load(&out, store).unwrap();
        assert_eq!(loaded.manifest(), package.manifest());
        assert_eq!(loaded.meta(), package.meta());
        assert_eq!(loaded.compression(), compression);
        for (kind, name) in package.manifest().iter() {
            let original = read_body(package.get(kind, name).unwrap());
            let reloaded = read_body(loaded.get(kind, name).unwrap());
            assert_eq!(original, reloaded, "{kind} {name}");
        }
        loaded.verify().unwrap();
    }

    #[test]
    fn roundtrip_directory_store() {
        roundtrip(StoreKind::Directory, Compression::None);
    }

    #[test]
    fn roundtrip_tar_store_zstd() {
        roundtrip(StoreKind::Tar, Compression::Zstd);
    }

    #[test]
    fn manifest_mirrors_get() {
        for store in [StoreKind::Directory, StoreKind::Tar] {
            let package = sample(store, Compression::None);
            for (kind, name) in package.manifest().iter() {
                package.get(kind, name).unwrap();
            }
            let err = package.get(ArtifactType::Binary, "helm").unwrap_err();
            assert!(err.is_not_found());
            assert_eq!(err.to_string(), "artifact not found: binary 'helm'");
            // Right name, wrong type.
            assert!(package
                .get(ArtifactType::Script, "k3s")
                .unwrap_err()
                .is_not_found());
        }
    }

    #[test]
    fn body_closed_after_put() {
        let mut package = sample(StoreKind::Directory, Compression::None);

        let (ok, closed) = tracked(ArtifactType::Binary, "crictl", false);
        package.put(ok).unwrap();
        assert!(closed.load(Ordering::SeqCst));

        let (bad, closed) = tracked(ArtifactType::Binary, "ctr", true);
        assert!(package.put(bad).is_err());
        assert!(closed.load(Ordering::SeqCst));

        let (invalid, closed) = tracked(ArtifactType::Binary, "../ctr", false);
        assert!(package.put(invalid).is_err());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_put_leaves_manifest_untouched() {
        for store in [StoreKind::Directory, StoreKind::Tar] {
            let mut package = sample(store, Compression::None);
            let before = package.manifest().clone();
            let (bad, _) = tracked(ArtifactType::Image, "broken.tar", true);
            assert!(package.put(bad).is_err());
            assert_eq!(package.manifest(), &before);
            assert!(package
                .get(ArtifactType::Image, "broken.tar")
                .unwrap_err()
                .is_not_found());
            // The partial file never reaches a sealed archive.
            let mut archive = package.archive().unwrap();
            let mut tar = tar::Archive::new(archive.reader().unwrap());
            let names: Vec<String> = tar
                .entries()
                .unwrap()
                .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
                .collect();
            assert!(!names.iter().any(|n| n.contains("broken")));
            assert_eq!(names.last().map(String::as_str), Some(META_NAME));
        }
    }

    #[test]
    fn duplicate_put_overwrites_in_place() {
        let mut package = sample(StoreKind::Tar, Compression::None);
        package
            .put(Artifact::from_bytes(ArtifactType::Binary, "k3s", b"v2".to_vec()))
            .unwrap();
        assert_eq!(package.manifest().binaries, vec!["k3s", "kubectl"]);
        assert_eq!(read_body(package.get(ArtifactType::Binary, "k3s").unwrap()), b"v2");
    }

    #[test]
    fn qualified_names_are_stripped_on_get() {
        let package = sample(StoreKind::Directory, Compression::None);
        let artifact = package.get(ArtifactType::Binary, "bin/k3s").unwrap();
        assert_eq!(artifact.name, "k3s");
        assert_eq!(artifact.size, 8);
        assert_eq!(artifact.storage_path(), "bin/k3s");
    }

    #[test]
    fn qualified_names_are_normalized_on_put() {
        let mut package = sample(StoreKind::Directory, Compression::None);
        package
            .put(Artifact::from_bytes(
                ArtifactType::Script,
                "scripts/uninstall.sh",
                b"#!/bin/sh\n".to_vec(),
            ))
            .unwrap();
        assert!(package.manifest().contains(ArtifactType::Script, "uninstall.sh"));
        package.get(ArtifactType::Script, "uninstall.sh").unwrap();
    }

    #[test]
    fn sealing_is_repeatable_and_sized() {
        for compression in [Compression::None, Compression::Zstd] {
            let mut package = sample(StoreKind::Directory, compression);
            let mut first = package.archive().unwrap();
            let second = package.archive().unwrap();
            assert_eq!(first.size(), second.size());
            assert_eq!(first.sha256().unwrap(), second.sha256().unwrap());

            let mut drained = Vec::new();
            first.reader().unwrap().read_to_end(&mut drained).unwrap();
            assert_eq!(drained.len() as u64, first.size());
            assert!(matches!(first.reader(), Err(Error::StreamConsumed)));

            package
                .put(Artifact::from_bytes(ArtifactType::Static, "README", b"hi".to_vec()))
                .unwrap();
            let third = package.archive().unwrap();
            assert_ne!(third.size(), second.size());
        }
    }

    #[test]
    fn put_meta_keeps_manifest() {
        let mut package = sample(StoreKind::Directory, Compression::None);
        let before = package.manifest().clone();
        package.put_meta(MetaUpdate {
            version: Some("2.0.0".into()),
            arch: Some("arm64".into()),
            ..Default::default()
        });
        assert_eq!(package.meta().version, "2.0.0");
        assert_eq!(package.meta().arch, "arm64");
        assert_eq!(package.manifest(), &before);
    }

    #[test]
    fn archive_outlives_closed_package() {
        let package_archive = {
            let mut package = sample(StoreKind::Directory, Compression::None);
            let archive = package.archive().unwrap();
            package.close().unwrap();
            archive
        };
        let mut archive = package_archive;
        let mut bytes = Vec::new();
        archive.reader().unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes.len() as u64, archive.size());
    }

    #[test]
    fn load_rejects_tampered_payload() {
        let tmp = TempDir::new().unwrap();
        let package = sample(StoreKind::Directory, Compression::None);
        let mut meta = package.meta().clone();
        meta.checksums
            .insert("bin/k3s".to_string(), "0".repeat(64));

        // Rebuild an archive by hand with the forged digest.
        let path = tmp.path().join("forged.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        for (kind, name) in package.manifest().iter() {
            let mut artifact = package.get(kind, name).unwrap();
            let mut header = entry_header(artifact.size, 0o644);
            let storage = artifact.storage_path();
            builder
                .append_data(&mut header, storage, artifact.take_body().unwrap())
                .unwrap();
        }
        let json = serde_json::to_vec(&meta).unwrap();
        let mut header = entry_header(json.len() as u64, 0o644);
        builder.append_data(&mut header, META_NAME, &json[..]).unwrap();
        builder.into_inner().unwrap();

        let err = Package::load(&path, StoreKind::Directory).unwrap_err();
        assert!(matches!(err, Error::Integrity { ref path, .. } if path == "bin/k3s"));
        package.close().unwrap();
    }

    #[test]
    fn load_rejects_unlisted_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("extra.tar");
        let meta = PackageMeta::new("edge", "1.0.0");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        let mut header = entry_header(3, 0o755);
        builder
            .append_data(&mut header, "bin/stray", &b"abc"[..])
            .unwrap();
        let json = serde_json::to_vec(&meta).unwrap();
        let mut header = entry_header(json.len() as u64, 0o644);
        builder.append_data(&mut header, META_NAME, &json[..]).unwrap();
        builder.into_inner().unwrap();

        let err = Package::load(&path, StoreKind::Tar).unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }), "{err}");
    }

    #[test]
    fn load_verified_checks_archive_digest() {
        let tmp = TempDir::new().unwrap();
        let mut package = sample(StoreKind::Directory, Compression::Zstd);
        let archive = package.archive().unwrap();
        let digest = archive.sha256().unwrap();
        let out = tmp.path().join("edge.tar.zst");
        archive.persist(&out).unwrap();

        Package::load_verified(&out, &digest, StoreKind::Directory).unwrap();
        let err = Package::load_verified(&out, &"f".repeat(64), StoreKind::Directory).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[test]
    fn from_directory_classifies_tree() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("dist");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::create_dir_all(src.join("manifests/addons")).unwrap();
        fs::create_dir_all(src.join("scripts")).unwrap();
        fs::write(src.join("bin/k3s"), b"k3s").unwrap();
        fs::write(src.join("manifests/addons/dns.yaml"), b"dns").unwrap();
        fs::write(src.join("scripts/install.sh"), b"sh").unwrap();
        fs::write(src.join("LICENSE"), b"apache").unwrap();
        fs::write(src.join("notes.md"), b"notes").unwrap();

        let package = Package::from_directory(&src, &PackageConfig::default()).unwrap();
        let m = package.manifest();
        assert_eq!(m.binaries, vec!["k3s"]);
        assert_eq!(m.manifests, vec!["addons/dns.yaml"]);
        assert_eq!(m.scripts, vec!["install.sh"]);
        assert_eq!(m.eula, vec!["LICENSE"]);
        assert_eq!(m.statics, vec!["notes.md"]);
    }

    fn raw_entry(builder: &mut tar::Builder<File>, name: &str, data: &[u8]) {
        // Written through the raw name field so the builder's own path checks
        // do not clean the name up.
        let mut header = entry_header(data.len() as u64, 0o644);
        let field = &mut header.as_old_mut().name;
        assert!(name.len() < field.len());
        field.fill(0);
        field[..name.len()].copy_from_slice(name.as_bytes());
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    #[test]
    fn load_rejects_entries_outside_the_package() {
        let tmp = TempDir::new().unwrap();
        let victim = tmp.path().join("victim");
        let json = serde_json::to_vec(&PackageMeta::new("edge", "1.0.0")).unwrap();

        let absolute = victim.to_string_lossy().into_owned();
        for (i, name) in [absolute.as_str(), "../escape", "bin/../../escape"]
            .into_iter()
            .enumerate()
        {
            let path = tmp.path().join(format!("evil-{i}.tar"));
            let mut builder = tar::Builder::new(File::create(&path).unwrap());
            raw_entry(&mut builder, name, b"owned");
            raw_entry(&mut builder, META_NAME, &json);
            builder.into_inner().unwrap();

            for store in [StoreKind::Directory, StoreKind::Tar] {
                let err = Package::load(&path, store).unwrap_err();
                assert!(matches!(err, Error::Malformed { .. }), "{name}: {err}");
            }
        }
        assert!(!victim.exists());
    }

    #[test]
    fn root_names_cannot_replace_typed_payloads() {
        // Typed artifact first, then a root-level name aimed at its path.
        let mut package = sample(StoreKind::Directory, Compression::None);
        let before = package.manifest().clone();
        let err = package
            .put(Artifact::from_bytes(ArtifactType::Static, "bin/k3s", b"evil".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }), "{err}");
        assert_eq!(package.manifest(), &before);
        assert_eq!(
            read_body(package.get(ArtifactType::Binary, "k3s").unwrap()),
            b"\x7fELF k3s"
        );

        // Root-level name first, then the typed artifact.
        let mut package = Package::create(&PackageConfig::default()).unwrap();
        let err = package
            .put(Artifact::from_bytes(ArtifactType::Eula, "bin/k3s", b"terms".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }), "{err}");
        assert!(package.manifest().is_empty());
        package
            .put(Artifact::from_bytes(ArtifactType::Binary, "k3s", b"k3s".to_vec()))
            .unwrap();

        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("edge.tar");
        package.archive().unwrap().persist(&out).unwrap();
        let loaded = Package::load(&out, StoreKind::Tar).unwrap();
        assert_eq!(loaded.manifest().binaries, vec!["k3s"]);
        assert!(loaded.manifest().eula.is_empty());
        assert_eq!(read_body(loaded.get(ArtifactType::Binary, "k3s").unwrap()), b"k3s");
    }

    #[test]
    fn long_names_survive_seal_and_load() {
        let tmp = TempDir::new().unwrap();
        let name = format!("addons/{}/{}.yaml", "a".repeat(80), "b".repeat(60));
        let mut package = sample(StoreKind::Tar, Compression::None);
        package
            .put(Artifact::from_bytes(ArtifactType::Manifest, &name, b"kind: x\n".to_vec()))
            .unwrap();
        assert_eq!(read_body(package.get(ArtifactType::Manifest, &name).unwrap()), b"kind: x\n");

        let out = tmp.path().join("edge.tar");
        package.archive().unwrap().persist(&out).unwrap();
        for store in [StoreKind::Directory, StoreKind::Tar] {
            let loaded = Package::load(&out, store).unwrap();
            assert!(loaded.manifest().contains(ArtifactType::Manifest, &name));
            assert_eq!(
                read_body(loaded.get(ArtifactType::Manifest, &name).unwrap()),
                b"kind: x\n"
            );
            loaded.verify().unwrap();
        }
    }

    #[cfg(unix)]
    #[test]
    fn from_directory_follows_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("dist");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/k3s"), b"k3s").unwrap();
        std::os::unix::fs::symlink("k3s", src.join("bin/kubectl")).unwrap();
        fs::write(tmp.path().join("terms"), b"terms").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("terms"), src.join("EULA")).unwrap();

        let package = Package::from_directory(&src, &PackageConfig::default()).unwrap();
        let m = package.manifest();
        assert_eq!(m.binaries, vec!["k3s", "kubectl"]);
        assert_eq!(m.eula, vec!["EULA"]);
        assert_eq!(read_body(package.get(ArtifactType::Binary, "kubectl").unwrap()), b"k3s");
    }
}
