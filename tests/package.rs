use std::fs;
use std::io::Read;
use std::path::Path;

use edgepack::artifact::ArtifactType;
use edgepack::package::{verify_digest, Compression, Package, PackageConfig, StoreKind};
use edgepack::Error;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, bytes: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

fn read_all(package: &Package, kind: ArtifactType, name: &str) -> Vec<u8> {
    let mut artifact = package.get(kind, name).unwrap();
    let mut out = Vec::new();
    artifact.take_body().unwrap().read_to_end(&mut out).unwrap();
    assert_eq!(out.len() as u64, artifact.size);
    out
}

#[test]
fn source_tree_survives_seal_and_load_in_both_stores() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    write(&src, "bin/k3s", b"k3s binary");
    write(&src, "scripts/install.sh", b"#!/bin/sh\n");
    write(&src, "images/k3s-airgap-images-amd64.tar", &[1u8; 70_000]);
    write(&src, "manifests/addons/traefik.yaml", b"kind: HelmChart\n");
    write(&src, "LICENSE", b"Apache-2.0");
    write(&src, "README.md", b"read me");

    let config = PackageConfig {
        compression: Compression::Zstd,
        store: StoreKind::Tar,
        ..Default::default()
    };
    let mut package = Package::from_directory(&src, &config).unwrap();
    assert_eq!(package.manifest().len(), 6);

    let out = tmp.path().join("dist/bundle.tar.zst");
    let archive = package.archive().unwrap();
    let sha = archive.sha256().unwrap();
    archive.persist(&out).unwrap();
    package.close().unwrap();
    verify_digest(&out, &sha).unwrap();

    for store in [StoreKind::Directory, StoreKind::Tar] {
        let loaded = Package::load(&out, store).unwrap();
        assert_eq!(loaded.compression(), Compression::Zstd);
        assert_eq!(loaded.manifest().names(ArtifactType::Eula), ["LICENSE"]);
        assert_eq!(loaded.manifest().names(ArtifactType::Static), ["README.md"]);
        assert_eq!(
            read_all(&loaded, ArtifactType::Manifest, "manifests/addons/traefik.yaml"),
            b"kind: HelmChart\n"
        );
        assert_eq!(
            read_all(&loaded, ArtifactType::Image, "k3s-airgap-images-amd64.tar"),
            vec![1u8; 70_000]
        );
        loaded.verify().unwrap();
        loaded.close().unwrap();
    }
}

#[test]
fn corrupted_archive_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    write(&src, "bin/k3s", b"original bytes");

    let mut package = Package::from_directory(&src, &PackageConfig::default()).unwrap();
    let out = tmp.path().join("bundle.tar");
    package.archive().unwrap().persist(&out).unwrap();
    package.close().unwrap();

    // Same length, different content: only the digest can tell.
    let mut bytes = fs::read(&out).unwrap();
    let at = bytes
        .windows(b"original".len())
        .position(|w| w == b"original")
        .unwrap();
    bytes[at..at + 8].copy_from_slice(b"tampered");
    fs::write(&out, bytes).unwrap();

    let err = Package::load(&out, StoreKind::Directory).unwrap_err();
    assert!(matches!(err, Error::Integrity { ref path, .. } if path == "bin/k3s"));
}
