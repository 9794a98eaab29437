//! End-to-end join against the local machine, with every target path under
//! a temp directory.

use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use edgepack::artifact::{Artifact, ArtifactType, Body};
use edgepack::bootstrap::{add_node_with, AddNodeOptions, InstallLayout, Role};
use edgepack::node::{LocalNode, MemorySink, ShellCommand, Transport};
use edgepack::package::{Compression, Package, PackageConfig};
use edgepack::{Error, Result};
use tempfile::TempDir;

const TOKEN: &str = "K10f00d::server:0123456789abcdef";

/// The leader as seen from a test: real files, fixed control plane address.
struct Leader(LocalNode);

impl Transport for Leader {
    fn target(&self) -> &str {
        "leader"
    }

    fn mkdir_all(&mut self, path: &Path) -> Result<()> {
        self.0.mkdir_all(path)
    }

    fn get_file(&mut self, path: &Path) -> Result<Body> {
        self.0.get_file(path)
    }

    fn write_file(&mut self, body: Body, dest: &Path, mode: u32, size: u64) -> Result<()> {
        self.0.write_file(body, dest, mode, size)
    }

    fn execute(&mut self, command: &ShellCommand, log_prefix: &str) -> Result<()> {
        self.0.execute(command, log_prefix)
    }

    fn listen_address(&mut self, _process: &str, _port: u16) -> Result<Ipv4Addr> {
        Ok(Ipv4Addr::new(192, 168, 10, 2))
    }

    fn close(&mut self) -> Result<()> {
        self.0.close()
    }
}

fn layout(root: &Path) -> InstallLayout {
    let mut layout = InstallLayout::default();
    layout.bin_dir = root.join("usr/local/bin");
    layout.script_dir = root.join("usr/local/share/edgepack/scripts");
    layout.image_dir = root.join("var/lib/rancher/k3s/agent/images");
    layout.manifest_dir = root.join("var/lib/rancher/k3s/server/manifests");
    layout.server_token = root.join("leader/token");
    layout.agent_token = root.join("leader/agent-token");
    layout
}

fn build_bundle(dir: &Path, report: &Path, compression: Compression) -> PathBuf {
    let install = format!(
        "#!/bin/sh\nset -e\n{{\n  echo \"role=$1\"\n  echo \"url=$K3S_URL\"\n  echo \"token=$K3S_TOKEN\"\n  echo \"skip=$INSTALL_K3S_SKIP_DOWNLOAD\"\n}} > '{}'\necho installed\n",
        report.display()
    );
    let config = PackageConfig {
        name: "k3s-airgap".into(),
        version: "1.29.4".into(),
        compression,
        ..Default::default()
    };
    let mut package = Package::create(&config).unwrap();
    package
        .put(Artifact::from_bytes(ArtifactType::Binary, "k3s", b"\x7fELF k3s".to_vec()))
        .unwrap();
    package
        .put(Artifact::from_bytes(ArtifactType::Script, "install.sh", install.into_bytes()))
        .unwrap();
    package
        .put(Artifact::from_bytes(ArtifactType::Image, "k3s-airgap-images.tar", vec![7; 4096]))
        .unwrap();
    package
        .put(Artifact::from_bytes(
            ArtifactType::Manifest,
            "addons/coredns.yaml",
            b"kind: Deployment\n".to_vec(),
        ))
        .unwrap();

    let path = dir.join("bundle.tar");
    package.archive().unwrap().persist(&path).unwrap();
    package.close().unwrap();
    path
}

fn mode(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[test]
fn agent_joins_through_local_node() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    let report = tmp.path().join("install-report");
    let layout = layout(&root);
    fs::create_dir_all(root.join("leader")).unwrap();
    fs::write(&layout.agent_token, format!("{TOKEN}\n")).unwrap();

    let mut opts = AddNodeOptions::new(build_bundle(tmp.path(), &report, Compression::Zstd));
    opts.layout = layout.clone();
    opts.role = Role::Agent;

    let sink = Arc::new(MemorySink::default());
    let mut leader = Leader(LocalNode::new(sink.clone()));
    let node_sink = sink.clone();
    add_node_with(&opts, &mut leader, move || Ok(LocalNode::new(node_sink))).unwrap();

    let k3s = layout.bin_dir.join("k3s");
    assert_eq!(fs::read(&k3s).unwrap(), b"\x7fELF k3s");
    assert_eq!(mode(&k3s), 0o755);
    assert_eq!(mode(&layout.install_script_path()), 0o755);
    let image = layout.image_dir.join("k3s-airgap-images.tar");
    assert_eq!(fs::read(&image).unwrap(), vec![7; 4096]);
    assert_eq!(mode(&image), 0o644);
    assert_eq!(
        mode(&layout.manifest_dir.join("addons/coredns.yaml")),
        0o644
    );

    let report = fs::read_to_string(&report).unwrap();
    assert!(report.contains("role=agent"));
    assert!(report.contains("url=https://192.168.10.2:6443"));
    assert!(report.contains(&format!("token={TOKEN}")));
    assert!(report.contains("skip=true"));

    assert!(sink.contains("installed"));
    for (_, line) in sink.lines() {
        assert!(!line.contains(TOKEN), "token leaked into log: {line}");
    }
}

#[test]
fn missing_token_aborts_before_any_copy() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    let report = tmp.path().join("install-report");
    let mut opts = AddNodeOptions::new(build_bundle(tmp.path(), &report, Compression::None));
    opts.layout = layout(&root);
    opts.role = Role::Server;

    let sink = Arc::new(MemorySink::default());
    let mut leader = Leader(LocalNode::new(sink.clone()));
    let mut connected = false;
    let err = add_node_with(&opts, &mut leader, || {
        connected = true;
        Ok(LocalNode::new(sink.clone()))
    })
    .unwrap_err();

    assert!(matches!(err, Error::Io { .. }), "{err}");
    assert!(!connected);
    assert!(!root.join("usr").exists());
}

#[test]
fn failing_install_script_is_an_execution_error() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    // The report path's directory does not exist, so the script fails.
    let report = tmp.path().join("missing-dir/report");
    let layout = layout(&root);
    fs::create_dir_all(root.join("leader")).unwrap();
    fs::write(&layout.server_token, TOKEN).unwrap();

    let mut opts = AddNodeOptions::new(build_bundle(tmp.path(), &report, Compression::None));
    opts.layout = layout.clone();
    opts.role = Role::Server;

    let sink = Arc::new(MemorySink::default());
    let mut leader = Leader(LocalNode::new(sink.clone()));
    let err = add_node_with(&opts, &mut leader, || Ok(LocalNode::new(sink.clone()))).unwrap_err();

    match err {
        Error::Execution { command, .. } => assert!(!command.contains(TOKEN)),
        other => panic!("unexpected error {other}"),
    }
    // No rollback: synced files stay.
    assert!(layout.bin_dir.join("k3s").exists());
}
