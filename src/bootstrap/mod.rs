//! Join a new machine to a running cluster.
//!
//! The sequence is strictly ordered and aborts on the first failure:
//!
//! 1. discover the leader address from the local control-plane process
//! 2. load the sealed package
//! 3. read the join token for the requested role
//! 4. connect to the new node
//! 5. copy binaries, then scripts, then images, then manifests
//! 6. run the install script with the join URL and token in its environment
//!
//! The node and the package are closed on every exit path. Nothing is rolled
//! back: a node that fails mid-sync keeps whatever was already copied.

mod layout;

pub use layout::{ControlPlane, InstallLayout, Role};

use std::fmt;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::artifact::ArtifactType;
use crate::error::{Error, IoContext, Result};
use crate::node::{shell_quote, LocalNode, Node, SharedSink, ShellCommand, SshOptions, Transport};
use crate::package::{Manifest, Package, StoreKind};

/// Categories copied to a node, in copy order. Later categories may depend
/// on earlier ones being present.
pub const SYNC_ORDER: [ArtifactType; 4] = [
    ArtifactType::Binary,
    ArtifactType::Script,
    ArtifactType::Image,
    ArtifactType::Manifest,
];

/// Everything the install script needs to register with the leader.
#[derive(Clone)]
pub struct JoinPlan {
    pub leader: Ipv4Addr,
    pub port: u16,
    pub token: String,
    pub role: Role,
}

impl JoinPlan {
    pub fn url(&self) -> String {
        format!("https://{}:{}", self.leader, self.port)
    }
}

impl fmt::Debug for JoinPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinPlan")
            .field("url", &self.url())
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// One artifact copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStep {
    pub kind: ArtifactType,
    pub name: String,
    pub dest: PathBuf,
    pub mode: u32,
}

/// Copy steps for `manifest`, grouped by category in [`SYNC_ORDER`] and in
/// manifest order within a category.
pub fn sync_plan(manifest: &Manifest, layout: &InstallLayout) -> Vec<SyncStep> {
    let mut steps = Vec::new();
    for kind in SYNC_ORDER {
        for name in manifest.names(kind) {
            let Some(dest) = layout.target_path(kind, name) else {
                continue;
            };
            steps.push(SyncStep {
                kind,
                name: name.clone(),
                dest,
                mode: kind.mode(),
            });
        }
    }
    steps
}

/// Stream every installable artifact of `package` onto `node`.
pub fn sync_artifacts<T: Transport + ?Sized>(
    package: &Package,
    layout: &InstallLayout,
    node: &mut T,
) -> Result<usize> {
    let steps = sync_plan(package.manifest(), layout);
    for step in &steps {
        let mut artifact = package.get(step.kind, &step.name)?;
        let body = artifact
            .take_body()
            .ok_or_else(|| Error::malformed("artifact", format!("{} has no body", step.name)))?;
        node.write_file(body, &step.dest, step.mode, artifact.size)?;
        debug!(
            node = node.target(),
            kind = %step.kind,
            name = %step.name,
            dest = %step.dest.display(),
            "synced artifact"
        );
    }
    info!(node = node.target(), count = steps.len(), "artifacts synced");
    Ok(steps.len())
}

/// Read the role's join token from `leader`.
pub fn read_join_token<T: Transport + ?Sized>(
    leader: &mut T,
    layout: &InstallLayout,
    role: Role,
) -> Result<String> {
    let path = layout.token_path(role);
    let mut token = String::new();
    leader
        .get_file(path)?
        .read_to_string(&mut token)
        .io_context(|| format!("reading join token {}", path.display()))?;
    let token = token.trim();
    if token.is_empty() {
        return Err(Error::malformed(
            "join token",
            format!("{} is empty", path.display()),
        ));
    }
    Ok(token.to_string())
}

/// The install script invocation for `plan`. The token is redacted from logs.
pub fn install_command(layout: &InstallLayout, plan: &JoinPlan) -> ShellCommand {
    let script = format!(
        "sh {} {}",
        shell_quote(&layout.install_script_path().to_string_lossy()),
        plan.role
    );
    let mut command = ShellCommand::new(script);
    for (key, value) in &layout.extra_env {
        command = command.env(key, value);
    }
    command
        .env(&layout.url_env, plan.url())
        .secret_env(&layout.token_env, &plan.token)
}

/// Run the install script on `node`.
pub fn join<T: Transport + ?Sized>(
    node: &mut T,
    layout: &InstallLayout,
    plan: &JoinPlan,
) -> Result<()> {
    info!(node = node.target(), url = %plan.url(), role = %plan.role, "joining cluster");
    let prefix = format!("[{}]", node.target());
    node.execute(&install_command(layout, plan), &prefix)
}

/// Inputs to [`add_node`].
#[derive(Debug, Clone)]
pub struct AddNodeOptions {
    /// Sealed archive the leader was installed from.
    pub package: PathBuf,
    /// Expected SHA-256 of the archive, checked before loading.
    pub sha256: Option<String>,
    pub role: Role,
    pub layout: InstallLayout,
    pub control_plane: ControlPlane,
    pub store: StoreKind,
}

impl AddNodeOptions {
    pub fn new(package: impl Into<PathBuf>) -> Self {
        Self {
            package: package.into(),
            sha256: None,
            role: Role::default(),
            layout: InstallLayout::default(),
            control_plane: ControlPlane::default(),
            store: StoreKind::default(),
        }
    }
}

/// Join the host described by `ssh`, running on the leader machine.
pub fn add_node(opts: &AddNodeOptions, ssh: &SshOptions, sink: SharedSink) -> Result<()> {
    let mut leader = LocalNode::new(sink.clone());
    add_node_with(opts, &mut leader, || Node::connect(ssh, sink))
}

/// [`add_node`] with an explicit leader and node factory.
pub fn add_node_with<L, N, F>(opts: &AddNodeOptions, leader: &mut L, connect: F) -> Result<()>
where
    L: Transport + ?Sized,
    N: Transport,
    F: FnOnce() -> Result<N>,
{
    let cp = &opts.control_plane;
    let leader_addr = leader.listen_address(&cp.process, cp.port)?;
    info!(leader = %leader_addr, process = %cp.process, "discovered control plane");

    let package = match &opts.sha256 {
        Some(sha) => Package::load_verified(&opts.package, sha, opts.store)?,
        None => Package::load(&opts.package, opts.store)?,
    };
    let joined = join_with_package(opts, leader, leader_addr, &package, connect);
    let closed = package.close();
    joined.and(closed)
}

fn join_with_package<L, N, F>(
    opts: &AddNodeOptions,
    leader: &mut L,
    leader_addr: Ipv4Addr,
    package: &Package,
    connect: F,
) -> Result<()>
where
    L: Transport + ?Sized,
    N: Transport,
    F: FnOnce() -> Result<N>,
{
    let plan = JoinPlan {
        leader: leader_addr,
        port: opts.control_plane.port,
        token: read_join_token(leader, &opts.layout, opts.role)?,
        role: opts.role,
    };

    let mut node = connect()?;
    let result = sync_artifacts(package, &opts.layout, &mut node)
        .and_then(|_| join(&mut node, &opts.layout, &plan));
    let closed = node.close();
    result.and(closed)?;
    info!(node = node.target(), role = %plan.role, "node joined");
    Ok(())
}
