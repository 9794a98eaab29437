//! Where artifacts and join secrets live on a cluster machine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactType;
use crate::error::Error;

/// Part a joining node plays in the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Control-plane peer.
    Server,
    /// Worker.
    #[default]
    Agent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Agent => "agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Role::Server),
            "agent" | "worker" => Ok(Role::Agent),
            other => Err(Error::malformed(
                "role",
                format!("'{other}' (expected 'server' or 'agent')"),
            )),
        }
    }
}

/// Target directories, token files and install script contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallLayout {
    pub bin_dir: PathBuf,
    pub script_dir: PathBuf,
    pub image_dir: PathBuf,
    pub manifest_dir: PathBuf,
    pub server_token: PathBuf,
    pub agent_token: PathBuf,
    /// Script name inside `script_dir`.
    pub install_script: String,
    pub url_env: String,
    pub token_env: String,
    /// Passed to the install script as-is.
    pub extra_env: BTreeMap<String, String>,
}

impl Default for InstallLayout {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("/usr/local/bin"),
            script_dir: PathBuf::from("/usr/local/share/edgepack/scripts"),
            image_dir: PathBuf::from("/var/lib/rancher/k3s/agent/images"),
            manifest_dir: PathBuf::from("/var/lib/rancher/k3s/server/manifests"),
            server_token: PathBuf::from("/var/lib/rancher/k3s/server/token"),
            agent_token: PathBuf::from("/var/lib/rancher/k3s/server/agent-token"),
            install_script: "install.sh".to_string(),
            url_env: "K3S_URL".to_string(),
            token_env: "K3S_TOKEN".to_string(),
            extra_env: BTreeMap::from([(
                "INSTALL_K3S_SKIP_DOWNLOAD".to_string(),
                "true".to_string(),
            )]),
        }
    }
}

impl InstallLayout {
    /// Install directory for `kind`. Eula and static files stay in the package.
    pub fn target_dir(&self, kind: ArtifactType) -> Option<&Path> {
        match kind {
            ArtifactType::Binary => Some(&self.bin_dir),
            ArtifactType::Script => Some(&self.script_dir),
            ArtifactType::Image => Some(&self.image_dir),
            ArtifactType::Manifest => Some(&self.manifest_dir),
            ArtifactType::Eula | ArtifactType::Static => None,
        }
    }

    pub fn target_path(&self, kind: ArtifactType, name: &str) -> Option<PathBuf> {
        self.target_dir(kind).map(|dir| dir.join(name))
    }

    pub fn token_path(&self, role: Role) -> &Path {
        match role {
            Role::Server => &self.server_token,
            Role::Agent => &self.agent_token,
        }
    }

    pub fn install_script_path(&self) -> PathBuf {
        self.script_dir.join(&self.install_script)
    }
}

/// The already running control plane new nodes join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlPlane {
    pub process: String,
    pub port: u16,
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self {
            process: "k3s-server".to_string(),
            port: 6443,
        }
    }
}
