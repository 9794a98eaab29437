//! Operator configuration file.
//!
//! ```toml
//! [package]
//! name = "k3s-airgap"
//! version = "1.29.4"
//! compression = "zstd"
//!
//! [install]
//! bin_dir = "/opt/bin"
//!
//! [control_plane]
//! process = "k3s"
//! port = 6443
//!
//! [ssh]
//! user = "ubuntu"
//! key = "/home/ops/.ssh/edge"
//! ```
//!
//! Every section and field is optional.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bootstrap::{ControlPlane, InstallLayout};
use crate::error::{Error, IoContext, Result};
use crate::node::{SshAuth, SshOptions};
use crate::package::PackageConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub package: PackageConfig,
    pub install: InstallLayout,
    pub control_plane: ControlPlane,
    pub ssh: SshDefaults,
}

/// Connection defaults applied to every `node add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshDefaults {
    pub user: String,
    pub port: u16,
    pub key: Option<PathBuf>,
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            key: None,
        }
    }
}

impl SshDefaults {
    pub fn options(&self, address: &str) -> SshOptions {
        let opts = SshOptions::new(address).user(&self.user).port(self.port);
        match &self.key {
            Some(key) => opts.auth(SshAuth::KeyFile(key.clone())),
            None => opts,
        }
    }
}

impl Config {
    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .io_context(|| format!("reading config {}", path.display()))?;
        let config = Self::parse(&text, path)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/edgepack/config.toml`, if a config dir is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("edgepack").join("config.toml"))
    }

    /// Load the default file, or defaults when there is none.
    pub fn load_default() -> Result<Self> {
        let Some(path) = Self::default_path() else {
            return Ok(Self::default());
        };
        match fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text, &path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).io_context(|| format!("reading config {}", path.display())),
        }
    }
}
