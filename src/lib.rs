//! Package an air-gapped Kubernetes distribution and join machines with it.
//!
//! - **Package archive engine** - content-addressed, single-file archives of
//!   binaries, images, scripts and manifests with an embedded manifest
//! - **Node transport** - one capability set over the local shell, SSH hosts
//!   and containers
//! - **Address discovery** - finds the control plane address from the kernel
//!   socket tables
//! - **Bootstrap** - syncs a package onto a new node and runs the join
//!
//! # Architecture
//!
//! ```text
//! build output ──► Package::put ──► Package::archive ──► bundle.tar[.zst]
//!                                                             │
//! leader: discovery ──► bootstrap::add_node ◄── Package::load ┘
//!                              │
//!                              ▼
//!                 Node (local | ssh | container)
//!                   write_file ... execute(install.sh)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use edgepack::artifact::{Artifact, ArtifactType};
//! use edgepack::package::{Package, PackageConfig};
//!
//! let mut package = Package::create(&PackageConfig::default())?;
//! package.put(Artifact::from_file(ArtifactType::Binary, "k3s", "out/k3s".as_ref())?)?;
//! package.archive()?.persist("bundle.tar".as_ref())?;
//! package.close()?;
//! ```

pub mod artifact;
pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod error;
pub mod node;
pub mod package;

pub use error::{Error, Result};
