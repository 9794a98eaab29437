//! Package metadata and the per-type artifact listing embedded in it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactType;

pub const SCHEMA_VERSION: u32 = 1;

/// Ordered listing of artifact names per type.
///
/// Names are stored unqualified (no type directory prefix). Order within a
/// type is insertion order and is the order nodes receive the payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binaries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eula: Vec<String>,
    #[serde(default, rename = "static", skip_serializing_if = "Vec::is_empty")]
    pub statics: Vec<String>,
}

impl Manifest {
    pub fn names(&self, kind: ArtifactType) -> &[String] {
        match kind {
            ArtifactType::Binary => &self.binaries,
            ArtifactType::Script => &self.scripts,
            ArtifactType::Image => &self.images,
            ArtifactType::Manifest => &self.manifests,
            ArtifactType::Eula => &self.eula,
            ArtifactType::Static => &self.statics,
        }
    }

    fn names_mut(&mut self, kind: ArtifactType) -> &mut Vec<String> {
        match kind {
            ArtifactType::Binary => &mut self.binaries,
            ArtifactType::Script => &mut self.scripts,
            ArtifactType::Image => &mut self.images,
            ArtifactType::Manifest => &mut self.manifests,
            ArtifactType::Eula => &mut self.eula,
            ArtifactType::Static => &mut self.statics,
        }
    }

    pub fn contains(&self, kind: ArtifactType, name: &str) -> bool {
        self.names(kind).iter().any(|n| n == name)
    }

    /// Append `name` unless it is already listed. Returns `true` when added.
    pub(crate) fn insert(&mut self, kind: ArtifactType, name: &str) -> bool {
        if self.contains(kind, name) {
            return false;
        }
        self.names_mut(kind).push(name.to_string());
        true
    }

    /// Every `(kind, name)` pair, grouped by kind in [`ArtifactType::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (ArtifactType, &str)> + '_ {
        ArtifactType::ALL
            .into_iter()
            .flat_map(move |kind| self.names(kind).iter().map(move |n| (kind, n.as_str())))
    }

    pub fn len(&self) -> usize {
        ArtifactType::ALL.iter().map(|k| self.names(*k).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Archive-level metadata, serialized as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMeta {
    pub schema_version: u32,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub runtime_version: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub manifest: Manifest,
    /// sha256 per storage path.
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

impl PackageMeta {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            name: name.to_string(),
            version: version.to_string(),
            runtime_version: String::new(),
            arch: String::new(),
            created_at: now_rfc3339(),
            manifest: Manifest::default(),
            checksums: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, update: MetaUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(version) = update.version {
            self.version = version;
        }
        if let Some(runtime_version) = update.runtime_version {
            self.runtime_version = runtime_version;
        }
        if let Some(arch) = update.arch {
            self.arch = arch;
        }
    }
}

/// Fields a caller may change after creation. `None` leaves the field as is.
#[derive(Debug, Clone, Default)]
pub struct MetaUpdate {
    pub name: Option<String>,
    pub version: Option<String>,
    pub runtime_version: Option<String>,
    pub arch: Option<String>,
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
