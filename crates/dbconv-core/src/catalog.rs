use crate::record::SourceKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix for identifiers of user-supplied databases, keeps them out of the catalog namespace.
pub const CUSTOM_PREFIX: &str = "custom_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source_path: PathBuf,
}

impl CatalogEntry {
    pub fn id(&self) -> String {
        catalog_id(&self.name)
    }
}

pub fn catalog_id(name: &str) -> String {
    name.trim().to_string()
}

pub fn custom_id(source_path: &Path) -> String {
    let base = source_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let base = sanitize_component(base.trim());
    if base.is_empty() {
        format!("{CUSTOM_PREFIX}database")
    } else {
        format!("{CUSTOM_PREFIX}{base}")
    }
}

/// Catalog entries keep their canonical name, custom ones are derived from the path.
pub fn derive_id(kind: SourceKind, name: &str, source_path: &Path) -> String {
    match kind {
        SourceKind::Catalog => catalog_id(name),
        SourceKind::Custom => custom_id(source_path),
    }
}

pub fn display_name(id: &str) -> &str {
    id.strip_prefix(CUSTOM_PREFIX).unwrap_or(id)
}

pub fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
