//! Catalogue of the maintenance scripts a job can run.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Whether a script only produces artifacts or edits the content checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArgKind {
    Text,
    /// A published spreadsheet link, downloaded before the script runs.
    File { file_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub param: String,
    #[serde(flatten)]
    pub kind: ArgKind,
    pub title: String,
    pub description: String,
    pub example: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<ArgSpec>,
    #[serde(rename = "type")]
    pub output: OutputKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptRegistry {
    scripts: BTreeMap<String, ScriptInfo>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, info: ScriptInfo) {
        self.scripts.insert(name.into(), info);
    }

    pub fn get(&self, name: &str) -> Option<&ScriptInfo> {
        self.scripts.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scripts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Loads a registry from a JSON object keyed by script name.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading script registry {}", path.display()))?;
        let registry: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing script registry {}", path.display()))?;
        for (name, _) in registry.scripts.iter() {
            if !is_valid_script_name(name) {
                anyhow::bail!("script name `{name}` must be lower-case letters and underscores");
            }
        }
        Ok(registry)
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::builtin()),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.insert(
            "list_question_data",
            ScriptInfo {
                description: "Lists paths, ids and related content for question pages".into(),
                arguments: vec![],
                output: OutputKind::Read,
            },
        );
        registry.insert(
            "link_checker",
            ScriptInfo {
                description: "Checks links across the content repository".into(),
                arguments: vec![ArgSpec {
                    param: "eps".into(),
                    kind: ArgKind::Text,
                    title: "Extra paths".into(),
                    description: "A semi-colon-separated list of extra paths to check against, \
                                  in addition to the default paths."
                        .into(),
                    example: "/pages/about_us;/pages/another_new_page;/questions/a_question_id"
                        .into(),
                }],
                output: OutputKind::Read,
            },
        );
        registry.insert(
            "find_broken_image_links",
            ScriptInfo {
                description: "Finds figures whose src does not point to an existing file".into(),
                arguments: vec![],
                output: OutputKind::Read,
            },
        );
        registry.insert(
            "compress_svgs",
            ScriptInfo {
                description: "Compresses all SVGs in the content repository".into(),
                arguments: vec![],
                output: OutputKind::Write,
            },
        );
        registry.insert(
            "image_renaming",
            ScriptInfo {
                description: "Renames images in the content repository".into(),
                arguments: vec![ArgSpec {
                    param: "csv".into(),
                    kind: ArgKind::File {
                        file_type: "csv".into(),
                    },
                    title: "Image renaming specification".into(),
                    description: "A CSV file containing the old filename and new name of images. \
                                  Schema: `old_name.ext,new_name`"
                        .into(),
                    example: "bus_connections,ada_cs_arch_bus_connections".into(),
                }],
                output: OutputKind::Write,
            },
        );
        registry.insert(
            "image_list",
            ScriptInfo {
                description: "Lists all images in the content repository".into(),
                arguments: vec![],
                output: OutputKind::Read,
            },
        );
        registry.insert(
            "image_duplicates",
            ScriptInfo {
                description: "Dedupe images in the content repository".into(),
                arguments: vec![],
                output: OutputKind::Write,
            },
        );

        registry
    }
}

/// Script names end up in file paths, so only `[a-z_]+` is accepted.
pub fn is_valid_script_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_catalogue() {
        let registry = ScriptRegistry::builtin();
        assert_eq!(registry.len(), 7);
        assert_eq!(
            registry.get("image_renaming").unwrap().output,
            OutputKind::Write
        );
        let eps = &registry.get("link_checker").unwrap().arguments[0];
        assert_eq!(eps.kind, ArgKind::Text);
    }

    #[test]
    fn arg_kind_uses_flat_type_tag() {
        let spec: ArgSpec = serde_json::from_value(json!({
            "param": "csv",
            "type": "file",
            "file_type": "csv",
            "title": "t",
            "description": "d",
            "example": "e"
        }))
        .unwrap();
        assert_eq!(
            spec.kind,
            ArgKind::File {
                file_type: "csv".into()
            }
        );
    }

    #[test]
    fn registry_file_rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scripts.json");
        std::fs::write(
            &path,
            json!({ "../evil": { "description": "x", "type": "read" } }).to_string(),
        )
        .unwrap();
        assert!(ScriptRegistry::from_file(&path).is_err());

        std::fs::write(
            &path,
            json!({ "image_list": { "description": "x", "type": "read" } }).to_string(),
        )
        .unwrap();
        let registry = ScriptRegistry::from_file(&path).unwrap();
        assert!(registry.get("image_list").unwrap().arguments.is_empty());
    }

    #[test]
    fn script_name_validation() {
        assert!(is_valid_script_name("image_list"));
        assert!(!is_valid_script_name("Image"));
        assert!(!is_valid_script_name("a/b"));
        assert!(!is_valid_script_name(""));
    }
}
