use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One module-name-mapper rule: requests matching `pattern` resolve through
/// `replacement` ($1-style captures and `<rootDir>` are substituted).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NameMapperRule {
    pub pattern: String,
    pub replacement: String,
}

/// Pre-resolved project configuration handed to the runtime at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub root_dir: PathBuf,
    pub roots: Vec<PathBuf>,
    pub module_file_extensions: Vec<String>,
    pub module_directories: Vec<String>,
    pub module_name_mapper: Vec<NameMapperRule>,
    /// Paths matching any of these patterns are never auto-mocked.
    pub unmocked_module_path_patterns: Vec<String>,
    pub automock: bool,
    pub setup_files: Vec<PathBuf>,
    /// Global names injected as extra synthetic arguments, in order.
    pub extra_globals: Vec<String>,
    pub collect_coverage: bool,
    pub cache_directory: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        ProjectConfig {
            root_dir: PathBuf::from("."),
            roots: vec![PathBuf::from(".")],
            module_file_extensions: vec![
                "ts".into(),
                "tsx".into(),
                "js".into(),
                "jsx".into(),
                "json".into(),
            ],
            module_directories: vec!["node_modules".into()],
            module_name_mapper: Vec::new(),
            unmocked_module_path_patterns: Vec::new(),
            automock: false,
            setup_files: Vec::new(),
            extra_globals: Vec::new(),
            collect_coverage: false,
            cache_directory: PathBuf::from(".crucible_cache"),
        }
    }
}

impl ProjectConfig {
    /// Config rooted at `root` with the cache kept inside it.
    pub fn with_root(root: &Path) -> ProjectConfig {
        ProjectConfig {
            root_dir: root.to_path_buf(),
            roots: vec![root.to_path_buf()],
            cache_directory: root.join(".crucible_cache"),
            ..ProjectConfig::default()
        }
    }

    /// Digest over everything that affects transform output; the disk cache
    /// is scoped by this, so config changes never serve stale entries.
    pub fn transform_generation(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            serde_json::to_vec(&(
                &self.module_file_extensions,
                &self.extra_globals,
                self.collect_coverage,
            ))
            .unwrap_or_default(),
        );
        let digest = hasher.finalize();
        format!("{:x}", digest)[..16].to_string()
    }
}
