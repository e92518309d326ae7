//! Source-to-script pipeline with a write-through disk cache.
//!
//! Output is keyed by a digest over the source text and the flags that shape
//! it, and scoped by the config generation, so concurrent runtimes can share
//! the store and config changes never serve stale entries.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use cache::{StoreScope, TransformStore};
use crucible_env::Script;
use oxc_allocator::Allocator;
use oxc_codegen::{Codegen, CodegenOptions};
use oxc_parser::Parser;
use oxc_span::SourceType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ProjectConfig;
use crate::error::RuntimeError;

pub struct TransformResult {
    pub script: Rc<Script>,
    pub source_map_path: Option<PathBuf>,
    pub should_map_coverage: bool,
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    code: String,
    map: Option<String>,
}

pub struct ScriptTransformer {
    config: ProjectConfig,
    // Keeps the store open for the scope's lifetime.
    _store: TransformStore,
    scope: StoreScope,
    maps_dir: PathBuf,
    memo: RefCell<HashMap<(PathBuf, bool), Rc<TransformResult>>>,
    source_overrides: HashMap<PathBuf, String>,
}

impl ScriptTransformer {
    pub fn new(
        config: &ProjectConfig,
        source_overrides: Option<HashMap<PathBuf, String>>,
    ) -> Result<ScriptTransformer, RuntimeError> {
        let maps_dir = config.cache_directory.join("maps");
        fs::create_dir_all(&maps_dir)?;

        let store_path = config.cache_directory.join("store");
        let store = TransformStore::open(&store_path.display().to_string())
            .map_err(|e| RuntimeError::Store(e.to_string()))?;
        let scope = store
            .scope(&config.transform_generation())
            .map_err(|e| RuntimeError::Store(e.to_string()))?;

        Ok(ScriptTransformer {
            config: config.clone(),
            _store: store,
            scope,
            maps_dir,
            memo: RefCell::new(HashMap::new()),
            source_overrides: source_overrides.unwrap_or_default(),
        })
    }

    /// Coverage applies to files under a root, outside module directories.
    pub fn should_instrument(&self, path: &Path) -> bool {
        if !self.config.collect_coverage {
            return false;
        }
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            return false;
        }
        let under_module_dir = path.components().any(|c| {
            self.config
                .module_directories
                .iter()
                .any(|dir| c.as_os_str() == dir.as_str())
        });
        if under_module_dir {
            return false;
        }
        self.config.roots.iter().any(|root| path.starts_with(root))
    }

    pub fn transform(
        &self,
        path: &Path,
        instrument: bool,
    ) -> Result<Rc<TransformResult>, RuntimeError> {
        let memo_key = (path.to_path_buf(), instrument);
        if let Some(result) = self.memo.borrow().get(&memo_key) {
            return Ok(result.clone());
        }

        let source = match self.source_overrides.get(path) {
            Some(source) => source.clone(),
            None => fs::read_to_string(path)?,
        };

        let entry = if path.extension().map(|e| e == "json").unwrap_or(false) {
            CacheEntry {
                code: format!("module.exports = {};", source.trim()),
                map: None,
            }
        } else {
            self.cached_codegen(path, &source, instrument)?
        };

        let source_map_path = match &entry.map {
            Some(map) => Some(self.write_sidecar(path, &source, instrument, map)?),
            None => None,
        };

        let script = Script::compile(path, &entry.code, instrument, &self.config.extra_globals)?;
        let result = Rc::new(TransformResult {
            script: Rc::new(script),
            source_map_path,
            should_map_coverage: instrument && entry.map.is_some(),
        });
        self.memo.borrow_mut().insert(memo_key, result.clone());
        Ok(result)
    }

    fn cached_codegen(
        &self,
        path: &Path,
        source: &str,
        instrument: bool,
    ) -> Result<CacheEntry, RuntimeError> {
        let digest = content_digest(path, source, instrument);
        if let Ok(Some(bytes)) = self.scope.get(&digest) {
            if let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) {
                return Ok(entry);
            }
        }

        let allocator = Allocator::default();
        let source_type = SourceType::from_path(path).unwrap_or_default();
        let ret = Parser::new(&allocator, source, source_type).parse();
        if let Some(first) = ret.errors.first() {
            return Err(RuntimeError::Transform {
                path: path.to_path_buf(),
                message: format!("{:?}", first),
            });
        }

        let generated = Codegen::new()
            .with_options(CodegenOptions {
                source_map_path: Some(path.to_path_buf()),
                ..CodegenOptions::default()
            })
            .build(&ret.program);

        let entry = CacheEntry {
            code: generated.code,
            map: generated.map.map(|m| m.to_json_string()),
        };
        if let Ok(bytes) = serde_json::to_vec(&entry) {
            if let Err(e) = self.scope.put(&digest, &bytes) {
                tracing::warn!("transform store write failed for {}: {}", path.display(), e);
            }
        }
        Ok(entry)
    }

    fn write_sidecar(
        &self,
        path: &Path,
        source: &str,
        instrument: bool,
        map: &str,
    ) -> Result<PathBuf, RuntimeError> {
        let digest = content_digest(path, source, instrument);
        let sidecar = self.maps_dir.join(format!("{}.map", digest));
        if !sidecar.exists() {
            fs::write(&sidecar, map)?;
        }
        Ok(sidecar)
    }
}

fn content_digest(path: &Path, source: &str, instrument: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.display().to_string().as_bytes());
    hasher.update([instrument as u8]);
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}
