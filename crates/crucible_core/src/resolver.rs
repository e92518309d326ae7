use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use oxc_resolver::{ResolveOptions, Resolver};
use regex::Regex;

use crate::config::ProjectConfig;
use crate::error::RuntimeError;

/// Stable identifier collapsing every request that reaches the same file or
/// the same virtual mock key.
pub type ModuleId = String;

const ID_SEP: char = '\u{1f}';

pub struct ModuleResolver {
    config: ProjectConfig,
    resolver: Resolver,
    core_modules: Vec<String>,
    name_mapper: Vec<(Regex, String)>,
    id_cache: RefCell<HashMap<String, ModuleId>>,
}

impl ModuleResolver {
    pub fn new(config: &ProjectConfig, core_modules: &[&str]) -> Result<Self, RuntimeError> {
        let options = ResolveOptions {
            extensions: config
                .module_file_extensions
                .iter()
                .map(|e| format!(".{}", e))
                .collect(),
            modules: config.module_directories.clone(),
            main_fields: vec!["main".into()],
            condition_names: vec!["require".into(), "node".into()],
            // Keep logical paths; registry keys must match what callers see.
            symlinks: false,
            ..ResolveOptions::default()
        };
        let resolver = Resolver::new(options);

        let mut name_mapper = Vec::new();
        for rule in &config.module_name_mapper {
            let regex = Regex::new(&rule.pattern).map_err(|e| RuntimeError::InvalidConfig {
                message: format!("bad moduleNameMapper pattern '{}': {}", rule.pattern, e),
            })?;
            name_mapper.push((regex, rule.replacement.clone()));
        }

        Ok(ModuleResolver {
            config: config.clone(),
            resolver,
            core_modules: core_modules.iter().map(|s| s.to_string()).collect(),
            name_mapper,
            id_cache: RefCell::new(HashMap::new()),
        })
    }

    /// Translate `(from, request)` to an absolute module path.
    pub fn resolve_module(&self, from: &Path, request: &str) -> Result<PathBuf, RuntimeError> {
        if let Some(stub) = self.resolve_stub_module_name(from, request) {
            return Ok(stub);
        }
        let dir = containing_dir(from);
        match self.resolver.resolve(dir, request) {
            Ok(resolution) => Ok(normalize_path(resolution.path())),
            Err(_) => Err(RuntimeError::module_not_found(from, request)),
        }
    }

    pub fn is_core_module(&self, request: &str) -> bool {
        self.core_modules.iter().any(|m| m == request)
    }

    /// Absolute path for a name the project pre-registered; bare requests
    /// resolve through the module directories only, so this answers `None`
    /// unless the request is already an existing absolute path.
    pub fn get_module(&self, request: &str) -> Option<PathBuf> {
        let path = Path::new(request);
        if path.is_absolute() && path.exists() {
            return Some(normalize_path(path));
        }
        None
    }

    /// Locate a manual mock for the request: bare-specifier mocks under each
    /// root's `__mocks__` directory first, then name-mapper stubs.
    pub fn get_mock_module(&self, from: &Path, request: &str) -> Option<PathBuf> {
        if !request.starts_with('.') && !Path::new(request).is_absolute() {
            for root in &self.config.roots {
                let mocks_dir = root.join("__mocks__");
                let exact = mocks_dir.join(request);
                if exact.is_file() {
                    return Some(normalize_path(&exact));
                }
                for ext in &self.config.module_file_extensions {
                    let candidate = mocks_dir.join(format!("{}.{}", request, ext));
                    if candidate.is_file() {
                        return Some(normalize_path(&candidate));
                    }
                }
            }
        }
        self.resolve_stub_module_name(from, request)
    }

    /// The key a virtual mock registers under: the request itself for bare
    /// names, the normalized join for relative ones.
    pub fn get_module_path(&self, from: &Path, request: &str) -> PathBuf {
        if !request.starts_with('.') || Path::new(request).is_absolute() {
            return PathBuf::from(request);
        }
        normalize_path(&containing_dir(from).join(request))
    }

    /// Memoized module id for `(from, request)`.
    pub fn get_module_id(
        &self,
        virtual_mocks: &HashSet<PathBuf>,
        from: &Path,
        request: Option<&str>,
    ) -> ModuleId {
        let cache_key = format!("{}\u{0}{}", from.display(), request.unwrap_or(""));
        if let Some(id) = self.id_cache.borrow().get(&cache_key) {
            return id.clone();
        }

        let id = self.build_module_id(virtual_mocks, from, request);
        self.id_cache
            .borrow_mut()
            .insert(cache_key, id.clone());
        id
    }

    fn build_module_id(
        &self,
        virtual_mocks: &HashSet<PathBuf>,
        from: &Path,
        request: Option<&str>,
    ) -> ModuleId {
        // The id of a file taken as its own module: same shape as a
        // resolved request with no manual mock, so the two compare equal.
        let Some(request) = request else {
            return format!("user{}{}{}", ID_SEP, normalize_path(from).display(), ID_SEP);
        };
        if self.is_core_module(request) {
            return format!("core{}{}", ID_SEP, request);
        }

        let mock_path = self.get_module_path(from, request);
        let target = if virtual_mocks.contains(&mock_path) {
            mock_path.clone()
        } else {
            match self.resolve_module(from, request) {
                Ok(path) => path,
                Err(_) => mock_path.clone(),
            }
        };
        let manual = self
            .get_mock_module(from, request)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        format!("user{}{}{}{}", ID_SEP, target.display(), ID_SEP, manual)
    }

    /// Walk-up chain of module directories for `dir`.
    pub fn get_module_paths(&self, dir: &Path) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for ancestor in dir.ancestors() {
            for module_dir in &self.config.module_directories {
                if ancestor.file_name().map(|n| n.to_string_lossy().to_string())
                    != Some(module_dir.clone())
                {
                    paths.push(ancestor.join(module_dir));
                }
            }
        }
        paths
    }

    /// Apply the name-mapper rules and resolve the replacement.
    pub fn resolve_stub_module_name(&self, _from: &Path, request: &str) -> Option<PathBuf> {
        for (regex, replacement) in &self.name_mapper {
            if !regex.is_match(request) {
                continue;
            }
            let mapped = regex.replace(request, replacement.as_str()).to_string();
            let mapped = mapped.replace("<rootDir>", &self.config.root_dir.display().to_string());

            let candidate = Path::new(&mapped);
            if candidate.is_absolute() && candidate.exists() {
                return Some(normalize_path(candidate));
            }
            if let Ok(resolution) = self.resolver.resolve(&self.config.root_dir, &mapped) {
                return Some(normalize_path(resolution.path()));
            }
        }
        None
    }

    /// Resolve `request` using `dir` as the root; `None` when nothing
    /// matches there.
    pub fn resolve_module_from_dir_if_exists(&self, dir: &Path, request: &str) -> Option<PathBuf> {
        self.resolver
            .resolve(dir, request)
            .ok()
            .map(|resolution| normalize_path(resolution.path()))
    }
}

fn containing_dir(from: &Path) -> &Path {
    if from.is_dir() {
        from
    } else {
        from.parent().unwrap_or_else(|| Path::new("/"))
    }
}

/// Logical normalization: collapse `.`/`..` without touching the
/// filesystem, so keys stay stable for files that do not exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => normalized.push(Component::RootDir),
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
        }
    }
    normalized
}
