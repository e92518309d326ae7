use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crucible_env::Value;

use crate::module::Module;
use crate::resolver::ModuleId;

/// Path-keyed module store. Reset is wholesale replacement at the runtime
/// level, so the registry itself only knows lookup and insert.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<PathBuf, Module>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    pub fn get(&self, path: &Path) -> Option<Module> {
        self.modules.get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.modules.contains_key(path)
    }

    pub fn insert(&mut self, module: Module) {
        self.modules.insert(module.filename().to_path_buf(), module);
    }

    pub fn remove(&mut self, path: &Path) {
        self.modules.remove(path);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Id-keyed mock store mirroring the module registry.
#[derive(Default)]
pub struct MockRegistry {
    mocks: HashMap<ModuleId, Value>,
}

impl MockRegistry {
    pub fn new() -> MockRegistry {
        MockRegistry::default()
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.mocks.get(id).cloned()
    }

    pub fn insert(&mut self, id: ModuleId, value: Value) {
        self.mocks.insert(id, value);
    }

    pub fn len(&self) -> usize {
        self.mocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_roundtrip() {
        let mut registry = ModuleRegistry::new();
        let module = Module::new(PathBuf::from("/src/a.js"), None);
        registry.insert(module.clone());

        let found = registry.get(Path::new("/src/a.js")).unwrap();
        assert!(Value::same_identity(&found.facade(), &module.facade()));

        registry.remove(Path::new("/src/a.js"));
        assert!(registry.get(Path::new("/src/a.js")).is_none());
    }
}
