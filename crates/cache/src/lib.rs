//! Content-addressed transform store backed by sled

use anyhow::Result;
use sled::{Db, Tree};

/// Write-through disk store for transformed scripts.
///
/// Keys are content digests computed by the caller, so identical keys always
/// map to identical payloads and last-writer-wins between concurrent
/// runtimes is harmless.
pub struct TransformStore {
    db: Db,
}

impl TransformStore {
    /// Open or create a store database
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A scoped view isolating one transform-config generation
    pub fn scope(&self, name: &str) -> Result<StoreScope> {
        let tree = self.db.open_tree(name)?;
        Ok(StoreScope { tree })
    }

    /// Drop every scope
    pub fn clear(&self) -> Result<()> {
        for name in self.db.tree_names() {
            self.db.drop_tree(name)?;
        }
        Ok(())
    }
}

/// One transform-config generation of the store.
pub struct StoreScope {
    tree: Tree,
}

impl StoreScope {
    /// Store a digest-keyed entry
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.tree.insert(key, value)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Retrieve an entry by digest
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> Result<()> {
        self.tree.remove(key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(name: &str) -> TransformStore {
        let mut path = std::env::temp_dir();
        path.push("crucible_cache_tests");
        path.push(name);
        if path.exists() {
            std::fs::remove_dir_all(&path).unwrap();
        }
        TransformStore::open(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_store_operations() {
        let store = open_store("ops");
        let scope = store.scope("gen-1").unwrap();

        scope.put("abc123", b"transformed").unwrap();
        let result = scope.get("abc123").unwrap();
        assert_eq!(result, Some(b"transformed".to_vec()));

        scope.remove("abc123").unwrap();
        let result = scope.get("abc123").unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_scopes_are_isolated() {
        let store = open_store("scopes");
        let a = store.scope("gen-a").unwrap();
        let b = store.scope("gen-b").unwrap();

        a.put("k", b"1").unwrap();
        assert_eq!(b.get("k").unwrap(), None);

        store.clear().unwrap();
        let a = store.scope("gen-a").unwrap();
        assert_eq!(a.get("k").unwrap(), None);
    }
}
