use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Where each executed file's generated source map landed, plus the subset
/// whose coverage must be remapped through the sidecar.
#[derive(Default)]
pub struct SourceMapRegistry {
    maps: HashMap<PathBuf, PathBuf>,
    needs_coverage_mapped: HashSet<PathBuf>,
}

impl SourceMapRegistry {
    pub fn new() -> SourceMapRegistry {
        SourceMapRegistry::default()
    }

    pub fn register(&mut self, file: &Path, map: &Path, needs_coverage_map: bool) {
        self.maps.insert(file.to_path_buf(), map.to_path_buf());
        if needs_coverage_map {
            self.needs_coverage_mapped.insert(file.to_path_buf());
        }
    }

    pub fn get(&self, file: &Path) -> Option<&PathBuf> {
        self.maps.get(file)
    }

    pub fn all(&self) -> HashMap<PathBuf, PathBuf> {
        self.maps.clone()
    }

    /// Restrict to files that are in `files`, flagged for coverage
    /// remapping, and whose sidecar still exists on disk.
    pub fn filtered_for_files(&self, files: &HashSet<PathBuf>) -> HashMap<PathBuf, PathBuf> {
        self.maps
            .iter()
            .filter(|(file, map)| {
                files.contains(*file)
                    && self.needs_coverage_mapped.contains(*file)
                    && map.exists()
            })
            .map(|(file, map)| (file.clone(), map.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_filtered_requires_flag_and_sidecar() {
        let mut dir = std::env::temp_dir();
        dir.push("crucible_sourcemap_tests");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let existing = dir.join("a.map");
        fs::write(&existing, "{}").unwrap();
        let missing = dir.join("b.map");

        let mut registry = SourceMapRegistry::new();
        registry.register(Path::new("/src/a.js"), &existing, true);
        registry.register(Path::new("/src/b.js"), &missing, true);
        registry.register(Path::new("/src/c.js"), &existing, false);

        let mut files = HashSet::new();
        files.insert(PathBuf::from("/src/a.js"));
        files.insert(PathBuf::from("/src/b.js"));
        files.insert(PathBuf::from("/src/c.js"));

        let filtered = registry.filtered_for_files(&files);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get(Path::new("/src/a.js")), Some(&existing));
    }
}
