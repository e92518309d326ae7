//! The module object handed to executing code.
//!
//! All mutable state lives on the facade value itself, so the object user
//! code sees and the object the registry holds are one and the same: a
//! cyclic require reads whatever `exports` holds at that instant. `parent`
//! is a getter resolved against the current registry at read time; only the
//! originating path is stored.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use crucible_env::{NativeFn, Value};

#[derive(Clone)]
pub struct Module {
    inner: Rc<ModuleInner>,
}

struct ModuleInner {
    filename: PathBuf,
    parent_key: Option<PathBuf>,
    facade: Value,
}

impl Module {
    pub fn new(filename: PathBuf, parent_key: Option<PathBuf>) -> Module {
        let facade = Value::object();
        let name = filename.display().to_string();
        let _ = facade.set_property("id", Value::str(name.clone()));
        let _ = facade.set_property("filename", Value::str(name));
        let _ = facade.set_property("exports", Value::object());
        let _ = facade.set_property("loaded", Value::Bool(false));
        let _ = facade.set_property("children", Value::array(Vec::new()));
        let _ = facade.set_property("paths", Value::array(Vec::new()));
        Module {
            inner: Rc::new(ModuleInner {
                filename,
                parent_key,
                facade,
            }),
        }
    }

    pub fn filename(&self) -> &Path {
        &self.inner.filename
    }

    pub fn parent_key(&self) -> Option<&Path> {
        self.inner.parent_key.as_deref()
    }

    pub fn facade(&self) -> Value {
        self.inner.facade.clone()
    }

    /// Live view of `module.exports`; reassignments through the facade are
    /// visible here immediately.
    pub fn exports(&self) -> Value {
        self.inner
            .facade
            .get_property("exports")
            .unwrap_or(Value::Undefined)
    }

    pub fn loaded(&self) -> bool {
        matches!(
            self.inner.facade.get_property("loaded"),
            Ok(Value::Bool(true))
        )
    }

    pub fn set_loaded(&self, loaded: bool) {
        let _ = self
            .inner
            .facade
            .set_property("loaded", Value::Bool(loaded));
    }

    pub fn set_paths(&self, paths: Vec<PathBuf>) {
        let values = paths
            .into_iter()
            .map(|p| Value::str(p.display().to_string()))
            .collect();
        let _ = self.inner.facade.set_property("paths", Value::array(values));
    }

    pub fn set_require(&self, require: Value) {
        let _ = self.inner.facade.set_property("require", require);
    }

    pub fn install_parent_getter(&self, getter: NativeFn) {
        let _ = self.inner.facade.set_getter("parent", getter);
    }

    /// Record a child module once.
    pub fn add_child(&self, child: &Module) {
        if let Ok(Value::Array(children)) = self.inner.facade.get_property("children") {
            let child_facade = child.facade();
            let mut children = children.borrow_mut();
            if !children
                .iter()
                .any(|existing| Value::same_identity(existing, &child_facade))
            {
                children.push(child_facade);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exports_reads_live_value() {
        let module = Module::new(PathBuf::from("/src/a.js"), None);
        let first = module.exports();
        first.set_property("x", Value::Number(1.0)).unwrap();
        assert_eq!(
            module.exports().get_property("x").unwrap().as_number(),
            Some(1.0)
        );

        // Reassignment through the facade replaces what exports() answers.
        let replacement = Value::Number(42.0);
        module
            .facade()
            .set_property("exports", replacement)
            .unwrap();
        assert_eq!(module.exports().as_number(), Some(42.0));
    }

    #[test]
    fn test_children_deduplicate() {
        let parent = Module::new(PathBuf::from("/src/a.js"), None);
        let child = Module::new(PathBuf::from("/src/b.js"), Some(PathBuf::from("/src/a.js")));
        parent.add_child(&child);
        parent.add_child(&child);

        let children = parent.facade().get_property("children").unwrap();
        assert_eq!(
            children.get_property("length").unwrap().as_number(),
            Some(1.0)
        );
    }
}
