use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crucible_core::{ModuleResolver, ProjectConfig, Runtime};
use crucible_env::{ScriptEnvironment, Value};

fn setup_workspace(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push("crucible_cycle_tests");
    path.push(name);
    if path.exists() {
        fs::remove_dir_all(&path).unwrap();
    }
    fs::create_dir_all(&path).unwrap();
    path
}

fn build_runtime(root: &Path) -> Runtime {
    let config = ProjectConfig::with_root(root);
    let environment = Rc::new(ScriptEnvironment::new());
    let resolver = Rc::new(
        ModuleResolver::new(&config, ScriptEnvironment::core_module_names()).unwrap(),
    );
    Runtime::new(config, environment, resolver, None).unwrap()
}

#[test]
fn test_cycle_observes_partial_exports() {
    let root = setup_workspace("partial");
    fs::write(
        root.join("a.js"),
        "exports.a = 1; exports.b = require('./b');",
    )
    .unwrap();
    fs::write(
        root.join("b.js"),
        "exports.pre = require('./a').a; exports.post = require('./a').b;",
    )
    .unwrap();
    let test = root.join("test.js");
    fs::write(&test, "").unwrap();

    let runtime = build_runtime(&root);
    let a = runtime.require_module(&test, Some("./a")).unwrap();

    assert_eq!(a.get_property("a").unwrap().as_number(), Some(1.0));
    let b = a.get_property("b").unwrap();
    // At the moment b ran, a had only set `.a`.
    assert_eq!(b.get_property("pre").unwrap().as_number(), Some(1.0));
    assert!(b.get_property("post").unwrap().is_undefined());
}

#[test]
fn test_cyclic_require_returns_same_object() {
    let root = setup_workspace("same_object");
    fs::write(
        root.join("a.js"),
        "exports.name = 'a'; exports.viaB = require('./b').aExports;",
    )
    .unwrap();
    fs::write(root.join("b.js"), "exports.aExports = require('./a');").unwrap();
    let test = root.join("test.js");
    fs::write(&test, "").unwrap();

    let runtime = build_runtime(&root);
    let a = runtime.require_module(&test, Some("./a")).unwrap();
    let via_b = a.get_property("viaB").unwrap();
    assert!(Value::same_identity(&a, &via_b));
}
