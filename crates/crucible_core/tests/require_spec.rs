use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crucible_core::{ModuleResolver, ProjectConfig, Runtime, RuntimeError};
use crucible_env::{ScriptEnvironment, Value};

// Helper to create temp workspace
fn setup_workspace(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push("crucible_require_tests");
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
fn test_simple_require() {
    let root = setup_workspace("simple");
    fs::write(root.join("a.js"), "module.exports = 1;").unwrap();
    fs::write(
        root.join("test.js"),
        "const a = require('./a'); exports.x = a;",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert_eq!(exports.get_property("x").unwrap().as_number(), Some(1.0));
}

#[test]
fn test_second_require_returns_identical_exports() {
    let root = setup_workspace("identity");
    fs::write(root.join("m.js"), "exports.tag = 'shared';").unwrap();
    let test = root.join("test.js");
    fs::write(&test, "").unwrap();

    let runtime = build_runtime(&root);
    let first = runtime.require_module(&test, Some("./m")).unwrap();
    let second = runtime.require_module(&test, Some("./m")).unwrap();
    assert!(Value::same_identity(&first, &second));
}

#[test]
fn test_module_body_runs_once() {
    let root = setup_workspace("once");
    fs::write(
        root.join("m.js"),
        "global.loads = (global.loads || 0) + 1; exports.ok = true;",
    )
    .unwrap();
    let test = root.join("test.js");
    fs::write(&test, "").unwrap();

    let runtime = build_runtime(&root);
    runtime.require_module(&test, Some("./m")).unwrap();
    runtime.require_module(&test, Some("./m")).unwrap();

    let global = runtime.environment().global().unwrap();
    assert_eq!(global.get_property("loads").unwrap().as_number(), Some(1.0));
}

#[test]
fn test_parent_and_main_walk_the_chain() {
    let root = setup_workspace("parent_main");
    fs::write(
        root.join("child.js"),
        "exports.parentFile = module.parent.filename; exports.mainFile = require.main.filename;",
    )
    .unwrap();
    let test = root.join("test.js");
    fs::write(&test, "exports.child = require('./child');").unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&test, None).unwrap();
    let child = exports.get_property("child").unwrap();

    let test_name = test.display().to_string();
    assert_eq!(
        child.get_property("parentFile").unwrap().as_str(),
        Some(test_name.as_str())
    );
    assert_eq!(
        child.get_property("mainFile").unwrap().as_str(),
        Some(test_name.as_str())
    );
}

#[test]
fn test_children_recorded_on_parent() {
    let root = setup_workspace("children");
    fs::write(root.join("dep.js"), "exports.ok = 1;").unwrap();
    fs::write(
        root.join("test.js"),
        "require('./dep'); require('./dep'); exports.kids = module.children.length;",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert_eq!(exports.get_property("kids").unwrap().as_number(), Some(1.0));
}

#[test]
fn test_require_resolve_and_paths() {
    let root = setup_workspace("resolve");
    fs::write(root.join("a.js"), "exports.v = 1;").unwrap();
    fs::write(
        root.join("test.js"),
        "exports.resolved = require.resolve('./a');\n\
         exports.relPaths = require.resolve.paths('./a');\n\
         exports.barePaths = require.resolve.paths('pkg');\n\
         exports.corePaths = require.resolve.paths('process');",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();

    let resolved = exports.get_property("resolved").unwrap();
    assert_eq!(
        resolved.as_str(),
        Some(root.join("a.js").display().to_string().as_str())
    );

    // Relative requests get a single-entry list: the requiring directory.
    let rel = exports.get_property("relPaths").unwrap();
    assert_eq!(rel.get_property("length").unwrap().as_number(), Some(1.0));

    let bare = exports.get_property("barePaths").unwrap();
    assert!(bare.get_property("length").unwrap().as_number().unwrap() >= 1.0);

    assert!(matches!(
        exports.get_property("corePaths").unwrap(),
        Value::Null
    ));
}

#[test]
fn test_require_resolve_with_explicit_paths() {
    let root = setup_workspace("resolve_paths");
    let vendor = root.join("vendor");
    fs::create_dir_all(&vendor).unwrap();
    fs::write(vendor.join("tool.js"), "exports.v = 2;").unwrap();
    fs::write(
        root.join("test.js"),
        "exports.found = require.resolve('./tool', { paths: ['./vendor'] });",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert_eq!(
        exports.get_property("found").unwrap().as_str(),
        Some(vendor.join("tool.js").display().to_string().as_str())
    );
}

#[test]
fn test_core_module_routes_to_environment() {
    let root = setup_workspace("core");
    fs::write(
        root.join("test.js"),
        "const path = require('path'); exports.joined = path.join('/a', 'b');",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert_eq!(
        exports.get_property("joined").unwrap().as_str(),
        Some("/a/b")
    );
}

#[test]
fn test_json_modules() {
    let root = setup_workspace("json");
    fs::write(root.join("data.json"), r#"{ "port": 8080 }"#).unwrap();
    fs::write(
        root.join("test.js"),
        "exports.port = require('./data.json').port;",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert_eq!(
        exports.get_property("port").unwrap().as_number(),
        Some(8080.0)
    );
}

#[test]
fn test_not_found_suggests_sibling_extension() {
    let root = setup_workspace("not_found");
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/util.json"), "{}").unwrap();
    let test = root.join("src/test.js");
    fs::write(&test, "").unwrap();

    // A config that cannot resolve .json makes the request fail while the
    // sibling file still exists for the suggestion.
    let mut config = ProjectConfig::with_root(&root);
    config.module_file_extensions = vec!["js".into()];
    let environment = Rc::new(ScriptEnvironment::new());
    let resolver = Rc::new(
        ModuleResolver::new(&config, ScriptEnvironment::core_module_names()).unwrap(),
    );
    config.module_file_extensions = vec!["json".into(), "js".into()];
    let runtime = Runtime::new(config, environment, resolver, None).unwrap();

    let error = runtime
        .require_module_or_mock(&test, "./util")
        .err()
        .expect("resolution must fail");
    match error {
        RuntimeError::ModuleNotFound { .. } => {
            assert!(error.to_string().contains("./util.json"), "{}", error);
        }
        other => panic!("expected module-not-found, got {}", other),
    }
}

#[test]
fn test_extra_globals_are_injected() {
    let root = setup_workspace("extra_globals");
    fs::write(root.join("test.js"), "exports.seen = stage;").unwrap();

    let mut config = ProjectConfig::with_root(&root);
    config.extra_globals = vec!["stage".into()];
    let environment = Rc::new(ScriptEnvironment::new());
    environment
        .global()
        .unwrap()
        .set_property("stage", Value::Number(7.0))
        .unwrap();
    let resolver = Rc::new(
        ModuleResolver::new(&config, ScriptEnvironment::core_module_names()).unwrap(),
    );
    let runtime = Runtime::new(config, environment, resolver, None).unwrap();

    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert_eq!(exports.get_property("seen").unwrap().as_number(), Some(7.0));
}

#[test]
fn test_missing_extra_global_fails_loudly() {
    let root = setup_workspace("extra_globals_missing");
    fs::write(root.join("test.js"), "exports.x = 1;").unwrap();

    let mut config = ProjectConfig::with_root(&root);
    config.extra_globals = vec!["performance".into()];
    let environment = Rc::new(ScriptEnvironment::new());
    let resolver = Rc::new(
        ModuleResolver::new(&config, ScriptEnvironment::core_module_names()).unwrap(),
    );
    let runtime = Runtime::new(config, environment, resolver, None).unwrap();

    let error = runtime.require_module(&root.join("test.js"), None).err();
    assert!(matches!(
        error,
        Some(RuntimeError::MissingExtraGlobal { .. })
    ));
}

#[test]
fn test_setup_files_run_before_test() {
    let root = setup_workspace("setup_files");
    fs::write(root.join("setup.js"), "global.prepared = true;").unwrap();
    fs::write(root.join("test.js"), "exports.ready = global.prepared;").unwrap();

    let mut config = ProjectConfig::with_root(&root);
    config.setup_files = vec![root.join("setup.js")];
    let environment = Rc::new(ScriptEnvironment::new());
    let resolver = Rc::new(
        ModuleResolver::new(&config, ScriptEnvironment::core_module_names()).unwrap(),
    );
    let runtime = Runtime::new(config, environment, resolver, None).unwrap();

    runtime.run_setup_files().unwrap();
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert!(matches!(
        exports.get_property("ready").unwrap(),
        Value::Bool(true)
    ));
}
