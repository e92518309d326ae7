use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crucible_core::{ModuleResolver, ProjectConfig, Runtime, RuntimeError};
use crucible_env::ScriptEnvironment;

fn setup_workspace(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push("crucible_teardown_tests");
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
fn test_require_after_teardown_never_throws() {
    let root = setup_workspace("require");
    fs::write(root.join("m.js"), "exports.x = 1;").unwrap();
    let test = root.join("test.js");
    fs::write(&test, "").unwrap();

    let runtime = build_runtime(&root);
    runtime.environment().teardown();

    let result = runtime.require_module(&test, Some("./m"));
    let value = result.expect("teardown must not raise");
    assert!(value.is_undefined());
    assert_eq!(runtime.environment().process_state().exit_code(), Some(1));
}

#[test]
fn test_timer_calls_after_teardown_are_reported_not_thrown() {
    let root = setup_workspace("timers");
    let test = root.join("test.js");
    fs::write(&test, "").unwrap();

    let runtime = build_runtime(&root);
    runtime.handle(&test).use_fake_timers();
    runtime.environment().teardown();

    runtime
        .handle(&test)
        .advance_timers_by_time(100)
        .expect("teardown must not raise");
    assert_eq!(runtime.environment().process_state().exit_code(), Some(1));
}

#[test]
fn test_timer_calls_without_fake_timers_are_an_error() {
    let root = setup_workspace("uninstalled");
    let test = root.join("test.js");
    fs::write(&test, "").unwrap();

    let runtime = build_runtime(&root);
    let result = runtime.handle(&test).run_all_timers();
    assert!(matches!(
        result,
        Err(RuntimeError::FakeTimersNotInstalled)
    ));
}

#[test]
fn test_exit_code_survives_teardown() {
    let root = setup_workspace("exit_code");
    let runtime = build_runtime(&root);

    let state = runtime.environment().process_state().clone();
    runtime.environment().teardown();
    assert_eq!(state.exit_code(), None);

    // The shared cell is still writable for late violations.
    state.set_exit_code(1);
    assert_eq!(runtime.environment().process_state().exit_code(), Some(1));
}
