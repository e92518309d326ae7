use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crucible_core::{ModuleResolver, ProjectConfig, Runtime};
use crucible_env::{
    call_function, ScriptEnvironment, Value, RETRY_TIMES_KEY, TEST_TIMEOUT_KEY,
};

fn setup_workspace(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push("crucible_handle_tests");
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
fn test_in_script_handle_is_chainable_and_identical() {
    let root = setup_workspace("chain");
    fs::write(
        root.join("test.js"),
        "const same = crucible.mock('a-module', () => 1, { virtual: true }) === crucible;\n\
         const again = crucible.unmock('other') === crucible;\n\
         exports.same = same && again;",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert!(matches!(
        exports.get_property("same").unwrap(),
        Value::Bool(true)
    ));
}

#[test]
fn test_in_script_set_mock_feeds_later_requires() {
    let root = setup_workspace("set_mock");
    fs::write(
        root.join("test.js"),
        "crucible.setMock('config', { port: 8125 });\n\
         const config = require('config');\n\
         exports.port = config.port;",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert_eq!(
        exports.get_property("port").unwrap().as_number(),
        Some(8125.0)
    );
}

#[test]
fn test_in_script_mock_factory_and_virtual_option() {
    let root = setup_workspace("factory");
    fs::write(
        root.join("test.js"),
        "crucible.mock('emitter', () => ({ emit: () => 'sent' }), { virtual: true });\n\
         exports.sent = require('emitter').emit();",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert_eq!(exports.get_property("sent").unwrap().as_str(), Some("sent"));
}

#[test]
fn test_in_script_fake_timers_drive_callbacks() {
    let root = setup_workspace("timers");
    fs::write(
        root.join("test.js"),
        "crucible.useFakeTimers();\n\
         let fired = false;\n\
         setTimeout(() => { fired = true; }, 50);\n\
         exports.pending = crucible.getTimerCount();\n\
         crucible.advanceTimersByTime(50);\n\
         exports.fired = fired;",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert_eq!(
        exports.get_property("pending").unwrap().as_number(),
        Some(1.0)
    );
    assert!(matches!(
        exports.get_property("fired").unwrap(),
        Value::Bool(true)
    ));
}

#[test]
fn test_in_script_fn_and_spy() {
    let root = setup_workspace("spies");
    fs::write(
        root.join("test.js"),
        "const target = { greet: () => 'hello' };\n\
         const spy = crucible.spyOn(target, 'greet');\n\
         exports.viaSpy = target.greet();\n\
         exports.isMock = crucible.isMockFunction(target.greet);\n\
         const fake = crucible.fn(() => 3);\n\
         exports.fromFn = fake();",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert_eq!(
        exports.get_property("viaSpy").unwrap().as_str(),
        Some("hello")
    );
    assert!(matches!(
        exports.get_property("isMock").unwrap(),
        Value::Bool(true)
    ));
    assert_eq!(
        exports.get_property("fromFn").unwrap().as_number(),
        Some(3.0)
    );
}

#[test]
fn test_restore_all_mocks_puts_spied_methods_back() {
    let root = setup_workspace("restore");
    let test = root.join("test.js");
    fs::write(&test, "").unwrap();

    let runtime = build_runtime(&root);
    let handle = runtime.handle(&test);

    let target = Value::object();
    target
        .set_property(
            "compute",
            Value::native("compute", Rc::new(|_| Ok(Value::Number(11.0)))),
        )
        .unwrap();
    let original = target.get_property("compute").unwrap();

    handle.spy_on(&target, "compute").unwrap();
    assert!(handle.is_mock_function(&target.get_property("compute").unwrap()));

    handle.restore_all_mocks();
    let restored = target.get_property("compute").unwrap();
    assert!(Value::same_identity(&restored, &original));
    let result = call_function(&restored, &[]).unwrap();
    assert_eq!(result.as_number(), Some(11.0));
}

#[test]
fn test_timeout_and_retry_knobs_land_on_the_global() {
    let root = setup_workspace("knobs");
    let test = root.join("test.js");
    fs::write(&test, "").unwrap();

    let runtime = build_runtime(&root);
    runtime
        .handle(&test)
        .set_test_timeout(5000)
        .retry_times(3);

    let global = runtime.environment().global().unwrap();
    assert_eq!(
        global.get_property(TEST_TIMEOUT_KEY).unwrap().as_number(),
        Some(5000.0)
    );
    assert_eq!(
        global.get_property(RETRY_TIMES_KEY).unwrap().as_number(),
        Some(3.0)
    );
}

#[test]
fn test_add_matchers_merges_into_registry() {
    let root = setup_workspace("matchers");
    fs::write(
        root.join("test.js"),
        "crucible.addMatchers({ toBeEven: (n) => n % 2 === 0 });",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    runtime.require_module(&root.join("test.js"), None).unwrap();

    let global = runtime.environment().global().unwrap();
    let registry = global
        .get_property(crucible_env::MATCHERS_KEY)
        .unwrap();
    let matcher = registry.get_property("toBeEven").unwrap();
    let verdict = call_function(&matcher, &[Value::Number(4.0)]).unwrap();
    assert!(matches!(verdict, Value::Bool(true)));
}

#[test]
fn test_in_script_isolate_modules() {
    let root = setup_workspace("isolate");
    fs::write(root.join("m.js"), "exports.marker = {};").unwrap();
    fs::write(
        root.join("test.js"),
        "let inner = null;\n\
         crucible.isolateModules(() => { inner = require('./m'); });\n\
         const outer = require('./m');\n\
         exports.distinct = inner !== outer;",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    assert!(matches!(
        exports.get_property("distinct").unwrap(),
        Value::Bool(true)
    ));
}

#[test]
fn test_automock_toggles_from_script() {
    let root = setup_workspace("toggles");
    fs::write(root.join("real.js"), "module.exports = { real: true };").unwrap();
    fs::write(
        root.join("test.js"),
        "crucible.enableAutomock();\n\
         const mocked = require('./real');\n\
         crucible.disableAutomock();\n\
         exports.mockedIsNeutered = mocked.real === true;",
    )
    .unwrap();

    let runtime = build_runtime(&root);
    let exports = runtime.require_module(&root.join("test.js"), None).unwrap();
    // Auto-mock of a constant-only module keeps constants.
    assert!(matches!(
        exports.get_property("mockedIsNeutered").unwrap(),
        Value::Bool(true)
    ));
}
