//! The sandboxed execution environment: global object, process facade,
//! timers, mocker and the script-running primitive.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use crate::interp::{run_wrapper, Scope};
use crate::mocker::ModuleMocker;
use crate::script::{current_stack, EvalError, Script};
use crate::timers::FakeTimers;
use crate::value::{format_stack, NativeFn, Value};

/// Global property holding per-file coverage records.
pub const COVERAGE_KEY: &str = "__COVERAGE__";
/// Identifier the framework handle is bound to inside executing modules.
pub const HANDLE_BINDING: &str = "crucible";
/// Global key carrying the per-test timeout in milliseconds.
pub const TEST_TIMEOUT_KEY: &str = "__TEST_TIMEOUT__";
/// Global key carrying the per-test retry count.
pub const RETRY_TIMES_KEY: &str = "__RETRY_TIMES__";
/// Global key holding the registered matcher table.
pub const MATCHERS_KEY: &str = "__MATCHERS__";

/// Exit-code cell shared between the sandboxed process object and the
/// runtime. Outlives teardown so violations can still be recorded.
#[derive(Default)]
pub struct ProcessState {
    exit_code: Cell<Option<i32>>,
}

impl ProcessState {
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.set(Some(code));
    }
}

pub struct ScriptEnvironment {
    global: RefCell<Option<Value>>,
    mocker: Rc<ModuleMocker>,
    timers: Rc<FakeTimers>,
    process_state: Rc<ProcessState>,
    process_value: Value,
}

impl ScriptEnvironment {
    pub fn new() -> ScriptEnvironment {
        let mocker = Rc::new(ModuleMocker::new());
        let timers = Rc::new(FakeTimers::new());
        let process_state = Rc::new(ProcessState::default());

        let process_value = build_process(&process_state, &timers);
        let global = build_global(&timers, &process_value);

        ScriptEnvironment {
            global: RefCell::new(Some(global)),
            mocker,
            timers,
            process_state,
            process_value,
        }
    }

    pub fn setup(&self) {}

    /// Dispose the sandbox. `global()` answers `None` from here on.
    pub fn teardown(&self) {
        *self.global.borrow_mut() = None;
        self.timers.clear_all();
    }

    pub fn global(&self) -> Option<Value> {
        self.global.borrow().clone()
    }

    pub fn module_mocker(&self) -> &Rc<ModuleMocker> {
        &self.mocker
    }

    pub fn fake_timers(&self) -> &Rc<FakeTimers> {
        &self.timers
    }

    pub fn process_state(&self) -> &Rc<ProcessState> {
        &self.process_state
    }

    /// Names the resolver treats as host built-ins.
    pub fn core_module_names() -> &'static [&'static str] {
        &["process", "path"]
    }

    /// Exports of a host built-in; `process` routes to the sandboxed process.
    pub fn native_module(&self, name: &str) -> Option<Value> {
        match name {
            "process" => Some(self.process_value.clone()),
            "path" => Some(build_path_module()),
            _ => None,
        }
    }

    /// Produce the execution handle for a compiled script, or `None` if the
    /// sandbox has been torn down. The handle's [`Script::ENTRY_KEY`]
    /// property is the wrapper function over the synthetic arguments.
    pub fn run_script(&self, script: &Script) -> Option<Value> {
        let global = self.global()?;

        let program = script.program.clone();
        let file = Rc::new(script.path.display().to_string());
        let instrument = script.instrument;
        let mut params: Vec<String> = [
            "module",
            "exports",
            "require",
            "__dirname",
            "__filename",
            "global",
            HANDLE_BINDING,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        params.extend(script.extra_params.iter().cloned());

        let wrapper_global = global.clone();
        let wrapper: NativeFn = Rc::new(move |args: &[Value]| {
            let scope = Scope::root(wrapper_global.clone());
            for (i, name) in params.iter().enumerate() {
                scope.declare(name, args.get(i).cloned().unwrap_or(Value::Undefined));
            }
            let coverage = if instrument {
                Some(coverage_record(&wrapper_global, &file)?)
            } else {
                None
            };
            run_wrapper(&program, &file, scope, coverage)
        });

        let handle = Value::object();
        let _ = handle.set_property(Script::ENTRY_KEY, Value::native("wrapper", wrapper));
        Some(handle)
    }
}

impl Default for ScriptEnvironment {
    fn default() -> Self {
        ScriptEnvironment::new()
    }
}

fn coverage_record(global: &Value, file: &str) -> Result<Value, EvalError> {
    let mut coverage = global.get_property(COVERAGE_KEY)?;
    if coverage.is_undefined() {
        coverage = Value::object();
        global.set_property(COVERAGE_KEY, coverage.clone())?;
    }
    let mut record = coverage.get_property(file)?;
    if record.is_undefined() {
        record = Value::object();
        record.set_property("path", Value::str(file))?;
        record.set_property("s", Value::object())?;
        coverage.set_property(file, record.clone())?;
    }
    Ok(record)
}

fn build_global(timers: &Rc<FakeTimers>, process: &Value) -> Value {
    let global = Value::object();

    let console = Value::object();
    let _ = console.set_property(
        "log",
        Value::native("log", Rc::new(|args| {
            tracing::info!("{}", join_args(args));
            Ok(Value::Undefined)
        })),
    );
    let _ = console.set_property(
        "warn",
        Value::native("warn", Rc::new(|args| {
            tracing::warn!("{}", join_args(args));
            Ok(Value::Undefined)
        })),
    );
    let _ = console.set_property(
        "error",
        Value::native("error", Rc::new(|args| {
            tracing::error!("{}", join_args(args));
            Ok(Value::Undefined)
        })),
    );
    let _ = global.set_property("console", console);
    let _ = global.set_property("process", process.clone());

    let t = timers.clone();
    let _ = global.set_property(
        "setTimeout",
        Value::native("setTimeout", Rc::new(move |args| {
            let callback = args.first().cloned().unwrap_or(Value::Undefined);
            let delay = args.get(1).and_then(|v| v.as_number()).unwrap_or(0.0);
            Ok(Value::Number(t.schedule_timeout(callback, delay as u64) as f64))
        })),
    );
    let t = timers.clone();
    let _ = global.set_property(
        "setInterval",
        Value::native("setInterval", Rc::new(move |args| {
            let callback = args.first().cloned().unwrap_or(Value::Undefined);
            let delay = args.get(1).and_then(|v| v.as_number()).unwrap_or(0.0);
            Ok(Value::Number(t.schedule_interval(callback, delay as u64) as f64))
        })),
    );
    for name in ["clearTimeout", "clearInterval"] {
        let t = timers.clone();
        let _ = global.set_property(
            name,
            Value::native(name, Rc::new(move |args| {
                if let Some(id) = args.first().and_then(|v| v.as_number()) {
                    t.cancel(id as u64);
                }
                Ok(Value::Undefined)
            })),
        );
    }
    let t = timers.clone();
    let _ = global.set_property(
        "setImmediate",
        Value::native("setImmediate", Rc::new(move |args| {
            t.schedule_immediate(args.first().cloned().unwrap_or(Value::Undefined));
            Ok(Value::Undefined)
        })),
    );
    let _ = global.set_property(
        "clearImmediate",
        Value::native("clearImmediate", Rc::new(|_| Ok(Value::Undefined))),
    );

    // Self reference; deep copies must tolerate the cycle.
    let _ = global.set_property("globalThis", global.clone());
    global
}

fn build_process(state: &Rc<ProcessState>, timers: &Rc<FakeTimers>) -> Value {
    let process = Value::object();

    let s = state.clone();
    let _ = process.set_getter(
        "exitCode",
        Rc::new(move |_| {
            Ok(match s.exit_code() {
                Some(code) => Value::Number(code as f64),
                None => Value::Undefined,
            })
        }),
    );

    let s = state.clone();
    let _ = process.set_property(
        "exit",
        Value::native("exit", Rc::new(move |args| {
            let code = args.first().and_then(|v| v.as_number()).unwrap_or(0.0) as i32;
            let rendered: Vec<String> = args.iter().map(|a| a.to_display()).collect();
            eprintln!(
                "process.exit called with [{}]\n{}",
                rendered.join(", "),
                format_stack(&current_stack())
            );
            s.set_exit_code(code);
            Ok(Value::Undefined)
        })),
    );

    let t = timers.clone();
    let _ = process.set_property(
        "nextTick",
        Value::native("nextTick", Rc::new(move |args| {
            t.schedule_tick(args.first().cloned().unwrap_or(Value::Undefined));
            Ok(Value::Undefined)
        })),
    );

    let _ = process.set_property("platform", Value::str(std::env::consts::OS));
    let _ = process.set_property("env", Value::object());
    process
}

fn build_path_module() -> Value {
    let module = Value::object();
    let _ = module.set_property(
        "join",
        Value::native("join", Rc::new(|args| {
            let parts: Vec<String> = args
                .iter()
                .filter_map(|a| a.as_str().map(|s| s.to_string()))
                .collect();
            Ok(Value::str(normalize_slashes(&parts.join("/"))))
        })),
    );
    let _ = module.set_property(
        "dirname",
        Value::native("dirname", Rc::new(|args| {
            let p = args.first().and_then(|a| a.as_str()).unwrap_or("");
            let parent = Path::new(p)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "/".to_string());
            Ok(Value::str(if parent.is_empty() { ".".to_string() } else { parent }))
        })),
    );
    let _ = module.set_property(
        "basename",
        Value::native("basename", Rc::new(|args| {
            let p = args.first().and_then(|a| a.as_str()).unwrap_or("");
            let base = Path::new(p)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            Ok(Value::str(base))
        })),
    );
    let _ = module.set_property("sep", Value::str("/"));
    module
}

fn normalize_slashes(p: &str) -> String {
    let mut out = String::with_capacity(p.len());
    let mut last_slash = false;
    for c in p.chars() {
        if c == '/' {
            if !last_slash {
                out.push(c);
            }
            last_slash = true;
        } else {
            out.push(c);
            last_slash = false;
        }
    }
    out
}

fn join_args(args: &[Value]) -> String {
    args.iter()
        .map(|a| a.to_display())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::call_function;

    fn wrapper_of(env: &ScriptEnvironment, script: &Script) -> Value {
        let handle = env.run_script(script).expect("environment is live");
        handle.get_property(Script::ENTRY_KEY).unwrap()
    }

    fn synthetic_args(env: &ScriptEnvironment) -> Vec<Value> {
        let module = Value::object();
        let exports = Value::object();
        module.set_property("exports", exports.clone()).unwrap();
        vec![
            module,
            exports,
            Value::Undefined,
            Value::str("/src"),
            Value::str("/src/m.js"),
            env.global().unwrap(),
            Value::object(),
        ]
    }

    #[test]
    fn test_run_script_executes_wrapper() {
        let env = ScriptEnvironment::new();
        let script =
            Script::compile(Path::new("/src/m.js"), "exports.x = 1 + 2;", false, &[]).unwrap();
        let args = synthetic_args(&env);
        let wrapper = wrapper_of(&env, &script);
        call_function(&wrapper, &args).unwrap();
        assert_eq!(args[1].get_property("x").unwrap().as_number(), Some(3.0));
    }

    #[test]
    fn test_run_script_after_teardown_is_none() {
        let env = ScriptEnvironment::new();
        let script = Script::compile(Path::new("/src/m.js"), "", false, &[]).unwrap();
        env.teardown();
        assert!(env.global().is_none());
        assert!(env.run_script(&script).is_none());
    }

    #[test]
    fn test_instrumented_script_counts_statements() {
        let env = ScriptEnvironment::new();
        let script = Script::compile(
            Path::new("/src/m.js"),
            "exports.a = 1;\nexports.b = 2;",
            true,
            &[],
        )
        .unwrap();
        let args = synthetic_args(&env);
        let wrapper = wrapper_of(&env, &script);
        call_function(&wrapper, &args).unwrap();

        let coverage = env.global().unwrap().get_property(COVERAGE_KEY).unwrap();
        let record = coverage.get_property("/src/m.js").unwrap();
        let counters = record.get_property("s").unwrap();
        assert_eq!(counters.get_property("1").unwrap().as_number(), Some(1.0));
        assert_eq!(counters.get_property("2").unwrap().as_number(), Some(1.0));
    }

    #[test]
    fn test_process_exit_records_code() {
        let env = ScriptEnvironment::new();
        let script = Script::compile(Path::new("/src/m.js"), "process.exit(3);", false, &[])
            .unwrap();
        let args = synthetic_args(&env);
        let wrapper = wrapper_of(&env, &script);
        call_function(&wrapper, &args).unwrap();
        assert_eq!(env.process_state().exit_code(), Some(3));
    }

    #[test]
    fn test_path_native_module() {
        let env = ScriptEnvironment::new();
        let path = env.native_module("path").unwrap();
        let join = path.get_property("join").unwrap();
        let joined =
            call_function(&join, &[Value::str("/a/"), Value::str("b.js")]).unwrap();
        assert_eq!(joined.as_str(), Some("/a/b.js"));
    }
}
