//! Sandboxed script environment: value model, compiled-script evaluator,
//! mock-function subsystem and fake timers.

pub mod env;
pub mod interp;
pub mod mocker;
pub mod script;
pub mod timers;
pub mod value;

pub use env::{
    ProcessState, ScriptEnvironment, COVERAGE_KEY, HANDLE_BINDING, MATCHERS_KEY,
    RETRY_TIMES_KEY, TEST_TIMEOUT_KEY,
};
pub use interp::call_function;
pub use mocker::{MockMetadata, ModuleMocker};
pub use script::{current_stack, EvalError, Frame, Script};
pub use timers::FakeTimers;
pub use value::{deep_cyclic_copy, format_stack, NativeFn, Property, Value};
