//! The per-module control object tests drive runtime state through.
//!
//! Mutators return the handle again so configuration reads as a chain. The
//! same surface is projected as a script value and bound inside every
//! executing module.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use crucible_env::value::ObjectData;
use crucible_env::{
    call_function, EvalError, NativeFn, Property, Value, MATCHERS_KEY, RETRY_TIMES_KEY,
    TEST_TIMEOUT_KEY,
};

use crate::error::RuntimeError;
use crate::runtime::{request_arg, to_eval_error, MockFactory, RuntimeInner};

pub struct FrameworkHandle {
    runtime: Rc<RuntimeInner>,
    from: PathBuf,
}

impl FrameworkHandle {
    pub(crate) fn new(runtime: Rc<RuntimeInner>, from: PathBuf) -> FrameworkHandle {
        FrameworkHandle { runtime, from }
    }

    // --- MOCK CONFIGURATION ---

    pub fn enable_automock(&self) -> &Self {
        self.runtime.automock.set(true);
        self
    }

    pub fn disable_automock(&self) -> &Self {
        self.runtime.automock.set(false);
        self
    }

    /// Mark the request as mocked; the next mocked require auto-generates.
    pub fn mock(&self, request: &str) -> &Self {
        self.runtime.mark_explicit_mock(&self.from, request, true);
        self
    }

    /// Mark as mocked with a user factory; `virtual_mock` registers the
    /// request as a mock-only key with no file behind it.
    pub fn mock_with_factory(
        &self,
        request: &str,
        factory: MockFactory,
        virtual_mock: bool,
    ) -> &Self {
        self.runtime
            .set_mock_factory(&self.from, request, factory, virtual_mock);
        self
    }

    /// Same effect as [`FrameworkHandle::mock`], for call sites that must
    /// not be hoisted by a transform.
    pub fn do_mock(&self, request: &str) -> &Self {
        self.mock(request)
    }

    pub fn unmock(&self, request: &str) -> &Self {
        self.runtime.mark_explicit_mock(&self.from, request, false);
        self
    }

    pub fn dont_mock(&self, request: &str) -> &Self {
        self.unmock(request)
    }

    /// Unmock the request and keep its dependency subtree real too.
    pub fn deep_unmock(&self, request: &str) -> &Self {
        self.runtime.deep_unmock(&self.from, request);
        self
    }

    /// Shorthand for a factory returning a fixed value.
    pub fn set_mock(&self, request: &str, value: Value) -> &Self {
        let factory: MockFactory = Rc::new(move || Ok(value.clone()));
        self.runtime
            .set_mock_factory(&self.from, request, factory, false);
        self
    }

    // --- REGISTRY LIFECYCLE ---

    pub fn reset_modules(&self) -> &Self {
        self.runtime.reset_modules();
        self
    }

    pub fn isolate_modules(
        &self,
        f: impl FnOnce() -> Result<(), RuntimeError>,
    ) -> Result<(), RuntimeError> {
        self.runtime.isolate_scope(f)
    }

    /// Auto-mock synthesis output for `request`, without recording policy.
    pub fn gen_mock_from_module(&self, request: &str) -> Result<Value, RuntimeError> {
        self.runtime.generate_mock(&self.from, request)
    }

    // --- MOCK FUNCTIONS ---

    pub fn mock_fn(&self) -> Value {
        self.runtime.environment.module_mocker().mock_fn(None)
    }

    pub fn spy_on(&self, target: &Value, key: &str) -> Result<Value, RuntimeError> {
        self.runtime
            .environment
            .module_mocker()
            .spy_on(target, key)
            .map_err(RuntimeError::Eval)
    }

    pub fn is_mock_function(&self, value: &Value) -> bool {
        self.runtime.environment.module_mocker().is_mock_function(value)
    }

    pub fn clear_all_mocks(&self) -> &Self {
        self.runtime.environment.module_mocker().clear_all();
        self
    }

    pub fn reset_all_mocks(&self) -> &Self {
        self.runtime.environment.module_mocker().reset_all();
        self
    }

    pub fn restore_all_mocks(&self) -> &Self {
        self.runtime.environment.module_mocker().restore_all();
        self
    }

    // --- TIMERS ---

    pub fn use_fake_timers(&self) -> &Self {
        self.runtime.environment.fake_timers().use_fake();
        self
    }

    pub fn use_real_timers(&self) -> &Self {
        self.runtime.environment.fake_timers().use_real();
        self
    }

    pub fn advance_timers_by_time(&self, ms: u64) -> Result<(), RuntimeError> {
        match self.checked_timers()? {
            Some(timers) => Ok(timers.advance_by(ms)?),
            None => Ok(()),
        }
    }

    pub fn run_all_timers(&self) -> Result<(), RuntimeError> {
        match self.checked_timers()? {
            Some(timers) => Ok(timers.run_all()?),
            None => Ok(()),
        }
    }

    pub fn run_only_pending_timers(&self) -> Result<(), RuntimeError> {
        match self.checked_timers()? {
            Some(timers) => Ok(timers.run_only_pending()?),
            None => Ok(()),
        }
    }

    pub fn run_all_ticks(&self) -> Result<(), RuntimeError> {
        match self.checked_timers()? {
            Some(timers) => Ok(timers.run_all_ticks()?),
            None => Ok(()),
        }
    }

    pub fn run_all_immediates(&self) -> Result<(), RuntimeError> {
        match self.checked_timers()? {
            Some(timers) => Ok(timers.run_all_immediates()?),
            None => Ok(()),
        }
    }

    pub fn clear_all_timers(&self) -> Result<(), RuntimeError> {
        match self.checked_timers()? {
            Some(timers) => {
                timers.clear_all();
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn get_timer_count(&self) -> Result<usize, RuntimeError> {
        match self.checked_timers()? {
            Some(timers) => Ok(timers.count()),
            None => Ok(0),
        }
    }

    /// Teardown is logged, never thrown; missing fake timers are an error.
    fn checked_timers(
        &self,
    ) -> Result<Option<Rc<crucible_env::FakeTimers>>, RuntimeError> {
        if self.runtime.environment.global().is_none() {
            tracing::error!(
                "ReferenceError: timer operation from '{}' after the test environment has been torn down",
                self.from.display()
            );
            self.runtime.environment.process_state().set_exit_code(1);
            return Ok(None);
        }
        let timers = self.runtime.environment.fake_timers().clone();
        if !timers.is_installed() {
            return Err(RuntimeError::FakeTimersNotInstalled);
        }
        Ok(Some(timers))
    }

    // --- PER-TEST KNOBS ---

    pub fn set_test_timeout(&self, ms: u64) -> &Self {
        if let Some(global) = self.runtime.environment.global() {
            let _ = global.set_property(TEST_TIMEOUT_KEY, Value::Number(ms as f64));
        }
        self
    }

    pub fn retry_times(&self, n: u64) -> &Self {
        if let Some(global) = self.runtime.environment.global() {
            let _ = global.set_property(RETRY_TIMES_KEY, Value::Number(n as f64));
        }
        self
    }

    /// Merge matcher functions into the registry on the sandbox global.
    pub fn add_matchers(&self, matchers: &Value) -> &Self {
        let Some(global) = self.runtime.environment.global() else {
            return self;
        };
        let mut registry = global.get_property(MATCHERS_KEY).unwrap_or(Value::Undefined);
        if registry.is_undefined() {
            registry = Value::object();
            let _ = global.set_property(MATCHERS_KEY, registry.clone());
        }
        if let Value::Object(entries) = matchers {
            for (key, prop) in entries.borrow().entries() {
                if let Property::Value(value) = prop {
                    let _ = registry.set_property(key, value.clone());
                }
            }
        }
        self
    }

    // --- BOUND REQUIRES ---

    pub fn require_actual(&self, request: &str) -> Result<Value, RuntimeError> {
        self.runtime
            .require_module_impl(&self.runtime_from(), Some(request), false, true)
    }

    pub fn require_mock(&self, request: &str) -> Result<Value, RuntimeError> {
        self.runtime.require_mock(&self.runtime_from(), request)
    }

    fn runtime_from(&self) -> PathBuf {
        self.from.clone()
    }

    // --- SCRIPT PROJECTION ---

    /// The handle as a script value; every mutator answers the same object
    /// so in-script chaining works.
    pub fn to_value(&self) -> Value {
        let object_data = Rc::new(RefCell::new(ObjectData::default()));
        let object = Value::Object(object_data.clone());
        let weak_object = Rc::downgrade(&object_data);
        let chain: Rc<dyn Fn() -> Value> = Rc::new(move || {
            weak_object
                .upgrade()
                .map(Value::Object)
                .unwrap_or(Value::Undefined)
        });

        let runtime = Rc::downgrade(&self.runtime);
        let from = self.from.clone();

        let op = |name: &str, f: NativeFn| {
            let _ = object.set_property(name, Value::native(name, f));
        };

        macro_rules! rt {
            ($runtime:expr) => {
                $runtime
                    .upgrade()
                    .ok_or_else(|| EvalError::script("runtime was dropped"))?
            };
        }

        {
            let (runtime, chain) = (runtime.clone(), chain.clone());
            op("disableAutomock", Rc::new(move |_| {
                rt!(runtime).automock.set(false);
                Ok(chain())
            }));
        }
        {
            let (runtime, chain) = (runtime.clone(), chain.clone());
            op("enableAutomock", Rc::new(move |_| {
                rt!(runtime).automock.set(true);
                Ok(chain())
            }));
        }
        for (name, deep) in [("mock", false), ("doMock", false), ("deepUnmock", true)] {
            let (runtime, chain, from) = (runtime.clone(), chain.clone(), from.clone());
            let is_deep_unmock = deep;
            op(name, Rc::new(move |args| {
                let runtime = rt!(runtime);
                let request = request_arg(args)?;
                if is_deep_unmock {
                    runtime.deep_unmock(&from, &request);
                    return Ok(chain());
                }
                match args.get(1) {
                    Some(factory @ Value::Function(_)) => {
                        let factory = factory.clone();
                        let produce: MockFactory = Rc::new(move || {
                            call_function(&factory, &[]).map_err(RuntimeError::Eval)
                        });
                        let virtual_mock = match args.get(2) {
                            Some(options @ Value::Object(_)) => options
                                .get_property("virtual")
                                .map(|v| v.truthy())
                                .unwrap_or(false),
                            _ => false,
                        };
                        runtime.set_mock_factory(&from, &request, produce, virtual_mock);
                    }
                    _ => runtime.mark_explicit_mock(&from, &request, true),
                }
                Ok(chain())
            }));
        }
        for name in ["unmock", "dontMock"] {
            let (runtime, chain, from) = (runtime.clone(), chain.clone(), from.clone());
            op(name, Rc::new(move |args| {
                rt!(runtime).mark_explicit_mock(&from, &request_arg(args)?, false);
                Ok(chain())
            }));
        }
        {
            let (runtime, chain, from) = (runtime.clone(), chain.clone(), from.clone());
            op("setMock", Rc::new(move |args| {
                let request = request_arg(args)?;
                let value = args.get(1).cloned().unwrap_or(Value::Undefined);
                let factory: MockFactory = Rc::new(move || Ok(value.clone()));
                rt!(runtime).set_mock_factory(&from, &request, factory, false);
                Ok(chain())
            }));
        }
        for name in ["resetModules", "resetModuleRegistry"] {
            let (runtime, chain) = (runtime.clone(), chain.clone());
            op(name, Rc::new(move |_| {
                rt!(runtime).reset_modules();
                Ok(chain())
            }));
        }
        {
            let (runtime, chain) = (runtime.clone(), chain.clone());
            op("isolateModules", Rc::new(move |args| {
                let runtime = rt!(runtime);
                let callback = args
                    .first()
                    .cloned()
                    .ok_or_else(|| EvalError::script("isolateModules expects a function"))?;
                runtime
                    .isolate_scope(|| {
                        call_function(&callback, &[])
                            .map(|_| ())
                            .map_err(RuntimeError::Eval)
                    })
                    .map_err(to_eval_error)?;
                Ok(chain())
            }));
        }
        {
            let (runtime, from) = (runtime.clone(), from.clone());
            op("genMockFromModule", Rc::new(move |args| {
                let runtime = rt!(runtime);
                let request = request_arg(args)?;
                runtime
                    .generate_mock(&from, &request)
                    .map_err(to_eval_error)
            }));
        }
        {
            let runtime = runtime.clone();
            op("fn", Rc::new(move |args| {
                let implementation = args.first().cloned().filter(Value::is_function);
                Ok(rt!(runtime).environment.module_mocker().mock_fn(implementation))
            }));
        }
        {
            let runtime = runtime.clone();
            op("spyOn", Rc::new(move |args| {
                let target = args
                    .first()
                    .cloned()
                    .ok_or_else(|| EvalError::script("spyOn expects an object"))?;
                let key = args
                    .get(1)
                    .and_then(|v| v.as_str().map(|s| s.to_string()))
                    .ok_or_else(|| EvalError::script("spyOn expects a property name"))?;
                rt!(runtime).environment.module_mocker().spy_on(&target, &key)
            }));
        }
        {
            let runtime = runtime.clone();
            op("isMockFunction", Rc::new(move |args| {
                let value = args.first().cloned().unwrap_or(Value::Undefined);
                Ok(Value::Bool(
                    rt!(runtime).environment.module_mocker().is_mock_function(&value),
                ))
            }));
        }
        for (name, which) in [
            ("clearAllMocks", 0u8),
            ("resetAllMocks", 1u8),
            ("restoreAllMocks", 2u8),
        ] {
            let (runtime, chain) = (runtime.clone(), chain.clone());
            op(name, Rc::new(move |_| {
                let runtime = rt!(runtime);
                let mocker = runtime.environment.module_mocker();
                match which {
                    0 => mocker.clear_all(),
                    1 => mocker.reset_all(),
                    _ => mocker.restore_all(),
                }
                Ok(chain())
            }));
        }
        for (name, fake) in [("useFakeTimers", true), ("useRealTimers", false)] {
            let (runtime, chain) = (runtime.clone(), chain.clone());
            op(name, Rc::new(move |_| {
                let runtime = rt!(runtime);
                if fake {
                    runtime.environment.fake_timers().use_fake();
                } else {
                    runtime.environment.fake_timers().use_real();
                }
                Ok(chain())
            }));
        }
        for (name, which) in [
            ("runAllTimers", 0u8),
            ("runOnlyPendingTimers", 1u8),
            ("runAllTicks", 2u8),
            ("runAllImmediates", 3u8),
            ("clearAllTimers", 4u8),
        ] {
            let (runtime, chain, from) = (runtime.clone(), chain.clone(), from.clone());
            op(name, Rc::new(move |_| {
                let runtime = rt!(runtime);
                let handle = FrameworkHandle::new(runtime, from.clone());
                let result = match which {
                    0 => handle.run_all_timers(),
                    1 => handle.run_only_pending_timers(),
                    2 => handle.run_all_ticks(),
                    3 => handle.run_all_immediates(),
                    _ => handle.clear_all_timers(),
                };
                result.map_err(to_eval_error)?;
                Ok(chain())
            }));
        }
        {
            let (runtime, chain, from) = (runtime.clone(), chain.clone(), from.clone());
            op("advanceTimersByTime", Rc::new(move |args| {
                let ms = args.first().and_then(|v| v.as_number()).unwrap_or(0.0);
                FrameworkHandle::new(rt!(runtime), from.clone())
                    .advance_timers_by_time(ms as u64)
                    .map_err(to_eval_error)?;
                Ok(chain())
            }));
        }
        {
            let (runtime, from) = (runtime.clone(), from.clone());
            op("getTimerCount", Rc::new(move |_| {
                let count = FrameworkHandle::new(rt!(runtime), from.clone())
                    .get_timer_count()
                    .map_err(to_eval_error)?;
                Ok(Value::Number(count as f64))
            }));
        }
        {
            let (runtime, chain) = (runtime.clone(), chain.clone());
            op("setTimeout", Rc::new(move |args| {
                let ms = args.first().and_then(|v| v.as_number()).unwrap_or(0.0);
                if let Some(global) = rt!(runtime).environment.global() {
                    let _ = global.set_property(TEST_TIMEOUT_KEY, Value::Number(ms));
                }
                Ok(chain())
            }));
        }
        {
            let (runtime, chain) = (runtime.clone(), chain.clone());
            op("retryTimes", Rc::new(move |args| {
                let n = args.first().and_then(|v| v.as_number()).unwrap_or(0.0);
                if let Some(global) = rt!(runtime).environment.global() {
                    let _ = global.set_property(RETRY_TIMES_KEY, Value::Number(n));
                }
                Ok(chain())
            }));
        }
        {
            let (runtime, from) = (runtime.clone(), from.clone());
            op("requireActual", Rc::new(move |args| {
                let request = request_arg(args)?;
                rt!(runtime)
                    .require_module_impl(&from, Some(&request), false, true)
                    .map_err(to_eval_error)
            }));
        }
        {
            let (runtime, from) = (runtime.clone(), from.clone());
            op("requireMock", Rc::new(move |args| {
                let request = request_arg(args)?;
                rt!(runtime).require_mock(&from, &request).map_err(to_eval_error)
            }));
        }
        {
            let (runtime, chain, from) = (runtime.clone(), chain.clone(), from.clone());
            op("addMatchers", Rc::new(move |args| {
                let runtime = rt!(runtime);
                let matchers = args.first().cloned().unwrap_or(Value::Undefined);
                FrameworkHandle::new(runtime, from.clone()).add_matchers(&matchers);
                Ok(chain())
            }));
        }

        object
    }
}
