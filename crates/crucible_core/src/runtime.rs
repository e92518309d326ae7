//! The runtime: require paths, mock policy, executor and lifecycle.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crucible_env::{
    call_function, current_stack, deep_cyclic_copy, EvalError, Frame, MockMetadata, NativeFn,
    Script, ScriptEnvironment, Value, COVERAGE_KEY,
};
use regex::Regex;

use crate::config::ProjectConfig;
use crate::error::{self, RuntimeError};
use crate::handle::FrameworkHandle;
use crate::module::Module;
use crate::registry::{MockRegistry, ModuleRegistry};
use crate::resolver::{normalize_path, ModuleId, ModuleResolver};
use crate::source_map::SourceMapRegistry;
use crate::transform::ScriptTransformer;

/// Producer for a user-registered mock value.
pub type MockFactory = Rc<dyn Fn() -> Result<Value, RuntimeError>>;

#[derive(Clone, Default)]
struct ExecState {
    current_path: Option<PathBuf>,
    current_manual_mock: Option<PathBuf>,
}

/// Save/restore of the executor's ambient state; restores on drop so an
/// erroring module body cannot leak its frame.
struct AmbientGuard<'a> {
    state: &'a RefCell<ExecState>,
    saved: ExecState,
}

impl<'a> AmbientGuard<'a> {
    fn enter(state: &'a RefCell<ExecState>, path: PathBuf) -> AmbientGuard<'a> {
        let saved = state.replace(ExecState {
            current_path: Some(path.clone()),
            current_manual_mock: Some(path),
        });
        AmbientGuard { state, saved }
    }
}

impl Drop for AmbientGuard<'_> {
    fn drop(&mut self) {
        self.state.replace(self.saved.clone());
    }
}

/// Swaps all four registries out for metadata acquisition and puts them back
/// on drop, so auto-mock generation cannot leak modules anywhere.
struct RegistrySwapGuard<'a> {
    runtime: &'a RuntimeInner,
    saved_modules: ModuleRegistry,
    saved_mocks: MockRegistry,
    saved_isolated_modules: Option<ModuleRegistry>,
    saved_isolated_mocks: Option<MockRegistry>,
}

impl<'a> RegistrySwapGuard<'a> {
    fn enter(runtime: &'a RuntimeInner) -> RegistrySwapGuard<'a> {
        RegistrySwapGuard {
            saved_modules: runtime.module_registry.replace(ModuleRegistry::new()),
            saved_mocks: runtime.mock_registry.replace(MockRegistry::new()),
            saved_isolated_modules: runtime.isolated_registry.replace(None),
            saved_isolated_mocks: runtime.isolated_mock_registry.replace(None),
            runtime,
        }
    }
}

impl Drop for RegistrySwapGuard<'_> {
    fn drop(&mut self) {
        self.runtime
            .module_registry
            .replace(std::mem::take(&mut self.saved_modules));
        self.runtime
            .mock_registry
            .replace(std::mem::take(&mut self.saved_mocks));
        self.runtime
            .isolated_registry
            .replace(self.saved_isolated_modules.take());
        self.runtime
            .isolated_mock_registry
            .replace(self.saved_isolated_mocks.take());
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) config: ProjectConfig,
    pub(crate) environment: Rc<ScriptEnvironment>,
    pub(crate) resolver: Rc<ModuleResolver>,
    transformer: ScriptTransformer,
    source_maps: RefCell<SourceMapRegistry>,

    module_registry: RefCell<ModuleRegistry>,
    internal_registry: RefCell<ModuleRegistry>,
    isolated_registry: RefCell<Option<ModuleRegistry>>,
    mock_registry: RefCell<MockRegistry>,
    isolated_mock_registry: RefCell<Option<MockRegistry>>,

    pub(crate) explicit_should_mock: RefCell<HashMap<ModuleId, bool>>,
    pub(crate) mock_factories: RefCell<HashMap<ModuleId, MockFactory>>,
    pub(crate) virtual_mocks: RefCell<HashSet<PathBuf>>,
    pub(crate) transitive_should_mock: RefCell<HashMap<ModuleId, bool>>,
    should_mock_cache: RefCell<HashMap<ModuleId, bool>>,
    should_unmock_transitive_cache: RefCell<HashMap<String, bool>>,
    mock_meta_cache: RefCell<HashMap<PathBuf, MockMetadata>>,

    pub(crate) automock: Cell<bool>,
    unmock_regex: Option<Regex>,
    exec_state: RefCell<ExecState>,
}

/// The isolated test runtime. Owns the registries, the mock policy tables
/// and the transform pipeline; executes modules through the environment.
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    pub fn new(
        config: ProjectConfig,
        environment: Rc<ScriptEnvironment>,
        resolver: Rc<ModuleResolver>,
        source_cache: Option<HashMap<PathBuf, String>>,
    ) -> Result<Runtime, RuntimeError> {
        // Compiled once per runtime; never a process-global.
        let unmock_regex = if config.unmocked_module_path_patterns.is_empty() {
            None
        } else {
            let joined = config.unmocked_module_path_patterns.join("|");
            Some(
                Regex::new(&joined).map_err(|e| RuntimeError::InvalidConfig {
                    message: format!("bad unmocked module path pattern: {}", e),
                })?,
            )
        };

        let transformer = ScriptTransformer::new(&config, source_cache)?;
        let automock = config.automock;

        Ok(Runtime {
            inner: Rc::new(RuntimeInner {
                config,
                environment,
                resolver,
                transformer,
                source_maps: RefCell::new(SourceMapRegistry::new()),
                module_registry: RefCell::new(ModuleRegistry::new()),
                internal_registry: RefCell::new(ModuleRegistry::new()),
                isolated_registry: RefCell::new(None),
                mock_registry: RefCell::new(MockRegistry::new()),
                isolated_mock_registry: RefCell::new(None),
                explicit_should_mock: RefCell::new(HashMap::new()),
                mock_factories: RefCell::new(HashMap::new()),
                virtual_mocks: RefCell::new(HashSet::new()),
                transitive_should_mock: RefCell::new(HashMap::new()),
                should_mock_cache: RefCell::new(HashMap::new()),
                should_unmock_transitive_cache: RefCell::new(HashMap::new()),
                mock_meta_cache: RefCell::new(HashMap::new()),
                automock: Cell::new(automock),
                unmock_regex,
                exec_state: RefCell::new(ExecState::default()),
            }),
        })
    }

    pub fn environment(&self) -> &Rc<ScriptEnvironment> {
        &self.inner.environment
    }

    /// Load a module; `None` request loads `from` itself (the test file).
    pub fn require_module(
        &self,
        from: &Path,
        request: Option<&str>,
    ) -> Result<Value, RuntimeError> {
        self.inner.require_module_impl(from, request, false, false)
    }

    /// Load into the internal registry; never mocked, never reset.
    pub fn require_internal_module(
        &self,
        from: &Path,
        request: Option<&str>,
    ) -> Result<Value, RuntimeError> {
        self.inner.require_module_impl(from, request, true, false)
    }

    /// The real module, bypassing every mock substitution.
    pub fn require_actual(&self, from: &Path, request: &str) -> Result<Value, RuntimeError> {
        self.inner
            .require_module_impl(from, Some(request), false, true)
    }

    /// The mock for a request, materializing it if needed.
    pub fn require_mock(&self, from: &Path, request: &str) -> Result<Value, RuntimeError> {
        self.inner.require_mock(from, request)
    }

    /// Policy-directed require: mock when the engine says so, else real.
    pub fn require_module_or_mock(
        &self,
        from: &Path,
        request: &str,
    ) -> Result<Value, RuntimeError> {
        self.inner.require_module_or_mock(from, request)
    }

    /// The decision procedure behind [`Runtime::require_module_or_mock`].
    pub fn should_mock(&self, from: &Path, request: &str) -> Result<bool, RuntimeError> {
        self.inner.should_mock(from, request)
    }

    /// Run `f` against fresh module/mock registries. Nesting is an error.
    pub fn isolate_modules(
        &self,
        f: impl FnOnce(&Runtime) -> Result<(), RuntimeError>,
    ) -> Result<(), RuntimeError> {
        self.inner.isolate_scope(|| f(self))
    }

    pub fn reset_modules(&self) {
        self.inner.reset_modules();
    }

    /// Register a fixed mock value for `request`, as seen from `from`.
    pub fn set_mock(&self, from: &Path, request: &str, value: Value) {
        let factory: MockFactory = Rc::new(move || Ok(value.clone()));
        self.inner.set_mock_factory(from, request, factory, false);
    }

    /// Auto-mock synthesis output for `request` without touching policy.
    pub fn generate_mock(&self, from: &Path, request: &str) -> Result<Value, RuntimeError> {
        self.inner.generate_mock(from, request)
    }

    pub fn clear_all_mocks(&self) {
        self.inner.environment.module_mocker().clear_all();
    }

    pub fn reset_all_mocks(&self) {
        self.inner.environment.module_mocker().reset_all();
    }

    pub fn restore_all_mocks(&self) {
        self.inner.environment.module_mocker().restore_all();
    }

    /// Deep copy of the coverage object on the sandbox global; cycles are
    /// tolerated. `undefined` when nothing was collected or after teardown.
    pub fn get_all_coverage_info_copy(&self) -> Value {
        match self.inner.environment.global() {
            Some(global) => {
                let coverage = global
                    .get_property(COVERAGE_KEY)
                    .unwrap_or(Value::Undefined);
                deep_cyclic_copy(&coverage)
            }
            None => Value::Undefined,
        }
    }

    pub fn get_source_maps(&self) -> HashMap<PathBuf, PathBuf> {
        self.inner.source_maps.borrow().all()
    }

    pub fn get_source_map_info(&self, files: &HashSet<PathBuf>) -> HashMap<PathBuf, PathBuf> {
        self.inner.source_maps.borrow().filtered_for_files(files)
    }

    /// The per-module control object, bound to `from` for resolution.
    pub fn handle(&self, from: &Path) -> FrameworkHandle {
        FrameworkHandle::new(self.inner.clone(), from.to_path_buf())
    }

    /// Require each configured setup file through the normal module path.
    pub fn run_setup_files(&self) -> Result<(), RuntimeError> {
        for file in self.inner.config.setup_files.clone() {
            self.require_module(&file, None)?;
        }
        Ok(())
    }
}

impl RuntimeInner {
    // --- REQUIRE PATHS ---

    pub(crate) fn require_module_impl(
        self: &Rc<Self>,
        from: &Path,
        request: Option<&str>,
        internal: bool,
        is_require_actual: bool,
    ) -> Result<Value, RuntimeError> {
        let module_id =
            self.resolver
                .get_module_id(&self.virtual_mocks.borrow(), from, request);

        // Longstanding special path: a manual mock shadows the real file for
        // plain requires, unless the caller is the manual mock itself or the
        // user explicitly unmocked.
        let mut module_path: Option<PathBuf> = None;
        if !internal && !is_require_actual {
            if let Some(request) = request {
                let named = self.resolver.get_module(request);
                if named.is_none() {
                    if let Some(manual) = self.resolver.get_mock_module(from, request) {
                        let executing_manual =
                            self.exec_state.borrow().current_manual_mock.clone();
                        let explicitly_unmocked = self
                            .explicit_should_mock
                            .borrow()
                            .get(&module_id)
                            .copied()
                            == Some(false);
                        if executing_manual.as_deref() != Some(manual.as_path())
                            && !explicitly_unmocked
                        {
                            module_path = Some(manual);
                        }
                    }
                }
            }
        }

        if module_path.is_none() {
            if let Some(request) = request {
                if self.resolver.is_core_module(request) {
                    return self.require_core_module(request);
                }
            }
        }

        let module_path = match module_path {
            Some(path) => path,
            None => match request {
                Some(request) => self.resolver.resolve_module(from, request)?,
                None => normalize_path(from),
            },
        };

        // R-LAYER: internal wins, then an active isolation scope for modules
        // the main registry has not seen, then main.
        #[derive(Clone, Copy, PartialEq)]
        enum Layer {
            Internal,
            Isolated,
            Main,
        }
        let layer = if internal {
            Layer::Internal
        } else if self.isolated_registry.borrow().is_some()
            && !self.module_registry.borrow().contains(&module_path)
        {
            Layer::Isolated
        } else {
            Layer::Main
        };

        let existing = match layer {
            Layer::Internal => self.internal_registry.borrow().get(&module_path),
            Layer::Isolated => self
                .isolated_registry
                .borrow()
                .as_ref()
                .and_then(|r| r.get(&module_path)),
            Layer::Main => self.module_registry.borrow().get(&module_path),
        };
        if let Some(module) = existing {
            self.record_child(from, &module, internal);
            return Ok(module.exports());
        }

        // Insert before executing so cycles observe partial exports.
        let parent_key = request.map(|_| from.to_path_buf());
        let module = Module::new(module_path.clone(), parent_key);
        match layer {
            Layer::Internal => self.internal_registry.borrow_mut().insert(module.clone()),
            Layer::Isolated => {
                if let Some(registry) = self.isolated_registry.borrow_mut().as_mut() {
                    registry.insert(module.clone());
                }
            }
            Layer::Main => self.module_registry.borrow_mut().insert(module.clone()),
        }

        match self.exec_module(&module, internal) {
            Ok(true) => {}
            // Torn down: logged, exit code set, nothing to hand back.
            Ok(false) => return Ok(Value::Undefined),
            Err(error) => {
                // A failed body must re-execute on the next require.
                match layer {
                    Layer::Internal => self.internal_registry.borrow_mut().remove(&module_path),
                    Layer::Isolated => {
                        if let Some(registry) = self.isolated_registry.borrow_mut().as_mut() {
                            registry.remove(&module_path);
                        }
                    }
                    Layer::Main => self.module_registry.borrow_mut().remove(&module_path),
                }
                return Err(error);
            }
        }

        self.record_child(from, &module, internal);
        Ok(module.exports())
    }

    fn require_core_module(&self, request: &str) -> Result<Value, RuntimeError> {
        self.environment
            .native_module(request)
            .ok_or_else(|| RuntimeError::UnknownCoreModule {
                name: request.to_string(),
            })
    }

    pub(crate) fn require_mock(
        self: &Rc<Self>,
        from: &Path,
        request: &str,
    ) -> Result<Value, RuntimeError> {
        let module_id =
            self.resolver
                .get_module_id(&self.virtual_mocks.borrow(), from, Some(request));

        let cached = self
            .isolated_mock_registry
            .borrow()
            .as_ref()
            .and_then(|r| r.get(&module_id))
            .or_else(|| self.mock_registry.borrow().get(&module_id));
        if let Some(value) = cached {
            return Ok(value);
        }

        let factory = self.mock_factories.borrow().get(&module_id).cloned();
        if let Some(factory) = factory {
            let value = factory()?;
            self.insert_mock(module_id, value.clone());
            return Ok(value);
        }

        let manual_mock = self.resolver.get_mock_module(from, request);
        let mut module_path = match &manual_mock {
            Some(path) => path.clone(),
            None => self.resolver.resolve_module(from, request)?,
        };
        // Name-mapper stubs resolve through get_mock_module but are not
        // manual mocks; they get auto-mocked like any real file.
        let mut is_manual = manual_mock.is_some()
            && self
                .resolver
                .resolve_stub_module_name(from, request)
                .is_none();

        if !is_manual {
            if let (Some(dir), Some(base)) = (module_path.parent(), module_path.file_name()) {
                let candidate = dir.join("__mocks__").join(base);
                if candidate.is_file() {
                    tracing::debug!("promoting sibling manual mock {}", candidate.display());
                    is_manual = true;
                    module_path = candidate;
                }
            }
        }

        let value = if is_manual {
            let module = Module::new(module_path, Some(from.to_path_buf()));
            if !self.exec_module(&module, false)? {
                return Ok(Value::Undefined);
            }
            module.exports()
        } else {
            self.generate_mock(from, request)?
        };
        self.insert_mock(module_id, value.clone());
        Ok(value)
    }

    fn insert_mock(&self, module_id: ModuleId, value: Value) {
        let mut isolated = self.isolated_mock_registry.borrow_mut();
        match isolated.as_mut() {
            Some(registry) => registry.insert(module_id, value),
            None => self.mock_registry.borrow_mut().insert(module_id, value),
        }
    }

    pub(crate) fn require_module_or_mock(
        self: &Rc<Self>,
        from: &Path,
        request: &str,
    ) -> Result<Value, RuntimeError> {
        let result = match self.should_mock(from, request) {
            Ok(true) => self.require_mock(from, request),
            Ok(false) => self.require_module_impl(from, Some(request), false, false),
            Err(error) => Err(error),
        };
        result.map_err(|e| {
            error::enrich_not_found(e, from, request, &self.config.module_file_extensions)
        })
    }

    pub(crate) fn generate_mock(
        self: &Rc<Self>,
        from: &Path,
        request: &str,
    ) -> Result<Value, RuntimeError> {
        let module_path = match self.resolver.resolve_stub_module_name(from, request) {
            Some(path) => path,
            None => self.resolver.resolve_module(from, request)?,
        };

        if !self.mock_meta_cache.borrow().contains_key(&module_path) {
            // Run the real module against empty registries so its top-level
            // side effects cannot land in the running test's state.
            let exports = {
                let _swap = RegistrySwapGuard::enter(self);
                self.require_module_impl(from, Some(request), false, false)?
            };
            let metadata = self
                .environment
                .module_mocker()
                .get_metadata(&exports)
                .ok_or_else(|| RuntimeError::MockMetadata {
                    path: module_path.clone(),
                })?;
            self.mock_meta_cache
                .borrow_mut()
                .insert(module_path.clone(), metadata);
        }

        let metadata = match self.mock_meta_cache.borrow().get(&module_path) {
            Some(metadata) => metadata.clone(),
            None => return Err(RuntimeError::MockMetadata { path: module_path }),
        };
        Ok(self
            .environment
            .module_mocker()
            .generate_from_metadata(&metadata))
    }

    // --- MOCK POLICY ---

    pub(crate) fn should_mock(&self, from: &Path, request: &str) -> Result<bool, RuntimeError> {
        // 1. Virtual mocks always mock.
        let mock_path = self.resolver.get_module_path(from, request);
        if self.virtual_mocks.borrow().contains(&mock_path) {
            return Ok(true);
        }

        let module_id =
            self.resolver
                .get_module_id(&self.virtual_mocks.borrow(), from, Some(request));

        // 2. Explicit user decision.
        if let Some(decision) = self.explicit_should_mock.borrow().get(&module_id) {
            return Ok(*decision);
        }

        // 3. Host built-ins never mock.
        if self.resolver.is_core_module(request) {
            return Ok(false);
        }

        // 4. Previously marked transitively unmocked.
        let transitive_key = format!("{}\u{0}{}", from.display(), module_id);
        if self
            .should_unmock_transitive_cache
            .borrow()
            .get(&transitive_key)
            .copied()
            == Some(true)
        {
            return Ok(false);
        }

        // 5. Auto-mock off.
        if !self.automock.get() {
            return Ok(false);
        }

        // 6. Memoized verdict.
        if let Some(decision) = self.should_mock_cache.borrow().get(&module_id) {
            return Ok(*decision);
        }

        let module_path = match self.resolver.resolve_module(from, request) {
            Ok(path) => path,
            Err(error) => {
                // A mock can exist with no real file behind it.
                if self.resolver.get_mock_module(from, request).is_some() {
                    self.should_mock_cache
                        .borrow_mut()
                        .insert(module_id, true);
                    return Ok(true);
                }
                return Err(error);
            }
        };

        // 7. Unmocking one vendored package keeps its own vendored
        // dependencies real too.
        let current_id = self
            .resolver
            .get_module_id(&self.virtual_mocks.borrow(), from, None);
        let deep_unmocked =
            self.transitive_should_mock.borrow().get(&current_id).copied() == Some(false);
        let both_vendored = has_component(from, &self.config.module_directories)
            && has_component(&module_path, &self.config.module_directories);
        let from_unmocked = self.matches_unmock_patterns(from)
            || self.explicit_should_mock.borrow().get(&current_id).copied() == Some(false);
        if deep_unmocked || (both_vendored && from_unmocked) {
            self.transitive_should_mock
                .borrow_mut()
                .insert(module_id, false);
            self.should_unmock_transitive_cache
                .borrow_mut()
                .insert(transitive_key, true);
            return Ok(false);
        }

        // 8. Configured unmock patterns.
        if self.matches_unmock_patterns(&module_path) {
            self.should_mock_cache
                .borrow_mut()
                .insert(module_id, false);
            return Ok(false);
        }

        // 9. Auto-mock is on and nothing objected.
        self.should_mock_cache.borrow_mut().insert(module_id, true);
        Ok(true)
    }

    fn matches_unmock_patterns(&self, path: &Path) -> bool {
        self.unmock_regex
            .as_ref()
            .map(|regex| regex.is_match(&path.to_string_lossy()))
            .unwrap_or(false)
    }

    // --- POLICY MUTATORS (driven by the framework handle) ---

    pub(crate) fn set_mock_factory(
        &self,
        from: &Path,
        request: &str,
        factory: MockFactory,
        virtual_mock: bool,
    ) {
        if virtual_mock {
            let mock_path = self.resolver.get_module_path(from, request);
            self.virtual_mocks.borrow_mut().insert(mock_path);
        }
        let module_id =
            self.resolver
                .get_module_id(&self.virtual_mocks.borrow(), from, Some(request));
        self.explicit_should_mock
            .borrow_mut()
            .insert(module_id.clone(), true);
        self.mock_factories.borrow_mut().insert(module_id, factory);
    }

    pub(crate) fn mark_explicit_mock(&self, from: &Path, request: &str, mock: bool) {
        let module_id =
            self.resolver
                .get_module_id(&self.virtual_mocks.borrow(), from, Some(request));
        self.explicit_should_mock.borrow_mut().insert(module_id, mock);
    }

    pub(crate) fn deep_unmock(&self, from: &Path, request: &str) {
        let module_id =
            self.resolver
                .get_module_id(&self.virtual_mocks.borrow(), from, Some(request));
        self.explicit_should_mock
            .borrow_mut()
            .insert(module_id.clone(), false);
        self.transitive_should_mock
            .borrow_mut()
            .insert(module_id, false);
    }

    pub(crate) fn isolate_scope(
        &self,
        f: impl FnOnce() -> Result<(), RuntimeError>,
    ) -> Result<(), RuntimeError> {
        if self.isolated_registry.borrow().is_some()
            || self.isolated_mock_registry.borrow().is_some()
        {
            return Err(RuntimeError::NestedIsolation);
        }
        *self.isolated_registry.borrow_mut() = Some(ModuleRegistry::new());
        *self.isolated_mock_registry.borrow_mut() = Some(MockRegistry::new());
        let result = f();
        *self.isolated_registry.borrow_mut() = None;
        *self.isolated_mock_registry.borrow_mut() = None;
        result
    }

    pub(crate) fn reset_modules(&self) {
        *self.isolated_registry.borrow_mut() = None;
        *self.isolated_mock_registry.borrow_mut() = None;
        *self.module_registry.borrow_mut() = ModuleRegistry::new();
        *self.mock_registry.borrow_mut() = MockRegistry::new();

        // Best-effort: spy and mock-call state lives on the sandbox global.
        if self.environment.global().is_some() {
            self.environment.module_mocker().clear_all();
        }
        if self.environment.fake_timers().is_installed() {
            self.environment.fake_timers().reset();
        }
    }

    // --- EXECUTOR ---

    /// Execute a pre-allocated module body. `Ok(false)` means the sandbox
    /// was torn down: reported, never thrown.
    fn exec_module(self: &Rc<Self>, module: &Module, internal: bool) -> Result<bool, RuntimeError> {
        let filename = module.filename().to_path_buf();

        let Some(global) = self.environment.global() else {
            self.report_teardown(&filename);
            return Ok(false);
        };

        let _ambient = AmbientGuard::enter(&self.exec_state, filename.clone());

        let dirname = filename
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        module.set_paths(self.resolver.get_module_paths(&dirname));
        self.install_parent_getter(module, internal);
        let require_fn = self.create_require(module, internal);
        module.set_require(require_fn.clone());

        let instrument = !internal && self.transformer.should_instrument(&filename);
        let transformed = self.transformer.transform(&filename, instrument)?;
        if let Some(map) = &transformed.source_map_path {
            self.source_maps
                .borrow_mut()
                .register(&filename, map, transformed.should_map_coverage);
        }

        let Some(handle) = self.environment.run_script(&transformed.script) else {
            self.report_teardown(&filename);
            return Ok(false);
        };
        let wrapper = handle.get_property(Script::ENTRY_KEY).map_err(RuntimeError::Eval)?;

        let mut args = vec![
            module.facade(),
            module.exports(),
            require_fn,
            Value::str(dirname.display().to_string()),
            Value::str(filename.display().to_string()),
            global.clone(),
            FrameworkHandle::new(self.clone(), filename.clone()).to_value(),
        ];
        for name in &self.config.extra_globals {
            let value = global.get_property(name).map_err(RuntimeError::Eval)?;
            if value.is_undefined() {
                return Err(RuntimeError::MissingExtraGlobal { name: name.clone() });
            }
            args.push(value);
        }

        call_function(&wrapper, &args)?;
        module.set_loaded(true);
        Ok(true)
    }

    fn report_teardown(&self, filename: &Path) {
        let stack = self.filter_internal_frames(current_stack());
        tracing::error!("{}", error::teardown_reference_error(filename, &stack));
        self.environment.process_state().set_exit_code(1);
    }

    pub(crate) fn filter_internal_frames(&self, stack: Vec<Frame>) -> Vec<Frame> {
        let internal = self.internal_registry.borrow();
        stack
            .into_iter()
            .filter(|frame| !internal.contains(Path::new(&frame.file)))
            .collect()
    }

    fn record_child(&self, from: &Path, child: &Module, internal: bool) {
        if internal || from == child.filename() {
            return;
        }
        let parent = self
            .isolated_registry
            .borrow()
            .as_ref()
            .and_then(|r| r.get(from))
            .or_else(|| self.module_registry.borrow().get(from));
        if let Some(parent) = parent {
            parent.add_child(child);
        }
    }

    fn install_parent_getter(self: &Rc<Self>, module: &Module, internal: bool) {
        let weak = Rc::downgrade(self);
        let parent_key = module.parent_key().map(Path::to_path_buf);
        let getter: NativeFn = Rc::new(move |_| {
            let Some(runtime) = weak.upgrade() else {
                return Ok(Value::Null);
            };
            let Some(key) = &parent_key else {
                return Ok(Value::Null);
            };
            // Read through the current registry: after a reset or once an
            // isolation scope closes, the parent is simply gone.
            let found = if internal {
                runtime.internal_registry.borrow().get(key)
            } else {
                runtime
                    .isolated_registry
                    .borrow()
                    .as_ref()
                    .and_then(|r| r.get(key))
                    .or_else(|| runtime.module_registry.borrow().get(key))
            };
            Ok(found.map(|m| m.facade()).unwrap_or(Value::Null))
        });
        module.install_parent_getter(getter);
    }

    // --- LOCAL REQUIRE FACTORY ---

    fn create_require(self: &Rc<Self>, module: &Module, internal: bool) -> Value {
        let from = module.filename().to_path_buf();

        let weak = Rc::downgrade(self);
        let require_from = from.clone();
        let main_require: NativeFn = Rc::new(move |args| {
            let request = request_arg(args)?;
            let runtime = upgrade(&weak)?;
            let result = if internal {
                runtime.require_module_impl(&require_from, Some(&request), true, false)
            } else {
                runtime.require_module_or_mock(&require_from, &request)
            };
            result.map_err(to_eval_error)
        });
        let require_fn = Value::native("require", main_require);
        let _ = require_fn.set_property("cache", Value::object());
        let _ = require_fn.set_property("extensions", Value::object());

        let weak = Rc::downgrade(self);
        let actual_from = from.clone();
        let _ = require_fn.set_property(
            "requireActual",
            Value::native("requireActual", Rc::new(move |args| {
                let request = request_arg(args)?;
                let runtime = upgrade(&weak)?;
                runtime
                    .require_module_impl(&actual_from, Some(&request), false, true)
                    .map_err(to_eval_error)
            })),
        );

        let weak = Rc::downgrade(self);
        let mock_from = from.clone();
        let _ = require_fn.set_property(
            "requireMock",
            Value::native("requireMock", Rc::new(move |args| {
                let request = request_arg(args)?;
                let runtime = upgrade(&weak)?;
                runtime
                    .require_mock(&mock_from, &request)
                    .map_err(to_eval_error)
            })),
        );

        let weak = Rc::downgrade(self);
        let resolve_from = from.clone();
        let resolve_fn = Value::native("resolve", Rc::new(move |args| {
            let request = resolve_request_arg(args)?;
            let runtime = upgrade(&weak)?;
            let paths = match args.get(1) {
                Some(options @ Value::Object(_)) => match options.get_property("paths")? {
                    Value::Array(items) => Some(
                        items
                            .borrow()
                            .iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect::<Vec<_>>(),
                    ),
                    _ => None,
                },
                _ => None,
            };
            runtime
                .require_resolve(&resolve_from, &request, paths)
                .map(|p| Value::str(p.display().to_string()))
                .map_err(to_eval_error)
        }));

        let weak = Rc::downgrade(self);
        let paths_from = from.clone();
        let _ = resolve_fn.set_property(
            "paths",
            Value::native("paths", Rc::new(move |args| {
                let request = resolve_request_arg(args)?;
                let runtime = upgrade(&weak)?;
                match runtime
                    .require_resolve_paths(&paths_from, &request)
                    .map_err(to_eval_error)?
                {
                    Some(paths) => Ok(Value::array(
                        paths
                            .into_iter()
                            .map(|p| Value::str(p.display().to_string()))
                            .collect(),
                    )),
                    None => Ok(Value::Null),
                }
            })),
        );
        let _ = require_fn.set_property("resolve", resolve_fn);

        let weak = Rc::downgrade(self);
        let main_from = from;
        let _ = require_fn.set_getter(
            "main",
            Rc::new(move |_| {
                let Some(runtime) = weak.upgrade() else {
                    return Ok(Value::Undefined);
                };
                Ok(runtime.find_main(&main_from).unwrap_or(Value::Undefined))
            }),
        );

        require_fn
    }

    fn require_resolve(
        &self,
        from: &Path,
        request: &str,
        paths: Option<Vec<String>>,
    ) -> Result<PathBuf, RuntimeError> {
        if request.is_empty() {
            return Err(RuntimeError::EmptyResolveRequest);
        }
        if let Some(paths) = paths {
            let base = from.parent().unwrap_or_else(|| Path::new("/"));
            for path in &paths {
                let root = normalize_path(&base.join(path));
                if let Some(found) = self
                    .resolver
                    .resolve_module_from_dir_if_exists(&root, request)
                {
                    return Ok(found);
                }
            }
            return Err(RuntimeError::ModuleNotFound {
                request: request.to_string(),
                from: from.display().to_string(),
                hint: format!(" (searched explicit paths: {})", paths.join(", ")),
            });
        }
        match self.resolver.resolve_module(from, request) {
            Ok(path) => Ok(path),
            // Fall back to a registered mock path.
            Err(error) => match self.resolver.get_mock_module(from, request) {
                Some(mock) => Ok(mock),
                None => Err(error),
            },
        }
    }

    fn require_resolve_paths(
        &self,
        from: &Path,
        request: &str,
    ) -> Result<Option<Vec<PathBuf>>, RuntimeError> {
        if request.is_empty() {
            return Err(RuntimeError::EmptyResolveRequest);
        }
        let dirname = from
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        if request.starts_with('.') {
            return Ok(Some(vec![dirname]));
        }
        if self.resolver.is_core_module(request) {
            return Ok(None);
        }
        Ok(Some(self.resolver.get_module_paths(&dirname)))
    }

    fn find_main(&self, from: &Path) -> Option<Value> {
        let registry = self.module_registry.borrow();
        let mut current = registry.get(from)?;
        let mut visited = HashSet::new();
        visited.insert(current.filename().to_path_buf());
        loop {
            let Some(parent_key) = current.parent_key().map(Path::to_path_buf) else {
                break;
            };
            let Some(parent) = registry.get(&parent_key) else {
                break;
            };
            if !visited.insert(parent.filename().to_path_buf()) {
                break;
            }
            current = parent;
        }
        Some(current.facade())
    }
}

fn has_component(path: &Path, directories: &[String]) -> bool {
    path.components()
        .any(|c| directories.iter().any(|dir| c.as_os_str() == dir.as_str()))
}

pub(crate) fn request_arg(args: &[Value]) -> Result<String, EvalError> {
    args.first()
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| EvalError::script("require expects a module request string"))
}

fn resolve_request_arg(args: &[Value]) -> Result<String, EvalError> {
    match args.first() {
        Some(Value::Str(s)) => Ok(s.to_string()),
        _ => Err(EvalError::script(
            "resolve requires a non-empty request string",
        )),
    }
}

fn upgrade(weak: &std::rc::Weak<RuntimeInner>) -> Result<Rc<RuntimeInner>, EvalError> {
    weak.upgrade()
        .ok_or_else(|| EvalError::script("runtime was dropped while a module was executing"))
}

pub(crate) fn to_eval_error(error: RuntimeError) -> EvalError {
    match error {
        RuntimeError::Eval(inner) => inner,
        other => EvalError::script(other.to_string()),
    }
}
