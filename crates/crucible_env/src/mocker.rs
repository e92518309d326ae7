//! Mock functions, spies and structural auto-mock metadata.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::interp::call_function;
use crate::script::EvalError;
use crate::value::{Callable, FunctionData, Property, Value};

/// Recorded state behind one mock function.
pub struct MockState {
    calls: RefCell<Vec<Vec<Value>>>,
    implementation: RefCell<Option<Value>>,
    once_implementations: RefCell<VecDeque<Value>>,
    return_value: RefCell<Option<Value>>,
}

impl MockState {
    fn new(implementation: Option<Value>) -> MockState {
        MockState {
            calls: RefCell::new(Vec::new()),
            implementation: RefCell::new(implementation),
            once_implementations: RefCell::new(VecDeque::new()),
            return_value: RefCell::new(None),
        }
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value, EvalError> {
        self.calls.borrow_mut().push(args.to_vec());
        let once = self.once_implementations.borrow_mut().pop_front();
        if let Some(f) = once {
            return call_function(&f, args);
        }
        let implementation = self.implementation.borrow().clone();
        if let Some(f) = implementation {
            return call_function(&f, args);
        }
        let fixed = self.return_value.borrow().clone();
        Ok(fixed.unwrap_or(Value::Undefined))
    }

    pub fn calls(&self) -> Vec<Vec<Value>> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn set_implementation(&self, f: Value) {
        *self.implementation.borrow_mut() = Some(f);
    }

    pub fn set_implementation_once(&self, f: Value) {
        self.once_implementations.borrow_mut().push_back(f);
    }

    pub fn set_return_value(&self, v: Value) {
        *self.return_value.borrow_mut() = Some(v);
    }

    /// Forget recorded calls, keep behavior.
    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Forget recorded calls and configured behavior.
    pub fn reset(&self) {
        self.clear();
        *self.implementation.borrow_mut() = None;
        self.once_implementations.borrow_mut().clear();
        *self.return_value.borrow_mut() = None;
    }
}

/// Primitive snapshot inside metadata.
#[derive(Clone, Debug)]
pub enum ConstantValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl ConstantValue {
    fn of(value: &Value) -> Option<ConstantValue> {
        match value {
            Value::Undefined => Some(ConstantValue::Undefined),
            Value::Null => Some(ConstantValue::Null),
            Value::Bool(b) => Some(ConstantValue::Bool(*b)),
            Value::Number(n) => Some(ConstantValue::Number(*n)),
            Value::Str(s) => Some(ConstantValue::Str(s.to_string())),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ConstantValue::Undefined => Value::Undefined,
            ConstantValue::Null => Value::Null,
            ConstantValue::Bool(b) => Value::Bool(*b),
            ConstantValue::Number(n) => Value::Number(*n),
            ConstantValue::Str(s) => Value::str(s.clone()),
        }
    }
}

/// Structural snapshot of a value's shape. Containers carry an id so cyclic
/// shapes regenerate as cyclic values.
#[derive(Clone, Debug)]
pub enum MockMetadata {
    Constant(ConstantValue),
    Object {
        id: u32,
        members: Vec<(String, MockMetadata)>,
    },
    Array {
        id: u32,
        items: Vec<MockMetadata>,
    },
    Function {
        id: u32,
        name: String,
        members: Vec<(String, MockMetadata)>,
    },
    Ref(u32),
}

struct SpyRecord {
    target: Value,
    key: String,
    original: Value,
}

/// Factory and registry for mock functions and spies.
#[derive(Default)]
pub struct ModuleMocker {
    registry: RefCell<Vec<Weak<MockState>>>,
    spies: RefCell<Vec<SpyRecord>>,
}

impl ModuleMocker {
    pub fn new() -> ModuleMocker {
        ModuleMocker::default()
    }

    /// Create a mock function, optionally delegating to an implementation.
    pub fn mock_fn(&self, implementation: Option<Value>) -> Value {
        let state = Rc::new(MockState::new(implementation));
        self.registry.borrow_mut().push(Rc::downgrade(&state));
        Value::Function(Rc::new(FunctionData {
            name: RefCell::new("mock".to_string()),
            callable: Callable::Mock(state),
            props: RefCell::new(Default::default()),
        }))
    }

    pub fn is_mock_function(&self, value: &Value) -> bool {
        Self::state_of(value).is_some()
    }

    /// The recorded state behind a mock-function value, if it is one.
    pub fn state_of(value: &Value) -> Option<Rc<MockState>> {
        match value {
            Value::Function(data) => match &data.callable {
                Callable::Mock(state) => Some(state.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Replace `target[key]` with a mock that delegates to the original.
    pub fn spy_on(&self, target: &Value, key: &str) -> Result<Value, EvalError> {
        let original = target.get_property(key)?;
        if !original.is_function() {
            return Err(EvalError::script(format!(
                "Cannot spy on '{}': property is not a function",
                key
            )));
        }
        let mock = self.mock_fn(Some(original.clone()));
        if let Value::Function(data) = &mock {
            *data.name.borrow_mut() = key.to_string();
        }
        target.set_property(key, mock.clone())?;
        self.spies.borrow_mut().push(SpyRecord {
            target: target.clone(),
            key: key.to_string(),
            original,
        });
        Ok(mock)
    }

    pub fn clear_all(&self) {
        self.each_live(|state| state.clear());
    }

    pub fn reset_all(&self) {
        self.each_live(|state| state.reset());
    }

    /// Put spied properties back and reset every mock.
    pub fn restore_all(&self) {
        for spy in self.spies.borrow_mut().drain(..) {
            let _ = spy.target.set_property(&spy.key, spy.original);
        }
        self.reset_all();
    }

    fn each_live(&self, f: impl Fn(&MockState)) {
        let mut registry = self.registry.borrow_mut();
        registry.retain(|weak| match weak.upgrade() {
            Some(state) => {
                f(&state);
                true
            }
            None => false,
        });
    }

    /// Structural snapshot of a value. `None` signals there is nothing to
    /// derive a mock from.
    pub fn get_metadata(&self, value: &Value) -> Option<MockMetadata> {
        if value.is_undefined() {
            return None;
        }
        let mut seen = HashMap::new();
        let mut next_id = 0u32;
        Some(meta_of(value, &mut seen, &mut next_id))
    }

    /// Build a fresh instance from metadata; every function slot becomes a
    /// new mock function.
    pub fn generate_from_metadata(&self, metadata: &MockMetadata) -> Value {
        let mut refs = HashMap::new();
        self.generate(metadata, &mut refs)
    }

    fn generate(&self, metadata: &MockMetadata, refs: &mut HashMap<u32, Value>) -> Value {
        match metadata {
            MockMetadata::Constant(c) => c.to_value(),
            MockMetadata::Object { id, members } => {
                let object = Value::object();
                refs.insert(*id, object.clone());
                for (key, member) in members {
                    let _ = object.set_property(key, self.generate(member, refs));
                }
                object
            }
            MockMetadata::Array { id, items } => {
                let array = Value::array(Vec::new());
                refs.insert(*id, array.clone());
                let generated: Vec<Value> =
                    items.iter().map(|m| self.generate(m, refs)).collect();
                if let Value::Array(target) = &array {
                    *target.borrow_mut() = generated;
                }
                array
            }
            MockMetadata::Function { id, name, members } => {
                let mock = self.mock_fn(None);
                if let Value::Function(data) = &mock {
                    *data.name.borrow_mut() = name.clone();
                }
                refs.insert(*id, mock.clone());
                for (key, member) in members {
                    let _ = mock.set_property(key, self.generate(member, refs));
                }
                mock
            }
            MockMetadata::Ref(id) => refs.get(id).cloned().unwrap_or(Value::Undefined),
        }
    }
}

fn meta_of(value: &Value, seen: &mut HashMap<usize, u32>, next_id: &mut u32) -> MockMetadata {
    if let Some(constant) = ConstantValue::of(value) {
        return MockMetadata::Constant(constant);
    }
    match value {
        Value::Object(data) => {
            let ptr = Rc::as_ptr(data) as usize;
            if let Some(id) = seen.get(&ptr) {
                return MockMetadata::Ref(*id);
            }
            let id = *next_id;
            *next_id += 1;
            seen.insert(ptr, id);
            let mut members = Vec::new();
            for (key, prop) in data.borrow().entries() {
                if let Property::Value(v) = prop {
                    members.push((key.clone(), meta_of(v, seen, next_id)));
                }
            }
            MockMetadata::Object { id, members }
        }
        Value::Array(items) => {
            let ptr = Rc::as_ptr(items) as usize;
            if let Some(id) = seen.get(&ptr) {
                return MockMetadata::Ref(*id);
            }
            let id = *next_id;
            *next_id += 1;
            seen.insert(ptr, id);
            let metas = items
                .borrow()
                .iter()
                .map(|v| meta_of(v, seen, next_id))
                .collect();
            MockMetadata::Array { id, items: metas }
        }
        Value::Function(data) => {
            let ptr = Rc::as_ptr(data) as usize;
            if let Some(id) = seen.get(&ptr) {
                return MockMetadata::Ref(*id);
            }
            let id = *next_id;
            *next_id += 1;
            seen.insert(ptr, id);
            let mut members = Vec::new();
            for (key, prop) in data.props.borrow().entries() {
                if let Property::Value(v) = prop {
                    members.push((key.clone(), meta_of(v, seen, next_id)));
                }
            }
            MockMetadata::Function {
                id,
                name: data.name.borrow().clone(),
                members,
            }
        }
        // Primitives were handled above.
        _ => MockMetadata::Constant(ConstantValue::Undefined),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_fn_records_calls() {
        let mocker = ModuleMocker::new();
        let f = mocker.mock_fn(None);
        call_function(&f, &[Value::Number(1.0)]).unwrap();
        call_function(&f, &[Value::Number(2.0), Value::Bool(true)]).unwrap();

        let state = ModuleMocker::state_of(&f).unwrap();
        assert_eq!(state.call_count(), 2);
        assert_eq!(state.calls()[1][0].as_number(), Some(2.0));
    }

    #[test]
    fn test_mock_return_value_and_once() {
        let mocker = ModuleMocker::new();
        let f = mocker.mock_fn(None);
        let state = ModuleMocker::state_of(&f).unwrap();
        state.set_return_value(Value::Number(3.0));
        assert_eq!(call_function(&f, &[]).unwrap().as_number(), Some(3.0));

        let once = mocker.mock_fn(None);
        ModuleMocker::state_of(&once)
            .unwrap()
            .set_return_value(Value::Number(9.0));
        state.set_implementation_once(once);
        assert_eq!(call_function(&f, &[]).unwrap().as_number(), Some(9.0));
        assert_eq!(call_function(&f, &[]).unwrap().as_number(), Some(3.0));
    }

    #[test]
    fn test_spy_delegates_and_restores() {
        let mocker = ModuleMocker::new();
        let target = Value::object();
        target
            .set_property(
                "greet",
                Value::native("greet", Rc::new(|_| Ok(Value::str("hi")))),
            )
            .unwrap();
        let original = target.get_property("greet").unwrap();

        let spy = mocker.spy_on(&target, "greet").unwrap();
        let result = call_function(&target.get_property("greet").unwrap(), &[]).unwrap();
        assert_eq!(result.as_str(), Some("hi"));
        assert_eq!(ModuleMocker::state_of(&spy).unwrap().call_count(), 1);

        mocker.restore_all();
        let restored = target.get_property("greet").unwrap();
        assert!(Value::same_identity(&restored, &original));
    }

    #[test]
    fn test_metadata_regenerates_fresh_mocks() {
        let mocker = ModuleMocker::new();
        let module = Value::object();
        module
            .set_property("compute", mocker.mock_fn(None))
            .unwrap();
        module.set_property("version", Value::Number(2.0)).unwrap();

        let metadata = mocker.get_metadata(&module).unwrap();
        let a = mocker.generate_from_metadata(&metadata);
        let b = mocker.generate_from_metadata(&metadata);

        assert!(!Value::same_identity(&a, &b));
        assert_eq!(a.get_property("version").unwrap().as_number(), Some(2.0));
        let fa = a.get_property("compute").unwrap();
        let fb = b.get_property("compute").unwrap();
        assert!(mocker.is_mock_function(&fa));
        assert!(!Value::same_identity(&fa, &fb));
    }

    #[test]
    fn test_metadata_tolerates_cycles() {
        let mocker = ModuleMocker::new();
        let module = Value::object();
        module.set_property("self", module.clone()).unwrap();

        let metadata = mocker.get_metadata(&module).unwrap();
        let generated = mocker.generate_from_metadata(&metadata);
        let inner = generated.get_property("self").unwrap();
        assert!(Value::same_identity(&generated, &inner));
    }

    #[test]
    fn test_metadata_of_undefined_is_none() {
        let mocker = ModuleMocker::new();
        assert!(mocker.get_metadata(&Value::Undefined).is_none());
    }
}
