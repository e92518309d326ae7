//! Shared script values.
//!
//! Everything reference-like (objects, arrays, functions) is an `Rc` over
//! interior-mutable data: the runtime is single-threaded by contract, and
//! module exports must stay aliasable so cyclic requires observe partial
//! state. Property maps are plain Rust maps, so there is no prototype chain
//! to collide with user-controlled keys.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::mocker::MockState;
use crate::script::{EvalError, Frame};

pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, EvalError>>;

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<String>),
    Object(Rc<RefCell<ObjectData>>),
    Array(Rc<RefCell<Vec<Value>>>),
    Function(Rc<FunctionData>),
}

/// An object property: a stored value or a native getter evaluated on read.
#[derive(Clone)]
pub enum Property {
    Value(Value),
    Getter(NativeFn),
}

/// Insertion-ordered property storage.
#[derive(Default)]
pub struct ObjectData {
    entries: Vec<(String, Property)>,
}

impl ObjectData {
    pub fn get(&self, key: &str) -> Option<&Property> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, p)| p)
    }

    pub fn set(&mut self, key: &str, prop: Property) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = prop;
        } else {
            self.entries.push((key.to_string(), prop));
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn entries(&self) -> &[(String, Property)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A callable: host-native, a lowered script closure, or a mock function.
pub enum Callable {
    Native(NativeFn),
    Script(crate::script::ScriptClosure),
    Mock(Rc<MockState>),
}

pub struct FunctionData {
    pub name: RefCell<String>,
    pub callable: Callable,
    pub props: RefCell<ObjectData>,
}

impl Value {
    pub fn object() -> Value {
        Value::Object(Rc::new(RefCell::new(ObjectData::default())))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(Rc::new(s.into()))
    }

    pub fn native(name: &str, f: NativeFn) -> Value {
        Value::Function(Rc::new(FunctionData {
            name: RefCell::new(name.to_string()),
            callable: Callable::Native(f),
            props: RefCell::new(ObjectData::default()),
        }))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Object(_) | Value::Array(_) | Value::Function(_) => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Object(_) | Value::Array(_) => "object",
            Value::Function(_) => "function",
        }
    }

    /// Pointer identity for reference types, value equality otherwise.
    pub fn same_identity(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
            (Value::Array(x), Value::Array(y)) => Rc::ptr_eq(x, y),
            (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
            _ => Value::strict_eq(a, b),
        }
    }

    pub fn strict_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
            (Value::Array(x), Value::Array(y)) => Rc::ptr_eq(x, y),
            (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
            _ => false,
        }
    }

    pub fn loose_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            _ => Value::strict_eq(a, b),
        }
    }

    /// Read a named property. Getters run; absent keys read as `undefined`.
    pub fn get_property(&self, key: &str) -> Result<Value, EvalError> {
        match self {
            Value::Object(data) => {
                let prop = data.borrow().get(key).cloned();
                match prop {
                    Some(Property::Value(v)) => Ok(v),
                    Some(Property::Getter(g)) => g(&[]),
                    None => Ok(Value::Undefined),
                }
            }
            Value::Array(items) => match key {
                "length" => Ok(Value::Number(items.borrow().len() as f64)),
                _ => Ok(Value::Undefined),
            },
            Value::Function(data) => {
                if key == "name" {
                    return Ok(Value::str(data.name.borrow().clone()));
                }
                let prop = data.props.borrow().get(key).cloned();
                match prop {
                    Some(Property::Value(v)) => Ok(v),
                    Some(Property::Getter(g)) => g(&[]),
                    None => Ok(Value::Undefined),
                }
            }
            Value::Str(s) => match key {
                "length" => Ok(Value::Number(s.chars().count() as f64)),
                _ => Ok(Value::Undefined),
            },
            Value::Undefined | Value::Null => Err(EvalError::script(format!(
                "Cannot read property '{}' of {}",
                key,
                self.type_of()
            ))),
            _ => Ok(Value::Undefined),
        }
    }

    /// Write a named property. Assigning over a getter replaces it.
    pub fn set_property(&self, key: &str, value: Value) -> Result<(), EvalError> {
        match self {
            Value::Object(data) => {
                data.borrow_mut().set(key, Property::Value(value));
                Ok(())
            }
            Value::Function(data) => {
                data.props.borrow_mut().set(key, Property::Value(value));
                Ok(())
            }
            Value::Array(items) => {
                if let Ok(index) = key.parse::<usize>() {
                    let mut items = items.borrow_mut();
                    if index >= items.len() {
                        items.resize(index + 1, Value::Undefined);
                    }
                    items[index] = value;
                }
                Ok(())
            }
            _ => Err(EvalError::script(format!(
                "Cannot set property '{}' of {}",
                key,
                self.type_of()
            ))),
        }
    }

    /// Install a native getter on an object or function value.
    pub fn set_getter(&self, key: &str, getter: NativeFn) -> Result<(), EvalError> {
        match self {
            Value::Object(data) => {
                data.borrow_mut().set(key, Property::Getter(getter));
                Ok(())
            }
            Value::Function(data) => {
                data.props.borrow_mut().set(key, Property::Getter(getter));
                Ok(())
            }
            _ => Err(EvalError::script(format!(
                "Cannot define accessor '{}' on {}",
                key,
                self.type_of()
            ))),
        }
    }

    /// Human-readable rendering, bounded so cycles cannot recurse forever.
    pub fn to_display(&self) -> String {
        fn render(value: &Value, depth: usize) -> String {
            if depth > 3 {
                return "…".to_string();
            }
            match value {
                Value::Undefined => "undefined".to_string(),
                Value::Null => "null".to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => {
                    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                        format!("{}", *n as i64)
                    } else {
                        format!("{}", n)
                    }
                }
                Value::Str(s) => s.to_string(),
                Value::Array(items) => {
                    let inner: Vec<String> = items
                        .borrow()
                        .iter()
                        .map(|v| render(v, depth + 1))
                        .collect();
                    format!("[{}]", inner.join(", "))
                }
                Value::Object(data) => {
                    let data = data.borrow();
                    let inner: Vec<String> = data
                        .entries
                        .iter()
                        .map(|(k, p)| match p {
                            Property::Value(v) => format!("{}: {}", k, render(v, depth + 1)),
                            Property::Getter(_) => format!("{}: [getter]", k),
                        })
                        .collect();
                    format!("{{{}}}", inner.join(", "))
                }
                Value::Function(data) => format!("[function {}]", data.name.borrow()),
            }
        }
        render(self, 0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display())
    }
}

/// Deep copy tolerating cycles: already-copied references are reused, so a
/// self-referential object copies into a self-referential copy.
pub fn deep_cyclic_copy(value: &Value) -> Value {
    fn copy(value: &Value, seen: &mut HashMap<usize, Value>) -> Value {
        match value {
            Value::Object(data) => {
                let key = Rc::as_ptr(data) as usize;
                if let Some(existing) = seen.get(&key) {
                    return existing.clone();
                }
                let fresh = Value::object();
                seen.insert(key, fresh.clone());
                for (k, prop) in data.borrow().entries.iter() {
                    let copied = match prop {
                        Property::Value(v) => Property::Value(copy(v, seen)),
                        Property::Getter(g) => Property::Getter(g.clone()),
                    };
                    if let Value::Object(target) = &fresh {
                        target.borrow_mut().set(k, copied);
                    }
                }
                fresh
            }
            Value::Array(items) => {
                let key = Rc::as_ptr(items) as usize;
                if let Some(existing) = seen.get(&key) {
                    return existing.clone();
                }
                let fresh = Value::array(Vec::new());
                seen.insert(key, fresh.clone());
                let copied: Vec<Value> =
                    items.borrow().iter().map(|v| copy(v, seen)).collect();
                if let Value::Array(target) = &fresh {
                    *target.borrow_mut() = copied;
                }
                fresh
            }
            // Functions are shared, primitives are plain clones.
            other => other.clone(),
        }
    }
    copy(value, &mut HashMap::new())
}

/// Format a stack for diagnostics, innermost frame first.
pub fn format_stack(stack: &[Frame]) -> String {
    stack
        .iter()
        .rev()
        .map(|f| format!("    at {}:{}", f.file, f.line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_roundtrip() {
        let obj = Value::object();
        obj.set_property("x", Value::Number(1.0)).unwrap();
        assert_eq!(obj.get_property("x").unwrap().as_number(), Some(1.0));
        assert!(obj.get_property("missing").unwrap().is_undefined());
    }

    #[test]
    fn test_identity_vs_equality() {
        let a = Value::object();
        let b = Value::object();
        assert!(Value::same_identity(&a, &a.clone()));
        assert!(!Value::same_identity(&a, &b));
        assert!(Value::strict_eq(&Value::Number(2.0), &Value::Number(2.0)));
    }

    #[test]
    fn test_deep_copy_preserves_cycles() {
        let obj = Value::object();
        obj.set_property("self", obj.clone()).unwrap();
        obj.set_property("n", Value::Number(7.0)).unwrap();

        let copied = deep_cyclic_copy(&obj);
        assert!(!Value::same_identity(&copied, &obj));
        let inner = copied.get_property("self").unwrap();
        assert!(Value::same_identity(&inner, &copied));
        assert_eq!(copied.get_property("n").unwrap().as_number(), Some(7.0));
    }

    #[test]
    fn test_getter_runs_on_read() {
        let obj = Value::object();
        obj.set_getter("lazy", Rc::new(|_| Ok(Value::Number(9.0))))
            .unwrap();
        assert_eq!(obj.get_property("lazy").unwrap().as_number(), Some(9.0));
    }
}
