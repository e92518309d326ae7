//! Evaluator for lowered scripts.
//!
//! Scopes form a parent chain rooted at the sandbox global: unresolved
//! identifiers read through to global properties and finally to `undefined`,
//! and unqualified assignment writes to the global, mirroring sloppy-mode
//! semantics.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::script::{
    mark_line, ArrowBody, AssignTarget, BinOp, EvalError, Expr, FrameGuard, LogicalOp,
    ScriptClosure, Stmt, TemplatePart, UnOp,
};
use crate::value::{Callable, FunctionData, Value};

#[derive(Clone)]
pub struct Scope(Rc<RefCell<ScopeData>>);

struct ScopeData {
    vars: HashMap<String, Value>,
    parent: Option<Scope>,
    global: Value,
}

impl Scope {
    pub fn root(global: Value) -> Scope {
        Scope(Rc::new(RefCell::new(ScopeData {
            vars: HashMap::new(),
            parent: None,
            global,
        })))
    }

    pub fn child(&self) -> Scope {
        let global = self.0.borrow().global.clone();
        Scope(Rc::new(RefCell::new(ScopeData {
            vars: HashMap::new(),
            parent: Some(self.clone()),
            global,
        })))
    }

    pub fn declare(&self, name: &str, value: Value) {
        self.0.borrow_mut().vars.insert(name.to_string(), value);
    }

    fn global(&self) -> Value {
        self.0.borrow().global.clone()
    }

    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        let mut current = Some(self.clone());
        while let Some(scope) = current {
            let data = scope.0.borrow();
            if let Some(v) = data.vars.get(name) {
                return Ok(v.clone());
            }
            current = data.parent.clone();
        }
        // Fall through to the sandbox global's properties.
        self.global().get_property(name)
    }

    fn assign(&self, name: &str, value: Value) -> Result<(), EvalError> {
        let mut current = Some(self.clone());
        while let Some(scope) = current {
            let mut data = scope.0.borrow_mut();
            if let Some(slot) = data.vars.get_mut(name) {
                *slot = value;
                return Ok(());
            }
            current = data.parent.clone();
        }
        self.global().set_property(name, value)
    }
}

struct ExecCtx {
    file: Rc<String>,
    /// Per-file coverage record (`{path, s}`) when instrumentation is on.
    coverage: Option<Value>,
}

impl ExecCtx {
    fn count_statement(&self, line: u32) {
        if let Some(record) = &self.coverage {
            if let Ok(counters) = record.get_property("s") {
                let key = line.to_string();
                let current = counters
                    .get_property(&key)
                    .ok()
                    .and_then(|v| v.as_number())
                    .unwrap_or(0.0);
                let _ = counters.set_property(&key, Value::Number(current + 1.0));
            }
        }
    }
}

enum Flow {
    Normal,
    Return(Value),
}

/// Run a wrapper body in a fresh frame over the given scope.
pub(crate) fn run_wrapper(
    program: &Rc<Vec<Stmt>>,
    file: &Rc<String>,
    scope: Scope,
    coverage: Option<Value>,
) -> Result<Value, EvalError> {
    let _frame = FrameGuard::enter(file);
    let ctx = ExecCtx {
        file: file.clone(),
        coverage,
    };
    match exec_stmts(program, &scope, &ctx)? {
        Flow::Return(v) => Ok(v),
        Flow::Normal => Ok(Value::Undefined),
    }
}

/// Invoke any callable value with positional arguments.
pub fn call_function(callee: &Value, args: &[Value]) -> Result<Value, EvalError> {
    match callee {
        Value::Function(data) => match &data.callable {
            Callable::Native(f) => f(args),
            Callable::Mock(state) => state.invoke(args),
            Callable::Script(closure) => call_closure(closure, args),
        },
        other => Err(EvalError::script(format!(
            "{} is not a function",
            other.to_display()
        ))),
    }
}

fn call_closure(closure: &ScriptClosure, args: &[Value]) -> Result<Value, EvalError> {
    let _frame = FrameGuard::enter(&closure.file);
    let scope = closure.scope.child();
    for (i, name) in closure.params.iter().enumerate() {
        scope.declare(name, args.get(i).cloned().unwrap_or(Value::Undefined));
    }
    let ctx = ExecCtx {
        file: closure.file.clone(),
        coverage: None,
    };
    match &*closure.body {
        ArrowBody::Expr(expr) => eval_expr(expr, &scope, &ctx),
        ArrowBody::Block(stmts) => match exec_stmts(stmts, &scope, &ctx)? {
            Flow::Return(v) => Ok(v),
            Flow::Normal => Ok(Value::Undefined),
        },
    }
}

fn exec_stmts(stmts: &[Stmt], scope: &Scope, ctx: &ExecCtx) -> Result<Flow, EvalError> {
    for stmt in stmts {
        match stmt {
            Stmt::Expr { line, expr } => {
                mark_line(*line);
                ctx.count_statement(*line);
                eval_expr(expr, scope, ctx)?;
            }
            Stmt::VarDecl { line, name, init } => {
                mark_line(*line);
                ctx.count_statement(*line);
                let value = match init {
                    Some(expr) => eval_expr(expr, scope, ctx)?,
                    None => Value::Undefined,
                };
                if let Value::Function(data) = &value {
                    let mut fn_name = data.name.borrow_mut();
                    if fn_name.is_empty() {
                        *fn_name = name.clone();
                    }
                }
                scope.declare(name, value);
            }
            Stmt::Return { line, value } => {
                mark_line(*line);
                ctx.count_statement(*line);
                let value = match value {
                    Some(expr) => eval_expr(expr, scope, ctx)?,
                    None => Value::Undefined,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::If {
                line,
                test,
                cons,
                alt,
            } => {
                mark_line(*line);
                ctx.count_statement(*line);
                let branch = if eval_expr(test, scope, ctx)?.truthy() {
                    cons
                } else {
                    alt
                };
                if let Flow::Return(v) = exec_stmts(branch, scope, ctx)? {
                    return Ok(Flow::Return(v));
                }
            }
        }
    }
    Ok(Flow::Normal)
}

fn eval_expr(expr: &Expr, scope: &Scope, ctx: &ExecCtx) -> Result<Value, EvalError> {
    match expr {
        Expr::Undefined => Ok(Value::Undefined),
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Str(s) => Ok(Value::str(s.clone())),
        Expr::Template(parts) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    TemplatePart::Str(s) => out.push_str(s),
                    TemplatePart::Expr(e) => {
                        out.push_str(&eval_expr(e, scope, ctx)?.to_display())
                    }
                }
            }
            Ok(Value::str(out))
        }
        Expr::Ident(name) => scope.lookup(name),
        Expr::Member { object, property } => {
            let object = eval_expr(object, scope, ctx)?;
            object.get_property(property)
        }
        Expr::Index { object, index } => {
            let object = eval_expr(object, scope, ctx)?;
            let index = eval_expr(index, scope, ctx)?;
            get_index(&object, &index)
        }
        Expr::Call { line, callee, args } => {
            mark_line(*line);
            let mut evaluated = Vec::with_capacity(args.len());
            let function = match &**callee {
                Expr::Member { object, property } => {
                    let object = eval_expr(object, scope, ctx)?;
                    object.get_property(property)?
                }
                Expr::Index { object, index } => {
                    let object = eval_expr(object, scope, ctx)?;
                    let index = eval_expr(index, scope, ctx)?;
                    get_index(&object, &index)?
                }
                other => eval_expr(other, scope, ctx)?,
            };
            for arg in args {
                evaluated.push(eval_expr(arg, scope, ctx)?);
            }
            call_function(&function, &evaluated)
        }
        Expr::Assign { target, value } => {
            let value = eval_expr(value, scope, ctx)?;
            match &**target {
                AssignTarget::Ident(name) => scope.assign(name, value.clone())?,
                AssignTarget::Member { object, property } => {
                    let object = eval_expr(object, scope, ctx)?;
                    object.set_property(property, value.clone())?;
                }
                AssignTarget::Index { object, index } => {
                    let object = eval_expr(object, scope, ctx)?;
                    let index = eval_expr(index, scope, ctx)?;
                    set_index(&object, &index, value.clone())?;
                }
            }
            Ok(value)
        }
        Expr::Object(entries) => {
            let object = Value::object();
            for (key, value_expr) in entries {
                let value = eval_expr(value_expr, scope, ctx)?;
                object.set_property(key, value)?;
            }
            Ok(object)
        }
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(item, scope, ctx)?);
            }
            Ok(Value::array(out))
        }
        Expr::Arrow { params, body } => {
            Ok(Value::Function(Rc::new(FunctionData {
                name: RefCell::new(String::new()),
                callable: Callable::Script(ScriptClosure {
                    file: ctx.file.clone(),
                    params: params.clone(),
                    body: body.clone(),
                    scope: scope.clone(),
                }),
                props: RefCell::new(Default::default()),
            })))
        }
        Expr::Binary { op, left, right } => {
            let left = eval_expr(left, scope, ctx)?;
            let right = eval_expr(right, scope, ctx)?;
            eval_binary(*op, &left, &right)
        }
        Expr::Logical { op, left, right } => {
            let left = eval_expr(left, scope, ctx)?;
            let take_right = match op {
                LogicalOp::And => left.truthy(),
                LogicalOp::Or => !left.truthy(),
                LogicalOp::Nullish => matches!(left, Value::Undefined | Value::Null),
            };
            if take_right {
                eval_expr(right, scope, ctx)
            } else {
                Ok(left)
            }
        }
        Expr::Unary { op, operand } => {
            let operand = eval_expr(operand, scope, ctx)?;
            Ok(match op {
                UnOp::Not => Value::Bool(!operand.truthy()),
                UnOp::Neg => Value::Number(-operand.as_number().unwrap_or(f64::NAN)),
                UnOp::TypeOf => Value::str(operand.type_of()),
                UnOp::Void => Value::Undefined,
            })
        }
        Expr::Conditional { test, cons, alt } => {
            if eval_expr(test, scope, ctx)?.truthy() {
                eval_expr(cons, scope, ctx)
            } else {
                eval_expr(alt, scope, ctx)
            }
        }
    }
}

fn get_index(object: &Value, index: &Value) -> Result<Value, EvalError> {
    if let (Value::Array(items), Value::Number(n)) = (object, index) {
        let items = items.borrow();
        let i = *n as usize;
        return Ok(items.get(i).cloned().unwrap_or(Value::Undefined));
    }
    object.get_property(&index.to_display())
}

fn set_index(object: &Value, index: &Value, value: Value) -> Result<(), EvalError> {
    if let (Value::Array(items), Value::Number(n)) = (object, index) {
        let mut items = items.borrow_mut();
        let i = *n as usize;
        if i >= items.len() {
            items.resize(i + 1, Value::Undefined);
        }
        items[i] = value;
        return Ok(());
    }
    object.set_property(&index.to_display(), value)
}

fn eval_binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinOp::Add => {
            if matches!(left, Value::Str(_)) || matches!(right, Value::Str(_)) {
                return Ok(Value::str(format!(
                    "{}{}",
                    left.to_display(),
                    right.to_display()
                )));
            }
            numeric(op, left, right)
        }
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => numeric(op, left, right),
        BinOp::StrictEq => Ok(Value::Bool(Value::strict_eq(left, right))),
        BinOp::StrictNeq => Ok(Value::Bool(!Value::strict_eq(left, right))),
        BinOp::LooseEq => Ok(Value::Bool(Value::loose_eq(left, right))),
        BinOp::LooseNeq => Ok(Value::Bool(!Value::loose_eq(left, right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            if let (Value::Str(a), Value::Str(b)) = (left, right) {
                return Ok(Value::Bool(match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    _ => a >= b,
                }));
            }
            let (a, b) = (
                left.as_number().unwrap_or(f64::NAN),
                right.as_number().unwrap_or(f64::NAN),
            );
            Ok(Value::Bool(match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                _ => a >= b,
            }))
        }
    }
}

fn numeric(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let (a, b) = (
        left.as_number().unwrap_or(f64::NAN),
        right.as_number().unwrap_or(f64::NAN),
    );
    Ok(Value::Number(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Rem => a % b,
        _ => f64::NAN,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use std::path::Path;

    fn eval_snippet(code: &str, bindings: &[(&str, Value)]) -> Value {
        let script = Script::compile(Path::new("/snippet.js"), code, false, &[]).unwrap();
        let global = Value::object();
        let scope = Scope::root(global);
        for (name, value) in bindings {
            scope.declare(name, value.clone());
        }
        let file = Rc::new("/snippet.js".to_string());
        run_wrapper(&script.program, &file, scope, None).unwrap()
    }

    #[test]
    fn test_arithmetic_and_return() {
        let v = eval_snippet("return 2 + 3 * 4;", &[]);
        assert_eq!(v.as_number(), Some(14.0));
    }

    #[test]
    fn test_closures_capture_scope() {
        let v = eval_snippet(
            "const base = 10; const add = (n) => base + n; return add(5);",
            &[],
        );
        assert_eq!(v.as_number(), Some(15.0));
    }

    #[test]
    fn test_member_assignment_mutates_shared_object() {
        let target = Value::object();
        eval_snippet("box.x = 1; box.y = box.x + 1;", &[("box", target.clone())]);
        assert_eq!(target.get_property("y").unwrap().as_number(), Some(2.0));
    }

    #[test]
    fn test_template_literals() {
        let v = eval_snippet("const n = 3; return `n is ${n}`;", &[]);
        assert_eq!(v.as_str(), Some("n is 3"));
    }

    #[test]
    fn test_undeclared_reads_are_undefined() {
        let v = eval_snippet("return typeof nothing;", &[]);
        assert_eq!(v.as_str(), Some("undefined"));
    }
}
