//! Compiled scripts: oxc parse + lowering into an owned instruction tree.
//!
//! Lowering copies everything out of the parser arena, so a `Script` owns its
//! program outright and closures created during evaluation can outlive the
//! allocator. Anything outside the supported source subset is rejected here,
//! at compile time, never mid-execution.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use oxc_allocator::Allocator;
use oxc_ast::ast;
use oxc_parser::{ParseOptions, Parser};
use oxc_span::{GetSpan, SourceType};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Frame {
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("{message}")]
    Script { message: String, stack: Vec<Frame> },
    #[error("syntax error in {path}: {message}")]
    Parse { path: String, message: String },
    #[error("unsupported syntax in {path}:{line}: {what}")]
    UnsupportedSyntax {
        path: String,
        line: u32,
        what: String,
    },
}

impl EvalError {
    /// A script-semantics error carrying the stack as materialized right now.
    pub fn script(message: impl Into<String>) -> EvalError {
        EvalError::Script {
            message: message.into(),
            stack: current_stack(),
        }
    }

    pub fn stack(&self) -> &[Frame] {
        match self {
            EvalError::Script { stack, .. } => stack,
            _ => &[],
        }
    }
}

thread_local! {
    static CALL_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn push_frame(file: &str) {
    CALL_STACK.with(|s| {
        s.borrow_mut().push(Frame {
            file: file.to_string(),
            line: 0,
        })
    });
}

pub(crate) fn pop_frame() {
    CALL_STACK.with(|s| {
        s.borrow_mut().pop();
    });
}

pub(crate) fn mark_line(line: u32) {
    CALL_STACK.with(|s| {
        if let Some(top) = s.borrow_mut().last_mut() {
            top.line = line;
        }
    });
}

/// Snapshot of the script stack, outermost frame first.
pub fn current_stack() -> Vec<Frame> {
    CALL_STACK.with(|s| s.borrow().clone())
}

/// RAII frame for evaluator entries; pops even when evaluation errors.
pub(crate) struct FrameGuard;

impl FrameGuard {
    pub(crate) fn enter(file: &str) -> FrameGuard {
        push_frame(file);
        FrameGuard
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        pop_frame();
    }
}

// --- OWNED INSTRUCTION TREE ---

#[derive(Clone)]
pub(crate) enum Stmt {
    Expr {
        line: u32,
        expr: Expr,
    },
    VarDecl {
        line: u32,
        name: String,
        init: Option<Expr>,
    },
    Return {
        line: u32,
        value: Option<Expr>,
    },
    If {
        line: u32,
        test: Expr,
        cons: Vec<Stmt>,
        alt: Vec<Stmt>,
    },
}

#[derive(Clone)]
pub(crate) enum Expr {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Template(Vec<TemplatePart>),
    Ident(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        line: u32,
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Assign {
        target: Box<AssignTarget>,
        value: Box<Expr>,
    },
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Arrow {
        params: Rc<Vec<String>>,
        body: Rc<ArrowBody>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        cons: Box<Expr>,
        alt: Box<Expr>,
    },
}

#[derive(Clone)]
pub(crate) enum TemplatePart {
    Str(String),
    Expr(Box<Expr>),
}

#[derive(Clone)]
pub(crate) enum AssignTarget {
    Ident(String),
    Member { object: Expr, property: String },
    Index { object: Expr, index: Expr },
}

#[derive(Clone)]
pub(crate) enum ArrowBody {
    Expr(Box<Expr>),
    Block(Vec<Stmt>),
}

#[derive(Clone, Copy)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    StrictEq,
    StrictNeq,
    LooseEq,
    LooseNeq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy)]
pub(crate) enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Clone, Copy)]
pub(crate) enum UnOp {
    Not,
    Neg,
    TypeOf,
    Void,
}

/// A closure produced by evaluating an arrow/function expression.
#[derive(Clone)]
pub struct ScriptClosure {
    pub(crate) file: Rc<String>,
    pub(crate) params: Rc<Vec<String>>,
    pub(crate) body: Rc<ArrowBody>,
    pub(crate) scope: crate::interp::Scope,
}

// --- COMPILED SCRIPT ---

/// A compiled unit the environment can execute.
pub struct Script {
    pub path: PathBuf,
    pub code: String,
    /// Statement-execution counters are maintained for this file when set.
    pub instrument: bool,
    /// Names bound after the fixed synthetic arguments, in order.
    pub extra_params: Vec<String>,
    pub(crate) program: Rc<Vec<Stmt>>,
}

impl Script {
    /// Property on the execution handle holding the wrapper function.
    pub const ENTRY_KEY: &'static str = "__wrapper__";

    pub fn compile(
        path: &Path,
        code: &str,
        instrument: bool,
        extra_params: &[String],
    ) -> Result<Script, EvalError> {
        let allocator = Allocator::default();
        let source_type = SourceType::from_path(path).unwrap_or_default();
        let ret = Parser::new(&allocator, code, source_type)
            .with_options(ParseOptions {
                allow_return_outside_function: true,
                ..ParseOptions::default()
            })
            .parse();

        if let Some(first) = ret.errors.first() {
            return Err(EvalError::Parse {
                path: path.display().to_string(),
                message: format!("{:?}", first),
            });
        }

        let ctx = LowerCtx {
            path: path.display().to_string(),
            lines: LineIndex::new(code),
        };
        let mut program = Vec::new();
        for stmt in &ret.program.body {
            ctx.lower_stmt(stmt, &mut program)?;
        }

        Ok(Script {
            path: path.to_path_buf(),
            code: code.to_string(),
            instrument,
            extra_params: extra_params.to_vec(),
            program: Rc::new(program),
        })
    }
}

// --- LOWERING ---

struct LineIndex {
    starts: Vec<u32>,
}

impl LineIndex {
    fn new(code: &str) -> LineIndex {
        let mut starts = vec![0u32];
        for (i, b) in code.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i as u32 + 1);
            }
        }
        LineIndex { starts }
    }

    fn line_of(&self, offset: u32) -> u32 {
        match self.starts.binary_search(&offset) {
            Ok(i) => i as u32 + 1,
            Err(i) => i as u32,
        }
    }
}

struct LowerCtx {
    path: String,
    lines: LineIndex,
}

impl LowerCtx {
    fn unsupported(&self, offset: u32, what: &str) -> EvalError {
        EvalError::UnsupportedSyntax {
            path: self.path.clone(),
            line: self.lines.line_of(offset),
            what: what.to_string(),
        }
    }

    fn lower_stmt(&self, stmt: &ast::Statement, out: &mut Vec<Stmt>) -> Result<(), EvalError> {
        let line = self.lines.line_of(stmt.span().start);
        match stmt {
            ast::Statement::ExpressionStatement(es) => {
                let expr = self.lower_expr(&es.expression)?;
                out.push(Stmt::Expr { line, expr });
            }
            ast::Statement::VariableDeclaration(decl) => {
                for declarator in &decl.declarations {
                    let name = match &declarator.id.kind {
                        ast::BindingPatternKind::BindingIdentifier(id) => id.name.to_string(),
                        _ => {
                            return Err(
                                self.unsupported(stmt.span().start, "destructuring binding")
                            )
                        }
                    };
                    let init = declarator
                        .init
                        .as_ref()
                        .map(|e| self.lower_expr(e))
                        .transpose()?;
                    out.push(Stmt::VarDecl { line, name, init });
                }
            }
            ast::Statement::ReturnStatement(rs) => {
                let value = rs.argument.as_ref().map(|e| self.lower_expr(e)).transpose()?;
                out.push(Stmt::Return { line, value });
            }
            ast::Statement::IfStatement(is) => {
                let test = self.lower_expr(&is.test)?;
                let mut cons = Vec::new();
                self.lower_branch(&is.consequent, &mut cons)?;
                let mut alt = Vec::new();
                if let Some(alternate) = &is.alternate {
                    self.lower_branch(alternate, &mut alt)?;
                }
                out.push(Stmt::If {
                    line,
                    test,
                    cons,
                    alt,
                });
            }
            ast::Statement::BlockStatement(bs) => {
                for inner in &bs.body {
                    self.lower_stmt(inner, out)?;
                }
            }
            ast::Statement::FunctionDeclaration(f) => {
                let name = match &f.id {
                    Some(id) => id.name.to_string(),
                    None => return Err(self.unsupported(stmt.span().start, "anonymous function declaration")),
                };
                let init = self.lower_function(&f.params, f.body.as_deref(), stmt.span().start)?;
                out.push(Stmt::VarDecl {
                    line,
                    name,
                    init: Some(init),
                });
            }
            ast::Statement::EmptyStatement(_) => {}
            other => {
                return Err(self.unsupported(
                    other.span().start,
                    "statement kind outside the supported subset",
                ))
            }
        }
        Ok(())
    }

    fn lower_branch(&self, stmt: &ast::Statement, out: &mut Vec<Stmt>) -> Result<(), EvalError> {
        match stmt {
            ast::Statement::BlockStatement(bs) => {
                for inner in &bs.body {
                    self.lower_stmt(inner, out)?;
                }
                Ok(())
            }
            other => self.lower_stmt(other, out),
        }
    }

    fn lower_params(&self, params: &ast::FormalParameters, offset: u32) -> Result<Vec<String>, EvalError> {
        let mut names = Vec::new();
        for param in &params.items {
            match &param.pattern.kind {
                ast::BindingPatternKind::BindingIdentifier(id) => names.push(id.name.to_string()),
                _ => return Err(self.unsupported(offset, "destructuring parameter")),
            }
        }
        Ok(names)
    }

    fn lower_function(
        &self,
        params: &ast::FormalParameters,
        body: Option<&ast::FunctionBody>,
        offset: u32,
    ) -> Result<Expr, EvalError> {
        let params = self.lower_params(params, offset)?;
        let body = match body {
            Some(body) => {
                let mut stmts = Vec::new();
                for stmt in &body.statements {
                    self.lower_stmt(stmt, &mut stmts)?;
                }
                ArrowBody::Block(stmts)
            }
            None => return Err(self.unsupported(offset, "function without a body")),
        };
        Ok(Expr::Arrow {
            params: Rc::new(params),
            body: Rc::new(body),
        })
    }

    fn lower_expr(&self, expr: &ast::Expression) -> Result<Expr, EvalError> {
        match expr {
            ast::Expression::BooleanLiteral(lit) => Ok(Expr::Bool(lit.value)),
            ast::Expression::NullLiteral(_) => Ok(Expr::Null),
            ast::Expression::NumericLiteral(lit) => Ok(Expr::Number(lit.value)),
            ast::Expression::StringLiteral(lit) => Ok(Expr::Str(lit.value.to_string())),
            ast::Expression::TemplateLiteral(tpl) => {
                let mut parts = Vec::new();
                let mut exprs = tpl.expressions.iter();
                for quasi in &tpl.quasis {
                    let text = quasi
                        .value
                        .cooked
                        .as_ref()
                        .map(|a| a.to_string())
                        .unwrap_or_default();
                    parts.push(TemplatePart::Str(text));
                    if !quasi.tail {
                        if let Some(e) = exprs.next() {
                            parts.push(TemplatePart::Expr(Box::new(self.lower_expr(e)?)));
                        }
                    }
                }
                Ok(Expr::Template(parts))
            }
            ast::Expression::Identifier(ident) => {
                if ident.name == "undefined" {
                    Ok(Expr::Undefined)
                } else {
                    Ok(Expr::Ident(ident.name.to_string()))
                }
            }
            ast::Expression::StaticMemberExpression(member) => Ok(Expr::Member {
                object: Box::new(self.lower_expr(&member.object)?),
                property: member.property.name.to_string(),
            }),
            ast::Expression::ComputedMemberExpression(member) => Ok(Expr::Index {
                object: Box::new(self.lower_expr(&member.object)?),
                index: Box::new(self.lower_expr(&member.expression)?),
            }),
            ast::Expression::CallExpression(call) => {
                let callee = self.lower_expr(&call.callee)?;
                let mut args = Vec::new();
                for arg in &call.arguments {
                    match arg.as_expression() {
                        Some(e) => args.push(self.lower_expr(e)?),
                        None => {
                            return Err(
                                self.unsupported(call.span.start, "spread call argument")
                            )
                        }
                    }
                }
                Ok(Expr::Call {
                    line: self.lines.line_of(call.span.start),
                    callee: Box::new(callee),
                    args,
                })
            }
            ast::Expression::AssignmentExpression(assign) => {
                if assign.operator != ast::AssignmentOperator::Assign {
                    return Err(
                        self.unsupported(assign.span.start, "compound assignment operator")
                    );
                }
                let target = match &assign.left {
                    ast::AssignmentTarget::AssignmentTargetIdentifier(id) => {
                        AssignTarget::Ident(id.name.to_string())
                    }
                    ast::AssignmentTarget::StaticMemberExpression(member) => {
                        AssignTarget::Member {
                            object: self.lower_expr(&member.object)?,
                            property: member.property.name.to_string(),
                        }
                    }
                    ast::AssignmentTarget::ComputedMemberExpression(member) => {
                        AssignTarget::Index {
                            object: self.lower_expr(&member.object)?,
                            index: self.lower_expr(&member.expression)?,
                        }
                    }
                    _ => {
                        return Err(
                            self.unsupported(assign.span.start, "destructuring assignment")
                        )
                    }
                };
                Ok(Expr::Assign {
                    target: Box::new(target),
                    value: Box::new(self.lower_expr(&assign.right)?),
                })
            }
            ast::Expression::ObjectExpression(obj) => {
                let mut entries = Vec::new();
                for prop in &obj.properties {
                    match prop {
                        ast::ObjectPropertyKind::ObjectProperty(p) => {
                            let key = match &p.key {
                                ast::PropertyKey::StaticIdentifier(id) => id.name.to_string(),
                                ast::PropertyKey::StringLiteral(s) => s.value.to_string(),
                                _ => {
                                    return Err(
                                        self.unsupported(obj.span.start, "computed object key")
                                    )
                                }
                            };
                            entries.push((key, self.lower_expr(&p.value)?));
                        }
                        ast::ObjectPropertyKind::SpreadProperty(_) => {
                            return Err(self.unsupported(obj.span.start, "object spread"))
                        }
                    }
                }
                Ok(Expr::Object(entries))
            }
            ast::Expression::ArrayExpression(arr) => {
                let mut items = Vec::new();
                for element in &arr.elements {
                    if let Some(e) = element.as_expression() {
                        items.push(self.lower_expr(e)?);
                    } else if matches!(element, ast::ArrayExpressionElement::Elision(_)) {
                        items.push(Expr::Undefined);
                    } else {
                        return Err(self.unsupported(arr.span.start, "array spread"));
                    }
                }
                Ok(Expr::Array(items))
            }
            ast::Expression::ArrowFunctionExpression(arrow) => {
                let params = self.lower_params(&arrow.params, arrow.span.start)?;
                let body = if arrow.expression {
                    match arrow.body.statements.first() {
                        Some(ast::Statement::ExpressionStatement(es)) => {
                            ArrowBody::Expr(Box::new(self.lower_expr(&es.expression)?))
                        }
                        _ => {
                            return Err(
                                self.unsupported(arrow.span.start, "arrow expression body")
                            )
                        }
                    }
                } else {
                    let mut stmts = Vec::new();
                    for stmt in &arrow.body.statements {
                        self.lower_stmt(stmt, &mut stmts)?;
                    }
                    ArrowBody::Block(stmts)
                };
                Ok(Expr::Arrow {
                    params: Rc::new(params),
                    body: Rc::new(body),
                })
            }
            ast::Expression::FunctionExpression(f) => {
                self.lower_function(&f.params, f.body.as_deref(), f.span.start)
            }
            ast::Expression::ParenthesizedExpression(p) => self.lower_expr(&p.expression),
            ast::Expression::BinaryExpression(bin) => {
                let op = match bin.operator {
                    ast::BinaryOperator::Addition => BinOp::Add,
                    ast::BinaryOperator::Subtraction => BinOp::Sub,
                    ast::BinaryOperator::Multiplication => BinOp::Mul,
                    ast::BinaryOperator::Division => BinOp::Div,
                    ast::BinaryOperator::Remainder => BinOp::Rem,
                    ast::BinaryOperator::StrictEquality => BinOp::StrictEq,
                    ast::BinaryOperator::StrictInequality => BinOp::StrictNeq,
                    ast::BinaryOperator::Equality => BinOp::LooseEq,
                    ast::BinaryOperator::Inequality => BinOp::LooseNeq,
                    ast::BinaryOperator::LessThan => BinOp::Lt,
                    ast::BinaryOperator::LessEqualThan => BinOp::Le,
                    ast::BinaryOperator::GreaterThan => BinOp::Gt,
                    ast::BinaryOperator::GreaterEqualThan => BinOp::Ge,
                    _ => {
                        return Err(
                            self.unsupported(bin.span.start, "binary operator outside subset")
                        )
                    }
                };
                Ok(Expr::Binary {
                    op,
                    left: Box::new(self.lower_expr(&bin.left)?),
                    right: Box::new(self.lower_expr(&bin.right)?),
                })
            }
            ast::Expression::LogicalExpression(log) => {
                let op = match log.operator {
                    ast::LogicalOperator::And => LogicalOp::And,
                    ast::LogicalOperator::Or => LogicalOp::Or,
                    ast::LogicalOperator::Coalesce => LogicalOp::Nullish,
                };
                Ok(Expr::Logical {
                    op,
                    left: Box::new(self.lower_expr(&log.left)?),
                    right: Box::new(self.lower_expr(&log.right)?),
                })
            }
            ast::Expression::UnaryExpression(unary) => {
                let op = match unary.operator {
                    ast::UnaryOperator::LogicalNot => UnOp::Not,
                    ast::UnaryOperator::UnaryNegation => UnOp::Neg,
                    ast::UnaryOperator::Typeof => UnOp::TypeOf,
                    ast::UnaryOperator::Void => UnOp::Void,
                    _ => {
                        return Err(
                            self.unsupported(unary.span.start, "unary operator outside subset")
                        )
                    }
                };
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(self.lower_expr(&unary.argument)?),
                })
            }
            ast::Expression::ConditionalExpression(cond) => Ok(Expr::Conditional {
                test: Box::new(self.lower_expr(&cond.test)?),
                cons: Box::new(self.lower_expr(&cond.consequent)?),
                alt: Box::new(self.lower_expr(&cond.alternate)?),
            }),
            other => Err(self.unsupported(
                other.span().start,
                "expression kind outside the supported subset",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_compile_accepts_subset() {
        let script = Script::compile(
            Path::new("/src/a.js"),
            "const a = require('./b'); exports.x = a + 1;",
            false,
            &[],
        );
        assert!(script.is_ok());
    }

    #[test]
    fn test_compile_rejects_loops() {
        let err = Script::compile(Path::new("/src/a.js"), "while (true) {}", false, &[])
            .err()
            .expect("loops are outside the subset");
        assert!(matches!(err, EvalError::UnsupportedSyntax { .. }));
    }

    #[test]
    fn test_compile_reports_syntax_errors() {
        let err = Script::compile(Path::new("/src/a.js"), "const = ;", false, &[])
            .err()
            .expect("should fail to parse");
        assert!(matches!(err, EvalError::Parse { .. }));
    }

    #[test]
    fn test_line_index() {
        let idx = LineIndex::new("a\nbb\nccc\n");
        assert_eq!(idx.line_of(0), 1);
        assert_eq!(idx.line_of(2), 2);
        assert_eq!(idx.line_of(5), 3);
    }
}
