//! Pre-transformed guest program representation.
//!
//! The engine does not compile guest code. The out-of-process transformer
//! rewrites the guest's source into an instruction tree in which every loop,
//! string concatenation, template literal, console access and tool call
//! appears only in its rewritten hook form, and ships it as JSON. This module
//! deserializes and validates that tree.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use warden_core::constants::MAX_PROGRAM_NODES;

/// Name of the guest's async entry point.
pub const ENTRY_POINT: &str = "__ag_main";

/// A complete pre-transformed guest program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestProgram {
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
}

/// A top-level function declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// A statement in the curated subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Stmt {
    /// `let`/`const` declaration.
    Let {
        name: String,
        #[serde(default)]
        init: Option<Expr>,
    },
    /// Bare expression statement.
    Expr { expr: Expr },
    /// `return`.
    Return {
        #[serde(default)]
        arg: Option<Expr>,
    },
    /// `if`/`else`.
    If {
        test: Expr,
        #[serde(default)]
        then: Vec<Stmt>,
        #[serde(default, rename = "else")]
        alt: Vec<Stmt>,
    },
    /// Braced block.
    Block {
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// `for (… of …)`, rewritten to the `forOf` hook.
    ForOf {
        binding: String,
        iterable: Expr,
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// C-style `for`, rewritten to the `for` hook.
    For {
        #[serde(default)]
        init: Option<Box<Stmt>>,
        #[serde(default)]
        test: Option<Expr>,
        #[serde(default)]
        update: Option<Expr>,
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// `while`, rewritten to the `while` hook.
    While {
        test: Expr,
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// `do … while`, rewritten to the `doWhile` hook.
    DoWhile {
        test: Expr,
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// `try`/`catch`/`finally`.
    Try {
        #[serde(default)]
        body: Vec<Stmt>,
        #[serde(default)]
        catch_binding: Option<String>,
        #[serde(default)]
        catch: Option<Vec<Stmt>>,
        #[serde(default)]
        finally: Vec<Stmt>,
    },
    /// `throw`.
    Throw { arg: Expr },
    /// `break` out of the innermost loop.
    Break,
    /// `continue` the innermost loop.
    Continue,
}

/// An expression in the curated subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Expr {
    Undefined,
    Null,
    Bool { value: bool },
    Num { value: f64 },
    Str { value: String },
    BigInt { value: String },
    Array {
        #[serde(default)]
        items: Vec<Expr>,
    },
    Object {
        #[serde(default)]
        props: Vec<(String, Expr)>,
    },
    Ident { name: String },
    /// Static property access, `a.b`.
    Member {
        object: Box<Expr>,
        property: String,
    },
    /// Computed property access, `a[b]`.
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Ternary conditional.
    Cond {
        test: Box<Expr>,
        then: Box<Expr>,
        #[serde(rename = "else")]
        alt: Box<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        #[serde(default)]
        args: Vec<Expr>,
    },
    /// `new X(...)`; only the curated constructors are newable.
    New {
        callee: Box<Expr>,
        #[serde(default)]
        args: Vec<Expr>,
    },
    Await { expr: Box<Expr> },
    /// Function expression, used for `parallel` callbacks.
    Function {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        params: Vec<String>,
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// `+` rewritten by the transformer for possibly-string operands.
    Concat {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Template literal rewritten by the transformer.
    Template {
        quasis: Vec<String>,
        #[serde(default)]
        values: Vec<Expr>,
    },
}

/// Unary operators in the curated subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnaryOp {
    Neg,
    Not,
    TypeOf,
    Plus,
}

/// Binary operators. Raw `Add` is numeric-only: the transformer rewrites any
/// possibly-string `+` into [`Expr::Concat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Short-circuiting operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

impl GuestProgram {
    /// Parses a pre-transformed program from its JSON source and validates
    /// it. Any failure is a `VALIDATION_ERROR`.
    pub fn parse(source: &str) -> EngineResult<Self> {
        let program: GuestProgram = serde_json::from_str(source)
            .map_err(|e| EngineError::validation(format!("Malformed guest program: {e}")))?;
        program.validate()?;
        Ok(program)
    }

    /// Structural validation: node budget and duplicate declarations.
    pub fn validate(&self) -> EngineResult<()> {
        let nodes = self.node_count();
        if nodes > MAX_PROGRAM_NODES {
            return Err(EngineError::validation(format!(
                "Program too large: {nodes} nodes, limit {MAX_PROGRAM_NODES}"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for func in &self.functions {
            if !seen.insert(func.name.as_str()) {
                return Err(EngineError::validation(format!(
                    "Duplicate function declaration: {}",
                    func.name
                )));
            }
        }
        Ok(())
    }

    /// Looks up the entry point.
    pub fn entry_point(&self) -> Option<&FunctionDecl> {
        self.functions.iter().find(|f| f.name == ENTRY_POINT)
    }

    /// Counts every statement and expression node in the program.
    pub fn node_count(&self) -> usize {
        self.functions
            .iter()
            .map(|f| 1 + count_stmts(&f.body))
            .sum()
    }
}

fn count_stmts(stmts: &[Stmt]) -> usize {
    stmts.iter().map(count_stmt).sum()
}

fn count_stmt(stmt: &Stmt) -> usize {
    1 + match stmt {
        Stmt::Let { init, .. } => init.as_ref().map_or(0, count_expr),
        Stmt::Expr { expr } => count_expr(expr),
        Stmt::Return { arg } => arg.as_ref().map_or(0, count_expr),
        Stmt::If { test, then, alt } => count_expr(test) + count_stmts(then) + count_stmts(alt),
        Stmt::Block { body } => count_stmts(body),
        Stmt::ForOf { iterable, body, .. } => count_expr(iterable) + count_stmts(body),
        Stmt::For {
            init,
            test,
            update,
            body,
        } => {
            init.as_deref().map_or(0, count_stmt)
                + test.as_ref().map_or(0, count_expr)
                + update.as_ref().map_or(0, count_expr)
                + count_stmts(body)
        }
        Stmt::While { test, body } | Stmt::DoWhile { test, body } => {
            count_expr(test) + count_stmts(body)
        }
        Stmt::Try {
            body,
            catch,
            finally,
            ..
        } => {
            count_stmts(body)
                + catch.as_deref().map_or(0, count_stmts)
                + count_stmts(finally)
        }
        Stmt::Throw { arg } => count_expr(arg),
        Stmt::Break | Stmt::Continue => 0,
    }
}

fn count_expr(expr: &Expr) -> usize {
    1 + match expr {
        Expr::Undefined
        | Expr::Null
        | Expr::Bool { .. }
        | Expr::Num { .. }
        | Expr::Str { .. }
        | Expr::BigInt { .. }
        | Expr::Ident { .. } => 0,
        Expr::Array { items } => items.iter().map(count_expr).sum(),
        Expr::Object { props } => props.iter().map(|(_, v)| count_expr(v)).sum(),
        Expr::Member { object, .. } => count_expr(object),
        Expr::Index { object, index } => count_expr(object) + count_expr(index),
        Expr::Unary { expr, .. } => count_expr(expr),
        Expr::Binary { left, right, .. }
        | Expr::Logical { left, right, .. }
        | Expr::Concat { left, right } => count_expr(left) + count_expr(right),
        Expr::Cond { test, then, alt } => count_expr(test) + count_expr(then) + count_expr(alt),
        Expr::Assign { target, value } => count_expr(target) + count_expr(value),
        Expr::Call { callee, args } | Expr::New { callee, args } => {
            count_expr(callee) + args.iter().map(count_expr).sum::<usize>()
        }
        Expr::Await { expr } => count_expr(expr),
        Expr::Function { body, .. } => count_stmts(body),
        Expr::Template { values, .. } => values.iter().map(count_expr).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_program() {
        let source = serde_json::json!({
            "functions": [{
                "name": "__ag_main",
                "body": [
                    { "kind": "return", "arg": { "kind": "num", "value": 42.0 } }
                ]
            }]
        })
        .to_string();
        let program = GuestProgram::parse(&source).unwrap();
        assert!(program.entry_point().is_some());
        assert_eq!(program.node_count(), 3);
    }

    #[test]
    fn test_malformed_source_is_a_validation_error() {
        let err = GuestProgram::parse("{ not json").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_unknown_node_kind_is_rejected() {
        let source = serde_json::json!({
            "functions": [{
                "name": "__ag_main",
                "body": [{ "kind": "rawLoop" }]
            }]
        })
        .to_string();
        let err = GuestProgram::parse(&source).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_duplicate_functions_are_rejected() {
        let source = serde_json::json!({
            "functions": [
                { "name": "helper", "body": [] },
                { "name": "helper", "body": [] }
            ]
        })
        .to_string();
        let err = GuestProgram::parse(&source).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_missing_entry_point_is_tolerated_at_parse_time() {
        // The orchestrator decides what a missing entry point means; an empty
        // program is legal here.
        let program = GuestProgram::parse("{\"functions\":[]}").unwrap();
        assert!(program.entry_point().is_none());
    }
}
