//! Shared helpers for the integration suites: a small builder for
//! pre-transformed program JSON and a recording tool handler.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use std::sync::Arc;

use warden_engine::ToolHandler;

// --- program builders -------------------------------------------------------

pub fn program(functions: Vec<Json>) -> String {
    json!({ "functions": functions }).to_string()
}

pub fn main_fn(body: Vec<Json>) -> Json {
    json!({ "name": "__ag_main", "params": [], "body": body })
}

pub fn func(name: &str, params: Vec<&str>, body: Vec<Json>) -> Json {
    json!({ "name": name, "params": params, "body": body })
}

pub fn ret(arg: Json) -> Json {
    json!({ "kind": "return", "arg": arg })
}

pub fn let_(name: &str, init: Json) -> Json {
    json!({ "kind": "let", "name": name, "init": init })
}

pub fn expr_stmt(expr: Json) -> Json {
    json!({ "kind": "expr", "expr": expr })
}

pub fn while_(test: Json, body: Vec<Json>) -> Json {
    json!({ "kind": "while", "test": test, "body": body })
}

pub fn for_of(binding: &str, iterable: Json, body: Vec<Json>) -> Json {
    json!({ "kind": "forOf", "binding": binding, "iterable": iterable, "body": body })
}

pub fn try_catch(body: Vec<Json>, binding: &str, catch: Vec<Json>) -> Json {
    json!({
        "kind": "try",
        "body": body,
        "catch_binding": binding,
        "catch": catch,
    })
}

pub fn num(n: f64) -> Json {
    json!({ "kind": "num", "value": n })
}

pub fn str_(s: &str) -> Json {
    json!({ "kind": "str", "value": s })
}

pub fn ident(name: &str) -> Json {
    json!({ "kind": "ident", "name": name })
}

pub fn arr(items: Vec<Json>) -> Json {
    json!({ "kind": "array", "items": items })
}

pub fn obj(props: Vec<(&str, Json)>) -> Json {
    let props: Vec<Json> = props
        .into_iter()
        .map(|(k, v)| json!([k, v]))
        .collect();
    json!({ "kind": "object", "props": props })
}

pub fn member(object: Json, property: &str) -> Json {
    json!({ "kind": "member", "object": object, "property": property })
}

pub fn index(object: Json, idx: Json) -> Json {
    json!({ "kind": "index", "object": object, "index": idx })
}

pub fn call(callee: Json, args: Vec<Json>) -> Json {
    json!({ "kind": "call", "callee": callee, "args": args })
}

pub fn awaited(expr: Json) -> Json {
    json!({ "kind": "await", "expr": expr })
}

pub fn binary(op: &str, left: Json, right: Json) -> Json {
    json!({ "kind": "binary", "op": op, "left": left, "right": right })
}

pub fn assign(target: Json, value: Json) -> Json {
    json!({ "kind": "assign", "target": target, "value": value })
}

pub fn concat(left: Json, right: Json) -> Json {
    json!({ "kind": "concat", "left": left, "right": right })
}

pub fn template(quasis: Vec<&str>, values: Vec<Json>) -> Json {
    json!({ "kind": "template", "quasis": quasis, "values": values })
}

pub fn function_expr(params: Vec<&str>, body: Vec<Json>) -> Json {
    json!({ "kind": "function", "params": params, "body": body })
}

/// `await callTool(name, args)`, the transformer's tool-call form.
pub fn call_tool(name: &str, args: Json) -> Json {
    awaited(call(ident("callTool"), vec![str_(name), args]))
}

// --- recording tool handler -------------------------------------------------

/// Records every invocation and answers from a fixed routing function.
pub struct RecordingHandler {
    pub calls: Mutex<Vec<(String, Json)>>,
    respond: Box<dyn Fn(&str, &Json) -> anyhow::Result<Json> + Send + Sync>,
}

impl RecordingHandler {
    pub fn new(
        respond: impl Fn(&str, &Json) -> anyhow::Result<Json> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn called_names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(n, _)| n.clone()).collect()
    }
}

#[async_trait]
impl ToolHandler for RecordingHandler {
    async fn call(&self, name: &str, args: Json) -> anyhow::Result<Json> {
        self.calls.lock().push((name.to_string(), args.clone()));
        (self.respond)(name, &args)
    }
}
