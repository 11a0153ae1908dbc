//! End-to-end executions through the gatekeeper: the happy path, the policy
//! trips, the resource bombs and the escape attempts.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;

use warden_engine::{
    ExecutionConfig, Gatekeeper, HostContext, MemorySidecar, ParentValidationConfig,
    SecurityLevel,
};

fn ctx_with(handler: Arc<RecordingHandler>, config: ExecutionConfig) -> HostContext {
    let mut ctx = HostContext::new(handler);
    ctx.config = config;
    ctx
}

fn echo_handler() -> Arc<RecordingHandler> {
    RecordingHandler::new(|_, args| Ok(args.clone()))
}

#[tokio::test]
async fn happy_path_tool_call() {
    let handler = RecordingHandler::new(|name, args| match name {
        "add" => {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(json!(a + b))
        }
        _ => anyhow::bail!("unknown tool"),
    });
    let source = program(vec![main_fn(vec![
        let_(
            "s",
            call_tool("add", obj(vec![("a", num(5.0)), ("b", num(3.0))])),
        ),
        ret(ident("s")),
    ])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler.clone(), ExecutionConfig::default()))
        .await;

    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.value, Some(json!(8.0)));
    assert_eq!(result.stats.tool_call_count, 1);
    assert_eq!(handler.call_count(), 1);
}

#[tokio::test]
async fn rate_limit_trips_and_host_sees_at_most_six() {
    let handler = echo_handler();
    let config = ExecutionConfig {
        double_vm: warden_engine::DoubleVmConfig {
            parent_validation: ParentValidationConfig {
                max_operations_per_second: 5,
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let source = program(vec![main_fn(vec![
        let_("i", num(0.0)),
        while_(
            binary("lt", ident("i"), num(20.0)),
            vec![
                expr_stmt(call_tool("api:ping", obj(vec![]))),
                expr_stmt(assign(ident("i"), binary("add", ident("i"), num(1.0)))),
            ],
        ),
        ret(str_("done")),
    ])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler.clone(), config))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some("RATE_LIMIT_EXCEEDED"));
    assert!(handler.call_count() <= 6, "host saw {}", handler.call_count());
}

#[tokio::test]
async fn exfil_sequence_is_detected_before_the_send() {
    let handler = RecordingHandler::new(|name, _| match name {
        "db:listUsers" => Ok(json!([{ "id": 1, "email": "a" }])),
        _ => Ok(json!("sent")),
    });
    let source = program(vec![main_fn(vec![
        let_("xs", call_tool("db:listUsers", obj(vec![]))),
        expr_stmt(call_tool(
            "http:post",
            obj(vec![("url", str_("x")), ("body", ident("xs"))]),
        )),
        ret(str_("done")),
    ])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler.clone(), ExecutionConfig::default()))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some("SUSPICIOUS_PATTERN_DETECTED"));
    let data = result.error.as_ref().unwrap().data.as_ref().unwrap();
    assert_eq!(data["id"], "EXFIL_LIST_SEND");
    assert_eq!(handler.called_names(), ["db:listUsers"]);
}

#[tokio::test]
async fn memory_bomb_is_refused_before_allocation() {
    let handler = echo_handler();
    let config = ExecutionConfig {
        memory_limit_bytes: 10 * 1024 * 1024,
        ..Default::default()
    };
    let source = program(vec![main_fn(vec![ret(call(
        member(str_("x"), "repeat"),
        vec![num(52_428_800.0)],
    ))])]);

    let result = Gatekeeper::new().execute(&source, ctx_with(handler, config)).await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some("MEMORY_LIMIT_EXCEEDED"));
    // The refused allocation never became visible to the accountant.
    assert!(result.stats.memory_usage.peak_tracked_bytes <= 10 * 1024 * 1024);
}

#[tokio::test]
async fn blocked_property_escape_is_a_security_violation() {
    let handler = RecordingHandler::new(|_, _| Ok(json!({ "value": 1 })));
    let source = program(vec![main_fn(vec![
        let_("r", call_tool("data:get", obj(vec![]))),
        let_("p", concat(str_("const"), str_("ructor"))),
        ret(index(ident("r"), ident("p"))),
    ])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler, ExecutionConfig::default()))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some("SECURITY_VIOLATION"));
}

#[tokio::test]
async fn reference_concat_is_gated_and_next_call_never_happens() {
    let big = "z".repeat(1024 * 1024);
    let handler = RecordingHandler::new(move |name, _| match name {
        "data:fetch" => Ok(json!(big.clone())),
        _ => Ok(json!(null)),
    });
    let mut ctx = ctx_with(handler.clone(), ExecutionConfig::default());
    ctx.sidecar = Some(MemorySidecar::new());

    let source = program(vec![main_fn(vec![
        let_("ref", call_tool("data:fetch", obj(vec![]))),
        expr_stmt(call_tool(
            "next",
            obj(vec![("payload", concat(ident("ref"), str_("-suffix")))]),
        )),
        ret(str_("done")),
    ])]);

    let result = Gatekeeper::new().execute(&source, ctx).await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some("COMPOSITE_DISALLOWED"));
    assert_eq!(handler.called_names(), ["data:fetch"]);
}

#[tokio::test]
async fn composites_pass_when_enabled() {
    let big = "z".repeat(1024 * 1024);
    let handler = RecordingHandler::new(move |name, args| match name {
        "data:fetch" => Ok(json!(big.clone())),
        _ => Ok(json!(args["payload"].as_str().map(|s| s.len()))),
    });
    let mut config = ExecutionConfig::default();
    config.tool_bridge.allow_composites = true;
    let mut ctx = ctx_with(handler.clone(), config);
    ctx.sidecar = Some(MemorySidecar::new());

    let source = program(vec![main_fn(vec![
        let_("ref", call_tool("data:fetch", obj(vec![]))),
        ret(call_tool(
            "next",
            obj(vec![("payload", concat(ident("ref"), str_("-suffix")))]),
        )),
    ])]);

    let result = Gatekeeper::new().execute(&source, ctx).await;

    assert!(result.success, "expected success, got {:?}", result.error);
    // The host saw the resolved composite: the full payload plus suffix.
    assert_eq!(result.value, Some(json!(1_048_583.0)));
}

#[tokio::test]
async fn zero_tool_call_budget_fails_the_first_call() {
    let handler = echo_handler();
    let config = ExecutionConfig {
        max_tool_calls: 0,
        ..Default::default()
    };
    let source = program(vec![main_fn(vec![ret(call_tool("db:get", obj(vec![])))])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler.clone(), config))
        .await;

    assert_eq!(result.error_code(), Some("TOOL_CALL_LIMIT_EXCEEDED"));
    assert_eq!(result.stats.tool_call_count, 0);
    assert_eq!(handler.call_count(), 0);
}

#[tokio::test]
async fn zero_iteration_budget_fails_the_first_iteration() {
    let handler = echo_handler();
    let config = ExecutionConfig {
        max_iterations: 0,
        ..Default::default()
    };
    let source = program(vec![main_fn(vec![
        for_of("x", arr(vec![num(1.0)]), vec![]),
        ret(str_("done")),
    ])]);

    let result = Gatekeeper::new().execute(&source, ctx_with(handler, config)).await;

    assert_eq!(result.error_code(), Some("ITERATION_LIMIT_EXCEEDED"));
    assert_eq!(result.stats.iteration_count, 0);
}

#[tokio::test]
async fn iteration_limit_respects_stats_bound() {
    let handler = echo_handler();
    let config = ExecutionConfig {
        max_iterations: 10,
        ..Default::default()
    };
    let source = program(vec![main_fn(vec![
        while_(json!({ "kind": "bool", "value": true }), vec![]),
        ret(str_("unreachable")),
    ])]);

    let result = Gatekeeper::new().execute(&source, ctx_with(handler, config)).await;

    assert_eq!(result.error_code(), Some("ITERATION_LIMIT_EXCEEDED"));
    assert!(result.stats.iteration_count <= 10);
}

#[tokio::test]
async fn sanitize_depth_boundary_is_exact() {
    let handler = echo_handler();
    // Depth counts compound nesting; build exactly max_sanitize_depth levels.
    let depth = 5u32;
    let config = ExecutionConfig {
        max_sanitize_depth: depth,
        ..Default::default()
    };

    let nested = |levels: u32| {
        let mut expr = num(1.0);
        for _ in 0..levels {
            expr = obj(vec![("inner", expr)]);
        }
        expr
    };

    let ok_source = program(vec![main_fn(vec![ret(nested(depth))])]);
    let result = Gatekeeper::new()
        .execute(&ok_source, ctx_with(handler.clone(), config.clone()))
        .await;
    assert!(result.success, "depth {depth} must pass: {:?}", result.error);

    let over_source = program(vec![main_fn(vec![ret(nested(depth + 1))])]);
    let result = Gatekeeper::new()
        .execute(&over_source, ctx_with(handler, config))
        .await;
    assert_eq!(result.error_code(), Some("SANITIZE_DEPTH_EXCEEDED"));
}

#[tokio::test]
async fn blacklist_wins_over_whitelist() {
    let handler = echo_handler();
    let config = ExecutionConfig {
        double_vm: warden_engine::DoubleVmConfig {
            parent_validation: ParentValidationConfig {
                allowed_pattern: Some("^db:".into()),
                blocked_patterns: vec!["drop".into()],
                block_suspicious_sequences: false,
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let source = program(vec![main_fn(vec![ret(call_tool(
        "db:dropTable",
        obj(vec![]),
    ))])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler.clone(), config))
        .await;

    assert_eq!(result.error_code(), Some("OPERATION_BLOCKED"));
    assert_eq!(handler.call_count(), 0);
}

#[tokio::test]
async fn timeout_fires_on_busy_loops() {
    let handler = echo_handler();
    let config = ExecutionConfig {
        timeout_ms: 200,
        max_iterations: u64::MAX,
        ..Default::default()
    };
    let source = program(vec![main_fn(vec![
        while_(json!({ "kind": "bool", "value": true }), vec![]),
        ret(str_("unreachable")),
    ])]);

    let result = Gatekeeper::new().execute(&source, ctx_with(handler, config)).await;

    assert_eq!(result.error_code(), Some("TIMEOUT_EXCEEDED"));
}

#[tokio::test]
async fn timeout_is_not_catchable_by_the_guest() {
    let handler = echo_handler();
    let config = ExecutionConfig {
        timeout_ms: 200,
        max_iterations: u64::MAX,
        ..Default::default()
    };
    let source = program(vec![main_fn(vec![
        try_catch(
            vec![while_(json!({ "kind": "bool", "value": true }), vec![])],
            "e",
            vec![ret(str_("swallowed"))],
        ),
        ret(str_("after")),
    ])]);

    let result = Gatekeeper::new().execute(&source, ctx_with(handler, config)).await;

    assert_eq!(result.error_code(), Some("TIMEOUT_EXCEEDED"));
}

#[tokio::test]
async fn abort_stops_the_next_poll_point() {
    let handler = echo_handler();
    let mut ctx = ctx_with(handler, ExecutionConfig::default());
    ctx.abort.set();
    let source = program(vec![main_fn(vec![ret(call_tool("db:get", obj(vec![])))])]);

    let result = Gatekeeper::new().execute(&source, ctx).await;

    assert_eq!(result.error_code(), Some("EXECUTION_ABORTED"));
}

#[tokio::test]
async fn strict_mode_escalates_caught_violations() {
    let handler = RecordingHandler::new(|_, _| Ok(json!({ "value": 1 })));
    let config = ExecutionConfig {
        security_level: SecurityLevel::Strict,
        ..Default::default()
    };
    // The guest catches the sealed error and pretends everything is fine.
    let source = program(vec![main_fn(vec![
        let_("r", call_tool("data:get", obj(vec![]))),
        try_catch(
            vec![ret(member(ident("r"), "constructor"))],
            "e",
            vec![],
        ),
        ret(str_("all good")),
    ])]);

    let result = Gatekeeper::new().execute(&source, ctx_with(handler, config)).await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some("SECURITY_VIOLATION"));
}

#[tokio::test]
async fn strict_mode_records_code_generation_attempts() {
    let handler = echo_handler();
    let config = ExecutionConfig {
        security_level: SecurityLevel::Strict,
        ..Default::default()
    };
    let source = program(vec![main_fn(vec![
        try_catch(
            vec![expr_stmt(call(ident("eval"), vec![str_("1+1")]))],
            "e",
            vec![],
        ),
        ret(str_("caught it")),
    ])]);

    let result = Gatekeeper::new().execute(&source, ctx_with(handler, config)).await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some("SECURITY_VIOLATION"));
    let data = result.error.as_ref().unwrap().data.as_ref().unwrap();
    assert_eq!(data["kind"], "CODE_GENERATION");
}

#[tokio::test]
async fn standard_mode_lets_guests_catch_sealed_errors() {
    let handler = RecordingHandler::new(|_, _| Ok(json!({ "value": 1 })));
    // STANDARD records the violation but does not escalate a caught one.
    let source = program(vec![main_fn(vec![
        let_("r", call_tool("data:get", obj(vec![]))),
        try_catch(
            vec![ret(member(ident("r"), "constructor"))],
            "e",
            vec![ret(member(ident("e"), "name"))],
        ),
    ])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler, ExecutionConfig::default()))
        .await;

    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.value, Some(json!("SecurityViolationError")));
}

#[tokio::test]
async fn console_is_captured_and_capped() {
    let handler = echo_handler();
    let source = program(vec![main_fn(vec![
        expr_stmt(call(member(ident("console"), "log"), vec![str_("hello")])),
        expr_stmt(call(member(ident("console"), "warn"), vec![num(42.0)])),
        ret(str_("done")),
    ])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler.clone(), ExecutionConfig::default()))
        .await;
    assert!(result.success);
    assert_eq!(result.console.len(), 2);
    assert_eq!(result.console[0].message, "hello");
    assert_eq!(result.console[1].message, "42");

    let config = ExecutionConfig {
        max_console_calls: 1,
        ..Default::default()
    };
    let source = program(vec![main_fn(vec![
        expr_stmt(call(member(ident("console"), "log"), vec![str_("one")])),
        expr_stmt(call(member(ident("console"), "log"), vec![str_("two")])),
        ret(str_("done")),
    ])]);
    let result = Gatekeeper::new().execute(&source, ctx_with(handler, config)).await;
    assert_eq!(result.error_code(), Some("CONSOLE_LIMIT_EXCEEDED"));
}

#[tokio::test]
async fn parallel_preserves_order_and_bounds_fanout() {
    let handler = echo_handler();
    let source = program(vec![main_fn(vec![ret(awaited(call(
        ident("parallel"),
        vec![
            arr(vec![num(1.0), num(2.0), num(3.0)]),
            function_expr(vec!["x"], vec![ret(binary("mul", ident("x"), num(2.0)))]),
        ],
    )))])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler.clone(), ExecutionConfig::default()))
        .await;
    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.value, Some(json!([2.0, 4.0, 6.0])));

    // 101 items is over the fan-out cap.
    let items: Vec<serde_json::Value> = (0..101).map(|i| num(i as f64)).collect();
    let source = program(vec![main_fn(vec![ret(awaited(call(
        ident("parallel"),
        vec![
            arr(items),
            function_expr(vec!["x"], vec![ret(ident("x"))]),
        ],
    )))])]);
    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler, ExecutionConfig::default()))
        .await;
    assert_eq!(result.error_code(), Some("BAD_ARGUMENTS"));
}

#[tokio::test]
async fn guest_loops_and_templates_compose() {
    let handler = echo_handler();
    let source = program(vec![
        func(
            "label",
            vec!["n"],
            vec![ret(template(vec!["item-", ""], vec![ident("n")]))],
        ),
        main_fn(vec![
            let_("out", arr(vec![])),
            for_of(
                "n",
                arr(vec![num(1.0), num(2.0)]),
                vec![expr_stmt(call(
                    member(ident("out"), "push"),
                    vec![call(ident("label"), vec![ident("n")])],
                ))],
            ),
            ret(call(member(ident("out"), "join"), vec![str_(",")])),
        ]),
    ]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler, ExecutionConfig::default()))
        .await;
    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.value, Some(json!("item-1,item-2")));
    assert_eq!(result.stats.iteration_count, 2);
}

#[tokio::test]
async fn single_realm_mode_skips_parent_validation() {
    let handler = echo_handler();
    let mut config = ExecutionConfig::default();
    config.double_vm.enabled = false;
    // A name the blacklist would reject in double-realm mode.
    config.double_vm.parent_validation.blocked_patterns = vec!["^admin:".into()];

    let source = program(vec![main_fn(vec![ret(call_tool(
        "admin:anything",
        obj(vec![]),
    ))])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler.clone(), config))
        .await;
    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(handler.call_count(), 1);
}

#[tokio::test]
async fn tool_handler_failures_surface_with_redacted_messages() {
    let handler =
        RecordingHandler::new(|_, _| anyhow::bail!("open /home/svc/creds.txt failed"));
    let source = program(vec![main_fn(vec![ret(call_tool("fs:read", obj(vec![])))])]);

    let result = Gatekeeper::new()
        .execute(&source, ctx_with(handler, ExecutionConfig::default()))
        .await;

    assert_eq!(result.error_code(), Some("TOOL_INVOCATION_FAILED"));
    let message = &result.error.as_ref().unwrap().message;
    assert!(message.contains("[REDACTED]"), "message was: {message}");
    assert!(!message.contains("/home/svc"));
}

#[tokio::test]
async fn final_value_serialization_cap_applies() {
    let handler = echo_handler();
    let config = ExecutionConfig {
        memory_limit_bytes: 64 * 1024,
        ..Default::default()
    };
    // Stay under the accountant (few allocations) but over the serialized
    // cap by aliasing one tracked string many times.
    let source = program(vec![main_fn(vec![
        let_(
            "chunk",
            call(member(str_("x"), "repeat"), vec![num(16_000.0)]),
        ),
        let_("out", arr(vec![])),
        for_of(
            "i",
            arr(vec![num(1.0), num(2.0), num(3.0), num(4.0), num(5.0)]),
            vec![expr_stmt(call(
                member(ident("out"), "push"),
                vec![ident("chunk")],
            ))],
        ),
        ret(ident("out")),
    ])]);

    let result = Gatekeeper::new().execute(&source, ctx_with(handler, config)).await;

    // Five aliases of one 16k-unit string: the accountant tracked it once,
    // but the serialized form counts every reference.
    assert_eq!(result.error_code(), Some("SERIALIZATION_LIMIT_EXCEEDED"));
}
