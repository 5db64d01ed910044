use relaycore::{ExecutionContext, Guard, GuardError, Value};
use serde_json::json;
use std::collections::HashMap;

fn ctx() -> ExecutionContext {
    let mut globals = HashMap::new();
    globals.insert(
        "trigger".to_string(),
        Value::from(json!({"text": "hello", "priority": 3, "vip": true})),
    );
    let mut ctx = ExecutionContext::new(globals);
    let mut classify = HashMap::new();
    classify.insert("intent".to_string(), Value::from(json!("complaint")));
    classify.insert("confidence".to_string(), Value::Number(0.92));
    classify.insert("resolved".to_string(), Value::Bool(false));
    ctx.merge_output("classify", classify);
    ctx
}

fn eval(src: &str) -> bool {
    Guard::parse(src).unwrap().eval(&ctx())
}

#[test]
fn string_equality_sees_through_json_wrapper() {
    assert!(eval("classify.intent == \"complaint\""));
    assert!(!eval("classify.intent == \"praise\""));
    assert!(eval("classify.intent != \"praise\""));
}

#[test]
fn numeric_comparisons() {
    assert!(eval("trigger.priority >= 3"));
    assert!(eval("trigger.priority < 10"));
    assert!(!eval("classify.confidence > 0.95"));
    assert!(eval("classify.confidence > 0.9"));
}

#[test]
fn bool_and_null_literals() {
    assert!(eval("trigger.vip == true"));
    assert!(eval("classify.resolved == false"));
    assert!(!eval("classify.intent == null"));
}

#[test]
fn bare_path_is_truthiness() {
    assert!(eval("trigger.vip"));
    assert!(!eval("classify.resolved"));
    assert!(eval("trigger.text"));
}

#[test]
fn exists_checks_presence_not_truth() {
    assert!(eval("exists(classify.resolved)"));
    assert!(!eval("exists(classify.sentiment)"));
}

#[test]
fn missing_path_fails_every_comparison() {
    assert!(!eval("classify.sentiment == \"angry\""));
    // Ne on a missing path is false too: comparisons need a value.
    assert!(!eval("classify.sentiment != \"angry\""));
    assert!(!eval("classify.sentiment"));
}

#[test]
fn conjunction_requires_all_clauses() {
    assert!(eval(
        "classify.intent == \"complaint\" && trigger.priority >= 3"
    ));
    assert!(!eval(
        "classify.intent == \"complaint\" && trigger.priority >= 5"
    ));
}

#[test]
fn parse_rejects_empty_expression() {
    assert_eq!(Guard::parse(""), Err(GuardError::Empty));
    assert_eq!(Guard::parse("a && "), Err(GuardError::Empty));
}

#[test]
fn parse_rejects_missing_literal() {
    assert!(matches!(
        Guard::parse("classify.intent =="),
        Err(GuardError::BadLiteral(_))
    ));
    assert!(matches!(
        Guard::parse("classify.intent == complaint"),
        Err(GuardError::BadLiteral(_))
    ));
}

#[test]
fn parse_rejects_bad_paths() {
    assert!(matches!(
        Guard::parse("== \"x\""),
        Err(GuardError::BadPath(_))
    ));
    assert!(matches!(
        Guard::parse("two words"),
        Err(GuardError::BadPath(_))
    ));
    assert!(matches!(
        Guard::parse("a..b == 1"),
        Err(GuardError::BadPath(_))
    ));
}

#[test]
fn operator_sequence_inside_string_literal_is_just_text() {
    let mut globals = HashMap::new();
    globals.insert("status".to_string(), Value::from("a==b"));
    let ctx = ExecutionContext::new(globals);

    let eq = Guard::parse("status == \"a==b\"").unwrap();
    assert!(eq.eval(&ctx));
    let ne = Guard::parse("status != \"a==b\"").unwrap();
    assert!(!ne.eval(&ctx));
}

#[test]
fn globals_shadow_namespaces() {
    let mut globals = HashMap::new();
    globals.insert("status".to_string(), Value::from(json!({"code": "open"})));
    let mut ctx = ExecutionContext::new(globals);
    let mut ns = HashMap::new();
    ns.insert("code".to_string(), Value::from("closed"));
    ctx.merge_output("status", ns);

    let guard = Guard::parse("status.code == \"open\"").unwrap();
    assert!(guard.eval(&ctx));
}
