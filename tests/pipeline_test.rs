//! End-to-end tests: settings -> routing -> normalization -> execution.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use indexmap::IndexMap;
use serde_json::{json, Value};
use tempfile::TempDir;

use auditpipe::runtime::{
    ConfigError, Engine, ExecutionResult, Normalizer, OperationRegistry, ParameterContext,
    PipelineError, RouteSelector, Settings, TemplateStore, DEFAULT_NO_MATCH_HANDLER,
};
use auditpipe::serialization::RecordReader;
use auditpipe::{AuditRecord, EvaluatorRegistry};

type CallLog = Arc<Mutex<Vec<(String, ParameterContext)>>>;

const SETTINGS: &str = r#"
handlers:
  - name: sales
    rules:
      - { field: dept, kind: equals, value: sales }
    fields:
      - { source: props, converter: string_to_map }
    pipeline:
      executions: [lookupManager]
      collections:
        items:
          executions: [priceLookup]
"#;

fn record(id: i64, values: Value) -> AuditRecord {
    let values: IndexMap<String, Value> = serde_json::from_value(values).unwrap();
    AuditRecord::new(id, "alice", Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(), values)
}

/// Operations that log every call with the context they were given.
fn operations(log: &CallLog, keys: &[(&'static str, Value)]) -> OperationRegistry {
    let mut ops = OperationRegistry::new();
    for (key, result) in keys {
        let log = Arc::clone(log);
        let key = *key;
        let result = result.clone();
        ops.register(
            key,
            Box::new(move |params: &ParameterContext| -> Result<ExecutionResult, String> {
                log.lock().unwrap().push((key.to_string(), params.clone()));
                Ok(serde_json::from_value(result.clone()).unwrap())
            }),
        );
    }
    ops
}

fn engine(yaml: &str, ops: OperationRegistry) -> Engine<OperationRegistry> {
    let settings = Settings::from_yaml_str(yaml).unwrap();
    let registry = EvaluatorRegistry::with_builtins();
    let handlers = settings.handler_set(&registry).unwrap();
    Engine::new(RouteSelector::new(handlers, registry), Normalizer::default(), ops)
}

#[test]
fn test_scenario_single_execution() {
    let log = CallLog::default();
    let ops = operations(
        &log,
        &[
            ("lookupManager", json!({"name": "Bob"})),
            ("priceLookup", json!({})),
        ],
    );
    let engine = engine(SETTINGS, ops);

    let outcome = engine.handle(record(1, json!({"dept": "sales"}))).unwrap();

    assert_eq!(outcome.handler, "sales");
    assert_eq!(outcome.context.get("lookupManager.name"), Some(&json!("Bob")));
    assert_eq!(outcome.context.get("dept"), Some(&json!("sales")));
    assert_eq!(outcome.context.get("audit.id"), Some(&json!(1)));
    assert_eq!(outcome.context.get("audit.user"), Some(&json!("alice")));
    assert_eq!(outcome.context.get("audit.time"), Some(&json!("2024-03-01T12:00:00.000Z")));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn test_scenario_unmatched_record() {
    let log = CallLog::default();
    let ops = operations(
        &log,
        &[
            ("lookupManager", json!({"name": "Bob"})),
            ("priceLookup", json!({})),
        ],
    );
    let engine = engine(SETTINGS, ops);

    let outcome = engine.handle(record(2, json!({"dept": "ops"}))).unwrap();

    assert_eq!(outcome.handler, DEFAULT_NO_MATCH_HANDLER);
    assert_eq!(outcome.executions, 0);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_scenario_collection_fan_out() {
    let log = CallLog::default();
    let ops = operations(
        &log,
        &[("lookupManager", json!({"name": "Bob"})), ("priceLookup", json!({"price": 10}))],
    );
    let engine = engine(SETTINGS, ops);

    let outcome = engine
        .handle(record(3, json!({"dept": "sales", "items": [{"sku": "A"}, {"sku": "B"}]})))
        .unwrap();

    let calls = log.lock().unwrap().clone();
    let price_calls: Vec<&ParameterContext> = calls
        .iter()
        .filter(|(key, _)| key == "priceLookup")
        .map(|(_, ctx)| ctx)
        .collect();

    assert_eq!(price_calls.len(), 2);
    assert_eq!(price_calls[0].get("items.sku"), Some(&json!("A")));
    assert_eq!(price_calls[1].get("items.sku"), Some(&json!("B")));
    for ctx in &price_calls {
        assert_eq!(ctx.get("lookupManager.name"), Some(&json!("Bob")));
        assert_eq!(ctx.get("audit.id"), Some(&json!(3)));
    }

    let elements = &outcome.collections[0].contexts;
    assert_eq!(elements.len(), 2);
    assert_eq!(elements[0].get("priceLookup.price"), Some(&json!(10)));
    assert_eq!(elements[1].get("items.sku"), Some(&json!("B")));
    assert!(!outcome.context.contains("priceLookup.price"));
    assert_eq!(outcome.executions, 3);
}

#[test]
fn test_scenario_undefined_execution_key() {
    let log = CallLog::default();
    // no priceLookup operation registered
    let ops = operations(&log, &[("lookupManager", json!({"name": "Bob"}))]);
    let engine = engine(SETTINGS, ops);

    let err = engine.check().unwrap_err();
    assert!(matches!(err, ConfigError::UndefinedExecution { ref key, .. } if key == "priceLookup"));

    let err = engine
        .handle(record(4, json!({"dept": "sales", "items": [{"sku": "A"}]})))
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Config { source: ConfigError::UndefinedExecution { .. }, .. }
    ));
}

#[test]
fn test_normalized_fields_reach_the_chain() {
    let log = CallLog::default();
    let ops = operations(&log, &[("lookupManager", json!({})), ("priceLookup", json!({}))]);
    let engine = engine(SETTINGS, ops);

    let outcome = engine
        .handle(record(5, json!({"dept": "sales", "props": "{cm:name=q1.xlsx, size=1024}"})))
        .unwrap();

    assert_eq!(
        outcome.context.get("props"),
        Some(&json!({"cm:name": "q1.xlsx", "size": "1024"}))
    );
}

#[test]
fn test_duplicate_rule_sets_fail_startup() {
    let yaml = r#"
handlers:
  - name: first
    rules: [{ field: dept, value: sales }]
  - name: second
    rules: [{ field: dept, kind: equals, value: sales }]
"#;
    let settings = Settings::from_yaml_str(yaml).unwrap();

    let err = settings.handler_set(&EvaluatorRegistry::with_builtins()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn test_settings_and_templates_from_directory() {
    let temp_dir = TempDir::new().unwrap();
    let sql = temp_dir.path().join("sql");
    fs::create_dir(&sql).unwrap();
    fs::write(
        sql.join("lookupManager.sql"),
        "SELECT name FROM managers WHERE dept = :dept",
    )
    .unwrap();
    fs::write(
        temp_dir.path().join("auditpipe.yaml"),
        format!("templates: sql\n{}", SETTINGS),
    )
    .unwrap();

    let settings = Settings::load_from_file(temp_dir.path().join("auditpipe.yaml")).unwrap();
    let store = TemplateStore::load_from_dir(settings.templates.as_ref().unwrap()).unwrap();
    let handlers = settings.handler_set(&EvaluatorRegistry::with_builtins()).unwrap();

    let err = handlers.check_executions(|key| store.has_template(key)).unwrap_err();
    assert!(matches!(err, ConfigError::UndefinedExecution { ref key, .. } if key == "priceLookup"));

    fs::write(
        sql.join("priceLookup.sql"),
        "SELECT price FROM prices WHERE sku = :items.sku",
    )
    .unwrap();
    let store = TemplateStore::load_from_dir(sql).unwrap();
    assert!(handlers.check_executions(|key| store.has_template(key)).is_ok());
    assert_eq!(store.get("priceLookup").unwrap().query.parameters, vec!["items.sku"]);
}

#[test]
fn test_bundled_configuration_is_valid() {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config");
    let settings = Settings::load_from_file(root.join("auditpipe.yaml")).unwrap();
    let registry = EvaluatorRegistry::with_builtins();
    let handlers = settings.handler_set(&registry).unwrap();

    let store = TemplateStore::load_from_dir(settings.templates.as_ref().unwrap()).unwrap();
    handlers.check_executions(|key| store.has_template(key)).unwrap();
    Normalizer::default().check_handlers(&handlers).unwrap();

    let router = RouteSelector::new(handlers, registry);
    let input = fs::File::open(root.join("records.ndjson")).unwrap();
    let routed: Vec<String> = RecordReader::new(std::io::BufReader::new(input))
        .map(|record| router.select(&record.unwrap()).name.clone())
        .collect();

    assert_eq!(routed, vec!["sales-documents", "sales", DEFAULT_NO_MATCH_HANDLER]);
}
