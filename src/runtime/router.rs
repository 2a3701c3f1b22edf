//! Route selection: pick the first handler whose rules all match a record.

use crate::evaluator::EvaluatorRegistry;
use crate::record::AuditRecord;
use crate::runtime::config_loader::{HandlerConfig, HandlerSet, MatchRule};

/// First-match-wins selector over a validated [`HandlerSet`].
#[derive(Debug)]
pub struct RouteSelector {
    handlers: HandlerSet,
    evaluators: EvaluatorRegistry,
}

impl RouteSelector {
    pub fn new(handlers: HandlerSet, evaluators: EvaluatorRegistry) -> Self {
        Self {
            handlers,
            evaluators,
        }
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    pub fn evaluators(&self) -> &EvaluatorRegistry {
        &self.evaluators
    }

    /// Select the handler for `record`.
    ///
    /// Handlers are tried in declaration order; the first one whose rules all
    /// hold wins. Records matching no handler get the fallback handler.
    pub fn select(&self, record: &AuditRecord) -> &HandlerConfig {
        match self
            .handlers
            .handlers()
            .iter()
            .find(|handler| self.matches(handler, record))
        {
            Some(handler) => {
                tracing::debug!("record {} routed to '{}'", record.id(), handler.name);
                handler
            }
            None => {
                let fallback = self.handlers.fallback();
                tracing::debug!(
                    "record {} matched no handler, routed to '{}'",
                    record.id(),
                    fallback.name
                );
                fallback
            }
        }
    }

    /// Whether every rule of `handler` holds for `record`.
    pub fn matches(&self, handler: &HandlerConfig, record: &AuditRecord) -> bool {
        handler.rules.iter().all(|rule| self.rule_holds(rule, record))
    }

    fn rule_holds(&self, rule: &MatchRule, record: &AuditRecord) -> bool {
        // A rule on a field the record does not carry never matches.
        let Some(actual) = record.field(&rule.field) else {
            return false;
        };
        self.evaluators
            .lookup(rule.kind.as_deref())
            .matches(&actual, &rule.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config_loader::{Pipeline, DEFAULT_NO_MATCH_HANDLER};
    use chrono::Utc;
    use indexmap::IndexMap;
    use serde_json::{json, Value};

    fn record(values: Value) -> AuditRecord {
        let values: IndexMap<String, Value> = serde_json::from_value(values).unwrap();
        AuditRecord::new(1, "alice", Utc::now(), values)
    }

    fn handler(name: &str, rules: Vec<MatchRule>) -> HandlerConfig {
        HandlerConfig::new(name, rules, Pipeline::default())
    }

    fn selector(handlers: Vec<HandlerConfig>) -> RouteSelector {
        let registry = EvaluatorRegistry::with_builtins();
        let set = HandlerSet::new(handlers, DEFAULT_NO_MATCH_HANDLER, &registry).unwrap();
        RouteSelector::new(set, registry)
    }

    #[test]
    fn test_first_match_wins() {
        let selector = selector(vec![
            handler(
                "sales-docs",
                vec![
                    MatchRule::new("dept", None, "sales"),
                    MatchRule::new("path", Some("contains"), "/documents"),
                ],
            ),
            handler("sales", vec![MatchRule::new("dept", None, "sales")]),
            handler("docs", vec![MatchRule::new("path", Some("contains"), "/documents")]),
        ]);

        let docs = record(json!({"dept": "sales", "path": "/site/documents/a.txt"}));
        assert_eq!(selector.select(&docs).name, "sales-docs");

        let plain = record(json!({"dept": "sales", "path": "/site/wiki"}));
        assert_eq!(selector.select(&plain).name, "sales");

        let ops_docs = record(json!({"dept": "ops", "path": "/documents"}));
        assert_eq!(selector.select(&ops_docs).name, "docs");
    }

    #[test]
    fn test_unmatched_goes_to_fallback() {
        let selector = selector(vec![handler(
            "sales",
            vec![MatchRule::new("dept", None, "sales")],
        )]);

        let selected = selector.select(&record(json!({"dept": "ops"})));

        assert_eq!(selected.name, DEFAULT_NO_MATCH_HANDLER);
        assert!(selected.pipeline.is_empty());
    }

    #[test]
    fn test_missing_field_never_matches() {
        let selector = selector(vec![handler(
            "nulls",
            vec![MatchRule::new("dept", Some("contains"), "")],
        )]);

        assert_eq!(selector.select(&record(json!({}))).name, DEFAULT_NO_MATCH_HANDLER);
        assert_eq!(selector.select(&record(json!({"dept": "x"}))).name, "nulls");
    }

    #[test]
    fn test_audit_attributes_and_nested_fields() {
        let selector = selector(vec![
            handler("alice", vec![MatchRule::new("audit.user", None, "alice")]),
            handler("nested", vec![MatchRule::new("props.site", None, "hr")]),
        ]);

        assert_eq!(selector.select(&record(json!({}))).name, "alice");

        let bob = AuditRecord::new(
            2,
            "bob",
            Utc::now(),
            serde_json::from_value(json!({"props": {"site": "hr"}})).unwrap(),
        );
        assert_eq!(selector.select(&bob).name, "nested");
    }

    #[test]
    fn test_order_of_non_matching_handlers_is_irrelevant() {
        let target = handler("target", vec![MatchRule::new("dept", None, "sales")]);
        let misses = vec![
            handler("ops", vec![MatchRule::new("dept", None, "ops")]),
            handler("hr", vec![MatchRule::new("dept", None, "hr")]),
            handler("wiki", vec![MatchRule::new("path", Some("contains"), "/wiki")]),
        ];
        let rec = record(json!({"dept": "sales", "path": "/docs"}));

        let orders: Vec<Vec<usize>> = vec![vec![0, 1, 2], vec![2, 1, 0], vec![1, 2, 0]];
        for order in orders {
            for insert_at in 0..=misses.len() {
                let mut handlers: Vec<HandlerConfig> =
                    order.iter().map(|&i| misses[i].clone()).collect();
                handlers.insert(insert_at, target.clone());

                assert_eq!(selector(handlers).select(&rec).name, "target");
            }
        }
    }

    #[test]
    fn test_unknown_kind_uses_default_evaluator() {
        let selector = selector(vec![handler(
            "h",
            vec![MatchRule::new("dept", Some("regex"), "sa.*")],
        )]);

        let sales = record(json!({"dept": "sales"}));
        assert_eq!(selector.select(&sales).name, DEFAULT_NO_MATCH_HANDLER);
        assert_eq!(selector.select(&record(json!({"dept": "sa.*"}))).name, "h");
    }
}
