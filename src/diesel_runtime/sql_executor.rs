//! SQL template executor over the diesel connection pool.
//!
//! Each template runs as a single statement with every parameter bound as
//! nullable text. Templates cast parameters compared against non-text
//! columns explicitly (`id = :audit.id::bigint`). Row-returning
//! statements are wrapped so the row comes back as one JSON document, which
//! keeps the executor independent of the template's column types.

use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::sql_types::{Nullable, Text};
use serde_json::{Map, Value};

use crate::diesel_runtime::database::Database;
use crate::runtime::context::{ExecutionResult, ParameterContext};
use crate::runtime::executor::{
    strip_literals_and_comments, ExecutionError, Template, TemplateExecutor, TemplateStore,
};

/// Verbs that start the main statement after a `WITH` clause.
const STATEMENT_VERBS: &[&str] = &[
    "select", "values", "table", "insert", "update", "delete", "merge",
];

#[derive(Debug, QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Text)]
    row_json: String,
}

/// Runs `*.sql` templates against PostgreSQL.
pub struct SqlTemplateExecutor {
    database: Database,
    templates: TemplateStore,
}

impl SqlTemplateExecutor {
    pub fn new(database: Database, templates: TemplateStore) -> Self {
        Self {
            database,
            templates,
        }
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    fn template(&self, key: &str) -> Result<&Template, ExecutionError> {
        self.templates
            .get(key)
            .ok_or_else(|| ExecutionError::UndefinedTemplate(key.to_string()))
    }
}

impl TemplateExecutor for SqlTemplateExecutor {
    fn has_template(&self, key: &str) -> bool {
        self.templates.has_template(key)
    }

    fn execute(
        &self,
        key: &str,
        params: &ParameterContext,
    ) -> Result<ExecutionResult, ExecutionError> {
        let template = self.template(key)?;
        let binds = template.query.bind_values(key, params)?;
        let failed = |reason: String| ExecutionError::Failed {
            template: key.to_string(),
            reason,
        };

        let mut conn = self
            .database
            .get_connection()
            .map_err(|e| failed(e.to_string()))?;

        let statement = template.query.sql.trim().trim_end_matches(';');
        let has_rows = returns_rows(statement);
        let sql = if has_rows {
            single_row_sql(statement)
        } else {
            statement.to_string()
        };

        let mut query = diesel::sql_query(sql).into_boxed::<Pg>();
        for value in binds {
            query = query.bind::<Nullable<Text>, _>(value);
        }

        if !has_rows {
            let affected = query.execute(&mut conn).map_err(|e| failed(e.to_string()))?;
            tracing::trace!("template '{}' affected {} rows", key, affected);
            return Ok(ExecutionResult::new());
        }

        let rows: Vec<JsonRow> = query.load(&mut conn).map_err(|e| failed(e.to_string()))?;
        match rows.as_slice() {
            [] => Ok(ExecutionResult::new()),
            [row] => parse_row(key, &row.row_json),
            _ => Err(ExecutionError::MultipleRows {
                template: key.to_string(),
            }),
        }
    }
}

/// Whether `statement` produces rows: queries, and DML with a top-level
/// `RETURNING`. Literals and comments are ignored.
pub fn returns_rows(statement: &str) -> bool {
    let code = strip_literals_and_comments(statement).to_ascii_lowercase();
    let words = top_level_words(&code);

    let verb = match words.first() {
        Some(&"with") => words[1..]
            .iter()
            .find(|word| STATEMENT_VERBS.iter().any(|verb| verb == *word))
            .copied(),
        first => first.copied(),
    };

    matches!(verb, Some("select" | "values" | "table"))
        || words.iter().any(|word| *word == "returning")
}

/// Words outside any parentheses, in order.
fn top_level_words(code: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut depth = 0usize;
    let mut start = None;

    for (i, c) in code.char_indices() {
        if c.is_alphanumeric() || c == '_' {
            if start.is_none() {
                start = Some(i);
            }
            continue;
        }
        if let Some(from) = start.take() {
            if depth == 0 {
                words.push(&code[from..i]);
            }
        }
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if let (Some(from), 0) = (start, depth) {
        words.push(&code[from..]);
    }

    words
}

/// Wrap a row-returning statement so at most two rows come back, each as a
/// JSON object keyed by column name. The statement sits on its own lines so a
/// trailing `--` comment cannot swallow the closing parenthesis.
pub fn single_row_sql(statement: &str) -> String {
    format!(
        "WITH t AS (\n{}\n) SELECT row_to_json(t)::text AS row_json FROM t LIMIT 2",
        statement
    )
}

fn parse_row(key: &str, text: &str) -> Result<ExecutionResult, ExecutionError> {
    let invalid = |reason: String| ExecutionError::InvalidRow {
        template: key.to_string(),
        reason,
    };

    match serde_json::from_str::<Value>(text).map_err(|e| invalid(e.to_string()))? {
        Value::Object(columns) => Ok(into_result(columns)),
        other => Err(invalid(format!("expected a JSON object, got {}", other))),
    }
}

fn into_result(columns: Map<String, Value>) -> ExecutionResult {
    columns.into_iter().collect()
}
