//! Last line of defense between untrusted model output and the store.
//!
//! The policy is a grammar-constrained walk over the `sqlparser` AST rather
//! than textual pattern matching: anything not expressible as a single
//! read-only SELECT over whitelisted tables is rejected.

use crate::db::introspect::{SchemaMetadata, TableDescriptor};
use sqlparser::ast::{
    Expr, Query, Select, SelectItem, SetExpr, Statement, TableFactor, Value,
    Visit, Visitor,
};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;

/// Functions that read the filesystem or evaluate dynamic input. DuckDB
/// exposes these to any connection, so the parser walk refuses them even
/// though the connection itself is read-only.
const DENIED_FUNCTIONS: &[&str] = &[
    "read_csv",
    "read_csv_auto",
    "read_parquet",
    "read_json",
    "read_json_auto",
    "read_json_objects",
    "read_text",
    "read_blob",
    "sniff_csv",
    "glob",
    "getenv",
    "query",
    "query_table",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Unparseable(String),
    MultipleStatements,
    WriteOperation,
    UnknownSchemaObject(String),
    SuspiciousConstruct(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Unparseable(e) => write!(f, "not parseable as SQL: {}", e),
            RejectReason::MultipleStatements => write!(f, "more than one statement"),
            RejectReason::WriteOperation => write!(f, "not a single read-only SELECT"),
            RejectReason::UnknownSchemaObject(name) => {
                write!(f, "unknown table or column: {}", name)
            }
            RejectReason::SuspiciousConstruct(what) => {
                write!(f, "disallowed construct: {}", what)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Accepted { canonical_sql: String },
    Rejected { reason: RejectReason },
}

fn rejected(reason: RejectReason) -> ValidationVerdict {
    ValidationVerdict::Rejected { reason }
}

/// Applies the read-only, schema-whitelisted policy to one piece of model
/// output. On acceptance returns the canonicalized statement: the AST printed
/// back out with the row cap enforced.
pub fn validate(sql_text: &str, schema: &SchemaMetadata, row_cap: usize) -> ValidationVerdict {
    // Comments can hide content from later textual inspection; refuse them
    // before parsing.
    if sql_text.contains("--") || sql_text.contains("/*") {
        return rejected(RejectReason::SuspiciousConstruct("SQL comment".to_string()));
    }

    let statements = match Parser::parse_sql(&DuckDbDialect {}, sql_text) {
        Ok(statements) => statements,
        Err(e) => return rejected(RejectReason::Unparseable(e.to_string())),
    };

    let statement = match statements.as_slice() {
        [] => return rejected(RejectReason::Unparseable("empty statement".to_string())),
        [single] => single,
        _ => return rejected(RejectReason::MultipleStatements),
    };

    let query = match statement {
        Statement::Query(query) => query,
        _ => return rejected(RejectReason::WriteOperation),
    };

    let mut inspector = QueryInspector::default();
    let _ = statement.visit(&mut inspector);
    if let Some(reason) = inspector.violation {
        return rejected(reason);
    }

    // Every relation must be a whitelisted table or a CTE from this statement.
    let mut referenced: Vec<&TableDescriptor> = Vec::new();
    for parts in &inspector.relations {
        match parts.as_slice() {
            [name] => {
                if inspector.ctes.contains(name) {
                    continue;
                }
                match schema.table(name) {
                    Some(table) => {
                        if !referenced.iter().any(|t| t.name == table.name) {
                            referenced.push(table);
                        }
                    }
                    None => return rejected(RejectReason::UnknownSchemaObject(name.clone())),
                }
            }
            // The prompt asks for unqualified names; qualified references are
            // how a model would reach outside the whitelist.
            _ => return rejected(RejectReason::UnknownSchemaObject(parts.join("."))),
        }
    }

    // Column identifiers resolve against referenced tables and names defined
    // inside the statement (aliases, CTEs).
    let mut allowed_columns: HashSet<String> = HashSet::new();
    for table in &referenced {
        for column in &table.columns {
            allowed_columns.insert(column.name.to_lowercase());
        }
    }

    for (qualifier, column) in &inspector.column_refs {
        match qualifier {
            None => {
                if !allowed_columns.contains(column)
                    && !inspector.select_aliases.contains(column)
                {
                    return rejected(RejectReason::UnknownSchemaObject(column.clone()));
                }
            }
            Some(qualifier) => {
                let target = if let Some(alias_target) = inspector.table_aliases.get(qualifier)
                {
                    match alias_target {
                        // Alias of a physical table: columns are checkable.
                        Some(table) if !inspector.ctes.contains(table) => Some(table.clone()),
                        // Alias of a derived table or CTE: shape is opaque.
                        _ => None,
                    }
                } else if inspector.ctes.contains(qualifier) {
                    None
                } else if schema.table(qualifier).is_some() {
                    Some(qualifier.clone())
                } else {
                    return rejected(RejectReason::UnknownSchemaObject(format!(
                        "{}.{}",
                        qualifier, column
                    )));
                };

                if let Some(table_name) = target {
                    let known = schema
                        .table(&table_name)
                        .map(|t| t.columns.iter().any(|c| c.name.eq_ignore_ascii_case(column)))
                        .unwrap_or(false);
                    if !known {
                        return rejected(RejectReason::UnknownSchemaObject(format!(
                            "{}.{}",
                            table_name, column
                        )));
                    }
                }
            }
        }
    }

    // Bound the result size regardless of what the model produced.
    let mut query = (**query).clone();
    enforce_row_cap(&mut query, row_cap);

    ValidationVerdict::Accepted {
        canonical_sql: Statement::Query(Box::new(query)).to_string(),
    }
}

/// A missing top-level LIMIT becomes the cap; a larger or non-literal LIMIT
/// is clamped to it. FETCH clauses fold into LIMIT so one mechanism bounds
/// everything.
fn enforce_row_cap(query: &mut Query, cap: usize) {
    let fetch_rows = query
        .fetch
        .take()
        .and_then(|fetch| literal_usize(fetch.quantity.as_ref()));
    let limit_rows = query.limit.take().and_then(|expr| literal_usize(Some(&expr)));

    let effective = [fetch_rows, limit_rows]
        .into_iter()
        .flatten()
        .min()
        .map_or(cap, |n| n.min(cap));

    query.limit = Some(Expr::Value(Value::Number(effective.to_string(), false)));
}

fn literal_usize(expr: Option<&Expr>) -> Option<usize> {
    match expr {
        Some(Expr::Value(Value::Number(n, _))) => n.parse().ok(),
        _ => None,
    }
}

fn object_name_parts(name: &sqlparser::ast::ObjectName) -> Vec<String> {
    name.0
        .iter()
        .map(|ident| ident.value.to_lowercase())
        .collect()
}

/// Collects relations, column identifiers and locally defined names while
/// rejecting shapes outside the read-only grammar. Resolution against the
/// schema happens after the walk, once CTE and alias names are all known.
#[derive(Default)]
struct QueryInspector {
    ctes: HashSet<String>,
    /// alias -> physical table name, or None for derived/opaque sources
    table_aliases: HashMap<String, Option<String>>,
    select_aliases: HashSet<String>,
    relations: Vec<Vec<String>>,
    column_refs: Vec<(Option<String>, String)>,
    violation: Option<RejectReason>,
}

impl QueryInspector {
    fn reject(&mut self, reason: RejectReason) {
        // First violation wins; the walk continues but the verdict is fixed.
        if self.violation.is_none() {
            self.violation = Some(reason);
        }
    }

    fn scan_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => self.scan_select(select),
            // Nested queries get their own pre_visit_query call.
            SetExpr::Query(_) => {}
            SetExpr::SetOperation { left, right, .. } => {
                self.scan_set_expr(left);
                self.scan_set_expr(right);
            }
            _ => self.reject(RejectReason::WriteOperation),
        }
    }

    fn scan_select(&mut self, select: &Select) {
        for item in &select.projection {
            if let SelectItem::ExprWithAlias { alias, .. } = item {
                self.select_aliases.insert(alias.value.to_lowercase());
            }
        }
    }
}

impl Visitor for QueryInspector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
        }
        self.scan_set_expr(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<()> {
        match table_factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if args.is_some() {
                    self.reject(RejectReason::SuspiciousConstruct(
                        "table function".to_string(),
                    ));
                }
                let parts = object_name_parts(name);
                if let Some(alias) = alias {
                    let target = match parts.as_slice() {
                        [single] => Some(single.clone()),
                        _ => None,
                    };
                    self.table_aliases
                        .insert(alias.name.value.to_lowercase(), target);
                }
                self.relations.push(parts);
            }
            TableFactor::Derived { alias, .. } => {
                if let Some(alias) = alias {
                    self.table_aliases
                        .insert(alias.name.value.to_lowercase(), None);
                }
            }
            TableFactor::NestedJoin { .. } => {}
            _ => self.reject(RejectReason::SuspiciousConstruct(
                "unsupported table reference".to_string(),
            )),
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        match expr {
            Expr::Identifier(ident) => {
                self.column_refs.push((None, ident.value.to_lowercase()));
            }
            Expr::CompoundIdentifier(parts) => {
                if parts.len() == 2 {
                    self.column_refs.push((
                        Some(parts[0].value.to_lowercase()),
                        parts[1].value.to_lowercase(),
                    ));
                } else {
                    let joined = parts
                        .iter()
                        .map(|p| p.value.as_str())
                        .collect::<Vec<_>>()
                        .join(".");
                    self.reject(RejectReason::UnknownSchemaObject(joined));
                }
            }
            Expr::Function(function) => {
                let name = object_name_parts(&function.name).join(".");
                if DENIED_FUNCTIONS.contains(&name.as_str()) {
                    self.reject(RejectReason::SuspiciousConstruct(format!(
                        "function {}",
                        name
                    )));
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::introspect::ColumnDescriptor;

    fn schema() -> SchemaMetadata {
        let table = |name: &str, columns: &[&str]| TableDescriptor {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|c| ColumnDescriptor {
                    name: c.to_string(),
                    data_type: "VARCHAR".to_string(),
                    nullable: true,
                })
                .collect(),
        };
        SchemaMetadata {
            version: 1,
            stale: false,
            tables: vec![
                table(
                    "workflow_runs",
                    &["id", "workflow_name", "status", "started_at", "finished_at", "duration_ms"],
                ),
                table("workflow_steps", &["run_id", "step_name", "status"]),
            ],
        }
    }

    const CAP: usize = 500;

    fn accept(sql: &str) -> String {
        match validate(sql, &schema(), CAP) {
            ValidationVerdict::Accepted { canonical_sql } => canonical_sql,
            ValidationVerdict::Rejected { reason } => {
                panic!("expected acceptance of {:?}, got {:?}", sql, reason)
            }
        }
    }

    fn reject(sql: &str) -> RejectReason {
        match validate(sql, &schema(), CAP) {
            ValidationVerdict::Rejected { reason } => reason,
            ValidationVerdict::Accepted { canonical_sql } => {
                panic!("expected rejection of {:?}, got {:?}", sql, canonical_sql)
            }
        }
    }

    #[test]
    fn accepts_aggregate_over_whitelisted_table() {
        let sql = accept(
            "SELECT count(*) AS failed_runs FROM workflow_runs \
             WHERE status = 'failed' AND finished_at >= now() - INTERVAL '7 days'",
        );
        assert!(sql.contains("workflow_runs"));
        assert!(sql.contains("count(*)"));
        assert!(sql.ends_with(&format!("LIMIT {}", CAP)));
    }

    #[test]
    fn canonicalizes_whitespace() {
        let sql = accept("select   id ,\n\tstatus   from workflow_runs");
        assert_eq!(sql, format!("SELECT id, status FROM workflow_runs LIMIT {}", CAP));
    }

    #[test]
    fn injects_row_cap_when_limit_missing() {
        let sql = accept("SELECT id FROM workflow_runs");
        assert!(sql.ends_with(&format!("LIMIT {}", CAP)));
    }

    #[test]
    fn clamps_oversized_limit() {
        let sql = accept("SELECT id FROM workflow_runs LIMIT 99999");
        assert!(sql.ends_with(&format!("LIMIT {}", CAP)));
    }

    #[test]
    fn keeps_smaller_limit() {
        let sql = accept("SELECT id FROM workflow_runs LIMIT 10");
        assert!(sql.ends_with("LIMIT 10"));
    }

    #[test]
    fn replaces_non_literal_limit() {
        let sql = accept("SELECT id FROM workflow_runs LIMIT 10 + 10");
        assert!(sql.ends_with(&format!("LIMIT {}", CAP)));
    }

    #[test]
    fn folds_fetch_into_limit() {
        let sql = accept("SELECT id FROM workflow_runs FETCH FIRST 10 ROWS ONLY");
        assert!(sql.ends_with("LIMIT 10"));
        assert!(!sql.contains("FETCH"));
    }

    #[test]
    fn accepts_ctes_and_joins() {
        accept(
            "WITH failed AS (SELECT id FROM workflow_runs WHERE status = 'failed') \
             SELECT s.step_name, count(*) AS failures \
             FROM workflow_steps s JOIN failed ON s.run_id = failed.id \
             GROUP BY s.step_name ORDER BY failures DESC",
        );
    }

    #[test]
    fn accepts_set_operations() {
        accept(
            "SELECT id FROM workflow_runs UNION ALL SELECT run_id FROM workflow_steps",
        );
    }

    #[test]
    fn accepts_table_alias_columns() {
        accept("SELECT r.status FROM workflow_runs AS r");
    }

    #[test]
    fn accepts_select_item_alias_in_order_by() {
        accept(
            "SELECT workflow_name, count(*) AS runs FROM workflow_runs \
             GROUP BY workflow_name ORDER BY runs DESC",
        );
    }

    #[test]
    fn rejects_multiple_statements() {
        let reason = reject("SELECT id FROM workflow_runs; SELECT status FROM workflow_runs");
        assert_eq!(reason, RejectReason::MultipleStatements);
    }

    #[test]
    fn rejects_mutation_attempts() {
        for sql in [
            "DELETE FROM workflow_runs WHERE status = 'failed' AND finished_at >= now() - INTERVAL '7 days'",
            "INSERT INTO workflow_runs (id) VALUES (1)",
            "UPDATE workflow_runs SET status = 'ok'",
            "DROP TABLE workflow_runs",
            "CREATE TABLE evil (id INT)",
            "TRUNCATE TABLE workflow_runs",
        ] {
            assert_eq!(reject(sql), RejectReason::WriteOperation, "sql: {}", sql);
        }
    }

    #[test]
    fn rejects_values_body() {
        assert_eq!(reject("VALUES (1, 2)"), RejectReason::WriteOperation);
    }

    #[test]
    fn rejects_hallucinated_table() {
        let reason = reject("SELECT id FROM workflow_jobs");
        assert_eq!(
            reason,
            RejectReason::UnknownSchemaObject("workflow_jobs".to_string())
        );
    }

    #[test]
    fn rejects_non_whitelisted_table_in_subquery() {
        let reason = reject(
            "SELECT id FROM workflow_runs WHERE id IN (SELECT run_id FROM internal_secrets)",
        );
        assert_eq!(
            reason,
            RejectReason::UnknownSchemaObject("internal_secrets".to_string())
        );
    }

    #[test]
    fn rejects_unknown_column() {
        let reason = reject("SELECT password FROM workflow_runs");
        assert_eq!(
            reason,
            RejectReason::UnknownSchemaObject("password".to_string())
        );
    }

    #[test]
    fn rejects_unknown_aliased_column() {
        let reason = reject("SELECT r.bogus FROM workflow_runs r");
        assert!(matches!(reason, RejectReason::UnknownSchemaObject(_)));
    }

    #[test]
    fn rejects_unknown_qualifier() {
        let reason = reject("SELECT x.status FROM workflow_runs r");
        assert!(matches!(reason, RejectReason::UnknownSchemaObject(_)));
    }

    #[test]
    fn rejects_schema_qualified_tables() {
        let reason = reject("SELECT id FROM main.workflow_runs");
        assert!(matches!(reason, RejectReason::UnknownSchemaObject(_)));
    }

    #[test]
    fn rejects_comments() {
        let reason = reject("SELECT id FROM workflow_runs -- sneaky");
        assert!(matches!(reason, RejectReason::SuspiciousConstruct(_)));
        let reason = reject("SELECT /* hidden */ id FROM workflow_runs");
        assert!(matches!(reason, RejectReason::SuspiciousConstruct(_)));
    }

    #[test]
    fn rejects_table_functions() {
        let reason = reject("SELECT * FROM read_csv('/etc/passwd')");
        assert!(matches!(reason, RejectReason::SuspiciousConstruct(_)));
    }

    #[test]
    fn rejects_denied_scalar_functions() {
        let reason = reject("SELECT getenv('HOME')");
        assert!(matches!(reason, RejectReason::SuspiciousConstruct(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            reject("this is not sql at all"),
            RejectReason::Unparseable(_)
        ));
        assert!(matches!(reject("   "), RejectReason::Unparseable(_)));
    }
}
