use crate::config::PipelineConfig;
use crate::db::introspect::{SchemaMetadata, TableDescriptor};
use crate::llm::ChatMessage;
use std::fmt::Write;

/// SQL-generation prompt. Building it is a pure function of the question and
/// an immutable schema snapshot, so identical inputs always produce identical
/// prompts (cache fingerprints and tests depend on this).
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn messages(&self) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.system.clone()),
            ChatMessage::user(self.user.clone()),
        ]
    }
}

const SYSTEM_INSTRUCTIONS: &str = "\
You translate analytics questions about workflow executions into DuckDB SQL.
Rules:
- Emit exactly ONE SELECT statement and nothing else: no commentary, no markdown, no comments.
- Reference only the tables and columns listed in the schema, spelled exactly as shown.
- Use plain unqualified table names.
- Always include a LIMIT clause.
- When computing a ratio, cast the numerator as DOUBLE.";

// Canonical question/SQL pairs over the workflow-analytics domain. Fixed so
// prompts stay deterministic.
const EXEMPLARS: &[(&str, &str)] = &[
    (
        "How many workflows failed last week?",
        "SELECT count(*) AS failed_runs FROM workflow_runs WHERE status = 'failed' AND finished_at >= now() - INTERVAL '7 days' LIMIT 100",
    ),
    (
        "What is the average duration per workflow, slowest first?",
        "SELECT workflow_name, avg(duration_ms) AS avg_duration_ms FROM workflow_runs GROUP BY workflow_name ORDER BY avg_duration_ms DESC LIMIT 100",
    ),
    (
        "Which step fails most often?",
        "SELECT step_name, count(*) AS failures FROM workflow_steps WHERE status = 'failed' GROUP BY step_name ORDER BY failures DESC LIMIT 10",
    ),
];

pub fn build(question: &str, schema: &SchemaMetadata, config: &PipelineConfig) -> Prompt {
    build_inner(question, schema, config, None)
}

/// Variant for the single bounded regeneration attempt after a validator
/// rejection: the reason is appended so the model can correct itself.
pub fn build_with_feedback(
    question: &str,
    schema: &SchemaMetadata,
    config: &PipelineConfig,
    feedback: &str,
) -> Prompt {
    build_inner(question, schema, config, Some(feedback))
}

fn build_inner(
    question: &str,
    schema: &SchemaMetadata,
    config: &PipelineConfig,
    feedback: Option<&str>,
) -> Prompt {
    let mut user = String::new();

    writeln!(user, "## Schema\n").ok();
    user.push_str(&render_schema(schema, question, config.prompt_char_budget));

    writeln!(user, "\n## Examples\n").ok();
    for (example_question, example_sql) in EXEMPLARS {
        writeln!(user, "Question: {}", example_question).ok();
        writeln!(user, "SQL: {}\n", example_sql).ok();
    }

    writeln!(user, "## Task\n").ok();
    writeln!(user, "Question: {}", question).ok();
    if let Some(reason) = feedback {
        writeln!(
            user,
            "\nYour previous attempt was rejected: {}. Produce a corrected query.",
            reason
        )
        .ok();
    }
    user.push_str("SQL:");

    Prompt {
        system: SYSTEM_INSTRUCTIONS.to_string(),
        user,
    }
}

/// Renders table blocks in question-relevance order, dropping whole blocks
/// from the tail once the character budget is spent. Tables named in the
/// question (substring match) always come first.
fn render_schema(schema: &SchemaMetadata, question: &str, budget: usize) -> String {
    let question_lower = question.to_lowercase();
    let mut ordered: Vec<&TableDescriptor> = Vec::with_capacity(schema.tables.len());
    let mut rest: Vec<&TableDescriptor> = Vec::new();

    for table in &schema.tables {
        if question_lower.contains(&table.name.to_lowercase()) {
            ordered.push(table);
        } else {
            rest.push(table);
        }
    }
    ordered.extend(rest);

    let mut out = String::new();
    let mut omitted = 0usize;
    for table in ordered {
        let block = render_table(table);
        if !out.is_empty() && out.len() + block.len() > budget {
            omitted += 1;
            continue;
        }
        out.push_str(&block);
    }
    if omitted > 0 {
        writeln!(out, "({} more tables omitted)", omitted).ok();
    }
    out
}

fn render_table(table: &TableDescriptor) -> String {
    let mut block = String::new();
    writeln!(block, "{}(", table.name).ok();
    for (i, column) in table.columns.iter().enumerate() {
        let separator = if i + 1 < table.columns.len() { "," } else { "" };
        let null_marker = if column.nullable { "" } else { " NOT NULL" };
        writeln!(
            block,
            "  {} {}{}{}",
            column.name, column.data_type, null_marker, separator
        )
        .ok();
    }
    writeln!(block, ")").ok();
    block
}
