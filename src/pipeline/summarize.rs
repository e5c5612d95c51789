use crate::llm::{CallSettings, ChatMessage, LlmClient, LlmError};
use crate::pipeline::execute::QueryResult;
use serde_json::Value;
use std::fmt::Write;

const SYSTEM_INSTRUCTIONS: &str = "\
You are a data analyst. Answer the user's question using ONLY the result table \
provided. Do not invent numbers that are not in the table. If the table notes \
that results were truncated or sampled, say so in your answer. Keep the answer \
to a few sentences.";

/// Second LLM pass: turn the result set into a natural-language answer.
/// An empty result short-circuits to a fixed answer; the model never gets a
/// chance to fabricate commentary about rows that do not exist.
pub async fn summarize(
    llm: &LlmClient,
    settings: CallSettings,
    question: &str,
    result: &QueryResult,
    sample_rows: usize,
) -> Result<String, LlmError> {
    if result.row_count == 0 {
        return Ok(
            "The query matched no rows, so there is nothing to report for this question."
                .to_string(),
        );
    }

    let mut user = String::new();
    writeln!(user, "Question: {}\n", question).ok();
    writeln!(user, "Result:").ok();
    user.push_str(&render_result(result, sample_rows));
    writeln!(user, "\nAnswer the question using only this result.").ok();

    let messages = vec![
        ChatMessage::system(SYSTEM_INSTRUCTIONS),
        ChatMessage::user(user),
    ];
    llm.complete(&messages, settings).await
}

/// Compact markdown rendering of the result: headers plus up to
/// `sample_rows` rows, with explicit notes when rows were sampled or the
/// row cap cut the result off.
pub fn render_result(result: &QueryResult, sample_rows: usize) -> String {
    let mut out = String::new();

    writeln!(out, "| {} |", result.columns.join(" | ")).ok();
    writeln!(
        out,
        "|{}|",
        result.columns.iter().map(|_| " --- ").collect::<Vec<_>>().join("|")
    )
    .ok();

    for row in result.rows.iter().take(sample_rows) {
        let cells: Vec<String> = row.iter().map(render_cell).collect();
        writeln!(out, "| {} |", cells.join(" | ")).ok();
    }

    if result.row_count > sample_rows {
        writeln!(
            out,
            "(showing first {} of {} rows)",
            sample_rows, result.row_count
        )
        .ok();
    }
    if result.truncated {
        writeln!(out, "(results truncated at the row cap)").ok();
    }
    out
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
