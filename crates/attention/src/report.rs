//! Markdown rendering of suite results.

use crate::harness::{Outcome, SuiteSummary};

/// Escape a value so it stays inside one table cell.
fn cell(value: &str) -> String {
    value.replace('|', "\\|").replace(['\n', '\r'], " ")
}

/// Render `rows` under `headers` as a GitHub markdown table. Cell text is
/// escaped, so callers may pass user-supplied names and error messages.
pub fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let line = |cells: Vec<String>| format!("| {} |\n", cells.join(" | "));
    let mut table = line(headers.iter().map(|h| cell(h)).collect());
    table.push_str(&line(vec!["---".to_string(); headers.len()]));
    for row in rows {
        table.push_str(&line(row.iter().map(|value| cell(value)).collect()));
    }
    table
}

/// One row per case followed by a totals line.
pub fn summary_table(summary: &SuiteSummary) -> String {
    let headers = [
        "case",
        "dtype",
        "status",
        "max |Δ| out",
        "max |Δ| dq",
        "max |Δ| dk",
        "max |Δ| dv",
        "detail",
    ];
    let rows: Vec<Vec<String>> = summary
        .results
        .iter()
        .map(|result| {
            let mut row = vec![result.name.clone(), result.precision.to_string()];
            match &result.outcome {
                Ok(Outcome::Passed(report)) => {
                    row.push("pass".to_string());
                    for stats in [report.forward, report.grad_q, report.grad_k, report.grad_v] {
                        row.push(format!("{:.3e}", stats.max_abs));
                    }
                    row.push(String::new());
                }
                Ok(Outcome::Skipped { reason }) => {
                    row.push("skip".to_string());
                    row.extend(std::iter::repeat("-".to_string()).take(4));
                    row.push(reason.clone());
                }
                Err(err) => {
                    row.push("FAIL".to_string());
                    row.extend(std::iter::repeat("-".to_string()).take(4));
                    row.push(err.to_string());
                }
            }
            row
        })
        .collect();

    let mut table = markdown_table(&headers, &rows);
    table.push_str(&format!(
        "\n{} passed, {} failed, {} skipped\n",
        summary.passed(),
        summary.failed(),
        summary.skipped()
    ));
    table
}
