// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Output and result compression.
//!
//! Worker output is compressed when captured (repeated lines collapsed, the
//! middle elided, a hard byte cap). Results are rendered for the supervisor in
//! one of three return formats.

use crate::config::ResultsConfig;

use super::types::{MergeOutcome, ReturnFormat, WorkerResult};

/// Renders worker results for delivery back to the supervisor.
#[derive(Debug, Clone)]
pub struct ResultCompressor {
    pub max_summary_tokens: usize,
    pub max_diff_lines: usize,
    pub max_output_lines: usize,
    pub max_output_bytes: usize,
}

impl Default for ResultCompressor {
    fn default() -> Self {
        Self::from_config(&ResultsConfig::default())
    }
}

/// One worker's contribution to an aggregated response.
#[derive(Debug, Clone, Copy)]
pub struct ReportEntry<'a> {
    pub result: &'a WorkerResult,
    pub outcome: Option<&'a MergeOutcome>,
    pub format: ReturnFormat,
}

impl ResultCompressor {
    pub fn from_config(config: &ResultsConfig) -> Self {
        Self {
            max_summary_tokens: config.max_summary_tokens,
            max_diff_lines: config.max_diff_lines,
            max_output_lines: config.max_output_lines,
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Compact description of a result, cut at roughly `max_summary_tokens`.
    pub fn summary_block(&self, result: &WorkerResult) -> String {
        let report = &result.report;
        let mut lines = vec![
            format!("Worker: {}", result.worker_id),
            format!("Status: {}", result.status),
            format!("Result: {}", report_status_str(result)),
            format!("Summary: {}", report.summary.trim()),
        ];

        if !report.files_modified.is_empty() {
            lines.push(format!("Files modified: {}", report.files_modified.join(", ")));
        }
        if !report.files_created.is_empty() {
            lines.push(format!("Files created: {}", report.files_created.join(", ")));
        }
        if !report.files_deleted.is_empty() {
            lines.push(format!("Files deleted: {}", report.files_deleted.join(", ")));
        }
        if !report.key_decisions.is_empty() {
            lines.push(format!("Key decisions: {}", report.key_decisions.join(" | ")));
        }
        if !report.warnings.is_empty() {
            lines.push(format!("Warnings: {}", report.warnings.join(" | ")));
        }
        if let Some(error) = &result.error {
            lines.push(format!("Error: {}", error));
        }

        lines.push(format!("Tests: {}", report.tests_status.as_str()));
        lines.push(format!("Confidence: {:.2}", report.confidence));

        shorten(&lines.join("\n"), self.max_summary_tokens.saturating_mul(4))
    }

    /// Keep the first `max_diff_lines` lines of a diff.
    pub fn truncate_diff(&self, diff: &str) -> String {
        let lines: Vec<&str> = diff.lines().collect();
        if lines.len() <= self.max_diff_lines {
            return diff.trim_end().to_string();
        }
        let head = lines[..self.max_diff_lines].join("\n");
        format!(
            "{}\n... [truncated {} lines]",
            head,
            lines.len() - self.max_diff_lines
        )
    }

    /// Render one result in the requested format.
    pub fn compress(&self, result: &WorkerResult, format: ReturnFormat) -> String {
        let summary = self.summary_block(result);
        match format {
            ReturnFormat::Summary => summary,
            ReturnFormat::Diff => format!(
                "{}\n\nDiff:\n```diff\n{}\n```",
                summary,
                self.truncate_diff(&result.change_set.patch)
            ),
            ReturnFormat::Full => {
                let mut text = format!(
                    "{}\n\nDiff:\n```diff\n{}\n```\n\nOutput:\n```text\n{}\n```",
                    summary,
                    result.change_set.patch.trim_end(),
                    result.output_excerpt.trim_end()
                );
                if !result.stderr_excerpt.trim().is_empty() {
                    text.push_str(&format!(
                        "\n\nStderr:\n```text\n{}\n```",
                        result.stderr_excerpt.trim_end()
                    ));
                }
                text
            }
        }
    }

    /// Aggregate several results under one heading.
    pub fn aggregate(&self, title: &str, entries: &[ReportEntry<'_>]) -> String {
        let mut out = format!("## codi-swarm: {}\n", title);
        if entries.is_empty() {
            out.push_str("\nNo workers ran.\n");
            return out;
        }

        for entry in entries {
            let merge = entry.outcome.map(MergeOutcome::label).unwrap_or("not_merged");
            out.push_str(&format!(
                "\n### {} ({}, merge: {})\n",
                entry.result.worker_id, entry.result.status, merge
            ));
            if let Some(outcome) = entry.outcome {
                if !outcome.out_of_scope_paths.is_empty() {
                    out.push_str(&format!(
                        "Out of scope: {}\n",
                        outcome.out_of_scope_paths.join(", ")
                    ));
                }
                if !outcome.message.is_empty() && !outcome.applied {
                    out.push_str(&format!("Merge: {}\n", outcome.message));
                }
            }
            out.push_str(&self.compress(entry.result, entry.format));
            out.push('\n');
        }
        out
    }

    /// Compress captured process output.
    ///
    /// Consecutive duplicate lines collapse to one with a count; beyond
    /// `max_output_lines` the middle is elided; the result never exceeds
    /// `max_output_bytes` plus a short marker.
    pub fn compress_output(&self, output: &str) -> String {
        let collapsed = collapse_repeats(output);
        let lines = elide_middle_lines(&collapsed, self.max_output_lines);
        cap_bytes(&lines.join("\n"), self.max_output_bytes)
    }
}

fn report_status_str(result: &WorkerResult) -> &'static str {
    use super::types::ReportStatus;
    match result.report.status {
        ReportStatus::Success => "success",
        ReportStatus::Partial => "partial",
        ReportStatus::Failed => "failed",
        ReportStatus::Blocked => "blocked",
    }
}

/// Cut `text` to at most `max_chars` characters on a word boundary, adding ` ...`.
fn shorten(text: &str, max_chars: usize) -> String {
    const PLACEHOLDER: &str = " ...";
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let budget = max_chars.saturating_sub(PLACEHOLDER.len());
    let cut: String = text.chars().take(budget).collect();
    let trimmed = match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => &cut[..idx],
        _ => cut.as_str(),
    };
    format!("{}{}", trimmed.trim_end(), PLACEHOLDER)
}

fn collapse_repeats(output: &str) -> Vec<String> {
    fn flush(line: Option<&str>, count: usize, lines: &mut Vec<String>) {
        match line {
            Some(line) if count > 1 => lines.push(format!("{} [x{}]", line, count)),
            Some(line) => lines.push(line.to_string()),
            None => {}
        }
    }

    let mut lines: Vec<String> = Vec::new();
    let mut last: Option<&str> = None;
    let mut count = 0usize;

    for line in output.lines() {
        if Some(line) == last {
            count += 1;
        } else {
            flush(last, count, &mut lines);
            last = Some(line);
            count = 1;
        }
    }
    flush(last, count, &mut lines);
    lines
}

fn elide_middle_lines(lines: &[String], max_lines: usize) -> Vec<String> {
    if max_lines == 0 || lines.len() <= max_lines {
        return lines.to_vec();
    }
    let head = max_lines / 2;
    let tail = max_lines - head;
    let omitted = lines.len() - head - tail;

    let mut out = Vec::with_capacity(max_lines + 1);
    out.extend_from_slice(&lines[..head]);
    out.push(format!("... [{} lines omitted] ...", omitted));
    out.extend_from_slice(&lines[lines.len() - tail..]);
    out
}

fn cap_bytes(text: &str, max_bytes: usize) -> String {
    if max_bytes == 0 || text.len() <= max_bytes {
        return text.to_string();
    }
    let mut head_end = max_bytes / 2;
    while !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - (max_bytes - max_bytes / 2);
    while !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}\n... [{} bytes omitted] ...\n{}",
        &text[..head_end],
        tail_start - head_end,
        &text[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::types::{ChangeSet, TestsStatus, WorkerReport, WorkerStatus};

    fn result() -> WorkerResult {
        let mut result = WorkerResult::not_started("w-1", "req-1", WorkerStatus::Completed, "x");
        result.error = None;
        result.report = WorkerReport {
            summary: "Added retry logic".to_string(),
            files_modified: vec!["src/net.rs".to_string()],
            files_created: vec!["src/retry.rs".to_string()],
            key_decisions: vec!["exponential backoff".to_string(), "max 5".to_string()],
            tests_status: TestsStatus::Passed,
            confidence: 0.85,
            ..Default::default()
        };
        result.change_set = ChangeSet {
            files: vec!["src/net.rs".to_string()],
            patch: "diff --git a/src/net.rs b/src/net.rs\n+retry\n".to_string(),
        };
        result.output_excerpt = "working\ndone".to_string();
        result
    }

    fn compressor() -> ResultCompressor {
        ResultCompressor {
            max_summary_tokens: 500,
            max_diff_lines: 2,
            max_output_lines: 4,
            max_output_bytes: 1024,
        }
    }

    #[test]
    fn test_summary_block() {
        let text = compressor().summary_block(&result());
        insta::assert_snapshot!(text, @r###"
        Worker: w-1
        Status: completed
        Result: success
        Summary: Added retry logic
        Files modified: src/net.rs
        Files created: src/retry.rs
        Key decisions: exponential backoff | max 5
        Tests: passed
        Confidence: 0.85
        "###);
    }

    #[test]
    fn test_summary_block_is_shortened() {
        let mut compressor = compressor();
        compressor.max_summary_tokens = 10;
        let text = compressor.summary_block(&result());
        assert!(text.chars().count() <= 40);
        assert!(text.ends_with(" ..."));
        assert!(text.starts_with("Worker: w-1"));
    }

    #[test]
    fn test_truncate_diff() {
        let diff = "a\nb\nc\nd\ne";
        let truncated = compressor().truncate_diff(diff);
        assert_eq!(truncated, "a\nb\n... [truncated 3 lines]");
        assert_eq!(compressor().truncate_diff("a\nb\n"), "a\nb");
    }

    #[test]
    fn test_compress_formats() {
        let c = compressor();
        let r = result();

        let summary = c.compress(&r, ReturnFormat::Summary);
        assert!(!summary.contains("Diff:"));

        let diff = c.compress(&r, ReturnFormat::Diff);
        assert!(diff.contains("```diff\ndiff --git a/src/net.rs b/src/net.rs\n+retry\n```"));
        assert!(!diff.contains("Output:"));

        let full = c.compress(&r, ReturnFormat::Full);
        assert!(full.contains("Output:\n```text\nworking\ndone\n```"));
        assert!(!full.contains("Stderr:"));
    }

    #[test]
    fn test_aggregate_labels_merge_outcomes() {
        let c = compressor();
        let r = result();
        let outcome = MergeOutcome::held(&r, vec!["docs/a.md".to_string()], false, "outside scope");
        let text = c.aggregate(
            "spawn_swarm",
            &[ReportEntry {
                result: &r,
                outcome: Some(&outcome),
                format: ReturnFormat::Summary,
            }],
        );
        assert!(text.starts_with("## codi-swarm: spawn_swarm\n"));
        assert!(text.contains("### w-1 (completed, merge: pending_approval)"));
        assert!(text.contains("Out of scope: docs/a.md"));
        assert!(text.contains("Merge: outside scope"));

        assert!(c.aggregate("empty", &[]).contains("No workers ran."));
    }

    #[test]
    fn test_compress_output_collapses_repeats() {
        let c = compressor();
        let out = c.compress_output("start\ntick\ntick\ntick\nend\n");
        assert_eq!(out, "start\ntick [x3]\nend");
    }

    #[test]
    fn test_compress_output_elides_middle() {
        let c = compressor();
        let input: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        let out = c.compress_output(&input);
        assert_eq!(
            out,
            "line 1\nline 2\n... [6 lines omitted] ...\nline 9\nline 10"
        );
    }

    #[test]
    fn test_compress_output_caps_bytes() {
        let mut c = compressor();
        c.max_output_lines = 0;
        c.max_output_bytes = 20;
        let input = "é".repeat(100);
        let out = c.compress_output(&input);
        assert!(out.contains("bytes omitted"));
        assert!(out.len() < 80);
    }
}
