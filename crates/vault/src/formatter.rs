//! Canonical formatting of vault files
//!
//! The header block comes first, blank runs collapse to one line, assignment
//! and comment spacing is normalized and plain values get canonical quoting.
//! Ciphertexts, dividers and section headers are kept exactly as written.

use crate::cipher;
use crate::dotenv::{self, Document, Line};
use crate::header;

/// Formatting switches
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    /// Sort keys inside each run of consecutive assignments
    pub sort: bool,
}

/// Format a document; returns the result and whether the bytes differ
pub fn format_document(input: &Document, options: FormatOptions) -> (Document, bool) {
    let mut out: Vec<(String, Option<String>)> = Vec::new();

    let recipients = header::recipients(input);
    if header::has_header(input) {
        out.push((header::VERSION_LINE.to_string(), None));
        for r in &recipients {
            out.push((header::recipient_line(r), None));
        }
        out.push((String::new(), None));
    }

    let mut pending_blank = false;
    let body = input
        .lines()
        .iter()
        .filter(|l| !header::is_header_line(&l.text))
        .skip_while(|l| l.text.trim().is_empty());

    for line in body {
        let text = line.text.as_str();
        if text.trim().is_empty() {
            pending_blank = true;
            continue;
        }

        let last_is_content = out
            .last()
            .map(|(t, _)| !t.trim().is_empty())
            .unwrap_or(false);

        if dotenv::section_header(text).is_some() {
            let after_divider = out
                .last()
                .map(|(t, _)| dotenv::is_divider(t))
                .unwrap_or(false);
            if last_is_content && !after_divider {
                out.push((String::new(), None));
            }
            out.push((text.to_string(), None));
            pending_blank = false;
            continue;
        }

        if pending_blank && last_is_content {
            out.push((String::new(), None));
        }
        pending_blank = false;

        if dotenv::is_divider(text) {
            out.push((text.to_string(), None));
            continue;
        }

        if let Some(assignment) = dotenv::parse_assignment(text) {
            let trailer = assignment.trailer.trim();
            if trailer.is_empty() || trailer.starts_with('#') {
                let rendered = format_assignment(&assignment);
                out.push((rendered, Some(assignment.key)));
                continue;
            }
        }

        if text.trim_start().starts_with('#') {
            out.push((normalize_comment_line(text), None));
            continue;
        }

        out.push((text.to_string(), None));
    }

    if options.sort {
        sort_runs(&mut out);
    }

    let nl = input.default_nl();
    let lines = out
        .into_iter()
        .map(|(text, _)| Line {
            text,
            nl: nl.to_string(),
        })
        .collect();
    let formatted = Document::from_lines(lines, nl);
    let changed = formatted.emit() != input.emit();
    (formatted, changed)
}

fn format_assignment(assignment: &dotenv::Assignment) -> String {
    let raw = assignment.value_raw.trim();
    let token = if cipher::is_encrypted(raw) {
        raw.to_string()
    } else {
        match dotenv::normalize_value(raw) {
            Ok(value) => dotenv::render_value(&value),
            Err(_) => raw.to_string(),
        }
    };

    let line = dotenv::render_assignment(&assignment.key, &token, assignment.comment());
    if assignment.export {
        format!("export {}", line)
    } else {
        line
    }
}

fn normalize_comment_line(text: &str) -> String {
    let body = text.trim().trim_start_matches('#').trim();
    if body.is_empty() {
        "#".to_string()
    } else {
        format!("# {}", body)
    }
}

fn sort_runs(lines: &mut [(String, Option<String>)]) {
    let mut start = 0;
    while start < lines.len() {
        if lines[start].1.is_none() {
            start += 1;
            continue;
        }
        let end = lines[start..]
            .iter()
            .position(|(_, key)| key.is_none())
            .map(|p| start + p)
            .unwrap_or(lines.len());
        lines[start..end].sort_by(|a, b| a.1.cmp(&b.1));
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const R1: &str = "age1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq";

    fn fmt(input: &str) -> (String, bool) {
        let (doc, changed) = format_document(&Document::parse(input), FormatOptions::default());
        (doc.emit(), changed)
    }

    #[test]
    fn test_formats_spacing_and_quoting() {
        let input = format!(
            "\n# si-vault:version 1\n# si-vault:recipient {}\nA = 'plain'   #note\n\n\n#comment\nB=\"needs # quotes\"\nexport  C =x\n",
            R1
        );
        let (out, changed) = fmt(&input);
        assert!(changed);
        assert_eq!(
            out,
            format!(
                "# si-vault:v2\n# si-vault:recipient {}\n\nA=plain # note\n\n# comment\nB=\"needs # quotes\"\nexport C=x\n",
                R1
            )
        );
    }

    #[test]
    fn test_formatted_output_is_stable() {
        let input = format!("# si-vault:recipient {}\nA=1 # one\n\n\nB=2", R1);
        let (first, _) = fmt(&input);
        let (second, changed) = fmt(&first);
        assert_eq!(first, second);
        assert!(!changed);
    }

    #[test]
    fn test_keeps_ciphertext_and_sections() {
        let divider = dotenv::divider_line();
        let input = format!(
            "A=encrypted:si:v1:YWJj==\nB=es2:abc\n{}\n# [Payments]\nK=1\n",
            divider
        );
        let (out, _) = fmt(&input);
        assert_eq!(
            out,
            format!(
                "A=encrypted:si:v1:YWJj==\nB=es2:abc\n{}\n# [Payments]\nK=1\n",
                divider
            )
        );
    }

    #[test]
    fn test_section_gets_blank_line() {
        let (out, _) = fmt("A=1\n# [db]\nB=2\n");
        assert_eq!(out, "A=1\n\n# [db]\nB=2\n");
    }

    #[test]
    fn test_crlf_is_kept() {
        let (out, changed) = fmt("A=1\r\nB = 2");
        assert_eq!(out, "A=1\r\nB=2\r\n");
        assert!(changed);
    }

    #[test]
    fn test_sort_within_runs() {
        let input = "C=3\nA=1\n\n# tail\nZ=1\nB=2\n";
        let (doc, _) = format_document(
            &Document::parse(input),
            FormatOptions { sort: true },
        );
        assert_eq!(doc.emit(), "A=1\nC=3\n\n# tail\nB=2\nZ=1\n");
    }

    #[test]
    fn test_malformed_kept_verbatim() {
        let (out, _) = fmt("not valid\nA=\"open\n");
        assert_eq!(out, "not valid\nA=\"open\n");
    }
}
