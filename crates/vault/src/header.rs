//! Vault header lines
//!
//! A vault file starts with reserved comments:
//!
//! ```text
//! # si-vault:v2
//! # si-vault:recipient age1...
//!
//! ```
//!
//! Every other `#` line is a user comment and left alone.

use crate::dotenv::Document;
use std::collections::HashSet;

/// Version line written by this tool
pub const VERSION_LINE: &str = "# si-vault:v2";

/// Prefix of recipient lines
pub const RECIPIENT_PREFIX: &str = "# si-vault:recipient ";

fn reserved_body(text: &str) -> Option<&str> {
    text.trim().strip_prefix('#').map(str::trim)
}

/// Any accepted version marker
pub fn is_version_line(text: &str) -> bool {
    match reserved_body(text) {
        Some(body) => {
            matches!(body, "si-vault:v1" | "si-vault:v2")
                || body
                    .strip_prefix("si-vault:version")
                    .map(|n| {
                        let n = n.trim();
                        !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())
                    })
                    .unwrap_or(false)
        }
        None => false,
    }
}

/// Recipient named by a `# si-vault:recipient` line
pub fn parse_recipient_line(text: &str) -> Option<String> {
    let rest = reserved_body(text)?.strip_prefix("si-vault:recipient")?.trim();
    (!rest.is_empty()).then(|| rest.to_string())
}

pub fn is_header_line(text: &str) -> bool {
    is_version_line(text) || parse_recipient_line(text).is_some()
}

pub fn recipient_line(recipient: &str) -> String {
    format!("{}{}", RECIPIENT_PREFIX, recipient)
}

/// Recipients declared anywhere in the file, in order, without duplicates
pub fn recipients(doc: &Document) -> Vec<String> {
    dedup(
        doc.lines()
            .iter()
            .filter_map(|l| parse_recipient_line(&l.text)),
    )
}

/// Whether the file carries any vault header line
pub fn has_header(doc: &Document) -> bool {
    doc.lines().iter().any(|l| is_header_line(&l.text))
}

fn dedup(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty() && seen.insert(r.clone()))
        .collect()
}

/// Make sure the header declares `wanted` recipients
///
/// An existing header block only gains the missing lines. Without a header,
/// a fresh block is prepended. Returns whether the document changed.
pub fn ensure_header(doc: &mut Document, wanted: &[String]) -> bool {
    let wanted = dedup(wanted.iter().cloned());
    if wanted.is_empty() {
        return false;
    }

    let mut has_version = false;
    let mut existing = HashSet::new();
    let mut block_end = 0;
    for line in doc.lines() {
        if is_version_line(&line.text) {
            has_version = true;
        } else if let Some(r) = parse_recipient_line(&line.text) {
            existing.insert(r);
        } else {
            break;
        }
        block_end += 1;
    }

    if !has_version && existing.is_empty() {
        doc.insert_line(0, VERSION_LINE);
        let mut at = 1;
        for r in &wanted {
            doc.insert_line(at, &recipient_line(r));
            at += 1;
        }
        doc.insert_line(at, "");
        return true;
    }

    let mut changed = false;
    let mut insert_at = (0..block_end)
        .filter(|&i| parse_recipient_line(&doc.lines()[i].text).is_some())
        .last()
        .map(|i| i + 1)
        .unwrap_or(block_end);
    for r in &wanted {
        if existing.contains(r) {
            continue;
        }
        doc.insert_line(insert_at, &recipient_line(r));
        insert_at += 1;
        changed = true;
    }
    if !has_version {
        doc.insert_line(0, VERSION_LINE);
        changed = true;
    }

    let header_end = doc
        .lines()
        .iter()
        .take_while(|l| is_header_line(&l.text))
        .count();
    if header_end >= doc.lines().len() {
        doc.push_line("");
        changed = true;
    } else if !doc.lines()[header_end].text.trim().is_empty() {
        doc.insert_line(header_end, "");
        changed = true;
    }
    changed
}

/// Drop every recipient line naming `recipient`
pub fn remove_recipient(doc: &mut Document, recipient: &str) -> bool {
    let recipient = recipient.trim();
    if recipient.is_empty() {
        return false;
    }
    let matches: Vec<usize> = doc
        .lines()
        .iter()
        .enumerate()
        .filter(|(_, l)| parse_recipient_line(&l.text).as_deref() == Some(recipient))
        .map(|(i, _)| i)
        .collect();
    for index in matches.iter().rev() {
        doc.remove_line(*index);
    }
    !matches.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    const R1: &str = "age1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq";
    const R2: &str = "age1zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz";

    #[test]
    fn test_version_lines() {
        assert!(is_version_line("# si-vault:v2"));
        assert!(is_version_line("#si-vault:v1"));
        assert!(is_version_line("# si-vault:version 1"));
        assert!(!is_version_line("# si-vault:version"));
        assert!(!is_version_line("si-vault:v2"));
    }

    #[test]
    fn test_prepend_header() {
        let mut doc = Document::parse("A=1\n");
        assert!(ensure_header(&mut doc, &[R1.to_string()]));
        assert_eq!(
            doc.emit(),
            format!("# si-vault:v2\n# si-vault:recipient {}\n\nA=1\n", R1)
        );
        assert_eq!(recipients(&doc), vec![R1.to_string()]);
    }

    #[test]
    fn test_header_on_empty_file() {
        let mut doc = Document::parse("");
        ensure_header(&mut doc, &[R1.to_string()]);
        assert_eq!(
            doc.emit(),
            format!("# si-vault:v2\n# si-vault:recipient {}\n\n", R1)
        );
    }

    #[test]
    fn test_header_on_missing_file() {
        let mut doc = Document::default();
        assert!(ensure_header(&mut doc, &[R1.to_string()]));
        assert_eq!(recipients(&doc), vec![R1.to_string()]);
        assert_eq!(doc.lines().len(), 3);
    }

    #[test]
    fn test_ensure_header_is_idempotent() {
        let mut doc = Document::parse("");
        ensure_header(&mut doc, &[R1.to_string()]);
        let before = doc.emit();
        assert!(!ensure_header(&mut doc, &[R1.to_string(), R1.to_string()]));
        assert_eq!(doc.emit(), before);
    }

    #[test]
    fn test_adds_missing_recipient_to_legacy_header() {
        let mut doc = Document::parse(&format!(
            "# si-vault:version 1\r\n# si-vault:recipient {}\r\nA=1\r\n",
            R1
        ));
        assert!(ensure_header(&mut doc, &[R1.to_string(), R2.to_string()]));
        assert_eq!(
            doc.emit(),
            format!(
                "# si-vault:version 1\r\n# si-vault:recipient {}\r\n# si-vault:recipient {}\r\n\r\nA=1\r\n",
                R1, R2
            )
        );
    }

    #[test]
    fn test_adds_missing_version() {
        let mut doc = Document::parse(&format!("# si-vault:recipient {}\n\nA=1\n", R1));
        assert!(ensure_header(&mut doc, &[R1.to_string()]));
        assert!(doc.emit().starts_with("# si-vault:v2\n# si-vault:recipient "));
    }

    #[test]
    fn test_remove_recipient() {
        let mut doc = Document::parse("");
        ensure_header(&mut doc, &[R1.to_string(), R2.to_string()]);
        assert!(remove_recipient(&mut doc, R1));
        assert_eq!(recipients(&doc), vec![R2.to_string()]);
        assert!(!remove_recipient(&mut doc, R1));
        assert!(has_header(&doc));
    }
}
