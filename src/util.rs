//! Shared utility functions for the Conveyor crate.

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object. Agent output
/// interleaves prose with the artifact payload; only the payload is JSON.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Last `n` non-empty lines of a block of output, joined back together.
/// Diagnostics keep the tail of a failing run, not megabytes of scrollback.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_with_surrounding_prose() {
        let text = r#"Resolved the failing test. {"branch_name": "conveyor/wf-001"} Done."#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"branch_name": "conveyor/wf-001"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"stack_outputs": {"api_url": "https://x"}}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_absent_or_unclosed() {
        assert_eq!(extract_json_object("no payload here"), None);
        assert_eq!(extract_json_object(r#"{"open": true"#), None);
    }

    #[test]
    fn test_tail_lines_keeps_last_n() {
        let text = "one\ntwo\n\nthree\nfour\n";
        assert_eq!(tail_lines(text, 2), "three\nfour");
    }

    #[test]
    fn test_tail_lines_shorter_than_n() {
        assert_eq!(tail_lines("only line\n", 5), "only line");
        assert_eq!(tail_lines("", 5), "");
    }
}
