//! Expression extraction
//!
//! Finds the `${...}` spans embedded in arbitrary text with a single
//! left-to-right scan. Nested braces, braces inside string literals and
//! `//` line comments inside a span do not end it. A span that is still
//! open at the end of the input is dropped; malformed scripts are reported
//! when they are evaluated, not here.

/// A located template expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionSpan {
    /// Full span text including the `${` and the closing `}`
    pub text: String,
    /// Byte offset of the `$`
    pub start: usize,
    /// Byte offset one past the closing `}`
    pub end: usize,
    /// Zero-based line the span starts on
    pub start_row: usize,
}

#[derive(Debug, Default)]
struct ScanState {
    in_template: bool,
    in_comment: bool,
    in_single_quotes: bool,
    in_double_quotes: bool,
    pending_slash: bool,
    escaped: bool,
    dollar_at: Option<usize>,
    depth: usize,
    start: usize,
    start_row: usize,
}

impl ScanState {
    fn in_string(&self) -> bool {
        self.in_single_quotes || self.in_double_quotes
    }
}

/// All complete spans of `source`, in source order
pub fn extract(source: &str) -> Vec<ExpressionSpan> {
    let mut spans = Vec::new();
    let mut state = ScanState::default();
    let mut row = 0;

    for (i, c) in source.char_indices() {
        let escaped = state.escaped;
        let dollar_at = state.dollar_at.take();
        let pending_slash = std::mem::take(&mut state.pending_slash);
        state.escaped = false;

        match c {
            '\\' => {
                state.escaped = !escaped;
            }
            '\'' => {
                if state.in_template && !state.in_double_quotes && !escaped && !state.in_comment {
                    state.in_single_quotes = !state.in_single_quotes;
                }
            }
            '"' => {
                if state.in_template && !state.in_single_quotes && !escaped && !state.in_comment {
                    state.in_double_quotes = !state.in_double_quotes;
                }
            }
            '$' => {
                if !state.in_comment {
                    state.dollar_at = Some(i);
                }
            }
            '{' => {
                if state.in_comment {
                    continue;
                }
                match dollar_at {
                    Some(start) if !state.in_template => {
                        state.in_template = true;
                        state.depth = 0;
                        state.start = start;
                        state.start_row = row;
                    }
                    _ if state.in_template && !state.in_string() => state.depth += 1,
                    _ => {}
                }
            }
            '}' => {
                if state.in_template && !state.in_comment && !state.in_string() {
                    if state.depth == 0 {
                        let end = i + 1;
                        spans.push(ExpressionSpan {
                            text: source[state.start..end].to_string(),
                            start: state.start,
                            end,
                            start_row: state.start_row,
                        });
                        state = ScanState::default();
                    } else {
                        state.depth -= 1;
                    }
                }
            }
            '/' => {
                if state.in_template && !state.in_comment && !state.in_string() {
                    if pending_slash {
                        state.in_comment = true;
                    } else {
                        state.pending_slash = true;
                    }
                }
            }
            '\r' | '\n' => {
                state.in_comment = false;
                if c == '\n' {
                    row += 1;
                }
            }
            _ => {}
        }
    }

    spans
}

/// Span texts only
pub fn extract_scripts(source: &str) -> Vec<String> {
    extract(source).into_iter().map(|span| span.text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_braces_stay_in_one_span() {
        assert_eq!(extract_scripts("a ${ { x: 1 } } b"), vec!["${ { x: 1 } }"]);
    }

    #[test]
    fn test_brace_inside_string_does_not_close() {
        assert_eq!(extract_scripts("${ '}' + 1 }"), vec!["${ '}' + 1 }"]);
        assert_eq!(extract_scripts(r#"x ${ "{" } y"#), vec![r#"${ "{" }"#]);
    }

    #[test]
    fn test_escaped_quote_does_not_toggle() {
        assert_eq!(extract_scripts(r"${ 'it\'s }' }!"), vec![r"${ 'it\'s }' }"]);
    }

    #[test]
    fn test_general_script_span() {
        let text = "before ${{ return 1; }} after ${ this.name }";
        let spans = extract(text);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].text, "${{ return 1; }}");
        assert_eq!(&text[spans[0].start..spans[0].end], spans[0].text);
        assert_eq!(spans[1].text, "${ this.name }");
    }

    #[test]
    fn test_line_comment_hides_braces_until_newline() {
        let text = "${{\n  // closing } here is ignored\n  return 1;\n}}";
        assert_eq!(extract_scripts(text), vec![text]);
    }

    #[test]
    fn test_unterminated_span_is_dropped() {
        assert!(extract_scripts("a ${ unterminated { b").is_empty());
        assert_eq!(extract_scripts("${ ok } and ${ broken"), vec!["${ ok }"]);
    }

    #[test]
    fn test_dollar_must_precede_brace() {
        assert!(extract_scripts("costs $ {5} or {x}").is_empty());
        assert_eq!(extract_scripts("$${a}"), vec!["${a}"]);
    }

    #[test]
    fn test_start_row_counts_lines() {
        let spans = extract("line one\nline ${ two }\n${three}");
        assert_eq!(spans[0].start_row, 1);
        assert_eq!(spans[1].start_row, 2);
    }

    #[test]
    fn test_extraction_is_repeatable() {
        let text = "x ${a} ${{ b({c}) }} ${ 'd}' } ${";
        assert_eq!(extract(text), extract(text));
        assert_eq!(extract(text).len(), 3);
    }
}
