//! Safe-prefix detection over a partially received oracle stream.
//!
//! The oracle's text arrives in arbitrary chunks. A prefix is safe to execute
//! when nothing that arrives later can change how it parses: every statement
//! in it is complete and the following text cannot extend the last one.

use super::ast::ParsedStatement;
use super::parser::parse_statements;

/// Keywords that continue the compound statement above them.
const CONTINUATION_KEYWORDS: &[&str] = &["elif", "else"];

/// Longest executable prefix found by [`find_safe_prefix`].
#[derive(Debug, Clone, PartialEq)]
pub struct SafeCut {
    /// Byte length of the prefix.
    pub end: usize,
    /// Statements in the prefix; spans are relative to the scanned text.
    pub statements: Vec<ParsedStatement>,
}

/// Find the longest prefix of `text` that consists of complete statements.
///
/// Only text up to the last newline is eligible. Cut points are tried from
/// the end backwards; a cut is accepted when the text after it cannot
/// continue the prefix's last statement and the prefix parses. Returns
/// `None` when no prefix holds at least one statement.
pub fn find_safe_prefix(text: &str) -> Option<SafeCut> {
    let limit = text.rfind('\n')? + 1;

    let mut cuts: Vec<usize> = text[..limit]
        .match_indices('\n')
        .map(|(idx, _)| idx + 1)
        .collect();
    cuts.reverse();

    for cut in cuts {
        let follower = next_significant_line(&text[cut..]);
        if let Some(line) = &follower {
            if !line.at_column_zero || line.continues_block() {
                continue;
            }
        }

        let Ok(statements) = parse_statements(&text[..cut]) else {
            continue;
        };
        let Some(last) = statements.last() else {
            // Only blank lines and comments before this cut; shorter cuts
            // cannot hold statements either.
            return None;
        };
        if follower.is_none() && last.stmt.is_compound() {
            continue;
        }

        return Some(SafeCut {
            end: cut,
            statements,
        });
    }

    None
}

struct FollowingLine<'a> {
    content: &'a str,
    at_column_zero: bool,
    complete: bool,
}

impl FollowingLine<'_> {
    fn continues_block(&self) -> bool {
        let word_len = self
            .content
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(self.content.len());
        let word = &self.content[..word_len];

        if CONTINUATION_KEYWORDS.contains(&word) {
            return true;
        }
        // A half-received line like `el` may still become `else`.
        !self.complete
            && word_len == self.content.len()
            && CONTINUATION_KEYWORDS.iter().any(|kw| kw.starts_with(word))
    }
}

fn next_significant_line(rest: &str) -> Option<FollowingLine<'_>> {
    let mut remaining = rest;
    while !remaining.is_empty() {
        let (line, complete, next) = match remaining.find('\n') {
            Some(idx) => (&remaining[..idx], true, &remaining[idx + 1..]),
            None => (remaining, false, ""),
        };
        let content = line.trim_start_matches([' ', '\t']);
        let blank = content.trim_end().is_empty() || content.starts_with('#');
        if !blank {
            return Some(FollowingLine {
                content,
                at_column_zero: content.len() == line.len(),
                complete,
            });
        }
        remaining = next;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cut_len(text: &str) -> Option<usize> {
        find_safe_prefix(text).map(|cut| cut.end)
    }

    #[test]
    fn ignores_partial_last_line() {
        let text = "x = 10\nawait Sa";
        let cut = find_safe_prefix(text).expect("x = 10 is complete");
        assert_eq!(cut.end, 7);
        assert_eq!(cut.statements.len(), 1);
    }

    #[test]
    fn waits_for_block_body_to_close() {
        assert_eq!(cut_len("if ready:\n    x = 1\n"), None);
        assert_eq!(cut_len("if ready:\n    x = 1\n    "), None);
        let text = "if ready:\n    x = 1\ny = 2\n";
        assert_eq!(cut_len(text), Some(text.len()));
    }

    #[test]
    fn executes_statements_before_an_open_block() {
        let text = "a = 1\nfor i in range(3):\n    a += i\n";
        assert_eq!(cut_len(text), Some(6));
    }

    #[test]
    fn holds_back_when_else_may_follow() {
        assert_eq!(cut_len("if a:\n    x = 1\nel"), None);
        assert_eq!(cut_len("if a:\n    x = 1\nelse:\n"), None);
        assert_eq!(cut_len("if a:\n    x = 1\nelsewhere = 3"), Some(16));
    }

    #[test]
    fn unterminated_string_is_not_safe() {
        assert_eq!(cut_len("s = '''abc\ndef\n"), None);
        assert_eq!(cut_len("x = 1\ns = '''abc\n"), Some(6));
    }

    #[test]
    fn open_bracket_is_not_safe() {
        assert_eq!(cut_len("items = [1,\n"), None);
        let text = "items = [1,\n    2]\n";
        assert_eq!(cut_len(text), Some(text.len()));
    }

    #[test]
    fn comments_alone_produce_nothing() {
        assert_eq!(cut_len("# thinking\n\n"), None);
        assert_eq!(cut_len(""), None);
    }
}
