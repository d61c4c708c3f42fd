//! Indentation-aware tokenizer for generated statements.

use super::SyntaxError;

/// Token kinds produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    /// Identifier or keyword.
    Name(String),
    /// `$name` agent-level variable.
    StateVar(String),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal with escapes resolved.
    Str(String),
    /// f-string body with escapes resolved (braces still present).
    FStr(String),
    /// Operator or delimiter.
    Op(&'static str),
    /// End of a logical line.
    Newline,
    /// Indentation increased.
    Indent,
    /// Indentation decreased.
    Dedent,
    /// End of input.
    Eof,
}

/// Token with its location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Token kind.
    pub tok: Tok,
    /// 1-based source line.
    pub line: usize,
    /// Byte offset where the token starts. For `Newline` this is the offset
    /// just past the line terminator.
    pub offset: usize,
}

const OPERATORS: &[&str] = &[
    "//=", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "//", "+", "-", "*", "/", "%",
    "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".",
];

/// Tokenize a complete source text.
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
    line: usize,
    indents: Vec<usize>,
    brackets: Vec<(u8, usize)>,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            index: 0,
            line: 1,
            indents: vec![0],
            brackets: Vec::new(),
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut at_line_start = true;
        while self.index < self.bytes.len() {
            if at_line_start && self.brackets.is_empty() {
                if !self.begin_logical_line()? {
                    continue;
                }
                at_line_start = false;
            }

            let ch = self.bytes[self.index];
            match ch {
                b' ' | b'\t' | b'\r' => self.index += 1,
                b'#' => self.skip_comment(),
                b'\\' if self.bytes.get(self.index + 1) == Some(&b'\n') => {
                    self.index += 2;
                    self.line += 1;
                }
                b'\n' => {
                    self.index += 1;
                    if self.brackets.is_empty() {
                        self.push(Tok::Newline, self.index);
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                b'"' | b'\'' => {
                    let start = self.index;
                    let text = self.read_string(false)?;
                    self.push(Tok::Str(text), start);
                }
                b'$' => self.read_state_var()?,
                b'0'..=b'9' => self.read_number()?,
                b'.' if self
                    .bytes
                    .get(self.index + 1)
                    .is_some_and(|next| next.is_ascii_digit()) =>
                {
                    self.read_number()?
                }
                c if c == b'_' || c.is_ascii_alphabetic() => self.read_name_or_prefixed_string()?,
                c if !c.is_ascii() => {
                    return Err(self.error("non-ASCII character outside a string literal"));
                }
                _ => self.read_operator()?,
            }
        }

        if let Some((open, line)) = self.brackets.last() {
            return Err(SyntaxError::new(
                *line,
                format!("'{}' was never closed", *open as char),
            ));
        }

        if !at_line_start {
            self.push(Tok::Newline, self.bytes.len());
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, self.bytes.len());
        }
        self.push(Tok::Eof, self.bytes.len());
        Ok(self.tokens)
    }

    /// Measure indentation of a fresh line and emit INDENT/DEDENT tokens.
    /// Returns `false` when the line is blank or comment-only and was skipped.
    fn begin_logical_line(&mut self) -> Result<bool, SyntaxError> {
        let mut width = 0usize;
        let mut cursor = self.index;
        while let Some(ch) = self.bytes.get(cursor) {
            match ch {
                b' ' => width += 1,
                b'\t' => width = (width / 8 + 1) * 8,
                b'\r' => {}
                _ => break,
            }
            cursor += 1;
        }

        match self.bytes.get(cursor) {
            None => {
                self.index = cursor;
                return Ok(false);
            }
            Some(b'\n') => {
                self.index = cursor + 1;
                self.line += 1;
                return Ok(false);
            }
            Some(b'#') => {
                self.index = cursor;
                self.skip_comment();
                if self.bytes.get(self.index) == Some(&b'\n') {
                    self.index += 1;
                    self.line += 1;
                }
                return Ok(false);
            }
            Some(_) => {}
        }

        self.index = cursor;
        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent, cursor);
        } else if width < current {
            while self.indents.last().is_some_and(|level| *level > width) {
                self.indents.pop();
                self.push(Tok::Dedent, cursor);
            }
            if self.indents.last() != Some(&width) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.bytes.get(self.index) {
            if *ch == b'\n' {
                break;
            }
            self.index += 1;
        }
    }

    fn read_state_var(&mut self) -> Result<(), SyntaxError> {
        let start = self.index;
        self.index += 1;
        let name_start = self.index;
        while self
            .bytes
            .get(self.index)
            .is_some_and(|c| *c == b'_' || c.is_ascii_alphanumeric())
        {
            self.index += 1;
        }
        if name_start == self.index {
            return Err(self.error("expected a variable name after '$'"));
        }
        let name = self.src[name_start..self.index].to_string();
        self.push(Tok::StateVar(name), start);
        Ok(())
    }

    fn read_name_or_prefixed_string(&mut self) -> Result<(), SyntaxError> {
        let start = self.index;
        while self
            .bytes
            .get(self.index)
            .is_some_and(|c| *c == b'_' || c.is_ascii_alphanumeric())
        {
            self.index += 1;
        }
        let word = &self.src[start..self.index];
        let next_is_quote = matches!(self.bytes.get(self.index), Some(b'"') | Some(b'\''));
        if next_is_quote {
            let lower = word.to_ascii_lowercase();
            let (is_format, is_raw) = match lower.as_str() {
                "f" => (true, false),
                "r" => (false, true),
                "fr" | "rf" => (true, true),
                "b" | "u" => (false, false),
                _ => return Err(self.error(&format!("unsupported string prefix '{}'", word))),
            };
            let text = self.read_string(is_raw)?;
            let tok = if is_format { Tok::FStr(text) } else { Tok::Str(text) };
            self.push(tok, start);
            return Ok(());
        }
        self.push(Tok::Name(word.to_string()), start);
        Ok(())
    }

    fn read_string(&mut self, raw: bool) -> Result<String, SyntaxError> {
        let quote = self.bytes[self.index];
        let start_line = self.line;
        let triple = self.bytes.get(self.index + 1) == Some(&quote)
            && self.bytes.get(self.index + 2) == Some(&quote);
        self.index += if triple { 3 } else { 1 };

        let mut buf = String::new();
        loop {
            let Some(ch) = self.src[self.index..].chars().next() else {
                return Err(SyntaxError::new(start_line, "unterminated string literal"));
            };
            let width = ch.len_utf8();

            if ch == quote as char {
                if !triple {
                    self.index += 1;
                    return Ok(buf);
                }
                if self.bytes.get(self.index + 1) == Some(&quote)
                    && self.bytes.get(self.index + 2) == Some(&quote)
                {
                    self.index += 3;
                    return Ok(buf);
                }
                buf.push(ch);
                self.index += 1;
                continue;
            }

            match ch {
                '\n' => {
                    if !triple {
                        return Err(SyntaxError::new(start_line, "unterminated string literal"));
                    }
                    self.line += 1;
                    buf.push('\n');
                    self.index += 1;
                }
                '\\' => {
                    let Some(next) = self.src[self.index + 1..].chars().next() else {
                        return Err(SyntaxError::new(start_line, "unterminated string literal"));
                    };
                    if raw {
                        buf.push('\\');
                        buf.push(next);
                    } else {
                        match next {
                            'n' => buf.push('\n'),
                            't' => buf.push('\t'),
                            'r' => buf.push('\r'),
                            '0' => buf.push('\0'),
                            '\\' => buf.push('\\'),
                            '\'' => buf.push('\''),
                            '"' => buf.push('"'),
                            '\n' => {}
                            other => {
                                buf.push('\\');
                                buf.push(other);
                            }
                        }
                    }
                    if next == '\n' {
                        self.line += 1;
                    }
                    self.index += 1 + next.len_utf8();
                }
                other => {
                    buf.push(other);
                    self.index += width;
                }
            }
        }
    }

    fn read_number(&mut self) -> Result<(), SyntaxError> {
        let start = self.index;
        let mut is_float = false;
        self.eat_digits();
        if self.bytes.get(self.index) == Some(&b'.')
            && self
                .bytes
                .get(self.index + 1)
                .is_none_or(|c| c.is_ascii_digit() || !c.is_ascii_alphabetic())
        {
            is_float = true;
            self.index += 1;
            self.eat_digits();
        }
        if matches!(self.bytes.get(self.index), Some(b'e') | Some(b'E')) {
            let mut cursor = self.index + 1;
            if matches!(self.bytes.get(cursor), Some(b'+') | Some(b'-')) {
                cursor += 1;
            }
            if self.bytes.get(cursor).is_some_and(u8::is_ascii_digit) {
                is_float = true;
                self.index = cursor;
                self.eat_digits();
            }
        }

        let text: String = self.src[start..self.index]
            .chars()
            .filter(|c| *c != '_')
            .collect();
        let tok = if is_float {
            Tok::Float(
                text.parse::<f64>()
                    .map_err(|_| self.error("invalid float literal"))?,
            )
        } else {
            Tok::Int(
                text.parse::<i64>()
                    .map_err(|_| self.error("integer literal out of range"))?,
            )
        };
        self.push(tok, start);
        Ok(())
    }

    fn eat_digits(&mut self) {
        while self
            .bytes
            .get(self.index)
            .is_some_and(|c| c.is_ascii_digit() || *c == b'_')
        {
            self.index += 1;
        }
    }

    fn read_operator(&mut self) -> Result<(), SyntaxError> {
        let rest = &self.src[self.index..];
        let Some(op) = OPERATORS.iter().copied().find(|op| rest.starts_with(*op)) else {
            let ch = rest.chars().next().unwrap_or('?');
            return Err(self.error(&format!("unexpected character '{}'", ch)));
        };

        let first = op.as_bytes()[0];
        match first {
            b'(' | b'[' | b'{' if op.len() == 1 => self.brackets.push((first, self.line)),
            b')' | b']' | b'}' if op.len() == 1 => {
                let expected = match first {
                    b')' => b'(',
                    b']' => b'[',
                    _ => b'{',
                };
                match self.brackets.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => return Err(self.error(&format!("unmatched '{}'", first as char))),
                }
            }
            _ => {}
        }

        let start = self.index;
        self.index += op.len();
        self.push(Tok::Op(op), start);
        Ok(())
    }

    fn push(&mut self, tok: Tok, offset: usize) {
        self.tokens.push(Token {
            tok,
            line: self.line,
            offset,
        });
    }

    fn error(&self, message: &str) -> SyntaxError {
        SyntaxError::new(self.line, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn emits_indent_and_dedent() {
        let toks = kinds("if x:\n    y = 1\nz = 2\n");
        assert!(toks.contains(&Tok::Indent));
        assert!(toks.contains(&Tok::Dedent));
        assert_eq!(toks.last(), Some(&Tok::Eof));
    }

    #[test]
    fn brackets_join_lines() {
        let toks = kinds("x = [\n  1,\n  2,\n]\n");
        let newlines = toks.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn unterminated_triple_string_is_an_error() {
        let err = tokenize("x = '''abc\nstill going\n").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn state_variables_and_fstrings() {
        let toks = kinds("$total = f'{a}!'\n");
        assert_eq!(toks[0], Tok::StateVar("total".into()));
        assert_eq!(toks[2], Tok::FStr("{a}!".into()));
    }

    #[test]
    fn newline_offsets_point_past_terminator() {
        let tokens = tokenize("a = 1\nb = 2\n").unwrap();
        let ends: Vec<usize> = tokens
            .iter()
            .filter(|t| t.tok == Tok::Newline)
            .map(|t| t.offset)
            .collect();
        assert_eq!(ends, vec![6, 12]);
    }
}
