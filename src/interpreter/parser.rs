use super::ast::{BinaryOp, BoolOp, Call, Expr, FStringPart, ParsedStatement, Stmt, Target, UnaryOp};
use super::lexer::{Tok, Token, tokenize};
use super::value::Value;
use super::SyntaxError;

type ParseResult<T> = std::result::Result<T, SyntaxError>;

const UNSUPPORTED_STATEMENTS: &[&str] = &[
    "def", "class", "return", "import", "from", "try", "except", "finally", "with", "yield",
    "del", "global", "nonlocal", "async", "raise", "assert", "lambda", "match",
];

const RESERVED: &[&str] = &[
    "and", "or", "not", "in", "is", "if", "elif", "else", "while", "for", "break", "continue",
    "pass", "await",
];

/// Parse source text into top-level statements with their source spans.
///
/// Spans start at the beginning of the statement's first line and end just
/// past the newline of its last line, so `source[..span.end]` is exactly the
/// text consumed once the statement has run.
pub fn parse_statements(source: &str) -> ParseResult<Vec<ParsedStatement>> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens);
    let mut statements = Vec::new();

    loop {
        match parser.peek() {
            Tok::Eof => break,
            Tok::Newline => {
                parser.advance();
                continue;
            }
            Tok::Indent => return Err(parser.error("unexpected indent")),
            Tok::Dedent => return Err(parser.error("unexpected dedent")),
            _ => {}
        }

        let first = parser.current().offset;
        let start = source[..first].rfind('\n').map_or(0, |idx| idx + 1);
        let stmt = parser.parse_statement()?;
        let end = parser.last_newline_end.max(start);
        statements.push(ParsedStatement {
            stmt,
            span: start..end,
        });
    }

    Ok(statements)
}

/// Parse a single expression (used for f-string interpolation).
pub fn parse_expression(source: &str) -> ParseResult<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    match parser.peek() {
        Tok::Newline | Tok::Eof => Ok(expr),
        other => Err(parser.error(&format!("unexpected {} after expression", describe(other)))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    last_newline_end: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            last_newline_end: 0,
        }
    }

    fn current(&self) -> &Token {
        let idx = self.pos.min(self.tokens.len().saturating_sub(1));
        &self.tokens[idx]
    }

    fn peek(&self) -> &Tok {
        &self.current().tok
    }

    fn peek_at(&self, ahead: usize) -> &Tok {
        let idx = (self.pos + ahead).min(self.tokens.len().saturating_sub(1));
        &self.tokens[idx].tok
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if token.tok == Tok::Newline {
            self.last_newline_end = token.offset;
        }
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(current) if *current == op)
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.peek(), Tok::Name(current) if current == word)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.is_word(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> ParseResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}', found {}", op, describe(self.peek()))))
        }
    }

    fn expect_newline(&mut self) -> ParseResult<()> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            other => Err(self.error(&format!("expected end of line, found {}", describe(other)))),
        }
    }

    fn expect_name(&mut self) -> ParseResult<String> {
        match self.peek().clone() {
            Tok::Name(name) if !RESERVED.contains(&name.as_str()) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(&format!("expected a name, found {}", describe(&other)))),
        }
    }

    fn error(&self, message: &str) -> SyntaxError {
        SyntaxError::new(self.current().line, message)
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        if let Tok::Name(word) = self.peek().clone() {
            match word.as_str() {
                "if" => return self.parse_if(),
                "while" => return self.parse_while(),
                "for" => return self.parse_for(),
                "elif" | "else" => {
                    return Err(self.error(&format!("`{}` without a matching `if`", word)));
                }
                other if UNSUPPORTED_STATEMENTS.contains(&other) => {
                    return Err(self.error(&format!(
                        "unsupported statement `{}`: only assignments, awaited calls and if/while/for blocks are allowed",
                        other
                    )));
                }
                _ => {}
            }
        }

        let stmt = self.parse_simple()?;
        self.expect_newline()?;
        Ok(stmt)
    }

    fn parse_simple(&mut self) -> ParseResult<Stmt> {
        if self.eat_word("pass") {
            return Ok(Stmt::Pass);
        }
        if self.eat_word("break") {
            return Ok(Stmt::Break);
        }
        if self.eat_word("continue") {
            return Ok(Stmt::Continue);
        }
        if self.eat_word("await") {
            let call = self.parse_await_call()?;
            return Ok(Stmt::Await { target: None, call });
        }

        let expr = self.parse_expr()?;

        if self.eat_op("=") {
            let target = self.to_target(expr)?;
            if self.eat_word("await") {
                let call = self.parse_await_call()?;
                return Ok(Stmt::Await {
                    target: Some(target),
                    call,
                });
            }
            let value = self.parse_expr()?;
            if self.is_op("=") {
                return Err(self.error("chained assignment is not supported"));
            }
            return Ok(Stmt::Assign { target, value });
        }

        let aug = match self.peek() {
            Tok::Op("+=") => Some(BinaryOp::Add),
            Tok::Op("-=") => Some(BinaryOp::Sub),
            Tok::Op("*=") => Some(BinaryOp::Mul),
            Tok::Op("/=") => Some(BinaryOp::Div),
            Tok::Op("//=") => Some(BinaryOp::FloorDiv),
            Tok::Op("%=") => Some(BinaryOp::Mod),
            _ => None,
        };
        if let Some(op) = aug {
            self.advance();
            let target = self.to_target(expr)?;
            let value = self.parse_expr()?;
            return Ok(Stmt::AugAssign { target, op, value });
        }

        Ok(Stmt::Expr(expr))
    }

    fn parse_await_call(&mut self) -> ParseResult<Call> {
        match self.parse_expr()? {
            Expr::Call(call) => Ok(call),
            _ => Err(self.error("`await` must be followed by a call such as `await Say(...)`")),
        }
    }

    fn to_target(&self, expr: Expr) -> ParseResult<Target> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::StateVar(name) => Ok(Target::StateVar(name)),
            Expr::Index { value, index } => Ok(Target::Index {
                container: Box::new(self.to_target(*value)?),
                index: *index,
            }),
            _ => Err(self.error("cannot assign to this expression")),
        }
    }

    fn parse_suite(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Tok::Newline) {
            let stmt = self.parse_simple()?;
            self.expect_newline()?;
            return Ok(vec![stmt]);
        }
        self.advance();
        if !matches!(self.peek(), Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();

        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.advance();
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                _ => body.push(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        self.advance();
        let mut branches = Vec::new();
        let condition = self.parse_expr()?;
        let body = self.parse_suite()?;
        branches.push((condition, body));

        let mut orelse = Vec::new();
        loop {
            if self.eat_word("elif") {
                let condition = self.parse_expr()?;
                let body = self.parse_suite()?;
                branches.push((condition, body));
            } else if self.eat_word("else") {
                orelse = self.parse_suite()?;
                break;
            } else {
                break;
            }
        }

        Ok(Stmt::If { branches, orelse })
    }

    fn parse_while(&mut self) -> ParseResult<Stmt> {
        self.advance();
        let condition = self.parse_expr()?;
        let body = self.parse_suite()?;
        Ok(Stmt::While { condition, body })
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        self.advance();
        let var = self.expect_name()?;
        if !self.eat_word("in") {
            return Err(self.error("expected `in` after the loop variable"));
        }
        let iter = self.parse_expr()?;
        let body = self.parse_suite()?;
        Ok(Stmt::For { var, iter, body })
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_word("or") {
            let right = self.parse_and()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_word("and") {
            let right = self.parse_not()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if self.eat_word("not") {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<BinaryOp> {
        let op = match self.peek().clone() {
            Tok::Op("==") => BinaryOp::Eq,
            Tok::Op("!=") => BinaryOp::NotEq,
            Tok::Op("<") => BinaryOp::Lt,
            Tok::Op("<=") => BinaryOp::LtE,
            Tok::Op(">") => BinaryOp::Gt,
            Tok::Op(">=") => BinaryOp::GtE,
            Tok::Name(word) if word == "in" => BinaryOp::In,
            Tok::Name(word) if word == "not" => {
                if matches!(self.peek_at(1), Tok::Name(next) if next == "in") {
                    self.advance();
                    BinaryOp::NotIn
                } else {
                    return None;
                }
            }
            Tok::Name(word) if word == "is" => {
                if matches!(self.peek_at(1), Tok::Name(next) if next == "not") {
                    self.advance();
                    BinaryOp::NotEq
                } else {
                    BinaryOp::Eq
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let left = self.parse_additive()?;
        let Some(op) = self.comparison_op() else {
            return Ok(left);
        };
        let right = self.parse_additive()?;
        if self.comparison_op().is_some() {
            return Err(self.error("chained comparisons are not supported; combine them with `and`"));
        }
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinaryOp::Add,
                Tok::Op("-") => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinaryOp::Mul,
                Tok::Op("/") => BinaryOp::Div,
                Tok::Op("//") => BinaryOp::FloorDiv,
                Tok::Op("%") => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        if self.eat_op("-") {
            let operand = self.parse_unary()?;
            return Ok(match operand {
                Expr::Literal(Value::Int(num)) => Expr::Literal(Value::Int(-num)),
                Expr::Literal(Value::Float(num)) => Expr::Literal(Value::Float(-num)),
                other => Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(other),
                },
            });
        }
        if self.eat_op("+") {
            return self.parse_unary();
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            if self.is_op("(") {
                let Expr::Name(function) = expr else {
                    return Err(self.error("only named functions can be called"));
                };
                let (args, kwargs) = self.parse_call_args()?;
                expr = Expr::Call(Call {
                    function,
                    args,
                    kwargs,
                });
            } else if self.eat_op("[") {
                let index = self.parse_expr()?;
                if self.is_op(":") {
                    return Err(self.error("slices are not supported"));
                }
                self.expect_op("]")?;
                expr = Expr::Index {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let method = self.expect_name()?;
                if !self.is_op("(") {
                    return Err(self.error(&format!(
                        "attribute access `.{}` is only supported as a method call",
                        method
                    )));
                }
                let (args, kwargs) = self.parse_call_args()?;
                if !kwargs.is_empty() {
                    return Err(self.error("method calls take positional arguments only"));
                }
                expr = Expr::Method {
                    receiver: Box::new(expr),
                    method,
                    args,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> ParseResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        self.expect_op("(")?;
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.is_op(")") {
            let is_keyword = matches!(self.peek(), Tok::Name(_)) && matches!(self.peek_at(1), Tok::Op("="));
            if is_keyword {
                let name = self.expect_name()?;
                self.advance();
                kwargs.push((name, self.parse_expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.parse_expr()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn parse_atom(&mut self) -> ParseResult<Expr> {
        let token = self.current().clone();
        match token.tok {
            Tok::Int(num) => {
                self.advance();
                Ok(Expr::Literal(Value::Int(num)))
            }
            Tok::Float(num) => {
                self.advance();
                Ok(Expr::Literal(Value::Float(num)))
            }
            Tok::Str(text) => {
                self.advance();
                let mut text = text;
                while let Tok::Str(next) = self.peek().clone() {
                    text.push_str(&next);
                    self.advance();
                }
                Ok(Expr::Literal(Value::Str(text)))
            }
            Tok::FStr(body) => {
                self.advance();
                parse_fstring(&body, token.line)
            }
            Tok::StateVar(name) => {
                self.advance();
                Ok(Expr::StateVar(name))
            }
            Tok::Name(name) => match name.clone().as_str() {
                "True" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Bool(true)))
                }
                "False" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Bool(false)))
                }
                "None" => {
                    self.advance();
                    Ok(Expr::Literal(Value::None))
                }
                "await" => Err(self.error(
                    "`await` is only allowed at the start of a statement or as an assignment value",
                )),
                word if RESERVED.contains(&word) || UNSUPPORTED_STATEMENTS.contains(&word) => {
                    Err(self.error(&format!("unexpected keyword `{}`", word)))
                }
                _ => {
                    self.advance();
                    Ok(Expr::Name(name))
                }
            },
            Tok::Op("(") => {
                self.advance();
                let inner = self.parse_expr()?;
                if self.is_op(",") {
                    return Err(self.error("tuples are not supported; use a list"));
                }
                self.expect_op(")")?;
                Ok(inner)
            }
            Tok::Op("[") => {
                self.advance();
                let mut items = Vec::new();
                while !self.is_op("]") {
                    items.push(self.parse_expr()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                self.advance();
                let mut entries = Vec::new();
                while !self.is_op("}") {
                    let key = self.parse_expr()?;
                    if !self.is_op(":") {
                        return Err(self.error("sets are not supported; dict entries need `key: value`"));
                    }
                    self.advance();
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(entries))
            }
            other => Err(self.error(&format!("unexpected {}", describe(&other)))),
        }
    }
}

/// Split an f-string body into literal text and interpolated expressions.
///
/// `{expr!r}` maps to `repr(expr)` and `{expr:spec}` to `format(expr, spec)`.
fn parse_fstring(body: &str, line: usize) -> ParseResult<Expr> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let chars: Vec<char> = body.chars().collect();
    let mut idx = 0;

    while idx < chars.len() {
        let ch = chars[idx];
        match ch {
            '{' if chars.get(idx + 1) == Some(&'{') => {
                text.push('{');
                idx += 2;
            }
            '}' if chars.get(idx + 1) == Some(&'}') => {
                text.push('}');
                idx += 2;
            }
            '}' => return Err(SyntaxError::new(line, "single '}' is not allowed in an f-string")),
            '{' => {
                let close = find_closing_brace(&chars, idx + 1)
                    .ok_or_else(|| SyntaxError::new(line, "f-string: expecting '}'"))?;
                let inner: String = chars[idx + 1..close].iter().collect();
                if !text.is_empty() {
                    parts.push(FStringPart::Text(std::mem::take(&mut text)));
                }
                parts.push(FStringPart::Expr(parse_replacement_field(&inner, line)?));
                idx = close + 1;
            }
            other => {
                text.push(other);
                idx += 1;
            }
        }
    }

    if !text.is_empty() {
        parts.push(FStringPart::Text(text));
    }
    Ok(Expr::FString(parts))
}

fn find_closing_brace(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (offset, ch) in chars[start..].iter().enumerate() {
        if let Some(open) = quote {
            if *ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(*ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' if depth == 0 => return Some(start + offset),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn parse_replacement_field(inner: &str, line: usize) -> ParseResult<Expr> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut expr_end = inner.len();
    let mut conversion: Option<char> = None;
    let mut spec: Option<String> = None;
    let bytes = inner.as_bytes();

    for (pos, ch) in inner.char_indices() {
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            '!' if depth == 0 && bytes.get(pos + 1) != Some(&b'=') => {
                expr_end = pos;
                conversion = inner[pos + 1..].chars().next();
                if let Some(colon) = inner[pos..].find(':') {
                    spec = Some(inner[pos + colon + 1..].to_string());
                }
                break;
            }
            ':' if depth == 0 => {
                expr_end = pos;
                spec = Some(inner[pos + 1..].to_string());
                break;
            }
            _ => {}
        }
    }

    let source = inner[..expr_end].trim();
    if source.is_empty() {
        return Err(SyntaxError::new(line, "f-string: empty expression not allowed"));
    }
    let mut expr = parse_expression(source).map_err(|err| SyntaxError::new(line, err.message))?;

    if conversion == Some('r') {
        expr = Expr::Call(Call {
            function: "repr".into(),
            args: vec![expr],
            kwargs: Vec::new(),
        });
    }
    if let Some(spec) = spec.filter(|spec| !spec.is_empty()) {
        expr = Expr::Call(Call {
            function: "format".into(),
            args: vec![expr, Expr::Literal(Value::Str(spec))],
            kwargs: Vec::new(),
        });
    }
    Ok(expr)
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Name(name) => format!("`{}`", name),
        Tok::StateVar(name) => format!("`${}`", name),
        Tok::Int(num) => format!("number {}", num),
        Tok::Float(num) => format!("number {}", num),
        Tok::Str(_) | Tok::FStr(_) => "string literal".to_string(),
        Tok::Op(op) => format!("'{}'", op),
        Tok::Newline => "end of line".to_string(),
        Tok::Indent => "indent".to_string(),
        Tok::Dedent => "dedent".to_string(),
        Tok::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assignments_and_awaits() {
        let src = "x = 10\nawait Say('hi')\nreply = await WaitForMessage('Buyer')\n";
        let stmts = parse_statements(src).expect("parse");
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[0].stmt, Stmt::Assign { .. }));
        assert!(matches!(stmts[1].stmt, Stmt::Await { target: None, .. }));
        assert!(matches!(
            stmts[2].stmt,
            Stmt::Await {
                target: Some(Target::Name(_)),
                ..
            }
        ));
    }

    #[test]
    fn spans_cover_whole_lines() {
        let src = "x = 1\nif x:\n    y = 2\n    z = 3\nw = 4\n";
        let stmts = parse_statements(src).expect("parse");
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0].text(src), "x = 1\n");
        assert_eq!(stmts[1].text(src), "if x:\n    y = 2\n    z = 3\n");
        assert_eq!(stmts[2].text(src), "w = 4\n");
    }

    #[test]
    fn await_inside_expression_is_rejected() {
        let err = parse_statements("x = 1 + await Foo()\n").unwrap_err();
        assert!(err.message.contains("await"));
    }

    #[test]
    fn parses_if_elif_else_chain() {
        let src = "if a == 1:\n    b = 1\nelif a == 2:\n    b = 2\nelse:\n    b = 3\n";
        let stmts = parse_statements(src).expect("parse");
        assert_eq!(stmts.len(), 1);
        let Stmt::If { branches, orelse } = &stmts[0].stmt else {
            panic!("expected if");
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(orelse.len(), 1);
    }

    #[test]
    fn parses_fstring_with_format_spec() {
        let expr = parse_expression("f'total {price * 2:.2f} for {name!r}'").expect("parse");
        let Expr::FString(parts) = expr else {
            panic!("expected f-string");
        };
        assert_eq!(parts.len(), 4);
        assert!(matches!(&parts[1], FStringPart::Expr(Expr::Call(call)) if call.function == "format"));
        assert!(matches!(&parts[3], FStringPart::Expr(Expr::Call(call)) if call.function == "repr"));
    }

    #[test]
    fn rejects_unsupported_statements() {
        let err = parse_statements("def f():\n    pass\n").unwrap_err();
        assert!(err.message.contains("unsupported statement"));
    }

    #[test]
    fn keyword_arguments_are_collected() {
        let stmts = parse_statements("await Say(target='user', message='hi')\n").expect("parse");
        let Stmt::Await { call, .. } = &stmts[0].stmt else {
            panic!("expected await");
        };
        assert!(call.args.is_empty());
        assert_eq!(call.kwargs.len(), 2);
    }
}
