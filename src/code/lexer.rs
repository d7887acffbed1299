use super::syntax::Pos;

/// An error in an embedded code fragment, positioned relative to the fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CodeError {
    pub pos: Pos,
    pub message: String,
}

pub(crate) type CodeResult<T> = Result<T, CodeError>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub pos: Pos,
}

/// Longest operators first so that prefix matching picks `//=` over `//`.
const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "(",
    ")", "[", "]", "{", "}", ",", ":", ".", ";", "+", "-", "*", "/", "%", "<", ">", "=", "|",
];

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// The starting location of the current line
    line_start_pos: usize,
    /// Open bracket depth; newlines inside brackets are insignificant.
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            line: 1,
            line_start_pos: 0,
            depth: 0,
            indents: vec![0],
            tokens: Vec::new(),
        }
    }

    #[inline]
    fn current_pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.input[self.line_start_pos..self.pos].chars().count() + 1,
        }
    }

    #[inline]
    fn make_error(&self, message: impl Into<String>) -> CodeError {
        CodeError {
            pos: self.current_pos(),
            message: message.into(),
        }
    }

    #[inline]
    fn advance_by_char(&mut self, current_char: char) {
        if current_char == '\n' {
            self.line += 1;
            self.line_start_pos = self.pos + 1;
        }
        self.pos += current_char.len_utf8();
    }

    fn eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_char_at(&self, offset: usize) -> Option<char> {
        self.input[self.pos..].chars().nth(offset)
    }

    fn peek(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }

    fn push(&mut self, tok: Tok, pos: Pos) {
        self.tokens.push(Token { tok, pos });
    }

    fn last_is_line_end(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline | Tok::Indent | Tok::Dedent)
        )
    }

    fn skip_to_line_end(&mut self) {
        while let Some(c) = self.peek_char() {
            if c == '\n' {
                break;
            }
            self.advance_by_char(c);
        }
    }

    /// Measures the indentation of a logical line and emits INDENT/DEDENT
    /// tokens. Returns false when the line is blank or a comment.
    fn handle_indentation(&mut self) -> CodeResult<bool> {
        let mut width = 0;
        while let Some(c) = self.peek_char() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\r' | '\x0c' => {}
                _ => break,
            }
            self.advance_by_char(c);
        }
        match self.peek_char() {
            None => return Ok(false),
            Some('#') => {
                self.skip_to_line_end();
                return Ok(false);
            }
            Some('\n') => {
                self.advance_by_char('\n');
                return Ok(false);
            }
            Some('\\') if self.peek_char_at(1) == Some('\n') => {
                self.advance_by_char('\\');
                self.advance_by_char('\n');
                return Ok(false);
            }
            _ => {}
        }

        let pos = self.current_pos();
        let top = self.indents.last().copied().unwrap_or(0);
        if width > top {
            self.indents.push(width);
            self.push(Tok::Indent, pos);
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Tok::Dedent, pos);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(self.make_error("unindent does not match any outer indentation level"));
            }
        }
        Ok(true)
    }

    fn lex_number(&mut self) -> CodeResult<()> {
        let pos = self.current_pos();
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '_' {
                self.advance_by_char(c);
            } else if c == '.'
                && !is_float
                && self.peek_char_at(1).is_some_and(|n| n.is_ascii_digit())
            {
                is_float = true;
                self.advance_by_char(c);
            } else if (c == 'e' || c == 'E')
                && self
                    .peek_char_at(1)
                    .is_some_and(|n| n.is_ascii_digit() || n == '-' || n == '+')
            {
                is_float = true;
                self.advance_by_char(c);
                if let Some(sign @ ('-' | '+')) = self.peek_char() {
                    self.advance_by_char(sign);
                }
            } else {
                break;
            }
        }
        let text: String = self.input[start..self.pos].chars().filter(|c| *c != '_').collect();
        let tok = if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.make_error(format!("invalid number literal '{text}'")))?
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.make_error(format!("invalid number literal '{text}'")))?
        };
        self.push(tok, pos);
        Ok(())
    }

    fn lex_string(&mut self, pos: Pos, raw: bool) -> CodeResult<()> {
        let Some(quote) = self.peek_char() else {
            return Err(self.make_error("expected string literal"));
        };
        let triple = if quote == '"' { self.peek("\"\"\"") } else { self.peek("'''") };
        let delimiter_len = if triple { 3 } else { 1 };
        for _ in 0..delimiter_len {
            self.advance_by_char(quote);
        }

        let mut value = String::new();
        loop {
            let Some(c) = self.peek_char() else {
                return Err(CodeError {
                    pos,
                    message: "unterminated string literal".to_string(),
                });
            };
            if c == quote && (!triple || self.peek(if quote == '"' { "\"\"\"" } else { "'''" })) {
                for _ in 0..delimiter_len {
                    self.advance_by_char(quote);
                }
                break;
            }
            if c == '\n' && !triple {
                return Err(CodeError {
                    pos,
                    message: "unterminated string literal".to_string(),
                });
            }
            self.advance_by_char(c);
            if c != '\\' || raw {
                value.push(c);
                continue;
            }

            let Some(escaped) = self.peek_char() else {
                continue;
            };
            self.advance_by_char(escaped);
            match escaped {
                '\n' => {}
                'n' => value.push('\n'),
                't' => value.push('\t'),
                'r' => value.push('\r'),
                '0' => value.push('\0'),
                '\\' => value.push('\\'),
                '\'' => value.push('\''),
                '"' => value.push('"'),
                'x' | 'u' => {
                    let len = if escaped == 'x' { 2 } else { 4 };
                    let digits: String = self.input[self.pos..].chars().take(len).collect();
                    let code = u32::from_str_radix(&digits, 16)
                        .ok()
                        .filter(|_| digits.len() == len)
                        .and_then(char::from_u32)
                        .ok_or_else(|| self.make_error(format!("invalid escape '\\{escaped}{digits}'")))?;
                    for d in digits.chars() {
                        self.advance_by_char(d);
                    }
                    value.push(code);
                }
                other => {
                    value.push('\\');
                    value.push(other);
                }
            }
        }
        self.push(Tok::Str(value), pos);
        Ok(())
    }

    fn lex_name(&mut self) -> CodeResult<()> {
        let pos = self.current_pos();
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.advance_by_char(c);
            } else {
                break;
            }
        }
        let name = &self.input[start..self.pos];
        let is_prefix = matches!(name, "r" | "R" | "u" | "U");
        if is_prefix && matches!(self.peek_char(), Some('\'' | '"')) {
            return self.lex_string(pos, name.eq_ignore_ascii_case("r"));
        }
        self.push(Tok::Name(name.to_string()), pos);
        Ok(())
    }

    fn lex_operator(&mut self) -> CodeResult<()> {
        let pos = self.current_pos();
        let Some(op) = OPERATORS.iter().find(|op| self.peek(op)) else {
            let found = self.peek_char().unwrap_or(' ');
            return Err(self.make_error(format!("unexpected character '{found}'")));
        };
        match *op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.pos += op.len();
        self.push(Tok::Op(op), pos);
        Ok(())
    }

    fn run(mut self) -> CodeResult<Vec<Token>> {
        let mut at_line_start = true;
        loop {
            if at_line_start && self.depth == 0 {
                if self.eof() {
                    break;
                }
                if !self.handle_indentation()? {
                    continue;
                }
                at_line_start = false;
            }

            while let Some(c @ (' ' | '\t' | '\r' | '\x0c')) = self.peek_char() {
                self.advance_by_char(c);
            }
            let Some(c) = self.peek_char() else {
                break;
            };

            match c {
                '#' => self.skip_to_line_end(),
                '\\' if self.peek_char_at(1) == Some('\n') => {
                    self.advance_by_char('\\');
                    self.advance_by_char('\n');
                }
                '\n' => {
                    let pos = self.current_pos();
                    self.advance_by_char('\n');
                    if self.depth == 0 {
                        if !self.last_is_line_end() {
                            self.push(Tok::Newline, pos);
                        }
                        at_line_start = true;
                    }
                }
                '0'..='9' => self.lex_number()?,
                '.' if self.peek_char_at(1).is_some_and(|n| n.is_ascii_digit()) => {
                    self.lex_number()?;
                }
                '\'' | '"' => {
                    let pos = self.current_pos();
                    self.lex_string(pos, false)?;
                }
                c if c.is_alphabetic() || c == '_' => self.lex_name()?,
                _ => self.lex_operator()?,
            }
        }

        let pos = self.current_pos();
        if !self.last_is_line_end() {
            self.push(Tok::Newline, pos);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, pos);
        }
        self.push(Tok::End, pos);
        Ok(self.tokens)
    }
}

/// Splits a code fragment into tokens, including the layout tokens
/// (`Newline`, `Indent`, `Dedent`) that delimit indentation-based suites.
pub(crate) fn tokenize(input: &str) -> CodeResult<Vec<Token>> {
    Lexer::new(input).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Tok> {
        tokenize(input).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_simple_expression() {
        assert_eq!(
            kinds("a + 1"),
            vec![
                Tok::Name("a".to_string()),
                Tok::Op("+"),
                Tok::Int(1),
                Tok::Newline,
                Tok::End
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_indentation_tokens() {
        assert_eq!(
            kinds("if x:\n    y = 1\nz"),
            vec![
                Tok::Name("if".to_string()),
                Tok::Name("x".to_string()),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".to_string()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".to_string()),
                Tok::Newline,
                Tok::End
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_newlines_inside_brackets_are_ignored() {
        assert_eq!(
            kinds("f(1,\n  2)"),
            vec![
                Tok::Name("f".to_string()),
                Tok::Op("("),
                Tok::Int(1),
                Tok::Op(","),
                Tok::Int(2),
                Tok::Op(")"),
                Tok::Newline,
                Tok::End
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_string_escapes_and_raw_strings() {
        assert_eq!(kinds(r#""a\nb""#)[0], Tok::Str("a\nb".to_string()));
        assert_eq!(kinds(r#"r"a\nb""#)[0], Tok::Str("a\\nb".to_string()));
        assert_eq!(kinds("'''x\ny'''")[0], Tok::Str("x\ny".to_string()));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_numbers() {
        assert_eq!(kinds("1_000")[0], Tok::Int(1000));
        assert_eq!(kinds("2.5")[0], Tok::Float(2.5));
        assert_eq!(kinds(".5")[0], Tok::Float(0.5));
        assert_eq!(kinds("1e3")[0], Tok::Float(1000.0));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unterminated_string_reports_start() {
        let err = tokenize("x = 'abc").unwrap_err();
        assert_eq!(err.pos, Pos { line: 1, column: 5 });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_bad_dedent() {
        let err = tokenize("if x:\n    a\n  b").unwrap_err();
        assert!(err.message.contains("unindent"));
    }
}
