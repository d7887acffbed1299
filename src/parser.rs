use indexmap::IndexMap;

use crate::{
    ast::{ControlLine, Node, Span, Tag, TagKind, TemplateRoot},
    error::{SyntaxError, SyntaxErrorKind},
    tags::TAGS,
};

type ParseResult<T> = Result<T, SyntaxError>;

const PRIMARY_KEYWORDS: [&str; 4] = ["for", "if", "while", "try"];

/// Which continuation keywords each primary control keyword accepts.
fn continuation_allowed(primary: &str, keyword: &str) -> bool {
    match primary {
        "if" => matches!(keyword, "elif" | "else"),
        "try" => matches!(keyword, "except" | "finally" | "else"),
        "for" => keyword == "else",
        _ => false,
    }
}

struct OpenTag {
    kind: TagKind,
    keyword: String,
    attributes: IndexMap<String, String>,
    span: Span,
}

struct ControlFrame {
    keyword: String,
    span: Span,
}

/// Nodes collected inside one tag (or the template root), with the control
/// lines still open within it.
struct Scope {
    tag: Option<OpenTag>,
    nodes: Vec<Node>,
    controls: Vec<ControlFrame>,
}

struct Parser<'a> {
    input: &'a str,
    uri: &'a str,
    pos: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// The starting location of the current line
    line_start_pos: usize,
    scopes: Vec<Scope>,
    page: Option<IndexMap<String, String>>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, uri: &'a str) -> Self {
        Parser {
            input,
            uri,
            pos: 0,
            line: 1,
            line_start_pos: 0,
            scopes: vec![Scope {
                tag: None,
                nodes: Vec::new(),
                controls: Vec::new(),
            }],
            page: None,
        }
    }

    #[inline]
    fn current_column(&self) -> usize {
        self.input[self.line_start_pos..self.pos].chars().count() + 1
    }

    #[inline]
    fn span(&self) -> Span {
        Span {
            line: self.line,
            column: self.current_column(),
        }
    }

    #[inline]
    fn error_at(&self, span: Span, kind: SyntaxErrorKind) -> SyntaxError {
        SyntaxError {
            uri: self.uri.to_string(),
            line: span.line,
            column: span.column,
            kind,
        }
    }

    #[inline]
    fn make_error(&self, kind: SyntaxErrorKind) -> SyntaxError {
        self.error_at(self.span(), kind)
    }

    /// Advances the parser position past `current_char`, updating line
    /// tracking if it is a newline.
    #[inline]
    fn advance_by_char(&mut self, current_char: char) {
        if current_char == '\n' {
            self.line += 1;
            self.line_start_pos = self.pos + 1;
        }
        self.pos += current_char.len_utf8();
    }

    /// Advances the parser position by `len` bytes.
    /// The skipped text must not contain newlines.
    #[inline]
    fn advance_bytes_no_newline(&mut self, len: usize) {
        self.pos += len;
    }

    /// Advances over `len` bytes that may contain newlines.
    fn advance_over(&mut self, len: usize) {
        let end = self.pos + len;
        while self.pos < end {
            match self.peek_char() {
                Some(c) => self.advance_by_char(c),
                None => break,
            }
        }
    }

    fn eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    fn peek_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn consume(&mut self, s: &str) -> bool {
        if self.peek(s) {
            self.advance_bytes_no_newline(s.len());
            true
        } else {
            false
        }
    }

    fn consume_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.advance_by_char(c);
            } else {
                break;
            }
        }
    }

    fn consume_while(&mut self, accept: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if !accept(c) || c == '\n' {
                break;
            }
            self.advance_by_char(c);
        }
        &self.input[start..self.pos]
    }

    fn scope(&mut self) -> &mut Scope {
        // The root scope is never popped.
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    fn push_node(&mut self, node: Node) {
        let nodes = &mut self.scope().nodes;
        if let (Node::Text { text, .. }, Some(Node::Text { text: previous, .. })) =
            (&node, nodes.last_mut())
        {
            previous.push_str(text);
            return;
        }
        nodes.push(node);
    }

    // --- Line-level constructs ---

    /// The current line with its leading spaces and tabs stripped, when the
    /// position is at the start of a line.
    fn line_body(&self) -> Option<(usize, &'a str)> {
        if self.pos != self.line_start_pos {
            return None;
        }
        let rest = self.rest();
        let body = rest.trim_start_matches([' ', '\t']);
        Some((rest.len() - body.len(), body))
    }

    fn at_line_construct(&self) -> bool {
        self.line_body().is_some_and(|(_, body)| {
            (body.starts_with('%') && !body.starts_with("%%")) || body.starts_with("##")
        })
    }

    /// Consumes the rest of the current line including its newline and
    /// returns it without the newline.
    fn consume_line(&mut self) -> &'a str {
        let rest = self.rest();
        let len = rest.find('\n').unwrap_or(rest.len());
        let line = &rest[..len];
        self.advance_bytes_no_newline(len);
        if self.peek_char() == Some('\n') {
            self.advance_by_char('\n');
        }
        line.strip_suffix('\r').unwrap_or(line)
    }

    fn parse_line_construct(&mut self) -> ParseResult<()> {
        let Some((indent, body)) = self.line_body() else {
            return Ok(());
        };
        self.advance_bytes_no_newline(indent);
        if body.starts_with("##") {
            let span = self.span();
            self.advance_bytes_no_newline(2);
            let text = self.consume_line().trim().to_string();
            self.push_node(Node::Comment { text, span });
            return Ok(());
        }

        let span = self.span();
        self.advance_bytes_no_newline(1);
        let text = self.consume_line().trim().to_string();
        let word: String = text
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();

        let (is_end, keyword) = match word.strip_prefix("end") {
            Some(rest) if PRIMARY_KEYWORDS.contains(&rest) => (true, rest.to_string()),
            _ => (false, word.clone()),
        };

        let controls = &mut self.scope().controls;
        if is_end {
            match controls.last() {
                None => {
                    return Err(self.error_at(
                        span,
                        SyntaxErrorKind::UnmatchedControl {
                            keyword,
                            found: word,
                        },
                    ));
                }
                Some(top) if top.keyword != keyword => {
                    let expected = top.keyword.clone();
                    return Err(self.error_at(
                        span,
                        SyntaxErrorKind::MismatchedControl {
                            expected,
                            found: word,
                        },
                    ));
                }
                Some(_) => {
                    controls.pop();
                }
            }
        } else if PRIMARY_KEYWORDS.contains(&keyword.as_str()) {
            controls.push(ControlFrame {
                keyword: keyword.clone(),
                span,
            });
        } else if matches!(keyword.as_str(), "elif" | "else" | "except" | "finally") {
            match controls.last() {
                None => {
                    return Err(self.error_at(
                        span,
                        SyntaxErrorKind::UnmatchedControl {
                            keyword: keyword.clone(),
                            found: text,
                        },
                    ));
                }
                Some(top) if !continuation_allowed(&top.keyword, &keyword) => {
                    let expected = top.keyword.clone();
                    return Err(self.error_at(
                        span,
                        SyntaxErrorKind::MismatchedControl {
                            expected,
                            found: keyword,
                        },
                    ));
                }
                Some(_) => {}
            }
        } else if !matches!(keyword.as_str(), "break" | "continue") {
            return Err(self.error_at(span, SyntaxErrorKind::InvalidControlKeyword(word)));
        }

        self.push_node(Node::ControlLine(ControlLine {
            keyword,
            is_end,
            text,
            span,
        }));
        Ok(())
    }

    // --- Text ---

    fn at_code_start(&self) -> bool {
        self.peek("<%!")
            || (self.peek("<%")
                && self.rest()[2..]
                    .chars()
                    .next()
                    .is_some_and(char::is_whitespace))
    }

    fn at_open_tag(&self) -> bool {
        self.peek("<%")
            && self.rest()[2..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphabetic() || c == '_')
    }

    fn at_close_tag(&self) -> bool {
        self.peek("</%")
            && self.rest()[3..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphabetic() || c == '_')
    }

    /// Parses a run of literal text up to the next construct.
    fn parse_text(&mut self) {
        let mut text = String::new();
        let start = self.pos;
        let span = self.span();
        while !self.eof() {
            if let Some((indent, body)) = self.line_body() {
                if body.starts_with("%%") {
                    text.push_str(&self.rest()[..indent]);
                    text.push('%');
                    self.advance_bytes_no_newline(indent + 2);
                    continue;
                }
                if self.pos != start && self.at_line_construct() {
                    break;
                }
            }
            if self.peek("${") || self.at_code_start() || self.at_open_tag() || self.at_close_tag()
            {
                break;
            }
            if self.peek("\\\n") {
                self.advance_bytes_no_newline(1);
                self.advance_by_char('\n');
                continue;
            }
            if self.peek("\\\r\n") {
                self.advance_bytes_no_newline(2);
                self.advance_by_char('\n');
                continue;
            }
            if let Some(c) = self.peek_char() {
                text.push(c);
                self.advance_by_char(c);
            }
        }
        if !text.is_empty() {
            self.push_node(Node::Text { text, span });
        }
    }

    // --- Expressions and code ---

    /// Scans to the `}` that closes a `${`, honouring nested brackets and
    /// string literals. Returns the enclosed text.
    fn scan_expression_body(&mut self, open: Span) -> ParseResult<&'a str> {
        let start = self.pos;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        loop {
            let Some(c) = self.peek_char() else {
                return Err(self.error_at(open, SyntaxErrorKind::UnterminatedExpression));
            };
            match (quote, c) {
                (Some(_), '\\') => {
                    self.advance_by_char(c);
                    if let Some(escaped) = self.peek_char() {
                        self.advance_by_char(escaped);
                    }
                    continue;
                }
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'' | '"') => quote = Some(c),
                (None, '(' | '[' | '{') => depth += 1,
                (None, ')' | ']') => depth = depth.saturating_sub(1),
                (None, '}') if depth == 0 => break,
                (None, '}') => depth -= 1,
                (None, _) => {}
            }
            self.advance_by_char(c);
        }
        let body = &self.input[start..self.pos];
        self.advance_bytes_no_newline(1);
        Ok(body)
    }

    fn parse_expression(&mut self) -> ParseResult<()> {
        let open = self.span();
        self.advance_bytes_no_newline(2);
        let span = self.span();
        let body = self.scan_expression_body(open)?;
        let mut parts = split_top_level(body, '|').into_iter();
        let code = parts.next().unwrap_or_default().to_string();
        let filters = parts
            .flat_map(|part| split_top_level(part, ','))
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        self.push_node(Node::Expression {
            code,
            filters,
            span,
        });
        Ok(())
    }

    fn parse_code(&mut self) -> ParseResult<()> {
        let open = self.span();
        let module_level = self.peek("<%!");
        self.advance_bytes_no_newline(if module_level { 3 } else { 2 });
        let span = self.span();
        let Some(len) = self.rest().find("%>") else {
            return Err(self.error_at(open, SyntaxErrorKind::UnterminatedCode));
        };
        let code = self.rest()[..len].to_string();
        self.advance_over(len);
        self.advance_bytes_no_newline(2);
        self.push_node(Node::Code {
            code,
            module_level,
            span,
        });
        Ok(())
    }

    // --- Tags ---

    fn read_attribute_value(&mut self, keyword: &str) -> ParseResult<String> {
        let quote = match self.peek_char() {
            Some(q @ ('"' | '\'')) => q,
            _ => {
                return Err(self.make_error(SyntaxErrorKind::MalformedTag {
                    tag: keyword.to_string(),
                    message: "expected a quoted attribute value".to_string(),
                }));
            }
        };
        self.advance_by_char(quote);
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            let Some(c) = self.peek_char() else {
                return Err(self.make_error(SyntaxErrorKind::MalformedTag {
                    tag: keyword.to_string(),
                    message: "unterminated attribute value".to_string(),
                }));
            };
            if depth == 0 && c == quote {
                break;
            }
            if self.peek("${") {
                depth += 1;
                self.advance_bytes_no_newline(2);
                continue;
            }
            if depth > 0 && c == '}' {
                depth -= 1;
            }
            self.advance_by_char(c);
        }
        let value = self.input[start..self.pos].to_string();
        self.advance_by_char(quote);
        Ok(value)
    }

    fn parse_open_tag(&mut self) -> ParseResult<()> {
        let span = self.span();
        self.advance_bytes_no_newline(2);
        let keyword = self
            .consume_while(|c| c.is_alphanumeric() || matches!(c, '_' | ':' | '.' | '-'))
            .to_string();

        let (kind, spec) = match keyword.split_once(':') {
            Some((namespace, def)) => (
                TagKind::CallNamespace {
                    namespace: namespace.to_string(),
                    def: def.to_string(),
                },
                None,
            ),
            None => match TAGS.get(keyword.as_str()) {
                Some(spec) => (spec.kind.clone(), Some(spec)),
                None => return Err(self.error_at(span, SyntaxErrorKind::UnknownTag(keyword))),
            },
        };

        let mut attributes = IndexMap::new();
        let self_closing = loop {
            self.consume_whitespace();
            if self.consume("/>") {
                break true;
            }
            if self.consume(">") {
                break false;
            }
            let name = self
                .consume_while(|c| c.is_alphanumeric() || c == '_' || c == '-')
                .to_string();
            if name.is_empty() {
                return Err(self.make_error(SyntaxErrorKind::MalformedTag {
                    tag: keyword,
                    message: "expected an attribute or the end of the tag".to_string(),
                }));
            }
            self.consume_whitespace();
            if !self.consume("=") {
                return Err(self.make_error(SyntaxErrorKind::MalformedTag {
                    tag: keyword,
                    message: format!("expected '=' after attribute '{name}'"),
                }));
            }
            self.consume_whitespace();
            let value = self.read_attribute_value(&keyword)?;
            attributes.insert(name, value);
        };

        if let Some(spec) = spec {
            let missing: Vec<String> = spec
                .required
                .iter()
                .filter(|name| !attributes.contains_key(**name))
                .map(|name| name.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(self.error_at(
                    span,
                    SyntaxErrorKind::MissingAttributes {
                        tag: keyword,
                        attributes: missing,
                    },
                ));
            }
            for (name, value) in &attributes {
                if !spec.allows(name) {
                    return Err(self.error_at(
                        span,
                        SyntaxErrorKind::InvalidAttribute {
                            tag: keyword,
                            attribute: name.clone(),
                        },
                    ));
                }
                if value.contains("${") && !spec.allows_expression(name) {
                    return Err(self.error_at(
                        span,
                        SyntaxErrorKind::ExpressionNotAllowed {
                            tag: keyword,
                            attribute: name.clone(),
                        },
                    ));
                }
            }
        }

        if kind == TagKind::Page {
            if self.page.is_some() {
                return Err(self.error_at(
                    span,
                    SyntaxErrorKind::Structure(
                        "only one <%page> tag is allowed per template".to_string(),
                    ),
                ));
            }
            self.page = Some(attributes.clone());
        }

        if spec.is_some_and(|s| s.raw_body) && !self_closing {
            let children = self.read_raw_body(&keyword, &kind, span)?;
            self.push_node(Node::Tag(Tag {
                kind,
                keyword,
                attributes,
                children,
                span,
            }));
        } else if self_closing {
            self.push_node(Node::Tag(Tag {
                kind,
                keyword,
                attributes,
                children: Vec::new(),
                span,
            }));
        } else {
            self.scopes.push(Scope {
                tag: Some(OpenTag {
                    kind,
                    keyword,
                    attributes,
                    span,
                }),
                nodes: Vec::new(),
                controls: Vec::new(),
            });
        }
        Ok(())
    }

    /// Reads a `<%text>` or `<%doc>` body verbatim up to its closing tag.
    fn read_raw_body(&mut self, keyword: &str, kind: &TagKind, open: Span) -> ParseResult<Vec<Node>> {
        let closing = format!("</%{keyword}");
        let mut search_from = 0;
        let len = loop {
            let Some(found) = self.rest()[search_from..].find(&closing) else {
                return Err(self.error_at(open, SyntaxErrorKind::UnclosedTag(keyword.to_string())));
            };
            let candidate = search_from + found;
            let after = self.rest()[candidate + closing.len()..].trim_start();
            if after.starts_with('>') {
                break candidate;
            }
            search_from = candidate + closing.len();
        };
        let span = self.span();
        let body = self.rest()[..len].to_string();
        self.advance_over(len);
        self.advance_bytes_no_newline(closing.len());
        self.consume_whitespace();
        self.consume(">");
        Ok(match kind {
            TagKind::Doc => vec![Node::DocComment { text: body, span }],
            _ if body.is_empty() => Vec::new(),
            _ => vec![Node::Text { text: body, span }],
        })
    }

    fn parse_close_tag(&mut self) -> ParseResult<()> {
        let span = self.span();
        self.advance_bytes_no_newline(3);
        let name = self
            .consume_while(|c| c.is_alphanumeric() || matches!(c, '_' | ':' | '.' | '-'))
            .to_string();
        self.consume_whitespace();
        if !self.consume(">") {
            return Err(self.make_error(SyntaxErrorKind::MalformedTag {
                tag: name,
                message: "expected '>' to end the closing tag".to_string(),
            }));
        }

        let scope = &self.scopes[self.scopes.len() - 1];
        let Some(open) = &scope.tag else {
            return Err(self.error_at(span, SyntaxErrorKind::UnexpectedCloseTag(name)));
        };
        if open.keyword != name {
            let kind = SyntaxErrorKind::MismatchedTag {
                expected: open.keyword.clone(),
                found: name,
                line: open.span.line,
                column: open.span.column,
            };
            return Err(self.error_at(span, kind));
        }
        if let Some(control) = scope.controls.last() {
            let (keyword, control_span) = (control.keyword.clone(), control.span);
            return Err(self.error_at(control_span, SyntaxErrorKind::UnterminatedControl(keyword)));
        }

        let Some(Scope {
            tag: Some(open),
            nodes,
            ..
        }) = self.scopes.pop()
        else {
            return Err(self.error_at(span, SyntaxErrorKind::UnexpectedCloseTag(name)));
        };
        self.push_node(Node::Tag(Tag {
            kind: open.kind,
            keyword: open.keyword,
            attributes: open.attributes,
            children: nodes,
            span: open.span,
        }));
        Ok(())
    }

    fn parse_nodes(&mut self) -> ParseResult<()> {
        while !self.eof() {
            if self.at_line_construct() {
                self.parse_line_construct()?;
            } else if self.peek("${") {
                self.parse_expression()?;
            } else if self.at_close_tag() {
                self.parse_close_tag()?;
            } else if self.at_code_start() {
                self.parse_code()?;
            } else if self.at_open_tag() {
                self.parse_open_tag()?;
            } else {
                self.parse_text();
            }
        }
        Ok(())
    }

    fn finish(mut self) -> ParseResult<TemplateRoot> {
        let scope = &self.scopes[self.scopes.len() - 1];
        if let Some(control) = scope.controls.last() {
            let (keyword, span) = (control.keyword.clone(), control.span);
            return Err(self.error_at(span, SyntaxErrorKind::UnterminatedControl(keyword)));
        }
        if let Some(open) = &scope.tag {
            let (keyword, span) = (open.keyword.clone(), open.span);
            return Err(self.error_at(span, SyntaxErrorKind::UnclosedTag(keyword)));
        }
        let nodes = self.scopes.pop().map(|s| s.nodes).unwrap_or_default();
        Ok(TemplateRoot {
            nodes,
            uri: self.uri.to_string(),
            page: self.page.unwrap_or_default(),
        })
    }
}

/// Splits `input` on `separator` wherever it appears outside brackets and
/// string literals.
pub(crate) fn split_top_level(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            c if c == separator && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Parses template source into its node tree, enforcing tag nesting and
/// control keyword pairing.
pub(crate) fn parse(input: &str, uri: &str) -> Result<TemplateRoot, SyntaxError> {
    let mut parser = Parser::new(input, uri);
    parser.parse_nodes()?;
    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! text {
        ($data:expr, $line:expr, $column:expr) => {
            Node::Text {
                text: $data.to_string(),
                span: Span {
                    line: $line,
                    column: $column,
                },
            }
        };
    }

    fn nodes(input: &str) -> Vec<Node> {
        parse(input, "memory:test").unwrap().nodes
    }

    fn error(input: &str) -> SyntaxError {
        parse(input, "memory:test").unwrap_err()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_input() {
        assert_eq!(nodes(""), vec![]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_plain_text() {
        assert_eq!(nodes("hello world\n"), vec![text!("hello world\n", 1, 1)]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_expression_with_filters() {
        assert_eq!(
            nodes("hello ${ name | h, trim }!"),
            vec![
                text!("hello ", 1, 1),
                Node::Expression {
                    code: " name ".to_string(),
                    filters: vec!["h".to_string(), "trim".to_string()],
                    span: Span { line: 1, column: 9 },
                },
                text!("!", 1, 26),
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_expression_with_nested_braces_and_strings() {
        let parsed = nodes("${ {'a': '}'}['a'] }");
        assert!(matches!(
            &parsed[0],
            Node::Expression { code, filters, .. } if code == " {'a': '}'}['a'] " && filters.is_empty()
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unterminated_expression() {
        let err = error("abc ${ x");
        assert_eq!(err.kind, SyntaxErrorKind::UnterminatedExpression);
        assert_eq!((err.line, err.column), (1, 5));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_control_lines() {
        let parsed = nodes("% for x in xs:\n  ${x}\n% endfor\n");
        assert_eq!(parsed.len(), 5);
        assert!(matches!(&parsed[0], Node::ControlLine(c) if c.keyword == "for" && c.is_primary()));
        assert!(matches!(&parsed[4], Node::ControlLine(c) if c.keyword == "for" && c.is_end));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_indented_control_lines_and_comments() {
        let parsed = nodes("  % if x:\n  ## note\nyes\n  % endif\n");
        assert!(matches!(&parsed[0], Node::ControlLine(c) if c.text == "if x:"));
        assert_eq!(
            parsed[1],
            Node::Comment {
                text: "note".to_string(),
                span: Span { line: 2, column: 3 },
            }
        );
        assert_eq!(parsed[2], text!("yes\n", 3, 1));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_double_percent_escape() {
        assert_eq!(nodes("%% not control\n"), vec![text!("% not control\n", 1, 1)]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_line_continuation() {
        assert_eq!(nodes("one \\\ntwo"), vec![text!("one two", 1, 1)]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_ternary_continuations() {
        let parsed = nodes("% if a:\n1\n% elif b:\n2\n% else:\n3\n% endif\n");
        assert_eq!(parsed.len(), 7);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_invalid_continuation() {
        let err = error("% for x in y:\n% elif z:\n% endfor\n");
        assert_eq!(
            err.kind,
            SyntaxErrorKind::MismatchedControl {
                expected: "for".to_string(),
                found: "elif".to_string(),
            }
        );
        assert_eq!(err.line, 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_while_has_no_continuations() {
        let err = error("% while x:\n% else:\n% endwhile\n");
        assert!(matches!(err.kind, SyntaxErrorKind::MismatchedControl { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_mismatched_end_keyword() {
        let err = error("% if x:\n% endfor\n");
        assert_eq!(
            err.kind,
            SyntaxErrorKind::MismatchedControl {
                expected: "if".to_string(),
                found: "endfor".to_string(),
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unterminated_control_reports_opening_line() {
        let err = error("a\n% for x in y:\nb\n");
        assert_eq!(err.kind, SyntaxErrorKind::UnterminatedControl("for".to_string()));
        assert_eq!((err.line, err.column), (2, 1));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_end_without_start() {
        let err = error("% endif\n");
        assert_eq!(
            err.kind,
            SyntaxErrorKind::UnmatchedControl {
                keyword: "if".to_string(),
                found: "endif".to_string(),
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_invalid_control_keyword() {
        let err = error("% frobnicate\n");
        assert_eq!(
            err.kind,
            SyntaxErrorKind::InvalidControlKeyword("frobnicate".to_string())
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_code_blocks() {
        let parsed = nodes("<%! import helpers %>\n<% x = 1 %>");
        assert!(matches!(&parsed[0], Node::Code { module_level: true, code, .. } if code == " import helpers "));
        assert!(matches!(&parsed[2], Node::Code { module_level: false, span, .. } if *span == Span { line: 2, column: 3 }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unterminated_code_block() {
        assert_eq!(error("<% x = 1").kind, SyntaxErrorKind::UnterminatedCode);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_def_tag_with_children() {
        let parsed = nodes("<%def name=\"foo(x)\">hi ${x}</%def>");
        let Node::Tag(tag) = &parsed[0] else {
            panic!("expected a tag");
        };
        assert_eq!(tag.kind, TagKind::Def);
        assert_eq!(tag.attribute("name"), Some("foo(x)"));
        assert_eq!(tag.children.len(), 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_self_closing_tag() {
        let parsed = nodes("<%include file=\"header.html\"/>after");
        assert!(matches!(&parsed[0], Node::Tag(t) if t.kind == TagKind::Include && t.children.is_empty()));
        assert_eq!(parsed[1], text!("after", 1, 31));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_tag() {
        let err = error("<%foo/>");
        assert_eq!(err.kind, SyntaxErrorKind::UnknownTag("foo".to_string()));
        assert_eq!(err.kind.to_string(), "No such tag: 'foo'");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_custom_namespace_tag() {
        let parsed = nodes("<%form:field name=\"${n}\">x</%form:field>");
        assert!(matches!(
            &parsed[0],
            Node::Tag(Tag { kind: TagKind::CallNamespace { namespace, def }, .. })
                if namespace == "form" && def == "field"
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_required_attribute() {
        let err = error("<%def>x</%def>");
        assert_eq!(
            err.kind,
            SyntaxErrorKind::MissingAttributes {
                tag: "def".to_string(),
                attributes: vec!["name".to_string()],
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_invalid_attribute() {
        let err = error("<%inherit file=\"a\" bogus=\"b\"/>");
        assert!(matches!(err.kind, SyntaxErrorKind::InvalidAttribute { ref attribute, .. } if attribute == "bogus"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_expression_not_allowed() {
        let err = error("<%def name=\"${x}()\">x</%def>");
        assert!(matches!(err.kind, SyntaxErrorKind::ExpressionNotAllowed { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_mismatched_close_tag_names_both() {
        let err = error("<%def name=\"a()\">\n<%block>x</%def>");
        assert_eq!(
            err.kind,
            SyntaxErrorKind::MismatchedTag {
                expected: "block".to_string(),
                found: "def".to_string(),
                line: 2,
                column: 1,
            }
        );
        assert_eq!((err.line, err.column), (2, 10));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unclosed_tag_reports_original_position() {
        let err = error("x\n  <%block name=\"a\">\nbody");
        assert_eq!(err.kind, SyntaxErrorKind::UnclosedTag("block".to_string()));
        assert_eq!((err.line, err.column), (2, 3));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unexpected_close_tag() {
        assert_eq!(
            error("</%def>").kind,
            SyntaxErrorKind::UnexpectedCloseTag("def".to_string())
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_control_cannot_straddle_tag() {
        let err = error("<%block>\n% if x:\n</%block>\n% endif\n");
        assert_eq!(err.kind, SyntaxErrorKind::UnterminatedControl("if".to_string()));
        assert_eq!(err.line, 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_raw_text_tag() {
        let parsed = nodes("<%text>${not parsed} <%def></%text>");
        assert!(matches!(
            &parsed[0],
            Node::Tag(t) if t.kind == TagKind::Text && t.children == vec![text!("${not parsed} <%def>", 1, 8)]
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_doc_tag() {
        let parsed = nodes("<%doc>\n  notes\n</%doc>");
        assert!(matches!(
            &parsed[0],
            Node::Tag(t) if t.children == vec![Node::DocComment {
                text: "\n  notes\n".to_string(),
                span: Span { line: 1, column: 7 },
            }]
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_single_page_tag() {
        let root = parse("<%page args=\"x\"/>", "memory:test").unwrap();
        assert_eq!(root.page.get("args").map(String::as_str), Some("x"));
        let err = error("<%page/><%page/>");
        assert!(matches!(err.kind, SyntaxErrorKind::Structure(_)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_percent_inside_text_is_literal() {
        assert_eq!(nodes("100% sure <%= x"), vec![text!("100% sure <%= x", 1, 1)]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_split_top_level() {
        assert_eq!(split_top_level("a | f(b|c) | 'x|y'", '|'), vec!["a ", " f(b|c) ", " 'x|y'"]);
    }
}
