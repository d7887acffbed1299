use std::sync::Arc;

use super::lexer::{CodeError, CodeResult, Tok, Token, tokenize};
use super::syntax::{
    Alias, Argument, BinOp, BoolOp, CmpOp, Comprehension, ExceptHandler, Expr, FunctionDef,
    Lambda, Literal, Param, Params, Pos, Stmt, UnaryOp,
};

const KEYWORDS: &[&str] = &[
    "and", "as", "break", "continue", "def", "elif", "else", "except", "finally", "for", "from",
    "if", "import", "in", "is", "lambda", "not", "or", "pass", "return", "try", "while", "True",
    "False", "None",
];

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
}

impl Parser {
    fn new(input: &str) -> CodeResult<Self> {
        Ok(Self {
            tokens: tokenize(input)?,
            idx: 0,
        })
    }

    fn peek(&self) -> &Tok {
        self.tokens.get(self.idx).map_or(&Tok::End, |t| &t.tok)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.idx + offset)
            .map_or(&Tok::End, |t| &t.tok)
    }

    fn pos(&self) -> Pos {
        self.tokens
            .get(self.idx)
            .or_else(|| self.tokens.last())
            .map_or_else(Pos::default, |t| t.pos)
    }

    fn make_error(&self, message: impl Into<String>) -> CodeError {
        CodeError {
            pos: self.pos(),
            message: message.into(),
        }
    }

    fn describe(tok: &Tok) -> String {
        match tok {
            Tok::Name(name) => format!("'{name}'"),
            Tok::Int(value) => value.to_string(),
            Tok::Float(value) => value.to_string(),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Op(op) => format!("'{op}'"),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::End => "end of input".to_string(),
        }
    }

    fn unexpected(&self, expected: &str) -> CodeError {
        self.make_error(format!(
            "expected {expected}, found {}",
            Self::describe(self.peek())
        ))
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.idx < self.tokens.len() {
            self.idx += 1;
        }
        tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> CodeResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{op}'")))
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> CodeResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{keyword}'")))
        }
    }

    fn expect_name(&mut self) -> CodeResult<String> {
        match self.peek() {
            Tok::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                let name = name.clone();
                self.idx += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.idx += 1;
        }
    }

    fn expect_end(&mut self) -> CodeResult<()> {
        self.skip_newlines();
        if matches!(self.peek(), Tok::End) {
            Ok(())
        } else {
            Err(self.unexpected("end of input"))
        }
    }

    // --- Statements ---

    fn parse_statements_until_end(&mut self) -> CodeResult<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::End => break,
                Tok::Indent => return Err(self.make_error("unexpected indent")),
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn parse_statement(&mut self) -> CodeResult<Vec<Stmt>> {
        let keyword = match self.peek() {
            Tok::Name(name) => name.clone(),
            _ => String::new(),
        };
        match keyword.as_str() {
            "if" => {
                self.idx += 1;
                Ok(vec![self.parse_if_tail()?])
            }
            "for" => Ok(vec![self.parse_for()?]),
            "while" => Ok(vec![self.parse_while()?]),
            "try" => Ok(vec![self.parse_try()?]),
            "def" => Ok(vec![self.parse_def()?]),
            _ => self.parse_simple_line(),
        }
    }

    /// `small_stmt (';' small_stmt)* NEWLINE`
    fn parse_simple_line(&mut self) -> CodeResult<Vec<Stmt>> {
        let mut stmts = vec![self.parse_small_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::End) {
                break;
            }
            stmts.push(self.parse_small_statement()?);
        }
        match self.peek() {
            Tok::Newline => {
                self.idx += 1;
                Ok(stmts)
            }
            Tok::End | Tok::Dedent => Ok(stmts),
            _ => Err(self.unexpected("end of statement")),
        }
    }

    fn parse_small_statement(&mut self) -> CodeResult<Stmt> {
        if self.eat_keyword("pass") {
            return Ok(Stmt::Pass);
        }
        if self.eat_keyword("break") {
            return Ok(Stmt::Break);
        }
        if self.eat_keyword("continue") {
            return Ok(Stmt::Continue);
        }
        if self.eat_keyword("return") {
            if matches!(self.peek(), Tok::Newline | Tok::End | Tok::Dedent) || self.at_op(";") {
                return Ok(Stmt::Return(None));
            }
            return Ok(Stmt::Return(Some(self.parse_testlist()?)));
        }
        if self.eat_keyword("import") {
            let mut names = vec![self.parse_alias(true)?];
            while self.eat_op(",") {
                names.push(self.parse_alias(true)?);
            }
            return Ok(Stmt::Import(names));
        }
        if self.eat_keyword("from") {
            let module = self.parse_dotted_name()?;
            self.expect_keyword("import")?;
            if self.eat_op("*") {
                return Ok(Stmt::ImportFrom {
                    module,
                    names: Vec::new(),
                    wildcard: true,
                });
            }
            let parenthesized = self.eat_op("(");
            let mut names = vec![self.parse_alias(false)?];
            while self.eat_op(",") {
                if parenthesized && self.at_op(")") {
                    break;
                }
                names.push(self.parse_alias(false)?);
            }
            if parenthesized {
                self.expect_op(")")?;
            }
            return Ok(Stmt::ImportFrom {
                module,
                names,
                wildcard: false,
            });
        }
        self.parse_expression_statement()
    }

    fn parse_dotted_name(&mut self) -> CodeResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn parse_alias(&mut self, dotted: bool) -> CodeResult<Alias> {
        let name = if dotted {
            self.parse_dotted_name()?
        } else {
            self.expect_name()?
        };
        let asname = if self.eat_keyword("as") {
            Some(self.expect_name()?)
        } else {
            None
        };
        Ok(Alias { name, asname })
    }

    fn parse_expression_statement(&mut self) -> CodeResult<Stmt> {
        let first = self.parse_testlist()?;
        let aug = match self.peek() {
            Tok::Op("+=") => Some(BinOp::Add),
            Tok::Op("-=") => Some(BinOp::Sub),
            Tok::Op("*=") => Some(BinOp::Mul),
            Tok::Op("/=") => Some(BinOp::Div),
            Tok::Op("//=") => Some(BinOp::FloorDiv),
            Tok::Op("%=") => Some(BinOp::Mod),
            _ => None,
        };
        if let Some(op) = aug {
            self.idx += 1;
            Self::check_target(&first).map_err(|m| self.make_error(m))?;
            let value = self.parse_testlist()?;
            return Ok(Stmt::AugAssign {
                target: first,
                op,
                value,
            });
        }
        if !self.at_op("=") {
            return Ok(Stmt::Expr(first));
        }

        let mut exprs = vec![first];
        while self.eat_op("=") {
            exprs.push(self.parse_testlist()?);
        }
        let value = exprs.pop().ok_or_else(|| self.make_error("missing assigned value"))?;
        for target in &exprs {
            Self::check_target(target).map_err(|m| self.make_error(m))?;
        }
        Ok(Stmt::Assign {
            targets: exprs,
            value,
        })
    }

    fn check_target(target: &Expr) -> Result<(), String> {
        match target {
            Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. } => Ok(()),
            Expr::Tuple(items) | Expr::List(items) => items.iter().try_for_each(Self::check_target),
            _ => Err("cannot assign to expression".to_string()),
        }
    }

    /// Parses the body of a compound statement after its `:`.
    fn parse_suite(&mut self) -> CodeResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Tok::Newline) {
            return self.parse_simple_line();
        }
        self.idx += 1;
        self.skip_newlines();
        if !matches!(self.peek(), Tok::Indent) {
            return Err(self.unexpected("an indented block"));
        }
        self.idx += 1;
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Dedent => {
                    self.idx += 1;
                    break;
                }
                Tok::End => break,
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn parse_if_tail(&mut self) -> CodeResult<Stmt> {
        let test = self.parse_test()?;
        let body = self.parse_suite()?;
        let orelse = if self.eat_keyword("elif") {
            vec![self.parse_if_tail()?]
        } else if self.eat_keyword("else") {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        Ok(Stmt::If { test, body, orelse })
    }

    fn parse_for(&mut self) -> CodeResult<Stmt> {
        self.expect_keyword("for")?;
        let target = self.parse_target_list()?;
        self.expect_keyword("in")?;
        let iter = self.parse_testlist()?;
        let body = self.parse_suite()?;
        let orelse = if self.eat_keyword("else") {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        Ok(Stmt::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn parse_while(&mut self) -> CodeResult<Stmt> {
        self.expect_keyword("while")?;
        let test = self.parse_test()?;
        let body = self.parse_suite()?;
        let orelse = if self.eat_keyword("else") {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        Ok(Stmt::While { test, body, orelse })
    }

    fn parse_try(&mut self) -> CodeResult<Stmt> {
        self.expect_keyword("try")?;
        let body = self.parse_suite()?;
        let mut handlers = Vec::new();
        while self.eat_keyword("except") {
            let class = if self.at_op(":") {
                None
            } else {
                Some(self.parse_test()?)
            };
            let name = if self.eat_keyword("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            let body = self.parse_suite()?;
            handlers.push(ExceptHandler { class, name, body });
        }
        let orelse = if !handlers.is_empty() && self.eat_keyword("else") {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_keyword("finally") {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.unexpected("'except' or 'finally'"));
        }
        Ok(Stmt::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    fn parse_def(&mut self) -> CodeResult<Stmt> {
        self.expect_keyword("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parse_params(")")?;
        self.expect_op(")")?;
        let body = self.parse_suite()?;
        Ok(Stmt::FunctionDef(Arc::new(FunctionDef { name, params, body })))
    }

    /// Parses formal parameters up to (not including) the `closing` operator.
    fn parse_params(&mut self, closing: &str) -> CodeResult<Params> {
        let mut params = Params::default();
        while !self.at_op(closing) && !matches!(self.peek(), Tok::End) {
            if self.eat_op("**") {
                params.kwargs = Some(self.expect_name()?);
            } else if self.eat_op("*") {
                params.varargs = Some(self.expect_name()?);
            } else {
                if params.varargs.is_some() || params.kwargs.is_some() {
                    return Err(self.make_error("parameter follows a variadic parameter"));
                }
                let name = self.expect_name()?;
                let default = if self.eat_op("=") {
                    Some(self.parse_test()?)
                } else {
                    if params.params.iter().any(|p| p.default.is_some()) {
                        return Err(
                            self.make_error("non-default parameter follows default parameter")
                        );
                    }
                    None
                };
                params.params.push(Param { name, default });
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    // --- Expressions ---
    // Precedence: lambda -> conditional -> or -> and -> not -> comparison
    // -> arithmetic -> term -> unary -> primary

    /// `test (',' test)* [',']`, producing a tuple when a comma is present.
    fn parse_testlist(&mut self) -> CodeResult<Expr> {
        let first = self.parse_test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_testlist_end() {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn at_testlist_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::End | Tok::Dedent)
            || [")", "]", "}", "=", ":", ";"].iter().any(|op| self.at_op(op))
    }

    /// Assignment targets for `for` loops and comprehensions; stops before `in`.
    fn parse_target_list(&mut self) -> CodeResult<Expr> {
        let first = self.parse_arith()?;
        let target = if self.at_op(",") {
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.at_keyword("in") {
                    break;
                }
                items.push(self.parse_arith()?);
            }
            Expr::Tuple(items)
        } else {
            first
        };
        Self::check_target(&target).map_err(|m| self.make_error(m))?;
        Ok(target)
    }

    fn parse_test(&mut self) -> CodeResult<Expr> {
        if self.eat_keyword("lambda") {
            let params = self.parse_params(":")?;
            self.expect_op(":")?;
            let body = self.parse_test()?;
            return Ok(Expr::Lambda(Arc::new(Lambda { params, body })));
        }
        let body = self.parse_or_expression()?;
        if !self.eat_keyword("if") {
            return Ok(body);
        }
        let test = self.parse_or_expression()?;
        self.expect_keyword("else")?;
        let orelse = self.parse_test()?;
        Ok(Expr::IfElse {
            test: Box::new(test),
            body: Box::new(body),
            orelse: Box::new(orelse),
        })
    }

    fn parse_or_expression(&mut self) -> CodeResult<Expr> {
        let mut left = self.parse_and_expression()?;
        while self.eat_keyword("or") {
            let right = self.parse_and_expression()?;
            left = Expr::Bool {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and_expression(&mut self) -> CodeResult<Expr> {
        let mut left = self.parse_not_expression()?;
        while self.eat_keyword("and") {
            let right = self.parse_not_expression()?;
            left = Expr::Bool {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not_expression(&mut self) -> CodeResult<Expr> {
        if self.eat_keyword("not") {
            let operand = self.parse_not_expression()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> CodeResult<Expr> {
        let left = self.parse_arith()?;
        let mut comparisons = Vec::new();
        loop {
            let (op, width) = match (self.peek(), self.peek_at(1)) {
                (Tok::Op("=="), _) => (CmpOp::Eq, 1),
                (Tok::Op("!="), _) => (CmpOp::NotEq, 1),
                (Tok::Op("<"), _) => (CmpOp::Lt, 1),
                (Tok::Op("<="), _) => (CmpOp::LtE, 1),
                (Tok::Op(">"), _) => (CmpOp::Gt, 1),
                (Tok::Op(">="), _) => (CmpOp::GtE, 1),
                (Tok::Name(n), Tok::Name(m)) if n == "is" && m == "not" => (CmpOp::IsNot, 2),
                (Tok::Name(n), _) if n == "is" => (CmpOp::Is, 1),
                (Tok::Name(n), Tok::Name(m)) if n == "not" && m == "in" => (CmpOp::NotIn, 2),
                (Tok::Name(n), _) if n == "in" => (CmpOp::In, 1),
                _ => break,
            };
            self.idx += width;
            comparisons.push((op, self.parse_arith()?));
        }
        if comparisons.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                comparisons,
            })
        }
    }

    fn parse_arith(&mut self) -> CodeResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.idx += 1;
            let right = self.parse_term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> CodeResult<Expr> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.idx += 1;
            let right = self.parse_factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> CodeResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            _ => return self.parse_primary_expression(),
        };
        self.idx += 1;
        let operand = self.parse_factor()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_primary_expression(&mut self) -> CodeResult<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else if self.eat_op("(") {
                let args = self.parse_arguments(")")?;
                self.expect_op(")")?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                let index = self.parse_subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_subscript(&mut self) -> CodeResult<Expr> {
        let lower = if self.at_op(":") {
            None
        } else {
            let index = self.parse_testlist()?;
            if !self.at_op(":") {
                return Ok(index);
            }
            Some(Box::new(index))
        };
        self.expect_op(":")?;
        let upper = if self.at_op(":") || self.at_op("]") {
            None
        } else {
            Some(Box::new(self.parse_test()?))
        };
        let step = if self.eat_op(":") && !self.at_op("]") {
            Some(Box::new(self.parse_test()?))
        } else {
            None
        };
        Ok(Expr::Slice { lower, upper, step })
    }

    /// Call arguments up to (not including) the `closing` operator.
    fn parse_arguments(&mut self, closing: &str) -> CodeResult<Vec<Argument>> {
        let mut args = Vec::new();
        while !self.at_op(closing) && !matches!(self.peek(), Tok::End) {
            if self.eat_op("**") {
                args.push(Argument::DoubleStar(self.parse_test()?));
            } else if self.eat_op("*") {
                args.push(Argument::Star(self.parse_test()?));
            } else if matches!(self.peek(), Tok::Name(_)) && matches!(self.peek_at(1), Tok::Op("="))
            {
                let name = self.expect_name()?;
                self.expect_op("=")?;
                args.push(Argument::Keyword(name, self.parse_test()?));
            } else {
                args.push(Argument::Positional(self.parse_test()?));
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(args)
    }

    fn parse_comprehension(&mut self, element: Expr) -> CodeResult<Expr> {
        let mut generators = Vec::new();
        while self.eat_keyword("for") {
            let target = self.parse_target_list()?;
            self.expect_keyword("in")?;
            let iter = self.parse_or_expression()?;
            let mut ifs = Vec::new();
            while self.eat_keyword("if") {
                ifs.push(self.parse_or_expression()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(Expr::ListComp {
            element: Box::new(element),
            generators,
        })
    }

    fn parse_atom(&mut self) -> CodeResult<Expr> {
        let start = self.idx;
        match self.advance() {
            Tok::Int(value) => Ok(Expr::Literal(Literal::Int(value))),
            Tok::Float(value) => Ok(Expr::Literal(Literal::Float(value))),
            Tok::Str(first) => {
                let mut value = first;
                while let Tok::Str(next) = self.peek() {
                    value.push_str(next);
                    self.idx += 1;
                }
                Ok(Expr::Literal(Literal::Str(value)))
            }
            Tok::Name(name) => match name.as_str() {
                "True" => Ok(Expr::Literal(Literal::Bool(true))),
                "False" => Ok(Expr::Literal(Literal::Bool(false))),
                "None" => Ok(Expr::Literal(Literal::None)),
                keyword if KEYWORDS.contains(&keyword) => {
                    self.idx = start;
                    Err(self.unexpected("expression"))
                }
                _ => Ok(Expr::Name(name)),
            },
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.parse_test()?;
                if self.at_keyword("for") {
                    let comp = self.parse_comprehension(first)?;
                    self.expect_op(")")?;
                    return Ok(comp);
                }
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op(")") {
                        break;
                    }
                    items.push(self.parse_test()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Tok::Op("[") => {
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_test()?;
                if self.at_keyword("for") {
                    let comp = self.parse_comprehension(first)?;
                    self.expect_op("]")?;
                    return Ok(comp);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op("]") {
                        break;
                    }
                    items.push(self.parse_test()?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                let mut entries = Vec::new();
                while !self.at_op("}") {
                    let key = self.parse_test()?;
                    self.expect_op(":")?;
                    let value = self.parse_test()?;
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(entries))
            }
            _ => {
                self.idx = start;
                Err(self.unexpected("expression"))
            }
        }
    }
}

/// Parses a block of statements.
pub(crate) fn parse_module(input: &str) -> CodeResult<Vec<Stmt>> {
    let mut parser = Parser::new(input)?;
    parser.parse_statements_until_end()
}

/// Parses a single expression; a top-level comma produces a tuple.
pub(crate) fn parse_expression(input: &str) -> CodeResult<Expr> {
    let mut parser = Parser::new(input.trim())?;
    parser.skip_newlines();
    let expr = parser.parse_testlist()?;
    parser.expect_end()?;
    Ok(expr)
}

/// Parses a definition signature such as `foo(a, b=1, **kw)`.
pub(crate) fn parse_signature(input: &str) -> CodeResult<(String, Params)> {
    let mut parser = Parser::new(input.trim())?;
    let name = parser.expect_name()?;
    let params = if parser.eat_op("(") {
        let params = parser.parse_params(")")?;
        parser.expect_op(")")?;
        params
    } else {
        Params::default()
    };
    parser.expect_end()?;
    Ok((name, params))
}

/// Parses a bare parameter list such as `a, b=1`.
pub(crate) fn parse_params(input: &str) -> CodeResult<Params> {
    let mut parser = Parser::new(input.trim())?;
    let params = parser.parse_params("\n")?;
    parser.expect_end()?;
    Ok(params)
}

/// Parses a bare argument list such as `x, y=2, **extra`.
pub(crate) fn parse_arguments(input: &str) -> CodeResult<Vec<Argument>> {
    let mut parser = Parser::new(input.trim())?;
    let args = parser.parse_arguments("\n")?;
    parser.expect_end()?;
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str) -> Expr {
        Expr::Name(n.to_string())
    }

    fn int(v: i64) -> Expr {
        Expr::Literal(Literal::Int(v))
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_operator_precedence() {
        assert_eq!(
            parse_expression("a + b * 2").unwrap(),
            Expr::Binary {
                op: BinOp::Add,
                left: Box::new(name("a")),
                right: Box::new(Expr::Binary {
                    op: BinOp::Mul,
                    left: Box::new(name("b")),
                    right: Box::new(int(2)),
                }),
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_not_in_and_is_not() {
        let Expr::Compare { comparisons, .. } = parse_expression("a not in b is not c").unwrap()
        else {
            panic!("expected comparison");
        };
        assert_eq!(comparisons[0].0, CmpOp::NotIn);
        assert_eq!(comparisons[1].0, CmpOp::IsNot);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_call_arguments() {
        let Expr::Call { args, .. } = parse_expression("f(1, x=2, *rest, **kw)").unwrap() else {
            panic!("expected call");
        };
        assert_eq!(
            args,
            vec![
                Argument::Positional(int(1)),
                Argument::Keyword("x".to_string(), int(2)),
                Argument::Star(name("rest")),
                Argument::DoubleStar(name("kw")),
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_conditional_and_lambda() {
        assert!(matches!(
            parse_expression("a if b else c").unwrap(),
            Expr::IfElse { .. }
        ));
        assert!(matches!(
            parse_expression("lambda x, y=1: x + y").unwrap(),
            Expr::Lambda(_)
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_list_comprehension() {
        let Expr::ListComp { generators, .. } =
            parse_expression("[x * 2 for x in items if x]").unwrap()
        else {
            panic!("expected comprehension");
        };
        assert_eq!(generators.len(), 1);
        assert_eq!(generators[0].ifs.len(), 1);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_slices() {
        assert!(matches!(
            parse_expression("a[1:]").unwrap(),
            Expr::Subscript { index, .. } if matches!(*index, Expr::Slice { upper: None, .. })
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_chained_and_tuple_assignment() {
        assert_eq!(
            parse_module("a = b = 1\nx, y = 1, 2").unwrap(),
            vec![
                Stmt::Assign {
                    targets: vec![name("a"), name("b")],
                    value: int(1),
                },
                Stmt::Assign {
                    targets: vec![Expr::Tuple(vec![name("x"), name("y")])],
                    value: Expr::Tuple(vec![int(1), int(2)]),
                },
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_compound_statements() {
        let stmts = parse_module(
            "for x in xs:\n    if x:\n        pass\n    elif y:\n        break\n    else:\n        continue\nelse:\n    z = 1\n",
        )
        .unwrap();
        assert_eq!(stmts.len(), 1);
        let Stmt::For { body, orelse, .. } = &stmts[0] else {
            panic!("expected for loop");
        };
        assert_eq!(body.len(), 1);
        assert_eq!(orelse.len(), 1);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_try_statement() {
        let stmts =
            parse_module("try:\n    x = 1\nexcept KeyError as e:\n    pass\nfinally:\n    y = 2")
                .unwrap();
        let Stmt::Try {
            handlers,
            finalbody,
            ..
        } = &stmts[0]
        else {
            panic!("expected try");
        };
        assert_eq!(handlers[0].name.as_deref(), Some("e"));
        assert_eq!(finalbody.len(), 1);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_imports() {
        assert_eq!(
            parse_module("import os.path\nfrom a import b as c").unwrap(),
            vec![
                Stmt::Import(vec![Alias {
                    name: "os.path".to_string(),
                    asname: None,
                }]),
                Stmt::ImportFrom {
                    module: "a".to_string(),
                    names: vec![Alias {
                        name: "b".to_string(),
                        asname: Some("c".to_string()),
                    }],
                    wildcard: false,
                },
            ]
        );
        assert!(matches!(
            &parse_module("from a import *").unwrap()[0],
            Stmt::ImportFrom { wildcard: true, .. }
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_signature() {
        let (name, params) = parse_signature("foo(a, b=1, *args, **kw)").unwrap();
        assert_eq!(name, "foo");
        assert_eq!(params.names().collect::<Vec<_>>(), vec!["a", "b", "args", "kw"]);
        assert_eq!(parse_signature("bar").unwrap().1, Params::default());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_bare_params_and_arguments() {
        let params = parse_params("x, y=5").unwrap();
        assert_eq!(params.params.len(), 2);
        let args = parse_arguments("a=1, b=c").unwrap();
        assert_eq!(args.len(), 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_error_position() {
        let err = parse_module("x = 1\ny = )").unwrap_err();
        assert_eq!(err.pos, Pos { line: 2, column: 5 });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_invalid_assignment_target() {
        let err = parse_module("f() = 1").unwrap_err();
        assert!(err.message.contains("cannot assign"));
    }
}
