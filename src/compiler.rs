//! Turns a parsed template into definitions made of render steps.

use std::{collections::BTreeSet, fmt::Write as _, time::Duration};

use indexmap::IndexMap;
use tracing::debug;

use crate::{
    ast::{ControlLine, Node, Span, Tag, TagKind, TemplateRoot},
    code::{
        self, CodeError,
        syntax::{Argument, Expr, Literal, Params, Stmt},
    },
    error::{MantleError, MantleResult, ScopeError, ScopeErrorKind, SyntaxError, SyntaxErrorKind},
    filters::{BuiltinFilter, FILTERS, NO_DEFAULTS},
    options::TemplateOptions,
    parser::split_top_level,
    scope::{self, ControlStatement, Identifiers},
};

/// Names the runtime binds in every template.
pub(crate) const RUNTIME_NAMES: &[&str] = &[
    "self", "parent", "next", "local", "caller", "context", "capture", "pageargs", "UNDEFINED",
    "loop",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum DefKind {
    #[default]
    Body,
    Def,
    NamedBlock,
    AnonymousBlock,
    CallBody,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Filter {
    Builtin(BuiltinFilter),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttrPart {
    Text(String),
    Expr(Expr),
}

/// An attribute value that may interpolate `${}` expressions.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttrValue {
    Literal(String),
    Interpolated(Vec<AttrPart>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CacheSettings {
    pub key: Option<AttrValue>,
    pub timeout: Option<Duration>,
    pub cache_type: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Handler {
    /// Exception class names; empty catches everything.
    pub classes: Vec<String>,
    pub name: Option<String>,
    pub body: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CallTarget {
    Expr(Expr),
    /// `<%ns:def attr="...">`
    Namespace {
        namespace: String,
        def: String,
        attributes: Vec<(String, AttrValue)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Text(String),
    Emit {
        expr: Expr,
        filters: Vec<Filter>,
        source: String,
        span: Span,
    },
    Exec {
        code: Vec<Stmt>,
        span: Span,
    },
    If {
        branches: Vec<(Option<Expr>, Vec<Step>)>,
        header: String,
        span: Span,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Step>,
        orelse: Vec<Step>,
        header: String,
        span: Span,
    },
    While {
        test: Expr,
        body: Vec<Step>,
        orelse: Vec<Step>,
        header: String,
        span: Span,
    },
    Try {
        body: Vec<Step>,
        handlers: Vec<Handler>,
        orelse: Vec<Step>,
        finalbody: Vec<Step>,
        span: Span,
    },
    Break,
    Continue,
    NamedBlock {
        name: String,
        span: Span,
    },
    AnonymousBlock {
        def: usize,
        span: Span,
    },
    CallTag {
        target: CallTarget,
        body: usize,
        span: Span,
    },
    Include {
        file: AttrValue,
        args: Vec<Argument>,
        span: Span,
    },
}

/// One compiled callable block.
#[derive(Debug, Clone, Default)]
pub(crate) struct Definition {
    pub name: String,
    pub kind: DefKind,
    pub params: Params,
    pub declared: BTreeSet<String>,
    pub free: BTreeSet<String>,
    pub buffered: bool,
    pub filters: Vec<Filter>,
    pub cache: Option<CacheSettings>,
    /// Nested definitions bound as locals when this one is invoked.
    pub closures: Vec<usize>,
    pub body: Vec<Step>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NamespaceSource {
    File(AttrValue),
    Module(String),
    Inline(IndexMap<String, usize>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NamespaceDecl {
    pub name: String,
    pub source: NamespaceSource,
    /// Names imported into the template's scope; `*` imports everything.
    pub import: Vec<String>,
    pub inheritable: bool,
    pub span: Span,
}

/// The executable form of a template.
#[derive(Debug, Clone, Default)]
pub(crate) struct CompiledUnit {
    pub uri: String,
    /// Index 0 is the template body.
    pub defs: Vec<Definition>,
    /// Top-level definitions and named blocks, by name.
    pub toplevel: IndexMap<String, usize>,
    pub inherit: Option<(AttrValue, Span)>,
    pub namespaces: IndexMap<String, NamespaceDecl>,
    pub module_code: Vec<(Vec<Stmt>, Span)>,
    pub enable_loop: bool,
    /// Names the template reads that nothing in it declares.
    pub undeclared: BTreeSet<String>,
}

impl CompiledUnit {
    pub(crate) fn body(&self) -> &Definition {
        &self.defs[0]
    }

    pub(crate) fn toplevel_def(&self, name: &str) -> Option<usize> {
        self.toplevel.get(name).copied()
    }

    /// A stable, human-readable listing of the definitions and their steps.
    pub(crate) fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}", self.uri);
        if let Some((AttrValue::Literal(file), _)) = &self.inherit {
            let _ = writeln!(out, "inherit {file:?}");
        } else if self.inherit.is_some() {
            let _ = writeln!(out, "inherit <expression>");
        }
        for decl in self.namespaces.values() {
            let _ = writeln!(out, "namespace {}", decl.name);
        }
        if !self.module_code.is_empty() {
            let _ = writeln!(out, "module code: {} block(s)", self.module_code.len());
        }
        for (index, def) in self.defs.iter().enumerate() {
            let _ = write!(out, "\ndef[{index}] {:?} {}({})", def.kind, def.name, def.params);
            if def.buffered {
                out.push_str(" buffered");
            }
            if def.cache.is_some() {
                out.push_str(" cached");
            }
            out.push('\n');
            if !def.free.is_empty() {
                let free: Vec<&str> = def.free.iter().map(String::as_str).collect();
                let _ = writeln!(out, "  free: {}", free.join(", "));
            }
            dump_steps(&mut out, &def.body, 1);
        }
        out
    }
}

fn dump_steps(out: &mut String, steps: &[Step], depth: usize) {
    let pad = "  ".repeat(depth);
    for step in steps {
        let _ = match step {
            Step::Text(text) => writeln!(out, "{pad}text {text:?}"),
            Step::Emit { source, filters, .. } => {
                writeln!(out, "{pad}emit {source} ({} filter(s))", filters.len())
            }
            Step::Exec { code, .. } => writeln!(out, "{pad}exec {} statement(s)", code.len()),
            Step::If {
                branches, header, ..
            } => {
                let _ = writeln!(out, "{pad}{header}");
                for (i, (_, body)) in branches.iter().enumerate() {
                    if i > 0 {
                        let _ = writeln!(out, "{pad}branch {i}");
                    }
                    dump_steps(out, body, depth + 1);
                }
                writeln!(out, "{pad}endif")
            }
            Step::For {
                body,
                orelse,
                header,
                ..
            }
            | Step::While {
                body,
                orelse,
                header,
                ..
            } => {
                let _ = writeln!(out, "{pad}{header}");
                dump_steps(out, body, depth + 1);
                if !orelse.is_empty() {
                    let _ = writeln!(out, "{pad}else:");
                    dump_steps(out, orelse, depth + 1);
                }
                writeln!(out, "{pad}end")
            }
            Step::Try {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            } => {
                let _ = writeln!(out, "{pad}try:");
                dump_steps(out, body, depth + 1);
                for handler in handlers {
                    let _ = writeln!(out, "{pad}except {}:", handler.classes.join(", "));
                    dump_steps(out, &handler.body, depth + 1);
                }
                if !orelse.is_empty() {
                    let _ = writeln!(out, "{pad}else:");
                    dump_steps(out, orelse, depth + 1);
                }
                if !finalbody.is_empty() {
                    let _ = writeln!(out, "{pad}finally:");
                    dump_steps(out, finalbody, depth + 1);
                }
                writeln!(out, "{pad}endtry")
            }
            Step::Break => writeln!(out, "{pad}break"),
            Step::Continue => writeln!(out, "{pad}continue"),
            Step::NamedBlock { name, .. } => writeln!(out, "{pad}block {name}"),
            Step::AnonymousBlock { def, .. } => writeln!(out, "{pad}block def[{def}]"),
            Step::CallTag { target, body, .. } => match target {
                CallTarget::Expr(_) => writeln!(out, "{pad}call with body def[{body}]"),
                CallTarget::Namespace { namespace, def, .. } => {
                    writeln!(out, "{pad}call {namespace}:{def} with body def[{body}]")
                }
            },
            Step::Include { file, .. } => match file {
                AttrValue::Literal(file) => writeln!(out, "{pad}include {file:?}"),
                AttrValue::Interpolated(_) => writeln!(out, "{pad}include <expression>"),
            },
        };
    }
}

/// The class names an `except` clause names, without module prefixes.
pub(crate) fn exception_classes(class: Option<&Expr>) -> Vec<String> {
    let names: Vec<String> = match class {
        None => Vec::new(),
        Some(Expr::Tuple(items)) => items.iter().filter_map(Expr::dotted_name).collect(),
        Some(other) => other.dotted_name().into_iter().collect(),
    };
    names
        .into_iter()
        .map(|name| name.rsplit('.').next().unwrap_or_default().to_string())
        .collect()
}

/// Scope bookkeeping for the definition currently being compiled.
struct DefScope {
    kind: DefKind,
    name: String,
    ids: Identifiers,
    closures: Vec<usize>,
}

struct Compiler<'a> {
    uri: &'a str,
    options: &'a TemplateOptions,
    page: &'a IndexMap<String, String>,
    defs: Vec<Definition>,
    toplevel: IndexMap<String, usize>,
    inherit: Option<(AttrValue, Span)>,
    namespaces: IndexMap<String, NamespaceDecl>,
    module_code: Vec<(Vec<Stmt>, Span)>,
    module_declared: BTreeSet<String>,
    template_undeclared: BTreeSet<String>,
    scopes: Vec<DefScope>,
    expression_filters: Vec<String>,
    anonymous: usize,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "True" | "true" | "1" | "yes" => Some(true),
        "False" | "false" | "0" | "no" | "" => Some(false),
        _ => None,
    }
}

/// Splits an attribute value into literal text and `${}` expressions.
fn split_interpolation(value: &str) -> Option<Vec<(bool, &str)>> {
    let mut parts = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        if start > 0 {
            parts.push((false, &rest[..start]));
        }
        let body = &rest[start + 2..];
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut end = None;
        for (i, c) in body.char_indices() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'' | '"') => quote = Some(c),
                (None, '{' | '(' | '[') => depth += 1,
                (None, ')' | ']') => depth = depth.saturating_sub(1),
                (None, '}') if depth == 0 => {
                    end = Some(i);
                    break;
                }
                (None, '}') => depth -= 1,
                (None, _) => {}
            }
        }
        let end = end?;
        parts.push((true, &body[..end]));
        rest = &body[end + 1..];
    }
    if !rest.is_empty() {
        parts.push((false, rest));
    }
    Some(parts)
}

impl<'a> Compiler<'a> {
    fn new(root: &'a TemplateRoot, options: &'a TemplateOptions) -> Self {
        let expression_filters = root
            .page
            .get("expression_filter")
            .map(|filters| {
                split_top_level(filters, ',')
                    .into_iter()
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            uri: &root.uri,
            options,
            page: &root.page,
            defs: Vec::new(),
            toplevel: IndexMap::new(),
            inherit: None,
            namespaces: IndexMap::new(),
            module_code: Vec::new(),
            module_declared: BTreeSet::new(),
            template_undeclared: BTreeSet::new(),
            scopes: Vec::new(),
            expression_filters,
            anonymous: 0,
        }
    }

    fn structure_error(&self, span: Span, message: String) -> MantleError {
        MantleError::Syntax(SyntaxError {
            uri: self.uri.to_string(),
            line: span.line,
            column: span.column,
            kind: SyntaxErrorKind::Structure(message),
        })
    }

    fn scope_error(&self, span: Span, kind: ScopeErrorKind) -> MantleError {
        MantleError::Scope(ScopeError {
            uri: self.uri.to_string(),
            line: span.line,
            column: span.column,
            kind,
        })
    }

    /// Maps an error inside a code fragment back to the template position.
    fn code_error(&self, span: Span, err: &CodeError) -> MantleError {
        let (line, column) = if err.pos.line <= 1 {
            (span.line, span.column + err.pos.column.saturating_sub(1))
        } else {
            (span.line + err.pos.line - 1, err.pos.column)
        };
        self.scope_error(
            Span { line, column },
            ScopeErrorKind::InvalidSyntax(err.message.clone()),
        )
    }

    fn absorb(&mut self, ids: &Identifiers) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.ids.absorb(ids);
        }
    }

    fn absorb_free(&mut self, free: &BTreeSet<String>) {
        let ids = Identifiers {
            declared: BTreeSet::new(),
            undeclared: free.clone(),
        };
        self.absorb(&ids);
    }

    fn parse_expr(&self, code: &str, span: Span) -> MantleResult<Expr> {
        code::parse_expression(code).map_err(|e| self.code_error(span, &e))
    }

    fn parse_attr(&mut self, value: &str, span: Span) -> MantleResult<AttrValue> {
        if !value.contains("${") {
            return Ok(AttrValue::Literal(value.to_string()));
        }
        let Some(parts) = split_interpolation(value) else {
            return Err(MantleError::Syntax(SyntaxError {
                uri: self.uri.to_string(),
                line: span.line,
                column: span.column,
                kind: SyntaxErrorKind::UnterminatedExpression,
            }));
        };
        let mut compiled = Vec::with_capacity(parts.len());
        for (is_expr, text) in parts {
            if is_expr {
                let expr = self.parse_expr(text, span)?;
                self.absorb(&scope::analyze_expression(&expr));
                compiled.push(AttrPart::Expr(expr));
            } else {
                compiled.push(AttrPart::Text(text.to_string()));
            }
        }
        Ok(AttrValue::Interpolated(compiled))
    }

    fn compile_filter_names<'n>(
        &mut self,
        names: impl IntoIterator<Item = &'n str>,
        span: Span,
        filters: &mut Vec<Filter>,
    ) -> MantleResult<()> {
        for name in names {
            let name = name.trim();
            if name.is_empty() || name == NO_DEFAULTS {
                continue;
            }
            match FILTERS.get(name) {
                Some(builtin) => filters.push(Filter::Builtin(*builtin)),
                None => {
                    let expr = self.parse_expr(name, span)?;
                    self.absorb(&scope::analyze_expression(&expr));
                    filters.push(Filter::Expr(expr));
                }
            }
        }
        Ok(())
    }

    /// Explicit filters first, then the page's expression filters, then the
    /// configured defaults, unless `n` disables the defaults.
    fn expression_filters(&mut self, explicit: &[String], span: Span) -> MantleResult<Vec<Filter>> {
        let mut filters = Vec::new();
        self.compile_filter_names(explicit.iter().map(String::as_str), span, &mut filters)?;
        if !explicit.iter().any(|f| f.trim() == NO_DEFAULTS) {
            let page = self.expression_filters.clone();
            self.compile_filter_names(page.iter().map(String::as_str), span, &mut filters)?;
            let defaults = self.options.default_filters.clone();
            self.compile_filter_names(defaults.iter().map(String::as_str), span, &mut filters)?;
        }
        Ok(filters)
    }

    fn bool_attr(&self, tag: &Tag, name: &str, default: bool) -> MantleResult<bool> {
        match tag.attribute(name) {
            None => Ok(default),
            Some(value) => parse_bool(value).ok_or_else(|| {
                self.structure_error(
                    tag.span,
                    format!("attribute '{name}' of <%{}> must be True or False", tag.keyword),
                )
            }),
        }
    }

    fn cache_settings(&mut self, tag: Option<&Tag>) -> MantleResult<Option<CacheSettings>> {
        let page = self.page;
        let attribute = |name: &str| -> Option<String> {
            tag.and_then(|t| t.attribute(name))
                .map(str::to_string)
                .or_else(|| page.get(name).cloned())
        };
        let span = tag.map(|t| t.span).unwrap_or_default();

        let cached = match tag {
            Some(tag) => self.bool_attr(tag, "cached", false)?,
            None => parse_bool(page.get("cached").map_or("", String::as_str)).unwrap_or(false),
        };
        let enabled = attribute("cache_enabled")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(true);
        if !cached || !enabled || !self.options.cache_enabled {
            return Ok(None);
        }

        let key = match attribute("cache_key") {
            Some(key) => Some(self.parse_attr(&key, span)?),
            None => None,
        };
        let timeout = match attribute("cache_timeout") {
            Some(seconds) => match seconds.trim().parse::<u64>() {
                Ok(seconds) => Some(Duration::from_secs(seconds)),
                Err(_) => {
                    return Err(self.structure_error(
                        span,
                        format!("cache_timeout must be a whole number of seconds, got '{seconds}'"),
                    ));
                }
            },
            None => None,
        };
        Ok(Some(CacheSettings {
            key,
            timeout,
            cache_type: attribute("cache_type"),
            region: attribute("cache_region"),
        }))
    }

    fn def_signature(&self, tag: &Tag, kind: DefKind) -> MantleResult<(String, Params)> {
        match kind {
            DefKind::Def => {
                let signature = tag.attribute("name").unwrap_or_default();
                code::parse_signature(signature).map_err(|e| self.code_error(tag.span, &e))
            }
            _ => {
                let name = match (kind, tag.attribute("name")) {
                    (DefKind::NamedBlock, Some(name)) => name.trim().to_string(),
                    (DefKind::CallBody, _) => "body".to_string(),
                    _ => format!("__anon_{}", self.anonymous),
                };
                let params = match tag.attribute("args") {
                    Some(args) => {
                        code::parse_params(args).map_err(|e| self.code_error(tag.span, &e))?
                    }
                    None => Params::default(),
                };
                Ok((name, params))
            }
        }
    }

    /// Names of `<%def>`s directly inside `nodes`, which are visible
    /// throughout the enclosing definition.
    fn nested_def_names(nodes: &[Node]) -> Vec<String> {
        nodes
            .iter()
            .filter_map(|node| match node {
                Node::Tag(tag) if tag.kind == TagKind::Def => tag
                    .attribute("name")
                    .and_then(|sig| code::parse_signature(sig).ok())
                    .map(|(name, _)| name),
                _ => None,
            })
            .collect()
    }

    fn compile_def(&mut self, tag: &Tag, kind: DefKind) -> MantleResult<usize> {
        let (name, params) = self.def_signature(tag, kind)?;
        if kind == DefKind::AnonymousBlock {
            self.anonymous += 1;
        }
        let index = self.defs.len();
        self.defs.push(Definition::default());

        let mut ids = scope::analyze_params(&params);
        for nested in Self::nested_def_names(&tag.children) {
            ids.declared.insert(nested);
        }
        self.scopes.push(DefScope {
            kind,
            name: name.clone(),
            ids,
            closures: Vec::new(),
        });
        let body = self.compile_nodes(&tag.children);
        let scope = self.scopes.pop();
        let body = body?;
        let Some(scope) = scope else {
            return Err(self.structure_error(tag.span, "definition scope underflow".to_string()));
        };

        let buffered = self.bool_attr(tag, "buffered", false)?;
        let mut filters = Vec::new();
        if let Some(filter) = tag.attribute("filter") {
            let names: Vec<String> = split_top_level(filter, ',')
                .into_iter()
                .map(str::to_string)
                .collect();
            self.compile_filter_names(names.iter().map(String::as_str), tag.span, &mut filters)?;
        }
        let cache = match kind {
            DefKind::Def | DefKind::NamedBlock => self.cache_settings(Some(tag))?,
            _ => None,
        };

        self.defs[index] = Definition {
            name,
            kind,
            params,
            declared: scope.ids.declared,
            free: scope.ids.undeclared,
            buffered,
            filters,
            cache,
            closures: scope.closures,
            body,
            span: tag.span,
        };
        Ok(index)
    }

    /// True if the nearest enclosing definition is the template body.
    fn at_toplevel(&self) -> bool {
        self.scopes.last().is_some_and(|s| s.kind == DefKind::Body)
    }

    fn register_toplevel(&mut self, name: &str, index: usize, span: Span) -> MantleResult<()> {
        if self.toplevel.contains_key(name) {
            return Err(self.structure_error(
                span,
                format!("definition '{name}' is declared more than once"),
            ));
        }
        self.toplevel.insert(name.to_string(), index);
        Ok(())
    }

    fn compile_nodes(&mut self, nodes: &[Node]) -> MantleResult<Vec<Step>> {
        let mut pos = 0;
        let steps = self.compile_sequence(nodes, &mut pos)?;
        match nodes.get(pos) {
            Some(Node::ControlLine(line)) => Err(self.structure_error(
                line.span,
                format!("unexpected control keyword '{}'", line.keyword),
            )),
            _ => Ok(steps),
        }
    }

    fn compile_sequence(&mut self, nodes: &[Node], pos: &mut usize) -> MantleResult<Vec<Step>> {
        let mut steps = Vec::new();
        while let Some(node) = nodes.get(*pos) {
            match node {
                Node::ControlLine(line) if line.is_end || line.is_continuation() => break,
                Node::ControlLine(line) if line.is_primary() => {
                    let step = self.compile_control(nodes, pos)?;
                    steps.push(step);
                }
                Node::ControlLine(line) => {
                    steps.push(if line.keyword == "break" {
                        Step::Break
                    } else {
                        Step::Continue
                    });
                    *pos += 1;
                }
                other => {
                    self.compile_node(other, &mut steps)?;
                    *pos += 1;
                }
            }
        }
        Ok(steps)
    }

    fn control(&mut self, line: &ControlLine) -> MantleResult<ControlStatement> {
        let (statement, ids) = scope::parse_control(&line.keyword, &line.text)
            .map_err(|(kind, _)| self.scope_error(line.span, kind))?;
        self.absorb(&ids);
        Ok(statement)
    }

    fn compile_control(&mut self, nodes: &[Node], pos: &mut usize) -> MantleResult<Step> {
        let Some(Node::ControlLine(head)) = nodes.get(*pos) else {
            return Err(self.structure_error(Span::default(), "expected a control line".to_string()));
        };
        let statement = self.control(head)?;
        *pos += 1;
        let mut body = self.compile_sequence(nodes, pos)?;

        let mut branches = Vec::new();
        let mut handlers = Vec::new();
        let mut orelse = Vec::new();
        let mut finalbody = Vec::new();
        if let ControlStatement::If(test) = &statement {
            branches.push((Some(test.clone()), std::mem::take(&mut body)));
        }

        loop {
            let Some(Node::ControlLine(line)) = nodes.get(*pos) else {
                return Err(self.structure_error(
                    head.span,
                    format!("unterminated control keyword '{}'", head.keyword),
                ));
            };
            if line.is_end {
                *pos += 1;
                break;
            }
            let continuation = self.control(line)?;
            *pos += 1;
            let section = self.compile_sequence(nodes, pos)?;
            match continuation {
                ControlStatement::Elif(test) => branches.push((Some(test), section)),
                ControlStatement::Else if matches!(statement, ControlStatement::If(_)) => {
                    branches.push((None, section));
                }
                ControlStatement::Else => orelse = section,
                ControlStatement::Except { class, name } => {
                    handlers.push(Handler {
                        classes: exception_classes(class.as_ref()),
                        name,
                        body: section,
                    });
                }
                ControlStatement::Finally => finalbody = section,
                _ => {
                    return Err(self.structure_error(
                        line.span,
                        format!("unexpected control keyword '{}'", line.keyword),
                    ));
                }
            }
        }

        let header = head.text.clone();
        let span = head.span;
        Ok(match statement {
            ControlStatement::If(_) => Step::If {
                branches,
                header,
                span,
            },
            ControlStatement::For { target, iter } => Step::For {
                target,
                iter,
                body,
                orelse,
                header,
                span,
            },
            ControlStatement::While(test) => Step::While {
                test,
                body,
                orelse,
                header,
                span,
            },
            ControlStatement::Try => Step::Try {
                body,
                handlers,
                orelse,
                finalbody,
                span,
            },
            _ => {
                return Err(self.structure_error(
                    span,
                    format!("'{}' cannot start a control block", head.keyword),
                ));
            }
        })
    }

    fn parse_code_block(&self, code: &str, span: Span) -> MantleResult<(Vec<Stmt>, Identifiers)> {
        let source = code::dedent(code, span.column);
        let stmts = code::parse_module(&source).map_err(|e| self.code_error(span, &e))?;
        let ids = scope::analyze_statements(&stmts).map_err(|kind| self.scope_error(span, kind))?;
        Ok((stmts, ids))
    }

    fn compile_node(&mut self, node: &Node, steps: &mut Vec<Step>) -> MantleResult<()> {
        match node {
            Node::Text { text, .. } => match steps.last_mut() {
                Some(Step::Text(previous)) => previous.push_str(text),
                _ => steps.push(Step::Text(text.clone())),
            },
            Node::Expression {
                code,
                filters,
                span,
            } => {
                let expr = self.parse_expr(code, *span)?;
                self.absorb(&scope::analyze_expression(&expr));
                let filters = self.expression_filters(filters, *span)?;
                steps.push(Step::Emit {
                    expr,
                    filters,
                    source: code.trim().to_string(),
                    span: *span,
                });
            }
            Node::Code {
                code,
                module_level: true,
                span,
            } => {
                let (stmts, ids) = self.parse_code_block(code, *span)?;
                for name in &ids.undeclared {
                    if !self.module_declared.contains(name) {
                        self.template_undeclared.insert(name.clone());
                    }
                }
                self.module_declared.extend(ids.declared);
                self.module_code.push((stmts, *span));
            }
            Node::Code { code, span, .. } => {
                let (stmts, ids) = self.parse_code_block(code, *span)?;
                self.absorb(&ids);
                steps.push(Step::Exec {
                    code: stmts,
                    span: *span,
                });
            }
            Node::Comment { .. } | Node::DocComment { .. } | Node::ControlLine(_) => {}
            Node::Tag(tag) => self.compile_tag(tag, steps)?,
        }
        Ok(())
    }

    fn compile_tag(&mut self, tag: &Tag, steps: &mut Vec<Step>) -> MantleResult<()> {
        match &tag.kind {
            TagKind::Def => {
                let toplevel = self.at_toplevel();
                let index = self.compile_def(tag, DefKind::Def)?;
                let (name, free) = (self.defs[index].name.clone(), self.defs[index].free.clone());
                if toplevel {
                    self.register_toplevel(&name, index, tag.span)?;
                    self.template_undeclared.extend(free);
                } else {
                    if let Some(scope) = self.scopes.last_mut() {
                        scope.closures.push(index);
                    }
                    self.absorb_free(&free);
                }
            }
            TagKind::Block => match tag.attribute("name") {
                Some(name) => {
                    if let Some(def) = self
                        .scopes
                        .iter()
                        .rev()
                        .find(|s| matches!(s.kind, DefKind::Def | DefKind::CallBody))
                    {
                        return Err(self.structure_error(
                            tag.span,
                            format!("named block '{name}' is not allowed inside of def '{}'", def.name),
                        ));
                    }
                    let index = self.compile_def(tag, DefKind::NamedBlock)?;
                    let name = self.defs[index].name.clone();
                    self.register_toplevel(&name, index, tag.span)?;
                    self.template_undeclared
                        .extend(self.defs[index].free.iter().cloned());
                    steps.push(Step::NamedBlock {
                        name,
                        span: tag.span,
                    });
                }
                None => {
                    let index = self.compile_def(tag, DefKind::AnonymousBlock)?;
                    let free = self.defs[index].free.clone();
                    self.absorb_free(&free);
                    steps.push(Step::AnonymousBlock {
                        def: index,
                        span: tag.span,
                    });
                }
            },
            TagKind::Namespace => self.compile_namespace(tag)?,
            TagKind::Include => {
                let file = self.parse_attr(tag.attribute("file").unwrap_or_default(), tag.span)?;
                let args = match tag.attribute("args") {
                    Some(args) => {
                        code::parse_arguments(args).map_err(|e| self.code_error(tag.span, &e))?
                    }
                    None => Vec::new(),
                };
                self.absorb(&scope::analyze_arguments(&args));
                steps.push(Step::Include {
                    file,
                    args,
                    span: tag.span,
                });
            }
            TagKind::Inherit => {
                if self.inherit.is_some() {
                    return Err(self.structure_error(
                        tag.span,
                        "a template may only inherit from one template".to_string(),
                    ));
                }
                let file = self.parse_attr(tag.attribute("file").unwrap_or_default(), tag.span)?;
                self.inherit = Some((file, tag.span));
            }
            TagKind::Page | TagKind::Doc => {}
            TagKind::Call => {
                let source = tag.attribute("expr").unwrap_or_default();
                let expr = self.parse_expr(source, tag.span)?;
                self.absorb(&scope::analyze_expression(&expr));
                let body = self.compile_call_body(tag)?;
                steps.push(Step::CallTag {
                    target: CallTarget::Expr(expr),
                    body,
                    span: tag.span,
                });
            }
            TagKind::CallNamespace { namespace, def } => {
                let mut attributes = Vec::new();
                for (name, value) in &tag.attributes {
                    if name == "args" {
                        continue;
                    }
                    let value = self.parse_attr(value, tag.span)?;
                    attributes.push((name.clone(), value));
                }
                let ids = Identifiers {
                    declared: BTreeSet::new(),
                    undeclared: BTreeSet::from([namespace.clone()]),
                };
                self.absorb(&ids);
                let body = self.compile_call_body(tag)?;
                steps.push(Step::CallTag {
                    target: CallTarget::Namespace {
                        namespace: namespace.clone(),
                        def: def.clone(),
                        attributes,
                    },
                    body,
                    span: tag.span,
                });
            }
            TagKind::Text => {
                let text: String = tag
                    .children
                    .iter()
                    .filter_map(|child| match child {
                        Node::Text { text, .. } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                match tag.attribute("filter") {
                    Some(filter) => {
                        let names: Vec<String> = split_top_level(filter, ',')
                            .into_iter()
                            .map(str::to_string)
                            .collect();
                        let mut filters = Vec::new();
                        self.compile_filter_names(
                            names.iter().map(String::as_str),
                            tag.span,
                            &mut filters,
                        )?;
                        steps.push(Step::Emit {
                            expr: Expr::Literal(Literal::Str(text)),
                            filters,
                            source: "<%text>".to_string(),
                            span: tag.span,
                        });
                    }
                    None => self.compile_node(&Node::Text { text, span: tag.span }, steps)?,
                }
            }
        }
        Ok(())
    }

    fn compile_call_body(&mut self, tag: &Tag) -> MantleResult<usize> {
        let index = self.compile_def(tag, DefKind::CallBody)?;
        let free = self.defs[index].free.clone();
        self.absorb_free(&free);
        Ok(index)
    }

    fn compile_namespace(&mut self, tag: &Tag) -> MantleResult<()> {
        let name = match tag.attribute("name") {
            Some(name) => name.trim().to_string(),
            None => {
                self.anonymous += 1;
                format!("__namespace_{}", self.anonymous)
            }
        };
        let source = if let Some(file) = tag.attribute("file") {
            NamespaceSource::File(self.parse_attr(file, tag.span)?)
        } else if let Some(module) = tag.attribute("module") {
            NamespaceSource::Module(module.trim().to_string())
        } else {
            let mut defs = IndexMap::new();
            for child in &tag.children {
                if let Node::Tag(def) = child {
                    if def.kind == TagKind::Def {
                        let index = self.compile_def(def, DefKind::Def)?;
                        self.template_undeclared
                            .extend(self.defs[index].free.iter().cloned());
                        defs.insert(self.defs[index].name.clone(), index);
                    }
                }
            }
            NamespaceSource::Inline(defs)
        };
        let import = tag
            .attribute("import")
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let inheritable = self.bool_attr(tag, "inheritable", false)?;
        self.namespaces.insert(
            name.clone(),
            NamespaceDecl {
                name,
                source,
                import,
                inheritable,
                span: tag.span,
            },
        );
        Ok(())
    }

    fn compile_root(mut self, root: &TemplateRoot) -> MantleResult<CompiledUnit> {
        let params = match root.page.get("args") {
            Some(args) => code::parse_params(args)
                .map_err(|e| self.code_error(Span { line: 1, column: 1 }, &e))?,
            None => Params::default(),
        };
        self.defs.push(Definition::default());
        self.scopes.push(DefScope {
            kind: DefKind::Body,
            name: "body".to_string(),
            ids: scope::analyze_params(&params),
            closures: Vec::new(),
        });
        let body = self.compile_nodes(&root.nodes)?;
        let Some(scope) = self.scopes.pop() else {
            return Err(self.structure_error(Span::default(), "definition scope underflow".to_string()));
        };
        let cache = self.cache_settings(None)?;

        self.template_undeclared
            .extend(scope.ids.undeclared.iter().cloned());
        let mut undeclared = self.template_undeclared;
        undeclared.retain(|name| {
            !self.toplevel.contains_key(name)
                && !self.namespaces.contains_key(name)
                && !self.module_declared.contains(name)
                && !RUNTIME_NAMES.contains(&name.as_str())
        });
        for decl in self.namespaces.values() {
            for imported in &decl.import {
                undeclared.remove(imported);
            }
        }

        self.defs[0] = Definition {
            name: "body".to_string(),
            kind: DefKind::Body,
            params,
            declared: scope.ids.declared,
            free: scope.ids.undeclared,
            buffered: false,
            filters: Vec::new(),
            cache,
            closures: scope.closures,
            body,
            span: Span { line: 1, column: 1 },
        };

        let enable_loop = match root.page.get("enable_loop") {
            Some(value) => parse_bool(value).unwrap_or(self.options.enable_loop),
            None => self.options.enable_loop,
        };

        debug!(
            uri = self.uri,
            definitions = self.defs.len(),
            namespaces = self.namespaces.len(),
            "compiled template"
        );
        Ok(CompiledUnit {
            uri: self.uri.to_string(),
            defs: self.defs,
            toplevel: self.toplevel,
            inherit: self.inherit,
            namespaces: self.namespaces,
            module_code: self.module_code,
            enable_loop,
            undeclared,
        })
    }
}

/// Compiles a parsed template.
pub(crate) fn compile(root: &TemplateRoot, options: &TemplateOptions) -> MantleResult<CompiledUnit> {
    Compiler::new(root, options).compile_root(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn unit(source: &str) -> CompiledUnit {
        let root = parse(source, "memory:test").unwrap();
        compile(&root, &TemplateOptions::default()).unwrap()
    }

    fn compile_err(source: &str) -> MantleError {
        let root = parse(source, "memory:test").unwrap();
        compile(&root, &TemplateOptions::default()).unwrap_err()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_text_and_expression_steps() {
        let unit = unit("hello ${name}");
        let body = &unit.body().body;
        assert_eq!(body[0], Step::Text("hello ".to_string()));
        assert!(matches!(&body[1], Step::Emit { source, .. } if source == "name"));
        assert_eq!(unit.undeclared, BTreeSet::from(["name".to_string()]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_toplevel_defs_are_registered() {
        let unit = unit("<%def name=\"foo(a, b=1)\">${a}${b}${c}</%def>${foo(1)}");
        let index = unit.toplevel_def("foo").unwrap();
        let def = &unit.defs[index];
        assert_eq!(def.kind, DefKind::Def);
        assert_eq!(def.params.names().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(def.free, BTreeSet::from(["c".to_string()]));
        assert!(unit.undeclared.contains("c"));
        assert!(!unit.undeclared.contains("foo"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_defs_are_closures() {
        let unit = unit(
            "<%def name=\"outer()\">${inner()}<%def name=\"inner()\">${x}</%def><% x = 1 %></%def>",
        );
        let outer = &unit.defs[unit.toplevel_def("outer").unwrap()];
        assert_eq!(outer.closures.len(), 1);
        assert!(outer.declared.contains("inner"));
        assert!(!outer.free.contains("inner"));
        assert!(unit.toplevel_def("inner").is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_forward_reference_is_free() {
        let unit = unit("<% y = x + 1 %><% x = 2 %>${y}");
        let body = unit.body();
        assert!(body.free.contains("x"));
        assert!(body.declared.contains("y"));
        assert!(!body.free.contains("y"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_control_lines_become_branches() {
        let unit = unit("% if a:\n1\n% elif b:\n2\n% else:\n3\n% endif\n");
        let Step::If { branches, .. } = &unit.body().body[0] else {
            panic!("expected an if step");
        };
        assert_eq!(branches.len(), 3);
        assert!(branches[2].0.is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_loop_declares_target() {
        let unit = unit("% for item in items:\n${item}\n% endfor\n");
        assert!(unit.body().declared.contains("item"));
        assert_eq!(unit.undeclared, BTreeSet::from(["items".to_string()]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_try_handlers() {
        let unit = unit("% try:\n${x}\n% except (KeyError, errors.ValueError) as e:\n${e}\n% finally:\ndone\n% endtry\n");
        let Step::Try { handlers, finalbody, .. } = &unit.body().body[0] else {
            panic!("expected a try step");
        };
        assert_eq!(handlers[0].classes, ["KeyError", "ValueError"]);
        assert_eq!(handlers[0].name.as_deref(), Some("e"));
        assert_eq!(finalbody.len(), 1);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_filters_order_and_n() {
        let root = parse("<%page expression_filter=\"trim\"/>${x | h}${y | n}", "memory:test").unwrap();
        let options = TemplateOptions::default().default_filters(["str"]);
        let unit = compile(&root, &options).unwrap();
        let Step::Emit { filters, .. } = &unit.body().body[0] else {
            panic!("expected emit");
        };
        assert_eq!(
            filters,
            &vec![
                Filter::Builtin(BuiltinFilter::Html),
                Filter::Builtin(BuiltinFilter::Trim),
                Filter::Builtin(BuiltinFilter::Str),
            ]
        );
        let Step::Emit { filters, .. } = &unit.body().body[1] else {
            panic!("expected emit");
        };
        assert!(filters.is_empty());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_named_blocks() {
        let unit = unit("<%block name=\"header\">h</%block><%block>anon</%block>");
        assert!(unit.toplevel_def("header").is_some());
        assert!(matches!(&unit.body().body[0], Step::NamedBlock { name, .. } if name == "header"));
        assert!(matches!(&unit.body().body[1], Step::AnonymousBlock { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_named_block_inside_def_is_rejected() {
        let err = compile_err("<%def name=\"a()\"><%block name=\"b\">x</%block></%def>");
        assert!(matches!(
            err,
            MantleError::Syntax(SyntaxError { kind: SyntaxErrorKind::Structure(ref message), .. })
                if message.contains("'b'") && message.contains("'a'")
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_duplicate_definition_is_rejected() {
        let err = compile_err("<%def name=\"a()\">1</%def><%def name=\"a()\">2</%def>");
        assert!(matches!(err, MantleError::Syntax(_)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_wildcard_import_is_a_scope_error() {
        let err = compile_err("line\n<% from helpers import * %>");
        assert!(matches!(
            err,
            MantleError::Scope(ScopeError { line: 2, kind: ScopeErrorKind::WildcardImport(_), .. })
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_code_error_position() {
        let err = compile_err("a\nb ${ 1 + }");
        assert!(matches!(err, MantleError::Scope(ScopeError { line: 2, .. })));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_page_args_become_body_params() {
        let unit = unit("<%page args=\"x, y=2\"/>${x}${y}${z}");
        assert_eq!(unit.body().params.names().collect::<Vec<_>>(), ["x", "y"]);
        assert_eq!(unit.undeclared, BTreeSet::from(["z".to_string()]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_cache_settings() {
        let unit = unit(
            "<%page cache_timeout=\"60\"/><%def name=\"a()\" cached=\"True\" cache_key=\"${k}\">x</%def>",
        );
        let def = &unit.defs[unit.toplevel_def("a").unwrap()];
        let cache = def.cache.as_ref().unwrap();
        assert_eq!(cache.timeout, Some(Duration::from_secs(60)));
        assert!(matches!(cache.key, Some(AttrValue::Interpolated(_))));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_namespaces_and_inherit() {
        let unit = unit(
            "<%inherit file=\"base.html\"/><%namespace name=\"lib\" file=\"lib.html\" import=\"a, b\"/>${a()}",
        );
        assert!(matches!(&unit.inherit, Some((AttrValue::Literal(f), _)) if f == "base.html"));
        assert_eq!(unit.namespaces["lib"].import, ["a", "b"]);
        assert!(unit.undeclared.is_empty());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_module_code_names_are_not_undeclared() {
        let unit = unit("<%! import helpers\nlimit = 3 %>${helpers.clip(x, limit)}");
        assert_eq!(unit.module_code.len(), 1);
        assert_eq!(unit.undeclared, BTreeSet::from(["x".to_string()]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_interpolated_attribute() {
        assert_eq!(
            split_interpolation("${a}.html"),
            Some(vec![(true, "a"), (false, ".html")])
        );
        assert_eq!(split_interpolation("x${ {'k': 1}['k'] }"), Some(vec![(false, "x"), (true, " {'k': 1}['k'] ")]));
        assert_eq!(split_interpolation("${a"), None);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dump_lists_definitions() {
        let dump = unit("<%def name=\"foo(x)\">${x}</%def>${foo(1)}").dump();
        assert!(dump.contains("def[0] Body body()"));
        assert!(dump.contains("Def foo(x)"));
        assert!(dump.contains("emit foo(1)"));
    }
}
