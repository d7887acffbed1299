//! Static analysis of declared and undeclared identifiers in embedded code.

use std::collections::BTreeSet;

use crate::code::syntax::{Argument, Expr, Params, Stmt};
use crate::code::{self, CodeError};
use crate::error::ScopeErrorKind;

/// Names that are provided by the runtime and never count as free variables.
pub(crate) const RESERVED_NAMES: &[&str] = &["context", "loop", "UNDEFINED"];

/// The identifiers a code fragment declares and those it reads before
/// declaring them.
///
/// The two sets may overlap: `x = x + 1` both reads `x` from the enclosing
/// scope and declares it.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identifiers {
    pub declared: BTreeSet<String>,
    pub undeclared: BTreeSet<String>,
}

impl Identifiers {
    /// Merges a later fragment into this one, preserving evaluation order:
    /// names the later fragment reads are only undeclared if nothing earlier
    /// declared them.
    pub(crate) fn absorb(&mut self, later: &Identifiers) {
        for name in &later.undeclared {
            if !self.declared.contains(name) {
                self.undeclared.insert(name.clone());
            }
        }
        self.declared.extend(later.declared.iter().cloned());
    }
}

struct Analyzer {
    ids: Identifiers,
    /// Parameter/local scopes of enclosing functions, lambdas and comprehensions.
    locals: Vec<BTreeSet<String>>,
}

impl Analyzer {
    fn new() -> Self {
        Self {
            ids: Identifiers::default(),
            locals: Vec::new(),
        }
    }

    fn declare(&mut self, name: &str) {
        if RESERVED_NAMES.contains(&name) {
            return;
        }
        match self.locals.last_mut() {
            Some(scope) => {
                scope.insert(name.to_string());
            }
            None => {
                self.ids.declared.insert(name.to_string());
            }
        }
    }

    fn load(&mut self, name: &str) {
        if RESERVED_NAMES.contains(&name)
            || self.locals.iter().any(|scope| scope.contains(name))
            || self.ids.declared.contains(name)
        {
            return;
        }
        self.ids.undeclared.insert(name.to_string());
    }

    fn visit_statements(&mut self, stmts: &[Stmt]) -> Result<(), ScopeErrorKind> {
        stmts.iter().try_for_each(|stmt| self.visit_statement(stmt))
    }

    fn visit_statement(&mut self, stmt: &Stmt) -> Result<(), ScopeErrorKind> {
        match stmt {
            Stmt::Expr(expr) => self.visit_expr(expr),
            Stmt::Assign { targets, value } => {
                self.visit_expr(value);
                for target in targets {
                    self.visit_target(target);
                }
            }
            Stmt::AugAssign { target, value, .. } => {
                self.visit_expr(value);
                self.visit_expr(target);
                self.visit_target(target);
            }
            Stmt::If { test, body, orelse } | Stmt::While { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_statements(body)?;
                self.visit_statements(orelse)?;
            }
            Stmt::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.visit_expr(iter);
                self.visit_target(target);
                self.visit_statements(body)?;
                self.visit_statements(orelse)?;
            }
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.visit_statements(body)?;
                for handler in handlers {
                    if let Some(name) = &handler.name {
                        self.declare(name);
                    }
                    self.visit_statements(&handler.body)?;
                }
                self.visit_statements(orelse)?;
                self.visit_statements(finalbody)?;
            }
            Stmt::FunctionDef(func) => {
                self.declare(&func.name);
                self.visit_param_defaults(&func.params);
                self.locals.push(func.params.names().map(str::to_string).collect());
                let result = self.visit_statements(&func.body);
                self.locals.pop();
                result?;
            }
            Stmt::Import(names) => {
                for alias in names {
                    match &alias.asname {
                        Some(asname) => self.declare(asname),
                        None => {
                            let first = alias.name.split('.').next().unwrap_or(&alias.name);
                            self.declare(first);
                        }
                    }
                }
            }
            Stmt::ImportFrom {
                module,
                names,
                wildcard,
            } => {
                if *wildcard {
                    return Err(ScopeErrorKind::WildcardImport(module.clone()));
                }
                for alias in names {
                    self.declare(alias.asname.as_deref().unwrap_or(&alias.name));
                }
            }
            Stmt::Return(value) => {
                if let Some(value) = value {
                    self.visit_expr(value);
                }
            }
            Stmt::Pass | Stmt::Break | Stmt::Continue => {}
        }
        Ok(())
    }

    fn visit_param_defaults(&mut self, params: &Params) {
        for param in &params.params {
            if let Some(default) = &param.default {
                self.visit_expr(default);
            }
        }
    }

    /// Declares assignment targets; attribute and subscript targets read
    /// their base object instead.
    fn visit_target(&mut self, target: &Expr) {
        match target {
            Expr::Name(name) => self.declare(name),
            Expr::Tuple(items) | Expr::List(items) => {
                for item in items {
                    self.visit_target(item);
                }
            }
            Expr::Attribute { value, .. } => self.visit_expr(value),
            Expr::Subscript { value, index } => {
                self.visit_expr(value);
                self.visit_expr(index);
            }
            other => self.visit_expr(other),
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Literal(_) => {}
            Expr::Name(name) => self.load(name),
            Expr::Attribute { value, .. } => self.visit_expr(value),
            Expr::Subscript { value, index } => {
                self.visit_expr(value);
                self.visit_expr(index);
            }
            Expr::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.visit_expr(part);
                }
            }
            Expr::Call { func, args } => {
                self.visit_expr(func);
                for arg in args {
                    match arg {
                        Argument::Positional(e)
                        | Argument::Keyword(_, e)
                        | Argument::Star(e)
                        | Argument::DoubleStar(e) => self.visit_expr(e),
                    }
                }
            }
            Expr::Unary { operand, .. } => self.visit_expr(operand),
            Expr::Binary { left, right, .. } | Expr::Bool { left, right, .. } => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            Expr::Compare { left, comparisons } => {
                self.visit_expr(left);
                for (_, right) in comparisons {
                    self.visit_expr(right);
                }
            }
            Expr::IfElse { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_expr(body);
                self.visit_expr(orelse);
            }
            Expr::Lambda(lambda) => {
                self.visit_param_defaults(&lambda.params);
                self.locals
                    .push(lambda.params.names().map(str::to_string).collect());
                self.visit_expr(&lambda.body);
                self.locals.pop();
            }
            Expr::List(items) | Expr::Tuple(items) => {
                for item in items {
                    self.visit_expr(item);
                }
            }
            Expr::Dict(entries) => {
                for (key, value) in entries {
                    self.visit_expr(key);
                    self.visit_expr(value);
                }
            }
            Expr::ListComp {
                element,
                generators,
            } => {
                if let Some(first) = generators.first() {
                    self.visit_expr(&first.iter);
                }
                self.locals.push(BTreeSet::new());
                for (i, generator) in generators.iter().enumerate() {
                    if i > 0 {
                        self.visit_expr(&generator.iter);
                    }
                    self.visit_target(&generator.target);
                    for cond in &generator.ifs {
                        self.visit_expr(cond);
                    }
                }
                self.visit_expr(element);
                self.locals.pop();
            }
        }
    }
}

pub(crate) fn analyze_expression(expr: &Expr) -> Identifiers {
    let mut analyzer = Analyzer::new();
    analyzer.visit_expr(expr);
    analyzer.ids
}

pub(crate) fn analyze_statements(stmts: &[Stmt]) -> Result<Identifiers, ScopeErrorKind> {
    let mut analyzer = Analyzer::new();
    analyzer.visit_statements(stmts)?;
    Ok(analyzer.ids)
}

pub(crate) fn analyze_arguments(args: &[Argument]) -> Identifiers {
    let mut analyzer = Analyzer::new();
    for arg in args {
        match arg {
            Argument::Positional(e)
            | Argument::Keyword(_, e)
            | Argument::Star(e)
            | Argument::DoubleStar(e) => analyzer.visit_expr(e),
        }
    }
    analyzer.ids
}

pub(crate) fn analyze_params(params: &Params) -> Identifiers {
    let mut analyzer = Analyzer::new();
    analyzer.visit_param_defaults(params);
    for name in params.names() {
        analyzer.declare(name);
    }
    analyzer.ids
}

/// Parses a block of code and analyzes it.
///
/// This is the analysis the compiler performs for every `<% %>` block, exposed
/// for tooling that wants to inspect template code.
///
/// # Errors
///
/// Returns a `ScopeErrorKind::InvalidSyntax` for malformed code and a
/// `ScopeErrorKind::WildcardImport` for `from x import *`.
///
/// # Examples
///
/// ```
/// let ids = mantle::analyze("x = x + 5").unwrap();
/// assert!(ids.declared.contains("x"));
/// assert!(ids.undeclared.contains("x"));
/// ```
pub fn analyze(code: &str) -> Result<Identifiers, ScopeErrorKind> {
    let stmts = code::parse_module(&code::dedent(code, 1))
        .map_err(|e| ScopeErrorKind::InvalidSyntax(format!("{} ({}:{})", e.message, e.pos.line, e.pos.column)))?;
    analyze_statements(&stmts)
}

/// A control line's statement header, extracted from the completed fragment.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ControlStatement {
    If(Expr),
    Elif(Expr),
    Else,
    For { target: Expr, iter: Expr },
    While(Expr),
    Try,
    Except { class: Option<Expr>, name: Option<String> },
    Finally,
}

/// Completes a partial control line with a trivial body so it parses as a
/// standalone fragment, then extracts its header and identifiers.
pub(crate) fn parse_control(
    keyword: &str,
    text: &str,
) -> Result<(ControlStatement, Identifiers), (ScopeErrorKind, Option<CodeError>)> {
    let header = text.trim();
    let source = match keyword {
        "if" | "for" | "while" => format!("{header}\n    pass"),
        "try" => format!("{header}\n    pass\nfinally:\n    pass"),
        "elif" => format!("if False:\n    pass\n{header}\n    pass"),
        "else" => format!("if False:\n    pass\n{header}\n    pass"),
        "except" => format!("try:\n    pass\n{header}\n    pass"),
        "finally" => format!("try:\n    pass\n{header}\n    pass"),
        other => {
            return Err((
                ScopeErrorKind::MalformedControl {
                    text: header.to_string(),
                    message: format!("unsupported keyword '{other}'"),
                },
                None,
            ));
        }
    };

    let malformed = |message: String| ScopeErrorKind::MalformedControl {
        text: header.to_string(),
        message,
    };
    let stmts = code::parse_module(&source).map_err(|e| (malformed(e.message.clone()), Some(e)))?;
    let Some(stmt) = stmts.into_iter().next() else {
        return Err((malformed("empty control line".to_string()), None));
    };

    let statement = match (keyword, stmt) {
        ("if", Stmt::If { test, .. }) => ControlStatement::If(test),
        ("while", Stmt::While { test, .. }) => ControlStatement::While(test),
        ("for", Stmt::For { target, iter, .. }) => ControlStatement::For { target, iter },
        ("try", Stmt::Try { .. }) => ControlStatement::Try,
        ("elif", Stmt::If { orelse, .. }) => match orelse.into_iter().next() {
            Some(Stmt::If { test, .. }) => ControlStatement::Elif(test),
            _ => return Err((malformed("expected 'elif <condition>:'".to_string()), None)),
        },
        ("else", Stmt::If { .. }) => ControlStatement::Else,
        ("except", Stmt::Try { handlers, .. }) => match handlers.into_iter().next() {
            Some(handler) => ControlStatement::Except {
                class: handler.class,
                name: handler.name,
            },
            None => return Err((malformed("expected 'except:'".to_string()), None)),
        },
        ("finally", Stmt::Try { .. }) => ControlStatement::Finally,
        _ => return Err((malformed(format!("expected a '{keyword}' statement")), None)),
    };

    let mut analyzer = Analyzer::new();
    match &statement {
        ControlStatement::If(test) | ControlStatement::Elif(test) | ControlStatement::While(test) => {
            analyzer.visit_expr(test);
        }
        ControlStatement::For { target, iter } => {
            analyzer.visit_expr(iter);
            analyzer.visit_target(target);
        }
        ControlStatement::Except { name, .. } => {
            if let Some(name) = name {
                analyzer.declare(name);
            }
        }
        ControlStatement::Else | ControlStatement::Try | ControlStatement::Finally => {}
    }
    Ok((statement, analyzer.ids))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_self_referential_assignment() {
        let ids = analyze("x = x + 5").unwrap();
        assert_eq!(ids.declared, set(&["x"]));
        assert_eq!(ids.undeclared, set(&["x"]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_declared_before_use() {
        let ids = analyze("x = 5\nprint(x)").unwrap();
        assert_eq!(ids.declared, set(&["x"]));
        assert!(!ids.undeclared.contains("x"));
        assert!(ids.undeclared.contains("print"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_analysis_is_idempotent() {
        assert_eq!(analyze("a = b\nc = a").unwrap(), analyze("a = b\nc = a").unwrap());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_function_locals_do_not_leak() {
        let ids = analyze("def f(a, b=c):\n    d = a + e\n    return d").unwrap();
        assert_eq!(ids.declared, set(&["f"]));
        assert_eq!(ids.undeclared, set(&["c", "e"]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_imports_declare_names() {
        let ids = analyze("import os.path\nimport json as j\nfrom a import b, c as d").unwrap();
        assert_eq!(ids.declared, set(&["os", "j", "b", "d"]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_wildcard_import_is_rejected() {
        assert_eq!(
            analyze("from helpers import *").unwrap_err(),
            ScopeErrorKind::WildcardImport("helpers".to_string())
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comprehension_and_lambda_scopes() {
        let ids = analyze("y = [x for x in items if x > limit]\nf = lambda a: a + b").unwrap();
        assert_eq!(ids.declared, set(&["y", "f"]));
        assert_eq!(ids.undeclared, set(&["items", "limit", "b"]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_reserved_names_are_ignored() {
        let ids = analyze("context.write(loop.index)\nx = UNDEFINED").unwrap();
        assert_eq!(ids.undeclared, BTreeSet::new());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_partial_for_line() {
        let (stmt, ids) = parse_control("for", "for item in items:").unwrap();
        assert!(matches!(stmt, ControlStatement::For { .. }));
        assert_eq!(ids.declared, set(&["item"]));
        assert_eq!(ids.undeclared, set(&["items"]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_partial_continuations() {
        assert!(matches!(
            parse_control("elif", "elif x > 1:").unwrap().0,
            ControlStatement::Elif(_)
        ));
        assert_eq!(parse_control("else", "else:").unwrap().0, ControlStatement::Else);
        let (stmt, ids) = parse_control("except", "except KeyError as e:").unwrap();
        assert!(matches!(stmt, ControlStatement::Except { name: Some(_), .. }));
        assert_eq!(ids.declared, set(&["e"]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_partial_try_line() {
        let (stmt, ids) = parse_control("try", "try:").unwrap();
        assert_eq!(stmt, ControlStatement::Try);
        assert!(ids.declared.is_empty());
        assert_eq!(parse_control("finally", "finally:").unwrap().0, ControlStatement::Finally);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_malformed_control_line() {
        let (kind, _) = parse_control("for", "for x in:").unwrap_err();
        assert!(matches!(kind, ScopeErrorKind::MalformedControl { .. }));
    }
}
