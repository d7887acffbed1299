use thiserror::Error;

pub type MantleResult<T> = std::result::Result<T, MantleError>;

/// The structural problems the template lexer/parser can detect.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum SyntaxErrorKind {
    #[error("No such tag: '{0}'")]
    UnknownTag(String),
    #[error("Missing attribute(s) for tag '{tag}': {}", .attributes.join(", "))]
    MissingAttributes { tag: String, attributes: Vec<String> },
    #[error("Invalid attribute '{attribute}' for tag '{tag}'")]
    InvalidAttribute { tag: String, attribute: String },
    #[error("Attribute '{attribute}' in tag '{tag}' does not allow embedded expressions")]
    ExpressionNotAllowed { tag: String, attribute: String },
    #[error("Malformed tag '{tag}': {message}")]
    MalformedTag { tag: String, message: String },
    #[error(
        "Closing tag </%{found}> does not match tag <%{expected}> opened at line {line}, column {column}"
    )]
    MismatchedTag {
        expected: String,
        found: String,
        line: usize,
        column: usize,
    },
    #[error("Closing tag </%{0}> has no matching opening tag")]
    UnexpectedCloseTag(String),
    #[error("Unclosed tag: <%{0}>")]
    UnclosedTag(String),
    #[error("Unterminated control keyword: '{0}'")]
    UnterminatedControl(String),
    #[error("No starting keyword '{keyword}' for '{found}'")]
    UnmatchedControl { keyword: String, found: String },
    #[error("Keyword '{found}' doesn't match keyword '{expected}'")]
    MismatchedControl { expected: String, found: String },
    #[error("Invalid control line keyword: '{0}'")]
    InvalidControlKeyword(String),
    #[error("Unterminated expression")]
    UnterminatedExpression,
    #[error("Unterminated code block")]
    UnterminatedCode,
    #[error("Unterminated <%{0}> body")]
    UnterminatedRawBody(String),
    #[error("{0}")]
    Structure(String),
}

/// A fatal structural error, positioned in the template source.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("Syntax error in '{uri}' at line {line}, column {column}: {kind}")]
pub struct SyntaxError {
    pub uri: String,
    pub line: usize,
    pub column: usize,
    #[source]
    pub kind: SyntaxErrorKind,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum ScopeErrorKind {
    #[error("Malformed control line '{text}': {message}")]
    MalformedControl { text: String, message: String },
    #[error("Wildcard import from '{0}' is not supported; names must be imported explicitly")]
    WildcardImport(String),
    #[error("Invalid code: {0}")]
    InvalidSyntax(String),
}

/// A fatal error raised while analyzing an embedded code fragment.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("Compile error in '{uri}' at line {line}, column {column}: {kind}")]
pub struct ScopeError {
    pub uri: String,
    pub line: usize,
    pub column: usize,
    #[source]
    pub kind: ScopeErrorKind,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum MantleError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error("name '{name}' is not defined")]
    UnresolvedName { name: String },
    #[error("namespace '{namespace}' has no member '{member}'")]
    NamespaceMember { namespace: String, member: String },
    #[error("cache backend '{backend}' failed: {message}")]
    CacheBackend { backend: String, message: String },
    #[error("template '{uri}' inherits from itself")]
    InheritanceCycle { uri: String },
    #[error("template not found: '{uri}'")]
    TemplateNotFound { uri: String },
    #[error("No module named '{module}'")]
    Import { module: String },
    #[error("{0}")]
    Type(String),
    #[error("{0}")]
    Key(String),
    #[error("{0}")]
    Index(String),
    #[error("{0}")]
    Value(String),
    #[error("division by zero")]
    ZeroDivision,
    #[error("{callable}() missing required argument: '{argument}'")]
    MissingArgument { callable: String, argument: String },
    #[error("unable to read '{path}': {message}")]
    Io { path: String, message: String },
    #[error("template '{uri}' has no lookup to resolve '{target}'")]
    NoLookup { uri: String, target: String },
    #[error("{source} (in '{uri}' at line {line}, column {column})")]
    Render {
        uri: String,
        line: usize,
        column: usize,
        source: Box<MantleError>,
    },
}

impl MantleError {
    /// The exception class name embedded `try`/`except` blocks match against.
    pub fn exception_name(&self) -> &'static str {
        match self {
            Self::Syntax(_) => "SyntaxException",
            Self::Scope(_) => "CompileException",
            Self::UnresolvedName { .. } => "NameError",
            Self::NamespaceMember { .. } => "AttributeError",
            Self::CacheBackend { .. } => "CacheError",
            Self::InheritanceCycle { .. } => "RuntimeError",
            Self::TemplateNotFound { .. } | Self::NoLookup { .. } => "TemplateLookupException",
            Self::Type(_) | Self::MissingArgument { .. } => "TypeError",
            Self::Key(_) => "KeyError",
            Self::Index(_) => "IndexError",
            Self::Value(_) => "ValueError",
            Self::ZeroDivision => "ZeroDivisionError",
            Self::Io { .. } => "IOError",
            Self::Import { .. } => "ImportError",
            Self::Render { source, .. } => source.exception_name(),
        }
    }

    /// Returns true if an `except <class_name>` clause catches this error.
    pub fn matches_exception(&self, class_name: &str) -> bool {
        let own = self.exception_name();
        match class_name {
            "Exception" | "BaseException" => true,
            "LookupError" => matches!(own, "KeyError" | "IndexError"),
            "ArithmeticError" => own == "ZeroDivisionError",
            other => other == own,
        }
    }

    /// The error with any render position wrappers removed.
    pub fn root_cause(&self) -> &MantleError {
        match self {
            Self::Render { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Attaches a template position, keeping the innermost one if already set.
    pub(crate) fn at(self, uri: &str, line: usize, column: usize) -> Self {
        match self {
            Self::Render { .. } | Self::Syntax(_) | Self::Scope(_) => self,
            other => Self::Render {
                uri: uri.to_string(),
                line,
                column,
                source: Box::new(other),
            },
        }
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_render_wrapper_keeps_innermost_position() {
        let err = MantleError::ZeroDivision.at("/a.html", 3, 4).at("/b.html", 9, 1);
        assert_eq!(
            err,
            MantleError::Render {
                uri: "/a.html".to_string(),
                line: 3,
                column: 4,
                source: Box::new(MantleError::ZeroDivision),
            }
        );
        assert_eq!(err.exception_name(), "ZeroDivisionError");
        assert_eq!(err.root_cause(), &MantleError::ZeroDivision);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_exception_matching() {
        let err = MantleError::Key("'missing'".to_string());
        assert!(err.matches_exception("KeyError"));
        assert!(err.matches_exception("LookupError"));
        assert!(err.matches_exception("Exception"));
        assert!(!err.matches_exception("ValueError"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_syntax_error_display() {
        let err = MantleError::from(SyntaxError {
            uri: "memory:test".to_string(),
            line: 2,
            column: 5,
            kind: SyntaxErrorKind::UnknownTag("foo".to_string()),
        });
        assert_eq!(
            err.to_string(),
            "Syntax error in 'memory:test' at line 2, column 5: No such tag: 'foo'"
        );
    }
}
