use indexmap::IndexMap;

/// A position in the template source (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Span {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TagKind {
    Def,
    Block,
    Namespace,
    Include,
    Inherit,
    Page,
    Call,
    /// `<%ns:defname>`, a call to a namespace's definition with a body.
    CallNamespace {
        namespace: String,
        def: String,
    },
    Text,
    Doc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Tag {
    pub kind: TagKind,
    /// The keyword as written, e.g. `def` or `form:input`.
    pub keyword: String,
    pub attributes: IndexMap<String, String>,
    pub children: Vec<Node>,
    pub span: Span,
}

impl Tag {
    pub(crate) fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ControlLine {
    /// The keyword without any `end` prefix, e.g. `for` for `% endfor`.
    pub keyword: String,
    pub is_end: bool,
    /// The line's text after the `%` sigil.
    pub text: String,
    pub span: Span,
}

impl ControlLine {
    pub(crate) fn is_primary(&self) -> bool {
        !self.is_end && matches!(self.keyword.as_str(), "for" | "if" | "while" | "try")
    }

    pub(crate) fn is_continuation(&self) -> bool {
        !self.is_end && matches!(self.keyword.as_str(), "elif" | "else" | "except" | "finally")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    /// Literal text with line continuations and `%%` escapes already processed.
    Text {
        text: String,
        span: Span,
    },
    Expression {
        code: String,
        filters: Vec<String>,
        span: Span,
    },
    ControlLine(ControlLine),
    Code {
        code: String,
        module_level: bool,
        span: Span,
    },
    Comment {
        text: String,
        span: Span,
    },
    DocComment {
        text: String,
        span: Span,
    },
    Tag(Tag),
}

/// The parsed template: its top-level nodes plus the page tag's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct TemplateRoot {
    pub nodes: Vec<Node>,
    pub uri: String,
    pub page: IndexMap<String, String>,
}
