use std::{
    collections::BTreeSet,
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, Weak},
};

use rustc_hash::FxHasher;

use crate::{
    cache::{CachePlacement, TemplateCache},
    compiler::{self, CompiledUnit},
    error::{MantleError, MantleResult},
    interface::{Context, TemplateCollection},
    options::TemplateOptions,
    parser,
    runtime::{self, RenderTarget},
};

/// A compiled template, ready to be rendered any number of times.
///
/// Compilation parses the source, analyzes the scope of every embedded code
/// fragment and builds one definition per `<%def>`, `<%block>` and
/// `<%call>` body plus the implicit top-level body. Rendering walks those
/// definitions against a [`Context`].
///
/// `Template` is cheap to clone and can be shared between threads; each
/// render call owns its own state.
///
/// # Example
///
/// ```rust
/// use mantle::{Context, Template};
///
/// let template = Template::new("hello ${name}").unwrap();
///
/// let mut context = Context::new();
/// context.insert("name", "world");
///
/// assert_eq!(template.render(&context).unwrap(), "hello world");
/// ```
#[derive(Clone)]
pub struct Template {
    inner: Arc<TemplateInner>,
}

struct TemplateInner {
    source: String,
    uri: String,
    filename: Option<String>,
    unit: CompiledUnit,
    options: TemplateOptions,
    cache: TemplateCache,
    lookup: Option<Weak<dyn TemplateCollection>>,
}

#[cfg(feature = "serde")]
impl serde::Serialize for Template {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("Template", 2)?;
        state.serialize_field("uri", self.uri())?;
        state.serialize_field("content", self.source())?;
        state.end()
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Template {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct TemplateHelper {
            content: String,
            uri: Option<String>,
        }

        let helper = TemplateHelper::deserialize(deserializer)?;
        let template = match helper.uri {
            Some(uri) => Template::with_options(helper.content, uri, TemplateOptions::default()),
            None => Template::new(helper.content),
        };
        template.map_err(|e| serde::de::Error::custom(format!("Failed to compile template: {e}")))
    }
}

impl Template {
    /// Compiles a standalone template under a URI derived from its source.
    ///
    /// # Errors
    ///
    /// Returns `MantleError::Syntax` for malformed markup and
    /// `MantleError::Scope` for embedded code that cannot be analyzed.
    pub fn new<T: Into<String>>(source: T) -> MantleResult<Self> {
        let source = source.into();
        let mut hasher = FxHasher::default();
        source.hash(&mut hasher);
        let uri = format!("memory:{:x}", hasher.finish());
        Self::compile(source, uri, None, TemplateOptions::default(), None)
    }

    /// Compiles a standalone template with explicit options.
    ///
    /// # Errors
    ///
    /// See [`Template::new`].
    pub fn with_options<T: Into<String>, U: Into<String>>(
        source: T,
        uri: U,
        options: TemplateOptions,
    ) -> MantleResult<Self> {
        Self::compile(source.into(), uri.into(), None, options, None)
    }

    pub(crate) fn compile(
        source: String,
        uri: String,
        filename: Option<String>,
        options: TemplateOptions,
        lookup: Option<Weak<dyn TemplateCollection>>,
    ) -> MantleResult<Self> {
        let root = parser::parse(&source, &uri)?;
        let unit = compiler::compile(&root, &options)?;
        let placements = unit.defs.iter().filter_map(|def| {
            def.cache.as_ref().map(|settings| {
                let placement = CachePlacement {
                    cache_type: settings.cache_type.clone(),
                    region: settings.region.clone(),
                };
                (def.name.clone(), placement)
            })
        });
        let cache = TemplateCache::new(&uri, &options.cache_type).with_placements(placements);
        Ok(Self {
            inner: Arc::new(TemplateInner {
                source,
                uri,
                filename,
                unit,
                options,
                cache,
                lookup,
            }),
        })
    }

    /// Renders the template body.
    ///
    /// # Errors
    ///
    /// Any error raised while rendering, unless the template's error handler
    /// suppresses it. Runtime errors are wrapped in `MantleError::Render`
    /// carrying the template position that raised them.
    pub fn render(&self, context: &Context) -> MantleResult<String> {
        let mut out = String::new();
        runtime::render(self, context, RenderTarget::Body, &mut out)?;
        Ok(out)
    }

    /// Same as [`Template::render`]; output is always Unicode text.
    ///
    /// # Errors
    ///
    /// See [`Template::render`].
    pub fn render_unicode(&self, context: &Context) -> MantleResult<String> {
        self.render(context)
    }

    /// Renders the template body into `out`.
    ///
    /// Nothing is written if rendering fails.
    ///
    /// # Errors
    ///
    /// See [`Template::render`]; a failing writer is reported as
    /// `MantleError::Io`.
    pub fn render_to<W: fmt::Write>(&self, context: &Context, out: &mut W) -> MantleResult<()> {
        let text = self.render(context)?;
        out.write_str(&text).map_err(|err| MantleError::Io {
            path: self.uri().to_string(),
            message: err.to_string(),
        })
    }

    /// A handle rendering the top-level `<%def>` or `<%block>` called `name`.
    ///
    /// # Errors
    ///
    /// `MantleError::NamespaceMember` if the template has no such definition.
    pub fn get_def(&self, name: &str) -> MantleResult<DefTemplate> {
        if !self.has_def(name) {
            return Err(MantleError::NamespaceMember {
                namespace: self.uri().to_string(),
                member: name.to_string(),
            });
        }
        Ok(DefTemplate {
            template: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn has_def(&self, name: &str) -> bool {
        self.inner.unit.toplevel_def(name).is_some()
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// A textual listing of the compiled definitions and their render steps.
    pub fn code(&self) -> String {
        self.inner.unit.dump()
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// The file the template was loaded from, if any.
    pub fn filename(&self) -> Option<&str> {
        self.inner.filename.as_deref()
    }

    /// Names the template reads but never binds; they must come from the
    /// render context, a namespace import or the builtins.
    pub fn undeclared_identifiers(&self) -> &BTreeSet<String> {
        &self.inner.unit.undeclared
    }

    pub fn cache(&self) -> &TemplateCache {
        &self.inner.cache
    }

    pub fn options(&self) -> &TemplateOptions {
        &self.inner.options
    }

    /// Returns true if both handles refer to the same compiled template.
    pub fn ptr_eq(&self, other: &Template) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn unit(&self) -> &CompiledUnit {
        &self.inner.unit
    }

    pub(crate) fn lookup(&self) -> Option<Arc<dyn TemplateCollection>> {
        self.inner.lookup.as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("uri", &self.inner.uri)
            .field("filename", &self.inner.filename)
            .field("defs", &self.inner.unit.toplevel.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// One top-level definition of a template, rendered on its own.
///
/// Parameters of the definition are filled from context entries of the same
/// name.
#[derive(Debug, Clone)]
pub struct DefTemplate {
    template: Template,
    name: String,
}

impl DefTemplate {
    /// # Errors
    ///
    /// See [`Template::render`].
    pub fn render(&self, context: &Context) -> MantleResult<String> {
        let mut out = String::new();
        runtime::render(&self.template, context, RenderTarget::Def(&self.name), &mut out)?;
        Ok(out)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &Template {
        &self.template
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{NativeFunction, Value};

    #[test]
    #[ntest::timeout(100)]
    fn test_render_with_context() {
        let template = Template::new("hello ${name}").unwrap();
        let mut context = Context::new();
        context.insert("name", "world");
        assert_eq!(template.render(&context).unwrap(), "hello world");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_literal_text_passes_through() {
        let source = "plain text\n  with indentation, <b>markup</b> & 100% symbols\n";
        let template = Template::new(source).unwrap();
        assert_eq!(template.render(&Context::new()).unwrap(), source);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_render_to_writer() {
        let template = Template::new("${1 + 2}").unwrap();
        let mut out = String::from(">");
        template.render_to(&Context::new(), &mut out).unwrap();
        assert_eq!(out, ">3");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_get_def_renders_one_definition() {
        let template = Template::new(
            "body <%def name=\"greet(name)\">hi ${name}</%def>",
        )
        .unwrap();
        assert!(template.has_def("greet"));
        assert!(!template.has_def("missing"));
        assert!(template.get_def("missing").is_err());

        let mut context = Context::new();
        context.insert("name", "ada");
        let def = template.get_def("greet").unwrap();
        assert_eq!(def.name(), "greet");
        assert_eq!(def.render(&context).unwrap(), "hi ada");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_undeclared_identifiers() {
        let template = Template::new("<% x = 1 %>${x} ${y} ${len(z)}").unwrap();
        let names: Vec<&str> = template
            .undeclared_identifiers()
            .iter()
            .map(String::as_str)
            .collect();
        assert!(names.contains(&"y"), "{names:?}");
        assert!(names.contains(&"z"), "{names:?}");
        assert!(!names.contains(&"x"), "{names:?}");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_cached_def_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let bump = NativeFunction::new("bump", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::None)
        });

        let template = Template::new(
            "<%def name=\"foo()\" cached=\"True\"><% bump() %>hi</%def>${foo()} ${foo()}",
        )
        .unwrap();
        let mut context = Context::new();
        context.insert("bump", bump);

        assert_eq!(template.render(&context).unwrap(), "hi hi");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        template.cache().invalidate_def("foo").unwrap();
        assert_eq!(template.render(&context).unwrap(), "hi hi");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_invalidate_def_reaches_declared_region() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let bump = NativeFunction::new("bump", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::None)
        });

        let template = Template::new(
            "<%def name=\"nav()\" cached=\"True\" cache_region=\"menus\"><% bump() %>nav</%def>${nav()}",
        )
        .unwrap();
        let mut context = Context::new();
        context.insert("bump", bump);

        assert_eq!(template.render(&context).unwrap(), "nav");
        assert_eq!(template.render(&context).unwrap(), "nav");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        template.cache().invalidate_def("nav").unwrap();
        assert_eq!(template.render(&context).unwrap(), "nav");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_error_handler_can_suppress() {
        let options = TemplateOptions::new().error_handler(|ctx, err| {
            ctx.write(&format!("[{}]", err.root_cause().exception_name()));
            true
        });
        let template = Template::with_options("before ${1 / 0} after", "handled.html", options).unwrap();
        assert_eq!(template.render(&Context::new()).unwrap(), "before [ZeroDivisionError]");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_runtime_errors_carry_position() {
        let template = Template::with_options("line one\n${1 / 0}", "pos.html", TemplateOptions::new()).unwrap();
        let err = template.render(&Context::new()).unwrap_err();
        match err {
            MantleError::Render { uri, line, .. } => {
                assert_eq!(uri, "pos.html");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_code_lists_definitions() {
        let template = Template::new("<%def name=\"a()\">x</%def>${a()}").unwrap();
        let code = template.code();
        assert!(code.contains("def[0] Body body()"), "{code}");
        assert!(code.contains("a()"), "{code}");
    }
}
