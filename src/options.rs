use std::{fmt, sync::Arc};

use indexmap::IndexMap;

use crate::{error::MantleError, interface::Context, value::{NativeModule, Value}};

/// A hook that may replace a failed render's output.
pub type ErrorHandler = Arc<dyn Fn(&mut ErrorContext<'_>, &MantleError) -> bool + Send + Sync>;

/// What an error handler sees of the failed render.
pub struct ErrorContext<'a> {
    pub(crate) output: &'a mut String,
    pub(crate) data: &'a Context,
}

impl ErrorContext<'_> {
    /// Appends text to the render's output.
    pub fn write(&mut self, text: &str) {
        self.output.push_str(text);
    }

    /// Output produced before the error occurred.
    pub fn output(&self) -> &str {
        self.output.as_str()
    }

    /// Reads a value from the data the render was called with.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Compilation and rendering options for a template.
///
/// # Examples
///
/// ```
/// use mantle::{Template, TemplateOptions};
///
/// let options = TemplateOptions::new().default_filters(["h"]);
/// let template = Template::with_options("${ markup }", "memory:escaped", options).unwrap();
/// let mut context = mantle::Context::new();
/// context.insert("markup", "<b>");
/// assert_eq!(template.render(&context).unwrap(), "&lt;b&gt;");
/// ```
#[derive(Clone)]
pub struct TemplateOptions {
    pub(crate) default_filters: Vec<String>,
    pub(crate) strict_undefined: bool,
    pub(crate) enable_loop: bool,
    pub(crate) cache_enabled: bool,
    pub(crate) cache_type: String,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) modules: IndexMap<String, Arc<NativeModule>>,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            default_filters: Vec::new(),
            strict_undefined: false,
            enable_loop: true,
            cache_enabled: true,
            cache_type: "memory".to_string(),
            error_handler: None,
            modules: IndexMap::new(),
        }
    }
}

impl TemplateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters applied to every `${}` expression after its own filters.
    #[must_use]
    pub fn default_filters<I, T>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.default_filters = filters.into_iter().map(Into::into).collect();
        self
    }

    /// Raise as soon as an unknown name is read instead of yielding
    /// `UNDEFINED`.
    #[must_use]
    pub fn strict_undefined(mut self, strict: bool) -> Self {
        self.strict_undefined = strict;
        self
    }

    #[must_use]
    pub fn enable_loop(mut self, enable: bool) -> Self {
        self.enable_loop = enable;
        self
    }

    #[must_use]
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// The backend cached definitions use unless they name one.
    #[must_use]
    pub fn cache_type<T: Into<String>>(mut self, cache_type: T) -> Self {
        self.cache_type = cache_type.into();
        self
    }

    /// Installs a handler that runs when a render fails. Returning `true`
    /// suppresses the error and keeps whatever the handler wrote.
    #[must_use]
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut ErrorContext<'_>, &MantleError) -> bool + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Registers a native module for `import` statements and
    /// `<%namespace module="..."/>`.
    #[must_use]
    pub fn module(mut self, module: NativeModule) -> Self {
        self.modules
            .insert(module.name().to_string(), Arc::new(module));
        self
    }

    pub fn get_default_filters(&self) -> &[String] {
        &self.default_filters
    }

    pub fn is_strict_undefined(&self) -> bool {
        self.strict_undefined
    }

    pub(crate) fn get_module(&self, name: &str) -> Option<Arc<NativeModule>> {
        self.modules.get(name).cloned()
    }
}

impl fmt::Debug for TemplateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateOptions")
            .field("default_filters", &self.default_filters)
            .field("strict_undefined", &self.strict_undefined)
            .field("enable_loop", &self.enable_loop)
            .field("cache_enabled", &self.cache_enabled)
            .field("cache_type", &self.cache_type)
            .field("error_handler", &self.error_handler.is_some())
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_defaults() {
        let options = TemplateOptions::default();
        assert!(options.enable_loop);
        assert!(options.cache_enabled);
        assert_eq!(options.cache_type, "memory");
        assert!(options.default_filters.is_empty());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_builder() {
        let options = TemplateOptions::new()
            .default_filters(["h", "trim"])
            .strict_undefined(true)
            .module(NativeModule::new("helpers"));
        assert_eq!(options.get_default_filters(), ["h", "trim"]);
        assert!(options.is_strict_undefined());
        assert!(options.get_module("helpers").is_some());
        assert!(format!("{options:?}").contains("helpers"));
    }
}
