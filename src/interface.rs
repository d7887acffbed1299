use indexmap::IndexMap;

use crate::{MantleResult, Template, value::Value};

/// The data a template is rendered with.
///
/// Names inserted here are visible to every definition of the template
/// unless shadowed by a local variable or parameter.
///
/// # Examples
///
/// ```
/// use mantle::{Context, Template};
///
/// let template = Template::new("${greeting}, ${names[1]}!").unwrap();
///
/// let mut context = Context::new();
/// context
///     .insert("greeting", "Hello")
///     .insert("names", vec!["Ada", "Grace"]);
///
/// assert_eq!(template.render(&context).unwrap(), "Hello, Grace!");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    data: IndexMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context from the top-level fields of any serializable value.
    ///
    /// # Errors
    /// - If the value does not serialize to a JSON object.
    #[cfg(feature = "serde")]
    pub fn from_serialize<T: serde::Serialize>(data: &T) -> MantleResult<Self> {
        match serde_json::to_value(data) {
            Ok(serde_json::Value::Object(map)) => Ok(map.into_iter().collect()),
            Ok(other) => Err(crate::MantleError::type_error(format!(
                "context data must serialize to an object, not {other}"
            ))),
            Err(err) => Err(crate::MantleError::Value(err.to_string())),
        }
    }

    pub fn insert<N: Into<String>, V: Into<Value>>(&mut self, name: N, value: V) -> &mut Self {
        self.data.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.data.shift_remove(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.data.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<N: Into<String>, V: Into<Value>> FromIterator<(N, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            data: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

/// A source of templates addressed by URI.
///
/// Templates created by a collection resolve `<%inherit>`, `<%include>` and
/// `<%namespace file="...">` references through it.
pub trait TemplateCollection: Send + Sync {
    /// Returns the compiled template for `uri`.
    ///
    /// # Errors
    /// - `MantleError::TemplateNotFound` if no template has that URI.
    /// - Any syntax or scope error raised compiling it.
    fn get_template(&self, uri: &str) -> MantleResult<Template>;

    fn has_template(&self, uri: &str) -> bool;

    /// Resolves `uri` as referenced from the template at `relative_to`.
    ///
    /// Absolute URIs are returned unchanged; relative ones are joined to the
    /// directory of `relative_to`.
    fn adjust_uri(&self, uri: &str, relative_to: &str) -> String {
        if uri.starts_with('/') {
            return uri.to_string();
        }
        let base = relative_to.rsplit_once('/').map_or("", |(dir, _)| dir);
        normalize_uri(&format!("{base}/{uri}"))
    }
}

/// Collapses `.` and `..` segments and duplicate slashes, always returning an
/// absolute URI.
pub(crate) fn normalize_uri(uri: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in uri.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}
