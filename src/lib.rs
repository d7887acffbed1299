//! A template compiler and runtime with inheritable named blocks, lexically
//! scoped definitions, namespaces and fragment caching.
//!
//! ```
//! use mantle::{Context, TemplateCollection, TemplateLookup};
//!
//! let lookup = TemplateLookup::new();
//! lookup
//!     .put_string(
//!         "/base.html",
//!         "<title><%block name=\"title\">untitled</%block></title>${next.body()}",
//!     )
//!     .unwrap();
//! lookup
//!     .put_string(
//!         "/page.html",
//!         "<%inherit file=\"base.html\"/><%block name=\"title\">${heading}</%block>\n\
//!          % for item in items:\n<li>${item | h}</li>\n% endfor\n",
//!     )
//!     .unwrap();
//!
//! let mut context = Context::new();
//! context.insert("heading", "Home").insert("items", vec!["a", "<b>"]);
//!
//! let page = lookup.get_template("/page.html").unwrap();
//! assert_eq!(
//!     page.render(&context).unwrap(),
//!     "<title>Home</title>\n<li>a</li>\n<li>&lt;b&gt;</li>\n"
//! );
//! ```

mod ast;
mod cache;
mod code;
mod compiler;
mod error;
mod filters;
mod interface;
mod lookup;
mod options;
mod parser;
mod runtime;
mod scope;
mod tags;
mod template;
mod value;

// Public exports.
pub use cache::{CacheArgs, CacheBackend, CacheFactory, MemoryCache, TemplateCache, register_cache_impl};
pub use error::{MantleError, MantleResult, ScopeError, ScopeErrorKind, SyntaxError, SyntaxErrorKind};
pub use filters::{entity_escape, html_escape, url_escape, xml_escape};
pub use interface::{Context, TemplateCollection};
pub use lookup::{LookupBuilder, TemplateLookup};
pub use options::{ErrorContext, ErrorHandler, TemplateOptions};
pub use scope::{Identifiers, analyze};
pub use template::{DefTemplate, Template};
pub use value::{Kwargs, NativeFunction, NativeModule, Value};
