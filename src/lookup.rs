use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::SystemTime,
};

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{
    error::{MantleError, MantleResult},
    interface::{Context, TemplateCollection, normalize_uri},
    options::TemplateOptions,
    template::Template,
};

/// Configures a [`TemplateLookup`].
#[derive(Default)]
pub struct LookupBuilder {
    directories: Vec<PathBuf>,
    filesystem_checks: bool,
    collection_size: Option<usize>,
    options: TemplateOptions,
}

impl LookupBuilder {
    /// Adds a directory searched for template files, in insertion order.
    #[must_use]
    pub fn directory<P: Into<PathBuf>>(mut self, directory: P) -> Self {
        self.directories.push(directory.into());
        self
    }

    #[must_use]
    pub fn directories<I, P>(mut self, directories: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.directories.extend(directories.into_iter().map(Into::into));
        self
    }

    /// Recompile a file template when its modification time changes.
    #[must_use]
    pub const fn filesystem_checks(mut self, enabled: bool) -> Self {
        self.filesystem_checks = enabled;
        self
    }

    /// Keep at most `size` compiled templates, evicting the least recently
    /// used.
    #[must_use]
    pub const fn collection_size(mut self, size: usize) -> Self {
        self.collection_size = Some(size);
        self
    }

    /// Options every template compiled by the lookup is given.
    #[must_use]
    pub fn options(mut self, options: TemplateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> TemplateLookup {
        TemplateLookup {
            inner: Arc::new_cyclic(|this| LookupInner {
                this: this.clone(),
                directories: self.directories,
                filesystem_checks: self.filesystem_checks,
                collection_size: self.collection_size,
                options: self.options,
                entries: Mutex::new(IndexMap::new()),
                compiling: Mutex::new(FxHashMap::default()),
            }),
        }
    }
}

/// A thread-safe collection of templates addressed by URI.
///
/// Templates are compiled on first access, either from strings registered
/// with [`TemplateLookup::put_string`] or from files found under the
/// configured directories. At most one compilation runs per URI; concurrent
/// callers wait for it and share the result.
///
/// Templates obtained from a lookup resolve `<%inherit>`, `<%include>` and
/// `<%namespace file="...">` through it for as long as the lookup is alive.
///
/// # Examples
///
/// ```
/// use mantle::{Context, TemplateLookup};
///
/// let lookup = TemplateLookup::new();
/// lookup
///     .put_string("/base.html", "<html>${self.body()}</html>")
///     .unwrap();
/// lookup
///     .put_string("/page.html", "<%inherit file=\"base.html\"/>hi ${name}")
///     .unwrap();
///
/// let mut context = Context::new();
/// context.insert("name", "ada");
/// assert_eq!(
///     lookup.render("/page.html", &context).unwrap(),
///     "<html>hi ada</html>"
/// );
/// ```
#[derive(Clone)]
pub struct TemplateLookup {
    inner: Arc<LookupInner>,
}

struct Entry {
    template: Template,
    path: Option<PathBuf>,
    modified: Option<SystemTime>,
}

struct LookupInner {
    this: Weak<LookupInner>,
    directories: Vec<PathBuf>,
    filesystem_checks: bool,
    collection_size: Option<usize>,
    options: TemplateOptions,
    /// Least recently used first.
    entries: Mutex<IndexMap<String, Entry>>,
    compiling: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

impl LookupInner {
    fn collection(&self) -> Weak<dyn TemplateCollection> {
        self.this.clone()
    }

    /// A compiled template that is still current, marked as recently used.
    fn cached(&self, uri: &str) -> Option<Template> {
        let mut entries = self.entries.lock();
        let entry = entries.shift_remove(uri)?;
        if self.filesystem_checks {
            if let Some(path) = &entry.path {
                if modified_time(path) != entry.modified {
                    debug!(uri, path = %path.display(), "template source changed, recompiling");
                    return None;
                }
            }
        }
        let template = entry.template.clone();
        entries.insert(uri.to_string(), entry);
        trace!(uri, "lookup hit");
        Some(template)
    }

    fn install(&self, uri: &str, entry: Entry) {
        let mut entries = self.entries.lock();
        entries.shift_remove(uri);
        entries.insert(uri.to_string(), entry);
        let Some(limit) = self.collection_size else {
            return;
        };
        while entries.len() > limit {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                debug!(uri = %evicted, "evicted template from lookup");
            }
        }
    }

    fn compile_lock(&self, uri: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.compiling.lock().entry(uri.to_string()).or_default())
    }

    /// Forgets the per-URI lock once no other caller is compiling or waiting.
    fn release_compile_lock(&self, uri: &str, lock: Arc<Mutex<()>>) {
        let mut compiling = self.compiling.lock();
        let idle = compiling
            .get(uri)
            .is_some_and(|current| Arc::ptr_eq(current, &lock) && Arc::strong_count(&lock) == 2);
        drop(lock);
        if idle {
            compiling.remove(uri);
        }
    }

    fn find_file(&self, uri: &str) -> Option<PathBuf> {
        let relative = uri.trim_start_matches('/');
        self.directories
            .iter()
            .map(|directory| directory.join(relative))
            .find(|path| path.is_file())
    }

    fn load(&self, uri: &str) -> MantleResult<Template> {
        let Some(path) = self.find_file(uri) else {
            return Err(MantleError::TemplateNotFound {
                uri: uri.to_string(),
            });
        };
        let source = fs::read_to_string(&path).map_err(|err| MantleError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let modified = modified_time(&path);
        let template = Template::compile(
            source,
            uri.to_string(),
            Some(path.display().to_string()),
            self.options.clone(),
            Some(self.collection()),
        )?;
        debug!(uri, path = %path.display(), "compiled template from file");
        self.install(
            uri,
            Entry {
                template: template.clone(),
                path: Some(path),
                modified,
            },
        );
        Ok(template)
    }
}

impl TemplateCollection for LookupInner {
    fn get_template(&self, uri: &str) -> MantleResult<Template> {
        let uri = normalize_uri(uri);
        if let Some(template) = self.cached(&uri) {
            return Ok(template);
        }
        let lock = self.compile_lock(&uri);
        let result = {
            let _guard = lock.lock();
            match self.cached(&uri) {
                Some(template) => Ok(template),
                None => {
                    trace!(uri = %uri, "lookup miss");
                    self.load(&uri)
                }
            }
        };
        self.release_compile_lock(&uri, lock);
        result
    }

    fn has_template(&self, uri: &str) -> bool {
        let uri = normalize_uri(uri);
        self.entries.lock().contains_key(&uri) || self.find_file(&uri).is_some()
    }
}

impl TemplateLookup {
    /// A lookup without directories; templates come from
    /// [`TemplateLookup::put_string`].
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> LookupBuilder {
        LookupBuilder::default()
    }

    /// Compiles `source` and registers it under `uri`, replacing any
    /// template already there.
    ///
    /// # Errors
    ///
    /// Any syntax or scope error in `source`.
    pub fn put_string<U: AsRef<str>, S: Into<String>>(
        &self,
        uri: U,
        source: S,
    ) -> MantleResult<Template> {
        let uri = normalize_uri(uri.as_ref());
        let template = Template::compile(
            source.into(),
            uri.clone(),
            None,
            self.inner.options.clone(),
            Some(self.inner.collection()),
        )?;
        debug!(uri = %uri, "compiled template from string");
        self.inner.install(
            &uri,
            Entry {
                template: template.clone(),
                path: None,
                modified: None,
            },
        );
        Ok(template)
    }

    /// Registers an already compiled template under `uri`.
    pub fn put_template<U: AsRef<str>>(&self, uri: U, template: Template) {
        self.inner.install(
            &normalize_uri(uri.as_ref()),
            Entry {
                template,
                path: None,
                modified: None,
            },
        );
    }

    /// Removes the compiled template for `uri`; file templates are compiled
    /// again on next access.
    pub fn invalidate<U: AsRef<str>>(&self, uri: U) {
        self.inner.entries.lock().shift_remove(&normalize_uri(uri.as_ref()));
    }

    /// Fetches and renders the template at `uri`.
    ///
    /// # Errors
    ///
    /// See [`TemplateCollection::get_template`] and [`Template::render`].
    pub fn render<U: AsRef<str>>(&self, uri: U, context: &Context) -> MantleResult<String> {
        self.inner.get_template(uri.as_ref())?.render(context)
    }

    /// The number of compiled templates currently held.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TemplateLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateCollection for TemplateLookup {
    fn get_template(&self, uri: &str) -> MantleResult<Template> {
        self.inner.get_template(uri)
    }

    fn has_template(&self, uri: &str) -> bool {
        self.inner.has_template(uri)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    #[ntest::timeout(1000)]
    fn test_put_string_and_inherit() {
        let lookup = TemplateLookup::new();
        lookup
            .put_string("/base.html", "[${self.body()}]")
            .unwrap();
        lookup
            .put_string("sub/page.html", "<%inherit file=\"/base.html\"/>page")
            .unwrap();
        assert!(lookup.has_template("/sub/page.html"));
        assert!(lookup.has_template("sub/../base.html"));
        assert_eq!(lookup.render("/sub/page.html", &Context::new()).unwrap(), "[page]");
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_missing_template() {
        let lookup = TemplateLookup::new();
        assert!(!lookup.has_template("/nope.html"));
        assert_eq!(
            lookup.get_template("/nope.html").unwrap_err(),
            MantleError::TemplateNotFound {
                uri: "/nope.html".to_string()
            }
        );
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_collection_size_evicts_least_recently_used() {
        let lookup = TemplateLookup::builder().collection_size(2).build();
        lookup.put_string("/a", "a").unwrap();
        lookup.put_string("/b", "b").unwrap();
        lookup.get_template("/a").unwrap();
        lookup.put_string("/c", "c").unwrap();
        assert_eq!(lookup.len(), 2);
        assert!(lookup.has_template("/a"));
        assert!(!lookup.has_template("/b"));
        assert!(lookup.has_template("/c"));
    }

    #[test]
    #[ntest::timeout(2000)]
    fn test_loads_files_and_rechecks_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        fs::write(&path, "one ${n}").unwrap();

        let lookup = TemplateLookup::builder()
            .directory(dir.path())
            .filesystem_checks(true)
            .build();
        let first = lookup.get_template("/page.html").unwrap();
        assert_eq!(first.filename(), Some(path.display().to_string().as_str()));
        assert!(lookup.get_template("page.html").unwrap().ptr_eq(&first));

        fs::write(&path, "two ${n}").unwrap();
        let later = SystemTime::now() + Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let mut context = Context::new();
        context.insert("n", 2);
        let second = lookup.get_template("/page.html").unwrap();
        assert!(!second.ptr_eq(&first));
        assert_eq!(second.render(&context).unwrap(), "two 2");
    }

    #[test]
    #[ntest::timeout(2000)]
    fn test_compile_locks_are_released() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shared.html"), "shared").unwrap();
        let lookup = TemplateLookup::builder().directory(dir.path()).build();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let lookup = lookup.clone();
                scope.spawn(move || {
                    assert_eq!(lookup.render("/shared.html", &Context::new()).unwrap(), "shared");
                });
            }
        });
        assert!(lookup.get_template("/absent.html").is_err());
        assert!(lookup.inner.compiling.lock().is_empty());
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_templates_outlive_lookup_without_references() {
        let template = {
            let lookup = TemplateLookup::new();
            lookup.put_string("/base.html", "base").unwrap();
            lookup.put_string("/alone.html", "alone").unwrap()
        };
        assert_eq!(template.render(&Context::new()).unwrap(), "alone");
    }
}
