//! Block-level output caching with pluggable backends.
//!
//! Backends are registered process-wide under a type tag. Every template
//! owns a [`TemplateCache`] that creates the backends its cached definitions
//! name on first use.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::{MantleError, MantleResult};

/// Per-call options passed through to a backend.
#[derive(Debug, Clone)]
pub struct CacheArgs {
    /// How long an entry stays valid after it was stored.
    pub timeout: Option<Duration>,
    /// A named partition of the backend.
    pub region: Option<String>,
    /// The instant the operation is evaluated at. Renders pass their start
    /// time so every lookup within one render agrees on expiry.
    pub now: Instant,
}

impl Default for CacheArgs {
    fn default() -> Self {
        Self {
            timeout: None,
            region: None,
            now: Instant::now(),
        }
    }
}

/// Storage for rendered definition output.
///
/// Implementations are shared across concurrent renders. `get_or_create`
/// must run `create` at most once per key while other callers wait, and must
/// only store a value after `create` succeeds.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str, args: &CacheArgs) -> MantleResult<Option<String>>;

    fn put(&self, key: &str, value: String, args: &CacheArgs) -> MantleResult<()>;

    fn get_or_create(
        &self,
        key: &str,
        create: &mut dyn FnMut() -> MantleResult<String>,
        args: &CacheArgs,
    ) -> MantleResult<String>;

    fn invalidate(&self, key: &str, args: &CacheArgs) -> MantleResult<()>;
}

/// Builds a fresh backend instance for one template.
pub type CacheFactory = Arc<dyn Fn() -> Arc<dyn CacheBackend> + Send + Sync>;

static REGISTRY: Lazy<RwLock<FxHashMap<String, CacheFactory>>> = Lazy::new(|| {
    let mut registry: FxHashMap<String, CacheFactory> = FxHashMap::default();
    registry.insert(
        "memory".to_string(),
        Arc::new(|| Arc::new(MemoryCache::new()) as Arc<dyn CacheBackend>),
    );
    RwLock::new(registry)
});

/// Registers a cache backend under `name`, replacing any previous one.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use mantle::{register_cache_impl, CacheBackend, MemoryCache};
///
/// register_cache_impl("scratch", || Arc::new(MemoryCache::new()) as Arc<dyn CacheBackend>);
/// ```
pub fn register_cache_impl<F>(name: &str, factory: F)
where
    F: Fn() -> Arc<dyn CacheBackend> + Send + Sync + 'static,
{
    debug!(backend = name, "registering cache backend");
    REGISTRY.write().insert(name.to_string(), Arc::new(factory));
}

pub(crate) fn create_backend(name: &str) -> MantleResult<Arc<dyn CacheBackend>> {
    let registry = REGISTRY.read();
    let factory = registry.get(name).ok_or_else(|| MantleError::CacheBackend {
        backend: name.to_string(),
        message: "no cache implementation is registered under this name".to_string(),
    })?;
    Ok(factory())
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    stored_at: Instant,
}

/// The default in-process backend.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<FxHashMap<String, Entry>>,
    creation_locks: Mutex<FxHashMap<String, Arc<ReentrantMutex<()>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(key: &str, args: &CacheArgs) -> String {
        match &args.region {
            Some(region) => format!("{region}\u{0}{key}"),
            None => key.to_string(),
        }
    }

    fn lookup(&self, full_key: &str, args: &CacheArgs) -> Option<String> {
        let entries = self.entries.read();
        let entry = entries.get(full_key)?;
        if let Some(timeout) = args.timeout {
            if args.now.saturating_duration_since(entry.stored_at) > timeout {
                return None;
            }
        }
        Some(entry.value.clone())
    }
}

impl MemoryCache {
    /// Drops the per-key lock once no other caller holds or waits on it.
    fn release_creation_lock(&self, full_key: &str, lock: Arc<ReentrantMutex<()>>) {
        let mut locks = self.creation_locks.lock();
        let idle = locks
            .get(full_key)
            .is_some_and(|current| Arc::ptr_eq(current, &lock) && Arc::strong_count(&lock) == 2);
        // Dropped while the map is locked so the last caller out sees a count of 2.
        drop(lock);
        if idle {
            locks.remove(full_key);
        }
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str, args: &CacheArgs) -> MantleResult<Option<String>> {
        Ok(self.lookup(&Self::full_key(key, args), args))
    }

    fn put(&self, key: &str, value: String, args: &CacheArgs) -> MantleResult<()> {
        self.entries.write().insert(
            Self::full_key(key, args),
            Entry {
                value,
                stored_at: args.now,
            },
        );
        Ok(())
    }

    fn get_or_create(
        &self,
        key: &str,
        create: &mut dyn FnMut() -> MantleResult<String>,
        args: &CacheArgs,
    ) -> MantleResult<String> {
        let full_key = Self::full_key(key, args);
        if let Some(value) = self.lookup(&full_key, args) {
            return Ok(value);
        }

        let lock = self
            .creation_locks
            .lock()
            .entry(full_key.clone())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock();
            // Another caller may have finished creating while we waited.
            match self.lookup(&full_key, args) {
                Some(value) => Ok(value),
                None => create().map(|value| {
                    self.entries.write().insert(
                        full_key.clone(),
                        Entry {
                            value: value.clone(),
                            stored_at: args.now,
                        },
                    );
                    value
                }),
            }
        };
        self.release_creation_lock(&full_key, lock);
        result
    }

    fn invalidate(&self, key: &str, args: &CacheArgs) -> MantleResult<()> {
        self.entries.write().remove(&Self::full_key(key, args));
        Ok(())
    }
}

/// The backend and region a cached definition declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CachePlacement {
    pub cache_type: Option<String>,
    pub region: Option<String>,
}

/// The cache attached to one compiled template.
///
/// Definitions marked `cached="True"` store their output here under their
/// `cache_key`, or `render_<name>` when no key is given.
pub struct TemplateCache {
    uri: String,
    default_type: String,
    backends: Mutex<FxHashMap<String, Arc<dyn CacheBackend>>>,
    placements: FxHashMap<String, CachePlacement>,
}

impl TemplateCache {
    pub(crate) fn new(uri: &str, default_type: &str) -> Self {
        Self {
            uri: uri.to_string(),
            default_type: default_type.to_string(),
            backends: Mutex::new(FxHashMap::default()),
            placements: FxHashMap::default(),
        }
    }

    /// Records where each cached definition keeps its output, by name.
    pub(crate) fn with_placements(
        mut self,
        placements: impl IntoIterator<Item = (String, CachePlacement)>,
    ) -> Self {
        for (name, placement) in placements {
            self.placements.entry(name).or_insert(placement);
        }
        self
    }

    fn backend(&self, cache_type: Option<&str>) -> MantleResult<Arc<dyn CacheBackend>> {
        let cache_type = cache_type.unwrap_or(&self.default_type);
        let mut backends = self.backends.lock();
        if let Some(backend) = backends.get(cache_type) {
            return Ok(Arc::clone(backend));
        }
        let backend = create_backend(cache_type)?;
        backends.insert(cache_type.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    /// Reads an entry from the default backend.
    ///
    /// # Errors
    ///
    /// Returns `MantleError::CacheBackend` if the backend is not registered or
    /// fails.
    pub fn get(&self, key: &str) -> MantleResult<Option<String>> {
        self.backend(None)?.get(key, &CacheArgs::default())
    }

    /// Stores an entry in the default backend.
    ///
    /// # Errors
    ///
    /// Returns `MantleError::CacheBackend` if the backend is not registered or
    /// fails.
    pub fn put(&self, key: &str, value: &str) -> MantleResult<()> {
        trace!(uri = %self.uri, key, "cache put");
        self.backend(None)?
            .put(key, value.to_string(), &CacheArgs::default())
    }

    /// Removes an entry from the default backend.
    ///
    /// # Errors
    ///
    /// Returns `MantleError::CacheBackend` if the backend is not registered or
    /// fails.
    pub fn invalidate(&self, key: &str) -> MantleResult<()> {
        debug!(uri = %self.uri, key, "cache invalidate");
        self.backend(None)?.invalidate(key, &CacheArgs::default())
    }

    /// Removes the cached output of the definition called `name`, in the
    /// backend and region the definition declared.
    ///
    /// Only output stored under the default `render_<name>` key is removed;
    /// entries written under an explicit `cache_key` must be invalidated by
    /// that key.
    ///
    /// # Errors
    ///
    /// See [`TemplateCache::invalidate`].
    pub fn invalidate_def(&self, name: &str) -> MantleResult<()> {
        let key = format!("render_{name}");
        let placement = self.placements.get(name).cloned().unwrap_or_default();
        debug!(uri = %self.uri, key, region = ?placement.region, "cache invalidate");
        let args = CacheArgs {
            region: placement.region,
            ..CacheArgs::default()
        };
        self.backend(placement.cache_type.as_deref())?
            .invalidate(&key, &args)
    }

    /// Removes the cached output of the template body.
    ///
    /// # Errors
    ///
    /// See [`TemplateCache::invalidate`].
    pub fn invalidate_body(&self) -> MantleResult<()> {
        self.invalidate_def("body")
    }

    pub(crate) fn get_or_create(
        &self,
        key: &str,
        cache_type: Option<&str>,
        args: &CacheArgs,
        create: &mut dyn FnMut() -> MantleResult<String>,
    ) -> MantleResult<String> {
        let backend = self.backend(cache_type)?;
        let mut created = false;
        let value = backend.get_or_create(
            key,
            &mut || {
                created = true;
                create()
            },
            args,
        )?;
        if created {
            debug!(uri = %self.uri, key, "cache miss, stored");
        } else {
            trace!(uri = %self.uri, key, "cache hit");
        }
        Ok(value)
    }
}

impl fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateCache")
            .field("uri", &self.uri)
            .field("default_type", &self.default_type)
            .finish_non_exhaustive()
    }
}
