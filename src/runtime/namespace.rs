use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    sync::Arc,
};

use indexmap::IndexMap;
use once_cell::unsync::OnceCell;
use rustc_hash::FxHashMap;

use super::{Env, Frame};
use crate::{compiler::CompiledUnit, template::Template, value::NativeModule};

pub(crate) enum NamespaceKind {
    /// A template with its module-level frame.
    Template { template: Template, frame: Rc<Frame> },
    /// `<%namespace name="x">` with nested `<%def>`s of the owning template.
    Inline {
        defs: IndexMap<String, usize>,
        owner: Env,
    },
    Module(Arc<NativeModule>),
    /// The body of a `<%call>` tag, exposed to the callee as `caller`.
    Caller {
        body: usize,
        env: Env,
        outer_caller: Option<Rc<Namespace>>,
    },
}

/// A runtime handle to a set of callables.
///
/// The `self`, `inherits` and `next` links are set once while the
/// inheritance chain is built and never change afterwards.
pub(crate) struct Namespace {
    pub(crate) name: String,
    pub(crate) kind: NamespaceKind,
    self_ns: OnceCell<Weak<Namespace>>,
    inherits: OnceCell<Weak<Namespace>>,
    next: OnceCell<Weak<Namespace>>,
    imports: RefCell<FxHashMap<String, Rc<Namespace>>>,
}

impl Namespace {
    pub(crate) fn new(name: impl Into<String>, kind: NamespaceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            self_ns: OnceCell::new(),
            inherits: OnceCell::new(),
            next: OnceCell::new(),
            imports: RefCell::new(FxHashMap::default()),
        }
    }

    pub(crate) fn template(&self) -> Option<&Template> {
        match &self.kind {
            NamespaceKind::Template { template, .. } => Some(template),
            _ => None,
        }
    }

    pub(crate) fn unit(&self) -> Option<&CompiledUnit> {
        self.template().map(Template::unit)
    }

    pub(crate) fn module_frame(&self) -> Option<&Rc<Frame>> {
        match &self.kind {
            NamespaceKind::Template { frame, .. } => Some(frame),
            _ => None,
        }
    }

    pub(crate) fn self_ns(&self) -> Option<Rc<Namespace>> {
        self.self_ns.get().and_then(Weak::upgrade)
    }

    pub(crate) fn inherits(&self) -> Option<Rc<Namespace>> {
        self.inherits.get().and_then(Weak::upgrade)
    }

    pub(crate) fn next(&self) -> Option<Rc<Namespace>> {
        self.next.get().and_then(Weak::upgrade)
    }

    pub(crate) fn set_self(&self, ns: &Rc<Namespace>) {
        let _ = self.self_ns.set(Rc::downgrade(ns));
    }

    pub(crate) fn set_inherits(&self, ns: &Rc<Namespace>) {
        let _ = self.inherits.set(Rc::downgrade(ns));
    }

    pub(crate) fn set_next(&self, ns: &Rc<Namespace>) {
        let _ = self.next.set(Rc::downgrade(ns));
    }

    /// A namespace this one declared with `<%namespace>`, if already loaded.
    pub(crate) fn import(&self, name: &str) -> Option<Rc<Namespace>> {
        self.imports.borrow().get(name).cloned()
    }

    pub(crate) fn store_import(&self, name: &str, ns: Rc<Namespace>) {
        self.imports.borrow_mut().insert(name.to_string(), ns);
    }

    /// Drops the references that can form cycles through this namespace.
    pub(crate) fn release(&self) {
        let imports: Vec<Rc<Namespace>> = self.imports.borrow_mut().drain().map(|(_, ns)| ns).collect();
        drop(imports);
    }
}
