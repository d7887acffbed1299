//! Per-render execution of compiled templates.

mod builtins;
mod context;
mod interpreter;
mod namespace;

use std::{cell::RefCell, rc::Rc, sync::Arc};

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::{
    code::syntax::{FunctionDef, Lambda},
    value::Value,
};

pub(crate) use builtins::Builtin;
pub(crate) use context::RenderState;
pub(crate) use interpreter::{RenderTarget, render};
pub(crate) use namespace::{Namespace, NamespaceKind};

/// A scope of local variables, chained to the scope it was created in.
#[derive(Default)]
pub(crate) struct Frame {
    vars: RefCell<FxHashMap<String, Value>>,
    parent: Option<Rc<Frame>>,
}

impl Frame {
    pub(crate) fn new(parent: Option<Rc<Frame>>) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(FxHashMap::default()),
            parent,
        })
    }

    /// Finds `name` in this frame or the frames it is chained to.
    pub(crate) fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.lookup(name))
    }

    pub(crate) fn get_local(&self, name: &str) -> Option<Value> {
        self.vars.borrow().get(name).cloned()
    }

    pub(crate) fn set(&self, name: &str, value: Value) {
        self.vars.borrow_mut().insert(name.to_string(), value);
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Value> {
        self.vars.borrow_mut().remove(name)
    }

    /// This frame's own variables, sorted by name.
    pub(crate) fn snapshot(&self) -> IndexMap<String, Value> {
        let vars = self.vars.borrow();
        let mut entries: Vec<(&String, &Value)> = vars.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn clear(&self) {
        let drained: Vec<Value> = self.vars.borrow_mut().drain().map(|(_, v)| v).collect();
        drop(drained);
    }
}

/// Where a piece of code runs: its local frame and the template namespace
/// that owns it.
#[derive(Clone)]
pub(crate) struct Env {
    pub frame: Rc<Frame>,
    pub ns: Rc<Namespace>,
}

pub(crate) enum CallableKind {
    /// A definition of the template owning the environment.
    Def(usize),
    Lambda(Arc<Lambda>),
    Function(Arc<FunctionDef>),
}

/// A callable closing over the environment it was created in.
pub(crate) struct Callable {
    pub kind: CallableKind,
    pub env: Env,
    /// The `caller` a `<%call>` body sees when it runs.
    pub outer_caller: Option<Rc<Namespace>>,
}

impl Callable {
    pub(crate) fn new(kind: CallableKind, env: Env) -> Self {
        Self {
            kind,
            env,
            outer_caller: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        match &self.kind {
            CallableKind::Def(index) => self
                .env
                .ns
                .unit()
                .and_then(|unit| unit.defs.get(*index))
                .map_or("def", |def| def.name.as_str()),
            CallableKind::Lambda(_) => "<lambda>",
            CallableKind::Function(func) => &func.name,
        }
    }
}

/// A method looked up on a value, waiting to be called.
pub(crate) struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

/// The `loop` variable inside `% for`.
pub(crate) struct LoopContext {
    pub index: usize,
    pub length: usize,
    pub parent: Value,
}

/// How a run of steps or statements finished.
pub(crate) enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}
