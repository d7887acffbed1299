//! Dynamic values flowing through template expressions.

use std::{cell::RefCell, cmp::Ordering, collections::BTreeMap, collections::HashMap, fmt, rc::Rc, sync::Arc};

use indexmap::IndexMap;

use crate::{
    code::syntax::BinOp,
    error::{MantleError, MantleResult},
    runtime::{BoundMethod, Builtin, Callable, LoopContext, Namespace},
};

/// Keyword arguments passed to a callable, in call order.
pub type Kwargs = IndexMap<String, Value>;

type NativeFn = dyn Fn(&[Value], &Kwargs) -> MantleResult<Value> + Send + Sync;

/// A host function callable from template code.
#[derive(Clone)]
pub struct NativeFunction {
    name: Arc<str>,
    func: Arc<NativeFn>,
}

impl NativeFunction {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> MantleResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value], kwargs: &Kwargs) -> MantleResult<Value> {
        (self.func)(args, kwargs)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// A named set of host functions, importable from template code with
/// `import name` or `<%namespace module="name"/>`.
#[derive(Clone, Debug)]
pub struct NativeModule {
    name: String,
    functions: IndexMap<String, NativeFunction>,
}

impl NativeModule {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            functions: IndexMap::new(),
        }
    }

    /// Adds a function to the module.
    #[must_use]
    pub fn function<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> MantleResult<Value> + Send + Sync + 'static,
    {
        self.functions
            .insert(name.to_string(), NativeFunction::new(name, func));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn get(&self, name: &str) -> Option<&NativeFunction> {
        self.functions.get(name)
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// A runtime object that only exists during a render: callables,
/// namespaces, loop contexts and the like.
#[derive(Clone)]
pub struct Object(pub(crate) ObjectKind);

#[derive(Clone)]
pub(crate) enum ObjectKind {
    Builtin(Builtin),
    Method(Rc<BoundMethod>),
    Callable(Rc<Callable>),
    Namespace(Rc<Namespace>),
    Loop(Rc<LoopContext>),
    Module(Arc<NativeModule>),
    Context,
}

impl Object {
    fn type_name(&self) -> &'static str {
        match &self.0 {
            ObjectKind::Builtin(_) => "builtin_function_or_method",
            ObjectKind::Method(_) => "method",
            ObjectKind::Callable(_) => "function",
            ObjectKind::Namespace(_) => "namespace",
            ObjectKind::Loop(_) => "loop",
            ObjectKind::Module(_) => "module",
            ObjectKind::Context => "context",
        }
    }

    fn ptr_eq(&self, other: &Object) -> bool {
        match (&self.0, &other.0) {
            (ObjectKind::Builtin(a), ObjectKind::Builtin(b)) => a == b,
            (ObjectKind::Method(a), ObjectKind::Method(b)) => Rc::ptr_eq(a, b),
            (ObjectKind::Callable(a), ObjectKind::Callable(b)) => Rc::ptr_eq(a, b),
            (ObjectKind::Namespace(a), ObjectKind::Namespace(b)) => Rc::ptr_eq(a, b),
            (ObjectKind::Loop(a), ObjectKind::Loop(b)) => Rc::ptr_eq(a, b),
            (ObjectKind::Module(a), ObjectKind::Module(b)) => Arc::ptr_eq(a, b),
            (ObjectKind::Context, ObjectKind::Context) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ObjectKind::Builtin(builtin) => write!(f, "<built-in function {}>", builtin.name()),
            ObjectKind::Method(method) => write!(f, "<method {}>", method.name),
            ObjectKind::Callable(callable) => write!(f, "<function {}>", callable.name()),
            ObjectKind::Namespace(ns) => write!(f, "<namespace {}>", ns.name),
            ObjectKind::Loop(_) => f.write_str("<loop context>"),
            ObjectKind::Module(module) => write!(f, "<module '{}'>", module.name()),
            ObjectKind::Context => f.write_str("<context>"),
        }
    }
}

/// A dynamically typed template value.
///
/// Lists and dicts are shared and mutable, so code such as
/// `counter[0] += 1` is visible to the caller that supplied `counter`.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    None,
    /// The result of reading a name nothing defines.
    Undefined(Option<Rc<str>>),
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    Dict(Rc<RefCell<IndexMap<String, Value>>>),
    Function(NativeFunction),
    Object(Object),
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

impl Value {
    /// Builds a list value.
    pub fn list<I, T>(items: I) -> Value
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::List(Rc::new(RefCell::new(items.into_iter().map(Into::into).collect())))
    }

    /// Builds a tuple value.
    pub fn tuple<I, T>(items: I) -> Value
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Tuple(items.into_iter().map(Into::into).collect())
    }

    /// Builds a dict value. Keys are stored as strings.
    pub fn dict<I, K, T>(entries: I) -> Value
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<Value>,
    {
        Value::Dict(Rc::new(RefCell::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )))
    }

    /// Wraps a host closure as a callable value.
    pub fn function<F>(name: &str, func: F) -> Value
    where
        F: Fn(&[Value], &Kwargs) -> MantleResult<Value> + Send + Sync + 'static,
    {
        Value::Function(NativeFunction::new(name, func))
    }

    pub(crate) fn object(kind: ObjectKind) -> Value {
        Value::Object(Object(kind))
    }

    pub(crate) fn str<T: AsRef<str>>(s: T) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined(_))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None | Value::Undefined(_) => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(map) => !map.borrow().is_empty(),
            Value::Function(_) | Value::Object(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        self.as_num().map(Num::as_f64)
    }

    fn as_num(&self) -> Option<Num> {
        match self {
            Value::Int(i) => Some(Num::Int(*i)),
            Value::Bool(b) => Some(Num::Int(i64::from(*b))),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Undefined(_) => "Undefined",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::Object(object) => object.type_name(),
        }
    }

    /// The error raised when an undefined value is used.
    pub(crate) fn undefined_error(&self) -> MantleError {
        let name = match self {
            Value::Undefined(Some(name)) => name.to_string(),
            _ => "UNDEFINED".to_string(),
        };
        MantleError::UnresolvedName { name }
    }

    /// Fails if the value is undefined.
    pub(crate) fn defined(&self) -> MantleResult<&Value> {
        if self.is_undefined() {
            Err(self.undefined_error())
        } else {
            Ok(self)
        }
    }

    /// The string used when this value is a dict key.
    pub(crate) fn dict_key(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.to_string(),
        }
    }

    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => repr_str(s),
            Value::Undefined(_) => "UNDEFINED".to_string(),
            other => other.to_string(),
        }
    }

    pub(crate) fn length(&self) -> MantleResult<usize> {
        match self {
            Value::Str(s) => Ok(s.chars().count()),
            Value::List(items) => Ok(items.borrow().len()),
            Value::Tuple(items) => Ok(items.len()),
            Value::Dict(map) => Ok(map.borrow().len()),
            Value::Undefined(_) => Err(self.undefined_error()),
            other => Err(MantleError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
        }
    }

    /// Materializes the items a `for` loop over this value visits.
    pub(crate) fn iterate(&self) -> MantleResult<Vec<Value>> {
        match self {
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok(items.to_vec()),
            Value::Dict(map) => Ok(map.borrow().keys().map(Value::str).collect()),
            Value::Undefined(_) => Err(self.undefined_error()),
            other => Err(MantleError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Python's `is`: identity for containers, equality for scalars.
    pub(crate) fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) | (Value::Undefined(_), Value::Undefined(_)) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(&a.func, &b.func),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub(crate) fn compare(&self, other: &Value) -> MantleResult<Ordering> {
        if let (Some(a), Some(b)) = (self.as_num(), other.as_num()) {
            return Ok(match (a, b) {
                (Num::Int(a), Num::Int(b)) => a.cmp(&b),
                (a, b) => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal),
            });
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) => compare_sequences(&a.borrow(), &b.borrow()),
            (Value::Tuple(a), Value::Tuple(b)) => compare_sequences(a, b),
            (Value::Undefined(_), _) => Err(self.undefined_error()),
            (_, Value::Undefined(_)) => Err(other.undefined_error()),
            _ => Err(MantleError::type_error(format!(
                "'<' not supported between instances of '{}' and '{}'",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    pub(crate) fn contains(&self, item: &Value) -> MantleResult<bool> {
        match self {
            Value::Str(haystack) => match item {
                Value::Str(needle) => Ok(haystack.contains(&**needle)),
                other => Err(MantleError::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::List(items) => Ok(items.borrow().iter().any(|v| v == item)),
            Value::Tuple(items) => Ok(items.iter().any(|v| v == item)),
            Value::Dict(map) => Ok(map.borrow().contains_key(&item.dict_key())),
            Value::Undefined(_) => Err(self.undefined_error()),
            other => Err(MantleError::type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn subscript(&self, index: &Value) -> MantleResult<Value> {
        match self {
            Value::List(items) => {
                let items = items.borrow();
                let i = sequence_index(index, items.len(), "list")?;
                Ok(items[i].clone())
            }
            Value::Tuple(items) => {
                let i = sequence_index(index, items.len(), "tuple")?;
                Ok(items[i].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = sequence_index(index, chars.len(), "string")?;
                Ok(Value::str(chars[i].to_string()))
            }
            Value::Dict(map) => map
                .borrow()
                .get(&index.dict_key())
                .cloned()
                .ok_or_else(|| MantleError::Key(index.repr())),
            Value::Undefined(_) => Err(self.undefined_error()),
            other => Err(MantleError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn slice(
        &self,
        lower: Option<i64>,
        upper: Option<i64>,
        step: Option<i64>,
    ) -> MantleResult<Value> {
        match self {
            Value::List(items) => {
                let items = items.borrow();
                let picked = slice_indices(items.len(), lower, upper, step)?;
                Ok(Value::list(picked.into_iter().map(|i| items[i].clone())))
            }
            Value::Tuple(items) => {
                let picked = slice_indices(items.len(), lower, upper, step)?;
                Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone())))
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let picked = slice_indices(chars.len(), lower, upper, step)?;
                Ok(Value::str(picked.into_iter().map(|i| chars[i]).collect::<String>()))
            }
            Value::Undefined(_) => Err(self.undefined_error()),
            other => Err(MantleError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    /// Stores `value` under `index` in a list or dict.
    pub(crate) fn set_item(&self, index: &Value, value: Value) -> MantleResult<()> {
        match self {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let i = sequence_index(index, items.len(), "list assignment")?;
                items[i] = value;
                Ok(())
            }
            Value::Dict(map) => {
                map.borrow_mut().insert(index.dict_key(), value);
                Ok(())
            }
            Value::Undefined(_) => Err(self.undefined_error()),
            other => Err(MantleError::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn negate(&self) -> MantleResult<Value> {
        match self.as_num() {
            Some(Num::Int(i)) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| MantleError::Value("integer overflow".to_string())),
            Some(Num::Float(f)) => Ok(Value::Float(-f)),
            None => Err(self.defined().err().unwrap_or_else(|| {
                MantleError::type_error(format!(
                    "bad operand type for unary -: '{}'",
                    self.type_name()
                ))
            })),
        }
    }

    pub(crate) fn positive(&self) -> MantleResult<Value> {
        match self.as_num() {
            Some(Num::Int(i)) => Ok(Value::Int(i)),
            Some(Num::Float(f)) => Ok(Value::Float(f)),
            None => Err(self.defined().err().unwrap_or_else(|| {
                MantleError::type_error(format!(
                    "bad operand type for unary +: '{}'",
                    self.type_name()
                ))
            })),
        }
    }

    /// Applies an arithmetic operator with Python semantics.
    pub(crate) fn binary(op: BinOp, left: &Value, right: &Value) -> MantleResult<Value> {
        left.defined()?;
        right.defined()?;
        if let (Some(a), Some(b)) = (left.as_num(), right.as_num()) {
            return numeric_binary(op, a, b);
        }
        let unsupported = || {
            MantleError::type_error(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ))
        };
        match (op, left, right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::str(format!("{a}{b}"))),
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::list(items))
            }
            (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
                Ok(Value::tuple(a.iter().chain(b.iter()).cloned()))
            }
            (BinOp::Mul, Value::Str(s), count) | (BinOp::Mul, count, Value::Str(s)) => {
                let n = repeat_count(count).ok_or_else(unsupported)?;
                Ok(Value::str(s.repeat(n)))
            }
            (BinOp::Mul, Value::List(items), count) | (BinOp::Mul, count, Value::List(items)) => {
                let n = repeat_count(count).ok_or_else(unsupported)?;
                let items = items.borrow();
                Ok(Value::list(
                    std::iter::repeat_n(items.iter(), n).flatten().cloned(),
                ))
            }
            (BinOp::Mod, Value::Str(format), args) => format_percent(format, args).map(Value::str),
            _ => Err(unsupported()),
        }
    }
}

fn repeat_count(value: &Value) -> Option<usize> {
    value.as_int().map(|n| usize::try_from(n).unwrap_or(0))
}

fn overflow() -> MantleError {
    MantleError::Value("integer overflow".to_string())
}

fn numeric_binary(op: BinOp, a: Num, b: Num) -> MantleResult<Value> {
    if let (Num::Int(a), Num::Int(b)) = (a, b) {
        return match op {
            BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Div if b == 0 => Err(MantleError::ZeroDivision),
            BinOp::Div => Ok(Value::Float(a as f64 / b as f64)),
            BinOp::FloorDiv | BinOp::Mod if b == 0 => Err(MantleError::ZeroDivision),
            BinOp::FloorDiv => {
                let q = a.checked_div(b).ok_or_else(overflow)?;
                Ok(Value::Int(if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q }))
            }
            BinOp::Mod => {
                let r = a.checked_rem(b).ok_or_else(overflow)?;
                Ok(Value::Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }))
            }
        };
    }
    let (a, b) = (a.as_f64(), b.as_f64());
    match op {
        BinOp::Add => Ok(Value::Float(a + b)),
        BinOp::Sub => Ok(Value::Float(a - b)),
        BinOp::Mul => Ok(Value::Float(a * b)),
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => Err(MantleError::ZeroDivision),
        BinOp::Div => Ok(Value::Float(a / b)),
        BinOp::FloorDiv => Ok(Value::Float((a / b).floor())),
        BinOp::Mod => {
            let r = a % b;
            Ok(Value::Float(if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }))
        }
    }
}

fn compare_sequences(a: &[Value], b: &[Value]) -> MantleResult<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if x != y {
            return x.compare(y);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

fn sequence_index(index: &Value, len: usize, what: &str) -> MantleResult<usize> {
    let Some(i) = index.as_int() else {
        return Err(MantleError::type_error(format!(
            "{what} indices must be integers, not {}",
            index.type_name()
        )));
    };
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(MantleError::Index(format!("{what} index out of range")));
    }
    Ok(resolved as usize)
}

fn slice_indices(
    len: usize,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> MantleResult<Vec<usize>> {
    let len = len as i64;
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(MantleError::Value("slice step cannot be zero".to_string()));
    }
    let normalize = |bound: i64, low: i64, high: i64| {
        let bound = if bound < 0 { bound + len } else { bound };
        bound.clamp(low, high)
    };
    let mut picked = Vec::new();
    if step > 0 {
        let mut i = lower.map_or(0, |l| normalize(l, 0, len));
        let stop = upper.map_or(len, |u| normalize(u, 0, len));
        while i < stop {
            picked.push(i as usize);
            i += step;
        }
    } else {
        let mut i = lower.map_or(len - 1, |l| normalize(l, -1, len - 1));
        let stop = upper.map_or(-1, |u| normalize(u, -1, len - 1));
        while i > stop {
            picked.push(i as usize);
            i += step;
        }
    }
    Ok(picked)
}

fn repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f == f.trunc() && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f:?}")
    }
}

/// Python's printf-style `format % args`.
fn format_percent(format: &str, args: &Value) -> MantleResult<String> {
    let positional: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    let mut next_arg = positional.iter();
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let mut mapping_key = None;
        if chars.peek() == Some(&'(') {
            chars.next();
            let key: String = chars.by_ref().take_while(|c| *c != ')').collect();
            mapping_key = Some(key);
        }
        let mut left_align = false;
        let mut zero_pad = false;
        let mut plus = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => left_align = true,
                '0' => zero_pad = true,
                '+' => plus = true,
                ' ' | '#' => {}
                _ => break,
            }
            chars.next();
        }
        let mut width = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + d as usize;
            chars.next();
        }
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                p = p * 10 + d as usize;
                chars.next();
            }
            precision = Some(p);
        }
        let Some(conversion) = chars.next() else {
            return Err(MantleError::Value("incomplete format".to_string()));
        };

        let arg = match &mapping_key {
            Some(key) => args.subscript(&Value::str(key))?,
            None => next_arg
                .next()
                .cloned()
                .ok_or_else(|| MantleError::type_error("not enough arguments for format string"))?,
        };
        arg.defined()?;

        let numeric = |arg: &Value| {
            arg.as_num().ok_or_else(|| {
                MantleError::type_error(format!(
                    "%{conversion} format: a number is required, not {}",
                    arg.type_name()
                ))
            })
        };
        let mut text = match conversion {
            's' => {
                let s = arg.to_string();
                match precision {
                    Some(p) => s.chars().take(p).collect(),
                    None => s,
                }
            }
            'r' => arg.repr(),
            'd' | 'i' => match numeric(&arg)? {
                Num::Int(i) => i.to_string(),
                Num::Float(f) => (f.trunc() as i64).to_string(),
            },
            'f' | 'F' => format!("{:.*}", precision.unwrap_or(6), numeric(&arg)?.as_f64()),
            'e' | 'E' => {
                let rendered = format!("{:.*e}", precision.unwrap_or(6), numeric(&arg)?.as_f64());
                let (mantissa, exponent) = rendered.split_once('e').unwrap_or((rendered.as_str(), "0"));
                let exponent: i32 = exponent.parse().unwrap_or(0);
                let sign = if exponent < 0 { '-' } else { '+' };
                let text = format!("{mantissa}e{sign}{:02}", exponent.abs());
                if conversion == 'E' { text.to_uppercase() } else { text }
            }
            'g' | 'G' => match numeric(&arg)? {
                Num::Int(i) => i.to_string(),
                Num::Float(f) => format!("{f}"),
            },
            'x' | 'X' | 'o' => {
                let i = match numeric(&arg)? {
                    Num::Int(i) => i,
                    Num::Float(_) => {
                        return Err(MantleError::type_error(format!(
                            "%{conversion} format: an integer is required, not float"
                        )));
                    }
                };
                let (sign, magnitude) = if i < 0 { ("-", i.unsigned_abs()) } else { ("", i as u64) };
                match conversion {
                    'x' => format!("{sign}{magnitude:x}"),
                    'X' => format!("{sign}{magnitude:X}"),
                    _ => format!("{sign}{magnitude:o}"),
                }
            }
            'c' => match &arg {
                Value::Str(s) => s.to_string(),
                other => other
                    .as_int()
                    .and_then(|i| u32::try_from(i).ok())
                    .and_then(char::from_u32)
                    .map(String::from)
                    .ok_or_else(|| MantleError::type_error("%c requires int or char"))?,
            },
            other => {
                return Err(MantleError::Value(format!(
                    "unsupported format character '{other}'"
                )));
            }
        };

        let is_number = matches!(conversion, 'd' | 'i' | 'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'x' | 'X' | 'o');
        if plus && is_number && !text.starts_with('-') {
            text.insert(0, '+');
        }
        let len = text.chars().count();
        if len < width {
            let fill = width - len;
            if left_align {
                text.push_str(&" ".repeat(fill));
            } else if zero_pad && is_number {
                let sign_len = usize::from(text.starts_with(['-', '+']));
                text.insert_str(sign_len, &"0".repeat(fill));
            } else {
                text.insert_str(0, &" ".repeat(fill));
            }
        }
        out.push_str(&text);
    }

    if mapping_key_free(format) && next_arg.next().is_some() {
        return Err(MantleError::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

/// True when a format string uses no `%(name)` mapping keys.
fn mapping_key_free(format: &str) -> bool {
    !format.contains("%(")
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_num(), other.as_num()) {
            return match (a, b) {
                (Num::Int(a), Num::Int(b)) => a == b,
                (a, b) => a.as_f64() == b.as_f64(),
            };
        }
        match (self, other) {
            (Value::None, Value::None) | (Value::Undefined(_), Value::Undefined(_)) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(&a.func, &b.func),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Python's `str()` of the value.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Undefined(_) => f.write_str(""),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                let items: Vec<String> = items.borrow().iter().map(Value::repr).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                if parts.len() == 1 {
                    write!(f, "({},)", parts[0])
                } else {
                    write!(f, "({})", parts.join(", "))
                }
            }
            Value::Dict(map) => {
                let parts: Vec<String> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", repr_str(k), v.repr()))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Value::Function(func) => write!(f, "<function {}>", func.name()),
            Value::Object(object) => write!(f, "{object}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::str(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Rc::from(value))
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Int(i64::from(value))
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        i64::try_from(value).map_or(Value::Float(value as f64), Value::Int)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::None, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::list(value)
    }
}

impl<K: Into<String>, T: Into<Value>> From<IndexMap<K, T>> for Value {
    fn from(value: IndexMap<K, T>) -> Self {
        Value::dict(value)
    }
}

impl<K: Into<String>, T: Into<Value>> From<BTreeMap<K, T>> for Value {
    fn from(value: BTreeMap<K, T>) -> Self {
        Value::dict(value)
    }
}

impl<K: Into<String>, T: Into<Value>, S> From<HashMap<K, T, S>> for Value {
    fn from(value: HashMap<K, T, S>) -> Self {
        Value::dict(value)
    }
}

impl From<NativeFunction> for Value {
    fn from(value: NativeFunction) -> Self {
        Value::Function(value)
    }
}

#[cfg(feature = "serde")]
impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::from(s),
            serde_json::Value::Array(items) => Value::list(items),
            serde_json::Value::Object(map) => Value::dict(map),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_python_display() {
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
        assert_eq!(Value::Float(0.25).to_string(), "0.25");
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(Value::None.to_string(), "None");
        assert_eq!(Value::list(vec![Value::Int(1), Value::from("a")]).to_string(), "[1, 'a']");
        assert_eq!(Value::tuple(vec![1]).to_string(), "(1,)");
        assert_eq!(Value::dict(vec![("k", 2)]).to_string(), "{'k': 2}");
        assert_eq!(Value::from("it's").repr(), "\"it's\"");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_floor_division_and_modulo() {
        let div = |a: i64, b: i64| Value::binary(BinOp::FloorDiv, &Value::Int(a), &Value::Int(b)).unwrap();
        let rem = |a: i64, b: i64| Value::binary(BinOp::Mod, &Value::Int(a), &Value::Int(b)).unwrap();
        assert_eq!(div(-7, 2), Value::Int(-4));
        assert_eq!(div(7, -2), Value::Int(-4));
        assert_eq!(rem(-7, 2), Value::Int(1));
        assert_eq!(rem(7, -2), Value::Int(-1));
        assert_eq!(
            Value::binary(BinOp::Div, &Value::Int(1), &Value::Int(0)),
            Err(MantleError::ZeroDivision)
        );
        assert_eq!(
            Value::binary(BinOp::Div, &Value::Int(3), &Value::Int(2)).unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_mixed_operands() {
        assert_eq!(
            Value::binary(BinOp::Add, &Value::from("a"), &Value::from("b")).unwrap(),
            Value::from("ab")
        );
        assert_eq!(
            Value::binary(BinOp::Mul, &Value::from("ab"), &Value::Int(2)).unwrap(),
            Value::from("abab")
        );
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        let err = Value::binary(BinOp::Add, &Value::Int(1), &Value::from("a")).unwrap_err();
        assert_eq!(err.exception_name(), "TypeError");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_percent_formatting() {
        let fmt = |f: &str, args: Value| Value::binary(BinOp::Mod, &Value::from(f), &args).unwrap();
        assert_eq!(fmt("%s-%d", Value::tuple(vec![Value::from("a"), Value::Int(3)])), Value::from("a-3"));
        assert_eq!(fmt("%.2f", Value::Float(3.14159)), Value::from("3.14"));
        assert_eq!(fmt("%05d", Value::Int(42)), Value::from("00042"));
        assert_eq!(fmt("%(name)s!", Value::dict(vec![("name", "x")])), Value::from("x!"));
        assert_eq!(fmt("100%%", Value::tuple(Vec::<Value>::new())), Value::from("100%"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_indexing_and_slicing() {
        let list = Value::list(vec![1, 2, 3, 4]);
        assert_eq!(list.subscript(&Value::Int(-1)).unwrap(), Value::Int(4));
        assert_eq!(list.slice(Some(1), Some(3), None).unwrap(), Value::list(vec![2, 3]));
        assert_eq!(list.slice(None, None, Some(-1)).unwrap(), Value::list(vec![4, 3, 2, 1]));
        assert_eq!(Value::from("hello").slice(None, Some(2), None).unwrap(), Value::from("he"));
        assert_eq!(
            list.subscript(&Value::Int(9)).unwrap_err().exception_name(),
            "IndexError"
        );
        let dict = Value::dict(vec![("a", 1)]);
        assert_eq!(dict.subscript(&Value::from("b")), Err(MantleError::Key("'b'".to_string())));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_undefined_is_lazy() {
        let undefined = Value::Undefined(Some(Rc::from("missing")));
        assert!(!undefined.is_truthy());
        assert!(undefined.is_identical(&Value::Undefined(None)));
        assert_eq!(
            undefined.iterate().unwrap_err(),
            MantleError::UnresolvedName {
                name: "missing".to_string()
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_shared_list_mutation() {
        let list = Value::list(vec![0]);
        let alias = list.clone();
        alias.set_item(&Value::Int(0), Value::Int(5)).unwrap();
        assert_eq!(list.subscript(&Value::Int(0)).unwrap(), Value::Int(5));
    }
}
