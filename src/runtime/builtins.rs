//! Builtin functions and the methods of plain values.

use std::{cell::RefCell, cmp::Ordering, rc::Rc};

use indexmap::IndexMap;
use phf::phf_map;

use super::{BoundMethod, interpreter::Interpreter};
use crate::{
    code::syntax::BinOp,
    error::{MantleError, MantleResult},
    value::{Kwargs, Object, ObjectKind, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Len,
    Str,
    Int,
    Float,
    Bool,
    Range,
    Enumerate,
    List,
    Tuple,
    Dict,
    Sorted,
    Reversed,
    Min,
    Max,
    Abs,
    Sum,
    Zip,
    Repr,
    Any,
    All,
    Capture,
}

static BUILTINS: phf::Map<&'static str, Builtin> = phf_map! {
    "len" => Builtin::Len,
    "str" => Builtin::Str,
    "int" => Builtin::Int,
    "float" => Builtin::Float,
    "bool" => Builtin::Bool,
    "range" => Builtin::Range,
    "enumerate" => Builtin::Enumerate,
    "list" => Builtin::List,
    "tuple" => Builtin::Tuple,
    "dict" => Builtin::Dict,
    "sorted" => Builtin::Sorted,
    "reversed" => Builtin::Reversed,
    "min" => Builtin::Min,
    "max" => Builtin::Max,
    "abs" => Builtin::Abs,
    "sum" => Builtin::Sum,
    "zip" => Builtin::Zip,
    "repr" => Builtin::Repr,
    "any" => Builtin::Any,
    "all" => Builtin::All,
    "capture" => Builtin::Capture,
};

const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "split", "join", "replace", "startswith",
    "endswith", "title", "capitalize", "find", "count", "isdigit",
];
const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "index", "count", "remove", "reverse",
];
const DICT_METHODS: &[&str] = &["get", "keys", "values", "items", "update", "pop", "setdefault"];
const CONTEXT_METHODS: &[&str] = &["write", "get", "keys", "has"];

impl Builtin {
    pub(crate) fn lookup(name: &str) -> Option<Self> {
        BUILTINS.get(name).copied()
    }

    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Len => "len",
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Range => "range",
            Self::Enumerate => "enumerate",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Dict => "dict",
            Self::Sorted => "sorted",
            Self::Reversed => "reversed",
            Self::Min => "min",
            Self::Max => "max",
            Self::Abs => "abs",
            Self::Sum => "sum",
            Self::Zip => "zip",
            Self::Repr => "repr",
            Self::Any => "any",
            Self::All => "all",
            Self::Capture => "capture",
        }
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> MantleResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {min}")
        } else {
            format!("from {min} to {max}")
        };
        return Err(MantleError::type_error(format!(
            "{name}() takes {expected} argument(s) ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn int_arg(name: &str, value: &Value) -> MantleResult<i64> {
    value.defined()?;
    value.as_int().ok_or_else(|| {
        MantleError::type_error(format!(
            "{name}() expected an integer, got '{}'",
            value.type_name()
        ))
    })
}

fn str_arg<'v>(name: &str, value: &'v Value) -> MantleResult<&'v str> {
    value.defined()?;
    value.as_str().ok_or_else(|| {
        MantleError::type_error(format!(
            "{name}() argument must be str, not '{}'",
            value.type_name()
        ))
    })
}

fn sort_by_keys(items: &mut [(Value, Value)]) -> MantleResult<()> {
    let mut error = None;
    items.sort_by(|a, b| match a.0.compare(&b.0) {
        Ok(ordering) => ordering,
        Err(err) => {
            error.get_or_insert(err);
            Ordering::Equal
        }
    });
    error.map_or(Ok(()), Err)
}

fn extreme(name: &str, args: Vec<Value>, wanted: Ordering) -> MantleResult<Value> {
    let items = if args.len() == 1 { args[0].iterate()? } else { args };
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            Some(current) if item.compare(&current)? != wanted => current,
            _ => item,
        });
    }
    best.ok_or_else(|| MantleError::Value(format!("{name}() arg is an empty sequence")))
}

pub(crate) fn call_builtin(
    interp: &mut Interpreter<'_>,
    builtin: Builtin,
    mut args: Vec<Value>,
    kwargs: Kwargs,
) -> MantleResult<Value> {
    let name = builtin.name();
    match builtin {
        Builtin::Len => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Int(args[0].length()? as i64))
        }
        Builtin::Str => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                Some(value) => Ok(Value::str(value.defined()?.to_string())),
                None => Ok(Value::str("")),
            }
        }
        Builtin::Int => {
            arity(name, &args, 0, 1)?;
            let Some(value) = args.first() else {
                return Ok(Value::Int(0));
            };
            match value.defined()? {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
                Value::Float(_) => Err(MantleError::Value(
                    "cannot convert float infinity or NaN to integer".to_string(),
                )),
                Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    MantleError::Value(format!(
                        "invalid literal for int() with base 10: {}",
                        value.repr()
                    ))
                }),
                other => Err(MantleError::type_error(format!(
                    "int() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Float => {
            arity(name, &args, 0, 1)?;
            let Some(value) = args.first() else {
                return Ok(Value::Float(0.0));
            };
            if let Some(f) = value.as_float() {
                return Ok(Value::Float(f));
            }
            match value.defined()? {
                Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    MantleError::Value(format!(
                        "could not convert string to float: {}",
                        value.repr()
                    ))
                }),
                other => Err(MantleError::type_error(format!(
                    "float() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Bool => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::is_truthy)))
        }
        Builtin::Range => {
            arity(name, &args, 1, 3)?;
            let ints = args
                .iter()
                .map(|arg| int_arg(name, arg))
                .collect::<MantleResult<Vec<_>>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => (0, 0, 1),
            };
            if step == 0 {
                return Err(MantleError::Value(
                    "range() arg 3 must not be zero".to_string(),
                ));
            }
            let mut items = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                items.push(Value::Int(i));
                i = i.saturating_add(step);
            }
            Ok(Value::list(items))
        }
        Builtin::Enumerate => {
            arity(name, &args, 1, 2)?;
            let start = match args.get(1).or_else(|| kwargs.get("start")) {
                Some(start) => int_arg(name, start)?,
                None => 0,
            };
            let items = args[0].iterate()?;
            Ok(Value::list(items.into_iter().zip(start..).map(
                |(item, i)| Value::tuple([Value::Int(i), item]),
            )))
        }
        Builtin::List => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                Some(value) => Ok(Value::list(value.iterate()?)),
                None => Ok(Value::list(Vec::<Value>::new())),
            }
        }
        Builtin::Tuple => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                Some(value) => Ok(Value::tuple(value.iterate()?)),
                None => Ok(Value::tuple(Vec::<Value>::new())),
            }
        }
        Builtin::Dict => {
            arity(name, &args, 0, 1)?;
            let mut map = IndexMap::new();
            match args.first() {
                Some(Value::Dict(source)) => map.extend(
                    source
                        .borrow()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                ),
                Some(pairs) => {
                    for pair in pairs.iterate()? {
                        match pair.iterate()?.as_slice() {
                            [key, value] => {
                                map.insert(key.dict_key(), value.clone());
                            }
                            _ => {
                                return Err(MantleError::Value(
                                    "dictionary update sequence element has the wrong length"
                                        .to_string(),
                                ));
                            }
                        }
                    }
                }
                None => {}
            }
            map.extend(kwargs);
            Ok(Value::Dict(Rc::new(RefCell::new(map))))
        }
        Builtin::Sorted => {
            arity(name, &args, 1, 1)?;
            let items = args[0].iterate()?;
            let mut keyed = Vec::with_capacity(items.len());
            for item in items {
                let key = match kwargs.get("key") {
                    Some(key) if !matches!(key, Value::None) => {
                        interp.call_value(key, vec![item.clone()], Kwargs::new())?
                    }
                    _ => item.clone(),
                };
                keyed.push((key, item));
            }
            sort_by_keys(&mut keyed)?;
            if kwargs.get("reverse").is_some_and(Value::is_truthy) {
                keyed.reverse();
            }
            Ok(Value::list(keyed.into_iter().map(|(_, item)| item)))
        }
        Builtin::Reversed => {
            arity(name, &args, 1, 1)?;
            let mut items = args[0].iterate()?;
            items.reverse();
            Ok(Value::list(items))
        }
        Builtin::Min => extreme(name, args, Ordering::Less),
        Builtin::Max => extreme(name, args, Ordering::Greater),
        Builtin::Abs => {
            arity(name, &args, 1, 1)?;
            match args[0].defined()? {
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| MantleError::Value("integer overflow".to_string())),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(MantleError::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Sum => {
            arity(name, &args, 1, 2)?;
            let mut total = args
                .get(1)
                .or_else(|| kwargs.get("start"))
                .cloned()
                .unwrap_or(Value::Int(0));
            for item in args[0].iterate()? {
                total = Value::binary(BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        Builtin::Zip => {
            let columns = args
                .iter()
                .map(Value::iterate)
                .collect::<MantleResult<Vec<_>>>()?;
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::list((0..rows).map(|row| {
                Value::tuple(columns.iter().map(|column| column[row].clone()))
            })))
        }
        Builtin::Repr => {
            arity(name, &args, 1, 1)?;
            Ok(Value::str(args[0].repr()))
        }
        Builtin::Any => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(args[0].iterate()?.iter().any(Value::is_truthy)))
        }
        Builtin::All => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(args[0].iterate()?.iter().all(Value::is_truthy)))
        }
        Builtin::Capture => {
            if args.is_empty() {
                return Err(MantleError::type_error(
                    "capture() requires a callable".to_string(),
                ));
            }
            let callable = args.remove(0);
            interp.state.push_buffer();
            let result = interp.call_value(&callable, args, kwargs);
            let captured = interp.state.pop_buffer();
            result?;
            Ok(Value::str(captured))
        }
    }
}

fn no_attribute(value: &Value, name: &str) -> MantleError {
    MantleError::NamespaceMember {
        namespace: value.type_name().to_string(),
        member: name.to_string(),
    }
}

fn method(receiver: &Value, name: &str) -> Value {
    Value::object(ObjectKind::Method(Rc::new(BoundMethod {
        receiver: receiver.clone(),
        name: name.to_string(),
    })))
}

/// Attribute access on anything other than a namespace.
pub(crate) fn attribute(value: &Value, name: &str) -> MantleResult<Value> {
    match value {
        Value::Undefined(_) => Err(value.undefined_error()),
        Value::Str(_) if STR_METHODS.contains(&name) => Ok(method(value, name)),
        Value::List(_) if LIST_METHODS.contains(&name) => Ok(method(value, name)),
        Value::Dict(_) if DICT_METHODS.contains(&name) => Ok(method(value, name)),
        Value::Dict(map) => map
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| no_attribute(value, name)),
        Value::Object(Object(ObjectKind::Loop(state))) => {
            let index = state.index;
            let last = state.length.saturating_sub(1);
            match name {
                "index" => Ok(Value::Int(index as i64)),
                "reverse_index" => Ok(Value::Int(last.saturating_sub(index) as i64)),
                "first" => Ok(Value::Bool(index == 0)),
                "last" => Ok(Value::Bool(index == last)),
                "even" => Ok(Value::Bool(index % 2 == 0)),
                "odd" => Ok(Value::Bool(index % 2 == 1)),
                "length" => Ok(Value::Int(state.length as i64)),
                "parent" => Ok(state.parent.clone()),
                "cycle" => Ok(method(value, name)),
                _ => Err(no_attribute(value, name)),
            }
        }
        Value::Object(Object(ObjectKind::Context)) if CONTEXT_METHODS.contains(&name) => {
            Ok(method(value, name))
        }
        Value::Object(Object(ObjectKind::Module(module))) => module
            .get(name)
            .map(|func| Value::Function(func.clone()))
            .ok_or_else(|| MantleError::NamespaceMember {
                namespace: module.name().to_string(),
                member: name.to_string(),
            }),
        other => Err(no_attribute(other, name)),
    }
}

pub(crate) fn call_method(
    interp: &mut Interpreter<'_>,
    bound: &BoundMethod,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> MantleResult<Value> {
    let name = bound.name.as_str();
    match &bound.receiver {
        Value::Str(s) => str_method(s, name, &args),
        Value::List(items) => list_method(items, name, args),
        Value::Dict(map) => dict_method(map, name, args, kwargs),
        Value::Object(Object(ObjectKind::Loop(state))) => {
            if args.is_empty() {
                return Err(MantleError::type_error(
                    "cycle() requires at least one value".to_string(),
                ));
            }
            Ok(args[state.index % args.len()].clone())
        }
        Value::Object(Object(ObjectKind::Context)) => context_method(interp, name, &args),
        other => Err(no_attribute(other, name)),
    }
}

fn split_whitespace(s: &str, maxsplit: i64) -> Vec<Value> {
    let mut parts = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if maxsplit >= 0 && parts.len() as i64 == maxsplit {
            parts.push(Value::str(rest));
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(Value::str(&rest[..end]));
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(Value::str(rest));
                break;
            }
        }
    }
    parts
}

fn affix_matches(name: &str, s: &str, affix: &Value, starts: bool) -> MantleResult<bool> {
    let check = |candidate: &Value| -> MantleResult<bool> {
        let candidate = str_arg(name, candidate)?;
        Ok(if starts {
            s.starts_with(candidate)
        } else {
            s.ends_with(candidate)
        })
    };
    match affix {
        Value::Tuple(options) => {
            for option in options.iter() {
                if check(option)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => check(other),
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn str_method(s: &str, name: &str, args: &[Value]) -> MantleResult<Value> {
    let trim_set = |args: &[Value]| -> MantleResult<Option<Vec<char>>> {
        match args.first() {
            None | Some(Value::None) => Ok(None),
            Some(chars) => Ok(Some(str_arg(name, chars)?.chars().collect())),
        }
    };
    match name {
        "upper" => Ok(Value::str(s.to_uppercase())),
        "lower" => Ok(Value::str(s.to_lowercase())),
        "strip" | "lstrip" | "rstrip" => {
            arity(name, args, 0, 1)?;
            let set = trim_set(args)?;
            let matches = |c: char| set.as_ref().map_or(c.is_whitespace(), |set| set.contains(&c));
            let trimmed = match name {
                "lstrip" => s.trim_start_matches(matches),
                "rstrip" => s.trim_end_matches(matches),
                _ => s.trim_matches(matches),
            };
            Ok(Value::str(trimmed))
        }
        "split" => {
            arity(name, args, 0, 2)?;
            let maxsplit = match args.get(1) {
                Some(n) => int_arg(name, n)?,
                None => -1,
            };
            match args.first() {
                None | Some(Value::None) => Ok(Value::list(split_whitespace(s, maxsplit))),
                Some(sep) => {
                    let sep = str_arg(name, sep)?;
                    if sep.is_empty() {
                        return Err(MantleError::Value("empty separator".to_string()));
                    }
                    let parts: Vec<Value> = if maxsplit < 0 {
                        s.split(sep).map(Value::str).collect()
                    } else {
                        let limit = usize::try_from(maxsplit).unwrap_or(0).saturating_add(1);
                        s.splitn(limit, sep).map(Value::str).collect()
                    };
                    Ok(Value::list(parts))
                }
            }
        }
        "join" => {
            arity(name, args, 1, 1)?;
            let mut parts = Vec::new();
            for (i, item) in args[0].iterate()?.iter().enumerate() {
                match item {
                    Value::Str(part) => parts.push(part.to_string()),
                    other => {
                        return Err(MantleError::type_error(format!(
                            "sequence item {i}: expected str instance, {} found",
                            other.type_name()
                        )));
                    }
                }
            }
            Ok(Value::str(parts.join(s)))
        }
        "replace" => {
            arity(name, args, 2, 3)?;
            let old = str_arg(name, &args[0])?;
            let new = str_arg(name, &args[1])?;
            match args.get(2) {
                Some(count) => {
                    let count = int_arg(name, count)?;
                    match usize::try_from(count) {
                        Ok(count) => Ok(Value::str(s.replacen(old, new, count))),
                        Err(_) => Ok(Value::str(s.replace(old, new))),
                    }
                }
                None => Ok(Value::str(s.replace(old, new))),
            }
        }
        "startswith" | "endswith" => {
            arity(name, args, 1, 1)?;
            affix_matches(name, s, &args[0], name == "startswith").map(Value::Bool)
        }
        "title" => {
            let mut out = String::with_capacity(s.len());
            let mut at_word_start = true;
            for c in s.chars() {
                if c.is_alphabetic() {
                    if at_word_start {
                        out.extend(c.to_uppercase());
                    } else {
                        out.extend(c.to_lowercase());
                    }
                    at_word_start = false;
                } else {
                    out.push(c);
                    at_word_start = true;
                }
            }
            Ok(Value::str(out))
        }
        "capitalize" => Ok(Value::str(capitalize(s))),
        "find" => {
            arity(name, args, 1, 1)?;
            let needle = str_arg(name, &args[0])?;
            Ok(Value::Int(match s.find(needle) {
                Some(byte) => s[..byte].chars().count() as i64,
                None => -1,
            }))
        }
        "count" => {
            arity(name, args, 1, 1)?;
            let needle = str_arg(name, &args[0])?;
            let count = if needle.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(needle).count()
            };
            Ok(Value::Int(count as i64))
        }
        "isdigit" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        _ => Err(no_attribute(&Value::str(s), name)),
    }
}

fn list_method(
    items: &Rc<RefCell<Vec<Value>>>,
    name: &str,
    args: Vec<Value>,
) -> MantleResult<Value> {
    match name {
        "append" => {
            arity(name, &args, 1, 1)?;
            items.borrow_mut().extend(args);
            Ok(Value::None)
        }
        "extend" => {
            arity(name, &args, 1, 1)?;
            let more = args[0].iterate()?;
            items.borrow_mut().extend(more);
            Ok(Value::None)
        }
        "pop" => {
            arity(name, &args, 0, 1)?;
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(MantleError::Index("pop from empty list".to_string()));
            }
            let len = items.len() as i64;
            let index = match args.first() {
                Some(index) => int_arg(name, index)?,
                None => len - 1,
            };
            let resolved = if index < 0 { index + len } else { index };
            if resolved < 0 || resolved >= len {
                return Err(MantleError::Index("pop index out of range".to_string()));
            }
            Ok(items.remove(resolved as usize))
        }
        "insert" => {
            arity(name, &args, 2, 2)?;
            let mut items = items.borrow_mut();
            let len = items.len() as i64;
            let index = int_arg(name, &args[0])?;
            let resolved = if index < 0 { index + len } else { index }.clamp(0, len);
            items.insert(resolved as usize, args[1].clone());
            Ok(Value::None)
        }
        "index" => {
            arity(name, &args, 1, 1)?;
            items
                .borrow()
                .iter()
                .position(|item| item == &args[0])
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| MantleError::Value(format!("{} is not in list", args[0].repr())))
        }
        "count" => {
            arity(name, &args, 1, 1)?;
            let count = items.borrow().iter().filter(|item| *item == &args[0]).count();
            Ok(Value::Int(count as i64))
        }
        "remove" => {
            arity(name, &args, 1, 1)?;
            let mut items = items.borrow_mut();
            match items.iter().position(|item| item == &args[0]) {
                Some(i) => {
                    items.remove(i);
                    Ok(Value::None)
                }
                None => Err(MantleError::Value(
                    "list.remove(x): x not in list".to_string(),
                )),
            }
        }
        "reverse" => {
            items.borrow_mut().reverse();
            Ok(Value::None)
        }
        _ => Err(no_attribute(&Value::List(Rc::clone(items)), name)),
    }
}

fn dict_method(
    map: &Rc<RefCell<IndexMap<String, Value>>>,
    name: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> MantleResult<Value> {
    match name {
        "get" => {
            arity(name, &args, 1, 2)?;
            let default = args.get(1).cloned().unwrap_or(Value::None);
            Ok(map
                .borrow()
                .get(&args[0].dict_key())
                .cloned()
                .unwrap_or(default))
        }
        "keys" => Ok(Value::list(map.borrow().keys().map(Value::str))),
        "values" => Ok(Value::list(map.borrow().values().cloned())),
        "items" => Ok(Value::list(
            map.borrow()
                .iter()
                .map(|(k, v)| Value::tuple([Value::str(k), v.clone()])),
        )),
        "update" => {
            arity(name, &args, 0, 1)?;
            if let Some(other) = args.first() {
                let entries: Vec<(String, Value)> = match other {
                    Value::Dict(other) => other
                        .borrow()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    pairs => {
                        let mut entries = Vec::new();
                        for pair in pairs.iterate()? {
                            if let [key, value] = pair.iterate()?.as_slice() {
                                entries.push((key.dict_key(), value.clone()));
                            }
                        }
                        entries
                    }
                };
                map.borrow_mut().extend(entries);
            }
            map.borrow_mut().extend(kwargs);
            Ok(Value::None)
        }
        "pop" => {
            arity(name, &args, 1, 2)?;
            let removed = map.borrow_mut().shift_remove(&args[0].dict_key());
            match (removed, args.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(MantleError::Key(args[0].repr())),
            }
        }
        "setdefault" => {
            arity(name, &args, 1, 2)?;
            let default = args.get(1).cloned().unwrap_or(Value::None);
            Ok(map
                .borrow_mut()
                .entry(args[0].dict_key())
                .or_insert(default)
                .clone())
        }
        _ => Err(no_attribute(&Value::Dict(Rc::clone(map)), name)),
    }
}

fn context_method(interp: &mut Interpreter<'_>, name: &str, args: &[Value]) -> MantleResult<Value> {
    match name {
        "write" => {
            arity(name, args, 1, 1)?;
            let text = args[0].defined()?.to_string();
            interp.state.write(&text);
            Ok(Value::None)
        }
        "get" => {
            arity(name, args, 1, 2)?;
            let key = str_arg(name, &args[0])?;
            Ok(interp
                .state
                .data
                .get(key)
                .cloned()
                .or_else(|| args.get(1).cloned())
                .unwrap_or(Value::None))
        }
        "keys" => Ok(Value::list(interp.state.data.keys().map(Value::str))),
        "has" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(interp.state.data.contains(str_arg(name, &args[0])?)))
        }
        _ => Err(no_attribute(&Value::object(ObjectKind::Context), name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_registry() {
        assert_eq!(Builtin::lookup("sorted"), Some(Builtin::Sorted));
        assert_eq!(Builtin::lookup("print"), None);
        assert_eq!(Builtin::Capture.name(), "capture");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_string_methods() {
        let split = str_method("a  b c ", "split", &[]).unwrap();
        assert_eq!(split, Value::list(["a", "b", "c"]));
        let limited = str_method("a b  c", "split", &[Value::None, Value::Int(1)]).unwrap();
        assert_eq!(limited, Value::list(["a", "b  c"]));
        assert_eq!(
            str_method("xxhixx", "strip", &[Value::from("x")]).unwrap(),
            Value::from("hi")
        );
        assert_eq!(
            str_method("hello world", "title", &[]).unwrap(),
            Value::from("Hello World")
        );
        assert_eq!(
            str_method(", ", "join", &[Value::list(["a", "b"])]).unwrap(),
            Value::from("a, b")
        );
        assert!(
            str_method("-", "join", &[Value::list([1, 2])]).is_err(),
            "join requires strings"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_list_and_dict_methods() {
        let Value::List(items) = Value::list([1, 2]) else {
            unreachable!()
        };
        list_method(&items, "append", vec![Value::Int(3)]).unwrap();
        assert_eq!(list_method(&items, "pop", vec![Value::Int(0)]).unwrap(), Value::Int(1));
        assert_eq!(items.borrow().len(), 2);

        let Value::Dict(map) = Value::dict([("a", 1)]) else {
            unreachable!()
        };
        assert_eq!(
            dict_method(&map, "get", vec![Value::from("b"), Value::Int(5)], Kwargs::new()).unwrap(),
            Value::Int(5)
        );
        assert!(matches!(
            dict_method(&map, "pop", vec![Value::from("zz")], Kwargs::new()),
            Err(MantleError::Key(_))
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_attributes() {
        let state = Value::object(ObjectKind::Loop(Rc::new(super::super::LoopContext {
            index: 1,
            length: 3,
            parent: Value::None,
        })));
        assert_eq!(attribute(&state, "odd").unwrap(), Value::Bool(true));
        assert_eq!(attribute(&state, "reverse_index").unwrap(), Value::Int(1));
        assert_eq!(attribute(&state, "last").unwrap(), Value::Bool(false));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dict_attribute_falls_back_to_keys() {
        let value = Value::dict([("title", "Home")]);
        assert_eq!(attribute(&value, "title").unwrap(), Value::from("Home"));
        assert!(matches!(
            attribute(&value, "missing"),
            Err(MantleError::NamespaceMember { .. })
        ));
    }
}
