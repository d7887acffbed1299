//! Tree-walking evaluation of compiled definitions.

use std::{cell::RefCell, cmp::Ordering, rc::Rc, sync::Arc};

use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use super::{
    Callable, CallableKind, Env, Flow, Frame, LoopContext, Namespace, NamespaceKind,
    RenderState,
    builtins::{self, Builtin, call_builtin, call_method},
    context::{MAX_DEPTH, STACK_RED_ZONE, STACK_SEGMENT},
};
use crate::{
    ast::Span,
    cache::CacheArgs,
    code::syntax::{
        Argument, BinOp, BoolOp, CmpOp, Comprehension, ExceptHandler, Expr, Literal, Params, Stmt,
        UnaryOp,
    },
    compiler::{
        AttrPart, AttrValue, CallTarget, DefKind, Definition, Filter, Handler, NamespaceSource,
        Step, exception_classes,
    },
    error::{MantleError, MantleResult},
    interface::Context,
    options::ErrorContext,
    template::Template,
    value::{Kwargs, Object, ObjectKind, Value},
};

/// What a render call produces.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RenderTarget<'t> {
    Body,
    Def(&'t str),
}

pub(crate) struct Interpreter<'a> {
    pub(crate) state: RenderState<'a>,
}

/// Renders `template` against `data`, appending the result to `out`.
pub(crate) fn render(
    template: &Template,
    data: &Context,
    target: RenderTarget<'_>,
    out: &mut String,
) -> MantleResult<()> {
    let options = template.options().clone();
    let handler = options.error_handler.clone();
    let mut interp = Interpreter {
        state: RenderState::new(data, options),
    };
    let result = match target {
        RenderTarget::Body => interp.render_template(template, Kwargs::new()),
        RenderTarget::Def(name) => interp.render_def(template, name),
    };
    let mut output = interp.state.take_output();
    drop(interp);

    let err = match result {
        Ok(()) => {
            out.push_str(&output);
            return Ok(());
        }
        Err(err) => err,
    };
    let Some(handler) = handler else {
        return Err(err);
    };
    let handled = handler(
        &mut ErrorContext {
            output: &mut output,
            data,
        },
        &err,
    );
    if !handled {
        return Err(err);
    }
    warn!(uri = template.uri(), error = %err, "render error suppressed by error handler");
    out.push_str(&output);
    Ok(())
}

fn locate(env: &Env, span: Span) -> impl Fn(MantleError) -> MantleError + '_ {
    move |err| err.at(env.ns.template().map_or("", Template::uri), span.line, span.column)
}

fn locate_in(uri: &str, span: Span) -> impl Fn(MantleError) -> MantleError + '_ {
    move |err| err.at(uri, span.line, span.column)
}

fn ns_value(ns: Rc<Namespace>) -> Value {
    Value::object(ObjectKind::Namespace(ns))
}

fn callable_value(kind: CallableKind, env: Env) -> Value {
    Value::object(ObjectKind::Callable(Rc::new(Callable::new(kind, env))))
}

fn module_env(ns: &Rc<Namespace>) -> Env {
    Env {
        frame: ns.module_frame().cloned().unwrap_or_else(|| Frame::new(None)),
        ns: Rc::clone(ns),
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::None => Value::None,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::Str(s) => Value::str(s),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> MantleResult<bool> {
    Ok(match op {
        CmpOp::Eq => left == right,
        CmpOp::NotEq => left != right,
        CmpOp::Lt => left.compare(right)? == Ordering::Less,
        CmpOp::LtE => left.compare(right)? != Ordering::Greater,
        CmpOp::Gt => left.compare(right)? == Ordering::Greater,
        CmpOp::GtE => left.compare(right)? != Ordering::Less,
        CmpOp::In => right.contains(left)?,
        CmpOp::NotIn => !right.contains(left)?,
        CmpOp::Is => left.is_identical(right),
        CmpOp::IsNot => !left.is_identical(right),
    })
}

fn catches(classes: &[String], err: &MantleError) -> bool {
    classes.is_empty() || classes.iter().any(|class| err.matches_exception(class))
}

impl Interpreter<'_> {
    fn render_template(&mut self, template: &Template, kwargs: Kwargs) -> MantleResult<()> {
        let chain = self.build_chain(template)?;
        let Some(base) = chain.last() else {
            return Ok(());
        };
        let body = Callable::new(CallableKind::Def(0), module_env(base));
        let value = self.call_callable(&body, Vec::new(), kwargs)?;
        self.write_value(&value);
        Ok(())
    }

    fn render_def(&mut self, template: &Template, name: &str) -> MantleResult<()> {
        let chain = self.build_chain(template)?;
        let Some(head) = chain.first() else {
            return Ok(());
        };
        let Some(def) = self.member(head, name)? else {
            return Err(MantleError::NamespaceMember {
                namespace: template.uri().to_string(),
                member: name.to_string(),
            });
        };

        let data = self.state.data;
        let mut kwargs = Kwargs::new();
        if let Value::Object(Object(ObjectKind::Callable(callable))) = &def {
            if let CallableKind::Def(index) = callable.kind {
                if let Some(definition) = callable.env.ns.unit().and_then(|unit| unit.defs.get(index)) {
                    for param in definition.params.names() {
                        if let Some(value) = data.get(param) {
                            kwargs.insert(param.to_string(), value.clone());
                        }
                    }
                }
            }
        }
        let value = self.call_value(&def, Vec::new(), kwargs)?;
        self.write_value(&value);
        Ok(())
    }

    /// Creates the namespace of `template` and runs its module-level code.
    fn template_namespace(
        &mut self,
        template: Template,
        name: &str,
        self_ns: Option<&Rc<Namespace>>,
    ) -> MantleResult<Rc<Namespace>> {
        let frame = self.state.new_frame(None);
        let ns = Rc::new(Namespace::new(
            name,
            NamespaceKind::Template {
                template: template.clone(),
                frame: Rc::clone(&frame),
            },
        ));
        ns.set_self(self_ns.unwrap_or(&ns));
        self.state.track_namespace(&ns);

        let env = Env {
            frame,
            ns: Rc::clone(&ns),
        };
        for (code, span) in &template.unit().module_code {
            self.exec_stmts(code, &env)
                .map_err(locate_in(template.uri(), *span))?;
        }
        Ok(ns)
    }

    /// Builds the inheritance chain of `template`, from the template itself
    /// to its topmost ancestor. The returned namespaces must outlive the
    /// render since the chain links between them are weak.
    fn build_chain(&mut self, template: &Template) -> MantleResult<Vec<Rc<Namespace>>> {
        let head = self.template_namespace(template.clone(), "self", None)?;
        let mut visited = vec![template.uri().to_string()];
        let mut chain = vec![head];

        loop {
            let Some(current) = chain.last().cloned() else {
                break;
            };
            let Some(current_template) = current.template().cloned() else {
                break;
            };
            let Some((file, span)) = current_template.unit().inherit.clone() else {
                break;
            };
            let located = locate_in(current_template.uri(), span);
            let file = self
                .eval_attr(&file, &module_env(&current))
                .map_err(&located)?
                .to_string();
            let parent_template = self
                .load_template(&current_template, &file)
                .map_err(&located)?;
            if visited.iter().any(|uri| uri == parent_template.uri()) {
                return Err(MantleError::InheritanceCycle {
                    uri: parent_template.uri().to_string(),
                });
            }
            visited.push(parent_template.uri().to_string());
            debug!(
                uri = current_template.uri(),
                parent = parent_template.uri(),
                "linking inherited template"
            );

            let name = format!("self:{}", parent_template.uri());
            let parent = self.template_namespace(parent_template, &name, chain.first())?;
            current.set_inherits(&parent);
            parent.set_next(&current);
            chain.push(parent);
        }
        Ok(chain)
    }

    fn load_template(&self, from: &Template, uri: &str) -> MantleResult<Template> {
        let Some(lookup) = from.lookup() else {
            return Err(MantleError::NoLookup {
                uri: from.uri().to_string(),
                target: uri.to_string(),
            });
        };
        let resolved = lookup.adjust_uri(uri, from.uri());
        lookup.get_template(&resolved)
    }

    pub(crate) fn call_value(
        &mut self,
        func: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> MantleResult<Value> {
        match func {
            Value::Function(native) => native.call(&args, &kwargs),
            Value::Object(Object(ObjectKind::Builtin(builtin))) => {
                call_builtin(self, *builtin, args, kwargs)
            }
            Value::Object(Object(ObjectKind::Method(method))) => {
                call_method(self, method, args, kwargs)
            }
            Value::Object(Object(ObjectKind::Callable(callable))) => {
                self.call_callable(callable, args, kwargs)
            }
            Value::Undefined(_) => Err(func.undefined_error()),
            other => Err(MantleError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_callable(
        &mut self,
        callable: &Callable,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> MantleResult<Value> {
        if self.state.depth >= MAX_DEPTH {
            return Err(MantleError::Value(
                "maximum recursion depth exceeded".to_string(),
            ));
        }
        self.state.depth += 1;
        let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || match &callable.kind {
            CallableKind::Def(index) => self.call_def(callable, *index, args, kwargs),
            CallableKind::Lambda(lambda) => {
                let env = self.child_env(&callable.env);
                self.bind_params(&lambda.params, "<lambda>", args, kwargs, &env, &callable.env, false)
                    .and_then(|()| self.eval(&lambda.body, &env))
            }
            CallableKind::Function(func) => {
                let env = self.child_env(&callable.env);
                self.bind_params(&func.params, &func.name, args, kwargs, &env, &callable.env, false)
                    .and_then(|()| self.exec_stmts(&func.body, &env))
                    .map(|flow| match flow {
                        Flow::Return(value) => value,
                        Flow::Normal | Flow::Break | Flow::Continue => Value::None,
                    })
            }
        });
        self.state.depth -= 1;
        result
    }

    fn child_env(&mut self, env: &Env) -> Env {
        Env {
            frame: self.state.new_frame(Some(Rc::clone(&env.frame))),
            ns: Rc::clone(&env.ns),
        }
    }

    fn call_def(
        &mut self,
        callable: &Callable,
        index: usize,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> MantleResult<Value> {
        let Some(template) = callable.env.ns.template().cloned() else {
            return Err(MantleError::type_error("definition called outside of its template"));
        };
        let Some(def) = template.unit().defs.get(index) else {
            return Err(MantleError::type_error(format!("no definition at index {index}")));
        };
        let caller = match def.kind {
            DefKind::CallBody => callable.outer_caller.clone(),
            DefKind::NamedBlock | DefKind::AnonymousBlock => self.state.caller(),
            DefKind::Body | DefKind::Def => self.state.take_next_caller(),
        };
        trace!(uri = template.uri(), def = %def.name, "calling definition");

        self.state.push_caller(caller);
        let result = self.run_def(&template, def, &callable.env, args, kwargs);
        self.state.pop_caller();
        result
    }

    fn run_def(
        &mut self,
        template: &Template,
        def: &Definition,
        outer: &Env,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> MantleResult<Value> {
        let env = self.child_env(outer);
        if def.kind == DefKind::Body {
            let mut pageargs: IndexMap<String, Value> = self
                .state
                .data
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect();
            for (name, value) in &kwargs {
                pageargs.insert(name.clone(), value.clone());
                env.frame.set(name, value.clone());
            }
            env.frame
                .set("pageargs", Value::Dict(Rc::new(RefCell::new(pageargs))));
        }
        let data_fallback = matches!(def.kind, DefKind::Body | DefKind::NamedBlock);
        self.bind_params(&def.params, &def.name, args, kwargs, &env, outer, data_fallback)?;

        let unit = template.unit();
        for &closure in &def.closures {
            if let Some(inner) = unit.defs.get(closure) {
                env.frame
                    .set(&inner.name, callable_value(CallableKind::Def(closure), env.clone()));
            }
        }

        let cache = def
            .cache
            .as_ref()
            .filter(|_| self.state.options.cache_enabled);
        let value = if let Some(cache) = cache {
            let key = match &cache.key {
                Some(key) => self.eval_attr(key, &env)?.to_string(),
                None => format!("render_{}", def.name),
            };
            let args = CacheArgs {
                timeout: cache.timeout,
                region: cache.region.clone(),
                now: self.state.started,
            };
            let text = template.cache().get_or_create(
                &key,
                cache.cache_type.as_deref(),
                &args,
                &mut || self.capture_steps(&def.body, &env),
            )?;
            Value::str(text)
        } else if def.buffered || !def.filters.is_empty() {
            Value::str(self.capture_steps(&def.body, &env)?)
        } else {
            return Ok(match self.run_steps(&def.body, &env)? {
                Flow::Return(Value::None) | Flow::Normal | Flow::Break | Flow::Continue => {
                    Value::str("")
                }
                Flow::Return(value) => value,
            });
        };

        let value = self.apply_filters(value, &def.filters, &env)?;
        if def.buffered {
            Ok(value)
        } else {
            self.state.write(&value.to_string());
            Ok(Value::str(""))
        }
    }

    fn bind_params(
        &mut self,
        params: &Params,
        callable: &str,
        mut args: Vec<Value>,
        mut kwargs: Kwargs,
        env: &Env,
        defaults_env: &Env,
        data_fallback: bool,
    ) -> MantleResult<()> {
        let data = self.state.data;
        let extra = if args.len() > params.params.len() {
            args.split_off(params.params.len())
        } else {
            Vec::new()
        };
        let mut positional = args.into_iter();

        for param in &params.params {
            let value = if let Some(value) = positional.next() {
                if kwargs.contains_key(&param.name) {
                    return Err(MantleError::type_error(format!(
                        "{callable}() got multiple values for argument '{}'",
                        param.name
                    )));
                }
                value
            } else if let Some(value) = kwargs.shift_remove(&param.name) {
                value
            } else if let Some(value) = data.get(&param.name).filter(|_| data_fallback) {
                value.clone()
            } else if let Some(default) = &param.default {
                self.eval(default, defaults_env)?
            } else {
                return Err(MantleError::MissingArgument {
                    callable: callable.to_string(),
                    argument: param.name.clone(),
                });
            };
            env.frame.set(&param.name, value);
        }

        match &params.varargs {
            Some(name) => env.frame.set(name, Value::tuple(extra)),
            None if !extra.is_empty() => {
                return Err(MantleError::type_error(format!(
                    "{callable}() takes {} positional arguments but {} were given",
                    params.params.len(),
                    params.params.len() + extra.len()
                )));
            }
            None => {}
        }
        match &params.kwargs {
            Some(name) => env
                .frame
                .set(name, Value::Dict(Rc::new(RefCell::new(kwargs)))),
            None => {
                if let Some(name) = kwargs.keys().next().filter(|_| !data_fallback) {
                    return Err(MantleError::type_error(format!(
                        "{callable}() got an unexpected keyword argument '{name}'"
                    )));
                }
            }
        }
        Ok(())
    }

    fn capture_steps(&mut self, steps: &[Step], env: &Env) -> MantleResult<String> {
        self.state.push_buffer();
        let result = self.run_steps(steps, env);
        let output = self.state.pop_buffer();
        result.map(|_| output)
    }

    fn apply_filters(
        &mut self,
        mut value: Value,
        filters: &[Filter],
        env: &Env,
    ) -> MantleResult<Value> {
        for filter in filters {
            value = match filter {
                Filter::Builtin(builtin) => builtin.apply(&value),
                Filter::Expr(expr) => {
                    let func = self.eval(expr, env)?;
                    self.call_value(&func, vec![value], Kwargs::new())?
                }
            };
        }
        Ok(value)
    }

    fn write_value(&mut self, value: &Value) {
        match value {
            Value::Str(text) => self.state.write(text),
            Value::None | Value::Undefined(_) => {}
            other => self.state.write(&other.to_string()),
        }
    }

    fn run_steps(&mut self, steps: &[Step], env: &Env) -> MantleResult<Flow> {
        for step in steps {
            match self.run_step(step, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn run_step(&mut self, step: &Step, env: &Env) -> MantleResult<Flow> {
        match step {
            Step::Text(text) => self.state.write(text),
            Step::Emit {
                expr, filters, span, ..
            } => {
                let value = self
                    .eval(expr, env)
                    .and_then(|value| {
                        if value.is_undefined() {
                            return Err(value.undefined_error());
                        }
                        self.apply_filters(value, filters, env)
                    })
                    .map_err(locate(env, *span))?;
                self.state.write(&value.to_string());
            }
            Step::Exec { code, span } => {
                return self.exec_stmts(code, env).map_err(locate(env, *span));
            }
            Step::If { branches, span, .. } => {
                for (test, body) in branches {
                    let taken = match test {
                        Some(test) => self
                            .eval(test, env)
                            .map_err(locate(env, *span))?
                            .is_truthy(),
                        None => true,
                    };
                    if taken {
                        return self.run_steps(body, env);
                    }
                }
            }
            Step::For {
                target,
                iter,
                body,
                orelse,
                span,
                ..
            } => return self.run_for(target, iter, body, orelse, *span, env),
            Step::While {
                test,
                body,
                orelse,
                span,
                ..
            } => loop {
                if !self.eval(test, env).map_err(locate(env, *span))?.is_truthy() {
                    return self.run_steps(orelse, env);
                }
                match self.run_steps(body, env)? {
                    Flow::Break => return Ok(Flow::Normal),
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Normal | Flow::Continue => {}
                }
            },
            Step::Try {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            } => return self.run_try(body, handlers, orelse, finalbody, env),
            Step::Break => return Ok(Flow::Break),
            Step::Continue => return Ok(Flow::Continue),
            Step::NamedBlock { name, span } => {
                self.named_block(name, env).map_err(locate(env, *span))?;
            }
            Step::AnonymousBlock { def, span } => {
                let block = Callable::new(CallableKind::Def(*def), env.clone());
                let value = self
                    .call_callable(&block, Vec::new(), Kwargs::new())
                    .map_err(locate(env, *span))?;
                self.write_value(&value);
            }
            Step::CallTag { target, body, span } => {
                self.call_tag(target, *body, env).map_err(locate(env, *span))?;
            }
            Step::Include { file, args, span } => {
                self.include(file, args, env).map_err(locate(env, *span))?;
            }
        }
        Ok(Flow::Normal)
    }

    fn run_for(
        &mut self,
        target: &Expr,
        iter: &Expr,
        body: &[Step],
        orelse: &[Step],
        span: Span,
        env: &Env,
    ) -> MantleResult<Flow> {
        let items = self
            .eval(iter, env)
            .and_then(|value| value.iterate())
            .map_err(locate(env, span))?;
        let track_loop = env.ns.unit().is_some_and(|unit| unit.enable_loop);
        let saved = if track_loop {
            env.frame.get_local("loop")
        } else {
            None
        };
        let parent = if track_loop {
            env.frame.lookup("loop").unwrap_or_default()
        } else {
            Value::None
        };

        let length = items.len();
        let mut outcome = Ok((Flow::Normal, false));
        for (index, item) in items.into_iter().enumerate() {
            if let Err(err) = self.assign(target, item, env) {
                outcome = Err(err.at(env.ns.template().map_or("", Template::uri), span.line, span.column));
                break;
            }
            if track_loop {
                let state = LoopContext {
                    index,
                    length,
                    parent: parent.clone(),
                };
                env.frame
                    .set("loop", Value::object(ObjectKind::Loop(Rc::new(state))));
            }
            match self.run_steps(body, env) {
                Ok(Flow::Normal | Flow::Continue) => {}
                Ok(Flow::Break) => {
                    outcome = Ok((Flow::Normal, true));
                    break;
                }
                Ok(Flow::Return(value)) => {
                    outcome = Ok((Flow::Return(value), true));
                    break;
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        if track_loop {
            match saved {
                Some(value) => env.frame.set("loop", value),
                None => {
                    env.frame.remove("loop");
                }
            }
        }
        match outcome? {
            (Flow::Normal, false) => self.run_steps(orelse, env),
            (flow, _) => Ok(flow),
        }
    }

    fn run_try(
        &mut self,
        body: &[Step],
        handlers: &[Handler],
        orelse: &[Step],
        finalbody: &[Step],
        env: &Env,
    ) -> MantleResult<Flow> {
        let outcome = match self.run_steps(body, env) {
            Ok(Flow::Normal) => self.run_steps(orelse, env),
            Ok(flow) => Ok(flow),
            Err(err) => match handlers.iter().find(|h| catches(&h.classes, &err)) {
                Some(handler) => {
                    trace!(error = %err, "error caught by except clause");
                    if let Some(name) = &handler.name {
                        env.frame.set(name, Value::str(err.root_cause().to_string()));
                    }
                    self.run_steps(&handler.body, env)
                }
                None => Err(err),
            },
        };
        if finalbody.is_empty() {
            return outcome;
        }
        match self.run_steps(finalbody, env)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    /// Renders a named block in place, unless an ancestor template defines
    /// the same block and will render it from its own body.
    fn named_block(&mut self, name: &str, env: &Env) -> MantleResult<()> {
        let mut ancestor = env.ns.inherits();
        while let Some(ns) = ancestor {
            if ns.unit().is_some_and(|unit| unit.toplevel_def(name).is_some()) {
                return Ok(());
            }
            ancestor = ns.inherits();
        }
        let head = env.ns.self_ns().unwrap_or_else(|| Rc::clone(&env.ns));
        let Some(block) = self.member(&head, name)? else {
            return Err(MantleError::NamespaceMember {
                namespace: head.name.clone(),
                member: name.to_string(),
            });
        };
        let value = self.call_value(&block, Vec::new(), Kwargs::new())?;
        self.write_value(&value);
        Ok(())
    }

    fn call_tag(&mut self, target: &CallTarget, body: usize, env: &Env) -> MantleResult<()> {
        let caller = Rc::new(Namespace::new(
            "caller",
            NamespaceKind::Caller {
                body,
                env: env.clone(),
                outer_caller: self.state.caller(),
            },
        ));
        self.state.track_namespace(&caller);

        let (func, args, kwargs) = match target {
            CallTarget::Expr(Expr::Call { func, args }) => {
                let func = self.eval(func, env)?;
                let (args, kwargs) = self.eval_arguments(args, env)?;
                (func, args, kwargs)
            }
            CallTarget::Expr(expr) => {
                self.state.set_next_caller(Some(caller));
                let result = self.eval(expr, env);
                self.state.set_next_caller(None);
                self.write_value(&result?);
                return Ok(());
            }
            CallTarget::Namespace {
                namespace,
                def,
                attributes,
            } => {
                let ns = self.resolve(namespace, env)?;
                let func = self.get_attribute(&ns, def)?;
                let mut kwargs = Kwargs::new();
                for (name, attr) in attributes {
                    kwargs.insert(name.clone(), self.eval_attr(attr, env)?);
                }
                (func, Vec::new(), kwargs)
            }
        };
        self.state.set_next_caller(Some(caller));
        let result = self.call_value(&func, args, kwargs);
        self.state.set_next_caller(None);
        self.write_value(&result?);
        Ok(())
    }

    fn include(&mut self, file: &AttrValue, args: &[Argument], env: &Env) -> MantleResult<()> {
        let file = self.eval_attr(file, env)?.to_string();
        let Some(from) = env.ns.template().cloned() else {
            return Err(MantleError::type_error("include outside of a template"));
        };
        let template = self.load_template(&from, &file)?;
        let (positional, kwargs) = self.eval_arguments(args, env)?;
        if !positional.is_empty() {
            return Err(MantleError::type_error(
                "include arguments must be passed by keyword",
            ));
        }
        debug!(from = from.uri(), uri = template.uri(), "including template");
        self.render_template(&template, kwargs)
    }

    fn eval_attr(&mut self, attr: &AttrValue, env: &Env) -> MantleResult<Value> {
        let parts = match attr {
            AttrValue::Literal(text) => return Ok(Value::str(text)),
            AttrValue::Interpolated(parts) => parts,
        };
        if let [AttrPart::Expr(expr)] = parts.as_slice() {
            return self.eval(expr, env);
        }
        let mut text = String::new();
        for part in parts {
            match part {
                AttrPart::Text(literal) => text.push_str(literal),
                AttrPart::Expr(expr) => {
                    let value = self.eval(expr, env)?;
                    text.push_str(&value.defined()?.to_string());
                }
            }
        }
        Ok(Value::str(text))
    }

    /// Resolves a free name: locals first, then the template's own
    /// definitions and namespaces, runtime names, render data, imported
    /// namespace members and builtins.
    fn resolve(&mut self, name: &str, env: &Env) -> MantleResult<Value> {
        if let Some(value) = env.frame.lookup(name) {
            return Ok(value);
        }
        if let Some(value) = self.template_name(name, env)? {
            return Ok(value);
        }
        match name {
            "self" => return Ok(env.ns.self_ns().map_or(Value::None, ns_value)),
            "parent" => return Ok(env.ns.inherits().map_or(Value::None, ns_value)),
            "next" => return Ok(env.ns.next().map_or(Value::None, ns_value)),
            "local" => return Ok(ns_value(Rc::clone(&env.ns))),
            "caller" => {
                return Ok(self
                    .state
                    .caller()
                    .map_or_else(|| Value::Undefined(Some(Rc::from("caller"))), ns_value));
            }
            "context" => return Ok(Value::object(ObjectKind::Context)),
            "UNDEFINED" => return Ok(Value::Undefined(None)),
            _ => {}
        }
        if let Some(value) = self.state.data.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.imported_name(name, env)? {
            return Ok(value);
        }
        if let Some(builtin) = Builtin::lookup(name) {
            return Ok(Value::object(ObjectKind::Builtin(builtin)));
        }
        if self.state.options.strict_undefined {
            return Err(MantleError::UnresolvedName {
                name: name.to_string(),
            });
        }
        Ok(Value::Undefined(Some(Rc::from(name))))
    }

    fn template_name(&mut self, name: &str, env: &Env) -> MantleResult<Option<Value>> {
        let Some(unit) = env.ns.unit() else {
            return Ok(None);
        };
        if let Some(index) = unit.toplevel_def(name) {
            return Ok(Some(callable_value(
                CallableKind::Def(index),
                module_env(&env.ns),
            )));
        }
        if unit.namespaces.contains_key(name) {
            let ns = self.declared_namespace(&env.ns, name)?;
            return Ok(Some(ns_value(ns)));
        }
        Ok(None)
    }

    /// Names brought in by `<%namespace import="...">`.
    fn imported_name(&mut self, name: &str, env: &Env) -> MantleResult<Option<Value>> {
        const NOT_WILDCARD: &[&str] = &["uri", "filename", "attr", "body", "context"];
        let Some(template) = env.ns.template().cloned() else {
            return Ok(None);
        };
        for decl in template.unit().namespaces.values() {
            let wildcard = decl.import.iter().any(|n| n == "*");
            let explicit = decl.import.iter().any(|n| n == name);
            if !explicit && (!wildcard || NOT_WILDCARD.contains(&name)) {
                continue;
            }
            let ns = self.declared_namespace(&env.ns, &decl.name)?;
            if let Some(value) = self.member(&ns, name)? {
                return Ok(Some(value));
            }
            if explicit {
                return Err(MantleError::NamespaceMember {
                    namespace: decl.name.clone(),
                    member: name.to_string(),
                });
            }
        }
        Ok(None)
    }

    /// Loads the namespace `owner` declared as `name`, once per render.
    fn declared_namespace(
        &mut self,
        owner: &Rc<Namespace>,
        name: &str,
    ) -> MantleResult<Rc<Namespace>> {
        if let Some(ns) = owner.import(name) {
            return Ok(ns);
        }
        let missing = || MantleError::NamespaceMember {
            namespace: owner.name.clone(),
            member: name.to_string(),
        };
        let Some(template) = owner.template().cloned() else {
            return Err(missing());
        };
        let Some(decl) = template.unit().namespaces.get(name) else {
            return Err(missing());
        };
        let located = locate_in(template.uri(), decl.span);
        let env = module_env(owner);

        let ns = match &decl.source {
            NamespaceSource::File(file) => {
                let file = self.eval_attr(file, &env).map_err(&located)?.to_string();
                let imported = self.load_template(&template, &file).map_err(&located)?;
                debug!(
                    uri = template.uri(),
                    namespace = name,
                    file = imported.uri(),
                    "loading namespace"
                );
                let self_ns = owner.self_ns();
                self.template_namespace(imported, name, self_ns.as_ref())?
            }
            NamespaceSource::Module(module) => {
                let Some(module) = self.state.options.get_module(module) else {
                    return Err(located(MantleError::Import {
                        module: module.clone(),
                    }));
                };
                Rc::new(Namespace::new(name, NamespaceKind::Module(module)))
            }
            NamespaceSource::Inline(defs) => Rc::new(Namespace::new(
                name,
                NamespaceKind::Inline {
                    defs: defs.clone(),
                    owner: env.clone(),
                },
            )),
        };
        self.state.track_namespace(&ns);
        owner.store_import(name, Rc::clone(&ns));
        Ok(ns)
    }

    /// Looks up `name` on a namespace, following the inheritance chain for
    /// template namespaces.
    fn member(&mut self, ns: &Rc<Namespace>, name: &str) -> MantleResult<Option<Value>> {
        match &ns.kind {
            NamespaceKind::Template { template, frame } => {
                let env = Env {
                    frame: Rc::clone(frame),
                    ns: Rc::clone(ns),
                };
                match name {
                    "uri" => return Ok(Some(Value::str(template.uri()))),
                    "filename" => return Ok(Some(template.filename().map_or(Value::None, Value::str))),
                    "attr" => {
                        return Ok(Some(Value::Dict(Rc::new(RefCell::new(frame.snapshot())))));
                    }
                    "context" => return Ok(Some(Value::object(ObjectKind::Context))),
                    "body" => return Ok(Some(callable_value(CallableKind::Def(0), env))),
                    _ => {}
                }
                let unit = template.unit();
                if let Some(index) = unit.toplevel_def(name) {
                    return Ok(Some(callable_value(CallableKind::Def(index), env)));
                }
                if unit.namespaces.get(name).is_some_and(|decl| decl.inheritable) {
                    let imported = self.declared_namespace(ns, name)?;
                    return Ok(Some(ns_value(imported)));
                }
                match ns.inherits() {
                    Some(parent) => self.member(&parent, name),
                    None => Ok(None),
                }
            }
            NamespaceKind::Inline { defs, owner } => Ok(defs
                .get(name)
                .map(|&index| callable_value(CallableKind::Def(index), owner.clone()))),
            NamespaceKind::Module(module) => Ok(module.get(name).cloned().map(Value::Function)),
            NamespaceKind::Caller {
                body,
                env,
                outer_caller,
            } => {
                if name == "body" {
                    let mut callable = Callable::new(CallableKind::Def(*body), env.clone());
                    callable.outer_caller = outer_caller.clone();
                    return Ok(Some(Value::object(ObjectKind::Callable(Rc::new(callable)))));
                }
                let Some(unit) = env.ns.unit() else {
                    return Ok(None);
                };
                let closure = unit.defs.get(*body).and_then(|def| {
                    def.closures
                        .iter()
                        .copied()
                        .find(|&index| unit.defs.get(index).is_some_and(|def| def.name == name))
                });
                Ok(closure.map(|index| callable_value(CallableKind::Def(index), env.clone())))
            }
        }
    }

    fn get_attribute(&mut self, value: &Value, name: &str) -> MantleResult<Value> {
        if let Value::Object(Object(ObjectKind::Namespace(ns))) = value {
            return self
                .member(ns, name)?
                .ok_or_else(|| MantleError::NamespaceMember {
                    namespace: ns.name.clone(),
                    member: name.to_string(),
                });
        }
        builtins::attribute(value, name)
    }

    pub(crate) fn eval(&mut self, expr: &Expr, env: &Env) -> MantleResult<Value> {
        match expr {
            Expr::Literal(literal) => Ok(literal_value(literal)),
            Expr::Name(name) => self.resolve(name, env),
            Expr::Attribute { value, attr } => {
                let value = self.eval(value, env)?;
                self.get_attribute(&value, attr)
            }
            Expr::Subscript { value, index } => {
                let target = self.eval(value, env)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let lower = self.slice_bound(lower.as_deref(), env)?;
                    let upper = self.slice_bound(upper.as_deref(), env)?;
                    let step = self.slice_bound(step.as_deref(), env)?;
                    return target.slice(lower, upper, step);
                }
                let index = self.eval(index, env)?;
                if let Value::Object(Object(ObjectKind::Context)) = &target {
                    return self
                        .state
                        .data
                        .get(&index.dict_key())
                        .cloned()
                        .ok_or_else(|| MantleError::Key(index.repr()));
                }
                target.subscript(&index)
            }
            Expr::Slice { .. } => Err(MantleError::type_error("slice outside of a subscript")),
            Expr::Call { func, args } => {
                let func = self.eval(func, env)?;
                let (args, kwargs) = self.eval_arguments(args, env)?;
                self.call_value(&func, args, kwargs)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, env)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => value.negate(),
                    UnaryOp::Pos => value.positive(),
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, env)?;
                let right = self.eval(right, env)?;
                Value::binary(*op, &left, &right)
            }
            Expr::Bool { op, left, right } => {
                let left = self.eval(left, env)?;
                match (op, left.is_truthy()) {
                    (BoolOp::And, true) | (BoolOp::Or, false) => self.eval(right, env),
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(left),
                }
            }
            Expr::Compare { left, comparisons } => {
                let mut current = self.eval(left, env)?;
                for (op, right) in comparisons {
                    let right = self.eval(right, env)?;
                    if !compare(*op, &current, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    current = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfElse { test, body, orelse } => {
                if self.eval(test, env)?.is_truthy() {
                    self.eval(body, env)
                } else {
                    self.eval(orelse, env)
                }
            }
            Expr::Lambda(lambda) => Ok(callable_value(
                CallableKind::Lambda(Arc::clone(lambda)),
                env.clone(),
            )),
            Expr::List(items) => Ok(Value::list(self.eval_all(items, env)?)),
            Expr::Tuple(items) => Ok(Value::tuple(self.eval_all(items, env)?)),
            Expr::Dict(entries) => {
                let mut map = IndexMap::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.eval(key, env)?;
                    let value = self.eval(value, env)?;
                    map.insert(key.dict_key(), value);
                }
                Ok(Value::Dict(Rc::new(RefCell::new(map))))
            }
            Expr::ListComp {
                element,
                generators,
            } => {
                let inner = self.child_env(env);
                let mut out = Vec::new();
                self.comprehend(element, generators, &inner, &mut out)?;
                Ok(Value::list(out))
            }
        }
    }

    fn eval_all(&mut self, items: &[Expr], env: &Env) -> MantleResult<Vec<Value>> {
        items.iter().map(|item| self.eval(item, env)).collect()
    }

    fn slice_bound(&mut self, bound: Option<&Expr>, env: &Env) -> MantleResult<Option<i64>> {
        let Some(bound) = bound else {
            return Ok(None);
        };
        match self.eval(bound, env)? {
            Value::None => Ok(None),
            value => value.as_int().map(Some).ok_or_else(|| {
                MantleError::type_error("slice indices must be integers or None")
            }),
        }
    }

    fn comprehend(
        &mut self,
        element: &Expr,
        generators: &[Comprehension],
        env: &Env,
        out: &mut Vec<Value>,
    ) -> MantleResult<()> {
        let Some((first, rest)) = generators.split_first() else {
            out.push(self.eval(element, env)?);
            return Ok(());
        };
        for item in self.eval(&first.iter, env)?.iterate()? {
            self.assign(&first.target, item, env)?;
            let mut keep = true;
            for test in &first.ifs {
                if !self.eval(test, env)?.is_truthy() {
                    keep = false;
                    break;
                }
            }
            if keep {
                self.comprehend(element, rest, env, out)?;
            }
        }
        Ok(())
    }

    fn eval_arguments(
        &mut self,
        args: &[Argument],
        env: &Env,
    ) -> MantleResult<(Vec<Value>, Kwargs)> {
        let mut positional = Vec::new();
        let mut kwargs = Kwargs::new();
        for arg in args {
            match arg {
                Argument::Positional(expr) => positional.push(self.eval(expr, env)?),
                Argument::Keyword(name, expr) => {
                    let value = self.eval(expr, env)?;
                    kwargs.insert(name.clone(), value);
                }
                Argument::Star(expr) => positional.extend(self.eval(expr, env)?.iterate()?),
                Argument::DoubleStar(expr) => match self.eval(expr, env)? {
                    Value::Dict(map) => kwargs.extend(
                        map.borrow()
                            .iter()
                            .map(|(name, value)| (name.clone(), value.clone())),
                    ),
                    other => {
                        return Err(MantleError::type_error(format!(
                            "argument after ** must be a mapping, not {}",
                            other.type_name()
                        )));
                    }
                },
            }
        }
        Ok((positional, kwargs))
    }

    pub(crate) fn exec_stmts(&mut self, stmts: &[Stmt], env: &Env) -> MantleResult<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &Env) -> MantleResult<Flow> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, env)?;
            }
            Stmt::Assign { targets, value } => {
                let value = self.eval(value, env)?;
                for target in targets {
                    self.assign(target, value.clone(), env)?;
                }
            }
            Stmt::AugAssign { target, op, value } => {
                let current = self.eval(target, env)?;
                let operand = self.eval(value, env)?;
                let updated = match (op, &current) {
                    (BinOp::Add, Value::List(items)) => {
                        let more = operand.iterate()?;
                        items.borrow_mut().extend(more);
                        current.clone()
                    }
                    _ => Value::binary(*op, &current, &operand)?,
                };
                self.assign(target, updated, env)?;
            }
            Stmt::If { test, body, orelse } => {
                return if self.eval(test, env)?.is_truthy() {
                    self.exec_stmts(body, env)
                } else {
                    self.exec_stmts(orelse, env)
                };
            }
            Stmt::For {
                target,
                iter,
                body,
                orelse,
            } => {
                for item in self.eval(iter, env)?.iterate()? {
                    self.assign(target, item, env)?;
                    match self.exec_stmts(body, env)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                return self.exec_stmts(orelse, env);
            }
            Stmt::While { test, body, orelse } => loop {
                if !self.eval(test, env)?.is_truthy() {
                    return self.exec_stmts(orelse, env);
                }
                match self.exec_stmts(body, env)? {
                    Flow::Break => return Ok(Flow::Normal),
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Normal | Flow::Continue => {}
                }
            },
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody, env),
            Stmt::FunctionDef(func) => env.frame.set(
                &func.name,
                callable_value(CallableKind::Function(Arc::clone(func)), env.clone()),
            ),
            Stmt::Import(aliases) => {
                for alias in aliases {
                    let (bind, module_name) = match &alias.asname {
                        Some(asname) => (asname.as_str(), alias.name.as_str()),
                        None => {
                            let first = alias.name.split('.').next().unwrap_or(&alias.name);
                            (first, first)
                        }
                    };
                    let Some(module) = self.state.options.get_module(module_name) else {
                        return Err(MantleError::Import {
                            module: alias.name.clone(),
                        });
                    };
                    env.frame.set(bind, Value::object(ObjectKind::Module(module)));
                }
            }
            Stmt::ImportFrom { module, names, .. } => {
                let Some(source) = self.state.options.get_module(module) else {
                    return Err(MantleError::Import {
                        module: module.clone(),
                    });
                };
                for alias in names {
                    let Some(func) = source.get(&alias.name) else {
                        return Err(MantleError::Import {
                            module: format!("{module}.{}", alias.name),
                        });
                    };
                    let bind = alias.asname.as_deref().unwrap_or(&alias.name);
                    env.frame.set(bind, Value::Function(func.clone()));
                }
            }
            Stmt::Pass => {}
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
        env: &Env,
    ) -> MantleResult<Flow> {
        let outcome = match self.exec_stmts(body, env) {
            Ok(Flow::Normal) => self.exec_stmts(orelse, env),
            Ok(flow) => Ok(flow),
            Err(err) => {
                let handler = handlers
                    .iter()
                    .find(|h| catches(&exception_classes(h.class.as_ref()), &err));
                match handler {
                    Some(handler) => {
                        if let Some(name) = &handler.name {
                            env.frame.set(name, Value::str(err.root_cause().to_string()));
                        }
                        self.exec_stmts(&handler.body, env)
                    }
                    None => Err(err),
                }
            }
        };
        if finalbody.is_empty() {
            return outcome;
        }
        match self.exec_stmts(finalbody, env)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    fn assign(&mut self, target: &Expr, value: Value, env: &Env) -> MantleResult<()> {
        match target {
            Expr::Name(name) => {
                env.frame.set(name, value);
                Ok(())
            }
            Expr::Tuple(targets) | Expr::List(targets) => {
                let items = value.iterate()?;
                if items.len() < targets.len() {
                    return Err(MantleError::Value(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    )));
                }
                if items.len() > targets.len() {
                    return Err(MantleError::Value(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, env)?;
                }
                Ok(())
            }
            Expr::Attribute {
                value: object,
                attr,
            } => match self.eval(object, env)? {
                Value::Dict(map) => {
                    map.borrow_mut().insert(attr.clone(), value);
                    Ok(())
                }
                other => Err(MantleError::type_error(format!(
                    "cannot set attribute '{attr}' on '{}'",
                    other.type_name()
                ))),
            },
            Expr::Subscript {
                value: object,
                index,
            } => {
                let object = self.eval(object, env)?;
                let index = self.eval(index, env)?;
                object.set_item(&index, value)
            }
            _ => Err(MantleError::type_error("cannot assign to expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Context, MantleError, Template, TemplateOptions};

    fn render(source: &str, context: &Context) -> Result<String, MantleError> {
        Template::new(source)?.render(context)
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_loop_with_else_and_break() {
        let context = Context::new();
        let output = render(
            "% for x in [1, 2, 3]:\n${x}\n% else:\ndone\n% endfor\n",
            &context,
        )
        .unwrap();
        assert_eq!(output, "1\n2\n3\ndone\n");

        let output = render(
            "% for x in [1, 2, 3]:\n% if x == 2:\n% break\n% endif\n${x}\n% else:\ndone\n% endfor\n",
            &context,
        )
        .unwrap();
        assert_eq!(output, "1\n");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_context_tracks_position() {
        let output = render(
            "% for x in ['a', 'b', 'c']:\n${loop.index}${x}${'|' if not loop.last else ''}\n% endfor\n",
            &Context::new(),
        )
        .unwrap();
        assert_eq!(output, "0a|\n1b|\n2c\n");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_python_blocks_share_locals_with_the_body() {
        let output = render(
            "<%\n    total = 0\n    for n in range(5):\n        total += n\n%>${total}",
            &Context::new(),
        )
        .unwrap();
        assert_eq!(output, "10");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_defs_take_defaults_and_keywords() {
        let output = render(
            "<%def name=\"greet(name, punct='!')\">Hi ${name}${punct}</%def>${greet('a')} ${greet(name='b', punct='?')}",
            &Context::new(),
        )
        .unwrap();
        assert_eq!(output, "Hi a! Hi b?");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_argument_is_reported() {
        let err = render(
            "<%def name=\"greet(name)\">Hi ${name}</%def>${greet()}",
            &Context::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            MantleError::MissingArgument { argument, .. } if argument == "name"
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_embedded_try_catches_by_class() {
        let output = render(
            "% try:\n${1 / 0}\n% except ZeroDivisionError as e:\ncaught\n% endtry\n",
            &Context::new(),
        )
        .unwrap();
        assert_eq!(output, "caught\n");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_try_runs_finally_after_handler() {
        let output = render(
            "% for d in [1, 0]:\n% try:\n${10 // d}\n% except ZeroDivisionError:\nzero\n% finally:\nend\n% endtry\n% endfor\n",
            &Context::new(),
        )
        .unwrap();
        assert_eq!(output, "10\nend\nzero\nend\n");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_inline_code_block_with_flush_continuation() {
        let output = render("<% x = 1\ny = 2 %>${x}${y}", &Context::new()).unwrap();
        assert_eq!(output, "12");
    }

    #[test]
    #[ntest::timeout(2000)]
    fn test_deep_recursion_is_an_error_not_an_overflow() {
        let source = "<%def name=\"f(n)\">${f(n - 1) if n > 0 else 'base'}</%def>${f(depth)}";
        let mut context = Context::new();
        context.insert("depth", 150);
        assert_eq!(render(source, &context).unwrap(), "base");

        context.insert("depth", 5000);
        let err = render(source, &context).unwrap_err();
        assert!(
            matches!(err.root_cause(), MantleError::Value(message) if message.contains("recursion")),
            "{err:?}"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_strict_undefined_fails_at_lookup() {
        let template = Template::with_options(
            "${missing}",
            "strict.html",
            TemplateOptions::new().strict_undefined(true),
        )
        .unwrap();
        let err = template.render(&Context::new()).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            MantleError::UnresolvedName { name } if name == "missing"
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_lambda_and_comprehension() {
        let output = render(
            "<% double = lambda v: v * 2 %>${[double(n) for n in range(4) if n % 2 == 1]}",
            &Context::new(),
        )
        .unwrap();
        assert_eq!(output, "[2, 6]");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_call_tag_exposes_caller_body() {
        let output = render(
            "<%def name=\"wrap()\">[${caller.body()}]</%def><%call expr=\"wrap()\">inner</%call>",
            &Context::new(),
        )
        .unwrap();
        assert_eq!(output, "[inner]");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_inline_namespace_members() {
        let output = render(
            "<%namespace name=\"tools\"><%def name=\"bold(t)\"><b>${t}</b></%def></%namespace>${tools.bold('x')}",
            &Context::new(),
        )
        .unwrap();
        assert_eq!(output, "<b>x</b>");
    }
}
