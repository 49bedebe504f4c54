// HostCL Executor - Running Compiled Modules
//
// Executes the host AST produced by the compiler. Lexical variables live
// in chained environment frames, one per procedure call; special
// variables live in the process's dynamic stack. Non-local exits travel
// up the host stack as ControlSignal values.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use smallvec::SmallVec;

use crate::ast::{Comprehension, Expr, Ident, Module, Namespace, Params, Stmt};
use crate::clos::{self, ClassId};
use crate::compiler;
use crate::conditions::{self, condition_from_error, describe_condition, Condition, RuntimeError};
use crate::context::GlobalContext;
use crate::dynamic::BindingFrame;
use crate::printer;
use crate::process::Process;
use crate::reader::{Reader, ReaderOptions};
use crate::symbol::{PackageId, ReadCase, SymbolId, CL_USER};
use crate::types::{Function, Value};

pub type EvalResult = Result<Value, ControlSignal>;

// Free stack below which a new segment is allocated, and that segment's size.
// Deep recursion then stops at `max_call_depth` instead of the thread guard page.
const STACK_RED_ZONE: usize = 128 * 1024;
const STACK_SEGMENT: usize = 4 * 1024 * 1024;

/// A transfer of control travelling up the host stack.
#[derive(Debug, Clone)]
pub enum ControlSignal {
    /// THROW (and everything built on it) to a live catch tag
    Throw { tag: Value, value: Value },
    /// An error nobody handled; unwinds to the top level
    Unwind(Arc<Condition>),
}

/// How a body run under `with_catch` finished.
#[derive(Debug)]
pub enum Caught {
    Returned(Value),
    Thrown(Value),
}

/// One frame of lexical bindings.
#[derive(Debug, Default)]
pub struct Environment {
    bindings: RwLock<HashMap<Ident, Value>>,
    /// Names this frame writes through to an enclosing frame
    nonlocals: RwLock<SmallVec<[Ident; 2]>>,
    parent: Option<Arc<Environment>>,
}

impl Environment {
    pub fn root() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn child(parent: &Arc<Environment>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(parent.clone()),
            ..Self::default()
        })
    }

    pub fn lookup(&self, id: &Ident) -> Option<Value> {
        let mut env = self;
        loop {
            if let Some(v) = env.bindings.read().unwrap_or_else(|e| e.into_inner()).get(id) {
                return Some(v.clone());
            }
            match &env.parent {
                Some(parent) => env = parent,
                None => return None,
            }
        }
    }

    pub fn define(&self, id: Ident, value: Value) {
        self.bindings.write().unwrap_or_else(|e| e.into_inner()).insert(id, value);
    }

    fn is_nonlocal(&self, id: &Ident) -> bool {
        self.nonlocals.read().unwrap_or_else(|e| e.into_inner()).contains(id)
    }

    fn declare_nonlocal(&self, ids: &[Ident]) {
        let mut nonlocals = self.nonlocals.write().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            if !nonlocals.contains(id) {
                nonlocals.push(*id);
            }
        }
    }

    /// Overwrites the nearest existing binding of `id`, starting here.
    fn assign_existing(&self, id: Ident, value: Value) -> bool {
        let mut env = self;
        loop {
            {
                let mut bindings = env.bindings.write().unwrap_or_else(|e| e.into_inner());
                if let Some(slot) = bindings.get_mut(&id) {
                    *slot = value;
                    return true;
                }
            }
            match &env.parent {
                Some(parent) => env = parent,
                None => return false,
            }
        }
    }
}

#[derive(Debug)]
pub enum ClosureBody {
    Expr(Arc<Expr>),
    Block(Arc<Vec<Stmt>>),
}

/// A procedure together with the frame it was created in.
#[derive(Debug)]
pub struct Closure {
    pub name: Option<String>,
    pub params: Arc<Params>,
    pub body: ClosureBody,
    pub env: Arc<Environment>,
}

impl Closure {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "LAMBDA".to_string())
    }
}

enum Flow {
    Normal,
    Return(Value),
}

/// A process executing against the shared global context.
pub struct Interpreter<'a> {
    pub process: &'a mut Process,
    pub globals: &'a GlobalContext,
}

impl<'a> Interpreter<'a> {
    pub fn new(process: &'a mut Process, globals: &'a GlobalContext) -> Self {
        Self { process, globals }
    }

    // ------------------------------------------------------------------
    // Names and values
    // ------------------------------------------------------------------

    pub fn symbol_name(&self, sym: SymbolId) -> String {
        self.globals
            .symbols()
            .symbol_name(sym)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#<symbol {}>", sym.0))
    }

    /// Current value of a special variable; None when unbound.
    pub fn special_value(&self, sym: SymbolId) -> Option<Value> {
        let symbols = self.globals.symbols();
        self.process
            .dynamic
            .lookup(sym, &symbols)
            .filter(|v| !matches!(v, Value::Unbound))
    }

    /// SETQ of a special variable: the innermost binding in this process,
    /// else the global value cell.
    pub fn set_special(&mut self, sym: SymbolId, value: Value) -> Result<(), ControlSignal> {
        let constant = self.globals.symbols().is_constant(sym);
        if constant {
            let name = self.symbol_name(sym);
            return Err(self.raise(RuntimeError::ConstantAssignment(name)));
        }
        if let Err(value) = self.process.dynamic.set_local(sym, value) {
            self.globals.symbols_mut().set_symbol_value(sym, value);
        }
        Ok(())
    }

    pub fn function_value(&mut self, sym: SymbolId) -> EvalResult {
        let found = self.globals.symbols().symbol_function(sym).cloned();
        match found {
            Some(f) => Ok(f),
            None => {
                let name = self.symbol_name(sym);
                Err(self.raise(RuntimeError::UndefinedFunction(name)))
            }
        }
    }

    pub fn current_package(&self) -> PackageId {
        match self.special_value(self.globals.wk.package_var) {
            Some(Value::Package(p)) => p,
            _ => CL_USER,
        }
    }

    pub fn reader_options(&self) -> ReaderOptions {
        let case = self
            .special_value(self.globals.wk.read_case_var)
            .and_then(|v| v.as_symbol())
            .and_then(|s| ReadCase::from_name(&self.symbol_name(s)))
            .unwrap_or(self.globals.options.read_case);
        ReaderOptions {
            package: self.current_package(),
            case,
        }
    }

    pub fn class_of(&self, value: &Value) -> ClassId {
        let keyword = match value {
            Value::Symbol(s) => self.globals.symbols().is_keyword(*s),
            _ => false,
        };
        self.globals.classes().class_of(value, keyword)
    }

    pub fn prin1_to_string(&self, value: &Value) -> String {
        printer::print_to_string(self, value, true).unwrap_or_else(|e| e.to_string())
    }

    pub fn princ_to_string(&self, value: &Value) -> String {
        printer::print_to_string(self, value, false).unwrap_or_else(|e| e.to_string())
    }

    /// One line for a signal that reached the top level.
    pub fn describe_signal(&self, signal: &ControlSignal) -> String {
        match signal {
            ControlSignal::Unwind(condition) => {
                let class = self.globals.classes().class_name(condition.class);
                format!("{}: {}", self.symbol_name(class), describe_condition(self, condition))
            }
            ControlSignal::Throw { tag, .. } => {
                format!("uncaught throw to {}", self.prin1_to_string(tag))
            }
        }
    }

    // ------------------------------------------------------------------
    // Control transfer
    // ------------------------------------------------------------------

    /// Signals `err` as an error condition. The returned signal is what
    /// the caller propagates once no handler transferred control.
    pub fn raise(&mut self, err: impl Into<RuntimeError>) -> ControlSignal {
        let err = err.into();
        log::debug!("process {}: {}", self.process.pid.0, err);
        let condition = condition_from_error(self, &err);
        conditions::error(self, condition)
    }

    /// A throw to `tag`, or a control error when no such catch is live.
    pub fn throw(&mut self, tag: Value, value: Value) -> ControlSignal {
        if self.process.has_catch_tag(&tag) {
            ControlSignal::Throw { tag, value }
        } else {
            let text = self.prin1_to_string(&tag);
            self.raise(RuntimeError::NoCatchTag(text))
        }
    }

    /// Runs `body` with `tag` live; a throw to it ends up here.
    pub fn with_catch(
        &mut self,
        tag: &Value,
        body: impl FnOnce(&mut Self) -> EvalResult,
    ) -> Result<Caught, ControlSignal> {
        let dynamic_depth = self.process.dynamic.depth();
        let call_depth = self.process.call_stack.len();
        let catch_depth = self.process.catch_tags.len();
        self.process.catch_tags.push(tag.clone());
        let result = body(self);
        self.process.catch_tags.truncate(catch_depth);
        match result {
            Ok(v) => Ok(Caught::Returned(v)),
            Err(ControlSignal::Throw { tag: thrown, value }) if thrown.eq(tag) => {
                self.process.dynamic.unwind_to(dynamic_depth);
                self.process.call_stack.truncate(call_depth);
                Ok(Caught::Thrown(value))
            }
            Err(other) => Err(other),
        }
    }

    /// Runs `body` with a frame of special bindings, popped on every exit.
    pub fn bind_specials(
        &mut self,
        frame: BindingFrame,
        body: impl FnOnce(&mut Self) -> EvalResult,
    ) -> EvalResult {
        let depth = self.process.dynamic.depth();
        self.process.dynamic.push(frame);
        let result = body(self);
        self.process.dynamic.unwind_to(depth);
        result
    }

    // ------------------------------------------------------------------
    // Calling
    // ------------------------------------------------------------------

    pub fn apply(&mut self, function: &Value, args: &[Value]) -> EvalResult {
        match function {
            Value::Function(Function::Native(native)) => (native.func)(self, args),
            Value::Function(Function::Closure(closure)) => self.call_closure(closure, args),
            Value::Function(Function::Generic(generic)) => clos::call_generic(self, generic, args),
            Value::Function(Function::NextMethod(next)) => clos::call_next_method(self, next, args),
            Value::Symbol(sym) => {
                let f = self.function_value(*sym)?;
                self.apply(&f, args)
            }
            other => {
                let text = self.prin1_to_string(other);
                Err(self.raise(RuntimeError::NotAFunction(text)))
            }
        }
    }

    /// Calls the global function named `name` in the current package.
    pub fn call(&mut self, name: &str, args: &[Value]) -> EvalResult {
        let package = self.current_package();
        let sym = self.globals.intern(name, package);
        let f = self.function_value(sym)?;
        self.apply(&f, args)
    }

    fn call_closure(&mut self, closure: &Arc<Closure>, args: &[Value]) -> EvalResult {
        let limit = self.globals.options.max_call_depth;
        if self.process.call_stack.len() >= limit {
            return Err(self.raise(RuntimeError::CallDepthExceeded(limit)));
        }
        let env = Environment::child(&closure.env);
        self.bind_params(closure, args, &env)?;

        self.process.call_stack.push(closure.display_name());
        let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || match &closure.body {
            ClosureBody::Expr(expr) => self.eval_expr(expr, &env),
            ClosureBody::Block(body) => match self.exec_block(body, &env) {
                Ok(Flow::Return(v)) => Ok(v),
                Ok(Flow::Normal) => Ok(Value::Nil),
                Err(signal) => Err(signal),
            },
        });
        self.process.call_stack.pop();
        result
    }

    fn bind_params(&mut self, closure: &Closure, args: &[Value], env: &Environment) -> Result<(), ControlSignal> {
        let params = &closure.params;
        let required = params.required.len();
        let optional = params.optional.len();
        let variadic = params.rest.is_some() || params.accepts_keys;
        if args.len() < required || (!variadic && args.len() > required + optional) {
            let expected = if variadic {
                format!("at least {}", required)
            } else if optional > 0 {
                format!("between {} and {}", required, required + optional)
            } else {
                required.to_string()
            };
            return Err(self.raise(RuntimeError::ArgumentCount {
                function: closure.display_name(),
                expected,
                got: args.len(),
            }));
        }

        for (id, value) in params.required.iter().zip(args) {
            env.define(*id, value.clone());
        }
        for (i, id) in params.optional.iter().enumerate() {
            env.define(*id, args.get(required + i).cloned().unwrap_or(Value::Unbound));
        }
        let rest = args.get(required + optional..).unwrap_or(&[]);
        if let Some(id) = params.rest {
            env.define(id, Value::list(rest.to_vec()));
        }
        if params.accepts_keys {
            self.bind_keys(closure, rest, env)?;
        }
        Ok(())
    }

    fn bind_keys(&mut self, closure: &Closure, rest: &[Value], env: &Environment) -> Result<(), ControlSignal> {
        let params = &closure.params;
        if rest.len() % 2 != 0 {
            return Err(self.raise(RuntimeError::OddKeywordArguments(closure.display_name())));
        }
        let allow_key = self.globals.wk.allow_other_keys;
        let find = |key: SymbolId| {
            rest.chunks(2)
                .find(|pair| pair[0].as_symbol() == Some(key))
                .map(|pair| pair[1].clone())
        };
        for (keyword, id) in &params.keys {
            env.define(*id, find(*keyword).unwrap_or(Value::Unbound));
        }
        let allowed = params.allow_other_keys || find(allow_key).is_some_and(|v| v.is_true());
        if allowed {
            return Ok(());
        }
        for pair in rest.chunks(2) {
            let known = match pair[0].as_symbol() {
                Some(s) => s == allow_key || params.keys.iter().any(|(k, _)| *k == s),
                None => false,
            };
            if !known {
                let keyword = self.prin1_to_string(&pair[0]);
                return Err(self.raise(RuntimeError::UnknownKeyword {
                    function: closure.display_name(),
                    keyword,
                }));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Executing the host AST
    // ------------------------------------------------------------------

    pub fn run_module(&mut self, module: &Module) -> EvalResult {
        let env = Environment::root();
        match self.exec_block(&module.body, &env)? {
            Flow::Return(v) => Ok(v),
            Flow::Normal => Ok(Value::Nil),
        }
    }

    fn eval_expr(&mut self, expr: &Expr, env: &Arc<Environment>) -> EvalResult {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || self.eval_node(expr, env))
    }

    fn eval_node(&mut self, expr: &Expr, env: &Arc<Environment>) -> EvalResult {
        match expr {
            Expr::Const(v) => Ok(v.clone()),
            Expr::Name(id) => self.lookup(*id, env),
            Expr::Call { func, args } => {
                let f = self.eval_expr(func, env)?;
                let mut values: SmallVec<[Value; 4]> = SmallVec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg, env)?);
                }
                self.apply(&f, &values)
            }
            Expr::IfExp { test, then, orelse } => {
                if self.eval_expr(test, env)?.is_true() {
                    self.eval_expr(then, env)
                } else {
                    self.eval_expr(orelse, env)
                }
            }
            Expr::Lambda { name, params, body } => Ok(Value::Function(Function::Closure(Arc::new(Closure {
                name: name.clone(),
                params: params.clone(),
                body: ClosureBody::Expr(body.clone()),
                env: env.clone(),
            })))),
            Expr::ListComp { element, generators } => {
                let scope = Environment::child(env);
                let mut out = Vec::new();
                self.comprehend(element, generators, &scope, &mut out)?;
                Ok(Value::list(out))
            }
        }
    }

    fn comprehend(
        &mut self,
        element: &Expr,
        generators: &[Comprehension],
        env: &Arc<Environment>,
        out: &mut Vec<Value>,
    ) -> Result<(), ControlSignal> {
        let Some((first, rest)) = generators.split_first() else {
            out.push(self.eval_expr(element, env)?);
            return Ok(());
        };
        let sequence = self.eval_expr(&first.iter, env)?;
        let items = self.iterable(&sequence)?;
        'items: for item in items.iter() {
            env.define(first.target, item.clone());
            for condition in &first.conditions {
                if self.eval_expr(condition, env)?.is_nil() {
                    continue 'items;
                }
            }
            self.comprehend(element, rest, env, out)?;
        }
        Ok(())
    }

    fn iterable(&mut self, value: &Value) -> Result<Arc<[Value]>, ControlSignal> {
        match value {
            Value::Nil => Ok(Arc::from(Vec::new())),
            Value::List(items) | Value::Vector(items) => Ok(items.clone()),
            Value::String(s) => Ok(s.chars().map(Value::Char).collect()),
            other => {
                let datum = self.prin1_to_string(other);
                Err(self.raise(RuntimeError::TypeError {
                    datum,
                    expected: "SEQUENCE".to_string(),
                }))
            }
        }
    }

    fn lookup(&mut self, id: Ident, env: &Arc<Environment>) -> EvalResult {
        if id.is_global() {
            return match id.namespace {
                Namespace::Function => self.function_value(id.symbol),
                Namespace::Variable => match self.special_value(id.symbol) {
                    Some(v) => Ok(v),
                    None => {
                        let name = self.symbol_name(id.symbol);
                        Err(self.raise(RuntimeError::UnboundVariable(name)))
                    }
                },
            };
        }
        match env.lookup(&id) {
            Some(v) => Ok(v),
            None => {
                let name = self.symbol_name(id.symbol);
                Err(self.raise(RuntimeError::UnboundVariable(name)))
            }
        }
    }

    fn assign(&mut self, id: Ident, value: Value, env: &Arc<Environment>) -> Result<(), ControlSignal> {
        if id.is_global() {
            return match id.namespace {
                Namespace::Variable => self.set_special(id.symbol, value),
                Namespace::Function => {
                    self.globals.symbols_mut().set_symbol_function(id.symbol, value);
                    Ok(())
                }
            };
        }
        if !env.is_nonlocal(&id) {
            env.define(id, value);
            return Ok(());
        }
        let written = match &env.parent {
            Some(parent) => parent.assign_existing(id, value),
            None => false,
        };
        if written {
            Ok(())
        } else {
            let name = self.symbol_name(id.symbol);
            Err(self.raise(RuntimeError::Simple(format!(
                "no enclosing binding of {} to assign",
                name
            ))))
        }
    }

    fn exec_block(&mut self, body: &[Stmt], env: &Arc<Environment>) -> Result<Flow, ControlSignal> {
        for stmt in body {
            if let Flow::Return(v) = self.exec_stmt(stmt, env)? {
                return Ok(Flow::Return(v));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &Arc<Environment>) -> Result<Flow, ControlSignal> {
        match stmt {
            Stmt::FunctionDef { name, label, params, body } => {
                let closure = Value::Function(Function::Closure(Arc::new(Closure {
                    name: label.clone(),
                    params: params.clone(),
                    body: ClosureBody::Block(body.clone()),
                    env: env.clone(),
                })));
                self.assign(*name, closure, env)?;
            }
            Stmt::Return(expr) => return Ok(Flow::Return(self.eval_expr(expr, env)?)),
            Stmt::Assign { target, value } => {
                let v = self.eval_expr(value, env)?;
                self.assign(*target, v, env)?;
            }
            Stmt::Expr(expr) => {
                self.eval_expr(expr, env)?;
            }
            Stmt::If { test, body, orelse } => {
                let branch = if self.eval_expr(test, env)?.is_true() { body } else { orelse };
                return self.exec_block(branch, env);
            }
            Stmt::While { test, body, orelse } => {
                while self.eval_expr(test, env)?.is_true() {
                    if let Flow::Return(v) = self.exec_block(body, env)? {
                        return Ok(Flow::Return(v));
                    }
                }
                return self.exec_block(orelse, env);
            }
            Stmt::For { target, iter, body, orelse } => {
                let sequence = self.eval_expr(iter, env)?;
                let items = self.iterable(&sequence)?;
                for item in items.iter() {
                    self.assign(*target, item.clone(), env)?;
                    if let Flow::Return(v) = self.exec_block(body, env)? {
                        return Ok(Flow::Return(v));
                    }
                }
                return self.exec_block(orelse, env);
            }
            Stmt::Try { body, finalbody } => {
                let result = self.exec_block(body, env);
                return match self.exec_block(finalbody, env)? {
                    Flow::Return(v) => Ok(Flow::Return(v)),
                    Flow::Normal => result,
                };
            }
            Stmt::Global(_) => {}
            Stmt::Nonlocal(names) => env.declare_nonlocal(names),
        }
        Ok(Flow::Normal)
    }

    // ------------------------------------------------------------------
    // Top level
    // ------------------------------------------------------------------

    /// Compiles and runs one form. A top-level PROGN is split so that a
    /// macro defined by one subform can be used by the next.
    pub fn eval_form(&mut self, form: &Value) -> EvalResult {
        let form = compiler::macroexpand(self, form)?;
        if let Value::List(items) = &form {
            if items[0].as_symbol() == Some(self.globals.wk.progn) {
                let mut last = Value::Nil;
                for sub in &items[1..] {
                    last = self.eval_form(sub)?;
                }
                return Ok(last);
            }
        }
        let module = compiler::compile_toplevel(self, &form)?;
        self.run_module(&module)
    }

    /// Reads and evaluates every form in `text`, returning the last value.
    /// Each form is read in the package left by the previous one.
    pub fn eval_string(&mut self, text: &str) -> EvalResult {
        let chars: Vec<char> = text.chars().collect();
        let mut position = 0;
        let mut last = Value::Nil;
        loop {
            match self.read_at(&chars, &mut position) {
                Ok(Some(form)) => last = self.eval_form(&form)?,
                Ok(None) => return Ok(last),
                Err(signal) => return Err(signal),
            }
        }
    }

    /// Reads the form starting at `*position` and advances past it.
    pub fn read_at(&mut self, chars: &[char], position: &mut usize) -> Result<Option<Value>, ControlSignal> {
        let options = self.reader_options();
        let read = {
            let mut symbols = self.globals.symbols_mut();
            let mut reader = Reader::new(chars, &mut symbols, options).at(*position);
            let read = reader.read();
            *position = reader.position();
            read
        };
        read.map_err(|e| self.raise(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeOptions;

    fn run(ctx: &GlobalContext, text: &str) -> Result<String, String> {
        let mut process = Process::new();
        let mut interp = Interpreter::new(&mut process, ctx);
        match interp.eval_string(text) {
            Ok(v) => Ok(interp.prin1_to_string(&v)),
            Err(signal) => Err(interp.describe_signal(&signal)),
        }
    }

    #[test]
    fn test_environment_chain() {
        let sym = SymbolId(1);
        let id = Ident { symbol: sym, serial: 2, namespace: Namespace::Variable };
        let root = Environment::root();
        root.define(id, Value::Integer(1));
        let child = Environment::child(&root);
        assert_eq!(child.lookup(&id), Some(Value::Integer(1)));
        assert!(child.assign_existing(id, Value::Integer(2)));
        assert_eq!(root.lookup(&id), Some(Value::Integer(2)));
        let other = Ident { serial: 4, ..id };
        assert!(!child.assign_existing(other, Value::Nil));
    }

    #[test]
    fn test_arguments_and_keywords() {
        let ctx = GlobalContext::new();
        assert_eq!(run(&ctx, "((lambda (a &optional (b 10)) (+ a b)) 1)").unwrap(), "11");
        assert_eq!(run(&ctx, "((lambda (&key x (y 2)) (list x y)) :x 1)").unwrap(), "(1 2)");
        assert_eq!(
            run(&ctx, "((lambda (&key x) x) :x 1 :x 2)").unwrap(),
            "1",
            "the first occurrence of a key wins"
        );
        assert_eq!(run(&ctx, "((lambda (&key x) x) :y 1 :allow-other-keys t)").unwrap(), "NIL");
        assert!(run(&ctx, "((lambda (&key x) x) :y 1)").unwrap_err().contains("unknown keyword"));
        assert!(run(&ctx, "((lambda (&key x) x) :x)").unwrap_err().contains("odd number"));
        assert!(run(&ctx, "((lambda (a) a))").unwrap_err().contains("expects 1"));
    }

    #[test]
    fn test_call_depth_limit() {
        let ctx = GlobalContext::with_options(RuntimeOptions::default().with_max_call_depth(50));
        let err = run(&ctx, "(def down (n) (down (+ n 1))) (down 0)").unwrap_err();
        assert!(err.contains("call depth exceeded 50"), "{}", err);
    }

    #[test]
    fn test_unbound_and_undefined() {
        let ctx = GlobalContext::new();
        assert!(run(&ctx, "no-such-variable").unwrap_err().starts_with("UNBOUND-VARIABLE"));
        assert!(run(&ctx, "(no-such-function 1)").unwrap_err().starts_with("UNDEFINED-FUNCTION"));
    }

    #[test]
    fn test_throw_without_catch_is_control_error() {
        let ctx = GlobalContext::new();
        let err = run(&ctx, "(throw 'nowhere 1)").unwrap_err();
        assert!(err.starts_with("CONTROL-ERROR"), "{}", err);
    }
}
