// HostCL Compiler - Forms to Host AST
//
// Lowers source forms into the statement/expression tree of ast.rs.
// Every form compiles to a Fragment: statements that must run first and
// an expression yielding the value. Forms whose parts are all
// expressions stay expressions. Anything else is split, and an earlier
// operand is spilled into a temporary whenever a later prologue could
// change what it reads.
//
// A procedure that assigns a variable owned by an enclosing procedure
// declares it nonlocal. Once a variable escapes like that, any call may
// change it, so definitions are recompiled until the set of escaping
// variables stops growing.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::analyzer::{analyze_body, analyze_fragment, declared_nonlocals, free_functions, may_call, NameSet};
use crate::ast::{Comprehension, Expr, Ident, Module, Namespace, Params, Stmt};
use crate::context::{GlobalContext, WellKnown};
use crate::eval::{ControlSignal, EvalResult, Interpreter};
use crate::lambda_list::{self, LambdaListError, ParsedLambdaList};
use crate::printer;
use crate::symbol::SymbolId;
use crate::types::Value;

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("{0} is not a valid operator")]
    UnresolvedOperator(String),
    #[error("{error} (in {form})")]
    LambdaList { error: LambdaListError, form: String },
    #[error("unknown declaration {0}")]
    UnknownDeclaration(String),
    #[error("malformed {form}: {reason}")]
    Malformed { form: String, reason: String },
    #[error("return from unknown block {0}")]
    UnknownBlock(String),
    #[error("the escaping-variable analysis did not settle within {0} passes")]
    FixpointDiverged(usize),
}

/// The compiled form: run `prologue`, then evaluate `value`.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub prologue: Vec<Stmt>,
    pub value: Expr,
}

impl Fragment {
    pub fn expr(value: Expr) -> Self {
        Self { prologue: Vec::new(), value }
    }

    pub fn is_expression(&self) -> bool {
        self.prologue.is_empty()
    }

    /// Statements for a form whose value nobody uses.
    fn into_discarded(self) -> Vec<Stmt> {
        let mut stmts = self.prologue;
        if !self.value.is_pure() {
            stmts.push(Stmt::Expr(self.value));
        }
        stmts
    }

    /// Statements of a procedure body returning the value.
    fn into_body(self) -> Vec<Stmt> {
        let mut stmts = self.prologue;
        stmts.push(Stmt::Return(self.value));
        stmts
    }
}

/// Compiles the arguments of one special form.
pub type FormCompiler = fn(&mut Compiler<'_, '_>, &[Value]) -> Result<Fragment, ControlSignal>;

#[derive(Debug, Clone)]
enum Binding {
    Variable { symbol: SymbolId, ident: Ident },
    Special(SymbolId),
    Function { symbol: SymbolId, ident: Ident },
    Block { name: SymbolId, tag: Ident },
    NextMethod(Ident),
}

/// Variables created while compiling one procedure body.
#[derive(Debug, Default)]
struct Record {
    owned: NameSet,
}

#[derive(Debug, Default)]
struct Declarations {
    specials: Vec<SymbolId>,
}

#[derive(Debug, Default, Clone)]
struct LambdaOptions {
    /// Wrap the body in an implicit BLOCK of this name
    block: Option<SymbolId>,
    label: Option<String>,
    /// Compile to a definition of this global function
    global_name: Option<SymbolId>,
    /// Take the next-method object as a hidden first parameter
    next_method: bool,
}

pub struct Compiler<'c, 'g> {
    interp: &'c mut Interpreter<'g>,
    globals: &'g GlobalContext,
    wk: &'g WellKnown,
    scope: Vec<Binding>,
    records: Vec<Record>,
    /// Lexical variables some procedure assigns from outside its owner
    escaping: NameSet,
    /// Macro expansions keyed by the identity of the expanded form
    expansions: HashMap<usize, (Value, Value)>,
    /// Serials for source bindings are even, for compiler temporaries odd
    next_binding: u32,
    next_temp: u32,
}

impl<'c, 'g> Compiler<'c, 'g> {
    pub fn new(interp: &'c mut Interpreter<'g>) -> Self {
        let globals: &'g GlobalContext = interp.globals;
        Self {
            interp,
            globals,
            wk: &globals.wk,
            scope: Vec::new(),
            records: Vec::new(),
            escaping: NameSet::new(),
            expansions: HashMap::new(),
            next_binding: 2,
            next_temp: 1,
        }
    }

    // ------------------------------------------------------------------
    // Errors and names
    // ------------------------------------------------------------------

    fn fail(&mut self, err: CompileError) -> ControlSignal {
        self.interp.raise(err)
    }

    fn malformed(&mut self, form: &Value, reason: &str) -> ControlSignal {
        let form = self.show(form);
        self.fail(CompileError::Malformed { form, reason: reason.to_string() })
    }

    fn show(&self, value: &Value) -> String {
        printer::show(&self.globals.symbols(), value)
    }

    fn symbol_arg(&mut self, value: &Value, what: &str) -> Result<SymbolId, ControlSignal> {
        match value {
            Value::Symbol(s) => Ok(*s),
            Value::Nil => Ok(self.wk.nil),
            other => Err(self.malformed(other, &format!("expected {}", what))),
        }
    }

    fn global_call(&self, function: SymbolId, args: Vec<Expr>) -> Expr {
        Expr::call(Expr::Name(Ident::global_function(function)), args)
    }

    fn quoted(&self, value: Value) -> Value {
        Value::list(vec![Value::Symbol(self.wk.quote), value])
    }

    // ------------------------------------------------------------------
    // Records and identifiers
    // ------------------------------------------------------------------

    fn push_record(&mut self) {
        self.records.push(Record::default());
    }

    fn pop_record(&mut self) -> Record {
        self.records.pop().unwrap_or_default()
    }

    /// Gives the variables of a speculative record that did not become a
    /// procedure to the enclosing one.
    fn absorb(&mut self, record: Record) {
        if let Some(parent) = self.records.last_mut() {
            parent.owned.extend(record.owned);
        }
    }

    fn own(&mut self, id: Ident) {
        if let Some(record) = self.records.last_mut() {
            record.owned.insert(id);
        }
    }

    fn fresh_binding(&mut self, symbol: SymbolId, namespace: Namespace) -> Ident {
        let id = Ident { symbol, serial: self.next_binding, namespace };
        self.next_binding += 2;
        self.own(id);
        id
    }

    fn fresh_named_temp(&mut self, symbol: SymbolId) -> Ident {
        let id = Ident { symbol, serial: self.next_temp, namespace: Namespace::Variable };
        self.next_temp += 2;
        self.own(id);
        id
    }

    fn fresh_temp(&mut self) -> Ident {
        self.fresh_named_temp(self.wk.temp)
    }

    fn fresh_thunk(&mut self) -> Ident {
        self.fresh_named_temp(self.wk.thunk)
    }

    fn lookup_variable(&self, sym: SymbolId) -> Option<Ident> {
        self.scope.iter().rev().find_map(|b| match b {
            Binding::Variable { symbol, ident } if *symbol == sym => Some(*ident),
            Binding::Special(s) if *s == sym => Some(Ident::global_variable(sym)),
            _ => None,
        })
    }

    fn lookup_function(&self, sym: SymbolId) -> Option<Ident> {
        self.scope.iter().rev().find_map(|b| match b {
            Binding::Function { symbol, ident } if *symbol == sym => Some(*ident),
            _ => None,
        })
    }

    fn lookup_block(&self, sym: SymbolId) -> Option<Ident> {
        self.scope.iter().rev().find_map(|b| match b {
            Binding::Block { name, tag } if *name == sym => Some(*tag),
            _ => None,
        })
    }

    fn lookup_next_method(&self) -> Option<Ident> {
        self.scope.iter().rev().find_map(|b| match b {
            Binding::NextMethod(id) => Some(*id),
            _ => None,
        })
    }

    fn is_special(&self, sym: SymbolId, decls: &Declarations) -> bool {
        decls.specials.contains(&sym) || self.globals.is_special(sym)
    }

    // ------------------------------------------------------------------
    // Procedures
    // ------------------------------------------------------------------

    /// Prepends the scope declarations a procedure body needs.
    fn close_procedure(&mut self, record: Record, params: &Params, body: Vec<Stmt>) -> Vec<Stmt> {
        let analysis = analyze_body(&body);
        let params: NameSet = params.names().collect();
        let mut nonlocal = Vec::new();
        let mut global = Vec::new();
        for id in &analysis.assigned {
            if id.is_global() {
                if id.namespace == Namespace::Variable {
                    global.push(*id);
                }
            } else if !record.owned.contains(id) && !params.contains(id) {
                nonlocal.push(*id);
            }
        }
        let mut stmts = Vec::with_capacity(body.len() + 2);
        if !nonlocal.is_empty() {
            stmts.push(Stmt::Nonlocal(nonlocal));
        }
        if !global.is_empty() {
            stmts.push(Stmt::Global(global));
        }
        stmts.extend(body);
        stmts
    }

    /// A closure-valued fragment for `body`: a lambda expression when the
    /// body is one, otherwise a definition of a fresh thunk name.
    fn procedure(&mut self, record: Record, params: Arc<Params>, body: Fragment, label: Option<String>) -> Fragment {
        if body.is_expression() {
            self.absorb(record);
            return Fragment::expr(Expr::Lambda { name: label, params, body: Arc::new(body.value) });
        }
        let stmts = self.close_procedure(record, &params, body.into_body());
        let name = self.fresh_thunk();
        Fragment {
            prologue: vec![Stmt::FunctionDef { name, label, params, body: Arc::new(stmts) }],
            value: Expr::Name(name),
        }
    }

    fn procedure_call(&mut self, record: Record, params: Arc<Params>, body: Fragment, args: Vec<Expr>) -> Fragment {
        let function = self.procedure(record, params, body, None);
        Fragment {
            prologue: function.prologue,
            value: Expr::call(function.value, args),
        }
    }

    /// Compiles `forms` as the body of a zero-argument procedure.
    fn compile_thunk(&mut self, forms: &[Value]) -> Result<Fragment, ControlSignal> {
        self.push_record();
        let body = self.compile_body(forms)?;
        let record = self.pop_record();
        Ok(self.procedure(record, Arc::new(Params::default()), body, None))
    }

    /// A branch that must stay lazy: an expression, or a call to a thunk.
    fn compile_branch(&mut self, form: &Value) -> Result<Fragment, ControlSignal> {
        self.push_record();
        let fragment = self.compile(form)?;
        let record = self.pop_record();
        if fragment.is_expression() {
            self.absorb(record);
            return Ok(fragment);
        }
        let thunk = self.procedure(record, Arc::new(Params::default()), fragment, None);
        Ok(Fragment {
            prologue: thunk.prologue,
            value: Expr::call(thunk.value, Vec::new()),
        })
    }

    /// Wraps a thunk so it runs with `specials` bound to the given temps.
    fn dynamic_call(&self, specials: &[(SymbolId, Ident)], thunk: Fragment) -> Fragment {
        let symbols = Value::list(specials.iter().map(|(s, _)| Value::Symbol(*s)).collect());
        let values = self.global_call(self.wk.list, specials.iter().map(|(_, id)| Expr::Name(*id)).collect());
        Fragment {
            prologue: thunk.prologue,
            value: self.global_call(self.wk.dynamic_let, vec![Expr::Const(symbols), values, thunk.value]),
        }
    }

    // ------------------------------------------------------------------
    // Operand ordering
    // ------------------------------------------------------------------

    /// Joins operand fragments so they evaluate left to right. An operand
    /// whose value a later prologue might change is read into a temp
    /// before that prologue runs.
    fn flatten(&mut self, fragments: Vec<Fragment>) -> (Vec<Stmt>, Vec<Expr>) {
        let Some(last) = fragments.iter().rposition(|f| !f.is_expression()) else {
            return (Vec::new(), fragments.into_iter().map(|f| f.value).collect());
        };

        let n = fragments.len();
        let mut later_assigned = vec![NameSet::new(); n];
        let mut later_calls = vec![false; n];
        for i in (0..last).rev() {
            let next = &fragments[i + 1].prologue;
            let mut assigned = later_assigned[i + 1].clone();
            assigned.extend(analyze_body(next).assigned);
            later_assigned[i] = assigned;
            later_calls[i] = later_calls[i + 1] || may_call(next);
        }

        let mut prologue = Vec::new();
        let mut values = Vec::with_capacity(n);
        for (i, fragment) in fragments.into_iter().enumerate() {
            prologue.extend(fragment.prologue);
            if i < last && !self.is_stable(&fragment.value, &later_assigned[i], later_calls[i]) {
                let temp = self.fresh_temp();
                prologue.push(Stmt::Assign { target: temp, value: fragment.value });
                values.push(Expr::Name(temp));
            } else {
                values.push(fragment.value);
            }
        }
        (prologue, values)
    }

    fn is_stable(&self, value: &Expr, assigned: &NameSet, calls: bool) -> bool {
        match value {
            Expr::Const(_) | Expr::Lambda { .. } => true,
            Expr::Name(id) if id.is_global() => !calls && !assigned.contains(id),
            Expr::Name(id) => !assigned.contains(id) && !(calls && self.escaping.contains(id)),
            _ => false,
        }
    }

    fn compile_args(&mut self, forms: &[Value]) -> Result<Vec<Fragment>, ControlSignal> {
        forms.iter().map(|f| self.compile(f)).collect()
    }

    fn compile_call(&mut self, function: Fragment, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let mut fragments = Vec::with_capacity(args.len() + 1);
        fragments.push(function);
        fragments.extend(self.compile_args(args)?);
        let (prologue, mut values) = self.flatten(fragments);
        let function = values.remove(0);
        Ok(Fragment { prologue, value: Expr::call(function, values) })
    }

    fn call_internal(&mut self, function: SymbolId, fragments: Vec<Fragment>) -> Fragment {
        let (prologue, values) = self.flatten(fragments);
        Fragment { prologue, value: self.global_call(function, values) }
    }

    // ------------------------------------------------------------------
    // Fixed point
    // ------------------------------------------------------------------

    /// Repeats `pass` until it adds no variable to the escaping set.
    fn fixpoint(
        &mut self,
        pass: &mut dyn FnMut(&mut Self) -> Result<Fragment, ControlSignal>,
    ) -> Result<Fragment, ControlSignal> {
        let limit = self.globals.options.max_fixpoint_iterations;
        let start = (self.next_binding, self.next_temp);
        let mut passes = 0;
        loop {
            (self.next_binding, self.next_temp) = start;
            let before = self.escaping.len();
            let fragment = pass(self)?;
            self.escaping.extend(declared_nonlocals(&fragment.prologue));
            passes += 1;
            if self.escaping.len() == before {
                return Ok(fragment);
            }
            if passes >= limit {
                return Err(self.fail(CompileError::FixpointDiverged(limit)));
            }
            log::debug!("{} escaping variables after pass {}, recompiling", self.escaping.len(), passes);
        }
    }

    // ------------------------------------------------------------------
    // Forms
    // ------------------------------------------------------------------

    pub fn compile(&mut self, form: &Value) -> Result<Fragment, ControlSignal> {
        match form {
            Value::Symbol(sym) => self.compile_symbol(*sym),
            Value::List(items) => self.compile_list(form, items),
            other => Ok(Fragment::expr(Expr::Const(other.clone()))),
        }
    }

    fn compile_symbol(&mut self, sym: SymbolId) -> Result<Fragment, ControlSignal> {
        if let Some(id) = self.lookup_variable(sym) {
            return Ok(Fragment::expr(Expr::Name(id)));
        }
        let symbols = self.globals.symbols();
        if symbols.is_constant(sym) {
            if let Some(v) = symbols.symbol_value(sym) {
                return Ok(Fragment::expr(Expr::Const(v.clone())));
            }
        }
        Ok(Fragment::expr(Expr::Name(Ident::global_variable(sym))))
    }

    fn compile_list(&mut self, form: &Value, items: &[Value]) -> Result<Fragment, ControlSignal> {
        let (head, args) = (&items[0], &items[1..]);
        match head {
            Value::Symbol(sym) => {
                if let Some(compile_form) = self.globals.special_forms.get(sym).copied() {
                    return compile_form(self, args);
                }
                if let Some(id) = self.lookup_function(*sym) {
                    return self.compile_call(Fragment::expr(Expr::Name(id)), args);
                }
                if let Some(expansion) = self.expand(form, *sym, args)? {
                    return self.compile(&expansion);
                }
                let invalid = {
                    let symbols = self.globals.symbols();
                    symbols.is_keyword(*sym) || symbols.is_constant(*sym)
                };
                if invalid {
                    let name = self.show(head);
                    return Err(self.fail(CompileError::UnresolvedOperator(name)));
                }
                self.compile_call(Fragment::expr(Expr::Name(Ident::global_function(*sym))), args)
            }
            Value::List(_) if head.is_form(self.wk.lambda) => {
                let function = self.compile(head)?;
                self.compile_call(function, args)
            }
            other => {
                let name = self.show(other);
                Err(self.fail(CompileError::UnresolvedOperator(name)))
            }
        }
    }

    /// Expands a macro call once. Expansions are memoized per form so a
    /// recompilation sees the same code, gensyms included.
    fn expand(&mut self, form: &Value, sym: SymbolId, args: &[Value]) -> Result<Option<Value>, ControlSignal> {
        let Some(expander) = self.globals.macro_function(sym) else {
            return Ok(None);
        };
        let key = match form {
            Value::List(items) => Arc::as_ptr(items) as *const Value as usize,
            _ => 0,
        };
        if let Some((_, expansion)) = self.expansions.get(&key) {
            return Ok(Some(expansion.clone()));
        }
        let expansion = self.interp.apply(&expander, args)?;
        self.expansions.insert(key, (form.clone(), expansion.clone()));
        Ok(Some(expansion))
    }

    fn compile_body(&mut self, forms: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((last, init)) = forms.split_last() else {
            return Ok(Fragment::expr(Expr::nil()));
        };
        let mut prologue = Vec::new();
        for form in init {
            prologue.extend(self.compile_discard(form)?);
        }
        let tail = self.compile(last)?;
        prologue.extend(tail.prologue);
        Ok(Fragment { prologue, value: tail.value })
    }

    fn compile_discarded_body(&mut self, forms: &[Value]) -> Result<Vec<Stmt>, ControlSignal> {
        let mut stmts = Vec::new();
        for form in forms {
            stmts.extend(self.compile_discard(form)?);
        }
        Ok(stmts)
    }

    /// Compiles a form for effect. IF and PROGN become statements here
    /// instead of going through thunks.
    fn compile_discard(&mut self, form: &Value) -> Result<Vec<Stmt>, ControlSignal> {
        if let Value::List(items) = form {
            if let Some(sym) = items[0].as_symbol() {
                if sym == self.wk.if_ && (3..=4).contains(&items.len()) {
                    let test = self.compile(&items[1])?;
                    let body = self.compile_discard(&items[2])?;
                    let orelse = match items.get(3) {
                        Some(f) => self.compile_discard(f)?,
                        None => Vec::new(),
                    };
                    let mut stmts = test.prologue;
                    stmts.push(Stmt::If { test: test.value, body, orelse });
                    return Ok(stmts);
                }
                if sym == self.wk.progn {
                    return self.compile_discarded_body(&items[1..]);
                }
                if !self.globals.special_forms.contains_key(&sym) && self.lookup_function(sym).is_none() {
                    if let Some(expansion) = self.expand(form, sym, &items[1..])? {
                        return self.compile_discard(&expansion);
                    }
                }
            }
        }
        Ok(self.compile(form)?.into_discarded())
    }

    /// Splits leading docstring and declarations off a body.
    fn split_declarations<'v>(&self, forms: &'v [Value], allow_doc: bool) -> (Vec<Value>, &'v [Value]) {
        let mut decls = Vec::new();
        let mut rest = forms;
        let mut doc_allowed = allow_doc;
        loop {
            match rest.split_first() {
                Some((Value::String(_), tail)) if doc_allowed && !tail.is_empty() => {
                    doc_allowed = false;
                    rest = tail;
                }
                Some((form, tail)) if form.is_form(self.wk.declare) => {
                    decls.push(form.clone());
                    rest = tail;
                }
                _ => return (decls, rest),
            }
        }
    }

    fn parse_body<'v>(&mut self, forms: &'v [Value], allow_doc: bool) -> Result<(Declarations, &'v [Value]), ControlSignal> {
        let (forms_decl, rest) = self.split_declarations(forms, allow_doc);
        let mut decls = Declarations::default();
        for declaration in &forms_decl {
            let specs = declaration.as_list().unwrap_or(&[]);
            for spec in &specs[1..] {
                let parts = match spec {
                    Value::List(parts) => parts.clone(),
                    other => return Err(self.malformed(other, "bad declaration specifier")),
                };
                match parts[0].as_symbol() {
                    Some(s) if s == self.wk.special => {
                        for var in &parts[1..] {
                            let sym = self.symbol_arg(var, "a variable name")?;
                            decls.specials.push(sym);
                        }
                    }
                    Some(s) if s == self.wk.ignore || s == self.wk.ignorable => {}
                    _ => {
                        let name = self.show(&parts[0]);
                        return Err(self.fail(CompileError::UnknownDeclaration(name)));
                    }
                }
            }
        }
        Ok((decls, rest))
    }

    /// A body with its free SPECIAL declarations in effect.
    fn compile_declared_body(&mut self, decls: &Declarations, forms: &[Value]) -> Result<Fragment, ControlSignal> {
        let mark = self.scope.len();
        self.scope.extend(decls.specials.iter().map(|s| Binding::Special(*s)));
        let body = self.compile_body(forms);
        self.scope.truncate(mark);
        body
    }

    fn parse_lambda_list(&mut self, list: &Value) -> Result<ParsedLambdaList, ControlSignal> {
        let keywords = self.wk.lambda_keywords;
        let parsed = {
            let mut symbols = self.globals.symbols_mut();
            lambda_list::parse(list, &keywords, &mut symbols, false)
        };
        match parsed {
            Ok(parsed) => Ok(parsed),
            Err(error) => {
                let form = self.show(list);
                Err(self.fail(CompileError::LambdaList { error, form }))
            }
        }
    }

    // ------------------------------------------------------------------
    // Lambda
    // ------------------------------------------------------------------

    /// Makes the variable a parameter is stored in. Special parameters
    /// land in a temp and are rebound dynamically around the body.
    fn parameter(&mut self, sym: SymbolId, decls: &Declarations) -> (Ident, bool) {
        if self.is_special(sym, decls) {
            (self.fresh_temp(), true)
        } else {
            (self.fresh_binding(sym, Namespace::Variable), false)
        }
    }

    fn enter_parameter(&mut self, sym: SymbolId, id: Ident, special: bool, specials: &mut Vec<(SymbolId, Ident)>) {
        if special {
            self.scope.push(Binding::Special(sym));
            specials.push((sym, id));
        } else {
            self.scope.push(Binding::Variable { symbol: sym, ident: id });
        }
    }

    fn unsupplied_test(&self, id: Ident) -> Expr {
        self.global_call(self.wk.unsupplied_p, vec![Expr::Name(id)])
    }

    /// Statements giving an optional or keyword parameter its default.
    fn parameter_default(
        &mut self,
        id: Ident,
        init: Option<&Value>,
        supplied_p: Option<SymbolId>,
        decls: &Declarations,
        preamble: &mut Vec<Stmt>,
    ) -> Result<Option<(SymbolId, Ident, bool)>, ControlSignal> {
        let supplied = match supplied_p {
            Some(sp) => {
                let (sp_id, special) = self.parameter(sp, decls);
                preamble.push(Stmt::Assign {
                    target: sp_id,
                    value: Expr::IfExp {
                        test: Box::new(self.unsupplied_test(id)),
                        then: Box::new(Expr::nil()),
                        orelse: Box::new(Expr::Const(Value::Symbol(self.wk.t))),
                    },
                });
                Some((sp, sp_id, special))
            }
            None => None,
        };
        let init = match init {
            Some(form) => self.compile(form)?,
            None => Fragment::expr(Expr::nil()),
        };
        let mut body = init.prologue;
        body.push(Stmt::Assign { target: id, value: init.value });
        preamble.push(Stmt::If { test: self.unsupplied_test(id), body, orelse: Vec::new() });
        Ok(supplied)
    }

    fn compile_lambda(&mut self, list: &Value, body: &[Value], options: LambdaOptions) -> Result<Fragment, ControlSignal> {
        let parsed = self.parse_lambda_list(list)?;
        let (decls, body) = self.parse_body(body, true)?;
        let mark = self.scope.len();
        self.push_record();

        let mut params = Params::default();
        let mut preamble = Vec::new();
        let mut specials: Vec<(SymbolId, Ident)> = Vec::new();

        if options.next_method {
            let id = self.fresh_temp();
            params.required.push(id);
            self.scope.push(Binding::NextMethod(id));
        }
        for req in &parsed.req {
            let sym = self.symbol_arg(req, "a parameter name")?;
            let (id, special) = self.parameter(sym, &decls);
            params.required.push(id);
            self.enter_parameter(sym, id, special, &mut specials);
        }
        for opt in &parsed.opt {
            let (id, special) = self.parameter(opt.var, &decls);
            params.optional.push(id);
            let supplied = self.parameter_default(id, opt.init.as_ref(), opt.supplied_p, &decls, &mut preamble)?;
            self.enter_parameter(opt.var, id, special, &mut specials);
            if let Some((sp, sp_id, sp_special)) = supplied {
                self.enter_parameter(sp, sp_id, sp_special, &mut specials);
            }
        }
        if let Some(rest) = parsed.rest {
            let (id, special) = self.parameter(rest, &decls);
            params.rest = Some(id);
            self.enter_parameter(rest, id, special, &mut specials);
        }
        params.accepts_keys = parsed.key_present;
        params.allow_other_keys = parsed.allow_other_keys;
        for key in &parsed.key {
            let (id, special) = self.parameter(key.var, &decls);
            params.keys.push((key.keyword, id));
            let supplied = self.parameter_default(id, key.init.as_ref(), key.supplied_p, &decls, &mut preamble)?;
            self.enter_parameter(key.var, id, special, &mut specials);
            if let Some((sp, sp_id, sp_special)) = supplied {
                self.enter_parameter(sp, sp_id, sp_special, &mut specials);
            }
        }
        for (sym, init) in &parsed.aux {
            let (id, special) = self.parameter(*sym, &decls);
            let init = match init {
                Some(form) => self.compile(form)?,
                None => Fragment::expr(Expr::nil()),
            };
            preamble.extend(init.prologue);
            preamble.push(Stmt::Assign { target: id, value: init.value });
            self.enter_parameter(*sym, id, special, &mut specials);
        }

        let body = if specials.is_empty() {
            self.compile_lambda_body(&decls, body, options.block)?
        } else {
            self.push_record();
            let inner = self.compile_lambda_body(&decls, body, options.block)?;
            let record = self.pop_record();
            let thunk = self.procedure(record, Arc::new(Params::default()), inner, None);
            self.dynamic_call(&specials, thunk)
        };
        self.scope.truncate(mark);
        let record = self.pop_record();
        let params = Arc::new(params);

        preamble.extend(body.prologue);
        let body = Fragment { prologue: preamble, value: body.value };
        match options.global_name {
            Some(name) => {
                let stmts = self.close_procedure(record, &params, body.into_body());
                Ok(Fragment {
                    prologue: vec![Stmt::FunctionDef {
                        name: Ident::global_function(name),
                        label: options.label,
                        params,
                        body: Arc::new(stmts),
                    }],
                    value: Expr::Const(Value::Symbol(name)),
                })
            }
            None => Ok(self.procedure(record, params, body, options.label)),
        }
    }

    fn compile_lambda_body(
        &mut self,
        decls: &Declarations,
        forms: &[Value],
        block: Option<SymbolId>,
    ) -> Result<Fragment, ControlSignal> {
        match block {
            Some(name) => self.compile_block(name, &mut |c| c.compile_declared_body(decls, forms)),
            None => self.compile_declared_body(decls, forms),
        }
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// A BLOCK is a procedure taking its exit tag. When nothing in the
    /// body refers to the tag the block costs nothing.
    fn compile_block(
        &mut self,
        name: SymbolId,
        inner: &mut dyn FnMut(&mut Self) -> Result<Fragment, ControlSignal>,
    ) -> Result<Fragment, ControlSignal> {
        self.push_record();
        let tag = self.fresh_temp();
        let mark = self.scope.len();
        self.scope.push(Binding::Block { name, tag });
        let body = inner(self);
        self.scope.truncate(mark);
        let body = body?;
        let record = self.pop_record();

        if !analyze_fragment(&body.prologue, &body.value).free.contains(&tag) {
            self.absorb(record);
            return Ok(body);
        }
        let function = self.procedure(record, Arc::new(Params::simple(vec![tag])), body, None);
        Ok(Fragment {
            prologue: function.prologue,
            value: self.global_call(self.wk.block_fn, vec![function.value]),
        })
    }

    // ------------------------------------------------------------------
    // LET and friends
    // ------------------------------------------------------------------

    fn parse_bindings(&mut self, list: &Value) -> Result<Vec<(SymbolId, Option<Value>)>, ControlSignal> {
        let Some(items) = list.as_list() else {
            return Err(self.malformed(list, "expected a binding list"));
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Symbol(s) => out.push((*s, None)),
                Value::List(parts) if parts.len() <= 2 => {
                    let sym = self.symbol_arg(&parts[0], "a variable name")?;
                    out.push((sym, parts.get(1).cloned()));
                }
                other => return Err(self.malformed(other, "bad binding")),
            }
        }
        for (sym, _) in &out {
            if self.globals.symbols().is_constant(*sym) {
                let name = self.interp.symbol_name(*sym);
                return Err(self.interp.raise(crate::conditions::RuntimeError::ConstantAssignment(name)));
            }
        }
        Ok(out)
    }

    /// One LET: initial values are computed in the enclosing scope, then
    /// passed to a procedure whose parameters are the new variables.
    fn let_group(
        &mut self,
        bindings: &[(SymbolId, Option<Value>)],
        decls: &Declarations,
        inner: &mut dyn FnMut(&mut Self) -> Result<Fragment, ControlSignal>,
    ) -> Result<Fragment, ControlSignal> {
        let mut inits = Vec::with_capacity(bindings.len());
        for (_, init) in bindings {
            inits.push(match init {
                Some(form) => self.compile(form)?,
                None => Fragment::expr(Expr::nil()),
            });
        }
        let (mut prologue, args) = self.flatten(inits);

        let mark = self.scope.len();
        self.push_record();
        let mut params = Vec::with_capacity(bindings.len());
        let mut specials = Vec::new();
        for (sym, _) in bindings {
            let (id, special) = self.parameter(*sym, decls);
            params.push(id);
            self.enter_parameter(*sym, id, special, &mut specials);
        }
        let body = if specials.is_empty() {
            inner(self)
        } else {
            self.push_record();
            let body = inner(self);
            let record = self.pop_record();
            body.map(|b| {
                let thunk = self.procedure(record, Arc::new(Params::default()), b, None);
                self.dynamic_call(&specials, thunk)
            })
        };
        self.scope.truncate(mark);
        let body = body?;
        let record = self.pop_record();

        let call = self.procedure_call(record, Arc::new(Params::simple(params)), body, args);
        prologue.extend(call.prologue);
        Ok(Fragment { prologue, value: call.value })
    }

    /// Bindings are established in order, so each initializer sees the
    /// variables bound before it.
    fn compile_let(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((list, body)) = args.split_first() else {
            return Err(self.malformed(&Value::Symbol(self.wk.let_), "missing binding list"));
        };
        let bindings = self.parse_bindings(list)?;
        let (decls, body) = self.parse_body(body, false)?;
        if bindings.len() > 1 {
            self.let_star(&bindings, &decls, body)
        } else {
            self.let_group(&bindings, &decls, &mut |c| c.compile_declared_body(&decls, body))
        }
    }

    fn let_star(
        &mut self,
        bindings: &[(SymbolId, Option<Value>)],
        decls: &Declarations,
        body: &[Value],
    ) -> Result<Fragment, ControlSignal> {
        match bindings.split_first() {
            Some((first, rest)) if !rest.is_empty() => {
                self.let_group(std::slice::from_ref(first), decls, &mut |c| c.let_star(rest, decls, body))
            }
            _ => self.let_group(bindings, decls, &mut |c| c.compile_declared_body(decls, body)),
        }
    }

    // ------------------------------------------------------------------
    // Local functions
    // ------------------------------------------------------------------

    fn parse_function_bindings<'v>(
        &mut self,
        list: &'v Value,
    ) -> Result<Vec<(SymbolId, &'v Value, &'v [Value])>, ControlSignal> {
        let Some(items) = list.as_list() else {
            return Err(self.malformed(list, "expected function bindings"));
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::List(parts) if parts.len() >= 2 => {
                    let name = self.symbol_arg(&parts[0], "a function name")?;
                    out.push((name, &parts[1], &parts[2..]));
                }
                other => return Err(self.malformed(other, "bad function binding")),
            }
        }
        Ok(out)
    }

    fn local_function(&mut self, name: SymbolId, list: &Value, body: &[Value]) -> Result<Fragment, ControlSignal> {
        let label = self.interp.symbol_name(name);
        self.compile_lambda(
            list,
            body,
            LambdaOptions { block: Some(name), label: Some(label), ..LambdaOptions::default() },
        )
    }

    fn compile_flet(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((list, body)) = args.split_first() else {
            return Err(self.malformed(&Value::Symbol(self.wk.flet), "missing function bindings"));
        };
        let definitions = self.parse_function_bindings(list)?;
        let mut functions = Vec::with_capacity(definitions.len());
        for (name, list, fbody) in &definitions {
            functions.push(self.local_function(*name, list, fbody)?);
        }
        let (mut prologue, values) = self.flatten(functions);
        let (decls, body) = self.parse_body(body, false)?;

        let mark = self.scope.len();
        self.push_record();
        let mut params = Vec::with_capacity(definitions.len());
        for (name, _, _) in &definitions {
            let id = self.fresh_binding(*name, Namespace::Function);
            params.push(id);
            self.scope.push(Binding::Function { symbol: *name, ident: id });
        }
        let body = self.compile_declared_body(&decls, body);
        self.scope.truncate(mark);
        let body = body?;
        let record = self.pop_record();

        let call = self.procedure_call(record, Arc::new(Params::simple(params)), body, values);
        prologue.extend(call.prologue);
        Ok(Fragment { prologue, value: call.value })
    }

    fn compile_labels(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((list, body)) = args.split_first() else {
            return Err(self.malformed(&Value::Symbol(self.wk.labels), "missing function bindings"));
        };
        let definitions = self.parse_function_bindings(list)?;
        let mark = self.scope.len();
        let mut idents = Vec::with_capacity(definitions.len());
        for (name, _, _) in &definitions {
            let id = self.fresh_binding(*name, Namespace::Function);
            idents.push(id);
            self.scope.push(Binding::Function { symbol: *name, ident: id });
        }
        let result = (|| {
            let mut prologue = Vec::new();
            for ((name, list, fbody), id) in definitions.iter().zip(&idents) {
                let function = self.local_function(*name, list, fbody)?;
                prologue.extend(function.prologue);
                prologue.push(Stmt::Assign { target: *id, value: function.value });
            }
            let (decls, body) = self.parse_body(body, false)?;
            let body = self.compile_declared_body(&decls, body)?;
            prologue.extend(body.prologue);
            Ok(Fragment { prologue, value: body.value })
        })();
        self.scope.truncate(mark);
        result
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    fn variable_target(&mut self, sym: SymbolId) -> Result<Ident, ControlSignal> {
        if let Some(id) = self.lookup_variable(sym) {
            return Ok(id);
        }
        if self.globals.symbols().is_constant(sym) {
            let name = self.interp.symbol_name(sym);
            return Err(self.interp.raise(crate::conditions::RuntimeError::ConstantAssignment(name)));
        }
        Ok(Ident::global_variable(sym))
    }

    fn compile_setq(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        if args.len() % 2 != 0 {
            return Err(self.malformed(&Value::Symbol(self.wk.setq), "odd number of arguments"));
        }
        let mut prologue = Vec::new();
        let mut value = Expr::nil();
        for pair in args.chunks(2) {
            let sym = match &pair[0] {
                Value::Symbol(s) => *s,
                other => return Err(self.malformed(other, "not a variable")),
            };
            let target = self.variable_target(sym)?;
            let fragment = self.compile(&pair[1])?;
            prologue.extend(fragment.prologue);
            prologue.push(Stmt::Assign { target, value: fragment.value });
            value = Expr::Name(target);
        }
        Ok(Fragment { prologue, value })
    }

    fn compile_setf(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        if args.len() % 2 != 0 {
            return Err(self.malformed(&Value::Symbol(self.wk.setf), "odd number of arguments"));
        }
        let mut prologue = Vec::new();
        let mut value = Expr::nil();
        for pair in args.chunks(2) {
            let fragment = self.compile_place_assignment(&pair[0], &pair[1])?;
            prologue.extend(fragment.prologue);
            value = fragment.value;
        }
        Ok(Fragment { prologue, value })
    }

    fn compile_place_assignment(&mut self, place: &Value, new_value: &Value) -> Result<Fragment, ControlSignal> {
        let items = match place {
            Value::Symbol(_) => return self.compile_setq(&[place.clone(), new_value.clone()]),
            Value::List(items) => items.clone(),
            other => return Err(self.malformed(other, "not a place")),
        };
        let Some(head) = items[0].as_symbol() else {
            return Err(self.malformed(place, "not a place"));
        };
        let mut form = Vec::with_capacity(items.len() + 2);
        if head == self.wk.slot_value {
            form.push(Value::Symbol(self.wk.set_slot_value));
            form.extend(items[1..].iter().cloned());
        } else if head == self.wk.symbol_value {
            form.push(Value::Symbol(self.wk.set));
            form.extend(items[1..].iter().cloned());
        } else if let Some(expansion) = self.expand(place, head, &items[1..])? {
            return self.compile_place_assignment(&expansion, new_value);
        } else {
            form.push(Value::Symbol(self.wk.setf_accessor));
            form.push(self.quoted(Value::Symbol(head)));
            form.extend(items[1..].iter().cloned());
        }
        form.push(new_value.clone());
        self.compile(&Value::list(form))
    }

    fn compile_defvar(&mut self, args: &[Value], always: bool) -> Result<Fragment, ControlSignal> {
        let head = if always { self.wk.defparameter } else { self.wk.defvar };
        let (sym, init) = match args {
            [Value::Symbol(s)] if !always => (*s, None),
            [Value::Symbol(s), init, ..] if args.len() <= 3 => (*s, Some(init)),
            _ => return Err(self.malformed(&Value::Symbol(head), "expected a name and a value")),
        };
        self.globals.proclaim_special(sym);
        let Some(init) = init else {
            return Ok(Fragment::expr(Expr::Const(Value::Symbol(sym))));
        };
        let fragment = self.compile(init)?;
        let mut assign = fragment.prologue;
        assign.push(Stmt::Expr(self.global_call(
            self.wk.set_global,
            vec![Expr::Const(Value::Symbol(sym)), fragment.value],
        )));
        let prologue = if always {
            assign
        } else {
            vec![Stmt::If {
                test: self.global_call(self.wk.global_unbound_p, vec![Expr::Const(Value::Symbol(sym))]),
                body: assign,
                orelse: Vec::new(),
            }]
        };
        Ok(Fragment { prologue, value: Expr::Const(Value::Symbol(sym)) })
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    fn compile_def(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let [name, list, body @ ..] = args else {
            return Err(self.malformed(&Value::Symbol(self.wk.def), "expected a name and a lambda list"));
        };
        let name = match name {
            Value::Symbol(s) => *s,
            other => return Err(self.malformed(other, "expected a function name")),
        };
        let mut whole = vec![Value::Symbol(self.wk.def)];
        whole.extend(args.iter().cloned());
        let uses = free_functions(self.globals, &Value::list(whole));
        self.globals.record_dependencies(name, uses);

        let label = self.interp.symbol_name(name);
        self.fixpoint(&mut |c| {
            c.compile_lambda(
                list,
                body,
                LambdaOptions {
                    block: Some(name),
                    label: Some(label.clone()),
                    global_name: Some(name),
                    next_method: false,
                },
            )
        })
    }

    /// The expander of a DEFMACRO as a LAMBDA form. Nested patterns are
    /// taken apart from a single &REST list.
    fn macro_lambda(&mut self, name: SymbolId, list: &Value, body: &[Value]) -> Result<Value, ControlSignal> {
        let keywords = self.wk.lambda_keywords;
        let parsed = {
            let mut symbols = self.globals.symbols_mut();
            lambda_list::parse(list, &keywords, &mut symbols, true)
        };
        let parsed = match parsed {
            Ok(p) => p,
            Err(error) => {
                let form = self.show(list);
                return Err(self.fail(CompileError::LambdaList { error, form }));
            }
        };
        let (decls, forms) = self.split_declarations(body, true);
        let mut block = vec![Value::Symbol(self.wk.block), Value::Symbol(name)];
        block.extend(forms.iter().cloned());
        let block = Value::list(block);

        let nested = parsed.req.iter().any(|r| matches!(r, Value::List(_)));
        if !nested {
            let mut lambda = vec![Value::Symbol(self.wk.lambda), plain_macro_list(list, &keywords)];
            lambda.extend(decls);
            lambda.push(block);
            return Ok(Value::list(lambda));
        }

        let args = Value::Symbol(self.wk.macro_args);
        let mut bindings = Vec::new();
        self.destructure(&parsed, &args, &mut bindings)?;
        let mut let_form = vec![Value::Symbol(self.wk.let_star), Value::list(bindings)];
        let_form.extend(decls);
        let_form.push(block);
        Ok(Value::list(vec![
            Value::Symbol(self.wk.lambda),
            Value::list(vec![Value::Symbol(keywords.rest), args]),
            Value::list(let_form),
        ]))
    }

    fn destructure(&mut self, parsed: &ParsedLambdaList, source: &Value, bindings: &mut Vec<Value>) -> Result<(), ControlSignal> {
        let wk = self.wk;
        let call = |f: SymbolId, args: Vec<Value>| {
            let mut form = vec![Value::Symbol(f)];
            form.extend(args);
            Value::list(form)
        };
        let binding = |var: SymbolId, init: Value| Value::list(vec![Value::Symbol(var), init]);

        for (i, pattern) in parsed.req.iter().enumerate() {
            let access = call(wk.nth, vec![Value::Integer(i as i64), source.clone()]);
            match pattern {
                Value::Symbol(var) => bindings.push(binding(*var, access)),
                Value::List(_) => {
                    let keywords = wk.lambda_keywords;
                    let (inner, temp) = {
                        let mut symbols = self.globals.symbols_mut();
                        let temp = symbols.gensym("ARG");
                        (lambda_list::parse(pattern, &keywords, &mut symbols, true), temp)
                    };
                    let inner = match inner {
                        Ok(p) => p,
                        Err(error) => {
                            let form = self.show(pattern);
                            return Err(self.fail(CompileError::LambdaList { error, form }));
                        }
                    };
                    bindings.push(binding(temp, access));
                    self.destructure(&inner, &Value::Symbol(temp), bindings)?;
                }
                other => return Err(self.malformed(other, "bad pattern")),
            }
        }
        let required = parsed.req.len();
        for (j, opt) in parsed.opt.iter().enumerate() {
            let index = Value::Integer((required + j) as i64);
            let present = call(wk.nthcdr, vec![index.clone(), source.clone()]);
            let value = call(
                wk.if_,
                vec![
                    present.clone(),
                    call(wk.nth, vec![index, source.clone()]),
                    opt.init.clone().unwrap_or(Value::Nil),
                ],
            );
            bindings.push(binding(opt.var, value));
            if let Some(sp) = opt.supplied_p {
                bindings.push(binding(sp, call(wk.if_, vec![present, Value::Symbol(wk.t), Value::Nil])));
            }
        }
        let tail = call(wk.nthcdr, vec![Value::Integer((required + parsed.opt.len()) as i64), source.clone()]);
        if let Some(rest) = parsed.rest {
            bindings.push(binding(rest, tail.clone()));
        }
        for key in &parsed.key {
            let keyword = Value::Symbol(key.keyword);
            let has = call(wk.plist_has, vec![tail.clone(), keyword.clone()]);
            let value = call(
                wk.if_,
                vec![has.clone(), call(wk.getf_fn, vec![tail.clone(), keyword]), key.init.clone().unwrap_or(Value::Nil)],
            );
            bindings.push(binding(key.var, value));
            if let Some(sp) = key.supplied_p {
                bindings.push(binding(sp, has));
            }
        }
        for (var, init) in &parsed.aux {
            bindings.push(binding(*var, init.clone().unwrap_or(Value::Nil)));
        }
        Ok(())
    }

    fn compile_defmacro(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let [name, list, body @ ..] = args else {
            return Err(self.malformed(&Value::Symbol(self.wk.defmacro), "expected a name and a lambda list"));
        };
        let name = match name {
            Value::Symbol(s) => *s,
            other => return Err(self.malformed(other, "expected a macro name")),
        };
        let lambda = self.macro_lambda(name, list, body)?;
        let expander = self.interp.eval_form(&lambda)?;
        self.globals.define_macro(name, expander);
        log::debug!("defined macro {}", self.interp.symbol_name(name));
        Ok(Fragment::expr(Expr::Const(Value::Symbol(name))))
    }

    // ------------------------------------------------------------------
    // Quasiquote
    // ------------------------------------------------------------------

    fn quasi(&mut self, x: &Value, depth: usize) -> Result<Value, ControlSignal> {
        let wk = self.wk;
        let list_of = |head: SymbolId, items: Vec<Value>| {
            let mut form = vec![Value::Symbol(head)];
            form.extend(items);
            Value::list(form)
        };
        match x {
            Value::List(items) => {
                let head = items[0].as_symbol();
                if items.len() == 2 && (head == Some(wk.unquote) || head == Some(wk.unquote_splicing)) {
                    if depth == 1 && head == Some(wk.unquote) {
                        return Ok(items[1].clone());
                    }
                    if depth > 1 {
                        let inner = self.quasi(&items[1], depth - 1)?;
                        return Ok(list_of(wk.list, vec![self.quoted(items[0].clone()), inner]));
                    }
                    return Err(self.malformed(x, ",@ outside a list"));
                }
                if items.len() == 2 && head == Some(wk.quasiquote) {
                    let inner = self.quasi(&items[1], depth + 1)?;
                    return Ok(list_of(wk.list, vec![self.quoted(items[0].clone()), inner]));
                }
                let mut segments = Vec::new();
                let mut current = Vec::new();
                for item in items.iter() {
                    let splice = depth == 1 && item.is_form(wk.unquote_splicing) && item.as_list().map(|l| l.len()) == Some(2);
                    if splice {
                        if !current.is_empty() {
                            segments.push(list_of(wk.list, std::mem::take(&mut current)));
                        }
                        segments.push(item.as_list().map(|l| l[1].clone()).unwrap_or(Value::Nil));
                    } else {
                        current.push(self.quasi(item, depth)?);
                    }
                }
                if !current.is_empty() {
                    segments.push(list_of(wk.list, current));
                }
                Ok(if segments.len() == 1 {
                    segments.pop().unwrap_or(Value::Nil)
                } else {
                    list_of(wk.append, segments)
                })
            }
            Value::Vector(items) => {
                let as_list = self.quasi(&Value::list(items.to_vec()), depth)?;
                let function = Value::list(vec![Value::Symbol(wk.function), Value::Symbol(wk.vector)]);
                Ok(list_of(wk.apply, vec![function, as_list]))
            }
            Value::Symbol(_) => Ok(self.quoted(x.clone())),
            other => Ok(other.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    fn compile_while(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((test, body)) = args.split_first() else {
            return Err(self.malformed(&Value::Symbol(self.wk.while_), "missing test"));
        };
        let nil = self.wk.nil;
        self.compile_block(nil, &mut |c| {
            c.push_record();
            let test = c.compile(test)?;
            let record = c.pop_record();
            let (mut prologue, test) = if test.is_expression() {
                c.absorb(record);
                (Vec::new(), test.value)
            } else {
                let thunk = c.procedure(record, Arc::new(Params::default()), test, None);
                (thunk.prologue, Expr::call(thunk.value, Vec::new()))
            };
            let body = c.compile_discarded_body(body)?;
            prologue.push(Stmt::While { test, body, orelse: Vec::new() });
            Ok(Fragment { prologue, value: Expr::nil() })
        })
    }

    fn compile_dolist(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let spec = match args.first().and_then(|s| s.as_list()) {
            Some(spec) if (2..=3).contains(&spec.len()) => spec.to_vec(),
            _ => return Err(self.malformed(&Value::Symbol(self.wk.dolist), "expected (var list [result])")),
        };
        let var = self.symbol_arg(&spec[0], "a variable name")?;
        let body = &args[1..];
        let nil = self.wk.nil;
        self.compile_block(nil, &mut |c| {
            let list = c.compile(&spec[1])?;
            let (decls, body) = c.parse_body(body, false)?;
            let mark = c.scope.len();
            let target = if c.is_special(var, &decls) {
                Ident::global_variable(var)
            } else {
                let id = c.fresh_binding(var, Namespace::Variable);
                c.scope.push(Binding::Variable { symbol: var, ident: id });
                id
            };
            let result = (|| {
                let stmts = c.compile_declared_body_stmts(&decls, body)?;
                let mut prologue = list.prologue.clone();
                prologue.push(Stmt::For { target, iter: list.value.clone(), body: stmts, orelse: Vec::new() });
                let value = match spec.get(2) {
                    Some(result) => {
                        prologue.push(Stmt::Assign { target, value: Expr::nil() });
                        let result = c.compile(result)?;
                        prologue.extend(result.prologue);
                        result.value
                    }
                    None => Expr::nil(),
                };
                Ok(Fragment { prologue, value })
            })();
            c.scope.truncate(mark);
            result
        })
    }

    fn compile_declared_body_stmts(&mut self, decls: &Declarations, forms: &[Value]) -> Result<Vec<Stmt>, ControlSignal> {
        let mark = self.scope.len();
        self.scope.extend(decls.specials.iter().map(|s| Binding::Special(*s)));
        let stmts = self.compile_discarded_body(forms);
        self.scope.truncate(mark);
        stmts
    }

    /// A part of a COLLECT evaluated once per element. Parts that need
    /// statements become procedures of the loop variables so far.
    fn comprehension_part(&mut self, form: &Value, targets: &[Ident], hoisted: &mut Vec<Stmt>) -> Result<Expr, ControlSignal> {
        self.push_record();
        for t in targets {
            self.own(*t);
        }
        let fragment = self.compile(form)?;
        let record = self.pop_record();
        if fragment.is_expression() {
            self.absorb(record);
            return Ok(fragment.value);
        }
        let params = Arc::new(Params::simple(targets.to_vec()));
        let function = self.procedure(record, params, fragment, None);
        hoisted.extend(function.prologue);
        Ok(Expr::call(function.value, targets.iter().map(|t| Expr::Name(*t)).collect()))
    }

    fn compile_collect(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((element, clauses)) = args.split_first() else {
            return Err(self.malformed(&Value::Symbol(self.wk.collect), "missing element form"));
        };
        if clauses.is_empty() {
            return Err(self.malformed(&Value::Symbol(self.wk.collect), "expected at least one (var sequence) clause"));
        }
        let mark = self.scope.len();
        let result = (|| {
            let mut prologue = Vec::new();
            let mut generators = Vec::with_capacity(clauses.len());
            let mut targets: Vec<Ident> = Vec::new();
            for (i, clause) in clauses.iter().enumerate() {
                let parts = match clause.as_list() {
                    Some(parts) if parts.len() >= 2 && parts.len() % 2 == 0 => parts.to_vec(),
                    _ => return Err(self.malformed(clause, "expected (var sequence [:when test]...)")),
                };
                let var = self.symbol_arg(&parts[0], "a variable name")?;
                let iter = if i == 0 {
                    let first = self.compile(&parts[1])?;
                    prologue.extend(first.prologue);
                    first.value
                } else {
                    self.comprehension_part(&parts[1], &targets, &mut prologue)?
                };
                let target = self.fresh_binding(var, Namespace::Variable);
                self.scope.push(Binding::Variable { symbol: var, ident: target });
                targets.push(target);
                let mut conditions = Vec::new();
                for option in parts[2..].chunks(2) {
                    if option[0].as_symbol() != Some(self.wk.when_keyword) {
                        return Err(self.malformed(&option[0], "expected :when"));
                    }
                    conditions.push(self.comprehension_part(&option[1], &targets, &mut prologue)?);
                }
                generators.push(Comprehension { target, iter, conditions });
            }
            let element = self.comprehension_part(element, &targets, &mut prologue)?;
            Ok(Fragment {
                prologue,
                value: Expr::ListComp { element: Box::new(element), generators },
            })
        })();
        self.scope.truncate(mark);
        result
    }

    // ------------------------------------------------------------------
    // Conditions
    // ------------------------------------------------------------------

    fn compile_handler_case(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((form, clauses)) = args.split_first() else {
            return Err(self.malformed(&Value::Symbol(self.wk.handler_case), "missing form"));
        };
        let mut types = Vec::new();
        let mut functions = Vec::new();
        let mut no_error = Fragment::expr(Expr::nil());
        for clause in clauses {
            let parts = match clause.as_list() {
                Some(parts) if parts.len() >= 2 => parts.to_vec(),
                _ => return Err(self.malformed(clause, "expected (type (var) body...)")),
            };
            if parts[0].as_symbol() == Some(self.wk.no_error) {
                no_error = self.compile_lambda(&parts[1], &parts[2..], LambdaOptions::default())?;
                continue;
            }
            let class = self.symbol_arg(&parts[0], "a condition type")?;
            let list = match parts[1].as_list() {
                Some([]) => Value::list(vec![Value::Symbol(self.wk.ignored)]),
                Some([_]) => parts[1].clone(),
                _ => return Err(self.malformed(&parts[1], "expected at most one variable")),
            };
            functions.push(self.compile_lambda(&list, &parts[2..], LambdaOptions::default())?);
            types.push(Value::Symbol(class));
        }
        let thunk = self.compile_thunk(std::slice::from_ref(form))?;
        let mut fragments = vec![Fragment::expr(Expr::Const(Value::list(types))), thunk, no_error];
        fragments.extend(functions);
        Ok(self.call_internal(self.wk.handler_case_fn, fragments))
    }

    fn compile_handler_bind(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((bindings, body)) = args.split_first() else {
            return Err(self.malformed(&Value::Symbol(self.wk.handler_bind), "missing bindings"));
        };
        let Some(bindings) = bindings.as_list() else {
            return Err(self.malformed(bindings, "expected ((type handler)...)"));
        };
        let mut types = Vec::new();
        let mut handlers = Vec::new();
        for binding in bindings {
            match binding.as_list() {
                Some([class, handler]) => {
                    let class = self.symbol_arg(class, "a condition type")?;
                    types.push(Value::Symbol(class));
                    handlers.push(self.compile(handler)?);
                }
                _ => return Err(self.malformed(binding, "expected (type handler)")),
            }
        }
        let thunk = self.compile_thunk(body)?;
        let mut fragments = vec![Fragment::expr(Expr::Const(Value::list(types))), thunk];
        fragments.extend(handlers);
        Ok(self.call_internal(self.wk.handler_bind_fn, fragments))
    }

    fn compile_restart_case(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((form, clauses)) = args.split_first() else {
            return Err(self.malformed(&Value::Symbol(self.wk.restart_case), "missing form"));
        };
        let mut specs = Vec::new();
        let mut parts_out = Vec::new();
        for clause in clauses {
            let parts = match clause.as_list() {
                Some(parts) if parts.len() >= 2 => parts.to_vec(),
                _ => return Err(self.malformed(clause, "expected (name lambda-list body...)")),
            };
            let name = match &parts[0] {
                Value::Nil => Value::Nil,
                Value::Symbol(s) => Value::Symbol(*s),
                other => return Err(self.malformed(other, "expected a restart name")),
            };
            let mut report = Value::Nil;
            let mut interactive = Fragment::expr(Expr::nil());
            let mut rest = &parts[2..];
            loop {
                match rest {
                    [Value::Symbol(k), v, tail @ ..] if *k == self.wk.report => {
                        if !matches!(v, Value::String(_)) {
                            return Err(self.malformed(v, ":report takes a string"));
                        }
                        report = v.clone();
                        rest = tail;
                    }
                    [Value::Symbol(k), v, tail @ ..] if *k == self.wk.interactive => {
                        interactive = self.compile(v)?;
                        rest = tail;
                    }
                    _ => break,
                }
            }
            specs.push(Value::list(vec![name, report]));
            let function = self.compile_lambda(&parts[1], rest, LambdaOptions::default())?;
            parts_out.push(interactive);
            parts_out.push(function);
        }
        let thunk = self.compile_thunk(std::slice::from_ref(form))?;
        let mut fragments = vec![Fragment::expr(Expr::Const(Value::list(specs))), thunk];
        fragments.extend(parts_out);
        Ok(self.call_internal(self.wk.restart_case_fn, fragments))
    }

    fn compile_restart_bind(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((bindings, body)) = args.split_first() else {
            return Err(self.malformed(&Value::Symbol(self.wk.restart_bind), "missing bindings"));
        };
        let Some(bindings) = bindings.as_list() else {
            return Err(self.malformed(bindings, "expected ((name function)...)"));
        };
        let mut names = Vec::new();
        let mut parts_out = Vec::new();
        for binding in bindings {
            let parts = match binding.as_list() {
                Some(parts) if parts.len() >= 2 && parts.len() % 2 == 0 => parts.to_vec(),
                _ => return Err(self.malformed(binding, "expected (name function [option value]...)")),
            };
            names.push(match &parts[0] {
                Value::Symbol(s) => Value::Symbol(*s),
                _ => Value::Nil,
            });
            let function = self.compile(&parts[1])?;
            let mut report = Fragment::expr(Expr::nil());
            let mut interactive = Fragment::expr(Expr::nil());
            for option in parts[2..].chunks(2) {
                match option[0].as_symbol() {
                    Some(k) if k == self.wk.report_function => report = self.compile(&option[1])?,
                    Some(k) if k == self.wk.interactive_function => interactive = self.compile(&option[1])?,
                    _ => return Err(self.malformed(&option[0], "unknown restart option")),
                }
            }
            parts_out.extend([function, report, interactive]);
        }
        let thunk = self.compile_thunk(body)?;
        let mut fragments = vec![Fragment::expr(Expr::Const(Value::list(names))), thunk];
        fragments.extend(parts_out);
        Ok(self.call_internal(self.wk.restart_bind_fn, fragments))
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    fn compile_defgeneric(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let [name, list, options @ ..] = args else {
            return Err(self.malformed(&Value::Symbol(self.wk.defgeneric), "expected a name and a lambda list"));
        };
        let name = self.symbol_arg(name, "a generic function name")?;
        let mut precedence = Value::Nil;
        let mut combination = Value::Nil;
        let mut methods = Vec::new();
        for option in options {
            let parts = match option.as_list() {
                Some(parts) if !parts.is_empty() => parts.to_vec(),
                _ => return Err(self.malformed(option, "bad option")),
            };
            match parts[0].as_symbol() {
                Some(k) if k == self.wk.argument_precedence_order => precedence = Value::list(parts[1..].to_vec()),
                Some(k) if k == self.wk.method_combination && parts.len() == 2 => combination = parts[1].clone(),
                Some(k) if k == self.wk.method_keyword => {
                    let mut form = vec![Value::Symbol(self.wk.defmethod), Value::Symbol(name)];
                    form.extend(parts[1..].iter().cloned());
                    methods.push(Value::list(form));
                }
                Some(k) if k == self.wk.documentation || k == self.wk.declare => {}
                _ => return Err(self.malformed(option, "unknown defgeneric option")),
            }
        }
        let mut prologue = vec![Stmt::Expr(self.global_call(
            self.wk.defgeneric_fn,
            vec![
                Expr::Const(Value::Symbol(name)),
                Expr::Const(list.clone()),
                Expr::Const(precedence),
                Expr::Const(combination),
            ],
        ))];
        for method in &methods {
            prologue.extend(self.compile_discard(method)?);
        }
        Ok(Fragment { prologue, value: Expr::Const(Value::Symbol(name)) })
    }

    fn compile_defmethod(&mut self, args: &[Value]) -> Result<Fragment, ControlSignal> {
        let Some((name, rest)) = args.split_first() else {
            return Err(self.malformed(&Value::Symbol(self.wk.defmethod), "missing name"));
        };
        let name = self.symbol_arg(name, "a generic function name")?;
        let qualifiers: Vec<Value> = rest.iter().take_while(|v| matches!(v, Value::Symbol(_))).cloned().collect();
        let Some(list) = rest.get(qualifiers.len()) else {
            return Err(self.malformed(&Value::Symbol(self.wk.defmethod), "missing lambda list"));
        };
        let body = &rest[qualifiers.len() + 1..];

        let keywords = self.wk.lambda_keywords;
        let split = {
            let mut symbols = self.globals.symbols_mut();
            lambda_list::parse_specialized(list, &keywords, &mut symbols)
        };
        let specializers = match split {
            Ok((_, specializers)) => specializers,
            Err(error) => {
                let form = self.show(list);
                return Err(self.fail(CompileError::LambdaList { error, form }));
            }
        };
        let plain = plain_specialized_list(list, &keywords);

        let mut spec_forms = vec![Value::Symbol(self.wk.list)];
        for spec in &specializers {
            spec_forms.push(match spec {
                Value::Nil => Value::Nil,
                Value::Symbol(_) => self.quoted(spec.clone()),
                Value::List(parts) if parts.len() == 2 && parts[0].as_symbol() == Some(self.wk.eql) => {
                    Value::list(vec![Value::Symbol(self.wk.list), self.quoted(parts[0].clone()), parts[1].clone()])
                }
                Value::List(parts) if parts.len() == 2 && parts[0].as_symbol() == Some(self.wk.exact) => {
                    self.quoted(spec.clone())
                }
                other => return Err(self.malformed(other, "bad specializer")),
            });
        }
        let specs = self.compile(&Value::list(spec_forms))?;
        let label = format!("(METHOD {})", self.interp.symbol_name(name));
        let function = self.compile_lambda(
            &plain,
            body,
            LambdaOptions { block: Some(name), label: Some(label), next_method: true, global_name: None },
        )?;
        let fragments = vec![
            Fragment::expr(Expr::Const(Value::Symbol(name))),
            Fragment::expr(Expr::Const(Value::list(qualifiers))),
            specs,
            Fragment::expr(Expr::Const(plain)),
            function,
        ];
        Ok(self.call_internal(self.wk.defmethod_fn, fragments))
    }

    /// `(list 'name 'initarg initfunction 'readers 'accessors 'writers)`
    fn slot_descriptor(&mut self, spec: &Value) -> Result<Value, ControlSignal> {
        let (name, options) = match spec {
            Value::Symbol(s) => (*s, Vec::new()),
            Value::List(parts) => (self.symbol_arg(&parts[0], "a slot name")?, parts[1..].to_vec()),
            other => return Err(self.malformed(other, "bad slot specifier")),
        };
        if options.len() % 2 != 0 {
            return Err(self.malformed(spec, "odd slot options"));
        }
        let mut initarg = Value::Nil;
        let mut initfunction = Value::Nil;
        let mut readers = Vec::new();
        let mut accessors = Vec::new();
        let mut writers = Vec::new();
        for option in options.chunks(2) {
            let (key, value) = (&option[0], &option[1]);
            match key.as_symbol() {
                Some(k) if k == self.wk.initarg => initarg = value.clone(),
                Some(k) if k == self.wk.initform => {
                    initfunction = Value::list(vec![Value::Symbol(self.wk.lambda), Value::Nil, value.clone()]);
                }
                Some(k) if k == self.wk.reader => readers.push(value.clone()),
                Some(k) if k == self.wk.accessor => accessors.push(value.clone()),
                Some(k) if k == self.wk.writer => match value {
                    Value::List(parts) if parts.len() == 2 && parts[0].as_symbol() == Some(self.wk.setf) => {
                        accessors.push(Value::list(vec![Value::Symbol(self.wk.setf), parts[1].clone()]));
                    }
                    _ => writers.push(value.clone()),
                },
                _ => {}
            }
        }
        Ok(Value::list(vec![
            Value::Symbol(self.wk.list),
            self.quoted(Value::Symbol(name)),
            self.quoted(initarg),
            initfunction,
            self.quoted(Value::list(readers)),
            self.quoted(Value::list(accessors)),
            self.quoted(Value::list(writers)),
        ]))
    }

    fn compile_class_definition(&mut self, args: &[Value], condition: bool) -> Result<Fragment, ControlSignal> {
        let head = if condition { self.wk.define_condition } else { self.wk.defclass };
        let [name, supers, slots, options @ ..] = args else {
            return Err(self.malformed(&Value::Symbol(head), "expected a name, superclasses and slots"));
        };
        let name = self.symbol_arg(name, "a class name")?;
        let Some(slots) = slots.as_list() else {
            return Err(self.malformed(slots, "expected a slot list"));
        };
        let mut descriptors = vec![Value::Symbol(self.wk.list)];
        for slot in slots {
            descriptors.push(self.slot_descriptor(slot)?);
        }
        let mut report = Value::Nil;
        for option in options {
            match option.as_list() {
                Some([k, v]) if k.as_symbol() == Some(self.wk.report) => {
                    if !matches!(v, Value::String(_)) {
                        return Err(self.malformed(v, ":report takes a string"));
                    }
                    report = v.clone();
                }
                Some([k, ..]) if k.is_form(self.wk.report) || k.as_symbol().is_some() => {}
                _ => return Err(self.malformed(option, "bad class option")),
            }
        }
        let function = if condition { self.wk.define_condition_fn } else { self.wk.defclass_fn };
        let form = Value::list(vec![
            Value::Symbol(function),
            self.quoted(Value::Symbol(name)),
            self.quoted(supers.clone()),
            Value::list(descriptors),
            report,
        ]);
        self.compile(&form)
    }
}

/// A specialized lambda list with the specializers dropped.
fn plain_specialized_list(list: &Value, keywords: &lambda_list::LambdaListKeywords) -> Value {
    let items = list.as_list().unwrap_or(&[]);
    let mut required = true;
    let mut plain = Vec::with_capacity(items.len());
    for item in items {
        if let Some(s) = item.as_symbol() {
            if [keywords.optional, keywords.rest, keywords.body, keywords.key, keywords.aux, keywords.allow_other_keys]
                .contains(&s)
            {
                required = false;
            }
        }
        match item {
            Value::List(parts) if required => plain.push(parts[0].clone()),
            _ => plain.push(item.clone()),
        }
    }
    Value::list(plain)
}

/// A macro lambda list as an ordinary one: &BODY becomes &REST.
fn plain_macro_list(list: &Value, keywords: &lambda_list::LambdaListKeywords) -> Value {
    let items = list.as_list().unwrap_or(&[]);
    Value::list(
        items
            .iter()
            .map(|item| match item {
                Value::Symbol(s) if *s == keywords.body => Value::Symbol(keywords.rest),
                other => other.clone(),
            })
            .collect(),
    )
}

// ----------------------------------------------------------------------
// Special forms
// ----------------------------------------------------------------------

fn compile_quote(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    match args {
        [x] => Ok(Fragment::expr(Expr::Const(x.clone()))),
        _ => Err(c.malformed(&Value::Symbol(c.wk.quote), "expected one argument")),
    }
}

fn compile_function(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    match args {
        [Value::Symbol(sym)] => Ok(Fragment::expr(Expr::Name(
            c.lookup_function(*sym).unwrap_or_else(|| Ident::global_function(*sym)),
        ))),
        [lambda] if lambda.is_form(c.wk.lambda) => c.compile(lambda),
        _ => Err(c.malformed(&Value::Symbol(c.wk.function), "expected a function name or lambda")),
    }
}

fn compile_lambda_form(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    let Some((list, body)) = args.split_first() else {
        return Err(c.malformed(&Value::Symbol(c.wk.lambda), "missing lambda list"));
    };
    c.compile_lambda(list, body, LambdaOptions::default())
}

fn compile_if(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    if !(2..=3).contains(&args.len()) {
        return Err(c.malformed(&Value::Symbol(c.wk.if_), "expected a test, a consequent and an optional alternative"));
    }
    let test = c.compile(&args[0])?;
    let then = c.compile_branch(&args[1])?;
    let orelse = match args.get(2) {
        Some(form) => c.compile_branch(form)?,
        None => Fragment::expr(Expr::nil()),
    };
    let mut prologue = test.prologue;
    prologue.extend(then.prologue);
    prologue.extend(orelse.prologue);
    Ok(Fragment {
        prologue,
        value: Expr::IfExp {
            test: Box::new(test.value),
            then: Box::new(then.value),
            orelse: Box::new(orelse.value),
        },
    })
}

fn compile_block_form(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    let Some((name, body)) = args.split_first() else {
        return Err(c.malformed(&Value::Symbol(c.wk.block), "missing block name"));
    };
    let name = c.symbol_arg(name, "a block name")?;
    c.compile_block(name, &mut |c| c.compile_body(body))
}

fn compile_return_from(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    let (name, value) = match args {
        [name] => (name, None),
        [name, value] => (name, Some(value)),
        _ => return Err(c.malformed(&Value::Symbol(c.wk.return_from), "expected a block name and a value")),
    };
    let sym = c.symbol_arg(name, "a block name")?;
    let Some(tag) = c.lookup_block(sym) else {
        let name = c.show(name);
        return Err(c.fail(CompileError::UnknownBlock(name)));
    };
    let value = match value {
        Some(form) => c.compile(form)?,
        None => Fragment::expr(Expr::nil()),
    };
    Ok(Fragment {
        prologue: value.prologue,
        value: c.global_call(c.wk.throw_fn, vec![Expr::Name(tag), value.value]),
    })
}

fn compile_catch(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    let Some((tag, body)) = args.split_first() else {
        return Err(c.malformed(&Value::Symbol(c.wk.catch), "missing tag"));
    };
    let tag = c.compile(tag)?;
    let thunk = c.compile_thunk(body)?;
    Ok(c.call_internal(c.wk.catch_fn, vec![tag, thunk]))
}

fn compile_throw(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    if args.len() != 2 {
        return Err(c.malformed(&Value::Symbol(c.wk.throw), "expected a tag and a value"));
    }
    let fragments = c.compile_args(args)?;
    Ok(c.call_internal(c.wk.throw_fn, fragments))
}

fn compile_unwind_protect(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    let Some((protected, cleanup)) = args.split_first() else {
        return Err(c.malformed(&Value::Symbol(c.wk.unwind_protect), "missing protected form"));
    };
    let protected = c.compile(protected)?;
    let result = c.fresh_temp();
    let mut body = protected.prologue;
    body.push(Stmt::Assign { target: result, value: protected.value });
    let finalbody = c.compile_discarded_body(cleanup)?;
    Ok(Fragment {
        prologue: vec![Stmt::Try { body, finalbody }],
        value: Expr::Name(result),
    })
}

fn compile_quasiquote(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    match args {
        [x] => {
            let expansion = c.quasi(x, 1)?;
            c.compile(&expansion)
        }
        _ => Err(c.malformed(&Value::Symbol(c.wk.quasiquote), "expected one argument")),
    }
}

fn compile_misplaced(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    let form = Value::list(args.to_vec());
    Err(c.malformed(&form, "not allowed here"))
}

fn compile_progv(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    let [symbols, values, body @ ..] = args else {
        return Err(c.malformed(&Value::Symbol(c.wk.progv), "expected symbols and values"));
    };
    let symbols = c.compile(symbols)?;
    let values = c.compile(values)?;
    let thunk = c.compile_thunk(body)?;
    Ok(c.call_internal(c.wk.dynamic_let, vec![symbols, values, thunk]))
}

fn compile_in_package(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    match args {
        [name @ (Value::Symbol(_) | Value::String(_))] => Ok(Fragment::expr(
            c.global_call(c.wk.in_package_fn, vec![Expr::Const(name.clone())]),
        )),
        _ => Err(c.malformed(&Value::Symbol(c.wk.in_package), "expected a package name")),
    }
}

fn compile_call_next_method(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    let Some(next) = c.lookup_next_method() else {
        return Err(c.malformed(&Value::Symbol(c.wk.call_next_method), "used outside a method body"));
    };
    let mut fragments = vec![Fragment::expr(Expr::Name(next))];
    fragments.extend(c.compile_args(args)?);
    Ok(c.call_internal(c.wk.call_next_method_fn, fragments))
}

fn compile_next_method_p(c: &mut Compiler<'_, '_>, args: &[Value]) -> Result<Fragment, ControlSignal> {
    match (c.lookup_next_method(), args) {
        (Some(next), []) => Ok(Fragment::expr(c.global_call(c.wk.next_method_p_fn, vec![Expr::Name(next)]))),
        _ => Err(c.malformed(&Value::Symbol(c.wk.next_method_p), "used outside a method body")),
    }
}

/// The compilers of every special form.
pub fn special_forms(wk: &WellKnown) -> HashMap<SymbolId, FormCompiler> {
    let mut forms: HashMap<SymbolId, FormCompiler> = HashMap::new();
    forms.insert(wk.quote, compile_quote);
    forms.insert(wk.function, compile_function);
    forms.insert(wk.lambda, compile_lambda_form);
    forms.insert(wk.progn, |c, args| c.compile_body(args));
    forms.insert(wk.if_, compile_if);
    forms.insert(wk.setq, |c, args| c.compile_setq(args));
    forms.insert(wk.setf, |c, args| c.compile_setf(args));
    forms.insert(wk.let_, |c, args| c.compile_let(args));
    forms.insert(wk.let_star, |c, args| c.compile_let(args));
    forms.insert(wk.flet, |c, args| c.compile_flet(args));
    forms.insert(wk.labels, |c, args| c.compile_labels(args));
    forms.insert(wk.def, |c, args| c.compile_def(args));
    forms.insert(wk.defun, |c, args| c.compile_def(args));
    forms.insert(wk.defmacro, |c, args| c.compile_defmacro(args));
    forms.insert(wk.defvar, |c, args| c.compile_defvar(args, false));
    forms.insert(wk.defparameter, |c, args| c.compile_defvar(args, true));
    forms.insert(wk.block, compile_block_form);
    forms.insert(wk.return_from, compile_return_from);
    forms.insert(wk.catch, compile_catch);
    forms.insert(wk.throw, compile_throw);
    forms.insert(wk.unwind_protect, compile_unwind_protect);
    forms.insert(wk.while_, |c, args| c.compile_while(args));
    forms.insert(wk.dolist, |c, args| c.compile_dolist(args));
    forms.insert(wk.collect, |c, args| c.compile_collect(args));
    forms.insert(wk.quasiquote, compile_quasiquote);
    forms.insert(wk.unquote, compile_misplaced);
    forms.insert(wk.unquote_splicing, compile_misplaced);
    forms.insert(wk.declare, compile_misplaced);
    forms.insert(wk.handler_case, |c, args| c.compile_handler_case(args));
    forms.insert(wk.handler_bind, |c, args| c.compile_handler_bind(args));
    forms.insert(wk.restart_case, |c, args| c.compile_restart_case(args));
    forms.insert(wk.restart_bind, |c, args| c.compile_restart_bind(args));
    forms.insert(wk.progv, compile_progv);
    forms.insert(wk.defgeneric, |c, args| c.compile_defgeneric(args));
    forms.insert(wk.defmethod, |c, args| c.compile_defmethod(args));
    forms.insert(wk.defclass, |c, args| c.compile_class_definition(args, false));
    forms.insert(wk.define_condition, |c, args| c.compile_class_definition(args, true));
    forms.insert(wk.in_package, compile_in_package);
    forms.insert(wk.call_next_method, compile_call_next_method);
    forms.insert(wk.next_method_p, compile_next_method_p);
    forms
}

// ----------------------------------------------------------------------
// Entry points
// ----------------------------------------------------------------------

fn warn_undefined(globals: &GlobalContext, form: &Value) {
    let free = free_functions(globals, form);
    if free.is_empty() {
        return;
    }
    let symbols = globals.symbols();
    let macros = globals.macros();
    for f in free {
        let known = symbols.symbol_function(f).is_some()
            || macros.contains_key(&f)
            || globals.special_forms.contains_key(&f);
        if !known {
            log::warn!("style warning: undefined function {}", symbols.symbol_name(f).unwrap_or("?"));
        }
    }
}

/// Compiles one top-level form into a module whose body returns its value.
pub fn compile_toplevel(interp: &mut Interpreter<'_>, form: &Value) -> Result<Module, ControlSignal> {
    warn_undefined(interp.globals, form);
    let mut compiler = Compiler::new(interp);
    let fragment = compiler.fixpoint(&mut |c| {
        c.push_record();
        let fragment = c.compile(form);
        c.pop_record();
        fragment
    })?;
    Ok(Module { body: fragment.into_body() })
}

/// Expands `form` once if it is a macro call. The flag says whether it was.
pub fn macroexpand_1(interp: &mut Interpreter<'_>, form: &Value) -> Result<(Value, bool), ControlSignal> {
    let Value::List(items) = form else {
        return Ok((form.clone(), false));
    };
    let Some(head) = items[0].as_symbol() else {
        return Ok((form.clone(), false));
    };
    if interp.globals.special_forms.contains_key(&head) {
        return Ok((form.clone(), false));
    }
    match interp.globals.macro_function(head) {
        Some(expander) => Ok((interp.apply(&expander, &items[1..])?, true)),
        None => Ok((form.clone(), false)),
    }
}

/// Expands the head of `form` until it is no longer a macro call.
pub fn macroexpand(interp: &mut Interpreter<'_>, form: &Value) -> EvalResult {
    let mut form = form.clone();
    loop {
        let (expanded, changed) = macroexpand_1(interp, &form)?;
        if !changed {
            return Ok(form);
        }
        form = expanded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::declarations;
    use crate::config::RuntimeOptions;
    use crate::process::Process;
    use crate::reader::{read_from_string, ReaderOptions};

    fn read(ctx: &GlobalContext, text: &str) -> Value {
        read_from_string(text, &mut ctx.symbols_mut(), &ReaderOptions::default()).unwrap()
    }

    fn compile(ctx: &GlobalContext, text: &str) -> Result<Module, String> {
        let form = read(ctx, text);
        let mut process = Process::new();
        let mut interp = Interpreter::new(&mut process, ctx);
        compile_toplevel(&mut interp, &form).map_err(|s| interp.describe_signal(&s))
    }

    fn eval(ctx: &GlobalContext, text: &str) -> String {
        let mut process = Process::new();
        let mut interp = Interpreter::new(&mut process, ctx);
        match interp.eval_string(text) {
            Ok(v) => interp.prin1_to_string(&v),
            Err(s) => format!("error: {}", interp.describe_signal(&s)),
        }
    }

    fn count_defs(body: &[Stmt]) -> usize {
        body.iter()
            .map(|s| match s {
                Stmt::FunctionDef { body, .. } => 1 + count_defs(body),
                Stmt::If { body, orelse, .. } => count_defs(body) + count_defs(orelse),
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn test_expression_forms_need_no_statements() {
        let ctx = GlobalContext::new();
        let module = compile(&ctx, "(let ((x 1) (y 2)) (if x (+ x y) y))").unwrap();
        assert_eq!(module.body.len(), 1);
        assert!(matches!(module.body[0], Stmt::Return(Expr::Call { .. })));
    }

    #[test]
    fn test_statement_branch_is_thunked() {
        let ctx = GlobalContext::new();
        let module = compile(&ctx, "(let ((x 1)) (list (if x (progn (setq x 2) x) 0) x))").unwrap();
        assert!(count_defs(&module.body) >= 1);
        assert_eq!(eval(&ctx, "(let ((x 1)) (list (if x (progn (setq x 2) x) 0) x))"), "(2 2)");
    }

    #[test]
    fn test_operands_are_spilled_before_later_assignments() {
        let ctx = GlobalContext::new();
        assert_eq!(eval(&ctx, "(let ((n 0)) (list n (progn (setq n 5) n) n))"), "(0 5 5)");
    }

    #[test]
    fn test_escaping_variable_is_spilled_across_calls() {
        let ctx = GlobalContext::new();
        let text = "(let ((n 0)) (flet ((bump () (setq n (+ n 1)))) (list n (progn (bump) n) n)))";
        assert_eq!(eval(&ctx, text), "(0 1 1)");
        let module = compile(&ctx, text).unwrap();
        assert!(!declarations(&module.body).is_empty() || count_defs(&module.body) > 0);
    }

    #[test]
    fn test_fixpoint_cap() {
        let ctx = GlobalContext::with_options(RuntimeOptions::default().with_max_fixpoint_iterations(1));
        let err = compile(&ctx, "(let ((c 0)) (flet ((bump () (setq c (+ c 1)))) (bump) c))").unwrap_err();
        assert!(err.contains("did not settle within 1"), "{}", err);
    }

    #[test]
    fn test_unresolved_operator() {
        let ctx = GlobalContext::new();
        assert!(compile(&ctx, "((1 2) 3)").unwrap_err().contains("not a valid operator"));
        assert!(compile(&ctx, "(:key 3)").unwrap_err().contains("not a valid operator"));
    }

    #[test]
    fn test_unknown_declaration_and_block() {
        let ctx = GlobalContext::new();
        assert!(compile(&ctx, "(let ((x 1)) (declare (optimize speed)) x)")
            .unwrap_err()
            .contains("unknown declaration"));
        assert!(compile(&ctx, "(return-from nowhere 1)").unwrap_err().contains("unknown block"));
    }

    #[test]
    fn test_unused_block_is_elided() {
        let ctx = GlobalContext::new();
        let module = compile(&ctx, "(block done (+ 1 2))").unwrap();
        assert_eq!(count_defs(&module.body), 0);
        assert!(matches!(&module.body[0], Stmt::Return(Expr::Call { .. })));
        assert_eq!(eval(&ctx, "(block done (return-from done 7) 8)"), "7");
    }

    #[test]
    fn test_quasiquote() {
        let ctx = GlobalContext::new();
        assert_eq!(eval(&ctx, "(let ((x 1) (ys '(2 3))) `(a ,x ,@ys b))"), "(A 1 2 3 B)");
        assert_eq!(eval(&ctx, "(let ((x 1)) `#(,x 2))"), "#(1 2)");
    }

    #[test]
    fn test_collect() {
        let ctx = GlobalContext::new();
        assert_eq!(eval(&ctx, "(collect (* x x) (x '(1 2 3 4) :when (> x 1)))"), "(4 9 16)");
        assert_eq!(eval(&ctx, "(collect (list x y) (x '(1 2)) (y '(a b)))"), "((1 A) (1 B) (2 A) (2 B))");
    }

    #[test]
    fn test_defmacro_destructuring() {
        let ctx = GlobalContext::new();
        let text = "(defmacro swap-pair ((a b) &key (wrap 'list)) `(,wrap ,b ,a)) (swap-pair (1 2))";
        assert_eq!(eval(&ctx, text), "(2 1)");
        assert_eq!(eval(&ctx, "(swap-pair (1 2) :wrap vector)"), "#(2 1)");
    }

    #[test]
    fn test_macroexpand_1() {
        let ctx = GlobalContext::new();
        eval(&ctx, "(defmacro twice (x) `(progn ,x ,x))");
        let form = read(&ctx, "(twice (f))");
        let mut process = Process::new();
        let mut interp = Interpreter::new(&mut process, &ctx);
        let (expanded, changed) = macroexpand_1(&mut interp, &form).unwrap();
        assert!(changed);
        assert_eq!(interp.prin1_to_string(&expanded), "(PROGN (F) (F))");
    }
}
