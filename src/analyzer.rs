// HostCL Analyzer - Bound and Free Names
//
// Computes, for host AST nodes and for source forms, which names a node
// binds, which it references without binding, and which it writes in an
// enclosing scope. The compiler uses the AST half to place nonlocal
// declarations and to decide when a value may be read late; the form
// half feeds dependency bookkeeping.

use std::collections::{BTreeSet, HashMap};

use crate::ast::{Comprehension, Expr, Ident, Namespace, Stmt};
use crate::context::{GlobalContext, WellKnown};
use crate::symbol::{SymbolId, SymbolTable};
use crate::types::Value;

pub type NameSet = BTreeSet<Ident>;

/// Result of analyzing one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    /// Names guaranteed bound by the node (for scopes: the names they introduce)
    pub bound: NameSet,
    /// Names referenced but not bound by the node
    pub free: NameSet,
    /// Names written in an enclosing scope through global/nonlocal
    pub external_writes: NameSet,
    /// Names possibly written, over every arm
    pub assigned: NameSet,
}

impl Analysis {
    fn free(names: impl IntoIterator<Item = Ident>) -> Self {
        Self {
            free: names.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Default rule: everything of `other` except its bindings.
    fn absorb(&mut self, other: Analysis) {
        self.free.extend(other.free);
        self.external_writes.extend(other.external_writes);
        self.assigned.extend(other.assigned);
    }

    /// Sequencing: `other` runs after `self`, so names already bound
    /// are not free in it.
    fn then(&mut self, other: Analysis) {
        for name in other.free {
            if !self.bound.contains(&name) {
                self.free.insert(name);
            }
        }
        self.bound.extend(other.bound);
        self.external_writes.extend(other.external_writes);
        self.assigned.extend(other.assigned);
    }

    /// Two alternative arms: free names union, bound names intersect.
    fn either(a: Analysis, b: Analysis) -> Analysis {
        Analysis {
            bound: a.bound.intersection(&b.bound).copied().collect(),
            free: a.free.union(&b.free).copied().collect(),
            external_writes: a.external_writes.union(&b.external_writes).copied().collect(),
            assigned: a.assigned.union(&b.assigned).copied().collect(),
        }
    }

    /// Scope rule: the scope introduces `names`, which stop being free.
    fn scope(mut self, names: impl IntoIterator<Item = Ident>) -> Analysis {
        let names: NameSet = names.into_iter().collect();
        self.free.retain(|n| !names.contains(n));
        self.assigned.retain(|n| !names.contains(n));
        self.external_writes.retain(|n| !names.contains(n));
        self.bound = names;
        self
    }
}

pub fn analyze_expr(expr: &Expr) -> Analysis {
    match expr {
        Expr::Const(_) => Analysis::default(),
        Expr::Name(id) => Analysis::free([*id]),
        Expr::Call { func, args } => {
            let mut a = analyze_expr(func);
            for arg in args {
                a.absorb(analyze_expr(arg));
            }
            a
        }
        Expr::IfExp { test, then, orelse } => {
            let mut a = analyze_expr(test);
            a.absorb(analyze_expr(then));
            a.absorb(analyze_expr(orelse));
            a
        }
        Expr::Lambda { params, body, .. } => analyze_expr(body).scope(params.names()),
        Expr::ListComp { element, generators } => analyze_comprehension(element, generators),
    }
}

/// Generators bind left to right; a later clause sees earlier targets.
fn analyze_comprehension(element: &Expr, generators: &[Comprehension]) -> Analysis {
    let mut acc = Analysis::default();
    for generator in generators {
        acc.then(analyze_expr(&generator.iter));
        acc.bound.insert(generator.target);
        for condition in &generator.conditions {
            acc.then(analyze_expr(condition));
        }
    }
    acc.then(analyze_expr(element));
    let targets: Vec<Ident> = generators.iter().map(|g| g.target).collect();
    acc.scope(targets)
}

pub fn analyze_stmt(stmt: &Stmt) -> Analysis {
    match stmt {
        Stmt::FunctionDef { name, params, body, .. } => {
            let inner = analyze_body(body);
            let declared = declarations(body);
            let locals: NameSet = params
                .names()
                .chain(inner.assigned.iter().copied())
                .filter(|n| !declared.contains(n))
                .collect();
            let mut a = Analysis {
                free: inner.free.difference(&locals).copied().collect(),
                external_writes: inner.external_writes.difference(&locals).copied().collect(),
                ..Analysis::default()
            };
            a.bound.insert(*name);
            a.assigned.insert(*name);
            a
        }
        Stmt::Return(e) | Stmt::Expr(e) => {
            let mut a = analyze_expr(e);
            a.bound.clear();
            a
        }
        Stmt::Assign { target, value } => {
            let mut a = analyze_expr(value);
            a.bound = [*target].into_iter().collect();
            a.assigned.insert(*target);
            a
        }
        Stmt::If { test, body, orelse } => {
            let mut a = analyze_expr(test);
            a.bound.clear();
            a.then(Analysis::either(analyze_body(body), analyze_body(orelse)));
            a
        }
        Stmt::While { test, body, orelse } => {
            let mut a = analyze_expr(test);
            a.bound.clear();
            a.then(Analysis::either(analyze_body(body), analyze_body(orelse)));
            a
        }
        Stmt::For { target, iter, body, orelse } => {
            let mut a = analyze_expr(iter);
            a.bound.clear();
            let mut looped = Analysis {
                bound: [*target].into_iter().collect(),
                assigned: [*target].into_iter().collect(),
                ..Analysis::default()
            };
            looped.then(analyze_body(body));
            a.then(Analysis::either(looped, analyze_body(orelse)));
            a
        }
        Stmt::Try { body, finalbody } => {
            let mut a = analyze_body(body);
            a.then(analyze_body(finalbody));
            a
        }
        Stmt::Global(names) | Stmt::Nonlocal(names) => Analysis {
            external_writes: names.iter().copied().collect(),
            ..Analysis::default()
        },
    }
}

/// A statement sequence, threading bindings from each statement to the next.
pub fn analyze_body(body: &[Stmt]) -> Analysis {
    let mut acc = Analysis::default();
    for stmt in body {
        acc.then(analyze_stmt(stmt));
    }
    acc
}

/// Prologue statements followed by a value expression.
pub fn analyze_fragment(prologue: &[Stmt], value: &Expr) -> Analysis {
    let mut a = analyze_body(prologue);
    let mut v = analyze_expr(value);
    v.bound.clear();
    a.then(v);
    a
}

/// The global/nonlocal declarations made by this procedure body itself.
pub fn declarations(body: &[Stmt]) -> NameSet {
    let mut out = NameSet::new();
    for stmt in body {
        match stmt {
            Stmt::Global(names) | Stmt::Nonlocal(names) => out.extend(names.iter().copied()),
            Stmt::If { body, orelse, .. }
            | Stmt::While { body, orelse, .. }
            | Stmt::For { body, orelse, .. } => {
                out.extend(declarations(body));
                out.extend(declarations(orelse));
            }
            Stmt::Try { body, finalbody } => {
                out.extend(declarations(body));
                out.extend(declarations(finalbody));
            }
            _ => {}
        }
    }
    out
}

/// Every name declared nonlocal anywhere below `body`, nested procedures
/// included. These are the lexical names some procedure writes from the
/// outside.
pub fn declared_nonlocals(body: &[Stmt]) -> NameSet {
    let mut out = NameSet::new();
    collect_nonlocals(body, &mut out);
    out
}

fn collect_nonlocals(body: &[Stmt], out: &mut NameSet) {
    for stmt in body {
        match stmt {
            Stmt::Nonlocal(names) => out.extend(names.iter().copied()),
            Stmt::FunctionDef { body, .. } => collect_nonlocals(body, out),
            Stmt::If { body, orelse, .. }
            | Stmt::While { body, orelse, .. }
            | Stmt::For { body, orelse, .. } => {
                collect_nonlocals(body, out);
                collect_nonlocals(orelse, out);
            }
            Stmt::Try { body, finalbody } => {
                collect_nonlocals(body, out);
                collect_nonlocals(finalbody, out);
            }
            _ => {}
        }
    }
}

/// True when running `body` may call a procedure.
pub fn may_call(body: &[Stmt]) -> bool {
    fn expr_calls(e: &Expr) -> bool {
        match e {
            Expr::Call { .. } | Expr::ListComp { .. } => true,
            Expr::IfExp { test, then, orelse } => {
                expr_calls(test) || expr_calls(then) || expr_calls(orelse)
            }
            Expr::Const(_) | Expr::Name(_) | Expr::Lambda { .. } => false,
        }
    }
    body.iter().any(|stmt| match stmt {
        Stmt::FunctionDef { .. } | Stmt::Global(_) | Stmt::Nonlocal(_) => false,
        Stmt::Return(e) | Stmt::Expr(e) => expr_calls(e),
        Stmt::Assign { value, .. } => expr_calls(value),
        Stmt::If { test, body, orelse } | Stmt::While { test, body, orelse } => {
            expr_calls(test) || may_call(body) || may_call(orelse)
        }
        Stmt::For { iter, body, orelse, .. } => {
            expr_calls(iter) || may_call(body) || may_call(orelse)
        }
        Stmt::Try { body, finalbody } => may_call(body) || may_call(finalbody),
    })
}

// ---------------------------------------------------------------------
// Source forms
// ---------------------------------------------------------------------

/// Per-head rule for source forms; gets the form's arguments.
pub type FormRule = fn(&FormAnalyzer<'_>, &[Value]) -> Analysis;
pub type FormRules = HashMap<SymbolId, FormRule>;

/// Builds the rule table. Names are interned in COMMON-LISP.
pub fn form_rules(wk: &WellKnown) -> FormRules {
    let mut rules: FormRules = HashMap::new();
    rules.insert(wk.quote, |_, _| Analysis::default());
    rules.insert(wk.declare, |_, _| Analysis::default());
    rules.insert(wk.function, rule_function);
    rules.insert(wk.setq, rule_setq);
    rules.insert(wk.let_, rule_let);
    rules.insert(wk.let_star, rule_let);
    rules.insert(wk.lambda, |a, args| a.lambda(args));
    rules.insert(wk.def, rule_def);
    rules.insert(wk.defun, rule_def);
    rules.insert(wk.defmacro, rule_def);
    rules.insert(wk.flet, |a, args| rule_local_functions(a, args, false));
    rules.insert(wk.labels, |a, args| rule_local_functions(a, args, true));
    rules.insert(wk.block, |a, args| a.sequence(args.get(1..).unwrap_or(&[])));
    rules.insert(wk.return_from, |a, args| a.sequence(args.get(1..).unwrap_or(&[])));
    rules.insert(wk.collect, rule_collect);
    rules.insert(wk.handler_case, rule_clauses);
    rules.insert(wk.restart_case, rule_clauses);
    rules
}

/// Walks source forms through the rule table it was built with.
pub struct FormAnalyzer<'a> {
    symbols: &'a SymbolTable,
    rules: &'a FormRules,
    macros: &'a HashMap<SymbolId, Value>,
    wk: &'a WellKnown,
}

impl<'a> FormAnalyzer<'a> {
    pub fn new(
        symbols: &'a SymbolTable,
        rules: &'a FormRules,
        macros: &'a HashMap<SymbolId, Value>,
        wk: &'a WellKnown,
    ) -> Self {
        Self { symbols, rules, macros, wk }
    }

    pub fn analyze(&self, form: &Value) -> Analysis {
        match form {
            Value::Symbol(s) => {
                if self.symbols.is_constant(*s) || *s == self.wk.t {
                    Analysis::default()
                } else {
                    Analysis::free([Ident::global_variable(*s)])
                }
            }
            Value::List(items) => {
                let head = &items[0];
                let args = &items[1..];
                if let Some(sym) = head.as_symbol() {
                    if let Some(rule) = self.rules.get(&sym) {
                        return rule(self, args);
                    }
                    let mut a = if self.macros.contains_key(&sym) {
                        Analysis::default()
                    } else {
                        Analysis::free([Ident::global_function(sym)])
                    };
                    for arg in args {
                        a.absorb(self.analyze(arg));
                    }
                    return a;
                }
                let mut a = if head.is_form(self.wk.lambda) {
                    self.analyze(head)
                } else {
                    Analysis::default()
                };
                for arg in args {
                    a.absorb(self.analyze(arg));
                }
                a
            }
            _ => Analysis::default(),
        }
    }

    fn sequence(&self, forms: &[Value]) -> Analysis {
        let mut a = Analysis::default();
        for form in forms {
            a.absorb(self.analyze(form));
        }
        a
    }

    /// `(lambda-list . body)`: parameters scope over the body, and each
    /// default form over the later ones.
    fn lambda(&self, args: &[Value]) -> Analysis {
        let Some((list, body)) = args.split_first() else {
            return Analysis::default();
        };
        let mut names = Vec::new();
        let mut inits = Analysis::default();
        let kw = &self.wk.lambda_keywords;
        let markers = [kw.optional, kw.rest, kw.body, kw.key, kw.allow_other_keys, kw.aux];
        for item in list.as_list().unwrap_or(&[]) {
            match item {
                Value::Symbol(s) if markers.contains(s) => {}
                Value::Symbol(s) => names.push(Ident::global_variable(*s)),
                Value::List(parts) => {
                    let var = match &parts[0] {
                        Value::List(pair) => pair.get(1).and_then(|v| v.as_symbol()),
                        other => other.as_symbol(),
                    };
                    if let Some(init) = parts.get(1) {
                        let mut init = self.analyze(init);
                        init.free.retain(|n| !names.contains(n));
                        inits.absorb(init);
                    }
                    names.extend(var.map(Ident::global_variable));
                    if let Some(sp) = parts.get(2).and_then(|v| v.as_symbol()) {
                        names.push(Ident::global_variable(sp));
                    }
                }
                _ => {}
            }
        }
        let mut a = self.sequence(body).scope(names);
        let bound = std::mem::take(&mut a.bound);
        a.absorb(inits);
        a.bound = bound;
        a
    }
}

fn rule_function(a: &FormAnalyzer<'_>, args: &[Value]) -> Analysis {
    match args.first() {
        Some(Value::Symbol(s)) => Analysis::free([Ident::global_function(*s)]),
        Some(form) if form.is_form(a.wk.lambda) => a.analyze(form),
        _ => Analysis::default(),
    }
}

fn rule_setq(a: &FormAnalyzer<'_>, args: &[Value]) -> Analysis {
    let mut out = Analysis::default();
    for pair in args.chunks(2) {
        if let Some(var) = pair[0].as_symbol() {
            let id = Ident::global_variable(var);
            out.free.insert(id);
            out.assigned.insert(id);
            out.external_writes.insert(id);
        }
        if let Some(value) = pair.get(1) {
            out.absorb(a.analyze(value));
        }
    }
    out
}

/// `(name init)`, `(name)` or `name`.
fn binding_parts(binding: &Value) -> (Option<SymbolId>, Option<&Value>) {
    match binding {
        Value::Symbol(s) => (Some(*s), None),
        Value::List(parts) => (parts[0].as_symbol(), parts.get(1)),
        _ => (None, None),
    }
}

/// `let` and `let*` both bind in order: an initializer sees the names before it.
fn rule_let(a: &FormAnalyzer<'_>, args: &[Value]) -> Analysis {
    let Some((bindings, body)) = args.split_first() else {
        return Analysis::default();
    };
    let bindings = bindings.as_list().unwrap_or(&[]);
    // Innermost first: each binding scopes over the rest.
    let mut out = a.sequence(body);
    for binding in bindings.iter().rev() {
        let (name, init) = binding_parts(binding);
        let mut scoped = out.scope(name.map(Ident::global_variable));
        let bound = std::mem::take(&mut scoped.bound);
        if let Some(init) = init {
            scoped.absorb(a.analyze(init));
        }
        scoped.bound = bound;
        out = scoped;
    }
    out.bound = bindings
        .iter()
        .filter_map(|b| binding_parts(b).0.map(Ident::global_variable))
        .collect();
    out
}

fn rule_def(a: &FormAnalyzer<'_>, args: &[Value]) -> Analysis {
    let Some((name, rest)) = args.split_first() else {
        return Analysis::default();
    };
    let mut out = a.lambda(rest);
    if let Some(name) = name.as_symbol() {
        let id = Ident::global_function(name);
        out.free.remove(&id);
        out.bound = [id].into_iter().collect();
    }
    out
}

fn rule_local_functions(a: &FormAnalyzer<'_>, args: &[Value], recursive: bool) -> Analysis {
    let Some((definitions, body)) = args.split_first() else {
        return Analysis::default();
    };
    let mut names = Vec::new();
    let mut functions = Analysis::default();
    for definition in definitions.as_list().unwrap_or(&[]) {
        if let Value::List(parts) = definition {
            names.extend(parts[0].as_symbol().map(Ident::global_function));
            functions.absorb(a.lambda(&parts[1..]));
        }
    }
    if recursive {
        functions.free.retain(|n| !names.contains(n));
    }
    let mut out = a.sequence(body).scope(names);
    let bound = std::mem::take(&mut out.bound);
    out.absorb(functions);
    out.bound = bound;
    out
}

/// `(collect element (var sequence [:when test]...)...)`
fn rule_collect(a: &FormAnalyzer<'_>, args: &[Value]) -> Analysis {
    let Some((element, clauses)) = args.split_first() else {
        return Analysis::default();
    };
    let mut acc = Analysis::default();
    let mut names = Vec::new();
    for clause in clauses {
        let Value::List(parts) = clause else { continue };
        if let Some(sequence) = parts.get(1) {
            acc.then(a.analyze(sequence));
        }
        if let Some(var) = parts[0].as_symbol() {
            let id = Ident::global_variable(var);
            acc.bound.insert(id);
            names.push(id);
        }
        for test in parts.iter().skip(2).filter(|p| p.as_symbol() != Some(a.wk.when_keyword)) {
            acc.then(a.analyze(test));
        }
    }
    acc.then(a.analyze(element));
    acc.scope(names)
}

/// `(form (name lambda-list . body)...)` as in HANDLER-CASE.
fn rule_clauses(a: &FormAnalyzer<'_>, args: &[Value]) -> Analysis {
    let Some((form, clauses)) = args.split_first() else {
        return Analysis::default();
    };
    let mut out = a.analyze(form);
    for clause in clauses {
        if let Value::List(parts) = clause {
            let mut lambda = a.lambda(&parts[1..]);
            lambda.bound.clear();
            out.absorb(lambda);
        }
    }
    out
}

fn names_in(set: &NameSet, namespace: Namespace) -> BTreeSet<SymbolId> {
    set.iter()
        .filter(|n| n.namespace == namespace)
        .map(|n| n.symbol)
        .collect()
}

/// Analyzes `form` with the tables of `globals`.
pub fn analyze_form(globals: &GlobalContext, form: &Value) -> Analysis {
    let symbols = globals.symbols();
    let macros = globals.macros();
    FormAnalyzer::new(&symbols, &globals.form_rules, &macros, &globals.wk).analyze(form)
}

/// Variables `form` references without binding.
pub fn free_variables(globals: &GlobalContext, form: &Value) -> BTreeSet<SymbolId> {
    names_in(&analyze_form(globals, form).free, Namespace::Variable)
}

/// Functions `form` calls or names without defining them.
pub fn free_functions(globals: &GlobalContext, form: &Value) -> BTreeSet<SymbolId> {
    names_in(&analyze_form(globals, form).free, Namespace::Function)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Comprehension, Params};
    use crate::reader::{read_from_string, ReaderOptions};
    use std::sync::Arc;

    fn var(n: u32) -> Ident {
        Ident {
            symbol: SymbolId(5000 + n),
            serial: n,
            namespace: Namespace::Variable,
        }
    }

    fn assign(target: Ident, value: Expr) -> Stmt {
        Stmt::Assign { target, value }
    }

    fn set(names: &[Ident]) -> NameSet {
        names.iter().copied().collect()
    }

    #[test]
    fn test_sequence_threads_bindings() {
        let (x, y) = (var(1), var(2));
        let body = vec![assign(x, Expr::Name(y)), Stmt::Expr(Expr::Name(x))];
        let a = analyze_body(&body);
        assert_eq!(a.free, set(&[y]));
        assert_eq!(a.bound, set(&[x]));
    }

    #[test]
    fn test_if_intersects_bound_sets() {
        let (a_, x, y) = (var(1), var(2), var(3));
        let stmt = Stmt::If {
            test: Expr::Name(a_),
            body: vec![assign(x, Expr::nil()), assign(y, Expr::nil())],
            orelse: vec![assign(x, Expr::nil())],
        };
        let a = analyze_stmt(&stmt);
        assert_eq!(a.bound, set(&[x]));
        assert_eq!(a.assigned, set(&[x, y]));
        assert_eq!(a.free, set(&[a_]));

        // y is not guaranteed bound, so a later read of it stays free.
        let a = analyze_body(&[stmt, Stmt::Expr(Expr::Name(y)), Stmt::Expr(Expr::Name(x))]);
        assert_eq!(a.free, set(&[a_, y]));
    }

    #[test]
    fn test_comprehension_threads_targets() {
        let (xs, x, y) = (var(1), var(2), var(3));
        let comp = Expr::ListComp {
            element: Box::new(Expr::Name(y)),
            generators: vec![
                Comprehension { target: x, iter: Expr::Name(xs), conditions: vec![] },
                Comprehension { target: y, iter: Expr::Name(x), conditions: vec![Expr::Name(x)] },
            ],
        };
        let a = analyze_expr(&comp);
        assert_eq!(a.free, set(&[xs]));
        assert_eq!(a.bound, set(&[x, y]));
    }

    #[test]
    fn test_comprehension_iter_sees_only_earlier_targets() {
        let (x, y) = (var(1), var(2));
        let comp = Expr::ListComp {
            element: Box::new(Expr::Name(x)),
            generators: vec![
                Comprehension { target: x, iter: Expr::Name(y), conditions: vec![] },
                Comprehension { target: y, iter: Expr::Name(x), conditions: vec![] },
            ],
        };
        assert_eq!(analyze_expr(&comp).free, set(&[y]));
    }

    #[test]
    fn test_lambda_scope() {
        let (p, q) = (var(1), var(2));
        let lambda = Expr::Lambda {
            name: None,
            params: Arc::new(Params::simple(vec![p])),
            body: Arc::new(Expr::call(Expr::Name(q), vec![Expr::Name(p)])),
        };
        let a = analyze_expr(&lambda);
        assert_eq!(a.free, set(&[q]));
        assert_eq!(a.bound, set(&[p]));
    }

    #[test]
    fn test_nonlocal_write_escapes_procedure() {
        let (f, n, p, t) = (var(1), var(2), var(3), var(4));
        let def = Stmt::FunctionDef {
            name: f,
            label: None,
            params: Arc::new(Params::simple(vec![p])),
            body: Arc::new(vec![
                Stmt::Nonlocal(vec![n]),
                assign(t, Expr::Name(p)),
                assign(n, Expr::Name(t)),
                Stmt::Return(Expr::Name(n)),
            ]),
        };
        let a = analyze_stmt(&def);
        assert_eq!(a.external_writes, set(&[n]));
        assert_eq!(a.free, set(&[n]));
        assert_eq!(a.bound, set(&[f]));
        assert_eq!(declared_nonlocals(std::slice::from_ref(&def)), set(&[n]));

        // The enclosing procedure owns n, so the write stops there.
        let outer = Stmt::FunctionDef {
            name: var(9),
            label: None,
            params: Arc::new(Params::default()),
            body: Arc::new(vec![assign(n, Expr::nil()), def]),
        };
        let a = analyze_stmt(&outer);
        assert!(a.external_writes.is_empty());
        assert!(a.free.is_empty());
    }

    #[test]
    fn test_global_declaration() {
        let g = Ident::global_variable(SymbolId(77));
        let a = analyze_body(&[Stmt::Global(vec![g]), assign(g, Expr::nil())]);
        assert_eq!(a.external_writes, set(&[g]));
        assert!(a.bound.contains(&g));
    }

    #[test]
    fn test_may_call() {
        let x = var(1);
        assert!(!may_call(&[assign(x, Expr::nil())]));
        assert!(may_call(&[assign(x, Expr::call(Expr::Name(x), vec![]))]));
    }

    fn read(globals: &GlobalContext, text: &str) -> Value {
        let mut symbols = globals.symbols_mut();
        read_from_string(text, &mut symbols, &ReaderOptions::default()).unwrap()
    }

    fn names(globals: &GlobalContext, set: &BTreeSet<SymbolId>) -> Vec<String> {
        let symbols = globals.symbols();
        let mut out: Vec<String> = set
            .iter()
            .map(|s| symbols.symbol_name(*s).unwrap_or("").to_string())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_form_free_variables() {
        let globals = GlobalContext::new();
        let form = read(&globals, "(let ((x y) (y x)) (+ x y z))");
        assert_eq!(names(&globals, &free_variables(&globals, &form)), vec!["Y", "Z"]);
        assert_eq!(names(&globals, &free_functions(&globals, &form)), vec!["+"]);

        let form = read(&globals, "(let* ((x 1) (y x)) (+ x y))");
        assert!(free_variables(&globals, &form).is_empty());
    }

    #[test]
    fn test_form_lambda_and_labels() {
        let globals = GlobalContext::new();
        let form = read(&globals, "(lambda (a &optional (b a) &key (c d)) (list a b c))");
        assert_eq!(names(&globals, &free_variables(&globals, &form)), vec!["D"]);

        let form = read(&globals, "(labels ((f (n) (g n)) (g (n) (f n))) (f 1))");
        assert!(free_functions(&globals, &form).is_empty());
        let form = read(&globals, "(flet ((f (n) (f n))) (f 1))");
        assert_eq!(names(&globals, &free_functions(&globals, &form)), vec!["F"]);
    }

    #[test]
    fn test_form_quote_and_def() {
        let globals = GlobalContext::new();
        let form = read(&globals, "(def square (x) (* x x 'y :k))");
        assert!(free_variables(&globals, &form).is_empty());
        assert_eq!(names(&globals, &free_functions(&globals, &form)), vec!["*"]);
    }

    #[test]
    fn test_form_collect() {
        let globals = GlobalContext::new();
        let form = read(&globals, "(collect (* x y) (x xs) (y x :when (> y k)))");
        assert_eq!(names(&globals, &free_variables(&globals, &form)), vec!["K", "XS"]);
    }
}
