// HostCL Global Context
//
// State shared by every process: the symbol and class tables, macros,
// special proclamations, the special-form and analyzer tables, and the
// runtime options. Mutable parts sit behind locks; a guard is never held
// across a call into Lisp code.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use thiserror::Error;

use crate::analyzer::{form_rules, FormRules};
use crate::clos::{BuiltinClasses, ClassTable, QualifierSymbols};
use crate::compiler::{special_forms, FormCompiler};
use crate::config::RuntimeOptions;
use crate::debug::DebuggerHook;
use crate::eval::{EvalResult, Interpreter};
use crate::lambda_list::LambdaListKeywords;
use crate::printer::PrintVariables;
use crate::process::Process;
use crate::symbol::{PackageId, SymbolId, SymbolTable, COMMON_LISP, CL_USER};
use crate::types::Value;

/// Lisp source evaluated by `boot`.
pub const PRELUDE: &str = include_str!("prelude.lisp");

macro_rules! well_known {
    (
        exported { $($e:ident: $en:literal),* $(,)? }
        keywords { $($k:ident: $kn:literal),* $(,)? }
        internal { $($i:ident: $in_:literal),* $(,)? }
    ) => {
        /// Symbols the runtime refers to by identity.
        #[derive(Debug, Clone)]
        pub struct WellKnown {
            $(pub $e: SymbolId,)*
            $(pub $k: SymbolId,)*
            $(pub $i: SymbolId,)*
            pub lambda_keywords: LambdaListKeywords,
            pub qualifiers: QualifierSymbols,
        }

        impl WellKnown {
            pub fn intern(table: &mut SymbolTable) -> Self {
                Self {
                    $($e: table.intern_exported($en, COMMON_LISP),)*
                    $($k: table.intern_keyword($kn),)*
                    $($i: table.intern_in($in_, COMMON_LISP),)*
                    lambda_keywords: LambdaListKeywords::intern(table),
                    qualifiers: QualifierSymbols {
                        around: table.intern_keyword("AROUND"),
                        before: table.intern_keyword("BEFORE"),
                        after: table.intern_keyword("AFTER"),
                    },
                }
            }
        }
    };
}

well_known! {
    exported {
        t: "T",
        nil: "NIL",
        quote: "QUOTE",
        function: "FUNCTION",
        progn: "PROGN",
        if_: "IF",
        setq: "SETQ",
        setf: "SETF",
        let_: "LET",
        let_star: "LET*",
        lambda: "LAMBDA",
        def: "DEF",
        defun: "DEFUN",
        flet: "FLET",
        labels: "LABELS",
        defmacro: "DEFMACRO",
        defvar: "DEFVAR",
        defparameter: "DEFPARAMETER",
        declare: "DECLARE",
        special: "SPECIAL",
        ignore: "IGNORE",
        ignorable: "IGNORABLE",
        block: "BLOCK",
        return_from: "RETURN-FROM",
        catch: "CATCH",
        throw: "THROW",
        unwind_protect: "UNWIND-PROTECT",
        while_: "WHILE",
        dolist: "DOLIST",
        collect: "COLLECT",
        quasiquote: "QUASIQUOTE",
        unquote: "UNQUOTE",
        unquote_splicing: "UNQUOTE-SPLICING",
        handler_case: "HANDLER-CASE",
        handler_bind: "HANDLER-BIND",
        restart_case: "RESTART-CASE",
        restart_bind: "RESTART-BIND",
        progv: "PROGV",
        defgeneric: "DEFGENERIC",
        defmethod: "DEFMETHOD",
        defclass: "DEFCLASS",
        define_condition: "DEFINE-CONDITION",
        in_package: "IN-PACKAGE",
        call_next_method: "CALL-NEXT-METHOD",
        next_method_p: "NEXT-METHOD-P",
        slot_value: "SLOT-VALUE",
        symbol_value: "SYMBOL-VALUE",
        eql: "EQL",
        exact: "EXACT",
        list: "LIST",
        append: "APPEND",
        nth: "NTH",
        nthcdr: "NTHCDR",
        set: "SET",
        vector: "VECTOR",
        apply: "APPLY",
        standard: "STANDARD",
        muffle_warning: "MUFFLE-WARNING",
        continue_: "CONTINUE",
        abort: "ABORT",
        use_value: "USE-VALUE",
        store_value: "STORE-VALUE",
        package_var: "*PACKAGE*",
        read_case_var: "*READ-CASE*",
        debugger_hook_var: "*DEBUGGER-HOOK*",
    }
    keywords {
        when_keyword: "WHEN",
        no_error: "NO-ERROR",
        method_keyword: "METHOD",
        argument_precedence_order: "ARGUMENT-PRECEDENCE-ORDER",
        method_combination: "METHOD-COMBINATION",
        documentation: "DOCUMENTATION",
        report: "REPORT",
        interactive: "INTERACTIVE",
        report_function: "REPORT-FUNCTION",
        interactive_function: "INTERACTIVE-FUNCTION",
        initarg: "INITARG",
        initform: "INITFORM",
        accessor: "ACCESSOR",
        reader: "READER",
        writer: "WRITER",
        allow_other_keys: "ALLOW-OTHER-KEYS",
    }
    internal {
        dynamic_let: "%DYNAMIC-LET",
        block_fn: "%BLOCK",
        catch_fn: "%CATCH",
        throw_fn: "%THROW",
        unsupplied_p: "%UNSUPPLIED-P",
        handler_case_fn: "%HANDLER-CASE",
        handler_bind_fn: "%HANDLER-BIND",
        restart_case_fn: "%RESTART-CASE",
        restart_bind_fn: "%RESTART-BIND",
        defgeneric_fn: "%DEFGENERIC",
        defmethod_fn: "%DEFMETHOD",
        defclass_fn: "%DEFCLASS",
        define_condition_fn: "%DEFINE-CONDITION",
        in_package_fn: "%IN-PACKAGE",
        set_slot_value: "%SET-SLOT-VALUE",
        setf_accessor: "%SETF-ACCESSOR",
        call_next_method_fn: "%CALL-NEXT-METHOD",
        next_method_p_fn: "%NEXT-METHOD-P",
        getf_fn: "%GETF",
        plist_has: "%PLIST-HAS",
        set_global: "%SET-GLOBAL",
        global_unbound_p: "%GLOBAL-UNBOUND-P",
        temp: "%TEMP",
        thunk: "%THUNK",
        macro_args: "%ARGS",
        ignored: "%IGNORED",
    }
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("prelude failed to load: {0}")]
    Prelude(String),
}

pub struct GlobalContext {
    symbols: RwLock<SymbolTable>,
    classes: RwLock<ClassTable>,
    builtins: BuiltinClasses,
    pub wk: WellKnown,
    pub print_vars: PrintVariables,
    pub special_forms: HashMap<SymbolId, FormCompiler>,
    pub form_rules: FormRules,
    pub options: RuntimeOptions,
    macros: RwLock<HashMap<SymbolId, Value>>,
    /// Symbols proclaimed special by DEFVAR and DEFPARAMETER
    specials: RwLock<HashSet<SymbolId>>,
    /// Definition name -> functions its definition refers to
    dependencies: DashMap<SymbolId, BTreeSet<SymbolId>>,
    /// Accessor name -> function of (new-value object) used by SETF
    accessor_writers: DashMap<SymbolId, Value>,
    debugger_hook: RwLock<Option<DebuggerHook>>,
}

impl GlobalContext {
    /// A context with every primitive installed but no prelude.
    pub fn new() -> Self {
        Self::with_options(RuntimeOptions::default())
    }

    pub fn with_options(options: RuntimeOptions) -> Self {
        let mut symbols = SymbolTable::new();
        let wk = WellKnown::intern(&mut symbols);
        symbols.set_symbol_value(wk.t, Value::Symbol(wk.t));
        symbols.mark_constant(wk.t);
        symbols.set_symbol_value(wk.nil, Value::Nil);
        symbols.mark_constant(wk.nil);
        symbols.set_symbol_value(wk.package_var, Value::Package(CL_USER));
        let read_case = symbols.intern_keyword(options.read_case.name());
        symbols.set_symbol_value(wk.read_case_var, Value::Symbol(read_case));
        symbols.set_symbol_value(wk.debugger_hook_var, Value::Nil);
        let print_vars = PrintVariables::intern(&mut symbols, wk.t);
        let classes = ClassTable::new(&mut symbols);
        let builtins = *classes.builtins();

        let mut specials: HashSet<SymbolId> = print_vars.all().into_iter().collect();
        specials.extend([wk.package_var, wk.read_case_var, wk.debugger_hook_var]);

        let ctx = Self {
            special_forms: special_forms(&wk),
            form_rules: form_rules(&wk),
            symbols: RwLock::new(symbols),
            classes: RwLock::new(classes),
            builtins,
            wk,
            print_vars,
            options,
            macros: RwLock::new(HashMap::new()),
            specials: RwLock::new(specials),
            dependencies: DashMap::new(),
            accessor_writers: DashMap::new(),
            debugger_hook: RwLock::new(None),
        };
        crate::primitives::install(&ctx);
        ctx
    }

    /// A context configured from the environment, with the prelude loaded
    /// when the options ask for it.
    pub fn boot() -> Result<Self, BootError> {
        Self::boot_with(RuntimeOptions::from_env())
    }

    pub fn boot_with(options: RuntimeOptions) -> Result<Self, BootError> {
        let load = options.load_prelude;
        let ctx = Self::with_options(options);
        if load {
            ctx.load_prelude()?;
        }
        Ok(ctx)
    }

    pub fn load_prelude(&self) -> Result<(), BootError> {
        let mut process = Process::new();
        let mut interp = Interpreter::new(&mut process, self);
        match interp.eval_string(PRELUDE) {
            Ok(_) => {
                log::info!("prelude loaded");
                Ok(())
            }
            Err(signal) => Err(BootError::Prelude(interp.describe_signal(&signal))),
        }
    }

    pub fn symbols(&self) -> RwLockReadGuard<'_, SymbolTable> {
        self.symbols.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn symbols_mut(&self) -> RwLockWriteGuard<'_, SymbolTable> {
        self.symbols.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn classes(&self) -> RwLockReadGuard<'_, ClassTable> {
        self.classes.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn classes_mut(&self) -> RwLockWriteGuard<'_, ClassTable> {
        self.classes.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn builtins(&self) -> &BuiltinClasses {
        &self.builtins
    }

    pub fn intern(&self, name: &str, package: PackageId) -> SymbolId {
        self.symbols_mut().intern_in(name, package)
    }

    pub fn macros(&self) -> RwLockReadGuard<'_, HashMap<SymbolId, Value>> {
        self.macros.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn macro_function(&self, name: SymbolId) -> Option<Value> {
        self.macros().get(&name).cloned()
    }

    pub fn define_macro(&self, name: SymbolId, expander: Value) {
        self.macros.write().unwrap_or_else(|e| e.into_inner()).insert(name, expander);
    }

    pub fn is_special(&self, sym: SymbolId) -> bool {
        self.specials.read().unwrap_or_else(|e| e.into_inner()).contains(&sym)
    }

    pub fn proclaim_special(&self, sym: SymbolId) {
        self.specials.write().unwrap_or_else(|e| e.into_inner()).insert(sym);
    }

    pub fn record_dependencies(&self, name: SymbolId, uses: BTreeSet<SymbolId>) {
        self.dependencies.insert(name, uses);
    }

    pub fn dependencies_of(&self, name: SymbolId) -> Vec<SymbolId> {
        self.dependencies
            .get(&name)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn set_accessor_writer(&self, name: SymbolId, writer: Value) {
        self.accessor_writers.insert(name, writer);
    }

    pub fn accessor_writer(&self, name: SymbolId) -> Option<Value> {
        self.accessor_writers.get(&name).map(|w| w.clone())
    }

    pub fn set_debugger_hook(&self, hook: Option<DebuggerHook>) {
        *self.debugger_hook.write().unwrap_or_else(|e| e.into_inner()) = hook;
    }

    pub fn debugger_hook(&self) -> Option<DebuggerHook> {
        self.debugger_hook.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Installs a host function as the global definition of an exported
    /// COMMON-LISP symbol.
    pub fn register_primitive(
        &self,
        name: &str,
        func: impl Fn(&mut Interpreter<'_>, &[Value]) -> EvalResult + Send + Sync + 'static,
    ) -> SymbolId {
        let mut symbols = self.symbols_mut();
        let sym = symbols.intern_exported(name, COMMON_LISP);
        symbols.set_symbol_function(sym, Value::native(name, func));
        sym
    }

    /// Like `register_primitive` for runtime helpers the compiler emits
    /// calls to; these stay internal to COMMON-LISP.
    pub fn register_internal(
        &self,
        name: &str,
        func: impl Fn(&mut Interpreter<'_>, &[Value]) -> EvalResult + Send + Sync + 'static,
    ) -> SymbolId {
        let mut symbols = self.symbols_mut();
        let sym = symbols.intern_in(name, COMMON_LISP);
        symbols.set_symbol_function(sym, Value::native(name, func));
        sym
    }
}

impl Default for GlobalContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::Visibility;

    #[test]
    fn test_constants_and_exports() {
        let globals = GlobalContext::new();
        let symbols = globals.symbols();
        assert!(symbols.is_constant(globals.wk.t));
        assert!(symbols.is_constant(globals.wk.nil));
        assert!(matches!(symbols.symbol_value(globals.wk.nil), Some(Value::Nil)));
        let (def, vis) = symbols.find_symbol("DEF", CL_USER).unwrap();
        assert_eq!(def, globals.wk.def);
        assert_eq!(vis, Visibility::Inherited);
        // Runtime helpers are not visible from CL-USER.
        assert!(symbols.find_symbol("%BLOCK", CL_USER).is_none());
    }

    #[test]
    fn test_primitives_installed() {
        let globals = GlobalContext::new();
        let symbols = globals.symbols();
        let (car, _) = symbols.find_symbol("CAR", CL_USER).unwrap();
        assert!(symbols.symbol_function(car).is_some());
        assert!(symbols.symbol_function(globals.wk.dynamic_let).is_some());
    }

    #[test]
    fn test_specials_and_macros() {
        let globals = GlobalContext::new();
        assert!(globals.is_special(globals.wk.package_var));
        assert!(globals.is_special(globals.print_vars.base));
        let sym = globals.intern("*COUNTER*", CL_USER);
        assert!(!globals.is_special(sym));
        globals.proclaim_special(sym);
        assert!(globals.is_special(sym));

        assert!(globals.macro_function(sym).is_none());
        globals.define_macro(sym, Value::Nil);
        assert!(globals.macros().contains_key(&sym));
    }

    #[test]
    fn test_dependencies() {
        let globals = GlobalContext::new();
        let f = globals.intern("F", CL_USER);
        let g = globals.intern("G", CL_USER);
        globals.record_dependencies(f, [g].into_iter().collect());
        assert_eq!(globals.dependencies_of(f), vec![g]);
        assert!(globals.dependencies_of(g).is_empty());
    }
}
