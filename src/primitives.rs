// HostCL Primitives - Built-in Functions
//
// Host implementations of the standard functions, plus the %-prefixed
// runtime helpers the compiler emits calls to. The helpers stay internal
// to COMMON-LISP; everything else is exported from it.

use std::cmp::Ordering;
use std::io::Write;
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, ToPrimitive, Zero};

use crate::clos::{
    self, ClassId, ClassKind, CombinationOperator, GenericFunction, Instance, Method, MethodCombination,
    SlotDefinition, Specializer,
};
use crate::compiler::{self, CompileError};
use crate::conditions::{
    self, handler_case, handler_bind, restart_case, Condition, Handler, HandlerOutcome, Restart, RestartOutcome,
    RestartSpec, RuntimeError,
};
use crate::context::GlobalContext;
use crate::dynamic::BindingFrame;
use crate::eval::{Caught, ControlSignal, EvalResult, Interpreter};
use crate::lambda_list::{self, LambdaShape, ParsedLambdaList};
use crate::printer;
use crate::reader;
use crate::symbol::{PackageError, PackageId, SymbolId, SymbolTable, COMMON_LISP, KEYWORD};
use crate::types::{Function, Value};

/// Register all standard primitives
pub fn install(ctx: &GlobalContext) {
    install_numbers(ctx);
    install_lists(ctx);
    install_sequences(ctx);
    install_predicates(ctx);
    install_strings(ctx);
    install_output(ctx);
    install_evaluation(ctx);
    install_symbols(ctx);
    install_packages(ctx);
    install_conditions(ctx);
    install_objects(ctx);
    install_runtime(ctx);
    log::debug!("primitives installed");
}

fn install_numbers(ctx: &GlobalContext) {
    // Arithmetic
    ctx.register_primitive("+", prim_add);
    ctx.register_primitive("-", prim_sub);
    ctx.register_primitive("*", prim_mul);
    ctx.register_primitive("/", prim_div);
    ctx.register_primitive("1+", prim_1plus);
    ctx.register_primitive("1-", prim_1minus);
    ctx.register_primitive("MOD", prim_mod);
    ctx.register_primitive("REM", prim_rem);
    ctx.register_primitive("FLOOR", |interp, args| prim_round(interp, "FLOOR", args, Rounding::Floor));
    ctx.register_primitive("CEILING", |interp, args| prim_round(interp, "CEILING", args, Rounding::Ceiling));
    ctx.register_primitive("TRUNCATE", |interp, args| prim_round(interp, "TRUNCATE", args, Rounding::Truncate));
    ctx.register_primitive("ABS", prim_abs);
    ctx.register_primitive("MAX", |interp, args| prim_extreme(interp, "MAX", args, Ordering::Greater));
    ctx.register_primitive("MIN", |interp, args| prim_extreme(interp, "MIN", args, Ordering::Less));
    ctx.register_primitive("EXPT", prim_expt);
    ctx.register_primitive("SQRT", prim_sqrt);
    ctx.register_primitive("FLOAT", prim_float);

    // Comparison
    ctx.register_primitive("=", |interp, args| compare_chain(interp, "=", args, Ordering::is_eq));
    ctx.register_primitive("<", |interp, args| compare_chain(interp, "<", args, Ordering::is_lt));
    ctx.register_primitive(">", |interp, args| compare_chain(interp, ">", args, Ordering::is_gt));
    ctx.register_primitive("<=", |interp, args| compare_chain(interp, "<=", args, Ordering::is_le));
    ctx.register_primitive(">=", |interp, args| compare_chain(interp, ">=", args, Ordering::is_ge));
    ctx.register_primitive("/=", prim_not_equal);

    ctx.register_primitive("ZEROP", |interp, args| sign_test(interp, "ZEROP", args, Ordering::is_eq));
    ctx.register_primitive("PLUSP", |interp, args| sign_test(interp, "PLUSP", args, Ordering::is_gt));
    ctx.register_primitive("MINUSP", |interp, args| sign_test(interp, "MINUSP", args, Ordering::is_lt));
    ctx.register_primitive("EVENP", |interp, args| parity(interp, "EVENP", args, true));
    ctx.register_primitive("ODDP", |interp, args| parity(interp, "ODDP", args, false));
}

fn install_lists(ctx: &GlobalContext) {
    ctx.register_primitive("CAR", prim_car);
    ctx.register_primitive("FIRST", prim_car);
    ctx.register_primitive("CDR", prim_cdr);
    ctx.register_primitive("REST", prim_cdr);
    ctx.register_primitive("SECOND", |interp, args| nth_of(interp, "SECOND", args, 1));
    ctx.register_primitive("THIRD", |interp, args| nth_of(interp, "THIRD", args, 2));
    ctx.register_primitive("CONS", prim_cons);
    ctx.register_primitive("LIST", |_, args| Ok(Value::list(args.to_vec())));
    ctx.register_primitive("LIST*", prim_list_star);
    ctx.register_primitive("APPEND", prim_append);
    ctx.register_primitive("NTH", prim_nth);
    ctx.register_primitive("NTHCDR", prim_nthcdr);
    ctx.register_primitive("LAST", prim_last);
    ctx.register_primitive("BUTLAST", prim_butlast);
    ctx.register_primitive("COPY-LIST", prim_copy_list);
    ctx.register_primitive("MAKE-LIST", prim_make_list);
    ctx.register_primitive("MEMBER", prim_member);
    ctx.register_primitive("ASSOC", prim_assoc);
    ctx.register_primitive("GETF", prim_getf);
    ctx.register_primitive("MAPCAR", prim_mapcar);
    ctx.register_primitive("MAPC", prim_mapc);
    ctx.register_primitive("MAPCAN", prim_mapcan);
}

fn install_sequences(ctx: &GlobalContext) {
    ctx.register_primitive("LENGTH", prim_length);
    ctx.register_primitive("REVERSE", prim_reverse);
    ctx.register_primitive("ELT", prim_elt);
    ctx.register_primitive("AREF", prim_elt);
    ctx.register_primitive("SUBSEQ", prim_subseq);
    ctx.register_primitive("VECTOR", |_, args| Ok(Value::vector(args.to_vec())));
    ctx.register_primitive("CONCATENATE", prim_concatenate);
    ctx.register_primitive("COERCE", prim_coerce);
    ctx.register_primitive("REDUCE", prim_reduce);
    ctx.register_primitive("REMOVE", prim_remove);
    ctx.register_primitive("REMOVE-IF", |interp, args| remove_by(interp, "REMOVE-IF", args, true));
    ctx.register_primitive("REMOVE-IF-NOT", |interp, args| remove_by(interp, "REMOVE-IF-NOT", args, false));
    ctx.register_primitive("FIND", prim_find);
    ctx.register_primitive("FIND-IF", prim_find_if);
    ctx.register_primitive("POSITION", prim_position);
    ctx.register_primitive("POSITION-IF", prim_position_if);
    ctx.register_primitive("COUNT", prim_count);
    ctx.register_primitive("COUNT-IF", prim_count_if);
    ctx.register_primitive("EVERY", prim_every);
    ctx.register_primitive("SOME", prim_some);
    ctx.register_primitive("SORT", prim_sort);
    ctx.register_primitive("STABLE-SORT", prim_sort);
}

fn install_predicates(ctx: &GlobalContext) {
    ctx.register_primitive("EQ", |interp, args| binary_test(interp, "EQ", args, Value::eq));
    ctx.register_primitive("EQL", |interp, args| binary_test(interp, "EQL", args, Value::eql));
    ctx.register_primitive("EQUAL", |interp, args| binary_test(interp, "EQUAL", args, Value::equal));
    ctx.register_primitive("NOT", |interp, args| type_test(interp, "NOT", args, Value::is_nil));
    ctx.register_primitive("NULL", |interp, args| type_test(interp, "NULL", args, Value::is_nil));
    ctx.register_primitive("ATOM", |interp, args| type_test(interp, "ATOM", args, |v| !matches!(v, Value::List(_))));
    ctx.register_primitive("CONSP", |interp, args| type_test(interp, "CONSP", args, |v| matches!(v, Value::List(_))));
    ctx.register_primitive("LISTP", |interp, args| {
        type_test(interp, "LISTP", args, |v| matches!(v, Value::List(_) | Value::Nil))
    });
    ctx.register_primitive("ENDP", prim_endp);
    ctx.register_primitive("NUMBERP", |interp, args| type_test(interp, "NUMBERP", args, Value::is_number));
    ctx.register_primitive("INTEGERP", |interp, args| {
        type_test(interp, "INTEGERP", args, |v| matches!(v, Value::Integer(_) | Value::BigInt(_)))
    });
    ctx.register_primitive("FLOATP", |interp, args| type_test(interp, "FLOATP", args, |v| matches!(v, Value::Float(_))));
    ctx.register_primitive("SYMBOLP", |interp, args| {
        type_test(interp, "SYMBOLP", args, |v| matches!(v, Value::Symbol(_) | Value::Nil))
    });
    ctx.register_primitive("STRINGP", |interp, args| type_test(interp, "STRINGP", args, |v| matches!(v, Value::String(_))));
    ctx.register_primitive("CHARACTERP", |interp, args| {
        type_test(interp, "CHARACTERP", args, |v| matches!(v, Value::Char(_)))
    });
    ctx.register_primitive("VECTORP", |interp, args| {
        type_test(interp, "VECTORP", args, |v| matches!(v, Value::Vector(_) | Value::String(_)))
    });
    ctx.register_primitive("FUNCTIONP", |interp, args| {
        type_test(interp, "FUNCTIONP", args, |v| matches!(v, Value::Function(_)))
    });
    ctx.register_primitive("PACKAGEP", |interp, args| {
        type_test(interp, "PACKAGEP", args, |v| matches!(v, Value::Package(_)))
    });
    ctx.register_primitive("KEYWORDP", prim_keywordp);
}

fn install_strings(ctx: &GlobalContext) {
    ctx.register_primitive("STRING", prim_string);
    ctx.register_primitive("STRING=", |interp, args| string_compare(interp, "STRING=", args, Ordering::is_eq));
    ctx.register_primitive("STRING<", |interp, args| string_compare(interp, "STRING<", args, Ordering::is_lt));
    ctx.register_primitive("STRING>", |interp, args| string_compare(interp, "STRING>", args, Ordering::is_gt));
    ctx.register_primitive("STRING-UPCASE", |interp, args| {
        string_map(interp, "STRING-UPCASE", args, |s| s.to_uppercase())
    });
    ctx.register_primitive("STRING-DOWNCASE", |interp, args| {
        string_map(interp, "STRING-DOWNCASE", args, |s| s.to_lowercase())
    });
    ctx.register_primitive("STRING-TRIM", prim_string_trim);
    ctx.register_primitive("SEARCH", prim_search);
    ctx.register_primitive("CHAR", prim_char);
    ctx.register_primitive("CHAR-CODE", prim_char_code);
    ctx.register_primitive("CODE-CHAR", prim_code_char);
    ctx.register_primitive("CHAR-UPCASE", |interp, args| char_map(interp, "CHAR-UPCASE", args, |c| c.to_ascii_uppercase()));
    ctx.register_primitive("CHAR-DOWNCASE", |interp, args| {
        char_map(interp, "CHAR-DOWNCASE", args, |c| c.to_ascii_lowercase())
    });
    ctx.register_primitive("CHAR=", |interp, args| char_compare(interp, "CHAR=", args, Ordering::is_eq));
    ctx.register_primitive("CHAR<", |interp, args| char_compare(interp, "CHAR<", args, Ordering::is_lt));
    ctx.register_primitive("PARSE-INTEGER", prim_parse_integer);
    ctx.register_primitive("PRIN1-TO-STRING", |interp, args| to_string(interp, "PRIN1-TO-STRING", args, true));
    ctx.register_primitive("PRINC-TO-STRING", |interp, args| to_string(interp, "PRINC-TO-STRING", args, false));
    ctx.register_primitive("WRITE-TO-STRING", |interp, args| to_string(interp, "WRITE-TO-STRING", args, true));
}

fn install_output(ctx: &GlobalContext) {
    ctx.register_primitive("PRINT", prim_print);
    ctx.register_primitive("PRIN1", |interp, args| write_object(interp, "PRIN1", args, true));
    ctx.register_primitive("PRINC", |interp, args| write_object(interp, "PRINC", args, false));
    ctx.register_primitive("WRITE-STRING", prim_write_string);
    ctx.register_primitive("TERPRI", |_, _| {
        emit("\n");
        Ok(Value::Nil)
    });
    ctx.register_primitive("FORMAT", prim_format);
}

fn install_evaluation(ctx: &GlobalContext) {
    ctx.register_primitive("FUNCALL", prim_funcall);
    ctx.register_primitive("APPLY", prim_apply);
    ctx.register_primitive("EVAL", prim_eval);
    ctx.register_primitive("IDENTITY", |interp, args| {
        arity(interp, "IDENTITY", args, 1, Some(1))?;
        Ok(args[0].clone())
    });
    ctx.register_primitive("VALUES", |_, args| Ok(args.first().cloned().unwrap_or(Value::Nil)));
    ctx.register_primitive("COMPLEMENT", prim_complement);
    ctx.register_primitive("MACRO-FUNCTION", prim_macro_function);
    ctx.register_primitive("MACROEXPAND-1", prim_macroexpand_1);
    ctx.register_primitive("MACROEXPAND", prim_macroexpand);
    ctx.register_primitive("READ-FROM-STRING", prim_read_from_string);
    ctx.register_primitive("LOAD", prim_load);
    ctx.register_primitive("FUNCTION-DEPENDENCIES", prim_function_dependencies);
}

fn install_symbols(ctx: &GlobalContext) {
    ctx.register_primitive("SYMBOL-NAME", prim_symbol_name);
    ctx.register_primitive("SYMBOL-PACKAGE", prim_symbol_package);
    ctx.register_primitive("SYMBOL-VALUE", prim_symbol_value);
    let symbol_function = ctx.register_primitive("SYMBOL-FUNCTION", prim_symbol_function);
    ctx.set_accessor_writer(
        symbol_function,
        Value::native("(SETF SYMBOL-FUNCTION)", |interp, args| {
            arity(interp, "(SETF SYMBOL-FUNCTION)", args, 2, Some(2))?;
            let sym = symbol_arg(interp, &args[1])?;
            interp.globals.symbols_mut().set_symbol_function(sym, args[0].clone());
            Ok(args[0].clone())
        }),
    );
    ctx.register_primitive("BOUNDP", prim_boundp);
    ctx.register_primitive("FBOUNDP", prim_fboundp);
    ctx.register_primitive("SET", prim_set);
    ctx.register_primitive("MAKUNBOUND", prim_makunbound);
    ctx.register_primitive("FMAKUNBOUND", prim_fmakunbound);
    ctx.register_primitive("GENSYM", prim_gensym);
    ctx.register_primitive("MAKE-SYMBOL", prim_make_symbol);
}

fn install_packages(ctx: &GlobalContext) {
    ctx.register_primitive("INTERN", prim_intern);
    ctx.register_primitive("FIND-SYMBOL", prim_find_symbol);
    ctx.register_primitive("FIND-PACKAGE", prim_find_package);
    ctx.register_primitive("MAKE-PACKAGE", prim_make_package);
    ctx.register_primitive("PACKAGE-NAME", prim_package_name);
    ctx.register_primitive("PACKAGE-USE-LIST", prim_package_use_list);
    ctx.register_primitive("USE-PACKAGE", prim_use_package);
    ctx.register_primitive("EXPORT", |interp, args| {
        symbol_operation(interp, "EXPORT", args, |symbols, syms, pkg| symbols.export(syms, pkg))
    });
    ctx.register_primitive("UNEXPORT", |interp, args| {
        symbol_operation(interp, "UNEXPORT", args, |symbols, syms, pkg| symbols.unexport(syms, pkg))
    });
    ctx.register_primitive("IMPORT", |interp, args| {
        symbol_operation(interp, "IMPORT", args, |symbols, syms, pkg| symbols.import(syms, pkg))
    });
    ctx.register_primitive("SHADOW", prim_shadow);
}

fn install_conditions(ctx: &GlobalContext) {
    ctx.register_primitive("SIGNAL", prim_signal);
    ctx.register_primitive("ERROR", prim_error);
    ctx.register_primitive("CERROR", prim_cerror);
    ctx.register_primitive("WARN", prim_warn);
    ctx.register_primitive("MAKE-CONDITION", prim_make_condition);
    ctx.register_primitive("SIMPLE-CONDITION-FORMAT-CONTROL", prim_format_control);
    ctx.register_primitive("SIMPLE-CONDITION-FORMAT-ARGUMENTS", prim_format_arguments);
    ctx.register_primitive("COMPUTE-RESTARTS", prim_compute_restarts);
    ctx.register_primitive("FIND-RESTART", prim_find_restart);
    ctx.register_primitive("INVOKE-RESTART", prim_invoke_restart);
    ctx.register_primitive("INVOKE-RESTART-INTERACTIVELY", prim_invoke_restart_interactively);
    ctx.register_primitive("RESTART-NAME", prim_restart_name);

    // Restart functions
    ctx.register_primitive("ABORT", |interp, args| {
        let name = interp.globals.wk.abort;
        standard_restart(interp, "ABORT", name, args, false, true)
    });
    ctx.register_primitive("MUFFLE-WARNING", |interp, args| {
        let name = interp.globals.wk.muffle_warning;
        standard_restart(interp, "MUFFLE-WARNING", name, args, false, true)
    });
    ctx.register_primitive("CONTINUE", |interp, args| {
        let name = interp.globals.wk.continue_;
        standard_restart(interp, "CONTINUE", name, args, false, false)
    });
    ctx.register_primitive("USE-VALUE", |interp, args| {
        let name = interp.globals.wk.use_value;
        standard_restart(interp, "USE-VALUE", name, args, true, false)
    });
    ctx.register_primitive("STORE-VALUE", |interp, args| {
        let name = interp.globals.wk.store_value;
        standard_restart(interp, "STORE-VALUE", name, args, true, false)
    });
}

fn install_objects(ctx: &GlobalContext) {
    ctx.register_primitive("MAKE-INSTANCE", prim_make_instance);
    ctx.register_primitive("SLOT-VALUE", prim_slot_value);
    ctx.register_primitive("SLOT-BOUNDP", prim_slot_boundp);
    ctx.register_primitive("SLOT-EXISTS-P", prim_slot_exists_p);
    ctx.register_primitive("CLASS-OF", |interp, args| {
        arity(interp, "CLASS-OF", args, 1, Some(1))?;
        Ok(Value::Class(interp.class_of(&args[0])))
    });
    ctx.register_primitive("FIND-CLASS", prim_find_class);
    ctx.register_primitive("CLASS-NAME", prim_class_name);
    ctx.register_primitive("CLASS-PRECEDENCE-LIST", prim_class_precedence_list);
    ctx.register_primitive("TYPEP", prim_typep);
    ctx.register_primitive("SUBTYPEP", prim_subtypep);
}

fn install_runtime(ctx: &GlobalContext) {
    // Control transfer
    ctx.register_internal("%BLOCK", prim_block);
    ctx.register_internal("%CATCH", prim_catch);
    ctx.register_internal("%THROW", prim_throw);
    ctx.register_internal("%DYNAMIC-LET", prim_dynamic_let);

    // Variables and places
    ctx.register_internal("%UNSUPPLIED-P", |interp, args| {
        Ok(boolean(interp, args.first().is_some_and(|v| matches!(v, Value::Unbound))))
    });
    ctx.register_internal("%SET-GLOBAL", prim_set_global);
    ctx.register_internal("%GLOBAL-UNBOUND-P", prim_global_unbound_p);
    ctx.register_internal("%GETF", prim_internal_getf);
    ctx.register_internal("%PLIST-HAS", prim_plist_has);
    ctx.register_internal("%SET-SLOT-VALUE", prim_set_slot_value);
    ctx.register_internal("%SETF-ACCESSOR", prim_setf_accessor);
    ctx.register_internal("%IN-PACKAGE", prim_in_package);
    ctx.register_internal("%RANGE", prim_range);

    // Conditions
    ctx.register_internal("%HANDLER-CASE", prim_handler_case);
    ctx.register_internal("%HANDLER-BIND", prim_handler_bind);
    ctx.register_internal("%RESTART-CASE", prim_restart_case);
    ctx.register_internal("%RESTART-BIND", prim_restart_bind);

    // Objects
    ctx.register_internal("%DEFCLASS", |interp, args| define_class(interp, "%DEFCLASS", args, ClassKind::Standard));
    ctx.register_internal("%DEFINE-CONDITION", |interp, args| {
        define_class(interp, "%DEFINE-CONDITION", args, ClassKind::Condition)
    });
    ctx.register_internal("%DEFGENERIC", prim_defgeneric);
    ctx.register_internal("%DEFMETHOD", prim_defmethod);
    ctx.register_internal("%CALL-NEXT-METHOD", prim_call_next_method);
    ctx.register_internal("%NEXT-METHOD-P", prim_next_method_p);
}

// ============================================================================
// Argument helpers
// ============================================================================

fn arity(
    interp: &mut Interpreter<'_>,
    function: &str,
    args: &[Value],
    min: usize,
    max: Option<usize>,
) -> Result<(), ControlSignal> {
    if args.len() >= min && max.map_or(true, |m| args.len() <= m) {
        return Ok(());
    }
    let expected = match max {
        Some(m) if m == min => min.to_string(),
        Some(m) => format!("between {} and {}", min, m),
        None => format!("at least {}", min),
    };
    Err(interp.raise(RuntimeError::ArgumentCount {
        function: function.to_string(),
        expected,
        got: args.len(),
    }))
}

fn type_error(interp: &mut Interpreter<'_>, datum: &Value, expected: &str) -> ControlSignal {
    let datum = interp.prin1_to_string(datum);
    interp.raise(RuntimeError::TypeError {
        datum,
        expected: expected.to_string(),
    })
}

fn simple_error(interp: &mut Interpreter<'_>, message: String) -> ControlSignal {
    interp.raise(RuntimeError::Simple(message))
}

fn boolean(interp: &Interpreter<'_>, b: bool) -> Value {
    Value::bool(b, interp.globals.wk.t)
}

fn list_arg<'v>(interp: &mut Interpreter<'_>, value: &'v Value) -> Result<&'v [Value], ControlSignal> {
    match value.as_list() {
        Some(items) => Ok(items),
        None => Err(type_error(interp, value, "LIST")),
    }
}

/// Elements of a list, vector or string.
fn sequence_items(interp: &mut Interpreter<'_>, value: &Value) -> Result<Vec<Value>, ControlSignal> {
    match value {
        Value::String(s) => Ok(s.chars().map(Value::Char).collect()),
        other => match other.as_sequence() {
            Some(items) => Ok(items.to_vec()),
            None => Err(type_error(interp, other, "SEQUENCE")),
        },
    }
}

/// Builds a sequence of the same kind as `like`.
fn rebuild(interp: &mut Interpreter<'_>, like: &Value, items: Vec<Value>) -> EvalResult {
    match like {
        Value::Vector(_) => Ok(Value::vector(items)),
        Value::String(_) => chars_to_string(interp, &items),
        _ => Ok(Value::list(items)),
    }
}

fn chars_to_string(interp: &mut Interpreter<'_>, items: &[Value]) -> EvalResult {
    let mut out = String::with_capacity(items.len());
    for item in items {
        match item {
            Value::Char(c) => out.push(*c),
            other => return Err(type_error(interp, other, "CHARACTER")),
        }
    }
    Ok(Value::string(&out))
}

fn symbol_arg(interp: &mut Interpreter<'_>, value: &Value) -> Result<SymbolId, ControlSignal> {
    match value {
        Value::Symbol(s) => Ok(*s),
        Value::Nil => Ok(interp.globals.wk.nil),
        other => Err(type_error(interp, other, "SYMBOL")),
    }
}

/// A symbol, or a list of symbols.
fn symbols_of(interp: &mut Interpreter<'_>, value: &Value) -> Result<Vec<SymbolId>, ControlSignal> {
    match value {
        Value::Symbol(s) => Ok(vec![*s]),
        Value::Nil => Ok(Vec::new()),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(symbol_arg(interp, item)?);
            }
            Ok(out)
        }
        other => Err(type_error(interp, other, "LIST")),
    }
}

fn index_arg(interp: &mut Interpreter<'_>, value: &Value) -> Result<usize, ControlSignal> {
    match value {
        Value::Integer(i) if *i >= 0 => Ok(*i as usize),
        other => Err(type_error(interp, other, "(INTEGER 0)")),
    }
}

fn char_arg(interp: &mut Interpreter<'_>, value: &Value) -> Result<char, ControlSignal> {
    match value {
        Value::Char(c) => Ok(*c),
        other => Err(type_error(interp, other, "CHARACTER")),
    }
}

/// The name a string designator stands for.
fn string_designator(interp: &mut Interpreter<'_>, value: &Value) -> Result<String, ControlSignal> {
    match value {
        Value::String(s) => Ok(s.to_string()),
        Value::Symbol(s) => Ok(interp.symbol_name(*s)),
        Value::Nil => Ok("NIL".to_string()),
        Value::Char(c) => Ok(c.to_string()),
        other => Err(type_error(interp, other, "STRING DESIGNATOR")),
    }
}

fn keyword_id(interp: &Interpreter<'_>, name: &str) -> SymbolId {
    interp.globals.intern(name, KEYWORD)
}

/// Value of `:name` among keyword/value pairs; the first occurrence wins.
fn keyword_option(interp: &Interpreter<'_>, options: &[Value], name: &str) -> Option<Value> {
    let key = keyword_id(interp, name);
    options
        .chunks(2)
        .find(|pair| pair.len() == 2 && pair[0].as_symbol() == Some(key))
        .map(|pair| pair[1].clone())
}

/// Applies a :TEST option, defaulting to EQL.
fn test_match(
    interp: &mut Interpreter<'_>,
    test: Option<&Value>,
    item: &Value,
    candidate: &Value,
) -> Result<bool, ControlSignal> {
    match test {
        Some(f) => Ok(interp.apply(f, &[item.clone(), candidate.clone()])?.is_true()),
        None => Ok(item.eql(candidate)),
    }
}

fn package_arg(interp: &mut Interpreter<'_>, value: &Value) -> Result<PackageId, ControlSignal> {
    if let Value::Package(p) = value {
        return Ok(*p);
    }
    let name = string_designator(interp, value)?;
    let found = interp.globals.symbols().require_package(&name);
    found.map_err(|e| interp.raise(e))
}

/// The optional package argument at `index`, defaulting to *PACKAGE*.
fn optional_package(interp: &mut Interpreter<'_>, args: &[Value], index: usize) -> Result<PackageId, ControlSignal> {
    match args.get(index) {
        Some(designator) => package_arg(interp, designator),
        None => Ok(interp.current_package()),
    }
}

fn class_arg(interp: &mut Interpreter<'_>, value: &Value) -> Result<ClassId, ControlSignal> {
    match value {
        Value::Class(c) => Ok(*c),
        Value::Symbol(s) => {
            let found = interp.globals.classes().find_class(*s);
            match found {
                Some(c) => Ok(c),
                None => {
                    let name = interp.symbol_name(*s);
                    Err(interp.raise(RuntimeError::NoSuchClass(name)))
                }
            }
        }
        other => Err(type_error(interp, other, "CLASS DESIGNATOR")),
    }
}

fn emit(text: &str) {
    let mut out = std::io::stdout().lock();
    if out.write_all(text.as_bytes()).and_then(|_| out.flush()).is_err() {
        log::warn!("could not write to standard output");
    }
}

// ============================================================================
// Numbers
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
}

fn as_bigint(value: &Value) -> Option<BigInt> {
    match value {
        Value::Integer(i) => Some(BigInt::from(*i)),
        Value::BigInt(b) => Some((**b).clone()),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::BigInt(b) => b.to_f64(),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn not_a_number(interp: &mut Interpreter<'_>, a: &Value, b: &Value) -> ControlSignal {
    let culprit = if a.is_number() { b } else { a };
    type_error(interp, culprit, "NUMBER")
}

/// Fixnum arithmetic that overflows into bignums; floats are contagious.
fn arith2(interp: &mut Interpreter<'_>, op: Arith, a: &Value, b: &Value) -> EvalResult {
    if let (Value::Integer(x), Value::Integer(y)) = (a, b) {
        let fast = match op {
            Arith::Add => x.checked_add(*y),
            Arith::Sub => x.checked_sub(*y),
            Arith::Mul => x.checked_mul(*y),
        };
        if let Some(n) = fast {
            return Ok(Value::Integer(n));
        }
    }
    if let (Some(x), Some(y)) = (as_bigint(a), as_bigint(b)) {
        return Ok(Value::from_bigint(match op {
            Arith::Add => x + y,
            Arith::Sub => x - y,
            Arith::Mul => x * y,
        }));
    }
    match (as_float(a), as_float(b)) {
        (Some(x), Some(y)) => Ok(Value::Float(match op {
            Arith::Add => x + y,
            Arith::Sub => x - y,
            Arith::Mul => x * y,
        })),
        _ => Err(not_a_number(interp, a, b)),
    }
}

pub fn add2(interp: &mut Interpreter<'_>, a: &Value, b: &Value) -> EvalResult {
    arith2(interp, Arith::Add, a, b)
}

/// Numeric ordering of two reals.
pub fn compare2(interp: &mut Interpreter<'_>, a: &Value, b: &Value) -> Result<Ordering, ControlSignal> {
    if let (Value::Integer(x), Value::Integer(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    if let (Some(x), Some(y)) = (as_bigint(a), as_bigint(b)) {
        return Ok(x.cmp(&y));
    }
    match (as_float(a), as_float(b)) {
        (Some(x), Some(y)) => Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal)),
        _ => Err(not_a_number(interp, a, b)),
    }
}

/// Exact when the division is exact, a float otherwise.
fn div2(interp: &mut Interpreter<'_>, a: &Value, b: &Value) -> EvalResult {
    if let (Some(x), Some(y)) = (as_bigint(a), as_bigint(b)) {
        if y.is_zero() {
            return Err(interp.raise(RuntimeError::DivisionByZero));
        }
        if (&x % &y).is_zero() {
            return Ok(Value::from_bigint(x / y));
        }
    }
    match (as_float(a), as_float(b)) {
        (Some(_), Some(y)) if y == 0.0 => Err(interp.raise(RuntimeError::DivisionByZero)),
        (Some(x), Some(y)) => Ok(Value::Float(x / y)),
        _ => Err(not_a_number(interp, a, b)),
    }
}

fn fold_numbers(
    interp: &mut Interpreter<'_>,
    initial: Value,
    args: &[Value],
    op: fn(&mut Interpreter<'_>, &Value, &Value) -> EvalResult,
) -> EvalResult {
    let mut acc = initial;
    for arg in args {
        acc = op(interp, &acc, arg)?;
    }
    Ok(acc)
}

fn prim_add(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    fold_numbers(interp, Value::Integer(0), args, add2)
}

fn sub2(interp: &mut Interpreter<'_>, a: &Value, b: &Value) -> EvalResult {
    arith2(interp, Arith::Sub, a, b)
}

fn mul2(interp: &mut Interpreter<'_>, a: &Value, b: &Value) -> EvalResult {
    arith2(interp, Arith::Mul, a, b)
}

fn prim_mul(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    fold_numbers(interp, Value::Integer(1), args, mul2)
}

fn prim_sub(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "-", args, 1, None)?;
    match args {
        [only] => sub2(interp, &Value::Integer(0), only),
        [first, rest @ ..] => fold_numbers(interp, first.clone(), rest, sub2),
        [] => Ok(Value::Integer(0)),
    }
}

fn prim_div(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "/", args, 1, None)?;
    match args {
        [only] => div2(interp, &Value::Integer(1), only),
        [first, rest @ ..] => fold_numbers(interp, first.clone(), rest, div2),
        [] => Ok(Value::Integer(1)),
    }
}

fn prim_1plus(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "1+", args, 1, Some(1))?;
    add2(interp, &args[0], &Value::Integer(1))
}

fn prim_1minus(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "1-", args, 1, Some(1))?;
    sub2(interp, &args[0], &Value::Integer(1))
}

#[derive(Clone, Copy)]
enum Rounding {
    Floor,
    Ceiling,
    Truncate,
}

fn float_to_integer(interp: &mut Interpreter<'_>, f: f64) -> EvalResult {
    match BigInt::from_f64(f) {
        Some(n) => Ok(Value::from_bigint(n)),
        None => Err(type_error(interp, &Value::Float(f), "FINITE FLOAT")),
    }
}

/// FLOOR, CEILING and TRUNCATE; only the quotient is returned.
fn prim_round(interp: &mut Interpreter<'_>, name: &str, args: &[Value], mode: Rounding) -> EvalResult {
    arity(interp, name, args, 1, Some(2))?;
    let divisor = args.get(1).cloned().unwrap_or(Value::Integer(1));
    let dividend = &args[0];
    if let (Some(x), Some(y)) = (as_bigint(dividend), as_bigint(&divisor)) {
        if y.is_zero() {
            return Err(interp.raise(RuntimeError::DivisionByZero));
        }
        let mut q = &x / &y;
        let r = &x % &y;
        if !r.is_zero() {
            let same_sign = r.is_negative() == y.is_negative();
            match mode {
                Rounding::Floor if !same_sign => q -= BigInt::from(1),
                Rounding::Ceiling if same_sign => q += BigInt::from(1),
                _ => {}
            }
        }
        return Ok(Value::from_bigint(q));
    }
    match (as_float(dividend), as_float(&divisor)) {
        (Some(_), Some(y)) if y == 0.0 => Err(interp.raise(RuntimeError::DivisionByZero)),
        (Some(x), Some(y)) => {
            let q = x / y;
            let rounded = match mode {
                Rounding::Floor => q.floor(),
                Rounding::Ceiling => q.ceil(),
                Rounding::Truncate => q.trunc(),
            };
            float_to_integer(interp, rounded)
        }
        _ => Err(not_a_number(interp, dividend, &divisor)),
    }
}

fn modulo(interp: &mut Interpreter<'_>, name: &str, args: &[Value], floor: bool) -> EvalResult {
    arity(interp, name, args, 2, Some(2))?;
    let (a, b) = (&args[0], &args[1]);
    if let (Some(x), Some(y)) = (as_bigint(a), as_bigint(b)) {
        if y.is_zero() {
            return Err(interp.raise(RuntimeError::DivisionByZero));
        }
        let r = &x % &y;
        if floor && !r.is_zero() && r.is_negative() != y.is_negative() {
            return Ok(Value::from_bigint(r + y));
        }
        return Ok(Value::from_bigint(r));
    }
    match (as_float(a), as_float(b)) {
        (Some(_), Some(y)) if y == 0.0 => Err(interp.raise(RuntimeError::DivisionByZero)),
        (Some(x), Some(y)) => {
            let r = x % y;
            if floor && r != 0.0 && (r < 0.0) != (y < 0.0) {
                Ok(Value::Float(r + y))
            } else {
                Ok(Value::Float(r))
            }
        }
        _ => Err(not_a_number(interp, a, b)),
    }
}

fn prim_mod(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    modulo(interp, "MOD", args, true)
}

fn prim_rem(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    modulo(interp, "REM", args, false)
}

fn prim_abs(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "ABS", args, 1, Some(1))?;
    match &args[0] {
        Value::Integer(i) => Ok(match i.checked_abs() {
            Some(n) => Value::Integer(n),
            None => Value::from_bigint(BigInt::from(*i).abs()),
        }),
        Value::BigInt(b) => Ok(Value::from_bigint(b.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(type_error(interp, other, "NUMBER")),
    }
}

fn prim_extreme(interp: &mut Interpreter<'_>, name: &str, args: &[Value], keep: Ordering) -> EvalResult {
    arity(interp, name, args, 1, None)?;
    let mut best = args[0].clone();
    if !best.is_number() {
        return Err(type_error(interp, &best, "REAL"));
    }
    for arg in &args[1..] {
        if compare2(interp, arg, &best)? == keep {
            best = arg.clone();
        }
    }
    Ok(best)
}

fn prim_expt(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "EXPT", args, 2, Some(2))?;
    let (base, power) = (&args[0], &args[1]);
    if let (Some(b), Value::Integer(p)) = (as_bigint(base), power) {
        if let Ok(p) = u32::try_from(*p) {
            return Ok(Value::from_bigint(b.pow(p)));
        }
    }
    match (as_float(base), as_float(power)) {
        (Some(b), Some(p)) => Ok(Value::Float(b.powf(p))),
        _ => Err(not_a_number(interp, base, power)),
    }
}

fn prim_sqrt(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SQRT", args, 1, Some(1))?;
    match as_float(&args[0]) {
        Some(x) if x >= 0.0 => Ok(Value::Float(x.sqrt())),
        Some(_) => Err(simple_error(interp, "SQRT of a negative number has no real result".to_string())),
        None => Err(type_error(interp, &args[0], "REAL")),
    }
}

fn prim_float(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FLOAT", args, 1, Some(2))?;
    match as_float(&args[0]) {
        Some(f) => Ok(Value::Float(f)),
        None => Err(type_error(interp, &args[0], "REAL")),
    }
}

fn compare_chain(interp: &mut Interpreter<'_>, name: &str, args: &[Value], accept: fn(Ordering) -> bool) -> EvalResult {
    arity(interp, name, args, 1, None)?;
    if !args[0].is_number() {
        return Err(type_error(interp, &args[0], "REAL"));
    }
    for pair in args.windows(2) {
        if !accept(compare2(interp, &pair[0], &pair[1])?) {
            return Ok(Value::Nil);
        }
    }
    Ok(boolean(interp, true))
}

fn prim_not_equal(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "/=", args, 1, None)?;
    for (i, a) in args.iter().enumerate() {
        for b in &args[i + 1..] {
            if compare2(interp, a, b)?.is_eq() {
                return Ok(Value::Nil);
            }
        }
    }
    Ok(boolean(interp, true))
}

fn sign_test(interp: &mut Interpreter<'_>, name: &str, args: &[Value], accept: fn(Ordering) -> bool) -> EvalResult {
    arity(interp, name, args, 1, Some(1))?;
    let ord = compare2(interp, &args[0], &Value::Integer(0))?;
    Ok(boolean(interp, accept(ord)))
}

fn parity(interp: &mut Interpreter<'_>, name: &str, args: &[Value], even: bool) -> EvalResult {
    arity(interp, name, args, 1, Some(1))?;
    let is_even = match &args[0] {
        Value::Integer(i) => i % 2 == 0,
        Value::BigInt(b) => (&**b % 2u32).is_zero(),
        other => return Err(type_error(interp, other, "INTEGER")),
    };
    Ok(boolean(interp, is_even == even))
}

// ============================================================================
// Lists
// ============================================================================

fn prim_car(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "CAR", args, 1, Some(1))?;
    let items = list_arg(interp, &args[0])?;
    Ok(items.first().cloned().unwrap_or(Value::Nil))
}

fn prim_cdr(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "CDR", args, 1, Some(1))?;
    let items = list_arg(interp, &args[0])?;
    Ok(Value::list(items.get(1..).map(<[Value]>::to_vec).unwrap_or_default()))
}

fn nth_of(interp: &mut Interpreter<'_>, name: &str, args: &[Value], n: usize) -> EvalResult {
    arity(interp, name, args, 1, Some(1))?;
    let items = list_arg(interp, &args[0])?;
    Ok(items.get(n).cloned().unwrap_or(Value::Nil))
}

/// Lists are proper, so the second argument must itself be a list.
fn prim_cons(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "CONS", args, 2, Some(2))?;
    let tail = list_arg(interp, &args[1])?;
    let mut items = Vec::with_capacity(tail.len() + 1);
    items.push(args[0].clone());
    items.extend(tail.iter().cloned());
    Ok(Value::list(items))
}

fn prim_list_star(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "LIST*", args, 1, None)?;
    let Some((last, init)) = args.split_last() else {
        return Ok(Value::Nil);
    };
    let tail = list_arg(interp, last)?;
    let mut items = init.to_vec();
    items.extend(tail.iter().cloned());
    Ok(Value::list(items))
}

fn prim_append(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let mut items = Vec::new();
    for arg in args {
        items.extend(list_arg(interp, arg)?.iter().cloned());
    }
    Ok(Value::list(items))
}

fn prim_nth(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "NTH", args, 2, Some(2))?;
    let n = index_arg(interp, &args[0])?;
    let items = list_arg(interp, &args[1])?;
    Ok(items.get(n).cloned().unwrap_or(Value::Nil))
}

fn prim_nthcdr(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "NTHCDR", args, 2, Some(2))?;
    let n = index_arg(interp, &args[0])?;
    let items = list_arg(interp, &args[1])?;
    Ok(Value::list(items.get(n..).map(<[Value]>::to_vec).unwrap_or_default()))
}

fn prim_last(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "LAST", args, 1, Some(2))?;
    let n = match args.get(1) {
        Some(v) => index_arg(interp, v)?,
        None => 1,
    };
    let items = list_arg(interp, &args[0])?;
    Ok(Value::list(items[items.len().saturating_sub(n)..].to_vec()))
}

fn prim_butlast(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "BUTLAST", args, 1, Some(2))?;
    let n = match args.get(1) {
        Some(v) => index_arg(interp, v)?,
        None => 1,
    };
    let items = list_arg(interp, &args[0])?;
    Ok(Value::list(items[..items.len().saturating_sub(n)].to_vec()))
}

fn prim_copy_list(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "COPY-LIST", args, 1, Some(1))?;
    let items = list_arg(interp, &args[0])?;
    Ok(Value::list(items.to_vec()))
}

fn prim_make_list(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MAKE-LIST", args, 1, Some(3))?;
    let n = index_arg(interp, &args[0])?;
    let element = keyword_option(interp, &args[1..], "INITIAL-ELEMENT").unwrap_or(Value::Nil);
    Ok(Value::list(vec![element; n]))
}

fn prim_member(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MEMBER", args, 2, None)?;
    let test = keyword_option(interp, &args[2..], "TEST");
    let items = list_arg(interp, &args[1])?;
    for (i, candidate) in items.iter().enumerate() {
        if test_match(interp, test.as_ref(), &args[0], candidate)? {
            return Ok(Value::list(items[i..].to_vec()));
        }
    }
    Ok(Value::Nil)
}

fn prim_assoc(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "ASSOC", args, 2, None)?;
    let test = keyword_option(interp, &args[2..], "TEST");
    let entries = list_arg(interp, &args[1])?;
    for entry in entries {
        let Value::List(pair) = entry else { continue };
        if test_match(interp, test.as_ref(), &args[0], &pair[0])? {
            return Ok(entry.clone());
        }
    }
    Ok(Value::Nil)
}

fn plist_lookup(plist: &[Value], key: &Value) -> Option<Value> {
    plist
        .chunks(2)
        .find(|pair| pair.len() == 2 && pair[0].eq(key))
        .map(|pair| pair[1].clone())
}

fn prim_getf(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "GETF", args, 2, Some(3))?;
    let plist = list_arg(interp, &args[0])?;
    Ok(plist_lookup(plist, &args[1]).unwrap_or_else(|| args.get(2).cloned().unwrap_or(Value::Nil)))
}

/// Calls `function` on successive elements of `lists` in parallel,
/// stopping at the shortest.
fn map_lists(interp: &mut Interpreter<'_>, function: &Value, lists: &[Value]) -> Result<Vec<Value>, ControlSignal> {
    let mut columns = Vec::with_capacity(lists.len());
    for list in lists {
        columns.push(list_arg(interp, list)?);
    }
    let len = columns.iter().map(|c| c.len()).min().unwrap_or(0);
    let mut results = Vec::with_capacity(len);
    for i in 0..len {
        let row: Vec<Value> = columns.iter().map(|c| c[i].clone()).collect();
        results.push(interp.apply(function, &row)?);
    }
    Ok(results)
}

fn prim_mapcar(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MAPCAR", args, 2, None)?;
    Ok(Value::list(map_lists(interp, &args[0], &args[1..])?))
}

fn prim_mapc(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MAPC", args, 2, None)?;
    map_lists(interp, &args[0], &args[1..])?;
    Ok(args[1].clone())
}

fn prim_mapcan(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MAPCAN", args, 2, None)?;
    let results = map_lists(interp, &args[0], &args[1..])?;
    prim_append(interp, &results)
}

// ============================================================================
// Sequences
// ============================================================================

fn prim_length(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "LENGTH", args, 1, Some(1))?;
    let len = match &args[0] {
        Value::String(s) => s.chars().count(),
        other => match other.as_sequence() {
            Some(items) => items.len(),
            None => return Err(type_error(interp, other, "SEQUENCE")),
        },
    };
    Ok(Value::Integer(len as i64))
}

fn prim_reverse(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "REVERSE", args, 1, Some(1))?;
    let mut items = sequence_items(interp, &args[0])?;
    items.reverse();
    rebuild(interp, &args[0], items)
}

fn out_of_bounds(interp: &mut Interpreter<'_>, index: usize, sequence: &Value) -> ControlSignal {
    let text = interp.prin1_to_string(sequence);
    simple_error(interp, format!("index {} is out of bounds for {}", index, text))
}

fn prim_elt(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "ELT", args, 2, Some(2))?;
    let index = index_arg(interp, &args[1])?;
    let items = sequence_items(interp, &args[0])?;
    match items.get(index) {
        Some(v) => Ok(v.clone()),
        None => Err(out_of_bounds(interp, index, &args[0])),
    }
}

fn prim_subseq(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SUBSEQ", args, 2, Some(3))?;
    let items = sequence_items(interp, &args[0])?;
    let start = index_arg(interp, &args[1])?;
    let end = match args.get(2) {
        Some(Value::Nil) | None => items.len(),
        Some(v) => index_arg(interp, v)?,
    };
    if start > end || end > items.len() {
        return Err(out_of_bounds(interp, end.max(start), &args[0]));
    }
    rebuild(interp, &args[0], items[start..end].to_vec())
}

/// The name of a type specifier symbol, e.g. "LIST".
fn type_name(interp: &mut Interpreter<'_>, spec: &Value) -> Result<String, ControlSignal> {
    match spec {
        Value::Symbol(s) => Ok(interp.symbol_name(*s)),
        Value::Nil => Ok("NIL".to_string()),
        other => Err(type_error(interp, other, "TYPE SPECIFIER")),
    }
}

fn build_sequence(interp: &mut Interpreter<'_>, kind: &str, spec: &Value, items: Vec<Value>) -> EvalResult {
    match kind {
        "LIST" => Ok(Value::list(items)),
        "VECTOR" | "SIMPLE-VECTOR" => Ok(Value::vector(items)),
        "STRING" | "SIMPLE-STRING" => chars_to_string(interp, &items),
        _ => Err(type_error(interp, spec, "SEQUENCE TYPE")),
    }
}

fn prim_concatenate(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "CONCATENATE", args, 1, None)?;
    let kind = type_name(interp, &args[0])?;
    let mut items = Vec::new();
    for arg in &args[1..] {
        items.extend(sequence_items(interp, arg)?);
    }
    build_sequence(interp, &kind, &args[0], items)
}

fn prim_coerce(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "COERCE", args, 2, Some(2))?;
    let kind = type_name(interp, &args[1])?;
    match kind.as_str() {
        "T" => Ok(args[0].clone()),
        "FLOAT" => prim_float(interp, &args[..1]),
        "CHARACTER" => match &args[0] {
            Value::Char(c) => Ok(Value::Char(*c)),
            Value::String(s) if s.chars().count() == 1 => Ok(Value::Char(s.chars().next().unwrap_or(' '))),
            other => Err(type_error(interp, other, "CHARACTER DESIGNATOR")),
        },
        _ => {
            let items = sequence_items(interp, &args[0])?;
            build_sequence(interp, &kind, &args[1], items)
        }
    }
}

fn prim_reduce(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "REDUCE", args, 2, None)?;
    let items = sequence_items(interp, &args[1])?;
    let initial = keyword_option(interp, &args[2..], "INITIAL-VALUE");
    let mut iter = items.into_iter();
    let mut acc = match initial.or_else(|| iter.next()) {
        Some(v) => v,
        None => return interp.apply(&args[0], &[]),
    };
    for item in iter {
        acc = interp.apply(&args[0], &[acc, item])?;
    }
    Ok(acc)
}

fn prim_remove(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "REMOVE", args, 2, None)?;
    let test = keyword_option(interp, &args[2..], "TEST");
    let items = sequence_items(interp, &args[1])?;
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        if !test_match(interp, test.as_ref(), &args[0], &item)? {
            kept.push(item);
        }
    }
    rebuild(interp, &args[1], kept)
}

fn remove_by(interp: &mut Interpreter<'_>, name: &str, args: &[Value], remove_matching: bool) -> EvalResult {
    arity(interp, name, args, 2, Some(2))?;
    let items = sequence_items(interp, &args[1])?;
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        let matched = interp.apply(&args[0], std::slice::from_ref(&item))?.is_true();
        if matched != remove_matching {
            kept.push(item);
        }
    }
    rebuild(interp, &args[1], kept)
}

/// Index of the first element accepted by `accept`.
fn search_sequence(
    interp: &mut Interpreter<'_>,
    sequence: &Value,
    mut accept: impl FnMut(&mut Interpreter<'_>, &Value) -> Result<bool, ControlSignal>,
) -> Result<Option<(usize, Value)>, ControlSignal> {
    let items = sequence_items(interp, sequence)?;
    for (i, item) in items.into_iter().enumerate() {
        if accept(interp, &item)? {
            return Ok(Some((i, item)));
        }
    }
    Ok(None)
}

fn prim_find(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FIND", args, 2, None)?;
    let test = keyword_option(interp, &args[2..], "TEST");
    let found = search_sequence(interp, &args[1], |interp, x| test_match(interp, test.as_ref(), &args[0], x))?;
    Ok(found.map(|(_, v)| v).unwrap_or(Value::Nil))
}

fn prim_find_if(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FIND-IF", args, 2, Some(2))?;
    let found = search_sequence(interp, &args[1], |interp, x| {
        Ok(interp.apply(&args[0], std::slice::from_ref(x))?.is_true())
    })?;
    Ok(found.map(|(_, v)| v).unwrap_or(Value::Nil))
}

fn prim_position(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "POSITION", args, 2, None)?;
    let test = keyword_option(interp, &args[2..], "TEST");
    let found = search_sequence(interp, &args[1], |interp, x| test_match(interp, test.as_ref(), &args[0], x))?;
    Ok(found.map(|(i, _)| Value::Integer(i as i64)).unwrap_or(Value::Nil))
}

fn prim_position_if(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "POSITION-IF", args, 2, Some(2))?;
    let found = search_sequence(interp, &args[1], |interp, x| {
        Ok(interp.apply(&args[0], std::slice::from_ref(x))?.is_true())
    })?;
    Ok(found.map(|(i, _)| Value::Integer(i as i64)).unwrap_or(Value::Nil))
}

fn prim_count(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "COUNT", args, 2, None)?;
    let test = keyword_option(interp, &args[2..], "TEST");
    let mut n = 0;
    for item in sequence_items(interp, &args[1])? {
        if test_match(interp, test.as_ref(), &args[0], &item)? {
            n += 1;
        }
    }
    Ok(Value::Integer(n))
}

fn prim_count_if(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "COUNT-IF", args, 2, Some(2))?;
    let mut n = 0;
    for item in sequence_items(interp, &args[1])? {
        if interp.apply(&args[0], &[item])?.is_true() {
            n += 1;
        }
    }
    Ok(Value::Integer(n))
}

fn prim_every(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "EVERY", args, 2, Some(2))?;
    for item in sequence_items(interp, &args[1])? {
        if interp.apply(&args[0], &[item])?.is_nil() {
            return Ok(Value::Nil);
        }
    }
    Ok(boolean(interp, true))
}

fn prim_some(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SOME", args, 2, Some(2))?;
    for item in sequence_items(interp, &args[1])? {
        let result = interp.apply(&args[0], &[item])?;
        if result.is_true() {
            return Ok(result);
        }
    }
    Ok(Value::Nil)
}

/// Stable merge sort with a Lisp predicate that may fail.
fn merge_sort(
    interp: &mut Interpreter<'_>,
    mut items: Vec<(Value, Value)>,
    predicate: &Value,
) -> Result<Vec<(Value, Value)>, ControlSignal> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(interp, items, predicate)?;
    let right = merge_sort(interp, right, predicate)?;
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(l), Some(r)) = (left.peek(), right.peek()) {
        let right_first = interp.apply(predicate, &[r.0.clone(), l.0.clone()])?.is_true();
        let next = if right_first { right.next() } else { left.next() };
        merged.extend(next);
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

fn prim_sort(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SORT", args, 2, Some(4))?;
    let key = keyword_option(interp, &args[2..], "KEY");
    let mut keyed = Vec::new();
    for item in sequence_items(interp, &args[0])? {
        let k = match &key {
            Some(f) => interp.apply(f, std::slice::from_ref(&item))?,
            None => item.clone(),
        };
        keyed.push((k, item));
    }
    let sorted = merge_sort(interp, keyed, &args[1])?;
    rebuild(interp, &args[0], sorted.into_iter().map(|(_, v)| v).collect())
}

// ============================================================================
// Predicates
// ============================================================================

fn binary_test(interp: &mut Interpreter<'_>, name: &str, args: &[Value], test: fn(&Value, &Value) -> bool) -> EvalResult {
    arity(interp, name, args, 2, Some(2))?;
    Ok(boolean(interp, test(&args[0], &args[1])))
}

fn type_test(interp: &mut Interpreter<'_>, name: &str, args: &[Value], test: impl Fn(&Value) -> bool) -> EvalResult {
    arity(interp, name, args, 1, Some(1))?;
    Ok(boolean(interp, test(&args[0])))
}

fn prim_endp(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "ENDP", args, 1, Some(1))?;
    let items = list_arg(interp, &args[0])?;
    Ok(boolean(interp, items.is_empty()))
}

fn prim_keywordp(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "KEYWORDP", args, 1, Some(1))?;
    let keyword = match &args[0] {
        Value::Symbol(s) => interp.globals.symbols().is_keyword(*s),
        _ => false,
    };
    Ok(boolean(interp, keyword))
}

// ============================================================================
// Strings and characters
// ============================================================================

fn prim_string(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "STRING", args, 1, Some(1))?;
    if let Value::String(_) = &args[0] {
        return Ok(args[0].clone());
    }
    let text = string_designator(interp, &args[0])?;
    Ok(Value::string(&text))
}

fn string_compare(interp: &mut Interpreter<'_>, name: &str, args: &[Value], accept: fn(Ordering) -> bool) -> EvalResult {
    arity(interp, name, args, 2, Some(2))?;
    let a = string_designator(interp, &args[0])?;
    let b = string_designator(interp, &args[1])?;
    Ok(boolean(interp, accept(a.cmp(&b))))
}

fn string_map(interp: &mut Interpreter<'_>, name: &str, args: &[Value], f: fn(&str) -> String) -> EvalResult {
    arity(interp, name, args, 1, Some(1))?;
    let text = string_designator(interp, &args[0])?;
    Ok(Value::string(&f(&text)))
}

fn prim_string_trim(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "STRING-TRIM", args, 2, Some(2))?;
    let mut bag = Vec::new();
    for item in sequence_items(interp, &args[0])? {
        bag.push(char_arg(interp, &item)?);
    }
    let text = string_designator(interp, &args[1])?;
    Ok(Value::string(text.trim_matches(|c| bag.contains(&c))))
}

/// Position of the first occurrence of one sequence in another.
fn prim_search(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SEARCH", args, 2, Some(2))?;
    let needle = sequence_items(interp, &args[0])?;
    let haystack = sequence_items(interp, &args[1])?;
    if needle.len() > haystack.len() {
        return Ok(Value::Nil);
    }
    let found = (0..=haystack.len() - needle.len())
        .find(|&i| needle.iter().zip(&haystack[i..]).all(|(a, b)| a.eql(b)));
    Ok(found.map(|i| Value::Integer(i as i64)).unwrap_or(Value::Nil))
}

fn prim_char(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "CHAR", args, 2, Some(2))?;
    let index = index_arg(interp, &args[1])?;
    let found = match &args[0] {
        Value::String(s) => s.chars().nth(index),
        other => return Err(type_error(interp, other, "STRING")),
    };
    match found {
        Some(c) => Ok(Value::Char(c)),
        None => Err(out_of_bounds(interp, index, &args[0])),
    }
}

fn prim_char_code(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "CHAR-CODE", args, 1, Some(1))?;
    let c = char_arg(interp, &args[0])?;
    Ok(Value::Integer(c as i64))
}

fn prim_code_char(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "CODE-CHAR", args, 1, Some(1))?;
    let code = index_arg(interp, &args[0])?;
    Ok(u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(Value::Char)
        .unwrap_or(Value::Nil))
}

fn char_map(interp: &mut Interpreter<'_>, name: &str, args: &[Value], f: fn(&char) -> char) -> EvalResult {
    arity(interp, name, args, 1, Some(1))?;
    let c = char_arg(interp, &args[0])?;
    Ok(Value::Char(f(&c)))
}

fn char_compare(interp: &mut Interpreter<'_>, name: &str, args: &[Value], accept: fn(Ordering) -> bool) -> EvalResult {
    arity(interp, name, args, 1, None)?;
    let mut chars = Vec::with_capacity(args.len());
    for arg in args {
        chars.push(char_arg(interp, arg)?);
    }
    Ok(boolean(interp, chars.windows(2).all(|w| accept(w[0].cmp(&w[1])))))
}

fn prim_parse_integer(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "PARSE-INTEGER", args, 1, Some(3))?;
    let text = match &args[0] {
        Value::String(s) => s.clone(),
        other => return Err(type_error(interp, other, "STRING")),
    };
    let radix = match keyword_option(interp, &args[1..], "RADIX") {
        Some(Value::Integer(r)) if (2..=36).contains(&r) => r as u32,
        Some(other) => return Err(type_error(interp, &other, "(INTEGER 2 36)")),
        None => 10,
    };
    match reader::parse_integer(text.trim(), radix) {
        Some(n) => Ok(n),
        None => Err(simple_error(interp, format!("junk in string {:?}", text))),
    }
}

fn to_string(interp: &mut Interpreter<'_>, name: &str, args: &[Value], escape: bool) -> EvalResult {
    arity(interp, name, args, 1, Some(1))?;
    let text = printer::print_to_string(interp, &args[0], escape).map_err(|e| interp.raise(e))?;
    Ok(Value::string(&text))
}

// ============================================================================
// Output
// ============================================================================

fn printed(interp: &mut Interpreter<'_>, value: &Value, escape: bool) -> Result<String, ControlSignal> {
    printer::print_to_string(interp, value, escape).map_err(|e| interp.raise(e))
}

fn prim_print(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "PRINT", args, 1, Some(2))?;
    let text = printed(interp, &args[0], true)?;
    emit(&format!("\n{} ", text));
    Ok(args[0].clone())
}

fn write_object(interp: &mut Interpreter<'_>, name: &str, args: &[Value], escape: bool) -> EvalResult {
    arity(interp, name, args, 1, Some(2))?;
    let text = printed(interp, &args[0], escape)?;
    emit(&text);
    Ok(args[0].clone())
}

fn prim_write_string(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "WRITE-STRING", args, 1, Some(2))?;
    match &args[0] {
        Value::String(s) => emit(s),
        other => return Err(type_error(interp, other, "STRING")),
    }
    Ok(args[0].clone())
}

/// FORMAT to NIL returns the string; to T it writes standard output.
fn prim_format(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FORMAT", args, 2, None)?;
    let control = match &args[1] {
        Value::String(s) => s.clone(),
        other => return Err(type_error(interp, other, "STRING")),
    };
    let text = printer::format(interp, &control, &args[2..]).map_err(|e| interp.raise(e))?;
    match &args[0] {
        Value::Nil => Ok(Value::string(&text)),
        Value::Symbol(s) if *s == interp.globals.wk.t => {
            emit(&text);
            Ok(Value::Nil)
        }
        other => Err(type_error(interp, other, "(MEMBER NIL T)")),
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn prim_funcall(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FUNCALL", args, 1, None)?;
    interp.apply(&args[0], &args[1..])
}

/// The last argument is a list of further arguments.
fn prim_apply(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "APPLY", args, 2, None)?;
    let Some((spread, fixed)) = args[1..].split_last() else {
        return interp.apply(&args[0], &[]);
    };
    let mut call_args = fixed.to_vec();
    call_args.extend(list_arg(interp, spread)?.iter().cloned());
    interp.apply(&args[0], &call_args)
}

fn prim_eval(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "EVAL", args, 1, Some(1))?;
    interp.eval_form(&args[0])
}

fn prim_complement(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "COMPLEMENT", args, 1, Some(1))?;
    let function = args[0].clone();
    Ok(Value::native("COMPLEMENT", move |interp, args| {
        let result = interp.apply(&function, args)?;
        Ok(boolean(interp, result.is_nil()))
    }))
}

fn prim_macro_function(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MACRO-FUNCTION", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    Ok(interp.globals.macro_function(sym).unwrap_or(Value::Nil))
}

fn prim_macroexpand_1(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MACROEXPAND-1", args, 1, Some(1))?;
    let (expansion, _) = compiler::macroexpand_1(interp, &args[0])?;
    Ok(expansion)
}

fn prim_macroexpand(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MACROEXPAND", args, 1, Some(1))?;
    compiler::macroexpand(interp, &args[0])
}

fn prim_read_from_string(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "READ-FROM-STRING", args, 1, Some(1))?;
    let text = match &args[0] {
        Value::String(s) => s.clone(),
        other => return Err(type_error(interp, other, "STRING")),
    };
    let options = interp.reader_options();
    let globals = interp.globals;
    let read = {
        let mut symbols = globals.symbols_mut();
        reader::read_from_string(&text, &mut symbols, &options)
    };
    read.map_err(|e| interp.raise(e))
}

/// Evaluates every form of a source file with *PACKAGE* rebound.
fn prim_load(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "LOAD", args, 1, Some(1))?;
    let path = string_designator(interp, &args[0])?;
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => return Err(simple_error(interp, format!("cannot load {}: {}", path, e))),
    };
    log::info!("loading {}", path);
    let frame: BindingFrame = smallvec::smallvec![(
        interp.globals.wk.package_var,
        Value::Package(interp.current_package())
    )];
    interp.bind_specials(frame, |interp| interp.eval_string(&text))?;
    Ok(boolean(interp, true))
}

/// The functions a global definition refers to, as recorded when it
/// was compiled.
fn prim_function_dependencies(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FUNCTION-DEPENDENCIES", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    let uses = interp.globals.dependencies_of(sym);
    Ok(Value::list(uses.into_iter().map(Value::Symbol).collect()))
}

// ============================================================================
// Symbols
// ============================================================================

fn prim_symbol_name(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SYMBOL-NAME", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    Ok(Value::string(&interp.symbol_name(sym)))
}

fn prim_symbol_package(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SYMBOL-PACKAGE", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    let home = interp.globals.symbols().symbol_package(sym);
    Ok(home.map(Value::Package).unwrap_or(Value::Nil))
}

fn prim_symbol_value(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SYMBOL-VALUE", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    match interp.special_value(sym) {
        Some(v) => Ok(v),
        None => {
            let name = interp.symbol_name(sym);
            Err(interp.raise(RuntimeError::UnboundVariable(name)))
        }
    }
}

fn prim_symbol_function(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SYMBOL-FUNCTION", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    interp.function_value(sym)
}

fn prim_boundp(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "BOUNDP", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    let bound = interp.special_value(sym).is_some();
    Ok(boolean(interp, bound))
}

fn prim_fboundp(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FBOUNDP", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    let globals = interp.globals;
    let bound = globals.symbols().symbol_function(sym).is_some()
        || globals.macro_function(sym).is_some()
        || globals.special_forms.contains_key(&sym);
    Ok(boolean(interp, bound))
}

fn prim_set(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SET", args, 2, Some(2))?;
    let sym = symbol_arg(interp, &args[0])?;
    interp.set_special(sym, args[1].clone())?;
    Ok(args[1].clone())
}

fn prim_makunbound(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MAKUNBOUND", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    let globals = interp.globals;
    if globals.symbols().is_constant(sym) {
        let name = interp.symbol_name(sym);
        return Err(interp.raise(RuntimeError::ConstantAssignment(name)));
    }
    globals.symbols_mut().makunbound(sym);
    Ok(Value::Symbol(sym))
}

fn prim_fmakunbound(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FMAKUNBOUND", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    interp.globals.symbols_mut().fmakunbound(sym);
    Ok(Value::Symbol(sym))
}

fn prim_gensym(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "GENSYM", args, 0, Some(1))?;
    let prefix = match args.first() {
        Some(Value::String(s)) => s.to_string(),
        Some(other) => return Err(type_error(interp, other, "STRING")),
        None => "G".to_string(),
    };
    Ok(Value::Symbol(interp.globals.symbols_mut().gensym(&prefix)))
}

fn prim_make_symbol(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MAKE-SYMBOL", args, 1, Some(1))?;
    let name = match &args[0] {
        Value::String(s) => s.clone(),
        other => return Err(type_error(interp, other, "STRING")),
    };
    Ok(Value::Symbol(interp.globals.symbols_mut().make_symbol(&name)))
}

// ============================================================================
// Packages
// ============================================================================

fn prim_intern(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "INTERN", args, 1, Some(2))?;
    let name = match &args[0] {
        Value::String(s) => s.clone(),
        other => return Err(type_error(interp, other, "STRING")),
    };
    let package = optional_package(interp, args, 1)?;
    Ok(Value::Symbol(interp.globals.intern(&name, package)))
}

fn prim_find_symbol(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FIND-SYMBOL", args, 1, Some(2))?;
    let name = match &args[0] {
        Value::String(s) => s.clone(),
        other => return Err(type_error(interp, other, "STRING")),
    };
    let package = optional_package(interp, args, 1)?;
    let found = interp.globals.symbols().find_symbol(&name, package);
    Ok(found.map(|(sym, _)| Value::Symbol(sym)).unwrap_or(Value::Nil))
}

fn prim_find_package(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FIND-PACKAGE", args, 1, Some(1))?;
    if let Value::Package(_) = &args[0] {
        return Ok(args[0].clone());
    }
    let name = string_designator(interp, &args[0])?;
    let found = interp.globals.symbols().find_package(&name);
    Ok(found.map(Value::Package).unwrap_or(Value::Nil))
}

/// (make-package name &key :nicknames :use); :use defaults to COMMON-LISP.
fn prim_make_package(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MAKE-PACKAGE", args, 1, None)?;
    let name = string_designator(interp, &args[0])?;
    let mut nicknames = Vec::new();
    if let Some(list) = keyword_option(interp, &args[1..], "NICKNAMES") {
        for nick in list_arg(interp, &list)? {
            nicknames.push(string_designator(interp, nick)?);
        }
    }
    let mut uses = Vec::new();
    match keyword_option(interp, &args[1..], "USE") {
        Some(list) => {
            for used in list_arg(interp, &list)? {
                uses.push(package_arg(interp, used)?);
            }
        }
        None => uses.push(COMMON_LISP),
    }
    let globals = interp.globals;
    let created = {
        let mut symbols = globals.symbols_mut();
        let nick_refs: Vec<&str> = nicknames.iter().map(String::as_str).collect();
        symbols.create_package(&name, &nick_refs).and_then(|package| {
            for used in &uses {
                symbols.use_package(package, *used)?;
            }
            Ok(package)
        })
    };
    created.map(Value::Package).map_err(|e| interp.raise(e))
}

fn prim_package_name(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "PACKAGE-NAME", args, 1, Some(1))?;
    let package = package_arg(interp, &args[0])?;
    let name = interp.globals.symbols().package_name(package).to_string();
    Ok(Value::string(&name))
}

fn prim_package_use_list(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "PACKAGE-USE-LIST", args, 1, Some(1))?;
    let package = package_arg(interp, &args[0])?;
    let used: Vec<Value> = interp
        .globals
        .symbols()
        .get_package(package)
        .map(|p| p.use_list().iter().copied().map(Value::Package).collect())
        .unwrap_or_default();
    Ok(Value::list(used))
}

fn prim_use_package(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "USE-PACKAGE", args, 1, Some(2))?;
    let mut sources = Vec::new();
    match &args[0] {
        Value::List(items) => {
            for item in items.iter() {
                sources.push(package_arg(interp, item)?);
            }
        }
        single => sources.push(package_arg(interp, single)?),
    }
    let dest = optional_package(interp, args, 1)?;
    let globals = interp.globals;
    let result = {
        let mut symbols = globals.symbols_mut();
        sources.iter().try_for_each(|src| symbols.use_package(dest, *src))
    };
    result.map_err(|e| interp.raise(e))?;
    Ok(boolean(interp, true))
}

/// EXPORT, UNEXPORT and IMPORT: a symbol or list of symbols and an
/// optional package.
fn symbol_operation(
    interp: &mut Interpreter<'_>,
    name: &str,
    args: &[Value],
    op: fn(&mut SymbolTable, &[SymbolId], PackageId) -> Result<(), PackageError>,
) -> EvalResult {
    arity(interp, name, args, 1, Some(2))?;
    let syms = symbols_of(interp, &args[0])?;
    let package = optional_package(interp, args, 1)?;
    let globals = interp.globals;
    let result = op(&mut globals.symbols_mut(), &syms, package);
    result.map_err(|e| interp.raise(e))?;
    Ok(boolean(interp, true))
}

fn prim_shadow(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SHADOW", args, 1, Some(2))?;
    let mut names = Vec::new();
    match &args[0] {
        Value::List(items) => {
            for item in items.iter() {
                names.push(string_designator(interp, item)?);
            }
        }
        single => names.push(string_designator(interp, single)?),
    }
    let package = optional_package(interp, args, 1)?;
    let globals = interp.globals;
    let result = {
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        globals.symbols_mut().shadow(&refs, package)
    };
    result.map_err(|e| interp.raise(e))?;
    Ok(boolean(interp, true))
}

// ============================================================================
// Conditions and restarts
// ============================================================================

/// Resolves a condition designator: a condition, a format control with
/// arguments (made into an instance of `default`), or a class name with
/// initargs.
fn condition_arg(
    interp: &mut Interpreter<'_>,
    datum: &Value,
    rest: &[Value],
    default: ClassId,
) -> Result<Arc<Condition>, ControlSignal> {
    match datum {
        Value::Condition(c) => Ok(c.clone()),
        Value::String(control) => Ok(Arc::new(Condition::simple(default, control, rest.to_vec()))),
        Value::Symbol(_) | Value::Class(_) => make_condition(interp, datum, rest),
        other => Err(type_error(interp, other, "CONDITION DESIGNATOR")),
    }
}

fn make_condition(interp: &mut Interpreter<'_>, class: &Value, initargs: &[Value]) -> Result<Arc<Condition>, ControlSignal> {
    let class_id = class_arg(interp, class)?;
    let globals = interp.globals;
    let (kind, slots) = {
        let classes = globals.classes();
        classes
            .get(class_id)
            .map(|c| (c.kind, c.slots.clone()))
            .unwrap_or((ClassKind::BuiltIn, Vec::new()))
    };
    if kind != ClassKind::Condition {
        return Err(type_error(interp, class, "CONDITION CLASS"));
    }
    if initargs.len() % 2 != 0 {
        return Err(interp.raise(RuntimeError::OddKeywordArguments("MAKE-CONDITION".to_string())));
    }
    let control_key = keyword_id(interp, "FORMAT-CONTROL");
    let arguments_key = keyword_id(interp, "FORMAT-ARGUMENTS");

    let mut condition = Condition::new(class_id);
    for pair in initargs.chunks(2) {
        let key = pair[0].as_symbol();
        if key == Some(control_key) {
            condition.format_control = pair[1].as_str().map(str::to_string);
        } else if key == Some(arguments_key) {
            condition.format_arguments = list_arg(interp, &pair[1])?.to_vec();
        } else if let Some(slot) = slots.iter().find(|s| s.initarg.is_some() && s.initarg == key) {
            condition.slots.entry(slot.name).or_insert_with(|| pair[1].clone());
        } else {
            let keyword = interp.prin1_to_string(&pair[0]);
            return Err(interp.raise(RuntimeError::UnknownKeyword {
                function: "MAKE-CONDITION".to_string(),
                keyword,
            }));
        }
    }
    for slot in &slots {
        if condition.slots.contains_key(&slot.name) {
            continue;
        }
        if let Some(init) = &slot.initfunction {
            let value = interp.apply(init, &[])?;
            condition.slots.insert(slot.name, value);
        }
    }
    Ok(Arc::new(condition))
}

fn prim_make_condition(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MAKE-CONDITION", args, 1, None)?;
    Ok(Value::Condition(make_condition(interp, &args[0], &args[1..])?))
}

fn prim_signal(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SIGNAL", args, 1, None)?;
    let default = interp.globals.builtins().simple_condition;
    let condition = condition_arg(interp, &args[0], &args[1..], default)?;
    conditions::signal(interp, &condition)?;
    Ok(Value::Nil)
}

fn prim_error(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "ERROR", args, 1, None)?;
    let default = interp.globals.builtins().simple_error;
    let condition = condition_arg(interp, &args[0], &args[1..], default)?;
    Err(conditions::error(interp, condition))
}

/// (cerror continue-control datum &rest args)
fn prim_cerror(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "CERROR", args, 2, None)?;
    let control = match &args[0] {
        Value::String(s) => s.clone(),
        other => return Err(type_error(interp, other, "STRING")),
    };
    let continue_text = printer::format(interp, &control, &args[2..]).map_err(|e| interp.raise(e))?;
    let default = interp.globals.builtins().simple_error;
    let condition = condition_arg(interp, &args[1], &args[2..], default)?;
    conditions::cerror(interp, continue_text, condition)
}

fn prim_warn(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "WARN", args, 1, None)?;
    let default = interp.globals.builtins().simple_warning;
    let condition = condition_arg(interp, &args[0], &args[1..], default)?;
    conditions::warn(interp, condition)
}

fn condition_object(interp: &mut Interpreter<'_>, value: &Value) -> Result<Arc<Condition>, ControlSignal> {
    match value {
        Value::Condition(c) => Ok(c.clone()),
        other => Err(type_error(interp, other, "CONDITION")),
    }
}

fn prim_format_control(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SIMPLE-CONDITION-FORMAT-CONTROL", args, 1, Some(1))?;
    let condition = condition_object(interp, &args[0])?;
    Ok(condition.format_control.as_deref().map(Value::string).unwrap_or(Value::Nil))
}

fn prim_format_arguments(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SIMPLE-CONDITION-FORMAT-ARGUMENTS", args, 1, Some(1))?;
    let condition = condition_object(interp, &args[0])?;
    Ok(Value::list(condition.format_arguments.clone()))
}

/// The optional condition argument of the restart functions.
fn optional_condition(interp: &mut Interpreter<'_>, value: Option<&Value>) -> Result<Option<Arc<Condition>>, ControlSignal> {
    match value {
        None | Some(Value::Nil) => Ok(None),
        Some(v) => condition_object(interp, v).map(Some),
    }
}

fn prim_compute_restarts(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "COMPUTE-RESTARTS", args, 0, Some(1))?;
    let condition = optional_condition(interp, args.first())?;
    let restarts = interp.process.conditions.compute_restarts(condition.as_ref());
    Ok(Value::list(restarts.into_iter().map(Value::Restart).collect()))
}

fn lookup_restart(
    interp: &mut Interpreter<'_>,
    designator: &Value,
    condition: Option<&Arc<Condition>>,
) -> Result<Option<Arc<Restart>>, ControlSignal> {
    match designator {
        Value::Restart(r) => Ok(Some(r.clone())),
        Value::Symbol(name) => Ok(interp.process.conditions.find_restart(*name, condition)),
        other => Err(type_error(interp, other, "RESTART DESIGNATOR")),
    }
}

fn require_restart(interp: &mut Interpreter<'_>, designator: &Value) -> Result<Arc<Restart>, ControlSignal> {
    match lookup_restart(interp, designator, None)? {
        Some(r) => Ok(r),
        None => {
            let name = interp.prin1_to_string(designator);
            Err(interp.raise(RuntimeError::NoSuchRestart(name)))
        }
    }
}

fn prim_find_restart(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FIND-RESTART", args, 1, Some(2))?;
    let condition = optional_condition(interp, args.get(1))?;
    let found = lookup_restart(interp, &args[0], condition.as_ref())?;
    Ok(found.map(Value::Restart).unwrap_or(Value::Nil))
}

fn prim_invoke_restart(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "INVOKE-RESTART", args, 1, None)?;
    let restart = require_restart(interp, &args[0])?;
    conditions::invoke_restart(interp, &restart, &args[1..])
}

/// Arguments come from the restart's interactive function, if any.
fn prim_invoke_restart_interactively(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "INVOKE-RESTART-INTERACTIVELY", args, 1, Some(1))?;
    let restart = require_restart(interp, &args[0])?;
    let restart_args = match &restart.interactive {
        Some(f) => {
            let produced = interp.apply(f, &[])?;
            list_arg(interp, &produced)?.to_vec()
        }
        None => Vec::new(),
    };
    conditions::invoke_restart(interp, &restart, &restart_args)
}

fn prim_restart_name(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "RESTART-NAME", args, 1, Some(1))?;
    match &args[0] {
        Value::Restart(r) => Ok(r.name.map(Value::Symbol).unwrap_or(Value::Nil)),
        other => Err(type_error(interp, other, "RESTART")),
    }
}

/// ABORT, CONTINUE, MUFFLE-WARNING, USE-VALUE and STORE-VALUE. The
/// `required` ones signal a control error when their restart is absent;
/// the others return NIL.
fn standard_restart(
    interp: &mut Interpreter<'_>,
    function: &str,
    name: SymbolId,
    args: &[Value],
    takes_value: bool,
    required: bool,
) -> EvalResult {
    let base = usize::from(takes_value);
    arity(interp, function, args, base, Some(base + 1))?;
    let condition = optional_condition(interp, args.get(base))?;
    let found = interp.process.conditions.find_restart(name, condition.as_ref());
    match found {
        Some(restart) => conditions::invoke_restart(interp, &restart, &args[..base]),
        None if required => {
            let name = interp.symbol_name(name);
            Err(interp.raise(RuntimeError::NoSuchRestart(name)))
        }
        None => Ok(Value::Nil),
    }
}

// ============================================================================
// Objects
// ============================================================================

fn missing_slot(interp: &mut Interpreter<'_>, object: &Value, slot: SymbolId) -> ControlSignal {
    let slot = interp.symbol_name(slot);
    let object = interp.prin1_to_string(object);
    interp.raise(RuntimeError::MissingSlot { slot, object })
}

fn slot_value(interp: &mut Interpreter<'_>, object: &Value, slot: SymbolId) -> EvalResult {
    match object {
        Value::Instance(instance) => {
            let index = interp.globals.classes().slot_index(instance.class, slot);
            match index.and_then(|i| instance.slot(i)) {
                Some(Value::Unbound) => {
                    let slot = interp.symbol_name(slot);
                    let object = interp.prin1_to_string(object);
                    Err(simple_error(interp, format!("the slot {} is unbound in {}", slot, object)))
                }
                Some(v) => Ok(v),
                None => Err(missing_slot(interp, object, slot)),
            }
        }
        Value::Condition(c) => match c.slots.get(&slot) {
            Some(v) => Ok(v.clone()),
            None => Err(missing_slot(interp, object, slot)),
        },
        other => Err(missing_slot(interp, other, slot)),
    }
}

fn set_slot_value(interp: &mut Interpreter<'_>, object: &Value, slot: SymbolId, value: Value) -> EvalResult {
    match object {
        Value::Instance(instance) => {
            let index = interp.globals.classes().slot_index(instance.class, slot);
            match index {
                Some(i) => {
                    instance.set_slot(i, value.clone());
                    Ok(value)
                }
                None => Err(missing_slot(interp, object, slot)),
            }
        }
        Value::Condition(_) => {
            let text = interp.prin1_to_string(object);
            Err(simple_error(interp, format!("the slots of {} cannot be modified", text)))
        }
        other => Err(missing_slot(interp, other, slot)),
    }
}

fn prim_make_instance(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "MAKE-INSTANCE", args, 1, None)?;
    let class = class_arg(interp, &args[0])?;
    let globals = interp.globals;
    let (kind, slots) = {
        let classes = globals.classes();
        classes
            .get(class)
            .map(|c| (c.kind, c.slots.clone()))
            .unwrap_or((ClassKind::BuiltIn, Vec::new()))
    };
    let initargs = &args[1..];
    match kind {
        ClassKind::Condition => {
            return Ok(Value::Condition(make_condition(interp, &Value::Class(class), initargs)?));
        }
        ClassKind::BuiltIn => {
            let text = interp.prin1_to_string(&args[0]);
            return Err(simple_error(interp, format!("cannot make an instance of the built-in class {}", text)));
        }
        ClassKind::Standard => {}
    }
    if initargs.len() % 2 != 0 {
        return Err(interp.raise(RuntimeError::OddKeywordArguments("MAKE-INSTANCE".to_string())));
    }
    let allow_key = globals.wk.allow_other_keys;
    for pair in initargs.chunks(2) {
        let key = pair[0].as_symbol();
        let known = key == Some(allow_key) || slots.iter().any(|s| s.initarg.is_some() && s.initarg == key);
        if !known {
            let keyword = interp.prin1_to_string(&pair[0]);
            return Err(interp.raise(RuntimeError::UnknownKeyword {
                function: "MAKE-INSTANCE".to_string(),
                keyword,
            }));
        }
    }

    let instance = Arc::new(Instance::new(class, slots.len()));
    for (i, slot) in slots.iter().enumerate() {
        let supplied = slot.initarg.and_then(|key| plist_lookup(initargs, &Value::Symbol(key)));
        let value = match (supplied, &slot.initfunction) {
            (Some(v), _) => v,
            (None, Some(init)) => interp.apply(init, &[])?,
            (None, None) => continue,
        };
        instance.set_slot(i, value);
    }
    Ok(Value::Instance(instance))
}

fn prim_slot_value(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SLOT-VALUE", args, 2, Some(2))?;
    let slot = symbol_arg(interp, &args[1])?;
    slot_value(interp, &args[0], slot)
}

fn prim_set_slot_value(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%SET-SLOT-VALUE", args, 3, Some(3))?;
    let slot = symbol_arg(interp, &args[1])?;
    set_slot_value(interp, &args[0], slot, args[2].clone())
}

fn prim_slot_boundp(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SLOT-BOUNDP", args, 2, Some(2))?;
    let slot = symbol_arg(interp, &args[1])?;
    let bound = match &args[0] {
        Value::Instance(instance) => {
            let index = interp.globals.classes().slot_index(instance.class, slot);
            match index.and_then(|i| instance.slot(i)) {
                Some(v) => !matches!(v, Value::Unbound),
                None => return Err(missing_slot(interp, &args[0], slot)),
            }
        }
        Value::Condition(c) => c.slots.contains_key(&slot),
        other => return Err(missing_slot(interp, other, slot)),
    };
    Ok(boolean(interp, bound))
}

fn prim_slot_exists_p(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SLOT-EXISTS-P", args, 2, Some(2))?;
    let slot = symbol_arg(interp, &args[1])?;
    let class = interp.class_of(&args[0]);
    let exists = interp.globals.classes().slot_index(class, slot).is_some();
    Ok(boolean(interp, exists))
}

fn prim_find_class(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "FIND-CLASS", args, 1, Some(2))?;
    let name = symbol_arg(interp, &args[0])?;
    let found = interp.globals.classes().find_class(name);
    match found {
        Some(c) => Ok(Value::Class(c)),
        None if args.get(1).is_some_and(Value::is_nil) => Ok(Value::Nil),
        None => {
            let name = interp.symbol_name(name);
            Err(interp.raise(RuntimeError::NoSuchClass(name)))
        }
    }
}

fn prim_class_name(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "CLASS-NAME", args, 1, Some(1))?;
    match &args[0] {
        Value::Class(c) => Ok(Value::Symbol(interp.globals.classes().class_name(*c))),
        other => Err(type_error(interp, other, "CLASS")),
    }
}

fn prim_class_precedence_list(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "CLASS-PRECEDENCE-LIST", args, 1, Some(1))?;
    let class = class_arg(interp, &args[0])?;
    let cpl: Vec<Value> = interp.globals.classes().cpl(class).iter().copied().map(Value::Class).collect();
    Ok(Value::list(cpl))
}

/// T and NIL are the universal and empty types; any other type
/// specifier names a class.
fn type_class(interp: &mut Interpreter<'_>, spec: &Value) -> Result<Option<ClassId>, ControlSignal> {
    match spec {
        Value::Nil => Ok(None),
        other => class_arg(interp, other).map(Some),
    }
}

fn prim_typep(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "TYPEP", args, 2, Some(2))?;
    let Some(class) = type_class(interp, &args[1])? else {
        return Ok(Value::Nil);
    };
    let own = interp.class_of(&args[0]);
    let result = interp.globals.classes().subclassp(own, class);
    Ok(boolean(interp, result))
}

fn prim_subtypep(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "SUBTYPEP", args, 2, Some(2))?;
    let sub = type_class(interp, &args[0])?;
    let sup = type_class(interp, &args[1])?;
    let result = match (sub, sup) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => interp.globals.classes().subclassp(a, b),
    };
    Ok(boolean(interp, result))
}

/// Installs the reader, accessor and writer functions of one slot.
fn install_slot_functions(
    interp: &Interpreter<'_>,
    slot: SymbolId,
    readers: &[SymbolId],
    setf_writers: &[SymbolId],
    plain_writers: &[SymbolId],
) {
    let globals = interp.globals;
    for &reader in readers {
        let label = interp.symbol_name(reader);
        let function = Value::native(label.clone(), move |interp, args| {
            arity(interp, &label, args, 1, Some(1))?;
            slot_value(interp, &args[0], slot)
        });
        globals.symbols_mut().set_symbol_function(reader, function);
    }
    for &writer in setf_writers {
        let label = format!("(SETF {})", interp.symbol_name(writer));
        globals.set_accessor_writer(writer, slot_writer(label, slot));
    }
    for &writer in plain_writers {
        let label = interp.symbol_name(writer);
        let function = slot_writer(label, slot);
        globals.symbols_mut().set_symbol_function(writer, function);
    }
}

/// A function of (new-value object) storing into `slot`.
fn slot_writer(label: String, slot: SymbolId) -> Value {
    Value::native(label.clone(), move |interp, args| {
        arity(interp, &label, args, 2, Some(2))?;
        set_slot_value(interp, &args[1], slot, args[0].clone())
    })
}

/// %DEFCLASS and %DEFINE-CONDITION: (name supers descriptors report).
/// Each descriptor is (slot initarg initfunction readers accessors writers).
fn define_class(interp: &mut Interpreter<'_>, function: &str, args: &[Value], kind: ClassKind) -> EvalResult {
    arity(interp, function, args, 4, Some(4))?;
    let name = symbol_arg(interp, &args[0])?;
    let builtins = *interp.globals.builtins();
    let mut supers = Vec::new();
    for sup in list_arg(interp, &args[1])? {
        let class = class_arg(interp, sup)?;
        let sup_kind = interp.globals.classes().get(class).map(|c| c.kind);
        let compatible = match kind {
            ClassKind::Condition => sup_kind == Some(ClassKind::Condition),
            _ => sup_kind != Some(ClassKind::Condition),
        };
        if !compatible {
            let text = interp.prin1_to_string(sup);
            return Err(simple_error(interp, format!("{} cannot be a superclass here", text)));
        }
        supers.push(class);
    }
    if supers.is_empty() {
        supers.push(match kind {
            ClassKind::Condition => builtins.condition,
            _ => builtins.standard_object,
        });
    }

    let mut slots = Vec::new();
    for descriptor in list_arg(interp, &args[2])? {
        let parts = match descriptor.as_list() {
            Some(parts) if parts.len() == 6 => parts,
            _ => return Err(type_error(interp, descriptor, "SLOT DESCRIPTOR")),
        };
        let slot = symbol_arg(interp, &parts[0])?;
        let mut readers = symbols_of(interp, &parts[3])?;
        let mut setf_writers = Vec::new();
        for accessor in list_arg(interp, &parts[4])? {
            match accessor {
                Value::Symbol(a) => {
                    readers.push(*a);
                    setf_writers.push(*a);
                }
                Value::List(setf_form) if setf_form.len() == 2 => {
                    setf_writers.push(symbol_arg(interp, &setf_form[1])?);
                }
                other => return Err(type_error(interp, other, "ACCESSOR NAME")),
            }
        }
        let plain_writers = symbols_of(interp, &parts[5])?;
        install_slot_functions(interp, slot, &readers, &setf_writers, &plain_writers);

        let mut writers = setf_writers;
        writers.extend(plain_writers);
        slots.push(SlotDefinition {
            name: slot,
            initarg: parts[1].as_symbol(),
            initfunction: if parts[2].is_nil() { None } else { Some(parts[2].clone()) },
            readers,
            writers,
        });
    }
    let report = args[3].as_str().map(str::to_string);
    let id = interp.globals.classes_mut().define_class(name, supers, slots, kind, report);
    log::debug!("{} defined class {} as #{}", function, interp.symbol_name(name), id.0);
    Ok(Value::Symbol(name))
}

fn parse_lambda_list(interp: &mut Interpreter<'_>, list: &Value) -> Result<ParsedLambdaList, ControlSignal> {
    let globals = interp.globals;
    let keywords = globals.wk.lambda_keywords;
    let parsed = {
        let mut symbols = globals.symbols_mut();
        lambda_list::parse(list, &keywords, &mut symbols, false)
    };
    parsed.map_err(|error| {
        let form = interp.prin1_to_string(list);
        interp.raise(CompileError::LambdaList { error, form })
    })
}

fn method_combination(interp: &mut Interpreter<'_>, value: &Value) -> Result<MethodCombination, ControlSignal> {
    match value {
        Value::Nil => Ok(MethodCombination::Standard),
        Value::Symbol(s) if *s == interp.globals.wk.standard => Ok(MethodCombination::Standard),
        Value::Symbol(s) => {
            let name = interp.symbol_name(*s);
            match CombinationOperator::from_name(&name) {
                Some(operator) => Ok(MethodCombination::Operator { name: *s, operator }),
                None => Err(simple_error(interp, format!("unknown method combination {}", name))),
            }
        }
        other => Err(type_error(interp, other, "METHOD COMBINATION NAME")),
    }
}

fn install_generic(interp: &Interpreter<'_>, generic: Arc<GenericFunction>) -> Value {
    let value = Value::Function(Function::Generic(generic.clone()));
    interp.globals.symbols_mut().set_symbol_function(generic.name, value.clone());
    value
}

/// (%defgeneric name lambda-list precedence-order combination). An
/// existing generic function with the same shape and combination keeps
/// its methods.
fn prim_defgeneric(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%DEFGENERIC", args, 4, Some(4))?;
    let name = symbol_arg(interp, &args[0])?;
    let parsed = parse_lambda_list(interp, &args[1])?;
    let shape = parsed.shape();

    let precedence = match list_arg(interp, &args[2])? {
        [] => None,
        order => {
            let mut indices = Vec::with_capacity(order.len());
            for param in order {
                match parsed.req.iter().position(|r| r.eq(param)) {
                    Some(i) if !indices.contains(&i) => indices.push(i),
                    _ => {
                        let text = interp.prin1_to_string(param);
                        return Err(simple_error(
                            interp,
                            format!("{} is not a distinct required parameter of the generic function", text),
                        ));
                    }
                }
            }
            if indices.len() != shape.required {
                return Err(simple_error(
                    interp,
                    "the argument precedence order must name every required parameter".to_string(),
                ));
            }
            Some(indices)
        }
    };
    let combination = method_combination(interp, &args[3])?;

    let existing = interp.globals.symbols().symbol_function(name).cloned();
    if let Some(Value::Function(Function::Generic(generic))) = &existing {
        let same_precedence = precedence.as_ref().map_or(true, |p| *p == generic.precedence);
        if generic.shape == shape && generic.combination == combination && same_precedence {
            return Ok(Value::Function(Function::Generic(generic.clone())));
        }
        log::warn!("redefining generic function {} discards its methods", generic.display_name);
    }
    let generic = GenericFunction::new(name, interp.symbol_name(name), shape, combination, precedence);
    Ok(install_generic(interp, Arc::new(generic)))
}

/// The generic function named `name`, created with `shape` when missing.
fn ensure_generic(interp: &mut Interpreter<'_>, name: SymbolId, shape: &LambdaShape) -> Result<Arc<GenericFunction>, ControlSignal> {
    let existing = interp.globals.symbols().symbol_function(name).cloned();
    match existing {
        Some(Value::Function(Function::Generic(generic))) => Ok(generic),
        Some(_) => {
            let name = interp.symbol_name(name);
            Err(simple_error(interp, format!("{} already names an ordinary function", name)))
        }
        None => {
            let generic = Arc::new(GenericFunction::new(
                name,
                interp.symbol_name(name),
                shape.clone(),
                MethodCombination::Standard,
                None,
            ));
            install_generic(interp, generic.clone());
            Ok(generic)
        }
    }
}

fn specializer(interp: &mut Interpreter<'_>, spec: &Value) -> Result<Specializer, ControlSignal> {
    let (eql, exact) = (interp.globals.wk.eql, interp.globals.wk.exact);
    match spec {
        Value::Nil => Ok(Specializer::Wildcard),
        Value::Symbol(_) | Value::Class(_) => Ok(Specializer::SubtypeOf(class_arg(interp, spec)?)),
        Value::List(parts) if parts.len() == 2 && parts[0].as_symbol() == Some(eql) => {
            Ok(Specializer::Eql(parts[1].clone()))
        }
        Value::List(parts) if parts.len() == 2 && parts[0].as_symbol() == Some(exact) => {
            Ok(Specializer::Exact(class_arg(interp, &parts[1])?))
        }
        other => Err(type_error(interp, other, "SPECIALIZER")),
    }
}

/// (%defmethod name qualifiers specializers lambda-list function)
fn prim_defmethod(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%DEFMETHOD", args, 5, Some(5))?;
    let name = symbol_arg(interp, &args[0])?;
    let qualifiers = symbols_of(interp, &args[1])?;
    let parsed = parse_lambda_list(interp, &args[3])?;
    let shape = parsed.shape();
    let generic = ensure_generic(interp, name, &shape)?;

    let mut specializers = Vec::new();
    for spec in list_arg(interp, &args[2])? {
        specializers.push(specializer(interp, spec)?);
    }
    let globals = interp.globals;
    let role = generic
        .classify(&qualifiers, &globals.wk.qualifiers)
        .map_err(|e| interp.raise(e))?;
    let method = Method {
        qualifiers,
        role,
        specializers,
        shape,
        function: args[4].clone(),
    };
    generic.add_method(method).map_err(|e| interp.raise(e))?;
    Ok(Value::Function(Function::Generic(generic)))
}

fn prim_call_next_method(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%CALL-NEXT-METHOD", args, 1, None)?;
    match &args[0] {
        Value::Function(Function::NextMethod(next)) => clos::call_next_method(interp, next, &args[1..]),
        other => Err(type_error(interp, other, "NEXT-METHOD")),
    }
}

fn prim_next_method_p(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%NEXT-METHOD-P", args, 1, Some(1))?;
    let exists = match &args[0] {
        Value::Function(Function::NextMethod(next)) => next.exists(),
        _ => false,
    };
    Ok(boolean(interp, exists))
}

// ============================================================================
// Runtime helpers called by compiled code
// ============================================================================

fn caught_value(caught: Caught) -> Value {
    match caught {
        Caught::Returned(v) | Caught::Thrown(v) => v,
    }
}

/// (%block function): calls `function` with a fresh tag that RETURN-FROM
/// throws to.
fn prim_block(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%BLOCK", args, 1, Some(1))?;
    let tag = conditions::fresh_tag("BLOCK");
    let function = args[0].clone();
    let target = tag.clone();
    let caught = interp.with_catch(&tag, move |interp| interp.apply(&function, &[target]))?;
    Ok(caught_value(caught))
}

fn prim_catch(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%CATCH", args, 2, Some(2))?;
    let thunk = args[1].clone();
    let caught = interp.with_catch(&args[0], move |interp| interp.apply(&thunk, &[]))?;
    Ok(caught_value(caught))
}

fn prim_throw(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%THROW", args, 2, Some(2))?;
    Err(interp.throw(args[0].clone(), args[1].clone()))
}

/// (%dynamic-let symbols values thunk). Symbols without a value are bound
/// but unbound, as PROGV does.
fn prim_dynamic_let(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%DYNAMIC-LET", args, 3, Some(3))?;
    let symbols = symbols_of(interp, &args[0])?;
    let values = list_arg(interp, &args[1])?;
    let mut frame = BindingFrame::new();
    for (i, sym) in symbols.into_iter().enumerate() {
        let constant = interp.globals.symbols().is_constant(sym);
        if constant {
            let name = interp.symbol_name(sym);
            return Err(interp.raise(RuntimeError::ConstantAssignment(name)));
        }
        frame.push((sym, values.get(i).cloned().unwrap_or(Value::Unbound)));
    }
    let thunk = args[2].clone();
    interp.bind_specials(frame, move |interp| interp.apply(&thunk, &[]))
}

fn prim_set_global(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%SET-GLOBAL", args, 2, Some(2))?;
    let sym = symbol_arg(interp, &args[0])?;
    interp.set_special(sym, args[1].clone())?;
    Ok(args[1].clone())
}

fn prim_global_unbound_p(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%GLOBAL-UNBOUND-P", args, 1, Some(1))?;
    let sym = symbol_arg(interp, &args[0])?;
    let unbound = interp.special_value(sym).is_none();
    Ok(boolean(interp, unbound))
}

fn prim_internal_getf(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%GETF", args, 2, Some(2))?;
    let plist = list_arg(interp, &args[0])?;
    Ok(plist_lookup(plist, &args[1]).unwrap_or(Value::Nil))
}

fn prim_plist_has(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%PLIST-HAS", args, 2, Some(2))?;
    let plist = list_arg(interp, &args[0])?;
    let found = plist_lookup(plist, &args[1]).is_some();
    Ok(boolean(interp, found))
}

/// (%setf-accessor name arg... new-value). The writer receives the new
/// value first.
fn prim_setf_accessor(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%SETF-ACCESSOR", args, 2, None)?;
    let name = symbol_arg(interp, &args[0])?;
    let Some(writer) = interp.globals.accessor_writer(name) else {
        let name = format!("(SETF {})", interp.symbol_name(name));
        return Err(interp.raise(RuntimeError::UndefinedFunction(name)));
    };
    let (value, place_args) = match args[1..].split_last() {
        Some((value, rest)) => (value, rest),
        None => return Ok(Value::Nil),
    };
    let mut call_args = Vec::with_capacity(args.len() - 1);
    call_args.push(value.clone());
    call_args.extend(place_args.iter().cloned());
    interp.apply(&writer, &call_args)
}

fn prim_in_package(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%IN-PACKAGE", args, 1, Some(1))?;
    let package = package_arg(interp, &args[0])?;
    let var = interp.globals.wk.package_var;
    interp.set_special(var, Value::Package(package))?;
    Ok(Value::Package(package))
}

/// (%range n): the list 0 below n, used by DOTIMES.
fn prim_range(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%RANGE", args, 1, Some(1))?;
    let n = index_arg(interp, &args[0])?;
    Ok(Value::list((0..n as i64).map(Value::Integer).collect()))
}

fn condition_classes(interp: &mut Interpreter<'_>, value: &Value) -> Result<Vec<ClassId>, ControlSignal> {
    let mut classes = Vec::new();
    for name in list_arg(interp, value)? {
        classes.push(class_arg(interp, name)?);
    }
    Ok(classes)
}

/// (%handler-case types thunk no-error clause...)
fn prim_handler_case(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%HANDLER-CASE", args, 3, None)?;
    let classes = condition_classes(interp, &args[0])?;
    let thunk = args[1].clone();
    let outcome = handler_case(interp, classes, move |interp| interp.apply(&thunk, &[]))?;
    match outcome {
        HandlerOutcome::Returned(v) if args[2].is_nil() => Ok(v),
        HandlerOutcome::Returned(v) => interp.apply(&args[2], &[v]),
        HandlerOutcome::Caught { index, condition } => match args.get(3 + index) {
            Some(clause) => interp.apply(clause, &[Value::Condition(condition)]),
            None => Err(simple_error(interp, "handler clause out of range".to_string())),
        },
    }
}

/// (%handler-bind types thunk handler...)
fn prim_handler_bind(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%HANDLER-BIND", args, 2, None)?;
    let classes = condition_classes(interp, &args[0])?;
    if classes.len() != args.len() - 2 {
        return Err(simple_error(interp, "handler types and functions disagree".to_string()));
    }
    let handlers = classes
        .into_iter()
        .zip(&args[2..])
        .map(|(class, function)| Handler { class, function: function.clone() })
        .collect();
    let thunk = args[1].clone();
    handler_bind(interp, handlers, move |interp| interp.apply(&thunk, &[]))
}

/// (%restart-case ((name report)...) thunk interactive function ...)
fn prim_restart_case(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%RESTART-CASE", args, 2, None)?;
    let specs_list = list_arg(interp, &args[0])?;
    let clauses = &args[2..];
    if clauses.len() != specs_list.len() * 2 {
        return Err(simple_error(interp, "restart clauses and functions disagree".to_string()));
    }
    let mut specs = Vec::with_capacity(specs_list.len());
    for (spec, pair) in specs_list.iter().zip(clauses.chunks(2)) {
        let (name, report) = match spec.as_list() {
            Some([name, report]) => (name.as_symbol(), report.as_str().map(str::to_string)),
            _ => return Err(type_error(interp, spec, "RESTART SPECIFICATION")),
        };
        specs.push(RestartSpec {
            name,
            report,
            interactive: if pair[0].is_nil() { None } else { Some(pair[0].clone()) },
            associated: None,
        });
    }
    let thunk = args[1].clone();
    match restart_case(interp, specs, move |interp| interp.apply(&thunk, &[]))? {
        RestartOutcome::Returned(v) => Ok(v),
        RestartOutcome::Invoked { index, args: restart_args } => match clauses.get(index * 2 + 1) {
            Some(function) => interp.apply(function, &restart_args),
            None => Err(simple_error(interp, "restart clause out of range".to_string())),
        },
    }
}

/// (%restart-bind names thunk function report-function interactive-function ...).
/// The report function is called once, with no arguments, when the
/// restart is established.
fn prim_restart_bind(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    arity(interp, "%RESTART-BIND", args, 2, None)?;
    let names = list_arg(interp, &args[0])?;
    let parts = &args[2..];
    if parts.len() != names.len() * 3 {
        return Err(simple_error(interp, "restart names and functions disagree".to_string()));
    }
    let mut restarts = Vec::with_capacity(names.len());
    for (name, triple) in names.iter().zip(parts.chunks(3)) {
        let report = match &triple[1] {
            Value::Nil => None,
            Value::String(s) => Some(s.to_string()),
            function => {
                let text = interp.apply(function, &[])?;
                Some(interp.princ_to_string(&text))
            }
        };
        restarts.push(Arc::new(Restart {
            name: name.as_symbol(),
            report,
            interactive: if triple[2].is_nil() { None } else { Some(triple[2].clone()) },
            function: triple[0].clone(),
            associated: Vec::new(),
        }));
    }
    interp.process.conditions.push_restarts(restarts);
    let result = interp.apply(&args[1], &[]);
    interp.process.conditions.pop_restarts();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;

    fn run(ctx: &GlobalContext, text: &str) -> Result<String, String> {
        let mut process = Process::new();
        let mut interp = Interpreter::new(&mut process, ctx);
        match interp.eval_string(text) {
            Ok(v) => Ok(interp.prin1_to_string(&v)),
            Err(signal) => Err(interp.describe_signal(&signal)),
        }
    }

    #[test]
    fn test_integer_arithmetic() {
        let ctx = GlobalContext::new();
        assert_eq!(run(&ctx, "(+ 9223372036854775807 1)").unwrap(), "9223372036854775808");
        assert_eq!(run(&ctx, "(- (+ 9223372036854775807 1) 1)").unwrap(), "9223372036854775807");
        assert_eq!(run(&ctx, "(/ 12 4)").unwrap(), "3");
        assert_eq!(run(&ctx, "(floor -7 2)").unwrap(), "-4");
        assert_eq!(run(&ctx, "(ceiling 7 2)").unwrap(), "4");
        assert_eq!(run(&ctx, "(truncate -7 2)").unwrap(), "-3");
        assert_eq!(run(&ctx, "(mod -7 2)").unwrap(), "1");
        assert_eq!(run(&ctx, "(rem -7 2)").unwrap(), "-1");
        assert_eq!(run(&ctx, "(expt 2 70)").unwrap(), "1180591620717411303424");
    }

    #[test]
    fn test_division_by_zero() {
        let ctx = GlobalContext::new();
        let err = run(&ctx, "(/ 1 0)").unwrap_err();
        assert!(err.starts_with("DIVISION-BY-ZERO"), "{}", err);
        assert!(run(&ctx, "(mod 3 0)").unwrap_err().starts_with("DIVISION-BY-ZERO"));
    }

    #[test]
    fn test_sequences() {
        let ctx = GlobalContext::new();
        assert_eq!(run(&ctx, "(sort (list 3 1 2) #'<)").unwrap(), "(1 2 3)");
        assert_eq!(run(&ctx, "(reverse #(1 2 3))").unwrap(), "#(3 2 1)");
        assert_eq!(run(&ctx, "(subseq \"hello\" 1 3)").unwrap(), "\"el\"");
        assert_eq!(run(&ctx, "(concatenate 'string \"ab\" \"cd\")").unwrap(), "\"abcd\"");
        assert_eq!(run(&ctx, "(reduce #'+ (list 1 2 3 4))").unwrap(), "10");
        assert_eq!(run(&ctx, "(remove 2 (list 1 2 3 2))").unwrap(), "(1 3)");
        assert_eq!(run(&ctx, "(position 3 (list 1 2 3))").unwrap(), "2");
        assert_eq!(run(&ctx, "(nthcdr 5 (list 1 2))").unwrap(), "NIL");
        assert!(run(&ctx, "(elt (list 1 2) 5)").unwrap_err().contains("out of bounds"));
    }

    #[test]
    fn test_sort_is_stable() {
        let ctx = GlobalContext::new();
        let sorted = run(
            &ctx,
            "(sort (list (list 1 :a) (list 0 :b) (list 1 :c) (list 0 :d)) #'< :key #'car)",
        )
        .unwrap();
        assert_eq!(sorted, "((0 :B) (0 :D) (1 :A) (1 :C))");
    }

    #[test]
    fn test_strings_and_format() {
        let ctx = GlobalContext::new();
        assert_eq!(run(&ctx, "(format nil \"~a-~a\" 1 2)").unwrap(), "\"1-2\"");
        assert_eq!(run(&ctx, "(string-upcase \"abc\")").unwrap(), "\"ABC\"");
        assert_eq!(run(&ctx, "(parse-integer \"ff\" :radix 16)").unwrap(), "255");
        assert!(run(&ctx, "(parse-integer \"12x\")").unwrap_err().contains("junk"));
    }

    #[test]
    fn test_packages() {
        let ctx = GlobalContext::new();
        assert_eq!(run(&ctx, "(package-name (make-package \"TEST-PKG\"))").unwrap(), "\"TEST-PKG\"");
        assert!(run(&ctx, "(make-package \"TEST-PKG\")").is_err());
        assert_eq!(
            run(&ctx, "(package-name (car (package-use-list \"TEST-PKG\")))").unwrap(),
            "\"COMMON-LISP\""
        );
    }

    #[test]
    fn test_arity_errors() {
        let ctx = GlobalContext::new();
        let err = run(&ctx, "(car 1 2)").unwrap_err();
        assert!(err.contains("CAR"), "{}", err);
        assert!(run(&ctx, "(cons 1 2)").unwrap_err().starts_with("TYPE-ERROR"));
    }
}
