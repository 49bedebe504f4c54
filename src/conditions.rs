// HostCL Condition System - Handlers and Restarts
//
// Implements ANSI CL condition/handler/restart semantics. Signalling
// never unwinds by itself: handlers run on top of the signaller's stack
// and leave only by returning (decline) or by a throw to an established
// tag. Handler and restart clusters are per process.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::clos::{BuiltinClasses, ClassId, DispatchError};
use crate::compiler::CompileError;
use crate::eval::{Caught, ControlSignal, EvalResult, Interpreter};
use crate::printer::PrintError;
use crate::reader::ReaderError;
use crate::symbol::{PackageError, SymbolId};
use crate::types::Value;

/// A condition instance
#[derive(Debug, Clone)]
pub struct Condition {
    pub class: ClassId,
    pub slots: HashMap<SymbolId, Value>,
    pub format_control: Option<String>,
    pub format_arguments: Vec<Value>,
}

impl Condition {
    pub fn new(class: ClassId) -> Self {
        Self {
            class,
            slots: HashMap::new(),
            format_control: None,
            format_arguments: Vec::new(),
        }
    }

    pub fn simple(class: ClassId, control: &str, args: Vec<Value>) -> Self {
        Self {
            class,
            slots: HashMap::new(),
            format_control: Some(control.to_string()),
            format_arguments: args,
        }
    }
}

/// A restart
#[derive(Debug)]
pub struct Restart {
    pub name: Option<SymbolId>,
    pub report: Option<String>,
    pub interactive: Option<Value>,
    pub function: Value,
    /// Empty means the restart applies to every condition
    pub associated: Vec<Arc<Condition>>,
}

impl Restart {
    pub fn applies_to(&self, condition: Option<&Arc<Condition>>) -> bool {
        match condition {
            None => true,
            Some(c) => self.associated.is_empty() || self.associated.iter().any(|a| Arc::ptr_eq(a, c)),
        }
    }
}

/// A handler binding
#[derive(Debug, Clone)]
pub struct Handler {
    /// Condition class to handle
    pub class: ClassId,
    /// Handler function, called with the condition
    pub function: Value,
}

/// Errors raised by the runtime itself. Each is delivered as a condition
/// of the matching class so user handlers can intercept it.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("the variable {0} is unbound")]
    UnboundVariable(String),
    #[error("the function {0} is undefined")]
    UndefinedFunction(String),
    #[error("{0} is not a function")]
    NotAFunction(String),
    #[error("the value {datum} is not of type {expected}")]
    TypeError { datum: String, expected: String },
    #[error("{function} was called with {got} arguments, but it expects {expected}")]
    ArgumentCount {
        function: String,
        expected: String,
        got: usize,
    },
    #[error("unknown keyword argument {keyword} in call to {function}")]
    UnknownKeyword { function: String, keyword: String },
    #[error("odd number of keyword arguments in call to {0}")]
    OddKeywordArguments(String),
    #[error("arithmetic error: division by zero")]
    DivisionByZero,
    #[error("attempt to throw to a tag that does not exist: {0}")]
    NoCatchTag(String),
    #[error("the restart {0} is not active")]
    NoSuchRestart(String),
    #[error("cannot assign to the constant {0}")]
    ConstantAssignment(String),
    #[error("call depth exceeded {0} frames")]
    CallDepthExceeded(usize),
    #[error("there is no class named {0}")]
    NoSuchClass(String),
    #[error("the slot {slot} is missing from {object}")]
    MissingSlot { slot: String, object: String },
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    Print(#[from] PrintError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("{0}")]
    Simple(String),
}

impl RuntimeError {
    /// The condition class this error is signalled as.
    pub fn class(&self, b: &BuiltinClasses) -> ClassId {
        match self {
            RuntimeError::UnboundVariable(_) => b.unbound_variable,
            RuntimeError::UndefinedFunction(_) => b.undefined_function,
            RuntimeError::NotAFunction(_) | RuntimeError::TypeError { .. } => b.type_error,
            RuntimeError::ArgumentCount { .. }
            | RuntimeError::UnknownKeyword { .. }
            | RuntimeError::OddKeywordArguments(_)
            | RuntimeError::ConstantAssignment(_) => b.program_error,
            RuntimeError::DivisionByZero => b.division_by_zero,
            RuntimeError::NoCatchTag(_) | RuntimeError::NoSuchRestart(_) => b.control_error,
            RuntimeError::CallDepthExceeded(_) => b.storage_condition,
            RuntimeError::NoSuchClass(_) | RuntimeError::MissingSlot { .. } => b.error,
            RuntimeError::Package(PackageError::NameConflict { .. }) => b.name_conflict,
            RuntimeError::Package(_) => b.package_error,
            RuntimeError::Reader(ReaderError::EndOfStream) => b.end_of_file,
            RuntimeError::Reader(_) => b.reader_error,
            RuntimeError::Print(PrintError::NotReadable(_)) => b.print_not_readable,
            RuntimeError::Print(_) => b.simple_error,
            RuntimeError::Compile(CompileError::FixpointDiverged(_)) => b.error,
            RuntimeError::Compile(_) => b.program_error,
            RuntimeError::Dispatch(DispatchError::NoApplicableMethod { .. }) => {
                b.no_applicable_method_error
            }
            RuntimeError::Dispatch(DispatchError::NoNextMethod { .. }) => b.no_next_method_error,
            RuntimeError::Dispatch(DispatchError::LambdaListCongruence { .. }) => {
                b.lambda_list_congruence_error
            }
            RuntimeError::Dispatch(_) => b.program_error,
            RuntimeError::Simple(_) => b.simple_error,
        }
    }
}

/// The condition system runtime
#[derive(Debug, Default)]
pub struct ConditionSystem {
    /// Stack of handler clusters (each HANDLER-BIND pushes a cluster)
    handler_stack: Vec<Vec<Handler>>,
    /// Stack of restart clusters (each RESTART-CASE pushes a cluster)
    restart_stack: Vec<Vec<Arc<Restart>>>,
}

impl ConditionSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new handler cluster
    pub fn push_handlers(&mut self, handlers: Vec<Handler>) {
        self.handler_stack.push(handlers);
    }

    /// Pop a handler cluster
    pub fn pop_handlers(&mut self) {
        self.handler_stack.pop();
    }

    /// Push a new restart cluster
    pub fn push_restarts(&mut self, restarts: Vec<Arc<Restart>>) {
        self.restart_stack.push(restarts);
    }

    /// Pop a restart cluster
    pub fn pop_restarts(&mut self) {
        self.restart_stack.pop();
    }

    pub fn handler_depth(&self) -> usize {
        self.handler_stack.len()
    }

    pub fn restart_depth(&self) -> usize {
        self.restart_stack.len()
    }

    pub fn cluster(&self, index: usize) -> &[Handler] {
        self.handler_stack.get(index).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// Detaches the clusters at `index` and above while a handler from
    /// cluster `index` runs.
    pub fn hide_handlers_from(&mut self, index: usize) -> Vec<Vec<Handler>> {
        self.handler_stack.split_off(index)
    }

    pub fn restore_handlers(&mut self, hidden: Vec<Vec<Handler>>) {
        self.handler_stack.extend(hidden);
    }

    /// Find a restart by name, innermost first
    pub fn find_restart(
        &self,
        name: SymbolId,
        condition: Option<&Arc<Condition>>,
    ) -> Option<Arc<Restart>> {
        self.restart_stack
            .iter()
            .rev()
            .flat_map(|cluster| cluster.iter())
            .find(|r| r.name == Some(name) && r.applies_to(condition))
            .cloned()
    }

    /// All active restarts visible for `condition`, innermost first
    pub fn compute_restarts(&self, condition: Option<&Arc<Condition>>) -> Vec<Arc<Restart>> {
        self.restart_stack
            .iter()
            .rev()
            .flat_map(|cluster| cluster.iter())
            .filter(|r| r.applies_to(condition))
            .cloned()
            .collect()
    }
}

/// Offers `condition` to every applicable handler, innermost cluster
/// first. Returns normally when all of them decline.
pub fn signal(interp: &mut Interpreter<'_>, condition: &Arc<Condition>) -> Result<(), ControlSignal> {
    let mut index = interp.process.conditions.handler_depth();
    while index > 0 {
        index -= 1;
        let applicable: Vec<Value> = {
            let classes = interp.globals.classes();
            interp
                .process
                .conditions
                .cluster(index)
                .iter()
                .filter(|h| classes.subclassp(condition.class, h.class))
                .map(|h| h.function.clone())
                .collect()
        };
        if applicable.is_empty() {
            continue;
        }

        let hidden = interp.process.conditions.hide_handlers_from(index);
        let mut outcome = Ok(());
        for function in &applicable {
            if let Err(signal) = interp.apply(function, &[Value::Condition(condition.clone())]) {
                outcome = Err(signal);
                break;
            }
        }
        interp.process.conditions.restore_handlers(hidden);
        outcome?;
    }
    Ok(())
}

/// Signals `condition`; if nobody transfers control, hands it to the
/// debugger and starts unwinding.
pub fn error(interp: &mut Interpreter<'_>, condition: Arc<Condition>) -> ControlSignal {
    if let Err(signal) = signal(interp, &condition) {
        return signal;
    }
    if let Err(signal) = crate::debug::invoke_debugger(interp, &condition) {
        return signal;
    }
    ControlSignal::Unwind(condition)
}

/// Builds the condition object for a runtime error.
pub fn condition_from_error(interp: &Interpreter<'_>, err: &RuntimeError) -> Arc<Condition> {
    let class = err.class(interp.globals.builtins());
    Arc::new(Condition::simple(class, "~A", vec![Value::string(&err.to_string())]))
}

/// Signals a warning, logging it once unless a handler muffles it.
pub fn warn(interp: &mut Interpreter<'_>, condition: Arc<Condition>) -> EvalResult {
    let spec = RestartSpec {
        name: Some(interp.globals.wk.muffle_warning),
        report: Some("Ignore the warning.".to_string()),
        interactive: None,
        associated: Some(condition.clone()),
    };
    let cond = condition.clone();
    restart_case(interp, vec![spec], move |interp| {
        signal(interp, &cond)?;
        let text = describe_condition(interp, &cond);
        log::warn!("{}", text);
        Ok(Value::Nil)
    })?;
    Ok(Value::Nil)
}

/// Signals an error with a CONTINUE restart that makes the call return NIL.
pub fn cerror(interp: &mut Interpreter<'_>, continue_text: String, condition: Arc<Condition>) -> EvalResult {
    let spec = RestartSpec {
        name: Some(interp.globals.wk.continue_),
        report: Some(continue_text),
        interactive: None,
        associated: Some(condition.clone()),
    };
    match restart_case(interp, vec![spec], move |interp| Err(error(interp, condition)))? {
        RestartOutcome::Returned(v) => Ok(v),
        RestartOutcome::Invoked { .. } => Ok(Value::Nil),
    }
}

/// How a restart is established.
pub struct RestartSpec {
    pub name: Option<SymbolId>,
    pub report: Option<String>,
    pub interactive: Option<Value>,
    pub associated: Option<Arc<Condition>>,
}

pub enum RestartOutcome {
    Returned(Value),
    Invoked { index: usize, args: Vec<Value> },
}

pub enum HandlerOutcome {
    Returned(Value),
    Caught { index: usize, condition: Arc<Condition> },
}

fn malformed_transfer(interp: &mut Interpreter<'_>) -> ControlSignal {
    interp.raise(RuntimeError::Simple("malformed non-local transfer payload".to_string()))
}

/// Runs `body` with a cluster of restarts. Invoking one of them unwinds
/// back here and reports which one and with what arguments.
pub fn restart_case(
    interp: &mut Interpreter<'_>,
    specs: Vec<RestartSpec>,
    body: impl FnOnce(&mut Interpreter<'_>) -> EvalResult,
) -> Result<RestartOutcome, ControlSignal> {
    let tag = fresh_tag("RESTART-CASE");
    let restarts = specs
        .into_iter()
        .enumerate()
        .map(|(index, spec)| {
            let target = tag.clone();
            Arc::new(Restart {
                name: spec.name,
                report: spec.report,
                interactive: spec.interactive,
                associated: spec.associated.into_iter().collect(),
                function: Value::native("INVOKE-RESTART", move |interp, args| {
                    let payload = Value::list(vec![
                        Value::Integer(index as i64),
                        Value::list(args.to_vec()),
                    ]);
                    Err(interp.throw(target.clone(), payload))
                }),
            })
        })
        .collect();

    interp.process.conditions.push_restarts(restarts);
    let caught = interp.with_catch(&tag, body);
    interp.process.conditions.pop_restarts();

    match caught? {
        Caught::Returned(v) => Ok(RestartOutcome::Returned(v)),
        Caught::Thrown(payload) => match payload.as_list() {
            Some([Value::Integer(index), args]) => Ok(RestartOutcome::Invoked {
                index: *index as usize,
                args: args.as_list().map(|a| a.to_vec()).unwrap_or_default(),
            }),
            _ => Err(malformed_transfer(interp)),
        },
    }
}

/// Runs `body`; the first condition of one of `classes` unwinds back here.
pub fn handler_case(
    interp: &mut Interpreter<'_>,
    classes: Vec<ClassId>,
    body: impl FnOnce(&mut Interpreter<'_>) -> EvalResult,
) -> Result<HandlerOutcome, ControlSignal> {
    let tag = fresh_tag("HANDLER-CASE");
    let handlers = classes
        .into_iter()
        .enumerate()
        .map(|(index, class)| {
            let target = tag.clone();
            Handler {
                class,
                function: Value::native("HANDLER-CASE-CLAUSE", move |interp, args| {
                    let condition = args.first().cloned().unwrap_or(Value::Nil);
                    let payload = Value::list(vec![Value::Integer(index as i64), condition]);
                    Err(interp.throw(target.clone(), payload))
                }),
            }
        })
        .collect();

    interp.process.conditions.push_handlers(handlers);
    let caught = interp.with_catch(&tag, body);
    interp.process.conditions.pop_handlers();

    match caught? {
        Caught::Returned(v) => Ok(HandlerOutcome::Returned(v)),
        Caught::Thrown(payload) => match payload.as_list() {
            Some([Value::Integer(index), Value::Condition(condition)]) => Ok(HandlerOutcome::Caught {
                index: *index as usize,
                condition: condition.clone(),
            }),
            _ => Err(malformed_transfer(interp)),
        },
    }
}

/// Runs `body` with a handler cluster whose handlers run without unwinding.
pub fn handler_bind(
    interp: &mut Interpreter<'_>,
    handlers: Vec<Handler>,
    body: impl FnOnce(&mut Interpreter<'_>) -> EvalResult,
) -> EvalResult {
    interp.process.conditions.push_handlers(handlers);
    let result = body(interp);
    interp.process.conditions.pop_handlers();
    result
}

pub fn invoke_restart(interp: &mut Interpreter<'_>, restart: &Arc<Restart>, args: &[Value]) -> EvalResult {
    interp.apply(&restart.function, args)
}

/// A catch tag that no other establishment can share.
pub fn fresh_tag(label: &str) -> Value {
    Value::List(Arc::from(vec![Value::string(label)]))
}

/// The report text of a condition.
pub fn describe_condition(interp: &Interpreter<'_>, condition: &Condition) -> String {
    if let Some(control) = &condition.format_control {
        return crate::printer::format(interp, control, &condition.format_arguments)
            .unwrap_or_else(|e| e.to_string());
    }
    let classes = interp.globals.classes();
    if let Some(report) = classes.get(condition.class).and_then(|c| c.report.clone()) {
        return report;
    }
    let name = classes.class_name(condition.class);
    drop(classes);
    let name = interp.symbol_name(name);
    format!("Condition of type {} was signalled.", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clos::ClassTable;
    use crate::symbol::{SymbolTable, CL_USER};

    fn table() -> (SymbolTable, ClassTable) {
        let mut symbols = SymbolTable::new();
        let classes = ClassTable::new(&mut symbols);
        (symbols, classes)
    }

    #[test]
    fn test_condition_class_hierarchy() {
        let (_, classes) = table();
        let b = classes.builtins();

        // Error is a subtype of serious-condition
        assert!(classes.subclassp(b.error, b.serious_condition));
        // Error is a subtype of condition
        assert!(classes.subclassp(b.simple_error, b.condition));
        // Warning is a subtype of condition
        assert!(classes.subclassp(b.warning, b.condition));
        // Error is not a subtype of warning
        assert!(!classes.subclassp(b.error, b.warning));
    }

    #[test]
    fn test_restart_visibility_follows_association() {
        let (mut symbols, classes) = table();
        let b = classes.builtins();
        let name = symbols.intern_in("RETRY", CL_USER);
        let mine = Arc::new(Condition::new(b.error));
        let other = Arc::new(Condition::new(b.error));

        let mut sys = ConditionSystem::new();
        sys.push_restarts(vec![Arc::new(Restart {
            name: Some(name),
            report: Some("Retry".to_string()),
            interactive: None,
            function: Value::Nil,
            associated: vec![mine.clone()],
        })]);

        assert!(sys.find_restart(name, Some(&mine)).is_some());
        assert!(sys.find_restart(name, Some(&other)).is_none());
        assert_eq!(sys.compute_restarts(None).len(), 1);

        sys.pop_restarts();
        assert!(sys.find_restart(name, None).is_none());
    }

    #[test]
    fn test_hidden_handlers_are_restored() {
        let (_, classes) = table();
        let b = classes.builtins();
        let mut sys = ConditionSystem::new();
        sys.push_handlers(vec![Handler { class: b.condition, function: Value::Integer(1) }]);
        sys.push_handlers(vec![Handler { class: b.error, function: Value::Integer(2) }]);

        let hidden = sys.hide_handlers_from(1);
        assert_eq!(sys.handler_depth(), 1);
        sys.restore_handlers(hidden);
        assert_eq!(sys.handler_depth(), 2);
        assert_eq!(sys.cluster(1)[0].function, Value::Integer(2));
    }

    #[test]
    fn test_runtime_error_classes() {
        let (_, classes) = table();
        let b = classes.builtins();
        assert_eq!(RuntimeError::UnboundVariable("X".into()).class(b), b.unbound_variable);
        assert_eq!(RuntimeError::DivisionByZero.class(b), b.division_by_zero);
        assert!(classes.subclassp(
            RuntimeError::NoCatchTag("FOO".into()).class(b),
            b.error
        ));
    }
}
