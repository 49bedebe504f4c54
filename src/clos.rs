// HostCL CLOS - Classes, Generic Functions and Method Combination
//
// Implements a small class lattice (builtin types, user classes and
// condition classes share it) and generic dispatch with standard and
// operator method combination.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::conditions::RuntimeError;
use crate::eval::{EvalResult, Interpreter};
use crate::lambda_list::LambdaShape;
use crate::symbol::{SymbolId, SymbolTable, COMMON_LISP};
use crate::types::{Function, Value};

/// Unique identifier for a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    BuiltIn,
    Standard,
    Condition,
}

/// A slot definition
#[derive(Debug, Clone)]
pub struct SlotDefinition {
    pub name: SymbolId,
    pub initarg: Option<SymbolId>,
    /// Zero-argument function computing the initial value
    pub initfunction: Option<Value>,
    pub readers: Vec<SymbolId>,
    pub writers: Vec<SymbolId>,
}

/// A class definition
#[derive(Debug, Clone)]
pub struct Class {
    pub name: SymbolId,
    pub kind: ClassKind,
    /// Direct superclasses
    pub supers: Vec<ClassId>,
    pub direct_slots: Vec<SlotDefinition>,
    /// Effective slots; an instance stores one value per entry
    pub slots: Vec<SlotDefinition>,
    /// Class precedence list (computed)
    pub cpl: Vec<ClassId>,
    /// Fixed report text for condition classes
    pub report: Option<String>,
}

/// Ids of the classes every runtime has.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinClasses {
    pub t: ClassId,
    pub standard_object: ClassId,
    pub class: ClassId,
    pub number: ClassId,
    pub real: ClassId,
    pub integer: ClassId,
    pub fixnum: ClassId,
    pub bignum: ClassId,
    pub float: ClassId,
    pub character: ClassId,
    pub sequence: ClassId,
    pub list: ClassId,
    pub cons: ClassId,
    pub symbol: ClassId,
    pub null: ClassId,
    pub keyword: ClassId,
    pub vector: ClassId,
    pub string: ClassId,
    pub function: ClassId,
    pub generic_function: ClassId,
    pub package: ClassId,
    pub restart: ClassId,
    pub condition: ClassId,
    pub warning: ClassId,
    pub style_warning: ClassId,
    pub serious_condition: ClassId,
    pub error: ClassId,
    pub simple_condition: ClassId,
    pub simple_error: ClassId,
    pub simple_warning: ClassId,
    pub type_error: ClassId,
    pub program_error: ClassId,
    pub control_error: ClassId,
    pub cell_error: ClassId,
    pub unbound_variable: ClassId,
    pub undefined_function: ClassId,
    pub package_error: ClassId,
    pub name_conflict: ClassId,
    pub reader_error: ClassId,
    pub end_of_file: ClassId,
    pub print_not_readable: ClassId,
    pub arithmetic_error: ClassId,
    pub division_by_zero: ClassId,
    pub storage_condition: ClassId,
    pub no_applicable_method_error: ClassId,
    pub no_next_method_error: ClassId,
    pub lambda_list_congruence_error: ClassId,
}

/// Every class known to the runtime
#[derive(Debug)]
pub struct ClassTable {
    classes: Vec<Class>,
    /// Class name -> ClassId lookup
    class_names: HashMap<SymbolId, ClassId>,
    builtins: BuiltinClasses,
    /// Bumped on every (re)definition; dispatch caches key on it
    epoch: u64,
}

impl ClassTable {
    pub fn new(symbols: &mut SymbolTable) -> Self {
        let mut table = Self {
            classes: Vec::new(),
            class_names: HashMap::new(),
            builtins: BuiltinClasses::placeholder(),
            epoch: 0,
        };
        let mut def = |name: &str, supers: &[ClassId], kind: ClassKind| {
            let sym = symbols.intern_exported(name, COMMON_LISP);
            table.define_class(sym, supers.to_vec(), Vec::new(), kind, None)
        };
        use ClassKind::{BuiltIn, Condition};

        let t = def("T", &[], BuiltIn);
        let standard_object = def("STANDARD-OBJECT", &[t], BuiltIn);
        let class = def("CLASS", &[standard_object], BuiltIn);
        let number = def("NUMBER", &[t], BuiltIn);
        let real = def("REAL", &[number], BuiltIn);
        let integer = def("INTEGER", &[real], BuiltIn);
        let fixnum = def("FIXNUM", &[integer], BuiltIn);
        let bignum = def("BIGNUM", &[integer], BuiltIn);
        let float = def("FLOAT", &[real], BuiltIn);
        let character = def("CHARACTER", &[t], BuiltIn);
        let sequence = def("SEQUENCE", &[t], BuiltIn);
        let list = def("LIST", &[sequence], BuiltIn);
        let cons = def("CONS", &[list], BuiltIn);
        let symbol = def("SYMBOL", &[t], BuiltIn);
        let null = def("NULL", &[symbol, list], BuiltIn);
        let keyword = def("KEYWORD", &[symbol], BuiltIn);
        let vector = def("VECTOR", &[sequence], BuiltIn);
        let string = def("STRING", &[vector], BuiltIn);
        let function = def("FUNCTION", &[t], BuiltIn);
        let generic_function = def("GENERIC-FUNCTION", &[function], BuiltIn);
        let package = def("PACKAGE", &[t], BuiltIn);
        let restart = def("RESTART", &[t], BuiltIn);

        let condition = def("CONDITION", &[t], Condition);
        let warning = def("WARNING", &[condition], Condition);
        let style_warning = def("STYLE-WARNING", &[warning], Condition);
        let serious_condition = def("SERIOUS-CONDITION", &[condition], Condition);
        let error = def("ERROR", &[serious_condition], Condition);
        let simple_condition = def("SIMPLE-CONDITION", &[condition], Condition);
        let simple_error = def("SIMPLE-ERROR", &[simple_condition, error], Condition);
        let simple_warning = def("SIMPLE-WARNING", &[simple_condition, warning], Condition);
        let type_error = def("TYPE-ERROR", &[error], Condition);
        let program_error = def("PROGRAM-ERROR", &[error], Condition);
        let control_error = def("CONTROL-ERROR", &[error], Condition);
        let cell_error = def("CELL-ERROR", &[error], Condition);
        let unbound_variable = def("UNBOUND-VARIABLE", &[cell_error], Condition);
        let undefined_function = def("UNDEFINED-FUNCTION", &[cell_error], Condition);
        let package_error = def("PACKAGE-ERROR", &[error], Condition);
        let name_conflict = def("NAME-CONFLICT", &[package_error], Condition);
        let reader_error = def("READER-ERROR", &[error], Condition);
        let end_of_file = def("END-OF-FILE", &[reader_error], Condition);
        let print_not_readable = def("PRINT-NOT-READABLE", &[error], Condition);
        let arithmetic_error = def("ARITHMETIC-ERROR", &[error], Condition);
        let division_by_zero = def("DIVISION-BY-ZERO", &[arithmetic_error], Condition);
        let storage_condition = def("STORAGE-CONDITION", &[serious_condition], Condition);
        let no_applicable_method_error = def("NO-APPLICABLE-METHOD-ERROR", &[error], Condition);
        let no_next_method_error = def("NO-NEXT-METHOD-ERROR", &[error], Condition);
        let lambda_list_congruence_error =
            def("LAMBDA-LIST-CONGRUENCE-ERROR", &[program_error], Condition);

        table.builtins = BuiltinClasses {
            t,
            standard_object,
            class,
            number,
            real,
            integer,
            fixnum,
            bignum,
            float,
            character,
            sequence,
            list,
            cons,
            symbol,
            null,
            keyword,
            vector,
            string,
            function,
            generic_function,
            package,
            restart,
            condition,
            warning,
            style_warning,
            serious_condition,
            error,
            simple_condition,
            simple_error,
            simple_warning,
            type_error,
            program_error,
            control_error,
            cell_error,
            unbound_variable,
            undefined_function,
            package_error,
            name_conflict,
            reader_error,
            end_of_file,
            print_not_readable,
            arithmetic_error,
            division_by_zero,
            storage_condition,
            no_applicable_method_error,
            no_next_method_error,
            lambda_list_congruence_error,
        };
        table
    }

    pub fn builtins(&self) -> &BuiltinClasses {
        &self.builtins
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Defines or redefines the class named `name`. A redefinition keeps
    /// the class id.
    pub fn define_class(
        &mut self,
        name: SymbolId,
        supers: Vec<ClassId>,
        direct_slots: Vec<SlotDefinition>,
        kind: ClassKind,
        report: Option<String>,
    ) -> ClassId {
        let id = match self.class_names.get(&name) {
            Some(&existing) => existing,
            None => {
                let id = ClassId(self.classes.len() as u32);
                self.classes.push(Class {
                    name,
                    kind,
                    supers: Vec::new(),
                    direct_slots: Vec::new(),
                    slots: Vec::new(),
                    cpl: vec![id],
                    report: None,
                });
                self.class_names.insert(name, id);
                id
            }
        };

        let cpl = self.compute_cpl(id, &supers);
        let slots = self.compute_slots(&cpl, id, &direct_slots);
        let class = &mut self.classes[id.0 as usize];
        class.kind = kind;
        class.supers = supers;
        class.direct_slots = direct_slots;
        class.cpl = cpl;
        class.slots = slots;
        class.report = report;
        self.refinalize_subclasses(id);
        self.epoch += 1;
        log::debug!("defined class #{} ({} slots)", id.0, self.classes[id.0 as usize].slots.len());
        id
    }

    /// Recomputes the precedence list and effective slots of every class
    /// that inherits from `id`. Superclasses come first, since their
    /// precedence lists are shorter.
    fn refinalize_subclasses(&mut self, id: ClassId) {
        let mut dependents: Vec<(usize, ClassId)> = self
            .classes
            .iter()
            .enumerate()
            .filter(|(i, c)| *i != id.0 as usize && c.cpl.contains(&id))
            .map(|(i, c)| (c.cpl.len(), ClassId(i as u32)))
            .collect();
        dependents.sort();
        for (_, sub) in dependents {
            let class = &self.classes[sub.0 as usize];
            let cpl = self.compute_cpl(sub, &class.supers);
            let slots = self.compute_slots(&cpl, sub, &class.direct_slots);
            let class = &mut self.classes[sub.0 as usize];
            class.cpl = cpl;
            class.slots = slots;
        }
    }

    /// Depth-first, left-to-right walk of the superclasses; a class that
    /// appears more than once keeps its last position.
    fn compute_cpl(&self, id: ClassId, supers: &[ClassId]) -> Vec<ClassId> {
        let mut walk = vec![id];
        for &sup in supers {
            walk.extend(self.cpl(sup).iter().copied());
        }
        let mut cpl = Vec::with_capacity(walk.len());
        for (i, c) in walk.iter().enumerate() {
            if !walk[i + 1..].contains(c) {
                cpl.push(*c);
            }
        }
        cpl
    }

    fn compute_slots(
        &self,
        cpl: &[ClassId],
        id: ClassId,
        direct: &[SlotDefinition],
    ) -> Vec<SlotDefinition> {
        let mut slots: Vec<SlotDefinition> = Vec::new();
        for &c in cpl.iter().rev() {
            let defs = if c == id {
                direct
            } else {
                self.classes[c.0 as usize].direct_slots.as_slice()
            };
            for slot in defs {
                match slots.iter_mut().find(|s| s.name == slot.name) {
                    Some(existing) => *existing = slot.clone(),
                    None => slots.push(slot.clone()),
                }
            }
        }
        slots
    }

    pub fn find_class(&self, name: SymbolId) -> Option<ClassId> {
        self.class_names.get(&name).copied()
    }

    pub fn get(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.0 as usize)
    }

    pub fn class_name(&self, id: ClassId) -> SymbolId {
        self.classes[id.0 as usize].name
    }

    pub fn cpl(&self, id: ClassId) -> &[ClassId] {
        self.get(id).map(|c| c.cpl.as_slice()).unwrap_or(&[])
    }

    /// True when `a` is `b` or inherits from it.
    pub fn subclassp(&self, a: ClassId, b: ClassId) -> bool {
        self.cpl(a).contains(&b)
    }

    pub fn slot_index(&self, class: ClassId, slot: SymbolId) -> Option<usize> {
        self.get(class)?.slots.iter().position(|s| s.name == slot)
    }

    /// The class of a value. Symbols need to be told whether they are
    /// keywords since that lives in the symbol table.
    pub fn class_of(&self, value: &Value, keyword: bool) -> ClassId {
        let b = &self.builtins;
        match value {
            Value::Nil => b.null,
            Value::Integer(_) => b.fixnum,
            Value::BigInt(_) => b.bignum,
            Value::Float(_) => b.float,
            Value::Char(_) => b.character,
            Value::String(_) => b.string,
            Value::Symbol(_) if keyword => b.keyword,
            Value::Symbol(_) => b.symbol,
            Value::List(_) => b.cons,
            Value::Vector(_) => b.vector,
            Value::Package(_) => b.package,
            Value::Function(Function::Generic(_)) => b.generic_function,
            Value::Function(_) => b.function,
            Value::Condition(c) => c.class,
            Value::Restart(_) => b.restart,
            Value::Instance(i) => i.class,
            Value::Class(_) => b.class,
            Value::Unbound => b.t,
        }
    }
}

impl BuiltinClasses {
    fn placeholder() -> Self {
        let z = ClassId(0);
        Self {
            t: z,
            standard_object: z,
            class: z,
            number: z,
            real: z,
            integer: z,
            fixnum: z,
            bignum: z,
            float: z,
            character: z,
            sequence: z,
            list: z,
            cons: z,
            symbol: z,
            null: z,
            keyword: z,
            vector: z,
            string: z,
            function: z,
            generic_function: z,
            package: z,
            restart: z,
            condition: z,
            warning: z,
            style_warning: z,
            serious_condition: z,
            error: z,
            simple_condition: z,
            simple_error: z,
            simple_warning: z,
            type_error: z,
            program_error: z,
            control_error: z,
            cell_error: z,
            unbound_variable: z,
            undefined_function: z,
            package_error: z,
            name_conflict: z,
            reader_error: z,
            end_of_file: z,
            print_not_readable: z,
            arithmetic_error: z,
            division_by_zero: z,
            storage_condition: z,
            no_applicable_method_error: z,
            no_next_method_error: z,
            lambda_list_congruence_error: z,
        }
    }
}

/// An instance of a standard class
#[derive(Debug)]
pub struct Instance {
    pub class: ClassId,
    /// One entry per effective slot; `Value::Unbound` until initialized
    pub slots: RwLock<Vec<Value>>,
}

impl Instance {
    pub fn new(class: ClassId, size: usize) -> Self {
        Self {
            class,
            slots: RwLock::new(vec![Value::Unbound; size]),
        }
    }

    pub fn slot(&self, index: usize) -> Option<Value> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(index).cloned()
    }

    pub fn set_slot(&self, index: usize, value: Value) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(index) {
            *slot = value;
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("there is no applicable method for the generic function {generic} when called with arguments {args}")]
    NoApplicableMethod { generic: String, args: String },
    #[error("there is no next method for the generic function {generic}")]
    NoNextMethod { generic: String },
    #[error("the method's lambda list is not congruent with that of {generic}: {reason}")]
    LambdaListCongruence { generic: String, reason: String },
    #[error("invalid method qualifiers {qualifiers} for {generic}")]
    InvalidQualifiers { generic: String, qualifiers: String },
}

/// A parameter specializer
#[derive(Debug, Clone)]
pub enum Specializer {
    /// Unspecialized parameter, less specific than T
    Wildcard,
    /// Only instances whose class is exactly this one
    Exact(ClassId),
    /// Instances of this class or any subclass
    SubtypeOf(ClassId),
    Eql(Value),
}

impl PartialEq for Specializer {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Specializer::Wildcard, Specializer::Wildcard) => true,
            (Specializer::Exact(a), Specializer::Exact(b)) => a == b,
            (Specializer::SubtypeOf(a), Specializer::SubtypeOf(b)) => a == b,
            (Specializer::Eql(a), Specializer::Eql(b)) => a.eql(b),
            _ => false,
        }
    }
}

impl Specializer {
    fn applies(&self, arg: &Value, class: ClassId, classes: &ClassTable) -> bool {
        match self {
            Specializer::Wildcard => true,
            Specializer::Exact(c) => class == *c,
            Specializer::SubtypeOf(c) => classes.subclassp(class, *c),
            Specializer::Eql(v) => v.eql(arg),
        }
    }

    /// Sort key: smaller is more specific for an argument whose class
    /// precedence list is `cpl`.
    fn rank(&self, cpl: &[ClassId]) -> (u8, usize, u8) {
        let position = |c: &ClassId| cpl.iter().position(|x| x == c).unwrap_or(cpl.len());
        match self {
            Specializer::Eql(_) => (0, 0, 0),
            Specializer::Exact(c) => (1, position(c), 0),
            Specializer::SubtypeOf(c) => (1, position(c), 1),
            Specializer::Wildcard => (1, cpl.len(), 2),
        }
    }
}

/// The symbols that name the standard qualifiers.
#[derive(Debug, Clone, Copy)]
pub struct QualifierSymbols {
    pub around: SymbolId,
    pub before: SymbolId,
    pub after: SymbolId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodRole {
    Primary,
    Before,
    After,
    Around,
}

/// The operators available to operator method combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinationOperator {
    Plus,
    List,
    And,
    Or,
    Progn,
    Max,
    Min,
    Append,
}

impl CombinationOperator {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "+" => CombinationOperator::Plus,
            "LIST" => CombinationOperator::List,
            "AND" => CombinationOperator::And,
            "OR" => CombinationOperator::Or,
            "PROGN" => CombinationOperator::Progn,
            "MAX" => CombinationOperator::Max,
            "MIN" => CombinationOperator::Min,
            "APPEND" => CombinationOperator::Append,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodCombination {
    Standard,
    /// Methods are qualified with `name`; their results are combined
    Operator {
        name: SymbolId,
        operator: CombinationOperator,
    },
}

/// A method
#[derive(Debug)]
pub struct Method {
    pub qualifiers: Vec<SymbolId>,
    pub role: MethodRole,
    /// One per required parameter
    pub specializers: Vec<Specializer>,
    pub shape: LambdaShape,
    /// Called with the next-method object followed by the arguments
    pub function: Value,
}

/// Called after a generic function changes.
pub type Dependent = Arc<dyn Fn(&GenericFunction) + Send + Sync>;

type CacheKey = (u64, SmallVec<[ClassId; 4]>);

/// A generic function
pub struct GenericFunction {
    pub name: SymbolId,
    pub display_name: String,
    pub shape: LambdaShape,
    pub combination: MethodCombination,
    /// Required-argument indices in the order they decide specificity
    pub precedence: Vec<usize>,
    methods: RwLock<Vec<Arc<Method>>>,
    method_cache: DashMap<CacheKey, Arc<[Arc<Method>]>>,
    uses_eql: AtomicBool,
    version: AtomicU64,
    dependents: RwLock<Vec<Dependent>>,
}

impl GenericFunction {
    pub fn new(
        name: SymbolId,
        display_name: String,
        shape: LambdaShape,
        combination: MethodCombination,
        precedence: Option<Vec<usize>>,
    ) -> Self {
        let precedence = precedence.unwrap_or_else(|| (0..shape.required).collect());
        Self {
            name,
            display_name,
            shape,
            combination,
            precedence,
            methods: RwLock::new(Vec::new()),
            method_cache: DashMap::new(),
            uses_eql: AtomicBool::new(false),
            version: AtomicU64::new(0),
            dependents: RwLock::new(Vec::new()),
        }
    }

    /// Bumped by every ADD-METHOD.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn methods(&self) -> Vec<Arc<Method>> {
        self.methods.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cache_len(&self) -> usize {
        self.method_cache.len()
    }

    pub fn add_dependent(&self, dependent: Dependent) {
        self.dependents.write().unwrap_or_else(|e| e.into_inner()).push(dependent);
    }

    /// Determines the role of a method from its qualifiers.
    pub fn classify(
        &self,
        qualifiers: &[SymbolId],
        names: &QualifierSymbols,
    ) -> Result<MethodRole, DispatchError> {
        let role = match (self.combination, qualifiers) {
            (MethodCombination::Standard, []) => Some(MethodRole::Primary),
            (MethodCombination::Standard, [q]) if *q == names.around => Some(MethodRole::Around),
            (MethodCombination::Standard, [q]) if *q == names.before => Some(MethodRole::Before),
            (MethodCombination::Standard, [q]) if *q == names.after => Some(MethodRole::After),
            (MethodCombination::Operator { .. }, [q]) if *q == names.around => Some(MethodRole::Around),
            (MethodCombination::Operator { name, .. }, [q]) if *q == name => Some(MethodRole::Primary),
            _ => None,
        };
        role.ok_or_else(|| DispatchError::InvalidQualifiers {
            generic: self.display_name.clone(),
            qualifiers: format!("{} qualifier(s)", qualifiers.len()),
        })
    }

    fn check_congruence(&self, method: &LambdaShape) -> Result<(), DispatchError> {
        let g = &self.shape;
        let fail = |reason: String| DispatchError::LambdaListCongruence {
            generic: self.display_name.clone(),
            reason,
        };
        if g.required != method.required {
            return Err(fail(format!(
                "the method has {} required parameters, the generic function {}",
                method.required, g.required
            )));
        }
        if g.optional != method.optional {
            return Err(fail(format!(
                "the method has {} optional parameters, the generic function {}",
                method.optional, g.optional
            )));
        }
        if g.accepts_variable() != method.accepts_variable() {
            return Err(fail(
                "exactly one of them accepts &rest or &key arguments".to_string(),
            ));
        }
        if let Some(generic_keys) = &g.keys {
            let rest_only = method.rest && method.keys.is_none();
            if !method.allow_other_keys && !rest_only {
                let method_keys = method.keys.as_deref().unwrap_or(&[]);
                if generic_keys.iter().any(|k| !method_keys.contains(k)) {
                    return Err(fail(
                        "the method does not accept every keyword of the generic function"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Adds `method`, replacing one with identical specializers and
    /// qualifiers, and invalidates every cached dispatch result.
    pub fn add_method(&self, method: Method) -> Result<(), DispatchError> {
        self.check_congruence(&method.shape)?;
        if method.specializers.len() != self.shape.required {
            return Err(DispatchError::LambdaListCongruence {
                generic: self.display_name.clone(),
                reason: "wrong number of specializers".to_string(),
            });
        }
        {
            let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
            methods.retain(|m| {
                !(m.qualifiers == method.qualifiers && m.specializers == method.specializers)
            });
            methods.push(Arc::new(method));
            let eql = methods
                .iter()
                .any(|m| m.specializers.iter().any(|s| matches!(s, Specializer::Eql(_))));
            self.uses_eql.store(eql, Ordering::Release);
            self.method_cache.clear();
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        log::debug!("added method to {} (version {})", self.display_name, self.version());

        let dependents = self.dependents.read().unwrap_or_else(|e| e.into_inner()).clone();
        for dependent in dependents {
            dependent(self);
        }
        Ok(())
    }

    /// Applicable methods, most specific first. Results are cached per
    /// argument-class tuple unless an EQL specializer is involved.
    pub fn applicable_methods(
        &self,
        args: &[Value],
        arg_classes: &[ClassId],
        classes: &ClassTable,
    ) -> Arc<[Arc<Method>]> {
        let cacheable = !self.uses_eql.load(Ordering::Acquire);
        let key: CacheKey = (classes.epoch(), arg_classes.iter().copied().collect());
        if cacheable {
            if let Some(hit) = self.method_cache.get(&key) {
                return hit.clone();
            }
        }

        let mut applicable: Vec<Arc<Method>> = self
            .methods()
            .into_iter()
            .filter(|m| {
                m.specializers
                    .iter()
                    .enumerate()
                    .all(|(i, s)| s.applies(&args[i], arg_classes[i], classes))
            })
            .collect();
        applicable.sort_by(|a, b| self.compare_method_specificity(a, b, arg_classes, classes));
        let applicable: Arc<[Arc<Method>]> = Arc::from(applicable);

        if cacheable {
            self.method_cache.insert(key, applicable.clone());
        }
        applicable
    }

    fn compare_method_specificity(
        &self,
        ma: &Method,
        mb: &Method,
        arg_classes: &[ClassId],
        classes: &ClassTable,
    ) -> CmpOrdering {
        for &i in &self.precedence {
            let cpl = classes.cpl(arg_classes[i]);
            let ra = ma.specializers[i].rank(cpl);
            let rb = mb.specializers[i].rank(cpl);
            if ra != rb {
                return ra.cmp(&rb);
            }
        }
        CmpOrdering::Equal
    }
}

/// The sorted applicable methods of one call, split by role.
pub struct MethodChain {
    pub generic: Arc<GenericFunction>,
    around: Vec<Arc<Method>>,
    before: Vec<Arc<Method>>,
    primary: Vec<Arc<Method>>,
    after: Vec<Arc<Method>>,
}

/// Where CALL-NEXT-METHOD continues within a chain.
#[derive(Debug, Clone, Copy)]
pub enum ChainPosition {
    Around(usize),
    /// Before methods, the primary chain and after methods
    Inner,
    Primary(usize),
    End,
}

/// The object bound to the hidden next-method parameter of a method.
pub struct NextMethod {
    pub chain: Arc<MethodChain>,
    pub next: ChainPosition,
    /// Arguments of the current method, reused when none are given
    pub args: Vec<Value>,
}

impl NextMethod {
    pub fn exists(&self) -> bool {
        match self.next {
            ChainPosition::Around(_) | ChainPosition::Inner => true,
            ChainPosition::Primary(i) => i < self.chain.primary.len(),
            ChainPosition::End => false,
        }
    }
}

impl MethodChain {
    fn new(generic: Arc<GenericFunction>, methods: &[Arc<Method>]) -> Self {
        let pick = |role: MethodRole| -> Vec<Arc<Method>> {
            methods.iter().filter(|m| m.role == role).cloned().collect()
        };
        let mut after = pick(MethodRole::After);
        after.reverse();
        Self {
            around: pick(MethodRole::Around),
            before: pick(MethodRole::Before),
            primary: pick(MethodRole::Primary),
            after,
            generic,
        }
    }
}

/// Entry point for calling a generic function.
pub fn call_generic(
    interp: &mut Interpreter<'_>,
    generic: &Arc<GenericFunction>,
    args: &[Value],
) -> EvalResult {
    let required = generic.shape.required;
    if args.len() < required {
        return Err(interp.raise(RuntimeError::ArgumentCount {
            function: generic.display_name.clone(),
            expected: format!("at least {}", required),
            got: args.len(),
        }));
    }

    let arg_classes: SmallVec<[ClassId; 4]> =
        args[..required].iter().map(|a| interp.class_of(a)).collect();
    let methods = {
        let classes = interp.globals.classes();
        generic.applicable_methods(&args[..required], &arg_classes, &classes)
    };

    let chain = Arc::new(MethodChain::new(generic.clone(), &methods));
    if chain.primary.is_empty() {
        let printed: Vec<String> = args.iter().map(|a| interp.prin1_to_string(a)).collect();
        return Err(interp.raise(DispatchError::NoApplicableMethod {
            generic: generic.display_name.clone(),
            args: format!("({})", printed.join(" ")),
        }));
    }
    run_position(interp, &chain, ChainPosition::Around(0), args)
}

/// Invoked by CALL-NEXT-METHOD; no arguments means the current ones.
pub fn call_next_method(
    interp: &mut Interpreter<'_>,
    next: &NextMethod,
    args: &[Value],
) -> EvalResult {
    let args = if args.is_empty() { next.args.as_slice() } else { args };
    run_position(interp, &next.chain, next.next, args)
}

fn invoke_method(
    interp: &mut Interpreter<'_>,
    chain: &Arc<MethodChain>,
    method: &Method,
    next: ChainPosition,
    args: &[Value],
) -> EvalResult {
    let next_method = Value::Function(Function::NextMethod(Arc::new(NextMethod {
        chain: chain.clone(),
        next,
        args: args.to_vec(),
    })));
    let mut full: SmallVec<[Value; 6]> = SmallVec::with_capacity(args.len() + 1);
    full.push(next_method);
    full.extend(args.iter().cloned());
    interp.apply(&method.function, &full)
}

fn run_position(
    interp: &mut Interpreter<'_>,
    chain: &Arc<MethodChain>,
    position: ChainPosition,
    args: &[Value],
) -> EvalResult {
    match position {
        ChainPosition::Around(i) if i < chain.around.len() => {
            invoke_method(interp, chain, &chain.around[i], ChainPosition::Around(i + 1), args)
        }
        ChainPosition::Around(_) | ChainPosition::Inner => run_inner(interp, chain, args),
        ChainPosition::Primary(i) if i < chain.primary.len() => {
            invoke_method(interp, chain, &chain.primary[i], ChainPosition::Primary(i + 1), args)
        }
        ChainPosition::Primary(_) | ChainPosition::End => Err(interp.raise(DispatchError::NoNextMethod {
            generic: chain.generic.display_name.clone(),
        })),
    }
}

fn run_inner(interp: &mut Interpreter<'_>, chain: &Arc<MethodChain>, args: &[Value]) -> EvalResult {
    match chain.generic.combination {
        MethodCombination::Standard => {
            for method in &chain.before {
                invoke_method(interp, chain, method, ChainPosition::End, args)?;
            }
            let result = run_position(interp, chain, ChainPosition::Primary(0), args)?;
            for method in &chain.after {
                invoke_method(interp, chain, method, ChainPosition::End, args)?;
            }
            Ok(result)
        }
        MethodCombination::Operator { operator, .. } => {
            combine(interp, chain, operator, args)
        }
    }
}

fn combine(
    interp: &mut Interpreter<'_>,
    chain: &Arc<MethodChain>,
    operator: CombinationOperator,
    args: &[Value],
) -> EvalResult {
    use CombinationOperator::*;
    let mut acc: Option<Value> = None;
    let mut collected = Vec::new();
    for method in &chain.primary {
        let value = invoke_method(interp, chain, method, ChainPosition::End, args)?;
        match operator {
            And if value.is_nil() => return Ok(Value::Nil),
            Or if value.is_true() => return Ok(value),
            And | Or | Progn => acc = Some(value),
            List => collected.push(value),
            Append => match value.as_list() {
                Some(items) => collected.extend(items.iter().cloned()),
                None => {
                    return Err(interp.raise(RuntimeError::TypeError {
                        datum: interp.prin1_to_string(&value),
                        expected: "LIST".to_string(),
                    }))
                }
            },
            Plus => {
                acc = Some(match acc {
                    None => value,
                    Some(prev) => crate::primitives::add2(interp, &prev, &value)?,
                })
            }
            Max | Min => {
                acc = Some(match acc {
                    None => value,
                    Some(prev) => {
                        let ord = crate::primitives::compare2(interp, &value, &prev)?;
                        let better = if operator == Max { ord.is_gt() } else { ord.is_lt() };
                        if better {
                            value
                        } else {
                            prev
                        }
                    }
                })
            }
        }
    }
    Ok(match operator {
        List | Append => Value::list(collected),
        Or => Value::Nil,
        _ => acc.unwrap_or(Value::Nil),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::CL_USER;

    fn setup() -> (SymbolTable, ClassTable) {
        let mut symbols = SymbolTable::new();
        let classes = ClassTable::new(&mut symbols);
        (symbols, classes)
    }

    fn shape(required: usize) -> LambdaShape {
        LambdaShape {
            required,
            ..LambdaShape::default()
        }
    }

    fn method(specs: Vec<Specializer>, tag: i64) -> Method {
        Method {
            qualifiers: Vec::new(),
            role: MethodRole::Primary,
            shape: shape(specs.len()),
            specializers: specs,
            function: Value::Integer(tag),
        }
    }

    fn tags(methods: &[Arc<Method>]) -> Vec<i64> {
        methods.iter().filter_map(|m| m.function.as_integer()).collect()
    }

    #[test]
    fn test_builtin_cpl() {
        let (_, classes) = setup();
        let b = *classes.builtins();
        assert_eq!(
            classes.cpl(b.fixnum),
            &[b.fixnum, b.integer, b.real, b.number, b.t]
        );
        assert_eq!(
            classes.cpl(b.null),
            &[b.null, b.symbol, b.list, b.sequence, b.t]
        );
        assert_eq!(
            classes.cpl(b.simple_error),
            &[b.simple_error, b.simple_condition, b.error, b.serious_condition, b.condition, b.t]
        );
    }

    #[test]
    fn test_user_class_slots_and_redefinition() {
        let (mut symbols, mut classes) = setup();
        let point = symbols.intern_in("POINT", CL_USER);
        let x = symbols.intern_in("X", CL_USER);
        let y = symbols.intern_in("Y", CL_USER);
        let slot = |name| SlotDefinition {
            name,
            initarg: None,
            initfunction: None,
            readers: Vec::new(),
            writers: Vec::new(),
        };
        let so = classes.builtins().standard_object;
        let id = classes.define_class(point, vec![so], vec![slot(x)], ClassKind::Standard, None);
        assert_eq!(classes.slot_index(id, x), Some(0));
        let epoch = classes.epoch();
        let again = classes.define_class(point, vec![so], vec![slot(x), slot(y)], ClassKind::Standard, None);
        assert_eq!(id, again);
        assert_eq!(classes.slot_index(id, y), Some(1));
        assert!(classes.epoch() > epoch);
    }

    #[test]
    fn test_redefining_superclass_updates_subclasses() {
        let (mut symbols, mut classes) = setup();
        let [base, mid, leaf, x, y, z] =
            ["BASE", "MID", "LEAF", "X", "Y", "Z"].map(|n| symbols.intern_in(n, CL_USER));
        let slot = |name| SlotDefinition {
            name,
            initarg: None,
            initfunction: None,
            readers: Vec::new(),
            writers: Vec::new(),
        };
        let so = classes.builtins().standard_object;
        let base_id = classes.define_class(base, vec![so], vec![slot(x)], ClassKind::Standard, None);
        let mid_id = classes.define_class(mid, vec![base_id], vec![], ClassKind::Standard, None);
        let leaf_id = classes.define_class(leaf, vec![mid_id], vec![slot(z)], ClassKind::Standard, None);
        assert_eq!(classes.slot_index(leaf_id, y), None);

        classes.define_class(base, vec![so], vec![slot(x), slot(y)], ClassKind::Standard, None);
        assert_eq!(classes.slot_index(mid_id, y), Some(1));
        assert_eq!(classes.slot_index(leaf_id, y), Some(1));
        assert_eq!(classes.slot_index(leaf_id, z), Some(2));
        assert!(classes.subclassp(leaf_id, base_id));
    }

    #[test]
    fn test_method_ordering_by_specificity() {
        let (mut symbols, classes) = setup();
        let b = *classes.builtins();
        let name = symbols.intern_in("DESCRIBE-IT", CL_USER);
        let gf = GenericFunction::new(name, "DESCRIBE-IT".into(), shape(1), MethodCombination::Standard, None);
        gf.add_method(method(vec![Specializer::SubtypeOf(b.t)], 3)).unwrap();
        gf.add_method(method(vec![Specializer::SubtypeOf(b.integer)], 1)).unwrap();
        gf.add_method(method(vec![Specializer::SubtypeOf(b.number)], 2)).unwrap();
        gf.add_method(method(vec![Specializer::SubtypeOf(b.string)], 9)).unwrap();

        let args = [Value::Integer(5)];
        let found = gf.applicable_methods(&args, &[b.fixnum], &classes);
        assert_eq!(tags(&found), vec![1, 2, 3]);
    }

    #[test]
    fn test_eql_exact_and_wildcard_order() {
        let (mut symbols, classes) = setup();
        let b = *classes.builtins();
        let name = symbols.intern_in("PICK", CL_USER);
        let gf = GenericFunction::new(name, "PICK".into(), shape(1), MethodCombination::Standard, None);
        gf.add_method(method(vec![Specializer::Wildcard], 4)).unwrap();
        gf.add_method(method(vec![Specializer::SubtypeOf(b.fixnum)], 3)).unwrap();
        gf.add_method(method(vec![Specializer::Exact(b.fixnum)], 2)).unwrap();
        gf.add_method(method(vec![Specializer::Eql(Value::Integer(5))], 1)).unwrap();

        let found = gf.applicable_methods(&[Value::Integer(5)], &[b.fixnum], &classes);
        assert_eq!(tags(&found), vec![1, 2, 3, 4]);
        let found = gf.applicable_methods(&[Value::Integer(6)], &[b.fixnum], &classes);
        assert_eq!(tags(&found), vec![2, 3, 4]);
        assert_eq!(gf.cache_len(), 0, "EQL specializers bypass the cache");
    }

    #[test]
    fn test_replacement_and_cache_invalidation() {
        let (mut symbols, classes) = setup();
        let b = *classes.builtins();
        let name = symbols.intern_in("AREA", CL_USER);
        let gf = GenericFunction::new(name, "AREA".into(), shape(1), MethodCombination::Standard, None);
        gf.add_method(method(vec![Specializer::SubtypeOf(b.number)], 1)).unwrap();
        let args = [Value::Integer(2)];
        assert_eq!(tags(&gf.applicable_methods(&args, &[b.fixnum], &classes)), vec![1]);
        assert_eq!(gf.cache_len(), 1);

        let v = gf.version();
        gf.add_method(method(vec![Specializer::SubtypeOf(b.number)], 7)).unwrap();
        assert!(gf.version() > v);
        assert_eq!(gf.cache_len(), 0);
        assert_eq!(gf.methods().len(), 1);
        assert_eq!(tags(&gf.applicable_methods(&args, &[b.fixnum], &classes)), vec![7]);
    }

    #[test]
    fn test_dependents_notified_on_install() {
        use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

        let (mut symbols, classes) = setup();
        let b = *classes.builtins();
        let name = symbols.intern_in("RESIZE", CL_USER);
        let gf = GenericFunction::new(name, "RESIZE".into(), shape(1), MethodCombination::Standard, None);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        gf.add_dependent(Arc::new(move |_: &GenericFunction| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        }));
        gf.add_method(method(vec![Specializer::SubtypeOf(b.number)], 1)).unwrap();
        gf.add_method(method(vec![Specializer::SubtypeOf(b.integer)], 2)).unwrap();
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn test_argument_precedence_order() {
        let (mut symbols, classes) = setup();
        let b = *classes.builtins();
        let name = symbols.intern_in("MIX", CL_USER);
        let gf = GenericFunction::new(name, "MIX".into(), shape(2), MethodCombination::Standard, Some(vec![1, 0]));
        gf.add_method(method(vec![Specializer::SubtypeOf(b.integer), Specializer::SubtypeOf(b.t)], 1)).unwrap();
        gf.add_method(method(vec![Specializer::SubtypeOf(b.t), Specializer::SubtypeOf(b.integer)], 2)).unwrap();
        let args = [Value::Integer(1), Value::Integer(2)];
        let found = gf.applicable_methods(&args, &[b.fixnum, b.fixnum], &classes);
        assert_eq!(tags(&found), vec![2, 1]);
    }

    #[test]
    fn test_congruence_rejected() {
        let (mut symbols, classes) = setup();
        let b = *classes.builtins();
        let name = symbols.intern_in("TWO", CL_USER);
        let gf = GenericFunction::new(name, "TWO".into(), shape(2), MethodCombination::Standard, None);
        let err = gf.add_method(method(vec![Specializer::SubtypeOf(b.t)], 1)).unwrap_err();
        assert!(matches!(err, DispatchError::LambdaListCongruence { .. }));

        let keyed = GenericFunction::new(
            name,
            "TWO".into(),
            LambdaShape { required: 1, keys: Some(vec![SymbolId(900)]), ..LambdaShape::default() },
            MethodCombination::Standard,
            None,
        );
        let mut m = method(vec![Specializer::Wildcard], 1);
        m.shape = LambdaShape { required: 1, keys: Some(vec![]), ..LambdaShape::default() };
        assert!(keyed.add_method(m).is_err());
        let mut m = method(vec![Specializer::Wildcard], 1);
        m.shape = LambdaShape { required: 1, rest: true, ..LambdaShape::default() };
        assert!(keyed.add_method(m).is_ok());
    }

    #[test]
    fn test_classify_qualifiers() {
        let (mut symbols, _) = setup();
        let names = QualifierSymbols {
            around: symbols.intern_keyword("AROUND"),
            before: symbols.intern_keyword("BEFORE"),
            after: symbols.intern_keyword("AFTER"),
        };
        let plus = symbols.intern_in("+", COMMON_LISP);
        let name = symbols.intern_in("TOTAL", CL_USER);
        let gf = GenericFunction::new(
            name,
            "TOTAL".into(),
            shape(1),
            MethodCombination::Operator { name: plus, operator: CombinationOperator::Plus },
            None,
        );
        assert_eq!(gf.classify(&[plus], &names).unwrap(), MethodRole::Primary);
        assert_eq!(gf.classify(&[names.around], &names).unwrap(), MethodRole::Around);
        assert!(gf.classify(&[], &names).is_err());
        assert!(gf.classify(&[names.before], &names).is_err());
    }
}
