// HostCL Value Representation
//
// Lisp data is a single cloneable enum. Lists are proper and immutable,
// stored as shared slices; NIL doubles as the empty list.

use std::fmt;
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::clos::{ClassId, GenericFunction, Instance, NextMethod};
use crate::conditions::{Condition, Restart};
use crate::eval::{Closure, EvalResult, Interpreter};
pub use crate::symbol::{PackageId, SymbolId};

/// Signature of a host-implemented function.
pub type NativeFn = dyn Fn(&mut Interpreter<'_>, &[Value]) -> EvalResult + Send + Sync;

/// A host function together with the name it reports in backtraces.
pub struct NativeFunction {
    pub name: String,
    pub func: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&mut Interpreter<'_>, &[Value]) -> EvalResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

/// Every callable object.
#[derive(Clone)]
pub enum Function {
    Native(Arc<NativeFunction>),
    Closure(Arc<Closure>),
    Generic(Arc<GenericFunction>),
    /// The continuation handed to a method body as `call-next-method`
    NextMethod(Arc<NextMethod>),
}

impl Function {
    pub fn ptr_eq(&self, other: &Function) -> bool {
        match (self, other) {
            (Function::Native(a), Function::Native(b)) => Arc::ptr_eq(a, b),
            (Function::Closure(a), Function::Closure(b)) => Arc::ptr_eq(a, b),
            (Function::Generic(a), Function::Generic(b)) => Arc::ptr_eq(a, b),
            (Function::NextMethod(a), Function::NextMethod(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Name used by the printer and in backtraces.
    pub fn display_name(&self) -> String {
        match self {
            Function::Native(n) => n.name.clone(),
            Function::Closure(c) => c.name.clone().unwrap_or_else(|| "LAMBDA".to_string()),
            Function::Generic(g) => g.display_name.clone(),
            Function::NextMethod(_) => "CALL-NEXT-METHOD".to_string(),
        }
    }
}

#[derive(Clone)]
pub enum Value {
    /// NIL: false, the empty list, and the symbol NIL
    Nil,
    Integer(i64),
    BigInt(Arc<BigInt>),
    Float(f64),
    Char(char),
    String(Arc<str>),
    Symbol(SymbolId),
    /// A non-empty proper list
    List(Arc<[Value]>),
    Vector(Arc<[Value]>),
    Package(PackageId),
    Function(Function),
    Condition(Arc<Condition>),
    Restart(Arc<Restart>),
    Instance(Arc<Instance>),
    Class(ClassId),
    /// Marks an optional or keyword parameter the caller did not supply
    Unbound,
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        if items.is_empty() {
            Value::Nil
        } else {
            Value::List(Arc::from(items))
        }
    }

    pub fn string(s: &str) -> Value {
        Value::String(Arc::from(s))
    }

    pub fn vector(items: Vec<Value>) -> Value {
        Value::Vector(Arc::from(items))
    }

    pub fn native(
        name: impl Into<String>,
        func: impl Fn(&mut Interpreter<'_>, &[Value]) -> EvalResult + Send + Sync + 'static,
    ) -> Value {
        Value::Function(Function::Native(Arc::new(NativeFunction::new(name, func))))
    }

    /// Normalizes a bignum result back to a fixnum when it fits.
    pub fn from_bigint(n: BigInt) -> Value {
        match n.to_i64() {
            Some(i) => Value::Integer(i),
            None => Value::BigInt(Arc::new(n)),
        }
    }

    pub fn bool(b: bool, t: SymbolId) -> Value {
        if b {
            Value::Symbol(t)
        } else {
            Value::Nil
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_true(&self) -> bool {
        !self.is_nil()
    }

    pub fn as_symbol(&self) -> Option<SymbolId> {
        match self {
            Value::Symbol(s) => Some(*s),
            _ => None,
        }
    }

    /// Elements of a proper list; NIL is the empty list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::Nil => Some(&[]),
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Elements of any sequence (list or vector).
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Vector(items) => Some(items),
            other => other.as_list(),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// True for a list form headed by `head`.
    pub fn is_form(&self, head: SymbolId) -> bool {
        match self {
            Value::List(items) => items[0].as_symbol() == Some(head),
            _ => false,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::BigInt(_) | Value::Float(_))
    }

    /// Identity comparison (EQ). Small immediates compare by value.
    pub fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::Unbound, Value::Unbound) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Package(a), Value::Package(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::String(a), Value::String(b)) => Arc::ptr_eq(a, b),
            (Value::BigInt(a), Value::BigInt(b)) => Arc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Vector(a), Value::Vector(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Condition(a), Value::Condition(b)) => Arc::ptr_eq(a, b),
            (Value::Restart(a), Value::Restart(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }

    /// EQL: EQ, plus numbers of the same type and value.
    pub fn eql(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            _ => self.eq(other),
        }
    }

    /// EQUAL: structural on lists, strings and vectors.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Vector(a), Value::Vector(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equal(y))
            }
            _ => self.eql(other),
        }
    }
}

/// Structural equality (EQUAL), used by tests and by EQUAL-keyed lookups.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Integer(i) => write!(f, "Integer({})", i),
            Value::BigInt(n) => write!(f, "BigInt({})", n),
            Value::Float(x) => write!(f, "Float({:?})", x),
            Value::Char(c) => write!(f, "Char({:?})", c),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Symbol(s) => write!(f, "Symbol({})", s.0),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Vector(items) => {
                write!(f, "Vector")?;
                f.debug_list().entries(items.iter()).finish()
            }
            Value::Package(p) => write!(f, "Package({})", p.0),
            Value::Function(func) => write!(f, "Function({})", func.display_name()),
            Value::Condition(c) => write!(f, "Condition(class {})", c.class.0),
            Value::Restart(r) => write!(f, "Restart({:?})", r.name),
            Value::Instance(i) => write!(f, "Instance(class {})", i.class.0),
            Value::Class(c) => write!(f, "Class({})", c.0),
            Value::Unbound => write!(f, "Unbound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_is_nil() {
        assert!(Value::list(vec![]).is_nil());
        assert_eq!(Value::Nil.as_list().map(|l| l.len()), Some(0));
    }

    #[test]
    fn test_eql_numbers_and_strings() {
        let a = Value::string("abc");
        let b = Value::string("abc");
        assert!(!a.eql(&b));
        assert!(a.equal(&b));
        assert!(a.eql(&a.clone()));

        let big: BigInt = BigInt::from(i64::MAX) * 4;
        let x = Value::from_bigint(big.clone());
        let y = Value::from_bigint(big);
        assert!(!x.eq(&y));
        assert!(x.eql(&y));
        assert!(Value::Float(1.5).eql(&Value::Float(1.5)));
        assert!(!Value::Integer(1).eql(&Value::Float(1.0)));
    }

    #[test]
    fn test_bigint_normalizes() {
        let v = Value::from_bigint(BigInt::from(42));
        assert!(matches!(v, Value::Integer(42)));
    }

    #[test]
    fn test_equal_lists() {
        let a = Value::list(vec![Value::Integer(1), Value::string("x")]);
        let b = Value::list(vec![Value::Integer(1), Value::string("x")]);
        assert!(a.equal(&b));
        assert!(!a.eq(&b));
    }
}
