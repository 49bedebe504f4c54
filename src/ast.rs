// HostCL Host AST
//
// The statement/expression tree the compiler lowers forms into. Names
// are (symbol, serial, namespace) triples: serial 0 is the global
// binding of the symbol, any other serial a compiler-made lexical.

use std::sync::Arc;

use crate::symbol::SymbolId;
use crate::types::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Variable,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident {
    pub symbol: SymbolId,
    pub serial: u32,
    pub namespace: Namespace,
}

impl Ident {
    pub fn global_variable(symbol: SymbolId) -> Self {
        Self { symbol, serial: 0, namespace: Namespace::Variable }
    }

    pub fn global_function(symbol: SymbolId) -> Self {
        Self { symbol, serial: 0, namespace: Namespace::Function }
    }

    pub fn is_global(&self) -> bool {
        self.serial == 0
    }
}

/// Formal parameters of a host procedure.
#[derive(Debug, Clone, Default)]
pub struct Params {
    pub required: Vec<Ident>,
    /// Bound to the unsupplied marker when the caller passes nothing
    pub optional: Vec<Ident>,
    pub rest: Option<Ident>,
    /// (keyword, variable) pairs
    pub keys: Vec<(SymbolId, Ident)>,
    /// A &KEY section exists, even an empty one
    pub accepts_keys: bool,
    pub allow_other_keys: bool,
}

impl Params {
    pub fn simple(required: Vec<Ident>) -> Self {
        Self { required, ..Self::default() }
    }

    pub fn names(&self) -> impl Iterator<Item = Ident> + '_ {
        self.required
            .iter()
            .chain(self.optional.iter())
            .chain(self.rest.iter())
            .chain(self.keys.iter().map(|(_, v)| v))
            .copied()
    }
}

#[derive(Debug, Clone)]
pub struct Comprehension {
    pub target: Ident,
    pub iter: Expr,
    pub conditions: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Const(Value),
    Name(Ident),
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    IfExp {
        test: Box<Expr>,
        then: Box<Expr>,
        orelse: Box<Expr>,
    },
    Lambda {
        name: Option<String>,
        params: Arc<Params>,
        body: Arc<Expr>,
    },
    ListComp {
        element: Box<Expr>,
        generators: Vec<Comprehension>,
    },
}

impl Expr {
    pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call { func: Box::new(func), args }
    }

    pub fn nil() -> Expr {
        Expr::Const(Value::Nil)
    }

    /// Evaluating this has no effect and cannot fail.
    pub fn is_pure(&self) -> bool {
        match self {
            Expr::Const(_) | Expr::Lambda { .. } => true,
            Expr::Name(id) => !id.is_global(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Stmt {
    FunctionDef {
        name: Ident,
        /// Name reported in backtraces
        label: Option<String>,
        params: Arc<Params>,
        body: Arc<Vec<Stmt>>,
    },
    Return(Expr),
    Assign {
        target: Ident,
        value: Expr,
    },
    Expr(Expr),
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Ident,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    /// Runs `finalbody` on every exit from `body`
    Try {
        body: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },
    Global(Vec<Ident>),
    Nonlocal(Vec<Ident>),
}

/// A compiled top-level form.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub body: Vec<Stmt>,
}
