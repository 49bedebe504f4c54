// HostCL Dynamic Binding Stack
//
// Special variables. Each process owns a stack of binding frames; the
// bottom (global) frame is the symbol value cells in the shared table.

use smallvec::SmallVec;

use crate::symbol::{SymbolId, SymbolTable};
use crate::types::Value;

/// One LET's worth of special bindings. Most frames bind one or two.
pub type BindingFrame = SmallVec<[(SymbolId, Value); 2]>;

#[derive(Debug, Default)]
pub struct DynamicStack {
    frames: Vec<BindingFrame>,
}

impl DynamicStack {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Number of frames above the global frame.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, frame: BindingFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    /// Drops frames until only `depth` remain.
    pub fn unwind_to(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    /// The innermost process-local binding, if any.
    pub fn lookup_local(&self, sym: SymbolId) -> Option<&Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.iter().find(|(s, _)| *s == sym).map(|(_, v)| v))
    }

    /// Innermost binding, falling back to the global value cell.
    pub fn lookup(&self, sym: SymbolId, table: &SymbolTable) -> Option<Value> {
        match self.lookup_local(sym) {
            Some(v) => Some(v.clone()),
            None => table.symbol_value(sym).cloned(),
        }
    }

    /// Writes the innermost binding if one exists in this process.
    /// Hands the value back when the write has to go to the global frame.
    pub fn set_local(&mut self, sym: SymbolId, value: Value) -> Result<(), Value> {
        for frame in self.frames.iter_mut().rev() {
            if let Some(slot) = frame.iter_mut().find(|(s, _)| *s == sym) {
                slot.1 = value;
                return Ok(());
            }
        }
        Err(value)
    }

    /// Assigns the innermost binding, creating the global one if needed.
    pub fn set(&mut self, sym: SymbolId, value: Value, table: &mut SymbolTable) {
        if let Err(value) = self.set_local(sym, value) {
            table.set_symbol_value(sym, value);
        }
    }

    /// Runs `body` with a frame pushed; the frame is popped on return.
    pub fn with_bindings<R>(
        &mut self,
        frame: BindingFrame,
        body: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let depth = self.frames.len();
        self.frames.push(frame);
        let result = body(self);
        self.unwind_to(depth);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::CL_USER;
    use smallvec::smallvec;

    #[test]
    fn test_global_fallback_and_shadowing() {
        let mut table = SymbolTable::new();
        let x = table.intern_in("*X*", CL_USER);
        table.set_symbol_value(x, Value::Integer(1));
        let mut stack = DynamicStack::new();

        assert_eq!(stack.lookup(x, &table), Some(Value::Integer(1)));
        let inner = stack.with_bindings(smallvec![(x, Value::Integer(2))], |s| {
            let seen = s.lookup(x, &table);
            s.set(x, Value::Integer(3), &mut SymbolTable::new());
            (seen, s.lookup(x, &table))
        });
        assert_eq!(inner, (Some(Value::Integer(2)), Some(Value::Integer(3))));
        assert_eq!(stack.lookup(x, &table), Some(Value::Integer(1)));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_set_without_binding_writes_global() {
        let mut table = SymbolTable::new();
        let y = table.intern_in("*Y*", CL_USER);
        let mut stack = DynamicStack::new();
        assert_eq!(stack.lookup(y, &table), None);
        stack.set(y, Value::Integer(9), &mut table);
        assert_eq!(table.symbol_value(y), Some(&Value::Integer(9)));
    }

    #[test]
    fn test_unwind_to_restores_depth() {
        let mut table = SymbolTable::new();
        let z = table.intern_in("*Z*", CL_USER);
        let mut stack = DynamicStack::new();
        stack.push(smallvec![(z, Value::Integer(1))]);
        stack.push(smallvec![(z, Value::Integer(2))]);
        stack.unwind_to(1);
        assert_eq!(stack.lookup(z, &table), Some(Value::Integer(1)));
    }
}
