// HostCL Process - Per-Thread Execution State
//
// Everything a thread of Lisp execution owns: its special bindings, its
// handler and restart clusters, the live catch tags and the call stack
// used for backtraces. Processes share one GlobalContext and nothing
// else, so two threads never see each other's dynamic bindings.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::conditions::ConditionSystem;
use crate::debug::Backtrace;
use crate::dynamic::DynamicStack;
use crate::types::Value;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

pub struct Process {
    pub pid: Pid,
    pub dynamic: DynamicStack,
    pub conditions: ConditionSystem,
    /// Tags of the CATCH forms currently executing, innermost last
    pub catch_tags: Vec<Value>,
    /// Names of the closures currently executing, innermost last
    pub call_stack: Vec<String>,
    /// Snapshot taken the last time an error reached the debugger
    pub last_backtrace: Option<Backtrace>,
}

impl Process {
    pub fn new() -> Self {
        let pid = Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed));
        log::debug!("created process {}", pid.0);
        Self {
            pid,
            dynamic: DynamicStack::new(),
            conditions: ConditionSystem::new(),
            catch_tags: Vec::new(),
            call_stack: Vec::new(),
            last_backtrace: None,
        }
    }

    pub fn has_catch_tag(&self, tag: &Value) -> bool {
        self.catch_tags.iter().any(|t| t.eq(tag))
    }

    /// Drops whatever an aborted top-level evaluation left behind.
    pub fn reset(&mut self) {
        self.dynamic.unwind_to(0);
        self.conditions = ConditionSystem::new();
        self.catch_tags.clear();
        self.call_stack.clear();
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolId;
    use smallvec::smallvec;

    #[test]
    fn test_pids_are_unique() {
        let a = Process::new();
        let b = Process::new();
        assert_ne!(a.pid, b.pid);
    }

    #[test]
    fn test_reset_clears_stacks() {
        let mut p = Process::new();
        p.dynamic.push(smallvec![(SymbolId(1), Value::Integer(1))]);
        p.catch_tags.push(Value::Integer(7));
        p.call_stack.push("F".to_string());
        assert!(p.has_catch_tag(&Value::Integer(7)));
        p.reset();
        assert_eq!(p.dynamic.depth(), 0);
        assert!(!p.has_catch_tag(&Value::Integer(7)));
        assert!(p.call_stack.is_empty());
    }
}
