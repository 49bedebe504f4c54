// HostCL Debugger Hook
//
// Where an unhandled error goes before the stack unwinds. The snapshot
// is taken here because by the time the top level sees the condition
// every frame it describes has already been popped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::conditions::{describe_condition, Condition};
use crate::eval::{ControlSignal, Interpreter};
use crate::types::Value;

/// Host-side replacement for the interactive debugger. Returning an
/// error transfers control (e.g. by invoking a restart).
pub type DebuggerHook =
    Arc<dyn Fn(&mut Interpreter<'_>, &Arc<Condition>) -> Result<(), ControlSignal> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub depth: usize,
    pub function: String,
}

/// What was live when an error reached the debugger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backtrace {
    pub process: u32,
    pub condition_class: String,
    pub message: String,
    /// Innermost frame first
    pub frames: Vec<Frame>,
    pub restarts: Vec<String>,
    pub dynamic_depth: usize,
}

impl Backtrace {
    pub fn capture(interp: &Interpreter<'_>, condition: &Arc<Condition>) -> Self {
        let class_name = interp.globals.classes().class_name(condition.class);
        let frames = interp
            .process
            .call_stack
            .iter()
            .rev()
            .enumerate()
            .map(|(depth, function)| Frame {
                depth,
                function: function.clone(),
            })
            .collect();
        let restarts = interp
            .process
            .conditions
            .compute_restarts(Some(condition))
            .iter()
            .map(|r| match r.name {
                Some(name) => interp.symbol_name(name),
                None => "(anonymous)".to_string(),
            })
            .collect();
        Self {
            process: interp.process.pid.0,
            condition_class: interp.symbol_name(class_name),
            message: describe_condition(interp, condition),
            frames,
            restarts,
            dynamic_depth: interp.process.dynamic.depth(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
    }
}

/// Called by ERROR once no handler took the condition. Runs the host
/// hook if one is installed, then a function in *DEBUGGER-HOOK* (with
/// the variable bound to NIL while it runs).
pub fn invoke_debugger(interp: &mut Interpreter<'_>, condition: &Arc<Condition>) -> Result<(), ControlSignal> {
    let trace = Backtrace::capture(interp, condition);
    log::debug!(
        "process {}: {} reached the debugger at depth {}",
        trace.process,
        trace.condition_class,
        trace.frames.len()
    );
    if interp.globals.options.backtrace_on_error {
        log::error!("{}", trace.to_json());
    }
    interp.process.last_backtrace = Some(trace);

    if let Some(hook) = interp.globals.debugger_hook() {
        hook(interp, condition)?;
    }

    let var = interp.globals.wk.debugger_hook_var;
    if let Some(function) = interp.special_value(var).filter(|v| v.as_function().is_some()) {
        let args = [Value::Condition(condition.clone()), function.clone()];
        interp.bind_specials(smallvec::smallvec![(var, Value::Nil)], |interp| {
            interp.apply(&function, &args)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtrace_json_shape() {
        let trace = Backtrace {
            process: 3,
            condition_class: "SIMPLE-ERROR".to_string(),
            message: "boom".to_string(),
            frames: vec![
                Frame { depth: 0, function: "INNER".to_string() },
                Frame { depth: 1, function: "OUTER".to_string() },
            ],
            restarts: vec!["ABORT".to_string()],
            dynamic_depth: 0,
        };
        let json = trace.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["condition_class"], "SIMPLE-ERROR");
        assert_eq!(value["frames"][1]["function"], "OUTER");
        let back: Backtrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trace);
    }
}
