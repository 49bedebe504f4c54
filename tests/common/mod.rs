use hostcl::config::RuntimeOptions;
use hostcl::{GlobalContext, Interpreter, Process};

/// A context with the prelude loaded.
pub fn boot() -> GlobalContext {
    GlobalContext::boot_with(RuntimeOptions::default()).expect("prelude loads")
}

/// Evaluates every form of `text` in a fresh process and prints the
/// last value, or describes the signal that escaped.
pub fn eval(ctx: &GlobalContext, text: &str) -> Result<String, String> {
    let mut process = Process::new();
    eval_in(ctx, &mut process, text)
}

pub fn eval_in(ctx: &GlobalContext, process: &mut Process, text: &str) -> Result<String, String> {
    let mut interp = Interpreter::new(process, ctx);
    match interp.eval_string(text) {
        Ok(v) => Ok(interp.prin1_to_string(&v)),
        Err(signal) => Err(interp.describe_signal(&signal)),
    }
}
