// HostCL REPL - Read-Eval-Print Loop
//
// `hostcl [file]`: boots a context with the prelude, then either runs the
// file or reads forms interactively. Every top-level form runs under an
// ABORT restart; an unhandled condition is reported and the loop goes on.

use std::process::ExitCode;
use std::thread;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use hostcl::conditions::{restart_case, RestartOutcome, RestartSpec};
use hostcl::context::GlobalContext;
use hostcl::eval::{ControlSignal, Interpreter};
use hostcl::process::Process;
use hostcl::reader::{Reader, ReaderError};
use hostcl::symbol::{SymbolId, COMMON_LISP};
use hostcl::types::Value;

/// Deeply recursive Lisp code recurses on the host stack too.
const MAIN_STACK_SIZE: usize = 512 * 1024 * 1024;
const HISTORY_FILE: &str = ".hostcl_history";

fn main() -> ExitCode {
    // Unmuffled warnings go through the logger, so show them by default.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let file = std::env::args().nth(1);
    let worker = thread::Builder::new()
        .name("hostcl-main".to_string())
        .stack_size(MAIN_STACK_SIZE)
        .spawn(move || run(file));
    match worker.map(|handle| handle.join()) {
        Ok(Ok(code)) => code,
        Ok(Err(_)) => {
            eprintln!("hostcl: the main thread panicked");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("hostcl: cannot start the main thread: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(file: Option<String>) -> ExitCode {
    let globals = match GlobalContext::boot() {
        Ok(globals) => globals,
        Err(e) => {
            eprintln!("hostcl: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut process = Process::new();
    let mut interp = Interpreter::new(&mut process, &globals);
    match file {
        Some(path) => run_file(&mut interp, &path),
        None => repl(&mut interp),
    }
}

/// Evaluates one top-level form under an ABORT restart. `None` means the
/// restart was taken.
fn eval_toplevel(interp: &mut Interpreter<'_>, form: &Value) -> Result<Option<Value>, ControlSignal> {
    let abort = RestartSpec {
        name: Some(interp.globals.wk.abort),
        report: Some("Return to top level.".to_string()),
        interactive: None,
        associated: None,
    };
    match restart_case(interp, vec![abort], |interp| interp.eval_form(form))? {
        RestartOutcome::Returned(value) => Ok(Some(value)),
        RestartOutcome::Invoked { .. } => Ok(None),
    }
}

fn report(interp: &mut Interpreter<'_>, signal: &ControlSignal) {
    eprintln!("{}", interp.describe_signal(signal));
    if interp.globals.options.backtrace_on_error {
        if let Some(trace) = &interp.process.last_backtrace {
            eprintln!("{}", trace.to_json());
        }
    }
    interp.process.reset();
}

fn run_file(interp: &mut Interpreter<'_>, path: &str) -> ExitCode {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("hostcl: cannot read {}: {}", path, e);
            return ExitCode::FAILURE;
        }
    };
    let chars: Vec<char> = text.chars().collect();
    let mut position = 0;
    loop {
        let form = match interp.read_at(&chars, &mut position) {
            Ok(Some(form)) => form,
            Ok(None) => return ExitCode::SUCCESS,
            Err(signal) => {
                report(interp, &signal);
                return ExitCode::FAILURE;
            }
        };
        match eval_toplevel(interp, &form) {
            Ok(Some(_)) => {}
            Ok(None) => eprintln!("; aborted"),
            Err(signal) => {
                report(interp, &signal);
                return ExitCode::FAILURE;
            }
        }
    }
}

/// The *, ** and *** history variables.
struct History {
    vars: [SymbolId; 3],
}

impl History {
    fn intern(globals: &GlobalContext) -> Self {
        let vars = {
            let mut symbols = globals.symbols_mut();
            ["*", "**", "***"].map(|name| symbols.intern_exported(name, COMMON_LISP))
        };
        for var in vars {
            globals.proclaim_special(var);
            globals.symbols_mut().set_symbol_value(var, Value::Nil);
        }
        Self { vars }
    }

    fn record(&self, interp: &mut Interpreter<'_>, value: Value) -> Result<(), ControlSignal> {
        let [one, two, three] = self.vars;
        let previous = interp.special_value(one).unwrap_or(Value::Nil);
        let older = interp.special_value(two).unwrap_or(Value::Nil);
        interp.set_special(three, older)?;
        interp.set_special(two, previous)?;
        interp.set_special(one, value)
    }
}

enum Step {
    Form(Value),
    Incomplete,
    Done,
    Failed(ReaderError),
}

/// Reads the next form of `buffer` from `position`.
fn read_step(interp: &Interpreter<'_>, chars: &[char], position: &mut usize) -> Step {
    let options = interp.reader_options();
    let mut symbols = interp.globals.symbols_mut();
    let mut reader = Reader::new(chars, &mut symbols, options).at(*position);
    let read = reader.read();
    match read {
        Ok(Some(form)) => {
            *position = reader.position();
            Step::Form(form)
        }
        Ok(None) => Step::Done,
        Err(ReaderError::EndOfStream) => Step::Incomplete,
        Err(e) => Step::Failed(e),
    }
}

fn repl(interp: &mut Interpreter<'_>) -> ExitCode {
    println!("HostCL {}", env!("CARGO_PKG_VERSION"));
    println!("Type (quit) or Ctrl-D to exit");
    let history = History::intern(interp.globals);

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("hostcl: cannot start the line editor: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if editor.load_history(HISTORY_FILE).is_err() {
        log::debug!("no previous history in {}", HISTORY_FILE);
    }

    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() {
            let package = interp.current_package();
            format!("{}> ", interp.globals.symbols().package_name(package))
        } else {
            "...> ".to_string()
        };
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("hostcl: {}", e);
                break;
            }
        };
        let _ = editor.add_history_entry(line.as_str());
        if buffer.is_empty() && matches!(line.trim(), "(quit)" | "(exit)") {
            break;
        }
        buffer.push_str(&line);
        buffer.push('\n');

        let chars: Vec<char> = buffer.chars().collect();
        let mut position = 0;
        loop {
            match read_step(interp, &chars, &mut position) {
                Step::Form(form) => match eval_toplevel(interp, &form) {
                    Ok(Some(value)) => {
                        println!("{}", interp.prin1_to_string(&value));
                        if let Err(signal) = history.record(interp, value) {
                            report(interp, &signal);
                        }
                    }
                    Ok(None) => println!("; aborted"),
                    Err(signal) => report(interp, &signal),
                },
                Step::Incomplete => {
                    buffer = chars[position..].iter().collect();
                    break;
                }
                Step::Done => {
                    buffer.clear();
                    break;
                }
                Step::Failed(e) => {
                    eprintln!("READER-ERROR: {}", e);
                    buffer.clear();
                    break;
                }
            }
        }
    }

    let _ = editor.save_history(HISTORY_FILE);
    ExitCode::SUCCESS
}
