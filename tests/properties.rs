use std::sync::OnceLock;

use num_bigint::BigInt;
use proptest::prelude::*;

use hostcl::reader::{read_from_string, ReaderOptions};
use hostcl::symbol::{SymbolTable, CL_USER};
use hostcl::{GlobalContext, Interpreter, Process, Value};

fn context() -> &'static GlobalContext {
    static CONTEXT: OnceLock<GlobalContext> = OnceLock::new();
    CONTEXT.get_or_init(GlobalContext::new)
}

fn round_trip(value: &Value) -> Value {
    let ctx = context();
    let mut process = Process::new();
    let interp = Interpreter::new(&mut process, ctx);
    let text = hostcl::printer::print_to_string(&interp, value, true).unwrap();
    let mut symbols = ctx.symbols_mut();
    read_from_string(&text, &mut symbols, &ReaderOptions::default())
        .unwrap_or_else(|e| panic!("cannot read back {:?}: {}", text, e))
}

fn literal() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(Value::Integer),
        "[1-9][0-9]{19,40}".prop_map(|digits| Value::from_bigint(digits.parse::<BigInt>().unwrap())),
        "[ -~]{0,16}".prop_map(|s| Value::string(&s)),
        "[a-z]".prop_map(|s| Value::Char(s.chars().next().unwrap())),
        "[A-Z][A-Z0-9-]{0,10}"
            .prop_filter("NIL reads as the empty list", |name| name != "NIL")
            .prop_map(|name| Value::Symbol(context().intern(&name, CL_USER))),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| prop::collection::vec(inner, 0..4).prop_map(Value::list))
}

proptest! {
    #[test]
    fn interning_is_idempotent(name in "[A-Za-z*+%-][A-Za-z0-9*+%-]{0,15}") {
        let mut table = SymbolTable::new();
        let (first, _) = table.intern(&name, CL_USER);
        let (second, _) = table.intern(&name, CL_USER);
        prop_assert_eq!(first, second);
        let found = table.find_symbol(&name, CL_USER).map(|(sym, _)| sym);
        prop_assert_eq!(found, Some(first));
    }

    #[test]
    fn readable_printing_round_trips(value in literal()) {
        let back = round_trip(&value);
        prop_assert!(back.equal(&value), "{:?} read back as {:?}", value, back);
    }

    #[test]
    fn dynamic_depth_balances_across_throw(depth in 1usize..12) {
        let ctx = context();
        let mut process = Process::new();
        let mut interp = Interpreter::new(&mut process, ctx);
        interp.eval_string("(defvar *nesting* 0)").unwrap();
        let before = interp.process.dynamic.depth();

        let mut text = String::from("(throw 'out *nesting*)");
        for level in (1..=depth).rev() {
            text = format!("(let ((*nesting* {})) {})", level, text);
        }
        let text = format!("(catch 'out {})", text);
        let result = interp.eval_string(&text).unwrap();

        prop_assert!(result.eql(&Value::Integer(depth as i64)));
        prop_assert_eq!(interp.process.dynamic.depth(), before);
    }
}
