mod common;

use std::thread;

use common::{boot, eval, eval_in};
use hostcl::Process;

const WORKER_STACK: usize = 64 * 1024 * 1024;

#[test]
fn test_processes_do_not_share_dynamic_bindings() {
    let ctx = boot();
    eval(&ctx, "(defvar *who* :main) (def who () *who*)").unwrap();

    let results: Vec<String> = thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let ctx = &ctx;
                thread::Builder::new()
                    .stack_size(WORKER_STACK)
                    .spawn_scoped(scope, move || {
                        let mut process = Process::new();
                        let text = format!(
                            "(let ((*who* {i})) (let ((seen nil)) (dotimes (k 200) (push (who) seen)) (list (who) (length seen))))"
                        );
                        eval_in(ctx, &mut process, &text).unwrap()
                    })
                    .unwrap()
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    for (i, result) in results.iter().enumerate() {
        assert_eq!(result, &format!("({} 200)", i));
    }
    assert_eq!(eval(&ctx, "(who)").unwrap(), ":MAIN");
}

#[test]
fn test_definitions_are_shared_between_processes() {
    let ctx = boot();
    thread::scope(|scope| {
        thread::Builder::new()
            .stack_size(WORKER_STACK)
            .spawn_scoped(scope, || eval(&ctx, "(def shared-double (x) (* 2 x))").unwrap())
            .unwrap()
            .join()
            .unwrap();
    });
    assert_eq!(eval(&ctx, "(shared-double 21)").unwrap(), "42");
}

#[test]
fn test_process_reset_drops_leftover_state() {
    let ctx = boot();
    let mut process = Process::new();
    eval_in(&ctx, &mut process, "(defvar *x* 1)").unwrap();
    process.dynamic.push(smallvec::smallvec![]);
    process.catch_tags.push(hostcl::Value::Integer(1));
    process.reset();
    assert_eq!(process.dynamic.depth(), 0);
    assert!(process.catch_tags.is_empty());
    assert_eq!(eval_in(&ctx, &mut process, "*x*").unwrap(), "1");
}
