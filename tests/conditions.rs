mod common;

use common::{boot, eval, eval_in};
use hostcl::Process;

#[test]
fn test_warning_handler_resumes_after_signal() {
    let ctx = boot();
    let text = "
        (let ((events nil))
          (handler-bind ((warning (lambda (c) (setq events (cons :handled events)))))
            (signal (make-condition 'simple-warning :format-control \"careful\"))
            (setq events (cons :after events)))
          (reverse events))";
    assert_eq!(eval(&ctx, text).unwrap(), "(:HANDLED :AFTER)");
}

#[test]
fn test_use_value_restart() {
    let ctx = boot();
    let text = "
        (handler-bind ((error (lambda (c) (invoke-restart 'use-value 42))))
          (restart-case (error \"boom\")
            (use-value (v) v)))";
    assert_eq!(eval(&ctx, text).unwrap(), "42");
}

#[test]
fn test_handler_case_unwinds_to_clause() {
    let ctx = boot();
    let text = "
        (handler-case (progn (error \"bad ~a\" 7) :not-reached)
          (warning () :warning)
          (error (e) (format nil \"caught: ~a\" e)))";
    assert_eq!(eval(&ctx, text).unwrap(), "\"caught: bad 7\"");
    assert_eq!(
        eval(&ctx, "(handler-case 5 (error () 0) (:no-error (v) (* v 2)))").unwrap(),
        "10"
    );
}

#[test]
fn test_runtime_errors_are_conditions() {
    let ctx = boot();
    assert_eq!(
        eval(&ctx, "(handler-case (/ 1 0) (division-by-zero () :div))").unwrap(),
        ":DIV"
    );
    assert_eq!(
        eval(&ctx, "(handler-case (car 5) (type-error () :type))").unwrap(),
        ":TYPE"
    );
    assert_eq!(
        eval(&ctx, "(handler-case no-such-var (unbound-variable () :unbound))").unwrap(),
        ":UNBOUND"
    );
    assert_eq!(eval(&ctx, "(ignore-errors (error \"x\") 1)").unwrap(), "NIL");
}

#[test]
fn test_define_condition_slots_and_report() {
    let ctx = boot();
    let text = "
        (define-condition overdraft (error)
          ((amount :initarg :amount :reader overdraft-amount))
          (:report \"account overdrawn\"))
        (handler-case (error 'overdraft :amount 30)
          (overdraft (c) (list (overdraft-amount c) (format nil \"~a\" c))))";
    assert_eq!(eval(&ctx, text).unwrap(), "(30 \"account overdrawn\")");
}

#[test]
fn test_warn_muffled_and_cerror_continued() {
    let ctx = boot();
    let text = "
        (list
          (handler-bind ((warning (lambda (c) (muffle-warning c))))
            (warn \"noisy\")
            :quiet)
          (handler-bind ((error (lambda (c) (continue c))))
            (cerror \"keep going\" \"stopped\")
            :continued))";
    assert_eq!(eval(&ctx, text).unwrap(), "(:QUIET :CONTINUED)");
}

#[test]
fn test_with_simple_restart_and_compute_restarts() {
    let ctx = boot();
    let text = "
        (handler-bind ((error (lambda (c) (invoke-restart 'skip))))
          (with-simple-restart (skip \"Skip it.\")
            (error \"fail\")
            :unreached))";
    assert_eq!(eval(&ctx, text).unwrap(), "NIL");
    let text = "
        (restart-case
            (mapcar #'restart-name (compute-restarts))
          (first-choice () 1)
          (second-choice () 2))";
    assert_eq!(eval(&ctx, text).unwrap(), "(FIRST-CHOICE SECOND-CHOICE)");
}

#[test]
fn test_restart_bind_runs_in_place() {
    let ctx = boot();
    let text = "
        (restart-bind ((double (lambda (x) (* x 2))))
          (+ 1 (invoke-restart 'double 20)))";
    assert_eq!(eval(&ctx, text).unwrap(), "41");
}

#[test]
fn test_handler_does_not_see_its_own_signals() {
    let ctx = boot();
    let text = "
        (handler-case
            (handler-bind ((error (lambda (c) (error \"from handler\"))))
              (error \"original\"))
          (error (e) (format nil \"~a\" e)))";
    assert_eq!(eval(&ctx, text).unwrap(), "\"from handler\"");
}

#[test]
fn test_unhandled_error_reports_class() {
    let ctx = boot();
    let err = eval(&ctx, "(error \"plain failure\")").unwrap_err();
    assert_eq!(err, "SIMPLE-ERROR: plain failure");
}

#[test]
fn test_dynamic_depth_restored_after_throw() {
    let ctx = boot();
    let mut process = Process::new();
    eval_in(&ctx, &mut process, "(defvar *level* 0)").unwrap();
    let before = process.dynamic.depth();
    let text = "
        (catch 'out
          (let ((*level* 1))
            (let ((*level* 2))
              (throw 'out *level*))))";
    assert_eq!(eval_in(&ctx, &mut process, text).unwrap(), "2");
    assert_eq!(process.dynamic.depth(), before);
    assert_eq!(eval_in(&ctx, &mut process, "*level*").unwrap(), "0");

    let err = eval_in(&ctx, &mut process, "(let ((*level* 5)) (error \"leave\"))").unwrap_err();
    assert!(err.contains("leave"));
    assert_eq!(process.dynamic.depth(), before);
}

#[test]
fn test_deep_recursion_runs_on_the_default_stack() {
    let ctx = boot();
    let text = "(def f (n) (if (= n 0) 0 (+ 1 (f (- n 1))))) (f 2000)";
    assert_eq!(eval(&ctx, text).unwrap(), "2000");
}

#[test]
fn test_runaway_recursion_is_a_storage_condition() {
    let ctx = boot();
    let text = "
        (def g (n) (+ 1 (g (+ n 1))))
        (handler-case (g 0) (storage-condition () :caught))";
    assert_eq!(eval(&ctx, text).unwrap(), ":CAUGHT");
    let err = eval(&ctx, "(def h () (h)) (h)").unwrap_err();
    assert!(err.contains("STORAGE-CONDITION"), "{err}");
}
