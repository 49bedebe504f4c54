mod common;

use common::{boot, eval};

#[test]
fn test_square() {
    let ctx = boot();
    assert_eq!(eval(&ctx, "(def square (x) (* x x)) (square 7)").unwrap(), "49");
}

#[test]
fn test_untaken_error_branch_is_not_evaluated() {
    let ctx = boot();
    let text = "(let ((x 1) (y (if (> x 0) 2 (error \"neg\")))) (+ x y))";
    assert_eq!(eval(&ctx, text).unwrap(), "3");
}

#[test]
fn test_let_initializers_see_earlier_bindings() {
    let ctx = boot();
    assert_eq!(eval(&ctx, "(let ((a 2) (b (* a 10)) (c (+ a b))) (list a b c))").unwrap(), "(2 20 22)");
    assert_eq!(eval(&ctx, "(defvar *base* 5) (let ((*base* 1) (n *base*)) n)").unwrap(), "1");
}

#[test]
fn test_initializers_run_left_to_right_once() {
    let ctx = boot();
    let text = "
        (let* ((calls nil))
          (flet ((note (x) (setq calls (cons x calls)) x))
            (let ((a (note 1))
                  (b (if (> (note 2) 0)
                         (let ((y (note 3))) (setq y (+ y 27)) y)
                         (note 4)))
                  (c (note 5)))
              (list a b c (reverse calls)))))";
    assert_eq!(eval(&ctx, text).unwrap(), "(1 30 5 (1 2 3 5))");
}

#[test]
fn test_bignum_promotion() {
    let ctx = boot();
    assert_eq!(
        eval(&ctx, "(* 4611686018427387904 4)").unwrap(),
        "18446744073709551616"
    );
    assert_eq!(eval(&ctx, "(- (* 4611686018427387904 4) 18446744073709551615)").unwrap(), "1");
}

#[test]
fn test_prelude_macros() {
    let ctx = boot();
    assert_eq!(eval(&ctx, "(when (> 2 1) :yes)").unwrap(), ":YES");
    assert_eq!(eval(&ctx, "(unless (> 2 1) :yes)").unwrap(), "NIL");
    assert_eq!(eval(&ctx, "(cond ((= 1 2) :a) ((= 1 1) :b) (t :c))").unwrap(), ":B");
    assert_eq!(eval(&ctx, "(cond ((member 2 '(1 2 3))))").unwrap(), "(2 3)");
    assert_eq!(eval(&ctx, "(list (and 1 2) (and 1 nil) (or nil 3) (or))").unwrap(), "(2 NIL 3 NIL)");
    assert_eq!(eval(&ctx, "(case 3 ((1 2) :low) ((3 4) :mid) (otherwise :high))").unwrap(), ":MID");
    assert_eq!(eval(&ctx, "(case 9 ((1 2) :low) (t :other))").unwrap(), ":OTHER");
    assert_eq!(eval(&ctx, "(let ((n 0)) (dotimes (i 5) (incf n i)) n)").unwrap(), "10");
    assert_eq!(eval(&ctx, "(let ((xs nil)) (push 1 xs) (push 2 xs) (list (pop xs) xs))").unwrap(), "(2 (1))");
    assert_eq!(eval(&ctx, "(let ((n 1)) (prog1 n (setq n 2)))").unwrap(), "1");
    assert_eq!(eval(&ctx, "(dolist (x '(1 2 3)) (when (= x 2) (return (* x 10))))").unwrap(), "20");
}

#[test]
fn test_specials_are_dynamically_scoped() {
    let ctx = boot();
    let text = "
        (defvar *level* 0)
        (def current () *level*)
        (list (current) (let ((*level* 1)) (current)) (current))";
    assert_eq!(eval(&ctx, text).unwrap(), "(0 1 0)");
}

#[test]
fn test_closures_share_their_variables() {
    let ctx = boot();
    let text = "
        (def make-counter ()
          (let ((n 0))
            (list (lambda () (setq n (+ n 1))) (lambda () n))))
        (let* ((pair (make-counter)))
          (funcall (first pair))
          (funcall (first pair))
          (funcall (second pair)))";
    assert_eq!(eval(&ctx, text).unwrap(), "2");
}

#[test]
fn test_block_and_unwind_protect() {
    let ctx = boot();
    let text = "
        (let ((cleaned nil))
          (list (block outer
                  (unwind-protect (return-from outer :early)
                    (setq cleaned t)))
                cleaned))";
    assert_eq!(eval(&ctx, text).unwrap(), "(:EARLY T)");
}

#[test]
fn test_labels_recursion() {
    let ctx = boot();
    let text = "(labels ((fact (n) (if (= n 0) 1 (* n (fact (- n 1)))))) (fact 20))";
    assert_eq!(eval(&ctx, text).unwrap(), "2432902008176640000");
}

#[test]
fn test_packages_from_lisp() {
    let ctx = boot();
    let text = "
        (make-package \"SHAPES\" :use '(\"COMMON-LISP\"))
        (in-package \"SHAPES\")
        (def area (w h) (* w h))
        (export 'area)
        (in-package \"COMMON-LISP-USER\")
        (use-package \"SHAPES\")
        (area 3 4)";
    assert_eq!(eval(&ctx, text).unwrap(), "12");
}

#[test]
fn test_package_conflict_is_signalled() {
    let ctx = boot();
    let text = "
        (make-package \"LEFT\" :use nil)
        (make-package \"RIGHT\" :use nil)
        (make-package \"BOTH\" :use nil)
        (export (intern \"X\" \"LEFT\") \"LEFT\")
        (export (intern \"X\" \"RIGHT\") \"RIGHT\")
        (use-package \"LEFT\" \"BOTH\")
        (list (handler-case (progn (use-package \"RIGHT\" \"BOTH\") :no-conflict)
                (package-error () :conflict))
              (eq (find-symbol \"X\" \"BOTH\") (find-symbol \"X\" \"LEFT\")))";
    assert_eq!(eval(&ctx, text).unwrap(), "(:CONFLICT T)");
}
