mod common;

use common::{boot, eval};

#[test]
fn test_methods_ordered_most_specific_first() {
    let ctx = boot();
    let text = "
        (defgeneric classify (x))
        (defmethod classify ((x integer)) (cons :integer (call-next-method)))
        (defmethod classify ((x number)) (cons :number (call-next-method)))
        (defmethod classify ((x t)) (list :t))
        (list (classify 5) (classify 2.5) (classify \"s\"))";
    assert_eq!(
        eval(&ctx, text).unwrap(),
        "((:INTEGER :NUMBER :T) (:NUMBER :T) (:T))"
    );
}

#[test]
fn test_eql_specializer_beats_class() {
    let ctx = boot();
    let text = "
        (defmethod fact ((n integer)) (* n (fact (- n 1))))
        (defmethod fact ((n (eql 0))) 1)
        (fact 10)";
    assert_eq!(eval(&ctx, text).unwrap(), "3628800");
}

#[test]
fn test_standard_combination_order() {
    let ctx = boot();
    let text = "
        (defvar *trace* nil)
        (def note (x) (setq *trace* (cons x *trace*)))
        (defgeneric greet (x))
        (defmethod greet ((x number)) (note :primary) :result)
        (defmethod greet :before ((x number)) (note :before-number))
        (defmethod greet :before ((x integer)) (note :before-integer))
        (defmethod greet :after ((x number)) (note :after-number))
        (defmethod greet :after ((x integer)) (note :after-integer))
        (defmethod greet :around ((x integer))
          (note :around-in)
          (prog1 (call-next-method) (note :around-out)))
        (list (greet 1) (reverse *trace*))";
    assert_eq!(
        eval(&ctx, text).unwrap(),
        "(:RESULT (:AROUND-IN :BEFORE-INTEGER :BEFORE-NUMBER :PRIMARY :AFTER-NUMBER :AFTER-INTEGER :AROUND-OUT))"
    );
}

#[test]
fn test_no_applicable_method() {
    let ctx = boot();
    let text = "
        (defgeneric only-strings (x))
        (defmethod only-strings ((x string)) x)
        (handler-case (only-strings 1)
          (no-applicable-method-error () :none))";
    assert_eq!(eval(&ctx, text).unwrap(), ":NONE");
}

#[test]
fn test_classes_and_accessors() {
    let ctx = boot();
    let text = "
        (defclass point () ((x :initarg :x :accessor point-x)
                            (y :initarg :y :initform 0 :reader point-y)))
        (defclass point3 (point) ((z :initarg :z :initform 9 :accessor point-z)))
        (let ((p (make-instance 'point3 :x 1)))
          (setf (point-x p) 5)
          (setf (slot-value p 'z) 7)
          (list (point-x p) (point-y p) (point-z p)
                (typep p 'point) (typep 3 'point)
                (slot-boundp p 'x) (slot-exists-p p 'w)
                (class-name (class-of p))))";
    assert_eq!(eval(&ctx, text).unwrap(), "(5 0 7 T NIL T NIL POINT3)");
}

#[test]
fn test_methods_on_user_classes() {
    let ctx = boot();
    let text = "
        (defclass shape () ())
        (defclass circle (shape) ((r :initarg :r :reader radius)))
        (defclass square (shape) ((side :initarg :side :reader side)))
        (defgeneric area (s))
        (defmethod area ((s circle)) (* 3 (radius s) (radius s)))
        (defmethod area ((s square)) (* (side s) (side s)))
        (mapcar #'area (list (make-instance 'circle :r 2) (make-instance 'square :side 3)))";
    assert_eq!(eval(&ctx, text).unwrap(), "(12 9)");
}

#[test]
fn test_unbound_slot_and_unknown_initarg() {
    let ctx = boot();
    eval(&ctx, "(defclass box () ((content :initarg :content)))").unwrap();
    let err = eval(&ctx, "(slot-value (make-instance 'box) 'content)").unwrap_err();
    assert!(err.contains("unbound"), "{}", err);
    let err = eval(&ctx, "(make-instance 'box :lid 1)").unwrap_err();
    assert!(err.contains("LID"), "{}", err);
}

#[test]
fn test_operator_method_combination() {
    let ctx = boot();
    let text = "
        (defgeneric total (x) (:method-combination +))
        (defmethod total + ((x integer)) 1)
        (defmethod total + ((x number)) 10)
        (total 5)";
    assert_eq!(eval(&ctx, text).unwrap(), "11");
}

#[test]
fn test_call_next_method_without_next_method() {
    let ctx = boot();
    let text = "
        (defgeneric lone (x))
        (defmethod lone ((x integer)) (call-next-method))
        (handler-case (lone 1) (no-next-method-error () :nnm))";
    assert_eq!(eval(&ctx, text).unwrap(), ":NNM");
    assert!(eval(&ctx, "(defgeneric lone2 (x)) (defmethod lone2 ((x t)) (call-next-method)) (lone2 1)")
        .unwrap_err()
        .starts_with("NO-NEXT-METHOD-ERROR"));
}

#[test]
fn test_subclass_sees_redefined_superclass_slots() {
    let ctx = boot();
    let text = "
        (defclass vehicle () ((wheels :initarg :wheels)))
        (defclass truck (vehicle) ((load :initarg :load :initform 0)))
        (defclass vehicle () ((wheels :initarg :wheels)
                              (color :initarg :color :initform :red)))
        (let ((tr (make-instance 'truck :wheels 6 :color :blue)))
          (list (slot-value tr 'wheels) (slot-value tr 'color) (slot-value tr 'load)
                (slot-exists-p (make-instance 'truck) 'color)))";
    assert_eq!(eval(&ctx, text).unwrap(), "(6 :BLUE 0 T)");
}
