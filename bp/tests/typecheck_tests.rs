//! Type checker behavior: annotation, resolution rewrites, rejection
//! of ill-typed programs, and idempotence.

use bp_parser::ast::{CallTarget, ExprKind, StmtKind, Type};
use bp_parser::parse_module;
use pretty_assertions::assert_eq;

use bp::typecheck::check_module;

fn check_err(src: &str) -> String {
    let mut module = parse_module(src).expect("parse");
    check_module(&mut module).expect_err("should not type check").to_string()
}

#[test]
fn test_every_expression_is_annotated() {
    let src = "def main() -> int:\n    let x: int = 1 + 2\n    print(x)\n    return x\n";
    let mut module = parse_module(src).unwrap();
    check_module(&mut module).unwrap();
    let StmtKind::Let { init, .. } = &module.funcs[0].body[0].kind else {
        panic!("expected let");
    };
    assert_eq!(init.inferred, Some(Type::Int));
    let ExprKind::Binary { lhs, rhs, .. } = &init.kind else {
        panic!("expected binary");
    };
    assert_eq!(lhs.inferred, Some(Type::Int));
    assert_eq!(rhs.inferred, Some(Type::Int));
}

#[test]
fn test_checking_is_idempotent() {
    let src = "struct P:\n    x: int\n\nenum E:\n    A\n    B\n\nclass C:\n    n: int\n    def init(self: C, n: int) -> void:\n        self.n = n\n\ndef helper(v: float) -> float:\n    return v / 2\n\ndef main() -> int:\n    let p: P = P { x: 1 }\n    let c: C = C(3)\n    let e: E = E.B\n    let f: fn(int) -> int = fn(a: int) -> int: a + 1\n    let z: float = 3\n    print(helper(z), p.x, c.n, f(1))\n    match e:\n        case E.A:\n            print(\"a\")\n        default:\n            print(\"other\")\n    return 0\n";
    let mut first = parse_module(src).unwrap();
    check_module(&mut first).unwrap();
    let mut second = first.clone();
    check_module(&mut second).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_call_targets_resolve() {
    let src = "def helper(n: int) -> int:\n    return n\n\ndef main() -> int:\n    print(helper(1))\n    return 0\n";
    let mut module = parse_module(src).unwrap();
    let info = check_module(&mut module).unwrap();
    assert_eq!(info.entry, 1);
    let StmtKind::Expr(print_call) = &module.funcs[1].body[0].kind else {
        panic!("expected expr stmt");
    };
    let ExprKind::Call { target, args, .. } = &print_call.kind else {
        panic!("expected call");
    };
    assert!(matches!(target, CallTarget::Builtin(0)));
    let ExprKind::Call { target: inner, .. } = &args[0].kind else {
        panic!("expected inner call");
    };
    assert!(matches!(inner, CallTarget::User(0)));
}

#[test]
fn test_class_call_rewrites_to_instantiation() {
    let src = "class C:\n    n: int\n\ndef main() -> int:\n    let c: C = C()\n    return 0\n";
    let mut module = parse_module(src).unwrap();
    check_module(&mut module).unwrap();
    let StmtKind::Let { init, .. } = &module.funcs[0].body[0].kind else {
        panic!("expected let");
    };
    assert!(matches!(
        init.kind,
        ExprKind::New { class_id: Some(0), .. }
    ));
}

#[test]
fn test_enum_member_resolution() {
    let src = "enum E:\n    A\n    B\n\ndef main() -> int:\n    let e: E = E.B\n    return 0\n";
    let mut module = parse_module(src).unwrap();
    check_module(&mut module).unwrap();
    let StmtKind::Let { init, .. } = &module.funcs[0].body[0].kind else {
        panic!("expected let");
    };
    assert!(matches!(
        init.kind,
        ExprKind::EnumMember { value: Some(1), .. }
    ));
}

#[test]
fn test_mismatched_arithmetic_rejected() {
    let err = check_err("def main() -> int:\n    let x: int = 1 + 2.0\n    return 0\n");
    assert!(err.contains("line 2"), "got: {}", err);
}

#[test]
fn test_int_to_float_allowed_only_at_sinks() {
    // let-float with int initializer is fine ...
    let ok = "def main() -> int:\n    let x: float = 3\n    let y: float = x / 2\n    return 0\n";
    let mut module = parse_module(ok).unwrap();
    check_module(&mut module).unwrap();
    // ... but int multiplication with a float is not.
    let err = check_err("def main() -> int:\n    let n: int = 2\n    let x: float = n * 0.5\n    return 0\n");
    assert!(err.contains("Mul") || err.contains("cannot apply"), "got: {}", err);
}

#[test]
fn test_equality_requires_identical_types() {
    let err = check_err("def main() -> int:\n    if 1 == 1.0:\n        return 1\n    return 0\n");
    assert!(err.contains("identical types"), "got: {}", err);
}

#[test]
fn test_and_or_require_bool() {
    let err = check_err("def main() -> int:\n    if 1 and true:\n        return 1\n    return 0\n");
    assert!(err.contains("bool"), "got: {}", err);
}

#[test]
fn test_array_literal_must_be_homogeneous() {
    let err = check_err("def main() -> int:\n    let a: [int] = [1, \"x\"]\n    return 0\n");
    assert!(err.contains("mixes"), "got: {}", err);
}

#[test]
fn test_arity_mismatch_rejected() {
    let err = check_err(
        "def f(a: int) -> int:\n    return a\n\ndef main() -> int:\n    return f(1, 2)\n",
    );
    assert!(err.contains("argument"), "got: {}", err);
}

#[test]
fn test_unknown_names_rejected() {
    assert!(check_err("def main() -> int:\n    return nope\n").contains("unknown variable"));
    assert!(check_err("def main() -> int:\n    nope()\n    return 0\n")
        .contains("unknown function"));
    assert!(check_err("def main() -> int:\n    let x: Widget = null\n    return 0\n")
        .contains("unknown type"));
}

#[test]
fn test_duplicate_variable_in_scope_rejected() {
    let err = check_err(
        "def main() -> int:\n    let x: int = 1\n    let x: int = 2\n    return x\n",
    );
    assert!(err.contains("duplicate variable"), "got: {}", err);
}

#[test]
fn test_shadowing_across_scopes_is_legal() {
    let src = "def main() -> int:\n    let x: int = 1\n    if true:\n        let x: str = \"inner\"\n        print(x)\n    return x\n";
    let mut module = parse_module(src).unwrap();
    check_module(&mut module).unwrap();
}

#[test]
fn test_main_must_exist_with_right_signature() {
    assert!(check_err("def helper() -> int:\n    return 0\n").contains("main"));
    assert!(check_err("def main(n: int) -> int:\n    return n\n").contains("main"));
    assert!(check_err("def main() -> void:\n    return\n").contains("main"));
}

#[test]
fn test_break_outside_loop_rejected() {
    let err = check_err("def main() -> int:\n    break\n    return 0\n");
    assert!(err.contains("break"), "got: {}", err);
}

#[test]
fn test_throw_requires_str() {
    let err = check_err("def main() -> int:\n    throw 42\n    return 0\n");
    assert!(err.contains("str"), "got: {}", err);
}

#[test]
fn test_lambda_cannot_capture_locals() {
    let err = check_err(
        "def main() -> int:\n    let k: int = 2\n    let f: fn(int) -> int = fn(a: int) -> int: a * k\n    return f(1)\n",
    );
    assert!(err.contains("unknown variable 'k'"), "got: {}", err);
}

#[test]
fn test_lambda_can_read_globals() {
    let src = "let k: int = 2\n\ndef main() -> int:\n    let f: fn(int) -> int = fn(a: int) -> int: a * k\n    return f(1)\n";
    let mut module = parse_module(src).unwrap();
    let info = check_module(&mut module).unwrap();
    assert_eq!(info.lambdas.len(), 1);
    assert!(info.funcs.iter().any(|f| f.name == "__lambda_0"));
}

#[test]
fn test_method_tables_inherit_and_override_in_place() {
    let src = "class A:\n    def hello(self: A) -> int:\n        return 1\n    def other(self: A) -> int:\n        return 2\n\nclass B(A):\n    def other(self: B) -> int:\n        return 3\n\ndef main() -> int:\n    return 0\n";
    let mut module = parse_module(src).unwrap();
    let info = check_module(&mut module).unwrap();
    let a = &info.classes[0];
    let b = &info.classes[1];
    assert_eq!(a.methods.len(), 2);
    assert_eq!(b.methods.len(), 2);
    // Same slot for the overridden method, different function index.
    assert_eq!(a.methods[1].name, "other");
    assert_eq!(b.methods[1].name, "other");
    assert_ne!(a.methods[1].fn_index, b.methods[1].fn_index);
    // Inherited method keeps the parent's function index.
    assert_eq!(a.methods[0].fn_index, b.methods[0].fn_index);
}

#[test]
fn test_override_signature_must_match() {
    let err = check_err(
        "class A:\n    def f(self: A) -> int:\n        return 1\n\nclass B(A):\n    def f(self: B) -> str:\n        return \"x\"\n\ndef main() -> int:\n    return 0\n",
    );
    assert!(err.contains("signature"), "got: {}", err);
}

#[test]
fn test_globals_see_only_earlier_globals() {
    let err = check_err("let a: int = b\nlet b: int = 1\ndef main() -> int:\n    return 0\n");
    assert!(err.contains("unknown variable 'b'"), "got: {}", err);
}

#[test]
fn test_map_keys_must_be_hashable() {
    let err = check_err(
        "def main() -> int:\n    let m: {[int]: int} = {[1]: 2}\n    return 0\n",
    );
    assert!(err.contains("map key"), "got: {}", err);
}

#[test]
fn test_fixed_width_literal_bounds() {
    let err = check_err("def main() -> int:\n    let x: u8 = 300\n    return 0\n");
    assert!(err.contains("does not fit"), "got: {}", err);
}

#[test]
fn test_void_cannot_be_used_as_value() {
    let err = check_err(
        "def nothing() -> void:\n    return\n\ndef main() -> int:\n    let x: int = nothing()\n    return 0\n",
    );
    assert!(err.contains("mismatch"), "got: {}", err);
}
