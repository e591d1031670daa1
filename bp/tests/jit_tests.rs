//! Profiling-tier behavior: promotion, bailout, and agreement between
//! the interpreter and the native tier.

mod common;

use common::run_with_profile;

use bp::pipeline::run_source_capture;
use bp::{CodeFormat, DispatchMode};

const COMPILED: u8 = 4;
const FAILED: u8 = 5;

fn hot_caller(body: &str, calls: usize) -> String {
    format!(
        "{}\n\ndef main() -> int:\n    let sink: int = 0\n    for i in range(0, {}):\n        sink = sink + work(i)\n    print(sink)\n    return 0\n",
        body, calls
    )
}

#[test]
fn test_cold_function_stays_cold() {
    let src = hot_caller("def work(n: int) -> int:\n    return n", 10);
    let (_, code, state) = run_with_profile(&src, CodeFormat::Register, "work");
    assert_eq!(code, 0);
    assert!(state < 2, "10 calls should stay below warm/hot, got {}", state);
}

#[cfg(all(unix, target_arch = "x86_64"))]
#[test]
fn test_hot_integer_function_compiles() {
    let src = hot_caller(
        "def work(n: int) -> int:\n    return n * 2 + 1",
        1000,
    );
    let (out, code, state) = run_with_profile(&src, CodeFormat::Register, "work");
    assert_eq!(code, 0);
    assert_eq!(state, COMPILED);
    // sum over 0..1000 of 2n+1 = 999000 + 1000
    assert_eq!(out, "1000000\n");
}

#[test]
fn test_hot_stack_function_fails_permanently() {
    let src = hot_caller("def work(n: int) -> int:\n    return n", 500);
    let (_, _, state) = run_with_profile(&src, CodeFormat::Stack, "work");
    assert_eq!(state, FAILED);
}

#[test]
fn test_heap_using_function_bails_to_failed() {
    let src = hot_caller(
        "def work(n: int) -> int:\n    let arr: [int] = [n]\n    return arr[0]",
        500,
    );
    let (out, _, state) = run_with_profile(&src, CodeFormat::Register, "work");
    assert_eq!(state, FAILED);
    // Still interpreted correctly: sum of 0..500.
    assert_eq!(out, "124750\n");
}

#[test]
fn test_float_function_bails_to_failed() {
    let src = "def work(n: int) -> float:\n    return to_float(n) * 0.5\n\ndef main() -> int:\n    let sink: float = 0.0\n    for i in range(0, 300):\n        sink = sink + work(i)\n    print(sink)\n    return 0\n";
    let (out, _, state) = run_with_profile(src, CodeFormat::Register, "work");
    assert_eq!(state, FAILED);
    assert_eq!(out, "22425.0\n");
}

#[cfg(all(unix, target_arch = "x86_64"))]
#[test]
fn test_native_and_interpreter_agree_on_integer_math() {
    // The stack backend never compiles; the register backend goes hot
    // after 100 calls. Identical output means the two tiers agree on
    // wrapping arithmetic, bitwise ops, comparisons and branches.
    let body = "def work(n: int) -> int:\n    let acc: int = n * 1103515245 + 12345\n    if acc & 7 < 3:\n        acc = acc - n * n\n    else:\n        acc = acc + (n << 3) - (n >> 1)\n    return acc ^ (n * 31)";
    let src = hot_caller(body, 400);
    let (reg_out, reg_code, state) = run_with_profile(&src, CodeFormat::Register, "work");
    let (stack_out, stack_code, _) = run_with_profile(&src, CodeFormat::Stack, "work");
    assert_eq!(state, COMPILED);
    assert_eq!(reg_out, stack_out);
    assert_eq!(reg_code, stack_code);
}

#[test]
fn test_dividing_function_bails_and_stays_correct() {
    // Division has fault/wrapping semantics native code cannot honor,
    // so a hot function containing it parks as FAILED and interprets.
    let src = hot_caller(
        "def work(n: int) -> int:\n    return (n * n + 7) / (n + 1) + n % 3",
        500,
    );
    let (reg_out, _, state) = run_with_profile(&src, CodeFormat::Register, "work");
    assert_eq!(state, FAILED);
    let (stack_out, _, _) = run_with_profile(&src, CodeFormat::Stack, "work");
    assert_eq!(reg_out, stack_out);
}

#[test]
fn test_division_by_zero_still_faults_after_warmup() {
    // The zero divisor arrives only after the callee has crossed the
    // hot threshold: the fault must stay the interpreter's clean
    // diagnostic, never a hardware trap.
    let src = "def work(n: int) -> int:\n    return 100 / n\n\ndef main() -> int:\n    let sink: int = 0\n    for i in range(0, 200):\n        sink = sink + work(i + 1)\n    print(work(0))\n    return 0\n";
    for format in [CodeFormat::Stack, CodeFormat::Register] {
        let err = run_source_capture(src, format, DispatchMode::Switch).unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("division by zero"), "got: {}", msg);
    }
}

#[test]
fn test_min_over_minus_one_wraps_after_warmup() {
    let src = "def work(d: int) -> int:\n    let low: int = -9223372036854775807 - 1\n    return low / d\n\ndef main() -> int:\n    let last: int = 0\n    for i in range(0, 150):\n        last = work(-1)\n    print(last)\n    return 0\n";
    let (reg_out, reg_code, state) = run_with_profile(src, CodeFormat::Register, "work");
    assert_eq!(state, FAILED);
    assert_eq!(reg_out, "-9223372036854775808\n");
    assert_eq!(reg_code, 0);
    let (stack_out, _, _) = run_with_profile(src, CodeFormat::Stack, "work");
    assert_eq!(stack_out, reg_out);
}

#[cfg(all(unix, target_arch = "x86_64"))]
#[test]
fn test_methods_still_dispatch_while_callee_is_compiled() {
    // A compiled helper called from an interpreted method body.
    let src = "def helper(n: int) -> int:\n    return n + 1\n\nclass Counter:\n    value: int\n    def init(self: Counter, start: int) -> void:\n        self.value = start\n    def bump(self: Counter) -> int:\n        self.value = helper(self.value)\n        return self.value\n\ndef main() -> int:\n    let c: Counter = Counter(0)\n    let last: int = 0\n    for i in range(0, 300):\n        last = c.bump()\n    print(last)\n    return 0\n";
    let (out, code, state) = run_with_profile(src, CodeFormat::Register, "helper");
    assert_eq!(code, 0);
    assert_eq!(out, "300\n");
    assert_eq!(state, COMPILED);
}
