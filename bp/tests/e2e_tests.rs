//! End-to-end programs: source text in, stdout and exit codes out,
//! across both bytecode formats and both dispatchers.

mod common;

use common::{run, run_everywhere};

use bp::bytecode::file::{load_from_bytes, save_to_bytes};
use bp::pipeline::{compile_source, run_source_capture, SharedOutput};
use bp::{CodeFormat, DispatchMode, Vm, VmFault};

#[test]
fn test_arithmetic_and_control_flow() {
    let src = "def main() -> int:\n    let x: int = 10\n    let y: int = 20\n    print(x + y)\n    return 0\n";
    assert_eq!(run_everywhere(src), "30\n");
}

#[test]
fn test_recursion_factorial() {
    let src = "def factorial(n: int) -> int:\n    if n <= 1:\n        return 1\n    return n * factorial(n - 1)\n\ndef main() -> int:\n    print(factorial(5))\n    return 0\n";
    assert_eq!(run_everywhere(src), "120\n");
}

#[test]
fn test_exceptions_catch_and_finally() {
    let src = "def main() -> int:\n    try:\n        throw \"boom\"\n    catch e:\n        print(e)\n    finally:\n        print(\"done\")\n    return 0\n";
    assert_eq!(run_everywhere(src), "boom\ndone\n");
}

#[test]
fn test_collections_push_and_index() {
    let src = "def main() -> int:\n    let arr: [int] = [1, 2, 3]\n    array_push(arr, 4)\n    print(array_len(arr))\n    print(arr[3])\n    return 0\n";
    assert_eq!(run_everywhere(src), "4\n4\n");
}

#[test]
fn test_hot_loop_accumulation() {
    let src = "def add(a: int, b: int) -> int:\n    return a + b\n\ndef main() -> int:\n    let sum: int = 0\n    for i in range(0, 1000):\n        sum = sum + add(i, i)\n    print(sum)\n    return 0\n";
    assert_eq!(run_everywhere(src), "999000\n");
}

#[test]
fn test_bytecode_roundtrip_runs_identically() {
    let src = "def twice(n: int) -> int:\n    return n * 2\n\ndef main() -> int:\n    print(twice(21))\n    print(\"done\")\n    return 0\n";
    let direct = run_everywhere(src);
    for format in [CodeFormat::Stack, CodeFormat::Register] {
        let module = compile_source(src, format).unwrap();
        let bytes = save_to_bytes(&module);
        let loaded = load_from_bytes(&bytes).unwrap();
        assert_eq!(loaded, module);
        let out = SharedOutput::new();
        let mut vm = Vm::with_output(loaded, Box::new(out.clone())).unwrap();
        let code = vm.run().unwrap();
        assert_eq!(code, 0);
        assert_eq!(out.take_string(), direct);
    }
}

#[test]
fn test_exit_code_is_main_return_value() {
    let src = "def main() -> int:\n    return 42\n";
    let (_, code) =
        run_source_capture(src, CodeFormat::Register, DispatchMode::Switch).unwrap();
    assert_eq!(code, 42);
}

#[test]
fn test_exit_builtin_stops_execution() {
    let src = "def main() -> int:\n    print(\"before\")\n    exit(3)\n    print(\"after\")\n    return 0\n";
    for format in [CodeFormat::Stack, CodeFormat::Register] {
        let (out, code) = run_source_capture(src, format, DispatchMode::Switch).unwrap();
        assert_eq!(out, "before\n");
        assert_eq!(code, 3);
    }
}

#[test]
fn test_globals_initialize_before_main() {
    let src = "let base: int = 40\nlet offset: int = base + 2\ndef main() -> int:\n    print(offset)\n    return 0\n";
    assert_eq!(run_everywhere(src), "42\n");
}

#[test]
fn test_while_break_continue() {
    let src = "def main() -> int:\n    let i: int = 0\n    let total: int = 0\n    while true:\n        i = i + 1\n        if i > 10:\n            break\n        if i % 2 == 0:\n            continue\n        total = total + i\n    print(total)\n    return 0\n";
    assert_eq!(run_everywhere(src), "25\n");
}

#[test]
fn test_float_arithmetic_and_coercion() {
    let src = "def main() -> int:\n    let x: float = 3\n    let y: float = x / 2\n    print(y)\n    print(7 / 2.0)\n    print(7 / 2)\n    return 0\n";
    assert_eq!(run_everywhere(src), "1.5\n3.5\n3\n");
}

#[test]
fn test_strings_and_fstrings() {
    let src = "def main() -> int:\n    let name: str = \"bp\"\n    let n: int = 7\n    print(f\"hello {name}, n = {n}!\")\n    print(\"a\" + \"b\" + \"c\")\n    print(str_len(\"hello\"))\n    return 0\n";
    assert_eq!(run_everywhere(src), "hello bp, n = 7!\nabc\n5\n");
}

#[test]
fn test_maps_and_iteration() {
    let src = "def main() -> int:\n    let ages: {str: int} = {\"ann\": 31, \"bob\": 25}\n    ages[\"cid\"] = 19\n    print(map_len(ages))\n    print(ages[\"bob\"])\n    for name in ages:\n        print(name)\n    return 0\n";
    assert_eq!(run_everywhere(src), "3\n25\nann\nbob\ncid\n");
}

#[test]
fn test_structs() {
    let src = "struct Point:\n    x: int\n    y: int\n\ndef main() -> int:\n    let p: Point = Point { x: 3, y: 4 }\n    p.x = p.x + 10\n    print(p.x * p.y)\n    return 0\n";
    assert_eq!(run_everywhere(src), "52\n");
}

#[test]
fn test_enums_and_match() {
    let src = "enum Color:\n    RED\n    GREEN\n    BLUE\n\ndef name_of(c: Color) -> str:\n    match c:\n        case Color.RED:\n            return \"red\"\n        case Color.GREEN:\n            return \"green\"\n        default:\n            return \"blue\"\n    return \"?\"\n\ndef main() -> int:\n    print(name_of(Color.GREEN))\n    print(name_of(Color.BLUE))\n    return 0\n";
    assert_eq!(run_everywhere(src), "green\nblue\n");
}

#[test]
fn test_classes_methods_inheritance_super() {
    let src = "class Animal:\n    name: str\n    def init(self: Animal, name: str) -> void:\n        self.name = name\n    def speak(self: Animal) -> str:\n        return \"...\"\n    def intro(self: Animal) -> str:\n        return self.name + \" says \" + self.speak()\n\nclass Dog(Animal):\n    def speak(self: Dog) -> str:\n        return \"woof\"\n    def loud(self: Dog) -> str:\n        return super.speak() + \"!\"\n\ndef main() -> int:\n    let d: Dog = Dog(\"rex\")\n    print(d.intro())\n    print(d.loud())\n    return 0\n";
    assert_eq!(run_everywhere(src), "rex says woof\n...!\n");
}

#[test]
fn test_lambdas_and_function_values() {
    let src = "def apply(f: fn(int) -> int, x: int) -> int:\n    return f(x)\n\ndef square(n: int) -> int:\n    return n * n\n\ndef main() -> int:\n    let double: fn(int) -> int = fn(a: int) -> int: a * 2\n    print(double(21))\n    print(apply(double, 5))\n    print(apply(square, 5))\n    return 0\n";
    assert_eq!(run_everywhere(src), "42\n10\n25\n");
}

#[test]
fn test_tuples() {
    let src = "def main() -> int:\n    let pair: (int, str) = (7, \"seven\")\n    print(pair[0])\n    print(pair[1])\n    return 0\n";
    assert_eq!(run_everywhere(src), "7\nseven\n");
}

#[test]
fn test_for_each_over_array() {
    let src = "def main() -> int:\n    let total: int = 0\n    for x in [5, 10, 15]:\n        total = total + x\n    print(total)\n    return 0\n";
    assert_eq!(run_everywhere(src), "30\n");
}

#[test]
fn test_nested_try_and_rethrow_through_finally() {
    let src = "def main() -> int:\n    try:\n        try:\n            throw \"inner\"\n        finally:\n            print(\"cleanup\")\n    catch e:\n        print(\"caught \" + e)\n    return 0\n";
    assert_eq!(run_everywhere(src), "cleanup\ncaught inner\n");
}

#[test]
fn test_return_runs_enclosing_finally() {
    let src = "def f() -> int:\n    try:\n        return 1\n    finally:\n        print(\"finally\")\n    return 2\n\ndef main() -> int:\n    print(f())\n    return 0\n";
    assert_eq!(run_everywhere(src), "finally\n1\n");
}

#[test]
fn test_division_by_zero_is_fatal_not_catchable() {
    let src = "def main() -> int:\n    try:\n        let x: int = 1 / 0\n        print(x)\n    catch e:\n        print(\"caught\")\n    return 0\n";
    for format in [CodeFormat::Stack, CodeFormat::Register] {
        let err = run_source_capture(src, format, DispatchMode::Switch).unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("division by zero"), "got: {}", msg);
    }
}

#[test]
fn test_uncaught_throw_reports_the_value() {
    let src = "def main() -> int:\n    throw \"kaboom\"\n    return 0\n";
    let err = run_source_capture(src, CodeFormat::Register, DispatchMode::Switch).unwrap_err();
    match err {
        bp::pipeline::PipelineError::Runtime(VmFault::UncaughtException(repr)) => {
            assert_eq!(repr, "kaboom");
        }
        other => panic!("expected uncaught exception, got {}", other),
    }
}

#[test]
fn test_out_of_bounds_index_is_fatal() {
    let src = "def main() -> int:\n    let arr: [int] = [1]\n    print(arr[5])\n    return 0\n";
    let err = run_source_capture(src, CodeFormat::Register, DispatchMode::Switch).unwrap_err();
    assert!(format!("{}", err).contains("out of bounds"));
}

#[test]
fn test_fixed_width_ints_share_integer_ops() {
    let src = "def main() -> int:\n    let a: u8 = 200\n    let b: u8 = 55\n    print(a + b)\n    let c: i16 = -300\n    print(c * 2)\n    return 0\n";
    assert_eq!(run_everywhere(src), "255\n-600\n");
}

#[test]
fn test_builtin_string_and_math_helpers() {
    let src = "def main() -> int:\n    print(str_upper(\"abc\"))\n    print(substr(\"hello\", 1, 3))\n    print(abs(-4))\n    print(min(3, 9))\n    print(parse_int(\" 42 \"))\n    print(to_str(12) + \"!\")\n    return 0\n";
    assert_eq!(run_everywhere(src), "ABC\nell\n4\n3\n42\n12!\n");
}

#[test]
fn test_collection_builtins() {
    let src = "def main() -> int:\n    let arr: [int] = [3, 1, 2]\n    array_sort(arr)\n    print(arr[0])\n    print(array_contains(arr, 2))\n    print(array_pop(arr))\n    print(array_len(arr))\n    let words: [str] = str_split(\"a,b,c\", \",\")\n    print(array_join(words, \"-\"))\n    return 0\n";
    assert_eq!(run_everywhere(src), "1\ntrue\n3\n2\na-b-c\n");
}

#[test]
fn test_print_is_variadic() {
    let src = "def main() -> int:\n    print(1, \"two\", 3.0, true)\n    return 0\n";
    assert_eq!(run(src), "1 two 3.0 true\n");
}

#[test]
fn test_array_printing() {
    let src = "def main() -> int:\n    print([1, 2, 3])\n    print({\"k\": 1})\n    return 0\n";
    assert_eq!(run(src), "[1, 2, 3]\n{\"k\": 1}\n");
}

#[test]
fn test_match_on_ints_and_strings() {
    let src = "def classify(n: int) -> str:\n    match n:\n        case 0:\n            return \"zero\"\n        case 1:\n            return \"one\"\n        default:\n            return \"many\"\n    return \"?\"\n\ndef main() -> int:\n    print(classify(0))\n    print(classify(1))\n    print(classify(7))\n    match \"b\":\n        case \"a\":\n            print(\"first\")\n        case \"b\":\n            print(\"second\")\n        default:\n            print(\"none\")\n    return 0\n";
    assert_eq!(run_everywhere(src), "zero\none\nmany\nsecond\n");
}

#[test]
fn test_gc_collects_under_allocation_pressure() {
    // Churns several MiB of short-lived strings while keeping a few
    // live across collection boundaries.
    let src = "def main() -> int:\n    let keep: [str] = []\n    for i in range(0, 30000):\n        let s: str = \"chunk \" + to_str(i)\n        if i % 1000 == 0:\n            array_push(keep, s)\n    print(array_len(keep))\n    print(keep[29])\n    return 0\n";
    for format in [CodeFormat::Stack, CodeFormat::Register] {
        let (out, code, collections) =
            bp::run_source_inspect(src, format, DispatchMode::Switch, |vm| {
                vm.gc_stats().1
            })
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, "30\nchunk 29000\n");
        assert!(collections >= 1, "expected at least one sweep, got {}", collections);
    }
}

#[test]
fn test_deep_recursion_overflows_cleanly() {
    let src = "def down(n: int) -> int:\n    return down(n + 1)\n\ndef main() -> int:\n    return down(0)\n";
    let err = run_source_capture(src, CodeFormat::Register, DispatchMode::Switch).unwrap_err();
    assert!(format!("{}", err).contains("call stack overflow"));
}
