//! Lowering-level properties of compiled modules.

use bp::bytecode::CodeFormat;
use bp::compile_source;

const SAMPLE: &str = "struct Point:\n    x: int\n    y: int\n\ndef dist2(p: Point) -> int:\n    return p.x * p.x + p.y * p.y\n\ndef main() -> int:\n    let p: Point = Point { x: 3, y: 4 }\n    let msg: str = \"d2 = \"\n    print(msg, dist2(p))\n    print(msg)\n    return 0\n";

#[test]
fn test_both_backends_produce_valid_modules() {
    for format in [CodeFormat::Stack, CodeFormat::Register] {
        let module = compile_source(SAMPLE, format).unwrap();
        // compile_source validates, but be explicit: every jump target,
        // register bound and table index holds up.
        module.validate().unwrap();
        assert_eq!(module.funcs[module.entry as usize].name, "main");
        for func in &module.funcs {
            assert_eq!(func.format, format);
            match format {
                CodeFormat::Stack => assert!(func.locals >= func.arity),
                CodeFormat::Register => assert!(func.reg_count >= func.arity.max(1)),
            }
        }
    }
}

#[test]
fn test_string_pool_deduplicates() {
    let module = compile_source(SAMPLE, CodeFormat::Stack).unwrap();
    let occurrences = module.strings.iter().filter(|s| *s == "d2 = ").count();
    assert_eq!(occurrences, 1);
}

#[test]
fn test_str_refs_indirect_through_function_tables() {
    let module = compile_source(SAMPLE, CodeFormat::Register).unwrap();
    let main = module
        .funcs
        .iter()
        .find(|f| f.name == "main")
        .expect("main exists");
    assert!(!main.str_refs.is_empty());
    for &pool_idx in &main.str_refs {
        assert!((pool_idx as usize) < module.strings.len());
    }
    // Functions without string constants carry no refs.
    let dist2 = module.funcs.iter().find(|f| f.name == "dist2").unwrap();
    assert!(dist2.str_refs.is_empty());
}

#[test]
fn test_methods_and_lambdas_become_functions() {
    let src = "class A:\n    def f(self: A) -> int:\n        return 1\n\ndef main() -> int:\n    let g: fn(int) -> int = fn(n: int) -> int: n\n    return g(0)\n";
    let module = compile_source(src, CodeFormat::Register).unwrap();
    let names: Vec<&str> = module.funcs.iter().map(|f| f.name.as_str()).collect();
    assert!(names.contains(&"A.f"));
    assert!(names.contains(&"__lambda_0"));
    assert_eq!(module.class_types[0].methods[0].0, "f");
}

#[test]
fn test_int_return_flag_follows_declared_type() {
    let src = "def a() -> int:\n    return 1\n\ndef b() -> str:\n    return \"x\"\n\ndef c() -> u8:\n    return 1\n\ndef main() -> int:\n    print(a(), b(), c())\n    return 0\n";
    let module = compile_source(src, CodeFormat::Register).unwrap();
    let flag = |name: &str| {
        module
            .funcs
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.int_return)
            .unwrap()
    };
    assert!(flag("a"));
    assert!(!flag("b"));
    assert!(flag("c"));
}

#[test]
fn test_global_slots_counted() {
    let src = "let a: int = 1\nlet b: str = \"s\"\ndef main() -> int:\n    return a\n";
    for format in [CodeFormat::Stack, CodeFormat::Register] {
        let module = compile_source(src, format).unwrap();
        assert_eq!(module.global_count, 2);
    }
}

#[test]
fn test_extern_table_carries_type_codes() {
    let src = "extern def puts(str) -> int from \"libc.so.6\"\n\ndef main() -> int:\n    return 0\n";
    let module = compile_source(src, CodeFormat::Register).unwrap();
    assert_eq!(module.extern_funcs.len(), 1);
    let ext = &module.extern_funcs[0];
    assert_eq!(ext.c_name, "puts");
    assert_eq!(ext.params, vec![bp::bytecode::FfiType::Str]);
    assert_eq!(ext.ret, bp::bytecode::FfiType::Int);
}
