//! Lexer, parser and AST for the BP language.
//!
//! BP is a statically typed, Python-flavored source language: suites are
//! introduced by `:` and indentation, declarations are `def`, `struct`,
//! `enum`, `class` and `extern`, and every expression node carries a
//! line number plus an `inferred` type slot the downstream type checker
//! fills in.

pub mod ast;
pub mod error;
pub mod lexer;
pub mod parser;
mod token;

pub use ast::{Expr, ExprKind, Module, Stmt, StmtKind, Type};
pub use error::{ParseError, ParseResult};
pub use parser::{parse_expression, parse_module};

#[cfg(test)]
mod tests {
    use crate::ast::*;
    use crate::parse_module;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_simple_function() {
        let module = parse_module(
            "def main() -> int:\n    let x: int = 10\n    let y: int = 20\n    print(x + y)\n    return 0\n",
        )
        .unwrap();
        assert_eq!(module.funcs.len(), 1);
        let main = &module.funcs[0];
        assert_eq!(main.name, "main");
        assert_eq!(main.ret, Type::Int);
        assert_eq!(main.body.len(), 4);
        assert!(matches!(main.body[0].kind, StmtKind::Let { .. }));
        assert!(matches!(main.body[3].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn test_parse_inline_suite() {
        let module =
            parse_module("def f(n: int) -> int:\n    if n <= 1: return 1\n    return n\n").unwrap();
        let f = &module.funcs[0];
        match &f.body[0].kind {
            StmtKind::If { then_body, .. } => {
                assert_eq!(then_body.len(), 1);
                assert!(matches!(then_body[0].kind, StmtKind::Return(Some(_))));
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_elif_desugars_to_nested_if() {
        let src = "def f(n: int) -> int:\n    if n == 0:\n        return 0\n    elif n == 1:\n        return 1\n    else:\n        return 2\n";
        let module = parse_module(src).unwrap();
        match &module.funcs[0].body[0].kind {
            StmtKind::If { else_body, .. } => {
                assert_eq!(else_body.len(), 1);
                assert!(matches!(else_body[0].kind, StmtKind::If { .. }));
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_for_range_and_for_each() {
        let src = "def f() -> void:\n    for i in range(0, 10):\n        print(i)\n    for x in [1, 2]:\n        print(x)\n";
        let module = parse_module(src).unwrap();
        assert!(matches!(
            module.funcs[0].body[0].kind,
            StmtKind::ForRange { .. }
        ));
        assert!(matches!(
            module.funcs[0].body[1].kind,
            StmtKind::ForEach { .. }
        ));
    }

    #[test]
    fn test_parse_try_catch_finally() {
        let src = "def f() -> void:\n    try:\n        throw \"boom\"\n    catch e:\n        print(e)\n    finally:\n        print(\"done\")\n";
        let module = parse_module(src).unwrap();
        match &module.funcs[0].body[0].kind {
            StmtKind::Try {
                catch,
                finally_body,
                ..
            } => {
                assert_eq!(catch.as_ref().unwrap().0, "e");
                assert_eq!(finally_body.len(), 1);
            }
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_struct_enum_class() {
        let src = "struct Point:\n    x: int\n    y: int\nenum Color:\n    RED\n    GREEN\nclass Dog(Animal):\n    name: str\n    def speak(self: Dog) -> str:\n        return \"woof\"\n";
        let module = parse_module(src).unwrap();
        assert_eq!(module.structs[0].fields.len(), 2);
        assert_eq!(module.enums[0].members, vec!["RED", "GREEN"]);
        assert_eq!(module.classes[0].parent.as_deref(), Some("Animal"));
        assert_eq!(module.classes[0].methods.len(), 1);
    }

    #[test]
    fn test_parse_extern_decl() {
        let src = "extern def puts(str) -> int from \"libc.so.6\"\n";
        let module = parse_module(src).unwrap();
        let ext = &module.externs[0];
        assert_eq!(ext.bp_name, "puts");
        assert_eq!(ext.c_name, "puts");
        assert_eq!(ext.params, vec![Type::Str]);
        assert!(!ext.variadic);
    }

    #[test]
    fn test_parse_extern_with_alias_and_variadic() {
        let src = "extern def cprintf(str, int) -> int from \"libc.so.6\" as \"printf\" variadic\n";
        let module = parse_module(src).unwrap();
        let ext = &module.externs[0];
        assert_eq!(ext.c_name, "printf");
        assert!(ext.variadic);
    }

    #[test]
    fn test_parse_fstring_parts() {
        let src = "def f(x: int) -> void:\n    print(f\"x = {x}!\")\n";
        let module = parse_module(src).unwrap();
        let stmt = &module.funcs[0].body[0];
        let StmtKind::Expr(call) = &stmt.kind else {
            panic!("expected expr stmt")
        };
        let ExprKind::Call { args, .. } = &call.kind else {
            panic!("expected call")
        };
        let ExprKind::FString(parts) = &args[0].kind else {
            panic!("expected f-string")
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], FStringPart::Lit(s) if s == "x = "));
        assert!(matches!(&parts[1], FStringPart::Expr(_)));
        assert!(matches!(&parts[2], FStringPart::Lit(s) if s == "!"));
    }

    #[test]
    fn test_parse_lambda_and_value_call() {
        let src = "def f() -> int:\n    let g: fn(int) -> int = fn(a: int) -> int: a * 2\n    return g(21)\n";
        let module = parse_module(src).unwrap();
        let StmtKind::Let { ty, init, .. } = &module.funcs[0].body[0].kind else {
            panic!("expected let")
        };
        assert_eq!(
            *ty,
            Type::Function(vec![Type::Int], Box::new(Type::Int))
        );
        assert!(matches!(init.kind, ExprKind::Lambda { .. }));
    }

    #[test]
    fn test_parse_match() {
        let src = "def f(n: int) -> int:\n    match n:\n        case 1:\n            return 10\n        case 2:\n            return 20\n        default:\n            return 0\n    return -1\n";
        let module = parse_module(src).unwrap();
        let StmtKind::Match { arms, default, .. } = &module.funcs[0].body[0].kind else {
            panic!("expected match")
        };
        assert_eq!(arms.len(), 2);
        assert!(default.is_some());
    }

    #[test]
    fn test_parse_map_and_index_assign() {
        let src = "def f() -> void:\n    let m: {str: int} = {\"a\": 1}\n    m[\"b\"] = 2\n";
        let module = parse_module(src).unwrap();
        assert!(matches!(
            module.funcs[0].body[1].kind,
            StmtKind::IndexAssign { .. }
        ));
    }

    #[test]
    fn test_parse_struct_literal_and_field_assign() {
        let src = "def f() -> void:\n    let p: Point = Point { x: 1, y: 2 }\n    p.x = 3\n";
        let module = parse_module(src).unwrap();
        let StmtKind::Let { init, .. } = &module.funcs[0].body[0].kind else {
            panic!("expected let")
        };
        assert!(matches!(init.kind, ExprKind::StructLit { .. }));
        assert!(matches!(
            module.funcs[0].body[1].kind,
            StmtKind::FieldAssign { .. }
        ));
    }

    #[test]
    fn test_parse_method_and_super_calls() {
        let src = "class Dog(Animal):\n    def speak(self: Dog) -> str:\n        return super.speak()\ndef f(d: Dog) -> str:\n    return d.speak()\n";
        let module = parse_module(src).unwrap();
        let StmtKind::Return(Some(e)) = &module.classes[0].methods[0].body[0].kind else {
            panic!("expected return")
        };
        assert!(matches!(e.kind, ExprKind::SuperCall { .. }));
        let StmtKind::Return(Some(e)) = &module.funcs[0].body[0].kind else {
            panic!("expected return")
        };
        assert!(matches!(e.kind, ExprKind::MethodCall { .. }));
    }

    #[test]
    fn test_parse_global_let_and_import() {
        let src = "import util\nlet limit: int = 100\ndef main() -> int:\n    return limit\n";
        let module = parse_module(src).unwrap();
        assert_eq!(module.imports, vec!["util"]);
        assert_eq!(module.globals.len(), 1);
    }

    #[test]
    fn test_error_is_line_keyed() {
        let err = parse_module("def f() -> int:\n    let = 3\n").unwrap_err();
        assert_eq!(err.line(), 2);
    }

    #[test]
    fn test_semicolon_separated_statements() {
        let src = "def main() -> int: let x: int = 10; let y: int = 20; print(x + y); return 0\n";
        let module = parse_module(src).unwrap();
        assert_eq!(module.funcs[0].body.len(), 4);
    }
}
