//! Abstract syntax tree for BP programs.
//!
//! The parser produces this tree untyped: every expression carries a
//! `line` for diagnostics and an `inferred` slot that the type checker
//! fills in. Call sites, field accesses, enum members, lambdas and
//! instantiations likewise carry resolution slots (`CallTarget`,
//! field/method/class indices) that start out empty and are written
//! during checking, so the compilers never look anything up by name.

use serde::{Deserialize, Serialize};

/// Resolved function-index sentinel for builtin calls.
pub const FN_BUILTIN: i64 = -1;
/// Base of the extern sentinel range: extern `k` encodes as `FN_EXTERN_BASE - k`.
pub const FN_EXTERN_BASE: i64 = -2;

/// A BP type.
///
/// Equality is structural for compound types and name-based for
/// struct/enum/class (the derived `PartialEq` compares the carried names).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Int,
    Float,
    Bool,
    Str,
    Void,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Array(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Struct(String),
    Enum(String),
    Class(String),
    Tuple(Vec<Type>),
    Function(Vec<Type>, Box<Type>),
    Ptr(Box<Type>),
    /// A user type name the parser could not classify yet. The type
    /// checker resolves every `Named` into `Struct`/`Enum`/`Class` (or
    /// fails); none survive a successful check.
    Named(String),
}

impl Type {
    /// All integer-valued types, including the fixed-width family.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Type::Int
                | Type::I8
                | Type::I16
                | Type::I32
                | Type::I64
                | Type::U8
                | Type::U16
                | Type::U32
                | Type::U64
        )
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, Type::Float)
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Bool => write!(f, "bool"),
            Type::Str => write!(f, "str"),
            Type::Void => write!(f, "void"),
            Type::I8 => write!(f, "i8"),
            Type::I16 => write!(f, "i16"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::U8 => write!(f, "u8"),
            Type::U16 => write!(f, "u16"),
            Type::U32 => write!(f, "u32"),
            Type::U64 => write!(f, "u64"),
            Type::Array(elem) => write!(f, "[{}]", elem),
            Type::Map(k, v) => write!(f, "{{{}: {}}}", k, v),
            Type::Struct(name) | Type::Enum(name) | Type::Class(name) | Type::Named(name) => {
                write!(f, "{}", name)
            }
            Type::Tuple(elems) => {
                write!(f, "(")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            Type::Function(params, ret) => {
                write!(f, "fn(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}", ret)
            }
            Type::Ptr(elem) => write!(f, "ptr[{}]", elem),
        }
    }
}

/// Resolved callee of a `Call` expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallTarget {
    /// Not yet resolved (parser output).
    Unresolved,
    /// User-defined function by module index.
    User(u32),
    /// Builtin primitive by numeric id.
    Builtin(u16),
    /// Extern (FFI) function by extern-table index.
    Extern(u32),
}

impl CallTarget {
    /// Numeric encoding: user indices are non-negative, builtins map to
    /// `FN_BUILTIN`, extern `k` maps to `FN_EXTERN_BASE - k`.
    pub fn fn_index(&self) -> i64 {
        match self {
            CallTarget::Unresolved => i64::MIN,
            CallTarget::User(i) => *i as i64,
            CallTarget::Builtin(_) => FN_BUILTIN,
            CallTarget::Extern(k) => FN_EXTERN_BASE - *k as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

/// One piece of a formatted string: literal text or an embedded expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FStringPart {
    Lit(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
    /// Filled by the type checker; `None` only before checking.
    pub inferred: Option<Type>,
}

impl Expr {
    pub fn new(kind: ExprKind, line: u32) -> Self {
        Self {
            kind,
            line,
            inferred: None,
        }
    }

    /// The inferred type, panicking if the checker has not run.
    /// Only meaningful after a successful type check.
    pub fn ty(&self) -> &Type {
        self.inferred
            .as_ref()
            .expect("expression not yet type checked")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    BoolLit(bool),
    StrLit(String),
    Null,
    Var(String),
    Call {
        name: String,
        args: Vec<Expr>,
        target: CallTarget,
    },
    /// Call through a function-typed value (lambda in a variable, element
    /// of a function array, result of another call).
    CallValue {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    ArrayLit(Vec<Expr>),
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    MapLit(Vec<(Expr, Expr)>),
    StructLit {
        name: String,
        fields: Vec<(String, Expr)>,
        type_id: Option<u16>,
    },
    Field {
        base: Box<Expr>,
        name: String,
        index: Option<u16>,
    },
    TupleLit(Vec<Expr>),
    Lambda {
        params: Vec<Param>,
        ret: Type,
        body: Box<Expr>,
        /// Synthetic function index assigned during type checking.
        fn_index: Option<u32>,
    },
    EnumMember {
        enum_name: String,
        member: String,
        /// Resolved integer value of the member.
        value: Option<i64>,
    },
    FString(Vec<FStringPart>),
    MethodCall {
        base: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        method_id: Option<u16>,
    },
    /// Class instantiation `Name(args)`; the parser emits `Call` and the
    /// checker rewrites it once it knows `Name` is a class.
    New {
        class: String,
        args: Vec<Expr>,
        class_id: Option<u16>,
    },
    SuperCall {
        name: String,
        args: Vec<Expr>,
        method_id: Option<u16>,
    },
    FuncRef {
        name: String,
        fn_index: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

impl Stmt {
    pub fn new(kind: StmtKind, line: u32) -> Self {
        Self { kind, line }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub pattern: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    Let {
        name: String,
        ty: Type,
        init: Expr,
    },
    Assign {
        name: String,
        value: Expr,
    },
    IndexAssign {
        base: Expr,
        index: Expr,
        value: Expr,
    },
    FieldAssign {
        base: Expr,
        field: String,
        index: Option<u16>,
        value: Expr,
    },
    Expr(Expr),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    ForRange {
        var: String,
        start: Expr,
        end: Expr,
        body: Vec<Stmt>,
    },
    ForEach {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Try {
        body: Vec<Stmt>,
        catch: Option<(String, Vec<Stmt>)>,
        finally_body: Vec<Stmt>,
    },
    Throw(Expr),
    Match {
        subject: Expr,
        arms: Vec<MatchArm>,
        default: Option<Vec<Stmt>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Type,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<Param>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub members: Vec<String>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub parent: Option<String>,
    pub fields: Vec<Param>,
    pub methods: Vec<FuncDef>,
    pub line: u32,
}

/// An `extern` declaration: a native symbol callable through the FFI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternDecl {
    pub bp_name: String,
    pub c_name: String,
    pub library: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub variadic: bool,
    pub line: u32,
}

/// A parsed source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub funcs: Vec<FuncDef>,
    pub structs: Vec<StructDef>,
    pub enums: Vec<EnumDef>,
    pub classes: Vec<ClassDef>,
    pub externs: Vec<ExternDecl>,
    /// Module-level `let` statements, executed before `main`.
    pub globals: Vec<Stmt>,
    pub imports: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_equality_is_structural_for_compounds() {
        let a = Type::Array(Box::new(Type::Int));
        let b = Type::Array(Box::new(Type::Int));
        assert_eq!(a, b);
        assert_ne!(a, Type::Array(Box::new(Type::Float)));
    }

    #[test]
    fn test_type_equality_is_name_based_for_nominals() {
        assert_eq!(Type::Struct("P".into()), Type::Struct("P".into()));
        assert_ne!(Type::Struct("P".into()), Type::Struct("Q".into()));
        assert_ne!(Type::Struct("P".into()), Type::Class("P".into()));
    }

    #[test]
    fn test_call_target_sentinels() {
        assert_eq!(CallTarget::User(3).fn_index(), 3);
        assert_eq!(CallTarget::Builtin(7).fn_index(), FN_BUILTIN);
        assert_eq!(CallTarget::Extern(0).fn_index(), -2);
        assert_eq!(CallTarget::Extern(4).fn_index(), -6);
    }

    #[test]
    fn test_fixed_width_types_are_integers() {
        assert!(Type::U32.is_integer());
        assert!(Type::I8.is_numeric());
        assert!(!Type::Float.is_integer());
        assert!(Type::Float.is_numeric());
    }

    #[test]
    fn test_type_display() {
        let t = Type::Function(vec![Type::Int, Type::Str], Box::new(Type::Bool));
        assert_eq!(t.to_string(), "fn(int, str) -> bool");
        assert_eq!(
            Type::Map(Box::new(Type::Str), Box::new(Type::Int)).to_string(),
            "{str: int}"
        );
    }
}
