//! Builtin primitives.
//!
//! Every builtin has a stable numeric id; bytecode names them only by
//! id, and the interpreter funnels every `CALL_BUILTIN` through
//! [`stdlib_call`]. The id space is sparse: related groups sit on round
//! bases so new members slot in without renumbering.
//!
//! The signature table drives the type checker: `print` is variadic,
//! everything else has a fixed shape, with a few container-polymorphic
//! parameter and return specs (`ElemOfArg0` etc.) resolved against the
//! first argument's checked type.

use std::collections::HashMap;
use std::io::Write;

use once_cell::sync::Lazy;

use crate::bytecode::BpModule;
use crate::vm::error::VmFault;
use crate::vm::gc::{Gc, HeapObj, MapKey};
use crate::vm::rng::Rng;
use crate::vm::value::Value;

macro_rules! builtin_ids {
    ($($variant:ident = $val:literal / $name:literal,)*) => {
        /// Builtin function identifiers. The discriminant is the wire id.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum BuiltinId {
            $($variant = $val,)*
        }

        impl BuiltinId {
            pub fn from_u16(id: u16) -> Option<Self> {
                match id {
                    $($val => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// The surface name callable from BP source.
            pub fn bp_name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }
    };
}

builtin_ids! {
    Print = 0 / "print",
    ToStr = 1 / "to_str",
    Exit = 2 / "exit",
    Input = 3 / "input",
    StrLen = 4 / "str_len",
    Substr = 5 / "substr",
    StrFind = 6 / "str_find",
    StrSplit = 7 / "str_split",
    StrUpper = 8 / "str_upper",
    StrLower = 9 / "str_lower",
    ParseInt = 10 / "parse_int",
    ParseFloat = 11 / "parse_float",
    Chr = 12 / "chr",
    Ord = 13 / "ord",
    StrContains = 14 / "str_contains",
    StrReplace = 15 / "str_replace",
    StrTrim = 16 / "str_trim",
    ArrayLen = 20 / "array_len",
    ArrayPush = 21 / "array_push",
    ArrayPop = 22 / "array_pop",
    ArrayContains = 23 / "array_contains",
    ArraySort = 24 / "array_sort",
    ArrayJoin = 25 / "array_join",
    ArrayRemove = 26 / "array_remove",
    Keys = 30 / "keys",
    Values = 31 / "values",
    MapHasKey = 32 / "map_has_key",
    MapRemove = 33 / "map_remove",
    MapLen = 34 / "map_len",
    Abs = 40 / "abs",
    Min = 41 / "min",
    Max = 42 / "max",
    Pow = 43 / "pow",
    Sqrt = 44 / "sqrt",
    Floor = 45 / "floor",
    Ceil = 46 / "ceil",
    ToInt = 47 / "to_int",
    ToFloat = 48 / "to_float",
    TimeNs = 50 / "time_ns",
    ClockMs = 51 / "clock_ms",
    RandInt = 52 / "rand_int",
    RandFloat = 53 / "rand_float",
    RandSeed = 54 / "rand_seed",
    TypeOf = 55 / "type_of",
    ReadFile = 60 / "read_file",
    WriteFile = 61 / "write_file",
}

/// Parameter shape for signature checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSpec {
    Any,
    Int,
    Float,
    Bool,
    Str,
    Numeric,
    AnyArray,
    AnyMap,
    /// Must equal the element type of the first (array) argument.
    ElemOfArg0,
    /// Must equal the key type of the first (map) argument.
    KeyOfArg0,
}

/// Return shape for signature checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetSpec {
    Void,
    Int,
    Float,
    Bool,
    Str,
    StrArray,
    SameAsArg0,
    ElemOfArg0,
    /// Array of the first (map) argument's key type.
    KeysOfArg0,
    /// Array of the first (map) argument's value type.
    ValuesOfArg0,
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinSig {
    pub id: BuiltinId,
    pub params: &'static [ParamSpec],
    pub ret: RetSpec,
    pub variadic: bool,
}

use ParamSpec as P;
use RetSpec as R;

/// The fixed builtin signature table.
pub static BUILTIN_SIGS: &[BuiltinSig] = &[
    BuiltinSig { id: BuiltinId::Print, params: &[], ret: R::Void, variadic: true },
    BuiltinSig { id: BuiltinId::ToStr, params: &[P::Any], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::Exit, params: &[P::Int], ret: R::Void, variadic: false },
    BuiltinSig { id: BuiltinId::Input, params: &[], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::StrLen, params: &[P::Str], ret: R::Int, variadic: false },
    BuiltinSig { id: BuiltinId::Substr, params: &[P::Str, P::Int, P::Int], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::StrFind, params: &[P::Str, P::Str], ret: R::Int, variadic: false },
    BuiltinSig { id: BuiltinId::StrSplit, params: &[P::Str, P::Str], ret: R::StrArray, variadic: false },
    BuiltinSig { id: BuiltinId::StrUpper, params: &[P::Str], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::StrLower, params: &[P::Str], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::ParseInt, params: &[P::Str], ret: R::Int, variadic: false },
    BuiltinSig { id: BuiltinId::ParseFloat, params: &[P::Str], ret: R::Float, variadic: false },
    BuiltinSig { id: BuiltinId::Chr, params: &[P::Int], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::Ord, params: &[P::Str], ret: R::Int, variadic: false },
    BuiltinSig { id: BuiltinId::StrContains, params: &[P::Str, P::Str], ret: R::Bool, variadic: false },
    BuiltinSig { id: BuiltinId::StrReplace, params: &[P::Str, P::Str, P::Str], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::StrTrim, params: &[P::Str], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::ArrayLen, params: &[P::AnyArray], ret: R::Int, variadic: false },
    BuiltinSig { id: BuiltinId::ArrayPush, params: &[P::AnyArray, P::ElemOfArg0], ret: R::Void, variadic: false },
    BuiltinSig { id: BuiltinId::ArrayPop, params: &[P::AnyArray], ret: R::ElemOfArg0, variadic: false },
    BuiltinSig { id: BuiltinId::ArrayContains, params: &[P::AnyArray, P::ElemOfArg0], ret: R::Bool, variadic: false },
    BuiltinSig { id: BuiltinId::ArraySort, params: &[P::AnyArray], ret: R::Void, variadic: false },
    BuiltinSig { id: BuiltinId::ArrayJoin, params: &[P::AnyArray, P::Str], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::ArrayRemove, params: &[P::AnyArray, P::Int], ret: R::Void, variadic: false },
    BuiltinSig { id: BuiltinId::Keys, params: &[P::AnyMap], ret: R::KeysOfArg0, variadic: false },
    BuiltinSig { id: BuiltinId::Values, params: &[P::AnyMap], ret: R::ValuesOfArg0, variadic: false },
    BuiltinSig { id: BuiltinId::MapHasKey, params: &[P::AnyMap, P::KeyOfArg0], ret: R::Bool, variadic: false },
    BuiltinSig { id: BuiltinId::MapRemove, params: &[P::AnyMap, P::KeyOfArg0], ret: R::Void, variadic: false },
    BuiltinSig { id: BuiltinId::MapLen, params: &[P::AnyMap], ret: R::Int, variadic: false },
    BuiltinSig { id: BuiltinId::Abs, params: &[P::Numeric], ret: R::SameAsArg0, variadic: false },
    BuiltinSig { id: BuiltinId::Min, params: &[P::Numeric, P::Numeric], ret: R::SameAsArg0, variadic: false },
    BuiltinSig { id: BuiltinId::Max, params: &[P::Numeric, P::Numeric], ret: R::SameAsArg0, variadic: false },
    BuiltinSig { id: BuiltinId::Pow, params: &[P::Float, P::Float], ret: R::Float, variadic: false },
    BuiltinSig { id: BuiltinId::Sqrt, params: &[P::Float], ret: R::Float, variadic: false },
    BuiltinSig { id: BuiltinId::Floor, params: &[P::Float], ret: R::Float, variadic: false },
    BuiltinSig { id: BuiltinId::Ceil, params: &[P::Float], ret: R::Float, variadic: false },
    BuiltinSig { id: BuiltinId::ToInt, params: &[P::Any], ret: R::Int, variadic: false },
    BuiltinSig { id: BuiltinId::ToFloat, params: &[P::Any], ret: R::Float, variadic: false },
    BuiltinSig { id: BuiltinId::TimeNs, params: &[], ret: R::Int, variadic: false },
    BuiltinSig { id: BuiltinId::ClockMs, params: &[], ret: R::Int, variadic: false },
    BuiltinSig { id: BuiltinId::RandInt, params: &[P::Int, P::Int], ret: R::Int, variadic: false },
    BuiltinSig { id: BuiltinId::RandFloat, params: &[], ret: R::Float, variadic: false },
    BuiltinSig { id: BuiltinId::RandSeed, params: &[P::Int], ret: R::Void, variadic: false },
    BuiltinSig { id: BuiltinId::TypeOf, params: &[P::Any], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::ReadFile, params: &[P::Str], ret: R::Str, variadic: false },
    BuiltinSig { id: BuiltinId::WriteFile, params: &[P::Str, P::Str], ret: R::Void, variadic: false },
];

/// Name -> signature lookup for the type checker.
pub static BUILTINS_BY_NAME: Lazy<HashMap<&'static str, &'static BuiltinSig>> =
    Lazy::new(|| {
        BUILTIN_SIGS
            .iter()
            .map(|sig| (sig.id.bp_name(), sig))
            .collect()
    });

/// Everything a builtin may touch, threaded explicitly instead of
/// through module-level globals.
pub struct BuiltinCtx<'a> {
    pub gc: &'a mut Gc,
    pub module: &'a BpModule,
    pub out: &'a mut dyn Write,
    pub exit_code: &'a mut i32,
    pub exiting: &'a mut bool,
    pub rng: &'a mut Rng,
}

impl std::fmt::Debug for BuiltinCtx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BuiltinCtx(exit_code {})", self.exit_code)
    }
}

fn arg(args: &[Value], i: usize) -> Result<Value, VmFault> {
    args.get(i)
        .copied()
        .ok_or_else(|| VmFault::Internal(format!("builtin missing argument {}", i)))
}

fn int_arg(args: &[Value], i: usize, op: &'static str) -> Result<i64, VmFault> {
    match arg(args, i)? {
        Value::Int(v) => Ok(v),
        other => Err(VmFault::TagMismatch { op, expected: "int", got: other.tag() }),
    }
}

fn float_arg(args: &[Value], i: usize, op: &'static str) -> Result<f64, VmFault> {
    match arg(args, i)? {
        Value::Float(v) => Ok(v),
        other => Err(VmFault::TagMismatch { op, expected: "float", got: other.tag() }),
    }
}

fn str_arg<'g>(
    args: &[Value],
    i: usize,
    gc: &'g Gc,
    op: &'static str,
) -> Result<&'g str, VmFault> {
    match arg(args, i)? {
        Value::Str(r) => gc.str(r),
        other => Err(VmFault::TagMismatch { op, expected: "str", got: other.tag() }),
    }
}

fn array_arg(args: &[Value], i: usize, op: &'static str) -> Result<u32, VmFault> {
    match arg(args, i)? {
        Value::Array(r) => Ok(r),
        other => Err(VmFault::TagMismatch { op, expected: "array", got: other.tag() }),
    }
}

fn map_arg(args: &[Value], i: usize, op: &'static str) -> Result<u32, VmFault> {
    match arg(args, i)? {
        Value::Map(r) => Ok(r),
        other => Err(VmFault::TagMismatch { op, expected: "map", got: other.tag() }),
    }
}

/// Format a float the way BP prints it: integral values keep one
/// decimal so int and float output stay distinguishable.
pub fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

/// Sort map keys for deterministic iteration in `keys`/`values`/printing.
fn sorted_keys(map: &HashMap<MapKey, Value>) -> Vec<MapKey> {
    let mut keys: Vec<MapKey> = map.keys().cloned().collect();
    keys.sort_by(|a, b| match (a, b) {
        (MapKey::Int(x), MapKey::Int(y)) => x.cmp(y),
        (MapKey::Str(x), MapKey::Str(y)) => x.cmp(y),
        (MapKey::Bool(x), MapKey::Bool(y)) => x.cmp(y),
        (MapKey::FloatBits(x), MapKey::FloatBits(y)) => f64::from_bits(*x)
            .partial_cmp(&f64::from_bits(*y))
            .unwrap_or(std::cmp::Ordering::Equal),
        _ => a.describe().cmp(&b.describe()),
    });
    keys
}

fn key_to_value(key: &MapKey, gc: &mut Gc) -> Value {
    match key {
        MapKey::Int(v) => Value::Int(*v),
        MapKey::Bool(b) => Value::Bool(*b),
        MapKey::FloatBits(bits) => Value::Float(f64::from_bits(*bits)),
        MapKey::Str(s) => Value::Str(gc.alloc_str(s.clone())),
    }
}

/// Render a value for `to_str` and `print`.
pub fn format_value(value: Value, gc: &Gc, module: &BpModule) -> Result<String, VmFault> {
    Ok(match value {
        Value::Int(v) => v.to_string(),
        Value::Float(v) => format_float(v),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Str(r) => gc.str(r)?.to_string(),
        Value::Array(r) => {
            let items = gc.array(r)?;
            let mut out = String::from("[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&format_item(*item, gc, module)?);
            }
            out.push(']');
            out
        }
        Value::Map(r) => {
            let map = gc.map(r)?;
            let mut out = String::from("{");
            for (i, key) in sorted_keys(map).iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let shown = match key {
                    MapKey::Str(s) => format!("\"{}\"", s),
                    other => other.describe(),
                };
                out.push_str(&shown);
                out.push_str(": ");
                out.push_str(&format_item(map[key], gc, module)?);
            }
            out.push('}');
            out
        }
        Value::Struct(r) => {
            let fields = gc.fields(r)?;
            let mut out = String::from("{ ");
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&format_item(*field, gc, module)?);
            }
            out.push_str(" }");
            out
        }
        Value::Class(r) => {
            let class_id = gc.instance_class_id(r)? as usize;
            let name = module
                .class_types
                .get(class_id)
                .map(|c| c.name.as_str())
                .unwrap_or("object");
            format!("<{}>", name)
        }
        Value::Ptr(p) => format!("<ptr 0x{:x}>", p),
        Value::Func(f) => {
            let name = module
                .funcs
                .get(f as usize)
                .map(|f| f.name.as_str())
                .unwrap_or("?");
            format!("<fn {}>", name)
        }
    })
}

/// Element rendering inside containers: strings get quotes.
fn format_item(value: Value, gc: &Gc, module: &BpModule) -> Result<String, VmFault> {
    match value {
        Value::Str(r) => Ok(format!("\"{}\"", gc.str(r)?)),
        other => format_value(other, gc, module),
    }
}

/// Dispatch a builtin call. Arguments were copied into a scratch
/// buffer by the interpreter.
pub fn stdlib_call(
    id: u16,
    args: &[Value],
    ctx: &mut BuiltinCtx<'_>,
) -> Result<Value, VmFault> {
    let Some(builtin) = BuiltinId::from_u16(id) else {
        return Err(VmFault::UnknownBuiltin(id));
    };
    match builtin {
        BuiltinId::Print => {
            let mut line = String::new();
            for (i, value) in args.iter().enumerate() {
                if i > 0 {
                    line.push(' ');
                }
                line.push_str(&format_value(*value, ctx.gc, ctx.module)?);
            }
            line.push('\n');
            ctx.out
                .write_all(line.as_bytes())
                .map_err(|e| VmFault::Internal(format!("write failed: {}", e)))?;
            Ok(Value::Null)
        }
        BuiltinId::ToStr => {
            let s = format_value(arg(args, 0)?, ctx.gc, ctx.module)?;
            Ok(Value::Str(ctx.gc.alloc_str(s)))
        }
        BuiltinId::Exit => {
            *ctx.exit_code = int_arg(args, 0, "exit")? as i32;
            *ctx.exiting = true;
            Ok(Value::Null)
        }
        BuiltinId::Input => {
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map_err(|e| VmFault::Internal(format!("stdin read failed: {}", e)))?;
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(Value::Str(ctx.gc.alloc_str(line)))
        }
        BuiltinId::StrLen => {
            let s = str_arg(args, 0, ctx.gc, "str_len")?;
            Ok(Value::Int(s.chars().count() as i64))
        }
        BuiltinId::Substr => {
            let start = int_arg(args, 1, "substr")?;
            let len = int_arg(args, 2, "substr")?;
            let s = str_arg(args, 0, ctx.gc, "substr")?;
            let chars: Vec<char> = s.chars().collect();
            let start = start.clamp(0, chars.len() as i64) as usize;
            let end = (start + len.max(0) as usize).min(chars.len());
            let sub: String = chars[start..end].iter().collect();
            Ok(Value::Str(ctx.gc.alloc_str(sub)))
        }
        BuiltinId::StrFind => {
            let hay = str_arg(args, 0, ctx.gc, "str_find")?;
            let needle = str_arg(args, 1, ctx.gc, "str_find")?;
            let found = hay.find(needle).map(|byte_pos| {
                hay[..byte_pos].chars().count() as i64
            });
            Ok(Value::Int(found.unwrap_or(-1)))
        }
        BuiltinId::StrSplit => {
            let hay = str_arg(args, 0, ctx.gc, "str_split")?.to_string();
            let sep = str_arg(args, 1, ctx.gc, "str_split")?.to_string();
            let parts: Vec<String> = if sep.is_empty() {
                hay.chars().map(|c| c.to_string()).collect()
            } else {
                hay.split(&sep).map(|s| s.to_string()).collect()
            };
            let items: Vec<Value> = parts
                .into_iter()
                .map(|p| Value::Str(ctx.gc.alloc_str(p)))
                .collect();
            Ok(Value::Array(ctx.gc.alloc(HeapObj::Array(items))))
        }
        BuiltinId::StrUpper => {
            let s = str_arg(args, 0, ctx.gc, "str_upper")?.to_uppercase();
            Ok(Value::Str(ctx.gc.alloc_str(s)))
        }
        BuiltinId::StrLower => {
            let s = str_arg(args, 0, ctx.gc, "str_lower")?.to_lowercase();
            Ok(Value::Str(ctx.gc.alloc_str(s)))
        }
        BuiltinId::ParseInt => {
            let s = str_arg(args, 0, ctx.gc, "parse_int")?;
            let v = s
                .trim()
                .parse::<i64>()
                .map_err(|_| VmFault::Ffi(format!("parse_int: invalid integer '{}'", s)))?;
            Ok(Value::Int(v))
        }
        BuiltinId::ParseFloat => {
            let s = str_arg(args, 0, ctx.gc, "parse_float")?;
            let v = s
                .trim()
                .parse::<f64>()
                .map_err(|_| VmFault::Ffi(format!("parse_float: invalid float '{}'", s)))?;
            Ok(Value::Float(v))
        }
        BuiltinId::Chr => {
            let code = int_arg(args, 0, "chr")?;
            let c = u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| VmFault::Ffi(format!("chr: invalid code point {}", code)))?;
            Ok(Value::Str(ctx.gc.alloc_str(c.to_string())))
        }
        BuiltinId::Ord => {
            let s = str_arg(args, 0, ctx.gc, "ord")?;
            let c = s
                .chars()
                .next()
                .ok_or_else(|| VmFault::Ffi("ord: empty string".to_string()))?;
            Ok(Value::Int(c as i64))
        }
        BuiltinId::StrContains => {
            let hay = str_arg(args, 0, ctx.gc, "str_contains")?;
            let needle = str_arg(args, 1, ctx.gc, "str_contains")?;
            Ok(Value::Bool(hay.contains(needle)))
        }
        BuiltinId::StrReplace => {
            let hay = str_arg(args, 0, ctx.gc, "str_replace")?.to_string();
            let from = str_arg(args, 1, ctx.gc, "str_replace")?.to_string();
            let to = str_arg(args, 2, ctx.gc, "str_replace")?.to_string();
            let replaced = if from.is_empty() {
                hay
            } else {
                hay.replace(&from, &to)
            };
            Ok(Value::Str(ctx.gc.alloc_str(replaced)))
        }
        BuiltinId::StrTrim => {
            let s = str_arg(args, 0, ctx.gc, "str_trim")?.trim().to_string();
            Ok(Value::Str(ctx.gc.alloc_str(s)))
        }
        BuiltinId::ArrayLen => {
            let r = array_arg(args, 0, "array_len")?;
            Ok(Value::Int(ctx.gc.array(r)?.len() as i64))
        }
        BuiltinId::ArrayPush => {
            let r = array_arg(args, 0, "array_push")?;
            let elem = arg(args, 1)?;
            ctx.gc.array_mut(r)?.push(elem);
            Ok(Value::Null)
        }
        BuiltinId::ArrayPop => {
            let r = array_arg(args, 0, "array_pop")?;
            let items = ctx.gc.array_mut(r)?;
            items
                .pop()
                .ok_or(VmFault::IndexOutOfBounds { index: -1, len: 0 })
        }
        BuiltinId::ArrayContains => {
            let r = array_arg(args, 0, "array_contains")?;
            let needle = arg(args, 1)?;
            let items = ctx.gc.array(r)?.clone();
            for item in items {
                if ctx.gc.values_equal(item, needle)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        BuiltinId::ArraySort => {
            let r = array_arg(args, 0, "array_sort")?;
            let mut items = ctx.gc.array(r)?.clone();
            let mut key_err = None;
            items.sort_by(|a, b| match (a, b) {
                (Value::Int(x), Value::Int(y)) => x.cmp(y),
                (Value::Float(x), Value::Float(y)) => {
                    x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal)
                }
                (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
                (Value::Str(x), Value::Str(y)) => {
                    match (ctx.gc.str(*x), ctx.gc.str(*y)) {
                        (Ok(sx), Ok(sy)) => sx.cmp(sy),
                        _ => std::cmp::Ordering::Equal,
                    }
                }
                _ => {
                    key_err = Some(VmFault::TagMismatch {
                        op: "array_sort",
                        expected: "int, float, bool or str elements",
                        got: a.tag(),
                    });
                    std::cmp::Ordering::Equal
                }
            });
            if let Some(err) = key_err {
                return Err(err);
            }
            *ctx.gc.array_mut(r)? = items;
            Ok(Value::Null)
        }
        BuiltinId::ArrayJoin => {
            let r = array_arg(args, 0, "array_join")?;
            let sep = str_arg(args, 1, ctx.gc, "array_join")?.to_string();
            let items = ctx.gc.array(r)?.clone();
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                parts.push(format_value(item, ctx.gc, ctx.module)?);
            }
            Ok(Value::Str(ctx.gc.alloc_str(parts.join(&sep))))
        }
        BuiltinId::ArrayRemove => {
            let r = array_arg(args, 0, "array_remove")?;
            let index = int_arg(args, 1, "array_remove")?;
            let items = ctx.gc.array_mut(r)?;
            if index < 0 || index as usize >= items.len() {
                return Err(VmFault::IndexOutOfBounds { index, len: items.len() });
            }
            items.remove(index as usize);
            Ok(Value::Null)
        }
        BuiltinId::Keys => {
            let r = map_arg(args, 0, "keys")?;
            let keys = sorted_keys(ctx.gc.map(r)?);
            let items: Vec<Value> = keys.iter().map(|k| key_to_value(k, ctx.gc)).collect();
            Ok(Value::Array(ctx.gc.alloc(HeapObj::Array(items))))
        }
        BuiltinId::Values => {
            let r = map_arg(args, 0, "values")?;
            let map = ctx.gc.map(r)?;
            let keys = sorted_keys(map);
            let items: Vec<Value> = keys.iter().map(|k| map[k]).collect();
            Ok(Value::Array(ctx.gc.alloc(HeapObj::Array(items))))
        }
        BuiltinId::MapHasKey => {
            let r = map_arg(args, 0, "map_has_key")?;
            let key = MapKey::from_value(arg(args, 1)?, ctx.gc)?;
            Ok(Value::Bool(ctx.gc.map(r)?.contains_key(&key)))
        }
        BuiltinId::MapRemove => {
            let r = map_arg(args, 0, "map_remove")?;
            let key = MapKey::from_value(arg(args, 1)?, ctx.gc)?;
            ctx.gc.map_mut(r)?.remove(&key);
            Ok(Value::Null)
        }
        BuiltinId::MapLen => {
            let r = map_arg(args, 0, "map_len")?;
            Ok(Value::Int(ctx.gc.map(r)?.len() as i64))
        }
        BuiltinId::Abs => match arg(args, 0)? {
            Value::Int(v) => Ok(Value::Int(v.wrapping_abs())),
            Value::Float(v) => Ok(Value::Float(v.abs())),
            other => Err(VmFault::TagMismatch { op: "abs", expected: "int or float", got: other.tag() }),
        },
        BuiltinId::Min | BuiltinId::Max => {
            let want_min = builtin == BuiltinId::Min;
            match (arg(args, 0)?, arg(args, 1)?) {
                (Value::Int(a), Value::Int(b)) => {
                    Ok(Value::Int(if want_min { a.min(b) } else { a.max(b) }))
                }
                (Value::Float(a), Value::Float(b)) => {
                    Ok(Value::Float(if want_min { a.min(b) } else { a.max(b) }))
                }
                (a, _) => Err(VmFault::TagMismatch {
                    op: "min/max",
                    expected: "matching numeric types",
                    got: a.tag(),
                }),
            }
        }
        BuiltinId::Pow => {
            let base = float_arg(args, 0, "pow")?;
            let exp = float_arg(args, 1, "pow")?;
            Ok(Value::Float(base.powf(exp)))
        }
        BuiltinId::Sqrt => Ok(Value::Float(float_arg(args, 0, "sqrt")?.sqrt())),
        BuiltinId::Floor => Ok(Value::Float(float_arg(args, 0, "floor")?.floor())),
        BuiltinId::Ceil => Ok(Value::Float(float_arg(args, 0, "ceil")?.ceil())),
        BuiltinId::ToInt => match arg(args, 0)? {
            Value::Int(v) => Ok(Value::Int(v)),
            Value::Float(v) => Ok(Value::Int(v as i64)),
            Value::Bool(b) => Ok(Value::Int(b as i64)),
            Value::Str(r) => {
                let s = ctx.gc.str(r)?;
                s.trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| VmFault::Ffi(format!("to_int: invalid integer '{}'", s)))
            }
            other => Err(VmFault::TagMismatch { op: "to_int", expected: "int, float, bool or str", got: other.tag() }),
        },
        BuiltinId::ToFloat => match arg(args, 0)? {
            Value::Int(v) => Ok(Value::Float(v as f64)),
            Value::Float(v) => Ok(Value::Float(v)),
            Value::Str(r) => {
                let s = ctx.gc.str(r)?;
                s.trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| VmFault::Ffi(format!("to_float: invalid float '{}'", s)))
            }
            other => Err(VmFault::TagMismatch { op: "to_float", expected: "int, float or str", got: other.tag() }),
        },
        BuiltinId::TimeNs => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            Ok(Value::Int(now.as_nanos() as i64))
        }
        BuiltinId::ClockMs => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            Ok(Value::Int(now.as_millis() as i64))
        }
        BuiltinId::RandInt => {
            let lo = int_arg(args, 0, "rand_int")?;
            let hi = int_arg(args, 1, "rand_int")?;
            Ok(Value::Int(ctx.rng.next_range(lo, hi)))
        }
        BuiltinId::RandFloat => Ok(Value::Float(ctx.rng.next_f64())),
        BuiltinId::RandSeed => {
            ctx.rng.reseed(int_arg(args, 0, "rand_seed")? as u64);
            Ok(Value::Null)
        }
        BuiltinId::TypeOf => {
            let name = arg(args, 0)?.tag();
            Ok(Value::Str(ctx.gc.alloc_str(name)))
        }
        BuiltinId::ReadFile => {
            let path = str_arg(args, 0, ctx.gc, "read_file")?.to_string();
            let content = std::fs::read_to_string(&path)
                .map_err(|e| VmFault::Ffi(format!("read_file {}: {}", path, e)))?;
            Ok(Value::Str(ctx.gc.alloc_str(content)))
        }
        BuiltinId::WriteFile => {
            let path = str_arg(args, 0, ctx.gc, "write_file")?.to_string();
            let content = str_arg(args, 1, ctx.gc, "write_file")?.to_string();
            std::fs::write(&path, content)
                .map_err(|e| VmFault::Ffi(format!("write_file {}: {}", path, e)))?;
            Ok(Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_parts() -> (Gc, BpModule, Vec<u8>, i32, bool, Rng) {
        (Gc::new(), BpModule::default(), Vec::new(), 0, false, Rng::new(1))
    }

    macro_rules! with_ctx {
        ($parts:expr, $ctx:ident, $body:expr) => {{
            let (gc, module, out, exit_code, exiting, rng) = $parts;
            let mut $ctx = BuiltinCtx {
                gc,
                module,
                out,
                exit_code,
                exiting,
                rng,
            };
            $body
        }};
    }

    #[test]
    fn test_print_is_variadic_and_space_joined() {
        let (mut gc, module, mut out, mut code, mut exiting, mut rng) = ctx_parts();
        let s = gc.alloc_str("x");
        with_ctx!(
            (&mut gc, &module, &mut out, &mut code, &mut exiting, &mut rng),
            ctx,
            stdlib_call(0, &[Value::Int(1), Value::Str(s)], &mut ctx).unwrap()
        );
        assert_eq!(String::from_utf8(out).unwrap(), "1 x\n");
    }

    #[test]
    fn test_exit_sets_flags() {
        let (mut gc, module, mut out, mut code, mut exiting, mut rng) = ctx_parts();
        with_ctx!(
            (&mut gc, &module, &mut out, &mut code, &mut exiting, &mut rng),
            ctx,
            stdlib_call(2, &[Value::Int(3)], &mut ctx).unwrap()
        );
        assert!(exiting);
        assert_eq!(code, 3);
    }

    #[test]
    fn test_array_push_and_len() {
        let (mut gc, module, mut out, mut code, mut exiting, mut rng) = ctx_parts();
        let arr = gc.alloc(HeapObj::Array(vec![Value::Int(1)]));
        with_ctx!(
            (&mut gc, &module, &mut out, &mut code, &mut exiting, &mut rng),
            ctx,
            {
                stdlib_call(21, &[Value::Array(arr), Value::Int(2)], &mut ctx).unwrap();
                let len = stdlib_call(20, &[Value::Array(arr)], &mut ctx).unwrap();
                assert_eq!(len, Value::Int(2));
            }
        );
    }

    #[test]
    fn test_float_formatting() {
        assert_eq!(format_float(3.0), "3.0");
        assert_eq!(format_float(3.5), "3.5");
        assert_eq!(format_float(-0.25), "-0.25");
    }

    #[test]
    fn test_keys_are_sorted() {
        let (mut gc, module, mut out, mut code, mut exiting, mut rng) = ctx_parts();
        let mut inner = HashMap::new();
        inner.insert(MapKey::Str("b".to_string()), Value::Int(2));
        inner.insert(MapKey::Str("a".to_string()), Value::Int(1));
        let m = gc.alloc(HeapObj::Map(inner));
        with_ctx!(
            (&mut gc, &module, &mut out, &mut code, &mut exiting, &mut rng),
            ctx,
            {
                let keys = stdlib_call(30, &[Value::Map(m)], &mut ctx).unwrap();
                let Value::Array(r) = keys else { panic!("expected array") };
                let items = ctx.gc.array(r).unwrap().clone();
                assert_eq!(ctx.gc.str(items[0].heap_ref().unwrap()).unwrap(), "a");
                assert_eq!(ctx.gc.str(items[1].heap_ref().unwrap()).unwrap(), "b");
            }
        );
    }

    #[test]
    fn test_unknown_builtin_id_faults() {
        let (mut gc, module, mut out, mut code, mut exiting, mut rng) = ctx_parts();
        with_ctx!(
            (&mut gc, &module, &mut out, &mut code, &mut exiting, &mut rng),
            ctx,
            assert!(matches!(
                stdlib_call(999, &[], &mut ctx),
                Err(VmFault::UnknownBuiltin(999))
            ))
        );
    }

    #[test]
    fn test_signature_table_has_unique_names_and_ids() {
        let mut names = std::collections::HashSet::new();
        let mut ids = std::collections::HashSet::new();
        for sig in BUILTIN_SIGS {
            assert!(names.insert(sig.id.bp_name()), "dup name {}", sig.id.bp_name());
            assert!(ids.insert(sig.id as u16), "dup id {}", sig.id as u16);
        }
        assert!(BUILTINS_BY_NAME.contains_key("print"));
        assert!(BUILTINS_BY_NAME.get("print").unwrap().variadic);
    }
}
