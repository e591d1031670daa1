//! FFI call support for `extern` declarations.
//!
//! Libraries load lazily on first call and stay open for the life of
//! the resolver; resolved symbol addresses are cached per extern-table
//! index. Calls are marshalled by the declared type codes: integer-class
//! values (int, bool, ptr, str-as-pointer) travel in the integer
//! argument registers, float signatures in the SSE registers. Mixing
//! the two classes in one signature is not supported and faults with a
//! diagnostic instead of corrupting the call.

use std::collections::HashMap;
use std::ffi::{c_void, CString};

use crate::bytecode::{ExternFunc, FfiType};
use crate::vm::error::VmFault;
use crate::vm::gc::Gc;
use crate::vm::value::Value;

#[derive(Default)]
pub struct FfiResolver {
    libs: HashMap<String, libloading::Library>,
    symbols: Vec<Option<*mut c_void>>,
}

impl std::fmt::Debug for FfiResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FfiResolver({} libraries)", self.libs.len())
    }
}

/// One marshalled argument, with any backing C string kept alive by
/// the caller until after the call.
enum CArg {
    Int(i64),
    Float(f64),
}

impl FfiResolver {
    pub fn new(extern_count: usize) -> Self {
        Self {
            libs: HashMap::new(),
            symbols: vec![None; extern_count],
        }
    }

    /// Resolve (and cache) the native address of extern `index`.
    fn resolve(&mut self, index: usize, decl: &ExternFunc) -> Result<*mut c_void, VmFault> {
        if let Some(Some(sym)) = self.symbols.get(index) {
            return Ok(*sym);
        }
        if !self.libs.contains_key(&decl.library) {
            let lib = unsafe { libloading::Library::new(&decl.library) }.map_err(|e| {
                VmFault::Ffi(format!("cannot load library '{}': {}", decl.library, e))
            })?;
            self.libs.insert(decl.library.clone(), lib);
        }
        let lib = &self.libs[&decl.library];
        let name = CString::new(decl.c_name.as_str())
            .map_err(|_| VmFault::Ffi(format!("invalid symbol name '{}'", decl.c_name)))?;
        let sym: libloading::Symbol<'_, *mut c_void> =
            unsafe { lib.get(name.as_bytes_with_nul()) }.map_err(|e| {
                VmFault::Ffi(format!(
                    "cannot resolve symbol '{}' in '{}': {}",
                    decl.c_name, decl.library, e
                ))
            })?;
        let addr = *sym;
        if let Some(slot) = self.symbols.get_mut(index) {
            *slot = Some(addr);
        }
        Ok(addr)
    }

    /// Invoke extern `index` with the given argument values.
    pub fn call(
        &mut self,
        index: usize,
        decl: &ExternFunc,
        args: &[Value],
        gc: &mut Gc,
    ) -> Result<Value, VmFault> {
        if !decl.variadic && args.len() != decl.params.len() {
            return Err(VmFault::Ffi(format!(
                "extern '{}' takes {} arguments, got {}",
                decl.bp_name,
                decl.params.len(),
                args.len()
            )));
        }
        let addr = self.resolve(index, decl)?;

        // Marshal arguments; C strings must outlive the call.
        let mut cstrings: Vec<CString> = Vec::new();
        let mut marshalled: Vec<CArg> = Vec::with_capacity(args.len());
        for (i, value) in args.iter().enumerate() {
            let code = decl.params.get(i).copied().unwrap_or_else(|| {
                // Variadic tail: classify from the runtime tag.
                match value {
                    Value::Float(_) => FfiType::Float,
                    Value::Str(_) => FfiType::Str,
                    Value::Ptr(_) => FfiType::Ptr,
                    _ => FfiType::Int,
                }
            });
            let arg = match (code, value) {
                (FfiType::Int, Value::Int(v)) => CArg::Int(*v),
                (FfiType::Int, Value::Bool(b)) => CArg::Int(*b as i64),
                (FfiType::Float, Value::Float(v)) => CArg::Float(*v),
                (FfiType::Ptr, Value::Ptr(p)) => CArg::Int(*p as i64),
                (FfiType::Ptr, Value::Null) => CArg::Int(0),
                (FfiType::Str, Value::Str(r)) => {
                    let s = gc.str(*r)?;
                    let c = CString::new(s).map_err(|_| {
                        VmFault::Ffi(format!(
                            "string argument {} contains a NUL byte",
                            i + 1
                        ))
                    })?;
                    let ptr = c.as_ptr() as i64;
                    cstrings.push(c);
                    CArg::Int(ptr)
                }
                (code, value) => {
                    return Err(VmFault::Ffi(format!(
                        "extern '{}': argument {} ({}) does not match type code {:?}",
                        decl.bp_name,
                        i + 1,
                        value.tag(),
                        code
                    )))
                }
            };
            marshalled.push(arg);
        }

        let all_int = marshalled.iter().all(|a| matches!(a, CArg::Int(_)));
        let all_float = marshalled.iter().all(|a| matches!(a, CArg::Float(_)));
        let float_ret = decl.ret == FfiType::Float;

        let raw: i64;
        let raw_f: f64;
        if all_int {
            let ints: Vec<i64> = marshalled
                .iter()
                .map(|a| match a {
                    CArg::Int(v) => *v,
                    CArg::Float(_) => unreachable!(),
                })
                .collect();
            if float_ret {
                raw_f = unsafe { call_int_args_float_ret(addr, &ints)? };
                raw = 0;
            } else {
                raw = unsafe { call_int_args(addr, &ints)? };
                raw_f = 0.0;
            }
        } else if all_float {
            let floats: Vec<f64> = marshalled
                .iter()
                .map(|a| match a {
                    CArg::Float(v) => *v,
                    CArg::Int(_) => unreachable!(),
                })
                .collect();
            if float_ret {
                raw_f = unsafe { call_float_args_float_ret(addr, &floats)? };
                raw = 0;
            } else {
                raw = unsafe { call_float_args(addr, &floats)? };
                raw_f = 0.0;
            }
        } else {
            return Err(VmFault::Ffi(format!(
                "extern '{}': mixed integer/float signatures are not supported",
                decl.bp_name
            )));
        }
        drop(cstrings);

        Ok(match decl.ret {
            FfiType::Void => Value::Null,
            FfiType::Int => Value::Int(raw),
            FfiType::Float => Value::Float(raw_f),
            FfiType::Ptr => Value::Ptr(raw as usize),
            FfiType::Str => {
                if raw == 0 {
                    Value::Null
                } else {
                    let cstr = unsafe { std::ffi::CStr::from_ptr(raw as *const i8) };
                    let s = cstr.to_string_lossy().into_owned();
                    Value::Str(gc.alloc_str(s))
                }
            }
        })
    }
}

macro_rules! call_shapes {
    ($addr:expr, $args:expr, $ret:ty, $($n:literal => ($($idx:tt),*)),*) => {{
        let a = $args;
        match a.len() {
            $($n => {
                let f: unsafe extern "C" fn($(call_shapes!(@ty $idx)),*) -> $ret =
                    std::mem::transmute($addr);
                Ok(f($(a[$idx]),*))
            })*
            n => Err(VmFault::Ffi(format!(
                "extern calls support at most 6 arguments, got {}",
                n
            ))),
        }
    }};
    (@ty $idx:tt) => { _ };
}

/// Integer-class arguments, integer-class return.
unsafe fn call_int_args(addr: *mut c_void, args: &[i64]) -> Result<i64, VmFault> {
    call_shapes!(addr, args, i64,
        0 => (), 1 => (0), 2 => (0, 1), 3 => (0, 1, 2),
        4 => (0, 1, 2, 3), 5 => (0, 1, 2, 3, 4), 6 => (0, 1, 2, 3, 4, 5))
}

/// Integer-class arguments, float return.
unsafe fn call_int_args_float_ret(addr: *mut c_void, args: &[i64]) -> Result<f64, VmFault> {
    call_shapes!(addr, args, f64,
        0 => (), 1 => (0), 2 => (0, 1), 3 => (0, 1, 2),
        4 => (0, 1, 2, 3), 5 => (0, 1, 2, 3, 4), 6 => (0, 1, 2, 3, 4, 5))
}

/// Float arguments, integer-class return.
unsafe fn call_float_args(addr: *mut c_void, args: &[f64]) -> Result<i64, VmFault> {
    call_shapes!(addr, args, i64,
        0 => (), 1 => (0), 2 => (0, 1), 3 => (0, 1, 2), 4 => (0, 1, 2, 3))
}

/// Float arguments, float return.
unsafe fn call_float_args_float_ret(addr: *mut c_void, args: &[f64]) -> Result<f64, VmFault> {
    call_shapes!(addr, args, f64,
        0 => (), 1 => (0), 2 => (0, 1), 3 => (0, 1, 2), 4 => (0, 1, 2, 3))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bytecode::ExternFunc;

    fn libm_decl(name: &str, params: Vec<FfiType>, ret: FfiType) -> ExternFunc {
        ExternFunc {
            bp_name: name.to_string(),
            c_name: name.to_string(),
            library: "libm.so.6".to_string(),
            params,
            ret,
            variadic: false,
        }
    }

    #[test]
    fn test_float_call_through_libm() {
        let decl = libm_decl("sqrt", vec![FfiType::Float], FfiType::Float);
        let mut resolver = FfiResolver::new(1);
        let mut gc = Gc::new();
        let result = resolver
            .call(0, &decl, &[Value::Float(9.0)], &mut gc)
            .unwrap();
        assert_eq!(result, Value::Float(3.0));
    }

    #[test]
    fn test_int_call_through_libc() {
        let decl = ExternFunc {
            bp_name: "labs".to_string(),
            c_name: "labs".to_string(),
            library: "libc.so.6".to_string(),
            params: vec![FfiType::Int],
            ret: FfiType::Int,
            variadic: false,
        };
        let mut resolver = FfiResolver::new(1);
        let mut gc = Gc::new();
        let result = resolver.call(0, &decl, &[Value::Int(-5)], &mut gc).unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn test_missing_symbol_is_a_fault() {
        let decl = libm_decl("definitely_not_a_symbol", vec![], FfiType::Void);
        let mut resolver = FfiResolver::new(1);
        let mut gc = Gc::new();
        assert!(matches!(
            resolver.call(0, &decl, &[], &mut gc),
            Err(VmFault::Ffi(_))
        ));
    }

    #[test]
    fn test_arity_mismatch_is_a_fault() {
        let decl = libm_decl("sqrt", vec![FfiType::Float], FfiType::Float);
        let mut resolver = FfiResolver::new(1);
        let mut gc = Gc::new();
        assert!(matches!(
            resolver.call(0, &decl, &[], &mut gc),
            Err(VmFault::Ffi(_))
        ));
    }
}
