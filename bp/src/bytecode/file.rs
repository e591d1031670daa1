//! Bytecode file format for BP (`.bpc` files).
//!
//! ```text
//! +--------------------+
//! | Magic (4 bytes)    |  "BPC0"
//! +--------------------+
//! | Version (4 bytes)  |  u32 format version
//! +--------------------+
//! | Entry (4 bytes)    |  u32 index of main
//! +--------------------+
//! | String pool        |  count u32, then (len u32, bytes) each
//! +--------------------+
//! | Functions          |  count u32, then per function:
//! |                    |  name_len u32, name, arity u16, locals u16,
//! |                    |  str_ref_count u32, str_refs u32[],
//! |                    |  code_len u32, code
//! +--------------------+
//! | Extended sections  |  each with its own u32 byte length:
//! |                    |  formats (tag u8, reg_count u16, int-return u8
//! |                    |  per function), class table, extern table,
//! |                    |  global count
//! +--------------------+
//! ```
//!
//! All integers are little-endian. Loading validates linkage before
//! returning the module.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use super::{BpFunction, BpModule, ClassType, CodeFormat, ExternFunc, FfiType, LinkError};

/// Magic bytes identifying a BP bytecode file
pub const MAGIC: &[u8; 4] = b"BPC0";

/// Current bytecode format version
pub const VERSION: u32 = 1;

/// Bytecode format error
#[derive(Debug)]
pub enum BytecodeError {
    /// I/O error during file operations
    IoError(std::io::Error),
    /// Invalid magic bytes - not a valid bytecode file
    InvalidMagic,
    /// Unsupported format version
    UnsupportedVersion(u32),
    /// The file ended before the declared content did
    Truncated,
    /// Structurally invalid content
    Malformed(String),
    /// The module loaded but refers to things that are not there
    Link(LinkError),
}

impl std::fmt::Display for BytecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BytecodeError::IoError(e) => write!(f, "I/O error: {}", e),
            BytecodeError::InvalidMagic => {
                write!(f, "Invalid magic bytes - not a valid .bpc file")
            }
            BytecodeError::UnsupportedVersion(v) => {
                write!(f, "Unsupported bytecode version: {} (current: {})", v, VERSION)
            }
            BytecodeError::Truncated => write!(f, "Truncated bytecode file"),
            BytecodeError::Malformed(msg) => write!(f, "Malformed bytecode: {}", msg),
            BytecodeError::Link(e) => write!(f, "Link error: {}", e),
        }
    }
}

impl std::error::Error for BytecodeError {}

impl From<std::io::Error> for BytecodeError {
    fn from(e: std::io::Error) -> Self {
        BytecodeError::IoError(e)
    }
}

impl From<LinkError> for BytecodeError {
    fn from(e: LinkError) -> Self {
        BytecodeError::Link(e)
    }
}

/// Save a module to a bytecode file.
pub fn save<P: AsRef<Path>>(module: &BpModule, path: P) -> Result<(), BytecodeError> {
    let bytes = save_to_bytes(module);
    let mut file = File::create(path)?;
    file.write_all(&bytes)?;
    Ok(())
}

/// Load a module from a bytecode file, validating linkage.
pub fn load<P: AsRef<Path>>(path: P) -> Result<BpModule, BytecodeError> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    load_from_bytes(&data)
}

struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Append `content` prefixed with its byte length.
    fn section(&mut self, content: ByteWriter) {
        self.u32(content.buf.len() as u32);
        self.buf.extend_from_slice(&content.buf);
    }
}

/// Serialize a module to bytes (for in-memory use).
pub fn save_to_bytes(module: &BpModule) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.buf.extend_from_slice(MAGIC);
    w.u32(VERSION);
    w.u32(module.entry);

    w.u32(module.strings.len() as u32);
    for s in &module.strings {
        w.str(s);
    }

    w.u32(module.funcs.len() as u32);
    for func in &module.funcs {
        w.str(&func.name);
        w.u16(func.arity);
        w.u16(func.locals);
        w.u32(func.str_refs.len() as u32);
        for &r in &func.str_refs {
            w.u32(r);
        }
        w.u32(func.code.len() as u32);
        w.buf.extend_from_slice(&func.code);
    }

    // Format tags, register counts, return-kind flags.
    let mut fmt = ByteWriter::new();
    for func in &module.funcs {
        fmt.u8(match func.format {
            CodeFormat::Stack => 0,
            CodeFormat::Register => 1,
        });
        fmt.u16(func.reg_count);
        fmt.u8(func.int_return as u8);
    }
    w.section(fmt);

    // Class table.
    let mut cls = ByteWriter::new();
    cls.u32(module.class_types.len() as u32);
    for class in &module.class_types {
        cls.str(&class.name);
        match &class.parent {
            Some(p) => {
                cls.u8(1);
                cls.str(p);
            }
            None => cls.u8(0),
        }
        cls.u32(class.fields.len() as u32);
        for field in &class.fields {
            cls.str(field);
        }
        cls.u32(class.methods.len() as u32);
        for (name, fidx) in &class.methods {
            cls.str(name);
            cls.u32(*fidx);
        }
    }
    w.section(cls);

    // Extern table.
    let mut ext = ByteWriter::new();
    ext.u32(module.extern_funcs.len() as u32);
    for e in &module.extern_funcs {
        ext.str(&e.bp_name);
        ext.str(&e.c_name);
        ext.str(&e.library);
        ext.u32(e.params.len() as u32);
        for p in &e.params {
            ext.u8(*p as u8);
        }
        ext.u8(e.ret as u8);
        ext.u8(e.variadic as u8);
    }
    w.section(ext);

    // Globals.
    let mut glb = ByteWriter::new();
    glb.u32(module.global_count);
    w.section(glb);

    w.buf
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], BytecodeError> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(BytecodeError::Truncated)?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BytecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BytecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, BytecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str(&mut self) -> Result<String, BytecodeError> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| BytecodeError::Malformed("non-UTF-8 string in pool".to_string()))
    }

    /// Enter a length-prefixed section; returns a reader over it.
    fn section(&mut self) -> Result<ByteReader<'a>, BytecodeError> {
        let len = self.u32()? as usize;
        Ok(ByteReader::new(self.bytes(len)?))
    }
}

/// Load a module from raw bytes, validating linkage.
pub fn load_from_bytes(data: &[u8]) -> Result<BpModule, BytecodeError> {
    let mut r = ByteReader::new(data);
    if r.bytes(4)? != MAGIC {
        return Err(BytecodeError::InvalidMagic);
    }
    let version = r.u32()?;
    if version > VERSION {
        return Err(BytecodeError::UnsupportedVersion(version));
    }
    let entry = r.u32()?;

    let string_count = r.u32()? as usize;
    let mut strings = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        strings.push(r.str()?);
    }

    let func_count = r.u32()? as usize;
    let mut funcs = Vec::with_capacity(func_count);
    for _ in 0..func_count {
        let name = r.str()?;
        let arity = r.u16()?;
        let locals = r.u16()?;
        let ref_count = r.u32()? as usize;
        let mut str_refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            str_refs.push(r.u32()?);
        }
        let code_len = r.u32()? as usize;
        let code = r.bytes(code_len)?.to_vec();
        funcs.push(BpFunction {
            name,
            arity,
            locals,
            reg_count: 0,
            format: CodeFormat::Stack,
                int_return: false,
            str_refs,
            code,
        });
    }

    let mut fmt = r.section()?;
    for func in funcs.iter_mut() {
        func.format = match fmt.u8()? {
            0 => CodeFormat::Stack,
            1 => CodeFormat::Register,
            other => {
                return Err(BytecodeError::Malformed(format!(
                    "unknown format tag {}",
                    other
                )))
            }
        };
        func.reg_count = fmt.u16()?;
        func.int_return = fmt.u8()? != 0;
    }

    let mut cls = r.section()?;
    let class_count = cls.u32()? as usize;
    let mut class_types = Vec::with_capacity(class_count);
    for _ in 0..class_count {
        let name = cls.str()?;
        let parent = if cls.u8()? != 0 {
            Some(cls.str()?)
        } else {
            None
        };
        let field_count = cls.u32()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(cls.str()?);
        }
        let method_count = cls.u32()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let mname = cls.str()?;
            let fidx = cls.u32()?;
            methods.push((mname, fidx));
        }
        class_types.push(ClassType {
            name,
            parent,
            fields,
            methods,
        });
    }

    let mut ext = r.section()?;
    let extern_count = ext.u32()? as usize;
    let mut extern_funcs = Vec::with_capacity(extern_count);
    for _ in 0..extern_count {
        let bp_name = ext.str()?;
        let c_name = ext.str()?;
        let library = ext.str()?;
        let param_count = ext.u32()? as usize;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            let code = ext.u8()?;
            params.push(FfiType::from_u8(code).ok_or_else(|| {
                BytecodeError::Malformed(format!("unknown ffi type code {}", code))
            })?);
        }
        let ret_code = ext.u8()?;
        let ret = FfiType::from_u8(ret_code).ok_or_else(|| {
            BytecodeError::Malformed(format!("unknown ffi type code {}", ret_code))
        })?;
        let variadic = ext.u8()? != 0;
        extern_funcs.push(ExternFunc {
            bp_name,
            c_name,
            library,
            params,
            ret,
            variadic,
        });
    }

    let mut glb = r.section()?;
    let global_count = glb.u32()?;

    let module = BpModule {
        funcs,
        strings,
        entry,
        global_count,
        class_types,
        extern_funcs,
    };
    module.validate()?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::{CodeWriter, SOp};

    fn sample_module() -> BpModule {
        let mut w = CodeWriter::new();
        w.sop(SOp::ConstStr);
        w.u32(0);
        w.sop(SOp::Ret);
        BpModule {
            funcs: vec![BpFunction {
                name: "main".to_string(),
                arity: 0,
                locals: 0,
                reg_count: 0,
                format: CodeFormat::Stack,
                int_return: false,
                str_refs: vec![0],
                code: w.code,
            }],
            strings: vec!["hello".to_string()],
            entry: 0,
            global_count: 2,
            class_types: vec![ClassType {
                name: "Dog".to_string(),
                parent: Some("Animal".to_string()),
                fields: vec!["name".to_string()],
                methods: vec![("speak".to_string(), 0)],
            }],
            extern_funcs: vec![ExternFunc {
                bp_name: "puts".to_string(),
                c_name: "puts".to_string(),
                library: "libc.so.6".to_string(),
                params: vec![FfiType::Str],
                ret: FfiType::Int,
                variadic: false,
            }],
        }
    }

    #[test]
    fn test_roundtrip_bytes() {
        let module = sample_module();
        let bytes = save_to_bytes(&module);
        let loaded = load_from_bytes(&bytes).unwrap();
        assert_eq!(module, loaded);
    }

    #[test]
    fn test_magic_and_version() {
        let bytes = save_to_bytes(&sample_module());
        assert_eq!(&bytes[0..4], MAGIC);
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(version, VERSION);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = save_to_bytes(&sample_module());
        bytes[0] = b'X';
        assert!(matches!(
            load_from_bytes(&bytes),
            Err(BytecodeError::InvalidMagic)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = save_to_bytes(&sample_module());
        bytes[4..8].copy_from_slice(&999u32.to_le_bytes());
        assert!(matches!(
            load_from_bytes(&bytes),
            Err(BytecodeError::UnsupportedVersion(999))
        ));
    }

    #[test]
    fn test_truncated_file() {
        let bytes = save_to_bytes(&sample_module());
        assert!(matches!(
            load_from_bytes(&bytes[..bytes.len() - 3]),
            Err(BytecodeError::Truncated)
        ));
    }

    #[test]
    fn test_roundtrip_file() {
        let module = sample_module();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bpc");
        save(&module, &path).unwrap();
        assert_eq!(load(&path).unwrap(), module);
    }

    #[test]
    fn test_bad_link_rejected_on_load() {
        let mut module = sample_module();
        module.entry = 7;
        let bytes = save_to_bytes(&module);
        assert!(matches!(
            load_from_bytes(&bytes),
            Err(BytecodeError::Link(LinkError::BadEntry(7)))
        ));
    }
}
