//! Mark-sweep heap.
//!
//! Objects live in a slot table indexed by `HeapRef`; freed slots go on
//! a free list and are reused. Collection is stop-the-world and runs
//! only at instruction boundaries, when the allocated-byte counter
//! crosses the watermark. After a sweep the watermark doubles, with a
//! 1 MiB floor.

use std::collections::HashMap;

use super::error::VmFault;
use super::value::{HeapRef, Value};

/// Watermark floor: collect no more often than every mebibyte.
pub const GC_FLOOR_BYTES: usize = 1024 * 1024;

/// Key type for BP maps: hash is over tag + payload, with float keys
/// hashed by bit pattern and string keys by content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Int(i64),
    Bool(bool),
    FloatBits(u64),
    Str(String),
}

impl MapKey {
    pub fn from_value(value: Value, gc: &Gc) -> Result<MapKey, VmFault> {
        match value {
            Value::Int(v) => Ok(MapKey::Int(v)),
            Value::Bool(b) => Ok(MapKey::Bool(b)),
            Value::Float(v) => Ok(MapKey::FloatBits(v.to_bits())),
            Value::Str(r) => Ok(MapKey::Str(gc.str(r)?.to_string())),
            other => Err(VmFault::TagMismatch {
                op: "MAP_KEY",
                expected: "int, float, bool or str",
                got: other.tag(),
            }),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            MapKey::Int(v) => v.to_string(),
            MapKey::Bool(b) => b.to_string(),
            MapKey::FloatBits(bits) => f64::from_bits(*bits).to_string(),
            MapKey::Str(s) => s.clone(),
        }
    }
}

/// The heap object kinds the collector manages.
#[derive(Debug, Clone)]
pub enum HeapObj {
    Str(String),
    Array(Vec<Value>),
    Map(HashMap<MapKey, Value>),
    Struct { type_id: u16, fields: Vec<Value> },
    Instance { class_id: u16, fields: Vec<Value> },
}

impl HeapObj {
    /// Rough retained size used for the allocation watermark.
    fn size_estimate(&self) -> usize {
        let payload = match self {
            HeapObj::Str(s) => s.len(),
            HeapObj::Array(items) => items.len() * std::mem::size_of::<Value>(),
            HeapObj::Map(map) => map.len() * 2 * std::mem::size_of::<Value>(),
            HeapObj::Struct { fields, .. } | HeapObj::Instance { fields, .. } => {
                fields.len() * std::mem::size_of::<Value>()
            }
        };
        payload + std::mem::size_of::<HeapObj>()
    }
}

#[derive(Debug)]
struct Slot {
    obj: HeapObj,
    marked: bool,
}

#[derive(Debug, Default)]
pub struct Gc {
    slots: Vec<Option<Slot>>,
    free: Vec<HeapRef>,
    bytes: usize,
    next_gc: usize,
    collections: u64,
}

impl Gc {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes: 0,
            next_gc: GC_FLOOR_BYTES,
            collections: 0,
        }
    }

    pub fn alloc(&mut self, obj: HeapObj) -> HeapRef {
        self.bytes += obj.size_estimate();
        let slot = Slot { obj, marked: false };
        if let Some(r) = self.free.pop() {
            self.slots[r as usize] = Some(slot);
            r
        } else {
            self.slots.push(Some(slot));
            (self.slots.len() - 1) as HeapRef
        }
    }

    pub fn alloc_str(&mut self, s: impl Into<String>) -> HeapRef {
        self.alloc(HeapObj::Str(s.into()))
    }

    /// True when the mutator should stop for a collection.
    pub fn should_collect(&self) -> bool {
        self.bytes > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes
    }

    pub fn collections(&self) -> u64 {
        self.collections
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Mark from the given root slices, sweep everything unmarked, and
    /// reset the watermark to `max(2 * live_bytes, 1 MiB)`.
    pub fn collect(&mut self, roots: &[&[Value]]) {
        let mut worklist: Vec<HeapRef> = Vec::new();
        for group in roots {
            for value in group.iter() {
                if let Some(r) = value.heap_ref() {
                    worklist.push(r);
                }
            }
        }
        while let Some(r) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(r as usize).and_then(|s| s.as_mut()) else {
                continue;
            };
            if slot.marked {
                continue;
            }
            slot.marked = true;
            match &slot.obj {
                HeapObj::Str(_) => {}
                HeapObj::Array(items) => {
                    worklist.extend(items.iter().filter_map(|v| v.heap_ref()));
                }
                HeapObj::Map(map) => {
                    worklist.extend(map.values().filter_map(|v| v.heap_ref()));
                }
                HeapObj::Struct { fields, .. } | HeapObj::Instance { fields, .. } => {
                    worklist.extend(fields.iter().filter_map(|v| v.heap_ref()));
                }
            }
        }

        let mut live_bytes = 0usize;
        for (i, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => {
                    slot.marked = false;
                    live_bytes += slot.obj.size_estimate();
                }
                Some(_) => {
                    *entry = None;
                    self.free.push(i as HeapRef);
                }
                None => {}
            }
        }
        self.bytes = live_bytes;
        self.next_gc = (live_bytes * 2).max(GC_FLOOR_BYTES);
        self.collections += 1;
    }

    fn slot(&self, r: HeapRef) -> Result<&HeapObj, VmFault> {
        self.slots
            .get(r as usize)
            .and_then(|s| s.as_ref())
            .map(|s| &s.obj)
            .ok_or(VmFault::BadHeapRef(r))
    }

    fn slot_mut(&mut self, r: HeapRef) -> Result<&mut HeapObj, VmFault> {
        self.slots
            .get_mut(r as usize)
            .and_then(|s| s.as_mut())
            .map(|s| &mut s.obj)
            .ok_or(VmFault::BadHeapRef(r))
    }

    pub fn str(&self, r: HeapRef) -> Result<&str, VmFault> {
        match self.slot(r)? {
            HeapObj::Str(s) => Ok(s),
            _ => Err(VmFault::BadHeapRef(r)),
        }
    }

    pub fn array(&self, r: HeapRef) -> Result<&Vec<Value>, VmFault> {
        match self.slot(r)? {
            HeapObj::Array(items) => Ok(items),
            _ => Err(VmFault::BadHeapRef(r)),
        }
    }

    pub fn array_mut(&mut self, r: HeapRef) -> Result<&mut Vec<Value>, VmFault> {
        match self.slot_mut(r)? {
            HeapObj::Array(items) => Ok(items),
            _ => Err(VmFault::BadHeapRef(r)),
        }
    }

    pub fn map(&self, r: HeapRef) -> Result<&HashMap<MapKey, Value>, VmFault> {
        match self.slot(r)? {
            HeapObj::Map(map) => Ok(map),
            _ => Err(VmFault::BadHeapRef(r)),
        }
    }

    pub fn map_mut(&mut self, r: HeapRef) -> Result<&mut HashMap<MapKey, Value>, VmFault> {
        match self.slot_mut(r)? {
            HeapObj::Map(map) => Ok(map),
            _ => Err(VmFault::BadHeapRef(r)),
        }
    }

    /// Fields of a struct or class instance.
    pub fn fields(&self, r: HeapRef) -> Result<&Vec<Value>, VmFault> {
        match self.slot(r)? {
            HeapObj::Struct { fields, .. } | HeapObj::Instance { fields, .. } => Ok(fields),
            _ => Err(VmFault::BadHeapRef(r)),
        }
    }

    pub fn fields_mut(&mut self, r: HeapRef) -> Result<&mut Vec<Value>, VmFault> {
        match self.slot_mut(r)? {
            HeapObj::Struct { fields, .. } | HeapObj::Instance { fields, .. } => Ok(fields),
            _ => Err(VmFault::BadHeapRef(r)),
        }
    }

    pub fn struct_type_id(&self, r: HeapRef) -> Result<u16, VmFault> {
        match self.slot(r)? {
            HeapObj::Struct { type_id, .. } => Ok(*type_id),
            _ => Err(VmFault::BadHeapRef(r)),
        }
    }

    pub fn instance_class_id(&self, r: HeapRef) -> Result<u16, VmFault> {
        match self.slot(r)? {
            HeapObj::Instance { class_id, .. } => Ok(*class_id),
            _ => Err(VmFault::BadHeapRef(r)),
        }
    }

    /// Deep equality for `EQ`/`NEQ`. The checker guarantees both sides
    /// have the same static type; mismatched tags simply compare unequal.
    pub fn values_equal(&self, a: Value, b: Value) -> Result<bool, VmFault> {
        Ok(match (a, b) {
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x == y,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Null, Value::Null) => true,
            (Value::Ptr(x), Value::Ptr(y)) => x == y,
            (Value::Func(x), Value::Func(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y || self.str(x)? == self.str(y)?,
            (Value::Array(x), Value::Array(y)) => {
                if x == y {
                    return Ok(true);
                }
                let xs = self.array(x)?;
                let ys = self.array(y)?;
                if xs.len() != ys.len() {
                    return Ok(false);
                }
                for (u, v) in xs.iter().zip(ys.iter()) {
                    if !self.values_equal(*u, *v)? {
                        return Ok(false);
                    }
                }
                true
            }
            (Value::Map(x), Value::Map(y)) => {
                if x == y {
                    return Ok(true);
                }
                let xs = self.map(x)?;
                let ys = self.map(y)?;
                if xs.len() != ys.len() {
                    return Ok(false);
                }
                for (k, v) in xs.iter() {
                    match ys.get(k) {
                        Some(w) if self.values_equal(*v, *w)? => {}
                        _ => return Ok(false),
                    }
                }
                true
            }
            (Value::Struct(x), Value::Struct(y)) => {
                if x == y {
                    return Ok(true);
                }
                if self.struct_type_id(x)? != self.struct_type_id(y)? {
                    return Ok(false);
                }
                let xs = self.fields(x)?;
                let ys = self.fields(y)?;
                for (u, v) in xs.iter().zip(ys.iter()) {
                    if !self.values_equal(*u, *v)? {
                        return Ok(false);
                    }
                }
                true
            }
            // Class instances compare by identity.
            (Value::Class(x), Value::Class(y)) => x == y,
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_access() {
        let mut gc = Gc::new();
        let s = gc.alloc_str("hi");
        let a = gc.alloc(HeapObj::Array(vec![Value::Int(1), Value::Str(s)]));
        assert_eq!(gc.str(s).unwrap(), "hi");
        assert_eq!(gc.array(a).unwrap().len(), 2);
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut gc = Gc::new();
        let live = gc.alloc_str("live");
        let _dead = gc.alloc_str("dead");
        let roots = [Value::Str(live)];
        gc.collect(&[&roots]);
        assert_eq!(gc.live_objects(), 1);
        assert_eq!(gc.str(live).unwrap(), "live");
    }

    #[test]
    fn test_collect_traces_through_containers() {
        let mut gc = Gc::new();
        let inner = gc.alloc_str("inner");
        let arr = gc.alloc(HeapObj::Array(vec![Value::Str(inner)]));
        let mut map = HashMap::new();
        map.insert(MapKey::Str("k".to_string()), Value::Array(arr));
        let m = gc.alloc(HeapObj::Map(map));
        let roots = [Value::Map(m)];
        gc.collect(&[&roots]);
        assert_eq!(gc.live_objects(), 3);
        assert_eq!(gc.str(inner).unwrap(), "inner");
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut gc = Gc::new();
        let dead = gc.alloc_str("dead");
        gc.collect(&[]);
        let reused = gc.alloc_str("new");
        assert_eq!(dead, reused);
    }

    #[test]
    fn test_watermark_floor() {
        let mut gc = Gc::new();
        gc.alloc_str("x");
        gc.collect(&[]);
        assert!(!gc.should_collect());
        assert_eq!(gc.next_gc, GC_FLOOR_BYTES);
    }

    #[test]
    fn test_deep_equality() {
        let mut gc = Gc::new();
        let a1 = {
            let s = gc.alloc_str("x");
            gc.alloc(HeapObj::Array(vec![Value::Int(1), Value::Str(s)]))
        };
        let a2 = {
            let s = gc.alloc_str("x");
            gc.alloc(HeapObj::Array(vec![Value::Int(1), Value::Str(s)]))
        };
        assert!(gc.values_equal(Value::Array(a1), Value::Array(a2)).unwrap());
        let a3 = gc.alloc(HeapObj::Array(vec![Value::Int(2)]));
        assert!(!gc.values_equal(Value::Array(a1), Value::Array(a3)).unwrap());
    }

    #[test]
    fn test_map_key_from_value_rejects_arrays() {
        let mut gc = Gc::new();
        let arr = gc.alloc(HeapObj::Array(vec![]));
        assert!(MapKey::from_value(Value::Array(arr), &gc).is_err());
        assert_eq!(
            MapKey::from_value(Value::Int(3), &gc).unwrap(),
            MapKey::Int(3)
        );
    }
}
