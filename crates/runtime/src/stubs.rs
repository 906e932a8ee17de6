//! # Runtime Stubs
//!
//! The named entry points call-bearing code transfers control to. Arguments
//! arrive in the target's three stub registers (`stub_args[0..3]`), results
//! leave through the registers listed by [`Stub::outputs`]. Every other
//! caller-saved register is clobbered.

use marlin_ast::BinOpKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::RuntimeResult;
use crate::heap::{Heap, PropertyKey};
use crate::machine::Machine;
use crate::value::{is_smi, tag_smi, untag_smi, HeapTag, Layout, Word, NIL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stub {
    /// `[0]` slot count. Parent is the current context.
    AllocateContext,
    /// `[0]` code label, `[1]` tagged argc. Parent is the current context.
    AllocateFunction,
    /// `[0]` tagged size hint.
    AllocateObject,
    /// `[0]` tagged size hint.
    AllocateArray,
    /// Generic fallback for a binary operator: `[0] op [1]`.
    BinOp(BinOpKind),
    Not,
    CoerceToBoolean,
    /// `[0]` object, `[1]` key.
    LookupProperty,
    /// `[0]` object, `[1]` key, `[2]` value. Returns the value in `[2]`.
    StoreProperty,
    DeleteProperty,
    Typeof,
    Sizeof,
    Keysof,
    CloneObject,
    /// `[0]` first index, `[1]` trailing count to skip, `[2]` array to fill.
    LoadVarArg,
    /// Pushes the elements of `[0]` last-to-first.
    StoreVarArg,
    StackTrace,
    CollectGarbage,
}

impl Stub {
    pub fn name(&self) -> &'static str {
        match self {
            Stub::AllocateContext => "AllocateContext",
            Stub::AllocateFunction => "AllocateFunction",
            Stub::AllocateObject => "AllocateObject",
            Stub::AllocateArray => "AllocateArray",
            Stub::BinOp(_) => "BinOp",
            Stub::Not => "Not",
            Stub::CoerceToBoolean => "CoerceToBoolean",
            Stub::LookupProperty => "LookupProperty",
            Stub::StoreProperty => "StoreProperty",
            Stub::DeleteProperty => "DeleteProperty",
            Stub::Typeof => "Typeof",
            Stub::Sizeof => "Sizeof",
            Stub::Keysof => "Keysof",
            Stub::CloneObject => "CloneObject",
            Stub::LoadVarArg => "LoadVarArg",
            Stub::StoreVarArg => "StoreVarArg",
            Stub::StackTrace => "StackTrace",
            Stub::CollectGarbage => "CollectGarbage",
        }
    }

    /// Stub argument registers (by index) that hold results after the call.
    pub fn outputs(&self) -> &'static [usize] {
        match self {
            Stub::StoreProperty | Stub::LoadVarArg => &[2],
            Stub::DeleteProperty | Stub::StoreVarArg | Stub::CollectGarbage => &[],
            _ => &[0],
        }
    }
}

impl fmt::Display for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stub::BinOp(op) => write!(f, "BinOp({})", op),
            other => f.write_str(other.name()),
        }
    }
}

pub(crate) fn invoke(machine: &mut Machine<'_>, stub: Stub) -> RuntimeResult<()> {
    let layout = machine.layout();
    let context = machine.reg(machine.config().context);
    match stub {
        Stub::AllocateContext => {
            let slots = untag_smi(machine.stub_arg(0)).max(0) as u32;
            let object = machine.heap_mut().context(context, slots)?;
            machine.set_stub_arg(0, object);
        }
        Stub::AllocateFunction => {
            let code = machine.stub_arg(0);
            let argc = machine.stub_arg(1);
            let object = machine.heap_mut().function(context, code, argc)?;
            machine.set_stub_arg(0, object);
        }
        Stub::AllocateObject => {
            let size = untag_smi(machine.stub_arg(0)).max(0) as usize;
            let object = machine.heap_mut().object(size)?;
            machine.set_stub_arg(0, object);
        }
        Stub::AllocateArray => {
            let size = untag_smi(machine.stub_arg(0)).max(0) as usize;
            let object = machine.heap_mut().array(Vec::with_capacity(size))?;
            machine.set_stub_arg(0, object);
        }
        Stub::BinOp(op) => {
            let (lhs, rhs) = (machine.stub_arg(0), machine.stub_arg(1));
            let result = binary_op(machine.heap_mut(), op, lhs, rhs)?;
            machine.set_stub_arg(0, result);
        }
        Stub::Not => {
            let value = machine.heap().truthy(machine.stub_arg(0))?;
            let result = machine.heap().boolean(!value);
            machine.set_stub_arg(0, result);
        }
        Stub::CoerceToBoolean => {
            let value = machine.heap().truthy(machine.stub_arg(0))?;
            let result = machine.heap().boolean(value);
            machine.set_stub_arg(0, result);
        }
        Stub::LookupProperty => {
            let (object, key) = (machine.stub_arg(0), machine.stub_arg(1));
            let result = lookup_property(machine.heap_mut(), object, key)?;
            machine.set_stub_arg(0, result);
        }
        Stub::StoreProperty => {
            let (object, key, value) = (machine.stub_arg(0), machine.stub_arg(1), machine.stub_arg(2));
            store_property(machine.heap_mut(), object, key, value)?;
            machine.set_stub_arg(2, value);
        }
        Stub::DeleteProperty => {
            let (object, key) = (machine.stub_arg(0), machine.stub_arg(1));
            delete_property(machine.heap_mut(), object, key)?;
        }
        Stub::Typeof => {
            let name = machine.heap().type_name(machine.stub_arg(0))?;
            let result = machine.heap_mut().string(name)?;
            machine.set_stub_arg(0, result);
        }
        Stub::Sizeof => {
            let size = size_of(machine.heap(), machine.stub_arg(0))?;
            machine.set_stub_arg(0, tag_smi(size as i64));
        }
        Stub::Keysof => {
            let value = machine.stub_arg(0);
            let keys = keys_of(machine.heap_mut(), value)?;
            let result = machine.heap_mut().array(keys)?;
            machine.set_stub_arg(0, result);
        }
        Stub::CloneObject => {
            let value = machine.stub_arg(0);
            let result = clone_object(machine.heap_mut(), value)?;
            machine.set_stub_arg(0, result);
        }
        Stub::LoadVarArg => {
            let offset = untag_smi(machine.stub_arg(0)).max(0);
            let rest = untag_smi(machine.stub_arg(1)).max(0);
            let array = machine.stub_arg(2);
            let fp = machine.reg(machine.config().frame_pointer);
            let argc = untag_smi(machine.heap().read_field(fp, layout.frame_slot(Layout::FRAME_ARGC))?);
            let mut items = Vec::new();
            for index in offset..(argc - rest).max(offset) {
                items.push(machine.heap().read_field(fp, layout.argument(index as u32))?);
            }
            if let Some(elements) = machine.heap_mut().elements_mut(array)? {
                elements.extend(items);
            }
        }
        Stub::StoreVarArg => {
            let value = machine.stub_arg(0);
            let items = spread_items(machine.heap_mut(), value)?;
            for item in items.into_iter().rev() {
                machine.push_word(item)?;
            }
        }
        Stub::StackTrace => {
            let mut frames = Vec::new();
            let mut fp = machine.reg(machine.config().frame_pointer);
            while fp != NIL && frames.len() < 4096 {
                let return_address = machine.heap().read_field(fp, layout.field(1))?;
                frames.push(tag_smi(return_address));
                fp = machine.heap().read(fp)?;
            }
            let result = machine.heap_mut().array(frames)?;
            machine.set_stub_arg(0, result);
        }
        Stub::CollectGarbage => {
            log::debug!("[STUB] collect garbage requested; heap is not collected");
        }
    }
    Ok(())
}

// ====== OPERATORS ======

fn to_number(heap: &Heap, value: Word) -> RuntimeResult<f64> {
    if value == NIL {
        return Ok(0.0);
    }
    if let Some(n) = heap.as_number(value)? {
        return Ok(n);
    }
    if let Some(b) = heap.as_bool(value)? {
        return Ok(if b { 1.0 } else { 0.0 });
    }
    if let Some(s) = heap.as_str(value)? {
        return Ok(s.trim().parse().unwrap_or(f64::NAN));
    }
    Ok(f64::NAN)
}

fn to_int(heap: &Heap, value: Word) -> RuntimeResult<i64> {
    if is_smi(value) {
        return Ok(untag_smi(value));
    }
    let n = to_number(heap, value)?;
    Ok(if n.is_finite() { n.trunc() as i64 } else { 0 })
}

fn is_string(heap: &Heap, value: Word) -> RuntimeResult<bool> {
    Ok(heap.tag_of(value)? == Some(HeapTag::String))
}

fn loose_equals(heap: &Heap, lhs: Word, rhs: Word) -> RuntimeResult<bool> {
    if lhs == rhs {
        return Ok(true);
    }
    if let (Some(a), Some(b)) = (heap.as_number(lhs)?, heap.as_number(rhs)?) {
        return Ok(a == b);
    }
    if let (Some(a), Some(b)) = (heap.as_str(lhs)?, heap.as_str(rhs)?) {
        return Ok(a == b);
    }
    if let (Some(a), Some(b)) = (heap.as_bool(lhs)?, heap.as_bool(rhs)?) {
        return Ok(a == b);
    }
    Ok(false)
}

fn compare(heap: &Heap, op: BinOpKind, lhs: Word, rhs: Word) -> RuntimeResult<bool> {
    Ok(match op {
        BinOpKind::Eq => loose_equals(heap, lhs, rhs)?,
        BinOpKind::Ne => !loose_equals(heap, lhs, rhs)?,
        BinOpKind::StrictEq => heap.type_name(lhs)? == heap.type_name(rhs)? && loose_equals(heap, lhs, rhs)?,
        BinOpKind::StrictNe => !(heap.type_name(lhs)? == heap.type_name(rhs)? && loose_equals(heap, lhs, rhs)?),
        _ => {
            let ordering = match (heap.as_str(lhs)?, heap.as_str(rhs)?) {
                (Some(a), Some(b)) => Some(a.cmp(b)),
                _ => to_number(heap, lhs)?.partial_cmp(&to_number(heap, rhs)?),
            };
            match ordering {
                None => false,
                Some(ordering) => match op {
                    BinOpKind::Lt => ordering == Ordering::Less,
                    BinOpKind::Gt => ordering == Ordering::Greater,
                    BinOpKind::Le => ordering != Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
            }
        }
    })
}

/// Slow path of every binary operator.
pub fn binary_op(heap: &mut Heap, op: BinOpKind, lhs: Word, rhs: Word) -> RuntimeResult<Word> {
    if op.is_bool_logic() {
        let truthy = heap.truthy(lhs)?;
        return Ok(match (op, truthy) {
            (BinOpKind::LAnd, true) | (BinOpKind::LOr, false) => rhs,
            _ => lhs,
        });
    }
    if op.is_logic() {
        let result = compare(heap, op, lhs, rhs)?;
        return Ok(heap.boolean(result));
    }
    if op == BinOpKind::Add && (is_string(heap, lhs)? || is_string(heap, rhs)?) {
        let text = heap.to_display_string(lhs)? + &heap.to_display_string(rhs)?;
        return heap.string(&text);
    }
    if op.is_binary() {
        let a = to_int(heap, lhs)? as i32;
        let b = to_int(heap, rhs)? as i32;
        let shift = (b & 31) as u32;
        let result = match op {
            BinOpKind::Mod => {
                if b == 0 {
                    0
                } else {
                    a.wrapping_rem(b) as i64
                }
            }
            BinOpKind::BAnd => (a & b) as i64,
            BinOpKind::BOr => (a | b) as i64,
            BinOpKind::BXor => (a ^ b) as i64,
            BinOpKind::Shl => a.wrapping_shl(shift) as i64,
            BinOpKind::Shr => (a >> shift) as i64,
            _ => ((a as u32) >> shift) as i64,
        };
        return heap.integer(result);
    }

    if is_smi(lhs) && is_smi(rhs) && op != BinOpKind::Div {
        let (a, b) = (untag_smi(lhs), untag_smi(rhs));
        let exact = match op {
            BinOpKind::Add => a.checked_add(b),
            BinOpKind::Sub => a.checked_sub(b),
            _ => a.checked_mul(b),
        };
        if let Some(result) = exact {
            return heap.integer(result);
        }
    }
    let a = to_number(heap, lhs)?;
    let b = to_number(heap, rhs)?;
    let result = match op {
        BinOpKind::Add => a + b,
        BinOpKind::Sub => a - b,
        BinOpKind::Mul => a * b,
        _ => a / b,
    };
    heap.number(result)
}

// ====== PROPERTIES ======

fn array_index(heap: &Heap, key: Word) -> RuntimeResult<Option<usize>> {
    Ok(match heap.property_key(key)? {
        PropertyKey::Int(n) if n >= 0 => Some(n as usize),
        _ => None,
    })
}

fn lookup_property(heap: &mut Heap, object: Word, key: Word) -> RuntimeResult<Word> {
    match heap.tag_of(object)? {
        Some(HeapTag::Object) => {
            let key = heap.property_key(key)?;
            Ok(heap
                .properties(object)?
                .and_then(|map| map.get(&key).copied())
                .unwrap_or(NIL))
        }
        Some(HeapTag::Array) => {
            let index = array_index(heap, key)?;
            let items = heap.elements(object)?;
            Ok(index
                .and_then(|i| items.and_then(|items| items.get(i).copied()))
                .unwrap_or(NIL))
        }
        Some(HeapTag::String) => {
            let index = array_index(heap, key)?;
            let ch = match (index, heap.as_str(object)?) {
                (Some(i), Some(s)) => s.chars().nth(i),
                _ => None,
            };
            match ch {
                Some(ch) => heap.string(&ch.to_string()),
                None => Ok(NIL),
            }
        }
        _ => Ok(NIL),
    }
}

fn store_property(heap: &mut Heap, object: Word, key: Word, value: Word) -> RuntimeResult<()> {
    match heap.tag_of(object)? {
        Some(HeapTag::Object) => {
            let key = heap.property_key(key)?;
            if let Some(map) = heap.properties_mut(object)? {
                map.insert(key, value);
            }
        }
        Some(HeapTag::Array) => {
            if let Some(index) = array_index(heap, key)? {
                if let Some(items) = heap.elements_mut(object)? {
                    if index >= items.len() {
                        items.resize(index + 1, NIL);
                    }
                    items[index] = value;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn delete_property(heap: &mut Heap, object: Word, key: Word) -> RuntimeResult<()> {
    match heap.tag_of(object)? {
        Some(HeapTag::Object) => {
            let key = heap.property_key(key)?;
            if let Some(map) = heap.properties_mut(object)? {
                map.shift_remove(&key);
            }
        }
        Some(HeapTag::Array) => {
            if let Some(index) = array_index(heap, key)? {
                if let Some(slot) = heap.elements_mut(object)?.and_then(|items| items.get_mut(index)) {
                    *slot = NIL;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn size_of(heap: &Heap, value: Word) -> RuntimeResult<usize> {
    Ok(match heap.tag_of(value)? {
        Some(HeapTag::Array) => heap.elements(value)?.map_or(0, Vec::len),
        Some(HeapTag::String) => heap.as_str(value)?.map_or(0, |s| s.chars().count()),
        Some(HeapTag::Object) => heap.properties(value)?.map_or(0, |map| map.len()),
        _ => 0,
    })
}

fn keys_of(heap: &mut Heap, value: Word) -> RuntimeResult<Vec<Word>> {
    match heap.tag_of(value)? {
        Some(HeapTag::Object) => {
            let keys: Vec<PropertyKey> = heap
                .properties(value)?
                .map(|map| map.keys().cloned().collect())
                .unwrap_or_default();
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                out.push(match key {
                    PropertyKey::Int(n) => heap.integer(n)?,
                    PropertyKey::Str(s) => heap.string(&s)?,
                });
            }
            Ok(out)
        }
        Some(HeapTag::Array) => {
            let len = heap.elements(value)?.map_or(0, Vec::len);
            Ok((0..len as i64).map(tag_smi).collect())
        }
        _ => Ok(Vec::new()),
    }
}

fn clone_object(heap: &mut Heap, value: Word) -> RuntimeResult<Word> {
    match heap.tag_of(value)? {
        Some(HeapTag::Object) => {
            let entries = heap.properties(value)?.cloned().unwrap_or_default();
            let copy = heap.object(entries.len())?;
            if let Some(map) = heap.properties_mut(copy)? {
                *map = entries;
            }
            Ok(copy)
        }
        Some(HeapTag::Array) => {
            let items = heap.elements(value)?.cloned().unwrap_or_default();
            heap.array(items)
        }
        _ => Ok(NIL),
    }
}

/// Words a spread argument expands to; always `sizeof` many.
fn spread_items(heap: &mut Heap, value: Word) -> RuntimeResult<Vec<Word>> {
    match heap.tag_of(value)? {
        Some(HeapTag::Array) => Ok(heap.elements(value)?.cloned().unwrap_or_default()),
        Some(HeapTag::Object) => Ok(heap
            .properties(value)?
            .map(|map| map.values().copied().collect())
            .unwrap_or_default()),
        Some(HeapTag::String) => {
            let chars: Vec<char> = heap.as_str(value)?.map(|s| s.chars().collect()).unwrap_or_default();
            let mut out = Vec::with_capacity(chars.len());
            for ch in chars {
                out.push(heap.string(&ch.to_string())?);
            }
            Ok(out)
        }
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(8, 1024, 64).unwrap()
    }

    #[test]
    fn test_smi_arithmetic() {
        let mut heap = heap();
        let sum = binary_op(&mut heap, BinOpKind::Add, tag_smi(2), tag_smi(3)).unwrap();
        assert_eq!(sum, tag_smi(5));
        let quotient = binary_op(&mut heap, BinOpKind::Div, tag_smi(1), tag_smi(2)).unwrap();
        assert_eq!(heap.as_number(quotient).unwrap(), Some(0.5));
        let exact = binary_op(&mut heap, BinOpKind::Div, tag_smi(6), tag_smi(2)).unwrap();
        assert_eq!(exact, tag_smi(3));
    }

    #[test]
    fn test_string_concatenation() {
        let mut heap = heap();
        let text = heap.string("n=").unwrap();
        let result = binary_op(&mut heap, BinOpKind::Add, text, tag_smi(7)).unwrap();
        assert_eq!(heap.as_str(result).unwrap(), Some("n=7"));
    }

    #[test]
    fn test_comparisons_produce_booleans() {
        let mut heap = heap();
        let lt = binary_op(&mut heap, BinOpKind::Lt, tag_smi(1), tag_smi(2)).unwrap();
        assert_eq!(lt, heap.boolean(true));
        let eq = binary_op(&mut heap, BinOpKind::StrictEq, tag_smi(1), NIL).unwrap();
        assert_eq!(eq, heap.boolean(false));
    }

    #[test]
    fn test_bitwise_and_mod() {
        let mut heap = heap();
        assert_eq!(binary_op(&mut heap, BinOpKind::BAnd, tag_smi(6), tag_smi(3)).unwrap(), tag_smi(2));
        assert_eq!(binary_op(&mut heap, BinOpKind::Mod, tag_smi(7), tag_smi(0)).unwrap(), tag_smi(0));
        assert_eq!(binary_op(&mut heap, BinOpKind::Shl, tag_smi(1), tag_smi(4)).unwrap(), tag_smi(16));
    }

    #[test]
    fn test_property_round_trip() {
        let mut heap = heap();
        let object = heap.object(4).unwrap();
        let key = heap.string("x").unwrap();
        store_property(&mut heap, object, key, tag_smi(9)).unwrap();
        assert_eq!(lookup_property(&mut heap, object, key).unwrap(), tag_smi(9));
        assert_eq!(size_of(&heap, object).unwrap(), 1);
        delete_property(&mut heap, object, key).unwrap();
        assert_eq!(lookup_property(&mut heap, object, key).unwrap(), NIL);
    }

    #[test]
    fn test_array_store_grows() {
        let mut heap = heap();
        let array = heap.array(Vec::new()).unwrap();
        store_property(&mut heap, array, tag_smi(2), tag_smi(1)).unwrap();
        assert_eq!(size_of(&heap, array).unwrap(), 3);
        assert_eq!(lookup_property(&mut heap, array, tag_smi(0)).unwrap(), NIL);
        assert_eq!(keys_of(&mut heap, array).unwrap(), vec![tag_smi(0), tag_smi(1), tag_smi(2)]);
    }

    #[test]
    fn test_spread_matches_sizeof() {
        let mut heap = heap();
        let text = heap.string("abc").unwrap();
        let items = spread_items(&mut heap, text).unwrap();
        assert_eq!(items.len(), size_of(&heap, text).unwrap());
    }

    #[test]
    fn test_outputs() {
        assert_eq!(Stub::StoreProperty.outputs(), &[2]);
        assert_eq!(Stub::BinOp(BinOpKind::Add).outputs(), &[0]);
        assert!(Stub::CollectGarbage.outputs().is_empty());
        assert_eq!(Stub::BinOp(BinOpKind::Sub).to_string(), "BinOp(-)");
    }
}
