//! # Heap
//!
//! Word-addressed memory shared by the heap and the machine stack, plus the
//! Rust-side tables that back strings, objects and arrays. A heap object of
//! those kinds stores only a handle into its table; the layout contract in
//! [`Layout`] is all compiled code relies on.
//!
//! Memory is laid out as `[unused | heap -> ... <- stack]`. Address 0 stays
//! unmapped so nil can never be dereferenced by accident.

use indexmap::IndexMap;
use std::fmt;

use crate::error::{RuntimeError, RuntimeResult};
use crate::value::{is_heap_pointer, is_smi, smi_fits, tag_smi, untag_smi, HeapTag, Layout, Value, Word, NIL};

/// Key of an object property. Integral numbers and strings are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    Int(i64),
    Str(String),
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKey::Int(n) => write!(f, "{}", n),
            PropertyKey::Str(s) => f.write_str(s),
        }
    }
}

pub struct Heap {
    layout: Layout,
    memory: Vec<Word>,
    /// Next free byte address.
    top: Word,
    /// First byte address owned by the stack.
    limit: Word,
    strings: Vec<String>,
    objects: Vec<IndexMap<PropertyKey, Word>>,
    arrays: Vec<Vec<Word>>,
    true_value: Word,
    false_value: Word,
}

impl Heap {
    /// Reserved words at the bottom of memory.
    const RESERVED_WORDS: u32 = 8;

    pub fn new(pointer_size: u32, heap_words: u32, stack_words: u32) -> RuntimeResult<Self> {
        let layout = Layout::new(pointer_size);
        let total = Self::RESERVED_WORDS + heap_words + stack_words;
        let mut heap = Self {
            layout,
            memory: vec![NIL; total as usize],
            top: layout.field(Self::RESERVED_WORDS) as Word,
            limit: layout.field(Self::RESERVED_WORDS + heap_words) as Word,
            strings: Vec::new(),
            objects: Vec::new(),
            arrays: Vec::new(),
            true_value: NIL,
            false_value: NIL,
        };
        heap.true_value = heap.allocate(HeapTag::Boolean, Layout::BOXED_WORDS)?;
        heap.write(heap.true_value + heap.layout.value_field() as Word, 1)?;
        heap.false_value = heap.allocate(HeapTag::Boolean, Layout::BOXED_WORDS)?;
        Ok(heap)
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Byte address one past the highest stack word.
    pub fn stack_top(&self) -> Word {
        (self.memory.len() as Word) * self.layout.pointer_size as Word
    }

    pub fn stack_limit(&self) -> Word {
        self.limit
    }

    /// Reserve `size` words (including the tag word) and write `tag`.
    pub fn allocate(&mut self, tag: HeapTag, size: u32) -> RuntimeResult<Word> {
        let bytes = (size.max(Layout::TAG_WORDS) * self.layout.pointer_size) as Word;
        if self.top + bytes > self.limit {
            return Err(RuntimeError::OutOfMemory { requested: size });
        }
        let address = self.top;
        self.top += bytes;
        self.write(address, tag as Word)?;
        log::trace!("[HEAP] allocate {:?} x{} at {:#x}", tag, size, address);
        Ok(address)
    }

    fn index(&self, address: Word) -> RuntimeResult<usize> {
        let size = self.layout.pointer_size as Word;
        if address <= 0 || address % size != 0 {
            return Err(RuntimeError::InvalidAddress(address));
        }
        let index = (address / size) as usize;
        if index < Self::RESERVED_WORDS as usize || index >= self.memory.len() {
            return Err(RuntimeError::InvalidAddress(address));
        }
        Ok(index)
    }

    pub fn read(&self, address: Word) -> RuntimeResult<Word> {
        let index = self.index(address)?;
        Ok(self.memory[index])
    }

    pub fn write(&mut self, address: Word, value: Word) -> RuntimeResult<()> {
        let index = self.index(address)?;
        self.memory[index] = value;
        Ok(())
    }

    pub fn read_field(&self, object: Word, offset: i32) -> RuntimeResult<Word> {
        self.read(object + offset as Word)
    }

    pub fn write_field(&mut self, object: Word, offset: i32, value: Word) -> RuntimeResult<()> {
        self.write(object + offset as Word, value)
    }

    /// Tag of a heap object, `None` for nil and small integers.
    pub fn tag_of(&self, value: Word) -> RuntimeResult<Option<HeapTag>> {
        if !is_heap_pointer(value) {
            return Ok(None);
        }
        let word = self.read(value)?;
        HeapTag::from_word(word)
            .map(Some)
            .ok_or(RuntimeError::InvalidAddress(value))
    }

    fn handle(&self, value: Word) -> RuntimeResult<usize> {
        Ok(self.read_field(value, self.layout.value_field())? as usize)
    }

    // ====== CONSTRUCTORS ======

    pub fn boolean(&self, value: bool) -> Word {
        if value {
            self.true_value
        } else {
            self.false_value
        }
    }

    /// A number value: tagged when integral and in range, boxed otherwise.
    pub fn number(&mut self, value: f64) -> RuntimeResult<Word> {
        if value.fract() == 0.0 && value.abs() < (1u64 << 53) as f64 {
            let int = value as i64;
            if smi_fits(int, self.layout.pointer_size) && !(int == 0 && value.is_sign_negative()) {
                return Ok(tag_smi(int));
            }
        }
        self.heap_number(value)
    }

    pub fn integer(&mut self, value: i64) -> RuntimeResult<Word> {
        if smi_fits(value, self.layout.pointer_size) {
            Ok(tag_smi(value))
        } else {
            self.heap_number(value as f64)
        }
    }

    pub fn heap_number(&mut self, value: f64) -> RuntimeResult<Word> {
        let object = self.allocate(HeapTag::Number, Layout::BOXED_WORDS)?;
        self.write_field(object, self.layout.value_field(), value.to_bits() as Word)?;
        Ok(object)
    }

    pub fn string(&mut self, value: &str) -> RuntimeResult<Word> {
        let object = self.allocate(HeapTag::String, Layout::BOXED_WORDS)?;
        self.strings.push(value.to_string());
        self.write_field(object, self.layout.value_field(), (self.strings.len() - 1) as Word)?;
        Ok(object)
    }

    pub fn object(&mut self, capacity: usize) -> RuntimeResult<Word> {
        let object = self.allocate(HeapTag::Object, Layout::BOXED_WORDS)?;
        self.objects.push(IndexMap::with_capacity(capacity));
        self.write_field(object, self.layout.value_field(), (self.objects.len() - 1) as Word)?;
        Ok(object)
    }

    pub fn array(&mut self, items: Vec<Word>) -> RuntimeResult<Word> {
        let object = self.allocate(HeapTag::Array, Layout::BOXED_WORDS)?;
        self.arrays.push(items);
        self.write_field(object, self.layout.value_field(), (self.arrays.len() - 1) as Word)?;
        Ok(object)
    }

    pub fn context(&mut self, parent: Word, slots: u32) -> RuntimeResult<Word> {
        let object = self.allocate(HeapTag::Context, Layout::CONTEXT_HEADER_WORDS + slots)?;
        self.write_field(object, self.layout.context_parent(), parent)?;
        Ok(object)
    }

    pub fn function(&mut self, parent: Word, code: Word, argc: Word) -> RuntimeResult<Word> {
        let object = self.allocate(HeapTag::Function, Layout::FUNCTION_WORDS)?;
        self.write_field(object, self.layout.function_parent(), parent)?;
        self.write_field(object, self.layout.function_code(), code)?;
        self.write_field(object, self.layout.function_argc(), argc)?;
        Ok(object)
    }

    // ====== ACCESSORS ======

    pub fn as_number(&self, value: Word) -> RuntimeResult<Option<f64>> {
        if is_smi(value) {
            return Ok(Some(untag_smi(value) as f64));
        }
        match self.tag_of(value)? {
            Some(HeapTag::Number) => {
                let bits = self.read_field(value, self.layout.value_field())?;
                Ok(Some(f64::from_bits(bits as u64)))
            }
            _ => Ok(None),
        }
    }

    pub fn as_str(&self, value: Word) -> RuntimeResult<Option<&str>> {
        match self.tag_of(value)? {
            Some(HeapTag::String) => Ok(self.strings.get(self.handle(value)?).map(String::as_str)),
            _ => Ok(None),
        }
    }

    pub fn as_bool(&self, value: Word) -> RuntimeResult<Option<bool>> {
        match self.tag_of(value)? {
            Some(HeapTag::Boolean) => Ok(Some(self.read_field(value, self.layout.value_field())? != 0)),
            _ => Ok(None),
        }
    }

    pub fn properties(&self, value: Word) -> RuntimeResult<Option<&IndexMap<PropertyKey, Word>>> {
        match self.tag_of(value)? {
            Some(HeapTag::Object) => Ok(self.objects.get(self.handle(value)?)),
            _ => Ok(None),
        }
    }

    pub fn properties_mut(&mut self, value: Word) -> RuntimeResult<Option<&mut IndexMap<PropertyKey, Word>>> {
        match self.tag_of(value)? {
            Some(HeapTag::Object) => {
                let handle = self.handle(value)?;
                Ok(self.objects.get_mut(handle))
            }
            _ => Ok(None),
        }
    }

    pub fn elements(&self, value: Word) -> RuntimeResult<Option<&Vec<Word>>> {
        match self.tag_of(value)? {
            Some(HeapTag::Array) => Ok(self.arrays.get(self.handle(value)?)),
            _ => Ok(None),
        }
    }

    pub fn elements_mut(&mut self, value: Word) -> RuntimeResult<Option<&mut Vec<Word>>> {
        match self.tag_of(value)? {
            Some(HeapTag::Array) => {
                let handle = self.handle(value)?;
                Ok(self.arrays.get_mut(handle))
            }
            _ => Ok(None),
        }
    }

    /// Property key for `value`, following the language's coercion rules.
    pub fn property_key(&self, value: Word) -> RuntimeResult<PropertyKey> {
        if let Some(n) = self.as_number(value)? {
            if n.fract() == 0.0 {
                return Ok(PropertyKey::Int(n as i64));
            }
        }
        Ok(PropertyKey::Str(self.to_display_string(value)?))
    }

    pub fn truthy(&self, value: Word) -> RuntimeResult<bool> {
        if value == NIL {
            return Ok(false);
        }
        if is_smi(value) {
            return Ok(untag_smi(value) != 0);
        }
        Ok(match self.tag_of(value)? {
            Some(HeapTag::Boolean) => self.as_bool(value)?.unwrap_or(false),
            Some(HeapTag::Number) => self.as_number(value)?.map_or(false, |n| n != 0.0 && !n.is_nan()),
            Some(HeapTag::String) => self.as_str(value)?.map_or(false, |s| !s.is_empty()),
            _ => true,
        })
    }

    pub fn type_name(&self, value: Word) -> RuntimeResult<&'static str> {
        if value == NIL {
            return Ok("nil");
        }
        if is_smi(value) {
            return Ok("number");
        }
        Ok(self.tag_of(value)?.map_or("nil", HeapTag::type_name))
    }

    pub fn to_display_string(&self, value: Word) -> RuntimeResult<String> {
        if value == NIL {
            return Ok("nil".to_string());
        }
        if let Some(n) = self.as_number(value)? {
            return Ok(format_number(n));
        }
        Ok(match self.tag_of(value)? {
            Some(HeapTag::String) => self.as_str(value)?.unwrap_or_default().to_string(),
            Some(HeapTag::Boolean) => self.as_bool(value)?.unwrap_or(false).to_string(),
            Some(tag) => format!("[{}]", tag.type_name()),
            None => "nil".to_string(),
        })
    }

    /// Describe a value for the host, cutting nesting off at `depth`.
    pub fn describe(&self, value: Word, depth: u32) -> RuntimeResult<Value> {
        if value == NIL {
            return Ok(Value::Nil);
        }
        if is_smi(value) {
            return Ok(Value::Smi(untag_smi(value)));
        }
        if depth == 0 {
            return Ok(Value::Elided);
        }
        Ok(match self.tag_of(value)? {
            Some(HeapTag::Number) => Value::Number(self.as_number(value)?.unwrap_or(f64::NAN)),
            Some(HeapTag::Boolean) => Value::Boolean(self.as_bool(value)?.unwrap_or(false)),
            Some(HeapTag::String) => Value::String(self.as_str(value)?.unwrap_or_default().to_string()),
            Some(HeapTag::Array) => {
                let items = self.elements(value)?.cloned().unwrap_or_default();
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.describe(item, depth - 1)?);
                }
                Value::Array(out)
            }
            Some(HeapTag::Object) => {
                let entries: Vec<(PropertyKey, Word)> = self
                    .properties(value)?
                    .map(|map| map.iter().map(|(k, v)| (k.clone(), *v)).collect())
                    .unwrap_or_default();
                let mut out = Vec::with_capacity(entries.len());
                for (key, item) in entries {
                    out.push((key.to_string(), self.describe(item, depth - 1)?));
                }
                Value::Object(out)
            }
            Some(HeapTag::Function) => Value::Function {
                argc: untag_smi(self.read_field(value, self.layout.function_argc())?),
            },
            Some(HeapTag::Context) | None => Value::Context,
        })
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
