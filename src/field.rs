//! Per-type field encodings over shared column memory.
//!
//! A [`FieldKind`] describes how one schema field is laid out in its
//! column; a [`ColumnStorage`] is the actual shared byte slab (or, for
//! `Ref` fields, a slab of atomic words) that backs it. This module owns
//! every `unsafe` byte-level access in the crate; everything above it
//! (`component`, `world`) only ever calls the safe methods here.
//!
//! Layouts are reproduced bit-exactly per ยง4.3/ยง6 so that a worker thread
//! reconstructing a view over the same shared bytes agrees with the main
//! thread on every offset.

use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::entity::EntityBuffer;
use crate::EcsError;

/// Null sentinel for `Ref` fields (ยง3, ยง6).
pub const NULL_REF: u32 = u32::MAX;

/// Scalar numeric subtypes recognized by `FieldKind::Number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumberKind {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl NumberKind {
    pub fn byte_size(self) -> usize {
        match self {
            NumberKind::U8 | NumberKind::I8 => 1,
            NumberKind::U16 | NumberKind::I16 => 2,
            NumberKind::U32 | NumberKind::I32 | NumberKind::F32 => 4,
            NumberKind::F64 => 8,
        }
    }
}

/// A concrete numeric value, tagged by subtype.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NumberValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    I16(i16),
    I32(i32),
    F32(f32),
    F64(f64),
}

/// The schema-level description of one field. Recognized kinds per ยง3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldKind {
    Number(NumberKind),
    Boolean,
    String { max_length: u32 },
    Binary { max_length: u32 },
    /// Values are stored sorted ascending; the column holds a `u16` index
    /// into this list.
    Enum { values: Vec<String> },
    Array {
        element: Box<FieldKind>,
        max_length: u32,
    },
    Tuple {
        element: Box<FieldKind>,
        length: u32,
    },
    Ref,
}

impl FieldKind {
    pub fn string(max_length: u32) -> Self {
        FieldKind::String { max_length }
    }

    pub fn binary(max_length: u32) -> Self {
        FieldKind::Binary { max_length }
    }

    pub fn array(element: FieldKind, max_length: u32) -> Self {
        FieldKind::Array {
            element: Box::new(element),
            max_length,
        }
    }

    pub fn tuple(element: FieldKind, length: u32) -> Self {
        FieldKind::Tuple {
            element: Box::new(element),
            length,
        }
    }

    /// Sorts `values` ascending, matching the on-column encoding contract.
    pub fn enum_of(mut values: Vec<String>) -> Self {
        values.sort();
        FieldKind::Enum { values }
    }

    /// Per-entity slot size in bytes for this kind (0 for `Ref`, which
    /// uses a dedicated atomic column instead of the byte slab).
    fn element_stride(&self) -> usize {
        match self {
            FieldKind::Number(n) => n.byte_size(),
            FieldKind::Boolean => 1,
            FieldKind::String { max_length } | FieldKind::Binary { max_length } => {
                4 + *max_length as usize
            }
            FieldKind::Enum { .. } => 2,
            FieldKind::Array {
                element,
                max_length,
            } => align8(4 + *max_length as usize * element.element_stride()),
            FieldKind::Tuple { element, length } => {
                align8(*length as usize * element.element_stride())
            }
            FieldKind::Ref => 0,
        }
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// A concrete field value, the dynamic counterpart of [`FieldKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Number(NumberValue),
    Boolean(bool),
    Str(String),
    Bytes(Vec<u8>),
    Enum(String),
    Array(Vec<FieldValue>),
    Tuple(Vec<FieldValue>),
    /// `None` after validation failure or if never written; `Some` is a
    /// live, generation-matching target.
    Ref(Option<u32>),
}

/// A type-erased, manually managed byte slab shared across threads.
///
/// Mirrors the source crate's `archetype::Column`: a raw allocation
/// behind a safe-looking surface, with the invariant that all callers
/// agree on the element stride and never touch the same entity's slot
/// concurrently (ยง5).
pub struct BytesColumn {
    data: *mut u8,
    stride: usize,
    capacity: u32,
    layout: Layout,
}

// Safety: `BytesColumn` is only ever handed out wrapped in `Arc`, and the
// crate's contract (ยง5) is that concurrent writers never target the same
// entity slot. Cross-thread visibility of a given slot's bytes is
// established by the event log's `Release`/`Acquire` pair on `write_index`.
unsafe impl Send for BytesColumn {}
unsafe impl Sync for BytesColumn {}

impl BytesColumn {
    fn new(stride: usize, capacity: u32) -> Self {
        let total = stride * capacity as usize;
        let layout = Layout::array::<u8>(total.max(1)).expect("column layout overflow");
        let data = unsafe { alloc::alloc_zeroed(layout) };
        if data.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Self {
            data,
            stride,
            capacity,
            layout,
        }
    }

    fn slot(&self, entity_id: u32) -> &mut [u8] {
        debug_assert!(entity_id < self.capacity, "entity id out of column range");
        let offset = entity_id as usize * self.stride;
        unsafe { std::slice::from_raw_parts_mut(self.data.add(offset), self.stride) }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl Drop for BytesColumn {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            unsafe { alloc::dealloc(self.data, self.layout) };
        }
    }
}

impl std::fmt::Debug for BytesColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytesColumn")
            .field("stride", &self.stride)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A dedicated atomic column for `Ref` fields (one `AtomicU32` per
/// entity), so reads/writes can use true atomic load/store per ยง4.3.
#[derive(Debug)]
pub struct RefColumn {
    words: Vec<AtomicU32>,
}

impl RefColumn {
    fn new(capacity: u32) -> Self {
        Self {
            words: (0..capacity).map(|_| AtomicU32::new(NULL_REF)).collect(),
        }
    }
}

/// Per-field shared storage: either a byte slab or an atomic ref column.
#[derive(Debug)]
pub enum ColumnStorage {
    Bytes(BytesColumn),
    Ref(RefColumn),
}

/// Pack `(entity_id, generation)` into the wire format ยง6 describes:
/// `(entity_id & 0x01FF_FFFF) | (generation << 25)`.
pub fn pack_ref(entity_id: u32, generation: u8) -> u32 {
    (entity_id & 0x01FF_FFFF) | ((generation as u32) << 25)
}

/// Unpack a ref word into `(entity_id, generation)`.
pub fn unpack_ref(word: u32) -> (u32, u8) {
    (word & 0x01FF_FFFF, (word >> 25) as u8)
}

/// Handler for one field kind: allocates storage and converts between the
/// column's byte/atomic representation and [`FieldValue`].
pub trait FieldHandler: Send + Sync {
    fn initialize_storage(&self, capacity: u32) -> ColumnStorage;
    fn set_value(&self, column: &ColumnStorage, entity_id: u32, value: &FieldValue, entities: &EntityBuffer);
    fn get_value(&self, column: &ColumnStorage, entity_id: u32, entities: &EntityBuffer) -> FieldValue;
    fn default_value(&self) -> FieldValue;
}

/// Build the handler for a given [`FieldKind`].
pub fn handler_for(kind: &FieldKind, default: Option<FieldValue>) -> Box<dyn FieldHandler> {
    match kind {
        FieldKind::Number(n) => Box::new(NumberHandler {
            kind: *n,
            default,
        }),
        FieldKind::Boolean => Box::new(BooleanHandler { default }),
        FieldKind::String { max_length } => Box::new(StringHandler {
            max_length: *max_length,
            binary: false,
            default,
        }),
        FieldKind::Binary { max_length } => Box::new(StringHandler {
            max_length: *max_length,
            binary: true,
            default,
        }),
        FieldKind::Enum { values } => Box::new(EnumHandler {
            values: values.clone(),
            default,
        }),
        FieldKind::Array { element, max_length } => Box::new(ArrayHandler {
            element: (**element).clone(),
            max_length: *max_length,
            stride: element.element_stride(),
        }),
        FieldKind::Tuple { element, length } => Box::new(TupleHandler {
            element: (**element).clone(),
            length: *length,
            stride: element.element_stride(),
        }),
        FieldKind::Ref => Box::new(RefHandler),
    }
}

fn as_bytes(column: &ColumnStorage) -> &BytesColumn {
    match column {
        ColumnStorage::Bytes(b) => b,
        ColumnStorage::Ref(_) => panic!("expected a byte column, found a ref column"),
    }
}

// ---------------------------------------------------------------------------
// Number
// ---------------------------------------------------------------------------

struct NumberHandler {
    kind: NumberKind,
    default: Option<FieldValue>,
}

impl FieldHandler for NumberHandler {
    fn initialize_storage(&self, capacity: u32) -> ColumnStorage {
        ColumnStorage::Bytes(BytesColumn::new(self.kind.byte_size(), capacity))
    }

    fn set_value(&self, column: &ColumnStorage, entity_id: u32, value: &FieldValue, _entities: &EntityBuffer) {
        let FieldValue::Number(n) = value else {
            return;
        };
        let slot = as_bytes(column).slot(entity_id);
        write_number(slot, self.kind, *n);
    }

    fn get_value(&self, column: &ColumnStorage, entity_id: u32, _entities: &EntityBuffer) -> FieldValue {
        let slot = as_bytes(column).slot(entity_id);
        FieldValue::Number(read_number(slot, self.kind))
    }

    fn default_value(&self) -> FieldValue {
        self.default.clone().unwrap_or(FieldValue::Number(zero_number(self.kind)))
    }
}

fn zero_number(kind: NumberKind) -> NumberValue {
    match kind {
        NumberKind::U8 => NumberValue::U8(0),
        NumberKind::U16 => NumberValue::U16(0),
        NumberKind::U32 => NumberValue::U32(0),
        NumberKind::I8 => NumberValue::I8(0),
        NumberKind::I16 => NumberValue::I16(0),
        NumberKind::I32 => NumberValue::I32(0),
        NumberKind::F32 => NumberValue::F32(0.0),
        NumberKind::F64 => NumberValue::F64(0.0),
    }
}

// Multi-byte subtypes are reinterpreted through `bytemuck` rather than
// hand-rolled `to_le_bytes`/`from_le_bytes`: every reader and writer of a
// column lives in the same process on the same host (ยง1 Non-goals rule out
// cross-machine distribution), so native-endian POD reinterpretation is
// sound and skips a byteswap on every access.
fn write_number(slot: &mut [u8], kind: NumberKind, value: NumberValue) {
    match (kind, value) {
        (NumberKind::U8, NumberValue::U8(v)) => slot[0] = v,
        (NumberKind::I8, NumberValue::I8(v)) => slot[0] = v as u8,
        (NumberKind::U16, NumberValue::U16(v)) => slot.copy_from_slice(bytemuck::bytes_of(&v)),
        (NumberKind::I16, NumberValue::I16(v)) => slot.copy_from_slice(bytemuck::bytes_of(&v)),
        (NumberKind::U32, NumberValue::U32(v)) => slot.copy_from_slice(bytemuck::bytes_of(&v)),
        (NumberKind::I32, NumberValue::I32(v)) => slot.copy_from_slice(bytemuck::bytes_of(&v)),
        (NumberKind::F32, NumberValue::F32(v)) => slot.copy_from_slice(bytemuck::bytes_of(&v)),
        (NumberKind::F64, NumberValue::F64(v)) => slot.copy_from_slice(bytemuck::bytes_of(&v)),
        _ => panic!("number value does not match column subtype"),
    }
}

fn read_number(slot: &[u8], kind: NumberKind) -> NumberValue {
    match kind {
        NumberKind::U8 => NumberValue::U8(slot[0]),
        NumberKind::I8 => NumberValue::I8(slot[0] as i8),
        NumberKind::U16 => NumberValue::U16(bytemuck::pod_read_unaligned(&slot[..2])),
        NumberKind::I16 => NumberValue::I16(bytemuck::pod_read_unaligned(&slot[..2])),
        NumberKind::U32 => NumberValue::U32(bytemuck::pod_read_unaligned(&slot[..4])),
        NumberKind::I32 => NumberValue::I32(bytemuck::pod_read_unaligned(&slot[..4])),
        NumberKind::F32 => NumberValue::F32(bytemuck::pod_read_unaligned(&slot[..4])),
        NumberKind::F64 => NumberValue::F64(bytemuck::pod_read_unaligned(&slot[..8])),
    }
}

// ---------------------------------------------------------------------------
// Boolean
// ---------------------------------------------------------------------------

struct BooleanHandler {
    default: Option<FieldValue>,
}

impl FieldHandler for BooleanHandler {
    fn initialize_storage(&self, capacity: u32) -> ColumnStorage {
        ColumnStorage::Bytes(BytesColumn::new(1, capacity))
    }

    fn set_value(&self, column: &ColumnStorage, entity_id: u32, value: &FieldValue, _entities: &EntityBuffer) {
        if let FieldValue::Boolean(b) = value {
            as_bytes(column).slot(entity_id)[0] = *b as u8;
        }
    }

    fn get_value(&self, column: &ColumnStorage, entity_id: u32, _entities: &EntityBuffer) -> FieldValue {
        FieldValue::Boolean(as_bytes(column).slot(entity_id)[0] != 0)
    }

    fn default_value(&self) -> FieldValue {
        self.default.clone().unwrap_or(FieldValue::Boolean(false))
    }
}

// ---------------------------------------------------------------------------
// String / Binary
// ---------------------------------------------------------------------------

struct StringHandler {
    max_length: u32,
    binary: bool,
    default: Option<FieldValue>,
}

fn write_length_prefixed(slot: &mut [u8], max_length: u32, bytes: &[u8]) {
    let len = bytes.len().min(max_length as usize);
    slot[..4].copy_from_slice(&(len as u32).to_le_bytes());
    slot[4..].fill(0);
    slot[4..4 + len].copy_from_slice(&bytes[..len]);
}

fn read_length_prefixed(slot: &[u8]) -> Vec<u8> {
    let len = u32::from_le_bytes(slot[..4].try_into().unwrap()) as usize;
    let len = len.min(slot.len() - 4);
    slot[4..4 + len].to_vec()
}

impl FieldHandler for StringHandler {
    fn initialize_storage(&self, capacity: u32) -> ColumnStorage {
        ColumnStorage::Bytes(BytesColumn::new(4 + self.max_length as usize, capacity))
    }

    fn set_value(&self, column: &ColumnStorage, entity_id: u32, value: &FieldValue, _entities: &EntityBuffer) {
        let bytes: Vec<u8> = match value {
            FieldValue::Str(s) => s.as_bytes().to_vec(),
            FieldValue::Bytes(b) => b.clone(),
            _ => return,
        };
        write_length_prefixed(as_bytes(column).slot(entity_id), self.max_length, &bytes);
    }

    fn get_value(&self, column: &ColumnStorage, entity_id: u32, _entities: &EntityBuffer) -> FieldValue {
        let bytes = read_length_prefixed(as_bytes(column).slot(entity_id));
        if self.binary {
            FieldValue::Bytes(bytes)
        } else {
            FieldValue::Str(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    fn default_value(&self) -> FieldValue {
        self.default.clone().unwrap_or_else(|| {
            if self.binary {
                FieldValue::Bytes(Vec::new())
            } else {
                FieldValue::Str(String::new())
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Enum
// ---------------------------------------------------------------------------

struct EnumHandler {
    values: Vec<String>,
    default: Option<FieldValue>,
}

impl FieldHandler for EnumHandler {
    fn initialize_storage(&self, capacity: u32) -> ColumnStorage {
        ColumnStorage::Bytes(BytesColumn::new(2, capacity))
    }

    fn set_value(&self, column: &ColumnStorage, entity_id: u32, value: &FieldValue, _entities: &EntityBuffer) {
        let FieldValue::Enum(name) = value else {
            return;
        };
        // Unknown values are ignored (ยง4.3): the column keeps its prior value.
        if let Ok(idx) = self.values.binary_search(name) {
            as_bytes(column)
                .slot(entity_id)
                .copy_from_slice(&(idx as u16).to_le_bytes());
        }
    }

    fn get_value(&self, column: &ColumnStorage, entity_id: u32, _entities: &EntityBuffer) -> FieldValue {
        let slot = as_bytes(column).slot(entity_id);
        let idx = u16::from_le_bytes(slot.try_into().unwrap()) as usize;
        let name = self
            .values
            .get(idx)
            .cloned()
            .unwrap_or_else(|| self.values.first().cloned().unwrap_or_default());
        FieldValue::Enum(name)
    }

    fn default_value(&self) -> FieldValue {
        self.default
            .clone()
            .unwrap_or_else(|| FieldValue::Enum(self.values.first().cloned().unwrap_or_default()))
    }
}

// ---------------------------------------------------------------------------
// Array / Tuple
// ---------------------------------------------------------------------------

struct ArrayHandler {
    element: FieldKind,
    max_length: u32,
    stride: usize,
}

impl FieldHandler for ArrayHandler {
    fn initialize_storage(&self, capacity: u32) -> ColumnStorage {
        ColumnStorage::Bytes(BytesColumn::new(align8(4 + self.max_length as usize * self.stride), capacity))
    }

    fn set_value(&self, column: &ColumnStorage, entity_id: u32, value: &FieldValue, _entities: &EntityBuffer) {
        let FieldValue::Array(items) = value else {
            return;
        };
        let count = items.len().min(self.max_length as usize);
        let slot = as_bytes(column).slot(entity_id);
        slot[4..].fill(0);
        slot[..4].copy_from_slice(&(count as u32).to_le_bytes());
        for (i, item) in items.iter().take(count).enumerate() {
            let elem_slot = &mut slot[4 + i * self.stride..4 + (i + 1) * self.stride];
            write_element(&self.element, elem_slot, item);
        }
    }

    fn get_value(&self, column: &ColumnStorage, entity_id: u32, _entities: &EntityBuffer) -> FieldValue {
        let slot = as_bytes(column).slot(entity_id);
        let count = u32::from_le_bytes(slot[..4].try_into().unwrap()) as usize;
        let count = count.min(self.max_length as usize);
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let elem_slot = &slot[4 + i * self.stride..4 + (i + 1) * self.stride];
            out.push(read_element(&self.element, elem_slot));
        }
        FieldValue::Array(out)
    }

    fn default_value(&self) -> FieldValue {
        FieldValue::Array(Vec::new())
    }
}

struct TupleHandler {
    element: FieldKind,
    length: u32,
    stride: usize,
}

impl FieldHandler for TupleHandler {
    fn initialize_storage(&self, capacity: u32) -> ColumnStorage {
        ColumnStorage::Bytes(BytesColumn::new(align8(self.length as usize * self.stride), capacity))
    }

    fn set_value(&self, column: &ColumnStorage, entity_id: u32, value: &FieldValue, _entities: &EntityBuffer) {
        let FieldValue::Tuple(items) = value else {
            return;
        };
        let slot = as_bytes(column).slot(entity_id);
        for (i, item) in items.iter().take(self.length as usize).enumerate() {
            let elem_slot = &mut slot[i * self.stride..(i + 1) * self.stride];
            write_element(&self.element, elem_slot, item);
        }
    }

    fn get_value(&self, column: &ColumnStorage, entity_id: u32, _entities: &EntityBuffer) -> FieldValue {
        let slot = as_bytes(column).slot(entity_id);
        let mut out = Vec::with_capacity(self.length as usize);
        for i in 0..self.length as usize {
            let elem_slot = &slot[i * self.stride..(i + 1) * self.stride];
            out.push(read_element(&self.element, elem_slot));
        }
        FieldValue::Tuple(out)
    }

    fn default_value(&self) -> FieldValue {
        FieldValue::Tuple((0..self.length).map(|_| default_element(&self.element)).collect())
    }
}

/// Encode one array/tuple element directly into its slot. Elements are
/// restricted to the non-nested, non-`Ref` kinds (ยง3): numbers, booleans,
/// strings, binary blobs, and enums.
fn write_element(kind: &FieldKind, slot: &mut [u8], value: &FieldValue) {
    match (kind, value) {
        (FieldKind::Number(n), FieldValue::Number(v)) => write_number(slot, *n, *v),
        (FieldKind::Boolean, FieldValue::Boolean(b)) => slot[0] = *b as u8,
        (FieldKind::String { max_length }, FieldValue::Str(s)) => {
            write_length_prefixed(slot, *max_length, s.as_bytes())
        }
        (FieldKind::Binary { max_length }, FieldValue::Bytes(b)) => write_length_prefixed(slot, *max_length, b),
        (FieldKind::Enum { values }, FieldValue::Enum(name)) => {
            if let Ok(idx) = values.binary_search(name) {
                slot.copy_from_slice(&(idx as u16).to_le_bytes());
            }
        }
        _ => {}
    }
}

fn read_element(kind: &FieldKind, slot: &[u8]) -> FieldValue {
    match kind {
        FieldKind::Number(n) => FieldValue::Number(read_number(slot, *n)),
        FieldKind::Boolean => FieldValue::Boolean(slot[0] != 0),
        FieldKind::String { .. } => FieldValue::Str(String::from_utf8_lossy(&read_length_prefixed(slot)).into_owned()),
        FieldKind::Binary { .. } => FieldValue::Bytes(read_length_prefixed(slot)),
        FieldKind::Enum { values } => {
            let idx = u16::from_le_bytes(slot.try_into().unwrap()) as usize;
            FieldValue::Enum(values.get(idx).cloned().unwrap_or_else(|| values.first().cloned().unwrap_or_default()))
        }
        FieldKind::Array { .. } | FieldKind::Tuple { .. } | FieldKind::Ref => {
            panic!("nested array/tuple/ref elements are not supported")
        }
    }
}

fn default_element(kind: &FieldKind) -> FieldValue {
    match kind {
        FieldKind::Number(n) => FieldValue::Number(zero_number(*n)),
        FieldKind::Boolean => FieldValue::Boolean(false),
        FieldKind::String { .. } => FieldValue::Str(String::new()),
        FieldKind::Binary { .. } => FieldValue::Bytes(Vec::new()),
        FieldKind::Enum { values } => FieldValue::Enum(values.first().cloned().unwrap_or_default()),
        FieldKind::Array { .. } | FieldKind::Tuple { .. } | FieldKind::Ref => {
            panic!("nested array/tuple/ref elements are not supported")
        }
    }
}

// ---------------------------------------------------------------------------
// Ref
// ---------------------------------------------------------------------------

struct RefHandler;

fn as_ref_column(column: &ColumnStorage) -> &RefColumn {
    match column {
        ColumnStorage::Ref(r) => r,
        ColumnStorage::Bytes(_) => panic!("expected a ref column, found a byte column"),
    }
}

impl FieldHandler for RefHandler {
    fn initialize_storage(&self, capacity: u32) -> ColumnStorage {
        ColumnStorage::Ref(RefColumn::new(capacity))
    }

    fn set_value(&self, column: &ColumnStorage, entity_id: u32, value: &FieldValue, entities: &EntityBuffer) {
        let FieldValue::Ref(target) = value else {
            return;
        };
        let word = match target {
            Some(id) => pack_ref(*id, entities.generation(*id)),
            None => NULL_REF,
        };
        as_ref_column(column).words[entity_id as usize].store(word, Ordering::Release);
    }

    fn get_value(&self, column: &ColumnStorage, entity_id: u32, entities: &EntityBuffer) -> FieldValue {
        let cell = &as_ref_column(column).words[entity_id as usize];
        let word = cell.load(Ordering::Acquire);
        if word == NULL_REF {
            return FieldValue::Ref(None);
        }
        let (target, generation) = unpack_ref(word);
        if entities.has(target) && entities.generation(target) == generation {
            FieldValue::Ref(Some(target))
        } else {
            // Lazily self-nullify the stale reference (ยง3 Refs).
            cell.store(NULL_REF, Ordering::Release);
            FieldValue::Ref(None)
        }
    }

    fn default_value(&self) -> FieldValue {
        FieldValue::Ref(None)
    }
}

/// Construction-time validation matching `EcsError::UnknownFieldKind`.
pub fn validate_kind(kind: &FieldKind) -> Result<(), EcsError> {
    match kind {
        FieldKind::Enum { values } if values.is_empty() => Err(EcsError::UnknownFieldKind {
            detail: "enum field declared with no values".to_owned(),
        }),
        FieldKind::Array { element, .. } | FieldKind::Tuple { element, .. } => validate_kind(element),
        _ => Ok(()),
    }
}

fn value_matches_kind(kind: &FieldKind, value: &FieldValue) -> bool {
    match (kind, value) {
        (FieldKind::Number(_), FieldValue::Number(_)) => true,
        (FieldKind::Boolean, FieldValue::Boolean(_)) => true,
        (FieldKind::String { .. }, FieldValue::Str(_)) => true,
        (FieldKind::Binary { .. }, FieldValue::Bytes(_)) => true,
        (FieldKind::Enum { values }, FieldValue::Enum(v)) => values.binary_search(v).is_ok(),
        (FieldKind::Array { element, .. }, FieldValue::Array(items)) => {
            items.iter().all(|item| value_matches_kind(element, item))
        }
        (FieldKind::Tuple { element, .. }, FieldValue::Tuple(items)) => {
            items.iter().all(|item| value_matches_kind(element, item))
        }
        (FieldKind::Ref, FieldValue::Ref(_)) => true,
        _ => false,
    }
}

/// Validate a schema's declared default against its field kind
/// (ยง7 `EcsError::FieldEncoding`).
pub fn validate_default(kind: &FieldKind, default: &FieldValue) -> Result<(), EcsError> {
    if value_matches_kind(kind, default) {
        Ok(())
    } else {
        Err(EcsError::FieldEncoding {
            detail: format!("declared default {default:?} does not match field kind {kind:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_roundtrip() {
        let handler = handler_for(&FieldKind::Number(NumberKind::F32), None);
        let column = handler.initialize_storage(4);
        let entities = EntityBuffer::new(4, 1);
        handler.set_value(&column, 1, &FieldValue::Number(NumberValue::F32(3.5)), &entities);
        assert_eq!(
            handler.get_value(&column, 1, &entities),
            FieldValue::Number(NumberValue::F32(3.5))
        );
    }

    #[test]
    fn string_truncates_to_max_length() {
        let handler = handler_for(&FieldKind::string(4), None);
        let column = handler.initialize_storage(2);
        let entities = EntityBuffer::new(2, 1);
        handler.set_value(&column, 0, &FieldValue::Str("hello world".to_owned()), &entities);
        assert_eq!(
            handler.get_value(&column, 0, &entities),
            FieldValue::Str("hell".to_owned())
        );
    }

    #[test]
    fn enum_unknown_value_ignored() {
        let handler = handler_for(&FieldKind::enum_of(vec!["b".into(), "a".into()]), None);
        let column = handler.initialize_storage(1);
        let entities = EntityBuffer::new(1, 1);
        handler.set_value(&column, 0, &FieldValue::Enum("a".into()), &entities);
        handler.set_value(&column, 0, &FieldValue::Enum("nope".into()), &entities);
        assert_eq!(handler.get_value(&column, 0, &entities), FieldValue::Enum("a".into()));
    }

    #[test]
    fn ref_self_nullifies_on_stale_generation() {
        let handler = handler_for(&FieldKind::Ref, None);
        let column = handler.initialize_storage(4);
        let entities = EntityBuffer::new(4, 1);
        entities.create(2);
        handler.set_value(&column, 0, &FieldValue::Ref(Some(2)), &entities);
        assert_eq!(handler.get_value(&column, 0, &entities), FieldValue::Ref(Some(2)));

        entities.mark_dead(2); // bumps the generation
        entities.create(2); // id 2 is reused by a new entity
        assert_eq!(handler.get_value(&column, 0, &entities), FieldValue::Ref(None));
    }

    #[test]
    fn ref_null_sentinel_roundtrips() {
        let handler = handler_for(&FieldKind::Ref, None);
        let column = handler.initialize_storage(2);
        let entities = EntityBuffer::new(2, 1);
        assert_eq!(handler.get_value(&column, 0, &entities), FieldValue::Ref(None));
    }

    #[test]
    fn pack_unpack_ref_roundtrip() {
        let word = pack_ref(12345, 77);
        assert_eq!(unpack_ref(word), (12345, 77));
    }

    #[test]
    fn mismatched_default_rejected() {
        let result = validate_default(&FieldKind::Number(NumberKind::F32), &FieldValue::Boolean(true));
        assert!(matches!(result, Err(EcsError::FieldEncoding { .. })));
    }

    #[test]
    fn matching_default_accepted() {
        let result = validate_default(&FieldKind::Number(NumberKind::F32), &FieldValue::Number(NumberValue::F32(1.0)));
        assert!(result.is_ok());
    }
}
