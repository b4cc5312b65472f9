//! Tagged 64-bit [`Value`] representation and heap object accessors
//! (spec.md §3 "Tagged Value" / "Heap Object", §4.1).
//!
//! Grounded on `trax_obj.py`'s `TraxObject`: the exact tag bit patterns are
//! carried over verbatim, with the Nil/Bool assignment fixed per spec.md §3
//! (`Nil = 1`, `Bool = 2` — one of the two conventions the original source
//! disagreed with itself about; see SPEC_FULL.md §6).

use crate::error::GuestPanic;
use static_assertions::const_assert_eq;

/// Low-3-bit tag values. Integers are recognized by bit 0 alone; the other
/// three forms share bit 1 set and are told apart by the full 3 bits.
const INTEGER_TAG: i64 = 0b000;
pub(crate) const NIL_TAG: i64 = 0b001;
pub(crate) const FALSE_TAG: i64 = 0b011;
pub(crate) const OBJECT_TAG: i64 = 0b101;
pub(crate) const TRUE_TAG: i64 = 0b111;

pub(crate) const TAG_MASK: i64 = 0b111;
pub(crate) const BOOL_CHECK_MASK: i64 = 0b011;
const PTR_MASK: i64 = !0b111;

const_assert_eq!(NIL_TAG & 1, 1);
const_assert_eq!(TRUE_TAG & BOOL_CHECK_MASK, BOOL_CHECK_MASK);
const_assert_eq!(FALSE_TAG & BOOL_CHECK_MASK, BOOL_CHECK_MASK);
const_assert_eq!(OBJECT_TAG & BOOL_CHECK_MASK, OBJECT_TAG & BOOL_CHECK_MASK);

/// Built-in type indices (spec.md §3 "Heap Object").
pub const TYPE_INT: u32 = 0;
pub const TYPE_NIL: u32 = 1;
pub const TYPE_BOOL: u32 = 2;
/// User struct types are numbered from here, in declaration order.
pub const FIRST_USER_TYPE: u32 = 3;

/// A tagged 64-bit value: an integer, nil, a boolean, or a pointer to a
/// [`HeapObject`] record.
///
/// Values are immutable by identity — `Value` is `Copy`. Object *fields*
/// are mutable through [`HeapObject::set_field`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Value(i64);

impl Value {
    pub const NIL: Value = Value(NIL_TAG);
    pub const TRUE: Value = Value(TRUE_TAG);
    pub const FALSE: Value = Value(FALSE_TAG);

    /// Wrap a raw tagged word. Only used by code that has already produced
    /// a well-formed tag (the recorder's exit-buffer restore, codegen
    /// tests); everything else should go through `from_int`/`from_bool`/
    /// `from_object`.
    pub const fn from_raw(raw: i64) -> Self {
        Value(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    /// `from_int(n) = n << 1`. Caller ensures `n` fits in 63 bits.
    #[inline]
    pub const fn from_int(n: i64) -> Self {
        Value(n.wrapping_shl(1))
    }

    #[inline]
    pub const fn from_bool(b: bool) -> Self {
        if b {
            Value::TRUE
        } else {
            Value::FALSE
        }
    }

    /// Build a tagged pointer to an 8-byte-aligned heap object.
    ///
    /// # Safety
    /// `ptr` must be 8-byte aligned and point to a live [`HeapObject`]
    /// record (type_index word followed by its fields) for as long as the
    /// resulting `Value` is used as an object.
    #[inline]
    pub unsafe fn from_object_ptr(ptr: *mut i64) -> Self {
        debug_assert_eq!(ptr as i64 & TAG_MASK, 0, "object pointer must be 8-byte aligned");
        Value((ptr as i64) | OBJECT_TAG)
    }

    #[inline]
    pub const fn is_integer(self) -> bool {
        self.0 & 1 == 0
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 & TAG_MASK == NIL_TAG
    }

    #[inline]
    pub fn is_true(self) -> bool {
        self.0 & TAG_MASK == TRUE_TAG
    }

    #[inline]
    pub fn is_false(self) -> bool {
        self.0 & TAG_MASK == FALSE_TAG
    }

    #[inline]
    pub fn is_boolean(self) -> bool {
        self.is_true() || self.is_false()
    }

    #[inline]
    pub fn is_object(self) -> bool {
        self.0 & TAG_MASK == OBJECT_TAG
    }

    /// `to_int(v) = arith-shift-right(v, 1)`, defined only for integers.
    #[inline]
    pub fn to_int(self) -> Result<i64, GuestPanic> {
        if self.is_integer() {
            Ok(self.0 >> 1)
        } else {
            Err(GuestPanic::NotAnInteger)
        }
    }

    #[inline]
    pub fn to_bool(self) -> Result<bool, GuestPanic> {
        if self.is_boolean() {
            Ok(self.is_true())
        } else {
            Err(GuestPanic::NotABoolean)
        }
    }

    /// Mask out the tag bits to recover the 8-byte-aligned object address.
    #[inline]
    pub fn object_ptr(self) -> Result<*mut i64, GuestPanic> {
        if self.is_object() {
            Ok((self.0 & PTR_MASK) as *mut i64)
        } else {
            Err(GuestPanic::NotAnObject)
        }
    }

    /// `type_index(v)`: 0 for integers, 2 for booleans, 1 for nil, else the
    /// object's header word.
    pub fn type_index(self) -> u32 {
        if self.is_integer() {
            TYPE_INT
        } else if self.is_boolean() {
            TYPE_BOOL
        } else if self.is_nil() {
            TYPE_NIL
        } else {
            // Safety: is_object() is the only remaining tag value.
            unsafe { HeapObject::from_ptr(self.object_ptr().expect("object")).type_index() }
        }
    }

    /// Read field `i` of an object value (spec.md §4.1 `get_field`).
    pub fn get_field(self, field_index: u32) -> Result<Value, GuestPanic> {
        let obj = unsafe { HeapObject::from_ptr(self.object_ptr()?) };
        obj.get_field(field_index)
    }

    /// Write field `i` of an object value.
    pub fn set_field(self, field_index: u32, value: Value) -> Result<(), GuestPanic> {
        let obj = unsafe { HeapObject::from_ptr(self.object_ptr()?) };
        obj.set_field(field_index, value)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_integer() {
            write!(f, "Integer({})", self.0 >> 1)
        } else if self.is_nil() {
            write!(f, "Nil")
        } else if self.is_true() {
            write!(f, "True")
        } else if self.is_false() {
            write!(f, "False")
        } else {
            write!(f, "Object(0x{:x})", self.0 & PTR_MASK)
        }
    }
}

/// A view over a heap object: a contiguous array of 64-bit words where
/// word 0 is the `type_index` and words `1..=n_fields` are the field slots
/// (spec.md §3 "Heap Object").
#[derive(Clone, Copy)]
pub struct HeapObject {
    ptr: *mut i64,
}

impl HeapObject {
    /// # Safety
    /// `ptr` must point to a live, properly laid-out object record.
    pub unsafe fn from_ptr(ptr: *mut i64) -> Self {
        HeapObject { ptr }
    }

    pub fn type_index(self) -> u32 {
        unsafe { *self.ptr as u32 }
    }

    pub fn get_field(self, field_index: u32) -> Result<Value, GuestPanic> {
        // Field bounds are not tracked at this layer (the type's declared
        // field count lives in the bytecode compiler, out of scope per
        // spec.md §1); callers that can't prove the index in range should
        // check against the struct's declared arity before calling.
        let word = unsafe { *self.ptr.add(1 + field_index as usize) };
        Ok(Value::from_raw(word))
    }

    pub fn set_field(self, field_index: u32, value: Value) -> Result<(), GuestPanic> {
        unsafe {
            *self.ptr.add(1 + field_index as usize) = value.raw();
        }
        Ok(())
    }

    /// Initialize a freshly allocated record: write the header then the
    /// fields in order (spec.md §3 `New` instruction semantics).
    pub fn init(ptr: *mut i64, type_index: u32, fields: &[Value]) -> Self {
        unsafe {
            *ptr = type_index as i64;
            for (i, v) in fields.iter().enumerate() {
                *ptr.add(1 + i) = v.raw();
            }
        }
        HeapObject { ptr }
    }

    pub fn as_value(self) -> Value {
        unsafe { Value::from_object_ptr(self.ptr) }
    }
}
