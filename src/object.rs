//! The machine word: a single 64-bit slot every stack cell holds.

use std::fmt::{Debug, Display, Formatter};

/// Size of one stack cell in bytes. Pushes, pops and stack-relative
/// indexing all move in these units.
pub const OBJECT_SIZE: u64 = 8;

/// One 64-bit word with three views: unsigned, signed two's-complement,
/// and opaque host handle. No tag is stored; the executing instruction
/// decides which view applies.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Object(u64);

impl Object {
    pub fn from_unsigned(value: u64) -> Self {
        Object(value)
    }

    pub fn from_signed(value: i64) -> Self {
        Object(value as u64)
    }

    pub fn from_handle(handle: Handle) -> Self {
        Object(handle.raw())
    }

    /// The all-zero word, doubling as the null handle.
    pub fn null() -> Self {
        Object(0)
    }

    pub fn as_unsigned(self) -> u64 {
        self.0
    }

    pub fn as_signed(self) -> i64 {
        self.0 as i64
    }

    pub fn as_handle(self) -> Handle {
        Handle::from_raw(self.0)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Object(u64::from_le_bytes(bytes))
    }
}

impl Debug for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Object({:#018X})", self.0)
    }
}

impl Display for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque host handle carried inside an [`Object`]. Module handles are
/// identifiers minted by the native loader; resolved function handles
/// are raw entry-point addresses. The machine never interprets either,
/// it only tests for null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_alias_the_same_bits() {
        let word = Object::from_signed(-1);
        assert_eq!(word.as_unsigned(), u64::MAX);
        assert_eq!(word.as_signed(), -1);
        assert_eq!(word.as_handle(), Handle::from_raw(u64::MAX));
    }

    #[test]
    fn null_word_is_null_in_every_view() {
        let word = Object::null();
        assert!(word.is_null());
        assert!(word.as_handle().is_null());
        assert_eq!(word.as_unsigned(), 0);
    }

    #[test]
    fn le_bytes_roundtrip() {
        let word = Object::from_unsigned(0x0102030405060708);
        assert_eq!(word.to_le_bytes()[0], 0x08);
        assert_eq!(Object::from_le_bytes(word.to_le_bytes()), word);
    }
}
