use std::cmp::Ordering;
use std::convert::TryInto;

use crate::{Key, DATA_SIZE, KEY_SIZE, RECORD_SIZE};

/// A 128-bit sketch, most significant bit first within each byte.
pub type Code = [u8; DATA_SIZE];

/// One fixed-width on-disk record: the code followed by its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Record {
    pub code: Code,
    pub key: Key,
}

impl Record {
    pub fn new(code: Code, key: Key) -> Self {
        Self { code, key }
    }

    /// Decode a record from exactly `RECORD_SIZE` bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), RECORD_SIZE, "record slice has wrong length");
        let code: Code = bytes[..DATA_SIZE].try_into().expect("code of length 16");
        let key = Key::from_le_bytes(
            bytes[DATA_SIZE..]
                .try_into()
                .expect("key of length 4"),
        );
        Self { code, key }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[..DATA_SIZE].copy_from_slice(&self.code);
        out[DATA_SIZE..DATA_SIZE + KEY_SIZE].copy_from_slice(&self.key.to_le_bytes());
        out
    }
}

/// Read the code of an encoded record without copying the key.
#[inline]
pub(crate) fn code_of(bytes: &[u8]) -> &Code {
    bytes[..DATA_SIZE].try_into().expect("record holds a full code")
}

/// Read the key of an encoded record.
#[inline]
pub(crate) fn key_of(bytes: &[u8]) -> Key {
    Key::from_le_bytes(
        bytes[DATA_SIZE..DATA_SIZE + KEY_SIZE]
            .try_into()
            .expect("record holds a full key"),
    )
}

/// Number of differing bits between two codes.
#[inline]
pub fn hamming(a: &Code, b: &Code) -> u32 {
    (u128::from_ne_bytes(*a) ^ u128::from_ne_bytes(*b)).count_ones()
}

/// The code as one big-endian integer rotated left by `first` bits, i.e. the
/// bit string as seen from partition `first`.
#[inline]
pub fn rotated(code: &Code, first: u32) -> u128 {
    u128::from_be_bytes(*code).rotate_left(first)
}

/// Order two codes as bit strings read from bit `first` with wraparound.
///
/// Data files of partition `first` are sorted by this order.
pub fn rotated_cmp(a: &Code, b: &Code, first: u32) -> Ordering {
    rotated(a, first).cmp(&rotated(b, first))
}

/// Hexadecimal rendering of a code.
pub fn format_code(code: &Code) -> String {
    code.iter().map(|byte| format!("{byte:02X}")).collect()
}
