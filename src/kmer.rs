// ========================================================================================
//
//                         CANONICAL 2-BIT K-MER ENCODING
//
// ========================================================================================
//
// A k-mer is packed most-significant-base first, two bits per base:
//
//     A -> 00    C -> 01    G -> 10    T -> 11
//
// With this alphabet order, numeric order of codes equals lexicographic order of the
// strings, and complementing a base is `bits ^ 0b11`. A `KmerCode` can only be obtained
// through `KmerCodec`, which always returns the smaller of the forward and
// reverse-complement packings. Both strands therefore map to one identity.

use std::fmt;
use thiserror::Error;

/// The largest k whose packing fits in a `u64`.
pub const MAX_K: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("invalid nucleotide {found:?} at position {position}")]
    InvalidCharacter { position: usize, found: char },
    #[error("k-mer length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("k must be between 1 and {MAX_K}, got {0}")]
    UnsupportedK(usize),
    #[error("code {code:#x} does not fit in {bits} bits")]
    CodeOutOfRange { code: u64, bits: usize },
}

/// The canonical packed form of a k-mer.
///
/// The inner value is private: every `KmerCode` in the program went through
/// canonicalization, so two codes are equal iff the k-mers are equal up to strand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct KmerCode(u64);

impl KmerCode {
    #[inline(always)]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for KmerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[inline(always)]
const fn encode_base(base: u8) -> Option<u64> {
    match base {
        b'A' | b'a' => Some(0b00),
        b'C' | b'c' => Some(0b01),
        b'G' | b'g' => Some(0b10),
        b'T' | b't' => Some(0b11),
        _ => None,
    }
}

#[inline(always)]
const fn decode_base(bits: u64) -> u8 {
    match bits & 0b11 {
        0b00 => b'A',
        0b01 => b'C',
        0b10 => b'G',
        _ => b'T',
    }
}

/// Encoder/decoder for one fixed k.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmerCodec {
    k: usize,
    mask: u64,
}

impl KmerCodec {
    pub fn new(k: usize) -> Result<Self, EncodingError> {
        if k == 0 || k > MAX_K {
            return Err(EncodingError::UnsupportedK(k));
        }
        let mask = if k == MAX_K {
            u64::MAX
        } else {
            (1u64 << (2 * k)) - 1
        };
        Ok(Self { k, mask })
    }

    #[inline(always)]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Packs `sequence` and returns its canonical code.
    pub fn encode(&self, sequence: &[u8]) -> Result<KmerCode, EncodingError> {
        if sequence.len() != self.k {
            return Err(EncodingError::LengthMismatch {
                expected: self.k,
                actual: sequence.len(),
            });
        }
        let mut forward = 0u64;
        for (position, &base) in sequence.iter().enumerate() {
            let bits = encode_base(base).ok_or(EncodingError::InvalidCharacter {
                position,
                found: base as char,
            })?;
            forward = (forward << 2) | bits;
        }
        Ok(self.canonical_of(forward))
    }

    pub fn encode_str(&self, sequence: &str) -> Result<KmerCode, EncodingError> {
        self.encode(sequence.as_bytes())
    }

    /// Canonicalizes a raw packing read from storage, which may be either strand.
    pub fn canonicalize(&self, raw: u64) -> Result<KmerCode, EncodingError> {
        if raw & !self.mask != 0 {
            return Err(EncodingError::CodeOutOfRange {
                code: raw,
                bits: 2 * self.k,
            });
        }
        Ok(self.canonical_of(raw))
    }

    /// Unpacks a canonical code back into its (canonical) sequence.
    pub fn decode(&self, code: KmerCode) -> String {
        let raw = code.get();
        (0..self.k)
            .map(|i| decode_base(raw >> (2 * (self.k - 1 - i))) as char)
            .collect()
    }

    #[inline(always)]
    fn canonical_of(&self, forward: u64) -> KmerCode {
        KmerCode(forward.min(self.reverse_complement_bits(forward)))
    }

    /// Reverse complement of a packing: complement every base, then reverse the
    /// order of the 2-bit groups across the whole word and drop the unused high groups.
    #[inline(always)]
    fn reverse_complement_bits(&self, forward: u64) -> u64 {
        let mut x = !forward;
        x = ((x >> 2) & 0x3333_3333_3333_3333) | ((x & 0x3333_3333_3333_3333) << 2);
        x = ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0F) | ((x & 0x0F0F_0F0F_0F0F_0F0F) << 4);
        x = x.swap_bytes();
        x >> (64 - 2 * self.k)
    }
}

/// Reverse complement of a nucleotide string. Unknown symbols are passed through.
pub fn reverse_complement(sequence: &[u8]) -> Vec<u8> {
    sequence
        .iter()
        .rev()
        .map(|&base| match base {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            b'a' => b't',
            b'c' => b'g',
            b'g' => b'c',
            b't' => b'a',
            other => other,
        })
        .collect()
}
