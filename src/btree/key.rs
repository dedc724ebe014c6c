use crate::errors::Error;
use anyhow::{bail, Result};
use std::cmp::Ordering;

/// Key part types understood by the index layer. Only [`Int`] and
/// [`VarString`] are implemented; descriptors naming any other type are
/// rejected up front.
///
/// [`Int`]: KeyPartType::Int
/// [`VarString`]: KeyPartType::VarString
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPartType {
    Short,
    Int,
    Long,
    String,
    VarString,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyPart {
    pub part_type: KeyPartType,
    /// Declared width; for varstrings this is the maximum length.
    pub length: u16,
}

/// Schema of a composite index key: an ordered list of typed parts.
#[derive(Debug, Clone)]
pub struct KeyDesc {
    pub parts: Vec<KeyPart>,
}

impl KeyDesc {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self { parts }
    }

    pub fn single_int() -> Self {
        Self::new(vec![KeyPart {
            part_type: KeyPartType::Int,
            length: 4,
        }])
    }

    pub fn single_varstring(max_len: u16) -> Self {
        Self::new(vec![KeyPart {
            part_type: KeyPartType::VarString,
            length: max_len,
        }])
    }

    pub fn check_supported(&self) -> Result<()> {
        for part in &self.parts {
            match part.part_type {
                KeyPartType::Int | KeyPartType::VarString => {}
                _ => bail!(Error::UnsupportedKeyType),
            }
        }
        Ok(())
    }
}

/// A key value as stored in index entries: the concatenation of its encoded
/// parts. Integer parts are 4 little-endian bytes; varstring parts carry a
/// 2-byte length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    val: Vec<u8>,
}

impl KeyValue {
    pub fn new(val: Vec<u8>) -> Self {
        Self { val }
    }

    pub fn from_i32(v: i32) -> Self {
        Self {
            val: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_varstring(s: &[u8]) -> Self {
        let mut val = Vec::with_capacity(2 + s.len());
        val.extend_from_slice(&(s.len() as u16).to_le_bytes());
        val.extend_from_slice(s);
        Self { val }
    }

    /// Append another encoded part; used to build composite keys.
    pub fn push_i32(mut self, v: i32) -> Self {
        self.val.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.val.len()
    }

    pub fn is_empty(&self) -> bool {
        self.val.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.val
    }
}

/// Compare two encoded keys part by part under `kdesc`. Integers compare in
/// natural numeric order, varstrings lexicographically (shorter prefixes
/// first). Callers validate the descriptor before comparing.
pub fn key_compare(kdesc: &KeyDesc, a: &[u8], b: &[u8]) -> Ordering {
    let mut pos_a = 0usize;
    let mut pos_b = 0usize;

    for part in &kdesc.parts {
        let ord = match part.part_type {
            KeyPartType::Int => {
                let va = i32::from_le_bytes(a[pos_a..pos_a + 4].try_into().unwrap());
                let vb = i32::from_le_bytes(b[pos_b..pos_b + 4].try_into().unwrap());
                pos_a += 4;
                pos_b += 4;
                va.cmp(&vb)
            }
            KeyPartType::VarString => {
                let la = u16::from_le_bytes(a[pos_a..pos_a + 2].try_into().unwrap()) as usize;
                let lb = u16::from_le_bytes(b[pos_b..pos_b + 2].try_into().unwrap()) as usize;
                let sa = &a[pos_a + 2..pos_a + 2 + la];
                let sb = &b[pos_b + 2..pos_b + 2 + lb];
                pos_a += 2 + la;
                pos_b += 2 + lb;
                sa.cmp(sb)
            }
            // descriptors are validated before any comparison runs
            _ => unreachable!("unsupported key part type"),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}
