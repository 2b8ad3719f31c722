//! GGUF container writer (metadata only).
//!
//! Files carry a valid header and key/value metadata but a tensor count of zero,
//! so llama.cpp and similar runtimes will parse them and then refuse to load a model.
//! The bigram engine has no transformer weights to lay out as GGUF tensors.

use std::io::{self, Write};

const MAGIC: &[u8; 4] = b"GGUF";
const VERSION: u32 = 3;
const TYPE_UINT32: u32 = 4;
const TYPE_STRING: u32 = 8;

/// Quantization schemes accepted for the interchange export.
pub const QUANTIZATIONS: &[(&str, u32)] = &[("f16", 1), ("q8_0", 7), ("q4_k_m", 15), ("q5_k_m", 17)];

pub fn file_type(quantization: &str) -> Option<u32> {
    QUANTIZATIONS.iter().find(|(name, _)| name.eq_ignore_ascii_case(quantization)).map(|(_, t)| *t)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U32(u32),
    Str(String),
}

fn write_str(out: &mut impl Write, s: &str) -> io::Result<()> {
    out.write_all(&(s.len() as u64).to_le_bytes())?;
    out.write_all(s.as_bytes())
}

/// Write a GGUF header with `metadata` and no tensors.
pub fn write(out: &mut impl Write, metadata: &[(&str, Value)]) -> io::Result<()> {
    out.write_all(MAGIC)?;
    out.write_all(&VERSION.to_le_bytes())?;
    out.write_all(&0u64.to_le_bytes())?;
    out.write_all(&(metadata.len() as u64).to_le_bytes())?;
    for (key, value) in metadata {
        write_str(out, key)?;
        match value {
            Value::U32(v) => {
                out.write_all(&TYPE_UINT32.to_le_bytes())?;
                out.write_all(&v.to_le_bytes())?;
            }
            Value::Str(s) => {
                out.write_all(&TYPE_STRING.to_le_bytes())?;
                write_str(out, s)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut buf = Vec::new();
        write(&mut buf, &[("general.architecture", Value::Str("llama".to_string())), ("general.file_type", Value::U32(15))])
            .unwrap();

        assert_eq!(&buf[..4], b"GGUF");
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 3);
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), 0);
        assert_eq!(u64::from_le_bytes(buf[16..24].try_into().unwrap()), 2);
        let key_len = u64::from_le_bytes(buf[24..32].try_into().unwrap()) as usize;
        assert_eq!(&buf[32..32 + key_len], b"general.architecture");
    }

    #[test]
    fn test_known_quantizations() {
        assert_eq!(file_type("Q4_K_M"), Some(15));
        assert_eq!(file_type("q3_k_s"), None);
    }
}
