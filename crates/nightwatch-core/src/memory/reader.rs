use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Error, Result};

/// Width of a scalar field in the target's memory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Width {
    #[default]
    I32,
    I64,
}

impl Width {
    pub fn size(self) -> usize {
        match self {
            Width::I32 => 4,
            Width::I64 => 8,
        }
    }
}

/// Raw read access to a process address space.
pub trait ReadMemory {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    fn read_i32(&self, address: u64) -> Result<i32> {
        Ok(i32::from_le_bytes(read_array(self, address)?))
    }

    fn read_i64(&self, address: u64) -> Result<i64> {
        Ok(i64::from_le_bytes(read_array(self, address)?))
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        Ok(u64::from_le_bytes(read_array(self, address)?))
    }

    /// Read a scalar of the given width, sign-extended to `i64`.
    fn read_scalar(&self, address: u64, width: Width) -> Result<i64> {
        match width {
            Width::I32 => self.read_i32(address).map(i64::from),
            Width::I64 => self.read_i64(address),
        }
    }
}

fn read_array<M: ReadMemory + ?Sized, const N: usize>(memory: &M, address: u64) -> Result<[u8; N]> {
    let bytes = memory.read_bytes(address, N)?;
    bytes.as_slice().try_into().map_err(|_| {
        Error::read_failed(address, format!("short read: {} of {} bytes", bytes.len(), N))
    })
}

/// Raw write access to a process address space.
pub trait WriteMemory {
    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()>;

    fn write_i32(&self, address: u64, value: i32) -> Result<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    fn write_i64(&self, address: u64, value: i64) -> Result<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    /// Write a scalar of the given width. Values that do not fit are rejected.
    fn write_scalar(&self, address: u64, width: Width, value: i64) -> Result<()> {
        match width {
            Width::I32 => {
                let narrow = i32::try_from(value).map_err(|_| {
                    Error::write_failed(address, format!("{value} does not fit in i32"))
                })?;
                self.write_i32(address, narrow)
            }
            Width::I64 => self.write_i64(address, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Bytes(RefCell<HashMap<u64, u8>>);

    impl ReadMemory for Bytes {
        fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
            let map = self.0.borrow();
            (0..size as u64)
                .map(|i| {
                    map.get(&(address + i))
                        .copied()
                        .ok_or_else(|| Error::read_failed(address, "unmapped"))
                })
                .collect()
        }
    }

    impl WriteMemory for Bytes {
        fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
            let mut map = self.0.borrow_mut();
            for (i, b) in data.iter().enumerate() {
                map.insert(address + i as u64, *b);
            }
            Ok(())
        }
    }

    #[test]
    fn test_scalar_sign_extension() {
        let mem = Bytes::default();
        mem.write_i32(0x10, -5).unwrap();
        assert_eq!(mem.read_scalar(0x10, Width::I32).unwrap(), -5);
    }

    #[test]
    fn test_i64_scalar() {
        let mem = Bytes::default();
        mem.write_scalar(0x20, Width::I64, 1 << 40).unwrap();
        assert_eq!(mem.read_scalar(0x20, Width::I64).unwrap(), 1 << 40);
        assert_eq!(mem.read_u64(0x20).unwrap(), 1 << 40);
    }

    #[test]
    fn test_narrowing_write_rejected() {
        let mem = Bytes::default();
        let err = mem.write_scalar(0x30, Width::I32, i64::MAX).unwrap_err();
        assert!(matches!(err, Error::MemoryWriteFailed { address: 0x30, .. }));
    }

    #[test]
    fn test_unmapped_read_fails() {
        let mem = Bytes::default();
        assert!(mem.read_i32(0x40).is_err());
    }

    #[test]
    fn test_width_parse() {
        assert_eq!("i64".parse::<Width>().unwrap(), Width::I64);
        assert_eq!(Width::I32.size(), 4);
    }
}
