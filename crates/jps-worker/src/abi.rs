//! ABI entry selection
//!
//! A class belongs to the ABI archive when its header declares it public and
//! not synthetic. Only the constant pool is walked to reach the access flags.

const MAGIC: u32 = 0xCAFE_BABE;
pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_SYNTHETIC: u16 = 0x1000;

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Access flags of a class file, `None` if the bytes are not a class file
pub fn class_access_flags(bytes: &[u8]) -> Option<u16> {
    let mut reader = Reader { bytes, pos: 0 };
    if reader.u32()? != MAGIC {
        return None;
    }
    reader.take(4)?; // minor, major

    let count = reader.u16()?;
    let mut index = 1;
    while index < count {
        let tag = reader.u8()?;
        let size = match tag {
            1 => reader.u16()? as usize,
            3 | 4 | 9 | 10 | 11 | 12 | 17 | 18 => 4,
            5 | 6 => {
                // long and double take two slots
                index += 1;
                8
            }
            7 | 8 | 16 | 19 | 20 => 2,
            15 => 3,
            _ => return None,
        };
        reader.take(size)?;
        index += 1;
    }
    reader.u16()
}

/// Whether an archive entry is part of the public API surface
pub fn is_abi_entry(name: &str, content: &[u8]) -> bool {
    if name.ends_with(".kotlin_module") {
        return true;
    }
    if !name.ends_with(".class") {
        return false;
    }
    class_access_flags(content)
        .is_some_and(|flags| flags & ACC_PUBLIC != 0 && flags & ACC_SYNTHETIC == 0)
}

/// Minimal class file with the given access flags
#[cfg(test)]
pub(crate) fn class_bytes(name: &str, flags: u16) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&MAGIC.to_be_bytes());
    bytes.extend_from_slice(&[0, 0, 0, 61]);
    bytes.extend_from_slice(&5u16.to_be_bytes());
    // #1 Utf8 name, #2 Class #1, #3-#4 Long
    bytes.push(1);
    bytes.extend_from_slice(&(name.len() as u16).to_be_bytes());
    bytes.extend_from_slice(name.as_bytes());
    bytes.extend_from_slice(&[7, 0, 1]);
    bytes.push(5);
    bytes.extend_from_slice(&42u64.to_be_bytes());
    bytes.extend_from_slice(&flags.to_be_bytes());
    bytes.extend_from_slice(&2u16.to_be_bytes());
    bytes
}
