use memmap2::{Mmap, MmapOptions};
use std::io;

/// A read-only, executable copy of generated machine code.
///
/// Every block gets its own mapping: code shared between cores is never remapped writable while
/// it could be executing, and the memory goes away together with the last reference to it.
pub struct ExecutableCode {
    mapping: Mmap,
}

impl ExecutableCode {
    pub fn new(code: &[u8]) -> io::Result<Self> {
        let mut mapping = MmapOptions::new().len(code.len().max(1)).map_anon()?;
        mapping[..code.len()].copy_from_slice(code);

        Ok(Self {
            mapping: mapping.make_exec()?,
        })
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.mapping.as_ptr()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.mapping.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_is_copied() {
        let code = ExecutableCode::new(&[0xC3, 0x90, 0x90]).unwrap();
        assert!(code.size() >= 3);
        assert_eq!(
            unsafe { std::slice::from_raw_parts(code.as_ptr(), 3) },
            &[0xC3, 0x90, 0x90]
        );
    }
}
