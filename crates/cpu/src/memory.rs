//! Guest memory shared by all cores.
//!
//! The image is stored as big-endian words in atomics, so every core can access it without
//! locking. Accesses that fit in a single aligned word are atomic, wider or misaligned ones are
//! performed byte by byte.
use std::sync::atomic::{AtomicU32, Ordering};

/// A value that can be read from or written to guest memory.
pub trait Primitive: Copy + Default + Send + 'static {
    /// Size, in bytes.
    const SIZE: u32;

    /// Builds a value from its big-endian bytes, given in the low `SIZE` bytes of `bits`.
    fn from_bits(bits: u64) -> Self;

    /// Returns the bytes of this value in the low `SIZE` bytes of the result.
    fn to_bits(self) -> u64;
}

macro_rules! primitive {
    ($($ty:ty => $unsigned:ty),* $(,)?) => {
        $(
            impl Primitive for $ty {
                const SIZE: u32 = size_of::<$ty>() as u32;

                #[inline(always)]
                fn from_bits(bits: u64) -> Self {
                    bits as $unsigned as $ty
                }

                #[inline(always)]
                fn to_bits(self) -> u64 {
                    self as $unsigned as u64
                }
            }
        )*
    };
}

primitive! {
    u8 => u8, u16 => u16, u32 => u32, u64 => u64,
    i8 => u8, i16 => u16, i32 => u32,
}

/// A flat, big-endian guest memory image covering `base..base + size`.
pub struct Memory {
    base: u32,
    len: u32,
    words: Box<[AtomicU32]>,
}

impl Memory {
    /// Creates a zeroed image. `size` is rounded up to a multiple of 4.
    pub fn new(base: u32, size: u32) -> Self {
        let words = size.div_ceil(4);
        debug_assert!(
            base.checked_add((words * 4).saturating_sub(1)).is_some(),
            "memory range overflows the address space"
        );

        Self {
            base,
            len: words * 4,
            words: std::iter::repeat_with(|| AtomicU32::new(0))
                .take(words as usize)
                .collect(),
        }
    }

    #[inline(always)]
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Size of the image, in bytes.
    #[inline(always)]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns the offset of `addr` into the image if `addr..addr + len` is inside it.
    #[inline(always)]
    fn offset(&self, addr: u32, len: u32) -> Option<u32> {
        let offset = addr.checked_sub(self.base)?;
        (offset.checked_add(len)? <= self.len).then_some(offset)
    }

    /// Whether `addr..addr + len` is inside the image.
    #[inline(always)]
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        self.offset(addr, len).is_some()
    }

    #[inline(always)]
    fn read_byte(&self, offset: u32) -> u8 {
        let word = self.words[(offset / 4) as usize].load(Ordering::Relaxed);
        word.to_be_bytes()[(offset % 4) as usize]
    }

    #[inline(always)]
    fn write_byte(&self, offset: u32, value: u8) {
        let shift = 8 * (3 - offset % 4);
        let mask = 0xFF << shift;

        // the closure always returns Some, so this cannot fail
        let _ = self.words[(offset / 4) as usize].fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |word| Some((word & !mask) | ((value as u32) << shift)),
        );
    }

    /// Reads a `P` at `addr`. Returns `None` if the access is out of range.
    #[inline]
    pub fn read<P: Primitive>(&self, addr: u32) -> Option<P> {
        let offset = self.offset(addr, P::SIZE)?;
        if P::SIZE == 4 && offset % 4 == 0 {
            let word = self.words[(offset / 4) as usize].load(Ordering::Relaxed);
            return Some(P::from_bits(word as u64));
        }

        let bits = (0..P::SIZE).fold(0u64, |bits, i| {
            (bits << 8) | self.read_byte(offset + i) as u64
        });

        Some(P::from_bits(bits))
    }

    /// Writes `value` to `addr`. Returns whether the access was in range.
    #[inline]
    pub fn write<P: Primitive>(&self, addr: u32, value: P) -> bool {
        let Some(offset) = self.offset(addr, P::SIZE) else {
            return false;
        };

        let bits = value.to_bits();
        if P::SIZE == 4 && offset % 4 == 0 {
            self.words[(offset / 4) as usize].store(bits as u32, Ordering::Relaxed);
            return true;
        }

        for i in 0..P::SIZE {
            let byte = (bits >> (8 * (P::SIZE - 1 - i))) as u8;
            self.write_byte(offset + i, byte);
        }

        true
    }

    /// Atomically replaces the aligned word at `addr` with `new` if it currently holds
    /// `current`. Returns `None` if the access is out of range or misaligned.
    pub fn compare_exchange(&self, addr: u32, current: u32, new: u32) -> Option<bool> {
        let offset = self.offset(addr, 4).filter(|offset| offset % 4 == 0)?;
        let result = self.words[(offset / 4) as usize].compare_exchange(
            current,
            new,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );

        Some(result.is_ok())
    }

    /// Copies `bytes` into the image at `addr`. Returns whether the whole range was in bounds.
    pub fn load(&self, addr: u32, bytes: &[u8]) -> bool {
        let Ok(len) = u32::try_from(bytes.len()) else {
            return false;
        };

        let Some(offset) = self.offset(addr, len) else {
            return false;
        };

        for (i, &byte) in bytes.iter().enumerate() {
            self.write_byte(offset + i as u32, byte);
        }

        true
    }

    /// Writes a sequence of big-endian words starting at `addr`, e.g. guest code.
    pub fn load_words(&self, addr: u32, words: &[u32]) -> bool {
        let bytes = words
            .iter()
            .flat_map(|word| word.to_be_bytes())
            .collect::<Vec<_>>();

        self.load(addr, &bytes)
    }

    /// Zeroes `len` bytes at `addr`. Returns whether the whole range was in bounds.
    pub fn zero(&self, addr: u32, len: u32) -> bool {
        let Some(offset) = self.offset(addr, len) else {
            return false;
        };

        for i in 0..len {
            self.write_byte(offset + i, 0);
        }

        true
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("base", &format_args!("0x{:08X}", self.base))
            .field("len", &format_args!("0x{:X}", self.len))
            .finish_non_exhaustive()
    }
}
