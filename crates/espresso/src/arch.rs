use std::{fmt::Debug, mem::offset_of};
use strum::{FromRepr, VariantArray};

/// A single 4-bit field of the condition register.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Cond(u8);

impl Cond {
    /// Summary overflow, a copy of XER[SO] (or "unordered" for floating point comparisons).
    pub const SO: u8 = 1 << 0;
    /// Equal to / zero.
    pub const EQ: u8 = 1 << 1;
    /// Greater than / positive.
    pub const GT: u8 = 1 << 2;
    /// Less than / negative.
    pub const LT: u8 = 1 << 3;

    #[inline(always)]
    pub fn new(lt: bool, gt: bool, eq: bool, so: bool) -> Self {
        Self(
            (u8::from(lt) << 3) | (u8::from(gt) << 2) | (u8::from(eq) << 1) | u8::from(so),
        )
    }

    #[inline(always)]
    pub fn from_bits(bits: u32) -> Self {
        Self((bits & 0xF) as u8)
    }

    #[inline(always)]
    pub fn to_bits(self) -> u32 {
        self.0 as u32
    }

    #[inline(always)]
    pub fn less_than(self) -> bool {
        self.0 & Self::LT != 0
    }

    #[inline(always)]
    pub fn greater_than(self) -> bool {
        self.0 & Self::GT != 0
    }

    #[inline(always)]
    pub fn equal(self) -> bool {
        self.0 & Self::EQ != 0
    }

    #[inline(always)]
    pub fn summary_overflow(self) -> bool {
        self.0 & Self::SO != 0
    }
}

impl Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}{}{}{}]",
            if self.less_than() { "LT" } else { "-" },
            if self.greater_than() { "GT" } else { "-" },
            if self.equal() { "EQ" } else { "-" },
            if self.summary_overflow() { "SO" } else { "-" },
        )
    }
}

/// Bits of the XER register.
///
/// The XER register contains information about overflow and carry operations, and is also used
/// by the load/store string indexed instructions.
pub mod xer {
    /// Set whenever the overflow bit is set and stays set until cleared by specific
    /// instructions.
    pub const SO: u32 = 1 << 31;
    /// Whether an overflow has occured.
    pub const OV: u32 = 1 << 30;
    /// Used by carrying instructions, contains the carry bit of the result.
    pub const CA: u32 = 1 << 29;
    /// The number of bytes to be transferred by a lswx or stswx.
    pub const BYTE_COUNT: u32 = 0x7F;

    pub const SO_BIT: u32 = 31;
    pub const OV_BIT: u32 = 30;
    pub const CA_BIT: u32 = 29;
}

/// Bits of the FPSCR register.
pub mod fpscr {
    /// Rounding mode.
    pub const RN: u32 = 0b11;
    /// Non-IEEE mode.
    pub const NI: u32 = 1 << 2;
    /// Floating point condition code (FL, FG, FE, FU).
    pub const FPCC: u32 = 0xF << 12;
    pub const FPCC_SHIFT: u32 = 12;
    /// Result class descriptor.
    pub const C: u32 = 1 << 16;
    /// Floating point result flags (class descriptor and condition code).
    pub const FPRF: u32 = C | FPCC;
    /// Invalid operation exception for signalling NaN.
    pub const VXSNAN: u32 = 1 << 24;
    /// Invalid operation exception for invalid compare.
    pub const VXVC: u32 = 1 << 19;
    /// Exception summary bits copied into CR1 by recording instructions.
    pub const CR1_SHIFT: u32 = 28;
}

/// Rounding mode selected by FPSCR[RN].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromRepr, VariantArray)]
#[repr(u8)]
pub enum RoundingMode {
    /// Round to nearest, ties to even.
    #[default]
    Nearest = 0,
    /// Round toward zero.
    Zero = 1,
    /// Round toward positive infinity.
    Positive = 2,
    /// Round toward negative infinity.
    Negative = 3,
}

impl RoundingMode {
    /// Rounds `value` to an integral value using this rounding mode.
    pub fn round(self, value: f64) -> f64 {
        match self {
            Self::Nearest => value.round_ties_even(),
            Self::Zero => value.trunc(),
            Self::Positive => value.ceil(),
            Self::Negative => value.floor(),
        }
    }
}

/// Type of values moved by quantized load and store instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizedType {
    Float,
    U8,
    U16,
    I8,
    I16,
}

impl QuantizedType {
    #[inline(always)]
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0b111 {
            4 => Self::U8,
            5 => Self::U16,
            6 => Self::I8,
            7 => Self::I16,
            _ => Self::Float,
        }
    }

    /// Size, in bytes, of a value of this type.
    #[inline(always)]
    pub fn size(self) -> u32 {
        match self {
            Self::Float => 4,
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
        }
    }
}

/// A graphics quantization register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gqr(pub u32);

impl Gqr {
    #[inline(always)]
    pub fn store_type(self) -> QuantizedType {
        QuantizedType::from_bits(self.0)
    }

    /// Store scale, a 6-bit signed exponent.
    #[inline(always)]
    pub fn store_scale(self) -> i32 {
        (((self.0 >> 8) as i32) << 26) >> 26
    }

    #[inline(always)]
    pub fn load_type(self) -> QuantizedType {
        QuantizedType::from_bits(self.0 >> 16)
    }

    /// Load scale, a 6-bit signed exponent.
    #[inline(always)]
    pub fn load_scale(self) -> i32 {
        (((self.0 >> 24) as i32) << 26) >> 26
    }
}

/// The register file of a single Espresso core.
#[repr(C)]
#[derive(Clone, PartialEq, Default)]
pub struct Registers {
    /// General Purpose Registers
    pub gpr: [u32; 32],
    /// Floating Point Registers, as paired singles. Slot 0 is the regular double value.
    pub fpr: [[f64; 2]; 32],
    /// Condition Register
    pub cr: u32,
    /// XER Register
    pub xer: u32,
    /// Link Register
    pub lr: u32,
    /// Count Register
    pub ctr: u32,
    /// Floating Point Status and Control Register
    pub fpscr: u32,
    /// Machine State Register
    pub msr: u32,
    /// Graphics Quantization Registers
    pub gqr: [u32; 8],
    /// Segment Registers
    pub sr: [u32; 16],
    /// Save/Restore Registers
    pub srr0: u32,
    pub srr1: u32,
    /// Current Instruction Address
    pub cia: u32,
    /// Next Instruction Address
    pub nia: u32,
}

static_assertions::const_assert_eq!(offset_of!(Registers, fpr) % 8, 0);

impl Registers {
    /// Returns CR field `index`, where field 0 is the most significant nibble.
    #[inline(always)]
    pub fn cr_field(&self, index: u8) -> Cond {
        Cond::from_bits(self.cr >> (4 * (7 - index as u32)))
    }

    #[inline(always)]
    pub fn set_cr_field(&mut self, index: u8, cond: Cond) {
        let shift = 4 * (7 - index as u32);
        self.cr = (self.cr & !(0xF << shift)) | (cond.to_bits() << shift);
    }

    /// Returns CR bit `bit` in PowerPC numbering, i.e. bit 0 is the most significant.
    #[inline(always)]
    pub fn cr_bit(&self, bit: u8) -> bool {
        (self.cr >> (31 - bit as u32)) & 1 != 0
    }

    #[inline(always)]
    pub fn set_cr_bit(&mut self, bit: u8, value: bool) {
        let mask = 1 << (31 - bit as u32);
        if value {
            self.cr |= mask;
        } else {
            self.cr &= !mask;
        }
    }

    /// Updates CR0 by signed comparison of `value` with zero, copying XER[SO].
    #[inline(always)]
    pub fn update_cr0(&mut self, value: u32) {
        let value = value as i32;
        let cond = Cond::new(value < 0, value > 0, value == 0, self.xer_so());
        self.set_cr_field(0, cond);
    }

    /// Copies the FPSCR exception summary bits into CR1.
    #[inline(always)]
    pub fn update_cr1(&mut self) {
        self.set_cr_field(1, Cond::from_bits(self.fpscr >> fpscr::CR1_SHIFT));
    }

    #[inline(always)]
    pub fn xer_so(&self) -> bool {
        self.xer & xer::SO != 0
    }

    #[inline(always)]
    pub fn xer_ca(&self) -> bool {
        self.xer & xer::CA != 0
    }

    #[inline(always)]
    pub fn set_xer_ca(&mut self, carry: bool) {
        if carry {
            self.xer |= xer::CA;
        } else {
            self.xer &= !xer::CA;
        }
    }

    /// Sets XER[OV] to `overflow`, also setting the sticky XER[SO] if it overflowed.
    #[inline(always)]
    pub fn set_xer_ov(&mut self, overflow: bool) {
        if overflow {
            self.xer |= xer::OV | xer::SO;
        } else {
            self.xer &= !xer::OV;
        }
    }

    #[inline(always)]
    pub fn xer_byte_count(&self) -> u32 {
        self.xer & xer::BYTE_COUNT
    }

    #[inline(always)]
    pub fn rounding_mode(&self) -> RoundingMode {
        RoundingMode::from_repr((self.fpscr & fpscr::RN) as u8).unwrap_or_default()
    }

    #[inline(always)]
    pub fn gqr(&self, index: u8) -> Gqr {
        Gqr(self.gqr[index as usize & 7])
    }

    /// Value of rA, or zero if rA is r0. Used by most addressing modes.
    #[inline(always)]
    pub fn gpr_or_zero(&self, gpr: GPR) -> u32 {
        if gpr == GPR::R0 { 0 } else { self.gpr[gpr as usize] }
    }
}

struct Hex<T>(T);

impl<T> Debug for Hex<T>
where
    T: std::fmt::UpperHex,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", &self.0)
    }
}

struct NonZeroGprs<'a>(&'a [u32; 32]);

impl Debug for NonZeroGprs<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (i, value) in self.0.iter().enumerate() {
            if *value != 0 {
                map.entry(&i, &Hex(*value));
            }
        }

        map.finish_non_exhaustive()
    }
}

struct NonZeroFprs<'a>(&'a [[f64; 2]; 32]);

impl Debug for NonZeroFprs<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (i, [ps0, ps1]) in self.0.iter().enumerate() {
            if ps0.to_bits() != 0 || ps1.to_bits() != 0 {
                map.entry(&i, &(ps0, ps1));
            }
        }

        map.finish_non_exhaustive()
    }
}

impl Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registers")
            .field("cia", &Hex(self.cia))
            .field("nia", &Hex(self.nia))
            .field("gpr", &NonZeroGprs(&self.gpr))
            .field("fpr", &NonZeroFprs(&self.fpr))
            .field("cr", &Hex(self.cr))
            .field("xer", &Hex(self.xer))
            .field("lr", &Hex(self.lr))
            .field("ctr", &Hex(self.ctr))
            .field("fpscr", &Hex(self.fpscr))
            .field("msr", &Hex(self.msr))
            .finish_non_exhaustive()
    }
}

/// A General Purpose Register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray)]
#[repr(u8)]
pub enum GPR {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    R16,
    R17,
    R18,
    R19,
    R20,
    R21,
    R22,
    R23,
    R24,
    R25,
    R26,
    R27,
    R28,
    R29,
    R30,
    R31,
}

impl GPR {
    /// Creates a new GPR with the given index. Only the low 5 bits are used.
    #[inline(always)]
    pub fn new(index: u8) -> Self {
        Self::VARIANTS[(index & 31) as usize]
    }

    /// Offset of this GPR in the [`Registers`] struct.
    #[inline(always)]
    pub fn offset(self) -> usize {
        offset_of!(Registers, gpr) + size_of::<u32>() * (self as usize)
    }
}

/// A Floating Point Register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray)]
#[repr(u8)]
pub enum FPR {
    F0,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
    F13,
    F14,
    F15,
    F16,
    F17,
    F18,
    F19,
    F20,
    F21,
    F22,
    F23,
    F24,
    F25,
    F26,
    F27,
    F28,
    F29,
    F30,
    F31,
}

impl FPR {
    /// Creates a new FPR with the given index. Only the low 5 bits are used.
    #[inline(always)]
    pub fn new(index: u8) -> Self {
        Self::VARIANTS[(index & 31) as usize]
    }

    /// Offset of the given paired single slot of this FPR in the [`Registers`] struct.
    #[inline(always)]
    pub fn offset(self, slot: usize) -> usize {
        offset_of!(Registers, fpr) + size_of::<[f64; 2]>() * (self as usize) + 8 * slot
    }
}

/// A Special Purpose Register known to the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray)]
#[repr(u16)]
pub enum SPR {
    XER = 1,
    LR = 8,
    CTR = 9,
    SRR0 = 26,
    SRR1 = 27,
    TBL = 268,
    TBU = 269,
    PVR = 287,
    UGQR0 = 896,
    UGQR1 = 897,
    UGQR2 = 898,
    UGQR3 = 899,
    UGQR4 = 900,
    UGQR5 = 901,
    UGQR6 = 902,
    UGQR7 = 903,
    GQR0 = 912,
    GQR1 = 913,
    GQR2 = 914,
    GQR3 = 915,
    GQR4 = 916,
    GQR5 = 917,
    GQR6 = 918,
    GQR7 = 919,
    UPIR = 1007,
}

impl SPR {
    /// Index of the GQR this SPR aliases, if any.
    #[inline(always)]
    pub fn gqr_index(self) -> Option<usize> {
        match self as u16 {
            n @ 896..=903 => Some((n - 896) as usize),
            n @ 912..=919 => Some((n - 912) as usize),
            _ => None,
        }
    }

    /// Offset of this SPR in the [`Registers`] struct, if it is backed by storage there.
    #[inline(always)]
    pub fn offset(self) -> Option<usize> {
        Some(match self {
            Self::XER => offset_of!(Registers, xer),
            Self::LR => offset_of!(Registers, lr),
            Self::CTR => offset_of!(Registers, ctr),
            Self::SRR0 => offset_of!(Registers, srr0),
            Self::SRR1 => offset_of!(Registers, srr1),
            _ => {
                let gqr = self.gqr_index()?;
                offset_of!(Registers, gqr) + size_of::<u32>() * gqr
            }
        })
    }
}

/// A register that can be addressed by generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    GPR(GPR),
    /// Slot 0 of a FPR.
    PS0(FPR),
    /// Slot 1 of a FPR.
    PS1(FPR),
    /// A storage backed SPR. See [`SPR::offset`].
    SPR(SPR),
    CR,
    FPSCR,
    MSR,
    CIA,
    NIA,
}

impl Reg {
    /// Offset of this register in the [`Registers`] struct.
    ///
    /// # Panics
    /// Panics if this is a SPR without storage.
    #[inline(always)]
    pub fn offset(self) -> usize {
        match self {
            Reg::GPR(gpr) => gpr.offset(),
            Reg::PS0(fpr) => fpr.offset(0),
            Reg::PS1(fpr) => fpr.offset(1),
            Reg::SPR(spr) => spr
                .offset()
                .unwrap_or_else(|| panic!("{spr:?} has no backing storage")),
            Reg::CR => offset_of!(Registers, cr),
            Reg::FPSCR => offset_of!(Registers, fpscr),
            Reg::MSR => offset_of!(Registers, msr),
            Reg::CIA => offset_of!(Registers, cia),
            Reg::NIA => offset_of!(Registers, nia),
        }
    }

    /// Whether this register holds a double rather than a 32-bit integer.
    #[inline(always)]
    pub fn is_float(self) -> bool {
        matches!(self, Reg::PS0(_) | Reg::PS1(_))
    }
}

impl From<GPR> for Reg {
    #[inline(always)]
    fn from(value: GPR) -> Self {
        Self::GPR(value)
    }
}

impl From<SPR> for Reg {
    #[inline(always)]
    fn from(value: SPR) -> Self {
        Self::SPR(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cr_fields_are_big_endian() {
        let mut regs = Registers::default();
        regs.set_cr_field(0, Cond::new(true, false, false, true));
        assert_eq!(regs.cr, 0x9000_0000);
        assert!(regs.cr_bit(0));
        assert!(regs.cr_bit(3));

        regs.set_cr_field(7, Cond::new(false, false, true, false));
        assert_eq!(regs.cr, 0x9000_0002);
        assert!(regs.cr_field(7).equal());
        assert_eq!(regs.cr_field(1), Cond::default());
    }

    #[test]
    fn overflow_is_sticky() {
        let mut regs = Registers::default();
        regs.set_xer_ov(true);
        regs.set_xer_ov(false);
        assert_eq!(regs.xer, xer::SO);
    }

    #[test]
    fn gqr_scales_are_signed() {
        let gqr = Gqr(0x3F07_0104);
        assert_eq!(gqr.store_type(), QuantizedType::U8);
        assert_eq!(gqr.store_scale(), 1);
        assert_eq!(gqr.load_type(), QuantizedType::I16);
        assert_eq!(gqr.load_scale(), -1);
    }

    #[test]
    fn spr_storage() {
        assert_eq!(SPR::GQR3.gqr_index(), Some(3));
        assert_eq!(SPR::UGQR3.offset(), SPR::GQR3.offset());
        assert!(SPR::UPIR.offset().is_none());
        assert_eq!(Reg::PS1(FPR::F1).offset(), Reg::PS0(FPR::F1).offset() + 8);
    }
}
