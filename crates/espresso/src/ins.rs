use crate::arch::{FPR, GPR, SPR};
use std::fmt::Debug;
use strum::{EnumCount, IntoStaticStr, VariantArray};

/// Identity of an Espresso instruction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumCount, IntoStaticStr, VariantArray,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum InsId {
    /// Not a valid instruction.
    Invalid,

    // integer arithmetic
    Add,
    Addc,
    Adde,
    Addi,
    Addic,
    #[strum(serialize = "addic.")]
    AddicRc,
    Addis,
    Addme,
    Addze,
    Divw,
    Divwu,
    Mulhw,
    Mulhwu,
    Mulli,
    Mullw,
    Neg,
    Subf,
    Subfc,
    Subfe,
    Subfic,
    Subfme,
    Subfze,

    // integer compare
    Cmp,
    Cmpi,
    Cmpl,
    Cmpli,

    // integer logical
    And,
    Andc,
    #[strum(serialize = "andi.")]
    AndiRc,
    #[strum(serialize = "andis.")]
    AndisRc,
    Cntlzw,
    Eqv,
    Extsb,
    Extsh,
    Nand,
    Nor,
    Or,
    Orc,
    Ori,
    Oris,
    Xor,
    Xori,
    Xoris,

    // integer rotate and shift
    Rlwimi,
    Rlwinm,
    Rlwnm,
    Slw,
    Sraw,
    Srawi,
    Srw,

    // floating point arithmetic
    Fadd,
    Fadds,
    Fdiv,
    Fdivs,
    Fmul,
    Fmuls,
    Fres,
    Frsqrte,
    Fsub,
    Fsubs,
    Fsel,
    Fmadd,
    Fmadds,
    Fmsub,
    Fmsubs,
    Fnmadd,
    Fnmadds,
    Fnmsub,
    Fnmsubs,

    // floating point rounding, conversion and compare
    Fctiw,
    Fctiwz,
    Frsp,
    Fcmpo,
    Fcmpu,

    // floating point status and control
    Mcrfs,
    Mffs,
    Mtfsb0,
    Mtfsb1,
    Mtfsf,
    Mtfsfi,

    // floating point move
    Fabs,
    Fmr,
    Fnabs,
    Fneg,

    // integer load
    Lbz,
    Lbzu,
    Lbzux,
    Lbzx,
    Lha,
    Lhau,
    Lhaux,
    Lhax,
    Lhz,
    Lhzu,
    Lhzux,
    Lhzx,
    Lwz,
    Lwzu,
    Lwzux,
    Lwzx,

    // integer store
    Stb,
    Stbu,
    Stbux,
    Stbx,
    Sth,
    Sthu,
    Sthux,
    Sthx,
    Stw,
    Stwu,
    Stwux,
    Stwx,

    // byte reversed
    Lhbrx,
    Lwbrx,
    Sthbrx,
    Stwbrx,

    // multiple and string
    Lmw,
    Stmw,
    Lswi,
    Lswx,
    Stswi,
    Stswx,

    // memory synchronisation
    Eieio,
    Isync,
    Lwarx,
    #[strum(serialize = "stwcx.")]
    Stwcx,
    Sync,

    // floating point load and store
    Lfd,
    Lfdu,
    Lfdux,
    Lfdx,
    Lfs,
    Lfsu,
    Lfsux,
    Lfsx,
    Stfd,
    Stfdu,
    Stfdux,
    Stfdx,
    Stfiwx,
    Stfs,
    Stfsu,
    Stfsux,
    Stfsx,

    // branch
    B,
    Bc,
    Bcctr,
    Bclr,

    // condition register logical
    Crand,
    Crandc,
    Creqv,
    Crnand,
    Crnor,
    Cror,
    Crorc,
    Crxor,
    Mcrf,

    // system linkage
    Rfi,
    Sc,
    /// Kernel call, an emulator specific opcode that calls into host code.
    Kc,

    // trap
    Tw,
    Twi,

    // processor control
    Mcrxr,
    Mfcr,
    Mfmsr,
    Mfspr,
    Mftb,
    Mtcrf,
    Mtmsr,
    Mtspr,

    // cache management
    Dcbf,
    Dcbi,
    Dcbst,
    Dcbt,
    Dcbtst,
    Dcbz,
    #[strum(serialize = "dcbz_l")]
    DcbzL,
    Icbi,

    // segment register manipulation
    Mfsr,
    Mfsrin,
    Mtsr,
    Mtsrin,

    // lookaside buffer management
    Tlbie,
    Tlbsync,

    // external control
    Eciwx,
    Ecowx,

    // paired single quantized load and store
    #[strum(serialize = "psq_l")]
    PsqL,
    #[strum(serialize = "psq_lu")]
    PsqLu,
    #[strum(serialize = "psq_lux")]
    PsqLux,
    #[strum(serialize = "psq_lx")]
    PsqLx,
    #[strum(serialize = "psq_st")]
    PsqSt,
    #[strum(serialize = "psq_stu")]
    PsqStu,
    #[strum(serialize = "psq_stux")]
    PsqStux,
    #[strum(serialize = "psq_stx")]
    PsqStx,

    // paired single arithmetic
    PsAdd,
    PsDiv,
    PsMul,
    PsSub,
    PsAbs,
    PsNabs,
    PsNeg,
    PsMr,
    PsSel,
    PsRes,
    PsRsqrte,
    PsMadd,
    PsMsub,
    PsNmadd,
    PsNmsub,
    PsSum0,
    PsSum1,
    PsMuls0,
    PsMuls1,
    PsMadds0,
    PsMadds1,

    // paired single compare and merge
    PsCmpo0,
    PsCmpo1,
    PsCmpu0,
    PsCmpu1,
    PsMerge00,
    PsMerge01,
    PsMerge10,
    PsMerge11,
}

impl InsId {
    /// The mnemonic of this instruction.
    #[inline(always)]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    /// Whether this is one of the branch instructions.
    #[inline(always)]
    pub fn is_branch(self) -> bool {
        matches!(self, Self::B | Self::Bc | Self::Bcctr | Self::Bclr)
    }

    /// Whether execution of a translated block must stop after this instruction, so that
    /// interrupts are checked or a changed machine state is observed.
    #[inline(always)]
    pub fn ends_block(self) -> bool {
        self.is_branch()
            || matches!(
                self,
                Self::Invalid
                    | Self::Kc
                    | Self::Sc
                    | Self::Rfi
                    | Self::Tw
                    | Self::Twi
                    | Self::Mtmsr
                    | Self::Isync
            )
    }

    /// Whether this instruction accesses guest memory.
    pub fn is_memory_access(self) -> bool {
        use InsId::*;
        matches!(
            self,
            Lbz | Lbzu
                | Lbzux
                | Lbzx
                | Lha
                | Lhau
                | Lhaux
                | Lhax
                | Lhz
                | Lhzu
                | Lhzux
                | Lhzx
                | Lwz
                | Lwzu
                | Lwzux
                | Lwzx
                | Stb
                | Stbu
                | Stbux
                | Stbx
                | Sth
                | Sthu
                | Sthux
                | Sthx
                | Stw
                | Stwu
                | Stwux
                | Stwx
                | Lhbrx
                | Lwbrx
                | Sthbrx
                | Stwbrx
                | Lmw
                | Stmw
                | Lswi
                | Lswx
                | Stswi
                | Stswx
                | Lwarx
                | Stwcx
                | Lfd
                | Lfdu
                | Lfdux
                | Lfdx
                | Lfs
                | Lfsu
                | Lfsux
                | Lfsx
                | Stfd
                | Stfdu
                | Stfdux
                | Stfdx
                | Stfiwx
                | Stfs
                | Stfsu
                | Stfsux
                | Stfsx
                | Dcbz
                | DcbzL
                | PsqL
                | PsqLu
                | PsqLux
                | PsqLx
                | PsqSt
                | PsqStu
                | PsqStux
                | PsqStx
        )
    }
}

/// A decoded Espresso instruction: the raw word and its resolved identity.
///
/// Field accessors follow the PowerPC naming. Bit positions in the comments use the host
/// numbering, where bit 0 is the least significant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ins {
    pub raw: u32,
    pub id: InsId,
}

impl Debug for Ins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:08X})", self.id.mnemonic(), self.raw)
    }
}

macro_rules! field {
    ($(#[$meta:meta])* $name:ident: $ty:ty = $shift:literal, $mask:literal) => {
        $(#[$meta])*
        #[inline(always)]
        pub fn $name(&self) -> $ty {
            ((self.raw >> $shift) & $mask) as $ty
        }
    };
}

impl Ins {
    field!(field_opcd: u8 = 26, 0x3F);
    field!(field_rd: u8 = 21, 0x1F);
    field!(field_rs: u8 = 21, 0x1F);
    field!(field_ra: u8 = 16, 0x1F);
    field!(field_rb: u8 = 11, 0x1F);
    field!(field_frd: u8 = 21, 0x1F);
    field!(field_frs: u8 = 21, 0x1F);
    field!(field_fra: u8 = 16, 0x1F);
    field!(field_frb: u8 = 11, 0x1F);
    field!(field_frc: u8 = 6, 0x1F);
    field!(field_sh: u8 = 11, 0x1F);
    field!(field_mb: u8 = 6, 0x1F);
    field!(field_me: u8 = 1, 0x1F);
    field!(field_bo: u8 = 21, 0x1F);
    field!(field_bi: u8 = 16, 0x1F);
    field!(field_to: u8 = 21, 0x1F);
    field!(field_crbd: u8 = 21, 0x1F);
    field!(field_crba: u8 = 16, 0x1F);
    field!(field_crbb: u8 = 11, 0x1F);
    field!(field_crfd: u8 = 23, 0x7);
    field!(field_crfs: u8 = 18, 0x7);
    field!(field_crm: u8 = 12, 0xFF);
    field!(field_fm: u8 = 17, 0xFF);
    field!(
        /// Immediate of `mtfsfi`.
        field_imm: u8 = 12, 0xF
    );
    field!(field_nb: u8 = 11, 0x1F);
    field!(field_sr: u8 = 16, 0xF);
    field!(field_uimm: u16 = 0, 0xFFFF);
    field!(field_xo_10: u16 = 1, 0x3FF);
    field!(field_xo_9: u16 = 1, 0x1FF);
    field!(field_xo_6: u8 = 1, 0x3F);
    field!(field_xo_5: u8 = 1, 0x1F);
    field!(
        /// Quantization register of an indexed psq instruction.
        field_ps_ix: u8 = 7, 0x7
    );
    field!(
        /// Quantization register of an immediate psq instruction.
        field_ps_i: u8 = 12, 0x7
    );
    field!(
        /// Kernel call id of `kc`.
        field_kcn: u32 = 6, 0xF_FFFF
    );

    /// Decodes `raw`.
    #[inline(always)]
    pub fn new(raw: u32) -> Self {
        crate::decode(raw)
    }

    #[inline(always)]
    pub fn field_simm(&self) -> i16 {
        self.raw as u16 as i16
    }

    /// Displacement of D-form loads and stores.
    #[inline(always)]
    pub fn field_d(&self) -> i16 {
        self.field_simm()
    }

    /// Displacement of psq loads and stores, a 12-bit signed value.
    #[inline(always)]
    pub fn field_ps_d(&self) -> i16 {
        ((self.raw as i16) << 4) >> 4
    }

    /// Whether an immediate psq instruction moves a single value.
    #[inline(always)]
    pub fn field_ps_w(&self) -> bool {
        (self.raw >> 15) & 1 != 0
    }

    /// Whether an indexed psq instruction moves a single value.
    #[inline(always)]
    pub fn field_ps_wx(&self) -> bool {
        (self.raw >> 10) & 1 != 0
    }

    /// Branch displacement of `b`, sign extended.
    #[inline(always)]
    pub fn field_li(&self) -> i32 {
        (((self.raw & 0x03FF_FFFC) << 6) as i32) >> 6
    }

    /// Branch displacement of `bc`, sign extended.
    #[inline(always)]
    pub fn field_bd(&self) -> i32 {
        (self.raw & 0xFFFC) as u16 as i16 as i32
    }

    #[inline(always)]
    pub fn field_aa(&self) -> bool {
        (self.raw >> 1) & 1 != 0
    }

    #[inline(always)]
    pub fn field_lk(&self) -> bool {
        self.raw & 1 != 0
    }

    #[inline(always)]
    pub fn field_rc(&self) -> bool {
        self.raw & 1 != 0
    }

    #[inline(always)]
    pub fn field_oe(&self) -> bool {
        (self.raw >> 10) & 1 != 0
    }

    /// SPR number, with the two halves of the encoded field swapped back.
    #[inline(always)]
    pub fn field_spr(&self) -> u16 {
        let encoded = ((self.raw >> 11) & 0x3FF) as u16;
        ((encoded << 5) & 0x3E0) | ((encoded >> 5) & 0x1F)
    }

    /// TBR number, encoded like [`Ins::field_spr`].
    #[inline(always)]
    pub fn field_tbr(&self) -> u16 {
        self.field_spr()
    }

    /// GPR indicated by field rA.
    #[inline(always)]
    pub fn gpr_a(&self) -> GPR {
        GPR::new(self.field_ra())
    }

    /// GPR indicated by field rB.
    #[inline(always)]
    pub fn gpr_b(&self) -> GPR {
        GPR::new(self.field_rb())
    }

    /// GPR indicated by field rS.
    #[inline(always)]
    pub fn gpr_s(&self) -> GPR {
        GPR::new(self.field_rs())
    }

    /// GPR indicated by field rD.
    #[inline(always)]
    pub fn gpr_d(&self) -> GPR {
        GPR::new(self.field_rd())
    }

    #[inline(always)]
    pub fn fpr_a(&self) -> FPR {
        FPR::new(self.field_fra())
    }

    #[inline(always)]
    pub fn fpr_b(&self) -> FPR {
        FPR::new(self.field_frb())
    }

    #[inline(always)]
    pub fn fpr_c(&self) -> FPR {
        FPR::new(self.field_frc())
    }

    #[inline(always)]
    pub fn fpr_d(&self) -> FPR {
        FPR::new(self.field_frd())
    }

    #[inline(always)]
    pub fn fpr_s(&self) -> FPR {
        FPR::new(self.field_frs())
    }

    /// SPR indicated by field SPR, if it is known.
    #[inline(always)]
    pub fn spr(&self) -> Option<SPR> {
        SPR::from_repr(self.field_spr())
    }

    /// Mask selected by the MB and ME fields of the rotate instructions. Wraps around if MB is
    /// greater than ME.
    #[inline(always)]
    pub fn rotate_mask(&self) -> u32 {
        let begin = u32::MAX >> self.field_mb();
        let end = u32::MAX << (31 - self.field_me());

        if self.field_mb() <= self.field_me() {
            begin & end
        } else {
            begin | end
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mnemonics() {
        assert_eq!(InsId::PsMerge01.mnemonic(), "ps_merge01");
        assert_eq!(InsId::PsqLux.mnemonic(), "psq_lux");
        assert_eq!(InsId::DcbzL.mnemonic(), "dcbz_l");
        assert_eq!(InsId::Stwcx.mnemonic(), "stwcx.");
        assert_eq!(InsId::Mtfsb0.mnemonic(), "mtfsb0");
    }

    #[test]
    fn signed_fields() {
        // b -4
        let ins = Ins::new(0x4BFF_FFFC);
        assert_eq!(ins.id, InsId::B);
        assert_eq!(ins.field_li(), -4);

        // bc 12, 2, -8
        let ins = Ins::new(0x4182_FFF8);
        assert_eq!(ins.id, InsId::Bc);
        assert_eq!(ins.field_bd(), -8);
        assert_eq!(ins.field_bo(), 12);
        assert_eq!(ins.field_bi(), 2);

        // psq_l f1, -4(r3), 0, qr2
        let ins = Ins::new(0xE023_2FFC);
        assert_eq!(ins.id, InsId::PsqL);
        assert_eq!(ins.field_ps_d(), -4);
        assert_eq!(ins.field_ps_i(), 2);
        assert!(!ins.field_ps_w());
    }

    #[test]
    fn spr_halves_are_swapped() {
        // mflr r0
        let ins = Ins::new(0x7C08_02A6);
        assert_eq!(ins.id, InsId::Mfspr);
        assert_eq!(ins.spr(), Some(SPR::LR));

        // mtspr GQR2, r4
        let ins = Ins::new(0x7C92_E3A6);
        assert_eq!(ins.id, InsId::Mtspr);
        assert_eq!(ins.spr(), Some(SPR::GQR2));
    }

    #[test]
    fn rotate_masks() {
        // rlwinm r3, r4, 0, 24, 31
        let ins = Ins::new(0x5483_063E);
        assert_eq!(ins.id, InsId::Rlwinm);
        assert_eq!(ins.rotate_mask(), 0x0000_00FF);

        // rlwinm r3, r4, 0, 28, 3
        let ins = Ins::new(0x5483_0706);
        assert_eq!(ins.rotate_mask(), 0xF000_000F);
    }
}
