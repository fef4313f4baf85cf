use crate::ins::{Ins, InsId};

/// Instructions identified by their primary opcode alone.
static PRIMARY_LUT: [InsId; 64] = {
    use InsId::*;
    let mut lut = [Invalid; 64];

    lut[3] = Twi;
    lut[7] = Mulli;
    lut[8] = Subfic;
    lut[10] = Cmpli;
    lut[11] = Cmpi;
    lut[12] = Addic;
    lut[13] = AddicRc;
    lut[14] = Addi;
    lut[15] = Addis;
    lut[16] = Bc;
    lut[18] = B;
    lut[20] = Rlwimi;
    lut[21] = Rlwinm;
    lut[23] = Rlwnm;
    lut[24] = Ori;
    lut[25] = Oris;
    lut[26] = Xori;
    lut[27] = Xoris;
    lut[28] = AndiRc;
    lut[29] = AndisRc;
    lut[32] = Lwz;
    lut[33] = Lwzu;
    lut[34] = Lbz;
    lut[35] = Lbzu;
    lut[36] = Stw;
    lut[37] = Stwu;
    lut[38] = Stb;
    lut[39] = Stbu;
    lut[40] = Lhz;
    lut[41] = Lhzu;
    lut[42] = Lha;
    lut[43] = Lhau;
    lut[44] = Sth;
    lut[45] = Sthu;
    lut[46] = Lmw;
    lut[47] = Stmw;
    lut[48] = Lfs;
    lut[49] = Lfsu;
    lut[50] = Lfd;
    lut[51] = Lfdu;
    lut[52] = Stfs;
    lut[53] = Stfsu;
    lut[54] = Stfd;
    lut[55] = Stfdu;
    lut[56] = PsqL;
    lut[57] = PsqLu;
    lut[60] = PsqSt;
    lut[61] = PsqStu;

    lut
};

/// Fills every entry of a 10-bit extended opcode table whose low `bits` bits equal `xo`.
const fn fill(lut: &mut [InsId; 1024], bits: u32, xo: usize, id: InsId) {
    let mut high = 0;
    while high < (1 << (10 - bits)) {
        lut[(high << bits) | xo] = id;
        high += 1;
    }
}

/// Primary opcode 4, paired singles. Indexed by the 10-bit extended opcode.
static OP4_LUT: [InsId; 1024] = {
    use InsId::*;
    let mut lut = [Invalid; 1024];

    // 10-bit forms
    lut[0] = PsCmpu0;
    lut[32] = PsCmpo0;
    lut[40] = PsNeg;
    lut[64] = PsCmpu1;
    lut[72] = PsMr;
    lut[96] = PsCmpo1;
    lut[136] = PsNabs;
    lut[264] = PsAbs;
    lut[528] = PsMerge00;
    lut[560] = PsMerge01;
    lut[592] = PsMerge10;
    lut[624] = PsMerge11;
    lut[1014] = DcbzL;

    // 5-bit forms take precedence
    fill(&mut lut, 5, 10, PsSum0);
    fill(&mut lut, 5, 11, PsSum1);
    fill(&mut lut, 5, 12, PsMuls0);
    fill(&mut lut, 5, 13, PsMuls1);
    fill(&mut lut, 5, 14, PsMadds0);
    fill(&mut lut, 5, 15, PsMadds1);
    fill(&mut lut, 5, 18, PsDiv);
    fill(&mut lut, 5, 20, PsSub);
    fill(&mut lut, 5, 21, PsAdd);
    fill(&mut lut, 5, 23, PsSel);
    fill(&mut lut, 5, 24, PsRes);
    fill(&mut lut, 5, 25, PsMul);
    fill(&mut lut, 5, 26, PsRsqrte);
    fill(&mut lut, 5, 28, PsMsub);
    fill(&mut lut, 5, 29, PsMadd);
    fill(&mut lut, 5, 30, PsNmsub);
    fill(&mut lut, 5, 31, PsNmadd);

    // and 6-bit forms over both
    fill(&mut lut, 6, 6, PsqLx);
    fill(&mut lut, 6, 7, PsqStx);
    fill(&mut lut, 6, 38, PsqLux);
    fill(&mut lut, 6, 39, PsqStux);

    lut
};

/// Primary opcode 19, branches to LR/CTR and condition register logic.
static OP19_LUT: [InsId; 1024] = {
    use InsId::*;
    let mut lut = [Invalid; 1024];

    lut[0] = Mcrf;
    lut[16] = Bclr;
    lut[33] = Crnor;
    lut[50] = Rfi;
    lut[129] = Crandc;
    lut[150] = Isync;
    lut[193] = Crxor;
    lut[225] = Crnand;
    lut[257] = Crand;
    lut[289] = Creqv;
    lut[417] = Crorc;
    lut[449] = Cror;
    lut[528] = Bcctr;

    lut
};

/// Primary opcode 31, the bulk of the integer instructions.
static OP31_LUT: [InsId; 1024] = {
    use InsId::*;
    let mut lut = [Invalid; 1024];

    lut[0] = Cmp;
    lut[4] = Tw;
    lut[19] = Mfcr;
    lut[20] = Lwarx;
    lut[23] = Lwzx;
    lut[24] = Slw;
    lut[26] = Cntlzw;
    lut[28] = And;
    lut[32] = Cmpl;
    lut[54] = Dcbst;
    lut[55] = Lwzux;
    lut[60] = Andc;
    lut[83] = Mfmsr;
    lut[86] = Dcbf;
    lut[87] = Lbzx;
    lut[119] = Lbzux;
    lut[124] = Nor;
    lut[144] = Mtcrf;
    lut[146] = Mtmsr;
    lut[150] = Stwcx;
    lut[151] = Stwx;
    lut[183] = Stwux;
    lut[210] = Mtsr;
    lut[215] = Stbx;
    lut[242] = Mtsrin;
    lut[246] = Dcbtst;
    lut[247] = Stbux;
    lut[278] = Dcbt;
    lut[279] = Lhzx;
    lut[284] = Eqv;
    lut[306] = Tlbie;
    lut[310] = Eciwx;
    lut[311] = Lhzux;
    lut[316] = Xor;
    lut[339] = Mfspr;
    lut[343] = Lhax;
    lut[371] = Mftb;
    lut[375] = Lhaux;
    lut[407] = Sthx;
    lut[412] = Orc;
    lut[438] = Ecowx;
    lut[439] = Sthux;
    lut[444] = Or;
    lut[467] = Mtspr;
    lut[470] = Dcbi;
    lut[476] = Nand;
    lut[512] = Mcrxr;
    lut[533] = Lswx;
    lut[534] = Lwbrx;
    lut[535] = Lfsx;
    lut[536] = Srw;
    lut[566] = Tlbsync;
    lut[567] = Lfsux;
    lut[595] = Mfsr;
    lut[597] = Lswi;
    lut[598] = Sync;
    lut[599] = Lfdx;
    lut[631] = Lfdux;
    lut[659] = Mfsrin;
    lut[661] = Stswx;
    lut[662] = Stwbrx;
    lut[663] = Stfsx;
    lut[695] = Stfsux;
    lut[725] = Stswi;
    lut[727] = Stfdx;
    lut[759] = Stfdux;
    lut[790] = Lhbrx;
    lut[792] = Sraw;
    lut[824] = Srawi;
    lut[854] = Eieio;
    lut[918] = Sthbrx;
    lut[922] = Extsh;
    lut[954] = Extsb;
    lut[982] = Icbi;
    lut[983] = Stfiwx;
    lut[1014] = Dcbz;

    // 9-bit forms, with the OE bit in either state
    fill(&mut lut, 9, 8, Subfc);
    fill(&mut lut, 9, 10, Addc);
    fill(&mut lut, 9, 11, Mulhwu);
    fill(&mut lut, 9, 40, Subf);
    fill(&mut lut, 9, 75, Mulhw);
    fill(&mut lut, 9, 104, Neg);
    fill(&mut lut, 9, 136, Subfe);
    fill(&mut lut, 9, 138, Adde);
    fill(&mut lut, 9, 200, Subfze);
    fill(&mut lut, 9, 202, Addze);
    fill(&mut lut, 9, 232, Subfme);
    fill(&mut lut, 9, 234, Addme);
    fill(&mut lut, 9, 235, Mullw);
    fill(&mut lut, 9, 266, Add);
    fill(&mut lut, 9, 459, Divwu);
    fill(&mut lut, 9, 491, Divw);

    lut
};

/// Primary opcode 59, single precision arithmetic.
static OP59_LUT: [InsId; 32] = {
    use InsId::*;
    let mut lut = [Invalid; 32];

    lut[18] = Fdivs;
    lut[20] = Fsubs;
    lut[21] = Fadds;
    lut[24] = Fres;
    lut[25] = Fmuls;
    lut[28] = Fmsubs;
    lut[29] = Fmadds;
    lut[30] = Fnmsubs;
    lut[31] = Fnmadds;

    lut
};

/// Primary opcode 63, double precision arithmetic and FPSCR access.
static OP63_LUT: [InsId; 1024] = {
    use InsId::*;
    let mut lut = [Invalid; 1024];

    lut[0] = Fcmpu;
    lut[12] = Frsp;
    lut[14] = Fctiw;
    lut[15] = Fctiwz;
    lut[32] = Fcmpo;
    lut[38] = Mtfsb1;
    lut[40] = Fneg;
    lut[64] = Mcrfs;
    lut[70] = Mtfsb0;
    lut[72] = Fmr;
    lut[134] = Mtfsfi;
    lut[136] = Fnabs;
    lut[264] = Fabs;
    lut[583] = Mffs;
    lut[711] = Mtfsf;

    fill(&mut lut, 5, 18, Fdiv);
    fill(&mut lut, 5, 20, Fsub);
    fill(&mut lut, 5, 21, Fadd);
    fill(&mut lut, 5, 23, Fsel);
    fill(&mut lut, 5, 25, Fmul);
    fill(&mut lut, 5, 26, Frsqrte);
    fill(&mut lut, 5, 28, Fmsub);
    fill(&mut lut, 5, 29, Fmadd);
    fill(&mut lut, 5, 30, Fnmsub);
    fill(&mut lut, 5, 31, Fnmadd);

    lut
};

/// Resolves the identity of `raw`. Every word decodes, unknown encodings to [`InsId::Invalid`].
pub fn decode(raw: u32) -> Ins {
    let xo = ((raw >> 1) & 0x3FF) as usize;
    let id = match raw >> 26 {
        4 => OP4_LUT[xo],
        17 if raw & 1 != 0 => InsId::Kc,
        17 if raw & 2 != 0 => InsId::Sc,
        19 => OP19_LUT[xo],
        31 => match OP31_LUT[xo] {
            InsId::Stwcx if raw & 1 == 0 => InsId::Invalid,
            id => id,
        },
        59 => OP59_LUT[xo & 0x1F],
        63 => OP63_LUT[xo],
        primary => PRIMARY_LUT[primary as usize],
    };

    Ins { raw, id }
}
