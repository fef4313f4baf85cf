//! Architectural definitions for the Espresso, the triple core PowerPC 750 derivative found in
//! the Wii U.
//!
//! This crate contains everything both execution strategies share: the register file, the
//! instruction decoder, the handler table type and the floating point helpers whose results
//! must be bit-identical between the interpreter and the JIT.

pub mod arch;
pub mod float;
pub mod ins;
pub mod table;

mod decode;

pub use arch::{Cond, FPR, GPR, Gqr, QuantizedType, Reg, Registers, RoundingMode, SPR};
pub use decode::decode;
pub use ins::{Ins, InsId};
pub use table::HandlerTable;

/// Address the guest jumps to when returning control to host code.
pub const CALLBACK_ADDR: u32 = 0xFBAD_CDE0;
