//! The interpreter: one handler per instruction, operating on a [`CoreContext`].
//!
//! Every handler runs with CIA pointing at the instruction and NIA at the one after it. Handlers
//! that fault must leave the register file untouched.
mod branch;
mod float;
mod integer;
mod loadstore;
mod paired;
mod system;

use crate::{core::Fault, handlers::ExecFn};
use espresso::HandlerTable;

pub(crate) use branch::taken_target;
pub(crate) use float::apply_rounding_mode;

/// Result of an interpreter handler.
pub type Exec = Result<(), Fault>;

/// Builds the table with the interpreter handler of every instruction.
pub fn default_handlers() -> HandlerTable<ExecFn> {
    let mut table = HandlerTable::new();

    integer::register(&mut table);
    branch::register(&mut table);
    float::register(&mut table);
    paired::register(&mut table);
    loadstore::register(&mut table);
    system::register(&mut table);

    debug_assert!(
        table.missing().next().is_none(),
        "instructions without an interpreter handler: {:?}",
        table.missing().collect::<Vec<_>>()
    );

    table
}
