#![allow(dead_code)]

use cpu::{CALLBACK_ADDR, Config, CoreContext, CpuSubsystem, JitMode, Memory};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Start of guest memory.
pub const BASE: u32 = 0x0200_0000;
/// Size of guest memory.
pub const SIZE: u32 = 0x1_0000;
/// Where test programs are loaded.
pub const ENTRY: u32 = BASE + 0x100;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds a subsystem with `code` loaded at [`ENTRY`].
pub fn system(code: &[u32], config: Config) -> Arc<CpuSubsystem> {
    init_tracing();

    let memory = Arc::new(Memory::new(BASE, SIZE));
    assert!(memory.load_words(ENTRY, code));

    CpuSubsystem::initialise(config, memory)
}

pub fn config(jit_mode: JitMode) -> Config {
    Config {
        jit_mode,
        // nothing in these tests runs with every core alive
        debugger: false,
        ..Default::default()
    }
}

/// Points `ctx` at [`ENTRY`], returning to [`CALLBACK_ADDR`] once the program executes `blr`.
pub fn call_entry(ctx: &mut CoreContext<'_>) {
    let regs = ctx.regs_mut();
    regs.nia = ENTRY;
    regs.lr = CALLBACK_ADDR;
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
