use serde::{Deserialize, Serialize};

/// Whether guest code is executed through the JIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitMode {
    /// Always interpret.
    #[default]
    Disabled,
    /// Compile blocks, interpreting only while breakpoints are armed.
    Enabled,
}

/// Configuration of the CPU subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub jit_mode: JitMode,
    pub jit: ppcjit::Settings,
    /// Whether DBG_BREAK interrupts pause every core. If disabled, they are only passed to the
    /// interrupt handler.
    pub debugger: bool,
    /// Stack size of core threads, in bytes.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::default(),
            jit: ppcjit::Settings::default(),
            debugger: true,
            stack_size: 8 * 1024 * 1024,
        }
    }
}
