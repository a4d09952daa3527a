//! Runtime configuration types.

/// Runtime configuration for the VM and driver.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Print the value stack and disassembly of every instruction executed.
    pub trace_execution: bool,
    /// Collect on every allocation (GC stress mode).
    pub gc_stress: bool,
    /// Print GC statistics after the program finishes.
    pub gc_stats: bool,
}
