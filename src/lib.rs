//! Opal - a compact scripting language
//!
//! A single-pass bytecode compiler and a stack-based virtual machine for a
//! small dynamically typed, class-based language with lexical closures.
//! `compiler` turns source text into bytecode, `vm` executes it; the two
//! meet at the garbage-collected heap.

pub mod compiler;
pub mod config;
pub mod vm;

// Re-export the embedding surface.
pub use config::RuntimeConfig;
pub use vm::{InterpretError, Value, VM};
