//! Core logic: app file types, parsing, resolution, assembly, verification
//! and synthesis.

pub mod assembly;
pub mod parser;
pub mod resolver;
pub mod stack;
pub mod synth;
pub mod types;
pub mod verify;
