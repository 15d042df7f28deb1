//! A ROM-resident minicomputer around the PDP-11 pipeline core.
//!
//! The machine wires the execution engine to a 64 KiB memory map with a
//! framebuffer video device and a memory-mapped keyboard, and exposes the
//! debugger surface the UI builds on: stepping, breakpoints, disassembly
//! listings, register/flag display and cache/pipeline statistics.
//!
//! External collaborators stay outside: the glyph rasterizer delivers a
//! [`rom::GlyphSet`], the assembler delivers plain words for
//! [`Emulator::load_rom_words`], the presenter receives
//! [`video::VideoImage`]s, and the UI thread feeds keys through a cloned
//! [`keyboard::Keyboard`].

pub mod config;
mod emulator;
pub mod keyboard;
pub mod memory;
pub mod rom;
pub mod video;

pub use config::MachineConfig;
pub use emulator::{DisasmLine, DisasmView, Emulator, StepEvent};
pub use keyboard::Keyboard;
pub use memory::Memory;
pub use rom::GlyphSet;
pub use video::{VideoImage, VideoMemory};

// Re-export the core so hosts need only one dependency.
pub use cpu_pdp11;
