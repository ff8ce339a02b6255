//! Guest image loading and boot sequencing.

pub mod boot;
pub mod elf;

pub use boot::{run_elf, BootError, BootSector, BootSequencer};
pub use elf::{load_elf, LoadError, LoadedImage, XCORE_ELF_MACHINE, XCORE_ELF_MACHINE_OLD};
