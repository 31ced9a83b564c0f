//! Architecture layer for the Kestrel kernel.
//!
//! Everything the lock and syscall core needs from "the machine" lives here:
//! the register file a trap arrives with, the trap causes and the handler
//! seam, local interrupt masking, and user address spaces whose words can be
//! accessed atomically by the kernel.

pub mod cpu;
pub mod error;
pub mod irq;
pub mod memory;
pub mod trap;

pub use cpu::*;
pub use error::*;
pub use memory::*;
pub use trap::*;
