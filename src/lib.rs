//! A tracing disassembler for 6502-family binaries.
//!
//! mosdis consumes a raw memory image, a set of entry points and user
//! annotations (labels, constants, data classifications, relocations,
//! subroutine hooks) and produces assembler source that reassembles to the
//! input byte for byte. Control programs are ordinary Rust: create a
//! [`Disassembly`], register everything, call [`Disassembly::go`] with the
//! assembler back-end of your choice.
//!
//! ```no_run
//! use mosdis::cli::default_frontend_options;
//! use mosdis::formatter::BeebAsm;
//! use mosdis::instruction::mos6502::Mos6502;
//! use mosdis::{BinaryAddr, Disassembly, RuntimeAddr};
//!
//! # fn main() -> Result<(), mosdis::DisassemblyError> {
//! let mut dis = Disassembly::new(Box::new(Mos6502::new(false)), default_frontend_options());
//! dis.load(BinaryAddr::new(0x8000), "rom.bin", None)?;
//! dis.entry(RuntimeAddr::new(0x8000), Some("service_entry"))?;
//! let mut formatter = BeebAsm::new(false);
//! print!("{}", dis.go(&mut formatter)?);
//! # Ok(())
//! # }
//! ```

pub mod classification;
pub mod cli;
pub mod disassembly;
mod emit;
pub mod error;
pub mod expression;
pub mod formatter;
pub mod instruction;
pub mod label;
pub mod memory;
pub mod movemanager;
pub mod trace;

#[cfg(test)]
mod test;

pub use classification::Classification;
pub use disassembly::Disassembly;
pub use error::{DisassemblyError, DisassemblyWarning};
pub use expression::Expr;
pub use memory::{BinaryAddr, RuntimeAddr};
pub use movemanager::{MoveId, BASE_MOVE_ID};
