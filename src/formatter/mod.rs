//! Pluggable per-assembler syntax back-ends.
//!
//! A formatter is a set of (almost) pure string-producing operations: hex
//! literal shape, label definition forms, data directive prefixes, and the
//! block forms for relocated code. The only state a back-end keeps is the
//! assertions recorded while emitting expressions, the output filename
//! where the assembler records it in the source, and bookkeeping for
//! closing its block forms.

use flexstr::{shared_fmt, SharedStr, ToSharedStr};

use crate::memory::{BinaryAddr, RuntimeAddr};
use crate::movemanager::MoveId;

pub mod acme;
pub mod beebasm;
pub mod xa;

pub use acme::Acme;
pub use beebasm::BeebAsm;
pub use xa::Xa;

/// Everything a back-end needs to reproduce one relocated block: the raw
/// move plus the already resolved label names for its three corners.
#[derive(Debug, Clone)]
pub struct RelocationBlock {
	/// Runtime address the block executes at.
	pub dest:         RuntimeAddr,
	/// Binary address the block's bytes live at.
	pub source:       BinaryAddr,
	/// Block length in bytes.
	pub length:       u32,
	/// The move this block belongs to.
	pub move_id:      MoveId,
	/// Label naming `dest`.
	pub dest_label:   SharedStr,
	/// Label naming `dest + length`.
	pub end_label:    SharedStr,
	/// Label naming the block's position in the binary.
	pub source_label: SharedStr,
}

/// One assembler's syntax.
pub trait Formatter {
	/// Back-end name as selected on the command line.
	fn name(&self) -> &'static str;

	/// Records the output filename for back-ends whose source text names it
	/// (beebasm's `save`); others ignore it.
	fn set_output_filename(&mut self, _file_name: &str) {}

	/// An 8-bit hex literal.
	fn hex2(&self, value: u8) -> SharedStr;

	/// A 16-bit hex literal.
	fn hex4(&self, value: u32) -> SharedStr;

	/// A hex literal as wide as the value needs.
	fn hex(&self, value: u32) -> SharedStr;

	/// The form that attaches `name` to the current address.
	fn inline_label(&self, name: &str) -> SharedStr;

	/// The `name = value` form, optionally `+offset`, optionally with the
	/// name padded to a column.
	fn explicit_label(
		&self,
		name: &str,
		value: &str,
		offset: Option<i64>,
		align_column: Option<usize>,
	) -> SharedStr {
		let padded = match align_column {
			Some(column) => shared_fmt!("{name:<column$}"),
			None => name.to_shared_str(),
		};
		match offset {
			Some(offset) => shared_fmt!("{padded} = {value}+{offset}"),
			None => shared_fmt!("{padded} = {value}"),
		}
	}

	/// The line comment introducer.
	fn comment_prefix(&self) -> &'static str;

	/// Whether accumulator-operand instructions spell the `A` ("ASL A"
	/// versus "ASL").
	fn explicit_a(&self) -> bool;

	/// Records an assembler-time assertion that `expression` equals
	/// `value`; all assertions are flushed by [`Self::disassembly_end`].
	/// Re-recording the same expression is idempotent.
	fn assert_expr(&mut self, expression: &str, value: u32);

	/// Lines opening the whole output.
	fn disassembly_start(&mut self) -> Vec<String>;

	/// Lines closing the whole output, assertions included.
	fn disassembly_end(&mut self) -> Vec<String>;

	/// Lines opening a non-relocated code block covering `[start, end)`.
	fn code_start(&mut self, start: RuntimeAddr, end: RuntimeAddr, first: bool) -> Vec<String>;

	/// Lines closing a non-relocated code block.
	fn code_end(&mut self) -> Vec<String>;

	/// The byte-data directive, with indent and trailing space.
	fn byte_prefix(&self) -> SharedStr;

	/// The word-data directive, with indent and trailing space.
	fn word_prefix(&self) -> SharedStr;

	/// The string-data directive, with indent and trailing space.
	fn string_prefix(&self) -> SharedStr;

	/// How a byte appears inside a string literal, or `None` if it can't.
	fn string_chr(&self, byte: u8) -> Option<char>;

	/// Lines opening a relocated block.
	fn pseudopc_start(&mut self, block: &RelocationBlock) -> Vec<String>;

	/// Lines closing a relocated block, reproducing the move's effect.
	fn pseudopc_end(&mut self, block: &RelocationBlock) -> Vec<String>;

	/// An absolute-addressing-forced rendition of an instruction whose
	/// operand fits in a byte, or `None` if the assembler has no such form
	/// (the emitter falls back to data bytes plus a comment).
	fn force_abs_instruction(&self, mnemonic: &str, prefix: &str, operand: &str, suffix: &str)
	-> Option<String>;
}

/// Applies the output case policy to keywords and mnemonics. Hex digits
/// and label names are left alone by callers.
#[must_use]
pub fn force_case(text: &str, upper: bool) -> SharedStr {
	if upper { text.to_uppercase().to_shared_str() } else { text.to_lowercase().to_shared_str() }
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn case_forcing() {
		assert_eq!(force_case("EQUB", false), "equb");
		assert_eq!(force_case("equb", true), "EQUB");
	}

	#[test]
	fn explicit_label_alignment() {
		let formatter = BeebAsm::new(false);
		assert_eq!(formatter.explicit_label("osbyte", "&fff4", None, Some(10)), "osbyte     = &fff4");
		assert_eq!(formatter.explicit_label("entry", "start", Some(2), None), "entry = start+2");
	}
}
