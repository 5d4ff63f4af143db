//! Fatal and advisory diagnostics.

use std::sync::Arc;

use flexstr::SharedStr;
use miette::Diagnostic;
use thiserror::Error;

use crate::memory::{BinaryAddr, RuntimeAddr};
use crate::movemanager::MoveId;

/// All fatal errors the disassembler can produce. Any of these aborts the
/// analysis; there is no recovery beyond fixing the control program or the
/// input image.
#[derive(Error, Debug, Clone, Diagnostic)]
#[non_exhaustive]
pub enum DisassemblyError {
	/// An input file could not be opened or read.
	#[error("failed to open file \"{file_name}\": {os_error}")]
	#[diagnostic(code(mosdis::io::file_not_found), help("check that the file exists and is readable"))]
	FileNotFound {
		/// The underlying I/O error.
		os_error:  Arc<std::io::Error>,
		/// The file that couldn't be opened.
		file_name: SharedStr,
	},

	/// Loading an image would run past the top of the 64 KiB address space.
	#[error("loading {length} (${length:x}) bytes at {addr} would overflow the top of memory")]
	#[diagnostic(code(mosdis::load::image_overflow))]
	ImageOverflow {
		/// Base address of the load.
		addr:   BinaryAddr,
		/// Length of the data being loaded.
		length: usize,
	},

	/// The loaded data does not match the digest the control program declared.
	#[error("MD5 checksum of \"{file_name}\" is {actual}, expected {expected}")]
	#[diagnostic(
		code(mosdis::load::checksum_mismatch),
		help("the binary being disassembled is not the one this control program was written for")
	)]
	ChecksumMismatch {
		/// Digest declared by the control program.
		expected:  SharedStr,
		/// Digest of the data actually loaded.
		actual:    SharedStr,
		/// The file that was loaded.
		file_name: SharedStr,
	},

	/// Two load ranges overlap.
	#[error("load at {addr} overlaps an already loaded range")]
	#[diagnostic(code(mosdis::load::overlap))]
	LoadOverlap {
		/// Base address of the offending load.
		addr: BinaryAddr,
	},

	/// An operation needed a byte that was never loaded.
	#[error("no data loaded at binary address {addr}")]
	#[diagnostic(code(mosdis::memory::unloaded))]
	UnloadedAddress {
		/// The address with no data behind it.
		addr: BinaryAddr,
	},

	/// A byte was classified twice. Each byte of the binary must be produced
	/// by exactly one assembler statement.
	#[error("binary address {addr} is already classified")]
	#[diagnostic(
		code(mosdis::classify::double_classification),
		help("each byte can carry at most one classification; check the control program for overlapping directives")
	)]
	DoubleClassification {
		/// First address of the attempted classification that overlapped.
		addr: BinaryAddr,
	},

	/// A classification would cross the end of a loaded range.
	#[error("classification of {length} bytes at {addr} crosses the end of the loaded range")]
	#[diagnostic(code(mosdis::classify::range_straddle))]
	RangeStraddle {
		/// First address of the classification.
		addr:   BinaryAddr,
		/// Its length in bytes.
		length: usize,
	},

	/// A move id that was never returned by `add_move`.
	#[error("{move_id} is not a valid move id")]
	#[diagnostic(code(mosdis::moves::invalid_move_id))]
	InvalidMoveId {
		/// The offending id.
		move_id: MoveId,
	},

	/// A 16-bit address value was out of range for its address space.
	#[error("${value:04x} is not a valid address")]
	#[diagnostic(code(mosdis::memory::invalid_address))]
	InvalidAddress {
		/// The raw value.
		value: u32,
	},

	/// A runtime address could not be mapped back to a binary address.
	#[error("runtime address {addr} is ambiguous or unmapped; no active move resolves it")]
	#[diagnostic(
		code(mosdis::moves::unresolved),
		help("wrap the command in a `moved(id)` region to pick one of the overlapping moves")
	)]
	UnresolvedRuntimeAddress {
		/// The runtime address that failed to resolve.
		addr: RuntimeAddr,
	},

	/// The same constant name was given two different values.
	#[error("constant \"{name}\" redefined with value {new_value}, previously {old_value}")]
	#[diagnostic(code(mosdis::constants::conflict))]
	ConstantConflict {
		/// Name of the constant.
		name:      SharedStr,
		/// The value it already had.
		old_value: SharedStr,
		/// The conflicting new value.
		new_value: SharedStr,
	},

	/// An optional label was redeclared with different details.
	#[error("optional label at {addr} redeclared as \"{name}\"")]
	#[diagnostic(code(mosdis::labels::optional_conflict))]
	OptionalLabelConflict {
		/// Address of the optional label.
		addr: RuntimeAddr,
		/// The conflicting name.
		name: SharedStr,
	},

	/// A registration command arrived after tracing had already latched.
	#[error("{operation} is not allowed once tracing has finished")]
	#[diagnostic(
		code(mosdis::trace::registration_after_trace),
		help("all loads, labels, entries, moves and hooks must be registered before go()")
	)]
	RegistrationAfterTrace {
		/// The public command that was called too late.
		operation: &'static str,
	},

	/// A JSR hook was installed twice for the same target.
	#[error("a subroutine hook is already installed for {addr}")]
	#[diagnostic(code(mosdis::trace::duplicate_hook))]
	DuplicateHook {
		/// Target runtime address of the hook.
		addr: RuntimeAddr,
	},

	/// A second label-maker override was installed.
	#[error("a label-maker override is already installed")]
	#[diagnostic(
		code(mosdis::labels::duplicate_label_maker),
		help("wrap the existing override instead of installing a second one")
	)]
	DuplicateLabelMaker,
}

/// Advisory diagnostics. These never abort the analysis; they are handed to
/// [`crate::cli::Frontend::report_diagnostic`] and the output is produced
/// regardless (possibly with a substitution, as documented per variant).
#[derive(Error, Debug, Clone, Diagnostic)]
#[non_exhaustive]
pub enum DisassemblyWarning {
	/// A move-range boundary fell inside a user-issued multi-byte
	/// classification, which had to be split into two byte runs.
	#[error("move boundary at {addr} splits a classification; emitted as byte data")]
	#[diagnostic(severity(Warning), code(mosdis::emit::split_classification))]
	SplitClassification {
		/// The boundary address.
		addr: BinaryAddr,
	},

	/// Tracing reached an address that is already classified as data. The
	/// would-be instruction is recorded as an annotation instead.
	#[error("instruction at {addr} overlaps existing data classification")]
	#[diagnostic(severity(Warning), code(mosdis::trace::overlapping_instruction))]
	OverlappingInstruction {
		/// Address of the overlapping instruction.
		addr: BinaryAddr,
	},

	/// A control-flow successor could not be translated back into a binary
	/// address, so the branch was abandoned.
	#[error("runtime address {addr} has no unambiguous binary address; branch not traced")]
	#[diagnostic(severity(Warning), code(mosdis::trace::unresolved_successor))]
	UnresolvedSuccessor {
		/// The runtime address control flow continued at.
		addr: RuntimeAddr,
	},

	/// The selected assembler has no syntax for forcing absolute addressing,
	/// so an absolute instruction with a zero-page operand was emitted as
	/// data bytes plus a comment.
	#[error("absolute instruction with zero-page operand at {addr} emitted as data")]
	#[diagnostic(severity(Warning), code(mosdis::emit::force_absolute_unsupported))]
	ForceAbsoluteUnsupported {
		/// Address of the instruction.
		addr: BinaryAddr,
	},
}
