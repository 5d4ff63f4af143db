//! Frontend options and the command-line interface.
//!
//! The library never talks to the terminal directly: output shaping knobs
//! and the warning sink are behind the [`Frontend`] trait, the CLI builds
//! one from its flags, and tests or embedders supply their own.

use std::sync::Arc;

use crate::error::DisassemblyWarning;

/// Output options and the diagnostics channel.
pub trait Frontend {
	/// Lower-case mnemonics, directives and synthesised names.
	fn lower_case(&self) -> bool {
		true
	}

	/// Append `; addr: xx xx xx` hex dumps to instruction and data lines.
	fn hex_dump(&self) -> bool {
		true
	}

	/// How many bytes a hex dump shows at most.
	fn hex_dump_max_bytes(&self) -> usize {
		3
	}

	/// Show an ASCII rendering next to byte runs.
	fn bytes_as_ascii(&self) -> bool {
		true
	}

	/// Column inline comments (and hex dumps) start at.
	fn inline_comment_column(&self) -> usize {
		70
	}

	/// Column user comments wrap at.
	fn word_wrap_comment_column(&self) -> usize {
		87
	}

	/// Blank line after instructions that end a block (JMP, RTS, ...).
	fn blank_line_at_block_end(&self) -> bool {
		true
	}

	/// Maximum backward-branch distance for the `loop_` label prefix.
	fn loop_limit(&self) -> u32 {
		32
	}

	/// Comment printable immediate operands with their character.
	fn show_char_literals(&self) -> bool {
		true
	}

	/// List all synthesised names at the end of the output.
	fn show_autogenerated_labels(&self) -> bool {
		true
	}

	/// Emit the reference histogram at the end of the output.
	fn label_references(&self) -> bool {
		true
	}

	/// Dump every label after the constants (debugging aid).
	fn show_all_labels(&self) -> bool {
		false
	}

	/// The diagnostics channel for advisory warnings.
	fn report_diagnostic(&self, warning: &DisassemblyWarning);
}

/// Plain-struct [`Frontend`] with every knob as a field. This is what the
/// CLI builds and what tests tweak.
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct FrontendOptions {
	/// See [`Frontend::lower_case`].
	pub lower_case:                bool,
	/// See [`Frontend::hex_dump`].
	pub hex_dump:                  bool,
	/// See [`Frontend::hex_dump_max_bytes`].
	pub hex_dump_max_bytes:        usize,
	/// See [`Frontend::bytes_as_ascii`].
	pub bytes_as_ascii:            bool,
	/// See [`Frontend::inline_comment_column`].
	pub inline_comment_column:     usize,
	/// See [`Frontend::word_wrap_comment_column`].
	pub word_wrap_comment_column:  usize,
	/// See [`Frontend::blank_line_at_block_end`].
	pub blank_line_at_block_end:   bool,
	/// See [`Frontend::loop_limit`].
	pub loop_limit:                u32,
	/// See [`Frontend::show_char_literals`].
	pub show_char_literals:        bool,
	/// See [`Frontend::show_autogenerated_labels`].
	pub show_autogenerated_labels: bool,
	/// See [`Frontend::label_references`].
	pub label_references:          bool,
	/// See [`Frontend::show_all_labels`].
	pub show_all_labels:           bool,
	/// Suppress warnings entirely (tests).
	pub quiet:                     bool,
}

impl Default for FrontendOptions {
	fn default() -> Self {
		Self {
			lower_case:                true,
			hex_dump:                  true,
			hex_dump_max_bytes:        3,
			bytes_as_ascii:            true,
			inline_comment_column:     70,
			word_wrap_comment_column:  87,
			blank_line_at_block_end:   true,
			loop_limit:                32,
			show_char_literals:        true,
			show_autogenerated_labels: true,
			label_references:          true,
			show_all_labels:           false,
			quiet:                     false,
		}
	}
}

impl Frontend for FrontendOptions {
	fn lower_case(&self) -> bool {
		self.lower_case
	}

	fn hex_dump(&self) -> bool {
		self.hex_dump
	}

	fn hex_dump_max_bytes(&self) -> usize {
		self.hex_dump_max_bytes
	}

	fn bytes_as_ascii(&self) -> bool {
		self.bytes_as_ascii
	}

	fn inline_comment_column(&self) -> usize {
		self.inline_comment_column
	}

	fn word_wrap_comment_column(&self) -> usize {
		self.word_wrap_comment_column
	}

	fn blank_line_at_block_end(&self) -> bool {
		self.blank_line_at_block_end
	}

	fn loop_limit(&self) -> u32 {
		self.loop_limit
	}

	fn show_char_literals(&self) -> bool {
		self.show_char_literals
	}

	fn show_autogenerated_labels(&self) -> bool {
		self.show_autogenerated_labels
	}

	fn label_references(&self) -> bool {
		self.label_references
	}

	fn show_all_labels(&self) -> bool {
		self.show_all_labels
	}

	fn report_diagnostic(&self, warning: &DisassemblyWarning) {
		if !self.quiet {
			eprintln!("{:?}", miette::Report::new(warning.clone()));
		}
	}
}

/// The default options used by tests and library embedders.
#[must_use]
pub fn default_frontend_options() -> Arc<dyn Frontend> {
	Arc::new(FrontendOptions::default())
}

#[cfg(feature = "binaries")]
pub use binaries::CliArguments;

#[cfg(feature = "binaries")]
mod binaries {
	use std::path::PathBuf;

	use clap::Parser;

	use super::FrontendOptions;

	/// A tracing disassembler for 6502-family binaries.
	///
	/// Loads a raw image, traces code from the given entry points and
	/// writes assembler source to stdout that reassembles byte for byte.
	/// Serious disassembly work drives the library from a Rust control
	/// program instead; this binary covers the quick-look cases.
	#[derive(Debug, Parser)]
	#[command(version, about)]
	pub struct CliArguments {
		/// The binary image to disassemble.
		pub input: PathBuf,

		/// Load address of the image (hex, e.g. `8000` or `0x8000`).
		#[arg(short = 'l', long, value_parser = parse_address)]
		pub load: u16,

		/// Entry point (hex); may be given several times. Defaults to the
		/// load address.
		#[arg(short = 'e', long = "entry", value_parser = parse_address)]
		pub entries: Vec<u16>,

		/// Expected MD5 digest of the image.
		#[arg(long)]
		pub md5: Option<String>,

		/// Decode with the 65C02 extensions.
		#[arg(long)]
		pub cmos: bool,

		/// Generate beebasm output (default).
		#[arg(short = 'b', long, group = "assembler")]
		pub beebasm: bool,

		/// Generate acme output.
		#[arg(short = 'a', long, group = "assembler")]
		pub acme: bool,

		/// Generate xa output.
		#[arg(short = 'x', long, group = "assembler")]
		pub xa: bool,

		/// Generate lower-case output (default).
		#[arg(long, group = "case")]
		pub lower: bool,

		/// Generate upper-case output.
		#[arg(short = 'u', long, group = "case")]
		pub upper: bool,

		/// Output filename recorded with the back-end (beebasm's `save`).
		#[arg(short = 'o', long)]
		pub output: Option<String>,
	}

	impl CliArguments {
		/// The frontend options these flags describe.
		#[must_use]
		pub fn frontend_options(&self) -> FrontendOptions {
			FrontendOptions { lower_case: !self.upper, ..FrontendOptions::default() }
		}
	}

	/// Parses a 16-bit hex address with an optional `0x`, `&` or `$`
	/// prefix.
	fn parse_address(text: &str) -> Result<u16, String> {
		let digits = text
			.strip_prefix("0x")
			.or_else(|| text.strip_prefix("0X"))
			.or_else(|| text.strip_prefix('&'))
			.or_else(|| text.strip_prefix('$'))
			.unwrap_or(text);
		u16::from_str_radix(digits, 16).map_err(|error| format!("\"{text}\" is not a hex address: {error}"))
	}

	#[cfg(test)]
	mod test {
		use super::parse_address;

		#[test]
		fn address_prefixes() {
			assert_eq!(parse_address("8000"), Ok(0x8000));
			assert_eq!(parse_address("0x0e00"), Ok(0x0e00));
			assert_eq!(parse_address("&fff4"), Ok(0xfff4));
			assert_eq!(parse_address("$70"), Ok(0x70));
			assert!(parse_address("0x10000").is_err());
			assert!(parse_address("start").is_err());
		}
	}
}
