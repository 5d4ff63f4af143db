//! The beebasm back-end (default).
//!
//! beebasm has no `!pseudopc`; relocated blocks are assembled at their
//! destination address and then `copyblock`ed back over their position in
//! the binary, which reproduces the image byte for byte while letting all
//! labels take their runtime values.

#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;

use flexstr::{shared_fmt, SharedStr};

use super::{force_case, Formatter, RelocationBlock};
use crate::memory::RuntimeAddr;

/// The beebasm syntax.
#[derive(Debug)]
pub struct BeebAsm {
	upper:              bool,
	cmos:               bool,
	output_filename:    Option<String>,
	pending_assertions: BTreeMap<String, u32>,
	code_end_addr:      u32,
}

impl BeebAsm {
	/// Creates the back-end; `upper` selects upper-case keywords.
	#[must_use]
	pub fn new(upper: bool) -> Self {
		Self {
			upper,
			cmos: false,
			output_filename: None,
			pending_assertions: BTreeMap::new(),
			code_end_addr: 0,
		}
	}

	/// Emits `cpu 1` at the top so 65C02 opcodes assemble.
	pub fn set_cmos(&mut self, cmos: bool) {
		self.cmos = cmos;
	}

	fn keyword(&self, text: &str) -> SharedStr {
		force_case(text, self.upper)
	}
}

impl Formatter for BeebAsm {
	fn name(&self) -> &'static str {
		"beebasm"
	}

	fn set_output_filename(&mut self, file_name: &str) {
		self.output_filename = Some(file_name.to_owned());
	}

	fn hex2(&self, value: u8) -> SharedStr {
		shared_fmt!("&{value:02x}")
	}

	fn hex4(&self, value: u32) -> SharedStr {
		shared_fmt!("&{value:04x}")
	}

	fn hex(&self, value: u32) -> SharedStr {
		if value <= 0xff { self.hex2(value as u8) } else { self.hex4(value) }
	}

	fn inline_label(&self, name: &str) -> SharedStr {
		shared_fmt!(".{name}")
	}

	fn comment_prefix(&self) -> &'static str {
		";"
	}

	fn explicit_a(&self) -> bool {
		true
	}

	fn assert_expr(&mut self, expression: &str, value: u32) {
		self.pending_assertions.insert(expression.to_owned(), value);
	}

	fn disassembly_start(&mut self) -> Vec<String> {
		if self.cmos {
			vec![format!("    {} 1", self.keyword("cpu")), String::new()]
		} else {
			Vec::new()
		}
	}

	fn disassembly_end(&mut self) -> Vec<String> {
		let mut result = vec![self.inline_label("disasm_end").to_string(), String::new()];
		if !self.pending_assertions.is_empty() {
			for (expression, value) in &self.pending_assertions {
				result.push(format!("    {} {expression} == {}", self.keyword("assert"), self.hex(*value)));
			}
			result.push(String::new());
		}
		let save = self.keyword("save");
		match &self.output_filename {
			Some(file_name) => result.push(format!("{save} \"{file_name}\", disasm_start, disasm_end")),
			None => result.push(format!("{save} disasm_start, disasm_end")),
		}
		result
	}

	fn code_start(&mut self, start: RuntimeAddr, end: RuntimeAddr, first: bool) -> Vec<String> {
		self.code_end_addr = end.value();
		let mut result = vec![
			format!("    {} {}", self.keyword("org"), self.hex4(start.value())),
			format!("    {} {}", self.keyword("guard"), self.hex4(end.value())),
		];
		if first {
			result.push(self.inline_label("disasm_start").to_string());
		}
		result
	}

	fn code_end(&mut self) -> Vec<String> {
		Vec::new()
	}

	fn byte_prefix(&self) -> SharedStr {
		shared_fmt!("    {} ", self.keyword("equb"))
	}

	fn word_prefix(&self) -> SharedStr {
		shared_fmt!("    {} ", self.keyword("equw"))
	}

	fn string_prefix(&self) -> SharedStr {
		shared_fmt!("    {} ", self.keyword("equs"))
	}

	fn string_chr(&self, byte: u8) -> Option<char> {
		(byte >= 0x20 && byte < 0x7f).then_some(byte as char)
	}

	fn pseudopc_start(&mut self, block: &RelocationBlock) -> Vec<String> {
		vec![
			format!("    {} {}", self.keyword("org"), self.hex(block.dest.value())),
			format!("    {} {}", self.keyword("guard"), self.hex(block.dest.value() + block.length)),
		]
	}

	fn pseudopc_end(&mut self, block: &RelocationBlock) -> Vec<String> {
		// copyblock must name the labels, not raw addresses, so the block
		// still round-trips if the user renames things.
		vec![
			format!(
				"    {} {}, {}, {}",
				self.keyword("copyblock"),
				block.dest_label,
				block.end_label,
				block.source_label
			),
			format!("    {} {}, {}", self.keyword("clear"), block.dest_label, block.end_label),
			format!(
				"    {} {} + ({} - {})",
				self.keyword("org"),
				block.source_label,
				block.end_label,
				block.dest_label
			),
			format!("    {} {}", self.keyword("guard"), self.hex(self.code_end_addr)),
		]
	}

	fn force_abs_instruction(&self, _: &str, _: &str, _: &str, _: &str) -> Option<String> {
		// beebasm picks the addressing mode from the operand's value; there
		// is no syntax to force the absolute form.
		None
	}
}
