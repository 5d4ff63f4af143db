//! The acme back-end.

#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;

use flexstr::{shared_fmt, SharedStr, ToSharedStr};

use super::{force_case, Formatter, RelocationBlock};
use crate::memory::RuntimeAddr;

/// The acme syntax.
#[derive(Debug)]
pub struct Acme {
	upper:              bool,
	pending_assertions: BTreeMap<String, u32>,
}

impl Acme {
	/// Creates the back-end; `upper` selects upper-case keywords.
	#[must_use]
	pub fn new(upper: bool) -> Self {
		Self { upper, pending_assertions: BTreeMap::new() }
	}

	fn keyword(&self, text: &str) -> SharedStr {
		force_case(text, self.upper)
	}
}

impl Formatter for Acme {
	fn name(&self) -> &'static str {
		"acme"
	}

	fn hex2(&self, value: u8) -> SharedStr {
		shared_fmt!("${value:02x}")
	}

	// At least one version of acme dislikes a label defined with a
	// four-digit value being used where a zero-page operand is expected, so
	// wide literals only appear when the value needs them.
	fn hex4(&self, value: u32) -> SharedStr {
		self.hex(value)
	}

	fn hex(&self, value: u32) -> SharedStr {
		if value <= 0xff { self.hex2(value as u8) } else { shared_fmt!("${value:04x}") }
	}

	fn inline_label(&self, name: &str) -> SharedStr {
		name.to_shared_str()
	}

	fn comment_prefix(&self) -> &'static str {
		";"
	}

	fn explicit_a(&self) -> bool {
		false
	}

	fn assert_expr(&mut self, expression: &str, value: u32) {
		self.pending_assertions.insert(expression.to_owned(), value);
	}

	fn disassembly_start(&mut self) -> Vec<String> {
		Vec::new()
	}

	fn disassembly_end(&mut self) -> Vec<String> {
		let mut result = Vec::new();
		for (expression, value) in &self.pending_assertions {
			let value = self.hex(*value);
			result.push(format!("{} {expression} != {value} {{", self.keyword("!if")));
			result.push(format!("    {} \"Assertion failed: {expression} == {value}\"", self.keyword("!error")));
			result.push("}".to_owned());
		}
		if !result.is_empty() {
			result.push(String::new());
		}
		result
	}

	fn code_start(&mut self, start: RuntimeAddr, _end: RuntimeAddr, _first: bool) -> Vec<String> {
		vec![format!("    * = {}", self.hex4(start.value()))]
	}

	fn code_end(&mut self) -> Vec<String> {
		Vec::new()
	}

	fn byte_prefix(&self) -> SharedStr {
		shared_fmt!("    {} ", self.keyword("!byte"))
	}

	fn word_prefix(&self) -> SharedStr {
		shared_fmt!("    {} ", self.keyword("!word"))
	}

	fn string_prefix(&self) -> SharedStr {
		shared_fmt!("    {} ", self.keyword("!text"))
	}

	fn string_chr(&self, byte: u8) -> Option<char> {
		// Backslashes and quotes would need escaping; emitting them as byte
		// values is simpler and assembles identically.
		(byte >= 0x20 && byte < 0x7f && byte != b'\\' && byte != b'"').then_some(byte as char)
	}

	fn pseudopc_start(&mut self, block: &RelocationBlock) -> Vec<String> {
		vec![format!("    {} {} {{", self.keyword("!pseudopc"), self.hex(block.dest.value()))]
	}

	fn pseudopc_end(&mut self, _block: &RelocationBlock) -> Vec<String> {
		vec!["}".to_owned()]
	}

	fn force_abs_instruction(&self, mnemonic: &str, prefix: &str, operand: &str, suffix: &str)
	-> Option<String> {
		Some(format!("    {mnemonic}+2 {prefix}{operand}{suffix}"))
	}
}
