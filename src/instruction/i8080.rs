//! An Intel 8080 instruction subset.
//!
//! The 8080 table exists to keep the instruction-set seam honest: nothing
//! in the tracer may assume 6502 shapes. It covers the register-to-register
//! and arithmetic blocks (which decode by bit pattern), immediates, and the
//! whole control-flow group. Stack, I/O and the rarer rotates are present
//! where cheap; anything missing simply stops the trace, same as an
//! undocumented 6502 opcode.

use flexstr::shared_fmt;

use super::{clear_state, neutral, InstructionSet, Opcode, OpcodeTable};

const REGISTERS: [&str; 8] = ["b", "c", "d", "e", "h", "l", "m", "a"];
const REGISTER_PAIRS: [&str; 4] = ["b", "d", "h", "sp"];
const ARITHMETIC: [&str; 8] = ["add", "adc", "sub", "sbb", "ana", "xra", "ora", "cmp"];
const CONDITIONS: [&str; 8] = ["nz", "z", "nc", "c", "po", "pe", "p", "m"];

/// The Intel 8080 subset.
#[derive(Debug)]
pub struct I8080 {
	opcodes: OpcodeTable,
}

impl I8080 {
	/// Creates the instruction set.
	#[must_use]
	pub fn new() -> Self {
		Self { opcodes: build_table() }
	}
}

impl Default for I8080 {
	fn default() -> Self {
		Self::new()
	}
}

impl InstructionSet for I8080 {
	fn name(&self) -> &'static str {
		"8080"
	}

	fn opcode(&self, byte: u8) -> Option<&Opcode> {
		self.opcodes[byte as usize].as_ref()
	}
}

#[allow(clippy::too_many_lines)]
fn build_table() -> OpcodeTable {
	let mut t: OpcodeTable = std::array::from_fn(|_| None);

	// Register-to-register moves, 0x40..0x7f; 0x76 is HLT.
	for (dest_index, dest) in REGISTERS.iter().enumerate() {
		for (source_index, source) in REGISTERS.iter().enumerate() {
			let byte = 0x40 + dest_index * 8 + source_index;
			if byte == 0x76 {
				continue;
			}
			t[byte] = Some(Opcode::implied(&shared_fmt!("MOV {dest},{source}"), neutral));
		}
	}
	t[0x76] = Some(Opcode::ret("HLT"));

	// Arithmetic and logic on registers, 0x80..0xbf.
	for (op_index, op) in ARITHMETIC.iter().enumerate() {
		for (register_index, register) in REGISTERS.iter().enumerate() {
			let byte = 0x80 + op_index * 8 + register_index;
			t[byte] = Some(Opcode::implied(&shared_fmt!("{} {register}", op.to_uppercase()), clear_state));
		}
	}

	// Per-register and per-pair groups.
	for (register_index, register) in REGISTERS.iter().enumerate() {
		t[register_index * 8 + 0x04] = Some(Opcode::implied(&shared_fmt!("INR {register}"), clear_state));
		t[register_index * 8 + 0x05] = Some(Opcode::implied(&shared_fmt!("DCR {register}"), clear_state));
		t[register_index * 8 + 0x06] = Some(Opcode::immediate(&shared_fmt!("MVI {register},"), 1, clear_state));
	}
	for (pair_index, pair) in REGISTER_PAIRS.iter().enumerate() {
		t[pair_index * 16 + 0x01] = Some(Opcode::immediate(&shared_fmt!("LXI {pair},"), 2, clear_state));
		t[pair_index * 16 + 0x03] = Some(Opcode::implied(&shared_fmt!("INX {pair}"), neutral));
		t[pair_index * 16 + 0x0b] = Some(Opcode::implied(&shared_fmt!("DCX {pair}"), neutral));
	}
	t[0x02] = Some(Opcode::implied("STAX b", neutral));
	t[0x12] = Some(Opcode::implied("STAX d", neutral));
	t[0x0a] = Some(Opcode::implied("LDAX b", clear_state));
	t[0x1a] = Some(Opcode::implied("LDAX d", clear_state));

	// Conditional control flow, 0xc0..0xff in steps of 8.
	for (condition_index, condition) in CONDITIONS.iter().enumerate() {
		// Conditional returns fall straight through; we can't know whether
		// they are taken.
		t[0xc0 + condition_index * 8] =
			Some(Opcode::implied(&shared_fmt!("R{}", condition.to_uppercase()), neutral));
		t[0xc2 + condition_index * 8] = Some(Opcode::cond_jump(&shared_fmt!("J{}", condition.to_uppercase())));
		t[0xc4 + condition_index * 8] = Some(Opcode::cond_jump(&shared_fmt!("C{}", condition.to_uppercase())));
	}
	t[0xc3] = Some(Opcode::jmp_abs("JMP"));
	t[0xc9] = Some(Opcode::ret("RET"));
	t[0xcd] = Some(Opcode::call("CALL"));
	// PCHL jumps through HL; like an indirect jump we can't follow it.
	t[0xe9] = Some(Opcode::ret("PCHL"));

	// Immediate arithmetic.
	for (op_index, op) in ["adi", "aci", "sui", "sbi", "ani", "xri", "ori", "cpi"].iter().enumerate() {
		t[0xc6 + op_index * 8] = Some(Opcode::immediate(&op.to_uppercase(), 1, clear_state));
	}

	// Stack, direct loads and the leftovers.
	for (pair_index, pair) in ["b", "d", "h", "psw"].iter().enumerate() {
		t[0xc5 + pair_index * 16] = Some(Opcode::implied(&shared_fmt!("PUSH {pair}"), neutral));
		t[0xc1 + pair_index * 16] = Some(Opcode::implied(&shared_fmt!("POP {pair}"), clear_state));
	}
	t[0x22] = Some(Opcode::abs("SHLD", "", false, neutral));
	t[0x2a] = Some(Opcode::abs("LHLD", "", false, clear_state));
	t[0x32] = Some(Opcode::abs("STA", "", false, neutral));
	t[0x3a] = Some(Opcode::abs("LDA", "", false, clear_state));
	t[0x00] = Some(Opcode::implied("NOP", neutral));
	t[0x07] = Some(Opcode::implied("RLC", clear_state));
	t[0x0f] = Some(Opcode::implied("RRC", clear_state));
	t[0x17] = Some(Opcode::implied("RAL", clear_state));
	t[0x1f] = Some(Opcode::implied("RAR", clear_state));
	t[0x27] = Some(Opcode::implied("DAA", clear_state));
	t[0x2f] = Some(Opcode::implied("CMA", clear_state));
	t[0x37] = Some(Opcode::implied("STC", neutral));
	t[0x3f] = Some(Opcode::implied("CMC", neutral));
	t[0xd3] = Some(Opcode::immediate("OUT", 1, neutral));
	t[0xdb] = Some(Opcode::immediate("IN", 1, clear_state));
	t[0xe3] = Some(Opcode::implied("XTHL", neutral));
	t[0xeb] = Some(Opcode::implied("XCHG", neutral));
	t[0xf3] = Some(Opcode::implied("DI", neutral));
	t[0xf9] = Some(Opcode::implied("SPHL", neutral));
	t[0xfb] = Some(Opcode::implied("EI", neutral));

	t
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::instruction::AddressingMode;

	#[test]
	fn decode_groups() {
		let set = I8080::new();
		assert_eq!(set.opcode(0x78).unwrap().mnemonic, "MOV a,b");
		assert_eq!(set.opcode(0xb1).unwrap().mnemonic, "ORA c");
		assert_eq!(set.opcode(0xc8).unwrap().mnemonic, "RZ");
		assert_eq!(set.opcode(0xc8).unwrap().mode, AddressingMode::Implied);
		assert_eq!(set.opcode(0xc2).unwrap().mode, AddressingMode::ConditionalJump);
		assert!(set.opcode(0xc9).unwrap().is_block_end());
		assert_eq!(set.opcode(0x06).unwrap().length(), 2);
		assert_eq!(set.opcode(0x31).unwrap().length(), 3);
		assert!(set.opcode(0x76).unwrap().is_block_end());
	}
}
