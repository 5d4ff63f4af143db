//! The MOS 6502 instruction set, with optional 65C02 extensions.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use super::{neutral, CpuState, Flag, InstructionSet, Opcode, OpcodeTable, Register, RegisterState};
use crate::memory::{BinaryAddr, MemoryModel};

/// The documented 6502 opcode table. Undocumented opcodes are absent on
/// purpose: tracing through them almost always means we are decoding data,
/// and stopping the branch is the safer outcome.
#[derive(Debug)]
pub struct Mos6502 {
	cmos:    bool,
	opcodes: OpcodeTable,
}

impl Mos6502 {
	/// Creates the instruction set; `cmos` adds the common 65C02
	/// extensions.
	#[must_use]
	pub fn new(cmos: bool) -> Self {
		Self { cmos, opcodes: build_table(cmos) }
	}

	/// Whether this is the 65C02 variant.
	#[must_use]
	pub const fn is_cmos(&self) -> bool {
		self.cmos
	}
}

impl InstructionSet for Mos6502 {
	fn name(&self) -> &'static str {
		if self.cmos { "65c02" } else { "6502" }
	}

	fn opcode(&self, byte: u8) -> Option<&Opcode> {
		self.opcodes[byte as usize].as_ref()
	}
}

fn corrupt_register(state: &mut CpuState, register: Register) {
	state.set_register(register, RegisterState::default());
	state.set_flag(Flag::N, None);
	state.set_flag(Flag::Z, None);
}

fn update_anz(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	corrupt_register(state, Register::A);
}

fn update_anzc(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	corrupt_register(state, Register::A);
	state.set_flag(Flag::C, None);
}

fn update_xnz(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	corrupt_register(state, Register::X);
}

fn update_ynz(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	corrupt_register(state, Register::Y);
}

fn update_nz(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	state.set_flag(Flag::N, None);
	state.set_flag(Flag::Z, None);
}

fn update_nzc(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	state.set_flag(Flag::N, None);
	state.set_flag(Flag::Z, None);
	state.set_flag(Flag::C, None);
}

fn update_bit(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	state.set_flag(Flag::N, None);
	state.set_flag(Flag::V, None);
	state.set_flag(Flag::Z, None);
}

fn update_adc_sbc(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	state.set_flag(Flag::N, None);
	state.set_flag(Flag::V, None);
	state.set_flag(Flag::Z, None);
	state.set_flag(Flag::C, None);
}

fn corrupt_flags(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	for flag in [Flag::N, Flag::V, Flag::D, Flag::I, Flag::Z, Flag::C] {
		state.set_flag(flag, None);
	}
}

fn load_immediate(register: Register, addr: BinaryAddr, memory: &MemoryModel, state: &mut CpuState) {
	let Some(operand_addr) = addr.checked_add(1) else {
		corrupt_register(state, register);
		return;
	};
	match memory.u8(operand_addr) {
		Some(value) => {
			state.set_register(register, RegisterState { value: Some(value), loaded_from: Some(operand_addr) });
			state.set_flag(Flag::N, Some(value & 0x80 != 0));
			state.set_flag(Flag::Z, Some(value == 0));
		},
		None => corrupt_register(state, register),
	}
}

fn lda_immediate(addr: BinaryAddr, memory: &MemoryModel, state: &mut CpuState) {
	load_immediate(Register::A, addr, memory, state);
}

fn ldx_immediate(addr: BinaryAddr, memory: &MemoryModel, state: &mut CpuState) {
	load_immediate(Register::X, addr, memory, state);
}

fn ldy_immediate(addr: BinaryAddr, memory: &MemoryModel, state: &mut CpuState) {
	load_immediate(Register::Y, addr, memory, state);
}

fn transfer(source: Register, dest: Register, state: &mut CpuState) {
	let value = state.register(source);
	state.set_register(dest, value);
	if let Some(value) = value.value {
		state.set_flag(Flag::N, Some(value & 0x80 != 0));
		state.set_flag(Flag::Z, Some(value == 0));
	} else {
		state.set_flag(Flag::N, None);
		state.set_flag(Flag::Z, None);
	}
}

fn txa(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	transfer(Register::X, Register::A, state);
}

fn tya(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	transfer(Register::Y, Register::A, state);
}

fn tax(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	transfer(Register::A, Register::X, state);
}

fn tay(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	transfer(Register::A, Register::Y, state);
}

fn step_register(register: Register, delta: i16, state: &mut CpuState) {
	let current = state.register(register);
	match current.value {
		// The stepped value is known but no longer comes straight from an
		// immediate operand.
		Some(value) => {
			let stepped = (i16::from(value) + delta).rem_euclid(0x100) as u8;
			state.set_register(register, RegisterState { value: Some(stepped), loaded_from: None });
			state.set_flag(Flag::N, Some(stepped & 0x80 != 0));
			state.set_flag(Flag::Z, Some(stepped == 0));
		},
		None => corrupt_register(state, register),
	}
}

fn inx(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	step_register(Register::X, 1, state);
}

fn dex(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	step_register(Register::X, -1, state);
}

fn iny(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	step_register(Register::Y, 1, state);
}

fn dey(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	step_register(Register::Y, -1, state);
}

fn set_flag_update(flag: Flag, value: bool, state: &mut CpuState) {
	state.set_flag(flag, Some(value));
}

fn clc(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	set_flag_update(Flag::C, false, state);
}

fn sec(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	set_flag_update(Flag::C, true, state);
}

fn cli(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	set_flag_update(Flag::I, false, state);
}

fn sei(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	set_flag_update(Flag::I, true, state);
}

fn clv(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	set_flag_update(Flag::V, false, state);
}

fn cld(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	set_flag_update(Flag::D, false, state);
}

fn sed(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	set_flag_update(Flag::D, true, state);
}

#[allow(clippy::too_many_lines)]
fn build_table(cmos: bool) -> OpcodeTable {
	let mut t: OpcodeTable = std::array::from_fn(|_| None);

	t[0x00] = Some(Opcode::ret("BRK"));
	t[0x01] = Some(Opcode::zp("ORA", ",X)", update_anz));
	t[0x05] = Some(Opcode::zp("ORA", "", update_anz));
	t[0x06] = Some(Opcode::zp("ASL", "", update_nzc));
	t[0x08] = Some(Opcode::implied("PHP", neutral));
	t[0x09] = Some(Opcode::immediate("ORA", 1, update_anz));
	t[0x0a] = Some(Opcode::implied("ASL A", update_anzc));
	t[0x0d] = Some(Opcode::abs("ORA", "", true, update_anz));
	t[0x0e] = Some(Opcode::abs("ASL", "", true, update_nzc));
	t[0x10] = Some(Opcode::branch("BPL"));
	t[0x11] = Some(Opcode::zp("ORA", "),Y", update_anz));
	t[0x15] = Some(Opcode::zp("ORA", ",X", update_anz));
	t[0x16] = Some(Opcode::zp("ASL", ",X", update_nzc));
	t[0x18] = Some(Opcode::implied("CLC", clc));
	t[0x19] = Some(Opcode::abs("ORA", ",Y", false, update_anz));
	t[0x1d] = Some(Opcode::abs("ORA", ",X", true, update_anz));
	t[0x1e] = Some(Opcode::abs("ASL", ",X", true, update_nzc));
	t[0x20] = Some(Opcode::call("JSR"));
	t[0x21] = Some(Opcode::zp("AND", ",X)", update_anz));
	t[0x24] = Some(Opcode::zp("BIT", "", update_bit));
	t[0x25] = Some(Opcode::zp("AND", "", update_anz));
	t[0x26] = Some(Opcode::zp("ROL", "", update_nzc));
	t[0x28] = Some(Opcode::implied("PLP", corrupt_flags));
	t[0x29] = Some(Opcode::immediate("AND", 1, update_anz));
	t[0x2a] = Some(Opcode::implied("ROL A", update_anzc));
	t[0x2c] = Some(Opcode::abs("BIT", "", true, update_bit));
	t[0x2d] = Some(Opcode::abs("AND", "", true, update_anz));
	t[0x2e] = Some(Opcode::abs("ROL", "", true, update_nzc));
	t[0x30] = Some(Opcode::branch("BMI"));
	t[0x31] = Some(Opcode::zp("AND", "),Y", update_anz));
	t[0x35] = Some(Opcode::zp("AND", ",X", update_anz));
	t[0x36] = Some(Opcode::zp("ROL", ",X", update_nzc));
	t[0x38] = Some(Opcode::implied("SEC", sec));
	t[0x39] = Some(Opcode::abs("AND", ",Y", false, update_anz));
	t[0x3d] = Some(Opcode::abs("AND", ",X", true, update_anz));
	t[0x3e] = Some(Opcode::abs("ROL", ",X", true, update_nzc));
	t[0x40] = Some(Opcode::ret("RTI"));
	t[0x41] = Some(Opcode::zp("EOR", ",X)", update_anz));
	t[0x45] = Some(Opcode::zp("EOR", "", update_anz));
	t[0x46] = Some(Opcode::zp("LSR", "", update_nzc));
	t[0x48] = Some(Opcode::implied("PHA", neutral));
	t[0x49] = Some(Opcode::immediate("EOR", 1, update_anz));
	t[0x4a] = Some(Opcode::implied("LSR A", update_anzc));
	t[0x4c] = Some(Opcode::jmp_abs("JMP"));
	t[0x4d] = Some(Opcode::abs("EOR", "", true, update_anz));
	t[0x4e] = Some(Opcode::abs("LSR", "", true, update_nzc));
	t[0x50] = Some(Opcode::branch("BVC"));
	t[0x51] = Some(Opcode::zp("EOR", "),Y", update_anz));
	t[0x55] = Some(Opcode::zp("EOR", ",X", update_anz));
	t[0x56] = Some(Opcode::zp("LSR", ",X", update_nzc));
	t[0x58] = Some(Opcode::implied("CLI", cli));
	t[0x59] = Some(Opcode::abs("EOR", ",Y", false, update_anz));
	t[0x5d] = Some(Opcode::abs("EOR", ",X", true, update_anz));
	t[0x5e] = Some(Opcode::abs("LSR", ",X", true, update_nzc));
	t[0x60] = Some(Opcode::ret("RTS"));
	t[0x61] = Some(Opcode::zp("ADC", ",X)", update_adc_sbc));
	t[0x65] = Some(Opcode::zp("ADC", "", update_adc_sbc));
	t[0x66] = Some(Opcode::zp("ROR", "", update_nzc));
	t[0x68] = Some(Opcode::implied("PLA", update_anz));
	t[0x69] = Some(Opcode::immediate("ADC", 1, update_adc_sbc));
	t[0x6a] = Some(Opcode::implied("ROR A", update_anzc));
	t[0x6c] = Some(Opcode::jmp_ind("JMP", ")"));
	t[0x6d] = Some(Opcode::abs("ADC", "", true, update_adc_sbc));
	t[0x6e] = Some(Opcode::abs("ROR", "", true, update_nzc));
	t[0x70] = Some(Opcode::branch("BVS"));
	t[0x71] = Some(Opcode::zp("ADC", "),Y", update_adc_sbc));
	t[0x75] = Some(Opcode::zp("ADC", ",X", update_adc_sbc));
	t[0x76] = Some(Opcode::zp("ROR", ",X", update_nzc));
	t[0x78] = Some(Opcode::implied("SEI", sei));
	t[0x79] = Some(Opcode::abs("ADC", ",Y", false, update_adc_sbc));
	t[0x7d] = Some(Opcode::abs("ADC", ",X", true, update_adc_sbc));
	t[0x7e] = Some(Opcode::abs("ROR", ",X", true, update_nzc));
	t[0x81] = Some(Opcode::zp("STA", ",X)", neutral));
	t[0x84] = Some(Opcode::zp("STY", "", neutral));
	t[0x85] = Some(Opcode::zp("STA", "", neutral));
	t[0x86] = Some(Opcode::zp("STX", "", neutral));
	t[0x88] = Some(Opcode::implied("DEY", dey));
	t[0x8a] = Some(Opcode::implied("TXA", txa));
	t[0x8c] = Some(Opcode::abs("STY", "", true, neutral));
	t[0x8d] = Some(Opcode::abs("STA", "", true, neutral));
	t[0x8e] = Some(Opcode::abs("STX", "", true, neutral));
	t[0x90] = Some(Opcode::branch("BCC"));
	t[0x91] = Some(Opcode::zp("STA", "),Y", neutral));
	t[0x94] = Some(Opcode::zp("STY", ",X", neutral));
	t[0x95] = Some(Opcode::zp("STA", ",X", neutral));
	t[0x96] = Some(Opcode::zp("STX", ",Y", neutral));
	t[0x98] = Some(Opcode::implied("TYA", tya));
	t[0x99] = Some(Opcode::abs("STA", ",Y", false, neutral));
	// We don't model the stack pointer at all.
	t[0x9a] = Some(Opcode::implied("TXS", neutral));
	t[0x9d] = Some(Opcode::abs("STA", ",X", true, neutral));
	t[0xa0] = Some(Opcode::immediate("LDY", 1, ldy_immediate));
	t[0xa1] = Some(Opcode::zp("LDA", ",X)", update_anz));
	t[0xa2] = Some(Opcode::immediate("LDX", 1, ldx_immediate));
	t[0xa4] = Some(Opcode::zp("LDY", "", update_ynz));
	t[0xa5] = Some(Opcode::zp("LDA", "", update_anz));
	t[0xa6] = Some(Opcode::zp("LDX", "", update_xnz));
	t[0xa8] = Some(Opcode::implied("TAY", tay));
	t[0xa9] = Some(Opcode::immediate("LDA", 1, lda_immediate));
	t[0xaa] = Some(Opcode::implied("TAX", tax));
	t[0xac] = Some(Opcode::abs("LDY", "", true, update_ynz));
	t[0xad] = Some(Opcode::abs("LDA", "", true, update_anz));
	t[0xae] = Some(Opcode::abs("LDX", "", true, update_xnz));
	t[0xb0] = Some(Opcode::branch("BCS"));
	t[0xb1] = Some(Opcode::zp("LDA", "),Y", update_anz));
	t[0xb4] = Some(Opcode::zp("LDY", ",X", update_ynz));
	t[0xb5] = Some(Opcode::zp("LDA", ",X", update_anz));
	t[0xb6] = Some(Opcode::zp("LDX", ",Y", update_xnz));
	t[0xb8] = Some(Opcode::implied("CLV", clv));
	t[0xb9] = Some(Opcode::abs("LDA", ",Y", false, update_anz));
	t[0xba] = Some(Opcode::implied("TSX", update_xnz));
	t[0xbc] = Some(Opcode::abs("LDY", ",X", true, update_ynz));
	t[0xbd] = Some(Opcode::abs("LDA", ",X", true, update_anz));
	t[0xbe] = Some(Opcode::abs("LDX", ",Y", false, update_xnz));
	t[0xc0] = Some(Opcode::immediate("CPY", 1, update_nzc));
	t[0xc1] = Some(Opcode::zp("CMP", ",X)", update_nzc));
	t[0xc4] = Some(Opcode::zp("CPY", "", update_nzc));
	t[0xc5] = Some(Opcode::zp("CMP", "", update_nzc));
	t[0xc6] = Some(Opcode::zp("DEC", "", update_nz));
	t[0xc8] = Some(Opcode::implied("INY", iny));
	t[0xc9] = Some(Opcode::immediate("CMP", 1, update_nzc));
	t[0xca] = Some(Opcode::implied("DEX", dex));
	t[0xcc] = Some(Opcode::abs("CPY", "", true, update_nzc));
	t[0xcd] = Some(Opcode::abs("CMP", "", true, update_nzc));
	t[0xce] = Some(Opcode::abs("DEC", "", true, update_nz));
	t[0xd0] = Some(Opcode::branch("BNE"));
	t[0xd1] = Some(Opcode::zp("CMP", "),Y", update_nzc));
	t[0xd5] = Some(Opcode::zp("CMP", ",X", update_nzc));
	t[0xd6] = Some(Opcode::zp("DEC", ",X", update_nz));
	t[0xd8] = Some(Opcode::implied("CLD", cld));
	t[0xd9] = Some(Opcode::abs("CMP", ",Y", false, update_nzc));
	t[0xdd] = Some(Opcode::abs("CMP", ",X", true, update_nzc));
	t[0xde] = Some(Opcode::abs("DEC", ",X", true, update_nz));
	t[0xe0] = Some(Opcode::immediate("CPX", 1, update_nzc));
	t[0xe1] = Some(Opcode::zp("SBC", ",X)", update_adc_sbc));
	t[0xe4] = Some(Opcode::zp("CPX", "", update_nzc));
	t[0xe5] = Some(Opcode::zp("SBC", "", update_adc_sbc));
	t[0xe6] = Some(Opcode::zp("INC", "", update_nz));
	t[0xe8] = Some(Opcode::implied("INX", inx));
	t[0xe9] = Some(Opcode::immediate("SBC", 1, update_adc_sbc));
	t[0xea] = Some(Opcode::implied("NOP", neutral));
	t[0xec] = Some(Opcode::abs("CPX", "", true, update_nzc));
	t[0xed] = Some(Opcode::abs("SBC", "", true, update_adc_sbc));
	t[0xee] = Some(Opcode::abs("INC", "", true, update_nz));
	t[0xf0] = Some(Opcode::branch("BEQ"));
	t[0xf1] = Some(Opcode::zp("SBC", "),Y", update_adc_sbc));
	t[0xf5] = Some(Opcode::zp("SBC", ",X", update_adc_sbc));
	t[0xf6] = Some(Opcode::zp("INC", ",X", update_nz));
	t[0xf8] = Some(Opcode::implied("SED", sed));
	t[0xf9] = Some(Opcode::abs("SBC", ",Y", false, update_adc_sbc));
	t[0xfd] = Some(Opcode::abs("SBC", ",X", true, update_adc_sbc));
	t[0xfe] = Some(Opcode::abs("INC", ",X", true, update_nz));

	if cmos {
		t[0x04] = Some(Opcode::zp("TSB", "", update_nz));
		t[0x0c] = Some(Opcode::abs("TSB", "", true, update_nz));
		t[0x12] = Some(Opcode::zp("ORA", ")", update_anz));
		t[0x14] = Some(Opcode::zp("TRB", "", update_nz));
		t[0x1a] = Some(Opcode::implied("INC A", update_anz));
		t[0x1c] = Some(Opcode::abs("TRB", "", true, update_nz));
		t[0x32] = Some(Opcode::zp("AND", ")", update_anz));
		t[0x34] = Some(Opcode::zp("BIT", ",X", update_bit));
		t[0x3a] = Some(Opcode::implied("DEC A", update_anz));
		t[0x3c] = Some(Opcode::abs("BIT", ",X", true, update_bit));
		t[0x52] = Some(Opcode::zp("EOR", ")", update_anz));
		t[0x5a] = Some(Opcode::implied("PHY", neutral));
		t[0x64] = Some(Opcode::zp("STZ", "", neutral));
		t[0x72] = Some(Opcode::zp("ADC", ")", update_adc_sbc));
		t[0x74] = Some(Opcode::zp("STZ", ",X", neutral));
		t[0x7a] = Some(Opcode::implied("PLY", update_ynz));
		t[0x7c] = Some(Opcode::jmp_ind("JMP", ",X)"));
		t[0x80] = Some(Opcode::branch_always("BRA"));
		t[0x89] = Some(Opcode::immediate("BIT", 1, update_bit));
		t[0x92] = Some(Opcode::zp("STA", ")", neutral));
		t[0x9c] = Some(Opcode::abs("STZ", "", true, neutral));
		t[0x9e] = Some(Opcode::abs("STZ", ",X", true, neutral));
		t[0xb2] = Some(Opcode::zp("LDA", ")", update_anz));
		t[0xd2] = Some(Opcode::zp("CMP", ")", update_nzc));
		t[0xda] = Some(Opcode::implied("PHX", neutral));
		t[0xf2] = Some(Opcode::zp("SBC", ")", update_adc_sbc));
		t[0xfa] = Some(Opcode::implied("PLX", update_xnz));
	}

	t
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::instruction::AddressingMode;

	#[test]
	fn table_shape() {
		let nmos = Mos6502::new(false);
		assert_eq!(nmos.opcode(0xa9).unwrap().mnemonic, "LDA");
		assert_eq!(nmos.opcode(0xa9).unwrap().length(), 2);
		assert_eq!(nmos.opcode(0x4c).unwrap().mode, AddressingMode::JumpAbsolute);
		assert!(nmos.opcode(0x4c).unwrap().is_block_end());
		assert!(nmos.opcode(0x20).unwrap().is_subroutine_call());
		// Undocumented opcode.
		assert!(nmos.opcode(0x02).is_none());
		// BRA is CMOS only.
		assert!(nmos.opcode(0x80).is_none());
		let cmos = Mos6502::new(true);
		assert!(cmos.opcode(0x80).unwrap().is_block_end());
		assert_eq!(cmos.name(), "65c02");
	}

	#[test]
	fn immediate_loads_record_their_operand_address() {
		let mut memory = MemoryModel::new();
		memory.load(BinaryAddr::new(0x2000), &[0xa9, 0x7e], None, "test").unwrap();
		let mut state = CpuState::default();
		lda_immediate(BinaryAddr::new(0x2000), &memory, &mut state);
		assert_eq!(state.a.value, Some(0x7e));
		assert_eq!(state.a.loaded_from, Some(BinaryAddr::new(0x2001)));
		assert_eq!(state.z, Some(false));
		// A branch forgets everything again.
		state.clear();
		assert_eq!(state.a.value, None);
	}
}
