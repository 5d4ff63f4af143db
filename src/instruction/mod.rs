//! Abstract instruction sets.
//!
//! An instruction set is a 256-entry table of [`Opcode`] descriptions;
//! behavior (operand targets, control-flow successors, block ends) is
//! dispatched on the opcode's [`AddressingMode`] rather than through a
//! class hierarchy, so adding a CPU means writing a table, not a type
//! family. Two tables ship: the MOS 6502 (with optional 65C02 extensions)
//! and an Intel 8080 subset.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use flexstr::SharedStr;

use crate::memory::{BinaryAddr, MemoryModel, RuntimeAddr};
use crate::movemanager::MoveManager;

pub mod i8080;
pub mod mos6502;

/// An 8-bit CPU register the abstract interpreter tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
	/// The accumulator.
	A,
	/// The X index register.
	X,
	/// The Y index register.
	Y,
}

/// A processor status flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
	/// Negative.
	N,
	/// Overflow.
	V,
	/// Decimal mode.
	D,
	/// Interrupt disable.
	I,
	/// Zero.
	Z,
	/// Carry.
	C,
}

/// What the abstract interpreter knows about one register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterState {
	/// The register's value, if known.
	pub value:       Option<u8>,
	/// The binary address of the immediate operand that loaded the value,
	/// if it came from an immediate load. Only set when `value` is known.
	pub loaded_from: Option<BinaryAddr>,
}

/// Optimistic straight-line CPU state: "this is *a* possible execution",
/// tracked while walking classified code without following branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuState {
	/// Accumulator knowledge.
	pub a: RegisterState,
	/// X register knowledge.
	pub x: RegisterState,
	/// Y register knowledge.
	pub y: RegisterState,
	/// Flag knowledge; `None` when unknown.
	pub n: Option<bool>,
	/// See `n`.
	pub v: Option<bool>,
	/// See `n`.
	pub d: Option<bool>,
	/// See `n`.
	pub i: Option<bool>,
	/// See `n`.
	pub z: Option<bool>,
	/// See `n`.
	pub c: Option<bool>,
}

impl CpuState {
	/// Forgets everything.
	pub fn clear(&mut self) {
		*self = Self::default();
	}

	/// The state of a register.
	#[must_use]
	pub const fn register(&self, register: Register) -> RegisterState {
		match register {
			Register::A => self.a,
			Register::X => self.x,
			Register::Y => self.y,
		}
	}

	/// Replaces the state of a register.
	pub fn set_register(&mut self, register: Register, state: RegisterState) {
		match register {
			Register::A => self.a = state,
			Register::X => self.x = state,
			Register::Y => self.y = state,
		}
	}

	/// Replaces the knowledge about a flag.
	pub fn set_flag(&mut self, flag: Flag, value: Option<bool>) {
		match flag {
			Flag::N => self.n = value,
			Flag::V => self.v = value,
			Flag::D => self.d = value,
			Flag::I => self.i = value,
			Flag::Z => self.z = value,
			Flag::C => self.c = value,
		}
	}
}

/// Side effect of an opcode on the optimistic CPU state. `addr` is the
/// instruction's binary address.
pub type StateUpdate = fn(addr: BinaryAddr, memory: &MemoryModel, state: &mut CpuState);

/// How an opcode addresses its operand, which also determines its
/// control-flow behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
	/// No operand; control falls through.
	Implied,
	/// Immediate operand (one or two bytes); control falls through.
	Immediate,
	/// One-byte address operand; control falls through.
	ZeroPage,
	/// Two-byte address operand, data access; control falls through.
	Absolute,
	/// Unconditional absolute jump; tail position, no fallthrough.
	JumpAbsolute,
	/// Indirect jump; references the vector, control flow stops.
	JumpIndirect,
	/// Absolute subroutine call; continuation decided by the call hook.
	SubroutineCall,
	/// Conditional relative branch; falls through and branches.
	ConditionalBranch,
	/// Unconditional relative branch; branches only, block end.
	UnconditionalBranch,
	/// Conditional absolute jump or call (non-6502 sets); falls through and
	/// jumps.
	ConditionalJump,
	/// Return or break; control flow stops.
	Return,
}

/// One opcode of an instruction set, as data.
#[derive(Debug, Clone)]
pub struct Opcode {
	/// Upper-case mnemonic, including any register spelled inside it
	/// ("ASL A", "mov b,c").
	pub mnemonic:       SharedStr,
	/// Addressing mode, which drives dispatch.
	pub mode:           AddressingMode,
	/// Operand length in bytes (0, 1 or 2).
	pub operand_length: usize,
	/// Text before the operand ("(" for indirect modes).
	pub prefix:         &'static str,
	/// Text after the operand (",X", "),Y", ")").
	pub suffix:         &'static str,
	/// Whether an absolute opcode has a zero-page twin; such instructions
	/// with operands below 0x100 must be forced absolute to reassemble
	/// byte-identically.
	pub has_zp_version: bool,
	/// Abstract-interpretation side effect.
	pub update:         StateUpdate,
}

/// Update that leaves the state untouched.
pub fn neutral(_: BinaryAddr, _: &MemoryModel, _: &mut CpuState) {}

/// Update that forgets everything.
pub fn clear_state(_: BinaryAddr, _: &MemoryModel, state: &mut CpuState) {
	state.clear();
}

impl Opcode {
	fn new(mnemonic: &str, mode: AddressingMode, operand_length: usize, suffix: &'static str) -> Self {
		Self {
			mnemonic: SharedStr::from(mnemonic),
			mode,
			operand_length,
			prefix: if suffix.contains(')') { "(" } else { "" },
			suffix,
			has_zp_version: false,
			update: clear_state,
		}
	}

	/// An operand-less opcode.
	#[must_use]
	pub fn implied(mnemonic: &str, update: StateUpdate) -> Self {
		Self { update, ..Self::new(mnemonic, AddressingMode::Implied, 0, "") }
	}

	/// An immediate opcode with an operand of `length` bytes.
	#[must_use]
	pub fn immediate(mnemonic: &str, length: usize, update: StateUpdate) -> Self {
		Self { update, ..Self::new(mnemonic, AddressingMode::Immediate, length, "") }
	}

	/// A zero-page opcode, optionally with an index/indirection suffix.
	#[must_use]
	pub fn zp(mnemonic: &str, suffix: &'static str, update: StateUpdate) -> Self {
		Self { update, ..Self::new(mnemonic, AddressingMode::ZeroPage, 1, suffix) }
	}

	/// An absolute data-access opcode.
	#[must_use]
	pub fn abs(mnemonic: &str, suffix: &'static str, has_zp_version: bool, update: StateUpdate) -> Self {
		Self { has_zp_version, update, ..Self::new(mnemonic, AddressingMode::Absolute, 2, suffix) }
	}

	/// An unconditional absolute jump.
	#[must_use]
	pub fn jmp_abs(mnemonic: &str) -> Self {
		Self::new(mnemonic, AddressingMode::JumpAbsolute, 2, "")
	}

	/// An indirect jump; `suffix` closes the indirection.
	#[must_use]
	pub fn jmp_ind(mnemonic: &str, suffix: &'static str) -> Self {
		Self::new(mnemonic, AddressingMode::JumpIndirect, 2, suffix)
	}

	/// An absolute subroutine call.
	#[must_use]
	pub fn call(mnemonic: &str) -> Self {
		Self::new(mnemonic, AddressingMode::SubroutineCall, 2, "")
	}

	/// A conditional relative branch.
	#[must_use]
	pub fn branch(mnemonic: &str) -> Self {
		Self::new(mnemonic, AddressingMode::ConditionalBranch, 1, "")
	}

	/// An unconditional relative branch.
	#[must_use]
	pub fn branch_always(mnemonic: &str) -> Self {
		Self::new(mnemonic, AddressingMode::UnconditionalBranch, 1, "")
	}

	/// A conditional absolute jump (or call) with fallthrough.
	#[must_use]
	pub fn cond_jump(mnemonic: &str) -> Self {
		Self::new(mnemonic, AddressingMode::ConditionalJump, 2, "")
	}

	/// A return, break or halt.
	#[must_use]
	pub fn ret(mnemonic: &str) -> Self {
		Self::new(mnemonic, AddressingMode::Return, 0, "")
	}

	/// Total instruction length in bytes.
	#[must_use]
	pub const fn length(&self) -> usize {
		1 + self.operand_length
	}

	/// Whether straight-line control flow definitely stops after this
	/// instruction, which is where the emitter inserts blank lines.
	#[must_use]
	pub const fn is_block_end(&self) -> bool {
		matches!(
			self.mode,
			AddressingMode::JumpAbsolute
				| AddressingMode::JumpIndirect
				| AddressingMode::UnconditionalBranch
				| AddressingMode::Return
		)
	}

	/// Whether this is a subroutine call; used for the `sub_` label prefix.
	#[must_use]
	pub const fn is_subroutine_call(&self) -> bool {
		matches!(self.mode, AddressingMode::SubroutineCall)
	}

	/// Whether this instruction can transfer control to a fixed target;
	/// used for the `loop_` label prefix.
	#[must_use]
	pub const fn is_branch(&self) -> bool {
		matches!(
			self.mode,
			AddressingMode::ConditionalBranch
				| AddressingMode::UnconditionalBranch
				| AddressingMode::ConditionalJump
				| AddressingMode::JumpAbsolute
		)
	}

	/// The runtime address this instruction's operand refers to, if it
	/// refers to one. `None` for implied/immediate operands or when operand
	/// bytes are missing.
	#[must_use]
	pub fn abs_operand(
		&self,
		addr: BinaryAddr,
		memory: &MemoryModel,
		moves: &MoveManager,
	) -> Option<RuntimeAddr> {
		let operand_addr = addr.checked_add(1)?;
		match self.mode {
			AddressingMode::Implied | AddressingMode::Immediate | AddressingMode::Return => None,
			AddressingMode::ZeroPage => memory.u8(operand_addr).map(|value| RuntimeAddr::new(u16::from(value))),
			AddressingMode::Absolute
			| AddressingMode::JumpAbsolute
			| AddressingMode::JumpIndirect
			| AddressingMode::SubroutineCall
			| AddressingMode::ConditionalJump => memory.u16_le(operand_addr).map(RuntimeAddr::new),
			AddressingMode::ConditionalBranch | AddressingMode::UnconditionalBranch => {
				let displacement = memory.u8(operand_addr)? as i8;
				Some(moves.b2r(addr).branch_target(displacement))
			},
		}
	}
}

/// A CPU's opcode table. Opcode values with no entry are treated as data by
/// the tracer (the branch that reached them stops).
pub trait InstructionSet {
	/// Short name used in diagnostics ("6502", "65c02", "8080").
	fn name(&self) -> &'static str;

	/// The description of an opcode value, or `None` if unassigned.
	fn opcode(&self, byte: u8) -> Option<&Opcode>;
}

/// Convenience storage for 256-entry opcode tables.
pub(crate) type OpcodeTable = [Option<Opcode>; 256];

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn branch_target_uses_signed_displacement_on_the_runtime_pc() {
		let mut memory = MemoryModel::new();
		// bne -8 at $1009
		memory.load(BinaryAddr::new(0x1009), &[0xd0, 0xf8], None, "test").unwrap();
		let moves = MoveManager::new();
		let branch = Opcode::branch("BNE");
		assert_eq!(branch.abs_operand(BinaryAddr::new(0x1009), &memory, &moves), Some(RuntimeAddr::new(0x1003)));
	}

	#[test]
	fn operand_past_top_of_memory_is_rejected() {
		let mut memory = MemoryModel::new();
		memory.load(BinaryAddr::new(0xffff), &[0xad], None, "test").unwrap();
		let moves = MoveManager::new();
		let lda = Opcode::abs("LDA", "", true, neutral);
		assert_eq!(lda.abs_operand(BinaryAddr::new(0xffff), &memory, &moves), None);
	}
}
