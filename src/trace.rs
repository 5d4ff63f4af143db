//! Worklist-driven code discovery.
//!
//! Tracing starts from the registered entry points, decodes instructions
//! through the context's instruction set, classifies the bytes it can prove
//! are code and records every operand reference against the target label.
//! Control flow is followed through fallthroughs, branches, tail jumps and
//! subroutine calls; calls consult the hook table so OS entry points with
//! inline parameter blocks or no-return semantics trace correctly.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::classification::Classification;
use crate::disassembly::{Annotation, AnnotationAlign, AnnotationKind, Disassembly, Entry};
use crate::error::{DisassemblyError, DisassemblyWarning};
use crate::instruction::{AddressingMode, CpuState, Opcode};
use crate::memory::{BinaryAddr, RuntimeAddr};
use crate::movemanager::{ActiveMove, BinaryLocation};

/// Decides how tracing continues past a subroutine call: receives the call
/// target and the caller's runtime address, returns the runtime address to
/// continue from, or `None` to stop the straight-line branch. Hooks must be
/// pure with respect to tracing for runs to be reproducible; annotating
/// labels, constants and expressions is fine.
pub type JsrHook = dyn Fn(&mut Disassembly, RuntimeAddr, RuntimeAddr) -> Option<RuntimeAddr>;

/// Invoked during the post-trace pass at every subroutine call and absolute
/// jump with the binary addresses of the immediate operands that last
/// loaded A, X and Y, or `None` where unknown.
pub type SequenceHook =
	dyn Fn(&mut Disassembly, RuntimeAddr, Option<BinaryAddr>, Option<BinaryAddr>, Option<BinaryAddr>);

/// Tracer state owned by the analysis context.
pub(crate) struct Tracer {
	pub entries:              Vec<Entry>,
	jsr_hooks:                HashMap<u32, Arc<JsrHook>>,
	sequence_hooks:           Vec<Arc<SequenceHook>>,
	/// Latches true once tracing has run; label names may only resolve
	/// afterwards.
	pub trace_done:           bool,
	/// Straight-line CPU state after the instruction at each address.
	pub cpu_state_optimistic: Vec<Option<CpuState>>,
}

impl Tracer {
	pub fn new() -> Self {
		Self {
			entries:              Vec::new(),
			jsr_hooks:            HashMap::new(),
			sequence_hooks:       Vec::new(),
			trace_done:           false,
			cpu_state_optimistic: vec![None; 0x10000],
		}
	}

	pub fn add_entry(&mut self, entry: Entry) {
		self.entries.push(entry);
	}

	pub fn add_jsr_hook(&mut self, addr: RuntimeAddr, hook: Arc<JsrHook>) -> Result<(), DisassemblyError> {
		if self.jsr_hooks.contains_key(&addr.value()) {
			return Err(DisassemblyError::DuplicateHook { addr });
		}
		self.jsr_hooks.insert(addr.value(), hook);
		Ok(())
	}

	pub fn jsr_hook(&self, addr: RuntimeAddr) -> Option<Arc<JsrHook>> {
		self.jsr_hooks.get(&addr.value()).cloned()
	}

	pub fn add_sequence_hook(&mut self, hook: Arc<SequenceHook>) {
		self.sequence_hooks.push(hook);
	}
}

impl std::fmt::Debug for Tracer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Tracer")
			.field("entries", &self.entries)
			.field("jsr_hooks", &self.jsr_hooks.len())
			.field("trace_done", &self.trace_done)
			.finish_non_exhaustive()
	}
}

impl Disassembly {
	/// Runs the tracer over all entry points, then the post-trace pass.
	/// Each entry traces with its contributing move active, so ambiguous
	/// runtime addresses prefer that move's mapping. Hooks may register
	/// further entry points while tracing runs; those are drained too.
	pub(crate) fn trace(&mut self) -> Result<(), DisassemblyError> {
		let mut visited = HashSet::new();
		let mut next_entry = 0;
		while next_entry < self.tracer.entries.len() {
			let entry = self.tracer.entries[next_entry].clone();
			next_entry += 1;
			let _entry_move = ActiveMove::new(&self.moves, entry.move_id)?;
			let mut worklist = vec![entry.addr];
			while let Some(addr) = worklist.pop() {
				if !self.memory.is_loaded(addr) || !visited.insert(addr) {
					continue;
				}
				let successors = self.trace_step(addr)?;
				worklist.extend(successors.into_iter().rev());
			}
		}
		self.tracer.trace_done = true;
		self.post_trace_pass();
		Ok(())
	}

	/// Decodes and classifies one address, returning the control-flow
	/// successors to keep tracing from.
	fn trace_step(&mut self, addr: BinaryAddr) -> Result<Vec<BinaryAddr>, DisassemblyError> {
		let byte = self.memory.expect_u8(addr)?;
		let Some(opcode) = self.instruction_set.opcode(byte) else {
			// Unknown opcode: this branch was data after all.
			return Ok(Vec::new());
		};
		let opcode = opcode.clone();
		let length = opcode.length();

		if let Some(Classification::Instruction { opcode: existing, .. }) = self.memory.classification(addr) {
			if *existing == byte {
				return Ok(Vec::new());
			}
		}

		if self.memory.is_classified(addr, length) {
			// Something (usually a user data directive) got here first. The
			// instruction is recorded as an advisory annotation; tracing
			// continues, since the control flow is real even if we can't
			// re-classify the bytes.
			self.options.report_diagnostic(&DisassemblyWarning::OverlappingInstruction { addr });
			self.add_annotation(addr, Annotation {
				kind:           AnnotationKind::Overlap,
				text:           flexstr::SharedStr::from_static(""),
				align:          AnnotationAlign::AfterLine,
				priority:       0,
				auto_generated: true,
			});
		} else {
			let range = self
				.memory
				.loaded_range_containing(addr)
				.ok_or(DisassemblyError::UnloadedAddress { addr })?;
			if u32::from(addr.value()) + length as u32 > range.end {
				// Operand bytes straddle the end of the loaded range.
				return Ok(Vec::new());
			}
			self.memory.add_classification(addr, Classification::Instruction { opcode: byte, length })?;
			self.update_references(addr, &opcode);
		}

		self.successors(addr, &opcode)
	}

	/// Records this instruction as a reference against its operand's label.
	fn update_references(&mut self, addr: BinaryAddr, opcode: &Opcode) {
		let moves = self.moves.read();
		if let Some(target) = opcode.abs_operand(addr, &self.memory, &moves) {
			let move_id = moves.move_id_for_binary_addr(addr);
			let handle = self.labels.ensure(target, &moves);
			drop(moves);
			handle.write().add_reference(BinaryLocation { binary_addr: addr, move_id });
		}
	}

	fn successors(&mut self, addr: BinaryAddr, opcode: &Opcode) -> Result<Vec<BinaryAddr>, DisassemblyError> {
		let fallthrough = addr.checked_add(opcode.length());
		let target = {
			let moves = self.moves.read();
			opcode.abs_operand(addr, &self.memory, &moves)
		};
		match opcode.mode {
			AddressingMode::Implied
			| AddressingMode::Immediate
			| AddressingMode::ZeroPage
			| AddressingMode::Absolute => Ok(fallthrough.into_iter().collect()),
			AddressingMode::Return | AddressingMode::JumpIndirect => Ok(Vec::new()),
			AddressingMode::JumpAbsolute => match target {
				Some(target) => self.translated_target(target, addr),
				None => Ok(Vec::new()),
			},
			AddressingMode::UnconditionalBranch => match target {
				Some(target) => self.translated_target(target, addr),
				None => Ok(Vec::new()),
			},
			AddressingMode::ConditionalBranch | AddressingMode::ConditionalJump => {
				let mut result: Vec<BinaryAddr> = fallthrough.into_iter().collect();
				if let Some(target) = target {
					result.extend(self.translated_target(target, addr)?);
				}
				Ok(result)
			},
			AddressingMode::SubroutineCall => self.call_successors(addr, target),
		}
	}

	/// Translates a runtime control-flow target back to a binary address
	/// under the move that owns the referencing instruction.
	fn translated_target(
		&mut self,
		target: RuntimeAddr,
		context: BinaryAddr,
	) -> Result<Vec<BinaryAddr>, DisassemblyError> {
		let move_id = self.moves.read().move_id_for_binary_addr(context);
		let _context_move = ActiveMove::new(&self.moves, move_id)?;
		match self.moves.read().r2b(target) {
			Some(location) => Ok(vec![location.binary_addr]),
			None => {
				self.options.report_diagnostic(&DisassemblyWarning::UnresolvedSuccessor { addr: target });
				Ok(Vec::new())
			},
		}
	}

	/// Control flow past a subroutine call: the hook (or the default
	/// fall-through-after-the-call) decides the continuation, and the call
	/// target itself is traced too.
	fn call_successors(
		&mut self,
		addr: BinaryAddr,
		target: Option<RuntimeAddr>,
	) -> Result<Vec<BinaryAddr>, DisassemblyError> {
		let Some(target) = target else { return Ok(Vec::new()) };
		let (caller, move_id) = {
			let moves = self.moves.read();
			(moves.b2r(addr), moves.move_id_for_binary_addr(addr))
		};
		let hook = self.tracer.jsr_hook(target);
		let return_runtime = {
			let _caller_move = ActiveMove::new(&self.moves, move_id)?;
			match hook {
				Some(hook) => (*hook)(self, target, caller),
				None => RuntimeAddr::checked(caller.value() + 3).ok(),
			}
		};

		let mut result = Vec::new();
		if let Some(return_runtime) = return_runtime {
			match self.moves.read().r2b(return_runtime) {
				Some(location) => result.push(location.binary_addr),
				None => {
					// The return address is ambiguous. It's almost certainly
					// the instruction after the call, so accept that when the
					// mapping agrees; otherwise give up on this branch.
					let simple = addr.checked_add(3);
					match simple {
						Some(simple) if self.moves.read().b2r(simple) == return_runtime =>
							result.push(simple),
						_ => self
							.options
							.report_diagnostic(&DisassemblyWarning::UnresolvedSuccessor {
								addr: return_runtime,
							}),
					}
				},
			}
		}
		match self.moves.read().r2b(target) {
			Some(location) => result.push(location.binary_addr),
			None =>
				self.options.report_diagnostic(&DisassemblyWarning::UnresolvedSuccessor { addr: target }),
		}
		Ok(result)
	}

	/// Re-walks classified code once, tracking straight-line CPU state, and
	/// fires the sequence hooks at every call and absolute jump.
	fn post_trace_pass(&mut self) {
		let hooks = self.tracer.sequence_hooks.clone();
		let mut state = CpuState::default();
		let mut index = 0usize;
		while index < 0x10000 {
			let addr = BinaryAddr::new(index as u16);
			let Some(classification) = self.memory.classification(addr).copied() else {
				state.clear();
				index += 1;
				continue;
			};
			let Classification::Instruction { opcode, length } = classification else {
				state.clear();
				index += classification.length();
				continue;
			};
			let Some(descriptor) = self.instruction_set.opcode(opcode).cloned() else {
				state.clear();
				index += length;
				continue;
			};
			if matches!(descriptor.mode, AddressingMode::SubroutineCall | AddressingMode::JumpAbsolute)
				&& !hooks.is_empty()
			{
				if let Some(operand_addr) = addr.checked_add(1) {
					if let Some(target) = self.memory.u16_le(operand_addr) {
						for hook in &hooks {
							(**hook)(
								self,
								RuntimeAddr::new(target),
								state.a.loaded_from,
								state.x.loaded_from,
								state.y.loaded_from,
							);
						}
					}
				}
			}
			(descriptor.update)(addr, &self.memory, &mut state);
			self.tracer.cpu_state_optimistic[index] = Some(state);
			index += length;
		}
	}

	/// The optimistic CPU state snapshot after the instruction at `addr`.
	#[must_use]
	pub fn cpu_state_at(&self, addr: BinaryAddr) -> Option<CpuState> {
		self.tracer.cpu_state_optimistic[addr.index()]
	}
}
