//! Ordered output generation and label-name resolution.
//!
//! Everything here runs strictly after tracing. Name resolution is
//! memoised on first use, so emission passes are idempotent; the emitter
//! itself only appends to the output and flips `emitted` flags that are
//! reset at the start of every pass.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use flexstr::{shared_fmt, SharedStr, ToSharedStr};

use crate::classification::Classification;
use crate::disassembly::{is_print, Annotation, AnnotationAlign, AnnotationKind, ConstantFormat, ConstantValue, Disassembly};
use crate::error::{DisassemblyError, DisassemblyWarning};
use crate::expression::{is_simple_name, Expr};
use crate::formatter::{force_case, Formatter, RelocationBlock};
use crate::instruction::{AddressingMode, Opcode};
use crate::label::{Label, LabelHandle, OptionalLabel, ResolvedName};
use crate::memory::{BinaryAddr, ClassificationSlot, RuntimeAddr, MEMORY_SIZE};
use crate::movemanager::{BinaryLocation, MoveId, BASE_MOVE_ID};

/// A maximal run of loaded bytes owned by a single move.
#[derive(Debug, Clone, Copy)]
struct Subrange {
	start:   u32,
	end:     u32,
	move_id: MoveId,
}

/// The binary context under which an instruction operand resolves label
/// names: branches use the instruction itself, everything else the operand
/// bytes.
fn operand_context(addr: BinaryAddr, mode: AddressingMode) -> BinaryAddr {
	match mode {
		AddressingMode::ConditionalBranch | AddressingMode::UnconditionalBranch => addr,
		_ => addr.checked_add(1).unwrap_or(addr),
	}
}

impl Disassembly {
	// ------------------------------------------------------------------
	// Label-name resolution.

	/// Resolves the name used to reference `runtime` from `binary_ctx`.
	/// Must not be called before tracing completes; results are memoised so
	/// repeated emission passes agree.
	pub(crate) fn resolve_label_name(
		&mut self,
		runtime: RuntimeAddr,
		binary_ctx: BinaryAddr,
		move_id: Option<MoveId>,
	) -> ResolvedName {
		debug_assert!(self.tracer.trace_done, "label names must not resolve before tracing completes");
		let (normalised, covering) = {
			let moves = self.moves.read();
			(
				move_id.unwrap_or_else(|| moves.move_id_for_binary_addr(binary_ctx)),
				moves.move_ids_for_runtime_addr(runtime),
			)
		};
		if let Some(hit) = self.labels.memoised(runtime, binary_ctx, normalised) {
			return hit;
		}

		let mut candidates = vec![normalised];
		if !covering.contains(&normalised) {
			candidates.extend(covering.iter().copied());
		}
		let fallback = if covering.len() == 1 { covering[0] } else { BASE_MOVE_ID };

		let mut found: Option<ResolvedName> = None;
		if let Some(handle) = self.labels.get(runtime) {
			let label = handle.read();
			found = candidates
				.iter()
				.find_map(|candidate| {
					search_label(&label, binary_ctx, *candidate).map(|name| (name, *candidate))
				})
				.or_else(|| search_label(&label, binary_ctx, fallback).map(|name| (name, fallback)))
				.or_else(|| {
					search_label(&label, binary_ctx, BASE_MOVE_ID).map(|name| (name, BASE_MOVE_ID))
				});
		}

		let suggestion = match found {
			Some(found) => found,
			None => match self.labels.optional_label(runtime).cloned() {
				Some(optional) => self.materialise_optional(runtime, optional),
				None => self.synthesise_name(runtime, fallback),
			},
		};

		let result = self
			.labels
			.user_label_maker(runtime, binary_ctx, &suggestion)
			.filter(|user| *user != suggestion)
			.unwrap_or(suggestion);

		// Register the final name on the label so a definition is emitted.
		if is_simple_name(&result.0) {
			let moves = self.moves.read();
			let handle = self.labels.ensure(runtime, &moves);
			drop(moves);
			handle.write().add_explicit_name(result.0.clone(), result.1, None);
		}
		self.labels.memoise(runtime, binary_ctx, normalised, result.clone());
		result
	}

	/// Shorthand for the resolved name text.
	pub(crate) fn label_text(&mut self, runtime: RuntimeAddr, binary_ctx: BinaryAddr) -> SharedStr {
		self.resolve_label_name(runtime, binary_ctx, None).0
	}

	fn materialise_optional(&mut self, runtime: RuntimeAddr, optional: OptionalLabel) -> ResolvedName {
		if let Some(base_addr) = optional.base_addr {
			if let Some(base) = self.labels.optional_label(base_addr).cloned() {
				let moves = self.moves.read();
				let base_handle = self.labels.ensure(base_addr, &moves);
				drop(moves);
				base_handle.write().add_explicit_name(base.name, BASE_MOVE_ID, None);
			}
		}
		let moves = self.moves.read();
		let handle = self.labels.ensure(runtime, &moves);
		drop(moves);
		handle.write().definable_inline = optional.definable_inline;
		(optional.name, BASE_MOVE_ID)
	}

	/// Makes up a name for an address nobody named: `l`/`c` plus the hex
	/// address, with `sub_`/`loop_` prefixes where the references justify
	/// them.
	fn synthesise_name(&mut self, runtime: RuntimeAddr, chosen: MoveId) -> ResolvedName {
		let moves = self.moves.read();
		let target_binary: Option<BinaryAddr> = if chosen == BASE_MOVE_ID {
			BinaryAddr::checked(runtime.value()).ok()
		} else {
			let definition = moves.definition(chosen);
			if definition.covers_runtime(runtime) {
				BinaryAddr::checked(
					u32::from(definition.source.value()) + (runtime.value() - definition.dest.value()),
				)
				.ok()
			} else {
				None
			}
		};
		let is_code = target_binary
			.is_some_and(|binary| self.memory.classification(binary).is_some_and(Classification::is_code));

		let mut name = format!("{}{:04x}", if is_code { 'c' } else { 'l' }, runtime.value());
		if is_code {
			let references: Vec<BinaryLocation> =
				self.labels.get(runtime).map(|handle| handle.read().references.clone()).unwrap_or_default();
			let all_calls = !references.is_empty()
				&& references.iter().all(|reference| self.is_subroutine_call_at(reference.binary_addr));
			if all_calls {
				name = format!("sub_{name}");
			} else if let [only] = references.as_slice() {
				let close_backward_branch = self.is_branch_to(only.binary_addr, runtime, &moves)
					&& target_binary.is_some_and(|target| {
						only.binary_addr.index() >= target.index()
							&& only.binary_addr.index() - target.index()
								< self.options.loop_limit() as usize
					});
				if close_backward_branch {
					name = format!("loop_{name}");
				}
			}
		}
		drop(moves);
		if !self.options.lower_case() {
			name = name.to_uppercase();
		}
		let name = name.to_shared_str();
		self.labels.register_autogenerated(name.clone());
		(name, chosen)
	}

	fn is_subroutine_call_at(&self, addr: BinaryAddr) -> bool {
		match self.memory.classification(addr) {
			Some(Classification::Instruction { opcode, .. }) =>
				self.instruction_set.opcode(*opcode).is_some_and(Opcode::is_subroutine_call),
			_ => false,
		}
	}

	fn is_branch_to(
		&self,
		addr: BinaryAddr,
		target: RuntimeAddr,
		moves: &crate::movemanager::MoveManager,
	) -> bool {
		match self.memory.classification(addr) {
			Some(Classification::Instruction { opcode, .. }) =>
				self.instruction_set.opcode(*opcode).is_some_and(|descriptor| {
					descriptor.is_branch()
						&& descriptor.abs_operand(addr, &self.memory, moves) == Some(target)
				}),
			_ => false,
		}
	}

	// ------------------------------------------------------------------
	// Operand and data rendering.

	fn render_expr(&mut self, expr: &Expr, context: BinaryAddr, formatter: &dyn Formatter) -> SharedStr {
		expr.render(formatter, &mut |runtime| self.resolve_label_name(runtime, context, None).0)
	}

	/// An 8-bit value: the user expression (with a recorded assertion) or a
	/// hex literal.
	fn constant8(&mut self, addr: BinaryAddr, formatter: &mut dyn Formatter) -> SharedStr {
		match self.expression_at(addr).cloned() {
			Some(expr) => {
				let text = self.render_expr(&expr, addr, formatter);
				if let Some(value) = self.memory.u8(addr) {
					formatter.assert_expr(&text, u32::from(value));
				}
				text
			},
			None => formatter.hex2(self.memory.u8(addr).unwrap_or(0)),
		}
	}

	/// A 16-bit value, as [`Self::constant8`].
	fn constant16(&mut self, addr: BinaryAddr, formatter: &mut dyn Formatter) -> SharedStr {
		match self.expression_at(addr).cloned() {
			Some(expr) => {
				let text = self.render_expr(&expr, addr, formatter);
				if let Some(value) = self.memory.u16_le(addr) {
					formatter.assert_expr(&text, u32::from(value));
				}
				text
			},
			None => formatter.hex4(u32::from(self.memory.u16_le(addr).unwrap_or(0))),
		}
	}

	/// An 8-bit address operand: expression, or the target's label name.
	fn address8(&mut self, addr: BinaryAddr, formatter: &mut dyn Formatter) -> SharedStr {
		if self.expression_at(addr).is_some() {
			return self.constant8(addr, formatter);
		}
		match self.memory.u8(addr) {
			Some(value) => self.label_text(RuntimeAddr::new(u16::from(value)), addr),
			None => formatter.hex2(0),
		}
	}

	/// A 16-bit address operand: expression, or the target's label name.
	fn address16(&mut self, addr: BinaryAddr, formatter: &mut dyn Formatter) -> SharedStr {
		if self.expression_at(addr).is_some() {
			return self.constant16(addr, formatter);
		}
		match self.memory.u16_le(addr) {
			Some(value) => self.label_text(RuntimeAddr::new(value), addr),
			None => formatter.hex4(0),
		}
	}

	/// Pads a line to the comment column and appends a short hex dump.
	fn add_hex_dump(&self, line: String, addr: BinaryAddr, length: usize, formatter: &dyn Formatter) -> String {
		if !self.options.hex_dump() {
			return line;
		}
		let column = self.options.inline_comment_column();
		let shown = length.min(self.options.hex_dump_max_bytes());
		let bytes = (0 .. shown)
			.filter_map(|offset| addr.checked_add(offset))
			.filter_map(|current| self.memory.u8(current))
			.map(|byte| format!("{byte:02x}"))
			.collect::<Vec<_>>()
			.join(" ");
		format!("{line:<column$}{} {:04x}: {bytes}", formatter.comment_prefix(), addr.value())
	}

	/// One instruction as source text, without the hex-dump decoration.
	fn instruction_line(
		&mut self,
		addr: BinaryAddr,
		descriptor: &Opcode,
		formatter: &mut dyn Formatter,
	) -> String {
		let upper = !self.options.lower_case();
		let mut mnemonic_text = descriptor.mnemonic.to_string();
		if !formatter.explicit_a() && mnemonic_text.ends_with(" A") {
			mnemonic_text.truncate(mnemonic_text.len() - 2);
		}
		let mnemonic = force_case(&mnemonic_text, upper);
		let suffix = force_case(descriptor.suffix, upper);
		let operand_addr = addr.checked_add(1).unwrap_or(addr);

		match descriptor.mode {
			AddressingMode::Implied | AddressingMode::Return => format!("    {mnemonic}"),
			AddressingMode::Immediate => {
				let operand = if descriptor.operand_length == 2 {
					self.constant16(operand_addr, formatter)
				} else {
					self.constant8(operand_addr, formatter)
				};
				let mut line = format!("    {mnemonic} #{operand}");
				if descriptor.operand_length == 1
					&& self.options.show_char_literals()
					&& self.expression_at(operand_addr).is_none()
				{
					if let Some(value) = self.memory.u8(operand_addr) {
						if is_print(value) {
							line.push_str(&format!(" {} '{}'", formatter.comment_prefix(), value as char));
						}
					}
				}
				line
			},
			AddressingMode::ZeroPage => {
				let operand = self.address8(operand_addr, formatter);
				format!("    {mnemonic} {}{operand}{suffix}", descriptor.prefix)
			},
			AddressingMode::ConditionalBranch | AddressingMode::UnconditionalBranch => {
				let target = {
					let moves = self.moves.read();
					descriptor.abs_operand(addr, &self.memory, &moves)
				};
				let operand = match target {
					Some(target) => self.label_text(target, addr),
					None => formatter.hex4(0),
				};
				format!("    {mnemonic} {operand}")
			},
			AddressingMode::Absolute
			| AddressingMode::JumpAbsolute
			| AddressingMode::JumpIndirect
			| AddressingMode::SubroutineCall
			| AddressingMode::ConditionalJump => {
				let operand = self.address16(operand_addr, formatter);
				let value = self.memory.u16_le(operand_addr).unwrap_or(0xffff);
				if !descriptor.has_zp_version || value >= 0x100 {
					return format!("    {mnemonic} {}{operand}{suffix}", descriptor.prefix);
				}
				// An absolute instruction with a zero-page operand would be
				// misassembled short, losing a byte. Force the absolute form
				// if the assembler can, otherwise fall back to data bytes.
				if let Some(line) =
					formatter.force_abs_instruction(&mnemonic, descriptor.prefix, &operand, &suffix)
				{
					return line;
				}
				self.options.report_diagnostic(&DisassemblyWarning::ForceAbsoluteUnsupported { addr });
				let opcode_literal = formatter.hex2(self.memory.u8(addr).unwrap_or(0));
				format!(
					"{}{opcode_literal}, <({operand}), >({operand}) {} {mnemonic}+2 {}{operand}{suffix}",
					formatter.byte_prefix(),
					formatter.comment_prefix(),
					descriptor.prefix
				)
			},
		}
	}

	fn byte_run_lines(
		&mut self,
		addr: BinaryAddr,
		length: usize,
		cols: Option<usize>,
		formatter: &mut dyn Formatter,
	) -> Vec<String> {
		let byte_prefix = formatter.byte_prefix();
		let data: Vec<SharedStr> = (0 .. length)
			.map(|offset| {
				let current = addr.checked_add(offset).expect("classification stays below the top of memory");
				self.constant8(current, formatter)
			})
			.collect();
		let longest = data.iter().map(|item| item.len()).max().unwrap_or(1);
		let available = self.options.inline_comment_column().saturating_sub(byte_prefix.len());
		let items_per_line = cols.unwrap_or_else(|| (available / (longest + 2)).clamp(1, 8));
		let item_width = longest.min(available / items_per_line.max(1)).max(1);

		let mut result = Vec::new();
		let mut offset = 0usize;
		for chunk in data.chunks(items_per_line.max(1)) {
			let items =
				chunk.iter().map(|item| format!("{item:<item_width$}")).collect::<Vec<_>>().join(", ");
			let directive = format!("{byte_prefix}{}", items.trim_end());
			let chunk_addr = addr.checked_add(offset).expect("chunk starts inside the classification");
			if self.options.bytes_as_ascii() {
				let ascii: String = (0 .. chunk.len())
					.map(|i| {
						let current = chunk_addr.checked_add(i).expect("chunk stays in range");
						if self.expression_at(current).is_some() {
							'.'
						} else {
							match self.memory.u8(current) {
								Some(byte) if is_print(byte) => byte as char,
								_ => '.',
							}
						}
					})
					.collect();
				let column = self.options.inline_comment_column();
				result.push(format!(
					"{directive:<column$}{} {:04x}: {ascii}",
					formatter.comment_prefix(),
					chunk_addr.value()
				));
			} else {
				result.push(self.add_hex_dump(directive, chunk_addr, chunk.len(), formatter));
			}
			offset += chunk.len();
		}
		result
	}

	fn word_run_lines(
		&mut self,
		addr: BinaryAddr,
		length: usize,
		cols: Option<usize>,
		formatter: &mut dyn Formatter,
	) -> Vec<String> {
		let word_prefix = formatter.word_prefix();
		let data: Vec<SharedStr> = (0 .. length / 2)
			.map(|index| {
				let current =
					addr.checked_add(index * 2).expect("classification stays below the top of memory");
				self.constant16(current, formatter)
			})
			.collect();
		let longest = data.iter().map(|item| item.len()).max().unwrap_or(1);
		let available = self.options.inline_comment_column().saturating_sub(10);
		let items_per_line = cols.unwrap_or_else(|| (available / (longest + 2)).clamp(1, 8));
		let item_width = longest.min(available / items_per_line.max(1)).max(1);

		let mut result = Vec::new();
		let mut index = 0usize;
		for chunk in data.chunks(items_per_line.max(1)) {
			let items =
				chunk.iter().map(|item| format!("{item:<item_width$}")).collect::<Vec<_>>().join(", ");
			let chunk_addr = addr.checked_add(index * 2).expect("chunk starts inside the classification");
			result.push(self.add_hex_dump(
				format!("{word_prefix}{}", items.trim_end()),
				chunk_addr,
				chunk.len() * 2,
				formatter,
			));
			index += chunk.len();
		}
		result
	}

	fn string_run_lines(
		&mut self,
		addr: BinaryAddr,
		length: usize,
		formatter: &mut dyn Formatter,
	) -> Vec<String> {
		let prefix = formatter.string_prefix().to_string();
		// An expression on the first byte stands in for the whole string
		// (`equs page`). The assertion ties the expression to the constant
		// it names, since string bytes have no single numeric value.
		if let Some(expr) = self.expression_at(addr).cloned() {
			let text = self.render_expr(&expr, addr, formatter);
			if let Some(value) = self.constant_value(&text) {
				formatter.assert_expr(&text, value);
			}
			let line = format!("{prefix}{text}");
			return vec![self.add_hex_dump(line, addr, length, formatter)];
		}
		let mut result = Vec::new();
		let mut line = prefix.clone();
		// 0 = nothing yet, 1 = inside quotes, 2 = after a non-quoted item.
		let mut state = 0u8;
		let mut line_start = 0usize;
		for i in 0 .. length {
			let current = addr.checked_add(i).expect("classification stays below the top of memory");
			let byte = self.memory.u8(current).unwrap_or(0);
			let quotable = self.expression_at(current).is_none()
				&& byte != b'"' && formatter.string_chr(byte).is_some();
			if quotable {
				match state {
					0 => line.push('"'),
					2 => line.push_str(", \""),
					_ => {},
				}
				state = 1;
				line.push(formatter.string_chr(byte).expect("quotable byte has a string form"));
			} else {
				match state {
					1 => line.push_str("\", "),
					2 => line.push_str(", "),
					_ => {},
				}
				state = 2;
				if byte == b'"' && self.expression_at(current).is_none() {
					line.push_str("'\"'");
				} else {
					line.push_str(&self.constant8(current, formatter));
				}
			}
			if line.len() > self.options.inline_comment_column().saturating_sub(5) {
				if state == 1 {
					line.push('"');
				}
				let start_addr =
					addr.checked_add(line_start).expect("line starts inside the classification");
				result.push(self.add_hex_dump(line, start_addr, i + 1 - line_start, formatter));
				line = prefix.clone();
				line_start = i + 1;
				state = 0;
			}
		}
		if line != prefix {
			if state == 1 {
				line.push('"');
			}
			let start_addr = addr.checked_add(line_start).expect("line starts inside the classification");
			result.push(self.add_hex_dump(line, start_addr, length - line_start, formatter));
		}
		result
	}

	fn classification_lines(
		&mut self,
		addr: BinaryAddr,
		classification: Classification,
		formatter: &mut dyn Formatter,
	) -> Vec<String> {
		match classification {
			Classification::Instruction { opcode, length } => {
				let Some(descriptor) = self.instruction_set.opcode(opcode).cloned() else {
					return self.byte_run_lines(addr, length, None, formatter);
				};
				let line = self.instruction_line(addr, &descriptor, formatter);
				let mut result = vec![self.add_hex_dump(line, addr, length, formatter)];
				if descriptor.is_block_end() && self.options.blank_line_at_block_end() {
					result.push(String::new());
				}
				result
			},
			Classification::ByteRun { length, cols, .. } => self.byte_run_lines(addr, length, cols, formatter),
			Classification::WordRun { length, cols } => self.word_run_lines(addr, length, cols, formatter),
			Classification::StringRun { length } => self.string_run_lines(addr, length, formatter),
		}
	}

	// ------------------------------------------------------------------
	// Annotations.

	fn annotation_lines(
		&mut self,
		addr: BinaryAddr,
		aligns: &[AnnotationAlign],
		formatter: &mut dyn Formatter,
	) -> Vec<String> {
		let Some(list) = self.annotations.get(&addr.value()) else { return Vec::new() };
		let mut sorted: Vec<Annotation> = list.clone();
		sorted.sort_by_key(|annotation| annotation.priority);
		let mut result = Vec::new();
		for annotation in sorted {
			if !aligns.contains(&annotation.align) {
				continue;
			}
			match annotation.kind {
				AnnotationKind::Comment => result.extend(self.wrap_comment(&annotation.text, formatter)),
				AnnotationKind::Raw => result.push(annotation.text.to_string()),
				AnnotationKind::Overlap => result.push(self.overlap_comment(addr, formatter)),
			}
		}
		result
	}

	fn inline_annotation_texts(&self, addr: BinaryAddr) -> Vec<SharedStr> {
		let Some(list) = self.annotations.get(&addr.value()) else { return Vec::new() };
		let mut sorted: Vec<&Annotation> = list
			.iter()
			.filter(|annotation| {
				annotation.align == AnnotationAlign::Inline && annotation.kind != AnnotationKind::Overlap
			})
			.collect();
		sorted.sort_by_key(|annotation| annotation.priority);
		sorted.into_iter().map(|annotation| annotation.text.clone()).collect()
	}

	fn wrap_comment(&self, text: &str, formatter: &dyn Formatter) -> Vec<String> {
		let prefix = formatter.comment_prefix();
		let limit = self.options.word_wrap_comment_column();
		let mut result = Vec::new();
		for paragraph in text.split('\n') {
			let mut line = prefix.to_owned();
			for word in paragraph.split_whitespace() {
				if line.len() + word.len() + 1 > limit && line.len() > prefix.len() {
					result.push(line.clone());
					line = prefix.to_owned();
				}
				line.push(' ');
				line.push_str(word);
			}
			result.push(line);
		}
		result
	}

	/// The advisory comment for an instruction overlapping existing data.
	fn overlap_comment(&mut self, addr: BinaryAddr, formatter: &mut dyn Formatter) -> String {
		let Some(byte) = self.memory.u8(addr) else { return String::new() };
		let Some(descriptor) = self.instruction_set.opcode(byte).cloned() else { return String::new() };
		let rendered = self.instruction_line(addr, &descriptor, formatter);
		let line = format!("{} overlapping: {}", formatter.comment_prefix(), rendered.trim_start());
		self.add_hex_dump(line, addr, descriptor.length(), formatter)
	}

	// ------------------------------------------------------------------
	// Label definitions.

	/// Definition lines for the label at `runtime` while the emission walk
	/// is at `emit_runtime` in `binary_loc`'s move.
	fn label_definition_lines(
		&mut self,
		runtime: RuntimeAddr,
		emit_runtime: RuntimeAddr,
		binary_loc: BinaryLocation,
		formatter: &mut dyn Formatter,
	) -> Vec<String> {
		let Some(handle) = self.labels.get(runtime) else { return Vec::new() };
		let mut result =
			self.collate_names(&handle, emit_runtime, runtime, binary_loc, binary_loc.move_id, formatter);

		// Names whose move never passes over this address inline are
		// emitted at the first (lowest) move that does.
		let leftover: Vec<MoveId> = {
			let label = handle.read();
			match label.emit_opportunities.iter().next() {
				Some(first) if *first == binary_loc.move_id => label
					.explicit_names
					.keys()
					.filter(|move_id| !label.emit_opportunities.contains(move_id))
					.copied()
					.collect(),
				_ => Vec::new(),
			}
		};
		for move_id in leftover {
			result.extend(self.collate_names(&handle, emit_runtime, runtime, binary_loc, move_id, formatter));
		}
		result
	}

	fn collate_names(
		&mut self,
		handle: &LabelHandle,
		emit_runtime: RuntimeAddr,
		runtime: RuntimeAddr,
		binary_loc: BinaryLocation,
		move_id: MoveId,
		formatter: &mut dyn Formatter,
	) -> Vec<String> {
		let offset = runtime.value() - emit_runtime.value();
		let pending: Vec<(usize, SharedStr)> = {
			let label = handle.read();
			if !label.definable_inline {
				return Vec::new();
			}
			let Some(names) = label.explicit_names.get(&move_id) else { return Vec::new() };
			let mut pending: Vec<(usize, SharedStr, Option<i64>)> = names
				.iter()
				.enumerate()
				.filter(|(_, name)| !name.emitted)
				.map(|(index, name)| (index, name.text.clone(), name.priority))
				.collect();
			pending.sort_by_key(|(_, _, priority)| priority.unwrap_or(i64::MAX));
			pending.into_iter().map(|(index, text, _)| (index, text)).collect()
		};

		let mut result = Vec::new();
		for (index, text) in pending {
			if is_simple_name(&text) {
				if offset == 0 {
					result.push(formatter.inline_label(&text).to_string());
				} else {
					let base = self
						.resolve_label_name(emit_runtime, binary_loc.binary_addr, Some(binary_loc.move_id))
						.0;
					result.push(
						formatter.explicit_label(&text, &base, Some(i64::from(offset)), None).to_string(),
					);
				}
			}
			let mut label = handle.write();
			if let Some(names) = label.explicit_names.get_mut(&move_id) {
				names[index].emitted = true;
			}
		}
		result
	}

	// ------------------------------------------------------------------
	// Pre-passes.

	/// Forces every label name that will appear in the output to resolve,
	/// so definitions exist before the first reference is printed.
	fn force_names(&mut self, formatter: &mut dyn Formatter) {
		let expressions: Vec<(u16, Expr)> =
			self.expressions.iter().map(|(addr, expr)| (*addr, expr.clone())).collect();
		for (addr, expr) in expressions {
			let _ = self.render_expr(&expr, BinaryAddr::new(addr), formatter);
		}

		let mut index = 0usize;
		while index < MEMORY_SIZE as usize {
			let addr = BinaryAddr::new(index as u16);
			let Some(classification) = self.memory.classification(addr).copied() else {
				index += 1;
				continue;
			};
			if let Classification::Instruction { opcode, .. } = classification {
				if let Some(descriptor) = self.instruction_set.opcode(opcode).cloned() {
					let operand_has_expression = addr
						.checked_add(1)
						.is_some_and(|operand| self.expressions.contains_key(&operand.value()));
					if !operand_has_expression {
						let target = {
							let moves = self.moves.read();
							descriptor.abs_operand(addr, &self.memory, &moves)
						};
						if let Some(target) = target {
							let _ = self.resolve_label_name(
								target,
								operand_context(addr, descriptor.mode),
								None,
							);
						}
					}
				}
			}
			index += classification.length();
		}
	}

	fn move_subranges(&self) -> Vec<Subrange> {
		let moves = self.moves.read();
		let mut result = Vec::new();
		for range in self.memory.load_ranges() {
			let mut sub_start = range.start;
			let mut current = moves.move_id_for_binary_addr(BinaryAddr::new(range.start as u16));
			for value in range.start + 1 .. range.end {
				let move_id = moves.move_id_for_binary_addr(BinaryAddr::new(value as u16));
				if move_id != current {
					result.push(Subrange { start: sub_start, end: value, move_id: current });
					sub_start = value;
					current = move_id;
				}
			}
			result.push(Subrange { start: sub_start, end: range.end, move_id: current });
		}
		result
	}

	/// Splits a classification a move boundary lands inside, so each
	/// emitted range starts on a classification start.
	fn split_classification_at(&mut self, boundary: u32) -> Result<(), DisassemblyError> {
		if boundary >= MEMORY_SIZE {
			return Ok(());
		}
		let addr = BinaryAddr::new(boundary as u16);
		if !matches!(self.memory.slot(addr), ClassificationSlot::Inside) {
			return Ok(());
		}
		let start = self.memory.classification_start(addr);
		let removed = self.memory.remove_classification(start).expect("interior slot implies a start");
		if !removed.is_mergeable() {
			self.options.report_diagnostic(&DisassemblyWarning::SplitClassification { addr });
		}
		let first_length = addr.index() - start.index();
		self.memory.add_classification(start, Classification::byte_run(first_length))?;
		self.memory.add_classification(addr, Classification::byte_run(removed.length() - first_length))?;
		Ok(())
	}

	fn record_emit_opportunities(&mut self, subranges: &[Subrange]) {
		let moves = self.moves.read();
		for sub in subranges {
			for value in sub.start .. sub.end {
				let runtime = moves.b2r(BinaryAddr::new(value as u16));
				if let Some(handle) = self.labels.get(runtime) {
					handle.write().notify_emit_opportunity(sub.move_id);
				}
			}
			let end_runtime = moves.b2r(BinaryAddr::new((sub.end - 1) as u16)).saturating_add(1);
			if let Some(handle) = self.labels.get(end_runtime) {
				handle.write().notify_emit_opportunity(sub.move_id);
			}
			if sub.move_id != BASE_MOVE_ID {
				for boundary in [sub.start, sub.end] {
					if let Ok(runtime) = RuntimeAddr::checked(boundary) {
						if let Some(handle) = self.labels.get(runtime) {
							handle.write().notify_emit_opportunity(BASE_MOVE_ID);
						}
					}
				}
			}
		}
	}

	// ------------------------------------------------------------------
	// Emission proper.

	fn relocation_block(&mut self, sub: Subrange) -> RelocationBlock {
		let source = BinaryAddr::new(sub.start as u16);
		let (dest, length) = {
			let moves = self.moves.read();
			(moves.b2r(source), sub.end - sub.start)
		};
		let end = dest.saturating_add(length);
		let dest_label = self.resolve_label_name(dest, source, Some(sub.move_id)).0;
		let end_label = self.resolve_label_name(end, source, Some(sub.move_id)).0;
		let source_label = self
			.resolve_label_name(
				RuntimeAddr::checked(sub.start).expect("subrange starts below the top of memory"),
				source,
				Some(BASE_MOVE_ID),
			)
			.0;
		RelocationBlock { dest, source, length, move_id: sub.move_id, dest_label, end_label, source_label }
	}

	/// Label definitions in base context at a range boundary.
	fn base_boundary_labels(&mut self, boundary: u32, formatter: &mut dyn Formatter) -> Vec<String> {
		let Ok(runtime) = RuntimeAddr::checked(boundary) else { return Vec::new() };
		let context = BinaryAddr::new(boundary.min(MEMORY_SIZE - 1) as u16);
		self.label_definition_lines(
			runtime,
			runtime,
			BinaryLocation { binary_addr: context, move_id: BASE_MOVE_ID },
			formatter,
		)
	}

	/// Label definitions at the runtime end of a relocated block, emitted
	/// inside the block so they take their relocated values.
	fn end_of_block_labels(&mut self, sub: Subrange, formatter: &mut dyn Formatter) -> Vec<String> {
		let last = BinaryAddr::new((sub.end - 1) as u16);
		let end_runtime = self.moves.read().b2r(last).saturating_add(1);
		self.label_definition_lines(
			end_runtime,
			end_runtime,
			BinaryLocation { binary_addr: last, move_id: sub.move_id },
			formatter,
		)
	}

	fn subrange_body(&mut self, sub: Subrange, formatter: &mut dyn Formatter) -> Vec<String> {
		let mut result = Vec::new();
		let mut value = sub.start;
		let mut previous_was_code: Option<bool> = None;
		while value < sub.end {
			let addr = BinaryAddr::new(value as u16);
			let classification = self
				.memory
				.classification(addr)
				.copied()
				.expect("all loaded bytes are classified before emission");
			let length = classification.length();
			if previous_was_code == Some(false) && classification.is_code() {
				result.push(String::new());
			}
			previous_was_code = Some(classification.is_code());

			let emit_runtime = self.moves.read().b2r(addr);
			let binary_loc = BinaryLocation { binary_addr: addr, move_id: sub.move_id };

			result.extend(self.annotation_lines(addr, &[AnnotationAlign::BeforeLabel], formatter));
			result.extend(self.label_definition_lines(emit_runtime, emit_runtime, binary_loc, formatter));
			for offset in 1 .. length {
				let Some(inner) = addr.checked_add(offset) else { break };
				let inner_runtime = self.moves.read().b2r(inner);
				result.extend(self.label_definition_lines(inner_runtime, emit_runtime, binary_loc, formatter));
			}
			result.extend(self.annotation_lines(addr, &[AnnotationAlign::BeforeLine], formatter));

			let mut lines = self.classification_lines(addr, classification, formatter);
			let inline = self.inline_annotation_texts(addr);
			if let Some(first_line) = lines.first_mut() {
				for text in inline {
					first_line.push_str(&format!(" {} {text}", formatter.comment_prefix()));
				}
			}
			result.extend(lines);

			result.extend(self.annotation_lines(addr, &[AnnotationAlign::AfterLine], formatter));
			result.extend(self.annotation_lines(addr, &[AnnotationAlign::AfterLabel], formatter));
			for offset in 1 .. length {
				let Some(inner) = addr.checked_add(offset) else { break };
				result.extend(self.annotation_lines(
					inner,
					&[
						AnnotationAlign::BeforeLabel,
						AnnotationAlign::BeforeLine,
						AnnotationAlign::AfterLine,
						AnnotationAlign::AfterLabel,
						AnnotationAlign::Inline,
					],
					formatter,
				));
			}
			value += length as u32;
		}
		result
	}

	fn constant_lines(&mut self, formatter: &mut dyn Formatter) -> Vec<String> {
		if self.constants.is_empty() {
			return Vec::new();
		}
		let mut constants = self.constants.clone();
		constants.sort_by(|a, b| natural_key(&a.name).cmp(&natural_key(&b.name)));
		let longest = constants.iter().map(|constant| constant.name.len()).max().unwrap_or(0);
		let mut result = Vec::new();
		for constant in constants {
			let value = match (&constant.value, constant.format) {
				(ConstantValue::Text(text), _) => text.clone(),
				(ConstantValue::Number(value), ConstantFormat::Decimal) => shared_fmt!("{value}"),
				(ConstantValue::Number(value), ConstantFormat::Binary) =>
					if *value <= 0xff {
						shared_fmt!("%{value:08b}")
					} else {
						shared_fmt!("%{value:016b}")
					},
				(ConstantValue::Number(value), ConstantFormat::Char) => match char::from_u32(*value) {
					Some(c) if is_print(*value as u8) => shared_fmt!("'{c}'"),
					_ => formatter.hex(*value),
				},
				(ConstantValue::Number(value), _) => formatter.hex(*value),
			};
			let mut line = formatter.explicit_label(&constant.name, &value, None, Some(longest)).to_string();
			if let Some(comment) = &constant.comment {
				line.push_str(&format!(" {} {comment}", formatter.comment_prefix()));
			}
			result.push(line);
		}
		result.push(String::new());
		result
	}

	fn label_dump_lines(&mut self, formatter: &mut dyn Formatter) -> Vec<String> {
		let prefix = formatter.comment_prefix();
		let mut result = vec![format!("{prefix} All labels:")];
		for (runtime, handle) in self.labels.iter() {
			let label = handle.read();
			let mut names: Vec<String> = label.all_names().iter().map(ToString::to_string).collect();
			names.sort();
			result.push(format!(
				"{prefix}     {}: {} ({} references)",
				formatter.hex4(runtime.value()),
				names.join(", "),
				label.references.len()
			));
		}
		result.push(String::new());
		result
	}

	fn explicit_leftover_lines(&mut self, formatter: &mut dyn Formatter) -> Vec<String> {
		let mut pending: Vec<(SharedStr, u32)> = Vec::new();
		for (runtime, handle) in self.labels.iter() {
			let mut label = handle.write();
			let mut names: Vec<SharedStr> = Vec::new();
			for move_names in label.explicit_names.values_mut() {
				for name in move_names.iter_mut().filter(|name| !name.emitted) {
					names.push(name.text.clone());
					name.emitted = true;
				}
			}
			names.sort();
			pending.extend(names.into_iter().map(|name| (name, runtime.value())));
		}
		if pending.is_empty() {
			return Vec::new();
		}
		let longest = pending.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
		let mut result = vec![String::new()];
		for (name, addr) in pending {
			result.push(formatter.explicit_label(&name, &formatter.hex4(addr), None, Some(longest)).to_string());
		}
		result
	}

	fn reference_histogram_lines(&mut self, formatter: &mut dyn Formatter) -> Vec<String> {
		let prefix = formatter.comment_prefix();
		let mut body = Vec::new();
		for (runtime, handle) in self.labels.iter() {
			let label = handle.read();
			if label.references.is_empty() {
				continue;
			}
			let mut sources: Vec<String> =
				label.references.iter().map(|reference| format!("{}", reference.binary_addr)).collect();
			sources.sort();
			body.push(format!(
				"{prefix}     {}: {} ({})",
				formatter.hex4(runtime.value()),
				label.references.len(),
				sources.join(", ")
			));
		}
		if body.is_empty() {
			return Vec::new();
		}
		let mut result = vec![String::new(), format!("{prefix} Label references:")];
		result.extend(body);
		result
	}

	fn autogenerated_lines(&mut self, formatter: &mut dyn Formatter) -> Vec<String> {
		if self.labels.autogenerated().is_empty() {
			return Vec::new();
		}
		let prefix = formatter.comment_prefix();
		let mut result = vec![String::new(), format!("{prefix} Automatically generated labels:")];
		for name in self.labels.autogenerated() {
			result.push(format!("{prefix}     {name}"));
		}
		result
	}

	/// Produces the whole output text. See the module documentation for the
	/// ordering contract.
	pub(crate) fn emit(&mut self, formatter: &mut dyn Formatter) -> Result<String, DisassemblyError> {
		self.labels.reset_emitted();

		let mut output: Vec<String> = Vec::new();
		output.extend(formatter.disassembly_start());

		self.force_names(formatter);
		output.extend(self.constant_lines(formatter));
		if self.options.show_all_labels() {
			output.extend(self.label_dump_lines(formatter));
		}

		let subranges = self.move_subranges();
		for sub in &subranges {
			self.split_classification_at(sub.start)?;
			self.split_classification_at(sub.end)?;
		}
		self.record_emit_opportunities(&subranges);

		let mut previous_end: Option<u32> = None;
		let mut started = false;
		for sub in subranges {
			if sub.move_id == BASE_MOVE_ID {
				if previous_end != Some(sub.start) {
					if previous_end.is_some() {
						output.extend(formatter.code_end());
					}
					output.extend(formatter.code_start(
						RuntimeAddr::checked(sub.start)?,
						RuntimeAddr::checked(sub.end)?,
						!started,
					));
					started = true;
				}
				output.extend(self.subrange_body(sub, formatter));
			} else {
				// Resolve the block's corner labels first so the boundary
				// definitions below already know their names.
				let block = self.relocation_block(sub);
				output.extend(self.base_boundary_labels(sub.start, formatter));
				output.extend(formatter.pseudopc_start(&block));
				output.extend(self.subrange_body(sub, formatter));
				output.extend(self.end_of_block_labels(sub, formatter));
				output.extend(formatter.pseudopc_end(&block));
				output.extend(self.base_boundary_labels(sub.end, formatter));
			}
			previous_end = Some(sub.end);
		}
		output.extend(formatter.code_end());

		output.extend(self.explicit_leftover_lines(formatter));
		if self.options.label_references() {
			output.extend(self.reference_histogram_lines(formatter));
		}
		if self.options.show_autogenerated_labels() {
			output.extend(self.autogenerated_lines(formatter));
		}
		output.extend(formatter.disassembly_end());

		let mut text = output.join("\n");
		while text.ends_with('\n') {
			text.pop();
		}
		text.push('\n');
		Ok(text)
	}
}

/// Searches one move's names on a label: local labels first, then explicit
/// names, then expressions.
fn search_label(label: &Label, binary_ctx: BinaryAddr, move_id: MoveId) -> Option<SharedStr> {
	label
		.local_name_for(binary_ctx, move_id)
		.or_else(|| label.first_explicit_name(move_id))
		.or_else(|| label.first_expression(move_id))
}

/// Sort key treating digit runs numerically, so `osbyte2` sorts before
/// `osbyte10`.
fn natural_key(name: &str) -> Vec<(u64, String)> {
	let mut result = Vec::new();
	let mut digits = String::new();
	let mut text = String::new();
	for c in name.chars() {
		if c.is_ascii_digit() {
			if !text.is_empty() {
				result.push((u64::MAX, std::mem::take(&mut text)));
			}
			digits.push(c);
		} else {
			if !digits.is_empty() {
				result.push((digits.parse().unwrap_or(u64::MAX), String::new()));
				digits.clear();
			}
			text.push(c);
		}
	}
	if !text.is_empty() {
		result.push((u64::MAX, text));
	}
	if !digits.is_empty() {
		result.push((digits.parse().unwrap_or(u64::MAX), String::new()));
	}
	result
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn natural_sort_treats_digit_runs_numerically() {
		let mut names = vec!["osbyte10", "osbyte2", "osword", "a1b2"];
		names.sort_by_key(|name| natural_key(name));
		assert_eq!(names, vec!["a1b2", "osbyte2", "osbyte10", "osword"]);
	}
}
