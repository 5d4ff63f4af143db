//! The analysis context and the public command surface.
//!
//! Everything a control program registers (loads, labels, constants,
//! entries, moves, hooks, data classifications) lands in one
//! [`Disassembly`] value; [`Disassembly::go`] then runs the tracer, fills
//! leftover bytes and emits the output. The core is re-entrant by
//! instantiating a fresh context per run; there are no globals.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use flexstr::{shared_fmt, SharedStr, ToSharedStr};
use parking_lot::RwLock;

use crate::classification::Classification;
use crate::cli::Frontend;
use crate::error::DisassemblyError;
use crate::expression::{is_simple_name, Expr};
use crate::formatter::Formatter;
use crate::instruction::InstructionSet;
use crate::label::{default_move_id, LabelHandle, LabelManager, OptionalLabel, UserLabelMaker};
use crate::memory::{BinaryAddr, MemoryModel, RuntimeAddr};
use crate::movemanager::{ActiveMove, MoveId, MoveManager};
use crate::trace::Tracer;

/// The value of a named constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstantValue {
	/// A plain number.
	Number(u32),
	/// Verbatim assembler text (a string constant or an expression).
	Text(SharedStr),
}

impl From<u32> for ConstantValue {
	fn from(value: u32) -> Self {
		Self::Number(value)
	}
}

impl From<&str> for ConstantValue {
	fn from(value: &str) -> Self {
		Self::Text(value.to_shared_str())
	}
}

/// How a constant's value is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConstantFormat {
	/// Hex, with the width chosen from the value.
	#[default]
	Default,
	/// Decimal.
	Decimal,
	/// Hex.
	Hex,
	/// Binary.
	Binary,
	/// A character literal.
	Char,
	/// Verbatim text.
	String,
}

/// A named assembly-time constant.
#[derive(Debug, Clone)]
pub struct Constant {
	/// The value.
	pub value:   ConstantValue,
	/// The name, unique across all constants.
	pub name:    SharedStr,
	/// Optional trailing comment.
	pub comment: Option<SharedStr>,
	/// Render format for the value.
	pub format:  ConstantFormat,
}

/// Where an annotation is placed relative to the line it annotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnotationAlign {
	/// Before any label definitions at the address.
	BeforeLabel,
	/// After the label definitions, before the line.
	#[default]
	BeforeLine,
	/// After the line.
	AfterLine,
	/// After the line, grouped with trailing label material.
	AfterLabel,
	/// Appended to the line itself.
	Inline,
}

/// What kind of text an annotation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
	/// Comment text; the emitter adds the comment prefix and word-wraps.
	Comment,
	/// A fully formatted line emitted verbatim.
	Raw,
	/// An instruction the tracer found overlapping an existing
	/// classification; rendered as a comment showing the would-be
	/// instruction. The text is unused.
	Overlap,
}

/// A user or tool annotation attached to a binary location.
#[derive(Debug, Clone)]
pub struct Annotation {
	/// Comment or raw line.
	pub kind:           AnnotationKind,
	/// The text.
	pub text:           SharedStr,
	/// Placement relative to the annotated line.
	pub align:          AnnotationAlign,
	/// Annotations at one address are stably sorted by this.
	pub priority:       i64,
	/// Whether the tool generated this annotation itself.
	pub auto_generated: bool,
}

/// An entry point handed to the tracer.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
	pub addr:    BinaryAddr,
	pub move_id: MoveId,
}

/// The whole analysis state for one disassembly run.
pub struct Disassembly {
	pub(crate) memory:          MemoryModel,
	pub(crate) moves:           Arc<RwLock<MoveManager>>,
	pub(crate) labels:          LabelManager,
	pub(crate) constants:       Vec<Constant>,
	pub(crate) annotations:     BTreeMap<u16, Vec<Annotation>>,
	pub(crate) expressions:     HashMap<u16, Expr>,
	pub(crate) tracer:          Tracer,
	pub(crate) instruction_set: Box<dyn InstructionSet>,
	pub(crate) options:         Arc<dyn Frontend>,
	pub(crate) autostring:      Option<usize>,
}

impl std::fmt::Debug for Disassembly {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Disassembly")
			.field("instruction_set", &self.instruction_set.name())
			.field("labels", &self.labels)
			.finish_non_exhaustive()
	}
}

impl Disassembly {
	/// Creates a fresh analysis context.
	#[must_use]
	pub fn new(instruction_set: Box<dyn InstructionSet>, options: Arc<dyn Frontend>) -> Self {
		Self {
			memory: MemoryModel::new(),
			moves: Arc::new(RwLock::new(MoveManager::new())),
			labels: LabelManager::default(),
			constants: Vec::new(),
			annotations: BTreeMap::new(),
			expressions: HashMap::new(),
			tracer: Tracer::new(),
			instruction_set,
			options,
			autostring: None,
		}
	}

	fn check_registration_open(&self, operation: &'static str) -> Result<(), DisassemblyError> {
		if self.tracer.trace_done {
			Err(DisassemblyError::RegistrationAfterTrace { operation })
		} else {
			Ok(())
		}
	}

	/// Loads a file into memory at `addr`.
	///
	/// # Errors
	/// On I/O failure, image overflow, overlapping loads or MD5 mismatch.
	pub fn load(&mut self, addr: BinaryAddr, file_name: &str, md5sum: Option<&str>) -> Result<(), DisassemblyError> {
		self.check_registration_open("load")?;
		let data = std::fs::read(file_name).map_err(|os_error| DisassemblyError::FileNotFound {
			os_error:  Arc::new(os_error),
			file_name: file_name.to_shared_str(),
		})?;
		self.memory.load(addr, &data, md5sum, file_name)
	}

	/// Loads bytes already in hand, for control programs that synthesise or
	/// patch their input.
	///
	/// # Errors
	/// On image overflow, overlapping loads or MD5 mismatch.
	pub fn load_bytes(&mut self, addr: BinaryAddr, data: &[u8], md5sum: Option<&str>) -> Result<(), DisassemblyError> {
		self.check_registration_open("load")?;
		self.memory.load(addr, data, md5sum, "<bytes>")
	}

	/// Declares a tracer entry point at a runtime address, optionally
	/// naming it.
	///
	/// # Errors
	/// If the address cannot be mapped to a binary address or tracing has
	/// already run.
	pub fn entry(&mut self, addr: RuntimeAddr, label: Option<&str>) -> Result<(), DisassemblyError> {
		self.check_registration_open("entry")?;
		let location = self.moves.read().r2b_checked(addr)?;
		if let Some(name) = label {
			self.label_in_move(addr, name, location.move_id);
		}
		self.tracer.add_entry(Entry { addr: location.binary_addr, move_id: location.move_id });
		Ok(())
	}

	/// Attaches a name to a runtime address under the innermost active move
	/// (or the base move). Non-simple names are recorded as expressions.
	pub fn label(&mut self, addr: RuntimeAddr, name: &str) {
		let move_id = default_move_id(&self.moves.read());
		self.label_in_move(addr, name, move_id);
	}

	/// Attaches a name to a runtime address under a specific move.
	pub fn label_in_move(&mut self, addr: RuntimeAddr, name: &str, move_id: MoveId) {
		let moves = self.moves.read();
		let handle = self.labels.ensure(addr, &moves);
		drop(moves);
		let mut label = handle.write();
		if is_simple_name(name) {
			label.add_explicit_name(name.to_shared_str(), move_id, None);
		} else {
			label.add_expression(name.to_shared_str(), move_id);
		}
	}

	/// Registers a label that only materialises if the address is actually
	/// referenced.
	///
	/// # Errors
	/// If the address already carries a different optional label.
	pub fn optional_label(&mut self, addr: RuntimeAddr, name: &str) -> Result<(), DisassemblyError> {
		self.labels.add_optional_label(addr, OptionalLabel {
			name:             name.to_shared_str(),
			base_addr:        None,
			definable_inline: true,
		})
	}

	/// Registers an optional label expressed as an offset from a base
	/// optional label; referencing it pulls the base label in too.
	///
	/// # Errors
	/// If the address already carries a different optional label.
	pub fn optional_label_offset(
		&mut self,
		addr: RuntimeAddr,
		name: &str,
		base_addr: RuntimeAddr,
	) -> Result<(), DisassemblyError> {
		self.labels.add_optional_label(addr, OptionalLabel {
			name:             name.to_shared_str(),
			base_addr:        Some(base_addr),
			definable_inline: true,
		})
	}

	/// Adds a label visible only to references originating from
	/// `[start, end)`.
	pub fn local_label(
		&mut self,
		addr: RuntimeAddr,
		name: &str,
		start: BinaryAddr,
		end: BinaryAddr,
		move_id: Option<MoveId>,
	) {
		let moves = self.moves.read();
		let move_id = move_id.unwrap_or_else(|| default_move_id(&moves));
		let handle = self.labels.ensure(addr, &moves);
		drop(moves);
		handle.write().add_local_label(name.to_shared_str(), start, end, move_id);
	}

	/// Defines a named constant. Redefinition with the same value is
	/// idempotent.
	///
	/// # Errors
	/// If the name exists with a different value.
	pub fn constant(&mut self, value: impl Into<ConstantValue>, name: &str) -> Result<(), DisassemblyError> {
		self.constant_full(value, name, None, ConstantFormat::Default)
	}

	/// Defines a named constant with a comment and an explicit format.
	///
	/// # Errors
	/// If the name exists with a different value.
	pub fn constant_full(
		&mut self,
		value: impl Into<ConstantValue>,
		name: &str,
		comment: Option<&str>,
		format: ConstantFormat,
	) -> Result<(), DisassemblyError> {
		let value = value.into();
		if let Some(existing) = self.constants.iter().find(|constant| constant.name == name) {
			if existing.value == value {
				return Ok(());
			}
			return Err(DisassemblyError::ConstantConflict {
				name:      name.to_shared_str(),
				old_value: describe_constant_value(&existing.value),
				new_value: describe_constant_value(&value),
			});
		}
		self.constants.push(Constant {
			value,
			name: name.to_shared_str(),
			comment: comment.map(ToSharedStr::to_shared_str),
			format,
		});
		Ok(())
	}

	/// Looks up a constant's numeric value by name.
	#[must_use]
	pub fn constant_value(&self, name: &str) -> Option<u32> {
		self.constants.iter().find(|constant| constant.name == name).and_then(|constant| match constant.value {
			ConstantValue::Number(value) => Some(value),
			ConstantValue::Text(_) => None,
		})
	}

	/// Attaches a comment to a runtime address.
	///
	/// # Errors
	/// If the address cannot be mapped to a binary address.
	pub fn comment(&mut self, addr: RuntimeAddr, text: &str) -> Result<(), DisassemblyError> {
		self.comment_full(addr, text, AnnotationAlign::BeforeLine, 0)
	}

	/// Attaches a comment with explicit placement and priority.
	///
	/// # Errors
	/// If the address cannot be mapped to a binary address.
	pub fn comment_full(
		&mut self,
		addr: RuntimeAddr,
		text: &str,
		align: AnnotationAlign,
		priority: i64,
	) -> Result<(), DisassemblyError> {
		let location = self.moves.read().r2b_checked(addr)?;
		self.add_annotation(location.binary_addr, Annotation {
			kind: AnnotationKind::Comment,
			text: text.to_shared_str(),
			align,
			priority,
			auto_generated: false,
		});
		Ok(())
	}

	pub(crate) fn add_annotation(&mut self, addr: BinaryAddr, annotation: Annotation) {
		self.annotations.entry(addr.value()).or_default().push(annotation);
	}

	/// Replaces the literal operand or data value at a runtime address with
	/// an expression. The emitter records an assembler-time assertion that
	/// the expression equals the actual byte(s).
	///
	/// # Errors
	/// If the address cannot be mapped to a binary address.
	pub fn expr(&mut self, addr: RuntimeAddr, expression: impl Into<Expr>) -> Result<(), DisassemblyError> {
		let location = self.moves.read().r2b_checked(addr)?;
		self.expressions.insert(location.binary_addr.value(), expression.into());
		Ok(())
	}

	/// As [`Self::expr`], but keyed directly by binary address. Hooks use
	/// this, since the register-load addresses they receive are binary.
	pub fn expr_binary(&mut self, addr: BinaryAddr, expression: impl Into<Expr>) {
		self.expressions.insert(addr.value(), expression.into());
	}

	pub(crate) fn expression_at(&self, addr: BinaryAddr) -> Option<&Expr> {
		self.expressions.get(&addr.value())
	}

	/// Classifies `n` bytes at a runtime address as byte data.
	///
	/// # Errors
	/// On double classification or unmapped addresses.
	pub fn byte(&mut self, addr: RuntimeAddr, n: usize) -> Result<(), DisassemblyError> {
		let location = self.moves.read().r2b_checked(addr)?;
		self.memory.add_classification(location.binary_addr, Classification::byte_run(n))
	}

	/// Classifies `n` bytes as byte data with a fixed item count per line.
	///
	/// # Errors
	/// On double classification or unmapped addresses.
	pub fn byte_cols(&mut self, addr: RuntimeAddr, n: usize, cols: usize) -> Result<(), DisassemblyError> {
		let location = self.moves.read().r2b_checked(addr)?;
		self.memory.add_classification(location.binary_addr, Classification::byte_run_cols(n, cols))
	}

	/// Classifies `n` little-endian words at a runtime address.
	///
	/// # Errors
	/// On double classification or unmapped addresses.
	pub fn word(&mut self, addr: RuntimeAddr, n: usize) -> Result<(), DisassemblyError> {
		let location = self.moves.read().r2b_checked(addr)?;
		self.memory.add_classification(location.binary_addr, Classification::word_run(n * 2))
	}

	/// Declares a move of `length` bytes from `source` in the binary to
	/// `dest` at runtime.
	///
	/// # Errors
	/// On invalid ranges or if tracing has already run.
	pub fn add_move(
		&mut self,
		dest: RuntimeAddr,
		source: BinaryAddr,
		length: u32,
	) -> Result<MoveId, DisassemblyError> {
		self.check_registration_open("add_move")?;
		self.moves.write().add_move(dest, source, length)
	}

	/// Activates a move for the duration of the returned guard; commands
	/// issued while it lives resolve runtime addresses through this move
	/// first.
	///
	/// # Errors
	/// If the move id is invalid.
	pub fn moved(&self, move_id: MoveId) -> Result<ActiveMove, DisassemblyError> {
		ActiveMove::new(&self.moves, move_id)
	}

	/// Declares an entry point for a subroutine and installs a hook that
	/// decides how tracing continues past calls to it.
	///
	/// # Errors
	/// If a hook is already installed there, the address is unmapped, or
	/// tracing has already run.
	pub fn hook_subroutine(
		&mut self,
		addr: RuntimeAddr,
		name: &str,
		hook: impl Fn(&mut Self, RuntimeAddr, RuntimeAddr) -> Option<RuntimeAddr> + 'static,
	) -> Result<(), DisassemblyError> {
		self.check_registration_open("hook_subroutine")?;
		self.entry(addr, Some(name))?;
		self.tracer.add_jsr_hook(addr, Arc::new(hook))
	}

	/// Registers a hook invoked after tracing for every subroutine call and
	/// absolute jump, with the binary addresses of the immediate operands
	/// that last loaded A, X and Y.
	pub fn add_sequence_hook(
		&mut self,
		hook: impl Fn(&mut Self, RuntimeAddr, Option<BinaryAddr>, Option<BinaryAddr>, Option<BinaryAddr>) + 'static,
	) {
		self.tracer.add_sequence_hook(Arc::new(hook));
	}

	/// Installs the label-maker override.
	///
	/// # Errors
	/// If an override is already installed.
	pub fn set_user_label_maker(&mut self, hook: Box<UserLabelMaker>) -> Result<(), DisassemblyError> {
		self.labels.set_user_label_maker(hook)
	}

	/// The label handle for a runtime address, if anything is known about
	/// it.
	#[must_use]
	pub fn label_at(&self, addr: RuntimeAddr) -> Option<LabelHandle> {
		self.labels.get(addr)
	}

	/// Whether the byte at a binary address is classified.
	#[must_use]
	pub fn is_classified(&self, addr: BinaryAddr) -> bool {
		self.memory.is_classified(addr, 1)
	}

	/// Runs the whole pipeline: trace from the registered entry points,
	/// run the post-trace passes, fill leftover bytes, and emit through the
	/// given formatter. Running twice produces identical output.
	///
	/// # Errors
	/// Any fatal error from tracing, classification or emission.
	pub fn go(&mut self, formatter: &mut dyn Formatter) -> Result<String, DisassemblyError> {
		if !self.tracer.trace_done {
			self.trace()?;
		}
		if let Some(min_length) = self.autostring {
			self.run_autostring(min_length)?;
		}
		self.classify_leftovers()?;
		self.emit(formatter)
	}

	// ------------------------------------------------------------------
	// String classifiers.

	fn string_start(&self, addr: RuntimeAddr) -> Result<BinaryAddr, DisassemblyError> {
		Ok(self.moves.read().r2b_checked(addr)?.binary_addr)
	}

	/// Classifies a string terminated by `terminator`, optionally leaving
	/// the terminator out of the string.
	///
	/// # Errors
	/// If no terminator exists before the end of the loaded range.
	pub fn stringterm(
		&mut self,
		addr: RuntimeAddr,
		terminator: u8,
		exclude_terminator: bool,
	) -> Result<BinaryAddr, DisassemblyError> {
		let start = self.string_start(addr)?;
		let mut current = start;
		loop {
			if self.memory.expect_u8(current)? == terminator {
				break;
			}
			current = current.checked_add(1).ok_or(DisassemblyError::UnloadedAddress { addr: current })?;
		}
		let mut length = current.index() + 1 - start.index();
		if exclude_terminator {
			length -= 1;
		}
		if length > 0 {
			self.memory.add_classification(start, Classification::string_run(length))?;
		}
		current.checked_add(1).ok_or(DisassemblyError::UnloadedAddress { addr: current })
	}

	/// A carriage-return-terminated string.
	///
	/// # Errors
	/// As [`Self::stringterm`].
	pub fn stringcr(&mut self, addr: RuntimeAddr, exclude_terminator: bool) -> Result<BinaryAddr, DisassemblyError> {
		self.stringterm(addr, 13, exclude_terminator)
	}

	/// A NUL-terminated string.
	///
	/// # Errors
	/// As [`Self::stringterm`].
	pub fn stringz(&mut self, addr: RuntimeAddr, exclude_terminator: bool) -> Result<BinaryAddr, DisassemblyError> {
		self.stringterm(addr, 0, exclude_terminator)
	}

	/// A string of `n` bytes, or, with `n` absent, up to the next
	/// unprintable or already classified byte.
	///
	/// # Errors
	/// On unloaded bytes or double classification.
	pub fn string(&mut self, addr: RuntimeAddr, n: Option<usize>) -> Result<BinaryAddr, DisassemblyError> {
		let start = self.string_start(addr)?;
		let length = match n {
			Some(n) => n,
			None => {
				let mut length = 0;
				while let Some(current) = start.checked_add(length) {
					if self.memory.is_classified(current, 1)
						|| !self.memory.u8(current).is_some_and(is_print)
					{
						break;
					}
					length += 1;
				}
				length
			},
		};
		if length > 0 {
			self.memory.add_classification(start, Classification::string_run(length))?;
		}
		start.checked_add(length).ok_or(DisassemblyError::UnloadedAddress { addr: start })
	}

	/// A string terminated by the first byte with bit 7 set; the terminator
	/// stays outside the string unless `include_terminator` accepts it, in
	/// which case it is classified as a byte carrying a `$80+'c'`
	/// expression.
	///
	/// # Errors
	/// On unloaded bytes or double classification.
	pub fn stringhi(
		&mut self,
		addr: RuntimeAddr,
		include_terminator: Option<&dyn Fn(u8) -> bool>,
	) -> Result<BinaryAddr, DisassemblyError> {
		let start = self.string_start(addr)?;
		let mut terminator = start;
		let terminator_byte = loop {
			let byte = self.memory.expect_u8(terminator)?;
			if byte & 0x80 != 0 {
				break byte;
			}
			terminator =
				terminator.checked_add(1).ok_or(DisassemblyError::UnloadedAddress { addr: terminator })?;
		};
		let length = terminator.index() - start.index();
		if length > 0 {
			self.memory.add_classification(start, Classification::string_run(length))?;
		}
		let plain = terminator_byte & 0x7f;
		if include_terminator.is_some_and(|include| include(terminator_byte)) && is_print(plain) {
			self.expressions.insert(terminator.value(), Expr::HiBitChar(plain as char));
			self.memory.add_classification(terminator, Classification::byte_run(1))?;
			return terminator.checked_add(1).ok_or(DisassemblyError::UnloadedAddress { addr: terminator });
		}
		Ok(terminator)
	}

	/// A string terminated by NUL or a byte with bit 7 set.
	///
	/// # Errors
	/// On unloaded bytes or double classification.
	pub fn stringhiz(&mut self, addr: RuntimeAddr) -> Result<BinaryAddr, DisassemblyError> {
		let start = self.string_start(addr)?;
		let mut current = start;
		loop {
			let byte = self.memory.expect_u8(current)?;
			if byte == 0 || byte & 0x80 != 0 {
				break;
			}
			current = current.checked_add(1).ok_or(DisassemblyError::UnloadedAddress { addr: current })?;
		}
		let length = current.index() - start.index();
		if length > 0 {
			self.memory.add_classification(start, Classification::string_run(length))?;
		}
		Ok(current)
	}

	/// A length-prefixed string: the first byte is the length and is
	/// emitted as an expression equal to the span of the string body.
	///
	/// # Errors
	/// On unloaded bytes or double classification.
	pub fn stringn(&mut self, addr: RuntimeAddr) -> Result<BinaryAddr, DisassemblyError> {
		let start = self.string_start(addr)?;
		let length = usize::from(self.memory.expect_u8(start)?);
		let body = start.checked_add(1).ok_or(DisassemblyError::UnloadedAddress { addr: start })?;
		let end = body.checked_add(length).ok_or(DisassemblyError::UnloadedAddress { addr: body })?;
		let moves = self.moves.read();
		let body_runtime = moves.b2r(body);
		let end_runtime = moves.b2r(end);
		drop(moves);
		self.memory.add_classification(start, Classification::byte_run(1))?;
		self.expressions.insert(
			start.value(),
			Expr::Sub(Box::new(Expr::Label(end_runtime)), Box::new(Expr::Label(body_runtime))),
		);
		if length > 0 {
			self.memory.add_classification(body, Classification::string_run(length))?;
		}
		// Both span ends need labels so the length expression resolves.
		let moves = self.moves.read();
		self.labels.ensure(body_runtime, &moves);
		self.labels.ensure(end_runtime, &moves);
		drop(moves);
		Ok(end)
	}

	/// Turns every unclassified run of at least `min_length` printable
	/// bytes into a string. Deferred until after tracing so code is never
	/// swallowed; runs are broken at addresses carrying non-expression
	/// labels.
	pub fn autostring(&mut self, min_length: usize) {
		debug_assert!(min_length >= 2);
		self.autostring = Some(min_length);
	}

	pub(crate) fn run_autostring(&mut self, min_length: usize) -> Result<(), DisassemblyError> {
		let ranges = self.memory.load_ranges().to_vec();
		for range in ranges {
			let mut index = range.start;
			while index < range.end {
				let addr = BinaryAddr::new(index as u16);
				let run_length = self.printable_run_length(addr, range.end);
				if run_length >= min_length {
					self.memory.add_classification(addr, Classification::string_run(run_length))?;
				}
				index += run_length.max(1) as u32;
			}
		}
		Ok(())
	}

	/// Length of the unbroken printable, unclassified, unlabelled run at
	/// `addr`. A non-expression label anywhere after the first byte breaks
	/// the run.
	fn printable_run_length(&self, addr: BinaryAddr, range_end: u32) -> usize {
		let moves = self.moves.read();
		let mut length = 0;
		while u32::from(addr.value()) + (length as u32) < range_end {
			let Some(current) = addr.checked_add(length) else { break };
			if self.memory.is_classified(current, 1) || !self.memory.u8(current).is_some_and(is_print) {
				break;
			}
			if length > 0 {
				let runtime = moves.b2r(current);
				if let Some(label) = self.labels.get(runtime) {
					if !label.read().is_only_an_expression() && !label.read().is_empty() {
						break;
					}
				}
			}
			length += 1;
		}
		length
	}

	/// Classifies all remaining unclassified loaded bytes as mergeable
	/// single-byte runs, then merges adjacent compatible runs.
	pub(crate) fn classify_leftovers(&mut self) -> Result<(), DisassemblyError> {
		let ranges = self.memory.load_ranges().to_vec();
		for range in &ranges {
			let mut index = range.start;
			while index < range.end {
				let addr = BinaryAddr::new(index as u16);
				match self.memory.classification(addr) {
					Some(classification) => index += classification.length() as u32,
					None =>
						if self.memory.is_classified(addr, 1) {
							index += 1;
						} else {
							self.memory.add_classification(addr, Classification::filler(1))?;
							index += 1;
						},
				}
			}
		}
		for range in &ranges {
			self.merge_classifications(range.clone());
		}
		Ok(())
	}

	/// Merges adjacent mergeable byte runs within one loaded range.
	fn merge_classifications(&mut self, range: std::ops::Range<u32>) {
		let mut index = range.start;
		while index < range.end {
			let addr = BinaryAddr::new(index as u16);
			let Some(classification) = self.memory.classification(addr).copied() else {
				index += 1;
				continue;
			};
			let mut total = classification.length();
			if classification.is_mergeable() {
				loop {
					let Some(next) = addr.checked_add(total) else { break };
					if u32::from(next.value()) >= range.end {
						break;
					}
					match self.memory.classification(next) {
						Some(next_classification) if next_classification.is_mergeable() => {
							total += next_classification.length();
						},
						_ => break,
					}
				}
				if total > classification.length() {
					let mut consumed = 0;
					while consumed < total {
						let current = addr.checked_add(consumed).expect("merged run stays in range");
						let removed = self
							.memory
							.remove_classification(current)
							.expect("merged run is fully classified");
						consumed += removed.length();
					}
					self.memory
						.add_classification(addr, Classification::filler(total))
						.expect("merged run replaces existing classifications");
				}
			}
			index += total as u32;
		}
	}

	// ------------------------------------------------------------------
	// Convenience commands layered on the public surface.

	/// Interprets the word at `addr` as an RTS-style dispatch address
	/// (target minus one): classifies it as a word carrying a `label-1`
	/// expression and adds the target as an entry point.
	///
	/// # Errors
	/// On unloaded bytes, unmapped addresses or double classification.
	pub fn rts_address(&mut self, addr: RuntimeAddr) -> Result<RuntimeAddr, DisassemblyError> {
		let location = self.moves.read().r2b_checked(addr)?;
		let stored = self
			.memory
			.u16_le(location.binary_addr)
			.ok_or(DisassemblyError::UnloadedAddress { addr: location.binary_addr })?;
		let handler = RuntimeAddr::new(stored.wrapping_add(1));
		self.entry(handler, None)?;
		self.word(addr, 1)?;
		self.expr(addr, Expr::label(handler).offset(-1))?;
		Ok(addr.saturating_add(2))
	}

	/// Interprets split low/high jump-table bytes as an entry point and
	/// replaces both bytes with `<`/`>` expressions over its label.
	///
	/// # Errors
	/// On unloaded bytes or unmapped addresses.
	pub fn split_jump_table_entry(
		&mut self,
		low_addr: RuntimeAddr,
		high_addr: RuntimeAddr,
		offset: i32,
	) -> Result<(), DisassemblyError> {
		let moves = self.moves.read();
		let low = moves.r2b_checked(low_addr)?;
		let high = moves.r2b_checked(high_addr)?;
		drop(moves);
		let low_byte = self.memory.expect_u8(low.binary_addr)?;
		let high_byte = self.memory.expect_u8(high.binary_addr)?;
		let target = RuntimeAddr::checked(
			((u32::from(high_byte) << 8) | u32::from(low_byte)).wrapping_add(offset as u32) & 0xffff,
		)?;
		self.entry(target, None)?;
		self.expr(low_addr, Expr::label(target).offset(-offset).lo())?;
		self.expr(high_addr, Expr::label(target).offset(-offset).hi())?;
		Ok(())
	}
}

/// ASCII-printable test used by the string classifiers.
pub(crate) const fn is_print(byte: u8) -> bool {
	byte >= 0x20 && byte < 0x7f
}

fn describe_constant_value(value: &ConstantValue) -> SharedStr {
	match value {
		ConstantValue::Number(number) => shared_fmt!("{number:#x}"),
		ConstantValue::Text(text) => text.clone(),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::cli::default_frontend_options;
	use crate::instruction::mos6502::Mos6502;

	fn context() -> Disassembly {
		Disassembly::new(Box::new(Mos6502::new(false)), default_frontend_options())
	}

	#[test]
	fn constants_are_idempotent_but_conflicts_are_fatal() {
		let mut dis = context();
		dis.constant(0x7eu32, "osbyte_acknowledge_escape").unwrap();
		dis.constant(0x7eu32, "osbyte_acknowledge_escape").unwrap();
		assert!(dis.constant(0x7fu32, "osbyte_acknowledge_escape").is_err());
		assert_eq!(dis.constant_value("osbyte_acknowledge_escape"), Some(0x7e));
	}

	#[test]
	fn stringz_without_terminator_fails() {
		let mut dis = context();
		dis.load_bytes(BinaryAddr::new(0x0e00), b"AB", None).unwrap();
		let result = dis.stringz(RuntimeAddr::new(0x0e00), false);
		assert!(matches!(result, Err(DisassemblyError::UnloadedAddress { .. })));
		// Nothing got classified by the failed scan.
		assert!(!dis.is_classified(BinaryAddr::new(0x0e00)));
	}

	#[test]
	fn stringterm_includes_or_excludes_the_terminator() {
		let mut dis = context();
		dis.load_bytes(BinaryAddr::new(0x0e00), b"AB\rCD\r", None).unwrap();
		let next = dis.stringcr(RuntimeAddr::new(0x0e00), false).unwrap();
		assert_eq!(next, BinaryAddr::new(0x0e03));
		assert_eq!(dis.memory.classification(BinaryAddr::new(0x0e00)), Some(&Classification::string_run(3)));
		let next = dis.stringcr(RuntimeAddr::new(0x0e03), true).unwrap();
		assert_eq!(next, BinaryAddr::new(0x0e06));
		assert_eq!(dis.memory.classification(BinaryAddr::new(0x0e03)), Some(&Classification::string_run(2)));
		assert!(!dis.is_classified(BinaryAddr::new(0x0e05)));
	}

	#[test]
	fn leftover_bytes_become_merged_filler_runs() {
		let mut dis = context();
		dis.load_bytes(BinaryAddr::new(0x3000), &[1, 2, 3, 4, 5, 6], None).unwrap();
		dis.word(RuntimeAddr::new(0x3002), 1).unwrap();
		dis.classify_leftovers().unwrap();
		assert_eq!(dis.memory.classification(BinaryAddr::new(0x3000)), Some(&Classification::filler(2)));
		assert_eq!(dis.memory.classification(BinaryAddr::new(0x3002)), Some(&Classification::word_run(2)));
		assert_eq!(dis.memory.classification(BinaryAddr::new(0x3004)), Some(&Classification::filler(2)));
	}
}
