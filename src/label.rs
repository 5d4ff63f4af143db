//! Labels: symbolic names for runtime addresses.
//!
//! A [`Label`] collects everything known about one runtime address: the
//! binary locations that reference it, the explicit names the user gave it
//! (per move), expression-only names, local labels with a validity range,
//! and bookkeeping about where in the output the label can be defined
//! inline. The [`LabelManager`] owns the labels as shared handles so hooks
//! and the emitter can annotate them while the tracer is borrowing
//! everything else.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use flexstr::SharedStr;
use parking_lot::RwLock;

use crate::error::DisassemblyError;
use crate::memory::{BinaryAddr, RuntimeAddr};
use crate::movemanager::{BinaryLocation, MoveId, MoveManager, BASE_MOVE_ID};

/// One name attached to a label. Remembers whether it has already been
/// written to the output so that each name is defined exactly once.
#[derive(Debug, Clone)]
pub struct Name {
	/// The name text.
	pub text:     SharedStr,
	/// Set once the definition has been emitted.
	pub emitted:  bool,
	/// Lower values are emitted first; unprioritised names come last.
	pub priority: Option<i64>,
}

/// A name that is only valid for references originating from a particular
/// binary range.
#[derive(Debug, Clone)]
pub struct LocalLabel {
	/// The name text.
	pub name:  SharedStr,
	/// First binary address the name is visible from.
	pub start: BinaryAddr,
	/// End (exclusive) of the visibility range.
	pub end:   BinaryAddr,
}

/// Everything known about one runtime address.
#[derive(Debug)]
pub struct Label {
	/// The address this label names.
	pub runtime_addr:             RuntimeAddr,
	/// Active moves covering this address when the label was created; used
	/// as a hint for which move the label most likely belongs to.
	pub relevant_active_move_ids: Vec<MoveId>,
	/// Binary locations that reference this address.
	pub references:               Vec<BinaryLocation>,
	/// User-provided names per move, in registration order. The first
	/// registered name for a move wins when a single name is wanted.
	pub explicit_names:           HashMap<MoveId, Vec<Name>>,
	/// Non-simple names (expressions) per move.
	pub expressions:              HashMap<MoveId, Vec<SharedStr>>,
	/// Range-restricted names per move.
	pub local_labels:             HashMap<MoveId, Vec<LocalLabel>>,
	/// Moves whose emission walk passes over this address, meaning the
	/// label could be defined inline there.
	pub emit_opportunities:       BTreeSet<MoveId>,
	/// Whether a definition may appear inline at the address; otherwise an
	/// explicit `name = value` line is required.
	pub definable_inline:         bool,
}

impl Label {
	fn new(runtime_addr: RuntimeAddr, moves: &MoveManager) -> Self {
		let relevant = moves.move_ids_for_runtime_addr(runtime_addr);
		let relevant_active_move_ids =
			moves.active_move_ids().iter().copied().filter(|id| relevant.contains(id)).collect();
		Self {
			runtime_addr,
			relevant_active_move_ids,
			references: Vec::new(),
			explicit_names: HashMap::new(),
			expressions: HashMap::new(),
			local_labels: HashMap::new(),
			emit_opportunities: BTreeSet::new(),
			definable_inline: true,
		}
	}

	/// Records that a binary location references this address.
	pub fn add_reference(&mut self, reference: BinaryLocation) {
		self.references.push(reference);
	}

	/// Adds a simple name under a move. Re-adding a name this label already
	/// has anywhere is a no-op; insertion order is preserved so the first
	/// registered name wins on output.
	pub fn add_explicit_name(&mut self, name: SharedStr, move_id: MoveId, priority: Option<i64>) {
		if !self.all_names().contains(&name) {
			self.explicit_names.entry(move_id).or_default().push(Name { text: name, emitted: false, priority });
		}
	}

	/// Adds an expression usable when referencing this address.
	pub fn add_expression(&mut self, expression: SharedStr, move_id: MoveId) {
		if !self.all_names().contains(&expression) {
			self.expressions.entry(move_id).or_default().push(expression);
		}
	}

	/// Adds a name visible only from `[start, end)`.
	pub fn add_local_label(&mut self, name: SharedStr, start: BinaryAddr, end: BinaryAddr, move_id: MoveId) {
		self.local_labels.entry(move_id).or_default().push(LocalLabel { name, start, end });
	}

	/// All names and expressions attached to this label, any move.
	#[must_use]
	pub fn all_names(&self) -> HashSet<SharedStr> {
		let mut result = HashSet::new();
		for locals in self.local_labels.values() {
			result.extend(locals.iter().map(|local| local.name.clone()));
		}
		for names in self.explicit_names.values() {
			result.extend(names.iter().map(|name| name.text.clone()));
		}
		for expressions in self.expressions.values() {
			result.extend(expressions.iter().cloned());
		}
		result
	}

	/// Whether the only thing known for this address is expressions. Such
	/// labels don't interrupt automatic string detection.
	#[must_use]
	pub fn is_only_an_expression(&self) -> bool {
		self.explicit_names.values().all(Vec::is_empty)
			&& self.local_labels.values().all(Vec::is_empty)
			&& self.expressions.values().any(|expressions| !expressions.is_empty())
	}

	/// Whether nothing at all has been recorded against this address.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.references.is_empty()
			&& self.explicit_names.values().all(Vec::is_empty)
			&& self.local_labels.values().all(Vec::is_empty)
			&& self.expressions.values().all(Vec::is_empty)
	}

	/// Records that `move_id`'s emission walk passes over this address.
	pub fn notify_emit_opportunity(&mut self, move_id: MoveId) {
		self.emit_opportunities.insert(move_id);
	}

	/// The local label visible from `binary_ctx` under `move_id`, if any.
	#[must_use]
	pub fn local_name_for(&self, binary_ctx: BinaryAddr, move_id: MoveId) -> Option<SharedStr> {
		self.local_labels.get(&move_id)?.iter().find_map(|local| {
			(local.start <= binary_ctx && binary_ctx < local.end).then(|| local.name.clone())
		})
	}

	/// The first explicit name registered under `move_id`, if any.
	#[must_use]
	pub fn first_explicit_name(&self, move_id: MoveId) -> Option<SharedStr> {
		self.explicit_names.get(&move_id)?.first().map(|name| name.text.clone())
	}

	/// The first expression registered under `move_id`, if any.
	#[must_use]
	pub fn first_expression(&self, move_id: MoveId) -> Option<SharedStr> {
		self.expressions.get(&move_id)?.first().cloned()
	}

	fn reset_emitted(&mut self) {
		for names in self.explicit_names.values_mut() {
			for name in names {
				name.emitted = false;
			}
		}
	}
}

/// A label registered up front but only materialised if something actually
/// references its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionalLabel {
	/// The name to use if referenced.
	pub name:             SharedStr,
	/// Optional address of a base optional label this one is an offset
	/// from (`userv+1` hangs off `userv`); referencing this label pulls the
	/// base label in as well.
	pub base_addr:        Option<RuntimeAddr>,
	/// Whether the materialised label may be defined inline.
	pub definable_inline: bool,
}

/// Shared handle to a label.
pub type LabelHandle = Arc<RwLock<Label>>;

/// The result of resolving a label name: the text and the move it was found
/// (or registered) under.
pub type ResolvedName = (SharedStr, MoveId);

/// Override point for computed names. Receives the runtime address, the
/// referencing binary address and the suggested resolution; may return a
/// replacement.
pub type UserLabelMaker = dyn Fn(RuntimeAddr, BinaryAddr, &ResolvedName) -> Option<ResolvedName>;

/// Owner of all labels, optional labels and resolution state.
#[derive(Default)]
pub struct LabelManager {
	labels:           BTreeMap<u32, LabelHandle>,
	optional_labels:  HashMap<u32, OptionalLabel>,
	autogenerated:    BTreeSet<SharedStr>,
	resolution_memo:  HashMap<(u32, u16, usize), ResolvedName>,
	user_label_maker: Option<Box<UserLabelMaker>>,
}

impl std::fmt::Debug for LabelManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LabelManager")
			.field("labels", &self.labels.len())
			.field("optional_labels", &self.optional_labels.len())
			.field("autogenerated", &self.autogenerated)
			.finish_non_exhaustive()
	}
}

impl LabelManager {
	/// The label for a runtime address, created empty on first use.
	pub fn ensure(&mut self, runtime_addr: RuntimeAddr, moves: &MoveManager) -> LabelHandle {
		self.labels
			.entry(runtime_addr.value())
			.or_insert_with(|| Arc::new(RwLock::new(Label::new(runtime_addr, moves))))
			.clone()
	}

	/// The label for a runtime address, if one exists.
	#[must_use]
	pub fn get(&self, runtime_addr: RuntimeAddr) -> Option<LabelHandle> {
		self.labels.get(&runtime_addr.value()).cloned()
	}

	/// All labels in address order.
	pub fn iter(&self) -> impl Iterator<Item = (RuntimeAddr, &LabelHandle)> {
		self.labels
			.iter()
			.map(|(addr, label)| (RuntimeAddr::checked(*addr).expect("label keys are valid addresses"), label))
	}

	/// Registers an optional label. Re-registration with identical details
	/// is idempotent.
	///
	/// # Errors
	/// If the address already carries a different optional label.
	pub fn add_optional_label(
		&mut self,
		addr: RuntimeAddr,
		label: OptionalLabel,
	) -> Result<(), DisassemblyError> {
		match self.optional_labels.get(&addr.value()) {
			Some(existing) if *existing == label => Ok(()),
			Some(_) => Err(DisassemblyError::OptionalLabelConflict { addr, name: label.name }),
			None => {
				self.optional_labels.insert(addr.value(), label);
				Ok(())
			},
		}
	}

	/// The optional label at an address, if any.
	#[must_use]
	pub fn optional_label(&self, addr: RuntimeAddr) -> Option<&OptionalLabel> {
		self.optional_labels.get(&addr.value())
	}

	/// Installs the user label-maker hook. Only one override is supported;
	/// compose wrappers at the call site if more are needed.
	pub fn set_user_label_maker(
		&mut self,
		hook: Box<UserLabelMaker>,
	) -> Result<(), DisassemblyError> {
		if self.user_label_maker.is_some() {
			return Err(DisassemblyError::DuplicateLabelMaker);
		}
		self.user_label_maker = Some(hook);
		Ok(())
	}

	pub(crate) fn user_label_maker(
		&self,
		runtime_addr: RuntimeAddr,
		binary_ctx: BinaryAddr,
		suggestion: &ResolvedName,
	) -> Option<ResolvedName> {
		self.user_label_maker.as_ref().and_then(|hook| hook(runtime_addr, binary_ctx, suggestion))
	}

	/// Records an autogenerated name for the end-of-output listing.
	pub fn register_autogenerated(&mut self, name: SharedStr) {
		self.autogenerated.insert(name);
	}

	/// All autogenerated names, sorted.
	#[must_use]
	pub const fn autogenerated(&self) -> &BTreeSet<SharedStr> {
		&self.autogenerated
	}

	pub(crate) fn memoised(&self, runtime: RuntimeAddr, binary_ctx: BinaryAddr, move_id: MoveId) -> Option<ResolvedName> {
		self.resolution_memo.get(&(runtime.value(), binary_ctx.value(), move_id.index())).cloned()
	}

	pub(crate) fn memoise(
		&mut self,
		runtime: RuntimeAddr,
		binary_ctx: BinaryAddr,
		move_id: MoveId,
		result: ResolvedName,
	) {
		self.resolution_memo.insert((runtime.value(), binary_ctx.value(), move_id.index()), result);
	}

	/// Clears all emitted flags so a fresh emission pass reproduces the same
	/// output as the first one.
	pub fn reset_emitted(&mut self) {
		for label in self.labels.values() {
			label.write().reset_emitted();
		}
	}

	/// Drops empty labels created by speculative lookups. Mostly useful to
	/// keep debug dumps readable.
	pub fn prune_empty(&mut self) {
		self.labels.retain(|_, label| !label.read().is_empty());
	}
}

/// Default move id for user registrations: the innermost active move, or
/// the base move outside any `moved` region.
#[must_use]
pub fn default_move_id(moves: &MoveManager) -> MoveId {
	moves.active_move_ids().last().copied().unwrap_or(BASE_MOVE_ID)
}

#[cfg(test)]
mod test {
	use flexstr::ToSharedStr;

	use super::*;

	#[test]
	fn first_registered_name_wins() {
		let moves = MoveManager::new();
		let mut manager = LabelManager::default();
		let handle = manager.ensure(RuntimeAddr::new(0x900), &moves);
		{
			let mut label = handle.write();
			label.add_explicit_name("entry".to_shared_str(), BASE_MOVE_ID, None);
			label.add_explicit_name("start".to_shared_str(), BASE_MOVE_ID, None);
			label.add_explicit_name("entry".to_shared_str(), BASE_MOVE_ID, None);
		}
		let label = handle.read();
		assert_eq!(label.first_explicit_name(BASE_MOVE_ID).unwrap(), "entry");
		assert_eq!(label.explicit_names[&BASE_MOVE_ID].len(), 2);
	}

	#[test]
	fn local_labels_respect_their_range() {
		let moves = MoveManager::new();
		let mut manager = LabelManager::default();
		let handle = manager.ensure(RuntimeAddr::new(0x1234), &moves);
		handle.write().add_local_label(
			"nearby".to_shared_str(),
			BinaryAddr::new(0x1200),
			BinaryAddr::new(0x1300),
			BASE_MOVE_ID,
		);
		let label = handle.read();
		assert_eq!(label.local_name_for(BinaryAddr::new(0x1250), BASE_MOVE_ID).unwrap(), "nearby");
		assert_eq!(label.local_name_for(BinaryAddr::new(0x1300), BASE_MOVE_ID), None);
		assert_eq!(label.local_name_for(BinaryAddr::new(0x11ff), BASE_MOVE_ID), None);
	}

	#[test]
	fn optional_label_conflicts_are_fatal() {
		let mut manager = LabelManager::default();
		let label = OptionalLabel {
			name:             "osrdch".to_shared_str(),
			base_addr:        None,
			definable_inline: true,
		};
		manager.add_optional_label(RuntimeAddr::new(0xffe0), label.clone()).unwrap();
		manager.add_optional_label(RuntimeAddr::new(0xffe0), label).unwrap();
		let conflicting = OptionalLabel {
			name:             "oswrch".to_shared_str(),
			base_addr:        None,
			definable_inline: true,
		};
		assert!(manager.add_optional_label(RuntimeAddr::new(0xffe0), conflicting).is_err());
	}
}
