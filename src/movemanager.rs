//! Moves: relocations from binary addresses to runtime addresses.
//!
//! A move copies a block of bytes from some part of the binary to a
//! different runtime address. A runtime address can be the target of more
//! than one move; this handles, for example, a ROM which copies different
//! fragments of code into the same part of RAM at different times. A binary
//! address, however, belongs to exactly one move: there can only be a
//! single classification for each byte of the binary. Rather than enforce a
//! single-source rule up front, [`MoveManager::add_move`] lets later moves
//! steal source bytes from earlier ones.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::DisassemblyError;
use crate::memory::{BinaryAddr, RuntimeAddr, MEMORY_SIZE};

/// Identifier of a move. The identity move over all of memory is
/// [`BASE_MOVE_ID`]; every call to [`MoveManager::add_move`] mints a fresh
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MoveId(usize);

/// The identity move `(0, 0, 0x10000)`: bytes run where they are loaded.
pub const BASE_MOVE_ID: MoveId = MoveId(0);

impl MoveId {
	/// The raw index of this move in the definition list.
	#[must_use]
	pub const fn index(self) -> usize {
		self.0
	}
}

impl Display for MoveId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "move #{}", self.0)
	}
}

/// A binary address together with the move that owns it. This is the
/// "where did the reference come from" context carried around by labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinaryLocation {
	/// The binary address.
	pub binary_addr: BinaryAddr,
	/// The move owning that address.
	pub move_id:     MoveId,
}

impl Display for BinaryLocation {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", self.binary_addr, self.move_id)
	}
}

/// A declared relocation.
#[derive(Debug, Clone, Copy)]
pub struct Move {
	/// Where the bytes live at runtime.
	pub dest:   RuntimeAddr,
	/// Where the bytes live in the binary.
	pub source: BinaryAddr,
	/// Number of bytes moved.
	pub length: u32,
}

impl Move {
	/// Whether this move's destination range covers the runtime address.
	#[must_use]
	pub fn covers_runtime(&self, addr: RuntimeAddr) -> bool {
		self.dest.value() <= addr.value() && addr.value() < self.dest.value() + self.length
	}
}

/// Owner of all move definitions, the per-binary-byte move assignment and
/// the scoped stack of active moves used to disambiguate runtime-to-binary
/// lookups.
#[derive(Debug)]
pub struct MoveManager {
	definitions:             Vec<Move>,
	move_id_for_binary_addr: Vec<MoveId>,
	active_move_ids:         Vec<MoveId>,
}

impl Default for MoveManager {
	fn default() -> Self {
		Self::new()
	}
}

impl MoveManager {
	/// Creates a move manager holding only the identity move.
	#[must_use]
	pub fn new() -> Self {
		Self {
			definitions:             vec![Move {
				dest:   RuntimeAddr::new(0),
				source: BinaryAddr::new(0),
				length: MEMORY_SIZE,
			}],
			move_id_for_binary_addr: vec![BASE_MOVE_ID; MEMORY_SIZE as usize],
			active_move_ids:         Vec::new(),
		}
	}

	/// Declares a move of `length` bytes from `source` in the binary to
	/// `dest` at runtime. Later moves steal source bytes from earlier ones.
	///
	/// # Errors
	/// If either range runs past the top of memory, the length is zero, or
	/// source and destination coincide.
	pub fn add_move(
		&mut self,
		dest: RuntimeAddr,
		source: BinaryAddr,
		length: u32,
	) -> Result<MoveId, DisassemblyError> {
		if length == 0 || u32::from(source.value()) == dest.value() {
			return Err(DisassemblyError::InvalidAddress { value: dest.value() });
		}
		RuntimeAddr::checked(dest.value() + length)?;
		RuntimeAddr::checked(u32::from(source.value()) + length)?;
		self.definitions.push(Move { dest, source, length });
		let move_id = MoveId(self.definitions.len() - 1);
		for offset in 0 .. length {
			self.move_id_for_binary_addr[source.index() + offset as usize] = move_id;
		}
		Ok(move_id)
	}

	/// Whether the id was minted by this manager.
	#[must_use]
	pub fn is_valid_move_id(&self, move_id: MoveId) -> bool {
		move_id.index() < self.definitions.len()
	}

	/// The definition behind a move id.
	#[must_use]
	pub fn definition(&self, move_id: MoveId) -> &Move {
		&self.definitions[move_id.index()]
	}

	/// The move owning a binary address.
	#[must_use]
	pub fn move_id_for_binary_addr(&self, addr: BinaryAddr) -> MoveId {
		self.move_id_for_binary_addr[addr.index()]
	}

	/// The runtime address a binary byte ends up at. Total and
	/// deterministic: a binary address belongs to exactly one move.
	#[must_use]
	pub fn b2r(&self, binary_addr: BinaryAddr) -> RuntimeAddr {
		let definition = self.definition(self.move_id_for_binary_addr(binary_addr));
		debug_assert!(
			definition.source.value() <= binary_addr.value()
				&& u32::from(binary_addr.value()) < u32::from(definition.source.value()) + definition.length
		);
		RuntimeAddr::checked(
			definition.dest.value() + u32::from(binary_addr.value() - definition.source.value()),
		)
		.expect("move destination ranges are validated on creation")
	}

	/// All non-base moves whose destination range covers the runtime
	/// address, in declaration order.
	#[must_use]
	pub fn move_ids_for_runtime_addr(&self, addr: RuntimeAddr) -> Vec<MoveId> {
		self.definitions
			.iter()
			.enumerate()
			.skip(1)
			.filter(|(_, definition)| definition.covers_runtime(addr))
			.map(|(index, _)| MoveId(index))
			.collect()
	}

	/// The binary location behind a runtime address. A runtime address can
	/// be the target of several moves, so there may be no single correct
	/// answer; the stack of active moves disambiguates, topmost first.
	/// Returns `None` when multiple moves apply and none of them is active.
	#[must_use]
	pub fn r2b(&self, runtime_addr: RuntimeAddr) -> Option<BinaryLocation> {
		let relevant = self.move_ids_for_runtime_addr(runtime_addr);
		let selected = match relevant.as_slice() {
			[] =>
				return BinaryAddr::checked(runtime_addr.value())
					.ok()
					.map(|binary_addr| BinaryLocation { binary_addr, move_id: BASE_MOVE_ID }),
			[only] => *only,
			_ => *self.active_move_ids.iter().rev().find(|active| relevant.contains(active))?,
		};
		let definition = self.definition(selected);
		let binary_addr = BinaryAddr::checked(
			u32::from(definition.source.value()) + (runtime_addr.value() - definition.dest.value()),
		)
		.ok()?;
		Some(BinaryLocation { binary_addr, move_id: selected })
	}

	/// Like [`Self::r2b`] but treats an unresolvable address as fatal.
	///
	/// # Errors
	/// If the runtime address has no unambiguous binary address.
	pub fn r2b_checked(&self, runtime_addr: RuntimeAddr) -> Result<BinaryLocation, DisassemblyError> {
		self.r2b(runtime_addr).ok_or(DisassemblyError::UnresolvedRuntimeAddress { addr: runtime_addr })
	}

	/// The stack of active move ids, bottom first.
	#[must_use]
	pub fn active_move_ids(&self) -> &[MoveId] {
		&self.active_move_ids
	}

	pub(crate) fn push_active(&mut self, move_id: MoveId) {
		self.active_move_ids.push(move_id);
	}

	pub(crate) fn pop_active(&mut self, move_id: MoveId) {
		let top = self.active_move_ids.pop();
		assert_eq!(top, Some(move_id), "active move stack out of balance");
	}
}

/// Scoped activation of a move. While this guard lives, runtime-to-binary
/// lookups prefer the activated move; the guard pops the stack on every
/// exit path, panics included.
#[must_use = "the move is only active while the guard is alive"]
pub struct ActiveMove {
	manager: Arc<RwLock<MoveManager>>,
	move_id: MoveId,
}

impl ActiveMove {
	/// Pushes `move_id` onto the active stack of the shared manager.
	///
	/// # Errors
	/// If the move id is invalid.
	pub fn new(manager: &Arc<RwLock<MoveManager>>, move_id: MoveId) -> Result<Self, DisassemblyError> {
		{
			let mut locked = manager.write();
			if !locked.is_valid_move_id(move_id) {
				return Err(DisassemblyError::InvalidMoveId { move_id });
			}
			locked.push_active(move_id);
		}
		Ok(Self { manager: manager.clone(), move_id })
	}

	/// The move this guard keeps active.
	#[must_use]
	pub const fn move_id(&self) -> MoveId {
		self.move_id
	}
}

impl Drop for ActiveMove {
	fn drop(&mut self) {
		self.manager.write().pop_active(self.move_id);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn runtime(value: u32) -> RuntimeAddr {
		RuntimeAddr::checked(value).unwrap()
	}

	#[test]
	fn later_moves_steal_source_bytes() {
		let mut moves = MoveManager::new();
		let first = moves.add_move(runtime(0x70), BinaryAddr::new(0x1900), 10).unwrap();
		let second = moves.add_move(runtime(0x70), BinaryAddr::new(0x2000), 8).unwrap();

		assert_eq!(moves.move_id_for_binary_addr(BinaryAddr::new(0x70)), BASE_MOVE_ID);
		assert_eq!(moves.move_id_for_binary_addr(BinaryAddr::new(0x1900)), first);
		assert_eq!(moves.move_id_for_binary_addr(BinaryAddr::new(0x2000)), second);
		assert_eq!(moves.move_id_for_binary_addr(BinaryAddr::new(0x2008)), BASE_MOVE_ID);

		assert_eq!(moves.b2r(BinaryAddr::new(0x70)), runtime(0x70));
		assert_eq!(moves.b2r(BinaryAddr::new(0x1900)), runtime(0x70));
		assert_eq!(moves.b2r(BinaryAddr::new(0x2000)), runtime(0x70));
		assert_eq!(moves.b2r(BinaryAddr::new(0x2008)), runtime(0x2008));
	}

	#[test]
	fn active_moves_disambiguate_r2b() {
		let manager = Arc::new(RwLock::new(MoveManager::new()));
		let (first, second) = {
			let mut moves = manager.write();
			let first = moves.add_move(runtime(0x70), BinaryAddr::new(0x1900), 10).unwrap();
			let second = moves.add_move(runtime(0x70), BinaryAddr::new(0x2000), 8).unwrap();
			(first, second)
		};

		assert_eq!(manager.read().r2b(runtime(0x70)), None);
		{
			let _outer = ActiveMove::new(&manager, second).unwrap();
			assert_eq!(manager.read().active_move_ids(), &[second]);
			assert_eq!(
				manager.read().r2b(runtime(0x70)),
				Some(BinaryLocation { binary_addr: BinaryAddr::new(0x2000), move_id: second })
			);
			assert_eq!(
				manager.read().r2b(runtime(0x2008)),
				Some(BinaryLocation { binary_addr: BinaryAddr::new(0x2008), move_id: BASE_MOVE_ID })
			);
			{
				let _inner = ActiveMove::new(&manager, first).unwrap();
				assert_eq!(manager.read().active_move_ids(), &[second, first]);
				assert_eq!(
					manager.read().r2b(runtime(0x70)),
					Some(BinaryLocation { binary_addr: BinaryAddr::new(0x1900), move_id: first })
				);
			}
			assert_eq!(manager.read().active_move_ids(), &[second]);
		}
		assert!(manager.read().active_move_ids().is_empty());
	}

	#[test]
	fn single_move_needs_no_activation() {
		let mut moves = MoveManager::new();
		let only = moves.add_move(runtime(0x900), BinaryAddr::new(0x2005), 4).unwrap();
		assert_eq!(
			moves.r2b(runtime(0x902)),
			Some(BinaryLocation { binary_addr: BinaryAddr::new(0x2007), move_id: only })
		);
	}

	#[test]
	fn invalid_moves_are_rejected() {
		let mut moves = MoveManager::new();
		assert!(moves.add_move(runtime(0x100), BinaryAddr::new(0x100), 4).is_err());
		assert!(moves.add_move(runtime(0x100), BinaryAddr::new(0x200), 0).is_err());
		assert!(moves.add_move(runtime(0xfffe), BinaryAddr::new(0x200), 0x10).is_err());
	}
}
