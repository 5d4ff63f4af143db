//! The memory model: loaded image bytes plus per-byte classification state.
//!
//! Two 16-bit address spaces exist and must never be mixed up: a
//! [`BinaryAddr`] is an offset into the loaded image, a [`RuntimeAddr`] is
//! the address a byte lives at while the program executes (after any
//! relocations declared with moves). The two coincide for code that is not
//! relocated, which is exactly why mixing them up goes unnoticed until a
//! relocated binary comes along.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::fmt::{self, Display, Formatter};
use std::ops::Range;

use flexstr::{SharedStr, ToSharedStr};
use md5::{Digest, Md5};

use crate::classification::Classification;
use crate::error::DisassemblyError;

/// Size of the address space in bytes.
pub const MEMORY_SIZE: u32 = 0x10000;

/// An offset into the binary image being disassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BinaryAddr(u16);

impl BinaryAddr {
	/// Creates a binary address, failing on values past the top of memory.
	///
	/// # Errors
	/// If the value is not a valid 16-bit address.
	pub fn checked(value: u32) -> Result<Self, DisassemblyError> {
		u16::try_from(value).map(Self).map_err(|_| DisassemblyError::InvalidAddress { value })
	}

	/// Creates a binary address from a raw 16-bit value.
	#[must_use]
	pub const fn new(value: u16) -> Self {
		Self(value)
	}

	/// The raw address value.
	#[must_use]
	pub const fn value(self) -> u16 {
		self.0
	}

	/// The address as an index into the 64 KiB byte and slot arrays.
	#[must_use]
	pub const fn index(self) -> usize {
		self.0 as usize
	}

	/// Advances the address, returning `None` when the result would pass the
	/// top of memory. Instructions whose operands cross the top of memory are
	/// rejected by way of this returning `None`.
	#[must_use]
	pub fn checked_add(self, offset: usize) -> Option<Self> {
		u16::try_from(self.0 as usize + offset).ok().map(Self)
	}
}

impl Display for BinaryAddr {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "${:04x}", self.0)
	}
}

/// An execution-time address. `0x10000` is permitted so that the end of a
/// range reaching the top of memory can still carry a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeAddr(u32);

impl RuntimeAddr {
	/// Creates a runtime address, failing on values past `0x10000`.
	///
	/// # Errors
	/// If the value is out of range.
	pub fn checked(value: u32) -> Result<Self, DisassemblyError> {
		if value <= MEMORY_SIZE { Ok(Self(value)) } else { Err(DisassemblyError::InvalidAddress { value }) }
	}

	/// Creates a runtime address from a raw 16-bit value.
	#[must_use]
	pub const fn new(value: u16) -> Self {
		Self(value as u32)
	}

	/// The raw address value.
	#[must_use]
	pub const fn value(self) -> u32 {
		self.0
	}

	/// Advances the address, saturating at the exclusive top-of-memory value.
	#[must_use]
	pub fn saturating_add(self, offset: u32) -> Self {
		Self((self.0 + offset).min(MEMORY_SIZE))
	}

	/// The target of a relative branch: `self + 2 + displacement`, with
	/// 16-bit wraparound exactly as the processor computes it.
	#[must_use]
	pub fn branch_target(self, displacement: i8) -> Self {
		Self((self.0 as i64 + 2 + i64::from(displacement)).rem_euclid(i64::from(MEMORY_SIZE)) as u32)
	}
}

impl Display for RuntimeAddr {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "${:04x}", self.0)
	}
}

/// Per-byte classification state.
#[derive(Debug, Clone, Default)]
pub enum ClassificationSlot {
	/// Nothing has classified this byte yet.
	#[default]
	Unclassified,
	/// Second or later byte of a multi-byte classification.
	Inside,
	/// First byte of a classification.
	Start(Classification),
}

impl ClassificationSlot {
	/// Whether the byte is covered by any classification.
	#[must_use]
	pub const fn is_classified(&self) -> bool {
		!matches!(self, Self::Unclassified)
	}
}

/// The 64 KiB image under analysis together with the set of loaded ranges
/// and the classification assigned to each loaded byte.
#[derive(Debug)]
pub struct MemoryModel {
	bytes:       Vec<Option<u8>>,
	slots:       Vec<ClassificationSlot>,
	load_ranges: Vec<Range<u32>>,
}

impl Default for MemoryModel {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryModel {
	/// Creates an empty memory model with nothing loaded.
	#[must_use]
	pub fn new() -> Self {
		Self {
			bytes:       vec![None; MEMORY_SIZE as usize],
			slots:       vec![ClassificationSlot::Unclassified; MEMORY_SIZE as usize],
			load_ranges: Vec::new(),
		}
	}

	/// Places `data` into memory at `addr` and records the loaded range.
	/// Multiple loads are allowed as long as the ranges stay disjoint.
	///
	/// # Errors
	/// If the data would extend past the top of memory, overlap an existing
	/// range, or fail the optional MD5 digest check.
	pub fn load(
		&mut self,
		addr: BinaryAddr,
		data: &[u8],
		md5sum: Option<&str>,
		file_name: &str,
	) -> Result<(), DisassemblyError> {
		let start = u32::from(addr.value());
		let end = start + data.len() as u32;
		if end > MEMORY_SIZE {
			return Err(DisassemblyError::ImageOverflow { addr, length: data.len() });
		}
		if self.load_ranges.iter().any(|range| start < range.end && range.start < end) {
			return Err(DisassemblyError::LoadOverlap { addr });
		}
		if let Some(expected) = md5sum {
			let actual = hex_digest(data);
			if !expected.eq_ignore_ascii_case(&actual) {
				return Err(DisassemblyError::ChecksumMismatch {
					expected:  expected.to_shared_str(),
					actual:    actual.to_shared_str(),
					file_name: file_name.to_shared_str(),
				});
			}
		}
		for (offset, byte) in data.iter().enumerate() {
			self.bytes[addr.index() + offset] = Some(*byte);
		}
		self.load_ranges.push(start .. end);
		self.load_ranges.sort_by_key(|range| range.start);
		Ok(())
	}

	/// The loaded ranges, sorted by start address.
	#[must_use]
	pub fn load_ranges(&self) -> &[Range<u32>] {
		&self.load_ranges
	}

	/// Whether a byte was loaded at the address.
	#[must_use]
	pub fn is_loaded(&self, addr: BinaryAddr) -> bool {
		self.bytes[addr.index()].is_some()
	}

	/// The loaded range containing `addr`, if any.
	#[must_use]
	pub fn loaded_range_containing(&self, addr: BinaryAddr) -> Option<Range<u32>> {
		let value = u32::from(addr.value());
		self.load_ranges.iter().find(|range| range.contains(&value)).cloned()
	}

	/// The byte at the address, if loaded.
	#[must_use]
	pub fn u8(&self, addr: BinaryAddr) -> Option<u8> {
		self.bytes[addr.index()]
	}

	/// The byte at the address.
	///
	/// # Errors
	/// If no data was loaded there.
	pub fn expect_u8(&self, addr: BinaryAddr) -> Result<u8, DisassemblyError> {
		self.u8(addr).ok_or(DisassemblyError::UnloadedAddress { addr })
	}

	/// The little-endian 16-bit value at the address. `None` if either byte
	/// is unloaded or the pair crosses the top of memory.
	#[must_use]
	pub fn u16_le(&self, addr: BinaryAddr) -> Option<u16> {
		let high_addr = addr.checked_add(1)?;
		Some(u16::from(self.u8(addr)?) | (u16::from(self.u8(high_addr)?) << 8))
	}

	/// Whether any byte in `[addr, addr + length)` is classified. Bytes past
	/// the top of memory count as unclassified.
	#[must_use]
	pub fn is_classified(&self, addr: BinaryAddr, length: usize) -> bool {
		(0 .. length)
			.filter_map(|offset| addr.checked_add(offset))
			.any(|current| self.slots[current.index()].is_classified())
	}

	/// Installs a classification at `addr` and stamps the remaining bytes as
	/// interior.
	///
	/// # Errors
	/// If any covered byte is already classified, or the classification
	/// crosses the end of the loaded range it starts in.
	pub fn add_classification(
		&mut self,
		addr: BinaryAddr,
		classification: Classification,
	) -> Result<(), DisassemblyError> {
		let length = classification.length();
		debug_assert!(length > 0);
		if self.is_classified(addr, length) {
			return Err(DisassemblyError::DoubleClassification { addr });
		}
		let range = self
			.loaded_range_containing(addr)
			.ok_or(DisassemblyError::UnloadedAddress { addr })?;
		if u32::from(addr.value()) + length as u32 > range.end {
			return Err(DisassemblyError::RangeStraddle { addr, length });
		}
		self.slots[addr.index()] = ClassificationSlot::Start(classification);
		for offset in 1 .. length {
			self.slots[addr.index() + offset] = ClassificationSlot::Inside;
		}
		Ok(())
	}

	/// The classification slot at the address.
	#[must_use]
	pub fn slot(&self, addr: BinaryAddr) -> &ClassificationSlot {
		&self.slots[addr.index()]
	}

	/// The classification starting exactly at the address, if any.
	#[must_use]
	pub fn classification(&self, addr: BinaryAddr) -> Option<&Classification> {
		match &self.slots[addr.index()] {
			ClassificationSlot::Start(classification) => Some(classification),
			_ => None,
		}
	}

	/// Walks back from an interior byte to the start of the classification
	/// covering it. Returns `addr` itself when it is a start or unclassified.
	#[must_use]
	pub fn classification_start(&self, addr: BinaryAddr) -> BinaryAddr {
		let mut index = addr.index();
		while matches!(self.slots[index], ClassificationSlot::Inside) {
			index -= 1;
		}
		BinaryAddr::new(index as u16)
	}

	/// Removes the classification starting at `addr`, clearing its interior
	/// stamps, and returns it. Used when splitting or merging runs; the
	/// caller re-installs replacements immediately.
	pub(crate) fn remove_classification(&mut self, addr: BinaryAddr) -> Option<Classification> {
		let classification = match std::mem::take(&mut self.slots[addr.index()]) {
			ClassificationSlot::Start(classification) => classification,
			other => {
				self.slots[addr.index()] = other;
				return None;
			},
		};
		for offset in 1 .. classification.length() {
			self.slots[addr.index() + offset] = ClassificationSlot::Unclassified;
		}
		Some(classification)
	}
}

/// Lowercase hex MD5 digest of a byte slice.
fn hex_digest(data: &[u8]) -> String {
	let mut hasher = Md5::new();
	hasher.update(data);
	hasher.finalize().iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Shared digest rendering for anything else that wants to show an MD5.
#[must_use]
pub fn md5_digest(data: &[u8]) -> SharedStr {
	hex_digest(data).to_shared_str()
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn load_and_read_back() {
		let mut memory = MemoryModel::new();
		memory.load(BinaryAddr::new(0x1000), &[0x12, 0x34], None, "test").unwrap();
		assert_eq!(memory.u8(BinaryAddr::new(0x1000)), Some(0x12));
		assert_eq!(memory.u16_le(BinaryAddr::new(0x1000)), Some(0x3412));
		assert!(!memory.is_loaded(BinaryAddr::new(0x0fff)));
		assert_eq!(memory.load_ranges(), &[0x1000 .. 0x1002]);
	}

	#[test]
	fn load_overflow_is_rejected() {
		let mut memory = MemoryModel::new();
		let result = memory.load(BinaryAddr::new(0xffff), &[0, 0], None, "test");
		assert!(matches!(result, Err(DisassemblyError::ImageOverflow { .. })));
	}

	#[test]
	fn overlapping_loads_are_rejected() {
		let mut memory = MemoryModel::new();
		memory.load(BinaryAddr::new(0x2000), &[0; 16], None, "test").unwrap();
		let result = memory.load(BinaryAddr::new(0x200f), &[0; 2], None, "test");
		assert!(matches!(result, Err(DisassemblyError::LoadOverlap { .. })));
	}

	#[test]
	fn checksum_mismatch_is_fatal() {
		let mut memory = MemoryModel::new();
		let result = memory.load(BinaryAddr::new(0), &[1, 2, 3], Some("00000000000000000000000000000000"), "test");
		assert!(matches!(result, Err(DisassemblyError::ChecksumMismatch { .. })));
	}

	#[test]
	fn classification_stamps_interior_bytes() {
		let mut memory = MemoryModel::new();
		memory.load(BinaryAddr::new(0x100), &[0; 8], None, "test").unwrap();
		memory.add_classification(BinaryAddr::new(0x100), Classification::word_run(4)).unwrap();
		assert!(memory.is_classified(BinaryAddr::new(0x103), 1));
		assert!(!memory.is_classified(BinaryAddr::new(0x104), 1));
		assert_eq!(memory.classification_start(BinaryAddr::new(0x103)), BinaryAddr::new(0x100));
		let result = memory.add_classification(BinaryAddr::new(0x102), Classification::byte_run(1));
		assert!(matches!(result, Err(DisassemblyError::DoubleClassification { .. })));
	}

	#[test]
	fn classification_may_not_straddle_a_range_end() {
		let mut memory = MemoryModel::new();
		memory.load(BinaryAddr::new(0x100), &[0; 4], None, "test").unwrap();
		let result = memory.add_classification(BinaryAddr::new(0x102), Classification::byte_run(4));
		assert!(matches!(result, Err(DisassemblyError::RangeStraddle { .. })));
	}
}
