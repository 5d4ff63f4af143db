//! End-to-end pipeline tests: register, trace, emit, check the text.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use crate::classification::Classification;
use crate::cli::FrontendOptions;
use crate::disassembly::Disassembly;
use crate::formatter::{Acme, BeebAsm};
use crate::instruction::i8080::I8080;
use crate::instruction::mos6502::Mos6502;
use crate::memory::{BinaryAddr, RuntimeAddr};

/// Options without hex dumps, histograms or listings, so tests can match
/// exact lines.
fn quiet_options() -> Arc<FrontendOptions> {
	Arc::new(FrontendOptions {
		hex_dump: false,
		bytes_as_ascii: false,
		show_char_literals: false,
		label_references: false,
		show_autogenerated_labels: false,
		quiet: true,
		..FrontendOptions::default()
	})
}

fn mos6502() -> Disassembly {
	Disassembly::new(Box::new(Mos6502::new(false)), quiet_options())
}

#[test]
fn traces_the_8080_memcpy_example() {
	// The classic memcpy snippet: everything here must classify as code.
	let code = [0x78, 0xb1, 0xc8, 0x1a, 0x77, 0x13, 0x23, 0x0b, 0x78, 0xb1, 0xc2, 0x03, 0x10, 0xc9];
	let mut dis = Disassembly::new(Box::new(I8080::new()), quiet_options());
	dis.load_bytes(BinaryAddr::new(0x1000), &code, None).unwrap();
	dis.entry(RuntimeAddr::new(0x1000), None).unwrap();
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();

	let mut addr = 0x1000u16;
	let mut instructions = 0;
	while addr < 0x1000 + code.len() as u16 {
		let classification = dis.memory.classification(BinaryAddr::new(addr)).copied().unwrap();
		assert!(classification.is_code(), "byte at ${addr:04x} should be code");
		instructions += 1;
		addr += classification.length() as u16;
	}
	assert_eq!(instructions, 12);

	// Exactly one reference, from the backward jnz, which also earns the
	// loop_ prefix.
	let label = dis.label_at(RuntimeAddr::new(0x1003)).unwrap();
	assert_eq!(label.read().references.len(), 1);
	assert!(output.contains(".loop_c1003"));
	assert!(output.contains("jnz loop_c1003"));
}

#[test]
fn string_with_expression_operand_records_an_assertion() {
	let mut dis = mos6502();
	dis.load_bytes(BinaryAddr::new(0x0e00), b"AB\r\x00", None).unwrap();
	dis.constant(0x1900u32, "page").unwrap();
	dis.string(RuntimeAddr::new(0x0e00), Some(4)).unwrap();
	dis.expr(RuntimeAddr::new(0x0e00), "page").unwrap();
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();

	assert!(output.contains("page = &1900"));
	assert!(output.contains("    equs page"));
	assert!(output.contains("    assert page == &1900"));
}

#[test]
fn relocated_block_reproduces_the_move() {
	let mut dis = mos6502();
	// lda #0 / rts, two spare bytes, a four-byte copy target that loops on
	// itself (dec &70 / bne back), one spare byte.
	let image = [0xa9, 0x00, 0x60, 0xff, 0xff, 0xc6, 0x70, 0xd0, 0xfc, 0xff];
	dis.load_bytes(BinaryAddr::new(0x2000), &image, None).unwrap();
	let relocated = dis.add_move(RuntimeAddr::new(0x0900), BinaryAddr::new(0x2005), 4).unwrap();
	{
		let _active = dis.moved(relocated).unwrap();
		dis.entry(RuntimeAddr::new(0x0900), None).unwrap();
	}
	dis.entry(RuntimeAddr::new(0x2000), None).unwrap();
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();

	assert!(output.contains("    org &2000"));
	assert!(output.contains("    org &0900"));
	assert!(output.contains(".loop_c0900"));
	assert!(output.contains("    bne loop_c0900"));
	assert!(output.contains("    copyblock loop_c0900, l0904, l2005"));
	assert!(output.contains("    clear loop_c0900, l0904"));
}

#[test]
fn subroutine_hook_annotates_the_call_site() {
	let mut dis = mos6502();
	// lda #&7e / jsr &fff4 / rts
	dis.load_bytes(BinaryAddr::new(0x3000), &[0xa9, 0x7e, 0x20, 0xf4, 0xff, 0x60], None).unwrap();
	dis.entry(RuntimeAddr::new(0x3000), None).unwrap();
	dis.hook_subroutine(RuntimeAddr::new(0xfff4), "osbyte", |_, _, caller| {
		Some(caller.saturating_add(3))
	})
	.unwrap();
	dis.add_sequence_hook(|dis, target, a_addr, _, _| {
		if target == RuntimeAddr::new(0xfff4) {
			if let Some(a_addr) = a_addr {
				if dis.memory.u8(a_addr) == Some(0x7e) {
					dis.constant(0x7eu32, "osbyte_acknowledge_escape").unwrap();
					dis.expr_binary(a_addr, "osbyte_acknowledge_escape");
				}
			}
		}
	});
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();

	assert!(output.contains("    lda #osbyte_acknowledge_escape"));
	assert!(output.contains("    jsr osbyte"));
	assert!(output.contains("osbyte_acknowledge_escape = &7e"));
	assert!(output.contains("    assert osbyte_acknowledge_escape == &7e"));
	// The call target is outside the loaded image, so its label is defined
	// explicitly.
	assert!(output.contains("osbyte"));
	assert!(output.contains("= &fff4"));
}

#[test]
fn overlapping_instruction_is_advisory_only() {
	let mut dis = mos6502();
	dis.load_bytes(BinaryAddr::new(0x2000), &[0x00, 0xa9, 0x07, 0x60], None).unwrap();
	dis.byte(RuntimeAddr::new(0x2000), 3).unwrap();
	dis.entry(RuntimeAddr::new(0x2001), None).unwrap();
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();

	// The data classification stands; the instruction shows as a comment.
	assert!(matches!(
		dis.memory.classification(BinaryAddr::new(0x2000)),
		Some(Classification::ByteRun { length: 3, .. })
	));
	assert!(output.contains("overlapping: lda #&07"));
	// Tracing continued past the overlap to the rts.
	assert!(dis.memory.classification(BinaryAddr::new(0x2003)).unwrap().is_code());
}

#[test]
fn unreferenced_optional_label_stays_out_of_the_output() {
	let mut dis = mos6502();
	dis.load_bytes(BinaryAddr::new(0x4000), &[0xa9, 0x00, 0x60], None).unwrap();
	dis.entry(RuntimeAddr::new(0x4000), None).unwrap();
	dis.optional_label(RuntimeAddr::new(0xffe0), "osrdch").unwrap();
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();
	assert!(!output.contains("osrdch"));
}

#[test]
fn referenced_optional_label_materialises() {
	let mut dis = mos6502();
	// jsr &ffe0 / rts
	dis.load_bytes(BinaryAddr::new(0x4000), &[0x20, 0xe0, 0xff, 0x60], None).unwrap();
	dis.entry(RuntimeAddr::new(0x4000), None).unwrap();
	dis.optional_label(RuntimeAddr::new(0xffe0), "osrdch").unwrap();
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();
	assert!(output.contains("    jsr osrdch"));
	assert!(output.contains("= &ffe0"));
}

#[test]
fn go_twice_produces_identical_output() {
	let build = |dis: &mut Disassembly| {
		dis.load_bytes(
			BinaryAddr::new(0x5000),
			&[0xa2, 0x03, 0xca, 0xd0, 0xfd, 0x60, b'H', b'I', 0x00],
			None,
		)
		.unwrap();
		dis.entry(RuntimeAddr::new(0x5000), None).unwrap();
		dis.autostring(2);
	};
	let mut dis = mos6502();
	build(&mut dis);
	let first = dis.go(&mut BeebAsm::new(false)).unwrap();
	let second = dis.go(&mut BeebAsm::new(false)).unwrap();
	assert_eq!(first, second);
	assert!(first.contains(".loop_c5002"));
	assert!(first.contains("equs \"HI\""));
}

#[test]
fn every_loaded_byte_is_classified_exactly_once() {
	let mut dis = mos6502();
	dis.load_bytes(BinaryAddr::new(0x7000), &[0xa9, 0x41, 0x60, 0x01, 0x02, 0x03], None).unwrap();
	dis.load_bytes(BinaryAddr::new(0x7100), &[0xff, 0xfe], None).unwrap();
	dis.entry(RuntimeAddr::new(0x7000), None).unwrap();
	let mut formatter = BeebAsm::new(false);
	dis.go(&mut formatter).unwrap();

	for range in dis.memory.load_ranges().to_vec() {
		let mut covered = 0;
		let mut addr = range.start;
		while addr < range.end {
			let classification =
				dis.memory.classification(BinaryAddr::new(addr as u16)).copied().unwrap();
			covered += classification.length();
			addr += classification.length() as u32;
		}
		assert_eq!(covered as u32, range.end - range.start);
	}
}

#[test]
fn absolute_instruction_with_zero_page_operand_degrades_per_backend() {
	let build = || {
		let mut dis = mos6502();
		// lda &0012 (absolute addressing of a zero-page location) / rts
		dis.load_bytes(BinaryAddr::new(0x6000), &[0xad, 0x12, 0x00, 0x60], None).unwrap();
		dis.entry(RuntimeAddr::new(0x6000), None).unwrap();
		dis
	};

	// beebasm has no force-absolute syntax: data bytes plus a comment.
	let output = build().go(&mut BeebAsm::new(false)).unwrap();
	assert!(output.contains("    equb &ad, <(l0012), >(l0012) ; lda+2 l0012"));

	// acme spells it with the +2 suffix.
	let output = build().go(&mut Acme::new(false)).unwrap();
	assert!(output.contains("    lda+2 l0012"));
}

#[test]
fn local_labels_resolve_only_from_their_range() {
	let mut dis = mos6502();
	// Two identical lda &5010 / rts pairs; only the first sits in the local
	// label's range.
	dis.load_bytes(
		BinaryAddr::new(0x5000),
		&[0xad, 0x10, 0x50, 0x60, 0xad, 0x10, 0x50, 0x60],
		None,
	)
	.unwrap();
	dis.entry(RuntimeAddr::new(0x5000), None).unwrap();
	dis.entry(RuntimeAddr::new(0x5004), None).unwrap();
	dis.local_label(
		RuntimeAddr::new(0x5010),
		"nearby",
		BinaryAddr::new(0x5000),
		BinaryAddr::new(0x5004),
		None,
	);
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();
	assert!(output.contains("    lda nearby"));
	assert!(output.contains("    lda l5010"));
}

#[test]
fn rts_address_tables_become_entry_points() {
	let mut dis = mos6502();
	// A dispatch word holding handler-1, then the handler itself.
	dis.load_bytes(BinaryAddr::new(0x6000), &[0x01, 0x60, 0x60], None).unwrap();
	dis.rts_address(RuntimeAddr::new(0x6000)).unwrap();
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();

	assert!(dis.memory.classification(BinaryAddr::new(0x6002)).unwrap().is_code());
	assert!(output.contains("    equw c6002-1"));
	assert!(output.contains("    assert c6002-1 == &6001"));
}

#[test]
fn length_prefixed_strings_carry_a_span_expression() {
	let mut dis = mos6502();
	dis.load_bytes(BinaryAddr::new(0x4000), &[0x03, b'A', b'B', b'C', 0x60], None).unwrap();
	dis.stringn(RuntimeAddr::new(0x4000)).unwrap();
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();

	assert!(output.contains("    equb l4004 - l4001"));
	assert!(output.contains("    equs \"ABC\""));
	assert!(output.contains("    assert l4004 - l4001 == &03"));
}

#[test]
fn autostring_respects_labels_and_code() {
	let mut dis = mos6502();
	let mut image = vec![0xa9, 0x41, 0x60];
	image.extend_from_slice(b"HELLO WORLD");
	image.push(0x00);
	dis.load_bytes(BinaryAddr::new(0x3000), &image, None).unwrap();
	dis.entry(RuntimeAddr::new(0x3000), None).unwrap();
	// A label in the middle of the text splits the detected runs.
	dis.label(RuntimeAddr::new(0x3009), "world");
	dis.autostring(3);
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();

	assert!(output.contains("equs \"HELLO \""));
	assert!(output.contains(".world"));
	assert!(output.contains("equs \"WORLD\""));
	// The lda #&41 was traced first and never becomes string data.
	assert!(dis.memory.classification(BinaryAddr::new(0x3000)).unwrap().is_code());
}

#[test]
fn comments_wrap_and_sort_stably() {
	let mut dis = mos6502();
	dis.load_bytes(BinaryAddr::new(0x2000), &[0x60], None).unwrap();
	dis.entry(RuntimeAddr::new(0x2000), None).unwrap();
	dis.comment(RuntimeAddr::new(0x2000), "first comment").unwrap();
	dis.comment(RuntimeAddr::new(0x2000), "second comment").unwrap();
	let mut formatter = BeebAsm::new(false);
	let output = dis.go(&mut formatter).unwrap();

	let first = output.find("; first comment").unwrap();
	let second = output.find("; second comment").unwrap();
	assert!(first < second);
	let rts = output.find("    rts").unwrap();
	assert!(second < rts);
}
