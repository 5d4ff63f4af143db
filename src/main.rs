//! The `mosdis` command-line tool.

use std::sync::Arc;

use clap::Parser;
use mosdis::cli::CliArguments;
use mosdis::formatter::{Acme, BeebAsm, Formatter, Xa};
use mosdis::instruction::mos6502::Mos6502;
use mosdis::{BinaryAddr, Disassembly, RuntimeAddr};

fn main() -> miette::Result<()> {
	human_panic::setup_panic!();
	let arguments = CliArguments::parse();

	let options = Arc::new(arguments.frontend_options());
	let mut dis = Disassembly::new(Box::new(Mos6502::new(arguments.cmos)), options);

	dis.load(
		BinaryAddr::new(arguments.load),
		&arguments.input.to_string_lossy(),
		arguments.md5.as_deref(),
	)?;
	if arguments.entries.is_empty() {
		dis.entry(RuntimeAddr::new(arguments.load), None)?;
	}
	for entry in &arguments.entries {
		dis.entry(RuntimeAddr::new(*entry), None)?;
	}

	let mut formatter: Box<dyn Formatter> = if arguments.acme {
		Box::new(Acme::new(arguments.upper))
	} else if arguments.xa {
		Box::new(Xa::new(arguments.upper))
	} else {
		let mut beebasm = BeebAsm::new(arguments.upper);
		beebasm.set_cmos(arguments.cmos);
		Box::new(beebasm)
	};
	if let Some(output) = &arguments.output {
		formatter.set_output_filename(output);
	}

	print!("{}", dis.go(formatter.as_mut())?);
	Ok(())
}
