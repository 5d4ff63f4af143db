//! Deferred assembler expressions.
//!
//! User annotations frequently want to replace a literal operand with an
//! expression over label names ("`<(handler-1)`" and friends). Label names
//! are not known until tracing has finished, so expressions are kept as a
//! small AST and rendered exactly once during emission, when a resolver for
//! label names is available.

use flexstr::{shared_fmt, SharedStr, ToSharedStr};

use crate::formatter::Formatter;
use crate::memory::RuntimeAddr;

/// A deferred expression. Rendering happens post-trace via [`Expr::render`].
#[derive(Debug, Clone)]
pub enum Expr {
	/// Literal expression text, used verbatim.
	Text(SharedStr),
	/// The name of the label at a runtime address, as resolved in the
	/// context of the referencing instruction or datum.
	Label(RuntimeAddr),
	/// Low byte of a 16-bit expression (`<(...)`).
	Lo(Box<Expr>),
	/// High byte of a 16-bit expression (`>(...)`).
	Hi(Box<Expr>),
	/// An expression plus a signed constant (`label-1`).
	Offset(Box<Expr>, i32),
	/// Difference of two expressions (`end - start`).
	Sub(Box<Expr>, Box<Expr>),
	/// A top-bit-set character terminator, rendered as `$80+'c'` in the
	/// selected assembler's hex syntax.
	HiBitChar(char),
}

impl Expr {
	/// A label reference.
	#[must_use]
	pub const fn label(addr: RuntimeAddr) -> Self {
		Self::Label(addr)
	}

	/// Low byte of this expression.
	#[must_use]
	pub fn lo(self) -> Self {
		Self::Lo(Box::new(self))
	}

	/// High byte of this expression.
	#[must_use]
	pub fn hi(self) -> Self {
		Self::Hi(Box::new(self))
	}

	/// This expression offset by a signed constant.
	#[must_use]
	pub fn offset(self, offset: i32) -> Self {
		if offset == 0 { self } else { Self::Offset(Box::new(self), offset) }
	}

	/// Renders the expression to assembler text. `resolve` supplies the
	/// concrete name for label references; it is only called after tracing
	/// has finished.
	pub fn render(
		&self,
		formatter: &dyn Formatter,
		resolve: &mut dyn FnMut(RuntimeAddr) -> SharedStr,
	) -> SharedStr {
		match self {
			Self::Text(text) => text.clone(),
			Self::Label(addr) => resolve(*addr),
			Self::Lo(inner) => shared_fmt!("<{}", bracket(&inner.render(formatter, resolve))),
			Self::Hi(inner) => shared_fmt!(">{}", bracket(&inner.render(formatter, resolve))),
			Self::Offset(inner, offset) => {
				let sign = if *offset < 0 { '-' } else { '+' };
				shared_fmt!("{}{}{}", bracket(&inner.render(formatter, resolve)), sign, offset.abs())
			},
			Self::Sub(left, right) => shared_fmt!(
				"{} - {}",
				bracket(&left.render(formatter, resolve)),
				bracket(&right.render(formatter, resolve))
			),
			Self::HiBitChar(c) => shared_fmt!("{}+'{c}'", formatter.hex2(0x80)),
		}
	}
}

impl From<&str> for Expr {
	fn from(text: &str) -> Self {
		Self::Text(text.to_shared_str())
	}
}

impl From<String> for Expr {
	fn from(text: String) -> Self {
		Self::Text(text.to_shared_str())
	}
}

impl From<SharedStr> for Expr {
	fn from(text: SharedStr) -> Self {
		Self::Text(text)
	}
}

impl From<RuntimeAddr> for Expr {
	fn from(addr: RuntimeAddr) -> Self {
		Self::Label(addr)
	}
}

/// Whether a string is usable as a bare label name: an identifier, or a
/// run of `+`/`-` (some assemblers' anonymous local labels).
#[must_use]
pub fn is_simple_name(name: &str) -> bool {
	if name.is_empty() {
		return false;
	}
	if name.chars().all(|c| c == '+') || name.chars().all(|c| c == '-') {
		return true;
	}
	let mut chars = name.chars();
	let first = chars.next().expect("name is non-empty");
	(first.is_ascii_alphabetic() || first == '_')
		&& chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parenthesises an expression unless it is a simple name or a number.
#[must_use]
pub fn bracket(expression: &str) -> SharedStr {
	if expression.chars().all(|c| c.is_ascii_digit()) || is_simple_name(expression) {
		expression.to_shared_str()
	} else {
		shared_fmt!("({expression})")
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::formatter::beebasm::BeebAsm;

	#[test]
	fn simple_names() {
		assert!(is_simple_name("osbyte"));
		assert!(is_simple_name("_loop2"));
		assert!(is_simple_name("+++"));
		assert!(!is_simple_name("2fast"));
		assert!(!is_simple_name("a-b"));
		assert!(!is_simple_name(""));
	}

	#[test]
	fn rendering_brackets_compound_operands() {
		let formatter = BeebAsm::new(false);
		let mut resolve = |_: RuntimeAddr| "handler".to_shared_str();
		let plain = Expr::label(RuntimeAddr::new(0x2000)).lo();
		assert_eq!(plain.render(&formatter, &mut resolve), "<handler");
		let offset = Expr::label(RuntimeAddr::new(0x2000)).offset(-1).hi();
		assert_eq!(offset.render(&formatter, &mut resolve), ">(handler-1)");
		assert_eq!(Expr::HiBitChar('A').render(&formatter, &mut resolve), "&80+'A'");
	}
}
