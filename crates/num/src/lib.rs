//! Integer values for the assembler core.
//!
//! [`IntNum`] keeps the overwhelmingly common case, values fitting a machine
//! word, on an inline fast path, and transparently promotes to an owned
//! arbitrary-precision form when an operation overflows. Results are always
//! demoted back to the inline form when they fit, so the two representations
//! are never distinguishable by value.

mod big;

use std::fmt;

use thiserror::Error;

use crate::big::Big;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NumError {
    #[error("invalid digit '{digit}' in {radix} literal")]
    InvalidDigit { digit: char, radix: Radix },
    #[error("empty {radix} literal")]
    EmptyLiteral { radix: Radix },
    #[error("division by zero")]
    DivideByZero,
    #[error("shift count must be a non-negative integer below {max}", max = MAX_SHIFT)]
    InvalidShift,
    #[error("operator {op:?} requires a right-hand operand")]
    MissingOperand { op: Op },
}

/// Largest accepted shift count, in bits. Large enough for any realistic
/// constant, small enough that a bogus source expression cannot exhaust
/// memory growing a bit vector.
const MAX_SHIFT: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Radix {
    Dec,
    Bin,
    Oct,
    Hex,
}

impl Radix {
    fn base(self) -> u32 {
        match self {
            Self::Dec => 10,
            Self::Bin => 2,
            Self::Oct => 8,
            Self::Hex => 16,
        }
    }
}

impl fmt::Display for Radix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dec => "decimal",
            Self::Bin => "binary",
            Self::Oct => "octal",
            Self::Hex => "hexadecimal",
        };
        f.write_str(name)
    }
}

/// Operators accepted by [`IntNum::calc`]. `Neg`, `BitNot` and `LogNot` are
/// unary; everything else takes a right-hand operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    SignDiv,
    Mod,
    SignMod,
    Neg,
    BitNot,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    LogNot,
    LogAnd,
    LogOr,
    LogXor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Op {
    pub fn is_unary(self) -> bool {
        matches!(self, Self::Neg | Self::BitNot | Self::LogNot)
    }
}

/// How a destination field interprets its bits when range-checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Unsigned,
    Signed,
    Either,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Repr {
    Word(i64),
    Big(Box<Big>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntNum(Repr);

impl IntNum {
    pub fn zero() -> Self {
        Self(Repr::Word(0))
    }

    /// Parse a radix-tagged digit string. `_` separators are skipped; the
    /// sign, if any, is the front end's business (a `Neg` node).
    pub fn from_str_radix(digits: &str, radix: Radix) -> Result<Self, NumError> {
        let base = radix.base();
        let mut word: u64 = 0;
        let mut big: Option<Big> = None;
        let mut seen = false;
        for ch in digits.chars() {
            if ch == '_' {
                continue;
            }
            let digit = ch
                .to_digit(base)
                .ok_or(NumError::InvalidDigit { digit: ch, radix })?;
            seen = true;
            match &mut big {
                Some(big) => big.mul_add_small(base as u64, digit as u64),
                None => {
                    let next = word
                        .checked_mul(base as u64)
                        .and_then(|scaled| scaled.checked_add(digit as u64));
                    match next {
                        Some(next) => word = next,
                        None => {
                            let mut promoted = Big::from_u64(word);
                            promoted.mul_add_small(base as u64, digit as u64);
                            big = Some(promoted);
                        }
                    }
                }
            }
        }
        if !seen {
            return Err(NumError::EmptyLiteral { radix });
        }
        match big {
            Some(big) => Ok(Self::demote(big)),
            None => Ok(Self::from(word)),
        }
    }

    fn demote(big: Big) -> Self {
        match big.to_i64() {
            Some(word) => Self(Repr::Word(word)),
            None => Self(Repr::Big(Box::new(big))),
        }
    }

    fn to_big(&self) -> Big {
        match &self.0 {
            Repr::Word(word) => Big::from_i64(*word),
            Repr::Big(big) => (**big).clone(),
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self.0, Repr::Word(0))
    }

    pub fn is_pos1(&self) -> bool {
        matches!(self.0, Repr::Word(1))
    }

    pub fn is_neg1(&self) -> bool {
        matches!(self.0, Repr::Word(-1))
    }

    pub fn sign(&self) -> i8 {
        match &self.0 {
            Repr::Word(word) => word.signum() as i8,
            Repr::Big(big) => {
                if big.is_negative() {
                    -1
                } else {
                    1
                }
            }
        }
    }

    /// Low 64 bits of the two's-complement form.
    pub fn as_u64(&self) -> u64 {
        match &self.0 {
            Repr::Word(word) => *word as u64,
            Repr::Big(_) => {
                let mut buf = [0u8; 8];
                self.write_le(&mut buf);
                u64::from_le_bytes(buf)
            }
        }
    }

    /// Low 64 bits of the two's-complement form, reinterpreted signed.
    pub fn as_i64(&self) -> i64 {
        self.as_u64() as i64
    }

    /// Whether the value fits a `bits`-wide destination without truncation.
    /// Callers check this before [`write_le`](Self::write_le) when they want
    /// to warn rather than silently truncate.
    pub fn fits(&self, bits: u32, range: RangeKind) -> bool {
        if bits == 0 {
            return self.is_zero();
        }
        match range {
            RangeKind::Either => {
                self.fits(bits, RangeKind::Unsigned) || self.fits(bits, RangeKind::Signed)
            }
            RangeKind::Unsigned => match &self.0 {
                Repr::Word(word) => {
                    *word >= 0 && (bits >= 64 || (*word as u64) < 1u64 << bits)
                }
                Repr::Big(big) => !big.is_negative() && big.bit_len() <= u64::from(bits),
            },
            RangeKind::Signed => match &self.0 {
                Repr::Word(word) => {
                    if bits >= 64 {
                        return true;
                    }
                    let value = i128::from(*word);
                    let bound = 1i128 << (bits - 1);
                    value >= -bound && value < bound
                }
                Repr::Big(big) => {
                    let bits = u64::from(bits);
                    if big.is_negative() {
                        big.bit_len() < bits
                            || (big.bit_len() == bits && big.is_pow2_magnitude())
                    } else {
                        big.bit_len() < bits
                    }
                }
            },
        }
    }

    /// Write the low `buf.len()` bytes of the two's-complement form,
    /// little-endian, truncating silently. Pair with [`fits`](Self::fits).
    pub fn write_le(&self, buf: &mut [u8]) {
        match &self.0 {
            Repr::Word(word) => {
                let ext = if *word < 0 { 0xFF } else { 0x00 };
                for (i, out) in buf.iter_mut().enumerate() {
                    *out = if i < 8 { (*word >> (8 * i)) as u8 } else { ext };
                }
            }
            Repr::Big(big) => big.write_le(buf),
        }
    }

    /// Big-endian variant of [`write_le`](Self::write_le).
    pub fn write_be(&self, buf: &mut [u8]) {
        self.write_le(buf);
        buf.reverse();
    }

    /// In-place arithmetic: `self = self <op> rhs`. Promotes to the
    /// arbitrary-precision form when either side already is, or when the
    /// word-path computation overflows; demotes afterwards if the result
    /// fits a machine word again.
    pub fn calc(&mut self, op: Op, rhs: Option<&IntNum>) -> Result<(), NumError> {
        let rhs = if op.is_unary() {
            None
        } else {
            Some(rhs.ok_or(NumError::MissingOperand { op })?)
        };

        if let Some(result) = self.word_calc(op, rhs)? {
            self.0 = Repr::Word(result);
            return Ok(());
        }

        let lhs = self.to_big();
        let result = match op {
            Op::Add => lhs.add(&rhs.unwrap().to_big()),
            Op::Sub => lhs.sub(&rhs.unwrap().to_big()),
            Op::Mul => lhs.mul(&rhs.unwrap().to_big()),
            Op::Div | Op::SignDiv => {
                let rhs = rhs.unwrap().to_big();
                if rhs.is_zero() {
                    return Err(NumError::DivideByZero);
                }
                lhs.divrem(&rhs).0
            }
            Op::Mod | Op::SignMod => {
                let rhs = rhs.unwrap().to_big();
                if rhs.is_zero() {
                    return Err(NumError::DivideByZero);
                }
                lhs.divrem(&rhs).1
            }
            Op::Neg => lhs.neg(),
            Op::BitNot => lhs.bit_not(),
            Op::BitAnd => lhs.bit_and(&rhs.unwrap().to_big()),
            Op::BitOr => lhs.bit_or(&rhs.unwrap().to_big()),
            Op::BitXor => lhs.bit_xor(&rhs.unwrap().to_big()),
            Op::Shl => lhs.shl(shift_count(rhs.unwrap())?),
            Op::Shr => lhs.shr(shift_count(rhs.unwrap())?),
            Op::LogNot => Big::from_i64(i64::from(lhs.is_zero())),
            Op::LogAnd => {
                Big::from_i64(i64::from(!lhs.is_zero() && !rhs.unwrap().is_zero()))
            }
            Op::LogOr => {
                Big::from_i64(i64::from(!lhs.is_zero() || !rhs.unwrap().is_zero()))
            }
            Op::LogXor => {
                Big::from_i64(i64::from(!lhs.is_zero() != !rhs.unwrap().is_zero()))
            }
            Op::Eq | Op::Ne | Op::Lt | Op::Gt | Op::Le | Op::Ge => {
                let ordering = lhs.cmp(&rhs.unwrap().to_big());
                Big::from_i64(i64::from(compare(op, ordering)))
            }
        };
        *self = Self::demote(result);
        Ok(())
    }

    /// Fast path over two machine words. `Ok(None)` means "take the
    /// arbitrary-precision path instead".
    fn word_calc(&self, op: Op, rhs: Option<&IntNum>) -> Result<Option<i64>, NumError> {
        let Repr::Word(a) = self.0 else {
            return Ok(None);
        };
        let b = match rhs {
            None => None,
            Some(IntNum(Repr::Word(word))) => Some(*word),
            Some(IntNum(Repr::Big(_))) => return Ok(None),
        };

        let result = match op {
            Op::Add => a.checked_add(b.unwrap()),
            Op::Sub => a.checked_sub(b.unwrap()),
            Op::Mul => a.checked_mul(b.unwrap()),
            Op::Div | Op::SignDiv => {
                if b.unwrap() == 0 {
                    return Err(NumError::DivideByZero);
                }
                a.checked_div(b.unwrap())
            }
            Op::Mod | Op::SignMod => {
                if b.unwrap() == 0 {
                    return Err(NumError::DivideByZero);
                }
                a.checked_rem(b.unwrap())
            }
            Op::Neg => a.checked_neg(),
            Op::BitNot => Some(!a),
            Op::BitAnd => Some(a & b.unwrap()),
            Op::BitOr => Some(a | b.unwrap()),
            Op::BitXor => Some(a ^ b.unwrap()),
            Op::Shl => {
                let count = shift_count(rhs.unwrap())?;
                if count < 64 {
                    let wide = i128::from(a) << count;
                    i64::try_from(wide).ok()
                } else {
                    None
                }
            }
            Op::Shr => {
                let count = shift_count(rhs.unwrap())?;
                if count < 64 {
                    Some(a >> count)
                } else {
                    Some(if a < 0 { -1 } else { 0 })
                }
            }
            Op::LogNot => Some(i64::from(a == 0)),
            Op::LogAnd => Some(i64::from(a != 0 && b.unwrap() != 0)),
            Op::LogOr => Some(i64::from(a != 0 || b.unwrap() != 0)),
            Op::LogXor => Some(i64::from((a != 0) != (b.unwrap() != 0))),
            Op::Eq | Op::Ne | Op::Lt | Op::Gt | Op::Le | Op::Ge => {
                Some(i64::from(compare(op, a.cmp(&b.unwrap()))))
            }
        };
        Ok(result)
    }
}

fn compare(op: Op, ordering: std::cmp::Ordering) -> bool {
    match op {
        Op::Eq => ordering.is_eq(),
        Op::Ne => ordering.is_ne(),
        Op::Lt => ordering.is_lt(),
        Op::Gt => ordering.is_gt(),
        Op::Le => ordering.is_le(),
        Op::Ge => ordering.is_ge(),
        _ => unreachable!("not a comparison operator"),
    }
}

fn shift_count(rhs: &IntNum) -> Result<u32, NumError> {
    match rhs.0 {
        Repr::Word(word) if (0..i64::from(MAX_SHIFT)).contains(&word) => Ok(word as u32),
        _ => Err(NumError::InvalidShift),
    }
}

impl From<i64> for IntNum {
    fn from(value: i64) -> Self {
        Self(Repr::Word(value))
    }
}

impl From<u64> for IntNum {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(word) => Self(Repr::Word(word)),
            Err(_) => Self(Repr::Big(Box::new(Big::from_u64(value)))),
        }
    }
}

impl From<i32> for IntNum {
    fn from(value: i32) -> Self {
        Self(Repr::Word(i64::from(value)))
    }
}

impl From<u32> for IntNum {
    fn from(value: u32) -> Self {
        Self(Repr::Word(i64::from(value)))
    }
}

impl fmt::Display for IntNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Word(word) => write!(f, "{word}"),
            Repr::Big(big) => {
                // Chunked decimal conversion; 10^18 fits a limb.
                const CHUNK: u64 = 1_000_000_000_000_000_000;
                let mut chunks = Vec::new();
                let mut rest = (**big).clone();
                let negative = rest.is_negative();
                if negative {
                    rest = rest.neg();
                }
                let divisor = Big::from_u64(CHUNK);
                while !rest.is_zero() {
                    let (quot, rem) = rest.divrem(&divisor);
                    chunks.push(rem.to_i64().unwrap_or(0) as u64);
                    rest = quot;
                }
                if negative {
                    f.write_str("-")?;
                }
                let mut chunks = chunks.into_iter().rev();
                let head = chunks.next().unwrap_or(0);
                write!(f, "{head}")?;
                for chunk in chunks {
                    write!(f, "{chunk:018}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(value: i64) -> IntNum {
        IntNum::from(value)
    }

    fn calc(mut lhs: IntNum, op: Op, rhs: IntNum) -> IntNum {
        lhs.calc(op, Some(&rhs)).expect("calc");
        lhs
    }

    #[test]
    fn parses_all_radices() {
        assert_eq!(
            IntNum::from_str_radix("1234", Radix::Dec).expect("dec"),
            num(1234)
        );
        assert_eq!(
            IntNum::from_str_radix("1010_1010", Radix::Bin).expect("bin"),
            num(0xAA)
        );
        assert_eq!(
            IntNum::from_str_radix("777", Radix::Oct).expect("oct"),
            num(0o777)
        );
        assert_eq!(
            IntNum::from_str_radix("DeadBeef", Radix::Hex).expect("hex"),
            num(0xDEAD_BEEF)
        );
    }

    #[test]
    fn rejects_bad_literals() {
        assert_eq!(
            IntNum::from_str_radix("12f", Radix::Dec),
            Err(NumError::InvalidDigit {
                digit: 'f',
                radix: Radix::Dec
            })
        );
        assert_eq!(
            IntNum::from_str_radix("_", Radix::Hex),
            Err(NumError::EmptyLiteral { radix: Radix::Hex })
        );
    }

    #[test]
    fn radix_round_trips_across_word_boundary() {
        // Just below 64 bits stays inline, just above promotes; byte
        // extraction agrees with the literal either way.
        let below = IntNum::from_str_radix("7FFFFFFFFFFFFFFF", Radix::Hex).expect("parse");
        assert_eq!(below, num(i64::MAX));

        let above = IntNum::from_str_radix("10000000000000000", Radix::Hex).expect("parse");
        let mut buf = [0u8; 9];
        above.write_le(&mut buf);
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(above.fits(65, RangeKind::Unsigned));
        assert!(!above.fits(64, RangeKind::Unsigned));

        let all_ones = IntNum::from_str_radix("FFFFFFFFFFFFFFFF", Radix::Hex).expect("parse");
        assert_eq!(all_ones.as_u64(), u64::MAX);
        assert!(all_ones.fits(64, RangeKind::Unsigned));
        assert!(!all_ones.fits(64, RangeKind::Signed));
        assert!(all_ones.fits(64, RangeKind::Either));
    }

    #[test]
    fn promotes_on_overflow_and_demotes_when_small_again() {
        let big = calc(num(i64::MAX), Op::Add, num(1));
        assert!(!big.fits(64, RangeKind::Signed));
        assert_eq!(big.to_string(), "9223372036854775808");

        let back = calc(big, Op::Sub, num(1));
        assert_eq!(back, num(i64::MAX));
    }

    #[test]
    fn shifts_grow_and_shrink() {
        let wide = calc(num(1), Op::Shl, num(100));
        assert_eq!(wide.sign(), 1);
        assert!(wide.fits(101, RangeKind::Unsigned));
        assert!(!wide.fits(100, RangeKind::Unsigned));
        assert_eq!(calc(wide, Op::Shr, num(100)), num(1));

        assert_eq!(calc(num(-1), Op::Shr, num(200)), num(-1));
        let mut one = num(1);
        assert_eq!(one.calc(Op::Shl, Some(&num(-1))), Err(NumError::InvalidShift));
    }

    #[test]
    fn division_errors_and_signs() {
        let mut one = num(1);
        assert_eq!(one.calc(Op::Div, Some(&num(0))), Err(NumError::DivideByZero));
        assert_eq!(calc(num(-7), Op::SignDiv, num(2)), num(-3));
        assert_eq!(calc(num(-7), Op::SignMod, num(2)), num(-1));
    }

    #[test]
    fn logical_and_comparison_results_are_bool() {
        assert_eq!(calc(num(5), Op::LogAnd, num(-3)), num(1));
        assert_eq!(calc(num(5), Op::LogXor, num(3)), num(0));
        assert_eq!(calc(num(2), Op::Lt, num(3)), num(1));
        assert_eq!(calc(num(3), Op::Ge, num(4)), num(0));
    }

    #[test]
    fn signed_fit_edges() {
        assert!(num(127).fits(8, RangeKind::Signed));
        assert!(!num(128).fits(8, RangeKind::Signed));
        assert!(num(-128).fits(8, RangeKind::Signed));
        assert!(!num(-129).fits(8, RangeKind::Signed));
        assert!(num(255).fits(8, RangeKind::Unsigned));
        assert!(!num(-1).fits(8, RangeKind::Unsigned));

        let mut neg_pow = calc(num(1), Op::Shl, num(128));
        neg_pow.calc(Op::Neg, None).expect("neg");
        assert!(neg_pow.fits(129, RangeKind::Signed));
        assert!(!neg_pow.fits(128, RangeKind::Signed));
    }

    #[test]
    fn big_endian_extraction() {
        let mut buf = [0u8; 3];
        num(0x0102_03).write_be(&mut buf);
        assert_eq!(buf, [0x01, 0x02, 0x03]);
    }

    #[test]
    fn unary_ops() {
        let mut value = num(5);
        value.calc(Op::Neg, None).expect("neg");
        assert_eq!(value, num(-5));
        value.calc(Op::BitNot, None).expect("not");
        assert_eq!(value, num(4));
        value.calc(Op::LogNot, None).expect("lognot");
        assert_eq!(value, num(0));
    }
}
