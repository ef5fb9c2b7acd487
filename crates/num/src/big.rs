use std::cmp::Ordering;

/// Sign-magnitude arbitrary-precision integer backing the slow path of
/// [`IntNum`](crate::IntNum).
///
/// Limbs are little-endian with no trailing zero limbs; an empty limb vector
/// is zero (and then `negative` is always false). Callers in this crate keep
/// the invariant that a `Big` is only ever stored when the value does not fit
/// a machine word, but the type itself is happy to hold small values during
/// intermediate computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Big {
    negative: bool,
    limbs: Vec<u64>,
}

impl Big {
    pub(crate) fn zero() -> Self {
        Self {
            negative: false,
            limbs: Vec::new(),
        }
    }

    pub(crate) fn from_i64(value: i64) -> Self {
        if value < 0 {
            Self {
                negative: true,
                limbs: vec![value.unsigned_abs()],
            }
        } else {
            Self::from_u64(value as u64)
        }
    }

    pub(crate) fn from_u64(value: u64) -> Self {
        if value == 0 {
            Self::zero()
        } else {
            Self {
                negative: false,
                limbs: vec![value],
            }
        }
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    pub(crate) fn is_negative(&self) -> bool {
        self.negative
    }

    /// Exact conversion back to a machine word, used for demotion.
    pub(crate) fn to_i64(&self) -> Option<i64> {
        match self.limbs.len() {
            0 => Some(0),
            1 => {
                let mag = self.limbs[0];
                if self.negative {
                    if mag <= 1 << 63 {
                        Some((mag as i128).wrapping_neg() as i64)
                    } else {
                        None
                    }
                } else if mag <= i64::MAX as u64 {
                    Some(mag as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Bit length of the magnitude (0 for zero).
    pub(crate) fn bit_len(&self) -> u64 {
        match self.limbs.last() {
            None => 0,
            Some(top) => {
                (self.limbs.len() as u64 - 1) * 64 + (64 - u64::from(top.leading_zeros()))
            }
        }
    }

    /// True when the magnitude is an exact power of two.
    pub(crate) fn is_pow2_magnitude(&self) -> bool {
        let Some((top, rest)) = self.limbs.split_last() else {
            return false;
        };
        top.is_power_of_two() && rest.iter().all(|limb| *limb == 0)
    }

    fn normalized(mut self) -> Self {
        while self.limbs.last() == Some(&0) {
            self.limbs.pop();
        }
        if self.limbs.is_empty() {
            self.negative = false;
        }
        self
    }

    pub(crate) fn neg(&self) -> Self {
        Self {
            negative: !self.negative && !self.is_zero(),
            limbs: self.limbs.clone(),
        }
    }

    pub(crate) fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => cmp_mag(&self.limbs, &other.limbs),
            (true, true) => cmp_mag(&other.limbs, &self.limbs),
        }
    }

    pub(crate) fn add(&self, other: &Self) -> Self {
        if self.negative == other.negative {
            Self {
                negative: self.negative,
                limbs: add_mag(&self.limbs, &other.limbs),
            }
            .normalized()
        } else {
            match cmp_mag(&self.limbs, &other.limbs) {
                Ordering::Equal => Self::zero(),
                Ordering::Greater => Self {
                    negative: self.negative,
                    limbs: sub_mag(&self.limbs, &other.limbs),
                }
                .normalized(),
                Ordering::Less => Self {
                    negative: other.negative,
                    limbs: sub_mag(&other.limbs, &self.limbs),
                }
                .normalized(),
            }
        }
    }

    pub(crate) fn sub(&self, other: &Self) -> Self {
        self.add(&other.neg())
    }

    pub(crate) fn mul(&self, other: &Self) -> Self {
        if self.is_zero() || other.is_zero() {
            return Self::zero();
        }
        let mut out = vec![0u64; self.limbs.len() + other.limbs.len()];
        for (i, &a) in self.limbs.iter().enumerate() {
            let mut carry = 0u128;
            for (j, &b) in other.limbs.iter().enumerate() {
                let cur = out[i + j] as u128 + a as u128 * b as u128 + carry;
                out[i + j] = cur as u64;
                carry = cur >> 64;
            }
            let mut k = i + other.limbs.len();
            while carry != 0 {
                let cur = out[k] as u128 + carry;
                out[k] = cur as u64;
                carry = cur >> 64;
                k += 1;
            }
        }
        Self {
            negative: self.negative != other.negative,
            limbs: out,
        }
        .normalized()
    }

    /// Truncating signed division; quotient rounds toward zero, remainder
    /// takes the dividend's sign. The caller rejects zero divisors.
    pub(crate) fn divrem(&self, other: &Self) -> (Self, Self) {
        debug_assert!(!other.is_zero());
        let (q_mag, r_mag) = divrem_mag(&self.limbs, &other.limbs);
        let quot = Self {
            negative: self.negative != other.negative,
            limbs: q_mag,
        }
        .normalized();
        let rem = Self {
            negative: self.negative,
            limbs: r_mag,
        }
        .normalized();
        (quot, rem)
    }

    pub(crate) fn shl(&self, count: u32) -> Self {
        if self.is_zero() || count == 0 {
            return self.clone();
        }
        let limb_shift = (count / 64) as usize;
        let bit_shift = count % 64;
        let mut limbs = vec![0u64; limb_shift];
        if bit_shift == 0 {
            limbs.extend_from_slice(&self.limbs);
        } else {
            let mut carry = 0u64;
            for &limb in &self.limbs {
                limbs.push((limb << bit_shift) | carry);
                carry = limb >> (64 - bit_shift);
            }
            if carry != 0 {
                limbs.push(carry);
            }
        }
        Self {
            negative: self.negative,
            limbs,
        }
        .normalized()
    }

    /// Arithmetic right shift: floor division by 2^count.
    pub(crate) fn shr(&self, count: u32) -> Self {
        if self.is_zero() || count == 0 {
            return self.clone();
        }
        let dropped_nonzero = self.any_low_bits(count);
        let limb_shift = (count / 64) as usize;
        let bit_shift = count % 64;
        let mut limbs: Vec<u64> = if limb_shift >= self.limbs.len() {
            Vec::new()
        } else {
            self.limbs[limb_shift..].to_vec()
        };
        if bit_shift != 0 {
            let mut carry = 0u64;
            for limb in limbs.iter_mut().rev() {
                let next_carry = *limb << (64 - bit_shift);
                *limb = (*limb >> bit_shift) | carry;
                carry = next_carry;
            }
        }
        let mut out = Self {
            negative: self.negative,
            limbs,
        }
        .normalized();
        // Floor semantics for negatives: shifting out any set bit rounds away
        // from zero.
        if self.negative && dropped_nonzero {
            out = out.sub(&Self::from_i64(1));
        }
        out
    }

    fn any_low_bits(&self, count: u32) -> bool {
        let limb_shift = (count / 64) as usize;
        let bit_shift = count % 64;
        for (i, &limb) in self.limbs.iter().enumerate() {
            if i < limb_shift {
                if limb != 0 {
                    return true;
                }
            } else if i == limb_shift && bit_shift != 0 {
                if limb << (64 - bit_shift) != 0 {
                    return true;
                }
            } else {
                break;
            }
        }
        false
    }

    pub(crate) fn bit_and(&self, other: &Self) -> Self {
        self.bitwise(other, |a, b| a & b)
    }

    pub(crate) fn bit_or(&self, other: &Self) -> Self {
        self.bitwise(other, |a, b| a | b)
    }

    pub(crate) fn bit_xor(&self, other: &Self) -> Self {
        self.bitwise(other, |a, b| a ^ b)
    }

    pub(crate) fn bit_not(&self) -> Self {
        // !x == -x - 1 in two's complement.
        self.neg().sub(&Self::from_i64(1))
    }

    fn bitwise(&self, other: &Self, op: impl Fn(u64, u64) -> u64) -> Self {
        let n = self.limbs.len().max(other.limbs.len()) + 1;
        let a = self.to_twos(n);
        let b = other.to_twos(n);
        let out: Vec<u64> = a.iter().zip(&b).map(|(&a, &b)| op(a, b)).collect();
        Self::from_twos(out)
    }

    /// Two's-complement form, sign-extended to exactly `n` limbs. The caller
    /// must pick `n` large enough to hold the magnitude plus a sign bit.
    pub(crate) fn to_twos(&self, n: usize) -> Vec<u64> {
        debug_assert!(n > self.limbs.len());
        let mut out = self.limbs.clone();
        out.resize(n, 0);
        if self.negative {
            let mut carry = true;
            for limb in &mut out {
                let (flipped, c) = (!*limb).overflowing_add(u64::from(carry));
                *limb = flipped;
                carry = carry && c;
            }
        }
        out
    }

    fn from_twos(mut limbs: Vec<u64>) -> Self {
        let negative = limbs.last().is_some_and(|top| top >> 63 != 0);
        if negative {
            let mut carry = true;
            for limb in &mut limbs {
                let (flipped, c) = (!*limb).overflowing_add(u64::from(carry));
                *limb = flipped;
                carry = carry && c;
            }
        }
        Self { negative, limbs }.normalized()
    }

    /// Low `buf.len()` bytes of the two's-complement form, little-endian.
    pub(crate) fn write_le(&self, buf: &mut [u8]) {
        let n = buf.len() / 8 + 1;
        let twos = self.to_twos(n.max(self.limbs.len() + 1));
        for (i, out) in buf.iter_mut().enumerate() {
            let limb = twos.get(i / 8).copied().unwrap_or(0);
            *out = (limb >> ((i % 8) * 8)) as u8;
        }
    }

    /// Multiply by a small constant and add a small constant, in place.
    /// Radix-digit accumulation for string parsing.
    pub(crate) fn mul_add_small(&mut self, mul: u64, add: u64) {
        debug_assert!(!self.negative);
        let mut carry = add as u128;
        for limb in &mut self.limbs {
            let cur = *limb as u128 * mul as u128 + carry;
            *limb = cur as u64;
            carry = cur >> 64;
        }
        while carry != 0 {
            self.limbs.push(carry as u64);
            carry >>= 64;
        }
    }
}

fn cmp_mag(a: &[u64], b: &[u64]) -> Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    for (x, y) in a.iter().rev().zip(b.iter().rev()) {
        match x.cmp(y) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

fn add_mag(a: &[u64], b: &[u64]) -> Vec<u64> {
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut out = Vec::with_capacity(long.len() + 1);
    let mut carry = 0u128;
    for i in 0..long.len() {
        let cur = long[i] as u128 + short.get(i).copied().unwrap_or(0) as u128 + carry;
        out.push(cur as u64);
        carry = cur >> 64;
    }
    if carry != 0 {
        out.push(carry as u64);
    }
    out
}

/// Magnitude subtraction; requires `a >= b`.
fn sub_mag(a: &[u64], b: &[u64]) -> Vec<u64> {
    debug_assert!(cmp_mag(a, b) != Ordering::Less);
    let mut out = Vec::with_capacity(a.len());
    let mut borrow = false;
    for i in 0..a.len() {
        let rhs = b.get(i).copied().unwrap_or(0);
        let (step, b1) = a[i].overflowing_sub(rhs);
        let (step, b2) = step.overflowing_sub(u64::from(borrow));
        out.push(step);
        borrow = b1 || b2;
    }
    debug_assert!(!borrow);
    out
}

/// Restoring shift-subtract division over magnitudes.
fn divrem_mag(num: &[u64], den: &[u64]) -> (Vec<u64>, Vec<u64>) {
    if cmp_mag(num, den) == Ordering::Less {
        return (Vec::new(), num.to_vec());
    }
    let bits = num.len() * 64;
    let mut quot = vec![0u64; num.len()];
    let mut rem: Vec<u64> = Vec::new();
    for bit in (0..bits).rev() {
        shl1(&mut rem);
        if num[bit / 64] >> (bit % 64) & 1 != 0 {
            if rem.is_empty() {
                rem.push(1);
            } else {
                rem[0] |= 1;
            }
        }
        if cmp_mag(&rem, den) != Ordering::Less {
            rem = sub_mag(&rem, den);
            while rem.last() == Some(&0) {
                rem.pop();
            }
            quot[bit / 64] |= 1 << (bit % 64);
        }
    }
    while quot.last() == Some(&0) {
        quot.pop();
    }
    (quot, rem)
}

fn shl1(limbs: &mut Vec<u64>) {
    let mut carry = 0u64;
    for limb in limbs.iter_mut() {
        let next = *limb >> 63;
        *limb = (*limb << 1) | carry;
        carry = next;
    }
    if carry != 0 {
        limbs.push(carry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(value: i64) -> Big {
        Big::from_i64(value)
    }

    #[test]
    fn round_trips_machine_words() {
        for value in [0, 1, -1, 42, i64::MAX, i64::MIN, -12345678901234] {
            assert_eq!(Big::from_i64(value).to_i64(), Some(value));
        }
    }

    #[test]
    fn add_and_sub_carry_across_limbs() {
        let a = Big::from_u64(u64::MAX);
        let sum = a.add(&big(1));
        assert_eq!(sum.bit_len(), 65);
        assert_eq!(sum.sub(&big(1)).to_i64(), None);
        assert_eq!(sum.sub(&a).to_i64(), Some(1));
    }

    #[test]
    fn mul_and_divrem_agree() {
        let a = Big::from_u64(u64::MAX).mul(&big(123_456_789));
        let (q, r) = a.divrem(&big(123_456_789));
        assert_eq!(q, Big::from_u64(u64::MAX));
        assert!(r.is_zero());
    }

    #[test]
    fn divrem_truncates_toward_zero() {
        let (q, r) = big(-7).divrem(&big(2));
        assert_eq!(q.to_i64(), Some(-3));
        assert_eq!(r.to_i64(), Some(-1));
    }

    #[test]
    fn arithmetic_shift_right_floors_negatives() {
        assert_eq!(big(-5).shr(1).to_i64(), Some(-3));
        assert_eq!(big(-4).shr(1).to_i64(), Some(-2));
        let wide = big(-1).shl(100);
        assert_eq!(wide.shr(100).to_i64(), Some(-1));
    }

    #[test]
    fn bitwise_matches_twos_complement() {
        assert_eq!(big(-1).bit_and(&big(0xFF)).to_i64(), Some(0xFF));
        assert_eq!(big(0b1010).bit_xor(&big(0b0110)).to_i64(), Some(0b1100));
        assert_eq!(big(5).bit_not().to_i64(), Some(-6));
        assert_eq!(big(-6).bit_not().to_i64(), Some(5));
    }

    #[test]
    fn write_le_sign_extends() {
        let mut buf = [0u8; 4];
        big(-2).write_le(&mut buf);
        assert_eq!(buf, [0xFE, 0xFF, 0xFF, 0xFF]);

        let mut buf = [0u8; 10];
        big(1).shl(70).write_le(&mut buf);
        assert_eq!(buf[8], 0x40);
        assert!(buf[..8].iter().all(|b| *b == 0));
    }
}
