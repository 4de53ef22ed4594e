use serde::{Deserialize, Serialize};

/// An arithmetic progression of indices: `offset + k * stride` for
/// `k in [0, count)`.
///
/// Slicing follows python semantics (negative indices count from the end,
/// out-of-range bounds clamp, negative stride reverses). Sequences compose:
/// a slice of a slice is a slice, and two sequences intersect to a third.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct IntegerSequence {
    count: i64,
    offset: i64,
    stride: i64,
}

fn div_floor(a: i64, b: i64) -> i64 {
    let quotient = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        quotient - 1
    } else {
        quotient
    }
}

fn div_ceil(a: i64, b: i64) -> i64 {
    let quotient = a / b;
    if (a % b != 0) && ((a < 0) == (b < 0)) {
        quotient + 1
    } else {
        quotient
    }
}

/// Coefficients `(g, u, v)` with `u*a + v*b = g = gcd(a, b)`.
fn extended_gcd(a: i64, b: i64) -> (i64, i64, i64) {
    let (mut old_r, mut r) = (a, b);
    let (mut old_u, mut u) = (1i64, 0i64);
    let (mut old_v, mut v) = (0i64, 1i64);
    while r != 0 {
        let q = old_r / r;
        (old_r, r) = (r, old_r - q * r);
        (old_u, u) = (u, old_u - q * u);
        (old_v, v) = (v, old_v - q * v);
    }
    (old_r, old_u, old_v)
}

/// Solves `x ≡ r1 (mod m1)`, `x ≡ r2 (mod m2)`. Both moduli positive.
/// Returns `(solution mod lcm, lcm)`, or `None` when incompatible.
fn crt(r1: i64, m1: i64, r2: i64, m2: i64) -> Option<(i64, i64)> {
    let (g, u, _) = extended_gcd(m1, m2);
    if (r2 - r1).rem_euclid(g) != 0 {
        return None;
    }
    let lcm = m1 / g * m2;
    // u*m1 ≡ g (mod m2), so r1 + m1*u*(r2-r1)/g ≡ r2 (mod m2)
    let multiplier = ((r2 - r1) / g) as i128 * u as i128 % (m2 / g) as i128;
    let solution = r1 as i128 + multiplier * m1 as i128;
    Some((solution.rem_euclid(lcm as i128) as i64, lcm))
}

impl IntegerSequence {
    /// The identity sequence `0, 1, .., count-1`.
    pub fn new(count: i64) -> Self {
        IntegerSequence {
            count: count.max(0),
            offset: 0,
            stride: 1,
        }
    }

    pub fn with_offset(count: i64, offset: i64) -> Self {
        IntegerSequence {
            count: count.max(0),
            offset,
            stride: 1,
        }
    }

    pub fn with_stride(count: i64, offset: i64, stride: i64) -> Self {
        assert!(stride != 0, "sequence stride must be nonzero");
        IntegerSequence {
            count: count.max(0),
            offset,
            stride,
        }
    }

    pub fn size(&self) -> i64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn stride(&self) -> i64 {
        self.stride
    }

    /// The `index`-th value of the sequence.
    pub fn nth(&self, index: i64) -> i64 {
        debug_assert!(index >= 0 && index < self.count);
        self.offset + index * self.stride
    }

    /// One past the last value, walking in stride direction.
    pub fn end_value(&self) -> i64 {
        self.offset + self.count * self.stride
    }

    pub fn smallest_value(&self) -> i64 {
        if self.count == 0 || self.stride > 0 {
            self.offset
        } else {
            self.offset + (self.count - 1) * self.stride
        }
    }

    pub fn largest_value(&self) -> i64 {
        if self.count == 0 || self.stride < 0 {
            self.offset
        } else {
            self.offset + (self.count - 1) * self.stride
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.index_of(value).is_some()
    }

    /// Position of `value` within the sequence, if present.
    pub fn index_of(&self, value: i64) -> Option<i64> {
        let delta = value - self.offset;
        if delta % self.stride != 0 {
            return None;
        }
        let index = delta / self.stride;
        (index >= 0 && index < self.count).then_some(index)
    }

    /// The same sequence shifted by `delta`.
    pub fn offset_by(&self, delta: i64) -> Self {
        IntegerSequence {
            count: self.count,
            offset: self.offset + delta,
            stride: self.stride,
        }
    }

    /// The ascending unit-stride sequence covering the same value range.
    pub fn containing_range(&self) -> Self {
        if self.count == 0 {
            return IntegerSequence::new(0);
        }
        let smallest = self.smallest_value();
        IntegerSequence::with_offset(self.largest_value() - smallest + 1, smallest)
    }

    /// Python-style slice by position: `self[low:high:stride]`.
    pub fn slice(
        &self,
        low: Option<i64>,
        high: Option<i64>,
        stride: Option<i64>,
    ) -> IntegerSequence {
        let step = stride.unwrap_or(1);
        assert!(step != 0, "slice stride must be nonzero");
        let n = self.count;

        if step > 0 {
            let mut start = low.unwrap_or(0);
            if start < 0 {
                start += n;
            }
            let mut stop = high.unwrap_or(n);
            if stop < 0 {
                stop += n;
            }
            while start < 0 {
                start += step;
            }
            let stop = stop.min(n);
            if start >= stop {
                return IntegerSequence::with_stride(0, self.offset, self.stride * step);
            }
            let count = div_ceil(stop - start, step);
            IntegerSequence {
                count,
                offset: self.offset + start * self.stride,
                stride: self.stride * step,
            }
        } else {
            let mut start = low.unwrap_or(n - 1);
            if start < 0 {
                start += n;
            }
            let mut stop = high.unwrap_or(-1 - n);
            if stop < 0 {
                stop += n;
            }
            while start >= n {
                start += step;
            }
            let stop = stop.max(-1);
            if start <= stop || start < 0 {
                return IntegerSequence::with_stride(0, self.offset, self.stride * step);
            }
            let count = div_floor(start - stop - 1, -step) + 1;
            IntegerSequence {
                count,
                offset: self.offset + start * self.stride,
                stride: self.stride * step,
            }
        }
    }

    /// Composes: `result[k] = self[positions[k]]`, dropping positions that
    /// fall outside `[0, size)`.
    pub fn slice_seq(&self, positions: &IntegerSequence) -> IntegerSequence {
        if self.count == 0 || positions.count == 0 {
            return IntegerSequence::with_stride(0, self.offset, self.stride * positions.stride);
        }

        let o = positions.offset;
        let t = positions.stride;
        let n = self.count;

        // valid k satisfy 0 <= o + k*t <= n-1
        let (k_low, k_high) = if t > 0 {
            (div_ceil(-o, t), div_floor(n - 1 - o, t))
        } else {
            (div_ceil(o - (n - 1), -t), div_floor(o, -t))
        };
        let k_first = k_low.max(0);
        let k_last = k_high.min(positions.count - 1);
        if k_first > k_last {
            return IntegerSequence::with_stride(0, self.offset, self.stride * t);
        }

        IntegerSequence {
            count: k_last - k_first + 1,
            offset: self.offset + (o + k_first * t) * self.stride,
            stride: self.stride * t,
        }
    }

    /// Values present in both sequences, ordered by `self`'s direction.
    pub fn intersect(&self, other: &IntegerSequence) -> IntegerSequence {
        let fallback_stride = self.stride;
        let empty = IntegerSequence::with_stride(0, self.offset, fallback_stride);
        if self.count == 0 || other.count == 0 {
            return empty;
        }

        let m1 = self.stride.abs();
        let m2 = other.stride.abs();
        let Some((residue, lcm)) = crt(
            self.offset.rem_euclid(m1),
            m1,
            other.offset.rem_euclid(m2),
            m2,
        ) else {
            return empty;
        };

        let low = self.smallest_value().max(other.smallest_value());
        let high = self.largest_value().min(other.largest_value());
        if low > high {
            return empty;
        }

        let first = residue + div_ceil(low - residue, lcm) * lcm;
        if first > high {
            return empty;
        }
        let count = div_floor(high - first, lcm) + 1;

        if self.stride > 0 {
            IntegerSequence {
                count,
                offset: first,
                stride: lcm,
            }
        } else {
            IntegerSequence {
                count,
                offset: first + (count - 1) * lcm,
                stride: -lcm,
            }
        }
    }

    /// All values, materialized in order.
    pub fn values(&self) -> Vec<i64> {
        (0..self.count).map(|k| self.nth(k)).collect()
    }
}
