//! Row Ranking
//!
//! JSON values have no natural total order, so rows are ranked by a
//! [`SortValue`] that orders `null < bool < number < string < array < object`
//! and breaks ties by arrival sequence. Numbers compare by exact value,
//! whatever mix of integer and float representations they use.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::domain::spec::Direction;

/// A JSON value with a total order.
#[derive(Debug, Clone)]
pub struct SortValue(pub Value);

impl SortValue {
    const fn type_rank(&self) -> u8 {
        match self.0 {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
}

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortValue {}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => cmp_numbers(a, b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
                self.0.to_string().cmp(&other.0.to_string())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

fn cmp_numbers(a: &Number, b: &Number) -> Ordering {
    match (as_integer(a), as_integer(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(x), None) => cmp_integer_float(x, as_float(b)),
        (None, Some(y)) => cmp_integer_float(y, as_float(a)).reverse(),
        (None, None) => {
            let (x, y) = (as_float(a), as_float(b));
            x.partial_cmp(&y).unwrap_or_else(|| x.total_cmp(&y))
        }
    }
}

fn as_integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

fn as_float(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

/// Exact comparison of an integer against a float, without rounding the
/// integer to the nearest representable float.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn cmp_integer_float(int: i128, float: f64) -> Ordering {
    // 2^127; every JSON integer lies strictly inside (-LIMIT, LIMIT).
    const LIMIT: f64 = i128::MAX as f64;

    if float.is_nan() || float >= LIMIT {
        return Ordering::Less;
    }
    if float < -LIMIT {
        return Ordering::Greater;
    }
    let whole = float.trunc() as i128;
    int.cmp(&whole)
        .then_with(|| 0.0_f64.partial_cmp(&float.fract()).unwrap_or(Ordering::Equal))
}

/// Position of a row in the ordered index.
///
/// All ranks in one store share the same direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankKey {
    value: SortValue,
    direction: Direction,
    seq: u64,
}

impl RankKey {
    /// Create a rank from the ordering value and arrival sequence.
    #[must_use]
    pub const fn new(value: Value, direction: Direction, seq: u64) -> Self {
        Self {
            value: SortValue(value),
            direction,
            seq,
        }
    }

    /// Arrival sequence.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_value = match self.direction {
            Direction::Asc => self.value.cmp(&other.value),
            Direction::Desc => other.value.cmp(&self.value),
        };
        by_value.then(self.seq.cmp(&other.seq))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numbers_compare_numerically() {
        assert!(SortValue(json!(9)) < SortValue(json!(10)));
        assert!(SortValue(json!(9.5)) < SortValue(json!(10)));
        assert!(SortValue(json!(-1)) < SortValue(json!(0.0)));
    }

    #[test]
    fn large_integers_and_floats_order_consistently() {
        let two_53 = SortValue(json!(9_007_199_254_740_992_i64));
        let two_53_plus_one = SortValue(json!(9_007_199_254_740_993_i64));
        let two_53_float = SortValue(json!(9_007_199_254_740_992.0));

        assert_eq!(two_53.cmp(&two_53_float), Ordering::Equal);
        assert_eq!(two_53.cmp(&two_53_plus_one), Ordering::Less);
        assert_eq!(two_53_float.cmp(&two_53_plus_one), Ordering::Less);
        assert_eq!(two_53_plus_one.cmp(&two_53_float), Ordering::Greater);

        assert!(SortValue(json!(i64::MAX)) < SortValue(json!(u64::MAX)));
        assert!(SortValue(json!(u64::MAX)) < SortValue(json!(1e20)));
        assert!(SortValue(json!(-1e20)) < SortValue(json!(i64::MIN)));
        assert!(SortValue(json!(-3)) < SortValue(json!(-2.5)));
        assert!(SortValue(json!(-2.5)) < SortValue(json!(-2)));
        assert_eq!(SortValue(json!(-0.0)), SortValue(json!(0)));
    }

    #[test]
    fn types_rank_in_fixed_order() {
        let ordered = [
            json!(null),
            json!(false),
            json!(0),
            json!("a"),
            json!([1]),
            json!({"a": 1}),
        ];
        for pair in ordered.windows(2) {
            assert!(SortValue(pair[0].clone()) < SortValue(pair[1].clone()));
        }
    }

    #[test]
    fn descending_reverses_value_but_not_sequence() {
        let high = RankKey::new(json!(30), Direction::Desc, 5);
        let low = RankKey::new(json!(10), Direction::Desc, 1);
        assert!(high < low);

        let first = RankKey::new(json!(10), Direction::Desc, 1);
        let second = RankKey::new(json!(10), Direction::Desc, 2);
        assert!(first < second);
    }
}
