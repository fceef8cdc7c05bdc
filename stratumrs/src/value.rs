//! Row shape and scalar helpers shared by every execution path.
//!
//! Rows are plain JSON maps from alias to scalar. Joins and grouping need
//! hashable, totally ordered keys, which `ScalarKey` provides.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

/// A result row: alias -> scalar (number, string, bool or null).
pub type Row = Map<String, Value>;

/// Hashable, ordered projection of a scalar value.
///
/// Integers keep their exact value; floats stay floats. The two kinds
/// compare by numeric value, so `1` and `1.0` are the same key while
/// integers past 2^53 stay distinct. Ordering is null < bool < number <
/// string, which matches the null-first ordering of sorted output.
#[derive(Debug, Clone)]
pub enum ScalarKey {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    Text(String),
    Other(String),
}

/// 2^127 as f64; floats at or beyond it cannot be an `i128`.
const I128_BOUND: f64 = 170_141_183_460_469_231_731_687_303_715_884_105_728.0;

impl ScalarKey {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => ScalarKey::Null,
            Value::Bool(b) => ScalarKey::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ScalarKey::Int(i128::from(i))
                } else if let Some(u) = n.as_u64() {
                    ScalarKey::Int(i128::from(u))
                } else {
                    ScalarKey::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => ScalarKey::Text(s.clone()),
            other => ScalarKey::Other(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarKey::Null)
    }

    fn rank(&self) -> u8 {
        match self {
            ScalarKey::Null => 0,
            ScalarKey::Bool(_) => 1,
            ScalarKey::Int(_) | ScalarKey::Float(_) => 2,
            ScalarKey::Text(_) => 3,
            ScalarKey::Other(_) => 4,
        }
    }

    /// The exact integer a float holds, if it holds one.
    fn integral(f: f64) -> Option<i128> {
        let in_range = (-I128_BOUND..I128_BOUND).contains(&f);
        (in_range && f.fract() == 0.0).then(|| f as i128)
    }

    fn normalized_bits(f: f64) -> u64 {
        // All NaNs collapse to one key.
        if f.is_nan() {
            f64::NAN.to_bits()
        } else {
            f.to_bits()
        }
    }
}

/// NaN sorts above every other number.
fn cmp_floats(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Exact comparison of an integer against a float.
fn cmp_int_float(i: i128, f: f64) -> Ordering {
    if f.is_nan() || f >= I128_BOUND {
        return Ordering::Less;
    }
    if f < -I128_BOUND {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i128)) {
        Ordering::Equal if f > whole => Ordering::Less,
        Ordering::Equal if f < whole => Ordering::Greater,
        ord => ord,
    }
}

impl PartialEq for ScalarKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScalarKey {}

impl std::hash::Hash for ScalarKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            ScalarKey::Null => {}
            ScalarKey::Bool(b) => b.hash(state),
            // Integral floats hash like the integer they equal.
            ScalarKey::Int(i) => (0u8, *i).hash(state),
            ScalarKey::Float(f) => match Self::integral(*f) {
                Some(i) => (0u8, i).hash(state),
                None => (1u8, Self::normalized_bits(*f)).hash(state),
            },
            ScalarKey::Text(s) | ScalarKey::Other(s) => s.hash(state),
        }
    }
}

impl PartialOrd for ScalarKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScalarKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ScalarKey::Null, ScalarKey::Null) => Ordering::Equal,
            (ScalarKey::Bool(a), ScalarKey::Bool(b)) => a.cmp(b),
            (ScalarKey::Int(a), ScalarKey::Int(b)) => a.cmp(b),
            (ScalarKey::Float(a), ScalarKey::Float(b)) => cmp_floats(*a, *b),
            (ScalarKey::Int(a), ScalarKey::Float(b)) => cmp_int_float(*a, *b),
            (ScalarKey::Float(a), ScalarKey::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (ScalarKey::Text(a), ScalarKey::Text(b))
            | (ScalarKey::Other(a), ScalarKey::Other(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Compare two scalars with the `ScalarKey` ordering.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    ScalarKey::from_value(left).cmp(&ScalarKey::from_value(right))
}

/// Numeric view of a scalar. Numeric strings are accepted since some
/// drivers hand back decimals as text.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Wrap an f64 as a JSON number; non-finite results become null.
pub fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Key tuple for a row over the given aliases (missing aliases read as null).
pub fn key_tuple(row: &Row, aliases: &[String]) -> Vec<ScalarKey> {
    aliases
        .iter()
        .map(|alias| row.get(alias).map(ScalarKey::from_value).unwrap_or(ScalarKey::Null))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn integer_and_float_keys_are_equal() {
        let a = ScalarKey::from_value(&json!(1));
        let b = ScalarKey::from_value(&json!(1.0));
        assert_eq!(a, b);
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn large_integers_stay_distinct() {
        let a = ScalarKey::from_value(&json!(9_007_199_254_740_993u64));
        let b = ScalarKey::from_value(&json!(9_007_199_254_740_992u64));
        assert_ne!(a, b);
        assert!(b < a);
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 2);

        let max = ScalarKey::from_value(&json!(u64::MAX));
        assert!(ScalarKey::from_value(&json!(i64::MAX)) < max);
    }

    #[test]
    fn mixed_integer_and_float_ordering() {
        let float = ScalarKey::from_value(&json!(9_007_199_254_740_992.0));
        assert_eq!(float, ScalarKey::from_value(&json!(9_007_199_254_740_992u64)));
        assert_ne!(float, ScalarKey::from_value(&json!(9_007_199_254_740_993u64)));
        assert!(ScalarKey::from_value(&json!(1)) < ScalarKey::from_value(&json!(1.5)));
        assert!(ScalarKey::from_value(&json!(-2)) < ScalarKey::from_value(&json!(-1.5)));
        assert_eq!(ScalarKey::from_value(&json!(0)), ScalarKey::from_value(&json!(-0.0)));
    }

    #[test]
    fn null_sorts_first() {
        let mut values = vec![json!("b"), json!(null), json!(3), json!("a")];
        values.sort_by(compare_values);
        assert_eq!(values, vec![json!(null), json!(3), json!("a"), json!("b")]);
    }

    #[test]
    fn non_finite_floats_become_null() {
        assert_eq!(float_value(f64::INFINITY), Value::Null);
        assert_eq!(float_value(2.5), json!(2.5));
    }
}
