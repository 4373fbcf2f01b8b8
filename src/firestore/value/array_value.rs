use serde::{Deserialize, Serialize};

use crate::firestore::value::{values_equal, FirestoreValue};

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Membership using value equality (so `1` matches `1.0`).
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|value| values_equal(value, needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_uses_numeric_equality() {
        let array = ArrayValue::new(vec![FirestoreValue::from_integer(1)]);
        assert!(array.contains(&FirestoreValue::from_double(1.0)));
        assert!(!array.contains(&FirestoreValue::from_string("1")));
    }
}
