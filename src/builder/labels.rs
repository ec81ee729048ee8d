use std::fmt;

use thiserror::Error;
use xxhash_rust::xxh64::Xxh64;

/// A single name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered label set.
///
/// The canonical form is name-ascending with unique names; [`normalize`]
/// produces it. Comparison is lexicographic over the (name, value) pairs,
/// which is the order the block index expects within one hash bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new(labels: Vec<Label>) -> Self {
        Self(labels)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<Label> {
        self.0.iter()
    }

    /// The stable 64-bit label-set hash the block index sorts by.
    ///
    /// xxhash64 over `name \xff value \xff ...`, seed 0. Must only be
    /// computed on canonical label sets, otherwise equal series hash apart.
    pub fn hash(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        for label in &self.0 {
            hasher.update(label.name.as_bytes());
            hasher.update(&[0xff]);
            hasher.update(label.value.as_bytes());
            hasher.update(&[0xff]);
        }
        hasher.digest()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The only normalization failure that escapes to callers. Everything else
/// (unsorted input, repeated name with equal value) is repaired internally.
#[derive(Debug, Error)]
#[error("label '{name}' has duplicate entries with different values")]
pub struct DuplicateDifferentValues {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanOutcome {
    Clean,
    NotSorted,
    DuplicateSameValue,
}

fn scan(labels: &[Label]) -> Result<ScanOutcome, DuplicateDifferentValues> {
    let mut outcome = ScanOutcome::Clean;
    for pair in labels.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.name < prev.name {
            return Ok(ScanOutcome::NotSorted);
        }
        if next.name == prev.name {
            if next.value == prev.value {
                outcome = ScanOutcome::DuplicateSameValue;
            } else {
                return Err(DuplicateDifferentValues {
                    name: next.name.clone(),
                });
            }
        }
    }
    Ok(outcome)
}

/// Bring a label set into canonical form.
///
/// Producers usually emit sorted, unique labels, so the common path is a
/// single scan. Unsorted input is stable-sorted by name and re-scanned;
/// repeated names with equal values are compacted to one entry. A repeated
/// name with differing values is unrecoverable and fails the series.
pub fn normalize(labels: Labels) -> Result<Labels, DuplicateDifferentValues> {
    let mut labels = labels.0;

    let mut outcome = scan(&labels)?;
    if outcome == ScanOutcome::NotSorted {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        outcome = scan(&labels)?;
    }
    if outcome == ScanOutcome::DuplicateSameValue {
        labels.dedup_by(|next, prev| next.name == prev.name && next.value == prev.value);
        // confirm the compaction left nothing behind
        debug_assert_eq!(scan(&labels)?, ScanOutcome::Clean);
    }

    Ok(Labels(labels))
}

#[cfg(test)]
mod test {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::new(
            pairs
                .iter()
                .map(|(n, v)| Label::new(*n, *v))
                .collect(),
        )
    }

    #[test]
    fn sorted_unique_input_is_unchanged() {
        let input = labels(&[("__name__", "up"), ("job", "api")]);
        let normalized = normalize(input.clone()).unwrap();
        assert_eq!(normalized, input);
    }

    #[test]
    fn unsorted_input_is_sorted() {
        let input = labels(&[("b", "2"), ("a", "1")]);
        let normalized = normalize(input).unwrap();
        assert_eq!(normalized, labels(&[("a", "1"), ("b", "2")]));
    }

    #[test]
    fn duplicate_same_value_is_compacted() {
        let input = labels(&[("a", "1"), ("a", "1"), ("b", "2")]);
        let normalized = normalize(input).unwrap();
        assert_eq!(normalized, labels(&[("a", "1"), ("b", "2")]));
    }

    #[test]
    fn duplicate_after_sort_is_compacted() {
        let input = labels(&[("b", "2"), ("a", "1"), ("a", "1")]);
        let normalized = normalize(input).unwrap();
        assert_eq!(normalized, labels(&[("a", "1"), ("b", "2")]));
    }

    #[test]
    fn duplicate_different_values_is_fatal() {
        let input = labels(&[("a", "1"), ("a", "2")]);
        let err = normalize(input).unwrap_err();
        assert_eq!(err.name, "a");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize(labels(&[("b", "2"), ("a", "1"), ("a", "1")])).unwrap();
        let twice = normalize(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn hash_distinguishes_label_sets() {
        let a = labels(&[("a", "1"), ("b", "2")]);
        let b = labels(&[("a", "1"), ("b", "3")]);
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.clone().hash());
    }

    #[test]
    fn hash_separator_prevents_boundary_collisions() {
        let a = labels(&[("ab", "c")]);
        let b = labels(&[("a", "bc")]);
        assert_ne!(a.hash(), b.hash());
    }
}
