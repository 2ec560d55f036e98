//! Outcomes of the conditional map operations.

/// Outcome of a conditional operation (`replace`, `remove_if`).
///
/// The protocol distinguishes three cases: the expected value was found and
/// the operation applied, a different value was found, or the key was not
/// present at all.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Conditional<T> {
    /// The expected value matched; the carried value is the one that was
    /// replaced or removed.
    Applied(T),
    /// The key is present, but with a value different from the expected one.
    /// Nothing was changed.
    Mismatch,
    /// The key is not present. Nothing was changed.
    Absent,
}

impl<T> Conditional<T> {
    /// Extracts the replaced/removed value, if the operation applied.
    pub fn applied(self) -> Option<T> {
        match self {
            Conditional::Applied(value) => Some(value),
            Conditional::Mismatch | Conditional::Absent => None,
        }
    }

    /// Did the operation apply?
    pub fn is_applied(&self) -> bool {
        match self {
            Conditional::Applied(_) => true,
            _ => false,
        }
    }

    /// Transforms the carried value, keeping the outcome.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Conditional<U> {
        match self {
            Conditional::Applied(value) => Conditional::Applied(f(value)),
            Conditional::Mismatch => Conditional::Mismatch,
            Conditional::Absent => Conditional::Absent,
        }
    }
}
