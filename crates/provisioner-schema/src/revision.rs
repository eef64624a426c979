use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// An upstream revision identifier.
///
/// Revisions are stored and compared as integers. Dotted identifiers such as
/// `94.0.4606.71` are packed into a single comparable integer by zero-padding
/// each dot-separated component to six digits and concatenating; this
/// preserves the same ordering as comparing the components as a tuple, for
/// components that individually stay below one million.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Revision(i64);

impl Revision {
    /// Wrap a raw integer revision.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The raw integer value.
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Revision {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Convert a captured revision string (plain or dot-separated) into a
/// [`Revision`], packing dotted components as documented on the type.
///
/// Returns `None` if any component fails to parse as a non-negative integer.
pub fn convert_revision_to_integer(raw: &str) -> Option<Revision> {
    if let Ok(v) = raw.parse::<i64>() {
        return Some(Revision(v));
    }

    let mut packed = String::new();
    for part in raw.split('.') {
        let n: u32 = part.parse().ok()?;
        packed.push_str(&format!("{n:06}"));
    }
    packed.parse::<i64>().ok().map(Revision)
}

/// Parse a dot-separated revision string into its component integers, for
/// use as a sort key that compares tuples element-wise rather than packing
/// them into one integer. Mirrors the original's
/// `key=lambda x: list(map(int, x.split('.')))` sort key.
///
/// Returns `None` if any component fails to parse, signaling that the caller
/// should fall back to lexicographic string sort.
pub fn dotted_sort_key(raw: &str) -> Option<Vec<i64>> {
    raw.split('.').map(|part| part.parse::<i64>().ok()).collect()
}

/// Compare two revision strings using [`dotted_sort_key`] when both parse,
/// falling back to plain string comparison otherwise.
pub fn compare_revision_strings(a: &str, b: &str) -> Ordering {
    match (dotted_sort_key(a), dotted_sort_key(b)) {
        (Some(ka), Some(kb)) => ka.cmp(&kb),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_revision_round_trips() {
        assert_eq!(convert_revision_to_integer("123456"), Some(Revision(123_456)));
    }

    #[test]
    fn dotted_components_pack_in_order() {
        let r1 = convert_revision_to_integer("94.0.4606").unwrap();
        let r2 = convert_revision_to_integer("94.0.4607").unwrap();
        assert!(r1 < r2);
    }

    #[test]
    fn invalid_component_returns_none() {
        assert_eq!(convert_revision_to_integer("94.abc.1"), None);
    }

    #[test]
    fn dotted_sort_key_compares_numerically_not_lexicographically() {
        // "9" < "10" numerically, but ">" lexicographically as strings.
        assert_eq!(compare_revision_strings("1.9", "1.10"), Ordering::Less);
    }

    #[test]
    fn dotted_sort_key_falls_back_to_string_compare_on_parse_failure() {
        assert_eq!(compare_revision_strings("abc", "abd"), Ordering::Less);
    }
}
