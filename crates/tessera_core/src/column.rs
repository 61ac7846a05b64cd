use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Column name. Comparison and hashing ignore case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Column(String);

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Column(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Spreadsheet style name for the column at `index`: digits in base 26
    /// where `A` is zero.
    pub fn default_for_index(index: usize) -> Self {
        let mut letters = Vec::new();
        let mut n = index;
        loop {
            letters.push(b'A' + (n % 26) as u8);
            n /= 26;
            if n == 0 {
                break;
            }
        }
        letters.reverse();
        Column(String::from_utf8_lossy(&letters).into_owned())
    }

    fn folded(&self) -> String {
        self.0.to_lowercase()
    }
}

impl PartialEq for Column {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0) || self.folded() == other.folded()
    }
}

impl Eq for Column {}

impl Hash for Column {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded().hash(state)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Column {
    fn from(value: &str) -> Self {
        Column::new(value)
    }
}

impl From<String> for Column {
    fn from(value: String) -> Self {
        Column(value)
    }
}

/// Build a list of columns from names.
pub fn columns<S: AsRef<str>>(names: &[S]) -> Vec<Column> {
    names.iter().map(|n| Column::new(n.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn case_insensitive() {
        assert_eq!(Column::new("Hello"), Column::new("hello"));
        assert_ne!(Column::new("xxx"), Column::new("hello"));

        let set: HashSet<_> = [Column::new("ABC"), Column::new("abc")].into_iter().collect();
        assert_eq!(1, set.len());
    }

    #[test]
    fn default_names() {
        assert_eq!(Column::new("A"), Column::default_for_index(0));
        assert_eq!(Column::new("B"), Column::default_for_index(1));
        assert_eq!(Column::new("BA"), Column::default_for_index(26));
        assert_eq!(Column::new("BZL"), Column::default_for_index(1337));
    }
}
