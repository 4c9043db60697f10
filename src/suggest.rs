//! "Did you mean?" ranking for unbound symbols.
//!
//! Similarity is `1 - distance / longest`, where distance is the Levenshtein
//! edit distance between the two names.

use std::cmp::Ordering;

use crate::scope::Scope;
use crate::value::Symbol;

/// Candidates at or below this similarity are never suggested.
pub const THRESHOLD: f64 = 0.5;

/// Minimum number of single-character edits turning `a` into `b`.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a_len = a.chars().count();
    let b_len = b.chars().count();
    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    let mut prev_row: Vec<usize> = (0..=b_len).collect();
    let mut curr_row: Vec<usize> = vec![0; b_len + 1];

    for (i, a_char) in a.chars().enumerate() {
        curr_row[0] = i + 1;
        for (j, b_char) in b.chars().enumerate() {
            let cost = usize::from(a_char != b_char);
            curr_row[j + 1] = (prev_row[j + 1] + 1)
                .min(curr_row[j] + 1)
                .min(prev_row[j] + cost);
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[b_len]
}

/// Similarity in `[0, 1]`; identical names score 1.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f64 / longest as f64
}

/// Visible bindings scoring above [`THRESHOLD`], best first. Equal scores keep
/// alphabetical order.
pub fn similar_bindings(symbol: &Symbol, scope: &Scope) -> Vec<(Symbol, f64)> {
    let mut matches: Vec<(Symbol, f64)> = scope
        .visible_bindings()
        .into_iter()
        .map(|(name, _)| {
            let score = similarity(symbol.as_str(), name.as_str());
            (name, score)
        })
        .filter(|(_, score)| *score > THRESHOLD)
        .collect();
    matches.sort_by(|(a_name, a_score), (b_name, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a_name.cmp(b_name))
    });
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn distances() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
        assert_eq!(edit_distance("abc", ""), 3);
    }

    #[test]
    fn ranking_excludes_low_scores() {
        let scope = Scope::empty();
        for name in ["foo", "bar", "baz", "qux", "food"] {
            scope.set(name, Value::Null);
        }
        let found = similar_bindings(&Symbol::new("fo"), &scope);
        let names: Vec<&str> = found.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["foo"]);

        let found = similar_bindings(&Symbol::new("fod"), &scope);
        let names: Vec<&str> = found.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["food", "foo"]);
    }
}
