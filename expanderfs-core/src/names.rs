//! Host name rules: collation and wildcard matching.
//!
//! These mirror the comparator and matcher the host uses for its own cached
//! entries. Ordering is an ordinal comparison of the upper-cased UTF-16 code
//! units. Patterns support `*`, `?` and the DOS wildcards `<`, `>` and `"`,
//! all case-insensitive.

use std::cmp::Ordering;

const DOS_STAR: char = '<';
const DOS_QM: char = '>';
const DOS_DOT: char = '"';

/// Compares two file names the way the host collates them.
pub fn compare(a: &str, b: &str) -> Ordering {
    upcase_units(a).cmp(upcase_units(b))
}

fn upcase_units(name: &str) -> impl Iterator<Item = u16> + '_ {
    name.chars().map(upcase).flat_map(|c| {
        let mut buf = [0u16; 2];
        let len = c.encode_utf16(&mut buf).len();
        buf.into_iter().take(len)
    })
}

/// Returns true if the pattern contains any wildcard character.
pub fn contains_wildcards(pattern: &str) -> bool {
    pattern
        .chars()
        .any(|c| matches!(c, '*' | '?' | DOS_STAR | DOS_QM | DOS_DOT))
}

/// Returns true if `name` matches `pattern`. An empty pattern matches everything.
pub fn matches(name: &str, pattern: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    if !contains_wildcards(pattern) {
        return compare(name, pattern) == Ordering::Equal;
    }

    let name: Vec<char> = name.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let mut matcher = Matcher {
        name: &name,
        pattern: &pattern,
        memo: vec![None; (name.len() + 1) * (pattern.len() + 1)],
    };
    matcher.matches_at(0, 0)
}

struct Matcher<'a> {
    name: &'a [char],
    pattern: &'a [char],
    memo: Vec<Option<bool>>,
}

impl Matcher<'_> {
    fn matches_at(&mut self, n: usize, p: usize) -> bool {
        let slot = n * (self.pattern.len() + 1) + p;
        if let Some(known) = self.memo[slot] {
            return known;
        }
        let result = self.evaluate(n, p);
        self.memo[slot] = Some(result);
        result
    }

    fn evaluate(&mut self, n: usize, p: usize) -> bool {
        let Some(&token) = self.pattern.get(p) else {
            return n == self.name.len();
        };
        let current = self.name.get(n).copied();

        match token {
            '*' => (n..=self.name.len()).any(|k| self.matches_at(k, p + 1)),
            DOS_STAR => {
                // May consume anything except the final period of the name.
                let limit = self.name[n..]
                    .iter()
                    .rposition(|&c| c == '.')
                    .map_or(self.name.len(), |dot| n + dot);
                (n..=limit).any(|k| self.matches_at(k, p + 1))
            }
            '?' => current.is_some() && self.matches_at(n + 1, p + 1),
            DOS_QM => match current {
                None | Some('.') => self.matches_at(n, p + 1),
                Some(_) => self.matches_at(n + 1, p + 1),
            },
            DOS_DOT => match current {
                Some('.') => self.matches_at(n + 1, p + 1),
                None => self.matches_at(n, p + 1),
                Some(_) => false,
            },
            literal => match current {
                Some(c) if chars_equal(c, literal) => self.matches_at(n + 1, p + 1),
                _ => false,
            },
        }
    }
}

fn chars_equal(a: char, b: char) -> bool {
    a == b || upcase(a) == upcase(b)
}

/// One-to-one upper-casing. The host's upcase table maps each unit to a single
/// unit, so characters whose upper case expands ('ß' to "SS") stay as they are.
fn upcase(c: char) -> char {
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(single), None) => single,
        _ => c,
    }
}
