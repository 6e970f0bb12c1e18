// ===============================
// src/shard.rs (static letter-range partitioning)
// ===============================
//
// Accounts are partitioned by the lowercase first letter of their name.
// A worker owns one inclusive LetterRange; a ShardMap is the routing table
// for a fleet and is only built when its ranges tile a..=z exactly.
//
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("invalid letter range {0:?} (expected e.g. \"a-f\" or \"m\")")]
    InvalidRange(String),
    #[error("letter '{letter}' is owned by both {first} and {second}")]
    Overlap { letter: char, first: LetterRange, second: LetterRange },
    #[error("letter '{0}' is not owned by any range")]
    Gap(char),
}

/// Lowercase first letter of an account, `None` when it is not a..=z.
pub fn shard_of(account: &str) -> Option<char> {
    account
        .chars()
        .next()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_lowercase())
}

/// Inclusive range of shard letters, e.g. `a-m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LetterRange {
    start: char,
    end: char,
}

impl LetterRange {
    pub const FULL: LetterRange = LetterRange { start: 'a', end: 'z' };

    pub fn new(start: char, end: char) -> Result<Self, ShardError> {
        let (s, e) = (start.to_ascii_lowercase(), end.to_ascii_lowercase());
        if !s.is_ascii_lowercase() || !e.is_ascii_lowercase() || s > e {
            return Err(ShardError::InvalidRange(format!("{start}-{end}")));
        }
        Ok(Self { start: s, end: e })
    }

    pub fn contains(&self, letter: char) -> bool {
        let l = letter.to_ascii_lowercase();
        self.start <= l && l <= self.end
    }

    pub fn owns_account(&self, account: &str) -> bool {
        shard_of(account).map(|c| self.contains(c)).unwrap_or(false)
    }

    pub fn letters(&self) -> impl Iterator<Item = char> {
        self.start..=self.end
    }
}

impl FromStr for LetterRange {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        let mut chars = t.chars();
        let parsed = match (chars.next(), chars.next(), chars.next(), chars.next()) {
            (Some(one), None, None, None) => LetterRange::new(one, one),
            (Some(a), Some('-'), Some(b), None) => LetterRange::new(a, b),
            _ => Err(ShardError::InvalidRange(s.to_string())),
        };
        parsed.map_err(|_| ShardError::InvalidRange(s.to_string()))
    }
}

impl fmt::Display for LetterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Comma separated list of ranges: `"a-f,g-l,m"`.
pub fn parse_ranges(s: &str) -> Result<Vec<LetterRange>, ShardError> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::parse)
        .collect()
}

/// Routing table: letter -> index of the owning range.
#[derive(Debug, Clone)]
pub struct ShardMap {
    ranges: Vec<LetterRange>,
    owner: [usize; 26],
}

impl ShardMap {
    /// Builds the table, refusing overlapping ranges or uncovered letters.
    pub fn new(ranges: Vec<LetterRange>) -> Result<Self, ShardError> {
        let mut owner: [Option<usize>; 26] = [None; 26];
        for (idx, r) in ranges.iter().enumerate() {
            for letter in r.letters() {
                let slot = &mut owner[(letter as u8 - b'a') as usize];
                if let Some(prev) = *slot {
                    return Err(ShardError::Overlap { letter, first: ranges[prev], second: *r });
                }
                *slot = Some(idx);
            }
        }
        let mut table = [0usize; 26];
        for (i, slot) in owner.iter().enumerate() {
            match slot {
                Some(idx) => table[i] = *idx,
                None => return Err(ShardError::Gap((b'a' + i as u8) as char)),
            }
        }
        Ok(Self { ranges, owner: table })
    }

    pub fn ranges(&self) -> &[LetterRange] {
        &self.ranges
    }

    /// Index of the range that owns `account`.
    pub fn worker_for(&self, account: &str) -> Option<usize> {
        shard_of(account).map(|c| self.owner[(c as u8 - b'a') as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_ranges() {
        assert_eq!(parse_ranges("a-f, g-z").unwrap().len(), 2);
        assert_eq!("M".parse::<LetterRange>().unwrap().to_string(), "m");
        assert_eq!("A-M".parse::<LetterRange>().unwrap().to_string(), "a-m");
        assert!("m-a".parse::<LetterRange>().is_err());
        assert!("a-".parse::<LetterRange>().is_err());
        assert!("1-9".parse::<LetterRange>().is_err());
        assert!("ab".parse::<LetterRange>().is_err());
    }

    #[test]
    fn rejects_gaps_and_overlaps() {
        let gap = ShardMap::new(parse_ranges("a-f,h-z").unwrap());
        assert_eq!(gap.unwrap_err(), ShardError::Gap('g'));

        let overlap = ShardMap::new(parse_ranges("a-m,m-z").unwrap());
        assert!(matches!(overlap, Err(ShardError::Overlap { letter: 'm', .. })));
    }

    #[test]
    fn nancy_is_not_in_a_to_m() {
        let am: LetterRange = "a-m".parse().unwrap();
        assert!(!am.owns_account("nancy"));
        assert!(!am.owns_account("Nancy"));
        assert!(am.owns_account("Alice"));
        assert!(!am.owns_account("_x"));
        assert_eq!(shard_of("Zed"), Some('z'));
        assert_eq!(shard_of("42"), None);
    }

    fn tiling() -> impl Strategy<Value = Vec<LetterRange>> {
        // random cut points over 1..26 -> contiguous ranges covering a..=z
        proptest::collection::btree_set(1u8..26, 0..10).prop_map(|cuts| {
            let mut bounds: Vec<u8> = vec![0];
            bounds.extend(cuts);
            bounds.push(26);
            bounds
                .windows(2)
                .map(|w| LetterRange::new((b'a' + w[0]) as char, (b'a' + w[1] - 1) as char).unwrap())
                .collect()
        })
    }

    proptest! {
        #[test]
        fn every_letter_maps_to_exactly_one_worker(ranges in tiling()) {
            let map = ShardMap::new(ranges.clone()).unwrap();
            for c in 'a'..='z' {
                let owners: Vec<usize> = ranges
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.contains(c))
                    .map(|(i, _)| i)
                    .collect();
                prop_assert_eq!(owners.len(), 1);
                let account = format!("{c}user");
                prop_assert_eq!(map.worker_for(&account), Some(owners[0]));
            }
        }
    }
}
