//! IMAP sequence-number / UID set grammar and evaluation (component C2).
//!
//! Grammar (spec.md §4.2):
//! ```text
//! set     := range ( "," range )*
//! range   := value [ ":" value ]
//! value   := positive-integer | "*"
//! ```
//!
//! Grounded on the teacher's own `peg::parser!` usage in `source/imap.rs`: same
//! macro, same style of a `rule` per grammar production, same "RFC citation in a
//! comment above the rule" documentation habit (here there's no RFC number handy
//! since this grammar is spec-local, so the comment instead restates the EBNF).

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value {
  Number(u32),
  Star,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range(Value, Value);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSet(Vec<Range>);

peg::parser! {
  grammar parser() for str {
    rule number() -> u32
      = n:$(['1'..='9'] ['0'..='9']*) {? n.parse().or(Err("number too large")) }

    rule value() -> Value
      = "*" { Value::Star }
      / n:number() { Value::Number(n) }

    rule range() -> Range
      = a:value() ":" b:value() { Range(a, b) }
      / a:value() { Range(a, a) }

    pub rule set() -> Vec<Range>
      = r:range() ++ "," { r }
  }
}

impl MessageSet {
  /// Parses the grammar above. Fails on empty input, non-positive numbers, stray
  /// tokens other than `*`, or an empty segment between commas.
  pub fn parse(s: &str) -> Result<Self, Error> {
    if s.is_empty() {
      return Err(Error::Parse {
        position: 0,
        message: "empty message set".into(),
      });
    }
    parser::set(s)
      .map(MessageSet)
      .map_err(|error| Error::Parse {
        position: error.location.offset,
        message: format!("expected {}", error.expected),
      })
  }

  fn resolve(value: Value, last: u32) -> u32 {
    match value {
      Value::Number(n) => n,
      Value::Star => last,
    }
  }

  /// `last` is substituted for `*`. A literal value exceeding `last` never matches
  /// and never errors (IMAP semantics, spec.md §4.2).
  pub fn contains(&self, n: u32, last: u32) -> bool {
    self.0.iter().any(|Range(a, b)| {
      let (a, b) = (Self::resolve(*a, last), Self::resolve(*b, last));
      let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
      n >= lo && n <= hi
    })
  }

  /// Re-serialises in normalised form: each range's endpoints ordered `lo:hi`,
  /// ranges left in declaration order, `1:1` collapsed to `1`.
  pub fn to_imap_string(&self) -> String {
    self
      .0
      .iter()
      .map(|Range(a, b)| {
        let fmt = |v: &Value| match v {
          Value::Number(n) => n.to_string(),
          Value::Star => "*".to_string(),
        };
        match (a, b) {
          (a, b) if a == b => fmt(a),
          (Value::Number(x), Value::Number(y)) if x > y => format!("{}:{}", fmt(b), fmt(a)),
          _ => format!("{}:{}", fmt(a), fmt(b)),
        }
      })
      .collect::<Vec<_>>()
      .join(",")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn s3_examples() {
    let set = MessageSet::parse("1:5,7,10:*").unwrap();
    assert!(set.contains(4, 20));
    assert!(!set.contains(6, 20));
    assert!(set.contains(15, 20));
    assert!(!set.contains(15, 9));

    let set = MessageSet::parse("10:1").unwrap();
    assert_eq!("1:10", set.to_imap_string());
  }

  #[test]
  fn rejects_empty_and_malformed() {
    assert!(MessageSet::parse("").is_err());
    assert!(MessageSet::parse("0").is_err());
    assert!(MessageSet::parse("-1").is_err());
    assert!(MessageSet::parse("1,,2").is_err());
    assert!(MessageSet::parse("abc").is_err());
    assert!(MessageSet::parse(",").is_err());
  }

  #[test]
  fn wildcard_still_matches_when_last_is_small() {
    let set = MessageSet::parse("1:*").unwrap();
    assert!(set.contains(1, 1));
    assert!(!set.contains(2, 1));
  }

  #[test]
  fn tolerates_overlapping_ranges() {
    let set = MessageSet::parse("1:3,2:4").unwrap();
    for n in 1..=4 {
      assert!(set.contains(n, 10));
    }
    assert!(!set.contains(5, 10));
  }

  #[test]
  fn round_trip_is_a_fixed_point() {
    for s in ["1", "1:10", "1,3,5:7", "1:2,4"] {
      let set = MessageSet::parse(s).unwrap();
      let printed = set.to_imap_string();
      assert_eq!(printed, MessageSet::parse(&printed).unwrap().to_imap_string());
    }
  }
}
