//! Grammar for the IMAP `SEARCH` key list (component C6's parser half).
//!
//! Grounded on `source/maildir/name.rs` and `source/message_set.rs`'s `peg::parser!`
//! style (the same crate, the same captured-slice/fallible-action idiom), applied
//! to RFC 3501 §6.4.4's `search-key` grammar restricted to the subset spec.md §4.6
//! names: `ALL`, flag atoms (plain and `UN`-negated), `FROM`/`TO`/`CC`/`BCC`/
//! `SUBJECT`/`HEADER`/`TEXT`/`BODY` substring atoms, `BEFORE`/`ON`/`SINCE`
//! internal-date atoms, `SENTBEFORE`/`SENTON`/`SENTSINCE` sent-date atoms,
//! `LARGER`/`SMALLER` size atoms, `KEYWORD`/`UNKEYWORD`, `NOT`/prefix-`OR`/
//! parenthesised conjunction, and bare sequence-number or `UID` sets.

use super::Expr;
use crate::MessageSet;
use chrono::NaiveDate;

peg::parser! {
  grammar parser() for str {
    rule _() = [' ' | '\t']*

    rule quoted_string() -> String
      = "\"" chars:quoted_char()* "\"" { chars.into_iter().collect() }

    rule quoted_char() -> char
      = "\\\"" { '"' }
      / "\\\\" { '\\' }
      / !['"'] c:[_] { c }

    rule atom_string() -> String
      = s:$((![' ' | '\t' | '(' | ')' | '"'] [_])+) { s.to_string() }

    rule string() -> String = quoted_string() / atom_string()

    rule number() -> u32
      = n:$(['0'..='9']+) {? n.parse().or(Err("number")) }

    rule date() -> NaiveDate
      = d:$(['0'..='9']+ "-" ['A'..='Z' | 'a'..='z']+ "-" ['0'..='9']+)
        {? parse_date(d).ok_or("date") }

    rule message_set() -> MessageSet
      = s:$((['0'..='9' | ':' | ',' | '*'])+) {? MessageSet::parse(s).map_err(|_| "message-set") }

    pub rule expr() -> Expr = conjunction()

    // Implicit AND: a run of juxtaposed criteria, left-folded (spec.md §4.6,
    // "top-level juxtaposition ... is conjunctive").
    rule conjunction() -> Expr
      = first:atom() rest:(_ a:atom() { a })* {
          rest.into_iter().fold(first, |acc, next| Expr::And(Box::new(acc), Box::new(next)))
        }

    // `OR` is the RFC 3501 prefix binary form `OR <crit1> <crit2>` (spec.md §4.6),
    // not an infix operator: each operand is a single atom (itself possibly a
    // parenthesised conjunction), matching S5's `OR (SEEN FLAGGED) (UNSEEN
    // UNFLAGGED)`.
    rule atom() -> Expr
      = "(" _ e:conjunction() _ ")" { e }
      / ci("OR") _ a:atom() _ b:atom() { Expr::Or(Box::new(a), Box::new(b)) }
      / ci("NOT") _ e:atom() { Expr::Not(Box::new(e)) }
      / ci("ALL") { Expr::All }
      / ci("ANSWERED") { Expr::Flag(crate::Flag::Answered, true) }
      / ci("UNANSWERED") { Expr::Flag(crate::Flag::Answered, false) }
      / ci("DELETED") { Expr::Flag(crate::Flag::Deleted, true) }
      / ci("UNDELETED") { Expr::Flag(crate::Flag::Deleted, false) }
      / ci("DRAFT") { Expr::Flag(crate::Flag::Draft, true) }
      / ci("UNDRAFT") { Expr::Flag(crate::Flag::Draft, false) }
      / ci("FLAGGED") { Expr::Flag(crate::Flag::Flagged, true) }
      / ci("UNFLAGGED") { Expr::Flag(crate::Flag::Flagged, false) }
      / ci("SEEN") { Expr::Flag(crate::Flag::Seen, true) }
      / ci("UNSEEN") { Expr::Flag(crate::Flag::Seen, false) }
      / ci("NEW") { Expr::And(Box::new(Expr::Flag(crate::Flag::Recent, true)), Box::new(Expr::Flag(crate::Flag::Seen, false))) }
      / ci("OLD") { Expr::Flag(crate::Flag::Recent, false) }
      / ci("RECENT") { Expr::Flag(crate::Flag::Recent, true) }
      / ci("KEYWORD") _ k:string() { Expr::Keyword(k, true) }
      / ci("UNKEYWORD") _ k:string() { Expr::Keyword(k, false) }
      / ci("HEADER") _ name:string() _ value:string() { Expr::Header(name, value) }
      / ci("FROM") _ s:string() { Expr::Header("From".to_string(), s) }
      / ci("TO") _ s:string() { Expr::Header("To".to_string(), s) }
      / ci("CC") _ s:string() { Expr::Header("Cc".to_string(), s) }
      / ci("BCC") _ s:string() { Expr::Header("Bcc".to_string(), s) }
      / ci("SUBJECT") _ s:string() { Expr::Header("Subject".to_string(), s) }
      / ci("BODY") _ s:string() { Expr::Body(s) }
      / ci("TEXT") _ s:string() { Expr::Text(s) }
      / ci("SENTBEFORE") _ d:date() { Expr::SentBefore(d) }
      / ci("SENTON") _ d:date() { Expr::SentOn(d) }
      / ci("SENTSINCE") _ d:date() { Expr::SentSince(d) }
      / ci("BEFORE") _ d:date() { Expr::Before(d) }
      / ci("ON") _ d:date() { Expr::On(d) }
      / ci("SINCE") _ d:date() { Expr::Since(d) }
      / ci("LARGER") _ n:number() { Expr::Larger(n as u64) }
      / ci("SMALLER") _ n:number() { Expr::Smaller(n as u64) }
      / ci("UID") _ s:message_set() { Expr::Uid(s) }
      / s:message_set() { Expr::SequenceSet(s) }

    /// Case-insensitive keyword match.
    rule ci(expected: &'static str) = input:$(['A'..='Z' | 'a'..='z']+) {? if input.eq_ignore_ascii_case(expected) { Ok(()) } else { Err(expected) } }
  }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
  // IMAP date format: `DD-Mon-YYYY`, e.g. `01-Jan-2024`.
  NaiveDate::parse_from_str(s, "%d-%b-%Y").ok()
}

pub fn parse(input: &str) -> Result<Expr, super::ParseError> {
  let trimmed = input.trim();
  parser::expr(trimmed).map_err(|e| super::ParseError {
    position: e.location.offset,
    message: e.to_string(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_all() {
    assert!(matches!(parse("ALL").unwrap(), Expr::All));
  }

  #[test]
  fn parses_negated_flag() {
    assert!(matches!(parse("UNSEEN").unwrap(), Expr::Flag(crate::Flag::Seen, false)));
  }

  #[test]
  fn parses_implicit_and() {
    let expr = parse("SEEN FLAGGED").unwrap();
    assert!(matches!(expr, Expr::And(_, _)));
  }

  #[test]
  fn parses_or() {
    let expr = parse("OR SEEN FLAGGED").unwrap();
    assert!(matches!(expr, Expr::Or(_, _)));
  }

  #[test]
  fn parses_or_of_parenthesised_conjunctions() {
    // spec.md §4.6 S5: `OR (SEEN FLAGGED) (UNSEEN UNFLAGGED)`.
    let expr = parse("OR (SEEN FLAGGED) (UNSEEN UNFLAGGED)").unwrap();
    match expr {
      Expr::Or(a, b) => {
        assert!(matches!(*a, Expr::And(_, _)));
        assert!(matches!(*b, Expr::And(_, _)));
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn parses_from_and_subject_shorthands() {
    // spec.md §4.6 S5: `UNSEEN SINCE 1-Jan-2024 FROM "boss@example.com" SUBJECT urgent`.
    let expr = parse(r#"UNSEEN SINCE 1-Jan-2024 FROM "boss@example.com" SUBJECT urgent"#).unwrap();
    assert!(matches!(expr, Expr::And(_, _)));
  }

  #[test]
  fn parses_header_atom_with_quoted_value() {
    let expr = parse(r#"HEADER Subject "hello world""#).unwrap();
    match expr {
      Expr::Header(name, value) => {
        assert_eq!("Subject", name);
        assert_eq!("hello world", value);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn quoted_string_unescapes_backslash_sequences() {
    let expr = parse(r#"BODY "say \"hi\" to \\you\\""#).unwrap();
    match expr {
      Expr::Body(s) => assert_eq!(r#"say "hi" to \you\"#, s),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn unterminated_quoted_string_is_a_parse_error() {
    assert!(parse(r#"BODY "never closes"#).is_err());
  }

  #[test]
  fn sent_date_atoms_parse_distinctly_from_internal_date_atoms() {
    assert!(matches!(parse("SENTBEFORE 01-Jan-2024").unwrap(), Expr::SentBefore(_)));
    assert!(matches!(parse("SENTON 01-Jan-2024").unwrap(), Expr::SentOn(_)));
    assert!(matches!(parse("SENTSINCE 01-Jan-2024").unwrap(), Expr::SentSince(_)));
  }

  #[test]
  fn parses_date_atom() {
    let expr = parse("SINCE 01-Jan-2024").unwrap();
    assert!(matches!(expr, Expr::Since(_)));
  }

  #[test]
  fn parses_bare_sequence_set() {
    assert!(matches!(parse("1:5,7").unwrap(), Expr::SequenceSet(_)));
  }

  #[test]
  fn rejects_garbage() {
    assert!(parse("@@@").is_err());
  }
}
