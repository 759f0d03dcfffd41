//! Shell-style variable substitution for script tokens.
//!
//! Every string token in a job script goes through `substitute` before use.
//! `$NAME` and `${NAME}` expand from the scope's environment, `\$` is a
//! literal dollar sign, and `$$` is rejected outright (process IDs would make
//! builds irreproducible). An unbound variable is a hard error, never an
//! empty expansion.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstError {
  #[error("\"$$\" is not allowed, use \"\\$\" for a literal dollar sign: {0}")]
  DoubleDollar(String),

  #[error("unbound variable \"{0}\"")]
  Unbound(String),

  #[error("invalid variable reference in: {0}")]
  InvalidPlaceholder(String),
}

fn is_ident_start(c: char) -> bool {
  c == '_' || c.is_ascii_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
  c == '_' || c.is_ascii_alphanumeric()
}

/// Expand `$NAME` / `${NAME}` references in `input` against `env`.
///
/// `$NAMEsuffix` reads as the longest identifier after the `$`, so
/// adjacent text needs the braced form (`${NAME}suffix`).
pub fn substitute(input: &str, env: &BTreeMap<String, String>) -> Result<String, SubstError> {
  let mut out = String::with_capacity(input.len());
  let mut chars = input.chars().peekable();

  while let Some(c) = chars.next() {
    match c {
      '\\' if chars.peek() == Some(&'$') => {
        chars.next();
        out.push('$');
      }
      '$' => {
        let name = match chars.peek() {
          Some('$') => return Err(SubstError::DoubleDollar(input.to_string())),
          Some('{') => {
            chars.next();
            let mut name = String::new();
            loop {
              match chars.next() {
                Some('}') => break,
                Some(c) if is_ident_continue(c) => name.push(c),
                _ => return Err(SubstError::InvalidPlaceholder(input.to_string())),
              }
            }
            name
          }
          Some(&c) if is_ident_start(c) => {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
              if !is_ident_continue(c) {
                break;
              }
              name.push(c);
              chars.next();
            }
            name
          }
          _ => return Err(SubstError::InvalidPlaceholder(input.to_string())),
        };
        if name.is_empty() || !name.chars().next().map(is_ident_start).unwrap_or(false) {
          return Err(SubstError::InvalidPlaceholder(input.to_string()));
        }
        match env.get(&name) {
          Some(value) => out.push_str(value),
          None => return Err(SubstError::Unbound(name)),
        }
      }
      c => out.push(c),
    }
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  #[test]
  fn plain_text_passes_through() {
    assert_eq!(substitute("make -j4", &env(&[])).unwrap(), "make -j4");
  }

  #[test]
  fn bare_and_braced_references() {
    let e = env(&[("A", "a"), ("A_b", "ab")]);
    assert_eq!(substitute("$A", &e).unwrap(), "a");
    assert_eq!(substitute("${A}", &e).unwrap(), "a");
    assert_eq!(substitute("${A}x", &e).unwrap(), "ax");
    assert_eq!(substitute("$A_b", &e).unwrap(), "ab");
  }

  #[test]
  fn bare_reference_is_greedy() {
    // $Ax is one identifier, not $A followed by "x"
    let e = env(&[("A", "a")]);
    assert_eq!(substitute("$Ax", &e), Err(SubstError::Unbound("Ax".to_string())));
  }

  #[test]
  fn escaped_dollar_is_literal() {
    assert_eq!(substitute(r"\$HOME", &env(&[])).unwrap(), "$HOME");
    assert_eq!(substitute(r"a\$b", &env(&[])).unwrap(), "a$b");
  }

  #[test]
  fn backslash_without_dollar_is_kept() {
    assert_eq!(substitute(r"a\b", &env(&[])).unwrap(), r"a\b");
  }

  #[test]
  fn double_dollar_is_rejected() {
    assert!(matches!(substitute("$$", &env(&[])), Err(SubstError::DoubleDollar(_))));
    assert!(matches!(substitute("pid=$$", &env(&[])), Err(SubstError::DoubleDollar(_))));
  }

  #[test]
  fn unbound_variable_is_fatal() {
    assert_eq!(substitute("$MISSING", &env(&[])), Err(SubstError::Unbound("MISSING".to_string())));
    assert_eq!(
      substitute("${MISSING}", &env(&[])),
      Err(SubstError::Unbound("MISSING".to_string()))
    );
  }

  #[test]
  fn malformed_references_are_rejected() {
    for bad in ["$", "$ ", "$-flag", "${}", "${A", "${A-b}", "a$"] {
      assert!(
        matches!(substitute(bad, &env(&[("A", "a")])), Err(SubstError::InvalidPlaceholder(_))),
        "{bad:?}"
      );
    }
  }

  #[test]
  fn mixed_text_and_references() {
    let e = env(&[("ARTIFACT", "/store/foo/r0/abcd")]);
    assert_eq!(
      substitute("--prefix=${ARTIFACT}/sub", &e).unwrap(),
      "--prefix=/store/foo/r0/abcd/sub"
    );
  }
}
