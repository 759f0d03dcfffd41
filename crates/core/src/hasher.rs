//! Stable document hashing for content addressing.
//!
//! A build specification is a JSON-like document, and its artifact identity
//! is a hash of that document. To keep the hash independent of any particular
//! serializer's whitespace or key-ordering choices, documents are fed to
//! SHA-256 through a small envelope format: every value is prefixed with a
//! type tag and a length, and object entries are visited in ascending key
//! order. Two documents hash equal exactly when they are structurally equal.
//!
//! The envelope format:
//!
//! - strings: `B<byte-len>:` then the UTF-8 bytes
//! - integers: `I<len>:` then the decimal representation
//! - floats: `F` then 8 bytes of little-endian IEEE-754
//! - `true` / `false` / `null`: `T` / `F` / `N`
//! - arrays: `L<n>:` then each element
//! - objects: `D<n>:` then each key (as a string) and value, keys ascending

use std::sync::LazyLock;

use base64::Engine;
use base64::alphabet::Alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Digest text form: base64 with `-` in place of `/`, no padding.
/// A 256-bit digest always encodes to 43 characters.
static DIGEST_ENGINE: LazyLock<GeneralPurpose> = LazyLock::new(|| {
  let alphabet =
    Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+-")
      .expect("static alphabet is valid");
  GeneralPurpose::new(&alphabet, GeneralPurposeConfig::new().with_encode_padding(false))
});

/// Number of characters in a formatted digest.
pub const DIGEST_LEN: usize = 43;

/// Encode a raw SHA-256 digest in the standard hdist text form.
pub fn format_digest(raw: &[u8]) -> String {
  DIGEST_ENGINE.encode(raw)
}

/// Incrementally hashes JSON-like documents in the stable envelope format.
pub struct DocumentHasher {
  inner: Sha256,
}

impl DocumentHasher {
  pub fn new() -> Self {
    Self { inner: Sha256::new() }
  }

  /// Hash a document in one step.
  pub fn of(value: &Value) -> Self {
    let mut hasher = Self::new();
    hasher.update(value);
    hasher
  }

  fn tag(&mut self, tag: u8, len: usize) {
    self.inner.update(format!("{}{}:", tag as char, len).as_bytes());
  }

  /// Feed one value (recursively) into the hash.
  pub fn update(&mut self, value: &Value) {
    match value {
      Value::String(s) => {
        self.tag(b'B', s.len());
        self.inner.update(s.as_bytes());
      }
      Value::Number(n) => {
        if n.is_f64() {
          // n is finite by construction, as_f64 cannot fail here
          let bits = n.as_f64().unwrap_or(0.0).to_le_bytes();
          self.inner.update(b"F");
          self.inner.update(bits);
        } else {
          let s = n.to_string();
          self.tag(b'I', s.len());
          self.inner.update(s.as_bytes());
        }
      }
      Value::Array(items) => {
        self.tag(b'L', items.len());
        for item in items {
          self.update(item);
        }
      }
      Value::Object(entries) => {
        self.tag(b'D', entries.len());
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        for key in keys {
          self.tag(b'B', key.len());
          self.inner.update(key.as_bytes());
          self.update(&entries[key]);
        }
      }
      Value::Bool(true) => self.inner.update(b"T"),
      Value::Bool(false) => self.inner.update(b"F"),
      Value::Null => self.inner.update(b"N"),
    }
  }

  /// Finish and return the raw 32-byte digest.
  pub fn raw_digest(self) -> [u8; 32] {
    self.inner.finalize().into()
  }

  /// Finish and return the 43-character digest text form.
  pub fn format_digest(self) -> String {
    format_digest(&self.raw_digest())
  }
}

impl Default for DocumentHasher {
  fn default() -> Self {
    Self::new()
  }
}
