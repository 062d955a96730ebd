//! Ordered, case-preserving header list
use bytes::Bytes;
use std::fmt;

/// A single header field as it appeared on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderField {
  name: String,
  value: Bytes,
}

impl HeaderField {
  /// The header name with its original case.
  pub fn name(&self) -> &str {
    &self.name
  }
  /// Raw header value.
  pub fn value(&self) -> &[u8] {
    &self.value
  }
  /// Header value as text, if it is valid UTF-8.
  pub fn value_str(&self) -> Option<&str> {
    std::str::from_utf8(&self.value).ok()
  }
}

impl fmt::Debug for HeaderField {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.name, String::from_utf8_lossy(&self.value))
  }
}

/// Header fields in wire order.
///
/// Lookups compare names ASCII case-insensitively; the original spelling is
/// kept for serialization. Duplicate names are preserved in order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
  fields: Vec<HeaderField>,
}

impl Headers {
  /// Create an empty header list.
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of fields, counting duplicates.
  pub fn len(&self) -> usize {
    self.fields.len()
  }

  /// Whether there are no fields.
  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }

  /// First value for `name`.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .fields
      .iter()
      .find(|f| f.name.eq_ignore_ascii_case(name))
      .and_then(HeaderField::value_str)
  }

  /// First raw value for `name`.
  pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
    self
      .fields
      .iter()
      .find(|f| f.name.eq_ignore_ascii_case(name))
      .map(HeaderField::value)
  }

  /// All values for `name`, in order.
  pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .fields
      .iter()
      .filter(move |f| f.name.eq_ignore_ascii_case(name))
      .filter_map(HeaderField::value_str)
  }

  /// Whether a field named `name` exists.
  pub fn contains(&self, name: &str) -> bool {
    self.fields.iter().any(|f| f.name.eq_ignore_ascii_case(name))
  }

  /// Append a field after the existing ones, keeping duplicates.
  pub fn append(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
    self.fields.push(HeaderField {
      name: name.into(),
      value: value.into(),
    });
  }

  /// Set `name` to a single value.
  ///
  /// The first existing field keeps its position and spelling; later
  /// duplicates are removed. A missing field is appended.
  pub fn set(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
    let name = name.into();
    let value = value.into();
    match self
      .fields
      .iter()
      .position(|f| f.name.eq_ignore_ascii_case(&name))
    {
      Some(first) => {
        self.fields[first].value = value;
        let mut index = 0;
        self.fields.retain(|f| {
          let keep = index <= first || !f.name.eq_ignore_ascii_case(&name);
          index += 1;
          keep
        });
      }
      None => self.fields.push(HeaderField { name, value }),
    }
  }

  /// Remove every field named `name`, returning how many were removed.
  pub fn remove(&mut self, name: &str) -> usize {
    let before = self.fields.len();
    self.fields.retain(|f| !f.name.eq_ignore_ascii_case(name));
    before - self.fields.len()
  }

  /// Iterate over fields in wire order.
  pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
    self.fields.iter()
  }

  /// Whether a comma separated header contains `token` (case-insensitive).
  pub fn has_token(&self, name: &str, token: &str) -> bool {
    self
      .get_all(name)
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case(token))
  }

  pub(crate) fn encoded_len(&self) -> usize {
    self
      .fields
      .iter()
      .map(|f| f.name.len() + f.value.len() + 4)
      .sum()
  }
}

impl fmt::Debug for Headers {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.fields.iter()).finish()
  }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
  N: Into<String>,
  V: Into<Bytes>,
{
  fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
    let mut headers = Headers::new();
    for (name, value) in iter {
      headers.append(name, value);
    }
    headers
  }
}

impl<'a> IntoIterator for &'a Headers {
  type Item = &'a HeaderField;
  type IntoIter = std::slice::Iter<'a, HeaderField>;

  fn into_iter(self) -> Self::IntoIter {
    self.fields.iter()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> Headers {
    Headers::from_iter([
      ("Host", "example.com"),
      ("Set-Cookie", "a=1"),
      ("X-Trace", "t"),
      ("set-cookie", "b=2"),
    ])
  }

  #[test]
  fn lookup_is_case_insensitive() {
    let h = sample();
    assert_eq!(h.get("host"), Some("example.com"));
    assert_eq!(h.get("HOST"), Some("example.com"));
    assert!(h.contains("x-trace"));
    assert_eq!(h.get_all("SET-COOKIE").collect::<Vec<_>>(), vec!["a=1", "b=2"]);
  }

  #[test]
  fn set_keeps_first_position_and_case() {
    let mut h = sample();
    h.set("SET-COOKIE", "c=3");
    let names: Vec<_> = h.iter().map(|f| f.name().to_string()).collect();
    assert_eq!(names, vec!["Host", "Set-Cookie", "X-Trace"]);
    assert_eq!(h.get("set-cookie"), Some("c=3"));
  }

  #[test]
  fn set_appends_missing() {
    let mut h = sample();
    h.set("Content-Length", "4");
    assert_eq!(h.iter().last().map(|f| f.name()), Some("Content-Length"));
  }

  #[test]
  fn remove_drops_duplicates() {
    let mut h = sample();
    assert_eq!(h.remove("set-cookie"), 2);
    assert_eq!(h.len(), 2);
  }

  #[test]
  fn token_lists() {
    let h = Headers::from_iter([("Connection", "keep-alive, Upgrade")]);
    assert!(h.has_token("connection", "upgrade"));
    assert!(!h.has_token("connection", "close"));
  }
}
