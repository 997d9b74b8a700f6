/// A resource path, held as its segments.
///
/// Matching is case-sensitive string equality, segment by segment;
/// `oic/sec/doxm` and `oic/sec/DOXM` are different resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path(Vec<String>);

impl Path {
  /// The segments of this path
  pub fn segments(&self) -> &[String] {
    &self.0
  }

  /// Does this path name the same resource as `segments`?
  pub fn matches<S: AsRef<str>>(&self, segments: &[S]) -> bool {
    self.0.len() == segments.len()
    && self.0
           .iter()
           .zip(segments.iter())
           .all(|(a, b)| a == b.as_ref())
  }

  /// Render with `/` separators (no leading slash)
  pub fn to_string(&self) -> String {
    self.0.join("/")
  }
}

impl<S: AsRef<str>> From<S> for Path {
  fn from(s: S) -> Self {
    Path(s.as_ref()
          .split('/')
          .filter(|seg| !seg.is_empty())
          .map(String::from)
          .collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_ignores_slashes() {
    assert_eq!(Path::from("/oic/sec/doxm/"), Path::from("oic/sec/doxm"));
    assert_eq!(Path::from("oic/sec/doxm").segments(),
               &["oic".to_string(), "sec".to_string(), "doxm".to_string()]);
  }

  #[test]
  fn matching_is_case_sensitive() {
    let path = Path::from("oic/sec/doxm");
    assert!(path.matches(&["oic", "sec", "doxm"]));
    assert!(!path.matches(&["oic", "sec", "DOXM"]));
    assert!(!path.matches(&["oic", "sec"]));
  }
}
