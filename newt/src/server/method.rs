use newt_msg::Code;

/// A request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Method {
  /// 0.01 GET
  Get,
  /// 0.02 PUT
  Put,
  /// 0.03 POST
  Post,
  /// 0.04 DELETE
  Delete,
}

impl Method {
  /// The message code for this method
  pub fn code(&self) -> Code {
    match self {
      | Method::Get => Code::GET,
      | Method::Put => Code::PUT,
      | Method::Post => Code::POST,
      | Method::Delete => Code::DELETE,
    }
  }

  /// Which method (if any) does a message code name?
  pub fn from_code(code: Code) -> Option<Method> {
    match (code.class, code.detail) {
      | (0, 1) => Some(Method::Get),
      | (0, 2) => Some(Method::Put),
      | (0, 3) => Some(Method::Post),
      | (0, 4) => Some(Method::Delete),
      | _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn code_round_trip() {
    for m in [Method::Get, Method::Put, Method::Post, Method::Delete] {
      assert_eq!(Method::from_code(m.code()), Some(m));
    }

    assert_eq!(Method::from_code(Code::new(2, 5)), None);
    assert_eq!(Method::from_code(Code::EMPTY), None);
  }
}
