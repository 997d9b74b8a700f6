/// # Message Code
///
/// The code is a single byte split into a 3-bit class and 5-bit detail,
/// customarily written `c.dd` (e.g. `2.05` for Content).
///
/// |class|meaning|
/// |---|---|
/// |`0`|Message is a request (detail carries the method)|
/// |`2`|Message is a success response|
/// |`4`|Message is a client error response|
/// |`5`|Message is a server error response|
///
/// ```
/// use newt_msg::Code;
///
/// assert_eq!(Code { class: 2,
///                   detail: 5 }.to_string(),
///            "2.05".to_string());
/// ```
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Code {
  /// Identifies the message as request or response, and for responses
  /// the class of status
  pub class: u8,

  /// 2-digit integer (range `[0, 32)`) that provides granular information about the response status.
  ///
  /// Will always be `0` for empty messages.
  pub detail: u8,
}

/// Whether a code is for a request, response, or empty message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeKind {
  /// A request code (0.xx)
  Request,
  /// A response code ([2-5].xx)
  Response,
  /// EMPTY (0.00)
  Empty,
}

impl Code {
  /// Create a new Code
  ///
  /// ```
  /// use newt_msg::Code;
  ///
  /// let content = Code::new(2, 05);
  /// ```
  pub const fn new(class: u8, detail: u8) -> Self {
    Self { class, detail }
  }

  /// Get the human string representation of a message code
  ///
  /// # Returns
  /// A `char` array
  ///
  /// This is to avoid unnecessary heap allocation,
  /// you can create a `String` with `FromIterator::<String>::from_iter`,
  /// or use the provided `ToString` implementation.
  pub fn to_human(&self) -> [char; 4] {
    let to_char = |d: u8| char::from_digit(d.into(), 10).unwrap();
    [to_char(self.class),
     '.',
     to_char(self.detail / 10),
     to_char(self.detail % 10)]
  }

  /// Get whether this code is for a request, response, or empty message
  ///
  /// ```
  /// use newt_msg::{Code, CodeKind};
  ///
  /// let empty: Code = Code::new(0, 0);
  /// assert_eq!(empty.kind(), CodeKind::Empty);
  ///
  /// let req = Code::new(0, 1); // GET
  /// assert_eq!(req.kind(), CodeKind::Request);
  ///
  /// let resp = Code::new(2, 5); // OK CONTENT
  /// assert_eq!(resp.kind(), CodeKind::Response);
  /// ```
  pub fn kind(&self) -> CodeKind {
    match (self.class, self.detail) {
      | (0, 0) => CodeKind::Empty,
      | (0, _) => CodeKind::Request,
      | _ => CodeKind::Response,
    }
  }

  /// 0.00 EMPTY
  pub const EMPTY: Self = Self::new(0, 0);

  /// 0.01 GET
  pub const GET: Self = Self::new(0, 1);

  /// 0.02 PUT
  pub const PUT: Self = Self::new(0, 2);

  /// 0.03 POST
  pub const POST: Self = Self::new(0, 3);

  /// 0.04 DELETE
  pub const DELETE: Self = Self::new(0, 4);
}

/// Response codes
#[allow(clippy::zero_prefixed_literal)]
pub mod resp_code {
  use super::Code;

  // 2.xx
  /// 2.00 OK
  pub const OK: Code = Code::new(2, 00);
  /// 2.01 Created
  pub const CREATED: Code = Code::new(2, 01);
  /// 2.02 Deleted
  pub const DELETED: Code = Code::new(2, 02);
  /// 2.03 Valid
  pub const VALID: Code = Code::new(2, 03);
  /// 2.04 Changed
  pub const CHANGED: Code = Code::new(2, 04);
  /// 2.05 Content
  pub const CONTENT: Code = Code::new(2, 05);

  // 4.xx
  /// 4.00 Bad Request
  pub const BAD_REQUEST: Code = Code::new(4, 00);
  /// 4.01 Unauthorized
  pub const UNAUTHORIZED: Code = Code::new(4, 01);
  /// 4.02 Bad Option
  pub const BAD_OPTION: Code = Code::new(4, 02);
  /// 4.03 Forbidden
  pub const FORBIDDEN: Code = Code::new(4, 03);
  /// 4.04 Not Found
  pub const NOT_FOUND: Code = Code::new(4, 04);
  /// 4.05 Method Not Allowed
  pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 05);
  /// 4.06 Not Acceptable
  pub const NOT_ACCEPTABLE: Code = Code::new(4, 06);
  /// 4.12 Precondition Failed
  pub const PRECONDITION_FAILED: Code = Code::new(4, 12);
  /// 4.13 Request Entity Too Large
  pub const REQUEST_TOO_LARGE: Code = Code::new(4, 13);

  // 5.xx
  /// 5.00 Internal Server Error
  pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 00);
  /// 5.01 Not Implemented
  pub const NOT_IMPLEMENTED: Code = Code::new(5, 01);
  /// 5.02 Bad Gateway
  pub const BAD_GATEWAY: Code = Code::new(5, 02);
  /// 5.03 Service Unavailable
  pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 03);
  /// 5.04 Gateway Timeout
  pub const GATEWAY_TIMEOUT: Code = Code::new(5, 04);
  /// 5.05 Proxying Not Supported
  pub const PROXYING_NOT_SUPPORTED: Code = Code::new(5, 05);
}

impl ToString for Code {
  fn to_string(&self) -> String {
    String::from_iter(self.to_human())
  }
}

impl From<u8> for Code {
  fn from(b: u8) -> Self {
    // xxxyyyyy

    // xxx => class
    let class = b >> 5;

    // yyyyy => detail
    let detail = b & 0b00011111;

    Code { class, detail }
  }
}

impl From<Code> for u8 {
  fn from(code: Code) -> u8 {
    let class = (code.class << 5) & 0b11100000;
    let detail = code.detail & 0b00011111;

    class | detail
  }
}
