//! Resources served over CoAP: registration, method dispatch, and
//! the synthesized `/.well-known/core` listing (RFC 6690).

use newt_msg::{resp_code, Code, ContentFormat, Message};

use crate::net::Addrd;

/// request methods
pub mod method;
/// resource paths
pub mod path;

pub use method::Method;
pub use path::Path;

/// What a handler hands back; the engine turns it into a full
/// response message (ACK piggyback or fresh NON) with the right
/// token & message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
  /// Response code
  pub code: Code,
  /// Response body
  pub payload: Vec<u8>,
  /// Content-Format of the body, if any
  pub format: Option<ContentFormat>,
}

impl Reply {
  /// An empty-bodied reply
  pub fn code_only(code: Code) -> Self {
    Reply { code,
            payload: vec![],
            format: None }
  }

  /// 2.05 Content with a body
  pub fn content(payload: Vec<u8>, format: ContentFormat) -> Self {
    Reply { code: resp_code::CONTENT,
            payload,
            format: Some(format) }
  }
}

/// What a resource will let the network do to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
  /// Listed in `/.well-known/core`
  pub discoverable: bool,
  /// Clients may register observations (RFC 7641)
  pub observable: bool,
  /// Requests over clear transport are refused with 4.01
  pub secure_only: bool,
  /// An inactive resource dispatches like it doesn't exist
  pub active: bool,
}

/// Handler for one method on one resource.
///
/// Owns its captured environment; the "callback + user data" pairs
/// of C-style stacks collapse into the closure.
pub type Handler = Box<dyn FnMut(Addrd<&Message>) -> Reply + Send>;

/// A resource: a path, up to four method handlers, and flags.
pub struct Resource {
  path: Path,
  flags: Flags,
  get: Option<Handler>,
  put: Option<Handler>,
  post: Option<Handler>,
  delete: Option<Handler>,
  /// `rt` attribute in link-format listings
  resource_type: Option<String>,
  /// `if` attribute in link-format listings
  interface: Option<String>,
}

impl core::fmt::Debug for Resource {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Resource")
     .field("path", &self.path)
     .field("flags", &self.flags)
     .finish()
  }
}

impl Resource {
  /// A new active resource at `path` with no handlers
  pub fn new<P: Into<Path>>(path: P) -> Self {
    Resource { path: path.into(),
               flags: Flags { active: true,
                              ..Default::default() },
               get: None,
               put: None,
               post: None,
               delete: None,
               resource_type: None,
               interface: None }
  }

  /// This resource's path
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// This resource's flags
  pub fn flags(&self) -> Flags {
    self.flags
  }

  /// List in `/.well-known/core`
  pub fn discoverable(mut self) -> Self {
    self.flags.discoverable = true;
    self
  }

  /// Accept observation registrations
  pub fn observable(mut self) -> Self {
    self.flags.observable = true;
    self
  }

  /// Refuse requests arriving over clear transport
  pub fn secure_only(mut self) -> Self {
    self.flags.secure_only = true;
    self
  }

  /// Set the `rt` link attribute
  pub fn resource_type<S: Into<String>>(mut self, rt: S) -> Self {
    self.resource_type = Some(rt.into());
    self
  }

  /// Set the `if` link attribute
  pub fn interface<S: Into<String>>(mut self, ifc: S) -> Self {
    self.interface = Some(ifc.into());
    self
  }

  /// Handle GET with `f`
  pub fn on_get(mut self, f: Handler) -> Self {
    self.get = Some(f);
    self
  }

  /// Handle PUT with `f`
  pub fn on_put(mut self, f: Handler) -> Self {
    self.put = Some(f);
    self
  }

  /// Handle POST with `f`
  pub fn on_post(mut self, f: Handler) -> Self {
    self.post = Some(f);
    self
  }

  /// Handle DELETE with `f`
  pub fn on_delete(mut self, f: Handler) -> Self {
    self.delete = Some(f);
    self
  }

  fn handler_mut(&mut self, method: Method) -> Option<&mut Handler> {
    match method {
      | Method::Get => self.get.as_mut(),
      | Method::Put => self.put.as_mut(),
      | Method::Post => self.post.as_mut(),
      | Method::Delete => self.delete.as_mut(),
    }
  }

  fn link_entry(&self) -> String {
    let mut entry = format!("</{}>", self.path.to_string());
    if let Some(rt) = &self.resource_type {
      entry.push_str(&format!(";rt=\"{}\"", rt));
    }
    if let Some(ifc) = &self.interface {
      entry.push_str(&format!(";if=\"{}\"", ifc));
    }
    if self.flags.observable {
      entry.push_str(";obs");
    }
    entry
  }
}

/// The set of resources one CoAP endpoint serves.
#[derive(Debug, Default)]
pub struct Server {
  resources: Vec<Resource>,
}

/// Errors from [`Server::unregister`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterError {
  /// No resource is registered at that path
  NotRegistered,
}

impl Server {
  /// Register a resource, taking ownership of it.
  ///
  /// Returns `false` (and drops the resource) when its path is
  /// already taken, or when it tries to shadow the synthesized
  /// `/.well-known/core`.
  pub fn register(&mut self, resource: Resource) -> bool {
    let well_known = resource.path.matches(&[".well-known", "core"]);
    let taken = self.resources
                    .iter()
                    .any(|r| r.path == resource.path);

    if well_known || taken {
      log::warn!("refusing to register resource at /{}",
                 resource.path.to_string());
      return false;
    }

    log::debug!("registered /{}", resource.path.to_string());
    self.resources.push(resource);
    true
  }

  /// Remove the resource at `path`
  pub fn unregister(&mut self, path: &Path) -> Result<(), UnregisterError> {
    match self.resources.iter().position(|r| &r.path == path) {
      | Some(ix) => {
        self.resources.remove(ix);
        Ok(())
      },
      | None => Err(UnregisterError::NotRegistered),
    }
  }

  /// Find the active resource at `segments`
  pub fn find<S: AsRef<str>>(&self, segments: &[S]) -> Option<&Resource> {
    self.resources
        .iter()
        .filter(|r| r.flags.active)
        .find(|r| r.path.matches(segments))
  }

  /// The RFC 6690 link-format body listing every discoverable
  /// resource
  pub fn link_format(&self) -> String {
    self.resources
        .iter()
        .filter(|r| r.flags.active && r.flags.discoverable)
        .map(Resource::link_entry)
        .collect::<Vec<_>>()
        .join(",")
  }

  /// Dispatch a request to the handler registered for its path &
  /// method.
  ///
  /// `secure_transport` says whether the request arrived over DTLS;
  /// `secure_only` resources refuse clear-text requests with 4.01.
  pub fn dispatch(&mut self, req: Addrd<&Message>, secure_transport: bool) -> Reply {
    let segments: Vec<&str> = match req.data().path() {
      | Ok(segments) => segments,
      | Err(_) => return Reply::code_only(resp_code::BAD_OPTION),
    };

    let method = match Method::from_code(req.data().code) {
      | Some(method) => method,
      | None => return Reply::code_only(resp_code::METHOD_NOT_ALLOWED),
    };

    if segments.len() == 2 && segments[0] == ".well-known" && segments[1] == "core" {
      return match method {
        | Method::Get => Reply::content(self.link_format().into_bytes(),
                                        ContentFormat::LinkFormat),
        | _ => Reply::code_only(resp_code::METHOD_NOT_ALLOWED),
      };
    }

    let resource = match self.resources
                             .iter_mut()
                             .filter(|r| r.flags.active)
                             .find(|r| r.path.matches(&segments))
    {
      | Some(resource) => resource,
      | None => return Reply::code_only(resp_code::NOT_FOUND),
    };

    if resource.flags.secure_only && !secure_transport {
      return Reply::code_only(resp_code::UNAUTHORIZED);
    }

    match resource.handler_mut(method) {
      | Some(handler) => handler(req),
      | None => Reply::code_only(resp_code::METHOD_NOT_ALLOWED),
    }
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::{Id, Token, Type};

  use super::*;
  use crate::test::dummy_addr;

  fn get(path: &str) -> Message {
    let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token(Default::default()));
    msg.set_path(path);
    msg
  }

  fn hello_server() -> Server {
    let mut server = Server::default();
    server.register(Resource::new("hello").discoverable()
                                          .resource_type("x.hello")
                                          .on_get(Box::new(|_| {
                                            Reply::content(b"world".to_vec(),
                                                           ContentFormat::Text)
                                          })));
    server
  }

  #[test]
  fn dispatch_get() {
    let mut server = hello_server();
    let req = get("hello");
    let reply = server.dispatch(Addrd(&req, dummy_addr()), false);
    assert_eq!(reply.code, resp_code::CONTENT);
    assert_eq!(reply.payload, b"world");
  }

  #[test]
  fn missing_resource_is_404() {
    let mut server = hello_server();
    let req = get("nope");
    assert_eq!(server.dispatch(Addrd(&req, dummy_addr()), false).code,
               resp_code::NOT_FOUND);
  }

  #[test]
  fn missing_handler_is_405() {
    let mut server = hello_server();
    let mut req = get("hello");
    req.code = Code::PUT;
    assert_eq!(server.dispatch(Addrd(&req, dummy_addr()), false).code,
               resp_code::METHOD_NOT_ALLOWED);
  }

  #[test]
  fn secure_only_refuses_clear_transport() {
    let mut server = Server::default();
    server.register(Resource::new("s").secure_only()
                                      .on_get(Box::new(|_| {
                                        Reply::code_only(resp_code::CONTENT)
                                      })));

    let req = get("s");
    assert_eq!(server.dispatch(Addrd(&req, dummy_addr()), false).code,
               resp_code::UNAUTHORIZED);
    assert_eq!(server.dispatch(Addrd(&req, dummy_addr()), true).code,
               resp_code::CONTENT);
  }

  #[test]
  fn well_known_core_lists_discoverables() {
    let mut server = hello_server();
    server.register(Resource::new("secret").on_get(Box::new(|_| {
                                             Reply::code_only(resp_code::CONTENT)
                                           })));

    let req = get(".well-known/core");
    let reply = server.dispatch(Addrd(&req, dummy_addr()), false);

    assert_eq!(reply.code, resp_code::CONTENT);
    assert_eq!(reply.format, Some(ContentFormat::LinkFormat));

    let body = String::from_utf8(reply.payload).unwrap();
    assert_eq!(body, "</hello>;rt=\"x.hello\"");
  }

  #[test]
  fn cannot_register_well_known_core() {
    let mut server = Server::default();
    assert!(!server.register(Resource::new(".well-known/core")));
  }

  #[test]
  fn cannot_register_duplicate_path() {
    let mut server = hello_server();
    assert!(!server.register(Resource::new("hello")));
  }

  #[test]
  fn unregister() {
    let mut server = hello_server();
    assert!(server.unregister(&Path::from("hello")).is_ok());
    assert_eq!(server.unregister(&Path::from("hello")),
               Err(UnregisterError::NotRegistered));

    let req = get("hello");
    assert_eq!(server.dispatch(Addrd(&req, dummy_addr()), false).code,
               resp_code::NOT_FOUND);
  }
}
