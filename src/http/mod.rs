//! A small HTTP/1.x daemon on top of the I/O engine.
//!
//! [`HttpServer`] listens on both address families, parses one request
//! per connection (request line, headers, `Content-Length` body) and
//! hands it to a user handler, which responds through
//! [`HttpSession::respond`] or [`HttpSession::respond_raw`]. Response
//! data is written strictly in the order it was enqueued, one write in
//! flight at a time, and the connection closes once the final write
//! drains.
//!
//! Not supported, by design: persistent connections, chunked transfer,
//! pipelining, TLS.

mod server;
mod session;

pub use self::server::{HttpConfig, HttpHandler, HttpServer};
pub use self::session::HttpSession;

/// Request methods the daemon recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// TRACE
    Trace,
}

impl Method {
    /// Maps a request-line token, case-insensitively.
    pub(crate) fn from_token(token: &str) -> Option<Method> {
        if token.eq_ignore_ascii_case("GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case("HEAD") {
            Some(Method::Head)
        } else if token.eq_ignore_ascii_case("POST") {
            Some(Method::Post)
        } else if token.eq_ignore_ascii_case("PUT") {
            Some(Method::Put)
        } else if token.eq_ignore_ascii_case("DELETE") {
            Some(Method::Delete)
        } else if token.eq_ignore_ascii_case("TRACE") {
            Some(Method::Trace)
        } else {
            None
        }
    }

    /// Whether the method carries a request body and therefore requires
    /// `Content-Length`.
    pub(crate) fn requires_body(self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

/// Protocol version of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    Http11,
}

impl Protocol {
    /// The version prefix [`HttpSession::respond`] writes before the
    /// caller's status line.
    pub(crate) fn prefix(self) -> &'static str {
        match self {
            Protocol::Http10 => "HTTP/1.0 ",
            Protocol::Http11 => "HTTP/1.1 ",
        }
    }
}

/// Emitted as soon as an HTTP/1.1 request line parses.
pub(crate) const CONTINUE_MSG: &str = "HTTP/1.1 100 Continue\r\n\r\n";

pub(crate) const BAD_REQUEST_MSG: &str = "HTTP/1.0 400 Bad Request\r\n\
     Content-type: text/html\r\n\
     Content-length: 121\r\n\
     \r\n\
     <HTML>\r\n\
     \x20 <HEAD>\r\n\
     \x20   <TITLE>Bad Request</TITLE>\r\n\
     \x20 </HEAD>\r\n\
     \x20 <BODY>\r\n\
     \x20   <P>Invalid HTTP request.\r\n\
     \x20 </BODY>\r\n\
     </HTML>\r\n\
     \r\n";

pub(crate) const LENGTH_REQUIRED_MSG: &str = "HTTP/1.0 411 Length Required\r\n\
     Content-type: text/html\r\n\
     Content-length: 146\r\n\
     \r\n\
     <HTML>\r\n\
     \x20 <HEAD>\r\n\
     \x20   <TITLE>Length Required</TITLE>\r\n\
     \x20 </HEAD>\r\n\
     \x20 <BODY>\r\n\
     \x20   <P>HTTP request missing Content-Length field.\r\n\
     \x20 </BODY>\r\n\
     </HTML>\r\n\
     \r\n";

pub(crate) const NOT_IMPLEMENTED_MSG: &str = "HTTP/1.0 501 Method Not Implemented\r\n\
     Content-Type: text/html\r\n\
     Content-Length: 145\r\n\
     \r\n\
     <HTML>\r\n\
     \x20 <HEAD>\r\n\
     \x20   <TITLE>Method Not Implemented</TITLE>\r\n\
     \x20 </HEAD>\r\n\
     \x20 <BODY>\r\n\
     \x20   <P>HTTP request method not supported.\r\n\
     \x20 </BODY>\r\n\
     </HTML>\r\n\
     \r\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tokens_are_case_insensitive() {
        assert_eq!(Method::from_token("get"), Some(Method::Get));
        assert_eq!(Method::from_token("Post"), Some(Method::Post));
        assert_eq!(Method::from_token("DELETE"), Some(Method::Delete));
        assert_eq!(Method::from_token("TRACE"), Some(Method::Trace));
        assert_eq!(Method::from_token("FOO"), None);
    }

    #[test]
    fn delete_and_trace_are_distinct_and_body_free() {
        assert_ne!(Method::Delete, Method::Put);
        assert_ne!(Method::Trace, Method::Put);
        assert!(!Method::Delete.requires_body());
        assert!(!Method::Trace.requires_body());
        assert!(Method::Post.requires_body());
        assert!(Method::Put.requires_body());
    }

    #[test]
    fn canned_messages_are_wellformed() {
        for msg in [BAD_REQUEST_MSG, LENGTH_REQUIRED_MSG, NOT_IMPLEMENTED_MSG] {
            assert!(msg.starts_with("HTTP/1.0 "));
            assert!(msg.contains("\r\n\r\n"));
        }
        assert_eq!(CONTINUE_MSG.len(), 25);
    }
}
