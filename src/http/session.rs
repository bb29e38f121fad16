use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use log::{trace, warn};

use crate::engine::{AioEngine, AioSocket, WriteBuf};
use crate::error::{Error, ErrorCode};
use crate::http::{
    HttpHandler, Method, Protocol, BAD_REQUEST_MSG, CONTINUE_MSG, LENGTH_REQUIRED_MSG,
    NOT_IMPLEMENTED_MSG,
};
use crate::inet::InetAddress;

/// Parser bounds, taken from the server configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Limits {
    pub(crate) max_line: usize,
    pub(crate) max_headers: usize,
}

/// One HTTP exchange on one accepted connection.
///
/// Created by the server when its listener accepts, destroyed after the
/// final response write (or a fatal error) closes the socket. The user
/// handler runs on an engine worker once the full request is in; it
/// inspects the request through the accessors and answers with
/// [`respond`](HttpSession::respond) or
/// [`respond_raw`](HttpSession::respond_raw) — possibly later, from
/// another thread.
pub struct HttpSession {
    me: Weak<HttpSession>,
    engine: AioEngine,
    handler: HttpHandler,
    socket: Arc<AioSocket>,
    limits: Limits,
    parse: Mutex<ParseState>,
    write: Mutex<WriteState>,
}

/// Line-buffered parse state; touched only from the read-completion
/// chain, but shared mutability still wants the mutex.
struct ParseState {
    phase: Phase,
    method: Method,
    protocol: Protocol,
    url: String,
    header_lines: Vec<String>,
    content_len: usize,
    line: LineBuffer,
}

enum Phase {
    ReadingFirstLine,
    ReadingHeaders,
    ReadingBody { content: Vec<u8>, filled: usize },
    Responding { body: Vec<u8> },
}

struct WriteState {
    queue: VecDeque<WriteEntry>,
    /// True iff a write is outstanding for this session.
    active: bool,
    /// True once the final entry has been enqueued.
    complete: bool,
    /// Set on fatal errors; further enqueues are rejected.
    failed: bool,
    response_headers: Vec<(String, String)>,
}

struct WriteEntry {
    /// Taken out while the entry's bytes are with the engine.
    data: Option<WriteBuf>,
    len: usize,
    last: bool,
}

/// What the state machine wants after consuming a read completion.
enum Step {
    /// Re-arm a read of this many bytes.
    Read(usize),
    /// Request complete; run the user handler.
    RunHandler,
    /// No further reads (responding, or the request was rejected).
    Stop,
}

/// Why a request was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reject {
    BadRequest,
    NotImplemented,
}

impl HttpSession {
    pub(crate) fn new(engine: AioEngine, handler: HttpHandler, limits: Limits) -> Arc<HttpSession> {
        Arc::new_cyclic(|me| HttpSession {
            me: me.clone(),
            engine,
            handler,
            socket: Arc::new(AioSocket::new()),
            limits,
            parse: Mutex::new(ParseState {
                phase: Phase::ReadingFirstLine,
                method: Method::Get,
                protocol: Protocol::Http10,
                url: String::new(),
                header_lines: Vec::new(),
                content_len: 0,
                line: LineBuffer::new(limits.max_line),
            }),
            write: Mutex::new(WriteState {
                queue: VecDeque::new(),
                active: false,
                complete: false,
                failed: false,
                response_headers: Vec::new(),
            }),
        })
    }

    pub(crate) fn socket(&self) -> &Arc<AioSocket> {
        &self.socket
    }

    /// Arms the first read after the accept completes.
    pub(crate) fn begin(&self) {
        let space = self.parse.lock().unwrap().line.space();
        if self.submit_read(space).is_err() {
            self.close_quietly();
        }
    }

    // Request accessors, valid once the handler runs.

    /// The request method.
    pub fn method(&self) -> Method {
        self.parse.lock().unwrap().method
    }

    /// The request URL, verbatim from the request line.
    pub fn url(&self) -> String {
        self.parse.lock().unwrap().url.clone()
    }

    /// The request protocol version.
    pub fn protocol(&self) -> Protocol {
        self.parse.lock().unwrap().protocol
    }

    /// The raw header lines, continuations folded into their line.
    pub fn header_lines(&self) -> Vec<String> {
        self.parse.lock().unwrap().header_lines.clone()
    }

    /// The request body.
    pub fn body(&self) -> Vec<u8> {
        match &self.parse.lock().unwrap().phase {
            Phase::Responding { body } => body.clone(),
            _ => Vec::new(),
        }
    }

    /// The request body length.
    pub fn body_length(&self) -> usize {
        match &self.parse.lock().unwrap().phase {
            Phase::Responding { body } => body.len(),
            _ => 0,
        }
    }

    /// The connected peer.
    pub fn peer_address(&self) -> Option<(InetAddress, u16)> {
        self.socket.peer_address()
    }

    // Response API.

    /// Enqueues a complete, raw HTTP response and marks the response as
    /// finished; the connection closes once everything is on the wire.
    pub fn respond_raw(&self, data: impl Into<WriteBuf>) -> Result<(), Error> {
        self.add_write_data(data.into(), true)
    }

    /// Records a response header for later use.
    ///
    /// `Date` and `Content-Length` are managed automatically and may not
    /// be set. Stored values are not yet serialized by
    /// [`respond`](HttpSession::respond), which writes exactly the bytes
    /// it is given.
    pub fn set_response_header(&self, key: &str, value: &str) -> Result<(), Error> {
        const FP: &str = "HttpSession::set_response_header";
        if key.is_empty()
            || key.eq_ignore_ascii_case("Date")
            || key.eq_ignore_ascii_case("Content-Length")
        {
            return Err(Error::new(ErrorCode::InvalidArgument, FP));
        }
        self.write
            .lock()
            .unwrap()
            .response_headers
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    /// Responds with `status_line` (e.g. `"200 OK"`) and `body`.
    ///
    /// Enqueues the protocol prefix matching the request, the status
    /// line, then the body, and marks the response as finished.
    pub fn respond(&self, status_line: &str, body: impl Into<WriteBuf>) -> Result<(), Error> {
        let prefix = self.protocol().prefix();
        self.add_write_data(WriteBuf::Static(prefix.as_bytes()), false)?;
        self.add_write_data(WriteBuf::Owned(status_line.as_bytes().to_vec()), false)?;
        self.add_write_data(body.into(), true)
    }

    /// Appends one entry to the response queue and starts the write
    /// chain if idle. FIFO order on the wire is guaranteed by keeping at
    /// most one write in flight.
    pub(crate) fn add_write_data(&self, data: WriteBuf, last: bool) -> Result<(), Error> {
        const FP: &str = "HttpSession::respond";

        let mut write = self.write.lock().unwrap();
        if write.failed {
            return Err(Error::new(ErrorCode::ConnectionShutdown, FP));
        }
        let len = data.len();
        write.queue.push_back(WriteEntry {
            data: Some(data),
            len,
            last,
        });
        write.complete = last;

        if !write.active {
            write.active = true;
            let head = write.queue.front_mut().expect("just pushed");
            let buf = head.data.take().expect("head already in flight");
            drop(write);
            if let Err(err) = self.submit_write(buf) {
                self.fail_session();
                return Err(err);
            }
        }
        Ok(())
    }

    fn submit_write(&self, buf: WriteBuf) -> Result<(), Error> {
        // The operation holds a strong reference; the session lives for
        // exactly as long as something is in flight on its socket.
        let session = self.strong();
        self.engine.socket_write(&self.socket, buf, move |_sock, n, err| {
            session.write_finished(n, err);
        })
    }

    /// The owning `Arc`, for closures that must keep the session alive.
    fn strong(&self) -> Arc<HttpSession> {
        self.me.upgrade().expect("session method called during drop")
    }

    /// Write-completion driver: pop the head, start the next entry, and
    /// close once the final entry drains.
    fn write_finished(&self, written: usize, err: Error) {
        if err.is_set() {
            trace!("response write failed: {}", err);
            self.fail_session();
            return;
        }

        let mut write = self.write.lock().unwrap();
        let head = write.queue.pop_front();
        debug_assert_eq!(head.map(|entry| entry.len), Some(written));
        if let Some(next) = write.queue.front_mut() {
            let buf = next.data.take().expect("queued entry already in flight");
            drop(write);
            if self.submit_write(buf).is_err() {
                self.fail_session();
            }
        } else {
            write.active = false;
            let session_complete = write.complete;
            drop(write);
            if session_complete {
                self.close_quietly();
            }
        }
    }

    /// Fatal path: free queued entries without dispatch and close.
    fn fail_session(&self) {
        let mut write = self.write.lock().unwrap();
        write.failed = true;
        write.active = false;
        write.queue.clear();
        drop(write);
        self.close_quietly();
    }

    fn close_quietly(&self) {
        // The close callback drops the last strong reference, ending the
        // session's life with the connection.
        let session = self.strong();
        let result = self.engine.socket_close(&self.socket, move |_sock, err| {
            if err.is_set() {
                trace!("session close reported: {}", err);
            }
            drop(session);
        });
        if let Err(err) = result {
            trace!("session close not submitted: {}", err);
        }
    }

    fn submit_read(&self, len: usize) -> Result<(), Error> {
        let session = self.strong();
        self.engine
            .socket_read(&self.socket, vec![0; len], move |_sock, buf, n, err| {
                session.on_read(buf, n, err);
            })
    }

    /// Read-completion driver for the session state machine.
    pub(crate) fn on_read(&self, buf: Vec<u8>, n: usize, err: Error) {
        if err.is_set() {
            trace!("session read failed: {}", err);
            self.close_quietly();
            return;
        }
        if n == 0 {
            trace!("peer closed connection mid-request");
            self.close_quietly();
            return;
        }

        let step = {
            let mut parse = self.parse.lock().unwrap();
            match &mut parse.phase {
                Phase::ReadingFirstLine | Phase::ReadingHeaders => parse.line.fill(&buf[..n]),
                Phase::ReadingBody { content, filled } => {
                    let space = content.len() - *filled;
                    let take = n.min(space);
                    content[*filled..*filled + take].copy_from_slice(&buf[..take]);
                    *filled += take;
                }
                Phase::Responding { .. } => return,
            }
            self.drive(&mut parse)
        };

        match step {
            Step::Read(len) => {
                if self.submit_read(len).is_err() {
                    self.close_quietly();
                }
            }
            Step::RunHandler => {
                if let Some(session) = self.me.upgrade() {
                    (self.handler)(&session);
                }
            }
            Step::Stop => {}
        }
    }

    /// Runs the parser as far as the buffered bytes allow.
    fn drive(&self, parse: &mut ParseState) -> Step {
        if let Phase::ReadingFirstLine = parse.phase {
            match parse.line.try_read_line() {
                LineStatus::Invalid => return self.reject(parse, Reject::BadRequest),
                LineStatus::Incomplete => return Step::Read(parse.line.space()),
                LineStatus::Complete(end) => {
                    let text = parse.line.take_line(end);
                    parse.line.flush_line();
                    trace!("request line: {}", text);
                    match parse_first_request_line(&text) {
                        Err(reject) => return self.reject(parse, reject),
                        Ok((method, url, protocol)) => {
                            parse.method = method;
                            parse.url = url;
                            parse.protocol = protocol;
                            if protocol == Protocol::Http11 {
                                let _ = self.add_write_data(
                                    WriteBuf::Static(CONTINUE_MSG.as_bytes()),
                                    false,
                                );
                            }
                            parse.phase = Phase::ReadingHeaders;
                        }
                    }
                }
            }
        }

        while let Phase::ReadingHeaders = parse.phase {
            match parse.line.try_read_line() {
                LineStatus::Invalid => return self.reject(parse, Reject::BadRequest),
                LineStatus::Incomplete => return Step::Read(parse.line.space()),
                LineStatus::Complete(end) => {
                    let text = parse.line.take_line(end);
                    parse.line.flush_line();

                    if text.is_empty() {
                        // Blank line: headers done.
                        match parse_headers(&parse.header_lines) {
                            Err(reject) => return self.reject(parse, reject),
                            Ok(content_len) => {
                                parse.content_len = content_len;
                                if content_len == 0 && parse.method.requires_body() {
                                    return self.reject_with(parse, LENGTH_REQUIRED_MSG);
                                }
                                let mut content = vec![0; content_len];
                                let buffered = parse.line.buffered();
                                let copyable = buffered.len().min(content_len);
                                content[..copyable].copy_from_slice(&buffered[..copyable]);
                                parse.line.clear();
                                parse.phase = Phase::ReadingBody {
                                    content,
                                    filled: copyable,
                                };
                            }
                        }
                    } else if text.starts_with(' ') || text.starts_with('\t') {
                        // Continuation of the previous header line.
                        match parse.header_lines.last_mut() {
                            None => return self.reject(parse, Reject::BadRequest),
                            Some(prev) => prev.push_str(&text),
                        }
                    } else {
                        if parse.header_lines.len() >= self.limits.max_headers {
                            return self.reject(parse, Reject::BadRequest);
                        }
                        parse.header_lines.push(text);
                    }
                }
            }
        }

        if let Phase::ReadingBody { content, filled } = &mut parse.phase {
            if *filled == content.len() {
                let body = std::mem::take(content);
                parse.phase = Phase::Responding { body };
                return Step::RunHandler;
            }
            return Step::Read(content.len() - *filled);
        }

        Step::Stop
    }

    fn reject(&self, parse: &mut ParseState, reject: Reject) -> Step {
        let msg = match reject {
            Reject::BadRequest => BAD_REQUEST_MSG,
            Reject::NotImplemented => NOT_IMPLEMENTED_MSG,
        };
        self.reject_with(parse, msg)
    }

    /// Queues a canned failure response and parks the session so no
    /// further read is armed; the write chain closes the connection.
    fn reject_with(&self, parse: &mut ParseState, msg: &'static str) -> Step {
        parse.phase = Phase::Responding { body: Vec::new() };
        if let Err(err) = self.add_write_data(WriteBuf::Static(msg.as_bytes()), true) {
            warn!("could not queue failure response: {}", err);
        }
        Step::Stop
    }
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("socket", &self.socket)
            .finish()
    }
}

/// Fixed-capacity scratch area holding unread request bytes up to the
/// next newline.
struct LineBuffer {
    buf: Vec<u8>,
    /// Scan cursor: bytes before it have been searched for a newline.
    index: usize,
    max: usize,
}

enum LineStatus {
    /// A full line ends at this offset (exclusive of line terminator).
    Complete(usize),
    Incomplete,
    Invalid,
}

impl LineBuffer {
    fn new(max: usize) -> LineBuffer {
        LineBuffer {
            buf: Vec::with_capacity(max),
            index: 0,
            max,
        }
    }

    /// Free space left for reads.
    fn space(&self) -> usize {
        self.max - self.buf.len()
    }

    fn fill(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.space());
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes not yet consumed by a completed line.
    fn buffered(&self) -> &[u8] {
        &self.buf
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.index = 0;
    }

    /// Scans for a newline from the cursor. Rejects control bytes other
    /// than `\r` and `\t` (NUL included, so raw request bytes can never
    /// reach OS interfaces), and over-long lines.
    fn try_read_line(&mut self) -> LineStatus {
        let mut i = self.index;
        while i < self.buf.len() {
            let c = self.buf[i];
            if c == b'\n' {
                let mut end = i;
                if i > 0 && self.buf[i - 1] == b'\r' {
                    end -= 1;
                }
                self.index = i + 1;
                return LineStatus::Complete(end);
            }
            if c < 0x20 && c != b'\r' && c != b'\t' {
                return LineStatus::Invalid;
            }
            i += 1;
        }
        self.index = i;
        if self.buf.len() == self.max {
            // No newline and nowhere left to read into: line too long.
            return LineStatus::Invalid;
        }
        LineStatus::Incomplete
    }

    /// The completed line's text. `end` comes from
    /// [`LineStatus::Complete`].
    fn take_line(&self, end: usize) -> String {
        String::from_utf8_lossy(&self.buf[..end]).into_owned()
    }

    /// Drops the consumed line, moving the remainder to the front.
    fn flush_line(&mut self) {
        self.buf.drain(..self.index);
        self.index = 0;
    }
}

/// Splits the request line into method, URL and protocol tokens.
fn parse_first_request_line(line: &str) -> Result<(Method, String, Protocol), Reject> {
    let mut tokens = line.split_ascii_whitespace();
    let (Some(method_token), Some(url), Some(protocol_token), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(Reject::BadRequest);
    };

    let method = Method::from_token(method_token).ok_or(Reject::NotImplemented)?;
    let protocol = if protocol_token.eq_ignore_ascii_case("HTTP/1.0") {
        Protocol::Http10
    } else if protocol_token.eq_ignore_ascii_case("HTTP/1.1") {
        Protocol::Http11
    } else {
        return Err(Reject::NotImplemented);
    };

    Ok((method, url.to_string(), protocol))
}

/// Case-insensitive header key match up to the colon; returns the value
/// with leading whitespace skipped, or `None` on mismatch.
///
/// `header_match_extract("Content-Length: 400", "content-length")`
/// yields `Some("400")`.
fn header_match_extract<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let bytes = line.as_bytes();
    let key_bytes = key.as_bytes();

    let mut i = 0;
    while i < key_bytes.len() {
        let b = *bytes.get(i)?;
        if b == b':' || b.is_ascii_whitespace() {
            return None;
        }
        if !b.eq_ignore_ascii_case(&key_bytes[i]) {
            return None;
        }
        i += 1;
    }
    while bytes.get(i).is_some_and(|b| *b == b' ' || *b == b'\t') {
        i += 1;
    }
    if *bytes.get(i)? != b':' {
        return None;
    }
    i += 1;
    while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
        i += 1;
    }
    Some(&line[i..])
}

/// Scans the stored header lines for the fields the daemon needs —
/// currently just `Content-Length`, parsed as a decimal u32 (last
/// occurrence wins).
fn parse_headers(header_lines: &[String]) -> Result<usize, Reject> {
    let mut content_len = 0usize;
    for line in header_lines {
        if let Some(value) = header_match_extract(line, "Content-Length") {
            if value.is_empty() {
                continue;
            }
            let parsed: u32 = value.trim().parse().map_err(|_| Reject::BadRequest)?;
            content_len = parsed as usize;
        }
    }
    Ok(content_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_buffer_with(bytes: &[u8], max: usize) -> LineBuffer {
        let mut line = LineBuffer::new(max);
        line.fill(bytes);
        line
    }

    #[test]
    fn reads_crlf_and_bare_lf_lines() {
        let mut line = line_buffer_with(b"GET / HTTP/1.0\r\nrest", 64);
        match line.try_read_line() {
            LineStatus::Complete(end) => assert_eq!(line.take_line(end), "GET / HTTP/1.0"),
            _ => panic!("expected complete line"),
        }
        line.flush_line();
        assert_eq!(line.buffered(), b"rest");

        let mut line = line_buffer_with(b"no-cr\nx", 64);
        match line.try_read_line() {
            LineStatus::Complete(end) => assert_eq!(line.take_line(end), "no-cr"),
            _ => panic!("expected complete line"),
        }
    }

    #[test]
    fn empty_line_is_complete_and_empty() {
        let mut line = line_buffer_with(b"\r\n", 64);
        match line.try_read_line() {
            LineStatus::Complete(end) => assert_eq!(end, 0),
            _ => panic!("expected complete line"),
        }
    }

    #[test]
    fn rejects_nul_and_control_bytes() {
        let mut line = line_buffer_with(b"GET \x00/ HTTP/1.0\r\n", 64);
        assert!(matches!(line.try_read_line(), LineStatus::Invalid));

        let mut line = line_buffer_with(b"a\x01b\r\n", 64);
        assert!(matches!(line.try_read_line(), LineStatus::Invalid));

        // Tab and CR are fine.
        let mut line = line_buffer_with(b"a\tb\r\n", 64);
        assert!(matches!(line.try_read_line(), LineStatus::Complete(_)));
    }

    #[test]
    fn full_buffer_without_newline_is_invalid() {
        let mut line = line_buffer_with(&[b'a'; 16], 16);
        assert!(matches!(line.try_read_line(), LineStatus::Invalid));
    }

    #[test]
    fn partial_line_resumes_scanning() {
        let mut line = line_buffer_with(b"GET /", 64);
        assert!(matches!(line.try_read_line(), LineStatus::Incomplete));
        line.fill(b" HTTP/1.0\r\n");
        match line.try_read_line() {
            LineStatus::Complete(end) => assert_eq!(line.take_line(end), "GET / HTTP/1.0"),
            _ => panic!("expected complete line"),
        }
    }

    #[test]
    fn scan_never_reads_past_fill() {
        let mut line = LineBuffer::new(32);
        line.fill(b"abc");
        assert!(matches!(line.try_read_line(), LineStatus::Incomplete));
        assert_eq!(line.index, 3);
        assert_eq!(line.buffered().len(), 3);
    }

    #[test]
    fn first_line_parses_methods_distinctly() {
        let (method, url, protocol) =
            parse_first_request_line("DELETE /thing HTTP/1.1").unwrap();
        assert_eq!(method, Method::Delete);
        assert_eq!(url, "/thing");
        assert_eq!(protocol, Protocol::Http11);

        let (method, _, _) = parse_first_request_line("TRACE / HTTP/1.0").unwrap();
        assert_eq!(method, Method::Trace);
    }

    #[test]
    fn first_line_splits_on_whitespace_runs() {
        let (method, url, protocol) = parse_first_request_line("get   /x\tHTTP/1.0").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(url, "/x");
        assert_eq!(protocol, Protocol::Http10);
    }

    #[test]
    fn first_line_rejections() {
        assert_eq!(
            parse_first_request_line("FOO / HTTP/1.0"),
            Err(Reject::NotImplemented)
        );
        assert_eq!(
            parse_first_request_line("GET / HTTP/2.0"),
            Err(Reject::NotImplemented)
        );
        assert_eq!(parse_first_request_line("GET /"), Err(Reject::BadRequest));
        assert_eq!(
            parse_first_request_line("GET / HTTP/1.0 extra"),
            Err(Reject::BadRequest)
        );
        assert_eq!(parse_first_request_line(""), Err(Reject::BadRequest));
    }

    #[test]
    fn header_extract_matches_case_insensitively() {
        assert_eq!(
            header_match_extract("Content-Length: 400", "content-length"),
            Some("400")
        );
        assert_eq!(
            header_match_extract("CONTENT-LENGTH:400", "Content-Length"),
            Some("400")
        );
        assert_eq!(
            header_match_extract("Content-Length  :  12", "Content-Length"),
            Some("12")
        );
        assert_eq!(header_match_extract("Content-Type: text", "Content-Length"), None);
        assert_eq!(header_match_extract("Content-Len", "Content-Length"), None);
    }

    #[test]
    fn content_length_parses_last_occurrence() {
        let headers = vec![
            "Content-Length: 4".to_string(),
            "Host: example".to_string(),
            "Content-Length: 9".to_string(),
        ];
        assert_eq!(parse_headers(&headers), Ok(9));
    }

    #[test]
    fn bad_content_length_rejects() {
        let headers = vec!["Content-Length: ten".to_string()];
        assert_eq!(parse_headers(&headers), Err(Reject::BadRequest));

        let headers = vec!["Content-Length: -1".to_string()];
        assert_eq!(parse_headers(&headers), Err(Reject::BadRequest));
    }

    #[test]
    fn missing_content_length_is_zero() {
        let headers = vec!["Host: example".to_string()];
        assert_eq!(parse_headers(&headers), Ok(0));
    }
}
