use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, trace, warn};

use crate::engine::{AioEngine, AioSocket};
use crate::error::Error;
use crate::http::session::Limits;
use crate::http::HttpSession;
use crate::inet::{Family, InetAddress};

/// Handler invoked, on an engine worker thread, once a request has been
/// fully received.
///
/// The session arrives shared so the handler can hand it to another
/// thread and respond later.
pub type HttpHandler = Arc<dyn Fn(&Arc<HttpSession>) + Send + Sync>;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Port both listeners bind to; zero picks an ephemeral port.
    pub port: u16,
    /// Bound on a single request line or header line.
    pub max_line_bytes: usize,
    /// Bound on the number of request headers.
    pub max_request_headers: usize,
}

impl HttpConfig {
    /// Configuration with the default parser bounds.
    pub fn new(port: u16) -> HttpConfig {
        HttpConfig {
            port,
            max_line_bytes: 8192,
            max_request_headers: 64,
        }
    }
}

/// A basic HTTP daemon.
///
/// Listens on the wildcard address of both families, accepts at a steady
/// rate regardless of parser progress (a fresh pre-allocated session is
/// armed on the listener as soon as the previous accept lands), and
/// serves one request per connection.
///
/// The engine is borrowed, not owned: shut the server down first, the
/// engine after.
pub struct HttpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    engine: AioEngine,
    handler: HttpHandler,
    limits: Limits,
    listener_v4: Arc<AioSocket>,
    listener_v6: Option<Arc<AioSocket>>,
    pending: Mutex<Pending>,
    shutting_down: AtomicBool,
}

#[derive(Default)]
struct Pending {
    v4: Option<Arc<HttpSession>>,
    v6: Option<Arc<HttpSession>>,
}

impl HttpServer {
    /// Binds the listeners and starts accepting connections, handing
    /// each complete request to `handler`.
    ///
    /// The IPv4 listener is required; an unavailable IPv6 stack is
    /// logged and served around.
    pub fn start_serving<F>(
        engine: &AioEngine,
        config: HttpConfig,
        handler: F,
    ) -> Result<HttpServer, Error>
    where
        F: Fn(&Arc<HttpSession>) + Send + Sync + 'static,
    {
        let listener_v4 = new_listener(Family::V4, config.port)?;
        let (_, port) = listener_v4.local_address()?;

        let listener_v6 = match new_listener(Family::V6, port) {
            Ok(listener) => Some(listener),
            Err(err) => {
                warn!("IPv6 listener unavailable, serving IPv4 only: {}", err);
                None
            }
        };

        let inner = Arc::new(ServerInner {
            engine: engine.clone(),
            handler: Arc::new(handler),
            limits: Limits {
                max_line: config.max_line_bytes,
                max_headers: config.max_request_headers,
            },
            listener_v4,
            listener_v6,
            pending: Mutex::new(Pending::default()),
            shutting_down: AtomicBool::new(false),
        });

        submit_accept(&inner, Family::V4)?;
        if inner.listener_v6.is_some() {
            if let Err(err) = submit_accept(&inner, Family::V6) {
                warn!("could not start accepting IPv6 connections: {}", err);
            }
        }

        trace!("serving HTTP on port {}", port);
        Ok(HttpServer { inner })
    }

    /// The port the listeners are bound to.
    pub fn port(&self) -> u16 {
        self.inner
            .listener_v4
            .local_address()
            .map(|(_, port)| port)
            .unwrap_or(0)
    }

    /// Closes the listeners and frees the pre-allocated sessions.
    ///
    /// In-flight exchanges finish on their own; the engine is left
    /// running and must be shut down separately, after this.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::SeqCst);

        let listeners = std::iter::once(&inner.listener_v4).chain(inner.listener_v6.iter());
        for listener in listeners {
            if inner.engine.is_running() {
                // Closing through the engine cancels the armed accept.
                let result = inner.engine.socket_close(listener, |_listener, err| {
                    if err.is_set() {
                        trace!("listener close reported: {}", err);
                    }
                });
                if result.is_ok() {
                    continue;
                }
            }
            listener.hard_close();
        }

        let mut pending = inner.pending.lock().unwrap();
        pending.v4 = None;
        pending.v6 = None;
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("port", &self.port())
            .finish()
    }
}

fn new_listener(family: Family, port: u16) -> Result<Arc<AioSocket>, Error> {
    let listener = Arc::new(AioSocket::new());
    listener.init(family)?;
    listener.set_reuse_addr(true)?;
    if family == Family::V6 {
        // Keep the wildcard v6 bind from claiming the v4 port too.
        listener.set_v6_only(true)?;
    }
    listener.bind(&InetAddress::any(family), port)?;
    listener.listen(0)?;
    Ok(listener)
}

/// Arms an accept with a freshly allocated session as its target.
fn submit_accept(inner: &Arc<ServerInner>, family: Family) -> Result<(), Error> {
    let listener = match family {
        Family::V4 => inner.listener_v4.clone(),
        Family::V6 => match &inner.listener_v6 {
            Some(listener) => listener.clone(),
            None => return Ok(()),
        },
        Family::Unknown => unreachable!("listeners are v4 or v6"),
    };

    let session = HttpSession::new(inner.engine.clone(), inner.handler.clone(), inner.limits);
    {
        let mut pending = inner.pending.lock().unwrap();
        match family {
            Family::V4 => pending.v4 = Some(session.clone()),
            _ => pending.v6 = Some(session.clone()),
        }
    }

    let inner2 = inner.clone();
    inner
        .engine
        .socket_accept(&listener, session.socket(), move |_listener, _accepted, err| {
            accept_done(&inner2, family, err);
        })
}

fn accept_done(inner: &Arc<ServerInner>, family: Family, err: Error) {
    let session = {
        let mut pending = inner.pending.lock().unwrap();
        match family {
            Family::V4 => pending.v4.take(),
            _ => pending.v6.take(),
        }
    };

    if err.is_set() {
        // Expected during shutdown; anything else ends accepting on
        // this family.
        if !inner.shutting_down.load(Ordering::SeqCst) {
            error!("accept failed ({:?}): {}", family, err);
        }
        return;
    }

    trace!("accepted {:?} connection", family);
    if let Some(session) = session {
        session.begin();
    }

    if let Err(err) = submit_accept(inner, family) {
        if !inner.shutting_down.load(Ordering::SeqCst) {
            error!("could not re-arm accept ({:?}): {}", family, err);
        }
    }
}
