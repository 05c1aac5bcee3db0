use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLL_CTL_ADD, EPOLL_CTL_DEL,
};
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::{Context, RequestHandler};
use crate::request::{self, HttpRequest, ParseError};
use crate::response::HttpResponse;

const READ_CHUNK: usize = 4096;

// Set from a signal handler, polled once per loop iteration. Never touches
// shared structures from signal context.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Marks the event loop for termination. Safe to call from a signal
/// handler; the loop notices at the top of its next iteration.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Clears the shutdown flag. Called at startup and when the loop exits.
pub fn reset_shutdown() {
    SHUTDOWN.store(false, Ordering::SeqCst);
}

/// One configured virtual listen address. `fd` is -1 until the socket is
/// bound.
#[derive(Debug, Clone)]
pub struct ListenEndpoint {
    pub listen: String,
    pub host: String,
    pub port: u16,
    pub fd: RawFd,
}

enum Socket {
    Listener(TcpListener),
    Client(TcpStream),
}

// Per-descriptor state. Clients keep a growable accumulator that persists
// across loop iterations so a request arriving in several nonblocking reads
// is only parsed once it is complete.
struct Connection {
    socket: Socket,
    listen: String,
    host: String,
    port: u16,
    buffer: Vec<u8>,
}

impl Connection {
    fn is_listener(&self) -> bool {
        matches!(self.socket, Socket::Listener(_))
    }
}

enum ReadOutcome {
    Progress,
    PeerClosed,
    Failed,
}

/// The multiplexed event loop and its connection table.
///
/// Strictly single-threaded: the table and the epoll set are mutated only
/// from the loop, and each readiness event is handled to completion before
/// the next descriptor is examined. Every tracked descriptor has exactly one
/// table entry and one epoll registration; the two are changed only
/// together.
pub struct Server {
    config: Config,
    handler: Box<dyn RequestHandler>,
    epoll_fd: RawFd,
    endpoints: Vec<ListenEndpoint>,
    connections: HashMap<RawFd, Connection>,
    running: bool,
}

impl Server {
    pub fn new(config: Config, handler: Box<dyn RequestHandler>) -> Result<Server, ServerError> {
        let epoll_fd = unsafe { epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let endpoints = config
            .get_servers()
            .iter()
            .map(|s| ListenEndpoint {
                listen: s.listen.clone(),
                host: s.host.clone(),
                port: s.port,
                fd: -1,
            })
            .collect();

        Ok(Server {
            config,
            handler,
            epoll_fd,
            endpoints,
            connections: HashMap::new(),
            running: false,
        })
    }

    pub fn endpoints(&self) -> &[ListenEndpoint] {
        &self.endpoints
    }

    /// Addresses actually bound, in arbitrary order. Useful when a port was
    /// configured as 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.connections
            .values()
            .filter_map(|c| match &c.socket {
                Socket::Listener(listener) => listener.local_addr().ok(),
                Socket::Client(_) => None,
            })
            .collect()
    }

    /// Creates, binds and registers a listening socket for every configured
    /// endpoint. Any failure releases the listeners created so far and is
    /// fatal: the loop must not start on a partial set.
    pub fn bind(&mut self) -> Result<(), ServerError> {
        for i in 0..self.endpoints.len() {
            if let Err(e) = self.bind_endpoint(i) {
                error!(
                    "binding {}:{}: {}",
                    self.endpoints[i].host, self.endpoints[i].port, e
                );
                self.release_connections();
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn bind_endpoint(&mut self, i: usize) -> io::Result<()> {
        let (listen, host, port) = {
            let endpoint = &self.endpoints[i];
            (endpoint.listen.clone(), endpoint.host.clone(), endpoint.port)
        };
        let listener = TcpListener::bind((host.as_str(), port))?;
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();
        self.epoll_add(fd)?;
        info!("listening on {}", listener.local_addr()?);
        self.connections.insert(
            fd,
            Connection {
                socket: Socket::Listener(listener),
                listen,
                host,
                port,
                buffer: Vec::new(),
            },
        );
        self.endpoints[i].fd = fd;
        Ok(())
    }

    /// Runs the event loop until shutdown is requested or a fatal error
    /// occurs. [`bind`](Server::bind) must have succeeded first.
    pub fn run(&mut self) -> Result<(), ServerError> {
        if self.connections.is_empty() {
            return Err(ServerError::InvalidConfig(
                "no listening sockets; bind() must succeed before run()".into(),
            ));
        }
        self.running = true;
        let max_events = self.config.max_events();
        let mut events = vec![epoll_event { events: 0, u64: 0 }; max_events];
        info!("event loop started");

        while self.running {
            if shutdown_requested() {
                break;
            }
            let count = unsafe {
                epoll_wait(self.epoll_fd, events.as_mut_ptr(), max_events as i32, -1)
            };
            if count < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.stop();
                return Err(err.into());
            }

            let ready: Vec<(RawFd, u32)> = events[..count as usize]
                .iter()
                .map(|e| (e.u64 as RawFd, e.events))
                .collect();
            for (fd, revents) in ready {
                // A descriptor closed earlier in this scan may still show up.
                let connection = match self.connections.get(&fd) {
                    Some(c) => c,
                    None => continue,
                };
                if connection.is_listener() {
                    self.accept_connection(fd);
                } else if revents & (EPOLLERR as u32 | EPOLLHUP as u32) != 0 {
                    self.remove_connection(fd);
                } else if revents & EPOLLIN as u32 != 0 {
                    self.handle_client_data(fd);
                }
            }
        }

        self.stop();
        Ok(())
    }

    /// Synchronous termination: clears the poll set and the connection
    /// table without draining in-flight connections.
    pub fn stop(&mut self) {
        if self.running {
            self.running = false;
            info!("server stopped");
        }
        self.release_connections();
        reset_shutdown();
    }

    fn release_connections(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            self.epoll_del(fd);
        }
        self.connections.clear();
        for endpoint in &mut self.endpoints {
            endpoint.fd = -1;
        }
    }

    // Accept failures are connection-local: the client is dropped and the
    // loop keeps serving everyone else.
    fn accept_connection(&mut self, listener_fd: RawFd) {
        let (listen, host, port, accepted) = match self.connections.get(&listener_fd) {
            Some(Connection {
                socket: Socket::Listener(listener),
                listen,
                host,
                port,
                ..
            }) => (listen.clone(), host.clone(), *port, listener.accept()),
            _ => return,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!("nonblocking setup for {} failed: {}", peer, e);
                    return;
                }
                let client_fd = stream.as_raw_fd();
                if let Err(e) = self.epoll_add(client_fd) {
                    warn!("registering client {} failed: {}", peer, e);
                    return;
                }
                debug!("client connected from {} on {}:{}", peer, host, port);
                self.connections.insert(
                    client_fd,
                    Connection {
                        socket: Socket::Client(stream),
                        listen,
                        host,
                        port,
                        buffer: Vec::with_capacity(READ_CHUNK),
                    },
                );
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept on {}:{} failed: {}", host, port, e),
        }
    }

    fn handle_client_data(&mut self, fd: RawFd) {
        let outcome = {
            let connection = match self.connections.get_mut(&fd) {
                Some(c) => c,
                None => return,
            };
            let stream = match connection.socket {
                Socket::Client(ref mut stream) => stream,
                Socket::Listener(_) => return,
            };
            drain_socket(stream, &mut connection.buffer)
        };

        match outcome {
            ReadOutcome::PeerClosed => {
                debug!("peer closed fd {}", fd);
                self.remove_connection(fd);
            }
            ReadOutcome::Failed => self.remove_connection(fd),
            ReadOutcome::Progress => {
                let complete = match self.connections.get(&fd) {
                    Some(connection) => {
                        request::request_complete(&String::from_utf8_lossy(&connection.buffer))
                    }
                    None => return,
                };
                if !complete {
                    // Leave the connection armed; the rest of the request
                    // arrives in a later readable event.
                    return;
                }
                self.respond_and_close(fd);
            }
        }
    }

    fn respond_and_close(&mut self, fd: RawFd) {
        let (listen, raw) = {
            let connection = match self.connections.get_mut(&fd) {
                Some(c) => c,
                None => return,
            };
            (
                connection.listen.clone(),
                std::mem::take(&mut connection.buffer),
            )
        };
        let text = String::from_utf8_lossy(&raw).into_owned();
        let response = self.build_response(&listen, &text);
        let bytes = response.to_bytes();

        if let Some(connection) = self.connections.get_mut(&fd) {
            if let Socket::Client(ref mut stream) = connection.socket {
                if let Err(e) = write_fully(stream, &bytes) {
                    warn!("writing response on fd {}: {}", fd, e);
                }
            }
        }
        self.remove_connection(fd);
    }

    // Parse failures become client-error responses and never terminate the
    // process; a length mismatch is logged with its diagnostics.
    fn build_response(&self, listen: &str, raw: &str) -> HttpResponse {
        let server_config = match self.config.get_server_by_listen(listen) {
            Some(c) => c,
            None => {
                error!("no server config for listen \"{}\"", listen);
                return HttpResponse::internal_error();
            }
        };
        let mut http_request = HttpRequest::new();
        match http_request.parse(raw) {
            Ok(()) => {
                let ctx = Context {
                    config: server_config,
                    request: &http_request,
                };
                self.handler.handle_request(&ctx)
            }
            Err(err @ ParseError::LengthMismatch { .. }) => {
                warn!("{}", err);
                HttpResponse::bad_request()
            }
            Err(ParseError::Malformed) => {
                debug!("malformed request on listen \"{}\"", listen);
                HttpResponse::bad_request()
            }
        }
    }

    // Removal is exactly-once: table entry and epoll registration go
    // together, and a second call for the same descriptor is a no-op.
    fn remove_connection(&mut self, fd: RawFd) {
        if let Some(connection) = self.connections.remove(&fd) {
            self.epoll_del(fd);
            drop(connection);
            debug!("connection fd {} removed", fd);
        }
    }

    fn epoll_add(&self, fd: RawFd) -> io::Result<()> {
        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: fd as u64,
        };
        let rc = unsafe { epoll_ctl(self.epoll_fd, EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn epoll_del(&self, fd: RawFd) {
        unsafe {
            epoll_ctl(self.epoll_fd, EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.release_connections();
        if self.epoll_fd >= 0 {
            unsafe {
                libc::close(self.epoll_fd);
            }
        }
    }
}

// Drains everything currently readable. WouldBlock means "done for now",
// not an error; 0 means the peer closed.
fn drain_socket(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> ReadOutcome {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return ReadOutcome::PeerClosed,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Progress,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("recv failed: {}", e);
                return ReadOutcome::Failed;
            }
        }
    }
}

fn write_fully(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket closed mid-response",
                ))
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    stream.flush()
}
