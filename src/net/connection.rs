//! 4.G Connection state machine.
//!
//! Each connection slot is pre-allocated and array-indexed (spec §3); an
//! [`super::io_thread::IoThread`] owns an array of these and drives each
//! one through `FREE → IDLE → READING → PROCESSING → WRITING → IDLE`
//! (or `→ CLOSING → FREE`). Workers never touch a `Connection` directly
//! -- they only see the [`crate::net::request_id::RequestId`] it handed
//! out and a response buffer handle.
//!
//! Input buffers are plain growable `Vec<u8>`, not arena-backed: they
//! are exclusively owned by the connection's I/O thread for their whole
//! lifetime, so they need none of the cross-thread provenance the RTBR
//! story exists for. Output buffers *do* come from the shared arena
//! pool, since a worker thread produces them and the I/O thread
//! consumes them.

use super::parser::{HttpRequestParser, ParseOutcome, ParserCallbacks, ParsedUrl};
use super::request_id::{RequestId, RequestIdFields};
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Free,
    Idle,
    Reading,
    Processing,
    Writing,
    Closing,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestDescriptor {
    pub url: ParsedUrl,
    pub body_offset: u32,
    pub body_len: u32,
    pub total_bytes: u32,
}

#[derive(Default)]
struct Callbacks {
    url: Option<ParsedUrl>,
    body: Option<(u32, u32)>,
    complete: bool,
}

impl ParserCallbacks for Callbacks {
    fn on_url(&mut self, url: ParsedUrl) {
        self.url = Some(url);
    }
    fn on_body(&mut self, offset: u32, len: u32) {
        self.body = Some((offset, len));
    }
    fn on_message_complete(&mut self) {
        self.complete = true;
    }
}

/// What happened on the most recent `read` attempt.
pub enum ReadOutcome {
    /// Subscribe for more `EPOLLIN` and wait.
    WouldBlock,
    /// A full request was parsed; ready to dispatch to a worker.
    Complete(RequestDescriptor),
    /// Parser rejected the bytes, or EOF landed mid-message.
    Malformed,
    /// Peer reset the connection (`ECONNRESET`).
    Reset,
    /// Clean EOF with no message in flight -- a normal connection close.
    Eof,
}

pub enum WriteOutcome {
    WouldBlock,
    Done,
    Reset,
}

/// A single connection slot.
pub struct Connection {
    pub fd: RawFd,
    pub conn_idx: u32,
    pub generation: u32,
    pub state: ConnState,
    parser: HttpRequestParser,
    input: Vec<u8>,
    pub keepalive: bool,
    pub remote_closed: bool,
    pub deadline: Option<Instant>,
    pending_write: Vec<u8>,
    write_progress: usize,
}

impl Connection {
    pub fn new(conn_idx: u32) -> Self {
        Connection {
            fd: -1,
            conn_idx,
            generation: 0,
            state: ConnState::Free,
            parser: HttpRequestParser::new(),
            input: Vec::new(),
            keepalive: true,
            remote_closed: false,
            deadline: None,
            pending_write: Vec::new(),
            write_progress: 0,
        }
    }

    /// `FREE → IDLE`: a freshly accepted socket takes over this slot.
    pub fn accept(&mut self, fd: RawFd, generation: u32) {
        self.fd = fd;
        self.generation = generation;
        self.state = ConnState::Idle;
        self.input.clear();
        self.parser.reset();
        self.keepalive = true;
        self.remote_closed = false;
        self.deadline = None;
        self.pending_write.clear();
        self.write_progress = 0;

        #[cfg(feature = "trace")]
        log::trace!(
            "conn[{}] FREE -> IDLE (fd={}, gen={})",
            self.conn_idx,
            fd,
            generation
        );
    }

    pub fn request_id(&self, iotd_idx: u8) -> RequestId {
        RequestId::encode(RequestIdFields {
            iotd_idx,
            conn_idx: self.conn_idx,
            generation: self.generation,
        })
    }

    /// `IDLE → READING` admission edge. Caller is responsible for the
    /// active-connection cap check (spec §4.G); this only performs the
    /// state transition.
    pub fn begin_reading(&mut self, request_timeout: Option<Duration>) {
        self.state = ConnState::Reading;
        self.deadline = request_timeout.map(|d| Instant::now() + d);

        #[cfg(feature = "trace")]
        log::trace!("conn[{}] IDLE -> READING", self.conn_idx);
    }

    /// Reads available bytes and feeds the parser. Grows the input
    /// buffer geometrically when full.
    pub fn read(&mut self) -> ReadOutcome {
        loop {
            let len = self.input.len();
            if len == self.input.capacity() {
                let grow_to = (self.input.capacity().max(4096)) * 2;
                self.input.reserve(grow_to - self.input.capacity());
            }
            let spare = self.input.capacity() - self.input.len();
            let start = self.input.len();
            self.input.resize(start + spare, 0);

            let buf = &mut self.input[start..];
            let n = unsafe {
                libc::read(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };

            if n > 0 {
                self.input.truncate(start + n as usize);
                let mut callbacks = Callbacks::default();
                match self.parser.parse(&self.input, &mut callbacks) {
                    ParseOutcome::NeedMore => continue,
                    ParseOutcome::Error => return ReadOutcome::Malformed,
                    ParseOutcome::Complete(_) => {
                        let (body_offset, body_len) = callbacks.body.unwrap_or((0, 0));
                        let desc = RequestDescriptor {
                            url: callbacks.url.unwrap_or_default(),
                            body_offset,
                            body_len,
                            total_bytes: self.input.len() as u32,
                        };
                        self.state = ConnState::Processing;
                        #[cfg(feature = "trace")]
                        log::trace!("conn[{}] READING -> PROCESSING", self.conn_idx);
                        return ReadOutcome::Complete(desc);
                    }
                }
            } else if n == 0 {
                self.input.truncate(start);
                return if self.input.is_empty() {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Malformed
                };
            } else {
                self.input.truncate(start);
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => ReadOutcome::WouldBlock,
                    Some(libc::ECONNRESET) => ReadOutcome::Reset,
                    Some(libc::EINTR) => continue,
                    _ => ReadOutcome::Malformed,
                };
            }
        }
    }

    /// `PROCESSING → WRITING`: a worker produced a response buffer.
    pub fn begin_writing(&mut self, response: &[u8]) {
        self.pending_write.clear();
        self.pending_write.extend_from_slice(response);
        self.write_progress = 0;
        self.state = ConnState::Writing;

        #[cfg(feature = "trace")]
        log::trace!(
            "conn[{}] PROCESSING -> WRITING ({} bytes)",
            self.conn_idx,
            response.len()
        );
    }

    pub fn write(&mut self) -> WriteOutcome {
        loop {
            if self.write_progress >= self.pending_write.len() {
                return WriteOutcome::Done;
            }
            let remaining = &self.pending_write[self.write_progress..];
            let n = unsafe {
                libc::write(
                    self.fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            };

            if n > 0 {
                self.write_progress += n as usize;
                continue;
            }

            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => WriteOutcome::WouldBlock,
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => WriteOutcome::Reset,
                Some(libc::EINTR) => continue,
                _ => WriteOutcome::Reset,
            };
        }
    }

    /// `WRITING → IDLE` (keepalive) or `WRITING → CLOSING`.
    pub fn finish_write(&mut self, quiescing: bool) -> bool {
        if self.keepalive && !self.remote_closed && !quiescing {
            self.state = ConnState::Idle;
            self.input.clear();
            self.parser.reset();
            self.pending_write.clear();
            self.write_progress = 0;
            #[cfg(feature = "trace")]
            log::trace!("conn[{}] WRITING -> IDLE (keepalive)", self.conn_idx);
            true
        } else {
            self.state = ConnState::Closing;
            #[cfg(feature = "trace")]
            log::trace!("conn[{}] WRITING -> CLOSING", self.conn_idx);
            false
        }
    }

    pub fn mark_remote_closed(&mut self) {
        self.remote_closed = true;
    }

    /// Any state `→ FREE` once in-flight work has drained.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
        #[cfg(feature = "trace")]
        log::trace!("conn[{}] {:?} -> FREE", self.conn_idx, self.state);
        self.fd = -1;
        self.state = ConnState::Free;
        self.input.clear();
        self.pending_write.clear();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if now >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connection_is_free() {
        let conn = Connection::new(0);
        assert_eq!(conn.state, ConnState::Free);
    }

    #[test]
    fn accept_transitions_to_idle() {
        let mut conn = Connection::new(0);
        conn.accept(3, 42);
        assert_eq!(conn.state, ConnState::Idle);
        assert_eq!(conn.generation, 42);
    }

    #[test]
    fn request_id_round_trips_conn_idx_and_generation() {
        let mut conn = Connection::new(17);
        conn.accept(3, 99);
        let id = conn.request_id(2);
        let fields = id.decode(63).unwrap();
        assert_eq!(fields.conn_idx, 17);
        assert_eq!(fields.generation, 99);
        assert_eq!(fields.iotd_idx, 2);
    }

    #[test]
    fn expiry_is_relative_to_deadline() {
        let mut conn = Connection::new(0);
        conn.accept(3, 1);
        conn.begin_reading(Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(conn.is_expired(Instant::now()));
    }
}
