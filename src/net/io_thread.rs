//! 4.H I/O thread loop.
//!
//! One `IoThread` owns one epoll instance, one listener socket, a fixed
//! connection slot array, and the producer end of a request ring /
//! consumer end of a response stack. Each iteration:
//!
//! 1. drains the response stack and starts writes for anything it finds
//! 2. scans active connections for the nearest request deadline
//! 3. calls `epoll_wait` with that timeout (retrying on `EINTR`)
//! 4. partitions the returned events into three buckets and handles
//!    them in that order: already-admitted connections (reading/
//!    writing), newly-IDLE connections (admission check happens here),
//!    then new accepts
//! 5. drains the response stack again (events above may have produced
//!    more work for a *different* thread, not this one, so this mostly
//!    catches same-thread worker turnaround)
//! 6. polls [`crate::concurrent::rtbr`] with `hard = false`
//!
//! A dedicated "hard" RTBR poll rides on this same loop rather than a
//! separate timer thread, matching the original's single-threaded-per-
//! iothread design. The worker-wakeup eventfd is not in this thread's
//! epoll set: it exists purely to wake blocked worker threads (see
//! [`crate::net::server::Server::blocking_read`]), and sharing it with
//! this thread's own epoll would let the I/O thread race workers for
//! the same semaphore tokens.

use super::connection::{ConnState, Connection, ReadOutcome, WriteOutcome};
use super::request_id::RequestId;
use crate::concurrent::ring::SpmcRing;
use crate::concurrent::respstack::RespStack;
use crate::concurrent::rtbr;
use crate::config::Tunables;
use crate::memory::pool::{PoolPrivate, PoolShared};
use crate::stats::IoThreadStats;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TAG_LISTENER: u64 = 1;
const TAG_CONN_BASE: u64 = 2;

/// A parsed, ready-to-dispatch request handed to workers through the
/// request ring. `Copy` because the ring stores values inline.
#[derive(Debug, Clone, Copy)]
pub struct RingMsg {
    pub request_id: RequestId,
    pub url_offset: u32,
    pub url_len: u32,
    pub body_offset: u32,
    pub body_len: u32,
    pub total_bytes: u32,
}

/// Where a response buffer handed back through [`ResponseMsg`] came
/// from, so the I/O thread knows whether it must `dealloc` it once the
/// bytes are copied into the connection's write buffer.
#[derive(Debug, Clone, Copy)]
pub enum OutputBuffer {
    /// From the shared arena pool; reclaimed by the pool's own
    /// swap/RTBR cycle, nothing for the I/O thread to do.
    Arena(u64, u32),
    /// A bounded heap fallback for a response too large for the arena
    /// (spec §4.I); must be `dealloc`'d and its size removed from the
    /// running large-allocation total once consumed.
    Heap(u64, u32),
}

impl OutputBuffer {
    pub fn addr(&self) -> u64 {
        match self {
            OutputBuffer::Arena(a, _) | OutputBuffer::Heap(a, _) => *a,
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            OutputBuffer::Arena(_, l) | OutputBuffer::Heap(_, l) => *l,
        }
    }
}

/// A finished response, handed from a worker back to the owning I/O
/// thread through its response stack.
#[derive(Debug, Clone, Copy)]
pub struct ResponseMsg {
    pub request_id: RequestId,
    /// `None` closes the connection without writing a body (used for
    /// malformed-upstream or worker-side failure paths).
    pub buffer: Option<OutputBuffer>,
    pub keepalive: bool,
}

/// Wakes worker threads blocked waiting for ring entries. `EFD_SEMAPHORE`
/// mode means a write of `n` lets exactly `n` blocked reads return before
/// the counter hits zero again, which is what "wake up to n workers"
/// means in spec §4.H step 6.
pub struct WorkerSignal {
    fd: RawFd,
}

impl WorkerSignal {
    pub fn new() -> crate::error::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE) };
        if fd < 0 {
            return Err(crate::error::CoreError::Io(std::io::Error::last_os_error()));
        }
        Ok(WorkerSignal { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self, n: u64) {
        if n == 0 {
            return;
        }
        let buf = n.to_ne_bytes();
        unsafe {
            libc::write(self.fd, buf.as_ptr() as *const libc::c_void, 8);
        }
    }

    /// Non-blocking consume of one wakeup. Returns `true` if a wakeup
    /// was pending.
    pub fn try_wait(&self) -> bool {
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        n == 8
    }

    /// Blocks in the kernel (via `poll(2)`, not a busy loop) until this
    /// fd is readable or `timeout_ms` elapses, then consumes one wakeup.
    /// Returns `true` if a wakeup was consumed.
    pub fn wait_timeout(&self, timeout_ms: i32) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc <= 0 {
            return false;
        }
        self.try_wait()
    }
}

impl Drop for WorkerSignal {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

unsafe impl Send for WorkerSignal {}
unsafe impl Sync for WorkerSignal {}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn make_listener(host: &str, port: u16) -> crate::error::Result<RawFd> {
    let cstr_err = |reason: String| crate::error::CoreError::Listen {
        host: host.to_string(),
        port,
        reason,
    };

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(cstr_err(std::io::Error::last_os_error().to_string()));
    }

    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of_val(&one) as u32,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of_val(&one) as u32,
        );
    }

    let ip: std::net::Ipv4Addr = host
        .parse()
        .map_err(|_| cstr_err(format!("invalid host {host}")))?;
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as u16;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from_ne_bytes(ip.octets());

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as u32,
        )
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(cstr_err(err.to_string()));
    }

    let rc = unsafe { libc::listen(fd, 1024) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(cstr_err(err.to_string()));
    }

    set_nonblocking(fd).map_err(|e| cstr_err(e.to_string()))?;
    Ok(fd)
}

/// One epoll-driven I/O thread: a fixed connection table, a listener, and
/// the ring/stack pair connecting it to the worker pool.
pub struct IoThread {
    pub idx: u8,
    epfd: RawFd,
    listen_fd: RawFd,
    connections: Vec<Connection>,
    free_slots: Vec<u32>,
    pub request_ring: Arc<SpmcRing<RingMsg>>,
    pub response_stack: Arc<RespStack<ResponseMsg>>,
    pub stats: Arc<IoThreadStats>,
    worker_signal: Arc<WorkerSignal>,
    output_pool: Arc<PoolShared>,
    input_pool: PoolPrivate,
    tunables: Arc<Tunables>,
    quiescing: Arc<AtomicBool>,
    active_count: usize,
    events: Vec<libc::epoll_event>,
    large_alloc_used: Arc<std::sync::atomic::AtomicUsize>,
}

impl IoThread {
    pub fn new(
        idx: u8,
        host: &str,
        port: u16,
        tunables: Arc<Tunables>,
        output_pool: Arc<PoolShared>,
        worker_signal: Arc<WorkerSignal>,
        request_ring: Arc<SpmcRing<RingMsg>>,
        large_alloc_used: Arc<std::sync::atomic::AtomicUsize>,
    ) -> crate::error::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(crate::error::CoreError::Io(std::io::Error::last_os_error()));
        }
        let listen_fd = make_listener(host, port)?;

        add_interest(epfd, listen_fd, TAG_LISTENER, libc::EPOLLIN as u32)?;

        let mut connections = Vec::with_capacity(tunables.max_total_connections);
        let mut free_slots = Vec::with_capacity(tunables.max_total_connections);
        for i in 0..tunables.max_total_connections {
            connections.push(Connection::new(i as u32));
            free_slots.push(i as u32);
        }
        free_slots.reverse();

        let input_pool = PoolPrivate::new(tunables.bump_size as u64)
            .ok_or_else(|| crate::error::CoreError::Reservation("input pool".into()))?;

        Ok(IoThread {
            idx,
            epfd,
            listen_fd,
            connections,
            free_slots,
            request_ring,
            response_stack: Arc::new(RespStack::new()),
            stats: Arc::new(IoThreadStats::default()),
            worker_signal,
            output_pool,
            input_pool,
            tunables,
            quiescing: Arc::new(AtomicBool::new(false)),
            active_count: 0,
            events: vec![unsafe { std::mem::zeroed() }; 256],
            large_alloc_used,
        })
    }

    pub fn quiesce_handle(&self) -> Arc<AtomicBool> {
        self.quiescing.clone()
    }

    /// Runs until `quiescing` is set and every connection has drained.
    pub fn run(&mut self) {
        loop {
            self.run_once();
            if self.quiescing.load(Ordering::Acquire) && self.active_count == 0 {
                break;
            }
        }
        self.close_all();
    }

    fn close_all(&mut self) {
        unsafe {
            libc::close(self.listen_fd);
            libc::close(self.epfd);
        }
        for conn in &mut self.connections {
            if conn.state != ConnState::Free {
                conn.close();
            }
        }
    }

    /// One iteration of the 9-step loop described in the module docs.
    pub fn run_once(&mut self) {
        self.drain_responses();

        let timeout_ms = self.next_timeout_ms();

        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.events.as_mut_ptr(),
                    self.events.len() as i32,
                    timeout_ms,
                )
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break 0;
            }
            break rc as usize;
        };

        if n == self.events.len() {
            self.events.resize(self.events.len() * 2, unsafe { std::mem::zeroed() });
        }

        let (mut bucket0, mut bucket1, mut bucket2) = (Vec::new(), Vec::new(), Vec::new());
        for ev in &self.events[..n] {
            let data = ev.u64;
            if data == TAG_LISTENER {
                bucket2.push(data);
            } else {
                let conn_idx = (data - TAG_CONN_BASE) as u32;
                if self.connections[conn_idx as usize].state == ConnState::Idle {
                    bucket1.push(data);
                } else {
                    bucket0.push(data);
                }
            }
        }

        for data in bucket0 {
            self.handle_event(data);
        }
        for data in bucket1 {
            self.handle_event(data);
        }
        for _ in bucket2 {
            self.accept_loop();
        }

        self.drain_responses();
        self.check_deadlines();

        if self.quiescing.load(Ordering::Acquire) {
            self.quiesce_step();
        }

        rtbr::poll(false);
    }

    fn handle_event(&mut self, data: u64) {
        let conn_idx = (data - TAG_CONN_BASE) as usize;
        self.service_connection(conn_idx);
    }

    fn service_connection(&mut self, conn_idx: usize) {
        let state = self.connections[conn_idx].state;
        match state {
            ConnState::Idle => {
                if self.active_count >= self.tunables.max_active_connections {
                    self.stats.refused_active_conns.fetch_add(1, Ordering::Relaxed);
                    self.finish_connection(conn_idx);
                    return;
                }
                self.active_count += 1;
                self.stats.active_conns_inc();
                let timeout = if self.tunables.request_timeout_ms == 0 {
                    None
                } else {
                    Some(Duration::from_millis(self.tunables.request_timeout_ms))
                };
                self.connections[conn_idx].begin_reading(timeout);
                self.drive_read(conn_idx);
            }
            ConnState::Reading => self.drive_read(conn_idx),
            ConnState::Writing => self.drive_write(conn_idx),
            ConnState::Processing | ConnState::Free | ConnState::Closing => {}
        }
    }

    fn drive_read(&mut self, conn_idx: usize) {
        match self.connections[conn_idx].read() {
            ReadOutcome::WouldBlock => {}
            ReadOutcome::Complete(desc) => {
                self.stats.num_requests.fetch_add(1, Ordering::Relaxed);
                let request_id = self.connections[conn_idx].request_id(self.idx);
                let msg = RingMsg {
                    request_id,
                    url_offset: desc.url.offset,
                    url_len: desc.url.len,
                    body_offset: desc.body_offset,
                    body_len: desc.body_len,
                    total_bytes: desc.total_bytes,
                };
                if !self.request_ring.push(msg) {
                    self.stats.oom_failures.fetch_add(1, Ordering::Relaxed);
                    self.retire_active(conn_idx);
                } else {
                    self.worker_signal.notify(1);
                }
            }
            ReadOutcome::Malformed => {
                self.stats.malformed_reqs.fetch_add(1, Ordering::Relaxed);
                self.retire_active(conn_idx);
            }
            ReadOutcome::Reset => {
                self.stats.client_resets.fetch_add(1, Ordering::Relaxed);
                self.retire_active(conn_idx);
            }
            ReadOutcome::Eof => {
                self.retire_active(conn_idx);
            }
        }
    }

    /// Closes a connection that was counted in `active_count` (i.e. one
    /// that made it past the `IDLE -> READING` admission check).
    fn retire_active(&mut self, conn_idx: usize) {
        self.active_count = self.active_count.saturating_sub(1);
        self.stats.active_conns_dec();
        self.finish_connection(conn_idx);
    }

    fn drive_write(&mut self, conn_idx: usize) {
        match self.connections[conn_idx].write() {
            WriteOutcome::WouldBlock => {}
            WriteOutcome::Done => {
                let quiescing = self.quiescing.load(Ordering::Acquire);
                let recycled = self.connections[conn_idx].finish_write(quiescing);
                self.active_count = self.active_count.saturating_sub(1);
                self.stats.active_conns_dec();
                if !recycled {
                    self.finish_connection(conn_idx);
                }
            }
            WriteOutcome::Reset => {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                self.retire_active(conn_idx);
            }
        }
    }

    fn finish_connection(&mut self, conn_idx: usize) {
        self.connections[conn_idx].close();
        self.free_slots.push(conn_idx as u32);
    }

    fn drain_responses(&mut self) {
        let responses = self.response_stack.drain_all();
        for resp in responses {
            let idx = resp.request_id.decode(self.tunables.num_threads as u8 - 1);
            let conn_idx = match idx {
                Some(f) if (f.conn_idx as usize) < self.connections.len() => f.conn_idx as usize,
                _ => continue,
            };
            let conn = &mut self.connections[conn_idx];
            if conn.state != ConnState::Processing || conn.generation != idx.unwrap().generation {
                continue;
            }
            conn.keepalive = resp.keepalive;
            match resp.buffer {
                Some(buf) => {
                    let addr = buf.addr();
                    let len = buf.len();
                    let bytes =
                        unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) };
                    conn.begin_writing(bytes);
                    if let OutputBuffer::Heap(addr, len) = buf {
                        let layout = std::alloc::Layout::from_size_align(len as usize, 8)
                            .expect("heap fallback layout must be valid");
                        unsafe {
                            std::alloc::dealloc(addr as *mut u8, layout);
                        }
                        self.large_alloc_used
                            .fetch_sub(len as usize, Ordering::Relaxed);
                    }
                    self.drive_write(conn_idx);
                }
                None => self.retire_active(conn_idx),
            }
        }
    }

    fn check_deadlines(&mut self) {
        if self.tunables.request_timeout_ms == 0 {
            return;
        }
        let now = Instant::now();
        let expired: Vec<usize> = self
            .connections
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                matches!(c.state, ConnState::Reading | ConnState::Processing) && c.is_expired(now)
            })
            .map(|(i, _)| i)
            .collect();
        for conn_idx in expired {
            self.stats.request_timeouts.fetch_add(1, Ordering::Relaxed);
            self.retire_active(conn_idx);
        }
    }

    fn next_timeout_ms(&self) -> i32 {
        if self.tunables.request_timeout_ms == 0 {
            return if self.active_count == 0 { -1 } else { 50 };
        }
        let now = Instant::now();
        let nearest = self
            .connections
            .iter()
            .filter_map(|c| c.deadline)
            .map(|d| d.saturating_duration_since(now))
            .min();
        match nearest {
            Some(d) => d.as_millis().min(1000) as i32,
            None => -1,
        }
    }

    fn accept_loop(&mut self) {
        loop {
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut addrlen = std::mem::size_of::<libc::sockaddr_in>() as u32;
            let fd = unsafe {
                libc::accept4(
                    self.listen_fd,
                    &mut addr as *mut _ as *mut libc::sockaddr,
                    &mut addrlen,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return,
                    Some(libc::EINTR) => continue,
                    _ => return,
                }
            }

            let one: libc::c_int = 1;
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_NODELAY,
                    &one as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&one) as u32,
                );
                #[cfg(target_os = "linux")]
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_QUICKACK,
                    &one as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&one) as u32,
                );
            }

            let conn_idx = match self.free_slots.pop() {
                Some(idx) => idx,
                None => {
                    self.stats.refused_conns.fetch_add(1, Ordering::Relaxed);
                    unsafe { libc::close(fd) };
                    continue;
                }
            };

            let generation: u32 = rand::random::<u32>() & 0x0FFF_FFFF;
            self.connections[conn_idx as usize].accept(fd, generation);
            self.stats.num_conns.fetch_add(1, Ordering::Relaxed);

            if let Err(_e) = add_interest(
                self.epfd,
                fd,
                TAG_CONN_BASE + conn_idx as u64,
                (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            ) {
                self.finish_connection(conn_idx as usize);
                continue;
            }

            // Optimistic read: bytes may already be in the socket buffer.
            self.service_connection(conn_idx as usize);
        }
    }

    fn quiesce_step(&mut self) {
        // Listener is removed from epoll the first time we observe
        // quiescing, so late accepts stop landing in bucket 2.
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, self.listen_fd, std::ptr::null_mut());
        }
        let idle: Vec<usize> = self
            .connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.state == ConnState::Idle)
            .map(|(i, _)| i)
            .collect();
        for conn_idx in idle {
            self.finish_connection(conn_idx);
        }
    }

    /// Allocates an output buffer from the shared arena pool for a
    /// worker to write its response into.
    pub fn alloc_output(&self, size: u64) -> Option<u64> {
        self.output_pool.alloc(size, 8, false)
    }

    pub fn alloc_input_scratch(&self, size: u64) -> Option<u64> {
        self.input_pool.alloc(size, 8, false)
    }
}

fn add_interest(epfd: RawFd, fd: RawFd, data: u64, events: u32) -> crate::error::Result<()> {
    let mut ev = libc::epoll_event { events, u64: data };
    let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
    if rc < 0 {
        return Err(crate::error::CoreError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_signal_semaphore_wakes_exact_count() {
        let signal = WorkerSignal::new().unwrap();
        signal.notify(3);
        assert!(signal.try_wait());
        assert!(signal.try_wait());
        assert!(signal.try_wait());
        assert!(!signal.try_wait());
    }
}
