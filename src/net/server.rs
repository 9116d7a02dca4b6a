//! 4.I Server façade: the only type worker-pool code outside this crate
//! is expected to touch.
//!
//! Construction reserves the shared arena pool and builds one
//! [`IoThread`] per configured thread, each bound to its own listener
//! with `SO_REUSEPORT`. `start` spawns them; `try_read`/`blocking_read`
//! pull parsed requests off their rings; `write` routes a finished
//! response back to the I/O thread that owns the connection, decoded
//! from the top bits of the request id (spec §3, §4.I).

use super::io_thread::{IoThread, OutputBuffer, RingMsg, ResponseMsg, WorkerSignal};
use super::request_id::RequestId;
use crate::concurrent::ring::SpmcRing;
use crate::concurrent::respstack::RespStack;
use crate::config::Tunables;
use crate::error::{CoreError, Result};
use crate::memory::pool::PoolShared;
use crate::stats::IoThreadStats;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A parsed request, handed to worker code by [`Server::try_read`] /
/// [`Server::blocking_read`].
pub type Request = RingMsg;

struct ThreadHandle {
    request_ring: Arc<SpmcRing<RingMsg>>,
    response_stack: Arc<RespStack<ResponseMsg>>,
    stats: Arc<IoThreadStats>,
    worker_signal: Arc<WorkerSignal>,
    quiescing: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// The HTTP serving substrate. One per process; `num_threads` I/O
/// threads share this handle's arena pool and are addressed by the
/// `iotd_idx` embedded in every [`RequestId`].
pub struct Server {
    tunables: Arc<Tunables>,
    output_pool: Arc<PoolShared>,
    threads: Vec<ThreadHandle>,
    io_threads: Option<Vec<IoThread>>,
    next_poll: std::sync::atomic::AtomicUsize,
    /// Cumulative bytes currently outstanding in the heap-fallback large
    /// allocation path, checked against `total_large_allocation_limit`.
    /// Shared with every [`IoThread`], which decrements it once a
    /// heap-backed response is copied into the connection's write
    /// buffer and freed.
    large_alloc_used: Arc<AtomicUsize>,
}

impl Server {
    /// Binds `num_threads` listeners on `host:port` (each with its own
    /// epoll instance and connection table) but does not spawn threads
    /// yet -- call [`Server::start`] for that.
    pub fn listen(host: &str, port: u16, tunables: Tunables) -> Result<Self> {
        tunables.validate()?;
        let tunables = Arc::new(tunables);

        let output_pool = Arc::new(
            PoolShared::new(tunables.bump_size as u64, tunables.pool_size)
                .ok_or_else(|| CoreError::Reservation("output arena pool".into()))?,
        );

        let mut threads = Vec::with_capacity(tunables.num_threads);
        let mut io_threads = Vec::with_capacity(tunables.num_threads);
        let large_alloc_used = Arc::new(AtomicUsize::new(0));

        for i in 0..tunables.num_threads {
            let worker_signal = Arc::new(WorkerSignal::new()?);
            let request_ring = Arc::new(
                SpmcRing::<RingMsg>::new(4096)
                    .ok_or_else(|| CoreError::Reservation("request ring".into()))?,
            );

            let io_thread = IoThread::new(
                i as u8,
                host,
                port,
                tunables.clone(),
                output_pool.clone(),
                worker_signal.clone(),
                request_ring.clone(),
                large_alloc_used.clone(),
            )?;

            threads.push(ThreadHandle {
                request_ring,
                response_stack: io_thread.response_stack.clone(),
                stats: io_thread.stats.clone(),
                worker_signal,
                quiescing: io_thread.quiesce_handle(),
                join: None,
            });
            io_threads.push(io_thread);
        }

        Ok(Server {
            tunables,
            output_pool,
            threads,
            io_threads: Some(io_threads),
            next_poll: std::sync::atomic::AtomicUsize::new(0),
            large_alloc_used,
        })
    }

    /// Spawns one OS thread per configured I/O thread.
    pub fn start(&mut self) -> Result<()> {
        let mut io_threads = self
            .io_threads
            .take()
            .ok_or_else(|| CoreError::ProtocolBreak("start() called twice".into()))?;

        for (handle, mut io_thread) in self.threads.iter_mut().zip(io_threads.drain(..)) {
            handle.join = Some(std::thread::spawn(move || {
                io_thread.run();
            }));
        }
        Ok(())
    }

    /// Non-blocking pop of a single ready request from thread `hint`
    /// (round-robin if `None`).
    pub fn try_read(&self) -> Option<Request> {
        let start = self.next_poll.fetch_add(1, Ordering::Relaxed) % self.threads.len().max(1);
        for offset in 0..self.threads.len() {
            let idx = (start + offset) % self.threads.len();
            if let Some(req) = self.threads[idx].request_ring.pop() {
                return Some(req);
            }
        }
        None
    }

    /// Blocks until a request is available or `timeout` elapses, waiting
    /// in the kernel (`poll(2)` over every thread's worker-wakeup
    /// eventfd, then an `eventfd_read` to consume it) rather than
    /// busy-polling `try_read` (spec §4.I).
    pub fn blocking_read(&self, timeout: Duration) -> Option<Request> {
        if let Some(req) = self.try_read() {
            return Some(req);
        }

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return self.try_read();
            }
            let ms = remaining.as_millis().min(i32::MAX as u128) as i32;

            let mut pollfds: Vec<libc::pollfd> = self
                .threads
                .iter()
                .map(|t| libc::pollfd {
                    fd: t.worker_signal.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();
            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, ms)
            };
            if rc <= 0 {
                return self.try_read();
            }
            for (pfd, thread) in pollfds.iter().zip(self.threads.iter()) {
                if pfd.revents & libc::POLLIN != 0 {
                    thread.worker_signal.try_wait();
                }
            }
            if let Some(req) = self.try_read() {
                return Some(req);
            }
        }
    }

    /// Routes a finished response back to the I/O thread that owns
    /// `request_id`'s connection. `buffer` is `None` to close the
    /// connection without a body.
    pub fn write(
        &self,
        request_id: RequestId,
        buffer: Option<OutputBuffer>,
        keepalive: bool,
    ) -> Result<()> {
        let hint = request_id
            .route_hint((self.tunables.num_threads - 1) as u8)
            .ok_or_else(|| CoreError::ProtocolBreak("request id decoded out of range".into()))?;
        let thread = self
            .threads
            .get(hint as usize)
            .ok_or_else(|| CoreError::ProtocolBreak("request id routed to unknown thread".into()))?;
        thread.response_stack.push(ResponseMsg {
            request_id,
            buffer,
            keepalive,
        });
        thread.worker_signal.notify(1);
        Ok(())
    }

    /// Allocates `size` bytes from the shared output arena pool for a
    /// worker to fill in before calling [`Server::write`]. Requests
    /// above `bump_size / 2` fall back to a bounded heap allocation,
    /// whose *cumulative* outstanding size (not just this one
    /// allocation) is checked and tracked against
    /// `total_large_allocation_limit` separately from the arena pool
    /// (spec §4.I). The heap buffer is freed by the owning I/O thread
    /// once its bytes are copied into the connection's write buffer.
    pub fn get_output_buffer(&self, size: usize) -> Option<OutputBuffer> {
        if let Some(addr) = self.output_pool.alloc(size as u64, 8, false) {
            return Some(OutputBuffer::Arena(addr, size as u32));
        }

        let mut used = self.large_alloc_used.load(Ordering::Relaxed);
        loop {
            let new_used = used.checked_add(size)?;
            if new_used > self.tunables.total_large_allocation_limit {
                return None;
            }
            match self.large_alloc_used.compare_exchange_weak(
                used,
                new_used,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => used = observed,
            }
        }

        let layout = match std::alloc::Layout::from_size_align(size, 8) {
            Ok(l) => l,
            Err(_) => {
                self.large_alloc_used.fetch_sub(size, Ordering::Relaxed);
                return None;
            }
        };
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            self.large_alloc_used.fetch_sub(size, Ordering::Relaxed);
            return None;
        }
        Some(OutputBuffer::Heap(ptr as u64, size as u32))
    }

    pub fn stats_snapshot(&self, clear: bool) -> String {
        let mut out = String::new();
        let stats: Vec<Arc<IoThreadStats>> = self.threads.iter().map(|t| t.stats.clone()).collect();
        crate::stats::render_all(&stats, clear, &mut out);
        out
    }

    /// Begins graceful shutdown: every I/O thread stops accepting new
    /// connections, closes idle ones, and finishes in-flight work
    /// before `destroy` can join it.
    pub fn quiesce(&self) {
        for t in &self.threads {
            t.quiescing.store(true, Ordering::Release);
        }
    }

    /// Joins all I/O threads. Callers should `quiesce()` first and
    /// expect this to block until in-flight work drains.
    pub fn destroy(mut self) {
        self.quiesce();
        for t in &mut self.threads {
            if let Some(handle) = t.join.take() {
                let _ = handle.join();
            }
        }
    }
}
