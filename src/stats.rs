//! Per-I/O-thread counters and the text stats stream (spec §6).
//!
//! Gauge counters (`num_conns`, `active_conns`) never reset on scrape; the
//! rest are rate counters, atomically fetched-and-cleared when a scrape
//! requests it, mirroring `an_io_stat_get(iotd, stat, clear)` in the
//! original `an_server.c`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($field:ident => $name:literal),+ $(,)?) => {
        /// Atomic counters for a single I/O thread.
        #[derive(Default)]
        pub struct IoThreadStats {
            $(pub $field: AtomicU64,)+
        }

        impl IoThreadStats {
            /// Append this thread's counters as
            /// `iothread.<i>.<name>_sum: <value>` lines into `out`.
            ///
            /// Rate counters are fetched-and-cleared; the two gauges
            /// (`num_conns`, `active_conns`) are loaded without resetting.
            pub fn render(&self, thread_index: usize, clear: bool, out: &mut String) {
                $(
                    let is_gauge = matches!($name, "num_conns" | "active_conns");
                    let value = if clear && !is_gauge {
                        self.$field.swap(0, Ordering::Relaxed)
                    } else {
                        self.$field.load(Ordering::Relaxed)
                    };
                    let _ = writeln!(out, "iothread.{}.{}_sum: {}", thread_index, $name, value);
                )+
            }

        }
    };
}

counters! {
    num_conns => "num_conns",
    active_conns => "active_conns",
    read_errors => "read_errors",
    request_timeouts => "request_timeouts",
    write_errors => "write_errors",
    client_resets => "client_resets",
    refused_conns => "refused_conns",
    refused_active_conns => "refused_active_conns",
    malformed_reqs => "malformed_reqs",
    oom_failures => "oom_failures",
    num_requests => "num_requests",
}

impl IoThreadStats {
    pub fn active_conns_inc(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_conns_dec(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Renders the stats stream for every I/O thread into `out`.
pub fn render_all(threads: &[std::sync::Arc<IoThreadStats>], clear: bool, out: &mut String) {
    for (i, stats) in threads.iter().enumerate() {
        stats.render(i, clear, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn gauges_never_clear_on_scrape() {
        let stats = IoThreadStats::default();
        stats.num_conns.store(5, Ordering::Relaxed);
        let mut out = String::new();
        stats.render(0, true, &mut out);
        assert_eq!(stats.num_conns.load(Ordering::Relaxed), 5);
        assert!(out.contains("iothread.0.num_conns_sum: 5"));
    }

    #[test]
    fn rate_counters_clear_on_scrape() {
        let stats = IoThreadStats::default();
        stats.malformed_reqs.store(3, Ordering::Relaxed);
        let mut out = String::new();
        stats.render(0, true, &mut out);
        assert!(out.contains("malformed_reqs_sum: 3"));
        assert_eq!(stats.malformed_reqs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn rate_counters_preserved_without_clear() {
        let stats = IoThreadStats::default();
        stats.oom_failures.store(2, Ordering::Relaxed);
        let mut out = String::new();
        stats.render(0, false, &mut out);
        assert_eq!(stats.oom_failures.load(Ordering::Relaxed), 2);
    }
}
