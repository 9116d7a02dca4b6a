//! Minimal demo binary: binds the HTTP substrate and answers every
//! request with a fixed 200 OK, to exercise the server façade end to
//! end without pulling in an actual application layer.

use emberhttp::config::Tunables;
use emberhttp::net::server::Server;
use emberhttp::Result;
use tracing::info;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nok";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let tunables = Tunables::from_env();
    info!(num_threads = tunables.num_threads, "starting emberhttp");

    let host = std::env::var("EMBERHTTP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("EMBERHTTP_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);

    let mut server = Server::listen(&host, port, tunables)?;
    server.start()?;
    info!(%host, port, "listening");

    let server = std::sync::Arc::new(server);
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let server = server.clone();
            std::thread::spawn(move || loop {
                if let Some(req) = server.blocking_read(std::time::Duration::from_millis(500)) {
                    if let Some(buf) = server.get_output_buffer(RESPONSE.len()) {
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                RESPONSE.as_ptr(),
                                buf.addr() as *mut u8,
                                RESPONSE.len(),
                            );
                        }
                        let _ = server.write(req.request_id, Some(buf), true);
                    } else {
                        let _ = server.write(req.request_id, None, false);
                    }
                }
            })
        })
        .collect();

    ctrlc_wait();
    info!("shutting down");
    for w in workers {
        drop(w);
    }

    Ok(())
}

/// Blocks until the process receives `SIGINT`/`SIGTERM`. A demo binary
/// has nothing better to synchronize shutdown on.
fn ctrlc_wait() {
    static SHUTDOWN: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
    extern "C" fn handler(_: libc::c_int) {
        SHUTDOWN.store(true, std::sync::atomic::Ordering::SeqCst);
    }
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
    while !SHUTDOWN.load(std::sync::atomic::Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
}
