//! Listener and service threads.
//!
//! Each bound address gets its own accept thread; the sockets are
//! non-blocking so the thread can poll a cancellation flag between accept
//! attempts. The service thread drives the scheduler pass and spins without
//! sleeping for as long as clients have traffic to move.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lumen::logging::{debug, error, Logger};

/// How often an idle accept loop rechecks the cancellation flag.
const LISTEN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default pause between service passes when no client had traffic.
pub const DEFAULT_SERVICE_INTERVAL: Duration = Duration::from_millis(1);

pub trait ListenNotify: Send + Sync {
    /// Offers a freshly accepted socket. Returns true if it was adopted;
    /// otherwise the caller closes it.
    fn new_connection(&self, stream: TcpStream, addr: SocketAddr) -> bool;
}

struct Listener {
    terminated: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

/// One accept thread per bound address.
pub struct ListenerPool {
    listeners: Vec<Listener>,
}

impl ListenerPool {
    pub fn start(
        sockets: Vec<TcpListener>,
        notify: Arc<dyn ListenNotify>,
        log: &Logger,
    ) -> ListenerPool {
        let mut listeners = Vec::with_capacity(sockets.len());
        for socket in sockets {
            let terminated = Arc::new(AtomicBool::new(false));
            let flag = terminated.clone();
            let notify = notify.clone();
            let log = log.clone();
            let thread = thread::Builder::new()
                .name("listener".to_string())
                .spawn(move || accept_loop(socket, flag, notify, log))
                .ok();
            listeners.push(Listener { terminated, thread });
        }
        ListenerPool { listeners }
    }

    pub fn stop(&mut self) {
        for listener in &self.listeners {
            listener.terminated.store(true, Ordering::SeqCst);
        }
        for listener in &mut self.listeners {
            if let Some(thread) = listener.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for ListenerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    socket: TcpListener,
    terminated: Arc<AtomicBool>,
    notify: Arc<dyn ListenNotify>,
    log: Logger,
) {
    if let Err(err) = socket.set_nonblocking(true) {
        error!(log, "listener could not be made non-blocking"; "error" => %err);
        return;
    }

    while !terminated.load(Ordering::SeqCst) {
        match socket.accept() {
            Ok((stream, addr)) => {
                debug!(log, "inbound connection"; "peer" => %addr);
                if !notify.new_connection(stream, addr) {
                    // Refused; dropping the stream closes it.
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(LISTEN_POLL_INTERVAL);
            }
            Err(err) => {
                if !terminated.load(Ordering::SeqCst) {
                    error!(log, "accept failed; listener exiting"; "error" => %err);
                }
                return;
            }
        }
    }
}

pub trait ServiceNotify: Send + Sync {
    /// One scheduler pass. Returns true if any client transmitted, in which
    /// case the service thread spins again without sleeping.
    fn service_clients(&self) -> bool;
}

pub struct ServiceThread {
    terminated: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServiceThread {
    pub fn start(notify: Arc<dyn ServiceNotify>, interval: Duration) -> ServiceThread {
        let terminated = Arc::new(AtomicBool::new(false));
        let flag = terminated.clone();
        let thread = thread::Builder::new()
            .name("client-service".to_string())
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    while notify.service_clients() {
                        if flag.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                    thread::sleep(interval);
                }
            })
            .ok();
        ServiceThread { terminated, thread }
    }

    pub fn stop(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.stop();
    }
}
