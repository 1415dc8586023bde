//! Client socket readiness and receive plumbing.
//!
//! The core hands each accepted socket to a manager; the manager delivers
//! received byte buffers and closure notifications through `SocketNotify`.
//! The bundled implementation runs one polling thread over a `mio` poll
//! registered edge-triggered for readability; sends happen elsewhere
//! (the scheduler writes directly on the non-blocking sockets).

use hashbrown::HashMap;
use mio::net::TcpStream;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use lumen::logging::{debug, error, Logger};
use lumen::{BrokerError, BrokerResult};

use crate::broker::ClientHandle;

const POLL_TIMEOUT: Duration = Duration::from_millis(50);
const RECV_CHUNK: usize = 4096;

pub trait SocketNotify: Send + Sync {
    /// Bytes received on a managed socket.
    fn socket_data(&self, handle: ClientHandle, data: &[u8]);
    /// The peer closed the socket (gracefully or not).
    fn socket_closed(&self, handle: ClientHandle, graceful: bool);
}

pub trait SocketManager: Send + Sync {
    fn startup(&self, notify: Arc<dyn SocketNotify>) -> BrokerResult<()>;
    fn shutdown(&self);
    fn add_socket(&self, handle: ClientHandle, stream: Arc<TcpStream>) -> BrokerResult<()>;
    fn remove_socket(&self, handle: ClientHandle);
}

enum Command {
    Add(ClientHandle, Arc<TcpStream>),
    Remove(ClientHandle),
}

struct Shared {
    commands: Mutex<Vec<Command>>,
    running: AtomicBool,
}

pub struct MioSocketManager {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    log: Logger,
}

impl MioSocketManager {
    pub fn new(log: &Logger) -> MioSocketManager {
        MioSocketManager {
            shared: Arc::new(Shared {
                commands: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
            log: log.clone(),
        }
    }
}

impl SocketManager for MioSocketManager {
    fn startup(&self, notify: Arc<dyn SocketNotify>) -> BrokerResult<()> {
        let poll = mio::Poll::new()?;
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let log = self.log.clone();
        let thread = thread::Builder::new()
            .name("socket-reader".to_string())
            .spawn(move || read_loop(poll, shared, notify, log))
            .map_err(BrokerError::from)?;

        *self.thread.lock().expect("socket manager lock poisoned") = Some(thread);
        Ok(())
    }

    fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.lock().expect("socket manager lock poisoned").take() {
            let _ = thread.join();
        }
    }

    fn add_socket(&self, handle: ClientHandle, stream: Arc<TcpStream>) -> BrokerResult<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(BrokerError::ShuttingDown);
        }
        self.shared
            .commands
            .lock()
            .expect("socket manager lock poisoned")
            .push(Command::Add(handle, stream));
        Ok(())
    }

    fn remove_socket(&self, handle: ClientHandle) {
        self.shared
            .commands
            .lock()
            .expect("socket manager lock poisoned")
            .push(Command::Remove(handle));
    }
}

fn read_loop(poll: mio::Poll, shared: Arc<Shared>, notify: Arc<dyn SocketNotify>, log: Logger) {
    let mut events = mio::Events::with_capacity(1024);
    let mut sockets: HashMap<ClientHandle, Arc<TcpStream>> = HashMap::new();
    let mut buf = [0u8; RECV_CHUNK];

    while shared.running.load(Ordering::SeqCst) {
        {
            let mut commands = shared.commands.lock().expect("socket manager lock poisoned");
            for command in commands.drain(..) {
                match command {
                    Command::Add(handle, stream) => {
                        let register = poll.register(
                            &*stream,
                            mio::Token(handle as usize),
                            mio::Ready::readable(),
                            mio::PollOpt::edge(),
                        );
                        match register {
                            Ok(()) => {
                                sockets.insert(handle, stream);
                            }
                            Err(err) => {
                                error!(log, "socket registration failed";
                                       "handle" => handle, "error" => %err);
                                notify.socket_closed(handle, false);
                            }
                        }
                    }
                    Command::Remove(handle) => {
                        if let Some(stream) = sockets.remove(&handle) {
                            let _ = poll.deregister(&*stream);
                        }
                    }
                }
            }
        }

        if poll.poll(&mut events, Some(POLL_TIMEOUT)).is_err() {
            continue;
        }

        for event in events.iter() {
            let handle = event.token().0 as ClientHandle;
            let stream = match sockets.get(&handle) {
                Some(stream) => stream.clone(),
                None => continue,
            };

            // Edge-triggered: drain until the socket would block.
            let mut closed = None;
            loop {
                match (&*stream).read(&mut buf) {
                    Ok(0) => {
                        closed = Some(true);
                        break;
                    }
                    Ok(n) => notify.socket_data(handle, &buf[..n]),
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(log, "socket read error"; "handle" => handle, "error" => %err);
                        closed = Some(false);
                        break;
                    }
                }
            }

            if let Some(graceful) = closed {
                let _ = poll.deregister(&*stream);
                sockets.remove(&handle);
                notify.socket_closed(handle, graceful);
            }
        }
    }
}

/// Manager used by unit tests and by core code paths that own no real
/// sockets: it records registrations and never delivers events.
pub struct NullSocketManager;

impl SocketManager for NullSocketManager {
    fn startup(&self, _notify: Arc<dyn SocketNotify>) -> BrokerResult<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn add_socket(&self, _handle: ClientHandle, _stream: Arc<TcpStream>) -> BrokerResult<()> {
        Ok(())
    }

    fn remove_socket(&self, _handle: ClientHandle) {}
}
