//! The control socket: a local request/response channel editor plugins
//! use to query and mutate inline comments without going through file
//! contents.
//!
//! One connection is served at a time. A request is a single JSON object;
//! the peer signals the end of it by shutting the connection down or
//! simply by writing less than the read chunk size in one go. Every
//! operation takes the engine lock for its whole duration.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::fs::{Engine, NodeId};

/// How long the accept loop sleeps between polls; shutdown is observed
/// within one tick.
const ACCEPT_TICK: Duration = Duration::from_secs(1);

/// Reads are chunked at this size; a short chunk ends the request.
const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Deserialize)]
struct Request {
    op: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

fn error_response(message: &str) -> Value {
    json!({ "ok": false, "error": message })
}

/// A bound but not yet serving control socket. Binding happens before the
/// engine exists because the engine's `.api.socket` file needs the
/// address.
pub struct ControlListener {
    listener: Listener,
    address: String,
}

enum Listener {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener, PathBuf),
    #[cfg(windows)]
    Tcp(std::net::TcpListener),
}

impl ControlListener {
    /// Binds under `dir` on POSIX (a Unix-domain socket), or on a fresh
    /// loopback port on Windows. The advertised address is the socket
    /// path or the port number.
    pub fn bind(dir: &Path) -> io::Result<ControlListener> {
        #[cfg(unix)]
        {
            let path = dir.join("api.sock");
            let listener = std::os::unix::net::UnixListener::bind(&path)?;
            listener.set_nonblocking(true)?;
            let address = path.to_string_lossy().into_owned();
            Ok(ControlListener {
                listener: Listener::Unix(listener, path),
                address,
            })
        }
        #[cfg(windows)]
        {
            let _ = dir;
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
            listener.set_nonblocking(true)?;
            let address = listener.local_addr()?.port().to_string();
            Ok(ControlListener {
                listener: Listener::Tcp(listener),
                address,
            })
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Starts the accept-and-handle thread.
    pub fn serve(self, engine: Arc<Mutex<Engine>>) -> ControlServer {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let listener = self.listener;

        let thread = jod_thread::Builder::new()
            .name("cgfs-control-socket".to_owned())
            .spawn(move || accept_loop(listener, engine, thread_stop))
            .expect("failed to spawn the control-socket thread");

        ControlServer {
            address: self.address,
            stop,
            _thread: thread,
        }
    }
}

/// Handle to the running server; dropping it stops and joins the thread.
pub struct ControlServer {
    address: String,
    stop: Arc<AtomicBool>,
    _thread: jod_thread::JoinHandle<()>,
}

impl ControlServer {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: Listener, engine: Arc<Mutex<Engine>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        let conn: Option<Box<dyn Connection>> = match &listener {
            #[cfg(unix)]
            Listener::Unix(listener, _) => match listener.accept() {
                Ok((stream, _)) => Some(Box::new(stream)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
                Err(err) => {
                    log::debug!("control socket accept failed: {}", err);
                    None
                }
            },
            #[cfg(windows)]
            Listener::Tcp(listener) => match listener.accept() {
                Ok((stream, _)) => Some(Box::new(stream)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
                Err(err) => {
                    log::debug!("control socket accept failed: {}", err);
                    None
                }
            },
        };

        match conn {
            Some(mut conn) => {
                if let Err(err) = handle_connection(conn.as_mut(), &engine) {
                    log::debug!("control socket connection failed: {}", err);
                }
            }
            None => std::thread::sleep(ACCEPT_TICK),
        }
    }

    #[cfg(unix)]
    if let Listener::Unix(_, path) = &listener {
        let _ = std::fs::remove_file(path);
    }
}

trait Connection: Read + Write + Send {
    fn prepare(&mut self) -> io::Result<()>;
}

#[cfg(unix)]
impl Connection for std::os::unix::net::UnixStream {
    fn prepare(&mut self) -> io::Result<()> {
        self.set_nonblocking(false)?;
        self.set_read_timeout(Some(Duration::from_secs(1)))?;
        self.set_write_timeout(Some(Duration::from_secs(1)))
    }
}

#[cfg(windows)]
impl Connection for std::net::TcpStream {
    fn prepare(&mut self) -> io::Result<()> {
        self.set_nonblocking(false)?;
        self.set_read_timeout(Some(Duration::from_secs(1)))?;
        self.set_write_timeout(Some(Duration::from_secs(1)))
    }
}

fn handle_connection(conn: &mut dyn Connection, engine: &Mutex<Engine>) -> io::Result<()> {
    conn.prepare()?;

    let mut data = Vec::new();
    let mut chunk = [0_u8; CHUNK_SIZE];
    loop {
        let read = conn.read(&mut chunk)?;
        data.extend_from_slice(&chunk[..read]);
        if read < CHUNK_SIZE {
            break;
        }
    }

    if data.is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_slice::<Request>(&data) {
        Ok(request) => handle_request(engine, request),
        Err(_) => error_response("invalid request"),
    };

    conn.write_all(response.to_string().as_bytes())
}

fn handle_request(engine: &Mutex<Engine>, request: Request) -> Value {
    let mut engine = engine.lock().unwrap();

    let resolve = |engine: &mut Engine, file: &Option<String>| -> Result<NodeId, Value> {
        let path = file.as_deref().ok_or_else(|| error_response("missing file"))?;
        let stripped = engine.strip_mountpoint(path).to_owned();
        engine
            .resolve(&stripped)
            .map_err(|_| error_response("File not found"))
    };

    match request.op.as_str() {
        "is_file" => match resolve(&mut engine, &request.file) {
            Ok(id) => match engine.is_server_file(id) {
                Ok(is_file) => json!({ "ok": is_file }),
                Err(_) => error_response("File not found"),
            },
            Err(response) => response,
        },
        "get_feedback" => match resolve(&mut engine, &request.file) {
            Ok(id) => {
                if !engine.is_server_file(id).unwrap_or(false) {
                    return error_response("File not a server file");
                }
                match engine.file_comments(id) {
                    Ok(data) => json!({ "ok": true, "data": data }),
                    Err(_) => error_response("The server returned an error"),
                }
            }
            Err(response) => response,
        },
        "set_feedback" => {
            let (line, message) = match (request.line, request.message.as_deref()) {
                (Some(line), Some(message)) => (line, message),
                _ => return error_response("missing line or message"),
            };
            match resolve(&mut engine, &request.file) {
                Ok(id) => {
                    if !engine.is_server_file(id).unwrap_or(false) {
                        return error_response("File not a server file");
                    }
                    match engine.add_comment(id, line, message) {
                        Ok(()) => json!({ "ok": true }),
                        Err(_) => error_response("The server returned an error"),
                    }
                }
                Err(response) => response,
            }
        }
        "delete_feedback" => {
            let line = match request.line {
                Some(line) => line,
                None => return error_response("missing line"),
            };
            match resolve(&mut engine, &request.file) {
                Ok(id) => {
                    if !engine.is_server_file(id).unwrap_or(false) {
                        return error_response("File not a server file");
                    }
                    match engine.delete_comment(id, line) {
                        Ok(()) => json!({ "ok": true }),
                        Err(_) => error_response("The server returned an error"),
                    }
                }
                Err(response) => response,
            }
        }
        _ => error_response("unknown op"),
    }
}
