/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! JSON-RPC messages and a reconnecting JSON-RPC session.
//!
//! OVSDB speaks JSON-RPC 1.0 over a byte stream, with each message a bare JSON object and no
//! framing other than the JSON syntax itself.  [`Session`] keeps such a stream connected to a
//! remote, reconnecting with backoff when the connection drops, and [`JsonrpcSession`] is the
//! interface that the OVSDB client uses so that it can also be driven by an in-memory peer.

use anyhow::Result;
use rand::Rng;
use serde_json::{json, Map, Value};

use std::error;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, event, info, Level};

/// A JSON-RPC message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A request, which expects a reply with the same `id`.
    Request { method: String, params: Value, id: Value },

    /// A notification, which is a request that does not expect a reply.
    Notify { method: String, params: Value },

    /// A successful reply to the request with the same `id`.
    Reply { result: Value, id: Value },

    /// An error reply to the request with the same `id`.
    Error { error: Value, id: Value },
}

#[derive(Debug)]
pub struct JsonrpcParseError(pub String);

impl fmt::Display for JsonrpcParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for JsonrpcParseError {}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

impl Message {
    /// Creates a new request for `method` with `params`, with a process-unique integer id.
    pub fn request(method: &str, params: Value) -> Message {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Message::Request { method: method.into(), params, id: json!(id) }
    }

    pub fn notify(method: &str, params: Value) -> Message {
        Message::Notify { method: method.into(), params }
    }

    pub fn reply(result: Value, id: Value) -> Message {
        Message::Reply { result, id }
    }

    pub fn error(error: Value, id: Value) -> Message {
        Message::Error { error, id }
    }

    pub fn id(&self) -> Option<&Value> {
        match self {
            Message::Request { id, .. } | Message::Reply { id, .. } | Message::Error { id, .. } => Some(id),
            Message::Notify { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notify { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Returns a short name for the kind of message, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Notify { .. } => "notification",
            Message::Reply { .. } => "reply",
            Message::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Message::Request { method, params, id } => json!({"method": method, "params": params, "id": id}),
            Message::Notify { method, params } => json!({"method": method, "params": params, "id": null}),
            Message::Reply { result, id } => json!({"result": result, "error": null, "id": id}),
            Message::Error { error, id } => json!({"result": null, "error": error, "id": id}),
        }
    }

    /// Parses `json` as a JSON-RPC message.
    pub fn from_json(json: Value) -> Result<Message> {
        let mut object: Map<String, Value> = match json {
            Value::Object(object) => object,
            _ => Err(JsonrpcParseError("message is not a JSON object".into()))?
        };

        let method = object.remove("method");
        let params = object.remove("params");
        let result = object.remove("result");
        let error = object.remove("error").filter(|e| !e.is_null());
        let id = object.remove("id").unwrap_or(Value::Null);
        if let Some(name) = object.keys().next() {
            Err(JsonrpcParseError(format!("message has unexpected member \"{}\"", name)))?;
        }

        match (method, params, result, error) {
            (Some(Value::String(method)), Some(params), None, None) => {
                if !params.is_array() {
                    Err(JsonrpcParseError("\"params\" must be JSON array".into()))?;
                }
                if id.is_null() {
                    Ok(Message::Notify { method, params })
                } else {
                    Ok(Message::Request { method, params, id })
                }
            },
            (Some(_), _, _, _) => Err(JsonrpcParseError("request must have string \"method\" and \"params\"".into()))?,
            (None, None, Some(result), None) if !id.is_null() => Ok(Message::Reply { result, id }),
            (None, None, _, Some(error)) if !id.is_null() => Ok(Message::Error { error, id }),
            _ => Err(JsonrpcParseError("message is not a valid request, notification, or reply".into()))?
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// The operations that an OVSDB client needs from a JSON-RPC connection.
///
/// Every method is non-blocking.  `run` does whatever I/O is possible right now, `recv` returns a
/// message that has already arrived, if any, and `send` queues a message for transmission.
pub trait JsonrpcSession {
    /// Performs any pending I/O and connection management.
    fn run(&mut self);

    /// Returns the next received message, if one is available.
    fn recv(&mut self) -> Option<Message>;

    /// Queues `msg` for sending.  Fails if the session is not connected.
    fn send(&mut self, msg: Message) -> Result<()>;

    /// A number that changes every time the session connects or disconnects.
    fn seqno(&self) -> u32;

    fn is_connected(&self) -> bool;

    /// Returns false if the session has disconnected and will not reconnect.
    fn is_alive(&self) -> bool;

    fn force_reconnect(&mut self);

    fn enable_reconnect(&mut self) {}

    fn set_probe_interval(&mut self, _probe_interval: Duration) {}

    fn name(&self) -> String;

    fn last_error(&self) -> Option<String> {
        None
    }
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    /// Opens a blocking connection to `name`, which must take the form `tcp:HOST:PORT` or
    /// `unix:PATH`, then puts it into non-blocking mode.
    fn open(name: &str) -> io::Result<Stream> {
        let stream = if let Some(target) = name.strip_prefix("tcp:") {
            let addr = target.to_socket_addrs()?.next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address"))?;
            let tcp = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
            tcp.set_nodelay(true)?;
            Stream::Tcp(tcp)
        } else if let Some(path) = name.strip_prefix("unix:") {
            Stream::Unix(UnixStream::connect(path)?)
        } else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput,
                                      format!("{}: unknown connection type", name)));
        };
        match &stream {
            Stream::Tcp(s) => s.set_nonblocking(true)?,
            Stream::Unix(s) => s.set_nonblocking(true)?,
        }
        Ok(stream)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// A single JSON-RPC connection.
struct Connection {
    stream: Stream,
    rx: Vec<u8>,
    tx: Vec<u8>,
    last_activity: Instant,
    probe_sent: bool,
}

impl Connection {
    /// Writes as much of the transmit buffer as the stream accepts.
    fn flush(&mut self) -> io::Result<()> {
        while !self.tx.is_empty() {
            match self.stream.write(&self.tx) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => { self.tx.drain(..n); },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads everything that is available into the receive buffer.
    fn fill(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.rx.extend_from_slice(&buf[..n]);
                    self.last_activity = Instant::now();
                    self.probe_sent = false;
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
            }
        }
    }

    /// Extracts one complete JSON value from the receive buffer, if there is one.
    fn parse(&mut self) -> Result<Option<Value>> {
        let skip = self.rx.iter().take_while(|b| b.is_ascii_whitespace()).count();
        self.rx.drain(..skip);
        if self.rx.is_empty() {
            return Ok(None);
        }

        let mut values = serde_json::Deserializer::from_slice(&self.rx).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                let consumed = values.byte_offset();
                self.rx.drain(..consumed);
                Ok(Some(value))
            },
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(JsonrpcParseError(format!("error parsing stream: {}", e)))?,
            None => Ok(None),
        }
    }
}

enum State {
    /// Waiting until `Instant` before trying to connect.
    Backoff(Instant),
    Active(Connection),
    /// Disconnected and not going to reconnect.
    Void,
}

const MIN_BACKOFF: Duration = Duration::from_millis(1000);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(8000);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(5000);

/// Spreads reconnection attempts from many clients so that they do not all hit a restarted server
/// at once.
fn jitter(backoff: Duration) -> Duration {
    let spread = backoff.as_millis() as u64 / 4;
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// A JSON-RPC session that reconnects to its remote, with exponential backoff, whenever the
/// connection fails.
pub struct Session {
    name: String,
    state: State,
    retry: bool,
    seqno: u32,
    backoff: Duration,
    max_backoff: Duration,
    probe_interval: Option<Duration>,
    last_error: Option<String>,
}

impl Session {
    /// Creates a session for `name` (`tcp:HOST:PORT` or `unix:PATH`).  If `retry` is false, the
    /// session tries to connect only once and gives up for good after its first disconnection.
    pub fn open(name: &str, retry: bool) -> Session {
        Session {
            name: name.into(),
            state: State::Backoff(Instant::now()),
            retry,
            seqno: 0,
            backoff: MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            probe_interval: Some(DEFAULT_PROBE_INTERVAL),
            last_error: None,
        }
    }

    pub fn set_max_backoff(&mut self, max_backoff: Duration) {
        self.max_backoff = max_backoff.max(MIN_BACKOFF);
    }

    fn connect(&mut self) {
        match Stream::open(&self.name) {
            Ok(stream) => {
                info!("{}: connected", self.name);
                self.state = State::Active(Connection {
                    stream, rx: Vec::new(), tx: Vec::new(),
                    last_activity: Instant::now(), probe_sent: false
                });
                self.seqno += 1;
                self.backoff = MIN_BACKOFF;
                self.last_error = None;
            },
            Err(error) => {
                event!(Level::WARN, "{}: connection attempt failed ({})", self.name, error);
                self.last_error = Some(error.to_string());
                if self.retry {
                    self.state = State::Backoff(Instant::now() + jitter(self.backoff));
                    self.backoff = (self.backoff * 2).min(self.max_backoff);
                } else {
                    self.state = State::Void;
                }
            }
        }
    }

    fn disconnect(&mut self, reason: &str) {
        if let State::Active(_) = self.state {
            info!("{}: connection dropped ({})", self.name, reason);
            self.seqno += 1;
            self.last_error = Some(reason.into());
            self.state = if self.retry {
                State::Backoff(Instant::now() + self.backoff)
            } else {
                State::Void
            };
        }
    }
}

impl JsonrpcSession for Session {
    fn run(&mut self) {
        if matches!(self.state, State::Backoff(deadline) if Instant::now() >= deadline) {
            self.connect();
            return;
        }

        let mut failure = None;
        match &mut self.state {
            State::Active(conn) => {
                if let Err(e) = conn.fill().and_then(|_| conn.flush()) {
                    failure = Some(e.to_string());
                } else if let Some(interval) = self.probe_interval {
                    let idle = conn.last_activity.elapsed();
                    if idle >= interval * 2 && conn.probe_sent {
                        failure = Some(format!("no response to inactivity probe after {} seconds",
                                               idle.as_secs()));
                    } else if idle >= interval && !conn.probe_sent {
                        debug!("{}: idle {} seconds, sending inactivity probe", self.name, idle.as_secs());
                        let probe = json!({"method": "echo", "params": [], "id": "echo"});
                        conn.tx.extend_from_slice(probe.to_string().as_bytes());
                        conn.probe_sent = true;
                    }
                }
            },
            _ => (),
        }
        if let Some(reason) = failure {
            self.disconnect(&reason);
        }
    }

    fn recv(&mut self) -> Option<Message> {
        loop {
            let conn = match &mut self.state {
                State::Active(conn) => conn,
                _ => return None,
            };
            let value = match conn.parse() {
                Ok(Some(value)) => value,
                Ok(None) => return None,
                Err(e) => {
                    let reason = e.to_string();
                    self.disconnect(&reason);
                    return None;
                }
            };
            let msg = match Message::from_json(value) {
                Ok(msg) => msg,
                Err(e) => {
                    event!(Level::WARN, "{}: received bad JSON-RPC message ({})", self.name, e);
                    let reason = e.to_string();
                    self.disconnect(&reason);
                    return None;
                }
            };
            match msg {
                Message::Request { ref method, ref params, ref id } if method == "echo" => {
                    let reply = Message::reply(params.clone(), id.clone());
                    conn.tx.extend_from_slice(reply.to_json().to_string().as_bytes());
                },
                Message::Reply { ref id, .. } if id == "echo" => (),
                msg => return Some(msg),
            }
        }
    }

    fn send(&mut self, msg: Message) -> Result<()> {
        let failure = match &mut self.state {
            State::Active(conn) => {
                conn.tx.extend_from_slice(msg.to_json().to_string().as_bytes());
                match conn.flush() {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                }
            },
            _ => return Err(io::Error::from(io::ErrorKind::NotConnected).into()),
        };
        let reason = failure.to_string();
        self.disconnect(&reason);
        Err(failure.into())
    }

    fn seqno(&self) -> u32 { self.seqno }

    fn is_connected(&self) -> bool { matches!(self.state, State::Active(_)) }

    fn is_alive(&self) -> bool { !matches!(self.state, State::Void) }

    fn force_reconnect(&mut self) {
        if self.is_connected() {
            self.disconnect("forced reconnect");
        }
        if self.retry {
            self.state = State::Backoff(Instant::now());
        }
    }

    fn enable_reconnect(&mut self) {
        self.retry = true;
        if let State::Void = self.state {
            self.state = State::Backoff(Instant::now());
        }
    }

    fn set_probe_interval(&mut self, probe_interval: Duration) {
        self.probe_interval = if probe_interval.is_zero() { None } else { Some(probe_interval) };
    }

    fn name(&self) -> String { self.name.clone() }

    fn last_error(&self) -> Option<String> { self.last_error.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use tracing_test::traced_test;

    #[test]
    fn parse_messages() {
        let msg = Message::from_json(json!({"method": "update", "params": [null, {}], "id": null})).unwrap();
        assert_eq!(msg, Message::notify("update", json!([null, {}])));

        let msg = Message::from_json(json!({"result": [{}], "error": null, "id": 7})).unwrap();
        assert_eq!(msg, Message::reply(json!([{}]), json!(7)));

        let msg = Message::from_json(json!({"result": null, "error": "unknown method", "id": 8})).unwrap();
        assert_eq!(msg, Message::error(json!("unknown method"), json!(8)));

        assert!(Message::from_json(json!({"method": "echo", "params": {}, "id": 1})).is_err());
        assert!(Message::from_json(json!({"result": 1, "id": null})).is_err());
        assert!(Message::from_json(json!([1, 2])).is_err());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = Message::request("echo", json!([]));
        let b = Message::request("echo", json!([]));
        assert_ne!(a.id(), b.id());
    }

    fn wait_for<T>(session: &mut Session, mut f: impl FnMut(&mut Session) -> Option<T>) -> T {
        for _ in 0..200 {
            session.run();
            if let Some(result) = f(session) {
                return result;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out");
    }

    #[test]
    #[traced_test]
    fn session_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;

            // Ask the client to echo, then expect both its echo reply and its own request, in
            // either order.  Split the reply to the request across two writes.
            writer.write_all(br#"{"method":"echo","params":["x"],"id":"e1"}"#).unwrap();
            for _ in 0..2 {
                let mut line = Vec::new();
                reader.read_until(b'}', &mut line).unwrap();
                let msg: Value = serde_json::from_slice(&line).unwrap();
                if msg["id"] == json!("e1") {
                    assert_eq!(msg["result"], json!(["x"]));
                    continue;
                }
                assert_eq!(msg["method"], json!("get_schema"));
                let reply = json!({"result": {"ok": true}, "error": null, "id": msg["id"]}).to_string();
                let (a, b) = reply.as_bytes().split_at(10);
                writer.write_all(a).unwrap();
                writer.flush().unwrap();
                std::thread::sleep(Duration::from_millis(20));
                writer.write_all(b).unwrap();
            }
            std::thread::sleep(Duration::from_millis(100));
        });

        let mut session = Session::open(&format!("tcp:127.0.0.1:{}", port), false);
        wait_for(&mut session, |s| if s.is_connected() { Some(()) } else { None });
        assert_eq!(session.seqno(), 1);

        // The echo request is answered internally and never surfaces.
        let request = Message::request("get_schema", json!(["OVN_Southbound"]));
        let id = request.id().cloned().unwrap();
        session.send(request).unwrap();
        let reply = wait_for(&mut session, |s| s.recv());
        assert_eq!(reply, Message::reply(json!({"ok": true}), id));

        wait_for(&mut session, |s| if s.is_alive() { None } else { Some(()) });
        assert_eq!(session.seqno(), 2);
        assert!(logs_contain("connected"));
        assert!(logs_contain("connection dropped"));
        server.join().unwrap();
    }
}
