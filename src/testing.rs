//! Test doubles and a blocking line client shared by the unit tests.

use crate::registry::Peer;
use crate::runtime::RelayStats;
use crate::session::SessionId;
use bytes::Bytes;
use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

enum Step {
    Chunk(Vec<u8>),
    Error(io::ErrorKind),
}

/// Endpoint that replays a fixed script of reads, then reports end-of-stream.
pub struct ScriptedEndpoint {
    script: VecDeque<Step>,
    written: Vec<u8>,
    shutdowns: Cell<usize>,
}

impl ScriptedEndpoint {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            written: Vec::new(),
            shutdowns: Cell::new(0),
        }
    }

    pub fn chunk(mut self, bytes: &[u8]) -> Self {
        self.script.push_back(Step::Chunk(bytes.to_vec()));
        self
    }

    pub fn error(mut self, kind: io::ErrorKind) -> Self {
        self.script.push_back(Step::Error(kind));
        self
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.get()
    }
}

impl Read for ScriptedEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.script.pop_front() {
            None => Ok(0),
            Some(Step::Error(kind)) => Err(io::Error::new(kind, "scripted")),
            Some(Step::Chunk(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.script.push_front(Step::Chunk(bytes.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for ScriptedEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl crate::endpoint::Endpoint for ScriptedEndpoint {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "scripted"))
    }

    fn shutdown(&self, _how: Shutdown) -> io::Result<()> {
        self.shutdowns.set(self.shutdowns.get() + 1);
        Ok(())
    }
}

/// Peer that records every delivered line, optionally failing every write.
#[derive(Debug)]
pub struct RecordingPeer {
    id: SessionId,
    inbox: Arc<Mutex<Vec<Vec<u8>>>>,
    closes: Arc<AtomicUsize>,
    fail: bool,
}

impl RecordingPeer {
    pub fn new(raw: u64) -> Self {
        Self {
            id: SessionId::new(raw),
            inbox: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
            fail: false,
        }
    }

    pub fn failing(raw: u64) -> Self {
        Self {
            fail: true,
            ..Self::new(raw)
        }
    }

    pub fn inbox(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.inbox)
    }

    pub fn close_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl Peer for RecordingPeer {
    fn id(&self) -> SessionId {
        self.id
    }

    fn deliver(&mut self, line: &Bytes) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
        }
        self.inbox.lock().unwrap().push(line.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Blocking line-oriented client for driving a running dispatcher.
pub struct TestClient {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let writer = TcpStream::connect(addr).unwrap();
        writer
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(writer.try_clone().unwrap());
        Self { writer, reader }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
        self.writer.flush().unwrap();
    }

    pub fn send(&mut self, text: &str) {
        self.send_raw(format!("{text}\n").as_bytes());
    }

    /// Next relayed line, terminator stripped.
    pub fn recv(&mut self) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).unwrap();
        assert!(n > 0, "connection closed while waiting for a line");
        line.pop();
        line
    }

    /// Assert nothing arrives within `wait`.
    pub fn expect_silence(&mut self, wait: Duration) {
        self.writer.set_read_timeout(Some(wait)).unwrap();
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => panic!("connection closed"),
            Ok(_) => panic!("unexpected line: {line:?}"),
            Err(e) => assert!(
                matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
                "unexpected error: {e}"
            ),
        }
        self.writer
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
    }

    /// Assert the server closed this connection.
    pub fn expect_closed(&mut self) {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => {}
            Ok(_) => panic!("unexpected line: {line:?}"),
            Err(e) => assert!(
                matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
                ),
                "unexpected error: {e}"
            ),
        }
    }

    /// Local port, which the server uses for this client's label.
    pub fn label(&self) -> String {
        format!("client[{}]", self.writer.local_addr().unwrap().port())
    }
}

/// Wait until the dispatcher reports `n` live sessions.
pub fn wait_for_online(stats: &RelayStats, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while stats.online() != n {
        assert!(
            Instant::now() < deadline,
            "expected {n} sessions online, have {}",
            stats.online()
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}
