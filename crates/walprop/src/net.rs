//! Nonblocking TCP transport on `mio`.
//!
//! Provides the connection and readiness halves of
//! [`ProposerApi`](crate::ProposerApi); a host forwards those trait methods
//! here and supplies WAL, time and notifications itself.
//!
//! Framing: every message is a little-endian `u32` length followed by the
//! payload. The start command is sent as a frame holding its text; the
//! acceptor answers with a one-byte frame, [`COPY_BOTH_REPLY`] when it
//! switched to streaming.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::debug;

use crate::api::{
    AsyncRead, AsyncWrite, ConnStatus, ConnectPollStatus, ExecStatus, FlushStatus, Readiness,
    WaitResult,
};

/// Size of the frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Reply byte acknowledging the start command.
pub const COPY_BOTH_REPLY: u8 = b'W';

/// Largest frame accepted from an acceptor.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const WAKER_TOKEN: Token = Token(usize::MAX);

/// How long `conn_blocking_write` keeps retrying a full socket.
const BLOCKING_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Appends `payload` as one frame.
pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

/// Splits one complete frame off the front of `buf`.
pub fn decode_frame(buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}"),
        ));
    }
    if buf.len() < FRAME_HEADER_SIZE + len {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_SIZE);
    Ok(Some(buf.split_to(len).freeze()))
}

// ============================================================================
// Connection
// ============================================================================

/// One acceptor connection.
pub struct MioConn {
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Peer closed its side.
    eof: bool,
    last_error: Option<String>,
}

impl MioConn {
    fn failed(error: String) -> Self {
        Self {
            stream: None,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            eof: false,
            last_error: Some(error),
        }
    }

    fn set_error(&mut self, error: &io::Error) {
        self.last_error = Some(error.to_string());
    }

    /// Reads everything the socket has into the read buffer.
    fn fill_read_buf(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let mut temp_buf = [0u8; 8192];
        loop {
            match stream.read(&mut temp_buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.read_buf.extend_from_slice(&temp_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes as much of the write buffer as the socket takes.
    ///
    /// Returns `true` once the buffer is empty.
    fn drain_write_buf(&mut self) -> io::Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        while !self.write_buf.is_empty() {
            match stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ));
                }
                Ok(n) => self.write_buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Next complete frame, reading from the socket if none is buffered.
    fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(frame) = decode_frame(&mut self.read_buf)? {
            return Ok(Some(frame));
        }
        self.fill_read_buf()?;
        if let Some(frame) = decode_frame(&mut self.read_buf)? {
            return Ok(Some(frame));
        }
        if self.eof {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }
        Ok(None)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Readiness multiplexer and connection factory.
pub struct MioTransport {
    poll: Poll,
    events: Events,
    pending: VecDeque<WaitResult>,
    waker: Arc<Waker>,
}

impl MioTransport {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            pending: VecDeque::new(),
            waker,
        })
    }

    /// Handle that sets the latch from any thread, e.g. when WAL is flushed.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn connect_start(&mut self, endpoint: &str) -> MioConn {
        let addr: SocketAddr = match endpoint.to_socket_addrs().map(|mut a| a.next()) {
            Ok(Some(addr)) => addr,
            Ok(None) => return MioConn::failed(format!("no address for {endpoint}")),
            Err(e) => return MioConn::failed(format!("failed to resolve {endpoint}: {e}")),
        };
        match TcpStream::connect(addr) {
            Ok(stream) => MioConn {
                stream: Some(stream),
                read_buf: BytesMut::with_capacity(8192),
                write_buf: BytesMut::with_capacity(8192),
                eof: false,
                last_error: None,
            },
            Err(e) => MioConn::failed(format!("failed to connect to {addr}: {e}")),
        }
    }

    pub fn status(conn: &MioConn) -> ConnStatus {
        if conn.stream.is_some() {
            ConnStatus::Ok
        } else {
            ConnStatus::Bad
        }
    }

    pub fn error_message(conn: &MioConn) -> String {
        conn.last_error
            .clone()
            .unwrap_or_else(|| "no error".to_string())
    }

    /// Checks a nonblocking connect after a writable event.
    pub fn connect_poll(conn: &mut MioConn) -> ConnectPollStatus {
        let Some(stream) = conn.stream.as_ref() else {
            return ConnectPollStatus::Failed;
        };
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                conn.set_error(&e);
                return ConnectPollStatus::Failed;
            }
        }
        match stream.peer_addr() {
            Ok(_) => ConnectPollStatus::Ok,
            Err(ref e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                ConnectPollStatus::Writing
            }
            Err(e) => {
                conn.set_error(&e);
                ConnectPollStatus::Failed
            }
        }
    }

    pub fn send_query(conn: &mut MioConn, query: &str) -> bool {
        encode_frame(query.as_bytes(), &mut conn.write_buf);
        match conn.drain_write_buf() {
            Ok(_) => true,
            Err(e) => {
                conn.set_error(&e);
                false
            }
        }
    }

    pub fn get_query_result(conn: &mut MioConn) -> ExecStatus {
        if let Err(e) = conn.drain_write_buf() {
            conn.set_error(&e);
            return ExecStatus::Failed;
        }
        match conn.next_frame() {
            Ok(None) => ExecStatus::NeedsInput,
            Ok(Some(reply)) if reply.as_ref() == [COPY_BOTH_REPLY] => ExecStatus::CopyBoth,
            Ok(Some(reply)) => {
                conn.last_error = Some(format!("unexpected reply {:?}", reply.as_ref()));
                ExecStatus::UnexpectedSuccess
            }
            Err(e) => {
                conn.set_error(&e);
                ExecStatus::Failed
            }
        }
    }

    pub fn flush(conn: &mut MioConn) -> FlushStatus {
        match conn.drain_write_buf() {
            Ok(true) => FlushStatus::Done,
            Ok(false) => FlushStatus::TryAgain,
            Err(e) => {
                conn.set_error(&e);
                FlushStatus::Failed
            }
        }
    }

    pub fn finish(conn: MioConn) {
        if let Some(stream) = conn.stream {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn async_read(conn: &mut MioConn) -> AsyncRead {
        match conn.next_frame() {
            Ok(Some(frame)) => AsyncRead::Success(frame),
            Ok(None) => AsyncRead::TryAgain,
            Err(e) => {
                conn.set_error(&e);
                AsyncRead::Fail
            }
        }
    }

    pub fn async_write(conn: &mut MioConn, payload: &[u8]) -> AsyncWrite {
        encode_frame(payload, &mut conn.write_buf);
        match conn.drain_write_buf() {
            Ok(true) => AsyncWrite::Success,
            Ok(false) => AsyncWrite::TryFlush,
            Err(e) => {
                conn.set_error(&e);
                AsyncWrite::Fail
            }
        }
    }

    /// Writes `payload` completely, retrying while the socket is full.
    pub fn blocking_write(conn: &mut MioConn, payload: &[u8]) -> bool {
        encode_frame(payload, &mut conn.write_buf);
        let deadline = Instant::now() + BLOCKING_WRITE_TIMEOUT;
        loop {
            match conn.drain_write_buf() {
                Ok(true) => return true,
                Ok(false) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(false) => {
                    conn.last_error = Some("blocking write timed out".to_string());
                    return false;
                }
                Err(e) => {
                    conn.set_error(&e);
                    return false;
                }
            }
        }
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    fn interest(readiness: Readiness) -> Option<Interest> {
        match (readiness.readable, readiness.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub fn add_event(&mut self, peer: usize, conn: &mut MioConn, readiness: Readiness) {
        let (Some(stream), Some(interest)) = (conn.stream.as_mut(), Self::interest(readiness))
        else {
            return;
        };
        if let Err(e) = self.poll.registry().register(stream, Token(peer), interest) {
            conn.set_error(&e);
        }
    }

    pub fn update_event(&mut self, peer: usize, conn: &mut MioConn, readiness: Readiness) {
        let (Some(stream), Some(interest)) = (conn.stream.as_mut(), Self::interest(readiness))
        else {
            return;
        };
        if let Err(e) = self.poll.registry().reregister(stream, Token(peer), interest) {
            conn.set_error(&e);
        }
    }

    pub fn remove_event(&mut self, peer: usize, conn: &mut MioConn) {
        if let Some(stream) = conn.stream.as_mut() {
            let _ = self.poll.registry().deregister(stream);
        }
        self.pending
            .retain(|ev| !matches!(ev, WaitResult::Peer { peer: p, .. } if *p == peer));
    }

    /// Waits for the next event. Events returned together by the OS are
    /// handed out one per call.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<WaitResult> {
        if let Some(ev) = self.pending.pop_front() {
            return Ok(ev);
        }
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(WaitResult::Timeout),
            Err(e) => return Err(e),
        }
        for event in &self.events {
            let result = if event.token() == WAKER_TOKEN {
                WaitResult::Latch
            } else {
                WaitResult::Peer {
                    peer: event.token().0,
                    events: Readiness {
                        readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                        writable: event.is_writable() || event.is_write_closed(),
                    },
                }
            };
            self.pending.push_back(result);
        }
        debug!(events = self.pending.len(), "poll returned");
        Ok(self.pending.pop_front().unwrap_or(WaitResult::Timeout))
    }
}
