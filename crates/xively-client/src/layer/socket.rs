//! Non-blocking TCP transport.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, ToSocketAddrs};

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, error, info, trace};
use mio::net::TcpStream;
use mio::{Interest, Token};

use super::{is_write_completion, Layer, LayerCx, LayerData, LayerOp};
use crate::dispatcher::Fd;
use crate::state::State;

const READ_CHUNK_SIZE: usize = 4096;

/// One frame handed down, written as header then payload.
struct Outgoing {
    header: Bytes,
    payload: Bytes,
}

impl Outgoing {
    fn is_done(&self) -> bool {
        self.header.is_empty() && self.payload.is_empty()
    }
}

/// Bottom layer over a `mio` TCP stream.
///
/// A single readiness continuation drives everything: it completes the
/// connect, flushes queued frames, drains the socket and re-arms itself.
pub struct SocketLayer {
    stream: Option<TcpStream>,
    fd: Option<Fd>,
    connected: bool,
    write_queue: VecDeque<Outgoing>,
}

impl Default for SocketLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketLayer {
    pub fn new() -> Self {
        Self {
            stream: None,
            fd: None,
            connected: false,
            write_queue: VecDeque::new(),
        }
    }

    fn open(&mut self, cx: &mut LayerCx<'_>) -> Result<(), State> {
        let (host, port) = cx
            .connection()
            .map(|data| (data.host.clone(), data.port))
            .ok_or(State::NullContext)?;
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|err| {
                error!("could not resolve {}: {}", host, err);
                State::SocketGetHostByNameError
            })?
            .next()
            .ok_or(State::SocketGetHostByNameError)?;

        debug!("connecting to {} ({})", host, addr);
        let mut stream = TcpStream::connect(addr).map_err(|err| {
            error!("socket connect to {} failed: {}", addr, err);
            State::SocketInitializationError
        })?;

        let fd = cx.register_fd()?;
        cx.xively()
            .poll
            .registry()
            .register(&mut stream, Token(fd), Interest::READABLE | Interest::WRITABLE)
            .map_err(|_| State::SocketInitializationError)?;
        self.stream = Some(stream);
        self.fd = Some(fd);
        cx.continue_on_socket(fd, Interest::WRITABLE)
    }

    /// Check whether a pending non-blocking connect has finished.
    fn finish_connect(&mut self) -> Result<bool, State> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(State::SocketError);
        };
        if let Ok(Some(err)) | Err(err) = stream.take_error() {
            error!("socket connect failed: {}", err);
            return Err(State::SocketConnectionError);
        }
        match stream.peer_addr() {
            Ok(addr) => {
                info!("socket connected to {}", addr);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => {
                error!("socket connect failed: {}", err);
                Err(State::SocketConnectionError)
            }
        }
    }

    /// Write queued frames until the socket would block. Returns the number
    /// of frames completely written.
    fn flush(&mut self) -> Result<usize, State> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(State::SocketWriteError);
        };
        let mut completed = 0;
        while let Some(front) = self.write_queue.front_mut() {
            let chunk = if front.header.is_empty() {
                &mut front.payload
            } else {
                &mut front.header
            };
            match stream.write(&chunk[..]) {
                Ok(0) => return Err(State::SocketWriteError),
                Ok(n) => chunk.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("socket write failed: {}", err);
                    return Err(State::SocketWriteError);
                }
            }
            if front.is_done() {
                self.write_queue.pop_front();
                completed += 1;
            }
        }
        Ok(completed)
    }

    /// Read everything available. `Ok(None)` means nothing arrived.
    fn drain(&mut self) -> Result<Option<Bytes>, State> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(State::SocketReadError);
        };
        let mut buf = BytesMut::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    if buf.is_empty() {
                        return Err(State::ConnectionResetByPeer);
                    }
                    break;
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("socket read failed: {}", err);
                    return Err(State::from(err));
                }
            }
        }
        Ok((!buf.is_empty()).then(|| buf.freeze()))
    }

    /// Wait for readability, and writability while frames are queued.
    fn rearm(&mut self, cx: &mut LayerCx<'_>) -> State {
        let (Some(stream), Some(fd)) = (self.stream.as_mut(), self.fd) else {
            return State::Ok;
        };
        let interest = if self.write_queue.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if let Err(err) = cx.xively().poll.registry().reregister(stream, Token(fd), interest) {
            error!("socket reregister failed: {}", err);
            return cx.close_chain(State::SocketError);
        }
        match cx.continue_on_socket(fd, interest) {
            Ok(()) => State::Ok,
            Err(state) => state,
        }
    }

    fn write_and_confirm(&mut self, cx: &mut LayerCx<'_>) -> Result<(), State> {
        let completed = self.flush()?;
        for _ in 0..completed {
            cx.schedule_next(LayerOp::Push, LayerData::Empty, State::Written);
        }
        Ok(())
    }

    fn shutdown(&mut self, cx: &mut LayerCx<'_>) {
        if let Some(mut stream) = self.stream.take() {
            let _ = cx.xively().poll.registry().deregister(&mut stream);
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(fd) = self.fd.take() {
            cx.unregister_fd(fd);
        }
        self.write_queue.clear();
        self.connected = false;
    }
}

impl Layer for SocketLayer {
    fn init(&mut self, cx: &mut LayerCx<'_>, _data: LayerData, state: State) -> State {
        if state != State::Ok {
            return cx.schedule_next(LayerOp::Connect, LayerData::Empty, state);
        }
        match self.open(cx) {
            Ok(()) => State::Ok,
            Err(err) => {
                self.shutdown(cx);
                cx.schedule_next(LayerOp::Connect, LayerData::Empty, err)
            }
        }
    }

    /// Readiness on the socket.
    fn pull(&mut self, cx: &mut LayerCx<'_>, _data: LayerData, _state: State) -> State {
        if self.stream.is_none() {
            return State::Ok;
        }

        if !self.connected {
            match self.finish_connect() {
                Ok(true) => {
                    self.connected = true;
                    cx.schedule_next(LayerOp::Connect, LayerData::Empty, State::Ok);
                }
                Ok(false) => return self.rearm(cx),
                Err(err) => {
                    self.shutdown(cx);
                    return cx.schedule_next(LayerOp::Connect, LayerData::Empty, err);
                }
            }
        }

        if let Err(err) = self.write_and_confirm(cx) {
            cx.schedule_next(LayerOp::Push, LayerData::Empty, State::FailedWriting);
            return cx.close_chain(err);
        }

        match self.drain() {
            Ok(Some(bytes)) => {
                trace!("read {} bytes", bytes.len());
                cx.schedule_next(LayerOp::Pull, LayerData::Raw(bytes), State::Ok);
            }
            Ok(None) => {}
            Err(err) => return cx.close_chain(err),
        }

        self.rearm(cx)
    }

    fn push(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if is_write_completion(state) {
            return State::Ok;
        }
        let outgoing = match data {
            LayerData::Frame { header, payload } => Outgoing { header, payload },
            LayerData::Raw(bytes) => Outgoing {
                header: bytes,
                payload: Bytes::new(),
            },
            _ => return State::Ok,
        };
        if self.stream.is_none() {
            return cx.schedule_next(LayerOp::Push, LayerData::Empty, State::FailedWriting);
        }
        if outgoing.is_done() {
            return cx.schedule_next(LayerOp::Push, LayerData::Empty, State::Written);
        }
        self.write_queue.push_back(outgoing);
        if !self.connected {
            return State::Ok;
        }
        if let Err(err) = self.write_and_confirm(cx) {
            cx.schedule_next(LayerOp::Push, LayerData::Empty, State::FailedWriting);
            return cx.close_chain(err);
        }
        self.rearm(cx)
    }

    fn close(&mut self, cx: &mut LayerCx<'_>, _data: LayerData, state: State) -> State {
        if self.stream.is_some() && self.connected {
            let _ = self.write_and_confirm(cx);
        }
        self.shutdown(cx);
        cx.schedule_next(LayerOp::CloseExternally, LayerData::Empty, state)
    }
}
