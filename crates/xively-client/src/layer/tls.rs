//! TLS over the transport with `rustls`.
//!
//! The layer sits between the socket and the codec. Plaintext frames from
//! above are encrypted and pushed down as raw records, ciphertext from below
//! is decrypted and passed up. The handshake runs between the socket's
//! `connect` and the codec's, so the logic layer only sees a connected
//! stream once the broker certificate has been verified.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use super::{is_write_completion, schedule_layer_call, Layer, LayerCx, LayerData, LayerOp};
use crate::client::Xively;
use crate::config::TlsConfig;
use crate::context::ContextKey;
use crate::fs::OpenFlags;
use crate::resource_manager::{self, ResourceHandle};
use crate::state::State;

const PLAINTEXT_CHUNK_SIZE: usize = 4096;

pub struct TlsLayer {
    config: TlsConfig,
    /// PEM bundle loaded from the filesystem.
    ca: Option<Bytes>,
    conn: Option<ClientConnection>,
    /// One entry per record batch pushed down: whether its completion
    /// confirms a frame from above.
    pending_writes: VecDeque<bool>,
    handshake_done: bool,
}

impl TlsLayer {
    pub fn new(config: TlsConfig) -> Self {
        Self {
            config,
            ca: None,
            conn: None,
            pending_writes: VecDeque::new(),
            handshake_done: false,
        }
    }

    fn roots(&self) -> Result<RootCertStore, State> {
        let mut roots = RootCertStore::empty();
        let Some(pem) = &self.ca else {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            return Ok(roots);
        };
        let mut reader: &[u8] = pem.as_ref();
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                error!("malformed CA bundle: {}", err);
                State::TlsFailedLoadingCertificate
            })?;
        if certs.is_empty() {
            error!("CA bundle holds no certificates");
            return Err(State::TlsFailedLoadingCertificate);
        }
        for cert in certs {
            roots.add(cert).map_err(|err| {
                error!("rejected CA certificate: {}", err);
                State::TlsCertificateError
            })?;
        }
        Ok(roots)
    }

    fn start(&mut self, host: &str) -> Result<ClientConnection, State> {
        let roots = self.roots()?;
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let name = self.config.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name).map_err(|err| {
            error!("invalid TLS server name: {}", err);
            State::TlsInitializationError
        })?;
        ClientConnection::new(Arc::new(config), server_name).map_err(|err| {
            error!("TLS session setup failed: {}", err);
            State::TlsInitializationError
        })
    }

    /// Push pending records down. `carries_frame` marks the batch as the
    /// encryption of one frame from above.
    fn flush(&mut self, cx: &mut LayerCx<'_>, carries_frame: bool) -> State {
        let Some(conn) = self.conn.as_mut() else {
            return State::Ok;
        };
        let mut records = Vec::new();
        while conn.wants_write() {
            match conn.write_tls(&mut records) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    error!("TLS record write failed: {}", err);
                    return cx.close_chain(State::TlsWriteError);
                }
            }
        }
        if records.is_empty() {
            if carries_frame {
                return cx.schedule_next(LayerOp::Push, LayerData::Empty, State::Written);
            }
            return State::Ok;
        }
        self.pending_writes.push_back(carries_frame);
        cx.schedule_prev(LayerOp::Push, LayerData::Raw(Bytes::from(records)), State::Ok)
    }

    fn handshake_error(&self, err: &rustls::Error) -> State {
        match err {
            rustls::Error::InvalidCertificate(_) => State::TlsFailedCertError,
            _ if self.handshake_done => State::TlsReadError,
            _ => State::TlsConnectError,
        }
    }
}

/// Load the CA bundle through the resource manager and re-enter `init`
/// with it.
fn load_ca(cx: &mut LayerCx<'_>, name: &str) -> State {
    let (key, index) = (cx.key, cx.index);
    let opened = resource_manager::open(
        cx.xively(),
        name,
        OpenFlags::READ,
        Box::new(move |xi: &mut Xively, handle: ResourceHandle, _, state| {
            if state != State::Ok {
                let _ = resource_manager::close(xi, handle, Box::new(|_, _, _, _| {}));
                resume_init(xi, key, index, Err(State::TlsFailedLoadingCertificate));
                return;
            }
            let read = resource_manager::read(
                xi,
                handle,
                Box::new(move |xi: &mut Xively, handle, data, state| {
                    let _ = resource_manager::close(xi, handle, Box::new(|_, _, _, _| {}));
                    let result = if state == State::Ok {
                        Ok(data)
                    } else {
                        Err(State::TlsFailedLoadingCertificate)
                    };
                    resume_init(xi, key, index, result);
                }),
            );
            if read.is_err() {
                let _ = resource_manager::close(xi, handle, Box::new(|_, _, _, _| {}));
                resume_init(xi, key, index, Err(State::TlsFailedLoadingCertificate));
            }
        }),
    );
    match opened {
        Ok(_) => State::Ok,
        Err(err) => {
            error!("could not load CA bundle {}: {}", name, err);
            cx.schedule_next(LayerOp::Connect, LayerData::Empty, State::TlsFailedLoadingCertificate)
        }
    }
}

fn resume_init(xi: &mut Xively, key: ContextKey, index: usize, result: Result<Bytes, State>) {
    let (data, state) = match result {
        Ok(pem) => (LayerData::Raw(pem), State::Ok),
        Err(err) => (LayerData::Empty, err),
    };
    if let Err(err) = schedule_layer_call(xi, key, index, LayerOp::Init, data, state, 0) {
        error!("could not resume TLS init: {}", err);
    }
}

impl Layer for TlsLayer {
    fn init(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if state != State::Ok {
            return cx.schedule_next(LayerOp::Connect, LayerData::Empty, state);
        }
        match data {
            LayerData::Raw(pem) => self.ca = Some(pem),
            _ if self.ca.is_none() => {
                if let Some(name) = self.config.ca_cert.clone() {
                    debug!("loading CA bundle {}", name);
                    return load_ca(cx, &name);
                }
            }
            _ => {}
        }

        let host = cx.connection().map(|data| data.host.clone()).unwrap_or_default();
        match self.start(&host) {
            Ok(conn) => {
                self.conn = Some(conn);
                self.handshake_done = false;
                cx.schedule_prev(LayerOp::Init, LayerData::Empty, State::Ok)
            }
            Err(err) => cx.schedule_next(LayerOp::Connect, LayerData::Empty, err),
        }
    }

    /// The transport is up: send the ClientHello.
    fn connect(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if state != State::Ok || self.conn.is_none() {
            return cx.schedule_next(LayerOp::Connect, data, state);
        }
        trace!("starting TLS handshake");
        self.flush(cx, false)
    }

    fn pull(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if state != State::Ok {
            return cx.schedule_next(LayerOp::Pull, data, state);
        }
        let LayerData::Raw(records) = data else {
            return State::Ok;
        };
        let Some(conn) = self.conn.as_mut() else {
            return State::Ok;
        };

        let mut input: &[u8] = records.as_ref();
        while !input.is_empty() {
            if let Err(err) = conn.read_tls(&mut input) {
                error!("TLS record read failed: {}", err);
                return cx.close_chain(State::TlsReadError);
            }
            if let Err(err) = conn.process_new_packets() {
                error!("TLS failure: {}", err);
                let cause = self.handshake_error(&err);
                self.flush(cx, false);
                if !self.handshake_done {
                    self.conn = None;
                    return cx.schedule_next(LayerOp::Connect, LayerData::Empty, cause);
                }
                return cx.close_chain(cause);
            }
        }

        let mut plain = Vec::new();
        let mut peer_closed = false;
        let mut chunk = [0u8; PLAINTEXT_CHUNK_SIZE];
        loop {
            match conn.reader().read(&mut chunk) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => plain.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("TLS stream ended uncleanly: {}", err);
                    peer_closed = true;
                    break;
                }
            }
        }

        if !self.handshake_done && !conn.is_handshaking() {
            self.handshake_done = true;
            info!(
                "TLS established ({:?})",
                conn.negotiated_cipher_suite().map(|suite| suite.suite())
            );
            cx.schedule_next(LayerOp::Connect, LayerData::Empty, State::Ok);
        }
        if !plain.is_empty() {
            cx.schedule_next(LayerOp::Pull, LayerData::Raw(Bytes::from(plain)), State::Ok);
        }
        let flushed = self.flush(cx, false);
        if peer_closed {
            return cx.close_chain(State::ConnectionResetByPeer);
        }
        flushed
    }

    fn push(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if is_write_completion(state) {
            return match self.pending_writes.pop_front() {
                Some(true) => cx.schedule_next(LayerOp::Push, LayerData::Empty, state),
                Some(false) | None => State::Ok,
            };
        }
        let Some(conn) = self.conn.as_mut() else {
            return cx.schedule_next(LayerOp::Push, LayerData::Empty, State::FailedWriting);
        };
        let written = match &data {
            LayerData::Frame { header, payload } => conn
                .writer()
                .write_all(header)
                .and_then(|_| conn.writer().write_all(payload)),
            LayerData::Raw(bytes) => conn.writer().write_all(bytes),
            _ => return State::Ok,
        };
        if let Err(err) = written {
            error!("TLS plaintext write failed: {}", err);
            cx.schedule_next(LayerOp::Push, LayerData::Empty, State::FailedWriting);
            return cx.close_chain(State::TlsWriteError);
        }
        self.flush(cx, true)
    }

    fn close(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if let Some(conn) = self.conn.as_mut() {
            if self.handshake_done {
                conn.send_close_notify();
                self.flush(cx, false);
            }
        }
        self.conn = None;
        self.pending_writes.clear();
        self.handshake_done = false;
        cx.schedule_prev(LayerOp::Close, data, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roots_are_bundled() {
        let layer = TlsLayer::new(TlsConfig::default());
        assert!(!layer.roots().unwrap().is_empty());
    }

    #[test]
    fn test_garbage_bundle_is_rejected() {
        let mut layer = TlsLayer::new(TlsConfig::default());
        layer.ca = Some(Bytes::from_static(b"not a certificate"));
        assert_eq!(layer.roots().unwrap_err(), State::TlsFailedLoadingCertificate);
    }

    #[test]
    fn test_server_name_override() {
        let mut layer = TlsLayer::new(TlsConfig {
            ca_cert: None,
            server_name: Some("broker.xively.com".into()),
        });
        assert!(layer.start("10.0.0.1").is_ok());
        let mut layer = TlsLayer::new(TlsConfig::default());
        assert_eq!(layer.start("").unwrap_err(), State::TlsInitializationError);
    }
}
