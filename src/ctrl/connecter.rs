use std::io::prelude::*;
use std::net::*;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::rdma::qp::{ModifyQpError, Qp, QpAttr, QpEndpoint};
use crate::rdma::remote_mem::RemoteMem;

/// Side-band rendezvous error type.
#[derive(Debug, Error)]
pub enum CtrlError {
    /// The TCP channel failed.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// A peer sent something that does not decode.
    #[error("serialization error")]
    Json(#[from] serde_json::Error),

    /// Connecting the QP with the exchanged endpoint failed.
    #[error(transparent)]
    Modify(#[from] ModifyQpError),
}

fn stream_write(stream: &mut &TcpStream, buf: &[u8]) -> Result<(), CtrlError> {
    stream.write_all(&(buf.len() as u64).to_le_bytes())?;
    stream.write_all(buf)?;
    Ok(())
}

fn stream_read(stream: &mut &TcpStream) -> Result<Vec<u8>, CtrlError> {
    let mut len = [0; std::mem::size_of::<u64>()];
    stream.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len) as usize;

    let mut buf = vec![0; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Connection manager that exchanges endpoint and memory metadata with a
/// specific remote peer over TCP before the RoCE QPs are brought up.
///
/// One side [`listen`](Self::listen)s, the other [`connect`](Self::connect)s;
/// the exchange methods are symmetric after that.
pub struct Connecter {
    stream: TcpStream,
    is_server: bool,
}

impl Connecter {
    /// Wait for the remote peer to connect on the given address.
    pub fn listen<A: ToSocketAddrs>(addr: A) -> Result<Self, CtrlError> {
        let listener = TcpListener::bind(addr)?;
        let (stream, _) = listener.accept()?;
        Ok(Self {
            stream,
            is_server: true,
        })
    }

    /// Connect to a listening peer, retrying while it is not up yet.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, CtrlError> {
        const ATTEMPTS: usize = 100;
        let mut last_err = None;
        for _ in 0..ATTEMPTS {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    return Ok(Self {
                        stream,
                        is_server: false,
                    })
                }
                Err(err) => {
                    last_err = Some(err);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::TimedOut, "no attempt made"))
            .into())
    }

    fn exchange_bytes(&self, buf: &[u8]) -> Result<Vec<u8>, CtrlError> {
        let mut stream = &self.stream;
        if self.is_server {
            // First receive, then send.
            let peer = stream_read(&mut stream)?;
            stream_write(&mut stream, buf)?;
            Ok(peer)
        } else {
            // First send, then receive.
            stream_write(&mut stream, buf)?;
            stream_read(&mut stream)
        }
    }

    /// Exchange QP endpoint data with the remote side.
    pub fn exchange_endpoint(&self, ep: QpEndpoint) -> Result<QpEndpoint, CtrlError> {
        let ep = serde_json::to_vec(&ep)?;
        let peer = self.exchange_bytes(&ep)?;
        Ok(serde_json::from_slice(&peer)?)
    }

    /// Exchange endpoints and bring the QP to RTS against the peer, with
    /// both flows starting at PSN 0. Return the peer endpoint.
    pub fn connect_qp(&self, qp: &Qp) -> Result<QpEndpoint, CtrlError> {
        let peer = self.exchange_endpoint(qp.endpoint())?;
        qp.modify_qp(&QpAttr::rtr(peer.gid, peer.qpn, 0))?;
        qp.modify_qp(&QpAttr::rts(0))?;
        Ok(peer)
    }

    /// Send a local MR's information to the remote side.
    pub fn send_mr(&self, mr: RemoteMem) -> Result<(), CtrlError> {
        let mr = serde_json::to_vec(&mr)?;
        let mut stream = &self.stream;
        stream_write(&mut stream, &mr)
    }

    /// Receive sent MR information from the remote side.
    pub fn recv_mr(&self) -> Result<RemoteMem, CtrlError> {
        let mut stream = &self.stream;
        let buf = stream_read(&mut stream)?;
        Ok(serde_json::from_slice(&buf)?)
    }

    /// Exchange MR information with the remote side.
    pub fn exchange_mr(&self, mr: RemoteMem) -> Result<RemoteMem, CtrlError> {
        let mr = serde_json::to_vec(&mr)?;
        let peer = self.exchange_bytes(&mr)?;
        Ok(serde_json::from_slice(&peer)?)
    }

    /// Block until the remote side reaches its matching `sync` call.
    pub fn sync(&self) -> Result<(), CtrlError> {
        self.exchange_bytes(&[0])?;
        Ok(())
    }
}
