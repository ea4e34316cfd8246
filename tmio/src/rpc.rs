//! Minimal ONC-RPC v2 client over TCP, for the VXI-11 backend.
//!
//! Implements just what the instrument protocol needs: XDR primitives,
//! record-marked TCP transport, AUTH_NONE calls with xid matching, and a
//! portmapper GETPORT lookup to locate the CORE channel.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{Result, TmError, Vxi11Error};

const RPC_VERSION: u32 = 2;
const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const REPLY_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const AUTH_NONE: u32 = 0;
const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Well-known portmapper endpoint
pub(crate) const PORTMAP_PORT: u16 = 111;
const PORTMAP_PROGRAM: u32 = 100_000;
const PORTMAP_VERSION: u32 = 2;
const PMAPPROC_GETPORT: u32 = 3;
const IPPROTO_TCP: u32 = 6;

/// XDR encoder (big-endian, 4-byte aligned)
#[derive(Default)]
pub(crate) struct Xdr {
    buf: Vec<u8>,
}

impl Xdr {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub(crate) fn push_i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub(crate) fn push_bool(&mut self, value: bool) -> &mut Self {
        self.push_u32(value as u32)
    }

    /// Variable-length opaque: length, bytes, zero padding to 4 bytes.
    pub(crate) fn push_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.push_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        let pad = (4 - data.len() % 4) % 4;
        self.buf.extend_from_slice(&[0u8; 3][..pad]);
        self
    }

    pub(crate) fn push_string(&mut self, value: &str) -> &mut Self {
        self.push_opaque(value.as_bytes())
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// XDR decoder over a received reply body
pub(crate) struct XdrReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> XdrReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.pos + count > self.data.len() {
            return Err(Vxi11Error::Rpc.into());
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_opaque(&mut self) -> Result<&'a [u8]> {
        let length = self.read_u32()? as usize;
        let data = self.take(length)?;
        let pad = (4 - length % 4) % 4;
        self.take(pad)?;
        Ok(data)
    }
}

/// One TCP client bound to a single RPC program
pub(crate) struct RpcClient {
    stream: TcpStream,
    program: u32,
    version: u32,
    xid: u32,
}

impl RpcClient {
    /// Connect to `host:port`; `connect_error` is raised when the TCP
    /// connection cannot be established.
    pub(crate) fn connect(
        host: &str,
        port: u16,
        program: u32,
        version: u32,
        connect_error: TmError,
    ) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).map_err(|_| connect_error)?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            stream,
            program,
            version,
            xid: 1,
        })
    }

    /// Apply the session timeout to the underlying socket (zero blocks
    /// forever).
    pub(crate) fn set_timeout(&self, seconds: u32) -> Result<()> {
        let timeout = (seconds != 0).then(|| Duration::from_secs(u64::from(seconds)));
        self.stream.set_read_timeout(timeout).map_err(io_error)?;
        self.stream.set_write_timeout(timeout).map_err(io_error)?;
        Ok(())
    }

    /// One synchronous call; returns the reply body past the RPC header.
    pub(crate) fn call(&mut self, procedure: u32, args: &[u8]) -> Result<Vec<u8>> {
        self.xid = self.xid.wrapping_add(1);

        let mut message = Xdr::new();
        message
            .push_u32(self.xid)
            .push_u32(MSG_CALL)
            .push_u32(RPC_VERSION)
            .push_u32(self.program)
            .push_u32(self.version)
            .push_u32(procedure)
            .push_u32(AUTH_NONE)
            .push_u32(0)
            .push_u32(AUTH_NONE)
            .push_u32(0);
        let mut record = message.into_bytes();
        record.extend_from_slice(args);

        self.send_record(&record)?;
        let reply = self.read_record()?;

        let mut reader = XdrReader::new(&reply);
        if reader.read_u32()? != self.xid {
            return Err(Vxi11Error::Rpc.into());
        }
        if reader.read_u32()? != MSG_REPLY {
            return Err(Vxi11Error::Rpc.into());
        }
        if reader.read_u32()? != REPLY_ACCEPTED {
            return Err(Vxi11Error::Rpc.into());
        }
        reader.read_u32()?; // verifier flavor
        let verifier_length = reader.read_u32()? as usize;
        reader.take(verifier_length)?;
        if reader.read_u32()? != ACCEPT_SUCCESS {
            return Err(Vxi11Error::Rpc.into());
        }

        Ok(reply[reader.pos..].to_vec())
    }

    fn send_record(&mut self, record: &[u8]) -> Result<()> {
        let marker = LAST_FRAGMENT | record.len() as u32;
        self.stream
            .write_all(&marker.to_be_bytes())
            .map_err(io_error)?;
        self.stream.write_all(record).map_err(io_error)?;
        Ok(())
    }

    /// Read one record, reassembling fragments.
    fn read_record(&mut self) -> Result<Vec<u8>> {
        let mut record = Vec::new();
        loop {
            let mut marker = [0u8; 4];
            self.stream.read_exact(&mut marker).map_err(io_error)?;
            let marker = u32::from_be_bytes(marker);
            let length = (marker & !LAST_FRAGMENT) as usize;

            let start = record.len();
            record.resize(start + length, 0);
            self.stream
                .read_exact(&mut record[start..])
                .map_err(io_error)?;

            if marker & LAST_FRAGMENT != 0 {
                return Ok(record);
            }
        }
    }
}

/// Socket timeouts surface as timeout failures, everything else as a
/// generic RPC issue.
fn io_error(e: std::io::Error) -> TmError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => TmError::Timeout,
        _ => Vxi11Error::Rpc.into(),
    }
}

/// Ask the portmapper on `host` for the TCP port of `program`.
pub(crate) fn pmap_getport(host: &str, pmap_port: u16, program: u32, version: u32) -> Result<u16> {
    let mut client = RpcClient::connect(
        host,
        pmap_port,
        PORTMAP_PROGRAM,
        PORTMAP_VERSION,
        Vxi11Error::Connection.into(),
    )?;
    client.set_timeout(crate::session::DEFAULT_TIMEOUT)?;

    let mut args = Xdr::new();
    args.push_u32(program)
        .push_u32(version)
        .push_u32(IPPROTO_TCP)
        .push_u32(0);
    let reply = client.call(PMAPPROC_GETPORT, &args.into_bytes())?;

    let port = XdrReader::new(&reply).read_u32()?;
    if port == 0 || port > u32::from(u16::MAX) {
        return Err(Vxi11Error::Connection.into());
    }
    Ok(port as u16)
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Scripted RPC responder for backend tests.

    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::thread::JoinHandle;

    /// Calls observed by a [`serve`] instance: (procedure, argument bytes).
    pub(crate) type CallLog = Arc<Mutex<Vec<(u32, Vec<u8>)>>>;

    /// Spawn a single-connection RPC server; `respond` maps (procedure,
    /// args) to the reply body. The server exits when the peer disconnects.
    pub(crate) fn serve(
        respond: impl Fn(u32, &[u8]) -> Vec<u8> + Send + 'static,
    ) -> (u16, CallLog, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();

        let handle = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            loop {
                let mut marker = [0u8; 4];
                if peer.read_exact(&mut marker).is_err() {
                    return;
                }
                let length = (u32::from_be_bytes(marker) & !LAST_FRAGMENT) as usize;
                let mut record = vec![0u8; length];
                peer.read_exact(&mut record).unwrap();

                let mut reader = XdrReader::new(&record);
                let xid = reader.read_u32().unwrap();
                assert_eq!(reader.read_u32().unwrap(), MSG_CALL);
                assert_eq!(reader.read_u32().unwrap(), RPC_VERSION);
                let _program = reader.read_u32().unwrap();
                let _version = reader.read_u32().unwrap();
                let procedure = reader.read_u32().unwrap();
                for _ in 0..2 {
                    let _flavor = reader.read_u32().unwrap();
                    let auth_length = reader.read_u32().unwrap() as usize;
                    reader.take(auth_length).unwrap();
                }
                let args = &record[reader.pos..];
                seen.lock().unwrap().push((procedure, args.to_vec()));

                let body = respond(procedure, args);
                let mut reply = Xdr::new();
                reply
                    .push_u32(xid)
                    .push_u32(MSG_REPLY)
                    .push_u32(REPLY_ACCEPTED)
                    .push_u32(AUTH_NONE)
                    .push_u32(0)
                    .push_u32(ACCEPT_SUCCESS);
                let mut reply = reply.into_bytes();
                reply.extend_from_slice(&body);

                let marker = LAST_FRAGMENT | reply.len() as u32;
                peer.write_all(&marker.to_be_bytes()).unwrap();
                peer.write_all(&reply).unwrap();
            }
        });

        (port, log, handle)
    }
}
