//! Raw TCP socket session.
//!
//! Speaks SCPI straight over a TCP stream, the way most LAN instruments
//! expose port 5025. Framing is the same termination-character discipline
//! as the serial backend, with a much larger accumulation buffer so whole
//! waveform transfers fit.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::sync::Arc;

use crate::attr::{Attribute, Operation};
use crate::error::{Result, SocketError, TmError};
use crate::framing::{TermBuffer, Wait, read_terminated, wait_ready};
use crate::monitor::IoMonitor;
use crate::session::{InstrumentSession, SessionState};

/// Size of the per-session accumulation buffer for terminated reads
pub const SOCKET_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Conventional raw-socket SCPI port
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Session to an instrument over a raw TCP connection
pub struct SocketSession {
    stream: TcpStream,
    state: SessionState,
    buffer: TermBuffer,
}

impl SocketSession {
    /// Connect to `address:port`.
    ///
    /// Raw sockets have no device locking; `lock` must be false.
    pub fn open(
        address: &str,
        port: u16,
        lock: bool,
        _lock_timeout: u32,
        monitor: Option<Arc<IoMonitor>>,
    ) -> Result<Self> {
        if lock {
            return Err(TmError::LockingNotSupported);
        }

        tracing::debug!("connecting to {address}:{port}");
        let stream = TcpStream::connect((address, port))
            .map_err(|_| TmError::Socket(SocketError::Connect))?;

        Ok(Self {
            stream,
            state: SessionState::new(monitor),
            buffer: TermBuffer::new(SOCKET_BUFFER_SIZE),
        })
    }
}

impl InstrumentSession for SocketSession {
    fn write_buffer(&mut self, data: &[u8]) -> Result<usize> {
        let mut done = 0;
        while done < data.len() {
            wait_ready(self.stream.as_fd(), Wait::Write, self.state.timeout)?;
            match (&self.stream).write(&data[done..]) {
                Ok(count) => done += count,
                Err(e) if retriable(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Self {
            stream,
            state,
            buffer,
        } = self;
        let stream: &TcpStream = stream;
        let state: &SessionState = state;

        if !state.term_char_enable {
            wait_ready(stream.as_fd(), Wait::Read, state.timeout)?;
            return read_some(stream, buf, state.timeout);
        }

        read_terminated(
            buffer,
            state.term_char,
            buf,
            TmError::Socket(SocketError::RequestTooMuch),
            || wait_ready(stream.as_fd(), Wait::Read, state.timeout),
            |slice| read_some(stream, slice, state.timeout),
        )
    }

    fn set_attribute(&mut self, attribute: Attribute, value: u32) -> Result<()> {
        if self.state.set_base(attribute, value)? {
            Ok(())
        } else {
            Err(TmError::BadAttribute)
        }
    }

    fn get_attribute(&mut self, attribute: Attribute) -> Result<u32> {
        self.state.get_base(attribute).ok_or(TmError::BadAttribute)
    }

    fn io_operation(&mut self, _operation: Operation, _value: u32) -> Result<()> {
        Err(TmError::BadOperation)
    }

    fn state(&self) -> &SessionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

fn read_some(stream: &TcpStream, buf: &mut [u8], timeout: u32) -> Result<usize> {
    loop {
        match (&*stream).read(buf) {
            Ok(count) => return Ok(count),
            Err(e) if retriable(&e) => wait_ready(stream.as_fd(), Wait::Read, timeout)?,
            Err(e) => return Err(e.into()),
        }
    }
}

fn retriable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn instrument_stub(responses: Vec<&'static [u8]>) -> (u16, std::thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            for response in responses {
                peer.write_all(response).unwrap();
            }
            // Capture whatever the client sent before it hung up.
            let mut seen = Vec::new();
            let _ = std::io::Read::read_to_end(&mut peer, &mut seen);
            seen
        });
        (port, handle)
    }

    #[test]
    fn locking_is_refused_at_open() {
        assert!(matches!(
            SocketSession::open("127.0.0.1", 9, true, 5, None),
            Err(TmError::LockingNotSupported)
        ));
    }

    #[test]
    fn terminated_reads_split_lines() {
        let (port, handle) = instrument_stub(vec![b"FOO\nBAR\n"]);
        let mut session = SocketSession::open("127.0.0.1", port, false, 5, None).unwrap();

        assert_eq!(session.read_string().unwrap(), "FOO\n");
        assert_eq!(session.read_string().unwrap(), "BAR\n");

        session.write_string("*IDN?", true).unwrap();
        drop(session);
        assert_eq!(handle.join().unwrap(), b"*IDN?\n");
    }

    #[test]
    fn unterminated_read_returns_available_bytes() {
        let (port, handle) = instrument_stub(vec![b"RAWDATA"]);
        let mut session = SocketSession::open("127.0.0.1", port, false, 5, None).unwrap();
        session
            .set_attribute(Attribute::TermCharEnable, 0)
            .unwrap();

        let mut buf = [0u8; 32];
        let count = session.read_buffer(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"RAWDATA");

        drop(session);
        handle.join().unwrap();
    }

    #[test]
    fn silent_instrument_times_out() {
        let (port, handle) = instrument_stub(vec![]);
        let mut session = SocketSession::open("127.0.0.1", port, false, 5, None).unwrap();
        session.set_attribute(Attribute::Timeout, 1).unwrap();

        assert!(matches!(session.read_string(), Err(TmError::Timeout)));

        drop(session);
        handle.join().unwrap();
    }

    #[test]
    fn backend_specific_attributes_are_rejected() {
        let (port, handle) = instrument_stub(vec![]);
        let mut session = SocketSession::open("127.0.0.1", port, false, 5, None).unwrap();

        assert!(matches!(
            session.set_attribute(Attribute::SerialBaudrate, 9600),
            Err(TmError::BadAttribute)
        ));
        assert!(matches!(
            session.get_attribute(Attribute::StatusByte),
            Err(TmError::BadAttribute)
        ));
        assert!(matches!(
            session.io_operation(Operation::Trigger, 0),
            Err(TmError::BadOperation)
        ));

        drop(session);
        handle.join().unwrap();
    }
}
