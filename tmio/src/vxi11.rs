//! VXI-11 (LAN instrument) session.
//!
//! Two RPC channels are opened per session: the CORE channel carries all
//! regular traffic, the ASYNC channel exists solely for `device_abort`,
//! which can cancel a call the server is still blocked on. Writes are
//! chunked to the server-advertised `maxRecvSize`; every response carries a
//! VXI-11 error code which is retained as the `last-operation-error`
//! attribute and mapped onto the library error kinds.

use std::sync::Arc;

use crate::attr::{Attribute, Operation};
use crate::error::{Result, TmError, Vxi11Error};
use crate::monitor::IoMonitor;
use crate::rpc::{PORTMAP_PORT, RpcClient, Xdr, XdrReader, pmap_getport};
use crate::session::{InstrumentSession, SessionState};

const DEVICE_CORE: u32 = 0x0607AF;
const DEVICE_CORE_VERSION: u32 = 1;
const DEVICE_ASYNC: u32 = 0x0607B0;
const DEVICE_ASYNC_VERSION: u32 = 1;

/// CORE and ASYNC channel procedure numbers
mod procedure {
    pub const DEVICE_ABORT: u32 = 1;
    pub const CREATE_LINK: u32 = 10;
    pub const DEVICE_WRITE: u32 = 11;
    pub const DEVICE_READ: u32 = 12;
    pub const DEVICE_READSTB: u32 = 13;
    pub const DEVICE_TRIGGER: u32 = 14;
    pub const DEVICE_CLEAR: u32 = 15;
    pub const DEVICE_REMOTE: u32 = 16;
    pub const DEVICE_LOCAL: u32 = 17;
    pub const DEVICE_LOCK: u32 = 18;
    pub const DEVICE_UNLOCK: u32 = 19;
    pub const DESTROY_LINK: u32 = 23;
}

/// Device_Flags bits
mod device_flags {
    pub const WAIT_LOCK: u32 = 1 << 0;
    pub const END: u32 = 1 << 3;
    pub const TERM_CHR_SET: u32 = 1 << 7;
}

/// Session to a LAN instrument speaking the VXI-11 protocol
pub struct Vxi11Session {
    core: RpcClient,
    async_channel: RpcClient,
    link_id: i32,
    max_recv_size: u32,
    last_error: u32,
    state: SessionState,
}

impl Vxi11Session {
    /// Connect to the instrument at `address` and open a link to the
    /// logical device `device` (usually `inst0`).
    ///
    /// `lock` requests a protocol-level device lock at link creation,
    /// waiting up to `lock_timeout` seconds.
    pub fn open(
        address: &str,
        device: &str,
        lock: bool,
        lock_timeout: u32,
        monitor: Option<Arc<IoMonitor>>,
    ) -> Result<Self> {
        let core_port = pmap_getport(address, PORTMAP_PORT, DEVICE_CORE, DEVICE_CORE_VERSION)?;
        Self::open_at(address, core_port, device, lock, lock_timeout, monitor)
    }

    /// Open against a known CORE channel port (portmapper already asked).
    fn open_at(
        address: &str,
        core_port: u16,
        device: &str,
        lock: bool,
        lock_timeout: u32,
        monitor: Option<Arc<IoMonitor>>,
    ) -> Result<Self> {
        tracing::debug!("connecting VXI-11 CORE channel to {address}:{core_port}");
        let mut core = RpcClient::connect(
            address,
            core_port,
            DEVICE_CORE,
            DEVICE_CORE_VERSION,
            Vxi11Error::Connection.into(),
        )?;
        let state = SessionState::new(monitor);
        core.set_timeout(state.timeout)?;

        // Create_LinkParms: clientId, lockDevice, lock_timeout (ms), device
        let mut args = Xdr::new();
        args.push_i32(0)
            .push_bool(lock)
            .push_u32(lock_timeout.saturating_mul(1000))
            .push_string(device);
        let reply = core.call(procedure::CREATE_LINK, &args.into_bytes())?;

        let mut reader = XdrReader::new(&reply);
        let error = reader.read_u32()?;
        let link_id = reader.read_i32()?;
        let abort_port = reader.read_u32()?;
        let max_recv_size = reader.read_u32()?;
        if error != 0 {
            return Err(map_error(error, Vxi11Error::Link));
        }

        tracing::debug!(
            "link {link_id} established, abort port {abort_port}, maxRecvSize {max_recv_size}"
        );
        let async_channel = RpcClient::connect(
            address,
            abort_port as u16,
            DEVICE_ASYNC,
            DEVICE_ASYNC_VERSION,
            Vxi11Error::AbortConnection.into(),
        )?;

        Ok(Self {
            core,
            async_channel,
            link_id,
            max_recv_size,
            last_error: 0,
            state,
        })
    }

    fn io_timeout_ms(&self) -> u32 {
        self.state.timeout.saturating_mul(1000)
    }

    fn lock_flag(&self) -> u32 {
        if self.state.wait_lock {
            device_flags::WAIT_LOCK
        } else {
            0
        }
    }

    /// One CORE call with the session timeout applied to the socket.
    fn core_call(&mut self, proc_number: u32, args: Vec<u8>) -> Result<Vec<u8>> {
        self.core.set_timeout(self.state.timeout)?;
        self.core.call(proc_number, &args)
    }

    /// Device_GenericParms operation returning a bare Device_Error.
    fn generic_operation(&mut self, proc_number: u32, fallback: Vxi11Error) -> Result<()> {
        let mut args = Xdr::new();
        args.push_i32(self.link_id)
            .push_u32(self.lock_flag())
            .push_u32(self.io_timeout_ms())
            .push_u32(self.io_timeout_ms());
        let reply = self.core_call(proc_number, args.into_bytes())?;
        self.finish_operation(&reply, fallback)
    }

    /// Parse a Device_Error reply, retain the code, map non-zero codes.
    fn finish_operation(&mut self, reply: &[u8], fallback: Vxi11Error) -> Result<()> {
        let error = XdrReader::new(reply).read_u32()?;
        self.last_error = error;
        if error != 0 {
            return Err(map_error(error, fallback));
        }
        Ok(())
    }

    fn read_stb(&mut self) -> Result<u32> {
        let mut args = Xdr::new();
        args.push_i32(self.link_id)
            .push_u32(self.lock_flag())
            .push_u32(self.io_timeout_ms())
            .push_u32(self.io_timeout_ms());
        let reply = self.core_call(procedure::DEVICE_READSTB, args.into_bytes())?;

        let mut reader = XdrReader::new(&reply);
        let error = reader.read_u32()?;
        let stb = reader.read_u32()?;
        self.last_error = error;
        if error != 0 {
            return Err(map_error(error, Vxi11Error::ReadStb));
        }
        Ok(stb)
    }
}

impl Drop for Vxi11Session {
    fn drop(&mut self) {
        let mut args = Xdr::new();
        args.push_i32(self.link_id);
        let _ = self.core.call(procedure::DESTROY_LINK, &args.into_bytes());
    }
}

impl InstrumentSession for Vxi11Session {
    /// Send the buffer as a sequence of `device_write` calls of at most
    /// `maxRecvSize` bytes; the end indicator goes out with the final chunk
    /// only.
    fn write_buffer(&mut self, data: &[u8]) -> Result<usize> {
        let chunk_limit = self.max_recv_size.max(1) as usize;
        let mut done = 0;

        while done < data.len() {
            let remaining = data.len() - done;
            let chunk = remaining.min(chunk_limit);

            let mut flags = self.lock_flag();
            if self.state.set_end_indicator && remaining <= chunk_limit {
                flags |= device_flags::END;
            }

            let mut args = Xdr::new();
            args.push_i32(self.link_id)
                .push_u32(self.io_timeout_ms())
                .push_u32(self.io_timeout_ms())
                .push_u32(flags)
                .push_opaque(&data[done..done + chunk]);
            let reply = self.core_call(procedure::DEVICE_WRITE, args.into_bytes())?;

            let mut reader = XdrReader::new(&reply);
            let error = reader.read_u32()?;
            let size = reader.read_u32()?;
            self.last_error = error;
            if error != 0 {
                return Err(map_error(error, Vxi11Error::Write));
            }
            if size == 0 {
                return Err(Vxi11Error::Write.into());
            }
            done += size as usize;
        }

        Ok(done)
    }

    fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut flags = self.lock_flag();
        if self.state.term_char_enable {
            flags |= device_flags::TERM_CHR_SET;
        }

        let mut args = Xdr::new();
        args.push_i32(self.link_id)
            .push_u32(buf.len() as u32)
            .push_u32(self.io_timeout_ms())
            .push_u32(self.io_timeout_ms())
            .push_u32(flags)
            .push_u32(u32::from(self.state.term_char));
        let reply = self.core_call(procedure::DEVICE_READ, args.into_bytes())?;

        let mut reader = XdrReader::new(&reply);
        let error = reader.read_u32()?;
        let _reason = reader.read_u32()?;
        let data = reader.read_opaque()?;
        self.last_error = error;
        if error != 0 {
            return Err(map_error(error, Vxi11Error::Read));
        }

        let count = data.len().min(buf.len());
        buf[..count].copy_from_slice(&data[..count]);
        Ok(count)
    }

    fn set_attribute(&mut self, attribute: Attribute, value: u32) -> Result<()> {
        if self.state.set_base(attribute, value)? {
            Ok(())
        } else {
            // maxRecvSize and last-error are read-only.
            Err(TmError::BadAttribute)
        }
    }

    fn get_attribute(&mut self, attribute: Attribute) -> Result<u32> {
        if let Some(value) = self.state.get_base(attribute) {
            return Ok(value);
        }
        match attribute {
            Attribute::StatusByte => self.read_stb(),
            Attribute::Vxi11MaxRecvSize => Ok(self.max_recv_size),
            Attribute::Vxi11LastError => Ok(self.last_error),
            _ => Err(TmError::BadAttribute),
        }
    }

    fn io_operation(&mut self, operation: Operation, _value: u32) -> Result<()> {
        match operation {
            Operation::Trigger => {
                self.generic_operation(procedure::DEVICE_TRIGGER, Vxi11Error::Trigger)
            }
            Operation::Clear => self.generic_operation(procedure::DEVICE_CLEAR, Vxi11Error::Clear),
            Operation::Remote => {
                self.generic_operation(procedure::DEVICE_REMOTE, Vxi11Error::Remote)
            }
            Operation::Local => self.generic_operation(procedure::DEVICE_LOCAL, Vxi11Error::Local),
            Operation::Lock => {
                // Device_LockParms: lid, flags, lock_timeout (ms)
                let mut args = Xdr::new();
                args.push_i32(self.link_id)
                    .push_u32(self.lock_flag())
                    .push_u32(self.io_timeout_ms());
                let reply = self.core_call(procedure::DEVICE_LOCK, args.into_bytes())?;
                self.finish_operation(&reply, Vxi11Error::Lock)
            }
            Operation::Unlock => {
                let mut args = Xdr::new();
                args.push_i32(self.link_id);
                let reply = self.core_call(procedure::DEVICE_UNLOCK, args.into_bytes())?;
                self.finish_operation(&reply, Vxi11Error::Unlock)
            }
            Operation::Abort => {
                let mut args = Xdr::new();
                args.push_i32(self.link_id);
                self.async_channel.set_timeout(self.state.timeout)?;
                let reply = self
                    .async_channel
                    .call(procedure::DEVICE_ABORT, &args.into_bytes())?;
                self.finish_operation(&reply, Vxi11Error::Abort)
            }
            _ => Err(TmError::BadOperation),
        }
    }

    fn state(&self) -> &SessionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

/// Map a VXI-11 response error code onto a library error kind; codes
/// without a dedicated kind fail with the operation-specific `fallback`.
fn map_error(code: u32, fallback: Vxi11Error) -> TmError {
    match code {
        1 => Vxi11Error::Syntax.into(),
        3 => Vxi11Error::DeviceNotAccessible.into(),
        4 => Vxi11Error::InvalidLinkId.into(),
        5 => Vxi11Error::Parameter.into(),
        6 => Vxi11Error::ChannelNotEstablished.into(),
        8 => TmError::OperationUnsupported,
        9 => Vxi11Error::OutOfResources.into(),
        11 => TmError::DeviceLocked,
        12 => TmError::NoLockHeld,
        15 => TmError::Timeout,
        17 => TmError::IoIssue,
        21 => Vxi11Error::InvalidAddress.into(),
        23 => TmError::TransactionAborted,
        29 => Vxi11Error::ChannelEstablished.into(),
        _ => fallback.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::test_server::{CallLog, serve};
    use crate::session::InstrumentSession;

    /// CORE channel stub: answers create_link with the given maxRecvSize,
    /// device_write with the per-chunk size, device_read with `read_data`,
    /// and everything else with the scripted error code.
    fn core_stub(
        max_recv_size: u32,
        write_error: u32,
        read_data: &'static [u8],
        abort_port: u16,
    ) -> (u16, CallLog, std::thread::JoinHandle<()>) {
        serve(move |proc_number, args| {
            let mut body = Xdr::new();
            match proc_number {
                procedure::CREATE_LINK => {
                    body.push_u32(0) // error
                        .push_i32(77) // link id
                        .push_u32(u32::from(abort_port))
                        .push_u32(max_recv_size);
                }
                procedure::DEVICE_WRITE => {
                    let mut reader = XdrReader::new(args);
                    let _lid = reader.read_i32().unwrap();
                    let _io = reader.read_u32().unwrap();
                    let _lock = reader.read_u32().unwrap();
                    let _flags = reader.read_u32().unwrap();
                    let data = reader.read_opaque().unwrap();
                    body.push_u32(write_error).push_u32(data.len() as u32);
                }
                procedure::DEVICE_READ => {
                    body.push_u32(0).push_u32(0).push_opaque(read_data);
                }
                procedure::DEVICE_READSTB => {
                    body.push_u32(0).push_u32(0x42);
                }
                _ => {
                    body.push_u32(0);
                }
            }
            body.into_bytes()
        })
    }

    fn abort_stub() -> (u16, CallLog, std::thread::JoinHandle<()>) {
        serve(|proc_number, _| {
            assert_eq!(proc_number, procedure::DEVICE_ABORT);
            let mut body = Xdr::new();
            body.push_u32(0);
            body.into_bytes()
        })
    }

    fn write_flags(args: &[u8]) -> u32 {
        let mut reader = XdrReader::new(args);
        let _lid = reader.read_i32().unwrap();
        let _io = reader.read_u32().unwrap();
        let _lock = reader.read_u32().unwrap();
        reader.read_u32().unwrap()
    }

    fn write_payload_len(args: &[u8]) -> usize {
        let mut reader = XdrReader::new(args);
        let _lid = reader.read_i32().unwrap();
        let _io = reader.read_u32().unwrap();
        let _lock = reader.read_u32().unwrap();
        let _flags = reader.read_u32().unwrap();
        reader.read_opaque().unwrap().len()
    }

    fn open_stub_session(
        core_port: u16,
    ) -> Vxi11Session {
        Vxi11Session::open_at("127.0.0.1", core_port, "inst0", false, 5, None).unwrap()
    }

    #[test]
    fn writes_are_chunked_to_max_recv_size() {
        let (abort_port, _abort_log, _abort) = abort_stub();
        let (core_port, log, _core) = core_stub(256, 0, b"", abort_port);

        let mut session = open_stub_session(core_port);
        session
            .set_attribute(Attribute::SetEndIndicator, 1)
            .unwrap();

        let data = vec![0x55u8; 600];
        assert_eq!(session.write_buffer(&data).unwrap(), 600);
        drop(session);

        let calls = log.lock().unwrap();
        let writes: Vec<&(u32, Vec<u8>)> = calls
            .iter()
            .filter(|(p, _)| *p == procedure::DEVICE_WRITE)
            .collect();
        assert_eq!(writes.len(), 3);
        assert_eq!(write_payload_len(&writes[0].1), 256);
        assert_eq!(write_payload_len(&writes[1].1), 256);
        assert_eq!(write_payload_len(&writes[2].1), 88);
        // End indicator rides on the last chunk only.
        assert_eq!(write_flags(&writes[0].1) & device_flags::END, 0);
        assert_eq!(write_flags(&writes[1].1) & device_flags::END, 0);
        assert_ne!(write_flags(&writes[2].1) & device_flags::END, 0);
    }

    #[test]
    fn read_passes_term_char_flag_and_returns_data() {
        let (abort_port, _abort_log, _abort) = abort_stub();
        let (core_port, log, _core) = core_stub(1024, 0, b"IDN,RESPONSE\n", abort_port);

        let mut session = open_stub_session(core_port);
        let mut buf = [0u8; 64];
        let count = session.read_buffer(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"IDN,RESPONSE\n");
        drop(session);

        let calls = log.lock().unwrap();
        let (_, args) = calls
            .iter()
            .find(|(p, _)| *p == procedure::DEVICE_READ)
            .unwrap();
        let mut reader = XdrReader::new(args);
        let _lid = reader.read_i32().unwrap();
        let request_size = reader.read_u32().unwrap();
        let _io = reader.read_u32().unwrap();
        let _lock = reader.read_u32().unwrap();
        let flags = reader.read_u32().unwrap();
        let term_char = reader.read_u32().unwrap();
        assert_eq!(request_size, 64);
        assert_ne!(flags & device_flags::TERM_CHR_SET, 0);
        assert_eq!(term_char, u32::from(b'\n'));
    }

    #[test]
    fn server_error_codes_map_to_library_kinds() {
        let (abort_port, _abort_log, _abort) = abort_stub();
        let (core_port, _log, _core) = core_stub(1024, 11, b"", abort_port);

        let mut session = open_stub_session(core_port);
        assert!(matches!(
            session.write_buffer(b"*RST\n"),
            Err(TmError::DeviceLocked)
        ));
        assert_eq!(
            session.get_attribute(Attribute::Vxi11LastError).unwrap(),
            11
        );
    }

    #[test]
    fn status_byte_comes_from_device_readstb() {
        let (abort_port, _abort_log, _abort) = abort_stub();
        let (core_port, _log, _core) = core_stub(1024, 0, b"", abort_port);

        let mut session = open_stub_session(core_port);
        assert_eq!(session.get_attribute(Attribute::StatusByte).unwrap(), 0x42);
    }

    #[test]
    fn abort_goes_out_on_the_async_channel() {
        let (abort_port, abort_log, _abort) = abort_stub();
        let (core_port, _log, _core) = core_stub(1024, 0, b"", abort_port);

        let mut session = open_stub_session(core_port);
        session.io_operation(Operation::Abort, 0).unwrap();
        drop(session);

        let calls = abort_log.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, procedure::DEVICE_ABORT);
    }

    #[test]
    fn drop_tears_down_the_link() {
        let (abort_port, _abort_log, _abort) = abort_stub();
        let (core_port, log, _core) = core_stub(1024, 0, b"", abort_port);

        let session = open_stub_session(core_port);
        drop(session);

        let calls = log.lock().unwrap();
        assert!(calls.iter().any(|(p, _)| *p == procedure::DESTROY_LINK));
    }

    #[test]
    fn max_recv_size_is_exposed_read_only() {
        let (abort_port, _abort_log, _abort) = abort_stub();
        let (core_port, _log, _core) = core_stub(4096, 0, b"", abort_port);

        let mut session = open_stub_session(core_port);
        assert_eq!(
            session.get_attribute(Attribute::Vxi11MaxRecvSize).unwrap(),
            4096
        );
        assert!(matches!(
            session.set_attribute(Attribute::Vxi11MaxRecvSize, 1),
            Err(TmError::BadAttribute)
        ));
    }

    #[test]
    fn error_map_covers_the_protocol_table() {
        assert!(matches!(
            map_error(1, Vxi11Error::Write),
            TmError::Vxi11(Vxi11Error::Syntax)
        ));
        assert!(matches!(map_error(8, Vxi11Error::Write), TmError::OperationUnsupported));
        assert!(matches!(map_error(11, Vxi11Error::Write), TmError::DeviceLocked));
        assert!(matches!(map_error(12, Vxi11Error::Write), TmError::NoLockHeld));
        assert!(matches!(map_error(15, Vxi11Error::Write), TmError::Timeout));
        assert!(matches!(map_error(17, Vxi11Error::Write), TmError::IoIssue));
        assert!(matches!(map_error(23, Vxi11Error::Write), TmError::TransactionAborted));
        assert!(matches!(
            map_error(29, Vxi11Error::Write),
            TmError::Vxi11(Vxi11Error::ChannelEstablished)
        ));
        assert!(matches!(
            map_error(99, Vxi11Error::Trigger),
            TmError::Vxi11(Vxi11Error::Trigger)
        ));
    }
}
