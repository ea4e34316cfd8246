//! Session interface and the shared framing layer.
//!
//! Each transport backend implements the five [`InstrumentSession`]
//! primitives; everything above them (line I/O, IEEE 488.2 binary blocks,
//! SCPI helpers, the canonical control operations) is provided once here and
//! works against any backend. The factory hands sessions out as
//! `Box<dyn InstrumentSession>`.

use std::sync::Arc;

use crate::attr::{Attribute, Operation};
use crate::error::{Result, TmError};
use crate::monitor::{Direction, IoMonitor};

/// Default size hint for [`InstrumentSession::read_string`] buffers
pub const DEFAULT_STRING_SIZE: usize = 200;

/// Default session timeout in seconds
pub const DEFAULT_TIMEOUT: u32 = 5;

/// Base attribute set common to every transport, plus the session's
/// instrument name tag and the optional traffic monitor.
///
/// Backends embed one `SessionState` and consult it from their I/O paths;
/// `set_base`/`get_base` handle the shared attributes and report unknown
/// ones back so the backend can layer its own on top.
pub struct SessionState {
    pub name: String,
    pub monitor: Option<Arc<IoMonitor>>,
    pub string_size: usize,
    pub throw_on_scpi_error: bool,
    pub tracing: bool,
    pub eol_char: u8,
    /// Timeout in seconds; zero waits forever.
    pub timeout: u32,
    pub term_char_enable: bool,
    pub term_char: u8,
    pub wait_lock: bool,
    pub set_end_indicator: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            name: String::new(),
            monitor: None,
            string_size: DEFAULT_STRING_SIZE,
            throw_on_scpi_error: true,
            tracing: false,
            eol_char: b'\n',
            timeout: DEFAULT_TIMEOUT,
            term_char_enable: true,
            term_char: b'\n',
            wait_lock: false,
            set_end_indicator: false,
        }
    }
}

impl SessionState {
    pub fn new(monitor: Option<Arc<IoMonitor>>) -> Self {
        Self {
            monitor,
            ..Self::default()
        }
    }

    /// Handle a base attribute write. Returns `Ok(false)` when the
    /// attribute is not a base attribute, so the caller can try its own.
    pub fn set_base(&mut self, attribute: Attribute, value: u32) -> Result<bool> {
        match attribute {
            Attribute::StringSize => self.string_size = value as usize,
            Attribute::ThrowOnScpiError => self.throw_on_scpi_error = flag(value)?,
            Attribute::Tracing => self.tracing = flag(value)?,
            Attribute::EolChar => self.eol_char = byte(value)?,
            Attribute::Timeout => self.timeout = value,
            Attribute::TermCharEnable => self.term_char_enable = flag(value)?,
            Attribute::TermChar => self.term_char = byte(value)?,
            Attribute::WaitLock => self.wait_lock = flag(value)?,
            Attribute::SetEndIndicator => self.set_end_indicator = flag(value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Read a base attribute, or `None` when it is not a base attribute.
    pub fn get_base(&self, attribute: Attribute) -> Option<u32> {
        match attribute {
            Attribute::StringSize => Some(self.string_size as u32),
            Attribute::ThrowOnScpiError => Some(self.throw_on_scpi_error as u32),
            Attribute::Tracing => Some(self.tracing as u32),
            Attribute::EolChar => Some(self.eol_char as u32),
            Attribute::Timeout => Some(self.timeout),
            Attribute::TermCharEnable => Some(self.term_char_enable as u32),
            Attribute::TermChar => Some(self.term_char as u32),
            Attribute::WaitLock => Some(self.wait_lock as u32),
            Attribute::SetEndIndicator => Some(self.set_end_indicator as u32),
            _ => None,
        }
    }

    fn trace(&self, direction: Direction, payload: &str, eol: bool) {
        if self.tracing {
            if let Some(monitor) = &self.monitor {
                monitor.log(&self.name, direction, payload, eol);
            }
        }
    }
}

fn flag(value: u32) -> Result<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(TmError::BadAttributeValue),
    }
}

fn byte(value: u32) -> Result<u8> {
    u8::try_from(value).map_err(|_| TmError::BadAttributeValue)
}

/// Session to one instrument over one transport endpoint.
///
/// The five required methods are the backend primitives; all other methods
/// are transport-independent and provided by the trait.
pub trait InstrumentSession {
    /// Write the whole buffer to the device, honoring the session timeout.
    fn write_buffer(&mut self, data: &[u8]) -> Result<usize>;

    /// Read up to `buf.len()` bytes, honoring the termination-character
    /// rules and the session timeout.
    fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn set_attribute(&mut self, attribute: Attribute, value: u32) -> Result<()>;

    fn get_attribute(&mut self, attribute: Attribute) -> Result<u32>;

    /// Transport-level control operation (trigger, clear, lock, ...).
    fn io_operation(&mut self, operation: Operation, value: u32) -> Result<()>;

    fn state(&self) -> &SessionState;

    fn state_mut(&mut self) -> &mut SessionState;

    /// Write a text message, appending the end-of-line character when `eol`
    /// is set.
    fn write_string(&mut self, message: &str, eol: bool) -> Result<usize> {
        let count = if eol {
            let mut bytes = Vec::with_capacity(message.len() + 1);
            bytes.extend_from_slice(message.as_bytes());
            bytes.push(self.state().eol_char);
            self.write_buffer(&bytes)?
        } else {
            self.write_buffer(message.as_bytes())?
        };
        self.state().trace(Direction::Out, message, eol);
        Ok(count)
    }

    /// Read one response of at most `string_size` bytes (the termination
    /// character, when enabled, is included in the result).
    fn read_string(&mut self) -> Result<String> {
        let mut buf = vec![0u8; self.state().string_size.max(1)];
        let count = self.read_buffer(&mut buf)?;
        buf.truncate(count);
        let message = String::from_utf8_lossy(&buf).into_owned();
        match message.strip_suffix(self.state().term_char as char) {
            Some(stripped) => self.state().trace(Direction::In, stripped, true),
            None => self.state().trace(Direction::In, &message, false),
        }
        Ok(message)
    }

    /// Write an integer as its decimal ASCII representation.
    fn write_int(&mut self, value: i32, eol: bool) -> Result<usize> {
        self.write_string(&value.to_string(), eol)
    }

    /// Read a line and parse it as a decimal integer.
    fn read_int(&mut self) -> Result<i32> {
        let response = self.read_string()?;
        response.trim().parse().map_err(|_| TmError::Format)
    }

    /// Write an IEEE 488.2 definite-length binary block (`#<d><N><data>`).
    fn write_binblock(&mut self, data: &[u8]) -> Result<usize> {
        let length = data.len().to_string();
        let header = format!("#{}{}", length.len(), length);
        self.write_buffer(header.as_bytes())?;
        self.write_buffer(data)?;
        Ok(data.len())
    }

    /// Read an IEEE 488.2 definite-length binary block of at most `max`
    /// bytes.
    ///
    /// Termination-character handling is disabled for the duration of the
    /// call and restored on every exit path.
    fn read_binblock(&mut self, max: usize) -> Result<Vec<u8>> {
        let saved = self.get_attribute(Attribute::TermCharEnable)?;
        self.set_attribute(Attribute::TermCharEnable, 0)?;

        let result = read_binblock_raw(self, max);

        let restore = self.set_attribute(Attribute::TermCharEnable, saved);
        let data = result?;
        restore?;
        Ok(data)
    }

    /// Write `query` and read the response line.
    fn query_string(&mut self, query: &str) -> Result<String> {
        self.write_string(query, true)?;
        self.read_string()
    }

    /// Write `query` and read an integer response.
    fn query_int(&mut self, query: &str) -> Result<i32> {
        self.write_string(query, true)?;
        self.read_int()
    }

    fn trigger(&mut self) -> Result<()> {
        self.io_operation(Operation::Trigger, 0)
    }

    fn clear(&mut self) -> Result<()> {
        self.io_operation(Operation::Clear, 0)
    }

    fn remote(&mut self) -> Result<()> {
        self.io_operation(Operation::Remote, 0)
    }

    fn local(&mut self) -> Result<()> {
        self.io_operation(Operation::Local, 0)
    }

    fn lock(&mut self) -> Result<()> {
        self.io_operation(Operation::Lock, 0)
    }

    fn unlock(&mut self) -> Result<()> {
        self.io_operation(Operation::Unlock, 0)
    }

    fn abort(&mut self) -> Result<()> {
        self.io_operation(Operation::Abort, 0)
    }

    /// Read the instrument status byte.
    fn read_stb(&mut self) -> Result<u32> {
        self.get_attribute(Attribute::StatusByte)
    }

    fn scpi_rst(&mut self) -> Result<()> {
        self.write_string("*RST", true)?;
        Ok(())
    }

    fn scpi_cls(&mut self) -> Result<()> {
        self.write_string("*CLS", true)?;
        Ok(())
    }

    /// Drain the instrument's SCPI error queue.
    ///
    /// Polls `SYSTEM:ERROR?` until the instrument reports code 0 or
    /// `max_cycles` is reached. Returns the non-zero error lines; fails
    /// with `ScpiUnableToClear` when the queue never drains and with
    /// `Scpi` when errors were seen and `throw_on_scpi_error` is set.
    fn scpi_check_errors(&mut self, max_cycles: u32) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        let mut drained = false;

        for _ in 0..max_cycles {
            self.write_string("SYSTEM:ERROR?", true)?;
            let response = self.read_string()?;
            let line = response.trim_end().to_string();
            if scpi_error_code(&line)? == 0 {
                drained = true;
                break;
            }
            errors.push(line);
        }

        if !drained {
            return Err(TmError::ScpiUnableToClear);
        }
        if !errors.is_empty() && self.state().throw_on_scpi_error {
            return Err(TmError::Scpi(errors.join("; ")));
        }
        Ok(errors)
    }
}

/// Parse the numeric code out of a `<code>,"<text>"` SCPI error response.
fn scpi_error_code(line: &str) -> Result<i32> {
    let (code, _) = line.split_once(',').ok_or(TmError::Format)?;
    code.trim().parse().map_err(|_| TmError::Format)
}

/// Binary block decode against the raw primitives; the caller has already
/// disabled termination-character handling.
fn read_binblock_raw<S: InstrumentSession + ?Sized>(
    session: &mut S,
    max: usize,
) -> Result<Vec<u8>> {
    let mut header = [0u8; 1];
    read_exact(session, &mut header)?;
    if header[0] != b'#' {
        return Err(TmError::BinblockHeader);
    }

    read_exact(session, &mut header)?;
    let digits = usize::from(header[0].wrapping_sub(b'0'));
    if !(1..=9).contains(&digits) {
        return Err(TmError::BinblockHeader);
    }

    let mut length_field = [0u8; 9];
    read_exact(session, &mut length_field[..digits])?;
    let mut length = 0usize;
    for &digit in &length_field[..digits] {
        if !digit.is_ascii_digit() {
            return Err(TmError::BinblockHeader);
        }
        length = length * 10 + usize::from(digit - b'0');
    }

    if length > max {
        return Err(TmError::BinblockSize);
    }

    let mut data = vec![0u8; length];
    read_exact(session, &mut data)?;
    Ok(data)
}

fn read_exact<S: InstrumentSession + ?Sized>(session: &mut S, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let count = session.read_buffer(&mut buf[done..])?;
        if count == 0 {
            return Err(TmError::IoIssue);
        }
        done += count;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory session: `rx` feeds reads, `tx` captures writes.
    struct MockSession {
        state: SessionState,
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        term_toggles: Vec<u32>,
        operations: Vec<(Operation, u32)>,
    }

    impl MockSession {
        fn new() -> Self {
            Self {
                state: SessionState::default(),
                rx: VecDeque::new(),
                tx: Vec::new(),
                term_toggles: Vec::new(),
                operations: Vec::new(),
            }
        }

        fn feed(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes);
        }
    }

    impl InstrumentSession for MockSession {
        fn write_buffer(&mut self, data: &[u8]) -> Result<usize> {
            self.tx.extend_from_slice(data);
            Ok(data.len())
        }

        fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut count = 0;
            while count < buf.len() {
                let Some(byte) = self.rx.pop_front() else {
                    break;
                };
                buf[count] = byte;
                count += 1;
                if self.state.term_char_enable && byte == self.state.term_char {
                    break;
                }
            }
            Ok(count)
        }

        fn set_attribute(&mut self, attribute: Attribute, value: u32) -> Result<()> {
            if attribute == Attribute::TermCharEnable {
                self.term_toggles.push(value);
            }
            if self.state.set_base(attribute, value)? {
                Ok(())
            } else {
                Err(TmError::BadAttribute)
            }
        }

        fn get_attribute(&mut self, attribute: Attribute) -> Result<u32> {
            self.state.get_base(attribute).ok_or(TmError::BadAttribute)
        }

        fn io_operation(&mut self, operation: Operation, value: u32) -> Result<()> {
            self.operations.push((operation, value));
            Ok(())
        }

        fn state(&self) -> &SessionState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut SessionState {
            &mut self.state
        }
    }

    #[test]
    fn write_string_appends_configured_eol() {
        let mut session = MockSession::new();
        session.write_string("*IDN?", true).unwrap();
        assert_eq!(session.tx, b"*IDN?\n");

        session.tx.clear();
        session.write_string("*IDN?", false).unwrap();
        assert_eq!(session.tx, b"*IDN?");

        session.tx.clear();
        session.set_attribute(Attribute::EolChar, b'\r' as u32).unwrap();
        session.write_string("*IDN?", true).unwrap();
        assert_eq!(session.tx, b"*IDN?\r");
    }

    #[test]
    fn read_string_returns_terminated_lines_in_sequence() {
        let mut session = MockSession::new();
        session.feed(b"FOO\nBAR\n");
        assert_eq!(session.read_string().unwrap(), "FOO\n");
        assert_eq!(session.read_string().unwrap(), "BAR\n");
    }

    #[test]
    fn read_int_parses_signed_decimals() {
        let mut session = MockSession::new();
        session.feed(b"-42\n");
        assert_eq!(session.read_int().unwrap(), -42);

        session.feed(b"+17\n");
        assert_eq!(session.read_int().unwrap(), 17);

        session.feed(b"bogus\n");
        assert!(matches!(session.read_int(), Err(TmError::Format)));
    }

    #[test]
    fn write_int_emits_decimal_ascii() {
        let mut session = MockSession::new();
        session.write_int(-113, true).unwrap();
        assert_eq!(session.tx, b"-113\n");
    }

    #[test]
    fn write_binblock_emits_header_then_payload() {
        let mut session = MockSession::new();
        let payload = vec![0xAA; 1234];
        session.write_binblock(&payload).unwrap();

        assert_eq!(&session.tx[..6], b"#41234");
        assert_eq!(&session.tx[6..], &payload[..]);
    }

    #[test]
    fn read_binblock_round_trips_and_restores_term_handling() {
        let mut session = MockSession::new();
        let payload = vec![0xAA; 1234];
        session.feed(b"#41234");
        session.feed(&payload);

        let data = session.read_binblock(4096).unwrap();
        assert_eq!(data, payload);
        // Disabled for the read, then restored to the entry value.
        assert_eq!(session.term_toggles, vec![0, 1]);
        assert!(session.state.term_char_enable);
    }

    #[test]
    fn read_binblock_rejects_bad_lead_character() {
        let mut session = MockSession::new();
        session.feed(b"X41234");
        assert!(matches!(
            session.read_binblock(4096),
            Err(TmError::BinblockHeader)
        ));
        // Restored even on the failure path.
        assert_eq!(session.term_toggles, vec![0, 1]);
        assert!(session.state.term_char_enable);
    }

    #[test]
    fn read_binblock_rejects_bad_digit_count() {
        for header in [&b"#0123"[..], &b"#A123"[..]] {
            let mut session = MockSession::new();
            session.feed(header);
            assert!(matches!(
                session.read_binblock(4096),
                Err(TmError::BinblockHeader)
            ));
        }
    }

    #[test]
    fn read_binblock_rejects_nondigit_length_field() {
        let mut session = MockSession::new();
        session.feed(b"#2x9");
        assert!(matches!(
            session.read_binblock(4096),
            Err(TmError::BinblockHeader)
        ));
    }

    #[test]
    fn read_binblock_checks_size_before_consuming_payload() {
        let mut session = MockSession::new();
        session.feed(b"#216");
        session.feed(&[0u8; 16]);

        assert!(matches!(
            session.read_binblock(10),
            Err(TmError::BinblockSize)
        ));
        // The declared payload is still unread.
        assert_eq!(session.rx.len(), 16);
    }

    #[test]
    fn query_string_writes_then_reads() {
        let mut session = MockSession::new();
        session.feed(b"ACME,4461\n");
        let response = session.query_string("*IDN?").unwrap();
        assert_eq!(session.tx, b"*IDN?\n");
        assert_eq!(response, "ACME,4461\n");
    }

    #[test]
    fn scpi_check_errors_collects_until_queue_drains() {
        let mut session = MockSession::new();
        session.state.throw_on_scpi_error = false;
        session.feed(b"-113,\"Undefined header\"\n");
        session.feed(b"+0,\"No error\"\n");

        let errors = session.scpi_check_errors(10).unwrap();
        assert_eq!(errors, vec!["-113,\"Undefined header\"".to_string()]);
        // One query per response.
        assert_eq!(session.tx, b"SYSTEM:ERROR?\nSYSTEM:ERROR?\n");
    }

    #[test]
    fn scpi_check_errors_throws_when_configured() {
        let mut session = MockSession::new();
        session.feed(b"-113,\"Undefined header\"\n");
        session.feed(b"+0,\"No error\"\n");

        assert!(matches!(
            session.scpi_check_errors(10),
            Err(TmError::Scpi(_))
        ));
    }

    #[test]
    fn scpi_check_errors_reports_undrained_queue() {
        let mut session = MockSession::new();
        session.state.throw_on_scpi_error = false;
        session.feed(b"-113,\"Undefined header\"\n");
        session.feed(b"-110,\"Command header error\"\n");

        assert!(matches!(
            session.scpi_check_errors(2),
            Err(TmError::ScpiUnableToClear)
        ));
    }

    #[test]
    fn control_helpers_dispatch_canonical_operations() {
        let mut session = MockSession::new();
        session.trigger().unwrap();
        session.clear().unwrap();
        session.remote().unwrap();
        session.local().unwrap();
        session.lock().unwrap();
        session.unlock().unwrap();
        session.abort().unwrap();

        let ops: Vec<Operation> = session.operations.iter().map(|(op, _)| *op).collect();
        assert_eq!(
            ops,
            vec![
                Operation::Trigger,
                Operation::Clear,
                Operation::Remote,
                Operation::Local,
                Operation::Lock,
                Operation::Unlock,
                Operation::Abort,
            ]
        );
    }

    #[test]
    fn scpi_shorthands_write_expected_commands() {
        let mut session = MockSession::new();
        session.scpi_rst().unwrap();
        session.scpi_cls().unwrap();
        assert_eq!(session.tx, b"*RST\n*CLS\n");
    }

    #[test]
    fn base_attributes_round_trip() {
        let mut session = MockSession::new();
        for (attribute, value) in [
            (Attribute::StringSize, 512),
            (Attribute::ThrowOnScpiError, 0),
            (Attribute::Tracing, 1),
            (Attribute::EolChar, 13),
            (Attribute::Timeout, 30),
            (Attribute::TermCharEnable, 0),
            (Attribute::TermChar, 10),
            (Attribute::WaitLock, 1),
            (Attribute::SetEndIndicator, 1),
        ] {
            session.set_attribute(attribute, value).unwrap();
            assert_eq!(session.get_attribute(attribute).unwrap(), value);
        }
    }

    #[test]
    fn base_attribute_values_are_validated() {
        let mut session = MockSession::new();
        assert!(matches!(
            session.set_attribute(Attribute::Tracing, 2),
            Err(TmError::BadAttributeValue)
        ));
        assert!(matches!(
            session.set_attribute(Attribute::TermChar, 256),
            Err(TmError::BadAttributeValue)
        ));
        assert!(matches!(
            session.set_attribute(Attribute::SerialBaudrate, 9600),
            Err(TmError::BadAttribute)
        ));
    }
}
