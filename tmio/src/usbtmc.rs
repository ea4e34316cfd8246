//! USBTMC session through the kernel driver's character devices.
//!
//! The driver exposes one node per instrument (`/dev/usbtmcN`) for bulk
//! data, and a control node (`/dev/usbtmc0`) that accepts 16-byte command
//! structures for enumeration, attributes and USB488 operations. Bulk
//! message framing (headers, bTags, padding) lives in the kernel; this
//! backend is a thin session over the two nodes.
//!
//! The control node is opened fresh for every control message so sessions
//! never interfere through a shared descriptor.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::Arc;

use crate::attr::{Attribute, Operation};
use crate::error::{Result, TmError, UsbtmcError};
use crate::monitor::IoMonitor;
use crate::session::{InstrumentSession, SessionState};

/// Control node servicing enumeration and control messages
const CONTROL_NODE: &str = "/dev/usbtmc0";

/// Highest minor number probed during enumeration
pub const USBTMC_MAX_DEVICES: u32 = 32;

/// Control message command codes (`command` field)
mod command {
    pub const SET_ATTRIBUTE: u32 = 1;
    pub const GET_ATTRIBUTE: u32 = 2;
    pub const REPORT_INSTRUMENT: u32 = 3;
    pub const IO_OPERATION: u32 = 4;
}

/// Driver attribute codes (`argument` field of SET/GET_ATTRIBUTE)
mod driver_attribute {
    pub const TIMEOUT: u32 = 1;
    pub const TERMCHAR_ENABLE: u32 = 2;
    pub const TERMCHAR: u32 = 3;
    pub const INTERFACE_CAPABILITIES: u32 = 4;
    pub const DEVICE_CAPABILITIES: u32 = 5;
    pub const USB488_INTERFACE_CAPABILITIES: u32 = 6;
    pub const USB488_DEVICE_CAPABILITIES: u32 = 7;
    pub const STATUS_BYTE: u32 = 8;
}

/// Driver operation codes (`argument` field of IO_OPERATION)
mod driver_operation {
    pub const INDICATOR_PULSE: u32 = 1;
    pub const ABORT_WRITE: u32 = 2;
    pub const ABORT_READ: u32 = 3;
    pub const CLEAR_OUT_HALT: u32 = 4;
    pub const CLEAR_IN_HALT: u32 = 5;
    pub const RESET: u32 = 6;
    pub const CLEAR: u32 = 7;
    pub const TRIGGER: u32 = 8;
    pub const REN_CONTROL: u32 = 9;
    pub const GO_TO_LOCAL: u32 = 10;
    pub const LOCAL_LOCKOUT: u32 = 11;
}

/// First and last of the custom errno values the driver reports
const DRIVER_ERRNO_BASE: i32 = 0x4000;
const DRIVER_ERRNO_LAST: i32 = 0x4015;

/// 16-byte control structure written to the control node
#[derive(Debug, Clone, Copy)]
struct ControlMessage {
    minor_number: u32,
    command: u32,
    argument: u32,
    value: u32,
}

impl ControlMessage {
    fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.minor_number.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.command.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.argument.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.value.to_le_bytes());
        bytes
    }
}

/// Fixed-length string fields of the instrument descriptor
const DESCRIPTOR_STRING_LEN: usize = 200;

/// Size of the descriptor struct returned by REPORT_INSTRUMENT
const DESCRIPTOR_SIZE: usize = 4 + 3 * DESCRIPTOR_STRING_LEN + 4;

/// Instrument identity reported by the driver during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
struct InstrumentDescriptor {
    minor_number: i32,
    manufacturer: String,
    product: String,
    serial_number: String,
    manufacturer_code: u16,
    product_code: u16,
}

impl InstrumentDescriptor {
    fn parse(bytes: &[u8; DESCRIPTOR_SIZE]) -> Self {
        let string_at = |offset: usize| {
            let field = &bytes[offset..offset + DESCRIPTOR_STRING_LEN];
            let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
            String::from_utf8_lossy(&field[..end]).into_owned()
        };
        Self {
            minor_number: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            manufacturer: string_at(4),
            product: string_at(4 + DESCRIPTOR_STRING_LEN),
            serial_number: string_at(4 + 2 * DESCRIPTOR_STRING_LEN),
            manufacturer_code: u16::from_le_bytes(bytes[604..606].try_into().unwrap()),
            product_code: u16::from_le_bytes(bytes[606..608].try_into().unwrap()),
        }
    }
}

/// Session to a USB instrument via the USBTMC kernel driver
pub struct UsbtmcSession {
    device: File,
    minor: u32,
    state: SessionState,
}

impl UsbtmcSession {
    /// Find the instrument matching `(vendor, product, serial)` and open
    /// its device node.
    ///
    /// Serial numbers compare case-sensitively up to the shorter of the
    /// two strings. USBTMC has no device locking; `lock` must be false.
    pub fn open(
        vendor: u16,
        product: u16,
        serial: &str,
        lock: bool,
        _lock_timeout: u32,
        monitor: Option<Arc<IoMonitor>>,
    ) -> Result<Self> {
        if lock {
            return Err(TmError::LockingNotSupported);
        }

        let control = open_control_node()?;
        for minor in 1..=USBTMC_MAX_DEVICES {
            let message = ControlMessage {
                minor_number: 0,
                command: command::REPORT_INSTRUMENT,
                argument: minor,
                value: 0,
            };
            match (&control).write(&message.to_bytes()) {
                Ok(count) if count == message.to_bytes().len() => {}
                Ok(_) => return Err(UsbtmcError::Write.into()),
                Err(e) => match driver_error(&e) {
                    TmError::Usbtmc(UsbtmcError::MinorNumberUnused) => continue,
                    other => return Err(other),
                },
            }

            let mut buf = [0u8; DESCRIPTOR_SIZE];
            let count = (&control).read(&mut buf).map_err(|e| driver_error(&e))?;
            if count != DESCRIPTOR_SIZE {
                return Err(UsbtmcError::ReadLessThanExpected.into());
            }

            let descriptor = InstrumentDescriptor::parse(&buf);
            if descriptor.manufacturer_code == vendor
                && descriptor.product_code == product
                && serial_matches(serial, &descriptor.serial_number)
            {
                tracing::debug!(
                    "matched {}/{} ({}), driver minor {}",
                    descriptor.manufacturer,
                    descriptor.product,
                    descriptor.serial_number,
                    descriptor.minor_number
                );
                return Self::open_minor(minor, false, 0, monitor);
            }
        }

        Err(UsbtmcError::DeviceNotFound.into())
    }

    /// Open an instrument by its minor number directly.
    pub fn open_minor(
        minor: u32,
        lock: bool,
        _lock_timeout: u32,
        monitor: Option<Arc<IoMonitor>>,
    ) -> Result<Self> {
        if lock {
            return Err(TmError::LockingNotSupported);
        }
        if minor == 0 || minor > USBTMC_MAX_DEVICES {
            return Err(UsbtmcError::MinorOutOfRange.into());
        }

        let path = format!("/dev/usbtmc{minor}");
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|_| TmError::Usbtmc(UsbtmcError::Open))?;

        Ok(Self {
            device,
            minor,
            state: SessionState::new(monitor),
        })
    }

    /// Send one control message; returns the control node handle so the
    /// caller can read a response from the same open.
    fn control_write(&self, cmd: u32, argument: u32, value: u32) -> Result<File> {
        let control = open_control_node()?;
        let message = ControlMessage {
            minor_number: self.minor,
            command: cmd,
            argument,
            value,
        };
        let count = (&control)
            .write(&message.to_bytes())
            .map_err(|e| driver_error(&e))?;
        if count != message.to_bytes().len() {
            return Err(UsbtmcError::WrongControlMessageSize.into());
        }
        Ok(control)
    }

    fn control_set(&self, attribute: u32, value: u32) -> Result<()> {
        self.control_write(command::SET_ATTRIBUTE, attribute, value)?;
        Ok(())
    }

    fn control_get(&self, attribute: u32) -> Result<u32> {
        let control = self.control_write(command::GET_ATTRIBUTE, attribute, 0)?;
        let mut buf = [0u8; 4];
        let count = (&control).read(&mut buf).map_err(|e| driver_error(&e))?;
        if count != buf.len() {
            return Err(UsbtmcError::ReadLessThanExpected.into());
        }
        Ok(u32::from_le_bytes(buf))
    }

    fn control_operation(&self, operation: u32, value: u32) -> Result<()> {
        self.control_write(command::IO_OPERATION, operation, value)?;
        Ok(())
    }
}

impl InstrumentSession for UsbtmcSession {
    fn write_buffer(&mut self, data: &[u8]) -> Result<usize> {
        if let Err(e) = (&self.device).write_all(data) {
            // Resynchronize the bulk-out endpoint, then surface the
            // original failure.
            let _ = self.control_operation(driver_operation::ABORT_WRITE, 0);
            return Err(driver_error(&e));
        }
        Ok(data.len())
    }

    fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        match (&self.device).read(buf) {
            Ok(count) => Ok(count),
            Err(e) => {
                let _ = self.control_operation(driver_operation::ABORT_READ, 0);
                Err(driver_error(&e))
            }
        }
    }

    fn set_attribute(&mut self, attribute: Attribute, value: u32) -> Result<()> {
        if self.state.set_base(attribute, value)? {
            // The driver does its own timing and framing, keep it in sync.
            match attribute {
                Attribute::Timeout => self.control_set(driver_attribute::TIMEOUT, value)?,
                Attribute::TermCharEnable => {
                    self.control_set(driver_attribute::TERMCHAR_ENABLE, value)?
                }
                Attribute::TermChar => self.control_set(driver_attribute::TERMCHAR, value)?,
                _ => {}
            }
            return Ok(());
        }
        Err(TmError::BadAttribute)
    }

    fn get_attribute(&mut self, attribute: Attribute) -> Result<u32> {
        if let Some(value) = self.state.get_base(attribute) {
            return Ok(value);
        }
        match attribute {
            Attribute::StatusByte => self.control_get(driver_attribute::STATUS_BYTE),
            Attribute::UsbtmcInterfaceCaps => {
                self.control_get(driver_attribute::INTERFACE_CAPABILITIES)
            }
            Attribute::UsbtmcDeviceCaps => self.control_get(driver_attribute::DEVICE_CAPABILITIES),
            Attribute::Usb488InterfaceCaps => {
                self.control_get(driver_attribute::USB488_INTERFACE_CAPABILITIES)
            }
            Attribute::Usb488DeviceCaps => {
                self.control_get(driver_attribute::USB488_DEVICE_CAPABILITIES)
            }
            _ => Err(TmError::BadAttribute),
        }
    }

    fn io_operation(&mut self, operation: Operation, value: u32) -> Result<()> {
        match operation {
            Operation::Trigger => self.control_operation(driver_operation::TRIGGER, 0),
            Operation::Clear => self.control_operation(driver_operation::CLEAR, 0),
            Operation::Remote => self.control_operation(driver_operation::REN_CONTROL, 1),
            Operation::Local => self.control_operation(driver_operation::GO_TO_LOCAL, 0),
            Operation::Lock | Operation::Unlock => Err(TmError::LockingNotSupported),
            Operation::IndicatorPulse => {
                self.control_operation(driver_operation::INDICATOR_PULSE, value)
            }
            Operation::UsbtmcAbortWrite => {
                self.control_operation(driver_operation::ABORT_WRITE, value)
            }
            Operation::UsbtmcAbortRead => {
                self.control_operation(driver_operation::ABORT_READ, value)
            }
            Operation::UsbtmcClearOutHalt => {
                self.control_operation(driver_operation::CLEAR_OUT_HALT, value)
            }
            Operation::UsbtmcClearInHalt => {
                self.control_operation(driver_operation::CLEAR_IN_HALT, value)
            }
            Operation::UsbtmcReset => self.control_operation(driver_operation::RESET, value),
            Operation::UsbtmcRenControl => {
                self.control_operation(driver_operation::REN_CONTROL, value)
            }
            Operation::UsbtmcGoToLocal => {
                self.control_operation(driver_operation::GO_TO_LOCAL, value)
            }
            Operation::UsbtmcLocalLockout => {
                self.control_operation(driver_operation::LOCAL_LOCKOUT, value)
            }
            Operation::Abort => Err(TmError::BadOperation),
        }
    }

    fn state(&self) -> &SessionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

fn open_control_node() -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(CONTROL_NODE)
        .map_err(|_| TmError::Usbtmc(UsbtmcError::Open))
}

/// Serial numbers match up to the shorter of the two strings.
fn serial_matches(wanted: &str, found: &str) -> bool {
    let len = wanted.len().min(found.len());
    wanted.as_bytes()[..len] == found.as_bytes()[..len]
}

/// Translate an I/O failure from the driver, decoding its custom errno
/// range into the matching error kind.
fn driver_error(e: &std::io::Error) -> TmError {
    match e.raw_os_error() {
        Some(code) if (DRIVER_ERRNO_BASE..=DRIVER_ERRNO_LAST).contains(&code) => {
            TmError::Usbtmc(match code - DRIVER_ERRNO_BASE {
                0 => UsbtmcError::MinorNumberUnused,
                1 => UsbtmcError::MinorOutOfRange,
                2 => UsbtmcError::MemoryAccess,
                3 => UsbtmcError::BulkOut,
                4 => UsbtmcError::WrongControlMessageSize,
                5 => UsbtmcError::WrongDriverState,
                6 => UsbtmcError::BulkIn,
                7 => UsbtmcError::InvalidRequest,
                8 => UsbtmcError::InvalidOpCode,
                9 => UsbtmcError::ControlOut,
                10 => UsbtmcError::ControlIn,
                11 => UsbtmcError::StatusUnsuccessful,
                12 => UsbtmcError::FeatureNotSupported,
                13 => UsbtmcError::NoTransfer,
                14 => UsbtmcError::NoTransferInProgress,
                15 => UsbtmcError::MaxPacketSize,
                16 => UsbtmcError::ClearBulkIn,
                17 => UsbtmcError::UnexpectedStatus,
                18 => UsbtmcError::InvalidAttributeCode,
                19 => UsbtmcError::InvalidAttributeValue,
                20 => UsbtmcError::InvalidParameter,
                _ => UsbtmcError::Reset,
            })
        }
        Some(code) => TmError::Os(nix::errno::Errno::from_raw(code)),
        None => TmError::IoIssue,
    }
}
