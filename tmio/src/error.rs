//! Error types shared across the library.
//!
//! Every operation fails with a single [`TmError`] kind. Transport-specific
//! failures live in per-backend sub-enums so callers can match on the family
//! first and the detail second. Each kind carries a stable numeric code
//! (see [`TmError::code`]); kinds wrapping a raw OS error render the usual
//! `strerror` text and report the errno as their code.

use std::io;

use thiserror::Error;

/// Errors raised by sessions, the factory and the configuration store
#[derive(Debug, Error)]
pub enum TmError {
    #[error("Bad attribute")]
    BadAttribute,

    #[error("Bad attribute value")]
    BadAttributeValue,

    #[error("Bad operation")]
    BadOperation,

    #[error("Bad operation value")]
    BadOperationValue,

    #[error("Timeout")]
    Timeout,

    #[error("Out of memory")]
    Memory,

    #[error("Buffer overflow")]
    BufferOverflow,

    #[error("Bad binblock header")]
    BinblockHeader,

    #[error("Binblock too big")]
    BinblockSize,

    #[error("Bad instrument resource (address) string")]
    BadResourceString,

    #[error("I/O issue")]
    IoIssue,

    #[error("Transaction aborted")]
    TransactionAborted,

    #[error("Device is locked")]
    DeviceLocked,

    #[error("Operation not supported")]
    OperationUnsupported,

    #[error("No lock held")]
    NoLockHeld,

    #[error("Locking not supported")]
    LockingNotSupported,

    #[error("Format error")]
    Format,

    /// Instrument reported SCPI errors and `throw_on_scpi_error` is set.
    #[error("Instrument reported SCPI error: {0}")]
    Scpi(String),

    #[error("Unable to clear SCPI error queue")]
    ScpiUnableToClear,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Usbtmc(#[from] UsbtmcError),

    #[error(transparent)]
    Vxi11(#[from] Vxi11Error),

    /// Raw OS error, rendered via strerror.
    #[error("{0}")]
    Os(#[from] nix::errno::Errno),

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Configuration store errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Unknown configuration store alias")]
    BadAlias,

    #[error("Bad configuration store value")]
    BadValue,

    #[error("Configuration store is too big")]
    FileSize,

    #[error("Unknown configuration store option")]
    BadOption,

    #[error("Unknown configuration store section")]
    BadSection,
}

/// Socket backend errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("Requesting too much data")]
    RequestTooMuch,

    #[error("Unable to create socket")]
    Create,

    #[error("Unable to establish connection")]
    Connect,

    #[error("Issue closing socket")]
    Close,
}

/// Serial backend errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SerialError {
    #[error("Issue opening device driver")]
    Open,

    #[error("Issue closing device driver")]
    Close,

    #[error("Bad serial port")]
    BadPort,

    #[error("Requesting too much data")]
    RequestTooMuch,
}

/// USBTMC backend errors. Most of these mirror the custom error values the
/// kernel driver reports through errno (see `driver_error` in the backend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsbtmcError {
    #[error("USBTMC: issue opening device driver")]
    Open,

    #[error("USBTMC: issue writing to device driver")]
    Write,

    #[error("USBTMC: issue reading from device driver")]
    Read,

    #[error("USBTMC: device not found")]
    DeviceNotFound,

    #[error("USBTMC: minor number out of range")]
    MinorOutOfRange,

    #[error("USBTMC: minor number unused")]
    MinorNumberUnused,

    #[error("USBTMC: memory addressing issue")]
    MemoryAccess,

    #[error("USBTMC: error during bulk out transfer")]
    BulkOut,

    #[error("USBTMC: wrong control message size")]
    WrongControlMessageSize,

    #[error("USBTMC: wrong driver state")]
    WrongDriverState,

    #[error("USBTMC: error during bulk in transfer")]
    BulkIn,

    #[error("USBTMC: invalid request")]
    InvalidRequest,

    #[error("USBTMC: invalid operation")]
    InvalidOpCode,

    #[error("USBTMC: error during control out request")]
    ControlOut,

    #[error("USBTMC: error during control in request")]
    ControlIn,

    #[error("USBTMC: unsuccessful status returned")]
    StatusUnsuccessful,

    #[error("USBTMC: feature not supported")]
    FeatureNotSupported,

    #[error("USBTMC: no transfer")]
    NoTransfer,

    #[error("USBTMC: no transfer in progress")]
    NoTransferInProgress,

    #[error("USBTMC: unable to get wMaxPacketSize")]
    MaxPacketSize,

    #[error("USBTMC: unable to clear bulk in endpoint")]
    ClearBulkIn,

    #[error("USBTMC: unexpected status returned")]
    UnexpectedStatus,

    #[error("USBTMC: invalid attribute")]
    InvalidAttributeCode,

    #[error("USBTMC: invalid attribute value")]
    InvalidAttributeValue,

    #[error("USBTMC: invalid parameter")]
    InvalidParameter,

    #[error("USBTMC: error during USB reset")]
    Reset,

    #[error("USBTMC: read less than expected number of bytes")]
    ReadLessThanExpected,
}

/// VXI-11 backend errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Vxi11Error {
    #[error("VXI11: RPC issue")]
    Rpc,

    #[error("VXI11: unable to establish connection (CORE channel)")]
    Connection,

    #[error("VXI11: unable to establish connection (ABORT channel)")]
    AbortConnection,

    #[error("VXI11: unknown error while trying to connect to logical device")]
    Link,

    #[error("VXI11: unknown error during read operation")]
    Read,

    #[error("VXI11: unknown error during write operation")]
    Write,

    #[error("VXI11: unknown error while reading status byte")]
    ReadStb,

    #[error("VXI11: invalid link ID")]
    InvalidLinkId,

    #[error("VXI11: unknown error during ABORT operation")]
    Abort,

    #[error("VXI11: unknown error during TRIGGER operation")]
    Trigger,

    #[error("VXI11: unknown error during CLEAR operation")]
    Clear,

    #[error("VXI11: unknown error during REMOTE operation")]
    Remote,

    #[error("VXI11: unknown error during LOCAL operation")]
    Local,

    #[error("VXI11: unknown error during LOCK operation")]
    Lock,

    #[error("VXI11: unknown error during UNLOCK operation")]
    Unlock,

    #[error("VXI11: syntax error")]
    Syntax,

    #[error("VXI11: device not accessible")]
    DeviceNotAccessible,

    #[error("VXI11: device out of resources")]
    OutOfResources,

    #[error("VXI11: invalid address")]
    InvalidAddress,

    #[error("VXI11: invalid parameter")]
    Parameter,

    #[error("VXI11: channel not established")]
    ChannelNotEstablished,

    #[error("VXI11: channel already established")]
    ChannelEstablished,
}

impl TmError {
    /// Stable numeric code for this error kind.
    ///
    /// Codes are grouped per family: base kinds 1.., SCPI 20.., store 30..,
    /// socket 100.., serial 120.., USBTMC 200.., VXI-11 300.. . OS errors
    /// report the underlying errno.
    pub fn code(&self) -> i32 {
        match self {
            TmError::BadAttribute => 1,
            TmError::BadAttributeValue => 2,
            TmError::BadOperation => 3,
            TmError::BadOperationValue => 4,
            TmError::Timeout => 5,
            TmError::Memory => 6,
            TmError::BufferOverflow => 7,
            TmError::BinblockHeader => 8,
            TmError::BinblockSize => 9,
            TmError::BadResourceString => 10,
            TmError::IoIssue => 11,
            TmError::TransactionAborted => 12,
            TmError::DeviceLocked => 13,
            TmError::OperationUnsupported => 14,
            TmError::NoLockHeld => 15,
            TmError::LockingNotSupported => 16,
            TmError::Format => 17,
            TmError::Scpi(_) => 20,
            TmError::ScpiUnableToClear => 21,
            TmError::Store(e) => 30 + *e as i32,
            TmError::Socket(e) => 100 + *e as i32,
            TmError::Serial(e) => 120 + *e as i32,
            TmError::Usbtmc(e) => 200 + *e as i32,
            TmError::Vxi11(e) => 300 + *e as i32,
            TmError::Os(errno) => *errno as i32,
            TmError::Io(e) => e.raw_os_error().unwrap_or(11),
        }
    }
}

/// Library-wide result alias
pub type Result<T> = std::result::Result<T, TmError>;
