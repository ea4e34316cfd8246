//! Session attribute and operation identifiers.
//!
//! The numeric values are part of the library's public contract and stay
//! stable across releases.

/// Session attributes.
///
/// Base attributes are recognized by every transport; the remaining groups
/// are transport-specific and fail with `BadAttribute` elsewhere.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    // Base attributes
    StringSize = 1,
    ThrowOnScpiError = 2,
    Tracing = 3,
    EolChar = 4,
    Timeout = 5,
    TermCharEnable = 6,
    TermChar = 7,
    WaitLock = 8,
    SetEndIndicator = 9,
    /// Instrument status byte (read-only; VXI-11 and USBTMC only)
    StatusByte = 10,

    // Serial attributes
    SerialBaudrate = 20,
    SerialSize = 21,
    SerialParity = 22,
    SerialStopbits = 23,
    SerialRtscts = 24,
    SerialXonxoff = 25,

    // USBTMC capability attributes (read-only)
    UsbtmcInterfaceCaps = 30,
    UsbtmcDeviceCaps = 31,
    Usb488InterfaceCaps = 32,
    Usb488DeviceCaps = 33,

    // VXI-11 attributes (read-only)
    Vxi11MaxRecvSize = 40,
    Vxi11LastError = 41,
}

/// Control operations dispatched through `io_operation`
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Trigger = 1,
    Clear = 2,
    Remote = 3,
    Local = 4,
    Lock = 5,
    Unlock = 6,
    Abort = 7,
    IndicatorPulse = 8,

    // USBTMC-specific operations
    UsbtmcAbortWrite = 20,
    UsbtmcAbortRead = 21,
    UsbtmcClearOutHalt = 22,
    UsbtmcClearInHalt = 23,
    UsbtmcReset = 24,
    UsbtmcRenControl = 25,
    UsbtmcGoToLocal = 26,
    UsbtmcLocalLockout = 27,
}

/// Serial parity values for [`Attribute::SerialParity`]
pub mod parity {
    pub const NONE: u32 = 0;
    pub const EVEN: u32 = 1;
    pub const ODD: u32 = 2;
}
