//! Session-based I/O to test and measurement instruments.
//!
//! One [`InstrumentSession`] contract covers four physical transports:
//! USBTMC character devices, VXI-11 over ONC-RPC, raw TCP sockets and
//! RS-232 serial ports. Sessions are opened through the
//! [`SessionFactory`] from VISA-style resource strings or aliases kept in
//! a plain-text [`ConfigStore`].
//!
//! ```no_run
//! use tmio::{InstrumentSession, SessionFactory};
//!
//! # fn main() -> tmio::Result<()> {
//! let factory = SessionFactory::with_store("/usr/local/etc/opentmlib.store")?;
//! let mut scope = factory.open_session("TCPIP0::192.168.0.10::inst0::INSTR", false, 5)?;
//! let identity = scope.query_string("*IDN?")?;
//! println!("connected to {identity}");
//! # Ok(())
//! # }
//! ```

pub mod attr;
pub mod error;
pub mod factory;
pub mod monitor;
pub mod serial;
pub mod session;
pub mod socket;
pub mod store;
pub mod usbtmc;
pub mod vxi11;

mod framing;
// The ONC-RPC plumbing is an implementation detail of the VXI-11 backend.
mod rpc;

pub use attr::{Attribute, Operation};
pub use error::{Result, SerialError, SocketError, StoreError, TmError, UsbtmcError, Vxi11Error};
pub use factory::{ResourceTarget, SessionFactory, parse_resource};
pub use monitor::{Direction, IoMonitor};
pub use session::{InstrumentSession, SessionState};
pub use store::ConfigStore;
