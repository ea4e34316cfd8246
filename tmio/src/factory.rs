//! Resource string resolution and session construction.
//!
//! Resource strings follow the VISA convention:
//!
//! ```text
//! ASRL1::INSTR                            serial port 1
//! TCPIP0::192.168.0.10::inst0::INSTR      VXI-11 logical device
//! TCPIP0::192.168.0.10::5025::SOCKET      raw TCP
//! USB0::0x0699::0x0401::C012345::INSTR    USBTMC by vendor/product/serial
//! scope                                   alias from the configuration store
//! ```
//!
//! An alias is any resource without `::`; its section in the store names
//! the real resource in the `address` option and may carry initial
//! attribute values applied after construction.

use std::path::Path;
use std::sync::Arc;

use crate::attr::Attribute;
use crate::error::{Result, StoreError, TmError};
use crate::monitor::IoMonitor;
use crate::serial::SerialSession;
use crate::session::{DEFAULT_TIMEOUT, InstrumentSession};
use crate::socket::SocketSession;
use crate::store::ConfigStore;
use crate::usbtmc::UsbtmcSession;
use crate::vxi11::Vxi11Session;

/// Parsed form of a resource string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceTarget {
    /// `ASRL<n>[::INSTR]`
    Serial { port: u32 },
    /// `TCPIP<n>::<host>[::<device>][::INSTR]`
    Vxi11 { host: String, device: String },
    /// `TCPIP<n>::<host>::<port>::SOCKET`
    Socket { host: String, port: u16 },
    /// `USB<n>::<vendor>::<product>::<serial>[::<interface>][::INSTR]`
    Usbtmc {
        vendor: u16,
        product: u16,
        serial: String,
        interface: Option<u32>,
    },
}

/// Parse a resource string into its transport target.
///
/// The transport family and the `INSTR`/`SOCKET` keywords are
/// case-insensitive; the VXI-11 logical device name is not.
pub fn parse_resource(resource: &str) -> Result<ResourceTarget> {
    let pieces: Vec<&str> = resource.split("::").collect();
    let family = pieces[0].to_ascii_uppercase();

    if let Some(digits) = family.strip_prefix("ASRL") {
        let port = parse_board(digits)?;
        return match pieces.as_slice() {
            [_] => Ok(ResourceTarget::Serial { port }),
            [_, tail] if tail.eq_ignore_ascii_case("INSTR") => {
                Ok(ResourceTarget::Serial { port })
            }
            _ => Err(TmError::BadResourceString),
        };
    }

    if let Some(digits) = family.strip_prefix("TCPIP") {
        parse_board(digits)?;
        let host = *pieces.get(1).ok_or(TmError::BadResourceString)?;
        if host.is_empty() {
            return Err(TmError::BadResourceString);
        }
        return match pieces.as_slice() {
            [_, _] => Ok(ResourceTarget::Vxi11 {
                host: host.to_string(),
                device: "inst0".to_string(),
            }),
            [_, _, third] => {
                // The logical device name is case-sensitive, only the
                // INSTR keyword is not.
                let device = if third.eq_ignore_ascii_case("INSTR") {
                    "inst0"
                } else {
                    third
                };
                Ok(ResourceTarget::Vxi11 {
                    host: host.to_string(),
                    device: device.to_string(),
                })
            }
            [_, _, third, tail] if tail.eq_ignore_ascii_case("INSTR") => {
                Ok(ResourceTarget::Vxi11 {
                    host: host.to_string(),
                    device: third.to_string(),
                })
            }
            [_, _, third, tail] if tail.eq_ignore_ascii_case("SOCKET") => {
                let port: u32 = third.parse().map_err(|_| TmError::BadResourceString)?;
                let port = u16::try_from(port).map_err(|_| TmError::BadResourceString)?;
                Ok(ResourceTarget::Socket {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(TmError::BadResourceString),
        };
    }

    if let Some(digits) = family.strip_prefix("USB") {
        parse_board(digits)?;
        if !(4..=6).contains(&pieces.len()) {
            return Err(TmError::BadResourceString);
        }
        let vendor = parse_hex16(pieces[1])?;
        let product = parse_hex16(pieces[2])?;
        let serial = pieces[3].to_string();

        let interface = match pieces.as_slice() {
            [_, _, _, _] => None,
            [_, _, _, _, fifth] => {
                if fifth.eq_ignore_ascii_case("INSTR") {
                    None
                } else {
                    Some(parse_interface(fifth)?)
                }
            }
            [_, _, _, _, fifth, tail] => {
                if !tail.eq_ignore_ascii_case("INSTR") {
                    return Err(TmError::BadResourceString);
                }
                Some(parse_interface(fifth)?)
            }
            _ => unreachable!(),
        };

        return Ok(ResourceTarget::Usbtmc {
            vendor,
            product,
            serial,
            interface,
        });
    }

    Err(TmError::BadResourceString)
}

/// Board index digits after the family keyword; absent means board 0.
fn parse_board(digits: &str) -> Result<u32> {
    if digits.is_empty() {
        return Ok(0);
    }
    digits.parse().map_err(|_| TmError::BadResourceString)
}

fn parse_interface(field: &str) -> Result<u32> {
    field.parse().map_err(|_| TmError::BadResourceString)
}

/// Hex vendor/product field, with or without a `0x` prefix.
fn parse_hex16(field: &str) -> Result<u16> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u16::from_str_radix(digits, 16).map_err(|_| TmError::BadResourceString)
}

/// Opens sessions from resource strings, resolving aliases and applying
/// per-instrument defaults from the configuration store.
#[derive(Default)]
pub struct SessionFactory {
    store: Option<ConfigStore>,
    monitor: Option<Arc<IoMonitor>>,
}

impl SessionFactory {
    /// Factory without a configuration store; aliases will not resolve.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory backed by the store at `path`.
    pub fn with_store<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            store: Some(ConfigStore::load(path)?),
            monitor: None,
        })
    }

    /// Attach a traffic monitor handed to every session opened from here.
    pub fn set_monitor(&mut self, monitor: Arc<IoMonitor>) {
        self.monitor = Some(monitor);
    }

    /// Open a session for `resource`.
    ///
    /// `lock` requests a device lock at open; only VXI-11 supports it.
    /// The new session starts from the hard defaults (termination
    /// character `\n` enabled, end-of-line `\n`, 5 s timeout, tracing
    /// off), overridden by the options of the alias section when
    /// `resource` named one.
    pub fn open_session(
        &self,
        resource: &str,
        lock: bool,
        lock_timeout: u32,
    ) -> Result<Box<dyn InstrumentSession>> {
        let alias = if !resource.contains("::") {
            match &self.store {
                Some(store) => store.resolve_alias(resource)?,
                None => None,
            }
        } else {
            None
        };
        let target_resource = alias.as_ref().map(|entry| entry.address).unwrap_or(resource);

        let target = parse_resource(target_resource)?;
        tracing::debug!("opening {resource} as {target:?}");
        let mut session: Box<dyn InstrumentSession> = match target {
            ResourceTarget::Serial { port } => Box::new(SerialSession::open(
                port,
                lock,
                lock_timeout,
                self.monitor.clone(),
            )?),
            ResourceTarget::Vxi11 { host, device } => Box::new(Vxi11Session::open(
                &host,
                &device,
                lock,
                lock_timeout,
                self.monitor.clone(),
            )?),
            ResourceTarget::Socket { host, port } => Box::new(SocketSession::open(
                &host,
                port,
                lock,
                lock_timeout,
                self.monitor.clone(),
            )?),
            ResourceTarget::Usbtmc {
                vendor,
                product,
                serial,
                ..
            } => Box::new(UsbtmcSession::open(
                vendor,
                product,
                &serial,
                lock,
                lock_timeout,
                self.monitor.clone(),
            )?),
        };

        session.state_mut().name = resource.to_string();

        session.set_attribute(Attribute::TermCharEnable, 1)?;
        session.set_attribute(Attribute::TermChar, u32::from(b'\n'))?;
        session.set_attribute(Attribute::EolChar, u32::from(b'\n'))?;
        session.set_attribute(Attribute::Timeout, DEFAULT_TIMEOUT)?;
        session.set_attribute(Attribute::Tracing, 0)?;

        if let Some(entry) = alias {
            for (key, value) in entry.options {
                apply_store_option(session.as_mut(), key, value)?;
            }
        }

        Ok(session)
    }
}

/// Apply one alias option to a fresh session. Option names are matched
/// case-insensitively; unrecognized options are ignored.
fn apply_store_option(
    session: &mut dyn InstrumentSession,
    key: &str,
    value: &str,
) -> Result<()> {
    match key.to_ascii_uppercase().as_str() {
        // Consumed during alias resolution.
        "ADDRESS" => Ok(()),
        "TERM_CHAR" => session.set_attribute(Attribute::TermChar, parse_store_number(value)?),
        "TERM_CHAR_ENABLE" => {
            session.set_attribute(Attribute::TermCharEnable, parse_store_switch(value)?)
        }
        "EOL_CHAR" => session.set_attribute(Attribute::EolChar, parse_store_number(value)?),
        "TIMEOUT" => session.set_attribute(Attribute::Timeout, parse_store_number(value)?),
        "TRACING" => session.set_attribute(Attribute::Tracing, parse_store_switch(value)?),
        "SET_END_INDICATOR" => {
            session.set_attribute(Attribute::SetEndIndicator, parse_store_switch(value)?)
        }
        _ => Ok(()),
    }
}

fn parse_store_number(value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| TmError::Store(StoreError::BadValue))
}

fn parse_store_switch(value: &str) -> Result<u32> {
    match value.to_ascii_uppercase().as_str() {
        "ON" => Ok(1),
        "OFF" => Ok(0),
        _ => Err(TmError::Store(StoreError::BadValue)),
    }
}
