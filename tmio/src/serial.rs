//! RS-232 session over `/dev/ttySn`.
//!
//! The port is switched to raw mode on open (no canonical input, echo or
//! signal handling, no input translations) and the previous termios
//! settings are restored when the session is dropped. Line parameters are
//! exposed as session attributes and applied straight to the hardware
//! through termios.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, Termios,
};

use crate::attr::{Attribute, Operation, parity};
use crate::error::{Result, SerialError, TmError};
use crate::framing::{TermBuffer, Wait, read_terminated, wait_ready};
use crate::monitor::IoMonitor;
use crate::session::{InstrumentSession, SessionState};

/// Size of the per-session accumulation buffer for terminated reads
pub const SERIAL_BUFFER_SIZE: usize = 1024;

/// Session to an instrument on a local serial port
pub struct SerialSession {
    file: File,
    saved_termios: Termios,
    state: SessionState,
    buffer: TermBuffer,
}

impl SerialSession {
    /// Open `/dev/ttyS<port>` in raw mode.
    ///
    /// Serial links have no device locking; `lock` must be false.
    pub fn open(
        port: u32,
        lock: bool,
        _lock_timeout: u32,
        monitor: Option<Arc<IoMonitor>>,
    ) -> Result<Self> {
        if lock {
            return Err(TmError::LockingNotSupported);
        }

        let path = format!("/dev/ttyS{port}");
        tracing::debug!("opening serial port {path}");

        // O_NONBLOCK keeps the open from hanging on modem control lines;
        // reads are paced by select afterwards.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(&path)
            .map_err(|_| TmError::Serial(SerialError::Open))?;

        let saved_termios = termios::tcgetattr(&file)?;
        let mut settings = saved_termios.clone();
        settings
            .local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ISIG);
        settings.output_flags.remove(OutputFlags::OPOST);
        settings
            .control_flags
            .insert(ControlFlags::CLOCAL | ControlFlags::CREAD);
        settings.input_flags.remove(
            InputFlags::IGNPAR
                | InputFlags::PARMRK
                | InputFlags::IGNBRK
                | InputFlags::BRKINT
                | InputFlags::INLCR
                | InputFlags::IGNCR
                | InputFlags::ICRNL
                | InputFlags::from_bits_truncate(libc::IUCLC)
                | InputFlags::IMAXBEL,
        );
        termios::tcsetattr(&file, SetArg::TCSANOW, &settings)?;

        Ok(Self {
            file,
            saved_termios,
            state: SessionState::new(monitor),
            buffer: TermBuffer::new(SERIAL_BUFFER_SIZE),
        })
    }

    fn set_baudrate(&mut self, value: u32) -> Result<()> {
        let rate = baud_rate(value)?;
        let mut settings = termios::tcgetattr(&self.file)?;
        termios::cfsetispeed(&mut settings, rate)?;
        termios::cfsetospeed(&mut settings, rate)?;
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &settings)?;
        Ok(())
    }

    fn get_baudrate(&self) -> Result<u32> {
        let settings = termios::tcgetattr(&self.file)?;
        baud_value(termios::cfgetospeed(&settings))
    }

    fn set_character_size(&mut self, value: u32) -> Result<()> {
        let size = match value {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            8 => ControlFlags::CS8,
            _ => return Err(TmError::BadAttributeValue),
        };
        let mut settings = termios::tcgetattr(&self.file)?;
        settings.control_flags.remove(ControlFlags::CSIZE);
        settings.control_flags.insert(size);
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &settings)?;
        Ok(())
    }

    fn get_character_size(&self) -> Result<u32> {
        let settings = termios::tcgetattr(&self.file)?;
        let size = settings.control_flags & ControlFlags::CSIZE;
        if size == ControlFlags::CS5 {
            Ok(5)
        } else if size == ControlFlags::CS6 {
            Ok(6)
        } else if size == ControlFlags::CS7 {
            Ok(7)
        } else if size == ControlFlags::CS8 {
            Ok(8)
        } else {
            Err(TmError::BadAttributeValue)
        }
    }

    fn set_parity(&mut self, value: u32) -> Result<()> {
        let mut settings = termios::tcgetattr(&self.file)?;
        match value {
            parity::NONE => {
                settings.control_flags.remove(ControlFlags::PARENB);
                settings
                    .input_flags
                    .remove(InputFlags::INPCK | InputFlags::ISTRIP);
            }
            parity::EVEN => {
                settings.control_flags.insert(ControlFlags::PARENB);
                settings.control_flags.remove(ControlFlags::PARODD);
                settings
                    .input_flags
                    .insert(InputFlags::INPCK | InputFlags::ISTRIP);
            }
            parity::ODD => {
                settings
                    .control_flags
                    .insert(ControlFlags::PARENB | ControlFlags::PARODD);
                settings
                    .input_flags
                    .insert(InputFlags::INPCK | InputFlags::ISTRIP);
            }
            _ => return Err(TmError::BadAttributeValue),
        }
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &settings)?;
        Ok(())
    }

    fn get_parity(&self) -> Result<u32> {
        let settings = termios::tcgetattr(&self.file)?;
        if !settings.control_flags.contains(ControlFlags::PARENB) {
            Ok(parity::NONE)
        } else if settings.control_flags.contains(ControlFlags::PARODD) {
            Ok(parity::ODD)
        } else {
            Ok(parity::EVEN)
        }
    }

    fn set_stop_bits(&mut self, value: u32) -> Result<()> {
        let mut settings = termios::tcgetattr(&self.file)?;
        match value {
            1 => settings.control_flags.remove(ControlFlags::CSTOPB),
            2 => settings.control_flags.insert(ControlFlags::CSTOPB),
            _ => return Err(TmError::BadAttributeValue),
        }
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &settings)?;
        Ok(())
    }

    fn get_stop_bits(&self) -> Result<u32> {
        let settings = termios::tcgetattr(&self.file)?;
        if settings.control_flags.contains(ControlFlags::CSTOPB) {
            Ok(2)
        } else {
            Ok(1)
        }
    }

    fn set_rtscts(&mut self, value: u32) -> Result<()> {
        let mut settings = termios::tcgetattr(&self.file)?;
        match value {
            0 => settings.control_flags.remove(ControlFlags::CRTSCTS),
            1 => settings.control_flags.insert(ControlFlags::CRTSCTS),
            _ => return Err(TmError::BadAttributeValue),
        }
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &settings)?;
        Ok(())
    }

    fn get_rtscts(&self) -> Result<u32> {
        let settings = termios::tcgetattr(&self.file)?;
        Ok(settings.control_flags.contains(ControlFlags::CRTSCTS) as u32)
    }

    fn set_xonxoff(&mut self, value: u32) -> Result<()> {
        let mut settings = termios::tcgetattr(&self.file)?;
        let flags = InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY;
        match value {
            0 => settings.input_flags.remove(flags),
            1 => settings.input_flags.insert(flags),
            _ => return Err(TmError::BadAttributeValue),
        }
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &settings)?;
        Ok(())
    }

    fn get_xonxoff(&self) -> Result<u32> {
        let settings = termios::tcgetattr(&self.file)?;
        let flags = InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY;
        Ok(settings.input_flags.contains(flags) as u32)
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        // Hand the port back the way we found it.
        let _ = termios::tcsetattr(&self.file, SetArg::TCSANOW, &self.saved_termios);
    }
}

impl InstrumentSession for SerialSession {
    fn write_buffer(&mut self, data: &[u8]) -> Result<usize> {
        let mut done = 0;
        while done < data.len() {
            wait_ready(self.file.as_fd(), Wait::Write, self.state.timeout)?;
            match (&self.file).write(&data[done..]) {
                Ok(count) => done += count,
                Err(e) if retriable(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Self {
            file,
            state,
            buffer,
            ..
        } = self;
        let file: &File = file;
        let state: &SessionState = state;

        if !state.term_char_enable {
            wait_ready(file.as_fd(), Wait::Read, state.timeout)?;
            return read_some(file, buf, state.timeout);
        }

        read_terminated(
            buffer,
            state.term_char,
            buf,
            TmError::Serial(SerialError::RequestTooMuch),
            || wait_ready(file.as_fd(), Wait::Read, state.timeout),
            |slice| read_some(file, slice, state.timeout),
        )
    }

    fn set_attribute(&mut self, attribute: Attribute, value: u32) -> Result<()> {
        if self.state.set_base(attribute, value)? {
            return Ok(());
        }
        match attribute {
            Attribute::SerialBaudrate => self.set_baudrate(value),
            Attribute::SerialSize => self.set_character_size(value),
            Attribute::SerialParity => self.set_parity(value),
            Attribute::SerialStopbits => self.set_stop_bits(value),
            Attribute::SerialRtscts => self.set_rtscts(value),
            Attribute::SerialXonxoff => self.set_xonxoff(value),
            _ => Err(TmError::BadAttribute),
        }
    }

    fn get_attribute(&mut self, attribute: Attribute) -> Result<u32> {
        if let Some(value) = self.state.get_base(attribute) {
            return Ok(value);
        }
        match attribute {
            Attribute::SerialBaudrate => self.get_baudrate(),
            Attribute::SerialSize => self.get_character_size(),
            Attribute::SerialParity => self.get_parity(),
            Attribute::SerialStopbits => self.get_stop_bits(),
            Attribute::SerialRtscts => self.get_rtscts(),
            Attribute::SerialXonxoff => self.get_xonxoff(),
            _ => Err(TmError::BadAttribute),
        }
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

/// One read against the (non-blocking) port, retrying through spurious
/// wakeups.
fn read_some(file: &File, buf: &mut [u8], timeout: u32) -> Result<usize> {
    loop {
        match (&*file).read(buf) {
            Ok(count) => return Ok(count),
            Err(e) if retriable(&e) => wait_ready(file.as_fd(), Wait::Read, timeout)?,
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

fn baud_rate(value: u32) -> Result<BaudRate> {
    Ok(match value {
        50 => BaudRate::B50,
        75 => BaudRate::B75,
        110 => BaudRate::B110,
        134 => BaudRate::B134,
        150 => BaudRate::B150,
        200 => BaudRate::B200,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        1800 => BaudRate::B1800,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        _ => return Err(TmError::BadAttributeValue),
    })
}

fn baud_value(rate: BaudRate) -> Result<u32> {
    Ok(match rate {
        BaudRate::B50 => 50,
        BaudRate::B75 => 75,
        BaudRate::B110 => 110,
        BaudRate::B134 => 134,
        BaudRate::B150 => 150,
        BaudRate::B200 => 200,
        BaudRate::B300 => 300,
        BaudRate::B600 => 600,
        BaudRate::B1200 => 1200,
        BaudRate::B1800 => 1800,
        BaudRate::B2400 => 2400,
        BaudRate::B4800 => 4800,
        BaudRate::B9600 => 9600,
        BaudRate::B19200 => 19200,
        BaudRate::B38400 => 38400,
        BaudRate::B57600 => 57600,
        BaudRate::B115200 => 115200,
        _ => return Err(TmError::BadAttributeValue),
    })
}
