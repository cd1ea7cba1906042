use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace};

use super::Backend;
use crate::error::{Result, VmError};
use crate::{VirtAddr, VirtSize};

/// Every command starts with this sentinel byte.
pub const CMD_START: u8 = 0xFF;

/// Wire opcodes. 32-bit integers on the wire are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Init = 0,
    InitPool = 1,
    Read = 2,
    Write = 3,
    InputAvailable = 4,
    InputRequest = 5,
    InputPeek = 6,
    Ping = 7,
}

/// Timing knobs for the serial link.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Total time to wait for the peer during the initial handshake.
    pub handshake_timeout: Duration,
    /// Interval at which the handshake `INIT` probe is re-sent.
    pub init_retry: Duration,
    /// Per-attempt wait for a `PING` reply.
    pub ping_timeout: Duration,
    /// How long to wait for the data phase of a command before giving up.
    pub response_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            init_retry: Duration::from_millis(50),
            ping_timeout: Duration::from_millis(1000),
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// Pool provided by a peer on the other end of a serial link.
///
/// The peer (typically a host PC running a bridge script) owns the actual
/// pool memory and answers the framed commands defined by [`Command`].
/// Besides the pool itself, the link forwards host-side console input
/// through the `input_*` calls, so a port shared with a terminal keeps
/// working.
///
/// The stream should be configured with a short read timeout; timeouts pace
/// the handshake and ping retry loops and are never fatal by themselves.
pub struct SerialBackend<S> {
    stream: S,
    cfg: SerialConfig,
}

impl<S: Read + Write> SerialBackend<S> {
    pub fn new(stream: S) -> Self {
        Self::with_config(stream, SerialConfig::default())
    }

    pub fn with_config(stream: S, cfg: SerialConfig) -> Self {
        Self { stream, cfg }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Measures the link round-trip time.
    pub fn ping(&mut self) -> Result<Duration> {
        self.send_read_command(Command::Ping)?;
        let begin = Instant::now();
        let deadline = begin + self.cfg.handshake_timeout;
        while !self.wait_for_command(Command::Ping, self.cfg.ping_timeout)? {
            if Instant::now() >= deadline {
                return Err(VmError::HandshakeTimeout);
            }
            self.send_read_command(Command::Ping)?;
        }
        Ok(begin.elapsed())
    }

    /// Number of input bytes buffered on the peer.
    pub fn input_available(&mut self) -> Result<u32> {
        self.send_read_command(Command::InputAvailable)?;
        self.read_u32()
    }

    /// Fetches up to `buf.len()` input bytes from the peer; returns how many
    /// actually arrived.
    pub fn input_read(&mut self, buf: &mut [u8]) -> Result<u32> {
        self.send_read_command(Command::InputRequest)?;
        self.write_u32(buf.len() as u32)?;
        self.stream.flush().map_err(VmError::Io)?;
        let actual = self.read_u32()?.min(buf.len() as u32);
        self.read_full(&mut buf[..actual as usize])?;
        Ok(actual)
    }

    /// Looks at the next input byte without consuming it.
    pub fn input_peek(&mut self) -> Result<Option<u8>> {
        self.send_read_command(Command::InputPeek)?;
        let mut flag = [0u8; 1];
        self.read_full(&mut flag)?;
        if flag[0] == 0 {
            return Ok(None);
        }
        let mut b = [0u8; 1];
        self.read_full(&mut b)?;
        Ok(Some(b[0]))
    }

    fn poll_byte(&mut self) -> Result<Option<u8>> {
        let mut b = [0u8; 1];
        loop {
            match self.stream.read(&mut b) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(b[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(VmError::Io(e)),
            }
        }
    }

    /// Drops stray bytes (e.g. console noise on a shared port) before a
    /// command that expects a reply.
    fn purge(&mut self) -> Result<()> {
        while self.poll_byte()?.is_some() {}
        Ok(())
    }

    fn send_command(&mut self, cmd: Command) -> Result<()> {
        trace!("serial: > {:?}", cmd);
        self.stream
            .write_all(&[CMD_START, cmd as u8])
            .map_err(VmError::Io)
    }

    fn send_read_command(&mut self, cmd: Command) -> Result<()> {
        self.purge()?;
        self.send_command(cmd)?;
        self.stream.flush().map_err(VmError::Io)
    }

    fn write_u32(&mut self, v: u32) -> Result<()> {
        self.stream.write_all(&v.to_le_bytes()).map_err(VmError::Io)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_full(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<()> {
        let deadline = Instant::now() + self.cfg.response_timeout;
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {}
                Ok(n) => {
                    filled += n;
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(VmError::Io(e)),
            }
            if Instant::now() >= deadline {
                return Err(VmError::Backend(format!(
                    "serial peer sent {} of {} expected bytes",
                    filled,
                    buf.len()
                )));
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Waits up to `timeout` for a framed `cmd` from the peer.
    fn wait_for_command(&mut self, cmd: Command, timeout: Duration) -> Result<bool> {
        self.stream.flush().map_err(VmError::Io)?;
        let deadline = Instant::now() + timeout;
        let mut got_start = false;
        loop {
            match self.poll_byte()? {
                Some(b) if !got_start && b == CMD_START => got_start = true,
                Some(b) if got_start && b == cmd as u8 => return Ok(true),
                Some(_) => got_start = false,
                None => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

impl<S: Read + Write> Backend for SerialBackend<S> {
    fn start(&mut self, pool_size: VirtSize) -> Result<VirtSize> {
        let deadline = Instant::now() + self.cfg.handshake_timeout;
        loop {
            self.send_command(Command::Init)?;
            if self.wait_for_command(Command::Init, self.cfg.init_retry)? {
                break;
            }
            if Instant::now() >= deadline {
                return Err(VmError::HandshakeTimeout);
            }
        }
        debug!("serial: handshake complete, pool {} bytes", pool_size);
        self.send_command(Command::InitPool)?;
        self.write_u32(pool_size)?;
        self.stream.flush().map_err(VmError::Io)?;
        info!("serial backend: remote pool of {} bytes ready", pool_size);
        Ok(pool_size)
    }

    fn stop(&mut self) -> Result<()> {
        self.stream.flush().map_err(VmError::Io)
    }

    fn read(&mut self, offset: VirtAddr, dst: &mut [u8]) -> Result<()> {
        self.send_read_command(Command::Read)?;
        self.write_u32(offset)?;
        self.write_u32(dst.len() as u32)?;
        self.stream.flush().map_err(VmError::Io)?;
        self.read_full(dst)
    }

    fn write(&mut self, offset: VirtAddr, src: &[u8]) -> Result<()> {
        self.send_command(Command::Write)?;
        self.write_u32(offset)?;
        self.write_u32(src.len() as u32)?;
        self.stream.write_all(src).map_err(VmError::Io)?;
        self.stream.flush().map_err(VmError::Io)
    }
}
