//! End-to-end run against a scripted pool host speaking the serial wire
//! protocol.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use pagedmem::backend::serial::{SerialConfig, CMD_START};
use pagedmem::{AllocConfig, SerialBackend, VAlloc};

const CMD_INIT: u8 = 0;
const CMD_INITPOOL: u8 = 1;
const CMD_READ: u8 = 2;
const CMD_WRITE: u8 = 3;
const CMD_INPUT_AVAILABLE: u8 = 4;
const CMD_INPUT_REQUEST: u8 = 5;
const CMD_INPUT_PEEK: u8 = 6;
const CMD_PING: u8 = 7;

enum ParseState {
    Idle,
    WantCmd,
    Payload { cmd: u8, buf: Vec<u8>, need: usize },
    WriteData { offset: usize, remaining: usize },
}

/// In-process stand-in for the host-side bridge: owns the pool, parses
/// framed commands byte by byte and queues the replies.
struct HostSim {
    pool: Vec<u8>,
    input: VecDeque<u8>,
    replies: VecDeque<u8>,
    state: ParseState,
}

impl HostSim {
    fn new(input: &[u8]) -> Self {
        Self {
            pool: Vec::new(),
            input: input.iter().copied().collect(),
            replies: VecDeque::new(),
            state: ParseState::Idle,
        }
    }

    fn reply_u32(&mut self, v: u32) {
        self.replies.extend(v.to_le_bytes());
    }

    fn feed(&mut self, byte: u8) {
        match std::mem::replace(&mut self.state, ParseState::Idle) {
            ParseState::Idle => {
                if byte == CMD_START {
                    self.state = ParseState::WantCmd;
                }
            }
            ParseState::WantCmd => match byte {
                CMD_INIT => self.replies.extend([CMD_START, CMD_INIT]),
                CMD_INITPOOL => {
                    self.state = ParseState::Payload {
                        cmd: CMD_INITPOOL,
                        buf: Vec::new(),
                        need: 4,
                    }
                }
                CMD_READ | CMD_WRITE => {
                    self.state = ParseState::Payload {
                        cmd: byte,
                        buf: Vec::new(),
                        need: 8,
                    }
                }
                CMD_INPUT_AVAILABLE => {
                    let n = self.input.len() as u32;
                    self.reply_u32(n);
                }
                CMD_INPUT_REQUEST => {
                    self.state = ParseState::Payload {
                        cmd: CMD_INPUT_REQUEST,
                        buf: Vec::new(),
                        need: 4,
                    }
                }
                CMD_INPUT_PEEK => match self.input.front() {
                    Some(&b) => self.replies.extend([1, b]),
                    None => self.replies.push_back(0),
                },
                CMD_PING => self.replies.extend([CMD_START, CMD_PING]),
                _ => {}
            },
            ParseState::Payload { cmd, mut buf, need } => {
                buf.push(byte);
                if buf.len() < need {
                    self.state = ParseState::Payload { cmd, buf, need };
                    return;
                }
                let u32_at = |b: &[u8], i: usize| {
                    u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]])
                };
                match cmd {
                    CMD_INITPOOL => {
                        let size = u32_at(&buf, 0) as usize;
                        self.pool = vec![0; size];
                    }
                    CMD_READ => {
                        let offset = u32_at(&buf, 0) as usize;
                        let size = u32_at(&buf, 4) as usize;
                        let chunk: Vec<u8> = self.pool[offset..offset + size].to_vec();
                        self.replies.extend(chunk);
                    }
                    CMD_WRITE => {
                        let offset = u32_at(&buf, 0) as usize;
                        let size = u32_at(&buf, 4) as usize;
                        if size > 0 {
                            self.state = ParseState::WriteData {
                                offset,
                                remaining: size,
                            };
                        }
                    }
                    CMD_INPUT_REQUEST => {
                        let want = (u32_at(&buf, 0) as usize).min(self.input.len());
                        self.reply_u32(want as u32);
                        for _ in 0..want {
                            let b = self.input.pop_front().unwrap();
                            self.replies.push_back(b);
                        }
                    }
                    _ => {}
                }
            }
            ParseState::WriteData { offset, remaining } => {
                self.pool[offset] = byte;
                if remaining > 1 {
                    self.state = ParseState::WriteData {
                        offset: offset + 1,
                        remaining: remaining - 1,
                    };
                }
            }
        }
    }
}

impl Read for HostSim {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.replies.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        if n == 0 {
            return Err(std::io::Error::from(ErrorKind::TimedOut));
        }
        Ok(n)
    }
}

impl Write for HostSim {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for &b in buf {
            self.feed(b);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn serial_alloc(input: &[u8]) -> VAlloc<SerialBackend<HostSim>> {
    let cfg = SerialConfig {
        handshake_timeout: Duration::from_millis(200),
        init_retry: Duration::from_millis(5),
        ping_timeout: Duration::from_millis(20),
        response_timeout: Duration::from_millis(200),
    };
    let backend = SerialBackend::with_config(HostSim::new(input), cfg);
    let alloc_cfg = AllocConfig {
        pool_size: 8 * 1024,
        small_page_count: 2,
        small_page_size: 16,
        medium_page_count: 2,
        medium_page_size: 64,
        big_page_count: 4,
        big_page_size: 256,
    };
    let alloc = VAlloc::new(backend, alloc_cfg).unwrap();
    alloc.start().unwrap();
    alloc
}

#[test]
fn handshake_allocates_the_remote_pool() {
    let alloc = serial_alloc(b"");
    alloc.with_backend(|b| {
        assert_eq!(b.stream().pool.len(), 8 * 1024);
    });
}

#[test]
fn values_roundtrip_over_the_wire() {
    let alloc = serial_alloc(b"");
    let v = alloc.alloc_val(0x1234_5678u32).unwrap();
    let w = alloc.alloc_val(-99i64).unwrap();
    alloc.flush().unwrap();
    alloc.clear_pages().unwrap();
    assert_eq!(v.get(&alloc).unwrap(), 0x1234_5678);
    assert_eq!(w.get(&alloc).unwrap(), -99);

    // the flushed bytes really live on the peer
    let addr = v.addr() as usize;
    alloc.with_backend(|b| {
        let peer = &b.stream().pool;
        assert_eq!(
            u32::from_ne_bytes(peer[addr..addr + 4].try_into().unwrap()),
            0x1234_5678
        );
    });
}

#[test]
fn bulk_data_pages_in_and_out() {
    let alloc = serial_alloc(b"");
    let p = alloc.alloc_raw(2048).unwrap();
    let data: Vec<u8> = (0..2048u32).map(|i| (i * 13) as u8).collect();
    alloc.write(p, &data).unwrap();
    alloc.flush().unwrap();
    alloc.clear_pages().unwrap();
    let mut out = vec![0u8; 2048];
    alloc.read(p, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn ping_gets_an_answer() {
    let alloc = serial_alloc(b"");
    let rtt = alloc.with_backend(|b| b.ping()).unwrap();
    assert!(rtt < Duration::from_secs(1));
}

#[test]
fn console_input_passes_through() {
    let alloc = serial_alloc(b"hello");
    alloc.with_backend(|b| {
        assert_eq!(b.input_available().unwrap(), 5);
        assert_eq!(b.input_peek().unwrap(), Some(b'h'));

        let mut buf = [0u8; 2];
        assert_eq!(b.input_read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"he");

        let mut rest = [0u8; 8];
        assert_eq!(b.input_read(&mut rest).unwrap(), 3);
        assert_eq!(&rest[..3], b"llo");

        assert_eq!(b.input_available().unwrap(), 0);
        assert_eq!(b.input_peek().unwrap(), None);
    });
}
