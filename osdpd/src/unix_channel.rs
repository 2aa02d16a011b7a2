//! UNIX-socket stand-in for the serial line. The protocol core only sees
//! the non-blocking `Channel` trait; everything socket-specific lives here.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use osdp_lib::Channel;

pub struct UnixChannel {
    stream: Mutex<UnixStream>,
}

impl UnixChannel {
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }
}

impl Channel for UnixChannel {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        match stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        match stream.read(buf) {
            // A zero-length read on a socket is EOF, not "no data": report
            // it as an error so the state machines notice the peer is gone.
            Ok(0) if !buf.is_empty() => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}
