use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::io::{ErrorKind, Read, Result};
use std::os::fd::{AsFd, BorrowedFd};

/// Non-blocking line splitter over a readable fd, such as standard input.
///
/// Only complete lines are handed out, a partial line stays buffered until
/// its newline (or end of input) shows up. Reading never waits for data.
pub struct LineReader<R: Read + AsFd> {
    inner: R,
    buf: Vec<u8>,
    open: bool,
    restore: Option<OFlag>,
}

impl<R: Read + AsFd> LineReader<R> {
    /// Switch `inner` to non-blocking mode, the previous mode is restored on drop.
    pub fn new(inner: R) -> Result<Self> {
        let flags = OFlag::from_bits_truncate(fcntl(inner.as_fd(), FcntlArg::F_GETFL)?);
        if !flags.contains(OFlag::O_NONBLOCK) {
            fcntl(inner.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        }

        Ok(Self {
            inner,
            buf: vec![],
            open: true,
            restore: (!flags.contains(OFlag::O_NONBLOCK)).then_some(flags),
        })
    }

    /// False once the writer side is gone.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Read everything available right now and return the complete lines.
    pub fn read_lines(&mut self) -> Vec<String> {
        let mut chunk = [0; 1024];

        while self.open {
            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    log::debug!("input closed");
                    self.open = false;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("read input error {}", e);
                    self.open = false;
                }
            }
        }

        let mut lines = vec![];
        while let Some(i) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=i).collect();
            lines.push(Self::decode(&line));
        }

        // last line without newline at end of input
        if !self.open && !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            lines.push(Self::decode(&line));
        }

        lines
    }

    fn decode(line: &[u8]) -> String {
        String::from_utf8_lossy(line)
            .trim_end_matches(['\r', '\n'])
            .to_string()
    }
}

impl<R: Read + AsFd> AsFd for LineReader<R> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl<R: Read + AsFd> Drop for LineReader<R> {
    fn drop(&mut self) {
        if let Some(flags) = self.restore {
            let _ = fcntl(self.inner.as_fd(), FcntlArg::F_SETFL(flags));
        }
    }
}
