//! Protocol output channel.
//!
//! Stdout carries nothing but response lines. At startup the worker takes a
//! private handle to the original stdout for the protocol and points fd 1 at
//! stderr, so anything else in the process that prints (libraries, native
//! code, `println!`) ends up in the diagnostic stream instead.

use std::fs::File;
use std::io::{self, Write};

use audiosr_types::Response;
use log::{debug, warn};

/// Writes one JSON response per line and flushes after each.
pub struct ProtocolChannel<W: Write> {
    sink: W,
}

impl<W: Write> ProtocolChannel<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn emit(&mut self, response: &Response) -> io::Result<()> {
        let mut line = serde_json::to_string(response)?;
        line.push('\n');
        self.sink.write_all(line.as_bytes())?;
        self.sink.flush()
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// Where protocol lines go.
#[derive(Debug)]
pub enum ProtocolSink {
    /// Duplicate of the original stdout; fd 1 now points at stderr.
    Isolated(File),
    /// Plain stdout, used when isolation is disabled or unavailable.
    Stdout(io::Stdout),
}

impl Write for ProtocolSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Isolated(file) => file.write(buf),
            Self::Stdout(stdout) => stdout.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Isolated(file) => file.flush(),
            Self::Stdout(stdout) => stdout.flush(),
        }
    }
}

/// Open the protocol sink, isolating stdout when asked and supported.
///
/// Failure to isolate is not fatal: the worker logs it and keeps using
/// plain stdout.
pub fn open_protocol_sink(isolate: bool) -> ProtocolSink {
    if !isolate {
        debug!("Stdout isolation disabled");
        return ProtocolSink::Stdout(io::stdout());
    }
    match redirect_stdout_to_stderr() {
        Ok(file) => {
            debug!("Stdout (fd 1) redirected to stderr, protocol uses a private handle");
            ProtocolSink::Isolated(file)
        }
        Err(e) => {
            warn!("Could not isolate stdout ({e}), protocol shares stdout with other output");
            ProtocolSink::Stdout(io::stdout())
        }
    }
}

#[cfg(unix)]
fn redirect_stdout_to_stderr() -> io::Result<File> {
    use std::os::unix::io::FromRawFd;

    io::stdout().flush()?;

    // SAFETY: plain fd syscalls on the process's standard descriptors. The
    // duplicate is owned by the returned File and nothing else.
    unsafe {
        let protocol_fd = libc::fcntl(libc::STDOUT_FILENO, libc::F_DUPFD_CLOEXEC, 0);
        if protocol_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) < 0 {
            let err = io::Error::last_os_error();
            libc::close(protocol_fd);
            return Err(err);
        }
        Ok(File::from_raw_fd(protocol_fd))
    }
}

#[cfg(not(unix))]
fn redirect_stdout_to_stderr() -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "fd redirection is only implemented on unix",
    ))
}
