//! Capture endpoints: where record bytes go.
//!
//! A sink is write-only and sequential; only file sinks can seek, which the
//! writer needs once, to rewrite the header stats at stop.

use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};

/// Destination for capture bytes.
pub trait Sink: Send {
    /// Write the whole buffer or fail.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Reposition to an absolute offset. Returns `false` when the sink
    /// cannot seek (sockets), in which case the caller skips the rewrite.
    fn seek_to(&mut self, offset: u64) -> io::Result<bool>;

    /// Push buffered bytes to the OS.
    fn flush(&mut self) -> io::Result<()>;
}

/// A freshly created capture file.
pub struct FileSink {
    file: std::fs::File,
}

impl FileSink {
    /// Create the output file. Refuses to overwrite an existing path, so a
    /// stale capture is never clobbered by a typo.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => Error::OutputExists(path.to_path_buf()),
                _ => Error::Io(err),
            })?;
        Ok(Self { file })
    }
}

impl Sink for FileSink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<bool> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(true)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A single accepted reader connection.
///
/// The sink listens on `port`, serves exactly one reader, and streams
/// records to it. No seek: the trailing header rewrite is skipped and the
/// reader recovers aggregate stats with a full scan.
pub struct SocketSink {
    stream: TcpStream,
}

impl SocketSink {
    /// Bind the port and wait for one reader to connect.
    ///
    /// The wait polls so it stays interruptible: flip `cancel` from a signal
    /// handler or another thread and the pending accept returns
    /// [`Error::AcceptCancelled`] instead of blocking forever.
    pub fn accept(port: u16, cancel: &AtomicBool) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;

        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::AcceptCancelled);
            }
            match listener.accept() {
                Ok((stream, _peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    return Ok(Self { stream });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }
}

impl Sink for SocketSink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    fn seek_to(&mut self, _offset: u64) -> io::Result<bool> {
        Ok(false)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_file_sink_refuses_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        std::fs::write(&path, b"already here").unwrap();

        match FileSink::create(&path) {
            Err(Error::OutputExists(p)) => assert_eq!(p, path),
            other => panic!("expected OutputExists, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_file_sink_seek_and_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");

        let mut sink = FileSink::create(&path).unwrap();
        sink.write_all(b"XXXXhello").unwrap();
        assert!(sink.seek_to(0).unwrap());
        sink.write_all(b"head").unwrap();
        sink.flush().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"headhello");
    }

    #[test]
    fn test_socket_accept_cancel() {
        let cancel = AtomicBool::new(true);
        match SocketSink::accept(0, &cancel) {
            Err(Error::AcceptCancelled) => {}
            other => panic!("expected AcceptCancelled, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_socket_sink_streams_to_reader() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cancel = AtomicBool::new(false);
        let server = std::thread::spawn(move || {
            let mut sink = SocketSink::accept(port, &cancel).unwrap();
            assert!(!sink.seek_to(0).unwrap());
            sink.write_all(b"streamed").unwrap();
            sink.flush().unwrap();
        });

        // Give the listener a moment to bind before connecting.
        let mut stream = loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(s) => break s,
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        };
        let mut got = Vec::new();
        stream.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"streamed");
        server.join().unwrap();
    }
}
