//! OS transports for the command-line embedder
//!
//! The core library ships no OS drivers; these wrap `std::fs::File` and the
//! process's standard streams. Both behave like regular files for readiness:
//! always ready for whatever is asked.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use layerio_core::{
    Below, ChannelDriver, ChannelError, ChannelWaker, Direction, Interest, RawHandle, SeekMode,
};

fn always_ready(mask: Interest, waker: &ChannelWaker) {
    waker.set_source(mask, || Interest::READABLE | Interest::WRITABLE);
}

/// A file on disk
pub struct FileDriver {
    file: File,
    path: PathBuf,
}

impl FileDriver {
    /// Open `path` for the directions in `mode`; writing creates and truncates
    pub fn open(path: &Path, mode: Interest) -> io::Result<Self> {
        let writable = mode.contains(Interest::WRITABLE);
        let file = OpenOptions::new()
            .read(mode.contains(Interest::READABLE))
            .write(writable)
            .create(writable)
            .truncate(writable && !mode.contains(Interest::READABLE))
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl ChannelDriver for FileDriver {
    fn type_name(&self) -> &str {
        "file"
    }

    fn input(&mut self, _below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn output(&mut self, _below: &mut Below<'_>, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn close(&mut self, _below: &mut Below<'_>) -> io::Result<()> {
        self.file.flush()
    }

    fn wide_seek(&mut self, _below: &mut Below<'_>, offset: i64, mode: SeekMode) -> io::Result<i64> {
        let from = match mode {
            SeekMode::Start => {
                let start = u64::try_from(offset).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "negative seek position")
                })?;
                SeekFrom::Start(start)
            }
            SeekMode::Current => SeekFrom::Current(offset),
            SeekMode::End => SeekFrom::End(offset),
        };
        let pos = self.file.seek(from)?;
        i64::try_from(pos).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "position overflow"))
    }

    fn watch(&mut self, _below: &mut Below<'_>, mask: Interest, waker: &ChannelWaker) {
        always_ready(mask, waker);
    }

    #[cfg(unix)]
    fn handle(&mut self, _below: &mut Below<'_>, _dir: Direction) -> Option<RawHandle> {
        use std::os::unix::io::AsRawFd;
        Some(RawHandle::from(self.file.as_raw_fd()))
    }

    fn get_option(&mut self, _below: &mut Below<'_>, name: &str) -> layerio_core::Result<String> {
        match name.trim_start_matches('-') {
            "path" => Ok(self.path.display().to_string()),
            _ => Err(ChannelError::unknown_option(name, &["path"])),
        }
    }

    fn set_option(&mut self, _below: &mut Below<'_>, name: &str, _value: &str) -> layerio_core::Result<()> {
        match name.trim_start_matches('-') {
            "path" => Err(ChannelError::bad_value("path", "option is read-only")),
            _ => Err(ChannelError::unknown_option(name, &["path"])),
        }
    }

    fn options(&mut self, _below: &mut Below<'_>) -> Vec<(String, String)> {
        vec![("path".to_string(), self.path.display().to_string())]
    }
}

/// Which standard stream a [`StdioDriver`] wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdio {
    In,
    Out,
    Err,
}

/// The process's stdin, stdout or stderr
pub struct StdioDriver {
    stream: Stdio,
}

impl StdioDriver {
    pub fn new(stream: Stdio) -> Self {
        Self { stream }
    }

    /// Open mode matching the stream's direction
    pub fn mode(&self) -> Interest {
        match self.stream {
            Stdio::In => Interest::READABLE,
            Stdio::Out | Stdio::Err => Interest::WRITABLE,
        }
    }
}

impl ChannelDriver for StdioDriver {
    fn type_name(&self) -> &str {
        "stdio"
    }

    fn input(&mut self, _below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream {
            Stdio::In => io::stdin().lock().read(buf),
            Stdio::Out | Stdio::Err => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream is write-only",
            )),
        }
    }

    fn output(&mut self, _below: &mut Below<'_>, buf: &[u8]) -> io::Result<usize> {
        match self.stream {
            Stdio::Out => {
                let mut out = io::stdout().lock();
                let n = out.write(buf)?;
                out.flush()?;
                Ok(n)
            }
            Stdio::Err => io::stderr().lock().write(buf),
            Stdio::In => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream is read-only",
            )),
        }
    }

    fn close(&mut self, _below: &mut Below<'_>) -> io::Result<()> {
        match self.stream {
            Stdio::Out => io::stdout().flush(),
            Stdio::Err => io::stderr().flush(),
            Stdio::In => Ok(()),
        }
    }

    fn watch(&mut self, _below: &mut Below<'_>, mask: Interest, waker: &ChannelWaker) {
        always_ready(mask, waker);
    }
}
