//! Subcommand implementations

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use layerio_core::{Channel, ChannelConfig, Interest, Runtime, Scope, StdStream};
use tracing::{debug, info};

use crate::drivers::FileDriver;

const CHUNK_CHARS: usize = 4096;
const COPY_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared state for one invocation
pub struct Session {
    pub runtime: Runtime,
    pub scope: Scope,
    pub config: ChannelConfig,
}

impl Session {
    /// Open `path` as a channel, apply the configured options and register it
    pub fn open(&self, path: &Path, mode: Interest) -> Result<Channel> {
        let driver = FileDriver::open(path, mode)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let name = path.display().to_string();
        let channel = self.runtime.create_channel(driver, &name, mode);
        channel
            .apply_config(&self.config)
            .with_context(|| format!("Invalid channel options for {}", name))?;
        self.scope.register(&channel)?;
        debug!(channel = %name, "opened");
        Ok(channel)
    }

    fn stdout(&self) -> Result<Channel> {
        self.runtime
            .std_channel(StdStream::Stdout)
            .context("stdout channel not installed")
    }

    fn done_with(&self, channel: &Channel) -> Result<()> {
        self.scope.unregister(&channel.name())?;
        Ok(())
    }
}

/// Write each file's decoded contents to stdout
pub fn cat(session: &Session, files: &[PathBuf]) -> Result<()> {
    let out = session.stdout()?;
    for path in files {
        let ch = session.open(path, Interest::READABLE)?;
        loop {
            let text = ch.read_chars(CHUNK_CHARS)?;
            if text.is_empty() {
                break;
            }
            out.write_chars(&text)?;
        }
        session.done_with(&ch)?;
    }
    out.flush()?;
    Ok(())
}

/// Count lines as the channel's input translation sees them
pub fn lines(session: &Session, file: &Path) -> Result<u64> {
    let ch = session.open(file, Interest::READABLE)?;
    let mut count = 0u64;
    while ch.gets()?.is_some() {
        count += 1;
    }
    session.done_with(&ch)?;
    let out = session.stdout()?;
    out.write_chars(&format!("{}\n", count))?;
    out.flush()?;
    Ok(count)
}

/// Copy `src` to `dst`, optionally through the event loop
pub fn copy(
    session: &Session,
    src: &Path,
    dst: &Path,
    limit: Option<u64>,
    background: bool,
) -> Result<u64> {
    let from = session.open(src, Interest::READABLE)?;
    let to = session.open(dst, Interest::WRITABLE)?;

    let total = if background {
        let outcome: Rc<RefCell<Option<(u64, Option<String>)>>> = Rc::new(RefCell::new(None));
        let slot = outcome.clone();
        from.copy_to_background(&to, limit, move |n, err| {
            *slot.borrow_mut() = Some((n, err.map(|e| e.to_string())));
        })?;
        let finished = session
            .runtime
            .run_until(|| outcome.borrow().is_some(), Some(COPY_TIMEOUT));
        if !finished {
            bail!("Background copy did not finish within {:?}", COPY_TIMEOUT);
        }
        let result = outcome.borrow_mut().take();
        match result {
            Some((n, None)) => n,
            Some((_, Some(err))) => bail!("Background copy failed: {}", err),
            None => bail!("Background copy produced no result"),
        }
    } else {
        from.copy_to(&to, limit)?
    };

    session.done_with(&from)?;
    session.done_with(&to)?;
    info!(src = %src.display(), dst = %dst.display(), total, "copy finished");
    Ok(total)
}

/// Print every option of a freshly opened channel
pub fn options(session: &Session, file: &Path) -> Result<()> {
    let ch = session.open(file, Interest::READABLE)?;
    let out = session.stdout()?;
    for (name, value) in ch.options()? {
        let shown = if value.is_empty() { "{}".to_string() } else { value };
        out.write_chars(&format!("-{} {}\n", name, shown))?;
    }
    out.flush()?;
    session.done_with(&ch)?;
    Ok(())
}
