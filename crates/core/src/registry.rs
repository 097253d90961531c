//! Named channel registry
//!
//! A [`Scope`] maps names to channels for one execution context. Each entry
//! holds a registration on its channel; a channel closes once its last
//! registration goes away.

use std::cell::RefCell;
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::{ChannelError, Result};

/// Names visible to one execution context
pub struct Scope {
    name: String,
    channels: RefCell<BTreeMap<String, Channel>>,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `channel` under its own name.
    ///
    /// Registering the same channel twice is a no-op; a different channel
    /// with the same name is refused.
    pub fn register(&self, channel: &Channel) -> Result<()> {
        if channel.is_closed() {
            return Err(ChannelError::Closed);
        }
        let key = channel.name();
        let mut channels = self.channels.borrow_mut();
        if let Some(existing) = channels.get(&key) {
            if existing == channel {
                return Ok(());
            }
            return Err(ChannelError::Invalid(format!(
                "channel name \"{}\" already in use in scope \"{}\"",
                key, self.name
            )));
        }
        channel.retain_ref();
        channels.insert(key, channel.clone());
        debug!(scope = %self.name, channel = %channel.name(), refs = channel.ref_count(), "channel registered");
        Ok(())
    }

    /// Drop the entry for `name`, releasing its registration.
    ///
    /// Returns the close error if this was the channel's last registration
    /// and closing it failed.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let removed = self.channels.borrow_mut().remove(name);
        match removed {
            Some(channel) => {
                debug!(scope = %self.name, channel = name, "channel unregistered");
                channel.release_ref()
            }
            None => Err(ChannelError::Invalid(format!(
                "can not find channel named \"{}\"",
                name
            ))),
        }
    }

    pub fn get(&self, name: &str) -> Option<Channel> {
        self.channels.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.borrow().contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.channels.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.borrow().is_empty()
    }

    /// Release every entry; channels left without registrations close.
    pub fn teardown(&self) -> Result<()> {
        let entries = std::mem::take(&mut *self.channels.borrow_mut());
        let mut first: Option<ChannelError> = None;
        for (name, channel) in entries {
            if let Err(e) = channel.release_ref() {
                warn!(scope = %self.name, channel = %name, error = %e, "close failed during teardown");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(scope = %self.name, error = %e, "scope teardown failed");
        }
    }
}
