/*
 * Copyright 2020 Joyent, Inc.
 */

//! Channels tracked by an instance context.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use parking_lot::Mutex;

use crate::error::Error;
use crate::state::CommunicationState;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> ChannelId {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// A session-bearing channel as seen by the instance layer.
pub trait ServiceChannel: Send + Sync + fmt::Debug {
    fn id(&self) -> ChannelId;

    fn state(&self) -> CommunicationState;

    /// Tears the channel down immediately.
    fn abort(&self);

    /// Gracefully closes the channel within `timeout`.
    fn close(&self, timeout: Duration) -> BoxFuture<'static, Result<(), Error>>;
}

pub type ChannelRef = Arc<dyn ServiceChannel>;

/// Set of channels keyed by id.
#[derive(Debug, Default)]
pub struct ChannelCollection {
    channels: HashMap<ChannelId, ChannelRef>,
}

impl ChannelCollection {
    pub fn new() -> ChannelCollection {
        ChannelCollection::default()
    }

    /// Adds the channel; false when it was already present.
    pub fn add(&mut self, channel: ChannelRef) -> bool {
        let id = channel.id();
        if self.channels.contains_key(&id) {
            return false;
        }
        self.channels.insert(id, channel);
        true
    }

    pub fn remove(&mut self, id: ChannelId) -> Option<ChannelRef> {
        self.channels.remove(&id)
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelRef> {
        self.channels.values()
    }

    pub fn drain(&mut self) -> Vec<ChannelRef> {
        self.channels.drain().map(|(_, c)| c).collect()
    }
}

/// A basic in-process session channel. Transports wrap their connection
/// state in one of these so the instance layer can close or abort it.
#[derive(Debug)]
pub struct SessionChannel {
    id: ChannelId,
    state: Mutex<CommunicationState>,
}

impl SessionChannel {
    pub fn new() -> Arc<SessionChannel> {
        Arc::new(SessionChannel {
            id: ChannelId::next(),
            state: Mutex::new(CommunicationState::Opened),
        })
    }

    pub fn fault(&self) {
        let mut state = self.state.lock();
        if state.can_transition_to(CommunicationState::Faulted) {
            *state = CommunicationState::Faulted;
        }
    }
}

impl ServiceChannel for SessionChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn state(&self) -> CommunicationState {
        *self.state.lock()
    }

    fn abort(&self) {
        *self.state.lock() = CommunicationState::Closed;
    }

    fn close(&self, _timeout: Duration) -> BoxFuture<'static, Result<(), Error>> {
        let result = {
            let mut state = self.state.lock();
            match *state {
                CommunicationState::Closed => Ok(()),
                CommunicationState::Faulted => Err(Error::Communication(format!(
                    "{} is faulted",
                    self.id
                ))),
                _ => {
                    *state = CommunicationState::Closed;
                    Ok(())
                }
            }
        };
        Box::pin(future::ready(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_ignores_duplicates() {
        let a: ChannelRef = SessionChannel::new();
        let b: ChannelRef = SessionChannel::new();
        let mut c = ChannelCollection::new();
        assert!(c.add(a.clone()));
        assert!(!c.add(a.clone()));
        assert!(c.add(b.clone()));
        assert_eq!(c.len(), 2);
        assert!(c.remove(a.id()).is_some());
        assert!(!c.contains(a.id()));
        assert_eq!(c.drain().len(), 1);
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn session_channel_lifecycle() {
        let ch = SessionChannel::new();
        assert_eq!(ch.state(), CommunicationState::Opened);
        ch.close(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ch.state(), CommunicationState::Closed);

        let faulted = SessionChannel::new();
        faulted.fault();
        assert!(faulted.close(Duration::from_secs(1)).await.is_err());
        faulted.abort();
        assert_eq!(faulted.state(), CommunicationState::Closed);
    }
}
