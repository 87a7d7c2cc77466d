/*
 * Copyright 2020 Joyent, Inc.
 */

//! Activity and channel tracking for one instance context.
//!
//! The manager counts two things under a single lock:
//!
//! * activity: calls currently bound through the context
//!   (`increment_activity_count` / `decrement_activity_count`);
//! * busy: channels held in the incoming and outgoing sets.
//!
//! The manager is busy while either count is non-zero. When both drop to
//! zero while it is open, the empty callback runs (outside the lock).
//!
//! The first incoming channel lives in a single slot. A second one promotes
//! both into a full collection; each channel contributes exactly one busy
//! count regardless of where it is stored.
//!
//! Closing first drains activity: `close_input` waits for the activity
//! count to reach zero, bounded by a timeout and a cancellation token. Once
//! closing has begun, new activity is refused with `ObjectDisposed`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use parking_lot::Mutex;
use slog::{debug, o, trace, Drain, Logger};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelCollection, ChannelId, ChannelRef};
use crate::error::Error;

pub type EmptyCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeState {
    Opened,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterState {
    Pending,
    Signaled,
    Aborted,
}

/// One-shot notification that activity reached zero. Shared between the
/// manager, which signals it, and any closers waiting on it; the last
/// holder to release it disposes it.
#[derive(Debug)]
struct ActivityWaiter {
    tx: watch::Sender<WaiterState>,
    refs: AtomicUsize,
    disposals: AtomicUsize,
}

impl ActivityWaiter {
    /// A waiter holding one reference for the manager's registration.
    fn new() -> Arc<ActivityWaiter> {
        let (tx, _) = watch::channel(WaiterState::Pending);
        Arc::new(ActivityWaiter {
            tx,
            refs: AtomicUsize::new(1),
            disposals: AtomicUsize::new(0),
        })
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.disposals.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn settle(&self, outcome: WaiterState) {
        self.tx.send_if_modified(|state| {
            if *state == WaiterState::Pending {
                *state = outcome;
                true
            } else {
                false
            }
        });
    }

    fn signal(&self) {
        self.settle(WaiterState::Signaled)
    }

    fn abort(&self) {
        self.settle(WaiterState::Aborted)
    }

    async fn wait(&self) -> WaiterState {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != WaiterState::Pending {
                return state;
            }
            if rx.changed().await.is_err() {
                return WaiterState::Aborted;
            }
        }
    }
}

struct ManagerState {
    lifetime: LifetimeState,
    activity_count: usize,
    busy_count: usize,
    first_incoming: Option<ChannelRef>,
    incoming: Option<ChannelCollection>,
    outgoing: ChannelCollection,
    activity_waiter: Option<Arc<ActivityWaiter>>,
}

impl ManagerState {
    fn is_busy(&self) -> bool {
        self.activity_count > 0 || self.busy_count > 0
    }

    /// True when the manager has just gone idle while open.
    fn is_empty_and_open(&self) -> bool {
        !self.is_busy() && self.lifetime == LifetimeState::Opened
    }

    fn incoming_count(&self) -> usize {
        match &self.incoming {
            Some(c) => c.len(),
            None => usize::from(self.first_incoming.is_some()),
        }
    }

    fn contains_incoming(&self, id: ChannelId) -> bool {
        match &self.incoming {
            Some(c) => c.contains(id),
            None => self.first_incoming.as_ref().map_or(false, |c| c.id() == id),
        }
    }

    /// Switches from the single slot to a full collection, moving any slot
    /// occupant across without changing the busy count.
    fn ensure_incoming_collection(&mut self, log: &Logger) -> &mut ChannelCollection {
        if self.incoming.is_none() {
            let mut collection = ChannelCollection::new();
            if let Some(first) = self.first_incoming.take() {
                trace!(log, "promoting first incoming channel"; "channel" => %first.id());
                collection.add(first);
            }
            self.incoming = Some(collection);
        }
        self.incoming.get_or_insert_with(ChannelCollection::new)
    }

    fn snapshot(&self) -> Vec<ChannelRef> {
        let mut channels = Vec::with_capacity(self.incoming_count() + self.outgoing.len());
        if let Some(first) = &self.first_incoming {
            channels.push(Arc::clone(first));
        }
        if let Some(incoming) = &self.incoming {
            channels.extend(incoming.iter().cloned());
        }
        channels.extend(self.outgoing.iter().cloned());
        channels
    }

    /// Forgets every channel, returning them with their busy counts removed.
    fn take_channels(&mut self) -> Vec<ChannelRef> {
        let channels = self.snapshot();
        self.first_incoming = None;
        if let Some(incoming) = &mut self.incoming {
            incoming.drain();
        }
        self.outgoing.drain();
        self.busy_count = self.busy_count.saturating_sub(channels.len());
        channels
    }
}

pub struct ServiceChannelManager {
    state: Mutex<ManagerState>,
    on_empty: Option<EmptyCallback>,
    log: Logger,
}

impl ServiceChannelManager {
    pub fn new(on_empty: Option<EmptyCallback>, log: Option<&Logger>) -> ServiceChannelManager {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        ServiceChannelManager {
            state: Mutex::new(ManagerState {
                lifetime: LifetimeState::Opened,
                activity_count: 0,
                busy_count: 0,
                first_incoming: None,
                incoming: None,
                outgoing: ChannelCollection::new(),
                activity_waiter: None,
            }),
            on_empty,
            log,
        }
    }

    fn notify_empty(&self) {
        if let Some(cb) = &self.on_empty {
            cb();
        }
    }

    pub fn lifetime_state(&self) -> LifetimeState {
        self.state.lock().lifetime
    }

    pub fn activity_count(&self) -> usize {
        self.state.lock().activity_count
    }

    pub fn busy_count(&self) -> usize {
        self.state.lock().busy_count
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().is_busy()
    }

    pub fn incoming_count(&self) -> usize {
        self.state.lock().incoming_count()
    }

    pub fn outgoing_count(&self) -> usize {
        self.state.lock().outgoing.len()
    }

    /// Whether incoming channels have been promoted out of the single slot.
    pub fn has_incoming_collection(&self) -> bool {
        self.state.lock().incoming.is_some()
    }

    pub fn increment_activity_count(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.lifetime != LifetimeState::Opened {
            return Err(Error::ObjectDisposed(String::from(
                "the instance context is closing; no new calls are accepted",
            )));
        }
        state.activity_count += 1;
        trace!(self.log, "activity incremented"; "activity" => state.activity_count);
        Ok(())
    }

    pub fn decrement_activity_count(&self) -> Result<(), Error> {
        let (waiter, empty) = {
            let mut state = self.state.lock();
            if state.activity_count == 0 {
                return Err(Error::invalid_operation(
                    "activity count decremented below zero",
                ));
            }
            state.activity_count -= 1;
            trace!(self.log, "activity decremented"; "activity" => state.activity_count);
            if state.activity_count > 0 {
                return Ok(());
            }
            (state.activity_waiter.take(), state.is_empty_and_open())
        };

        if let Some(waiter) = waiter {
            waiter.signal();
            waiter.release();
        }
        if empty {
            self.notify_empty();
        }
        Ok(())
    }

    pub fn increment_busy_count(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.lifetime != LifetimeState::Opened {
            return Err(Error::ObjectDisposed(String::from(
                "the instance context is closing",
            )));
        }
        state.busy_count += 1;
        trace!(self.log, "busy incremented"; "busy" => state.busy_count);
        Ok(())
    }

    pub fn decrement_busy_count(&self) {
        let empty = {
            let mut state = self.state.lock();
            state.busy_count = state.busy_count.saturating_sub(1);
            trace!(self.log, "busy decremented"; "busy" => state.busy_count);
            state.is_empty_and_open()
        };
        if empty {
            self.notify_empty();
        }
    }

    /// Tracks an incoming channel. A closing or closed manager aborts the
    /// channel and refuses it.
    pub fn add_incoming_channel(&self, channel: ChannelRef) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if state.lifetime == LifetimeState::Opened {
                if state.contains_incoming(channel.id()) {
                    return Ok(());
                }
                let id = channel.id();
                if state.incoming.is_none() && state.first_incoming.is_none() {
                    state.first_incoming = Some(channel);
                } else {
                    state.ensure_incoming_collection(&self.log).add(channel);
                }
                state.busy_count += 1;
                trace!(self.log, "incoming channel added";
                    "channel" => %id, "busy" => state.busy_count);
                return Ok(());
            }
        }
        channel.abort();
        Err(Error::ObjectDisposed(format!(
            "{} cannot join a closing instance context",
            channel.id()
        )))
    }

    pub fn add_outgoing_channel(&self, channel: ChannelRef) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if state.lifetime == LifetimeState::Opened {
                let id = channel.id();
                if state.outgoing.add(channel) {
                    state.busy_count += 1;
                    trace!(self.log, "outgoing channel added";
                        "channel" => %id, "busy" => state.busy_count);
                }
                return Ok(());
            }
        }
        channel.abort();
        Err(Error::ObjectDisposed(format!(
            "{} cannot join a closing instance context",
            channel.id()
        )))
    }

    /// Stops tracking a channel. Returns whether it was tracked.
    pub fn remove_channel(&self, id: ChannelId) -> bool {
        let empty = {
            let mut state = self.state.lock();
            let removed = if state.first_incoming.as_ref().map_or(false, |c| c.id() == id) {
                state.first_incoming = None;
                true
            } else if state.incoming.as_mut().and_then(|c| c.remove(id)).is_some() {
                true
            } else {
                state.outgoing.remove(id).is_some()
            };
            if !removed {
                return false;
            }
            state.busy_count = state.busy_count.saturating_sub(1);
            trace!(self.log, "channel removed"; "channel" => %id, "busy" => state.busy_count);
            state.is_empty_and_open()
        };
        if empty {
            self.notify_empty();
        }
        true
    }

    /// Every tracked channel: the single-slot incoming channel, the
    /// incoming collection, then outgoing channels.
    pub fn snapshot_channels(&self) -> Vec<ChannelRef> {
        self.state.lock().snapshot()
    }

    /// Stops admitting new activity and waits for outstanding activity to
    /// finish. Times out with `Timeout`; an abort during the wait fails
    /// with `ObjectDisposed`. Cancelling `token` is treated as a timeout.
    pub async fn close_input(&self, timeout: Duration, token: &CancellationToken) -> Result<(), Error> {
        let waiter = {
            let mut state = self.state.lock();
            match state.lifetime {
                LifetimeState::Opened => {
                    state.lifetime = LifetimeState::Closing;
                    debug!(self.log, "closing input"; "activity" => state.activity_count);
                }
                LifetimeState::Closing => (),
                LifetimeState::Closed => {
                    return Err(Error::ObjectDisposed(String::from(
                        "the instance context was aborted",
                    )))
                }
            }
            if state.activity_count == 0 {
                return Ok(());
            }
            let waiter = state
                .activity_waiter
                .get_or_insert_with(ActivityWaiter::new)
                .clone();
            waiter.add_ref();
            waiter
        };

        let outcome = tokio::select! {
            r = tokio::time::timeout(timeout, waiter.wait()) => r.ok(),
            _ = token.cancelled() => None,
        };
        waiter.release();

        match outcome {
            Some(WaiterState::Signaled) => Ok(()),
            Some(_) => Err(Error::ObjectDisposed(String::from(
                "the instance context was aborted while closing",
            ))),
            None if self.lifetime_state() == LifetimeState::Closed => Err(Error::ObjectDisposed(
                String::from("the instance context was aborted while closing"),
            )),
            None => Err(Error::Timeout(format!(
                "{} call(s) still active after {:?}",
                self.activity_count(),
                timeout
            ))),
        }
    }

    /// Drains activity, then closes every channel within what is left of
    /// `timeout`.
    pub async fn close(&self, timeout: Duration, token: &CancellationToken) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.close_input(timeout, token).await?;

        let channels = {
            let mut state = self.state.lock();
            if state.lifetime == LifetimeState::Closed {
                return Err(Error::ObjectDisposed(String::from(
                    "the instance context was aborted while closing",
                )));
            }
            state.take_channels()
        };
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let closes = channels.iter().map(|c| c.close(remaining));
        let results = tokio::select! {
            r = tokio::time::timeout(remaining, future::join_all(closes)) => r,
            _ = token.cancelled() => {
                channels.iter().for_each(|c| c.abort());
                return Err(Error::Timeout(String::from("channel close was cancelled")));
            }
        };

        self.state.lock().lifetime = LifetimeState::Closed;
        debug!(self.log, "closed"; "channels" => channels.len());
        match results {
            Ok(results) => results.into_iter().collect(),
            Err(_) => {
                channels.iter().for_each(|c| c.abort());
                Err(Error::Timeout(format!(
                    "channels did not close within {:?}",
                    timeout
                )))
            }
        }
    }

    /// Aborts every tracked channel and releases any pending close.
    pub fn abort(&self) {
        let (channels, waiter) = {
            let mut state = self.state.lock();
            state.lifetime = LifetimeState::Closed;
            (state.take_channels(), state.activity_waiter.take())
        };
        debug!(self.log, "aborting"; "channels" => channels.len());
        if let Some(waiter) = waiter {
            waiter.abort();
            waiter.release();
        }
        for channel in channels {
            channel.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ServiceChannel, SessionChannel};
    use crate::state::CommunicationState;

    fn manager() -> Arc<ServiceChannelManager> {
        Arc::new(ServiceChannelManager::new(None, None))
    }

    #[test]
    fn promotion_does_not_double_count() {
        let m = manager();
        let a = SessionChannel::new();
        let b = SessionChannel::new();

        m.add_incoming_channel(a.clone()).unwrap();
        assert_eq!(m.incoming_count(), 1);
        assert_eq!(m.busy_count(), 1);
        assert!(!m.has_incoming_collection());

        m.add_incoming_channel(a.clone()).unwrap();
        assert_eq!(m.busy_count(), 1);

        m.add_incoming_channel(b.clone()).unwrap();
        assert_eq!(m.incoming_count(), 2);
        assert_eq!(m.busy_count(), 2);
        assert!(m.has_incoming_collection());

        assert!(m.remove_channel(a.id()));
        assert!(!m.remove_channel(a.id()));
        assert_eq!(m.busy_count(), 1);
    }

    #[test]
    fn snapshot_is_exact() {
        let m = manager();
        m.add_incoming_channel(SessionChannel::new()).unwrap();
        m.add_outgoing_channel(SessionChannel::new()).unwrap();
        let snap = m.snapshot_channels();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.capacity(), 2);

        m.add_incoming_channel(SessionChannel::new()).unwrap();
        let snap = m.snapshot_channels();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.capacity(), 3);
    }

    #[test]
    fn empty_callback_fires_when_idle() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let m = ServiceChannelManager::new(
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        );
        let ch = SessionChannel::new();
        m.add_incoming_channel(ch.clone()).unwrap();
        m.increment_activity_count().unwrap();
        m.decrement_activity_count().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(m.remove_channel(ch.id()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        m.increment_busy_count().unwrap();
        m.decrement_busy_count();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(m.decrement_activity_count().is_err());
    }

    #[tokio::test]
    async fn close_waits_for_activity() {
        let m = manager();
        for _ in 0..3 {
            m.increment_activity_count().unwrap();
        }
        let token = CancellationToken::new();
        let closer = {
            let m = m.clone();
            let token = token.clone();
            tokio::spawn(async move { m.close_input(Duration::from_secs(5), &token).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(m.lifetime_state(), LifetimeState::Closing);
        assert!(matches!(m.increment_activity_count(), Err(Error::ObjectDisposed(_))));

        m.decrement_activity_count().unwrap();
        m.decrement_activity_count().unwrap();
        assert!(!closer.is_finished());
        m.decrement_activity_count().unwrap();
        closer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_times_out_then_abort_releases() {
        let m = manager();
        m.increment_activity_count().unwrap();
        let token = CancellationToken::new();
        let r = m.close_input(Duration::from_millis(10), &token).await;
        assert!(matches!(r, Err(Error::Timeout(_))));

        let closer = {
            let m = m.clone();
            tokio::spawn(async move {
                m.close_input(Duration::from_secs(5), &CancellationToken::new()).await
            })
        };
        tokio::task::yield_now().await;
        m.abort();
        assert!(matches!(closer.await.unwrap(), Err(Error::ObjectDisposed(_))));
    }

    #[tokio::test]
    async fn cancellation_maps_to_timeout() {
        let m = manager();
        m.increment_activity_count().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let r = m.close_input(Duration::from_secs(5), &token).await;
        assert!(matches!(r, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn waiter_is_disposed_once() {
        let waiter = ActivityWaiter::new();
        waiter.add_ref();
        waiter.add_ref();

        let w = waiter.clone();
        let second = tokio::spawn(async move {
            let s = w.wait().await;
            w.release();
            s
        });
        waiter.signal();
        waiter.abort();
        waiter.release();
        assert_eq!(waiter.wait().await, WaiterState::Signaled);
        waiter.release();
        assert_eq!(second.await.unwrap(), WaiterState::Signaled);
        assert_eq!(waiter.disposals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_closes_channels() {
        let m = manager();
        let a = SessionChannel::new();
        let b = SessionChannel::new();
        m.add_incoming_channel(a.clone()).unwrap();
        m.add_outgoing_channel(b.clone()).unwrap();
        m.close(Duration::from_secs(1), &CancellationToken::new()).await.unwrap();
        assert_eq!(a.state(), CommunicationState::Closed);
        assert_eq!(b.state(), CommunicationState::Closed);
        assert_eq!(m.lifetime_state(), LifetimeState::Closed);
        assert_eq!(m.busy_count(), 0);

        let late = SessionChannel::new();
        assert!(m.add_incoming_channel(late.clone()).is_err());
        assert_eq!(late.state(), CommunicationState::Closed);
    }

    #[test]
    fn abort_is_idempotent() {
        let m = manager();
        let ch = SessionChannel::new();
        m.add_incoming_channel(ch.clone()).unwrap();
        m.abort();
        m.abort();
        assert_eq!(ch.state(), CommunicationState::Closed);
        assert_eq!(m.lifetime_state(), LifetimeState::Closed);
        assert_eq!(m.incoming_count(), 0);
        assert!(!m.is_busy());
    }
}
