/*
 * Copyright 2020 Joyent, Inc.
 */

//! Instance contexts: the unit binding one service object to the calls and
//! channels that use it.
//!
//! A context moves through the usual communication states. Opening runs the
//! behavior's `initialize` hook and registers with the host. Closing drains
//! in-flight calls through the channel manager, releases the service object
//! and unregisters. Abort does the same cleanup immediately from any state.
//!
//! When the last call and channel go away while the context is open and
//! auto-close is on, the context closes itself on the current tokio
//! runtime. Failures on that path are logged, never returned.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelId, ChannelRef};
use crate::channel_manager::{EmptyCallback, ServiceChannelManager};
use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::message::Message;
use crate::state::CommunicationState;

/// The application's service object.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> InstanceId {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Instancing policy: how service objects are created and released.
pub trait InstanceBehavior: Send + Sync {
    fn initialize(&self, _context: &InstanceContext) {}

    /// Creates the service object. `message` is the request that caused
    /// the lookup, when there is one.
    fn get_instance(
        &self,
        context: &InstanceContext,
        message: Option<&Message>,
    ) -> Result<ServiceInstance, Error>;

    fn release_instance(&self, _context: &InstanceContext, _instance: ServiceInstance) {}

    /// Returning false keeps an idle context open.
    fn can_unload(&self, _context: &InstanceContext) -> bool {
        true
    }
}

/// The host side of the instance lifecycle.
pub trait ServiceHost: Send + Sync {
    fn bind_instance(&self, context: &Arc<InstanceContext>);

    /// May be called for a context that is not bound.
    fn unbind_instance(&self, context: &InstanceContext);

    /// A long-lived service object owned by the host. It is never passed
    /// to `release_instance`.
    fn disposable_instance(&self) -> Option<ServiceInstance> {
        None
    }

    /// Called when a singleton context faults.
    fn fault_singleton(&self, _context: &InstanceContext) {}
}

/// The binding record for one request while it is dispatched.
#[derive(Debug)]
pub struct MessageRpc {
    request: Message,
    bound_context: Option<InstanceId>,
    successfully_bound: bool,
}

impl MessageRpc {
    pub fn new(request: Message) -> MessageRpc {
        MessageRpc {
            request,
            bound_context: None,
            successfully_bound: false,
        }
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn is_bound(&self) -> bool {
        self.successfully_bound
    }

    pub fn into_request(self) -> Message {
        self.request
    }
}

struct ContextState {
    state: CommunicationState,
    behavior: Option<Arc<dyn InstanceBehavior>>,
    instance: Option<ServiceInstance>,
    auto_close: bool,
    bound_to_host: bool,
}

fn same_instance(a: &ServiceInstance, b: &ServiceInstance) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub struct InstanceContext {
    id: InstanceId,
    host: Option<Arc<dyn ServiceHost>>,
    is_singleton: bool,
    inner: Mutex<ContextState>,
    /// Held across `InstanceBehavior::get_instance`.
    creating: Mutex<()>,
    manager: ServiceChannelManager,
    close_timeout: Duration,
    cancel: CancellationToken,
    log: Logger,
}

impl fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InstanceContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("is_singleton", &self.is_singleton)
            .finish()
    }
}

impl InstanceContext {
    /// A context whose service object is created on demand by its behavior.
    pub fn new(
        host: Option<Arc<dyn ServiceHost>>,
        config: &RuntimeConfig,
        log: Option<&Logger>,
    ) -> Arc<InstanceContext> {
        InstanceContext::build(host, None, config, log)
    }

    /// A context wrapping an existing, long-lived service object. Singleton
    /// contexts never close on idle.
    pub fn singleton(
        host: Option<Arc<dyn ServiceHost>>,
        instance: ServiceInstance,
        config: &RuntimeConfig,
        log: Option<&Logger>,
    ) -> Arc<InstanceContext> {
        InstanceContext::build(host, Some(instance), config, log)
    }

    fn build(
        host: Option<Arc<dyn ServiceHost>>,
        instance: Option<ServiceInstance>,
        config: &RuntimeConfig,
        log: Option<&Logger>,
    ) -> Arc<InstanceContext> {
        let id = InstanceId::next();
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("instance" => id.to_string()));
        let is_singleton = instance.is_some();

        Arc::new_cyclic(|this: &Weak<InstanceContext>| {
            let this = this.clone();
            let on_empty: EmptyCallback = Box::new(move || {
                if let Some(context) = this.upgrade() {
                    context.notify_idle();
                }
            });
            InstanceContext {
                id,
                host,
                is_singleton,
                inner: Mutex::new(ContextState {
                    state: CommunicationState::Created,
                    behavior: None,
                    instance,
                    auto_close: config.auto_close && !is_singleton,
                    bound_to_host: false,
                }),
                creating: Mutex::new(()),
                manager: ServiceChannelManager::new(Some(on_empty), Some(&log)),
                close_timeout: config.close_timeout(),
                cancel: CancellationToken::new(),
                log,
            }
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn state(&self) -> CommunicationState {
        self.inner.lock().state
    }

    pub fn is_singleton(&self) -> bool {
        self.is_singleton
    }

    pub fn auto_close(&self) -> bool {
        self.inner.lock().auto_close
    }

    pub fn set_auto_close(&self, auto_close: bool) {
        self.inner.lock().auto_close = auto_close && !self.is_singleton;
    }

    pub fn channel_manager(&self) -> &ServiceChannelManager {
        &self.manager
    }

    pub fn activity_count(&self) -> usize {
        self.manager.activity_count()
    }

    pub fn incoming_channel_count(&self) -> usize {
        self.manager.incoming_count()
    }

    pub fn set_behavior(&self, behavior: Arc<dyn InstanceBehavior>) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.state.is_closing_or_closed() {
            return Err(Error::ObjectDisposed(format!("{} is {}", self.id, inner.state)));
        }
        inner.behavior = Some(behavior);
        Ok(())
    }

    pub fn open(self: &Arc<Self>) -> Result<(), Error> {
        let behavior = {
            let mut inner = self.inner.lock();
            CommunicationState::transition(&mut inner.state, CommunicationState::Opening)?;
            inner.bound_to_host = self.host.is_some();
            inner.behavior.clone()
        };
        debug!(self.log, "opening");

        if let Some(behavior) = &behavior {
            behavior.initialize(self);
        }
        if let Some(host) = &self.host {
            host.bind_instance(self);
        }

        let opened = {
            let mut inner = self.inner.lock();
            CommunicationState::transition(&mut inner.state, CommunicationState::Opened)
        };
        if let Err(e) = opened {
            // Aborted or faulted while the host was binding us.
            if let Some(host) = &self.host {
                host.unbind_instance(self);
            }
            return Err(e);
        }
        info!(self.log, "instance context opened");
        Ok(())
    }

    pub async fn close(self: &Arc<Self>) -> Result<(), Error> {
        self.close_with_timeout(self.close_timeout).await
    }

    /// Drains calls and channels within `timeout`, then releases the
    /// service object. A failed drain aborts the context.
    pub async fn close_with_timeout(self: &Arc<Self>, timeout: Duration) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock();
            CommunicationState::transition(&mut inner.state, CommunicationState::Closing)?;
        }
        debug!(self.log, "closing"; "timeout" => ?timeout);

        if let Err(e) = self.manager.close(timeout, &self.cancel).await {
            debug!(self.log, "close failed; aborting"; "err" => %e);
            self.abort();
            return Err(e);
        }
        self.unload();

        let closed = {
            let mut inner = self.inner.lock();
            if inner.state == CommunicationState::Closing {
                inner.state = CommunicationState::Closed;
                true
            } else {
                false
            }
        };
        if closed {
            info!(self.log, "instance context closed");
        }
        Ok(())
    }

    /// Closes immediately from any state, including `Faulted`.
    pub fn abort(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.state, CommunicationState::Closed)
        };
        debug!(self.log, "aborting"; "previous" => %previous);
        self.manager.abort();
        self.cancel.cancel();
        self.unload();
    }

    pub fn fault(&self) {
        let faulted = {
            let mut inner = self.inner.lock();
            CommunicationState::transition(&mut inner.state, CommunicationState::Faulted).is_ok()
        };
        if !faulted {
            return;
        }
        warn!(self.log, "instance context faulted");
        if self.is_singleton {
            if let Some(host) = &self.host {
                host.fault_singleton(self);
            }
        }
    }

    fn unload(&self) {
        let (instance, behavior, unbind) = {
            let mut inner = self.inner.lock();
            (
                inner.instance.take(),
                inner.behavior.clone(),
                std::mem::take(&mut inner.bound_to_host),
            )
        };
        if let Some(instance) = instance {
            self.release(instance, behavior);
        }
        if unbind {
            if let Some(host) = &self.host {
                host.unbind_instance(self);
            }
        }
    }

    fn release(&self, instance: ServiceInstance, behavior: Option<Arc<dyn InstanceBehavior>>) {
        let disposable = self.host.as_ref().and_then(|h| h.disposable_instance());
        if disposable.map_or(false, |d| same_instance(&d, &instance)) {
            trace!(self.log, "keeping host-owned instance");
            return;
        }
        if let Some(behavior) = behavior {
            behavior.release_instance(self, instance);
        }
    }

    /// Releases the current service object. The next call creates a new one.
    pub fn release_service_instance(&self) {
        let (instance, behavior) = {
            let mut inner = self.inner.lock();
            (inner.instance.take(), inner.behavior.clone())
        };
        if let Some(instance) = instance {
            self.release(instance, behavior);
        }
    }

    fn cached_instance(&self) -> Result<Option<ServiceInstance>, Error> {
        let inner = self.inner.lock();
        if matches!(
            inner.state,
            CommunicationState::Closed | CommunicationState::Faulted
        ) {
            return Err(Error::ObjectDisposed(format!("{} is {}", self.id, inner.state)));
        }
        Ok(inner.instance.clone())
    }

    /// The service object, creating it through the behavior on first use.
    /// Concurrent first calls create it once.
    pub fn get_service_instance(&self, message: Option<&Message>) -> Result<ServiceInstance, Error> {
        if let Some(instance) = self.cached_instance()? {
            return Ok(instance);
        }
        let _creating = self.creating.lock();
        if let Some(instance) = self.cached_instance()? {
            return Ok(instance);
        }
        let behavior = self.inner.lock().behavior.clone();

        let behavior = match behavior {
            Some(b) => b,
            None => {
                let e = Error::invalid_operation(format!(
                    "no instance behavior has been assigned to {}",
                    self.id
                ));
                return Err(match message {
                    Some(m) => e.with_message_context(m),
                    None => e,
                });
            }
        };

        let created = behavior.get_instance(self, message)?;
        let disposed = {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                CommunicationState::Closed | CommunicationState::Faulted
            ) {
                Some(inner.state)
            } else {
                inner.instance = Some(Arc::clone(&created));
                None
            }
        };
        match disposed {
            // Closed while the object was being created.
            Some(state) => {
                self.release(created, Some(behavior));
                Err(Error::ObjectDisposed(format!("{} is {}", self.id, state)))
            }
            None => Ok(created),
        }
    }

    /// Counts the call as activity on this context.
    pub fn bind_rpc(&self, rpc: &mut MessageRpc) -> Result<(), Error> {
        {
            let inner = self.inner.lock();
            if inner.state != CommunicationState::Opened {
                return Err(Error::ObjectDisposed(format!(
                    "{} is {}; no new calls are accepted",
                    self.id, inner.state
                )));
            }
        }
        self.manager.increment_activity_count()?;
        rpc.bound_context = Some(self.id);
        rpc.successfully_bound = true;
        Ok(())
    }

    /// Undoes `bind_rpc`. Calls that were never bound here are ignored.
    pub fn unbind_rpc(&self, rpc: &mut MessageRpc) -> Result<(), Error> {
        if rpc.bound_context != Some(self.id) || !rpc.successfully_bound {
            return Ok(());
        }
        rpc.successfully_bound = false;
        self.manager.decrement_activity_count()
    }

    pub fn bind_incoming_channel(&self, channel: ChannelRef) -> Result<(), Error> {
        {
            let inner = self.inner.lock();
            if inner.state.is_closing_or_closed() {
                drop(inner);
                channel.abort();
                return Err(Error::ObjectDisposed(format!(
                    "{} cannot accept {}",
                    self.id,
                    channel.id()
                )));
            }
        }
        let id = channel.id();
        self.manager.add_incoming_channel(Arc::clone(&channel))?;
        // The channel may have closed while it was being added.
        if channel.state().is_closing_or_closed() {
            trace!(self.log, "dropping channel closed during bind"; "channel" => %id);
            self.manager.remove_channel(id);
        }
        Ok(())
    }

    pub fn unbind_incoming_channel(&self, id: ChannelId) -> bool {
        self.manager.remove_channel(id)
    }

    fn notify_idle(self: &Arc<Self>) {
        let behavior = {
            let inner = self.inner.lock();
            if inner.state != CommunicationState::Opened || !inner.auto_close {
                return;
            }
            inner.behavior.clone()
        };
        if let Some(behavior) = &behavior {
            if !behavior.can_unload(self) {
                trace!(self.log, "idle, unload refused by behavior");
                return;
            }
        }

        match Handle::try_current() {
            Ok(handle) => {
                debug!(self.log, "idle; closing");
                let context = Arc::clone(self);
                handle.spawn(async move {
                    if let Err(e) = context.close().await {
                        context.log_idle_close_failure(&e);
                    }
                });
            }
            Err(_) => {
                warn!(self.log, "idle outside a runtime; aborting");
                self.abort();
            }
        }
    }

    fn log_idle_close_failure(&self, e: &Error) {
        if e.is_expected_close_failure() {
            warn!(self.log, "idle close failed"; "err" => %e);
        } else {
            error!(self.log, "idle close failed"; "err" => %e);
        }
    }
}

/// A `ServiceHost` that tracks its open contexts and may own a singleton
/// service object.
pub struct InstanceRegistry {
    contexts: Mutex<HashMap<InstanceId, Arc<InstanceContext>>>,
    singleton: Option<ServiceInstance>,
    singleton_faults: AtomicUsize,
    log: Logger,
}

impl InstanceRegistry {
    pub fn new(singleton: Option<ServiceInstance>, log: Option<&Logger>) -> InstanceRegistry {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        InstanceRegistry {
            contexts: Mutex::new(HashMap::new()),
            singleton,
            singleton_faults: AtomicUsize::new(0),
            log,
        }
    }

    pub fn singleton(&self) -> Option<&ServiceInstance> {
        self.singleton.as_ref()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.contexts.lock().contains_key(&id)
    }

    pub fn contexts(&self) -> Vec<Arc<InstanceContext>> {
        self.contexts.lock().values().cloned().collect()
    }

    pub fn singleton_faults(&self) -> usize {
        self.singleton_faults.load(Ordering::Acquire)
    }

    /// Aborts every bound context.
    pub fn abort_all(&self) {
        for context in self.contexts() {
            context.abort();
        }
    }
}

impl ServiceHost for InstanceRegistry {
    fn bind_instance(&self, context: &Arc<InstanceContext>) {
        trace!(self.log, "binding"; "instance" => %context.id());
        self.contexts.lock().insert(context.id(), Arc::clone(context));
    }

    fn unbind_instance(&self, context: &InstanceContext) {
        trace!(self.log, "unbinding"; "instance" => %context.id());
        self.contexts.lock().remove(&context.id());
    }

    fn disposable_instance(&self) -> Option<ServiceInstance> {
        self.singleton.clone()
    }

    fn fault_singleton(&self, context: &InstanceContext) {
        warn!(self.log, "singleton instance context faulted"; "instance" => %context.id());
        self.singleton_faults.fetch_add(1, Ordering::AcqRel);
    }
}
