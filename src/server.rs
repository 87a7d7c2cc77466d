/*
 * Copyright 2020 Joyent, Inc.
 */

//! Request dispatch.
//!
//! The dispatcher takes decoded request messages, checks their addressing
//! headers, runs the application handler against a bound instance context
//! and returns an addressed reply. Anything that goes wrong becomes a fault
//! message; the dispatcher never hands an error back to the transport for a
//! message it has accepted.
//!
//! Checks run in this order:
//!
//! 1. every `mustUnderstand` header targeted at us is understood;
//! 2. exactly one `Action` header is present (addressed versions only);
//! 3. the `Action` matches the transport action, when one was supplied;
//! 4. `To` names this endpoint, when an endpoint address is configured.
//!
//! `make_task` drives a dispatcher over any byte stream using `SoapCodec`.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use slog::{debug, error, o, warn, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::address::EndpointAddress;
use crate::channel::{ServiceChannel, SessionChannel};
use crate::config::RuntimeConfig;
use crate::error::{
    ActionMismatchError, Error, MessageHeaderError, MustUnderstandError, ProtocolError,
};
use crate::fault::{FaultCode, FaultReason, MessageFault};
use crate::header::{names, MessageHeaders};
use crate::instance::{
    InstanceBehavior, InstanceContext, InstanceRegistry, MessageRpc, ServiceInstance,
};
use crate::message::{Message, TRANSPORT_ACTION_PROPERTY};
use crate::protocol::SoapCodec;
use crate::state::CommunicationState;
use crate::uri::{uri_equals, Uri};
use crate::version::MessageVersion;
use crate::xml::XmlElement;

/// Application handler: request, service object and a request-scoped
/// logger in; reply body out.
pub type Handler =
    dyn Fn(&Message, &ServiceInstance, &Logger) -> Result<XmlElement, Error> + Send + Sync;

/// How service objects are provided to calls.
pub enum Instancing {
    /// A fresh context per call; it closes itself once the call ends.
    PerCall(Arc<dyn InstanceBehavior>),
    /// One long-lived service object shared by every call.
    Single(ServiceInstance),
}

const ADDRESSING_HEADERS: [&str; 7] = [
    names::TO,
    names::ACTION,
    names::MESSAGE_ID,
    names::RELATES_TO,
    names::REPLY_TO,
    names::FAULT_TO,
    names::FROM,
];

/// The reply action for a request action.
pub fn reply_action(action: &str) -> String {
    format!("{}Response", action)
}

pub struct Dispatcher {
    version: MessageVersion,
    endpoint: Option<EndpointAddress>,
    config: RuntimeConfig,
    registry: Arc<InstanceRegistry>,
    behavior: Option<Arc<dyn InstanceBehavior>>,
    shared: Mutex<Option<Arc<InstanceContext>>>,
    handler: Box<Handler>,
    log: Logger,
}

impl Dispatcher {
    pub fn new<F>(
        version: MessageVersion,
        instancing: Instancing,
        handler: F,
        config: RuntimeConfig,
        log: Option<&Logger>,
    ) -> Dispatcher
    where
        F: Fn(&Message, &ServiceInstance, &Logger) -> Result<XmlElement, Error>
            + Send
            + Sync
            + 'static,
    {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let (behavior, singleton) = match instancing {
            Instancing::PerCall(b) => (Some(b), None),
            Instancing::Single(instance) => (None, Some(instance)),
        };
        Dispatcher {
            version,
            endpoint: None,
            registry: Arc::new(InstanceRegistry::new(singleton, Some(&log))),
            config,
            behavior,
            shared: Mutex::new(None),
            handler: Box::new(handler),
            log,
        }
    }

    /// Only accept requests whose `To` names this address.
    pub fn with_endpoint(mut self, endpoint: EndpointAddress) -> Dispatcher {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn version(&self) -> MessageVersion {
        self.version
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Handles one request, always producing a reply or fault message.
    pub fn dispatch(&self, mut request: Message) -> Message {
        let action = match self.validate(&mut request) {
            Ok(action) => action,
            Err(e) => return self.fault_reply(&request, e),
        };

        let log = self.log.new(o!("action" => action.clone()));
        debug!(log, "dispatching"; "message" => request.describe());

        let mut rpc = MessageRpc::new(request);
        let result = self.invoke(&mut rpc, &log);
        let request = rpc.into_request();
        match result.and_then(|body| self.reply(&request, &action, body)) {
            Ok(reply) => reply,
            Err(e) => self.fault_reply(&request, e),
        }
    }

    fn mark_understood(&self, headers: &mut MessageHeaders) {
        let addressing = headers.version().addressing;
        if !addressing.is_none() {
            for name in ADDRESSING_HEADERS.iter() {
                headers.mark_understood(name, addressing.namespace);
            }
        }
        for h in &self.config.understood_headers {
            headers.mark_understood(&h.name, &h.namespace);
        }
    }

    /// Runs the header checks and returns the request's action.
    fn validate(&self, request: &mut Message) -> Result<String, Error> {
        let version = request.version();
        if version != self.version {
            return Err(ProtocolError::protocol(format!(
                "message version {} is not accepted by this endpoint",
                version
            ))
            .into());
        }

        self.mark_understood(request.headers_mut());
        let not_understood = request.headers().not_understood();
        if !not_understood.is_empty() {
            return Err(MustUnderstandError::new(not_understood, version.envelope).into());
        }

        let addressing = version.addressing;
        let transport = request
            .property_str(TRANSPORT_ACTION_PROPERTY)
            .map(|a| a.trim_matches('"'))
            .filter(|a| !a.is_empty());
        let action = match request.headers().action()? {
            Some(action) => action,
            None if addressing.is_none() => String::from(transport.unwrap_or_default()),
            None => {
                return Err(MessageHeaderError::missing(names::ACTION, addressing.namespace).into())
            }
        };
        if let Some(transport) = transport {
            if transport != action {
                return Err(ActionMismatchError::new(transport, &action).into());
            }
        }

        if let Some(endpoint) = &self.endpoint {
            if let Some(to) = request.headers().to()? {
                if !self.accepts(endpoint, &to) {
                    return Err(ProtocolError::DestinationUnreachable {
                        to: to.as_str().to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(action)
    }

    fn accepts(&self, endpoint: &EndpointAddress, to: &Uri) -> bool {
        to.as_str() == self.version.addressing.anonymous
            || uri_equals(to, endpoint.uri(), false, true)
    }

    fn invoke(&self, rpc: &mut MessageRpc, log: &Logger) -> Result<XmlElement, Error> {
        let context = self.context_for_call()?;
        context.bind_rpc(rpc)?;
        let result = context
            .get_service_instance(Some(rpc.request()))
            .and_then(|instance| (self.handler)(rpc.request(), &instance, log));
        let unbound = context.unbind_rpc(rpc);
        let body = result?;
        unbound?;
        Ok(body)
    }

    fn context_for_call(&self) -> Result<Arc<InstanceContext>, Error> {
        match &self.behavior {
            Some(behavior) => {
                let context = InstanceContext::new(
                    Some(self.registry.clone()),
                    &self.config,
                    Some(&self.log),
                );
                context.set_behavior(Arc::clone(behavior))?;
                context.set_auto_close(true);
                context.open()?;
                Ok(context)
            }
            None => self.shared_context(),
        }
    }

    /// The long-lived context of a single-instance dispatcher, reopened if
    /// an earlier one faulted or was aborted.
    fn shared_context(&self) -> Result<Arc<InstanceContext>, Error> {
        let mut shared = self.shared.lock();
        if let Some(context) = shared.as_ref() {
            if context.state() == CommunicationState::Opened {
                return Ok(Arc::clone(context));
            }
            debug!(self.log, "replacing stale shared context";
                "instance" => %context.id(), "state" => %context.state());
            context.abort();
        }
        let instance = self
            .registry
            .singleton()
            .cloned()
            .ok_or_else(|| Error::invalid_operation("dispatcher has no service instance"))?;
        let context = InstanceContext::singleton(
            Some(self.registry.clone()),
            instance,
            &self.config,
            Some(&self.log),
        );
        context.open()?;
        *shared = Some(Arc::clone(&context));
        Ok(context)
    }

    fn reply(&self, request: &Message, action: &str, body: XmlElement) -> Result<Message, Error> {
        let mut reply = Message::create(self.version, Some(&reply_action(action)), Some(body));
        self.address_reply(request, &mut reply, false)?;
        Ok(reply)
    }

    /// Copies correlation and destination from the request. Faults prefer
    /// `FaultTo` over `ReplyTo`.
    fn address_reply(&self, request: &Message, reply: &mut Message, fault: bool) -> Result<(), Error> {
        if self.version.addressing.is_none() {
            return Ok(());
        }
        let headers = request.headers();
        if let Some(id) = headers.message_id()? {
            reply.headers_mut().set_relates_to(Some(&id));
        }
        let fault_to = if fault { headers.fault_to()? } else { None };
        let target = match fault_to {
            Some(address) => Some(address),
            None => headers.reply_to()?,
        };
        match target {
            Some(address) if !address.is_anonymous() && !address.is_none() => {
                address.apply_to(reply.headers_mut())
            }
            _ => Ok(()),
        }
    }

    fn fault_reply(&self, request: &Message, e: Error) -> Message {
        let lang = self.config.fault_locale.as_str();
        let version = self.version;
        let mut reply = match &e {
            Error::Protocol(p) => {
                warn!(self.log, "returning protocol fault";
                    "err" => %p, "message" => request.describe());
                p.create_fault_message(version, lang)
            }
            other => {
                error!(self.log, "request failed";
                    "err" => %other, "message" => request.describe());
                let fault = MessageFault::new(
                    FaultCode::receiver(None),
                    FaultReason::new(&other.to_string(), lang),
                );
                Message::create_fault(version, fault, version.addressing.default_fault_action)
            }
        };
        // The request's own headers may be what failed; address the fault
        // as far as they allow.
        if let Err(e) = self.address_reply(request, &mut reply, true) {
            debug!(self.log, "fault sent unaddressed"; "err" => %e);
        }
        reply
    }

    /// A fault for input that could not be decoded into a request.
    pub fn decode_fault(&self, e: &ProtocolError) -> Message {
        warn!(self.log, "rejecting undecodable request"; "err" => %e);
        e.create_fault_message(self.version, &self.config.fault_locale)
    }

    /// Aborts every instance context the dispatcher created.
    pub fn abort(&self) {
        if let Some(context) = self.shared.lock().take() {
            context.abort();
        }
        self.registry.abort_all();
    }
}

/// Serves requests from `socket` until the peer closes it or a request
/// cannot be decoded. Each connection is tracked as a session channel
/// on a single-instance dispatcher's context.
pub async fn make_task<S>(socket: S, dispatcher: Arc<Dispatcher>, log: Option<&Logger>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    let codec = SoapCodec::new(dispatcher.version(), dispatcher.config().quotas());
    let (mut tx, mut rx) = Framed::new(socket, codec).split();

    let session = SessionChannel::new();
    let context = match dispatcher.behavior {
        Some(_) => None,
        None => match dispatcher.shared_context() {
            Ok(context) => match context.bind_incoming_channel(session.clone()) {
                Ok(()) => Some(context),
                Err(e) => {
                    warn!(log, "connection not tracked"; "err" => %e);
                    None
                }
            },
            Err(e) => {
                warn!(log, "connection not tracked"; "err" => %e);
                None
            }
        },
    };
    debug!(log, "connection opened"; "channel" => %session.id());

    while let Some(next) = rx.next().await {
        // A framed stream ends after its first decode error, so a
        // rejected envelope gets its fault and then the connection closes.
        let (reply, last) = match next {
            Ok(request) => (dispatcher.dispatch(request), false),
            Err(Error::Protocol(e)) => (dispatcher.decode_fault(&e), true),
            Err(e) => {
                error!(log, "failed to decode request"; "err" => %e);
                break;
            }
        };
        if let Err(e) = tx.send(reply).await {
            error!(log, "failed to send reply"; "err" => %e);
            break;
        }
        if last {
            break;
        }
    }

    session.abort();
    if let Some(context) = context {
        context.unbind_incoming_channel(session.id());
    }
    debug!(log, "connection closed"; "channel" => %session.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::fault::FaultKind;
    use crate::version::AddressingVersion;
    use serde_json::json;

    const APP: &str = "urn:app";

    fn echo(msg: &Message, instance: &ServiceInstance, _log: &Logger) -> Result<XmlElement, Error> {
        let name = instance.downcast_ref::<String>().cloned().unwrap_or_default();
        match msg.body_element() {
            Some(el) if el.is(APP, "Fail") => Err(Error::invalid_operation("handler refused")),
            Some(el) => Ok(XmlElement::new(APP, "EchoResult").with_text(&format!("{}:{}", name, el.text()))),
            None => Ok(XmlElement::new(APP, "Empty")),
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            MessageVersion::SOAP12_WSA10,
            Instancing::Single(Arc::new(String::from("svc"))),
            echo,
            RuntimeConfig::default(),
            None,
        )
    }

    fn request(action: Option<&str>, text: &str) -> Message {
        let mut m = Message::create(
            MessageVersion::SOAP12_WSA10,
            action,
            Some(XmlElement::new(APP, "Echo").with_text(text)),
        );
        m.headers_mut().set_message_id(Some("urn:uuid:1"));
        m
    }

    fn sender_subcode(reply: &Message) -> String {
        let fault = reply.fault().expect("fault reply");
        assert!(fault.code().is_sender_fault());
        fault.code().subcode().map(|c| c.name().to_string()).unwrap_or_default()
    }

    #[tokio::test]
    async fn replies_are_correlated() {
        let d = dispatcher();
        let reply = d.dispatch(request(Some("urn:echo"), "hi"));
        assert!(!reply.is_fault());
        assert_eq!(reply.body_element().unwrap().text(), "svc:hi");
        assert_eq!(reply.headers().action().unwrap().as_deref(), Some("urn:echoResponse"));
        assert_eq!(reply.headers().relates_to().unwrap().as_deref(), Some("urn:uuid:1"));
        assert!(reply.headers().to().unwrap().is_none());
    }

    #[tokio::test]
    async fn replies_follow_reply_to() {
        let d = dispatcher();
        let mut req = request(Some("urn:echo"), "hi");
        let back = EndpointAddress::new("http://client.example/cb").unwrap();
        req.headers_mut().set_reply_to(Some(&back)).unwrap();
        let reply = d.dispatch(req);
        assert_eq!(
            reply.headers().to().unwrap().unwrap().as_str(),
            "http://client.example/cb"
        );
    }

    #[tokio::test]
    async fn missing_action_is_a_header_fault() {
        let d = dispatcher();
        let reply = d.dispatch(request(None, "hi"));
        assert_eq!(sender_subcode(&reply), codes::HEADER_REQUIRED);
        assert_eq!(
            reply.headers().action().unwrap().as_deref(),
            AddressingVersion::WS_ADDRESSING_10.fault_action
        );
        assert!(matches!(
            reply.fault().unwrap().kind(),
            FaultKind::ProblemHeaderQName { .. }
        ));
    }

    #[tokio::test]
    async fn transport_action_must_match() {
        let d = dispatcher();
        let mut req = request(Some("urn:echo"), "hi");
        req.set_property(TRANSPORT_ACTION_PROPERTY, json!("\"urn:other\""));
        assert_eq!(sender_subcode(&d.dispatch(req)), codes::ACTION_MISMATCH);

        let mut req = request(Some("urn:echo"), "hi");
        req.set_property(TRANSPORT_ACTION_PROPERTY, json!("\"urn:echo\""));
        assert!(!d.dispatch(req).is_fault());
    }

    #[tokio::test]
    async fn foreign_destinations_are_unreachable() {
        let d = dispatcher().with_endpoint(EndpointAddress::new("http://svc.example/echo").unwrap());
        let mut req = request(Some("urn:echo"), "hi");
        req.headers_mut()
            .set_to(Some(&Uri::parse("http://svc.example/echo/").unwrap()));
        assert!(!d.dispatch(req).is_fault());

        let mut req = request(Some("urn:echo"), "hi");
        req.headers_mut()
            .set_to(Some(&Uri::parse("http://elsewhere.example/echo").unwrap()));
        assert_eq!(sender_subcode(&d.dispatch(req)), codes::DESTINATION_UNREACHABLE);
    }

    #[tokio::test]
    async fn handler_errors_become_receiver_faults() {
        let d = dispatcher();
        let req = Message::create(
            MessageVersion::SOAP12_WSA10,
            Some("urn:echo"),
            Some(XmlElement::new(APP, "Fail")),
        );
        let reply = d.dispatch(req);
        let fault = reply.fault().unwrap();
        assert!(fault.code().is_receiver_fault());
        assert!(fault.reason().to_string().contains("handler refused"));
        assert_eq!(
            fault.reason().translations()[0].lang(),
            RuntimeConfig::default().fault_locale
        );
    }

    #[tokio::test]
    async fn per_call_contexts_close_after_the_call() {
        struct Fresh;
        impl InstanceBehavior for Fresh {
            fn get_instance(
                &self,
                _context: &InstanceContext,
                _message: Option<&Message>,
            ) -> Result<ServiceInstance, Error> {
                Ok(Arc::new(String::from("fresh")))
            }
        }

        let config = RuntimeConfig {
            auto_close: false,
            ..RuntimeConfig::default()
        };
        let d = Dispatcher::new(
            MessageVersion::SOAP12_WSA10,
            Instancing::PerCall(Arc::new(Fresh)),
            echo,
            config,
            None,
        );
        for _ in 0..20 {
            let reply = d.dispatch(request(Some("urn:echo"), "x"));
            assert_eq!(reply.body_element().unwrap().text(), "fresh:x");
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !d.registry().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn faulted_shared_context_is_replaced() {
        let d = dispatcher();
        assert!(!d.dispatch(request(Some("urn:echo"), "a")).is_fault());
        let stale = d.registry().contexts();
        assert_eq!(stale.len(), 1);
        stale[0].fault();

        assert!(!d.dispatch(request(Some("urn:echo"), "b")).is_fault());
        assert_eq!(stale[0].state(), CommunicationState::Closed);
        assert_eq!(d.registry().len(), 1);
        assert!(!d.registry().contains(stale[0].id()));
    }
}
