//! Server role: interface registry, call dispatch and the per-connection
//! driver.
//!
//! Handlers run concurrently, but replies on one connection are written
//! strictly in call-arrival order: every non-oneway call gets a slot in an
//! ordered queue and only the head slot's replies reach the wire. The
//! built-in `org.varlink.service` interface is served from the same schema
//! engine that renders every registered interface description.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::convert::OutDescriptors;
use crate::error::*;
use crate::fdarray::{dup_raw, Fd, FileDescriptorArray};
use crate::idl::{Interface, Method, VError, VStruct, VType, VTypeExt};
use crate::transport::{TransportWriter, UpgradedConnection, VarlinkTransport, HIGH_WATER};
use crate::{GetInterfaceDescriptionArgs, Reply, Request, ServiceInfo};

const WRITE_QUEUE_FRAMES: usize = 32;

/// A varlink error reply, named by a fully qualified error symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReply {
    pub error: String,
    pub parameters: Option<Value>,
}

impl ErrorReply {
    pub fn new<S: Into<String>>(error: S, parameters: Option<Value>) -> Self {
        ErrorReply {
            error: error.into(),
            parameters,
        }
    }

    pub fn interface_not_found(interface: &str) -> Self {
        ErrorReply::new(
            "org.varlink.service.InterfaceNotFound",
            Some(json!({ "interface": interface })),
        )
    }

    pub fn method_not_found(method: &str) -> Self {
        ErrorReply::new(
            "org.varlink.service.MethodNotFound",
            Some(json!({ "method": method })),
        )
    }

    pub fn method_not_implemented(method: &str) -> Self {
        ErrorReply::new(
            "org.varlink.service.MethodNotImplemented",
            Some(json!({ "method": method })),
        )
    }

    pub fn invalid_parameter(parameter: &str) -> Self {
        ErrorReply::new(
            "org.varlink.service.InvalidParameter",
            Some(json!({ "parameter": parameter })),
        )
    }

    pub fn expected_more() -> Self {
        ErrorReply::new("org.varlink.service.ExpectedMore", None)
    }

    fn into_reply(self) -> Reply {
        Reply::error(self.error, self.parameters)
    }
}

/// Handlers may fail with an [`ErrorReply`]; it is sent as the call's error
/// reply instead of tearing the connection down.
impl From<ErrorReply> for Error {
    fn from(e: ErrorReply) -> Self {
        context!(ErrorKind::VarlinkErrorReply(e.into_reply()))
    }
}

enum SlotMsg {
    Reply {
        reply: Reply,
        fds: Vec<OwnedFd>,
    },
    /// The first reply of an upgrade method plus the handoff channel for
    /// the raw connection.
    Upgrade {
        reply: Reply,
        fds: Vec<OwnedFd>,
        done: oneshot::Sender<UpgradedConnection>,
    },
    Violation(String),
}

type SlotRecv = mpsc::UnboundedReceiver<SlotMsg>;

struct ReplySink {
    tx: mpsc::UnboundedSender<SlotMsg>,
    fds_supported: bool,
}

/// One received call, handed to a method handler.
///
/// Replies go out through [`MethodCall::reply`] (terminal) and
/// [`MethodCall::reply_continues`] (streamed elements, requires the `more`
/// call flag). Replies of oneway calls are discarded.
pub struct MethodCall {
    interface: Arc<Interface>,
    output: VStruct,
    parameters: Value,
    fds: FileDescriptorArray,
    oneway: bool,
    more: bool,
    upgrade_requested: bool,
    sink: ReplySink,
    replied: bool,
}

impl MethodCall {
    /// Deserialize the converted call parameters. Descriptor-typed fields
    /// hold raw descriptor numbers owned by [`MethodCall::fds`].
    pub fn parameters<I: DeserializeOwned>(&self) -> Result<I> {
        serde_json::from_value(self.parameters.clone()).map_err(map_context!())
    }

    pub fn raw_parameters(&self) -> &Value {
        &self.parameters
    }

    /// The descriptors that arrived with this call. They are closed when the
    /// call is dropped unless taken.
    pub fn fds(&mut self) -> &mut FileDescriptorArray {
        &mut self.fds
    }

    /// Claim ownership of a descriptor referenced by a parameter field.
    pub fn take_fd(&mut self, fd: Fd) -> Result<OwnedFd> {
        self.fds.take_fd(fd).ok_or_else(|| {
            context!(ErrorKind::Conversion(format!(
                "descriptor {} does not belong to this call",
                fd.raw()
            )))
        })
    }

    /// True if this call accepts more than one reply.
    pub fn wants_more(&self) -> bool {
        self.more
    }

    /// True if this call does not want a reply.
    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    fn build_reply<O: Serialize>(
        &self,
        parameters: O,
        continues: bool,
    ) -> Result<(Reply, Vec<OwnedFd>)> {
        let native = serde_json::to_value(parameters).map_err(map_context!())?;
        let mut out = OutDescriptors::new();
        let wire = self
            .output
            .to_wire(&native, &self.interface, &mut out)
            .map_err(map_context!())?;
        if !out.is_empty() && !self.sink.fds_supported {
            return Err(context!(ErrorKind::DescriptorsUnsupported));
        }
        let mut fds = Vec::with_capacity(out.len());
        for &raw in out.as_raw() {
            fds.push(dup_raw(raw).map_err(map_context!())?);
        }
        let parameters = match &wire {
            Value::Object(o) if o.is_empty() => None,
            _ => Some(wire),
        };
        let reply = Reply {
            continues: if continues { Some(true) } else { None },
            error: None,
            parameters,
        };
        Ok((reply, fds))
    }

    fn send_reply_value<O: Serialize>(&mut self, parameters: O, continues: bool) -> Result<()> {
        if self.oneway {
            // replies of oneway calls are discarded
            if !continues {
                self.replied = true;
            }
            return Ok(());
        }
        if continues && !self.more {
            return Err(context!(ErrorKind::CallContinuesMismatch));
        }
        if self.replied {
            return Err(context!(ErrorKind::MethodCalledAlready));
        }
        let (reply, fds) = self.build_reply(parameters, continues)?;
        self.sink
            .tx
            .send(SlotMsg::Reply { reply, fds })
            .map_err(|_| context!(ErrorKind::ConnectionClosed))?;
        if !continues {
            self.replied = true;
        }
        Ok(())
    }

    /// Send the terminal reply of this call.
    pub fn reply<O: Serialize>(&mut self, parameters: O) -> Result<()> {
        self.send_reply_value(parameters, false)
    }

    /// Send a streamed reply element; the call must carry the `more` flag.
    pub fn reply_continues<O: Serialize>(&mut self, parameters: O) -> Result<()> {
        self.send_reply_value(parameters, true)
    }

    /// Send an error reply. Terminal like [`MethodCall::reply`].
    pub fn reply_error(&mut self, error: ErrorReply) -> Result<()> {
        if self.replied {
            return Err(context!(ErrorKind::MethodCalledAlready));
        }
        self.replied = true;
        if self.oneway {
            return Ok(());
        }
        self.sink
            .tx
            .send(SlotMsg::Reply {
                reply: error.into_reply(),
                fds: Vec::new(),
            })
            .map_err(|_| context!(ErrorKind::ConnectionClosed))
    }

    /// Send the first reply of an upgrade method, wait for it to be flushed
    /// and take over the raw connection endpoints.
    pub async fn upgrade<O: Serialize>(mut self, parameters: O) -> Result<UpgradedConnection> {
        if !self.upgrade_requested {
            return Err(context!(ErrorKind::CallModeMismatch));
        }
        if self.replied {
            return Err(context!(ErrorKind::MethodCalledAlready));
        }
        let (reply, fds) = self.build_reply(parameters, false)?;
        self.replied = true;
        let (done, handoff) = oneshot::channel();
        self.sink
            .tx
            .send(SlotMsg::Upgrade { reply, fds, done })
            .map_err(|_| context!(ErrorKind::ConnectionClosed))?;
        handoff
            .await
            .map_err(|_| context!(ErrorKind::ConnectionClosed))
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Handler = Box<dyn Fn(MethodCall) -> HandlerFuture + Send + Sync>;

/// A lazy sequence of streamed reply values: the next element or done.
#[async_trait]
pub trait ReplySource<T>: Send {
    async fn next(&mut self) -> Option<T>;
}

/// Adapts any iterator into a [`ReplySource`].
pub struct IterSource<I>(pub I);

#[async_trait]
impl<T, I> ReplySource<T> for IterSource<I>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send,
{
    async fn next(&mut self) -> Option<T> {
        self.0.next()
    }
}

enum StreamPrep<S> {
    Source(S),
    Done,
    Failed(Error),
}

/// A registered interface: its declaration plus the handlers implementing
/// it. Handlers attach per method name; dispatch is a table lookup.
pub struct VarlinkInterface {
    interface: Arc<Interface>,
    handlers: HashMap<String, Handler>,
}

impl VarlinkInterface {
    pub fn new(interface: Interface) -> Self {
        VarlinkInterface {
            interface: Arc::new(interface),
            handlers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.interface.name()
    }

    pub fn interface(&self) -> &Arc<Interface> {
        &self.interface
    }

    /// Attach an async handler to a declared method. The handler drives its
    /// replies through the passed [`MethodCall`].
    pub fn on_call<F, Fut>(&mut self, method: &str, handler: F) -> Result<()>
    where
        F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.interface.method(method).is_none() {
            return Err(context!(ErrorKind::Configuration(format!(
                "interface '{}' does not declare method '{}'",
                self.interface.name(),
                method
            ))));
        }
        if self.handlers.contains_key(method) {
            return Err(context!(ErrorKind::Configuration(format!(
                "duplicate handler for method '{}'",
                method
            ))));
        }
        self.handlers
            .insert(method.to_string(), Box::new(move |call| Box::pin(handler(call))));
        Ok(())
    }

    /// Attach a streaming handler to a method declared with `more`. The
    /// producer builds a [`ReplySource`]; every element but the last is sent
    /// with `continues: true`. Calls without the `more` flag are answered
    /// with the `org.varlink.service.ExpectedMore` error.
    pub fn on_stream<F, S, T>(&mut self, method: &str, producer: F) -> Result<()>
    where
        F: Fn(&mut MethodCall) -> Result<S> + Send + Sync + 'static,
        S: ReplySource<T> + 'static,
        T: Serialize + Send + 'static,
    {
        match self.interface.method(method) {
            Some(m) if m.more => {}
            Some(_) => {
                return Err(context!(ErrorKind::Configuration(format!(
                    "method '{}' is not declared with more",
                    method
                ))));
            }
            None => {
                return Err(context!(ErrorKind::Configuration(format!(
                    "interface '{}' does not declare method '{}'",
                    self.interface.name(),
                    method
                ))));
            }
        }
        self.on_call(method, move |mut call: MethodCall| {
            let prep = if !call.wants_more() && !call.is_oneway() {
                match call.reply_error(ErrorReply::expected_more()) {
                    Ok(()) => StreamPrep::Done,
                    Err(e) => StreamPrep::Failed(e),
                }
            } else {
                match producer(&mut call) {
                    Ok(source) => StreamPrep::Source(source),
                    Err(e) => StreamPrep::Failed(e),
                }
            };
            async move {
                let mut source = match prep {
                    StreamPrep::Source(source) => source,
                    StreamPrep::Done => return Ok(()),
                    StreamPrep::Failed(e) => return Err(e),
                };
                let mut previous: Option<T> = None;
                while let Some(item) = source.next().await {
                    if let Some(prev) = previous.take() {
                        call.reply_continues(&prev)?;
                    }
                    previous = Some(item);
                }
                match previous {
                    Some(last) => call.reply(&last),
                    None => Err(context!(ErrorKind::ProtocolViolation(
                        "streaming method produced no replies".into()
                    ))),
                }
            }
        })
    }
}

/// The declaration of the built-in `org.varlink.service` interface.
pub fn org_varlink_service_interface() -> Result<Interface> {
    Interface::builder("org.varlink.service")
        .doc(
            "The Varlink Service Interface is provided by every varlink service. It\n\
             describes the service and the interfaces it implements.",
        )
        .method(
            Method::new("GetInfo")
                .doc(
                    "Get a list of all the interfaces a service provides and information\n\
                     about the implementation.",
                )
                .output("vendor", VTypeExt::Plain(VType::String))
                .output("product", VTypeExt::Plain(VType::String))
                .output("version", VTypeExt::Plain(VType::String))
                .output("url", VTypeExt::Plain(VType::String))
                .output("interfaces", VTypeExt::array(VTypeExt::Plain(VType::String))),
        )
        .method(
            Method::new("GetInterfaceDescription")
                .doc("Get the description of an interface that is implemented by this service.")
                .input("interface", VTypeExt::Plain(VType::String))
                .output("description", VTypeExt::Plain(VType::String)),
        )
        .error(
            VError::new("InterfaceNotFound")
                .doc("The requested interface was not found.")
                .param("interface", VTypeExt::Plain(VType::String)),
        )
        .error(
            VError::new("MethodNotFound")
                .doc("The requested method was not found")
                .param("method", VTypeExt::Plain(VType::String)),
        )
        .error(
            VError::new("MethodNotImplemented")
                .doc(
                    "The interface defines the requested method, but the service does not\n\
                     implement it.",
                )
                .param("method", VTypeExt::Plain(VType::String)),
        )
        .error(
            VError::new("InvalidParameter")
                .doc("One of the passed parameters is invalid.")
                .param("parameter", VTypeExt::Plain(VType::String)),
        )
        .error(
            VError::new("ExpectedMore").doc(
                "The method was expecting to be called with \"more\": true, but was\n\
                 called without.",
            ),
        )
        .build()
}

/// Dispatches incoming calls to registered interfaces and serves the
/// `org.varlink.service` introspection methods.
pub struct VarlinkService {
    info: ServiceInfo,
    service_iface: Arc<Interface>,
    ifaces: HashMap<String, Arc<VarlinkInterface>>,
    order: Vec<String>,
}

impl VarlinkService {
    /// Create a service from its metadata and interfaces. Registration
    /// happens here, before any connection exists; a duplicate interface
    /// name is a fatal configuration error.
    pub fn new<S: Into<Cow<'static, str>>>(
        vendor: S,
        product: S,
        version: S,
        url: S,
        interfaces: Vec<VarlinkInterface>,
    ) -> Result<Self> {
        let service_iface = Arc::new(org_varlink_service_interface()?);
        let mut ifaces = HashMap::new();
        let mut order = vec![service_iface.name().to_string()];
        for iface in interfaces {
            let name = iface.name().to_string();
            if name == service_iface.name()
                || ifaces.insert(name.clone(), Arc::new(iface)).is_some()
            {
                return Err(context!(ErrorKind::Configuration(format!(
                    "an interface named {} is already registered",
                    name
                ))));
            }
            order.push(name);
        }
        let info = ServiceInfo {
            vendor: vendor.into(),
            product: product.into(),
            version: version.into(),
            url: url.into(),
            interfaces: order.iter().cloned().map(Cow::Owned).collect(),
        };
        Ok(VarlinkService {
            info,
            service_iface,
            ifaces,
            order,
        })
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    /// Registered interface names in registration order, the built-in
    /// service interface first.
    pub fn interface_names(&self) -> &[String] {
        &self.order
    }

    /// The rendered description of a registered interface.
    pub fn description_of(&self, interface: &str) -> Option<&str> {
        if interface == self.service_iface.name() {
            return Some(self.service_iface.description());
        }
        self.ifaces
            .get(interface)
            .map(|iface| iface.interface.description())
    }

    fn dispatch(
        self: &Arc<Self>,
        obj: Value,
        fds: FileDescriptorArray,
        handlers: &mut JoinSet<()>,
        fds_supported: bool,
    ) -> Result<Option<SlotRecv>> {
        let request: Request<'static> = serde_json::from_value(obj).map_err(|err| {
            context!(ErrorKind::ProtocolViolation(format!(
                "invalid call object: {}",
                err
            )))
        })?;
        if !request.flags_valid() {
            return Err(context!(ErrorKind::ProtocolViolation(
                "call combines the more, oneway and upgrade flags".into()
            )));
        }
        let oneway = request.oneway == Some(true);
        let more = request.more == Some(true);
        let upgrade = request.upgrade == Some(true);

        let method_full = request.method.to_string();
        let Some(dot) = method_full.rfind('.') else {
            return Ok(reply_slot(oneway, ErrorReply::interface_not_found(&method_full)));
        };
        let iface_name = &method_full[..dot];
        let method_name = &method_full[dot + 1..];

        if iface_name == self.service_iface.name() {
            if oneway {
                return Ok(None);
            }
            return Ok(Some(self.dispatch_service(method_name, &request)));
        }
        let Some(iface) = self.ifaces.get(iface_name) else {
            return Ok(reply_slot(oneway, ErrorReply::interface_not_found(iface_name)));
        };
        let Some(method) = iface.interface.method(method_name) else {
            return Ok(reply_slot(oneway, ErrorReply::method_not_found(&method_full)));
        };
        let Some(handler) = iface.handlers.get(method_name) else {
            return Ok(reply_slot(
                oneway,
                ErrorReply::method_not_implemented(&method_full),
            ));
        };
        if upgrade && !method.upgrade {
            return Ok(reply_slot(oneway, ErrorReply::invalid_parameter("upgrade")));
        }

        let params = request
            .parameters
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let native = match method.input.from_wire(&params, &iface.interface, Some(&fds)) {
            Ok(native) => native,
            Err(e) => {
                debug!("invalid parameters for {}: {}", method_full, e);
                return Ok(reply_slot(
                    oneway,
                    ErrorReply::invalid_parameter(&e.parameter()),
                ));
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let err_tx = tx.clone();
        let call = MethodCall {
            interface: Arc::clone(&iface.interface),
            output: method.output.clone(),
            parameters: native,
            fds,
            oneway,
            more,
            upgrade_requested: upgrade,
            sink: ReplySink { tx, fds_supported },
            replied: false,
        };
        let fut = handler(call);
        handlers.spawn(async move {
            if let Err(e) = fut.await {
                match e.kind() {
                    ErrorKind::VarlinkErrorReply(reply) => {
                        let _ = err_tx.send(SlotMsg::Reply {
                            reply: reply.clone(),
                            fds: Vec::new(),
                        });
                    }
                    kind => {
                        warn!("method handler failed: {}", e);
                        let _ = err_tx.send(SlotMsg::Violation(kind.to_string()));
                    }
                }
            }
        });
        Ok(if oneway { None } else { Some(rx) })
    }

    fn dispatch_service(&self, method: &str, request: &Request) -> SlotRecv {
        let (tx, rx) = mpsc::unbounded_channel();
        let reply = self.service_reply(method, request);
        let _ = tx.send(SlotMsg::Reply {
            reply,
            fds: Vec::new(),
        });
        rx
    }

    fn service_reply(&self, method: &str, request: &Request) -> Reply {
        match method {
            "GetInfo" => match serde_json::to_value(&self.info) {
                Ok(info) => Reply::parameters(Some(info)),
                Err(_) => ErrorReply::invalid_parameter("info").into_reply(),
            },
            "GetInterfaceDescription" => {
                let Some(params) = &request.parameters else {
                    return ErrorReply::invalid_parameter("parameters").into_reply();
                };
                match serde_json::from_value::<GetInterfaceDescriptionArgs>(params.clone()) {
                    Ok(args) => match self.description_of(&args.interface) {
                        Some(description) => {
                            Reply::parameters(Some(json!({ "description": description })))
                        }
                        None => ErrorReply::invalid_parameter("interface").into_reply(),
                    },
                    Err(_) => ErrorReply::invalid_parameter("interface").into_reply(),
                }
            }
            _ => ErrorReply::method_not_found(&format!(
                "{}.{}",
                self.service_iface.name(),
                method
            ))
            .into_reply(),
        }
    }
}

fn reply_slot(oneway: bool, error: ErrorReply) -> Option<SlotRecv> {
    if oneway {
        return None;
    }
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(SlotMsg::Reply {
        reply: error.into_reply(),
        fds: Vec::new(),
    });
    Some(rx)
}

enum WriteCmd {
    Frame { reply: Reply, fds: Vec<OwnedFd> },
    Handoff(oneshot::Sender<TransportWriter>),
}

async fn writer_loop(mut writer: TransportWriter, mut rx: mpsc::Receiver<WriteCmd>) {
    while let Some(cmd) = rx.recv().await {
        let mut handoff = None;
        match cmd {
            WriteCmd::Frame { reply, fds } => {
                if let Err(e) = writer.enqueue(&reply, fds) {
                    debug!("dropping undeliverable reply: {}", e);
                }
            }
            WriteCmd::Handoff(done) => handoff = Some(done),
        }
        // coalesce already queued replies up to the high-water mark before
        // touching the socket
        while handoff.is_none() && writer.backlog() <= HIGH_WATER {
            match rx.try_recv() {
                Ok(WriteCmd::Frame { reply, fds }) => {
                    if let Err(e) = writer.enqueue(&reply, fds) {
                        debug!("dropping undeliverable reply: {}", e);
                    }
                }
                Ok(WriteCmd::Handoff(done)) => handoff = Some(done),
                Err(_) => break,
            }
        }
        if let Err(e) = writer.flush().await {
            debug!("writing replies failed: {}", e);
            break;
        }
        if let Some(done) = handoff {
            let _ = done.send(writer);
            return;
        }
    }
    writer.close().await;
}

/// Serve one varlink connection until the peer hangs up, a protocol
/// violation occurs or the connection is upgraded.
///
/// Incoming calls are dispatched as soon as they arrive, even while an
/// earlier streaming call is still producing; their replies queue behind the
/// earlier call's. A bounded writer queue pauses reading while the peer is
/// slow to accept replies.
pub async fn serve_connection(
    service: Arc<VarlinkService>,
    transport: VarlinkTransport,
) -> Result<()> {
    let fds_supported = transport.supports_descriptors();
    let (mut reader, writer) = transport.split();
    let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_FRAMES);
    let writer_task = tokio::spawn(writer_loop(writer, write_rx));
    let mut slots: VecDeque<SlotRecv> = VecDeque::new();
    let mut handlers = JoinSet::new();
    let mut reading = true;
    let mut failure: Option<Error> = None;

    'connection: while reading || !slots.is_empty() {
        while handlers.try_join_next().is_some() {}
        let have_slots = !slots.is_empty();
        tokio::select! {
            biased;
            item = async { slots.front_mut().unwrap().recv().await }, if have_slots => {
                match item {
                    Some(SlotMsg::Reply { reply, fds }) => {
                        let terminal = reply.continues != Some(true);
                        if write_tx.send(WriteCmd::Frame { reply, fds }).await.is_err() {
                            failure = Some(context!(ErrorKind::ConnectionClosed));
                            break 'connection;
                        }
                        if terminal {
                            slots.pop_front();
                        }
                    }
                    Some(SlotMsg::Upgrade { reply, fds, done }) => {
                        if write_tx.send(WriteCmd::Frame { reply, fds }).await.is_err() {
                            failure = Some(context!(ErrorKind::ConnectionClosed));
                            break 'connection;
                        }
                        let (handoff_tx, handoff_rx) = oneshot::channel();
                        if write_tx.send(WriteCmd::Handoff(handoff_tx)).await.is_err() {
                            failure = Some(context!(ErrorKind::ConnectionClosed));
                            break 'connection;
                        }
                        let Ok(writer) = handoff_rx.await else {
                            failure = Some(context!(ErrorKind::ConnectionClosed));
                            break 'connection;
                        };
                        let (read_fd, read_buffer) = reader.into_parts();
                        let _ = done.send(UpgradedConnection {
                            read_fd,
                            write_fd: writer.into_inner(),
                            read_buffer,
                        });
                        // the connection left the varlink protocol; the
                        // upgraded handler keeps running on its own
                        handlers.detach_all();
                        return Ok(());
                    }
                    Some(SlotMsg::Violation(msg)) => {
                        failure = Some(context!(ErrorKind::ProtocolViolation(msg)));
                        break 'connection;
                    }
                    None => {
                        failure = Some(context!(ErrorKind::ProtocolViolation(
                            "method handler finished without a terminal reply".into()
                        )));
                        break 'connection;
                    }
                }
            }
            msg = reader.recv_message(), if reading => {
                match msg {
                    Ok(Some((obj, fds))) => {
                        match service.dispatch(obj, fds, &mut handlers, fds_supported) {
                            Ok(Some(slot)) => slots.push_back(slot),
                            Ok(None) => {}
                            Err(e) => {
                                failure = Some(e);
                                break 'connection;
                            }
                        }
                    }
                    Ok(None) => reading = false,
                    Err(e) => {
                        failure = Some(e);
                        break 'connection;
                    }
                }
            }
        }
    }

    drop(write_tx);
    let _ = writer_task.await;
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
