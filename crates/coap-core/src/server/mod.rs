//! CoAP server
//!
//! The CoapServer is responsible for:
//! - Receiving datagrams and dispatching requests to the resource tree
//! - Registering and dropping observers through the [`ObserveLayer`]
//! - Sending notifications after every state change
//! - Correlating ACK/RST and retransmission give-ups with observers
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!  datagram ────► │  CoapServer  │ ◄──── ReliabilityEvent::Exhausted
//!                 └──────────────┘
//!                        │
//!      ┌─────────────────┼──────────────────┬──────────────────┐
//!      ▼                 ▼                  ▼                  ▼
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Resource │   │ ObserveLayer │   │ Notification │   │   Events    │
//! │   Tree   │   │  (relations) │   │  Dispatcher  │   │  (monitor)  │
//! └──────────┘   └──────────────┘   └──────────────┘   └─────────────┘
//! ```
//!
//! ## Request Flow
//!
//! 1. Decode, then short-circuit empty ACK/RST/ping messages
//! 2. Feed Block1 uploads through reassembly
//! 3. Render the target resource and update the tree
//! 4. Respond (piggybacked on the ACK for confirmable requests)
//! 5. Notify observers of whatever changed
//!
//! Resources with a [`response_delay`](crate::Resource::response_delay) get a
//! separate response instead: an empty ACK right away, then a confirmable
//! response from a background task once the delay has passed.

pub mod udp;

pub use udp::UdpTransport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::layers::{Blockwise, Matcher, Reliability};
use crate::message::{
    CoapCodec, Code, Message, MessageType, Method, Request, Response, Serializer, Token,
    encode_uint, option_number,
};
use crate::observe::{
    Notification, NotificationBuilder, NotificationCommand, NotificationDispatcher, ObserveLayer,
};
use crate::resource::{PostOutcome, ResourceHandle, ResourceRef, ResourceTree};
use crate::traits::{
    BlockwiseLayer, BlockwiseRequest, MessageMatcher, ReliabilityEvent, RetransmissionScheduler,
    Transport,
};

/// Why an observer was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The client sent a GET with Observe=1
    Deregistered,
    /// The client answered a notification with RST
    Reset,
    /// A confirmable notification was never acknowledged
    Unacknowledged,
    /// The observed resource was deleted
    Deleted,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            RemovalReason::Deregistered => "deregistered",
            RemovalReason::Reset => "reset",
            RemovalReason::Unacknowledged => "unacknowledged",
            RemovalReason::Deleted => "deleted",
        };
        f.write_str(reason)
    }
}

/// Events emitted by the CoapServer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Server started listening
    Started {
        local_addr: SocketAddr,
        resources_count: usize,
    },

    /// A client started (or renewed) observing a resource
    ObserverRegistered {
        path: String,
        peer: SocketAddr,
        token: Token,
    },

    /// An observer was dropped
    ObserverRemoved {
        path: String,
        peer: SocketAddr,
        reason: RemovalReason,
    },

    /// A notification reached the transport
    NotificationSent {
        path: String,
        peer: SocketAddr,
        code: Code,
    },

    /// Server stopped
    Stopped {
        reason: String,
    },
}

/// CoAP server with RFC 7641 observe support
///
/// ## Lifecycle
///
/// 1. Create with [`CoapServer::bind()`]
/// 2. Start with [`CoapServer::run()`]
/// 3. Server runs until shutdown signal received
/// 4. Pending retransmissions are cancelled on the way out
///
/// ## Threading
///
/// Datagrams are handled one at a time on the task calling `run()`.
/// Retransmissions and separate responses run on their own tokio tasks;
/// retransmissions report back through the reliability event channel.
pub struct CoapServer {
    /// Receiving side; `None` for servers assembled around a custom transport
    socket: Option<UdpTransport>,

    /// Sending side
    transport: Arc<dyn Transport>,

    serializer: Arc<dyn Serializer>,

    tree: RwLock<ResourceTree>,

    observe: ObserveLayer,

    blockwise: Arc<Blockwise>,

    reliability: Arc<Reliability>,

    matcher: Arc<Matcher>,

    builder: NotificationBuilder,

    dispatcher: NotificationDispatcher,

    /// Give-up notices from the retransmission tasks
    reliability_rx: Mutex<mpsc::Receiver<ReliabilityEvent>>,

    /// Separate responses waiting for their delay to pass
    deferred: Mutex<JoinSet<()>>,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<ServerEvent>,
}

impl CoapServer {
    /// Bind a UDP socket and assemble the server
    ///
    /// # Parameters
    ///
    /// - `config`: Server configuration
    /// - `tree`: Resources to serve
    ///
    /// # Returns
    ///
    /// A tuple of (server, event_receiver) where event_receiver yields server events
    pub async fn bind(
        config: ServerConfig,
        tree: ResourceTree,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>)> {
        config.validate()?;
        let socket = UdpTransport::bind(config.bind_addr()?).await?;
        let transport: Arc<dyn Transport> = Arc::new(socket.clone());
        Ok(Self::assemble(config, tree, transport, Some(socket)))
    }

    /// Assemble a server that writes through `transport` and receives nothing by itself
    ///
    /// Datagrams are fed in with [`CoapServer::handle_datagram`]. Such a
    /// server cannot [`run`](CoapServer::run).
    pub fn with_transport(
        config: ServerConfig,
        tree: ResourceTree,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>)> {
        config.validate()?;
        Ok(Self::assemble(config, tree, transport, None))
    }

    fn assemble(
        config: ServerConfig,
        tree: ResourceTree,
        transport: Arc<dyn Transport>,
        socket: Option<UdpTransport>,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let serializer: Arc<dyn Serializer> = Arc::new(CoapCodec::new());
        let blockwise = Arc::new(Blockwise::new(&config.blockwise));
        let (reliability, reliability_rx) = Reliability::new(
            config.reliability.clone(),
            Arc::clone(&transport),
            Arc::clone(&serializer),
        );
        let reliability = Arc::new(reliability);
        let matcher = Arc::new(Matcher::new(&config.matcher));

        let builder = NotificationBuilder::new(blockwise.clone(), reliability.clone(), matcher.clone());
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&transport),
            Arc::clone(&serializer),
            reliability.clone(),
        );

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);

        let server = Self {
            socket,
            transport,
            serializer,
            tree: RwLock::new(tree),
            observe: ObserveLayer::default(),
            blockwise,
            reliability,
            matcher,
            builder,
            dispatcher,
            reliability_rx: Mutex::new(reliability_rx),
            deferred: Mutex::new(JoinSet::new()),
            event_tx: tx,
        };

        (server, rx)
    }

    /// Address of the bound socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::transport("server has no socket"))?
            .local_addr()
    }

    /// Observer bookkeeping
    pub fn observe(&self) -> &ObserveLayer {
        &self.observe
    }

    /// Paths of every served resource
    pub async fn resource_paths(&self) -> Vec<String> {
        self.tree.read().await.paths()
    }

    /// Confirmable messages still waiting for an ACK
    pub fn pending_retransmissions(&self) -> usize {
        self.reliability.pending_count()
    }

    /// Run the server
    ///
    /// Runs until SIGINT is received.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Fatal error
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the server until `shutdown_rx` fires (or SIGINT when `None`)
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::transport("server has no socket to receive from"))?;
        let local_addr = socket.local_addr()?;
        let resources_count = self.tree.read().await.paths().len();

        info!("CoAP server listening on {} ({} resources)", local_addr, resources_count);
        self.emit_event(ServerEvent::Started {
            local_addr,
            resources_count,
        });

        let mut reliability_rx = self.reliability_rx.lock().await;

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for SIGINT: {}", e);
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                received = socket.recv_from() => match received {
                    Ok((datagram, source)) => {
                        if let Err(e) = self.handle_datagram(&datagram, source).await {
                            warn!("Failed to handle datagram from {}: {}", source, e);
                        }
                    }
                    Err(e) => error!("Failed to receive datagram: {}", e),
                },

                Some(event) = reliability_rx.recv() => {
                    self.handle_reliability_event(event).await;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.deferred.lock().await.abort_all();
        self.reliability.cancel_all();
        self.emit_event(ServerEvent::Stopped {
            reason: "Shutdown signal".to_string(),
        });
        info!("Pending retransmissions cancelled, server stopped");

        Ok(())
    }

    /// Handle one inbound datagram
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Handled (or deliberately ignored)
    /// - `Err(Error::Codec)`: The datagram is malformed
    /// - `Err(_)`: The reply could not be sent
    pub async fn handle_datagram(&self, datagram: &[u8], source: SocketAddr) -> Result<()> {
        let message = self.serializer.deserialize(datagram, source)?;

        if message.is_empty_message() {
            return self.handle_empty(message, source).await;
        }
        if message.code.method().is_none() {
            debug!("Ignoring {} response from {}", message.code, source);
            return Ok(());
        }
        if !matches!(
            message.mtype,
            MessageType::Confirmable | MessageType::NonConfirmable
        ) {
            debug!("Ignoring request carried in {:?} from {}", message.mtype, source);
            return Ok(());
        }

        self.handle_request(Request::from_message(message)?).await
    }

    /// Drop the observer behind a confirmable message that was never acknowledged
    pub async fn handle_reliability_event(&self, event: ReliabilityEvent) {
        let ReliabilityEvent::Exhausted {
            resource,
            request,
            response,
        } = event;

        if let (Some(peer), Some(mid)) = (response.destination, response.message_id) {
            self.matcher.take_exchange(peer, mid);
        }
        self.drop_observer(&resource, &request, &response, RemovalReason::Unacknowledged)
            .await;
    }

    /// Notify the observers of the resource at `path` about a change made outside a request
    ///
    /// # Returns
    ///
    /// - `Ok(usize)`: Number of notifications sent
    /// - `Err(Error::NotFound)`: No resource at `path`
    pub async fn notify(&self, path: &str) -> Result<usize> {
        let found = self.tree.read().await.find(path);
        let resource = found.ok_or_else(|| Error::not_found(path))?;
        Ok(self.notify_resource(&resource).await)
    }

    async fn handle_empty(&self, message: Message, source: SocketAddr) -> Result<()> {
        let Some(mid) = message.message_id else {
            return Ok(());
        };

        match message.mtype {
            MessageType::Acknowledgement => {
                self.reliability.cancel(source, mid);
                if self.matcher.take_exchange(source, mid).is_some() {
                    debug!("ACK from {} for mid {}", source, mid);
                }
            }
            MessageType::Reset => {
                self.reliability.cancel(source, mid);
                if let Some(exchange) = self.matcher.take_exchange(source, mid) {
                    debug!("RST from {} for mid {}", source, mid);
                    self.drop_observer(
                        &exchange.resource,
                        &exchange.request,
                        &exchange.response,
                        RemovalReason::Reset,
                    )
                    .await;
                }
            }
            MessageType::Confirmable => {
                // ping
                let mut pong = Message::default();
                pong.mtype = MessageType::Reset;
                pong.message_id = Some(mid);
                let datagram = self.serializer.serialize(&pong)?;
                self.transport.write(&datagram, source).await?;
            }
            MessageType::NonConfirmable => {
                debug!("Ignoring empty NON from {}", source);
            }
        }

        Ok(())
    }

    async fn handle_request(&self, request: Request) -> Result<()> {
        let request = match self.blockwise.request(request.clone())? {
            BlockwiseRequest::Complete(request) => request,
            BlockwiseRequest::Continue(block) => {
                let mut response = Response::for_request(&request).with_code(Code::CONTINUE);
                response.set_block1(block);
                let root = self.root().await;
                return self.respond(&request, response, root).await;
            }
            BlockwiseRequest::Incomplete => {
                return self
                    .respond_code(&request, Code::REQUEST_ENTITY_INCOMPLETE)
                    .await;
            }
            BlockwiseRequest::TooLarge { limit } => {
                let mut response =
                    Response::for_request(&request).with_code(Code::REQUEST_ENTITY_TOO_LARGE);
                let limit = u32::try_from(limit).unwrap_or(u32::MAX);
                response.set_option(option_number::SIZE1, encode_uint(limit));
                let root = self.root().await;
                return self.respond(&request, response, root).await;
            }
        };

        let Some(method) = request.method() else {
            return Err(Error::bad_request(format!("{} is not a request code", request.code)));
        };
        let path = request.uri_path();
        debug!("{} /{} from {:?}", method, path, request.source);

        match method {
            Method::Get => self.handle_get(request, &path).await,
            Method::Put => self.handle_put(request, &path).await,
            Method::Post => self.handle_post(request, &path).await,
            Method::Delete => self.handle_delete(request, &path).await,
        }
    }

    async fn handle_get(&self, request: Request, path: &str) -> Result<()> {
        let found = self.tree.read().await.find(path);
        let Some(resource) = found else {
            return self.respond_code(&request, Code::NOT_FOUND).await;
        };
        if let Some(delay) = resource.behaviour().response_delay() {
            return self.handle_separate(request, resource, delay).await;
        }

        let mut response = Response::for_request(&request);
        match resource.behaviour().render_get(&request) {
            Ok(representation) => {
                response.code = Code::CONTENT;
                if let Some(format) = representation.content_format {
                    response.set_content_format(format);
                }
                response.payload = representation.payload;
            }
            Err(e) => return self.respond_error(&request, &e, resource).await,
        }

        match request.observe() {
            Some(0) if resource.is_observable() => {
                response = self.observe.add_observing(&resource, &request, response).await?;
                if let Some(peer) = request.source {
                    self.emit_event(ServerEvent::ObserverRegistered {
                        path: resource.path().to_string(),
                        peer,
                        token: request.token.clone(),
                    });
                }
            }
            Some(1) => {
                let subscription = Response::for_request(&request);
                self.drop_observer(&resource, &request, &subscription, RemovalReason::Deregistered)
                    .await;
            }
            _ => {}
        }

        self.respond(&request, response, resource).await
    }

    async fn handle_separate(
        &self,
        mut request: Request,
        resource: ResourceRef,
        delay: Duration,
    ) -> Result<()> {
        if request.observe() == Some(1) {
            let subscription = Response::for_request(&request);
            self.drop_observer(&resource, &request, &subscription, RemovalReason::Deregistered)
                .await;
        }

        if request.mtype == MessageType::Confirmable {
            let source = request
                .source
                .ok_or_else(|| Error::invalid_input("request has no source"))?;
            let mid = request
                .message_id
                .ok_or_else(|| Error::invalid_input("request has no message id"))?;
            let mut ack = Message::default();
            ack.mtype = MessageType::Acknowledgement;
            ack.message_id = Some(mid);
            let datagram = self.serializer.serialize(&ack)?;
            self.transport.write(&datagram, source).await?;
            request.acknowledged = true;
        }

        debug!(
            "Answering /{} in a separate response after {:?}",
            resource.path(),
            delay
        );
        let deferred = DeferredResponse {
            observe: self.observe.clone(),
            builder: self.builder.clone(),
            dispatcher: self.dispatcher.clone(),
            event_tx: self.event_tx.clone(),
        };

        let mut tasks = self.deferred.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let path = resource.path().to_string();
            if let Err(e) = deferred.respond(request, resource).await {
                warn!("Separate response for {} failed: {}", path, e);
            }
        });
        Ok(())
    }

    async fn handle_put(&self, request: Request, path: &str) -> Result<()> {
        let found = self.tree.read().await.find(path);
        let Some(resource) = found else {
            return self.respond_code(&request, Code::NOT_FOUND).await;
        };

        if let Err(e) = resource.behaviour().render_put(&request) {
            return self.respond_error(&request, &e, resource).await;
        }

        let response = Response::for_request(&request).with_code(Code::CHANGED);
        let result = self.respond(&request, response, resource.clone()).await;
        self.notify_resource(&resource).await;
        result
    }

    async fn handle_post(&self, request: Request, path: &str) -> Result<()> {
        let found = self.tree.read().await.find(path);
        let Some(resource) = found else {
            return self.create_resource(request, path).await;
        };

        let target = match resource.behaviour().render_post(&request) {
            Ok(PostOutcome::Updated) => resource,
            Ok(PostOutcome::Replaced(behaviour)) => {
                let replacement = ResourceHandle::with_observable(
                    resource.path(),
                    resource.is_observable(),
                    behaviour,
                );
                {
                    let mut tree = self.tree.write().await;
                    if let Some(node) = tree.find_node(resource.path()) {
                        self.observe.update_relations(node, &replacement).await;
                    }
                    tree.replace(resource.path(), replacement.clone())?;
                }
                info!(
                    "Resource {} replaced ({} -> {})",
                    resource.path(),
                    resource.id(),
                    replacement.id()
                );
                replacement
            }
            Err(e) => return self.respond_error(&request, &e, resource).await,
        };

        let response = Response::for_request(&request).with_code(Code::CHANGED);
        let result = self.respond(&request, response, target.clone()).await;
        self.notify_resource(&target).await;
        result
    }

    async fn create_resource(&self, request: Request, path: &str) -> Result<()> {
        let outcome = {
            let mut tree = self.tree.write().await;
            let (parent, rest) = tree.find_closest(path);
            let parent = Arc::clone(parent.value());
            match rest.as_slice() {
                [name] => parent
                    .behaviour()
                    .create_child(name, &request)
                    .and_then(|behaviour| tree.add(path, behaviour))
                    .map_err(|e| (e, parent)),
                _ => Err((Error::not_found(path), parent)),
            }
        };

        match outcome {
            Ok(resource) => {
                info!("Created resource {}", resource.path());
                let mut response = Response::for_request(&request).with_code(Code::CREATED);
                for segment in resource.path().split('/') {
                    response.add_option(option_number::LOCATION_PATH, segment.as_bytes());
                }
                self.respond(&request, response, resource).await
            }
            Err((e, parent)) => self.respond_error(&request, &e, parent).await,
        }
    }

    async fn handle_delete(&self, request: Request, path: &str) -> Result<()> {
        let found = self.tree.read().await.find(path);
        let Some(resource) = found else {
            return self.respond_code(&request, Code::NOT_FOUND).await;
        };

        if let Err(e) = resource.behaviour().render_delete(&request) {
            return self.respond_error(&request, &e, resource).await;
        }

        let removed = self.tree.write().await.remove(resource.path());
        let Some(subtree) = removed else {
            return self.respond_code(&request, Code::NOT_FOUND).await;
        };

        let commands = self.observe.remove_observers(&subtree).await;
        info!(
            "Deleted resource {} ({} observer(s) to notify)",
            resource.path(),
            commands.len()
        );
        for command in &commands {
            if let Some(peer) = command.destination() {
                self.emit_event(ServerEvent::ObserverRemoved {
                    path: command.resource().path().to_string(),
                    peer,
                    reason: RemovalReason::Deleted,
                });
            }
        }

        let response = Response::for_request(&request).with_code(Code::DELETED);
        let result = self.respond(&request, response, resource).await;
        self.dispatch(commands).await;
        result
    }

    async fn notify_resource(&self, resource: &ResourceRef) -> usize {
        let commands = self.observe.notify(resource).await;
        self.dispatch(commands).await
    }

    async fn dispatch(&self, commands: Vec<NotificationCommand>) -> usize {
        if commands.is_empty() {
            return 0;
        }
        let outcome = self.dispatcher.dispatch(&self.builder, commands).await;
        for failure in &outcome.failed {
            match failure.destination {
                Some(peer) => warn!(
                    "Failed to notify {} about {}: {}",
                    peer,
                    failure.resource.path(),
                    failure.error
                ),
                None => warn!(
                    "Failed to notify about {}: {}",
                    failure.resource.path(),
                    failure.error
                ),
            }
        }
        for notification in &outcome.sent {
            if let Some(peer) = notification.response.destination {
                self.emit_event(ServerEvent::NotificationSent {
                    path: notification.resource.path().to_string(),
                    peer,
                    code: notification.response.code,
                });
            }
        }
        outcome.sent.len()
    }

    async fn drop_observer(
        &self,
        resource: &ResourceRef,
        request: &Request,
        response: &Response,
        reason: RemovalReason,
    ) {
        // a POST may have swapped the object at this path since the message was sent
        let found = self.tree.read().await.find(resource.path());
        let current = found.unwrap_or_else(|| Arc::clone(resource));

        let mut removed = self.observe.remove_observer(&current, request, response).await;
        if matches!(removed, Ok(false)) && current.id() != resource.id() {
            removed = self.observe.remove_observer(resource, request, response).await;
        }

        match removed {
            Ok(true) => {
                if let Some(peer) = response.destination {
                    self.emit_event(ServerEvent::ObserverRemoved {
                        path: resource.path().to_string(),
                        peer,
                        reason,
                    });
                }
            }
            Ok(false) => debug!(
                "No observer of {} to drop ({})",
                resource.path(),
                reason
            ),
            Err(e) => warn!("Failed to drop observer of {}: {}", resource.path(), e),
        }
    }

    async fn respond(&self, request: &Request, response: Response, resource: ResourceRef) -> Result<()> {
        let (response, _) = self.builder.post_process(request, response, resource)?;
        let destination = response
            .destination
            .ok_or_else(|| Error::invalid_input("request has no source"))?;
        let datagram = self.serializer.serialize(&response)?;
        debug!("Responding {} to {}", response.code, destination);
        self.transport.write(&datagram, destination).await
    }

    async fn respond_code(&self, request: &Request, code: Code) -> Result<()> {
        let root = self.root().await;
        self.respond(request, Response::for_request(request).with_code(code), root)
            .await
    }

    async fn respond_error(&self, request: &Request, error: &Error, resource: ResourceRef) -> Result<()> {
        let code = error_code(error);
        if code == Code::INTERNAL_SERVER_ERROR {
            warn!("Request for {} failed: {}", resource.path(), error);
        } else {
            debug!("Request for {} refused with {}: {}", resource.path(), code, error);
        }
        self.respond(request, Response::for_request(request).with_code(code), resource)
            .await
    }

    async fn root(&self) -> ResourceRef {
        let tree = self.tree.read().await;
        Arc::clone(tree.root().value())
    }

    /// Emit a server event
    fn emit_event(&self, event: ServerEvent) {
        emit(&self.event_tx, event);
    }
}

/// Everything a separate response needs once the request handler has returned
struct DeferredResponse {
    observe: ObserveLayer,
    builder: NotificationBuilder,
    dispatcher: NotificationDispatcher,
    event_tx: mpsc::Sender<ServerEvent>,
}

impl DeferredResponse {
    async fn respond(self, request: Request, resource: ResourceRef) -> Result<()> {
        let mut response = Response::for_request(&request);
        match resource.behaviour().render_get(&request) {
            Ok(representation) => {
                response.code = Code::CONTENT;
                if let Some(format) = representation.content_format {
                    response.set_content_format(format);
                }
                response.payload = representation.payload;
            }
            Err(e) => response.code = error_code(&e),
        }

        if response.code == Code::CONTENT
            && request.observe() == Some(0)
            && resource.is_observable()
        {
            response = self.observe.add_observing(&resource, &request, response).await?;
            if let Some(peer) = request.source {
                emit(
                    &self.event_tx,
                    ServerEvent::ObserverRegistered {
                        path: resource.path().to_string(),
                        peer,
                        token: request.token.clone(),
                    },
                );
            }
        }

        let (response, resource) = self.builder.post_process(&request, response, resource)?;
        self.dispatcher
            .send_notification(&Notification {
                resource,
                request,
                response,
            })
            .await
    }
}

fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if event_tx.try_send(event).is_err() {
        warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
    }
}

/// Response code for a failed render
fn error_code(error: &Error) -> Code {
    match error {
        Error::MethodNotAllowed(_) => Code::METHOD_NOT_ALLOWED,
        Error::NotFound(_) => Code::NOT_FOUND,
        Error::BadRequest(_) | Error::InvalidInput(_) => Code::BAD_REQUEST,
        _ => Code::INTERNAL_SERVER_ERROR,
    }
}
