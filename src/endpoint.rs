use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::EndpointConfig;
use crate::dedup::{Disposition, DuplicateDetector};
use crate::delayed::DelayedTransactionManager;
use crate::error::CoapError;
use crate::messages::{Code, Message, MessageType, MidSupplier, Status};
use crate::observe::{ObservableResource, ObserveOptions};
use crate::resource::{error_response, Exchange, Handler, Router};
use crate::transaction::{Completion, Priority, Transaction, TransactionId};
use crate::transactions::{Admission, TransactionManager};
use crate::transport::{Inbound, Transport, TransportContext};

/// Client side of observe: asked about known tokens during inbound
/// classification, handed matching notifications.
pub trait ObservationHandler: Send + Sync {
    fn has_observation(&self, token: &[u8]) -> bool;
    fn notify(&self, message: Message);
    fn terminated(&self, token: &[u8], reason: CoapError);
}

pub(crate) enum Command {
    /// Confirmable (or token-correlated non-confirmable) send with a
    /// completion callback. The driver assigns a fresh message id.
    SendReliable {
        message: Message,
        context: TransportContext,
        priority: Priority,
        force: bool,
        done: Completion,
    },
    /// Fire-and-forget send; fresh message id, no completion.
    SendBestEffort {
        message: Message,
        context: TransportContext,
    },
    Register {
        path: String,
        handler: Arc<dyn Handler>,
    },
    Unregister {
        path: String,
    },
    SetObservationHandler {
        handler: Arc<dyn ObservationHandler>,
    },
}

/// Cheap clonable path into the driver task, used by observable resources
/// and the public API.
#[derive(Clone)]
pub(crate) struct EndpointHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EndpointHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    pub(crate) fn send_reliable(
        &self,
        message: Message,
        context: TransportContext,
        priority: Priority,
        force: bool,
        done: Completion,
    ) {
        let command = Command::SendReliable {
            message,
            context,
            priority,
            force,
            done,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            if let Command::SendReliable { done, .. } = command {
                done(Err(CoapError::Shutdown));
            }
        }
    }

    pub(crate) fn send_best_effort(&self, message: Message, context: TransportContext) {
        let _ = self.commands.send(Command::SendBestEffort { message, context });
    }

    fn command(&self, command: Command) {
        let _ = self.commands.send(command);
    }
}

/// A CoAP endpoint: server dispatch, client correlation, retransmission and
/// observation plumbing over one transport. All mutable state lives on a
/// single driver task fed by the transport, the command channel and a
/// periodic tick.
pub struct Endpoint {
    handle: EndpointHandle,
    cancel: CancellationToken,
    config: EndpointConfig,
    local: SocketAddr,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Start the transport and the driver task. Must run inside a tokio
    /// runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: EndpointConfig,
    ) -> Result<Arc<Self>, CoapError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        transport.start(inbound_tx)?;
        let local = transport.local_address();
        let cancel = CancellationToken::new();
        let driver = Driver {
            config: config.clone(),
            transport,
            mids: MidSupplier::new(),
            dedup: DuplicateDetector::new(config.duplicate_cache_size, config.duplicate_ttl),
            transactions: TransactionManager::new(config.queue_limit),
            delayed: DelayedTransactionManager::new(config.delayed_timeout),
            router: Router::new(),
            observation_handler: None,
        };
        let task = tokio::spawn(driver.run(command_rx, inbound_rx, cancel.child_token()));
        log::debug!("endpoint started on {}", local);
        Ok(Arc::new(Self {
            handle: EndpointHandle::new(command_tx),
            cancel,
            config,
            local,
            driver: Mutex::new(Some(task)),
        }))
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    /// Serve `path` with `handler`. A trailing `*` registers a prefix match.
    pub fn register(&self, path: &str, handler: Arc<dyn Handler>) {
        self.handle.command(Command::Register {
            path: path.to_owned(),
            handler,
        });
    }

    pub fn unregister(&self, path: &str) {
        self.handle.command(Command::Unregister {
            path: path.to_owned(),
        });
    }

    /// Serve `path` as an observable resource wrapping `handler`. The
    /// returned handle drives notifications.
    pub fn observable(
        &self,
        path: &str,
        handler: Arc<dyn Handler>,
        opts: ObserveOptions,
    ) -> ObservableResource {
        let resource = ObservableResource::new(
            handler,
            self.handle.clone(),
            opts,
            self.config.force_con_every,
            self.config.notification_block_size,
        );
        self.register(path, Arc::new(resource.clone()));
        resource
    }

    pub fn set_observation_handler(&self, handler: Arc<dyn ObservationHandler>) {
        self.handle.command(Command::SetObservationHandler { handler });
    }

    /// Send a request and wait for the matched response: piggybacked ACK,
    /// separate response after an empty ACK, or the token-correlated reply
    /// to a non-confirmable request.
    pub async fn request(&self, message: Message) -> Result<Message, CoapError> {
        self.request_with(message, Priority::Normal, false).await
    }

    /// `request` with an explicit queue priority; `force_admit` bypasses the
    /// per-remote queue cap (block-wise follow-ups rely on this).
    pub async fn request_with(
        &self,
        message: Message,
        priority: Priority,
        force_admit: bool,
    ) -> Result<Message, CoapError> {
        let (tx, rx) = oneshot::channel();
        self.handle.send_reliable(
            message,
            TransportContext::default(),
            priority,
            force_admit,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let response = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(CoapError::Shutdown),
        };
        if response.mtype == MessageType::Reset {
            return Err(CoapError::Reset);
        }
        Ok(response)
    }

    /// Fire-and-forget send, no correlation.
    pub fn send(&self, message: Message) -> Result<(), CoapError> {
        self.handle.send_best_effort(message, TransportContext::default());
        Ok(())
    }

    /// CoAP ping: empty confirmable message, pong is the peer's reset.
    pub async fn ping(&self, remote: SocketAddr) -> Result<(), CoapError> {
        let (tx, rx) = oneshot::channel();
        self.handle.send_reliable(
            Message::ping(remote),
            TransportContext::default(),
            Priority::Normal,
            false,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let reply = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(CoapError::Shutdown),
        };
        match reply.mtype {
            MessageType::Reset => Ok(()),
            other => Err(CoapError::Protocol(format!(
                "unexpected ping reply of type {:?}",
                other
            ))),
        }
    }

    /// Fail every pending callback with `Shutdown`, stop the transport and
    /// wait for the driver to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.driver.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    config: EndpointConfig,
    transport: Arc<dyn Transport>,
    mids: MidSupplier,
    dedup: DuplicateDetector,
    transactions: TransactionManager,
    delayed: DelayedTransactionManager,
    router: Router,
    observation_handler: Option<Arc<dyn ObservationHandler>>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(self.config.tick_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command),
                Some(received) = inbound.recv() => self.handle_inbound(received.message, received.context),
                _ = tick.tick() => self.handle_tick(Instant::now()),
            }
        }
        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { path, handler } => self.router.register(&path, handler),
            Command::Unregister { path } => self.router.unregister(&path),
            Command::SetObservationHandler { handler } => {
                self.observation_handler = Some(handler);
            }
            Command::SendBestEffort { mut message, context } => {
                message.mid = self.mids.next();
                if let Err(e) = self.transport.send(message, context) {
                    log::debug!("best-effort send failed: {}", e);
                }
            }
            Command::SendReliable {
                mut message,
                context,
                priority,
                force,
                done,
            } => {
                message.mid = self.mids.next();
                if message.mtype == MessageType::Confirmable {
                    let trans =
                        Transaction::new(message, context, priority, &self.config.transmission, done);
                    match self.transactions.enqueue(trans, force) {
                        Ok(Admission::Transmit(id)) => self.transmit(id),
                        Ok(Admission::Queued) => {}
                        Err(trans) => trans.complete(Err(CoapError::TooManyRequestsForEndpoint)),
                    }
                } else {
                    // Non-confirmable request: correlate the reply by token.
                    if message.token.is_empty() {
                        done(Err(CoapError::Protocol(
                            "non-confirmable request needs a token".to_owned(),
                        )));
                        return;
                    }
                    if let Err(e) = self.transport.send(message.clone(), context.clone()) {
                        done(Err(CoapError::Transport(e.to_string())));
                        return;
                    }
                    let trans =
                        Transaction::new(message, context, priority, &self.config.transmission, done);
                    self.delayed.insert(trans, Instant::now());
                }
            }
        }
    }

    /// Transmit the in-flight transaction `id`; on transport failure fail it
    /// and move on to the next queued one.
    fn transmit(&mut self, id: TransactionId) {
        let mut current = Some(id);
        while let Some(id) = current {
            let Some((message, context)) = self.transactions.mark_sent(id, Instant::now()) else {
                return;
            };
            log::trace!(
                "send con mid:{:#06x} to {} token:{}",
                message.mid,
                message.remote,
                hex::encode(&message.token)
            );
            match self.transport.send(message, context) {
                Ok(()) => return,
                Err(e) => {
                    log::debug!("send of mid:{:#06x} failed: {}", id.mid, e);
                    if let Some(trans) = self.transactions.remove_and_lock(id) {
                        trans.complete(Err(CoapError::Transport(e.to_string())));
                    }
                    current = self.transactions.unlock_or_remove_and_next(id);
                }
            }
        }
    }

    fn promote_next(&mut self, id: TransactionId) {
        if let Some(next) = self.transactions.unlock_or_remove_and_next(id) {
            self.transmit(next);
        }
    }

    fn handle_inbound(&mut self, message: Message, context: TransportContext) {
        match message.code {
            Code::Empty => self.handle_empty(message, context),
            Code::Request(_) => self.handle_request(message, context),
            Code::Response(_) => self.handle_response(message, context),
        }
    }

    fn handle_empty(&mut self, message: Message, context: TransportContext) {
        let id = TransactionId {
            remote: message.remote,
            mid: message.mid,
        };
        match message.mtype {
            // CoAP ping; pong with a reset, replayable like any request.
            MessageType::Confirmable => match self.dedup.observe(message.remote, message.mid, Instant::now()) {
                Disposition::Replay(cached) => self.send_logged(cached, context),
                Disposition::Suppress => {}
                Disposition::Process => {
                    let pong = message.reset();
                    self.dedup.record_response(message.remote, message.mid, pong.clone());
                    log::trace!("ping from {}, sending reset", message.remote);
                    self.send_logged(pong, context);
                }
            },
            MessageType::Acknowledgement => {
                if let Some(trans) = self.transactions.remove_and_lock(id) {
                    if trans.expects_separate_response() {
                        // The real response comes later as its own message.
                        self.delayed.insert(trans, Instant::now());
                    } else {
                        trans.complete(Ok(message));
                    }
                    self.promote_next(id);
                } else {
                    log::trace!("unmatched empty ack mid:{:#06x}, dropping", message.mid);
                }
            }
            MessageType::Reset => {
                if let Some(trans) = self.transactions.remove_and_lock(id) {
                    log::debug!("mid:{:#06x} rejected by {}", message.mid, message.remote);
                    trans.complete(Ok(message));
                    self.promote_next(id);
                } else {
                    log::trace!("unmatched reset mid:{:#06x}, dropping", message.mid);
                }
            }
            // An empty NON is not a ping; reject it.
            MessageType::NonConfirmable => self.send_logged(message.reset(), context),
        }
    }

    fn handle_request(&mut self, message: Message, context: TransportContext) {
        match self.dedup.observe(message.remote, message.mid, Instant::now()) {
            Disposition::Replay(cached) => {
                log::debug!(
                    "duplicate request mid:{:#06x} from {}, replaying response",
                    message.mid,
                    message.remote
                );
                self.send_logged(cached, context);
                return;
            }
            Disposition::Suppress => {
                log::debug!(
                    "duplicate request mid:{:#06x} from {} while serving, dropping",
                    message.mid,
                    message.remote
                );
                return;
            }
            Disposition::Process => {}
        }
        let mut response = self.serve(&message, context.clone());
        if response.mtype != MessageType::Acknowledgement {
            response.mid = self.mids.next();
        }
        self.dedup
            .record_response(message.remote, message.mid, response.clone());
        self.send_logged(response, context);
    }

    fn serve(&mut self, request: &Message, context: TransportContext) -> Message {
        if self.config.critical_option_check {
            if let Some(number) = request.options.unknown_critical() {
                log::debug!(
                    "request on {} carries unknown critical option {}",
                    request.options.uri_path,
                    number
                );
                return request.response(Status::BadOption);
            }
        }
        let Some(handler) = self.router.find(&request.options.uri_path) else {
            return request.response(Status::NotFound);
        };
        let mut exchange = Exchange::new(request.clone(), context);
        match handler.handle(&mut exchange) {
            Ok(()) => exchange
                .take_response()
                .unwrap_or_else(|| request.response(Status::InternalServerError)),
            Err(e) => {
                log::debug!("handler for {} failed: {}", request.options.uri_path, e);
                error_response(request, &e)
            }
        }
    }

    fn handle_response(&mut self, message: Message, context: TransportContext) {
        match message.mtype {
            MessageType::Acknowledgement => {
                // Piggybacked response.
                let id = TransactionId {
                    remote: message.remote,
                    mid: message.mid,
                };
                if let Some(trans) = self.transactions.remove_and_lock(id) {
                    trans.complete(Ok(message));
                    self.promote_next(id);
                } else {
                    self.unmatched(message, context);
                }
            }
            MessageType::Confirmable | MessageType::NonConfirmable => {
                // Separate response to a still in-flight request (the empty
                // ACK may have been lost).
                if let Some(trans) = self.transactions.remove_for_separate_response(&message) {
                    let id = trans.id();
                    if message.is_con() {
                        self.send_logged(message.ack(), context);
                    }
                    trans.complete(Ok(message));
                    self.promote_next(id);
                    return;
                }
                // Separate response to a parked transaction.
                if let Some(trans) = self.delayed.remove_match(&message) {
                    if message.is_con() {
                        self.send_logged(message.ack(), context);
                    }
                    trans.complete(Ok(message));
                    return;
                }
                // Observation notification.
                if let Some(handler) = self.observation_handler.clone() {
                    if handler.has_observation(&message.token) {
                        self.deliver_notification(handler, message, context);
                        return;
                    }
                }
                self.unmatched(message, context);
            }
            MessageType::Reset => {
                // A reset still completes the exchange it matches, by
                // message id or, for a separate response, by token.
                let id = TransactionId {
                    remote: message.remote,
                    mid: message.mid,
                };
                if let Some(trans) = self.transactions.remove_and_lock(id) {
                    log::debug!("mid:{:#06x} rejected by {}", message.mid, message.remote);
                    trans.complete(Ok(message));
                    self.promote_next(id);
                    return;
                }
                if let Some(trans) = self.transactions.remove_for_separate_response(&message) {
                    let id = trans.id();
                    trans.complete(Ok(message));
                    self.promote_next(id);
                    return;
                }
                if let Some(trans) = self.delayed.remove_match(&message) {
                    trans.complete(Ok(message));
                    return;
                }
                if let Some(handler) = self.observation_handler.clone() {
                    if !message.token.is_empty() && handler.has_observation(&message.token) {
                        handler.terminated(&message.token, CoapError::ObservationTerminated);
                        return;
                    }
                }
                self.unmatched(message, context);
            }
        }
    }

    fn deliver_notification(
        &mut self,
        handler: Arc<dyn ObservationHandler>,
        message: Message,
        context: TransportContext,
    ) {
        if message.is_con() {
            self.send_logged(message.ack(), context);
        }
        let live = message.options.observe.is_some()
            && matches!(
                message.code,
                Code::Response(Status::Content) | Code::Response(Status::Valid)
            );
        if live {
            handler.notify(message);
        } else {
            log::debug!(
                "observation for token {} ended by {}",
                hex::encode(&message.token),
                message.remote
            );
            handler.terminated(&message.token, CoapError::ObservationTerminated);
        }
    }

    fn unmatched(&mut self, message: Message, context: TransportContext) {
        match message.mtype {
            MessageType::Acknowledgement | MessageType::Reset => {
                log::trace!("unmatched message mid:{:#06x}, dropping", message.mid);
            }
            _ => {
                log::trace!("unmatched message mid:{:#06x}, sending reset", message.mid);
                self.send_logged(message.reset(), context);
            }
        }
    }

    fn handle_tick(&mut self, now: Instant) {
        for id in self.transactions.timed_out(now) {
            if self.transactions.is_exhausted(id) {
                log::debug!(
                    "mid:{:#06x} to {} exhausted its retransmissions",
                    id.mid,
                    id.remote
                );
                if let Some(trans) = self.transactions.remove_and_lock(id) {
                    trans.complete(Err(CoapError::Timeout));
                }
                self.promote_next(id);
            } else if let Some((message, context)) = self.transactions.retransmit(id) {
                if let Err(e) = self.transport.send(message, context) {
                    log::debug!("retransmit of mid:{:#06x} failed: {}", id.mid, e);
                    if let Some(trans) = self.transactions.remove_and_lock(id) {
                        trans.complete(Err(CoapError::Transport(e.to_string())));
                    }
                    self.promote_next(id);
                }
            }
        }
        for trans in self.delayed.expired(now) {
            log::debug!(
                "separate response window for token {} elapsed",
                hex::encode(&trans.message.token)
            );
            trans.complete(Err(CoapError::Timeout));
        }
        self.dedup.sweep(now);
    }

    fn send_logged(&self, message: Message, context: TransportContext) {
        if let Err(e) = self.transport.send(message, context) {
            log::debug!("send failed: {}", e);
        }
    }

    fn shutdown(&mut self) {
        let pending = self.transactions.total() + self.delayed.len();
        if pending > 0 {
            log::debug!("endpoint stopping with {} pending transactions", pending);
        }
        for trans in self.transactions.drain() {
            trans.complete(Err(CoapError::Shutdown));
        }
        for trans in self.delayed.drain() {
            trans.complete(Err(CoapError::Shutdown));
        }
        self.transport.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Duration;

    use super::*;
    use crate::config::TransmissionParams;
    use crate::messages::Method;
    use crate::observe::Notification;
    use crate::transport::{LoopbackNetwork, LoopbackTransport};

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:5683", n).parse().unwrap()
    }

    fn test_config() -> EndpointConfig {
        EndpointConfig {
            transmission: TransmissionParams {
                ack_random_factor: 1.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Scripted raw peer on the loopback network.
    struct Peer {
        transport: Arc<LoopbackTransport>,
        rx: mpsc::UnboundedReceiver<Inbound>,
    }

    impl Peer {
        fn attach(network: &Arc<LoopbackNetwork>, addr: SocketAddr) -> Self {
            let transport = network.endpoint(addr);
            let (tx, rx) = mpsc::unbounded_channel();
            transport.start(tx).unwrap();
            Self { transport, rx }
        }

        async fn recv(&mut self) -> Message {
            self.rx.recv().await.unwrap().message
        }

        fn send(&self, message: Message) {
            self.transport.send(message, TransportContext::default()).unwrap();
        }
    }

    #[tokio::test]
    async fn piggybacked_response_completes_request() {
        let network = LoopbackNetwork::new();
        let client = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let mut peer = Peer::attach(&network, addr(2));

        let request = Message::request(addr(2), Method::Get, "/temp").with_token(vec![0x01]);
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.request(request).await }
        });

        let seen = peer.recv().await;
        assert_eq!(seen.mtype, MessageType::Confirmable);
        assert_eq!(seen.options.uri_path, "/temp");
        let mut response = seen.response(Status::Content);
        response.payload = b"21C".to_vec();
        peer.send(response);

        let got = pending.await.unwrap().unwrap();
        assert_eq!(got.payload, b"21C");
        assert_eq!(got.code, Code::Response(Status::Content));
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ack_then_separate_response() {
        let network = LoopbackNetwork::new();
        let client = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let mut peer = Peer::attach(&network, addr(2));

        let request = Message::request(addr(2), Method::Get, "/slow").with_token(vec![0x02]);
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.request(request).await }
        });

        let seen = peer.recv().await;
        peer.send(seen.ack());
        tokio::time::sleep(Duration::from_secs(3)).await;
        // No retransmission happened while parked.
        assert!(peer.rx.try_recv().is_err());

        let mut response = Message {
            mtype: MessageType::Confirmable,
            code: Code::Response(Status::Content),
            mid: 0x2000,
            token: vec![0x02],
            options: Default::default(),
            payload: b"ok".to_vec(),
            remote: addr(1),
        };
        response.options.max_age = Some(60);
        peer.send(response);

        // The endpoint acknowledges the separate confirmable response.
        let ack = peer.recv().await;
        assert_eq!(ack.mtype, MessageType::Acknowledgement);
        assert_eq!(ack.mid, 0x2000);
        assert!(ack.code.is_empty());

        let got = pending.await.unwrap().unwrap();
        assert_eq!(got.payload, b"ok");
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retransmits_then_times_out() {
        let network = LoopbackNetwork::new();
        let client = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let mut peer = Peer::attach(&network, addr(2));

        let started = Instant::now();
        let request = Message::request(addr(2), Method::Get, "/void").with_token(vec![0x03]);
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.request(request).await }
        });

        let mut offsets = Vec::new();
        for _ in 0..5 {
            peer.recv().await;
            offsets.push(started.elapsed().as_secs());
        }
        assert_eq!(offsets, vec![0, 2, 4, 8, 16]);

        let result = pending.await.unwrap();
        assert_eq!(result, Err(CoapError::Timeout));
        let elapsed = started.elapsed().as_secs();
        assert!((31..=33).contains(&elapsed), "failed at t={}", elapsed);
        client.stop().await;
    }

    #[tokio::test]
    async fn duplicate_request_served_once_then_replayed() {
        let network = LoopbackNetwork::new();
        let server = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let invocations = Arc::new(AtomicUsize::new(0));
        let seen = invocations.clone();
        server.register(
            "/x",
            Arc::new(move |exchange: &mut Exchange| {
                seen.fetch_add(1, Ordering::SeqCst);
                exchange.respond(Status::Changed, "done");
                Ok(())
            }),
        );
        let mut peer = Peer::attach(&network, addr(2));

        let mut request = Message::request(addr(1), Method::Put, "/x").with_token(vec![0x04]);
        request.mid = 0x300;
        peer.send(request.clone());
        let first = peer.recv().await;
        assert_eq!(first.code, Code::Response(Status::Changed));
        assert_eq!(first.mid, 0x300);

        peer.send(request);
        let replayed = peer.recv().await;
        assert_eq!(replayed, first);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn observe_register_notify_and_reset() {
        let network = LoopbackNetwork::new();
        let server = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let resource = server.observable(
            "/obs",
            Arc::new(|exchange: &mut Exchange| {
                exchange.respond(Status::Content, "v0");
                Ok(())
            }),
            ObserveOptions {
                con_notifications: Some(true),
                ..Default::default()
            },
        );
        let mut peer = Peer::attach(&network, addr(2));

        let mut register = Message::request(addr(1), Method::Get, "/obs")
            .with_token(vec![0xaa])
            .with_observe(0);
        register.mid = 0x10;
        peer.send(register);
        let reply = peer.recv().await;
        assert_eq!(reply.options.observe, Some(0));
        assert_eq!(reply.token, vec![0xaa]);
        assert_eq!(resource.relation_count(), 1);

        resource.notify_change(Notification::new("v1"));
        let first = peer.recv().await;
        assert_eq!(first.mtype, MessageType::Confirmable);
        assert_eq!(first.options.observe, Some(1));
        assert_eq!(first.payload, b"v1");
        peer.send(first.ack());

        // Let the driver process the ACK and clear the delivering flag.
        tokio::time::sleep(Duration::from_millis(50)).await;
        resource.notify_change(Notification::new("v2"));
        let second = peer.recv().await;
        assert_eq!(second.options.observe, Some(2));
        peer.send(second.reset());

        // Reset removes the relation; poll until the driver caught up.
        for _ in 0..50 {
            if resource.relation_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(resource.relation_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn queue_cap_rejects_without_force() {
        let network = LoopbackNetwork::new();
        let config = EndpointConfig {
            queue_limit: Some(1),
            ..test_config()
        };
        let client = Endpoint::new(network.endpoint(addr(1)), config).unwrap();
        let _peer = Peer::attach(&network, addr(2));

        // First goes in flight, second queues, third hits the cap.
        let first = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .request(Message::request(addr(2), Method::Get, "/a").with_token(vec![1]))
                    .await
            }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .request(Message::request(addr(2), Method::Get, "/b").with_token(vec![2]))
                    .await
            }
        });
        tokio::task::yield_now().await;

        let third = client
            .request(Message::request(addr(2), Method::Get, "/c").with_token(vec![3]))
            .await;
        assert_eq!(third, Err(CoapError::TooManyRequestsForEndpoint));

        let forced = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .request_with(
                        Message::request(addr(2), Method::Get, "/d").with_token(vec![4]),
                        Priority::Normal,
                        true,
                    )
                    .await
            }
        });
        tokio::task::yield_now().await;

        client.stop().await;
        assert_eq!(first.await.unwrap(), Err(CoapError::Shutdown));
        assert_eq!(second.await.unwrap(), Err(CoapError::Shutdown));
        assert_eq!(forced.await.unwrap(), Err(CoapError::Shutdown));
    }

    #[tokio::test]
    async fn ping_between_endpoints() {
        let network = LoopbackNetwork::new();
        let server = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let client = Endpoint::new(network.endpoint(addr(2)), test_config()).unwrap();
        client.ping(addr(1)).await.unwrap();
        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn request_between_endpoints_with_error_mapping() {
        let network = LoopbackNetwork::new();
        let server = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        server.register(
            "/locked",
            Arc::new(|_: &mut Exchange| {
                Err(CoapError::code_with_payload(Status::Forbidden, "keep out"))
            }),
        );
        server.register(
            "/broken",
            Arc::new(|_: &mut Exchange| Err(CoapError::Protocol("boom".to_owned()))),
        );
        let client = Endpoint::new(network.endpoint(addr(2)), test_config()).unwrap();

        let forbidden = client
            .request(Message::request(addr(1), Method::Get, "/locked").with_token(vec![1]))
            .await
            .unwrap();
        assert_eq!(forbidden.code, Code::Response(Status::Forbidden));
        assert_eq!(forbidden.payload, b"keep out");

        let broken = client
            .request(Message::request(addr(1), Method::Get, "/broken").with_token(vec![2]))
            .await
            .unwrap();
        assert_eq!(broken.code, Code::Response(Status::InternalServerError));

        let missing = client
            .request(Message::request(addr(1), Method::Get, "/nope").with_token(vec![3]))
            .await
            .unwrap();
        assert_eq!(missing.code, Code::Response(Status::NotFound));
        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn unknown_critical_option_answers_bad_option() {
        let network = LoopbackNetwork::new();
        let server = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        server.register(
            "/x",
            Arc::new(|exchange: &mut Exchange| {
                exchange.respond(Status::Content, "x");
                Ok(())
            }),
        );
        let mut peer = Peer::attach(&network, addr(2));
        let mut request = Message::request(addr(1), Method::Get, "/x").with_token(vec![1]);
        request.mid = 0x55;
        request.options.unrecognized.push((13, vec![0xff]));
        peer.send(request);
        let reply = peer.recv().await;
        assert_eq!(reply.code, Code::Response(Status::BadOption));
        server.stop().await;
    }

    #[tokio::test]
    async fn non_request_correlated_by_token() {
        let network = LoopbackNetwork::new();
        let client = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let mut peer = Peer::attach(&network, addr(2));

        let request = Message::request(addr(2), Method::Get, "/t")
            .with_token(vec![0x09])
            .non_confirmable();
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.request(request).await }
        });

        let seen = peer.recv().await;
        assert_eq!(seen.mtype, MessageType::NonConfirmable);
        let mut response = seen.response(Status::Content);
        response.payload = b"non".to_vec();
        peer.send(response);

        assert_eq!(pending.await.unwrap().unwrap().payload, b"non");
        client.stop().await;
    }

    #[tokio::test]
    async fn unmatched_con_response_is_reset() {
        let network = LoopbackNetwork::new();
        let endpoint = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let mut peer = Peer::attach(&network, addr(2));

        let stray = Message {
            mtype: MessageType::Confirmable,
            code: Code::Response(Status::Content),
            mid: 0x77,
            token: vec![0x66],
            options: Default::default(),
            payload: Vec::new(),
            remote: addr(1),
        };
        peer.send(stray);
        let reply = peer.recv().await;
        assert_eq!(reply.mtype, MessageType::Reset);
        assert_eq!(reply.mid, 0x77);
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn response_coded_reset_fails_request() {
        let network = LoopbackNetwork::new();
        let client = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let mut peer = Peer::attach(&network, addr(2));

        let request = Message::request(addr(2), Method::Get, "/t").with_token(vec![0x05]);
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.request(request).await }
        });

        // Reject with a reset that carries a response code and the request's
        // message id; the transaction must fail right away, not by timeout.
        let seen = peer.recv().await;
        let mut rejection = seen.response(Status::ServiceUnavailable);
        rejection.mtype = MessageType::Reset;
        peer.send(rejection);

        assert_eq!(pending.await.unwrap(), Err(CoapError::Reset));
        client.stop().await;
    }

    #[tokio::test]
    async fn client_side_observation_notifications() {
        struct Watcher {
            tokens: Mutex<HashSet<Vec<u8>>>,
            notified: AtomicUsize,
            ended: AtomicUsize,
        }

        impl ObservationHandler for Watcher {
            fn has_observation(&self, token: &[u8]) -> bool {
                self.tokens.lock().unwrap().contains(token)
            }

            fn notify(&self, _message: Message) {
                self.notified.fetch_add(1, Ordering::SeqCst);
            }

            fn terminated(&self, token: &[u8], _reason: CoapError) {
                self.tokens.lock().unwrap().remove(token);
                self.ended.fetch_add(1, Ordering::SeqCst);
            }
        }

        let network = LoopbackNetwork::new();
        let client = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let watcher = Arc::new(Watcher {
            tokens: Mutex::new(HashSet::from([vec![0xaa]])),
            notified: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
        });
        client.set_observation_handler(watcher.clone());
        let mut peer = Peer::attach(&network, addr(2));

        let notification = Message {
            mtype: MessageType::Confirmable,
            code: Code::Response(Status::Content),
            mid: 0x40,
            token: vec![0xaa],
            options: Default::default(),
            payload: b"v1".to_vec(),
            remote: addr(1),
        };
        let mut live = notification.clone();
        live.options.observe = Some(5);
        peer.send(live);
        // Confirmable notification gets acknowledged.
        let ack = peer.recv().await;
        assert_eq!(ack.mtype, MessageType::Acknowledgement);
        assert_eq!(ack.mid, 0x40);

        // Without an observe option the observation terminates.
        let mut dead = notification.clone();
        dead.mid = 0x41;
        peer.send(dead);
        let ack = peer.recv().await;
        assert_eq!(ack.mid, 0x41);

        for _ in 0..50 {
            if watcher.ended.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(watcher.notified.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.ended.load(Ordering::SeqCst), 1);
        client.stop().await;
    }

    #[tokio::test]
    async fn stop_fails_pending_requests() {
        let network = LoopbackNetwork::new();
        let client = Endpoint::new(network.endpoint(addr(1)), test_config()).unwrap();
        let _peer = Peer::attach(&network, addr(2));

        let pending = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .request(Message::request(addr(2), Method::Get, "/t").with_token(vec![1]))
                    .await
            }
        });
        tokio::task::yield_now().await;
        client.stop().await;
        assert_eq!(pending.await.unwrap(), Err(CoapError::Shutdown));
    }
}
