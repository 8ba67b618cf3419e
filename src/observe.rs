use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use crate::endpoint::EndpointHandle;
use crate::error::CoapError;
use crate::messages::{BlockOption, Code, Message, MessageType, Method, Options, Status};
use crate::resource::{Exchange, Handler};
use crate::transaction::Priority;
use crate::transport::TransportContext;

const OBSERVE_SEQ_MASK: u32 = 0x00ff_ffff;

/// Receives the per-remote outcome of notification deliveries.
pub trait DeliveryListener: Send + Sync {
    fn delivered(&self, remote: SocketAddr);
    fn failed(&self, remote: SocketAddr);
}

/// Representation metadata for one notification fan-out.
#[derive(Debug, Clone, Default)]
pub struct Notification {
    pub payload: Vec<u8>,
    pub etag: Option<Vec<u8>>,
    pub max_age: Option<u32>,
    pub content_format: Option<u16>,
}

impl Notification {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObserveOptions {
    /// When set, overrides every relation's CON/NON preference.
    pub con_notifications: Option<bool>,
    /// Remove a relation when its remote sends a plain GET (no observe, no
    /// block options).
    pub auto_remove: bool,
}

impl Default for ObserveOptions {
    fn default() -> Self {
        Self {
            con_notifications: None,
            auto_remove: true,
        }
    }
}

/// One subscriber of an observable resource.
pub(crate) struct ObservationRelation {
    pub token: Vec<u8>,
    pub remote: SocketAddr,
    pub context: TransportContext,
    pub seq: u32,
    pub confirmable: bool,
    /// A confirmable notification is outstanding.
    pub delivering: bool,
    pub auto_removable: bool,
}

impl ObservationRelation {
    fn next_seq(&mut self) -> u32 {
        self.seq = (self.seq + 1) & OBSERVE_SEQ_MASK;
        self.seq
    }
}

fn wants_con(preference: bool, global: Option<bool>, seq: u32, force_every: u32) -> bool {
    global.unwrap_or(preference) || (force_every > 0 && seq % force_every == 0)
}

struct State {
    relations: Mutex<HashMap<SocketAddr, ObservationRelation>>,
    handle: EndpointHandle,
    inner: Arc<dyn Handler>,
    con_override: Mutex<Option<bool>>,
    force_con_every: u32,
    auto_remove: bool,
    block_size: Option<usize>,
    listener: Mutex<Option<Arc<dyn DeliveryListener>>>,
}

impl State {
    fn remove_relation(&self, remote: SocketAddr) -> bool {
        self.relations.lock().unwrap().remove(&remote).is_some()
    }

    fn listener(&self) -> Option<Arc<dyn DeliveryListener>> {
        self.listener.lock().unwrap().clone()
    }
}

enum Dispatch {
    Reliable(Message, TransportContext),
    BestEffort(Message, TransportContext),
    Busy(SocketAddr),
}

/// A resource whose representation can be observed (RFC 7641 server side).
/// Owns its relations map exclusively; the endpoint reaches relations only
/// through notification transactions this resource creates.
#[derive(Clone)]
pub struct ObservableResource {
    state: Arc<State>,
}

impl ObservableResource {
    pub(crate) fn new(
        inner: Arc<dyn Handler>,
        handle: EndpointHandle,
        opts: ObserveOptions,
        force_con_every: u32,
        block_size: Option<usize>,
    ) -> Self {
        Self {
            state: Arc::new(State {
                relations: Mutex::new(HashMap::new()),
                handle,
                inner,
                con_override: Mutex::new(opts.con_notifications),
                force_con_every,
                auto_remove: opts.auto_remove,
                block_size,
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn set_delivery_listener(&self, listener: Arc<dyn DeliveryListener>) {
        *self.state.listener.lock().unwrap() = Some(listener);
    }

    /// Force CON (or NON) notifications for all relations, regardless of the
    /// per-peer preference.
    pub fn set_con_notifications(&self, confirmable: bool) {
        *self.state.con_override.lock().unwrap() = Some(confirmable);
    }

    pub fn relation_count(&self) -> usize {
        self.state.relations.lock().unwrap().len()
    }

    /// Install an observer without a registration request. Such relations
    /// survive plain GETs from the same remote.
    pub fn add_relation(&self, remote: SocketAddr, token: Vec<u8>, confirmable: bool) {
        self.state.relations.lock().unwrap().insert(
            remote,
            ObservationRelation {
                token,
                remote,
                context: TransportContext::default(),
                seq: 0,
                confirmable,
                delivering: false,
                auto_removable: false,
            },
        );
    }

    /// Fan the new representation out to every relation. Relations with an
    /// outstanding confirmable delivery are skipped and reported as failed.
    pub fn notify_change(&self, notification: Notification) {
        let global = *self.state.con_override.lock().unwrap();
        let mut dispatches = Vec::new();
        {
            let mut relations = self.state.relations.lock().unwrap();
            for relation in relations.values_mut() {
                if relation.delivering {
                    log::debug!(
                        "skipping notification for {}, previous delivery outstanding",
                        relation.remote
                    );
                    dispatches.push(Dispatch::Busy(relation.remote));
                    continue;
                }
                let seq = relation.next_seq();
                let confirmable =
                    wants_con(relation.confirmable, global, seq, self.state.force_con_every);
                let mut message = Message {
                    mtype: if confirmable {
                        MessageType::Confirmable
                    } else {
                        MessageType::NonConfirmable
                    },
                    code: Code::Response(Status::Content),
                    mid: 0,
                    token: relation.token.clone(),
                    options: Options {
                        observe: Some(seq),
                        etag: notification.etag.clone(),
                        max_age: notification.max_age,
                        content_format: notification.content_format,
                        ..Default::default()
                    },
                    payload: notification.payload.clone(),
                    remote: relation.remote,
                };
                self.truncate_to_first_block(&mut message);
                if confirmable {
                    relation.delivering = true;
                    dispatches.push(Dispatch::Reliable(message, relation.context.clone()));
                } else {
                    dispatches.push(Dispatch::BestEffort(message, relation.context.clone()));
                }
            }
        }
        let listener = self.state.listener();
        for dispatch in dispatches {
            match dispatch {
                Dispatch::Reliable(message, context) => {
                    let state = Arc::downgrade(&self.state);
                    let remote = message.remote;
                    self.state.handle.send_reliable(
                        message,
                        context,
                        Priority::Normal,
                        false,
                        Box::new(move |result| on_con_result(state, remote, result)),
                    );
                }
                Dispatch::BestEffort(message, context) => {
                    let remote = message.remote;
                    self.state.handle.send_best_effort(message, context);
                    if let Some(listener) = &listener {
                        listener.delivered(remote);
                    }
                }
                Dispatch::Busy(remote) => {
                    if let Some(listener) = &listener {
                        listener.failed(remote);
                    }
                }
            }
        }
    }

    /// End all observations: a bare RST per relation, or a confirmable
    /// error-code notification when `finale` is given. Calling this again
    /// with no relations left is a no-op.
    pub fn notify_termination(&self, finale: Option<(Status, Vec<u8>)>) {
        let relations: Vec<ObservationRelation> = {
            let mut relations = self.state.relations.lock().unwrap();
            relations.drain().map(|(_, relation)| relation).collect()
        };
        if relations.is_empty() {
            return;
        }
        log::debug!("terminating {} observation relations", relations.len());
        for mut relation in relations {
            match &finale {
                None => {
                    let message = Message {
                        mtype: MessageType::Reset,
                        code: Code::Empty,
                        mid: 0,
                        token: Vec::new(),
                        options: Options::default(),
                        payload: Vec::new(),
                        remote: relation.remote,
                    };
                    self.state.handle.send_best_effort(message, relation.context.clone());
                }
                Some((code, payload)) => {
                    let seq = relation.next_seq();
                    let message = Message {
                        mtype: MessageType::Confirmable,
                        code: Code::Response(*code),
                        mid: 0,
                        token: relation.token.clone(),
                        options: Options {
                            observe: Some(seq),
                            ..Default::default()
                        },
                        payload: payload.clone(),
                        remote: relation.remote,
                    };
                    self.state.handle.send_reliable(
                        message,
                        relation.context.clone(),
                        Priority::Normal,
                        false,
                        Box::new(move |result| {
                            if let Err(e) = result {
                                log::debug!("termination notification failed: {}", e);
                            }
                        }),
                    );
                }
            }
        }
    }

    fn truncate_to_first_block(&self, message: &mut Message) {
        let Some(limit) = self.state.block_size else {
            return;
        };
        if message.payload.len() <= limit {
            return;
        }
        let Some(szx) = BlockOption::szx_for_size(limit) else {
            return;
        };
        let block_size = 1usize << (szx + 4);
        message.payload.truncate(block_size);
        message.options.block2 = Some(BlockOption {
            num: 0,
            more: true,
            szx,
        });
    }
}

fn on_con_result(state: Weak<State>, remote: SocketAddr, result: Result<Message, CoapError>) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let listener = state.listener();
    match result {
        Ok(reply) if reply.mtype == MessageType::Reset => {
            log::debug!("observer {} answered with reset, removing relation", remote);
            state.remove_relation(remote);
            if let Some(listener) = listener {
                listener.failed(remote);
            }
        }
        Ok(_) => {
            if let Some(relation) = state.relations.lock().unwrap().get_mut(&remote) {
                relation.delivering = false;
            }
            if let Some(listener) = listener {
                listener.delivered(remote);
            }
        }
        Err(CoapError::Timeout) => {
            log::debug!("notification to {} timed out, removing relation", remote);
            state.remove_relation(remote);
            if let Some(listener) = listener {
                listener.failed(remote);
            }
        }
        Err(e) => {
            log::debug!("notification to {} failed: {}", remote, e);
            if let Some(relation) = state.relations.lock().unwrap().get_mut(&remote) {
                relation.delivering = false;
            }
            if let Some(listener) = listener {
                listener.failed(remote);
            }
        }
    }
}

impl Handler for ObservableResource {
    fn handle(&self, exchange: &mut Exchange) -> Result<(), CoapError> {
        let request = exchange.request();
        let is_get = request.code == Code::Request(Method::Get);
        let observe = request.options.observe;
        let has_block =
            request.options.block1.is_some() || request.options.block2.is_some();

        if is_get && observe == Some(0) && !request.token.is_empty() {
            let token = request.token.clone();
            let remote = exchange.remote();
            let context = exchange.context().clone();
            self.state.inner.handle(exchange)?;
            if let Some(response) = exchange.response_mut() {
                if matches!(response.code, Code::Response(status) if status.is_success()) {
                    log::trace!(
                        "observer {} registered, token:{}",
                        remote,
                        hex::encode(&token)
                    );
                    self.state.relations.lock().unwrap().insert(
                        remote,
                        ObservationRelation {
                            token,
                            remote,
                            context,
                            seq: 0,
                            confirmable: false,
                            delivering: false,
                            auto_removable: true,
                        },
                    );
                    response.options.observe = Some(0);
                }
            }
            return Ok(());
        }

        if is_get && observe.is_none() && !has_block && self.state.auto_remove {
            let remote = exchange.remote();
            let removed = {
                let mut relations = self.state.relations.lock().unwrap();
                match relations.get(&remote) {
                    Some(relation) if relation.auto_removable => {
                        relations.remove(&remote);
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                log::debug!("observer {} de-registered by plain get", remote);
            }
        }
        self.state.inner.handle(exchange)
    }
}
