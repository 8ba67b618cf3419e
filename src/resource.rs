use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::CoapError;
use crate::messages::{Message, Status};
use crate::transport::TransportContext;

/// One inbound request being served. Handlers answer through it and must not
/// retain it after returning.
pub struct Exchange {
    request: Message,
    context: TransportContext,
    response: Option<Message>,
}

impl Exchange {
    pub(crate) fn new(request: Message, context: TransportContext) -> Self {
        Self {
            request,
            context,
            response: None,
        }
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn remote(&self) -> SocketAddr {
        self.request.remote
    }

    pub fn context(&self) -> &TransportContext {
        &self.context
    }

    /// Set the response, mirroring the request's token and piggyback slot.
    pub fn respond(&mut self, code: Status, payload: impl Into<Vec<u8>>) {
        let mut response = self.request.response(code);
        response.payload = payload.into();
        self.response = Some(response);
    }

    /// The response set so far, for adjusting options before dispatch.
    pub fn response_mut(&mut self) -> Option<&mut Message> {
        self.response.as_mut()
    }

    pub(crate) fn take_response(self) -> Option<Message> {
        self.response
    }
}

/// A served resource. Errors of the `Code` variant turn into that error
/// response; anything else becomes 5.00.
pub trait Handler: Send + Sync {
    fn handle(&self, exchange: &mut Exchange) -> Result<(), CoapError>;
}

impl<F> Handler for F
where
    F: Fn(&mut Exchange) -> Result<(), CoapError> + Send + Sync,
{
    fn handle(&self, exchange: &mut Exchange) -> Result<(), CoapError> {
        self(exchange)
    }
}

/// URI path to handler lookup. Exact match wins; entries registered with a
/// trailing `*` match as prefixes in registration order.
#[derive(Default)]
pub struct Router {
    exact: HashMap<String, Arc<dyn Handler>>,
    wildcard: Vec<(String, Arc<dyn Handler>)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(path: &str) -> String {
        if path.is_empty() {
            "/".to_owned()
        } else if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{}", path)
        }
    }

    pub fn register(&mut self, path: &str, handler: Arc<dyn Handler>) {
        match path.strip_suffix('*') {
            Some(prefix) => self.wildcard.push((Self::normalize(prefix), handler)),
            None => {
                self.exact.insert(Self::normalize(path), handler);
            }
        }
    }

    pub fn unregister(&mut self, path: &str) {
        match path.strip_suffix('*') {
            Some(prefix) => {
                let prefix = Self::normalize(prefix);
                self.wildcard.retain(|(p, _)| *p != prefix);
            }
            None => {
                self.exact.remove(&Self::normalize(path));
            }
        }
    }

    pub fn find(&self, path: &str) -> Option<Arc<dyn Handler>> {
        let path = Self::normalize(path);
        if let Some(handler) = self.exact.get(&path) {
            return Some(handler.clone());
        }
        self.wildcard
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
    }
}

/// Error response for a failed handler invocation.
pub(crate) fn error_response(request: &Message, error: &CoapError) -> Message {
    match error {
        CoapError::Code(code, payload) => {
            let mut response = request.response(*code);
            if let Some(payload) = payload {
                response.payload = payload.clone();
            }
            response
        }
        _ => request.response(Status::InternalServerError),
    }
}
