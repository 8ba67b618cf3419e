use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// Response codes, displayed in the usual dotted c.dd form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestEntityTooLarge,
    TooManyRequests,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
}

impl Status {
    pub fn class(&self) -> u8 {
        self.dotted().0
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }

    fn dotted(&self) -> (u8, u8) {
        match self {
            Status::Created => (2, 1),
            Status::Deleted => (2, 2),
            Status::Valid => (2, 3),
            Status::Changed => (2, 4),
            Status::Content => (2, 5),
            Status::BadRequest => (4, 0),
            Status::Unauthorized => (4, 1),
            Status::BadOption => (4, 2),
            Status::Forbidden => (4, 3),
            Status::NotFound => (4, 4),
            Status::MethodNotAllowed => (4, 5),
            Status::RequestEntityTooLarge => (4, 13),
            Status::TooManyRequests => (4, 29),
            Status::InternalServerError => (5, 0),
            Status::NotImplemented => (5, 1),
            Status::ServiceUnavailable => (5, 3),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (class, detail) = self.dotted();
        write!(f, "{}.{:02}", class, detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Empty,
    Request(Method),
    Response(Status),
}

impl Code {
    pub fn is_empty(&self) -> bool {
        matches!(self, Code::Empty)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Code::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Code::Response(_))
    }
}

/// RFC 7959 block option value. Actual block size is 2^(szx+4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl BlockOption {
    pub fn size(&self) -> usize {
        1 << (self.szx + 4)
    }

    /// Largest valid szx whose block size fits within `size`, if any.
    pub fn szx_for_size(size: usize) -> Option<u8> {
        (0..=6u8).rev().find(|szx| (1usize << (szx + 4)) <= size)
    }
}

/// The option subset the message layer consumes. Everything the codec did
/// not map to a field lands in `unrecognized` by option number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    pub uri_path: String,
    pub observe: Option<u32>,
    pub block1: Option<BlockOption>,
    pub block2: Option<BlockOption>,
    pub etag: Option<Vec<u8>>,
    pub max_age: Option<u32>,
    pub content_format: Option<u16>,
    pub unrecognized: Vec<(u16, Vec<u8>)>,
}

impl Options {
    /// First unrecognized critical option (odd option numbers are critical).
    pub fn unknown_critical(&self) -> Option<u16> {
        self.unrecognized
            .iter()
            .find(|(number, _)| number & 1 == 1)
            .map(|(number, _)| *number)
    }
}

/// One decoded CoAP message. The codec producing/consuming wire bytes lives
/// outside this crate; the endpoint only reads and builds these values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: MessageType,
    pub code: Code,
    pub mid: u16,
    pub token: Vec<u8>,
    pub options: Options,
    pub payload: Vec<u8>,
    /// Peer address: destination on outbound, source on inbound.
    pub remote: SocketAddr,
}

impl Message {
    /// Confirmable request skeleton. The endpoint assigns the message id on
    /// send.
    pub fn request(remote: SocketAddr, method: Method, path: &str) -> Self {
        Self {
            mtype: MessageType::Confirmable,
            code: Code::Request(method),
            mid: 0,
            token: Vec::new(),
            options: Options {
                uri_path: path.to_owned(),
                ..Default::default()
            },
            payload: Vec::new(),
            remote,
        }
    }

    /// Empty confirmable message, answered by a reset (CoAP ping).
    pub fn ping(remote: SocketAddr) -> Self {
        Self {
            mtype: MessageType::Confirmable,
            code: Code::Empty,
            mid: 0,
            token: Vec::new(),
            options: Options::default(),
            payload: Vec::new(),
            remote,
        }
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_observe(mut self, observe: u32) -> Self {
        self.options.observe = Some(observe);
        self
    }

    pub fn non_confirmable(mut self) -> Self {
        self.mtype = MessageType::NonConfirmable;
        self
    }

    /// Response skeleton mirroring this request: token and remote always,
    /// type and message id piggybacked when the request was confirmable.
    pub fn response(&self, code: Status) -> Message {
        let (mtype, mid) = if self.mtype == MessageType::Confirmable {
            (MessageType::Acknowledgement, self.mid)
        } else {
            (MessageType::NonConfirmable, 0)
        };
        Message {
            mtype,
            code: Code::Response(code),
            mid,
            token: self.token.clone(),
            options: Options::default(),
            payload: Vec::new(),
            remote: self.remote,
        }
    }

    /// Empty ACK for this message.
    pub fn ack(&self) -> Message {
        Message {
            mtype: MessageType::Acknowledgement,
            code: Code::Empty,
            mid: self.mid,
            token: Vec::new(),
            options: Options::default(),
            payload: Vec::new(),
            remote: self.remote,
        }
    }

    /// Reset for this message.
    pub fn reset(&self) -> Message {
        Message {
            mtype: MessageType::Reset,
            code: Code::Empty,
            mid: self.mid,
            token: Vec::new(),
            options: Options::default(),
            payload: Vec::new(),
            remote: self.remote,
        }
    }

    pub fn is_con(&self) -> bool {
        self.mtype == MessageType::Confirmable
    }
}

/// Monotonic 16-bit message-id source, one per endpoint. Uniqueness inside
/// the duplicate window is the detector's concern, not this counter's.
pub struct MidSupplier(AtomicU16);

impl MidSupplier {
    pub fn new() -> Self {
        Self(AtomicU16::new(rand::random()))
    }

    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MidSupplier {
    fn default() -> Self {
        Self::new()
    }
}
