use std::fmt;

/// STOMP protocol versions this engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StompVersion {
    V1_0,
    V1_1,
    V1_2,
}

impl StompVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            StompVersion::V1_0 => "1.0",
            StompVersion::V1_1 => "1.1",
            StompVersion::V1_2 => "1.2",
        }
    }

    pub fn parse(s: &str) -> Option<StompVersion> {
        match s {
            "1.0" => Some(StompVersion::V1_0),
            "1.1" => Some(StompVersion::V1_1),
            "1.2" => Some(StompVersion::V1_2),
            _ => None,
        }
    }

    /// Heartbeats, NACK, and transactional acks only exist from 1.1 onward.
    pub fn supports_heartbeat(&self) -> bool {
        *self != StompVersion::V1_0
    }
}

impl fmt::Display for StompVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of STOMP frame types.
///
/// Heartbeats are not a frame type: the codec reports them as a separate
/// [`crate::codec::StompItem::Heartbeat`] marker so they never reach
/// type-specific routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Connect,
    Connected,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Connect => "CONNECT",
            FrameType::Connected => "CONNECTED",
            FrameType::Stomp => "STOMP",
            FrameType::Send => "SEND",
            FrameType::Subscribe => "SUBSCRIBE",
            FrameType::Unsubscribe => "UNSUBSCRIBE",
            FrameType::Ack => "ACK",
            FrameType::Nack => "NACK",
            FrameType::Begin => "BEGIN",
            FrameType::Commit => "COMMIT",
            FrameType::Abort => "ABORT",
            FrameType::Disconnect => "DISCONNECT",
            FrameType::Message => "MESSAGE",
            FrameType::Receipt => "RECEIPT",
            FrameType::Error => "ERROR",
        }
    }

    /// Parse a command line into a frame type.
    pub fn parse(s: &str) -> Option<FrameType> {
        match s {
            "CONNECT" => Some(FrameType::Connect),
            "CONNECTED" => Some(FrameType::Connected),
            "STOMP" => Some(FrameType::Stomp),
            "SEND" => Some(FrameType::Send),
            "SUBSCRIBE" => Some(FrameType::Subscribe),
            "UNSUBSCRIBE" => Some(FrameType::Unsubscribe),
            "ACK" => Some(FrameType::Ack),
            "NACK" => Some(FrameType::Nack),
            "BEGIN" => Some(FrameType::Begin),
            "COMMIT" => Some(FrameType::Commit),
            "ABORT" => Some(FrameType::Abort),
            "DISCONNECT" => Some(FrameType::Disconnect),
            "MESSAGE" => Some(FrameType::Message),
            "RECEIPT" => Some(FrameType::Receipt),
            "ERROR" => Some(FrameType::Error),
            _ => None,
        }
    }

    /// Whether the broker originates this frame type.
    pub fn from_server(&self) -> bool {
        matches!(
            self,
            FrameType::Connected | FrameType::Message | FrameType::Receipt | FrameType::Error
        )
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known STOMP header names.
///
/// See the header listings of the 1.0/1.1/1.2 specifications.
pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const HOST: &str = "host";
    pub const LOGIN: &str = "login";
    pub const PASSCODE: &str = "passcode";
    pub const RECEIPT: &str = "receipt";
    pub const DESTINATION: &str = "destination";
    pub const MESSAGE_ID: &str = "message-id";
    pub const TRANSACTION: &str = "transaction";
    pub const VERSION: &str = "version";
    pub const SESSION: &str = "session";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const ACK: &str = "ack";
    pub const ID: &str = "id";
    pub const HEARTBEAT: &str = "heart-beat";
    pub const SERVER: &str = "server";
}

/// An ordered header map with unique keys.
///
/// Insertion order is preserved; [`Headers::set`] replaces a value in place
/// so the request-population chain can overwrite without reordering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Insert or replace a header, keeping the original position on replace.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Insert only when the key is absent (first occurrence wins on decode).
    pub fn set_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if !self.contains_key(&key) {
            self.entries.push((key, value.into()));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.set(k, v);
        }
        headers
    }
}

/// A single STOMP frame: type, ordered headers, optional textual body.
///
/// The header map is never null: absence is an empty map. `content-length`
/// is always derived from the UTF-8 byte length of the body when the request
/// is populated for sending; a pre-set value is never trusted on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub headers: Headers,
    pub body: Option<String>,
    pub content_type: Option<String>,
}

impl Frame {
    /// Create a new frame with the given type and empty headers/body.
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            headers: Headers::new(),
            body: None,
            content_type: None,
        }
    }

    /// Add or replace a header (builder style).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(key, value);
        self
    }

    /// Set the frame body (builder style).
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the content type advertised alongside the body (builder style).
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Get the value of a header by name.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// UTF-8 byte length of the body; zero when absent.
    pub fn content_length(&self) -> usize {
        self.body.as_ref().map(|b| b.len()).unwrap_or(0)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Type: {}", self.frame_type)?;
        for (k, v) in self.headers.iter() {
            writeln!(f, "{}: {}", k, v)?;
        }
        writeln!(f, "Body ({} bytes)", self.content_length())
    }
}
