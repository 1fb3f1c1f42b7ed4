//! AMI wire framing.
//!
//! A packet is a sequence of ASCII `Key: Value` lines, CRLF-delimited,
//! terminated by one empty line. Header values are carried verbatim: exactly
//! one space after the colon is stripped on parse, and serialisation writes
//! the stored bytes untouched. Secrets with leading or trailing whitespace
//! authenticate only when sent byte-identical, so no trimming happens at
//! this layer.

/// One framed AMI packet, order-preserving.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    headers: Vec<(String, String)>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an action packet: `Action: <name>`.
    pub fn action(name: &str) -> Self {
        let mut packet = Self::new();
        packet.push("Action", name);
        packet
    }

    pub fn push(&mut self, key: &str, value: &str) {
        self.headers.push((key.to_string(), value.to_string()));
    }

    /// Parse one `Key: Value` line into the packet. Lines without a colon
    /// are ignored (the caller logs them); a single leading space after the
    /// colon is stripped, nothing else is normalised.
    pub fn push_line(&mut self, line: &str) -> bool {
        let Some((key, rest)) = line.split_once(':') else {
            return false;
        };
        let value = rest.strip_prefix(' ').unwrap_or(rest);
        self.headers.push((key.to_string(), value.to_string()));
        true
    }

    /// First header value for `key`, case-insensitive on the key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn is_response(&self) -> bool {
        self.get("Response").is_some()
    }

    pub fn is_event(&self) -> bool {
        self.get("Event").is_some()
    }

    pub fn event_type(&self) -> Option<&str> {
        self.get("Event")
    }

    pub fn action_id(&self) -> Option<&str> {
        self.get("ActionID")
    }

    /// `Response: Success` is authoritative for command success.
    pub fn is_success(&self) -> bool {
        self.get("Response")
            .map(|value| value.eq_ignore_ascii_case("Success"))
            .unwrap_or(false)
    }

    /// The human-readable `Message` header, surfaced on failure paths.
    pub fn message(&self) -> Option<&str> {
        self.get("Message")
    }

    /// Whether a login response indicates bad credentials rather than some
    /// other protocol failure. Asterisk phrases this a few ways.
    pub fn is_auth_failure(&self) -> bool {
        if self.is_success() {
            return false;
        }
        self.message()
            .map(|message| {
                let lower = message.to_ascii_lowercase();
                lower.contains("authentication failed") || lower.contains("not accepted")
            })
            .unwrap_or(false)
    }

    /// Frame the packet for the wire: `Key: Value\r\n` per header, then a
    /// blank line. Values are written exactly as stored.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.headers {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}
