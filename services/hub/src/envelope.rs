//! Envelope parsing and message classification.
//!
//! Every node message carries a pipe-delimited text header:
//!
//! ```text
//! node_id_and_view | message_kind | optional extra info
//! ```
//!
//! Only the first character of `message_kind` is used for dispatch.

use thiserror::Error;

/// Field separator in envelope text.
pub const FIELD_SEPARATOR: char = '|';

/// Errors raised while classifying an envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Empty message kind in envelope: {0:?}")]
    EmptyKind(String),
}

/// Dispatch class of an envelope, decided by the first character of its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `H...`: liveness heartbeat, answered immediately
    Heartbeat,
    /// `i...`: uncompressed image, accepted but not persisted
    RawImage,
    /// `j...`: pre-compressed JPEG image, persisted
    Jpeg,
    /// Anything else is an event record for the event log
    Event,
}

impl MessageKind {
    /// Classify from the leading character of a message kind.
    pub fn from_leading(c: char) -> Self {
        match c {
            'H' => MessageKind::Heartbeat,
            'i' => MessageKind::RawImage,
            'j' => MessageKind::Jpeg,
            _ => MessageKind::Event,
        }
    }
}

/// A parsed envelope borrowing from the received text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// The full envelope text as received
    pub text: &'a str,
    /// First field: node name and view name
    pub node_and_view: &'a str,
    /// Second field: message kind
    pub kind: &'a str,
}

impl<'a> Envelope<'a> {
    /// Parse envelope text.
    ///
    /// Returns `None` when the text has fewer than two fields; such a
    /// message is a connectivity probe.
    pub fn parse(text: &'a str) -> Option<Self> {
        let mut fields = text.split(FIELD_SEPARATOR);
        let node_and_view = fields.next()?;
        let kind = fields.next()?;

        Some(Self {
            text,
            node_and_view,
            kind,
        })
    }

    /// Classify the envelope by the first character of its kind.
    pub fn classify(&self) -> Result<MessageKind, EnvelopeError> {
        self.kind
            .chars()
            .next()
            .map(MessageKind::from_leading)
            .ok_or_else(|| EnvelopeError::EmptyKind(self.text.to_string()))
    }

    /// Node and view name made safe for use in a filename.
    pub fn node_name(&self) -> String {
        normalize_node_name(self.node_and_view)
    }
}

/// Normalize a node identifier for use in filenames.
///
/// Spaces become hyphens, leading and trailing ones included; path
/// separators, `:` and control characters become underscores.
pub fn normalize_node_name(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            ' ' => '-',
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
