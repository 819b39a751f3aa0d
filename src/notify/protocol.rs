//! Wire format shared with the sfdroid renderer
//!
//! Every frame is a 2-byte native-endian length followed by exactly that many
//! payload bytes. The payload is the component name (prefixed with `close:`
//! for close notifications) terminated by a NUL byte, and the length counts
//! that NUL.

use serde::{Deserialize, Serialize};

use super::error::NotifyError;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Default upper bound for a payload, NUL included
pub const MAX_PAYLOAD: usize = 5120;

/// Marker placed in front of the component name in close frames
pub const CLOSE_PREFIX: &str = "close:";

/// Kind of lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    /// A component was started
    Start,
    /// A component was closed
    Close,
}

impl NotifyKind {
    fn prefix(&self) -> &'static str {
        match self {
            NotifyKind::Start => "",
            NotifyKind::Close => CLOSE_PREFIX,
        }
    }
}

/// One encoded notification, ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
}

impl Frame {
    /// Encode a notification, rejecting names that cannot be framed
    pub fn new(kind: NotifyKind, component: &str, max_payload: usize) -> Result<Self, NotifyError> {
        validate_component(component)?;

        let prefix = kind.prefix();
        let len = prefix.len() + component.len() + 1;
        let max = effective_bound(max_payload);
        if len > max {
            return Err(NotifyError::PayloadTooLarge { len, max });
        }

        let mut payload = Vec::with_capacity(len);
        payload.extend_from_slice(prefix.as_bytes());
        payload.extend_from_slice(component.as_bytes());
        payload.push(0);

        Ok(Self { payload })
    }

    /// Length prefix as it goes on the wire
    pub fn length_prefix(&self) -> [u8; LENGTH_PREFIX_SIZE] {
        // fits: Frame::new caps the payload at u16::MAX
        (self.payload.len() as u16).to_ne_bytes()
    }

    /// NUL-terminated payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whole frame, prefix followed by payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(LENGTH_PREFIX_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.length_prefix());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Lifecycle event as seen by the receiving side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    /// `<component>\0`
    Started { component: String },
    /// `close:<component>\0`
    Closed { component: String },
}

impl AppEvent {
    pub fn kind(&self) -> NotifyKind {
        match self {
            AppEvent::Started { .. } => NotifyKind::Start,
            AppEvent::Closed { .. } => NotifyKind::Close,
        }
    }

    pub fn component(&self) -> &str {
        match self {
            AppEvent::Started { component } | AppEvent::Closed { component } => component,
        }
    }
}

/// Reject names the receiver could not tell apart from framing
pub fn validate_component(component: &str) -> Result<(), NotifyError> {
    if component.is_empty() {
        return Err(NotifyError::InvalidComponent("component is empty"));
    }
    if component.contains('\0') {
        return Err(NotifyError::InvalidComponent("component contains a NUL byte"));
    }
    Ok(())
}

/// Parse a length prefix and check it against the bound
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE], max_payload: usize) -> Result<usize, NotifyError> {
    let len = u16::from_ne_bytes(prefix) as usize;
    if len == 0 {
        return Err(NotifyError::Decode("zero-length frame".to_string()));
    }
    let max = effective_bound(max_payload);
    if len > max {
        return Err(NotifyError::PayloadTooLarge { len, max });
    }
    Ok(len)
}

/// Turn a received payload back into an event
pub fn decode_payload(payload: &[u8]) -> Result<AppEvent, NotifyError> {
    let text = match payload.split_last() {
        Some((&0, text)) => text,
        _ => return Err(NotifyError::Decode("payload is not NUL-terminated".to_string())),
    };
    let text = std::str::from_utf8(text)
        .map_err(|e| NotifyError::Decode(format!("payload is not UTF-8: {}", e)))?;

    let event = match text.strip_prefix(CLOSE_PREFIX) {
        Some(component) => AppEvent::Closed {
            component: component.to_string(),
        },
        None => AppEvent::Started {
            component: text.to_string(),
        },
    };

    validate_component(event.component())
        .map_err(|e| NotifyError::Decode(e.to_string()))?;
    Ok(event)
}

fn effective_bound(max_payload: usize) -> usize {
    max_payload.min(u16::MAX as usize)
}
