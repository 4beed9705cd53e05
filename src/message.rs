// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatched Messages
//!
//! Every message type embeds a [`MessageHeader`] flattened into its JSON payload
//! and implements [`Message`] to expose it. The header carries the content used
//! for identity hashing, the identity assigned at publish time, and the
//! redelivery request a handler may raise.
//!
//! ```
//! use rabbitmq_dispatch::message::{Message, MessageHeader};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     #[serde(flatten)]
//!     header: MessageHeader,
//!     order_id: u64,
//! }
//!
//! impl Message for OrderPlaced {
//!     fn header(&self) -> &MessageHeader {
//!         &self.header
//!     }
//!
//!     fn header_mut(&mut self) -> &mut MessageHeader {
//!         &mut self.header
//!     }
//! }
//!
//! assert_eq!(OrderPlaced::message_type(), "OrderPlaced");
//! ```

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::error;

/// Fields shared by all dispatched messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Content the identity hash is derived from.
    #[serde(default)]
    pub source: String,
    /// Identity assigned by the dedup guard, empty until published.
    #[serde(default)]
    pub id: String,
    /// Set by a handler to ask for a requeue instead of an ack.
    #[serde(default)]
    pub need_nack: bool,
}

impl MessageHeader {
    pub fn new(source: impl Into<String>) -> MessageHeader {
        MessageHeader {
            source: source.into(),
            ..MessageHeader::default()
        }
    }
}

/// A message type the dispatch engine can publish and consume.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn header(&self) -> &MessageHeader;

    fn header_mut(&mut self) -> &mut MessageHeader;

    /// Name used for every exchange and queue derived from this type.
    ///
    /// Defaults to the type name without module path and generic arguments,
    /// so `Envelope<A>` and `Envelope<B>` both map to `Envelope` and share
    /// their queues. Generic message types must override it to keep them
    /// apart, and two types with the same name in different modules must too.
    fn message_type() -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }

    fn source(&self) -> &str {
        &self.header().source
    }

    fn id(&self) -> &str {
        &self.header().id
    }

    fn set_id(&mut self, id: String) {
        self.header_mut().id = id;
    }

    fn need_nack(&self) -> bool {
        self.header().need_nack
    }

    fn set_need_nack(&mut self, need_nack: bool) {
        self.header_mut().need_nack = need_nack;
    }
}

/// The bare type name: no module path, no generic arguments.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

pub(crate) fn encode<M: Message>(message: &M) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(message).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize message");
        AmqpError::SerializePayloadError
    })
}

pub(crate) fn decode<M: Message>(data: &[u8]) -> Result<M, AmqpError> {
    serde_json::from_slice(data).map_err(|err| {
        error!(error = err.to_string(), "failure to parse message");
        AmqpError::ParsePayloadError
    })
}
