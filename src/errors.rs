// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Dispatch Engine
//!
//! This module provides the error type shared by every layer of the crate.
//! The `AmqpError` enum covers caller validation, broker connection and channel
//! failures, topology declaration, publishing and confirmation, consumption,
//! and the durable dedup store.

use thiserror::Error;

/// Represents errors that can occur while dispatching messages through RabbitMQ.
///
/// A duplicate publish is not an error: it yields `Ok(false)`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error loading the configuration
    #[error("failure to load configs `{0}`")]
    ConfigsError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The message carries no source content to hash
    #[error("message source must not be empty")]
    EmptySource,

    /// A fan-out publish named no subscriber
    #[error("at least one subscriber name is required")]
    NoSubscribers,

    /// A subscriber name is blank
    #[error("subscriber name must not be empty")]
    EmptySubscriberName,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error switching a channel into publisher confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker negatively confirmed a publish
    #[error("publish was nacked by the broker")]
    PublishNacked,

    /// No publisher confirmation arrived in time
    #[error("timeout waiting for the publish confirmation")]
    ConfirmTimeout,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The channel pool was shut down
    #[error("channel pool is closed")]
    PoolClosed,

    /// Error reading or writing the durable dedup store
    #[error("dedup store failure `{0}`")]
    DedupStoreError(String),
}
