// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;
mod relay;

#[cfg(test)]
mod testing;

pub mod broker;
pub mod channel;
pub mod configs;
pub mod context;
pub mod dedup;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod sled_store;
pub mod topology;
