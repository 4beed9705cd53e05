// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Fan-out Relay
//!
//! A delayed fan-out is published once into `<T>.input.delay`. When its TTL
//! expires the broker dead-letters it into `inner_delay_input`, where this relay
//! re-publishes it, unmodified, to every subscriber binding named in its
//! headers and acks it once all re-publishes were issued. The re-publishes are
//! not confirmed. When a re-publish fails the delivery is requeued, so some
//! subscribers may receive it twice.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Delivery},
    errors::AmqpError,
    topology::RELAY_QUEUE,
};
use futures_util::StreamExt;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldArray, LongString, ShortString},
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Header naming the topic exchange the relay publishes to
pub const RELAY_EXCHANGE_HEADER: &str = "x-relay-exchange";
/// Header listing the route keys the relay publishes with
pub const RELAY_ROUTE_KEYS_HEADER: &str = "x-relay-route-keys";

/// Adds the relay target to outgoing headers.
pub(crate) fn insert_relay_target(
    headers: &mut BTreeMap<ShortString, AMQPValue>,
    exchange: &str,
    route_keys: &[String],
) {
    headers.insert(
        ShortString::from(RELAY_EXCHANGE_HEADER),
        AMQPValue::LongString(LongString::from(exchange)),
    );
    headers.insert(
        ShortString::from(RELAY_ROUTE_KEYS_HEADER),
        AMQPValue::FieldArray(FieldArray::from(
            route_keys
                .iter()
                .map(|key| AMQPValue::LongString(LongString::from(key.as_str())))
                .collect::<Vec<_>>(),
        )),
    );
}

fn long_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(value) => {
            Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        _ => None,
    }
}

/// Reads the relay target back from delivery properties.
pub(crate) fn relay_target(props: &AMQPProperties) -> Option<(String, Vec<String>)> {
    let headers = props.headers().as_ref()?.inner();

    let exchange = long_string(headers.get(RELAY_EXCHANGE_HEADER)?)?;
    let route_keys: Vec<String> = match headers.get(RELAY_ROUTE_KEYS_HEADER)? {
        AMQPValue::FieldArray(keys) => keys.as_slice().iter().filter_map(long_string).collect(),
        _ => return None,
    };

    if route_keys.is_empty() {
        return None;
    }

    Some((exchange, route_keys))
}

/// Starts the relay consumer on a dedicated channel.
///
/// The returned task ends with the delivery stream of the relay queue.
pub(crate) async fn spawn_relay(
    connection: Arc<dyn BrokerConnection>,
) -> Result<JoinHandle<()>, AmqpError> {
    let channel = connection.create_channel().await?;
    let tag = format!("{}-{}", RELAY_QUEUE, Uuid::new_v4());
    let mut deliveries = channel.basic_consume(RELAY_QUEUE, &tag).await?;

    debug!(consumer = tag.as_str(), "delay relay started");

    Ok(tokio::spawn(async move {
        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = relay(channel.as_ref(), &delivery).await {
                        error!(error = err.to_string(), "error relaying delayed msg");
                    }
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!("delay relay stopped");
    }))
}

pub(crate) async fn relay(channel: &dyn BrokerChannel, delivery: &Delivery) -> Result<(), AmqpError> {
    let Some((exchange, route_keys)) = relay_target(&delivery.properties) else {
        error!("removing message from relay queue - reason: no relay target");
        return channel.basic_nack(delivery.delivery_tag, false).await;
    };

    for route_key in &route_keys {
        // unconfirmed
        if let Err(err) = channel
            .basic_publish(
                &exchange,
                route_key,
                &delivery.data,
                delivery.properties.clone(),
            )
            .await
        {
            if let Err(nack_err) = channel.basic_nack(delivery.delivery_tag, true).await {
                error!(error = nack_err.to_string(), "error whiling requeuing");
            }
            return Err(err);
        }
    }

    debug!(
        exchange = exchange.as_str(),
        subscribers = route_keys.len(),
        "delayed msg relayed"
    );

    channel.basic_ack(delivery.delivery_tag).await
}
