// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! The per-delivery work of a registered handler: decode the payload, open a
//! consumer span from the propagated trace context, optionally throttle, run
//! the handler and settle the delivery. A delivery is acked unless the handler
//! failed or asked for a redelivery, in which case it is requeued.

use crate::{
    broker::{BrokerChannel, Delivery, DeliveryStream},
    dispatcher::MessageHandler,
    errors::AmqpError,
    message::{decode, Message},
    otel,
};
use futures_util::StreamExt;
use opentelemetry::trace::{Span, Status};
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Handles one delivery with `handler` and acks or nacks it on `channel`.
pub(crate) async fn consume<M, H>(
    channel: &dyn BrokerChannel,
    delivery: &Delivery,
    handler: &H,
    delay_process: Duration,
) -> Result<(), AmqpError>
where
    M: Message,
    H: MessageHandler<M>,
{
    let mut message = match decode::<M>(&delivery.data) {
        Ok(message) => message,
        Err(err) => {
            error!(
                msg_type = M::message_type(),
                "removing message from queue - reason: unparsable payload"
            );
            channel.basic_nack(delivery.delivery_tag, false).await?;
            return Err(err);
        }
    };

    let (_, mut span) = otel::consumer_span(&delivery.properties, M::message_type());

    debug!(
        "received: {} - exchange: {}",
        M::message_type(),
        delivery.exchange
    );

    if !delay_process.is_zero() {
        tokio::time::sleep(delay_process).await;
    }

    if let Err(err) = handler.handle(&mut message).await {
        warn!(
            error = err.to_string(),
            "error whiling handling msg, requeuing for latter"
        );
        span.record_error(err.as_ref());
        message.set_need_nack(true);
    }

    if message.need_nack() {
        debug!("message requeued");
        return match channel.basic_nack(delivery.delivery_tag, true).await {
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to nack msg"),
                });
                Err(err)
            }
            Ok(()) => {
                span.set_status(Status::Error {
                    description: Cow::from("msg requeued"),
                });
                Ok(())
            }
        };
    }

    match channel.basic_ack(delivery.delivery_tag).await {
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(err)
        }
        Ok(()) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            Ok(())
        }
    }
}

/// Drives `deliveries` through `handler`, one delivery at a time.
pub(crate) fn spawn_consumer<M, H>(
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: DeliveryStream,
    handler: Arc<H>,
    delay_process: Duration,
) -> JoinHandle<()>
where
    M: Message,
    H: MessageHandler<M>,
{
    tokio::spawn(async move {
        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = consume::<M, H>(
                        channel.as_ref(),
                        &delivery,
                        handler.as_ref(),
                        delay_process,
                    )
                    .await
                    {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!(msg_type = M::message_type(), "consumer stream closed");
    })
}
