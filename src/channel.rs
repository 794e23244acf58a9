// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module handles the creation of the broker connection and of channels
//! on top of it. The runtime opens exactly one connection; the reader owns the
//! consume channel (and rotates it), the publisher rides a dedicated channel.

use crate::{config::AmqpConfig, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Establishes the broker connection described by the configuration.
///
/// Connection failures are fatal to the caller: the bootstrap decides whether
/// to exit or restart, the runtime never retries silently.
pub async fn new_amqp_connection(cfg: &AmqpConfig) -> Result<Arc<Connection>, AmqpError> {
    debug!("creating amqp connection...");

    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    Ok(Arc::new(conn))
}

/// Creates a new channel on an established connection.
pub async fn new_amqp_channel(conn: &Connection) -> Result<Arc<Channel>, AmqpError> {
    debug!("creating amqp channel...");

    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(Arc::new(c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}
