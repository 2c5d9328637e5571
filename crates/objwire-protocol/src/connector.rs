use std::sync::Arc;

use objwire_transport::Endpoint;
use tracing::debug;

use crate::client::{Client, ClientConfig};
use crate::error::Result;
use crate::exceptions::ExceptionRegistry;

/// Connect to a serving peer with default configuration and no declared
/// exceptions.
pub fn connect(endpoint: &Endpoint) -> Result<Arc<Client>> {
    connect_with_config(endpoint, ClientConfig::default(), ExceptionRegistry::new())
}

/// Connect with explicit configuration and the exceptions this client can
/// decode.
pub fn connect_with_config(
    endpoint: &Endpoint,
    config: ClientConfig,
    exceptions: ExceptionRegistry,
) -> Result<Arc<Client>> {
    let stream = endpoint.connect(config.connect_timeout)?;
    debug!(%endpoint, peer = %stream.peer_description(), "connected");
    Ok(Arc::new(Client::from_stream(stream, exceptions, config)?))
}
