//! TCP listener binding.
//!
//! # Responsibilities
//! - Parse and bind the configured address
//! - Report bind failures as typed errors so bootstrap can roll back
//!
//! # Design Decisions
//! - Binding is separate from serving: bootstrap binds last and only hands
//!   the socket to the HTTP worker once every other step succeeded

use std::net::SocketAddr;

use tokio::net::TcpListener;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The configured address is not a socket address.
    #[error("invalid listen address `{address}`: {source}")]
    Address {
        address: String,
        source: std::net::AddrParseError,
    },

    /// Failed to bind to address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
}

/// Bind `address` (`host:port`). Returns the socket and the address it
/// actually bound, which differs from `address` for port 0.
pub async fn bind(address: &str) -> Result<(TcpListener, SocketAddr), ListenerError> {
    let addr: SocketAddr = address.parse().map_err(|source| ListenerError::Address {
        address: address.to_string(),
        source,
    })?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind {
            address: addr,
            source,
        })?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ListenerError::Bind {
            address: addr,
            source,
        })?;

    tracing::info!(address = %local_addr, "Listener bound");
    Ok((listener, local_addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let (listener, addr) = bind("127.0.0.1:0").await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_bind_taken_port_fails() {
        let (_first, addr) = bind("127.0.0.1:0").await.unwrap();
        let taken = addr.to_string();
        assert!(matches!(bind(&taken).await, Err(ListenerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_bind_rejects_garbage() {
        assert!(matches!(
            bind("not-an-address").await,
            Err(ListenerError::Address { .. })
        ));
    }
}
