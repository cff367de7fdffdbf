use super::HealthChecker;
use crate::error::Result;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect timeout for a single TCP probe.
pub const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Ready once something accepts connections on the port.
pub struct TcpChecker {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpChecker {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            timeout: TCP_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self) -> Result<bool> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(_stream)) => Ok(true),
            Ok(Err(e)) => {
                tracing::trace!("TCP probe of {} failed: {}", self.addr, e);
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn target(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_is_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TcpChecker::new(port).check().await.unwrap());
    }

    #[tokio::test]
    async fn closed_port_is_not_ready() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let checker = TcpChecker::new(port);
        assert!(!checker.check().await.unwrap());
        assert_eq!(checker.target(), format!("tcp://127.0.0.1:{}", port));
    }
}
