use serde::Serialize;
use tokio::net::UdpSocket;

/// Port the Alpaca discovery protocol reserves.
pub const DEFAULT_DISCOVERY_PORT: u16 = 32227;

const DISCOVERY_MSG: &[u8] = b"alpacadiscovery1";

#[derive(Serialize)]
struct AlpacaPort {
    #[serde(rename = "AlpacaPort")]
    alpaca_port: u16,
}

/// UDP responder that tells discovery clients which TCP port the Alpaca
/// server listens on.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryServer {
    /// Port of the running Alpaca server.
    pub alpaca_port: u16,
    /// Discovery port to listen on; defaults to 32227.
    pub discovery_port: u16,
}

impl DiscoveryServer {
    pub const fn new(alpaca_port: u16) -> Self {
        Self {
            alpaca_port,
            discovery_port: DEFAULT_DISCOVERY_PORT,
        }
    }

    #[tracing::instrument(err)]
    pub async fn start(self) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.discovery_port)).await?;
        tracing::info!(port = self.discovery_port, "discovery server listening");
        self.serve(socket).await
    }

    async fn serve(self, socket: UdpSocket) -> anyhow::Result<()> {
        let response = serde_json::to_string(&AlpacaPort {
            alpaca_port: self.alpaca_port,
        })?;

        let mut buf = [0_u8; 64];
        loop {
            let (len, src) = socket.recv_from(&mut buf).await?;
            if &buf[..len] == DISCOVERY_MSG {
                tracing::debug!(%src, "discovery request");
                anyhow::ensure!(
                    socket.send_to(response.as_bytes(), src).await? == response.len(),
                    "failed to send discovery response"
                );
            } else {
                tracing::warn!(%src, "unknown discovery packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responds_to_the_discovery_payload() {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.expect("bind");
        let addr = socket.local_addr().expect("addr");
        let server = DiscoveryServer::new(4567);
        let task = tokio::spawn(async move { server.serve(socket).await });

        let client = UdpSocket::bind(("127.0.0.1", 0)).await.expect("bind");
        client.send_to(DISCOVERY_MSG, addr).await.expect("send");

        let mut buf = [0_u8; 64];
        let (len, _) = client.recv_from(&mut buf).await.expect("recv");
        assert_eq!(&buf[..len], br#"{"AlpacaPort":4567}"#);

        task.abort();
    }

    #[tokio::test]
    async fn ignores_unknown_payloads() {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.expect("bind");
        let addr = socket.local_addr().expect("addr");
        let task = tokio::spawn(async move { DiscoveryServer::new(1).serve(socket).await });

        let client = UdpSocket::bind(("127.0.0.1", 0)).await.expect("bind");
        client.send_to(b"who goes there", addr).await.expect("send");
        client.send_to(DISCOVERY_MSG, addr).await.expect("send");

        // Only the well-formed request gets an answer.
        let mut buf = [0_u8; 64];
        let (len, _) = client.recv_from(&mut buf).await.expect("recv");
        assert_eq!(&buf[..len], br#"{"AlpacaPort":1}"#);

        task.abort();
    }
}
