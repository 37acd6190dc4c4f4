//! 服务端 TCP 处理

use crate::crypto::CipherSuite;
use crate::relay::relay_server_to_remote;
use crate::transport::{Listener, TcpDialer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 循环接受入站连接，每个连接解开加密层后交给服务端中继
pub async fn serve(mut listener: Listener, cipher: CipherSuite, tcp: TcpDialer, token: CancellationToken) {
    let local = listener.local_addr();
    loop {
        let (conn, peer) = tokio::select! {
            _ = token.cancelled() => break,
            r = listener.accept() => match r {
                Ok(v) => v,
                Err(e) => {
                    warn!("server on {} stopped accepting: {}", local, e);
                    break;
                }
            }
        };
        let stream = cipher.wrap_stream(conn);
        let tcp = tcp.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_server_to_remote(stream, &tcp).await {
                debug!("server session with {} ended: {}", peer, e);
            }
        });
    }
    listener.close();
    info!("Shadowsocks server on {} stopped", local);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportKind, TransportOptions};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_garbage_does_not_stop_server() {
        let token = CancellationToken::new();
        let listener = Listener::bind(TransportKind::Tcp, "127.0.0.1:0", &TransportOptions::default())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let cipher = CipherSuite::new("aes-256-gcm", "pw").unwrap();
        tokio::spawn(serve(listener, cipher, TcpDialer::default(), token.clone()));

        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(&[0u8; 128]).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(bad.read(&mut buf).await.unwrap_or(0), 0);

        assert!(TcpStream::connect(addr).await.is_ok());
        token.cancel();
    }
}
