//! A real TCP listener speaking the length-prefixed frame format.

use crate::types::Endpoint;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Echoes every frame back on loopback until dropped.
pub(crate) struct MockServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream));
            }
        });
        Self { addr, handle }
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        self.addr.into()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream) {
    loop {
        let Ok(len) = stream.read_u32().await else {
            return;
        };
        let mut payload = vec![0u8; len as usize];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }
        if stream.write_u32(len).await.is_err() || stream.write_all(&payload).await.is_err() {
            return;
        }
    }
}
