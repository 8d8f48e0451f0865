//! Integration tests for the TCP transport.
//!
//! These spin up a real listener on an OS-assigned port and verify that
//! bytes flow through the split halves in both directions.

#[cfg(feature = "tcp")]
mod tcp {
    use relaymq_transport::{Connection, TcpTransport, Transport, TransportError};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_tcp_accept_and_exchange_bytes() {
        let mut transport = TcpTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("should have local addr");

        let server_handle =
            tokio::spawn(async move { transport.accept().await.expect("should accept") });

        let mut client = TcpStream::connect(addr).await.expect("client should connect");
        let server_conn = server_handle.await.expect("task should complete");

        assert_eq!(server_conn.id().get(), 1);
        assert!(server_conn.peer_addr().is_some());

        let (mut reader, mut writer) = server_conn.into_split();

        client.write_all(&[0xC0, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xC0, 0x00]);

        writer.write_all(&[0xD0, 0x00]).await.unwrap();
        writer.flush().await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xD0, 0x00]);
    }

    #[tokio::test]
    async fn test_tcp_connection_ids_are_sequential() {
        let mut transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();

        let accepts = tokio::spawn(async move {
            let a = transport.accept().await.unwrap();
            let b = transport.accept().await.unwrap();
            (a.id().get(), b.id().get())
        });

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();

        let (a, b) = accepts.await.unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn test_tcp_bind_in_use_reports_address() {
        let first = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();

        let err = TcpTransport::bind(&addr).await.err().expect("port is taken");
        match err {
            TransportError::Bind { addr: reported, .. } => assert_eq!(reported, addr),
            other => panic!("expected Bind, got {other:?}"),
        }
    }
}
