//! Safe TCP bind/connect/read/write helper functions.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::ShardsetError;

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(obj)` if successful; upon returning, the consumed bytes are
///     discarded from the read buffer
///   - `Err(err)` if the connection closed or any unexpected error occurs
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function is intended to be used as a `tokio::select!` branch
/// and those two methods are not cancellation-safe. In the case of being
/// cancelled midway (only possible at `.await` points), bytes already read
/// stay in the read buffer and will be appended to by future invocations
/// until a whole object is received.
pub(crate) async fn recv_msg<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, ShardsetError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    if read_buf.capacity() < 8 {
        read_buf.reserve(8 - read_buf.capacity());
    }
    while read_buf.len() < 8 {
        // obj_len not wholesomely read from socket before last cancellation
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(ShardsetError::msg("connection closed"));
        }
    }
    let obj_len = u64::from_be_bytes(read_buf[..8].try_into().unwrap());

    // then read the obj itself
    let obj_end = 8 + obj_len as usize;
    if read_buf.capacity() < obj_end {
        // capacity not big enough, reserve more space
        read_buf.reserve(obj_end - read_buf.capacity());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(ShardsetError::msg("connection closed"));
        }
    }
    let obj = rmp_serde::decode::from_slice(&read_buf[8..obj_end])?;

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead); discard bytes
    // used in this call
    if read_buf.len() > obj_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[obj_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }

    Ok(obj)
}

/// Sends an object of type `T` through TCP writable connection `conn_write`,
/// length-prefixed. Each connection is written to by exactly one task, so
/// the write side needs none of the read side's cancellation gymnastics.
pub(crate) async fn send_msg<T, Conn>(
    obj: &T,
    conn_write: &mut Conn,
) -> Result<(), ShardsetError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = rmp_serde::encode::to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?;
    conn_write.write_all(&obj_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, ShardsetError> {
    loop {
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that bounds the attempt with a
/// timeout, so that an unreachable peer surfaces as a retryable failure
/// instead of hanging the caller.
pub(crate) async fn tcp_connect_with_timeout(
    conn_addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream, ShardsetError> {
    let stream = time::timeout(timeout, TcpStream::connect(conn_addr)).await??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        seq: u64,
        body: String,
    }

    #[tokio::test]
    async fn send_recv_roundtrip() -> Result<(), ShardsetError> {
        let listener = tcp_bind_with_retry("127.0.0.1:54800".parse()?, 0).await?;
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut read_buf = BytesMut::with_capacity(8 + 1024);
            let msg: TestMsg = recv_msg(&mut read_buf, &mut conn).await.unwrap();
            send_msg(
                &TestMsg {
                    seq: msg.seq + 1,
                    body: msg.body,
                },
                &mut conn,
            )
            .await
            .unwrap();
        });

        let mut conn =
            tcp_connect_with_timeout("127.0.0.1:54800".parse()?, Duration::from_secs(2)).await?;
        send_msg(
            &TestMsg {
                seq: 7,
                body: "migrate".into(),
            },
            &mut conn,
        )
        .await?;
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let reply: TestMsg = recv_msg(&mut read_buf, &mut conn).await?;
        assert_eq!(
            reply,
            TestMsg {
                seq: 8,
                body: "migrate".into(),
            }
        );
        server.await.map_err(ShardsetError::msg)?;
        Ok(())
    }

    #[tokio::test]
    async fn recv_on_closed() -> Result<(), ShardsetError> {
        let listener = tcp_bind_with_retry("127.0.0.1:54801".parse()?, 0).await?;
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            drop(conn);
        });

        let mut conn =
            tcp_connect_with_timeout("127.0.0.1:54801".parse()?, Duration::from_secs(2)).await?;
        let mut read_buf = BytesMut::with_capacity(8);
        let got: Result<TestMsg, _> = recv_msg(&mut read_buf, &mut conn).await;
        assert!(got.is_err());
        server.await.map_err(ShardsetError::msg)?;
        Ok(())
    }
}
