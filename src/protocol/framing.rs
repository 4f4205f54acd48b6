use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame ceiling, comfortably above the hosted-tasks batch budget.
pub const MAX_FRAME_SIZE: usize = 0x2000000;

/// Object-safe stream bound used by listeners so plain TCP and TLS
/// connections share one pump loop.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Write one length-prefixed frame: u32 big-endian length, then the payload.
pub async fn send_frame<S>(stream: &mut S, data: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

/// Read one length-prefixed frame.
pub async fn recv_frame<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut buffer = BytesMut::zeroed(len);
    stream.read_exact(&mut buffer).await?;
    Ok(buffer.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        send_frame(&mut client, b"hello frames").await.unwrap();
        let received = recv_frame(&mut server).await.unwrap();
        assert_eq!(received, b"hello frames");
    }

    #[tokio::test]
    async fn empty_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        send_frame(&mut client, b"").await.unwrap();
        let received = recv_frame(&mut server).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_u32(&mut client, u32::MAX)
            .await
            .unwrap();
        assert!(recv_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn sequential_frames_preserved() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        send_frame(&mut client, b"first").await.unwrap();
        send_frame(&mut client, b"second").await.unwrap();
        assert_eq!(recv_frame(&mut server).await.unwrap(), b"first");
        assert_eq!(recv_frame(&mut server).await.unwrap(), b"second");
    }
}
