//! Varint length-delimited framing over a byte stream.

use std::io;

use bytes::BytesMut;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one frame; anything larger is a protocol violation.
const MAX_FRAME: u64 = 16 * 1024 * 1024;

/// Reads one length-delimited message.
///
/// Returns `Ok(None)` on a clean end of stream (no bytes of a new
/// frame read yet).
///
/// # Errors
///
/// Returns an I/O error for truncated frames, oversized frames or
/// undecodable bytes; framing errors close the connection.
pub async fn read_message<M, R>(reader: &mut R) -> io::Result<Option<M>>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let mut size: u64 = 0;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if first && e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        first = false;

        size |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame size varint too long",
            ));
        }
    }

    if size > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {size} bytes exceeds the limit"),
        ));
    }

    let mut buf = vec![0u8; size as usize];
    reader.read_exact(&mut buf).await?;

    M::decode(buf.as_slice())
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writes one length-delimited message and flushes.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub async fn write_message<M, W>(writer: &mut W, message: &M) -> io::Result<()>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(message.encoded_len() + 8);
    message
        .encode_length_delimited(&mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&buf).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CreateRequest, ContainerResponse};

    #[tokio::test]
    async fn round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let req = CreateRequest {
            name: "a.b.c".to_string(),
        };
        write_message(&mut client, &req).await.unwrap();

        let decoded: CreateRequest = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let got: Option<CreateRequest> = read_message(&mut server).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Announce 100 bytes, deliver 2, close.
        client.write_all(&[100, 0xAA, 0xBB]).await.unwrap();
        drop(client);

        let got: io::Result<Option<ContainerResponse>> = read_message(&mut server).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Varint for 1 GiB.
        client
            .write_all(&[0x80, 0x80, 0x80, 0x80, 0x04])
            .await
            .unwrap();

        let got: io::Result<Option<ContainerResponse>> = read_message(&mut server).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn multiple_frames_in_sequence() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        for name in ["a", "b", "c"] {
            write_message(
                &mut client,
                &CreateRequest {
                    name: name.to_string(),
                },
            )
            .await
            .unwrap();
        }
        drop(client);

        let mut names = Vec::new();
        while let Some(req) = read_message::<CreateRequest, _>(&mut server).await.unwrap() {
            names.push(req.name);
        }
        assert_eq!(names, ["a", "b", "c"]);
    }
}
