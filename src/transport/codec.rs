//! Multipart frame codec
//!
//! ```text
//! +-----------+-----------+---------+-----------+---------+----
//! | count u32 | len_0 u32 | part_0  | len_1 u32 | part_1  | ...
//! +-----------+-----------+---------+-----------+---------+----
//! ```
//!
//! All integers are big-endian. A frame always has at least one part.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::constants::MAX_PARTS;

/// One multipart message
pub type Multipart = Vec<Bytes>;

/// Check that a message can be read back by a peer using `max_part_size`
pub fn check(parts: &[Bytes], max_part_size: usize) -> Result<()> {
    if parts.is_empty() || parts.len() > MAX_PARTS as usize {
        return Err(Error::MessageTooLarge(format!(
            "{} parts, expected 1 to {}",
            parts.len(),
            MAX_PARTS
        )));
    }

    if let Some(part) = parts.iter().find(|p| p.len() > max_part_size) {
        return Err(Error::MessageTooLarge(format!(
            "part of {} bytes exceeds limit of {}",
            part.len(),
            max_part_size
        )));
    }

    Ok(())
}

/// Encode a multipart message into one contiguous buffer
///
/// The buffer is shared by reference counting when the same message is
/// written to several connections. Messages a peer with the same
/// `max_part_size` would reject are refused here.
pub fn encode(parts: &[Bytes], max_part_size: usize) -> Result<Bytes> {
    check(parts, max_part_size)?;

    let size = 4 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);

    buf.put_u32(parts.len() as u32);
    for part in parts {
        buf.put_u32(part.len() as u32);
        buf.put_slice(part);
    }

    Ok(buf.freeze())
}

/// Read one multipart message
///
/// Returns `Ok(None)` when the stream ends cleanly before a new message.
pub async fn read_multipart<R>(reader: &mut R, max_part_size: usize) -> Result<Option<Multipart>>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(count) => count,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if count == 0 || count > MAX_PARTS {
        return Err(Error::decode(format!("invalid part count {}", count)));
    }

    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > max_part_size {
            return Err(Error::decode(format!(
                "part of {} bytes exceeds limit of {}",
                len, max_part_size
            )));
        }

        let mut part = vec![0u8; len];
        reader.read_exact(&mut part).await?;
        parts.push(Bytes::from(part));
    }

    Ok(Some(parts))
}

/// Write one multipart message
pub async fn write_multipart<W>(writer: &mut W, parts: &[Bytes], max_part_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(parts, max_part_size)?;
    writer.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_written_frames_in_order() {
        let mut wire = Vec::new();
        write_multipart(
            &mut wire,
            &[Bytes::from_static(b"STATUS"), Bytes::from_static(b"{}")],
            1024,
        )
        .await
        .unwrap();
        write_multipart(&mut wire, &[Bytes::new()], 1024).await.unwrap();

        let mut reader = &wire[..];
        let first = read_multipart(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(first, vec![Bytes::from_static(b"STATUS"), Bytes::from_static(b"{}")]);

        let second = read_multipart(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(second, vec![Bytes::new()]);

        assert!(read_multipart(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_part_over_limit_is_rejected() {
        let wire = encode(&[Bytes::from(vec![7u8; 100])], 1024).unwrap();
        let mut reader = &wire[..];
        let result = read_multipart(&mut reader, 10).await;
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn test_encode_refuses_what_peers_reject() {
        let big = Bytes::from(vec![0u8; 4096]);
        assert!(matches!(encode(&[big.clone()], 1024), Err(Error::MessageTooLarge(_))));
        assert!(encode(&[big], 4096).is_ok());

        assert!(matches!(encode(&[], 1024), Err(Error::MessageTooLarge(_))));
        let many = vec![Bytes::new(); MAX_PARTS as usize + 1];
        assert!(matches!(encode(&many, 1024), Err(Error::MessageTooLarge(_))));
    }

    #[tokio::test]
    async fn test_zero_parts_is_rejected() {
        let wire = [0u8, 0, 0, 0];
        let mut reader = &wire[..];
        assert!(read_multipart(&mut reader, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let wire = encode(&[Bytes::from_static(b"hello")], 1024).unwrap();
        let mut reader = &wire[..wire.len() - 2];
        assert!(matches!(read_multipart(&mut reader, 1024).await, Err(Error::Io(_))));
    }
}
