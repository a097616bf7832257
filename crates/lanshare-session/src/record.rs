//! Length-prefixed record I/O.
//!
//! `u32_le length ∥ body`, with `4 ≤ length < 100 000` enforced before the
//! body buffer is allocated. EOF exactly on a record boundary is an orderly
//! close; EOF inside the length or the body is a protocol error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use lanshare_proto::frame::check_record_len;

use crate::SessionError;

/// Read one record. `Ok(None)` is an orderly close.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<Vec<u8>>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];

    // The first length byte decides between orderly close and truncation.
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut len_buf[1..])
        .await
        .map_err(map_eof)?;

    let len = u32::from_le_bytes(len_buf);
    check_record_len(len)?;

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(map_eof)?;
    Ok(Some(body))
}

/// Write one record, bounds-checked.
pub async fn write_record<W>(writer: &mut W, body: &[u8]) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    check_record_len(body.len() as u32)?;
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

fn map_eof(e: std::io::Error) -> SessionError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        SessionError::UnexpectedEof
    } else {
        SessionError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_proto::FrameError;

    #[tokio::test]
    async fn roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_record(&mut a, b"hello world").await.unwrap();
        let got = read_record(&mut b).await.unwrap().unwrap();
        assert_eq!(got, b"hello world");
    }

    #[tokio::test]
    async fn orderly_close_between_records() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_record(&mut a, b"only").await.unwrap();
        drop(a);
        assert!(read_record(&mut b).await.unwrap().is_some());
        assert!(read_record(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_length_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut a, &[5u8, 0])
            .await
            .unwrap();
        drop(a);
        assert!(matches!(
            read_record(&mut b).await,
            Err(SessionError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn eof_inside_body_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut a, &10u32.to_le_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, b"short")
            .await
            .unwrap();
        drop(a);
        assert!(matches!(
            read_record(&mut b).await,
            Err(SessionError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn out_of_range_length_is_fatal() {
        for len in [0u32, 3, 100_000, u32::MAX] {
            let (mut a, mut b) = tokio::io::duplex(1024);
            tokio::io::AsyncWriteExt::write_all(&mut a, &len.to_le_bytes())
                .await
                .unwrap();
            let err = read_record(&mut b).await.unwrap_err();
            assert!(
                matches!(err, SessionError::Frame(FrameError::LengthOutOfRange(l)) if l == len)
            );
        }
    }

    #[tokio::test]
    async fn oversized_write_is_refused() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let body = vec![0u8; 100_000];
        assert!(write_record(&mut a, &body).await.is_err());
    }
}
