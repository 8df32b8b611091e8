//! Copy loops shared by the adapters.
//!
//! Both loops attribute a failure to the side it happened on: errors from
//! the input keep their original kind (a transform failure stays a
//! `Crypto` error), errors from the output become `WriteFailed`.

use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use vaultferry_common::{Error, IoDirection, Result};

/// Buffer size used by the copy loops.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Copy `reader` into `writer` until EOF, then flush.
///
/// The writer is not shut down; committing the output is up to the caller.
pub async fn copy_to_writer<R, W>(reader: &mut R, writer: &mut W, context: &str) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| Error::from_io(e, context, IoDirection::Read))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| write_failed(e, context))?;
        total += n as u64;
    }

    writer.flush().await.map_err(|e| write_failed(e, context))?;
    Ok(total)
}

/// Blocking counterpart of [`copy_to_writer`] for sessions that only offer
/// `std::io` handles.
pub fn copy_blocking<R, W>(reader: &mut R, writer: &mut W, context: &str) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from_io(e, context, IoDirection::Read)),
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).map_err(|e| write_failed(e, context))?;
        total += n as u64;
    }

    writer.flush().map_err(|e| write_failed(e, context))?;
    Ok(total)
}

fn write_failed(err: std::io::Error, context: &str) -> Error {
    match Error::from_io(err, context, IoDirection::Write) {
        // The target directory vanished mid-write.
        Error::NotFound(msg) => Error::WriteFailed(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(Error::Crypto("bad chunk".to_string()).into_io())
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_async_copy_counts_bytes() {
        let data = vec![3u8; COPY_BUFFER_SIZE * 2 + 17];
        let mut reader = Cursor::new(data.clone());
        let mut out = Vec::new();

        let copied = copy_to_writer(&mut reader, &mut out, "copy").await.unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_blocking_copy_preserves_upstream_error() {
        let mut out = Vec::new();
        let err = copy_blocking(&mut FailingReader, &mut out, "copy").unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn test_blocking_copy_write_failure() {
        let mut reader = Cursor::new(vec![1u8; 10]);
        let err = copy_blocking(&mut reader, &mut FailingWriter, "copy").unwrap_err();
        assert!(matches!(err, Error::WriteFailed(_)));
    }
}
