//! Streaming encryption for large files.
//!
//! This module provides chunk-based encryption over `AsyncRead` so that
//! objects of any size can be piped between storage backends without being
//! held in memory. Each chunk is independently authenticated.
//!
//! # Format
//! - Header: version (1 byte) + chunk_size (4 bytes, LE)
//! - Frames: final flag (1 byte) + sealed length (4 bytes, LE) + sealed chunk
//!
//! A sealed chunk is nonce || ciphertext || tag with the chunk index and the
//! final flag as associated data, so truncation, reordering and dropped
//! frames are all detected. The last frame carries the final flag and may
//! be empty.

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

use crate::aead::{open_chunk, seal_chunk, NONCE_SIZE, TAG_SIZE};
use crate::keys::DataKey;
use vaultferry_common::{Error, Result};

/// Default chunk size for streaming encryption (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk size accepted from a stream header (16 MiB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Header size: version (1) + chunk_size (4).
pub const HEADER_SIZE: usize = 5;

/// Stream encryption version.
pub const STREAM_VERSION: u8 = 2;

const FRAME_HEADER_SIZE: usize = 5;
const FLAG_FINAL: u8 = 1;

/// Reader returned by [`encrypt_reader`] and [`decrypt_reader`].
pub type CipherReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Body,
    Done,
}

struct EncryptState<R> {
    reader: R,
    key: DataKey,
    chunk_size: usize,
    index: u64,
    stage: Stage,
}

struct DecryptState<R> {
    reader: R,
    key: DataKey,
    chunk_size: usize,
    index: u64,
    stage: Stage,
}

fn chunk_aad(index: u64, flag: u8) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_le_bytes());
    aad[8] = flag;
    aad
}

fn crypto_io(message: impl Into<String>) -> io::Error {
    Error::Crypto(message.into()).into_io()
}

/// Read until `buf` is full or the reader is exhausted.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn read_exact_or_truncated<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> io::Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(crypto_io(format!("Encrypted stream truncated in {}", what)))
        }
        Err(e) => Err(e),
    }
}

/// Wrap `reader` so that reading from the result yields ciphertext.
///
/// # Errors
/// - `InvalidArgument` if `chunk_size` is zero or above [`MAX_CHUNK_SIZE`]
///
/// Read errors from `reader` are passed through unchanged; encryption
/// failures surface as read errors carrying an [`Error::Crypto`].
pub fn encrypt_reader<R>(reader: R, key: DataKey, chunk_size: usize) -> Result<CipherReader>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    check_chunk_size(chunk_size)?;

    let state = EncryptState {
        reader,
        key,
        chunk_size,
        index: 0,
        stage: Stage::Header,
    };

    Ok(StreamReader::new(stream::try_unfold(state, next_sealed).boxed()))
}

async fn next_sealed<R>(mut st: EncryptState<R>) -> io::Result<Option<(Bytes, EncryptState<R>)>>
where
    R: AsyncRead + Unpin,
{
    match st.stage {
        Stage::Header => {
            let mut header = BytesMut::with_capacity(HEADER_SIZE);
            header.put_u8(STREAM_VERSION);
            header.put_u32_le(st.chunk_size as u32);
            st.stage = Stage::Body;
            Ok(Some((header.freeze(), st)))
        }
        Stage::Body => {
            let mut chunk = vec![0u8; st.chunk_size];
            let n = read_full(&mut st.reader, &mut chunk).await?;
            let flag = if n < st.chunk_size { FLAG_FINAL } else { 0 };

            let sealed = seal_chunk(st.key.as_bytes(), &chunk_aad(st.index, flag), &chunk[..n])
                .map_err(Error::into_io)?;

            let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + sealed.len());
            frame.put_u8(flag);
            frame.put_u32_le(sealed.len() as u32);
            frame.extend_from_slice(&sealed);

            st.index += 1;
            if flag == FLAG_FINAL {
                st.stage = Stage::Done;
            }
            Ok(Some((frame.freeze(), st)))
        }
        Stage::Done => Ok(None),
    }
}

/// Wrap `reader` (ciphertext from [`encrypt_reader`]) so that reading from
/// the result yields the original plaintext.
///
/// Every chunk is authenticated before it is released. A stream that ends
/// before its final frame, carries data after it, or fails authentication
/// produces a read error carrying an [`Error::Crypto`].
pub fn decrypt_reader<R>(reader: R, key: DataKey) -> CipherReader
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let state = DecryptState {
        reader,
        key,
        chunk_size: 0,
        index: 0,
        stage: Stage::Header,
    };

    StreamReader::new(stream::try_unfold(state, next_opened).boxed())
}

async fn next_opened<R>(mut st: DecryptState<R>) -> io::Result<Option<(Bytes, DecryptState<R>)>>
where
    R: AsyncRead + Unpin,
{
    if st.stage == Stage::Header {
        let mut header = [0u8; HEADER_SIZE];
        read_exact_or_truncated(&mut st.reader, &mut header, "header").await?;
        if header[0] != STREAM_VERSION {
            return Err(crypto_io(format!("Unsupported stream version: {}", header[0])));
        }
        let chunk_size = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(crypto_io(format!("Invalid chunk size in header: {}", chunk_size)));
        }
        st.chunk_size = chunk_size;
        st.stage = Stage::Body;
    }

    if st.stage == Stage::Done {
        return Ok(None);
    }

    let mut frame_header = [0u8; FRAME_HEADER_SIZE];
    read_exact_or_truncated(&mut st.reader, &mut frame_header, "frame header").await?;

    let flag = frame_header[0];
    if flag > FLAG_FINAL {
        return Err(crypto_io(format!("Invalid frame flag: {}", flag)));
    }
    let sealed_len = u32::from_le_bytes([
        frame_header[1],
        frame_header[2],
        frame_header[3],
        frame_header[4],
    ]) as usize;
    if sealed_len < NONCE_SIZE + TAG_SIZE || sealed_len > NONCE_SIZE + st.chunk_size + TAG_SIZE {
        return Err(crypto_io(format!("Invalid frame length: {}", sealed_len)));
    }

    let mut sealed = vec![0u8; sealed_len];
    read_exact_or_truncated(&mut st.reader, &mut sealed, "frame body").await?;

    let plaintext = open_chunk(st.key.as_bytes(), &chunk_aad(st.index, flag), &sealed)
        .map_err(|_| crypto_io(format!("Chunk {} failed authentication", st.index)))?;
    st.index += 1;

    if flag == FLAG_FINAL {
        let mut probe = [0u8; 1];
        if st.reader.read(&mut probe).await? != 0 {
            return Err(crypto_io("Unexpected data after final chunk"));
        }
        st.stage = Stage::Done;
        if plaintext.is_empty() {
            return Ok(None);
        }
    }

    Ok(Some((Bytes::from(plaintext), st)))
}

fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(Error::InvalidArgument(format!(
            "chunk size must be between 1 and {} bytes, got {}",
            MAX_CHUNK_SIZE, chunk_size
        )));
    }
    Ok(())
}
