//! # Wire Encoding
//!
//! Length-prefixed, size-bounded serialization for every RPC payload.
//!
//! A payload frame is `varint(len) ‖ bytes`, where `bytes` is the bincode
//! encoding of the message, optionally Snappy-compressed. Both directions
//! enforce [`MAX_CHUNK_SIZE`] on the *uncompressed* payload, so a peer can
//! never make us allocate more than the limit no matter what the length
//! prefix claims.
//!
//! The encoding in use is negotiated by topic suffix: `/bin` for plain
//! frames, `/bin_snappy` for compressed ones.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed size of an uncompressed request/response payload.
pub const MAX_CHUNK_SIZE: u64 = 1 << 20; // 1 MiB

/// Maximum bytes a varint length prefix may occupy (u64).
const MAX_VARINT_BYTES: usize = 10;

#[derive(Debug)]
pub enum CodecError {
    /// Payload exceeds [`MAX_CHUNK_SIZE`].
    TooLarge { size: u64, limit: u64 },
    /// Malformed varint length prefix.
    BadLengthPrefix,
    Serialize(bincode::Error),
    Deserialize(bincode::Error),
    Compression(snap::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::TooLarge { size, limit } => {
                write!(f, "payload of {size} bytes exceeds limit of {limit}")
            }
            CodecError::BadLengthPrefix => write!(f, "malformed length prefix"),
            CodecError::Serialize(e) => write!(f, "serialize: {e}"),
            CodecError::Deserialize(e) => write!(f, "deserialize: {e}"),
            CodecError::Compression(e) => write!(f, "compression: {e}"),
            CodecError::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_CHUNK_SIZE + 4096)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// The network encoding in use for RPC payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    Plain,
    #[default]
    Snappy,
}

impl Encoding {
    /// Suffix appended to every RPC topic.
    pub fn protocol_suffix(&self) -> &'static str {
        match self {
            Encoding::Plain => "/bin",
            Encoding::Snappy => "/bin_snappy",
        }
    }

    /// Serialize a message to its on-wire payload bytes (no length prefix).
    pub fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        let plain = bincode_options()
            .serialize(msg)
            .map_err(CodecError::Serialize)?;
        if plain.len() as u64 > MAX_CHUNK_SIZE {
            return Err(CodecError::TooLarge {
                size: plain.len() as u64,
                limit: MAX_CHUNK_SIZE,
            });
        }
        Ok(match self {
            Encoding::Plain => plain,
            Encoding::Snappy => snap::raw::Encoder::new()
                .compress_vec(&plain)
                .map_err(CodecError::Compression)?,
        })
    }

    /// Deserialize a message from on-wire payload bytes.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let plain = match self {
            Encoding::Plain => bytes.to_vec(),
            Encoding::Snappy => {
                let len = snap::raw::decompress_len(bytes).map_err(CodecError::Compression)?;
                if len as u64 > MAX_CHUNK_SIZE {
                    return Err(CodecError::TooLarge {
                        size: len as u64,
                        limit: MAX_CHUNK_SIZE,
                    });
                }
                snap::raw::Decoder::new()
                    .decompress_vec(bytes)
                    .map_err(CodecError::Compression)?
            }
        };
        if plain.len() as u64 > MAX_CHUNK_SIZE {
            return Err(CodecError::TooLarge {
                size: plain.len() as u64,
                limit: MAX_CHUNK_SIZE,
            });
        }
        bincode_options()
            .deserialize(&plain)
            .map_err(CodecError::Deserialize)
    }

    /// Write `msg` as a length-prefixed frame. Returns bytes written.
    pub async fn write_frame<W, T>(&self, writer: &mut W, msg: &T) -> Result<usize, CodecError>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let payload = self.encode(msg)?;
        let mut prefix = [0u8; MAX_VARINT_BYTES];
        let prefix_len = write_varint(&mut prefix, payload.len() as u64);
        writer.write_all(&prefix[..prefix_len]).await?;
        writer.write_all(&payload).await?;
        Ok(prefix_len + payload.len())
    }

    /// Read one length-prefixed frame and decode it.
    pub async fn read_frame<R, T>(&self, reader: &mut R) -> Result<T, CodecError>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let len = read_varint(reader).await?;
        // The prefix counts on-wire (possibly compressed) bytes; compressed
        // data within the limit can only decompress to at most the checked
        // decompress_len, verified in decode().
        if len > MAX_CHUNK_SIZE {
            return Err(CodecError::TooLarge {
                size: len,
                limit: MAX_CHUNK_SIZE,
            });
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        self.decode(&payload)
    }
}

/// Write a raw length-prefixed frame without serializing.
pub async fn write_raw_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() as u64 > MAX_CHUNK_SIZE {
        return Err(CodecError::TooLarge {
            size: payload.len() as u64,
            limit: MAX_CHUNK_SIZE,
        });
    }
    let mut prefix = [0u8; MAX_VARINT_BYTES];
    let prefix_len = write_varint(&mut prefix, payload.len() as u64);
    writer.write_all(&prefix[..prefix_len]).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one length-prefixed frame as raw bytes, bounded by
/// [`MAX_CHUNK_SIZE`].
pub async fn read_raw_frame<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint(reader).await?;
    if len > MAX_CHUNK_SIZE {
        return Err(CodecError::TooLarge {
            size: len,
            limit: MAX_CHUNK_SIZE,
        });
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// LEB128-encode `value` into `buf`, returning the encoded length.
fn write_varint(buf: &mut [u8; MAX_VARINT_BYTES], mut value: u64) -> usize {
    let mut i = 0;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf[i] = byte;
        i += 1;
        if value == 0 {
            return i;
        }
    }
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for _ in 0..MAX_VARINT_BYTES {
        let byte = reader.read_u8().await?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(CodecError::BadLengthPrefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        data: Vec<u8>,
        label: String,
    }

    fn sample() -> Sample {
        Sample {
            id: 7,
            data: vec![1, 2, 3, 4],
            label: "block".into(),
        }
    }

    #[test]
    fn encode_decode_both_encodings() {
        for enc in [Encoding::Plain, Encoding::Snappy] {
            let bytes = enc.encode(&sample()).unwrap();
            let back: Sample = enc.decode(&bytes).unwrap();
            assert_eq!(back, sample());
        }
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let huge = Sample {
            id: 0,
            data: vec![0u8; (MAX_CHUNK_SIZE + 10) as usize],
            label: String::new(),
        };
        assert!(matches!(
            Encoding::Plain.encode(&huge),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn garbage_rejected_on_decode() {
        let garbage = [0xde, 0xad, 0xbe, 0xef];
        assert!(Encoding::Snappy.decode::<Sample>(&garbage).is_err());
    }

    #[test]
    fn protocol_suffixes() {
        assert_eq!(Encoding::Plain.protocol_suffix(), "/bin");
        assert_eq!(Encoding::Snappy.protocol_suffix(), "/bin_snappy");
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        for enc in [Encoding::Plain, Encoding::Snappy] {
            let mut buf = Vec::new();
            enc.write_frame(&mut buf, &sample()).await.unwrap();
            let mut cursor = std::io::Cursor::new(buf);
            let back: Sample = enc.read_frame(&mut cursor).await.unwrap();
            assert_eq!(back, sample());
        }
    }

    #[tokio::test]
    async fn frame_rejects_oversized_prefix() {
        let mut buf = [0u8; MAX_VARINT_BYTES];
        let n = write_varint(&mut buf, MAX_CHUNK_SIZE + 1);
        let mut cursor = std::io::Cursor::new(buf[..n].to_vec());
        assert!(matches!(
            Encoding::Plain.read_frame::<_, Sample>(&mut cursor).await,
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let mut buf = Vec::new();
        Encoding::Plain.write_frame(&mut buf, &sample()).await.unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            Encoding::Plain.read_frame::<_, Sample>(&mut cursor).await,
            Err(CodecError::Io(_))
        ));
    }

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = [0u8; MAX_VARINT_BYTES];
            let n = write_varint(&mut buf, value);
            let decoded = futures_block(read_varint(&mut std::io::Cursor::new(buf[..n].to_vec())));
            assert_eq!(decoded.unwrap(), value);
        }
    }

    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
