//! Length-prefixed framing shared by the evaluator socket and the editor socket.
//!
//! Format: six lowercase hex ASCII digits carrying the payload length in bytes,
//! followed immediately by the payload.
//!
//! ```text
//! 00000d(:return nil 1)
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Number of hex digits in a frame header
pub const HEADER_LENGTH: usize = 6;

/// Largest payload a six-digit header can describe
pub const MAX_PAYLOAD_LENGTH: usize = 0xFF_FFFF;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream before a full header or payload arrived
    #[error("Socket connection closed")]
    ConnectionClosed,

    #[error("Invalid frame header: {0:?}")]
    InvalidHeader(String),

    #[error("Frame payload of {0} bytes exceeds the 0xFFFFFF limit")]
    PayloadTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prefix `payload` with its six-digit hex length.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LENGTH {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut framed = Vec::with_capacity(HEADER_LENGTH + payload.len());
    framed.extend_from_slice(format!("{:06x}", payload.len()).as_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Read exactly one header and return the declared payload length.
pub async fn decode_header<R>(reader: &mut R) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LENGTH];
    fill(reader, &mut header).await?;
    parse_header(&header)
}

/// Read exactly `length` payload bytes, looping over partial reads.
pub async fn decode_payload<R>(reader: &mut R, length: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; length];
    fill(reader, &mut payload).await?;
    Ok(payload)
}

/// Read one complete frame and return its payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let length = decode_header(reader).await?;
    decode_payload(reader, length).await
}

/// Frame `payload` and write it, flushing immediately.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let framed = encode(payload)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

fn parse_header(header: &[u8]) -> Result<usize, FrameError> {
    let invalid = || FrameError::InvalidHeader(String::from_utf8_lossy(header).into_owned());
    // from_str_radix tolerates a leading sign, the wire format does not
    if !header.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }
    let text = std::str::from_utf8(header).map_err(|_| invalid())?;
    usize::from_str_radix(text, 16).map_err(|_| invalid())
}

// A zero-byte read before `buf` is full means the peer is gone; never hand back
// a short buffer.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio_test::io::Builder;

    #[test]
    fn encode_prefixes_lowercase_hex_length() {
        let framed = encode(b"(:return (:ok nil) 1)").unwrap();

        assert_eq!(&framed[..HEADER_LENGTH], b"000015");
        assert_eq!(&framed[HEADER_LENGTH..], b"(:return (:ok nil) 1)");
    }

    #[test]
    fn encode_uses_lowercase_digits() {
        let payload = vec![b'x'; 0xab];
        let framed = encode(&payload).unwrap();

        assert_eq!(&framed[..HEADER_LENGTH], b"0000ab");
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_LENGTH + 1];

        assert!(matches!(
            encode(&payload),
            Err(FrameError::PayloadTooLarge(len)) if len == MAX_PAYLOAD_LENGTH + 1
        ));
    }

    #[tokio::test]
    async fn read_frame_returns_encoded_payload() {
        let payload = "(swank:connection-info) \"ünïcode\"".as_bytes();
        let framed = encode(payload).unwrap();

        let mut reader = framed.as_slice();
        let decoded = read_frame(&mut reader).await.unwrap();

        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn payload_is_reassembled_from_small_chunks() {
        let mut reader = Builder::new()
            .read(b"0")
            .read(b"0000")
            .read(b"b")
            .read(b"hel")
            .read(b"lo")
            .read(b" ")
            .read(b"wor")
            .read(b"ld")
            .build();

        let decoded = read_frame(&mut reader).await.unwrap();

        assert_eq!(decoded, b"hello world");
    }

    #[tokio::test]
    async fn eof_inside_header_is_connection_closed() {
        let mut reader = Builder::new().read(b"000").build();

        let result = decode_header(&mut reader).await;

        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn eof_before_any_header_byte_is_connection_closed() {
        let mut reader: &[u8] = b"";

        let result = decode_header(&mut reader).await;

        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn eof_inside_payload_is_connection_closed() {
        let mut reader = Builder::new().read(b"00000a").read(b"short").build();

        let result = read_frame(&mut reader).await;

        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[rstest]
    #[case::non_hex(b"00zz01")]
    #[case::leading_plus(b"+00001")]
    #[case::whitespace(b" 00001")]
    #[tokio::test]
    async fn malformed_header_is_rejected(#[case] header: &'static [u8]) {
        let mut reader = header;

        let result = decode_header(&mut reader).await;

        assert!(matches!(result, Err(FrameError::InvalidHeader(_))));
    }

    #[tokio::test]
    async fn uppercase_header_digits_are_accepted() {
        let mut reader: &[u8] = b"00000A0123456789";

        assert_eq!(decode_header(&mut reader).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn write_frame_writes_header_then_payload() {
        let mut buffer = Vec::new();

        write_frame(&mut buffer, b"result").await.unwrap();

        assert_eq!(buffer, b"000006result");
    }
}
