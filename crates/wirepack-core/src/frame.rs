//! Wire Frame Codec
//!
//! A frame is the unit of transmission between the edge agent and the
//! collector:
//!
//! ```text
//! ┌─────────────────────┬────────────────────────┬──────────────────────┐
//! │  hdr_len  (u16 BE)  │   header_json bytes    │   payload bytes      │
//! └─────────────────────┴────────────────────────┴──────────────────────┘
//! ```
//!
//! The header is canonical JSON: [`FrameHeader`]'s fields are declared in
//! lexicographic order, and `serde_json` emits struct fields in declaration
//! order, so the encoded header has sorted keys with no further work. The
//! payload is the compressed batch; its exact length travels in the header
//! as `comp_len` and the reader consumes exactly that many bytes.
//!
//! Any short read, bad length prefix, or header that fails validation is a
//! [`Error::FrameProtocol`] and callers must close the connection. A clean
//! close *between* frames is not an error; [`read_frame`] reports it as
//! `Ok(None)`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::validate::{is_valid_topic, DICT_ID_LIMIT, MAX_BATCH_BYTES};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on the encoded header; anything larger is a protocol error.
pub const MAX_HEADER_BYTES: usize = 10 * 1024;

/// Self-describing frame header.
///
/// Unknown fields are rejected rather than preserved: the wire contract is a
/// fixed record, not an open map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameHeader {
    /// Exact payload length in bytes.
    pub comp_len: u64,
    /// Records in the batch, always >= 1.
    pub count: u32,
    /// Dictionary version the payload was compressed against (0 = none).
    pub dict_id: u32,
    /// Compressor level, informational.
    pub level: i32,
    /// Exact length of the joined canonical batch.
    pub raw_len: u64,
    /// Validated topic name.
    pub topic: String,
    /// Protocol version.
    pub v: u32,
}

impl FrameHeader {
    /// Range- and invariant-check a parsed header.
    pub fn validate(&self) -> Result<()> {
        if self.v != PROTOCOL_VERSION {
            return Err(Error::FrameProtocol(format!(
                "unsupported protocol version {}",
                self.v
            )));
        }
        if !is_valid_topic(&self.topic) {
            return Err(Error::FrameProtocol(format!(
                "invalid topic '{}'",
                self.topic
            )));
        }
        if self.dict_id >= DICT_ID_LIMIT {
            return Err(Error::FrameProtocol(format!(
                "dict_id {} out of range",
                self.dict_id
            )));
        }
        if self.count < 1 {
            return Err(Error::FrameProtocol("count must be >= 1".into()));
        }
        // A batch of N records carries N-1 separators, so raw_len can never
        // be smaller than count - 1.
        if self.raw_len < u64::from(self.count) - 1 {
            return Err(Error::FrameProtocol(format!(
                "raw_len {} impossible for count {}",
                self.raw_len, self.count
            )));
        }
        if self.raw_len > MAX_BATCH_BYTES as u64 {
            return Err(Error::FrameProtocol(format!(
                "raw_len {} exceeds batch limit",
                self.raw_len
            )));
        }
        if self.comp_len > MAX_BATCH_BYTES as u64 {
            return Err(Error::FrameProtocol(format!(
                "comp_len {} exceeds batch limit",
                self.comp_len
            )));
        }
        Ok(())
    }
}

/// Encode a frame for the wire.
///
/// `header.comp_len` must equal `payload.len()`; the mismatch is caught here
/// rather than discovered by the peer.
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Result<Bytes> {
    header.validate()?;
    if header.comp_len != payload.len() as u64 {
        return Err(Error::FrameProtocol(format!(
            "comp_len {} does not match payload length {}",
            header.comp_len,
            payload.len()
        )));
    }
    let hdr = serde_json::to_vec(header).map_err(|e| Error::FrameProtocol(e.to_string()))?;
    if hdr.len() > MAX_HEADER_BYTES {
        return Err(Error::FrameProtocol(format!(
            "encoded header of {} bytes exceeds {} byte limit",
            hdr.len(),
            MAX_HEADER_BYTES
        )));
    }
    let mut buf = BytesMut::with_capacity(2 + hdr.len() + payload.len());
    buf.put_u16(hdr.len() as u16);
    buf.put_slice(&hdr);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` when the peer closed cleanly at a frame boundary.
/// Everything else that prevents producing a validated `(header, payload)`
/// pair is a [`Error::FrameProtocol`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(FrameHeader, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::FrameProtocol(format!(
                "failed reading header length: {}",
                e
            )))
        }
    }
    let hdr_len = u16::from_be_bytes(len_buf) as usize;
    if hdr_len == 0 || hdr_len > MAX_HEADER_BYTES {
        return Err(Error::FrameProtocol(format!(
            "header length {} out of range",
            hdr_len
        )));
    }

    let mut hdr = vec![0u8; hdr_len];
    reader
        .read_exact(&mut hdr)
        .await
        .map_err(|e| Error::FrameProtocol(format!("short read on header: {}", e)))?;
    let header: FrameHeader =
        serde_json::from_slice(&hdr).map_err(|e| Error::FrameProtocol(format!("bad header: {}", e)))?;
    header.validate()?;

    let mut payload = vec![0u8; header.comp_len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::FrameProtocol(format!("short read on payload: {}", e)))?;

    Ok(Some((header, Bytes::from(payload))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(payload_len: usize) -> FrameHeader {
        FrameHeader {
            comp_len: payload_len as u64,
            count: 3,
            dict_id: 2,
            level: 7,
            raw_len: 120,
            topic: "files.json".into(),
            v: PROTOCOL_VERSION,
        }
    }

    // ---------------------------------------------------------------
    // Round-trip
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_encode_read_roundtrip() {
        let payload = b"compressed-bytes-here";
        let frame = encode_frame(&header(payload.len()), payload).unwrap();

        let mut cursor: &[u8] = &frame;
        let (parsed, body) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(parsed, header(payload.len()));
        assert_eq!(&body[..], payload);
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn test_two_frames_back_to_back() {
        let p1 = b"first";
        let p2 = b"second-payload";
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(&header(p1.len()), p1).unwrap());
        wire.extend_from_slice(&encode_frame(&header(p2.len()), p2).unwrap());

        let mut cursor: &[u8] = &wire;
        let (_, b1) = read_frame(&mut cursor).await.unwrap().unwrap();
        let (_, b2) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(&b1[..], p1);
        assert_eq!(&b2[..], p2);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn test_header_json_is_canonical() {
        let hdr = header(5);
        let json = serde_json::to_string(&hdr).unwrap();
        // Keys must appear in sorted order with no whitespace.
        assert_eq!(
            json,
            r#"{"comp_len":5,"count":3,"dict_id":2,"level":7,"raw_len":120,"topic":"files.json","v":1}"#
        );
    }

    #[test]
    fn test_length_prefix_is_big_endian_u16() {
        let payload = b"x";
        let frame = encode_frame(&header(1), payload).unwrap();
        let hdr_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(frame.len(), 2 + hdr_len + payload.len());
        assert!(serde_json::from_slice::<FrameHeader>(&frame[2..2 + hdr_len]).is_ok());
    }

    // ---------------------------------------------------------------
    // Encode-side rejection
    // ---------------------------------------------------------------

    #[test]
    fn test_encode_rejects_comp_len_mismatch() {
        let mut hdr = header(10);
        hdr.comp_len = 99;
        assert!(matches!(
            encode_frame(&hdr, b"0123456789"),
            Err(Error::FrameProtocol(_))
        ));
    }

    #[test]
    fn test_encode_rejects_zero_count() {
        let mut hdr = header(1);
        hdr.count = 0;
        assert!(encode_frame(&hdr, b"x").is_err());
    }

    // ---------------------------------------------------------------
    // Header validation
    // ---------------------------------------------------------------

    #[test]
    fn test_validate_rejects_wrong_version() {
        let mut hdr = header(1);
        hdr.v = 2;
        assert!(hdr.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_topic() {
        let mut hdr = header(1);
        hdr.topic = "../escape".into();
        assert!(hdr.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_dict_id() {
        let mut hdr = header(1);
        hdr.dict_id = DICT_ID_LIMIT;
        assert!(hdr.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_impossible_raw_len() {
        let mut hdr = header(1);
        hdr.count = 10;
        hdr.raw_len = 8; // nine separators alone need 9 bytes
        assert!(hdr.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_raw_len_equal_to_separators() {
        let mut hdr = header(1);
        hdr.count = 10;
        hdr.raw_len = 9;
        assert!(hdr.validate().is_ok());
    }

    #[test]
    fn test_unknown_header_field_rejected() {
        let json = r#"{"comp_len":1,"count":1,"dict_id":0,"level":7,"raw_len":5,"topic":"t","v":1,"extra":true}"#;
        assert!(serde_json::from_str::<FrameHeader>(json).is_err());
    }

    #[test]
    fn test_missing_header_field_rejected() {
        let json = r#"{"comp_len":1,"count":1,"dict_id":0,"level":7,"raw_len":5,"v":1}"#;
        assert!(serde_json::from_str::<FrameHeader>(json).is_err());
    }

    // ---------------------------------------------------------------
    // Read-side rejection
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_eof_at_boundary_is_clean() {
        let mut cursor: &[u8] = &[];
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_header_is_protocol_error() {
        let payload = b"abc";
        let frame = encode_frame(&header(payload.len()), payload).unwrap();
        let mut cursor: &[u8] = &frame[..10];
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::FrameProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_protocol_error() {
        let payload = b"abcdef";
        let frame = encode_frame(&header(payload.len()), payload).unwrap();
        let mut cursor: &[u8] = &frame[..frame.len() - 2];
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::FrameProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_header_length_rejected() {
        let wire = [0u8, 0u8, b'x'];
        let mut cursor: &[u8] = &wire;
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_header_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&5u16.to_be_bytes());
        wire.extend_from_slice(b"notjs");
        let mut cursor: &[u8] = &wire;
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::FrameProtocol(_))
        ));
    }
}
