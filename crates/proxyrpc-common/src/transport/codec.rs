use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{RpcRequest, RpcResponse};

/// Maximum size of a frame (100 MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Codec for RPC frames.
///
/// A frame carries a JSON header (the structured message) followed by its raw
/// attachments. The outer 4-byte length prefix is written by the transport; the codec
/// produces and consumes the frame body:
///
/// ```text
/// [u32 header length] [JSON header] [u32 attachment count] { [u32 length] [bytes] }*
/// ```
///
/// All integers are big-endian.
///
/// # Example
///
/// ```
/// use proxyrpc_common::transport::FrameCodec;
/// use proxyrpc_common::protocol::{Method, RpcRequest};
/// use bytes::Bytes;
/// use serde_json::json;
///
/// let request = RpcRequest::new(Method::GetNode, json!({"path": "//home"}))
///     .with_attachments(vec![Bytes::from_static(b"raw")]);
///
/// let encoded = FrameCodec::encode_request(&request).unwrap();
/// let decoded = FrameCodec::decode_request(&encoded).unwrap();
/// assert_eq!(decoded.attachments.len(), 1);
/// ```
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a request to a frame body
    ///
    /// # Arguments
    ///
    /// * `request` - The request to encode, attachments included
    pub fn encode_request(request: &RpcRequest) -> Result<Vec<u8>> {
        Self::encode(request, &request.attachments)
    }

    /// Decode a request from a frame body
    pub fn decode_request(data: &[u8]) -> Result<RpcRequest> {
        let (mut request, attachments): (RpcRequest, _) = Self::decode(data)?;
        request.attachments = attachments;
        Ok(request)
    }

    /// Encode a response to a frame body
    pub fn encode_response(response: &RpcResponse) -> Result<Vec<u8>> {
        Self::encode(response, &response.attachments)
    }

    /// Decode a response from a frame body
    ///
    /// # Arguments
    ///
    /// * `data` - The frame body, without the outer length prefix
    ///
    /// # Returns
    ///
    /// The decoded response with its attachments restored
    pub fn decode_response(data: &[u8]) -> Result<RpcResponse> {
        let (mut response, attachments): (RpcResponse, _) = Self::decode(data)?;
        response.attachments = attachments;
        Ok(response)
    }

    fn encode<T: Serialize>(header: &T, attachments: &[Bytes]) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(header)?;
        let size = 8 + header.len() + attachments.iter().map(|a| 4 + a.len()).sum::<usize>();
        if size > MAX_FRAME_SIZE {
            return Err(RpcError::InvalidRequest(format!(
                "Message too large: {} bytes (max {} bytes)",
                size, MAX_FRAME_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        buf.put_u32(attachments.len() as u32);
        for attachment in attachments {
            buf.put_u32(attachment.len() as u32);
            buf.put_slice(attachment);
        }

        Ok(buf.to_vec())
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<(T, Vec<Bytes>)> {
        let mut buf = Bytes::copy_from_slice(data);

        let header_len = Self::read_len(&mut buf, "header length")?;
        let header = Self::read_chunk(&mut buf, header_len, "header")?;
        let header: T = serde_json::from_slice(&header)?;

        let count = Self::read_len(&mut buf, "attachment count")?;
        let mut attachments = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let len = Self::read_len(&mut buf, "attachment length")?;
            attachments.push(Self::read_chunk(&mut buf, len, "attachment")?);
        }

        if buf.has_remaining() {
            return Err(RpcError::Protocol(format!(
                "{} trailing bytes after frame",
                buf.remaining()
            )));
        }

        Ok((header, attachments))
    }

    fn read_len(buf: &mut Bytes, what: &str) -> Result<usize> {
        if buf.remaining() < 4 {
            return Err(RpcError::Protocol(format!("frame truncated in {}", what)));
        }
        Ok(buf.get_u32() as usize)
    }

    fn read_chunk(buf: &mut Bytes, len: usize, what: &str) -> Result<Bytes> {
        if buf.remaining() < len {
            return Err(RpcError::Protocol(format!(
                "frame truncated in {}: need {} bytes, {} left",
                what,
                len,
                buf.remaining()
            )));
        }
        Ok(buf.split_to(len))
    }
}
