//! Framing: length-prefix (4 bytes LE) + JSON frame body.

use crate::protocol::Frame;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a frame: 4 bytes LE length + JSON body.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let body = serde_json::to_vec(frame).map_err(FrameEncodeError::Encode)?;
    let len = u32::try_from(body.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error encoding a frame (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should retry after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame: Frame = serde_json::from_slice(&bytes[LEN_SIZE..LEN_SIZE + len])
        .map_err(FrameDecodeError::Decode)?;
    Ok((frame, LEN_SIZE + len))
}

/// Decode every complete frame in `bytes`. Trailing partial data is an error here because the
/// raw peer channel delivers whole writes.
pub fn decode_frames(mut bytes: &[u8]) -> Result<Vec<Frame>, FrameDecodeError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (frame, n) = decode_frame(bytes)?;
        out.push(frame);
        bytes = &bytes[n..];
    }
    Ok(out)
}

/// Error decoding a frame (need more bytes, too large, or malformed body).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{kinds, Message, MessageId};

    fn sample_batch() -> Frame {
        Frame::Batch {
            messages: vec![Message {
                id: MessageId::generate(),
                kind: kinds::MESSAGE.to_string(),
                payload: serde_json::json!({"text": "hello"}),
                timestamp: 1_000,
                compressed: false,
                require_ack: true,
            }],
        }
    }

    #[test]
    fn batch_survives_framing() {
        let frame = sample_batch();
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&sample_batch()).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..super::LEN_SIZE + 3]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames() {
        let a = sample_batch();
        let b = Frame::Ack {
            message_ids: vec![MessageId::generate()],
        };
        let mut buf = encode_frame(&a).unwrap();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let frames = decode_frames(&buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Batch { .. }));
        assert!(matches!(frames[1], Frame::Ack { .. }));
    }

    #[test]
    fn garbage_body_is_decode_error() {
        let mut buf = 5u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"nope!");
        assert!(matches!(
            decode_frame(&buf),
            Err(FrameDecodeError::Decode(_))
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let buf = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(
            decode_frame(&buf),
            Err(FrameDecodeError::TooLarge)
        ));
    }
}
