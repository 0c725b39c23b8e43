use bytes::{Buf, Bytes, BytesMut};

use kestrel_common::error::ProtocolError;

/// Tag byte plus 4-byte length.
pub const FRAME_HEADER_LEN: usize = 5;

const INITIAL_CAPACITY: usize = 16 * 1024;

/// One complete framed message. `body` excludes the tag and length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub body: Bytes,
}

impl Frame {
    pub fn new(tag: u8, body: impl Into<Bytes>) -> Self {
        Self {
            tag,
            body: body.into(),
        }
    }

    pub fn tag_char(&self) -> char {
        self.tag as char
    }
}

/// Growable input buffer that yields whole frames.
///
/// Bytes are appended as they arrive from the socket; `try_read_frame`
/// returns `Ok(None)` until a full frame is buffered. A declared length
/// below 4 or above `max_frame_bytes` is a framing violation.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_frame_bytes,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Tag of the next buffered frame, if at least one byte is buffered.
    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    pub fn try_read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let tag = self.buf[0];
        let declared = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        let declared = declared as usize;
        if declared < 4 {
            return Err(ProtocolError::InvalidFrame(format!(
                "message '{}' declares length {}",
                tag as char, declared
            )));
        }
        if declared > self.max_frame_bytes {
            return Err(ProtocolError::InvalidFrame(format!(
                "message '{}' of {} bytes exceeds limit {}",
                tag as char, declared, self.max_frame_bytes
            )));
        }
        let total = declared + 1;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        let body = self.buf.split_to(declared - 4).freeze();
        Ok(Some(Frame { tag, body }))
    }

    /// Read the untagged startup packet: 4-byte length then body.
    pub fn try_read_startup(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let declared =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if declared < 8 || declared > self.max_frame_bytes {
            return Err(ProtocolError::InvalidFrame(format!(
                "startup packet declares length {}",
                declared
            )));
        }
        if self.buf.len() < declared {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(declared - 4).freeze()))
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_incomplete_then_complete() {
        let bytes = framed(b'C', b"INSERT 0 1\0");
        let mut fb = FrameBuffer::default();
        fb.append(&bytes[..3]);
        assert_eq!(fb.try_read_frame().unwrap(), None);
        fb.append(&bytes[3..9]);
        assert_eq!(fb.try_read_frame().unwrap(), None);
        fb.append(&bytes[9..]);
        let frame = fb.try_read_frame().unwrap().unwrap();
        assert_eq!(frame.tag, b'C');
        assert_eq!(&frame.body[..], b"INSERT 0 1\0");
        assert!(fb.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut bytes = framed(b'1', b"");
        bytes.extend(framed(b'Z', b"I"));
        let mut fb = FrameBuffer::default();
        fb.append(&bytes);
        assert_eq!(fb.try_read_frame().unwrap().unwrap().tag, b'1');
        let z = fb.try_read_frame().unwrap().unwrap();
        assert_eq!(z.tag, b'Z');
        assert_eq!(&z.body[..], b"I");
        assert_eq!(fb.try_read_frame().unwrap(), None);
    }

    #[test]
    fn test_length_below_header_is_violation() {
        let mut fb = FrameBuffer::default();
        fb.append(&[b'D', 0, 0, 0, 2]);
        assert!(matches!(
            fb.try_read_frame(),
            Err(ProtocolError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_oversized_frame_is_violation() {
        let mut fb = FrameBuffer::new(1024);
        fb.append(&[b'D', 0, 1, 0, 0]);
        assert!(fb.try_read_frame().is_err());
    }

    #[test]
    fn test_startup_packet() {
        let mut fb = FrameBuffer::default();
        let body = [0u8, 3, 0, 0, b'u', 0, b'x', 0, 0];
        fb.append(&((body.len() + 4) as u32).to_be_bytes());
        fb.append(&body[..4]);
        assert_eq!(fb.try_read_startup().unwrap(), None);
        fb.append(&body[4..]);
        assert_eq!(&fb.try_read_startup().unwrap().unwrap()[..], &body[..]);
    }
}
