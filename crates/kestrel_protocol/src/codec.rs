use bytes::{Buf, BufMut, Bytes, BytesMut};

use kestrel_common::error::ProtocolError;

use crate::frame::Frame;

pub const PROTOCOL_VERSION: u32 = 196_608; // 3.0

/// Target of a Describe or Close message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

impl DescribeTarget {
    fn as_byte(self) -> u8 {
        match self {
            DescribeTarget::Statement => b'S',
            DescribeTarget::Portal => b'P',
        }
    }

    fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            b'S' => Ok(DescribeTarget::Statement),
            b'P' => Ok(DescribeTarget::Portal),
            other => Err(ProtocolError::InvalidMessage(format!(
                "bad describe target '{}'",
                other as char
            ))),
        }
    }
}

/// Coordinator → data node messages.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    /// Initial startup message (no type byte).
    Startup { params: Vec<(String, String)> },
    /// Simple query ('Q').
    Query(String),
    /// Parse ('P').
    Parse {
        name: String,
        query: String,
        param_types: Vec<u32>,
    },
    /// Bind ('B'), text-format parameters only.
    Bind {
        portal: String,
        statement: String,
        params: Vec<Option<Vec<u8>>>,
    },
    /// Describe ('D').
    Describe { target: DescribeTarget, name: String },
    /// Execute ('E'). `max_rows == 0` means no limit.
    Execute { portal: String, max_rows: u32 },
    /// Sync ('S').
    Sync,
    /// Flush ('H').
    Flush,
    /// Close ('C').
    Close { target: DescribeTarget, name: String },
    /// CopyData ('d').
    CopyData(Bytes),
    /// CopyDone ('c').
    CopyDone,
    /// CopyFail ('f').
    CopyFail(String),
    /// Global transaction id ('g') sent ahead of BEGIN.
    GlobalXid(u64),
    /// Terminate ('X').
    Terminate,
}

/// Data node → coordinator messages.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    /// Authentication request ('R'); only code 0 (ok) is accepted.
    Authentication(u32),
    /// Parameter status ('S').
    ParameterStatus { name: String, value: String },
    /// Backend key data ('K').
    BackendKeyData { process_id: u32, secret_key: u32 },
    /// Row description ('T').
    RowDescription(Vec<FieldDescription>),
    /// Data row ('D'); payload is handed to the tuple layer untouched.
    DataRow(Bytes),
    /// Command complete ('C').
    CommandComplete(String),
    /// Portal suspended ('s').
    PortalSuspended,
    /// Copy-in response ('G').
    CopyInResponse { columns: u16 },
    /// Copy-out response ('H').
    CopyOutResponse { columns: u16 },
    /// Copy data ('d').
    CopyData(Bytes),
    /// Copy done ('c').
    CopyDone,
    /// Error response ('E').
    ErrorResponse(ErrorFields),
    /// Notice response ('N'); only the message text is kept.
    NoticeResponse(String),
    /// Empty query response ('I').
    EmptyQueryResponse,
    /// Ready for query ('Z').
    ReadyForQuery(u8),
    /// Parse complete ('1').
    ParseComplete,
    /// Bind complete ('2').
    BindComplete,
    /// Close complete ('3').
    CloseComplete,
    /// No data ('n').
    NoData,
    /// Barrier acknowledgement ('b').
    BarrierAck(String),
}

/// One attribute of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub type_name: String,
    pub type_modifier: i32,
}

impl FieldDescription {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            type_modifier: -1,
        }
    }
}

/// Recognized fields of an ErrorResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl ErrorFields {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────────

fn begin_frame(out: &mut BytesMut, tag: u8) -> usize {
    out.put_u8(tag);
    let at = out.len();
    out.put_u32(0);
    at
}

fn finish_frame(out: &mut BytesMut, len_at: usize) {
    let len = (out.len() - len_at) as u32;
    out[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstring(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

impl FrontendMessage {
    pub fn encode(&self, out: &mut BytesMut) {
        if let FrontendMessage::Startup { params } = self {
            let at = out.len();
            out.put_u32(0);
            out.put_u32(PROTOCOL_VERSION);
            for (k, v) in params {
                put_cstring(out, k);
                put_cstring(out, v);
            }
            out.put_u8(0);
            let len = (out.len() - at) as u32;
            out[at..at + 4].copy_from_slice(&len.to_be_bytes());
            return;
        }

        let len_at = begin_frame(out, self.tag());
        match self {
            FrontendMessage::Startup { .. } => {}
            FrontendMessage::Query(sql) => put_cstring(out, sql),
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => {
                put_cstring(out, name);
                put_cstring(out, query);
                out.put_u16(param_types.len() as u16);
                for t in param_types {
                    out.put_u32(*t);
                }
            }
            FrontendMessage::Bind {
                portal,
                statement,
                params,
            } => {
                put_cstring(out, portal);
                put_cstring(out, statement);
                out.put_u16(0); // all parameters in text format
                out.put_u16(params.len() as u16);
                for p in params {
                    match p {
                        Some(v) => {
                            out.put_i32(v.len() as i32);
                            out.put_slice(v);
                        }
                        None => out.put_i32(-1),
                    }
                }
                out.put_u16(0); // all results in text format
            }
            FrontendMessage::Describe { target, name } | FrontendMessage::Close { target, name } => {
                out.put_u8(target.as_byte());
                put_cstring(out, name);
            }
            FrontendMessage::Execute { portal, max_rows } => {
                put_cstring(out, portal);
                out.put_u32(*max_rows);
            }
            FrontendMessage::CopyData(data) => out.put_slice(data),
            FrontendMessage::CopyFail(msg) => put_cstring(out, msg),
            FrontendMessage::GlobalXid(gxid) => out.put_u64(*gxid),
            FrontendMessage::Sync
            | FrontendMessage::Flush
            | FrontendMessage::CopyDone
            | FrontendMessage::Terminate => {}
        }
        finish_frame(out, len_at);
    }

    pub fn tag(&self) -> u8 {
        match self {
            FrontendMessage::Startup { .. } => 0,
            FrontendMessage::Query(_) => b'Q',
            FrontendMessage::Parse { .. } => b'P',
            FrontendMessage::Bind { .. } => b'B',
            FrontendMessage::Describe { .. } => b'D',
            FrontendMessage::Execute { .. } => b'E',
            FrontendMessage::Sync => b'S',
            FrontendMessage::Flush => b'H',
            FrontendMessage::Close { .. } => b'C',
            FrontendMessage::CopyData(_) => b'd',
            FrontendMessage::CopyDone => b'c',
            FrontendMessage::CopyFail(_) => b'f',
            FrontendMessage::GlobalXid(_) => b'g',
            FrontendMessage::Terminate => b'X',
        }
    }

    /// Decode a tagged frontend frame. Used by in-process data nodes.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(frame.body.clone());
        let msg = match frame.tag {
            b'Q' => FrontendMessage::Query(r.cstring()?),
            b'P' => {
                let name = r.cstring()?;
                let query = r.cstring()?;
                let n = r.u16()?;
                let mut param_types = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    param_types.push(r.u32()?);
                }
                FrontendMessage::Parse {
                    name,
                    query,
                    param_types,
                }
            }
            b'B' => {
                let portal = r.cstring()?;
                let statement = r.cstring()?;
                let nformats = r.u16()?;
                for _ in 0..nformats {
                    r.u16()?;
                }
                let n = r.u16()?;
                let mut params = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let len = r.i32()?;
                    if len < 0 {
                        params.push(None);
                    } else {
                        params.push(Some(r.bytes(len as usize)?.to_vec()));
                    }
                }
                FrontendMessage::Bind {
                    portal,
                    statement,
                    params,
                }
            }
            b'D' => FrontendMessage::Describe {
                target: DescribeTarget::from_byte(r.u8()?)?,
                name: r.cstring()?,
            },
            b'C' => FrontendMessage::Close {
                target: DescribeTarget::from_byte(r.u8()?)?,
                name: r.cstring()?,
            },
            b'E' => FrontendMessage::Execute {
                portal: r.cstring()?,
                max_rows: r.u32()?,
            },
            b'S' => FrontendMessage::Sync,
            b'H' => FrontendMessage::Flush,
            b'd' => FrontendMessage::CopyData(r.rest()),
            b'c' => FrontendMessage::CopyDone,
            b'f' => FrontendMessage::CopyFail(r.cstring()?),
            b'g' => FrontendMessage::GlobalXid(r.u64()?),
            b'X' => FrontendMessage::Terminate,
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "unknown frontend message '{}'",
                    other as char
                )))
            }
        };
        Ok(msg)
    }

    /// Decode the body of a startup packet (after the length word).
    pub fn decode_startup(body: Bytes) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(body);
        let version = r.u32()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidMessage(format!(
                "unsupported protocol version {}",
                version
            )));
        }
        let mut params = Vec::new();
        loop {
            let key = r.cstring()?;
            if key.is_empty() {
                break;
            }
            params.push((key, r.cstring()?));
        }
        Ok(FrontendMessage::Startup { params })
    }
}

impl BackendMessage {
    pub fn tag(&self) -> u8 {
        match self {
            BackendMessage::Authentication(_) => b'R',
            BackendMessage::ParameterStatus { .. } => b'S',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::RowDescription(_) => b'T',
            BackendMessage::DataRow(_) => b'D',
            BackendMessage::CommandComplete(_) => b'C',
            BackendMessage::PortalSuspended => b's',
            BackendMessage::CopyInResponse { .. } => b'G',
            BackendMessage::CopyOutResponse { .. } => b'H',
            BackendMessage::CopyData(_) => b'd',
            BackendMessage::CopyDone => b'c',
            BackendMessage::ErrorResponse(_) => b'E',
            BackendMessage::NoticeResponse(_) => b'N',
            BackendMessage::EmptyQueryResponse => b'I',
            BackendMessage::ReadyForQuery(_) => b'Z',
            BackendMessage::ParseComplete => b'1',
            BackendMessage::BindComplete => b'2',
            BackendMessage::CloseComplete => b'3',
            BackendMessage::NoData => b'n',
            BackendMessage::BarrierAck(_) => b'b',
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        let len_at = begin_frame(out, self.tag());
        match self {
            BackendMessage::Authentication(code) => out.put_u32(*code),
            BackendMessage::ParameterStatus { name, value } => {
                put_cstring(out, name);
                put_cstring(out, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                out.put_u32(*process_id);
                out.put_u32(*secret_key);
            }
            BackendMessage::RowDescription(fields) => {
                out.put_u16(fields.len() as u16);
                for (i, f) in fields.iter().enumerate() {
                    put_cstring(out, &f.name);
                    put_cstring(out, &f.type_name);
                    out.put_u32(0); // table oid
                    out.put_u16(i as u16 + 1); // column number
                    out.put_u32(0); // type oid
                    out.put_i16(-1); // type length
                    out.put_i32(f.type_modifier);
                    out.put_u16(0); // text format
                }
            }
            BackendMessage::DataRow(payload) => out.put_slice(payload),
            BackendMessage::CommandComplete(tag) => put_cstring(out, tag),
            BackendMessage::CopyInResponse { columns } | BackendMessage::CopyOutResponse { columns } => {
                out.put_u8(0);
                out.put_u16(*columns);
                for _ in 0..*columns {
                    out.put_u16(0);
                }
            }
            BackendMessage::CopyData(data) => out.put_slice(data),
            BackendMessage::ErrorResponse(fields) => {
                out.put_u8(b'S');
                put_cstring(out, "ERROR");
                out.put_u8(b'C');
                put_cstring(out, &fields.code);
                out.put_u8(b'M');
                put_cstring(out, &fields.message);
                if let Some(detail) = &fields.detail {
                    out.put_u8(b'D');
                    put_cstring(out, detail);
                }
                out.put_u8(0);
            }
            BackendMessage::NoticeResponse(message) => {
                out.put_u8(b'S');
                put_cstring(out, "NOTICE");
                out.put_u8(b'M');
                put_cstring(out, message);
                out.put_u8(0);
            }
            BackendMessage::ReadyForQuery(status) => out.put_u8(*status),
            BackendMessage::BarrierAck(id) => put_cstring(out, id),
            BackendMessage::PortalSuspended
            | BackendMessage::CopyDone
            | BackendMessage::EmptyQueryResponse
            | BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData => {}
        }
        finish_frame(out, len_at);
    }

    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(frame.body.clone());
        let msg = match frame.tag {
            b'R' => BackendMessage::Authentication(r.u32()?),
            b'S' => BackendMessage::ParameterStatus {
                name: r.cstring()?,
                value: r.cstring()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: r.u32()?,
                secret_key: r.u32()?,
            },
            b'T' => {
                let n = r.u16()?;
                let mut fields = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let name = r.cstring()?;
                    let type_name = r.cstring()?;
                    r.skip(4 + 2 + 4 + 2)?; // table oid, column number, type oid, type length
                    let type_modifier = r.i32()?;
                    r.skip(2)?; // format code
                    fields.push(FieldDescription {
                        name,
                        type_name,
                        type_modifier,
                    });
                }
                BackendMessage::RowDescription(fields)
            }
            b'D' => BackendMessage::DataRow(r.rest()),
            b'C' => BackendMessage::CommandComplete(r.cstring()?),
            b's' => BackendMessage::PortalSuspended,
            b'G' | b'H' => {
                r.u8()?; // overall format
                let columns = r.u16()?;
                if frame.tag == b'G' {
                    BackendMessage::CopyInResponse { columns }
                } else {
                    BackendMessage::CopyOutResponse { columns }
                }
            }
            b'd' => BackendMessage::CopyData(r.rest()),
            b'c' => BackendMessage::CopyDone,
            b'E' => BackendMessage::ErrorResponse(parse_error_fields(&mut r)?),
            b'N' => BackendMessage::NoticeResponse(parse_error_fields(&mut r)?.message),
            b'I' => BackendMessage::EmptyQueryResponse,
            b'Z' => BackendMessage::ReadyForQuery(r.u8()?),
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'n' => BackendMessage::NoData,
            b'b' => BackendMessage::BarrierAck(r.cstring().unwrap_or_default()),
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    tag: other as char,
                    state: "decoding backend message".into(),
                })
            }
        };
        Ok(msg)
    }
}

/// `<code><value\0>` pairs terminated by a zero byte. Unknown codes are skipped.
fn parse_error_fields(r: &mut Reader) -> Result<ErrorFields, ProtocolError> {
    let mut fields = ErrorFields::default();
    loop {
        if r.remaining() == 0 {
            break;
        }
        let code = r.u8()?;
        if code == 0 {
            break;
        }
        let value = r.cstring()?;
        match code {
            b'C' => fields.code = value.chars().take(5).collect(),
            b'M' => fields.message = value,
            b'D' => fields.detail = Some(value),
            _ => {}
        }
    }
    Ok(fields)
}

/// Affected-row count from a CommandComplete tag: the trailing run of digits.
/// `"INSERT 0 5"` → 5, `"UPDATE 12"` → 12, `"BEGIN"` → `None`.
pub fn command_row_count(tag: &str) -> Option<u64> {
    let trimmed = tag.trim_end_matches(|c: char| !c.is_ascii_digit());
    let start = trimmed
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let digits = &trimmed[start..];
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Split a DataRow payload into its column values. `None` is SQL NULL.
pub fn decode_data_row(payload: &Bytes) -> Result<Vec<Option<Bytes>>, ProtocolError> {
    let mut r = Reader::new(payload.clone());
    let n = r.u16()?;
    let mut values = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let len = r.i32()?;
        if len < 0 {
            values.push(None);
        } else {
            values.push(Some(r.bytes(len as usize)?));
        }
    }
    Ok(values)
}

/// Build a DataRow payload from text-format column values.
pub fn encode_data_row<S: AsRef<[u8]>>(values: &[Option<S>]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_u16(values.len() as u16);
    for v in values {
        match v {
            Some(v) => {
                let v = v.as_ref();
                out.put_i32(v.len() as i32);
                out.put_slice(v);
            }
            None => out.put_i32(-1),
        }
    }
    out.freeze()
}

/// Bounds-checked cursor over a frame body.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::InvalidMessage(format!(
                "message truncated: need {} bytes, have {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    fn rest(&mut self) -> Bytes {
        let n = self.buf.remaining();
        self.buf.split_to(n)
    }

    fn cstring(&mut self) -> Result<String, ProtocolError> {
        let pos = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProtocolError::InvalidMessage("no null terminator in cstring".into()))?;
        let raw = self.buf.split_to(pos);
        self.buf.advance(1);
        String::from_utf8(raw.to_vec())
            .map_err(|e| ProtocolError::InvalidMessage(format!("invalid UTF-8 in cstring: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuffer;

    fn roundtrip_backend(msg: BackendMessage) -> BackendMessage {
        let mut out = BytesMut::new();
        msg.encode(&mut out);
        let mut fb = FrameBuffer::default();
        fb.append(&out);
        let frame = fb.try_read_frame().unwrap().unwrap();
        BackendMessage::decode(&frame).unwrap()
    }

    #[test]
    fn test_row_description_layout() {
        let fields = vec![
            FieldDescription::new("id", "int4"),
            FieldDescription {
                name: "name".into(),
                type_name: "varchar".into(),
                type_modifier: 36,
            },
        ];
        assert_eq!(
            roundtrip_backend(BackendMessage::RowDescription(fields.clone())),
            BackendMessage::RowDescription(fields)
        );
    }

    #[test]
    fn test_error_fields_skip_unknown_codes() {
        // S, V, C, M, D, P, then terminator.
        let mut body = BytesMut::new();
        for (code, value) in [
            (b'S', "ERROR"),
            (b'V', "ERROR"),
            (b'C', "23505xyz"),
            (b'M', "duplicate key"),
            (b'D', "Key (id)=(1) exists."),
            (b'P', "12"),
        ] {
            body.put_u8(code);
            put_cstring(&mut body, value);
        }
        body.put_u8(0);
        let frame = Frame::new(b'E', body.freeze());
        match BackendMessage::decode(&frame).unwrap() {
            BackendMessage::ErrorResponse(f) => {
                assert_eq!(f.code, "23505");
                assert_eq!(f.message, "duplicate key");
                assert_eq!(f.detail.as_deref(), Some("Key (id)=(1) exists."));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_command_row_count() {
        assert_eq!(command_row_count("INSERT 0 5"), Some(5));
        assert_eq!(command_row_count("UPDATE 12"), Some(12));
        assert_eq!(command_row_count("SELECT 0"), Some(0));
        assert_eq!(command_row_count("BEGIN"), None);
        assert_eq!(command_row_count("COPY 7 "), Some(7));
    }

    #[test]
    fn test_data_row_values() {
        let payload = encode_data_row(&[Some("1"), None, Some("abc")]);
        let values = decode_data_row(&payload).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].as_deref(), Some(&b"1"[..]));
        assert!(values[1].is_none());
        assert_eq!(values[2].as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_truncated_data_row_is_error() {
        let mut payload = BytesMut::new();
        payload.put_u16(1);
        payload.put_i32(10);
        payload.put_slice(b"abc");
        assert!(decode_data_row(&payload.freeze()).is_err());
    }

    #[test]
    fn test_frontend_extended_sequence() {
        let msgs = vec![
            FrontendMessage::Parse {
                name: "s1".into(),
                query: "SELECT $1".into(),
                param_types: vec![23],
            },
            FrontendMessage::Bind {
                portal: "p1".into(),
                statement: "s1".into(),
                params: vec![Some(b"7".to_vec()), None],
            },
            FrontendMessage::Describe {
                target: DescribeTarget::Portal,
                name: "p1".into(),
            },
            FrontendMessage::Execute {
                portal: "p1".into(),
                max_rows: 100,
            },
            FrontendMessage::Flush,
            FrontendMessage::GlobalXid(9),
            FrontendMessage::Sync,
        ];
        let mut out = BytesMut::new();
        for m in &msgs {
            m.encode(&mut out);
        }
        let mut fb = FrameBuffer::default();
        fb.append(&out);
        for expected in &msgs {
            let frame = fb.try_read_frame().unwrap().unwrap();
            assert_eq!(&FrontendMessage::decode(&frame).unwrap(), expected);
        }
    }

    #[test]
    fn test_startup_packet() {
        let msg = FrontendMessage::Startup {
            params: vec![("user".into(), "kestrel".into())],
        };
        let mut out = BytesMut::new();
        msg.encode(&mut out);
        let mut fb = FrameBuffer::default();
        fb.append(&out);
        let body = fb.try_read_startup().unwrap().unwrap();
        assert_eq!(FrontendMessage::decode_startup(body).unwrap(), msg);
    }

    #[test]
    fn test_unknown_backend_tag_rejected() {
        let frame = Frame::new(b'!', Bytes::new());
        assert!(matches!(
            BackendMessage::decode(&frame),
            Err(ProtocolError::UnexpectedMessage { tag: '!', .. })
        ));
    }
}
