/// PostgreSQL v3 frontend/backend message framing
///
/// The codec only fully parses the messages the proxy has to act upon
/// (startup negotiation, authentication, a handful of backend status
/// messages); everything else is carried as an opaque tagged body and
/// re-emitted byte for byte. Framing is one tag byte plus a big-endian
/// 32-bit length covering itself and the body; the three startup-phase
/// frames carry no tag and are discriminated by their payload code.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{PorteraError, PorteraResult};

/// Protocol version 3.0, as sent in a Startup message (3 << 16).
pub const PROTOCOL_VERSION_3_0: i32 = 196608;
/// Magic payload code identifying an SSLRequest frame.
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// Magic payload code identifying a CancelRequest frame.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Which half of the conversation a connection decodes.
///
/// The two tag maps overlap: 'C' is Close when sent by a frontend but
/// CommandComplete when sent by a backend, so the decoder must know whose
/// bytes it is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    Frontend,
    Backend,
}

/// A single protocol message, fully framed.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Startup(Startup),
    SslRequest,
    CancelRequest { pid: i32, secret: i32 },
    Authentication(AuthenticationRequest),
    Password(PasswordMessage),
    Error(ErrorResponse),
    ParameterStatus { name: Bytes, value: Bytes },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery { status: u8 },
    /// Any other in-vocabulary message, carried opaquely.
    Other { tag: u8, body: Bytes },
}

/// Startup message: protocol version plus NUL-separated key/value pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Startup {
    version: i32,
    parameters: Vec<(String, String)>,
}

impl Startup {
    pub fn new(version: i32, parameters: Vec<(String, String)>) -> Self {
        Self {
            version,
            parameters,
        }
    }

    pub fn major_version(&self) -> i32 {
        self.version >> 16
    }

    pub fn minor_version(&self) -> i32 {
        self.version & 0xFFFF
    }

    pub fn user(&self) -> Option<&str> {
        self.parameter("user")
    }

    pub fn database(&self) -> Option<&str> {
        self.parameter("database")
    }

    fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the post-length payload: version, then parameters terminated
    /// by a trailing empty key.
    fn parse(mut body: Bytes) -> PorteraResult<Self> {
        if body.len() < 4 {
            return Err(PorteraError::ProtocolViolation);
        }
        let version = body.get_i32();

        let mut parameters = Vec::new();
        let mut key: Option<String> = None;
        for item in body.split(|b| *b == 0) {
            if item.is_empty() {
                break;
            }
            let text = String::from_utf8_lossy(item).into_owned();
            match key.take() {
                None => key = Some(text),
                Some(k) => parameters.push((k, text)),
            }
        }

        Ok(Self {
            version,
            parameters,
        })
    }

    fn body_len(&self) -> usize {
        let params: usize = self
            .parameters
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum();
        4 + params + 1
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32((4 + self.body_len()) as i32);
        buf.put_i32(self.version);
        for (k, v) in &self.parameters {
            buf.put_slice(k.as_bytes());
            buf.put_u8(0);
            buf.put_slice(v.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
    }
}

/// The authentication subtypes the proxy supports: 0, 3, and 5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationRequest {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
}

impl AuthenticationRequest {
    pub fn code(&self) -> i32 {
        match self {
            AuthenticationRequest::Ok => 0,
            AuthenticationRequest::CleartextPassword => 3,
            AuthenticationRequest::Md5Password { .. } => 5,
        }
    }

    fn parse(mut body: Bytes) -> PorteraResult<Self> {
        if body.len() < 4 {
            return Err(PorteraError::ProtocolViolation);
        }
        let code = body.get_i32();
        match (code, body.len()) {
            (0, 0) => Ok(AuthenticationRequest::Ok),
            (3, 0) => Ok(AuthenticationRequest::CleartextPassword),
            (5, 4) => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body);
                Ok(AuthenticationRequest::Md5Password { salt })
            }
            _ => Err(PorteraError::UnsupportedAuthenticationRequest),
        }
    }

    fn body_len(&self) -> usize {
        match self {
            AuthenticationRequest::Md5Password { .. } => 8,
            _ => 4,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32(self.code());
        if let AuthenticationRequest::Md5Password { salt } = self {
            buf.put_slice(salt);
        }
    }
}

/// Password payload, stored NUL-terminated as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordMessage(Bytes);

impl PasswordMessage {
    pub fn from_raw(raw: Bytes) -> Self {
        Self(raw)
    }

    /// The password without its trailing NUL terminator.
    pub fn password(&self) -> &[u8] {
        match self.0.len() {
            0 => &[],
            n => &self.0[..n - 1],
        }
    }

    /// Replace the payload, appending the trailing NUL terminator.
    pub fn set_password(&mut self, password: &[u8]) {
        let mut raw = Vec::with_capacity(password.len() + 1);
        raw.extend_from_slice(password);
        raw.push(0);
        self.0 = Bytes::from(raw);
    }

    fn body_len(&self) -> usize {
        self.0.len()
    }
}

/// ErrorResponse: a sequence of (field-code, value) tuples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    fields: Vec<(u8, String)>,
}

impl ErrorResponse {
    pub fn new(fields: Vec<(u8, String)>) -> Self {
        Self { fields }
    }

    /// The SQLSTATE code, when present ('C' field).
    pub fn code(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|(code, _)| *code == b'C')
            .map(|(_, v)| v.as_str())
    }

    fn parse(body: Bytes) -> PorteraResult<Self> {
        let mut fields = Vec::new();
        for item in body.split(|b| *b == 0) {
            if item.len() < 2 {
                break;
            }
            fields.push((item[0], String::from_utf8_lossy(&item[1..]).into_owned()));
        }
        Ok(Self { fields })
    }

    fn body_len(&self) -> usize {
        self.fields.iter().map(|(_, v)| v.len() + 2).sum::<usize>() + 1
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        for (code, value) in &self.fields {
            buf.put_u8(*code);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
    }
}

impl Message {
    /// The wire tag of a post-startup message; startup-phase frames have none.
    pub fn tag(&self) -> Option<u8> {
        match self {
            Message::Startup(_) | Message::SslRequest | Message::CancelRequest { .. } => None,
            Message::Authentication(_) => Some(b'R'),
            Message::Password(_) => Some(b'p'),
            Message::Error(_) => Some(b'E'),
            Message::ParameterStatus { .. } => Some(b'S'),
            Message::BackendKeyData { .. } => Some(b'K'),
            Message::ReadyForQuery { .. } => Some(b'Z'),
            Message::Other { tag, .. } => Some(*tag),
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Message::Startup(s) => s.body_len(),
            Message::SslRequest => 4,
            Message::CancelRequest { .. } => 12,
            Message::Authentication(a) => a.body_len(),
            Message::Password(p) => p.body_len(),
            Message::Error(e) => e.body_len(),
            Message::ParameterStatus { name, value } => name.len() + value.len(),
            Message::BackendKeyData { .. } => 8,
            Message::ReadyForQuery { .. } => 1,
            Message::Other { body, .. } => body.len(),
        }
    }

    /// Total number of bytes this message occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self.tag() {
            Some(_) => 1 + 4 + self.body_len(),
            None => 4 + self.body_len(),
        }
    }

    /// Encode the full frame: tag (when present), length, body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            Message::Startup(s) => s.encode_into(&mut buf),
            Message::SslRequest => {
                buf.put_i32(8);
                buf.put_i32(SSL_REQUEST_CODE);
            }
            Message::CancelRequest { pid, secret } => {
                buf.put_i32(16);
                buf.put_i32(CANCEL_REQUEST_CODE);
                buf.put_i32(*pid);
                buf.put_i32(*secret);
            }
            tagged => {
                buf.put_u8(tagged.tag().unwrap_or(0));
                buf.put_i32((4 + tagged.body_len()) as i32);
                match tagged {
                    Message::Authentication(a) => a.encode_into(&mut buf),
                    Message::Password(p) => buf.put_slice(&p.0),
                    Message::Error(e) => e.encode_into(&mut buf),
                    Message::ParameterStatus { name, value } => {
                        buf.put_slice(name);
                        buf.put_slice(value);
                    }
                    Message::BackendKeyData { pid, secret } => {
                        buf.put_i32(*pid);
                        buf.put_i32(*secret);
                    }
                    Message::ReadyForQuery { status } => buf.put_u8(*status),
                    Message::Other { body, .. } => buf.put_slice(body),
                    _ => {}
                }
            }
        }
        buf.freeze()
    }
}

impl Vocabulary {
    /// Build a message from a tag byte and its complete body.
    ///
    /// Tags outside the role's map fail with `UnknownMessage`; fixed-size
    /// payloads of the wrong length fail with `ProtocolViolation`.
    pub fn parse(self, tag: u8, body: Bytes) -> PorteraResult<Message> {
        match self {
            Vocabulary::Frontend => self.parse_frontend(tag, body),
            Vocabulary::Backend => self.parse_backend(tag, body),
        }
    }

    fn parse_frontend(self, tag: u8, body: Bytes) -> PorteraResult<Message> {
        match tag {
            b'p' => Ok(Message::Password(PasswordMessage::from_raw(body))),
            // Terminate, Sync, CopyDone carry no payload.
            b'X' | b'S' | b'c' => {
                if body.is_empty() {
                    Ok(Message::Other { tag, body })
                } else {
                    Err(PorteraError::ProtocolViolation)
                }
            }
            b'B' | b'C' | b'D' | b'E' | b'F' | b'H' | b'P' | b'Q' | b'd' | b'f' => {
                Ok(Message::Other { tag, body })
            }
            _ => Err(PorteraError::UnknownMessage(tag)),
        }
    }

    fn parse_backend(self, tag: u8, mut body: Bytes) -> PorteraResult<Message> {
        match tag {
            b'R' => Ok(Message::Authentication(AuthenticationRequest::parse(body)?)),
            b'E' => Ok(Message::Error(ErrorResponse::parse(body)?)),
            b'S' => {
                let nul = body
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or(PorteraError::ProtocolViolation)?;
                let name = body.split_to(nul + 1);
                Ok(Message::ParameterStatus { name, value: body })
            }
            b'K' => {
                if body.len() != 8 {
                    return Err(PorteraError::ProtocolViolation);
                }
                Ok(Message::BackendKeyData {
                    pid: body.get_i32(),
                    secret: body.get_i32(),
                })
            }
            b'Z' => {
                if body.len() != 1 {
                    return Err(PorteraError::ProtocolViolation);
                }
                Ok(Message::ReadyForQuery { status: body[0] })
            }
            // EmptyQueryResponse, CopyDone carry no payload.
            b'I' | b'c' => {
                if body.is_empty() {
                    Ok(Message::Other { tag, body })
                } else {
                    Err(PorteraError::ProtocolViolation)
                }
            }
            b'A' | b'C' | b'D' | b'F' | b'G' | b'H' | b'N' | b'T' | b'W' | b'd' | b'n'
            | b's' | b't' | b'1' | b'2' | b'3' => Ok(Message::Other { tag, body }),
            _ => Err(PorteraError::UnknownMessage(tag)),
        }
    }
}

/// Read one tagged message frame from `r`.
///
/// EOF on the tag byte is a clean termination and surfaces as `Eof`;
/// EOF anywhere inside a frame is an I/O fault.
pub async fn read_message<R>(r: &mut R, vocabulary: Vocabulary) -> PorteraResult<Message>
where
    R: AsyncRead + Unpin,
{
    let tag = match r.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(PorteraError::Eof)
        }
        Err(e) => return Err(e.into()),
    };

    let body = read_body(r).await?;
    vocabulary.parse(tag, body)
}

/// Read one startup-phase frame (Startup, SSLRequest, or CancelRequest),
/// discriminated by the 32-bit code following the length.
pub async fn read_start_frame<R>(r: &mut R) -> PorteraResult<Message>
where
    R: AsyncRead + Unpin,
{
    let mut body = match r.read_i32().await {
        Ok(len) if len >= 8 => read_exact_body(r, len).await?,
        Ok(_) => return Err(PorteraError::ProtocolViolation),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(PorteraError::Eof)
        }
        Err(e) => return Err(e.into()),
    };

    let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    match code {
        SSL_REQUEST_CODE => {
            if body.len() != 4 {
                return Err(PorteraError::ProtocolViolation);
            }
            Ok(Message::SslRequest)
        }
        CANCEL_REQUEST_CODE => {
            if body.len() != 12 {
                return Err(PorteraError::ProtocolViolation);
            }
            body.advance(4);
            Ok(Message::CancelRequest {
                pid: body.get_i32(),
                secret: body.get_i32(),
            })
        }
        _ => Ok(Message::Startup(Startup::parse(body)?)),
    }
}

async fn read_body<R>(r: &mut R) -> PorteraResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_i32().await?;
    if len < 4 {
        return Err(PorteraError::ProtocolViolation);
    }
    read_exact_body(r, len).await
}

async fn read_exact_body<R>(r: &mut R, len: i32) -> PorteraResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; (len - 4) as usize];
    r.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}
