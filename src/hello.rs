//! TLS record framing and the handshake messages the ECH layer touches
//!
//! Only what ECH negotiation needs: reading the first ClientHello off the
//! wire without over-reading, parsing its extensions, and rebuilding a
//! ClientHelloInner from its encoded form.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{GatewayError, Result};

pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;
pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;

pub const EXT_SERVER_NAME: u16 = 0x0000;
pub const EXT_ENCRYPTED_CLIENT_HELLO: u16 = 0xfe0d;
pub const EXT_ECH_OUTER_EXTENSIONS: u16 = 0xfd00;

pub const RECORD_HEADER_LEN: usize = 5;
pub const MAX_RECORD_LEN: usize = 16384;
const MAX_HELLO_LEN: usize = 64 * 1024;
pub const HANDSHAKE_HEADER_LEN: usize = 4;

fn truncated() -> GatewayError {
    GatewayError::Parse("truncated TLS message".to_string())
}

/// Big-endian cursor over a TLS structure.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(truncated());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn vec8(&mut self) -> Result<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    pub(crate) fn vec16(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

pub(crate) fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u24(out: &mut Vec<u8>, v: usize) {
    out.extend_from_slice(&(v as u32).to_be_bytes()[1..]);
}

pub(crate) fn put_vec8(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let len = u8::try_from(data.len())
        .map_err(|_| GatewayError::Parse(format!("{} bytes exceed a u8 length", data.len())))?;
    out.push(len);
    out.extend_from_slice(data);
    Ok(())
}

pub(crate) fn put_vec16(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| GatewayError::Parse(format!("{} bytes exceed a u16 length", data.len())))?;
    put_u16(out, len);
    out.extend_from_slice(data);
    Ok(())
}

/// The first flight read off a raw connection.
#[derive(Debug, Clone)]
pub struct RawClientHello {
    /// Every byte consumed from the connection, record headers included.
    pub consumed: Vec<u8>,
    /// The reassembled handshake message, 4-byte header included.
    pub message: Vec<u8>,
}

impl RawClientHello {
    pub fn body(&self) -> &[u8] {
        &self.message[HANDSHAKE_HEADER_LEN..]
    }
}

/// Read exactly the handshake records carrying the first ClientHello.
///
/// Nothing past the last record of the message is consumed, so the rest of
/// the connection can be handed to another TLS implementation untouched.
pub async fn read_client_hello<R>(io: &mut R) -> Result<RawClientHello>
where
    R: AsyncRead + Unpin,
{
    let mut consumed = Vec::new();
    let mut message = Vec::new();

    loop {
        let mut header = [0u8; RECORD_HEADER_LEN];
        io.read_exact(&mut header).await?;
        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(GatewayError::Parse(format!(
                "expected a handshake record, got content type {}",
                header[0]
            )));
        }
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if len == 0 || len > MAX_RECORD_LEN {
            return Err(GatewayError::Parse(format!("bad record length {}", len)));
        }

        let start = consumed.len();
        consumed.extend_from_slice(&header);
        consumed.resize(start + RECORD_HEADER_LEN + len, 0);
        io.read_exact(&mut consumed[start + RECORD_HEADER_LEN..]).await?;
        message.extend_from_slice(&consumed[start + RECORD_HEADER_LEN..]);

        if message.len() < HANDSHAKE_HEADER_LEN {
            continue;
        }
        if message[0] != HANDSHAKE_CLIENT_HELLO {
            return Err(GatewayError::Parse(format!(
                "expected ClientHello, got handshake type {}",
                message[0]
            )));
        }
        let total = HANDSHAKE_HEADER_LEN
            + u32::from_be_bytes([0, message[1], message[2], message[3]]) as usize;
        if total > MAX_HELLO_LEN {
            return Err(GatewayError::Parse(format!("ClientHello of {} bytes", total)));
        }
        if message.len() > total {
            return Err(GatewayError::Parse(
                "unexpected data after ClientHello".to_string(),
            ));
        }
        if message.len() == total {
            return Ok(RawClientHello { consumed, message });
        }
    }
}

/// One extension of a ClientHello.
#[derive(Debug, Clone, Copy)]
pub struct Extension<'a> {
    pub typ: u16,
    pub data: &'a [u8],
    /// Offset of `data` within the ClientHello body.
    pub offset: usize,
}

/// A parsed ClientHello body (no handshake header).
#[derive(Debug, Clone)]
pub struct ClientHello<'a> {
    pub legacy_version: u16,
    pub random: &'a [u8],
    pub session_id: &'a [u8],
    pub cipher_suites: &'a [u8],
    pub compression_methods: &'a [u8],
    pub extensions: Vec<Extension<'a>>,
}

impl<'a> ClientHello<'a> {
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let legacy_version = r.u16()?;
        let random = r.take(32)?;
        let session_id = r.vec8()?;
        let cipher_suites = r.vec16()?;
        let compression_methods = r.vec8()?;
        let extensions = parse_extensions(&mut r)?;
        if !r.is_empty() {
            return Err(GatewayError::Parse(
                "trailing bytes after ClientHello extensions".to_string(),
            ));
        }

        Ok(Self {
            legacy_version,
            random,
            session_id,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }

    pub fn extension(&self, typ: u16) -> Option<&Extension<'a>> {
        self.extensions.iter().find(|ext| ext.typ == typ)
    }

    /// The `host_name` entry of the server_name extension.
    pub fn server_name(&self) -> Option<String> {
        let ext = self.extension(EXT_SERVER_NAME)?;
        let mut list = Reader::new(Reader::new(ext.data).vec16().ok()?);
        while !list.is_empty() {
            let name_type = list.u8().ok()?;
            let name = list.vec16().ok()?;
            if name_type == 0 {
                return std::str::from_utf8(name).ok().map(str::to_owned);
            }
        }
        None
    }
}

fn parse_extensions<'a>(r: &mut Reader<'a>) -> Result<Vec<Extension<'a>>> {
    let mut extensions = Vec::new();
    if r.is_empty() {
        return Ok(extensions);
    }
    let len = r.u16()? as usize;
    let end = r.position() + len;
    while r.position() < end {
        let typ = r.u16()?;
        let data_len = r.u16()? as usize;
        let offset = r.position();
        let data = r.take(data_len)?;
        if extensions.iter().any(|e: &Extension| e.typ == typ) {
            return Err(GatewayError::Parse(format!("duplicate extension {:#06x}", typ)));
        }
        extensions.push(Extension { typ, data, offset });
    }
    if r.position() != end {
        return Err(truncated());
    }
    Ok(extensions)
}

/// The outer form of the `encrypted_client_hello` extension.
#[derive(Debug, Clone, Copy)]
pub struct OuterEch<'a> {
    pub kdf_id: u16,
    pub aead_id: u16,
    pub config_id: u8,
    pub enc: &'a [u8],
    pub payload: &'a [u8],
    /// Offset of `payload` within the outer ClientHello body.
    pub payload_offset: usize,
}

/// Parse an `encrypted_client_hello` extension sent in a ClientHelloOuter.
pub fn parse_outer_ech<'a>(ext: &Extension<'a>) -> Result<OuterEch<'a>> {
    let mut r = Reader::new(ext.data);
    let ech_type = r.u8()?;
    if ech_type != 0 {
        return Err(GatewayError::Ech(format!(
            "expected outer ECH extension, got type {}",
            ech_type
        )));
    }
    let kdf_id = r.u16()?;
    let aead_id = r.u16()?;
    let config_id = r.u8()?;
    let enc = r.vec16()?;
    let payload_len = r.u16()? as usize;
    let payload_offset = ext.offset + r.position();
    let payload = r.take(payload_len)?;
    if !r.is_empty() {
        return Err(GatewayError::Ech("trailing bytes in ECH extension".to_string()));
    }

    Ok(OuterEch {
        kdf_id,
        aead_id,
        config_id,
        enc,
        payload,
        payload_offset,
    })
}

/// Rebuild the ClientHelloInner handshake message from its decrypted
/// EncodedClientHelloInner and the outer hello it was sent in.
pub fn decode_inner_hello(encoded: &[u8], outer: &ClientHello<'_>) -> Result<Vec<u8>> {
    let mut r = Reader::new(encoded);
    let legacy_version = r.u16()?;
    let random = r.take(32)?;
    let _empty_session_id = r.vec8()?;
    let cipher_suites = r.vec16()?;
    let compression_methods = r.vec8()?;
    let inner_extensions = parse_extensions(&mut r)?;
    if r.rest().iter().any(|b| *b != 0) {
        return Err(GatewayError::Ech("non-zero padding in ClientHelloInner".to_string()));
    }

    let mut extensions = Vec::new();
    let mut outer_cursor = 0;
    for ext in &inner_extensions {
        if ext.typ != EXT_ECH_OUTER_EXTENSIONS {
            put_u16(&mut extensions, ext.typ);
            put_vec16(&mut extensions, ext.data)?;
            continue;
        }

        let mut refs = Reader::new(Reader::new(ext.data).vec8()?);
        while !refs.is_empty() {
            let typ = refs.u16()?;
            if typ == EXT_ENCRYPTED_CLIENT_HELLO {
                return Err(GatewayError::Ech(
                    "ech_outer_extensions references encrypted_client_hello".to_string(),
                ));
            }
            let found = outer.extensions[outer_cursor..]
                .iter()
                .position(|e| e.typ == typ)
                .ok_or_else(|| {
                    GatewayError::Ech(format!(
                        "outer extension {:#06x} missing or out of order",
                        typ
                    ))
                })?;
            let copied = &outer.extensions[outer_cursor + found];
            outer_cursor += found + 1;
            put_u16(&mut extensions, copied.typ);
            put_vec16(&mut extensions, copied.data)?;
        }
    }

    let mut body = Vec::with_capacity(encoded.len() + extensions.len());
    put_u16(&mut body, legacy_version);
    body.extend_from_slice(random);
    put_vec8(&mut body, outer.session_id)?;
    put_vec16(&mut body, cipher_suites)?;
    put_vec8(&mut body, compression_methods)?;
    put_vec16(&mut body, &extensions)?;

    Ok(handshake_message(HANDSHAKE_CLIENT_HELLO, &body))
}

pub fn handshake_message(typ: u8, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
    message.push(typ);
    put_u24(&mut message, body.len());
    message.extend_from_slice(body);
    message
}

/// Split a handshake message into TLS records.
pub fn frame_handshake(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + RECORD_HEADER_LEN);
    for chunk in message.chunks(MAX_RECORD_LEN) {
        out.push(CONTENT_TYPE_HANDSHAKE);
        out.extend_from_slice(&[0x03, 0x01]);
        put_u16(&mut out, chunk.len() as u16);
        out.extend_from_slice(chunk);
    }
    out
}
