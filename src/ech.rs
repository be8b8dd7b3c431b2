//! Server-side Encrypted Client Hello
//!
//! [`EchKeys`] holds the gateway's HPKE key pair and the ECHConfigList
//! published through DNS. [`EchAcceptor`] reads the first ClientHello off a
//! raw connection and, when it carries an ECH payload for our config,
//! decrypts it and reveals the concealed server name. Either way it hands
//! back an [`EchStream`] that replays the hello the next TLS endpoint should
//! see: ClientHelloInner when ECH was accepted, the untouched outer hello
//! otherwise.
//!
//! The gateway runs ECH in split mode. ClientHelloInner keeps its
//! `encrypted_client_hello` marker, so the backend that answers it is the
//! one that signals acceptance in its ServerHello; server bytes are relayed
//! unchanged.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hpke::aead::{Aead, AesGcm128, AesGcm256, ChaCha20Poly1305};
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem as KemTrait, OpModeR, Serializable};
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::hello::{
    decode_inner_hello, frame_handshake, parse_outer_ech, put_u16, put_vec16, put_vec8,
    read_client_hello, ClientHello, RawClientHello, EXT_ENCRYPTED_CLIENT_HELLO,
    HANDSHAKE_HEADER_LEN,
};

type Kem = X25519HkdfSha256;

pub const ECH_VERSION: u16 = 0xfe0d;
const KEM_X25519_HKDF_SHA256: u16 = 0x0020;
const KDF_HKDF_SHA256: u16 = 0x0001;
const AEAD_AES_128_GCM: u16 = 0x0001;
const AEAD_AES_256_GCM: u16 = 0x0002;
const AEAD_CHACHA20_POLY1305: u16 = 0x0003;

const CIPHER_SUITES: [(u16, u16); 3] = [
    (KDF_HKDF_SHA256, AEAD_AES_128_GCM),
    (KDF_HKDF_SHA256, AEAD_AES_256_GCM),
    (KDF_HKDF_SHA256, AEAD_CHACHA20_POLY1305),
];

const HPKE_INFO_PREFIX: &[u8] = b"tls ech\0";

/// The gateway's ECH key pair and its encoded configuration.
pub struct EchKeys {
    config_id: u8,
    public_name: String,
    private_key: <Kem as KemTrait>::PrivateKey,
    config: Vec<u8>,
    config_list: Vec<u8>,
}

impl EchKeys {
    /// Generate a fresh X25519 key pair and encode its ECHConfig.
    pub fn generate(config_id: u8, public_name: &str) -> Result<Self> {
        if public_name.is_empty() || public_name.len() > u8::MAX as usize {
            return Err(GatewayError::Ech(format!(
                "invalid ECH public name {:?}",
                public_name
            )));
        }

        let (private_key, public_key) = Kem::gen_keypair(&mut OsRng);

        let mut contents = vec![config_id];
        put_u16(&mut contents, KEM_X25519_HKDF_SHA256);
        put_vec16(&mut contents, public_key.to_bytes().as_slice())?;
        let mut suites = Vec::new();
        for (kdf, aead) in CIPHER_SUITES {
            put_u16(&mut suites, kdf);
            put_u16(&mut suites, aead);
        }
        put_vec16(&mut contents, &suites)?;
        // maximum_name_length: let the client pick its own padding
        contents.push(0);
        put_vec8(&mut contents, public_name.as_bytes())?;
        put_vec16(&mut contents, &[])?;

        let mut config = Vec::new();
        put_u16(&mut config, ECH_VERSION);
        put_vec16(&mut config, &contents)?;

        let mut config_list = Vec::new();
        put_vec16(&mut config_list, &config)?;

        Ok(Self {
            config_id,
            public_name: public_name.to_string(),
            private_key,
            config,
            config_list,
        })
    }

    pub fn config_id(&self) -> u8 {
        self.config_id
    }

    pub fn public_name(&self) -> &str {
        &self.public_name
    }

    /// The single encoded ECHConfig.
    pub fn config(&self) -> &[u8] {
        &self.config
    }

    /// ECHConfigList as published in the `ech` SvcParam.
    pub fn config_list(&self) -> &[u8] {
        &self.config_list
    }
}

impl fmt::Debug for EchKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchKeys")
            .field("config_id", &self.config_id)
            .field("public_name", &self.public_name)
            .finish_non_exhaustive()
    }
}

fn open<A: Aead>(
    private_key: &<Kem as KemTrait>::PrivateKey,
    enc: &[u8],
    info: &[u8],
    aad: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>> {
    let encapped = <Kem as KemTrait>::EncappedKey::from_bytes(enc)
        .map_err(|e| GatewayError::Ech(format!("bad encapsulated key: {}", e)))?;
    hpke::single_shot_open::<A, HkdfSha256, Kem>(
        &OpModeR::Base,
        private_key,
        &encapped,
        info,
        payload,
        aad,
    )
    .map_err(|e| GatewayError::Ech(format!("HPKE open failed: {}", e)))
}

/// Runs ECH negotiation on raw connections.
#[derive(Clone, Debug)]
pub struct EchAcceptor {
    keys: Arc<EchKeys>,
}

impl EchAcceptor {
    pub fn new(keys: Arc<EchKeys>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &EchKeys {
        &self.keys
    }

    /// Read the first ClientHello from `io` and try to open its ECH payload.
    ///
    /// Fails only when the first flight is not a well-formed ClientHello or
    /// a successfully decrypted inner hello is malformed. A payload for
    /// another config, or one that does not decrypt, is a rejection: the
    /// returned stream is not accepted and replays the outer hello.
    pub async fn accept<IO>(&self, mut io: IO) -> Result<EchStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let raw = read_client_hello(&mut io).await?;
        let outer = ClientHello::parse(raw.body())?;

        match self.open_inner(&raw, &outer)? {
            Some((inner, server_name)) => {
                debug!("ECH accepted for {}", server_name);
                Ok(EchStream {
                    io,
                    replay: frame_handshake(&inner),
                    replay_pos: 0,
                    accepted: true,
                    server_name: Some(server_name),
                })
            }
            None => {
                let server_name = outer.server_name();
                Ok(EchStream {
                    io,
                    replay: raw.consumed,
                    replay_pos: 0,
                    accepted: false,
                    server_name,
                })
            }
        }
    }

    fn open_inner(
        &self,
        raw: &RawClientHello,
        outer: &ClientHello<'_>,
    ) -> Result<Option<(Vec<u8>, String)>> {
        let Some(ext) = outer.extension(EXT_ENCRYPTED_CLIENT_HELLO) else {
            return Ok(None);
        };
        let ech = parse_outer_ech(ext)?;
        if ech.config_id != self.keys.config_id || ech.kdf_id != KDF_HKDF_SHA256 {
            debug!(
                "ECH payload for config {} kdf {:#06x} not ours",
                ech.config_id, ech.kdf_id
            );
            return Ok(None);
        }

        let mut aad = raw.body().to_vec();
        aad[ech.payload_offset..ech.payload_offset + ech.payload.len()].fill(0);
        let info = [HPKE_INFO_PREFIX, &self.keys.config].concat();
        let sk = &self.keys.private_key;

        let opened = match ech.aead_id {
            AEAD_AES_128_GCM => open::<AesGcm128>(sk, ech.enc, &info, &aad, ech.payload),
            AEAD_AES_256_GCM => open::<AesGcm256>(sk, ech.enc, &info, &aad, ech.payload),
            AEAD_CHACHA20_POLY1305 => {
                open::<ChaCha20Poly1305>(sk, ech.enc, &info, &aad, ech.payload)
            }
            other => Err(GatewayError::Ech(format!("unsupported AEAD {:#06x}", other))),
        };
        let encoded = match opened {
            Ok(encoded) => encoded,
            Err(e) => {
                debug!("ECH rejected: {}", e);
                return Ok(None);
            }
        };

        let inner = decode_inner_hello(&encoded, outer)?;
        let server_name = {
            let hello = ClientHello::parse(&inner[HANDSHAKE_HEADER_LEN..])?;
            match hello.extension(EXT_ENCRYPTED_CLIENT_HELLO) {
                Some(marker) if marker.data == &[1] => {}
                _ => {
                    return Err(GatewayError::Ech(
                        "ClientHelloInner without inner ECH marker".to_string(),
                    ))
                }
            }
            hello.server_name().ok_or_else(|| {
                GatewayError::Ech("ClientHelloInner without server name".to_string())
            })?
        };

        Ok(Some((inner, server_name)))
    }
}

/// A raw connection after ECH negotiation.
///
/// Reads first replay the ClientHello chosen during negotiation, then
/// continue from the connection. Writes go straight through.
pub struct EchStream<IO> {
    io: IO,
    replay: Vec<u8>,
    replay_pos: usize,
    accepted: bool,
    server_name: Option<String>,
}

impl<IO> EchStream<IO> {
    pub fn ech_accepted(&self) -> bool {
        self.accepted
    }

    /// The inner SNI when ECH was accepted, the outer SNI otherwise.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn get_ref(&self) -> &IO {
        &self.io
    }
}

impl<IO> fmt::Debug for EchStream<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchStream")
            .field("accepted", &self.accepted)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for EchStream<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.replay_pos < this.replay.len() {
            let n = buf.remaining().min(this.replay.len() - this.replay_pos);
            buf.put_slice(&this.replay[this.replay_pos..this.replay_pos + n]);
            this.replay_pos += n;
            if this.replay_pos == this.replay.len() {
                this.replay = Vec::new();
                this.replay_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for EchStream<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hello::tests::{ext, hello_body, sni_ext};
    use crate::hello::{handshake_message, Reader, EXT_ECH_OUTER_EXTENSIONS, HANDSHAKE_CLIENT_HELLO};
    use hpke::OpModeS;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn public_key(keys: &EchKeys) -> <Kem as KemTrait>::PublicKey {
        let mut r = Reader::new(keys.config());
        assert_eq!(r.u16().unwrap(), ECH_VERSION);
        let mut contents = Reader::new(r.vec16().unwrap());
        assert_eq!(contents.u8().unwrap(), keys.config_id());
        assert_eq!(contents.u16().unwrap(), KEM_X25519_HKDF_SHA256);
        let pk = contents.vec16().unwrap();
        <Kem as KemTrait>::PublicKey::from_bytes(pk).unwrap()
    }

    fn ech_extension(config_id: u8, enc: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8];
        put_u16(&mut data, KDF_HKDF_SHA256);
        put_u16(&mut data, AEAD_AES_128_GCM);
        data.push(config_id);
        put_vec16(&mut data, enc).unwrap();
        put_vec16(&mut data, payload).unwrap();
        ext(EXT_ENCRYPTED_CLIENT_HELLO, &data)
    }

    /// Build a client's first flight carrying an ECH payload for `keys`,
    /// announced under `config_id`. Returns the wire bytes and the
    /// ClientHelloInner the server should reconstruct.
    fn sealed_client_hello(keys: &EchKeys, config_id: u8, inner_name: &str) -> (Vec<u8>, Vec<u8>) {
        let versions = ext(0x002b, &[2, 3, 4]);

        let mut refs = Vec::new();
        put_u16(&mut refs, 0x002b);
        let mut outer_refs = Vec::new();
        put_vec8(&mut outer_refs, &refs).unwrap();

        let mut encoded = hello_body(
            [2; 32],
            &[],
            &[
                sni_ext(inner_name),
                ext(EXT_ECH_OUTER_EXTENSIONS, &outer_refs),
                ext(EXT_ENCRYPTED_CLIENT_HELLO, &[1]),
            ],
        );
        encoded.extend_from_slice(&[0; 24]);

        let expected_inner = handshake_message(
            HANDSHAKE_CLIENT_HELLO,
            &hello_body(
                [2; 32],
                &[5; 32],
                &[
                    sni_ext(inner_name),
                    versions.clone(),
                    ext(EXT_ENCRYPTED_CLIENT_HELLO, &[1]),
                ],
            ),
        );

        let info = [HPKE_INFO_PREFIX, keys.config()].concat();
        let (enc, mut ctx) = hpke::setup_sender::<AesGcm128, HkdfSha256, Kem, _>(
            &OpModeS::Base,
            &public_key(keys),
            &info,
            &mut OsRng,
        )
        .unwrap();
        let enc = enc.to_bytes();

        // AES-128-GCM adds a 16 byte tag.
        let placeholder = vec![0u8; encoded.len() + 16];
        let mut outer_body = hello_body(
            [1; 32],
            &[5; 32],
            &[
                sni_ext(keys.public_name()),
                versions,
                ech_extension(config_id, &enc, &placeholder),
            ],
        );
        let payload_offset = {
            let outer = ClientHello::parse(&outer_body).unwrap();
            let ech = parse_outer_ech(outer.extension(EXT_ENCRYPTED_CLIENT_HELLO).unwrap()).unwrap();
            ech.payload_offset
        };
        let sealed = ctx.seal(&encoded, &outer_body).unwrap();
        assert_eq!(sealed.len(), placeholder.len());
        outer_body[payload_offset..payload_offset + sealed.len()].copy_from_slice(&sealed);

        let wire = frame_handshake(&handshake_message(HANDSHAKE_CLIENT_HELLO, &outer_body));
        (wire, expected_inner)
    }

    fn test_keys() -> Arc<EchKeys> {
        Arc::new(EchKeys::generate(114, "doh.example").unwrap())
    }

    #[test]
    fn test_generate_config_list() {
        let keys = EchKeys::generate(7, "public.example").unwrap();
        let list = keys.config_list();

        assert_eq!(u16::from_be_bytes([list[0], list[1]]) as usize, list.len() - 2);
        assert_eq!(&list[2..], keys.config());
        assert_eq!(&keys.config()[..2], &ECH_VERSION.to_be_bytes());

        let mut r = Reader::new(keys.config());
        r.u16().unwrap();
        let mut contents = Reader::new(r.vec16().unwrap());
        assert_eq!(contents.u8().unwrap(), 7);
        assert_eq!(contents.u16().unwrap(), KEM_X25519_HKDF_SHA256);
        assert_eq!(contents.vec16().unwrap().len(), 32);
        assert_eq!(contents.vec16().unwrap().len(), 12);
        assert_eq!(contents.u8().unwrap(), 0);
        assert_eq!(contents.vec8().unwrap(), b"public.example");
        assert_eq!(contents.vec16().unwrap(), b"");
        assert!(contents.is_empty());
    }

    #[test]
    fn test_generate_rejects_bad_public_name() {
        assert!(EchKeys::generate(1, "").is_err());
        assert!(EchKeys::generate(1, &"a".repeat(256)).is_err());
    }

    #[test]
    fn test_each_generation_uses_a_new_key() {
        let a = EchKeys::generate(1, "doh.example").unwrap();
        let b = EchKeys::generate(1, "doh.example").unwrap();
        assert_ne!(a.config(), b.config());
    }

    #[tokio::test]
    async fn test_accepts_ech_and_replays_inner_hello() {
        let keys = test_keys();
        let (wire, expected_inner) = sealed_client_hello(&keys, keys.config_id(), "secret.example");

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(&wire).await.unwrap();
        client.write_all(b"after").await.unwrap();

        let mut stream = EchAcceptor::new(keys).accept(server).await.unwrap();
        assert!(stream.ech_accepted());
        assert_eq!(stream.server_name(), Some("secret.example"));

        let expected_records = frame_handshake(&expected_inner);
        let mut replayed = vec![0u8; expected_records.len()];
        stream.read_exact(&mut replayed).await.unwrap();
        assert_eq!(replayed, expected_records);

        let mut rest = [0u8; 5];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"after");
    }

    #[tokio::test]
    async fn test_accepted_stream_relays_server_bytes_unchanged() {
        let keys = test_keys();
        let (wire, _) = sealed_client_hello(&keys, keys.config_id(), "secret.example");

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(&wire).await.unwrap();
        let mut stream = EchAcceptor::new(keys).accept(server).await.unwrap();
        assert!(stream.ech_accepted());

        // A ServerHello whose handshake length disagrees with its record,
        // followed by application data: none of it is inspected.
        let mut server_bytes = vec![22, 3, 3, 0, 42, 2, 0, 0, 0, 3, 3];
        server_bytes.extend_from_slice(&[0xaa; 32]);
        server_bytes.extend_from_slice(&[0, 0x13, 0x01, 0]);
        server_bytes.extend_from_slice(b"\x17\x03\x03\x00\x02hi");
        stream.write_all(&server_bytes[..20]).await.unwrap();
        stream.write_all(&server_bytes[20..]).await.unwrap();
        stream.flush().await.unwrap();

        let mut received = vec![0u8; server_bytes.len()];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, server_bytes);
    }

    #[tokio::test]
    async fn test_plain_hello_is_not_accepted() {
        let keys = test_keys();
        let body = hello_body([1; 32], &[], &[sni_ext("doh.example"), ext(0x002b, &[2, 3, 4])]);
        let wire = frame_handshake(&handshake_message(HANDSHAKE_CLIENT_HELLO, &body));

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(&wire).await.unwrap();

        let mut stream = EchAcceptor::new(keys).accept(server).await.unwrap();
        assert!(!stream.ech_accepted());
        assert_eq!(stream.server_name(), Some("doh.example"));

        let mut replayed = vec![0u8; wire.len()];
        stream.read_exact(&mut replayed).await.unwrap();
        assert_eq!(replayed, wire);

        stream.write_all(b"server bytes").await.unwrap();
        let mut echoed = [0u8; 12];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"server bytes");
    }

    #[tokio::test]
    async fn test_hello_without_sni_is_not_accepted() {
        let keys = test_keys();
        let body = hello_body([1; 32], &[], &[ext(0x002b, &[2, 3, 4])]);
        let wire = frame_handshake(&handshake_message(HANDSHAKE_CLIENT_HELLO, &body));

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(&wire).await.unwrap();

        let stream = EchAcceptor::new(keys).accept(server).await.unwrap();
        assert!(!stream.ech_accepted());
        assert_eq!(stream.server_name(), None);
    }

    #[tokio::test]
    async fn test_unknown_config_id_is_rejected() {
        let keys = test_keys();
        let (wire, _) = sealed_client_hello(&keys, keys.config_id().wrapping_add(1), "secret.example");

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(&wire).await.unwrap();

        let mut stream = EchAcceptor::new(keys).accept(server).await.unwrap();
        assert!(!stream.ech_accepted());
        assert_eq!(stream.server_name(), Some("doh.example"));

        let mut replayed = vec![0u8; wire.len()];
        stream.read_exact(&mut replayed).await.unwrap();
        assert_eq!(replayed, wire);
    }

    #[tokio::test]
    async fn test_payload_for_other_key_is_rejected() {
        let keys = test_keys();
        let other = EchKeys::generate(keys.config_id(), "doh.example").unwrap();
        let (wire, _) = sealed_client_hello(&other, keys.config_id(), "secret.example");

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(&wire).await.unwrap();

        let stream = EchAcceptor::new(keys).accept(server).await.unwrap();
        assert!(!stream.ech_accepted());
    }

    #[tokio::test]
    async fn test_non_tls_input_fails_negotiation() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(EchAcceptor::new(test_keys()).accept(server).await.is_err());
    }
}
