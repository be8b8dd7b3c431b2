#![allow(dead_code)]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ech_gateway::cert::{build_server_config, certified_key_from_pem};
use ech_gateway::doh::{AnswerSet, DohResponder};
use ech_gateway::ech::EchKeys;
use ech_gateway::hello::{
    frame_handshake, handshake_message, parse_outer_ech, ClientHello, EXT_ECH_OUTER_EXTENSIONS,
    EXT_ENCRYPTED_CLIENT_HELLO, EXT_SERVER_NAME, HANDSHAKE_CLIENT_HELLO,
};
use ech_gateway::mux::ServeMux;
use ech_gateway::tls_crypto::build_provider;
use ech_gateway::{DualProtocolServer, EchGateway, GatewayConfig};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use hpke::aead::AesGcm128;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem, OpModeS, Serializable};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub const IPV4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);
pub const IPV6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 10);

pub struct TestCert {
    pub der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn self_signed(hostname: &str) -> TestCert {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![hostname.to_string()]).unwrap();
    TestCert {
        der: cert.der().clone(),
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    }
}

pub fn server_config(hostname: &str, cert: &TestCert) -> Arc<ServerConfig> {
    let provider = build_provider();
    let key =
        certified_key_from_pem(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes(), &provider)
            .unwrap();
    build_server_config(hostname, Arc::new(key), provider).unwrap()
}

pub fn client_config(root: &CertificateDer<'static>, alpn: &[&[u8]]) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(root.clone()).unwrap();
    let mut config = ClientConfig::builder_with_provider(build_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

pub async fn connect(
    addr: std::net::SocketAddr,
    sni: &str,
    cert: &TestCert,
    alpn: &[&[u8]],
) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let connector = TlsConnector::from(client_config(&cert.der, alpn));
    let sni = ServerName::try_from(sni.to_string()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), connector.connect(sni, tcp))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))?
}

pub fn test_mux(ech_config_list: Vec<u8>) -> ServeMux {
    let mut mux = ServeMux::new();
    mux.handle(
        "/dns-query",
        DohResponder::new(AnswerSet {
            ipv4: IPV4,
            ipv6: IPV6,
            ech_config_list,
        }),
    );
    mux
}

pub struct RunningGateway {
    pub addr: SocketAddr,
    pub keys: Arc<EchKeys>,
    pub gateway: Arc<EchGateway>,
    pub server: Arc<DualProtocolServer>,
    task: JoinHandle<()>,
}

impl RunningGateway {
    pub fn shutdown(self) {
        self.gateway.stop();
        self.server.close().unwrap();
        self.task.abort();
    }
}

/// Start a gateway on an ephemeral loopback port.
pub async fn start_gateway(mut config: GatewayConfig, cert: &TestCert) -> RunningGateway {
    config.bind_addr = "127.0.0.1".to_string();
    config.bind_port = 0;

    let tls_config = server_config(&config.hostname, cert);
    let keys = Arc::new(EchKeys::generate(config.ech_config_id, &config.public_name).unwrap());
    let server = DualProtocolServer::new(test_mux(keys.config_list().to_vec()));
    let gateway = Arc::new(EchGateway::new(&config, keys.clone(), tls_config, server.clone()));

    let task = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway.start().await.unwrap();
        })
    };

    let addr = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(addr) = gateway.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    RunningGateway {
        addr,
        keys,
        gateway,
        server,
        task,
    }
}

pub fn dns_query(name: &str, query_type: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(7);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_ascii(name).unwrap(), query_type));
    message.to_vec().unwrap()
}

fn vec8(data: &[u8]) -> Vec<u8> {
    let mut out = vec![data.len() as u8];
    out.extend_from_slice(data);
    out
}

fn vec16(data: &[u8]) -> Vec<u8> {
    let mut out = (data.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(data);
    out
}

fn ext(typ: u16, data: &[u8]) -> Vec<u8> {
    let mut out = typ.to_be_bytes().to_vec();
    out.extend(vec16(data));
    out
}

fn sni_ext(name: &str) -> Vec<u8> {
    let mut entry = vec![0u8];
    entry.extend(vec16(name.as_bytes()));
    ext(EXT_SERVER_NAME, &vec16(&entry))
}

fn hello_body(random: [u8; 32], session_id: &[u8], extensions: &[Vec<u8>]) -> Vec<u8> {
    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&random);
    body.extend(vec8(session_id));
    body.extend(vec16(&[0x13, 0x01, 0x13, 0x02]));
    body.extend(vec8(&[0]));
    body.extend(vec16(&extensions.concat()));
    body
}

/// The X25519 public key inside the gateway's ECHConfig.
fn ech_public_key(config: &[u8]) -> <X25519HkdfSha256 as Kem>::PublicKey {
    // version(2) length(2) config_id(1) kem_id(2)
    let contents = &config[4..];
    assert_eq!(&contents[1..3], &[0x00, 0x20]);
    let len = u16::from_be_bytes([contents[3], contents[4]]) as usize;
    <X25519HkdfSha256 as Kem>::PublicKey::from_bytes(&contents[5..5 + len]).unwrap()
}

/// A ClientHelloOuter that seals a ClientHelloInner naming `inner_name` for
/// the gateway's ECH config.
///
/// Returns the records to send and the inner hello handshake message the
/// gateway is expected to replay.
pub fn sealed_client_hello(keys: &EchKeys, inner_name: &str) -> (Vec<u8>, Vec<u8>) {
    let versions = ext(0x002b, &[2, 3, 4]);
    let outer_refs = vec8(&0x002bu16.to_be_bytes());

    let mut encoded = hello_body(
        [2; 32],
        &[],
        &[
            sni_ext(inner_name),
            ext(EXT_ECH_OUTER_EXTENSIONS, &outer_refs),
            ext(EXT_ENCRYPTED_CLIENT_HELLO, &[1]),
        ],
    );
    encoded.extend_from_slice(&[0; 16]);

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

    let info = [b"tls ech\0".as_slice(), keys.config()].concat();
    let (enc, mut ctx) = hpke::setup_sender::<AesGcm128, HkdfSha256, X25519HkdfSha256, _>(
        &OpModeS::Base,
        &ech_public_key(keys.config()),
        &info,
        &mut rand::rngs::OsRng,
    )
    .unwrap();
    let enc = enc.to_bytes();

    // AES-128-GCM adds a 16 byte tag.
    let placeholder = vec![0u8; encoded.len() + 16];
    let mut ech = vec![0u8];
    ech.extend_from_slice(&1u16.to_be_bytes());
    ech.extend_from_slice(&1u16.to_be_bytes());
    ech.push(keys.config_id());
    ech.extend(vec16(&enc));
    ech.extend(vec16(&placeholder));

    let mut outer_body = hello_body(
        [1; 32],
        &[5; 32],
        &[
            sni_ext(keys.public_name()),
            versions,
            ext(EXT_ENCRYPTED_CLIENT_HELLO, &ech),
        ],
    );
    let payload_offset = {
        let outer = ClientHello::parse(&outer_body).unwrap();
        parse_outer_ech(outer.extension(EXT_ENCRYPTED_CLIENT_HELLO).unwrap())
            .unwrap()
            .payload_offset
    };
    let sealed = ctx.seal(&encoded, &outer_body).unwrap();
    assert_eq!(sealed.len(), placeholder.len());
    outer_body[payload_offset..payload_offset + sealed.len()].copy_from_slice(&sealed);

    let wire = frame_handshake(&handshake_message(HANDSHAKE_CLIENT_HELLO, &outer_body));
    (wire, expected_inner)
}
