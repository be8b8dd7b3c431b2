//! Generate a self-signed server certificate for local testing
//!
//! cargo run --bin gen_cert -- doh.example

use std::fs;
use std::path::Path;

fn main() {
    let hostname = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "localhost".to_string());
    println!("Generating certificate for {}...", hostname);

    let (cert_pem, key_pem) = generate_cert(&hostname).expect("Failed to generate certificate");

    let certs_dir = Path::new("certs");
    fs::create_dir_all(certs_dir).expect("Failed to create certs directory");

    let cert_path = certs_dir.join("server.crt");
    fs::write(&cert_path, &cert_pem).expect("Failed to write certificate");
    println!("Certificate written to: {}", cert_path.display());

    let key_path = certs_dir.join("server.key");
    fs::write(&key_path, &key_pem).expect("Failed to write key");
    println!("Private key written to: {}", key_path.display());
}

fn generate_cert(hostname: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    use rcgen::{
        CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
        KeyUsagePurpose,
    };

    let mut params = CertificateParams::new(vec![hostname.to_string()])?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    dn.push(DnType::OrganizationName, "ECH Gateway");
    params.distinguished_name = dn;

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    // Valid for 1 year
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(365);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}
