use std::sync::Arc;

use rustls::crypto::CryptoProvider;

/// Crypto provider shared by every rustls config in the gateway.
///
/// The `ech` feature switches to aws-lc-rs, whose HPKE suites rustls needs
/// for client-side ECH.
pub fn build_provider() -> Arc<CryptoProvider> {
    #[cfg(feature = "ech")]
    {
        Arc::new(rustls::crypto::aws_lc_rs::default_provider())
    }

    #[cfg(not(feature = "ech"))]
    {
        Arc::new(rustls::crypto::ring::default_provider())
    }
}
