//! ECH Gateway - Standalone executable

use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use ech_gateway::cert::{build_server_config, load_certified_key};
use ech_gateway::doh::{AnswerSet, DohResponder};
use ech_gateway::ech::EchKeys;
use ech_gateway::listener::TlsListener;
use ech_gateway::mux::ServeMux;
use ech_gateway::tls_crypto::build_provider;
use ech_gateway::{DualProtocolServer, EchGateway, GatewayConfig, GatewayError, Result};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ech-gateway", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    /// Hostname the certificate is served for
    #[arg(long)]
    hostname: Option<String>,
    /// ECH public name
    #[arg(long)]
    public_name: Option<String>,
    #[arg(long)]
    cert: Option<PathBuf>,
    #[arg(long)]
    key: Option<PathBuf>,
    #[arg(long)]
    ipv4: Option<Ipv4Addr>,
    #[arg(long)]
    ipv6: Option<Ipv6Addr>,
    /// Also serve DoH on a plain TLS listener at this address
    #[arg(long)]
    doh_listen: Option<String>,
    /// Write the base64 ECHConfigList to this file
    #[arg(long)]
    ech_config_out: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::load(path)?,
            None => GatewayConfig::default(),
        };

        if let Some(bind_addr) = self.bind_addr {
            config.bind_addr = bind_addr;
        }
        if let Some(port) = self.port {
            config.bind_port = port;
        }
        if let Some(hostname) = self.hostname {
            config.hostname = hostname;
        }
        if let Some(public_name) = self.public_name {
            config.public_name = public_name;
        }
        if let Some(cert) = self.cert {
            config.cert_path = cert;
        }
        if let Some(key) = self.key {
            config.key_path = key;
        }
        if let Some(ipv4) = self.ipv4 {
            config.ipv4 = ipv4;
        }
        if let Some(ipv6) = self.ipv6 {
            config.ipv6 = ipv6;
        }
        if self.doh_listen.is_some() {
            config.doh_listen = self.doh_listen;
        }
        if self.ech_config_out.is_some() {
            config.ech_config_out = self.ech_config_out;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive(format!("ech_gateway={}", cli.log_level).parse()?),
        )
        .init();

    info!("Starting ECH Gateway");

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Config: {:?}", config);

    if let Err(e) = run(config).await {
        error!("Gateway failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(config: GatewayConfig) -> Result<()> {
    let provider = build_provider();
    let key = load_certified_key(&config.cert_path, &config.key_path, &provider)?;
    let tls_config = build_server_config(&config.hostname, Arc::new(key), provider)?;

    let keys = Arc::new(EchKeys::generate(config.ech_config_id, &config.public_name)?);
    let encoded = STANDARD.encode(keys.config_list());
    info!("ECH config list: {}", encoded);
    if let Some(path) = &config.ech_config_out {
        fs::write(path, &encoded).map_err(|e| {
            GatewayError::Config(format!("Failed to write {}: {}", path.display(), e))
        })?;
        info!("ECH config list written to {}", path.display());
    }

    let answers = AnswerSet {
        ipv4: config.ipv4,
        ipv6: config.ipv6,
        ech_config_list: keys.config_list().to_vec(),
    };
    let mut mux = ServeMux::new();
    mux.handle(config.doh_path.clone(), DohResponder::new(answers));
    let server = DualProtocolServer::new(mux);

    if let Some(addr) = &config.doh_listen {
        let listener = TlsListener::bind(addr, TlsAcceptor::from(tls_config.clone())).await?;
        info!("DoH listener on {}", listener.local_addr());
        let server = server.clone();
        let listener = Arc::new(listener);
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                warn!("DoH listener stopped: {}", e);
            }
        });
    }

    let gateway = EchGateway::new(&config, keys, tls_config, server.clone());

    // Handle Ctrl+C
    let result = tokio::select! {
        result = gateway.start() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            gateway.stop();
            Ok(())
        }
    };

    if let Err(e) = server.close() {
        warn!("Error closing HTTP server: {}", e);
    }
    result
}
