//! Kubespiffe - SVID issuer for Kubernetes workloads

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubespiffe::attest::{Attestor, KubeRegistrationStore};
use kubespiffe::config::Config;
use kubespiffe::crd::WorkloadRegistration;
use kubespiffe::keys::ClusterKeySource;
use kubespiffe::server::{start_server, AppState};
use kubespiffe::svid::CertificateAuthority;
use kubespiffe::verify::TokenVerifier;

/// Kubespiffe - SPIFFE-style SVID issuance for Kubernetes workloads
#[derive(Parser, Debug)]
#[command(name = "kubespiffe", version, about, long_about = None)]
struct Cli {
    /// Generate the WorkloadRegistration CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Address the HTTP server binds
    #[arg(long, env = "BIND_ADDR", default_value = kubespiffe::DEFAULT_BIND_ADDR)]
    bind: std::net::SocketAddr,

    /// Trust domain applied to registrations that leave theirs empty
    #[arg(long, env = "TRUST_DOMAIN", default_value = kubespiffe::DEFAULT_TRUST_DOMAIN)]
    trust_domain: String,

    /// Issuer expected in presented tokens
    #[arg(long, env = "TOKEN_ISSUER", default_value = kubespiffe::KUBERNETES_ISSUER)]
    issuer: String,

    /// Audience presented tokens must carry
    #[arg(long, env = "TOKEN_AUDIENCE", default_value = kubespiffe::DEFAULT_AUDIENCE)]
    audience: String,

    /// Endpoint serving the cluster's signing keys
    #[arg(long, env = "JWKS_URL", default_value = kubespiffe::DEFAULT_JWKS_URL)]
    jwks_url: String,

    /// Service-account token used to authenticate the key fetch
    #[arg(long, env = "SA_TOKEN_PATH", default_value = kubespiffe::SERVICE_ACCOUNT_TOKEN_PATH)]
    sa_token_path: std::path::PathBuf,

    /// CA bundle the key fetch is pinned to
    #[arg(long, env = "SA_CA_PATH", default_value = kubespiffe::SERVICE_ACCOUNT_CA_PATH)]
    ca_bundle_path: std::path::PathBuf,

    /// Key fetch timeout in seconds
    #[arg(long, default_value = "5")]
    fetch_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    // This MUST succeed for the application to operate securely.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The issuer cannot operate without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&WorkloadRegistration::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = Config {
        bind_addr: cli.bind,
        trust_domain: cli.trust_domain,
        issuer: cli.issuer,
        audience: cli.audience,
        jwks_url: cli.jwks_url,
        sa_token_path: cli.sa_token_path,
        ca_bundle_path: cli.ca_bundle_path,
        fetch_timeout: Duration::from_secs(cli.fetch_timeout_secs),
    };

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let key_source = ClusterKeySource::new(&config);

    // A CA that cannot bootstrap is fatal; without it no SVID can be minted.
    let ca = CertificateAuthority::bootstrap(&config.trust_domain)
        .map_err(|e| anyhow::anyhow!("Failed to bootstrap certificate authority: {}", e))?;

    let state = AppState {
        key_source: Arc::new(key_source),
        verifier: TokenVerifier::new(&config.issuer, &config.audience),
        attestor: Attestor::new(Arc::new(KubeRegistrationStore::new(client))),
        ca: Arc::new(ca),
        trust_domain: config.trust_domain.clone(),
    };

    start_server(state, config.bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}
