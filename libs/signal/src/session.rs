use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use rustls_pki_types::pem::PemObject as _;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use secrecy::{ExposeSecret as _, SecretString};
use url::Url;

use weft_model::{AuthMethod, NodeId, OverlayConfig, OverlayId};

/// Everything needed to establish one overlay's presence session.
#[derive(Clone)]
pub struct SessionConfig {
    pub overlay_id: OverlayId,
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub auth: SessionAuth,
}

#[derive(Clone)]
pub enum SessionAuth {
    Password {
        username: String,
        password: SecretString,
    },
    Certificate {
        cert_file: PathBuf,
        key_file: PathBuf,
    },
}

impl SessionConfig {
    pub fn from_overlay(
        overlay_id: OverlayId,
        node_id: NodeId,
        cfg: &OverlayConfig,
    ) -> Result<Self> {
        let auth = match cfg.authentication_method {
            AuthMethod::X509 => {
                if cfg.username.is_some() || cfg.password.is_some() {
                    tracing::warn!(
                        overlay = %overlay_id.brief(),
                        "x509 authentication is enabled but credentials exist in the configuration; x509 will be used"
                    );
                }
                let dir = cfg
                    .cert_directory
                    .as_ref()
                    .context("x509 authentication requires CertDirectory")?;
                let cert_file = dir.join(
                    cfg.cert_file
                        .as_ref()
                        .context("x509 authentication requires CertFile")?,
                );
                let key_file = dir.join(
                    cfg.key_file
                        .as_ref()
                        .context("x509 authentication requires KeyFile")?,
                );

                SessionAuth::Certificate {
                    cert_file,
                    key_file,
                }
            }
            AuthMethod::Password => SessionAuth::Password {
                username: cfg
                    .username
                    .clone()
                    .context("no username is provided in the configuration")?,
                password: cfg
                    .password
                    .clone()
                    .context("no password is provided in the configuration")?,
            },
        };

        Ok(Self {
            overlay_id,
            node_id,
            host: cfg.host_address.clone(),
            port: cfg.port,
            auth,
        })
    }

    /// The websocket URL, including the authentication material for
    /// password sessions. Treat the result as a secret.
    pub fn login_url(&self) -> Url {
        let mut url = Url::parse(&format!("wss://{}:{}/signal/websocket", self.host, self.port))
            .expect("a URL built from host and port alone always parses");

        url.query_pairs_mut()
            .append_pair("node_id", self.node_id.as_str());

        if let SessionAuth::Password { username, password } = &self.auth {
            url.query_pairs_mut()
                .append_pair("username", username)
                .append_pair("token", password.expose_secret());
        }

        url
    }

    pub fn tls_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

        let config = match &self.auth {
            SessionAuth::Certificate {
                cert_file,
                key_file,
            } => {
                let certs = CertificateDer::pem_file_iter(cert_file)
                    .with_context(|| format!("failed to open {}", cert_file.display()))?
                    .collect::<Result<Vec<_>, _>>()
                    .context("failed to parse client certificate")?;
                let key = PrivateKeyDer::from_pem_file(key_file)
                    .with_context(|| format!("failed to read key {}", key_file.display()))?;

                builder
                    .with_client_auth_cert(certs, key)
                    .context("invalid client certificate or key")?
            }
            SessionAuth::Password { .. } => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}
