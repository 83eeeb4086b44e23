//! TLS configuration.

use serde::Deserialize;

/// TLS configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Name of a PEM CA bundle in the device filesystem. When unset the
    /// bundled web PKI roots are trusted.
    pub ca_cert: Option<String>,
    /// Name to verify the broker certificate against, if not the host.
    pub server_name: Option<String>,
}

impl TlsConfig {
    /// Validate the TLS configuration.
    pub fn validate(&self) -> Result<(), String> {
        if matches!(&self.ca_cert, Some(name) if name.is_empty()) {
            return Err("tls.ca_cert must not be empty when set".into());
        }
        Ok(())
    }
}
