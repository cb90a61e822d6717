//! Client configuration and index-creation parameters.
//!
//! # Environment
//!
//! [`ClientConfig::from_env`] reads:
//!
//! | Variable          | Meaning                          | Default     |
//! |-------------------|----------------------------------|-------------|
//! | `EXTIDX_HOST`     | indexing server host             | `127.0.0.1` |
//! | `EXTIDX_PORT`     | indexing server port             | `8998`      |
//! | `EXTIDX_SECURE`   | wrap the connection in TLS       | `false`     |
//! | `EXTIDX_CA_FILE`  | PEM bundle to verify the server  | unset       |
//!
//! Without a CA bundle a TLS connection accepts any server certificate,
//! matching a server running with a self-signed pair.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use extidx_core::protocol::{
    Codebook, DEFAULT_EF, DEFAULT_EF_CONSTRUCTION, DEFAULT_M, IndexMetadata, MetricKind,
    Quantization,
};
use extidx_core::{ProtocolError, ProtocolResult};
use thiserror::Error;

/// Default indexing server port.
pub const DEFAULT_PORT: u16 = 8998;

/// Default connect, send and receive timeout.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the index header.
///
/// The server builds the whole index before it answers, so this wait covers
/// the build time.
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(600);

/// Invalid environment configuration.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {var}: {detail}")]
pub struct ConfigError {
    /// Variable name.
    pub var: &'static str,
    /// What was wrong with it.
    pub detail: String,
}

/// Connection settings for build sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Wrap the connection in TLS.
    pub secure: bool,
    /// PEM bundle of trusted roots; `None` accepts any certificate.
    pub ca_file: Option<PathBuf>,
    /// Bound on the TCP handshake.
    pub connect_timeout: Duration,
    /// Bound on each send.
    pub send_timeout: Duration,
    /// Bound on each receive.
    pub recv_timeout: Duration,
    /// Bound on the wait for the index header.
    pub header_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            secure: false,
            ca_file: None,
            connect_timeout: DEFAULT_SOCKET_TIMEOUT,
            send_timeout: DEFAULT_SOCKET_TIMEOUT,
            recv_timeout: DEFAULT_SOCKET_TIMEOUT,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Create a config for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Read the server location from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `EXTIDX_PORT` or `EXTIDX_SECURE` cannot be
    /// parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = env::var("EXTIDX_HOST") {
            if !host.trim().is_empty() {
                config.host = host.trim().to_string();
            }
        }

        if let Ok(port) = env::var("EXTIDX_PORT") {
            config.port = port.trim().parse().map_err(|e| ConfigError {
                var: "EXTIDX_PORT",
                detail: format!("{e}"),
            })?;
        }

        if let Ok(secure) = env::var("EXTIDX_SECURE") {
            config.secure = parse_bool(&secure).ok_or_else(|| ConfigError {
                var: "EXTIDX_SECURE",
                detail: format!("expected a boolean, got {secure:?}"),
            })?;
        }

        config.ca_file = env::var("EXTIDX_CA_FILE")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(config)
    }

    /// Enable or disable TLS.
    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Verify the server against a PEM bundle.
    #[must_use]
    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the send timeout.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the receive timeout.
    #[must_use]
    pub const fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Set the index header timeout.
    #[must_use]
    pub const fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" | "" => Some(false),
        _ => None,
    }
}

/// Index-creation parameters, forwarded into the metadata frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildParams {
    /// Vector dimension.
    pub dimensions: u32,
    /// Distance metric.
    pub metric: MetricKind,
    /// Links per node.
    pub m: u32,
    /// Construction beam width.
    pub ef_construction: u32,
    /// Default search beam width.
    pub ef: u32,
    /// Storage precision in bits (32, 16, 8 or 1).
    pub quant_bits: u32,
    /// Build over product-quantized codes.
    pub pq: bool,
    /// Subvectors per PQ code.
    pub num_subvectors: u32,
    /// Codebook for `pq` builds.
    pub codebook: Option<Codebook>,
    /// Build on the external server.
    pub external: bool,
}

impl BuildParams {
    /// Parameters for an external float build with default graph settings.
    #[must_use]
    pub const fn new(dimensions: u32, metric: MetricKind) -> Self {
        Self {
            dimensions,
            metric,
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef: DEFAULT_EF,
            quant_bits: 32,
            pq: false,
            num_subvectors: 0,
            codebook: None,
            external: true,
        }
    }

    /// Set `m`.
    #[must_use]
    pub const fn with_m(mut self, m: u32) -> Self {
        self.m = m;
        self
    }

    /// Set the beam widths.
    #[must_use]
    pub const fn with_ef(mut self, ef_construction: u32, ef: u32) -> Self {
        self.ef_construction = ef_construction;
        self.ef = ef;
        self
    }

    /// Set the storage precision.
    #[must_use]
    pub const fn with_quant_bits(mut self, bits: u32) -> Self {
        self.quant_bits = bits;
        self
    }

    /// Build over PQ codes with `num_subvectors` codes per vector.
    #[must_use]
    pub fn with_pq(mut self, codebook: Codebook, num_subvectors: u32) -> Self {
        self.pq = true;
        self.codebook = Some(codebook);
        self.num_subvectors = num_subvectors;
        self
    }

    /// Toggle external building.
    #[must_use]
    pub const fn with_external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    /// Converts to the metadata frame for a stream of about `row_count`
    /// vectors.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidMetadata`] if external building is
    /// off, a `pq` build has no codebook, or a parameter is out of range.
    pub fn to_metadata(&self, row_count: u64) -> ProtocolResult<IndexMetadata> {
        if !self.external {
            return Err(ProtocolError::InvalidMetadata(
                "external index building is disabled for this index".to_string(),
            ));
        }

        let mut metadata = IndexMetadata::new(self.dimensions, self.metric)
            .with_m(self.m)
            .with_ef(self.ef_construction, self.ef)
            .with_quantization(Quantization::from_bits(self.quant_bits)?)
            .with_row_count(row_count);

        if self.pq {
            let codebook = self.codebook.as_ref().ok_or_else(|| {
                ProtocolError::InvalidMetadata("pq requires a codebook".to_string())
            })?;
            if codebook.dimensions() != self.dimensions as usize {
                return Err(ProtocolError::InvalidMetadata(format!(
                    "codebook has {} dimensions, index has {}",
                    codebook.dimensions(),
                    self.dimensions
                )));
            }
            let centroids = u32::try_from(codebook.num_centroids()).map_err(|_| {
                ProtocolError::InvalidMetadata("codebook too large".to_string())
            })?;
            metadata = metadata.with_pq(centroids, self.num_subvectors);
        }

        metadata.validate()?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 8998);
        assert!(!config.secure);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.header_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_params_use_graph_defaults() {
        let params = BuildParams::new(4, MetricKind::L2sq);
        assert_eq!(params.m, DEFAULT_M);
        assert_eq!(params.ef_construction, DEFAULT_EF_CONSTRUCTION);
        assert_eq!(params.ef, DEFAULT_EF);
        assert!(params.external);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool(" TRUE "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_params_to_metadata() {
        let metadata = BuildParams::new(128, MetricKind::L2sq)
            .with_m(10)
            .with_quant_bits(8)
            .to_metadata(1000)
            .unwrap();
        assert_eq!(metadata.dimensions, 128);
        assert_eq!(metadata.m, 10);
        assert_eq!(metadata.quantization, Quantization::I8);
        assert_eq!(metadata.row_count, 1000);
        assert!(!metadata.pq);
    }

    #[test]
    fn test_external_disabled() {
        let err = BuildParams::new(4, MetricKind::Cos)
            .with_external(false)
            .to_metadata(0)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMetadata(_)));
    }

    #[test]
    fn test_pq_requires_codebook() {
        let mut params = BuildParams::new(4, MetricKind::L2sq);
        params.pq = true;
        params.num_subvectors = 2;
        assert!(params.to_metadata(0).is_err());

        let codebook = Codebook::new(4, vec![0.0; 4 * 8]).unwrap();
        let metadata = BuildParams::new(4, MetricKind::L2sq)
            .with_pq(codebook, 2)
            .to_metadata(0)
            .unwrap();
        assert!(metadata.pq);
        assert_eq!(metadata.num_centroids, 8);
        assert_eq!(metadata.num_subvectors, 2);
    }

    #[test]
    fn test_bad_quant_bits() {
        assert!(BuildParams::new(4, MetricKind::L2sq)
            .with_quant_bits(4)
            .to_metadata(0)
            .is_err());
    }
}
