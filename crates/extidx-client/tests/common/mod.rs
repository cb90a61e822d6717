//! Shared fixtures: an in-process indexing server and vector generators.

#![allow(dead_code)]
#![allow(clippy::cast_possible_truncation)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use extidx_client::{BuildOutcome, BuildParams, BuildSession, ClientConfig};
use extidx_core::protocol::{IndexHeader, VectorRecord};
use extidx_core::{FailurePoints, ProtocolResult};
use extidx_daemon::{IndexServer, ServerConfig, StatusTracker, TlsFiles};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::NamedTempFile;
use tokio::runtime::Runtime;

/// An indexing server running on its own runtime.
pub struct TestServer {
    runtime: Runtime,
    pub addr: SocketAddr,
    pub points: Arc<FailurePoints>,
    pub status: Arc<StatusTracker>,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with(local_config())
    }

    pub fn start_with(config: ServerConfig) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let points = Arc::clone(&config.failure_points);
        let server = runtime.block_on(IndexServer::bind(config)).unwrap();
        let addr = server.local_addr().unwrap();
        let status = server.status();
        runtime.spawn(server.run());
        Self {
            runtime,
            addr,
            points,
            status,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.addr.port())
            .with_connect_timeout(Duration::from_secs(5))
            .with_send_timeout(Duration::from_secs(5))
            .with_recv_timeout(Duration::from_secs(5))
            .with_header_timeout(Duration::from_secs(60))
    }

    /// Runs one build and returns the outcome and the received blob.
    pub fn build(
        &self,
        params: &BuildParams,
        records: Vec<VectorRecord>,
    ) -> ProtocolResult<(BuildOutcome, Vec<u8>)> {
        build_with(self.client_config(), Arc::clone(&self.points), params, records)
    }
}

pub fn local_config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse().unwrap()).with_socket_timeout(Duration::from_secs(5))
}

pub fn build_with(
    config: ClientConfig,
    points: Arc<FailurePoints>,
    params: &BuildParams,
    records: Vec<VectorRecord>,
) -> ProtocolResult<(BuildOutcome, Vec<u8>)> {
    let mut received = None;
    let mut sink = |_: &IndexHeader, body: Vec<u8>| -> ProtocolResult<()> {
        received = Some(body);
        Ok(())
    };
    let outcome = BuildSession::new(config, points).run(params, records, &mut sink)?;
    Ok((outcome, received.unwrap_or_default()))
}

pub fn random_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

pub fn float_records(vectors: &[Vec<f32>]) -> Vec<VectorRecord> {
    vectors
        .iter()
        .enumerate()
        .map(|(i, v)| VectorRecord::f32(i as u64 + 1, v.clone()))
        .collect()
}

pub fn bit_records(n: usize, words: usize, seed: u64) -> Vec<VectorRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| VectorRecord::bits(i as u64 + 1, (0..words).map(|_| rng.r#gen()).collect()))
        .collect()
}

/// Writes a self-signed `localhost` pair; the files live as long as the
/// returned handles.
pub fn self_signed() -> (NamedTempFile, NamedTempFile, TlsFiles) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    let mut cert_file = NamedTempFile::new().unwrap();
    cert_file.write_all(cert.pem().as_bytes()).unwrap();
    let mut key_file = NamedTempFile::new().unwrap();
    key_file
        .write_all(key_pair.serialize_pem().as_bytes())
        .unwrap();
    let files = TlsFiles::new(cert_file.path(), key_file.path());
    (cert_file, key_file, files)
}
