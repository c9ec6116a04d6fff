//! Certificate handling for TLS interception.
//!
//! The interceptor holds the user-provided CA certificate and private key,
//! mints per-host leaf certificates on demand (CN and SAN set to the target
//! host, signed by the CA), and caches them for the lifetime of the process
//! with an at-most-one-concurrent-generation guarantee per hostname. An
//! optional on-disk mirror persists minted leafs across restarts.

use std::{
	collections::HashMap,
	fmt::{Debug, Formatter, Result as FmtResult},
	fs,
	io::Error as IoError,
	path::{Path, PathBuf},
	sync::Arc,
};

use parking_lot::Mutex;
use rand::RngCore;
use rcgen::{
	CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
	KeyUsagePurpose, SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;
use tokio_rustls::{
	rustls::{
		client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
		crypto::ring::{default_provider, sign},
		pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
		server::{ClientHello, ResolvesServerCert},
		sign::CertifiedKey,
		ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, ServerConfig,
		SignatureScheme,
	},
	TlsConnector,
};
use tracing::{debug, warn};

/// The error returned when loading CA material or minting a leaf fails
#[derive(Debug, thiserror::Error)]
pub enum CertError {
	/// A certificate or key file could not be read
	#[error("the certificate or key file could not be read")]
	Read(#[from] IoError),
	/// A PEM file does not contain the expected certificate
	#[error("no certificate found in the PEM file")]
	NoCert,
	/// A PEM file does not contain a usable private key
	#[error("no PKCS#8 private key found in the PEM file")]
	NoKey,
	/// The private key is invalid or unsupported
	#[error("the private key is invalid or unsupported")]
	InvalidKey(#[source] TlsError),
	/// Certificate generation or signing failed
	#[error("certificate generation failed")]
	Generate(#[from] rcgen::Error),
}

/// The CA identity used to sign minted leaf certificates. Loaded once at
/// startup and shared read-only between workers.
pub struct CaAuthority {
	/// The issuer certificate reconstructed from the CA PEM (used as the
	/// signing template)
	issuer: rcgen::Certificate,
	/// The CA private key
	issuer_key: KeyPair,
	/// The original CA certificate in DER form, appended to every minted
	/// chain
	chain_der: CertificateDer<'static>,
	/// A dedicated leaf signing key (PKCS#8 DER), reused for every leaf
	/// when configured
	leaf_key_der: Option<Vec<u8>>,
	/// How long minted leafs stay valid
	validity: Duration,
}

/// A freshly minted (or re-loaded) leaf certificate with its PEM forms for
/// the on-disk mirror
pub struct MintedLeaf {
	/// The assembled rustls cert/key pair, chain including the CA
	pub certified: Arc<CertifiedKey>,
	/// The leaf certificate in PEM form
	pub cert_pem: String,
	/// The leaf private key in PEM form
	pub key_pem: String,
}

impl CaAuthority {
	/// Load CA material from PEM files. `signing_key` optionally names a
	/// key reused for every minted leaf; without it a fresh P-256 key is
	/// generated per hostname.
	///
	/// # IO
	/// This function performs synchronous file IO.
	///
	/// # Errors
	/// Returns an error if any file can not be read or parsed, or the key
	/// is unusable for signing.
	pub fn load(
		cert: impl AsRef<Path>,
		key: impl AsRef<Path>,
		signing_key: Option<&Path>,
		validity_days: u32,
	) -> Result<Self, CertError> {
		let cert_pem = fs::read_to_string(cert)?;
		let key_pem = fs::read_to_string(key)?;

		let issuer_key = KeyPair::from_pem(&key_pem)?;
		let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
		let issuer = params.self_signed(&issuer_key)?;

		let chain_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
			.next()
			.ok_or(CertError::NoCert)??;

		let leaf_key_der = match signing_key {
			Some(path) => {
				let pem = fs::read_to_string(path)?;
				Some(KeyPair::from_pem(&pem)?.serialize_der())
			}
			None => None,
		};

		Ok(Self {
			issuer,
			issuer_key,
			chain_der,
			leaf_key_der,
			validity: Duration::days(i64::from(validity_days)),
		})
	}

	/// Generate a fresh CA identity with the given common name. Used by
	/// tests and tooling; interception deployments load a pre-installed CA
	/// with [`load`][Self::load] instead.
	///
	/// # Errors
	/// Returns an error if key generation or self-signing fails.
	pub fn generate(common_name: &str, validity_days: u32) -> Result<(Self, String, String), CertError> {
		let mut params = CertificateParams::new(Vec::new())?;
		params.distinguished_name = DistinguishedName::new();
		params
			.distinguished_name
			.push(DnType::CommonName, common_name);
		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		params.key_usages.push(KeyUsagePurpose::KeyCertSign);
		params.key_usages.push(KeyUsagePurpose::CrlSign);

		let now = OffsetDateTime::now_utc();
		params.not_before = now - Duration::days(1);
		params.not_after = now + Duration::days(i64::from(validity_days));

		let key = KeyPair::generate()?;
		let cert = params.self_signed(&key)?;

		let cert_pem = cert.pem();
		let key_pem = key.serialize_pem();

		Ok((
			Self {
				chain_der: cert.der().clone(),
				issuer: cert,
				issuer_key: key,
				leaf_key_der: None,
				validity: Duration::days(i64::from(validity_days)),
			},
			cert_pem,
			key_pem,
		))
	}

	/// Mint a leaf certificate for the given hostname (or IP address
	/// literal): CN = host, SAN = {host}, randomized serial, signed by the
	/// CA.
	///
	/// # Errors
	/// Returns an error if key generation or signing fails.
	pub fn mint(&self, host: &str) -> Result<MintedLeaf, CertError> {
		let mut params = CertificateParams::new(vec![host.to_string()])?;
		params.distinguished_name = DistinguishedName::new();
		params.distinguished_name.push(DnType::CommonName, host);

		let now = OffsetDateTime::now_utc();
		params.not_before = now - Duration::days(1);
		params.not_after = now + self.validity;

		let mut serial = [0_u8; 16];
		rand::thread_rng().fill_bytes(&mut serial);
		serial[0] &= 0x7f;
		params.serial_number = Some(SerialNumber::from(serial.to_vec()));

		params.key_usages.push(KeyUsagePurpose::DigitalSignature);
		params
			.extended_key_usages
			.push(ExtendedKeyUsagePurpose::ServerAuth);

		let key = match &self.leaf_key_der {
			Some(der) => KeyPair::try_from(der.as_slice())?,
			None => KeyPair::generate()?,
		};

		let cert = params.signed_by(&key, &self.issuer, &self.issuer_key)?;

		let signing = sign::any_supported_type(&PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
			key.serialize_der(),
		)))
		.map_err(CertError::InvalidKey)?;

		Ok(MintedLeaf {
			certified: Arc::new(CertifiedKey::new(
				vec![cert.der().clone(), self.chain_der.clone()],
				signing,
			)),
			cert_pem: cert.pem(),
			key_pem: key.serialize_pem(),
		})
	}

	/// Assemble a `CertifiedKey` from a previously mirrored leaf PEM bundle
	/// (leaf certificate + PKCS#8 key), re-appending the CA to the chain
	fn assemble_mirrored(&self, data: &[u8]) -> Result<Arc<CertifiedKey>, CertError> {
		let mut certs = rustls_pemfile::certs(&mut &data[..]).collect::<Result<Vec<_>, _>>()?;
		if certs.is_empty() {
			return Err(CertError::NoCert);
		}
		certs.push(self.chain_der.clone());

		let key = rustls_pemfile::pkcs8_private_keys(&mut &data[..])
			.next()
			.ok_or(CertError::NoKey)??;

		let signing = sign::any_supported_type(&PrivateKeyDer::Pkcs8(key))
			.map_err(CertError::InvalidKey)?;

		Ok(Arc::new(CertifiedKey::new(certs, signing)))
	}
}

impl Debug for CaAuthority {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.debug_struct("CaAuthority")
			.field("validity", &self.validity)
			.field("dedicated_leaf_key", &self.leaf_key_der.is_some())
			.finish_non_exhaustive()
	}
}

/// A per-process cache of minted leaf certificates, keyed by lowercased
/// hostname. Each hostname gets at most one concurrent generation; later
/// requests for the same host await the in-flight result. Entries live for
/// the lifetime of the process, optionally mirrored to a directory.
pub struct LeafCache {
	dir: Option<PathBuf>,
	entries: Mutex<HashMap<String, Arc<OnceCell<Arc<CertifiedKey>>>>>,
}

impl LeafCache {
	/// Create a cache, optionally mirroring minted leafs into `dir` (one
	/// `<host>.pem` bundle per hostname, written via temp-then-rename)
	#[must_use]
	pub fn new(dir: Option<PathBuf>) -> Self {
		Self {
			dir,
			entries: Mutex::new(HashMap::new()),
		}
	}

	/// Get the leaf for `host`, minting (or loading from the mirror) under
	/// the per-host single-flight guarantee.
	///
	/// # Errors
	/// Returns an error if minting fails; the failed entry is not cached.
	pub async fn get(&self, ca: &CaAuthority, host: &str) -> Result<Arc<CertifiedKey>, CertError> {
		let host = host.to_ascii_lowercase();

		let cell = {
			let mut entries = self.entries.lock();
			Arc::clone(entries.entry(host.clone()).or_default())
		};

		cell.get_or_try_init(|| async { self.load_or_mint(ca, &host) })
			.await
			.cloned()
	}

	/// Load the host's leaf from the mirror when present and parseable,
	/// otherwise mint a fresh one and mirror it
	fn load_or_mint(&self, ca: &CaAuthority, host: &str) -> Result<Arc<CertifiedKey>, CertError> {
		let path = self.mirror_path(host);

		if let Some(ref path) = path {
			if let Ok(data) = fs::read(path) {
				match ca.assemble_mirrored(&data) {
					Ok(certified) => {
						debug!(host, "Loaded leaf certificate from mirror");
						return Ok(certified);
					}
					Err(err) => {
						warn!(host, %err, "Mirrored leaf unusable, re-minting");
					}
				}
			}
		}

		let minted = ca.mint(host)?;
		debug!(host, "Minted leaf certificate");

		if let Some(path) = path {
			if let Err(err) = persist(&path, &minted) {
				warn!(host, %err, "Could not mirror leaf certificate");
			}
		}

		Ok(minted.certified)
	}

	/// The mirror file path for a hostname, or `None` when mirroring is off
	/// or the hostname can not be used as a file name
	fn mirror_path(&self, host: &str) -> Option<PathBuf> {
		let dir = self.dir.as_ref()?;

		if host.is_empty()
			|| host.starts_with('.')
			|| !host
				.bytes()
				.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':'))
		{
			return None;
		}

		Some(dir.join(format!("{}.pem", host.replace(':', "_"))))
	}
}

impl Debug for LeafCache {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.debug_struct("LeafCache")
			.field("dir", &self.dir)
			.field("entries", &self.entries.lock().len())
			.finish()
	}
}

/// Write a minted leaf's PEM bundle to `path` via a temporary file and an
/// atomic rename
fn persist(path: &Path, minted: &MintedLeaf) -> Result<(), IoError> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}

	let tmp = path.with_extension("pem.tmp");
	fs::write(&tmp, format!("{}{}", minted.cert_pem, minted.key_pem))?;
	fs::rename(&tmp, path)
}

/// The TLS interception engine: CA authority, leaf cache, interception
/// policy, and the client configuration used towards real upstreams.
pub struct TlsInterceptor {
	ca: CaAuthority,
	cache: LeafCache,
	intercept_hosts: Vec<String>,
	upstream: Arc<ClientConfig>,
}

impl TlsInterceptor {
	/// Assemble an interceptor. `intercept_hosts` restricts interception to
	/// the listed (lowercased) hosts; an empty list intercepts everything.
	/// `insecure_upstream` disables upstream certificate validation (for
	/// testing against self-signed origins only).
	#[must_use]
	pub fn new(
		ca: CaAuthority,
		mirror_dir: Option<PathBuf>,
		intercept_hosts: Vec<String>,
		insecure_upstream: bool,
	) -> Self {
		Self {
			ca,
			cache: LeafCache::new(mirror_dir),
			intercept_hosts: intercept_hosts
				.into_iter()
				.map(|h| h.to_ascii_lowercase())
				.collect(),
			upstream: upstream_client_config(insecure_upstream),
		}
	}

	/// Whether CONNECTs to this host should be intercepted
	#[must_use]
	pub fn should_intercept(&self, host: &str) -> bool {
		self.intercept_hosts.is_empty()
			|| self
				.intercept_hosts
				.iter()
				.any(|h| h.eq_ignore_ascii_case(host))
	}

	/// Build the server-side TLS configuration for an intercepted client
	/// handshake, minting (or re-using) the leaf for `host`.
	///
	/// # Errors
	/// Returns an error if the leaf can not be minted.
	pub async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CertError> {
		let leaf = self.cache.get(&self.ca, host).await?;

		let mut config = ServerConfig::builder()
			.with_no_client_auth()
			.with_cert_resolver(Arc::new(SingleCert(leaf)));
		config.alpn_protocols = vec![b"http/1.1".to_vec()];

		Ok(Arc::new(config))
	}

	/// The connector used for the upstream side of intercepted tunnels
	#[must_use]
	pub fn connector(&self) -> TlsConnector {
		TlsConnector::from(Arc::clone(&self.upstream))
	}
}

impl Debug for TlsInterceptor {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.debug_struct("TlsInterceptor")
			.field("ca", &self.ca)
			.field("cache", &self.cache)
			.field("intercept_hosts", &self.intercept_hosts)
			.finish_non_exhaustive()
	}
}

/// A [`ResolvesServerCert`] implementation resolving one pre-minted leaf,
/// used for intercepted handshakes where the host is already known
#[derive(Debug)]
struct SingleCert(Arc<CertifiedKey>);

impl ResolvesServerCert for SingleCert {
	fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
		Some(Arc::clone(&self.0))
	}
}

/// The client configuration for upstream TLS sessions: web-PKI roots, or no
/// verification at all when `insecure` is set
fn upstream_client_config(insecure: bool) -> Arc<ClientConfig> {
	let mut config = if insecure {
		ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerify))
			.with_no_client_auth()
	} else {
		let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

		ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth()
	};

	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	Arc::new(config)
}

/// A verifier that accepts any upstream certificate. Only reachable via the
/// insecure-upstream configuration flag.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, TlsError> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, TlsError> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, TlsError> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		default_provider()
			.signature_verification_algorithms
			.supported_schemes()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mint_builds_two_cert_chain() {
		let (ca, _, _) = CaAuthority::generate("burrow test CA", 30).unwrap();
		let minted = ca.mint("example.test").unwrap();

		assert_eq!(minted.certified.cert.len(), 2);
		assert!(minted.cert_pem.contains("BEGIN CERTIFICATE"));
		assert!(minted.key_pem.contains("PRIVATE KEY"));
	}

	#[test]
	fn mint_accepts_ip_hosts() {
		let (ca, _, _) = CaAuthority::generate("burrow test CA", 30).unwrap();
		assert!(ca.mint("127.0.0.1").is_ok());
	}

	#[tokio::test]
	async fn cache_returns_one_leaf_per_host() {
		let (ca, _, _) = CaAuthority::generate("burrow test CA", 30).unwrap();
		let ca = Arc::new(ca);
		let cache = Arc::new(LeafCache::new(None));

		// A burst of concurrent requests for the same hostname must share a
		// single generated leaf
		let mut handles = Vec::new();
		for _ in 0..16 {
			let ca = Arc::clone(&ca);
			let cache = Arc::clone(&cache);
			handles.push(tokio::spawn(async move {
				cache.get(&ca, "example.test").await.unwrap()
			}));
		}

		let mut leafs = Vec::new();
		for handle in handles {
			leafs.push(handle.await.unwrap());
		}

		for leaf in &leafs[1..] {
			assert!(Arc::ptr_eq(&leafs[0], leaf));
		}

		// A different host gets a different leaf
		let other = cache.get(&ca, "other.test").await.unwrap();
		assert!(!Arc::ptr_eq(&leafs[0], &other));

		// Lookup is case-insensitive
		let upper = cache.get(&ca, "EXAMPLE.test").await.unwrap();
		assert!(Arc::ptr_eq(&leafs[0], &upper));
	}

	#[tokio::test]
	async fn cache_mirrors_to_disk() {
		let dir = tempfile::tempdir().unwrap();
		let (ca, _, _) = CaAuthority::generate("burrow test CA", 30).unwrap();

		let cache = LeafCache::new(Some(dir.path().to_path_buf()));
		let first = cache.get(&ca, "mirrored.test").await.unwrap();

		let path = dir.path().join("mirrored.test.pem");
		assert!(path.exists());

		// A fresh cache picks the leaf up from the mirror instead of
		// minting a new one
		let reloaded_cache = LeafCache::new(Some(dir.path().to_path_buf()));
		let second = reloaded_cache.get(&ca, "mirrored.test").await.unwrap();

		assert_eq!(first.cert[0].as_ref(), second.cert[0].as_ref());
	}

	#[test]
	fn mirror_path_rejects_traversal() {
		let cache = LeafCache::new(Some(PathBuf::from("/tmp/leafs")));

		assert!(cache.mirror_path("example.test").is_some());
		assert!(cache.mirror_path("::1").is_some());
		assert!(cache.mirror_path("../evil").is_none());
		assert!(cache.mirror_path(".hidden").is_none());
		assert!(cache.mirror_path("a/b").is_none());
	}

	#[test]
	fn interception_policy() {
		let (ca, _, _) = CaAuthority::generate("burrow test CA", 30).unwrap();
		let all = TlsInterceptor::new(ca, None, Vec::new(), false);
		assert!(all.should_intercept("anything.test"));

		let (ca, _, _) = CaAuthority::generate("burrow test CA", 30).unwrap();
		let some = TlsInterceptor::new(ca, None, vec!["Picked.Test".into()], false);
		assert!(some.should_intercept("picked.test"));
		assert!(!some.should_intercept("other.test"));
	}
}
