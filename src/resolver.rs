//! Upstream name resolution with a small positive-TTL cache.

use std::{
	collections::HashMap,
	io::{Error as IoError, ErrorKind, Result as IoResult},
	net::SocketAddr,
	time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::net::lookup_host;
use tracing::trace;

/// A positive-TTL DNS cache over the system resolver. Negative results are
/// not cached; entries expire after the configured TTL.
#[derive(Debug)]
pub struct DnsCache {
	ttl: Duration,
	entries: Mutex<HashMap<(String, u16), (Vec<SocketAddr>, Instant)>>,
}

impl DnsCache {
	/// Create a cache with the given positive TTL
	#[must_use]
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			entries: Mutex::new(HashMap::new()),
		}
	}

	/// Resolve `host:port` to socket addresses, consulting the cache first.
	///
	/// # Errors
	/// Returns an error if resolution fails or yields no addresses.
	pub async fn resolve(&self, host: &str, port: u16) -> IoResult<Vec<SocketAddr>> {
		let key = (host.to_ascii_lowercase(), port);

		if let Some((addrs, at)) = self.entries.lock().get(&key) {
			if at.elapsed() < self.ttl {
				trace!(host, port, "DNS cache hit");
				return Ok(addrs.clone());
			}
		}

		let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
		if addrs.is_empty() {
			return Err(IoError::new(
				ErrorKind::NotFound,
				format!("no addresses for {host}"),
			));
		}

		self.entries
			.lock()
			.insert(key, (addrs.clone(), Instant::now()));

		Ok(addrs)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn resolves_and_caches_literals() {
		let cache = DnsCache::new(Duration::from_secs(30));

		let first = cache.resolve("127.0.0.1", 8080).await.unwrap();
		assert_eq!(first, vec!["127.0.0.1:8080".parse().unwrap()]);

		// The second lookup is served from the cache
		let second = cache.resolve("127.0.0.1", 8080).await.unwrap();
		assert_eq!(first, second);
		assert_eq!(cache.entries.lock().len(), 1);
	}

	#[tokio::test]
	async fn distinct_ports_are_distinct_entries() {
		let cache = DnsCache::new(Duration::from_secs(30));

		cache.resolve("127.0.0.1", 80).await.unwrap();
		cache.resolve("127.0.0.1", 81).await.unwrap();
		assert_eq!(cache.entries.lock().len(), 2);
	}
}
