//! Configured and combined lookups

use std::sync::Arc;

use super::Discovery;
use crate::error::{Error, Result};
use crate::overlay::Locator;

/// A fixed list of bootstrap peers, same for every namespace
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<Locator>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<Locator>) -> Self {
        Self { peers }
    }

    /// Parse peers from their text form
    pub fn from_strings<S: AsRef<str>>(peers: &[S]) -> Result<Self> {
        let peers = peers
            .iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<Locator>>>()?;
        Ok(Self::new(peers))
    }
}

#[async_trait::async_trait]
impl Discovery for StaticDiscovery {
    async fn advertise(&self, _namespace: &str) -> Result<()> {
        Ok(())
    }

    async fn find_peers(&self, _namespace: &str) -> Result<Vec<Locator>> {
        Ok(self.peers.clone())
    }
}

/// Union of several lookups.
///
/// A source that fails is skipped; the call only fails if every source does.
#[derive(Clone, Default)]
pub struct CombinedDiscovery {
    sources: Vec<Arc<dyn Discovery>>,
}

impl CombinedDiscovery {
    pub fn new(sources: Vec<Arc<dyn Discovery>>) -> Self {
        Self { sources }
    }

    pub fn push(&mut self, source: Arc<dyn Discovery>) {
        self.sources.push(source);
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait::async_trait]
impl Discovery for CombinedDiscovery {
    async fn advertise(&self, namespace: &str) -> Result<()> {
        let results = futures::future::join_all(self.sources.iter().map(|s| s.advertise(namespace))).await;
        collapse(results).map(|_| ())
    }

    async fn find_peers(&self, namespace: &str) -> Result<Vec<Locator>> {
        let results = futures::future::join_all(self.sources.iter().map(|s| s.find_peers(namespace))).await;

        let mut peers: Vec<Locator> = Vec::new();
        for locator in collapse(results)?.into_iter().flatten() {
            if !peers.contains(&locator) {
                peers.push(locator);
            }
        }
        Ok(peers)
    }
}

/// Keep the successes; fail only when nothing succeeded
fn collapse<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    if results.is_empty() {
        return Ok(Vec::new());
    }

    let mut successes = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(value) => successes.push(value),
            Err(e) => {
                tracing::debug!("Discovery source failed: {}", e);
                errors.push(e.to_string());
            }
        }
    }

    if successes.is_empty() {
        return Err(Error::Discovery(errors.join("; ")));
    }
    Ok(successes)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait::async_trait]
    impl Discovery for Failing {
        async fn advertise(&self, _namespace: &str) -> Result<()> {
            Err(Error::Discovery("offline".into()))
        }

        async fn find_peers(&self, _namespace: &str) -> Result<Vec<Locator>> {
            Err(Error::Discovery("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_static_parses_peers() {
        let discovery = StaticDiscovery::from_strings(&["10.0.0.1:7700", "/ip4/10.0.0.2/tcp/7700"]).unwrap();
        let peers = discovery.find_peers("demo").await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].socket_addr(), Some("10.0.0.2:7700".parse().unwrap()));

        assert!(StaticDiscovery::from_strings(&["nowhere"]).is_err());
    }

    #[tokio::test]
    async fn test_combined_dedups_and_skips_failures() {
        let a: Arc<dyn Discovery> = Arc::new(StaticDiscovery::from_strings(&["10.0.0.1:7700"]).unwrap());
        let b: Arc<dyn Discovery> =
            Arc::new(StaticDiscovery::from_strings(&["10.0.0.1:7700", "10.0.0.2:7700"]).unwrap());
        let combined = CombinedDiscovery::new(vec![a, b, Arc::new(Failing)]);

        combined.advertise("demo").await.unwrap();
        assert_eq!(combined.find_peers("demo").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_combined_all_failing() {
        let combined = CombinedDiscovery::new(vec![Arc::new(Failing), Arc::new(Failing)]);
        assert!(matches!(combined.find_peers("demo").await, Err(Error::Discovery(_))));

        let empty = CombinedDiscovery::default();
        assert!(empty.find_peers("demo").await.unwrap().is_empty());
    }
}
