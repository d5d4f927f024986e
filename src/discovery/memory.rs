//! In-process rendezvous and group channel

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::broadcast;

use super::{Discovery, GroupMessage, PubSub, Topic};
use crate::error::Result;
use crate::overlay::Locator;

const TOPIC_CAPACITY: usize = 64;

/// Shared namespace registry
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    namespaces: Arc<Mutex<HashMap<String, Vec<Locator>>>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// A lookup client that advertises `locators`
    pub fn discovery(&self, locators: Vec<Locator>) -> MemoryDiscovery {
        MemoryDiscovery {
            rendezvous: self.clone(),
            locators,
        }
    }
}

/// Client of a [`MemoryRendezvous`]
pub struct MemoryDiscovery {
    rendezvous: MemoryRendezvous,
    locators: Vec<Locator>,
}

#[async_trait::async_trait]
impl Discovery for MemoryDiscovery {
    async fn advertise(&self, namespace: &str) -> Result<()> {
        let mut namespaces = self.rendezvous.namespaces.lock().unwrap_or_else(|e| e.into_inner());
        let entries = namespaces.entry(namespace.to_string()).or_default();
        for locator in &self.locators {
            if !entries.contains(locator) {
                entries.push(locator.clone());
            }
        }
        Ok(())
    }

    async fn find_peers(&self, namespace: &str) -> Result<Vec<Locator>> {
        let namespaces = self.rendezvous.namespaces.lock().unwrap_or_else(|e| e.into_inner());
        Ok(namespaces.get(namespace).cloned().unwrap_or_default())
    }
}

/// In-process group messaging; every joined topic sees every publish
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Bytes>>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PubSub for MemoryPubSub {
    async fn join(&self, topic: &str) -> Result<Box<dyn Topic>> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone();
        let receiver = sender.subscribe();

        Ok(Box::new(MemoryTopic { sender, receiver }))
    }
}

/// A joined [`MemoryPubSub`] topic
pub struct MemoryTopic {
    sender: broadcast::Sender<Bytes>,
    receiver: broadcast::Receiver<Bytes>,
}

#[async_trait::async_trait]
impl Topic for MemoryTopic {
    async fn publish(&self, data: &[u8]) -> Result<()> {
        let _ = self.sender.send(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn next(&mut self) -> Option<GroupMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(data) => return Some(GroupMessage { data, source: None }),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Group channel lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
