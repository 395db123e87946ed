//! # Agent Registry
//!
//! Thread-safe name → agent table. Reads share the lock, registration and
//! removal take it exclusively. Every accessor returns an owned snapshot so
//! callers never iterate a map that changes underneath them.

use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::Agent;
use crate::error::RegistryError;
use crate::swarm::panic_message;

/// Health summary across all registered agents
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Sorted agent names
    pub agents: Vec<String>,
    /// Agent name -> "healthy" or the health check error
    pub health: HashMap<String, String>,
}

/// Concurrency-safe collection of analysis agents
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-written,
    // so poisoned guards are safe to reuse.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Agent>>> {
        self.agents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn Agent>>> {
        self.agents.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an agent under `name`
    pub fn register(
        &self,
        name: &str,
        agent: Option<Arc<dyn Agent>>,
    ) -> Result<(), RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let agent = agent.ok_or_else(|| RegistryError::MissingAgent(name.to_string()))?;

        let mut agents = self.write();
        if agents.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        agents.insert(name.to_string(), agent);
        drop(agents);

        tracing::debug!("Registered agent '{}'", name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.read().get(name).cloned()
    }

    /// Snapshot of all agents, ordered by name
    pub fn list(&self) -> Vec<(String, Arc<dyn Agent>)> {
        let mut agents: Vec<_> = self
            .read()
            .iter()
            .map(|(name, agent)| (name.clone(), Arc::clone(agent)))
            .collect();
        agents.sort_by(|a, b| a.0.cmp(&b.0));
        agents
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Agent>, RegistryError> {
        let removed = self
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        tracing::debug!("Unregistered agent '{}'", name);
        Ok(removed)
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Run every agent's health check independently.
    ///
    /// The lock is released before any check runs; a failing or panicking
    /// check only affects its own entry.
    pub async fn health_check_all(&self) -> HashMap<String, anyhow::Result<()>> {
        let snapshot = self.list();

        let checks = snapshot.into_iter().map(|(name, agent)| async move {
            let outcome = AssertUnwindSafe(agent.health_check()).catch_unwind().await;
            let result = match outcome {
                Ok(result) => result,
                Err(payload) => Err(anyhow::anyhow!(
                    "health check panicked: {}",
                    panic_message(payload)
                )),
            };
            (name, result)
        });

        join_all(checks).await.into_iter().collect()
    }

    /// Health counts derived from `health_check_all`
    pub async fn stats(&self) -> RegistryStats {
        let results = self.health_check_all().await;

        let mut stats = RegistryStats {
            total: results.len(),
            ..RegistryStats::default()
        };

        for (name, result) in results {
            match result {
                Ok(()) => {
                    stats.healthy += 1;
                    stats.health.insert(name.clone(), "healthy".to_string());
                }
                Err(e) => {
                    stats.unhealthy += 1;
                    stats.health.insert(name.clone(), e.to_string());
                }
            }
            stats.agents.push(name);
        }
        stats.agents.sort();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentInput, AgentResult};
    use crate::swarm::RunContext;
    use async_trait::async_trait;
    use tokio_test::assert_ok;

    struct StubAgent {
        name: String,
        healthy: bool,
    }

    impl StubAgent {
        fn arc(name: &str, healthy: bool) -> Option<Arc<dyn Agent>> {
            Some(Arc::new(Self {
                name: name.to_string(),
                healthy,
            }))
        }
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process(
            &self,
            _ctx: &RunContext,
            _input: &AgentInput,
        ) -> anyhow::Result<AgentResult> {
            Ok(AgentResult::completed(&self.name))
        }

        async fn health_check(&self) -> anyhow::Result<()> {
            if self.healthy {
                Ok(())
            } else {
                anyhow::bail!("{} is down", self.name)
            }
        }
    }

    struct PanickingHealth;

    #[async_trait]
    impl Agent for PanickingHealth {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn process(
            &self,
            _ctx: &RunContext,
            _input: &AgentInput,
        ) -> anyhow::Result<AgentResult> {
            Ok(AgentResult::completed("panicky"))
        }

        async fn health_check(&self) -> anyhow::Result<()> {
            panic!("probe exploded")
        }
    }

    #[test]
    fn test_register_validation() {
        let registry = AgentRegistry::new();

        assert_eq!(
            registry.register("", StubAgent::arc("x", true)),
            Err(RegistryError::EmptyName)
        );
        assert_eq!(
            registry.register("technical", None),
            Err(RegistryError::MissingAgent("technical".into()))
        );

        assert_ok!(registry.register("technical", StubAgent::arc("technical", true)));
        assert_eq!(
            registry.register("technical", StubAgent::arc("technical", true)),
            Err(RegistryError::AlreadyRegistered("technical".into()))
        );

        assert_ok!(registry.register("keywords", StubAgent::arc("keywords", true)));
        assert!(registry.get("keywords").is_some());
        assert_eq!(registry.names(), vec!["keywords", "technical"]);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_unregister() {
        let registry = AgentRegistry::new();
        assert_ok!(registry.register("links", StubAgent::arc("links", true)));
        assert_ok!(registry.unregister("links"));
        assert!(registry.get("links").is_none());
        assert!(registry.unregister("links").is_err());
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let registry = AgentRegistry::new();
        assert_ok!(registry.register("a", StubAgent::arc("a", true)));
        let snapshot = registry.list();
        assert_ok!(registry.register("b", StubAgent::arc("b", true)));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn test_health_check_mixed() {
        let registry = AgentRegistry::new();
        assert_ok!(registry.register("good", StubAgent::arc("good", true)));
        assert_ok!(registry.register("bad", StubAgent::arc("bad", false)));

        let results = registry.health_check_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results.values().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(results.values().filter(|r| r.is_err()).count(), 1);
        assert!(results["bad"].is_err());
    }

    #[tokio::test]
    async fn test_health_check_survives_panic() {
        let registry = AgentRegistry::new();
        assert_ok!(registry.register("good", StubAgent::arc("good", true)));
        assert_ok!(registry.register("panicky", Some(Arc::new(PanickingHealth))));

        let stats = registry.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.unhealthy, 1);
        assert!(stats.health["panicky"].contains("probe exploded"));
        assert_eq!(stats.health["good"], "healthy");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration() {
        let registry = Arc::new(AgentRegistry::new());
        let n = 50;

        let mut handles = Vec::new();
        for i in 0..n {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let name = format!("agent-{}", i);
                registry.register(&name, StubAgent::arc(&name, true))
            }));
        }
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        let mut readers = Vec::new();
        for _ in 0..10 {
            let registry = Arc::clone(&registry);
            readers.push(tokio::spawn(async move {
                let listed = registry.list().len();
                let checked = registry.health_check_all().await.len();
                (listed, checked)
            }));
        }
        for reader in readers {
            assert_eq!(reader.await.unwrap(), (n, n));
        }

        assert_eq!(registry.count(), n);
        let mut names = registry.names();
        names.dedup();
        assert_eq!(names.len(), n);
    }
}
