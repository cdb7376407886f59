//! In-process collaborators for tests and embedding hosts without a backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use turnstream_core::collab::{AgentInfo, AgentRegistry, AgentStatus, Thread, ThreadService};
use turnstream_core::errors::CollabError;
use turnstream_core::ids::{AgentId, ThreadId};
use turnstream_core::messages::ConversationMessage;

#[derive(Default)]
pub struct InMemoryThreadService {
    threads: DashMap<ThreadId, Thread>,
    unavailable: AtomicBool,
}

impl InMemoryThreadService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a thread with existing history.
    pub fn insert(&self, agent_id: AgentId, messages: Vec<ConversationMessage>) -> ThreadId {
        let thread = Thread {
            id: ThreadId::new(),
            agent_id,
            created_at: Utc::now(),
            messages,
        };
        let id = thread.id.clone();
        let _ = self.threads.insert(id.clone(), thread);
        id
    }

    /// Make every call fail with [`CollabError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn check(&self) -> Result<(), CollabError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(CollabError::Unavailable("thread service offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ThreadService for InMemoryThreadService {
    async fn get_thread(&self, id: &ThreadId) -> Result<Option<Thread>, CollabError> {
        self.check()?;
        Ok(self.threads.get(id).map(|t| t.value().clone()))
    }

    async fn create_thread(&self, agent_id: &AgentId) -> Result<Thread, CollabError> {
        self.check()?;
        let thread = Thread {
            id: ThreadId::new(),
            agent_id: agent_id.clone(),
            created_at: Utc::now(),
            messages: Vec::new(),
        };
        let _ = self.threads.insert(thread.id.clone(), thread.clone());
        Ok(thread)
    }

    async fn delete_thread(&self, id: &ThreadId) -> Result<(), CollabError> {
        self.check()?;
        self.threads
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CollabError::NotFound(id.to_string()))
    }
}

/// Fixed set of agents.
#[derive(Default)]
pub struct StaticAgentRegistry {
    agents: HashMap<AgentId, AgentInfo>,
}

impl StaticAgentRegistry {
    pub fn new(agents: impl IntoIterator<Item = AgentInfo>) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }

    pub fn with_agent(mut self, id: &str, name: &str) -> Self {
        let info = AgentInfo {
            id: AgentId::from(id),
            name: name.to_string(),
            status: AgentStatus::Active,
        };
        let _ = self.agents.insert(info.id.clone(), info);
        self
    }
}

#[async_trait]
impl AgentRegistry for StaticAgentRegistry {
    async fn get_agent(&self, id: &AgentId) -> Result<Option<AgentInfo>, CollabError> {
        Ok(self.agents.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_delete() {
        let svc = InMemoryThreadService::new();
        let agent = AgentId::from("agent_1");
        let thread = svc.create_thread(&agent).await.unwrap();
        assert_eq!(thread.agent_id, agent);

        let fetched = svc.get_thread(&thread.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, thread.id);

        svc.delete_thread(&thread.id).await.unwrap();
        assert!(svc.get_thread(&thread.id).await.unwrap().is_none());
        assert!(matches!(
            svc.delete_thread(&thread.id).await,
            Err(CollabError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_fails_calls() {
        let svc = InMemoryThreadService::new();
        svc.set_unavailable(true);
        assert!(matches!(
            svc.create_thread(&AgentId::from("a")).await,
            Err(CollabError::Unavailable(_))
        ));
        svc.set_unavailable(false);
        assert!(svc.create_thread(&AgentId::from("a")).await.is_ok());
    }

    #[tokio::test]
    async fn registry_lookup() {
        let reg = StaticAgentRegistry::default().with_agent("agent_1", "Planner");
        let info = reg.get_agent(&AgentId::from("agent_1")).await.unwrap().unwrap();
        assert_eq!(info.name, "Planner");
        assert!(reg.get_agent(&AgentId::from("nope")).await.unwrap().is_none());
    }
}
