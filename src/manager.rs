use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::agent::Agent;
use crate::config::{BotConfig, TranscriptionConfig};
use crate::error::{BotError, BotResult};
use crate::meeting::MeetingClient;
use crate::translate::Translator;

/// Bounded registry of agents. One mutex guards the registry; it is never
/// held across agent I/O.
pub struct AgentManager {
    cap: usize,
    transcription: TranscriptionConfig,
    meetings: Arc<dyn MeetingClient>,
    translator: Arc<dyn Translator>,
    agents: Mutex<HashMap<Uuid, Arc<Agent>>>,
}

impl AgentManager {
    pub fn new(
        config: &BotConfig,
        meetings: Arc<dyn MeetingClient>,
        translator: Arc<dyn Translator>,
    ) -> Self {
        Self {
            cap: config.agents.max,
            transcription: config.transcription.clone(),
            meetings,
            translator,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a new agent. Fails once the cap is reached.
    pub fn add(&self) -> BotResult<Arc<Agent>> {
        let mut agents = self.agents.lock().unwrap();
        if agents.len() >= self.cap {
            return Err(BotError::CapacityExceeded(self.cap));
        }
        let agent = Agent::new(
            self.meetings.clone(),
            self.translator.clone(),
            self.transcription.clone(),
        );
        agents.insert(agent.id(), agent.clone());
        tracing::info!(agent = %agent.id(), "Agent registered ({}/{})", agents.len(), self.cap);
        Ok(agent)
    }

    /// Disconnect and evict an agent. Unknown ids are a no-op.
    pub async fn remove(&self, id: Uuid) {
        let agent = self.agents.lock().unwrap().get(&id).cloned();
        let Some(agent) = agent else { return };
        agent.disconnect().await;
        self.agents.lock().unwrap().remove(&id);
        tracing::info!(agent = %id, "Agent removed");
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Agent>> {
        self.agents.lock().unwrap().get(&id).cloned()
    }

    /// Snapshot of all registered agents.
    pub fn list(&self) -> Vec<Arc<Agent>> {
        self.agents.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentsConfig, LoggingConfig, TranslationConfig};
    use crate::testutil::{FakeMeetingClient, ScriptedTranslator};

    fn test_config(max: usize) -> BotConfig {
        BotConfig {
            transcription: TranscriptionConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                secret: "secret".to_string(),
                encryption: true,
                health_port: 2,
            },
            translation: TranslationConfig {
                url: "http://127.0.0.1:3/translate".to_string(),
            },
            agents: AgentsConfig { max },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }

    fn manager(max: usize) -> AgentManager {
        AgentManager::new(
            &test_config(max),
            Arc::new(FakeMeetingClient::new()),
            Arc::new(ScriptedTranslator::new()),
        )
    }

    #[tokio::test]
    async fn test_cap_is_enforced() {
        let manager = manager(2);
        manager.add().unwrap();
        manager.add().unwrap();
        match manager.add() {
            Err(BotError::CapacityExceeded(2)) => {}
            other => panic!("expected capacity error, got {other:?}"),
        }
        assert_eq!(manager.list().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_frees_capacity() {
        let manager = manager(1);
        let agent = manager.add().unwrap();
        assert!(manager.add().is_err());

        manager.remove(agent.id()).await;
        assert!(manager.get(agent.id()).is_none());
        assert!(manager.add().is_ok());
    }

    #[tokio::test]
    async fn test_remove_unknown_id_is_noop() {
        let manager = manager(1);
        manager.remove(Uuid::new_v4()).await;
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_get_and_list_snapshots() {
        let manager = manager(4);
        let a = manager.add().unwrap();
        let b = manager.add().unwrap();

        assert_eq!(manager.get(a.id()).unwrap().id(), a.id());
        let mut ids: Vec<Uuid> = manager.list().iter().map(|agent| agent.id()).collect();
        ids.sort();
        let mut expected = vec![a.id(), b.id()];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
