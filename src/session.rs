use std::sync::Arc;
use std::time::SystemTime;

use slab::Slab;
use tokio::sync::RwLock;

use crate::supervisor::SupervisorState;

/// One client's streaming session as seen from outside its task.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: usize,
    pub created_at: SystemTime,
    pub state: SupervisorState,
    ffmpeg_pid: Option<u32>,
}

impl Session {
    fn new(id: usize) -> Self {
        Session {
            id,
            created_at: SystemTime::now(),
            state: SupervisorState::Idle,
            ffmpeg_pid: None,
        }
    }

    pub fn get_ffmpeg_pid(&self) -> Option<u32> {
        self.ffmpeg_pid
    }

    pub fn set_ffmpeg_pid(&mut self, pid: Option<u32>) {
        self.ffmpeg_pid = pid;
    }
}

/// Process-wide session table keyed by session id. The slot key handed out
/// by `insert` is the session id for the lifetime of the connection.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<Slab<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: Arc::new(RwLock::new(Slab::new())),
        }
    }

    pub async fn insert(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.vacant_entry();
        let id = entry.key();
        entry.insert(Session::new(id));
        id
    }

    pub async fn update(&self, id: usize, state: SupervisorState, pid: Option<u32>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.state = state;
            session.set_ffmpeg_pid(pid);
        }
    }

    pub async fn remove(&self, id: usize) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        sessions.try_remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(_, session)| session.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_distinct_while_live() {
        let registry = SessionRegistry::new();
        let a = registry.insert().await;
        let b = registry.insert().await;
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);

        registry.update(a, SupervisorState::Running, Some(4242)).await;
        let snapshot = registry.snapshot().await;
        let session = snapshot.iter().find(|session| session.id == a).unwrap();
        assert_eq!(session.state, SupervisorState::Running);
        assert_eq!(session.get_ffmpeg_pid(), Some(4242));
        let other = snapshot.iter().find(|session| session.id == b).unwrap();
        assert_eq!(other.state, SupervisorState::Idle);
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = registry.insert().await;
        assert!(registry.remove(id).await.is_some());
        assert!(registry.remove(id).await.is_none());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_collide() {
        let registry = SessionRegistry::new();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = registry.insert().await;
                registry.update(id, SupervisorState::Starting, None).await;
                id
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert!(registry
            .snapshot()
            .await
            .iter()
            .all(|session| session.state == SupervisorState::Starting));
    }
}
