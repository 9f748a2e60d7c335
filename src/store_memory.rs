use crate::error::{EngineError, Result};
use crate::store::*;
use crate::types::{merge_frames, ForkFrame};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    states: HashMap<Uuid, GatewayState>,
    /// Creation sequence per state, for most-recent-first ordering.
    seq: HashMap<Uuid, u64>,
    next_seq: u64,
    /// (instance, gateway) → last generation handed out.
    generations: HashMap<(String, String), u32>,
}

impl Inner {
    fn next_generation(&mut self, process_instance_id: &str, gateway_id: &str) -> u32 {
        let g = self
            .generations
            .entry((process_instance_id.to_string(), gateway_id.to_string()))
            .or_insert(0);
        *g += 1;
        *g
    }

    fn insert(&mut self, state: GatewayState) -> GatewayState {
        self.next_seq += 1;
        self.seq.insert(state.id, self.next_seq);
        self.states.insert(state.id, state.clone());
        state
    }

    fn remove_instance(&mut self, process_instance_id: &str) -> usize {
        let ids: Vec<Uuid> = self
            .states
            .values()
            .filter(|s| s.process_instance_id == process_instance_id)
            .map(|s| s.id)
            .collect();
        for id in &ids {
            self.states.remove(id);
            self.seq.remove(id);
        }
        ids.len()
    }

    fn increment(&mut self, id: Uuid) -> Result<&mut GatewayState> {
        let state = self
            .states
            .get_mut(&id)
            .ok_or(EngineError::GatewayStateNotFound(id))?;

        if !state.is_active {
            return Err(EngineError::JoinAlreadyResolved(id));
        }
        if state.completed_branches >= state.active_branches {
            return Err(EngineError::BranchCountExceeded {
                state_id: id,
                active_branches: state.active_branches,
            });
        }

        state.completed_branches += 1;
        if state.gateway_type == GatewayStateKind::Join
            && state.completed_branches == state.active_branches
        {
            state.is_active = false;
        }
        Ok(state)
    }

    fn find_active_join(
        &self,
        process_instance_id: &str,
        gateway_id: &str,
        correlation_id: Option<Uuid>,
    ) -> Option<&GatewayState> {
        self.states.values().find(|s| {
            s.gateway_type == GatewayStateKind::Join
                && s.is_active
                && s.process_instance_id == process_instance_id
                && s.gateway_id == gateway_id
                && s.correlation_id == correlation_id
        })
    }
}

/// In-memory gateway state store. A single lock guards every operation, which
/// makes increment-and-compare atomic.
#[derive(Default)]
pub struct MemoryGatewayStateStore {
    inner: Mutex<Inner>,
}

impl MemoryGatewayStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.states.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl GatewayStateStore for MemoryGatewayStateStore {
    async fn create_fork_state(&self, new: NewForkState) -> Result<GatewayState> {
        let mut inner = self.inner.lock().await;
        let generation = inner.next_generation(&new.process_instance_id, &new.gateway_id);
        let state = GatewayState {
            id: Uuid::now_v7(),
            process_instance_id: new.process_instance_id,
            execution_id: new.execution_id,
            gateway_id: new.gateway_id,
            gateway_type: GatewayStateKind::Fork,
            active_branches: new.branch_targets.len() as u32,
            completed_branches: 0,
            branch_targets: new.branch_targets,
            is_active: true,
            correlation_id: None,
            arrived_frames: None,
            generation,
            created_at: Utc::now(),
        };
        Ok(inner.insert(state))
    }

    async fn create_join_state(&self, new: NewJoinState) -> Result<GatewayState> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) =
            inner.find_active_join(&new.process_instance_id, &new.gateway_id, new.correlation_id)
        {
            return Ok(existing.clone());
        }
        let generation = inner.next_generation(&new.process_instance_id, &new.gateway_id);
        let state = GatewayState {
            id: Uuid::now_v7(),
            process_instance_id: new.process_instance_id,
            execution_id: new.execution_id,
            gateway_id: new.gateway_id,
            gateway_type: GatewayStateKind::Join,
            active_branches: new.active_branches.max(1),
            completed_branches: 0,
            branch_targets: Vec::new(),
            is_active: true,
            correlation_id: new.correlation_id,
            arrived_frames: None,
            generation,
            created_at: Utc::now(),
        };
        Ok(inner.insert(state))
    }

    async fn get_join_state(
        &self,
        process_instance_id: &str,
        gateway_id: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<Option<GatewayState>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .find_active_join(process_instance_id, gateway_id, correlation_id)
            .cloned())
    }

    async fn get_state(&self, id: Uuid) -> Result<Option<GatewayState>> {
        Ok(self.inner.lock().await.states.get(&id).cloned())
    }

    async fn increment_completed_branches(&self, id: Uuid) -> Result<GatewayState> {
        let mut inner = self.inner.lock().await;
        Ok(inner.increment(id)?.clone())
    }

    async fn record_arrival(&self, id: Uuid, frames: &[ForkFrame]) -> Result<GatewayState> {
        let mut inner = self.inner.lock().await;
        let state = inner.increment(id)?;
        state.arrived_frames = Some(match &state.arrived_frames {
            Some(shared) => merge_frames(shared, frames),
            None => frames.to_vec(),
        });
        Ok(state.clone())
    }

    async fn complete_state(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .states
            .get_mut(&id)
            .ok_or(EngineError::GatewayStateNotFound(id))?;
        state.is_active = false;
        Ok(())
    }

    async fn get_active_states(&self, process_instance_id: &str) -> Result<Vec<GatewayState>> {
        let inner = self.inner.lock().await;
        let mut active: Vec<(u64, GatewayState)> = inner
            .states
            .values()
            .filter(|s| s.is_active && s.process_instance_id == process_instance_id)
            .map(|s| (inner.seq.get(&s.id).copied().unwrap_or(0), s.clone()))
            .collect();
        active.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(active.into_iter().map(|(_, s)| s).collect())
    }

    async fn delete_by_process_instance(&self, process_instance_id: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let removed = inner.remove_instance(process_instance_id);
        inner
            .generations
            .retain(|(pid, _), _| pid.as_str() != process_instance_id);
        Ok(removed)
    }

    async fn get_states(&self, process_instance_id: &str) -> Result<Vec<GatewayState>> {
        let inner = self.inner.lock().await;
        let mut states: Vec<(u64, GatewayState)> = inner
            .states
            .values()
            .filter(|s| s.process_instance_id == process_instance_id)
            .map(|s| (inner.seq.get(&s.id).copied().unwrap_or(0), s.clone()))
            .collect();
        states.sort_by_key(|(seq, _)| *seq);
        Ok(states.into_iter().map(|(_, s)| s).collect())
    }

    async fn restore_states(
        &self,
        process_instance_id: &str,
        states: Vec<GatewayState>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.remove_instance(process_instance_id);
        // Generations stay as they are, so a retried step never reuses one.
        for state in states {
            inner.insert(state);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn join(pid: &str, gw: &str, branches: u32, corr: Option<Uuid>) -> NewJoinState {
        NewJoinState {
            process_instance_id: pid.to_string(),
            execution_id: None,
            gateway_id: gw.to_string(),
            active_branches: branches,
            correlation_id: corr,
        }
    }

    #[tokio::test]
    async fn join_resolves_exactly_once() {
        let store = MemoryGatewayStateStore::new();
        let state = store.create_join_state(join("pi-1", "j", 2, None)).await.unwrap();

        let s1 = store.increment_completed_branches(state.id).await.unwrap();
        assert!(s1.is_active);
        let s2 = store.increment_completed_branches(state.id).await.unwrap();
        assert!(!s2.is_active);
        assert_eq!(s2.completed_branches, 2);

        let err = store.increment_completed_branches(state.id).await.unwrap_err();
        assert!(matches!(err, EngineError::JoinAlreadyResolved(_)));
    }

    #[tokio::test]
    async fn create_join_state_is_get_or_create() {
        let store = MemoryGatewayStateStore::new();
        let a = store.create_join_state(join("pi-1", "j", 3, None)).await.unwrap();
        let b = store.create_join_state(join("pi-1", "j", 3, None)).await.unwrap();
        assert_eq!(a.id, b.id);

        let corr = Uuid::now_v7();
        let c = store.create_join_state(join("pi-1", "j", 3, Some(corr))).await.unwrap();
        assert_ne!(a.id, c.id);
        assert_eq!(c.generation, 2);

        let found = store.get_join_state("pi-1", "j", Some(corr)).await.unwrap();
        assert_eq!(found.map(|s| s.id), Some(c.id));
    }

    #[tokio::test]
    async fn concurrent_increments_never_overcount() {
        let store = Arc::new(MemoryGatewayStateStore::new());
        let state = store.create_join_state(join("pi-1", "j", 8, None)).await.unwrap();

        let id = state.id;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment_completed_branches(id).await.unwrap()
            }));
        }
        let mut released = 0;
        for h in handles {
            if !h.await.unwrap().is_active {
                released += 1;
            }
        }
        assert_eq!(released, 1);
        let final_state = store.get_state(state.id).await.unwrap().unwrap();
        assert_eq!(final_state.completed_branches, 8);
    }

    #[tokio::test]
    async fn restore_undoes_writes_since_snapshot() {
        let store = MemoryGatewayStateStore::new();
        let state = store.create_join_state(join("pi-1", "j", 2, None)).await.unwrap();
        store.increment_completed_branches(state.id).await.unwrap();
        let snapshot = store.get_states("pi-1").await.unwrap();

        store.increment_completed_branches(state.id).await.unwrap();
        store.create_join_state(join("pi-1", "k", 2, None)).await.unwrap();
        store.create_join_state(join("pi-2", "j", 2, None)).await.unwrap();
        store.restore_states("pi-1", snapshot.clone()).await.unwrap();

        assert_eq!(store.get_states("pi-1").await.unwrap(), snapshot);
        let restored = store.get_state(state.id).await.unwrap().unwrap();
        assert_eq!(restored.completed_branches, 1);
        assert!(restored.is_active);
        assert_eq!(store.get_states("pi-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn arrivals_fold_their_frames() {
        let store = MemoryGatewayStateStore::new();
        let state = store.create_join_state(join("pi-1", "j", 2, None)).await.unwrap();
        let fork = ForkFrame {
            gateway_id: "p".into(),
            fork_state_id: Uuid::now_v7(),
            branch_count: 2,
            generation: 1,
            branches: vec![],
        };

        let first = store.record_arrival(state.id, &[fork.for_branch(1)]).await.unwrap();
        assert_eq!(first.arrived_frames, Some(vec![fork.for_branch(1)]));
        let second = store.record_arrival(state.id, &[fork.for_branch(0)]).await.unwrap();
        let shared = second.arrived_frames.unwrap();
        assert_eq!(shared[0].branches, vec![0, 1]);
        assert!(!second.is_active);
    }

    #[tokio::test]
    async fn active_states_most_recent_first_and_cleanup() {
        let store = MemoryGatewayStateStore::new();
        let f1 = store
            .create_fork_state(NewForkState {
                process_instance_id: "pi-1".into(),
                execution_id: None,
                gateway_id: "f1".into(),
                branch_targets: vec!["a".into(), "b".into()],
            })
            .await
            .unwrap();
        assert_eq!(f1.active_branches, 2);
        let f2 = store
            .create_fork_state(NewForkState {
                process_instance_id: "pi-1".into(),
                execution_id: None,
                gateway_id: "f2".into(),
                branch_targets: vec!["c".into()],
            })
            .await
            .unwrap();

        let active = store.get_active_states("pi-1").await.unwrap();
        assert_eq!(active.iter().map(|s| s.id).collect::<Vec<_>>(), vec![f2.id, f1.id]);

        store.complete_state(f2.id).await.unwrap();
        store.complete_state(f2.id).await.unwrap();
        assert_eq!(store.get_active_states("pi-1").await.unwrap().len(), 1);

        assert_eq!(store.delete_by_process_instance("pi-1").await.unwrap(), 2);
        assert_eq!(store.delete_by_process_instance("pi-1").await.unwrap(), 0);
        assert!(store.is_empty().await);
    }
}
