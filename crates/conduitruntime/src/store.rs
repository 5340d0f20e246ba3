use conduitcore::{LogLevel, RunContext, RunId, WorkflowRun};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::watch;

struct RunEntry {
    run: WorkflowRun,
    finished: watch::Sender<bool>,
}

struct StoreInner {
    runs: HashMap<RunId, RunEntry>,
    order: VecDeque<RunId>,
}

/// In-memory run history, bounded by evicting the oldest finished runs.
pub(crate) struct RunStore {
    max_retained: usize,
    inner: Mutex<StoreInner>,
}

impl RunStore {
    pub fn new(max_retained: usize) -> Self {
        Self {
            max_retained: max_retained.max(1),
            inner: Mutex::new(StoreInner {
                runs: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn insert(&self, run: WorkflowRun) {
        let mut inner = self.inner.lock();
        let id = run.id;
        let (finished, _) = watch::channel(run.status.is_terminal());
        inner.runs.insert(id, RunEntry { run, finished });
        inner.order.push_back(id);

        while inner.runs.len() > self.max_retained {
            let Some(pos) = inner
                .order
                .iter()
                .position(|id| inner.runs.get(id).is_some_and(|e| e.run.status.is_terminal()))
            else {
                // Everything retained is still running
                break;
            };
            if let Some(evicted) = inner.order.remove(pos) {
                inner.runs.remove(&evicted);
                tracing::debug!("Evicted run {} from history", evicted);
            }
        }
    }

    pub fn get(&self, id: &RunId) -> Option<WorkflowRun> {
        self.inner.lock().runs.get(id).map(|e| e.run.clone())
    }

    /// Runs in insertion order, optionally for one workflow only.
    pub fn list(&self, workflow_id: Option<&str>) -> Vec<WorkflowRun> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.runs.get(id))
            .filter(|e| workflow_id.map_or(true, |wf| e.run.workflow_id == wf))
            .map(|e| e.run.clone())
            .collect()
    }

    pub fn log(
        &self,
        id: &RunId,
        level: LogLevel,
        action_id: Option<&str>,
        message: impl Into<String>,
    ) {
        if let Some(entry) = self.inner.lock().runs.get_mut(id) {
            entry.run.log(level, action_id, message);
        }
    }

    pub fn set_context(&self, id: &RunId, context: RunContext) {
        if let Some(entry) = self.inner.lock().runs.get_mut(id) {
            entry.run.context = context;
        }
    }

    pub fn complete(&self, id: &RunId, context: RunContext) -> Option<WorkflowRun> {
        let mut inner = self.inner.lock();
        let entry = inner.runs.get_mut(id)?;
        entry.run.complete(context);
        entry.finished.send_replace(true);
        Some(entry.run.clone())
    }

    pub fn fail(
        &self,
        id: &RunId,
        action_id: &str,
        error: impl Into<String>,
    ) -> Option<WorkflowRun> {
        let mut inner = self.inner.lock();
        let entry = inner.runs.get_mut(id)?;
        entry.run.fail(action_id, error);
        entry.finished.send_replace(true);
        Some(entry.run.clone())
    }

    pub fn subscribe(&self, id: &RunId) -> Option<watch::Receiver<bool>> {
        self.inner.lock().runs.get(id).map(|e| e.finished.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(wf: &str) -> WorkflowRun {
        WorkflowRun::new(wf, "manual", json!({}))
    }

    #[test]
    fn evicts_oldest_finished_run_first() {
        let store = RunStore::new(2);
        let a = run("a");
        let b = run("b");
        let (a_id, b_id) = (a.id, b.id);
        store.insert(a);
        store.insert(b);
        store.complete(&b_id, RunContext::new(json!({})));

        let c = run("c");
        let c_id = c.id;
        store.insert(c);

        // `a` is still running, so the finished `b` goes
        assert!(store.get(&a_id).is_some());
        assert!(store.get(&b_id).is_none());
        assert!(store.get(&c_id).is_some());
    }

    #[test]
    fn list_filters_by_workflow() {
        let store = RunStore::new(10);
        store.insert(run("a"));
        store.insert(run("b"));
        store.insert(run("a"));
        assert_eq!(store.list(Some("a")).len(), 2);
        assert_eq!(store.list(None).len(), 3);
    }

    #[tokio::test]
    async fn subscribers_see_completion() {
        let store = RunStore::new(10);
        let r = run("a");
        let id = r.id;
        store.insert(r);

        let mut rx = store.subscribe(&id).unwrap();
        assert!(!*rx.borrow());
        store.fail(&id, "step", "boom");
        rx.wait_for(|done| *done).await.unwrap();
        assert_eq!(store.get(&id).unwrap().error.as_deref(), Some("boom"));
    }
}
