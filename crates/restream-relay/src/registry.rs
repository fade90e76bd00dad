//! Active proxy task registry and start/stop event bus.
//!
//! Listeners are registered once at startup and invoked synchronously on the
//! emitting task, so a stop event observably follows all of that proxy's
//! prior activity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use restream_models::VideoId;

use crate::proxy::SourceProxyTask;

/// Event fired when a source proxy task starts or stops.
pub struct ProxyEvent {
    pub task: Arc<SourceProxyTask>,
}

/// Observer of proxy lifecycle events.
pub trait ProxyEventListener: Send + Sync {
    fn on_proxy_start(&self, event: &ProxyEvent);
    fn on_proxy_stop(&self, event: &ProxyEvent);
}

/// Process-wide registry of running source proxy tasks.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<VideoId, Arc<SourceProxyTask>>>,
    listeners: Mutex<Vec<Arc<dyn ProxyEventListener>>>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn ProxyEventListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Register a task under its video id. Fails if one is already present.
    pub fn register(&self, task: Arc<SourceProxyTask>) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let id = task.video_id().clone();
        if tasks.contains_key(&id) {
            return false;
        }
        debug!(video_id = %id, "Proxy task registered");
        tasks.insert(id, task);
        true
    }

    pub fn unregister(&self, video_id: &VideoId) -> Option<Arc<SourceProxyTask>> {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(video_id);
        if removed.is_some() {
            debug!(video_id = %video_id, "Proxy task unregistered");
        }
        removed
    }

    pub fn get(&self, video_id: &VideoId) -> Option<Arc<SourceProxyTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(video_id)
            .cloned()
    }

    pub fn contains(&self, video_id: &VideoId) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(video_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all registered tasks.
    pub fn tasks(&self) -> Vec<Arc<SourceProxyTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn listeners(&self) -> Vec<Arc<dyn ProxyEventListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fire the start event. Called by the owning task after registration.
    pub(crate) fn fire_start(&self, task: &Arc<SourceProxyTask>) {
        let event = ProxyEvent {
            task: Arc::clone(task),
        };
        for listener in self.listeners() {
            listener.on_proxy_start(&event);
        }
    }

    /// Fire the stop event. Called by the owning task after unregistration.
    pub(crate) fn fire_stop(&self, task: &Arc<SourceProxyTask>) {
        let event = ProxyEvent {
            task: Arc::clone(task),
        };
        for listener in self.listeners() {
            listener.on_proxy_stop(&event);
        }
    }
}
