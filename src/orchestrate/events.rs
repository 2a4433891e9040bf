// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session events and observers.
//!
//! Every state change the operator surfaces care about goes through an
//! [`EventBus`]: it is broadcast to async subscribers (the control socket),
//! handed to synchronous [`EngineObserver`]s, and diagnostics are kept for the
//! session record.

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::Diagnostic;

use super::budget::BudgetSnapshot;
use super::types::{MergeOutcome, WorkerStatus};

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observers should know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: String,
        to: String,
    },
    DispatchReceived {
        directive: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        requests: usize,
    },
    DispatchSkipped {
        message: String,
    },
    WorkerStatus {
        worker_id: String,
        request_id: String,
        status: WorkerStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    WorkerCompleted {
        worker_id: String,
        request_id: String,
        status: WorkerStatus,
        partial: bool,
        summary: String,
        cost: f64,
    },
    MergeOutcome {
        outcome: MergeOutcome,
    },
    ApprovalRequired {
        worker_id: String,
        request_id: String,
        out_of_scope_paths: Vec<String>,
        conflict: bool,
    },
    ResponseWritten {
        marker: String,
        location: String,
    },
    BudgetUpdated {
        snapshot: BudgetSnapshot,
        /// Set on the update that first crossed the warning threshold.
        warning: bool,
    },
    Diagnostic {
        diagnostic: Diagnostic,
    },
}

impl SessionEvent {
    /// Wire name of the event type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::DispatchReceived { .. } => "dispatch_received",
            Self::DispatchSkipped { .. } => "dispatch_skipped",
            Self::WorkerStatus { .. } => "worker_status",
            Self::WorkerCompleted { .. } => "worker_completed",
            Self::MergeOutcome { .. } => "merge_outcome",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::ResponseWritten { .. } => "response_written",
            Self::BudgetUpdated { .. } => "budget_updated",
            Self::Diagnostic { .. } => "diagnostic",
        }
    }
}

/// An event stamped with its session and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub session_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Synchronous event consumer.
pub trait EngineObserver: Send + Sync {
    fn on_event(&self, record: &EventRecord);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObserver;

impl EngineObserver for NoOpObserver {
    fn on_event(&self, _record: &EventRecord) {}
}

/// Fan-out point for session events.
#[derive(Clone)]
pub struct EventBus {
    session_id: Arc<str>,
    sender: broadcast::Sender<EventRecord>,
    observers: Arc<RwLock<Vec<Arc<dyn EngineObserver>>>>,
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("session_id", &self.session_id)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session_id: Arc::from(session_id.into()),
            sender,
            observers: Arc::new(RwLock::new(Vec::new())),
            diagnostics: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn EngineObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn emit(&self, event: SessionEvent) {
        let record = EventRecord {
            session_id: self.session_id.to_string(),
            at: Utc::now(),
            event,
        };
        debug!(event = record.event.name(), "session event");

        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer.on_event(&record);
        }

        // No subscribers is fine.
        let _ = self.sender.send(record);
    }

    /// Record a recovered failure and broadcast it.
    pub fn diagnostic(&self, diagnostic: Diagnostic) {
        if diagnostic.kind.is_warning() {
            warn!("{}", diagnostic);
        } else {
            info!("{}", diagnostic);
        }
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(diagnostic.clone());
        self.emit(SessionEvent::Diagnostic { diagnostic });
    }

    /// Diagnostics recorded so far, oldest first.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosticKind;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EngineObserver for Recorder {
        fn on_event(&self, record: &EventRecord) {
            self.0.lock().unwrap().push(record.event.name().to_string());
        }
    }

    #[tokio::test]
    async fn test_subscribers_and_observers_receive_events() {
        let bus = EventBus::new("s-1");
        let mut rx = bus.subscribe();
        let recorder = Arc::new(Recorder::default());
        bus.add_observer(recorder.clone());
        bus.add_observer(Arc::new(NoOpObserver));

        bus.emit(SessionEvent::StateChanged {
            from: "created".to_string(),
            to: "running".to_string(),
        });

        let record = rx.recv().await.unwrap();
        assert_eq!(record.session_id, "s-1");
        assert_eq!(record.event.name(), "state_changed");
        assert_eq!(*recorder.0.lock().unwrap(), vec!["state_changed"]);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new("s-1");
        bus.emit(SessionEvent::DispatchSkipped {
            message: "bad".to_string(),
        });
    }

    #[test]
    fn test_diagnostics_are_kept() {
        let bus = EventBus::new("s-1");
        bus.diagnostic(Diagnostic::new(DiagnosticKind::WorkerTimeout, "slow").with_worker("w-1"));
        let diagnostics = bus.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].worker_id.as_deref(), Some("w-1"));
    }

    #[test]
    fn test_event_wire_format() {
        let record = EventRecord {
            session_id: "s-1".to_string(),
            at: Utc::now(),
            event: SessionEvent::WorkerStatus {
                worker_id: "w-1".to_string(),
                request_id: "req-1".to_string(),
                status: WorkerStatus::Running,
                branch: None,
            },
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "worker_status");
        assert_eq!(value["status"], "running");
        assert!(value.get("branch").is_none());

        let back: EventRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
