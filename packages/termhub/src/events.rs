//! Typed session events on a shared broadcast bus.
//!
//! Every mutating component publishes here after its state change is
//! applied in memory, so subscribers never observe a state that was later
//! rolled back. Delivery is best-effort: a lagging subscriber loses the
//! oldest events rather than back-pressuring the publisher.

use tokio::sync::broadcast;

use crate::breaker::CircuitState;

/// Bounded bus capacity. Overflow drops the oldest events for the slow
/// subscriber only; the data path is never blocked.
pub const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub enum SessionEvent {
    Created {
        session_id: String,
        project_id: String,
    },
    Suspended {
        project_id: String,
        session_ids: Vec<String>,
    },
    Resumed {
        project_id: String,
        session_ids: Vec<String>,
    },
    Closed {
        session_id: String,
        project_id: String,
    },
    FocusChanged {
        project_id: String,
        session_id: String,
        focused: bool,
    },
    ProcessExited {
        session_id: String,
        exit_code: Option<i32>,
    },
    ConnectionAttached {
        session_id: String,
    },
    ConnectionDetached {
        session_id: String,
    },
    BufferOverflow {
        session_id: String,
        dropped_chunks: u64,
    },
    CircuitTransition {
        from: CircuitState,
        to: CircuitState,
    },
}

pub type EventBus = broadcast::Sender<SessionEvent>;

pub fn create_event_bus() -> EventBus {
    let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
    tx
}
