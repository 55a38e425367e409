use std::sync::Arc;

use crate::AppState;
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::{EngineConfig, FileConfig};
use crate::events::create_event_bus;
use crate::metrics::{self, EngineMetrics};
use crate::registry::SessionRegistry;
use crate::store::PersistHandle;
use crate::stream::StreamManager;

/// Build a fully-wired `AppState` with persistence disabled and `cat` as
/// the session command, so sessions stay alive until closed and echo
/// their input back. Suitable for handler tests without real I/O setup.
pub async fn test_app_state() -> AppState {
    let mut config = EngineConfig::from_file(&FileConfig::default());
    config.shell_command = "cat".to_string();
    config.assistant_command = "cat".to_string();
    config.terminate_grace = std::time::Duration::from_millis(500);
    config.attach_retry_base = std::time::Duration::from_millis(10);

    let events = create_event_bus();
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), events.clone()));
    let persist = PersistHandle::new(None, breaker);

    let registry = Arc::new(SessionRegistry::new(config, events.clone(), persist.clone()));
    let streams = StreamManager::new(registry.clone());
    streams.start();

    let engine_metrics = Arc::new(EngineMetrics::new());
    metrics::spawn_collector(engine_metrics.clone(), &events);

    AppState {
        registry,
        streams,
        metrics: engine_metrics,
        persist,
        store: None,
    }
}
