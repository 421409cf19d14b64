use std::sync::Arc;

use crate::events::EventPublisher;
use crate::session::SharedSession;
use crate::snapshot::SnapshotLoader;

/// Shared handles for the request handlers. Handlers only read the session;
/// ingested events go through `publisher` into the apply loop.
#[derive(Clone)]
pub struct AppState {
    pub session: SharedSession,
    pub publisher: EventPublisher,
    pub loader: Arc<dyn SnapshotLoader>,
}
