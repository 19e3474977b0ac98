use std::sync::Arc;

use crate::{configs::Config, server::DispatcherHandle, sources::SourceManager};

/// Shared by every HTTP and websocket handler.
pub struct AppState {
    pub config: Config,
    pub dispatcher: DispatcherHandle,
    pub source_manager: Arc<SourceManager>,
}
