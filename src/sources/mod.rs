pub mod http;
pub mod manager;
pub mod plugin;

pub use manager::{Provider, SourceError, SourceManager};
pub use plugin::{BoxedResolver, ProviderError, Resolved, TrackResolver};
