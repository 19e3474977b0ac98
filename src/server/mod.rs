pub mod app_state;
pub mod dispatcher;
pub mod registry;
pub mod voice_state;

pub use app_state::AppState;
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use registry::{Closed, ConnectionRegistry, Opened, Outbound, RegistryError, SocketEnd, SocketLink};
pub use voice_state::VoiceStateCache;
