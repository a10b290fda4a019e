pub mod adapter;
pub mod api;
pub mod auth;
pub mod config;
pub mod debounce;
pub mod dispatcher;
pub mod fields;
pub mod mapper;
pub mod model;
pub mod poller;
pub mod push;
pub mod store;

#[cfg(test)]
mod test_support;

pub use adapter::{AdapterSession, RunningAdapter, StartupError};
pub use api::{ApiError, ApiGateway, HttpTransport, Transport};
pub use auth::{AuthError, CredentialManager, TokenSource};
pub use config::{AdapterConfig, ConfigError};
pub use dispatcher::{CommandDispatcher, DispatchError};
pub use mapper::{MappingError, StateMapper};
pub use model::{Charger, SessionRecord};
pub use poller::{CycleReport, PollError, PollScheduler};
pub use push::{PushError, PushListener};
pub use store::{MemoryStore, StateChange, StateDefinition, StateEntry, StateStore, StoreError, StoredState};
