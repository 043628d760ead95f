pub mod service;
pub mod store;

pub use service::AgentService;
pub use store::{AgentStore, FileKvStore, KvStore};
