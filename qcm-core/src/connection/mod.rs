pub mod engine;
pub mod transport;

pub use engine::{DEFAULT_REQUEST_TIMEOUT, Engine, EngineClient};
pub use transport::{MemoryPeer, MemoryTransport, Transport};
