pub mod config;
pub mod protocol;
pub mod rules;
pub mod server;
pub mod session;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use config::{OperatingModel, SessionConfig};
pub use protocol::{Message, Payload, PayloadType};
pub use rules::Rules;
pub use session::{Client, Session};
pub use transport::{Connection, ConnectionEvent};
