pub mod connection_log;
pub mod endpoint;
pub mod error;
pub mod heartbeat;
pub mod listeners;
pub mod reconnect;
pub mod session;
pub mod status;
pub mod transport;

pub use connection_log::ConnectionLog;
pub use endpoint::{format_websocket_url, is_valid_websocket_url};
pub use error::{ClientError, TransportError};
pub use listeners::ListenerId;
pub use reconnect::ReconnectPolicy;
pub use session::{ClientConfig, ClientSession};
pub use status::{ConnectionState, StatusInfo};
pub use transport::{Connector, Transport, WsConnector};
