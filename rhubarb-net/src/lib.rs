pub use self::connection::StreamingConnection;
pub use self::connector::{handshake, ConnectOutcome, Connector, TcpConnection};
pub use self::dial::dial_tcp;
pub use self::security::ConnectionSecurity;

mod connection;
mod connector;
mod dial;
mod security;

pub mod error {
    pub use super::connection::StreamingReadError;
    pub use super::connector::ConnectError;
}
