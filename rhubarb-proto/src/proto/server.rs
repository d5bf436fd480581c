use alloc::boxed::Box;

use crate::{error::ServerError, message::ServerMessage, ServerInfo};

/// An operation received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info { info: Box<ServerInfo> },
    Message { message: ServerMessage },
    Success,
    Error { error: ServerError },
    Ping,
    Pong,
}
