use alloc::boxed::Box;
use core::num::NonZeroU64;

use crate::{
    connect::Connect, message::Message, queue_group::QueueGroup,
    subscription_id::SubscriptionId, Subject,
};

/// An operation sent by the client to the server
#[derive(Debug, Clone)]
pub enum ClientOp {
    Connect {
        connect: Box<Connect>,
    },
    Publish {
        message: Message,
    },
    Subscribe {
        id: SubscriptionId,
        subject: Subject,
        queue_group: Option<QueueGroup>,
    },
    Unsubscribe {
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    },
    Ping,
    Pong,
}
