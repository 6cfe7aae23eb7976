mod connection;
mod envelope;
mod message;

pub(crate) use connection::{
    try_connection_established, try_subscription_error, try_subscription_succeeded,
};
pub(crate) use envelope::GatewayEvent;
pub(crate) use message::{try_message_deleted, try_message_edited, try_message_new};
