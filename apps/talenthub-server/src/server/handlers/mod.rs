pub(crate) mod auth;
pub(crate) mod channels;
pub(crate) mod conversations;
pub(crate) mod files;
pub(crate) mod friends;
pub(crate) mod messages;
pub(crate) mod portfolios;
pub(crate) mod realtime_auth;
pub(crate) mod servers;
pub(crate) mod users;

pub(crate) use auth::*;
pub(crate) use channels::*;
pub(crate) use conversations::*;
pub(crate) use files::*;
pub(crate) use friends::*;
pub(crate) use messages::*;
pub(crate) use portfolios::*;
pub(crate) use realtime_auth::*;
pub(crate) use servers::*;
pub(crate) use users::*;
