//! Reach a database that only accepts connections from inside a private
//! network, through an SSH bastion, with one supervised connection per
//! process and bounded transparent reconnection.

pub mod config;
pub mod error;
pub mod services;

pub use config::Config;
pub use error::{ConnectError, GatewayError, QueryFailure};
pub use services::database::{Params, QueryGateway, Row, Value};
pub use services::ssh;
