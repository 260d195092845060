//! Supervised database access through the bastion tunnel.

mod driver;
mod gateway;
mod mysql;
mod supervisor;
mod types;

pub use driver::{DatabaseConnection, DatabaseDriver};
pub use gateway::QueryGateway;
pub use mysql::MySqlDriver;
pub use supervisor::{ConnectionHealth, ConnectionSupervisor, ManagedConnection, SupervisorState};
pub use types::{Params, Row, Value};
