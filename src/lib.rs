// Device gateway library. The pipeline lives in `topics`, `frame`, `dispatch`
// and `orchestrator`; the broker, database and HTTP edges in `mqtt`, `db` and
// `server`. The record store and the outbound publish queue are public so
// other tools can share them.
pub mod config;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod mqtt;
pub mod orchestrator;
pub mod page;
pub mod server;
pub mod topics;
