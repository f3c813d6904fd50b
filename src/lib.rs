pub mod config;
pub mod error;
pub mod event;
pub mod logger;
pub mod marshal;
pub mod module;
pub mod schema;
pub mod session;
pub mod util;
pub mod worker;
