pub mod command;
pub mod datetime;
pub mod env;
pub mod logging;
