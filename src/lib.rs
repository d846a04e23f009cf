pub mod catalog;
pub mod config;
pub mod ipc;
pub mod keeper;
pub mod maintenance;
pub mod retention;
pub mod scheduler;
pub mod supervisor;
pub mod utils;
