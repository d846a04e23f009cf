pub mod backups;
pub mod server;
