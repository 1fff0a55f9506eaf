pub mod budget;
pub mod config;
pub mod daemon;
pub mod helpers;
pub mod init;
pub mod lists;
pub mod replay;
pub mod report;
