pub mod commit;
pub mod config;
pub mod error;
pub mod event;
pub mod labels;
pub mod release;
pub mod version;
