pub mod aliases;
pub mod commands;
pub mod executor;
pub mod jobs;
pub mod lifecycle;
pub mod logs;
pub mod request;
pub mod store;
pub mod templates;
pub mod terminal;
pub mod tokens;
