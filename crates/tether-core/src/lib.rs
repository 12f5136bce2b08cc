pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logs;
pub mod messages;
pub mod protocol;
pub mod provider;
pub mod tools;
