pub mod chat;
pub mod problem;
