pub mod chat_stream;
pub mod health;
pub mod request;
