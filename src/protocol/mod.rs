pub mod adapter;
pub mod chat;
pub mod responses;
