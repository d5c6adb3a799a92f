//! API Handlers

pub mod auth;
pub mod chats;
pub mod listings;
pub mod orders;
pub mod users;
