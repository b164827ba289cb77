pub mod error;
pub mod ws;
