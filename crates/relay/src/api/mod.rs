pub mod rooms;
pub mod sessions;
