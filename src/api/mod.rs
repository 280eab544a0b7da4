pub mod broadcast;
pub mod sessions;
