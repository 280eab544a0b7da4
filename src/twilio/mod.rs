pub mod media;
pub mod stream;
pub mod webhook;
