pub mod dev;
pub mod optimize;
