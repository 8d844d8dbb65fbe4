pub mod convert;
pub mod download;
pub mod health;
pub mod status;
