pub mod app_info;
pub mod feed;
pub mod health;
