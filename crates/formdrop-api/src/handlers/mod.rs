pub mod health;
pub mod tus;
