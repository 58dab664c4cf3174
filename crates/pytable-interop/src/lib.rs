pub mod config;
pub mod error;
pub mod exception;
pub mod function;
pub mod object;
