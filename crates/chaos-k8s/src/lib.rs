pub mod api;
pub mod client;
pub mod config;
pub mod controller;
pub mod exec;
pub mod injectors;
