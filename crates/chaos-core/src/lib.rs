pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod experiment;
pub mod fake;
pub mod injector;
pub mod reconciler;
pub mod report;
pub mod safety;
pub mod schedule;
pub mod selector;
pub mod status;
pub mod target;
