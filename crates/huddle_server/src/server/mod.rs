#![forbid(unsafe_code)]

pub mod auth;
pub mod broadcaster;
pub mod connection;
pub mod dispatcher;
pub mod http;
pub mod jobs;
pub mod registry;
pub mod relay;
pub mod room_index;
pub mod store;
pub mod watchdog;


#[cfg(test)]
mod dispatcher_tests;

#[cfg(test)]
mod registry_tests;

#[cfg(test)]
mod room_index_tests;

#[cfg(test)]
mod watchdog_tests;
