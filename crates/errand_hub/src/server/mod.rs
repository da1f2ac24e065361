#![forbid(unsafe_code)]

pub mod admin;
pub mod auth;
pub mod dispatch;
pub mod handshake;
pub mod notify;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod admin_tests;


#[cfg(test)]
mod hub_e2e_tests;
