#![forbid(unsafe_code)]

pub mod access;
pub mod audit;
pub mod control;
pub mod cooldown;
pub mod health;
pub mod lifecycle;
pub mod pending;
pub mod registry;
pub mod retry;
pub mod router;



#[cfg(test)]
mod router_tests;

#[cfg(test)]
mod test_support;
