//! Core types of the routing and settlement domain, and the ports the
//! application layer talks to.

pub mod actor;
pub mod balance;
pub mod merchant;
pub mod order;
pub mod ports;
pub mod requisite;
