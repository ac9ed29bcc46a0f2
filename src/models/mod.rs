//! Data models for shop management entities.
//!
//! This module contains all the data structures used to represent
//! backend data including:
//!
//! - `Order`, `OrderStatus`: Work orders on the shop board
//! - `Appointment`, `AppointmentStatus`: Calendar drop-offs
//! - `Customer`, `Vehicle`: The customer directory and vehicles on file
//! - `StaffUser`, `StaffRole`, `Profile`: The staff roster and the
//!   signed-in user
//!
//! All types round-trip the backend's camelCase JSON and double as the
//! cache payload shapes consumers decode snapshots into.

pub mod appointment;
pub mod customer;
pub mod order;
pub mod staff;
pub mod vehicle;

pub use appointment::{Appointment, AppointmentStatus};
pub use customer::Customer;
pub use order::{CountResponse, Order, OrderStatus};
pub use staff::{Profile, StaffRole, StaffUser};
pub use vehicle::Vehicle;
