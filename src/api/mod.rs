//! REST API client module for the ShopSync backend.
//!
//! This module provides the `ApiClient` for communicating with the
//! shop management API to fetch order, appointment, customer, vehicle,
//! and staff data, and to apply the small set of supported mutations.
//!
//! The API uses JWT bearer token authentication obtained through the
//! `/auth/login` endpoint.

pub mod client;
pub mod error;

pub use client::{ApiClient, AppointmentDraft};
pub use error::ApiError;
