//! Dashboard aggregations over cached collections.
//!
//! Pure functions the embedder calls on decoded snapshots; nothing here
//! touches the network or the cache. Callers pass "today" in so the
//! results stay deterministic under test.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::models::{Appointment, Order, OrderStatus};

/// Total revenue in cents across delivered orders
pub fn delivered_revenue_cents(orders: &[Order]) -> i64 {
    orders
        .iter()
        .filter(|order| order.status == OrderStatus::Delivered)
        .map(|order| order.total_cents)
        .sum()
}

/// Orders still occupying a bay or the parts queue
pub fn open_order_count(orders: &[Order]) -> usize {
    orders.iter().filter(|order| order.is_open()).count()
}

/// Board breakdown keyed by status, including zero rows so the dashboard
/// renders a stable set of buckets
pub fn orders_by_status(orders: &[Order]) -> BTreeMap<String, usize> {
    let mut breakdown: BTreeMap<String, usize> = OrderStatus::all()
        .iter()
        .map(|status| (status.to_string(), 0))
        .collect();
    for order in orders {
        *breakdown.entry(order.status.to_string()).or_insert(0) += 1;
    }
    breakdown
}

/// Active appointments scheduled on the given day, earliest first
pub fn appointments_on(appointments: &[Appointment], date: NaiveDate) -> Vec<Appointment> {
    let mut todays: Vec<Appointment> = appointments
        .iter()
        .filter(|appointment| appointment.is_active() && appointment.is_on(date))
        .cloned()
        .collect();
    todays.sort_by_key(|appointment| appointment.scheduled_at);
    todays
}
