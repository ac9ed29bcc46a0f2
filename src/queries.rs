//! Named query catalog: the canonical cache keys, the fetchers that back
//! them, and the mutation helpers that keep them honest.
//!
//! Every collection the app displays has exactly one key shape defined
//! here, so invalidation prefixes line up across the codebase. Fetchers
//! close over a cloned [`ApiClient`] and encode the typed response into
//! the engine's JSON payload.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::api::{ApiClient, ApiError, AppointmentDraft};
use crate::auth::PrefetchQuery;
use crate::cache::{FetchResult, QueryClient, QueryError, QueryFetcher, QueryKey};
use crate::models::{Appointment, Order, OrderStatus};

// ===== Canonical Keys =====

pub fn orders_key() -> QueryKey {
    QueryKey::root("orders")
}

pub fn order_count_key() -> QueryKey {
    QueryKey::root("orders").join("count")
}

pub fn appointments_key() -> QueryKey {
    QueryKey::root("appointments")
}

pub fn appointment_key(appointment_id: i64) -> QueryKey {
    QueryKey::root("appointments").join(appointment_id)
}

pub fn customers_key() -> QueryKey {
    QueryKey::root("customers")
}

pub fn vehicles_key() -> QueryKey {
    QueryKey::root("vehicles")
}

pub fn users_key() -> QueryKey {
    QueryKey::root("users")
}

pub fn profile_key() -> QueryKey {
    QueryKey::root("profile")
}

// ===== Fetchers =====

fn encode<T: Serialize>(value: &T) -> FetchResult {
    serde_json::to_value(value).map_err(|error| QueryError::Data(error.to_string()))
}

pub fn orders_fetcher(api: &ApiClient) -> QueryFetcher {
    let api = api.clone();
    Arc::new(move || {
        let api = api.clone();
        Box::pin(async move {
            let orders = api.list_orders().await.map_err(QueryError::from)?;
            encode(&orders)
        })
    })
}

pub fn order_count_fetcher(api: &ApiClient) -> QueryFetcher {
    let api = api.clone();
    Arc::new(move || {
        let api = api.clone();
        Box::pin(async move {
            let count = api.order_count().await.map_err(QueryError::from)?;
            encode(&count)
        })
    })
}

pub fn appointments_fetcher(api: &ApiClient) -> QueryFetcher {
    let api = api.clone();
    Arc::new(move || {
        let api = api.clone();
        Box::pin(async move {
            let appointments = api.list_appointments().await.map_err(QueryError::from)?;
            encode(&appointments)
        })
    })
}

pub fn customers_fetcher(api: &ApiClient) -> QueryFetcher {
    let api = api.clone();
    Arc::new(move || {
        let api = api.clone();
        Box::pin(async move {
            let customers = api.list_customers().await.map_err(QueryError::from)?;
            encode(&customers)
        })
    })
}

pub fn vehicles_fetcher(api: &ApiClient) -> QueryFetcher {
    let api = api.clone();
    Arc::new(move || {
        let api = api.clone();
        Box::pin(async move {
            let vehicles = api.list_vehicles().await.map_err(QueryError::from)?;
            encode(&vehicles)
        })
    })
}

pub fn users_fetcher(api: &ApiClient) -> QueryFetcher {
    let api = api.clone();
    Arc::new(move || {
        let api = api.clone();
        Box::pin(async move {
            let users = api.list_users().await.map_err(QueryError::from)?;
            encode(&users)
        })
    })
}

pub fn profile_fetcher(api: &ApiClient) -> QueryFetcher {
    let api = api.clone();
    Arc::new(move || {
        let api = api.clone();
        Box::pin(async move {
            let profile = api.profile().await.map_err(QueryError::from)?;
            encode(&profile)
        })
    })
}

/// The high-value queries warmed right after sign-in so first navigation
/// lands on a warm cache: the order board and the staff roster.
pub fn login_prefetches(api: &ApiClient) -> Vec<PrefetchQuery> {
    vec![
        PrefetchQuery {
            key: orders_key(),
            fetcher: orders_fetcher(api),
        },
        PrefetchQuery {
            key: users_key(),
            fetcher: users_fetcher(api),
        },
    ]
}

// ===== Mutations =====

/// Move a work order to a new status, then invalidate every orders query
/// (the board and the count). Validation and conflict failures surface to
/// the caller and leave the cache untouched.
pub async fn update_order_status(
    client: &QueryClient,
    api: &ApiClient,
    order_id: i64,
    status: OrderStatus,
) -> Result<Order, ApiError> {
    let order = api.update_order_status(order_id, status).await?;
    let marked = client.invalidate(&orders_key());
    debug!(order_id, status = %order.status, marked, "order updated, orders queries invalidated");
    Ok(order)
}

/// Book an appointment, then invalidate the calendar queries
pub async fn create_appointment(
    client: &QueryClient,
    api: &ApiClient,
    draft: &AppointmentDraft,
) -> Result<Appointment, ApiError> {
    let appointment = api.create_appointment(draft).await?;
    let marked = client.invalidate(&appointments_key());
    debug!(
        appointment_id = appointment.id,
        marked, "appointment booked, calendar invalidated"
    );
    Ok(appointment)
}

/// Cancel an appointment, then invalidate the calendar queries
pub async fn cancel_appointment(
    client: &QueryClient,
    api: &ApiClient,
    appointment_id: i64,
) -> Result<Appointment, ApiError> {
    let appointment = api.cancel_appointment(appointment_id).await?;
    let marked = client.invalidate(&appointments_key());
    debug!(appointment_id, marked, "appointment cancelled, calendar invalidated");
    Ok(appointment)
}
