//! API client for the ShopSync backend REST API.
//!
//! This module provides the `ApiClient` struct for making authenticated
//! requests to fetch order, appointment, customer, vehicle, and staff data,
//! and for the handful of mutations the client performs.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{AuthBackend, Credentials, SessionData};
use crate::cache::QueryError;
use crate::models::{
    Appointment, CountResponse, Customer, Order, OrderStatus, Profile, StaffUser, Vehicle,
};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
    user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    #[serde(rename = "userId")]
    user_id: i64,
    username: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

/// API client for the ShopSync backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection
/// pooling, and clones share the bearer token slot.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Arc<Mutex<Option<String>>>,
}

impl ApiClient {
    /// Create a new API client against the given backend base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a client with an explicit request timeout (from configuration)
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Arc::new(Mutex::new(None)),
        })
    }

    /// Set the bearer token for authenticated requests. Shared across clones.
    pub fn set_token(&self, token: String) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    pub fn clear_token(&self) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn has_token(&self) -> bool {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        let token = self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::InvalidResponse("token not header-safe".into()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit
    /// (should retry), or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            // Rate limited - signal to retry
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .headers(self.auth_headers()?);
            if let Some(ref body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let text = response.text().await?;
                    return serde_json::from_str(&text).map_err(|error| {
                        ApiError::InvalidResponse(format!(
                            "Failed to parse response from {}: {}",
                            url, error
                        ))
                    });
                }
                None => {
                    // Rate limited
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(
                        url = %url,
                        retry = retries,
                        backoff_ms = backoff_ms,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::GET, path, None).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|error| ApiError::InvalidResponse(format!("unencodable body: {}", error)))?;
        self.request(Method::POST, path, Some(body)).await
    }

    async fn patch<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|error| ApiError::InvalidResponse(format!("unencodable body: {}", error)))?;
        self.request(Method::PATCH, path, Some(body)).await
    }

    // ===== Session Endpoints =====

    /// Exchange credentials for a session, storing the bearer token on success
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionData, ApiError> {
        let body = serde_json::json!({
            "username": username,
            "password": password,
        });
        let auth: AuthResponse = self.post("/auth/login", &body).await?;
        self.set_token(auth.token.clone());
        debug!(username = %auth.user.username, "authenticated");
        Ok(SessionData {
            token: auth.token,
            user_id: auth.user.user_id,
            username: auth.user.username,
            display_name: auth.user.display_name,
            created_at: Utc::now(),
        })
    }

    /// Revalidate a persisted session token against the backend.
    /// The profile fields come back refreshed; the token and creation
    /// timestamp are kept so expiry math stays anchored to the original
    /// sign-in.
    pub async fn validate_session(&self, session: SessionData) -> Result<SessionData, ApiError> {
        self.set_token(session.token.clone());
        let profile: Profile = match self.get("/auth/session").await {
            Ok(profile) => profile,
            Err(error) => {
                self.clear_token();
                return Err(error);
            }
        };
        Ok(SessionData {
            token: session.token,
            user_id: profile.user_id,
            username: profile.username,
            display_name: profile.display_name,
            created_at: session.created_at,
        })
    }

    /// End the session server-side and drop the local token
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result: Result<serde_json::Value, ApiError> =
            self.post("/auth/logout", &serde_json::json!({})).await;
        self.clear_token();
        result.map(|_| ())
    }

    // ===== Data Fetching Methods =====

    /// Fetch all work orders for the shop
    pub async fn list_orders(&self) -> Result<Vec<Order>, ApiError> {
        self.get("/orders").await
    }

    /// Fetch the open work order count (cheap polling endpoint)
    pub async fn order_count(&self) -> Result<CountResponse, ApiError> {
        self.get("/orders/count").await
    }

    /// Fetch all appointments on the shop calendar
    pub async fn list_appointments(&self) -> Result<Vec<Appointment>, ApiError> {
        self.get("/appointments").await
    }

    /// Fetch the customer directory
    pub async fn list_customers(&self) -> Result<Vec<Customer>, ApiError> {
        self.get("/customers").await
    }

    /// Fetch all vehicles on file
    pub async fn list_vehicles(&self) -> Result<Vec<Vehicle>, ApiError> {
        self.get("/vehicles").await
    }

    /// Fetch the staff roster
    pub async fn list_users(&self) -> Result<Vec<StaffUser>, ApiError> {
        self.get("/users").await
    }

    /// Fetch the signed-in user's profile
    pub async fn profile(&self) -> Result<Profile, ApiError> {
        self.get("/auth/session").await
    }

    // ===== Mutations =====

    /// Move a work order to a new status, returning the updated record
    pub async fn update_order_status(
        &self,
        order_id: i64,
        status: OrderStatus,
    ) -> Result<Order, ApiError> {
        let body = serde_json::json!({ "status": status });
        self.patch(&format!("/orders/{}", order_id), &body).await
    }

    /// Book a new appointment, returning the created record
    pub async fn create_appointment(
        &self,
        draft: &AppointmentDraft,
    ) -> Result<Appointment, ApiError> {
        self.post("/appointments", draft).await
    }

    /// Cancel an appointment, returning it with status Cancelled
    pub async fn cancel_appointment(&self, appointment_id: i64) -> Result<Appointment, ApiError> {
        self.post(
            &format!("/appointments/{}/cancel", appointment_id),
            &serde_json::json!({}),
        )
        .await
    }
}

/// Payload for booking an appointment
#[derive(Debug, Clone, Serialize)]
pub struct AppointmentDraft {
    #[serde(rename = "customerId")]
    pub customer_id: i64,
    #[serde(rename = "vehicleId")]
    pub vehicle_id: i64,
    #[serde(rename = "scheduledAt")]
    pub scheduled_at: chrono::DateTime<Utc>,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ============================================================================
// Session service contract
// ============================================================================

impl AuthBackend for ApiClient {
    fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> BoxFuture<'static, Result<SessionData, QueryError>> {
        let api = self.clone();
        let credentials = credentials.clone();
        Box::pin(async move {
            api.login(&credentials.username, &credentials.password)
                .await
                .map_err(QueryError::from)
        })
    }

    fn resume(&self, session: SessionData) -> BoxFuture<'static, Result<SessionData, QueryError>> {
        let api = self.clone();
        Box::pin(async move { api.validate_session(session).await.map_err(QueryError::from) })
    }

    fn end_session(&self) -> BoxFuture<'static, Result<(), QueryError>> {
        let api = self.clone();
        Box::pin(async move { api.logout().await.map_err(QueryError::from) })
    }
}
