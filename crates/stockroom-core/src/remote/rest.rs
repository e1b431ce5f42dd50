//! PostgREST-style HTTP remote store.

use chrono::SecondsFormat;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::{ConflictSignal, RemoteError, RemoteResult, RemoteStore};
use crate::config::RemoteConfig;
use crate::models::{Row, WriteGuard};
use crate::util::compact_text;

const REST_PREFIX: &str = "/rest/v1";

/// Remote store speaking the PostgREST dialect (`eq.` filters, `Prefer`
/// headers, JSON array bodies).
#[derive(Clone)]
pub struct RestRemoteStore {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl RestRemoteStore {
    pub fn new(config: &RemoteConfig) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|error| RemoteError::Transient(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}{REST_PREFIX}/{table}", self.base_url)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn rows(response: Response) -> RemoteResult<Vec<Row>> {
        let response = check_status(response).await?;
        let values = response.json::<Vec<Value>>().await?;
        values
            .into_iter()
            .map(|value| match value {
                Value::Object(row) => Ok(row),
                other => Err(RemoteError::InvalidResponse(format!(
                    "expected row object, got {other}"
                ))),
            })
            .collect()
    }

    async fn single_row(response: Response, signal: ConflictSignal) -> RemoteResult<Row> {
        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or(RemoteError::Conflict(signal))
    }
}

impl RemoteStore for RestRemoteStore {
    async fn ping(&self) -> RemoteResult<()> {
        let url = format!("{}{REST_PREFIX}/", self.base_url);
        let response = self.request(Method::GET, &url).send().await?;
        // Any answer short of a server error proves reachability.
        if response.status().is_server_error() {
            return Err(RemoteError::Transient(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    async fn select_all(&self, table: &str) -> RemoteResult<Vec<Row>> {
        let url = format!("{}?select=*&order=created_at.asc", self.table_url(table));
        let response = self.request(Method::GET, &url).send().await?;
        Self::rows(response).await
    }

    async fn select_by_id(&self, table: &str, id: &str) -> RemoteResult<Option<Row>> {
        let url = format!("{}?select=*&{}", self.table_url(table), row_filter(id, &WriteGuard::Unguarded));
        let response = self.request(Method::GET, &url).send().await?;
        Ok(Self::rows(response).await?.into_iter().next())
    }

    async fn insert(&self, table: &str, row: &Row) -> RemoteResult<Row> {
        let response = self
            .request(Method::POST, &self.table_url(table))
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?;
        Self::single_row(response, ConflictSignal::DuplicateKey).await
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: &Row,
        guard: &WriteGuard,
    ) -> RemoteResult<Row> {
        let url = format!("{}?{}", self.table_url(table), row_filter(id, guard));
        let response = self
            .request(Method::PATCH, &url)
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await?;
        Self::single_row(response, missing_row_signal(guard)).await
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        guard: &WriteGuard,
    ) -> RemoteResult<()> {
        let url = format!("{}?{}", self.table_url(table), row_filter(id, guard));
        let response = self
            .request(Method::DELETE, &url)
            .header("Prefer", "return=representation")
            .send()
            .await?;
        Self::single_row(response, missing_row_signal(guard))
            .await
            .map(|_| ())
    }

    async fn upsert(&self, table: &str, row: &Row) -> RemoteResult<Row> {
        let url = format!("{}?on_conflict=id", self.table_url(table));
        let response = self
            .request(Method::POST, &url)
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(row)
            .send()
            .await?;
        Self::single_row(response, ConflictSignal::NoMatchingRow).await
    }
}

/// An empty representation cannot tell "gone" from "changed"; with a guard
/// present the stale predicate is the more informative signal.
const fn missing_row_signal(guard: &WriteGuard) -> ConflictSignal {
    if guard.is_guarded() {
        ConflictSignal::StalePredicate
    } else {
        ConflictSignal::NoMatchingRow
    }
}

fn row_filter(id: &str, guard: &WriteGuard) -> String {
    let mut filter = format!("id=eq.{}", urlencoding::encode(id));
    match guard {
        WriteGuard::Unguarded => {}
        WriteGuard::UpdatedAt(updated_at) => {
            let stamp = updated_at.to_rfc3339_opts(SecondsFormat::Micros, true);
            filter.push_str("&updated_at=eq.");
            filter.push_str(&urlencoding::encode(&stamp));
        }
        WriteGuard::Fields(values) => {
            for (field, value) in values {
                filter.push('&');
                filter.push_str(&urlencoding::encode(field));
                filter.push('=');
                filter.push_str(&field_predicate(value));
            }
        }
    }
    filter
}

/// `null` and booleans need `is.`; everything else compares with `eq.`.
fn field_predicate(value: &Value) -> String {
    match value {
        Value::Null => "is.null".to_string(),
        Value::Bool(flag) => format!("is.{flag}"),
        Value::String(text) => format!("eq.{}", urlencoding::encode(text)),
        other => format!("eq.{}", urlencoding::encode(&other.to_string())),
    }
}

async fn check_status(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::CONFLICT => RemoteError::Conflict(ConflictSignal::DuplicateKey),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(format!("HTTP {}", status.as_u16()))
        }
        status if status.is_server_error() => {
            RemoteError::Transient(format!("HTTP {}: {}", status.as_u16(), compact_text(body)))
        }
        status => RemoteError::Rejected {
            status: status.as_u16(),
            message: parse_api_error(body),
        },
    }
}

#[derive(Debug, Deserialize)]
struct RestErrorBody {
    message: Option<String>,
    error: Option<String>,
    details: Option<String>,
}

fn parse_api_error(body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<RestErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return match payload.details {
                Some(details) if !details.trim().is_empty() => {
                    format!("{} ({})", message.trim(), compact_text(&details))
                }
                _ => message.trim().to_string(),
            };
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        "empty error response".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn row_filter_encodes_id_and_guard() {
        assert_eq!(
            row_filter("meter 1", &WriteGuard::Unguarded),
            "id=eq.meter%201"
        );

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            row_filter("meter-1", &WriteGuard::UpdatedAt(at)),
            "id=eq.meter-1&updated_at=eq.2024-03-01T12%3A00%3A00.000000Z"
        );
    }

    #[test]
    fn row_filter_guards_on_prior_field_values() {
        let values = json!({"email": null, "name": "Ada Lovelace", "phone": "555-0000", "visits": 3})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(
            row_filter("customer-7", &WriteGuard::Fields(values)),
            "id=eq.customer-7&email=is.null&name=eq.Ada%20Lovelace&phone=eq.555-0000&visits=eq.3"
        );
    }

    #[test]
    fn classify_status_separates_conflict_transient_and_rejection() {
        assert_eq!(
            classify_status(StatusCode::CONFLICT, ""),
            RemoteError::Conflict(ConflictSignal::DuplicateKey)
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY, "upstream").is_transient());
        assert_eq!(
            classify_status(
                StatusCode::BAD_REQUEST,
                r#"{"message": "invalid input syntax", "details": "price"}"#
            ),
            RemoteError::Rejected {
                status: 400,
                message: "invalid input syntax (price)".to_string(),
            }
        );
    }

    #[test]
    fn missing_row_signal_prefers_stale_predicate_with_guard() {
        assert_eq!(
            missing_row_signal(&WriteGuard::Unguarded),
            ConflictSignal::NoMatchingRow
        );
        assert_eq!(
            missing_row_signal(&WriteGuard::UpdatedAt(Utc::now())),
            ConflictSignal::StalePredicate
        );
    }

    #[test]
    fn new_normalizes_base_url() {
        let config = RemoteConfig::new("https://project.example.co/", "anon").unwrap();
        let store = RestRemoteStore::new(&config).unwrap();
        assert_eq!(
            store.table_url("meters"),
            "https://project.example.co/rest/v1/meters"
        );
    }
}
