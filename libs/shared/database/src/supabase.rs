use anyhow::Result;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Non-success response from PostgREST. Travels inside `anyhow::Error`;
/// callers that care about the status recover it with `downcast_ref`.
#[derive(Debug, Error)]
#[error("API error ({status}): {body}")]
pub struct SupabaseError {
    pub status: u16,
    pub body: String,
}

impl SupabaseError {
    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>, return_rows: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }

        if return_rows {
            headers.insert("Prefer", HeaderValue::from_static("return=representation"));
        }

        Ok(headers)
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.send(method, path, auth_token, body, false).await
    }

    /// Writes with `Prefer: return=representation`. PostgREST answers with the
    /// affected rows, so an empty array means the filter matched nothing.
    pub async fn request_returning<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.send(method, path, auth_token, body, true).await
    }

    async fn send<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
        return_rows: bool,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let headers = self.get_headers(auth_token, return_rows)?;

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            return Err(SupabaseError {
                status: status.as_u16(),
                body: error_text,
            }
            .into());
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }
}
