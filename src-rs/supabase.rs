use anyhow::{anyhow, Context};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Serialize};

/// Thin client over the Supabase REST (PostgREST) and Storage APIs,
/// authenticated with the service-role key.
#[derive(Clone)]
pub struct SupabaseClient {
    base_url: String,
    http: reqwest::Client,
    configured: bool,
}

impl SupabaseClient {
    pub fn new(base_url: String, service_role_key: Option<&str>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = service_role_key {
            headers.insert(
                "apikey",
                HeaderValue::from_str(key).context("invalid SUPABASE_SERVICE_ROLE_KEY for header")?,
            );
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key))
                    .context("invalid SUPABASE_SERVICE_ROLE_KEY for header")?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to create Supabase HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            configured: service_role_key.is_some(),
        })
    }

    /// `SELECT` with `column=eq.value` filters.
    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, &str)],
        order: Option<&str>,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<T>> {
        let mut query = eq_filters(filters);
        query.push(("select".to_string(), "*".to_string()));
        if let Some(order) = order {
            query.push(("order".to_string(), order.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit".to_string(), limit.to_string()));
        }

        let response = self
            .http
            .get(self.rest_url(table))
            .query(&query)
            .send()
            .await
            .with_context(|| format!("Supabase select failed for {} (base_url={})", table, self.base_url))?;

        parse_rows(response, "select", table).await
    }

    /// `INSERT ... ON CONFLICT (on_conflict) DO UPDATE` for the columns present in `rows`.
    pub async fn upsert<R: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        on_conflict: &str,
        rows: &[R],
    ) -> anyhow::Result<Vec<T>> {
        self.require_credentials()?;
        let response = self
            .http
            .post(self.rest_url(table))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(rows)
            .send()
            .await
            .with_context(|| format!("Supabase upsert failed for {}", table))?;

        parse_rows(response, "upsert", table).await
    }

    /// `UPDATE ... WHERE column = value`, returning the rows that matched.
    pub async fn update<P: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, &str)],
        patch: &P,
    ) -> anyhow::Result<Vec<T>> {
        self.require_credentials()?;
        let response = self
            .http
            .patch(self.rest_url(table))
            .query(&eq_filters(filters))
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await
            .with_context(|| format!("Supabase update failed for {}", table))?;

        parse_rows(response, "update", table).await
    }

    /// Uploads (or overwrites) an object and returns its public URL.
    pub async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        body: Bytes,
    ) -> anyhow::Result<String> {
        self.require_credentials()?;
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path);
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Supabase storage upload failed for {}/{}", bucket, path))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Supabase storage upload {}/{} failed with status {}: {}",
                bucket,
                path,
                status,
                text
            ));
        }

        Ok(self.public_object_url(bucket, path))
    }

    pub fn public_object_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, bucket, path
        )
    }

    /// Cheap reachability probe used by the health endpoint.
    pub async fn ping(&self) -> anyhow::Result<()> {
        let response = self
            .http
            .get(format!("{}/rest/v1/", self.base_url))
            .send()
            .await
            .with_context(|| format!("Supabase unreachable at {}", self.base_url))?;

        if response.status().is_server_error() {
            return Err(anyhow!(
                "Supabase health probe failed with status {}",
                response.status()
            ));
        }
        Ok(())
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn require_credentials(&self) -> anyhow::Result<()> {
        if self.configured {
            Ok(())
        } else {
            Err(anyhow!("SUPABASE_SERVICE_ROLE_KEY is not configured."))
        }
    }
}

fn eq_filters(filters: &[(&str, &str)]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|(column, value)| (column.to_string(), format!("eq.{}", value)))
        .collect()
}

async fn parse_rows<T: DeserializeOwned>(
    response: reqwest::Response,
    kind: &str,
    table: &str,
) -> anyhow::Result<Vec<T>> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read Supabase {} response for {}", kind, table))?;

    if !status.is_success() {
        return Err(anyhow!(
            "Supabase {} on {} failed with status {}: {}",
            kind,
            table,
            status,
            text
        ));
    }

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(&text)
        .with_context(|| format!("failed to decode Supabase {} rows for {}", kind, table))
}
