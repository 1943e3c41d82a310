use log::debug;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::document::Document;
use crate::error::{Result, SyncError};

/// Durable per-user document collection. Failures surface as
/// `RemoteReadFailed` or `RemoteWriteFailed`.
pub trait DocumentStore {
    fn get(&self, id: &str) -> Result<Option<Document>>;

    /// Replace the whole document.
    fn set(&self, id: &str, doc: &Document) -> Result<()>;

    /// Merge `fields` into the document, creating it when absent. Fields not
    /// named are left as they are.
    fn update(&self, id: &str, fields: &Document) -> Result<()>;

    /// Documents whose top-level `field` equals `value`.
    fn find_by(&self, field: &str, value: &str) -> Result<Vec<(String, Document)>>;
}

#[derive(Debug, Deserialize)]
struct FoundDocument {
    id: String,
    data: Document,
}

/// REST binding: `GET`/`PUT`/`PATCH {base}/{collection}/{id}` and
/// `GET {base}/{collection}?field=value`.
pub struct HttpDocumentStore {
    client: Client,
    collection_url: Url,
    token: Option<String>,
}

impl HttpDocumentStore {
    pub fn new(base_url: &str, collection: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let mut base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            anyhow::bail!("'{}' cannot be used as a document store base url", base_url);
        }
        // Url::join drops the last segment unless the base ends with '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let collection_url = base.join(&format!("{}/", collection))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            collection_url,
            token,
        })
    }

    pub fn collection_url(&self) -> &Url {
        &self.collection_url
    }

    pub fn document_url(&self, id: &str) -> Url {
        let mut url = self.collection_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(id);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn send_write(&self, request: RequestBuilder, id: &str) -> Result<()> {
        let response = self
            .authorized(request)
            .send()
            .map_err(|e| SyncError::RemoteWriteFailed(format!("{}: {}", id, e)))?;
        check_status(response, SyncError::RemoteWriteFailed).map(|_| ())
    }
}

fn check_status(response: Response, kind: fn(String) -> SyncError) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().unwrap_or_default();
    Err(kind(format!("status {}: {}", status, body)))
}

impl DocumentStore for HttpDocumentStore {
    fn get(&self, id: &str) -> Result<Option<Document>> {
        let url = self.document_url(id);
        debug!("GET {}", url);
        let response = self
            .authorized(self.client.get(url))
            .send()
            .map_err(|e| SyncError::RemoteReadFailed(format!("{}: {}", id, e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, SyncError::RemoteReadFailed)?;
        match response
            .json::<Value>()
            .map_err(|e| SyncError::RemoteReadFailed(format!("{}: {}", id, e)))?
        {
            Value::Object(doc) => Ok(Some(doc)),
            // Anything else exists but has no usable fields.
            _ => Ok(Some(Document::new())),
        }
    }

    fn set(&self, id: &str, doc: &Document) -> Result<()> {
        let url = self.document_url(id);
        debug!("PUT {}", url);
        self.send_write(self.client.put(url).json(doc), id)
    }

    fn update(&self, id: &str, fields: &Document) -> Result<()> {
        let url = self.document_url(id);
        debug!("PATCH {}", url);
        self.send_write(self.client.patch(url).json(fields), id)
    }

    fn find_by(&self, field: &str, value: &str) -> Result<Vec<(String, Document)>> {
        let url = self.collection_url.clone();
        debug!("GET {}?{}=…", url, field);
        let response = self
            .authorized(self.client.get(url).query(&[(field, value)]))
            .send()
            .map_err(|e| SyncError::RemoteReadFailed(e.to_string()))?;
        let found: Vec<FoundDocument> = check_status(response, SyncError::RemoteReadFailed)?
            .json()
            .map_err(|e| SyncError::RemoteReadFailed(e.to_string()))?;
        Ok(found.into_iter().map(|d| (d.id, d.data)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base: &str) -> HttpDocumentStore {
        HttpDocumentStore::new(base, "users", None, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_document_url_without_trailing_slash() {
        let url = store("https://db.example.com/v1").document_url("abc");
        assert_eq!(url.as_str(), "https://db.example.com/v1/users/abc");
    }

    #[test]
    fn test_document_url_with_trailing_slash() {
        let url = store("https://db.example.com/v1/").document_url("abc");
        assert_eq!(url.as_str(), "https://db.example.com/v1/users/abc");
    }

    #[test]
    fn test_document_url_escapes_ids() {
        let url = store("http://127.0.0.1:8787").document_url("a/b c");
        assert_eq!(url.as_str(), "http://127.0.0.1:8787/users/a%2Fb%20c");
    }

    #[test]
    fn test_collection_url() {
        let url = store("http://127.0.0.1:8787").collection_url().clone();
        assert_eq!(url.as_str(), "http://127.0.0.1:8787/users/");
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        assert!(HttpDocumentStore::new("not a url", "users", None, Duration::from_secs(1)).is_err());
    }
}
