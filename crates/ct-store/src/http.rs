//! Read-only store over an HTTP tile server. The monitor uses this when
//! pointed at a public tile prefix rather than the bucket itself.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::{Storage, StorageError};

pub struct HttpStore {
    client: reqwest::Client,
    /// Must end with a trailing slash.
    url_prefix: String,
}

impl HttpStore {
    pub fn new(url_prefix: impl Into<String>) -> Result<Self, StorageError> {
        let url_prefix = url_prefix.into();
        if !url_prefix.ends_with('/') {
            return Err(StorageError::Backend(
                "store url must end with a trailing slash".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { client, url_prefix })
    }
}

#[async_trait]
impl Storage for HttpStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let url = format!("{}{}", self.url_prefix, key);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        match resp.status() {
            StatusCode::OK => Ok(resp
                .bytes()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?
                .to_vec()),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
            status => Err(StorageError::Backend(format!("{url}: {status}"))),
        }
    }

    async fn set(&self, key: &str, _data: Vec<u8>) -> Result<(), StorageError> {
        Err(StorageError::Backend(format!(
            "http store is read-only (set {key})"
        )))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let url = format!("{}{}", self.url_prefix, key);
        let resp = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StorageError::Backend(format!("{url}: {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn get_maps_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ct/v1/get-sth"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"sth".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tile/8/data/001"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = HttpStore::new(format!("{}/", server.uri())).unwrap();
        assert_eq!(store.get("ct/v1/get-sth").await.unwrap(), b"sth");
        assert!(store.get("tile/8/data/001").await.unwrap_err().is_not_found());
    }

    #[test]
    fn trailing_slash_is_required() {
        assert!(HttpStore::new("http://example.com/tiles").is_err());
    }
}
