//! S3-compatible backend: path-style requests with static credentials and
//! a self-contained SigV4 signer. Works against AWS S3 and the usual
//! compatible object stores (MinIO, R2, Garage).

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::{Storage, StorageError};

type HmacSha256 = Hmac<Sha256>;

const AMZ_DATE: &[FormatItem<'_>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");
const DATE_STAMP: &[FormatItem<'_>] = format_description!("[year][month][day]");

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Endpoint origin, e.g. `https://s3.eu-central-1.amazonaws.com`.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

pub struct S3Store {
    client: reqwest::Client,
    config: S3Config,
}

impl S3Store {
    pub fn new(config: S3Config) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn object_path(&self, key: &str) -> String {
        // Path-style addressing; keys are slash-separated safe segments.
        format!("/{}/{}", self.config.bucket, key)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        key: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, StorageError> {
        let path = self.object_path(key);
        let url = format!("{}{}", self.config.endpoint.trim_end_matches('/'), path);
        let now = OffsetDateTime::now_utc();
        let headers = self.sign(&method, &path, &body, now)?;

        let mut req = self.client.request(method, &url).body(body);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        req.send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    /// AWS Signature Version 4 over an empty query, signing `host`,
    /// `x-amz-content-sha256`, and `x-amz-date`.
    fn sign(
        &self,
        method: &reqwest::Method,
        path: &str,
        body: &[u8],
        now: OffsetDateTime,
    ) -> Result<Vec<(String, String)>, StorageError> {
        let amz_date = now
            .format(AMZ_DATE)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let date_stamp = now
            .format(DATE_STAMP)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let host = self
            .config
            .endpoint
            .trim_end_matches('/')
            .split("://")
            .nth(1)
            .ok_or_else(|| StorageError::Backend("invalid s3 endpoint url".to_string()))?
            .to_string();
        let payload_hash = hex::encode(Sha256::digest(body));

        let canonical_headers = format!(
            "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            path,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{date_stamp}/{}/s3/aws4_request", self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let mut key = hmac(
            format!("AWS4{}", self.config.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        key = hmac(&key, self.config.region.as_bytes());
        key = hmac(&key, b"s3");
        key = hmac(&key, b"aws4_request");
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.config.access_key
        );

        Ok(vec![
            ("x-amz-date".to_string(), amz_date),
            ("x-amz-content-sha256".to_string(), payload_hash),
            ("authorization".to_string(), authorization),
        ])
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[async_trait]
impl Storage for S3Store {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let resp = self.request(reqwest::Method::GET, key, Vec::new()).await?;
        match resp.status() {
            StatusCode::OK => Ok(resp
                .bytes()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?
                .to_vec()),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
            status => Err(StorageError::Backend(format!("get {key}: {status}"))),
        }
    }

    async fn set(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let resp = self.request(reqwest::Method::PUT, key, data).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(StorageError::Backend(format!("put {key}: {}", resp.status())))
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let resp = self.request(reqwest::Method::HEAD, key, Vec::new()).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(StorageError::Backend(format!("head {key}: {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: String) -> S3Config {
        S3Config {
            bucket: "log-tiles".to_string(),
            region: "eu-central-1".to_string(),
            endpoint,
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "secret".to_string(),
        }
    }

    #[test]
    fn signature_is_deterministic() {
        let store = S3Store::new(config("https://s3.example.com".to_string())).unwrap();
        let t = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let a = store
            .sign(&reqwest::Method::GET, "/log-tiles/checkpoint", b"", t)
            .unwrap();
        let b = store
            .sign(&reqwest::Method::GET, "/log-tiles/checkpoint", b"", t)
            .unwrap();
        assert_eq!(a, b);
        let auth = &a[2].1;
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20231114/"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    }

    #[tokio::test]
    async fn requests_carry_sigv4_headers() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/log-tiles/tile/8/data/000"))
            .and(header_exists("authorization"))
            .and(header_exists("x-amz-date"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/log-tiles/issuer/ab"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = S3Store::new(config(server.uri())).unwrap();
        store.set("tile/8/data/000", vec![0; 32]).await.unwrap();
        assert!(!store.exists("issuer/ab").await.unwrap());
    }
}
