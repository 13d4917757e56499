//! A Google Cloud Storage [`Backend`] (§6.1), authenticating as a service
//! account via a signed JWT bearer assertion (the standard two-legged OAuth
//! flow; no full-blown `google-cloud-storage` SDK dependency needed, same
//! spirit as [`super::s3`]'s presigned-request approach).
//!
//! The service account key is read from the file named by
//! `GOOGLE_APPLICATION_CREDENTIALS`, matching every other GCS client's
//! convention.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::*;

use super::Kind;
use crate::error::{Error, Result};

const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const API_ROOT: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_ROOT: &str = "https://storage.googleapis.com/upload/storage/v1";

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Serialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    exp: u64,
    iat: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: SystemTime,
}

struct TokenSource {
    key: ServiceAccountKey,
    agent: ureq::Agent,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    fn new(key: ServiceAccountKey, agent: ureq::Agent) -> Self {
        Self {
            key,
            agent,
            cached: Mutex::new(None),
        }
    }

    fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().unwrap();
        if let Some(t) = cached.as_ref() {
            if t.expires_at > SystemTime::now() + Duration::from_secs(60) {
                return Ok(t.value.clone());
            }
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = Claims {
            iss: self.key.client_email.clone(),
            scope: STORAGE_SCOPE.to_string(),
            aud: self.key.token_uri.clone(),
            exp: now + 3600,
            iat: now,
        };
        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| Error::invalid("gcs service account key", e))?;
        let jwt = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|e| Error::invalid("gcs jwt assertion", e))?;

        let resp: TokenResponse = self
            .agent
            .post(&self.key.token_uri)
            .send_form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .map_err(|e| Error::transport(format!("fetching GCS access token: {e}")))?
            .into_json()
            .map_err(|e| Error::transport(format!("parsing GCS token response: {e}")))?;

        let token = resp.access_token.clone();
        *cached = Some(CachedToken {
            value: resp.access_token,
            expires_at: SystemTime::now() + Duration::from_secs(resp.expires_in),
        });
        Ok(token)
    }
}

pub struct GcsBackend {
    bucket: String,
    prefix: String,
    agent: ureq::Agent,
    tokens: TokenSource,
    location: String,
}

fn object_name(prefix: &str, kind: Kind, name: &str) -> String {
    let suffix = if kind.namespace().is_empty() {
        name.to_string()
    } else {
        format!("{}/{name}", kind.namespace())
    };
    if prefix.is_empty() {
        suffix
    } else {
        format!("{prefix}/{suffix}")
    }
}

fn map_ureq(e: ureq::Error, what: &str) -> Error {
    match e {
        ureq::Error::Status(404, _) => Error::NotFound(what.to_string()),
        ureq::Error::Status(412, _) | ureq::Error::Status(409, _) => {
            Error::AlreadyExists(what.to_string())
        }
        ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => {
            Error::transport(format!("{what}: GCS rejected our credentials"))
        }
        ureq::Error::Status(code, resp) => {
            Error::transport(format!("{what}: HTTP {code} ({})", resp.status_text()))
        }
        ureq::Error::Transport(t) => Error::transport(t),
    }
}

impl GcsBackend {
    /// Parses `<bucket>[/<prefix>]`, the body of a `gs://`/`gs:` URL.
    pub fn new(rest: &str) -> Result<Self> {
        let (bucket, prefix) = match rest.split_once('/') {
            Some((b, p)) => (b.to_string(), p.trim_end_matches('/').to_string()),
            None => (rest.to_string(), String::new()),
        };

        let key_path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS").map_err(|_| {
            Error::invalid(
                "gcs credentials",
                "GOOGLE_APPLICATION_CREDENTIALS is not set",
            )
        })?;
        let key_bytes = std::fs::read(&key_path)?;
        let key: ServiceAccountKey = serde_json::from_slice(&key_bytes)?;

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(60))
            .build();

        Ok(Self {
            bucket,
            prefix,
            tokens: TokenSource::new(key, agent.clone()),
            agent,
            location: format!("gs://{rest}"),
        })
    }

    fn auth(&self, req: ureq::Request) -> Result<ureq::Request> {
        let token = self.tokens.access_token()?;
        Ok(req.set("Authorization", &format!("Bearer {token}")))
    }
}

impl super::Backend for GcsBackend {
    fn create(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()> {
        let object = object_name(&self.prefix, kind, name);
        let url = format!(
            "{UPLOAD_ROOT}/b/{}/o?uploadType=media&name={}&ifGenerationMatch=0",
            self.bucket,
            urlencoding_encode(&object)
        );
        let req = self.auth(self.agent.post(&url))?;
        req.send_bytes(bytes).map_err(|e| map_ureq(e, &object))?;
        Ok(())
    }

    fn load(&self, kind: Kind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let object = object_name(&self.prefix, kind, name);
        let url = format!(
            "{API_ROOT}/b/{}/o/{}?alt=media",
            self.bucket,
            urlencoding_encode(&object)
        );
        let mut req = self.auth(self.agent.get(&url))?;
        if offset > 0 || length > 0 {
            let range = if length > 0 {
                format!("bytes={offset}-{}", offset + length - 1)
            } else {
                format!("bytes={offset}-")
            };
            req = req.set("Range", &range);
        }
        let resp = req.call().map_err(|e| map_ureq(e, &object))?;
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut resp.into_reader(), &mut buf)?;
        Ok(buf)
    }

    fn stat(&self, kind: Kind, name: &str) -> Result<u64> {
        let object = object_name(&self.prefix, kind, name);
        let url = format!(
            "{API_ROOT}/b/{}/o/{}",
            self.bucket,
            urlencoding_encode(&object)
        );
        let req = self.auth(self.agent.get(&url))?;
        let resp = req.call().map_err(|e| map_ureq(e, &object))?;

        #[derive(Deserialize)]
        struct Meta {
            size: String,
        }
        let meta: Meta = resp
            .into_json()
            .map_err(|e| Error::transport(format!("parsing GCS object metadata: {e}")))?;
        meta.size
            .parse()
            .map_err(|e| Error::transport(format!("GCS size field: {e}")))
    }

    fn test(&self, kind: Kind, name: &str) -> Result<bool> {
        match self.stat(kind, name) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn remove(&self, kind: Kind, name: &str) -> Result<()> {
        let object = object_name(&self.prefix, kind, name);
        let url = format!(
            "{API_ROOT}/b/{}/o/{}",
            self.bucket,
            urlencoding_encode(&object)
        );
        let req = self.auth(self.agent.delete(&url))?;
        req.call().map_err(|e| map_ureq(e, &object))?;
        Ok(())
    }

    fn list(&self, kind: Kind) -> Result<Vec<String>> {
        let list_prefix = object_name(&self.prefix, kind, "");

        #[derive(Deserialize)]
        struct Item {
            name: String,
        }
        #[derive(Deserialize)]
        struct ListResponse {
            #[serde(default)]
            items: Vec<Item>,
            #[serde(rename = "nextPageToken")]
            next_page_token: Option<String>,
        }

        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{API_ROOT}/b/{}/o?prefix={}",
                self.bucket,
                urlencoding_encode(&list_prefix)
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding_encode(token)));
            }
            let req = self.auth(self.agent.get(&url))?;
            let resp: ListResponse = req
                .call()
                .map_err(|e| map_ureq(e, &list_prefix))?
                .into_json()
                .map_err(|e| Error::transport(format!("parsing GCS list response: {e}")))?;

            for item in resp.items {
                if let Some(name) = item.name.rsplit('/').next() {
                    names.push(name.to_string());
                }
            }
            match resp.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        names.sort();
        Ok(names)
    }

    fn delete(&self) -> Result<()> {
        warn!("Deleting every object under {}", self.location());
        for kind in [
            Kind::Config,
            Kind::Key,
            Kind::Pack,
            Kind::Index,
            Kind::Snapshot,
            Kind::Lock,
        ] {
            for name in self.list(kind)? {
                self.remove(kind, &name)?;
            }
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.location.clone()
    }
}

/// Percent-encodes a GCS object name for use in a URL path segment. GCS
/// object names may contain `/`, which must itself be escaped (`%2F`) when
/// embedded as a path segment rather than treated as a directory separator.
fn urlencoding_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
