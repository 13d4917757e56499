//! An S3-compatible [`Backend`], using presigned requests so no AWS SDK
//! (with its own async runtime) is needed (§6.1).
//!
//! Credentials and region come from the usual `AWS_ACCESS_KEY_ID` /
//! `AWS_SECRET_ACCESS_KEY` / `AWS_REGION` environment variables, matching the
//! convention every other S3 client in this ecosystem follows.

use std::io::Read;
use std::time::Duration;

use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use rusty_s3::actions::{DeleteObject, GetObject, HeadObject, ListObjectsV2, PutObject};
use tracing::*;
use url::Url;

use super::Kind;
use crate::error::{Error, Result};

/// Presigned URLs are one-shot; five minutes is ample for even a slow
/// transient-retry round trip and keeps exposure small if one leaks into a
/// log line.
const SIGNATURE_LIFETIME: Duration = Duration::from_secs(5 * 60);

pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    prefix: String,
    agent: ureq::Agent,
    location: String,
}

fn object_key(prefix: &str, kind: Kind, name: &str) -> String {
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
        ureq::Error::Status(code, resp) => {
            Error::transport(format!("{what}: HTTP {code} ({})", resp.status_text()))
        }
        ureq::Error::Transport(t) => Error::transport(t),
    }
}

impl S3Backend {
    /// Parses `<endpoint-url>/<bucket>[/<prefix>]`.
    pub fn new(rest: &str) -> Result<Self> {
        let (endpoint, bucket_and_prefix) = rest
            .split_once('/')
            .ok_or_else(|| Error::invalid("s3 location", "missing a bucket name"))?;
        let (bucket_name, prefix) = match bucket_and_prefix.split_once('/') {
            Some((b, p)) => (b, p.trim_end_matches('/').to_string()),
            None => (bucket_and_prefix, String::new()),
        };

        let endpoint_url =
            Url::parse(endpoint).map_err(|e| Error::invalid("s3 endpoint url", e))?;
        let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let bucket = Bucket::new(endpoint_url, UrlStyle::Path, bucket_name.to_string(), region)
            .map_err(|e| Error::invalid("s3 bucket", e))?;

        let key = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::invalid("s3 credentials", "AWS_ACCESS_KEY_ID is not set"))?;
        let secret = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Error::invalid("s3 credentials", "AWS_SECRET_ACCESS_KEY is not set"))?;
        let credentials = Credentials::new(key, secret);

        Ok(Self {
            bucket,
            credentials,
            prefix,
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(60))
                .build(),
            location: format!("s3:{rest}"),
        })
    }
}

impl super::Backend for S3Backend {
    fn create(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()> {
        let key = object_key(&self.prefix, kind, name);

        // S3 has no portable "create iff absent" primitive across
        // providers, so this does the best a generic client can: check,
        // then write. A racing writer can still win between the two; callers
        // that need a hard guarantee should prefer a backend (local, SFTP)
        // with a real atomic rename.
        if self.test(kind, name)? {
            return Err(Error::AlreadyExists(key));
        }

        let action = PutObject::new(&self.bucket, Some(&self.credentials), &key);
        let url = action.sign(SIGNATURE_LIFETIME);
        self.agent
            .request_url("PUT", &url)
            .send_bytes(bytes)
            .map_err(|e| map_ureq(e, &key))?;
        Ok(())
    }

    fn load(&self, kind: Kind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let key = object_key(&self.prefix, kind, name);
        let action = GetObject::new(&self.bucket, Some(&self.credentials), &key);
        let url = action.sign(SIGNATURE_LIFETIME);

        let mut req = self.agent.request_url("GET", &url);
        if offset > 0 || length > 0 {
            let range = if length > 0 {
                format!("bytes={offset}-{}", offset + length - 1)
            } else {
                format!("bytes={offset}-")
            };
            req = req.set("Range", &range);
        }

        let resp = req.call().map_err(|e| map_ureq(e, &key))?;
        let mut buf = Vec::new();
        resp.into_reader().read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn stat(&self, kind: Kind, name: &str) -> Result<u64> {
        let key = object_key(&self.prefix, kind, name);
        let action = HeadObject::new(&self.bucket, Some(&self.credentials), &key);
        let url = action.sign(SIGNATURE_LIFETIME);
        let resp = self
            .agent
            .request_url("HEAD", &url)
            .call()
            .map_err(|e| map_ureq(e, &key))?;
        resp.header("Content-Length")
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| Error::transport(format!("{key} has no Content-Length header")))
    }

    fn test(&self, kind: Kind, name: &str) -> Result<bool> {
        match self.stat(kind, name) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn remove(&self, kind: Kind, name: &str) -> Result<()> {
        let key = object_key(&self.prefix, kind, name);
        let action = DeleteObject::new(&self.bucket, Some(&self.credentials), &key);
        let url = action.sign(SIGNATURE_LIFETIME);
        self.agent
            .request_url("DELETE", &url)
            .call()
            .map_err(|e| map_ureq(e, &key))?;
        Ok(())
    }

    fn list(&self, kind: Kind) -> Result<Vec<String>> {
        let list_prefix = object_key(&self.prefix, kind, "");
        let mut names = Vec::new();
        let mut continuation = None;

        loop {
            let mut action = ListObjectsV2::new(&self.bucket, Some(&self.credentials));
            action.with_prefix(&list_prefix);
            if let Some(token) = &continuation {
                action.with_continuation_token(token);
            }
            let url = action.sign(SIGNATURE_LIFETIME);
            let body = self
                .agent
                .request_url("GET", &url)
                .call()
                .map_err(|e| map_ureq(e, &list_prefix))?
                .into_string()?;
            let parsed = ListObjectsV2::parse_response(&body)
                .map_err(|e| Error::transport(format!("parsing S3 list response: {e}")))?;

            for object in parsed.contents {
                if let Some(name) = object.key.rsplit('/').next() {
                    names.push(name.to_string());
                }
            }
            match parsed.next_continuation_token {
                Some(token) => continuation = Some(token),
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
