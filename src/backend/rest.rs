//! A generic HTTP REST [`Backend`] (§6.1, §6.2): each namespace maps to a
//! URL path segment, and plain HTTP verbs do the rest — `HEAD`=test,
//! `GET`=load (with `Range`), `POST`=create (409 on conflict),
//! `DELETE`=remove, and `GET` on a namespace path returns a JSON array of
//! names.

use std::io::Read;

use tracing::*;

use super::Kind;
use crate::error::{Error, Result};

pub struct RestBackend {
    base: String,
    agent: ureq::Agent,
    location: String,
}

fn object_url(base: &str, kind: Kind, name: &str) -> String {
    if kind.namespace().is_empty() {
        format!("{base}/{name}")
    } else {
        format!("{base}/{}/{name}", kind.namespace())
    }
}

fn namespace_url(base: &str, kind: Kind) -> String {
    if kind.namespace().is_empty() {
        format!("{base}/")
    } else {
        format!("{base}/{}/", kind.namespace())
    }
}

fn map_ureq(e: ureq::Error, what: &str) -> Error {
    match e {
        ureq::Error::Status(404, _) => Error::NotFound(what.to_string()),
        ureq::Error::Status(409, _) => Error::AlreadyExists(what.to_string()),
        ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => {
            Error::transport(format!("{what}: authentication rejected by server"))
        }
        ureq::Error::Status(code, resp) => {
            Error::transport(format!("{what}: HTTP {code} ({})", resp.status_text()))
        }
        ureq::Error::Transport(t) => Error::transport(t),
    }
}

impl RestBackend {
    /// Parses `http[s]://host[:port]/[path]`, the body of a `rest:` URL.
    pub fn new(rest: &str) -> Result<Self> {
        let base = rest.trim_end_matches('/').to_string();
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(Error::invalid(
                "rest location",
                "expected http:// or https://",
            ));
        }
        Ok(Self {
            location: format!("rest:{rest}"),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(std::time::Duration::from_secs(30))
                .timeout(std::time::Duration::from_secs(5 * 60))
                .build(),
            base,
        })
    }
}

impl super::Backend for RestBackend {
    fn create(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()> {
        let url = object_url(&self.base, kind, name);
        self.agent
            .post(&url)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(bytes)
            .map_err(|e| map_ureq(e, &url))?;
        Ok(())
    }

    fn load(&self, kind: Kind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let url = object_url(&self.base, kind, name);
        let mut req = self.agent.get(&url);
        if offset > 0 || length > 0 {
            let range = if length > 0 {
                format!("bytes={offset}-{}", offset + length - 1)
            } else {
                format!("bytes={offset}-")
            };
            req = req.set("Range", &range);
        }
        let resp = req.call().map_err(|e| map_ureq(e, &url))?;
        let mut buf = Vec::new();
        resp.into_reader().read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn stat(&self, kind: Kind, name: &str) -> Result<u64> {
        let url = object_url(&self.base, kind, name);
        let resp = self.agent.head(&url).call().map_err(|e| map_ureq(e, &url))?;
        resp.header("Content-Length")
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| Error::transport(format!("{url} has no Content-Length header")))
    }

    fn test(&self, kind: Kind, name: &str) -> Result<bool> {
        match self.stat(kind, name) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn remove(&self, kind: Kind, name: &str) -> Result<()> {
        let url = object_url(&self.base, kind, name);
        self.agent.delete(&url).call().map_err(|e| map_ureq(e, &url))?;
        Ok(())
    }

    fn list(&self, kind: Kind) -> Result<Vec<String>> {
        let url = namespace_url(&self.base, kind);
        let resp = match self.agent.get(&url).call() {
            Ok(r) => r,
            Err(ureq::Error::Status(404, _)) => return Ok(Vec::new()),
            Err(e) => return Err(map_ureq(e, &url)),
        };
        let mut names: Vec<String> = resp
            .into_json()
            .map_err(|e| Error::transport(format!("parsing REST directory listing: {e}")))?;
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
