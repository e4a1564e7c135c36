//! Callback URL validation (SSRF guard).
//!
//! A callback URL is handed to external workflows, which will POST to it
//! blindly; an attacker-controlled value would turn every workflow into
//! an open relay into private networks. Admission rules: `https` only
//! (plain `http` allowed for localhost), and the host must match the
//! allowlist — exactly, or as a suffix for entries starting with `.`.
//!
//! An inadmissible URL causes the tool call to proceed **without** a
//! callback rather than fail.

use url::Url;
use vr_domain::{Error, Result};

pub fn validate_callback_url(raw: &str, allowlist: &[String]) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| Error::CallbackRejected(format!("unparsable URL: {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| Error::CallbackRejected("URL has no host".into()))?
        .to_ascii_lowercase();

    let local = host == "localhost" || host == "127.0.0.1";
    match url.scheme() {
        "https" => {}
        "http" if local => {}
        scheme => {
            return Err(Error::CallbackRejected(format!(
                "scheme {scheme} not allowed for host {host}"
            )))
        }
    }

    let admitted = allowlist.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        if let Some(suffix) = entry.strip_prefix('.') {
            // `.example.com` matches `a.example.com` but not `example.com`
            // itself and not `notexample.com`.
            host.strip_suffix(suffix)
                .is_some_and(|prefix| prefix.ends_with('.'))
        } else {
            host == entry
        }
    });

    if admitted {
        Ok(())
    } else {
        Err(Error::CallbackRejected(format!(
            "host {host} not on callback allowlist"
        )))
    }
}
