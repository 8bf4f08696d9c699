//! HTTP client construction and CA bundle loading.

use std::time::Duration;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use reqwest::{Certificate, Client};
use tracing::warn;

use crate::cloud::CloudError;
use crate::config::OpenStackConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MARKER: &str = " CERTIFICATE";
const PLACEHOLDER: &str = ".CERTIFICATE";

/// Restores line breaks in a PEM bundle whose newlines were flattened into
/// spaces, leaving the `BEGIN CERTIFICATE` and `END CERTIFICATE` markers
/// intact.
#[must_use]
pub fn repair_pem(text: &str) -> String {
    text.replace(MARKER, PLACEHOLDER)
        .replace(' ', "\n")
        .replace(PLACEHOLDER, MARKER)
}

/// Reads and repairs the PEM bundle at `path`.
///
/// # Errors
///
/// Returns [`CloudError::Config`] when the file cannot be read.
pub fn read_bundle(path: &Utf8Path) -> Result<String, CloudError> {
    let unreadable = |message: String| CloudError::Config(format!("CA bundle {path}: {message}"));
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| unreadable(String::from("not a file path")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| unreadable(err.to_string()))?;
    let text = dir
        .read_to_string(name)
        .map_err(|err| unreadable(err.to_string()))?;
    Ok(repair_pem(&text))
}

/// Builds the HTTP client. With a CA bundle configured the bundle is trusted;
/// otherwise certificate verification is disabled.
///
/// # Errors
///
/// Returns [`CloudError::Config`] when the bundle cannot be loaded and
/// [`CloudError::Provider`] when the client cannot be built.
pub fn http_client(config: &OpenStackConfig) -> Result<Client, CloudError> {
    let builder = Client::builder().timeout(REQUEST_TIMEOUT);
    let configured = if let Some(path) = config.cacert_path() {
        let pem = read_bundle(path)?;
        let certificate = Certificate::from_pem(pem.as_bytes())
            .map_err(|err| CloudError::Config(format!("CA bundle {path}: {err}")))?;
        builder.add_root_certificate(certificate)
    } else {
        warn!(
            auth_url = config.auth_url.as_deref().unwrap_or_default(),
            "no CA bundle configured (OS_CACERT unset); TLS certificate verification disabled"
        );
        builder.danger_accept_invalid_certs(true)
    };
    configured.build().map_err(CloudError::from)
}
