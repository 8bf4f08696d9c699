//! Keystone v3 password authentication and service catalogue lookup.

use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::cloud::CloudError;
use crate::config::OpenStackConfig;

/// Header carrying the issued token on the Keystone response.
pub(crate) const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Header carrying the token on every authenticated request.
pub(crate) const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Catalogue types that can serve compute requests.
pub(crate) const COMPUTE_SERVICE_TYPES: [&str; 1] = ["compute"];

/// Catalogue types that can serve block-storage requests, in preference order.
pub(crate) const VOLUME_SERVICE_TYPES: [&str; 3] = ["volumev3", "block-storage", "volumev2"];

/// Authenticated token with the endpoints the driver uses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Session {
    pub token: String,
    pub compute_url: String,
    pub volume_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct CatalogEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Endpoint {
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub region_id: Option<String>,
    pub url: String,
}

impl Endpoint {
    fn in_region(&self, region: Option<&str>) -> bool {
        region.is_none_or(|wanted| {
            self.region.as_deref() == Some(wanted) || self.region_id.as_deref() == Some(wanted)
        })
    }
}

/// Returns the token endpoint for a Keystone URL with or without the `/v3`
/// suffix.
pub(crate) fn tokens_url(auth_url: &str) -> String {
    let base = auth_url.trim().trim_end_matches('/');
    if base.ends_with("/v3") {
        format!("{base}/auth/tokens")
    } else {
        format!("{base}/v3/auth/tokens")
    }
}

/// Builds the password authentication request, scoped to the project.
pub(crate) fn password_request(config: &OpenStackConfig) -> Value {
    let project = config.project_id().map_or_else(
        || {
            json!({
                "name": config.tenant_name.as_deref().unwrap_or_default().trim(),
                "domain": { "name": config.project_domain_name },
            })
        },
        |id| json!({ "id": id }),
    );
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": config.username.as_deref().unwrap_or_default().trim(),
                        "domain": { "name": config.user_domain_name },
                        "password": config.password.as_deref().unwrap_or_default(),
                    }
                }
            },
            "scope": { "project": project }
        }
    })
}

/// Picks the endpoint URL for the first service type present in the
/// catalogue, filtered by interface and optional region.
pub(crate) fn select_endpoint(
    catalog: &[CatalogEntry],
    service_types: &[&str],
    interface: &str,
    region: Option<&str>,
) -> Result<String, CloudError> {
    service_types
        .iter()
        .find_map(|service_type| {
            catalog
                .iter()
                .filter(|entry| entry.service_type == *service_type)
                .flat_map(|entry| entry.endpoints.iter())
                .find(|endpoint| endpoint.interface == interface && endpoint.in_region(region))
        })
        .map(|endpoint| endpoint.url.trim_end_matches('/').to_owned())
        .ok_or_else(|| CloudError::MissingEndpoint {
            service: service_types.join("/"),
        })
}

/// Authenticates against Keystone and resolves the compute and
/// block-storage endpoints.
pub(crate) async fn authenticate(
    http: &Client,
    config: &OpenStackConfig,
) -> Result<Session, CloudError> {
    let url = tokens_url(config.auth_url.as_deref().unwrap_or_default());
    debug!(url = %url, "requesting keystone token");
    let response = http
        .post(&url)
        .json(&password_request(config))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CloudError::Authentication {
            message: format!("{} {}", status.as_u16(), body.trim()),
        });
    }

    let token = response
        .headers()
        .get(SUBJECT_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| CloudError::Authentication {
            message: format!("response carried no {SUBJECT_TOKEN_HEADER} header"),
        })?;

    let text = response.text().await?;
    let body: TokenBody = serde_json::from_str(&text).map_err(|err| CloudError::Parse {
        resource: String::from("token"),
        message: err.to_string(),
    })?;

    let interface = config.endpoint_interface.trim();
    let region = config
        .region_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let session = Session {
        token,
        compute_url: select_endpoint(&body.token.catalog, &COMPUTE_SERVICE_TYPES, interface, region)?,
        volume_url: select_endpoint(&body.token.catalog, &VOLUME_SERVICE_TYPES, interface, region)?,
    };
    debug!(
        compute = %session.compute_url,
        volume = %session.volume_url,
        "keystone authentication succeeded"
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn catalog() -> Vec<CatalogEntry> {
        serde_json::from_str(
            r#"[
                {"type":"compute","endpoints":[
                    {"interface":"internal","region":"RegionOne","url":"http://nova-int/v2.1"},
                    {"interface":"public","region":"RegionOne","url":"https://nova/v2.1/"},
                    {"interface":"public","region":"RegionTwo","url":"https://nova-two/v2.1"}]},
                {"type":"volumev2","endpoints":[
                    {"interface":"public","region":"RegionOne","url":"https://cinder/v2/p"}]},
                {"type":"volumev3","endpoints":[
                    {"interface":"public","region_id":"RegionOne","url":"https://cinder/v3/p"}]}
            ]"#,
        )
        .expect("catalog decodes")
    }

    fn config() -> OpenStackConfig {
        OpenStackConfig {
            auth_url: Some(String::from("https://keystone:5000/v3")),
            username: Some(String::from("admin")),
            password: Some(String::from("secret")),
            user_domain_name: String::from("Default"),
            project_domain_name: String::from("Default"),
            tenant_name: Some(String::from("ibm-default")),
            tenant_id: None,
            region_name: None,
            endpoint_interface: String::from("public"),
            cacert: None,
        }
    }

    #[rstest]
    #[case("https://keystone:5000/v3", "https://keystone:5000/v3/auth/tokens")]
    #[case("https://keystone:5000/v3/", "https://keystone:5000/v3/auth/tokens")]
    #[case("https://keystone:5000", "https://keystone:5000/v3/auth/tokens")]
    fn tokens_url_tolerates_missing_version(#[case] auth_url: &str, #[case] expected: &str) {
        assert_eq!(tokens_url(auth_url), expected);
    }

    #[test]
    fn endpoint_selection_honours_interface_and_trims_slash() {
        let url = select_endpoint(&catalog(), &COMPUTE_SERVICE_TYPES, "public", Some("RegionOne"))
            .expect("compute endpoint");
        assert_eq!(url, "https://nova/v2.1");
    }

    #[test]
    fn volume_endpoint_prefers_v3_and_matches_region_id() {
        let url = select_endpoint(&catalog(), &VOLUME_SERVICE_TYPES, "public", Some("RegionOne"))
            .expect("volume endpoint");
        assert_eq!(url, "https://cinder/v3/p");
    }

    #[test]
    fn missing_service_names_the_types_searched() {
        let err = select_endpoint(&catalog(), &VOLUME_SERVICE_TYPES, "admin", None)
            .expect_err("no admin endpoint");
        assert_eq!(
            err,
            CloudError::MissingEndpoint {
                service: String::from("volumev3/block-storage/volumev2")
            }
        );
    }

    #[test]
    fn password_request_scopes_by_project_name() {
        let body = password_request(&config());
        assert_eq!(body["auth"]["identity"]["password"]["user"]["name"], "admin");
        assert_eq!(body["auth"]["scope"]["project"]["name"], "ibm-default");
        assert_eq!(body["auth"]["scope"]["project"]["domain"]["name"], "Default");
    }

    #[test]
    fn password_request_prefers_project_id() {
        let body = password_request(&OpenStackConfig {
            tenant_id: Some(String::from("b3f1")),
            ..config()
        });
        assert_eq!(body["auth"]["scope"]["project"], json!({ "id": "b3f1" }));
    }
}
