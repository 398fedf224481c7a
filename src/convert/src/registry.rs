//! HTTP client for Docker registries.
//!
//! Speaks both wire protocols the remote backend consumes: the v1
//! token+endpoint dance (`X-Docker-Token`, `X-Docker-Endpoints`, cookies)
//! and the v2 manifest/blob API with bearer-token authentication and
//! digest verification.

use std::collections::HashMap;
use std::io::{Read, Write};

use docker2aci_core::config::InsecureConfig;
use docker2aci_core::error::{ConvertError, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// State harvested from the v1 token bootstrap request.
#[derive(Debug, Clone)]
pub struct RepoData {
    /// Registry endpoints serving the repository, bare hosts.
    pub endpoints: Vec<String>,
    pub token: Option<String>,
    pub cookie: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

pub struct RegistryClient {
    http: reqwest::blocking::Client,
    index_url: String,
    scheme: &'static str,
    allow_http: bool,
    username: Option<String>,
    password: Option<String>,
    bearer_token: Option<String>,
}

impl RegistryClient {
    pub fn new(
        index_url: &str,
        username: Option<String>,
        password: Option<String>,
        insecure: InsecureConfig,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(insecure.skip_verify)
            .build()
            .map_err(|err| ConvertError::RegistryUnreachable(err.to_string()))?;
        Ok(Self {
            http,
            index_url: index_url.to_string(),
            scheme: "https",
            allow_http: insecure.allow_http,
            username,
            password,
            bearer_token: None,
        })
    }

    /// Whether the registry answers the v2 discovery endpoint. Resolves the
    /// transport scheme on first contact: HTTPS, falling back to plain HTTP
    /// when allowed.
    pub fn supports_v2(&mut self) -> Result<bool> {
        let response = self.discover_v2()?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(false);
        }
        if status.as_u16() == 401 {
            // Speaks v2 but wants a token; the manifest fetch will get one.
            return Ok(true);
        }
        Ok(status.is_success())
    }

    fn discover_v2(&mut self) -> Result<reqwest::blocking::Response> {
        let url = format!("https://{}/v2/", self.index_url);
        match self.http.get(&url).send() {
            Ok(response) => {
                self.scheme = "https";
                Ok(response)
            }
            Err(err) if self.allow_http => {
                tracing::debug!(error = %err, "HTTPS failed, retrying over HTTP");
                let url = format!("http://{}/v2/", self.index_url);
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .map_err(|err| ConvertError::RegistryUnreachable(err.to_string()))?;
                self.scheme = "http";
                Ok(response)
            }
            Err(err) => Err(ConvertError::RegistryUnreachable(err.to_string())),
        }
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("{}://{}{}", self.scheme, host, path)
    }

    /// GET with bearer/basic authentication, solving a 401 challenge once.
    fn authed_get(&mut self, url: &str, accept: Option<&str>) -> Result<reqwest::blocking::Response> {
        let response = self.plain_get(url, accept, true)?;
        if response.status().as_u16() != 401 {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match challenge {
            Some(challenge) if challenge.trim_start().starts_with("Bearer") => {
                self.fetch_bearer_token(&challenge)?;
                self.plain_get(url, accept, true)
            }
            _ => Ok(response),
        }
    }

    fn plain_get(
        &self,
        url: &str,
        accept: Option<&str>,
        with_auth: bool,
    ) -> Result<reqwest::blocking::Response> {
        let mut request = self.http.get(url);
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }
        if with_auth {
            if let Some(ref token) = self.bearer_token {
                request = request.bearer_auth(token);
            } else if let Some(ref username) = self.username {
                request = request.basic_auth(username, self.password.as_deref());
            }
        }
        request
            .send()
            .map_err(|err| ConvertError::RegistryUnreachable(err.to_string()))
    }

    /// Fetch a bearer token from the realm named in a WWW-Authenticate
    /// challenge and remember it for subsequent requests.
    fn fetch_bearer_token(&mut self, challenge: &str) -> Result<()> {
        let params = parse_auth_challenge(challenge);
        let realm = params.get("realm").ok_or_else(|| {
            ConvertError::Unauthorized("bearer challenge without realm".to_string())
        })?;

        let mut request = self.http.get(realm);
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = params.get("service") {
            query.push(("service", service));
        }
        if let Some(scope) = params.get("scope") {
            query.push(("scope", scope));
        }
        request = request.query(&query);
        if let Some(ref username) = self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .map_err(|err| ConvertError::RegistryUnreachable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ConvertError::Unauthorized(format!(
                "token endpoint returned HTTP {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .map_err(|err| ConvertError::Unauthorized(err.to_string()))?;
        self.bearer_token = token.token.or(token.access_token);
        if self.bearer_token.is_none() {
            return Err(ConvertError::Unauthorized(
                "token endpoint returned no token".to_string(),
            ));
        }
        Ok(())
    }

    /// Fetch a manifest, negotiating among `accept_types`. Returns the raw
    /// body, the served media type and the computed digest.
    pub fn get_v2_manifest(
        &mut self,
        repository: &str,
        reference: &str,
        accept_types: &[&str],
    ) -> Result<(Vec<u8>, String, String)> {
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme, self.index_url, repository, reference
        );
        let accept = accept_types.join(", ");
        let response = self.authed_get(&url, Some(&accept))?;
        let response = check_status(response, &url)?;

        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_default();
        if !accept_types.contains(&media_type.as_str()) {
            return Err(ConvertError::BadManifestMediaType { media_type });
        }

        let body = response
            .bytes()
            .map_err(|err| ConvertError::RegistryUnreachable(err.to_string()))?
            .to_vec();
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        if reference.contains(':') && reference != digest {
            return Err(ConvertError::BadDigest {
                expected: reference.to_string(),
                computed: digest,
            });
        }

        tracing::debug!(repository, reference, %media_type, %digest, "fetched manifest");
        Ok((body, media_type, digest))
    }

    /// Stream a blob to `dest`, verifying its digest on the fly.
    pub fn fetch_v2_blob(
        &mut self,
        repository: &str,
        digest: &str,
        dest: &mut dyn Write,
    ) -> Result<u64> {
        let url = format!(
            "{}://{}/v2/{}/blobs/{}",
            self.scheme, self.index_url, repository, digest
        );
        let response = self.authed_get(&url, None)?;
        let mut response = check_status(response, &url)?;

        let mut hasher = Sha256::new();
        let mut total = 0u64;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|err| ConvertError::RegistryUnreachable(err.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            dest.write_all(&buf[..n])?;
            total += n as u64;
        }

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != digest {
            return Err(ConvertError::BadDigest {
                expected: digest.to_string(),
                computed,
            });
        }
        tracing::debug!(digest, bytes = total, "fetched blob");
        Ok(total)
    }

    /// v1 token bootstrap: GET /v1/repositories/{name}/images with
    /// `X-Docker-Token: true`, harvesting token, endpoints and cookies.
    pub fn get_v1_repo_data(&mut self, repository: &str) -> Result<RepoData> {
        let url = format!(
            "{}://{}/v1/repositories/{}/images",
            self.scheme, self.index_url, repository
        );
        let mut request = self.http.get(&url).header("X-Docker-Token", "true");
        if let Some(ref username) = self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        let response = request
            .send()
            .map_err(|err| ConvertError::RegistryUnreachable(err.to_string()))?;
        let response = check_status(response, &url)?;

        let token = response
            .headers()
            .get("x-docker-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut endpoints = Vec::new();
        for value in response.headers().get_all("x-docker-endpoints") {
            if let Ok(value) = value.to_str() {
                endpoints.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
            }
        }
        if endpoints.is_empty() {
            endpoints.push(self.index_url.clone());
        }

        let cookies: Vec<String> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let cookie = if cookies.is_empty() {
            None
        } else {
            Some(cookies.join("; "))
        };

        Ok(RepoData {
            endpoints,
            token,
            cookie,
        })
    }

    fn v1_get(&self, url: &str, repo_data: &RepoData) -> Result<reqwest::blocking::Response> {
        let mut request = self.http.get(url);
        if let Some(ref token) = repo_data.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Token {}", token));
        }
        if let Some(ref cookie) = repo_data.cookie {
            request = request.header(reqwest::header::COOKIE, cookie.as_str());
        }
        let response = request
            .send()
            .map_err(|err| ConvertError::RegistryUnreachable(err.to_string()))?;
        check_status(response, url)
    }

    /// Resolve a tag to the top image ID.
    pub fn get_v1_image_id(
        &self,
        endpoint: &str,
        repository: &str,
        tag: &str,
        repo_data: &RepoData,
    ) -> Result<String> {
        let url = self.url(endpoint, &format!("/v1/repositories/{}/tags/{}", repository, tag));
        let response = self.v1_get(&url, repo_data)?;
        let image_id: String = response
            .json()
            .map_err(|err| ConvertError::Serialization(err.to_string()))?;
        Ok(image_id)
    }

    /// Layer chain of an image, top-first as served.
    pub fn get_v1_ancestry(
        &self,
        endpoint: &str,
        image_id: &str,
        repo_data: &RepoData,
    ) -> Result<Vec<String>> {
        let url = self.url(endpoint, &format!("/v1/images/{}/ancestry", image_id));
        let response = self.v1_get(&url, repo_data)?;
        let ancestry: Vec<String> = response
            .json()
            .map_err(|err| ConvertError::Serialization(err.to_string()))?;
        Ok(ancestry)
    }

    /// Raw layer JSON plus the size advertised in `X-Docker-Size`.
    pub fn get_v1_layer_json(
        &self,
        endpoint: &str,
        image_id: &str,
        repo_data: &RepoData,
    ) -> Result<(Vec<u8>, Option<u64>)> {
        let url = self.url(endpoint, &format!("/v1/images/{}/json", image_id));
        let response = self.v1_get(&url, repo_data)?;
        let size = response
            .headers()
            .get("x-docker-size")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response
            .bytes()
            .map_err(|err| ConvertError::RegistryUnreachable(err.to_string()))?;
        Ok((body.to_vec(), size))
    }

    /// Stream raw layer bytes to `dest`. v1 supplies no digest to verify.
    pub fn fetch_v1_layer(
        &self,
        endpoint: &str,
        image_id: &str,
        repo_data: &RepoData,
        dest: &mut dyn Write,
    ) -> Result<u64> {
        let url = self.url(endpoint, &format!("/v1/images/{}/layer", image_id));
        let mut response = self.v1_get(&url, repo_data)?;
        let total = std::io::copy(&mut response, dest)?;
        tracing::debug!(image_id, bytes = total, "fetched v1 layer");
        Ok(total)
    }
}

fn check_status(
    response: reqwest::blocking::Response,
    url: &str,
) -> Result<reqwest::blocking::Response> {
    let status = response.status();
    match status.as_u16() {
        200..=299 => Ok(response),
        401 | 403 => Err(ConvertError::Unauthorized(format!("HTTP {} from {}", status, url))),
        404 => Err(ConvertError::NotFound(url.to_string())),
        _ => Err(ConvertError::RegistryUnreachable(format!(
            "HTTP {} from {}",
            status, url
        ))),
    }
}

/// Parse the parameter list of a `Bearer realm="…",service="…"` challenge.
fn parse_auth_challenge(challenge: &str) -> HashMap<String, String> {
    let challenge = challenge.trim_start();
    let params = challenge.strip_prefix("Bearer").unwrap_or(challenge);
    params
        .split(',')
        .filter_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            Some((
                key.trim().to_lowercase(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}
