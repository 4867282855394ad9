use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, SET_COOKIE, USER_AGENT};
use serde::Deserialize;
use tracing::{error, info};

use crate::cancel::CancellationToken;
use crate::config::{CatalogSettings, Credentials};
use crate::error::BundlerError;

const XSRF_COOKIE: &str = "XSRF-TOKEN=";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Bounded retry for the publication call: a fixed number of attempts with a
/// fixed pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Calls `attempt` until it succeeds or the attempts run out. Cancellation
    /// and authentication failures end the loop immediately.
    pub fn run<T, F>(&self, cancel: &CancellationToken, mut attempt: F) -> Result<T, BundlerError>
    where
        F: FnMut(u32) -> Result<T, BundlerError>,
    {
        let max_attempts = self.max_attempts.max(1);
        for number in 1..=max_attempts {
            cancel.check()?;
            match attempt(number) {
                Ok(value) => return Ok(value),
                Err(err @ (BundlerError::Cancelled | BundlerError::Authentication(_))) => {
                    return Err(err);
                }
                Err(err) => {
                    error!(attempt = number, max_attempts, %err, "unable to update csw publication");
                    if number < max_attempts {
                        cancel.sleep(self.delay)?;
                    }
                }
            }
        }
        Err(BundlerError::PublishExhausted {
            attempts: max_attempts,
        })
    }
}

pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Result<String, BundlerError>;
}

pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn access_token(&self) -> Result<String, BundlerError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// OAuth2 client-credentials grant. The token is reused until shortly before it expires.
pub struct ClientCredentialsTokenProvider {
    client: Client,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(
        client: Client,
        token_endpoint: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            client,
            token_endpoint,
            client_id,
            client_secret,
            cached: Mutex::new(None),
        }
    }

    fn request_token(&self) -> Result<CachedToken, BundlerError> {
        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .map_err(|err| BundlerError::Authentication(err.to_string()))?;
        if !response.status().is_success() {
            return Err(BundlerError::Authentication(format!(
                "token endpoint returned status {}",
                response.status().as_u16()
            )));
        }
        let token: TokenResponse = response
            .json()
            .map_err(|err| BundlerError::Authentication(err.to_string()))?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(300));
        Ok(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        })
    }
}

impl TokenProvider for ClientCredentialsTokenProvider {
    fn access_token(&self) -> Result<String, BundlerError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| BundlerError::Authentication("token cache poisoned".to_string()))?;
        if let Some(token) = cached.as_ref().filter(|token| token.expires_at > Instant::now()) {
            return Ok(token.value.clone());
        }
        let token = self.request_token()?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }
}

/// Response document returned by a successful publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogDocument(pub String);

pub trait MetadataCatalog: Send + Sync {
    /// Stamps `identifier` with `timestamp` as both its publication date and
    /// its dateStamp. `None` means no XSRF token could be obtained.
    fn publish(
        &self,
        identifier: &str,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<CatalogDocument>, BundlerError>;

    fn fetch_xml(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BundlerError>;

    fn fetch_pdf(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BundlerError>;
}

pub struct CatalogHttpClient {
    client: Client,
    base_url: String,
    tokens: Box<dyn TokenProvider>,
    retry: RetryPolicy,
}

impl CatalogHttpClient {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Box<dyn TokenProvider>,
        retry: RetryPolicy,
    ) -> Result<Self, BundlerError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            retry,
        })
    }

    pub fn from_settings(settings: &CatalogSettings) -> Result<Self, BundlerError> {
        let tokens: Box<dyn TokenProvider> = match &settings.credentials {
            Credentials::Static(token) => Box::new(StaticTokenProvider::new(token.clone())),
            Credentials::ClientCredentials {
                token_endpoint,
                client_id,
                client_secret,
            } => Box::new(ClientCredentialsTokenProvider::new(
                build_client()?,
                token_endpoint.clone(),
                client_id.clone(),
                client_secret.clone(),
            )),
        };
        Self::new(settings.base_url.clone(), tokens, settings.retry)
    }

    /// Appends `path` to the base URL, keeping its context path (`/geonetwork`).
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// URL of a record resource. `identifier` is percent-encoded as one path segment.
    pub fn record_url(&self, identifier: &str, formatter: &str) -> Result<Url, BundlerError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| BundlerError::InvalidConfig(format!("metadata center url: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| {
                BundlerError::InvalidConfig("metadata center url cannot be a base".to_string())
            })?
            .pop_if_empty()
            .extend(["srv", "api", "records", identifier, "formatters", formatter]);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, BundlerError> {
        let token = self.tokens.access_token()?;
        Ok(request.header(AUTHORIZATION, format!("Bearer {token}")))
    }

    fn xsrf_token(&self) -> Result<Option<String>, BundlerError> {
        let request = self.authorized(self.client.get(self.url("/srv/eng/info?type=me")))?;
        let response = match request.send() {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "Unable to retrieve XSRF-TOKEN");
                return Ok(None);
            }
        };
        let status = response.status().as_u16();
        let token = if status == 200 || status == 403 {
            response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find_map(parse_xsrf_cookie)
        } else {
            None
        };
        if token.is_none() {
            error!(status, "Unable to retrieve XSRF-TOKEN");
        }
        Ok(token)
    }

    fn handle_status(response: Response) -> Result<Response, BundlerError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "metadata center request failed".to_string());
        Err(BundlerError::CatalogStatus { status, message })
    }
}

impl MetadataCatalog for CatalogHttpClient {
    fn publish(
        &self,
        identifier: &str,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<CatalogDocument>, BundlerError> {
        cancel.check()?;
        let Some(xsrf) = self.xsrf_token()? else {
            return Ok(None);
        };
        let body = csw_publication_body(identifier, timestamp);
        let url = self.url("/srv/dut/csw-publication");

        let document = self.retry.run(cancel, |_| {
            let request = self
                .authorized(self.client.post(&url))?
                .header("X-XSRF-TOKEN", &xsrf)
                .header(CONTENT_TYPE, "application/xml")
                .body(body.clone());
            let response = request
                .send()
                .map_err(|err| BundlerError::CatalogHttp(err.to_string()))?;
            let response = Self::handle_status(response)?;
            response
                .text()
                .map(CatalogDocument)
                .map_err(|err| BundlerError::CatalogHttp(err.to_string()))
        })?;
        info!(identifier, "csw publication updated");
        Ok(Some(document))
    }

    fn fetch_xml(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BundlerError> {
        cancel.check()?;
        let url = self.record_url(identifier, "xml")?;
        let response = self
            .authorized(self.client.get(url))?
            .send()
            .map_err(|err| BundlerError::CatalogHttp(err.to_string()))?;
        let response = Self::handle_status(response).inspect_err(|_| error!("Unable to get XML"))?;
        response
            .text()
            .map_err(|err| BundlerError::CatalogHttp(err.to_string()))
    }

    fn fetch_pdf(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BundlerError> {
        cancel.check()?;
        let mut url = self.record_url(identifier, "xsl-view")?;
        url.set_query(Some("output=pdf&language=dut&attachment=true"));
        let response = self
            .authorized(self.client.get(url))?
            .send()
            .map_err(|err| BundlerError::CatalogHttp(err.to_string()))?;
        let response = Self::handle_status(response).inspect_err(|_| error!("Unable to get pdf"))?;
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| BundlerError::CatalogHttp(err.to_string()))
    }
}

fn build_client() -> Result<Client, BundlerError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("extract-bundler/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| BundlerError::InvalidConfig(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(100))
        .build()
        .map_err(|err| BundlerError::CatalogHttp(err.to_string()))
}

/// Extracts the XSRF token from one `Set-Cookie` header value.
pub fn parse_xsrf_cookie(header: &str) -> Option<String> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix(XSRF_COOKIE))
        .map(str::to_string)
        .filter(|token| !token.trim().is_empty())
}

/// Escapes the XML special characters of a text node or attribute value.
pub fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

pub fn csw_publication_body(identifier: &str, timestamp: DateTime<Utc>) -> String {
    let stamp = timestamp.to_rfc3339_opts(SecondsFormat::Micros, true);
    let identifier = escape_xml(identifier);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<csw:Transaction service="CSW" version="2.0.2"
	xmlns:csw="http://www.opengis.net/cat/csw/2.0.2"
	xmlns:ogc="http://www.opengis.net/ogc"
	xmlns:apiso="http://www.opengis.net/cat/csw/apiso/1.0">
	<csw:Update>
		<csw:RecordProperty>
			<csw:Name>gmd:identificationInfo/gmd:MD_DataIdentification/gmd:citation/gmd:CI_Citation/gmd:date/gmd:CI_Date/gmd:date/gco:Date[../../gmd:dateType/gmd:CI_DateTypeCode/@codeListValue="publication"]</csw:Name>
			<csw:Value>{stamp}</csw:Value>
		</csw:RecordProperty>
		<csw:RecordProperty>
			<csw:Name>gmd:dateStamp/gco:Date</csw:Name>
			<csw:Value>{stamp}</csw:Value>
		</csw:RecordProperty>
		<csw:Constraint version="1.1.0">
			<ogc:Filter>
				<ogc:PropertyIsEqualTo>
					<ogc:PropertyName>Identifier</ogc:PropertyName>
					<ogc:Literal>{identifier}</ogc:Literal>
				</ogc:PropertyIsEqualTo>
			</ogc:Filter>
		</csw:Constraint>
	</csw:Update>
</csw:Transaction>
"#
    )
}
