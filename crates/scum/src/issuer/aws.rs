//! AWS STS and IAM over the Query API, signed with Signature Version 4

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use super::{AwsAuthority, AwsCredentials, CallerIdentity, IssuedAccessKey};
use crate::error::IssuerError;

type HmacSha256 = Hmac<Sha256>;

const STS_HOST: &str = "sts.amazonaws.com";
const STS_VERSION: &str = "2011-06-15";
const IAM_HOST: &str = "iam.amazonaws.com";
const IAM_VERSION: &str = "2010-05-08";

/// STS and IAM global endpoints are served from us-east-1
const GLOBAL_REGION: &str = "us-east-1";

const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Blocking AWS client
pub struct AwsClient {
    http: reqwest::blocking::Client,
}

impl AwsClient {
    pub fn new() -> Result<Self, IssuerError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("scum/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IssuerError::Transport {
                endpoint: "https client".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self { http })
    }

    /// POST a signed Query API request and return the response body
    fn call(
        &self,
        host: &str,
        service: &str,
        params: &[(&str, &str)],
        creds: AwsCredentials<'_>,
    ) -> Result<String, IssuerError> {
        let endpoint = format!("https://{}/", host);
        let body = form_encode(params);
        let signed = sign(host, service, GLOBAL_REGION, &body, creds, Utc::now());

        let mut request = self
            .http
            .post(&endpoint)
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .body(body);
        if let Some(token) = creds.session_token {
            request = request.header("x-amz-security-token", token);
        }

        let transport = |e: reqwest::Error| IssuerError::Transport {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        };

        let response = request.send().map_err(transport)?;
        let status = response.status();
        let text = response.text().map_err(transport)?;
        debug!(host, service, status = status.as_u16(), "aws response");

        if status.is_success() {
            return Ok(text);
        }

        match xml_tag(&text, "Code") {
            Some(code) => Err(IssuerError::Rejected {
                code,
                message: xml_tag(&text, "Message").unwrap_or_default(),
            }),
            None => Err(IssuerError::Malformed {
                endpoint,
                reason: format!("HTTP {} without error document", status),
            }),
        }
    }
}

impl AwsAuthority for AwsClient {
    fn caller_identity(&self, creds: AwsCredentials<'_>) -> Result<CallerIdentity, IssuerError> {
        let body = self.call(
            STS_HOST,
            "sts",
            &[("Action", "GetCallerIdentity"), ("Version", STS_VERSION)],
            creds,
        )?;

        Ok(CallerIdentity {
            account: required_tag(&body, "Account", STS_HOST)?,
            arn: required_tag(&body, "Arn", STS_HOST)?,
            user_id: required_tag(&body, "UserId", STS_HOST)?,
        })
    }

    fn create_access_key(
        &self,
        creds: AwsCredentials<'_>,
    ) -> Result<IssuedAccessKey, IssuerError> {
        let body = self.call(
            IAM_HOST,
            "iam",
            &[("Action", "CreateAccessKey"), ("Version", IAM_VERSION)],
            creds,
        )?;

        Ok(IssuedAccessKey {
            access_key_id: required_tag(&body, "AccessKeyId", IAM_HOST)?,
            secret_access_key: required_tag(&body, "SecretAccessKey", IAM_HOST)?,
        })
    }

    fn delete_access_key(
        &self,
        creds: AwsCredentials<'_>,
        access_key_id: &str,
    ) -> Result<(), IssuerError> {
        self.call(
            IAM_HOST,
            "iam",
            &[
                ("Action", "DeleteAccessKey"),
                ("AccessKeyId", access_key_id),
                ("Version", IAM_VERSION),
            ],
            creds,
        )?;
        Ok(())
    }
}

/// Headers produced by signing a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Signed {
    pub(crate) amz_date: String,
    pub(crate) authorization: String,
}

/// Sign a form-encoded POST to `/` with Signature Version 4
pub(crate) fn sign(
    host: &str,
    service: &str,
    region: &str,
    body: &str,
    creds: AwsCredentials<'_>,
    now: DateTime<Utc>,
) -> Signed {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    // Lowercase names in sorted order
    let mut headers = vec![
        ("content-type", CONTENT_TYPE.to_string()),
        ("host", host.to_string()),
        ("x-amz-date", amz_date.clone()),
    ];
    if let Some(token) = creds.session_token {
        headers.push(("x-amz-security-token", token.to_string()));
    }

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "POST\n/\n\n{}\n{}\n{}",
        canonical_headers,
        signed_headers,
        hex::encode(Sha256::digest(body.as_bytes()))
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(creds.secret_access_key, &date, region, service);
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    Signed {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, scope, signed_headers, signature
        ),
        amz_date,
    }
}

/// Derive the SigV4 signing key for one day, region and service
pub(crate) fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Encode parameters as an `application/x-www-form-urlencoded` body
pub(crate) fn form_encode(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Text content of the first `<tag>` element
pub(crate) fn xml_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = start + body[start..].find(&close)?;
    Some(xml_unescape(body[start..end].trim()))
}

fn required_tag(body: &str, tag: &str, host: &str) -> Result<String, IssuerError> {
    xml_tag(body, tag).ok_or_else(|| IssuerError::Malformed {
        endpoint: format!("https://{}/", host),
        reason: format!("missing <{}>", tag),
    })
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
