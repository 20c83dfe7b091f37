use std::collections::HashMap;
use std::error::Error as _;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{HandleOption, HttpHandle, TransportError};

/// [`HttpHandle`] binding over [`reqwest::blocking::Client`].
///
/// This binding does not support Unix domain sockets; configuring
/// [`HandleOption::UnixSocketPath`] fails, which in turn fails writer
/// construction.
pub struct ReqwestHandle {
    client: reqwest::blocking::Client,
    url: Option<String>,
    timeout: Duration,
    headers: HeaderMap,
    body: Vec<u8>,
    response_status: u16,
    response_body: Vec<u8>,
}

impl ReqwestHandle {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder().build().map_err(|err| {
            TransportError::new(format!("cannot create reqwest blocking http client: {err}"))
        })?;
        Ok(ReqwestHandle {
            client,
            url: None,
            timeout: Duration::from_secs(2),
            headers: HeaderMap::new(),
            body: Vec::new(),
            response_status: 0,
            response_body: Vec::new(),
        })
    }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut detail = String::new();
    let mut source = err.source();
    while let Some(cause) = source {
        if !detail.is_empty() {
            detail.push_str(": ");
        }
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}

impl HttpHandle for ReqwestHandle {
    fn set_option(&mut self, option: HandleOption) -> Result<(), TransportError> {
        match option {
            HandleOption::Url(url) => self.url = Some(url),
            HandleOption::TimeoutMs(ms) => self.timeout = Duration::from_millis(ms),
            // reqwest derives the content length from the body itself.
            HandleOption::PostFieldSize(_) => {}
            HandleOption::PostFields(body) => self.body = body,
            HandleOption::UnixSocketPath(_) => {
                return Err(TransportError::new(
                    "Unix domain sockets are not supported by the reqwest transport",
                ))
            }
        }
        Ok(())
    }

    fn set_headers(&mut self, headers: HashMap<String, String>) -> Result<(), TransportError> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| TransportError::new(format!("invalid header name {name:?}: {err}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|err| TransportError::new(format!("invalid header value: {err}")))?;
            map.insert(header, value);
        }
        self.headers = map;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), TransportError> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| TransportError::new("no agent URL configured"))?;
        self.response_status = 0;
        self.response_body.clear();

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .headers(self.headers.clone())
            .body(self.body.clone())
            .send()
            .map_err(|err| {
                let detail = error_chain(&err);
                TransportError::new(err.to_string()).with_detail(detail)
            })?;

        self.response_status = response.status().as_u16();
        self.response_body = response
            .bytes()
            .map_err(|err| {
                let detail = error_chain(&err);
                TransportError::new(err.to_string()).with_detail(detail)
            })?
            .to_vec();
        Ok(())
    }

    fn response_status(&self) -> u16 {
        self.response_status
    }

    fn response_body(&self) -> Vec<u8> {
        self.response_body.clone()
    }
}
