use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use thiserror::Error;

/// Bytes of a failed response body kept for the error message.
pub const ERROR_BODY_LIMIT: u64 = 2048;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("GET {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("GET {url} returned {status}; body: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
}

pub fn client(timeout: Option<Duration>) -> reqwest::Result<Client> {
    let mut builder =
        Client::builder().user_agent(format!("sls-launcher/{}", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build()
}

/// Send a GET and return the response if it is 2xx.
pub fn get(client: &Client, url: &str) -> Result<Response, FetchError> {
    let response = client.get(url).send().map_err(|source| FetchError::Transport {
        url: url.to_string(),
        source,
    })?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
            body: body_snippet(response),
        });
    }
    Ok(response)
}

/// GET `url` and return the whole body.
pub fn fetch_url(client: &Client, url: &str) -> Result<Vec<u8>, FetchError> {
    let response = get(client, url)?;
    let bytes = response.bytes().map_err(|source| FetchError::Transport {
        url: url.to_string(),
        source,
    })?;
    Ok(bytes.to_vec())
}

/// Read at most [`ERROR_BODY_LIMIT`] bytes of `response`, trimmed.
pub fn body_snippet(response: Response) -> String {
    let mut buf = Vec::new();
    let _ = response.take(ERROR_BODY_LIMIT).read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).trim().to_string()
}
