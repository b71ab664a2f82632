use thiserror;

use reqwest::{self, StatusCode};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("This object contains a circular reference. To automatically remove it, set the `remove_circular` option to true.")]
    CircularReference,
    #[error("Value of type {0} not recognized.")]
    UnsupportedType(String),
    #[error("Failed to decode a Struct from its wire form: {0}")]
    Decode(serde_json::Error),
    #[error("Failed to read the 'default_labels' object from the JSON file, does it exist by this name?. Parse error: {0}")]
    DefaultLabelsError(serde_json::Error),
    #[error("Failed to read the 'resource_labels' object from the JSON file, does it exist by this name?. Parse error: {0}")]
    ResourceLabelsError(serde_json::Error),
    #[error("Failed to build the API form of a log entry: {0}")]
    ApiEntryError(serde_json::Error),
    #[error("Failed to write a log entry to the transport: {0}")]
    WriteError(#[from] std::io::Error),
    #[error("Serde JSON serialization failed with context '{context}'. Error: {source}")]
    ShipperSerializeError {
        context: String,
        source: serde_json::Error,
    },
    #[error("Reqwest error with context '{context}'. Error: {source}")]
    ShipperReqwestError {
        context: String,
        source: reqwest::Error,
    },
    #[error("No 'access_token' found in the metadata server response body")]
    ShipperTokenNotFound,
    #[error("No 'expires_in' found in the metadata server response body")]
    ShipperTokenExpiryNotFound,
    #[error("unsuccessful HTTP response error with context '{context}'. HTTP status code: '{status}', body: '{body}'")]
    HttpResponseError {
        context: String,
        status: StatusCode,
        body: String,
    },
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::ShipperReqwestError {
            context: "Error sending HTTP request".to_string(),
            source: err,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
