//! Buffered analytics records and the buckets they are queued under.

use serde::{Deserialize, Serialize};

/// Base key of the analytics queue.
pub const ANALYTICS_KEYNAME: &str = "tyk-system-analytics";

/// One local analytics queue.
///
/// Bucket `-1` is the legacy shared key, kept for nodes that do not split
/// analytics by serialization method. Buckets `0..=9` are per-method keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnalyticsBucket(i8);

impl AnalyticsBucket {
    pub const LEGACY: AnalyticsBucket = AnalyticsBucket(-1);

    pub fn new(index: i8) -> Option<Self> {
        (-1..=9).contains(&index).then_some(Self(index))
    }

    /// Every bucket, legacy first.
    pub fn all() -> impl Iterator<Item = AnalyticsBucket> {
        (-1..=9).map(AnalyticsBucket)
    }

    pub fn index(self) -> i8 {
        self.0
    }

    pub fn key(self) -> String {
        match self.0 {
            -1 => ANALYTICS_KEYNAME.to_string(),
            i => format!("{}_{}", ANALYTICS_KEYNAME, i),
        }
    }
}

/// A single request record as recorded by a gateway node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AnalyticsRecord {
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "RawPath")]
    pub raw_path: String,
    #[serde(rename = "ContentLength")]
    pub content_length: i64,
    #[serde(rename = "UserAgent")]
    pub user_agent: String,
    #[serde(rename = "Day")]
    pub day: i32,
    #[serde(rename = "Month")]
    pub month: i32,
    #[serde(rename = "Year")]
    pub year: i32,
    #[serde(rename = "Hour")]
    pub hour: i32,
    #[serde(rename = "ResponseCode")]
    pub response_code: i32,
    #[serde(rename = "APIKey")]
    pub api_key: String,
    #[serde(rename = "APIVersion")]
    pub api_version: String,
    #[serde(rename = "APIName")]
    pub api_name: String,
    #[serde(rename = "APIID")]
    pub api_id: String,
    #[serde(rename = "OrgID")]
    pub org_id: String,
    #[serde(rename = "OauthID")]
    pub oauth_id: String,
    #[serde(rename = "RequestTime")]
    pub request_time: i64,
    #[serde(rename = "RawRequest")]
    pub raw_request: String,
    #[serde(rename = "RawResponse")]
    pub raw_response: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Alias")]
    pub alias: String,
    #[serde(rename = "TrackPath")]
    pub track_path: bool,
}

impl AnalyticsRecord {
    /// Decode a MessagePack-encoded record.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// Encode as a MessagePack map with named fields.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}
