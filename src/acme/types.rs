//! Wire-format types for ACME resources (RFC 8555 §7.1).

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

#[derive(Debug, Serialize, Clone)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub value: String,
}

impl Identifier {
    #[must_use]
    pub fn dns(domain: impl Into<String>) -> Self {
        Self {
            r#type: "dns",
            value: domain.into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrderDocument {
    pub status: OrderStatus,
    pub finalize: String,
    pub authorizations: Vec<String>,
    pub certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizationDocument {
    pub status: AuthorizationStatus,
    #[serde(rename = "identifier")]
    _identifier: serde_json::Value,
    pub challenges: Vec<ChallengeDocument>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChallengeDocument {
    #[serde(rename = "type")]
    pub r#type: ChallengeType,
    pub url: String,
    pub token: String,
    pub status: ChallengeStatus,
    pub error: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_deserialization() {
        let cases = [
            ("\"pending\"", OrderStatus::Pending),
            ("\"ready\"", OrderStatus::Ready),
            ("\"processing\"", OrderStatus::Processing),
            ("\"valid\"", OrderStatus::Valid),
            ("\"invalid\"", OrderStatus::Invalid),
        ];
        for (json, expected) in cases {
            let status: OrderStatus = serde_json::from_str(json).unwrap();
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn test_challenge_type_deserialization() {
        let http01: ChallengeType = serde_json::from_str(r#""http-01""#).unwrap();
        assert_eq!(http01, ChallengeType::Http01);
        let dns01: ChallengeType = serde_json::from_str(r#""dns-01""#).unwrap();
        assert_eq!(dns01, ChallengeType::Dns01);
    }

    #[test]
    fn test_identifier_serializes_dns_type() {
        let id = Identifier::dns("example.com");
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["type"], "dns");
        assert_eq!(json["value"], "example.com");
    }
}
