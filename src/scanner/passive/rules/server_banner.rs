//! Server Banner/Technology Disclosure Rule

use regex::Regex;

use crate::error::ScanRuleError;
use crate::http::HttpMessage;
use crate::scanner::alerts::{Alert, Confidence, Risk};
use crate::scanner::passive::PassiveScanRule;

pub const SERVER_BANNER_RULE_ID: u32 = 10036;

/// Server banner disclosure passive scanner rule
pub struct ServerBannerRule {
    enabled: bool,
    version_pattern: Option<Regex>,
}

impl ServerBannerRule {
    pub fn new() -> Self {
        Self {
            enabled: true,
            version_pattern: Regex::new(r"\d+\.\d+(?:\.\d+)?").ok(),
        }
    }

    fn has_version(&self, value: &str) -> bool {
        self.version_pattern.as_ref().map_or(false, |re| re.is_match(value))
    }
}

impl Default for ServerBannerRule {
    fn default() -> Self {
        Self::new()
    }
}

impl PassiveScanRule for ServerBannerRule {
    fn id(&self) -> u32 {
        SERVER_BANNER_RULE_ID
    }

    fn name(&self) -> &str {
        "Server Banner"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn scan(&self, message: &HttpMessage) -> Result<Vec<Alert>, ScanRuleError> {
        let mut alerts = Vec::new();

        if let Some(server) = message.response_header_value("server") {
            if self.has_version(server) {
                alerts.push(
                    Alert::new(self.id(), "Server Leaks Version Information", Risk::Low, Confidence::High)
                        .for_message(message)
                        .with_param("Server")
                        .with_description(&format!("The Server header discloses version information: {}", server))
                        .with_evidence(server)
                        .with_solution("Configure the web server to remove version information.")
                        .with_cwe(200)
                        .with_wasc(13),
                );
            }
        }

        for header in ["X-Powered-By", "X-AspNet-Version"] {
            if let Some(value) = message.response_header_value(header) {
                alerts.push(
                    Alert::new(self.id(), &format!("{} Header Disclosure", header), Risk::Low, Confidence::Medium)
                        .for_message(message)
                        .with_param(header)
                        .with_description(&format!("The {} header discloses the technology stack.", header))
                        .with_evidence(&format!("{}: {}", header, value))
                        .with_solution(&format!("Remove the {} header in production.", header))
                        .with_cwe(200)
                        .with_wasc(13),
                );
            }
        }

        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, Initiator, RequestHeader, ResponseHeader};

    fn message(server: &str) -> HttpMessage {
        let mut msg = HttpMessage::new(
            RequestHeader::new("GET", "https://example.com").unwrap(),
            Body::empty(),
            Initiator::Proxy,
        );
        let mut resp = ResponseHeader::new(200, "OK");
        resp.headers.append("Server", server);
        msg.set_response(resp, Body::empty());
        msg
    }

    #[test]
    fn test_server_version_detection() {
        let rule = ServerBannerRule::new();
        assert_eq!(rule.scan(&message("Apache/2.4.41 (Ubuntu)")).unwrap().len(), 1);
        assert!(rule.scan(&message("cloudflare")).unwrap().is_empty());
    }
}
