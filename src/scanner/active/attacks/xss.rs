//! Cross-Site Scripting (XSS) testing

use async_trait::async_trait;

use super::limited;
use crate::error::ScanPluginError;
use crate::scanner::active::{ActiveScanPlugin, AttackContext, InjectionLocation, InjectionPoint};
use crate::scanner::alerts::{Alert, Confidence, Risk};

pub const REFLECTED_XSS_PLUGIN_ID: u32 = 40012;

/// XSS test payloads with unique identifiers
const XSS_PAYLOADS: &[(&str, &str)] = &[
    ("<script>alert('XSS')</script>", "script-tag"),
    ("<img src=x onerror=alert('XSS')>", "img-onerror"),
    ("<svg onload=alert('XSS')>", "svg-onload"),
    ("'\"><script>alert('XSS')</script>", "breakout-script"),
    ("</title><script>alert('XSS')</script>", "title-breakout"),
    ("</textarea><script>alert('XSS')</script>", "textarea-breakout"),
    ("javascript:alert('XSS')", "javascript-uri"),
    ("<body onload=alert('XSS')>", "body-onload"),
    ("<input onfocus=alert('XSS') autofocus>", "input-autofocus"),
    ("<details open ontoggle=alert('XSS')>", "details-ontoggle"),
    ("<iframe src=\"javascript:alert('XSS')\">", "iframe-javascript"),
    ("<math><mtext></mtext></math><script>alert('XSS')</script>", "math-breakout"),
    ("'-alert('XSS')-'", "js-context-break"),
    ("\";alert('XSS');//", "js-string-break"),
];

/// Reflected XSS indicators - simplified payload patterns for detection
const REFLECTED_INDICATORS: &[&str] = &["<script>", "onerror=", "onload=", "onfocus=", "javascript:", "alert("];

/// Reflected XSS: the payload comes back unencoded in an HTML response
#[derive(Debug, Default)]
pub struct ReflectedXssPlugin;

#[async_trait]
impl ActiveScanPlugin for ReflectedXssPlugin {
    fn id(&self) -> u32 {
        REFLECTED_XSS_PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Cross Site Scripting (Reflected)"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn applies_to(&self, point: &InjectionPoint) -> bool {
        point.location != InjectionLocation::Cookie
    }

    async fn scan(&self, ctx: &AttackContext) -> Result<(), ScanPluginError> {
        let baseline = ctx.base().response_body.text().to_lowercase();

        for (payload, payload_type) in limited(XSS_PAYLOADS, ctx.strength()) {
            if ctx.is_stopped() {
                break;
            }
            let response = ctx.attack(payload).await?;
            if !is_html(&response) {
                continue;
            }
            let body = response.response_body.text();

            // Payload is reflected exactly - likely vulnerable
            if body.contains(payload) {
                ctx.raise(
                    Alert::new(self.id(), self.name(), Risk::High, Confidence::Medium)
                        .with_attack(payload)
                        .with_evidence(payload)
                        .with_description(&format!(
                            "The value of '{}' is reflected unencoded in the response.",
                            ctx.point().name
                        ))
                        .with_solution("Encode all user input before rendering in HTML. Use context-aware output encoding.")
                        .with_other_info(&format!("Payload type: {}", payload_type))
                        .with_cwe(79)
                        .with_wasc(8),
                );
                return Ok(());
            }

            // Partial reflection that was not in the page before
            let lowered = body.to_lowercase();
            let indicator = REFLECTED_INDICATORS
                .iter()
                .find(|i| payload.contains(*i) && lowered.contains(*i) && !baseline.contains(*i));
            if let Some(indicator) = indicator {
                ctx.raise(
                    Alert::new(self.id(), "Potential Reflected XSS", Risk::Medium, Confidence::Low)
                        .with_attack(payload)
                        .with_evidence(indicator)
                        .with_description(&format!(
                            "XSS indicator '{}' appeared in the response after attacking '{}'.",
                            indicator,
                            ctx.point().name
                        ))
                        .with_solution("Review the context where user input is reflected and apply appropriate encoding.")
                        .with_cwe(79)
                        .with_wasc(8),
                );
                return Ok(());
            }
        }
        Ok(())
    }
}

fn is_html(message: &crate::http::HttpMessage) -> bool {
    message
        .response_header_value("content-type")
        .map(|ct| ct.to_ascii_lowercase().contains("html"))
        .unwrap_or(true)
}
