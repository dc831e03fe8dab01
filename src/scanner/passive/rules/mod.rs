//! Passive scan rules

mod headers;
mod server_banner;

pub use headers::{SecurityHeadersRule, SECURITY_HEADERS_RULE_ID};
pub use server_banner::{ServerBannerRule, SERVER_BANNER_RULE_ID};
