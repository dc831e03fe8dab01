//! Built-in active scan plugins

pub mod sqli;
pub mod xss;

use std::sync::Arc;

use super::ActiveScanPlugin;
use crate::scanner::policies::AttackStrength;

/// Every built-in plugin, ready for registration
pub fn builtin_plugins() -> Vec<Arc<dyn ActiveScanPlugin>> {
    vec![
        Arc::new(xss::ReflectedXssPlugin::default()),
        Arc::new(sqli::SqlInjectionPlugin::new()),
    ]
}

/// The first payloads allowed at `strength`
fn limited<T>(payloads: &[T], strength: AttackStrength) -> &[T] {
    &payloads[..payloads.len().min(strength.payload_limit())]
}
