//! Active security scanner
//!
//! Attacks recorded requests by substituting payloads into their injection
//! points. Every variant goes through the same exchange path as proxied
//! traffic, so listeners and history see scan requests too.

pub mod attacks;
mod context;
mod engine;
mod injection;
mod job;
mod throttle;

use async_trait::async_trait;

use crate::error::ScanPluginError;

pub use context::AttackContext;
pub use engine::{ActiveScanEngine, ActiveSettings};
pub use injection::{injection_points, InjectionLocation, InjectionPoint};
pub use job::{ScanJob, ScanProgress, ScanScope, ScanStatus};
pub use throttle::HostThrottle;

/// A check that sends crafted variants of a request at one injection point
#[async_trait]
pub trait ActiveScanPlugin: Send + Sync {
    /// Plugin id used for alerts, policy and dependencies
    fn id(&self) -> u32;

    fn name(&self) -> &str;

    /// Lower runs first among plugins whose dependencies are satisfied
    fn priority(&self) -> i32 {
        0
    }

    /// Plugins that must run before this one at every injection point
    fn depends_on(&self) -> Vec<u32> {
        Vec::new()
    }

    fn applies_to(&self, _point: &InjectionPoint) -> bool {
        true
    }

    /// Attack one injection point. Requests go through `ctx.send`, alerts
    /// through `ctx.raise`.
    async fn scan(&self, ctx: &AttackContext) -> Result<(), ScanPluginError>;
}
