//! Container and quiesce configuration.
//!
//! Settings deserialize from any serde format; every field has a default
//! so partial documents are accepted.

use std::time::Duration;

use serde::Deserialize;

/// Default time a container waits for its mandatory references.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 300_000;

/// Default number of quiesce worker threads.
pub const DEFAULT_QUIESCE_THREADS: usize = 10;

/// Default idle time before a quiesce worker exits.
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 10_000;

/// Settings for a [`BlueprintContainer`](crate::container::BlueprintContainer).
///
/// # Examples
/// ```
/// use blueprint_container::settings::ContainerSettings;
///
/// let settings = ContainerSettings::default();
/// assert!(!settings.allow_override);
/// assert!(settings.wait_for_dependencies);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Allow registering a recipe twice under the same name (last wins).
    pub allow_override: bool,
    /// Wait for mandatory references before creating eager components.
    pub wait_for_dependencies: bool,
    /// How long to wait for mandatory references, in milliseconds.
    pub grace_period_ms: u64,
    /// Quiesce worker pool configuration.
    pub quiesce: QuiesceSettings,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            allow_override: false,
            wait_for_dependencies: true,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            quiesce: QuiesceSettings::default(),
        }
    }
}

impl ContainerSettings {
    #[inline]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Shape of the quiesce worker pool.
///
/// The pool starts with no threads and grows on demand up to
/// `max_threads`; idle workers exit after `keep_alive_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QuiesceSettings {
    pub max_threads: usize,
    pub keep_alive_ms: u64,
    /// What happens to work submitted after the pool started shutting down.
    pub rejection: RejectionPolicy,
}

impl Default for QuiesceSettings {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_QUIESCE_THREADS,
            keep_alive_ms: DEFAULT_KEEP_ALIVE_MS,
            rejection: RejectionPolicy::default(),
        }
    }
}

impl QuiesceSettings {
    /// Thread cap, never below one.
    #[inline]
    pub fn thread_cap(&self) -> usize {
        self.max_threads.max(1)
    }

    #[inline]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

/// Behaviour for quiesce work the pool refuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Drop the work silently; callers rely on their own timeout.
    #[default]
    Discard,
    /// Run the work on the submitting thread.
    CallerRuns,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = ContainerSettings::default();
        assert_eq!(settings.grace_period(), Duration::from_secs(300));
        assert_eq!(settings.quiesce.max_threads, 10);
        assert_eq!(settings.quiesce.rejection, RejectionPolicy::Discard);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let settings: ContainerSettings = serde_json::from_str(
            r#"{ "allow_override": true, "quiesce": { "rejection": "caller_runs" } }"#,
        )
        .unwrap();

        assert!(settings.allow_override);
        assert!(settings.wait_for_dependencies);
        assert_eq!(settings.quiesce.rejection, RejectionPolicy::CallerRuns);
        assert_eq!(settings.quiesce.keep_alive_ms, DEFAULT_KEEP_ALIVE_MS);
    }

    #[test]
    fn thread_cap_is_at_least_one() {
        let settings = QuiesceSettings {
            max_threads: 0,
            ..QuiesceSettings::default()
        };
        assert_eq!(settings.thread_cap(), 1);
    }
}
