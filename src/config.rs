//! Per-agent configuration, in the style of `juniper_graphql_ws`'s
//! `ConnectionConfig`: a plain struct with `with_*` builder methods and
//! conservative defaults.

/// Configuration for a single [`crate::agent::Agent`].
#[derive(Clone, Copy, Debug, Default)]
pub struct AgentConfig {
    /// Maximum number of in-flight requests (pending Backend calls) this
    /// Agent may have at once.
    ///
    /// Requests beyond this bound are rejected with a validation error rather
    /// than queued, so one client can't pile up unbounded concurrent Backend
    /// work. `0` means unlimited, which is the default.
    pub max_in_flight_requests: usize,
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_in_flight_requests(mut self, max: usize) -> Self {
        self.max_in_flight_requests = max;
        self
    }
}
