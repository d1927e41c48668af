/// Current network reachability, fed in from an external reachability
/// monitor. Readers never block on the signal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// No route to the backend; admission halts.
    Unreachable,
    /// WiFi or wired connectivity; full concurrency budget.
    WifiOrWired,
    /// Cellular WAN; reduced concurrency budget.
    CellularWan,
}

impl Reachability {
    /// Whether new executions may be admitted.
    #[must_use]
    pub fn is_reachable(self) -> bool {
        !matches!(self, Self::Unreachable)
    }
}

/// Engine-wide lifecycle events, broadcast to any number of subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The reachability signal changed.
    ReachabilityChanged(Reachability),
    /// `cancel_all` / `cancel_all_with_tag` cancelled one or more
    /// operations.
    OperationsCancelled,
    /// Admission was suspended (e.g. app moved to the background).
    Suspended,
    /// Admission resumed.
    Resumed,
}
