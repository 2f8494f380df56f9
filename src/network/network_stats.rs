use std::time::Duration;

/// The `NetworkStats` struct contains statistics about the current session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Frame packets handed to the datagram socket, resends included.
    pub packets_sent: u64,
    /// Frame packets received.
    pub packets_received: u64,
    /// Remote inputs that advanced the confirmed frontier.
    pub inputs_accepted: u64,
    /// Remote inputs dropped as duplicates or as ahead of the next expected frame.
    ///
    /// With redundancy every received packet repeats frames already seen, so this grows
    /// steadily on a healthy link.
    pub inputs_ignored: u64,
    /// Window resends performed while stalled.
    pub resends: u64,
    /// Commands written to the command stream.
    pub commands_sent: u64,
    /// Commands read from the command stream.
    pub commands_received: u64,
    /// Distinct stall episodes.
    pub stalls: u64,
    /// How long the current stall has lasted; zero when not stalled.
    pub current_stall: Duration,
}

impl NetworkStats {
    /// Creates a new `NetworkStats` instance with default values.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            packets_sent,
            packets_received,
            inputs_accepted,
            inputs_ignored,
            resends,
            commands_sent,
            commands_received,
            stalls,
            current_stall,
        } = self;

        write!(
            f,
            "NetworkStats {{ packets: {}/{} (sent/recv), inputs: {} accepted, {} ignored, resends: {}, commands: {}/{}, stalls: {}",
            packets_sent,
            packets_received,
            inputs_accepted,
            inputs_ignored,
            resends,
            commands_sent,
            commands_received,
            stalls
        )?;
        if !current_stall.is_zero() {
            write!(f, ", stalled for {}ms", current_stall.as_millis())?;
        }
        write!(f, " }}")
    }
}
