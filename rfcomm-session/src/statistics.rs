//! Session statistics collection

/// RFCOMM session statistics
///
/// Tracks various metrics for session monitoring and debugging.
///
/// # Usage
/// Statistics are automatically updated by the session during operation.
/// Users can query statistics at any time through the session handle.
#[derive(Debug, Clone, Default)]
pub struct SessionStatistics {
    /// Total number of frames sent
    pub frames_sent: u64,
    /// Total number of frames received
    pub frames_received: u64,
    /// Number of inbound frames rejected as malformed
    pub frames_rejected: u64,
    /// Number of FCS (Frame Check Sequence) errors
    pub fcs_errors: u64,
    /// Number of command timeout events
    pub timeouts: u64,
    /// Number of multiplexer commands sent on the control channel
    pub mux_commands_sent: u64,
    /// Number of multiplexer commands received on the control channel
    pub mux_commands_received: u64,
    /// Number of user-data frames queued while waiting for credits
    pub frames_queued_on_credits: u64,
    /// Number of empty frames sent purely to replenish the peer's credits
    pub credit_replenishments_sent: u64,
    /// Total user-data payload bytes sent
    pub bytes_sent: u64,
    /// Total user-data payload bytes received
    pub bytes_received: u64,
}

impl SessionStatistics {
    /// Create new statistics with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all statistics counters
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn increment_frames_sent(&mut self) {
        self.frames_sent += 1;
    }

    pub fn increment_frames_received(&mut self) {
        self.frames_received += 1;
    }

    pub fn increment_frames_rejected(&mut self) {
        self.frames_rejected += 1;
    }

    pub fn increment_fcs_errors(&mut self) {
        self.fcs_errors += 1;
    }

    pub fn increment_timeouts(&mut self) {
        self.timeouts += 1;
    }

    pub fn increment_mux_commands_sent(&mut self) {
        self.mux_commands_sent += 1;
    }

    pub fn increment_mux_commands_received(&mut self) {
        self.mux_commands_received += 1;
    }

    pub fn increment_frames_queued_on_credits(&mut self) {
        self.frames_queued_on_credits += 1;
    }

    pub fn increment_credit_replenishments_sent(&mut self) {
        self.credit_replenishments_sent += 1;
    }

    pub fn add_bytes_sent(&mut self, count: usize) {
        self.bytes_sent += count as u64;
    }

    pub fn add_bytes_received(&mut self, count: usize) {
        self.bytes_received += count as u64;
    }

    /// Get error rate as a percentage
    ///
    /// Calculates the percentage of frames that were rejected or failed the
    /// FCS check. Returns 0.0 if no frames have been exchanged.
    pub fn error_rate(&self) -> f64 {
        let total_errors = self.frames_rejected + self.fcs_errors;
        let total_frames = self.frames_received + self.frames_sent;
        if total_frames == 0 {
            0.0
        } else {
            (total_errors as f64 / total_frames as f64) * 100.0
        }
    }
}
