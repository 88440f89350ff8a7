//! Link tuning knobs.

use std::time::Duration;

use anyhow::{ensure, Result};
use link_wire::{CHUNK_HEADER_LEN, DEFAULT_MAX_FRAME_BODY, FRAME_HEADER_LEN};

/// Configuration shared by every session of a node
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// This node's ID
    pub node_id: u64,
    /// Use the multiplexed packet format (otherwise legacy framing)
    pub multiplexed: bool,
    /// Soft cap on the size of one assembled packet
    pub max_packet_size: usize,
    /// Multiplexed packets are padded to a multiple of this (0 disables)
    pub pad_boundary: usize,
    /// Largest frame body accepted from the wire
    pub max_frame_body: usize,
    /// Bulk chunk size
    pub chunk_size: usize,
    /// Consecutive failures of one chunk before the transfer is aborted
    pub max_chunk_attempts: u32,
    /// Credit a new outgoing transfer starts with, and the receive window
    pub initial_credit: u32,
    /// How long a queued message may wait before it expires
    pub message_ttl: Duration,
    /// Upper bound on any blocking send
    pub blocking_send_cap: Duration,
    /// Inline bulk reads that see no data for this long close the connection
    pub trailer_stall_timeout: Duration,
    /// Buffered inline bulk bytes at which reading from the socket pauses
    pub trailer_pause_threshold: usize,
    /// Buffered inline bulk bytes below which reading resumes
    pub trailer_resume_threshold: usize,
    /// First reconnect delay
    pub backoff_initial: Duration,
    /// Largest reconnect delay
    pub backoff_max: Duration,
    /// Consecutive connect failures after which a peer counts as unreachable
    pub unreachable_after_failures: u32,
    /// Period of queue expiry and idle-session eviction
    pub maintenance_interval: Duration,
    /// How long a session with nothing left to do survives
    pub idle_eviction: Duration,
    /// Requests per second this node accepts from each peer
    pub request_rate: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            multiplexed: true,
            max_packet_size: 64 * 1024,
            pad_boundary: 256,
            max_frame_body: DEFAULT_MAX_FRAME_BODY,
            chunk_size: 16 * 1024,
            max_chunk_attempts: 5,
            initial_credit: 256 * 1024,
            message_ttl: Duration::from_secs(60),
            blocking_send_cap: Duration::from_secs(5 * 60),
            trailer_stall_timeout: Duration::from_secs(5 * 60),
            trailer_pause_threshold: 1024 * 1024,
            trailer_resume_threshold: 256 * 1024,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            unreachable_after_failures: 3,
            maintenance_interval: Duration::from_secs(1),
            idle_eviction: Duration::from_secs(5 * 60),
            request_rate: 1000,
        }
    }
}

impl LinkConfig {
    /// Check that the values are consistent with each other
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_packet_size > 0, "max_packet_size must be positive");
        ensure!(
            self.max_frame_body >= FRAME_HEADER_LEN && self.max_frame_body <= DEFAULT_MAX_FRAME_BODY,
            "max_frame_body must be between {} and {}",
            FRAME_HEADER_LEN,
            DEFAULT_MAX_FRAME_BODY
        );
        ensure!(self.chunk_size > 0, "chunk_size must be positive");
        ensure!(
            2 + CHUNK_HEADER_LEN + self.chunk_size <= self.max_frame_body,
            "chunk_size {} does not fit a frame body of {}",
            self.chunk_size,
            self.max_frame_body
        );
        ensure!(
            self.pad_boundary <= self.max_frame_body,
            "pad_boundary must not exceed max_frame_body"
        );
        ensure!(self.max_chunk_attempts >= 1, "max_chunk_attempts must be at least 1");
        ensure!(self.initial_credit > 0, "initial_credit must be positive");
        ensure!(
            self.trailer_resume_threshold < self.trailer_pause_threshold,
            "trailer_resume_threshold must be below trailer_pause_threshold"
        );
        ensure!(
            self.backoff_initial <= self.backoff_max,
            "backoff_initial must not exceed backoff_max"
        );
        ensure!(
            !self.maintenance_interval.is_zero(),
            "maintenance_interval must be positive"
        );
        Ok(())
    }

    /// Wait applied to a blocking send asking for `timeout`
    pub fn blocking_wait(&self, timeout: Duration) -> Duration {
        timeout.min(self.blocking_send_cap)
    }
}
