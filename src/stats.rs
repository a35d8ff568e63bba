//! Per-request inference statistics
//!
//! Tracks prompt size, first-token latency, and generation rate for a
//! single request. The request pool's process-wide counters live in
//! [`crate::pool`]; this type covers the lifetime of one engine handle.

use std::time::Instant;

/// Latency recorder for a single generation request
#[derive(Debug, Clone)]
pub struct InferenceStats {
    start: Instant,
    first_token: Option<Instant>,
    prompt_tokens: usize,
    output_tokens: usize,
}

impl InferenceStats {
    /// Start timing a request with a known prompt size
    #[must_use]
    pub fn new(prompt_tokens: usize) -> Self {
        Self {
            start: Instant::now(),
            first_token: None,
            prompt_tokens,
            output_tokens: 0,
        }
    }

    /// Record one generated token, stamping first-token time on the first call
    pub fn on_token(&mut self) {
        if self.first_token.is_none() {
            self.first_token = Some(Instant::now());
        }
        self.output_tokens += 1;
    }

    /// Prompt token count
    #[must_use]
    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Generated token count so far
    #[must_use]
    pub fn output_tokens(&self) -> usize {
        self.output_tokens
    }

    /// Seconds from request start to the first generated token
    #[must_use]
    pub fn first_token_latency(&self) -> f64 {
        self.first_token
            .map(|t| t.duration_since(self.start).as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Total elapsed seconds since request start
    #[must_use]
    pub fn total_time(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Generation rate in tokens/s, excluding first-token latency
    #[must_use]
    pub fn speed(&self) -> f64 {
        let generate_time = self.total_time() - self.first_token_latency();
        if self.output_tokens > 0 && generate_time > 0.0 {
            self.output_tokens as f64 / generate_time
        } else {
            0.0
        }
    }

    /// Emit the completion summary through the log sink
    pub fn log(&self) {
        tracing::info!(
            prompt_tokens = self.prompt_tokens,
            output_tokens = self.output_tokens,
            total_s = self.total_time(),
            first_token_s = self.first_token_latency(),
            tokens_per_s = self.speed(),
            "request complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_new_stats_are_zeroed() {
        let stats = InferenceStats::new(12);
        assert_eq!(stats.prompt_tokens(), 12);
        assert_eq!(stats.output_tokens(), 0);
        assert_eq!(stats.first_token_latency(), 0.0);
        assert_eq!(stats.speed(), 0.0);
    }

    #[test]
    fn test_on_token_counts() {
        let mut stats = InferenceStats::new(4);
        stats.on_token();
        stats.on_token();
        stats.on_token();
        assert_eq!(stats.output_tokens(), 3);
    }

    #[test]
    fn test_first_token_latency_is_stamped_once() {
        let mut stats = InferenceStats::new(1);
        thread::sleep(Duration::from_millis(10));
        stats.on_token();
        let first = stats.first_token_latency();
        assert!(first > 0.0);
        thread::sleep(Duration::from_millis(5));
        stats.on_token();
        // Second token does not move the first-token stamp.
        assert_eq!(stats.first_token_latency(), first);
    }

    #[test]
    fn test_speed_excludes_first_token_latency() {
        let mut stats = InferenceStats::new(1);
        stats.on_token();
        thread::sleep(Duration::from_millis(20));
        stats.on_token();
        assert!(stats.speed() > 0.0);
        assert!(stats.total_time() >= stats.first_token_latency());
    }
}
