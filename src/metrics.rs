//! Prometheus metrics rendering
//!
//! Exposes the request-pool counters and model-load state in Prometheus
//! text format for the `/metrics` endpoint. The per-request latency
//! recorder lives in [`crate::stats`]; process-wide counters come from
//! [`crate::pool::PoolSnapshot`].

use crate::pool::PoolSnapshot;

/// Render the `/metrics` payload in Prometheus text format
#[must_use]
pub fn render_prometheus(
    pool: &PoolSnapshot,
    model_loaded: bool,
    embedding_model_loaded: bool,
) -> String {
    format!(
        "# HELP fastllm_requests_total Total number of requests processed\n\
         # TYPE fastllm_requests_total counter\n\
         fastllm_requests_total {}\n\
         \n\
         # HELP fastllm_requests_processing Number of requests currently being processed\n\
         # TYPE fastllm_requests_processing gauge\n\
         fastllm_requests_processing {}\n\
         \n\
         # HELP fastllm_requests_max Maximum number of concurrent requests\n\
         # TYPE fastllm_requests_max gauge\n\
         fastllm_requests_max {}\n\
         \n\
         # HELP fastllm_queue_size Number of requests waiting in queue\n\
         # TYPE fastllm_queue_size gauge\n\
         fastllm_queue_size {}\n\
         \n\
         # HELP fastllm_model_loaded Whether the model is loaded (1) or not (0)\n\
         # TYPE fastllm_model_loaded gauge\n\
         fastllm_model_loaded {}\n\
         \n\
         # HELP fastllm_embedding_model_loaded Whether the embedding model is loaded (1) or not (0)\n\
         # TYPE fastllm_embedding_model_loaded gauge\n\
         fastllm_embedding_model_loaded {}\n",
        pool.total_processed,
        pool.active,
        pool.max_active,
        pool.queued,
        i32::from(model_loaded),
        i32::from(embedding_model_loaded),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> PoolSnapshot {
        PoolSnapshot {
            active: 2,
            queued: 5,
            max_active: 8,
            total_processed: 41,
        }
    }

    #[test]
    fn test_all_metrics_present() {
        let text = render_prometheus(&snapshot(), true, false);
        assert!(text.contains("fastllm_requests_total 41"));
        assert!(text.contains("fastllm_requests_processing 2"));
        assert!(text.contains("fastllm_requests_max 8"));
        assert!(text.contains("fastllm_queue_size 5"));
        assert!(text.contains("fastllm_model_loaded 1"));
        assert!(text.contains("fastllm_embedding_model_loaded 0"));
    }

    #[test]
    fn test_help_and_type_lines() {
        let text = render_prometheus(&snapshot(), true, true);
        for metric in [
            "fastllm_requests_total",
            "fastllm_requests_processing",
            "fastllm_requests_max",
            "fastllm_queue_size",
            "fastllm_model_loaded",
            "fastllm_embedding_model_loaded",
        ] {
            assert!(text.contains(&format!("# HELP {metric} ")), "{metric}");
            assert!(text.contains(&format!("# TYPE {metric} ")), "{metric}");
        }
    }

    #[test]
    fn test_counter_vs_gauge_types() {
        let text = render_prometheus(&snapshot(), false, false);
        assert!(text.contains("# TYPE fastllm_requests_total counter"));
        assert!(text.contains("# TYPE fastllm_requests_processing gauge"));
        assert!(text.contains("# TYPE fastllm_queue_size gauge"));
    }
}
