//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. Media tasks, the punch
//! engine and the STUN client all take a clone; the handles inside are
//! reference counted, so incrementing from several tasks is cheap.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9300`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Call setup
    pub stun_requests_total: IntCounter,
    pub stun_failures_total: IntCounter,
    pub punch_probes_sent_total: IntCounter,
    pub calls_active: IntGauge,

    // Video
    pub video_fragments_sent_total: IntCounter,
    pub video_fragments_received_total: IntCounter,
    pub video_frames_delivered_total: IntCounter,
    pub video_frames_dropped_total: IntCounter,
    pub video_pending_assemblies: IntGauge,

    // Audio
    pub audio_chunks_sent_total: IntCounter,
    pub audio_chunks_received_total: IntCounter,
    pub audio_chunks_overflow_total: IntCounter,
    pub audio_chunks_played_total: IntCounter,
    pub jitter_buffer_occupancy_chunks: IntGauge,

    // Shared
    pub malformed_datagrams_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,

    // Latency histograms (seconds)
    pub stun_round_trip_seconds: Histogram,
    pub punch_duration_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("peercall".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let histogram = |name: &str, help: &str| -> Result<Histogram> {
            let h = Histogram::with_opts(HistogramOpts::new(name, help))?;
            registry.register(Box::new(h.clone()))?;
            Ok(h)
        };

        Ok(Self {
            stun_requests_total: counter("stun_requests_total", "STUN Binding Requests sent")?,
            stun_failures_total: counter(
                "stun_failures_total",
                "STUN discoveries that timed out or got a malformed response",
            )?,
            punch_probes_sent_total: counter(
                "punch_probes_sent_total",
                "Hole-punching probe datagrams sent",
            )?,
            calls_active: gauge("calls_active", "Calls currently in the ACTIVE state")?,

            video_fragments_sent_total: counter(
                "video_fragments_sent_total",
                "Video fragments sent",
            )?,
            video_fragments_received_total: counter(
                "video_fragments_received_total",
                "Well-formed video fragments received",
            )?,
            video_frames_delivered_total: counter(
                "video_frames_delivered_total",
                "Reassembled video frames handed to the decoder",
            )?,
            video_frames_dropped_total: counter(
                "video_frames_dropped_total",
                "Video frames discarded as late, stale or evicted",
            )?,
            video_pending_assemblies: gauge(
                "video_pending_assemblies",
                "Video frames currently being reassembled",
            )?,

            audio_chunks_sent_total: counter("audio_chunks_sent_total", "Audio chunks sent")?,
            audio_chunks_received_total: counter(
                "audio_chunks_received_total",
                "Audio chunks accepted into the jitter buffer",
            )?,
            audio_chunks_overflow_total: counter(
                "audio_chunks_overflow_total",
                "Audio chunks dropped because the jitter buffer was full",
            )?,
            audio_chunks_played_total: counter(
                "audio_chunks_played_total",
                "Audio chunks handed to playback",
            )?,
            jitter_buffer_occupancy_chunks: gauge(
                "jitter_buffer_occupancy_chunks",
                "Current jitter buffer occupancy in chunks",
            )?,

            malformed_datagrams_total: counter(
                "malformed_datagrams_total",
                "Inbound media datagrams rejected as malformed",
            )?,
            bytes_sent_total: counter("bytes_sent_total", "Media bytes sent")?,
            bytes_received_total: counter("bytes_received_total", "Media bytes received")?,

            stun_round_trip_seconds: histogram(
                "stun_round_trip_seconds",
                "Time from Binding Request to accepted response (seconds)",
            )?,
            punch_duration_seconds: histogram(
                "punch_duration_seconds",
                "Time until the first inbound datagram during punching (seconds)",
            )?,

            registry,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// Callers decide whether to run it; the binaries do so only when
    /// `--metrics-bind` is given.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::bind(&cfg.bind).serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn metrics_context_gathers_something() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let families = ctx.gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn metrics_carry_namespace_and_process_label() {
        // ---
        let ctx = MetricsContext::new("callee").expect("MetricsContext should init");
        ctx.video_frames_delivered_total.inc();

        let family = ctx
            .gather()
            .into_iter()
            .find(|f| f.get_name() == "peercall_video_frames_delivered_total")
            .expect("delivered counter registered");
        let metric = &family.get_metric()[0];
        assert_eq!(metric.get_counter().get_value(), 1.0);
        assert!(metric
            .get_label()
            .iter()
            .any(|l| l.get_name() == "process" && l.get_value() == "callee"));
    }

    #[test]
    fn independent_contexts_do_not_collide() {
        // ---
        let a = MetricsContext::new("a").unwrap();
        let b = MetricsContext::new("b").unwrap();
        a.audio_chunks_sent_total.inc();
        assert_eq!(b.audio_chunks_sent_total.get(), 0);
    }
}
