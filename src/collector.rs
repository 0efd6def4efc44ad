use crate::config::Config;
use crate::error::FlowMetricsError;
use crate::pipeline::{FlowPipeline, PipelineCollector};
use crate::receiver::{Decoder, UdpReceiver};
use crate::telemetry::{self, TelemetryHandle};
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// The collector process: pipeline, metrics registry, flow listener and
/// telemetry endpoint wired together.
///
/// Construction compiles and starts the whole pipeline (fail-fast); `start`
/// only then opens the ingress paths, so no record is ever delivered into a
/// half-initialized pipeline.
pub struct Collector {
    config: Config,
    pipeline: Arc<FlowPipeline>,
    registry: Registry,
    ready: Arc<AtomicBool>,
    receiver: Option<UdpReceiver>,
    telemetry: Option<TelemetryHandle>,
}

impl Collector {
    pub fn new(config: Config) -> crate::Result<Self> {
        config.validate()?;
        let pipeline = Arc::new(FlowPipeline::from_config(&config)?);

        let registry = Registry::new();
        registry.register(Box::new(PipelineCollector(pipeline.clone())))?;

        Ok(Self {
            config,
            pipeline,
            registry,
            ready: Arc::new(AtomicBool::new(false)),
            receiver: None,
            telemetry: None,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<FlowPipeline> {
        &self.pipeline
    }

    /// Starts the telemetry endpoint and the flow listener, in that order,
    /// flipping the readiness gate in between.
    pub async fn start(&mut self, decoder: Arc<dyn Decoder>) -> crate::Result<()> {
        if let Some(endpoint) = &self.config.telemetry_endpoint {
            let addr: SocketAddr = endpoint.parse().map_err(|_| {
                FlowMetricsError::InvalidConfig(format!(
                    "telemetry_endpoint {endpoint:?} is not a socket address"
                ))
            })?;
            self.telemetry = Some(telemetry::spawn(
                addr,
                self.registry.clone(),
                self.ready.clone(),
            )?);
        }

        let mut receiver = UdpReceiver::bind(&self.config.flow_endpoint, self.config.workers)?;
        info!(endpoint = %self.config.flow_endpoint, "starting flow listener");

        self.ready.store(true, Ordering::Relaxed);
        receiver.start(decoder, self.pipeline.clone())?;
        self.receiver = Some(receiver);
        Ok(())
    }

    /// Stops ingestion, closes the enrichers and shuts the telemetry
    /// endpoint down, in that order.
    pub async fn stop(&mut self) {
        self.ready.store(false, Ordering::Relaxed);
        if let Some(mut receiver) = self.receiver.take() {
            receiver.shutdown();
        }
        self.pipeline.shutdown();
        if let Some(telemetry) = self.telemetry.take() {
            telemetry.stop().await;
        }
        info!("collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LabelSpec, MetricSpec, MetricsConfig, PipelineConfig};
    use crate::receiver::JsonDecoder;
    use std::collections::HashMap;

    fn config() -> Config {
        Config {
            flow_endpoint: "127.0.0.1:0".to_string(),
            telemetry_endpoint: Some("127.0.0.1:0".to_string()),
            flush_interval: 60,
            workers: 1,
            pipeline: PipelineConfig {
                filter: vec![],
                enrich: vec![],
                metrics: MetricsConfig {
                    prefix: "netflow".to_string(),
                    items: vec![MetricSpec {
                        name: "traffic_by_ip".to_string(),
                        description: "Traffic by IP address".to_string(),
                        labels: vec![LabelSpec {
                            name: "source".to_string(),
                            value: "source_ip".to_string(),
                            converter: "ipv4".to_string(),
                            on_missing: None,
                        }],
                    }],
                },
            },
            extensions: HashMap::new(),
        }
    }

    #[test]
    fn new_rejects_invalid_config() {
        let mut cfg = config();
        cfg.pipeline.metrics.prefix.clear();
        assert!(Collector::new(cfg).is_err());
    }

    #[tokio::test]
    async fn start_flips_readiness_and_stop_clears_it() {
        let mut collector = Collector::new(config()).unwrap();
        assert!(!collector.ready.load(Ordering::Relaxed));

        collector.start(Arc::new(JsonDecoder)).await.unwrap();
        assert!(collector.ready.load(Ordering::Relaxed));

        collector.stop().await;
        assert!(!collector.ready.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn start_rejects_malformed_telemetry_endpoint() {
        let mut cfg = config();
        cfg.telemetry_endpoint = Some("not-an-address".to_string());
        let mut collector = Collector::new(cfg).unwrap();
        assert!(collector.start(Arc::new(JsonDecoder)).await.is_err());
    }
}
