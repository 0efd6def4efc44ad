use crate::config::Config;
use crate::enrich::{self, Enricher};
use crate::error::FlowMetricsError;
use crate::filter::FlowMatcher;
use crate::flow::{Flow, FlowMessage, RecordKind};
use crate::metric::MetricEntry;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts};
use std::sync::Arc;
use tracing::{info, warn};

/// The flow-processing pipeline: filters, enrichers and metric entries in
/// configured order, plus the sampler-labeled ingress/drop counters.
///
/// Built once at startup; `consume` is invoked per received record,
/// concurrently from the ingestion workers.
pub struct FlowPipeline {
    filters: Vec<FlowMatcher>,
    enrichers: Vec<(String, Box<dyn Enricher>)>,
    metrics: Vec<MetricEntry>,
    total_flows: IntCounterVec,
    dropped_flows: IntCounterVec,
    scrape_duration: Histogram,
}

impl FlowPipeline {
    pub fn from_config(cfg: &Config) -> crate::Result<Self> {
        let mut filters = Vec::with_capacity(cfg.pipeline.filter.len());
        for rule in &cfg.pipeline.filter {
            filters.push(FlowMatcher::compile(rule)?);
        }
        if !filters.is_empty() {
            info!(rules = filters.len(), "compiled filter rules");
        }

        let mut enrichers = Vec::with_capacity(cfg.pipeline.enrich.len());
        for name in &cfg.pipeline.enrich {
            let mut enricher = enrich::create(name)
                .ok_or_else(|| FlowMetricsError::UnknownEnricher(name.clone()))?;
            if let Some(opts) = cfg.extensions.get(name) {
                enricher.configure(opts)?;
            }
            info!(enricher = %name, "starting enricher");
            enricher.start()?;
            enrichers.push((name.clone(), enricher));
        }

        let flush_interval = cfg.flush_duration();
        let prefix = &cfg.pipeline.metrics.prefix;
        info!(count = cfg.pipeline.metrics.items.len(), "creating metric items");
        let mut metrics = Vec::with_capacity(cfg.pipeline.metrics.items.len());
        for spec in &cfg.pipeline.metrics.items {
            metrics.push(MetricEntry::new(prefix, spec, flush_interval)?);
        }

        let total_flows = IntCounterVec::new(
            Opts::new("total_flows", "The total number of ingested flows.")
                .namespace(prefix.clone())
                .subsystem("server"),
            &["sampler"],
        )?;
        let dropped_flows = IntCounterVec::new(
            Opts::new("dropped_flows", "The total number of dropped flows.")
                .namespace(prefix.clone())
                .subsystem("server"),
            &["sampler"],
        )?;
        let scrape_duration = Histogram::with_opts(
            HistogramOpts::new("scrape_duration_seconds", "Time spent serving one scrape.")
                .namespace(prefix.clone())
                .subsystem("server"),
        )?;

        Ok(Self {
            filters,
            enrichers,
            metrics,
            total_flows,
            dropped_flows,
            scrape_duration,
        })
    }

    /// Runs one flow through filter -> enrich -> metrics. A filtered flow
    /// increments the drop counter and short-circuits.
    pub fn process(&self, flow: &mut Flow) {
        for matcher in &self.filters {
            if matcher.matches(flow) {
                self.dropped_flows
                    .with_label_values(&[&sampler_label(flow)])
                    .inc();
                return;
            }
        }
        for (_, enricher) in &self.enrichers {
            enricher.enrich(flow);
        }
        for metric in &self.metrics {
            metric.apply(flow);
        }
    }

    /// Maps and processes one decoded record. Only NetFlow v5 records are
    /// handled; every mapped record counts towards the ingress total,
    /// dropped or not.
    pub fn consume(&self, msg: &FlowMessage) {
        if msg.kind != RecordKind::NetflowV5 {
            return;
        }
        let mut flow = Flow::from(msg);
        let sampler = msg.sampler_address.to_string();
        self.process(&mut flow);
        self.total_flows.with_label_values(&[&sampler]).inc();
    }

    /// Closes all enrichers. Close errors are reported, not propagated.
    pub fn shutdown(&self) {
        for (name, enricher) in &self.enrichers {
            if let Err(err) = enricher.close() {
                warn!(enricher = %name, error = %err, "error closing enricher");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn total_for(&self, sampler: &str) -> u64 {
        self.total_flows.with_label_values(&[sampler]).get()
    }

    #[cfg(test)]
    pub(crate) fn dropped_for(&self, sampler: &str) -> u64 {
        self.dropped_flows.with_label_values(&[sampler]).get()
    }

    #[cfg(test)]
    pub(crate) fn push_filter(&mut self, matcher: FlowMatcher) {
        self.filters.push(matcher);
    }

    #[cfg(test)]
    pub(crate) fn metric_entries(&self) -> &[MetricEntry] {
        &self.metrics
    }
}

fn sampler_label(flow: &Flow) -> String {
    flow.as_ip("sampler")
        .map(|ip| ip.to_string())
        .unwrap_or_default()
}

impl Collector for FlowPipeline {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = self.total_flows.desc();
        descs.extend(self.dropped_flows.desc());
        descs.extend(self.scrape_duration.desc());
        for metric in &self.metrics {
            descs.extend(metric.desc());
        }
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let timer = self.scrape_duration.start_timer();
        let mut families = self.total_flows.collect();
        families.extend(self.dropped_flows.collect());
        for metric in &self.metrics {
            families.extend(metric.collect());
        }
        timer.observe_duration();
        families.extend(self.scrape_duration.collect());
        families
    }
}

/// Registration handle: lets one shared pipeline act as a prometheus
/// collector without giving the registry ownership.
pub struct PipelineCollector(pub Arc<FlowPipeline>);

impl Collector for PipelineCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.0.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0.collect()
    }
}
