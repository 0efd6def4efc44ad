use crate::config::MetricSpec;
use crate::flow::Flow;
use crate::label::LabelProcessor;
use moka::sync::Cache;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{MetricFamily, MetricType};
use prometheus::{IntCounter, Opts};
use std::collections::HashMap;
use std::time::Duration;

/// Separator joining rendered label values into one series cache key. Label
/// values cannot contain it, so distinct tuples never collide.
const KEY_SEP: &str = "\u{1f}";

/// One configured metric: a cache of per-label-combination counters.
///
/// Label tuples deriving from IP addresses would grow a plain counter vector
/// without bound, so each combination instead lives in a cache entry that
/// expires after one flush interval of inactivity. Applying a flow touches
/// the entry and renews its TTL; an expired combination vanishes from the
/// next scrape and starts over at zero if it reappears.
pub struct MetricEntry {
    fq_name: String,
    help: String,
    label_names: Vec<String>,
    labels: Vec<LabelProcessor>,
    desc: Desc,
    series: Cache<String, IntCounter>,
}

impl MetricEntry {
    pub fn new(prefix: &str, spec: &MetricSpec, flush_interval: Duration) -> crate::Result<Self> {
        let mut label_names = Vec::with_capacity(spec.labels.len());
        let mut labels = Vec::with_capacity(spec.labels.len());
        for label in &spec.labels {
            label_names.push(label.name.clone());
            labels.push(LabelProcessor::new(label)?);
        }

        let fq_name = format!("{}_flow_{}", prefix, spec.name);
        // the client library rejects an empty help string
        let help = if spec.description.is_empty() {
            format!("Flow traffic metric {}", spec.name)
        } else {
            spec.description.clone()
        };
        let desc = Desc::new(fq_name.clone(), help.clone(), label_names.clone(), HashMap::new())?;

        Ok(Self {
            fq_name,
            help,
            label_names,
            labels,
            desc,
            series: Cache::builder().time_to_idle(flush_interval).build(),
        })
    }

    /// Observes one flow: renders the label tuple, materializes the counter
    /// for it if needed (concurrent misses for the same tuple collapse onto
    /// one creation) and adds the flow's byte count.
    pub fn apply(&self, flow: &Flow) {
        let values: Vec<String> = self.labels.iter().map(|lp| lp.apply(flow)).collect();
        let key = values.join(KEY_SEP);
        let counter = self.series.get_with(key, || {
            let const_labels: HashMap<String, String> = self
                .label_names
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect();
            let opts = Opts::new(self.fq_name.clone(), self.help.clone())
                .const_labels(const_labels);
            IntCounter::with_opts(opts).expect("Failed to create series counter")
        });
        counter.inc_by(flow.as_u64("bytes").unwrap_or(0));
    }

    #[cfg(test)]
    pub(crate) fn series_count(&self) -> usize {
        self.series.run_pending_tasks();
        self.series.entry_count() as usize
    }

    /// Current value of the series for a rendered label tuple, without
    /// renewing its TTL. Test-only peek.
    #[cfg(test)]
    pub(crate) fn series_value(&self, values: &[&str]) -> Option<u64> {
        let key = values.join(KEY_SEP);
        self.series
            .iter()
            .find(|(k, _)| **k == key)
            .map(|(_, c)| c.get())
    }
}

impl Collector for MetricEntry {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut family = MetricFamily::new();
        family.set_name(self.fq_name.clone());
        family.set_help(self.help.clone());
        family.set_field_type(MetricType::COUNTER);
        for (_, counter) in self.series.iter() {
            for mut inner in counter.collect() {
                for metric in inner.take_metric().into_iter() {
                    family.mut_metric().push(metric);
                }
            }
        }
        vec![family]
    }
}
