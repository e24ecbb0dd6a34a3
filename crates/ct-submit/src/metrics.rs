//! Prometheus metrics for the writer.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub submissions: IntCounterVec,
    pub dedupe_hits: IntCounter,
    pub batches_committed: IntCounter,
    pub entries_sequenced: IntCounter,
    pub tree_size: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let submissions = IntCounterVec::new(
            Opts::new("ct_submissions_total", "Submissions by endpoint and outcome"),
            &["endpoint", "outcome"],
        )
        .expect("submissions counter");
        let dedupe_hits = IntCounter::with_opts(Opts::new(
            "ct_dedupe_hits_total",
            "Submissions answered from the dedupe index",
        ))
        .expect("dedupe counter");
        let batches_committed = IntCounter::with_opts(Opts::new(
            "ct_batches_committed_total",
            "Batches fully committed by stage 2",
        ))
        .expect("batches counter");
        let entries_sequenced = IntCounter::with_opts(Opts::new(
            "ct_entries_sequenced_total",
            "Leaves assigned an index by stage 1",
        ))
        .expect("entries counter");
        let tree_size = IntGauge::with_opts(Opts::new(
            "ct_tree_size",
            "Tree size of the most recent signed tree head",
        ))
        .expect("tree size gauge");

        for collector in [
            Box::new(submissions.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(dedupe_hits.clone()),
            Box::new(batches_committed.clone()),
            Box::new(entries_sequenced.clone()),
            Box::new(tree_size.clone()),
        ] {
            registry.register(collector).expect("register metric");
        }

        Self {
            registry,
            submissions,
            dedupe_hits,
            batches_committed,
            entries_sequenced,
            tree_size,
        }
    }

    pub fn gather_text(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .expect("encode metrics");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
