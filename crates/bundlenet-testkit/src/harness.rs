//! Scripted contact schedules.
//!
//! A [`Scenario`] replays a list of [`Step`]s over a [`TestNet`]: endpoints
//! queue data and meet the backend or a relay, relays meet the backend.
//! After [`Scenario::settle`] every endpoint has talked to the backend
//! directly, and [`Scenario::check_delivery`] asserts that everything sent
//! arrived once and in order.

use anyhow::{bail, ensure, Context};

use bundlenet::{ExchangeOptions, ExchangeReport, Node};
use bundlenet_store::MemoryStore;
use bundlenet_sync::MemoryTransport;

use crate::fixtures::{endpoints, TestNet};

/// One event in a schedule. Indices pick endpoints and relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send {
        endpoint: usize,
        app: &'static str,
        data: Vec<u8>,
    },
    /// The endpoint reaches the backend itself.
    Direct { endpoint: usize },
    /// The endpoint meets a relay.
    ViaRelay { endpoint: usize, relay: usize },
    /// A relay meets the backend.
    RelaySync { relay: usize },
}

pub struct Scenario {
    pub net: TestNet,
    pub endpoints: Vec<Node<MemoryStore>>,
    pub relays: Vec<(Node<MemoryStore>, MemoryTransport)>,
    sent: Vec<Vec<(&'static str, Vec<u8>)>>,
}

impl Scenario {
    pub fn new(endpoint_count: usize, relay_count: usize) -> Self {
        let net = TestNet::new();
        let endpoints = endpoints(&net, endpoint_count);
        let relays = (0..relay_count).map(|i| net.relay(0x40 + i as u8)).collect();
        Self {
            net,
            endpoints,
            relays,
            sent: vec![Vec::new(); endpoint_count],
        }
    }

    fn endpoint(&self, index: usize) -> anyhow::Result<&Node<MemoryStore>> {
        self.endpoints
            .get(index)
            .with_context(|| format!("no endpoint {index}"))
    }

    fn relay(&self, index: usize) -> anyhow::Result<&(Node<MemoryStore>, MemoryTransport)> {
        self.relays
            .get(index)
            .with_context(|| format!("no relay {index}"))
    }

    /// Run `steps` in order, failing on the first exchange that does not
    /// complete.
    pub async fn run(&mut self, steps: &[Step]) -> anyhow::Result<Vec<ExchangeReport>> {
        let backend = self.net.backend_peer();
        let mut reports = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            let report = match step {
                Step::Send { endpoint, app, data } => {
                    self.endpoint(*endpoint)?
                        .send(&backend, app, data.clone())
                        .await
                        .with_context(|| format!("step {i}: send"))?;
                    self.sent[*endpoint].push((*app, data.clone()));
                    continue;
                }
                Step::Direct { endpoint } => {
                    self.endpoint(*endpoint)?
                        .exchange(&self.net.backend_link, &backend, ExchangeOptions::default())
                        .await?
                }
                Step::ViaRelay { endpoint, relay } => {
                    let (_, link) = self.relay(*relay)?;
                    self.endpoint(*endpoint)?
                        .exchange(link, &backend, ExchangeOptions::default())
                        .await?
                }
                Step::RelaySync { relay } => {
                    let (node, _) = self.relay(*relay)?;
                    node.sync_relay(&self.net.backend_link, ExchangeOptions::default())
                        .await?
                }
            };
            if !report.is_complete() {
                bail!("step {i} ({step:?}) ended {:?}: {:?}", report.state, report.error);
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Let every endpoint exchange directly with the backend until nothing
    /// it sent is left unacknowledged.
    pub async fn settle(&mut self) -> anyhow::Result<()> {
        let steps: Vec<Step> = (0..self.endpoints.len())
            .flat_map(|endpoint| [Step::Direct { endpoint }, Step::Direct { endpoint }])
            .collect();
        self.run(&steps).await?;
        let backend = self.net.backend_peer();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            let pending = endpoint.pending(&backend).await?;
            ensure!(pending.is_empty(), "endpoint {i} still has {} unacked bundles", pending.len());
        }
        Ok(())
    }

    /// Everything each endpoint sent was delivered exactly once, in order
    /// per application.
    pub fn check_delivery(&self) -> anyhow::Result<()> {
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            let delivered: Vec<(String, Vec<u8>)> = self
                .net
                .inbox
                .lock()
                .map_err(|_| anyhow::anyhow!("inbox poisoned"))?
                .iter()
                .filter(|adu| adu.peer == endpoint.peer_id())
                .map(|adu| (adu.app.to_string(), adu.data.to_vec()))
                .collect();
            let mut apps: Vec<&str> = self.sent[i].iter().map(|(app, _)| *app).collect();
            apps.sort_unstable();
            apps.dedup();
            for app in apps {
                let sent: Vec<&Vec<u8>> = self.sent[i]
                    .iter()
                    .filter(|(a, _)| *a == app)
                    .map(|(_, data)| data)
                    .collect();
                let got: Vec<&Vec<u8>> = delivered
                    .iter()
                    .filter(|(a, _)| a == app)
                    .map(|(_, data)| data)
                    .collect();
                ensure!(sent == got, "endpoint {i} app {app}: sent {sent:?}, delivered {got:?}");
            }
            let total: usize = self.sent[i].len();
            ensure!(
                delivered.len() == total,
                "endpoint {i}: {} delivered for {total} sent",
                delivered.len()
            );
        }
        Ok(())
    }
}
