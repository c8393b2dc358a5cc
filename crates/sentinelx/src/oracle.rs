//! Oracle observation sources.
//!
//! The gateway decides, per monitor, whether observations come from the chain
//! (the router's `latest(bytes32)` view) or from the deterministic demo feed,
//! and hands back raw feed observations for [`crate::consensus::evaluate`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethereum_types::Address;
use thiserror::Error;
use tracing::{debug, warn};

use crate::abi::{self, decode_bool, decode_i128, decode_u64};
use crate::consensus::FeedObservation;
use crate::error::RpcError;
use crate::models::{Monitor, TelemetrySource};
use crate::rpc::EthRpcClient;

/// The router's own verdict, returned alongside the raw feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterVerdict {
    pub price: i128,
    pub safe: bool,
    pub both_fresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OracleReading {
    pub protofire: FeedObservation,
    pub dia: FeedObservation,
    pub router_verdict: Option<RouterVerdict>,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("monitor has no router address and no default router is configured")]
    RouterMissing,
    #[error("no chain RPC endpoint is configured")]
    ChainUnavailable,
    #[error("router read timed out after {0:?}")]
    Timeout(Duration),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("malformed router response: {0}")]
    Decode(String),
}

impl OracleError {
    /// Stable code recorded in error telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            OracleError::RouterMissing => "router_address_missing",
            OracleError::ChainUnavailable => "chain_unavailable",
            OracleError::Timeout(_) => "rpc_timeout",
            OracleError::Rpc(error) => error.code(),
            OracleError::Decode(_) => "router_response_invalid",
        }
    }
}

/// Live source of feed observations for an oracle key.
#[async_trait]
pub trait OracleSource: Send + Sync {
    async fn latest(&self, router: Address, oracle_key: &str) -> Result<OracleReading, OracleError>;
}

/// Reads `latest(bytes32)` from the on-chain oracle router.
pub struct RouterOracle {
    rpc: Arc<EthRpcClient>,
}

impl RouterOracle {
    pub fn new(rpc: Arc<EthRpcClient>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl OracleSource for RouterOracle {
    async fn latest(&self, router: Address, oracle_key: &str) -> Result<OracleReading, OracleError> {
        let calldata = abi::router_latest_calldata(oracle_key);
        let output = self.rpc.eth_call(router, &calldata).await?;
        decode_latest(&output)
    }
}

/// Decode `(int256 price, bool safe, bool bothFresh, int256 feedA, int256 feedB,
/// uint256 feedAUpdatedAt, uint256 feedBUpdatedAt)`.
pub fn decode_latest(output: &[u8]) -> Result<OracleReading, OracleError> {
    let field = |index: usize, name: &str| {
        abi::word(output, index)
            .ok_or_else(|| OracleError::Decode(format!("missing {name} (word {index})")))
    };
    let invalid = |name: &str| OracleError::Decode(format!("{name} out of range"));

    let price = decode_i128(field(0, "price")?).ok_or_else(|| invalid("price"))?;
    let safe = decode_bool(field(1, "safe")?).ok_or_else(|| invalid("safe"))?;
    let both_fresh = decode_bool(field(2, "bothFresh")?).ok_or_else(|| invalid("bothFresh"))?;
    let feed_a = decode_i128(field(3, "feedAPrice")?).ok_or_else(|| invalid("feedAPrice"))?;
    let feed_b = decode_i128(field(4, "feedBPrice")?).ok_or_else(|| invalid("feedBPrice"))?;
    let feed_a_at = decode_u64(field(5, "feedAUpdatedAt")?).ok_or_else(|| invalid("feedAUpdatedAt"))?;
    let feed_b_at = decode_u64(field(6, "feedBUpdatedAt")?).ok_or_else(|| invalid("feedBUpdatedAt"))?;

    Ok(OracleReading {
        protofire: FeedObservation::new(feed_a, feed_a_at),
        dia: FeedObservation::new(feed_b, feed_b_at),
        router_verdict: Some(RouterVerdict {
            price,
            safe,
            both_fresh,
        }),
    })
}

/// Deterministic synthetic feeds for environments without chain connectivity.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemoFeed;

impl DemoFeed {
    const DECIMALS: i128 = 100_000_000;

    /// Stable per-key base price between 1000 and 4999 units (8 decimals).
    pub fn base_price(oracle_key: &str) -> i128 {
        let hash = abi::oracle_key_hash(oracle_key);
        let seed = hash
            .as_bytes()
            .iter()
            .take(2)
            .fold(0i128, |acc, byte| acc * 256 + i128::from(*byte));
        (1_000 + seed % 4_000) * Self::DECIMALS
    }

    /// Both feeds fresh and a quarter of the monitor's bound apart.
    pub fn normal(monitor: &Monitor, now: u64) -> OracleReading {
        let base = Self::base_price(&monitor.oracle_key);
        let offset = base * i128::from(monitor.max_deviation_bps) / 40_000;
        OracleReading {
            protofire: FeedObservation::new(base, now),
            dia: FeedObservation::new(base + offset, now),
            router_verdict: None,
        }
    }

    /// Both feeds fresh with the second feed dropped past twice the bound.
    pub fn spike(monitor: &Monitor, now: u64) -> OracleReading {
        let base = Self::base_price(&monitor.oracle_key);
        let spike_bps = (i128::from(monitor.max_deviation_bps) * 2 + 100).min(9_999);
        OracleReading {
            protofire: FeedObservation::new(base, now),
            dia: FeedObservation::new(base - base * spike_bps / 10_000, now),
            router_verdict: None,
        }
    }
}

/// Which tenants see demo data instead of chain reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemoPolicy {
    pub enabled: bool,
    pub force_tenant: Option<String>,
}

impl DemoPolicy {
    pub fn applies_to(&self, monitor: &Monitor) -> bool {
        self.enabled || self.force_tenant.as_deref() == Some(monitor.tenant_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetched {
    pub reading: OracleReading,
    pub source: TelemetrySource,
    /// The monitor's spike window has lapsed and its flag should be cleared.
    pub spike_expired: bool,
}

pub struct OracleGateway {
    live: Option<Arc<dyn OracleSource>>,
    demo: DemoPolicy,
    default_router: Option<Address>,
    read_timeout: Duration,
}

impl OracleGateway {
    pub fn new(
        live: Option<Arc<dyn OracleSource>>,
        demo: DemoPolicy,
        default_router: Option<Address>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            live,
            demo,
            default_router,
            read_timeout,
        }
    }

    pub fn resolve_router(&self, monitor: &Monitor) -> Option<Address> {
        monitor.router.or(self.default_router)
    }

    pub fn demo_applies(&self, monitor: &Monitor) -> bool {
        self.demo.applies_to(monitor)
    }

    pub async fn fetch(&self, monitor: &Monitor, now: u64) -> Result<Fetched, OracleError> {
        let spike_expired = monitor
            .demo_spike_until
            .is_some_and(|until| until <= now);

        if !self.demo.applies_to(monitor) {
            let router = self.resolve_router(monitor).ok_or(OracleError::RouterMissing)?;
            let reading = self.read_live(router, &monitor.oracle_key).await?;
            return Ok(Fetched {
                reading,
                source: TelemetrySource::Live,
                spike_expired,
            });
        }

        if monitor.spike_active(now) {
            debug!(monitor_id = monitor.id, "serving demo spike");
            return Ok(Fetched {
                reading: DemoFeed::spike(monitor, now),
                source: TelemetrySource::Demo,
                spike_expired: false,
            });
        }

        if let (Some(router), Some(_)) = (self.resolve_router(monitor), self.live.as_ref()) {
            match self.read_live(router, &monitor.oracle_key).await {
                Ok(reading) => {
                    return Ok(Fetched {
                        reading,
                        source: TelemetrySource::Live,
                        spike_expired,
                    });
                }
                Err(error) => {
                    warn!(monitor_id = monitor.id, error = %error, "demo live read failed, using synthetic data");
                }
            }
        }

        Ok(Fetched {
            reading: DemoFeed::normal(monitor, now),
            source: TelemetrySource::Demo,
            spike_expired,
        })
    }

    async fn read_live(&self, router: Address, oracle_key: &str) -> Result<OracleReading, OracleError> {
        let live = self.live.as_ref().ok_or(OracleError::ChainUnavailable)?;
        tokio::time::timeout(self.read_timeout, live.latest(router, oracle_key))
            .await
            .map_err(|_| OracleError::Timeout(self.read_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{self, ConsensusPolicy};
    use crate::models::NewMonitor;

    fn monitor(max_deviation_bps: u32) -> Monitor {
        NewMonitor {
            tenant_id: "acme".to_owned(),
            name: "eth".to_owned(),
            guarded_contract: Address::repeat_byte(0x01),
            guardian_hub: None,
            router: None,
            oracle_key: "ETH/USD".to_owned(),
            protofire_feed: Address::repeat_byte(0x02),
            dia_feed: Address::repeat_byte(0x03),
            max_deviation_bps,
            stale_after_seconds: 300,
        }
        .into_monitor(0)
    }

    fn word_of(value: i128) -> [u8; 32] {
        let fill = if value < 0 { 0xff } else { 0x00 };
        let mut word = [fill; 32];
        if let Some(tail) = word.get_mut(16..) {
            tail.copy_from_slice(&value.to_be_bytes());
        }
        word
    }

    #[test]
    fn decodes_router_tuple() -> Result<(), OracleError> {
        let mut output = Vec::new();
        for value in [1801_i128, 1, 1, 1800, 1802, 1_000, 1_001] {
            output.extend_from_slice(&word_of(value));
        }

        let reading = decode_latest(&output)?;
        assert_eq!(reading.protofire, FeedObservation::new(1800, 1_000));
        assert_eq!(reading.dia, FeedObservation::new(1802, 1_001));
        assert_eq!(
            reading.router_verdict,
            Some(RouterVerdict {
                price: 1801,
                safe: true,
                both_fresh: true
            })
        );
        Ok(())
    }

    #[test]
    fn short_router_output_is_rejected() {
        let output = word_of(1).repeat(6);
        assert!(matches!(decode_latest(&output), Err(OracleError::Decode(_))));
    }

    #[test]
    fn demo_normal_is_safe_and_spike_is_not() {
        for bound in [1u32, 50, 150, 2_000] {
            let monitor = monitor(bound);
            let policy = ConsensusPolicy {
                max_deviation_bps: bound,
                stale_after_seconds: 300,
            };

            let normal = DemoFeed::normal(&monitor, 500);
            let verdict = consensus::evaluate(normal.protofire, normal.dia, 500, &policy);
            assert!(verdict.is_healthy(), "bound {bound}");

            let spike = DemoFeed::spike(&monitor, 500);
            let verdict = consensus::evaluate(spike.protofire, spike.dia, 500, &policy);
            assert!(!verdict.safe, "bound {bound}");
            assert!(verdict.both_fresh);
        }
    }

    #[tokio::test]
    async fn live_mode_without_router_never_reads() {
        let gateway = OracleGateway::new(None, DemoPolicy::default(), None, Duration::from_secs(1));
        let result = gateway.fetch(&monitor(50), 10).await;
        assert!(matches!(result, Err(OracleError::RouterMissing)));
    }

    #[tokio::test]
    async fn forced_tenant_gets_demo_spikes_until_expiry() -> Result<(), OracleError> {
        let gateway = OracleGateway::new(
            None,
            DemoPolicy {
                enabled: false,
                force_tenant: Some("acme".to_owned()),
            },
            None,
            Duration::from_secs(1),
        );
        let mut monitor = monitor(50);
        monitor.demo_spike_until = Some(100);

        let during = gateway.fetch(&monitor, 50).await?;
        assert_eq!(during.source, TelemetrySource::Demo);
        assert!(!during.spike_expired);
        assert_eq!(during.reading, DemoFeed::spike(&monitor, 50));

        let after = gateway.fetch(&monitor, 100).await?;
        assert!(after.spike_expired);
        assert_eq!(after.reading, DemoFeed::normal(&monitor, 100));
        Ok(())
    }
}
