use std::{path::PathBuf, time::Duration};

use clap_serde_derive::{
    clap::{self},
    ClapSerde,
};

use super::types::NodeAddress;

/// Maximal number of simultaneously connected peers.
pub const DEFAULT_MAX_PEERS: usize = 8;

/// Timeout of a connection attempt (TCP connect plus noise handshake), in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Gossip entries not refreshed within this many seconds are pruned. 24 hours.
pub const DEFAULT_GOSSIP_STALENESS_SECONDS: u64 = 24 * 60 * 60;

/// Below this many nodes the local graph is considered too sparse for local pathfinding.
pub const DEFAULT_MIN_GRAPH_NODES: usize = 10;

/// Below this many channels the local graph is considered too sparse for local pathfinding.
pub const DEFAULT_MIN_GRAPH_CHANNELS: usize = 20;

pub const DEFAULT_TRAMPOLINE_ENABLED: bool = true;
pub const DEFAULT_TRAMPOLINE_FORCED: bool = false;

/// Maximal fee paid to trampoline nodes, as a percentage of the amount.
pub const DEFAULT_MAX_TRAMPOLINE_FEE_PERCENT: f64 = 1.0;

/// Maximal number of trampoline hops in one route.
pub const DEFAULT_MAX_TRAMPOLINE_HOPS: usize = 2;

pub const DEFAULT_TRAMPOLINE_FEE_BASE_MSAT: u64 = 1_000;
pub const DEFAULT_TRAMPOLINE_FEE_PROPORTIONAL_MILLIONTHS: u64 = 500;
pub const DEFAULT_TRAMPOLINE_CLTV_EXPIRY_DELTA: u16 = 288;

pub const DEFAULT_PING_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_PONG_TIMEOUT_SECONDS: u64 = 10;

/// Consecutive unanswered pings after which a peer is disconnected.
pub const DEFAULT_MAX_MISSED_PINGS: u32 = 3;

/// A payment which is not complete after this many seconds is marked as failed.
pub const DEFAULT_PAYMENT_TIMEOUT_SECONDS: u64 = 60;

/// The maximum number of parts for a multi-part payment.
pub const DEFAULT_MAX_PAYMENT_PARTS: usize = 8;
pub const PAYMENT_MAX_PARTS_LIMIT: usize = 32;

/// Minimal funding amount of a channel, in satoshis.
pub const DEFAULT_MIN_FUNDING_AMOUNT_SAT: u64 = 1_000;

/// Maximal funding amount of a channel, in satoshis. Without `option_support_large_channel`
/// BOLT 2 requires the funding to stay below 2^24 satoshis.
pub const DEFAULT_MAX_FUNDING_AMOUNT_SAT: u64 = (1 << 24) - 1;

/// Minimal `to_self_delay` we accept for either side, in blocks.
pub const DEFAULT_MIN_TO_SELF_DELAY: u16 = 144;

/// Maximal `to_self_delay` we accept from the remote party, in blocks. 2 weeks.
pub const DEFAULT_MAX_TO_SELF_DELAY: u16 = 2016;

pub const DEFAULT_DUST_LIMIT_SAT: u64 = 354;

pub const DEFAULT_AUTO_ACCEPT_CHANNELS: bool = false;

/// CLTV delta asked for the final hop of payments we receive.
pub const DEFAULT_FINAL_CLTV_EXPIRY_DELTA: u16 = 144;

/// Per BOLT 2, the maximum number of HTLCs each side may offer.
pub const MAX_ACCEPTED_HTLCS: u16 = 483;

/// Commitment feerate of channels we open, the floor of 1 sat/vbyte.
pub const DEFAULT_COMMITMENT_FEERATE_PER_KW: u32 = 253;

// Every option is prefixed with `ln-`/`LN_` so that it can be flattened into the
// top-level argument parser next to other services without name clashes.
#[derive(ClapSerde, Debug, Clone)]
pub struct LightningConfig {
    /// lightning base directory
    #[arg(
        name = "LN_BASE_DIR",
        long = "ln-base-dir",
        env,
        help = "base directory for the lightning core [default: $BASE_DIR/lightning]"
    )]
    pub(crate) base_dir: Option<PathBuf>,

    /// address to listen on for inbound peer connections, e.g. `0.0.0.0:9735` [default: no listening]
    #[arg(name = "LN_LISTEN_ADDR", long = "ln-listen-addr", env)]
    pub listen_addr: Option<String>,

    /// maximal number of connected peers [default: 8]
    #[arg(name = "LN_MAX_PEERS", long = "ln-max-peers", env)]
    pub(crate) max_peers: Option<usize>,

    /// timeout of a connection attempt including the handshake, in milliseconds [default: 10000]
    #[arg(name = "LN_CONNECT_TIMEOUT_MS", long = "ln-connect-timeout-ms", env)]
    pub(crate) connect_timeout_ms: Option<u64>,

    /// gossip entries older than this are pruned, in seconds [default: 86400]
    #[arg(
        name = "LN_GOSSIP_STALENESS_SECONDS",
        long = "ln-gossip-staleness-seconds",
        env
    )]
    pub(crate) gossip_staleness_seconds: Option<u64>,

    /// minimal number of known nodes to use local pathfinding [default: 10]
    #[arg(name = "LN_MIN_GRAPH_NODES", long = "ln-min-graph-nodes", env)]
    pub(crate) min_graph_nodes: Option<usize>,

    /// minimal number of known channels to use local pathfinding [default: 20]
    #[arg(name = "LN_MIN_GRAPH_CHANNELS", long = "ln-min-graph-channels", env)]
    pub(crate) min_graph_channels: Option<usize>,

    /// whether trampoline routing may be used when the local graph is insufficient [default: true]
    #[arg(name = "LN_TRAMPOLINE_ENABLED", long = "ln-trampoline-enabled", env)]
    pub(crate) trampoline_enabled: Option<bool>,

    /// always route through trampoline nodes [default: false]
    #[arg(name = "LN_TRAMPOLINE_FORCED", long = "ln-trampoline-forced", env)]
    pub(crate) trampoline_forced: Option<bool>,

    /// trusted trampoline nodes, `pubkey@host:port` (separated by `,`)
    #[arg(name = "LN_TRAMPOLINE_NODES", long = "ln-trampoline-nodes", env, value_parser, num_args = 0.., value_delimiter = ',')]
    pub trampoline_nodes: Vec<String>,

    /// maximal total trampoline fee as a percentage of the amount [default: 1.0]
    #[arg(
        name = "LN_MAX_TRAMPOLINE_FEE_PERCENT",
        long = "ln-max-trampoline-fee-percent",
        env
    )]
    pub(crate) max_trampoline_fee_percent: Option<f64>,

    /// maximal number of trampoline hops [default: 2]
    #[arg(name = "LN_MAX_TRAMPOLINE_HOPS", long = "ln-max-trampoline-hops", env)]
    pub(crate) max_trampoline_hops: Option<usize>,

    /// base fee charged by the trusted trampoline nodes, in msat [default: 1000]
    #[arg(
        name = "LN_TRAMPOLINE_FEE_BASE_MSAT",
        long = "ln-trampoline-fee-base-msat",
        env
    )]
    pub(crate) trampoline_fee_base_msat: Option<u64>,

    /// proportional fee charged by the trusted trampoline nodes, in millionths [default: 500]
    #[arg(
        name = "LN_TRAMPOLINE_FEE_PROPORTIONAL_MILLIONTHS",
        long = "ln-trampoline-fee-proportional-millionths",
        env
    )]
    pub(crate) trampoline_fee_proportional_millionths: Option<u64>,

    /// cltv expiry delta required by the trusted trampoline nodes [default: 288]
    #[arg(
        name = "LN_TRAMPOLINE_CLTV_EXPIRY_DELTA",
        long = "ln-trampoline-cltv-expiry-delta",
        env
    )]
    pub(crate) trampoline_cltv_expiry_delta: Option<u16>,

    /// interval between keepalive pings, in seconds [default: 30]
    #[arg(name = "LN_PING_INTERVAL_SECONDS", long = "ln-ping-interval-seconds", env)]
    pub(crate) ping_interval_seconds: Option<u64>,

    /// time to wait for a pong, in seconds [default: 10]
    #[arg(name = "LN_PONG_TIMEOUT_SECONDS", long = "ln-pong-timeout-seconds", env)]
    pub(crate) pong_timeout_seconds: Option<u64>,

    /// consecutive missed pongs before disconnecting [default: 3]
    #[arg(name = "LN_MAX_MISSED_PINGS", long = "ln-max-missed-pings", env)]
    pub(crate) max_missed_pings: Option<u32>,

    /// payment timeout, in seconds [default: 60]
    #[arg(
        name = "LN_PAYMENT_TIMEOUT_SECONDS",
        long = "ln-payment-timeout-seconds",
        env
    )]
    pub(crate) payment_timeout_seconds: Option<u64>,

    /// maximal number of parts of a multi-part payment [default: 8]
    #[arg(name = "LN_MAX_PAYMENT_PARTS", long = "ln-max-payment-parts", env)]
    pub(crate) max_payment_parts: Option<usize>,

    /// minimal channel funding amount, in satoshis [default: 1000]
    #[arg(
        name = "LN_MIN_FUNDING_AMOUNT_SAT",
        long = "ln-min-funding-amount-sat",
        env
    )]
    pub(crate) min_funding_amount_sat: Option<u64>,

    /// maximal channel funding amount, in satoshis [default: 16777215]
    #[arg(
        name = "LN_MAX_FUNDING_AMOUNT_SAT",
        long = "ln-max-funding-amount-sat",
        env
    )]
    pub(crate) max_funding_amount_sat: Option<u64>,

    /// minimal to_self_delay, in blocks [default: 144]
    #[arg(name = "LN_MIN_TO_SELF_DELAY", long = "ln-min-to-self-delay", env)]
    pub(crate) min_to_self_delay: Option<u16>,

    /// maximal to_self_delay accepted from peers, in blocks [default: 2016]
    #[arg(name = "LN_MAX_TO_SELF_DELAY", long = "ln-max-to-self-delay", env)]
    pub(crate) max_to_self_delay: Option<u16>,

    /// dust limit of our commitment transactions, in satoshis [default: 354]
    #[arg(name = "LN_DUST_LIMIT_SAT", long = "ln-dust-limit-sat", env)]
    pub(crate) dust_limit_sat: Option<u64>,

    /// whether to accept inbound channel opening requests automatically [default: false]
    #[arg(name = "LN_AUTO_ACCEPT_CHANNELS", long = "ln-auto-accept-channels", env)]
    pub(crate) auto_accept_channels: Option<bool>,
}

impl LightningConfig {
    pub fn base_dir(&self) -> Option<&PathBuf> {
        self.base_dir.as_ref()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers.unwrap_or(DEFAULT_MAX_PEERS)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    pub fn gossip_staleness_seconds(&self) -> u64 {
        self.gossip_staleness_seconds
            .unwrap_or(DEFAULT_GOSSIP_STALENESS_SECONDS)
    }

    pub fn min_graph_nodes(&self) -> usize {
        self.min_graph_nodes.unwrap_or(DEFAULT_MIN_GRAPH_NODES)
    }

    pub fn min_graph_channels(&self) -> usize {
        self.min_graph_channels
            .unwrap_or(DEFAULT_MIN_GRAPH_CHANNELS)
    }

    pub fn trampoline_enabled(&self) -> bool {
        self.trampoline_enabled
            .unwrap_or(DEFAULT_TRAMPOLINE_ENABLED)
    }

    pub fn trampoline_forced(&self) -> bool {
        self.trampoline_forced.unwrap_or(DEFAULT_TRAMPOLINE_FORCED)
    }

    /// Trusted trampoline nodes. Entries that fail to parse are skipped with a warning.
    pub fn trampoline_nodes(&self) -> Vec<NodeAddress> {
        self.trampoline_nodes
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(err) => {
                    tracing::warn!("Ignoring invalid trampoline node {}: {}", s, err);
                    None
                }
            })
            .collect()
    }

    pub fn max_trampoline_fee_percent(&self) -> f64 {
        self.max_trampoline_fee_percent
            .unwrap_or(DEFAULT_MAX_TRAMPOLINE_FEE_PERCENT)
    }

    pub fn max_trampoline_hops(&self) -> usize {
        self.max_trampoline_hops
            .unwrap_or(DEFAULT_MAX_TRAMPOLINE_HOPS)
    }

    pub fn trampoline_fee_base_msat(&self) -> u64 {
        self.trampoline_fee_base_msat
            .unwrap_or(DEFAULT_TRAMPOLINE_FEE_BASE_MSAT)
    }

    pub fn trampoline_fee_proportional_millionths(&self) -> u64 {
        self.trampoline_fee_proportional_millionths
            .unwrap_or(DEFAULT_TRAMPOLINE_FEE_PROPORTIONAL_MILLIONTHS)
    }

    pub fn trampoline_cltv_expiry_delta(&self) -> u16 {
        self.trampoline_cltv_expiry_delta
            .unwrap_or(DEFAULT_TRAMPOLINE_CLTV_EXPIRY_DELTA)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(
            self.ping_interval_seconds
                .unwrap_or(DEFAULT_PING_INTERVAL_SECONDS),
        )
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(
            self.pong_timeout_seconds
                .unwrap_or(DEFAULT_PONG_TIMEOUT_SECONDS),
        )
    }

    pub fn max_missed_pings(&self) -> u32 {
        self.max_missed_pings.unwrap_or(DEFAULT_MAX_MISSED_PINGS)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(
            self.payment_timeout_seconds
                .unwrap_or(DEFAULT_PAYMENT_TIMEOUT_SECONDS),
        )
    }

    pub fn max_payment_parts(&self) -> usize {
        self.max_payment_parts
            .unwrap_or(DEFAULT_MAX_PAYMENT_PARTS)
            .clamp(1, PAYMENT_MAX_PARTS_LIMIT)
    }

    pub fn min_funding_amount_sat(&self) -> u64 {
        self.min_funding_amount_sat
            .unwrap_or(DEFAULT_MIN_FUNDING_AMOUNT_SAT)
    }

    pub fn max_funding_amount_sat(&self) -> u64 {
        self.max_funding_amount_sat
            .unwrap_or(DEFAULT_MAX_FUNDING_AMOUNT_SAT)
    }

    pub fn min_to_self_delay(&self) -> u16 {
        self.min_to_self_delay.unwrap_or(DEFAULT_MIN_TO_SELF_DELAY)
    }

    pub fn max_to_self_delay(&self) -> u16 {
        self.max_to_self_delay.unwrap_or(DEFAULT_MAX_TO_SELF_DELAY)
    }

    pub fn dust_limit_sat(&self) -> u64 {
        self.dust_limit_sat.unwrap_or(DEFAULT_DUST_LIMIT_SAT)
    }

    pub fn auto_accept_channels(&self) -> bool {
        self.auto_accept_channels
            .unwrap_or(DEFAULT_AUTO_ACCEPT_CHANNELS)
    }

    pub fn channel_limits(&self) -> super::channel::ChannelLimits {
        super::channel::ChannelLimits {
            min_funding_amount_sat: self.min_funding_amount_sat(),
            max_funding_amount_sat: self.max_funding_amount_sat(),
            min_to_self_delay: self.min_to_self_delay(),
            max_to_self_delay: self.max_to_self_delay(),
            dust_limit_sat: self.dust_limit_sat(),
        }
    }
}
