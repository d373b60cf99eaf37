use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{broadcast::error::RecvError, watch, Mutex},
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

use super::{
    channel::AddHtlcCommand,
    config::{LightningConfig, DEFAULT_FINAL_CLTV_EXPIRY_DELTA},
    events::{EventBus, HtlcResolution, WalletEvent},
    graph::{PathFindError, Route},
    trampoline::TrampolineRouter,
    types::{Hash256, Pubkey},
    wire::OnionPacket,
};
use crate::{
    invoice::{Invoice, InvoiceError},
    now_timestamp_as_millis_u64,
    store::{GraphStore, PaymentStore, StoreError},
    tasks::TaskTrackerWithCancellation,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Insufficient balance: requested {requested} msat, available {available} msat")]
    InsufficientBalance { requested: u64, available: u64 },
    #[error("Can not pay ourselves")]
    SelfPayment,
    #[error("Invoice error: {0}")]
    Invoice(#[from] InvoiceError),
    #[error("Route error: {0}")]
    Route(#[from] PathFindError),
    #[error("Payment preparation timed out")]
    Timeout,
    #[error("Failed to dispatch HTLC: {0}")]
    DispatchFailed(String),
    #[error("Payment session ended without a result")]
    SessionAborted,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartOutcome {
    Pending,
    Fulfilled(Hash256),
    Failed(String),
}

impl PartOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, PartOutcome::Pending)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentFailureReason {
    /// Every part failed, or the ones left pending failed after some were fulfilled.
    AllPartsFailed,
    /// The deadline passed with the total still unmet.
    Timeout,
    /// The session stopped tracking its parts, e.g. on shutdown.
    Aborted,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    InFlight,
    Succeeded,
    Failed(PaymentFailureReason),
}

impl PaymentStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, PaymentStatus::InFlight)
    }
}

#[derive(Clone, Debug)]
pub enum PaymentRequest {
    Invoice(Invoice),
    Manual {
        destination: Pubkey,
        amount_msat: u64,
        payment_hash: Hash256,
        payment_secret: Option<Hash256>,
        final_cltv_delta: u16,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedPart {
    pub part_id: u64,
    /// Amount this part delivers to the recipient.
    pub amount_msat: u64,
    pub route: Route,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedPayment {
    pub payment_hash: Hash256,
    pub payment_secret: Option<Hash256>,
    pub destination: Pubkey,
    pub total_amount_msat: u64,
    pub parts: Vec<PreparedPart>,
    pub fee_estimate_msat: u64,
    pub final_cltv_delta: u16,
    /// How long the payment session waits for its parts to resolve.
    pub timeout: Duration,
    /// Milliseconds since the epoch after which the routes should be recomputed.
    pub expires_at: u64,
}

impl PreparedPayment {
    pub fn is_multi_part(&self) -> bool {
        self.parts.len() > 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPart {
    pub part_id: u64,
    pub amount_msat: u64,
    pub fee_msat: u64,
    pub first_hop: Option<Pubkey>,
    pub channel_id: Option<Hash256>,
    pub htlc_id: Option<u64>,
    pub outcome: PartOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentResult {
    pub payment_hash: Hash256,
    pub status: PaymentStatus,
    pub preimage: Option<Hash256>,
    pub fee_paid_msat: u64,
    pub parts: Vec<PaymentPart>,
}

/// What is persisted about a payment, updated on every status change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_hash: Hash256,
    pub total_amount_msat: u64,
    pub status: PaymentStatus,
    pub preimage: Option<Hash256>,
    pub fee_paid_msat: u64,
    pub overpaid_msat: u64,
    pub parts: Vec<PaymentPart>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PaymentRecord {
    pub fn to_result(&self) -> PaymentResult {
        PaymentResult {
            payment_hash: self.payment_hash,
            status: self.status,
            preimage: self.preimage,
            fee_paid_msat: self.fee_paid_msat,
            parts: self.parts.clone(),
        }
    }
}

/// Outcome bookkeeping of one payment split into any number of parts.
///
/// The payment succeeds as soon as the fulfilled parts add up to the total. Fulfilled
/// parts can never be undone since the preimage is already revealed, so parts settling
/// after that point are only recorded. It fails once every part is resolved with the
/// total unmet, or when the deadline passes first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MppSession {
    pub payment_hash: Hash256,
    pub total_amount_msat: u64,
    pub parts: Vec<PaymentPart>,
    pub status: PaymentStatus,
    pub preimage: Option<Hash256>,
    pub fulfilled_msat: u64,
    /// Fulfilled amount beyond the total.
    pub overpaid_msat: u64,
    pub created_at: u64,
}

impl MppSession {
    pub fn new(payment_hash: Hash256, total_amount_msat: u64, parts: Vec<PaymentPart>) -> Self {
        Self {
            payment_hash,
            total_amount_msat,
            parts,
            status: PaymentStatus::InFlight,
            preimage: None,
            fulfilled_msat: 0,
            overpaid_msat: 0,
            created_at: now_timestamp_as_millis_u64(),
        }
    }

    pub fn from_prepared(prepared: &PreparedPayment) -> Self {
        let parts = prepared
            .parts
            .iter()
            .map(|part| PaymentPart {
                part_id: part.part_id,
                amount_msat: part.amount_msat,
                fee_msat: part.route.fee_msat,
                first_hop: part.route.first_hop(),
                channel_id: None,
                htlc_id: None,
                outcome: PartOutcome::Pending,
            })
            .collect();
        Self::new(prepared.payment_hash, prepared.total_amount_msat, parts)
    }

    pub fn expected_parts(&self) -> usize {
        self.parts.len()
    }

    pub fn all_resolved(&self) -> bool {
        self.parts.iter().all(|p| !p.outcome.is_pending())
    }

    pub fn part_for_htlc(&self, channel_id: &Hash256, htlc_id: u64) -> Option<u64> {
        self.parts
            .iter()
            .find(|p| p.channel_id.as_ref() == Some(channel_id) && p.htlc_id == Some(htlc_id))
            .map(|p| p.part_id)
    }

    pub fn set_dispatched(&mut self, part_id: u64, channel_id: Hash256, htlc_id: u64) {
        if let Some(part) = self.parts.iter_mut().find(|p| p.part_id == part_id) {
            part.channel_id = Some(channel_id);
            part.htlc_id = Some(htlc_id);
        }
    }

    /// Record the outcome of a part. Returns the new status when it changed.
    pub fn on_part_resolved(&mut self, part_id: u64, outcome: PartOutcome) -> Option<PaymentStatus> {
        let part = self
            .parts
            .iter_mut()
            .find(|p| p.part_id == part_id && p.outcome.is_pending())?;
        part.outcome = outcome.clone();
        let amount_msat = part.amount_msat;

        if let PartOutcome::Fulfilled(preimage) = outcome {
            self.fulfilled_msat += amount_msat;
            self.preimage.get_or_insert(preimage);
            if self.fulfilled_msat > self.total_amount_msat {
                self.overpaid_msat = self.fulfilled_msat - self.total_amount_msat;
                warn!(
                    "Payment {:?} overpaid by {} msat",
                    self.payment_hash, self.overpaid_msat
                );
            }
        }

        match self.status {
            PaymentStatus::InFlight if self.fulfilled_msat >= self.total_amount_msat => {
                self.status = PaymentStatus::Succeeded;
                Some(self.status)
            }
            PaymentStatus::InFlight if self.all_resolved() => {
                self.status = PaymentStatus::Failed(PaymentFailureReason::AllPartsFailed);
                Some(self.status)
            }
            _ => None,
        }
    }

    pub fn on_timeout(&mut self) -> Option<PaymentStatus> {
        self.fail_if_in_flight(PaymentFailureReason::Timeout)
    }

    pub fn fail_if_in_flight(&mut self, reason: PaymentFailureReason) -> Option<PaymentStatus> {
        if self.status != PaymentStatus::InFlight {
            return None;
        }
        self.status = PaymentStatus::Failed(reason);
        Some(self.status)
    }

    pub fn fee_paid_msat(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| matches!(p.outcome, PartOutcome::Fulfilled(_)))
            .map(|p| p.fee_msat)
            .sum()
    }

    pub fn to_result(&self) -> PaymentResult {
        PaymentResult {
            payment_hash: self.payment_hash,
            status: self.status,
            preimage: self.preimage,
            fee_paid_msat: self.fee_paid_msat(),
            parts: self.parts.clone(),
        }
    }

    pub fn to_record(&self) -> PaymentRecord {
        PaymentRecord {
            payment_hash: self.payment_hash,
            total_amount_msat: self.total_amount_msat,
            status: self.status,
            preimage: self.preimage,
            fee_paid_msat: self.fee_paid_msat(),
            overpaid_msat: self.overpaid_msat,
            parts: self.parts.clone(),
            created_at: self.created_at,
            updated_at: now_timestamp_as_millis_u64(),
        }
    }
}

/// Liquidity we can send through one of our channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundLiquidity {
    pub peer: Pubkey,
    pub channel_id: Hash256,
    pub available_msat: u64,
}

#[async_trait]
pub trait HtlcDispatcher: Send + Sync {
    async fn outbound_liquidity(&self) -> Vec<OutboundLiquidity>;

    /// Offer an HTLC on one of our channels with `first_hop`. Returns the channel id and
    /// the id of the new HTLC.
    async fn dispatch_htlc(
        &self,
        first_hop: Pubkey,
        command: AddHtlcCommand,
    ) -> Result<(Hash256, u64), PaymentError>;
}

pub trait OnionBuilder: Send + Sync {
    fn build_onion(
        &self,
        route: &Route,
        payment_hash: &Hash256,
        payment_secret: Option<&Hash256>,
        total_amount_msat: u64,
        cltv_expiry: u32,
    ) -> Result<OnionPacket, PaymentError>;
}

/// Sends an all-zero onion, for peers that settle payments addressed to themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlankOnionBuilder;

impl OnionBuilder for BlankOnionBuilder {
    fn build_onion(
        &self,
        _route: &Route,
        _payment_hash: &Hash256,
        _payment_secret: Option<&Hash256>,
        _total_amount_msat: u64,
        _cltv_expiry: u32,
    ) -> Result<OnionPacket, PaymentError> {
        Ok(OnionPacket::blank())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaymentSettings {
    pub timeout: Duration,
    pub max_parts: usize,
}

impl From<&LightningConfig> for PaymentSettings {
    fn from(config: &LightningConfig) -> Self {
        Self {
            timeout: config.payment_timeout(),
            max_parts: config.max_payment_parts(),
        }
    }
}

/// `n` near-equal amounts adding up to `amount_msat`.
pub fn split_amount(amount_msat: u64, n: usize) -> Vec<u64> {
    let n = n.max(1) as u64;
    let base = amount_msat / n;
    let remainder = amount_msat % n;
    (0..n).map(|i| base + u64::from(i < remainder)).collect()
}

/// Whether every amount fits into one of the channels, each channel's liquidity being
/// shared by the amounts placed on it.
fn fits_into_channels(amounts: &[u64], channels: &[u64]) -> bool {
    let mut amounts = amounts.to_vec();
    amounts.sort_unstable_by(|a, b| b.cmp(a));
    let mut remaining = channels.to_vec();
    amounts.into_iter().all(|amount| {
        match remaining.iter_mut().filter(|r| **r >= amount).max() {
            Some(slot) => {
                *slot -= amount;
                true
            }
            None => false,
        }
    })
}

type SessionMap = Arc<Mutex<HashMap<Hash256, watch::Receiver<Option<PaymentResult>>>>>;

struct SessionContext<S> {
    store: S,
    dispatcher: Arc<dyn HtlcDispatcher>,
    onion_builder: Arc<dyn OnionBuilder>,
    events: EventBus,
    block_height: watch::Receiver<u32>,
    sessions: SessionMap,
}

impl<S> SessionContext<S>
where
    S: PaymentStore + Send + Sync + 'static,
{
    fn persist(&self, session: &MppSession) {
        if let Err(err) = self.store.save_payment(&session.to_record()) {
            error!(
                "Failed to persist payment {:?}: {}",
                session.payment_hash, err
            );
        }
    }

    fn resolve_part(
        &self,
        session: &mut MppSession,
        part_id: u64,
        outcome: PartOutcome,
        result: &watch::Sender<Option<PaymentResult>>,
    ) {
        let changed = session.on_part_resolved(part_id, outcome.clone());
        self.events.emit(WalletEvent::PaymentPartCompleted {
            payment_hash: session.payment_hash,
            part_id,
            outcome,
        });
        match changed {
            Some(status) => self.publish(session, status, result),
            None => self.persist(session),
        }
    }

    fn publish(
        &self,
        session: &MppSession,
        status: PaymentStatus,
        result: &watch::Sender<Option<PaymentResult>>,
    ) {
        info!("Payment {:?} finished: {:?}", session.payment_hash, status);
        self.persist(session);
        result.send_replace(Some(session.to_result()));
        self.events.emit(WalletEvent::PaymentCompleted {
            payment_hash: session.payment_hash,
            status,
        });
    }

    async fn run(self, prepared: PreparedPayment, result: watch::Sender<Option<PaymentResult>>) {
        let payment_hash = prepared.payment_hash;
        // Subscribe before any HTLC goes out so that no resolution is missed.
        let mut events = self.events.subscribe();
        let deadline = Instant::now() + prepared.timeout;
        let mut session = MppSession::from_prepared(&prepared);
        self.persist(&session);

        let height = *self.block_height.borrow();
        for part in &prepared.parts {
            let cltv_expiry = height + part.route.cltv_expiry_delta;
            let dispatched = match part.route.first_hop() {
                Some(first_hop) => match self.onion_builder.build_onion(
                    &part.route,
                    &payment_hash,
                    prepared.payment_secret.as_ref(),
                    prepared.total_amount_msat,
                    cltv_expiry,
                ) {
                    Ok(onion) => {
                        self.dispatcher
                            .dispatch_htlc(
                                first_hop,
                                AddHtlcCommand {
                                    amount_msat: part.route.total_amount_msat(),
                                    payment_hash,
                                    cltv_expiry,
                                    onion_packet: Some(onion),
                                },
                            )
                            .await
                    }
                    Err(err) => Err(err),
                },
                None => Err(PaymentError::DispatchFailed("empty route".to_string())),
            };
            match dispatched {
                Ok((channel_id, htlc_id)) => {
                    debug!(
                        "Part {} of payment {:?} is HTLC {} on channel {:?}",
                        part.part_id, payment_hash, htlc_id, channel_id
                    );
                    session.set_dispatched(part.part_id, channel_id, htlc_id);
                }
                Err(err) => {
                    warn!(
                        "Failed to dispatch part {} of payment {:?}: {}",
                        part.part_id, payment_hash, err
                    );
                    self.resolve_part(
                        &mut session,
                        part.part_id,
                        PartOutcome::Failed(err.to_string()),
                        &result,
                    );
                }
            }
        }
        self.persist(&session);

        while !session.all_resolved() {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    if let Some(status) = session.on_timeout() {
                        warn!("Payment {:?} timed out", payment_hash);
                        self.publish(&session, status, &result);
                    }
                    break;
                }
                event = events.recv() => match event {
                    Ok(WalletEvent::HtlcResolved { channel_id, htlc_id, payment_hash: hash, resolution })
                        if hash == payment_hash =>
                    {
                        let Some(part_id) = session.part_for_htlc(&channel_id, htlc_id) else {
                            continue;
                        };
                        let outcome = match resolution {
                            HtlcResolution::Fulfilled { preimage } => PartOutcome::Fulfilled(preimage),
                            HtlcResolution::Failed { reason } => PartOutcome::Failed(reason),
                        };
                        self.resolve_part(&mut session, part_id, outcome, &result);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Payment {:?} missed {} events", payment_hash, skipped);
                    }
                    Err(RecvError::Closed) => {
                        if let Some(status) = session.fail_if_in_flight(PaymentFailureReason::Aborted) {
                            self.publish(&session, status, &result);
                        }
                        break;
                    }
                },
            }
        }
        self.sessions.lock().await.remove(&payment_hash);
    }
}

/// Drives payments from preparation to their final result.
pub struct PaymentSessionManager<S, G> {
    local_pubkey: Pubkey,
    store: S,
    router: Arc<TrampolineRouter<G>>,
    dispatcher: Arc<dyn HtlcDispatcher>,
    onion_builder: Arc<dyn OnionBuilder>,
    events: EventBus,
    block_height: watch::Receiver<u32>,
    settings: PaymentSettings,
    sessions: SessionMap,
    tracker: TaskTrackerWithCancellation,
}

impl<S, G> PaymentSessionManager<S, G>
where
    S: PaymentStore + Clone + Send + Sync + 'static,
    G: GraphStore + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_pubkey: Pubkey,
        store: S,
        router: Arc<TrampolineRouter<G>>,
        dispatcher: Arc<dyn HtlcDispatcher>,
        onion_builder: Arc<dyn OnionBuilder>,
        events: EventBus,
        block_height: watch::Receiver<u32>,
        settings: PaymentSettings,
        tracker: TaskTrackerWithCancellation,
    ) -> Self {
        Self {
            local_pubkey,
            store,
            router,
            dispatcher,
            onion_builder,
            events,
            block_height,
            settings,
            sessions: Default::default(),
            tracker,
        }
    }

    /// Resolve the request into routes without touching any channel. Fails with
    /// [`PaymentError::Timeout`] when route computation outlasts `timeout`, which
    /// also becomes the timeout of the payment session.
    pub async fn prepare_payment(
        &self,
        request: PaymentRequest,
        timeout: Option<Duration>,
    ) -> Result<PreparedPayment, PaymentError> {
        let timeout = timeout.unwrap_or(self.settings.timeout);
        tokio::time::timeout(timeout, self.prepare(request, timeout))
            .await
            .map_err(|_| PaymentError::Timeout)?
    }

    async fn prepare(
        &self,
        request: PaymentRequest,
        timeout: Duration,
    ) -> Result<PreparedPayment, PaymentError> {
        let (destination, amount_msat, payment_hash, payment_secret, final_cltv_delta) =
            match request {
                PaymentRequest::Invoice(invoice) => {
                    if invoice.is_expired() {
                        return Err(InvoiceError::Expired.into());
                    }
                    let amount_msat = invoice.amount_msat().ok_or(InvoiceError::MissingAmount)?;
                    (
                        invoice.payee()?,
                        amount_msat,
                        invoice.payment_hash(),
                        Some(invoice.payment_secret()),
                        u16::try_from(invoice.min_final_cltv_expiry_delta()).unwrap_or(u16::MAX),
                    )
                }
                PaymentRequest::Manual {
                    destination,
                    amount_msat,
                    payment_hash,
                    payment_secret,
                    final_cltv_delta,
                } => (
                    destination,
                    amount_msat,
                    payment_hash,
                    payment_secret,
                    if final_cltv_delta == 0 {
                        DEFAULT_FINAL_CLTV_EXPIRY_DELTA
                    } else {
                        final_cltv_delta
                    },
                ),
            };
        if amount_msat == 0 {
            return Err(PaymentError::InvalidAmount(
                "amount must be greater than zero".to_string(),
            ));
        }
        if destination == self.local_pubkey {
            return Err(PaymentError::SelfPayment);
        }

        let liquidity = self.dispatcher.outbound_liquidity().await;
        let total_available: u64 = liquidity.iter().map(|l| l.available_msat).sum();
        if amount_msat > total_available {
            return Err(PaymentError::InsufficientBalance {
                requested: amount_msat,
                available: total_available,
            });
        }

        let mut last_error = None;
        for n in 1..=self.settings.max_parts.max(1) {
            let amounts = split_amount(amount_msat, n);
            if amounts.iter().any(|a| *a == 0) {
                break;
            }
            let mut routes: HashMap<u64, Route> = HashMap::new();
            let mut failed = false;
            for amount in &amounts {
                if routes.contains_key(amount) {
                    continue;
                }
                match self
                    .router
                    .find_route(destination, *amount, final_cltv_delta)
                    .await
                {
                    Ok(route) => {
                        routes.insert(*amount, route);
                    }
                    Err(err) => {
                        last_error = Some(PaymentError::Route(err));
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                continue;
            }
            let parts: Vec<PreparedPart> = amounts
                .iter()
                .enumerate()
                .map(|(i, amount)| PreparedPart {
                    part_id: i as u64,
                    amount_msat: *amount,
                    route: routes[amount].clone(),
                })
                .collect();
            let Some(first_hop) = parts[0].route.first_hop() else {
                continue;
            };
            let channels: Vec<u64> = liquidity
                .iter()
                .filter(|l| l.peer == first_hop)
                .map(|l| l.available_msat)
                .collect();
            let totals: Vec<u64> = parts.iter().map(|p| p.route.total_amount_msat()).collect();
            if !fits_into_channels(&totals, &channels) {
                last_error = Some(PaymentError::InsufficientBalance {
                    requested: totals.iter().sum(),
                    available: channels.iter().sum(),
                });
                continue;
            }
            let prepared = PreparedPayment {
                payment_hash,
                payment_secret,
                destination,
                total_amount_msat: amount_msat,
                fee_estimate_msat: parts.iter().map(|p| p.route.fee_msat).sum(),
                parts,
                final_cltv_delta,
                timeout,
                expires_at: now_timestamp_as_millis_u64() + timeout.as_millis() as u64,
            };
            debug!(
                "Prepared payment {:?} of {} msat in {} parts, fee estimate {} msat",
                payment_hash,
                amount_msat,
                prepared.parts.len(),
                prepared.fee_estimate_msat
            );
            return Ok(prepared);
        }
        Err(last_error.unwrap_or(PaymentError::Route(PathFindError::NoRouteFound(destination))))
    }

    /// Send a prepared payment and wait for its result. Sending a payment hash that is
    /// already in flight joins the existing session, and sending one that already
    /// succeeded returns the stored result.
    pub async fn send(&self, prepared: PreparedPayment) -> Result<PaymentResult, PaymentError> {
        let payment_hash = prepared.payment_hash;
        let mut receiver = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&payment_hash) {
                Some(receiver) => {
                    debug!("Joining in-flight payment {:?}", payment_hash);
                    receiver.clone()
                }
                None => {
                    if let Some(record) = self.store.find_payment(&payment_hash)? {
                        if record.status == PaymentStatus::Succeeded {
                            return Ok(record.to_result());
                        }
                    }
                    let (sender, receiver) = watch::channel(None);
                    sessions.insert(payment_hash, receiver.clone());
                    let context = SessionContext {
                        store: self.store.clone(),
                        dispatcher: Arc::clone(&self.dispatcher),
                        onion_builder: Arc::clone(&self.onion_builder),
                        events: self.events.clone(),
                        block_height: self.block_height.clone(),
                        sessions: Arc::clone(&self.sessions),
                    };
                    info!(
                        "Sending payment {:?} of {} msat in {} parts",
                        payment_hash,
                        prepared.total_amount_msat,
                        prepared.parts.len()
                    );
                    self.tracker.spawn(context.run(prepared, sender));
                    receiver
                }
            }
        };
        let result = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| PaymentError::SessionAborted)?;
        result.clone().ok_or(PaymentError::SessionAborted)
    }

    pub async fn is_in_flight(&self, payment_hash: &Hash256) -> bool {
        self.sessions.lock().await.contains_key(payment_hash)
    }

    pub fn get_payment(&self, payment_hash: &Hash256) -> Result<Option<PaymentRecord>, PaymentError> {
        Ok(self.store.find_payment(payment_hash)?)
    }

    pub fn list_payments(&self) -> Result<Vec<PaymentRecord>, PaymentError> {
        Ok(self.store.find_all_payments()?)
    }
}
