//! UE Non-Access Stratum
//!
//! Attachment state machine of a dual-connectivity UE. The NAS owns the
//! access-stratum providers of the primary leg and of up to two secondary
//! legs, and is the only place that coordinates between them: legs report
//! to the NAS, and the NAS decides which other leg to tell.

pub mod state;
pub mod tft;

use bytes::Bytes;
use common::sim::{EventId, TimerId, TimerService};
use common::types::{CellId, Direction, Earfcn, HandoverCase, Imsi, Qci, Rnti};
use interfaces::{AsSapProvider, RadioResourceConfigDedicated, RrcConnectionReconfiguration};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::LayerError;
pub use state::NasState;
pub use tft::{FilterDirection, PacketFilter, TftClassifier, TrafficFlowTemplate};

/// What the NAS does after a failed connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Reconnect attempts before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Delay before each reconnect, 0 reconnects immediately
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(16),
            backoff_ms: 0,
        }
    }
}

/// NAS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NasConfig {
    pub imsi: Imsi,
    /// EPS bearer ceiling
    pub max_bearers: u8,
    pub retry: RetryPolicy,
    /// Send uplink data on the primary leg even when a secondary is up
    pub always_primary_uplink: bool,
}

impl Default for NasConfig {
    fn default() -> Self {
        Self {
            imsi: Imsi(1),
            max_bearers: 11,
            retry: RetryPolicy::default(),
            always_primary_uplink: true,
        }
    }
}

/// QoS of an EPS bearer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpsBearer {
    pub qci: Qci,
    /// Allocation and retention priority
    pub arp_priority: u8,
}

impl Default for EpsBearer {
    fn default() -> Self {
        Self {
            qci: Qci::DEFAULT,
            arp_priority: 15,
        }
    }
}

/// Which of the two secondary legs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SecondarySlot {
    /// Attached first, while the UE is `ACTIVE`
    First,
    /// Attached second, while the UE is `SECOND_ACTIVE`
    Second,
}

#[derive(Default)]
struct LegContext {
    provider: Option<Box<dyn AsSapProvider>>,
    cell: Option<CellId>,
    rnti: Option<Rnti>,
}

type StateCallback = Box<dyn FnMut(NasState, NasState)>;
type ContextSetupCallback = Box<dyn FnMut(u8, &EpsBearer, &TrafficFlowTemplate)>;
type ForwardUpCallback = Box<dyn FnMut(Bytes)>;

/// UE NAS entity
pub struct UeNas {
    config: NasConfig,
    state: NasState,
    csg_id: u32,
    primary: Option<Box<dyn AsSapProvider>>,
    primary_rnti: Option<Rnti>,
    /// Cell and carrier of the last `connect_to`, reused on retry
    target: Option<(CellId, Earfcn)>,
    dl_earfcn: Option<Earfcn>,
    first: LegContext,
    second: LegContext,
    bearers_to_be_activated: VecDeque<(EpsBearer, TrafficFlowTemplate)>,
    classifier: TftClassifier,
    bid_counter: u8,
    failed_attempts: u32,
    retry_timer: Option<EventId>,
    state_callbacks: Vec<StateCallback>,
    context_setup: Option<ContextSetupCallback>,
    forward_up: Option<ForwardUpCallback>,
}

impl UeNas {
    pub fn new(config: NasConfig) -> Result<Self, LayerError> {
        if config.max_bearers == 0 {
            return Err(LayerError::InvalidConfiguration(
                "max_bearers must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            config,
            state: NasState::Off,
            csg_id: 0,
            primary: None,
            primary_rnti: None,
            target: None,
            dl_earfcn: None,
            first: LegContext::default(),
            second: LegContext::default(),
            bearers_to_be_activated: VecDeque::new(),
            classifier: TftClassifier::new(),
            bid_counter: 0,
            failed_attempts: 0,
            retry_timer: None,
            state_callbacks: Vec::new(),
            context_setup: None,
            forward_up: None,
        })
    }

    pub fn imsi(&self) -> Imsi {
        self.config.imsi
    }

    pub fn state(&self) -> NasState {
        self.state
    }

    pub fn csg_id(&self) -> u32 {
        self.csg_id
    }

    pub fn primary_rnti(&self) -> Option<Rnti> {
        self.primary_rnti
    }

    pub fn secondary_rnti(&self, slot: SecondarySlot) -> Option<Rnti> {
        self.leg(slot).rnti
    }

    pub fn secondary_cell(&self, slot: SecondarySlot) -> Option<CellId> {
        self.leg(slot).cell
    }

    /// Bearers waiting for the UE to become `ACTIVE`
    pub fn pending_bearers(&self) -> usize {
        self.bearers_to_be_activated.len()
    }

    /// Bearer ids allocated so far
    pub fn active_bearers(&self) -> u8 {
        self.bid_counter
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Whether uplink data is pinned to the primary leg
    pub fn always_primary_uplink(&self) -> bool {
        self.config.always_primary_uplink
    }

    pub fn set_as_sap_provider(&mut self, provider: Box<dyn AsSapProvider>) {
        self.primary = Some(provider);
    }

    pub fn set_secondary_as_sap_provider(
        &mut self,
        slot: SecondarySlot,
        provider: Box<dyn AsSapProvider>,
    ) {
        self.leg_mut(slot).provider = Some(provider);
    }

    /// Observe every state transition as (old, new)
    pub fn on_state_transition(&mut self, cb: impl FnMut(NasState, NasState) + 'static) {
        self.state_callbacks.push(Box::new(cb));
    }

    /// Called once per bearer committed on entry to `ACTIVE`
    pub fn set_context_setup_callback(
        &mut self,
        cb: impl FnMut(u8, &EpsBearer, &TrafficFlowTemplate) + 'static,
    ) {
        self.context_setup = Some(Box::new(cb));
    }

    /// Receiver of downlink packets
    pub fn set_forward_up_callback(&mut self, cb: impl FnMut(Bytes) + 'static) {
        self.forward_up = Some(Box::new(cb));
    }

    fn leg(&self, slot: SecondarySlot) -> &LegContext {
        match slot {
            SecondarySlot::First => &self.first,
            SecondarySlot::Second => &self.second,
        }
    }

    fn leg_mut(&mut self, slot: SecondarySlot) -> &mut LegContext {
        match slot {
            SecondarySlot::First => &mut self.first,
            SecondarySlot::Second => &mut self.second,
        }
    }

    fn primary(&mut self) -> Result<&mut dyn AsSapProvider, LayerError> {
        match self.primary.as_deref_mut() {
            Some(primary) => Ok(primary),
            None => Err(LayerError::NoLowerLayer("primary leg".to_string())),
        }
    }

    pub fn set_csg_id(&mut self, csg_id: u32) -> Result<(), LayerError> {
        self.csg_id = csg_id;
        self.primary()?.set_csg_white_list(csg_id);
        Ok(())
    }

    pub fn start_cell_selection(&mut self, earfcn: Earfcn) -> Result<(), LayerError> {
        debug!("IMSI {} starting cell selection on EARFCN {}", self.config.imsi, earfcn.0);
        self.primary()?.start_cell_selection(earfcn);
        Ok(())
    }

    /// Connect to whatever cell the primary leg is camped on
    pub fn connect(&mut self) -> Result<(), LayerError> {
        self.primary()?.connect();
        Ok(())
    }

    /// Camp on `cell` and connect
    pub fn connect_to(&mut self, cell: CellId, earfcn: Earfcn) -> Result<(), LayerError> {
        info!("IMSI {} connecting to cell {} (EARFCN {})", self.config.imsi, cell, earfcn.0);
        self.target = Some((cell, earfcn));
        self.dl_earfcn = Some(earfcn);
        let primary = self.primary()?;
        primary.force_camped_on_enb(cell, earfcn);
        primary.connect();
        Ok(())
    }

    /// Connect the primary leg to `cell`, remembering `secondary_cell` for
    /// the secondary attachment that follows
    pub fn connect_mc(
        &mut self,
        cell: CellId,
        earfcn: Earfcn,
        secondary_cell: CellId,
    ) -> Result<(), LayerError> {
        self.connect_to(cell, earfcn)?;
        self.second.cell = Some(secondary_cell);
        Ok(())
    }

    /// Tear down the primary leg and drop any pending reconnect
    pub fn disconnect(&mut self, timers: &mut dyn TimerService) -> Result<(), LayerError> {
        self.primary()?.disconnect();
        self.stop_retrying(timers);
        self.switch_to_state(NasState::Off)
    }

    /// Queue a bearer for activation when the UE becomes `ACTIVE`
    pub fn activate_eps_bearer(
        &mut self,
        bearer: EpsBearer,
        tft: TrafficFlowTemplate,
    ) -> Result<(), LayerError> {
        if self.state == NasState::Active {
            return Err(LayerError::Unsupported(
                "bearer activation after the initial context setup".to_string(),
            ));
        }
        self.bearers_to_be_activated.push_back((bearer, tft));
        Ok(())
    }

    fn do_activate_eps_bearer(
        &mut self,
        bearer: EpsBearer,
        tft: TrafficFlowTemplate,
    ) -> Result<u8, LayerError> {
        if self.bid_counter >= self.config.max_bearers {
            return Err(LayerError::TooManyBearers(self.config.max_bearers));
        }
        self.bid_counter += 1;
        let bid = self.bid_counter;
        debug!("IMSI {} activating bearer {} ({:?})", self.config.imsi, bid, bearer.qci);
        if let Some(cb) = self.context_setup.as_mut() {
            cb(bid, &bearer, &tft);
        }
        self.classifier.add(tft, bid);
        Ok(bid)
    }

    /// Send an uplink packet. Only possible in `SECOND_ACTIVE`; returns
    /// false when the UE is not attached on two legs or no TFT matches.
    pub fn send(&mut self, packet: Bytes) -> bool {
        if self.state != NasState::SecondActive {
            warn!("IMSI {} NAS {}, discarding packet", self.config.imsi, self.state);
            return false;
        }

        let bid = self.classifier.classify(&packet, Direction::UPLINK);
        if bid == 0 {
            debug!("No TFT matches uplink packet of {} bytes", packet.len());
            return false;
        }

        let use_secondary = !self.config.always_primary_uplink && self.first.rnti.is_some();
        let provider = if use_secondary {
            self.first.provider.as_deref_mut()
        } else {
            self.primary.as_deref_mut()
        };
        match provider {
            Some(p) => {
                p.send_data(packet, bid);
                true
            }
            None => {
                warn!("No provider for the selected uplink leg");
                false
            }
        }
    }

    pub fn notify_connection_successful(&mut self, rnti: Rnti) -> Result<(), LayerError> {
        debug!("IMSI {} connection successful, rnti {} in {}", self.config.imsi, rnti, self.state);
        match self.state {
            NasState::Active => {
                self.first.rnti = Some(rnti);
                self.switch_to_state(NasState::SecondActive)
            }
            NasState::SecondActive => {
                self.second.rnti = Some(rnti);
                let first_rnti = self.first.rnti.ok_or_else(|| {
                    LayerError::InvalidState("second secondary leg before the first".to_string())
                })?;
                let first_cell = self.first.cell.unwrap_or(CellId(0));
                let second_cell = self.second.cell.unwrap_or(CellId(0));
                info!(
                    "IMSI {} attached on both secondary legs, notifying primary",
                    self.config.imsi
                );
                self.primary()?
                    .notify_dual_secondary_connected(first_rnti, rnti, first_cell, second_cell);
                Ok(())
            }
            _ => {
                self.primary_rnti = Some(rnti);
                self.failed_attempts = 0;
                self.switch_to_state(NasState::Active)
            }
        }
    }

    /// Reconnect according to the retry policy. Fails once the attempts
    /// are exhausted.
    pub fn notify_connection_failed(
        &mut self,
        timers: &mut dyn TimerService,
    ) -> Result<(), LayerError> {
        self.failed_attempts += 1;
        let cell = self.target.map_or(0, |(c, _)| c.0);
        warn!(
            "IMSI {} connection to cell {} failed (attempt {})",
            self.config.imsi, cell, self.failed_attempts
        );

        if let Some(max) = self.config.retry.max_attempts {
            if self.failed_attempts > max {
                return Err(LayerError::RetriesExhausted {
                    cell,
                    attempts: self.failed_attempts,
                });
            }
        }

        if self.config.retry.backoff_ms == 0 {
            return self.reconnect();
        }
        let pending = self.retry_timer.map_or(false, |id| timers.is_timer_pending(id));
        if !pending {
            let delay = Duration::from_millis(self.config.retry.backoff_ms);
            self.retry_timer = Some(timers.schedule_timer(delay, TimerId::NasConnectRetry));
        }
        Ok(())
    }

    /// Back-off elapsed
    pub fn on_retry_timer(&mut self) -> Result<(), LayerError> {
        if self.retry_timer.take().is_none() {
            return Ok(());
        }
        self.reconnect()
    }

    fn reconnect(&mut self) -> Result<(), LayerError> {
        match self.target {
            Some((cell, earfcn)) => self.connect_to(cell, earfcn),
            None => self.connect(),
        }
    }

    pub fn notify_connection_released(
        &mut self,
        timers: &mut dyn TimerService,
    ) -> Result<(), LayerError> {
        self.stop_retrying(timers);
        self.switch_to_state(NasState::Off)
    }

    fn stop_retrying(&mut self, timers: &mut dyn TimerService) {
        if let Some(id) = self.retry_timer.take() {
            debug!("IMSI {} cancelling pending reconnect", self.config.imsi);
            timers.cancel_timer(id);
        }
        self.failed_attempts = 0;
    }

    /// Secondary-cell handover completed on `cell` with `rnti`
    pub fn notify_handover_successful(&mut self, rnti: Rnti, cell: CellId) -> Result<(), LayerError> {
        self.second.cell = Some(cell);
        match self.state {
            NasState::Active => {
                self.primary()?.notify_secondary_cell_connected(rnti, cell);
                Ok(())
            }
            _ => self.switch_to_state(NasState::Active),
        }
    }

    /// Attach the next secondary leg: the first one from `ACTIVE`, the
    /// second one from `SECOND_ACTIVE`. When both cells are given, `cell_a`
    /// becomes the first leg's cell and `cell_b` the second's.
    pub fn notify_connect_to_secondary(
        &mut self,
        cell_a: CellId,
        cell_b: CellId,
    ) -> Result<(), LayerError> {
        if cell_a.is_valid() && cell_b.is_valid() {
            self.first.cell = Some(cell_a);
            self.second.cell = Some(cell_b);
        }

        let slot = match self.state {
            NasState::SecondActive if self.second.provider.is_some() => SecondarySlot::Second,
            NasState::Active if self.first.provider.is_some() => SecondarySlot::First,
            _ => {
                warn!(
                    "IMSI {}: cannot attach a secondary leg in {}",
                    self.config.imsi, self.state
                );
                return Ok(());
            }
        };

        let imsi = self.config.imsi;
        let earfcn = self.dl_earfcn.unwrap_or(Earfcn(0));
        let leg = self.leg_mut(slot);
        let cell = leg
            .cell
            .filter(CellId::is_valid)
            .ok_or_else(|| LayerError::InvalidState(format!("no cell for {:?} secondary leg", slot)))?;
        let Some(provider) = leg.provider.as_deref_mut() else {
            return Ok(());
        };
        info!("IMSI {} connecting {:?} secondary leg to cell {}", imsi, slot, cell);
        provider.set_additional_leg(slot == SecondarySlot::First);
        provider.force_camped_on_enb(cell, earfcn);
        provider.connect();
        Ok(())
    }

    /// Relay a secondary-cell handover to the primary leg
    pub fn notify_secondary_cell_handover_started(
        &mut self,
        old_rnti: Rnti,
        new_rnti: Rnti,
        cell: CellId,
        config: RadioResourceConfigDedicated,
    ) -> Result<(), LayerError> {
        if !cell.is_valid() {
            return Err(LayerError::InvalidState(format!("invalid cell id {}", cell)));
        }
        self.second.cell = Some(cell);
        info!("Notifying primary leg of secondary cell handover to {}", cell);
        self.primary()?
            .notify_secondary_cell_handover(old_rnti, new_rnti, cell, config);
        Ok(())
    }

    /// Route a reconfiguration relayed by the primary leg to the secondary
    /// leg it is addressed to
    pub fn recv_rrc_reconfiguration_for_handover(
        &mut self,
        mut msg: RrcConnectionReconfiguration,
    ) -> Result<(), LayerError> {
        let slot = match msg.handover_case {
            HandoverCase::FirstSecondary => SecondarySlot::First,
            HandoverCase::SecondSecondary => SecondarySlot::Second,
            HandoverCase::None => {
                debug!("Reconfiguration without handover case ignored");
                return Ok(());
            }
        };
        msg.handover_case = HandoverCase::None;
        let provider = self
            .leg_mut(slot)
            .provider
            .as_deref_mut()
            .ok_or_else(|| LayerError::NoLowerLayer(format!("{:?} secondary leg", slot)))?;
        provider.send_rrc_reconfiguration(msg);
        Ok(())
    }

    /// Downlink packet from any leg
    pub fn recv_data(&mut self, packet: Bytes) {
        if let Some(cb) = self.forward_up.as_mut() {
            cb(packet);
        }
    }

    fn switch_to_state(&mut self, new_state: NasState) -> Result<(), LayerError> {
        let old_state = self.state;
        self.state = new_state;
        info!("IMSI {} NAS {} --> {}", self.config.imsi, old_state, new_state);
        for cb in self.state_callbacks.iter_mut() {
            cb(old_state, new_state);
        }

        if new_state == NasState::Active {
            while let Some((bearer, tft)) = self.bearers_to_be_activated.pop_front() {
                self.do_activate_eps_bearer(bearer, tft)?;
            }
        }
        Ok(())
    }
}
