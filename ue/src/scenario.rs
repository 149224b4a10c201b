//! Dual-Connectivity Scenario
//!
//! Drives one UE through attach on the primary leg, attachment of both
//! secondary legs, and a burst of downlink traffic split across the legs
//! with random delay and loss. The radio legs are simulated: protocol
//! entities post requests to a shared outbox, and the scenario turns each
//! request into scheduler events.

use bytes::Bytes;
use common::sim::{Scheduler, TimerId};
use common::types::{CellId, Lcid, Rnti};
use common::utils::throughput_mbps;
use common::utils::time::format_sim_time;
use interfaces::{
    AsSapProvider, LowerLayer, PdcpHeader, PdcpPdu, PdcpPduType, ReceivePdcpSduParameters,
    RrcConnectionReconfiguration, TransmitPdcpPduParameters, UpperLayer,
};
use layers::nas::{NasState, UeNas};
use layers::pdcp::{PdcpStats, UePdcp, UplinkLeg};
use layers::{LayerError, ProtocolLayer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{LegConfig, ScenarioConfig};

const DATA_LCID: Lcid = Lcid(3);

/// Radio legs of the UE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LegId {
    Primary,
    FirstSecondary,
    SecondSecondary,
}

impl LegId {
    const ALL: [LegId; 3] = [LegId::Primary, LegId::FirstSecondary, LegId::SecondSecondary];

    fn index(self) -> usize {
        self as usize
    }

    fn uplink(self) -> UplinkLeg {
        match self {
            LegId::Primary => UplinkLeg::Primary,
            LegId::FirstSecondary => UplinkLeg::Secondary,
            LegId::SecondSecondary => UplinkLeg::AdditionalSecondary,
        }
    }
}

/// Requests posted by the protocol entities to the simulated radio
#[derive(Debug)]
enum LegRequest {
    CampOn(LegId, CellId),
    Connect(LegId),
    Disconnect(LegId),
    UplinkData { leg: LegId, bid: u8, packet: Bytes },
    UplinkPdu(LegId, TransmitPdcpPduParameters),
    Delivered(ReceivePdcpSduParameters),
    DualConnected(Rnti, Rnti),
    Reconfiguration(LegId, RrcConnectionReconfiguration),
}

type Outbox = Rc<RefCell<Vec<LegRequest>>>;

/// Access stratum of one simulated leg
struct SimRrc {
    leg: LegId,
    outbox: Outbox,
}

impl AsSapProvider for SimRrc {
    fn start_cell_selection(&mut self, earfcn: common::types::Earfcn) {
        debug!("{:?} leg cell selection on EARFCN {}", self.leg, earfcn.0);
    }

    fn force_camped_on_enb(&mut self, cell_id: CellId, _earfcn: common::types::Earfcn) {
        self.outbox.borrow_mut().push(LegRequest::CampOn(self.leg, cell_id));
    }

    fn connect(&mut self) {
        self.outbox.borrow_mut().push(LegRequest::Connect(self.leg));
    }

    fn send_data(&mut self, packet: Bytes, bid: u8) {
        self.outbox
            .borrow_mut()
            .push(LegRequest::UplinkData {
                leg: self.leg,
                bid,
                packet,
            });
    }

    fn disconnect(&mut self) {
        self.outbox.borrow_mut().push(LegRequest::Disconnect(self.leg));
    }

    fn set_csg_white_list(&mut self, csg_id: u32) {
        debug!("{:?} leg CSG white list {}", self.leg, csg_id);
    }

    fn set_additional_leg(&mut self, additional: bool) {
        debug!("{:?} leg additional: {}", self.leg, additional);
    }

    fn notify_dual_secondary_connected(
        &mut self,
        first_rnti: Rnti,
        second_rnti: Rnti,
        _first_cell: CellId,
        _second_cell: CellId,
    ) {
        self.outbox
            .borrow_mut()
            .push(LegRequest::DualConnected(first_rnti, second_rnti));
    }

    fn send_rrc_reconfiguration(&mut self, msg: RrcConnectionReconfiguration) {
        self.outbox
            .borrow_mut()
            .push(LegRequest::Reconfiguration(self.leg, msg));
    }
}

/// RLC entity of one simulated leg
struct SimRlc {
    leg: LegId,
    outbox: Outbox,
}

impl LowerLayer for SimRlc {
    fn transmit_to_lower_layer(&mut self, params: TransmitPdcpPduParameters) {
        self.outbox
            .borrow_mut()
            .push(LegRequest::UplinkPdu(self.leg, params));
    }
}

/// Receiver of SDUs leaving PDCP
struct PdcpSduSink {
    outbox: Outbox,
}

impl UpperLayer for PdcpSduSink {
    fn deliver_to_upper_layer(&mut self, params: ReceivePdcpSduParameters) {
        self.outbox.borrow_mut().push(LegRequest::Delivered(params));
    }
}

/// Scheduler events of the scenario
#[derive(Debug)]
pub enum Event {
    Timer(TimerId),
    ConnectOutcome(LegId),
    AttachSecondary,
    Downlink(PdcpPdu),
    TrafficTick,
    StatsSample,
}

impl From<TimerId> for Event {
    fn from(timer: TimerId) -> Self {
        Event::Timer(timer)
    }
}

#[derive(Debug, Default)]
struct LegCounters {
    connect_attempts: u32,
    connected: bool,
    camped: Option<CellId>,
    downlink_sent: u64,
    downlink_lost: u64,
    uplink_pdus: u64,
    uplink_bytes: u64,
}

/// Per-leg part of the run summary
#[derive(Debug, Clone, Serialize)]
pub struct LegSummary {
    pub leg: LegId,
    pub cell_id: u16,
    pub connected: bool,
    pub connect_attempts: u32,
    pub downlink_sent: u64,
    pub downlink_lost: u64,
    pub uplink_pdus: u64,
    pub uplink_bytes: u64,
}

/// Outcome of a run, printed as JSON
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    pub imsi: String,
    pub simulated_time_ms: u64,
    pub final_state: NasState,
    pub transitions: Vec<(NasState, NasState)>,
    pub dual_connected: bool,
    pub pdcp: PdcpStats,
    pub delivered_in_order: bool,
    pub app_rx_packets: u64,
    pub uplink_sent: u64,
    pub uplink_rejected: u64,
    pub leg_skew: Option<i64>,
    pub throughput_mbps: Vec<f64>,
    pub legs: Vec<LegSummary>,
}

/// One UE with its three simulated legs
pub struct Scenario {
    config: ScenarioConfig,
    sched: Scheduler<Event>,
    nas: UeNas,
    pdcp: UePdcp,
    outbox: Outbox,
    rng: StdRng,
    legs: [LegCounters; 3],
    transitions: Rc<RefCell<Vec<(NasState, NasState)>>>,
    app_rx: Rc<Cell<u64>>,
    last_delivered: Option<u64>,
    delivered_in_order: bool,
    dl_tx_sn: u32,
    dl_sent: u32,
    traffic_started: bool,
    uplink_sent: u64,
    uplink_rejected: u64,
    dual_connected: bool,
    throughput: Vec<f64>,
}

impl Scenario {
    pub fn new(config: ScenarioConfig) -> Result<Self, LayerError> {
        let outbox: Outbox = Rc::new(RefCell::new(Vec::new()));

        let mut nas = UeNas::new(config.nas.clone())?;
        nas.set_as_sap_provider(Box::new(SimRrc {
            leg: LegId::Primary,
            outbox: outbox.clone(),
        }));
        nas.set_secondary_as_sap_provider(
            layers::nas::SecondarySlot::First,
            Box::new(SimRrc {
                leg: LegId::FirstSecondary,
                outbox: outbox.clone(),
            }),
        );
        nas.set_secondary_as_sap_provider(
            layers::nas::SecondarySlot::Second,
            Box::new(SimRrc {
                leg: LegId::SecondSecondary,
                outbox: outbox.clone(),
            }),
        );

        let transitions = Rc::new(RefCell::new(Vec::new()));
        let recorded = transitions.clone();
        nas.on_state_transition(move |old, new| recorded.borrow_mut().push((old, new)));

        let app_rx = Rc::new(Cell::new(0u64));
        let counter = app_rx.clone();
        nas.set_forward_up_callback(move |_packet| counter.set(counter.get() + 1));
        nas.set_context_setup_callback(|bid, bearer, tft| {
            info!(
                "Bearer {} set up: QCI {} ({} filters)",
                bid,
                bearer.qci.0,
                tft.filters.len()
            );
        });

        for bearer in &config.bearers {
            nas.activate_eps_bearer(bearer.bearer, bearer.template())?;
        }

        let mut pdcp = UePdcp::new(
            config.pdcp.clone(),
            config.primary.rnti(),
            DATA_LCID,
            Box::new(PdcpSduSink {
                outbox: outbox.clone(),
            }),
        )?;
        pdcp.set_lower_layer(
            UplinkLeg::Primary,
            Box::new(SimRlc {
                leg: LegId::Primary,
                outbox: outbox.clone(),
            }),
        );
        pdcp.set_always_primary_uplink(nas.always_primary_uplink());
        pdcp.initialize()?;

        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            sched: Scheduler::new(),
            nas,
            pdcp,
            outbox,
            rng,
            legs: Default::default(),
            transitions,
            app_rx,
            last_delivered: None,
            delivered_in_order: true,
            dl_tx_sn: 0,
            dl_sent: 0,
            traffic_started: false,
            uplink_sent: 0,
            uplink_rejected: 0,
            dual_connected: false,
            throughput: Vec::new(),
        })
    }

    fn leg_config(&self, leg: LegId) -> &LegConfig {
        match leg {
            LegId::Primary => &self.config.primary,
            LegId::FirstSecondary => &self.config.first_secondary,
            LegId::SecondSecondary => &self.config.second_secondary,
        }
    }

    /// Run to the configured end time
    pub fn run(mut self) -> Result<ScenarioSummary, LayerError> {
        let end = Duration::from_millis(self.config.duration_ms);
        let primary = self.config.primary.clone();
        info!(
            "IMSI {} attaching to cell {} for {}",
            self.nas.imsi(),
            primary.cell(),
            format_sim_time(end)
        );

        self.nas
            .connect_mc(primary.cell(), primary.earfcn(), self.config.second_secondary.cell())?;
        self.process_outbox()?;
        self.sched.schedule(
            Duration::from_millis(self.config.stats_period_ms),
            Event::StatsSample,
        );

        while let Some((_, event)) = self.sched.pop_until(end) {
            self.handle(event)?;
            self.process_outbox()?;
        }

        self.pdcp.shutdown(&mut self.sched)?;
        info!("Scenario finished at {}", format_sim_time(self.sched.now()));
        Ok(self.summary())
    }

    fn handle(&mut self, event: Event) -> Result<(), LayerError> {
        match event {
            Event::Timer(TimerId::PdcpReordering { .. }) => {
                self.pdcp.on_reordering_timer_expired(&mut self.sched)
            }
            Event::Timer(TimerId::NasConnectRetry) => self.nas.on_retry_timer(),
            Event::ConnectOutcome(leg) => self.connect_outcome(leg),
            Event::AttachSecondary => self.nas.notify_connect_to_secondary(
                self.config.first_secondary.cell(),
                self.config.second_secondary.cell(),
            ),
            Event::Downlink(pdu) => self.pdcp.receive_pdu(pdu, &mut self.sched),
            Event::TrafficTick => {
                self.traffic_tick();
                Ok(())
            }
            Event::StatsSample => {
                let period = Duration::from_millis(self.config.stats_period_ms);
                let bytes = self.pdcp.sample_delivered_bytes();
                let mbps = throughput_mbps(bytes, period);
                debug!("PDCP throughput {:.2} Mbps at {}", mbps, format_sim_time(self.sched.now()));
                self.throughput.push(mbps);
                self.sched.schedule(period, Event::StatsSample);
                Ok(())
            }
        }
    }

    fn connect_outcome(&mut self, leg: LegId) -> Result<(), LayerError> {
        let config = self.leg_config(leg).clone();
        let counters = &mut self.legs[leg.index()];
        if counters.connect_attempts <= config.failed_connects {
            warn!("{:?} leg connection attempt {} failed", leg, counters.connect_attempts);
            return match leg {
                LegId::Primary => self.nas.notify_connection_failed(&mut self.sched),
                _ => {
                    self.sched.schedule(
                        Duration::from_millis(config.connect_latency_ms),
                        Event::AttachSecondary,
                    );
                    Ok(())
                }
            };
        }

        counters.connected = true;
        info!("{:?} leg connected to cell {} as {}", leg, config.cell(), config.rnti());
        self.nas.notify_connection_successful(config.rnti())?;

        match leg {
            LegId::Primary => {
                if self.nas.state() == NasState::Active {
                    self.sched
                        .schedule(Duration::from_millis(10), Event::AttachSecondary);
                }
            }
            LegId::FirstSecondary | LegId::SecondSecondary => {
                self.pdcp.set_lower_layer(
                    leg.uplink(),
                    Box::new(SimRlc {
                        leg,
                        outbox: self.outbox.clone(),
                    }),
                );
                if leg == LegId::FirstSecondary {
                    self.pdcp.switch_connection(true);
                    self.sched
                        .schedule(Duration::from_millis(10), Event::AttachSecondary);
                }
                if !self.traffic_started {
                    self.traffic_started = true;
                    self.sched.schedule_now(Event::TrafficTick);
                }
            }
        }
        Ok(())
    }

    fn connected_secondaries(&self) -> Vec<LegId> {
        [LegId::FirstSecondary, LegId::SecondSecondary]
            .into_iter()
            .filter(|leg| self.legs[leg.index()].connected)
            .collect()
    }

    fn traffic_tick(&mut self) {
        if self.dl_sent >= self.config.traffic.packets {
            return;
        }
        self.dl_sent += 1;
        self.send_downlink();
        if self.config.traffic.uplink {
            self.send_uplink();
        }
        self.sched.schedule(
            Duration::from_millis(self.config.traffic.interval_ms),
            Event::TrafficTick,
        );
    }

    fn send_downlink(&mut self) {
        let secondaries = self.connected_secondaries();
        let leg = if !secondaries.is_empty() && self.rng.gen_bool(self.config.traffic.secondary_share) {
            secondaries[self.rng.gen_range(0..secondaries.len())]
        } else {
            LegId::Primary
        };

        let sn = self.dl_tx_sn;
        self.dl_tx_sn = self.pdcp.sn_space().next_sn(sn);
        let config = self.leg_config(leg).clone();
        let counters = &mut self.legs[leg.index()];
        counters.downlink_sent += 1;

        if self.rng.gen_bool(config.loss_probability) {
            counters.downlink_lost += 1;
            debug!("Downlink SN {} lost on {:?} leg", sn, leg);
            return;
        }

        let delay = Duration::from_millis(self.rng.gen_range(config.min_delay_ms..=config.max_delay_ms));
        let pdu = PdcpPdu {
            header: PdcpHeader {
                pdu_type: PdcpPduType::Data,
                sn,
                source_cell: Some(config.cell()),
            },
            tx_time: self.sched.now(),
            payload: Bytes::from(vec![(sn & 0xff) as u8; self.config.traffic.packet_size]),
        };
        self.sched.schedule(delay, Event::Downlink(pdu));
    }

    fn send_uplink(&mut self) {
        let packet = ipv4_udp_packet(
            [7, 0, 0, 2],
            [1, 0, 0, 2],
            49153,
            self.config.traffic.uplink_port,
            self.config.traffic.packet_size,
        );
        if self.nas.send(packet) {
            self.uplink_sent += 1;
        } else {
            self.uplink_rejected += 1;
        }
    }

    /// Turn entity requests into scheduler events until none are left
    fn process_outbox(&mut self) -> Result<(), LayerError> {
        loop {
            let requests: Vec<LegRequest> = self.outbox.borrow_mut().drain(..).collect();
            if requests.is_empty() {
                return Ok(());
            }
            for request in requests {
                self.apply(request)?;
            }
        }
    }

    fn apply(&mut self, request: LegRequest) -> Result<(), LayerError> {
        match request {
            LegRequest::CampOn(leg, cell) => {
                debug!("{:?} leg camped on cell {}", leg, cell);
                self.legs[leg.index()].camped = Some(cell);
            }
            LegRequest::Connect(leg) => {
                let latency = Duration::from_millis(self.leg_config(leg).connect_latency_ms);
                self.legs[leg.index()].connect_attempts += 1;
                self.sched.schedule(latency, Event::ConnectOutcome(leg));
            }
            LegRequest::Disconnect(leg) => {
                self.legs[leg.index()].connected = false;
            }
            LegRequest::UplinkData { leg, bid, packet } => {
                let selected = self.pdcp.select_uplink_leg();
                if selected != leg.uplink() {
                    return Err(LayerError::InvalidState(format!(
                        "NAS sent bearer {} on {:?} leg but PDCP selects {:?}",
                        bid, leg, selected
                    )));
                }
                self.pdcp.transmit_sdu(packet, self.sched.now())?;
                debug!("Uplink packet on bearer {} sent over {:?} leg", bid, leg);
            }
            LegRequest::UplinkPdu(leg, params) => {
                let counters = &mut self.legs[leg.index()];
                counters.uplink_pdus += 1;
                counters.uplink_bytes += params.pdu.payload.len() as u64;
            }
            LegRequest::Delivered(params) => {
                if self.last_delivered.map_or(false, |last| params.count <= last) {
                    warn!("COUNT {} delivered after {:?}", params.count, self.last_delivered);
                    self.delivered_in_order = false;
                }
                self.last_delivered = Some(params.count);
                self.nas.recv_data(params.sdu);
            }
            LegRequest::DualConnected(first, second) => {
                info!("Primary leg informed of secondary legs {} and {}", first, second);
                self.dual_connected = true;
            }
            LegRequest::Reconfiguration(leg, msg) => {
                debug!("{:?} leg received reconfiguration {}", leg, msg.transaction_id);
            }
        }
        Ok(())
    }

    fn summary(&self) -> ScenarioSummary {
        let legs = LegId::ALL
            .iter()
            .map(|&leg| {
                let counters = &self.legs[leg.index()];
                LegSummary {
                    leg,
                    cell_id: counters.camped.map_or(self.leg_config(leg).cell_id, |c| c.0),
                    connected: counters.connected,
                    connect_attempts: counters.connect_attempts,
                    downlink_sent: counters.downlink_sent,
                    downlink_lost: counters.downlink_lost,
                    uplink_pdus: counters.uplink_pdus,
                    uplink_bytes: counters.uplink_bytes,
                }
            })
            .collect();

        ScenarioSummary {
            imsi: self.nas.imsi().to_string(),
            simulated_time_ms: self.sched.now().as_millis() as u64,
            final_state: self.nas.state(),
            transitions: self.transitions.borrow().clone(),
            dual_connected: self.dual_connected,
            pdcp: self.pdcp.stats().clone(),
            delivered_in_order: self.delivered_in_order,
            app_rx_packets: self.app_rx.get(),
            uplink_sent: self.uplink_sent,
            uplink_rejected: self.uplink_rejected,
            leg_skew: self.pdcp.leg_skew().map(|(_, _, skew)| skew),
            throughput_mbps: self.throughput.clone(),
            legs,
        }
    }
}

/// IPv4/UDP packet with a zeroed payload
fn ipv4_udp_packet(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, size: usize) -> Bytes {
    let size = size.max(28);
    let mut p = vec![0u8; size];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&(size as u16).to_be_bytes());
    p[8] = 64;
    p[9] = 17;
    p[12..16].copy_from_slice(&src);
    p[16..20].copy_from_slice(&dst);
    p[20..22].copy_from_slice(&sport.to_be_bytes());
    p[22..24].copy_from_slice(&dport.to_be_bytes());
    p[24..26].copy_from_slice(&((size - 20) as u16).to_be_bytes());
    Bytes::from(p)
}
