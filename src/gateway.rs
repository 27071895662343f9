//! The bridge orchestrator: a single-threaded cooperative event loop
//! owning both network endpoints, the converter and the WIRES-X engine.
//!
//! One stopwatch read per iteration drives every timer. Inbound YSF
//! packets feed the WIRES-X engine, the DTMF decoder and the converter;
//! inbound DMR bursts feed the converter the other way. Emission ticks
//! pace the outbound sides at the native frame rates.

use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aprs::{blank_gps, format_gps, parse_gps, AprsReader, AprsWriter};
use crate::config::Config;
use crate::convert::{ModeConverter, TAG_DATA, TAG_EOT, TAG_HEADER};
use crate::dmr::lc::{add_data_sync, add_voice_sync, full_lc_encode, Emb, EmbeddedLc, Lc, SlotType};
use crate::dmr::network::{DmrNetwork, StationInfo};
use crate::dmr::{
    DmrData, Flco, DT_TERMINATOR_WITH_LC, DT_VOICE, DT_VOICE_LC_HEADER, DT_VOICE_SYNC,
    FRAME_LENGTH_BYTES, SILENCE_DATA,
};
use crate::dtmf::{Dtmf, DtmfAction};
use crate::lookup::CallsignLookup;
use crate::timers::{StopWatch, Timer};
use crate::wiresx::registry::{TgKind, TgRegistry};
use crate::wiresx::storage::WiresXStorage;
use crate::wiresx::{WiresX, WxStatus};
use crate::xlx;
use crate::ysf::fich::Fich;
use crate::ysf::network::YsfNetwork;
use crate::ysf::payload::{
    extract_voice_channel, process_header_data, read_vd_mode2_data, write_header,
    write_vd_mode2_data, VD2_CHANNELS,
};
use crate::ysf::{
    add_sync, pad_callsign, trim_callsign, DT_VD_MODE2, FI_COMMUNICATIONS, FI_HEADER,
    FI_TERMINATOR, FRAME_LENGTH, MR_BUSY, MR_DIRECT, REGION_OFFSET,
};

const DMR_FRAME_PER_MS: u64 = 60;
const YSF_FRAME_PER_MS: u64 = 90;
const BEACON_PER_MS: u64 = 55;
const POLL_PER_MS: u64 = 5000;
const DMR_WATCHDOG_MS: u64 = 1500;
const YSF_WATCHDOG_MS: u64 = 500;
const TG_CHANGE_STEP_MS: u64 = 600;
const TG_CHANGE_TIMEOUT_MS: u64 = 12_000;
const NEWS_SESSION_LIMIT_MS: u64 = 10 * 60 * 1000;
const MINUTE_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("network setup failed: {0}")]
    Network(#[from] std::io::Error),
    #[error("the DMR master rejected the login")]
    LoginRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TgState {
    Idle,
    WaitingUnlink,
    SendReply,
    SendPtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BeaconState {
    Off,
    Init,
    Data,
    Eot,
}

/// Strip the padding and any suffix off a YSF source callsign.
fn trim_ysf_callsign(callsign: &str) -> String {
    let trimmed = callsign.trim();
    if trimmed.is_empty() {
        return "N0CALL".to_string();
    }
    let cut = trimmed
        .rfind(['-', '/'])
        .filter(|&i| i > 0)
        .unwrap_or(trimmed.len());
    trimmed[..cut].to_string()
}

/// The assembled bridge. Built from a validated config, runs until the
/// cancellation token fires or the master rejects the session.
pub struct Gateway {
    config: Config,
    ysf: Arc<YsfNetwork>,
    dmr: DmrNetwork,
    conv: ModeConverter,
    registry: Arc<TgRegistry>,
    wiresx: Option<WiresX>,
    dtmf: Dtmf,
    lookup: CallsignLookup,
    aprs_writer: Option<AprsWriter>,
    aprs_reader: Option<AprsReader>,

    // Session state
    src_id: u32,
    default_src_id: u32,
    dst_id: u32,
    ptt_dst_id: u32,
    ptt_pc: bool,
    dmr_flco: Flco,
    flco_unlink: Flco,
    net_src: String,
    net_dst: String,
    ysf_src: String,
    gps_buffer: [u8; 20],

    tg_state: TgState,
    unlink_received: bool,
    not_busy: bool,

    dmr_frames: u32,
    ysf_frames: u32,
    dmr_cnt: u8,
    ysf_cnt: u8,
    dmr_last_dt: u8,
    dmr_info: bool,
    first_sync: bool,
    stream_id: u32,
    embedded_lc: EmbeddedLc,

    beacon_state: BeaconState,
    beacon_file: Option<File>,

    ambe_file: Option<File>,
    ambe_file_count: u32,

    inbound_gps: [u8; 20],
    inbound_gps_fn: u8,

    sending_picture: bool,
}

impl Gateway {
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        let ysf_local = resolve(&config.ysf_local_address, config.ysf_local_port)?;
        let ysf_dst = resolve(&config.ysf_dst_address, config.ysf_dst_port)?;

        // An XLX module overrides the master address with the reflector's
        let mut dmr_address = config.dmr_address.clone();
        let mut dst_id = config.dmr_dst_id;
        if !config.xlx_module.is_empty() {
            let reflectors = xlx::load_reflectors(&config.xlx_file)
                .map_err(GatewayError::Network)?;
            let reflector = xlx::find(&reflectors, config.xlx_reflector)
                .ok_or_else(|| GatewayError::Resolve(format!("XLX{}", config.xlx_reflector)))?;
            dmr_address = reflector.address.clone();
            dst_id = xlx::module_dst_id(&config.xlx_module)
                .ok_or_else(|| GatewayError::Resolve(config.xlx_module.clone()))?;
            info!(reflector = config.xlx_reflector, module = %config.xlx_module, "linking via XLX");
        }
        let dmr_master = resolve(&dmr_address, config.dmr_port)?;

        let node_callsign = config.callsign.clone();
        let ysf = Arc::new(YsfNetwork::new(
            ysf_local,
            ysf_dst,
            &node_callsign,
            config.ysf_debug,
        )?);

        let mut dmr = DmrNetwork::new(
            dmr_master,
            config.dmr_local_port,
            config.dmr_id,
            &config.dmr_password,
            config.dmr_debug,
        )?;
        dmr.set_info(StationInfo {
            callsign: config.callsign.clone(),
            rx_frequency: config.rx_frequency,
            tx_frequency: config.tx_frequency,
            power: config.power,
            color_code: config.color_code,
            latitude: config.latitude,
            longitude: config.longitude,
            height: config.height,
            location: config.location.clone(),
            description: config.description.clone(),
            url: config.url.clone(),
        });

        let mut conv = ModeConverter::new();
        conv.load_table(config.ambe_comp_a, config.ambe_comp_b);

        let registry = Arc::new(TgRegistry::new(
            &config.tg_list_file,
            config.wiresx_make_upper,
        ));
        if let Err(e) = registry.load() {
            warn!(error = %e, "cannot load the TG list");
        }

        let wiresx = if config.enable_wiresx {
            registry.start_reload(config.tg_list_reload_minutes);
            let storage = WiresXStorage::new(&config.news_path);
            let mut engine = WiresX::new(
                storage,
                &config.callsign,
                &config.suffix,
                ysf.clone(),
                registry.clone(),
                &config.talky_key,
            );
            engine.set_info(
                &config.description,
                config.tx_frequency,
                config.rx_frequency,
                dst_id,
            );
            Some(engine)
        } else {
            None
        };

        let mut lookup = CallsignLookup::new(&config.lookup_file);
        if let Err(e) = lookup.load() {
            warn!(error = %e, "cannot load the DMR id lookup file");
        }

        let (aprs_writer, aprs_reader) = if config.aprs_enabled {
            let mut writer = AprsWriter::new(
                &config.aprs_callsign,
                &config.suffix,
                &config.aprs_password,
                &config.aprs_server,
                config.aprs_port,
            );
            writer.set_info(
                &config.callsign,
                config.latitude,
                config.longitude,
                &config.aprs_icon,
                &config.aprs_beacon_text,
                config.aprs_beacon_minutes,
            );
            let reader = AprsReader::new(&config.aprs_api_key, config.aprs_refresh_minutes);
            (Some(writer), Some(reader))
        } else {
            (None, None)
        };

        let default_src_id = if config.dmr_id > 99_999_999 {
            config.dmr_id / 100
        } else if config.dmr_id > 9_999_999 {
            config.dmr_id / 10
        } else {
            config.dmr_id
        };

        let dmr_flco = if config.dmr_pc { Flco::UserUser } else { Flco::Group };
        let flco_unlink = if config.pc_unlink { Flco::UserUser } else { Flco::Group };

        let mut gps_buffer = [0u8; 20];
        blank_gps(&mut gps_buffer);

        info!(
            timeout_min = config.timeout_minutes,
            beacon_min = config.beacon_minutes,
            hang_ms = config.hang_time,
            "general parameters"
        );

        Ok(Self {
            ysf,
            dmr,
            conv,
            registry,
            wiresx,
            dtmf: Dtmf::new(),
            lookup,
            aprs_writer,
            aprs_reader,
            src_id: default_src_id,
            default_src_id,
            dst_id,
            ptt_dst_id: dst_id,
            ptt_pc: false,
            dmr_flco,
            flco_unlink,
            net_src: String::new(),
            net_dst: String::new(),
            ysf_src: String::new(),
            gps_buffer,
            tg_state: TgState::Idle,
            unlink_received: false,
            not_busy: true,
            dmr_frames: 0,
            ysf_frames: 0,
            dmr_cnt: 0,
            ysf_cnt: 0,
            dmr_last_dt: 0,
            dmr_info: false,
            first_sync: false,
            stream_id: 0,
            embedded_lc: EmbeddedLc::new(),
            beacon_state: BeaconState::Off,
            beacon_file: None,
            ambe_file: None,
            ambe_file_count: 0,
            inbound_gps: [0u8; 20],
            inbound_gps_fn: 0,
            sending_picture: false,
            config,
        })
    }

    /// Run the event loop until cancelled.
    pub fn run(&mut self, cancel: Arc<AtomicBool>) -> Result<(), GatewayError> {
        if !self.dmr.open() {
            return Err(GatewayError::Resolve("DMR master".into()));
        }

        let mut stopwatch = StopWatch::new();
        let mut ysf_watch = StopWatch::new();
        let mut dmr_watch = StopWatch::new();
        let mut beacon_watch = StopWatch::new();
        let mut bea_voice_watch = StopWatch::new();
        let mut timeout_watch = StopWatch::new();
        let mut news_watch = StopWatch::new();
        let mut tg_change = StopWatch::new();

        let mut poll_timer = Timer::new(POLL_PER_MS);
        let mut dmr_watchdog = Timer::new(DMR_WATCHDOG_MS);
        let mut ysf_watchdog = Timer::new(YSF_WATCHDOG_MS);
        let mut lookup_reload = Timer::new(self.config.lookup_reload_minutes * MINUTE_MS);
        poll_timer.start();
        if self.config.lookup_reload_minutes > 0 {
            lookup_reload.start();
        }

        let mut first_time = true;
        let mut first_beacon = self.config.beacon_minutes > 0;

        info!(version = crate::VERSION, "bridge started");

        while !cancel.load(Ordering::Relaxed) {
            let ms = stopwatch.elapsed();
            stopwatch.start();

            if self.dmr.has_failed() {
                return Err(GatewayError::LoginRejected);
            }

            // Picture/news session ended or overran its watchdog
            if self.sending_picture {
                let finished = self.wiresx.as_ref().map(|w| w.end_picture()).unwrap_or(true);
                let overran = news_watch.elapsed() > NEWS_SESSION_LIMIT_MS;
                if finished || overran {
                    if overran {
                        if let Some(engine) = self.wiresx.as_mut() {
                            engine.abort_picture();
                        }
                    }
                    self.not_busy = true;
                    self.dmr.enable(true);
                    info!("news transfer finished, DMR side re-enabled");
                    self.sending_picture = false;
                }
            }

            // Initial link once the master session is up
            if first_time && self.dmr.is_connected() {
                if self.config.enable_unlink {
                    info!(dst = self.dst_id, "initial linking via unlink");
                    self.send_dummy_dmr(self.config.id_unlink, self.flco_unlink);
                    self.ptt_dst_id = self.dst_id;
                    self.unlink_received = false;
                    self.tg_state = TgState::WaitingUnlink;
                    tg_change.start();
                } else {
                    info!(dst = self.dst_id, "initial linking");
                    self.send_dummy_dmr(self.dst_id, self.dmr_flco);
                }
                if !self.config.xlx_module.is_empty() {
                    self.write_xlx_link();
                }
                first_time = false;
            }

            // Voice beacon scheduling
            if self.config.beacon_minutes > 0
                && (first_beacon
                    || (self.not_busy
                        && beacon_watch.elapsed() > self.config.beacon_minutes * MINUTE_MS))
            {
                self.not_busy = false;
                self.beacon_state = BeaconState::Init;
                bea_voice_watch.start();
                beacon_watch.start();
                first_beacon = false;
            }

            // Revert to the default TG after prolonged silence
            if self.config.timeout_minutes > 0
                && timeout_watch.elapsed() > self.config.timeout_minutes * MINUTE_MS + 20_000
                && self.not_busy
                && self.config.dmr_dst_id != self.dst_id
            {
                info!(from = self.dst_id, to = self.config.dmr_dst_id, "TG timeout, reverting");
                self.not_busy = false;
                self.ysf_src = self.config.callsign.clone();
                self.src_id = self.default_src_id;
                self.ptt_dst_id = self.config.dmr_dst_id;
                self.dst_id = self.config.dmr_dst_id;
                self.ptt_pc = false;
                self.dmr_flco = Flco::Group;
                self.send_dummy_dmr(self.config.id_unlink, self.flco_unlink);
                self.unlink_received = false;
                self.tg_state = TgState::WaitingUnlink;
                tg_change.start();
                timeout_watch.start();
            }

            // TG-selection state machine
            match self.tg_state {
                TgState::WaitingUnlink => {
                    if self.unlink_received {
                        tg_change.start();
                        self.tg_state = TgState::SendReply;
                        self.unlink_received = false;
                    }
                }
                TgState::SendReply => {
                    if tg_change.elapsed() > TG_CHANGE_STEP_MS {
                        tg_change.start();
                        self.tg_state = TgState::SendPtt;
                        let dst = self.dst_id;
                        if let Some(engine) = self.wiresx.as_mut() {
                            engine.send_connect_reply(dst);
                        }
                    }
                }
                TgState::SendPtt => {
                    if tg_change.elapsed() > TG_CHANGE_STEP_MS {
                        tg_change.start();
                        self.tg_state = TgState::Idle;
                        if self.ptt_dst_id != 0 {
                            info!(src = %self.ysf_src, dst = self.ptt_dst_id, pc = self.ptt_pc, "sending PTT");
                            let flco = if self.ptt_pc { Flco::UserUser } else { Flco::Group };
                            self.send_dummy_dmr(self.ptt_dst_id, flco);
                        }
                        self.not_busy = true;
                    }
                }
                TgState::Idle => {}
            }
            if self.tg_state != TgState::Idle && tg_change.elapsed() > TG_CHANGE_TIMEOUT_MS {
                warn!("timeout changing TG");
                self.tg_state = TgState::Idle;
                self.not_busy = true;
            }

            // Inbound YSF
            let mut buffer = [0u8; 512];
            while self.ysf.read(&mut buffer) > 0 {
                self.process_ysf_packet(&buffer, &mut beacon_watch, &mut news_watch, &mut timeout_watch, &mut tg_change, &mut ysf_watchdog);
            }

            // Beacon playback
            if self.beacon_state != BeaconState::Off && bea_voice_watch.elapsed() > BEACON_PER_MS {
                self.clock_beacon(&mut bea_voice_watch, &mut beacon_watch, &mut ysf_watch);
            }

            // Outbound DMR pacing
            if dmr_watch.elapsed() > DMR_FRAME_PER_MS {
                self.emit_dmr(&mut dmr_watch);
            }

            // Inbound DMR
            while let Some(data) = self.dmr.read() {
                if self.beacon_state == BeaconState::Data {
                    self.beacon_state = BeaconState::Eot;
                }
                self.process_dmr_data(&data, &mut dmr_watchdog);
            }

            // Outbound YSF pacing
            if ysf_watch.elapsed() > YSF_FRAME_PER_MS {
                self.emit_ysf(&mut ysf_watch);
            }

            self.dmr.clock(ms);
            if let Some(engine) = self.wiresx.as_mut() {
                engine.clock(ms);
            }
            if let Some(writer) = self.aprs_writer.as_mut() {
                writer.clock(ms);
            }

            poll_timer.clock(ms);
            if poll_timer.has_expired() {
                self.ysf.write_poll();
                poll_timer.start();
            }

            ysf_watchdog.clock(ms);
            if ysf_watchdog.has_expired() {
                let extra = (self.config.hang_time / 100).saturating_sub(self.ysf_frames as u64);
                for _ in 0..extra {
                    self.conv.put_dummy_ysf();
                }
                ysf_watchdog.stop();
            }

            dmr_watchdog.clock(ms);
            if dmr_watchdog.has_expired() {
                debug!(frames = self.dmr_frames, "DMR network watchdog expired");
                self.conv.put_dmr_eot();
                self.dmr.reset();
                dmr_watchdog.stop();
                self.dmr_frames = 0;
                self.dmr_info = false;
                self.first_sync = false;
            }

            lookup_reload.clock(ms);
            if lookup_reload.has_expired() {
                if let Err(e) = self.lookup.load() {
                    warn!(error = %e, "id lookup reload failed");
                }
                lookup_reload.start();
            }

            if ms < 5 {
                thread::sleep(Duration::from_millis(5));
            }
        }

        info!("bridge stopping");
        self.dmr.close();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_ysf_packet(
        &mut self,
        buffer: &[u8],
        beacon_watch: &mut StopWatch,
        news_watch: &mut StopWatch,
        timeout_watch: &mut StopWatch,
        tg_change: &mut StopWatch,
        ysf_watchdog: &mut Timer,
    ) {
        let region = &buffer[REGION_OFFSET..FRAME_LENGTH];
        let Some(fich) = Fich::decode(region) else {
            debug!("undecodable FICH, frame dropped");
            return;
        };

        self.ysf_src = trim_ysf_callsign(&trim_callsign(&buffer[14..24]));

        if self.wiresx.is_some() {
            let (status, requested) = {
                let engine = self.wiresx.as_mut().expect("checked above");
                let status = engine.process(region, &buffer[14..24], &fich);
                (status, engine.dst_id())
            };
            match status {
                WxStatus::Picture | WxStatus::GetMessage => {
                    self.not_busy = false;
                    news_watch.start();
                    info!("news transfer running, DMR side disabled");
                    self.dmr.enable(false);
                    self.sending_picture = true;
                }
                WxStatus::Connect => {
                    self.handle_connect(requested, timeout_watch, tg_change);
                }
                WxStatus::Disconnect => {
                    self.handle_disconnect(timeout_watch, tg_change);
                }
                _ => {}
            }

            if fich.dt == DT_VD_MODE2 {
                let end = buffer[34] & 0x01 == 0x01;
                match self.dtmf.decode_vd_mode2(region, end) {
                    DtmfAction::Connect(id) => {
                        info!(id, source = %self.ysf_src, "DTMF connect");
                        self.handle_connect(id, timeout_watch, tg_change);
                    }
                    DtmfAction::Disconnect => {
                        info!(source = %self.ysf_src, "DTMF disconnect");
                        self.handle_disconnect(timeout_watch, tg_change);
                    }
                    DtmfAction::None => {}
                }
            }
        }

        if &buffer[..4] == b"YSFD" && fich.dt == DT_VD_MODE2 {
            match fich.fi {
                FI_HEADER => {
                    if let Some((src, dst)) = process_header_data(region) {
                        beacon_watch.start();
                        self.not_busy = false;
                        ysf_watchdog.start();
                        info!(%src, %dst, "YSF header received");
                        self.open_ambe_file();
                        self.dmr.reset();
                        self.src_id = self.find_ysf_id(&src, true);
                        self.conv.put_ysf_header();
                        self.ysf_frames = 0;
                    }
                }
                FI_TERMINATOR => {
                    self.ambe_file = None;
                    ysf_watchdog.stop();
                    beacon_watch.start();
                    self.not_busy = true;
                    let extra = (self.config.hang_time / 100)
                        .saturating_sub(self.ysf_frames as u64)
                        .saturating_sub(2);
                    for _ in 0..extra {
                        self.conv.put_dummy_ysf();
                    }
                    info!(seconds = self.ysf_frames as f32 / 10.0, "YSF end of voice");
                    self.conv.put_ysf_eot();
                    self.ysf_frames = 0;
                    self.flush_inbound_gps();
                }
                FI_COMMUNICATIONS => {
                    beacon_watch.start();
                    self.not_busy = false;
                    ysf_watchdog.start();
                    self.conv.put_ysf(region);
                    self.record_ambe(region);
                    self.collect_inbound_gps(region, &fich);
                    self.ysf_frames += 1;
                }
                _ => {}
            }
        }

        if buffer[34] & 0x01 == 0x01 {
            self.dtmf.reset();
            self.inbound_gps_fn = 0;
        }
    }

    /// Resolve a requested 5-digit id against the registry and start the
    /// unlink → reply → PTT chain.
    fn handle_connect(&mut self, requested: u32, timeout_watch: &mut StopWatch, tg_change: &mut StopWatch) {
        self.not_busy = false;
        self.src_id = self.find_ysf_id(&self.ysf_src.clone(), false);

        let resolved = self.registry.resolve(requested);
        match resolved.kind {
            TgKind::Group => {
                self.ptt_pc = false;
                self.dst_id = resolved.full_id;
                self.ptt_dst_id = self.dst_id;
                self.dmr_flco = Flco::Group;
                info!(dst = self.dst_id, source = %self.ysf_src, "connect to TG requested");
            }
            TgKind::Reflector => {
                self.ptt_dst_id = requested;
                self.ptt_pc = true;
                self.dst_id = 9;
                self.dmr_flco = Flco::Group;
                info!(reflector = requested, source = %self.ysf_src, "connect to reflector requested");
            }
            TgKind::Private => {
                self.ptt_dst_id = 0;
                self.ptt_pc = true;
                self.dst_id = resolved.full_id;
                self.dmr_flco = Flco::UserUser;
                info!(dst = self.dst_id, source = %self.ysf_src, "private connect requested");
            }
        }

        if self.config.enable_unlink
            && self.ptt_dst_id != self.config.id_unlink
            && self.ptt_dst_id != 5000
        {
            info!(unlink = self.config.id_unlink, "sending DMR disconnect first");
            self.send_dummy_dmr(self.config.id_unlink, self.flco_unlink);
            self.unlink_received = false;
            self.tg_state = TgState::WaitingUnlink;
        } else {
            self.tg_state = TgState::SendReply;
        }
        tg_change.start();
        timeout_watch.start();
    }

    fn handle_disconnect(&mut self, timeout_watch: &mut StopWatch, tg_change: &mut StopWatch) {
        self.not_busy = false;
        info!(source = %self.ysf_src, "disconnect requested");
        self.src_id = self.find_ysf_id(&self.ysf_src.clone(), false);
        self.ptt_dst_id = 9;
        self.ptt_pc = false;
        self.dst_id = 9;
        self.dmr_flco = Flco::Group;
        self.send_dummy_dmr(self.config.id_unlink, self.flco_unlink);
        self.tg_state = TgState::WaitingUnlink;
        tg_change.start();
        timeout_watch.start();
    }

    fn clock_beacon(
        &mut self,
        bea_voice_watch: &mut StopWatch,
        beacon_watch: &mut StopWatch,
        ysf_watch: &mut StopWatch,
    ) {
        match self.beacon_state {
            BeaconState::Init => {
                self.net_src = "BEACON".to_string();
                blank_gps(&mut self.gps_buffer);
                match File::open(&self.config.beacon_file) {
                    Ok(file) => {
                        info!(file = %self.config.beacon_file.display(), "beacon start");
                        self.beacon_file = Some(file);
                        self.conv.put_dmr_header();
                        ysf_watch.start();
                        self.beacon_state = BeaconState::Data;
                    }
                    Err(e) => {
                        warn!(error = %e, "cannot open the beacon file");
                        self.beacon_state = BeaconState::Off;
                        self.not_busy = true;
                    }
                }
                bea_voice_watch.start();
            }
            BeaconState::Data => {
                let mut chunk = [0u8; 24];
                let n = self
                    .beacon_file
                    .as_mut()
                    .map(|f| f.read(&mut chunk).unwrap_or(0))
                    .unwrap_or(0);
                if n > 23 {
                    self.conv.amb_to_ysf(&chunk);
                } else {
                    self.beacon_state = BeaconState::Eot;
                }
                bea_voice_watch.start();
            }
            BeaconState::Eot => {
                self.beacon_file = None;
                info!("beacon done");
                self.conv.put_dmr_eot();
                beacon_watch.start();
                self.beacon_state = BeaconState::Off;
                self.not_busy = true;
            }
            BeaconState::Off => {}
        }
    }

    fn emit_dmr(&mut self, dmr_watch: &mut StopWatch) {
        let mut frame = [0u8; FRAME_LENGTH_BYTES];
        match self.conv.get_dmr(&mut frame) {
            Some(TAG_HEADER) => {
                self.not_busy = false;
                self.dmr_cnt = 0;
                self.stream_id = rand::random();

                let lc = Lc::new(self.dmr_flco, self.src_id, self.dst_id);
                add_data_sync(&mut frame, false);
                SlotType::new(self.config.color_code, DT_VOICE_LC_HEADER).encode(&mut frame);
                full_lc_encode(&lc, &mut frame, DT_VOICE_LC_HEADER);
                self.embedded_lc.set_lc(&lc);

                let mut data = self.voice_data(DT_VOICE_LC_HEADER, 0, frame);
                for _ in 0..3 {
                    data.seq_no = self.dmr_cnt;
                    self.dmr.write(&data);
                    self.dmr_cnt = self.dmr_cnt.wrapping_add(1);
                }
                dmr_watch.start();
            }
            Some(TAG_EOT) => {
                let n_dmr = (self.dmr_cnt.wrapping_sub(3)) % 6;
                if n_dmr != 0 {
                    // Pad the superframe with silence before terminating
                    for n in n_dmr..6 {
                        let mut fill = SILENCE_DATA;
                        let lcss = self.embedded_lc.get_data(&mut fill, n);
                        Emb { color_code: self.config.color_code, lcss }.encode(&mut fill);
                        let mut data = self.voice_data(DT_VOICE, n, fill);
                        data.seq_no = self.dmr_cnt;
                        self.dmr.write(&data);
                        self.dmr_cnt = self.dmr_cnt.wrapping_add(1);
                    }
                }

                let lc = Lc::new(self.dmr_flco, self.src_id, self.dst_id);
                add_data_sync(&mut frame, false);
                SlotType::new(self.config.color_code, DT_TERMINATOR_WITH_LC).encode(&mut frame);
                full_lc_encode(&lc, &mut frame, DT_TERMINATOR_WITH_LC);
                let mut data = self.voice_data(DT_TERMINATOR_WITH_LC, 0, frame);
                data.seq_no = self.dmr_cnt;
                self.dmr.write(&data);
                self.not_busy = true;
                dmr_watch.start();
            }
            Some(TAG_DATA) => {
                let n_dmr = (self.dmr_cnt.wrapping_sub(3)) % 6;
                let data_type = if n_dmr == 0 {
                    add_voice_sync(&mut frame, false);
                    let lc = Lc::new(self.dmr_flco, self.src_id, self.dst_id);
                    self.embedded_lc.set_lc(&lc);
                    DT_VOICE_SYNC
                } else {
                    let lcss = self.embedded_lc.get_data(&mut frame, n_dmr);
                    Emb { color_code: self.config.color_code, lcss }.encode(&mut frame);
                    DT_VOICE
                };
                let mut data = self.voice_data(data_type, n_dmr, frame);
                data.seq_no = self.dmr_cnt;
                self.dmr.write(&data);
                self.dmr_cnt = self.dmr_cnt.wrapping_add(1);
                dmr_watch.start();
            }
            _ => {}
        }
    }

    fn voice_data(&self, data_type: u8, n: u8, frame: [u8; FRAME_LENGTH_BYTES]) -> DmrData {
        DmrData {
            src_id: self.src_id,
            dst_id: self.dst_id,
            flco: self.dmr_flco,
            n,
            data_type,
            stream_id: self.stream_id,
            data: frame,
            ..DmrData::default()
        }
    }

    fn process_dmr_data(&mut self, data: &DmrData, dmr_watchdog: &mut Timer) {
        dmr_watchdog.start();

        if data.data_type == DT_TERMINATOR_WITH_LC {
            if self.dmr_frames == 0 {
                self.dmr.reset();
                dmr_watchdog.stop();
                self.dmr_info = false;
                self.first_sync = false;
                self.dmr_last_dt = data.data_type;
                return;
            }
            info!(seconds = self.dmr_frames as f32 / 16.667, "DMR end of voice");
            if data.src_id == 4000 {
                self.unlink_received = true;
            }
            self.conv.put_dmr_eot();
            self.dmr.reset();
            dmr_watchdog.stop();
            self.dmr_frames = 0;
            self.dmr_info = false;
            self.first_sync = false;
        }

        if data.data_type == DT_VOICE_LC_HEADER && self.dmr_last_dt != DT_VOICE_LC_HEADER {
            self.name_dmr_session(data);
            self.conv.put_dmr_header();
            info!(src = %self.net_src.trim(), dst = %self.net_dst.trim(), "DMR audio received");
            self.dmr_info = true;
            self.dmr_frames = 0;
            self.first_sync = false;
        }

        if data.data_type == DT_VOICE_SYNC {
            self.first_sync = true;
        }

        if (data.data_type == DT_VOICE_SYNC || data.data_type == DT_VOICE) && self.first_sync {
            if !self.dmr_info {
                self.name_dmr_session(data);
                info!(src = %self.net_src.trim(), dst = %self.net_dst.trim(), "DMR late entry");
                self.dmr_info = true;
            }
            self.conv.put_dmr(&data.data);
            self.dmr_frames += 1;
        }

        self.dmr_last_dt = data.data_type;
    }

    /// Resolve display names and the APRS overlay for a DMR session.
    fn name_dmr_session(&mut self, data: &DmrData) {
        blank_gps(&mut self.gps_buffer);

        self.net_src = match data.src_id {
            9990 => "PARROT".to_string(),
            9 => "LOCAL".to_string(),
            4000 => "UNLINK".to_string(),
            id => self.lookup.find_callsign(id),
        };
        self.net_dst = match self.wiresx.as_ref() {
            Some(engine) => engine.name_tg(data.dst_id),
            None => {
                let prefix = if data.flco.is_group() { "TG " } else { "" };
                format!("{}{}", prefix, self.lookup.find_callsign(data.dst_id))
            }
        };

        if self.lookup.exists(data.src_id) {
            let callsign = self.net_src.clone();
            if let Some(reader) = self.aprs_reader.as_mut() {
                if let Some((lat, lon)) = reader.find_call(&callsign) {
                    format_gps(&mut self.gps_buffer, lat, lon);
                }
            }
        }

        pad_to_callsign(&mut self.net_src);
        pad_to_callsign(&mut self.net_dst);
    }

    fn emit_ysf(&mut self, ysf_watch: &mut StopWatch) {
        let mut frame = [0u8; FRAME_LENGTH];
        match self.conv.get_ysf(&mut frame[REGION_OFFSET..]) {
            Some(TAG_HEADER) => {
                self.not_busy = false;
                self.ysf_cnt = 0;
                self.fill_ysf_envelope(&mut frame);
                frame[34] = 0;
                add_sync(&mut frame[REGION_OFFSET..]);
                self.ysf_fich(FI_HEADER, 0).encode(&mut frame[REGION_OFFSET..]);
                self.write_ysf_csd(&mut frame);
                self.ysf.write(&frame);
                self.ysf_cnt = self.ysf_cnt.wrapping_add(1);
                ysf_watch.start();
            }
            Some(TAG_EOT) => {
                self.fill_ysf_envelope(&mut frame);
                frame[34] = self.ysf_cnt;
                add_sync(&mut frame[REGION_OFFSET..]);
                self.ysf_fich(FI_TERMINATOR, 0).encode(&mut frame[REGION_OFFSET..]);
                self.write_ysf_csd(&mut frame);
                self.ysf.write(&frame);
            }
            Some(TAG_DATA) => {
                let fn_ = (self.ysf_cnt.wrapping_sub(1)) % 8;
                self.fill_ysf_envelope(&mut frame);
                add_sync(&mut frame[REGION_OFFSET..]);

                let text: [u8; 10] = match fn_ {
                    0 => *b"**********",
                    1 => pad_callsign(self.net_src.trim_end()),
                    2 => pad_callsign(self.net_dst.trim_end()),
                    6 => self.gps_buffer[..10].try_into().expect("slice length"),
                    7 => self.gps_buffer[10..20].try_into().expect("slice length"),
                    _ => *b"          ",
                };
                write_vd_mode2_data(&mut frame[REGION_OFFSET..], &text);

                self.ysf_fich(FI_COMMUNICATIONS, fn_).encode(&mut frame[REGION_OFFSET..]);
                frame[34] = (self.ysf_cnt & 0x7F) << 1;
                self.ysf.write(&frame);
                self.ysf_cnt = self.ysf_cnt.wrapping_add(1);
                ysf_watch.start();
            }
            _ => {}
        }
    }

    fn fill_ysf_envelope(&self, frame: &mut [u8; FRAME_LENGTH]) {
        frame[0..4].copy_from_slice(b"YSFD");
        frame[4..14].copy_from_slice(self.ysf.callsign());
        frame[14..24].copy_from_slice(&pad_callsign(self.net_src.trim_end()));
        frame[24..34].copy_from_slice(&pad_callsign("ALL"));
    }

    fn ysf_fich(&self, fi: u8, frame_number: u8) -> Fich {
        let mut fich = Fich {
            fi,
            cs: 2,
            frame_number,
            frame_total: 7,
            dev: 0,
            sql: false,
            sq: 0,
            dt: DT_VD_MODE2,
            ..Fich::default()
        };
        if self.config.remote_gateway {
            fich.voip = false;
            fich.mr = MR_DIRECT;
        } else {
            fich.voip = true;
            fich.mr = MR_BUSY;
        }
        fich
    }

    fn write_ysf_csd(&self, frame: &mut [u8; FRAME_LENGTH]) {
        let mut csd1 = [b'*'; 20];
        csd1[10..20].copy_from_slice(&pad_callsign(self.net_src.trim_end()));
        let csd2 = [b' '; 20];
        write_header(&mut frame[REGION_OFFSET..], &csd1, &csd2);
    }

    /// Send a header + terminator pair carrying only link control, used
    /// to steer the master's dynamic TG subscriptions.
    fn send_dummy_dmr(&mut self, dst_id: u32, flco: Flco) {
        let lc = Lc::new(flco, self.src_id, dst_id);
        let stream_id: u32 = rand::random();

        let mut frame = [0u8; FRAME_LENGTH_BYTES];
        add_data_sync(&mut frame, false);
        SlotType::new(self.config.color_code, DT_VOICE_LC_HEADER).encode(&mut frame);
        full_lc_encode(&lc, &mut frame, DT_VOICE_LC_HEADER);

        let mut data = DmrData {
            src_id: self.src_id,
            dst_id,
            flco,
            data_type: DT_VOICE_LC_HEADER,
            stream_id,
            data: frame,
            ..DmrData::default()
        };
        for seq in 0..3 {
            data.seq_no = seq;
            self.dmr.write(&data);
        }

        let mut frame = [0u8; FRAME_LENGTH_BYTES];
        add_data_sync(&mut frame, false);
        SlotType::new(self.config.color_code, DT_TERMINATOR_WITH_LC).encode(&mut frame);
        full_lc_encode(&lc, &mut frame, DT_TERMINATOR_WITH_LC);
        data.data = frame;
        data.data_type = DT_TERMINATOR_WITH_LC;
        data.seq_no = 3;
        self.dmr.write(&data);
    }

    /// Link frames for an XLX reflector module (private call, fixed
    /// colour code 3).
    fn write_xlx_link(&mut self) {
        let Some(dst_id) = xlx::module_dst_id(&self.config.xlx_module) else {
            return;
        };
        let lc = Lc::new(Flco::UserUser, self.src_id, dst_id);
        let stream_id: u32 = rand::random();

        let mut frame = [0u8; FRAME_LENGTH_BYTES];
        add_data_sync(&mut frame, true);
        SlotType::new(3, DT_VOICE_LC_HEADER).encode(&mut frame);
        full_lc_encode(&lc, &mut frame, DT_VOICE_LC_HEADER);
        let mut data = DmrData {
            src_id: self.src_id,
            dst_id,
            flco: Flco::UserUser,
            data_type: DT_VOICE_LC_HEADER,
            stream_id,
            data: frame,
            ..DmrData::default()
        };
        for seq in 0..3 {
            data.seq_no = seq;
            self.dmr.write(&data);
        }

        let mut frame = [0u8; FRAME_LENGTH_BYTES];
        add_data_sync(&mut frame, true);
        SlotType::new(3, DT_TERMINATOR_WITH_LC).encode(&mut frame);
        full_lc_encode(&lc, &mut frame, DT_TERMINATOR_WITH_LC);
        data.data = frame;
        data.data_type = DT_TERMINATOR_WITH_LC;
        for seq in 3..5 {
            data.seq_no = seq;
            self.dmr.write(&data);
        }
    }

    fn find_ysf_id(&mut self, callsign: &str, show_dst: bool) -> u32 {
        let trimmed = trim_ysf_callsign(callsign);
        let id = self.lookup.find_id(&trimmed);
        if id == 0 {
            info!(callsign = %trimmed, fallback = self.default_src_id, "no DMR id found");
            self.default_src_id
        } else {
            if show_dst {
                info!(callsign = %trimmed, id, dst = self.dst_id, "DMR id resolved");
            } else {
                info!(callsign = %trimmed, id, "DMR id resolved");
            }
            id
        }
    }

    fn open_ambe_file(&mut self) {
        if !self.config.save_ambe {
            return;
        }
        let path = PathBuf::from(format!("/tmp/file{:03}.amb", self.ambe_file_count));
        self.ambe_file_count += 1;
        match File::create(&path) {
            Ok(file) => {
                info!(file = %path.display(), "recording AMBE");
                self.ambe_file = Some(file);
            }
            Err(e) => warn!(error = %e, "cannot create the AMBE file"),
        }
    }

    /// Append the frame's sub-frames to the capture file as 8-byte raw
    /// chunks, the format the beacon player reads back.
    fn record_ambe(&mut self, region: &[u8]) {
        let Some(file) = self.ambe_file.as_mut() else {
            return;
        };
        for k in 0..VD2_CHANNELS {
            let subframe = extract_voice_channel(region, k);
            let mut raw = [0u8; 8];
            raw[..6].copy_from_slice(&subframe[..6]);
            raw[6] = subframe[6];
            raw[7] = subframe[7];
            if file.write_all(&raw).is_err() {
                self.ambe_file = None;
                return;
            }
        }
    }

    /// Collect the two GPS half-blobs from mode 2 data channels 6 and 7.
    fn collect_inbound_gps(&mut self, region: &[u8], fich: &Fich) {
        if self.aprs_writer.is_none() {
            return;
        }
        let Some(text) = read_vd_mode2_data(region) else {
            return;
        };
        match fich.frame_number {
            6 => {
                self.inbound_gps[..10].copy_from_slice(&text);
                self.inbound_gps_fn |= 0x01;
            }
            7 => {
                self.inbound_gps[10..20].copy_from_slice(&text);
                self.inbound_gps_fn |= 0x02;
            }
            _ => {}
        }
    }

    /// Uplink a completed inbound position at end of transmission.
    fn flush_inbound_gps(&mut self) {
        if self.inbound_gps_fn != 0x03 {
            return;
        }
        self.inbound_gps_fn = 0;
        if let Some((lat, lon)) = parse_gps(&self.inbound_gps) {
            let source = self.ysf_src.clone();
            let dst = self.dst_id;
            if let Some(writer) = self.aprs_writer.as_mut() {
                writer.write_position(
                    &source,
                    0x26,
                    lat as f32 / 1000.0,
                    lon as f32 / 1000.0,
                    dst,
                );
            }
        }
    }
}

fn pad_to_callsign(s: &mut String) {
    s.truncate(10);
    while s.len() < 10 {
        s.push(' ');
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, GatewayError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| GatewayError::Resolve(host.to_string()))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| GatewayError::Resolve(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_ysf_callsign() {
        assert_eq!(trim_ysf_callsign("EA7EE     "), "EA7EE");
        assert_eq!(trim_ysf_callsign("  EA7EE-ND"), "EA7EE");
        assert_eq!(trim_ysf_callsign("EA7EE/P   "), "EA7EE");
        assert_eq!(trim_ysf_callsign("          "), "N0CALL");
    }

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve("127.0.0.1", 4200).unwrap();
        assert_eq!(addr.port(), 4200);
        assert!(resolve("no.such.host.invalid", 1).is_err());
    }

    #[test]
    fn test_pad_to_callsign() {
        let mut s = "EA7EE".to_string();
        pad_to_callsign(&mut s);
        assert_eq!(s, "EA7EE     ");
        let mut long = "ABCDEFGHIJKLMN".to_string();
        pad_to_callsign(&mut long);
        assert_eq!(long.len(), 10);
    }
}
