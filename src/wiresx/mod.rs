//! WIRES-X in-band command engine.
//!
//! Commands arrive as FR-mode data slices spread over multi-block frame
//! sequences; a completed buffer is CRC-checked against the `0x03` end
//! marker and dispatched by its 3-byte op-code. Replies go out as framed
//! multi-packet chains through the network writer after a short debounce,
//! and picture downloads stream on their own timer chain.

pub mod registry;
pub mod storage;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::fec::crc8;
use crate::timers::Timer;
use crate::wiresx::registry::TgRegistry;
use crate::wiresx::storage::{MessageKind, WiresXStorage};
use crate::ysf::fich::Fich;
use crate::ysf::network::PacketSink;
use crate::ysf::payload::{
    read_data_fr_mode_data1, read_data_fr_mode_data2, write_data_fr_mode_data1,
    write_data_fr_mode_data2,
};
use crate::ysf::{
    add_sync, pad_callsign, trim_callsign, CALLSIGN_LENGTH, DT_DATA_FR_MODE, FI_COMMUNICATIONS,
    FI_HEADER, FI_TERMINATOR, FRAME_LENGTH, REGION_OFFSET,
};

const DX_REQ: [u8; 3] = [0x5D, 0x71, 0x5F];
const CONN_REQ: [u8; 3] = [0x5D, 0x23, 0x5F];
const DISC_REQ: [u8; 3] = [0x5D, 0x2A, 0x5F];
const ALL_REQ: [u8; 3] = [0x5D, 0x66, 0x5F];
const NEWS_REQ: [u8; 3] = [0x5D, 0x63, 0x5F];
const CAT_REQ: [u8; 3] = [0x5D, 0x67, 0x5F];
const LIST_REQ: [u8; 3] = [0x5D, 0x6C, 0x5F];
const GET_RSC: [u8; 3] = [0x5D, 0x72, 0x5F];
const MESSAGE_REC: [u8; 3] = [0x47, 0x65, 0x5F];
const MESSAGE_REC_GPS: [u8; 3] = [0x47, 0x66, 0x5F];
const PICT_REC: [u8; 3] = [0x47, 0x67, 0x5F];
const PICT_REC_GPS: [u8; 3] = [0x47, 0x68, 0x5F];
const PICT_DATA: [u8; 3] = [0x4E, 0x62, 0x5F];

const DX_RESP: [u8; 4] = [0x5D, 0x51, 0x5F, 0x26];
const CONN_RESP: [u8; 4] = [0x5D, 0x41, 0x5F, 0x26];
const ALL_RESP: [u8; 4] = [0x5D, 0x46, 0x5F, 0x26];
const NEWS_RESP: [u8; 4] = [0x5D, 0x43, 0x5F, 0x26];
const LIST_RESP: [u8; 4] = [0x5D, 0x4C, 0x5F, 0x26];
const GET_MSG_RESP: [u8; 4] = [0x5D, 0x54, 0x5F, 0x26];
const PICT_PREAMB_RESP: [u8; 4] = [0x5D, 0x50, 0x5F, 0x26];
const PICT_BEGIN_RESP_GPS: [u8; 4] = [0x4E, 0x64, 0x5F, 0x26];
const PICT_DATA_RESP: [u8; 4] = [0x4E, 0x62, 0x5F, 0x26];
const PICT_END_RESP: [u8; 4] = [0x4E, 0x65, 0x5F, 0x26];
const UP_ACK: [u8; 4] = [0x47, 0x30, 0x5F, 0x26];

const COMMAND_CAPACITY: usize = 1100;
const REPLY_DEBOUNCE_MS: u64 = 1000;
const PICTURE_TICK_MS: u64 = 500;
const PICTURE_CHUNK_GAP_MS: u64 = 4500;

/// What a processed inbound packet asks the orchestrator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WxStatus {
    None,
    Connect,
    Disconnect,
    Dx,
    All,
    News,
    List,
    GetMessage,
    Upload,
    Picture,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyState {
    None,
    Dx,
    All,
    Search,
    LocalNews,
    News,
    Category,
    List,
    GetMessage,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PictureState {
    None,
    Begin,
    Data,
    End,
}

/// The engine. Owns the news storage; writes through the packet sink.
pub struct WiresX {
    storage: WiresXStorage,
    registry: Arc<TgRegistry>,
    network: Arc<dyn PacketSink>,
    callsign: [u8; CALLSIGN_LENGTH],
    node: [u8; CALLSIGN_LENGTH],
    id: String,
    name: [u8; 14],
    tx_frequency: u32,
    rx_frequency: u32,
    dst_id: u32,
    command: Vec<u8>,
    timer: Timer,
    ptimer: Timer,
    seq_no: u8,
    header: [u8; 34],
    csd1: [u8; 20],
    csd2: [u8; 20],
    csd3: [u8; 20],
    status: ReplyState,
    start: u32,
    search: String,
    category: Vec<Arc<registry::TgEntry>>,
    talky_key: [u8; 5],
    serial: [u8; 6],
    news_source: [u8; 5],
    source: String,
    list_type: u8,
    number: u32,
    picture_state: PictureState,
    pcount: u32,
    end_picture: bool,
    last_block_ref: Option<u8>,
    download_key: Vec<u8>,
}

impl WiresX {
    pub fn new(
        storage: WiresXStorage,
        callsign: &str,
        suffix: &str,
        network: Arc<dyn PacketSink>,
        registry: Arc<TgRegistry>,
        download_key: &str,
    ) -> Self {
        let node_name = if suffix.is_empty() {
            callsign.to_string()
        } else {
            format!("{}-{}", callsign, suffix)
        };
        Self {
            storage,
            registry,
            network,
            callsign: pad_callsign(callsign),
            node: pad_callsign(&node_name),
            id: "00000".to_string(),
            name: [b' '; 14],
            tx_frequency: 0,
            rx_frequency: 0,
            dst_id: 0,
            command: vec![0u8; COMMAND_CAPACITY],
            timer: Timer::new(REPLY_DEBOUNCE_MS),
            ptimer: Timer::new(PICTURE_TICK_MS),
            seq_no: 0,
            header: [0u8; 34],
            csd1: [b'*'; 20],
            csd2: [b' '; 20],
            csd3: [b' '; 20],
            status: ReplyState::None,
            start: 0,
            search: String::new(),
            category: Vec::new(),
            talky_key: [0u8; 5],
            serial: [0u8; 6],
            news_source: [b' '; 5],
            source: String::new(),
            list_type: b'1',
            number: 0,
            picture_state: PictureState::None,
            pcount: 0,
            end_picture: false,
            last_block_ref: None,
            download_key: download_key.as_bytes().to_vec(),
        }
    }

    /// Node description used in the DX/CONNECT replies; derives the
    /// 5-digit node id from the name hash.
    pub fn set_info(&mut self, name: &str, tx_frequency: u32, rx_frequency: u32, dst_id: u32) {
        for (i, b) in name.bytes().take(14).enumerate() {
            self.name[i] = b;
        }
        self.tx_frequency = tx_frequency;
        self.rx_frequency = rx_frequency;
        self.dst_id = dst_id;

        let mut hash: u32 = 0;
        for b in name.bytes() {
            hash = hash.wrapping_add(b as u32);
            hash = hash.wrapping_add(hash << 10);
            hash ^= hash >> 6;
        }
        hash = hash.wrapping_add(hash << 3);
        hash ^= hash >> 11;
        hash = hash.wrapping_add(hash << 15);
        self.id = format!("{:05}", hash % 100_000);
        info!(id = %self.id, "node id derived from the node name");

        self.csd1 = [b'*'; 20];
        self.csd1[10..20].copy_from_slice(&self.node);
        self.csd2 = [b' '; 20];
        self.csd2[..10].copy_from_slice(&self.callsign);
        self.csd3 = [b' '; 20];
        self.csd3[0..5].copy_from_slice(self.id.as_bytes());
        self.csd3[15..20].copy_from_slice(self.id.as_bytes());

        self.header[0..4].copy_from_slice(b"YSFD");
        self.header[4..14].copy_from_slice(&self.callsign);
        self.header[14..24].copy_from_slice(&self.node);
        self.header[24..34].copy_from_slice(&pad_callsign("ALL"));
    }

    /// The destination id requested by the last CONNECT.
    pub fn dst_id(&self) -> u32 {
        self.dst_id
    }

    /// Picture/news session finished; the orchestrator may re-enable DMR.
    pub fn end_picture(&self) -> bool {
        self.end_picture
    }

    /// Display name for a DMR destination id.
    pub fn name_tg(&self, id: u32) -> String {
        if id > 99999 {
            format!("CALL {}", id)
        } else if id == 9 {
            "LOCAL".to_string()
        } else if id == 9990 {
            "PARROT".to_string()
        } else if id == 4000 {
            "UNLINK".to_string()
        } else {
            match self.registry.find_by_id(id) {
                Some(entry) => entry.name.trim_end().to_string(),
                None => format!("TG {}", id),
            }
        }
    }

    /// Feed one inbound air frame. `source` is the 10-byte source field
    /// of the network envelope.
    pub fn process(&mut self, region: &[u8], source: &[u8], fich: &Fich) -> WxStatus {
        if fich.dt != DT_DATA_FR_MODE || fich.fi != FI_COMMUNICATIONS {
            return WxStatus::None;
        }

        let fn_ = fich.frame_number as usize;
        let bn = fich.block_number as usize;

        if fn_ == 0 {
            let mut slice = [0u8; 20];
            if read_data_fr_mode_data1(region, &mut slice) {
                self.talky_key.copy_from_slice(&slice[5..10]);
            }
            return WxStatus::None;
        }

        if bn * 260 + 260 > self.command.len() {
            return WxStatus::None;
        }

        if fn_ == 1 {
            let mut slice = [0u8; 20];
            if !read_data_fr_mode_data2(region, &mut slice) {
                return WxStatus::None;
            }
            self.command[bn * 260..bn * 260 + 20].copy_from_slice(&slice);
        } else {
            let base = bn * 260 + (fn_ - 2) * 40 + 20;
            if base + 40 > self.command.len() {
                return WxStatus::None;
            }
            let mut slice = [0u8; 20];
            if !read_data_fr_mode_data1(region, &mut slice) {
                return WxStatus::None;
            }
            self.command[base..base + 20].copy_from_slice(&slice);
            if !read_data_fr_mode_data2(region, &mut slice) {
                return WxStatus::None;
            }
            self.command[base + 20..base + 40].copy_from_slice(&slice);
        }

        if fn_ != fich.frame_total as usize || bn != fich.block_total as usize {
            return WxStatus::None;
        }

        // Command complete: find the end marker and validate the CRC.
        let cmd_len = bn * 260 + (fn_ - 1) * 40 + 20;
        let mut marker = None;
        for i in (1..cmd_len).rev() {
            if self.command[i] == 0x03 {
                marker = Some(i);
                break;
            }
        }
        let Some(i) = marker else {
            debug!(len = cmd_len, dump = %hex_dump(&self.command[..cmd_len]), "command without end marker");
            return WxStatus::None;
        };
        if crc8(&self.command[..=i]) != self.command[i + 1] {
            debug!(len = cmd_len, dump = %hex_dump(&self.command[..cmd_len]), "command CRC mismatch");
            return WxStatus::None;
        }
        let block_size = i.saturating_sub(10);

        self.source = trim_callsign(&source[..CALLSIGN_LENGTH.min(source.len())]);

        let op = [self.command[1], self.command[2], self.command[3]];
        match op {
            DX_REQ => {
                debug!(source = %self.source, "DX request");
                self.status = ReplyState::Dx;
                self.timer.start();
                WxStatus::Dx
            }
            ALL_REQ => {
                self.process_all();
                WxStatus::All
            }
            CONN_REQ => self.process_connect(),
            DISC_REQ => {
                debug!(source = %self.source, "disconnect request");
                self.timer.start();
                WxStatus::Disconnect
            }
            NEWS_REQ => {
                self.news_source.copy_from_slice(&self.command[5..10]);
                info!(dest = %field_string(&self.news_source), source = %self.source, "news request");
                self.status = ReplyState::News;
                self.timer.start();
                WxStatus::News
            }
            CAT_REQ => {
                self.process_category();
                WxStatus::None
            }
            LIST_REQ => {
                self.process_list_down();
                WxStatus::List
            }
            GET_RSC => {
                self.process_get_message();
                WxStatus::GetMessage
            }
            MESSAGE_REC => self.process_upload_message(false),
            MESSAGE_REC_GPS => self.process_upload_message(true),
            PICT_REC => self.process_upload_picture(false),
            PICT_REC_GPS => self.process_upload_picture(true),
            PICT_DATA => {
                let reference = self.command[7];
                if self.last_block_ref == Some(reference) {
                    debug!("duplicated picture block dropped");
                    return WxStatus::None;
                }
                self.last_block_ref = Some(reference);
                debug!(size = block_size, "picture data block");
                self.storage.add_picture_data(&self.command[10..cmd_len], block_size);
                if block_size < 1027 {
                    self.status = ReplyState::Upload;
                    self.timer.start();
                }
                WxStatus::None
            }
            _ => {
                debug!(dump = %hex_dump(&self.command[..cmd_len]), "unknown WIRES-X command");
                WxStatus::Fail
            }
        }
    }

    fn process_all(&mut self) {
        let data = &self.command[5..];
        let start = ascii_number(&data[2..5]);
        self.start = start.saturating_sub(1);
        match (data[0], data[1]) {
            (b'0', b'1') => {
                debug!(start, source = %self.source, "ALL request");
                self.status = ReplyState::All;
                self.timer.start();
            }
            (b'1', b'1') => {
                self.search = String::from_utf8_lossy(&data[5..21]).to_string();
                debug!(search = %self.search, source = %self.source, "search request");
                self.status = ReplyState::Search;
                self.timer.start();
            }
            (b'A', b'1') => {
                info!(source = %self.source, "local news request");
                self.status = ReplyState::LocalNews;
                self.timer.start();
            }
            _ => {}
        }
    }

    fn process_connect(&mut self) -> WxStatus {
        let id = ascii_number(&self.command[5..11]);
        if id == 0 {
            return WxStatus::None;
        }
        self.dst_id = id;
        self.timer.start();
        WxStatus::Connect
    }

    fn process_category(&mut self) {
        let data = &self.command[5..];
        let len = ascii_number(&data[5..7]) as usize;
        if len == 0 || len > 20 {
            return;
        }
        self.category.clear();
        for j in 0..len {
            let id = ascii_number(&data[7 + j * 5..12 + j * 5]);
            if let Some(entry) = self.registry.find_by_id(id) {
                self.category.push(entry);
            }
        }
        self.status = ReplyState::Category;
        self.timer.start();
    }

    fn process_list_down(&mut self) {
        self.news_source.copy_from_slice(&self.command[5..10]);
        self.list_type = self.command[15];
        let start = ascii_number(&self.command[22..24]);
        self.start = if start > 0 { (start - 1) / 2 } else { 0 };
        info!(
            dest = %field_string(&self.news_source),
            list_type = %(self.list_type as char),
            start = self.start,
            "list download request"
        );
        self.status = ReplyState::List;
        self.timer.start();
    }

    fn process_get_message(&mut self) {
        self.number = ascii_number(&self.command[19..24]);
        info!(number = self.number, source = %self.source, "get message request");
        self.end_picture = false;
        self.status = ReplyState::GetMessage;
        self.timer.start();
    }

    /// Check the "to" field of an upload against the current TG or node id.
    fn upload_is_for_us(&self, gps: bool) -> bool {
        let off = 5 + if gps { 48 } else { 30 };
        let to = field_string(&self.command[off..off + 5]);
        let tg = format!("{:05}", self.dst_id);
        if to == tg || to == self.id {
            true
        } else {
            info!(to = %to, tg = %tg, "upload not for this node");
            false
        }
    }

    fn take_serial(&mut self, gps: bool) {
        let off = 5 + if gps { 18 } else { 0 };
        self.serial.copy_from_slice(&self.command[off..off + 6]);
    }

    fn process_upload_message(&mut self, gps: bool) -> WxStatus {
        if !self.upload_is_for_us(gps) {
            return WxStatus::None;
        }
        info!(source = %self.source, "message upload");
        self.take_serial(gps);
        let source = pad_callsign(&self.source);
        self.storage.store_text_message(&self.command[5..], &source, gps);
        self.status = ReplyState::Upload;
        self.timer.start();
        WxStatus::Upload
    }

    fn process_upload_picture(&mut self, gps: bool) -> WxStatus {
        self.end_picture = false;
        if !self.upload_is_for_us(gps) {
            return WxStatus::None;
        }
        info!(source = %self.source, "picture upload");
        self.take_serial(gps);
        self.last_block_ref = None;
        let source = pad_callsign(&self.source);
        if !self.storage.store_picture(&self.command[5..], &source, gps) {
            return WxStatus::None;
        }
        WxStatus::Picture
    }

    /// Abort an unfinished upload (transfer watchdog fired).
    pub fn abort_picture(&mut self) {
        self.storage.abort_upload();
        self.end_picture = true;
    }

    /// Drive the reply debounce and picture streaming timers.
    pub fn clock(&mut self, ms: u64) {
        self.timer.clock(ms);
        if self.timer.is_running() && self.timer.has_expired() {
            match self.status {
                ReplyState::Dx => self.send_dx_reply(),
                ReplyState::All => self.send_all_reply(),
                ReplyState::Search => self.send_search_reply(),
                ReplyState::LocalNews => self.send_local_news_reply(),
                ReplyState::News => self.send_news_reply(),
                ReplyState::Category => self.send_category_reply(),
                ReplyState::List => self.send_list_reply(),
                ReplyState::GetMessage => self.send_get_message_reply(),
                ReplyState::Upload => {
                    self.send_upload_reply();
                    self.end_picture = true;
                }
                ReplyState::None => {}
            }
            self.status = ReplyState::None;
            self.timer.stop();
        }

        self.ptimer.clock(ms);
        if self.ptimer.is_running() && self.ptimer.has_expired() {
            self.ptimer.stop();
            match self.picture_state {
                PictureState::Begin => self.send_picture_begin(),
                PictureState::Data => self.send_picture_data(),
                PictureState::End => self.send_picture_end(),
                PictureState::None => {}
            }
        }
    }

    // ---- reply builders ------------------------------------------------

    /// Fill the node-identification preamble shared by several replies.
    fn fill_node_header(&self, data: &mut [u8], resp: &[u8; 4]) {
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(resp);
        data[5..10].copy_from_slice(self.id.as_bytes());
        data[10..20].copy_from_slice(&self.node);
        data[20..34].copy_from_slice(&self.name);
    }

    /// Fill id/name/count/description for a destination id at the fixed
    /// CONNECT/DX offsets.
    fn fill_destination(&self, data: &mut [u8], id: u32, count: u32) {
        data[36..41].copy_from_slice(format!("{:05}", id).as_bytes());
        let mut name = self.name_tg(id);
        name.truncate(16);
        while name.len() < 16 {
            name.push(' ');
        }
        data[41..57].copy_from_slice(name.as_bytes());
        data[57..60].copy_from_slice(format!("{:03}", count.min(999)).as_bytes());
        let desc = match self.registry.find_by_id(id) {
            Some(entry) => entry.desc.clone(),
            None => "Description   ".to_string(),
        };
        data[70..84].copy_from_slice(&desc.as_bytes()[..14]);
    }

    fn finish_reply(&mut self, data: &mut [u8], len: usize, dst: Option<&str>) {
        data[len] = 0x03;
        data[len + 1] = crc8(&data[..=len]);
        let payload = data[..len + 2].to_vec();
        self.create_reply(&payload, dst);
        self.seq_no = self.seq_no.wrapping_add(1);
    }

    fn send_dx_reply(&mut self) {
        let mut data = [0u8; 150];
        data[..128].fill(b' ');
        self.fill_node_header(&mut data, &DX_RESP);

        if self.dst_id == 0 {
            data[34] = b'1';
            data[35] = b'2';
            data[57..60].copy_from_slice(b"000");
        } else {
            data[34] = b'1';
            data[35] = b'5';
            let resolved = self.registry.resolve(self.dst_id);
            self.fill_destination(&mut data, self.dst_id, resolved.count);
        }

        let (offset, sign) = if self.tx_frequency >= self.rx_frequency {
            (self.tx_frequency - self.rx_frequency, '-')
        } else {
            (self.rx_frequency - self.tx_frequency, '+')
        };
        let freq_khz = (self.tx_frequency % 1_000_000 + 500) / 1000;
        let freq = format!(
            "{:05}.{:03}000{}{:03}.{:06}",
            self.tx_frequency / 1_000_000,
            freq_khz,
            sign,
            offset / 1_000_000,
            offset % 1_000_000
        );
        data[84..84 + 23].copy_from_slice(&freq.as_bytes()[..23]);

        self.finish_reply(&mut data, 127, None);
    }

    /// CONNECT acknowledgement, also driven by the orchestrator once the
    /// unlink handshake completes.
    pub fn send_connect_reply(&mut self, dst_id: u32) {
        self.dst_id = dst_id;
        let resolved = self.registry.resolve(dst_id);

        let mut data = [0u8; 110];
        data[..90].fill(b' ');
        self.fill_node_header(&mut data, &CONN_RESP);
        data[34] = b'1';
        data[35] = b'5';
        self.fill_destination(&mut data, dst_id, resolved.count);
        data[84..89].copy_from_slice(b"00000");
        self.finish_reply(&mut data, 89, None);
    }

    pub fn send_disconnect_reply(&mut self) {
        let mut data = [0u8; 110];
        data[..90].fill(b' ');
        self.fill_node_header(&mut data, &CONN_RESP);
        data[34] = b'1';
        data[35] = b'2';
        data[57..60].copy_from_slice(b"000");
        self.finish_reply(&mut data, 89, None);
    }

    /// Shared body of the ALL/SEARCH/CATEGORY listings: 50-byte rows.
    fn fill_tg_rows(
        data: &mut [u8],
        entries: &[Arc<registry::TgEntry>],
        row_tag: u8,
        mut offset: usize,
    ) -> usize {
        for entry in entries {
            data[offset..offset + 50].fill(b' ');
            data[offset] = row_tag;
            data[offset + 1..offset + 6].copy_from_slice(entry.short_id().as_bytes());
            data[offset + 6..offset + 22].copy_from_slice(&entry.name.as_bytes()[..16]);
            data[offset + 22..offset + 25].copy_from_slice(entry.count.as_bytes());
            data[offset + 35..offset + 49].copy_from_slice(&entry.desc.as_bytes()[..14]);
            data[offset + 49] = 0x0D;
            offset += 50;
        }
        offset
    }

    fn send_all_reply(&mut self) {
        let mut data = [0u8; COMMAND_CAPACITY];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&ALL_RESP);
        data[5] = b'2';
        data[6] = b'1';
        data[7..12].copy_from_slice(self.id.as_bytes());
        data[12..22].copy_from_slice(&self.node);

        let all = self.registry.snapshot();
        let total = all.len().min(999);
        let start = (self.start as usize).min(total);
        let page: Vec<_> = all[start..].iter().take(20).cloned().collect();
        let shown = page.len();

        data[22..28].copy_from_slice(format!("{:03}{:03}", shown, total).as_bytes());
        data[28] = 0x0D;

        let mut offset = Self::fill_tg_rows(&mut data, &page, b'5', 29);
        while offset < 1029 {
            data[offset] = 0x20;
            offset += 1;
        }
        self.finish_reply(&mut data, offset, None);
    }

    fn send_search_reply(&mut self) {
        let found = if self.search.trim().is_empty() {
            Vec::new()
        } else {
            self.registry.search(&self.search)
        };
        if found.is_empty() {
            self.send_search_not_found_reply();
            return;
        }

        let mut data = [0u8; COMMAND_CAPACITY];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&ALL_RESP);
        data[5] = b'0';
        data[6] = b'2';
        data[7..12].copy_from_slice(self.id.as_bytes());
        data[12..22].copy_from_slice(&self.node);
        data[22] = b'1';

        let total = found.len().min(999);
        let start = (self.start as usize).min(total);
        let page: Vec<_> = found[start..].iter().take(20).cloned().collect();
        data[23..28].copy_from_slice(format!("{:02}{:03}", page.len(), total).as_bytes());
        data[28] = 0x0D;

        let mut offset = Self::fill_tg_rows(&mut data, &page, b'1', 29);
        while offset < 1029 {
            data[offset] = 0x20;
            offset += 1;
        }
        self.finish_reply(&mut data, offset, None);
    }

    fn send_search_not_found_reply(&mut self) {
        let mut data = [0u8; 70];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&ALL_RESP);
        data[5] = b'0';
        data[6] = b'1';
        data[7..12].copy_from_slice(self.id.as_bytes());
        data[12..22].copy_from_slice(&self.node);
        data[22..28].copy_from_slice(b"100000");
        data[28] = 0x0D;
        self.finish_reply(&mut data, 29, None);
    }

    fn send_category_reply(&mut self) {
        let mut data = [0u8; COMMAND_CAPACITY];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&ALL_RESP);
        data[5] = b'2';
        data[6] = b'1';
        data[7..12].copy_from_slice(self.id.as_bytes());
        data[12..22].copy_from_slice(&self.node);

        let page: Vec<_> = self.category.iter().take(20).cloned().collect();
        data[22..28].copy_from_slice(format!("{:03}{:03}", page.len(), page.len()).as_bytes());
        data[28] = 0x0D;

        let mut offset = Self::fill_tg_rows(&mut data, &page, b'5', 29);
        // Category rows show no live counts
        for row in 0..page.len() {
            data[29 + row * 50 + 22..29 + row * 50 + 25].copy_from_slice(b"000");
        }
        while offset < 1029 {
            data[offset] = 0x20;
            offset += 1;
        }
        self.finish_reply(&mut data, offset, None);
    }

    fn send_local_news_reply(&mut self) {
        let mut data = [0u8; COMMAND_CAPACITY];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&ALL_RESP);
        data[5..7].copy_from_slice(b"02");
        data[7..12].copy_from_slice(self.id.as_bytes());
        data[12..22].copy_from_slice(&self.node);
        data[22..28].copy_from_slice(b"A01001");
        data[28] = 0x0D;

        let offset = 29;
        data[offset..offset + 50].fill(b' ');
        data[offset] = b'3';
        data[offset + 1..offset + 6].copy_from_slice(self.id.as_bytes());
        data[offset + 6..offset + 16].copy_from_slice(&self.node);
        data[offset + 22..offset + 25].copy_from_slice(b"001");
        data[offset + 25..offset + 35].copy_from_slice(&self.callsign);
        data[offset + 35..offset + 49].copy_from_slice(&self.name);
        data[offset + 49] = 0x0D;

        info!("sending local news room");
        let source = self.source.clone();
        self.finish_reply_to(&mut data, offset + 50, &source);
    }

    fn send_news_reply(&mut self) {
        let mut data = [0u8; 40];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&NEWS_RESP);
        data[5..7].copy_from_slice(b"01");
        data[7..12].copy_from_slice(&self.news_source);
        data[12..22].copy_from_slice(b"     00000");
        data[22] = 0x0D;
        let source = self.source.clone();
        self.finish_reply_to(&mut data, 23, &source);
    }

    fn send_list_reply(&mut self) {
        let mut data = [0u8; COMMAND_CAPACITY];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&LIST_RESP);
        let dest = field_string(&self.news_source);
        info!(list_type = %(self.list_type as char), dest = %dest, "sending download list");
        let used = self
            .storage
            .get_list(&mut data[5..], self.list_type, &dest, self.start);
        let source = self.source.clone();
        self.finish_reply_to(&mut data, 5 + used, &source);
    }

    fn send_get_message_reply(&mut self) {
        let mut data = [0u8; COMMAND_CAPACITY];
        let dest = field_string(&self.news_source);
        let source = self.source.clone();
        match self.storage.get_message(&mut data, self.number, &dest) {
            Some((used, MessageKind::Text)) => {
                data[0] = self.seq_no;
                data[1..5].copy_from_slice(&GET_MSG_RESP);
                info!(number = self.number, "sending message");
                self.finish_reply_to(&mut data, 5 + used, &source);
            }
            Some((used, MessageKind::Picture)) => {
                data[0] = self.seq_no;
                data[1..5].copy_from_slice(&PICT_PREAMB_RESP);
                info!(number = self.number, "sending picture preamble");
                self.seq_no = self.seq_no.wrapping_add(2);
                self.finish_reply_to(&mut data, 5 + used, &source);
                self.picture_state = PictureState::Begin;
                self.ptimer.start_with(PICTURE_TICK_MS);
            }
            None => {
                data[0] = self.seq_no;
                data[1..5].copy_from_slice(&GET_MSG_RESP);
                info!(number = self.number, "requested message not found");
                self.finish_reply_to(&mut data, 5, &source);
            }
        }
    }

    fn send_picture_begin(&mut self) {
        let mut data = [0u8; 150];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&PICT_BEGIN_RESP_GPS);
        let dest = field_string(&self.news_source);
        let key = self.download_key.clone();
        let Some(used) = self
            .storage
            .get_picture_header(&mut data, self.number, &dest, &key)
        else {
            self.picture_state = PictureState::None;
            return;
        };
        let source = self.source.clone();
        self.finish_reply_to(&mut data, 5 + used, &source);
        self.pcount = 0;
        self.picture_state = PictureState::Data;
        self.ptimer.start_with(PICTURE_TICK_MS);
    }

    fn send_picture_data(&mut self) {
        let mut data = [0u8; COMMAND_CAPACITY];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&PICT_DATA_RESP);
        let n = self.storage.get_picture_data(&mut data[5..], self.pcount);
        self.pcount += n as u32;
        let source = self.source.clone();
        self.finish_reply_to(&mut data, n + 10, &source);

        if n == 1024 {
            self.picture_state = PictureState::Data;
            self.ptimer.start_with(PICTURE_CHUNK_GAP_MS);
        } else {
            self.picture_state = PictureState::End;
            // Pace the final short chunk proportionally to its length
            let wait_ms = (n as u64 * 5000) / 1024;
            self.ptimer.start_with(wait_ms.max(1));
        }
    }

    fn send_picture_end(&mut self) {
        let mut data = [0u8; 30];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&PICT_END_RESP);
        let sum = self.storage.sum_check();
        let trailer = [
            0x50,
            0x00,
            self.storage.picture_seq(),
            0x00,
            ((sum >> 16) & 0xFF) as u8,
            ((sum >> 8) & 0xFF) as u8,
            (sum & 0xFF) as u8,
        ];
        data[5..12].copy_from_slice(&trailer);
        info!(sum, "picture download complete");
        let source = self.source.clone();
        self.finish_reply_to(&mut data, 12, &source);
        self.storage.end_download();
        self.picture_state = PictureState::None;
        self.end_picture = true;
    }

    fn send_upload_reply(&mut self) {
        let mut data = [0u8; 60];
        data[0] = self.seq_no;
        data[1..5].copy_from_slice(&UP_ACK);
        data[5..11].copy_from_slice(&self.serial);
        data[11..16].copy_from_slice(&self.talky_key);
        let source = pad_callsign(&self.source);
        data[16..26].copy_from_slice(&source);
        info!("sending upload acknowledgement");
        let src = self.source.clone();
        self.finish_reply_to(&mut data, 26, &src);
    }

    fn finish_reply_to(&mut self, data: &mut [u8], len: usize, dst: &str) {
        if dst.is_empty() {
            self.finish_reply(data, len, None);
        } else {
            let dst = dst.to_string();
            self.finish_reply(data, len, Some(&dst));
        }
    }

    // ---- reply framer --------------------------------------------------

    fn calculate_ft(length: usize, offset: usize) -> u8 {
        match length - offset {
            l if l > 220 => 7,
            l if l > 180 => 6,
            l if l > 140 => 5,
            l if l > 100 => 4,
            l if l > 60 => 3,
            l if l > 20 => 2,
            _ => 1,
        }
    }

    /// Emit a command payload as a header + communications + terminator
    /// packet chain.
    fn create_reply(&self, data: &[u8], dst_callsign: Option<&str>) {
        if data.is_empty() {
            warn!("refusing to frame an empty reply");
            return;
        }
        let mut length = data.len();

        let mut block_total = 0u8;
        if length > 260 {
            block_total = 1 + ((length - 260) / 259) as u8;
            length += block_total as usize;
        }

        // Round up to whole 40-byte frame pairs past the leading 20
        length = if length > 20 {
            let mut blocks = (length - 20) / 40;
            if (length % 40) > 0 {
                blocks += 1;
            }
            blocks * 40 + 20
        } else {
            20
        };

        // Slack past the rounded length keeps the tail slices in range
        let mut padded = vec![0u8; length + 40];
        padded[..data.len().min(length)].copy_from_slice(&data[..data.len().min(length)]);

        let mut frame_total = Self::calculate_ft(length, 0);
        let mut seq_no = 0u8;

        let mut buffer = [0u8; FRAME_LENGTH];
        buffer[..34].copy_from_slice(&self.header);
        if let Some(dst) = dst_callsign {
            buffer[24..34].copy_from_slice(&pad_callsign(dst));
        }

        let region = REGION_OFFSET;
        add_sync(&mut buffer[region..]);

        let mut fich = Fich {
            fi: FI_HEADER,
            block_total,
            frame_total,
            ..Fich::default()
        };
        fich.encode(&mut buffer[region..]);
        write_data_fr_mode_data1(&mut buffer[region..], &self.csd1);
        write_data_fr_mode_data2(&mut buffer[region..], &self.csd2);
        buffer[34] = seq_no;
        seq_no = seq_no.wrapping_add(2);
        self.write_packet(&buffer);

        fich.fi = FI_COMMUNICATIONS;

        let mut frame_number = 0u8;
        let mut block_number = 0u8;
        let mut offset = 0usize;

        while offset < length {
            match frame_number {
                0 => {
                    frame_total = Self::calculate_ft(length, offset);
                    write_data_fr_mode_data1(&mut buffer[region..], &self.csd1);
                    write_data_fr_mode_data2(&mut buffer[region..], &self.csd2);
                }
                1 => {
                    write_data_fr_mode_data1(&mut buffer[region..], &self.csd3);
                    if block_number == 0 {
                        write_data_fr_mode_data2(&mut buffer[region..], &padded[offset..]);
                        offset += 20;
                    } else {
                        // Continuation blocks open with a filler byte
                        let mut temp = [0u8; 20];
                        temp[1..20].copy_from_slice(&padded[offset..offset + 19]);
                        write_data_fr_mode_data2(&mut buffer[region..], &temp);
                        offset += 19;
                    }
                }
                _ => {
                    write_data_fr_mode_data1(&mut buffer[region..], &padded[offset..]);
                    offset += 20;
                    write_data_fr_mode_data2(&mut buffer[region..], &padded[offset..]);
                    offset += 20;
                }
            }

            fich.frame_total = frame_total;
            fich.frame_number = frame_number;
            fich.block_total = block_total;
            fich.block_number = block_number;
            fich.encode(&mut buffer[region..]);

            buffer[34] = seq_no;
            seq_no = seq_no.wrapping_add(2);
            self.write_packet(&buffer);

            frame_number += 1;
            if frame_number >= 8 {
                frame_number = 0;
                block_number += 1;
            }
        }

        fich.fi = FI_TERMINATOR;
        fich.frame_number = frame_number;
        fich.block_number = block_number;
        fich.encode(&mut buffer[region..]);
        write_data_fr_mode_data1(&mut buffer[region..], &self.csd1);
        write_data_fr_mode_data2(&mut buffer[region..], &self.csd2);
        buffer[34] = seq_no | 0x01;
        self.write_packet(&buffer);
    }

    fn write_packet(&self, buffer: &[u8; FRAME_LENGTH]) {
        if let Err(e) = self.network.write_packet(buffer) {
            debug!(error = %e, "reply packet write failed");
        }
    }
}

fn ascii_number(bytes: &[u8]) -> u32 {
    let text: String = bytes
        .iter()
        .map(|&b| b as char)
        .filter(|c| c.is_ascii_digit())
        .collect();
    text.parse().unwrap_or(0)
}

fn field_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

fn hex_dump(data: &[u8]) -> String {
    let shown = data.len().min(64);
    let mut out = String::with_capacity(shown * 3);
    for b in &data[..shown] {
        out.push_str(&format!("{:02X} ", b));
    }
    if data.len() > shown {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;

    /// Captures every packet the engine frames.
    #[derive(Default)]
    struct CaptureSink {
        packets: Mutex<Vec<Vec<u8>>>,
    }

    impl PacketSink for CaptureSink {
        fn write_packet(&self, data: &[u8]) -> io::Result<()> {
            self.packets.lock().push(data.to_vec());
            Ok(())
        }
    }

    fn test_registry() -> Arc<TgRegistry> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TGList.txt");
        std::fs::write(
            &path,
            "214;0;25;Spain;Nacional\n21460;1;3;Andalucia;Regional\n",
        )
        .unwrap();
        let registry = Arc::new(TgRegistry::new(&path, false));
        registry.load().unwrap();
        std::mem::forget(dir);
        registry
    }

    fn test_engine() -> (Arc<CaptureSink>, WiresX, tempfile::TempDir) {
        let sink = Arc::new(CaptureSink::default());
        let dir = tempfile::tempdir().unwrap();
        let storage = WiresXStorage::new(dir.path());
        let mut engine = WiresX::new(
            storage,
            "EA7EE",
            "ND",
            sink.clone(),
            test_registry(),
            "HE5Gbv",
        );
        engine.set_info("Huelva", 434_000_000, 434_000_000, 214);
        (sink, engine, dir)
    }

    /// Reassemble a framed reply chain the way the handset would: slices
    /// accumulate until the packet whose (fn, bn) equals the announced
    /// (ft, bt); later padding frames are ignored.
    fn reassemble(packets: &[Vec<u8>]) -> Vec<u8> {
        let mut command = vec![0u8; COMMAND_CAPACITY];
        let mut len = 0usize;
        for packet in packets {
            let region = &packet[REGION_OFFSET..];
            let fich = Fich::decode(region).expect("valid FICH");
            if fich.fi != FI_COMMUNICATIONS {
                continue;
            }
            let fn_ = fich.frame_number as usize;
            let bn = fich.block_number as usize;
            let mut slice = [0u8; 20];
            if fn_ == 0 {
                continue;
            } else if fn_ == 1 {
                assert!(read_data_fr_mode_data2(region, &mut slice));
                command[bn * 260..bn * 260 + 20].copy_from_slice(&slice);
            } else {
                let base = bn * 260 + (fn_ - 2) * 40 + 20;
                assert!(read_data_fr_mode_data1(region, &mut slice));
                command[base..base + 20].copy_from_slice(&slice);
                assert!(read_data_fr_mode_data2(region, &mut slice));
                command[base + 20..base + 40].copy_from_slice(&slice);
            }
            if fn_ == fich.frame_total as usize && bn == fich.block_total as usize {
                len = bn * 260 + fn_.saturating_sub(1) * 40 + 20;
                break;
            }
        }
        command.truncate(len);
        command
    }

    fn assert_chain_shape(packets: &[Vec<u8>]) {
        assert!(packets.len() >= 2);
        let first = Fich::decode(&packets[0][REGION_OFFSET..]).unwrap();
        assert_eq!(first.fi, FI_HEADER);
        let last_packet = packets.last().unwrap();
        let last = Fich::decode(&last_packet[REGION_OFFSET..]).unwrap();
        assert_eq!(last.fi, FI_TERMINATOR);
        assert_eq!(last_packet[34] & 0x01, 0x01);
        for (i, packet) in packets[..packets.len() - 1].iter().enumerate() {
            assert_eq!(packet[34], (i as u8) * 2);
        }
    }

    #[test]
    fn test_connect_reply_fields() {
        let (sink, mut engine, _dir) = test_engine();
        engine.send_connect_reply(214);

        let packets = sink.packets.lock().clone();
        assert_chain_shape(&packets);

        let data = reassemble(&packets);
        // End marker and CRC discipline
        let marker = (0..data.len()).rev().find(|&i| data[i] == 0x03).unwrap();
        assert_eq!(marker, 89);
        assert_eq!(crc8(&data[..=marker]), data[marker + 1]);
        // Connected status and destination fields
        assert_eq!(data[34], b'1');
        assert_eq!(data[35], b'5');
        assert_eq!(&data[36..41], b"00214");
        assert_eq!(&data[41..46], b"Spain");
        assert_eq!(&data[57..60], b"025");
        assert_eq!(&data[70..78], b"Nacional");
    }

    #[test]
    fn test_dx_reply_on_idle_node() {
        let (sink, mut engine, _dir) = test_engine();
        engine.dst_id = 0;
        engine.send_dx_reply();

        let packets = sink.packets.lock().clone();
        assert_chain_shape(&packets);
        let data = reassemble(&packets);
        let marker = (0..data.len()).rev().find(|&i| data[i] == 0x03).unwrap();
        assert_eq!(marker, 127);
        assert_eq!(crc8(&data[..=marker]), data[marker + 1]);
        assert_eq!(&data[34..36], b"12");
        assert_eq!(&data[57..60], b"000");
        assert_eq!(&data[84..107], b"00434.000000-000.000000");
    }

    #[test]
    fn test_all_reply_lists_pages() {
        let (sink, mut engine, _dir) = test_engine();
        engine.start = 0;
        engine.send_all_reply();

        let packets = sink.packets.lock().clone();
        assert_chain_shape(&packets);
        let data = reassemble(&packets);
        assert_eq!(&data[22..28], b"002002");
        assert_eq!(data[28], 0x0D);
        assert_eq!(data[29], b'5');
        assert_eq!(&data[30..35], b"00214");
        assert_eq!(data[29 + 49], 0x0D);
    }

    #[test]
    fn test_command_reassembly_and_dispatch() {
        let (_sink, mut engine, _dir) = test_engine();

        // Build a CONNECT command: seq, op, 6-digit id, end marker, CRC.
        let mut command = vec![0u8; 20];
        command[0] = 0x00;
        command[1..4].copy_from_slice(&CONN_REQ);
        command[4] = 0x26;
        command[5..11].copy_from_slice(b"021460");
        command[11] = 0x03;
        command[12] = crc8(&command[..12]);

        // Frame it as fn=1 carrying the first 20 bytes (ft=1, bt=0).
        let mut region = [0u8; crate::ysf::REGION_LENGTH];
        write_data_fr_mode_data2(&mut region, &command);
        let fich = Fich {
            fi: FI_COMMUNICATIONS,
            dt: DT_DATA_FR_MODE,
            frame_number: 1,
            frame_total: 1,
            ..Fich::default()
        };
        let status = engine.process(&region, b"EA7EE     ", &fich);
        assert_eq!(status, WxStatus::Connect);
        assert_eq!(engine.dst_id(), 21460);
    }

    #[test]
    fn test_bad_crc_dropped() {
        let (_sink, mut engine, _dir) = test_engine();
        let mut command = vec![0u8; 20];
        command[1..4].copy_from_slice(&CONN_REQ);
        command[5..11].copy_from_slice(b"021460");
        command[11] = 0x03;
        command[12] = 0xEE; // wrong CRC

        let mut region = [0u8; crate::ysf::REGION_LENGTH];
        write_data_fr_mode_data2(&mut region, &command);
        let fich = Fich {
            fi: FI_COMMUNICATIONS,
            dt: DT_DATA_FR_MODE,
            frame_number: 1,
            frame_total: 1,
            ..Fich::default()
        };
        assert_eq!(engine.process(&region, b"EA7EE     ", &fich), WxStatus::None);
    }

    #[test]
    fn test_reply_debounce() {
        let (sink, mut engine, _dir) = test_engine();
        engine.status = ReplyState::Dx;
        engine.timer.start();
        engine.clock(500);
        assert!(sink.packets.lock().is_empty());
        engine.clock(600);
        assert!(!sink.packets.lock().is_empty());
    }

    #[test]
    fn test_picture_download_chain() {
        let (sink, mut engine, dir) = test_engine();

        // Seed a stored picture: a 1500-byte JPG for destination 21400
        let mut upload = Vec::new();
        upload.extend_from_slice(b"SER001");
        upload.extend_from_slice(b"202501021200");
        upload.extend_from_slice(b"202501021159");
        upload.extend_from_slice(b"21400");
        upload.extend_from_slice(&[b' '; 10]);
        upload.extend_from_slice(&[b'S'; 16]);
        let mut storage = WiresXStorage::new(dir.path());
        assert!(storage.store_picture(&upload, b"EA7EE     ", false));
        let block: Vec<u8> = (0..1000).map(|i| (i % 255) as u8).collect();
        assert!(storage.add_picture_data(&block, block.len()));
        engine.storage = storage;

        engine.news_source.copy_from_slice(b"21400");
        engine.number = 1;
        engine.source = "EA7EE".to_string();
        engine.status = ReplyState::GetMessage;
        engine.timer.start();
        engine.clock(REPLY_DEBOUNCE_MS);

        // Preamble chain sent, BEGIN scheduled
        assert!(!sink.packets.lock().is_empty());
        assert_eq!(engine.picture_state, PictureState::Begin);

        sink.packets.lock().clear();
        engine.clock(PICTURE_TICK_MS);
        assert_eq!(engine.picture_state, PictureState::Data);

        sink.packets.lock().clear();
        engine.clock(PICTURE_TICK_MS);
        // Short file: single DATA chunk, END follows after the scaled gap
        assert_eq!(engine.picture_state, PictureState::End);
        let data = reassemble(&sink.packets.lock().clone());
        assert_eq!(&data[1..5], &PICT_DATA_RESP);

        sink.packets.lock().clear();
        engine.clock(5000);
        assert_eq!(engine.picture_state, PictureState::None);
        assert!(engine.end_picture());
        let data = reassemble(&sink.packets.lock().clone());
        assert_eq!(&data[1..5], &PICT_END_RESP);
        // Trailer carries the low 24 bits of the running checksum
        let sum: u32 = block
            .iter()
            .enumerate()
            .filter(|&(i, _)| ![250usize, 510, 770].contains(&i))
            .map(|(_, &b)| b as u32)
            .sum();
        assert_eq!(data[9], ((sum >> 16) & 0xFF) as u8);
        assert_eq!(data[10], ((sum >> 8) & 0xFF) as u8);
        assert_eq!(data[11], (sum & 0xFF) as u8);
    }

    #[test]
    fn test_zero_length_payload_never_framed_empty() {
        let (sink, engine, _dir) = test_engine();
        engine.create_reply(&[], None);
        assert!(sink.packets.lock().is_empty());
    }
}
