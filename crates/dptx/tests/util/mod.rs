#![allow(dead_code)]

//! Register-level simulated sink for integration tests.
//!
//! `SimSink` implements [`DptxHal`] with a behavioral model of the AUX
//! engine (reply status, DEFER/NACK injection, the ACK-with-zero-bytes
//! quirk), a DPCD byte map with the side effects the driver depends on
//! (training status synthesis, payload-table update latching, sideband
//! request/reply windows), an I2C EDID model, and an MST branch tree that
//! answers LINK_ADDRESS / ENUM_PATH_RESOURCES / ALLOCATE_PAYLOAD with
//! wire-exact sideband replies built from the same codec the driver parses
//! them with.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use dptx::regs::*;
use dptx::{DptxConfig, DptxHal, DptxSession, LinkRate, PlugLatch, SocOps};
use dptx_sideband::{
    body_crc, encode_reply, strip_body_crc, Guid, LinkAddressReply, PeerDeviceType, PortInfo,
    RelativeAddress, SidebandMsgHeader, SidebandReply,
};

const DOWN_REQ_BASE: u32 = 0x1000;
const DOWN_REP_BASE: u32 = 0x1400;
const WINDOW: usize = 256;
const REPLY_CHUNK: usize = 48;

/// When the sink reports clock recovery / channel equalization as done.
#[derive(Debug, Clone, Copy)]
pub struct TrainingModel {
    /// Highest LINK_BW_SET code that achieves lock.
    pub trainable_rate: u8,
    /// Highest LANE_COUNT_SET that achieves lock.
    pub trainable_lanes: u8,
    /// Drive level the sink keeps requesting until the source programs it.
    pub required_swing: u8,
    /// Lanes beyond this equalize never (CR still locks).
    pub eq_max_lanes: u8,
}

impl Default for TrainingModel {
    fn default() -> Self {
        Self {
            trainable_rate: 0x1E,
            trainable_lanes: 4,
            required_swing: 0,
            eq_max_lanes: 4,
        }
    }
}

/// MST branch device for the sideband model.
#[derive(Debug, Clone)]
pub struct SimBranch {
    pub guid: Guid,
    pub ports: Vec<SimPort>,
}

#[derive(Debug, Clone)]
pub enum SimPort {
    Sink { port: u8, guid: Guid },
    Branch { port: u8, branch: SimBranch },
}

pub struct SimState {
    pub now_us: u64,

    // Controller registers.
    aux_sts: u32,
    aux_data: [u32; 4],
    phyif: u32,
    tps_sel: u32,
    lane_drive: [u32; 4],
    cctrl: u32,
    soft_reset: u32,
    mst_ctrl: u32,
    pub vcp_table: [u32; MST_VCP_TABLE_REGS],

    // Sink-side model.
    pub dpcd: HashMap<u32, u8>,
    pub model: TrainingModel,
    pub edid: Option<Vec<u8>>,
    i2c_offset: usize,
    i2c_segment: usize,

    // Fault injection.
    pub nack_all: bool,
    pub defer_count: u32,
    pub ack_zero_reads: u32,
    pub bogus_first_reply: bool,

    // Sideband model. `None` leaves DOWN_REP_MSG_RDY forever clear, which
    // the driver reads as "sideband unsupported".
    pub sideband: Option<SimBranch>,
    pub ready_in_esi: bool,
    down_req: [u8; WINDOW],
    down_req_filled: usize,
    down_rep_window: [u8; WINDOW],
    down_rep_chunks: VecDeque<[u8; WINDOW]>,

    // Records for assertions.
    pub soft_resets: u32,
    pub payload_writes: Vec<(u8, u8, u8)>,
    pub act_triggers: u32,
    pub xmit_enabled_ever: bool,
    pub allocate_payload_reqs: Vec<(u8, u8, u16)>,
    pub enum_path_reqs: Vec<u8>,
    pub clear_payload_reqs: u32,

    // Surprise-unplug injection.
    pub latch: Option<Arc<PlugLatch>>,
    pub unplug_at_us: Option<u64>,
}

impl SimState {
    fn new() -> Self {
        Self {
            now_us: 0,
            aux_sts: 0,
            aux_data: [0; 4],
            phyif: 0,
            tps_sel: 0,
            lane_drive: [0; 4],
            cctrl: 0,
            soft_reset: 0,
            mst_ctrl: 0,
            vcp_table: [0; MST_VCP_TABLE_REGS],
            dpcd: HashMap::new(),
            model: TrainingModel::default(),
            edid: None,
            i2c_offset: 0,
            i2c_segment: 0,
            nack_all: false,
            defer_count: 0,
            ack_zero_reads: 0,
            bogus_first_reply: false,
            sideband: None,
            ready_in_esi: false,
            down_req: [0; WINDOW],
            down_req_filled: 0,
            down_rep_window: [0; WINDOW],
            down_rep_chunks: VecDeque::new(),
            soft_resets: 0,
            payload_writes: Vec::new(),
            act_triggers: 0,
            xmit_enabled_ever: false,
            allocate_payload_reqs: Vec::new(),
            enum_path_reqs: Vec::new(),
            clear_payload_reqs: 0,
            latch: None,
            unplug_at_us: None,
        }
    }

    pub fn dpcd_u8(&self, addr: u32) -> u8 {
        self.dpcd.get(&addr).copied().unwrap_or(0)
    }

    /// Transmitter-enable bits currently set in the PHY interface register.
    pub fn xmit_lanes(&self) -> u32 {
        (self.phyif & PHYIF_XMIT_EN_MASK) >> PHYIF_XMIT_EN_SHIFT
    }

    pub fn vcp_slot(&self, slot: usize) -> u8 {
        ((self.vcp_table[slot / 8] >> (4 * (slot % 8))) & 0xF) as u8
    }

    fn write_reg(&mut self, offset: u32, value: u32) {
        match offset {
            REG_AUX_STS => self.aux_sts &= !(value & AUX_STS_REPLY_RECEIVED),
            REG_AUX_CMD => self.exec_aux(value),
            o if (aux_data(0)..=aux_data(3)).contains(&o) => {
                self.aux_data[((o - aux_data(0)) / 4) as usize] = value;
            }
            REG_PHYIF_CTRL => {
                self.phyif = value & !PHYIF_BUSY;
                if value & PHYIF_XMIT_EN_MASK != 0 {
                    self.xmit_enabled_ever = true;
                }
            }
            REG_PHY_TPS_SEL => self.tps_sel = value,
            o if (phy_lane_drive(0)..=phy_lane_drive(3)).contains(&o) => {
                self.lane_drive[((o - phy_lane_drive(0)) / 4) as usize] = value;
            }
            REG_CCTRL => self.cctrl = value,
            REG_SOFT_RESET => {
                if value & SOFT_RESET_AUX != 0 && self.soft_reset & SOFT_RESET_AUX == 0 {
                    self.soft_resets += 1;
                }
                self.soft_reset = value;
            }
            REG_MST_CTRL => {
                if value & MST_CTRL_ACT_TRIGGER != 0 {
                    self.act_triggers += 1;
                }
                // ACT is self-clearing; never latch the trigger bit.
                self.mst_ctrl = value & !MST_CTRL_ACT_TRIGGER;
            }
            o if (mst_vcp_table(0)..=mst_vcp_table(MST_VCP_TABLE_REGS - 1)).contains(&o) => {
                self.vcp_table[((o - mst_vcp_table(0)) / 4) as usize] = value;
            }
            _ => {}
        }
    }

    fn read_reg(&mut self, offset: u32) -> u32 {
        match offset {
            REG_AUX_STS => self.aux_sts,
            REG_AUX_CMD => 0,
            o if (aux_data(0)..=aux_data(3)).contains(&o) => {
                self.aux_data[((o - aux_data(0)) / 4) as usize]
            }
            REG_PHYIF_CTRL => self.phyif,
            REG_PHY_TPS_SEL => self.tps_sel,
            o if (phy_lane_drive(0)..=phy_lane_drive(3)).contains(&o) => {
                self.lane_drive[((o - phy_lane_drive(0)) / 4) as usize]
            }
            REG_CCTRL => self.cctrl,
            REG_SOFT_RESET => self.soft_reset,
            REG_MST_CTRL => self.mst_ctrl,
            o if (mst_vcp_table(0)..=mst_vcp_table(MST_VCP_TABLE_REGS - 1)).contains(&o) => {
                self.vcp_table[((o - mst_vcp_table(0)) / 4) as usize]
            }
            _ => 0,
        }
    }

    fn reply(&mut self, status: u32, bytes_read: u32) {
        self.aux_sts =
            AUX_STS_REPLY_RECEIVED | (bytes_read << AUX_STS_BYTES_READ_SHIFT) | status;
    }

    fn exec_aux(&mut self, cmd: u32) {
        let nibble = cmd >> AUX_CMD_TYPE_SHIFT;
        let addr = (cmd & AUX_CMD_ADDR_MASK) >> AUX_CMD_ADDR_SHIFT;
        let len = ((cmd & AUX_CMD_LEN_MASK) + 1) as usize;
        let address_only = cmd & AUX_CMD_ADDR_ONLY != 0;

        if self.defer_count > 0 {
            self.defer_count -= 1;
            let status = if nibble & 0x8 != 0 { AUX_REPLY_DEFER } else { AUX_REPLY_I2C_DEFER };
            self.reply(status, 0);
            return;
        }

        match nibble {
            AUX_CMD_NATIVE_READ => {
                if self.nack_all {
                    self.reply(AUX_REPLY_NACK, 0);
                    return;
                }
                if self.ack_zero_reads > 0 {
                    self.ack_zero_reads -= 1;
                    self.reply(AUX_REPLY_ACK, 0);
                    return;
                }
                let mut bytes = [0u8; 16];
                for (i, b) in bytes.iter_mut().enumerate().take(len) {
                    *b = self.dpcd_read_byte(addr + i as u32);
                }
                self.load_aux_data(&bytes[..len]);
                self.reply(AUX_REPLY_ACK, len as u32);
            }
            AUX_CMD_NATIVE_WRITE => {
                if self.nack_all {
                    self.reply(AUX_REPLY_NACK, 0);
                    return;
                }
                let bytes = self.take_aux_data(len);
                for (i, b) in bytes.iter().enumerate() {
                    self.dpcd_write_byte(addr + i as u32, *b);
                }
                if (DOWN_REQ_BASE..DOWN_REQ_BASE + WINDOW as u32).contains(&addr) {
                    self.try_process_down_req();
                }
                self.reply(AUX_REPLY_ACK, 0);
            }
            AUX_CMD_I2C_WRITE | AUX_CMD_I2C_WRITE_MOT => {
                if self.edid.is_none() && addr == 0x50 {
                    self.reply(AUX_REPLY_I2C_NACK, 0);
                    return;
                }
                if !address_only {
                    let bytes = self.take_aux_data(len);
                    match addr {
                        0x30 => self.i2c_segment = usize::from(bytes[0]),
                        0x50 => self.i2c_offset = usize::from(bytes[0]),
                        _ => {}
                    }
                }
                self.reply(AUX_REPLY_ACK, 0);
            }
            AUX_CMD_I2C_READ | AUX_CMD_I2C_READ_MOT => {
                let Some(edid) = self.edid.as_ref() else {
                    self.reply(AUX_REPLY_I2C_NACK, 0);
                    return;
                };
                let mut bytes = [0u8; 16];
                let base = self.i2c_segment * 256 + self.i2c_offset;
                for (i, b) in bytes.iter_mut().enumerate().take(len) {
                    *b = edid.get(base + i).copied().unwrap_or(0);
                }
                self.i2c_offset += len;
                self.load_aux_data(&bytes[..len]);
                self.reply(AUX_REPLY_ACK, len as u32);
            }
            _ => self.reply(AUX_REPLY_NACK, 0),
        }
    }

    fn load_aux_data(&mut self, bytes: &[u8]) {
        self.aux_data = [0; 4];
        for (i, &b) in bytes.iter().enumerate() {
            self.aux_data[i / 4] |= u32::from(b) << (8 * (i % 4));
        }
    }

    fn take_aux_data(&mut self, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (self.aux_data[i / 4] >> (8 * (i % 4))) as u8)
            .collect()
    }

    fn dpcd_read_byte(&mut self, addr: u32) -> u8 {
        match addr {
            0x202..=0x207 => self.training_status_byte(addr),
            a if (DOWN_REP_BASE..DOWN_REP_BASE + WINDOW as u32).contains(&a) => {
                let offset = (a - DOWN_REP_BASE) as usize;
                let value = self.down_rep_window[offset];
                if offset == WINDOW - 1 {
                    // The reply window has been consumed; expose the next
                    // chunk, if any.
                    self.promote_down_rep();
                }
                value
            }
            _ => self.dpcd_u8(addr),
        }
    }

    fn dpcd_write_byte(&mut self, addr: u32, value: u8) {
        match addr {
            0x201 | 0x2003 | 0x2C0 => {
                // Write-1-to-clear status registers.
                let current = self.dpcd_u8(addr);
                self.dpcd.insert(addr, current & !value);
            }
            a if (DOWN_REQ_BASE..DOWN_REQ_BASE + WINDOW as u32).contains(&a) => {
                let offset = (a - DOWN_REQ_BASE) as usize;
                self.down_req[offset] = value;
                self.down_req_filled = self.down_req_filled.max(offset + 1);
            }
            _ => {
                self.dpcd.insert(addr, value);
                if addr == 0x1C2 {
                    // A complete allocate write latches the table-updated
                    // status bit.
                    self.payload_writes.push((
                        self.dpcd_u8(0x1C0),
                        self.dpcd_u8(0x1C1),
                        self.dpcd_u8(0x1C2),
                    ));
                    let status = self.dpcd_u8(0x2C0);
                    self.dpcd.insert(0x2C0, status | 0x01);
                }
            }
        }
    }

    fn training_status_byte(&self, addr: u32) -> u8 {
        let lanes = u32::from(self.dpcd_u8(0x101) & 0xF);
        let cr = self.cr_ok();
        let eq = cr && lanes <= u32::from(self.model.eq_max_lanes);
        match addr {
            0x202 | 0x203 => {
                let first_lane = (addr - 0x202) * 2;
                let mut byte = 0u8;
                for half in 0..2 {
                    let lane = first_lane + half;
                    if lane >= lanes {
                        continue;
                    }
                    let mut nibble = 0u8;
                    if cr {
                        nibble |= 0x1;
                    }
                    if eq {
                        nibble |= 0x6;
                    }
                    byte |= nibble << (4 * half);
                }
                byte
            }
            0x204 => u8::from(eq),
            0x205 => 0x01,
            0x206 | 0x207 => {
                let swing = self.model.required_swing & 0x3;
                swing | (swing << 4)
            }
            _ => 0,
        }
    }

    fn cr_ok(&self) -> bool {
        let bw = self.dpcd_u8(0x100);
        let lanes = self.dpcd_u8(0x101) & 0xF;
        if bw > self.model.trainable_rate || lanes > self.model.trainable_lanes {
            return false;
        }
        (0..u32::from(lanes)).all(|lane| {
            let set = self.dpcd_u8(0x103 + lane);
            set & 0x3 >= self.model.required_swing
        })
    }

    // Sideband handling.

    fn try_process_down_req(&mut self) {
        let filled = self.down_req_filled;
        let Ok((header, header_len)) = SidebandMsgHeader::decode(&self.down_req[..filled]) else {
            return;
        };
        let total = header_len + usize::from(header.body_length);
        if filled < total {
            return;
        }
        let chunk = self.down_req[header_len..total].to_vec();
        self.down_req_filled = 0;
        let Ok(payload) = strip_body_crc(&chunk) else {
            return;
        };
        let payload = payload.to_vec();
        self.handle_sideband(&header, &payload);
    }

    fn handle_sideband(&mut self, header: &SidebandMsgHeader, body: &[u8]) {
        let Some(root) = self.sideband.clone() else {
            return;
        };
        let branch = if header.broadcast {
            Some(&root)
        } else {
            navigate(&root, header.rad.hops())
        };
        let Some(branch) = branch else {
            return;
        };

        let reply = match body[0] & 0x7f {
            dptx_sideband::REQ_LINK_ADDRESS => link_address_reply(branch),
            dptx_sideband::REQ_ENUM_PATH_RESOURCES => {
                let port = body[1] >> 4;
                self.enum_path_reqs.push(port);
                SidebandReply::EnumPathResources(dptx_sideband::EnumPathResourcesReply {
                    port_number: port,
                    full_pbn: 2560,
                    available_pbn: 2560,
                })
            }
            dptx_sideband::REQ_ALLOCATE_PAYLOAD => {
                let port = body[1] >> 4;
                let vcpi = body[2] & 0x7f;
                let pbn = u16::from_be_bytes([body[3], body[4]]);
                self.allocate_payload_reqs.push((port, vcpi, pbn));
                SidebandReply::AllocatePayload(dptx_sideband::AllocatePayloadReply {
                    port_number: port,
                    vcpi,
                    allocated_pbn: pbn,
                })
            }
            dptx_sideband::REQ_CLEAR_PAYLOAD_ID_TABLE => {
                self.clear_payload_reqs += 1;
                SidebandReply::ClearPayloadIdTable
            }
            other => SidebandReply::Nak {
                request_type: other,
                nak: dptx_sideband::NakReply {
                    guid: branch.guid,
                    reason: 0x01,
                    nak_data: 0,
                },
            },
        };

        if self.bogus_first_reply {
            self.bogus_first_reply = false;
            // A stray reply to a request nobody made; the driver must
            // discard it and re-read.
            self.queue_reply_body(vec![0x02]);
        }
        self.queue_reply_body(encode_reply(&reply));
    }

    fn queue_reply_body(&mut self, body: Vec<u8>) {
        let chunk_count = body.chunks(REPLY_CHUNK).count();
        for (i, chunk) in body.chunks(REPLY_CHUNK).enumerate() {
            let mut header =
                SidebandMsgHeader::unicast(RelativeAddress::root(), (chunk.len() + 1) as u8, 0);
            header.start_of_transaction = i == 0;
            header.end_of_transaction = i == chunk_count - 1;
            let mut window = [0u8; WINDOW];
            let header_len = header.encode(&mut window).expect("reply header encode");
            window[header_len..header_len + chunk.len()].copy_from_slice(chunk);
            window[header_len + chunk.len()] = body_crc(chunk);
            self.down_rep_chunks.push_back(window);
        }
        if self.down_rep_ready_idle() {
            self.promote_down_rep();
        }
    }

    fn down_rep_ready_idle(&self) -> bool {
        let vector = if self.ready_in_esi { 0x2003 } else { 0x201 };
        self.dpcd_u8(vector) & 0x10 == 0
    }

    fn promote_down_rep(&mut self) {
        let Some(window) = self.down_rep_chunks.pop_front() else {
            return;
        };
        self.down_rep_window = window;
        let vector = if self.ready_in_esi { 0x2003 } else { 0x201 };
        let current = self.dpcd_u8(vector);
        self.dpcd.insert(vector, current | 0x10);
    }
}

fn navigate<'a>(root: &'a SimBranch, hops: &[u8]) -> Option<&'a SimBranch> {
    let mut branch = root;
    for &hop in hops {
        branch = branch.ports.iter().find_map(|port| match port {
            SimPort::Branch { port, branch } if *port == hop => Some(branch),
            _ => None,
        })?;
    }
    Some(branch)
}

fn link_address_reply(branch: &SimBranch) -> SidebandReply {
    let mut ports = vec![PortInfo {
        input_port: true,
        peer_device_type: PeerDeviceType::SourceOrSst,
        port_number: 0,
        message_capable: false,
        plugged: true,
        legacy_plugged: false,
        dpcd_revision: 0,
        peer_guid: [0; 16],
        num_sdp_streams: 0,
        num_sdp_stream_sinks: 0,
    }];
    for port in &branch.ports {
        ports.push(match port {
            SimPort::Sink { port, guid } => PortInfo {
                input_port: false,
                peer_device_type: PeerDeviceType::SstSink,
                port_number: *port,
                message_capable: false,
                plugged: true,
                legacy_plugged: false,
                dpcd_revision: 0x12,
                peer_guid: *guid,
                num_sdp_streams: 1,
                num_sdp_stream_sinks: 1,
            },
            SimPort::Branch { port, branch } => PortInfo {
                input_port: false,
                peer_device_type: PeerDeviceType::MstBranching,
                port_number: *port,
                message_capable: true,
                plugged: true,
                legacy_plugged: false,
                dpcd_revision: 0x12,
                peer_guid: branch.guid,
                num_sdp_streams: 0,
                num_sdp_stream_sinks: 0,
            },
        });
    }
    SidebandReply::LinkAddress(LinkAddressReply {
        guid: branch.guid,
        ports,
    })
}

/// The HAL handle handed to the session; shares state with the test body.
pub struct SimSink {
    pub state: Rc<RefCell<SimState>>,
}

impl SimSink {
    pub fn new() -> (SimSink, Rc<RefCell<SimState>>) {
        let state = Rc::new(RefCell::new(SimState::new()));
        (SimSink { state: Rc::clone(&state) }, state)
    }
}

impl DptxHal for SimSink {
    fn read_reg(&mut self, offset: u32) -> u32 {
        self.state.borrow_mut().read_reg(offset)
    }

    fn write_reg(&mut self, offset: u32, value: u32) {
        self.state.borrow_mut().write_reg(offset, value)
    }

    fn delay_us(&mut self, us: u32) {
        let mut state = self.state.borrow_mut();
        state.now_us += u64::from(us);
        if let (Some(latch), Some(at)) = (state.latch.as_ref(), state.unplug_at_us) {
            if state.now_us >= at {
                latch.set_plugged(false);
            }
        }
    }
}

/// SoC collaborator that records every rate reprogram.
pub struct SimSoc {
    pub calls: Rc<RefCell<Vec<LinkRate>>>,
}

impl SimSoc {
    pub fn new() -> (SimSoc, Rc<RefCell<Vec<LinkRate>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        (SimSoc { calls: Rc::clone(&calls) }, calls)
    }
}

impl SocOps for SimSoc {
    fn reprogram_for_rate(&mut self, rate: LinkRate) -> dptx::Result<()> {
        self.calls.borrow_mut().push(rate);
        Ok(())
    }
}

/// Builds a session over a fresh simulated sink and SoC recorder.
pub fn new_session(
    config: DptxConfig,
) -> (
    DptxSession<SimSink, SimSoc>,
    Rc<RefCell<SimState>>,
    Rc<RefCell<Vec<LinkRate>>>,
) {
    let (sink, state) = SimSink::new();
    let (soc, calls) = SimSoc::new();
    let session = DptxSession::new(sink, soc, config).expect("session config rejected");
    (session, state, calls)
}

/// Standard DPCD capability image: DPCD 1.4, HBR2, 4 lanes with enhanced
/// framing and TPS3, MST-capable when asked.
pub fn program_standard_caps(state: &mut SimState, mst: bool) {
    state.dpcd.insert(0x000, 0x14);
    state.dpcd.insert(0x001, 0x14); // HBR2
    state.dpcd.insert(0x002, 0x80 | 0x40 | 0x04);
    state.dpcd.insert(0x003, 0x01); // SSC, no TPS4
    state.dpcd.insert(0x00E, 0x00); // 400 us EQ interval
    state.dpcd.insert(0x021, u8::from(mst));
}

/// A 128-byte EDID block with valid header magic and checksum.
pub fn edid_block(extension_count: u8) -> Vec<u8> {
    let mut block = vec![0u8; 128];
    block[..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
    block[8] = 0x4C; // manufacturer id
    block[126] = extension_count;
    let sum: u8 = block.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    block[127] = 0u8.wrapping_sub(sum);
    block
}

/// A valid 128-byte CEA extension block.
pub fn edid_extension_block() -> Vec<u8> {
    let mut block = vec![0u8; 128];
    block[0] = 0x02; // CEA-861
    block[1] = 0x03;
    let sum: u8 = block.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    block[127] = 0u8.wrapping_sub(sum);
    block
}
