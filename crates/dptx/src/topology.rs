//! MST topology discovery and virtual-channel payload management.
//!
//! Sideband messages ride the AUX bus through the DPCD request/reply
//! windows: a request is written to the DOWN_REQ window, then the reply is
//! reassembled from the DOWN_REP window chunk by chunk, gated on the
//! DOWN_REP_MSG_RDY bit (visible in both the legacy IRQ vector and its ESI0
//! alias). Topology discovery walks LINK_ADDRESS replies into a bounded set
//! of stream-sink ports; payload management computes PBN/time-slot budgets
//! and keeps the local payload table, the sink's VC payload table, and the
//! branch devices' view (via ENUM_PATH_RESOURCES / ALLOCATE_PAYLOAD) in
//! agreement before the ACT handshake fires.

use tracing::{debug, warn};

use dptx_sideband::{
    parse_reply, strip_body_crc, PeerDeviceType, RelativeAddress, SidebandMsgHeader,
    SidebandReply, SidebandRequest,
};

use crate::dpcd::*;
use crate::hal::{DptxHal, SocOps};
use crate::link::{LaneCount, LinkRate};
use crate::regs::{mst_vcp_table, MST_CTRL_ACT_TRIGGER, MST_VCP_TABLE_REGS, REG_MST_CTRL};
use crate::session::DptxSession;
use crate::{Error, Result};

/// Hard cap of simultaneous input streams the controller supports.
pub const MAX_STREAMS: usize = 4;

/// Usable time slots per MTP; slot 0 carries the MTP header.
const MAX_TIME_SLOTS: u32 = 63;

const DOWN_REP_WINDOW: usize = 256;
const SIDEBAND_REPLY_POLL_TRIES: u32 = 300; // x 1 ms
const SIDEBAND_REPLY_RETRIES: u32 = 3;
const PAYLOAD_TABLE_POLL_TRIES: u32 = 500; // x 1 ms
const ACT_POLL_TRIES: u32 = 1000; // x 1 ms

/// Typed index into the stream arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamIndex(u8);

impl StreamIndex {
    pub fn new(index: u8) -> Option<StreamIndex> {
        (usize::from(index) < MAX_STREAMS).then_some(StreamIndex(index))
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// A discovered "stream sink" port: an output port of some branch device
/// with a plugged, non-concentrator sink behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSinkPort {
    /// Path to the branch device that owns the port.
    pub rad: RelativeAddress,
    pub port_number: u8,
    pub dpcd_revision: u8,
    pub peer_guid: dptx_sideband::Guid,
}

/// Per-stream virtual-channel allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadAllocation {
    pub vcpi: u8,
    pub pbn: u16,
    pub time_slot_start: u8,
    pub time_slot_count: u8,
}

/// What the video side wants to push down one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub pixel_clock_khz: u32,
    pub bytes_per_pixel: u32,
}

/// Payload bandwidth number for one stream, in the scaled-integer form the
/// original allocation tables were built around: truncate the pixel clock
/// to whole MHz, take 64/54ths of the byte rate, then apply the 0.6%
/// margin with round-to-nearest on the tenths digit.
pub fn payload_bandwidth_number(pixel_clock_khz: u32, bytes_per_pixel: u32) -> u32 {
    let mhz = pixel_clock_khz / 1000;
    let base = mhz * bytes_per_pixel * 64 / 54;
    let scaled = base * 1006;
    let mut pbn = scaled / 1000;
    if scaled / 100 - pbn * 10 >= 5 {
        pbn += 1;
    }
    pbn
}

/// Time slots a stream of `pbn` needs on a link at (rate, lanes).
pub fn time_slot_count(pbn: u32, rate: LinkRate, lanes: LaneCount) -> u32 {
    let per_slot = rate.slot_factor() * u32::from(lanes.count());
    pbn.div_ceil(per_slot)
}

/// Computes the strictly sequential slot layout for `streams`, rejecting
/// the set before any hardware write if it overruns the 63-slot budget.
pub(crate) fn compute_allocations(
    streams: &[StreamConfig],
    rate: LinkRate,
    lanes: LaneCount,
) -> Result<[Option<PayloadAllocation>; MAX_STREAMS]> {
    if streams.is_empty() || streams.len() > MAX_STREAMS {
        return Err(Error::InvalidParameter("stream count must be 1..=4"));
    }
    let mut allocations = [None; MAX_STREAMS];
    let mut next_slot = 1u32;
    for (i, stream) in streams.iter().enumerate() {
        let pbn = payload_bandwidth_number(stream.pixel_clock_khz, stream.bytes_per_pixel);
        if pbn == 0 || pbn > u32::from(u16::MAX) {
            return Err(Error::InvalidParameter("stream PBN out of range"));
        }
        let slots = time_slot_count(pbn, rate, lanes);
        allocations[i] = Some(PayloadAllocation {
            vcpi: (i + 1) as u8,
            pbn: pbn as u16,
            time_slot_start: next_slot as u8,
            time_slot_count: slots as u8,
        });
        next_slot += slots;
    }
    if next_slot - 1 > MAX_TIME_SLOTS {
        return Err(Error::InvalidParameter("time-slot budget exceeded"));
    }
    Ok(allocations)
}

impl<H: DptxHal, S: SocOps> DptxSession<H, S> {
    /// Walks the branch tree with LINK_ADDRESS sweeps, filling the
    /// stream-sink arena. Bounded by the configured sub-branch depth and
    /// the 4-stream cap.
    pub(crate) fn discover_topology(&mut self) -> Result<()> {
        self.sinks = [None; MAX_STREAMS];
        self.probe_branch(RelativeAddress::root(), 0)?;
        let found = self.sinks.iter().flatten().count();
        debug!(found, "topology discovery complete");
        if found == 0 {
            return Err(Error::TopologyIncomplete("no stream sinks discovered"));
        }
        Ok(())
    }

    fn probe_branch(&mut self, rad: RelativeAddress, depth: u8) -> Result<()> {
        let reply = self.send_sideband_request(&rad, &SidebandRequest::LinkAddress)?;
        let la = match reply {
            SidebandReply::LinkAddress(la) => la,
            SidebandReply::Nak { nak, .. } => {
                warn!(reason = nak.reason, "LINK_ADDRESS NAKed");
                return Err(Error::TopologyIncomplete("LINK_ADDRESS refused by branch"));
            }
            _ => return Err(Error::TopologyIncomplete("unexpected LINK_ADDRESS reply body")),
        };

        for port in &la.ports {
            if self.sinks.iter().flatten().count() >= MAX_STREAMS {
                break;
            }
            if port.input_port || !port.plugged {
                continue;
            }
            match port.peer_device_type {
                PeerDeviceType::SstSink if !port.message_capable => {
                    let sink = StreamSinkPort {
                        rad,
                        port_number: port.port_number,
                        dpcd_revision: port.dpcd_revision,
                        peer_guid: port.peer_guid,
                    };
                    if let Some(slot) = self.sinks.iter_mut().find(|s| s.is_none()) {
                        debug!(port = port.port_number, hops = rad.hop_count(), "stream sink");
                        *slot = Some(sink);
                    }
                }
                PeerDeviceType::MstBranching if port.message_capable => {
                    if depth >= self.config.max_branch_depth {
                        warn!(port = port.port_number, "sub-branch beyond depth limit, skipping");
                        continue;
                    }
                    let Some(child) = rad.child(port.port_number) else {
                        continue;
                    };
                    // One unreachable sub-branch should not cost us the
                    // sinks already found elsewhere.
                    if let Err(err) = self.probe_branch(child, depth + 1) {
                        warn!(port = port.port_number, %err, "sub-branch sweep failed");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Programs the whole payload path for `streams`: local slot table,
    /// sink VC payload table, branch allocation via sideband, then the ACT
    /// handshake.
    pub fn configure_topology(&mut self, streams: &[StreamConfig]) -> Result<()> {
        if !self.is_trained() {
            return Err(Error::InvalidParameter("link is not trained"));
        }
        if !self.mst_active {
            // SST-equivalent path: one stream straight to the sink, no
            // payload table and no sideband.
            if streams.len() != 1 {
                return Err(Error::InvalidParameter("non-MST link carries exactly one stream"));
            }
            self.payloads = [None; MAX_STREAMS];
            return Ok(());
        }

        let allocations = compute_allocations(streams, self.link.rate, self.link.lanes)?;
        self.clear_payload_tables()?;
        for (index, alloc) in allocations.iter().enumerate() {
            let Some(alloc) = alloc else { break };
            let sink = self.sinks[index]
                .ok_or(Error::InvalidParameter("stream has no discovered sink port"))?;
            self.program_payload(alloc)?;
            self.allocate_branch_payload(&sink, alloc)?;
        }
        self.trigger_act()?;
        self.payloads = allocations;
        debug!("payload allocation complete");
        Ok(())
    }

    /// Zeroes the local slot table and the sink's VC payload table (the
    /// all-streams wildcard write), then broadcasts CLEAR_PAYLOAD_ID_TABLE
    /// so branch devices drop stale allocations too.
    fn clear_payload_tables(&mut self) -> Result<()> {
        for word in 0..MST_VCP_TABLE_REGS {
            self.hal.write_reg(mst_vcp_table(word), 0);
        }
        self.dpcd_write_range(DPCD_PAYLOAD_ALLOCATE_SET, &[0x00, 0x00, 0x3F])?;
        self.wait_payload_table_updated()?;
        match self.send_sideband_request(
            &RelativeAddress::root(),
            &SidebandRequest::ClearPayloadIdTable,
        )? {
            SidebandReply::ClearPayloadIdTable => Ok(()),
            SidebandReply::Nak { nak, .. } => {
                warn!(reason = nak.reason, "CLEAR_PAYLOAD_ID_TABLE NAKed");
                Err(Error::TopologyIncomplete("branch refused payload table clear"))
            }
            _ => Err(Error::TopologyIncomplete("unexpected CLEAR_PAYLOAD_ID_TABLE reply")),
        }
    }

    /// Writes one stream's slots into the local table (4 bits of VCPI per
    /// slot) and the sink's table via the DPCD allocate registers.
    fn program_payload(&mut self, alloc: &PayloadAllocation) -> Result<()> {
        let start = usize::from(alloc.time_slot_start);
        let end = start + usize::from(alloc.time_slot_count);
        for slot in start..end {
            let reg = mst_vcp_table(slot / 8);
            let shift = 4 * (slot % 8) as u32;
            let word = self.hal.read_reg(reg);
            let word = (word & !(0xF << shift)) | (u32::from(alloc.vcpi) << shift);
            self.hal.write_reg(reg, word);
        }
        self.dpcd_write_range(
            DPCD_PAYLOAD_ALLOCATE_SET,
            &[alloc.vcpi, alloc.time_slot_start, alloc.time_slot_count],
        )?;
        self.wait_payload_table_updated()
    }

    /// Tells the branch path about the allocation: ENUM_PATH_RESOURCES for
    /// the advertised budget, then ALLOCATE_PAYLOAD.
    fn allocate_branch_payload(
        &mut self,
        sink: &StreamSinkPort,
        alloc: &PayloadAllocation,
    ) -> Result<()> {
        let enum_req = SidebandRequest::EnumPathResources {
            port_number: sink.port_number,
        };
        match self.send_sideband_request(&sink.rad, &enum_req)? {
            SidebandReply::EnumPathResources(resources) => {
                if resources.available_pbn != 0 && resources.available_pbn < alloc.pbn {
                    warn!(
                        available = resources.available_pbn,
                        requested = alloc.pbn,
                        "branch path reports less PBN than requested"
                    );
                }
            }
            SidebandReply::Nak { nak, .. } => {
                warn!(reason = nak.reason, "ENUM_PATH_RESOURCES NAKed");
            }
            _ => return Err(Error::TopologyIncomplete("unexpected ENUM_PATH_RESOURCES reply")),
        }

        let alloc_req = SidebandRequest::AllocatePayload {
            port_number: sink.port_number,
            vcpi: alloc.vcpi,
            pbn: alloc.pbn,
        };
        match self.send_sideband_request(&sink.rad, &alloc_req)? {
            SidebandReply::AllocatePayload(_) => Ok(()),
            SidebandReply::Nak { nak, .. } => {
                warn!(reason = nak.reason, "ALLOCATE_PAYLOAD NAKed");
                Err(Error::TopologyIncomplete("branch refused payload allocation"))
            }
            _ => Err(Error::TopologyIncomplete("unexpected ALLOCATE_PAYLOAD reply")),
        }
    }

    fn wait_payload_table_updated(&mut self) -> Result<()> {
        for _ in 0..PAYLOAD_TABLE_POLL_TRIES {
            self.check_plugged()?;
            let status = self.dpcd_read_u8(DPCD_PAYLOAD_TABLE_UPDATE_STATUS)?;
            if status & PAYLOAD_TABLE_UPDATED != 0 {
                // Acknowledge by writing the bit back.
                self.dpcd_write_u8(DPCD_PAYLOAD_TABLE_UPDATE_STATUS, PAYLOAD_TABLE_UPDATED)?;
                return Ok(());
            }
            self.hal.delay_ms(1);
        }
        Err(Error::HardwareTimeout("VC payload table update never latched"))
    }

    /// Fires the allocation change trigger and waits for the self-clearing
    /// bit. A timeout fails this configuration attempt but not the session;
    /// the caller may retry `configure_topology`.
    fn trigger_act(&mut self) -> Result<()> {
        let ctrl = self.hal.read_reg(REG_MST_CTRL);
        self.hal.write_reg(REG_MST_CTRL, ctrl | MST_CTRL_ACT_TRIGGER);
        for _ in 0..ACT_POLL_TRIES {
            self.check_plugged()?;
            if self.hal.read_reg(REG_MST_CTRL) & MST_CTRL_ACT_TRIGGER == 0 {
                return Ok(());
            }
            self.hal.delay_ms(1);
        }
        Err(Error::ActTimeout)
    }

    /// One sideband request/reply exchange with the branch at `rad`.
    pub(crate) fn send_sideband_request(
        &mut self,
        rad: &RelativeAddress,
        req: &SidebandRequest,
    ) -> Result<SidebandReply> {
        let body = req.encode_body();
        let header = if req.is_broadcast() {
            SidebandMsgHeader::broadcast(body.len() as u8, self.seqno)
        } else {
            SidebandMsgHeader::unicast(*rad, body.len() as u8, self.seqno)
        };
        self.seqno ^= 1;

        let mut msg = [0u8; dptx_sideband::MAX_HEADER_LEN];
        let header_len = header
            .encode(&mut msg)
            .map_err(|_| Error::InvalidParameter("sideband request does not fit one chunk"))?;
        let mut wire = Vec::with_capacity(header_len + body.len());
        wire.extend_from_slice(&msg[..header_len]);
        wire.extend_from_slice(&body);
        self.dpcd_write_range(DPCD_DOWN_REQ_BASE, &wire)?;

        let reply_body = self.read_down_reply(req.request_type())?;
        Ok(parse_reply(&reply_body)?)
    }

    /// Reassembles one downstream reply from the DOWN_REP window,
    /// re-reading the whole message when the reply answers a different
    /// request than the one outstanding.
    fn read_down_reply(&mut self, expected_type: u8) -> Result<Vec<u8>> {
        'attempt: for attempt in 0..SIDEBAND_REPLY_RETRIES {
            let mut body = Vec::new();
            let mut first = true;
            loop {
                self.wait_down_rep_ready()?;
                let mut window = [0u8; DOWN_REP_WINDOW];
                self.dpcd_read_range(DPCD_DOWN_REP_BASE, &mut window)?;
                let (header, header_len) = SidebandMsgHeader::decode(&window)?;
                let chunk_len = usize::from(header.body_length);
                if header_len + chunk_len > window.len() {
                    return Err(Error::TopologyIncomplete("reply body overruns the window"));
                }
                let payload = strip_body_crc(&window[header_len..header_len + chunk_len])?;
                if first && !header.start_of_transaction {
                    warn!("stale sideband chunk without SOMT, restarting read");
                    continue 'attempt;
                }
                first = false;
                body.extend_from_slice(payload);
                if header.end_of_transaction {
                    break;
                }
            }
            if body.first().map(|b| b & 0x7f) == Some(expected_type) {
                return Ok(body);
            }
            warn!(attempt, "sideband reply answers a different request, re-reading");
        }
        Err(Error::TopologyIncomplete("no reply matching the outstanding request"))
    }

    /// Polls DOWN_REP_MSG_RDY in the legacy IRQ vector and its ESI0 alias,
    /// clearing the bit (write-back) before the chunk is read.
    fn wait_down_rep_ready(&mut self) -> Result<()> {
        for _ in 0..SIDEBAND_REPLY_POLL_TRIES {
            self.check_plugged()?;
            let legacy = self.dpcd_read_u8(DPCD_DEVICE_SERVICE_IRQ_VECTOR)?;
            if legacy & IRQ_VECTOR_DOWN_REP_MSG_RDY != 0 {
                self.dpcd_write_u8(DPCD_DEVICE_SERVICE_IRQ_VECTOR, IRQ_VECTOR_DOWN_REP_MSG_RDY)?;
                return Ok(());
            }
            let esi = self.dpcd_read_u8(DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0)?;
            if esi & IRQ_VECTOR_DOWN_REP_MSG_RDY != 0 {
                self.dpcd_write_u8(
                    DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0,
                    IRQ_VECTOR_DOWN_REP_MSG_RDY,
                )?;
                return Ok(());
            }
            self.hal.delay_ms(1);
        }
        Err(Error::BusTimeout)
    }
}
