//! Per-worker dump tasks.
//!
//! An operator command creates one task object; each worker runs `execute`
//! against its own cache. The full dump writes one text line or one binary
//! descriptor per flow to `<base><instance>[.bin]`, yielding after `count`
//! flows per class so packet processing is not starved; the summary variant
//! accumulates per-class and per-state histograms instead. Resumption rides
//! on the table's walk cursors plus the flow's dump-generation marker.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use log::warn;

use crate::command::WorkerCommand;
use crate::common::enums::{FlowState, PktType, FLOW_STATE_MAX, PKT_TYPE_MAX};
use crate::common::flow::FlowFlags;
use crate::flow_cache::{FlowCache, ALLOWLIST_LRU_INDEX};
use crate::utils::net::MappedAddr;
use crate::utils::watchdog;

use super::descriptor::{FlowDescriptor, DESCRIPTOR_BYTES};
use super::filter::DumpFilter;
use super::{TextSink, DUMP_CODE};

// kick watchdog once for every 8 flows summarized
const WDT_MASK: u32 = 7;

/// Queue visitation order of a dump: the four transport classes, then the
/// allowlist queue.
pub const DUMP_LRUS: [u8; 5] = [
    PktType::Icmp as u8,
    PktType::Ip as u8,
    PktType::Tcp as u8,
    PktType::Udp as u8,
    ALLOWLIST_LRU_INDEX,
];

pub const DEFAULT_DUMP_COUNT: usize = 100;

#[derive(Default)]
struct DumpControl {
    started: bool,
    stream: Option<BufWriter<File>>,
    has_more_flows: bool,
}

/// The flow's endpoints as the operator expects them: addresses from the
/// client/server perspective, ports from the key with the initiator first.
fn filter_view(cache: &FlowCache, id: u32) -> (MappedAddr, MappedAddr, u16, u16) {
    let flow = cache.flow(id);
    let key = cache.key(id);
    let (src_ip, dst_ip) = if flow.flags.contains(FlowFlags::CLIENT_INITIATED) {
        (flow.client_ip, flow.server_ip)
    } else {
        (flow.server_ip, flow.client_ip)
    };
    let (src_port, dst_port) = if flow.flags.contains(FlowFlags::KEY_IS_REVERSED) {
        (key.port_h, key.port_l)
    } else {
        (key.port_l, key.port_h)
    };
    (src_ip, dst_ip, src_port, dst_port)
}

pub struct DumpFlows {
    filter: DumpFilter,
    binary_output: bool,
    count: usize,
    base_file_name: PathBuf,
    dump_code: u8,
    lrus: Vec<u8>,
    controls: Vec<DumpControl>,
}

impl DumpFlows {
    pub fn new(
        filter: DumpFilter,
        binary_output: bool,
        count: usize,
        base_file_name: impl Into<PathBuf>,
        instances: usize,
    ) -> Self {
        let lrus = match filter.spec().proto {
            Some(proto) => vec![proto.lru_index()],
            None => DUMP_LRUS.to_vec(),
        };
        let dump_code = DUMP_CODE.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut controls = Vec::with_capacity(instances);
        for _ in 0..instances {
            controls.push(DumpControl::default());
        }
        DumpFlows {
            filter,
            binary_output,
            count,
            base_file_name: base_file_name.into(),
            dump_code,
            lrus,
            controls,
        }
    }

    fn open_file(&self, instance_number: u32) -> io::Result<BufWriter<File>> {
        let mut name = self.base_file_name.as_os_str().to_os_string();
        name.push(instance_number.to_string());
        if self.binary_output {
            name.push(".bin");
        }
        Ok(BufWriter::new(File::create(name)?))
    }

    fn dump_slice(
        &mut self,
        cache: &mut FlowCache,
        instance_id: usize,
        idx: usize,
        now: i64,
    ) -> io::Result<()> {
        let lru_idx = self.lrus[idx];
        let instance_number = cache.instance_number();
        let mut visited = 0usize;

        while let Some(id) = cache.walk_current(lru_idx) {
            if visited >= self.count {
                break;
            }

            if cache.flow(id).dump_code != self.dump_code {
                let descriptor =
                    FlowDescriptor::from_flow(cache.key(id), cache.flow(id), instance_number, now);
                let (src_ip, dst_ip, src_port, dst_port) = filter_view(cache, id);
                let pkt_type = cache.key(id).pkt_type;
                let matched = self.filter.is_match_all()
                    || self
                        .filter
                        .matches(&src_ip, &dst_ip, src_port, dst_port, pkt_type);

                let control = &mut self.controls[instance_id];
                let Some(stream) = control.stream.as_mut() else {
                    return Ok(());
                };
                if self.binary_output {
                    let mut buf = Vec::with_capacity(DESCRIPTOR_BYTES);
                    descriptor.encode(&mut buf);
                    stream.write_all(&buf)?;
                } else if matched {
                    descriptor.print(stream)?;
                }

                cache.flow_mut(id).dump_code = self.dump_code;
                visited += 1;
            }

            cache.walk_next(lru_idx);
        }

        if cache.walk_current(lru_idx).is_some() {
            self.controls[instance_id].has_more_flows = true;
        }
        Ok(())
    }
}

impl WorkerCommand for DumpFlows {
    /// Returns true when this worker's dump is finished; a false return asks
    /// to be re-entered after packets get a turn.
    fn execute(&mut self, cache: &mut FlowCache, instance_id: usize, now: i64) -> bool {
        // on the first call, open the output and pin the walk cursors
        if !self.controls[instance_id].started {
            let stream = match self.open_file(cache.instance_number()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        "dump flows failed to open {}{}: {}",
                        self.base_file_name.display(),
                        cache.instance_number(),
                        e
                    );
                    return true;
                }
            };
            let control = &mut self.controls[instance_id];
            control.stream = Some(stream);
            control.started = true;
            for &lru_idx in &self.lrus {
                cache.walk_first(lru_idx);
            }
        }

        self.controls[instance_id].has_more_flows = false;
        for idx in 0..self.lrus.len() {
            if let Err(e) = self.dump_slice(cache, instance_id, idx, now) {
                warn!(
                    "dump flows write failed for instance {}: {}",
                    cache.instance_number(),
                    e
                );
                self.controls[instance_id].stream = None;
                return true;
            }
        }

        if !self.controls[instance_id].has_more_flows {
            if let Some(mut stream) = self.controls[instance_id].stream.take() {
                if let Err(e) = stream.flush() {
                    warn!(
                        "dump flows close failed for instance {}: {}",
                        cache.instance_number(),
                        e
                    );
                }
            }
        }

        !self.controls[instance_id].has_more_flows
    }

    fn stringify(&self) -> &'static str {
        "DumpFlows"
    }
}

#[derive(Default, Clone)]
pub struct FlowsSummary {
    pub type_summary: [u32; PKT_TYPE_MAX],
    pub state_summary: [u32; FLOW_STATE_MAX],
}

#[derive(Default)]
struct SummaryControl {
    started: bool,
}

pub struct DumpFlowsSummary {
    filter: DumpFilter,
    lrus: Vec<u8>,
    controls: Vec<SummaryControl>,
    summaries: Vec<FlowsSummary>,
}

impl DumpFlowsSummary {
    pub fn new(filter: DumpFilter, instances: usize) -> Self {
        let lrus = match filter.spec().proto {
            Some(proto) => vec![proto.lru_index()],
            None => DUMP_LRUS.to_vec(),
        };
        let mut controls = Vec::with_capacity(instances);
        for _ in 0..instances {
            controls.push(SummaryControl::default());
        }
        DumpFlowsSummary {
            filter,
            lrus,
            controls,
            summaries: vec![FlowsSummary::default(); instances],
        }
    }

    fn summarize_slice(&mut self, cache: &mut FlowCache, instance_id: usize, idx: usize) {
        let lru_idx = self.lrus[idx];
        let mut processed: u32 = 0;

        while let Some(id) = cache.walk_current(lru_idx) {
            let (src_ip, dst_ip, src_port, dst_port) = filter_view(cache, id);
            let pkt_type = cache.key(id).pkt_type;

            if self.filter.is_match_all()
                || self
                    .filter
                    .matches(&src_ip, &dst_ip, src_port, dst_port, pkt_type)
            {
                let summary = &mut self.summaries[instance_id];
                summary.type_summary[pkt_type as usize] += 1;
                summary.state_summary[cache.flow(id).flow_state as usize] += 1;
            }

            cache.walk_next(lru_idx);

            processed += 1;
            if (processed & WDT_MASK) == 0 {
                watchdog::kick();
            }
        }
    }

    /// Reduce all worker histograms into the operator report.
    pub fn report(&self) -> String {
        let mut type_summary = [0u32; PKT_TYPE_MAX];
        let mut state_summary = [0u32; FLOW_STATE_MAX];
        let mut total: u32 = 0;

        for summary in &self.summaries {
            for (i, count) in summary.type_summary.iter().enumerate() {
                type_summary[i] += count;
                total += count;
            }
            for (i, count) in summary.state_summary.iter().enumerate() {
                state_summary[i] += count;
            }
        }

        let mut out = format!("Total: {}\n", total);
        for (i, count) in type_summary.iter().enumerate() {
            match PktType::try_from(i as u8) {
                Ok(PktType::Ip) => out.push_str(&format!("IP: {}\n", count)),
                Ok(PktType::Icmp) => out.push_str(&format!("ICMP: {}\n", count)),
                Ok(PktType::Tcp) => out.push_str(&format!("TCP: {}\n", count)),
                Ok(PktType::Udp) => out.push_str(&format!("UDP: {}\n", count)),
                _ => {}
            }
        }

        let mut pending: u32 = 0;
        for (i, count) in state_summary.iter().enumerate() {
            match FlowState::try_from(i as u8) {
                Ok(FlowState::Block) => out.push_str(&format!("Blocked: {}\n", count)),
                Ok(FlowState::Allow) => out.push_str(&format!("Allowed: {}\n", count)),
                _ => pending += count,
            }
        }
        out.push_str(&format!("Pending: {}\n", pending));
        out
    }

    /// Write the report through the dump writer capability.
    pub fn write_report<W: TextSink>(&self, out: &mut W) -> io::Result<()> {
        out.write_str(&self.report())
    }
}

impl WorkerCommand for DumpFlowsSummary {
    fn execute(&mut self, cache: &mut FlowCache, instance_id: usize, _now: i64) -> bool {
        if !self.controls[instance_id].started {
            self.controls[instance_id].started = true;
            for &lru_idx in &self.lrus {
                cache.walk_first(lru_idx);
            }
        }

        for idx in 0..self.lrus.len() {
            self.summarize_slice(cache, instance_id, idx);
        }

        true
    }

    fn stringify(&self) -> &'static str {
        "DumpFlowsSummary"
    }
}
